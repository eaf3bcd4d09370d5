//! node:crypto - hashing and random bytes.
//!
//! Provides:
//! - `createHash(algorithm)` - incremental hash (md5, sha1, sha256, sha384, sha512)
//! - `randomBytes(size[, callback])` - cryptographically secure random bytes

use crate::context::NodeContext;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use marten_runtime::{ArgParser, Guest, GuestError, GuestResult, GuestValue, RuntimeError, ValueKind};
use md5::{Digest as Md5Digest, Md5};
use ring::digest::{self, Context as DigestContext};
use sha1::Sha1;
use std::cell::RefCell;
use std::fmt;
use std::io;
use std::rc::Rc;
use thiserror::Error;

/// Largest size accepted by `randomBytes`.
const MAX_RANDOM_BYTES: f64 = 2_147_483_647.0;

/// Errors that can occur in crypto operations.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Digest already called")]
    AlreadyFinalized,

    #[error("Invalid size: {0}")]
    InvalidSize(String),

    #[error("Random generation failed: {0}")]
    RandomError(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),
}

impl CryptoError {
    /// Node-style error code.
    pub fn code(&self) -> &'static str {
        match self {
            CryptoError::UnsupportedAlgorithm(_) => "ERR_CRYPTO_INVALID_DIGEST",
            CryptoError::AlreadyFinalized => "ERR_CRYPTO_HASH_FINALIZED",
            CryptoError::InvalidSize(_) => "ERR_OUT_OF_RANGE",
            CryptoError::RandomError(_) => "ERR_CRYPTO_OPERATION_FAILED",
            CryptoError::EncodingError(_) => "ERR_INVALID_ARG_VALUE",
        }
    }
}

impl From<CryptoError> for RuntimeError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::UnsupportedAlgorithm(name) => {
                RuntimeError::type_error("hash algorithm (md5, sha1, sha256, sha384, sha512)", name)
            }
            CryptoError::InvalidSize(size) => RuntimeError::type_error("size >= 0 and <= 2147483647", size),
            CryptoError::EncodingError(name) => RuntimeError::type_error("encoding (utf8, hex, base64)", name),
            other => RuntimeError::Io(io::Error::other(other.to_string())),
        }
    }
}

/// Guest error value for `err`, carrying the crypto-specific code.
fn crypto_error<G: Guest>(guest: &G, err: CryptoError) -> GuestError<G::Value> {
    let code = err.code();
    let value = guest.runtime_error(&err.into());
    guest.set_or_log(&value, "code", guest.string(code));
    GuestError::Thrown(value)
}

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Parse algorithm name from string.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" | "sha-1" => Ok(HashAlgorithm::Sha1),
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            "sha384" | "sha-384" => Ok(HashAlgorithm::Sha384),
            "sha512" | "sha-512" => Ok(HashAlgorithm::Sha512),
            _ => Err(CryptoError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Md5 => write!(f, "md5"),
            HashAlgorithm::Sha1 => write!(f, "sha1"),
            HashAlgorithm::Sha256 => write!(f, "sha256"),
            HashAlgorithm::Sha384 => write!(f, "sha384"),
            HashAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

enum HashContext {
    Md5(Md5),
    Sha1(Sha1),
    Ring(DigestContext),
}

/// A hash object for incremental hashing.
pub struct Hash {
    context: HashContext,
    algorithm: HashAlgorithm,
}

impl Hash {
    /// Create a new hash with the given algorithm.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let context = match algorithm {
            HashAlgorithm::Md5 => HashContext::Md5(Md5::new()),
            HashAlgorithm::Sha1 => HashContext::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => HashContext::Ring(DigestContext::new(&digest::SHA256)),
            HashAlgorithm::Sha384 => HashContext::Ring(DigestContext::new(&digest::SHA384)),
            HashAlgorithm::Sha512 => HashContext::Ring(DigestContext::new(&digest::SHA512)),
        };
        Self { context, algorithm }
    }

    /// Update the hash with data.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.context {
            HashContext::Md5(ctx) => ctx.update(data),
            HashContext::Sha1(ctx) => ctx.update(data),
            HashContext::Ring(ctx) => ctx.update(data),
        }
    }

    /// Finalize and return the digest.
    pub fn digest(self) -> Vec<u8> {
        match self.context {
            HashContext::Md5(ctx) => ctx.finalize().to_vec(),
            HashContext::Sha1(ctx) => ctx.finalize().to_vec(),
            HashContext::Ring(ctx) => ctx.finish().as_ref().to_vec(),
        }
    }

    /// Get the algorithm name.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

/// Decode a string argument of `update()`.
fn decode_input(data: &str, encoding: &str) -> Result<Vec<u8>, CryptoError> {
    match encoding.to_lowercase().as_str() {
        "utf8" | "utf-8" => Ok(data.as_bytes().to_vec()),
        "hex" => hex::decode(data).map_err(|e| CryptoError::EncodingError(e.to_string())),
        "base64" => STANDARD
            .decode(data)
            .map_err(|e| CryptoError::EncodingError(e.to_string())),
        "latin1" | "binary" => Ok(data.chars().map(|c| c as u32 as u8).collect()),
        other => Err(CryptoError::EncodingError(other.to_string())),
    }
}

/// Text form of a digest.
pub fn encode_digest(digest: &[u8], encoding: &str) -> Result<String, CryptoError> {
    match encoding.to_lowercase().as_str() {
        "hex" => Ok(hex::encode(digest)),
        "base64" => Ok(STANDARD.encode(digest)),
        other => Err(CryptoError::EncodingError(other.to_string())),
    }
}

/// Generate `size` cryptographically secure random bytes.
pub fn random_bytes(size: usize) -> Result<Vec<u8>, CryptoError> {
    let mut buf = vec![0u8; size];
    getrandom::fill(&mut buf).map_err(|e| CryptoError::RandomError(e.to_string()))?;
    Ok(buf)
}

fn random_size(value: f64) -> Result<usize, CryptoError> {
    if value.fract() != 0.0 || !(0.0..=MAX_RANDOM_BYTES).contains(&value) {
        return Err(CryptoError::InvalidSize(value.to_string()));
    }
    Ok(value as usize)
}

/// The guest `Hash` object returned by `createHash`.
fn hash_object<G: Guest>(guest: &G, algorithm: HashAlgorithm) -> GuestResult<G::Value, G::Value> {
    let state = Rc::new(RefCell::new(Some(Hash::new(algorithm))));
    let object = guest.object();

    let hash = state.clone();
    guest.set_function(&object, "update", move |guest, this, args| {
        let mut parser = ArgParser::new(args);
        let data = match parser.next_any(&[ValueKind::String, ValueKind::Bytes]) {
            Some(value) if value.kind() == ValueKind::Bytes => {
                guest.as_bytes(value).map(|b| b.to_vec()).unwrap_or_default()
            }
            Some(value) => {
                let text = guest.as_string(value).unwrap_or_default();
                let encoding = parser
                    .next(ValueKind::String)
                    .and_then(|e| guest.as_string(e))
                    .unwrap_or_else(|| "utf8".to_string());
                decode_input(&text, &encoding).map_err(|e| crypto_error(guest, e))?
            }
            None => {
                let actual = args.first().map_or("undefined", |v| v.kind().name());
                return Err(RuntimeError::type_error("data string or Buffer", actual).into());
            }
        };
        match hash.borrow_mut().as_mut() {
            Some(hash) => hash.update(&data),
            None => return Err(crypto_error(guest, CryptoError::AlreadyFinalized)),
        }
        Ok(this.clone())
    })?;

    guest.set_function(&object, "digest", move |guest, _this, args| {
        let encoding = ArgParser::new(args)
            .next(ValueKind::String)
            .and_then(|e| guest.as_string(e));
        let hash = state
            .borrow_mut()
            .take()
            .ok_or_else(|| crypto_error(guest, CryptoError::AlreadyFinalized))?;
        tracing::trace!("{} digest", hash.algorithm());
        let digest = hash.digest();
        match encoding {
            Some(encoding) => {
                let text = encode_digest(&digest, &encoding).map_err(|e| crypto_error(guest, e))?;
                Ok(guest.string(&text))
            }
            None => Ok(guest.bytes(Bytes::from(digest))),
        }
    })?;

    Ok(object)
}

/// Exports of `require('crypto')`.
pub fn module<G: Guest>(ctx: &Rc<NodeContext<G>>, guest: &G) -> GuestResult<G::Value, G::Value> {
    let exports = guest.object();

    guest.set_function(&exports, "createHash", |guest, _this, args| {
        let name = ArgParser::new(args)
            .next(ValueKind::String)
            .and_then(|v| guest.as_string(v))
            .ok_or_else(|| {
                let actual = args.first().map_or("undefined", |v| v.kind().name());
                RuntimeError::type_error("algorithm string", actual)
            })?;
        let algorithm = HashAlgorithm::parse(&name).map_err(|e| crypto_error(guest, e))?;
        hash_object(guest, algorithm)
    })?;

    let context = ctx.clone();
    guest.set_function(&exports, "randomBytes", move |guest, _this, args| {
        let mut parser = ArgParser::new(args);
        let size = parser
            .next(ValueKind::Number)
            .and_then(|v| guest.as_number(v))
            .ok_or_else(|| {
                let actual = args.first().map_or("undefined", |v| v.kind().name());
                RuntimeError::type_error("size number", actual)
            })?;
        let size = random_size(size).map_err(|e| crypto_error(guest, e))?;
        let result = random_bytes(size);

        let Some(callback) = parser.next_function().cloned() else {
            let data = result.map_err(|e| crypto_error(guest, e))?;
            return Ok(guest.bytes(Bytes::from(data)));
        };
        let ctx = context.clone();
        context.post(move |guest| {
            let args = match result {
                Ok(data) => vec![guest.null(), guest.bytes(Bytes::from(data))],
                Err(err) => vec![guest.throwable(crypto_error(guest, err))],
            };
            ctx.invoke(guest, &callback, &args);
        });
        Ok(guest.undefined())
    })?;

    Ok(exports)
}
