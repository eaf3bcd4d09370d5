//! Option-object coercion shared by the modules.

use marten_runtime::{Guest, GuestResult, GuestValue, RuntimeError, RuntimeResult};
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;

/// Deserialize a guest options object into `T`. `undefined` yields the default.
pub fn parse<G, T>(guest: &G, value: &G::Value, what: &str) -> GuestResult<T, G::Value>
where
    G: Guest,
    T: DeserializeOwned + Default,
{
    let Some(json) = guest.to_json(value) else {
        return Ok(T::default());
    };
    if json.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(json).map_err(|e| RuntimeError::type_error(format!("{what} options"), e.to_string()).into())
}

/// Validate a port given as a number.
pub fn port_number(value: f64) -> RuntimeResult<u16> {
    if value.fract() != 0.0 || !(0.0..65536.0).contains(&value) {
        return Err(RuntimeError::type_error("port >= 0 and < 65536", format!("{value}")));
    }
    Ok(value as u16)
}

/// Port read from a guest argument: a number or a numeric string.
pub fn port_arg<G: Guest>(guest: &G, value: &G::Value) -> RuntimeResult<u16> {
    let number = guest
        .as_number(value)
        .ok_or_else(|| RuntimeError::type_error("port number", value.kind().name()))?;
    port_number(number)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(f64),
    Text(String),
}

/// `port` field accepting `80`, `80.0` or `"80"`.
pub fn port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawPort>::deserialize(deserializer)?;
    let number = match raw {
        None => return Ok(None),
        Some(RawPort::Number(n)) => n,
        Some(RawPort::Text(s)) => s.trim().parse::<f64>().map_err(serde::de::Error::custom)?,
    };
    port_number(number).map(Some).map_err(serde::de::Error::custom)
}

/// Integer field that may arrive as a float (`4.0`).
pub fn integer<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<f64>::deserialize(deserializer)? {
        None => Ok(None),
        Some(n) if n.fract() == 0.0 && n >= 0.0 && n <= f64::from(u32::MAX) => Ok(Some(n as u32)),
        Some(n) => Err(serde::de::Error::custom(format!("expected an unsigned integer, got {n}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Deserialize)]
    struct Target {
        #[serde(default, deserialize_with = "port")]
        port: Option<u16>,
        #[serde(default, deserialize_with = "integer")]
        family: Option<u32>,
    }

    #[test]
    fn test_port_forms() {
        let t: Target = serde_json::from_str(r#"{"port": 8080.0, "family": 4.0}"#).unwrap();
        assert_eq!(t.port, Some(8080));
        assert_eq!(t.family, Some(4));
        let t: Target = serde_json::from_str(r#"{"port": "443"}"#).unwrap();
        assert_eq!(t.port, Some(443));
        let t: Target = serde_json::from_str("{}").unwrap();
        assert_eq!(t.port, None);
    }

    #[test]
    fn test_port_out_of_range() {
        assert!(serde_json::from_str::<Target>(r#"{"port": 70000}"#).is_err());
        assert!(serde_json::from_str::<Target>(r#"{"port": 1.5}"#).is_err());
        assert!(port_number(-1.0).is_err());
        assert_eq!(port_number(0.0).unwrap(), 0);
    }
}
