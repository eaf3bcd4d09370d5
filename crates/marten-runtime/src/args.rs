//! Positional argument parsing for overloaded guest calls.
//!
//! `connect(port)`, `connect(port, host)`, `connect(options, cb)` and friends
//! are resolved by probing the arguments in order. The cursor only moves when
//! the probed type matches, so optional arguments can be tried in sequence.

use crate::guest::{GuestValue, ValueKind};

#[derive(Debug)]
pub struct ArgParser<'a, V> {
    args: &'a [V],
    index: usize,
}

impl<'a, V: GuestValue> ArgParser<'a, V> {
    pub fn new(args: &'a [V]) -> Self {
        Self { args, index: 0 }
    }

    /// Take the next argument if it has `kind`.
    pub fn next(&mut self, kind: ValueKind) -> Option<&'a V> {
        self.next_any(&[kind])
    }

    /// Take the next argument if its kind is one of `kinds`.
    pub fn next_any(&mut self, kinds: &[ValueKind]) -> Option<&'a V> {
        let value = self.args.get(self.index)?;
        if kinds.contains(&value.kind()) {
            self.index += 1;
            Some(value)
        } else {
            None
        }
    }

    pub fn next_function(&mut self) -> Option<&'a V> {
        self.next(ValueKind::Function)
    }

    pub fn next_object(&mut self) -> Option<&'a V> {
        self.next(ValueKind::Object)
    }

    /// Take the next argument if it is undefined or null.
    pub fn skip_nullish(&mut self) -> bool {
        self.next_any(&[ValueKind::Undefined, ValueKind::Null]).is_some()
    }

    /// The last argument if it is a function (trailing-callback convention).
    pub fn trailing_function(&self) -> Option<&'a V> {
        self.args[self.index..].last().filter(|v| v.is_function())
    }

    pub fn position(&self) -> usize {
        self.index
    }

    pub fn remaining(&self) -> &'a [V] {
        &self.args[self.index..]
    }

    pub fn is_exhausted(&self) -> bool {
        self.index >= self.args.len()
    }
}
