//! Error types for layer-updates.

use std::{fmt, io};

use crate::handler::HandlerId;

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by Telegram's servers in response to an RPC call.
///
/// Numeric values are stripped from the name and placed in [`RpcError::value`].
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with digits removed.
    pub name: String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw Telegram error message like `"FLOOD_WAIT_30"` into an `RpcError`.
    pub fn from_telegram(code: i32, message: &str) -> Self {
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    let name = message[..idx].to_string();
                    return Self { code, name, value: Some(v) };
                }
            }
        }
        Self { code, name: message.to_string(), value: None }
    }

    /// Match on the error name, with optional wildcard prefix/suffix `'*'`.
    ///
    /// # Examples
    /// - `err.is("FLOOD_WAIT")`: exact match
    /// - `err.is("CHANNEL_*")`: starts-with match
    /// - `err.is("*_INVALID")`: ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// Returns the flood-wait duration in seconds, if this is a FLOOD_WAIT error.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        if self.code == 420 && self.name == "FLOOD_WAIT" {
            self.value.map(|v| v as u64)
        } else {
            None
        }
    }
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// Errors after which difference fetching for one scope cannot continue.
const SCOPE_TERMINAL: [&str; 4] = [
    "CHANNEL_PRIVATE",
    "CHANNEL_INVALID",
    "PERSISTENT_TIMESTAMP_OUTDATED",
    "PERSISTENT_TIMESTAMP_INVALID",
];

/// The error type returned from anything that talks to Telegram or to the
/// state storage.
#[derive(Debug)]
pub enum InvocationError {
    /// Telegram rejected the request.
    Rpc(RpcError),
    /// Network or storage I/O failure.
    Io(io::Error),
    /// The response did not have the shape the request promised.
    Deserialize(String),
    /// The request was dropped (e.g. the connection shut down).
    Dropped,
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e)          => write!(f, "{e}"),
            Self::Io(e)           => write!(f, "I/O error: {e}"),
            Self::Deserialize(s)  => write!(f, "deserialize error: {s}"),
            Self::Dropped         => write!(f, "request dropped"),
        }
    }
}

impl std::error::Error for InvocationError {}

impl From<io::Error> for InvocationError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<RpcError> for InvocationError {
    fn from(e: RpcError) -> Self { Self::Rpc(e) }
}

impl InvocationError {
    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _            => false,
        }
    }

    /// If this is a FLOOD_WAIT error, returns how many seconds to wait.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        match self {
            Self::Rpc(e) => e.flood_wait_seconds(),
            _            => None,
        }
    }

    /// `true` for the errors that end gap recovery of a single scope:
    /// `CHANNEL_PRIVATE`, `CHANNEL_INVALID` and the two
    /// `PERSISTENT_TIMESTAMP_*` rejections.
    pub fn is_scope_terminal(&self) -> bool {
        SCOPE_TERMINAL.iter().any(|name| self.is(name))
    }
}

// ─── DispatchError ────────────────────────────────────────────────────────────

/// Errors returned by handler registration on the [`crate::Dispatcher`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// No handler group with this number exists.
    UnknownGroup(i32),
    /// The group exists but does not contain this handler.
    UnknownHandler(HandlerId),
    /// The dispatcher's control task is gone.
    Closed,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownGroup(g)   => write!(f, "group {g} does not exist"),
            Self::UnknownHandler(h) => write!(f, "handler {h} is not registered in that group"),
            Self::Closed            => write!(f, "dispatcher is closed"),
        }
    }
}

impl std::error::Error for DispatchError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flood_wait_suffix_is_split() {
        let e = RpcError::from_telegram(420, "FLOOD_WAIT_30");
        assert_eq!(e.name, "FLOOD_WAIT");
        assert_eq!(e.value, Some(30));
        assert_eq!(e.flood_wait_seconds(), Some(30));
    }

    #[test]
    fn wildcard_matching() {
        let e = RpcError::from_telegram(400, "PERSISTENT_TIMESTAMP_INVALID");
        assert!(e.is("PERSISTENT_TIMESTAMP_*"));
        assert!(e.is("*_INVALID"));
        assert!(!e.is("CHANNEL_*"));
    }

    #[test]
    fn scope_terminal_errors() {
        for name in SCOPE_TERMINAL {
            let e = InvocationError::Rpc(RpcError::from_telegram(400, name));
            assert!(e.is_scope_terminal(), "{name}");
        }
        let flood = InvocationError::Rpc(RpcError::from_telegram(420, "FLOOD_WAIT_3"));
        assert!(!flood.is_scope_terminal());
        assert!(!InvocationError::Dropped.is_scope_terminal());
    }
}
