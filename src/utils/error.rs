//! Unified error type threaded through every server- and client-side
//! `Result` in the crate.
//!
//! A single string-backed error is enough here: protocol refusals ("wrong
//! view", "old op number", ...) travel the wire as plain strings anyway,
//! and application errors reach clients as the `error` field of a
//! `CommandResult`. Only the message content distinguishes them.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for Canopy.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CanopyError(pub String);

impl CanopyError {
    /// Creates an error from anything that can be turned into a string.
    pub fn msg(m: impl ToString) -> Self {
        CanopyError(m.to_string())
    }
}

impl fmt::Display for CanopyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for CanopyError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from the foreign error types that `?` meets in this crate.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for CanopyError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                CanopyError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(
    tokio::sync::watch::error::SendError<Option<tokio::time::Instant>>
);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn refusal_displays_bare() {
        // refusal strings must round-trip to clients without decoration
        let e = CanopyError("wrong view".into());
        assert_eq!(format!("{}", e), String::from("wrong view"));
        assert_eq!(e, CanopyError::msg("wrong view"));
    }

    #[test]
    fn from_conn_refused() {
        let io_error = io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "peer is down",
        );
        let e = CanopyError::from(io_error);
        assert!(e.0.contains("peer is down"));
    }

    #[test]
    fn from_truncated_frame() {
        // a frame cut short mid-transfer surfaces as a decode error
        let garbled =
            rmp_serde::decode::from_slice::<(u64, String)>(&[0x92, 0x07]);
        let e = CanopyError::from(garbled.unwrap_err());
        assert!(!e.0.is_empty());
    }
}
