//! Error types for the VEIL core.
//!
//! Every failure surfaced across the public API is an [`Error`] carrying
//! one of ten stable [`ErrorKind`]s. Errors are values; nothing unwinds
//! across the API boundary.

use std::borrow::Cow;
use thiserror::Error;

/// Stable classification of core errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Socket or disk failure; typically retried at the tick
    Io,
    /// MAC failure or invalid key material; never retried
    Crypto,
    /// Noise-IK handshake failure; the session is marked failed
    Handshake,
    /// Version negotiation exhausted with no overlap
    NoCommonVersion,
    /// Recipient pre-key bundle empty or unknown
    NoPreKeys,
    /// Storage full and eviction could not reclaim space
    CapacityExceeded,
    /// Transient overload; retry after the next tick
    Backpressure,
    /// Shutdown in progress; terminal
    Canceled,
    /// The requested path does not apply to the current state
    NotApplicable,
    /// Malformed input; never retried
    InvalidArgument,
}

/// Core error: a kind plus human-readable context.
///
/// Context strings never contain key material.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: Cow<'static, str>,
}

impl Error {
    /// Create an error with the given kind and context.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The error's classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Whether the tick loop may transparently retry this failure.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::Io | ErrorKind::Backpressure)
    }

    /// Whether this failure is terminal for the operation.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Crypto | ErrorKind::Canceled | ErrorKind::InvalidArgument
        )
    }

    /// I/O failure with static context.
    #[must_use]
    pub const fn io(message: &'static str) -> Self {
        Self {
            kind: ErrorKind::Io,
            message: Cow::Borrowed(message),
        }
    }

    /// Cryptographic failure with static context.
    #[must_use]
    pub const fn crypto(message: &'static str) -> Self {
        Self {
            kind: ErrorKind::Crypto,
            message: Cow::Borrowed(message),
        }
    }

    /// Handshake failure with static context.
    #[must_use]
    pub const fn handshake(message: &'static str) -> Self {
        Self {
            kind: ErrorKind::Handshake,
            message: Cow::Borrowed(message),
        }
    }

    /// Negotiation found no common protocol version.
    #[must_use]
    pub const fn no_common_version() -> Self {
        Self {
            kind: ErrorKind::NoCommonVersion,
            message: Cow::Borrowed("no common protocol version"),
        }
    }

    /// The recipient's pre-key bundle is absent or exhausted.
    #[must_use]
    pub const fn no_pre_keys() -> Self {
        Self {
            kind: ErrorKind::NoPreKeys,
            message: Cow::Borrowed("no unconsumed pre-keys for recipient"),
        }
    }

    /// Storage full after eviction.
    #[must_use]
    pub const fn capacity_exceeded() -> Self {
        Self {
            kind: ErrorKind::CapacityExceeded,
            message: Cow::Borrowed("storage capacity exceeded"),
        }
    }

    /// Transient overload.
    #[must_use]
    pub const fn backpressure(message: &'static str) -> Self {
        Self {
            kind: ErrorKind::Backpressure,
            message: Cow::Borrowed(message),
        }
    }

    /// Shutdown in progress.
    #[must_use]
    pub const fn canceled() -> Self {
        Self {
            kind: ErrorKind::Canceled,
            message: Cow::Borrowed("shutdown in progress"),
        }
    }

    /// The requested path does not apply.
    #[must_use]
    pub const fn not_applicable(message: &'static str) -> Self {
        Self {
            kind: ErrorKind::NotApplicable,
            message: Cow::Borrowed(message),
        }
    }

    /// Malformed input.
    #[must_use]
    pub const fn invalid_argument(message: &'static str) -> Self {
        Self {
            kind: ErrorKind::InvalidArgument,
            message: Cow::Borrowed(message),
        }
    }
}

impl From<veil_crypto::CryptoError> for Error {
    fn from(err: veil_crypto::CryptoError) -> Self {
        use veil_crypto::CryptoError;
        let kind = match err {
            CryptoError::Handshake(_) | CryptoError::InvalidHandshakeState => ErrorKind::Handshake,
            _ => ErrorKind::Crypto,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<veil_transport::TransportError> for Error {
    fn from(err: veil_transport::TransportError) -> Self {
        use veil_transport::TransportError;
        match err {
            TransportError::Closed => Self::canceled(),
            other => Self::new(ErrorKind::Io, other.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, err.to_string())
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_preserved() {
        assert_eq!(Error::no_pre_keys().kind(), ErrorKind::NoPreKeys);
        assert_eq!(Error::canceled().kind(), ErrorKind::Canceled);
        assert_eq!(
            Error::new(ErrorKind::Backpressure, "queue full").kind(),
            ErrorKind::Backpressure
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::io("socket").is_transient());
        assert!(Error::backpressure("queue full").is_transient());
        assert!(!Error::crypto("bad mac").is_transient());
        assert!(!Error::no_common_version().is_transient());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(Error::crypto("bad mac").is_terminal());
        assert!(Error::canceled().is_terminal());
        assert!(Error::invalid_argument("bad input").is_terminal());
        assert!(!Error::io("socket").is_terminal());
    }

    #[test]
    fn test_crypto_error_mapping() {
        let err: Error = veil_crypto::CryptoError::DecryptionFailed.into();
        assert_eq!(err.kind(), ErrorKind::Crypto);

        let err: Error = veil_crypto::CryptoError::Handshake("bad".into()).into();
        assert_eq!(err.kind(), ErrorKind::Handshake);
    }

    #[test]
    fn test_transport_error_mapping() {
        let err: Error = veil_transport::TransportError::Closed.into();
        assert_eq!(err.kind(), ErrorKind::Canceled);

        let err: Error = veil_transport::TransportError::BindFailed("x".into()).into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_display_contains_context() {
        let err = Error::new(ErrorKind::Io, "disk write failed");
        assert!(err.to_string().contains("disk write failed"));
    }
}
