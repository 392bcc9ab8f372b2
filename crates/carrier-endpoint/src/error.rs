//! The error taxonomy shared by every layer of carrier (spec §7).
//!
//! `ErrorKind` names the *kind* of failure; `CarrierError` is the concrete
//! error type threaded through the transport, namespace, and RPC layers. It
//! always carries a kind plus a human-readable message, and optionally the
//! suffix/method that was being served when the failure happened so that
//! callers can attribute an error to the RPC that produced it.

use std::fmt;

/// Taxonomy of failure kinds, not concrete error types (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller's context ended (cancellation signal fired).
    Cancelled,
    /// A deadline passed before the operation completed.
    Timeout,
    /// The authorizer rejected the caller.
    NoAccess,
    /// Namespace resolution found no entry for the name.
    NoSuchName,
    /// The dispatcher returned no invoker for (suffix, method).
    NoSuchMethod,
    /// The dispatcher returned no object for the suffix.
    NoSuchSuffix,
    /// Wire format invalid, or version ranges are incompatible.
    BadProtocol,
    /// The VIF or VC tore down; the operation cannot complete.
    Aborted,
    /// The caller supplied an illegal argument.
    BadArg,
    /// Wrapped error from an external collaborator (codec, crypto, etc).
    Unknown,
}

impl ErrorKind {
    /// Whether the RPC client should retry a call that failed with this kind
    /// (spec §7 propagation policy: retry on `Aborted`, never on `NoAccess`
    /// or `NoSuchName`).
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Aborted)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NoAccess => "no-access",
            ErrorKind::NoSuchName => "no-such-name",
            ErrorKind::NoSuchMethod => "no-such-method",
            ErrorKind::NoSuchSuffix => "no-such-suffix",
            ErrorKind::BadProtocol => "bad-protocol",
            ErrorKind::Aborted => "aborted",
            ErrorKind::BadArg => "bad-arg",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A carrier error: a kind, a message, and optional RPC attribution.
///
/// Every error surfaced to an RPC caller carries the kind and a
/// human-readable message with the failing suffix and method (spec §7).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}{}", format_suffix_method(.suffix, .method))]
pub struct CarrierError {
    pub kind: ErrorKind,
    pub message: String,
    pub suffix: Option<String>,
    pub method: Option<String>,
}

fn format_suffix_method(suffix: &Option<String>, method: &Option<String>) -> String {
    match (suffix, method) {
        (Some(s), Some(m)) => format!(" (suffix={s:?}, method={m:?})"),
        (Some(s), None) => format!(" (suffix={s:?})"),
        (None, Some(m)) => format!(" (method={m:?})"),
        (None, None) => String::new(),
    }
}

impl CarrierError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        CarrierError {
            kind,
            message: message.into(),
            suffix: None,
            method: None,
        }
    }

    pub fn with_call(mut self, suffix: impl Into<String>, method: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self.method = Some(method.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn no_access(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoAccess, message)
    }

    pub fn no_such_name(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoSuchName, message)
    }

    pub fn no_such_method(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoSuchMethod, message)
    }

    pub fn no_such_suffix(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoSuchSuffix, message)
    }

    pub fn bad_protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadProtocol, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted, message)
    }

    pub fn bad_arg(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadArg, message)
    }

    /// Wrap an external collaborator's error (codec, crypto, I/O, ...).
    pub fn unknown(err: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Unknown, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CarrierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let e = CarrierError::no_access("application Authorizer denied access");
        assert_eq!(
            e.to_string(),
            "no-access: application Authorizer denied access"
        );
    }

    #[test]
    fn display_includes_suffix_and_method_when_set() {
        let e = CarrierError::no_such_method("not found").with_call("suffix", "Echo");
        assert_eq!(
            e.to_string(),
            "no-such-method: not found (suffix=\"suffix\", method=\"Echo\")"
        );
    }

    #[test]
    fn aborted_is_retryable_others_are_not() {
        assert!(ErrorKind::Aborted.is_retryable());
        assert!(!ErrorKind::NoAccess.is_retryable());
        assert!(!ErrorKind::NoSuchName.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }
}
