//! Typed failure kinds carried inside `anyhow::Error`.
//!
//! Library functions return `anyhow::Result`. Domain failures are raised as a
//! [`CustodyError`] so callers (and the audit log) can recover a stable,
//! machine-readable kind with [`error_kind`].

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DuplicateAlias,
    KeyNotFound,
    IntegrityViolation,
    UnauthorizedAccess,
    InvalidStateTransition,
    PartialSyncFailure,
    ChainBroken,
    EnvelopeNotFound,
    StreamNotFound,
    DuplicateEnvelope,
    InvalidInput,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::DuplicateAlias => "DUPLICATE_ALIAS",
            ErrorKind::KeyNotFound => "KEY_NOT_FOUND",
            ErrorKind::IntegrityViolation => "INTEGRITY_VIOLATION",
            ErrorKind::UnauthorizedAccess => "UNAUTHORIZED_ACCESS",
            ErrorKind::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            ErrorKind::PartialSyncFailure => "PARTIAL_SYNC_FAILURE",
            ErrorKind::ChainBroken => "CHAIN_BROKEN",
            ErrorKind::EnvelopeNotFound => "ENVELOPE_NOT_FOUND",
            ErrorKind::StreamNotFound => "STREAM_NOT_FOUND",
            ErrorKind::DuplicateEnvelope => "DUPLICATE_ENVELOPE",
            ErrorKind::InvalidInput => "INVALID_INPUT",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodyError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CustodyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

impl std::fmt::Display for CustodyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message)
    }
}

impl std::error::Error for CustodyError {}

/// Shorthand for raising a typed failure as an `anyhow::Error`.
pub fn custody_err(kind: ErrorKind, message: impl Into<String>) -> anyhow::Error {
    CustodyError::new(kind, message).into()
}

/// Recover the typed kind from an error chain, if any layer carries one.
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<CustodyError>())
        .map(|e| e.kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_survives_context_layers() {
        let err = Err::<(), _>(custody_err(ErrorKind::KeyNotFound, "mk_1"))
            .context("loading master key")
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::KeyNotFound));
    }

    #[test]
    fn display_uses_stable_code() {
        let err = CustodyError::new(ErrorKind::IntegrityViolation, "tag mismatch");
        assert_eq!(err.to_string(), "INTEGRITY_VIOLATION: tag mismatch");
    }

    #[test]
    fn plain_errors_have_no_kind() {
        let err = anyhow::anyhow!("io failure");
        assert_eq!(error_kind(&err), None);
    }
}
