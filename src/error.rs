//! # Error Taxonomy
//!
//! Failures never cross the evaluation boundary as panics or `Err` returns:
//! `variation` calls hand back the caller's fallback and report the cause
//! through the evaluation reason. The types here are that reporting
//! vocabulary, plus the store error the persistence layer propagates.

use thiserror::Error;

/// Why an evaluation could not produce a flag-derived value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalErrorKind {
    /// The client has not finished initializing.
    ClientNotReady,
    /// The flag key was empty.
    NullKey,
    /// The data store failed while fetching definitions.
    StoreError,
    /// No flag with the requested key exists.
    FlagNotFound,
    /// The user was missing or had no key.
    UserNotSpecified,
    /// The flag definition references data that does not exist, such as an
    /// out-of-range variation index.
    MalformedFlag,
    /// The evaluation produced a value of a different type than requested.
    WrongType,
    /// An allocation or internal bookkeeping failure.
    Oom,
}

impl EvalErrorKind {
    /// The wire name of this error kind, as it appears in event reasons.
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalErrorKind::ClientNotReady => "CLIENT_NOT_READY",
            EvalErrorKind::NullKey => "NULL_KEY",
            EvalErrorKind::StoreError => "STORE_ERROR",
            EvalErrorKind::FlagNotFound => "FLAG_NOT_FOUND",
            EvalErrorKind::UserNotSpecified => "USER_NOT_SPECIFIED",
            EvalErrorKind::MalformedFlag => "MALFORMED_FLAG",
            EvalErrorKind::WrongType => "WRONG_TYPE",
            EvalErrorKind::Oom => "OOM",
        }
    }
}

impl std::fmt::Display for EvalErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure inside a data store or its persistent backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The persistent backend reported a failure.
    #[error("store backend error: {0}")]
    Backend(String),
    /// A stored document could not be deserialized.
    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

/// Top-level SDK errors surfaced from configuration and lifecycle calls.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_names() {
        assert_eq!(EvalErrorKind::ClientNotReady.as_str(), "CLIENT_NOT_READY");
        assert_eq!(EvalErrorKind::WrongType.as_str(), "WRONG_TYPE");
        assert_eq!(
            EvalErrorKind::UserNotSpecified.to_string(),
            "USER_NOT_SPECIFIED"
        );
    }
}
