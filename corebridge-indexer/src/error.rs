// Copyright (c) Corebridge, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the correlator.
//!
//! Each component maps upstream failures into these types at its boundary.
//! Transient conditions are retried internally and only surface once the
//! retry budget is exhausted; the matcher then leaves the transfer PENDING.
//! `NotFound` is the one terminal failure: it means the search concluded
//! exhaustively and the transfer can be marked FAILED.

use thiserror::Error;

/// Failure modes of an outbound fetch (CORE ledger, EVM RPC, object store).
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// 5xx responses, connection resets and other conditions worth retrying.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// Malformed upstream response. Not retryable.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout | FetchError::RateLimited { .. } | FetchError::Transient(_)
        )
    }

    /// Short identifier used as a metrics label.
    pub fn error_type(&self) -> &'static str {
        match self {
            FetchError::Timeout => "timeout",
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::Transient(_) => "transient",
            FetchError::Protocol(_) => "protocol",
        }
    }
}

/// Outcome of a failed block search.
#[derive(Debug, Error)]
pub enum FindError {
    /// The search bracketed the target time exhaustively and no transaction
    /// matched. Terminal: the matcher marks the transfer FAILED.
    #[error("no matching transaction after searching {blocks_searched} blocks")]
    NotFound { blocks_searched: u64 },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("storage failure during search: {0}")]
    Storage(String),

    /// The transfer record itself cannot be interpreted (e.g. a non-numeric
    /// amount). Left PENDING for operator inspection.
    #[error("uninterpretable transfer: {0}")]
    InvalidTransfer(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Timeout.is_transient());
        assert!(FetchError::RateLimited {
            retry_after_ms: 1000
        }
        .is_transient());
        assert!(FetchError::Transient("503".to_string()).is_transient());
        assert!(!FetchError::Protocol("bad json".to_string()).is_transient());
    }

    #[test]
    fn test_error_type_valid_metric_labels() {
        let errors = [
            FetchError::Timeout,
            FetchError::RateLimited { retry_after_ms: 0 },
            FetchError::Transient(String::new()),
            FetchError::Protocol(String::new()),
        ];
        for e in errors {
            let label = e.error_type();
            assert!(!label.is_empty());
            assert!(label.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
