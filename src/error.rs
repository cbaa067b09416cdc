//! Error taxonomy for bridge orchestration
//!
//! `AdapterError` is what chain and canister adapters return. `BridgeError`
//! is what the workflow and its actions surface to callers; it decides
//! whether a failed step may be retried.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::poller::CastState;
use crate::types::CastId;

/// Failure class of a single adapter call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdapterErrorKind {
    /// Call exceeded its deadline
    Timeout,
    /// Provider refused the request (HTTP 429, quota)
    RateLimited,
    /// Transport or node-side failure
    Rpc,
    /// The chain or contract does not offer this primitive
    Unsupported,
    /// The reply could not be decoded into the expected shape
    Decode,
}

/// Error returned by a chain, ledger or canister adapter
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?} error from {source_name}: {message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    /// Adapter that produced the error (e.g. "evm:1", "ledger")
    pub source_name: String,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn rpc(source_name: impl Into<String>, message: impl ToString) -> Self {
        Self::new(AdapterErrorKind::Rpc, source_name, message.to_string())
    }

    pub fn decode(source_name: impl Into<String>, message: impl ToString) -> Self {
        Self::new(AdapterErrorKind::Decode, source_name, message.to_string())
    }

    pub fn unsupported(source_name: impl Into<String>, what: &str) -> Self {
        Self::new(
            AdapterErrorKind::Unsupported,
            source_name,
            format!("{} is not supported", what),
        )
    }

    pub fn timeout(source_name: impl Into<String>, after: Duration) -> Self {
        Self::new(
            AdapterErrorKind::Timeout,
            source_name,
            format!("no response after {}ms", after.as_millis()),
        )
    }

    /// Whether repeating the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            AdapterErrorKind::Timeout | AdapterErrorKind::RateLimited | AdapterErrorKind::Rpc
        )
    }
}

/// Which fee-ledger approval an allowance error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ApprovalPurpose {
    /// Spender is the orchestrator, paying for a remote collection deployment
    Deployment,
    /// Spender is the mirror authority, paying for mints/casts
    Cast,
}

impl ApprovalPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalPurpose::Deployment => "deployment",
            ApprovalPurpose::Cast => "cast",
        }
    }
}

/// Errors surfaced by the workflow and its actions
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// RPC/network failure; recoverable by retrying
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Fee ledger or native balance cannot cover the operation
    #[error("insufficient {denomination} balance: have {available}, need {required}")]
    InsufficientBalance {
        denomination: String,
        available: u128,
        required: u128,
    },

    /// Ledger allowance for a spender is missing, too small, or expired
    #[error("insufficient {} allowance for {spender}: have {available}, need {required}", .purpose.as_str())]
    InsufficientAllowance {
        purpose: ApprovalPurpose,
        spender: String,
        available: u128,
        required: u128,
    },

    /// The asset is no longer held as discovery reported; re-discover
    #[error("ownership mismatch for {asset}: expected {expected}, found {found}")]
    OwnershipMismatch {
        asset: String,
        expected: String,
        found: String,
    },

    /// Polling exhausted before a terminal state was reached
    #[error("timed out after {attempts} status checks")]
    RemoteTimeout {
        attempts: u32,
        last_states: Vec<(CastId, CastState)>,
    },

    /// The remote side reported a failure
    #[error("remote failure: {message}")]
    RemoteError {
        message: String,
        partial: Vec<(CastId, CastState)>,
    },

    /// The request itself cannot be served (e.g. mixed source collections)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A command was issued against a step in the wrong status
    #[error("invalid transition for step {step}: {reason}")]
    InvalidTransition { step: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("decode error: {0}")]
    Decode(String),
}

impl BridgeError {
    /// Whether a step that failed with this error may be retried as-is.
    ///
    /// Remote failures and ownership mismatches need a fresh submission or a
    /// new discovery pass; everything else can be re-run.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Adapter(_)
            | BridgeError::InsufficientBalance { .. }
            | BridgeError::InsufficientAllowance { .. }
            | BridgeError::RemoteTimeout { .. }
            | BridgeError::Cancelled => true,
            BridgeError::OwnershipMismatch { .. }
            | BridgeError::RemoteError { .. }
            | BridgeError::InvalidRequest(_)
            | BridgeError::InvalidTransition { .. }
            | BridgeError::Decode(_) => false,
        }
    }
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(AdapterError::rpc("evm:1", "connection reset").is_transient());
        assert!(AdapterError::timeout("evm:1", Duration::from_secs(1)).is_transient());
        assert!(!AdapterError::unsupported("solana:devnet", "transfer history").is_transient());
        assert!(!AdapterError::decode("ledger", "bad nat").is_transient());
    }

    #[test]
    fn test_retryable_classes() {
        assert!(BridgeError::Adapter(AdapterError::rpc("x", "y")).is_retryable());
        assert!(BridgeError::RemoteTimeout {
            attempts: 3,
            last_states: vec![]
        }
        .is_retryable());
        assert!(!BridgeError::RemoteError {
            message: "mint reverted".into(),
            partial: vec![]
        }
        .is_retryable());
        assert!(!BridgeError::OwnershipMismatch {
            asset: "a".into(),
            expected: "b".into(),
            found: "c".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = BridgeError::InsufficientAllowance {
            purpose: ApprovalPurpose::Cast,
            spender: "aaaaa-aa".into(),
            available: 10,
            required: 12,
        };
        assert_eq!(
            err.to_string(),
            "insufficient cast allowance for aaaaa-aa: have 10, need 12"
        );
        let err = AdapterError::unsupported("solana:devnet", "transfer history");
        assert_eq!(
            err.to_string(),
            "Unsupported error from solana:devnet: transfer history is not supported"
        );
    }
}
