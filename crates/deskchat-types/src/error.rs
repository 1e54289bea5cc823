use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::Variant;
use crate::ops::Op;

/// Wire-level error discriminant carried in every failed response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotInitialized,
    UnsupportedOperation,
    TargetUnresolved,
    ArtifactNotFound,
    StaleHandle,
    RecoveryExhausted,
    BackendUnavailable,
    Timeout,
    Backend,
    InvalidRequest,
}

/// The bridge error taxonomy. No variant-specific error shape leaks past the
/// facade; raw native failure text only ever appears wrapped in a detail
/// string.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("backend session not initialized")]
    NotInitialized,

    #[error("operation {op:?} is not supported by the {variant:?} variant")]
    UnsupportedOperation { op: Op, variant: Variant },

    #[error("backend resolved conversation '{resolved}' instead of '{requested}'")]
    TargetUnresolved { requested: String, resolved: String },

    #[error("attachment not found at '{path}'")]
    ArtifactNotFound { path: String },

    #[error("stale window handle for '{target}': {detail}")]
    StaleHandle { target: String, detail: String },

    #[error("recovery exhausted for '{target}' after {attempts} attempts")]
    RecoveryExhausted { target: String, attempts: u32 },

    #[error("backend session is disconnected")]
    BackendUnavailable,

    #[error("timed out: {detail}")]
    Timeout { detail: String },

    #[error("backend call {op} failed: {detail}")]
    Backend { op: String, detail: String },

    #[error("invalid request: {detail}")]
    InvalidRequest { detail: String },
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::NotInitialized => ErrorKind::NotInitialized,
            BridgeError::UnsupportedOperation { .. } => ErrorKind::UnsupportedOperation,
            BridgeError::TargetUnresolved { .. } => ErrorKind::TargetUnresolved,
            BridgeError::ArtifactNotFound { .. } => ErrorKind::ArtifactNotFound,
            BridgeError::StaleHandle { .. } => ErrorKind::StaleHandle,
            BridgeError::RecoveryExhausted { .. } => ErrorKind::RecoveryExhausted,
            BridgeError::BackendUnavailable => ErrorKind::BackendUnavailable,
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
            BridgeError::Backend { .. } => ErrorKind::Backend,
            BridgeError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
        }
    }

    /// Only stale-handle failures are eligible for the recovery controller.
    pub fn is_stale(&self) -> bool {
        matches!(self, BridgeError::StaleHandle { .. })
    }
}

/// Closed set of native failure signatures that indicate an invalidated
/// window/control handle. Matching is substring-based against the normalized
/// backend detail string; anything else propagates untouched.
const STALE_SIGNATURES: &[&str] = &[
    "window activation failed",
    "invalid window handle",
    "setwindowpos",
    "find control timeout",
    "getnextsiblingcontrol",
    "window not found",
];

pub fn matches_stale_signature(detail: &str) -> bool {
    let lowered = detail.to_lowercase();
    STALE_SIGNATURES.iter().any(|sig| lowered.contains(sig))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_signatures_match_case_insensitively() {
        assert!(matches_stale_signature("Find Control Timeout: message list"));
        assert!(matches_stale_signature("SetWindowPos failed with code 1400"));
        assert!(matches_stale_signature("invalid window handle"));
        assert!(!matches_stale_signature("network unreachable"));
        assert!(!matches_stale_signature("no new messages"));
    }

    #[test]
    fn kinds_map_one_to_one() {
        let err = BridgeError::UnsupportedOperation {
            op: Op::SendTyping,
            variant: Variant::Standard,
        };
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert!(!err.is_stale());

        let stale = BridgeError::StaleHandle {
            target: "Alice".into(),
            detail: "window not found".into(),
        };
        assert!(stale.is_stale());
        assert_eq!(stale.kind(), ErrorKind::StaleHandle);
    }

    #[test]
    fn error_messages_carry_context() {
        let err = BridgeError::TargetUnresolved {
            requested: "Alice".into(),
            resolved: "Alicia".into(),
        };
        let text = err.to_string();
        assert!(text.contains("Alice"));
        assert!(text.contains("Alicia"));
    }
}
