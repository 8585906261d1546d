//! Error types and wire mapping.
//!
//! Every user-visible error names the target, component, allocation or
//! server at fault. Ownership races ([`CorralError::Conflict`]) are resolved
//! inside the allocation manager by requeueing and never reach a caller with
//! a valid request.

use crate::alloc::AllocationId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common corral error conditions.
#[derive(Debug, Clone, Error)]
pub enum CorralError {
    /// Target name is not in the registry.
    #[error("target {target} not found")]
    TargetNotFound { target: String },

    /// Allocation id is unknown (or already garbage-collected).
    #[error("allocation {allocation_id} not found")]
    AllocationNotFound { allocation_id: AllocationId },

    /// Target has no power component with this name.
    #[error("target {target} has no power component {component}")]
    ComponentNotFound { target: String, component: String },

    /// Caller lacks ownership or administrative capability.
    #[error("forbidden: {message}")]
    Forbidden { message: String },

    /// Ownership compare-and-set lost a race.
    #[error("target {target} is owned by allocation {owner}")]
    Conflict { target: String, owner: AllocationId },

    /// Malformed request.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Non-queueing acquire hit a target that is in use or reserved.
    #[error("target {target} is busy")]
    Busy { target: String },

    /// Queue wait or power transition exceeded its deadline.
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Multi-component command where some sub-operations failed.
    #[error(
        "power command on {target} partially failed: {}",
        format_failures(.failures)
    )]
    PartialFailure {
        target: String,
        succeeded: Vec<String>,
        failures: Vec<ComponentFailure>,
    },

    /// Federated server did not answer.
    #[error("server {server} unavailable: {message}")]
    ServerUnavailable { server: String, message: String },

    /// Error reported by a remote broker over the wire.
    #[error("{kind}: {message}")]
    Remote { kind: ErrorKind, message: String },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// One failed component of a multi-component power command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentFailure {
    /// Component name.
    pub component: String,
    /// Failure description.
    pub reason: String,
}

fn format_failures(failures: &[ComponentFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.component, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error category carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    Conflict,
    Invalid,
    Busy,
    Timeout,
    PartialFailure,
    Unavailable,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "NotFound",
            Self::Forbidden => "Forbidden",
            Self::Conflict => "Conflict",
            Self::Invalid => "Invalid",
            Self::Busy => "Busy",
            Self::Timeout => "Timeout",
            Self::PartialFailure => "PartialFailure",
            Self::Unavailable => "Unavailable",
            Self::Internal => "Internal",
        };
        write!(f, "{}", s)
    }
}

impl CorralError {
    /// Create a Forbidden error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Create an InvalidRequest error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a Timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wire category for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TargetNotFound { .. }
            | Self::AllocationNotFound { .. }
            | Self::ComponentNotFound { .. } => ErrorKind::NotFound,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::InvalidRequest { .. } => ErrorKind::Invalid,
            Self::Busy { .. } => ErrorKind::Busy,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::PartialFailure { .. } => ErrorKind::PartialFailure,
            Self::ServerUnavailable { .. } => ErrorKind::Unavailable,
            Self::Remote { kind, .. } => *kind,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Check if this error indicates the operation may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Conflict | ErrorKind::Busy | ErrorKind::Unavailable | ErrorKind::Timeout
        )
    }
}

/// Result type using CorralError.
pub type CorralResult<T> = Result<T, CorralError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        let e = CorralError::TargetNotFound {
            target: "qemu-01".into(),
        };
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert!(e.to_string().contains("qemu-01"));

        let e = CorralError::ComponentNotFound {
            target: "nuc-3".into(),
            component: "usb".into(),
        };
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert!(e.to_string().contains("nuc-3"));
        assert!(e.to_string().contains("usb"));

        assert_eq!(CorralError::forbidden("x").kind(), ErrorKind::Forbidden);
        assert_eq!(CorralError::invalid("x").kind(), ErrorKind::Invalid);
        assert_eq!(CorralError::timeout("x").kind(), ErrorKind::Timeout);
        assert_eq!(
            CorralError::Remote {
                kind: ErrorKind::Busy,
                message: "t".into()
            }
            .kind(),
            ErrorKind::Busy
        );
    }

    #[test]
    fn partial_failure_names_each_component() {
        let e = CorralError::PartialFailure {
            target: "board-7".into(),
            succeeded: vec!["main".into()],
            failures: vec![
                ComponentFailure {
                    component: "usb-hub".into(),
                    reason: "driver error".into(),
                },
                ComponentFailure {
                    component: "fan".into(),
                    reason: "timed out".into(),
                },
            ],
        };
        let msg = e.to_string();
        assert!(msg.contains("board-7"));
        assert!(msg.contains("usb-hub: driver error"));
        assert!(msg.contains("fan: timed out"));
        assert_eq!(e.kind(), ErrorKind::PartialFailure);
    }

    #[test]
    fn retriable_errors() {
        assert!(CorralError::Busy { target: "a".into() }.is_retriable());
        assert!(!CorralError::forbidden("no").is_retriable());
        assert!(!CorralError::invalid("no").is_retriable());
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let s = serde_json::to_string(&ErrorKind::PartialFailure).unwrap();
        assert_eq!(s, "\"partial_failure\"");
        let k: ErrorKind = serde_json::from_str("\"not_found\"").unwrap();
        assert_eq!(k, ErrorKind::NotFound);
    }
}
