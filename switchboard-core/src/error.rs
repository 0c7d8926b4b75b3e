//! Error handling for AgentSwitchboard.
//!
//! Every user-visible failure maps onto the upstream-compatible body shape
//! `{"error": {"message", "type", "code"}}` so that SDK clients pointed at
//! the proxy keep parsing errors the way they parse provider errors.
//!
//! Storage failures on non-critical paths are not represented here at all:
//! those are caught where they happen and logged (fail-open). The variants
//! below are the ones that terminate a request.

use thiserror::Error;

/// All terminal error conditions in the switchboard.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SwitchboardError {
    /// The `X-Switchboard-Token` header is absent.
    #[error("Missing X-Switchboard-Token header")]
    MissingToken,

    /// The presented token does not resolve to an active organisation.
    #[error("Unknown or revoked organisation token")]
    InvalidToken,

    /// The firewall denied the request.
    #[error("Request blocked by semantic firewall: {reason}")]
    PolicyViolation {
        /// Human-readable denial reason, safe to return to the caller.
        reason: String,
    },

    /// The requesting agent is paused or revoked.
    #[error("Agent '{agent_id}' is {status}")]
    AgentSuspended {
        /// The agent that was refused.
        agent_id: String,
        /// Its current status, `paused` or `revoked`.
        status: String,
    },

    /// Another agent holds a fresh write lock on the resource.
    #[error("Resource '{resource}' is locked by another agent")]
    ResourceLocked {
        /// The logical resource identifier (`type:path`).
        resource: String,
    },

    /// The global emergency stop is engaged.
    #[error("Emergency stop is active")]
    EmergencyStop,

    /// Forwarding to the upstream provider failed.
    #[error("Upstream request failed: {message}")]
    Upstream {
        /// Classification of the upstream failure, no internal URLs.
        message: String,
    },

    /// A storage backend failed on a critical path.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration is invalid or a required file cannot be read.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An internal evaluation failure inside the firewall pipeline.
    ///
    /// Callers never see this as an HTTP error: the firewall converts it
    /// into a fail-open `audited` decision. It exists so inner stages can
    /// propagate with `?`.
    #[error("Evaluation error: {0}")]
    Evaluation(String),
}

impl SwitchboardError {
    /// Stable machine-readable code for the response body, where one exists.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::MissingToken => Some("MISSING_TOKEN"),
            Self::InvalidToken => Some("INVALID_TOKEN"),
            Self::PolicyViolation { .. } => Some("BLOCKED_BY_FIREWALL"),
            Self::AgentSuspended { .. } => Some("AGENT_SUSPENDED"),
            Self::ResourceLocked { .. } => Some("RESOURCE_LOCKED"),
            Self::EmergencyStop => Some("EMERGENCY_STOP"),
            Self::Upstream { .. } | Self::Storage(_) | Self::Config(_) | Self::Evaluation(_) => {
                None
            }
        }
    }

    /// The `type` field of the failure body.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::MissingToken | Self::InvalidToken => "authentication_error",
            Self::PolicyViolation { .. } | Self::AgentSuspended { .. } => "policy_violation",
            Self::ResourceLocked { .. } => "conflict_error",
            Self::EmergencyStop => "service_unavailable",
            Self::Upstream { .. } => "proxy_error",
            Self::Storage(_) => "storage_error",
            Self::Config(_) => "configuration_error",
            Self::Evaluation(_) => "evaluation_error",
        }
    }

    /// HTTP status code this error terminates a request with.
    pub fn status(&self) -> u16 {
        match self {
            Self::MissingToken | Self::InvalidToken => 401,
            Self::PolicyViolation { .. } | Self::AgentSuspended { .. } => 403,
            Self::ResourceLocked { .. } => 409,
            Self::EmergencyStop => 503,
            Self::Upstream { .. } => 502,
            Self::Storage(_) | Self::Config(_) | Self::Evaluation(_) => 500,
        }
    }

    /// Render the upstream-compatible failure body.
    pub fn to_body(&self) -> serde_json::Value {
        let mut error = serde_json::json!({
            "message": self.to_string(),
            "type": self.error_type(),
        });
        if let Some(code) = self.code() {
            error["code"] = serde_json::Value::String(code.to_string());
        }
        serde_json::json!({ "error": error })
    }
}

/// Convenience alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, SwitchboardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(SwitchboardError::MissingToken.status(), 401);
        assert_eq!(SwitchboardError::InvalidToken.status(), 401);
        assert_eq!(
            SwitchboardError::PolicyViolation {
                reason: "pii".into()
            }
            .status(),
            403
        );
        assert_eq!(
            SwitchboardError::ResourceLocked {
                resource: "database_table:accounts".into()
            }
            .status(),
            409
        );
        assert_eq!(SwitchboardError::EmergencyStop.status(), 503);
        assert_eq!(
            SwitchboardError::Upstream {
                message: "connect refused".into()
            }
            .status(),
            502
        );
    }

    #[test]
    fn test_body_shape() {
        let err = SwitchboardError::PolicyViolation {
            reason: "email address detected".into(),
        };
        let body = err.to_body();
        assert_eq!(body["error"]["type"], "policy_violation");
        assert_eq!(body["error"]["code"], "BLOCKED_BY_FIREWALL");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("email address"));
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            SwitchboardError::EmergencyStop.code(),
            Some("EMERGENCY_STOP")
        );
        assert_eq!(
            SwitchboardError::ResourceLocked {
                resource: "x".into()
            }
            .code(),
            Some("RESOURCE_LOCKED")
        );
        assert_eq!(
            SwitchboardError::Upstream {
                message: "x".into()
            }
            .code(),
            None
        );
    }
}
