// apps/flow-kernel/src/error.rs
// Purpose: Error taxonomy for the engine and the agent dispatch path.
// Architecture: Shared Error Layer
// Dependencies: thiserror

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::models::ExecutionError;

/// What went wrong talking to one agent, as seen by the proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    /// The per-node timeout elapsed end-to-end.
    Timeout,
    /// Connect/read failure below HTTP.
    Network,
    /// Non-2xx HTTP status from the agent.
    Http,
    /// 2xx but the body violates the execute contract (bad JSON, missing
    /// fields, oversized response).
    Contract,
    /// The agent answered `status: "error"`.
    AppError,
    /// Dispatch refused by the per-agent circuit breaker.
    BreakerOpen,
    /// Process-wide dispatch queue is full.
    Saturated,
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("agent error ({kind:?}){}", .status.map(|s| format!(" status={s}")).unwrap_or_default())]
pub struct AgentError {
    pub kind: AgentErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl AgentError {
    pub fn timeout() -> Self {
        Self { kind: AgentErrorKind::Timeout, status: None, body: None }
    }

    pub fn network(detail: impl Into<String>) -> Self {
        Self { kind: AgentErrorKind::Network, status: None, body: Some(detail.into()) }
    }

    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self { kind: AgentErrorKind::Http, status: Some(status), body: Some(body.into()) }
    }

    pub fn contract(detail: impl Into<String>) -> Self {
        Self { kind: AgentErrorKind::Contract, status: None, body: Some(detail.into()) }
    }

    pub fn app(message: impl Into<String>) -> Self {
        Self { kind: AgentErrorKind::AppError, status: None, body: Some(message.into()) }
    }

    pub fn breaker_open() -> Self {
        Self { kind: AgentErrorKind::BreakerOpen, status: None, body: None }
    }

    pub fn saturated() -> Self {
        Self { kind: AgentErrorKind::Saturated, status: None, body: None }
    }

    /// Retryable: 408, 425, 429, 5xx, network errors, timeouts.
    /// Everything else is permanent.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            AgentErrorKind::Timeout | AgentErrorKind::Network => true,
            AgentErrorKind::Http => matches!(self.status, Some(408 | 425 | 429) | Some(500..=599)),
            AgentErrorKind::Saturated => true,
            AgentErrorKind::Contract
            | AgentErrorKind::AppError
            | AgentErrorKind::BreakerOpen => false,
        }
    }

    /// Failures that trip the per-agent breaker. Saturation is a local
    /// condition and breaker rejections must not feed back into the breaker.
    pub fn counts_for_breaker(&self) -> bool {
        !matches!(self.kind, AgentErrorKind::Saturated | AgentErrorKind::BreakerOpen)
    }

    pub fn public_kind(&self) -> &'static str {
        match self.kind {
            AgentErrorKind::Timeout => "AgentTimeout",
            AgentErrorKind::Network => "AgentNetwork",
            AgentErrorKind::Http => "AgentHttp",
            AgentErrorKind::Contract => "AgentContract",
            AgentErrorKind::AppError => "AgentError",
            AgentErrorKind::BreakerOpen => "AgentBreakerOpen",
            AgentErrorKind::Saturated => "Saturated",
        }
    }
}

/// Engine-level errors. Node-local agent failures travel as [`AgentError`]
/// and are lifted here only when they terminate the execution.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid flow: {0}")]
    FlowInvalid(String),

    #[error("unknown agent: {0}")]
    AgentUnknown(String),

    #[error("agent {0} is already registered in another scope")]
    AgentConflict(String),

    #[error("expression `{expr}` failed: {reason}")]
    Expression { expr: String, reason: String },

    #[error("execution cancelled")]
    Cancelled,

    #[error("execution deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("not found")]
    NotFound,

    #[error("execution is already terminal")]
    AlreadyTerminal,

    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl EngineError {
    /// The `error.kind` string surfaced on a failed `ExecutionContext`.
    pub fn public_kind(&self) -> &'static str {
        match self {
            Self::FlowInvalid(_) => "FlowInvalid",
            Self::AgentUnknown(_) => "AgentUnknown",
            Self::AgentConflict(_) => "AgentConflict",
            Self::Expression { .. } => "ExpressionError",
            Self::Cancelled => "Cancelled",
            Self::DeadlineExceeded(_) => "DeadlineExceeded",
            Self::StoreUnavailable(_) => "StoreUnavailable",
            Self::IllegalTransition { .. } => "IllegalTransition",
            Self::NotFound => "NotFound",
            Self::AlreadyTerminal => "AlreadyTerminal",
            Self::Agent(err) => err.public_kind(),
        }
    }

    pub fn to_execution_error(&self) -> ExecutionError {
        ExecutionError {
            kind: self.public_kind().to_string(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_retryability_follows_status_classes() {
        assert!(AgentError::http(500, "").is_retryable());
        assert!(AgentError::http(503, "").is_retryable());
        assert!(AgentError::http(429, "").is_retryable());
        assert!(AgentError::http(408, "").is_retryable());
        assert!(AgentError::http(425, "").is_retryable());
        assert!(!AgentError::http(400, "").is_retryable());
        assert!(!AgentError::http(404, "").is_retryable());
        assert!(!AgentError::http(422, "").is_retryable());
    }

    #[test]
    fn contract_and_app_errors_are_permanent() {
        assert!(!AgentError::contract("bad json").is_retryable());
        assert!(!AgentError::app("boom").is_retryable());
        assert!(!AgentError::breaker_open().is_retryable());
        assert!(AgentError::timeout().is_retryable());
        assert!(AgentError::network("reset").is_retryable());
    }

    #[test]
    fn breaker_ignores_local_saturation() {
        assert!(AgentError::http(500, "").counts_for_breaker());
        assert!(AgentError::timeout().counts_for_breaker());
        assert!(!AgentError::saturated().counts_for_breaker());
        assert!(!AgentError::breaker_open().counts_for_breaker());
    }
}
