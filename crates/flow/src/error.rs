//! Error types for the flow engine
//!
//! `FlowError` is returned by every fallible engine operation. `ExecutionError`
//! is not a Rust error path: it is the serializable payload carried in
//! `content.error` when a behaviour fails and the failure travels as an
//! `execute.error` message.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result type alias using FlowError
pub type Result<T> = std::result::Result<T, FlowError>;

/// Errors raised by the broker model
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum BrokerError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue {0} already has a consumer")]
    ExclusiveConsumer(String),
}

/// Errors from the behaviour registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No behaviour registered for element type: {0}")]
    UnknownType(String),

    #[error("Behaviour factory failed for {element_id}: {message}")]
    Factory { element_id: String, message: String },
}

/// Errors from expression resolution
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ExpressionError {
    #[error("Malformed expression: {0}")]
    Malformed(String),
}

/// Main error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Api requires a source message")]
    MissingMessage,

    #[error("Message for {0} has no execution id")]
    MissingExecutionId(String),

    #[error("{0} is not running")]
    NotRunning(String),

    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("{0} has no executable children")]
    Fatal(String),

    #[error("Unknown element: {0}")]
    UnknownElement(String),
}

impl FlowError {
    /// Create a not-running error
    pub fn not_running(id: impl Into<String>) -> Self {
        Self::NotRunning(id.into())
    }

    /// Create an unknown-element error
    pub fn unknown_element(id: impl Into<String>) -> Self {
        Self::UnknownElement(id.into())
    }
}

/// Behaviour-level failure wrapped with the offending element id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    /// Id of the element that failed
    pub source_id: String,

    /// Error message
    pub message: String,

    /// Inner cause chain, outermost first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<String>,

    /// Set when the failure cannot be retried or resumed
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fatal: bool,
}

impl ExecutionError {
    /// Create a new execution error
    pub fn new(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            message: message.into(),
            inner: None,
            fatal: false,
        }
    }

    /// Wrap an error returned by a behaviour
    pub fn wrap(source_id: impl Into<String>, err: &anyhow::Error) -> Self {
        let causes: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
        Self {
            source_id: source_id.into(),
            message: err.to_string(),
            inner: (!causes.is_empty()).then(|| causes.join(": ")),
            fatal: false,
        }
    }

    /// Create a fatal error
    pub fn fatal(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            fatal: true,
            ..Self::new(source_id, message)
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.source_id, self.message)?;
        if let Some(inner) = &self.inner {
            write!(f, ": {}", inner)?;
        }
        Ok(())
    }
}

impl std::error::Error for ExecutionError {}
