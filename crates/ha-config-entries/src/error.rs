//! Error types for config entries and flows

use std::sync::Arc;

use ha_registries::StorageError;
use thiserror::Error;

/// Errors raised by the config entries manager and its flow managers.
///
/// Only guard-rail errors surface here; failures inside integration hooks
/// are converted to entry state and never reach the caller.
#[derive(Debug, Clone, Error)]
pub enum ConfigEntriesError {
    #[error("Unknown config entry: {0}")]
    UnknownEntry(String),

    #[error("Operation not allowed: {0}")]
    OperationNotAllowed(String),

    #[error("An entry with the id {0} already exists")]
    AlreadyExists(String),

    #[error("No flow handler registered for {0}")]
    UnknownHandler(String),

    #[error("Unknown flow: {0}")]
    UnknownFlow(String),

    #[error("Handler {handler} does not support step {step_id}")]
    UnknownStep { handler: String, step_id: String },

    #[error("Flow initialization cancelled: shutting down")]
    FlowCancelled,

    #[error("Flow {flow_id} failed: {message}")]
    FlowFailed { flow_id: String, message: String },

    #[error("Config entries manager is no longer available")]
    ManagerGone,

    #[error("Storage error: {0}")]
    Storage(Arc<StorageError>),
}

impl From<StorageError> for ConfigEntriesError {
    fn from(err: StorageError) -> Self {
        ConfigEntriesError::Storage(Arc::new(err))
    }
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

/// Outcome of an integration hook that did not succeed.
///
/// Integrations return these from `setup_entry`; the engine maps each to a
/// lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigEntryError {
    /// Transient failure, setup is retried with backoff
    #[error("not ready: {0}")]
    NotReady(String),

    /// Credentials rejected, a reauth flow is started
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Permanent failure, no retry
    #[error("{0}")]
    Fatal(String),

    /// Anything else
    #[error("unexpected error: {0}")]
    Other(String),
}

impl ConfigEntryError {
    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::NotReady(message.into())
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }
}

/// Errors a flow step may return
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// End the flow with an abort result carrying `reason`
    #[error("flow aborted: {reason}")]
    Abort { reason: String },

    #[error("unknown step {0}")]
    UnknownStep(String),

    #[error("{0}")]
    Other(String),
}

impl FlowError {
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: reason.into(),
        }
    }
}
