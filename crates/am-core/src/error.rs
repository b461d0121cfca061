//! Error types for the application master

use thiserror::Error;

use crate::types::ApplicationId;

/// Result type for AM operations
pub type Result<T> = std::result::Result<T, AmError>;

/// Core error type for AM operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AmError {
    /// No token could be obtained for the application
    #[error("No AM token available for application {0}")]
    MissingCredential(ApplicationId),

    /// Scheduler channel is full; the request stays queued for the next tick
    #[error("Scheduler channel is full")]
    ChannelFull,

    /// Scheduler side of the channel has gone away
    #[error("Scheduler channel is closed")]
    ChannelClosed,

    /// Response could not be matched against local bookkeeping
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// AM container kept failing and the restart budget is spent
    #[error("Application {app_id} exceeded its restart limit after {attempts} attempts")]
    RestartLimitExceeded { app_id: ApplicationId, attempts: u32 },

    /// Workload type has no AM implementation
    #[error("Unsupported workload: {0}")]
    UnsupportedWorkload(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AmError {
    /// Create a protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the caller may simply try again on the next tick
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ChannelFull)
    }
}
