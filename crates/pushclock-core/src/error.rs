//! Error types for Pushclock.

use thiserror::Error;

/// Errors raised anywhere in the scheduling and delivery pipeline.
#[derive(Debug, Error)]
pub enum PushclockError {
    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    #[error("Unsupported channel: {0}")]
    UnsupportedChannel(String),

    #[error("Invalid {channel} config: missing or empty '{field}'")]
    InvalidChannelConfig { channel: String, field: String },

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Hook failed: {0}")]
    HookFailure(String),

    #[error("Script timeout after {0} seconds")]
    HookTimeout(u64),

    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PushclockError>;

impl PushclockError {
    /// Shorthand for a missing channel config key.
    pub fn missing_field(channel: impl Into<String>, field: impl Into<String>) -> Self {
        Self::InvalidChannelConfig {
            channel: channel.into(),
            field: field.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_channel_config_names_field() {
        let err = PushclockError::missing_field("pushplus", "token");
        assert_eq!(err.to_string(), "Invalid pushplus config: missing or empty 'token'");
    }

    #[test]
    fn test_hook_timeout_message() {
        assert_eq!(
            PushclockError::HookTimeout(30).to_string(),
            "Script timeout after 30 seconds"
        );
    }
}
