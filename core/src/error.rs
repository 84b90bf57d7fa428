//! Configuration validation errors

use thiserror::Error;

/// Raised when the service configuration cannot be accepted at startup.
/// Always fatal: the process refuses to start on an invalid config.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("missing required field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}
