//! CLI-specific error types

use std::fmt;
use std::io;

use crate::changefeed::FeedError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file error
    ConfigError,
    /// I/O error (stdout)
    IoError,
    /// Runtime or session could not start
    BootFailed,
    /// Server unreachable
    ConnectFailed,
    /// Query or feed failed
    FeedFailed,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "AERO_CLI_CONFIG_ERROR",
            Self::IoError => "AERO_CLI_IO_ERROR",
            Self::BootFailed => "AERO_CLI_BOOT_FAILED",
            Self::ConnectFailed => "AERO_CLI_CONNECT_FAILED",
            Self::FeedFailed => "AERO_CLI_FEED_FAILED",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    /// Create a new CLI error
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Config error
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    /// I/O error
    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    /// Boot failed
    pub fn boot_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::BootFailed, msg)
    }

    /// Get the error code
    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    /// Get the error code string
    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<FeedError> for CliError {
    fn from(e: FeedError) -> Self {
        let code = match &e {
            FeedError::Config(_) => CliErrorCode::ConfigError,
            FeedError::ConnectionError(_) | FeedError::Timeout(_) => CliErrorCode::ConnectFailed,
            _ => CliErrorCode::FeedFailed,
        };
        Self::new(code, e.to_string())
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_error_mapping() {
        let err: CliError = FeedError::Config("port must be > 0".into()).into();
        assert_eq!(err.code(), &CliErrorCode::ConfigError);

        let err: CliError = FeedError::ConnectionError("refused".into()).into();
        assert_eq!(err.code_str(), "AERO_CLI_CONNECT_FAILED");

        let err: CliError = FeedError::ResourceGone("posts".into()).into();
        assert_eq!(err.code(), &CliErrorCode::FeedFailed);
        assert!(err.message().contains("posts"));
    }

    #[test]
    fn test_display_includes_code() {
        let err = CliError::boot_failed("no runtime");
        assert_eq!(err.to_string(), "AERO_CLI_BOOT_FAILED: no runtime");
    }
}
