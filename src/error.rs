//! WolfCluster Error Types

use thiserror::Error;

/// Result type alias for WolfCluster operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfCluster error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Scheme initialization errors
    #[error("Membership scheme initialization failed: {0}")]
    Init(String),

    #[error("Missing required membership scheme parameter '{0}'")]
    MissingParameter(String),

    #[error("Invalid value for membership scheme parameter '{key}': {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("Invalid membership scheme '{name}'. Supported schemes are {supported:?}")]
    UnknownScheme { name: String, supported: Vec<String> },

    // Join errors
    #[error("Failed to join cluster: {0}")]
    Join(String),

    // Send errors
    #[error("Send to member {member} failed: {reason}")]
    Send { member: String, reason: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Listener errors
    #[error("Membership listener '{listener}' failed: {reason}")]
    Listener { listener: String, reason: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Lifecycle errors
    #[error("Coordinator is not running")]
    NotRunning,

    #[error("Coordinator is already running")]
    AlreadyRunning,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Send { .. }
                | Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
        )
    }

    /// Check if this error must abort coordinator startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::ConfigParse(_)
                | Error::Init(_)
                | Error::MissingParameter(_)
                | Error::InvalidParameter { .. }
                | Error::UnknownScheme { .. }
                | Error::Join(_)
        )
    }

    /// Wrap a transport failure as a per-member send error
    pub fn send(member: &str, cause: impl std::fmt::Display) -> Self {
        Error::Send {
            member: member.to_string(),
            reason: cause.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::send("node-2", "refused").is_retryable());
        assert!(Error::ConnectionTimeout("10.0.0.2:4000".into()).is_retryable());
        assert!(!Error::send("node-2", "refused").is_fatal());

        assert!(Error::MissingParameter("tag.key".into()).is_fatal());
        assert!(Error::Join("directory unreachable".into()).is_fatal());
        assert!(!Error::Listener {
            listener: "audit".into(),
            reason: "boom".into(),
        }
        .is_fatal());
    }

    #[test]
    fn test_unknown_scheme_message_lists_supported() {
        let err = Error::UnknownScheme {
            name: "multicast".into(),
            supported: vec!["broadcast".into(), "tag".into(), "wka".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("multicast"));
        assert!(msg.contains("wka"));
    }
}
