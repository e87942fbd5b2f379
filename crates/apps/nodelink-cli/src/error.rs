//! CLI error types.

use thiserror::Error;

/// CLI result type.
pub type CliResult<T> = Result<T, CliError>;

/// CLI error enum wrapping all crate errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operations error.
    #[error("{0}")]
    Ops(#[from] nodelink_ops::OpsError),

    /// Network error.
    #[error("{0}")]
    Network(#[from] nodelink_net::NetworkError),

    /// Store error.
    #[error("{0}")]
    Store(#[from] nodelink_store::StoreError),

    /// Malformed id or contact.
    #[error("{0}")]
    Types(#[from] nodelink_types::TypesError),

    /// IO error.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// User-facing error with actionable message.
    #[error("{0}")]
    User(String),

    /// Node not initialized.
    #[error("Node not initialized. Run 'nodelink init' first.")]
    NotInitialized,

    /// Node already initialized.
    #[error("Node already initialized at {0}")]
    AlreadyInitialized(String),
}

impl CliError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a user-facing error.
    pub fn user(msg: impl Into<String>) -> Self {
        Self::User(msg.into())
    }

    /// Get the exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            // User errors: 1
            Self::User(_) | Self::NotInitialized | Self::AlreadyInitialized(_) => 1,
            // Bad input: 2
            Self::Types(_) => 2,
            // Config errors: 3
            Self::Config(_) | Self::Toml(_) => 3,
            // Network errors: 5
            Self::Network(_) => 5,
            // Store errors: 6
            Self::Store(_) => 6,
            // Operations errors: 8
            Self::Ops(_) => 8,
            // IO errors: 9
            Self::Io(_) => 9,
            // JSON/format errors: 10
            Self::Json(_) => 10,
        }
    }

    /// Recovery hint shown below the error, if there is one.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Network(e) | Self::Ops(nodelink_ops::OpsError::Network(e)) => Some(e.suggestion()),
            Self::Ops(nodelink_ops::OpsError::NoRoute(_)) => {
                Some("The node is not reachable from here. Check 'nodelink peers' and the static contacts.")
            }
            Self::Types(_) => Some("Contact points are written as transport:host:port, e.g. broker:10.0.0.5:21000."),
            Self::Config(_) | Self::Toml(_) => Some("Check the configuration file, or pass another one with --config."),
            Self::NotInitialized => Some("Run 'nodelink init' to create the data directory and node id."),
            Self::AlreadyInitialized(_) => Some("Set NODELINK_DATA_DIR or [storage] data_dir to use another directory."),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodelink_net::NetworkError;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::NotInitialized.exit_code(), 1);
        assert_eq!(CliError::config("bad").exit_code(), 3);
        assert_eq!(CliError::from(NetworkError::ConnectFailed("refused".into())).exit_code(), 5);
    }

    #[test]
    fn test_network_errors_carry_hint() {
        let err = CliError::from(NetworkError::HandshakeRejected("not accepting".into()));
        assert!(err.hint().unwrap().contains("refused the connection"));

        let wrapped = CliError::from(nodelink_ops::OpsError::from(NetworkError::ConnectFailed("x".into())));
        assert!(wrapped.hint().is_some());

        assert!(CliError::user("plain").hint().is_none());
    }
}
