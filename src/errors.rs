use std::fmt;
use std::path::PathBuf;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for agent operations
#[derive(Debug)]
pub enum Error {
    /// Environment variable related errors
    Environment { variable: String, message: String },

    /// Secret resolution errors (boxed-value parsing and credential store access)
    SecretResolution { reference: String, message: String },

    /// Command execution errors
    CommandExecution {
        command: String,
        message: String,
        exit_code: Option<i32>,
    },

    /// A script exceeded the task deadline
    Timeout { command: String },

    /// RPC errors against the controller
    Rpc { method: String, message: String },

    /// Repository materialisation errors
    Git { message: String },

    /// HTTP transfer errors (credential store, cache host)
    Http { url: String, message: String },

    /// File system operations
    FileSystem {
        path: PathBuf,
        operation: String,
        source: std::io::Error,
    },

    /// JSON serialization/deserialization errors
    Json {
        message: String,
        source: serde_json::Error,
    },

    /// Configuration errors
    Configuration { message: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Environment { variable, message } => {
                write!(f, "environment variable '{variable}' error: {message}")
            }
            Error::SecretResolution { reference, message } => {
                write!(f, "failed to resolve secret '{reference}': {message}")
            }
            Error::CommandExecution {
                command,
                message,
                exit_code,
            } => match exit_code {
                Some(code) => {
                    write!(
                        f,
                        "command '{command}' failed with exit code {code}: {message}"
                    )
                }
                None => write!(f, "command '{command}' failed: {message}"),
            },
            Error::Timeout { command } => {
                write!(f, "command '{command}' timed out")
            }
            Error::Rpc { method, message } => {
                write!(f, "RPC '{method}' failed: {message}")
            }
            Error::Git { message } => {
                write!(f, "git error: {message}")
            }
            Error::Http { url, message } => {
                write!(f, "HTTP request to '{url}' failed: {message}")
            }
            Error::FileSystem {
                path,
                operation,
                source,
            } => {
                write!(
                    f,
                    "file system {} operation failed for '{}': {}",
                    operation,
                    path.display(),
                    source
                )
            }
            Error::Json { message, .. } => {
                write!(f, "JSON error: {message}")
            }
            Error::Configuration { message } => {
                write!(f, "configuration error: {message}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::FileSystem { source, .. } => Some(source),
            Error::Json { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::FileSystem {
            path: PathBuf::new(),
            operation: "unknown".to_string(),
            source: error,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Json {
            message: error.to_string(),
            source: error,
        }
    }
}

impl From<git2::Error> for Error {
    fn from(error: git2::Error) -> Self {
        Error::Git {
            message: error.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Http {
            url: error.url().map(|u| u.to_string()).unwrap_or_default(),
            message: error.to_string(),
        }
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Rpc {
            method: "unknown".to_string(),
            message: status.to_string(),
        }
    }
}

// Helper methods for creating errors with context
impl Error {
    /// Create an environment variable error
    #[must_use]
    pub fn environment(variable: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Environment {
            variable: variable.into(),
            message: message.into(),
        }
    }

    /// Create a secret resolution error
    #[must_use]
    pub fn secret_resolution(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Error::SecretResolution {
            reference: reference.into(),
            message: message.into(),
        }
    }

    /// Create a command execution error
    #[must_use]
    pub fn command_execution(
        command: impl Into<String>,
        message: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Error::CommandExecution {
            command: command.into(),
            message: message.into(),
            exit_code,
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(command: impl Into<String>) -> Self {
        Error::Timeout {
            command: command.into(),
        }
    }

    /// Create an RPC error
    #[must_use]
    pub fn rpc(method: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Rpc {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Create a git error
    #[must_use]
    pub fn git(message: impl Into<String>) -> Self {
        Error::Git {
            message: message.into(),
        }
    }

    /// Create an HTTP error
    #[must_use]
    pub fn http(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Http {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a file system error with context
    #[must_use]
    pub fn file_system(
        path: impl Into<PathBuf>,
        operation: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Error::FileSystem {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    /// Whether this error is the dedicated deadline-expiry outcome
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
