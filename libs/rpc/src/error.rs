//! RPC Error Types
//!
//! Failure taxonomy for the client runtime: serialization, network, timeout,
//! remote service errors and a conservative catch-all.

use crate::instance::Instance;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main client error type
#[derive(Error, Debug)]
pub enum RpcError {
    /// Encode/decode failures, never retried by the runtime
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        source: Option<BoxError>,
    },

    /// Connect, send, pool exhaustion and closed-connection failures
    #[error("Network error: {message} (remote: {})", display_remote(.remote))]
    Network {
        message: String,
        remote: Option<Instance>,
        source: Option<BoxError>,
    },

    /// No response within the read timeout
    #[error("Timeout error: {operation} against {} exceeded {timeout_ms}ms (elapsed {elapsed_ms}ms)", display_remote(.remote))]
    Timeout {
        operation: String,
        remote: Option<Instance>,
        timeout_ms: u64,
        elapsed_ms: u64,
    },

    /// The remote reported an application-level error
    #[error("Service error {code}: {message}")]
    Service { code: i32, message: String },

    /// Invalid client configuration
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Anything that does not fit the categories above
    #[error("Unknown error: {message}")]
    Unknown { message: String },
}

fn display_remote(remote: &Option<Instance>) -> String {
    remote
        .as_ref()
        .map(|r| r.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
            source: None,
        }
    }

    /// Create a serialization error with source
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>, remote: Option<Instance>) -> Self {
        Self::Network {
            message: message.into(),
            remote,
            source: None,
        }
    }

    /// Create a network error with source
    pub fn network_with_source(
        message: impl Into<String>,
        remote: Option<Instance>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            message: message.into(),
            remote,
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(
        operation: impl Into<String>,
        remote: Option<Instance>,
        timeout_ms: u64,
        elapsed_ms: u64,
    ) -> Self {
        Self::Timeout {
            operation: operation.into(),
            remote,
            timeout_ms,
            elapsed_ms,
        }
    }

    /// Create a remote service error
    pub fn service(code: i32, message: impl Into<String>) -> Self {
        Self::Service {
            code,
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create an unknown error
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    /// Whether a caller may retry this failure against another instance
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::Network { .. } => true,
            RpcError::Timeout { .. } => true,
            RpcError::Unknown { .. } => true,
            RpcError::Serialization { .. } => false,
            RpcError::Service { .. } => false,
            RpcError::Configuration { .. } => false,
        }
    }

    /// Get error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            RpcError::Serialization { .. } => "serialization",
            RpcError::Network { .. } => "network",
            RpcError::Timeout { .. } => "timeout",
            RpcError::Service { .. } => "service",
            RpcError::Configuration { .. } => "configuration",
            RpcError::Unknown { .. } => "unknown",
        }
    }

    /// Remote instance involved in the failure, when known
    pub fn remote(&self) -> Option<&Instance> {
        match self {
            RpcError::Network { remote, .. } | RpcError::Timeout { remote, .. } => remote.as_ref(),
            _ => None,
        }
    }
}

// Box<dyn Error> is not Clone, so sources are dropped
impl Clone for RpcError {
    fn clone(&self) -> Self {
        match self {
            RpcError::Serialization { message, .. } => RpcError::Serialization {
                message: message.clone(),
                source: None,
            },
            RpcError::Network {
                message, remote, ..
            } => RpcError::Network {
                message: message.clone(),
                remote: remote.clone(),
                source: None,
            },
            RpcError::Timeout {
                operation,
                remote,
                timeout_ms,
                elapsed_ms,
            } => RpcError::Timeout {
                operation: operation.clone(),
                remote: remote.clone(),
                timeout_ms: *timeout_ms,
                elapsed_ms: *elapsed_ms,
            },
            RpcError::Service { code, message } => RpcError::Service {
                code: *code,
                message: message.clone(),
            },
            RpcError::Configuration { message, field } => RpcError::Configuration {
                message: message.clone(),
                field: field.clone(),
            },
            RpcError::Unknown { message } => RpcError::Unknown {
                message: message.clone(),
            },
        }
    }
}

/// Convert standard I/O errors to network errors
impl From<std::io::Error> for RpcError {
    fn from(error: std::io::Error) -> Self {
        RpcError::network_with_source(error.to_string(), None, error)
    }
}

impl From<bincode::Error> for RpcError {
    fn from(error: bincode::Error) -> Self {
        RpcError::serialization_with_source("Binary serialization failed", error)
    }
}

impl From<toml::de::Error> for RpcError {
    fn from(error: toml::de::Error) -> Self {
        RpcError::configuration(format!("TOML configuration error: {}", error), None)
    }
}

/// Why a connection strategy could not hand out a connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    #[error("connection pool exhausted ({max} connections in use)")]
    Exhausted { max: usize },

    #[error("connection strategy is closed")]
    Closed,

    #[error("connect failed: {reason}")]
    ConnectFailed { reason: String },

    #[error("connection is not active and was evicted")]
    NotActive,

    #[error("reconnect throttled: {attempts} attempts within the current window")]
    Throttled { attempts: u32 },
}

impl AcquireError {
    /// Translate into the network failure surfaced to callers
    pub fn into_rpc(self, remote: &Instance) -> RpcError {
        let message = match &self {
            AcquireError::Exhausted { .. } => format!("pool exhausted: {}", self),
            AcquireError::Closed => format!("pool closed: {}", self),
            AcquireError::ConnectFailed { .. } => format!("connect failed: {}", self),
            AcquireError::NotActive => format!("non-active connection evicted: {}", self),
            AcquireError::Throttled { .. } => format!("no connection: {}", self),
        };
        RpcError::network(message, Some(remote.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> Instance {
        Instance::new("10.0.0.7", 9000)
    }

    #[test]
    fn test_error_construction() {
        let err = RpcError::network("Connection refused", Some(remote()));
        assert_eq!(err.category(), "network");
        assert!(err.is_retryable());
        assert_eq!(err.remote(), Some(&remote()));
        assert!(err.to_string().contains("10.0.0.7:9000"));
    }

    #[test]
    fn test_timeout_message_carries_elapsed() {
        let err = RpcError::timeout("call echo.ping", Some(remote()), 100, 103);
        let text = err.to_string();
        assert!(text.contains("100ms"));
        assert!(text.contains("elapsed 103ms"));
        assert!(text.contains("10.0.0.7:9000"));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(RpcError::timeout("x", None, 1, 1).is_retryable());
        assert!(RpcError::unknown("x").is_retryable());
        assert!(!RpcError::serialization("x").is_retryable());
        assert!(!RpcError::service(500, "boom").is_retryable());
        assert!(!RpcError::configuration("x", None).is_retryable());
    }

    #[test]
    fn test_clone_drops_source() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = RpcError::network_with_source("send failed", None, io);
        match err.clone() {
            RpcError::Network { source, message, .. } => {
                assert!(source.is_none());
                assert_eq!(message, "send failed");
            }
            other => panic!("Expected Network error, got {:?}", other),
        }
    }

    #[test]
    fn test_acquire_error_translation() {
        let cases = [
            (AcquireError::Exhausted { max: 4 }, "pool exhausted"),
            (AcquireError::Closed, "pool closed"),
            (
                AcquireError::ConnectFailed {
                    reason: "refused".into(),
                },
                "connect failed",
            ),
            (AcquireError::NotActive, "non-active connection evicted"),
        ];
        for (err, prefix) in cases {
            let rpc = err.into_rpc(&remote());
            assert_eq!(rpc.category(), "network");
            assert!(rpc.to_string().contains(prefix), "{}", rpc);
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "test");
        let err = RpcError::from(io_err);
        assert_eq!(err.category(), "network");
    }
}
