use std::fmt;

/// All error types produced by the proxy core.
#[derive(Debug)]
pub enum ProxyError {
    /// Config file missing, unreadable, or failed to parse.
    Config(String),

    /// An I/O error (file read, listen bind, etc.).
    Io(std::io::Error),

    /// Descriptor construction or lookup failed (bad descriptor set, reflection
    /// failure with no fallback, unresolved import).
    Descriptor(String),

    /// The backend does not support gRPC Server Reflection.
    ReflectionUnavailable,

    /// Key/certificate loading or a crypto operation failed.
    Crypto(String),

    /// A gRPC status surfaced from the transport (dial failure, stream error).
    Transport(tonic::Status),

    /// Any other error.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Config(msg) => write!(f, "config error: {msg}"),
            ProxyError::Io(err) => write!(f, "I/O error: {err}"),
            ProxyError::Descriptor(msg) => write!(f, "descriptor error: {msg}"),
            ProxyError::ReflectionUnavailable => {
                write!(f, "backend does not support the reflection API")
            }
            ProxyError::Crypto(msg) => write!(f, "crypto error: {msg}"),
            ProxyError::Transport(status) => {
                write!(f, "transport error: {} - {}", status.code(), status.message())
            }
            ProxyError::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Io(err) => Some(err),
            ProxyError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(err)
    }
}

impl From<tonic::Status> for ProxyError {
    fn from(status: tonic::Status) -> Self {
        ProxyError::Transport(status)
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::Config(err.to_string())
    }
}

/// Convenience type alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn is_transport_not_found(err: &ProxyError) -> bool {
        matches!(err, ProxyError::Transport(status) if status.code() == tonic::Code::NotFound)
    }

    #[test]
    fn transport_not_found_detected() {
        let status = tonic::Status::not_found("service not found");
        let err = ProxyError::Transport(status);
        assert!(is_transport_not_found(&err));
    }

    #[test]
    fn other_errors_not_detected_as_transport_not_found() {
        let err = ProxyError::Config("bad input".into());
        assert!(!is_transport_not_found(&err));

        let err = ProxyError::ReflectionUnavailable;
        assert!(!is_transport_not_found(&err));
    }

    #[test]
    fn display_formatting() {
        let err = ProxyError::Descriptor("no such method".into());
        assert_eq!(err.to_string(), "descriptor error: no such method");

        let err = ProxyError::ReflectionUnavailable;
        assert_eq!(
            err.to_string(),
            "backend does not support the reflection API"
        );
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: ProxyError = io_err.into();
        assert!(matches!(err, ProxyError::Io(_)));
    }
}
