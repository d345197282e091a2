//! Structured error taxonomy shared by every component.
//!
//! Every fallible operation in netkit returns [`NetResult<T>`], carrying
//! either the success payload or a [`NetworkError`] with a machine-readable
//! [`ErrorCode`], a human message, the source tag of the component that
//! produced it, and optional details. Details may include addresses and ports
//! but never key material or payload bytes.

use std::fmt;
use thiserror::Error;

/// Machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Common codes
    InvalidArgument,
    NotFound,
    PermissionDenied,
    Timeout,
    Cancelled,
    NotInitialized,
    AlreadyExists,
    OutOfMemory,
    IoError,
    NetworkError,
    InternalError,
    // Network-specific codes
    ConnectionFailed,
    ConnectionRefused,
    ConnectionTimeout,
    ConnectionClosed,
    SendFailed,
    ReceiveFailed,
    ServerNotStarted,
    ServerAlreadyRunning,
    BindFailed,
    StreamLimit,
    HandshakeFailed,
}

impl ErrorCode {
    /// Stable string form used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::NotFound => "not_found",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::NotInitialized => "not_initialized",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::OutOfMemory => "out_of_memory",
            ErrorCode::IoError => "io_error",
            ErrorCode::NetworkError => "network_error",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::ConnectionFailed => "connection_failed",
            ErrorCode::ConnectionRefused => "connection_refused",
            ErrorCode::ConnectionTimeout => "connection_timeout",
            ErrorCode::ConnectionClosed => "connection_closed",
            ErrorCode::SendFailed => "send_failed",
            ErrorCode::ReceiveFailed => "receive_failed",
            ErrorCode::ServerNotStarted => "server_not_started",
            ErrorCode::ServerAlreadyRunning => "server_already_running",
            ErrorCode::BindFailed => "bind_failed",
            ErrorCode::StreamLimit => "stream_limit",
            ErrorCode::HandshakeFailed => "handshake_failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error value returned by every fallible netkit operation.
///
/// The `component` field is the taxonomy's source tag (e.g.
/// "tcp_server:main"); it is not named `source` because that name would be
/// claimed by the derived `Error::source` chain, which this flat error type
/// does not carry.
#[derive(Debug, Clone, Error)]
#[error("[{component}] {code}: {message}{}", details_suffix(.details))]
pub struct NetworkError {
    /// Error classification
    pub code: ErrorCode,
    /// Human-readable description; never empty
    pub message: String,
    /// Source tag of the component that produced the error
    pub component: String,
    /// Optional extra context; addresses and ports only, never secrets
    pub details: Option<String>,
}

fn details_suffix(details: &Option<String>) -> String {
    match details {
        Some(details) => format!(" ({details})"),
        None => String::new(),
    }
}

impl NetworkError {
    /// Creates an error tagged with the producing component. An empty message
    /// is replaced by the code's string form so that every error carries a
    /// non-empty message.
    pub fn new(
        code: ErrorCode,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let message = if message.is_empty() {
            code.as_str().to_string()
        } else {
            message
        };
        Self {
            code,
            message,
            component: source.into(),
            details: None,
        }
    }

    /// Attaches extra context to the error.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// The source tag identifying the component that produced the error.
    pub fn source_tag(&self) -> &str {
        &self.component
    }

    /// True for the quiet-exit cancellation code.
    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }

    pub fn invalid_argument(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, source, message)
    }

    pub fn already_exists(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, source, message)
    }

    pub fn cancelled(source: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, source, "operation cancelled")
    }

    pub fn connection_closed(source: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionClosed, source, "connection is closed")
    }

    pub fn internal(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, source, message)
    }

    /// Maps an I/O error from the named operation onto the taxonomy.
    pub fn from_io(source: impl Into<String>, op: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match err.kind() {
            ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ErrorCode::ConnectionClosed
            }
            ErrorKind::TimedOut => ErrorCode::ConnectionTimeout,
            ErrorKind::AddrInUse | ErrorKind::AddrNotAvailable | ErrorKind::PermissionDenied
                if op == "bind" =>
            {
                ErrorCode::BindFailed
            }
            ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            ErrorKind::NotFound => ErrorCode::NotFound,
            ErrorKind::InvalidInput => ErrorCode::InvalidArgument,
            ErrorKind::OutOfMemory => ErrorCode::OutOfMemory,
            ErrorKind::Interrupted => ErrorCode::Cancelled,
            _ => ErrorCode::IoError,
        };
        Self::new(code, source, format!("{op} failed: {err}"))
    }
}

/// Result alias used across the crate.
pub type NetResult<T> = Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_never_empty() {
        let err = NetworkError::new(ErrorCode::SendFailed, "tcp_client:a", "");
        assert_eq!(err.message, "send_failed");
        let err = NetworkError::new(ErrorCode::SendFailed, "tcp_client:a", "socket gone");
        assert_eq!(err.message, "socket gone");
    }

    #[test]
    fn display_includes_source_code_and_details() {
        let err = NetworkError::invalid_argument("udp_client:x", "host is empty")
            .with_details("port=9000");
        let text = err.to_string();
        assert!(text.contains("udp_client:x"));
        assert!(text.contains("invalid_argument"));
        assert!(text.contains("host is empty"));
        assert!(text.contains("port=9000"));
    }

    #[test]
    fn display_without_details_has_no_suffix() {
        let err = NetworkError::connection_closed("ws_client:x");
        assert_eq!(err.to_string(), "[ws_client:x] connection_closed: connection is closed");
    }

    #[test]
    fn source_tag_names_the_component() {
        let err = NetworkError::internal("quic_server:main", "boom");
        assert_eq!(err.source_tag(), "quic_server:main");
        // The flat error carries no cause chain.
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn io_error_mapping() {
        let err = NetworkError::from_io(
            "tcp_client:x",
            "connect",
            std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        );
        assert_eq!(err.code, ErrorCode::ConnectionRefused);

        let err = NetworkError::from_io(
            "tcp_server:x",
            "bind",
            std::io::Error::from(std::io::ErrorKind::AddrInUse),
        );
        assert_eq!(err.code, ErrorCode::BindFailed);
    }

    #[test]
    fn cancelled_is_quiet_exit() {
        assert!(NetworkError::cancelled("ws_client:x").is_cancelled());
        assert!(!NetworkError::connection_closed("ws_client:x").is_cancelled());
    }
}
