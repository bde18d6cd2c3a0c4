use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Boxed, thread-safe error used as the preserved cause of transport faults.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Phase in which a timeout fired.
///
/// Each phase is configured and enforced independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TimeoutKind {
    /// DNS lookup, TCP connect, proxy tunnel or TLS handshake took too long
    Connect,
    /// No bytes were read from the socket within `socket_timeout`
    Socket,
    /// A pooled connection could not be leased within `request_timeout`
    Request,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutKind::Connect => "connect",
            TimeoutKind::Socket => "socket",
            TimeoutKind::Request => "request",
        })
    }
}

/// Classification of socket-level faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SocketFaultKind {
    /// The remote end refused the TCP connection
    Refused,
    /// The connection was closed or reset before any response byte arrived.
    ///
    /// This is the typical outcome of reusing a keep-alive connection the
    /// server has already dropped, and the only fault retried by default.
    ClosedBeforeResponse,
    /// Any other socket failure (reset while reading, broken pipe, ...)
    Other,
}

impl fmt::Display for SocketFaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SocketFaultKind::Refused => "connection refused",
            SocketFaultKind::ClosedBeforeResponse => "connection closed before response",
            SocketFaultKind::Other => "socket fault",
        })
    }
}

/// HTTP client error types
///
/// Every transport variant keeps the low-level cause reachable through
/// [`std::error::Error::source`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// Invalid option value (bad `verify` mode, malformed query, unreadable key material)
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Something about the request is flat out malformed (bad URL, bad header, bad port)
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        message: String,
        #[source]
        source: BoxError,
    },

    /// The response stream was released before the body was read
    #[error("Could not read from stream: {message} (did you forget to read the body inside the handler?)")]
    StreamClosed { message: String },

    /// TLS handshake or HTTP protocol failure
    #[error("Protocol error: {0}")]
    ClientProtocol(#[source] BoxError),

    /// DNS resolution failure
    #[error("Failed to resolve host '{host}': {source}")]
    ResolutionFailure {
        host: String,
        #[source]
        source: BoxError,
    },

    /// The client has been closed and can no longer issue requests
    #[error("Client has been closed")]
    ClientStopped,

    /// Socket breaks, refusals, resets
    #[error("Socket error ({kind}): {source}")]
    Socket {
        kind: SocketFaultKind,
        #[source]
        source: BoxError,
    },

    /// A per-phase timeout fired
    #[error("{kind} timeout after {duration:?}")]
    Timeout {
        kind: TimeoutKind,
        duration: Duration,
        #[source]
        source: BoxError,
    },

    /// Anything we did not recognize; the original cause is preserved
    #[error("Unknown error: {0}")]
    Unknown(#[source] BoxError),
}

impl HttpError {
    pub(crate) fn invalid_argument(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        HttpError::InvalidArgument {
            message: message.into(),
            source: source.into(),
        }
    }

    pub(crate) fn timeout(kind: TimeoutKind, duration: Duration, source: impl Into<BoxError>) -> Self {
        HttpError::Timeout {
            kind,
            duration,
            source: source.into(),
        }
    }

    /// Returns the timeout phase if this is a timeout error
    #[must_use]
    pub fn timeout_kind(&self) -> Option<TimeoutKind> {
        match self {
            HttpError::Timeout { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns the socket fault classification if this is a socket error
    #[must_use]
    pub fn socket_kind(&self) -> Option<SocketFaultKind> {
        match self {
            HttpError::Socket { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// The same classification again, with the cause flattened to text.
    ///
    /// Used to report a body fault on every later read of that body.
    pub(crate) fn replay(&self) -> HttpError {
        let cause = || -> BoxError {
            std::error::Error::source(self)
                .map_or_else(|| self.to_string(), ToString::to_string)
                .into()
        };
        match self {
            HttpError::Config(message) => HttpError::Config(message.clone()),
            HttpError::InvalidArgument { message, .. } => HttpError::InvalidArgument {
                message: message.clone(),
                source: cause(),
            },
            HttpError::StreamClosed { message } => HttpError::StreamClosed {
                message: message.clone(),
            },
            HttpError::ClientProtocol(_) => HttpError::ClientProtocol(cause()),
            HttpError::ResolutionFailure { host, .. } => HttpError::ResolutionFailure {
                host: host.clone(),
                source: cause(),
            },
            HttpError::ClientStopped => HttpError::ClientStopped,
            HttpError::Socket { kind, .. } => HttpError::Socket {
                kind: *kind,
                source: cause(),
            },
            HttpError::Timeout { kind, duration, .. } => HttpError::timeout(*kind, *duration, cause()),
            HttpError::Unknown(_) => HttpError::Unknown(cause()),
        }
    }

    /// True for faults that happened before any response byte was received.
    ///
    /// Only these are safe to replay transparently.
    #[must_use]
    pub fn is_pre_response_fault(&self) -> bool {
        matches!(
            self,
            HttpError::Socket {
                kind: SocketFaultKind::ClosedBeforeResponse,
                ..
            }
        )
    }
}

/// Classify an I/O error raised by a socket operation.
pub(crate) fn classify_io(err: std::io::Error) -> HttpError {
    use std::io::ErrorKind;

    let kind = match err.kind() {
        ErrorKind::ConnectionRefused => SocketFaultKind::Refused,
        ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::NotConnected => SocketFaultKind::Other,
        ErrorKind::InvalidData => return HttpError::ClientProtocol(Box::new(err)),
        _ => return HttpError::Unknown(Box::new(err)),
    };
    HttpError::Socket {
        kind,
        source: Box::new(err),
    }
}

/// Recover an `HttpError` that travelled through a boxed body or tower error.
pub(crate) fn from_boxed(err: BoxError) -> HttpError {
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(other) => match other.downcast::<std::io::Error>() {
            Ok(io) => classify_io(*io),
            Err(other) => HttpError::Unknown(other),
        },
    }
}

impl From<http::Error> for HttpError {
    fn from(err: http::Error) -> Self {
        HttpError::invalid_argument("failed to build request", err)
    }
}

impl From<http::header::InvalidHeaderName> for HttpError {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        HttpError::invalid_argument("invalid header name", err)
    }
}

impl From<http::header::InvalidHeaderValue> for HttpError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        HttpError::invalid_argument("invalid header value", err)
    }
}

impl From<url::ParseError> for HttpError {
    fn from(err: url::ParseError) -> Self {
        HttpError::invalid_argument("invalid URL", err)
    }
}

impl From<serde_urlencoded::ser::Error> for HttpError {
    fn from(err: serde_urlencoded::ser::Error) -> Self {
        HttpError::invalid_argument("form encoding failed", err)
    }
}

impl From<serde_json::Error> for HttpError {
    fn from(err: serde_json::Error) -> Self {
        HttpError::Config(err.to_string())
    }
}

impl From<figment::Error> for HttpError {
    fn from(err: figment::Error) -> Self {
        HttpError::Config(err.to_string())
    }
}
