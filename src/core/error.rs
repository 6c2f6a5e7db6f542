use http::Method;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Write,
    Timeout,
    Other,
}

impl TransportErrorKind {
    pub(crate) fn from_io(error: &std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout,
            std::io::ErrorKind::NotFound => Self::Dns,
            std::io::ErrorKind::Unsupported => Self::Tls,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::AddrNotAvailable => Self::Connect,
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::WriteZero => Self::Write,
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::InvalidData => Self::Read,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Write => "write",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    PoolClosed,
    PoolExhausted,
    AcquireTimeout,
    Connect,
    Transport,
    InvalidUri,
    UnsupportedScheme,
    InvalidHeaderName,
    InvalidHeaderValue,
    Serialize,
    Deserialize,
    Configuration,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PoolClosed => "pool_closed",
            Self::PoolExhausted => "pool_exhausted",
            Self::AcquireTimeout => "acquire_timeout",
            Self::Connect => "connect",
            Self::Transport => "transport",
            Self::InvalidUri => "invalid_uri",
            Self::UnsupportedScheme => "unsupported_scheme",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::Serialize => "serialize",
            Self::Deserialize => "deserialize",
            Self::Configuration => "configuration",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("connection pool for {destination} is closed")]
    PoolClosed { destination: String },
    #[error("connection pool for {destination} is exhausted ({max_size} connections in use)")]
    PoolExhausted {
        destination: String,
        max_size: usize,
    },
    #[error("timed out after {timeout_ms}ms waiting for a connection to {destination}")]
    AcquireTimeout {
        destination: String,
        timeout_ms: u128,
    },
    #[error("failed to connect to {destination} ({kind}): {source}")]
    Connect {
        kind: TransportErrorKind,
        destination: String,
        #[source]
        source: BoxError,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("unsupported uri scheme: {scheme}")]
    UnsupportedScheme { scheme: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to encode request json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("invalid client configuration: {message}")]
    Configuration { message: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::PoolClosed { .. } => ErrorCode::PoolClosed,
            Self::PoolExhausted { .. } => ErrorCode::PoolExhausted,
            Self::AcquireTimeout { .. } => ErrorCode::AcquireTimeout,
            Self::Connect { .. } => ErrorCode::Connect,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::UnsupportedScheme { .. } => ErrorCode::UnsupportedScheme,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Serialize { .. } => ErrorCode::Serialize,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::Configuration { .. } => ErrorCode::Configuration,
        }
    }

    /// Transport failures feed the classification pipeline; everything else
    /// is structural and goes straight back to the caller.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Connect { .. })
    }

    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } | Self::Connect { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub(crate) fn connect(error: std::io::Error, destination: &str) -> Self {
        Self::Connect {
            kind: TransportErrorKind::from_io(&error),
            destination: destination.to_owned(),
            source: Box::new(error),
        }
    }

    pub(crate) fn transport(error: std::io::Error, method: &Method, uri: &str) -> Self {
        Self::Transport {
            kind: TransportErrorKind::from_io(&error),
            method: method.clone(),
            uri: uri.to_owned(),
            source: Box::new(error),
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}
