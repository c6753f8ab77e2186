use std::time::Duration;

use http::Method;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Closed,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Closed => "closed",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Where a timeout fired.
///
/// `Connect` and `Attempt` are per-attempt limits and are retried. `Deadline`
/// is the call-level deadline and `PoolAcquire` is local pool saturation;
/// both end the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutPhase {
    Connect,
    PoolAcquire,
    Attempt,
    Deadline,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connect => "connect",
            Self::PoolAcquire => "pool_acquire",
            Self::Attempt => "attempt",
            Self::Deadline => "deadline",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidConfig,
    InvalidInput,
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    SerializeQuery,
    RequestBuild,
    ConnectionFailure,
    Timeout,
    RateLimited,
    ServerFailure,
    ClientRejected,
    AuthenticationFailure,
    AmbiguousOutcome,
    Cancelled,
    ReadBody,
    ResponseBodyTooLarge,
    Deserialize,
    RuntimeInit,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidConfig => "invalid_config",
            Self::InvalidInput => "invalid_input",
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::SerializeQuery => "serialize_query",
            Self::RequestBuild => "request_build",
            Self::ConnectionFailure => "connection_failure",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ServerFailure => "server_failure",
            Self::ClientRejected => "client_rejected",
            Self::AuthenticationFailure => "authentication_failure",
            Self::AmbiguousOutcome => "ambiguous_outcome",
            Self::Cancelled => "cancelled",
            Self::ReadBody => "read_body",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::Deserialize => "deserialize",
            Self::RuntimeInit => "runtime_init",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid client configuration for {field}: {message}")]
    InvalidConfig { field: &'static str, message: String },
    #[error("invalid input for {field}: {message}")]
    InvalidInput { field: &'static str, message: String },
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
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
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request query: {source}")]
    SerializeQuery {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("connection failure ({kind}) for {method} {uri}: {source}")]
    ConnectionFailure {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        request_sent: bool,
        #[source]
        source: BoxError,
    },
    #[error("request timed out in {phase} after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        phase: TimeoutPhase,
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("rate limited by server for {method} {uri}: {message}")]
    RateLimited {
        method: Method,
        uri: String,
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("server failure {status} for {method} {uri}: {message}")]
    ServerFailure {
        status: u16,
        method: Method,
        uri: String,
        message: String,
    },
    #[error("request rejected with {status} for {method} {uri}: {message}")]
    ClientRejected {
        status: u16,
        method: Method,
        uri: String,
        message: String,
    },
    #[error("authentication failed with {status} for {method} {uri}: {message}")]
    AuthenticationFailure {
        status: u16,
        method: Method,
        uri: String,
        message: String,
    },
    #[error("outcome unknown after {attempts} attempt(s) for {method} {uri}: {source}")]
    AmbiguousOutcome {
        method: Method,
        uri: String,
        attempts: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("call cancelled after {attempts} attempt(s) for {method} {uri}")]
    Cancelled {
        method: Method,
        uri: String,
        attempts: usize,
        outcome_unknown: bool,
    },
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: BoxError,
    },
    #[error(
        "response body too large ({actual_bytes} bytes > {limit_bytes} bytes) for {method} {uri}"
    )]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("failed to start blocking runtime: {source}")]
    RuntimeInit {
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::InvalidInput { .. } => ErrorCode::InvalidInput,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Serialize { .. } => ErrorCode::SerializeJson,
            Self::SerializeQuery { .. } => ErrorCode::SerializeQuery,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::ConnectionFailure { .. } => ErrorCode::ConnectionFailure,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::ServerFailure { .. } => ErrorCode::ServerFailure,
            Self::ClientRejected { .. } => ErrorCode::ClientRejected,
            Self::AuthenticationFailure { .. } => ErrorCode::AuthenticationFailure,
            Self::AmbiguousOutcome { .. } => ErrorCode::AmbiguousOutcome,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::RuntimeInit { .. } => ErrorCode::RuntimeInit,
        }
    }

    /// HTTP status reported by the server, when the failure carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(429),
            Self::ServerFailure { status, .. }
            | Self::ClientRejected { status, .. }
            | Self::AuthenticationFailure { status, .. } => Some(*status),
            Self::AmbiguousOutcome { source, .. } => source.status(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ClientRejected { status: 404, .. })
    }

    /// Whether a single occurrence of this failure is worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailure { .. }
            | Self::RateLimited { .. }
            | Self::ServerFailure { .. } => true,
            Self::Timeout { phase, .. } => {
                matches!(phase, TimeoutPhase::Connect | TimeoutPhase::Attempt)
            }
            _ => false,
        }
    }

    /// The request may have reached the server without a definitive answer.
    pub(crate) fn is_ambiguous(&self) -> bool {
        match self {
            Self::ConnectionFailure { request_sent, .. } => *request_sent,
            Self::Timeout { phase, .. } => {
                matches!(phase, TimeoutPhase::Attempt | TimeoutPhase::Deadline)
            }
            _ => false,
        }
    }

    pub(crate) fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Attempts made by the logical call, when the error records them.
    pub fn attempts(&self) -> Option<usize> {
        match self {
            Self::AmbiguousOutcome { attempts, .. } | Self::Cancelled { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }
}
