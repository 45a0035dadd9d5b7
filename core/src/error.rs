//! Error types for the request execution engine.
//!
//! # Design
//! Every failure is terminal for the call that produced it: nothing in the
//! engine retries. Each variant carries the URL or pool key involved (and the
//! status code where one was received) so a caller can diagnose the failure
//! without repeating the request.

use std::io;
use std::time::Duration;

/// Which blocking step ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Connect,
    Write,
    Read,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutPhase::Connect => f.write_str("connect"),
            TimeoutPhase::Write => f.write_str("write"),
            TimeoutPhase::Read => f.write_str("read"),
        }
    }
}

/// Errors returned while building, executing or consuming a request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// Opening a new connection failed (DNS, refused, TLS handshake).
    #[error("connect to {key} failed: {source}")]
    ConnectFailed {
        key: String,
        #[source]
        source: io::Error,
    },

    /// A connect, write or read did not complete within its timeout.
    #[error("{phase} timed out for {url}")]
    TimedOut { url: String, phase: TimeoutPhase },

    /// No connection for the key became available before the wait timeout.
    #[error("connection pool exhausted for {key} after waiting {waited:?}")]
    PoolExhausted { key: String, waited: Duration },

    /// The redirect chain was longer than the request allows.
    #[error("too many redirects ({max}) starting at {url}, last status {status}")]
    TooManyRedirects { url: String, max: usize, status: u16 },

    /// The status line, headers or body framing could not be parsed.
    /// `status` is set when the status line itself was readable.
    #[error("malformed response from {url}: {reason}")]
    MalformedResponse {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    /// An interceptor refused to forward the request.
    #[error("interceptor aborted request to {url}: {reason}")]
    InterceptorAborted { url: String, reason: String },

    /// The response body was already read, streamed or discarded.
    #[error("response body from {url} already consumed")]
    BodyAlreadyConsumed { url: String },

    /// The response body could not be decoded into the requested type.
    #[error("decoding response from {url} (HTTP {status}) failed: {message}")]
    DecodeError {
        url: String,
        status: u16,
        message: String,
        body: String,
    },

    /// The request body could not be encoded.
    #[error("encoding request body failed: {0}")]
    EncodeError(String),

    /// Certificate or key material was rejected, or the server certificate
    /// was not trusted.
    #[error("TLS trust error{}: {reason}", key_suffix(.key))]
    TlsTrustError { key: Option<String>, reason: String },

    /// The URL could not be parsed or uses an unsupported scheme.
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Reading from or writing to an established connection failed.
    #[error("transport error talking to {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: io::Error,
    },
}

fn key_suffix(key: &Option<String>) -> String {
    key.as_ref().map(|k| format!(" for {k}")).unwrap_or_default()
}

impl RequestError {
    /// Build the error an interceptor returns when it refuses to forward.
    pub fn interceptor_aborted(url: impl Into<String>, reason: impl Into<String>) -> Self {
        RequestError::InterceptorAborted {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Status code of the response involved, when one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::DecodeError { status, .. } | RequestError::TooManyRedirects { status, .. } => {
                Some(*status)
            }
            RequestError::MalformedResponse { status, .. } => *status,
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::TimedOut { .. })
    }

    /// URL the failing request targeted, when known.
    pub fn url(&self) -> Option<&str> {
        match self {
            RequestError::TimedOut { url, .. }
            | RequestError::TooManyRedirects { url, .. }
            | RequestError::MalformedResponse { url, .. }
            | RequestError::InterceptorAborted { url, .. }
            | RequestError::BodyAlreadyConsumed { url }
            | RequestError::DecodeError { url, .. }
            | RequestError::InvalidUrl { url, .. }
            | RequestError::Transport { url, .. } => Some(url),
            _ => None,
        }
    }

    /// Classify an I/O failure on an established connection.
    pub(crate) fn from_io(url: &str, phase: TimeoutPhase, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => RequestError::TimedOut {
                url: url.to_string(),
                phase,
            },
            io::ErrorKind::InvalidData => RequestError::MalformedResponse {
                url: url.to_string(),
                status: None,
                reason: err.to_string(),
            },
            _ => RequestError::Transport {
                url: url.to_string(),
                source: err,
            },
        }
    }
}
