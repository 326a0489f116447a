//! # Error Types
//!
//! The worker distinguishes three classes of failure:
//!
//! - **Per-request recoverable**: malformed header lines, invalid header values,
//!   cache misses. These resolve to a default/absent value or an `Err` the handler
//!   can inspect; they never end the loop.
//! - **Handler-raised**: a [`HandlerError`] (or a panic) escaping the handler. The
//!   dispatch loop renders a best-effort error response and keeps serving.
//! - **Worker-fatal**: [`FailureKind::Fatal`] handler errors, tainted shared stores,
//!   panicking resource releases. The loop stops admitting units so the supervisor
//!   can recycle the process.

use thiserror::Error;

/// Rejected header or status mutation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Header name is not a valid HTTP token.
    #[error("invalid header name: {0:?}")]
    InvalidName(String),

    /// Header value contains bytes that cannot appear in a field value (CR, LF, NUL).
    #[error("invalid value for header {name}")]
    InvalidValue {
        /// Header the value was destined for
        name: String,
    },

    /// Status code outside the range the operation accepts.
    #[error("invalid status code {0}")]
    InvalidStatus(u16),
}

/// Rejected environment mutation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvError {
    /// Empty names and names containing `=` or NUL cannot be stored.
    #[error("invalid environment variable name: {0:?}")]
    InvalidName(String),

    /// Values containing NUL cannot be stored.
    #[error("invalid value for environment variable {0}")]
    InvalidValue(String),
}

/// Configuration loading failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that was being read
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid YAML for [`crate::config::WorkerConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value parsed but is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// The worker's unit channel is closed; no more requests can be submitted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("worker is no longer accepting requests")]
pub struct SubmitError;

/// Collaborator-side view of a response that did not complete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    /// The worker dropped the response before sending its end marker. Anything
    /// received so far must not be treated as a successful response.
    #[error("connection lost before the response completed (head received: {head_received})")]
    ConnectionLost {
        /// Whether a status line had already been received
        head_received: bool,
    },
}

/// How severe a handler failure is for the worker as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Only this request failed; render an error response and keep serving.
    Request,
    /// Shared state can no longer be trusted; stop admitting units.
    Fatal,
}

/// Failure raised by handler code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    /// Severity classification
    pub kind: FailureKind,
    /// Status for the rendered error response (500 when absent)
    pub status: Option<u16>,
    /// Message for logs; never sent to the client
    pub message: String,
}

impl HandlerError {
    /// Per-request failure rendered as 500.
    pub fn request(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Request,
            status: None,
            message: message.into(),
        }
    }

    /// Per-request failure rendered with the given status.
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Request,
            status: Some(status),
            message: message.into(),
        }
    }

    /// Failure that invalidates the worker's shared state.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            status: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.kind == FailureKind::Fatal
    }

    /// Status used for the error response; anything that is not a 4xx/5xx becomes 500.
    #[must_use]
    pub fn response_status(&self) -> u16 {
        match self.status {
            Some(code) if (400..=599).contains(&code) => code,
            _ => 500,
        }
    }
}

impl From<HeaderError> for HandlerError {
    fn from(err: HeaderError) -> Self {
        HandlerError::request(err.to_string())
    }
}

impl From<EnvError> for HandlerError {
    fn from(err: EnvError) -> Self {
        HandlerError::request(err.to_string())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        HandlerError::request(err.to_string())
    }
}
