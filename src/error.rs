//! Error types for request handling
//!
//! Every handler returns `SelectError`. Failures that reach the outer boundary
//! are wrapped with `SelectError::Context` so the message carries the query and
//! the time range needed to reproduce the request.

use thiserror::Error;

use crate::query::parser::ParseError;

/// Main error type for the query front end
#[derive(Error, Debug)]
pub enum SelectError {
    /// A required request argument is absent
    #[error("missing `{0}` arg")]
    MissingArg(String),

    /// A request argument could not be parsed or is out of range
    #[error("cannot parse `{name}` arg {value:?}: {reason}")]
    InvalidArg {
        name: String,
        value: String,
        reason: String,
    },

    /// The query string is longer than the configured ceiling
    #[error("too long query; got {len} bytes; mustn't exceed `max_query_len={max}` bytes")]
    QueryTooLong { len: usize, max: usize },

    /// Selector or duration syntax error
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// At least one storage node did not answer and partial responses are denied
    #[error("cannot return full response, since some of storage nodes are unavailable")]
    IncompleteCluster,

    /// The request deadline expired while waiting for storage nodes
    #[error("{0}")]
    Timeout(String),

    /// The expression evaluator rejected the query
    #[error("cannot execute query: {0}")]
    Evaluation(String),

    /// The requested range would produce too many points per series
    #[error("too many points for the given step={step}, start={start} and end={end}: {points}; cannot exceed {max}")]
    TooManyPoints {
        start: i64,
        end: i64,
        step: i64,
        points: i64,
        max: i64,
    },

    /// A storage node reported a failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Work was cancelled before completion
    #[error("query cancelled")]
    Cancelled,

    /// Transport write failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure of an outgoing HTTP call
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response serialization failure
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error annotated with the request it happened in
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<SelectError>,
    },
}

impl SelectError {
    /// Wraps the error with a description of the failing request
    pub fn context(self, context: impl Into<String>) -> Self {
        SelectError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, skipping context wrappers
    pub fn root(&self) -> &SelectError {
        match self {
            SelectError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Reports whether this is the partial-response escalation
    pub fn is_incomplete_cluster(&self) -> bool {
        matches!(self.root(), SelectError::IncompleteCluster)
    }

    /// Reports whether the deadline expired
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), SelectError::Timeout(_))
    }

    pub(crate) fn invalid_arg(
        name: impl Into<String>,
        value: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        SelectError::InvalidArg {
            name: name.into(),
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for request handling
pub type SelectResult<T> = Result<T, SelectError>;
