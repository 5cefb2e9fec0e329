use thiserror::Error;

use super::lexer::LexerError;
use crate::storage::data::NAME_LABEL;
use crate::storage::search::{TagFilter, TagFilterOp};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Lexer(#[from] LexerError),
    #[error("unexpected token at position {pos}: expected {expected}, found {found}")]
    UnexpectedToken {
        expected: &'static str,
        found: String,
        pos: usize,
    },
    #[error("unexpected end of input: expected {0}")]
    UnexpectedEnd(&'static str),
    #[error("selector must contain a metric name or at least one label matcher")]
    EmptySelector,
    #[error("cannot parse duration {0:?}")]
    InvalidDuration(String),
    #[error("duration must be positive; got {0:?}")]
    NegativeDuration(String),
    #[error("invalid regexp {value:?}: {reason}")]
    InvalidRegex { value: String, reason: String },
}

/// One `label op "value"` clause inside braces
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMatcher {
    pub label: String,
    pub op: TagFilterOp,
    pub value: String,
}

/// A parsed `name{label="value",...}` selector
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    pub metric_name: Option<String>,
    pub matchers: Vec<LabelMatcher>,
}

impl Selector {
    /// Compiles the selector into a conjunction of tag filters.
    /// Filters on the metric name come first.
    pub fn into_tag_filters(self) -> Result<Vec<TagFilter>, ParseError> {
        let mut filters = Vec::with_capacity(self.matchers.len() + 1);
        if let Some(name) = self.metric_name {
            filters.push(TagFilter::eq(NAME_LABEL, name));
        }
        for m in self.matchers {
            let tf = TagFilter::new(m.label, m.op, m.value.clone()).map_err(|e| {
                ParseError::InvalidRegex {
                    value: m.value,
                    reason: e.to_string(),
                }
            })?;
            filters.push(tf);
        }
        // Stable sort keeps the written order among the remaining filters
        filters.sort_by_key(|tf| tf.key != NAME_LABEL);
        Ok(filters)
    }
}

/// Trailing `[window]` or `[window:step]` of a query plus an optional offset
#[derive(Debug, Clone, PartialEq)]
pub struct RollupSuffix<'a> {
    /// Expression the window applies to
    pub child: &'a str,
    pub window: String,
    /// `Some` for subquery syntax; empty when the step is omitted (`[5m:]`)
    pub step: Option<String>,
    pub offset: Option<String>,
}
