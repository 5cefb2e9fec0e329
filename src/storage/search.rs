//! Search request representation shared with the storage fan-out

use regex::Regex;
use std::fmt;

use crate::storage::data::{MetricName, NAME_LABEL};

/// Tenant scope of a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AuthToken {
    pub account_id: u32,
    pub project_id: u32,
}

impl AuthToken {
    pub fn new(account_id: u32, project_id: u32) -> Self {
        Self {
            account_id,
            project_id,
        }
    }
}

/// Inclusive time range in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

impl TimeRange {
    pub fn new(min_timestamp: i64, max_timestamp: i64) -> Self {
        Self {
            min_timestamp,
            max_timestamp,
        }
    }

    /// Range that covers every timestamp
    pub fn all() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.min_timestamp && timestamp <= self.max_timestamp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagFilterOp {
    Eq,
    Neq,
    Regex,
    NotRegex,
}

impl TagFilterOp {
    fn as_str(&self) -> &'static str {
        match self {
            TagFilterOp::Eq => "=",
            TagFilterOp::Neq => "!=",
            TagFilterOp::Regex => "=~",
            TagFilterOp::NotRegex => "!~",
        }
    }
}

/// A single label constraint
#[derive(Debug, Clone)]
pub struct TagFilter {
    pub key: String,
    pub op: TagFilterOp,
    pub value: String,
    re: Option<Regex>,
}

impl TagFilter {
    /// Creates a filter; regex values are anchored to match the whole label value
    pub fn new(
        key: impl Into<String>,
        op: TagFilterOp,
        value: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        let value = value.into();
        let re = match op {
            TagFilterOp::Regex | TagFilterOp::NotRegex => {
                Some(Regex::new(&format!("^(?:{})$", value))?)
            }
            _ => None,
        };
        Ok(Self {
            key: key.into(),
            op,
            value,
            re,
        })
    }

    /// Shorthand for an equality filter
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: TagFilterOp::Eq,
            value: value.into(),
            re: None,
        }
    }

    /// A missing label matches as the empty string
    pub fn matches(&self, mn: &MetricName) -> bool {
        let actual = mn.get_tag_value(&self.key).unwrap_or("");
        match (self.op, &self.re) {
            (TagFilterOp::Eq, _) => actual == self.value,
            (TagFilterOp::Neq, _) => actual != self.value,
            (TagFilterOp::Regex, Some(re)) => re.is_match(actual),
            (TagFilterOp::NotRegex, Some(re)) => !re.is_match(actual),
            (_, None) => false,
        }
    }
}

impl PartialEq for TagFilter {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.op == other.op && self.value == other.value
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = if self.key.is_empty() { NAME_LABEL } else { &self.key };
        write!(f, "{}{}{:?}", key, self.op.as_str(), self.value)
    }
}

/// Search request sent to every storage node
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub auth_token: AuthToken,
    pub time_range: TimeRange,
    /// OR across the outer list, AND within each inner list
    pub tag_filterss: Vec<Vec<TagFilter>>,
}

impl SearchQuery {
    pub fn new(auth_token: AuthToken, time_range: TimeRange, tag_filterss: Vec<Vec<TagFilter>>) -> Self {
        Self {
            auth_token,
            time_range,
            tag_filterss,
        }
    }

    /// Reports whether the series identity satisfies any of the filter sets
    pub fn matches(&self, mn: &MetricName) -> bool {
        self.tag_filterss
            .iter()
            .any(|tfs| tfs.iter().all(|tf| tf.matches(mn)))
    }
}

impl fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "accountID={}, projectID={}, filters=[",
            self.auth_token.account_id, self.auth_token.project_id
        )?;
        for (i, tfs) in self.tag_filterss.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{{")?;
            for (j, tf) in tfs.iter().enumerate() {
                if j > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", tf)?;
            }
            write!(f, "}}")?;
        }
        write!(
            f,
            "], timeRange=[{}..{}]",
            self.time_range.min_timestamp, self.time_range.max_timestamp
        )
    }
}
