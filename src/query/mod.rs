//! Query module for VCSelect
//! Handles request parameters, query dispatch, evaluation and response streaming.

pub mod align;
pub mod dispatcher;
pub mod evaluator;
pub mod executor;
pub mod format;
pub mod handlers;
pub mod params;
pub mod parser;
pub mod pool;
pub mod tail;

pub use handlers::{Outcome, Select};
pub use params::{RequestContext, RequestParams};
