//! VCSelect - the query front end of a clustered time series and log store
//!
//! This crate accepts query and export requests, fans them out to storage
//! nodes, and streams the merged results back. Partial answers from an
//! incomplete cluster are either flagged or refused, per request.

pub mod config;
pub mod error;
pub mod metrics;
pub mod query;
pub mod storage;
