//! Storage module for VCSelect
//! Handles the contract with storage nodes and the in-process cluster behind it.

pub mod block;
pub mod cluster;
pub mod data;
pub mod netstorage;
pub mod search;
pub mod shard;

pub use data::{DataError, MetricName, SeriesResult};
pub use netstorage::{SearchResults, Storage};
