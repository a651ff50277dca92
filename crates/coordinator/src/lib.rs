//! Execution core of the Shardgate sharded SQL middleware.
//!
//! The planner hands over a [`Request`](shardgate_common::Request) already
//! split into per-backend fragments. The [`ScatterDispatcher`] routes and fans
//! it out, the [`TransactionCoordinator`] wraps dispatch in multi-backend
//! transactions, and the [`ResultMerger`] stitches the per-backend results
//! back together.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod merge;
pub mod registry;
pub mod transaction;

pub use config::{DispatchSettings, Settings};
pub use dispatcher::{ScatterDispatcher, Target};
pub use error::{CoordinatorError, DispatchFailure, Result};
pub use merge::ResultMerger;
pub use registry::{BackendState, ClusterRegistry, ClusterState};
pub use transaction::{AccessMode, Transaction, TransactionCoordinator, TransactionState};
