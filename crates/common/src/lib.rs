//! Common crate
//!
//! Request model, result types, fragment ordering and the backend adapter
//! traits shared by the Shardgate coordinator and its transports.
//!
//! # Example
//! ```rust
//! use shardgate_common::{ordering, BackendId, Fragment, Request};
//!
//! let request = Request::normal(
//!     "SELECT * FROM orders",
//!     vec![
//!         Fragment::new("SELECT * FROM orders_1", "shard-b", "[100, 200)"),
//!         Fragment::new("SELECT * FROM orders_0", "shard-a", "[0, 100)"),
//!     ],
//! );
//! let first = ordering::order_fragments(request.fragments())[0];
//! assert_eq!(first.backend, BackendId::from("shard-a"));
//! ```

pub mod backend;
pub mod error;
pub mod ordering;
pub mod request;
pub mod result;

pub use backend::{BackendExecutor, BackendRegistry, StaticRegistry};
pub use error::{BackendError, BackendErrorKind, BackendResult};
pub use request::{BackendId, DispatchMode, Fragment, Request, TransactionMode};
pub use result::{AggregateResult, DataType, Field, QueryResult, Row, Schema, Value};
