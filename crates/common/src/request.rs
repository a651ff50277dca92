//! Request model handed over by the planner.
//!
//! A [`Request`] is built once and never mutated afterwards. Fields are only
//! reachable through accessors; a retry clones the request or takes a fresh
//! pass over the same fragment list.

use std::borrow::Borrow;
use std::fmt;
use std::time::Duration;

/// Identifier of one backend database node.
///
/// Ordering is the byte-lexicographic order of the identifier, which is the
/// global lock-acquisition order across backends.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendId(String);

impl BackendId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for BackendId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for BackendId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// How the fragments of a request are routed to backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchMode {
    /// Each fragment goes only to the backend the planner assigned it to.
    Normal,
    /// The raw statement goes, unmodified, to every live backend.
    ScatterAll,
    /// The raw statement goes only to the backend that sorts first.
    SingleFirst,
}

/// Transaction context a statement participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    None,
    Read,
    Write,
}

/// One unit of work destined for exactly one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub statement: String,
    pub backend: BackendId,
    /// Advisory shard-range metadata. Logged, never used for routing.
    pub range_hint: String,
}

impl Fragment {
    pub fn new(
        statement: impl Into<String>,
        backend: impl Into<BackendId>,
        range_hint: impl Into<String>,
    ) -> Self {
        Self {
            statement: statement.into(),
            backend: backend.into(),
            range_hint: range_hint.into(),
        }
    }
}

/// One logical operation produced by the planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    raw_statement: String,
    mode: DispatchMode,
    txn_mode: TransactionMode,
    fragments: Vec<Fragment>,
    timeout: Option<Duration>,
}

impl Request {
    pub fn new(
        raw_statement: impl Into<String>,
        mode: DispatchMode,
        txn_mode: TransactionMode,
        fragments: Vec<Fragment>,
    ) -> Self {
        Self {
            raw_statement: raw_statement.into(),
            mode,
            txn_mode,
            fragments,
            timeout: None,
        }
    }

    /// Request routed fragment by fragment, outside any transaction.
    pub fn normal(raw_statement: impl Into<String>, fragments: Vec<Fragment>) -> Self {
        Self::new(raw_statement, DispatchMode::Normal, TransactionMode::None, fragments)
    }

    /// Request whose raw statement is broadcast to every live backend.
    pub fn scatter_all(raw_statement: impl Into<String>) -> Self {
        Self::new(raw_statement, DispatchMode::ScatterAll, TransactionMode::None, Vec::new())
    }

    /// Request whose raw statement goes to the first live backend only.
    pub fn single_first(raw_statement: impl Into<String>) -> Self {
        Self::new(raw_statement, DispatchMode::SingleFirst, TransactionMode::None, Vec::new())
    }

    /// Returns the same request tagged with a transaction mode.
    pub fn with_txn_mode(mut self, txn_mode: TransactionMode) -> Self {
        self.txn_mode = txn_mode;
        self
    }

    /// Returns the same request with a deadline overriding the dispatcher default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn raw_statement(&self) -> &str {
        &self.raw_statement
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn txn_mode(&self) -> TransactionMode {
        self.txn_mode
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
