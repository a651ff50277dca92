//! Fragment ordering.
//!
//! Every operation that touches more than one backend in the same logical
//! transaction acquires them in this order. Because the order is global, two
//! transactions contending for overlapping backend sets always lock the shared
//! backends in the same relative order and cannot wait on each other in a cycle.

use std::collections::BTreeSet;

use crate::request::{BackendId, Fragment};

/// Returns the fragments sorted ascending by backend id.
pub fn order_fragments(fragments: &[Fragment]) -> Vec<&Fragment> {
    let mut ordered: Vec<&Fragment> = fragments.iter().collect();
    ordered.sort_by(|a, b| a.backend.cmp(&b.backend));
    ordered
}

/// Returns the backends sorted ascending, with duplicates collapsed.
pub fn order_backends<I>(backends: I) -> Vec<BackendId>
where
    I: IntoIterator<Item = BackendId>,
{
    backends.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Returns the backend that sorts first, if any.
pub fn first_backend<I>(backends: I) -> Option<BackendId>
where
    I: IntoIterator<Item = BackendId>,
{
    backends.into_iter().min()
}
