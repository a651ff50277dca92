//! Combines per-backend results into one client-facing result.

use shardgate_common::{AggregateResult, BackendId, DataType, DispatchMode, QueryResult, Schema};

use crate::error::{CoordinatorError, Result};

pub struct ResultMerger;

impl ResultMerger {
    /// Merges the results of one request.
    ///
    /// Rows are concatenated in backend order, independent of the order in
    /// which backends answered. All schemas must match structurally; a
    /// mismatch fails the whole merge.
    pub fn merge(
        mode: DispatchMode,
        mut results: Vec<(BackendId, QueryResult)>,
    ) -> Result<AggregateResult> {
        match mode {
            DispatchMode::SingleFirst => Self::single(results),
            DispatchMode::Normal | DispatchMode::ScatterAll => {
                results.sort_by(|(a, _), (b, _)| a.cmp(b));
                Self::concat(results)
            }
        }
    }

    fn single(mut results: Vec<(BackendId, QueryResult)>) -> Result<AggregateResult> {
        if results.len() > 1 {
            return Err(CoordinatorError::InvalidRequest(format!(
                "single-backend merge received {} results",
                results.len()
            )));
        }
        Ok(match results.pop() {
            Some((backend, result)) => AggregateResult {
                schema: result.schema,
                rows: result.rows,
                rows_affected: result.rows_affected,
                sources: vec![backend],
            },
            None => AggregateResult::default(),
        })
    }

    fn concat(results: Vec<(BackendId, QueryResult)>) -> Result<AggregateResult> {
        let mut iter = results.into_iter();
        let (first_backend, first) = match iter.next() {
            Some(first) => first,
            None => return Ok(AggregateResult::default()),
        };

        // Backend that fixed the type of each column so far.
        let mut origins = vec![first_backend.clone(); first.schema.len()];
        let mut merged = AggregateResult {
            schema: first.schema,
            rows: first.rows,
            rows_affected: first.rows_affected,
            sources: vec![first_backend],
        };

        for (backend, result) in iter {
            if let Some(detail) = merged.schema.mismatch(&result.schema) {
                let expected = conflicting_position(&merged.schema, &result.schema)
                    .map(|position| origins[position].clone())
                    .or_else(|| merged.sources.last().cloned())
                    .unwrap_or_else(|| backend.clone());
                return Err(CoordinatorError::SchemaMismatch {
                    expected,
                    found: backend,
                    detail,
                });
            }
            refine_types(&mut merged.schema, &mut origins, &backend, &result.schema);
            merged.rows.extend(result.rows);
            merged.rows_affected += result.rows_affected;
            merged.sources.push(backend);
        }

        Ok(merged)
    }
}

/// First column whose types cannot be merged. `None` for a field count mismatch.
fn conflicting_position(merged: &Schema, other: &Schema) -> Option<usize> {
    if merged.len() != other.len() {
        return None;
    }
    merged
        .fields
        .iter()
        .zip(other.fields.iter())
        .position(|(a, b)| !a.data_type.is_compatible(&b.data_type))
}

/// Replaces untyped columns in `merged` with the concrete type seen in `other`
/// and records `backend` as the origin of that type.
fn refine_types(merged: &mut Schema, origins: &mut [BackendId], backend: &BackendId, other: &Schema) {
    for ((field, origin), seen) in merged
        .fields
        .iter_mut()
        .zip(origins.iter_mut())
        .zip(other.fields.iter())
    {
        if field.data_type == DataType::Null && seen.data_type != DataType::Null {
            field.data_type = seen.data_type;
            *origin = backend.clone();
        }
        field.nullable |= seen.nullable;
    }
}
