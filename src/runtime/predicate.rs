//! Condition predicate evaluation
//!
//! Pure functions over the subscriber's segment set and the enrollment
//! metadata. Metadata paths are JSONPath expressions (`$.bucket`,
//! `$.trigger.payload.plan`) resolved with `jsonpath_lib`.

use crate::sequence::types::Predicate;
use serde_json::Value;
use std::collections::HashSet;

/// Whether evaluating `predicate` needs the subscriber's segments
pub fn needs_segments(predicate: &Predicate) -> bool {
    match predicate {
        Predicate::InSegment { .. } | Predicate::NotInSegment { .. } => true,
        Predicate::MetadataEquals { .. } | Predicate::MetadataExists { .. } => false,
        Predicate::All { predicates } | Predicate::Any { predicates } => {
            predicates.iter().any(needs_segments)
        }
        Predicate::Not { predicate } => needs_segments(predicate),
    }
}

/// Evaluate `predicate`; an empty `all` is true, an empty `any` is false
pub fn evaluate(predicate: &Predicate, segments: &HashSet<String>, metadata: &Value) -> bool {
    match predicate {
        Predicate::InSegment { segment_id } => segments.contains(segment_id),
        Predicate::NotInSegment { segment_id } => !segments.contains(segment_id),
        Predicate::MetadataEquals { path, value } => {
            select(metadata, path).iter().any(|found| *found == value)
        }
        Predicate::MetadataExists { path } => !select(metadata, path).is_empty(),
        Predicate::All { predicates } => predicates.iter().all(|p| evaluate(p, segments, metadata)),
        Predicate::Any { predicates } => predicates.iter().any(|p| evaluate(p, segments, metadata)),
        Predicate::Not { predicate } => !evaluate(predicate, segments, metadata),
    }
}

/// Matches of `path` in `metadata`; a malformed path matches nothing
fn select<'a>(metadata: &'a Value, path: &str) -> Vec<&'a Value> {
    match jsonpath_lib::select(metadata, path) {
        Ok(found) => found.into_iter().filter(|v| !v.is_null()).collect(),
        Err(e) => {
            tracing::warn!("⚠️ Invalid metadata path '{}': {:?}", path, e);
            Vec::new()
        }
    }
}
