//! Term search over parsed response trees
//!
//! A term is first looked up as an exact key on the top level of the tree. Only
//! when that misses does a depth-first walk run, matching any key that contains
//! the term as a case-sensitive substring. The first hit in key-iteration order
//! wins.

use crate::error::ExtractionError;
use serde_json::Value;

/// Deepest nesting the substring walk will descend into
pub const MAX_DEPTH: usize = 128;

/// Find the value a term refers to inside a response tree
///
/// An empty or absent term selects the whole tree. A JSON `null` found by
/// either pass counts as no match.
///
/// # Arguments
///
/// * `tree` - Parsed response body
/// * `term` - Key to search for
///
/// # Errors
///
/// Returns `ExtractionError::DepthExceeded` if the walk reaches nesting deeper
/// than `MAX_DEPTH` before finding a match.
pub fn extract<'a>(tree: &'a Value, term: Option<&str>) -> Result<Option<&'a Value>, ExtractionError> {
    let term = match term {
        Some(term) if !term.is_empty() => term,
        _ => return Ok(Some(tree)),
    };

    if let Some(value) = shallow_lookup(tree, term) {
        return Ok(Some(value));
    }

    let found = deep_search(tree, term, 0)?;
    Ok(found.filter(|value| !value.is_null()))
}

fn shallow_lookup<'a>(tree: &'a Value, term: &str) -> Option<&'a Value> {
    tree.as_object()
        .and_then(|object| object.get(term))
        .filter(|value| !value.is_null())
}

fn deep_search<'a>(
    node: &'a Value,
    term: &str,
    depth: usize,
) -> Result<Option<&'a Value>, ExtractionError> {
    if depth > MAX_DEPTH {
        return Err(ExtractionError::DepthExceeded(MAX_DEPTH));
    }

    match node {
        Value::Object(object) => {
            for (key, value) in object {
                if key.contains(term) {
                    return Ok(Some(value));
                }
                if value.is_object() || value.is_array() {
                    if let Some(found) = deep_search(value, term, depth + 1)? {
                        return Ok(Some(found));
                    }
                }
            }
            Ok(None)
        }
        Value::Array(items) => {
            for item in items {
                if let Some(found) = deep_search(item, term, depth + 1)? {
                    return Ok(Some(found));
                }
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}
