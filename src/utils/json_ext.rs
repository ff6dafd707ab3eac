//! Small JSON helpers shared by parameter resolution.

use serde_json::Value;

/// Follow a dot-path (already split into segments) through nested JSON
/// objects. Returns `None` as soon as a segment is missing or the current
/// value is not an object.
#[must_use]
pub fn path_lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = current.as_object()?.get(*segment)?;
    }
    Some(current)
}

/// Render a JSON value for embedding inside a larger string: strings are
/// inserted verbatim (no quotes), everything else uses its compact JSON
/// form.
#[must_use]
pub fn render_inline(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
