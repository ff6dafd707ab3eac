//! Sandboxed parameter resolution.
//!
//! Each raw node parameter is rendered against an environment of workflow
//! globals, the node's own raw parameters, and one namespace per completed
//! dependency exposing its results as `<dependency_id>.<key>`. The
//! evaluator is an allow-listed expression grammar, not a scripting
//! sandbox: a placeholder `${...}` may contain exactly one dot-path
//! (`ident(.ident)*`) and nothing else. There is no host introspection, no
//! imports, no filesystem or process access to escape from, because none of
//! those constructs parse in the first place.
//!
//! Rendering is pure: it borrows its inputs, allocates its output, and has
//! no side effects. A node may reference only dependencies in its own
//! declared dependency set; anything else fails with
//! [`ParameterResolutionError`] before submission.
//!
//! Type preservation: a placeholder that spans an entire raw string value
//! keeps the looked-up value's JSON type (`"${calc.energy}"` can resolve to
//! a number). A placeholder embedded in surrounding text stringifies its
//! value. Non-string raw values (arrays, objects) are traversed recursively.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::utils::json_ext::{path_lookup, render_inline};

/// Errors raised while rendering a node's parameters.
///
/// All variants are node-level failures: the scheduler routes them through
/// the node's failure policy instead of letting them escape the pass.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ParameterResolutionError {
    /// The placeholder contents are not a plain dot-path.
    #[error("invalid expression `{expression}`: {reason}")]
    #[diagnostic(
        code(flowsmith::params::invalid_expression),
        help("Placeholders accept a single dot-path such as ${{relax.energy}}; no calls, indexing, or literals.")
    )]
    InvalidExpression { expression: String, reason: String },

    /// A multi-segment path whose root is not a declared dependency of the
    /// node (and not a global or local parameter).
    #[error("`{reference}` is not a declared dependency of this node")]
    #[diagnostic(
        code(flowsmith::params::undeclared_dependency),
        help("A node may only read results of dependencies listed in its own `dependencies` set.")
    )]
    UndeclaredDependency { reference: String },

    /// The path root was found, but the remaining segments did not resolve.
    #[error("unknown variable `{path}`")]
    #[diagnostic(code(flowsmith::params::unknown_variable))]
    UnknownVariable { path: String },

    /// A `${` without a closing `}`.
    #[error("unterminated placeholder in `{value}`")]
    #[diagnostic(code(flowsmith::params::unterminated_placeholder))]
    UnterminatedPlaceholder { value: String },
}

/// The lookup environment for one node's resolution.
///
/// Precedence for a path's first segment: the node's own raw parameters,
/// then workflow globals, then declared-dependency namespaces.
pub struct ResolverScope<'a> {
    pub globals: &'a Map<String, Value>,
    pub own: &'a Map<String, Value>,
    /// Results of completed dependencies, keyed by dependency node id.
    pub dependency_results: FxHashMap<&'a str, &'a Value>,
}

impl<'a> ResolverScope<'a> {
    fn lookup(&self, expression: &str) -> Result<Value, ParameterResolutionError> {
        let segments = parse_dot_path(expression)?;
        let (head, rest) = segments.split_first().expect("parse yields >= 1 segment");

        if let Some(value) = self.own.get(*head).or_else(|| self.globals.get(*head)) {
            return match path_lookup(value, rest) {
                Some(found) => Ok(found.clone()),
                None => Err(ParameterResolutionError::UnknownVariable {
                    path: expression.to_string(),
                }),
            };
        }

        if let Some(results) = self.dependency_results.get(*head) {
            return match path_lookup(results, rest) {
                Some(found) => Ok(found.clone()),
                None => Err(ParameterResolutionError::UnknownVariable {
                    path: expression.to_string(),
                }),
            };
        }

        // A dotted root that matches nothing reads as a reference to some
        // other node; report it as an undeclared dependency rather than a
        // missing variable.
        if !rest.is_empty() {
            Err(ParameterResolutionError::UndeclaredDependency {
                reference: (*head).to_string(),
            })
        } else {
            Err(ParameterResolutionError::UnknownVariable {
                path: expression.to_string(),
            })
        }
    }
}

/// Split and validate a dot-path expression. Rejects everything that is not
/// `ident(.ident)*` — this is the whole sandbox.
fn parse_dot_path(expression: &str) -> Result<Vec<&str>, ParameterResolutionError> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err(ParameterResolutionError::InvalidExpression {
            expression: expression.to_string(),
            reason: "empty placeholder".to_string(),
        });
    }
    let segments: Vec<&str> = trimmed.split('.').collect();
    for segment in &segments {
        if !is_identifier(segment) {
            return Err(ParameterResolutionError::InvalidExpression {
                expression: expression.to_string(),
                reason: "only dot-path lookups are permitted".to_string(),
            });
        }
    }
    Ok(segments)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Resolve every raw parameter of a node against `scope`.
pub fn resolve_parameters(
    raw: &Map<String, Value>,
    scope: &ResolverScope<'_>,
) -> Result<Map<String, Value>, ParameterResolutionError> {
    let mut resolved = Map::new();
    for (key, value) in raw {
        resolved.insert(key.clone(), resolve_value(value, scope)?);
    }
    Ok(resolved)
}

/// Resolve one raw value, recursing into arrays and objects.
pub fn resolve_value(
    value: &Value,
    scope: &ResolverScope<'_>,
) -> Result<Value, ParameterResolutionError> {
    match value {
        Value::String(s) => resolve_string(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(
    raw: &str,
    scope: &ResolverScope<'_>,
) -> Result<Value, ParameterResolutionError> {
    // Fast path: no placeholder at all.
    let Some(first) = raw.find("${") else {
        return Ok(Value::String(raw.to_string()));
    };

    // Whole-string placeholder keeps the looked-up value's JSON type.
    if first == 0 && raw.ends_with('}') && raw.matches("${").count() == 1 {
        let inner = &raw[2..raw.len() - 1];
        if !inner.contains('}') {
            return scope.lookup(inner);
        }
    }

    let mut rendered = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(ParameterResolutionError::UnterminatedPlaceholder {
                value: raw.to_string(),
            });
        };
        let value = scope.lookup(&after[..end])?;
        rendered.push_str(&render_inline(&value));
        rest = &after[end + 1..];
    }
    rendered.push_str(rest);
    Ok(Value::String(rendered))
}
