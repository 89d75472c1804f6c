//! List selectors for the state store.
//!
//! Four selector families are supported:
//!
//! - `Label`: `key=value` / `key!=value` matched against `metadata.labels`
//!   of the entry body;
//! - `Field`: the same operators matched against the top-level body, with
//!   dotted traversal on the left-hand side (`spec.instance.name=foo`);
//! - `Status` / `Spec`: a `$.a.b.c` path query against the body's `status`
//!   or `spec` sub-document; the entry matches when the query yields a
//!   non-null result.
//!
//! An invalid selector expression fails the whole list call with
//! `BadRequest`; an entry that merely lacks the addressed fields simply does
//! not match.

use serde_json::Value;

use crate::error::{Result, StatusError};

/// A typed list filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListFilter {
    /// `key=value` / `key!=value` against `metadata.labels`.
    Label(String),
    /// `path=value` / `path!=value` against the top-level body.
    Field(String),
    /// `$.a.b` query against the `status` sub-document; matches on non-null.
    Status(String),
    /// `$.a.b` query against the `spec` sub-document; matches on non-null.
    Spec(String),
}

/// Whether an entry body matches the filter.
pub fn matches(body: &Value, filter: &ListFilter) -> Result<bool> {
    match filter {
        ListFilter::Label(selector) => {
            let labels = body.pointer("/metadata/labels");
            match labels {
                Some(labels) if labels.is_object() => eval_selector(labels, selector),
                // No labels to match against: not an error, just no match.
                _ => {
                    validate_selector(selector)?;
                    Ok(false)
                }
            }
        }
        ListFilter::Field(selector) => eval_selector(body, selector),
        ListFilter::Status(path) => {
            let doc = body.get("status").unwrap_or(&Value::Null);
            Ok(!path_query(doc, path)?.is_null())
        }
        ListFilter::Spec(path) => {
            let doc = body.get("spec").unwrap_or(&Value::Null);
            Ok(!path_query(doc, path)?.is_null())
        }
    }
}

/// Evaluates a `lhs=rhs` or `lhs!=rhs` selector against a document.
///
/// The left-hand side may use dotted traversal into nested objects. An absent
/// field never matches, for either operator.
fn eval_selector(doc: &Value, selector: &str) -> Result<bool> {
    let (lhs, rhs, negate) = split_selector(selector)?;

    match trace_down(doc, lhs) {
        Some(actual) => {
            let equal = value_text(actual) == rhs;
            Ok(if negate { !equal } else { equal })
        }
        None => Ok(false),
    }
}

/// Validates a selector expression without evaluating it.
fn validate_selector(selector: &str) -> Result<()> {
    split_selector(selector).map(|_| ())
}

fn split_selector(selector: &str) -> Result<(&str, &str, bool)> {
    if let Some(idx) = selector.find("!=") {
        let (lhs, rhs) = (&selector[..idx], &selector[idx + 2..]);
        if lhs.is_empty() {
            return Err(invalid_selector(selector));
        }
        return Ok((lhs, rhs, true));
    }
    if let Some(idx) = selector.find('=') {
        let (lhs, rhs) = (&selector[..idx], &selector[idx + 1..]);
        if lhs.is_empty() {
            return Err(invalid_selector(selector));
        }
        return Ok((lhs, rhs, false));
    }
    Err(invalid_selector(selector))
}

fn invalid_selector(selector: &str) -> StatusError {
    StatusError::bad_request(format!("filter '{}' is not a valid selector", selector))
}

/// Follows a dotted path through nested objects.
fn trace_down<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// Evaluates a `$.a.b` path query, returning the addressed value or `Null`.
///
/// Only the dotted child form is supported; anything else is `BadRequest`.
fn path_query<'a>(doc: &'a Value, path: &str) -> Result<&'a Value> {
    let rest = path
        .strip_prefix("$.")
        .or_else(|| (path == "$").then_some(""))
        .ok_or_else(|| StatusError::bad_request(format!("filter '{}' is not a valid path query", path)))?;

    if rest.is_empty() {
        return Ok(doc);
    }
    if rest.split('.').any(|part| part.is_empty() || part.contains(['[', ']', '*', '?'])) {
        return Err(StatusError::bad_request(format!(
            "filter '{}' is not a valid path query",
            path
        )));
    }
    Ok(trace_down(doc, rest).unwrap_or(&Value::Null))
}

/// Text form of a scalar value for selector comparison.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
