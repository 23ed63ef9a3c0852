//! Rendering the parent template into concrete applications.
//!
//! Substitution is `{{ key }}` replacement over the JSON form of the template.
//! Two parameter modes exist, selected by `spec.goTemplate` on the parent:
//!
//! - **flat** (the default): the parameter map is flattened into dotted keys
//!   and every scalar is stringified before substitution;
//! - **structured**: placeholders resolve dotted paths into the nested
//!   parameter map, and a placeholder that makes up an entire string is
//!   replaced by the raw value, structure intact.
//!
//! Unresolved placeholders are left in place; a rendering failure is a
//! per-application validation failure, not a reconcile error.

use crate::generators::GeneratorParams;
use appset_core::{Application, ApplicationSetTemplate};
use serde_json::{Map, Value};
use thiserror::Error;

/// How parameters are prepared and looked up
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RenderMode {
    /// Dotted-path lookup into the nested map, structure-preserving
    Structured,
    /// Flattened dotted keys, stringified values
    Flat,
}

/// Rendering failures; each one invalidates a single application
#[derive(Debug, Error)]
pub enum RenderError {
    /// The substituted template no longer deserializes
    #[error("rendered template is not a valid application: {0}")]
    Invalid(#[source] serde_json::Error),

    /// Template serialization failed
    #[error("failed to serialize template: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Deep-merge a generator-supplied template over the parent template.
///
/// Objects merge key-wise with the overlay winning, everything else is
/// replaced outright.
pub fn merge_templates(
    parent: &ApplicationSetTemplate,
    overlay: Option<&ApplicationSetTemplate>,
) -> Result<ApplicationSetTemplate, RenderError> {
    let Some(overlay) = overlay else { return Ok(parent.clone()) };
    let mut base = serde_json::to_value(parent).map_err(RenderError::Serialize)?;
    let overlay = serde_json::to_value(overlay).map_err(RenderError::Serialize)?;
    merge_values(&mut base, overlay);
    serde_json::from_value(base).map_err(RenderError::Invalid)
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Render the template against one parameter map
pub fn render_application(
    template: &ApplicationSetTemplate,
    params: &GeneratorParams,
    mode: RenderMode,
) -> Result<Application, RenderError> {
    let params = match mode {
        RenderMode::Flat => flatten_params(params),
        RenderMode::Structured => params.clone(),
    };
    let mut value = serde_json::to_value(template).map_err(RenderError::Serialize)?;
    substitute_value(&mut value, &params, mode == RenderMode::Structured);
    let rendered: ApplicationSetTemplate = serde_json::from_value(value).map_err(RenderError::Invalid)?;

    let mut app = Application::new(&rendered.metadata.name, rendered.spec);
    if !rendered.metadata.namespace.is_empty() {
        app.metadata.namespace = Some(rendered.metadata.namespace);
    }
    if !rendered.metadata.labels.is_empty() {
        app.metadata.labels = Some(rendered.metadata.labels);
    }
    if !rendered.metadata.annotations.is_empty() {
        app.metadata.annotations = Some(rendered.metadata.annotations);
    }
    if !rendered.metadata.finalizers.is_empty() {
        app.metadata.finalizers = Some(rendered.metadata.finalizers);
    }
    Ok(app)
}

fn substitute_value(value: &mut Value, params: &GeneratorParams, structured: bool) {
    match value {
        Value::String(s) => {
            if structured {
                if let Some(token) = exact_placeholder(s) {
                    if let Some(found) = lookup(params, &token, true) {
                        *value = found.clone();
                        return;
                    }
                }
            }
            *s = substitute_str(s, params, structured);
        }
        Value::Array(items) => {
            for item in items {
                substitute_value(item, params, structured);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                substitute_value(item, params, structured);
            }
        }
        _ => {}
    }
}

/// The token of a string that consists of exactly one placeholder
fn exact_placeholder(s: &str) -> Option<String> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim().to_string())
}

fn substitute_str(s: &str, params: &GeneratorParams, structured: bool) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find("}}") else {
            // unterminated placeholder, keep the remainder verbatim
            out.push_str(&rest[start..]);
            return out;
        };
        let token = tail[..end].trim();
        match lookup(params, token, structured) {
            Some(value) => out.push_str(&stringify(value)),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &tail[end + 2..];
    }
    out.push_str(rest);
    out
}

fn lookup<'a>(params: &'a GeneratorParams, token: &str, structured: bool) -> Option<&'a Value> {
    if let Some(value) = params.get(token) {
        return Some(value);
    }
    if !structured {
        return None;
    }
    let mut current: Option<&Value> = None;
    for part in token.split('.') {
        current = match current {
            None => params.get(part),
            Some(Value::Object(map)) => map.get(part),
            _ => return None,
        };
        current?;
    }
    current
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn flatten_params(params: &GeneratorParams) -> GeneratorParams {
    let mut out = Map::new();
    for (key, value) in params {
        flatten_into(key, value, &mut out);
    }
    out
}

fn flatten_into(prefix: &str, value: &Value, out: &mut GeneratorParams) {
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                flatten_into(&format!("{prefix}.{key}"), value, out);
            }
        }
        Value::Array(items) => {
            for (idx, value) in items.iter().enumerate() {
                flatten_into(&format!("{prefix}.{idx}"), value, out);
            }
        }
        scalar => {
            out.insert(prefix.to_string(), Value::String(stringify(scalar)));
        }
    }
}
