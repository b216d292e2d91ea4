//! Kubernetes metadata accessors over raw JSON objects.

use serde_json::{Map, Value};

pub fn name(xr: &Value) -> &str {
    xr.pointer("/metadata/name").and_then(Value::as_str).unwrap_or("")
}

pub fn namespace(xr: &Value) -> Option<&str> {
    xr.pointer("/metadata/namespace").and_then(Value::as_str)
}

pub fn kind(xr: &Value) -> &str {
    xr.get("kind").and_then(Value::as_str).unwrap_or("")
}

pub fn api_version(xr: &Value) -> &str {
    xr.get("apiVersion").and_then(Value::as_str).unwrap_or("")
}

/// Split `apiVersion` into (group, version); core-group objects have "".
pub fn group_version(xr: &Value) -> (String, String) {
    match api_version(xr).split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version(xr).to_string()),
    }
}

pub fn resource_version(xr: &Value) -> Option<&str> {
    xr.pointer("/metadata/resourceVersion").and_then(Value::as_str)
}

pub fn labels(xr: &Value) -> Option<&Map<String, Value>> {
    xr.pointer("/metadata/labels").and_then(Value::as_object)
}

pub fn annotations(xr: &Value) -> Option<&Map<String, Value>> {
    xr.pointer("/metadata/annotations").and_then(Value::as_object)
}

pub fn label<'a>(xr: &'a Value, key: &str) -> Option<&'a str> {
    labels(xr)?.get(key)?.as_str()
}

pub fn annotation<'a>(xr: &'a Value, key: &str) -> Option<&'a str> {
    annotations(xr)?.get(key)?.as_str()
}

pub fn set_name(xr: &mut Value, name: &str) {
    if let Some(meta) = xr.pointer_mut("/metadata").and_then(Value::as_object_mut) {
        meta.insert("name".into(), Value::String(name.to_string()));
    }
}

/// Clear server-assigned identity so the document survives a dry-run
/// admission path under a different name: uid, resourceVersion, generation,
/// creationTimestamp and managedFields.
pub fn clear_server_identity(xr: &mut Value) {
    if let Some(meta) = xr.pointer_mut("/metadata").and_then(Value::as_object_mut) {
        meta.remove("uid");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("managedFields");
    }
}
