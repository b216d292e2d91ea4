//! Dotted-path navigation over schema-less JSON documents.
//!
//! Missing keys are "absent", never an error; only object maps are
//! traversed (a dotted path does not index into arrays).

use serde_json::Value;

/// Resolve `path` ("spec.managementPolicies") against `root`.
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = root;
    for seg in path.split('.') {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

/// Remove the field at `path`, returning the removed value when present.
pub fn remove(root: &mut Value, path: &str) -> Option<Value> {
    let mut segs = path.split('.').collect::<Vec<_>>();
    let last = segs.pop()?;
    let mut cur = root;
    for seg in segs {
        cur = cur.as_object_mut()?.get_mut(seg)?;
    }
    cur.as_object_mut()?.remove(last)
}

/// Whether the field at `path` exists.
pub fn exists(root: &Value, path: &str) -> bool {
    get(root, path).is_some()
}
