//! JSON manipulation helpers used by state merging and persistence.
//!
//! Phase deltas and resume input are merged into flow state with
//! [`deep_merge`]: objects merge recursively, everything else (including
//! arrays) is replaced by the newer value, so a phase can overwrite a field
//! it previously produced.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

/// Deep merge with later-write-wins semantics.
///
/// Objects merge key by key, recursing where both sides hold objects. Any
/// other pairing takes `right` wholesale; a `right` of `Null` also wins, so
/// callers can explicitly clear a field.
///
/// # Examples
///
/// ```rust
/// use flowline::utils::json_ext::deep_merge;
/// use serde_json::json;
///
/// let left = json!({"a": 1, "b": {"x": 10}});
/// let right = json!({"b": {"y": 20}, "c": 3});
///
/// let merged = deep_merge(&left, &right);
/// assert_eq!(merged, json!({"a": 1, "b": {"x": 10, "y": 20}, "c": 3}));
/// ```
#[must_use]
pub fn deep_merge(left: &Value, right: &Value) -> Value {
    match (left, right) {
        (Value::Object(left_obj), Value::Object(right_obj)) => {
            let mut result: Map<String, Value> = left_obj.clone();
            for (key, right_value) in right_obj {
                match result.get(key) {
                    Some(left_value) => {
                        let merged = deep_merge(left_value, right_value);
                        result.insert(key.clone(), merged);
                    }
                    None => {
                        result.insert(key.clone(), right_value.clone());
                    }
                }
            }
            Value::Object(result)
        }
        (_, right_value) => right_value.clone(),
    }
}

/// Get a value using a dot-separated path.
///
/// Array segments are parsed as indices.
///
/// # Examples
///
/// ```rust
/// use flowline::utils::json_ext::get_by_path;
/// use serde_json::json;
///
/// let data = json!({"user": {"profile": {"name": "Alice"}}});
/// assert_eq!(get_by_path(&data, "user.profile.name"), Some(&json!("Alice")));
/// ```
#[must_use]
pub fn get_by_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for part in path.split('.') {
        match current {
            Value::Object(obj) => current = obj.get(part)?,
            Value::Array(arr) => {
                let index: usize = part.parse().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Blanket serde round-trip helpers for persisted shapes.
pub trait JsonSerializable: Serialize + DeserializeOwned {
    /// Serialize to a JSON string.
    fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON string.
    fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to a `serde_json::Value`.
    fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl<T: Serialize + DeserializeOwned> JsonSerializable for T {}
