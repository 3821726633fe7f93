use serde_json::{Map, Value};

/// Helpers over the dynamic `serde_json::Value` that flows between nodes.
pub trait ValueExt {
    /// Short type name used in diagnostics ("string", "object", ...).
    fn type_name(&self) -> &'static str;

    /// Rendering used when a value is interpolated into a larger string.
    fn to_display_string(&self) -> String;

    /// Recursively merge `other` into `self`. Objects are merged key by key,
    /// anything else is replaced.
    fn deep_merge(&mut self, other: Value);
}

impl ValueExt for Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    fn to_display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            other => other.to_string(),
        }
    }

    fn deep_merge(&mut self, other: Value) {
        match (self, other) {
            (Value::Object(base), Value::Object(overlay)) => merge_maps(base, overlay),
            (slot, other) => *slot = other,
        }
    }
}

/// Merge `overlay` into `base` without dropping keys `overlay` does not name.
pub fn merge_maps(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        match base.get_mut(&key) {
            Some(existing) => existing.deep_merge(value),
            None => {
                base.insert(key, value);
            }
        }
    }
}

/// Read a string parameter, treating absence and `null` alike.
pub fn param_str<'a>(params: &'a Value, name: &str) -> Option<&'a str> {
    params.get(name).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deep_merge_keeps_unrelated_keys() {
        let mut base = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        base.deep_merge(json!({"nested": {"y": 3}, "b": true}));
        assert_eq!(base, json!({"a": 1, "b": true, "nested": {"x": 1, "y": 3}}));
    }

    #[test]
    fn display_string_renders_scalars_plainly() {
        assert_eq!(json!("hi").to_display_string(), "hi");
        assert_eq!(json!(null).to_display_string(), "");
        assert_eq!(json!(2.5).to_display_string(), "2.5");
        assert_eq!(json!([1, 2]).to_display_string(), "[1,2]");
    }
}
