use serde_json::Map;

pub use serde_json::Value;

/// A single row or request payload: a JSON object keyed by field name.
///
/// Every layer (dissection, translation, relational engine) passes objects
/// around in this shape so nested requests keep their structure intact.
pub type Object = Map<String, Value>;

/// Returns `true` when the value would be considered "falsy" by a dynamic
/// caller: `null`, `false`, `0`, `NaN`, or the empty string.
///
/// Relationship translation skips falsy alias values so that omitting a
/// relationship never clears the stored foreign key.
#[must_use]
pub fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f == 0.0 || f.is_nan()),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}
