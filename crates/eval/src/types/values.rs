use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ──────────────────────────────────────────────
// Value types
// ──────────────────────────────────────────────

/// Declared type of a plan input or a step output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Numeric,
    String,
    Bool,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Numeric => "numeric",
            ValueType::String => "string",
            ValueType::Bool => "bool",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "numeric" => Ok(ValueType::Numeric),
            "string" => Ok(ValueType::String),
            "bool" => Ok(ValueType::Bool),
            other => Err(format!("unknown value type '{}'", other)),
        }
    }
}

// ──────────────────────────────────────────────
// Runtime values
// ──────────────────────────────────────────────

/// A typed runtime value.
///
/// Crosses every serialization boundary as `{"value": "<text>", "type":
/// "numeric" | "string" | "bool"}`; numerics are decimal strings, never
/// JSON numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireValue", try_from = "WireValue")]
pub enum Value {
    Numeric(Decimal),
    Text(String),
    Bool(bool),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Numeric(_) => ValueType::Numeric,
            Value::Text(_) => ValueType::String,
            Value::Bool(_) => ValueType::Bool,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.value_type().as_str()
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Numeric(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Textual payload without the type tag.
    pub fn text(&self) -> String {
        match self {
            Value::Numeric(d) => d.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
        }
    }

    /// Parse `text` as a value of type `ty`.
    pub fn parse(ty: ValueType, text: &str) -> Result<Value, String> {
        match ty {
            ValueType::Numeric => parse_decimal(text).map(Value::Numeric),
            ValueType::String => Ok(Value::Text(text.to_string())),
            ValueType::Bool => match text {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                other => Err(format!("expected 'true' or 'false', got '{}'", other)),
            },
        }
    }

    /// Convert an employee attribute to the declared input type.
    ///
    /// JSON numbers are read back from their textual form so no binary
    /// floating point conversion happens on the way in.
    pub fn from_attribute(ty: ValueType, raw: &serde_json::Value) -> Result<Value, String> {
        match (ty, raw) {
            (ValueType::Numeric, serde_json::Value::Number(n)) => {
                parse_decimal(&n.to_string()).map(Value::Numeric)
            }
            (ValueType::Numeric, serde_json::Value::String(s)) => {
                parse_decimal(s.trim()).map(Value::Numeric)
            }
            (ValueType::Bool, serde_json::Value::Bool(b)) => Ok(Value::Bool(*b)),
            (ValueType::Bool, serde_json::Value::String(s)) => Value::parse(ValueType::Bool, s),
            (ValueType::String, serde_json::Value::String(s)) => Ok(Value::Text(s.clone())),
            (ty, other) => Err(format!("expected {}, got {}", ty, json_kind(other))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => write!(f, "\"{}\"", s),
            other => f.write_str(&other.text()),
        }
    }
}

fn parse_decimal(text: &str) -> Result<Decimal, String> {
    let parsed = if text.contains(['e', 'E']) {
        Decimal::from_scientific(text)
    } else {
        Decimal::from_str_exact(text)
    };
    parsed.map_err(|e| format!("'{}' is not a decimal number: {}", text, e))
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ──────────────────────────────────────────────
// Wire form
// ──────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct WireValue {
    value: String,
    #[serde(rename = "type")]
    kind: ValueType,
}

impl From<Value> for WireValue {
    fn from(v: Value) -> Self {
        WireValue {
            kind: v.value_type(),
            value: v.text(),
        }
    }
}

impl TryFrom<WireValue> for Value {
    type Error = String;

    fn try_from(w: WireValue) -> Result<Self, Self::Error> {
        Value::parse(w.kind, &w.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_type_tag() {
        let v = Value::Numeric(Decimal::from_str("12.50").unwrap());
        assert_eq!(
            serde_json::to_value(&v).unwrap(),
            json!({"value": "12.50", "type": "numeric"})
        );
        let b: Value = serde_json::from_value(json!({"value": "true", "type": "bool"})).unwrap();
        assert_eq!(b, Value::Bool(true));
    }

    #[test]
    fn rejects_malformed_wire_value() {
        let r: Result<Value, _> =
            serde_json::from_value(json!({"value": "abc", "type": "numeric"}));
        assert!(r.is_err());
    }

    #[test]
    fn attribute_numbers_keep_their_text() {
        let v = Value::from_attribute(ValueType::Numeric, &json!(0.1)).unwrap();
        assert_eq!(v, Value::Numeric(Decimal::from_str("0.1").unwrap()));
        let s = Value::from_attribute(ValueType::Numeric, &json!("100000.005")).unwrap();
        assert_eq!(s.text(), "100000.005");
    }

    #[test]
    fn attribute_type_mismatch_is_reported() {
        let err = Value::from_attribute(ValueType::Numeric, &json!(true)).unwrap_err();
        assert!(err.contains("expected numeric"), "{}", err);
        assert!(Value::from_attribute(ValueType::Bool, &json!("yes")).is_err());
        assert_eq!(
            Value::from_attribute(ValueType::Bool, &json!("false")).unwrap(),
            Value::Bool(false)
        );
    }
}
