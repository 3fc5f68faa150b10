// ============================================================================
// Argument Envelope
// ============================================================================
//
// Every statement argument that crosses the endpoint boundary travels as a
// self-describing envelope:
//
//   { "nil": false, "type": "int", "value": 42, "name": "id" }
//
// `type` names the value variant, `value` is a short JSON payload and `name`
// is present only for named arguments. `Value` itself serializes through the
// same envelope (without a name) so rows and requests share one encoding.
//
// ============================================================================

use crate::core::{DacError, Result, Value, value::parse_datetime};
use chrono::{NaiveDate, NaiveTime};
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A positional or named statement argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    name: Option<String>,
    value: Value,
}

impl Argument {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            name: None,
            value: value.into(),
        }
    }

    pub fn named(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        Self {
            name: (!name.is_empty()).then_some(name),
            value: value.into(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_named(&self) -> bool {
        self.name.is_some()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(default)]
    nil: bool,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
}

fn seal(value: &Value, name: &str) -> Result<Envelope> {
    if value.is_null() {
        return Ok(Envelope {
            nil: true,
            kind: String::new(),
            value: serde_json::Value::Null,
            name: name.to_string(),
        });
    }
    Ok(Envelope {
        nil: false,
        kind: value.type_name().to_string(),
        value: value.to_json()?,
        name: name.to_string(),
    })
}

fn unsupported(kind: &str, payload: &serde_json::Value) -> DacError {
    DacError::UnsupportedArgument(format!("cannot decode '{}' argument from {}", kind, payload))
}

fn open(envelope: Envelope) -> Result<Value> {
    if envelope.nil {
        return Ok(Value::Null);
    }
    let payload = envelope.value;
    let kind = envelope.kind.as_str();
    let value = match kind {
        "string" => payload.as_str().map(|s| Value::String(s.to_string())),
        "bool" => payload.as_bool().map(Value::Bool),
        "int" => payload.as_i64().map(Value::Int),
        "uint" => payload.as_u64().map(Value::Uint),
        "float" => payload.as_f64().map(Value::Float),
        "byte" => payload
            .as_u64()
            .and_then(|b| u8::try_from(b).ok())
            .map(Value::Byte),
        "bytes" => serde_json::from_value::<Vec<u8>>(payload.clone())
            .ok()
            .map(Value::Bytes),
        "json" => Some(Value::Json(payload.clone())),
        "datetime" => payload
            .as_str()
            .and_then(parse_datetime)
            .map(Value::Datetime),
        "date" => payload
            .as_str()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .map(Value::Date),
        "time" => payload
            .as_str()
            .and_then(|s| NaiveTime::parse_from_str(s, "%H:%M:%S%.f").ok())
            .map(Value::Time),
        other => {
            return Err(DacError::UnsupportedArgument(format!(
                "unknown argument type '{}'",
                other
            )));
        }
    };
    value.ok_or_else(|| unsupported(kind, &payload))
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        seal(self, "")
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        open(Envelope::deserialize(deserializer)?).map_err(D::Error::custom)
    }
}

impl Serialize for Argument {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        seal(&self.value, self.name.as_deref().unwrap_or_default())
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Argument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let envelope = Envelope::deserialize(deserializer)?;
        let name = envelope.name.clone();
        let value = open(envelope).map_err(D::Error::custom)?;
        Ok(Argument::named(name, value))
    }
}

/// Encodes an argument vector for transport.
pub fn encode(args: &[Argument]) -> Result<Vec<u8>> {
    serde_json::to_vec(args).map_err(|err| DacError::UnsupportedArgument(err.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<Vec<Argument>> {
    serde_json::from_slice(bytes).map_err(|err| DacError::UnsupportedArgument(err.to_string()))
}

/// Builds a positional argument vector from heterogeneous values.
#[macro_export]
macro_rules! args {
    () => { ::std::vec::Vec::<$crate::Argument>::new() };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::Argument::new($crate::core::ToValue::to_value(&$value))),+]
    };
}
