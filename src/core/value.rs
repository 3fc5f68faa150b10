use crate::core::{DacError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

/// Semantic kind of an application value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKind {
    String,
    Int,
    Float,
    Bool,
    Datetime,
    Date,
    Time,
    Bytes,
    Byte,
    Json,
}

impl ValueKind {
    pub const ALL: [ValueKind; 10] = [
        ValueKind::String,
        ValueKind::Int,
        ValueKind::Float,
        ValueKind::Bool,
        ValueKind::Datetime,
        ValueKind::Date,
        ValueKind::Time,
        ValueKind::Bytes,
        ValueKind::Byte,
        ValueKind::Json,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Datetime => "datetime",
            Self::Date => "date",
            Self::Time => "time",
            Self::Bytes => "bytes",
            Self::Byte => "byte",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A database-bound value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    Byte(u8),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Datetime(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
}

pub(crate) const DATETIME_LAYOUTS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

impl Value {
    /// Name used in argument envelopes.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "nil",
            Self::String(_) => "string",
            Self::Int(_) => "int",
            Self::Uint(_) => "uint",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Byte(_) => "byte",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
            Self::Datetime(_) => "datetime",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
        }
    }

    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Self::Null => None,
            Self::String(_) => Some(ValueKind::String),
            Self::Int(_) | Self::Uint(_) => Some(ValueKind::Int),
            Self::Float(_) => Some(ValueKind::Float),
            Self::Bool(_) => Some(ValueKind::Bool),
            Self::Byte(_) => Some(ValueKind::Byte),
            Self::Bytes(_) => Some(ValueKind::Bytes),
            Self::Json(_) => Some(ValueKind::Json),
            Self::Datetime(_) => Some(ValueKind::Datetime),
            Self::Date(_) => Some(ValueKind::Date),
            Self::Time(_) => Some(ValueKind::Time),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Zero value in the sense of the audit hooks: null, empty text, numeric
    /// zero or the unix epoch.
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Null => true,
            Self::String(s) => s.is_empty(),
            Self::Int(i) => *i == 0,
            Self::Uint(u) => *u == 0,
            Self::Float(f) => *f == 0.0,
            Self::Bool(b) => !*b,
            Self::Byte(b) => *b == 0,
            Self::Bytes(b) => b.is_empty(),
            Self::Json(j) => j.is_null(),
            Self::Datetime(dt) => dt.timestamp() == 0 && dt.timestamp_subsec_nanos() == 0,
            Self::Date(_) | Self::Time(_) => false,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Uint(u) => i64::try_from(*u).ok(),
            Self::Byte(b) => Some(*b as i64),
            Self::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            Self::Bool(b) => Some(*b as i64),
            Self::String(s) => s.trim().parse().ok(),
            Self::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Builds a JSON value from any serializable application type.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let json = serde_json::to_value(value)
            .map_err(|err| DacError::UnsupportedArgument(err.to_string()))?;
        Ok(Self::Json(json))
    }

    /// Lossy projection into JSON, used when values are embedded in JSON
    /// documents (ref/link projections, row envelopes).
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            Self::Null => serde_json::Value::Null,
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Uint(u) => serde_json::Value::from(*u),
            Self::Float(f) => {
                let number = serde_json::Number::from_f64(*f).ok_or_else(|| {
                    DacError::UnsupportedArgument(format!("float {} is not representable", f))
                })?;
                serde_json::Value::Number(number)
            }
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Byte(b) => serde_json::Value::from(*b),
            Self::Bytes(b) => serde_json::to_value(b)?,
            Self::Json(j) => j.clone(),
            Self::Datetime(dt) => serde_json::Value::String(dt.to_rfc3339()),
            Self::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            Self::Time(t) => serde_json::Value::String(t.format("%H:%M:%S%.f").to_string()),
        })
    }

    /// Inverse of [`Value::to_json`] for JSON found inside query results where
    /// no declared kind is available.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Self::Uint(u)
                } else {
                    Self::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Self::String(s),
            other => Self::Json(other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::String(s) => write!(f, "{}", s),
            Self::Int(i) => write!(f, "{}", i),
            Self::Uint(u) => write!(f, "{}", u),
            Self::Float(fl) => write!(f, "{}", fl),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Byte(b) => write!(f, "{}", b),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Json(j) => write!(f, "{}", j),
            Self::Datetime(dt) => write!(f, "{}", dt.to_rfc3339()),
            Self::Date(d) => write!(f, "{}", d),
            Self::Time(t) => write!(f, "{}", t),
        }
    }
}

// ============================================================================
// Conversions from application types
// ============================================================================

/// Application types that can be bound as statement arguments.
pub trait ToValue {
    fn to_value(&self) -> Value;
}

/// Application types that can be filled from a scanned value.
///
/// Implementations coerce liberally: drivers report the same column as text,
/// integer or bytes depending on the protocol in use.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

fn mismatch(target: &str, value: &Value) -> DacError {
    DacError::UnsupportedArgument(format!(
        "cannot convert {} value '{}' into {}",
        value.type_name(),
        value,
        target
    ))
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        value.to_json().unwrap_or(serde_json::Value::Null)
    }
}

macro_rules! int_values {
    ($($ty:ty),*) => {$(
        impl ToValue for $ty {
            fn to_value(&self) -> Value {
                Value::Int(*self as i64)
            }
        }

        impl FromValue for $ty {
            fn from_value(value: Value) -> Result<Self> {
                let raw = value.as_i64().ok_or_else(|| mismatch(stringify!($ty), &value))?;
                <$ty>::try_from(raw).map_err(|_| mismatch(stringify!($ty), &value))
            }
        }

        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                v.to_value()
            }
        }
    )*};
}

int_values!(i8, i16, i32, i64);

macro_rules! uint_values {
    ($($ty:ty),*) => {$(
        impl ToValue for $ty {
            fn to_value(&self) -> Value {
                Value::Uint(*self as u64)
            }
        }

        impl FromValue for $ty {
            fn from_value(value: Value) -> Result<Self> {
                let raw = match &value {
                    Value::Uint(u) => *u,
                    other => {
                        let signed = other.as_i64().ok_or_else(|| mismatch(stringify!($ty), other))?;
                        u64::try_from(signed).map_err(|_| mismatch(stringify!($ty), other))?
                    }
                };
                <$ty>::try_from(raw).map_err(|_| mismatch(stringify!($ty), &value))
            }
        }

        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                v.to_value()
            }
        }
    )*};
}

uint_values!(u16, u32, u64);

impl ToValue for u8 {
    fn to_value(&self) -> Value {
        Value::Byte(*self)
    }
}

impl FromValue for u8 {
    fn from_value(value: Value) -> Result<Self> {
        match &value {
            Value::Byte(b) => Ok(*b),
            Value::Bytes(b) if b.len() == 1 => Ok(b[0]),
            other => {
                let raw = other.as_i64().ok_or_else(|| mismatch("u8", other))?;
                u8::try_from(raw).map_err(|_| mismatch("u8", other))
            }
        }
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Byte(v)
    }
}

impl ToValue for f64 {
    fn to_value(&self) -> Value {
        Value::Float(*self)
    }
}

impl ToValue for f32 {
    fn to_value(&self) -> Value {
        Value::Float(*self as f64)
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        match &value {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            Value::Uint(u) => Ok(*u as f64),
            Value::String(s) => s.trim().parse().map_err(|_| mismatch("f64", &value)),
            Value::Bytes(b) => std::str::from_utf8(b)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| mismatch("f64", &value)),
            other => Err(mismatch("f64", other)),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: Value) -> Result<Self> {
        f64::from_value(value).map(|f| f as f32)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl ToValue for bool {
    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match &value {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            Value::Uint(u) => Ok(*u != 0),
            Value::Byte(b) => Ok(*b != 0),
            Value::String(_) | Value::Bytes(_) => match value.as_str().map(str::trim) {
                Some("1") | Some("t") | Some("true") | Some("TRUE") => Ok(true),
                Some("0") | Some("f") | Some("false") | Some("FALSE") => Ok(false),
                _ => Err(mismatch("bool", &value)),
            },
            other => Err(mismatch("bool", other)),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl ToValue for String {
    fn to_value(&self) -> Value {
        Value::String(self.clone())
    }
}

impl ToValue for &str {
    fn to_value(&self) -> Value {
        Value::String((*self).to_string())
    }
}

impl ToValue for str {
    fn to_value(&self) -> Value {
        Value::String(self.to_string())
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s),
            Value::Bytes(b) => String::from_utf8(b)
                .map_err(|err| DacError::UnsupportedArgument(err.to_string())),
            Value::Json(serde_json::Value::String(s)) => Ok(s),
            Value::Null => Err(mismatch("String", &Value::Null)),
            other => Ok(other.to_string()),
        }
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl ToValue for Vec<u8> {
    fn to_value(&self) -> Value {
        Value::Bytes(self.clone())
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b),
            Value::String(s) => Ok(s.into_bytes()),
            Value::Byte(b) => Ok(vec![b]),
            Value::Json(j) => Ok(serde_json::to_vec(&j)?),
            other => Err(mismatch("bytes", &other)),
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl ToValue for serde_json::Value {
    fn to_value(&self) -> Value {
        Value::Json(self.clone())
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Json(j) => Ok(j),
            Value::Bytes(b) => Ok(serde_json::from_slice(&b)?),
            Value::String(s) => Ok(serde_json::from_str(&s)?),
            other => other.to_json(),
        }
    }
}

impl ToValue for DateTime<Utc> {
    fn to_value(&self) -> Value {
        Value::Datetime(*self)
    }
}

pub(crate) fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    DATETIME_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(text, layout).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: Value) -> Result<Self> {
        match &value {
            Value::Datetime(dt) => Ok(*dt),
            Value::Date(d) => Ok(Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN))),
            Value::Int(secs) => Utc
                .timestamp_opt(*secs, 0)
                .single()
                .ok_or_else(|| mismatch("datetime", &value)),
            Value::String(_) | Value::Bytes(_) | Value::Json(serde_json::Value::String(_)) => {
                let text = match &value {
                    Value::Json(serde_json::Value::String(s)) => Some(s.as_str()),
                    other => other.as_str(),
                };
                text.and_then(parse_datetime)
                    .ok_or_else(|| mismatch("datetime", &value))
            }
            other => Err(mismatch("datetime", other)),
        }
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Datetime(v)
    }
}

impl ToValue for NaiveDate {
    fn to_value(&self) -> Value {
        Value::Date(*self)
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: Value) -> Result<Self> {
        match &value {
            Value::Date(d) => Ok(*d),
            Value::Datetime(dt) => Ok(dt.date_naive()),
            Value::String(_) | Value::Bytes(_) => value
                .as_str()
                .and_then(|s| {
                    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                        .ok()
                        .or_else(|| parse_datetime(s).map(|dt| dt.date_naive()))
                })
                .ok_or_else(|| mismatch("date", &value)),
            other => Err(mismatch("date", other)),
        }
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl ToValue for NaiveTime {
    fn to_value(&self) -> Value {
        Value::Time(*self)
    }
}

impl FromValue for NaiveTime {
    fn from_value(value: Value) -> Result<Self> {
        match &value {
            Value::Time(t) => Ok(*t),
            Value::Datetime(dt) => Ok(dt.time()),
            Value::String(_) | Value::Bytes(_) => value
                .as_str()
                .and_then(|s| NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f").ok())
                .ok_or_else(|| mismatch("time", &value)),
            other => Err(mismatch("time", other)),
        }
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Value::Time(v)
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_value(&self) -> Value {
        match self {
            Some(v) => v.to_value(),
            None => Value::Null,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: ToValue> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.to_value()
    }
}

impl ToValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

/// Wrapper for targets that implement a deserialization capability.
///
/// Scanning into `Json<T>` accepts JSON documents, JSON text and raw bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Json<T>(pub T);

impl<T: Serialize> ToValue for Json<T> {
    fn to_value(&self) -> Value {
        Value::json(&self.0).unwrap_or(Value::Null)
    }
}

impl<T: DeserializeOwned> FromValue for Json<T> {
    fn from_value(value: Value) -> Result<Self> {
        let json = <serde_json::Value as FromValue>::from_value(value)?;
        Ok(Json(serde_json::from_value(json)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_coercion() {
        assert_eq!(i64::from_value(Value::String("42".into())).unwrap(), 42);
        assert_eq!(i32::from_value(Value::Uint(7)).unwrap(), 7);
        assert!(i8::from_value(Value::Int(1000)).is_err());
    }

    #[test]
    fn test_datetime_representations() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap();
        let from_rfc = DateTime::<Utc>::from_value(Value::String(
            "2024-03-01T10:30:00Z".into(),
        ))
        .unwrap();
        let from_mysql =
            DateTime::<Utc>::from_value(Value::Bytes(b"2024-03-01 10:30:00".to_vec())).unwrap();
        let from_unix = DateTime::<Utc>::from_value(Value::Int(expected.timestamp())).unwrap();

        assert_eq!(from_rfc, expected);
        assert_eq!(from_mysql, expected);
        assert_eq!(from_unix, expected);
    }

    #[test]
    fn test_option_and_null() {
        assert_eq!(Option::<String>::from_value(Value::Null).unwrap(), None);
        assert_eq!(
            Option::<String>::from_value(Value::String("a".into())).unwrap(),
            Some("a".to_string())
        );
        assert!(String::from_value(Value::Null).is_err());
    }

    #[test]
    fn test_json_wrapper() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Tags {
            names: Vec<String>,
        }

        let parsed: Json<Tags> =
            Json::from_value(Value::Bytes(br#"{"names":["a","b"]}"#.to_vec())).unwrap();
        assert_eq!(parsed.0.names, vec!["a", "b"]);
    }

    #[test]
    fn test_zero_values() {
        assert!(Value::String(String::new()).is_zero());
        assert!(Value::Int(0).is_zero());
        assert!(!Value::Int(3).is_zero());
        assert!(Value::Null.is_zero());
    }

    #[test]
    fn test_nan_not_representable() {
        assert!(Value::Float(f64::NAN).to_json().is_err());
    }
}
