use super::{KindScanner, ValueType};
use crate::core::{Result, Value, ValueKind};
use crate::types::scanner::coerce;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

/// JSON text of the value; the serialized column envelope embeds it as is.
pub fn encode_json(value: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&value.to_json()?)?)
}

fn decode_as(kind: ValueKind, bytes: &[u8]) -> Result<Value> {
    let json: serde_json::Value = serde_json::from_slice(bytes)?;
    if kind == ValueKind::Json {
        return Ok(Value::Json(json));
    }
    coerce(kind, Value::from_json(json))
}

macro_rules! decoders {
    ($($name:ident => $kind:expr),* $(,)?) => {$(
        pub fn $name(bytes: &[u8]) -> Result<Value> {
            decode_as($kind, bytes)
        }
    )*};
}

decoders! {
    decode_string => ValueKind::String,
    decode_int => ValueKind::Int,
    decode_float => ValueKind::Float,
    decode_bool => ValueKind::Bool,
    decode_datetime => ValueKind::Datetime,
    decode_date => ValueKind::Date,
    decode_time => ValueKind::Time,
    decode_bytes => ValueKind::Bytes,
    decode_byte => ValueKind::Byte,
    decode_json => ValueKind::Json,
}

macro_rules! scanner_factory {
    ($kind:expr) => {
        || Box::new(KindScanner::new($kind))
    };
}

pub(crate) fn value_types() -> Vec<ValueType> {
    vec![
        ValueType::new::<String>(
            ValueKind::String,
            &["char", "text", "string", "uuid", "enum"],
            encode_json,
            decode_string,
            scanner_factory!(ValueKind::String),
        ),
        ValueType::new::<i64>(
            ValueKind::Int,
            &["int", "serial"],
            encode_json,
            decode_int,
            scanner_factory!(ValueKind::Int),
        ),
        ValueType::new::<f64>(
            ValueKind::Float,
            &["float", "double", "real", "decimal", "numeric"],
            encode_json,
            decode_float,
            scanner_factory!(ValueKind::Float),
        ),
        ValueType::new::<bool>(
            ValueKind::Bool,
            &["bool", "bit"],
            encode_json,
            decode_bool,
            scanner_factory!(ValueKind::Bool),
        ),
        ValueType::new::<DateTime<Utc>>(
            ValueKind::Datetime,
            &["datetime", "timestamp"],
            encode_json,
            decode_datetime,
            scanner_factory!(ValueKind::Datetime),
        ),
        ValueType::new::<NaiveDate>(
            ValueKind::Date,
            &["date"],
            encode_json,
            decode_date,
            scanner_factory!(ValueKind::Date),
        ),
        ValueType::new::<NaiveTime>(
            ValueKind::Time,
            &["time"],
            encode_json,
            decode_time,
            scanner_factory!(ValueKind::Time),
        ),
        ValueType::new::<Vec<u8>>(
            ValueKind::Bytes,
            &["bytea", "blob", "binary"],
            encode_json,
            decode_bytes,
            scanner_factory!(ValueKind::Bytes),
        ),
        ValueType::new::<u8>(
            ValueKind::Byte,
            &["byte"],
            encode_json,
            decode_byte,
            scanner_factory!(ValueKind::Byte),
        ),
        ValueType::new::<serde_json::Value>(
            ValueKind::Json,
            &["json"],
            encode_json,
            decode_json,
            scanner_factory!(ValueKind::Json),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_codec_round_trip_keeps_kind() {
        let at = Utc.with_ymd_and_hms(2023, 12, 24, 18, 0, 0).unwrap();
        let cases = vec![
            (Value::String("ada".into()), decode_string as fn(&[u8]) -> Result<Value>),
            (Value::Int(-4), decode_int),
            (Value::Datetime(at), decode_datetime),
            (
                Value::Date(NaiveDate::from_ymd_opt(2020, 2, 29).unwrap()),
                decode_date,
            ),
            (Value::Bytes(vec![0, 1, 255]), decode_bytes),
            (Value::Json(serde_json::json!({"k": [1, 2]})), decode_json),
        ];

        for (value, decode) in cases {
            let bytes = encode_json(&value).unwrap();
            assert_eq!(decode(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn test_decode_null() {
        assert_eq!(decode_int(b"null").unwrap(), Value::Null);
    }
}
