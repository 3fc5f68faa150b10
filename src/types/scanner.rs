use crate::core::{FromValue, Result, Value, ValueKind};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

/// A reusable cell filled by the driver's row scan.
///
/// `scan` coerces the driver value into the scanner's kind, `value` returns
/// what was decoded (`Value::Null` when nothing valid was scanned) and `reset`
/// clears the cell for the next row.
pub trait Scanner: Send {
    fn kind(&self) -> ValueKind;
    fn scan(&mut self, src: Value) -> Result<()>;
    fn value(&self) -> Value;
    fn is_valid(&self) -> bool;
    fn reset(&mut self);
}

#[derive(Debug, Clone)]
pub struct KindScanner {
    kind: ValueKind,
    cell: Option<Value>,
}

impl KindScanner {
    pub fn new(kind: ValueKind) -> Self {
        Self { kind, cell: None }
    }
}

pub(crate) fn coerce(kind: ValueKind, src: Value) -> Result<Value> {
    if src.is_null() {
        return Ok(Value::Null);
    }
    Ok(match kind {
        ValueKind::String => Value::String(String::from_value(src)?),
        ValueKind::Int => match src {
            Value::Uint(u) => Value::Uint(u),
            other => Value::Int(i64::from_value(other)?),
        },
        ValueKind::Float => Value::Float(f64::from_value(src)?),
        ValueKind::Bool => Value::Bool(bool::from_value(src)?),
        ValueKind::Datetime => Value::Datetime(DateTime::<Utc>::from_value(src)?),
        ValueKind::Date => Value::Date(NaiveDate::from_value(src)?),
        ValueKind::Time => Value::Time(NaiveTime::from_value(src)?),
        ValueKind::Bytes => Value::Bytes(Vec::<u8>::from_value(src)?),
        ValueKind::Byte => Value::Byte(u8::from_value(src)?),
        ValueKind::Json => Value::Json(serde_json::Value::from_value(src)?),
    })
}

impl Scanner for KindScanner {
    fn kind(&self) -> ValueKind {
        self.kind
    }

    fn scan(&mut self, src: Value) -> Result<()> {
        self.cell = match coerce(self.kind, src)? {
            Value::Null => None,
            value => Some(value),
        };
        Ok(())
    }

    fn value(&self) -> Value {
        self.cell.clone().unwrap_or(Value::Null)
    }

    fn is_valid(&self) -> bool {
        self.cell.is_some()
    }

    fn reset(&mut self) {
        self.cell = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_reset_cycle() {
        let mut scanner = KindScanner::new(ValueKind::Int);
        scanner.scan(Value::Bytes(b"17".to_vec())).unwrap();
        assert!(scanner.is_valid());
        assert_eq!(scanner.value(), Value::Int(17));

        scanner.reset();
        assert!(!scanner.is_valid());
        assert_eq!(scanner.value(), Value::Null);

        scanner.scan(Value::Null).unwrap();
        assert!(!scanner.is_valid());
    }

    #[test]
    fn test_json_scanner_parses_text() {
        let mut scanner = KindScanner::new(ValueKind::Json);
        scanner.scan(Value::String(r#"{"a":1}"#.into())).unwrap();
        assert_eq!(scanner.value(), Value::Json(serde_json::json!({"a": 1})));
    }

    #[test]
    fn test_scan_rejects_incompatible() {
        let mut scanner = KindScanner::new(ValueKind::Date);
        assert!(scanner.scan(Value::Bool(true)).is_err());
    }
}
