// ============================================================================
// Rows Buffer
// ============================================================================
//
// Driver-agnostic result set. A `Rows` is either
//
//   * streaming: wraps a driver cursor, each fetched row is decoded by the
//     scanner registered for the column's database type, or
//   * materialized: every row is held in memory, the form rows take after
//     crossing the endpoint boundary as JSON.
//
// Serialized shape:
//
//   { "columns": [{"name": "id", "databaseType": "INT", "nullable": false}],
//     "values":  [[{"nil": false, "value": {...argument envelope...}}]] }
//
// A never-iterated Rows is drained on `materialize`; one that was stepped
// through, streaming or not, can no longer be materialized.
//
// ============================================================================

use crate::core::{DacError, FromValue, Result, Value};
use crate::driver::Cursor;
use crate::entity::Entity;
use crate::types::{self, Scanner};
use serde::{Deserialize, Serialize};
use std::any::Any;

/// Name and database type of a result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnType {
    name: String,
    database_type: String,
    #[serde(default)]
    nullable: bool,
}

impl ColumnType {
    pub fn new(name: impl Into<String>, database_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            database_type: database_type.into(),
            nullable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database_type(&self) -> &str {
        &self.database_type
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }

    fn scanner(&self) -> Option<Box<dyn Scanner>> {
        types::lookup_by_database_type(&self.database_type).map(|vt| vt.scanner())
    }
}

/// One cell of a row. Serializes as `{nil, value}`; a null or invalid
/// scanner yields the null sentinel.
#[derive(Debug, Clone, PartialEq)]
pub struct Column(Value);

impl Column {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_null()
    }
}

#[derive(Serialize, Deserialize)]
struct ColumnEnvelope {
    nil: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
}

impl Serialize for Column {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        ColumnEnvelope {
            nil: self.is_nil(),
            value: (!self.is_nil()).then(|| self.0.clone()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Column {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let envelope = ColumnEnvelope::deserialize(deserializer)?;
        Ok(match (envelope.nil, envelope.value) {
            (false, Some(value)) => Column(value),
            _ => Column(Value::Null),
        })
    }
}

/// Ordered cells mirroring the result's column types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Vec<Column>);

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values.into_iter().map(Column).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx).map(Column::value)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.iter().map(Column::value)
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0.into_iter().map(Column::into_value).collect()
    }
}

/// Anything a row cell can be scanned into.
pub trait ScanTarget {
    fn scan_value(&mut self, value: Value) -> Result<()>;
}

impl<T: FromValue> ScanTarget for T {
    fn scan_value(&mut self, value: Value) -> Result<()> {
        *self = T::from_value(value)?;
        Ok(())
    }
}

enum State {
    Streaming {
        cursor: Box<dyn Cursor>,
        scanners: Vec<Option<Box<dyn Scanner>>>,
        current: Option<Row>,
        started: bool,
        done: bool,
        _keep_alive: Option<Box<dyn Any + Send>>,
    },
    Materialized {
        rows: Vec<Row>,
        // 0 is before the first row.
        position: usize,
    },
}

pub struct Rows {
    columns: Vec<ColumnType>,
    state: State,
}

impl Rows {
    /// Wraps a live driver cursor.
    pub fn streaming(cursor: Box<dyn Cursor>) -> Self {
        Self::streaming_with(cursor, None)
    }

    /// Wraps a live cursor together with whatever must stay alive until it
    /// is drained (a pooled connection, a statement lease).
    pub fn streaming_with(cursor: Box<dyn Cursor>, keep_alive: Option<Box<dyn Any + Send>>) -> Self {
        let columns = cursor.columns().to_vec();
        let scanners = columns.iter().map(ColumnType::scanner).collect();
        Self {
            columns,
            state: State::Streaming {
                cursor,
                scanners,
                current: None,
                started: false,
                done: false,
                _keep_alive: keep_alive,
            },
        }
    }

    pub fn materialized(columns: Vec<ColumnType>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            state: State::Materialized { rows, position: 0 },
        }
    }

    pub fn empty() -> Self {
        Self::materialized(Vec::new(), Vec::new())
    }

    pub fn columns(&self) -> &[ColumnType] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(ColumnType::name).collect()
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self.state, State::Materialized { .. })
    }

    /// Row count; only known once materialized.
    pub fn len(&self) -> Option<usize> {
        match &self.state {
            State::Materialized { rows, .. } => Some(rows.len()),
            State::Streaming { .. } => None,
        }
    }

    /// Advances to the next row. Returns `false` when exhausted; a streaming
    /// cursor is closed at that point.
    pub async fn next(&mut self) -> Result<bool> {
        match &mut self.state {
            State::Materialized { rows, position } => {
                if *position < rows.len() {
                    *position += 1;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            State::Streaming {
                cursor,
                scanners,
                current,
                started,
                done,
                ..
            } => {
                *started = true;
                if *done {
                    *current = None;
                    return Ok(false);
                }
                match cursor.next_row().await? {
                    Some(raw) => {
                        *current = Some(decode_row(scanners, raw)?);
                        Ok(true)
                    }
                    None => {
                        *done = true;
                        *current = None;
                        cursor.close().await?;
                        Ok(false)
                    }
                }
            }
        }
    }

    /// The row the cursor currently points at.
    pub fn current(&self) -> Option<&Row> {
        match &self.state {
            State::Materialized { rows, position } => position.checked_sub(1).and_then(|i| rows.get(i)),
            State::Streaming { current, .. } => current.as_ref(),
        }
    }

    /// Copies the current row into `targets`, coercing each cell into the
    /// target's type.
    pub fn scan(&self, targets: &mut [&mut dyn ScanTarget]) -> Result<()> {
        if targets.len() != self.columns.len() {
            return Err(DacError::InvalidScanArity {
                columns: self.columns.len(),
                targets: targets.len(),
            });
        }
        let row = self
            .current()
            .ok_or_else(|| DacError::database("scan", "no current row"))?;
        for (target, value) in targets.iter_mut().zip(row.values()) {
            target.scan_value(value.clone())?;
        }
        Ok(())
    }

    /// Drains never-iterated rows into memory and closes the cursor. Rows
    /// that were already stepped through fail in both modes.
    pub async fn materialize(&mut self) -> Result<()> {
        let rows = match &mut self.state {
            State::Materialized { position, .. } => {
                if *position > 0 {
                    return Err(DacError::database(
                        "materialize",
                        "rows were partially iterated",
                    ));
                }
                return Ok(());
            }
            State::Streaming {
                cursor,
                scanners,
                started,
                ..
            } => {
                if *started {
                    return Err(DacError::database(
                        "materialize",
                        "rows were partially iterated",
                    ));
                }
                let mut rows = Vec::new();
                while let Some(raw) = cursor.next_row().await? {
                    rows.push(decode_row(scanners, raw)?);
                }
                cursor.close().await?;
                rows
            }
        };
        self.state = State::Materialized { rows, position: 0 };
        Ok(())
    }

    pub async fn into_materialized(mut self) -> Result<Self> {
        self.materialize().await?;
        Ok(self)
    }

    /// JSON form for cross-service transport. Forces a full drain first.
    pub async fn marshal(&mut self) -> Result<Vec<u8>> {
        self.materialize().await?;
        Ok(serde_json::to_vec(&*self)?)
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Every remaining row as raw values.
    pub async fn collect_rows(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while self.next().await? {
            if let Some(row) = self.current() {
                rows.push(row.clone());
            }
        }
        Ok(rows)
    }

    /// Every remaining row decoded into `T` by column name.
    pub async fn collect_entities<T: Entity>(mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while self.next().await? {
            if let Some(row) = self.current() {
                out.push(crate::entity::decode_entity::<T>(&self.columns, row)?);
            }
        }
        Ok(out)
    }

    /// First column of the first row, e.g. for `COUNT(1)` results.
    pub async fn first_value(mut self) -> Result<Option<Value>> {
        if !self.next().await? {
            return Ok(None);
        }
        Ok(self.current().and_then(|row| row.get(0)).cloned())
    }
}

fn decode_row(scanners: &mut [Option<Box<dyn Scanner>>], raw: Vec<Value>) -> Result<Row> {
    let mut cells = Vec::with_capacity(raw.len());
    for (idx, value) in raw.into_iter().enumerate() {
        match scanners.get_mut(idx).and_then(Option::as_mut) {
            Some(scanner) => {
                scanner.reset();
                scanner.scan(value)?;
                cells.push(scanner.value());
            }
            None => cells.push(value),
        }
    }
    Ok(Row::new(cells))
}

#[derive(Serialize)]
struct Wire<'a> {
    columns: &'a [ColumnType],
    values: &'a [Row],
}

impl Serialize for Rows {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match &self.state {
            State::Materialized { rows, .. } => Wire {
                columns: &self.columns,
                values: rows,
            }
            .serialize(serializer),
            State::Streaming { .. } => Err(serde::ser::Error::custom(
                "streaming rows must be materialized before serialization",
            )),
        }
    }
}

impl<'de> Deserialize<'de> for Rows {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Owned {
            columns: Vec<ColumnType>,
            #[serde(default)]
            values: Vec<Row>,
        }

        let wire = Owned::deserialize(deserializer)?;
        Ok(Rows::materialized(wire.columns, wire.values))
    }
}

impl std::fmt::Debug for Rows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows")
            .field("columns", &self.columns)
            .field("materialized", &self.is_materialized())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::VecCursor;
    use chrono::{DateTime, TimeZone, Utc};

    fn users() -> Rows {
        Rows::streaming(Box::new(VecCursor::new(
            vec![
                ColumnType::new("id", "VARCHAR(32)", false),
                ColumnType::new("age", "INT", true),
                ColumnType::new("created_at", "DATETIME", false),
            ],
            vec![
                vec![
                    Value::Bytes(b"u1".to_vec()),
                    Value::Bytes(b"36".to_vec()),
                    Value::Bytes(b"2024-01-02 03:04:05".to_vec()),
                ],
                vec![
                    Value::String("u2".into()),
                    Value::Null,
                    Value::String("2024-01-03T00:00:00Z".into()),
                ],
            ],
        )))
    }

    #[tokio::test]
    async fn test_streaming_scan_coerces_by_column_type() {
        let mut rows = users();
        assert!(rows.next().await.unwrap());

        let mut id = String::new();
        let mut age: Option<i64> = None;
        let mut created = DateTime::<Utc>::default();
        rows.scan(&mut [&mut id, &mut age, &mut created]).unwrap();

        assert_eq!(id, "u1");
        assert_eq!(age, Some(36));
        assert_eq!(created, Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());

        assert!(rows.next().await.unwrap());
        rows.scan(&mut [&mut id, &mut age, &mut created]).unwrap();
        assert_eq!(age, None);
        assert!(!rows.next().await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_arity_mismatch() {
        let mut rows = users();
        rows.next().await.unwrap();
        let mut id = String::new();
        let err = rows.scan(&mut [&mut id]).unwrap_err();
        assert_eq!(
            err,
            DacError::InvalidScanArity {
                columns: 3,
                targets: 1
            }
        );
    }

    #[tokio::test]
    async fn test_marshal_round_trip() {
        let mut rows = users();
        let bytes = rows.marshal().await.unwrap();
        let mut parsed = Rows::unmarshal(&bytes).unwrap();

        assert_eq!(parsed.columns(), rows.columns());
        assert_eq!(parsed.len(), rows.len());
        assert_eq!(parsed.len(), Some(2));

        // Marshalling again yields the same document.
        assert_eq!(rows.marshal().await.unwrap(), bytes);

        assert!(parsed.next().await.unwrap());
        let mut id = String::new();
        let mut age: Option<i64> = None;
        let mut created = DateTime::<Utc>::default();
        parsed.scan(&mut [&mut id, &mut age, &mut created]).unwrap();
        assert_eq!((id.as_str(), age), ("u1", Some(36)));
    }

    #[tokio::test]
    async fn test_partially_iterated_cannot_marshal() {
        let mut rows = users();
        rows.next().await.unwrap();
        assert!(rows.marshal().await.is_err());
    }

    #[tokio::test]
    async fn test_stepped_materialized_rows_cannot_marshal() {
        let mut rows = users().into_materialized().await.unwrap();
        assert!(rows.marshal().await.is_ok());

        assert!(rows.next().await.unwrap());
        assert!(rows.marshal().await.is_err());
        // The walk continues where it was.
        assert!(rows.next().await.unwrap());
        assert!(!rows.next().await.unwrap());
    }

    #[tokio::test]
    async fn test_null_cells_use_sentinel() {
        let mut rows = users();
        rows.materialize().await.unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&rows.marshal().await.unwrap()).unwrap();
        assert_eq!(json["values"][1][1], serde_json::json!({"nil": true}));
        assert_eq!(json["columns"][0]["databaseType"], "VARCHAR(32)");
    }
}
