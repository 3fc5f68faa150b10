// ============================================================================
// Entity Metadata
// ============================================================================
//
// `#[derive(Entity)]` describes a struct's tagged fields; this module turns
// that description into a normalized `Table`: columns with their kinds,
// key/version/audit/conflict indexes and resolved relations. Tags are parsed
// here at first use, so malformed tags surface as `MetadataInvalid`.
//
//   #[derive(Entity, Default)]
//   #[entity(table = "users")]
//   struct User {
//       #[column("id,pk")]       id: String,
//       #[column("name")]        name: String,
//       #[column("version,aol")] version: i64,
//   }
//
// ============================================================================

pub mod cache;
pub mod column;
pub mod table;
pub mod tag;

use crate::core::{DacError, Result, Value};
use crate::rows::{ColumnType, Row};
use std::any::TypeId;

pub use cache::{load, load_descriptor};
pub use column::{Column, ColumnKind, ColumnOptions, Relation};
pub use table::Table;

/// A struct mapped to a table. Implemented by `#[derive(Entity)]`.
pub trait Entity: Default + Send + Sync + 'static {
    fn descriptor() -> EntityDescriptor;

    /// Current value of a tagged field, by application field name.
    fn field_value(&self, field: &str) -> Result<Value>;

    /// Assigns a tagged field from a scanned value.
    fn set_field_value(&mut self, field: &str, value: Value) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub type_id: TypeId,
    pub name: &'static str,
    pub schema: &'static str,
    pub table: &'static str,
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub field: &'static str,
    pub tag: &'static str,
    pub field_type: FieldType,
}

/// Rust-side shape of a tagged field.
#[derive(Debug, Clone, Copy)]
pub enum FieldType {
    /// A value type, `Option<T>` when nullable.
    Value {
        type_id: TypeId,
        type_name: &'static str,
        nullable: bool,
    },
    /// Any serde type, stored as a JSON document.
    Json {
        type_name: &'static str,
        nullable: bool,
    },
    /// Another entity: `Option<T>`/`Option<Box<T>>` for ref and link,
    /// `Vec<T>` for links and tree.
    Entity {
        descriptor: fn() -> EntityDescriptor,
        type_id: TypeId,
        type_name: &'static str,
        many: bool,
    },
}

impl FieldType {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Value { type_name, .. }
            | Self::Json { type_name, .. }
            | Self::Entity { type_name, .. } => type_name,
        }
    }

    pub fn nullable(&self) -> bool {
        match self {
            Self::Value { nullable, .. } | Self::Json { nullable, .. } => *nullable,
            Self::Entity { .. } => true,
        }
    }
}

/// Fills a fresh `T` from a result row, matching columns by name. Columns
/// unknown to `T` are ignored.
pub fn decode_entity<T: Entity>(columns: &[ColumnType], row: &Row) -> Result<T> {
    let table = load::<T>()?;
    let mut entity = T::default();
    for (column, value) in columns.iter().zip(row.values()) {
        if let Some(mapped) = table.column_by_name(column.name()) {
            entity
                .set_field_value(mapped.field(), value.clone())
                .map_err(|err| field_error(&table, mapped, err))?;
        }
    }
    Ok(entity)
}

fn field_error(table: &Table, column: &Column, err: DacError) -> DacError {
    match err {
        DacError::UnsupportedArgument(reason) => DacError::UnsupportedArgument(format!(
            "{}.{}: {}",
            table.entity(),
            column.field(),
            reason
        )),
        other => other,
    }
}

fn json_document(value: Value) -> Result<serde_json::Value> {
    match value {
        Value::Null => Ok(serde_json::Value::Null),
        Value::Json(json) => Ok(json),
        Value::String(text) => Ok(serde_json::from_str(&text)?),
        Value::Bytes(bytes) => Ok(serde_json::from_slice(&bytes)?),
        other => Err(DacError::UnsupportedArgument(format!(
            "expected a JSON document, found {}",
            other.type_name()
        ))),
    }
}

fn from_json_object<T: Entity>(object: serde_json::Map<String, serde_json::Value>) -> Result<T> {
    let table = cache::load_target(T::descriptor)?;
    let mut entity = T::default();
    for (key, json) in object {
        let Some(column) = table.column_by_name(&key) else {
            continue;
        };
        let value = match column.kind() {
            ColumnKind::Json => Value::Json(json),
            _ => Value::from_json(json),
        };
        entity
            .set_field_value(column.field(), value)
            .map_err(|err| field_error(&table, column, err))?;
    }
    Ok(entity)
}

/// Decodes a `ref`/`link` projection: one JSON object or null.
pub fn decode_one<T: Entity>(value: Value) -> Result<Option<T>> {
    match json_document(value)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(object) => from_json_object(object).map(Some),
        other => Err(DacError::UnsupportedArgument(format!(
            "expected a JSON object, found {}",
            other
        ))),
    }
}

/// Decodes a `links`/`tree` projection: a JSON array of objects.
pub fn decode_many<T: Entity>(value: Value) -> Result<Vec<T>> {
    match json_document(value)? {
        serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter(|item| !item.is_null())
            .map(|item| match item {
                serde_json::Value::Object(object) => from_json_object(object),
                other => Err(DacError::UnsupportedArgument(format!(
                    "expected a JSON object, found {}",
                    other
                ))),
            })
            .collect(),
        other => Err(DacError::UnsupportedArgument(format!(
            "expected a JSON array, found {}",
            other
        ))),
    }
}

/// Decodes a `json` column into its serde type.
pub fn decode_json<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(json_document(value)?)?)
}

/// Encodes a `json` column; `None`-like documents become SQL NULL.
pub fn encode_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    match Value::json(value)? {
        Value::Json(serde_json::Value::Null) => Ok(Value::Null),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Entity;
    use chrono::{DateTime, Utc};

    #[derive(Entity, Default, Debug, Clone, PartialEq)]
    #[entity(table = "teams", schema = "app")]
    struct Team {
        #[column("id,pk")]
        id: i64,
        #[column("title")]
        title: String,
    }

    #[derive(Entity, Default, Debug, Clone, PartialEq)]
    #[entity(table = "members")]
    struct Member {
        #[column("id,pk")]
        id: String,
        #[column("email,+conflict")]
        email: String,
        #[column("team_id")]
        team_id: i64,
        #[column("tags,json")]
        tags: Vec<String>,
        #[column("team,ref,team_id+id")]
        team: Option<Box<Team>>,
        #[column("mentor_id")]
        mentor_id: Option<String>,
        #[column("reports,tree,id+mentor_id")]
        reports: Vec<Member>,
        #[column("score,vc,SELECT COUNT(1) FROM points WHERE points.member_id = members.id")]
        score: i64,
        #[column("created_by,acb")]
        created_by: String,
        #[column("created_at,act")]
        created_at: DateTime<Utc>,
        #[column("version,aol")]
        version: i64,
        cache_only: u32,
    }

    #[derive(Entity, Default)]
    #[entity(table = "broken")]
    struct TwoVersions {
        #[column("id,pk")]
        id: String,
        #[column("v1,aol")]
        v1: i64,
        #[column("v2,aol")]
        v2: i64,
    }

    #[derive(Entity, Default)]
    #[entity(table = "broken_at")]
    struct WrongAuditType {
        #[column("id,pk")]
        id: String,
        #[column("created_at,act")]
        created_at: String,
    }

    #[derive(Entity, Default)]
    #[entity(table = "dangling")]
    struct DanglingRef {
        #[column("id,pk")]
        id: String,
        #[column("team,ref,nope+id")]
        team: Option<Team>,
    }

    #[derive(Entity, Default)]
    #[entity(table = "log_lines")]
    struct LogLine {
        #[column("line")]
        line: String,
    }

    #[test]
    fn test_load_indexes_columns() {
        let table = load::<Member>().unwrap();
        assert_eq!(table.name(), "members");
        assert_eq!(table.schema(), "");
        assert_eq!(table.keys().map(Column::name).collect::<Vec<_>>(), vec!["id"]);
        assert_eq!(table.version().unwrap().name(), "version");
        assert_eq!(
            table.conflict_columns().iter().map(|c| c.name()).collect::<Vec<_>>(),
            vec!["email"]
        );
        assert!(table.lookup("cache_only").is_none());
        assert!(!table.has_soft_delete());

        let insertable: Vec<_> = table.insertable().map(Column::name).collect();
        assert_eq!(
            insertable,
            vec!["id", "email", "team_id", "tags", "mentor_id", "created_by", "created_at", "version"]
        );

        let team = table.column("team").unwrap().relation().unwrap();
        assert_eq!(team.host, "team_id");
        assert_eq!(team.table.schema(), "app");
        assert!(cache::cached() >= 1);
    }

    #[test]
    fn test_load_is_cached() {
        let first = load::<Team>().unwrap();
        let second = load::<Team>().unwrap();
        assert!(std::sync::Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_invalid_metadata() {
        assert_eq!(load::<TwoVersions>().unwrap_err().code(), "MetadataInvalid");
        assert_eq!(load::<WrongAuditType>().unwrap_err().code(), "MetadataInvalid");
        assert_eq!(load::<DanglingRef>().unwrap_err().code(), "MetadataInvalid");

        let keyless = load::<LogLine>().unwrap();
        assert!(keyless.require_key("update").is_err());
    }

    #[test]
    fn test_decode_entity_with_relations() {
        let columns = vec![
            ColumnType::new("id", "VARCHAR", false),
            ColumnType::new("tags", "JSON", true),
            ColumnType::new("team", "JSON", true),
            ColumnType::new("reports", "TEXT", true),
            ColumnType::new("unrelated", "INT", true),
        ];
        let row = Row::new(vec![
            Value::String("m1".into()),
            Value::Bytes(br#"["a","b"]"#.to_vec()),
            Value::Json(serde_json::json!({"id": 7, "title": "core"})),
            Value::String(r#"[{"id":"m2","email":"b@x","mentor_id":"m1"}]"#.into()),
            Value::Int(1),
        ]);

        let member: Member = decode_entity(&columns, &row).unwrap();
        assert_eq!(member.id, "m1");
        assert_eq!(member.tags, vec!["a", "b"]);
        assert_eq!(
            member.team.as_deref(),
            Some(&Team {
                id: 7,
                title: "core".into()
            })
        );
        assert_eq!(member.reports.len(), 1);
        assert_eq!(member.reports[0].mentor_id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_field_accessors() {
        let mut member = Member::default();
        member.set_field_value("email", Value::String("a@x".into())).unwrap();
        assert_eq!(member.field_value("email").unwrap(), Value::String("a@x".into()));
        assert_eq!(member.field_value("mentor_id").unwrap(), Value::Null);
        assert_eq!(
            member.field_value("tags").unwrap(),
            Value::Json(serde_json::json!([]))
        );
        assert_eq!(
            member.field_value("nope").unwrap_err().code(),
            "UnknownField"
        );
    }
}
