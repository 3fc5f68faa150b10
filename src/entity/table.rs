use super::column::{Column, ColumnKind, ColumnOptions, Relation};
use super::{EntityDescriptor, FieldType, cache, tag};
use crate::core::{DacError, Result, ValueKind};
use crate::types;
use std::any::TypeId;
use std::collections::HashMap;

/// How far relations are resolved while building a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Depth {
    /// Every column, relations resolved against their target tables.
    Full,
    /// Stored columns only. Used for relation targets, whose rows are
    /// embedded as flat JSON objects.
    Shallow,
}

/// Normalized description of an entity's table.
#[derive(Debug, Clone)]
pub struct Table {
    type_id: TypeId,
    entity: String,
    schema: String,
    name: String,
    columns: Vec<Column>,
    by_field: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
    keys: Vec<usize>,
    incr_pk: Option<usize>,
    version: Option<usize>,
    conflicts: Vec<usize>,
}

impl Table {
    pub(crate) fn build(descriptor: &EntityDescriptor, depth: Depth) -> Result<Self> {
        let entity = descriptor.name;
        let invalid = |reason: String| DacError::metadata(entity, reason);

        if !tag::is_identifier(descriptor.table) {
            return Err(invalid(format!("invalid table name '{}'", descriptor.table)));
        }
        if !descriptor.schema.is_empty() && !tag::is_identifier(descriptor.schema) {
            return Err(invalid(format!("invalid schema name '{}'", descriptor.schema)));
        }

        let mut table = Table {
            type_id: descriptor.type_id,
            entity: entity.to_string(),
            schema: descriptor.schema.to_string(),
            name: descriptor.table.to_string(),
            columns: Vec::with_capacity(descriptor.fields.len()),
            by_field: HashMap::new(),
            by_name: HashMap::new(),
            keys: Vec::new(),
            incr_pk: None,
            version: None,
            conflicts: Vec::new(),
        };

        for field in &descriptor.fields {
            let parsed = tag::parse(field.tag)
                .map_err(|reason| invalid(format!("field '{}': {}", field.field, reason)))?;
            if depth == Depth::Shallow && !parsed.kind.is_stored() {
                continue;
            }
            check_field_type(descriptor, parsed.kind, &field.field_type)
                .map_err(|reason| invalid(format!("field '{}': {}", field.field, reason)))?;

            let options = match parsed.kind {
                ColumnKind::Virtual => ColumnOptions::Virtual(parsed.options.clone()),
                kind if kind.is_relation() => {
                    let relation = tag::parse_relation(kind, &parsed.options)
                        .map_err(|reason| invalid(format!("field '{}': {}", field.field, reason)))?;
                    let FieldType::Entity { descriptor: target, .. } = field.field_type else {
                        return Err(invalid(format!("field '{}' is not an entity", field.field)));
                    };
                    ColumnOptions::Relation(Relation {
                        host: relation.host,
                        target: relation.target,
                        table: cache::load_target(target)?,
                        orders: relation.orders,
                        range: relation.range,
                    })
                }
                _ => ColumnOptions::None,
            };

            let idx = table.columns.len();
            if table.by_name.insert(parsed.name.clone(), idx).is_some() {
                return Err(invalid(format!("duplicate column '{}'", parsed.name)));
            }
            table.by_field.insert(field.field.to_string(), idx);
            table.columns.push(Column {
                field: field.field.to_string(),
                name: parsed.name,
                kind: parsed.kind,
                conflict: parsed.conflict,
                options,
                field_type: field.field_type,
            });
        }

        table.index()?;
        table.check_relations()?;
        Ok(table)
    }

    fn index(&mut self) -> Result<()> {
        for (idx, column) in self.columns.iter().enumerate() {
            match column.kind {
                ColumnKind::Pk => self.keys.push(idx),
                ColumnKind::IncrPk => {
                    if self.incr_pk.replace(idx).is_some() {
                        return Err(DacError::metadata(&self.entity, "more than one incrpk column"));
                    }
                    self.keys.push(idx);
                }
                ColumnKind::Aol => {
                    if self.version.replace(idx).is_some() {
                        return Err(DacError::metadata(&self.entity, "more than one aol column"));
                    }
                }
                _ => {}
            }
            if column.conflict {
                self.conflicts.push(idx);
            }
        }
        Ok(())
    }

    fn check_relations(&self) -> Result<()> {
        for column in &self.columns {
            let Some(relation) = column.relation() else {
                continue;
            };
            let host = self.column_by_name(&relation.host).filter(|c| c.kind.is_stored());
            if host.is_none() {
                return Err(DacError::metadata(
                    &self.entity,
                    format!(
                        "{} '{}': host column '{}' not found",
                        column.kind, column.name, relation.host
                    ),
                ));
            }
            let target = relation.table.column_by_name(&relation.target);
            if target.is_none() {
                return Err(DacError::metadata(
                    &self.entity,
                    format!(
                        "{} '{}': target column '{}' not found on '{}'",
                        column.kind,
                        column.name,
                        relation.target,
                        relation.table.name()
                    ),
                ));
            }
            if column.kind == ColumnKind::Ref && !target.is_some_and(|c| c.kind.is_key()) {
                return Err(DacError::metadata(
                    &self.entity,
                    format!(
                        "ref '{}': target column '{}' is not a key",
                        column.name, relation.target
                    ),
                ));
            }
            for order in relation.orders.iter() {
                if relation.table.lookup(order.field()).is_none() {
                    return Err(DacError::metadata(
                        &self.entity,
                        format!("links '{}': unknown order field '{}'", column.name, order.field()),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Application type name, for error messages.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, field: &str) -> Option<&Column> {
        self.by_field.get(field).map(|idx| &self.columns[*idx])
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.by_name.get(name).map(|idx| &self.columns[*idx])
    }

    /// Resolves an application field name, falling back to the column name.
    pub fn lookup(&self, field_or_name: &str) -> Option<&Column> {
        self.column(field_or_name)
            .or_else(|| self.column_by_name(field_or_name))
    }

    /// `pk` and `incrpk` columns in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &Column> {
        self.keys.iter().map(|idx| &self.columns[*idx])
    }

    pub fn has_key(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn incr_pk(&self) -> Option<&Column> {
        self.incr_pk.map(|idx| &self.columns[idx])
    }

    pub fn version(&self) -> Option<&Column> {
        self.version.map(|idx| &self.columns[idx])
    }

    pub fn audits(&self, kind: ColumnKind) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(move |c| c.kind == kind)
    }

    /// Upsert conflict target: flagged conflict columns, or the keys when
    /// none are flagged.
    pub fn conflict_columns(&self) -> Vec<&Column> {
        let source = if self.conflicts.is_empty() {
            &self.keys
        } else {
            &self.conflicts
        };
        source.iter().map(|idx| &self.columns[*idx]).collect()
    }

    pub fn has_soft_delete(&self) -> bool {
        self.columns
            .iter()
            .any(|c| matches!(c.kind, ColumnKind::Adb | ColumnKind::Adt))
    }

    pub fn insertable(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_insertable())
    }

    pub fn updatable(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_updatable())
    }

    /// Fails when a mutating statement is requested on a table without keys.
    pub fn require_key(&self, operation: &str) -> Result<()> {
        if self.has_key() {
            Ok(())
        } else {
            Err(DacError::metadata(
                &self.entity,
                format!("{} requires a pk or incrpk column", operation),
            ))
        }
    }
}

fn check_field_type(
    descriptor: &EntityDescriptor,
    kind: ColumnKind,
    field_type: &FieldType,
) -> std::result::Result<(), String> {
    let value_kind = match field_type {
        FieldType::Value { type_id, .. } => types::kind_of(*type_id),
        _ => None,
    };
    let type_name = field_type.type_name();
    let expect = |ok: bool, what: &str| {
        if ok {
            Ok(())
        } else {
            Err(format!("{} column must be {}, found {}", kind, what, type_name))
        }
    };

    match kind {
        ColumnKind::Pk => expect(
            matches!(value_kind, Some(ValueKind::String | ValueKind::Int)),
            "a string or integer",
        ),
        ColumnKind::IncrPk | ColumnKind::Aol => {
            expect(value_kind == Some(ValueKind::Int), "an integer")
        }
        ColumnKind::Acb | ColumnKind::Amb | ColumnKind::Adb => expect(
            matches!(value_kind, Some(ValueKind::String | ValueKind::Int)),
            "a string or integer",
        ),
        ColumnKind::Act | ColumnKind::Amt | ColumnKind::Adt => {
            expect(value_kind == Some(ValueKind::Datetime), "a datetime")
        }
        ColumnKind::Json => expect(matches!(field_type, FieldType::Json { .. }), "serializable"),
        ColumnKind::Normal | ColumnKind::Virtual => expect(
            value_kind.is_some() || matches!(field_type, FieldType::Json { .. }),
            "a registered value type",
        ),
        ColumnKind::Ref | ColumnKind::Link => expect(
            matches!(field_type, FieldType::Entity { many: false, .. }),
            "an optional entity",
        ),
        ColumnKind::Links => expect(
            matches!(field_type, FieldType::Entity { many: true, .. }),
            "a vector of entities",
        ),
        ColumnKind::Tree => expect(
            matches!(field_type, FieldType::Entity { many: true, type_id, .. } if *type_id == descriptor.type_id),
            "a vector of the entity itself",
        ),
    }
}
