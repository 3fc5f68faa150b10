//! Audit hooks.
//!
//! Fill the created/modified/deleted by/at columns before a mutation and keep
//! the in-memory version in step with the row afterwards. "By" columns take
//! the principal of the request context; "at" columns take the current time.

use crate::context::{Context, Principal};
use crate::core::{DacError, Result, Value, ValueKind};
use crate::entity::{Column, ColumnKind, Entity, FieldType, Table};
use crate::types;
use chrono::Utc;

fn principal_value(column: &Column, principal: &Principal) -> Result<Value> {
    let kind = match column.field_type() {
        FieldType::Value { type_id, .. } => types::kind_of(*type_id),
        _ => None,
    };
    match kind {
        Some(ValueKind::Int) => principal.as_i64().map(Value::Int).ok_or_else(|| {
            DacError::UnsupportedArgument(format!(
                "principal '{}' is not an integer for column '{}'",
                principal.id(),
                column.name()
            ))
        }),
        _ => Ok(Value::String(principal.id().to_string())),
    }
}

/// Sets a "by" column from the principal. `overwrite` replaces a value
/// already present.
fn fill_by<T: Entity>(ctx: &Context, entity: &mut T, column: &Column, overwrite: bool) -> Result<()> {
    let current = entity.field_value(column.field())?;
    if !overwrite && !current.is_zero() {
        return Ok(());
    }
    match ctx.principal() {
        Some(principal) => entity.set_field_value(column.field(), principal_value(column, principal)?),
        None if current.is_zero() && !column.nullable() => {
            Err(DacError::MissingAuditPrincipal(column.name().to_string()))
        }
        None => Ok(()),
    }
}

fn fill_at<T: Entity>(entity: &mut T, column: &Column, overwrite: bool) -> Result<()> {
    if !overwrite && !entity.field_value(column.field())?.is_zero() {
        return Ok(());
    }
    entity.set_field_value(column.field(), Value::Datetime(Utc::now()))
}

fn fill<T: Entity>(ctx: &Context, entity: &mut T, table: &Table, by: ColumnKind, at: ColumnKind, overwrite: bool) -> Result<()> {
    for column in table.audits(by) {
        fill_by(ctx, entity, column, overwrite)?;
    }
    for column in table.audits(at) {
        fill_at(entity, column, overwrite)?;
    }
    Ok(())
}

/// Creation audits are filled only when zero; the version starts at 1.
pub fn before_insert<T: Entity>(ctx: &Context, entity: &mut T, table: &Table) -> Result<()> {
    fill(ctx, entity, table, ColumnKind::Acb, ColumnKind::Act, false)?;
    if let Some(version) = table.version() {
        entity.set_field_value(version.field(), Value::Int(1))?;
    }
    Ok(())
}

/// Modification audits always record the latest change.
pub fn before_update<T: Entity>(ctx: &Context, entity: &mut T, table: &Table) -> Result<()> {
    fill(ctx, entity, table, ColumnKind::Amb, ColumnKind::Amt, true)
}

pub fn before_soft_delete<T: Entity>(ctx: &Context, entity: &mut T, table: &Table) -> Result<()> {
    fill(ctx, entity, table, ColumnKind::Adb, ColumnKind::Adt, true)
}

/// Mirrors the `v = v + 1` the statement applied.
pub fn bump_version<T: Entity>(entity: &mut T, table: &Table) -> Result<()> {
    let Some(version) = table.version() else {
        return Ok(());
    };
    let current = entity.field_value(version.field())?.as_i64().unwrap_or(0);
    entity.set_field_value(version.field(), Value::Int(current + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Entity;
    use crate::entity::load;
    use chrono::{DateTime, Utc};

    #[derive(Entity, Default, Debug)]
    #[entity(table = "audited")]
    struct Audited {
        #[column("id,pk")]
        id: String,
        #[column("created_by,acb")]
        created_by: i64,
        #[column("created_at,act")]
        created_at: Option<DateTime<Utc>>,
        #[column("modified_by,amb")]
        modified_by: String,
        #[column("modified_at,amt")]
        modified_at: Option<DateTime<Utc>>,
        #[column("deleted_by,adb")]
        deleted_by: Option<String>,
        #[column("deleted_at,adt")]
        deleted_at: Option<DateTime<Utc>>,
        #[column("version,aol")]
        version: i64,
    }

    #[test]
    fn test_insert_fills_creation_and_version() {
        let table = load::<Audited>().unwrap();
        let ctx = Context::new().with_principal(Principal::new("7"));
        let mut row = Audited {
            id: "a".into(),
            version: 9,
            ..Default::default()
        };

        before_insert(&ctx, &mut row, &table).unwrap();
        assert_eq!(row.created_by, 7);
        assert!(row.created_at.is_some());
        assert_eq!(row.version, 1);
        assert!(row.modified_at.is_none());
    }

    #[test]
    fn test_insert_keeps_preset_creator() {
        let table = load::<Audited>().unwrap();
        let mut row = Audited {
            created_by: 3,
            ..Default::default()
        };
        before_insert(&Context::new(), &mut row, &table).unwrap();
        assert_eq!(row.created_by, 3);
    }

    #[test]
    fn test_missing_principal_fails_required_column() {
        let table = load::<Audited>().unwrap();
        let mut row = Audited::default();
        assert_eq!(
            before_insert(&Context::new(), &mut row, &table),
            Err(DacError::MissingAuditPrincipal("created_by".into()))
        );
        // Nullable deletion audits tolerate an anonymous caller.
        before_soft_delete(&Context::new(), &mut row, &table).unwrap();
        assert!(row.deleted_by.is_none());
        assert!(row.deleted_at.is_some());
    }

    #[test]
    fn test_update_overwrites_and_bump_follows() {
        let table = load::<Audited>().unwrap();
        let ctx = Context::new().with_principal(Principal::new("ada"));
        let mut row = Audited {
            modified_by: "old".into(),
            version: 4,
            ..Default::default()
        };
        before_update(&ctx, &mut row, &table).unwrap();
        assert_eq!(row.modified_by, "ada");
        bump_version(&mut row, &table).unwrap();
        assert_eq!(row.version, 5);
    }
}
