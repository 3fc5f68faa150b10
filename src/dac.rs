// ============================================================================
// Entity Operations
// ============================================================================
//
// Typed data access over the endpoint functions: each operation loads the
// entity's table, renders the statement in the dialect of the addressed
// endpoint, binds the entity's fields, runs the audit hooks and sends the
// statement through `Client`. Inside a transaction (see `Client::begin`) the
// statements ride along on the context.
//
//   let dac = Dac::default();
//   let mut user = User { id: "u1".into(), name: "Ada".into(), ..Default::default() };
//   dac.insert(&ctx, &mut user).await?;
//   let found = dac.query_one::<User>(&ctx, Condition::eq("id", "u1")).await?;
//
// ============================================================================

use crate::argument::Argument;
use crate::audit;
use crate::condition::{Condition, Page, Range, SubQuery};
use crate::context::Context;
use crate::core::{DacError, Result, Value};
use crate::dialect::{Dialect, QueryOptions, Template};
use crate::driver::ExecResult;
use crate::endpoint::Client;
use crate::entity::{self, Entity, Table};
use crate::rows::Rows;
use serde::Serialize;
use std::sync::Arc;

/// One page of a query plus the total row count of its condition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub no: u64,
    pub size: u64,
}

impl<T> Paged<T> {
    pub fn pages(&self) -> u64 {
        self.total.div_ceil(self.size.max(1))
    }
}

#[derive(Clone, Default)]
pub struct Dac {
    client: Client,
}

impl Dac {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn prepare<T: Entity>(&self, ctx: &Context) -> Result<(Arc<Table>, Arc<dyn Dialect>)> {
        let table = entity::load::<T>()?;
        let dialect = self.client.dialect(ctx).await?;
        Ok((table, dialect))
    }

    async fn exec(&self, ctx: &Context, operation: &str, template: &Template, args: &[Argument]) -> Result<ExecResult> {
        tracing::debug!(operation, sql = template.sql(), "dac execute");
        self.client
            .execute(ctx, template.sql(), args)
            .await
            .map_err(|err| err.wrap(operation).with_sql(template.sql()))
    }

    async fn fetch(&self, ctx: &Context, operation: &str, template: &Template) -> Result<Rows> {
        tracing::debug!(operation, sql = template.sql(), "dac query");
        self.client
            .query(ctx, template.sql(), template.args())
            .await
            .map_err(|err| err.wrap(operation).with_sql(template.sql()))
    }

    // ------------------------------------------------------------------
    // Inserts
    // ------------------------------------------------------------------

    /// Inserts one row. An `incrpk` field takes the generated id.
    pub async fn insert<T: Entity>(&self, ctx: &Context, entity: &mut T) -> Result<ExecResult> {
        let (table, dialect) = self.prepare::<T>(ctx).await?;
        audit::before_insert(ctx, entity, &table)?;
        let template = dialect.insert(&table, 1)?;
        let args = template.bind(|field| entity.field_value(field))?;
        let result = self.exec(ctx, "insert", &template, &args).await?;
        assign_generated_ids(std::slice::from_mut(entity), &table, result.last_insert_id)?;
        Ok(result)
    }

    /// Inserts all rows in one statement. Generated ids are assigned in
    /// order from the first id the database reports.
    pub async fn insert_many<T: Entity>(&self, ctx: &Context, entities: &mut [T]) -> Result<ExecResult> {
        if entities.is_empty() {
            return Ok(ExecResult::default());
        }
        let (table, dialect) = self.prepare::<T>(ctx).await?;
        for entity in entities.iter_mut() {
            audit::before_insert(ctx, entity, &table)?;
        }
        let template = dialect.insert(&table, entities.len())?;
        let per_row = template.params().len() / entities.len();
        let mut position = 0;
        let args = template.bind(|field| {
            let row = &entities[position / per_row.max(1)];
            position += 1;
            row.field_value(field)
        })?;
        let result = self.exec(ctx, "insert_many", &template, &args).await?;
        assign_generated_ids(entities, &table, result.last_insert_id)?;
        Ok(result)
    }

    /// Inserts, or updates the non-conflict columns of the row colliding on
    /// the conflict (or key) columns. A versioned entity then reloads the
    /// stored version, which is 1 after an insert and advanced after an
    /// update.
    pub async fn insert_or_update<T: Entity>(&self, ctx: &Context, entity: &mut T) -> Result<ExecResult> {
        let (table, dialect) = self.prepare::<T>(ctx).await?;
        audit::before_insert(ctx, entity, &table)?;
        audit::before_update(ctx, entity, &table)?;
        let template = dialect.insert_or_update(&table)?;
        let args = template.bind(|field| entity.field_value(field))?;
        let result = self.exec(ctx, "insert_or_update", &template, &args).await?;
        self.reload_version(ctx, entity, &table, dialect.as_ref()).await?;
        Ok(result)
    }

    async fn reload_version<T: Entity>(&self, ctx: &Context, entity: &mut T, table: &Arc<Table>, dialect: &dyn Dialect) -> Result<()> {
        let Some(version) = table.version() else {
            return Ok(());
        };
        let mut condition: Option<Condition> = None;
        for column in table.conflict_columns() {
            let predicate = Condition::eq(column.field(), entity.field_value(column.field())?);
            condition = Some(match condition {
                Some(condition) => condition.and(predicate),
                None => predicate,
            });
        }
        let Some(condition) = condition else {
            return Ok(());
        };
        let options = QueryOptions::new().filter(condition).range(Range::first());
        let template = dialect.query(table, &options)?;
        let stored = self
            .fetch(ctx, "insert_or_update", &template)
            .await?
            .collect_entities::<T>()
            .await?;
        if let Some(stored) = stored.first() {
            entity.set_field_value(version.field(), stored.field_value(version.field())?)?;
        }
        Ok(())
    }

    pub async fn insert_when_exist<T: Entity>(&self, ctx: &Context, entity: &mut T, source: &SubQuery) -> Result<ExecResult> {
        self.insert_when(ctx, entity, source, true).await
    }

    /// Inserts only while `source` returns no row.
    pub async fn insert_when_not_exist<T: Entity>(&self, ctx: &Context, entity: &mut T, source: &SubQuery) -> Result<ExecResult> {
        self.insert_when(ctx, entity, source, false).await
    }

    async fn insert_when<T: Entity>(&self, ctx: &Context, entity: &mut T, source: &SubQuery, exists: bool) -> Result<ExecResult> {
        let (table, dialect) = self.prepare::<T>(ctx).await?;
        audit::before_insert(ctx, entity, &table)?;
        let template = if exists {
            dialect.insert_when_exists(&table, source)?
        } else {
            dialect.insert_when_not_exists(&table, source)?
        };
        let args = template.bind(|field| entity.field_value(field))?;
        let operation = if exists { "insert_when_exist" } else { "insert_when_not_exist" };
        self.exec(ctx, operation, &template, &args).await
    }

    // ------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------

    /// Updates the row addressed by the keys. With a version column the
    /// statement also requires the in-memory version; no matching row then
    /// fails with `OptimisticLockFailed` and leaves the version untouched.
    pub async fn update<T: Entity>(&self, ctx: &Context, entity: &mut T) -> Result<ExecResult> {
        let (table, dialect) = self.prepare::<T>(ctx).await?;
        audit::before_update(ctx, entity, &table)?;
        let template = dialect.update(&table)?;
        let args = template.bind(|field| entity.field_value(field))?;
        let result = self.exec(ctx, "update", &template, &args).await?;
        if table.version().is_some() {
            if result.rows_affected == 0 {
                tracing::debug!(entity = table.entity(), "optimistic lock lost");
                return Err(DacError::OptimisticLockFailed {
                    entity: table.entity().to_string(),
                });
            }
            audit::bump_version(entity, &table)?;
        }
        Ok(result)
    }

    /// Updates `fields` (plus modification audits and the version) of the
    /// rows matching `condition`, or of this row by its keys.
    pub async fn update_fields<T: Entity>(
        &self,
        ctx: &Context,
        entity: &mut T,
        fields: &[&str],
        condition: Option<&Condition>,
    ) -> Result<ExecResult> {
        let (table, dialect) = self.prepare::<T>(ctx).await?;
        audit::before_update(ctx, entity, &table)?;
        let template = dialect.update_fields(&table, fields, condition)?;
        let args = template.bind(|field| entity.field_value(field))?;
        let result = self.exec(ctx, "update_fields", &template, &args).await?;
        if condition.is_none() && result.rows_affected > 0 {
            audit::bump_version(entity, &table)?;
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Deletes
    // ------------------------------------------------------------------

    /// Soft delete when the entity has deletion audits, else a hard delete.
    /// A soft delete always advances the in-memory version.
    pub async fn delete<T: Entity>(&self, ctx: &Context, entity: &mut T) -> Result<ExecResult> {
        let (table, dialect) = self.prepare::<T>(ctx).await?;
        if !table.has_soft_delete() {
            return self.hard_delete(ctx, entity, &table, dialect.as_ref()).await;
        }
        audit::before_soft_delete(ctx, entity, &table)?;
        let template = dialect.soft_delete(&table)?;
        let args = template.bind(|field| entity.field_value(field))?;
        let result = self.exec(ctx, "delete", &template, &args).await?;
        audit::bump_version(entity, &table)?;
        Ok(result)
    }

    /// Removes the row even when the entity supports soft deletion.
    pub async fn force_delete<T: Entity>(&self, ctx: &Context, entity: &T) -> Result<ExecResult> {
        let (table, dialect) = self.prepare::<T>(ctx).await?;
        self.hard_delete(ctx, entity, &table, dialect.as_ref()).await
    }

    async fn hard_delete<T: Entity>(&self, ctx: &Context, entity: &T, table: &Arc<Table>, dialect: &dyn Dialect) -> Result<ExecResult> {
        let template = dialect.delete(table)?;
        let args = template.bind(|field| entity.field_value(field))?;
        self.exec(ctx, "delete", &template, &args).await
    }

    pub async fn delete_by_condition<T: Entity>(&self, ctx: &Context, condition: &Condition) -> Result<ExecResult> {
        let (table, dialect) = self.prepare::<T>(ctx).await?;
        let template = dialect.delete_by_conditions(&table, condition)?;
        self.exec(ctx, "delete_by_condition", &template, template.args()).await
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn exist<T: Entity>(&self, ctx: &Context, condition: Option<&Condition>) -> Result<bool> {
        let (table, dialect) = self.prepare::<T>(ctx).await?;
        let template = dialect.exist(&table, condition)?;
        Ok(self.fetch(ctx, "exist", &template).await?.first_value().await?.is_some())
    }

    pub async fn count<T: Entity>(&self, ctx: &Context, condition: Option<&Condition>) -> Result<u64> {
        let (table, dialect) = self.prepare::<T>(ctx).await?;
        let template = dialect.count(&table, condition)?;
        let value = self.fetch(ctx, "count", &template).await?.first_value().await?;
        count_value(value)
    }

    pub async fn query<T: Entity>(&self, ctx: &Context, options: &QueryOptions) -> Result<Vec<T>> {
        let (table, dialect) = self.prepare::<T>(ctx).await?;
        let template = dialect.query(&table, options)?;
        self.fetch(ctx, "query", &template).await?.collect_entities::<T>().await
    }

    /// First row matching `condition`.
    pub async fn query_one<T: Entity>(&self, ctx: &Context, condition: Condition) -> Result<Option<T>> {
        let options = QueryOptions::new().filter(condition).range(Range::first());
        Ok(self.query::<T>(ctx, &options).await?.into_iter().next())
    }

    /// Rows of page `page` under `options`; any range in `options` is
    /// replaced.
    pub async fn page<T: Entity>(&self, ctx: &Context, options: QueryOptions, page: Page) -> Result<Paged<T>> {
        let total = self.count::<T>(ctx, options.condition.as_ref()).await?;
        let items = if total == 0 {
            Vec::new()
        } else {
            self.query::<T>(ctx, &options.range(page.range())).await?
        };
        Ok(Paged {
            items,
            total,
            no: page.no(),
            size: page.size(),
        })
    }

    // ------------------------------------------------------------------
    // Raw statements
    // ------------------------------------------------------------------

    pub async fn query_rows(&self, ctx: &Context, sql: &str, args: &[Argument]) -> Result<Rows> {
        self.client
            .query(ctx, sql, args)
            .await
            .map_err(|err| err.wrap("query_rows").with_sql(sql))
    }

    pub async fn execute_sql(&self, ctx: &Context, sql: &str, args: &[Argument]) -> Result<ExecResult> {
        self.client
            .execute(ctx, sql, args)
            .await
            .map_err(|err| err.wrap("execute_sql").with_sql(sql))
    }
}

fn assign_generated_ids<T: Entity>(entities: &mut [T], table: &Table, first_id: i64) -> Result<()> {
    let Some(column) = table.incr_pk() else {
        return Ok(());
    };
    if first_id <= 0 {
        return Ok(());
    }
    for (offset, entity) in entities.iter_mut().enumerate() {
        entity.set_field_value(column.field(), Value::Int(first_id + offset as i64))?;
    }
    Ok(())
}

fn count_value(value: Option<Value>) -> Result<u64> {
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(value) => value
            .as_i64()
            .map(|n| n.max(0) as u64)
            .ok_or_else(|| DacError::database("count", format!("unexpected count value {}", value))),
    }
}

// Process-wide shortcuts over `Dac::default()`.

pub async fn insert<T: Entity>(ctx: &Context, entity: &mut T) -> Result<ExecResult> {
    Dac::default().insert(ctx, entity).await
}

pub async fn insert_many<T: Entity>(ctx: &Context, entities: &mut [T]) -> Result<ExecResult> {
    Dac::default().insert_many(ctx, entities).await
}

pub async fn insert_or_update<T: Entity>(ctx: &Context, entity: &mut T) -> Result<ExecResult> {
    Dac::default().insert_or_update(ctx, entity).await
}

pub async fn insert_when_exist<T: Entity>(ctx: &Context, entity: &mut T, source: &SubQuery) -> Result<ExecResult> {
    Dac::default().insert_when_exist(ctx, entity, source).await
}

pub async fn insert_when_not_exist<T: Entity>(ctx: &Context, entity: &mut T, source: &SubQuery) -> Result<ExecResult> {
    Dac::default().insert_when_not_exist(ctx, entity, source).await
}

pub async fn update<T: Entity>(ctx: &Context, entity: &mut T) -> Result<ExecResult> {
    Dac::default().update(ctx, entity).await
}

pub async fn update_fields<T: Entity>(ctx: &Context, entity: &mut T, fields: &[&str], condition: Option<&Condition>) -> Result<ExecResult> {
    Dac::default().update_fields(ctx, entity, fields, condition).await
}

pub async fn delete<T: Entity>(ctx: &Context, entity: &mut T) -> Result<ExecResult> {
    Dac::default().delete(ctx, entity).await
}

pub async fn force_delete<T: Entity>(ctx: &Context, entity: &T) -> Result<ExecResult> {
    Dac::default().force_delete(ctx, entity).await
}

pub async fn delete_by_condition<T: Entity>(ctx: &Context, condition: &Condition) -> Result<ExecResult> {
    Dac::default().delete_by_condition::<T>(ctx, condition).await
}

pub async fn exist<T: Entity>(ctx: &Context, condition: Option<&Condition>) -> Result<bool> {
    Dac::default().exist::<T>(ctx, condition).await
}

pub async fn count<T: Entity>(ctx: &Context, condition: Option<&Condition>) -> Result<u64> {
    Dac::default().count::<T>(ctx, condition).await
}

pub async fn query<T: Entity>(ctx: &Context, options: &QueryOptions) -> Result<Vec<T>> {
    Dac::default().query::<T>(ctx, options).await
}

pub async fn query_one<T: Entity>(ctx: &Context, condition: Condition) -> Result<Option<T>> {
    Dac::default().query_one::<T>(ctx, condition).await
}

pub async fn page<T: Entity>(ctx: &Context, options: QueryOptions, page: Page) -> Result<Paged<T>> {
    Dac::default().page::<T>(ctx, options, page).await
}

pub async fn query_rows(ctx: &Context, sql: &str, args: &[Argument]) -> Result<Rows> {
    Dac::default().query_rows(ctx, sql, args).await
}

pub async fn execute_sql(ctx: &Context, sql: &str, args: &[Argument]) -> Result<ExecResult> {
    Dac::default().execute_sql(ctx, sql, args).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Entity;
    use crate::config::Config;
    use crate::context::Principal;
    use crate::database::{Handle, PoolSettings, Standalone};
    use crate::driver::{Driver, Operation, RecordingDriver, Response};
    use crate::endpoint::{Runtime, Service};
    use crate::rows::ColumnType;
    use chrono::{DateTime, Utc};
    use std::time::Duration;

    #[derive(Entity, Default, Debug, Clone, PartialEq)]
    #[entity(table = "notes")]
    struct Note {
        #[column("id,incrpk")]
        id: i64,
        #[column("body")]
        body: String,
        #[column("version,aol")]
        version: i64,
    }

    #[derive(Entity, Default, Debug, Clone)]
    #[entity(table = "files")]
    struct File {
        #[column("id,pk")]
        id: String,
        #[column("deleted_by,adb")]
        deleted_by: String,
        #[column("deleted_at,adt")]
        deleted_at: Option<DateTime<Utc>>,
    }

    fn dac(driver: &Arc<RecordingDriver>, dialect: &str) -> Dac {
        let handle = Handle::open(
            driver.clone(),
            "main",
            "mem://dac",
            PoolSettings {
                max_opens: 0,
                max_idles: 2,
                max_idle_time: None,
                max_lifetime: None,
                acquire_timeout: Duration::from_millis(50),
                statements: None,
            },
        );
        let config = Config::new(dialect, driver.name(), "mem://dac");
        let service = Service::with_database(&config, Arc::new(Standalone::new(handle))).unwrap();
        let runtime = Arc::new(Runtime::new());
        runtime.register(Arc::new(service)).unwrap();
        Dac::new(Client::new(runtime))
    }

    fn executed(driver: &RecordingDriver) -> Vec<String> {
        driver
            .requests()
            .into_iter()
            .filter(|r| r.operation == Operation::Execute)
            .map(|r| r.sql)
            .collect()
    }

    #[tokio::test]
    async fn test_insert_many_assigns_ids_in_order() {
        let driver = Arc::new(RecordingDriver::with_handler("dac-insert", |request| {
            Ok(match request.operation {
                Operation::Execute => Response::Exec(ExecResult {
                    last_insert_id: 40,
                    rows_affected: 2,
                }),
                _ => Response::Done,
            })
        }));
        let dac = dac(&driver, "mysql");
        let mut notes = vec![
            Note { body: "a".into(), ..Default::default() },
            Note { body: "b".into(), ..Default::default() },
        ];

        dac.insert_many(&Context::new(), &mut notes).await.unwrap();
        assert_eq!((notes[0].id, notes[1].id), (40, 41));
        assert_eq!((notes[0].version, notes[1].version), (1, 1));

        let request = driver.requests().into_iter().find(|r| r.operation == Operation::Execute).unwrap();
        assert_eq!(request.sql, "INSERT INTO `notes` (`body`, `version`) VALUES (?, ?), (?, ?)");
        let args: Vec<Value> = request.args.iter().map(|a| a.value().clone()).collect();
        assert_eq!(args, vec!["a".into(), Value::Int(1), "b".into(), Value::Int(1)]);
    }

    #[tokio::test]
    async fn test_update_reports_lost_lock() {
        let driver = Arc::new(RecordingDriver::with_handler("dac-lock", |request| {
            Ok(match request.operation {
                Operation::Execute => Response::affected(0),
                _ => Response::Done,
            })
        }));
        let dac = dac(&driver, "postgres");
        let mut note = Note { id: 3, body: "x".into(), version: 1 };

        let err = dac.update(&Context::new(), &mut note).await.unwrap_err();
        assert_eq!(err, DacError::OptimisticLockFailed { entity: "Note".into() });
        assert_eq!(note.version, 1);
        assert_eq!(
            executed(&driver),
            vec![r#"UPDATE "public"."notes" SET "body" = $1, "version" = "version" + 1 WHERE "public"."notes"."id" = $2 AND "public"."notes"."version" = $3"#]
        );
    }

    #[tokio::test]
    async fn test_delete_is_soft_when_audited() {
        let driver = Arc::new(RecordingDriver::with_handler("dac-delete", |request| {
            Ok(match request.operation {
                Operation::Execute => Response::affected(1),
                _ => Response::Done,
            })
        }));
        let dac = dac(&driver, "mysql");
        let ctx = Context::new().with_principal(Principal::new("root"));
        let mut file = File { id: "f1".into(), ..Default::default() };

        dac.delete(&ctx, &mut file).await.unwrap();
        assert_eq!(file.deleted_by, "root");
        assert!(file.deleted_at.is_some());
        dac.force_delete(&ctx, &file).await.unwrap();

        let statements = executed(&driver);
        assert!(statements[0].starts_with("UPDATE `files` SET `deleted_by` = ?, `deleted_at` = ?"));
        assert_eq!(statements[1], "DELETE FROM `files` WHERE `files`.`id` = ?");
    }

    #[tokio::test]
    async fn test_page_counts_then_queries_window() {
        let driver = Arc::new(RecordingDriver::with_handler("dac-page", |request| {
            if request.sql.starts_with("SELECT COUNT(1)") {
                return Ok(Response::rows(
                    vec![ColumnType::new("_count", "BIGINT", false)],
                    vec![vec![Value::Int(12)]],
                ));
            }
            Ok(match request.operation {
                Operation::Query => Response::rows(
                    vec![
                        ColumnType::new("id", "BIGINT", false),
                        ColumnType::new("body", "TEXT", false),
                        ColumnType::new("version", "BIGINT", false),
                    ],
                    vec![vec![Value::Int(11), "k".into(), Value::Int(2)]],
                ),
                _ => Response::Done,
            })
        }));
        let dac = dac(&driver, "mysql");

        let paged: Paged<Note> = dac
            .page(&Context::new(), QueryOptions::new(), Page::new(2, 10).unwrap())
            .await
            .unwrap();
        assert_eq!(paged.total, 12);
        assert_eq!(paged.pages(), 2);
        assert_eq!(paged.items, vec![Note { id: 11, body: "k".into(), version: 2 }]);

        let window = driver
            .statements()
            .into_iter()
            .find(|sql| sql.contains("INNER JOIN"))
            .unwrap();
        assert!(window.contains("LIMIT 10, 10"), "{}", window);
    }

    #[tokio::test]
    async fn test_raw_statement_errors_carry_sql() {
        let driver = Arc::new(RecordingDriver::with_handler("dac-raw", |request| {
            match request.operation {
                Operation::Execute => Err(DacError::database("execute", "syntax error")),
                _ => Ok(Response::Done),
            }
        }));
        let dac = dac(&driver, "mysql");
        let err = dac.execute_sql(&Context::new(), "DELET x", &[]).await.unwrap_err();
        match err {
            DacError::DatabaseError { operation, sql, .. } => {
                assert!(operation.starts_with("execute_sql"));
                assert_eq!(sql.as_deref(), Some("DELET x"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
