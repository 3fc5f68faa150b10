// ============================================================================
// Dialect Renderer
// ============================================================================
//
// A `Dialect` supplies the product-specific pieces: identifier quoting,
// placeholder style, range syntax, upsert/ignore clauses and the JSON
// projections used by ref/link/links/tree columns. Statement families are
// assembled once per (entity, dialect) by `Generic` and reused:
//
//   let sql = dialect.update(&table)?;              // cached template
//   let sql = dialect.count(&table, Some(&cond))?;  // cached prefix + cond
//
// Dialects are registered process-wide by name; `mysql` and `postgres` are
// always present.
//
// ============================================================================

pub mod generic;
pub mod mysql;
pub mod postgres;

use crate::argument::Argument;
use crate::condition::{Condition, Placeholder, Range, SubQuery};
use crate::core::{DacError, OnceMap, Result, Value};
use crate::entity::{Column, Relation, Table};
use lazy_static::lazy_static;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub use generic::{Generic, QueryOptions};
pub use mysql::MySql;
pub use postgres::Postgres;

/// Rendered SQL plus the entity fields whose values bind its leading
/// placeholders, followed by already bound arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    sql: String,
    params: Vec<String>,
    args: Vec<Argument>,
}

impl Template {
    pub(crate) fn new(sql: String, params: Vec<String>, args: Vec<Argument>) -> Self {
        Self { sql, params, args }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Field names bound, in order, before the fixed arguments.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn args(&self) -> &[Argument] {
        &self.args
    }

    /// Builds the argument vector, reading each param through `source`.
    pub fn bind(&self, mut source: impl FnMut(&str) -> Result<Value>) -> Result<Vec<Argument>> {
        let mut args = Vec::with_capacity(self.params.len() + self.args.len());
        for field in &self.params {
            args.push(Argument::new(source(field)?));
        }
        args.extend(self.args.iter().cloned());
        Ok(args)
    }
}

pub trait Dialect: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Opening and closing identifier quote.
    fn quotes(&self) -> (char, char);

    fn placeholder(&self) -> Placeholder;

    /// Schema used when an entity declares none; empty means unqualified.
    fn default_schema(&self) -> &'static str;

    fn render_range(&self, range: &Range, out: &mut String);

    /// Table clause for a `SELECT` of bare values followed by `WHERE`.
    fn dual(&self) -> &'static str {
        ""
    }

    /// Single-row insert that silently skips rows colliding on
    /// `conflicts`: the statement head and the clause following the values.
    fn insert_ignore(&self, table_ident: &str, conflicts: &[&Column]) -> (String, String);

    /// Clause appended to a single-row insert to turn it into an upsert.
    fn upsert_clause(&self, table: &Table, conflicts: &[&Column], updates: &[&Column]) -> Result<String>;

    /// JSON object of the row aliased `alias` over the stored columns of
    /// `table`.
    fn row_json(&self, alias: &str, table: &Table) -> String;

    /// Aggregates `element` over a result into a JSON array, `[]` when empty.
    fn json_array_agg(&self, element: &str) -> String;

    /// Projection of a `ref`/`link` column.
    fn reference_projection(&self, host: &str, relation: &Relation, alias: &str) -> String;

    /// Projection of a `links` column.
    fn links_projection(&self, host: &str, relation: &Relation, alias: &str) -> String;

    /// Wraps `ident` in the dialect's quotes once; already quoted input is
    /// returned as is.
    fn format_ident(&self, ident: &str) -> String {
        let (open, close) = self.quotes();
        if ident.len() >= 2 && ident.starts_with(open) && ident.ends_with(close) {
            return ident.to_string();
        }
        let escaped = ident.replace(close, &format!("{}{}", close, close));
        format!("{}{}{}", open, escaped, close)
    }

    /// Schema-qualified, quoted table name.
    fn table_ident(&self, table: &Table) -> String {
        let schema = if table.schema().is_empty() {
            self.default_schema()
        } else {
            table.schema()
        };
        if schema.is_empty() {
            self.format_ident(table.name())
        } else {
            format!("{}.{}", self.format_ident(schema), self.format_ident(table.name()))
        }
    }
}

lazy_static! {
    static ref DIALECTS: RwLock<HashMap<String, Arc<dyn Dialect>>> = {
        let mut dialects: HashMap<String, Arc<dyn Dialect>> = HashMap::new();
        dialects.insert(MySql.name().to_string(), Arc::new(MySql));
        dialects.insert(Postgres.name().to_string(), Arc::new(Postgres));
        RwLock::new(dialects)
    };
    static ref GENERICS: OnceMap<(TypeId, &'static str), Arc<Generic>> = OnceMap::new();
}

pub fn register(dialect: Arc<dyn Dialect>) -> Result<()> {
    let mut dialects = DIALECTS.write()?;
    let name = dialect.name().to_string();
    if dialects.contains_key(&name) {
        return Err(DacError::ConfigInvalid(format!(
            "dialect '{}' is already registered",
            name
        )));
    }
    dialects.insert(name, dialect);
    Ok(())
}

pub fn lookup(name: &str) -> Result<Arc<dyn Dialect>> {
    DIALECTS
        .read()?
        .get(&name.to_ascii_lowercase())
        .cloned()
        .ok_or_else(|| DacError::ConfigInvalid(format!("unknown dialect '{}'", name)))
}

impl dyn Dialect {
    /// Statement families of `table` in this dialect, built once.
    pub fn statements(&self, table: &Arc<Table>) -> Result<Arc<Generic>> {
        GENERICS.get_or_try_insert(&(table.type_id(), self.name()), || {
            Ok(Arc::new(Generic::build(self, table.clone())?))
        })
    }

    pub fn insert(&self, table: &Arc<Table>, values_count: usize) -> Result<Template> {
        self.statements(table)?.insert(self, values_count)
    }

    pub fn insert_or_update(&self, table: &Arc<Table>) -> Result<Template> {
        self.statements(table)?.insert_or_update()
    }

    pub fn insert_when_exists(&self, table: &Arc<Table>, source: &SubQuery) -> Result<Template> {
        self.statements(table)?.insert_when(self, true, source)
    }

    pub fn insert_when_not_exists(&self, table: &Arc<Table>, source: &SubQuery) -> Result<Template> {
        self.statements(table)?.insert_when(self, false, source)
    }

    pub fn update(&self, table: &Arc<Table>) -> Result<Template> {
        self.statements(table)?.update()
    }

    pub fn update_fields(
        &self,
        table: &Arc<Table>,
        fields: &[&str],
        condition: Option<&Condition>,
    ) -> Result<Template> {
        self.statements(table)?.update_fields(self, fields, condition)
    }

    pub fn delete(&self, table: &Arc<Table>) -> Result<Template> {
        self.statements(table)?.delete()
    }

    pub fn soft_delete(&self, table: &Arc<Table>) -> Result<Template> {
        self.statements(table)?.soft_delete()
    }

    pub fn delete_by_conditions(&self, table: &Arc<Table>, condition: &Condition) -> Result<Template> {
        self.statements(table)?.delete_by_conditions(self, condition)
    }

    pub fn exist(&self, table: &Arc<Table>, condition: Option<&Condition>) -> Result<Template> {
        self.statements(table)?.exist(self, condition)
    }

    pub fn count(&self, table: &Arc<Table>, condition: Option<&Condition>) -> Result<Template> {
        self.statements(table)?.count(self, condition)
    }

    pub fn query(&self, table: &Arc<Table>, options: &QueryOptions) -> Result<Template> {
        self.statements(table)?.query(self, options)
    }
}

impl std::fmt::Debug for dyn Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Dialect").field(&self.name()).finish()
    }
}

/// `ORDER BY` keys of a relation, qualified by `alias`.
pub(crate) fn relation_order_keys(dialect: &dyn Dialect, relation: &Relation, alias: &str) -> String {
    relation
        .orders
        .iter()
        .filter_map(|order| {
            relation.table.lookup(order.field()).map(|column| {
                format!(
                    "{}.{} {}",
                    alias,
                    dialect.format_ident(column.name()),
                    order.direction().as_sql()
                )
            })
        })
        .collect::<Vec<_>>()
        .join(", ")
}
