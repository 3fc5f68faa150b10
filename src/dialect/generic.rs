//! Statement families of one entity in one dialect.
//!
//! Everything that does not depend on call-time input (projection, insert
//! head, update/delete/soft-delete bodies) is rendered once in
//! [`Generic::build`]; conditional statements reuse the cached prefixes and
//! only render their condition, order and range.

use super::{Dialect, Template};
use crate::argument::Argument;
use crate::condition::{Condition, Node, Orders, Placeholder, Range, RenderContext, SubQuery};
use crate::core::{DacError, Result};
use crate::entity::{Column, ColumnKind, Relation, Table};
use std::sync::Arc;

/// Options of a projected query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub condition: Option<Condition>,
    pub orders: Orders,
    pub group_by: Vec<String>,
    pub having: Option<Condition>,
    pub range: Option<Range>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn order_by(mut self, orders: impl Into<Orders>) -> Self {
        self.orders = orders.into();
        self
    }

    pub fn group_by<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.group_by = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn having(mut self, condition: Condition) -> Self {
        self.having = Some(condition);
        self
    }

    pub fn range(mut self, range: Range) -> Self {
        self.range = Some(range);
        self
    }
}

type Prebuilt = std::result::Result<Template, String>;

#[derive(Debug)]
pub struct Generic {
    table: Arc<Table>,
    table_ident: String,
    projection: String,
    insert_fields: Vec<String>,
    insert_head: String,
    insert_or_update: Prebuilt,
    update: Prebuilt,
    delete: Prebuilt,
    soft_delete: Prebuilt,
    exist_head: String,
    count_head: String,
}

impl Generic {
    pub(crate) fn build(dialect: &dyn Dialect, table: Arc<Table>) -> Result<Self> {
        let table_ident = dialect.table_ident(&table);
        let projection = projection(dialect, &table, &table_ident)?;

        let insertable: Vec<&Column> = table.insertable().collect();
        let insert_fields = insertable.iter().map(|c| c.field().to_string()).collect();
        let insert_head = format!(
            "INSERT INTO {} ({})",
            table_ident,
            column_list(dialect, &insertable)
        );

        let mut generic = Generic {
            insert_or_update: Err(String::new()),
            update: Err(String::new()),
            delete: Err(String::new()),
            soft_delete: Err(String::new()),
            exist_head: format!(
                "SELECT 1 AS {} FROM {}",
                dialect.format_ident("_exist"),
                table_ident
            ),
            count_head: format!(
                "SELECT COUNT(1) AS {} FROM {}",
                dialect.format_ident("_count"),
                table_ident
            ),
            table,
            table_ident,
            projection,
            insert_fields,
            insert_head,
        };
        generic.insert_or_update = generic.build_insert_or_update(dialect)?;
        generic.update = generic.build_update(dialect);
        generic.delete = generic.build_delete(dialect);
        generic.soft_delete = generic.build_soft_delete(dialect);

        tracing::debug!(
            entity = generic.table.entity(),
            dialect = dialect.name(),
            "statement families built"
        );
        Ok(generic)
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn table_ident(&self) -> &str {
        &self.table_ident
    }

    /// Select list of a query: stored, virtual and relation columns.
    pub fn projection(&self) -> &str {
        &self.projection
    }

    /// Fields bound by one row of an insert, in column order.
    pub fn insert_fields(&self) -> &[String] {
        &self.insert_fields
    }

    fn prebuilt(&self, template: &Prebuilt) -> Result<Template> {
        template
            .clone()
            .map_err(|reason| DacError::metadata(self.table.entity(), reason))
    }

    // ------------------------------------------------------------------
    // Prebuilt families
    // ------------------------------------------------------------------

    fn values_tuple(&self, placeholder: &mut Placeholder) -> String {
        let tokens: Vec<String> = self.insert_fields.iter().map(|_| placeholder.next_token()).collect();
        format!("({})", tokens.join(", "))
    }

    fn build_insert_or_update(&self, dialect: &dyn Dialect) -> Result<Prebuilt> {
        let conflicts = self.table.conflict_columns();
        if conflicts.is_empty() {
            return Ok(Err("insert_or_update requires conflict or key columns".into()));
        }
        let updates: Vec<&Column> = self
            .table
            .updatable()
            .filter(|c| !conflicts.iter().any(|k| k.name() == c.name()))
            .collect();
        let mut placeholder = dialect.placeholder();
        let sql = format!(
            "{} VALUES {}{}",
            self.insert_head,
            self.values_tuple(&mut placeholder),
            dialect.upsert_clause(&self.table, &conflicts, &updates)?
        );
        Ok(Ok(Template::new(sql, self.insert_fields.clone(), Vec::new())))
    }

    fn build_update(&self, dialect: &dyn Dialect) -> Prebuilt {
        if !self.table.has_key() {
            return Err("update requires a pk or incrpk column".into());
        }
        let set: Vec<&Column> = self.table.updatable().collect();
        if set.is_empty() && self.table.version().is_none() {
            return Err("update has no updatable columns".into());
        }
        Ok(self.keyed_update(dialect, &set))
    }

    fn build_soft_delete(&self, dialect: &dyn Dialect) -> Prebuilt {
        if !self.table.has_key() {
            return Err("delete requires a pk or incrpk column".into());
        }
        if !self.table.has_soft_delete() {
            return Err("soft delete requires an adb or adt column".into());
        }
        let set: Vec<&Column> = self
            .table
            .columns()
            .iter()
            .filter(|c| matches!(c.kind(), ColumnKind::Adb | ColumnKind::Adt))
            .collect();
        Ok(self.keyed_update(dialect, &set))
    }

    /// `UPDATE t SET a = ?, v = v + 1 WHERE t.k = ? AND t.v = ?`.
    fn keyed_update(&self, dialect: &dyn Dialect, set: &[&Column]) -> Template {
        let mut placeholder = dialect.placeholder();
        let mut params = Vec::new();
        let mut assignments = Vec::new();
        for column in set {
            assignments.push(format!(
                "{} = {}",
                dialect.format_ident(column.name()),
                placeholder.next_token()
            ));
            params.push(column.field().to_string());
        }
        if let Some(version) = self.table.version() {
            let ident = dialect.format_ident(version.name());
            assignments.push(format!("{} = {} + 1", ident, ident));
        }

        let mut sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.table_ident,
            assignments.join(", "),
            self.key_predicate(dialect, &mut placeholder, &mut params)
        );
        if let Some(version) = self.table.version() {
            sql.push_str(&format!(
                " AND {}.{} = {}",
                self.table_ident,
                dialect.format_ident(version.name()),
                placeholder.next_token()
            ));
            params.push(version.field().to_string());
        }
        Template::new(sql, params, Vec::new())
    }

    fn key_predicate(
        &self,
        dialect: &dyn Dialect,
        placeholder: &mut Placeholder,
        params: &mut Vec<String>,
    ) -> String {
        self.table
            .keys()
            .map(|key| {
                params.push(key.field().to_string());
                format!(
                    "{}.{} = {}",
                    self.table_ident,
                    dialect.format_ident(key.name()),
                    placeholder.next_token()
                )
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn build_delete(&self, dialect: &dyn Dialect) -> Prebuilt {
        if !self.table.has_key() {
            return Err("delete requires a pk or incrpk column".into());
        }
        let mut placeholder = dialect.placeholder();
        let mut params = Vec::new();
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.table_ident,
            self.key_predicate(dialect, &mut placeholder, &mut params)
        );
        Ok(Template::new(sql, params, Vec::new()))
    }

    // ------------------------------------------------------------------
    // Families
    // ------------------------------------------------------------------

    /// Insert of `values_count` rows; params repeat the insert fields once
    /// per row.
    pub fn insert(&self, dialect: &dyn Dialect, values_count: usize) -> Result<Template> {
        if values_count == 0 {
            return Err(DacError::invalid_operands("insert", "expected at least 1 row"));
        }
        let mut placeholder = dialect.placeholder();
        let tuples: Vec<String> = (0..values_count)
            .map(|_| self.values_tuple(&mut placeholder))
            .collect();
        let params = (0..values_count)
            .flat_map(|_| self.insert_fields.iter().cloned())
            .collect();
        Ok(Template::new(
            format!("{} VALUES {}", self.insert_head, tuples.join(", ")),
            params,
            Vec::new(),
        ))
    }

    pub fn insert_or_update(&self) -> Result<Template> {
        self.prebuilt(&self.insert_or_update)
    }

    /// `INSERT INTO t (..) SELECT ?, .. WHERE [NOT] EXISTS (source)`. Rows
    /// colliding on the conflict columns are skipped, so repeating the
    /// statement is harmless.
    pub fn insert_when(&self, dialect: &dyn Dialect, exists: bool, source: &SubQuery) -> Result<Template> {
        let conflicts = self.table.conflict_columns();
        let (head, tail) = if conflicts.is_empty() {
            (format!("INSERT INTO {}", self.table_ident), String::new())
        } else {
            dialect.insert_ignore(&self.table_ident, &conflicts)
        };
        let insertable: Vec<&Column> = self.table.insertable().collect();

        let mut ctx = RenderContext::new(dialect, self.table.clone());
        let values: Vec<String> = self.insert_fields.iter().map(|_| ctx.next_placeholder()).collect();
        let mut sql = format!(
            "{} ({}) SELECT {}{} WHERE {}EXISTS (",
            head,
            column_list(dialect, &insertable),
            values.join(", "),
            dialect.dual(),
            if exists { "" } else { "NOT " }
        );
        let args = source.render(&mut ctx, &mut sql)?;
        sql.push(')');
        sql.push_str(&tail);
        Ok(Template::new(sql, self.insert_fields.clone(), args))
    }

    pub fn update(&self) -> Result<Template> {
        self.prebuilt(&self.update)
    }

    /// Updates `fields` plus the modification audits and the version.
    /// Without a condition the row is addressed by its keys.
    pub fn update_fields(
        &self,
        dialect: &dyn Dialect,
        fields: &[&str],
        condition: Option<&Condition>,
    ) -> Result<Template> {
        if fields.is_empty() {
            return Err(DacError::invalid_operands("update_fields", "expected at least 1 field"));
        }
        let mut set: Vec<&Column> = Vec::new();
        for field in fields {
            let column = self
                .table
                .lookup(field)
                .ok_or_else(|| DacError::unknown_field(self.table.entity(), *field))?;
            if !column.is_updatable() {
                return Err(DacError::invalid_operands(
                    "update_fields",
                    format!("{} column '{}' cannot be updated", column.kind(), column.name()),
                ));
            }
            if !set.iter().any(|c| c.name() == column.name()) {
                set.push(column);
            }
        }
        for audit in self.table.audits(ColumnKind::Amb).chain(self.table.audits(ColumnKind::Amt)) {
            if !set.iter().any(|c| c.name() == audit.name()) {
                set.push(audit);
            }
        }

        let mut ctx = RenderContext::new(dialect, self.table.clone());
        let mut params = Vec::new();
        let mut assignments = Vec::new();
        for column in &set {
            assignments.push(format!(
                "{} = {}",
                dialect.format_ident(column.name()),
                ctx.next_placeholder()
            ));
            params.push(column.field().to_string());
        }
        if let Some(version) = self.table.version() {
            let ident = dialect.format_ident(version.name());
            assignments.push(format!("{} = {} + 1", ident, ident));
        }

        let mut sql = format!("UPDATE {} SET {} WHERE ", self.table_ident, assignments.join(", "));
        let args = match condition {
            Some(condition) => condition.render(&mut ctx, &mut sql)?,
            None => {
                self.table.require_key("update_fields")?;
                let mut keys = Vec::new();
                for key in self.table.keys() {
                    keys.push(format!(
                        "{}.{} = {}",
                        self.table_ident,
                        dialect.format_ident(key.name()),
                        ctx.next_placeholder()
                    ));
                    params.push(key.field().to_string());
                }
                sql.push_str(&keys.join(" AND "));
                Vec::new()
            }
        };
        Ok(Template::new(sql, params, args))
    }

    pub fn delete(&self) -> Result<Template> {
        self.prebuilt(&self.delete)
    }

    pub fn soft_delete(&self) -> Result<Template> {
        self.prebuilt(&self.soft_delete)
    }

    pub fn delete_by_conditions(&self, dialect: &dyn Dialect, condition: &Condition) -> Result<Template> {
        let mut ctx = RenderContext::new(dialect, self.table.clone());
        let mut sql = format!("DELETE FROM {} WHERE ", self.table_ident);
        let args = condition.render(&mut ctx, &mut sql)?;
        Ok(Template::new(sql, Vec::new(), args))
    }

    pub fn exist(&self, dialect: &dyn Dialect, condition: Option<&Condition>) -> Result<Template> {
        let mut ctx = RenderContext::new(dialect, self.table.clone());
        let mut sql = self.exist_head.clone();
        let args = render_where(condition, &mut ctx, &mut sql)?;
        sql.push(' ');
        dialect.render_range(&Range::first(), &mut sql);
        Ok(Template::new(sql, Vec::new(), args))
    }

    pub fn count(&self, dialect: &dyn Dialect, condition: Option<&Condition>) -> Result<Template> {
        let mut ctx = RenderContext::new(dialect, self.table.clone());
        let mut sql = self.count_head.clone();
        let args = render_where(condition, &mut ctx, &mut sql)?;
        Ok(Template::new(sql, Vec::new(), args))
    }

    /// Projected query.
    ///
    /// With keys and no grouping the window is cut over the keys alone and
    /// joined back for the projection, so relation subqueries only run for
    /// the rows returned:
    ///
    /// ```text
    /// SELECT <projection> FROM t
    ///   INNER JOIN (SELECT t.k FROM t WHERE .. ORDER BY .. LIMIT ..) AS _inner
    ///   ON t.k = _inner.k ORDER BY ..
    /// ```
    pub fn query(&self, dialect: &dyn Dialect, options: &QueryOptions) -> Result<Template> {
        if options.having.is_some() && options.group_by.is_empty() {
            return Err(DacError::invalid_operands("HAVING", "requires GROUP BY"));
        }
        let mut ctx = RenderContext::new(dialect, self.table.clone());
        let mut args = Vec::new();

        if self.table.has_key() && options.group_by.is_empty() {
            let inner = dialect.format_ident("_inner");
            let keys: Vec<String> = self
                .table
                .keys()
                .map(|k| format!("{}.{}", self.table_ident, dialect.format_ident(k.name())))
                .collect();
            let mut sql = format!(
                "SELECT {} FROM {} INNER JOIN (SELECT {} FROM {}",
                self.projection,
                self.table_ident,
                keys.join(", "),
                self.table_ident
            );
            args.extend(render_where(options.condition.as_ref(), &mut ctx, &mut sql)?);
            render_orders(&options.orders, &mut ctx, &mut sql)?;
            if let Some(range) = &options.range {
                sql.push(' ');
                range.render(&mut ctx, &mut sql)?;
            }
            let join: Vec<String> = self
                .table
                .keys()
                .map(|k| {
                    let ident = dialect.format_ident(k.name());
                    format!("{}.{} = {}.{}", self.table_ident, ident, inner, ident)
                })
                .collect();
            sql.push_str(&format!(") AS {} ON {}", inner, join.join(" AND ")));
            render_orders(&options.orders, &mut ctx, &mut sql)?;
            return Ok(Template::new(sql, Vec::new(), args));
        }

        let mut sql = format!("SELECT {} FROM {}", self.projection, self.table_ident);
        args.extend(render_where(options.condition.as_ref(), &mut ctx, &mut sql)?);
        if !options.group_by.is_empty() {
            let fields = options
                .group_by
                .iter()
                .map(|f| ctx.localize(f))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(" GROUP BY ");
            sql.push_str(&fields.join(", "));
        }
        if let Some(having) = &options.having {
            sql.push_str(" HAVING ");
            args.extend(having.render(&mut ctx, &mut sql)?);
        }
        render_orders(&options.orders, &mut ctx, &mut sql)?;
        if let Some(range) = &options.range {
            sql.push(' ');
            range.render(&mut ctx, &mut sql)?;
        }
        Ok(Template::new(sql, Vec::new(), args))
    }
}

fn render_where(
    condition: Option<&Condition>,
    ctx: &mut RenderContext<'_>,
    out: &mut String,
) -> Result<Vec<Argument>> {
    match condition {
        Some(condition) => {
            out.push_str(" WHERE ");
            condition.render(ctx, out)
        }
        None => Ok(Vec::new()),
    }
}

fn render_orders(orders: &Orders, ctx: &mut RenderContext<'_>, out: &mut String) -> Result<()> {
    if !orders.is_empty() {
        out.push(' ');
        orders.render(ctx, out)?;
    }
    Ok(())
}

fn column_list(dialect: &dyn Dialect, columns: &[&Column]) -> String {
    columns
        .iter()
        .map(|c| dialect.format_ident(c.name()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn projection(dialect: &dyn Dialect, table: &Table, table_ident: &str) -> Result<String> {
    let mut items = Vec::with_capacity(table.columns().len());
    for column in table.columns() {
        let name = dialect.format_ident(column.name());
        let alias = format!("_{}", column.name());
        let item = match column.kind() {
            ColumnKind::Virtual => {
                format!("({}) AS {}", column.fragment().unwrap_or_default(), name)
            }
            kind if kind.is_relation() => {
                let relation = column
                    .relation()
                    .ok_or_else(|| DacError::metadata(table.entity(), "unresolved relation"))?;
                let host = format!("{}.{}", table_ident, dialect.format_ident(&relation.host));
                let rendered = match kind {
                    ColumnKind::Links => dialect.links_projection(&host, relation, &alias),
                    ColumnKind::Tree => tree_projection(dialect, &host, relation, &alias),
                    _ => dialect.reference_projection(&host, relation, &alias),
                };
                format!("{} AS {}", rendered, name)
            }
            _ => format!("{}.{}", table_ident, name),
        };
        items.push(item);
    }
    Ok(items.join(", "))
}

/// Descendants of the host row, depth first, as a JSON array.
fn tree_projection(
    dialect: &dyn Dialect,
    host: &str,
    relation: &Relation,
    alias: &str,
) -> String {
    let cte = dialect.format_ident(alias);
    let node = dialect.format_ident(&format!("{}_node", alias));
    let table = dialect.table_ident(&relation.table);
    let target = dialect.format_ident(&relation.target);
    let parent = dialect.format_ident(&relation.host);
    format!(
        "(WITH RECURSIVE {cte} AS (\
         SELECT {node}.* FROM {table} AS {node} WHERE {node}.{target} = {host} \
         UNION ALL \
         SELECT {node}.* FROM {table} AS {node} INNER JOIN {cte} ON {node}.{target} = {cte}.{parent}) \
         SELECT {agg} FROM {cte})",
        agg = dialect.json_array_agg(&dialect.row_json(&cte, &relation.table)),
    )
}
