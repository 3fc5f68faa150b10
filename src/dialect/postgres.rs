use super::{Dialect, relation_order_keys};
use crate::condition::{Placeholder, Range};
use crate::core::{DacError, Result};
use crate::entity::{Column, Relation, Table};

/// PostgreSQL: double-quoted identifiers, `$n` placeholders, tables
/// default to the `public` schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Postgres {
    fn conflict_target(&self, conflicts: &[&Column]) -> String {
        conflicts
            .iter()
            .map(|c| self.format_ident(c.name()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Dialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quotes(&self) -> (char, char) {
        ('"', '"')
    }

    fn placeholder(&self) -> Placeholder {
        Placeholder::positional("$")
    }

    fn default_schema(&self) -> &'static str {
        "public"
    }

    fn render_range(&self, range: &Range, out: &mut String) {
        out.push_str(&format!("OFFSET {} LIMIT {}", range.offset(), range.length()));
    }

    fn insert_ignore(&self, table_ident: &str, conflicts: &[&Column]) -> (String, String) {
        let tail = if conflicts.is_empty() {
            " ON CONFLICT DO NOTHING".to_string()
        } else {
            format!(" ON CONFLICT ({}) DO NOTHING", self.conflict_target(conflicts))
        };
        (format!("INSERT INTO {}", table_ident), tail)
    }

    fn upsert_clause(&self, table: &Table, conflicts: &[&Column], updates: &[&Column]) -> Result<String> {
        if conflicts.is_empty() {
            return Err(DacError::metadata(
                table.entity(),
                "insert_or_update requires conflict or key columns",
            ));
        }
        let mut sets: Vec<String> = updates
            .iter()
            .map(|c| {
                let ident = self.format_ident(c.name());
                format!("{} = EXCLUDED.{}", ident, ident)
            })
            .collect();
        if let Some(version) = table.version() {
            // The existing row is addressed by the bare table name.
            let ident = self.format_ident(version.name());
            sets.push(format!(
                "{} = {}.{} + 1",
                ident,
                self.format_ident(table.name()),
                ident
            ));
        }
        let target = self.conflict_target(conflicts);
        if sets.is_empty() {
            return Ok(format!(" ON CONFLICT ({}) DO NOTHING", target));
        }
        Ok(format!(
            " ON CONFLICT ({}) DO UPDATE SET {}",
            target,
            sets.join(", ")
        ))
    }

    fn row_json(&self, alias: &str, _table: &Table) -> String {
        format!("row_to_json({}.*)", alias)
    }

    fn json_array_agg(&self, element: &str) -> String {
        format!("COALESCE(json_agg({}), '[]'::json)", element)
    }

    fn reference_projection(&self, host: &str, relation: &Relation, alias: &str) -> String {
        let alias = self.format_ident(alias);
        let mut out = format!(
            "(SELECT {} FROM {} AS {} WHERE {}.{} = {} ",
            self.row_json(&alias, &relation.table),
            self.table_ident(&relation.table),
            alias,
            alias,
            self.format_ident(&relation.target),
            host
        );
        self.render_range(&Range::first(), &mut out);
        out.push(')');
        out
    }

    fn links_projection(&self, host: &str, relation: &Relation, alias: &str) -> String {
        let alias = self.format_ident(alias);
        let mut out = format!(
            "to_json(ARRAY(SELECT {} FROM {} AS {} WHERE {}.{} = {}",
            self.row_json(&alias, &relation.table),
            self.table_ident(&relation.table),
            alias,
            alias,
            self.format_ident(&relation.target),
            host
        );
        let order = relation_order_keys(self, relation, &alias);
        if !order.is_empty() {
            out.push_str(" ORDER BY ");
            out.push_str(&order);
        }
        if let Some(range) = relation.range {
            out.push(' ');
            self.render_range(&range, &mut out);
        }
        out.push_str("))");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range() {
        let mut out = String::new();
        Postgres.render_range(&Range::new(20, 10).unwrap(), &mut out);
        assert_eq!(out, "OFFSET 20 LIMIT 10");
    }

    #[test]
    fn test_placeholders_are_numbered() {
        let mut placeholder = Postgres.placeholder();
        assert_eq!(placeholder.next_token(), "$1");
        assert_eq!(placeholder.next_token(), "$2");
    }
}
