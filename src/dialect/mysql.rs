use super::{Dialect, relation_order_keys};
use crate::condition::{Placeholder, Range};
use crate::core::Result;
use crate::entity::{Column, Relation, Table};

/// MySQL 8: backtick identifiers, `?` placeholders, `LIMIT offset, length`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySql;

impl MySql {
    fn json_object(&self, alias: &str, table: &Table) -> String {
        let pairs: Vec<String> = table
            .columns()
            .iter()
            .filter(|c| c.kind().is_stored())
            .map(|c| format!("'{}', {}.{}", c.name(), alias, self.format_ident(c.name())))
            .collect();
        format!("JSON_OBJECT({})", pairs.join(", "))
    }
}

impl Dialect for MySql {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quotes(&self) -> (char, char) {
        ('`', '`')
    }

    fn placeholder(&self) -> Placeholder {
        Placeholder::anonymous()
    }

    fn default_schema(&self) -> &'static str {
        ""
    }

    fn render_range(&self, range: &Range, out: &mut String) {
        out.push_str(&format!("LIMIT {}, {}", range.offset(), range.length()));
    }

    fn dual(&self) -> &'static str {
        " FROM DUAL"
    }

    fn insert_ignore(&self, table_ident: &str, _conflicts: &[&Column]) -> (String, String) {
        (format!("INSERT IGNORE INTO {}", table_ident), String::new())
    }

    fn upsert_clause(&self, table: &Table, conflicts: &[&Column], updates: &[&Column]) -> Result<String> {
        let mut sets: Vec<String> = updates
            .iter()
            .map(|c| {
                let ident = self.format_ident(c.name());
                format!("{} = VALUES({})", ident, ident)
            })
            .collect();
        if let Some(version) = table.version() {
            let ident = self.format_ident(version.name());
            sets.push(format!("{} = {} + 1", ident, ident));
        }
        if sets.is_empty() {
            // Nothing to change: a self-assignment keeps the statement valid.
            if let Some(column) = conflicts.first() {
                let ident = self.format_ident(column.name());
                sets.push(format!("{} = {}", ident, ident));
            }
        }
        Ok(format!(" ON DUPLICATE KEY UPDATE {}", sets.join(", ")))
    }

    fn row_json(&self, alias: &str, table: &Table) -> String {
        self.json_object(alias, table)
    }

    fn json_array_agg(&self, element: &str) -> String {
        format!(
            "CONCAT('[', IFNULL(GROUP_CONCAT({} SEPARATOR ','), ''), ']')",
            element
        )
    }

    fn reference_projection(&self, host: &str, relation: &Relation, alias: &str) -> String {
        let alias = self.format_ident(alias);
        let mut out = format!(
            "(SELECT {} FROM {} AS {} WHERE {}.{} = {} ",
            self.json_object(&alias, &relation.table),
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
        let outer = self.format_ident(alias);
        let order = relation_order_keys(self, relation, &outer);
        let element = if order.is_empty() {
            self.json_object(&outer, &relation.table)
        } else {
            format!("{} ORDER BY {}", self.json_object(&outer, &relation.table), order)
        };
        let aggregate = self.json_array_agg(&element);
        let target = self.table_ident(&relation.table);
        let target_column = self.format_ident(&relation.target);

        match relation.range {
            None => format!(
                "(SELECT {} FROM {} AS {} WHERE {}.{} = {})",
                aggregate, target, outer, outer, target_column, host
            ),
            Some(range) => {
                // The window is cut in a derived table, then aggregated.
                let inner = self.format_ident(&format!("{}_window", alias));
                let inner_order = relation_order_keys(self, relation, &inner);
                let mut window = format!(
                    "SELECT {}.* FROM {} AS {} WHERE {}.{} = {}",
                    inner, target, inner, inner, target_column, host
                );
                if !inner_order.is_empty() {
                    window.push_str(" ORDER BY ");
                    window.push_str(&inner_order);
                }
                window.push(' ');
                self.render_range(&range, &mut window);
                format!("(SELECT {} FROM ({}) AS {})", aggregate, window, outer)
            }
        }
    }
}
