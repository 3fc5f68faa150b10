// ============================================================================
// Condition / Order / Range Algebra
// ============================================================================
//
// Composable query predicates rendered to parameterized SQL. Every node
// renders through a `RenderContext` that owns
//
//   * the placeholder generator (`?` or `$1, $2, ...`),
//   * field localization: application field names are mapped to quoted,
//     table-qualified column identifiers and never emitted verbatim,
//   * a stack of entities, so a subquery resolves fields against its own
//     table and then restores the outer one.
//
// ============================================================================

pub mod expression;
pub mod order;
pub mod predicate;
pub mod range;

use crate::argument::Argument;
use crate::core::{DacError, Result};
use crate::dialect::Dialect;
use crate::entity::{ColumnKind, Table};
use std::sync::Arc;

pub use expression::{Expression, SubQuery, lit, lit_query, named};
pub use order::{Direction, Order, Orders, asc, desc};
pub use predicate::{Condition, Logic, Operator};
pub use range::{Page, Range};

/// A piece of SQL that can be rendered with its arguments.
pub trait Node {
    /// Appends the SQL for this node to `out` and returns the arguments bound
    /// by the placeholders it emitted, in emission order.
    fn render(&self, ctx: &mut RenderContext<'_>, out: &mut String) -> Result<Vec<Argument>>;
}

/// Placeholder token factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    /// The same token every time (`?`).
    Anonymous(&'static str),
    /// `prefix` followed by an increasing 1-based index (`$1`, `$2`).
    Positional { prefix: &'static str, next: usize },
}

impl Placeholder {
    pub fn anonymous() -> Self {
        Self::Anonymous("?")
    }

    pub fn positional(prefix: &'static str) -> Self {
        Self::Positional { prefix, next: 1 }
    }

    pub fn next_token(&mut self) -> String {
        match self {
            Self::Anonymous(token) => token.to_string(),
            Self::Positional { prefix, next } => {
                let token = format!("{}{}", prefix, next);
                *next += 1;
                token
            }
        }
    }
}

pub struct RenderContext<'a> {
    dialect: &'a dyn Dialect,
    placeholder: Placeholder,
    entities: Vec<Arc<Table>>,
}

impl<'a> RenderContext<'a> {
    pub fn new(dialect: &'a dyn Dialect, table: Arc<Table>) -> Self {
        Self {
            dialect,
            placeholder: dialect.placeholder(),
            entities: vec![table],
        }
    }

    /// A context without an entity, for raw statements: any field reference
    /// fails with `UnknownField`.
    pub fn detached(dialect: &'a dyn Dialect) -> Self {
        Self {
            dialect,
            placeholder: dialect.placeholder(),
            entities: Vec::new(),
        }
    }

    pub fn dialect(&self) -> &'a dyn Dialect {
        self.dialect
    }

    pub fn next_placeholder(&mut self) -> String {
        self.placeholder.next_token()
    }

    pub fn current(&self) -> Option<&Arc<Table>> {
        self.entities.last()
    }

    pub fn push_entity(&mut self, table: Arc<Table>) {
        self.entities.push(table);
    }

    pub fn pop_entity(&mut self) -> Option<Arc<Table>> {
        self.entities.pop()
    }

    /// Runs `body` with `table` as the current entity.
    pub fn within<T>(
        &mut self,
        table: Arc<Table>,
        body: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.push_entity(table);
        let result = body(self);
        self.pop_entity();
        result
    }

    /// SQL for a field of the current entity: `schema.table.column` for a
    /// stored column, `(fragment)` for a virtual one.
    pub fn localize(&self, field: &str) -> Result<String> {
        let table = self
            .current()
            .ok_or_else(|| DacError::unknown_field("<none>", field))?;
        let column = table
            .lookup(field)
            .ok_or_else(|| DacError::unknown_field(table.entity(), field))?;
        match column.kind() {
            ColumnKind::Virtual => Ok(format!("({})", column.fragment().unwrap_or_default())),
            kind if kind.is_relation() => Err(DacError::unknown_field(table.entity(), field)),
            _ => Ok(format!(
                "{}.{}",
                self.dialect.table_ident(table),
                self.dialect.format_ident(column.name())
            )),
        }
    }
}

/// Renders a top-level node into a fresh string.
pub fn render_to_string(node: &dyn Node, ctx: &mut RenderContext<'_>) -> Result<(String, Vec<Argument>)> {
    let mut out = String::new();
    let args = node.render(ctx, &mut out)?;
    Ok((out, args))
}
