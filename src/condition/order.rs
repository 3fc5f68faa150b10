use super::{Node, RenderContext};
use crate::argument::Argument;
use crate::core::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    field: String,
    direction: Direction,
}

impl Order {
    pub fn new(field: impl Into<String>, direction: Direction) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

pub fn asc(field: impl Into<String>) -> Order {
    Order::new(field, Direction::Asc)
}

pub fn desc(field: impl Into<String>) -> Order {
    Order::new(field, Direction::Desc)
}

/// Ordered sequence of sort keys. Renders `ORDER BY a ASC, b DESC`, or
/// nothing when empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Orders(Vec<Order>);

impl Orders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, order: Order) {
        self.0.push(order);
    }

    pub fn then(mut self, order: Order) -> Self {
        self.0.push(order);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Order> {
        self.0.iter()
    }

    /// The sort keys only, without the `ORDER BY` keyword.
    pub fn render_keys(&self, ctx: &mut RenderContext<'_>, out: &mut String) -> Result<()> {
        for (i, order) in self.0.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&ctx.localize(order.field())?);
            out.push(' ');
            out.push_str(order.direction().as_sql());
        }
        Ok(())
    }
}

impl From<Vec<Order>> for Orders {
    fn from(orders: Vec<Order>) -> Self {
        Self(orders)
    }
}

impl From<Order> for Orders {
    fn from(order: Order) -> Self {
        Self(vec![order])
    }
}

impl Node for Orders {
    fn render(&self, ctx: &mut RenderContext<'_>, out: &mut String) -> Result<Vec<Argument>> {
        if self.0.is_empty() {
            return Ok(Vec::new());
        }
        out.push_str("ORDER BY ");
        self.render_keys(ctx, out)?;
        Ok(Vec::new())
    }
}
