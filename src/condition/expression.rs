use super::{Condition, Node, RenderContext};
use crate::argument::Argument;
use crate::core::{DacError, Result, ToValue, Value};
use crate::entity::{Entity, Table};
use std::sync::Arc;

/// Right-hand side of a predicate.
#[derive(Debug, Clone)]
pub enum Expression {
    /// SQL text emitted verbatim; allocates no placeholder.
    Literal(String),
    /// A named argument bound through a placeholder.
    Named(String, Value),
    SubQuery(SubQuery),
    /// A value bound through a fresh placeholder.
    Value(Value),
    /// Operands of BETWEEN / IN / NOT IN.
    List(Vec<Expression>),
}

#[derive(Debug, Clone)]
pub enum SubQuery {
    /// `SELECT <field> FROM <entity> [WHERE <condition>]`.
    Entity {
        loader: fn() -> Result<Arc<Table>>,
        field: String,
        condition: Option<Box<Condition>>,
    },
    /// Opaque SQL with its own arguments.
    Sql { text: String, args: Vec<Argument> },
}

impl SubQuery {
    pub fn entity<T: Entity>(field: impl Into<String>, condition: Option<Condition>) -> Self {
        Self::Entity {
            loader: crate::entity::load::<T>,
            field: field.into(),
            condition: condition.map(Box::new),
        }
    }

    pub fn sql(text: impl Into<String>) -> Self {
        Self::Sql {
            text: text.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(text: impl Into<String>, args: Vec<Argument>) -> Self {
        Self::Sql {
            text: text.into(),
            args,
        }
    }
}

impl Node for SubQuery {
    /// Renders the query body without surrounding parentheses.
    fn render(&self, ctx: &mut RenderContext<'_>, out: &mut String) -> Result<Vec<Argument>> {
        match self {
            SubQuery::Sql { text, args } => {
                // Positional dialects renumber the embedded placeholders;
                // a `?` inside a quoted span is text.
                let mut rendered = String::with_capacity(text.len());
                let mut consumed = 0;
                let mut quote: Option<char> = None;
                for ch in text.chars() {
                    match quote {
                        Some(open) if ch == open => quote = None,
                        None if matches!(ch, '\'' | '"' | '`') => quote = Some(ch),
                        _ => {}
                    }
                    if ch == '?' && quote.is_none() && consumed < args.len() {
                        rendered.push_str(&ctx.next_placeholder());
                        consumed += 1;
                    } else {
                        rendered.push(ch);
                    }
                }
                if consumed != args.len() {
                    return Err(DacError::invalid_operands(
                        "subquery",
                        format!("{} placeholders for {} arguments", consumed, args.len()),
                    ));
                }
                out.push_str(&rendered);
                Ok(args.clone())
            }
            SubQuery::Entity {
                loader,
                field,
                condition,
            } => {
                let table = loader()?;
                ctx.within(table.clone(), |ctx| {
                    let column = ctx.localize(field)?;
                    out.push_str("SELECT ");
                    out.push_str(&column);
                    out.push_str(" FROM ");
                    out.push_str(&ctx.dialect().table_ident(&table));
                    match condition {
                        Some(condition) => {
                            out.push_str(" WHERE ");
                            condition.render(ctx, out)
                        }
                        None => Ok(Vec::new()),
                    }
                })
            }
        }
    }
}

fn check_encodable(value: &Value) -> Result<()> {
    if let Value::Float(f) = value {
        if !f.is_finite() {
            return Err(DacError::UnsupportedArgument(format!(
                "float {} cannot be bound",
                f
            )));
        }
    }
    Ok(())
}

impl Node for Expression {
    fn render(&self, ctx: &mut RenderContext<'_>, out: &mut String) -> Result<Vec<Argument>> {
        match self {
            Expression::Literal(text) => {
                out.push_str(text);
                Ok(Vec::new())
            }
            Expression::Named(name, value) => {
                check_encodable(value)?;
                out.push_str(&ctx.next_placeholder());
                Ok(vec![Argument::named(name.clone(), value.clone())])
            }
            Expression::Value(value) => {
                check_encodable(value)?;
                out.push_str(&ctx.next_placeholder());
                Ok(vec![Argument::new(value.clone())])
            }
            Expression::SubQuery(query) => {
                out.push('(');
                let args = query.render(ctx, out)?;
                out.push(')');
                Ok(args)
            }
            Expression::List(items) => {
                let mut args = Vec::new();
                out.push('(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    args.extend(item.render(ctx, out)?);
                }
                out.push(')');
                Ok(args)
            }
        }
    }
}

impl<T: ToValue> From<T> for Expression {
    fn from(value: T) -> Self {
        Expression::Value(value.to_value())
    }
}

impl From<SubQuery> for Expression {
    fn from(query: SubQuery) -> Self {
        Expression::SubQuery(query)
    }
}

/// SQL text emitted as is.
pub fn lit(text: impl Into<String>) -> Expression {
    Expression::Literal(text.into())
}

pub fn named(name: impl Into<String>, value: impl ToValue) -> Expression {
    Expression::Named(name.into(), value.to_value())
}

/// An opaque SQL subquery. Its `?` placeholders outside quoted spans bind
/// the arguments of [`SubQuery::with_args`] in order.
pub fn lit_query(text: impl Into<String>) -> SubQuery {
    SubQuery::sql(text)
}
