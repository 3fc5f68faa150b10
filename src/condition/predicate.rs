use super::{Expression, Node, RenderContext};
use crate::argument::Argument;
use crate::core::{DacError, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Gt,
    GtEq,
    Lt,
    LtEq,
    Between,
    In,
    NotIn,
    Like,
}

impl Operator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Between => "BETWEEN",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::Like => "LIKE",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logic {
    And,
    Or,
}

impl Logic {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

/// A predicate tree.
///
/// `a.and(b).or(c)` renders `(a AND b) OR c`: combinators mark the composite
/// they build as a group, a grouped child is parenthesized, and the top level
/// is never wrapped.
#[derive(Debug, Clone)]
pub enum Condition {
    Predicate {
        field: String,
        operator: Operator,
        expression: Expression,
    },
    Composite {
        logic: Logic,
        left: Box<Condition>,
        right: Box<Condition>,
        group: bool,
    },
}

impl Condition {
    fn predicate(field: impl Into<String>, operator: Operator, expression: Expression) -> Self {
        Self::Predicate {
            field: field.into(),
            operator,
            expression,
        }
    }

    pub fn eq(field: impl Into<String>, expr: impl Into<Expression>) -> Self {
        Self::predicate(field, Operator::Eq, expr.into())
    }

    pub fn not_eq(field: impl Into<String>, expr: impl Into<Expression>) -> Self {
        Self::predicate(field, Operator::NotEq, expr.into())
    }

    pub fn gt(field: impl Into<String>, expr: impl Into<Expression>) -> Self {
        Self::predicate(field, Operator::Gt, expr.into())
    }

    pub fn gt_eq(field: impl Into<String>, expr: impl Into<Expression>) -> Self {
        Self::predicate(field, Operator::GtEq, expr.into())
    }

    pub fn lt(field: impl Into<String>, expr: impl Into<Expression>) -> Self {
        Self::predicate(field, Operator::Lt, expr.into())
    }

    pub fn lt_eq(field: impl Into<String>, expr: impl Into<Expression>) -> Self {
        Self::predicate(field, Operator::LtEq, expr.into())
    }

    pub fn between(
        field: impl Into<String>,
        low: impl Into<Expression>,
        high: impl Into<Expression>,
    ) -> Self {
        Self::predicate(
            field,
            Operator::Between,
            Expression::List(vec![low.into(), high.into()]),
        )
    }

    /// BETWEEN over an arbitrary operand list; rendering fails unless it
    /// holds exactly two operands.
    pub fn between_list<E: Into<Expression>>(
        field: impl Into<String>,
        operands: impl IntoIterator<Item = E>,
    ) -> Self {
        Self::predicate(
            field,
            Operator::Between,
            Expression::List(operands.into_iter().map(Into::into).collect()),
        )
    }

    pub fn in_list<E: Into<Expression>>(
        field: impl Into<String>,
        items: impl IntoIterator<Item = E>,
    ) -> Self {
        Self::predicate(
            field,
            Operator::In,
            Expression::List(items.into_iter().map(Into::into).collect()),
        )
    }

    pub fn not_in_list<E: Into<Expression>>(
        field: impl Into<String>,
        items: impl IntoIterator<Item = E>,
    ) -> Self {
        Self::predicate(
            field,
            Operator::NotIn,
            Expression::List(items.into_iter().map(Into::into).collect()),
        )
    }

    /// `field IN (subquery)`.
    pub fn in_query(field: impl Into<String>, query: super::SubQuery) -> Self {
        Self::predicate(field, Operator::In, Expression::SubQuery(query))
    }

    pub fn not_in_query(field: impl Into<String>, query: super::SubQuery) -> Self {
        Self::predicate(field, Operator::NotIn, Expression::SubQuery(query))
    }

    /// `field LIKE 'text%'`.
    pub fn prefix(field: impl Into<String>, text: &str) -> Self {
        Self::predicate(field, Operator::Like, format!("{}%", text).into())
    }

    /// `field LIKE '%text'`.
    pub fn suffix(field: impl Into<String>, text: &str) -> Self {
        Self::predicate(field, Operator::Like, format!("%{}", text).into())
    }

    /// `field LIKE '%text%'`.
    pub fn contains(field: impl Into<String>, text: &str) -> Self {
        Self::predicate(field, Operator::Like, format!("%{}%", text).into())
    }

    pub fn and(self, other: Condition) -> Self {
        self.combine(Logic::And, other)
    }

    pub fn or(self, other: Condition) -> Self {
        self.combine(Logic::Or, other)
    }

    fn combine(self, logic: Logic, other: Condition) -> Self {
        Self::Composite {
            logic,
            left: Box::new(self),
            right: Box::new(other),
            group: true,
        }
    }

    /// Same composite without the group mark, so it is never parenthesized.
    pub fn ungrouped(self) -> Self {
        match self {
            Self::Composite {
                logic, left, right, ..
            } => Self::Composite {
                logic,
                left,
                right,
                group: false,
            },
            predicate => predicate,
        }
    }

    fn is_group(&self) -> bool {
        matches!(self, Self::Composite { group: true, .. })
    }

    fn render_child(
        child: &Condition,
        ctx: &mut RenderContext<'_>,
        out: &mut String,
    ) -> Result<Vec<Argument>> {
        if child.is_group() {
            out.push('(');
            let args = child.render(ctx, out)?;
            out.push(')');
            Ok(args)
        } else {
            child.render(ctx, out)
        }
    }
}

fn render_predicate(
    field: &str,
    operator: Operator,
    expression: &Expression,
    ctx: &mut RenderContext<'_>,
    out: &mut String,
) -> Result<Vec<Argument>> {
    let column = ctx.localize(field)?;
    out.push_str(&column);
    out.push(' ');
    out.push_str(operator.as_sql());
    out.push(' ');

    match (operator, expression) {
        (Operator::Between, Expression::List(items)) => {
            if items.len() != 2 {
                return Err(DacError::invalid_operands(
                    "BETWEEN",
                    format!("expected 2 operands, got {}", items.len()),
                ));
            }
            let mut args = items[0].render(ctx, out)?;
            out.push_str(" AND ");
            args.extend(items[1].render(ctx, out)?);
            Ok(args)
        }
        (Operator::Between, _) => Err(DacError::invalid_operands(
            "BETWEEN",
            "expected 2 operands",
        )),
        (Operator::In | Operator::NotIn, Expression::List(items)) => {
            if items.is_empty() {
                return Err(DacError::invalid_operands(
                    operator.as_sql(),
                    "expected at least 1 operand",
                ));
            }
            expression.render(ctx, out)
        }
        (Operator::In | Operator::NotIn, Expression::SubQuery(_)) => expression.render(ctx, out),
        (Operator::In | Operator::NotIn, _) => Err(DacError::invalid_operands(
            operator.as_sql(),
            "expected a list or a subquery",
        )),
        (_, Expression::List(_)) => Err(DacError::invalid_operands(
            operator.as_sql(),
            "a list is only valid for BETWEEN, IN and NOT IN",
        )),
        _ => expression.render(ctx, out),
    }
}

impl Node for Condition {
    fn render(&self, ctx: &mut RenderContext<'_>, out: &mut String) -> Result<Vec<Argument>> {
        match self {
            Condition::Predicate {
                field,
                operator,
                expression,
            } => render_predicate(field, *operator, expression, ctx, out),
            Condition::Composite {
                logic, left, right, ..
            } => {
                let mut args = Condition::render_child(left, ctx, out)?;
                out.push(' ');
                out.push_str(logic.as_sql());
                out.push(' ');
                args.extend(Condition::render_child(right, ctx, out)?);
                Ok(args)
            }
        }
    }
}
