//! Fluent SELECT builder that compiles to parameterized statements.
//!
//! Each builder method appends an immutable clause record; [`QueryBuilder::compile`]
//! renders them in a fixed order:
//!
//! ```text
//! SELECT … FROM … JOIN* … WHERE (AND-joined, call order) … ORDER BY … LIMIT … OFFSET …
//! ```
//!
//! Values passed to `and_where` never reach the statement text: each one gets
//! a `$n` placeholder and is appended to the parameter list. Identifiers and
//! operators are validated before they are recorded.
//!
//! # Example
//!
//! ```
//! use db_client_core::query::QueryBuilder;
//!
//! let stmt = QueryBuilder::table("users")
//!     .and_where("age", ">", 18)
//!     .and_where("active", "=", true)
//!     .compile()
//!     .unwrap();
//! assert_eq!(stmt.text(), "SELECT * FROM users WHERE age > $1 AND active = $2");
//! ```

use super::identifier::{is_valid_identifier, is_valid_select_field};
use crate::error::{DbError, DbResult};
use crate::models::{Statement, Value};
use std::fmt::Write as _;

/// Whitelisted comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Like,
    In,
}

impl Operator {
    /// Parse an operator string; `LIKE` and `IN` are case-insensitive.
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "=" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            ">" => Some(Self::Gt),
            "<" => Some(Self::Lt),
            ">=" => Some(Self::Ge),
            "<=" => Some(Self::Le),
            _ if op.eq_ignore_ascii_case("like") => Some(Self::Like),
            _ if op.eq_ignore_ascii_case("in") => Some(Self::In),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Like => "LIKE",
            Self::In => "IN",
        }
    }

    /// Usable between two columns in a join condition.
    fn is_comparison(&self) -> bool {
        !matches!(self, Self::Like | Self::In)
    }
}

/// Sort direction for `ORDER BY`.
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
enum Clause {
    Select(String),
    From(String),
    Join {
        kind: JoinKind,
        table: String,
        left: String,
        op: Operator,
        right: String,
    },
    Where {
        field: String,
        op: Operator,
        values: Vec<Value>,
    },
    OrderBy {
        field: String,
        direction: Direction,
    },
    Limit(u64),
    Offset(u64),
}

/// First invalid builder call, reported by `compile()`.
#[derive(Debug, Clone, PartialEq)]
enum BuildError {
    InvalidIdentifier(String),
    UnsupportedOperator(String),
    InvalidState(String),
}

impl From<BuildError> for DbError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::InvalidIdentifier(name) => DbError::invalid_identifier(name),
            BuildError::UnsupportedOperator(op) => DbError::unsupported_operator(op),
            BuildError::InvalidState(message) => DbError::invalid_state(message),
        }
    }
}

/// Injection-safe SELECT builder.
///
/// Builders are values: every method consumes and returns the builder, and
/// `Clone` forks a partially built query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryBuilder {
    clauses: Vec<Clause>,
    error: Option<BuildError>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for `QueryBuilder::new().from(table)`.
    pub fn table(table: &str) -> Self {
        Self::new().from(table)
    }

    fn push(mut self, clause: Clause) -> Self {
        if self.error.is_none() {
            self.clauses.push(clause);
        }
        self
    }

    fn fail(mut self, error: BuildError) -> Self {
        if self.error.is_none() {
            self.error = Some(error);
        }
        self
    }

    fn checked_identifier(&self, name: &str) -> Result<String, BuildError> {
        if is_valid_identifier(name) {
            Ok(name.to_string())
        } else {
            Err(BuildError::InvalidIdentifier(name.to_string()))
        }
    }

    /// Add columns to the select list. Without any, `*` is selected.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for field in fields {
            let field = field.as_ref();
            self = if is_valid_select_field(field) {
                self.push(Clause::Select(field.to_string()))
            } else {
                self.fail(BuildError::InvalidIdentifier(field.to_string()))
            };
        }
        self
    }

    /// Set the table to select from. Exactly one `from` is allowed.
    pub fn from(self, table: &str) -> Self {
        match self.checked_identifier(table) {
            Ok(table) => self.push(Clause::From(table)),
            Err(e) => self.fail(e),
        }
    }

    /// `JOIN table ON left op right`.
    pub fn join(self, table: &str, left: &str, op: &str, right: &str) -> Self {
        self.join_clause(JoinKind::Inner, table, left, op, right)
    }

    /// `LEFT JOIN table ON left op right`.
    pub fn left_join(self, table: &str, left: &str, op: &str, right: &str) -> Self {
        self.join_clause(JoinKind::Left, table, left, op, right)
    }

    fn join_clause(self, kind: JoinKind, table: &str, left: &str, op: &str, right: &str) -> Self {
        let parsed = (|| -> Result<Clause, BuildError> {
            let table = self.checked_identifier(table)?;
            let left = self.checked_identifier(left)?;
            let op = Operator::parse(op)
                .filter(Operator::is_comparison)
                .ok_or_else(|| BuildError::UnsupportedOperator(op.to_string()))?;
            let right = self.checked_identifier(right)?;
            Ok(Clause::Join {
                kind,
                table,
                left,
                op,
                right,
            })
        })();
        match parsed {
            Ok(clause) => self.push(clause),
            Err(e) => self.fail(e),
        }
    }

    /// `field op $n`, AND-joined with previous conditions.
    ///
    /// With `IN` the single value renders as `field IN ($n)`; use
    /// [`and_where_in`](Self::and_where_in) for lists.
    pub fn and_where(self, field: &str, op: &str, value: impl Into<Value>) -> Self {
        let parsed = self.checked_identifier(field).and_then(|field| {
            Operator::parse(op)
                .map(|op| (field, op))
                .ok_or_else(|| BuildError::UnsupportedOperator(op.to_string()))
        });
        match parsed {
            Ok((field, op)) => self.push(Clause::Where {
                field,
                op,
                values: vec![value.into()],
            }),
            Err(e) => self.fail(e),
        }
    }

    /// `field IN ($n, $n+1, …)`. An empty list matches nothing.
    pub fn and_where_in<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        match self.checked_identifier(field) {
            Ok(field) => self.push(Clause::Where {
                field,
                op: Operator::In,
                values: values.into_iter().map(Into::into).collect(),
            }),
            Err(e) => self.fail(e),
        }
    }

    pub fn order_by(self, field: &str, direction: Direction) -> Self {
        match self.checked_identifier(field) {
            Ok(field) => self.push(Clause::OrderBy { field, direction }),
            Err(e) => self.fail(e),
        }
    }

    /// Later calls replace earlier ones.
    pub fn limit(self, n: u64) -> Self {
        self.push(Clause::Limit(n))
    }

    /// Later calls replace earlier ones.
    pub fn offset(self, n: u64) -> Self {
        self.push(Clause::Offset(n))
    }

    /// Render the accumulated clauses.
    ///
    /// Pure: the same call sequence always yields the same statement.
    pub fn compile(&self) -> DbResult<Statement> {
        if let Some(err) = &self.error {
            return Err(err.clone().into());
        }

        let mut fields = Vec::new();
        let mut tables = Vec::new();
        let mut joins = Vec::new();
        let mut conditions = Vec::new();
        let mut orders = Vec::new();
        let mut limit = None;
        let mut offset = None;

        for clause in &self.clauses {
            match clause {
                Clause::Select(field) => fields.push(field.as_str()),
                Clause::From(table) => tables.push(table.as_str()),
                Clause::Join { .. } => joins.push(clause),
                Clause::Where { .. } => conditions.push(clause),
                Clause::OrderBy { field, direction } => {
                    orders.push(format!("{} {}", field, direction.as_sql()))
                }
                Clause::Limit(n) => limit = Some(*n),
                Clause::Offset(n) => offset = Some(*n),
            }
        }

        let table = match tables.as_slice() {
            [table] => *table,
            [] => return Err(DbError::invalid_state("query has no FROM clause")),
            _ => {
                return Err(DbError::invalid_state(format!(
                    "query has {} FROM clauses, expected one",
                    tables.len()
                )));
            }
        };

        let mut text = String::from("SELECT ");
        if fields.is_empty() {
            text.push('*');
        } else {
            text.push_str(&fields.join(", "));
        }
        let _ = write!(text, " FROM {}", table);

        for join in joins {
            if let Clause::Join {
                kind,
                table,
                left,
                op,
                right,
            } = join
            {
                let keyword = match kind {
                    JoinKind::Inner => "JOIN",
                    JoinKind::Left => "LEFT JOIN",
                };
                let _ = write!(
                    text,
                    " {} {} ON {} {} {}",
                    keyword,
                    table,
                    left,
                    op.as_sql(),
                    right
                );
            }
        }

        let mut params: Vec<Value> = Vec::new();
        let mut rendered = Vec::with_capacity(conditions.len());
        for condition in conditions {
            if let Clause::Where { field, op, values } = condition {
                rendered.push(render_condition(field, *op, values, &mut params));
            }
        }
        if !rendered.is_empty() {
            let _ = write!(text, " WHERE {}", rendered.join(" AND "));
        }

        if !orders.is_empty() {
            let _ = write!(text, " ORDER BY {}", orders.join(", "));
        }
        if let Some(n) = limit {
            let _ = write!(text, " LIMIT {}", n);
        }
        if let Some(n) = offset {
            let _ = write!(text, " OFFSET {}", n);
        }

        Ok(Statement::new(text, params))
    }
}

fn render_condition(field: &str, op: Operator, values: &[Value], params: &mut Vec<Value>) -> String {
    let mut placeholder = |value: &Value| {
        params.push(value.clone());
        format!("${}", params.len())
    };

    match op {
        Operator::In if values.is_empty() => "FALSE".to_string(),
        Operator::In => {
            let list: Vec<String> = values.iter().map(&mut placeholder).collect();
            format!("{} IN ({})", field, list.join(", "))
        }
        _ => {
            let rendered = values
                .first()
                .map(&mut placeholder)
                .unwrap_or_else(|| "NULL".to_string());
            format!("{} {} {}", field, op.as_sql(), rendered)
        }
    }
}
