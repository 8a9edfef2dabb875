use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBooking {
        id: Option<Ulid>,
        service_type: String,
        date: String,
        location: Option<String>,
    },
    /// Accept (provider) or assign (admin).
    InsertAssignment {
        booking_id: Ulid,
        provider: Option<Ulid>,
    },
    InsertTransition {
        booking_id: Ulid,
        status: Status,
        expected: Option<Status>,
        provider: Option<Ulid>,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        id: Option<Ulid>,
        status: Option<Status>,
    },
    SelectHistory {
        booking_id: Ulid,
    },
    SelectProviders,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let arg = |i: usize| values.get(i);

    match table.as_str() {
        "bookings" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("bookings", 3, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid_or_null(&values[0])?,
                service_type: parse_string(&values[1])?,
                date: parse_string(&values[2])?,
                location: arg(3).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "assignments" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("assignments", 1, 0));
            }
            Ok(Command::InsertAssignment {
                booking_id: parse_ulid(&values[0])?,
                provider: arg(1).map(parse_ulid_or_null).transpose()?.flatten(),
            })
        }
        "transitions" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("transitions", 2, values.len()));
            }
            Ok(Command::InsertTransition {
                booking_id: parse_ulid(&values[0])?,
                status: parse_status(&values[1])?,
                expected: arg(2).map(parse_status_or_null).transpose()?.flatten(),
                provider: arg(3).map(parse_ulid_or_null).transpose()?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking {
            id: extract_where_id(&delete.selection)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "bookings" => {
            let (mut id, mut status) = (None, None);
            for (col, value) in &filters {
                match col.as_str() {
                    "id" => id = Some(parse_ulid(value)?),
                    "status" => status = Some(parse_status(value)?),
                    _ => return Err(SqlError::UnknownColumn(col.clone())),
                }
            }
            Ok(Command::SelectBookings { id, status })
        }
        "booking_history" => {
            let mut booking_id = None;
            for (col, value) in &filters {
                match col.as_str() {
                    "booking_id" => booking_id = Some(parse_ulid(value)?),
                    _ => return Err(SqlError::UnknownColumn(col.clone())),
                }
            }
            Ok(Command::SelectHistory {
                booking_id: booking_id.ok_or(SqlError::MissingFilter("booking_id"))?,
            })
        }
        "providers" => match filters.first() {
            Some((col, _)) => Err(SqlError::UnknownColumn(col.clone())),
            None => Ok(Command::SelectProviders),
        },
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y ...` into `(column, value)` pairs.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::BadValue(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::BadValue("unexpected NULL".into()))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    parse_string_or_null(expr)?
        .map(|s| Ulid::from_string(&s).map_err(|e| SqlError::BadValue(format!("bad ULID: {e}"))))
        .transpose()
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_or_null(expr)?.ok_or_else(|| SqlError::BadValue("unexpected NULL id".into()))
}

fn parse_status_or_null(expr: &Expr) -> Result<Option<Status>, SqlError> {
    parse_string_or_null(expr)?
        .map(|s| s.parse::<Status>().map_err(SqlError::BadValue))
        .transpose()
}

fn parse_status(expr: &Expr) -> Result<Status, SqlError> {
    parse_status_or_null(expr)?.ok_or_else(|| SqlError::BadValue("unexpected NULL status".into()))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{0}: expected at least {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid value: {0}")]
    BadValue(String),
}
