use chrono::DateTime;
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    CreateBooking {
        draft: BookingDraft,
        returning: bool,
    },
    /// Full replacement of an existing booking's fields and attendees.
    UpdateBooking {
        id: Ulid,
        draft: BookingDraft,
        returning: bool,
    },
    CancelBooking {
        id: Ulid,
        returning: bool,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        id: Option<Ulid>,
        filter: BookingFilter,
    },
    SelectMyBookings {
        view: DashboardView,
    },
    SelectAttendees {
        booking_id: Ulid,
    },
    SelectDashboard,
    SelectInvite {
        booking_id: Ulid,
    },
    SelectBookingStats,
    SelectUsers,
    SetRole {
        user_id: Ulid,
        role: Role,
    },
    SelectAvailability,
    InsertAvailability {
        start: Ms,
        end: Ms,
    },
    DeleteAvailability {
        id: Ulid,
    },
    SelectOpenSlots {
        start: Ms,
        end: Ms,
    },
    SetProviderToken {
        token: Option<String>,
    },
    SignOut,
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

/// Column order for `INSERT INTO bookings VALUES (...)` without a column list.
const BOOKING_COLUMNS: &[&str] = &[
    "title",
    "description",
    "start_time",
    "end_time",
    "location",
    "meeting_link",
    "max_attendees",
    "attendees",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(cmd) = parse_session_statement(trimmed)? {
        return Ok(cmd);
    }

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

/// LISTEN / UNLISTEN / SET / DISCARD are matched textually.
fn parse_session_statement(trimmed: &str) -> Result<Option<Command>, SqlError> {
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches('"').to_string();
        return Ok(Some(Command::Listen { channel }));
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().trim_matches('"');
        if channel == "*" {
            return Ok(Some(Command::UnlistenAll));
        }
        return Ok(Some(Command::Unlisten {
            channel: channel.to_string(),
        }));
    }
    if upper == "DISCARD ALL" {
        return Ok(Some(Command::SignOut));
    }
    if upper.starts_with("SET ") {
        let rest = trimmed[4..].trim();
        let (name, value) = match rest.split_once('=') {
            Some((n, v)) => (n.trim(), v.trim()),
            None => match rest.split_once(char::is_whitespace) {
                Some((n, v)) if v.trim_start().to_uppercase().starts_with("TO ") => (n.trim(), v.trim_start()[3..].trim()),
                _ => return Err(SqlError::Parse(format!("bad SET: {trimmed}"))),
            },
        };
        if !name.eq_ignore_ascii_case("provider_token") {
            return Err(SqlError::Unsupported(format!("SET {name}")));
        }
        let token = if value.eq_ignore_ascii_case("default") || value.eq_ignore_ascii_case("null") {
            None
        } else {
            let unquoted = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .unwrap_or(value)
                .replace("''", "'");
            Some(unquoted).filter(|t| !t.is_empty())
        };
        return Ok(Some(Command::SetProviderToken { token }));
    }
    Ok(None)
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let names: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let returning = insert.returning.is_some();

    match table.as_str() {
        "bookings" => {
            let row = Row::new(&names, &values, BOOKING_COLUMNS)?;
            Ok(Command::CreateBooking {
                draft: parse_draft(&row)?,
                returning,
            })
        }
        "booking_edits" => {
            let mut columns = vec!["id"];
            columns.extend_from_slice(BOOKING_COLUMNS);
            let row = Row::new(&names, &values, &columns)?;
            Ok(Command::UpdateBooking {
                id: parse_ulid_expr(row.require("id")?)?,
                draft: parse_draft(&row)?,
                returning,
            })
        }
        "cancellations" => {
            let row = Row::new(&names, &values, &["booking_id"])?;
            Ok(Command::CancelBooking {
                id: parse_ulid_expr(row.require("booking_id")?)?,
                returning,
            })
        }
        "user_roles" => {
            let row = Row::new(&names, &values, &["user_id", "role"])?;
            let raw = parse_string_expr(row.require("role")?)?;
            let role = Role::parse(&raw).ok_or_else(|| SqlError::Parse(format!("unknown role: {raw}")))?;
            Ok(Command::SetRole {
                user_id: parse_ulid_expr(row.require("user_id")?)?,
                role,
            })
        }
        "availability" => {
            let row = Row::new(&names, &values, &["start_time", "end_time"])?;
            Ok(Command::InsertAvailability {
                start: parse_time_expr(row.require("start_time")?)?,
                end: parse_time_expr(row.require("end_time")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_draft(row: &Row<'_>) -> Result<BookingDraft, SqlError> {
    let attendees = match row.get("attendees") {
        None => Vec::new(),
        Some(expr) => match parse_opt_string_expr(expr)? {
            None => Vec::new(),
            Some(json) => serde_json::from_str::<Vec<AttendeeInput>>(&json)
                .map_err(|e| SqlError::Parse(format!("bad attendees JSON: {e}")))?,
        },
    };
    let max_attendees = match row.get("max_attendees") {
        None => None,
        Some(expr) => parse_i64_or_null(expr)?
            .map(|v| u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range"))))
            .transpose()?,
    };
    Ok(BookingDraft {
        title: parse_string_expr(row.require("title")?)?,
        description: row.get("description").map(parse_opt_string_expr).transpose()?.flatten(),
        start: parse_time_expr(row.require("start_time")?)?,
        end: parse_time_expr(row.require("end_time")?)?,
        location: row.get("location").map(parse_opt_string_expr).transpose()?.flatten(),
        meeting_link: row.get("meeting_link").map(parse_opt_string_expr).transpose()?.flatten(),
        max_attendees,
        attendees,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking { id }),
        "availability" => Ok(Command::DeleteAvailability { id }),
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

    let mut preds = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut preds)?;
    }
    let eq = |col: &str| {
        preds
            .iter()
            .find(|(c, op, _)| c == col && *op == BinaryOperator::Eq)
            .map(|(_, _, e)| *e)
    };

    match table.as_str() {
        "bookings" => {
            let mut filter = BookingFilter::default();
            if let Some(e) = eq("status") {
                let raw = parse_string_expr(e)?;
                filter.status =
                    Some(BookingStatus::parse(&raw).ok_or_else(|| SqlError::Parse(format!("unknown status: {raw}")))?);
            }
            if let Some(e) = eq("created_by") {
                filter.created_by = Some(parse_ulid_expr(e)?);
            }
            let (mut after, mut before) = (None, None);
            for (col, op, e) in &preds {
                match (col.as_str(), op) {
                    ("start_time", BinaryOperator::GtEq) => filter.starts_from = Some(parse_time_expr(e)?),
                    ("end_time", BinaryOperator::Gt) => after = Some(parse_time_expr(e)?),
                    ("start_time", BinaryOperator::Lt) => before = Some(parse_time_expr(e)?),
                    _ => {}
                }
            }
            if after.is_some() || before.is_some() {
                let (start, end) = (after.unwrap_or(Ms::MIN), before.unwrap_or(Ms::MAX));
                if start >= end {
                    return Err(SqlError::Parse("empty time range".into()));
                }
                filter.overlapping = Some(Span::new(start, end));
            }
            let id = eq("id").map(parse_ulid_expr).transpose()?;
            Ok(Command::SelectBookings { id, filter })
        }
        "my_bookings" => {
            let view = match eq("view") {
                None => DashboardView::All,
                Some(e) => {
                    let raw = parse_string_expr(e)?;
                    DashboardView::parse(&raw).ok_or_else(|| SqlError::Parse(format!("unknown view: {raw}")))?
                }
            };
            Ok(Command::SelectMyBookings { view })
        }
        "attendees" => Ok(Command::SelectAttendees {
            booking_id: parse_ulid_expr(eq("booking_id").ok_or(SqlError::MissingFilter("booking_id"))?)?,
        }),
        "invites" => Ok(Command::SelectInvite {
            booking_id: parse_ulid_expr(eq("booking_id").ok_or(SqlError::MissingFilter("booking_id"))?)?,
        }),
        "dashboard" => Ok(Command::SelectDashboard),
        "booking_stats" => Ok(Command::SelectBookingStats),
        "users" => Ok(Command::SelectUsers),
        "availability" => Ok(Command::SelectAvailability),
        "open_slots" => {
            let bound = |col: &str, op: BinaryOperator| {
                preds
                    .iter()
                    .find(|(c, o, _)| c == col && *o == op)
                    .map(|(_, _, e)| *e)
            };
            Ok(Command::SelectOpenSlots {
                start: parse_time_expr(
                    bound("start_time", BinaryOperator::GtEq).ok_or(SqlError::MissingFilter("start_time"))?,
                )?,
                end: parse_time_expr(
                    bound("end_time", BinaryOperator::LtEq).ok_or(SqlError::MissingFilter("end_time"))?,
                )?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten an AND-chain of `column <op> value` comparisons.
fn collect_predicates<'a>(expr: &'a Expr, out: &mut Vec<(String, BinaryOperator, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((col, op.clone(), right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

/// VALUES matched to column names, by explicit list or by default order.
struct Row<'a> {
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(names: &[String], values: &'a [Expr], default_order: &[&str]) -> Result<Self, SqlError> {
        let cells = if names.is_empty() {
            if values.len() > default_order.len() {
                return Err(SqlError::Parse(format!(
                    "expected at most {} values, got {}",
                    default_order.len(),
                    values.len()
                )));
            }
            default_order.iter().map(|n| n.to_string()).zip(values.iter()).collect()
        } else {
            if names.len() != values.len() {
                return Err(SqlError::Parse(format!(
                    "{} columns but {} values",
                    names.len(),
                    values.len()
                )));
            }
            names.iter().cloned().zip(values.iter()).collect()
        };
        Ok(Self { cells })
    }

    fn get(&self, name: &str) -> Option<&'a Expr> {
        self.cells.iter().find(|(n, _)| n == name).map(|(_, e)| *e)
    }

    fn require(&self, name: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(name).ok_or(SqlError::MissingColumn(name))
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
        TableObject::TableName(name) => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
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
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
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
            op: BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_opt_string_expr(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::EscapedStringLiteral(s)) => Ok(Some(s.clone())),
        Some(Value::DollarQuotedString(d)) => Ok(Some(d.value.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    parse_opt_string_expr(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s.parse().map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s.parse().map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_i64_expr(expr)?)),
    }
}

/// Unix milliseconds, or an RFC 3339 timestamp string.
fn parse_time_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64_expr(expr)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing WHERE filter: {0}")]
    MissingFilter(&'static str),
}
