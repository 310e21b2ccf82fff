use chrono::{DateTime, NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
///
/// Every state change is an INSERT into a table named after it; booking
/// transitions are rows in `acknowledgements`, `cancellations`,
/// `completions` and `no_shows`, and a profile change is a row in
/// `tutor_settings`.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertTutor {
        profile: TutorProfile,
    },
    UpdateTutor {
        profile: TutorProfile,
    },
    InsertRule {
        rule: AvailabilityRule,
    },
    DeleteRule {
        id: Ulid,
    },
    InsertException {
        exception: AvailabilityException,
    },
    DeleteException {
        id: Ulid,
    },
    InsertVacation {
        vacation: Vacation,
    },
    DeleteVacation {
        id: Ulid,
    },
    InsertHold {
        id: Ulid,
        tutor_id: Ulid,
        consumer_id: Ulid,
        start: Ms,
        duration_minutes: u32,
    },
    DeleteHold {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        hold_id: Ulid,
        consumer_id: Ulid,
        student_id: Ulid,
    },
    Acknowledge {
        booking_id: Ulid,
        actor: Ulid,
    },
    Cancel {
        booking_id: Ulid,
        actor: Ulid,
    },
    Complete {
        booking_id: Ulid,
        actor: Ulid,
    },
    ReportNoShow {
        booking_id: Ulid,
        actor: Ulid,
        absent: Party,
    },
    SelectTutors,
    SelectRules {
        tutor_id: Ulid,
    },
    SelectExceptions {
        tutor_id: Ulid,
    },
    SelectVacations {
        tutor_id: Ulid,
    },
    SelectHolds {
        tutor_id: Ulid,
    },
    SelectBookings {
        tutor_id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectSlots {
        tutor_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        duration_minutes: u32,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let arity = |name: &'static str, min: usize| {
        if values.len() < min {
            Err(SqlError::WrongArity(name, min, values.len()))
        } else {
            Ok(())
        }
    };

    match table.as_str() {
        "tutors" | "tutor_settings" => {
            arity("tutors", 4)?;
            let profile = parse_profile(&values)?;
            if table == "tutors" {
                Ok(Command::InsertTutor { profile })
            } else {
                Ok(Command::UpdateTutor { profile })
            }
        }
        "rules" => {
            arity("rules", 5)?;
            let day_of_week = parse_u32(&values[2])?;
            let day_of_week = u8::try_from(day_of_week)
                .map_err(|_| SqlError::Parse(format!("{day_of_week} is not a weekday")))?;
            Ok(Command::InsertRule {
                rule: AvailabilityRule {
                    id: parse_ulid(&values[0])?,
                    tutor_id: parse_ulid(&values[1])?,
                    day_of_week,
                    window: parse_window_bounds(&values[3], &values[4])?,
                    timezone: optional(&values, 5, parse_string)?.unwrap_or_default(),
                    valid_from: optional(&values, 6, parse_date)?,
                    valid_until: optional(&values, 7, parse_date)?,
                },
            })
        }
        "exceptions" => {
            arity("exceptions", 4)?;
            let windows = match optional(&values, 4, parse_string)? {
                Some(text) => parse_windows(&text)?,
                None => Vec::new(),
            };
            Ok(Command::InsertException {
                exception: AvailabilityException {
                    id: parse_ulid(&values[0])?,
                    tutor_id: parse_ulid(&values[1])?,
                    date: parse_date(&values[2])?,
                    is_available: parse_bool(&values[3])?,
                    windows,
                },
            })
        }
        "vacations" => {
            arity("vacations", 4)?;
            Ok(Command::InsertVacation {
                vacation: Vacation {
                    id: parse_ulid(&values[0])?,
                    tutor_id: parse_ulid(&values[1])?,
                    start_date: parse_date(&values[2])?,
                    end_date: parse_date(&values[3])?,
                },
            })
        }
        "holds" => {
            arity("holds", 5)?;
            Ok(Command::InsertHold {
                id: parse_ulid(&values[0])?,
                tutor_id: parse_ulid(&values[1])?,
                consumer_id: parse_ulid(&values[2])?,
                start: parse_instant(&values[3])?,
                duration_minutes: parse_u32(&values[4])?,
            })
        }
        "bookings" => {
            arity("bookings", 4)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                hold_id: parse_ulid(&values[1])?,
                consumer_id: parse_ulid(&values[2])?,
                student_id: parse_ulid(&values[3])?,
            })
        }
        "acknowledgements" | "cancellations" | "completions" => {
            arity("booking transition", 2)?;
            let booking_id = parse_ulid(&values[0])?;
            let actor = parse_ulid(&values[1])?;
            Ok(match table.as_str() {
                "acknowledgements" => Command::Acknowledge { booking_id, actor },
                "cancellations" => Command::Cancel { booking_id, actor },
                _ => Command::Complete { booking_id, actor },
            })
        }
        "no_shows" => {
            arity("no_shows", 3)?;
            let absent = parse_string(&values[2])?;
            Ok(Command::ReportNoShow {
                booking_id: parse_ulid(&values[0])?,
                actor: parse_ulid(&values[1])?,
                absent: Party::parse(&absent)
                    .ok_or_else(|| SqlError::Parse(format!("unknown party: {absent}")))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `(id, timezone, base_price, currency[, notice_h, late_fee_pct, no_show_fee_pct, bookable])`
fn parse_profile(values: &[Expr]) -> Result<TutorProfile, SqlError> {
    let percent = |i| -> Result<u8, SqlError> {
        let v = optional(values, i, parse_u32)?.unwrap_or(0);
        u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is not a percentage")))
    };
    Ok(TutorProfile {
        id: parse_ulid(&values[0])?,
        timezone: parse_string(&values[1])?,
        base_price: Money {
            amount_minor: parse_i64(&values[2])?,
            currency: parse_string(&values[3])?,
        },
        policy: BookingPolicy {
            cancellation_notice_hours: optional(values, 4, parse_u32)?.unwrap_or(0),
            late_cancel_fee_percent: percent(5)?,
            no_show_fee_percent: percent(6)?,
        },
        bookable: optional(values, 7, parse_bool)?.unwrap_or(true),
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "rules" => Ok(Command::DeleteRule { id }),
        "exceptions" => Ok(Command::DeleteException { id }),
        "vacations" => Ok(Command::DeleteVacation { id }),
        "holds" => Ok(Command::DeleteHold { id }),
        "bookings" => Err(SqlError::Unsupported(
            "bookings are never deleted; insert into cancellations".into(),
        )),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters);
    }
    let tutor_id = || -> Result<Ulid, SqlError> {
        filter(&filters, "tutor_id", BinaryOperator::Eq)
            .ok_or(SqlError::MissingFilter("tutor_id"))
            .and_then(parse_ulid)
    };

    match table.as_str() {
        "tutors" => Ok(Command::SelectTutors),
        "rules" => Ok(Command::SelectRules { tutor_id: tutor_id()? }),
        "exceptions" => Ok(Command::SelectExceptions { tutor_id: tutor_id()? }),
        "vacations" => Ok(Command::SelectVacations { tutor_id: tutor_id()? }),
        "holds" => Ok(Command::SelectHolds { tutor_id: tutor_id()? }),
        "bookings" => match filter(&filters, "id", BinaryOperator::Eq) {
            Some(id) => Ok(Command::SelectBooking { id: parse_ulid(id)? }),
            None => Ok(Command::SelectBookings { tutor_id: tutor_id()? }),
        },
        "slots" => {
            let on_date = filter(&filters, "date", BinaryOperator::Eq);
            let from = filter(&filters, "date", BinaryOperator::GtEq)
                .or(on_date)
                .ok_or(SqlError::MissingFilter("date >="))?;
            let to = filter(&filters, "date", BinaryOperator::LtEq)
                .or(on_date)
                .ok_or(SqlError::MissingFilter("date <="))?;
            let duration = filter(&filters, "duration", BinaryOperator::Eq)
                .ok_or(SqlError::MissingFilter("duration"))?;
            Ok(Command::SelectSlots {
                tutor_id: tutor_id()?,
                from: parse_date(from)?,
                to: parse_date(to)?,
                duration_minutes: parse_u32(duration)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten an AND-tree of `column <op> value` comparisons.
fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, BinaryOperator, &'a Expr)>) {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out);
            collect_filters(right, out);
        }
        Expr::BinaryOp { left, op, right } => {
            if let Some(col) = expr_column_name(left) {
                out.push((col, op.clone(), right.as_ref()));
            }
        }
        _ => {}
    }
}

fn filter<'a>(
    filters: &[(String, BinaryOperator, &'a Expr)],
    column: &str,
    op: BinaryOperator,
) -> Option<&'a Expr> {
    filters
        .iter()
        .find(|(c, o, _)| c == column && *o == op)
        .map(|(_, _, e)| *e)
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
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Column `i` if present and not NULL.
fn optional<T>(
    values: &[Expr],
    i: usize,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    match values.get(i) {
        Some(expr) if !is_null(expr) => parse(expr).map(Some),
        _ => Ok(None),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// `'YYYY-MM-DD'`
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s.trim(), "%H:%M:%S"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

/// Unix milliseconds as a number, or an RFC 3339 timestamp string.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Ok(ms) = parse_i64(expr) {
        return Ok(ms);
    }
    let s = parse_string(expr)?;
    DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")))
}

fn parse_window_bounds(start: &Expr, end: &Expr) -> Result<LocalWindow, SqlError> {
    LocalWindow::new(parse_time(start)?, parse_time(end)?)
        .ok_or_else(|| SqlError::Parse("window ends before it starts".into()))
}

/// `'09:00-12:00,14:00-16:00'`. Empty text means no windows.
fn parse_windows(text: &str) -> Result<Vec<LocalWindow>, SqlError> {
    text.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            LocalWindow::parse(part).ok_or_else(|| SqlError::Parse(format!("bad window: {part}")))
        })
        .collect()
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
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
