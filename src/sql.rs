use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, NaiveDate};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::Ms;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertService {
        id: Ulid,
        provider_id: Ulid,
        name: String,
        duration_minutes: u32,
        price_cents: i64,
    },
    SelectServices {
        provider_id: Ulid,
    },
    RequestBooking {
        customer_id: Ulid,
        provider_id: Ulid,
        service_id: Ulid,
        start: DateTime<FixedOffset>,
    },
    CancelAppointment {
        id: Ulid,
    },
    ClearCancelled {
        provider_id: Ulid,
    },
    ClearCustomerCancelled {
        customer_id: Ulid,
    },
    SelectAvailability {
        provider_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectServiceAvailability {
        provider_id: Ulid,
        service_id: Ulid,
        start: DateTime<FixedOffset>,
    },
    SelectAppointments {
        filter: AppointmentFilter,
    },
    SelectWaitingList {
        provider_id: Ulid,
    },
    RemoveWaitingEntry {
        id: Ulid,
    },
    PurgeWaitingList {
        provider_id: Ulid,
        before: NaiveDate,
    },
    InsertNotification {
        user_id: Ulid,
        message: String,
    },
    SelectNotifications {
        user_id: Ulid,
    },
    SelectUnreadCount {
        user_id: Ulid,
    },
    MarkRead {
        notification_id: Ulid,
    },
    MarkAllRead {
        user_id: Ulid,
    },
    ClearReadNotifications {
        user_id: Ulid,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentFilter {
    Id(Ulid),
    Provider(Ulid),
    Customer(Ulid),
}

/// Columns a statement returns, known before any parameter is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    None,
    Booking,
    Cancellation,
    Availability,
    Services,
    Appointments,
    WaitingList,
    Notifications,
    UnreadCount,
}

impl Command {
    pub fn row_shape(&self) -> RowShape {
        match self {
            Command::RequestBooking { .. } => RowShape::Booking,
            Command::CancelAppointment { .. } => RowShape::Cancellation,
            Command::SelectAvailability { .. } | Command::SelectServiceAvailability { .. } => {
                RowShape::Availability
            }
            Command::SelectServices { .. } => RowShape::Services,
            Command::SelectAppointments { .. } => RowShape::Appointments,
            Command::SelectWaitingList { .. } => RowShape::WaitingList,
            Command::SelectNotifications { .. } => RowShape::Notifications,
            Command::SelectUnreadCount { .. } => RowShape::UnreadCount,
            _ => RowShape::None,
        }
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    match parse_statement(sql)? {
        Parsed::Insert { table, row } => insert_command(&table, &row),
        Parsed::Delete { table, filters } => delete_command(&table, &filters),
        Parsed::Select { table, filters } => select_command(&table, &filters),
    }
}

/// Result columns of a possibly parameterized statement (`$1` placeholders allowed).
/// Unparseable input has no rows; the real error surfaces at execution.
pub fn row_shape(sql: &str) -> RowShape {
    let Ok(parsed) = parse_statement(sql) else {
        return RowShape::None;
    };
    match parsed {
        Parsed::Insert { table, .. } if table == "appointments" => RowShape::Booking,
        Parsed::Delete { table, filters } if table == "appointments" && filters.has("id") => {
            RowShape::Cancellation
        }
        Parsed::Select { table, .. } => match table.as_str() {
            "availability" => RowShape::Availability,
            "services" => RowShape::Services,
            "appointments" => RowShape::Appointments,
            "waiting_list" => RowShape::WaitingList,
            "notifications" => RowShape::Notifications,
            "unread_count" => RowShape::UnreadCount,
            _ => RowShape::None,
        },
        _ => RowShape::None,
    }
}

// ── Statement shape ───────────────────────────────────────────

enum Parsed {
    Insert { table: String, row: Row },
    Delete { table: String, filters: Filters },
    Select { table: String, filters: Filters },
}

fn parse_statement(sql: &str) -> Result<Parsed, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => {
            let table = insert_table_name(insert)?;
            let row = Row::from_insert(&table, insert)?;
            Ok(Parsed::Insert { table, row })
        }
        Statement::Delete(delete) => Ok(Parsed::Delete {
            table: delete_table_name(delete)?,
            filters: Filters::from_selection(delete.selection.as_ref())?,
        }),
        Statement::Query(query) => {
            let select = match query.body.as_ref() {
                SetExpr::Select(s) => s,
                _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
            };
            let first = select
                .from
                .first()
                .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
            Ok(Parsed::Select {
                table: table_factor_name(&first.relation)?,
                filters: Filters::from_selection(select.selection.as_ref())?,
            })
        }
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Default column order for `INSERT ... VALUES` without a column list.
fn default_columns(table: &str) -> &'static [&'static str] {
    match table {
        "services" => &["id", "provider_id", "name", "duration", "price"],
        "appointments" => &["customer_id", "provider_id", "service_id", "start_time"],
        "notifications" => &["user_id", "message"],
        "notification_reads" => &["notification_id"],
        _ => &[],
    }
}

/// One VALUES row keyed by column name.
struct Row(HashMap<String, Expr>);

impl Row {
    fn from_insert(table: &str, insert: &ast::Insert) -> Result<Self, SqlError> {
        let source = insert
            .source
            .as_ref()
            .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
        let values = match source.body.as_ref() {
            SetExpr::Values(values) => values,
            _ => return Err(SqlError::Parse("expected VALUES".into())),
        };
        let row = match values.rows.as_slice() {
            [row] => row,
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
        };

        let columns: Vec<String> = if insert.columns.is_empty() {
            default_columns(table).iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if columns.len() != row.len() {
            return Err(SqlError::WrongArity {
                expected: columns.len(),
                got: row.len(),
            });
        }
        Ok(Self(columns.into_iter().zip(row.iter().cloned()).collect()))
    }

    fn has(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    fn get(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.0.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

/// `col <op> value` terms of a WHERE clause made only of ANDs.
struct Filters(HashMap<String, (BinaryOperator, Expr)>);

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut terms = HashMap::new();
        if let Some(expr) = selection {
            collect_terms(expr, &mut terms)?;
        }
        Ok(Self(terms))
    }

    fn has(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    fn eq(&self, column: &'static str) -> Result<&Expr, SqlError> {
        match self.0.get(column) {
            Some((BinaryOperator::Eq, expr)) => Ok(expr),
            Some((op, _)) => Err(SqlError::Unsupported(format!("{column} {op}"))),
            None => Err(SqlError::MissingFilter(column)),
        }
    }

    fn lt(&self, column: &'static str) -> Result<&Expr, SqlError> {
        match self.0.get(column) {
            Some((BinaryOperator::Lt, expr)) => Ok(expr),
            Some((op, _)) => Err(SqlError::Unsupported(format!("{column} {op}"))),
            None => Err(SqlError::MissingFilter(column)),
        }
    }

    fn eq_ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.eq(column)?)
    }
}

fn collect_terms(expr: &Expr, terms: &mut HashMap<String, (BinaryOperator, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_terms(inner, terms),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_terms(left, terms)?;
            collect_terms(right, terms)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            terms.insert(column, (op.clone(), right.as_ref().clone()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Statement → Command ───────────────────────────────────────

fn insert_command(table: &str, row: &Row) -> Result<Command, SqlError> {
    match table {
        "services" => Ok(Command::InsertService {
            id: parse_ulid_expr(row.get("id")?)?,
            provider_id: parse_ulid_expr(row.get("provider_id")?)?,
            name: parse_string_expr(row.get("name")?)?,
            duration_minutes: parse_u32(row.get("duration")?)?,
            price_cents: parse_i64_expr(row.get("price")?)?,
        }),
        "appointments" => Ok(Command::RequestBooking {
            customer_id: parse_ulid_expr(row.get("customer_id")?)?,
            provider_id: parse_ulid_expr(row.get("provider_id")?)?,
            service_id: parse_ulid_expr(row.get("service_id")?)?,
            start: parse_datetime_expr(row.get("start_time")?)?,
        }),
        "notifications" => Ok(Command::InsertNotification {
            user_id: parse_ulid_expr(row.get("user_id")?)?,
            message: parse_string_expr(row.get("message")?)?,
        }),
        // A read receipt for one notification, or for a user's whole inbox.
        "notification_reads" if row.has("user_id") => Ok(Command::MarkAllRead {
            user_id: parse_ulid_expr(row.get("user_id")?)?,
        }),
        "notification_reads" => Ok(Command::MarkRead {
            notification_id: parse_ulid_expr(row.get("notification_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn delete_command(table: &str, filters: &Filters) -> Result<Command, SqlError> {
    match table {
        "appointments" if filters.has("id") => Ok(Command::CancelAppointment {
            id: filters.eq_ulid("id")?,
        }),
        "appointments" => {
            let status = parse_string_expr(filters.eq("status")?)?;
            if !status.eq_ignore_ascii_case("cancelled") {
                return Err(SqlError::Unsupported(format!("deleting {status} appointments")));
            }
            if filters.has("customer_id") {
                return Ok(Command::ClearCustomerCancelled {
                    customer_id: filters.eq_ulid("customer_id")?,
                });
            }
            Ok(Command::ClearCancelled {
                provider_id: filters.eq_ulid("provider_id")?,
            })
        }
        "waiting_list" if filters.has("id") => Ok(Command::RemoveWaitingEntry {
            id: filters.eq_ulid("id")?,
        }),
        "waiting_list" => Ok(Command::PurgeWaitingList {
            provider_id: filters.eq_ulid("provider_id")?,
            before: parse_date_expr(filters.lt("preferred_date")?)?,
        }),
        "notifications" => {
            if !parse_bool(filters.eq("is_read")?)? {
                return Err(SqlError::Unsupported("deleting unread notifications".into()));
            }
            Ok(Command::ClearReadNotifications {
                user_id: filters.eq_ulid("user_id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn select_command(table: &str, filters: &Filters) -> Result<Command, SqlError> {
    match table {
        "availability" if filters.has("service_id") => Ok(Command::SelectServiceAvailability {
            provider_id: filters.eq_ulid("provider_id")?,
            service_id: filters.eq_ulid("service_id")?,
            start: parse_datetime_expr(filters.eq("start_time")?)?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            provider_id: filters.eq_ulid("provider_id")?,
            start: parse_ms_expr(filters.eq("start_time")?)?,
            end: parse_ms_expr(filters.eq("end_time")?)?,
        }),
        "services" => Ok(Command::SelectServices {
            provider_id: filters.eq_ulid("provider_id")?,
        }),
        "appointments" => {
            let filter = if filters.has("id") {
                AppointmentFilter::Id(filters.eq_ulid("id")?)
            } else if filters.has("customer_id") {
                AppointmentFilter::Customer(filters.eq_ulid("customer_id")?)
            } else {
                AppointmentFilter::Provider(filters.eq_ulid("provider_id")?)
            };
            Ok(Command::SelectAppointments { filter })
        }
        "waiting_list" => Ok(Command::SelectWaitingList {
            provider_id: filters.eq_ulid("provider_id")?,
        }),
        "notifications" => Ok(Command::SelectNotifications {
            user_id: filters.eq_ulid("user_id")?,
        }),
        "unread_count" => Ok(Command::SelectUnreadCount {
            user_id: filters.eq_ulid("user_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table.to_string())),
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: UnaryOperator::Minus,
        expr,
    } = expr
    {
        let v = parse_i64_expr(expr)?;
        return v
            .checked_neg()
            .ok_or_else(|| SqlError::Parse(format!("-({v}) out of integer range")));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_datetime_expr(expr: &Expr) -> Result<DateTime<FixedOffset>, SqlError> {
    let s = parse_string_expr(expr)?;
    DateTime::parse_from_rfc3339(&s).map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")))
}

/// Unix milliseconds, given either as a number or as an RFC 3339 string.
fn parse_ms_expr(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) if s.parse::<i64>().is_err() => {
            Ok(parse_datetime_expr(expr)?.timestamp_millis())
        }
        _ => parse_i64_expr(expr),
    }
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
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
    #[error("expected {expected} values, got {got}")]
    WrongArity { expected: usize, got: usize },
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
