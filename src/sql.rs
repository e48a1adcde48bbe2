use chrono::NaiveDate;
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
    RequestBooking {
        request: BookingRequest,
    },
    Reschedule {
        id: Ulid,
        slot: SlotDateTime,
    },
    Confirm {
        id: Ulid,
    },
    Cancel {
        id: Ulid,
    },
    Complete {
        id: Ulid,
    },
    Amend {
        id: Ulid,
        amendment: Amendment,
    },
    RemoveReservation {
        id: Ulid,
    },
    SelectReservations {
        id: Option<Ulid>,
        filter: ReservationFilter,
    },
    SelectAvailableSlots {
        property_id: PropertyId,
        date: NaiveDate,
    },
    SelectUpcoming {
        days: Option<u32>,
        owner_id: Option<ActorId>,
    },
    SelectStatistics {
        owner_id: Option<ActorId>,
    },
    AddBlackout {
        date: NaiveDate,
        slot: Option<Slot>,
        reason: Option<String>,
    },
    RemoveBlackout {
        date: NaiveDate,
        slot: Option<Slot>,
    },
    SelectBlackouts,
}

impl Command {
    /// Commands that change state on behalf of staff. Public connections
    /// may only request bookings and read availability or blackouts.
    pub fn requires_actor(&self) -> bool {
        !matches!(
            self,
            Command::RequestBooking { .. } | Command::SelectAvailableSlots { .. } | Command::SelectBlackouts
        )
    }
}

const RESERVATION_COLUMNS: &[&str] = &[
    "property_id",
    "date",
    "slot",
    "client_name",
    "client_email",
    "client_phone",
    "kind",
    "notes",
];
const RESCHEDULE_COLUMNS: &[&str] = &["reservation_id", "date", "slot"];
const TRANSITION_COLUMNS: &[&str] = &["reservation_id"];
const AMENDMENT_COLUMNS: &[&str] = &[
    "reservation_id",
    "client_name",
    "client_email",
    "client_phone",
    "kind",
    "notes",
];
const BLACKOUT_COLUMNS: &[&str] = &["date", "slot", "reason"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    match stmts.as_slice() {
        [] => Err(SqlError::Empty),
        [Statement::Insert(insert)] => parse_insert(insert),
        [Statement::Delete(delete)] => parse_delete(delete),
        [Statement::Query(query)] => parse_select(query),
        [other] => Err(SqlError::Unsupported(format!("{other}"))),
        _ => Err(SqlError::Unsupported("multiple statements".into())),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "reservations" => {
            let row = InsertRow::new(insert, "reservations", RESERVATION_COLUMNS)?;
            let request = BookingRequest {
                property_id: parse_text(row.require("property_id")?)?,
                slot: SlotDateTime::new(parse_date(row.require("date")?)?, parse_slot(row.require("slot")?)?),
                client: ClientInfo {
                    name: parse_text(row.require("client_name")?)?,
                    email: parse_text(row.require("client_email")?)?,
                    phone: parse_text(row.require("client_phone")?)?,
                },
                kind: parse_kind(row.require("kind")?)?,
                notes: row.get("notes").map(parse_text_or_null).transpose()?.flatten(),
            };
            Ok(Command::RequestBooking { request })
        }
        "reschedules" => {
            let row = InsertRow::new(insert, "reschedules", RESCHEDULE_COLUMNS)?;
            Ok(Command::Reschedule {
                id: parse_ulid(row.require("reservation_id")?)?,
                slot: SlotDateTime::new(parse_date(row.require("date")?)?, parse_slot(row.require("slot")?)?),
            })
        }
        "confirmations" => {
            let row = InsertRow::new(insert, "confirmations", TRANSITION_COLUMNS)?;
            Ok(Command::Confirm {
                id: parse_ulid(row.require("reservation_id")?)?,
            })
        }
        "cancellations" => {
            let row = InsertRow::new(insert, "cancellations", TRANSITION_COLUMNS)?;
            Ok(Command::Cancel {
                id: parse_ulid(row.require("reservation_id")?)?,
            })
        }
        "completions" => {
            let row = InsertRow::new(insert, "completions", TRANSITION_COLUMNS)?;
            Ok(Command::Complete {
                id: parse_ulid(row.require("reservation_id")?)?,
            })
        }
        "amendments" => {
            let row = InsertRow::new(insert, "amendments", AMENDMENT_COLUMNS)?;
            let text = |col| row.get(col).map(parse_text_or_null).transpose().map(Option::flatten);
            let amendment = Amendment {
                client_name: text("client_name")?,
                client_email: text("client_email")?,
                client_phone: text("client_phone")?,
                kind: text("kind")?
                    .map(|k| k.parse::<VisitKind>().map_err(SqlError::Parse))
                    .transpose()?,
                notes: text("notes")?,
            };
            Ok(Command::Amend {
                id: parse_ulid(row.require("reservation_id")?)?,
                amendment,
            })
        }
        "blackouts" => {
            let row = InsertRow::new(insert, "blackouts", BLACKOUT_COLUMNS)?;
            Ok(Command::AddBlackout {
                date: parse_date(row.require("date")?)?,
                slot: row.get("slot").map(parse_slot_or_null).transpose()?.flatten(),
                reason: row.get("reason").map(parse_text_or_null).transpose()?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let predicates = where_predicates(delete.selection.as_ref())?;

    match table.as_str() {
        "reservations" => {
            let mut id = None;
            for (col, op, value) in predicates {
                match (col.as_str(), &op) {
                    ("id", BinaryOperator::Eq) => id = Some(parse_ulid(value)?),
                    _ => return Err(unsupported_filter(&col, &op)),
                }
            }
            Ok(Command::RemoveReservation {
                id: id.ok_or(SqlError::MissingFilter("id"))?,
            })
        }
        "blackouts" => {
            let (mut date, mut slot) = (None, None);
            for (col, op, value) in predicates {
                match (col.as_str(), &op) {
                    ("date", BinaryOperator::Eq) => date = Some(parse_date(value)?),
                    ("slot", BinaryOperator::Eq) => slot = parse_slot_or_null(value)?,
                    _ => return Err(unsupported_filter(&col, &op)),
                }
            }
            Ok(Command::RemoveBlackout {
                date: date.ok_or(SqlError::MissingFilter("date"))?,
                slot,
            })
        }
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
    let predicates = where_predicates(select.selection.as_ref())?;

    match table.as_str() {
        "reservations" => {
            let mut id = None;
            let mut filter = ReservationFilter::default();
            for (col, op, value) in predicates {
                match (col.as_str(), &op) {
                    ("id", BinaryOperator::Eq) => id = Some(parse_ulid(value)?),
                    ("status", BinaryOperator::Eq) => {
                        filter.status = Some(parse_text(value)?.parse().map_err(SqlError::Parse)?)
                    }
                    ("kind", BinaryOperator::Eq) => filter.kind = Some(parse_kind(value)?),
                    ("property_id", BinaryOperator::Eq) => filter.property_id = Some(parse_text(value)?),
                    ("owner_id", BinaryOperator::Eq) => filter.owner_id = Some(parse_text(value)?),
                    ("date", BinaryOperator::Eq) => {
                        let date = parse_date(value)?;
                        filter.from = Some(date);
                        filter.to = Some(date);
                    }
                    ("date", BinaryOperator::GtEq) => filter.from = Some(parse_date(value)?),
                    ("date", BinaryOperator::LtEq) => filter.to = Some(parse_date(value)?),
                    _ => return Err(unsupported_filter(&col, &op)),
                }
            }
            Ok(Command::SelectReservations { id, filter })
        }
        "available_slots" => {
            let (mut property_id, mut date) = (None, None);
            for (col, op, value) in predicates {
                match (col.as_str(), &op) {
                    ("property_id", BinaryOperator::Eq) => property_id = Some(parse_text(value)?),
                    ("date", BinaryOperator::Eq) => date = Some(parse_date(value)?),
                    _ => return Err(unsupported_filter(&col, &op)),
                }
            }
            Ok(Command::SelectAvailableSlots {
                property_id: property_id.ok_or(SqlError::MissingFilter("property_id"))?,
                date: date.ok_or(SqlError::MissingFilter("date"))?,
            })
        }
        "upcoming_reservations" => {
            let (mut days, mut owner_id) = (None, None);
            for (col, op, value) in predicates {
                match (col.as_str(), &op) {
                    ("days", BinaryOperator::Eq) => days = Some(parse_u32(value)?),
                    ("owner_id", BinaryOperator::Eq) => owner_id = Some(parse_text(value)?),
                    _ => return Err(unsupported_filter(&col, &op)),
                }
            }
            Ok(Command::SelectUpcoming { days, owner_id })
        }
        "statistics" => {
            let mut owner_id = None;
            for (col, op, value) in predicates {
                match (col.as_str(), &op) {
                    ("owner_id", BinaryOperator::Eq) => owner_id = Some(parse_text(value)?),
                    _ => return Err(unsupported_filter(&col, &op)),
                }
            }
            Ok(Command::SelectStatistics { owner_id })
        }
        "blackouts" => match predicates.first() {
            None => Ok(Command::SelectBlackouts),
            Some((col, op, _)) => Err(unsupported_filter(col, op)),
        },
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten a WHERE clause of `column <op> value` terms joined by AND.
fn where_predicates(selection: Option<&Expr>) -> Result<Vec<(String, BinaryOperator, &Expr)>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_predicates(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_predicates<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
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
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            out.push((col, op.clone(), right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("predicate {other}"))),
    }
}

fn unsupported_filter(col: &str, op: &BinaryOperator) -> SqlError {
    SqlError::Unsupported(format!("filter {col} {op}"))
}

/// One VALUES row keyed by column name. Without an explicit column list
/// the table's columns are taken positionally.
struct InsertRow {
    cells: Vec<(String, Expr)>,
}

impl InsertRow {
    fn new(insert: &ast::Insert, table: &'static str, known: &[&str]) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            known.iter().take(values.len()).map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        if let Some(unknown) = columns.iter().find(|c| !known.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(table, unknown.clone()));
        }
        Ok(Self {
            cells: columns.into_iter().zip(values).collect(),
        })
    }

    fn get(&self, col: &str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn require(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(col))
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
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    parse_text_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID '{s}': {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| SqlError::Parse(format!("bad date '{s}': expected YYYY-MM-DD")))
}

fn parse_slot(expr: &Expr) -> Result<Slot, SqlError> {
    parse_slot_or_null(expr)?.ok_or_else(|| SqlError::Parse("slot must not be NULL".into()))
}

fn parse_slot_or_null(expr: &Expr) -> Result<Option<Slot>, SqlError> {
    parse_text_or_null(expr)?
        .map(|s| s.parse::<Slot>().map_err(|e| SqlError::Parse(e.to_string())))
        .transpose()
}

fn parse_kind(expr: &Expr) -> Result<VisitKind, SqlError> {
    parse_text(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer '{s}': {e}"))),
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

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: {expected} columns but {got} values")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
