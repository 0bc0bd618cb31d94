use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertUnit {
        id: Ulid,
        name: Option<String>,
        nightly_rate: Amount,
        active: bool,
    },
    InsertOccupancy {
        id: Ulid,
        unit_id: Ulid,
        requester: String,
        check_in: NaiveDate,
        check_out: NaiveDate,
        state: OccupancyState,
    },
    /// `INSERT INTO occupancies (id, hold_id)`: promote a hold.
    ConsumeHold {
        occupancy_id: Ulid,
        hold_id: Ulid,
    },
    TransitionOccupancy {
        id: Ulid,
        state: OccupancyState,
    },
    CancelOccupancy {
        id: Ulid,
    },
    InsertHold {
        id: Ulid,
        unit_id: Ulid,
        requester: String,
        check_in: NaiveDate,
        check_out: NaiveDate,
        /// `None` means the tenant's default hold length.
        hold_minutes: Option<u32>,
    },
    DeleteHold {
        id: Ulid,
    },
    SelectUnits,
    SelectAvailability {
        unit_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        include_holds: bool,
    },
    SelectBulkAvailability {
        unit_ids: Vec<Ulid>,
        check_in: NaiveDate,
        check_out: NaiveDate,
        include_holds: bool,
    },
    SelectCalendar {
        unit_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    },
    SelectAvailablePeriods {
        unit_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        min_stay: u32,
    },
    SelectOccupancies {
        unit_id: Ulid,
        include_cancelled: bool,
    },
    SelectHolds {
        unit_id: Ulid,
    },
}

const UNIT_COLUMNS: &[&str] = &["id", "name", "nightly_rate", "active"];
const OCCUPANCY_COLUMNS: &[&str] = &["id", "unit_id", "requester", "check_in", "check_out", "state"];
const TRANSITION_COLUMNS: &[&str] = &["occupancy_id", "state"];
const HOLD_COLUMNS: &[&str] = &["id", "unit_id", "requester", "check_in", "check_out", "hold_minutes"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong);
    }
    let stmt = parse_single(sql)?;
    match &stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// The table a SELECT reads from, for describing result columns before the
/// statement's parameters are bound. `None` for anything that returns no rows.
pub fn result_table(sql: &str) -> Option<String> {
    let Ok(Statement::Query(query)) = parse_single(sql) else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    select
        .from
        .first()
        .and_then(|from| table_factor_name(&from.relation).ok())
}

fn parse_single(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    match stmts.len() {
        0 => Err(SqlError::Empty),
        1 => Ok(stmts.remove(0)),
        _ => Err(SqlError::Unsupported("multiple statements".into())),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "units" => {
            let row = InsertRow::new(insert, "units", UNIT_COLUMNS)?;
            Ok(Command::UpsertUnit {
                id: parse_ulid_expr(row.required("id")?)?,
                name: row.get("name").map(parse_string_or_null).transpose()?.flatten(),
                nightly_rate: parse_i64_expr(row.required("nightly_rate")?)?,
                active: row.get("active").map(parse_bool).transpose()?.unwrap_or(true),
            })
        }
        "occupancies" => {
            let row = InsertRow::new(insert, "occupancies", OCCUPANCY_COLUMNS)?;
            if let Some(hold_id) = row.get("hold_id") {
                return Ok(Command::ConsumeHold {
                    occupancy_id: parse_ulid_expr(row.required("id")?)?,
                    hold_id: parse_ulid_expr(hold_id)?,
                });
            }
            let state = match row.get("state") {
                Some(expr) => parse_state(expr)?,
                None => OccupancyState::Pending,
            };
            Ok(Command::InsertOccupancy {
                id: parse_ulid_expr(row.required("id")?)?,
                unit_id: parse_ulid_expr(row.required("unit_id")?)?,
                requester: parse_string(row.required("requester")?)?,
                check_in: parse_date_expr(row.required("check_in")?)?,
                check_out: parse_date_expr(row.required("check_out")?)?,
                state,
            })
        }
        "occupancy_transitions" => {
            let row = InsertRow::new(insert, "occupancy_transitions", TRANSITION_COLUMNS)?;
            Ok(Command::TransitionOccupancy {
                id: parse_ulid_expr(row.required("occupancy_id")?)?,
                state: parse_state(row.required("state")?)?,
            })
        }
        "holds" => {
            let row = InsertRow::new(insert, "holds", HOLD_COLUMNS)?;
            Ok(Command::InsertHold {
                id: parse_ulid_expr(row.required("id")?)?,
                unit_id: parse_ulid_expr(row.required("unit_id")?)?,
                requester: parse_string(row.required("requester")?)?,
                check_in: parse_date_expr(row.required("check_in")?)?,
                check_out: parse_date_expr(row.required("check_out")?)?,
                hold_minutes: row.get("hold_minutes").map(parse_u32_or_null).transpose()?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "occupancies" => Ok(Command::CancelOccupancy { id }),
        "holds" => Ok(Command::DeleteHold { id }),
        "units" => Err(SqlError::Unsupported("units are deactivated, not deleted".into())),
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

    let mut f = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut f)?;
    }

    match table.as_str() {
        "units" => Ok(Command::SelectUnits),
        "availability" => {
            let check_in = f.check_in.ok_or(SqlError::MissingFilter("check_in"))?;
            let check_out = f.check_out.ok_or(SqlError::MissingFilter("check_out"))?;
            let include_holds = f.include_holds.unwrap_or(true);
            match f.unit_ids.ok_or(SqlError::MissingFilter("unit_id"))? {
                UnitFilter::One(unit_id) => Ok(Command::SelectAvailability {
                    unit_id,
                    check_in,
                    check_out,
                    include_holds,
                }),
                UnitFilter::Many(unit_ids) => Ok(Command::SelectBulkAvailability {
                    unit_ids,
                    check_in,
                    check_out,
                    include_holds,
                }),
            }
        }
        "calendar" => Ok(Command::SelectCalendar {
            unit_id: f.single_unit()?,
            start: f.date_from.ok_or(SqlError::MissingFilter("date >="))?,
            end: f.date_to.ok_or(SqlError::MissingFilter("date <="))?,
        }),
        "available_periods" => Ok(Command::SelectAvailablePeriods {
            unit_id: f.single_unit()?,
            start: f.date_from.ok_or(SqlError::MissingFilter("date >="))?,
            end: f.date_to.ok_or(SqlError::MissingFilter("date <="))?,
            min_stay: f.min_stay.unwrap_or(1),
        }),
        "occupancies" => Ok(Command::SelectOccupancies {
            unit_id: f.single_unit()?,
            include_cancelled: f.include_cancelled.unwrap_or(false),
        }),
        "holds" => Ok(Command::SelectHolds {
            unit_id: f.single_unit()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Filters ───────────────────────────────────────────────────

#[derive(Debug)]
enum UnitFilter {
    One(Ulid),
    Many(Vec<Ulid>),
}

#[derive(Debug, Default)]
struct Filters {
    unit_ids: Option<UnitFilter>,
    check_in: Option<NaiveDate>,
    check_out: Option<NaiveDate>,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    include_holds: Option<bool>,
    include_cancelled: Option<bool>,
    min_stay: Option<u32>,
}

impl Filters {
    fn single_unit(&self) -> Result<Ulid, SqlError> {
        match &self.unit_ids {
            Some(UnitFilter::One(id)) => Ok(*id),
            Some(UnitFilter::Many(_)) => Err(SqlError::Unsupported("unit_id IN (...) on this table".into())),
            None => Err(SqlError::MissingFilter("unit_id")),
        }
    }
}

fn collect_filters(expr: &Expr, f: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, f),
        Expr::InList { expr, list, negated: false } => {
            if expr_column_name(expr).as_deref() != Some("unit_id") {
                return Err(SqlError::Unsupported("IN is only supported on unit_id".into()));
            }
            if list.len() > MAX_IN_CLAUSE_IDS {
                return Err(SqlError::Unsupported(format!("more than {MAX_IN_CLAUSE_IDS} ids in IN list")));
            }
            let ids = list.iter().map(parse_ulid_expr).collect::<Result<Vec<_>, _>>()?;
            f.unit_ids = Some(UnitFilter::Many(ids));
            Ok(())
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left);
            match (op, col.as_deref()) {
                (ast::BinaryOperator::And, _) => {
                    collect_filters(left, f)?;
                    collect_filters(right, f)
                }
                (ast::BinaryOperator::Eq, Some("unit_id")) => {
                    f.unit_ids = Some(UnitFilter::One(parse_ulid_expr(right)?));
                    Ok(())
                }
                (ast::BinaryOperator::Eq, Some("check_in")) => {
                    f.check_in = Some(parse_date_expr(right)?);
                    Ok(())
                }
                (ast::BinaryOperator::Eq, Some("check_out")) => {
                    f.check_out = Some(parse_date_expr(right)?);
                    Ok(())
                }
                (ast::BinaryOperator::Eq, Some("include_holds")) => {
                    f.include_holds = Some(parse_bool(right)?);
                    Ok(())
                }
                (ast::BinaryOperator::Eq, Some("include_cancelled")) => {
                    f.include_cancelled = Some(parse_bool(right)?);
                    Ok(())
                }
                (ast::BinaryOperator::Eq, Some("min_stay")) => {
                    f.min_stay = Some(parse_u32(right)?);
                    Ok(())
                }
                (ast::BinaryOperator::Eq, Some("date")) => {
                    let day = parse_date_expr(right)?;
                    f.date_from = Some(day);
                    f.date_to = Some(day);
                    Ok(())
                }
                (ast::BinaryOperator::GtEq, Some("date")) => {
                    f.date_from = Some(parse_date_expr(right)?);
                    Ok(())
                }
                (ast::BinaryOperator::LtEq, Some("date")) => {
                    f.date_to = Some(parse_date_expr(right)?);
                    Ok(())
                }
                (_, Some(col)) => Err(SqlError::Unsupported(format!("filter {col} {op}"))),
                (_, None) => Err(SqlError::Unsupported(format!("filter {expr}"))),
            }
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// One VALUES row keyed by column name. Without an explicit column list the
/// table's default column order applies.
struct InsertRow {
    table: &'static str,
    fields: Vec<(String, Expr)>,
}

impl InsertRow {
    fn new(insert: &ast::Insert, table: &'static str, defaults: &[&str]) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            if values.len() > defaults.len() {
                return Err(SqlError::WrongArity(table, defaults.len(), values.len()));
            }
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            if insert.columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
            }
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        Ok(Self {
            table,
            fields: columns.into_iter().zip(values).collect(),
        })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.fields.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

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
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
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
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected 'YYYY-MM-DD', got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_state(expr: &Expr) -> Result<OccupancyState, SqlError> {
    let s = parse_string(expr)?;
    OccupancyState::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown occupancy state: {s}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_i64_expr(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("integer out of range".into()))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_u32(expr).map(Some),
    }
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
            _ => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("query exceeds {} bytes", MAX_SQL_LEN)]
    TooLong,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
