use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser(NewUser),
    SelectUsers,
    SelectSessionTypes,
    InsertTrainingElement(NewTrainingElement),
    SelectTrainingElements { id: Option<Id> },
    UpdateTrainingElement { id: Id, patch: TrainingElementPatch },
    DeleteTrainingElement { id: Id },
    InsertBooking(NewBooking),
    SelectBookings(BookingFilter),
    UpdateBooking { id: Id, patch: BookingPatch },
    DeleteBooking { id: Id },
    SelectConflicts {
        start: Ms,
        end: Ms,
        instructor_id: Option<Id>,
        student_id: Option<Id>,
        exclude_id: Option<Id>,
    },
}

/// The virtual tables clients can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Users,
    SessionTypes,
    TrainingElements,
    Bookings,
    Conflicts,
}

impl Table {
    fn from_name(name: String) -> Result<Self, SqlError> {
        match name.as_str() {
            "users" => Ok(Table::Users),
            "session_types" => Ok(Table::SessionTypes),
            "training_elements" => Ok(Table::TrainingElements),
            "bookings" => Ok(Table::Bookings),
            "conflicts" => Ok(Table::Conflicts),
            _ => Err(SqlError::UnknownTable(name)),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::SessionTypes => "session_types",
            Table::TrainingElements => "training_elements",
            Table::Bookings => "bookings",
            Table::Conflicts => "conflicts",
        }
    }

    /// Column order for INSERTs without a column list.
    fn insert_columns(self) -> &'static [&'static str] {
        match self {
            Table::Users => &["email", "first_name", "last_name", "role"],
            Table::TrainingElements => &["name", "description", "duration_minutes", "session_type", "material_link"],
            Table::Bookings => &[
                "training_element_id",
                "instructor_id",
                "student_id",
                "start_time",
                "end_time",
                "status",
                "notes",
            ],
            Table::SessionTypes | Table::Conflicts => &[],
        }
    }
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
        Statement::Update { table, assignments, selection, .. } => {
            parse_update(&table.relation, assignments, selection.as_ref())
        }
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = Table::from_name(insert_table_name(insert)?)?;
    let row = insert_row(table, insert)?;

    match table {
        Table::Users => {
            let mut user = NewUser::default();
            let mut email = None;
            for (column, expr) in &row {
                match column.as_str() {
                    "email" => email = parse_text_or_null(expr)?,
                    "first_name" => user.first_name = parse_text_or_null(expr)?,
                    "last_name" => user.last_name = parse_text_or_null(expr)?,
                    "role" => user.role = parse_enum_or_null(expr)?,
                    _ => return Err(unknown_column(table, column)),
                }
            }
            user.email = email.ok_or(SqlError::MissingColumn("email"))?;
            Ok(Command::InsertUser(user))
        }
        Table::TrainingElements => {
            let mut element = NewTrainingElement::default();
            for (column, expr) in &row {
                match column.as_str() {
                    "name" => element.name = parse_text_or_null(expr)?,
                    "description" => element.description = parse_text_or_null(expr)?,
                    "duration_minutes" => element.duration_minutes = parse_i64_or_null(expr)?,
                    "session_type" => element.session_type = parse_enum_or_null(expr)?,
                    "material_link" => element.material_link = parse_text_or_null(expr)?,
                    _ => return Err(unknown_column(table, column)),
                }
            }
            Ok(Command::InsertTrainingElement(element))
        }
        Table::Bookings => {
            let mut booking = NewBooking::default();
            for (column, expr) in &row {
                match column.as_str() {
                    "training_element_id" => booking.training_element_id = parse_i64_or_null(expr)?,
                    "instructor_id" => booking.instructor_id = parse_i64_or_null(expr)?,
                    "student_id" => booking.student_id = parse_i64_or_null(expr)?,
                    "start_time" => booking.start_time = parse_time_or_null(expr)?,
                    "end_time" => booking.end_time = parse_time_or_null(expr)?,
                    "status" => booking.status = parse_enum_or_null(expr)?,
                    "notes" => booking.notes = parse_text_or_null(expr)?,
                    _ => return Err(unknown_column(table, column)),
                }
            }
            Ok(Command::InsertBooking(booking))
        }
        Table::SessionTypes | Table::Conflicts => {
            Err(SqlError::Unsupported(format!("INSERT into {}", table.name())))
        }
    }
}

/// Pair each value with its column, by the explicit column list when there
/// is one, otherwise by the table's column order.
fn insert_row(table: Table, insert: &ast::Insert) -> Result<Vec<(String, Expr)>, SqlError> {
    let mut rows = extract_all_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let values = rows.remove(0);

    if insert.columns.is_empty() {
        let columns = table.insert_columns();
        if values.len() > columns.len() {
            return Err(SqlError::WrongArity(table.name(), columns.len(), values.len()));
        }
        Ok(columns.iter().map(|c| c.to_string()).zip(values).collect())
    } else {
        if values.len() != insert.columns.len() {
            return Err(SqlError::WrongArity(table.name(), insert.columns.len(), values.len()));
        }
        let columns = insert.columns.iter().map(|ident| ident.value.to_lowercase());
        Ok(columns.zip(values).collect())
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = Table::from_name(table_factor_name(relation)?)?;
    let id = extract_where_id(selection)?;
    if assignments.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }
    let mut pairs = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        pairs.push((column, &assignment.value));
    }

    match table {
        Table::TrainingElements => {
            let mut patch = TrainingElementPatch::default();
            for (column, expr) in pairs {
                match column.as_str() {
                    "name" => patch.name = Some(parse_text_required(expr, "name")?),
                    "description" => patch.description = Some(parse_text_required(expr, "description")?),
                    "duration_minutes" => patch.duration_minutes = Some(parse_i64_expr(expr)?),
                    "session_type" => patch.session_type = Some(parse_enum_expr(expr)?),
                    "material_link" => patch.material_link = Some(parse_text_or_null(expr)?),
                    _ => return Err(unknown_column(table, &column)),
                }
            }
            Ok(Command::UpdateTrainingElement { id, patch })
        }
        Table::Bookings => {
            let mut patch = BookingPatch::default();
            for (column, expr) in pairs {
                match column.as_str() {
                    "training_element_id" => patch.training_element_id = Some(parse_i64_expr(expr)?),
                    "instructor_id" => patch.instructor_id = Some(parse_i64_or_null(expr)?),
                    "student_id" => patch.student_id = Some(parse_i64_or_null(expr)?),
                    "start_time" => patch.start_time = Some(parse_time_expr(expr)?),
                    "end_time" => patch.end_time = Some(parse_time_expr(expr)?),
                    "status" => patch.status = Some(parse_enum_expr(expr)?),
                    "notes" => patch.notes = Some(parse_text_or_null(expr)?),
                    _ => return Err(unknown_column(table, &column)),
                }
            }
            Ok(Command::UpdateBooking { id, patch })
        }
        _ => Err(SqlError::Unsupported(format!("UPDATE {}", table.name()))),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = Table::from_name(delete_table_name(delete)?)?;
    let id = extract_where_id(delete.selection.as_ref())?;

    match table {
        Table::TrainingElements => Ok(Command::DeleteTrainingElement { id }),
        Table::Bookings => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::Unsupported(format!("DELETE from {}", table.name()))),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// One `column <op> value` term of a WHERE clause.
struct Filter<'a> {
    column: String,
    op: FilterOp,
    value: &'a Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOp {
    Eq,
    GtEq,
    LtEq,
    Like,
}

/// Flatten an AND-only WHERE clause into its terms.
fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::Eq => FilterOp::Eq,
                ast::BinaryOperator::GtEq => FilterOp::GtEq,
                ast::BinaryOperator::LtEq => FilterOp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left).ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push(Filter { column, op, value: right });
            Ok(())
        }
        Expr::Like { negated: false, expr, pattern, .. } | Expr::ILike { negated: false, expr, pattern, .. } => {
            let column = expr_column_name(expr).ok_or_else(|| SqlError::Parse(format!("expected column, got {expr}")))?;
            out.push(Filter { column, op: FilterOp::Like, value: pattern });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE clause {other}"))),
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
    let table = Table::from_name(table_factor_name(&select.from[0].relation)?)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table {
        Table::Users | Table::SessionTypes => {
            if let Some(f) = filters.first() {
                return Err(unknown_filter(table, f));
            }
            Ok(if table == Table::Users { Command::SelectUsers } else { Command::SelectSessionTypes })
        }
        Table::TrainingElements => {
            let mut id = None;
            for f in &filters {
                match (f.column.as_str(), f.op) {
                    ("id", FilterOp::Eq) => id = Some(parse_i64_expr(f.value)?),
                    _ => return Err(unknown_filter(table, f)),
                }
            }
            Ok(Command::SelectTrainingElements { id })
        }
        Table::Bookings => {
            let mut filter = BookingFilter::default();
            for f in &filters {
                match (f.column.as_str(), f.op) {
                    ("id", FilterOp::Eq) => filter.id = Some(parse_i64_expr(f.value)?),
                    ("training_element_name", FilterOp::Eq | FilterOp::Like) => {
                        filter.training_element_name = Some(parse_name_pattern(f.value)?)
                    }
                    ("start_time", FilterOp::GtEq) => filter.start_from = Some(parse_time_expr(f.value)?),
                    ("end_time", FilterOp::LtEq) => filter.end_until = Some(parse_time_expr(f.value)?),
                    ("instructor_id", FilterOp::Eq) => filter.instructor_id = Some(parse_i64_expr(f.value)?),
                    ("instructor_name", FilterOp::Eq | FilterOp::Like) => {
                        filter.instructor_name = Some(parse_name_pattern(f.value)?)
                    }
                    ("student_id", FilterOp::Eq) => filter.student_id = Some(parse_i64_expr(f.value)?),
                    ("student_name", FilterOp::Eq | FilterOp::Like) => {
                        filter.student_name = Some(parse_name_pattern(f.value)?)
                    }
                    ("status", FilterOp::Eq) => filter.status = Some(parse_enum_expr(f.value)?),
                    ("created_by_user_id", FilterOp::Eq) => {
                        filter.created_by_user_id = Some(parse_i64_expr(f.value)?)
                    }
                    ("created_by_name", FilterOp::Eq | FilterOp::Like) => {
                        filter.created_by_name = Some(parse_name_pattern(f.value)?)
                    }
                    _ => return Err(unknown_filter(table, f)),
                }
            }
            Ok(Command::SelectBookings(filter))
        }
        Table::Conflicts => {
            let (mut start, mut end, mut instructor_id, mut student_id, mut exclude_id) = (None, None, None, None, None);
            for f in &filters {
                match (f.column.as_str(), f.op) {
                    ("start_time", FilterOp::Eq) => start = Some(parse_time_expr(f.value)?),
                    ("end_time", FilterOp::Eq) => end = Some(parse_time_expr(f.value)?),
                    ("instructor_id", FilterOp::Eq) => instructor_id = parse_i64_or_null(f.value)?,
                    ("student_id", FilterOp::Eq) => student_id = parse_i64_or_null(f.value)?,
                    ("exclude_id", FilterOp::Eq) => exclude_id = parse_i64_or_null(f.value)?,
                    _ => return Err(unknown_filter(table, f)),
                }
            }
            Ok(Command::SelectConflicts {
                start: start.ok_or(SqlError::MissingFilter("start_time"))?,
                end: end.ok_or(SqlError::MissingFilter("end_time"))?,
                instructor_id,
                student_id,
                exclude_id,
            })
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn unknown_column(table: Table, column: &str) -> SqlError {
    SqlError::UnknownColumn { table: table.name(), column: column.to_string() }
}

fn unknown_filter(table: Table, f: &Filter<'_>) -> SqlError {
    SqlError::Unsupported(format!("filter {:?} on {}.{}", f.op, table.name(), f.column))
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: Option<&Expr>) -> Result<Id, SqlError> {
    let sel = selection.ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_i64_expr(right),
        Expr::Nested(inner) => extract_where_id(Some(inner)),
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

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
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

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_i64_expr(expr).map(Some) }
}

/// Integer milliseconds, or an ISO 8601 string.
fn parse_time_expr(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => parse_timestamp(s).ok_or_else(|| {
            SqlError::InvalidValue(format!(
                "invalid datetime '{s}', use ISO 8601 (e.g. '2025-06-15T10:00:00Z') or epoch milliseconds"
            ))
        }),
        _ => parse_i64_expr(expr),
    }
}

fn parse_time_or_null(expr: &Expr) -> Result<Option<Ms>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_time_expr(expr).map(Some) }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n, _)) => Ok(Some(n.clone())),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_text_required(expr: &Expr, column: &'static str) -> Result<String, SqlError> {
    parse_text_or_null(expr)?.ok_or(SqlError::InvalidValue(format!("{column} cannot be NULL")))
}

fn parse_enum_expr<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: std::str::FromStr<Err = ParseEnumError>,
{
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => s.parse().map_err(|e: ParseEnumError| SqlError::InvalidValue(e.to_string())),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_enum_or_null<T>(expr: &Expr) -> Result<Option<T>, SqlError>
where
    T: std::str::FromStr<Err = ParseEnumError>,
{
    if is_null(expr) { Ok(None) } else { parse_enum_expr(expr).map(Some) }
}

/// `'%doe%'` → `doe`. Name filters always match substrings.
fn parse_name_pattern(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.trim_matches('%').to_string()),
        _ => Err(SqlError::Parse(format!("expected string pattern, got {expr}"))),
    }
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
    #[error("{table}: unknown column {column}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value the column cannot hold.
    #[error("{0}")]
    InvalidValue(String),
}
