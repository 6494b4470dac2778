use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::TrainingdAuthSource;
use crate::engine::{validate_span, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

// ── Result schemas ───────────────────────────────────────────────

type Columns = &'static [(&'static str, Type)];

const USER_COLUMNS: Columns = &[
    ("id", Type::INT8),
    ("email", Type::VARCHAR),
    ("first_name", Type::VARCHAR),
    ("last_name", Type::VARCHAR),
    ("role", Type::VARCHAR),
    ("created_at", Type::VARCHAR),
    ("updated_at", Type::VARCHAR),
];

const SESSION_TYPE_COLUMNS: Columns = &[("session_type", Type::VARCHAR)];

const ELEMENT_COLUMNS: Columns = &[
    ("id", Type::INT8),
    ("name", Type::VARCHAR),
    ("description", Type::VARCHAR),
    ("duration_minutes", Type::INT8),
    ("session_type", Type::VARCHAR),
    ("material_link", Type::VARCHAR),
    ("created_at", Type::VARCHAR),
    ("updated_at", Type::VARCHAR),
];

const BOOKING_COLUMNS: Columns = &[
    ("id", Type::INT8),
    ("training_element_id", Type::INT8),
    ("training_element_name", Type::VARCHAR),
    ("instructor_id", Type::INT8),
    ("instructor_name", Type::VARCHAR),
    ("student_id", Type::INT8),
    ("student_name", Type::VARCHAR),
    ("start_time", Type::VARCHAR),
    ("end_time", Type::VARCHAR),
    ("status", Type::VARCHAR),
    ("notes", Type::VARCHAR),
    ("created_by_user_id", Type::INT8),
    ("created_by_email", Type::VARCHAR),
    ("created_at", Type::VARCHAR),
    ("updated_at", Type::VARCHAR),
];

const CONFLICT_COLUMNS: Columns = &[
    ("id", Type::INT8),
    ("training_element_id", Type::INT8),
    ("instructor_id", Type::INT8),
    ("student_id", Type::INT8),
    ("start_time", Type::VARCHAR),
    ("end_time", Type::VARCHAR),
    ("status", Type::VARCHAR),
];

fn schema(columns: Columns, format: &Format) -> Arc<Vec<FieldInfo>> {
    let fields = columns
        .iter()
        .enumerate()
        .map(|(idx, (name, ty))| FieldInfo::new(name.to_string(), None, None, ty.clone(), format.format_for(idx)))
        .collect();
    Arc::new(fields)
}

/// Columns a statement will return, judged from the table after FROM or
/// INTO. Used to describe prepared statements before they run.
fn result_columns(sql: &str) -> Columns {
    let lower = sql.trim_start().to_lowercase();
    if !(lower.starts_with("select") || lower.starts_with("insert")) {
        return &[];
    }
    let mut words = lower.split_whitespace();
    let table = words
        .find(|w| *w == "from" || *w == "into")
        .and_then(|_| words.next())
        .map(|w| w.trim_matches(|c: char| !(c.is_ascii_alphanumeric() || c == '_')))
        .and_then(|w| w.split('(').next());
    match table {
        Some("users") => USER_COLUMNS,
        Some("session_types") => SESSION_TYPE_COLUMNS,
        Some("training_elements") => ELEMENT_COLUMNS,
        Some("bookings") => BOOKING_COLUMNS,
        Some("conflicts") if lower.starts_with("select") => CONFLICT_COLUMNS,
        _ => &[],
    }
}

fn rows_response<T>(
    schema: Arc<Vec<FieldInfo>>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_user(encoder: &mut DataRowEncoder, user: &User) -> PgWireResult<()> {
    encoder.encode_field(&user.id)?;
    encoder.encode_field(&user.email)?;
    encoder.encode_field(&user.first_name)?;
    encoder.encode_field(&user.last_name)?;
    encoder.encode_field(&user.role.as_str())?;
    encoder.encode_field(&format_timestamp(user.created_at))?;
    encoder.encode_field(&format_timestamp(user.updated_at))
}

fn encode_element(encoder: &mut DataRowEncoder, element: &TrainingElement) -> PgWireResult<()> {
    encoder.encode_field(&element.id)?;
    encoder.encode_field(&element.name)?;
    encoder.encode_field(&element.description)?;
    encoder.encode_field(&element.duration_minutes)?;
    encoder.encode_field(&element.session_type.as_str())?;
    encoder.encode_field(&element.material_link)?;
    encoder.encode_field(&format_timestamp(element.created_at))?;
    encoder.encode_field(&format_timestamp(element.updated_at))
}

fn encode_booking(encoder: &mut DataRowEncoder, details: &BookingDetails) -> PgWireResult<()> {
    let b = &details.booking;
    encoder.encode_field(&b.id)?;
    encoder.encode_field(&b.training_element_id)?;
    encoder.encode_field(&details.training_element_name)?;
    encoder.encode_field(&b.instructor_id)?;
    encoder.encode_field(&details.instructor_name)?;
    encoder.encode_field(&b.student_id)?;
    encoder.encode_field(&details.student_name)?;
    encoder.encode_field(&format_timestamp(b.start_time))?;
    encoder.encode_field(&format_timestamp(b.end_time))?;
    encoder.encode_field(&b.status.as_str())?;
    encoder.encode_field(&b.notes)?;
    encoder.encode_field(&b.created_by_user_id)?;
    encoder.encode_field(&details.created_by_email)?;
    encoder.encode_field(&format_timestamp(b.created_at))?;
    encoder.encode_field(&format_timestamp(b.updated_at))
}

fn encode_conflict(encoder: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&b.id)?;
    encoder.encode_field(&b.training_element_id)?;
    encoder.encode_field(&b.instructor_id)?;
    encoder.encode_field(&b.student_id)?;
    encoder.encode_field(&format_timestamp(b.start_time))?;
    encoder.encode_field(&format_timestamp(b.end_time))?;
    encoder.encode_field(&b.status.as_str())
}

// ── Handler ──────────────────────────────────────────────────────

pub struct TrainingdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<TrainingdQueryParser>,
}

impl TrainingdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(TrainingdQueryParser),
        }
    }

    /// The registered user behind the connection's login name, if any.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> Option<Actor> {
        let login = client.metadata().get("user")?;
        let actor = self.engine.resolve_actor(login);
        if actor.is_none() {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::debug!("login {login} is not a registered user");
        }
        actor
    }

    async fn run(&self, actor: Option<Actor>, query: &str, format: &Format) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        tracing::debug!("{label} from {:?}", actor.map(|a| a.id));

        let started = Instant::now();
        let result = self.execute_command(actor.as_ref(), cmd, format).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(
        &self,
        actor: Option<&Actor>,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertUser(input) => {
                let user = engine.register_user(actor, input).await.map_err(engine_err)?;
                Ok(vec![rows_response(schema(USER_COLUMNS, format), &[user], encode_user)])
            }
            Command::SelectUsers => {
                let users = engine.list_users(actor).map_err(engine_err)?;
                Ok(vec![rows_response(schema(USER_COLUMNS, format), &users, encode_user)])
            }
            Command::SelectSessionTypes => Ok(vec![rows_response(
                schema(SESSION_TYPE_COLUMNS, format),
                engine.session_types(),
                |encoder, session_type| encoder.encode_field(&session_type.as_str()),
            )]),
            Command::InsertTrainingElement(input) => {
                let element = engine
                    .create_training_element(actor, input)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows_response(schema(ELEMENT_COLUMNS, format), &[element], encode_element)])
            }
            Command::SelectTrainingElements { id } => {
                let elements = match id {
                    Some(id) => vec![engine.get_training_element(actor, id).map_err(engine_err)?],
                    None => engine.list_training_elements(),
                };
                Ok(vec![rows_response(schema(ELEMENT_COLUMNS, format), &elements, encode_element)])
            }
            Command::UpdateTrainingElement { id, patch } => {
                engine
                    .update_training_element(actor, id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteTrainingElement { id } => {
                engine.delete_training_element(actor, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBooking(input) => {
                let booking = engine.create_booking(actor, input).await.map_err(engine_err)?;
                let details = engine.booking_details(booking);
                Ok(vec![rows_response(schema(BOOKING_COLUMNS, format), &[details], encode_booking)])
            }
            Command::SelectBookings(filter) => {
                let bookings = engine.list_bookings(actor, &filter).map_err(engine_err)?;
                Ok(vec![rows_response(schema(BOOKING_COLUMNS, format), &bookings, encode_booking)])
            }
            Command::UpdateBooking { id, patch } => {
                engine.update_booking(actor, id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(actor, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectConflicts {
                start,
                end,
                instructor_id,
                student_id,
                exclude_id,
            } => {
                if actor.is_none() {
                    return Err(engine_err(EngineError::Unauthenticated));
                }
                let span = validate_span(start, end).map_err(engine_err)?;
                let conflicts = engine.find_conflicts(&ConflictQuery {
                    span,
                    instructor_id,
                    student_id,
                    exclude_booking_id: exclude_id,
                });
                Ok(vec![rows_response(schema(CONFLICT_COLUMNS, format), &conflicts, encode_conflict)])
            }
        }
    }
}

#[async_trait]
impl SimpleQueryHandler for TrainingdHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client);
        self.run(actor, query, &Format::UnifiedText).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TrainingdQueryParser;

#[async_trait]
impl QueryParser for TrainingdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        let format = column_format.unwrap_or(&Format::UnifiedText);
        Ok(schema(result_columns(stmt), format).to_vec())
    }
}

#[async_trait]
impl ExtendedQueryHandler for TrainingdHandler {
    type Statement = String;
    type QueryParser = TrainingdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client);
        let sql = substitute_params(portal);
        let responses = self.run(actor, &sql, &portal.result_column_format).await?;
        responses
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "statement produced no response".into()))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        let fields = schema(result_columns(&target.statement), &Format::UnifiedText).to_vec();
        Ok(DescribeStatementResponse::new(param_types, fields))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let columns = result_columns(&target.statement.statement);
        Ok(DescribePortalResponse::new(schema(columns, &target.result_column_format).to_vec()))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();

    // Highest index first so `$1` never clobbers the prefix of `$10`.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TrainingdFactory {
    handler: Arc<TrainingdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<TrainingdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl TrainingdFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = TrainingdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TrainingdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TrainingdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = TrainingdFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory)
        .await
        .map_err(io::Error::other)
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine failure.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound { .. } => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict(_) => "23P01",
        EngineError::Validation(_) => "22023",
        EngineError::Forbidden(_) => "42501",
        EngineError::Unauthenticated => "28000",
        EngineError::InUse { .. } => "23503",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::InvalidValue(_) => "22023",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn { .. } => "42703",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
