use std::fmt::Debug;
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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{invalid_login, ServiceSyncAuthSource};
use crate::engine::{BookingFilter, Engine, EngineError, ProviderSummary};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct ServiceSyncHandler {
    engine: Arc<Engine>,
    query_parser: Arc<ServiceSyncQueryParser>,
}

impl ServiceSyncHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(ServiceSyncQueryParser),
        }
    }

    /// The verified actor behind this connection, from its login name.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user = client
            .metadata()
            .get("user")
            .ok_or_else(|| invalid_login("missing user name".into()))?;
        Actor::from_login(user).map_err(invalid_login)
    }

    async fn run(&self, actor: &Actor, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, actor: &Actor, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertBooking {
                id,
                service_type,
                date,
                location,
            } => {
                let booking = engine
                    .create_booking(
                        actor,
                        id,
                        BookingDetails {
                            service_type,
                            date,
                            location,
                        },
                    )
                    .await
                    .map_err(engine_err)?;
                bookings_response(vec![booking])
            }
            Command::InsertAssignment {
                booking_id,
                provider,
            } => {
                let booking = engine
                    .assign(booking_id, actor, provider)
                    .await
                    .map_err(engine_err)?;
                bookings_response(vec![booking])
            }
            Command::InsertTransition {
                booking_id,
                status,
                expected,
                provider,
            } => {
                let request = TransitionRequest {
                    actor: *actor,
                    target: status,
                    provider,
                    expected,
                };
                let booking = engine
                    .transition(booking_id, request)
                    .await
                    .map_err(engine_err)?;
                bookings_response(vec![booking])
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { id, status } => {
                let bookings = engine
                    .list_bookings(actor, BookingFilter { id, status })
                    .await
                    .map_err(engine_err)?;
                bookings_response(bookings)
            }
            Command::SelectHistory { booking_id } => {
                let entries = engine
                    .history(actor, booking_id)
                    .await
                    .map_err(engine_err)?;
                history_response(booking_id, entries)
            }
            Command::SelectProviders => {
                let providers = engine.list_providers(actor).await.map_err(engine_err)?;
                providers_response(providers)
            }
        }
    }
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("customer_id"),
        text_field("provider_id"),
        text_field("service_type"),
        text_field("date"),
        text_field("location"),
        text_field("status"),
        int8_field("created_at"),
        text_field("history"),
    ]
}

fn history_schema() -> Vec<FieldInfo> {
    vec![
        text_field("booking_id"),
        int8_field("seq"),
        text_field("action"),
        text_field("role"),
        text_field("actor_id"),
        int8_field("at"),
    ]
}

fn providers_schema() -> Vec<FieldInfo> {
    vec![
        text_field("provider_id"),
        int8_field("active_bookings"),
        int8_field("completed_bookings"),
    ]
}

/// Result columns for a statement, decided from its text so that it works
/// before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.contains("BOOKING_HISTORY") {
        history_schema()
    } else if upper.contains("FROM PROVIDERS") {
        providers_schema()
    } else if upper.starts_with("SELECT") || upper.starts_with("INSERT") {
        bookings_schema()
    } else {
        vec![]
    }
}

fn bookings_response(bookings: Vec<Booking>) -> PgWireResult<Response> {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let history =
                serde_json::to_string(&b.history).map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.customer.to_string())?;
            encoder.encode_field(&b.provider.map(|p| p.to_string()))?;
            encoder.encode_field(&b.service_type)?;
            encoder.encode_field(&b.date)?;
            encoder.encode_field(&b.location)?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.created_at)?;
            encoder.encode_field(&history)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn history_response(booking_id: ulid::Ulid, entries: Vec<HistoryEntry>) -> PgWireResult<Response> {
    let schema = Arc::new(history_schema());
    let booking_id = booking_id.to_string();
    let rows: Vec<PgWireResult<_>> = entries
        .into_iter()
        .enumerate()
        .map(|(seq, entry)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&booking_id)?;
            encoder.encode_field(&(seq as i64))?;
            encoder.encode_field(&entry.action.to_string())?;
            encoder.encode_field(&entry.actor.role.as_str())?;
            encoder.encode_field(&entry.actor.id.map(|id| id.to_string()))?;
            encoder.encode_field(&entry.at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn providers_response(providers: Vec<ProviderSummary>) -> PgWireResult<Response> {
    let schema = Arc::new(providers_schema());
    let rows: Vec<PgWireResult<_>> = providers
        .into_iter()
        .map(|p| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&p.id.to_string())?;
            encoder.encode_field(&(p.active as i64))?;
            encoder.encode_field(&(p.completed as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for ServiceSyncHandler {
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
        let actor = self.resolve_actor(client)?;
        Ok(vec![self.run(&actor, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ServiceSyncQueryParser;

#[async_trait]
impl QueryParser for ServiceSyncQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ServiceSyncHandler {
    type Statement = String;
    type QueryParser = ServiceSyncQueryParser;

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
        let actor = self.resolve_actor(client)?;
        let sql = substitute_params(portal);
        self.run(&actor, &sql).await
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
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
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
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
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
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Single left-to-right pass over `sql`, so bound text is never rescanned.
/// Placeholders without a bound value are left as written.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let bytes = sql.as_bytes();
    let mut i = 0;
    let mut copied = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        let param = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        if let Some(param) = param {
            out.push_str(&sql[copied..i]);
            match param {
                Some(value) => {
                    let text = String::from_utf8_lossy(value.as_ref());
                    out.push('\'');
                    out.push_str(&text.replace('\'', "''"));
                    out.push('\'');
                }
                None => out.push_str("NULL"),
            }
            copied = end;
        }
        i = end.max(i + 1);
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ServiceSyncFactory {
    handler: Arc<ServiceSyncHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ServiceSyncAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ServiceSyncFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = ServiceSyncAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ServiceSyncHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ServiceSyncFactory {
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
) -> std::io::Result<()> {
    let factory = ServiceSyncFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// SQLSTATE for each engine error kind.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::NotEligible { .. } => "42501",
        EngineError::Conflict(_) => "40001",
        EngineError::Forbidden(_) => "42501",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::InvalidInput(_) => "22023",
        EngineError::StoreUnavailable(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::BadValue(_) => "22023",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}
