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
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type, METADATA_USER};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::auth::{Credentials, VisitdAuthSource};
use crate::engine::{now_ms, Engine, EngineError};
use crate::limits::DEFAULT_UPCOMING_DAYS;
use crate::model::{BlackoutEntry, PropertyId, Reservation, Slot, Statistics};
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct VisitdHandler {
    engine: Arc<Engine>,
    credentials: Credentials,
    query_parser: Arc<VisitdQueryParser>,
}

impl VisitdHandler {
    pub fn new(engine: Arc<Engine>, credentials: Credentials) -> Self {
        Self {
            engine,
            credentials,
            query_parser: Arc::new(VisitdQueryParser),
        }
    }

    /// The connection's user name, unless it is the public account.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> Option<String> {
        client
            .metadata()
            .get(METADATA_USER)
            .filter(|user| !self.credentials.is_public(user))
            .cloned()
    }

    async fn run_query(&self, actor: Option<String>, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        debug!(command = label, actor = ?actor, "query");

        let start = Instant::now();
        let result = self.execute_command(actor.as_deref(), cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, actor: Option<&str>, cmd: Command) -> PgWireResult<Response> {
        if cmd.requires_actor() && actor.is_none() {
            return Err(user_error(
                "42501",
                format!("permission denied: {} requires a staff account", command_label(&cmd)),
            ));
        }
        let engine = &self.engine;
        let now = now_ms();

        match cmd {
            Command::RequestBooking { request } => {
                let r = engine.request_booking(request, actor, now).await.map_err(engine_err)?;
                Ok(reservations_response(vec![r]))
            }
            Command::Reschedule { id, slot } => {
                let r = engine
                    .reschedule_booking(id, slot, actor, now)
                    .await
                    .map_err(engine_err)?;
                Ok(reservations_response(vec![r]))
            }
            Command::Confirm { id } => {
                let r = engine.confirm_booking(id, actor, now).await.map_err(engine_err)?;
                Ok(reservations_response(vec![r]))
            }
            Command::Cancel { id } => {
                let r = engine.cancel_booking(id, actor, now).await.map_err(engine_err)?;
                Ok(reservations_response(vec![r]))
            }
            Command::Complete { id } => {
                let r = engine.complete_booking(id, actor, now).await.map_err(engine_err)?;
                Ok(reservations_response(vec![r]))
            }
            Command::Amend { id, amendment } => {
                let r = engine
                    .amend_booking(id, amendment, actor, now)
                    .await
                    .map_err(engine_err)?;
                Ok(reservations_response(vec![r]))
            }
            Command::RemoveReservation { id } => {
                engine.remove_booking(id, actor).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectReservations { id: Some(id), filter } => {
                let found = match engine.get_reservation(id).await {
                    Ok(r) if filter.matches(&r) => vec![r],
                    Ok(_) | Err(EngineError::NotFound(_)) => Vec::new(),
                    Err(e) => return Err(engine_err(e)),
                };
                Ok(reservations_response(found))
            }
            Command::SelectReservations { id: None, filter } => {
                let list = engine.list_reservations(&filter).await.map_err(engine_err)?;
                Ok(reservations_response(list))
            }
            Command::SelectAvailableSlots { property_id, date } => {
                let slots = engine
                    .get_available_slots(&property_id, date, now)
                    .await
                    .map_err(engine_err)?;
                Ok(slots_response(property_id, date.format("%Y-%m-%d").to_string(), slots))
            }
            Command::SelectUpcoming { days, owner_id } => {
                let list = engine
                    .upcoming_reservations(now, days.unwrap_or(DEFAULT_UPCOMING_DAYS), owner_id.as_deref())
                    .await
                    .map_err(engine_err)?;
                Ok(reservations_response(list))
            }
            Command::SelectStatistics { owner_id } => {
                let stats = engine.get_statistics(owner_id.as_deref()).await;
                Ok(statistics_response(&stats))
            }
            Command::AddBlackout { date, slot, reason } => {
                let entry = engine
                    .add_blackout(date, slot, reason, now)
                    .await
                    .map_err(engine_err)?;
                Ok(blackouts_response(vec![entry]))
            }
            Command::RemoveBlackout { date, slot } => {
                let removed = engine.remove_blackout(date, slot).await.map_err(engine_err)?;
                Ok(Response::Execution(
                    Tag::new("DELETE").with_rows(usize::from(removed.is_some())),
                ))
            }
            Command::SelectBlackouts => Ok(blackouts_response(engine.list_blackouts())),
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("property_id"),
        text_field("date"),
        text_field("slot"),
        text_field("status"),
        text_field("kind"),
        text_field("client_name"),
        text_field("client_email"),
        text_field("client_phone"),
        text_field("owner_id"),
        text_field("notes"),
        int8_field("created_at"),
        int8_field("updated_at"),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![text_field("property_id"), text_field("date"), text_field("slot")]
}

fn statistics_schema() -> Vec<FieldInfo> {
    vec![text_field("category"), text_field("name"), int8_field("count")]
}

fn blackout_schema() -> Vec<FieldInfo> {
    vec![
        text_field("date"),
        text_field("slot"),
        text_field("reason"),
        int8_field("created_at"),
    ]
}

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
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

fn reservations_response(list: Vec<Reservation>) -> Response {
    rows_response(reservation_schema(), list, |encoder, r| {
        encoder.encode_field(&r.id.to_string())?;
        encoder.encode_field(&r.property_id)?;
        encoder.encode_field(&r.slot.date.format("%Y-%m-%d").to_string())?;
        encoder.encode_field(&r.slot.slot.to_string())?;
        encoder.encode_field(&r.status.as_str().to_string())?;
        encoder.encode_field(&r.kind.as_str().to_string())?;
        encoder.encode_field(&r.client.name)?;
        encoder.encode_field(&r.client.email)?;
        encoder.encode_field(&r.client.phone)?;
        encoder.encode_field(&r.owner_id)?;
        encoder.encode_field(&r.notes)?;
        encoder.encode_field(&r.created_at)?;
        encoder.encode_field(&r.updated_at)?;
        Ok(())
    })
}

fn slots_response(property_id: PropertyId, date: String, slots: Vec<Slot>) -> Response {
    rows_response(slot_schema(), slots, |encoder, slot| {
        encoder.encode_field(&property_id)?;
        encoder.encode_field(&date)?;
        encoder.encode_field(&slot.to_string())?;
        Ok(())
    })
}

fn statistics_response(stats: &Statistics) -> Response {
    let mut rows: Vec<(String, String, i64)> = vec![("total".into(), "all".into(), stats.total as i64)];
    rows.extend(
        stats
            .by_status
            .iter()
            .map(|(status, n)| ("status".into(), status.as_str().to_string(), *n as i64)),
    );
    rows.extend(
        stats
            .by_kind
            .iter()
            .map(|(kind, n)| ("kind".into(), kind.as_str().to_string(), *n as i64)),
    );
    rows_response(statistics_schema(), rows, |encoder, (category, name, count)| {
        encoder.encode_field(category)?;
        encoder.encode_field(name)?;
        encoder.encode_field(count)?;
        Ok(())
    })
}

fn blackouts_response(entries: Vec<BlackoutEntry>) -> Response {
    rows_response(blackout_schema(), entries, |encoder, b| {
        encoder.encode_field(&b.date.format("%Y-%m-%d").to_string())?;
        encoder.encode_field(&b.slot.map(|s| s.to_string()))?;
        encoder.encode_field(&b.reason)?;
        encoder.encode_field(&b.created_at)?;
        Ok(())
    })
}

/// Row description for a statement, decided from its target table so it
/// works on unbound statements with `$n` placeholders.
fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.trim_start().to_lowercase();
    if lower.starts_with("delete") {
        return Vec::new();
    }
    if lower.contains("available_slots") {
        slot_schema()
    } else if lower.contains("statistics") {
        statistics_schema()
    } else if lower.contains("blackouts") {
        blackout_schema()
    } else if ["reservations", "reschedules", "confirmations", "cancellations", "completions", "amendments"]
        .iter()
        .any(|table| lower.contains(table))
    {
        reservation_schema()
    } else {
        Vec::new()
    }
}

#[async_trait]
impl SimpleQueryHandler for VisitdHandler {
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
        let actor = self.resolve_actor(&*client);
        Ok(vec![self.run_query(actor, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct VisitdQueryParser;

#[async_trait]
impl QueryParser for VisitdQueryParser {
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
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for VisitdHandler {
    type Statement = String;
    type QueryParser = VisitdQueryParser;

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
        let actor = self.resolve_actor(&*client);
        let sql = substitute_params(portal);
        self.run_query(actor, &sql).await
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
            statement_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(statement_schema(
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
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    bind_params(&portal.statement.statement, &params)
}

/// Replace each `$N` with its literal in one left-to-right pass, so text
/// inside a bound value is never scanned for placeholders. Unknown indexes
/// are left as written.
fn bind_params(sql: &str, params: &[Option<String>]) -> String {
    let bytes = sql.as_bytes();
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;
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
            result.push_str(&sql[copied..i]);
            match param {
                Some(text) => {
                    result.push('\'');
                    result.push_str(&text.replace('\'', "''"));
                    result.push('\'');
                }
                None => result.push_str("NULL"),
            }
            copied = end;
        }
        i = end.max(i + 1);
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct VisitdFactory {
    handler: Arc<VisitdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<VisitdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl VisitdFactory {
    pub fn new(engine: Arc<Engine>, credentials: Credentials) -> Self {
        let auth_source = VisitdAuthSource::new(credentials.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(VisitdHandler::new(engine, credentials)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for VisitdFactory {
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
    credentials: Credentials,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(VisitdFactory::new(engine, credentials));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine error.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidInput(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::Transient(_) => "40001",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if e.is_retryable() {
        warn!(error = %e, "transient engine error");
    }
    user_error(sqlstate(&e), format!("{}: {e}", e.code()))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::Parse(_) => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
