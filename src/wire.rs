use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDate;
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::StaygridAuthSource;
use crate::engine::{CheckOptions, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct StaygridHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<StaygridQueryParser>,
}

impl StaygridHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(StaygridQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            user_error("08006", format!("tenant error: {e}"))
        })
    }

    async fn run_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::UpsertUnit {
                id,
                name,
                nightly_rate,
                active,
            } => {
                engine
                    .upsert_unit(id, name, nightly_rate, active)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertOccupancy {
                id,
                unit_id,
                requester,
                check_in,
                check_out,
                state,
            } => {
                let stay = stay(check_in, check_out)?;
                engine
                    .create_occupancy(id, unit_id, &requester, stay, state)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::ConsumeHold { occupancy_id, hold_id } => {
                engine
                    .consume_hold(hold_id, occupancy_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::TransitionOccupancy { id, state } => {
                engine
                    .transition_occupancy(id, state)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::CancelOccupancy { id } => {
                engine
                    .transition_occupancy(id, OccupancyState::Cancelled)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertHold {
                id,
                unit_id,
                requester,
                check_in,
                check_out,
                hold_minutes,
            } => {
                let stay = stay(check_in, check_out)?;
                let minutes = hold_minutes.unwrap_or(engine.config().default_hold_minutes);
                engine
                    .create_hold(id, unit_id, &requester, stay, minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteHold { id } => {
                engine.release_hold(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectUnits => {
                let schema = Arc::new(units_schema());
                let rows: Vec<PgWireResult<DataRow>> = engine
                    .list_units()
                    .await
                    .into_iter()
                    .map(|u| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&u.id.to_string())?;
                        encoder.encode_field(&u.name)?;
                        encoder.encode_field(&u.nightly_rate)?;
                        encoder.encode_field(&u.active)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectAvailability {
                unit_id,
                check_in,
                check_out,
                include_holds,
            } => {
                let opts = CheckOptions {
                    include_holds,
                    use_cache: true,
                };
                let verdict = engine
                    .check_availability(unit_id, stay(check_in, check_out)?, opts)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let row = encode_availability(&schema, unit_id, verdict.stay, verdict.available, reason_text(&verdict));
                Ok(vec![query_response(schema, vec![row])])
            }
            Command::SelectBulkAvailability {
                unit_ids,
                check_in,
                check_out,
                include_holds,
            } => {
                let stay = stay(check_in, check_out)?;
                let opts = CheckOptions {
                    include_holds,
                    use_cache: true,
                };
                let mut verdicts = engine
                    .check_bulk_availability(&unit_ids, stay, opts)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let mut seen = HashSet::with_capacity(unit_ids.len());
                let rows: Vec<PgWireResult<DataRow>> = unit_ids
                    .into_iter()
                    .filter(|id| seen.insert(*id))
                    .filter_map(|id| verdicts.remove(&id).map(|v| (id, v)))
                    .map(|(id, verdict)| match verdict {
                        Ok(v) => encode_availability(&schema, id, stay, v.available, reason_text(&v)),
                        Err(e) => encode_availability(&schema, id, stay, false, Some(e.to_string())),
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectCalendar { unit_id, start, end } => {
                let days = engine
                    .calendar_grid(unit_id, start, end)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(calendar_schema());
                let rows: Vec<PgWireResult<DataRow>> = days
                    .into_iter()
                    .map(|day| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&day.date.to_string())?;
                        encoder.encode_field(&day.is_available)?;
                        encoder.encode_field(&day.has_check_in)?;
                        encoder.encode_field(&day.has_check_out)?;
                        encoder.encode_field(&day.occupancy_ref.map(claim_ref_text))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectAvailablePeriods {
                unit_id,
                start,
                end,
                min_stay,
            } => {
                let periods = engine
                    .find_available_periods(unit_id, start, end, min_stay)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(periods_schema());
                let rows: Vec<PgWireResult<DataRow>> = periods
                    .into_iter()
                    .map(|p| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&p.start.to_string())?;
                        encoder.encode_field(&p.end.to_string())?;
                        encoder.encode_field(&p.nights())?;
                        encoder.encode_field(&p.meets_min_stay)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectOccupancies {
                unit_id,
                include_cancelled,
            } => {
                let occupancies = if include_cancelled {
                    engine.list_occupancies(unit_id).await
                } else {
                    engine.list_active_occupancies(unit_id).await
                }
                .map_err(engine_err)?;
                let schema = Arc::new(occupancies_schema());
                let rows: Vec<PgWireResult<DataRow>> = occupancies
                    .into_iter()
                    .map(|o| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&o.id.to_string())?;
                        encoder.encode_field(&o.unit_id.to_string())?;
                        encoder.encode_field(&o.requester)?;
                        encoder.encode_field(&o.stay.check_in.to_string())?;
                        encoder.encode_field(&o.stay.check_out.to_string())?;
                        encoder.encode_field(&o.state.to_string())?;
                        encoder.encode_field(&o.created_at)?;
                        encoder.encode_field(&o.hold_id.map(|h| h.to_string()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectHolds { unit_id } => {
                let holds = engine.list_holds(unit_id).await.map_err(engine_err)?;
                let schema = Arc::new(holds_schema());
                let rows: Vec<PgWireResult<DataRow>> = holds
                    .into_iter()
                    .map(|h| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&h.id.to_string())?;
                        encoder.encode_field(&h.unit_id.to_string())?;
                        encoder.encode_field(&h.requester)?;
                        encoder.encode_field(&h.stay.check_in.to_string())?;
                        encoder.encode_field(&h.stay.check_out.to_string())?;
                        encoder.encode_field(&h.state.to_string())?;
                        encoder.encode_field(&h.expires_at)?;
                        encoder.encode_field(&h.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
        }
    }
}

fn stay(check_in: NaiveDate, check_out: NaiveDate) -> PgWireResult<Stay> {
    Stay::try_new(check_in, check_out).ok_or_else(|| {
        engine_err(EngineError::Validation(format!(
            "check_out {check_out} must be after check_in {check_in}"
        )))
    })
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_availability(
    schema: &Arc<Vec<FieldInfo>>,
    unit_id: ulid::Ulid,
    stay: Stay,
    available: bool,
    reason: Option<String>,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&unit_id.to_string())?;
    encoder.encode_field(&stay.check_in.to_string())?;
    encoder.encode_field(&stay.check_out.to_string())?;
    encoder.encode_field(&available)?;
    encoder.encode_field(&reason)?;
    Ok(encoder.take_row())
}

fn reason_text(verdict: &Availability) -> Option<String> {
    verdict.reason.as_ref().map(|reason| match reason {
        Unavailable::UnitInactive => "unit inactive".to_string(),
        Unavailable::Conflicts(conflicts) => conflicts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; "),
    })
}

fn claim_ref_text(claim: ClaimRef) -> String {
    match claim {
        ClaimRef::Occupancy(id) => format!("occupancy:{id}"),
        ClaimRef::Hold(id) => format!("hold:{id}"),
    }
}

// ── Schemas ──────────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn units_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("nightly_rate", Type::INT8),
        field("active", Type::BOOL),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("unit_id", Type::VARCHAR),
        field("check_in", Type::VARCHAR),
        field("check_out", Type::VARCHAR),
        field("available", Type::BOOL),
        field("reason", Type::VARCHAR),
    ]
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![
        field("date", Type::VARCHAR),
        field("is_available", Type::BOOL),
        field("has_check_in", Type::BOOL),
        field("has_check_out", Type::BOOL),
        field("occupancy_ref", Type::VARCHAR),
    ]
}

fn periods_schema() -> Vec<FieldInfo> {
    vec![
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("nights", Type::INT8),
        field("meets_min_stay", Type::BOOL),
    ]
}

fn occupancies_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("unit_id", Type::VARCHAR),
        field("requester", Type::VARCHAR),
        field("check_in", Type::VARCHAR),
        field("check_out", Type::VARCHAR),
        field("state", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("hold_id", Type::VARCHAR),
    ]
}

fn holds_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("unit_id", Type::VARCHAR),
        field("requester", Type::VARCHAR),
        field("check_in", Type::VARCHAR),
        field("check_out", Type::VARCHAR),
        field("state", Type::VARCHAR),
        field("expires_at", Type::INT8),
        field("created_at", Type::INT8),
    ]
}

/// Result columns for a statement, empty for statements that return no rows.
fn describe_result(sql: &str) -> Vec<FieldInfo> {
    match sql::result_table(sql).as_deref() {
        Some("units") => units_schema(),
        Some("availability") => availability_schema(),
        Some("calendar") => calendar_schema(),
        Some("available_periods") => periods_schema(),
        Some("occupancies") => occupancies_schema(),
        Some("holds") => holds_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for StaygridHandler {
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
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StaygridQueryParser;

#[async_trait]
impl QueryParser for StaygridQueryParser {
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
        Ok(describe_result(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for StaygridHandler {
    type Statement = String;
    type QueryParser = StaygridQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.run_command(&engine, cmd).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
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
            describe_result(&target.statement),
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
        Ok(DescribePortalResponse::new(describe_result(
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
/// Replaced highest-first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
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

pub struct StaygridFactory {
    handler: Arc<StaygridHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<StaygridAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl StaygridFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = StaygridAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(StaygridHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StaygridFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(StaygridFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotAvailable { .. } | EngineError::Conflict { .. } => "23P01",
        EngineError::NotFound(_) | EngineError::HoldNotFound(_) => "02000",
        EngineError::LockTimeout(_) => "40001",
        EngineError::Infrastructure(_) => "58000",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    debug!("engine error: {e}");
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
