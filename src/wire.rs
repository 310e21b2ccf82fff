use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
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
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};

pub struct SlotwiseHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotwiseQueryParser>,
}

impl SlotwiseHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotwiseQueryParser),
        }
    }

    async fn run(&self, sql: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertTutor { profile } => {
                engine.register_tutor(profile).await.map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::UpdateTutor { profile } => {
                engine.update_tutor(profile).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertRule { rule } => {
                engine.add_rule(rule).await.map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteRule { id } => {
                engine.remove_rule(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::InsertException { exception } => {
                engine.set_exception(exception).await.map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteException { id } => {
                engine.remove_exception(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::InsertVacation { vacation } => {
                engine.add_vacation(vacation).await.map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteVacation { id } => {
                engine.remove_vacation(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::InsertHold {
                id,
                tutor_id,
                consumer_id,
                start,
                duration_minutes,
            } => {
                engine
                    .create_hold(id, tutor_id, consumer_id, start, duration_minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteHold { id } => {
                engine.release_hold(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::InsertBooking {
                id,
                hold_id,
                consumer_id,
                student_id,
            } => {
                engine
                    .confirm_booking(id, hold_id, consumer_id, student_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::Acknowledge { booking_id, actor } => {
                engine
                    .acknowledge_booking(booking_id, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::Cancel { booking_id, actor } => {
                engine
                    .cancel_booking(booking_id, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::Complete { booking_id, actor } => {
                engine
                    .complete_booking(booking_id, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::ReportNoShow {
                booking_id,
                actor,
                absent,
            } => {
                engine
                    .report_no_show(booking_id, actor, absent)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::SelectTutors => {
                let mut tutors = engine.list_tutors();
                tutors.sort_by_key(|t| t.id);
                Ok(vec![rows(tutors_schema(), &tutors, encode_tutor)])
            }
            Command::SelectRules { tutor_id } => {
                let rules = engine.get_rules(tutor_id).await.map_err(engine_err)?;
                Ok(vec![rows(rules_schema(), &rules, encode_rule)])
            }
            Command::SelectExceptions { tutor_id } => {
                let exceptions = engine.get_exceptions(tutor_id).await.map_err(engine_err)?;
                Ok(vec![rows(exceptions_schema(), &exceptions, encode_exception)])
            }
            Command::SelectVacations { tutor_id } => {
                let vacations = engine.get_vacations(tutor_id).await.map_err(engine_err)?;
                Ok(vec![rows(vacations_schema(), &vacations, encode_vacation)])
            }
            Command::SelectHolds { tutor_id } => {
                let holds = engine.get_holds(tutor_id).await.map_err(engine_err)?;
                Ok(vec![rows(holds_schema(), &holds, encode_hold)])
            }
            Command::SelectBookings { tutor_id } => {
                let bookings = engine.get_bookings(tutor_id).await.map_err(engine_err)?;
                Ok(vec![rows(bookings_schema(), &bookings, encode_booking)])
            }
            Command::SelectBooking { id } => {
                let bookings = match engine.get_booking(id).await {
                    Ok(booking) => vec![booking],
                    Err(EngineError::NotFound(_)) => vec![],
                    Err(e) => return Err(engine_err(e)),
                };
                Ok(vec![rows(bookings_schema(), &bookings, encode_booking)])
            }
            Command::SelectSlots {
                tutor_id,
                from,
                to,
                duration_minutes,
            } => {
                let slots = engine
                    .get_available_slots(tutor_id, from, to, duration_minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows(slots_schema(), &slots, encode_slot)])
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
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

// ── Row schemas ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        field("tutor_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn tutors_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("timezone", Type::VARCHAR),
        field("base_price", Type::INT8),
        field("currency", Type::VARCHAR),
        field("notice_h", Type::INT8),
        field("late_fee_pct", Type::INT8),
        field("no_show_fee_pct", Type::INT8),
        field("bookable", Type::BOOL),
    ]
}

fn rules_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("tutor_id", Type::VARCHAR),
        field("day_of_week", Type::INT8),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("timezone", Type::VARCHAR),
        field("valid_from", Type::VARCHAR),
        field("valid_until", Type::VARCHAR),
    ]
}

fn exceptions_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("tutor_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("is_available", Type::BOOL),
        field("windows", Type::VARCHAR),
    ]
}

fn vacations_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("tutor_id", Type::VARCHAR),
        field("start_date", Type::VARCHAR),
        field("end_date", Type::VARCHAR),
    ]
}

fn holds_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("tutor_id", Type::VARCHAR),
        field("consumer_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("expires_at", Type::INT8),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("tutor_id", Type::VARCHAR),
        field("consumer_id", Type::VARCHAR),
        field("student_id", Type::VARCHAR),
        field("hold_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("price", Type::INT8),
        field("currency", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

/// Result columns for a statement, for Describe. Keyed on the table after FROM.
fn result_schema(statement: &str) -> Vec<FieldInfo> {
    let lower = statement.to_lowercase();
    let mut tokens = lower.split_whitespace();
    if tokens.next() != Some("select") {
        return vec![];
    }
    let table = tokens
        .skip_while(|t| *t != "from")
        .nth(1)
        .map(|t| t.trim_matches(|c| c == ';' || c == '"'));
    match table {
        Some("slots") => slots_schema(),
        Some("tutors") => tutors_schema(),
        Some("rules") => rules_schema(),
        Some("exceptions") => exceptions_schema(),
        Some("vacations") => vacations_schema(),
        Some("holds") => holds_schema(),
        Some("bookings") => bookings_schema(),
        _ => vec![],
    }
}

// ── Row encoders ─────────────────────────────────────────────────

fn encode_slot(encoder: &mut DataRowEncoder, slot: &Slot) -> PgWireResult<()> {
    encoder.encode_field(&slot.tutor_id.to_string())?;
    encoder.encode_field(&slot.span.start)?;
    encoder.encode_field(&slot.span.end)
}

fn encode_tutor(encoder: &mut DataRowEncoder, tutor: &TutorProfile) -> PgWireResult<()> {
    encoder.encode_field(&tutor.id.to_string())?;
    encoder.encode_field(&tutor.timezone)?;
    encoder.encode_field(&tutor.base_price.amount_minor)?;
    encoder.encode_field(&tutor.base_price.currency)?;
    encoder.encode_field(&i64::from(tutor.policy.cancellation_notice_hours))?;
    encoder.encode_field(&i64::from(tutor.policy.late_cancel_fee_percent))?;
    encoder.encode_field(&i64::from(tutor.policy.no_show_fee_percent))?;
    encoder.encode_field(&tutor.bookable)
}

fn encode_rule(encoder: &mut DataRowEncoder, rule: &AvailabilityRule) -> PgWireResult<()> {
    encoder.encode_field(&rule.id.to_string())?;
    encoder.encode_field(&rule.tutor_id.to_string())?;
    encoder.encode_field(&i64::from(rule.day_of_week))?;
    encoder.encode_field(&rule.window.start.format("%H:%M").to_string())?;
    encoder.encode_field(&rule.window.end.format("%H:%M").to_string())?;
    encoder.encode_field(&rule.timezone)?;
    encoder.encode_field(&rule.valid_from.map(|d| d.to_string()))?;
    encoder.encode_field(&rule.valid_until.map(|d| d.to_string()))
}

fn encode_exception(
    encoder: &mut DataRowEncoder,
    exception: &AvailabilityException,
) -> PgWireResult<()> {
    let windows: Vec<String> = exception
        .windows
        .iter()
        .map(|w| format!("{}-{}", w.start.format("%H:%M"), w.end.format("%H:%M")))
        .collect();
    encoder.encode_field(&exception.id.to_string())?;
    encoder.encode_field(&exception.tutor_id.to_string())?;
    encoder.encode_field(&exception.date.to_string())?;
    encoder.encode_field(&exception.is_available)?;
    encoder.encode_field(&windows.join(","))
}

fn encode_vacation(encoder: &mut DataRowEncoder, vacation: &Vacation) -> PgWireResult<()> {
    encoder.encode_field(&vacation.id.to_string())?;
    encoder.encode_field(&vacation.tutor_id.to_string())?;
    encoder.encode_field(&vacation.start_date.to_string())?;
    encoder.encode_field(&vacation.end_date.to_string())
}

fn encode_hold(encoder: &mut DataRowEncoder, hold: &Hold) -> PgWireResult<()> {
    encoder.encode_field(&hold.id.to_string())?;
    encoder.encode_field(&hold.tutor_id.to_string())?;
    encoder.encode_field(&hold.consumer_id.to_string())?;
    encoder.encode_field(&hold.span.start)?;
    encoder.encode_field(&hold.span.end)?;
    encoder.encode_field(&hold.expires_at)
}

fn encode_booking(encoder: &mut DataRowEncoder, booking: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&booking.id.to_string())?;
    encoder.encode_field(&booking.tutor_id.to_string())?;
    encoder.encode_field(&booking.consumer_id.to_string())?;
    encoder.encode_field(&booking.student_id.to_string())?;
    encoder.encode_field(&booking.hold_id.to_string())?;
    encoder.encode_field(&booking.span.start)?;
    encoder.encode_field(&booking.span.end)?;
    encoder.encode_field(&booking.status.as_str().to_string())?;
    encoder.encode_field(&booking.terms.price.amount_minor)?;
    encoder.encode_field(&booking.terms.price.currency)?;
    encoder.encode_field(&booking.created_at)
}

#[async_trait]
impl SimpleQueryHandler for SlotwiseHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotwiseQueryParser;

#[async_trait]
impl QueryParser for SlotwiseQueryParser {
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
impl ExtendedQueryHandler for SlotwiseHandler {
    type Statement = String;
    type QueryParser = SlotwiseQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run(&sql).await?;
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
/// Replaced from the highest index down so `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let values: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &values)
}

/// Replace `$n` placeholders with quoted literals in one left-to-right pass,
/// so text inside a bound value is never rescanned.
fn substitute(sql: &str, values: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let bytes = sql.as_bytes();
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
        let value = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| values.get(idx));
        if let Some(value) = value {
            result.push_str(&sql[copied..i]);
            match value {
                Some(text) => {
                    result.push('\'');
                    result.push_str(&text.replace('\'', "''"));
                    result.push('\'');
                }
                None => result.push_str("NULL"),
            }
            copied = end;
        }
        i = end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared password; any user name is accepted.
#[derive(Debug)]
pub struct SlotwiseAuthSource {
    password: String,
}

impl SlotwiseAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotwiseAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotwiseFactory {
    handler: Arc<SlotwiseHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotwiseAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotwiseFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = SlotwiseAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotwiseHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotwiseFactory {
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
    factory: Arc<SlotwiseFactory>,
) -> anyhow::Result<()> {
    pgwire::tokio::process_socket(socket, None, factory).await?;
    Ok(())
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotUnavailable(_) => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::Validation(_) => "22023",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Expired(_) => "BK001",
        EngineError::Wal(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
