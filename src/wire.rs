use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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
use tracing::debug;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, AppointmentFilter, Command, RowShape, SqlError};

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared password for every user name.
#[derive(Debug)]
pub struct SlotlineAuthSource {
    password: String,
}

impl SlotlineAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotlineAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Query execution ──────────────────────────────────────────────

pub struct SlotlineHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotlineQueryParser>,
}

impl SlotlineHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotlineQueryParser),
        }
    }

    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        let shape = cmd.row_shape();
        match cmd {
            Command::InsertService {
                id,
                provider_id,
                name,
                duration_minutes,
                price_cents,
            } => {
                engine
                    .register_service(id, provider_id, name, duration_minutes, price_cents)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectServices { provider_id } => {
                let services = engine.list_services(&provider_id);
                rows(shape, services, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.provider_id.to_string())?;
                    enc.encode_field(&s.name)?;
                    enc.encode_field(&(s.duration_minutes as i64))?;
                    enc.encode_field(&s.price_cents)
                })
            }
            Command::RequestBooking {
                customer_id,
                provider_id,
                service_id,
                start,
            } => {
                let outcome = engine
                    .request_booking(customer_id, provider_id, service_id, start)
                    .await
                    .map_err(engine_err)?;
                debug!("booking for {customer_id} on {provider_id}: {}", outcome.label());
                rows(shape, vec![outcome], |enc, outcome| {
                    enc.encode_field(&outcome.label().to_string())?;
                    match outcome {
                        BookingOutcome::Confirmed { appointment_id, .. } => {
                            enc.encode_field(&appointment_id.to_string())?;
                            enc.encode_field(&None::<String>)
                        }
                        BookingOutcome::Waitlisted {
                            entry_id,
                            preferred_date,
                        } => {
                            enc.encode_field(&entry_id.to_string())?;
                            enc.encode_field(&Some(preferred_date.to_string()))
                        }
                    }
                })
            }
            Command::CancelAppointment { id } => {
                let outcome = engine.cancel_appointment(id).await.map_err(engine_err)?;
                rows(shape, vec![outcome], |enc, outcome| {
                    enc.encode_field(&outcome.label().to_string())?;
                    let promoted = match outcome {
                        CancelOutcome::CancelledAndPromoted { entry_id, .. } => Some(entry_id.to_string()),
                        _ => None,
                    };
                    enc.encode_field(&promoted)
                })
            }
            Command::ClearCancelled { provider_id } => {
                let n = engine.clear_cancelled(provider_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(n)))
            }
            Command::ClearCustomerCancelled { customer_id } => {
                let n = engine
                    .clear_cancelled_for_customer(customer_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(n)))
            }
            Command::SelectAvailability {
                provider_id,
                start,
                end,
            } => {
                let available = engine
                    .is_available(provider_id, start, end)
                    .await
                    .map_err(engine_err)?;
                rows(shape, vec![available], |enc, available| enc.encode_field(&available))
            }
            Command::SelectServiceAvailability {
                provider_id,
                service_id,
                start,
            } => {
                let available = engine
                    .check_availability(provider_id, service_id, start)
                    .await
                    .map_err(engine_err)?;
                rows(shape, vec![available], |enc, available| enc.encode_field(&available))
            }
            Command::SelectAppointments { filter } => {
                let appointments: Vec<Appointment> = match filter {
                    AppointmentFilter::Id(id) => engine.get_appointment(&id).await.into_iter().collect(),
                    AppointmentFilter::Provider(id) => engine.get_appointments(&id).await,
                    AppointmentFilter::Customer(id) => engine.get_customer_appointments(&id).await,
                };
                rows(shape, appointments, |enc, a| {
                    enc.encode_field(&a.id.to_string())?;
                    enc.encode_field(&a.provider_id.to_string())?;
                    enc.encode_field(&a.customer_id.to_string())?;
                    enc.encode_field(&a.service_id.to_string())?;
                    enc.encode_field(&format_instant(a.span.start, a.utc_offset))?;
                    enc.encode_field(&format_instant(a.span.end, a.utc_offset))?;
                    enc.encode_field(&a.status.as_str().to_string())
                })
            }
            Command::SelectWaitingList { provider_id } => {
                let entries = engine.get_waiting_list(&provider_id).await;
                rows(shape, entries, |enc, w| {
                    enc.encode_field(&w.id.to_string())?;
                    enc.encode_field(&w.user_id.to_string())?;
                    enc.encode_field(&w.provider_id.to_string())?;
                    enc.encode_field(&w.service_id.to_string())?;
                    enc.encode_field(&w.preferred_date.to_string())?;
                    enc.encode_field(&w.status.as_str().to_string())?;
                    enc.encode_field(&format_instant(w.created_at, 0))
                })
            }
            Command::RemoveWaitingEntry { id } => {
                engine.remove_waiting_entry(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::PurgeWaitingList { provider_id, before } => {
                let n = engine
                    .purge_waiting_list(provider_id, before)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(n)))
            }
            Command::InsertNotification { user_id, message } => {
                engine
                    .post_notification(user_id, message)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectNotifications { user_id } => {
                let notifications = engine.get_notifications(&user_id).await;
                rows(shape, notifications, |enc, n| {
                    enc.encode_field(&n.id.to_string())?;
                    enc.encode_field(&n.user_id.to_string())?;
                    enc.encode_field(&n.message)?;
                    enc.encode_field(&n.is_read)?;
                    enc.encode_field(&format_instant(n.created_at, 0))
                })
            }
            Command::SelectUnreadCount { user_id } => {
                let unread = engine.unread_count(&user_id).await.map_err(engine_err)?;
                rows(shape, vec![unread], |enc, unread| {
                    enc.encode_field(&user_id.to_string())?;
                    enc.encode_field(&(unread as i64))
                })
            }
            Command::MarkRead { notification_id } => {
                engine
                    .mark_notification_read(notification_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::MarkAllRead { user_id } => {
                let n = engine.mark_all_read(user_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(n)))
            }
            Command::ClearReadNotifications { user_id } => {
                let n = engine
                    .clear_read_notifications(user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(n)))
            }
        }
    }
}

/// Encode `items` as a result set with the columns of `shape`.
fn rows<T>(
    shape: RowShape,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema(shape));
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn schema(shape: RowShape) -> Vec<FieldInfo> {
    let text = |names: &[&str]| names.iter().map(|n| field(n, Type::VARCHAR)).collect::<Vec<_>>();
    match shape {
        RowShape::None => vec![],
        RowShape::Booking => text(&["outcome", "id", "preferred_date"]),
        RowShape::Cancellation => text(&["outcome", "promoted_entry_id"]),
        RowShape::Availability => vec![field("available", Type::BOOL)],
        RowShape::Services => {
            let mut fields = text(&["id", "provider_id", "name"]);
            fields.push(field("duration", Type::INT8));
            fields.push(field("price", Type::INT8));
            fields
        }
        RowShape::Appointments => text(&[
            "id",
            "provider_id",
            "customer_id",
            "service_id",
            "start_time",
            "end_time",
            "status",
        ]),
        RowShape::WaitingList => text(&[
            "id",
            "user_id",
            "provider_id",
            "service_id",
            "preferred_date",
            "status",
            "created_at",
        ]),
        RowShape::Notifications => {
            let mut fields = text(&["id", "user_id", "message"]);
            fields.push(field("is_read", Type::BOOL));
            fields.push(field("created_at", Type::VARCHAR));
            fields
        }
        RowShape::UnreadCount => vec![field("user_id", Type::VARCHAR), field("unread", Type::INT8)],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotlineHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotlineQueryParser;

#[async_trait]
impl QueryParser for SlotlineQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema(sql::row_shape(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotlineHandler {
    type Statement = String;
    type QueryParser = SlotlineQueryParser;

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
        self.run(&substitute_params(portal)).await
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
            schema(sql::row_shape(&target.statement)),
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
        Ok(DescribePortalResponse::new(schema(sql::row_shape(
            &target.statement.statement,
        ))))
    }
}

/// Highest `$N` placeholder in the SQL string.
/// `$N` placeholders outside quoted literals, as byte range and N.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // A doubled quote inside a literal toggles twice and stays inside.
            b'\'' => {
                in_quote = !in_quote;
                i += 1;
            }
            b'$' if !in_quote => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Replace each placeholder with its bound value (text format) in one pass, so
/// a value that itself contains `$N` is never rewritten.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotlineFactory {
    handler: Arc<SlotlineHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SlotlineAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotlineFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotlineHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SlotlineAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotlineFactory {
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
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>, password: String) -> io::Result<()> {
    let factory = SlotlineFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine failure. `40001` asks the client to retry the whole request.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidInterval { .. }
        | EngineError::InvalidArgument(_)
        | EngineError::ServiceProviderMismatch { .. } => "22023",
        EngineError::ServiceNotFound(_) | EngineError::NotFound(_) => "02000",
        EngineError::Conflict(_) => "40001",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::PersistenceFailed(_) | EngineError::StoreUnavailable(_) => "58000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
