use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{Sink, SinkExt, stream};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, METADATA_USER, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::TlsAcceptor;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::KairosAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::session::{Identity, SessionError, SessionManager};
use crate::sql::{self, Command, SqlError};

struct Listener {
    channel: String,
    rx: broadcast::Receiver<BookingEvent>,
}

#[derive(Default)]
struct ConnState {
    token: Option<String>,
    listeners: Vec<Listener>,
}

/// One handler per connection: the session token and LISTEN
/// subscriptions live here.
pub struct KairosHandler {
    engine: Arc<Engine>,
    sessions: Arc<SessionManager>,
    query_parser: Arc<KairosQueryParser>,
    conn: Mutex<ConnState>,
}

impl KairosHandler {
    pub fn new(engine: Arc<Engine>, sessions: Arc<SessionManager>) -> Self {
        Self {
            engine,
            sessions,
            query_parser: Arc::new(KairosQueryParser),
            conn: Mutex::new(ConnState::default()),
        }
    }

    /// Resolve the acting principal. The first statement on a connection
    /// signs in with the startup user name.
    async fn principal<C: ClientInfo>(&self, client: &C) -> PgWireResult<(String, Principal)> {
        let token = self.conn.lock().await.token.clone();
        if let Some(token) = token {
            match self.sessions.current(&token).await {
                Ok(p) => return Ok((token, p)),
                Err(SessionError::NotSignedIn) => {}
                Err(e) => return Err(session_err(e)),
            }
        }
        let email = client
            .metadata()
            .get(METADATA_USER)
            .cloned()
            .ok_or_else(|| session_err(SessionError::NotSignedIn))?;
        let (token, principal) = self
            .sessions
            .sign_in(Identity::email(email))
            .await
            .map_err(session_err)?;
        self.conn.lock().await.token = Some(token.clone());
        Ok((token, principal))
    }

    /// Send every event queued on this connection's channels as
    /// NotificationResponse messages.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let pending = {
            let mut conn = self.conn.lock().await;
            let mut pending = Vec::new();
            for listener in conn.listeners.iter_mut() {
                loop {
                    match listener.rx.try_recv() {
                        Ok(event) => pending.push((listener.channel.clone(), event_payload(&event))),
                        Err(broadcast::error::TryRecvError::Lagged(n)) => {
                            warn!(channel = %listener.channel, skipped = n, "listener lagged");
                        }
                        Err(_) => break,
                    }
                }
            }
            pending
        };
        for (channel, payload) in pending {
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    0, channel, payload,
                )))
                .await?;
        }
        Ok(())
    }

    async fn run<C: ClientInfo>(&self, client: &C, cmd: Command, format: &Format) -> PgWireResult<Vec<Response>> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(client, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command<C: ClientInfo>(
        &self,
        client: &C,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Vec<Response>> {
        // Session-level statements never sign in.
        match cmd {
            Command::Listen { channel } => {
                let rx = self.subscribe(&channel)?;
                let mut conn = self.conn.lock().await;
                if !conn.listeners.iter().any(|l| l.channel == channel) {
                    debug!(%channel, "listen");
                    conn.listeners.push(Listener { channel, rx });
                }
                return Ok(vec![Response::Execution(Tag::new("LISTEN"))]);
            }
            Command::Unlisten { channel } => {
                self.conn.lock().await.listeners.retain(|l| l.channel != channel);
                return Ok(vec![Response::Execution(Tag::new("UNLISTEN"))]);
            }
            Command::UnlistenAll => {
                self.conn.lock().await.listeners.clear();
                return Ok(vec![Response::Execution(Tag::new("UNLISTEN"))]);
            }
            Command::SignOut => {
                let token = {
                    let mut conn = self.conn.lock().await;
                    conn.listeners.clear();
                    conn.token.take()
                };
                if let Some(token) = token {
                    self.sessions.sign_out(&token).await.map_err(session_err)?;
                }
                return Ok(vec![Response::Execution(Tag::new("DISCARD ALL"))]);
            }
            _ => {}
        }

        let (token, principal) = self.principal(client).await?;
        let engine = &self.engine;
        match cmd {
            Command::CreateBooking { draft, returning } => {
                let (booking, _) = engine.create_booking(&principal, draft).await.map_err(engine_err)?;
                Ok(vec![written("INSERT", booking, returning, format)?])
            }
            Command::UpdateBooking { id, draft, returning } => {
                let (booking, _) = engine
                    .update_booking(&principal, id, draft)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![written("UPDATE", booking, returning, format)?])
            }
            Command::CancelBooking { id, returning } => {
                let booking = engine.cancel_booking(&principal, id).await.map_err(engine_err)?;
                Ok(vec![written("UPDATE", booking, returning, format)?])
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(&principal, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBookings { id: Some(id), .. } => {
                let view = engine.get_booking(id).await.map_err(engine_err)?;
                Ok(vec![booking_rows(vec![view.booking], format)?])
            }
            Command::SelectBookings { id: None, filter } => {
                let rows = engine.list_bookings(&filter).await.map_err(engine_err)?;
                Ok(vec![booking_rows(rows, format)?])
            }
            Command::SelectMyBookings { view } => {
                let rows = engine.dashboard(&principal, view).await.map_err(engine_err)?;
                Ok(vec![booking_rows(rows, format)?])
            }
            Command::SelectAttendees { booking_id } => {
                let rows = engine.attendees(booking_id).await.map_err(engine_err)?;
                Ok(vec![attendee_rows(rows, format)?])
            }
            Command::SelectDashboard => {
                let s = engine.dashboard_stats(&principal).await.map_err(engine_err)?;
                let schema = Arc::new(with_format(dashboard_schema(), format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(s.upcoming as i64))?;
                encoder.encode_field(&(s.today as i64))?;
                encoder.encode_field(&(s.total as i64))?;
                Ok(vec![single_row(schema, encoder)])
            }
            Command::SelectBookingStats => {
                let s = engine.booking_stats(&principal).await.map_err(engine_err)?;
                let schema = Arc::new(with_format(booking_stats_schema(), format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                for n in [s.total, s.scheduled, s.cancelled, s.completed, s.upcoming] {
                    encoder.encode_field(&(n as i64))?;
                }
                Ok(vec![single_row(schema, encoder)])
            }
            Command::SelectInvite { booking_id } => {
                let ics = engine.export_invite(booking_id).await.map_err(engine_err)?;
                let schema = Arc::new(with_format(invite_schema(), format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&booking_id.to_string())?;
                encoder.encode_field(&ics)?;
                Ok(vec![single_row(schema, encoder)])
            }
            Command::SelectUsers => {
                let users = engine.list_users(&principal).await.map_err(engine_err)?;
                Ok(vec![user_rows(users, format)?])
            }
            Command::SetRole { user_id, role } => {
                engine.set_role(&principal, user_id, role).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectAvailability => {
                let windows = engine.list_windows().await.map_err(engine_err)?;
                let schema = Arc::new(with_format(availability_schema(), format));
                let rows: Vec<PgWireResult<_>> = windows
                    .into_iter()
                    .map(|w| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&w.id.to_string())?;
                        encoder.encode_field(&w.span.start)?;
                        encoder.encode_field(&w.span.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertAvailability { start, end } => {
                engine.add_window(&principal, start, end).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteAvailability { id } => {
                engine.remove_window(&principal, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectOpenSlots { start, end } => {
                if end <= start {
                    return Err(engine_err(EngineError::InvertedRange));
                }
                let slots = engine.open_slots(Span::new(start, end)).await.map_err(engine_err)?;
                let schema = Arc::new(with_format(open_slots_schema(), format));
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SetProviderToken { token: value } => {
                self.sessions
                    .set_provider_token(&token, value)
                    .await
                    .map_err(session_err)?;
                Ok(vec![Response::Execution(Tag::new("SET"))])
            }
            Command::Listen { .. } | Command::Unlisten { .. } | Command::UnlistenAll | Command::SignOut => {
                Ok(vec![Response::EmptyQuery])
            }
        }
    }

    fn subscribe(&self, channel: &str) -> PgWireResult<broadcast::Receiver<BookingEvent>> {
        if channel == "bookings" {
            return Ok(self.engine.notify.subscribe_all());
        }
        let raw = channel.strip_prefix("booking_").ok_or_else(|| {
            user_err(
                "42000",
                format!("invalid channel: {channel} (expected bookings or booking_{{id}})"),
            )
        })?;
        let id = Ulid::from_string(raw).map_err(|e| user_err("42000", format!("bad ULID in channel: {e}")))?;
        Ok(self.engine.notify.subscribe(id))
    }
}

impl Drop for KairosHandler {
    /// A closed connection ends its session.
    fn drop(&mut self) {
        let Some(token) = self.conn.get_mut().token.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let sessions = self.sessions.clone();
        runtime.spawn(async move {
            if let Err(e) = sessions.sign_out(&token).await {
                warn!(error = %e, "sign-out on disconnect failed");
            }
        });
    }
}

fn event_payload(event: &BookingEvent) -> String {
    let value = match event {
        BookingEvent::Created(b) | BookingEvent::Updated(b) | BookingEvent::Cancelled(b) => json!({
            "event": event_name(event),
            "booking_id": b.id.to_string(),
            "status": b.status.as_str(),
            "start_time": b.span.start,
            "end_time": b.span.end,
        }),
        BookingEvent::Deleted { id } | BookingEvent::Completed { id } => json!({
            "event": event_name(event),
            "booking_id": id.to_string(),
        }),
        BookingEvent::NotificationSent {
            booking_id,
            kind,
            success,
            detail,
        } => json!({
            "event": event_name(event),
            "booking_id": booking_id.to_string(),
            "kind": kind.as_str(),
            "success": success,
            "detail": detail,
        }),
    };
    value.to_string()
}

fn event_name(event: &BookingEvent) -> &'static str {
    match event {
        BookingEvent::Created(_) => "created",
        BookingEvent::Updated(_) => "updated",
        BookingEvent::Cancelled(_) => "cancelled",
        BookingEvent::Deleted { .. } => "deleted",
        BookingEvent::Completed { .. } => "completed",
        BookingEvent::NotificationSent { .. } => "notification_sent",
    }
}

// ── Result encoding ──────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

/// Apply the client's requested result format. Simple queries are always text.
fn with_format(fields: Vec<FieldInfo>, format: &Format) -> Vec<FieldInfo> {
    fields
        .into_iter()
        .enumerate()
        .map(|(i, f)| {
            FieldInfo::new(
                f.name().to_string(),
                f.table_id(),
                f.column_id(),
                f.datatype().clone(),
                format.format_for(i),
            )
        })
        .collect()
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("title"),
        text("description"),
        int8("start_time"),
        int8("end_time"),
        text("location"),
        text("meeting_link"),
        int8("max_attendees"),
        text("status"),
        text("created_by"),
        int8("created_at"),
        int8("updated_at"),
        text("calendar_event_id"),
    ]
}

fn attendee_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("booking_id"),
        text("email"),
        text("full_name"),
        text("user_id"),
        text("status"),
    ]
}

fn dashboard_schema() -> Vec<FieldInfo> {
    vec![int8("upcoming"), int8("today"), int8("total")]
}

fn booking_stats_schema() -> Vec<FieldInfo> {
    vec![
        int8("total"),
        int8("scheduled"),
        int8("cancelled"),
        int8("completed"),
        int8("upcoming"),
    ]
}

fn user_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("email"),
        text("full_name"),
        text("avatar_url"),
        text("role"),
        int8("created_at"),
        int8("updated_at"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text("id"), int8("start_time"), int8("end_time")]
}

fn open_slots_schema() -> Vec<FieldInfo> {
    vec![int8("start_time"), int8("end_time")]
}

fn invite_schema() -> Vec<FieldInfo> {
    vec![text("booking_id"), text("ics")]
}

fn encode_booking(encoder: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.title)?;
    encoder.encode_field(&b.description)?;
    encoder.encode_field(&b.span.start)?;
    encoder.encode_field(&b.span.end)?;
    encoder.encode_field(&b.location)?;
    encoder.encode_field(&b.meeting_link)?;
    encoder.encode_field(&i64::from(b.max_attendees))?;
    encoder.encode_field(&b.status.as_str().to_string())?;
    encoder.encode_field(&b.created_by.to_string())?;
    encoder.encode_field(&b.created_at)?;
    encoder.encode_field(&b.updated_at)?;
    encoder.encode_field(&b.calendar_event_id)?;
    Ok(())
}

fn booking_rows(bookings: Vec<Booking>, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(with_format(booking_schema(), format));
    let rows: Vec<PgWireResult<_>> = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_booking(&mut encoder, b)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Command tag for a write, or the written row for `RETURNING *`.
fn written(tag: &str, booking: Booking, returning: bool, format: &Format) -> PgWireResult<Response> {
    if returning {
        booking_rows(vec![booking], format)
    } else {
        Ok(Response::Execution(Tag::new(tag).with_rows(1)))
    }
}

fn attendee_rows(attendees: Vec<Attendee>, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(with_format(attendee_schema(), format));
    let rows: Vec<PgWireResult<_>> = attendees
        .into_iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.booking_id.to_string())?;
            encoder.encode_field(&a.email)?;
            encoder.encode_field(&a.full_name)?;
            encoder.encode_field(&a.user_id.map(|u| u.to_string()))?;
            encoder.encode_field(&a.status.as_str().to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn user_rows(users: Vec<UserProfile>, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(with_format(user_schema(), format));
    let rows: Vec<PgWireResult<_>> = users
        .into_iter()
        .map(|u| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&u.id.to_string())?;
            encoder.encode_field(&u.email)?;
            encoder.encode_field(&u.full_name)?;
            encoder.encode_field(&u.avatar_url)?;
            encoder.encode_field(&u.role.as_str().to_string())?;
            encoder.encode_field(&u.created_at)?;
            encoder.encode_field(&u.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn single_row(schema: Arc<Vec<FieldInfo>>, mut encoder: DataRowEncoder) -> Response {
    let row = encoder.take_row();
    Response::Query(QueryResponse::new(schema, stream::iter(vec![Ok(row)])))
}

#[async_trait]
impl SimpleQueryHandler for KairosHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.deliver_notifications(client).await?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run(client, cmd, &Format::UnifiedText).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct KairosQueryParser;

#[async_trait]
impl QueryParser for KairosQueryParser {
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

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        let fields = result_schema(stmt);
        Ok(match column_format {
            Some(format) => with_format(fields, format),
            None => fields,
        })
    }
}

/// Row description for a statement before its parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let words: Vec<&str> = upper.split_whitespace().collect();
    if words.first() != Some(&"SELECT") {
        return if words.contains(&"RETURNING") {
            booking_schema()
        } else {
            vec![]
        };
    }
    let table = words
        .iter()
        .position(|w| *w == "FROM")
        .and_then(|i| words.get(i + 1))
        .map(|t| t.trim_end_matches(';'));
    match table {
        Some("BOOKINGS") | Some("MY_BOOKINGS") => booking_schema(),
        Some("ATTENDEES") => attendee_schema(),
        Some("DASHBOARD") => dashboard_schema(),
        Some("BOOKING_STATS") => booking_stats_schema(),
        Some("USERS") => user_schema(),
        Some("AVAILABILITY") => availability_schema(),
        Some("OPEN_SLOTS") => open_slots_schema(),
        Some("INVITES") => invite_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl ExtendedQueryHandler for KairosHandler {
    type Statement = String;
    type QueryParser = KairosQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(&self, client: &mut C, portal: &Portal<Self::Statement>, _max_rows: usize) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.deliver_notifications(client).await?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(client, cmd, &portal.result_column_format)
            .await?
            .pop()
            .ok_or_else(|| user_err("XX000", "statement produced no result".into()))
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
        Ok(DescribePortalResponse::new(with_format(
            result_schema(&target.statement.statement),
            &target.result_column_format,
        )))
    }
}

/// Byte ranges and indexes of the `$N` placeholders outside quoted
/// literals and quoted identifiers.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves the state unchanged.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let digits = bytes[i + 1..].iter().take_while(|d| d.is_ascii_digit()).count();
                if let Ok(n) = sql[i + 1..i + 1 + digits].parse::<usize>() {
                    found.push((i, i + 1 + digits, n));
                    i += 1 + digits;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, _, n)| n).max().unwrap_or(0)
}

/// Inline bound text parameters as quoted literals in one pass over the
/// statement. Inlined values are never rescanned.
fn inline_params(sql: &str, params: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (start, end, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..start]);
        match param {
            Some(value) => {
                out.push('\'');
                out.push_str(&value.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    inline_params(&portal.statement.statement, &params)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct KairosFactory {
    handler: Arc<KairosHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<KairosAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl KairosFactory {
    pub fn new(engine: Arc<Engine>, sessions: Arc<SessionManager>, password: String) -> Self {
        Self {
            handler: Arc::new(KairosHandler::new(engine, sessions)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                KairosAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for KairosFactory {
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
    sessions: Arc<SessionManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = KairosFactory::new(engine, sessions, password);
    pgwire::tokio::process_socket(socket, tls, Arc::new(factory)).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_err(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::PastStart
        | EngineError::InvertedRange
        | EngineError::DurationExceeded
        | EngineError::NoAttendees
        | EngineError::InvalidField { .. }
        | EngineError::OutsideAvailability => "22023",
        EngineError::NotScheduled(_) => "55000",
        EngineError::Conflict(_) => "23P01",
        EngineError::NotOwner | EngineError::AdminOnly => "42501",
        EngineError::NotFound(_) => "02000",
        EngineError::Storage(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::Storage(source) = &e {
        warn!("storage failure: {source}");
    }
    user_err(engine_sqlstate(&e), e.to_string())
}

fn session_err(e: SessionError) -> PgWireError {
    let code = match &e {
        SessionError::NotSignedIn | SessionError::InvalidIdentity(_) => "28000",
        _ => "XX000",
    };
    user_err(code, e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_err("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM bookings"), 0);
        assert_eq!(count_params("INSERT INTO cancellations (booking_id) VALUES ($1)"), 1);
        assert_eq!(count_params("SELECT * FROM open_slots WHERE start_time >= $2 AND end_time <= $10"), 10);
    }

    #[test]
    fn placeholders_inside_literals_are_text() {
        assert_eq!(count_params("SELECT * FROM bookings WHERE title = '$3' AND id = $1"), 1);
        assert_eq!(count_params(r#"SELECT "$2" FROM bookings"#), 0);
    }

    #[test]
    fn inlined_values_are_not_rescanned() {
        let sql = "INSERT INTO bookings (title, description, start_time) VALUES ($1, $2, $3)";
        let params = vec![
            Some("Budget".to_string()),
            Some("Approve the $1M plan, it's $3 per seat".to_string()),
            Some("1750000000000".to_string()),
        ];
        assert_eq!(
            inline_params(sql, &params),
            "INSERT INTO bookings (title, description, start_time) \
             VALUES ('Budget', 'Approve the $1M plan, it''s $3 per seat', '1750000000000')"
        );
    }

    #[test]
    fn null_and_unbound_placeholders() {
        let params = vec![None];
        assert_eq!(inline_params("VALUES ($1, $2, 'a''$1')", &params), "VALUES (NULL, $2, 'a''$1')");
        assert_eq!(inline_params("VALUES ($10)", &[Some("x".into())]), "VALUES ($10)");
    }

    #[test]
    fn inlined_statement_still_parses() {
        let sql = "INSERT INTO bookings (title, description, start_time, end_time, attendees) \
                   VALUES ($1, $2, $3, $4, $5) RETURNING *";
        let params = vec![
            Some("Budget".to_string()),
            Some("Approve the $1M plan".to_string()),
            Some("4102000000000".to_string()),
            Some("4102001800000".to_string()),
            Some(r#"[{"email":"a@x.com","full_name":"O'Neil"}]"#.to_string()),
        ];
        match sql::parse_sql(&inline_params(sql, &params)).unwrap() {
            Command::CreateBooking { draft, returning } => {
                assert!(returning);
                assert_eq!(draft.description.as_deref(), Some("Approve the $1M plan"));
                assert_eq!(draft.attendees[0].full_name, "O'Neil");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn describes_result_by_table() {
        assert_eq!(result_schema("SELECT * FROM bookings WHERE id = $1").len(), 13);
        assert_eq!(result_schema("select * from my_bookings").len(), 13);
        assert_eq!(result_schema("SELECT * FROM dashboard;").len(), 3);
        assert_eq!(result_schema("SELECT * FROM open_slots WHERE start_time >= $1").len(), 2);
        assert_eq!(result_schema("INSERT INTO cancellations (booking_id) VALUES ($1) RETURNING *").len(), 13);
        assert!(result_schema("INSERT INTO cancellations (booking_id) VALUES ($1)").is_empty());
    }

    #[test]
    fn result_format_follows_request() {
        let fields = with_format(booking_schema(), &Format::UnifiedBinary);
        assert!(fields.iter().all(|f| f.format() == FieldFormat::Binary));
        assert_eq!(fields[3].name(), "start_time");
        assert_eq!(fields[3].datatype(), &Type::INT8);

        let fields = with_format(open_slots_schema(), &Format::Individual(vec![0, 1]));
        assert_eq!(fields[0].format(), FieldFormat::Text);
        assert_eq!(fields[1].format(), FieldFormat::Binary);
    }

    #[test]
    fn payload_carries_event_and_id() {
        let id = Ulid::new();
        let payload: serde_json::Value = serde_json::from_str(&event_payload(&BookingEvent::Deleted { id })).unwrap();
        assert_eq!(payload["event"], "deleted");
        assert_eq!(payload["booking_id"], id.to_string());

        let payload: serde_json::Value = serde_json::from_str(&event_payload(&BookingEvent::NotificationSent {
            booking_id: id,
            kind: NotificationKind::Created,
            success: true,
            detail: "1/1".into(),
        }))
        .unwrap();
        assert_eq!(payload["kind"], "booking_created");
        assert_eq!(payload["success"], true);
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        assert_eq!(engine_sqlstate(&EngineError::PastStart), "22023");
        assert_eq!(engine_sqlstate(&EngineError::NotScheduled(BookingStatus::Completed)), "55000");
        assert_eq!(engine_sqlstate(&EngineError::Conflict(Ulid::new())), "23P01");
        assert_eq!(engine_sqlstate(&EngineError::NotOwner), "42501");
        assert_eq!(engine_sqlstate(&EngineError::NotFound(Ulid::new())), "02000");
    }
}
