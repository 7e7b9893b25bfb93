//! Single-host connection.
//!
//! One socket, one sequence counter and one lock. Every exchange (or
//! pipeline) holds the lock from the first byte sent to the last byte
//! read. A socket failure tears the connection down on the spot; the
//! error that reports it is transient, which is what the failover layer
//! reacts to.

#![allow(clippy::cast_possible_truncation)]

use std::fmt;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use mariadb_core::error::{
    BatchError, BatchOutcome, ConnectionError, ConnectionErrorKind, Error, Result, ServerError,
};
use mariadb_core::{IsolationLevel, Value};
use parking_lot::{Mutex, MutexGuard};

use crate::column::{ColumnDefinition, DecodeContext, WireFormat};
use crate::command::{Command, sql_excerpt};
use crate::completion::{Completion, OkResult, ResultSet};
use crate::config::{Configuration, HostAddress};
use crate::context::{SessionContext, SessionState, StateFlags};
use crate::handshake::{Established, Handshake, ServerVersion};
use crate::prepare::{PrepareCache, PreparedStatement};
use crate::protocol::prepared::{
    LAST_PREPARED_STATEMENT, build_stmt_close_packet, build_stmt_prepare_packet,
};
use crate::protocol::{
    CommandCode, MAX_PACKET_SIZE, PacketIo, PacketReader, PacketWriter, build_stmt_execute_packet,
    parse_stmt_prepare_ok, server_status,
};
use crate::replay::ReplayBuffer;
use crate::row::Row;
use crate::tls::NetStream;

/// Source of connection ids; prepared statement handles remember theirs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Streaming result sets are matched to their connection by this token.
static NEXT_STREAM_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Longest SQL excerpt attached to server errors.
const ERROR_SQL_MAX: usize = 1024;

/// Per-call execution options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Rows fetched per round of a streaming result set; 0 reads the
    /// whole result set at once. Ignored inside pipelines.
    pub fetch_size: usize,
}

impl ExecuteOptions {
    pub fn streaming(fetch_size: usize) -> Self {
        Self { fetch_size }
    }
}

/// A result set whose rows are still on the wire.
#[derive(Debug)]
struct PendingStream {
    token: u64,
    columns: Arc<[ColumnDefinition]>,
    ctx: DecodeContext,
    fetch_size: usize,
    sql: Option<String>,
}

/// What to read back for one planned command.
#[derive(Debug)]
enum Expect {
    /// Text or binary results
    Results(WireFormat),
    /// A prepare response, then the results of executing it (id 0xFFFFFFFF)
    PrepareThenResults,
    /// A prepare response only
    Prepared,
    /// Nothing on the wire; the statement was already cached
    Cached(PreparedStatement),
}

/// A command turned into payloads, ready to send.
#[derive(Debug)]
struct Planned {
    payloads: Vec<Vec<u8>>,
    expect: Expect,
    sql: Option<String>,
    /// Statement whose use count is held until the response is read
    statement: Option<PreparedStatement>,
}

struct Inner {
    io: PacketIo<NetStream>,
    session: SessionContext,
    cache: PrepareCache,
    /// Statements to close before the next command
    pending_close: Vec<u32>,
    streaming: Option<PendingStream>,
    replay: ReplayBuffer,
}

/// An authenticated session with one server.
pub struct Connection {
    id: u64,
    config: Arc<Configuration>,
    host: HostAddress,
    thread_id: u32,
    server_version: ServerVersion,
    inner: Mutex<Inner>,
    /// Second handle on the socket, for teardown without the lock
    socket: TcpStream,
    closed: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("thread_id", &self.thread_id)
            .field("server_version", &self.server_version.raw)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn connect_error(host: &HostAddress, e: std::io::Error) -> Error {
    let kind = match e.kind() {
        std::io::ErrorKind::ConnectionRefused => ConnectionErrorKind::Refused,
        std::io::ErrorKind::NotFound => ConnectionErrorKind::DnsResolution,
        _ => ConnectionErrorKind::Connect,
    };
    Error::Connection(ConnectionError {
        kind,
        message: format!("failed to connect to {}: {}", host, e),
        source: Some(Box::new(e)),
    })
}

/// A socket lost before the session exists is a connect failure, not a
/// transient one.
fn establish_error(host: &HostAddress, err: Error) -> Error {
    match err {
        Error::Connection(e) if e.kind.is_transient() => Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Connect,
            message: format!("connection to {} lost during setup: {}", host, e.message),
            source: e.source,
        }),
        other => other,
    }
}

fn server_error(packet: &[u8], sql: Option<&str>) -> Error {
    match PacketReader::new(packet).parse_err_packet() {
        Some(err) => Error::Server(ServerError {
            code: err.error_code,
            sqlstate: err.sql_state,
            message: err.error_message,
            sql: sql.map(|s| sql_excerpt(s, ERROR_SQL_MAX)),
        }),
        None => Error::protocol("malformed error packet"),
    }
}

fn text_payload(command: &Command) -> Option<Vec<u8>> {
    let (code, body): (CommandCode, &[u8]) = match command {
        Command::Query(sql) => (CommandCode::Query, sql.as_bytes()),
        Command::Ping => (CommandCode::Ping, &[]),
        Command::InitDb(db) => (CommandCode::InitDb, db.as_bytes()),
        Command::ResetConnection => (CommandCode::ResetConnection, &[]),
        _ => return None,
    };
    let mut w = PacketWriter::command(code);
    w.write_bytes(body);
    Some(w.into_bytes())
}

impl Connection {
    /// Open a socket to `host`, authenticate and set the session up.
    #[tracing::instrument(level = "debug", skip(config, host), fields(host = %host))]
    pub fn connect(config: Arc<Configuration>, host: HostAddress) -> Result<Self> {
        let stream = config
            .socket_factory
            .connect(&host, config.connect_timeout)
            .map_err(|e| connect_error(&host, e))?;
        stream
            .set_read_timeout(Some(config.connect_timeout))
            .map_err(|e| connect_error(&host, e))?;
        stream
            .set_write_timeout(Some(config.connect_timeout))
            .map_err(|e| connect_error(&host, e))?;
        let socket = stream.try_clone().map_err(|e| connect_error(&host, e))?;

        let io = PacketIo::new(NetStream::Plain(stream))
            .with_trace(config.log_packets, config.max_packet_log_bytes);
        let Established { io, session } = Handshake::new(&config, &host)
            .run(io)
            .map_err(|e| establish_error(&host, e))?;

        socket
            .set_read_timeout(config.socket_timeout)
            .map_err(|e| connect_error(&host, e))?;
        socket
            .set_write_timeout(config.socket_timeout)
            .map_err(|e| connect_error(&host, e))?;

        let cache = if config.cache_prep_stmts {
            PrepareCache::new(config.prep_stmt_cache_size)
        } else {
            PrepareCache::disabled()
        };
        let conn = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            thread_id: session.thread_id(),
            server_version: session.server_version().clone(),
            inner: Mutex::new(Inner {
                io,
                session,
                cache,
                pending_close: Vec::new(),
                streaming: None,
                replay: ReplayBuffer::new(config.transaction_replay_size),
            }),
            socket,
            closed: AtomicBool::new(false),
            host,
            config,
        };
        conn.setup_session().map_err(|e| establish_error(&conn.host, e))?;
        tracing::debug!(
            host = %conn.host,
            thread_id = conn.thread_id,
            version = %conn.server_version.raw,
            "connected"
        );
        Ok(conn)
    }

    fn setup_session(&self) -> Result<()> {
        let mut assignments = vec![format!("autocommit={}", u8::from(self.config.autocommit))];
        if let Some(offset) = self.config.timezone {
            assignments.push(format!("time_zone='{}'", offset));
        }
        self.query(&format!("SET {}", assignments.join(",")))?;

        if let Some(level) = self.config.isolation {
            self.query(&format!(
                "SET SESSION TRANSACTION ISOLATION LEVEL {}",
                level.as_sql()
            ))?;
            self.inner.lock().session.init_isolation(Some(level));
        }

        let max = self
            .query("SELECT @@max_allowed_packet")?
            .into_iter()
            .find_map(|c| c.into_result_set().ok())
            .and_then(|mut rs| rs.next_row())
            .and_then(|row| row.get::<i64>(0).ok());
        if let Some(max) = max.and_then(|m| usize::try_from(m).ok()).filter(|m| *m > 0) {
            self.inner.lock().io.set_max_allowed_packet(max);
        }
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host(&self) -> &HostAddress {
        &self.host
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn server_version(&self) -> &ServerVersion {
        &self.server_version
    }

    pub fn config(&self) -> &Arc<Configuration> {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        if self.is_closed() {
            return Err(Error::state("connection is closed"));
        }
        let inner = self.inner.lock();
        // closed by abort() while waiting
        if self.is_closed() {
            return Err(Error::state("connection is closed"));
        }
        Ok(inner)
    }

    /// Run one command and read all of its results.
    pub fn execute(&self, command: &Command, options: &ExecuteOptions) -> Result<Vec<Completion>> {
        let mut inner = self.lock()?;
        let result = self.execute_locked(&mut inner, command, options);
        self.check_failure(&mut inner, result)
    }

    /// Text query with default options.
    pub fn query(&self, sql: &str) -> Result<Vec<Completion>> {
        self.execute(&Command::query(sql), &ExecuteOptions::default())
    }

    /// Prepare through the cache.
    pub fn prepare(&self, sql: &str) -> Result<PreparedStatement> {
        self.execute(&Command::Prepare(sql.to_string()), &ExecuteOptions::default())?
            .into_iter()
            .next()
            .ok_or_else(|| Error::protocol("prepare produced no response"))?
            .into_prepared()
    }

    /// Execute SQL through a prepared statement with binary parameters.
    pub fn execute_sql(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Completion>> {
        self.execute(&Command::execute(sql, params), &ExecuteOptions::default())
    }

    pub fn ping(&self) -> Result<()> {
        self.execute(&Command::Ping, &ExecuteOptions::default()).map(|_| ())
    }

    /// Ping with a temporary socket timeout.
    pub fn is_valid(&self, timeout: Duration) -> bool {
        if self.is_closed() {
            return false;
        }
        let restore = self.inner.lock().session.network_timeout().or(self.config.socket_timeout);
        let timeout = Some(timeout).filter(|t| !t.is_zero());
        if self.socket.set_read_timeout(timeout).is_err() {
            return false;
        }
        let valid = self.ping().is_ok();
        let _ = self.socket.set_read_timeout(restore);
        valid
    }

    /// Send every command before reading any response.
    ///
    /// On failure every response still expected is drained, secondary
    /// errors are swallowed and a [`BatchError`] reports the outcome of
    /// each command; the cause is the first real error.
    pub fn execute_pipeline(&self, commands: &[Command]) -> Result<Vec<Vec<Completion>>> {
        let mut inner = self.lock()?;
        let result = self.pipeline_locked(&mut inner, commands);
        self.check_failure(&mut inner, result)
    }

    /// Close a statement that is not in the cache.
    pub fn close_prepare(&self, statement: &PreparedStatement) -> Result<()> {
        if !statement.is_valid_on(self.id) || statement.is_cached() {
            return Ok(());
        }
        let mut inner = self.lock()?;
        if let Some(id) = statement.mark_closed() {
            inner.pending_close.push(id);
        }
        let result = self.flush_pending_close(&mut inner);
        self.check_failure(&mut inner, result)
    }

    /// Read the next batch of a streaming result set.
    pub(crate) fn fetch_more(&self, rs: &mut ResultSet) -> Result<()> {
        let mut inner = self.lock()?;
        let current = inner.streaming.as_ref().map(|p| p.token);
        if current.is_none() || current != rs.stream_token() {
            return Err(Error::state(
                "streaming result set was discarded by a later command",
            ));
        }
        let result = self.fetch_locked(&mut inner, rs);
        self.check_failure(&mut inner, result)
    }

    fn fetch_locked(&self, inner: &mut Inner, rs: &mut ResultSet) -> Result<()> {
        let Some(pending) = inner.streaming.take() else {
            return Ok(());
        };
        let (rows, end) = self.read_rows(
            inner,
            &pending.columns,
            pending.ctx,
            pending.fetch_size,
            pending.sql.as_deref(),
        )?;
        rs.extend(rows);
        match end {
            Some((warnings, status)) => {
                rs.finish(warnings, status);
                self.skip_results(inner)?;
            }
            None => inner.streaming = Some(pending),
        }
        Ok(())
    }

    /// Tear down on socket-level failures; the socket is unusable after one.
    fn check_failure<T>(&self, inner: &mut Inner, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_transient() || matches!(e, Error::Protocol(_)) {
                tracing::warn!(host = %self.host, thread_id = self.thread_id, error = %e, "closing connection");
                self.closed.store(true, Ordering::Release);
                inner.streaming = None;
                inner.cache.clear();
                inner.pending_close.clear();
                let _ = self.socket.shutdown(Shutdown::Both);
            }
        }
        result
    }

    fn execute_locked(
        &self,
        inner: &mut Inner,
        command: &Command,
        options: &ExecuteOptions,
    ) -> Result<Vec<Completion>> {
        self.discard_stream(inner)?;
        self.flush_pending_close(inner)?;
        let planned = self.plan(inner, command)?;
        let mut result = self.send(inner, &planned);
        if result.is_ok() {
            result = inner.io.flush();
        }
        let result = result.and_then(|()| self.read_planned(inner, &planned, options.fetch_size));
        self.release(inner, &planned);
        let completions = result?;
        self.after_success(inner, command);
        Ok(completions)
    }

    fn pipeline_locked(&self, inner: &mut Inner, commands: &[Command]) -> Result<Vec<Vec<Completion>>> {
        self.discard_stream(inner)?;
        self.flush_pending_close(inner)?;
        let batch_error = |failed: usize, succeeded: usize, cause: Error| {
            let outcomes = (0..commands.len())
                .map(|i| match i {
                    i if i == failed => BatchOutcome::Failed,
                    i if i < succeeded => BatchOutcome::Succeeded,
                    _ => BatchOutcome::Discarded,
                })
                .collect();
            Error::Batch(BatchError {
                outcomes,
                cause: Box::new(cause),
            })
        };

        if !self.config.pipelining {
            let mut results = Vec::with_capacity(commands.len());
            for (i, command) in commands.iter().enumerate() {
                match self.execute_locked(inner, command, &ExecuteOptions::default()) {
                    Ok(completions) => results.push(completions),
                    Err(e) => return Err(batch_error(i, i, e)),
                }
            }
            return Ok(results);
        }

        let mut planned = Vec::with_capacity(commands.len());
        for (i, command) in commands.iter().enumerate() {
            match self.plan(inner, command) {
                Ok(p) => planned.push(p),
                Err(e) => {
                    for p in &planned {
                        self.release(inner, p);
                    }
                    // nothing was sent
                    return Err(batch_error(i, 0, e));
                }
            }
        }

        let mut sent = 0;
        let mut send_error = None;
        for p in &planned {
            if let Err(e) = self.send(inner, p) {
                send_error = Some(e);
                break;
            }
            sent += 1;
        }
        if send_error.is_none() {
            if let Err(e) = inner.io.flush() {
                send_error = Some(e);
                sent = 0;
            }
        }
        if let Some(e) = send_error {
            for p in &planned {
                self.release(inner, p);
            }
            return Err(batch_error(sent, 0, e));
        }

        let mut results = Vec::with_capacity(commands.len());
        let mut failure: Option<(usize, Error)> = None;
        let mut socket_lost = false;
        for (i, (command, p)) in commands.iter().zip(&planned).enumerate() {
            if failure.is_some() {
                if !socket_lost {
                    if let Err(e) = self.read_planned(inner, p, 0) {
                        tracing::debug!(index = i, error = %e, "error draining pipeline");
                        socket_lost = e.is_transient();
                    }
                }
                continue;
            }
            match self.read_planned(inner, p, 0) {
                Ok(completions) => {
                    self.after_success(inner, command);
                    results.push(completions);
                }
                Err(e) => {
                    socket_lost = e.is_transient();
                    failure = Some((i, e));
                }
            }
        }
        for p in &planned {
            self.release(inner, p);
        }
        match failure {
            None => Ok(results),
            Some((i, e)) => Err(batch_error(i, i, e)),
        }
    }

    /// Turn a command into payloads. Statement cache misses on servers
    /// that cannot pipeline a prepare are prepared here, synchronously.
    fn plan(&self, inner: &mut Inner, command: &Command) -> Result<Planned> {
        let (sql, params) = match command {
            Command::Execute { sql, params } => (sql.as_str(), params.as_slice()),
            Command::ExecuteStatement { statement, params } => {
                if statement.is_valid_on(self.id) {
                    // uncached handles belong to the caller and are never closed here
                    let held = statement.is_cached().then(|| {
                        statement.acquire();
                        statement.clone()
                    });
                    return Ok(Planned {
                        payloads: vec![build_stmt_execute_packet(statement.statement_id(), params)],
                        expect: Expect::Results(WireFormat::Binary),
                        sql: Some(statement.sql().to_string()),
                        statement: held,
                    });
                }
                // prepared on an earlier session
                (statement.sql(), params.as_slice())
            }
            Command::Prepare(sql) => {
                let db = inner.session.database().map(str::to_string);
                if let Some(stmt) = inner.cache.get(db.as_deref(), sql) {
                    let _ = stmt.release();
                    return Ok(Planned {
                        payloads: Vec::new(),
                        expect: Expect::Cached(stmt),
                        sql: Some(sql.clone()),
                        statement: None,
                    });
                }
                return Ok(Planned {
                    payloads: vec![build_stmt_prepare_packet(sql)],
                    expect: Expect::Prepared,
                    sql: Some(sql.clone()),
                    statement: None,
                });
            }
            other => {
                let payload = text_payload(other)
                    .ok_or_else(|| Error::state("command has no text form"))?;
                return Ok(Planned {
                    payloads: vec![payload],
                    expect: Expect::Results(WireFormat::Text),
                    sql: other.sql().map(str::to_string),
                    statement: None,
                });
            }
        };

        let db = inner.session.database().map(str::to_string);
        if let Some(stmt) = inner.cache.get(db.as_deref(), sql) {
            return Ok(Planned {
                payloads: vec![build_stmt_execute_packet(stmt.statement_id(), params)],
                expect: Expect::Results(WireFormat::Binary),
                sql: Some(sql.to_string()),
                statement: Some(stmt),
            });
        }
        if self.config.pipelining && inner.session.is_mariadb() {
            return Ok(Planned {
                payloads: vec![
                    build_stmt_prepare_packet(sql),
                    build_stmt_execute_packet(LAST_PREPARED_STATEMENT, params),
                ],
                expect: Expect::PrepareThenResults,
                sql: Some(sql.to_string()),
                statement: None,
            });
        }

        inner.io.write_command(&build_stmt_prepare_packet(sql))?;
        inner.io.flush()?;
        let stmt = self.read_prepare_response(inner, sql)?;
        self.cache_statement(inner, &stmt);
        stmt.acquire();
        Ok(Planned {
            payloads: vec![build_stmt_execute_packet(stmt.statement_id(), params)],
            expect: Expect::Results(WireFormat::Binary),
            sql: Some(sql.to_string()),
            statement: Some(stmt),
        })
    }

    fn send(&self, inner: &mut Inner, planned: &Planned) -> Result<()> {
        for payload in &planned.payloads {
            inner.io.write_command(payload)?;
        }
        Ok(())
    }

    fn read_planned(&self, inner: &mut Inner, planned: &Planned, fetch_size: usize) -> Result<Vec<Completion>> {
        let sql = planned.sql.as_deref();
        match &planned.expect {
            Expect::Results(format) => self.read_results(inner, *format, sql, fetch_size),
            Expect::Cached(stmt) => Ok(vec![Completion::Prepared(stmt.clone())]),
            Expect::Prepared => {
                let stmt = self.read_prepare_response(inner, sql.unwrap_or_default())?;
                self.cache_statement(inner, &stmt);
                Ok(vec![Completion::Prepared(stmt)])
            }
            Expect::PrepareThenResults => {
                let stmt = match self.read_prepare_response(inner, sql.unwrap_or_default()) {
                    Ok(stmt) => stmt,
                    Err(e) => {
                        if !e.is_transient() {
                            // the execute of the failed prepare answers with an error too
                            if let Err(drain) = self.read_results(inner, WireFormat::Binary, sql, 0) {
                                if drain.is_transient() {
                                    return Err(drain);
                                }
                            }
                        }
                        return Err(e);
                    }
                };
                self.cache_statement(inner, &stmt);
                stmt.acquire();
                let result = self.read_results(inner, WireFormat::Binary, sql, fetch_size);
                self.release_statement(inner, &stmt);
                result
            }
        }
    }

    fn release(&self, inner: &mut Inner, planned: &Planned) {
        if let Some(stmt) = &planned.statement {
            self.release_statement(inner, stmt);
        }
    }

    fn release_statement(&self, inner: &mut Inner, stmt: &PreparedStatement) {
        if let Some(id) = stmt.release() {
            inner.pending_close.push(id);
        }
    }

    fn cache_statement(&self, inner: &mut Inner, stmt: &PreparedStatement) {
        let db = inner.session.database().map(str::to_string);
        let evicted = inner.cache.put(db.as_deref(), stmt);
        inner.pending_close.extend(evicted);
    }

    fn flush_pending_close(&self, inner: &mut Inner) -> Result<()> {
        if inner.pending_close.is_empty() {
            return Ok(());
        }
        for id in std::mem::take(&mut inner.pending_close) {
            tracing::trace!(statement_id = id, "closing prepared statement");
            inner.io.write_command(&build_stmt_close_packet(id))?;
        }
        inner.io.flush()
    }

    fn after_success(&self, inner: &mut Inner, command: &Command) {
        match command {
            Command::ResetConnection => inner.cache.clear(),
            Command::InitDb(db) => inner.session.set_database(db),
            _ => {}
        }
        if !self.config.transaction_replay {
            return;
        }
        if inner.session.in_transaction() {
            inner.replay.record(command);
        } else {
            inner.replay.clear();
        }
    }

    fn read_prepare_response(&self, inner: &mut Inner, sql: &str) -> Result<PreparedStatement> {
        let packet = inner.io.read_packet()?;
        if packet.first() == Some(&0xFF) {
            return Err(server_error(&packet, Some(sql)));
        }
        let ok = parse_stmt_prepare_ok(&packet)
            .ok_or_else(|| Error::protocol("malformed prepare response"))?;
        let params = self.read_definitions(inner, usize::from(ok.num_params))?;
        let columns = self.read_definitions(inner, usize::from(ok.num_columns))?;
        tracing::trace!(statement_id = ok.statement_id, sql = %sql_excerpt(sql, 128), "prepared");
        Ok(PreparedStatement::new(
            ok.statement_id,
            self.id,
            sql.to_string(),
            params,
            columns,
        ))
    }

    fn read_definitions(&self, inner: &mut Inner, count: usize) -> Result<Vec<ColumnDefinition>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let ext = inner.session.extended_type_info();
        let mut defs = Vec::with_capacity(count);
        for _ in 0..count {
            let packet = inner.io.read_packet()?;
            defs.push(ColumnDefinition::parse(&packet, ext)?);
        }
        if !inner.session.deprecate_eof() {
            inner.io.read_packet()?;
        }
        Ok(defs)
    }

    /// Read results until the server clears MORE_RESULTS_EXISTS, or until
    /// a result set is left streaming.
    fn read_results(
        &self,
        inner: &mut Inner,
        format: WireFormat,
        sql: Option<&str>,
        fetch_size: usize,
    ) -> Result<Vec<Completion>> {
        let mut completions = Vec::new();
        loop {
            let packet = inner.io.read_packet()?;
            match packet.first().copied() {
                None => return Err(Error::protocol("empty response packet")),
                Some(0x00) => {
                    let ok = PacketReader::new(&packet)
                        .parse_ok_packet(inner.session.session_track())
                        .ok_or_else(|| Error::protocol("malformed OK packet"))?;
                    inner.session.apply_ok(&ok);
                    completions.push(Completion::Update(OkResult::from(ok)));
                }
                Some(0xFF) => return Err(server_error(&packet, sql)),
                Some(0xFB) => {
                    tracing::warn!(host = %self.host, "refusing LOCAL INFILE request");
                    inner.io.write_packet(&[])?;
                    inner.io.flush()?;
                    continue;
                }
                Some(_) => {
                    let count = PacketReader::new(&packet)
                        .read_lenenc_int()
                        .and_then(|n| usize::try_from(n).ok())
                        .ok_or_else(|| Error::protocol("malformed column count"))?;
                    let columns: Arc<[ColumnDefinition]> = self.read_definitions(inner, count)?.into();
                    let ctx = inner.session.decode_context().with_format(format);
                    let (rows, end) = self.read_rows(inner, &columns, ctx, fetch_size, sql)?;
                    match end {
                        Some((warnings, status)) => {
                            let mut rs = ResultSet::new(columns, rows, None);
                            rs.finish(warnings, status);
                            completions.push(Completion::Rows(rs));
                        }
                        None => {
                            let token = NEXT_STREAM_TOKEN.fetch_add(1, Ordering::Relaxed);
                            inner.streaming = Some(PendingStream {
                                token,
                                columns: columns.clone(),
                                ctx,
                                fetch_size,
                                sql: sql.map(str::to_string),
                            });
                            completions.push(Completion::Rows(ResultSet::new(columns, rows, Some(token))));
                            return Ok(completions);
                        }
                    }
                }
            }
            if !inner.session.more_results() {
                return Ok(completions);
            }
        }
    }

    /// Read rows up to `limit` (0 for all). The second value is the
    /// terminating `(warnings, status)` once the result set ended.
    fn read_rows(
        &self,
        inner: &mut Inner,
        columns: &Arc<[ColumnDefinition]>,
        ctx: DecodeContext,
        limit: usize,
        sql: Option<&str>,
    ) -> Result<(Vec<Row>, Option<(u16, u16)>)> {
        let mut rows = Vec::new();
        loop {
            if limit > 0 && rows.len() >= limit {
                return Ok((rows, None));
            }
            let packet = inner.io.read_packet()?;
            match packet.first().copied() {
                Some(0xFE) if packet.len() < MAX_PACKET_SIZE => {
                    let end = self.parse_end_of_rows(inner, &packet)?;
                    return Ok((rows, Some(end)));
                }
                Some(0xFF) => return Err(server_error(&packet, sql)),
                _ => rows.push(Row::parse(columns.clone(), packet, ctx)?),
            }
        }
    }

    fn parse_end_of_rows(&self, inner: &mut Inner, packet: &[u8]) -> Result<(u16, u16)> {
        if inner.session.deprecate_eof() {
            let ok = PacketReader::new(packet)
                .parse_ok_packet(inner.session.session_track())
                .ok_or_else(|| Error::protocol("malformed end of result set"))?;
            inner.session.apply_ok(&ok);
            Ok((ok.warnings, ok.status_flags))
        } else {
            let eof = PacketReader::new(packet)
                .parse_eof_packet()
                .ok_or_else(|| Error::protocol("malformed EOF packet"))?;
            inner.session.set_status(eof.status_flags);
            Ok((eof.warnings, eof.status_flags))
        }
    }

    /// Fetch and drop the rest of a pending streaming result set.
    fn discard_stream(&self, inner: &mut Inner) -> Result<()> {
        let Some(pending) = inner.streaming.take() else {
            return Ok(());
        };
        let mut skipped = 0usize;
        loop {
            let packet = inner.io.read_packet()?;
            match packet.first().copied() {
                Some(0xFE) if packet.len() < MAX_PACKET_SIZE => {
                    self.parse_end_of_rows(inner, &packet)?;
                    break;
                }
                Some(0xFF) => {
                    tracing::debug!(error = %server_error(&packet, pending.sql.as_deref()), "streaming result ended with an error");
                    let status = inner.session.server_status() & !server_status::SERVER_MORE_RESULTS_EXISTS;
                    inner.session.set_status(status);
                    break;
                }
                _ => skipped += 1,
            }
        }
        tracing::debug!(rows = skipped, "discarded rest of streaming result set");
        self.skip_results(inner)
    }

    /// Drop results left after a streamed result set.
    fn skip_results(&self, inner: &mut Inner) -> Result<()> {
        while inner.session.more_results() {
            match self.read_results(inner, WireFormat::Binary, None, 0) {
                Ok(completions) => {
                    tracing::debug!(count = completions.len(), "discarded trailing results");
                }
                Err(e) if e.is_transient() || matches!(e, Error::Protocol(_)) => return Err(e),
                Err(e) => {
                    tracing::debug!(error = %e, "trailing result failed");
                    let status = inner.session.server_status() & !server_status::SERVER_MORE_RESULTS_EXISTS;
                    inner.session.set_status(status);
                }
            }
        }
        Ok(())
    }

    fn session_command(&self, command: &Command, apply: impl FnOnce(&mut SessionContext)) -> Result<()> {
        let mut inner = self.lock()?;
        let result = self.execute_locked(&mut inner, command, &ExecuteOptions::default());
        self.check_failure(&mut inner, result)?;
        apply(&mut inner.session);
        Ok(())
    }

    pub fn set_autocommit(&self, autocommit: bool) -> Result<()> {
        self.session_command(
            &Command::query(format!("SET autocommit={}", u8::from(autocommit))),
            |s| s.set_autocommit(autocommit),
        )
    }

    pub fn set_database(&self, database: &str) -> Result<()> {
        self.session_command(&Command::InitDb(database.to_string()), |s| {
            s.set_database(database);
        })
    }

    pub fn set_isolation(&self, level: IsolationLevel) -> Result<()> {
        self.session_command(
            &Command::query(format!(
                "SET SESSION TRANSACTION ISOLATION LEVEL {}",
                level.as_sql()
            )),
            |s| s.set_isolation(level),
        )
    }

    /// Fails with a state error inside a transaction.
    pub fn set_read_only(&self, read_only: bool) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::state(
                "cannot change read-only mode inside a transaction",
            ));
        }
        let mode = if read_only { "READ ONLY" } else { "READ WRITE" };
        self.session_command(
            &Command::query(format!("SET SESSION TRANSACTION {}", mode)),
            |s| s.set_read_only(read_only),
        )
    }

    /// Socket read/write timeout; `None` blocks indefinitely.
    pub fn set_network_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let mut inner = self.lock()?;
        let invalid = |e: std::io::Error| Error::config(format!("invalid network timeout: {}", e));
        self.socket.set_read_timeout(timeout).map_err(invalid)?;
        self.socket.set_write_timeout(timeout).map_err(invalid)?;
        inner.session.set_network_timeout(timeout);
        Ok(())
    }

    pub fn autocommit(&self) -> bool {
        self.inner.lock().session.autocommit()
    }

    pub fn database(&self) -> Option<String> {
        self.inner.lock().session.database().map(str::to_string)
    }

    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.inner.lock().session.isolation()
    }

    pub fn read_only(&self) -> bool {
        self.inner.lock().session.read_only()
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.lock().session.in_transaction()
    }

    pub fn server_status(&self) -> u16 {
        self.inner.lock().session.server_status()
    }

    /// Number of statements in the prepare cache.
    pub fn cached_statements(&self) -> usize {
        self.inner.lock().cache.len()
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.lock().session.state()
    }

    /// Apply the settings of `state` that its owner changed.
    pub fn restore_session(&self, state: &SessionState) -> Result<()> {
        let dirty = state.dirty;
        if dirty.contains(StateFlags::AUTOCOMMIT) {
            self.set_autocommit(state.autocommit)?;
        }
        if dirty.contains(StateFlags::DATABASE) {
            if let Some(db) = &state.database {
                self.set_database(db)?;
            }
        }
        if dirty.contains(StateFlags::NETWORK_TIMEOUT) {
            self.set_network_timeout(state.network_timeout)?;
        }
        if dirty.contains(StateFlags::READ_ONLY) {
            self.set_read_only(state.read_only)?;
        }
        if dirty.contains(StateFlags::ISOLATION) {
            if let Some(level) = state.isolation {
                self.set_isolation(level)?;
            }
        }
        Ok(())
    }

    /// Take the commands of the open transaction, leaving an empty log.
    ///
    /// Works on closed connections: that is when the log is needed.
    pub fn take_replay_buffer(&self) -> ReplayBuffer {
        let mut inner = self.inner.lock();
        let fresh = ReplayBuffer::new(self.config.transaction_replay_size);
        std::mem::replace(&mut inner.replay, fresh)
    }

    /// Redo a transaction on this session, in the original order.
    #[tracing::instrument(level = "debug", skip(self, buffer), fields(host = %self.host, commands = buffer.len()))]
    pub fn replay(&self, buffer: ReplayBuffer) -> Result<()> {
        if !buffer.is_clean() {
            return Err(Error::transaction_lost(
                "transaction contained commands that cannot be replayed",
                None,
            ));
        }
        for command in buffer.into_commands() {
            self.execute(&command, &ExecuteOptions::default())?;
        }
        Ok(())
    }

    /// Forget prepared statements and dirty flags; no network traffic.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.cache.clear();
        inner.pending_close.clear();
        inner.session.clear_dirty();
    }

    /// Forced teardown, safe while another thread runs a command.
    ///
    /// An idle connection gets a COM_QUIT. A busy one is killed through a
    /// second connection. The socket is shut down either way.
    pub fn abort(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut inner) = self.inner.try_lock() {
            let _ = inner.io.write_command(&[CommandCode::Quit as u8]);
            let _ = inner.io.flush();
        } else {
            tracing::debug!(host = %self.host, thread_id = self.thread_id, "killing busy connection");
            match Connection::connect(self.config.clone(), self.host.clone()) {
                Ok(side) => {
                    if let Err(e) = side.query(&format!("KILL {}", self.thread_id)) {
                        tracing::warn!(error = %e, "KILL failed");
                    }
                    let _ = side.close();
                }
                Err(e) => tracing::warn!(error = %e, "could not open connection to kill thread"),
            }
        }
        let _ = self.socket.shutdown(Shutdown::Both);
    }

    /// Graceful close; later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        // best effort
        let _ = inner.io.write_command(&[CommandCode::Quit as u8]);
        let _ = inner.io.flush();
        inner.cache.clear();
        inner.streaming = None;
        let _ = self.socket.shutdown(Shutdown::Both);
        tracing::debug!(host = %self.host, thread_id = self.thread_id, "closed");
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeServer, Reply};

    fn connect(server: &FakeServer, config: Configuration) -> Connection {
        Connection::connect(Arc::new(config), server.address()).unwrap()
    }

    #[test]
    fn test_connect_runs_session_setup() {
        let server = FakeServer::start();
        let conn = connect(&server, server.configuration());
        assert!(conn.autocommit());
        assert!(conn.server_version().mariadb);
        let log = server.queries();
        assert!(log.iter().any(|q| q.starts_with("SET autocommit=1")));
        assert!(log.iter().any(|q| q == "SELECT @@max_allowed_packet"));
    }

    #[test]
    fn test_query_rows_and_server_error() {
        let server = FakeServer::start();
        server.on_query("SELECT name", Reply::rows(&["name"], &[&[Some("ada")], &[None]]));
        server.on_query("BROKEN", Reply::error(1064, "42000", "syntax error"));
        let conn = connect(&server, server.configuration());

        let rs = conn.query("SELECT name FROM t").unwrap().remove(0).into_result_set().unwrap();
        let rows = rs.into_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get::<String>(0).unwrap(), "ada");
        assert!(rows[1].is_null(0));

        let err = conn.query("BROKEN").unwrap_err();
        assert_eq!(err.code(), Some(1064));
        assert_eq!(err.sqlstate(), "42000");
        // server errors leave the connection usable
        conn.ping().unwrap();
    }

    #[test]
    fn test_close_is_idempotent() {
        let server = FakeServer::start();
        let conn = connect(&server, server.configuration());
        conn.close().unwrap();
        conn.close().unwrap();
        assert!(matches!(conn.ping(), Err(Error::State(_))));
    }

    #[test]
    fn test_disconnect_tears_down() {
        let server = FakeServer::start();
        server.on_query("SELECT sleep", Reply::Disconnect);
        let conn = connect(&server, server.configuration());
        let err = conn.query("SELECT sleep(10)").unwrap_err();
        assert!(err.is_transient());
        assert!(conn.is_closed());
        assert!(matches!(conn.ping(), Err(Error::State(_))));
    }

    #[test]
    fn test_prepared_execute_uses_cache() {
        let server = FakeServer::start();
        server.on_query("INSERT", Reply::ok(1, 7));
        let conn = connect(&server, server.configuration());
        let sql = "INSERT INTO t VALUES (?)";
        let first = conn.execute_sql(sql, vec![Value::Int(1)]).unwrap();
        assert_eq!(first[0].affected_rows(), 1);
        conn.execute_sql(sql, vec![Value::Int(2)]).unwrap();
        assert_eq!(conn.cached_statements(), 1);
        assert_eq!(server.prepare_count(), 1);
        assert_eq!(server.execute_count(), 2);
    }

    #[test]
    fn test_uncached_statement_is_closed_after_use() {
        let server = FakeServer::start();
        server.on_query("UPDATE", Reply::ok(1, 0));
        let conn = connect(&server, server.configuration().cache_prep_stmts(false));
        conn.execute_sql("UPDATE t SET n = ?", vec![Value::Int(1)]).unwrap();
        conn.ping().unwrap();
        assert_eq!(server.close_count(), 1);
    }

    #[test]
    fn test_explicit_handle_and_close_prepare() {
        let server = FakeServer::start();
        server.on_query("DELETE", Reply::ok(2, 0));
        let conn = connect(&server, server.configuration().cache_prep_stmts(false));
        let stmt = conn.prepare("DELETE FROM t WHERE id = ?").unwrap();
        assert_eq!(stmt.param_count(), 1);
        let done = conn
            .execute(
                &Command::ExecuteStatement {
                    statement: stmt.clone(),
                    params: vec![Value::Int(3)],
                },
                &ExecuteOptions::default(),
            )
            .unwrap();
        assert_eq!(done[0].affected_rows(), 2);
        conn.close_prepare(&stmt).unwrap();
        conn.close_prepare(&stmt).unwrap();
        conn.ping().unwrap();
        assert_eq!(server.close_count(), 1);
    }

    #[test]
    fn test_streaming_result_is_discarded_by_next_command() {
        let server = FakeServer::start();
        let rows: Vec<&[Option<&str>]> = vec![&[Some("1")], &[Some("2")], &[Some("3")]];
        server.on_query("SELECT n", Reply::rows(&["n"], &rows));
        let conn = connect(&server, server.configuration());

        let mut rs = conn
            .execute(&Command::query("SELECT n FROM t"), &ExecuteOptions::streaming(1))
            .unwrap()
            .remove(0)
            .into_result_set()
            .unwrap();
        assert_eq!(rs.len(), 1);
        assert!(rs.is_streaming());
        assert!(rs.fetch_more(&conn).unwrap());
        assert_eq!(rs.len(), 2);

        conn.ping().unwrap();
        assert!(matches!(rs.fetch_more(&conn), Err(Error::State(_))));
    }

    #[test]
    fn test_session_mutators_mark_dirty() {
        let server = FakeServer::start();
        let conn = connect(&server, server.configuration());
        conn.set_autocommit(false).unwrap();
        conn.set_database("shop").unwrap();
        conn.set_isolation(IsolationLevel::ReadCommitted).unwrap();
        let state = conn.session_state();
        assert_eq!(
            state.dirty,
            StateFlags::AUTOCOMMIT | StateFlags::DATABASE | StateFlags::ISOLATION
        );
        assert!(!state.autocommit);
        assert_eq!(state.database.as_deref(), Some("shop"));

        conn.reset();
        assert!(conn.session_state().dirty.is_empty());
    }

    #[test]
    fn test_read_only_rejected_in_transaction() {
        let server = FakeServer::start();
        let conn = connect(&server, server.configuration());
        conn.query("BEGIN").unwrap();
        assert!(conn.in_transaction());
        assert!(matches!(conn.set_read_only(true), Err(Error::State(_))));
        conn.query("COMMIT").unwrap();
        conn.set_read_only(true).unwrap();
        assert!(conn.read_only());
    }

    #[test]
    fn test_replay_buffer_follows_transaction() {
        let server = FakeServer::start();
        server.on_query("INSERT", Reply::ok(1, 0));
        let conn = connect(&server, server.configuration().transaction_replay(true));
        conn.query("BEGIN").unwrap();
        conn.query("INSERT INTO t VALUES (1)").unwrap();
        conn.ping().unwrap();
        let buffer = conn.take_replay_buffer();
        assert_eq!(buffer.len(), 2);

        conn.query("INSERT INTO t VALUES (2)").unwrap();
        conn.query("COMMIT").unwrap();
        assert!(conn.take_replay_buffer().is_empty());
    }

    #[test]
    fn test_abort_idle_connection() {
        let server = FakeServer::start();
        let conn = connect(&server, server.configuration());
        conn.abort();
        assert!(conn.is_closed());
        assert!(!conn.is_valid(Duration::from_millis(100)));
        conn.close().unwrap();
    }

    #[test]
    fn test_abort_busy_connection_kills_thread() {
        let server = FakeServer::start();
        server.on_query("SELECT SLEEP", Reply::Stall(Duration::from_secs(4)));
        let conn = connect(&server, server.configuration());

        std::thread::scope(|s| {
            let busy = s.spawn(|| conn.query("SELECT SLEEP(60)"));
            for _ in 0..200 {
                if server.queries().iter().any(|q| q.starts_with("SELECT SLEEP")) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            conn.abort();
            let err = busy.join().unwrap().unwrap_err();
            assert!(err.is_connection_error(), "{err:?}");
        });

        assert!(conn.is_closed());
        let kill = format!("KILL {}", conn.thread_id());
        assert!(server.queries().contains(&kill));
    }
}
