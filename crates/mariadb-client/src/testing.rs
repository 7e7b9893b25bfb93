//! Scripted in-process server for tests.
//!
//! Speaks enough of the protocol for the client's own paths: greeting,
//! native password authentication (any password is accepted), text
//! queries, prepared statements, ping, init db and quit. Replies are
//! chosen by SQL prefix; unmatched statements answer with an empty OK.
//! Transaction status follows BEGIN / COMMIT / ROLLBACK / autocommit.

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use mariadb_core::error::Result;
use parking_lot::Mutex;

use crate::auth::{generate_nonce, plugins};
use crate::column::{ColumnDefinition, FieldType};
use crate::config::{Configuration, HostAddress};
use crate::protocol::prepared::LAST_PREPARED_STATEMENT;
use crate::protocol::{CommandCode, PacketIo, PacketWriter, capabilities, charset, server_status};
use crate::row::encode_binary_row;

/// Scripted answer to a statement.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok {
        affected_rows: u64,
        last_insert_id: u64,
    },
    /// String columns; `None` is SQL NULL
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
    },
    Error {
        code: u16,
        sqlstate: String,
        message: String,
    },
    /// Close the socket instead of answering
    Disconnect,
    /// Send the header and `rows`, then close the socket before the end
    /// of the result set
    Truncated {
        columns: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
    },
    /// Answer with an empty OK after the delay, or never if the session is
    /// killed first
    Stall(Duration),
}

impl Reply {
    pub fn ok(affected_rows: u64, last_insert_id: u64) -> Self {
        Reply::Ok {
            affected_rows,
            last_insert_id,
        }
    }

    pub fn rows(columns: &[&str], rows: &[&[Option<&str>]]) -> Self {
        Reply::Rows {
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            rows: rows
                .iter()
                .map(|row| row.iter().map(|v| v.map(str::to_string)).collect())
                .collect(),
        }
    }

    pub fn truncated(columns: &[&str], rows: &[&[Option<&str>]]) -> Self {
        match Reply::rows(columns, rows) {
            Reply::Rows { columns, rows } => Reply::Truncated { columns, rows },
            other => other,
        }
    }

    pub fn error(code: u16, sqlstate: &str, message: &str) -> Self {
        Reply::Error {
            code,
            sqlstate: sqlstate.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug)]
struct Rule {
    prefix: String,
    reply: Reply,
    once: bool,
}

#[derive(Debug, Default)]
struct Shared {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<String>>,
    connections: Mutex<HashMap<u32, TcpStream>>,
    next_thread_id: AtomicU32,
    accepted: AtomicUsize,
    prepares: AtomicUsize,
    executes: AtomicUsize,
    closes: AtomicUsize,
    down: AtomicBool,
    stopped: AtomicBool,
}

impl Shared {
    /// Latest rule first, so tests can override earlier ones.
    fn reply_for(&self, sql: &str) -> Option<Reply> {
        let mut rules = self.rules.lock();
        let sql = sql.trim_start();
        let index = rules.iter().rposition(|r| {
            sql.get(..r.prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(&r.prefix))
        })?;
        if rules[index].once {
            Some(rules.remove(index).reply)
        } else {
            Some(rules[index].reply.clone())
        }
    }

    fn kill(&self, thread_id: u32) -> bool {
        match self.connections.lock().remove(&thread_id) {
            Some(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
                true
            }
            None => false,
        }
    }
}

/// A fake server listening on a loopback port.
#[derive(Debug)]
pub struct FakeServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl FakeServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap_or_else(|e| panic!("bind: {}", e));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|e| panic!("local_addr: {}", e));
        let shared = Arc::new(Shared {
            next_thread_id: AtomicU32::new(100),
            ..Shared::default()
        });
        let accept_shared = shared.clone();
        thread::spawn(move || accept_loop(&listener, &accept_shared));
        Self { addr, shared }
    }

    pub fn address(&self) -> HostAddress {
        HostAddress::new(self.addr.ip().to_string(), self.addr.port())
    }

    pub fn replica_address(&self) -> HostAddress {
        HostAddress::replica(self.addr.ip().to_string(), self.addr.port())
    }

    /// Single-host configuration with short timeouts.
    pub fn configuration(&self) -> Configuration {
        Configuration::new()
            .hosts(vec![self.address()])
            .user_password("test", Some("secret".to_string()))
            .connect_timeout(Duration::from_secs(2))
            .socket_timeout(Some(Duration::from_secs(5)))
    }

    /// Answer statements starting with `prefix` (case-insensitive).
    pub fn on_query(&self, prefix: &str, reply: Reply) {
        self.add_rule(prefix, reply, false);
    }

    /// Like [`FakeServer::on_query`], for the next matching statement only.
    pub fn on_query_once(&self, prefix: &str, reply: Reply) {
        self.add_rule(prefix, reply, true);
    }

    fn add_rule(&self, prefix: &str, reply: Reply, once: bool) {
        self.shared.rules.lock().push(Rule {
            prefix: prefix.to_string(),
            reply,
            once,
        });
    }

    /// SQL of every query and statement execution, in arrival order.
    pub fn queries(&self) -> Vec<String> {
        self.shared.log.lock().clone()
    }

    pub fn clear_log(&self) {
        self.shared.log.lock().clear();
    }

    pub fn prepare_count(&self) -> usize {
        self.shared.prepares.load(Ordering::SeqCst)
    }

    pub fn execute_count(&self) -> usize {
        self.shared.executes.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Connections accepted so far, including refused ones.
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// While down, new connections are closed before the greeting.
    pub fn set_down(&self, down: bool) {
        self.shared.down.store(down, Ordering::SeqCst);
    }

    /// Drop every open session.
    pub fn kill_connections(&self) {
        for (_, stream) in self.shared.connections.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.kill_connections();
        // wake the accept loop
        let _ = TcpStream::connect_timeout(&self.addr, Duration::from_millis(200));
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: &TcpListener, shared: &Arc<Shared>) {
    for stream in listener.incoming() {
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Ok(stream) = stream else { continue };
        shared.accepted.fetch_add(1, Ordering::SeqCst);
        if shared.down.load(Ordering::SeqCst) {
            let _ = stream.shutdown(Shutdown::Both);
            continue;
        }
        let thread_id = shared.next_thread_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(handle) = stream.try_clone() {
            shared.connections.lock().insert(thread_id, handle);
        }
        let shared = shared.clone();
        thread::spawn(move || {
            let mut session = Session {
                shared: shared.clone(),
                io: PacketIo::new(stream),
                thread_id,
                autocommit: true,
                in_trans: false,
                statements: HashMap::new(),
                next_statement: 1,
                last_prepared: None,
            };
            if let Err(e) = session.run() {
                tracing::trace!(thread_id, error = %e, "fake session ended");
            }
            shared.connections.lock().remove(&thread_id);
        });
    }
}

struct Session {
    shared: Arc<Shared>,
    io: PacketIo<TcpStream>,
    thread_id: u32,
    autocommit: bool,
    in_trans: bool,
    statements: HashMap<u32, String>,
    next_statement: u32,
    last_prepared: Option<u32>,
}

const SERVER_CAPABILITIES: u64 = capabilities::REQUIRED
    | capabilities::CLIENT_PLUGIN_AUTH
    | capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
    | capabilities::CLIENT_CONNECT_WITH_DB
    | capabilities::CLIENT_CONNECT_ATTRS
    | capabilities::CLIENT_MULTI_STATEMENTS
    | capabilities::CLIENT_PS_MULTI_RESULTS;

impl Session {
    fn run(&mut self) -> Result<()> {
        self.io.write_packet(&self.greeting())?;
        self.io.flush()?;
        self.io.read_packet()?;
        self.write_ok(0, 0)?;

        loop {
            let packet = self.io.read_packet()?;
            let Some(&code) = packet.first() else {
                return Ok(());
            };
            let body = &packet[1..];
            match code {
                c if c == CommandCode::Quit as u8 => return Ok(()),
                c if c == CommandCode::Query as u8 => {
                    let sql = String::from_utf8_lossy(body).into_owned();
                    if !self.answer(&sql, false)? {
                        return Ok(());
                    }
                }
                c if c == CommandCode::Ping as u8
                    || c == CommandCode::InitDb as u8
                    || c == CommandCode::ResetConnection as u8 =>
                {
                    self.write_ok(0, 0)?;
                }
                c if c == CommandCode::StmtPrepare as u8 => {
                    let sql = String::from_utf8_lossy(body).into_owned();
                    self.prepare(sql)?;
                }
                c if c == CommandCode::StmtExecute as u8 => {
                    let id = body
                        .get(..4)
                        .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
                    let id = if id == LAST_PREPARED_STATEMENT {
                        self.last_prepared.unwrap_or(0)
                    } else {
                        id
                    };
                    self.shared.executes.fetch_add(1, Ordering::SeqCst);
                    match self.statements.get(&id).cloned() {
                        Some(sql) => {
                            if !self.answer(&sql, true)? {
                                return Ok(());
                            }
                        }
                        None => {
                            self.write_error(1243, "HY000", "Unknown prepared statement handler")?;
                        }
                    }
                }
                c if c == CommandCode::StmtClose as u8 => {
                    if let Some(b) = body.get(..4) {
                        self.statements.remove(&u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
                    }
                    self.shared.closes.fetch_add(1, Ordering::SeqCst);
                }
                _ => self.write_error(1047, "08S01", "Unknown command")?,
            }
        }
    }

    fn greeting(&self) -> Vec<u8> {
        let seed: Vec<u8> = generate_nonce(20).iter().map(|b| b % 94 + 33).collect();
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string("5.5.5-10.6.12-MariaDB-fake");
        w.write_u32_le(self.thread_id);
        w.write_bytes(&seed[..8]);
        w.write_u8(0);
        w.write_u16_le(SERVER_CAPABILITIES as u16);
        w.write_u8(charset::UTF8MB4_GENERAL_CI);
        w.write_u16_le(server_status::SERVER_STATUS_AUTOCOMMIT);
        w.write_u16_le((SERVER_CAPABILITIES >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(6);
        w.write_u32_le(0);
        w.write_bytes(&seed[8..]);
        w.write_u8(0);
        w.write_null_string(plugins::MYSQL_NATIVE_PASSWORD);
        w.into_bytes()
    }

    fn status(&self) -> u16 {
        let mut status = 0;
        if self.autocommit {
            status |= server_status::SERVER_STATUS_AUTOCOMMIT;
        }
        if self.in_trans {
            status |= server_status::SERVER_STATUS_IN_TRANS;
        }
        status
    }

    fn track_transaction(&mut self, sql: &str) {
        let upper = sql.trim().to_ascii_uppercase();
        if upper.starts_with("BEGIN") || upper.starts_with("START TRANSACTION") {
            self.in_trans = true;
        } else if upper.starts_with("COMMIT") || upper.starts_with("ROLLBACK") {
            self.in_trans = false;
        } else if let Some(value) = upper.strip_prefix("SET AUTOCOMMIT=") {
            self.autocommit = value.starts_with('1');
            if self.autocommit {
                self.in_trans = false;
            }
        } else if !self.autocommit && !upper.starts_with("SET ") && !upper.starts_with("SELECT @@") {
            self.in_trans = true;
        }
    }

    /// Answer a statement; `false` once the socket was dropped.
    fn answer(&mut self, sql: &str, binary: bool) -> Result<bool> {
        self.shared.log.lock().push(sql.to_string());

        if let Some(target) = sql.trim().strip_prefix("KILL ") {
            if let Ok(id) = target.trim().parse() {
                self.shared.kill(id);
            }
            return self.write_ok(0, 0).map(|()| true);
        }

        let reply = self.shared.reply_for(sql).or_else(|| {
            sql.trim()
                .eq_ignore_ascii_case("SELECT @@max_allowed_packet")
                .then(|| Reply::rows(&["@@max_allowed_packet"], &[&[Some("16777216")]]))
        });
        match reply {
            Some(Reply::Disconnect) => {
                self.shared.kill(self.thread_id);
                let _ = self.io.get_ref().shutdown(Shutdown::Both);
                return Ok(false);
            }
            Some(Reply::Error {
                code,
                sqlstate,
                message,
            }) => self.write_error(code, &sqlstate, &message)?,
            Some(Reply::Rows { columns, rows }) => {
                self.track_transaction(sql);
                self.write_rows(&columns, &rows, binary, true)?;
            }
            Some(Reply::Truncated { columns, rows }) => {
                self.write_rows(&columns, &rows, binary, false)?;
                self.shared.kill(self.thread_id);
                let _ = self.io.get_ref().shutdown(Shutdown::Both);
                return Ok(false);
            }
            Some(Reply::Stall(delay)) => {
                let until = Instant::now() + delay;
                while Instant::now() < until
                    && self.shared.connections.lock().contains_key(&self.thread_id)
                {
                    thread::sleep(Duration::from_millis(10));
                }
                self.track_transaction(sql);
                self.write_ok(0, 0)?;
            }
            Some(Reply::Ok {
                affected_rows,
                last_insert_id,
            }) => {
                self.track_transaction(sql);
                self.write_ok(affected_rows, last_insert_id)?;
            }
            None => {
                self.track_transaction(sql);
                self.write_ok(0, 0)?;
            }
        }
        Ok(true)
    }

    fn prepare(&mut self, sql: String) -> Result<()> {
        self.shared.prepares.fetch_add(1, Ordering::SeqCst);
        let id = self.next_statement;
        self.next_statement += 1;
        let params = sql.matches('?').count();
        let columns = match self.shared.rules.lock().iter().rev().find(|r| {
            sql.trim_start()
                .get(..r.prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(&r.prefix))
        }) {
            Some(Rule {
                reply: Reply::Rows { columns, .. } | Reply::Truncated { columns, .. },
                ..
            }) => columns.clone(),
            _ => Vec::new(),
        };

        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        w.write_u32_le(id);
        w.write_u16_le(columns.len() as u16);
        w.write_u16_le(params as u16);
        w.write_u8(0);
        w.write_u16_le(0);
        self.io.write_packet(w.as_bytes())?;
        if params > 0 {
            for _ in 0..params {
                self.io.write_packet(&string_column("?").encode(false))?;
            }
            self.write_eof()?;
        }
        if !columns.is_empty() {
            for name in &columns {
                self.io.write_packet(&string_column(name).encode(false))?;
            }
            self.write_eof()?;
        }
        self.io.flush()?;
        self.statements.insert(id, sql);
        self.last_prepared = Some(id);
        Ok(())
    }

    fn write_ok(&mut self, affected_rows: u64, last_insert_id: u64) -> Result<()> {
        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        w.write_lenenc_int(affected_rows);
        w.write_lenenc_int(last_insert_id);
        w.write_u16_le(self.status());
        w.write_u16_le(0);
        self.io.write_packet(w.as_bytes())?;
        self.io.flush()
    }

    fn write_eof(&mut self) -> Result<()> {
        let mut w = PacketWriter::new();
        w.write_u8(0xFE);
        w.write_u16_le(0);
        w.write_u16_le(self.status());
        self.io.write_packet(w.as_bytes())
    }

    fn write_error(&mut self, code: u16, sqlstate: &str, message: &str) -> Result<()> {
        let mut w = PacketWriter::new();
        w.write_u8(0xFF);
        w.write_u16_le(code);
        w.write_u8(b'#');
        w.write_bytes(sqlstate.as_bytes());
        w.write_bytes(message.as_bytes());
        self.io.write_packet(w.as_bytes())?;
        self.io.flush()
    }

    fn write_rows(
        &mut self,
        columns: &[String],
        rows: &[Vec<Option<String>>],
        binary: bool,
        complete: bool,
    ) -> Result<()> {
        let mut w = PacketWriter::new();
        w.write_lenenc_int(columns.len() as u64);
        self.io.write_packet(w.as_bytes())?;
        for name in columns {
            self.io.write_packet(&string_column(name).encode(false))?;
        }
        self.write_eof()?;
        for row in rows {
            let payload = if binary {
                let values: Vec<Option<Vec<u8>>> = row
                    .iter()
                    .map(|v| {
                        v.as_ref().map(|s| {
                            let mut w = PacketWriter::new();
                            w.write_lenenc_string(s);
                            w.into_bytes()
                        })
                    })
                    .collect();
                encode_binary_row(&values)
            } else {
                let mut w = PacketWriter::new();
                for value in row {
                    match value {
                        Some(s) => w.write_lenenc_string(s),
                        None => w.write_u8(0xFB),
                    }
                }
                w.into_bytes()
            };
            self.io.write_packet(&payload)?;
        }
        if complete {
            self.write_eof()?;
        }
        self.io.flush()
    }
}

fn string_column(name: &str) -> ColumnDefinition {
    ColumnDefinition::new(name, FieldType::VarString)
        .with_charset(u16::from(charset::UTF8MB4_GENERAL_CI))
}
