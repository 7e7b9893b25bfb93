//! Multi-host failover.
//!
//! ```text
//! Connected -> (transient error) -> Reconnecting -> Connected
//!                                                 | Denied (lazy retry)
//!                                                 | Closed (budget exhausted)
//! ```
//!
//! A call that fails with a transient error is retried once on a new
//! connection, after the session settings the application changed are
//! applied again and the open transaction is replayed. A second transient
//! failure is returned as is.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use mariadb_client::context::StateFlags;
use mariadb_client::{
    Command, Completion, Configuration, Connection, ExecuteOptions, HaMode, HostAddress,
    PreparedStatement, ResultSet, SessionState,
};
use mariadb_core::error::{ConnectionErrorKind, Error, Result};
use mariadb_core::{IsolationLevel, Value};
use parking_lot::Mutex;

use crate::deny::DenyList;
use crate::select::{self, Role};

/// Pause between host selection rounds once every host failed.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// One connection slot: the primary, or in replication mode the replica.
#[derive(Debug)]
struct Slot {
    role: Role,
    conn: ArcSwapOption<Connection>,
    /// Earliest time a lost slot is tried again
    next_retry: Mutex<Option<Instant>>,
}

impl Slot {
    fn new(role: Role) -> Self {
        Self {
            role,
            conn: ArcSwapOption::empty(),
            next_retry: Mutex::new(None),
        }
    }

    fn live(&self) -> Option<Arc<Connection>> {
        self.conn.load_full().filter(|c| !c.is_closed())
    }

    fn holds(&self, conn: &Arc<Connection>) -> bool {
        self.conn
            .load()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, conn))
    }
}

/// Result of replacing a lost connection.
enum Recovery {
    /// Session restored; the open transaction, if any, was replayed
    Resumed(Arc<Connection>),
    /// Connected again, but the open transaction is gone
    Lost {
        reason: String,
        cause: Option<Error>,
    },
}

/// A logical connection over one or more hosts.
#[derive(Debug)]
pub struct Failover {
    config: Arc<Configuration>,
    deny: Arc<DenyList>,
    primary: Slot,
    replica: Slot,
    read_only: AtomicBool,
    closed: AtomicBool,
    /// Serializes reconnection
    recovering: Mutex<()>,
}

/// Errors that no other host or later attempt can fix.
fn is_fatal(err: &Error) -> bool {
    match err {
        Error::Connection(e) => matches!(
            e.kind,
            ConnectionErrorKind::Authentication | ConnectionErrorKind::Ssl
        ),
        Error::Server(_) | Error::Config(_) => true,
        _ => false,
    }
}

impl Failover {
    /// Connect using the process-wide deny-list.
    pub fn connect(config: Configuration) -> Result<Self> {
        Self::with_deny_list(config, DenyList::global())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(mode = ?config.ha_mode, hosts = config.hosts.len()))]
    pub fn with_deny_list(config: Configuration, deny: Arc<DenyList>) -> Result<Self> {
        config.validate()?;
        let failover = Self {
            config: Arc::new(config),
            deny,
            primary: Slot::new(Role::Primary),
            replica: Slot::new(Role::Replica),
            read_only: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recovering: Mutex::new(()),
        };

        let budget = failover.config.retries_all_down;
        match failover.connect_role(Role::Primary, budget) {
            Ok(conn) => failover.primary.conn.store(Some(conn)),
            Err(e) if failover.replicated() => {
                // run on a replica until the primary is back
                tracing::warn!(error = %e, "no primary available, using a replica");
                let conn = failover.connect_role(Role::Replica, 0).map_err(|_| e)?;
                failover.replica.conn.store(Some(conn));
                failover.schedule_retry(&failover.primary);
            }
            Err(e) => return Err(e),
        }
        Ok(failover)
    }

    fn replicated(&self) -> bool {
        self.config.ha_mode == HaMode::Replication
    }

    pub fn config(&self) -> &Arc<Configuration> {
        &self.config
    }

    pub fn deny_list(&self) -> &Arc<DenyList> {
        &self.deny
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Host of the connection calls currently go to.
    pub fn current_host(&self) -> Option<HostAddress> {
        self.active_slot()
            .and_then(Slot::live)
            .map(|c| c.host().clone())
    }

    pub fn is_in_transaction(&self) -> bool {
        self.active_slot()
            .and_then(Slot::live)
            .is_some_and(|c| c.in_transaction())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn autocommit(&self) -> Option<bool> {
        self.active_slot().and_then(Slot::live).map(|c| c.autocommit())
    }

    pub fn database(&self) -> Option<String> {
        self.active_slot().and_then(Slot::live).and_then(|c| c.database())
    }

    /// The slot calls go to, ignoring lazy retries.
    fn active_slot(&self) -> Option<&Slot> {
        let wanted = self.wanted();
        if wanted.live().is_some() {
            return Some(wanted);
        }
        let other = self.other(wanted);
        if other.live().is_some() {
            Some(other)
        } else {
            None
        }
    }

    fn wanted(&self) -> &Slot {
        if self.replicated() && self.is_read_only() {
            &self.replica
        } else {
            &self.primary
        }
    }

    fn other(&self, slot: &Slot) -> &Slot {
        match slot.role {
            Role::Primary => &self.replica,
            Role::Replica => &self.primary,
        }
    }

    fn slot_of(&self, conn: &Arc<Connection>) -> &Slot {
        if self.replica.holds(conn) {
            &self.replica
        } else {
            &self.primary
        }
    }

    fn schedule_retry(&self, slot: &Slot) {
        *slot.next_retry.lock() = Some(Instant::now() + self.config.deny_timeout);
    }

    /// Open a connection to a host of `role`, trying every candidate for
    /// `rounds + 1` rounds. Hosts that fail are denied.
    fn connect_role(&self, role: Role, rounds: u32) -> Result<Arc<Connection>> {
        let hosts = select::hosts_for(&self.config, role);
        if hosts.is_empty() {
            return Err(Error::config(format!("no {} host configured", role)));
        }
        let mut last = None;
        for round in 0..=rounds {
            if round > 0 {
                thread::sleep(RETRY_INTERVAL);
            }
            for host in select::candidates(self.config.ha_mode, &hosts, &self.deny) {
                match Connection::connect(self.config.clone(), host.clone()) {
                    Ok(conn) => {
                        self.deny.allow(&host);
                        return Ok(Arc::new(conn));
                    }
                    Err(e) if is_fatal(&e) => return Err(e),
                    Err(e) => {
                        tracing::warn!(host = %host, %role, round, error = %e, "connect failed");
                        self.deny.deny(&host, self.config.deny_timeout);
                        last = Some(e);
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| {
            Error::connection(ConnectionErrorKind::Connect, format!("no {} host available", role))
        }))
    }

    /// Reconnect a lost slot once its retry time has come.
    fn refresh(&self, slot: &Slot, state: Option<&SessionState>) -> Option<Arc<Connection>> {
        if let Some(at) = *slot.next_retry.lock() {
            if Instant::now() < at {
                return None;
            }
        }
        let _guard = self.recovering.lock();
        if let Some(conn) = slot.live() {
            return Some(conn);
        }
        let conn = match self.connect_role(slot.role, 0) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!(role = %slot.role, error = %e, "slot still unavailable");
                self.schedule_retry(slot);
                return None;
            }
        };
        if let Some(state) = state {
            if let Err(e) = conn.restore_session(state) {
                tracing::warn!(host = %conn.host(), error = %e, "restoring session failed");
                self.schedule_retry(slot);
                return None;
            }
        }
        tracing::info!(host = %conn.host(), role = %slot.role, "slot reconnected");
        *slot.next_retry.lock() = None;
        slot.conn.store(Some(conn.clone()));
        Some(conn)
    }

    /// The connection the next call goes to.
    fn current(&self) -> Result<Arc<Connection>> {
        if self.is_closed() {
            return Err(Error::state("connection is closed"));
        }
        let wanted = self.wanted();
        match wanted.conn.load_full() {
            Some(conn) if !conn.is_closed() => return Ok(conn),
            // lost after the last call returned
            Some(conn) if self.config.ha_mode != HaMode::None => {
                return match self.recover(&conn, true)? {
                    Recovery::Resumed(next) => Ok(next),
                    Recovery::Lost { reason, cause } => Err(Error::transaction_lost(reason, cause)),
                };
            }
            Some(_) => return Err(Error::state("connection is closed")),
            None => {}
        }

        let other = self.other(wanted);
        let state = other.live().map(|c| c.session_state());
        if let Some(conn) = self.refresh(wanted, state.as_ref()) {
            return Ok(conn);
        }
        match other.conn.load_full() {
            Some(conn) if !conn.is_closed() => Ok(conn),
            Some(conn) => match self.recover(&conn, true)? {
                Recovery::Resumed(next) => Ok(next),
                Recovery::Lost { reason, cause } => Err(Error::transaction_lost(reason, cause)),
            },
            None => Err(Error::connection(
                ConnectionErrorKind::Connect,
                "no host available",
            )),
        }
    }

    /// Replace `failed`: deny its host, connect again, restore session
    /// settings and replay the open transaction when `replay` allows.
    #[tracing::instrument(level = "debug", skip(self, failed), fields(host = %failed.host()))]
    fn recover(&self, failed: &Arc<Connection>, replay: bool) -> Result<Recovery> {
        let _guard = self.recovering.lock();
        let slot = self.slot_of(failed);
        if let Some(current) = slot.live() {
            if !Arc::ptr_eq(&current, failed) {
                // another caller got here first
                return Ok(Recovery::Resumed(current));
            }
        }

        self.deny.deny(failed.host(), self.config.deny_timeout);
        let state = failed.session_state();
        let in_transaction = failed.in_transaction();
        let buffer = failed.take_replay_buffer();

        let other = self.other(slot).live();
        let rounds = if other.is_some() {
            0
        } else {
            self.config.retries_all_down
        };
        let conn = match self.connect_role(slot.role, rounds) {
            Ok(conn) => conn,
            Err(e) => {
                slot.conn.store(None);
                let Some(fallback) = other else {
                    tracing::error!(error = %e, "every host is down");
                    self.closed.store(true, Ordering::Release);
                    return Err(e);
                };
                tracing::warn!(role = %slot.role, fallback = %fallback.host(), "slot lost, using the other slot");
                self.schedule_retry(slot);
                if in_transaction {
                    return Ok(Recovery::Lost {
                        reason: format!("connection to {} lost inside a transaction", failed.host()),
                        cause: None,
                    });
                }
                if slot.role == Role::Replica {
                    fallback.set_read_only(true)?;
                }
                return Ok(Recovery::Resumed(fallback));
            }
        };
        conn.restore_session(&state)?;
        slot.conn.store(Some(conn.clone()));
        tracing::info!(from = %failed.host(), to = %conn.host(), in_transaction, "failed over");

        if !in_transaction {
            return Ok(Recovery::Resumed(conn));
        }
        if !replay {
            return Ok(Recovery::Lost {
                reason: "connection lost during COMMIT; the transaction outcome is unknown".to_string(),
                cause: None,
            });
        }
        if !self.config.transaction_replay {
            return Ok(Recovery::Lost {
                reason: format!(
                    "connection lost inside a transaction; reconnected to {} but the transaction was rolled back",
                    conn.host()
                ),
                cause: None,
            });
        }
        if !buffer.is_clean() {
            return Ok(Recovery::Lost {
                reason: "connection lost inside a transaction that cannot be replayed".to_string(),
                cause: None,
            });
        }
        match conn.replay(buffer) {
            Ok(()) => Ok(Recovery::Resumed(conn)),
            Err(e) => {
                if !conn.is_closed() {
                    let _ = conn.query("ROLLBACK");
                }
                Ok(Recovery::Lost {
                    reason: format!("transaction replay on {} failed", conn.host()),
                    cause: Some(e),
                })
            }
        }
    }

    /// Run `op`, failing over and retrying once on a transient error.
    fn with_failover<T>(&self, commit: bool, op: impl Fn(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.current()?;
        let err = match op(&conn) {
            Err(e) if e.is_transient() && self.config.ha_mode != HaMode::None => e,
            other => return other,
        };
        // part of the pipeline already ran; running it again is not safe
        let partial = matches!(&err, Error::Batch(b) if b.failed_index() != Some(0));
        tracing::warn!(host = %conn.host(), error = %err, "connection lost");
        match self.recover(&conn, !commit)? {
            Recovery::Lost { reason, cause } => Err(Error::transaction_lost(reason, Some(cause.unwrap_or(err)))),
            Recovery::Resumed(_) if commit || partial => Err(err),
            Recovery::Resumed(next) => op(&next),
        }
    }

    pub fn execute(&self, command: &Command, options: &ExecuteOptions) -> Result<Vec<Completion>> {
        self.with_failover(command.is_commit(), |c| c.execute(command, options))
    }

    pub fn query(&self, sql: &str) -> Result<Vec<Completion>> {
        self.execute(&Command::query(sql), &ExecuteOptions::default())
    }

    pub fn execute_sql(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Completion>> {
        self.execute(&Command::execute(sql, params), &ExecuteOptions::default())
    }

    /// Prepare on the current connection. The handle re-prepares itself
    /// when executed after a failover.
    pub fn prepare(&self, sql: &str) -> Result<PreparedStatement> {
        self.with_failover(false, |c| c.prepare(sql))
    }

    pub fn execute_pipeline(&self, commands: &[Command]) -> Result<Vec<Vec<Completion>>> {
        let commit = commands.iter().any(Command::is_commit);
        self.with_failover(commit, |c| c.execute_pipeline(commands))
    }

    /// Read the next batch of a streaming result set opened through this
    /// handle. Returns `false` once the result set is complete.
    ///
    /// The rows left on a lost connection cannot be fetched again: the
    /// connection is replaced for later calls, and the error is returned.
    pub fn fetch_more(&self, rs: &mut ResultSet) -> Result<bool> {
        if !rs.is_streaming() {
            return Ok(false);
        }
        if self.is_closed() {
            return Err(Error::state("connection is closed"));
        }
        let conn = self
            .active_slot()
            .and_then(Slot::live)
            .ok_or_else(|| Error::state("streaming result set was lost with its connection"))?;
        let err = match rs.fetch_more(&conn) {
            Err(e) if e.is_transient() && self.config.ha_mode != HaMode::None => e,
            other => return other,
        };
        tracing::warn!(host = %conn.host(), error = %err, "connection lost while streaming");
        match self.recover(&conn, true)? {
            Recovery::Lost { reason, cause } => Err(Error::transaction_lost(reason, Some(cause.unwrap_or(err)))),
            Recovery::Resumed(_) => Err(err),
        }
    }

    pub fn ping(&self) -> Result<()> {
        self.with_failover(false, Connection::ping)
    }

    /// A commit whose connection is lost always fails, even when the
    /// reconnection succeeds.
    pub fn commit(&self) -> Result<()> {
        self.execute(&Command::query("COMMIT"), &ExecuteOptions::default())
            .map(|_| ())
    }

    /// A lost connection already rolled the transaction back.
    pub fn rollback(&self) -> Result<()> {
        let conn = self.current()?;
        match conn.query("ROLLBACK") {
            Ok(_) => Ok(()),
            Err(e) if e.is_transient() && self.config.ha_mode != HaMode::None => {
                tracing::debug!(error = %e, "connection lost during ROLLBACK");
                self.recover(&conn, false).map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    pub fn set_autocommit(&self, autocommit: bool) -> Result<()> {
        self.with_failover(false, |c| c.set_autocommit(autocommit))
    }

    pub fn set_database(&self, database: &str) -> Result<()> {
        self.with_failover(false, |c| c.set_database(database))
    }

    pub fn set_isolation(&self, level: IsolationLevel) -> Result<()> {
        self.with_failover(false, |c| c.set_isolation(level))
    }

    pub fn set_network_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.with_failover(false, |c| c.set_network_timeout(timeout))
    }

    /// Switch between the primary and the replica slot.
    ///
    /// Outside replication mode, or with no replica reachable, read-only
    /// mode is enforced by the session instead.
    pub fn set_read_only(&self, read_only: bool) -> Result<()> {
        let previous = self.current()?;
        if previous.in_transaction() {
            return Err(Error::state(
                "cannot switch read-only mode inside a transaction",
            ));
        }
        self.read_only.store(read_only, Ordering::Release);
        let target = match self.current() {
            Ok(target) => target,
            Err(e) => {
                self.read_only.store(!read_only, Ordering::Release);
                return Err(e);
            }
        };
        if !Arc::ptr_eq(&target, &previous) {
            tracing::debug!(from = %previous.host(), to = %target.host(), read_only, "switched slot");
            let mut state = previous.session_state();
            state.dirty.remove(StateFlags::READ_ONLY);
            target.restore_session(&state)?;
        }
        let on_replica = self.replica.holds(&target);
        if read_only && on_replica {
            return Ok(());
        }
        if target.read_only() != read_only {
            self.with_failover(false, |c| c.set_read_only(read_only))?;
        }
        Ok(())
    }

    /// Forced teardown of every open connection.
    pub fn abort(&self) {
        self.closed.store(true, Ordering::Release);
        for slot in [&self.primary, &self.replica] {
            if let Some(conn) = slot.conn.swap(None) {
                conn.abort();
            }
        }
    }

    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for slot in [&self.primary, &self.replica] {
            if let Some(conn) = slot.conn.swap(None) {
                conn.close()?;
            }
        }
        Ok(())
    }
}

impl Drop for Failover {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
