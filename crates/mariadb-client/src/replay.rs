//! Commands of the open transaction, kept for redo after a reconnect.

use crate::command::Command;

/// Ordered log of the commands issued since the transaction began.
///
/// Once dirty the log is never replayed; only [`ReplayBuffer::clear`] at
/// the next transaction boundary makes it usable again.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    commands: Vec<Command>,
    max: usize,
    dirty: bool,
}

impl ReplayBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            commands: Vec::new(),
            max,
            dirty: false,
        }
    }

    /// Append a command that completed inside the transaction.
    pub fn record(&mut self, command: &Command) {
        if self.dirty || !command.needs_recording() {
            return;
        }
        if !command.is_replayable() || self.commands.len() >= self.max {
            tracing::debug!(
                buffered = self.commands.len(),
                "transaction no longer replayable"
            );
            self.mark_dirty();
            return;
        }
        self.commands.push(command.clone());
    }

    /// Transaction boundary: forget everything.
    pub fn clear(&mut self) {
        self.commands.clear();
        self.dirty = false;
    }

    pub fn mark_dirty(&mut self) {
        self.commands.clear();
        self.dirty = true;
    }

    pub fn is_clean(&self) -> bool {
        !self.dirty
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mariadb_core::Value;

    #[test]
    fn test_records_in_order_and_skips_pings() {
        let mut buffer = ReplayBuffer::new(8);
        buffer.record(&Command::query("BEGIN"));
        buffer.record(&Command::Ping);
        buffer.record(&Command::execute("INSERT INTO t VALUES (?)", vec![Value::Int(1)]));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.commands()[1].sql(), Some("INSERT INTO t VALUES (?)"));
        assert!(buffer.is_clean());
    }

    #[test]
    fn test_overflow_marks_dirty_until_cleared() {
        let mut buffer = ReplayBuffer::new(1);
        buffer.record(&Command::query("BEGIN"));
        buffer.record(&Command::query("UPDATE t SET n = n + 1"));
        assert!(!buffer.is_clean());
        assert!(buffer.is_empty());

        buffer.record(&Command::query("UPDATE t SET n = 0"));
        assert!(buffer.is_empty());

        buffer.clear();
        assert!(buffer.is_clean());
        buffer.record(&Command::query("BEGIN"));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_reset_connection_is_not_replayable() {
        let mut buffer = ReplayBuffer::new(8);
        buffer.record(&Command::query("BEGIN"));
        buffer.record(&Command::ResetConnection);
        assert!(!buffer.is_clean());
    }
}
