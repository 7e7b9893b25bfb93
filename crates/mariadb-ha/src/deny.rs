//! Temporary exclusion of failed hosts.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use mariadb_client::HostAddress;

/// Host -> end of its cool-down window.
///
/// Safe for concurrent use without outside locking. Expired entries are
/// dropped lazily on lookup.
#[derive(Debug, Default)]
pub struct DenyList {
    entries: DashMap<HostAddress, Instant>,
}

impl DenyList {
    pub fn new() -> Self {
        Self::default()
    }

    /// The list shared by every orchestrator that was not given its own.
    pub fn global() -> Arc<DenyList> {
        static GLOBAL: OnceLock<Arc<DenyList>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(DenyList::new())).clone()
    }

    /// Exclude `host` for `cool_down` from now.
    pub fn deny(&self, host: &HostAddress, cool_down: Duration) {
        let until = Instant::now() + cool_down;
        tracing::debug!(host = %host, ?cool_down, "host denied");
        self.entries.insert(host.clone(), until);
    }

    pub fn allow(&self, host: &HostAddress) {
        self.entries.remove(host);
    }

    pub fn is_denied(&self, host: &HostAddress) -> bool {
        self.expiry(host).is_some()
    }

    /// End of the cool-down of `host`, if it is still running.
    pub fn expiry(&self, host: &HostAddress) -> Option<Instant> {
        let now = Instant::now();
        let until = self.entries.get(host).map(|e| *e)?;
        if until > now {
            return Some(until);
        }
        self.entries.remove_if(host, |_, until| *until <= now);
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cool_down_expires() {
        let list = DenyList::new();
        let host = HostAddress::new("db1", 3306);
        list.deny(&host, Duration::from_millis(40));
        assert!(list.is_denied(&host));
        assert!(!list.is_denied(&HostAddress::new("db2", 3306)));

        thread::sleep(Duration::from_millis(60));
        assert!(!list.is_denied(&host));
        assert!(list.is_empty());
    }

    #[test]
    fn test_allow_lifts_denial() {
        let list = DenyList::new();
        let host = HostAddress::replica("db3", 3307);
        list.deny(&host, Duration::from_secs(60));
        assert!(list.expiry(&host).is_some());
        list.allow(&host);
        assert!(!list.is_denied(&host));
    }

    #[test]
    fn test_concurrent_updates() {
        let list = Arc::new(DenyList::new());
        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let list = list.clone();
                thread::spawn(move || {
                    let host = HostAddress::new("db", 3300 + i);
                    list.deny(&host, Duration::from_secs(60));
                    assert!(list.is_denied(&host));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(list.len(), 8);
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&DenyList::global(), &DenyList::global()));
    }
}
