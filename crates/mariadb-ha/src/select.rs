//! Host selection.

use std::fmt;

use mariadb_client::{Configuration, HaMode, HostAddress};
use rand::seq::SliceRandom;

use crate::deny::DenyList;

/// Which kind of server a connection slot talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => f.write_str("primary"),
            Role::Replica => f.write_str("replica"),
        }
    }
}

/// Hosts eligible for `role` under the configured mode, in declaration order.
pub fn hosts_for(config: &Configuration, role: Role) -> Vec<HostAddress> {
    match (config.ha_mode, role) {
        (HaMode::None, Role::Primary) => config.hosts.iter().take(1).cloned().collect(),
        (HaMode::None, Role::Replica) => Vec::new(),
        (HaMode::Replication, Role::Replica) => config.replicas().cloned().collect(),
        (HaMode::Replication, Role::Primary) => config.primaries().cloned().collect(),
        // every host of a primary-only pool is writable
        (HaMode::Sequential | HaMode::LoadBalance, Role::Primary) => config.hosts.clone(),
        (HaMode::Sequential | HaMode::LoadBalance, Role::Replica) => Vec::new(),
    }
}

/// Order of the hosts to try in one selection round.
///
/// Hosts outside the deny-list come first, shuffled in load-balance mode.
/// When every host is denied, only the one whose cool-down ends first is
/// returned.
pub fn candidates(mode: HaMode, hosts: &[HostAddress], deny: &DenyList) -> Vec<HostAddress> {
    let mut allowed: Vec<HostAddress> = hosts
        .iter()
        .filter(|h| !deny.is_denied(h))
        .cloned()
        .collect();
    if allowed.is_empty() {
        return hosts
            .iter()
            .min_by_key(|h| deny.expiry(h))
            .cloned()
            .into_iter()
            .collect();
    }
    if mode == HaMode::LoadBalance {
        allowed.shuffle(&mut rand::thread_rng());
    }
    allowed
}
