//! Destination allow/deny lists for CONNECT targets

use std::collections::HashSet;

use crate::config::PolicyConfig;

/// Outcome of a destination check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allowed,
    /// The allow-list is non-empty and the destination is not on it
    NotAllowListed,
    /// The destination is on the deny-list
    DenyListed,
}

impl PolicyDecision {
    pub fn is_allowed(self) -> bool {
        self == PolicyDecision::Allowed
    }
}

/// Allow-list and deny-list of `host:port` strings
///
/// A non-empty allow-list admits only its members. Deny-list members are
/// rejected. Everything else is allowed. Host comparison ignores ASCII case.
#[derive(Debug, Clone, Default)]
pub struct DestinationPolicy {
    allow: HashSet<String>,
    deny: HashSet<String>,
}

impl DestinationPolicy {
    pub fn new<A, D>(allow: A, deny: D) -> Self
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        Self {
            allow: allow.into_iter().map(|s| normalize(s.as_ref())).collect(),
            deny: deny.into_iter().map(|s| normalize(s.as_ref())).collect(),
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(&config.allow, &config.deny)
    }

    /// `host` may be a bare IPv6 literal; it is bracketed before lookup
    pub fn check(&self, host: &str, port: u16) -> PolicyDecision {
        let destination = normalize(&destination_key(host, port));
        if !self.allow.is_empty() && !self.allow.contains(&destination) {
            return PolicyDecision::NotAllowListed;
        }
        if self.deny.contains(&destination) {
            return PolicyDecision::DenyListed;
        }
        PolicyDecision::Allowed
    }

    pub fn allow_count(&self) -> usize {
        self.allow.len()
    }

    pub fn deny_count(&self) -> usize {
        self.deny.len()
    }
}

fn destination_key(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn normalize(destination: &str) -> String {
    destination.trim().to_ascii_lowercase()
}
