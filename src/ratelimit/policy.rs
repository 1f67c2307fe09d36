//! Per-client policies: allow lists, deny lists and rule overrides.
//!
//! Policies are consulted before any counter is touched. A client key is
//! matched exactly first; if that fails and the key is an IP address, the
//! longest matching CIDR range wins.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;

use super::descriptor::ClientKey;
use super::rules::{Rule, RuleConfig};
use crate::error::{RatewardenError, Result};

/// A policy as written in the limits file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    /// Exact client key, IP address, or CIDR range
    pub client: String,
    /// What to do with matching clients
    pub action: PolicyAction,
}

impl PolicyEntry {
    /// Create a new policy entry.
    pub fn new(client: impl Into<String>, action: PolicyAction) -> Self {
        Self {
            client: client.into(),
            action,
        }
    }
}

/// Action attached to a policy entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    /// Never limit this client
    Allow,
    /// Reject every request from this client
    Deny,
    /// Evaluate this rule instead of the general rule set
    Override(RuleConfig),
}

/// Outcome of a policy lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Bypass all rules
    Allow,
    /// Reject without counting
    Deny,
    /// Evaluate only this rule
    UseRule(Rule),
    /// No policy applies, evaluate the general rules
    None,
}

/// An IP range in CIDR notation, stored with host bits cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IpRange {
    network: IpAddr,
    prefix_len: u8,
}

impl IpRange {
    /// Parse a CIDR string.
    fn parse(s: &str) -> Result<Self> {
        let (network_str, prefix_str) = s.split_once('/').ok_or_else(|| {
            RatewardenError::Config(format!("'{}' is not in CIDR notation", s))
        })?;

        let network = IpAddr::from_str(network_str.trim()).map_err(|e| {
            RatewardenError::Config(format!("Invalid IP address in CIDR '{}': {}", s, e))
        })?;

        let prefix_len = prefix_str.trim().parse::<u8>().map_err(|e| {
            RatewardenError::Config(format!("Invalid prefix length in CIDR '{}': {}", s, e))
        })?;

        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(RatewardenError::Config(format!(
                "Invalid prefix length {} in CIDR '{}': must be 0-{}",
                prefix_len, s, max
            )));
        }

        Ok(Self {
            network: mask(&network, prefix_len),
            prefix_len,
        })
    }

    /// Check if an IP address falls inside this range.
    fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask(ip, self.prefix_len) == self.network
            }
            // Different IP versions
            _ => false,
        }
    }
}

fn mask(ip: &IpAddr, prefix_len: u8) -> IpAddr {
    match ip {
        IpAddr::V4(addr) => {
            let bits = u32::from_be_bytes(addr.octets());
            let mask = if prefix_len == 0 {
                0
            } else {
                !0u32 << (32 - prefix_len)
            };
            IpAddr::from((bits & mask).to_be_bytes())
        }
        IpAddr::V6(addr) => {
            let bits = u128::from_be_bytes(addr.octets());
            let mask = if prefix_len == 0 {
                0
            } else {
                !0u128 << (128 - prefix_len)
            };
            IpAddr::from((bits & mask).to_be_bytes())
        }
    }
}

/// Canonical spelling of a policy client.
///
/// Addresses are rewritten so that `::1` and `0:0:0:0:0:0:0:1`, or
/// `::ffff:10.1.2.3` and `10.1.2.3`, name the same client.
fn canonical_client(client: &str) -> String {
    let client = client.trim();
    match IpAddr::from_str(client) {
        Ok(ip) => ip.to_canonical().to_string(),
        Err(_) => client.to_string(),
    }
}

/// Immutable, indexed view of a list of policy entries.
///
/// Updates never modify a table in place; they build a new one, which the
/// limiter swaps in together with its rules.
#[derive(Debug, Default)]
pub struct PolicyTable {
    entries: Vec<PolicyEntry>,
    exact: HashMap<String, PolicyDecision>,
    /// Longest prefix first; equal prefixes keep declaration order.
    ranges: Vec<(IpRange, PolicyDecision)>,
}

impl PolicyTable {
    /// Validate and index policy entries.
    pub fn build(entries: Vec<PolicyEntry>) -> Result<Self> {
        let mut exact = HashMap::new();
        let mut ranges: Vec<(IpRange, PolicyDecision)> = Vec::new();

        for entry in &entries {
            let client = entry.client.trim();
            if client.is_empty() {
                return Err(RatewardenError::Config(
                    "Policy entry has an empty client".to_string(),
                ));
            }

            let decision = match &entry.action {
                PolicyAction::Allow => PolicyDecision::Allow,
                PolicyAction::Deny => PolicyDecision::Deny,
                PolicyAction::Override(rule) => PolicyDecision::UseRule(Rule::from_config(rule)?),
            };

            if client.contains('/') {
                let range = IpRange::parse(client)?;
                if ranges.iter().any(|(existing, _)| existing == &range) {
                    return Err(duplicate_policy(client));
                }
                ranges.push((range, decision));
            } else if exact.insert(canonical_client(client), decision).is_some() {
                return Err(duplicate_policy(client));
            }
        }

        ranges.sort_by(|a, b| b.0.prefix_len.cmp(&a.0.prefix_len));

        Ok(Self {
            entries,
            exact,
            ranges,
        })
    }

    /// Look up the policy for a client.
    pub fn resolve(&self, client: &ClientKey) -> PolicyDecision {
        if let Some(decision) = self.exact.get(client.as_str()) {
            return decision.clone();
        }

        let Some(ip) = client.ip() else {
            return PolicyDecision::None;
        };
        let ip = ip.to_canonical();

        if let Some(decision) = self.exact.get(&ip.to_string()) {
            return decision.clone();
        }

        self.ranges
            .iter()
            .find(|(range, _)| range.contains(&ip))
            .map(|(_, decision)| decision.clone())
            .unwrap_or(PolicyDecision::None)
    }

    /// A copy of this table with `entry` added, replacing the entry for the
    /// same client if there is one.
    pub fn with_entry(&self, entry: PolicyEntry) -> Result<Self> {
        let client = canonical_client(&entry.client);
        let mut entries = self.entries.clone();
        match entries
            .iter_mut()
            .find(|e| canonical_client(&e.client) == client)
        {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        Self::build(entries)
    }

    /// A copy of this table without the entry for `client`, or `None` when
    /// the client has no entry.
    pub fn without_client(&self, client: &str) -> Result<Option<Self>> {
        let client = canonical_client(client);
        let mut entries = self.entries.clone();
        let before = entries.len();
        entries.retain(|e| canonical_client(&e.client) != client);
        if entries.len() == before {
            return Ok(None);
        }
        Self::build(entries).map(Some)
    }

    /// The entries this table was built from, in declaration order.
    pub fn entries(&self) -> &[PolicyEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn duplicate_policy(client: &str) -> RatewardenError {
    RatewardenError::Config(format!("Duplicate policy for client '{}'", client))
}
