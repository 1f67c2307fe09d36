//! Request descriptors and counter key generation.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::rules::RuleId;

/// Identifier of the caller a request is attributed to.
///
/// Usually the source address, but any stable string works (API client id,
/// address plus route, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientKey(Arc<str>);

impl ClientKey {
    /// Create a client key from any string.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// The raw key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interpret the key as an IP address, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.0.parse().ok()
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<IpAddr> for ClientKey {
    fn from(ip: IpAddr) -> Self {
        Self::new(ip.to_string())
    }
}

/// Everything the limiter needs to know about one inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// Who is calling
    pub client: ClientKey,
    /// Request path, without query string
    pub path: String,
    /// HTTP method
    pub method: String,
}

impl RequestDescriptor {
    /// Create a new descriptor.
    pub fn new(client: impl Into<ClientKey>, path: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            path: path.into(),
            method: method.into(),
        }
    }
}

impl fmt::Display for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.client, self.method, self.path)
    }
}

/// A key that uniquely identifies one counter.
///
/// Per-client rules carry the client; global rules share a single counter
/// across all clients and leave it empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The client this counter belongs to, `None` for global rules
    pub client: Option<ClientKey>,
    /// The rule being counted
    pub rule: RuleId,
}

impl CounterKey {
    /// Counter for a client under a per-client rule.
    pub fn per_client(client: ClientKey, rule: RuleId) -> Self {
        Self {
            client: Some(client),
            rule,
        }
    }

    /// Counter shared by all clients.
    pub fn global(rule: RuleId) -> Self {
        Self { client: None, rule }
    }

    /// Convert the key to a flat string, as used by external stores.
    pub fn to_string_key(&self) -> String {
        match &self.client {
            Some(client) => format!("{}|{}", client, self.rule),
            None => format!("*|{}", self.rule),
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
