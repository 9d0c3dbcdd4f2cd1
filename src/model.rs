//! Core value types shared by every stage of a discovery cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Instance State ──────────────────────────────────────────────────

/// Lifecycle state of an instance as reported by the inventory API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    /// Code or name we have no mapping for.
    Unknown,
}

impl InstanceState {
    /// Map an EC2 state code. Only the low byte is meaningful; the high
    /// byte is reserved for provider-internal use.
    pub fn from_code(code: i64) -> Self {
        match code & 0xFF {
            0 => Self::Pending,
            16 => Self::Running,
            32 => Self::ShuttingDown,
            48 => Self::Terminated,
            64 => Self::Stopping,
            80 => Self::Stopped,
            _ => Self::Unknown,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }

    /// The wire name, as used by `instance-state-name` query filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }
}

// ── Instance Record ─────────────────────────────────────────────────

/// One instance from one inventory page. Lives for a single cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub state: InstanceState,
    pub private_address: Option<String>,
    pub public_address: Option<String>,
    pub private_dns_name: Option<String>,
    pub public_dns_name: Option<String>,
    pub instance_type: Option<String>,
    pub availability_zone: Option<String>,
    pub launch_time: Option<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
    /// Group ids and group names, so either can be used in configuration.
    pub security_groups: BTreeSet<String>,
}

impl InstanceRecord {
    pub fn new(instance_id: impl Into<String>, state: InstanceState) -> Self {
        Self {
            instance_id: instance_id.into(),
            state,
            private_address: None,
            public_address: None,
            private_dns_name: None,
            public_dns_name: None,
            instance_type: None,
            availability_zone: None,
            launch_time: None,
            tags: BTreeMap::new(),
            security_groups: BTreeSet::new(),
        }
    }
}

/// Treat empty or whitespace-only text as absent.
pub(crate) fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

// ── Peer Endpoint ───────────────────────────────────────────────────

/// A candidate cluster member handed to the membership layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub host: String,
    pub port: u16,
}

impl PeerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolved address when the host is an IP literal. DNS names are
    /// left to the transport layer.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

// ── Snapshot ────────────────────────────────────────────────────────

/// The immutable result of one completed discovery cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoverySnapshot {
    pub cycle_id: u64,
    pub taken_at: DateTime<Utc>,
    pub endpoints: BTreeSet<PeerEndpoint>,
    /// Instances parsed across all pages of the cycle.
    pub instances_seen: usize,
    /// Instances that passed the filter.
    pub instances_matched: usize,
}

impl DiscoverySnapshot {
    /// The snapshot a coordinator starts with before any cycle completes.
    pub fn empty() -> Self {
        Self {
            cycle_id: 0,
            taken_at: Utc::now(),
            endpoints: BTreeSet::new(),
            instances_seen: 0,
            instances_matched: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn contains(&self, endpoint: &PeerEndpoint) -> bool {
        self.endpoints.contains(endpoint)
    }

    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.endpoints.iter().filter_map(PeerEndpoint::socket_addr).collect()
    }
}
