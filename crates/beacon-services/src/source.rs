//! Source records and the identities that own them.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

use serde::Serialize;

use beacon_core::wire::SourceDescriptor;

/// Opaque per-connection identifier. Allocated monotonically, so ordering
/// by id is connection insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Who holds a claim on a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Owner {
    Connection(ConnectionId),
    /// Every connection from this address shares one claim.
    Address(Ipv4Addr),
}

/// Identity of a source: at most one live record per key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SourceKey {
    pub name: String,
    pub address: Ipv4Addr,
    pub port: u16,
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.address, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Active,
    /// Ownerless; removed when the grace timer fires.
    PendingRemoval,
}

/// An announced source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub name: String,
    pub metadata: String,
    pub address: Ipv4Addr,
    pub port: u16,
    pub groups: Vec<String>,
    pub owners: BTreeSet<Owner>,
    pub state: SourceState,
    /// Creation order within the registry.
    pub(crate) seq: u64,
}

impl SourceRecord {
    pub fn key(&self) -> SourceKey {
        SourceKey {
            name: self.name.clone(),
            address: self.address,
            port: self.port,
        }
    }

    pub fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            name: self.name.clone(),
            metadata: self.metadata.clone(),
            address: self.address,
            port: self.port,
            groups: self.groups.clone(),
        }
    }
}
