//! Discovery hub — single owner of the registry and the connection set.
//!
//! Connection tasks never touch shared state. They parse frames and send
//! [`HubCommand`]s; the hub applies each one to the registry and turns the
//! outcome into writes on other connections' outbound queues. Grace timer
//! expiries arrive on a second channel and are applied the same way, so a
//! mutation and its fan-out are never interleaved with another mutation.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use beacon_core::config::Ownership;
use beacon_core::policy::PolicySet;
use beacon_core::wire::{self, Frame};

use crate::registry::{Expiry, SourceRegistry, SourceView};
use crate::source::{ConnectionId, Owner, SourceRecord};
use crate::transitions::{SourceTransition, TransitionLog, RECENT_TRANSITIONS};

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub grace_period: Duration,
    pub ownership: Ownership,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(60),
            ownership: Ownership::Connection,
        }
    }
}

/// Outbound queue of one connection. Each item is a complete frame.
pub type Outbound = mpsc::UnboundedSender<Bytes>;

pub enum HubCommand {
    Connect {
        id: ConnectionId,
        remote: Ipv4Addr,
        outbound: Outbound,
    },
    Frame {
        id: ConnectionId,
        frame: Frame,
    },
    Disconnect {
        id: ConnectionId,
    },
    ListAll {
        reply: oneshot::Sender<Vec<SourceView>>,
    },
    ListVisible {
        watcher: Ipv4Addr,
        reply: oneshot::Sender<Vec<SourceRecord>>,
    },
    Connections {
        reply: oneshot::Sender<Vec<ConnectionInfo>>,
    },
    Transitions {
        reply: oneshot::Sender<Vec<SourceTransition>>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote: Ipv4Addr,
    pub connected_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub sources: usize,
    pub pending_removals: usize,
    pub connections: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("discovery hub has stopped")]
    Closed,
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cheap, cloneable entry point to the hub.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
    next_id: Arc<AtomicU64>,
    policy: Arc<PolicySet>,
    transitions: broadcast::Sender<SourceTransition>,
}

impl HubHandle {
    /// Register a connection. Frames for it are pushed to `outbound`.
    pub fn connect(&self, remote: Ipv4Addr, outbound: Outbound) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.send(HubCommand::Connect {
            id,
            remote,
            outbound,
        });
        id
    }

    pub fn frame(&self, id: ConnectionId, frame: Frame) {
        self.send(HubCommand::Frame { id, frame });
    }

    pub fn disconnect(&self, id: ConnectionId) {
        self.send(HubCommand::Disconnect { id });
    }

    pub async fn list_all(&self) -> Result<Vec<SourceView>, HubError> {
        self.request(|reply| HubCommand::ListAll { reply }).await
    }

    pub async fn list_visible_to(&self, watcher: Ipv4Addr) -> Result<Vec<SourceRecord>, HubError> {
        self.request(|reply| HubCommand::ListVisible { watcher, reply }).await
    }

    pub async fn connections(&self) -> Result<Vec<ConnectionInfo>, HubError> {
        self.request(|reply| HubCommand::Connections { reply }).await
    }

    pub async fn transitions(&self) -> Result<Vec<SourceTransition>, HubError> {
        self.request(|reply| HubCommand::Transitions { reply }).await
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.request(|reply| HubCommand::Stats { reply }).await
    }

    /// Live `(source, 0|1, timestamp)` feed.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<SourceTransition> {
        self.transitions.subscribe()
    }

    pub fn policy(&self) -> &Arc<PolicySet> {
        &self.policy
    }

    fn send(&self, cmd: HubCommand) {
        if self.tx.send(cmd).is_err() {
            tracing::warn!("discovery hub has stopped, command dropped");
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }
}

// ── Hub ───────────────────────────────────────────────────────────────────────

struct ConnectionEntry {
    remote: Ipv4Addr,
    outbound: Outbound,
    connected_at: Instant,
}

pub struct Hub {
    commands: mpsc::UnboundedReceiver<HubCommand>,
    expiries: mpsc::UnboundedReceiver<Expiry>,
    registry: SourceRegistry,
    /// Ordered by id, i.e. by connection insertion order.
    connections: BTreeMap<ConnectionId, ConnectionEntry>,
    ownership: Ownership,
    transitions: TransitionLog,
}

impl Hub {
    /// Start the hub task. It stops once every [`HubHandle`] is dropped.
    pub fn spawn(policy: Arc<PolicySet>, settings: HubSettings) -> (HubHandle, JoinHandle<()>) {
        let (tx, commands) = mpsc::unbounded_channel();
        let (expiry_tx, expiries) = mpsc::unbounded_channel();
        let (transitions_tx, _) = broadcast::channel(RECENT_TRANSITIONS);

        let hub = Hub {
            commands,
            expiries,
            registry: SourceRegistry::new(policy.clone(), settings.grace_period, expiry_tx),
            connections: BTreeMap::new(),
            ownership: settings.ownership,
            transitions: TransitionLog::new(RECENT_TRANSITIONS, transitions_tx.clone()),
        };
        let handle = HubHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            policy,
            transitions: transitions_tx,
        };
        (handle, tokio::spawn(hub.run()))
    }

    async fn run(mut self) {
        tracing::info!(
            rules = self.registry.policy().rules().len(),
            grace_secs = self.registry.grace_period().as_secs(),
            ownership = ?self.ownership,
            "discovery hub started"
        );
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                Some(expiry) = self.expiries.recv() => self.handle_expiry(expiry),
            }
        }
        tracing::info!("discovery hub stopped");
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Connect {
                id,
                remote,
                outbound,
            } => {
                tracing::info!(conn = %id, peer = %remote, "connection registered");
                self.connections.insert(
                    id,
                    ConnectionEntry {
                        remote,
                        outbound,
                        connected_at: Instant::now(),
                    },
                );
                if self.ownership == Ownership::Address {
                    for record in self.registry.reclaim(Owner::Address(remote)) {
                        tracing::info!(
                            conn = %id,
                            source = %record.key(),
                            "address reconnected, removal cancelled"
                        );
                    }
                }
            }
            HubCommand::Frame { id, frame } => self.handle_frame(id, frame),
            HubCommand::Disconnect { id } => self.handle_disconnect(id),
            HubCommand::ListAll { reply } => {
                let _ = reply.send(self.registry.list_all());
            }
            HubCommand::ListVisible { watcher, reply } => {
                let _ = reply.send(self.registry.list_visible_to(watcher));
            }
            HubCommand::Connections { reply } => {
                let list = self
                    .connections
                    .iter()
                    .map(|(id, c)| ConnectionInfo {
                        id: *id,
                        remote: c.remote,
                        connected_secs: c.connected_at.elapsed().as_secs(),
                    })
                    .collect();
                let _ = reply.send(list);
            }
            HubCommand::Transitions { reply } => {
                let _ = reply.send(self.transitions.recent());
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(HubStats {
                    sources: self.registry.len(),
                    pending_removals: self.registry.pending_count(),
                    connections: self.connections.len(),
                });
            }
        }
    }

    fn handle_frame(&mut self, id: ConnectionId, frame: Frame) {
        let remote = match self.connections.get(&id) {
            Some(c) => c.remote,
            None => {
                tracing::debug!(conn = %id, "frame from unregistered connection ignored");
                return;
            }
        };

        match frame {
            Frame::Query => {
                let visible: Vec<_> = self
                    .registry
                    .list_visible_to(remote)
                    .iter()
                    .map(SourceRecord::descriptor)
                    .collect();
                tracing::debug!(conn = %id, peer = %remote, count = visible.len(), "query answered");
                self.send_to(id, Bytes::from(wire::frame(wire::encode_sources(&visible))));
            }
            Frame::Announce(ann) => {
                let owner = match self.ownership {
                    Ownership::Connection => Owner::Connection(id),
                    Ownership::Address => Owner::Address(remote),
                };
                let announced = self.registry.announce(owner, remote, ann);
                let record = announced.record;
                if !announced.created {
                    tracing::debug!(
                        conn = %id,
                        source = %record.key(),
                        owners = record.owners.len(),
                        "source re-announced"
                    );
                    return;
                }
                tracing::info!(conn = %id, source = %record.key(), groups = ?record.groups, "source added");
                self.transitions.record(record.key(), true);
                let message = wire::encode_add(&record.descriptor());
                self.fan_out(&record, Some(id), message);
            }
        }
    }

    fn handle_disconnect(&mut self, id: ConnectionId) {
        let conn = match self.connections.remove(&id) {
            Some(c) => c,
            None => return,
        };
        tracing::info!(conn = %id, peer = %conn.remote, "connection closed");

        let owner = match self.ownership {
            Ownership::Connection => Owner::Connection(id),
            Ownership::Address => {
                if self.connections.values().any(|c| c.remote == conn.remote) {
                    tracing::debug!(
                        peer = %conn.remote,
                        "address still connected, keeping its sources"
                    );
                    return;
                }
                Owner::Address(conn.remote)
            }
        };

        for record in self.registry.release(owner) {
            tracing::info!(
                source = %record.key(),
                grace_secs = self.registry.grace_period().as_secs(),
                "source ownerless, removal pending"
            );
        }
    }

    fn handle_expiry(&mut self, expiry: Expiry) {
        let record = match self.registry.expire(expiry) {
            Some(r) => r,
            None => return,
        };
        tracing::info!(source = %record.key(), "source removed");
        self.transitions.record(record.key(), false);
        let message = wire::encode_remove(&record.descriptor());
        self.fan_out(&record, None, message);
    }

    /// Push `message` to every connection allowed to see `record`, in
    /// connection order, skipping `exclude`.
    fn fan_out(&self, record: &SourceRecord, exclude: Option<ConnectionId>, message: String) {
        let frame = Bytes::from(wire::frame(message));
        let policy = self.registry.policy();
        let mut sent = 0usize;
        for (id, conn) in &self.connections {
            if Some(*id) == exclude || !policy.can_share(record.address, conn.remote) {
                continue;
            }
            if conn.outbound.send(frame.clone()).is_ok() {
                sent += 1;
            }
        }
        tracing::debug!(source = %record.key(), sent, "fan-out");
    }

    fn send_to(&self, id: ConnectionId, frame: Bytes) {
        if let Some(conn) = self.connections.get(&id) {
            if conn.outbound.send(frame).is_err() {
                tracing::debug!(conn = %id, "outbound queue closed");
            }
        }
    }
}
