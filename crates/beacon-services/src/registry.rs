//! Source registry — the authoritative table of announced sources.
//!
//! Records are keyed by `(name, address, port)` and carry an owner set.
//! When the last owner lets go, a grace timer is armed; if nobody
//! re-announces the key before it fires, the record is removed.
//!
//! The registry is not shared. Exactly one task (the hub) owns it and
//! applies every mutation, so announce/release/expire never interleave.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use beacon_core::policy::{PolicyAnnotation, PolicySet};
use beacon_core::wire::Announcement;

use crate::source::{Owner, SourceKey, SourceRecord, SourceState};

/// Sent by a grace timer when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub key: SourceKey,
    /// Identifies which arming of the timer fired.
    pub generation: u64,
}

/// An armed grace timer.
struct PendingRemoval {
    generation: u64,
    /// The owner whose release left the record ownerless.
    released_by: Owner,
    timer: JoinHandle<()>,
}

/// Outcome of [`SourceRegistry::announce`].
#[derive(Debug, Clone)]
pub struct Announced {
    /// True when this announcement created the record.
    pub created: bool,
    pub record: SourceRecord,
}

/// A record plus the policy that governs it.
#[derive(Debug, Clone)]
pub struct SourceView {
    pub record: SourceRecord,
    pub policy: PolicyAnnotation,
}

pub struct SourceRegistry {
    policy: Arc<PolicySet>,
    records: HashMap<SourceKey, SourceRecord>,
    pending: HashMap<SourceKey, PendingRemoval>,
    grace: Duration,
    expiry_tx: mpsc::UnboundedSender<Expiry>,
    next_seq: u64,
    next_generation: u64,
}

impl SourceRegistry {
    /// Grace timers report to `expiry_tx`; the owner feeds each [`Expiry`]
    /// back into [`SourceRegistry::expire`].
    pub fn new(
        policy: Arc<PolicySet>,
        grace: Duration,
        expiry_tx: mpsc::UnboundedSender<Expiry>,
    ) -> Self {
        Self {
            policy,
            records: HashMap::new(),
            pending: HashMap::new(),
            grace,
            expiry_tx,
            next_seq: 0,
            next_generation: 0,
        }
    }

    pub fn policy(&self) -> &PolicySet {
        &self.policy
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of armed grace timers.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn get(&self, key: &SourceKey) -> Option<&SourceRecord> {
        self.records.get(key)
    }

    /// Register `owner`'s claim on the announced source.
    ///
    /// A missing or all-zero address resolves to `remote`. Re-announcing an
    /// existing key adds the owner and cancels any pending removal.
    pub fn announce(&mut self, owner: Owner, remote: Ipv4Addr, ann: Announcement) -> Announced {
        let address = match ann.address {
            Some(a) if !a.is_unspecified() => a,
            _ => remote,
        };
        let key = SourceKey {
            name: ann.name,
            address,
            port: ann.port,
        };

        if let Some(record) = self.records.get_mut(&key) {
            record.owners.insert(owner);
            record.state = SourceState::Active;
            let record = record.clone();
            if self.cancel(&key) {
                tracing::debug!(source = %key, "pending removal cancelled by re-announcement");
            }
            return Announced {
                created: false,
                record,
            };
        }

        let record = SourceRecord {
            name: key.name.clone(),
            metadata: String::new(),
            address,
            port: key.port,
            groups: ann.groups,
            owners: BTreeSet::from([owner]),
            state: SourceState::Active,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.records.insert(key, record.clone());
        Announced {
            created: true,
            record,
        }
    }

    /// Drop `owner`'s claim everywhere. Returns the records left ownerless
    /// by this call; each has a grace timer armed. Nothing is removed yet.
    pub fn release(&mut self, owner: Owner) -> Vec<SourceRecord> {
        let mut orphaned = Vec::new();
        for record in self.records.values_mut() {
            if record.owners.remove(&owner) && record.owners.is_empty() {
                record.state = SourceState::PendingRemoval;
                orphaned.push(record.clone());
            }
        }
        orphaned.sort_by_key(|r| r.seq);
        for record in &orphaned {
            let key = record.key();
            if !self.pending.contains_key(&key) {
                self.arm(key, owner);
            }
        }
        orphaned
    }

    /// Give `owner` back every record it left ownerless whose grace timer
    /// is still armed. Returns the reclaimed records in creation order.
    pub fn reclaim(&mut self, owner: Owner) -> Vec<SourceRecord> {
        let keys: Vec<SourceKey> = self
            .pending
            .iter()
            .filter(|(_, p)| p.released_by == owner)
            .map(|(k, _)| k.clone())
            .collect();

        let mut reclaimed = Vec::new();
        for key in keys {
            self.cancel(&key);
            if let Some(record) = self.records.get_mut(&key) {
                record.owners.insert(owner);
                record.state = SourceState::Active;
                reclaimed.push(record.clone());
            }
        }
        reclaimed.sort_by_key(|r| r.seq);
        reclaimed
    }

    /// Handle a fired grace timer. Returns the removed record, or `None`
    /// when the timer is stale or the record regained an owner.
    pub fn expire(&mut self, expiry: Expiry) -> Option<SourceRecord> {
        match self.pending.get(&expiry.key) {
            Some(p) if p.generation == expiry.generation => {}
            _ => {
                tracing::trace!(source = %expiry.key, "stale grace timer ignored");
                return None;
            }
        }
        self.pending.remove(&expiry.key);

        let ownerless = self
            .records
            .get(&expiry.key)
            .is_some_and(|r| r.owners.is_empty());
        if !ownerless {
            return None;
        }
        self.records.remove(&expiry.key)
    }

    /// Every record a watcher at `watcher` may see, in creation order.
    /// Records pending removal stay visible until actually removed.
    pub fn list_visible_to(&self, watcher: Ipv4Addr) -> Vec<SourceRecord> {
        self.ordered()
            .into_iter()
            .filter(|r| self.policy.can_share(r.address, watcher))
            .cloned()
            .collect()
    }

    /// Every record with its policy annotation, in creation order.
    pub fn list_all(&self) -> Vec<SourceView> {
        self.ordered()
            .into_iter()
            .map(|r| SourceView {
                record: r.clone(),
                policy: self.policy.annotate(r.address),
            })
            .collect()
    }

    fn ordered(&self) -> Vec<&SourceRecord> {
        let mut records: Vec<&SourceRecord> = self.records.values().collect();
        records.sort_by_key(|r| r.seq);
        records
    }

    fn arm(&mut self, key: SourceKey, released_by: Owner) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let tx = self.expiry_tx.clone();
        let grace = self.grace;
        let fired = Expiry {
            key: key.clone(),
            generation,
        };
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(fired);
        });
        self.pending.insert(
            key,
            PendingRemoval {
                generation,
                released_by,
                timer,
            },
        );
    }

    /// Cancel the grace timer for `key`. Returns true if one was armed.
    fn cancel(&mut self, key: &SourceKey) -> bool {
        match self.pending.remove(key) {
            Some(p) => {
                p.timer.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for SourceRegistry {
    fn drop(&mut self) {
        for (_, p) in self.pending.drain() {
            p.timer.abort();
        }
    }
}
