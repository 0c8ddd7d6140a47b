//! Incremental `<sources>` filter for upstream → client traffic.

use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use beacon_core::policy::{prefix_mask, PolicySet};
use beacon_core::wire::{self, SourceDescriptor};

/// Upstream bytes held while waiting for a complete source list. Past
/// this the buffer is relayed raw.
pub const MAX_RELAY_BUFFER: usize = 1024 * 1024;

/// Which sources a relayed client may see.
#[derive(Debug, Clone)]
pub enum RelayVisibility {
    /// The discovery server's own rules.
    Rules(Arc<PolicySet>),
    /// Source and client share the top `prefix` bits.
    SameSubnet { prefix: u8 },
}

impl RelayVisibility {
    pub fn allows(&self, source: Ipv4Addr, client: Ipv4Addr) -> bool {
        match self {
            RelayVisibility::Rules(policy) => policy.can_share(source, client),
            RelayVisibility::SameSubnet { prefix } => {
                let mask = prefix_mask(*prefix);
                u32::from(source) & mask == u32::from(client) & mask
            }
        }
    }
}

/// What to write to the client after a chunk arrives.
#[derive(Debug, PartialEq, Eq)]
pub enum Relayed {
    /// Still waiting for a complete block.
    Pending,
    /// Prefix, filtered block, suffix. Empty pieces are left out.
    Filtered(Vec<Bytes>),
    /// The block could not be parsed, or the buffer outgrew
    /// [`MAX_RELAY_BUFFER`]; the raw bytes go through as is.
    Passthrough(Bytes),
}

pub struct SourcesFilter {
    client: Ipv4Addr,
    visibility: RelayVisibility,
    buf: BytesMut,
}

impl SourcesFilter {
    pub fn new(client: Ipv4Addr, visibility: RelayVisibility) -> Self {
        Self {
            client,
            visibility,
            buf: BytesMut::new(),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Relayed {
        self.buf.extend_from_slice(chunk);
        let (start, end) = match wire::find_sources_block(&self.buf) {
            Some(range) => range,
            None if self.buf.len() > MAX_RELAY_BUFFER => {
                tracing::warn!(
                    client = %self.client,
                    bytes = self.buf.len(),
                    "no source list within buffer limit, relaying unfiltered"
                );
                return Relayed::Passthrough(self.buf.split().freeze());
            }
            None => return Relayed::Pending,
        };

        let raw = self.buf.split().freeze();
        let sources = match wire::decode_sources(&raw[start..end]) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(
                    client = %self.client,
                    error = %e,
                    "unparseable source list, relaying unfiltered"
                );
                return Relayed::Passthrough(raw);
            }
        };

        let total = sources.len();
        let visible: Vec<SourceDescriptor> = sources
            .into_iter()
            .filter(|s| self.visibility.allows(s.address, self.client))
            .collect();
        tracing::debug!(
            client = %self.client,
            total,
            visible = visible.len(),
            "source list filtered"
        );

        let block = Bytes::from(wire::encode_sources(&visible));
        let parts = [raw.slice(..start), block, raw.slice(end..)]
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect();
        Relayed::Filtered(parts)
    }

    /// Take whatever is buffered, unfiltered.
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }
}
