//! Discovery state: the source registry, its grace timers, and the hub that
//! serialises every mutation and fan-out.

pub mod hub;
pub mod registry;
pub mod source;
pub mod transitions;

pub use hub::{ConnectionInfo, Hub, HubError, HubHandle, HubSettings, HubStats, Outbound};
pub use registry::{Announced, Expiry, SourceRegistry, SourceView};
pub use source::{ConnectionId, Owner, SourceKey, SourceRecord, SourceState};
pub use transitions::{SourceTransition, TransitionLog, RECENT_TRANSITIONS};
