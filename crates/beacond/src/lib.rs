//! beacond: discovery server and filtering relay.

pub mod discovery;
pub mod relay;

pub use discovery::DiscoveryServer;
pub use relay::{RelayServer, RelaySettings};
