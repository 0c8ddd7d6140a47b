//! beacon-core — policy engine, wire codec and configuration.
//! All other Beacon crates depend on this one.

pub mod config;
mod markup;
pub mod policy;
pub mod wire;

pub use policy::{Cidr, FilterRule, PolicySet, ShareDefault};
pub use wire::{Announcement, Frame, SourceDescriptor, WireError};
