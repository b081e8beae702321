//! # kvm-id
//!
//! Identifiers shared by the KVM node agent.
//!
//! ## Design Principles
//!
//! - Domains are identified by the UUID the virtualization daemon assigns;
//!   the domain name is a mutable label and never used as a key
//! - Migration records are keyed by the hyphenated lowercase form of that UUID
//! - Host identifiers are validated hostnames, read once at startup
//!
//! ## Formats
//!
//! - `DomainUuid`: `6f1c4a8e-3d2b-4c5e-9a7f-0b1d2e3f4a5b`
//! - `HostId`: `compute-node-01`, `host-a.example.internal`

mod error;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
