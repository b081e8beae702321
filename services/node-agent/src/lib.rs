//! KVM Node Agent Library
//!
//! The node agent runs on each virtualization host and tracks live domain
//! migrations. It listens to the virtualization daemon's event channel and
//! mirrors the progress of every migration into a versioned record that the
//! rest of the cluster can read.
//!
//! ## Architecture
//!
//! ```text
//! MigrationAgent
//! └── EventMultiplexer             (one subscription per event category)
//!     └── lifecycle handlers
//!         └── MigrationWatchRegistry
//!             └── MigrationWatcher(domain)   (per-domain polling task)
//! ```
//!
//! ## Modules
//!
//! - `agent`: Keeps the multiplexer running across daemon disconnects
//! - `daemon`: Daemon client interface, event types and an emulated daemon
//! - `events`: Event multiplexer
//! - `handlers`: Lifecycle handlers bridging events to the registry
//! - `inventory`: Local run state of domains, fed by lifecycle events
//! - `migration`: Records, job statistics decoding, watchers and registry
//! - `store`: Migration record stores (in-memory and SQLite)

pub mod agent;
pub mod config;
pub mod daemon;
pub mod events;
pub mod handlers;
pub mod inventory;
pub mod migration;
pub mod store;

// Re-export commonly used types
pub use agent::MigrationAgent;
pub use daemon::{Daemon, DaemonError, EmulatedDaemon};
pub use events::{EventMultiplexer, MultiplexerError};
pub use inventory::DomainInventory;
pub use migration::{MigrationRecord, MigrationStatus, MigrationWatchRegistry, WatchContext};
pub use store::{MemoryRecordStore, RecordStore, SqliteRecordStore, StoreError};
