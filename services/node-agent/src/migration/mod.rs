//! Live migration tracking.
//!
//! One watcher task per migrating domain samples the daemon's job statistics
//! once per poll interval and mirrors them into the domain's migration record.
//!
//! ```text
//! MigrationWatchRegistry  (domain -> cancellation token, one per domain)
//! └── MigrationWatcher(domain)
//!     ├── Daemon::job_stats        (one outstanding query at a time)
//!     ├── decode_job_stats         (pure)
//!     └── RecordStore::patch       (conditional on the version read)
//! ```
//!
//! ## Watch state machine
//!
//! ```text
//! started -> polling -> polling
//!               |-----> stopped (terminal phase written)
//!               |-----> stopped (cancelled: explicit stop)
//!               +-----> stopped (timed out: absolute deadline)
//! ```

mod decoder;
mod record;
mod registry;
mod watcher;

use std::sync::Arc;
use std::time::Duration;

use kvm_id::HostId;

use crate::daemon::Daemon;
use crate::inventory::DomainInventory;
use crate::store::RecordStore;

pub use decoder::{decode_job_stats, format_bytes_iec, format_duration, DecodedJob};
pub use record::{JobOperation, MigrationPhase, MigrationRecord, MigrationStatus, StatusPatch};
pub use registry::MigrationWatchRegistry;
pub use watcher::{finalize_migration, MigrationWatcher, TickOutcome, WatchError, WatchExit};

/// Timing of migration watches.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    /// Interval between job statistics samples.
    pub poll_interval: Duration,

    /// Absolute lifetime of a single watch.
    pub max_watch_duration: Duration,

    /// Upper bound for a single finalize pass.
    pub finalize_timeout: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_watch_duration: Duration::from_secs(60 * 60),
            finalize_timeout: Duration::from_secs(30),
        }
    }
}

/// Collaborators shared by every watcher.
pub struct WatchContext {
    /// Daemon connection.
    pub daemon: Arc<dyn Daemon>,

    /// Cluster record store.
    pub store: Arc<dyn RecordStore>,

    /// Local domain run state.
    pub inventory: Arc<DomainInventory>,

    /// Identifier of this host.
    pub host: HostId,

    pub settings: WatchSettings,
}
