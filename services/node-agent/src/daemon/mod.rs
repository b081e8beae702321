//! Virtualization daemon interface.
//!
//! The daemon client abstracts the three calls the migration tracking core
//! depends on:
//! - Subscribing to a domain event category
//! - Fetching job statistics for a domain
//! - Observing connection loss
//!
//! The connection is owned by whoever constructs the client and is injected
//! into the event multiplexer and every watcher as `Arc<dyn Daemon>`.
//! An emulated implementation is provided for development and tests.

mod emulator;
mod types;

use async_trait::async_trait;
use kvm_id::DomainRef;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub use emulator::EmulatedDaemon;
pub use types::{
    DecodeError, DomainEvent, EventCategory, JobStats, JobType, LifecycleEvent, ParamValue,
    RawDomainEvent, RawPayload, TypedParam,
};

/// Stream of undecoded events for one category.
pub type EventStream = mpsc::Receiver<RawDomainEvent>;

/// Errors returned by daemon calls.
///
/// `DomainNotFound` and `DomainNotRunning` are sentinels the tracking core
/// matches on; everything else is treated as transient.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DaemonError {
    /// The daemon has no (job) information for the domain any more.
    #[error("domain not found")]
    DomainNotFound,

    /// The domain exists but is not running.
    #[error("domain is not running")]
    DomainNotRunning,

    /// The connection to the daemon is gone.
    #[error("daemon disconnected")]
    Disconnected,

    /// The daemon refused an event subscription.
    #[error("subscription to {category} events rejected: {reason}")]
    SubscriptionRejected {
        category: EventCategory,
        reason: String,
    },

    /// Any other call failure.
    #[error("daemon call failed: {0}")]
    Rpc(String),
}

/// Virtualization daemon client interface.
#[async_trait]
pub trait Daemon: Send + Sync {
    /// Open an event stream for the given category.
    async fn subscribe_events(&self, category: EventCategory) -> Result<EventStream, DaemonError>;

    /// Fetch job statistics for a domain.
    ///
    /// With `include_completed` the daemon reports the statistics of the
    /// most recently finished job instead of the active one.
    async fn job_stats(
        &self,
        domain: &DomainRef,
        include_completed: bool,
    ) -> Result<JobStats, DaemonError>;

    /// Connection state signal; the value is `true` while disconnected.
    fn disconnected(&self) -> watch::Receiver<bool>;
}
