//! Registry of active migration watches.
//!
//! At most one watch exists per domain. The map is guarded by a synchronous
//! mutex that is never held across an await: check-and-insert happens under
//! the lock, the watcher task is spawned after it is released, and all record
//! I/O runs inside the watcher.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kvm_id::{DomainRef, DomainUuid};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::watcher::{finalize_migration, MigrationWatcher, TickOutcome};
use super::WatchContext;

struct WatchHandle {
    token: CancellationToken,
    generation: u64,
}

struct RegistryInner {
    ctx: WatchContext,
    watches: Mutex<HashMap<DomainUuid, WatchHandle>>,
    finalizing: Mutex<HashSet<DomainUuid>>,
    next_generation: AtomicU64,
}

/// Marks a finalize pass in flight; cleared on drop.
struct FinalizeGuard {
    registry: MigrationWatchRegistry,
    domain: DomainUuid,
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        self.registry.inner.finalizing.lock().remove(&self.domain);
    }
}

/// Shared handle to the per-domain watch table.
#[derive(Clone)]
pub struct MigrationWatchRegistry {
    inner: Arc<RegistryInner>,
}

impl MigrationWatchRegistry {
    pub fn new(ctx: WatchContext) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ctx,
                watches: Mutex::new(HashMap::new()),
                finalizing: Mutex::new(HashSet::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn context(&self) -> &WatchContext {
        &self.inner.ctx
    }

    /// Start watching a domain's migration.
    ///
    /// Returns `false` without side effects if a watch for the domain is
    /// already registered. Must be called from within a Tokio runtime.
    pub fn start_watch(&self, domain: &DomainRef) -> bool {
        let settings = &self.inner.ctx.settings;
        let token = CancellationToken::new();
        let deadline = Instant::now() + settings.max_watch_duration;

        let generation = {
            let mut watches = self.inner.watches.lock();
            if watches.contains_key(&domain.uuid) {
                debug!(domain = %domain.uuid, "Migration watch already active");
                return false;
            }

            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            watches.insert(
                domain.uuid,
                WatchHandle {
                    token: token.clone(),
                    generation,
                },
            );
            generation
        };

        info!(
            domain = %domain.uuid,
            name = %domain.name,
            timeout_secs = settings.max_watch_duration.as_secs(),
            "Starting migration watch"
        );

        let watcher = MigrationWatcher::new(
            domain.clone(),
            self.clone(),
            token,
            generation,
            deadline,
        );
        tokio::spawn(watcher.run());

        true
    }

    /// Stop the watch for a domain, if one is registered.
    ///
    /// The watcher observes the cancellation at its next await point and
    /// performs no further writes.
    pub fn stop_watch(&self, domain: &DomainUuid) -> bool {
        let mut watches = self.inner.watches.lock();
        match watches.remove(domain) {
            Some(handle) => {
                handle.token.cancel();
                info!(domain = %domain, "Stopping migration watch");
                true
            }
            None => false,
        }
    }

    /// Remove a watch that ended on its own.
    ///
    /// Only the entry created for `generation` is removed, so a finished
    /// watcher never drops a newer watch for the same domain.
    pub(crate) fn release(&self, domain: &DomainUuid, generation: u64) {
        let mut watches = self.inner.watches.lock();
        if watches
            .get(domain)
            .is_some_and(|handle| handle.generation == generation)
        {
            watches.remove(domain);
        }
    }

    /// Stop every registered watch. Returns the number stopped.
    pub fn stop_all(&self) -> usize {
        let mut watches = self.inner.watches.lock();
        let count = watches.len();
        for (_, handle) in watches.drain() {
            handle.token.cancel();
        }
        if count > 0 {
            info!(count, "Stopped all migration watches");
        }
        count
    }

    pub fn is_watching(&self, domain: &DomainUuid) -> bool {
        self.inner.watches.lock().contains_key(domain)
    }

    /// Number of registered watches.
    pub fn active_count(&self) -> usize {
        self.inner.watches.lock().len()
    }

    /// Run a finalize pass for a domain in the background.
    ///
    /// Returns `None` without querying the daemon if a pass for the domain
    /// is already in flight.
    pub fn finalize(&self, domain: &DomainRef) -> Option<JoinHandle<()>> {
        if !self.inner.finalizing.lock().insert(domain.uuid) {
            debug!(domain = %domain.uuid, "Finalize pass already in flight");
            return None;
        }

        let guard = FinalizeGuard {
            registry: self.clone(),
            domain: domain.uuid,
        };
        let registry = self.clone();
        let domain = domain.clone();
        let timeout = self.inner.ctx.settings.finalize_timeout;

        Some(tokio::spawn(async move {
            let _guard = guard;
            let id = domain.uuid;
            match tokio::time::timeout(timeout, finalize_migration(&registry, &domain)).await {
                Ok(Ok(TickOutcome::Written(phase))) => {
                    debug!(domain = %id, phase = %phase, "Finalize pass recorded status");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    // Resuming a domain that never migrated leaves no record.
                    debug!(domain = %id, error = %e, "Nothing to finalize");
                }
                Err(_) => {
                    warn!(
                        domain = %id,
                        timeout_secs = timeout.as_secs(),
                        "Finalize pass timed out"
                    );
                }
            }
        }))
    }
}
