//! Per-domain migration watcher.
//!
//! A watcher owns the polling loop for one domain. Each tick:
//! 1. reads the record and its version (a missing record ends the watch)
//! 2. queries the daemon for job statistics
//! 3. decodes them
//! 4. handles "no job present"
//! 5. writes the patch conditionally on the version read in 1
//! 6. ends the watch once a terminal phase has been decoded, written or not
//!
//! Cancellation and the absolute deadline are checked around every await, so
//! a stopped or expired watch never writes again.

use chrono::Utc;
use kvm_id::{DomainRef, DomainUuid};
use thiserror::Error;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::decoder::{decode_job_stats, DecodedJob};
use super::record::{MigrationPhase, StatusPatch};
use super::registry::MigrationWatchRegistry;
use super::WatchContext;
use crate::daemon::DaemonError;
use crate::store::StoreError;

// =============================================================================
// Errors and Outcomes
// =============================================================================

/// Failures that end a watch.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The record was deleted while the domain was being tracked.
    #[error("migration record {0} not found")]
    RecordNotFound(DomainUuid),

    /// The record could not be created.
    #[error("failed to create migration record: {0}")]
    Create(#[source] StoreError),
}

/// Result of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The patch was written; carries the phase now stored.
    Written(MigrationPhase),
    /// A phase was decoded but the patch could not be written.
    Unsaved(MigrationPhase),
    /// Nothing to write this tick.
    Skipped,
}

impl TickOutcome {
    /// Phase decoded this tick, whether or not it was stored.
    pub fn decoded_phase(&self) -> Option<MigrationPhase> {
        match self {
            Self::Written(phase) | Self::Unsaved(phase) => Some(*phase),
            Self::Skipped => None,
        }
    }
}

/// Why a watch ended.
#[derive(Debug)]
pub enum WatchExit {
    /// A terminal phase was decoded.
    Finished(MigrationPhase),
    /// The watch was stopped explicitly.
    Cancelled,
    /// The absolute deadline passed.
    TimedOut,
    /// The watch hit an unrecoverable error.
    Failed(WatchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollMode {
    Watch,
    Finalize,
}

// =============================================================================
// Single Poll
// =============================================================================

/// Sample job statistics once and persist them.
async fn poll_once(
    ctx: &WatchContext,
    domain: &DomainRef,
    mode: PollMode,
    last_phase: MigrationPhase,
) -> Result<TickOutcome, WatchError> {
    let id = domain.uuid;

    let record = match ctx.store.get(&id).await {
        Ok(record) => record,
        Err(e) if e.is_not_found() => return Err(WatchError::RecordNotFound(id)),
        Err(e) => {
            warn!(domain = %id, error = %e, "Failed to read migration record");
            return Ok(TickOutcome::Skipped);
        }
    };

    let finalize = mode == PollMode::Finalize;
    let decoded = match ctx.daemon.job_stats(domain, finalize).await {
        Ok(stats) => decode_job_stats(stats.job_type, &stats.params),
        // Job details already reaped by the daemon.
        Err(DaemonError::DomainNotFound) => DecodedJob::NoJob,
        Err(DaemonError::DomainNotRunning) => {
            info!(domain = %id, "Domain is not running, skipping migration update");
            return Ok(TickOutcome::Skipped);
        }
        Err(e) => {
            warn!(domain = %id, error = %e, "Failed to query job statistics");
            return Ok(TickOutcome::Skipped);
        }
    };

    let patch = match decoded {
        DecodedJob::NoJob if ctx.inventory.is_known_stopped(&id) => {
            info!(domain = %id, "Domain stopped, no job statistics to record");
            return Ok(TickOutcome::Skipped);
        }
        DecodedJob::NoJob if finalize => {
            info!(
                domain = %id,
                "Migration job details reaped, marking migration completed"
            );
            StatusPatch::phase(MigrationPhase::Completed)
        }
        DecodedJob::NoJob => {
            debug!(domain = %id, "No job present");
            return Ok(TickOutcome::Skipped);
        }
        DecodedJob::Progress(mut patch) => {
            if finalize {
                patch.destination_host = Some(ctx.host.clone());
            }
            patch
        }
    };

    let phase = patch.phase.unwrap_or(record.status.phase);
    if phase.rank() < last_phase.rank() {
        debug!(
            domain = %id,
            phase = %phase,
            last_phase = %last_phase,
            "Ignoring phase regression"
        );
        return Ok(TickOutcome::Skipped);
    }

    if write_patch(ctx, &id, record.version, &patch, phase).await? {
        return Ok(TickOutcome::Written(phase));
    }

    if !phase.is_terminal() {
        return Ok(TickOutcome::Unsaved(phase));
    }

    // A terminal phase gets one retry against the current version.
    let version = match ctx.store.get(&id).await {
        Ok(record) => record.version,
        Err(e) if e.is_not_found() => return Err(WatchError::RecordNotFound(id)),
        Err(e) => {
            warn!(domain = %id, error = %e, "Failed to re-read migration record");
            return Ok(TickOutcome::Unsaved(phase));
        }
    };

    if write_patch(ctx, &id, version, &patch, phase).await? {
        Ok(TickOutcome::Written(phase))
    } else {
        Ok(TickOutcome::Unsaved(phase))
    }
}

/// Conditionally write a patch. Returns `false` if it was not stored.
async fn write_patch(
    ctx: &WatchContext,
    id: &DomainUuid,
    version: u64,
    patch: &StatusPatch,
    phase: MigrationPhase,
) -> Result<bool, WatchError> {
    match ctx.store.patch(id, version, patch).await {
        Ok(version) => {
            debug!(domain = %id, phase = %phase, version, "Migration status updated");
            Ok(true)
        }
        Err(e) if e.is_conflict() => {
            debug!(domain = %id, error = %e, "Migration record changed since read");
            Ok(false)
        }
        Err(e) if e.is_not_found() => Err(WatchError::RecordNotFound(*id)),
        Err(e) => {
            warn!(domain = %id, error = %e, "Failed to update migration record");
            Ok(false)
        }
    }
}

/// Run one finalize pass for a domain that just resumed.
///
/// Reads the completed-job statistics; if the daemon has none left, the
/// migration is recorded as completed. Any local watch for the domain is
/// stopped first, and again once a terminal phase is written.
pub async fn finalize_migration(
    registry: &MigrationWatchRegistry,
    domain: &DomainRef,
) -> Result<TickOutcome, WatchError> {
    if registry.stop_watch(&domain.uuid) {
        debug!(domain = %domain.uuid, "Stopped local watch before finalizing");
    }

    let outcome = poll_once(
        registry.context(),
        domain,
        PollMode::Finalize,
        MigrationPhase::None,
    )
    .await?;

    if let TickOutcome::Written(phase) = outcome {
        if phase.is_terminal() {
            info!(domain = %domain.uuid, phase = %phase, "Migration finalized");
            registry.stop_watch(&domain.uuid);
        }
    }

    Ok(outcome)
}

// =============================================================================
// Watcher
// =============================================================================

/// Polling task tracking one domain's migration.
pub struct MigrationWatcher {
    domain: DomainRef,
    registry: MigrationWatchRegistry,
    token: CancellationToken,
    generation: u64,
    deadline: Instant,
    last_phase: MigrationPhase,
}

impl MigrationWatcher {
    pub(crate) fn new(
        domain: DomainRef,
        registry: MigrationWatchRegistry,
        token: CancellationToken,
        generation: u64,
        deadline: Instant,
    ) -> Self {
        Self {
            domain,
            registry,
            token,
            generation,
            deadline,
            last_phase: MigrationPhase::None,
        }
    }

    /// Run the watch to completion and deregister it.
    pub async fn run(mut self) -> WatchExit {
        let exit = self.watch().await;
        let id = self.domain.uuid;

        match &exit {
            WatchExit::Finished(phase) => {
                info!(domain = %id, phase = %phase, "Migration finished, stopping watch");
            }
            WatchExit::Cancelled => {
                info!(domain = %id, "Migration watch stopped");
            }
            WatchExit::TimedOut => {
                warn!(
                    domain = %id,
                    timeout_secs = self.registry.context().settings.max_watch_duration.as_secs(),
                    "Migration watch timed out"
                );
                self.token.cancel();
            }
            WatchExit::Failed(e) => {
                warn!(domain = %id, error = %e, "Migration watch failed");
            }
        }

        self.registry.release(&id, self.generation);
        exit
    }

    async fn watch(&mut self) -> WatchExit {
        let token = self.token.clone();
        let deadline = sleep_until(self.deadline);
        tokio::pin!(deadline);

        tokio::select! {
            biased;
            _ = token.cancelled() => return WatchExit::Cancelled,
            _ = &mut deadline => return WatchExit::TimedOut,
            result = self.prepare_record() => {
                if let Err(e) = result {
                    return WatchExit::Failed(e);
                }
            }
        }

        let period = self.registry.context().settings.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return WatchExit::Cancelled,
                _ = &mut deadline => return WatchExit::TimedOut,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return WatchExit::Cancelled,
                _ = &mut deadline => return WatchExit::TimedOut,
                outcome = poll_once(
                    self.registry.context(),
                    &self.domain,
                    PollMode::Watch,
                    self.last_phase,
                ) => outcome,
            };

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => return WatchExit::Failed(e),
            };

            if let TickOutcome::Written(phase) = outcome {
                self.last_phase = phase;
            }

            match outcome.decoded_phase() {
                Some(phase) if phase.is_terminal() => {
                    if let TickOutcome::Unsaved(_) = outcome {
                        warn!(
                            domain = %self.domain.uuid,
                            phase = %phase,
                            "Terminal migration phase could not be recorded"
                        );
                    }
                    return WatchExit::Finished(phase);
                }
                _ => {}
            }
        }
    }

    /// Ensure the record exists and stamp start time and origin host.
    async fn prepare_record(&self) -> Result<(), WatchError> {
        let ctx = self.registry.context();
        let id = self.domain.uuid;

        ctx.store.create(&id).await.map_err(WatchError::Create)?;

        let record = match ctx.store.get(&id).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Err(WatchError::RecordNotFound(id)),
            Err(e) => {
                warn!(domain = %id, error = %e, "Failed to read migration record");
                return Ok(());
            }
        };

        let stamp = StatusPatch {
            started: Some(Utc::now()),
            origin_host: Some(ctx.host.clone()),
            ..StatusPatch::default()
        };

        if let Err(e) = ctx.store.patch(&id, record.version, &stamp).await {
            warn!(domain = %id, error = %e, "Failed to stamp migration start");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use kvm_id::HostId;

    use super::*;
    use crate::daemon::{EmulatedDaemon, JobStats, JobType, TypedParam};
    use crate::inventory::DomainInventory;
    use crate::migration::{MigrationRecord, WatchSettings};
    use crate::store::{MemoryRecordStore, RecordStore};

    struct Fixture {
        daemon: Arc<EmulatedDaemon>,
        store: Arc<MemoryRecordStore>,
        inventory: Arc<DomainInventory>,
        ctx: WatchContext,
        domain: DomainRef,
    }

    fn fixture() -> Fixture {
        let daemon = Arc::new(EmulatedDaemon::new());
        let store = Arc::new(MemoryRecordStore::new());
        let inventory = Arc::new(DomainInventory::new());
        let ctx = WatchContext {
            daemon: daemon.clone(),
            store: store.clone(),
            inventory: inventory.clone(),
            host: HostId::parse("host-a").unwrap(),
            settings: WatchSettings::default(),
        };
        let domain = DomainRef::new("instance-00000001", DomainUuid::new_v4());
        store.insert(MigrationRecord::empty(domain.uuid));

        Fixture {
            daemon,
            store,
            inventory,
            ctx,
            domain,
        }
    }

    #[tokio::test]
    async fn test_poll_writes_progress() {
        let f = fixture();
        f.daemon.set_job_stats(
            &f.domain.uuid,
            JobStats::new(
                JobType::Bounded,
                vec![TypedParam::ullong("data_total", 2_097_152)],
            ),
        );

        let outcome = poll_once(&f.ctx, &f.domain, PollMode::Watch, MigrationPhase::None)
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Written(MigrationPhase::Bounded));

        let record = f.store.snapshot(&f.domain.uuid).unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.status.data_total.as_deref(), Some("2.0 MiB"));
        assert_eq!(record.status.destination_host, None);
    }

    #[tokio::test]
    async fn test_no_job_on_stopped_domain_is_not_written() {
        let f = fixture();
        f.inventory
            .observe(&f.domain.uuid, crate::daemon::LifecycleEvent::Stopped);

        let outcome = poll_once(&f.ctx, &f.domain, PollMode::Finalize, MigrationPhase::None)
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Skipped);
        assert_eq!(f.store.snapshot(&f.domain.uuid).unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_domain_not_found_during_finalize_completes() {
        let f = fixture();
        f.daemon
            .fail_next(&f.domain.uuid, DaemonError::DomainNotFound);

        let outcome = poll_once(&f.ctx, &f.domain, PollMode::Finalize, MigrationPhase::None)
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Written(MigrationPhase::Completed));
        assert_eq!(f.daemon.completed_job_stats_calls(&f.domain.uuid), 1);

        let status = f.store.snapshot(&f.domain.uuid).unwrap().status;
        assert_eq!(status.phase, MigrationPhase::Completed);
        assert_eq!(status.destination_host, None);
    }

    #[tokio::test]
    async fn test_finalize_with_stats_stamps_destination() {
        let f = fixture();
        f.daemon.set_job_stats(
            &f.domain.uuid,
            JobStats::new(
                JobType::Completed,
                vec![TypedParam::boolean("success", true)],
            ),
        );

        let outcome = poll_once(&f.ctx, &f.domain, PollMode::Finalize, MigrationPhase::None)
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Written(MigrationPhase::Success));

        let status = f.store.snapshot(&f.domain.uuid).unwrap().status;
        assert_eq!(status.destination_host.unwrap().as_str(), "host-a");
    }

    #[tokio::test]
    async fn test_transient_daemon_error_skips_tick() {
        let f = fixture();
        f.daemon
            .fail_next(&f.domain.uuid, DaemonError::Rpc("timeout".to_string()));

        let outcome = poll_once(&f.ctx, &f.domain, PollMode::Watch, MigrationPhase::None)
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Skipped);
        assert_eq!(f.store.snapshot(&f.domain.uuid).unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_phase_regression_is_skipped() {
        let f = fixture();
        f.daemon.set_job_stats(
            &f.domain.uuid,
            JobStats::new(JobType::Bounded, vec![]),
        );

        let outcome = poll_once(
            &f.ctx,
            &f.domain,
            PollMode::Watch,
            MigrationPhase::Completed,
        )
        .await
        .unwrap();
        assert_eq!(outcome, TickOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_missing_record_is_fatal() {
        let f = fixture();
        f.store.remove(&f.domain.uuid);

        let err = poll_once(&f.ctx, &f.domain, PollMode::Watch, MigrationPhase::None)
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::RecordNotFound(id) if id == f.domain.uuid));
        assert_eq!(f.daemon.job_stats_calls(&f.domain.uuid), 0);
    }

    #[tokio::test]
    async fn test_conflicting_terminal_write_is_retried_once() {
        struct RacingStore(MemoryRecordStore);

        #[async_trait::async_trait]
        impl RecordStore for RacingStore {
            async fn get(&self, id: &DomainUuid) -> Result<MigrationRecord, StoreError> {
                let record = self.0.get(id).await?;
                // Another writer bumps the version right after our read.
                self.0.insert(record.clone());
                Ok(record)
            }

            async fn create(&self, id: &DomainUuid) -> Result<(), StoreError> {
                self.0.create(id).await
            }

            async fn patch(
                &self,
                id: &DomainUuid,
                version: u64,
                patch: &StatusPatch,
            ) -> Result<u64, StoreError> {
                self.0.patch(id, version, patch).await
            }
        }

        let mut f = fixture();
        let racing = RacingStore(MemoryRecordStore::new());
        racing.0.insert(MigrationRecord::empty(f.domain.uuid));
        f.ctx.store = Arc::new(racing);
        f.daemon.set_job_stats(
            &f.domain.uuid,
            JobStats::new(JobType::Completed, vec![]),
        );

        let outcome = poll_once(&f.ctx, &f.domain, PollMode::Watch, MigrationPhase::None)
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Unsaved(MigrationPhase::Completed));
        assert_eq!(outcome.decoded_phase(), Some(MigrationPhase::Completed));
    }

    #[test]
    fn test_default_settings() {
        let settings = WatchSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.max_watch_duration, Duration::from_secs(3600));
    }
}
