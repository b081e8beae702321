//! Emulated virtualization daemon.
//!
//! Stands in for a real daemon connection during development and in tests:
//! events are injected with [`EmulatedDaemon::emit`], job statistics are
//! scripted per domain, and the connection can be dropped and restored.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use kvm_id::{DomainRef, DomainUuid};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::{Daemon, DaemonError, EventCategory, EventStream, JobStats, RawDomainEvent};

/// Capacity of each emulated subscription channel.
const SUBSCRIPTION_CAPACITY: usize = 256;

#[derive(Default)]
struct EmulatorState {
    subscriptions: HashMap<EventCategory, mpsc::Sender<RawDomainEvent>>,
    rejected: HashSet<EventCategory>,
    queued: HashMap<DomainUuid, VecDeque<Result<JobStats, DaemonError>>>,
    standing: HashMap<DomainUuid, JobStats>,
    calls: HashMap<DomainUuid, usize>,
    completed_calls: HashMap<DomainUuid, usize>,
}

/// Scriptable in-process daemon.
pub struct EmulatedDaemon {
    state: Mutex<EmulatorState>,
    disconnected_tx: watch::Sender<bool>,
}

impl EmulatedDaemon {
    /// Create a connected emulator with no scripted answers.
    pub fn new() -> Self {
        let (disconnected_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(EmulatorState::default()),
            disconnected_tx,
        }
    }

    /// Deliver an event to the subscription for its category.
    ///
    /// Returns `false` if nobody is subscribed or the channel is full.
    pub fn emit(&self, event: RawDomainEvent) -> bool {
        let category = event.payload.category();
        let state = self.state.lock();
        let Some(tx) = state.subscriptions.get(&category) else {
            debug!(category = %category, "[EMULATED] No subscriber for event");
            return false;
        };
        tx.try_send(event).is_ok()
    }

    /// Queue a one-shot job statistics answer for a domain.
    pub fn push_job_stats(&self, domain: &DomainUuid, stats: JobStats) {
        self.state
            .lock()
            .queued
            .entry(*domain)
            .or_default()
            .push_back(Ok(stats));
    }

    /// Queue a one-shot error answer for a domain.
    pub fn fail_next(&self, domain: &DomainUuid, error: DaemonError) {
        self.state
            .lock()
            .queued
            .entry(*domain)
            .or_default()
            .push_back(Err(error));
    }

    /// Set the answer returned once the queued answers are used up.
    ///
    /// Without a standing answer the emulator reports "no job".
    pub fn set_job_stats(&self, domain: &DomainUuid, stats: JobStats) {
        self.state.lock().standing.insert(*domain, stats);
    }

    /// Make subsequent subscriptions for `category` fail.
    pub fn reject_category(&self, category: EventCategory) {
        self.state.lock().rejected.insert(category);
    }

    /// Close the subscription channel for `category`.
    pub fn close_subscription(&self, category: EventCategory) {
        self.state.lock().subscriptions.remove(&category);
    }

    /// Drop the emulated connection.
    pub fn disconnect(&self) {
        info!("[EMULATED] Daemon connection lost");
        self.state.lock().subscriptions.clear();
        self.disconnected_tx.send_replace(true);
    }

    /// Restore the emulated connection.
    pub fn reconnect(&self) {
        info!("[EMULATED] Daemon connection restored");
        self.disconnected_tx.send_replace(false);
    }

    /// Number of job statistics queries made for a domain.
    pub fn job_stats_calls(&self, domain: &DomainUuid) -> usize {
        self.state.lock().calls.get(domain).copied().unwrap_or(0)
    }

    /// Number of completed-job statistics queries made for a domain.
    pub fn completed_job_stats_calls(&self, domain: &DomainUuid) -> usize {
        self.state
            .lock()
            .completed_calls
            .get(domain)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for EmulatedDaemon {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Daemon for EmulatedDaemon {
    async fn subscribe_events(&self, category: EventCategory) -> Result<EventStream, DaemonError> {
        if *self.disconnected_tx.borrow() {
            return Err(DaemonError::Disconnected);
        }

        let mut state = self.state.lock();
        if state.rejected.contains(&category) {
            return Err(DaemonError::SubscriptionRejected {
                category,
                reason: "rejected by emulator".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        state.subscriptions.insert(category, tx);
        debug!(category = %category, "[EMULATED] Subscribed to events");
        Ok(rx)
    }

    async fn job_stats(
        &self,
        domain: &DomainRef,
        include_completed: bool,
    ) -> Result<JobStats, DaemonError> {
        if *self.disconnected_tx.borrow() {
            return Err(DaemonError::Disconnected);
        }

        let mut state = self.state.lock();
        *state.calls.entry(domain.uuid).or_default() += 1;
        if include_completed {
            *state.completed_calls.entry(domain.uuid).or_default() += 1;
        }

        if let Some(answer) = state
            .queued
            .get_mut(&domain.uuid)
            .and_then(|queue| queue.pop_front())
        {
            return answer;
        }

        Ok(state
            .standing
            .get(&domain.uuid)
            .cloned()
            .unwrap_or_else(JobStats::none))
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnected_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{JobType, RawPayload, TypedParam};

    fn domain() -> DomainRef {
        DomainRef::new("instance-00000001", DomainUuid::new_v4())
    }

    #[tokio::test]
    async fn test_queued_answers_before_standing() {
        let daemon = EmulatedDaemon::new();
        let domain = domain();

        daemon.push_job_stats(
            &domain.uuid,
            JobStats::new(JobType::Bounded, vec![TypedParam::ullong("data_total", 1)]),
        );
        daemon.fail_next(&domain.uuid, DaemonError::DomainNotRunning);
        daemon.set_job_stats(&domain.uuid, JobStats::new(JobType::Completed, vec![]));

        let first = daemon.job_stats(&domain, false).await.unwrap();
        assert_eq!(first.job_type, JobType::Bounded);
        assert_eq!(
            daemon.job_stats(&domain, false).await.unwrap_err(),
            DaemonError::DomainNotRunning
        );
        let standing = daemon.job_stats(&domain, true).await.unwrap();
        assert_eq!(standing.job_type, JobType::Completed);

        assert_eq!(daemon.job_stats_calls(&domain.uuid), 3);
        assert_eq!(daemon.completed_job_stats_calls(&domain.uuid), 1);
    }

    #[tokio::test]
    async fn test_unscripted_domain_has_no_job() {
        let daemon = EmulatedDaemon::new();
        let stats = daemon.job_stats(&domain(), false).await.unwrap();
        assert_eq!(stats, JobStats::none());
    }

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let daemon = EmulatedDaemon::new();
        let mut rx = daemon
            .subscribe_events(EventCategory::MigrationIteration)
            .await
            .unwrap();

        let event = RawDomainEvent {
            domain: domain(),
            payload: RawPayload::MigrationIteration { iteration: 1 },
        };
        assert!(daemon.emit(event.clone()));
        assert_eq!(rx.recv().await.unwrap(), event);

        let lifecycle = RawDomainEvent {
            domain: domain(),
            payload: RawPayload::Lifecycle {
                event: 2,
                detail: 0,
            },
        };
        assert!(!daemon.emit(lifecycle));
    }

    #[tokio::test]
    async fn test_disconnect_closes_subscriptions() {
        let daemon = EmulatedDaemon::new();
        let mut rx = daemon
            .subscribe_events(EventCategory::Lifecycle)
            .await
            .unwrap();
        let signal = daemon.disconnected();

        daemon.disconnect();
        assert!(*signal.borrow());
        assert!(rx.recv().await.is_none());
        assert_eq!(
            daemon
                .subscribe_events(EventCategory::Lifecycle)
                .await
                .unwrap_err(),
            DaemonError::Disconnected
        );

        daemon.reconnect();
        assert!(!*daemon.disconnected().borrow());
    }

    #[tokio::test]
    async fn test_rejected_category() {
        let daemon = EmulatedDaemon::new();
        daemon.reject_category(EventCategory::JobCompleted);
        let err = daemon
            .subscribe_events(EventCategory::JobCompleted)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::SubscriptionRejected { .. }));
    }
}
