//! Daemon event multiplexer.
//!
//! Owns one subscription per event category, opened lazily the first time a
//! handler is registered for it. The run loop polls every subscription
//! without blocking on any single one, decodes each raw event exactly once
//! into a [`DomainEvent`] and invokes the category's handlers synchronously
//! in registration order.
//!
//! A closed subscription or a daemon disconnect ends the loop with an error;
//! the caller recreates the multiplexer once the daemon is back.

use std::future::Future;
use std::sync::Arc;
use std::task::Poll;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::daemon::{
    Daemon, DaemonError, DomainEvent, EventCategory, EventStream, RawDomainEvent,
};

/// Callback invoked for every decoded event of a category.
///
/// Handlers run on the multiplexer task and must not block.
pub type EventHandler = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

/// Errors that end or prevent multiplexing.
#[derive(Debug, Error)]
pub enum MultiplexerError {
    /// The daemon refused to open a subscription.
    #[error("failed to subscribe to {category} events: {source}")]
    Subscription {
        category: EventCategory,
        #[source]
        source: DaemonError,
    },

    /// The daemon closed a subscription channel.
    #[error("{0} event subscription closed")]
    SubscriptionClosed(EventCategory),

    /// The daemon connection was lost.
    #[error("daemon disconnected")]
    Disconnected,
}

struct Subscription {
    category: EventCategory,
    stream: EventStream,
    handlers: Vec<(String, EventHandler)>,
}

/// Fans daemon events out to registered handlers.
pub struct EventMultiplexer {
    daemon: Arc<dyn Daemon>,
    subscriptions: Vec<Subscription>,
    /// Subscription checked first on the next wakeup.
    next_start: usize,
}

impl EventMultiplexer {
    pub fn new(daemon: Arc<dyn Daemon>) -> Self {
        Self {
            daemon,
            subscriptions: Vec::new(),
            next_start: 0,
        }
    }

    /// Register a handler for a category under `id`.
    ///
    /// Opens the category's subscription if this is its first handler.
    /// Registering an existing `id` again replaces that handler in place.
    pub async fn register_handler(
        &mut self,
        category: EventCategory,
        id: impl Into<String>,
        handler: EventHandler,
    ) -> Result<(), MultiplexerError> {
        let id = id.into();

        let index = match self.position(category) {
            Some(index) => index,
            None => {
                let stream = self
                    .daemon
                    .subscribe_events(category)
                    .await
                    .map_err(|source| MultiplexerError::Subscription { category, source })?;
                info!(category = %category, "Subscribed to daemon events");
                self.subscriptions.push(Subscription {
                    category,
                    stream,
                    handlers: Vec::new(),
                });
                self.subscriptions.len() - 1
            }
        };

        let handlers = &mut self.subscriptions[index].handlers;
        match handlers.iter_mut().find(|(existing, _)| *existing == id) {
            Some(slot) => {
                debug!(category = %category, handler = %id, "Replacing event handler");
                slot.1 = handler;
            }
            None => {
                debug!(category = %category, handler = %id, "Registered event handler");
                handlers.push((id, handler));
            }
        }

        Ok(())
    }

    /// Categories with an open subscription, in subscription order.
    pub fn subscribed_categories(&self) -> Vec<EventCategory> {
        self.subscriptions.iter().map(|s| s.category).collect()
    }

    /// Number of handlers registered for a category.
    pub fn handler_count(&self, category: EventCategory) -> usize {
        self.position(category)
            .map_or(0, |index| self.subscriptions[index].handlers.len())
    }

    fn position(&self, category: EventCategory) -> Option<usize> {
        self.subscriptions
            .iter()
            .position(|s| s.category == category)
    }

    /// Dispatch events until shutdown, disconnect or a closed subscription.
    ///
    /// Returns `Ok(())` only on shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), MultiplexerError> {
        let mut disconnected = self.daemon.disconnected();
        if *disconnected.borrow_and_update() {
            return Err(MultiplexerError::Disconnected);
        }

        info!(
            categories = ?self.subscribed_categories(),
            "Event multiplexer started"
        );

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Event multiplexer shutting down");
                        return Ok(());
                    }
                }

                changed = disconnected.changed() => {
                    if changed.is_err() || *disconnected.borrow() {
                        warn!("Daemon disconnected, stopping event multiplexer");
                        return Err(MultiplexerError::Disconnected);
                    }
                }

                next = next_event(&mut self.subscriptions, self.next_start) => {
                    match next {
                        Ok((index, raw)) => {
                            self.next_start = (index + 1) % self.subscriptions.len();
                            self.dispatch(index, raw);
                        }
                        Err(e) => {
                            warn!(error = %e, "Event subscription lost");
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&self, index: usize, raw: RawDomainEvent) {
        let subscription = &self.subscriptions[index];

        let event = match DomainEvent::decode(subscription.category, raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    category = %subscription.category,
                    error = %e,
                    "Dropping undecodable event"
                );
                return;
            }
        };

        for (_, handler) in &subscription.handlers {
            handler(&event);
        }
    }
}

/// Wait for the next event on any subscription.
///
/// Subscriptions are checked round-robin from `start`, so a backlog on one
/// category cannot delay the others. A closed channel is reported as soon as
/// it is seen.
fn next_event(
    subscriptions: &mut [Subscription],
    start: usize,
) -> impl Future<Output = Result<(usize, RawDomainEvent), MultiplexerError>> + '_ {
    std::future::poll_fn(move |cx| {
        let count = subscriptions.len();
        for offset in 0..count {
            let index = (start + offset) % count;
            let subscription = &mut subscriptions[index];
            match subscription.stream.poll_recv(cx) {
                Poll::Ready(Some(raw)) => return Poll::Ready(Ok((index, raw))),
                Poll::Ready(None) => {
                    return Poll::Ready(Err(MultiplexerError::SubscriptionClosed(
                        subscription.category,
                    )))
                }
                Poll::Pending => {}
            }
        }
        Poll::Pending
    })
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::daemon::{EmulatedDaemon, RawPayload};
    use kvm_id::{DomainRef, DomainUuid};

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> EventHandler {
        let log = log.clone();
        Arc::new(move |event: &DomainEvent| {
            log.lock().push(format!("{tag}:{}", event.domain().name));
        })
    }

    fn iteration(name: &str) -> RawDomainEvent {
        RawDomainEvent {
            domain: DomainRef::new(name, DomainUuid::new_v4()),
            payload: RawPayload::MigrationIteration { iteration: 1 },
        }
    }

    #[tokio::test]
    async fn test_subscription_is_opened_once() {
        let daemon = Arc::new(EmulatedDaemon::new());
        let mut mux = EventMultiplexer::new(daemon.clone());
        let log = Arc::new(Mutex::new(Vec::new()));

        mux.register_handler(EventCategory::MigrationIteration, "a", recorder(&log, "a"))
            .await
            .unwrap();
        mux.register_handler(EventCategory::MigrationIteration, "b", recorder(&log, "b"))
            .await
            .unwrap();

        assert_eq!(
            mux.subscribed_categories(),
            vec![EventCategory::MigrationIteration]
        );
        assert_eq!(mux.handler_count(EventCategory::MigrationIteration), 2);
        assert_eq!(mux.handler_count(EventCategory::Lifecycle), 0);
    }

    #[tokio::test]
    async fn test_reregistering_replaces_handler() {
        let daemon = Arc::new(EmulatedDaemon::new());
        let mut mux = EventMultiplexer::new(daemon.clone());
        let log = Arc::new(Mutex::new(Vec::new()));

        mux.register_handler(EventCategory::MigrationIteration, "a", recorder(&log, "old"))
            .await
            .unwrap();
        mux.register_handler(EventCategory::MigrationIteration, "b", recorder(&log, "b"))
            .await
            .unwrap();
        mux.register_handler(EventCategory::MigrationIteration, "a", recorder(&log, "new"))
            .await
            .unwrap();
        assert_eq!(mux.handler_count(EventCategory::MigrationIteration), 2);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(mux.run(shutdown_rx));
        tokio::task::yield_now().await;

        assert!(daemon.emit(iteration("vm-1")));
        tokio::task::yield_now().await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(*log.lock(), vec!["new:vm-1", "b:vm-1"]);
    }

    #[tokio::test]
    async fn test_rejected_subscription() {
        let daemon = Arc::new(EmulatedDaemon::new());
        daemon.reject_category(EventCategory::JobCompleted);
        let mut mux = EventMultiplexer::new(daemon);

        let err = mux
            .register_handler(
                EventCategory::JobCompleted,
                "log",
                Arc::new(|_: &DomainEvent| {}),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MultiplexerError::Subscription {
                category: EventCategory::JobCompleted,
                ..
            }
        ));
        assert!(mux.subscribed_categories().is_empty());
    }

    #[tokio::test]
    async fn test_run_fails_when_already_disconnected() {
        let daemon = Arc::new(EmulatedDaemon::new());
        daemon.disconnect();
        let mux = EventMultiplexer::new(daemon);

        let (_tx, rx) = watch::channel(false);
        let err = mux.run(rx).await.unwrap_err();
        assert!(matches!(err, MultiplexerError::Disconnected));
    }
}
