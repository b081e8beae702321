//! Migration agent.
//!
//! Wires the event multiplexer, the lifecycle handlers and the watch
//! registry together and keeps them running across daemon disconnects:
//!
//! ```text
//! loop:
//!   build multiplexer + register handlers
//!   run until shutdown / disconnect / closed subscription
//!   on failure: stop every watch, wait for reconnect (or the retry delay)
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::daemon::Daemon;
use crate::events::{EventMultiplexer, MultiplexerError};
use crate::handlers::register_handlers;
use crate::inventory::DomainInventory;
use crate::migration::MigrationWatchRegistry;

/// Long-running migration tracking service for one host.
pub struct MigrationAgent {
    daemon: Arc<dyn Daemon>,
    registry: MigrationWatchRegistry,
    inventory: Arc<DomainInventory>,
    reconnect_delay: Duration,
}

impl MigrationAgent {
    pub fn new(
        daemon: Arc<dyn Daemon>,
        registry: MigrationWatchRegistry,
        inventory: Arc<DomainInventory>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            daemon,
            registry,
            inventory,
            reconnect_delay,
        }
    }

    pub fn registry(&self) -> &MigrationWatchRegistry {
        &self.registry
    }

    /// Run until `shutdown` is set.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Migration agent started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(error = %e, "Event multiplexer stopped");
                    self.registry.stop_all();
                }
            }

            if !self.wait_for_reconnect(&mut shutdown).await {
                break;
            }
            info!("Recreating event multiplexer");
        }

        let stopped = self.registry.stop_all();
        info!(stopped_watches = stopped, "Migration agent stopped");
    }

    async fn run_once(&self, shutdown: watch::Receiver<bool>) -> Result<(), MultiplexerError> {
        let mut mux = EventMultiplexer::new(self.daemon.clone());
        register_handlers(&mut mux, &self.registry, &self.inventory).await?;
        mux.run(shutdown).await
    }

    /// Wait until the daemon reports it is connected, then for the retry
    /// delay. Returns `false` on shutdown.
    async fn wait_for_reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut disconnected = self.daemon.disconnected();

        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => return false,
            result = disconnected.wait_for(|down| !*down) => {
                if result.is_err() {
                    warn!("Daemon connection signal closed");
                    return false;
                }
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => false,
            _ = tokio::time::sleep(self.reconnect_delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use kvm_id::{DomainRef, DomainUuid, HostId};

    use super::*;
    use crate::daemon::{EmulatedDaemon, RawDomainEvent, RawPayload};
    use crate::migration::{WatchContext, WatchSettings};
    use crate::store::MemoryRecordStore;

    fn agent(daemon: &Arc<EmulatedDaemon>) -> MigrationAgent {
        let inventory = Arc::new(DomainInventory::new());
        let registry = MigrationWatchRegistry::new(WatchContext {
            daemon: daemon.clone(),
            store: Arc::new(MemoryRecordStore::new()),
            inventory: inventory.clone(),
            host: HostId::parse("host-a").unwrap(),
            settings: WatchSettings::default(),
        });
        MigrationAgent::new(daemon.clone(), registry, inventory, Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_agent() {
        let daemon = Arc::new(EmulatedDaemon::new());
        let agent = agent(&daemon);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(agent.run(rx));
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();

        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_watches_and_resubscribes() {
        let daemon = Arc::new(EmulatedDaemon::new());
        let agent = agent(&daemon);
        let registry = agent.registry().clone();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(agent.run(rx));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let domain = DomainRef::new("vm-1", DomainUuid::new_v4());
        assert!(daemon.emit(RawDomainEvent {
            domain: domain.clone(),
            payload: RawPayload::MigrationIteration { iteration: 1 },
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.is_watching(&domain.uuid));

        daemon.disconnect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.active_count(), 0);

        daemon.reconnect();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(daemon.emit(RawDomainEvent {
            domain: domain.clone(),
            payload: RawPayload::MigrationIteration { iteration: 2 },
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.is_watching(&domain.uuid));

        tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(registry.active_count(), 0);
    }
}
