//! Lifecycle event handlers.
//!
//! Bridge daemon notifications to the watch registry:
//! - migration iteration: start watching the domain
//! - resumed: run one finalize pass
//! - stopped or shut down: stop watching the domain
//!
//! Every handler returns immediately; slow work runs on watcher tasks.

use std::sync::Arc;

use tracing::{debug, info};

use crate::daemon::{DomainEvent, EventCategory, LifecycleEvent};
use crate::events::{EventHandler, EventMultiplexer, MultiplexerError};
use crate::inventory::DomainInventory;
use crate::migration::MigrationWatchRegistry;

pub const MIGRATION_ITERATION_HANDLER: &str = "migration-iteration";
pub const LIFECYCLE_HANDLER: &str = "domain-lifecycle";
pub const JOB_COMPLETED_HANDLER: &str = "job-completed";

/// Start a watch on every migration iteration.
pub fn on_migration_iteration(registry: MigrationWatchRegistry) -> EventHandler {
    Arc::new(move |event: &DomainEvent| {
        if let DomainEvent::MigrationIteration { domain, iteration } = event {
            debug!(domain = %domain.uuid, iteration, "Migration iteration");
            registry.start_watch(domain);
        }
    })
}

/// Track run state and start or stop migration tracking on lifecycle changes.
pub fn on_lifecycle(
    registry: MigrationWatchRegistry,
    inventory: Arc<DomainInventory>,
) -> EventHandler {
    Arc::new(move |event: &DomainEvent| {
        let DomainEvent::Lifecycle {
            domain,
            event,
            detail,
        } = event
        else {
            return;
        };

        info!(
            domain = %domain.uuid,
            name = %domain.name,
            event = %event.as_str(),
            detail,
            "Domain lifecycle event"
        );
        inventory.observe(&domain.uuid, *event);

        match event {
            LifecycleEvent::Started if *detail == LifecycleEvent::STARTED_MIGRATED => {
                info!(domain = %domain.uuid, "Incoming migration started");
            }
            LifecycleEvent::Resumed => {
                registry.finalize(domain);
            }
            LifecycleEvent::Stopped | LifecycleEvent::Shutdown => {
                registry.stop_watch(&domain.uuid);
            }
            _ => {}
        }
    })
}

/// Log the parameters of every completed job.
pub fn on_job_completed() -> EventHandler {
    Arc::new(|event: &DomainEvent| {
        if let DomainEvent::JobCompleted { domain, params } = event {
            let params: Vec<String> = params
                .iter()
                .map(|p| format!("{}={}", p.field, p.value))
                .collect();
            info!(domain = %domain.uuid, params = ?params, "Job completed");
        }
    })
}

/// Register all handlers on a multiplexer.
pub async fn register_handlers(
    mux: &mut EventMultiplexer,
    registry: &MigrationWatchRegistry,
    inventory: &Arc<DomainInventory>,
) -> Result<(), MultiplexerError> {
    mux.register_handler(
        EventCategory::Lifecycle,
        LIFECYCLE_HANDLER,
        on_lifecycle(registry.clone(), inventory.clone()),
    )
    .await?;
    mux.register_handler(
        EventCategory::MigrationIteration,
        MIGRATION_ITERATION_HANDLER,
        on_migration_iteration(registry.clone()),
    )
    .await?;
    mux.register_handler(
        EventCategory::JobCompleted,
        JOB_COMPLETED_HANDLER,
        on_job_completed(),
    )
    .await?;

    Ok(())
}
