//! Local view of domain run state.
//!
//! Maintained from lifecycle events only. A watcher consults it to tell a
//! "no job" answer for a domain that has just stopped (benign) from one for
//! a domain that is still running.

use std::collections::HashMap;

use kvm_id::DomainUuid;
use parking_lot::Mutex;

use crate::daemon::LifecycleEvent;

/// Last observed run state of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainRunState {
    Defined,
    Running,
    Paused,
    Stopped,
}

/// Domain run state tracked from lifecycle events.
#[derive(Debug, Default)]
pub struct DomainInventory {
    domains: Mutex<HashMap<DomainUuid, DomainRunState>>,
}

impl DomainInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a lifecycle transition.
    pub fn observe(&self, domain: &DomainUuid, event: LifecycleEvent) {
        let mut domains = self.domains.lock();
        let state = match event {
            LifecycleEvent::Undefined => {
                domains.remove(domain);
                return;
            }
            LifecycleEvent::Defined => {
                // Redefining a running domain does not change its run state.
                if domains.contains_key(domain) {
                    return;
                }
                DomainRunState::Defined
            }
            LifecycleEvent::Started | LifecycleEvent::Resumed => DomainRunState::Running,
            LifecycleEvent::Suspended | LifecycleEvent::PmSuspended => DomainRunState::Paused,
            LifecycleEvent::Stopped | LifecycleEvent::Shutdown | LifecycleEvent::Crashed => {
                DomainRunState::Stopped
            }
        };
        domains.insert(*domain, state);
    }

    pub fn state(&self, domain: &DomainUuid) -> Option<DomainRunState> {
        self.domains.lock().get(domain).copied()
    }

    /// True only if a stop was observed after the last start.
    pub fn is_known_stopped(&self, domain: &DomainUuid) -> bool {
        self.state(domain) == Some(DomainRunState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_domain_is_not_stopped() {
        let inventory = DomainInventory::new();
        assert!(!inventory.is_known_stopped(&DomainUuid::new_v4()));
    }

    #[test]
    fn test_run_state_transitions() {
        let inventory = DomainInventory::new();
        let id = DomainUuid::new_v4();

        inventory.observe(&id, LifecycleEvent::Defined);
        assert_eq!(inventory.state(&id), Some(DomainRunState::Defined));

        inventory.observe(&id, LifecycleEvent::Started);
        inventory.observe(&id, LifecycleEvent::Defined);
        assert_eq!(inventory.state(&id), Some(DomainRunState::Running));

        inventory.observe(&id, LifecycleEvent::Suspended);
        assert_eq!(inventory.state(&id), Some(DomainRunState::Paused));

        inventory.observe(&id, LifecycleEvent::Shutdown);
        assert!(inventory.is_known_stopped(&id));

        inventory.observe(&id, LifecycleEvent::Started);
        assert!(!inventory.is_known_stopped(&id));

        inventory.observe(&id, LifecycleEvent::Undefined);
        assert_eq!(inventory.state(&id), None);
    }
}
