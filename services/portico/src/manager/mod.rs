//! Listener reconciliation.
//!
//! [`ListenerManager`] owns every protocol listener and static tunnel the
//! process has bound. Callers describe the desired state; the manager diffs
//! it against what is running and opens or closes only the difference.

mod listeners;
mod tunnels;

pub use listeners::{InboundStatus, LegacyBinding, ListenerManager};
pub use tunnels::{TunnelKey, TunnelRegistry, TunnelSpec, TunnelStatus};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport<K> {
    pub closed: Vec<K>,
    pub created: Vec<K>,
    pub failed: Vec<(K, String)>,
}

impl<K> Default for ReconcileReport<K> {
    fn default() -> Self {
        Self {
            closed: Vec::new(),
            created: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<K> ReconcileReport<K> {
    /// True if the pass neither opened nor closed anything.
    pub fn is_noop(&self) -> bool {
        self.closed.is_empty() && self.created.is_empty() && self.failed.is_empty()
    }
}
