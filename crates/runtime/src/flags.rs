use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::FLAG;

/// The two cross-mode signals. Level-triggered: readers see the latest write
/// on their next check.
#[derive(Debug, Default)]
pub struct ModeFlags {
    engaged: AtomicBool,
    consolidation_pending: AtomicBool,
}

impl ModeFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    pub fn set_engaged(&self, value: bool) {
        let previous = self.engaged.swap(value, Ordering::SeqCst);
        if previous != value {
            debug!(target: FLAG, engaged = value, "engaged flag changed");
        }
    }

    pub fn is_consolidation_pending(&self) -> bool {
        self.consolidation_pending.load(Ordering::SeqCst)
    }

    pub fn set_consolidation_pending(&self, value: bool) {
        let previous = self.consolidation_pending.swap(value, Ordering::SeqCst);
        if previous != value {
            debug!(target: FLAG, consolidation_pending = value, "consolidation flag changed");
        }
    }
}
