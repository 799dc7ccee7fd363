//! Connection-handle activity tracking.
//!
//! A narrow slice of the original's `BluetoothActivities` debug
//! subsystem: just enough connection-handle bookkeeping for the
//! packet rescuer's plausibility checks and for the end-to-end
//! connection-tracking scenario. The full activity/statistics
//! collector is out of scope.

use parking_lot::RwLock;
use std::collections::HashSet;

#[derive(Default)]
pub struct ConnectionActivities {
    handles: RwLock<HashSet<u16>>,
}

impl ConnectionActivities {
    pub fn new() -> Self {
        ConnectionActivities::default()
    }

    pub fn on_connection_complete(&self, handle: u16, success: bool) {
        if success {
            self.handles.write().insert(handle);
        }
    }

    pub fn on_disconnection_complete(&self, handle: u16, success: bool) {
        if success {
            self.handles.write().remove(&handle);
        }
    }

    pub fn is_connected(&self, handle: u16) -> bool {
        self.handles.read().contains(&handle)
    }

    pub fn count(&self) -> usize {
        self.handles.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_connect_and_disconnect() {
        let activities = ConnectionActivities::new();
        assert!(!activities.is_connected(0x0001));

        activities.on_connection_complete(0x0001, true);
        assert!(activities.is_connected(0x0001));
        assert_eq!(activities.count(), 1);

        activities.on_disconnection_complete(0x0001, true);
        assert!(!activities.is_connected(0x0001));
        assert_eq!(activities.count(), 0);
    }

    #[test]
    fn failed_connection_complete_is_not_tracked() {
        let activities = ConnectionActivities::new();
        activities.on_connection_complete(0x0002, false);
        assert!(!activities.is_connected(0x0002));
    }
}
