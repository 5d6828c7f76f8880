//! Per-call event subscriptions.
//!
//! Each call admitted into the call graph gets one listener task that
//! forwards its events back into the coordinator. The table pairs every
//! live call with the guard that aborts that task, keyed exactly like the
//! call graph; the two maps must stay keyed identically at every
//! observable point.

use crate::types::ids::{DeviceId, UserId};
use std::collections::HashMap;
use tokio::task::JoinHandle;

/// Aborts the call's listener task when dropped.
#[derive(Debug)]
pub struct CallListenerGuard {
    handle: JoinHandle<()>,
}

impl CallListenerGuard {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }
}

impl Drop for CallListenerGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Default)]
pub struct CallHandlerTable {
    handlers: HashMap<UserId, HashMap<DeviceId, CallListenerGuard>>,
}

impl CallHandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, user_id: UserId, device_id: DeviceId, guard: CallListenerGuard) {
        self.handlers
            .entry(user_id)
            .or_default()
            .insert(device_id, guard);
    }

    /// Detach the guard for a call. The entry must exist; a miss means the
    /// graph and the table have diverged, which is an internal invariant
    /// violation.
    ///
    /// The guard is returned rather than dropped so the caller controls
    /// when the listener task is aborted (a listener disposing its own
    /// call must finish its bookkeeping first).
    pub fn remove(&mut self, user_id: &UserId, device_id: &DeviceId) -> CallListenerGuard {
        let inner = self
            .handlers
            .get_mut(user_id)
            .unwrap_or_else(|| panic!("no call handlers for user {user_id}"));
        let guard = inner
            .remove(device_id)
            .unwrap_or_else(|| panic!("no call handlers for {user_id} ({device_id})"));
        if inner.is_empty() {
            self.handlers.remove(user_id);
        }
        guard
    }

}
