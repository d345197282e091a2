//! Lock-protected callback slots.
//!
//! Each slot is an independently locked cell. Setting or replacing a callback
//! takes the lock; invocation clones the callable out of the lock and releases
//! it before calling, so user code can never deadlock against the slot.

use crate::error::NetworkError;
use parking_lot::Mutex;
use std::sync::Arc;

/// A single replaceable callback cell.
pub struct CallbackSlot<T: ?Sized> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T: ?Sized> CallbackSlot<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Installs or replaces the callback.
    pub fn set(&self, callback: Arc<T>) {
        *self.slot.lock() = Some(callback);
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Copies the callable out of the lock. Callers invoke the returned
    /// handle after this method returns, outside the slot lock.
    pub fn get(&self) -> Option<Arc<T>> {
        self.slot.lock().clone()
    }
}

impl<T: ?Sized> Default for CallbackSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

// Callback signatures shared across the protocol components. Payloads are
// passed by value; servers identify sessions by id string, never by reference.

/// Client data delivery: `(payload)`
pub type ReceiveCallback = dyn Fn(Vec<u8>) + Send + Sync;
/// Server data delivery: `(session_id, payload)`
pub type SessionReceiveCallback = dyn Fn(&str, Vec<u8>) + Send + Sync;
/// Client per-stream delivery: `(stream_id, payload, fin)`
pub type StreamReceiveCallback = dyn Fn(u64, Vec<u8>, bool) + Send + Sync;
/// Server per-stream delivery: `(session_id, stream_id, payload, fin)`
pub type SessionStreamReceiveCallback = dyn Fn(&str, u64, Vec<u8>, bool) + Send + Sync;
/// Connection established
pub type ConnectedCallback = dyn Fn() + Send + Sync;
/// Connection torn down
pub type DisconnectedCallback = dyn Fn() + Send + Sync;
/// Server session arrival/departure: `(session_id)`
pub type SessionEventCallback = dyn Fn(&str) + Send + Sync;
/// Asynchronous failure delivery
pub type ErrorCallback = dyn Fn(NetworkError) + Send + Sync;
/// 0-RTT payload provider, polled before the handshake completes
pub type EarlyDataCallback = dyn Fn() -> Vec<u8> + Send + Sync;
/// Server's 0-RTT verdict: `(accepted)`
pub type EarlyDataAcceptedCallback = dyn Fn(bool) + Send + Sync;
/// New TLS resumption ticket: `(ticket_id, lifetime_hint_secs, max_early_data)`
pub type SessionTicketCallback = dyn Fn(Vec<u8>, u32, u32) + Send + Sync;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn set_invoke_replace() {
        let slot: CallbackSlot<ReceiveCallback> = CallbackSlot::new();
        assert!(!slot.is_set());
        assert!(slot.get().is_none());

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        slot.set(Arc::new(move |_data| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(slot.is_set());
        if let Some(cb) = slot.get() {
            cb(vec![1, 2, 3]);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Replacement drops the old callable
        slot.set(Arc::new(|_data| {}));
        if let Some(cb) = slot.get() {
            cb(vec![]);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_may_replace_itself_without_deadlock() {
        let slot: Arc<CallbackSlot<ConnectedCallback>> = Arc::new(CallbackSlot::new());
        let inner = slot.clone();
        slot.set(Arc::new(move || {
            // Invocation happens outside the lock, so re-entrant set succeeds.
            inner.set(Arc::new(|| {}));
        }));
        let cb = slot.get().unwrap();
        cb();
        assert!(slot.is_set());
    }
}
