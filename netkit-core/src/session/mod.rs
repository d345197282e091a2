//! Session abstraction shared by every session-oriented server.
//!
//! A session is a live peer association identified by a stable string id. The
//! [`Session`] trait is object-safe; protocol servers register concrete
//! session types (TCP, WebSocket, HTTP, QUIC) with one [`SessionManager`]
//! through the type-erased [`SessionHandle`]. Recovering the concrete type is
//! a checked downcast; a mismatched request yields `None`.

mod manager;

pub use manager::SessionManager;

use crate::error::{NetResult, NetworkError};
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Behavior every managed session provides.
///
/// `last_activity`/`update_activity` and the two policy knobs have defaults so
/// session types opt in only to what they support:
/// `has_activity_tracking` enables idle cleanup, `stop_on_clear` controls
/// whether `clear_all` stops the session before dropping it from the registry.
pub trait Session: Send + Sync + 'static {
    /// Stable id for the session's lifetime.
    fn id(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Enqueues bytes on the session's send path. Must not block; the
    /// underlying writer runs on the reactor.
    fn send(&self, data: Vec<u8>) -> NetResult<()>;

    /// Immediately tears the transport down.
    fn close(&self);

    /// Requests a graceful stop.
    fn stop(&self);

    fn last_activity(&self) -> Option<Instant> {
        None
    }

    fn update_activity(&self) {}

    fn has_activity_tracking(&self) -> bool {
        false
    }

    fn stop_on_clear(&self) -> bool {
        true
    }

    /// Escape hatch for concrete-type recovery via [`SessionHandle::downcast_ref`].
    fn as_any(&self) -> &dyn Any;
}

/// Value-semantic, type-erased reference to a managed session.
///
/// An invalid handle (default-constructed, or recovered for a missing id)
/// acts as a no-op: queries return empty/zero and `send` reports
/// `connection_closed`.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    inner: Option<Arc<dyn Session>>,
}

impl SessionHandle {
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self {
            id: session.id().to_string(),
            inner: Some(session),
        }
    }

    /// Registers the session under an id differing from its intrinsic one.
    pub fn with_id(id: impl Into<String>, session: Arc<dyn Session>) -> Self {
        Self {
            id: id.into(),
            inner: Some(session),
        }
    }

    /// A handle referring to nothing.
    pub fn invalid() -> Self {
        Self {
            id: String::new(),
            inner: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_connected(&self) -> bool {
        self.inner.as_ref().is_some_and(|s| s.is_connected())
    }

    pub fn send(&self, data: Vec<u8>) -> NetResult<()> {
        match &self.inner {
            Some(s) => s.send(data),
            None => Err(NetworkError::connection_closed("session_handle")),
        }
    }

    pub fn close(&self) {
        if let Some(s) = &self.inner {
            s.close();
        }
    }

    pub fn stop(&self) {
        if let Some(s) = &self.inner {
            s.stop();
        }
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.inner.as_ref().and_then(|s| s.last_activity())
    }

    pub fn update_activity(&self) {
        if let Some(s) = &self.inner {
            s.update_activity();
        }
    }

    pub fn idle_duration(&self) -> Option<Duration> {
        self.last_activity().map(|at| at.elapsed())
    }

    pub fn has_activity_tracking(&self) -> bool {
        self.inner.as_ref().is_some_and(|s| s.has_activity_tracking())
    }

    pub fn stop_on_clear(&self) -> bool {
        self.inner.as_ref().is_some_and(|s| s.stop_on_clear())
    }

    /// Recovers a non-owning reference to the concrete session type, iff the
    /// runtime type matches.
    pub fn downcast_ref<T: Session>(&self) -> Option<&T> {
        self.inner.as_ref()?.as_any().downcast_ref::<T>()
    }

    /// The erased session, for callers that share ownership.
    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.inner.clone()
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::invalid()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Minimal in-memory session used by registry tests.
    pub struct MockSession {
        id: String,
        connected: AtomicBool,
        stopped: AtomicBool,
        pub sent: Mutex<Vec<Vec<u8>>>,
        last_activity: Mutex<Instant>,
        tracked: bool,
    }

    impl MockSession {
        pub fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                connected: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
                last_activity: Mutex::new(Instant::now()),
                tracked: true,
            })
        }

        pub fn untracked(id: &str) -> Arc<Self> {
            let s = Self {
                id: id.to_string(),
                connected: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
                last_activity: Mutex::new(Instant::now()),
                tracked: false,
            };
            Arc::new(s)
        }

        pub fn was_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }

        pub fn backdate_activity(&self, by: Duration) {
            *self.last_activity.lock() = Instant::now() - by;
        }
    }

    impl Session for MockSession {
        fn id(&self) -> &str {
            &self.id
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn send(&self, data: Vec<u8>) -> NetResult<()> {
            self.sent.lock().push(data);
            Ok(())
        }

        fn close(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
        }

        fn last_activity(&self) -> Option<Instant> {
            Some(*self.last_activity.lock())
        }

        fn update_activity(&self) {
            *self.last_activity.lock() = Instant::now();
        }

        fn has_activity_tracking(&self) -> bool {
            self.tracked
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockSession;
    use super::*;

    struct OtherSession;

    impl Session for OtherSession {
        fn id(&self) -> &str {
            "other"
        }
        fn is_connected(&self) -> bool {
            false
        }
        fn send(&self, _data: Vec<u8>) -> NetResult<()> {
            Ok(())
        }
        fn close(&self) {}
        fn stop(&self) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn invalid_handle_is_noop() {
        let handle = SessionHandle::invalid();
        assert!(!handle.is_valid());
        assert!(handle.id().is_empty());
        assert!(!handle.is_connected());
        assert!(handle.last_activity().is_none());
        assert!(handle.idle_duration().is_none());
        assert!(handle.send(vec![1]).is_err());
        handle.close();
        handle.stop();
    }

    #[test]
    fn type_recovery_checks_runtime_type() {
        let session = MockSession::new("s1");
        let handle = SessionHandle::new(session.clone());
        assert_eq!(handle.id(), "s1");
        assert!(handle.downcast_ref::<MockSession>().is_some());
        assert!(handle.downcast_ref::<OtherSession>().is_none());

        handle.downcast_ref::<MockSession>().unwrap();
        handle.send(vec![9]).unwrap();
        assert_eq!(session.sent.lock().len(), 1);
    }
}
