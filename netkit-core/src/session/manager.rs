//! Thread-safe session registry with admission control.
//!
//! One reader-writer lock guards the id → handle map; admission and removal
//! take the write side, lookup/iteration/broadcast the read side. Counters are
//! atomics so `can_accept` and the backpressure signal are lock-free.

use super::{Session, SessionHandle};
use netkit_config::SessionConfig;
use parking_lot::RwLock;
use prometheus::{IntCounter, IntGauge, Registry};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Prometheus gauges/counters mirroring the registry's atomics.
struct RegistryMetrics {
    active_sessions: IntGauge,
    sessions_accepted: IntCounter,
    sessions_rejected: IntCounter,
    sessions_cleaned_up: IntCounter,
}

impl RegistryMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let active_sessions = IntGauge::new(
            "netkit_active_sessions",
            "Current number of registered sessions",
        )?;
        let sessions_accepted = IntCounter::new(
            "netkit_sessions_accepted_total",
            "Total sessions admitted to the registry",
        )?;
        let sessions_rejected = IntCounter::new(
            "netkit_sessions_rejected_total",
            "Total admissions rejected at the session limit",
        )?;
        let sessions_cleaned_up = IntCounter::new(
            "netkit_sessions_cleaned_up_total",
            "Total sessions removed by idle cleanup",
        )?;

        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(sessions_accepted.clone()))?;
        registry.register(Box::new(sessions_rejected.clone()))?;
        registry.register(Box::new(sessions_cleaned_up.clone()))?;

        Ok(Self {
            active_sessions,
            sessions_accepted,
            sessions_rejected,
            sessions_cleaned_up,
        })
    }
}

pub struct SessionManager {
    config: SessionConfig,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    active_count: AtomicUsize,
    total_accepted: AtomicU64,
    total_rejected: AtomicU64,
    total_cleaned_up: AtomicU64,
    id_counter: AtomicU64,
    metrics: Option<RegistryMetrics>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            active_count: AtomicUsize::new(0),
            total_accepted: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            total_cleaned_up: AtomicU64::new(0),
            id_counter: AtomicU64::new(0),
            metrics: None,
        }
    }

    /// Registry with Prometheus metrics registered alongside the atomics.
    pub fn with_metrics(
        config: SessionConfig,
        registry: &Registry,
    ) -> Result<Self, prometheus::Error> {
        let metrics = RegistryMetrics::new(registry)?;
        let mut manager = Self::new(config);
        manager.metrics = Some(metrics);
        Ok(manager)
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Lock-free admission check.
    pub fn can_accept(&self) -> bool {
        self.active_count.load(Ordering::Acquire) < self.config.max_sessions
    }

    /// True once the active count reaches `backpressure_threshold × max_sessions`.
    pub fn is_backpressure_active(&self) -> bool {
        if !self.config.enable_backpressure {
            return false;
        }
        let threshold =
            (self.config.max_sessions as f64 * self.config.backpressure_threshold) as usize;
        self.active_count.load(Ordering::Acquire) >= threshold
    }

    /// Admits a session under `id`, or under a generated unique id when
    /// `None`. Returns the registry id, or `None` when the registry is full
    /// or the id is taken (both counted as rejections).
    pub fn add(&self, session: Arc<dyn Session>, id: Option<String>) -> Option<String> {
        if !self.can_accept() {
            self.note_rejected();
            return None;
        }

        let mut sessions = self.sessions.write();
        // Re-check under the write lock so the count invariant holds against
        // racing admissions.
        if sessions.len() >= self.config.max_sessions {
            self.note_rejected();
            return None;
        }
        let id = match id {
            Some(id) => {
                if sessions.contains_key(&id) {
                    self.note_rejected();
                    return None;
                }
                id
            }
            None => self.generate_id("session"),
        };
        sessions.insert(id.clone(), SessionHandle::with_id(id.clone(), session));
        self.active_count.fetch_add(1, Ordering::Release);
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.active_sessions.inc();
            metrics.sessions_accepted.inc();
        }
        debug!(session_id = %id, active = sessions.len(), "session admitted");
        Some(id)
    }

    /// Removes the id from the registry. The underlying session is not
    /// destroyed; callers still holding references keep it alive.
    pub fn remove(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.remove(id).is_some() {
            self.active_count.fetch_sub(1, Ordering::Release);
            if let Some(metrics) = &self.metrics {
                metrics.active_sessions.dec();
            }
            debug!(session_id = %id, active = sessions.len(), "session removed");
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Lookup and iteration
    // ------------------------------------------------------------------

    /// Returns a handle for the id; invalid when absent.
    pub fn get(&self, id: &str) -> SessionHandle {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .unwrap_or_else(SessionHandle::invalid)
    }

    /// Runs `f` against the handle while holding the shared-read guard, so
    /// the session cannot be removed during the callback.
    pub fn with<R>(&self, id: &str, f: impl FnOnce(&SessionHandle) -> R) -> Option<R> {
        let sessions = self.sessions.read();
        sessions.get(id).map(f)
    }

    /// Iterates a consistent point-in-time snapshot under the read lock.
    pub fn for_each(&self, mut f: impl FnMut(&SessionHandle)) {
        let sessions = self.sessions.read();
        for handle in sessions.values() {
            f(handle);
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Bulk operations
    // ------------------------------------------------------------------

    /// Copies the payload to every connected session's send path; returns the
    /// number of delivery attempts.
    pub fn broadcast(&self, data: &[u8]) -> usize {
        let sessions = self.sessions.read();
        let mut delivered = 0;
        for handle in sessions.values() {
            if handle.is_connected() {
                if let Err(e) = handle.send(data.to_vec()) {
                    debug!(session_id = %handle.id(), error = %e, "broadcast delivery failed");
                }
                delivered += 1;
            }
        }
        delivered
    }

    /// Stops and removes every activity-tracked session idle longer than the
    /// configured timeout. Returns the number of sessions cleaned.
    pub fn cleanup_idle_sessions(&self) -> usize {
        let idle_timeout = Duration::from_millis(self.config.idle_timeout_ms);
        let stale: Vec<SessionHandle> = {
            let sessions = self.sessions.read();
            sessions
                .values()
                .filter(|h| {
                    h.has_activity_tracking()
                        && h.idle_duration().is_some_and(|idle| idle > idle_timeout)
                })
                .cloned()
                .collect()
        };

        let mut cleaned = 0;
        for handle in stale {
            handle.stop();
            if self.remove(handle.id()) {
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            self.total_cleaned_up
                .fetch_add(cleaned as u64, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.sessions_cleaned_up.inc_by(cleaned as u64);
            }
            debug!(cleaned, "idle sessions cleaned up");
        }
        cleaned
    }

    /// Stops (per each session's `stop_on_clear` policy) and removes every
    /// session, zeroing the active count.
    pub fn clear_all(&self) {
        let drained: Vec<SessionHandle> = {
            let mut sessions = self.sessions.write();
            let drained = sessions.drain().map(|(_, h)| h).collect();
            self.active_count.store(0, Ordering::Release);
            if let Some(metrics) = &self.metrics {
                metrics.active_sessions.set(0);
            }
            drained
        };
        for handle in &drained {
            if handle.stop_on_clear() {
                handle.stop();
            }
        }
        debug!(count = drained.len(), "registry cleared");
    }

    // ------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    pub fn max_sessions(&self) -> usize {
        self.config.max_sessions
    }

    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }

    pub fn total_rejected(&self) -> u64 {
        self.total_rejected.load(Ordering::Relaxed)
    }

    pub fn total_cleaned_up(&self) -> u64 {
        self.total_cleaned_up.load(Ordering::Relaxed)
    }

    pub fn utilization(&self) -> f64 {
        if self.config.max_sessions == 0 {
            return 0.0;
        }
        self.active_count() as f64 / self.config.max_sessions as f64
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.config.idle_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.config.cleanup_interval_ms)
    }

    fn note_rejected(&self) {
        self.total_rejected.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.sessions_rejected.inc();
        }
    }

    /// Mints a registry-unique id from a counter plus random suffix.
    pub fn generate_id(&self, prefix: &str) -> String {
        let seq = self.id_counter.fetch_add(1, Ordering::Relaxed);
        let entropy = rand::thread_rng().next_u32();
        format!("{prefix}-{seq:08x}-{entropy:08x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::MockSession;

    fn manager(max: usize) -> SessionManager {
        SessionManager::new(SessionConfig {
            max_sessions: max,
            idle_timeout_ms: 50,
            cleanup_interval_ms: 10,
            enable_backpressure: true,
            backpressure_threshold: 0.5,
        })
    }

    #[test]
    fn admission_at_capacity_then_replace() {
        // Scenario: max_sessions=2, add A and B, reject C, remove A, admit C.
        let m = manager(2);
        let a = m.add(MockSession::new("a"), Some("a".into())).unwrap();
        let b = m.add(MockSession::new("b"), Some("b".into())).unwrap();
        assert_eq!((a.as_str(), b.as_str()), ("a", "b"));
        assert_eq!(m.active_count(), 2);

        assert!(m.add(MockSession::new("c"), Some("c".into())).is_none());
        assert_eq!(m.total_rejected(), 1);

        assert!(m.remove("a"));
        assert!(m.add(MockSession::new("c"), Some("c".into())).is_some());
        assert_eq!(m.active_count(), 2);
        assert_eq!(m.total_accepted(), 3);
    }

    #[test]
    fn count_tracks_map_size() {
        let m = manager(10);
        for i in 0..5 {
            m.add(MockSession::new(&format!("s{i}")), None).unwrap();
        }
        assert_eq!(m.active_count(), 5);
        assert_eq!(m.session_ids().len(), 5);
        m.clear_all();
        assert_eq!(m.active_count(), 0);
        assert!(m.session_ids().is_empty());
    }

    #[test]
    fn duplicate_id_rejected() {
        let m = manager(10);
        m.add(MockSession::new("dup"), Some("dup".into())).unwrap();
        assert!(m.add(MockSession::new("dup"), Some("dup".into())).is_none());
        assert_eq!(m.total_rejected(), 1);
    }

    #[test]
    fn generated_ids_are_unique() {
        let m = manager(100);
        let first = m.add(MockSession::new("x"), None).unwrap();
        let second = m.add(MockSession::new("y"), None).unwrap();
        assert_ne!(first, second);
        assert!(m.get(&first).is_valid());
    }

    #[test]
    fn lookup_until_removed() {
        let m = manager(10);
        let session = MockSession::new("look");
        m.add(session.clone(), Some("look".into())).unwrap();
        assert!(m.get("look").is_valid());
        assert!(m.with("look", |h| h.is_connected()).unwrap());
        m.remove("look");
        assert!(!m.get("look").is_valid());
        assert!(m.with("look", |_| ()).is_none());
    }

    #[test]
    fn broadcast_counts_connected_only() {
        let m = manager(10);
        assert_eq!(m.broadcast(b"hello"), 0);

        let up = MockSession::new("up");
        let down = MockSession::new("down");
        down.close();
        m.add(up.clone(), Some("up".into())).unwrap();
        m.add(down, Some("down".into())).unwrap();

        assert_eq!(m.broadcast(b"hello"), 1);
        assert_eq!(up.sent.lock().as_slice(), &[b"hello".to_vec()]);
    }

    #[test]
    fn idle_cleanup_stops_and_removes() {
        let m = manager(10);
        let stale = MockSession::new("stale");
        let fresh = MockSession::new("fresh");
        let untracked = MockSession::untracked("untracked");
        m.add(stale.clone(), Some("stale".into())).unwrap();
        m.add(fresh.clone(), Some("fresh".into())).unwrap();
        m.add(untracked.clone(), Some("untracked".into())).unwrap();

        stale.backdate_activity(Duration::from_millis(500));
        untracked.backdate_activity(Duration::from_millis(500));

        assert_eq!(m.cleanup_idle_sessions(), 1);
        assert!(stale.was_stopped());
        assert!(!fresh.was_stopped());
        // Untracked sessions are exempt from idle cleanup.
        assert!(m.get("untracked").is_valid());
        assert_eq!(m.total_cleaned_up(), 1);
        assert_eq!(m.active_count(), 2);
    }

    #[test]
    fn backpressure_threshold() {
        let m = manager(4); // threshold 0.5 => active at 2
        assert!(!m.is_backpressure_active());
        m.add(MockSession::new("1"), None).unwrap();
        assert!(!m.is_backpressure_active());
        m.add(MockSession::new("2"), None).unwrap();
        assert!(m.is_backpressure_active());
        assert!((m.utilization() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn clear_all_honors_stop_on_clear() {
        let m = manager(10);
        let s = MockSession::new("s");
        m.add(s.clone(), Some("s".into())).unwrap();
        m.clear_all();
        assert!(s.was_stopped());
        assert_eq!(m.active_count(), 0);
    }
}
