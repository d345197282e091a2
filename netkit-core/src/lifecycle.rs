//! Uniform start/stop state machine composed into every client and server.
//!
//! The state machine is `Initial → Starting → Running → Stopping → Stopped`;
//! a stopped component may start again. `stop` is idempotent and the stop
//! future is fulfilled exactly once per run. Components embed a [`Lifecycle`]
//! by value and wrap their protocol-specific startup/teardown between
//! `begin_start`/`finish_start` and `begin_stop`/`finish_stop`.

use crate::error::{ErrorCode, NetResult, NetworkError};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::watch;

/// Component lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initial,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LifecycleState::Initial,
            1 => LifecycleState::Starting,
            2 => LifecycleState::Running,
            3 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Initial => "initial",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        }
    }
}

const S_INITIAL: u8 = 0;
const S_STARTING: u8 = 1;
const S_RUNNING: u8 = 2;
const S_STOPPING: u8 = 3;
const S_STOPPED: u8 = 4;

/// Shared start/stop scaffolding.
///
/// All methods are safe to call concurrently; state transitions are CAS-based
/// so exactly one caller wins each transition.
pub struct Lifecycle {
    /// Component name used to tag errors and log lines
    name: String,
    state: AtomicU8,
    stop_initiated: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl Lifecycle {
    /// Creates a lifecycle in the `Initial` state.
    ///
    /// `wait_for_stop` on a never-started component returns immediately.
    pub fn new(name: impl Into<String>) -> Self {
        let (stop_tx, _) = watch::channel(true);
        Self {
            name: name.into(),
            state: AtomicU8::new(S_INITIAL),
            stop_initiated: AtomicBool::new(false),
            stop_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomic read of the running flag.
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == S_RUNNING
    }

    /// Transitions `Initial|Stopped → Starting` and arms a fresh stop future.
    ///
    /// Returns `already_exists` (with a `server_already_running` override
    /// available to servers via [`Lifecycle::begin_start_as_server`]) when the
    /// component is already starting or running.
    pub fn begin_start(&self) -> NetResult<()> {
        self.begin_start_with(ErrorCode::AlreadyExists)
    }

    /// Server-flavored `begin_start` reporting `server_already_running`.
    pub fn begin_start_as_server(&self) -> NetResult<()> {
        self.begin_start_with(ErrorCode::ServerAlreadyRunning)
    }

    fn begin_start_with(&self, busy_code: ErrorCode) -> NetResult<()> {
        for from in [S_INITIAL, S_STOPPED] {
            if self
                .state
                .compare_exchange(from, S_STARTING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.stop_initiated.store(false, Ordering::Release);
                self.stop_tx.send_replace(false);
                return Ok(());
            }
        }
        Err(NetworkError::new(
            busy_code,
            self.name.clone(),
            format!("start requested in state {}", self.state().as_str()),
        ))
    }

    /// Transitions `Starting → Running` after a successful `do_start`.
    pub fn finish_start(&self) {
        self.state.store(S_RUNNING, Ordering::Release);
        tracing::debug!(component = %self.name, "running");
    }

    /// Rolls a failed start back to `Stopped` and fulfills the stop future.
    pub fn abort_start(&self) {
        self.state.store(S_STOPPED, Ordering::Release);
        self.stop_tx.send_replace(true);
    }

    /// Claims the single stop execution.
    ///
    /// Returns `false` when the component is not running or another caller
    /// already initiated the stop; those callers treat stop as an Ok no-op.
    pub fn begin_stop(&self) -> bool {
        if self
            .stop_initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        match self.state.compare_exchange(
            S_RUNNING,
            S_STOPPING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(_) => {
                // Start never completed or already stopped; nothing to tear down.
                self.stop_initiated.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Transitions `Stopping → Stopped` and fulfills the stop future.
    pub fn finish_stop(&self) {
        self.state.store(S_STOPPED, Ordering::Release);
        self.stop_tx.send_replace(true);
        tracing::debug!(component = %self.name, "stopped");
    }

    /// Waits until the component reaches `Stopped`.
    ///
    /// Returns immediately when the component is already stopped or was never
    /// started. This is the only blocking point in the public API.
    pub async fn wait_for_stop(&self) {
        let mut rx = self.stop_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Error for operations that require a running component.
    pub fn not_running_error(&self) -> NetworkError {
        NetworkError::new(
            ErrorCode::NotInitialized,
            self.name.clone(),
            "component is not running",
        )
    }
}

/// Cancellation latch for pending connects and resolutions.
///
/// Every client arms the latch when a start begins and races its pending
/// resolve/connect against [`Canceller::cancelled`]; `stop` fires the latch in
/// any state, so a connect that never completes cannot outlive the component.
pub struct Canceller {
    tx: watch::Sender<bool>,
}

impl Canceller {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Re-arms the latch for a new start attempt.
    pub fn arm(&self) {
        self.tx.send_replace(false);
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` fires.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Canceller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn canceller_races_pending_work() {
        let c = std::sync::Arc::new(Canceller::new());
        c.arm();
        let racer = {
            let c = c.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = c.cancelled() => "cancelled",
                    _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => "connected",
                }
            })
        };
        tokio::task::yield_now().await;
        c.cancel();
        assert_eq!(racer.await.unwrap(), "cancelled");
        assert!(c.is_cancelled());
        c.arm();
        assert!(!c.is_cancelled());
    }

    #[test]
    fn transitions_through_full_cycle() {
        let lc = Lifecycle::new("test");
        assert_eq!(lc.state(), LifecycleState::Initial);
        assert!(!lc.is_running());

        lc.begin_start().unwrap();
        assert_eq!(lc.state(), LifecycleState::Starting);
        lc.finish_start();
        assert!(lc.is_running());

        // Second start is rejected
        let err = lc.begin_start().unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyExists);

        assert!(lc.begin_stop());
        assert_eq!(lc.state(), LifecycleState::Stopping);
        lc.finish_stop();
        assert_eq!(lc.state(), LifecycleState::Stopped);

        // Restart from stopped
        lc.begin_start().unwrap();
        lc.finish_start();
        assert!(lc.is_running());
        assert!(lc.begin_stop());
        lc.finish_stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let lc = Lifecycle::new("test");
        lc.begin_start().unwrap();
        lc.finish_start();
        assert!(lc.begin_stop());
        lc.finish_stop();
        // Subsequent stops are quiet no-ops
        assert!(!lc.begin_stop());
        assert!(!lc.begin_stop());
    }

    #[test]
    fn stop_before_start_is_noop() {
        let lc = Lifecycle::new("test");
        assert!(!lc.begin_stop());
        assert_eq!(lc.state(), LifecycleState::Initial);
    }

    #[test]
    fn server_flavor_reports_server_already_running() {
        let lc = Lifecycle::new("server");
        lc.begin_start_as_server().unwrap();
        lc.finish_start();
        let err = lc.begin_start_as_server().unwrap_err();
        assert_eq!(err.code, ErrorCode::ServerAlreadyRunning);
    }

    #[tokio::test]
    async fn wait_for_stop_unblocks_on_finish_stop() {
        let lc = std::sync::Arc::new(Lifecycle::new("test"));
        // Never started: returns immediately
        lc.wait_for_stop().await;

        lc.begin_start().unwrap();
        lc.finish_start();

        let waiter = {
            let lc = lc.clone();
            tokio::spawn(async move { lc.wait_for_stop().await })
        };
        tokio::task::yield_now().await;
        assert!(lc.begin_stop());
        lc.finish_stop();
        waiter.await.unwrap();

        // Already stopped: immediate
        lc.wait_for_stop().await;
    }

    #[tokio::test]
    async fn failed_start_fulfills_stop_future() {
        let lc = Lifecycle::new("test");
        lc.begin_start().unwrap();
        lc.abort_start();
        assert_eq!(lc.state(), LifecycleState::Stopped);
        lc.wait_for_stop().await;
    }
}
