//! Path MTU discovery controller (RFC 8899 DPLPMTUD, as used by QUIC per
//! RFC 9000 §14).
//!
//! The controller is pure state: the owning connection asks
//! [`PmtudController::should_probe`] from its timer loop, sends a padded probe
//! of [`PmtudController::probe_size`] bytes, and reports the outcome through
//! `on_probe_acked`/`on_probe_lost`/`on_packet_too_big`. `current_mtu` caps
//! every outgoing datagram.

use std::time::{Duration, Instant};

/// DPLPMTUD state machine states (RFC 8899 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmtudState {
    /// PMTUD is off; datagrams are capped at the minimum MTU.
    Disabled,
    /// At BASE_PLPMTU, about to start searching.
    Base,
    /// Binary search for a larger MTU in progress.
    Searching,
    /// Maximum usable MTU found and validated.
    SearchComplete,
    /// Black hole detected; recovering from the minimum.
    Error,
}

impl PmtudState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PmtudState::Disabled => "disabled",
            PmtudState::Base => "base",
            PmtudState::Searching => "searching",
            PmtudState::SearchComplete => "search_complete",
            PmtudState::Error => "error",
        }
    }
}

/// Tunables for the controller.
#[derive(Debug, Clone)]
pub struct PmtudConfig {
    /// Minimum MTU; RFC 9000 requires 1200 bytes for QUIC
    pub min_mtu: usize,
    /// Largest MTU worth probing (typical Ethernet: 1500)
    pub max_probe_mtu: usize,
    /// Search granularity; the search completes once the window shrinks to this
    pub probe_step: usize,
    /// How long an unacknowledged probe stays in flight before it counts lost
    pub probe_timeout: Duration,
    /// Probes per candidate size before the size is declared unusable
    pub max_probes: usize,
    /// Spacing between probes during the search
    pub probe_interval: Duration,
    /// Re-validation period after the search completes
    pub confirmation_interval: Duration,
}

impl Default for PmtudConfig {
    fn default() -> Self {
        Self {
            min_mtu: 1200,
            max_probe_mtu: 1500,
            probe_step: 32,
            probe_timeout: Duration::from_secs(3),
            max_probes: 3,
            probe_interval: Duration::from_millis(1000),
            confirmation_interval: Duration::from_secs(600),
        }
    }
}

const BLACK_HOLE_THRESHOLD: usize = 6;

pub struct PmtudController {
    config: PmtudConfig,
    state: PmtudState,
    current_mtu: usize,
    search_low: usize,
    search_high: usize,
    probing_mtu: usize,
    probe_count: usize,
    consecutive_failures: usize,
    last_probe_time: Option<Instant>,
    search_complete_time: Option<Instant>,
    probe_in_flight: bool,
}

impl PmtudController {
    pub fn new(config: PmtudConfig) -> Self {
        let current_mtu = config.min_mtu;
        let search_low = config.min_mtu;
        let search_high = config.max_probe_mtu;
        Self {
            config,
            state: PmtudState::Disabled,
            current_mtu,
            search_low,
            search_high,
            probing_mtu: 0,
            probe_count: 0,
            consecutive_failures: 0,
            last_probe_time: None,
            search_complete_time: None,
            probe_in_flight: false,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The validated MTU the sender must cap datagrams at.
    pub fn current_mtu(&self) -> usize {
        self.current_mtu
    }

    pub fn min_mtu(&self) -> usize {
        self.config.min_mtu
    }

    pub fn max_mtu(&self) -> usize {
        self.config.max_probe_mtu
    }

    pub fn state(&self) -> PmtudState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state != PmtudState::Disabled
    }

    pub fn is_search_complete(&self) -> bool {
        self.state == PmtudState::SearchComplete
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    /// Leaves `Disabled` and begins the search from the minimum MTU.
    pub fn enable(&mut self) {
        if self.state == PmtudState::Disabled {
            self.state = PmtudState::Base;
            self.current_mtu = self.config.min_mtu;
            self.search_low = self.config.min_mtu;
            self.search_high = self.config.max_probe_mtu;
            self.probe_count = 0;
            self.consecutive_failures = 0;
            self.probe_in_flight = false;
            self.start_search();
        }
    }

    /// Stops probing and reverts to the minimum MTU.
    pub fn disable(&mut self) {
        self.state = PmtudState::Disabled;
        self.current_mtu = self.config.min_mtu;
        self.probing_mtu = 0;
        self.probe_in_flight = false;
    }

    /// Clears all state back to disabled-at-minimum.
    pub fn reset(&mut self) {
        self.state = PmtudState::Disabled;
        self.current_mtu = self.config.min_mtu;
        self.search_low = self.config.min_mtu;
        self.search_high = self.config.max_probe_mtu;
        self.probing_mtu = 0;
        self.probe_count = 0;
        self.consecutive_failures = 0;
        self.probe_in_flight = false;
    }

    // ------------------------------------------------------------------
    // Probing
    // ------------------------------------------------------------------

    /// Scheduler guard: true when the connection should produce a probe now.
    pub fn should_probe(&self, now: Instant) -> bool {
        if self.state == PmtudState::Disabled || self.probe_in_flight {
            return false;
        }
        let since_probe = |at: Option<Instant>| at.map(|t| now.duration_since(t));
        match self.state {
            PmtudState::Base => true,
            PmtudState::Searching => match since_probe(self.last_probe_time) {
                Some(elapsed) => elapsed >= self.config.probe_interval,
                None => true,
            },
            PmtudState::SearchComplete => match since_probe(self.search_complete_time) {
                Some(elapsed) => elapsed >= self.config.confirmation_interval,
                None => false,
            },
            PmtudState::Error => match since_probe(self.last_probe_time) {
                Some(elapsed) => elapsed >= self.config.probe_timeout,
                None => true,
            },
            PmtudState::Disabled => false,
        }
    }

    /// The datagram size the next probe must have, when one is due.
    pub fn probe_size(&self) -> Option<usize> {
        match self.state {
            PmtudState::Disabled | PmtudState::Error => None,
            PmtudState::Base | PmtudState::Searching => {
                (self.probing_mtu > 0).then_some(self.probing_mtu)
            }
            // Re-validate the currently used MTU.
            PmtudState::SearchComplete => Some(self.current_mtu),
        }
    }

    pub fn on_probe_sent(&mut self, size: usize, sent_time: Instant) {
        self.probing_mtu = size;
        self.last_probe_time = Some(sent_time);
        self.probe_in_flight = true;
        self.probe_count += 1;
    }

    /// A probe of `size` bytes was acknowledged; never decreases the MTU.
    pub fn on_probe_acked(&mut self, size: usize) {
        self.probe_in_flight = false;
        self.consecutive_failures = 0;

        match self.state {
            PmtudState::Base | PmtudState::Searching => {
                if size > self.current_mtu {
                    self.current_mtu = size;
                    self.search_low = size;
                }
                if self.search_high - self.search_low <= self.config.probe_step {
                    self.complete_search();
                } else {
                    self.state = PmtudState::Searching;
                    self.probe_count = 0;
                    self.probing_mtu = self.next_probe_size();
                }
            }
            PmtudState::SearchComplete => {
                self.search_complete_time = Some(Instant::now());
            }
            PmtudState::Error => {
                self.state = PmtudState::Searching;
                self.probe_count = 0;
                self.probing_mtu = self.next_probe_size();
            }
            PmtudState::Disabled => {}
        }
    }

    /// A probe of `size` bytes was declared lost.
    pub fn on_probe_lost(&mut self, size: usize) {
        self.probe_in_flight = false;
        self.consecutive_failures += 1;

        if self.consecutive_failures >= BLACK_HOLE_THRESHOLD {
            self.black_hole();
            return;
        }

        match self.state {
            PmtudState::Base | PmtudState::Searching => {
                if self.probe_count >= self.config.max_probes {
                    // This size does not pass; shrink the window.
                    self.search_high = size;
                    self.probe_count = 0;
                    if self.search_high - self.search_low <= self.config.probe_step {
                        self.complete_search();
                    } else {
                        self.probing_mtu = self.next_probe_size();
                    }
                }
                // Below max_probes the same size is retried on the next tick.
            }
            PmtudState::SearchComplete => {
                // Re-validation failed; the path may have shrunk.
                self.state = PmtudState::Error;
                self.search_high = self.current_mtu;
                self.search_low = self.config.min_mtu;
                self.current_mtu = self.config.min_mtu;
                self.probe_count = 0;
            }
            PmtudState::Error | PmtudState::Disabled => {}
        }
    }

    /// ICMP Packet Too Big: clamp immediately when the report is credible.
    pub fn on_packet_too_big(&mut self, reported_mtu: usize) {
        if reported_mtu >= self.config.min_mtu && reported_mtu < self.current_mtu {
            self.current_mtu = reported_mtu;
            self.search_high = reported_mtu;
            if self.state == PmtudState::SearchComplete {
                self.state = PmtudState::Searching;
                self.probe_count = 0;
                self.probing_mtu = self.next_probe_size();
            }
        } else if reported_mtu < self.config.min_mtu {
            // Below the QUIC floor: treat like a black hole.
            self.black_hole();
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Deadline of the next timer-driven event, if any.
    pub fn next_timeout(&self) -> Option<Instant> {
        if self.state == PmtudState::Disabled {
            return None;
        }
        if self.probe_in_flight {
            return self.last_probe_time.map(|t| t + self.config.probe_timeout);
        }
        match self.state {
            PmtudState::Base | PmtudState::Searching => {
                self.last_probe_time.map(|t| t + self.config.probe_interval)
            }
            PmtudState::SearchComplete => self
                .search_complete_time
                .map(|t| t + self.config.confirmation_interval),
            PmtudState::Error => self.last_probe_time.map(|t| t + self.config.probe_timeout),
            PmtudState::Disabled => None,
        }
    }

    /// Timer expiry: an in-flight probe that outlived its timeout is lost.
    pub fn on_timeout(&mut self, now: Instant) {
        if self.state == PmtudState::Disabled || !self.probe_in_flight {
            return;
        }
        if let Some(at) = self.last_probe_time {
            if now.duration_since(at) >= self.config.probe_timeout {
                self.on_probe_lost(self.probing_mtu);
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn start_search(&mut self) {
        self.state = PmtudState::Searching;
        self.search_low = self.current_mtu;
        self.search_high = self.config.max_probe_mtu;
        self.probe_count = 0;
        self.probing_mtu = self.next_probe_size();
    }

    /// Binary-search midpoint, snapped up by `probe_step` when it would stall
    /// and clamped to the upper bound.
    fn next_probe_size(&self) -> usize {
        let mut mid = self.search_low + (self.search_high - self.search_low) / 2;
        if mid == self.search_low && self.search_high > self.search_low {
            mid = self.search_low + self.config.probe_step;
        }
        mid.min(self.search_high)
    }

    fn complete_search(&mut self) {
        self.state = PmtudState::SearchComplete;
        self.search_complete_time = Some(Instant::now());
        self.probing_mtu = 0;
        self.probe_count = 0;
    }

    fn black_hole(&mut self) {
        self.state = PmtudState::Error;
        self.current_mtu = self.config.min_mtu;
        self.search_low = self.config.min_mtu;
        self.search_high = self.config.max_probe_mtu;
        self.probing_mtu = 0;
        self.probe_count = 0;
        self.consecutive_failures = 0;
        self.probe_in_flight = false;
    }
}

impl Default for PmtudController {
    fn default() -> Self {
        Self::new(PmtudConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> PmtudController {
        let mut c = PmtudController::default();
        c.enable();
        c
    }

    /// Drives one ack'd probe round-trip at the controller's current size.
    fn ack_round(c: &mut PmtudController) -> usize {
        let size = c.probe_size().expect("probe pending");
        c.on_probe_sent(size, Instant::now());
        c.on_probe_acked(size);
        size
    }

    #[test]
    fn starts_disabled_at_min() {
        let c = PmtudController::default();
        assert_eq!(c.state(), PmtudState::Disabled);
        assert_eq!(c.current_mtu(), 1200);
        assert!(!c.should_probe(Instant::now()));
        assert!(c.probe_size().is_none());
        assert!(c.next_timeout().is_none());
    }

    #[test]
    fn enable_begins_search_at_midpoint() {
        let c = controller();
        assert_eq!(c.state(), PmtudState::Searching);
        assert_eq!(c.probe_size(), Some(1350));
        assert!(c.should_probe(Instant::now()));
    }

    #[test]
    fn clean_path_converges_near_max() {
        let mut c = controller();
        while !c.is_search_complete() {
            ack_round(&mut c);
        }
        // The search ends once the window shrinks to probe_step.
        assert!(c.current_mtu() > 1500 - 32);
        assert!(c.current_mtu() <= 1500);
    }

    #[test]
    fn mtu_is_monotonic_under_acks() {
        let mut c = controller();
        let mut last = c.current_mtu();
        while !c.is_search_complete() {
            ack_round(&mut c);
            assert!(c.current_mtu() >= last);
            last = c.current_mtu();
        }
    }

    #[test]
    fn lossy_size_shrinks_search_window() {
        let mut c = controller();
        // Exhaust max_probes at the first candidate (1350).
        let size = c.probe_size().unwrap();
        for _ in 0..3 {
            c.on_probe_sent(size, Instant::now());
            c.on_probe_lost(size);
        }
        assert_eq!(c.state(), PmtudState::Searching);
        let next = c.probe_size().unwrap();
        assert!(next < size, "window must shrink below the failed size");

        // Everything below 1350 passes; search completes under 1350.
        while !c.is_search_complete() {
            ack_round(&mut c);
        }
        assert!(c.current_mtu() < 1350);
        assert!(c.current_mtu() >= 1200);
    }

    #[test]
    fn probe_lost_below_max_probes_retries_same_size() {
        let mut c = controller();
        let size = c.probe_size().unwrap();
        c.on_probe_sent(size, Instant::now());
        c.on_probe_lost(size);
        assert_eq!(c.probe_size(), Some(size));
    }

    #[test]
    fn only_one_probe_in_flight() {
        let mut c = controller();
        let now = Instant::now();
        let size = c.probe_size().unwrap();
        c.on_probe_sent(size, now);
        assert!(!c.should_probe(now + Duration::from_secs(60)));
        c.on_probe_acked(size);
        assert!(c.should_probe(now + Duration::from_secs(60)));
    }

    #[test]
    fn six_consecutive_losses_is_a_black_hole() {
        let mut c = controller();
        for _ in 0..6 {
            let size = c.probe_size().unwrap_or(1350);
            c.on_probe_sent(size, Instant::now());
            c.on_probe_lost(size);
        }
        assert_eq!(c.state(), PmtudState::Error);
        assert_eq!(c.current_mtu(), 1200);
    }

    #[test]
    fn recovery_from_error_state() {
        let mut c = controller();
        for _ in 0..6 {
            let size = c.probe_size().unwrap_or(1350);
            c.on_probe_sent(size, Instant::now());
            c.on_probe_lost(size);
        }
        assert_eq!(c.state(), PmtudState::Error);
        // A successful recovery probe resumes the search.
        c.on_probe_sent(1200, Instant::now());
        c.on_probe_acked(1200);
        assert_eq!(c.state(), PmtudState::Searching);
    }

    #[test]
    fn ptb_clamps_and_restarts_search() {
        let mut c = controller();
        while !c.is_search_complete() {
            ack_round(&mut c);
        }
        assert!(c.current_mtu() > 1400);
        c.on_packet_too_big(1400);
        assert_eq!(c.current_mtu(), 1400);
        assert_eq!(c.state(), PmtudState::Searching);
    }

    #[test]
    fn ptb_below_floor_is_black_hole() {
        let mut c = controller();
        c.on_packet_too_big(900);
        assert_eq!(c.state(), PmtudState::Error);
        assert_eq!(c.current_mtu(), 1200);
    }

    #[test]
    fn probe_timeout_counts_as_loss() {
        let mut c = controller();
        let size = c.probe_size().unwrap();
        let sent = Instant::now();
        c.on_probe_sent(size, sent);
        let deadline = c.next_timeout().unwrap();
        assert_eq!(deadline, sent + Duration::from_secs(3));
        c.on_timeout(deadline);
        // Loss registered; probe no longer in flight.
        assert!(c.should_probe(deadline + Duration::from_secs(2)));
    }

    #[test]
    fn disable_reverts_to_min() {
        let mut c = controller();
        while !c.is_search_complete() {
            ack_round(&mut c);
        }
        c.disable();
        assert_eq!(c.state(), PmtudState::Disabled);
        assert_eq!(c.current_mtu(), 1200);
    }

    #[test]
    fn invariant_bounds_hold_through_random_walk() {
        let mut c = controller();
        for i in 0..100 {
            if let Some(size) = c.probe_size() {
                c.on_probe_sent(size, Instant::now());
                if i % 3 == 0 {
                    c.on_probe_lost(size);
                } else {
                    c.on_probe_acked(size);
                }
            }
            assert!(c.current_mtu() >= c.min_mtu());
            assert!(c.current_mtu() <= c.max_mtu());
        }
    }
}
