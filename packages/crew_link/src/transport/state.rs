//! Connection state machine and reconnect policy.
//!
//! All connection state lives here as guarded transitions; the async driver
//! in `channel.rs` never touches the state directly. This keeps re-entrancy
//! bugs (double connects, duplicate reconnect timers) impossible by
//! construction rather than by scattered boolean flags.

use std::time::{Duration, Instant};

/// Lifecycle of one connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Open,
    Disconnected,
    ReconnectWait,
    Closing,
    Closed,
}

/// Why the wire went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit/normal closure. Terminal — no retry.
    Normal,
    /// Transport failure: refused connection, abrupt close, read error.
    Abnormal(String),
    /// No pong within `ping_interval + pong_timeout`.
    LivenessTimeout,
}

/// What the driver must do after recording a wire loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosedOutcome {
    /// Normal closure or close requested by us — stop quietly.
    Terminal,
    /// Retry budget exhausted — surface a fatal "connection lost".
    GiveUp,
    /// Reconnect after `delay`; this is retry number `attempt`.
    Retry { attempt: u32, delay: Duration },
}

/// Capped exponential backoff with uniform jitter.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub growth: f64,
    pub max_delay: Duration,
    /// Reconnect attempts made before declaring the connection lost.
    pub max_attempts: u32,
    pub jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            growth: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter: Duration::from_millis(250),
        }
    }
}

impl ReconnectPolicy {
    /// Deterministic part of the delay: `min(base * growth^attempt, max_delay)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.growth.max(1.0).powi(attempt.min(64) as i32);
        let scaled = self.base.as_secs_f64() * factor;
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    /// Backoff plus uniform jitter in `[0, jitter]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            use rand::Rng;
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        self.backoff(attempt) + jitter
    }
}

/// The per-session connection record: state, retry counter, liveness clock.
#[derive(Debug)]
pub struct Connection {
    state: ConnState,
    reconnect_attempt: u32,
    last_pong_at: Option<Instant>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Self {
            state: ConnState::Idle,
            reconnect_attempt: 0,
            last_pong_at: None,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    /// Begin a connection attempt. Idempotent guard: returns `false` (and
    /// changes nothing) when an attempt is already in flight, the wire is
    /// already open, or the connection is shutting down.
    pub fn begin_connect(&mut self) -> bool {
        match self.state {
            ConnState::Idle | ConnState::Disconnected | ConnState::ReconnectWait => {
                self.state = ConnState::Connecting;
                true
            }
            ConnState::Connecting | ConnState::Open | ConnState::Closing | ConnState::Closed => {
                false
            }
        }
    }

    /// The underlying channel opened successfully.
    pub fn opened(&mut self, now: Instant) {
        self.state = ConnState::Open;
        self.reconnect_attempt = 0;
        self.last_pong_at = Some(now);
    }

    /// Record a pong. Ignored unless open.
    pub fn pong(&mut self, now: Instant) {
        if self.state == ConnState::Open {
            self.last_pong_at = Some(now);
        }
    }

    /// True when the pong silence exceeds the liveness window. Only
    /// meaningful while open; the caller must force-close on `true`, which
    /// leaves `Open` and therefore fires at most once per violation.
    pub fn liveness_expired(
        &self,
        now: Instant,
        ping_interval: Duration,
        pong_timeout: Duration,
    ) -> bool {
        if self.state != ConnState::Open {
            return false;
        }
        match self.last_pong_at {
            Some(at) => now.duration_since(at) > ping_interval + pong_timeout,
            None => false,
        }
    }

    /// Record a wire loss (or failed dial) and decide what happens next.
    pub fn closed(&mut self, reason: &CloseReason, policy: &ReconnectPolicy) -> ClosedOutcome {
        if matches!(self.state, ConnState::Closing | ConnState::Closed) {
            self.state = ConnState::Closed;
            return ClosedOutcome::Terminal;
        }
        if *reason == CloseReason::Normal {
            self.state = ConnState::Closed;
            return ClosedOutcome::Terminal;
        }

        self.state = ConnState::Disconnected;
        if self.reconnect_attempt >= policy.max_attempts {
            self.state = ConnState::Closed;
            return ClosedOutcome::GiveUp;
        }

        let delay = policy.delay(self.reconnect_attempt);
        self.reconnect_attempt += 1;
        self.state = ConnState::ReconnectWait;
        ClosedOutcome::Retry {
            attempt: self.reconnect_attempt,
            delay,
        }
    }

    /// Explicit close requested by the caller.
    pub fn begin_close(&mut self) {
        if self.state != ConnState::Closed {
            self.state = ConnState::Closing;
        }
    }

    /// Finish an explicit close.
    pub fn finish_close(&mut self) {
        self.state = ConnState::Closed;
    }
}
