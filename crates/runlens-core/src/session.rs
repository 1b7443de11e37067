use crate::RunId;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_BACKOFF_BASE_MS: u64 = 250;
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 8_000;
pub const DEFAULT_BACKOFF_MAX_SHIFT: u32 = 5;

/// `delay = min(cap, base * 2^min(attempt, max_shift))`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_shift: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            cap: Duration::from_millis(DEFAULT_BACKOFF_CAP_MS),
            max_shift: DEFAULT_BACKOFF_MAX_SHIFT,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, max_shift: u32) -> Self {
        Self {
            base,
            cap,
            max_shift,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.min(self.max_shift).min(31);
        let raw = self.base.saturating_mul(1u32 << shift);
        raw.min(self.cap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ConnectFailed(String),
    Transport(String),
    ClosedByPeer,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ConnectFailed(err) => write!(f, "connect failed: {err}"),
            CloseReason::Transport(err) => write!(f, "transport error: {err}"),
            CloseReason::ClosedByPeer => f.write_str("closed by peer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed(CloseReason),
    Stopped,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed(_) => "closed",
            ConnectionState::Stopped => "stopped",
        }
    }
}

/// State machine for one logical subscription to a run's event stream.
///
/// Transition methods return `false`/`None` instead of moving when the
/// trigger is not valid in the current state; `Stopped` accepts nothing.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    run_id: RunId,
    attempt: u32,
    state: ConnectionState,
    backoff: BackoffPolicy,
}

impl ConnectionSession {
    pub fn new(run_id: RunId, backoff: BackoffPolicy) -> Self {
        Self {
            run_id,
            attempt: 0,
            state: ConnectionState::Idle,
            backoff,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.attempt
    }

    pub fn is_live(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn is_stopped(&self) -> bool {
        self.state == ConnectionState::Stopped
    }

    pub fn begin_connect(&mut self) -> bool {
        match self.state {
            ConnectionState::Idle | ConnectionState::Closed(_) => {
                self.state = ConnectionState::Connecting;
                true
            }
            _ => false,
        }
    }

    pub fn on_open(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Open;
        self.attempt = 0;
        true
    }

    /// Returns the delay before the next connect attempt.
    pub fn on_close(&mut self, reason: CloseReason) -> Option<Duration> {
        match self.state {
            ConnectionState::Open | ConnectionState::Connecting => {
                self.attempt = self.attempt.saturating_add(1);
                self.state = ConnectionState::Closed(reason);
                Some(self.backoff.delay_for(self.attempt))
            }
            _ => None,
        }
    }

    pub fn stop(&mut self) -> bool {
        if self.state == ConnectionState::Stopped {
            return false;
        }
        self.state = ConnectionState::Stopped;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ConnectionSession {
        ConnectionSession::new(RunId(1), BackoffPolicy::default())
    }

    #[test]
    fn backoff_matches_documented_schedule() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (0..8)
            .map(|attempt| policy.delay_for(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 8000, 8000, 8000]);
    }

    #[test]
    fn backoff_is_bounded_and_non_decreasing() {
        for policy in [
            BackoffPolicy::default(),
            BackoffPolicy::new(Duration::from_millis(300), Duration::from_millis(5_000), 5),
            BackoffPolicy::new(Duration::from_secs(3), Duration::from_secs(1), 2),
            BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(u64::MAX / 4), 40),
        ] {
            let mut previous = Duration::ZERO;
            for attempt in 0..64 {
                let delay = policy.delay_for(attempt);
                assert!(delay <= policy.cap, "attempt {attempt} exceeded cap");
                assert!(delay >= previous, "attempt {attempt} decreased");
                previous = delay;
            }
        }
    }

    #[test]
    fn failed_connects_grow_the_attempt_counter() {
        let mut session = session();
        assert!(session.begin_connect());
        assert_eq!(
            session.on_close(CloseReason::ConnectFailed("refused".into())),
            Some(Duration::from_millis(500))
        );
        assert!(session.begin_connect());
        assert_eq!(
            session.on_close(CloseReason::ConnectFailed("refused".into())),
            Some(Duration::from_millis(1000))
        );
        assert_eq!(session.retry_count(), 2);
        assert!(!session.is_live());
    }

    #[test]
    fn open_resets_counter_so_next_failure_uses_first_delay() {
        let mut session = session();
        for _ in 0..4 {
            session.begin_connect();
            session.on_close(CloseReason::ConnectFailed("down".into()));
        }
        assert_eq!(session.retry_count(), 4);

        session.begin_connect();
        assert!(session.on_open());
        assert!(session.is_live());
        assert_eq!(session.retry_count(), 0);

        let delay = session.on_close(CloseReason::ClosedByPeer);
        assert_eq!(delay, Some(BackoffPolicy::default().delay_for(1)));
        assert_eq!(
            session.state(),
            &ConnectionState::Closed(CloseReason::ClosedByPeer)
        );
    }

    #[test]
    fn invalid_triggers_do_not_move_the_state() {
        let mut session = session();
        assert!(!session.on_open());
        assert_eq!(session.on_close(CloseReason::ClosedByPeer), None);
        assert_eq!(session.state(), &ConnectionState::Idle);

        session.begin_connect();
        assert!(!session.begin_connect());
        session.on_open();
        assert!(!session.begin_connect());
    }

    #[test]
    fn stopped_is_terminal_and_stop_is_idempotent() {
        let mut session = session();
        session.begin_connect();
        session.on_open();
        assert!(session.stop());
        assert!(!session.stop());
        assert!(!session.begin_connect());
        assert!(!session.on_open());
        assert_eq!(session.on_close(CloseReason::ClosedByPeer), None);
        assert!(session.is_stopped());
        assert!(!session.is_live());
    }
}
