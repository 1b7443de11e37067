use crate::api::RunApi;
use runlens_core::{ChangeToken, RunId};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_millis(8_000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_WATCH_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    Completed(ChangeToken),
    /// The mutation may still be pending. Not an error.
    TimedOut,
}

impl WatchOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, WatchOutcome::Completed(_))
    }
}

/// A present token counts as progress when there was none before.
pub fn token_advanced(previous: Option<&ChangeToken>, current: Option<&ChangeToken>) -> bool {
    match (previous, current) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(previous), Some(current)) => previous != current,
    }
}

/// Polls `GET /runs/{id}` until its change token moves past `previous` or
/// `opts.timeout` elapses. Fetch failures count as "no change yet". Every
/// wait, fetches included, is clipped to the deadline, so this resolves
/// within `opts.timeout`.
pub async fn await_change<A>(
    api: &A,
    run_id: RunId,
    previous: Option<&ChangeToken>,
    opts: WatchOptions,
) -> WatchOutcome
where
    A: RunApi + ?Sized,
{
    let deadline = Instant::now() + opts.timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, api.fetch_run(run_id)).await {
            Ok(Ok(snapshot)) => {
                if token_advanced(previous, snapshot.change_token()) {
                    if let Some(token) = snapshot.updated_at {
                        debug!("watch_completed: run={run_id} token={token}");
                        return WatchOutcome::Completed(token);
                    }
                }
            }
            Ok(Err(err)) => debug!("watch_fetch_error: run={run_id} {err}"),
            Err(_) => break,
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(opts.interval.min(remaining)).await;
    }
    debug!("watch_timed_out: run={run_id}");
    WatchOutcome::TimedOut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::test_support::ScriptedApi;

    fn token(value: &str) -> ChangeToken {
        ChangeToken::new(value)
    }

    #[test]
    fn token_advance_rules() {
        assert!(token_advanced(Some(&token("a")), Some(&token("b"))));
        assert!(!token_advanced(Some(&token("a")), Some(&token("a"))));
        assert!(token_advanced(None, Some(&token("a"))));
        assert!(!token_advanced(None, None));
        assert!(!token_advanced(Some(&token("a")), None));
    }

    #[tokio::test(start_paused = true)]
    async fn completes_when_token_changes() {
        let api = ScriptedApi::new();
        api.push_snapshot(1, Some("t1"));
        api.push_snapshot(1, Some("t1"));
        api.push_snapshot(1, Some("t2"));

        let started = Instant::now();
        let outcome =
            await_change(&api, RunId(1), Some(&token("t1")), WatchOptions::default()).await;
        assert_eq!(outcome, WatchOutcome::Completed(token("t2")));
        assert_eq!(api.fetch_count(), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1_200) && elapsed < Duration::from_millis(1_300));
    }

    #[tokio::test(start_paused = true)]
    async fn fast_mutation_is_seen_on_first_poll() {
        let api = ScriptedApi::new();
        api.push_snapshot(1, Some("t2"));
        let outcome =
            await_change(&api, RunId(1), Some(&token("t1")), WatchOptions::default()).await;
        assert!(outcome.is_completed());
        assert_eq!(api.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_token_counts_when_previous_absent() {
        let api = ScriptedApi::new();
        api.push_snapshot(1, None);
        api.push_snapshot(1, Some("t1"));
        let outcome = await_change(&api, RunId(1), None, WatchOptions::default()).await;
        assert_eq!(outcome, WatchOutcome::Completed(token("t1")));
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_token_times_out_at_deadline() {
        let api = ScriptedApi::new();
        api.push_snapshot(1, Some("t1"));

        let started = Instant::now();
        let outcome =
            await_change(&api, RunId(1), Some(&token("t1")), WatchOptions::default()).await;
        assert_eq!(outcome, WatchOutcome::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= DEFAULT_WATCH_TIMEOUT);
        assert!(elapsed < DEFAULT_WATCH_TIMEOUT + DEFAULT_POLL_INTERVAL);
        // Polls at 0, 600, ..., 7800.
        assert_eq!(api.fetch_count(), 14);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failures_are_swallowed() {
        let api = ScriptedApi::new();
        api.push_fetch(Err(ApiError::Transport("connection reset".into())));
        api.push_fetch(Err(ApiError::rejected(503, "")));
        api.push_snapshot(1, Some("t9"));
        let outcome =
            await_change(&api, RunId(1), Some(&token("t1")), WatchOptions::default()).await;
        assert_eq!(outcome, WatchOutcome::Completed(token("t9")));
        assert_eq!(api.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_is_cut_off_by_deadline() {
        let api = ScriptedApi::new();
        api.push_snapshot(1, Some("t2"));
        api.set_fetch_delay(Duration::from_secs(30));

        let opts = WatchOptions {
            timeout: Duration::from_millis(1_000),
            interval: Duration::from_millis(100),
        };
        let started = Instant::now();
        let outcome = await_change(&api, RunId(1), Some(&token("t1")), opts).await;
        assert_eq!(outcome, WatchOutcome::TimedOut);
        assert!(started.elapsed() <= opts.timeout + opts.interval);
    }
}
