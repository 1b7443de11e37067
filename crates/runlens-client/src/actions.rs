//! Evaluate and replay actions for a run view.
//!
//! One busy slot covers both actions. The caller keeps a second action from
//! starting while `is_busy()` holds; `RunActions` itself does not queue or
//! reject.

use crate::api::RunApi;
use crate::error::ApiError;
use crate::watcher::{await_change, WatchOptions, WatchOutcome};
use runlens_core::{ChangeToken, RunId};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_FOLLOWUP_REFRESH: Duration = Duration::from_millis(800);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunAction {
    Evaluate,
    Replay,
}

impl RunAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunAction::Evaluate => "evaluate",
            RunAction::Replay => "replay",
        }
    }

    /// Evaluate mutates this run; replay creates a different one.
    pub fn awaits_completion(&self) -> bool {
        matches!(self, RunAction::Evaluate)
    }
}

impl fmt::Display for RunAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunAction {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "evaluate" | "eval" => Ok(RunAction::Evaluate),
            "replay" => Ok(RunAction::Replay),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionState {
    pub busy_action: Option<RunAction>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Evaluated { watch: WatchOutcome },
    ReplayStarted { replay_run_id: Option<RunId> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("{source}")]
    Rejected {
        action: RunAction,
        #[source]
        source: ApiError,
    },
    #[error("run view is no longer attached")]
    Detached,
}

pub trait RefreshTarget: Send + Sync + 'static {
    fn refresh(&self);
}

impl<F> RefreshTarget for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn refresh(&self) {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionConfig {
    pub watch: WatchOptions,
    pub followup_refresh: Duration,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            watch: WatchOptions::default(),
            followup_refresh: DEFAULT_FOLLOWUP_REFRESH,
        }
    }
}

pub struct RunActions<A: RunApi> {
    api: A,
    run_id: RunId,
    refresh: Arc<dyn RefreshTarget>,
    config: ActionConfig,
    state: watch::Sender<ActionState>,
    alive: CancellationToken,
}

impl<A: RunApi> RunActions<A> {
    pub fn new(api: A, run_id: RunId, refresh: Arc<dyn RefreshTarget>, config: ActionConfig) -> Self {
        let (state, _) = watch::channel(ActionState::default());
        Self {
            api,
            run_id,
            refresh,
            config,
            state,
            alive: CancellationToken::new(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn subscribe(&self) -> watch::Receiver<ActionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ActionState {
        self.state.borrow().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state.borrow().busy_action.is_some()
    }

    /// Runs one action end to end: capture the change token, submit, wait
    /// for completion (evaluate only), then refresh the view now and once
    /// more after `followup_refresh`. The busy slot is released on every
    /// exit path.
    pub async fn run(&self, action: RunAction) -> Result<ActionOutcome, ActionError> {
        if self.alive.is_cancelled() {
            return Err(ActionError::Detached);
        }
        self.state.send_modify(|state| {
            state.busy_action = Some(action);
            state.error = None;
        });
        let _busy = BusyGuard { state: &self.state };
        info!("run_action_start: run={} action={action}", self.run_id);

        let previous = self.capture_token().await;
        let outcome = match action {
            RunAction::Evaluate => {
                self.api
                    .evaluate_run(self.run_id)
                    .await
                    .map_err(|source| self.reject(action, source))?;
                let watch = await_change(
                    &self.api,
                    self.run_id,
                    previous.as_ref(),
                    self.config.watch,
                )
                .await;
                ActionOutcome::Evaluated { watch }
            }
            RunAction::Replay => {
                let ack = self
                    .api
                    .replay_run(self.run_id)
                    .await
                    .map_err(|source| self.reject(action, source))?;
                ActionOutcome::ReplayStarted {
                    replay_run_id: ack.replay_run_id,
                }
            }
        };

        if self.alive.is_cancelled() {
            debug!("run_action_late_result: run={} action={action}", self.run_id);
            return Ok(outcome);
        }
        info!(
            "run_action_done: run={} action={action} outcome={outcome:?}",
            self.run_id
        );
        self.trigger_refresh();
        Ok(outcome)
    }

    /// Marks the owning view as gone: pending follow-up refreshes are
    /// dropped and in-flight actions skip their refresh.
    pub fn detach(&self) {
        self.alive.cancel();
    }

    async fn capture_token(&self) -> Option<ChangeToken> {
        match self.api.fetch_run(self.run_id).await {
            Ok(snapshot) => snapshot.updated_at,
            Err(err) => {
                debug!("run_action_snapshot_error: run={} {err}", self.run_id);
                None
            }
        }
    }

    fn reject(&self, action: RunAction, source: ApiError) -> ActionError {
        warn!(
            "run_action_rejected: run={} action={action} {source}",
            self.run_id
        );
        if !self.alive.is_cancelled() {
            let message = source.to_string();
            self.state.send_modify(|state| state.error = Some(message));
        }
        ActionError::Rejected { action, source }
    }

    fn trigger_refresh(&self) {
        self.refresh.refresh();
        let refresh = Arc::clone(&self.refresh);
        let alive = self.alive.clone();
        let delay = self.config.followup_refresh;
        tokio::spawn(async move {
            tokio::select! {
                _ = alive.cancelled() => {}
                _ = tokio::time::sleep(delay) => refresh.refresh(),
            }
        });
    }
}

impl<A: RunApi> Drop for RunActions<A> {
    fn drop(&mut self) {
        self.alive.cancel();
    }
}

struct BusyGuard<'a> {
    state: &'a watch::Sender<ActionState>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.state.send_modify(|state| state.busy_action = None);
    }
}
