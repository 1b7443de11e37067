use crate::api::{ListPage, RunApi};
use crate::error::ApiError;
use async_trait::async_trait;
use runlens_core::{ChangeToken, DeleteAck, EvaluateAck, ReplayAck, RunId, RunSnapshot};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Fetch(RunId),
    List(ListPage),
    Delete(RunId),
    Evaluate(RunId),
    Replay(RunId),
}

/// In-memory `RunApi`. Fetch results are served from a queue whose last
/// entry repeats once the rest are used up.
pub(crate) struct ScriptedApi {
    fetches: Mutex<VecDeque<Result<RunSnapshot, ApiError>>>,
    fetch_delay: Mutex<Duration>,
    evaluate: Mutex<Result<EvaluateAck, ApiError>>,
    replay: Mutex<Result<ReplayAck, ApiError>>,
    calls: Mutex<Vec<(Call, Instant)>>,
}

impl ScriptedApi {
    pub(crate) fn new() -> Self {
        Self {
            fetches: Mutex::new(VecDeque::new()),
            fetch_delay: Mutex::new(Duration::ZERO),
            evaluate: Mutex::new(Ok(EvaluateAck {
                ok: true,
                task_id: Some("task-1".to_string()),
            })),
            replay: Mutex::new(Ok(ReplayAck {
                ok: true,
                replay_run_id: None,
            })),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push_fetch(&self, result: Result<RunSnapshot, ApiError>) {
        self.fetches.lock().expect("fetch lock").push_back(result);
    }

    pub(crate) fn push_snapshot(&self, run_id: u64, token: Option<&str>) {
        self.push_fetch(Ok(snapshot(run_id, token)));
    }

    pub(crate) fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().expect("delay lock") = delay;
    }

    pub(crate) fn set_evaluate(&self, result: Result<EvaluateAck, ApiError>) {
        *self.evaluate.lock().expect("evaluate lock") = result;
    }

    pub(crate) fn set_replay(&self, result: Result<ReplayAck, ApiError>) {
        *self.replay.lock().expect("replay lock") = result;
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(call, _)| call.clone())
            .collect()
    }

    pub(crate) fn call_times(&self) -> Vec<(Call, Instant)> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Fetch(_)))
            .count()
    }

    fn record(&self, call: Call) {
        self.calls
            .lock()
            .expect("calls lock")
            .push((call, Instant::now()));
    }
}

pub(crate) fn snapshot(run_id: u64, token: Option<&str>) -> RunSnapshot {
    let mut snapshot = RunSnapshot::new(RunId(run_id));
    snapshot.updated_at = token.map(ChangeToken::new);
    snapshot
}

#[async_trait]
impl RunApi for ScriptedApi {
    async fn fetch_run(&self, run_id: RunId) -> Result<RunSnapshot, ApiError> {
        self.record(Call::Fetch(run_id));
        let delay = *self.fetch_delay.lock().expect("delay lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut fetches = self.fetches.lock().expect("fetch lock");
        let next = if fetches.len() > 1 {
            fetches.pop_front()
        } else {
            fetches.front().cloned()
        };
        next.unwrap_or_else(|| Err(ApiError::rejected(404, "")))
    }

    async fn list_runs(&self, page: ListPage) -> Result<Vec<RunSnapshot>, ApiError> {
        self.record(Call::List(page));
        Ok(Vec::new())
    }

    async fn delete_run(&self, run_id: RunId) -> Result<DeleteAck, ApiError> {
        self.record(Call::Delete(run_id));
        Ok(DeleteAck {
            ok: true,
            run_id: Some(run_id),
        })
    }

    async fn evaluate_run(&self, run_id: RunId) -> Result<EvaluateAck, ApiError> {
        self.record(Call::Evaluate(run_id));
        self.evaluate.lock().expect("evaluate lock").clone()
    }

    async fn replay_run(&self, run_id: RunId) -> Result<ReplayAck, ApiError> {
        self.record(Call::Replay(run_id));
        self.replay.lock().expect("replay lock").clone()
    }
}
