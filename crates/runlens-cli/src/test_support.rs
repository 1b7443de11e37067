use async_trait::async_trait;
use runlens_client::{ApiError, ListPage, RunApi, StreamConnection, StreamConnector, StreamError};
use runlens_core::{DeleteAck, EvaluateAck, ReplayAck, RunId, RunSnapshot, Step};
use std::time::Duration;

/// Backend whose snapshot fetch takes `delay` to answer.
pub struct SlowApi {
    delay: Duration,
    steps: Vec<Step>,
}

impl SlowApi {
    pub fn new(delay: Duration, steps: Vec<Step>) -> Self {
        Self { delay, steps }
    }
}

fn unsupported() -> ApiError {
    ApiError::Transport("unsupported in this test".into())
}

#[async_trait]
impl RunApi for SlowApi {
    async fn fetch_run(&self, run_id: RunId) -> Result<RunSnapshot, ApiError> {
        tokio::time::sleep(self.delay).await;
        let mut run = RunSnapshot::new(run_id);
        run.steps = self.steps.clone();
        Ok(run)
    }

    async fn list_runs(&self, _page: ListPage) -> Result<Vec<RunSnapshot>, ApiError> {
        Err(unsupported())
    }

    async fn delete_run(&self, _run_id: RunId) -> Result<DeleteAck, ApiError> {
        Err(unsupported())
    }

    async fn evaluate_run(&self, _run_id: RunId) -> Result<EvaluateAck, ApiError> {
        Err(unsupported())
    }

    async fn replay_run(&self, _run_id: RunId) -> Result<ReplayAck, ApiError> {
        Err(unsupported())
    }
}

/// Stream endpoint that refuses every connection.
pub struct OfflineConnector;

#[async_trait]
impl StreamConnector for OfflineConnector {
    async fn connect(&self, _run_id: RunId) -> Result<Box<dyn StreamConnection>, StreamError> {
        Err(StreamError::Connect("offline".into()))
    }
}
