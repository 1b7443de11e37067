use crate::error::ApiError;
use async_trait::async_trait;
use runlens_core::{DeleteAck, EvaluateAck, ReplayAck, RunId, RunSnapshot};
use std::sync::Arc;

pub const DEFAULT_LIST_LIMIT: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListPage {
    pub limit: u32,
    pub offset: u32,
}

impl Default for ListPage {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

/// Backend operations the client consumes. `HttpRunApi` is the production
/// implementation; tests script their own.
#[async_trait]
pub trait RunApi: Send + Sync + 'static {
    async fn fetch_run(&self, run_id: RunId) -> Result<RunSnapshot, ApiError>;

    async fn list_runs(&self, page: ListPage) -> Result<Vec<RunSnapshot>, ApiError>;

    async fn delete_run(&self, run_id: RunId) -> Result<DeleteAck, ApiError>;

    async fn evaluate_run(&self, run_id: RunId) -> Result<EvaluateAck, ApiError>;

    async fn replay_run(&self, run_id: RunId) -> Result<ReplayAck, ApiError>;
}

#[async_trait]
impl<T: RunApi + ?Sized> RunApi for Arc<T> {
    async fn fetch_run(&self, run_id: RunId) -> Result<RunSnapshot, ApiError> {
        (**self).fetch_run(run_id).await
    }

    async fn list_runs(&self, page: ListPage) -> Result<Vec<RunSnapshot>, ApiError> {
        (**self).list_runs(page).await
    }

    async fn delete_run(&self, run_id: RunId) -> Result<DeleteAck, ApiError> {
        (**self).delete_run(run_id).await
    }

    async fn evaluate_run(&self, run_id: RunId) -> Result<EvaluateAck, ApiError> {
        (**self).evaluate_run(run_id).await
    }

    async fn replay_run(&self, run_id: RunId) -> Result<ReplayAck, ApiError> {
        (**self).replay_run(run_id).await
    }
}
