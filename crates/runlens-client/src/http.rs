use crate::api::{ListPage, RunApi};
use crate::error::{ApiError, StreamError};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, CACHE_CONTROL};
use runlens_core::{DeleteAck, EvaluateAck, ReplayAck, RunId, RunSnapshot};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const DEFAULT_API_BASE: &str = "http://localhost:8000";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpRunApi {
    client: reqwest::Client,
    base: Url,
}

impl HttpRunApi {
    pub fn new(base: Url) -> Result<Self, ApiError> {
        Self::with_timeout(base, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base: Url, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ApiError::Transport(format!("failed to build http client: {err}")))?;
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn run_url(&self, run_id: RunId) -> Url {
        join_path(&self.base, &format!("/runs/{run_id}"))
    }

    fn runs_url(&self, page: ListPage) -> Url {
        let mut url = join_path(&self.base, "/runs");
        url.query_pairs_mut()
            .append_pair("limit", &page.limit.to_string())
            .append_pair("offset", &page.offset.to_string());
        url
    }

    fn action_url(&self, run_id: RunId, action: &str) -> Url {
        join_path(&self.base, &format!("/runs/{run_id}/{action}"))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String, ApiError> {
        let response = request
            .header(CACHE_CONTROL, HeaderValue::from_static("no-store"))
            .send()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ApiError::Transport(format!("failed reading body: {err}")))?;
        if !status.is_success() {
            return Err(ApiError::rejected(status.as_u16(), &body));
        }
        Ok(body)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let body = self.send(request).await?;
        serde_json::from_str(&body).map_err(|err| ApiError::Decode(err.to_string()))
    }

    /// Mutation acknowledgements are informational; a body that does not
    /// decode still counts as success.
    async fn send_ack<T: DeserializeOwned + Default>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let body = self.send(request).await?;
        Ok(decode_ack(&body))
    }
}

#[async_trait]
impl RunApi for HttpRunApi {
    async fn fetch_run(&self, run_id: RunId) -> Result<RunSnapshot, ApiError> {
        self.send_json(self.client.get(self.run_url(run_id))).await
    }

    async fn list_runs(&self, page: ListPage) -> Result<Vec<RunSnapshot>, ApiError> {
        self.send_json(self.client.get(self.runs_url(page))).await
    }

    async fn delete_run(&self, run_id: RunId) -> Result<DeleteAck, ApiError> {
        self.send_ack(self.client.delete(self.run_url(run_id))).await
    }

    async fn evaluate_run(&self, run_id: RunId) -> Result<EvaluateAck, ApiError> {
        self.send_ack(self.client.post(self.action_url(run_id, "evaluate")))
            .await
    }

    async fn replay_run(&self, run_id: RunId) -> Result<ReplayAck, ApiError> {
        self.send_ack(self.client.post(self.action_url(run_id, "replay")))
            .await
    }
}

fn decode_ack<T: DeserializeOwned + Default>(body: &str) -> T {
    if body.trim().is_empty() {
        return T::default();
    }
    match serde_json::from_str(body) {
        Ok(ack) => ack,
        Err(err) => {
            debug!("ack_decode_skipped: {err}");
            T::default()
        }
    }
}

fn join_path(base: &Url, suffix: &str) -> Url {
    let mut url = base.clone();
    let path = format!("{}{}", base.path().trim_end_matches('/'), suffix);
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    url
}

pub fn parse_base_url(raw: &str) -> Result<Url, ApiError> {
    let url = Url::parse(raw.trim()).map_err(|err| ApiError::Url(format!("{raw}: {err}")))?;
    match url.scheme() {
        "http" | "https" | "ws" | "wss" => Ok(url),
        other => Err(ApiError::Url(format!("{raw}: unsupported scheme '{other}'"))),
    }
}

/// Push-channel URL for a run: `http(s)` bases become `ws(s)` and
/// `/ws/runs/{id}` is appended to the base path.
pub fn stream_url(base: &Url, run_id: RunId) -> Result<Url, StreamError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(StreamError::Url(format!("unsupported scheme '{other}'"))),
    };
    let mut url = join_path(base, &format!("/ws/runs/{run_id}"));
    url.set_scheme(scheme)
        .map_err(|_| StreamError::Url(format!("cannot use scheme {scheme} for {base}")))?;
    Ok(url)
}
