use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub mod session;
pub mod stream_protocol;
pub mod timeline;

pub use session::{BackoffPolicy, CloseReason, ConnectionSession, ConnectionState};
pub use stream_protocol::{parse_stream_message, PayloadError, StreamEvent};
pub use timeline::{merge, MergeOutcome, Timeline, TimelineStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(pub u64);

impl RunId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let cleaned = input.trim().trim_start_matches('#');
        cleaned
            .parse::<u64>()
            .map(RunId)
            .map_err(|err| format!("invalid run id '{input}': {err}"))
    }
}

impl From<u64> for RunId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Serialize for RunId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for RunId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let val = Value::deserialize(deserializer)?;
        match val {
            Value::Number(n) => n
                .as_u64()
                .map(RunId)
                .ok_or_else(|| serde::de::Error::custom("run id must be a non-negative integer")),
            Value::String(s) => s.parse::<RunId>().map_err(serde::de::Error::custom),
            _ => Err(serde::de::Error::custom("expected string or number for run id")),
        }
    }
}

/// Opaque change marker taken from a run's `updated_at`. Only compared for
/// equality; never interpreted as wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeToken(pub String);

impl ChangeToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    #[serde(deserialize_with = "deserialize_step_id")]
    pub id: i64,
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default = "unknown_step_type", deserialize_with = "deserialize_step_type")]
    pub step_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub tokens: Option<i64>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Step {
    pub fn new(id: i64, step_type: impl Into<String>) -> Self {
        Self {
            id,
            run_id: None,
            step_type: step_type.into(),
            name: None,
            input: None,
            output: None,
            error_message: None,
            latency_ms: None,
            cost_usd: None,
            tokens: None,
            created_at: None,
        }
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("(unnamed)")
    }

    /// Latency usable for statistics: present and finite.
    pub fn measured_latency_ms(&self) -> Option<f64> {
        self.latency_ms.filter(|value| value.is_finite())
    }
}

fn unknown_step_type() -> String {
    "unknown".to_string()
}

fn deserialize_step_type<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<String> = Option::deserialize(deserializer)?;
    Ok(val
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(unknown_step_type))
}

/// Step ids are integers on the wire, but tolerate numeric strings.
fn deserialize_step_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom("step id must be an integer")),
        Value::String(s) => s.trim().parse::<i64>().map_err(serde::de::Error::custom),
        _ => Err(serde::de::Error::custom("expected string or number for step id")),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Replayed,
    #[default]
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Replayed => "replayed",
            RunStatus::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed | RunStatus::Replayed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "running" => Ok(RunStatus::Running),
            "success" | "succeeded" => Ok(RunStatus::Success),
            "failed" | "failure" => Ok(RunStatus::Failed),
            "replayed" => Ok(RunStatus::Replayed),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

/// Point-in-time view of a run as returned by `GET /runs/{id}`. List
/// responses use the same shape without `steps`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSnapshot {
    pub id: RunId,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub input_prompt: Option<String>,
    #[serde(default)]
    pub final_output: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub total_tokens: Option<i64>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub eval_provider: Option<String>,
    #[serde(default)]
    pub eval_status: Option<String>,
    #[serde(default)]
    pub eval_scores: Option<Value>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<ChangeToken>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl RunSnapshot {
    pub fn new(id: RunId) -> Self {
        Self {
            id,
            agent_name: None,
            status: RunStatus::Unknown,
            input_prompt: None,
            final_output: None,
            error_message: None,
            total_tokens: None,
            total_cost_usd: None,
            eval_provider: None,
            eval_status: None,
            eval_scores: None,
            created_at: None,
            updated_at: None,
            steps: Vec::new(),
        }
    }

    pub fn change_token(&self) -> Option<&ChangeToken> {
        self.updated_at.as_ref()
    }

    pub fn is_evaluated(&self) -> bool {
        self.eval_provider.is_some()
    }

    /// Case-insensitive match against id, agent name and prompt.
    pub fn matches_query(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }
        let haystack = format!(
            "{} {} {}",
            self.id,
            self.agent_name.as_deref().unwrap_or_default(),
            self.input_prompt.as_deref().unwrap_or_default()
        )
        .to_lowercase();
        haystack.contains(&query)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvaluateAck {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayAck {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub replay_run_id: Option<RunId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteAck {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub run_id: Option<RunId>,
}
