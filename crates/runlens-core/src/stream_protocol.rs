use crate::{RunId, Step};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Matches the websocket transport's own message limit, so any frame the
/// socket accepts is decoded.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 << 20;

/// One server-push message on `/ws/runs/{id}`, tagged by its `event` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Step {
        step: Step,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<RunId>,
    },
    Ping,
    #[serde(other)]
    Other,
}

impl StreamEvent {
    pub fn step(step: Step) -> Self {
        StreamEvent::Step { step, run_id: None }
    }

    /// Run the event claims to belong to, from the envelope or the step.
    pub fn target_run(&self) -> Option<RunId> {
        match self {
            StreamEvent::Step { step, run_id } => run_id.or(step.run_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("payload is empty")]
    Empty,
    #[error("payload decode failed: {0}")]
    Decode(String),
}

pub fn parse_stream_message(text: &str) -> Result<StreamEvent, PayloadError> {
    parse_stream_message_with_limit(text, DEFAULT_MAX_PAYLOAD_BYTES)
}

pub fn parse_stream_message_with_limit(
    text: &str,
    max_payload_bytes: usize,
) -> Result<StreamEvent, PayloadError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(PayloadError::Empty);
    }
    if trimmed.len() > max_payload_bytes {
        return Err(PayloadError::Oversized {
            size: trimmed.len(),
            max: max_payload_bytes,
        });
    }
    serde_json::from_str(trimmed).map_err(|err| PayloadError::Decode(err.to_string()))
}

pub fn encode_stream_event(event: &StreamEvent) -> Result<String, PayloadError> {
    serde_json::to_string(event).map_err(|err| PayloadError::Decode(err.to_string()))
}
