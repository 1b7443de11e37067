//! Async client for the run observability backend: REST access, the live
//! step stream, and the evaluate/replay action flow.

pub mod actions;
pub mod api;
mod error;
pub mod http;
pub mod stream;
pub mod watcher;

#[cfg(test)]
mod test_support;

pub use actions::{
    ActionConfig, ActionError, ActionOutcome, ActionState, RefreshTarget, RunAction, RunActions,
};
pub use api::{ListPage, RunApi, DEFAULT_LIST_LIMIT};
pub use error::{ApiError, StreamError};
pub use http::{parse_base_url, stream_url, HttpRunApi};
pub use stream::{
    StreamConfig, StreamConnection, StreamConnectionManager, StreamConnector, StreamView,
    WsConnector, DEFAULT_CONNECT_TIMEOUT,
};
pub use watcher::{await_change, token_advanced, WatchOptions, WatchOutcome};
