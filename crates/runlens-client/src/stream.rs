//! Live step stream for one run at a time.
//!
//! `StreamConnectionManager` owns a background session task per bound run.
//! The task drives a `ConnectionSession` through connect, read and backoff,
//! and merges every step it receives into the shared `StreamView`. Stopping
//! or switching runs cancels the task; a cancelled task never publishes
//! again, so late frames from an old socket cannot leak into the new view.

use crate::error::StreamError;
use crate::http::stream_url;
use async_trait::async_trait;
use futures_util::StreamExt;
use runlens_core::stream_protocol::{parse_stream_message_with_limit, DEFAULT_MAX_PAYLOAD_BYTES};
use runlens_core::{
    BackoffPolicy, CloseReason, ConnectionSession, ConnectionState, RunId, Step, StreamEvent,
    Timeline,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const CLOSE_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    async fn connect(&self, run_id: RunId) -> Result<Box<dyn StreamConnection>, StreamError>;
}

#[async_trait]
pub trait StreamConnection: Send {
    /// Next text payload. `None` once the peer has closed the stream.
    async fn recv(&mut self) -> Option<Result<String, StreamError>>;

    async fn close(&mut self);
}

pub struct WsConnector {
    base: Url,
}

impl WsConnector {
    pub fn new(base: Url) -> Self {
        Self { base }
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self, run_id: RunId) -> Result<Box<dyn StreamConnection>, StreamError> {
        let url = stream_url(&self.base, run_id)?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|err| StreamError::Connect(err.to_string()))?;
        Ok(Box::new(WsConnection { socket }))
    }
}

struct WsConnection {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StreamConnection for WsConnection {
    async fn recv(&mut self) -> Option<Result<String, StreamError>> {
        loop {
            match self.socket.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(err) => return Some(Err(StreamError::Transport(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.socket.close(None).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub backoff: BackoffPolicy,
    pub max_payload_bytes: usize,
    /// Upper bound on one connect attempt, handshake included.
    pub connect_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// What observers see: the merged timeline plus connection health.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamView {
    pub run_id: Option<RunId>,
    pub timeline: Timeline,
    pub live: bool,
    pub retry_count: u32,
    pub state: ConnectionState,
}

impl Default for StreamView {
    fn default() -> Self {
        Self {
            run_id: None,
            timeline: Timeline::new(),
            live: false,
            retry_count: 0,
            state: ConnectionState::Idle,
        }
    }
}

impl StreamView {
    fn bound(run_id: RunId, seed: Vec<Step>) -> Self {
        Self {
            run_id: Some(run_id),
            timeline: Timeline::from_steps(seed.into_iter().filter(|step| belongs_to(step, run_id))),
            ..Self::default()
        }
    }
}

struct ActiveSession {
    run_id: RunId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct StreamConnectionManager {
    connector: Arc<dyn StreamConnector>,
    config: StreamConfig,
    view: Arc<watch::Sender<StreamView>>,
    active: Option<ActiveSession>,
}

impl StreamConnectionManager {
    pub fn new(connector: Arc<dyn StreamConnector>, config: StreamConfig) -> Self {
        let (view, _) = watch::channel(StreamView::default());
        Self {
            connector,
            config,
            view: Arc::new(view),
            active: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamView> {
        self.view.subscribe()
    }

    pub fn view(&self) -> StreamView {
        self.view.borrow().clone()
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.active.as_ref().map(|active| active.run_id)
    }

    /// Binds to `run_id` and starts connecting. `seed` is the timeline
    /// taken from the latest snapshot; stream events merge on top of it.
    /// Any previous session is cancelled first.
    pub fn start(&mut self, run_id: RunId, seed: Vec<Step>) {
        let _ = self.cancel_active();
        self.view.send_replace(StreamView::bound(run_id, seed));

        let cancel = CancellationToken::new();
        let publisher = Publisher {
            view: Arc::clone(&self.view),
            cancel: cancel.clone(),
            run_id,
            max_payload_bytes: self.config.max_payload_bytes,
        };
        let task = tokio::spawn(run_session(
            Arc::clone(&self.connector),
            ConnectionSession::new(run_id, self.config.backoff),
            publisher,
            self.config.connect_timeout,
        ));
        info!("stream_start: run={run_id}");
        self.active = Some(ActiveSession {
            run_id,
            cancel,
            task,
        });
    }

    pub fn switch_run(&mut self, run_id: RunId, seed: Vec<Step>) {
        self.start(run_id, seed);
    }

    /// Cancels the session, including any pending reconnect timer. Calling
    /// it again, or before `start`, is a no-op.
    pub fn stop(&mut self) -> bool {
        if self.cancel_active().is_none() {
            return false;
        }
        self.mark_stopped();
        true
    }

    /// Merges steps fetched out of band (a snapshot refresh) into the bound
    /// timeline. Returns how many were new; a stopped view takes nothing.
    pub fn backfill(&self, steps: Vec<Step>) -> usize {
        let mut added = 0;
        self.view.send_if_modified(|view| {
            if view.state == ConnectionState::Stopped {
                return false;
            }
            let Some(run_id) = view.run_id else {
                return false;
            };
            added = view
                .timeline
                .extend(steps.into_iter().filter(|step| belongs_to(step, run_id)));
            added > 0
        });
        added
    }

    /// Stops and waits for the session task to finish.
    pub async fn shutdown(&mut self) {
        if let Some(task) = self.cancel_active() {
            self.mark_stopped();
            let _ = task.await;
        }
    }

    fn cancel_active(&mut self) -> Option<JoinHandle<()>> {
        let active = self.active.take()?;
        active.cancel.cancel();
        info!("stream_stop: run={}", active.run_id);
        Some(active.task)
    }

    fn mark_stopped(&self) {
        self.view.send_modify(|view| {
            view.live = false;
            view.state = ConnectionState::Stopped;
        });
    }
}

impl Drop for StreamConnectionManager {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
        }
    }
}

fn belongs_to(step: &Step, run_id: RunId) -> bool {
    step.run_id.map_or(true, |owner| owner == run_id)
}

/// Writes into the shared view on behalf of one session. The cancellation
/// check runs under the channel lock, so once `stop` has cancelled the token
/// nothing from this session can land in the view.
struct Publisher {
    view: Arc<watch::Sender<StreamView>>,
    cancel: CancellationToken,
    run_id: RunId,
    max_payload_bytes: usize,
}

impl Publisher {
    fn sync(&self, session: &ConnectionSession) {
        self.view.send_if_modified(|view| {
            if self.cancel.is_cancelled() {
                return false;
            }
            let live = session.is_live();
            let retry_count = session.retry_count();
            let changed = view.live != live
                || view.retry_count != retry_count
                || &view.state != session.state();
            view.live = live;
            view.retry_count = retry_count;
            view.state = session.state().clone();
            changed
        });
    }

    fn handle_payload(&self, text: &str) {
        let event = match parse_stream_message_with_limit(text, self.max_payload_bytes) {
            Ok(event) => event,
            Err(err) => {
                warn!("stream_payload_error: run={} {err}", self.run_id);
                return;
            }
        };
        let target = event.target_run();
        match event {
            StreamEvent::Step { .. } if target.is_some_and(|id| id != self.run_id) => {
                debug!("stream_foreign_step: bound={} got={target:?}", self.run_id);
            }
            StreamEvent::Step { step, .. } => self.merge(step),
            StreamEvent::Ping => {}
            StreamEvent::Other => debug!("stream_event_ignored: run={}", self.run_id),
        }
    }

    fn merge(&self, step: Step) {
        self.view.send_if_modified(|view| {
            if self.cancel.is_cancelled() {
                return false;
            }
            view.timeline.insert(step).is_inserted()
        });
    }
}

async fn run_session(
    connector: Arc<dyn StreamConnector>,
    mut session: ConnectionSession,
    publisher: Publisher,
    connect_timeout: Duration,
) {
    let run_id = session.run_id();
    let cancel = publisher.cancel.clone();

    'session: loop {
        if !session.begin_connect() {
            break;
        }
        publisher.sync(&session);

        let connected = tokio::select! {
            _ = cancel.cancelled() => break 'session,
            result = tokio::time::timeout(connect_timeout, connector.connect(run_id)) => {
                result.unwrap_or_else(|_| {
                    Err(StreamError::Connect(format!(
                        "timed out after {} ms",
                        connect_timeout.as_millis()
                    )))
                })
            }
        };
        let reason = match connected {
            Ok(mut connection) => {
                session.on_open();
                publisher.sync(&session);
                info!("stream_open: run={run_id}");
                let closed = loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break None,
                        frame = connection.recv() => match frame {
                            Some(Ok(text)) => publisher.handle_payload(&text),
                            Some(Err(err)) => break Some(CloseReason::Transport(err.to_string())),
                            None => break Some(CloseReason::ClosedByPeer),
                        },
                    }
                };
                let _ = tokio::time::timeout(CLOSE_GRACE, connection.close()).await;
                match closed {
                    Some(reason) => reason,
                    None => break 'session,
                }
            }
            Err(err) => CloseReason::ConnectFailed(err.to_string()),
        };

        let Some(delay) = session.on_close(reason.clone()) else {
            break;
        };
        publisher.sync(&session);
        warn!(
            "stream_closed: run={run_id} reason={reason} retry={} delay_ms={}",
            session.retry_count(),
            delay.as_millis()
        );
        tokio::select! {
            _ = cancel.cancelled() => break 'session,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("stream_session_exit: run={run_id}");
}
