use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use runlens_client::{
    parse_base_url, ActionConfig, ActionOutcome, HttpRunApi, ListPage, RefreshTarget, RunAction,
    RunActions, RunApi, StreamConfig, StreamConnectionManager, StreamConnector, WatchOptions,
    WatchOutcome, WsConnector,
};
use runlens_core::{BackoffPolicy, ChangeToken, RunId, RunStatus};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

#[derive(Clone, Default)]
struct Backend {
    runs: Arc<Mutex<BTreeMap<u64, Value>>>,
    stream_connects: Arc<AtomicUsize>,
}

impl Backend {
    fn with_runs(ids: &[u64]) -> Self {
        let backend = Self::default();
        {
            let mut runs = backend.runs.lock().expect("runs lock");
            for id in ids {
                runs.insert(
                    *id,
                    json!({
                        "id": id,
                        "agent_name": "demo-agent",
                        "status": "success",
                        "input_prompt": format!("prompt {id}"),
                        "updated_at": "2026-02-07T21:00:00.000001",
                        "steps": [
                            {"id": 1, "run_id": id, "step_type": "llm_call", "latency_ms": 100.0}
                        ]
                    }),
                );
            }
        }
        backend
    }

    fn run(&self, id: u64) -> Option<Value> {
        self.runs.lock().expect("runs lock").get(&id).cloned()
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Run not found").into_response()
}

async fn get_run(State(backend): State<Backend>, Path(id): Path<u64>) -> Response {
    match backend.run(id) {
        Some(run) => Json(run).into_response(),
        None => not_found(),
    }
}

async fn list_runs(
    State(backend): State<Backend>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<Value>> {
    let limit = params
        .get("limit")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(50);
    let offset = params
        .get("offset")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let runs = backend.runs.lock().expect("runs lock");
    Json(runs.values().rev().skip(offset).take(limit).cloned().collect())
}

async fn delete_run(State(backend): State<Backend>, Path(id): Path<u64>) -> Response {
    match backend.runs.lock().expect("runs lock").remove(&id) {
        Some(_) => Json(json!({"ok": true, "run_id": id})).into_response(),
        None => not_found(),
    }
}

async fn evaluate_run(State(backend): State<Backend>, Path(id): Path<u64>) -> Response {
    if backend.run(id).is_none() {
        return not_found();
    }
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if let Some(run) = backend.runs.lock().expect("runs lock").get_mut(&id) {
            run["eval_provider"] = json!("ollama");
            run["eval_status"] = json!("done");
            run["updated_at"] = json!("2026-02-07T21:00:05.000001");
        }
    });
    Json(json!({"ok": true, "task_id": "task-abc"})).into_response()
}

async fn replay_run(State(backend): State<Backend>, Path(id): Path<u64>) -> Response {
    if backend.run(id).is_none() {
        return not_found();
    }
    Json(json!({"ok": true, "replay_run_id": 99})).into_response()
}

async fn stream_run(
    ws: WebSocketUpgrade,
    State(backend): State<Backend>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_stream(socket, backend, id))
}

fn step_frame(run_id: u64, step_id: i64) -> String {
    json!({
        "event": "step",
        "run_id": run_id,
        "step": {"id": step_id, "run_id": run_id, "step_type": "tool_call", "name": "search"}
    })
    .to_string()
}

async fn serve_stream(mut socket: WebSocket, backend: Backend, run_id: u64) {
    let connection = backend.stream_connects.fetch_add(1, Ordering::SeqCst);
    let frames = if connection == 0 {
        vec![
            step_frame(run_id, 3),
            step_frame(run_id, 1),
            "not json".to_string(),
            json!({"event": "ping"}).to_string(),
            step_frame(run_id, 2),
        ]
    } else {
        vec![step_frame(run_id, 2), step_frame(run_id, 4)]
    };
    for frame in frames {
        if socket.send(Message::Text(frame)).await.is_err() {
            return;
        }
    }
    if connection == 0 {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn spawn_backend(backend: Backend) -> Url {
    let app = Router::new()
        .route("/runs", get(list_runs))
        .route("/runs/:id", get(get_run).delete(delete_run))
        .route("/runs/:id/evaluate", post(evaluate_run))
        .route("/runs/:id/replay", post(replay_run))
        .route("/ws/runs/:id", get(stream_run))
        .with_state(backend);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    parse_base_url(&format!("http://{addr}")).expect("base url")
}

#[tokio::test]
async fn rest_calls_round_trip() {
    let base = spawn_backend(Backend::with_runs(&[1, 2, 3])).await;
    let api = HttpRunApi::new(base).expect("client");

    let run = api.fetch_run(RunId(2)).await.expect("fetch run");
    assert_eq!(run.id, RunId(2));
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.steps.len(), 1);

    let page = api
        .list_runs(ListPage {
            limit: 2,
            offset: 0,
        })
        .await
        .expect("list runs");
    assert_eq!(
        page.iter().map(|run| run.id).collect::<Vec<_>>(),
        vec![RunId(3), RunId(2)]
    );

    let deleted = api.delete_run(RunId(3)).await.expect("delete");
    assert_eq!(deleted.run_id, Some(RunId(3)));
    let err = api.fetch_run(RunId(3)).await.expect_err("deleted run");
    assert!(err.is_not_found());
    assert_eq!(err.to_string(), "Run not found");

    let replay = api.replay_run(RunId(1)).await.expect("replay");
    assert_eq!(replay.replay_run_id, Some(RunId(99)));
}

#[tokio::test]
async fn stream_merges_across_reconnect() {
    let backend = Backend::with_runs(&[5]);
    let connects = Arc::clone(&backend.stream_connects);
    let base = spawn_backend(backend).await;
    let connector: Arc<dyn StreamConnector> = Arc::new(WsConnector::new(base));
    let config = StreamConfig {
        backoff: BackoffPolicy::new(Duration::from_millis(20), Duration::from_millis(200), 5),
        ..StreamConfig::default()
    };
    let mut manager = StreamConnectionManager::new(connector, config);
    let mut view = manager.subscribe();
    manager.start(RunId(5), Vec::new());

    let merged = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            {
                let current = view.borrow_and_update();
                if current.timeline.len() == 4 && current.live {
                    return current.clone();
                }
            }
            view.changed().await.expect("manager alive");
        }
    })
    .await
    .expect("stream converged");

    assert_eq!(merged.timeline.ids(), vec![1, 2, 3, 4]);
    assert_eq!(merged.retry_count, 0);
    assert!(connects.load(Ordering::SeqCst) >= 2);

    manager.shutdown().await;
    assert!(!manager.view().live);
}

#[tokio::test]
async fn evaluate_waits_for_backend_write() {
    let backend = Backend::with_runs(&[8]);
    let base = spawn_backend(backend.clone()).await;
    let api = Arc::new(HttpRunApi::new(base).expect("client"));
    let refreshes = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&refreshes);
    let refresh: Arc<dyn RefreshTarget> = Arc::new(move || {
        hits.fetch_add(1, Ordering::SeqCst);
    });
    let config = ActionConfig {
        watch: WatchOptions {
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(50),
        },
        followup_refresh: Duration::from_millis(100),
    };
    let actions = RunActions::new(Arc::clone(&api), RunId(8), refresh, config);

    let outcome = actions.run(RunAction::Evaluate).await.expect("evaluate");
    assert_eq!(
        outcome,
        ActionOutcome::Evaluated {
            watch: WatchOutcome::Completed(ChangeToken::new("2026-02-07T21:00:05.000001"))
        }
    );
    let run = api.fetch_run(RunId(8)).await.expect("fetch evaluated");
    assert!(run.is_evaluated());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(refreshes.load(Ordering::SeqCst), 2);

    let err = RunActions::new(
        Arc::clone(&api),
        RunId(404),
        Arc::new(|| {}) as Arc<dyn RefreshTarget>,
        ActionConfig::default(),
    )
    .run(RunAction::Replay)
    .await
    .expect_err("unknown run");
    assert_eq!(err.to_string(), "Run not found");
}
