use crate::config::Config;
use crate::format::{
    filter_runs, format_eval, format_run_row, format_stats, format_step_line, format_timestamp,
};
use anyhow::{bail, Context, Result};
use runlens_client::{
    ActionConfig, ActionOutcome, HttpRunApi, ListPage, RefreshTarget, RunAction, RunActions,
    RunApi, StreamConnectionManager, StreamConnector, StreamView, WatchOutcome, WsConnector,
};
use runlens_core::{ConnectionState, RunId, RunSnapshot, RunStatus, Step, Timeline};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub fn build_api(config: &Config) -> Result<Arc<HttpRunApi>> {
    let api = HttpRunApi::with_timeout(config.api_base.clone(), config.request_timeout)
        .context("failed to create api client")?;
    Ok(Arc::new(api))
}

pub fn build_stream(config: &Config) -> StreamConnectionManager {
    let connector: Arc<dyn StreamConnector> =
        Arc::new(WsConnector::new(config.stream_base.clone()));
    StreamConnectionManager::new(connector, config.stream)
}

pub async fn list(
    api: &dyn RunApi,
    page: ListPage,
    status: Option<RunStatus>,
    query: Option<&str>,
    json: bool,
) -> Result<()> {
    let runs = api.list_runs(page).await.context("failed to list runs")?;
    let total = runs.len();
    let runs = filter_runs(runs, status, query);
    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }
    if runs.is_empty() {
        println!("no runs ({total} fetched, 0 matched)");
        return Ok(());
    }
    for run in &runs {
        println!("{}", format_run_row(run));
    }
    if runs.len() != total {
        println!("{} of {total} fetched runs matched", runs.len());
    }
    Ok(())
}

pub async fn show(api: &dyn RunApi, run_id: RunId, json: bool) -> Result<()> {
    let run = api
        .fetch_run(run_id)
        .await
        .with_context(|| format!("failed to fetch run #{run_id}"))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }
    for line in describe_run(&run) {
        println!("{line}");
    }
    Ok(())
}

pub fn describe_run(run: &RunSnapshot) -> Vec<String> {
    let timeline = Timeline::from_steps(run.steps.iter().cloned());
    let mut lines = vec![
        format!(
            "Run #{} [{}] {}",
            run.id,
            run.status,
            run.agent_name.as_deref().unwrap_or("-")
        ),
        format!(
            "created {} | updated {}",
            run.created_at
                .as_deref()
                .map(format_timestamp)
                .unwrap_or_else(|| "-".to_string()),
            run.change_token()
                .map(|token| format_timestamp(token.as_str()))
                .unwrap_or_else(|| "-".to_string())
        ),
        format!("prompt: {}", run.input_prompt.as_deref().unwrap_or("-")),
    ];
    if let Some(output) = run.final_output.as_deref() {
        lines.push(format!("output: {output}"));
    }
    if let Some(error) = run.error_message.as_deref() {
        lines.push(format!("error: {error}"));
    }
    lines.push(format!("eval: {}", format_eval(run)));
    lines.push(format_stats(&timeline.stats()));
    lines.extend(timeline.steps().iter().map(format_step_line));
    lines
}

pub async fn tail(api: Arc<HttpRunApi>, config: &Config, run_id: RunId) -> Result<()> {
    let seed = match api.fetch_run(run_id).await {
        Ok(run) => run.steps,
        Err(err) if err.is_not_found() => bail!("run #{run_id} not found"),
        Err(err) => {
            warn!("tail_snapshot_error: run={run_id} {err}");
            Vec::new()
        }
    };
    let mut manager = build_stream(config);
    let mut view = manager.subscribe();
    manager.start(run_id, seed);
    info!("tail_start: run={run_id}");

    let mut printer = TailPrinter::default();
    let (backfill_tx, mut backfill_rx) = mpsc::unbounded_channel();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        let current = view.borrow_and_update().clone();
        for line in printer.lines(&current) {
            println!("{line}");
        }
        if printer.take_reconnected() {
            spawn_backfill(&api, run_id, &backfill_tx);
        }
        tokio::select! {
            _ = &mut ctrl_c => break,
            Some(steps) = backfill_rx.recv() => {
                apply_backfill(&manager, run_id, steps);
            }
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    manager.shutdown().await;
    Ok(())
}

/// Refetches the snapshot on a background task so steps missed while
/// disconnected show up. The steps arrive on `tx`.
pub fn spawn_backfill<A: RunApi>(
    api: &Arc<A>,
    run_id: RunId,
    tx: &mpsc::UnboundedSender<Vec<Step>>,
) {
    let api = Arc::clone(api);
    let tx = tx.clone();
    tokio::spawn(async move {
        match api.fetch_run(run_id).await {
            Ok(run) => {
                let _ = tx.send(run.steps);
            }
            Err(err) => warn!("stream_backfill_error: run={run_id} {err}"),
        }
    });
}

pub fn apply_backfill(
    manager: &StreamConnectionManager,
    run_id: RunId,
    steps: Vec<Step>,
) -> usize {
    let added = manager.backfill(steps);
    if added > 0 {
        info!("stream_backfill: run={run_id} added={added}");
    }
    added
}

/// Turns successive stream views into printable lines: each step once, and
/// a status line whenever connection health changes.
#[derive(Default)]
struct TailPrinter {
    printed: HashSet<i64>,
    status: Option<(bool, u32, &'static str)>,
    was_live: bool,
    reconnected: bool,
}

impl TailPrinter {
    fn lines(&mut self, view: &StreamView) -> Vec<String> {
        let mut lines: Vec<String> = view
            .timeline
            .steps()
            .iter()
            .filter(|step| self.printed.insert(step.id))
            .map(format_step_line)
            .collect();
        let status = (view.live, view.retry_count, view.state.label());
        if self.status != Some(status) {
            self.status = Some(status);
            lines.push(describe_connection(view));
        }
        if view.live && !self.was_live {
            self.reconnected = true;
        }
        self.was_live = view.live;
        lines
    }

    fn take_reconnected(&mut self) -> bool {
        std::mem::take(&mut self.reconnected)
    }
}

pub fn describe_connection(view: &StreamView) -> String {
    match &view.state {
        ConnectionState::Open => "-- live".to_string(),
        ConnectionState::Closed(reason) => {
            format!("-- disconnected ({reason}), retry {}", view.retry_count)
        }
        ConnectionState::Connecting if view.retry_count > 0 => {
            format!("-- reconnecting, retry {}", view.retry_count)
        }
        state => format!("-- {}", state.label()),
    }
}

pub async fn run_action(
    api: Arc<HttpRunApi>,
    config: ActionConfig,
    run_id: RunId,
    action: RunAction,
) -> Result<()> {
    let refresh: Arc<dyn RefreshTarget> = Arc::new(|| {});
    let actions = RunActions::new(Arc::clone(&api), run_id, refresh, config);
    let outcome = match actions.run(action).await {
        Ok(outcome) => outcome,
        Err(err) => bail!("{action} failed: {err}"),
    };
    match outcome {
        ActionOutcome::Evaluated {
            watch: WatchOutcome::Completed(token),
        } => {
            println!("evaluation recorded at {}", format_timestamp(token.as_str()));
            let run = api
                .fetch_run(run_id)
                .await
                .with_context(|| format!("failed to refresh run #{run_id}"))?;
            println!("eval: {}", format_eval(&run));
        }
        ActionOutcome::Evaluated {
            watch: WatchOutcome::TimedOut,
        } => {
            println!(
                "evaluation submitted; no change seen within {} ms (it may still be running)",
                config.watch.timeout.as_millis()
            );
        }
        ActionOutcome::ReplayStarted {
            replay_run_id: Some(replay),
        } => println!("replay started as run #{replay}"),
        ActionOutcome::ReplayStarted {
            replay_run_id: None,
        } => println!("replay queued"),
    }
    Ok(())
}

pub async fn delete(api: &dyn RunApi, run_id: RunId) -> Result<()> {
    api.delete_run(run_id)
        .await
        .with_context(|| format!("failed to delete run #{run_id}"))?;
    println!("deleted run #{run_id}");
    Ok(())
}
