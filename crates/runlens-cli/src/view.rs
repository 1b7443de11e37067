//! Interactive run view: live step timeline plus evaluate/replay actions.

use crate::commands::{apply_backfill, build_stream};
use crate::config::Config;
use crate::format::{ellipsize, fit_fields, format_eval, format_stats, format_step_line};
use anyhow::{bail, Result};
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::StreamExt;
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Paragraph, Wrap},
    Terminal,
};
use runlens_client::{
    ActionError, ActionOutcome, ActionState, HttpRunApi, RefreshTarget, RunAction, RunActions,
    RunApi, StreamView, WatchOutcome,
};
use runlens_core::{RunId, RunSnapshot, Step};
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug)]
pub enum AppEvent {
    RefreshRequested,
    Refreshed(Result<RunSnapshot, String>),
    ActionFinished(RunAction, Result<ActionOutcome, ActionError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    None,
    Quit,
    Refresh,
    Run(RunAction),
}

#[derive(Clone, Copy)]
struct Theme {
    bg: Color,
    border: Color,
    title: Color,
    text: Color,
    muted: Color,
    ok: Color,
    warn: Color,
    critical: Color,
}

fn theme() -> Theme {
    Theme {
        bg: Color::Rgb(11, 18, 32),
        border: Color::Rgb(71, 85, 105),
        title: Color::Rgb(191, 219, 254),
        text: Color::Rgb(226, 232, 240),
        muted: Color::Rgb(148, 163, 184),
        ok: Color::Rgb(34, 197, 94),
        warn: Color::Rgb(245, 158, 11),
        critical: Color::Rgb(239, 68, 68),
    }
}

pub struct App {
    run_id: RunId,
    snapshot: Option<RunSnapshot>,
    stream: StreamView,
    actions: ActionState,
    note: Option<String>,
    scroll: usize,
    follow: bool,
    was_live: bool,
}

impl App {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            snapshot: None,
            stream: StreamView::default(),
            actions: ActionState::default(),
            note: None,
            scroll: 0,
            follow: true,
            was_live: false,
        }
    }

    /// Returns true when the stream has just come (back) up, which is the
    /// cue to backfill from a fresh snapshot.
    pub fn apply_stream(&mut self, view: StreamView) -> bool {
        let reconnected = view.live && !self.was_live;
        self.was_live = view.live;
        self.stream = view;
        if self.follow {
            self.scroll = self.max_scroll();
        }
        reconnected
    }

    pub fn apply_actions(&mut self, state: ActionState) {
        self.actions = state;
    }

    pub fn apply_refresh(&mut self, result: Result<RunSnapshot, String>) {
        match result {
            Ok(snapshot) => self.snapshot = Some(snapshot),
            Err(err) => self.note = Some(format!("refresh failed: {err}")),
        }
    }

    pub fn apply_action_result(
        &mut self,
        action: RunAction,
        result: Result<ActionOutcome, ActionError>,
    ) {
        self.note = Some(match result {
            Ok(ActionOutcome::Evaluated {
                watch: WatchOutcome::Completed(_),
            }) => "evaluation recorded".to_string(),
            Ok(ActionOutcome::Evaluated {
                watch: WatchOutcome::TimedOut,
            }) => "evaluation submitted; still pending, view refreshed".to_string(),
            Ok(ActionOutcome::ReplayStarted {
                replay_run_id: Some(replay),
            }) => format!("replay started as run #{replay}"),
            Ok(ActionOutcome::ReplayStarted {
                replay_run_id: None,
            }) => "replay queued".to_string(),
            Err(err) => format!("{action} failed: {err}"),
        });
    }

    pub fn is_busy(&self) -> bool {
        self.actions.busy_action.is_some()
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> Intent {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return Intent::Quit;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => Intent::Quit,
            KeyCode::Char('e') => self.claim(RunAction::Evaluate),
            KeyCode::Char('r') => self.claim(RunAction::Replay),
            KeyCode::Char('R') => Intent::Refresh,
            KeyCode::Char('j') | KeyCode::Down => {
                self.scroll = (self.scroll + 1).min(self.max_scroll());
                self.follow = self.scroll == self.max_scroll();
                Intent::None
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.scroll = self.scroll.saturating_sub(1);
                self.follow = false;
                Intent::None
            }
            KeyCode::Char('g') | KeyCode::Home => {
                self.scroll = 0;
                self.follow = false;
                Intent::None
            }
            KeyCode::Char('G') | KeyCode::End => {
                self.scroll = self.max_scroll();
                self.follow = true;
                Intent::None
            }
            _ => Intent::None,
        }
    }

    /// Takes the busy slot locally so a second key press cannot start a
    /// concurrent action before the orchestrator's state arrives.
    fn claim(&mut self, action: RunAction) -> Intent {
        if self.is_busy() {
            return Intent::None;
        }
        self.actions.busy_action = Some(action);
        self.actions.error = None;
        self.note = None;
        Intent::Run(action)
    }

    fn max_scroll(&self) -> usize {
        self.stream.timeline.len().saturating_sub(1)
    }

    fn steps(&self) -> &[Step] {
        self.stream.timeline.steps()
    }
}

pub async fn run_watch(api: Arc<HttpRunApi>, config: &Config, run_id: RunId) -> Result<()> {
    let mut app = App::new(run_id);
    let seed = match api.fetch_run(run_id).await {
        Ok(snapshot) => {
            let steps = snapshot.steps.clone();
            app.apply_refresh(Ok(snapshot));
            steps
        }
        Err(err) if err.is_not_found() => bail!("run #{run_id} not found"),
        Err(err) => {
            warn!("watch_snapshot_error: run={run_id} {err}");
            app.apply_refresh(Err(err.to_string()));
            Vec::new()
        }
    };

    let mut manager = build_stream(config);
    manager.start(run_id, seed);
    let (tx, rx) = mpsc::unbounded_channel();
    let refresh_tx = tx.clone();
    let refresh: Arc<dyn RefreshTarget> = Arc::new(move || {
        let _ = refresh_tx.send(AppEvent::RefreshRequested);
    });
    let actions = Arc::new(RunActions::new(
        Arc::clone(&api),
        run_id,
        refresh,
        config.actions,
    ));
    info!("watch_start: run={run_id}");

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = event_loop(
        &mut terminal,
        &mut app,
        &api,
        &manager,
        &actions,
        tx,
        rx,
    )
    .await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    actions.detach();
    manager.shutdown().await;
    result
}

async fn event_loop<B: Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    api: &Arc<HttpRunApi>,
    manager: &runlens_client::StreamConnectionManager,
    actions: &Arc<RunActions<Arc<HttpRunApi>>>,
    tx: mpsc::UnboundedSender<AppEvent>,
    mut rx: mpsc::UnboundedReceiver<AppEvent>,
) -> Result<()> {
    let mut stream_rx = manager.subscribe();
    let mut action_rx = actions.subscribe();
    let mut events = EventStream::new();

    loop {
        terminal.draw(|frame| render_ui(frame, app))?;
        tokio::select! {
            Ok(()) = stream_rx.changed() => {
                let view = stream_rx.borrow_and_update().clone();
                apply_stream_change(app, view, api, &tx);
            }
            Ok(()) = action_rx.changed() => {
                let state = action_rx.borrow_and_update().clone();
                app.apply_actions(state);
            }
            Some(event) = rx.recv() => match event {
                AppEvent::RefreshRequested => spawn_refresh(api, app.run_id, &tx),
                AppEvent::Refreshed(result) => {
                    if let Ok(snapshot) = &result {
                        apply_backfill(manager, app.run_id, snapshot.steps.clone());
                    }
                    app.apply_refresh(result);
                }
                AppEvent::ActionFinished(action, result) => {
                    app.apply_action_result(action, result);
                }
            },
            maybe_event = events.next() => {
                let Some(Ok(Event::Key(key))) = maybe_event else {
                    continue;
                };
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match app.handle_key(key) {
                    Intent::Quit => break,
                    Intent::Refresh => spawn_refresh(api, app.run_id, &tx),
                    Intent::Run(action) => spawn_action(actions, action, &tx),
                    Intent::None => {}
                }
            }
        }
    }
    Ok(())
}

/// A stream that has just come back up gets a snapshot refresh; its steps
/// are backfilled when `Refreshed` arrives.
fn apply_stream_change<A: RunApi>(
    app: &mut App,
    view: StreamView,
    api: &Arc<A>,
    tx: &mpsc::UnboundedSender<AppEvent>,
) {
    if app.apply_stream(view) {
        spawn_refresh(api, app.run_id, tx);
    }
}

fn spawn_refresh<A: RunApi>(api: &Arc<A>, run_id: RunId, tx: &mpsc::UnboundedSender<AppEvent>) {
    let api = Arc::clone(api);
    let tx = tx.clone();
    tokio::spawn(async move {
        let result = api.fetch_run(run_id).await.map_err(|err| err.to_string());
        let _ = tx.send(AppEvent::Refreshed(result));
    });
}

fn spawn_action(
    actions: &Arc<RunActions<Arc<HttpRunApi>>>,
    action: RunAction,
    tx: &mpsc::UnboundedSender<AppEvent>,
) {
    let actions = Arc::clone(actions);
    let tx = tx.clone();
    tokio::spawn(async move {
        let result = actions.run(action).await;
        let _ = tx.send(AppEvent::ActionFinished(action, result));
    });
}

fn render_ui(frame: &mut ratatui::Frame, app: &App) {
    let size = frame.size();
    let theme = theme();
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4),
            Constraint::Length(5),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .split(size);
    frame.render_widget(render_header(app, theme, size.width), layout[0]);
    frame.render_widget(render_summary(app, theme), layout[1]);
    render_timeline(frame, app, theme, layout[2]);
    frame.render_widget(
        Paragraph::new(Span::styled(
            "e evaluate | r replay | R refresh | j/k scroll | q quit",
            Style::default().fg(theme.muted),
        ))
        .style(Style::default().bg(theme.bg)),
        layout[3],
    );
}

fn panel(title: &str, theme: Theme) -> Block<'static> {
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(theme.border))
        .style(Style::default().bg(theme.bg))
        .title(Span::styled(
            title.to_string(),
            Style::default()
                .fg(theme.title)
                .add_modifier(Modifier::BOLD),
        ))
}

fn render_header(app: &App, theme: Theme, width: u16) -> Paragraph<'static> {
    let inner_width = width.saturating_sub(4) as usize;
    let status = app
        .snapshot
        .as_ref()
        .map(|snapshot| snapshot.status.as_str())
        .unwrap_or("unknown");
    let (live_label, live_color) = if app.stream.live {
        ("live", theme.ok)
    } else {
        (app.stream.state.label(), theme.warn)
    };
    let fields = vec![
        format!("Run #{}", app.run_id),
        format!("Status: {status}"),
        format!("Stream: {live_label}"),
        format!("Retries: {}", app.stream.retry_count),
        match app.actions.busy_action {
            Some(action) => format!("Busy: {action}"),
            None => "Idle".to_string(),
        },
    ];

    let (message, message_color) = match (&app.actions.error, &app.note) {
        (Some(error), _) => (error.clone(), theme.critical),
        (None, Some(note)) => (note.clone(), theme.text),
        (None, None) => ("ready".to_string(), theme.muted),
    };

    Paragraph::new(Text::from(vec![
        Line::from(Span::styled(
            fit_fields(&fields, inner_width.max(12)),
            Style::default().fg(live_color),
        )),
        Line::from(Span::styled(
            ellipsize(&message, inner_width.max(12)),
            Style::default().fg(message_color),
        )),
    ]))
    .block(panel("Run", theme))
}

fn render_summary(app: &App, theme: Theme) -> Paragraph<'static> {
    let stats = format_stats(&app.stream.timeline.stats());
    let (eval, prompt) = match &app.snapshot {
        Some(snapshot) => (
            format_eval(snapshot),
            snapshot.input_prompt.clone().unwrap_or_default(),
        ),
        None => ("-".to_string(), String::new()),
    };
    Paragraph::new(Text::from(vec![
        Line::from(Span::styled(stats, Style::default().fg(theme.text))),
        Line::from(Span::styled(
            format!("eval: {eval}"),
            Style::default().fg(theme.text),
        )),
        Line::from(Span::styled(
            format!("prompt: {prompt}"),
            Style::default().fg(theme.muted),
        )),
    ]))
    .wrap(Wrap { trim: true })
    .block(panel("Summary", theme))
}

fn render_timeline(frame: &mut ratatui::Frame, app: &App, theme: Theme, area: Rect) {
    let steps = app.steps();
    if steps.is_empty() {
        let paragraph = Paragraph::new(Span::styled(
            "No steps yet.",
            Style::default().fg(theme.muted),
        ))
        .block(panel("Timeline", theme));
        frame.render_widget(paragraph, area);
        return;
    }
    let visible = area.height.saturating_sub(2) as usize;
    let start = app
        .scroll
        .min(steps.len().saturating_sub(visible.max(1)));
    let lines: Vec<Line> = steps
        .iter()
        .skip(start)
        .take(visible)
        .map(|step| {
            let color = if step.error_message.is_some() {
                theme.critical
            } else {
                theme.text
            };
            Line::from(Span::styled(format_step_line(step), Style::default().fg(color)))
        })
        .collect();
    let title = format!("Timeline ({})", steps.len());
    frame.render_widget(Paragraph::new(lines).block(panel(&title, theme)), area);
}
