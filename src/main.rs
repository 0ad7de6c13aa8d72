//! # conclave
//!
//! Headless front end: reads commands and messages from stdin, drives the
//! session engine at a fixed tick and prints agent output to stdout.

#![deny(unsafe_code)]

mod repl;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;

use conclave_core::{Role, SessionId, SessionMode};
use conclave_runtime::{AppState, CommandReply, RuntimeConfig, Snapshot};
use conclave_settings::ConclaveSettings;
use conclave_store::Database;
use conclave_telemetry::TelemetryConfig;

use crate::repl::Input;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Run several coding agents side by side, each in its own git worktree.
#[derive(Parser, Debug)]
#[command(name = "conclave", version, about)]
struct Cli {
    /// Settings file (defaults to `~/.conclave/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Path to the `SQLite` database.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Agent executable to launch for each session.
    #[arg(long)]
    agent: Option<String>,

    /// Maximum concurrently running sessions.
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Mode for sessions created without one (`plan` or `agent`).
    #[arg(long)]
    mode: Option<SessionMode>,

    /// Parent directory for session worktrees.
    #[arg(long)]
    worktrees_root: Option<PathBuf>,

    /// Log level (`RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Register this repository and select it on startup.
    #[arg(long)]
    project: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, settings: &mut ConclaveSettings) {
        if let Some(path) = &self.db_path {
            settings.storage.database_path = path.clone();
        }
        if let Some(agent) = &self.agent {
            settings.agent.binary = agent.clone();
        }
        if let Some(max) = self.max_sessions {
            settings.runtime.max_sessions = max;
        }
        if let Some(mode) = self.mode {
            settings.agent.default_mode = mode;
        }
        if let Some(root) = &self.worktrees_root {
            settings.storage.worktrees_root = Some(root.clone());
        }
        if let Some(level) = &self.log_level {
            settings.logging.level = level.clone();
        }
        if let Some(file) = &self.log_file {
            settings.logging.file = Some(file.clone());
        }
        if self.log_json {
            settings.logging.json = true;
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn telemetry_config(settings: &ConclaveSettings) -> TelemetryConfig {
    TelemetryConfig {
        log_level: conclave_telemetry::parse_level(&settings.logging.level)
            .unwrap_or(tracing::Level::INFO),
        json: settings.logging.json,
        log_file: settings.logging.file.clone(),
        ..TelemetryConfig::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(conclave_settings::settings_path);
    let mut settings = conclave_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    cli.apply(&mut settings);
    conclave_settings::validate(&settings).context("Invalid command-line settings")?;

    conclave_telemetry::init_telemetry(telemetry_config(&settings))
        .context("Failed to initialize logging")?;

    let db_path = settings.storage.database_path.clone();
    ensure_parent_dir(&db_path)?;
    let db = Database::open(&db_path).context("Failed to open database")?;
    tracing::info!(path = %db_path.display(), "database opened");

    let tick = Duration::from_millis(settings.runtime.tick_ms);
    let mut app = AppState::new(db, RuntimeConfig::from_settings(&settings))
        .context("Failed to initialize session engine")?;

    if let Some(project) = &cli.project {
        let name = project
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        app.ensure_project(&name, project)
            .with_context(|| format!("Failed to register {}", project.display()))?;
    }

    println!("conclave ready, /help for commands");
    let result = run(&mut app, tick).await;

    tracing::info!("shutting down");
    app.shutdown(SHUTDOWN_GRACE).await;
    result
}

/// The tick loop: poll the engine, then wait for the next tick, a line of
/// input or Ctrl-C, whichever comes first.
async fn run(app: &mut AppState, tick: Duration) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut view = View::default();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = app.poll();
                if !report.is_idle() {
                    view.refresh(&app.snapshot());
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    return Ok(());
                };
                let snapshot = app.snapshot();
                match repl::parse(&line, &snapshot) {
                    Ok(Input::Quit) => return Ok(()),
                    Ok(input) => handle(app, &mut view, input).await,
                    Err(e) => eprintln!("{e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn handle(app: &mut AppState, view: &mut View, input: Input) {
    match input {
        Input::Command(command) => {
            let outcome = app.dispatch(command).await;
            match outcome.result {
                Ok(CommandReply::Project(p)) => println!("project {} ({})", p.name, p.path),
                Ok(CommandReply::Session(s)) => {
                    println!("session {} [{}] {}", s.name, s.mode, s.id.short());
                }
                Ok(CommandReply::Done) => {}
                Err(e) => eprintln!("error: {e}"),
            }
            view.refresh(&outcome.snapshot);
        }
        Input::Projects => print_projects(&app.snapshot()),
        Input::Sessions => print_sessions(&app.snapshot()),
        Input::Output(id) => match app.pool().output(&id) {
            Some(text) => println!("{text}"),
            None => eprintln!("no output retained for {}", id.short()),
        },
        Input::Help => println!("{}", repl::HELP),
        Input::Quit | Input::Empty => {}
    }
}

/// Tracks what has already been printed so each refresh only shows news.
#[derive(Default)]
struct View {
    session: Option<SessionId>,
    printed: usize,
    status: Option<String>,
}

impl View {
    fn refresh(&mut self, snapshot: &Snapshot) {
        if self.session != snapshot.active_session {
            self.session = snapshot.active_session.clone();
            self.printed = 0;
            if let Some(s) = snapshot
                .sessions
                .iter()
                .find(|s| Some(&s.id) == self.session.as_ref())
            {
                println!("── {} [{}] ──", s.name, s.mode);
            }
        }

        for message in snapshot.transcript.iter().skip(self.printed) {
            match message.role {
                Role::Assistant => print!("{}", message.content),
                Role::User => println!("> {}", message.content),
                Role::System => println!("# {}", message.content),
            }
        }
        self.printed = snapshot.transcript.len();

        if snapshot.status != self.status {
            if let Some(status) = &snapshot.status {
                eprintln!("[{status}]");
            }
            self.status = snapshot.status.clone();
        }
    }
}

fn print_projects(snapshot: &Snapshot) {
    if snapshot.projects.is_empty() {
        println!("no projects, add one with /project add <path>");
    }
    for p in &snapshot.projects {
        let marker = if Some(&p.id) == snapshot.active_project.as_ref() { "*" } else { " " };
        println!("{marker} {:<20} {:<8} {}", p.name, p.id.short(), p.path);
    }
}

fn print_sessions(snapshot: &Snapshot) {
    if snapshot.sessions.is_empty() {
        println!("no sessions, create one with /new <name>");
    }
    for s in &snapshot.sessions {
        let marker = if Some(&s.id) == snapshot.active_session.as_ref() { "*" } else { " " };
        let state = if snapshot.running.contains(&s.id) { "running" } else { "idle" };
        println!("{marker} {:<24} {:<8} {:<6} {state}", s.name, s.id.short(), s.mode.as_str());
    }
}
