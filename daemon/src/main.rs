mod audio;
mod channel;
mod command;
mod config;
mod error;
mod event;
mod game;
mod host;
mod injection;
mod observable;
mod paths;
mod process;
mod process_monitor;
mod status;
mod window;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::channel::PipeConnector;
use crate::command::Command;
use crate::config::{Config, GameDescriptor};
use crate::error::{LifecycleError, MonitorError};
use crate::event::DaemonEvent;
use crate::game::{GameProcess, LifecycleState, Timeouts};
use crate::host::SystemHost;
use crate::injection::{Bootstrapper, ProcessSpawner};
use crate::observable::ObserverGuard;
use crate::process_monitor::ProcessMonitor;
use crate::status::DaemonStatus;

#[derive(Parser)]
#[command(name = "shuffler-daemon", version, about = "Launches, suspends and hooks the games of a shuffle session")]
struct Cli {
    /// Config file; defaults to %APPDATA%\Shuffler\config.toml.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Status file; defaults to %APPDATA%\Shuffler\status.toml.
    #[arg(long)]
    status: Option<PathBuf>,
}

/// A managed game plus the observers forwarding its changes to the event loop.
struct Game {
    process: Arc<GameProcess<SystemHost>>,
    _state: ObserverGuard<LifecycleState>,
    _muted: ObserverGuard<bool>,
}

/// What every game is built from; fixed for the daemon's lifetime.
struct Daemon {
    host: Arc<SystemHost>,
    monitor: ProcessMonitor,
    timeouts: Timeouts,
    cancel: CancellationToken,
    events: mpsc::Sender<DaemonEvent>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => paths::config_file_path()?,
    };
    let status_path = match cli.status {
        Some(path) => path,
        None => paths::status_file_path()?,
    };
    if let Some(dir) = status_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create app data directory {}", dir.display()))?;
    }

    // ── Configuration ─────────────────────────────────────────────────────────
    let initial_config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        error!(target: "config", "{e:#}; using defaults");
        Config::default()
    });
    let orchestrator = &initial_config.orchestrator;
    let helper_dir = orchestrator.effective_helper_dir(&paths::executable_dir()?);
    info!(helper_dir = %helper_dir.display(), "injection helpers");

    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(256);
    let daemon = Daemon {
        host: Arc::new(SystemHost::new(Bootstrapper::new(
            helper_dir,
            Arc::new(PipeConnector),
            ProcessSpawner,
            orchestrator.channel_connect_timeout(),
        ))),
        monitor: ProcessMonitor::start(orchestrator.monitor_poll_interval())
            .context("Failed to start the process monitor")?,
        timeouts: Timeouts {
            launch: orchestrator.launch_timeout(),
            stop: orchestrator.stop_timeout(),
        },
        cancel: CancellationToken::new(),
        events: event_tx.clone(),
    };

    // ── Games ─────────────────────────────────────────────────────────────────
    let mut status = DaemonStatus::new();
    let mut games: HashMap<String, Game> = HashMap::new();
    for descriptor in initial_config.games {
        add_game(&daemon, &mut games, &mut status, descriptor);
    }
    status::write_status(&status_path, &status);

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(config::watch_config(config_path, event_tx.clone()));
    tokio::spawn(read_commands(event_tx.clone()));
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(DaemonEvent::Shutdown).await;
            }
        });
    }
    drop(event_tx);

    info!("shuffler-daemon v{} started", env!("CARGO_PKG_VERSION"));

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(evt) = event_rx.recv().await {
        match evt {
            DaemonEvent::Command(Command::Quit) | DaemonEvent::Shutdown => break,

            DaemonEvent::Command(Command::Status) => {
                for entry in &status.games {
                    let pid = match games.get(&entry.id) {
                        Some(game) => game.process.pid().await,
                        None => None,
                    };
                    info!(
                        target: "status",
                        game = %entry.id,
                        pid = ?pid,
                        state = ?entry.state,
                        muted = entry.muted,
                        error = entry.last_error.as_deref().unwrap_or(""),
                        "game status"
                    );
                }
            }

            DaemonEvent::Command(command) => {
                let Some(id) = command.game() else { continue };
                match games.get(id) {
                    Some(game) => {
                        let process = Arc::clone(&game.process);
                        let tx = daemon.events.clone();
                        let id = id.to_string();
                        tokio::spawn(async move {
                            let result = run_command(&process, &command).await;
                            match &result {
                                Ok(()) => info!(game = %id, "{command}: done"),
                                Err(e) => warn!(game = %id, "{command}: {e}"),
                            }
                            let error = result.err().map(|e| format!("{command}: {e}"));
                            let _ = tx.send(DaemonEvent::CommandFinished { id, error }).await;
                        });
                    }
                    None => warn!(target: "command", "unknown game '{id}'"),
                }
            }

            DaemonEvent::StateChanged { id, state } => {
                info!(game = %id, ?state, "state changed");
                sync_status(&mut status, &games);
                status::write_status(&status_path, &status);
            }

            DaemonEvent::MuteChanged { id, muted } => {
                info!(game = %id, muted, "mute changed");
                sync_status(&mut status, &games);
                status::write_status(&status_path, &status);
            }

            DaemonEvent::CommandFinished { id, error } => {
                status.set_error(&id, error);
                status::write_status(&status_path, &status);
            }

            DaemonEvent::ConfigReloaded(new_config) => {
                info!(target: "config", "config reloaded");
                apply_games(&daemon, &mut games, &mut status, new_config.games).await;
                status::write_status(&status_path, &status);
            }
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────
    info!("shutting down");
    daemon.cancel.cancel();
    for (_, game) in games.drain() {
        game.process.shutdown().await;
    }
    daemon.monitor.dispose();
    status::write_status(&status_path, &status);
    Ok(())
}

/// Creates the state machine for `descriptor` and attaches to an instance
/// that is already running.
fn add_game(
    daemon: &Daemon,
    games: &mut HashMap<String, Game>,
    status: &mut DaemonStatus,
    descriptor: GameDescriptor,
) {
    let id = descriptor.id.clone();
    let executable = descriptor.executable_path.clone();
    status.track(&descriptor);
    let game = match new_game(daemon, descriptor) {
        Ok(game) => game,
        Err(e) => {
            error!(game = %id, "failed to register with the process monitor: {e}");
            status.set_error(&id, Some(e.to_string()));
            return;
        }
    };

    if let Some(pid) = process::find_running(&executable) {
        info!(game = %id, pid, "attaching to running instance");
        let process = Arc::clone(&game.process);
        let tx = daemon.events.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let error = process
                .attach_existing(pid)
                .await
                .err()
                .map(|e| format!("attach: {e}"));
            if let Some(e) = &error {
                warn!(game = %id, "{e}");
            }
            let _ = tx.send(DaemonEvent::CommandFinished { id, error }).await;
        });
    }
    games.insert(id, game);
}

fn new_game(daemon: &Daemon, descriptor: GameDescriptor) -> Result<Game, MonitorError> {
    let id = descriptor.id.clone();
    let process = Arc::new(GameProcess::new(
        descriptor,
        Arc::clone(&daemon.host),
        &daemon.monitor,
        daemon.timeouts,
        &daemon.cancel,
    )?);

    // Observers fire synchronously inside lifecycle operations; never block here.
    // A dropped notification is recovered by the next `sync_status`.
    let tx = daemon.events.clone();
    let state_id = id.clone();
    let _state = process.subscribe_state(move |state| {
        let _ = tx.try_send(DaemonEvent::StateChanged {
            id: state_id.clone(),
            state: *state,
        });
    });
    let tx = daemon.events.clone();
    let _muted = process.subscribe_muted(move |muted| {
        let _ = tx.try_send(DaemonEvent::MuteChanged {
            id: id.clone(),
            muted: *muted,
        });
    });

    Ok(Game {
        process,
        _state,
        _muted,
    })
}

/// Reconciles the running games with a reloaded game list.  Orchestrator
/// settings take effect on restart.
async fn apply_games(
    daemon: &Daemon,
    games: &mut HashMap<String, Game>,
    status: &mut DaemonStatus,
    descriptors: Vec<GameDescriptor>,
) {
    let removed: Vec<String> = games
        .keys()
        .filter(|id| !descriptors.iter().any(|d| &d.id == *id))
        .cloned()
        .collect();
    for id in removed {
        if let Some(game) = games.remove(&id) {
            info!(game = %id, "removed from config");
            game.process.shutdown().await;
            status.forget(&id);
        }
    }

    for descriptor in descriptors {
        match games.get(&descriptor.id) {
            None => add_game(daemon, games, status, descriptor),
            Some(game) if game.process.descriptor() == &descriptor => {}
            Some(game) if game.process.state() != LifecycleState::Stopped => {
                warn!(game = %descriptor.id, "config changed while the game is active; keeping the old entry");
            }
            Some(_) => {
                if let Some(old) = games.remove(&descriptor.id) {
                    old.process.shutdown().await;
                }
                info!(game = %descriptor.id, "config updated");
                add_game(daemon, games, status, descriptor);
            }
        }
    }
}

async fn run_command(process: &GameProcess<SystemHost>, command: &Command) -> Result<(), LifecycleError> {
    match command {
        Command::Start(_) => process.start().await,
        Command::Stop(_) => process.stop().await,
        Command::Suspend(_) => process.suspend().await,
        Command::Resume(_) => process.resume().await,
        Command::Hide(_) => process.hide().await,
        Command::Show(_) => process.show().await,
        Command::Mute(_) => process.mute().await,
        Command::Unmute(_) => process.unmute().await,
        Command::ToggleMute(_) => process.toggle_mute().await,
        Command::Controller { controller, .. } => process.set_active_controller(*controller).await,
        Command::Status | Command::Quit => Ok(()),
    }
}

/// Copies each game's current state and mute flag into `status`.
fn sync_status(status: &mut DaemonStatus, games: &HashMap<String, Game>) {
    for (id, game) in games {
        status.set_state(id, game.process.state());
        status.set_muted(id, game.process.muted());
    }
}

/// Reads scheduler commands from stdin until EOF.
async fn read_commands(tx: mpsc::Sender<DaemonEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match Command::parse(&line) {
                Ok(command) => {
                    if tx.send(DaemonEvent::Command(command)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(target: "command", "{e}"),
            },
            Ok(None) => {
                info!(target: "command", "stdin closed; commands disabled");
                break;
            }
            Err(e) => {
                error!(target: "command", "failed to read stdin: {e}");
                break;
            }
        }
    }
}
