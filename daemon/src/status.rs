use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::error;

use crate::config::GameDescriptor;
use crate::game::LifecycleState;

/// Last known state of one configured game.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct GameStatus {
    pub id: String,
    pub display_name: String,
    pub state: LifecycleState,
    pub muted: bool,
    /// Error from the most recent failed command, cleared by the next success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Runtime status written by the daemon to %APPDATA%\Shuffler\status.toml.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    /// RFC 3339 timestamp of the last change.
    pub updated_at: String,
    pub games: Vec<GameStatus>,
}

impl DaemonStatus {
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            updated_at: chrono::Local::now().to_rfc3339(),
            games: Vec::new(),
        }
    }

    /// Adds an entry for `game`, or refreshes its display name if present.
    pub fn track(&mut self, game: &GameDescriptor) {
        match self.game_mut(&game.id) {
            Some(entry) => entry.display_name = game.display_name.clone(),
            None => self.games.push(GameStatus {
                id: game.id.clone(),
                display_name: game.display_name.clone(),
                state: LifecycleState::Stopped,
                muted: false,
                last_error: None,
            }),
        }
        self.touch();
    }

    pub fn forget(&mut self, id: &str) {
        self.games.retain(|game| game.id != id);
        self.touch();
    }

    pub fn set_state(&mut self, id: &str, state: LifecycleState) {
        self.update(id, |game| game.state = state);
    }

    pub fn set_muted(&mut self, id: &str, muted: bool) {
        self.update(id, |game| game.muted = muted);
    }

    pub fn set_error(&mut self, id: &str, error: Option<String>) {
        self.update(id, |game| game.last_error = error);
    }

    #[cfg(test)]
    pub fn game(&self, id: &str) -> Option<&GameStatus> {
        self.games.iter().find(|game| game.id == id)
    }

    fn game_mut(&mut self, id: &str) -> Option<&mut GameStatus> {
        self.games.iter_mut().find(|game| game.id == id)
    }

    fn update(&mut self, id: &str, apply: impl FnOnce(&mut GameStatus)) {
        if let Some(game) = self.game_mut(id) {
            apply(game);
            self.touch();
        }
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Local::now().to_rfc3339();
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Failures are logged; a status write never takes the daemon down.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            error!(target: "status", dir = %parent.display(), "failed to create directory: {e}");
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                error!(target: "status", "failed to write status file: {e}");
            }
        }
        Err(e) => error!(target: "status", "failed to serialize status: {e}"),
    }
}
