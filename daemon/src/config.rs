use anyhow::{bail, Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::event::DaemonEvent;

pub const DEFAULT_LAUNCH_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_CHANNEL_CONNECT_TIMEOUT_MS: u64 = crate::channel::DEFAULT_CONNECT_TIMEOUT.as_millis() as u64;
pub const DEFAULT_MONITOR_POLL_INTERVAL_MS: u64 = 250;
/// Polling faster than this costs a full process-table refresh per tick.
pub const MIN_MONITOR_POLL_INTERVAL_MS: u64 = 50;

/// Root configuration structure. Deserialized from %APPDATA%\Shuffler\config.toml.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub games: Vec<GameDescriptor>,
}

/// Timeouts and locations shared by every game.
#[derive(Debug, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_secs: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_channel_connect_timeout")]
    pub channel_connect_timeout_ms: u64,
    #[serde(default = "default_monitor_poll_interval")]
    pub monitor_poll_interval_ms: u64,
    /// Directory holding the injection helpers and hook modules.  Defaults to
    /// the daemon executable's directory.
    pub helper_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            launch_timeout_secs: DEFAULT_LAUNCH_TIMEOUT_SECS,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            channel_connect_timeout_ms: DEFAULT_CHANNEL_CONNECT_TIMEOUT_MS,
            monitor_poll_interval_ms: DEFAULT_MONITOR_POLL_INTERVAL_MS,
            helper_dir: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn channel_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_connect_timeout_ms)
    }

    /// Clamped to [`MIN_MONITOR_POLL_INTERVAL_MS`].
    pub fn monitor_poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_interval_ms.max(MIN_MONITOR_POLL_INTERVAL_MS))
    }

    /// Returns the configured helper directory, or `fallback` when unset.
    pub fn effective_helper_dir(&self, fallback: &Path) -> PathBuf {
        self.helper_dir
            .clone()
            .unwrap_or_else(|| fallback.to_path_buf())
    }
}

/// Identity of one controllable game.  Never mutated after load.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct GameDescriptor {
    /// Stable key used by scheduler commands and the status file.
    pub id: String,
    pub display_name: String,
    /// Full path (or bare file name resolved through PATH) of the game executable.
    /// Its base name is also what the process monitor watches for.
    pub executable_path: String,
    /// Steam app id.  When set, `start` goes through `steam://rungameid/<id>`.
    #[serde(default)]
    pub launcher_id: Option<u32>,
    /// Whether the scheduler should suspend rather than merely hide this game
    /// when it rotates away from it.
    #[serde(default)]
    pub suspend_on_switch: bool,
}

impl GameDescriptor {
    pub fn launch_uri(&self) -> Option<String> {
        self.launcher_id.map(|id| format!("steam://rungameid/{id}"))
    }
}

impl Config {
    /// Rejects entries the orchestrator cannot act on.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for game in &self.games {
            if game.id.trim().is_empty() {
                bail!("game \"{}\" has an empty id", game.display_name);
            }
            if game.executable_path.trim().is_empty() {
                bail!("game \"{}\" has no executable_path", game.id);
            }
            if !seen.insert(game.id.as_str()) {
                bail!("duplicate game id \"{}\"", game.id);
            }
        }
        Ok(())
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read, parsed or validated.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the config
/// file is created or modified, reloads it and sends a `ConfigReloaded` event.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<DaemonEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            error!("Failed to create config file watcher: {e}");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let watch_dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            error!("Config path has no parent directory");
            return;
        }
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        error!("Failed to watch config directory: {e}");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    if tx.send(DaemonEvent::ConfigReloaded(config)).await.is_err() {
                        break;
                    }
                }
                // Keep running with the previous configuration.
                Err(e) => warn!("Failed to reload config: {e:#}"),
            }
        }
    }
}

fn default_launch_timeout() -> u64 {
    DEFAULT_LAUNCH_TIMEOUT_SECS
}

fn default_stop_timeout() -> u64 {
    DEFAULT_STOP_TIMEOUT_SECS
}

fn default_channel_connect_timeout() -> u64 {
    DEFAULT_CHANNEL_CONNECT_TIMEOUT_MS
}

fn default_monitor_poll_interval() -> u64 {
    DEFAULT_MONITOR_POLL_INTERVAL_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_game(id: &str, path: &str) -> GameDescriptor {
        GameDescriptor {
            id: id.to_string(),
            display_name: "Test Game".to_string(),
            executable_path: path.to_string(),
            launcher_id: None,
            suspend_on_switch: false,
        }
    }

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    // ── defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn orchestrator_default_values() {
        let o = OrchestratorConfig::default();
        assert_eq!(o.launch_timeout(), Duration::from_secs(15));
        assert_eq!(o.stop_timeout(), Duration::from_secs(15));
        assert_eq!(o.channel_connect_timeout(), Duration::from_millis(5000));
        assert_eq!(o.monitor_poll_interval(), Duration::from_millis(250));
        assert!(o.helper_dir.is_none());
    }

    #[test]
    fn config_default_has_no_games() {
        let c = Config::default();
        assert!(c.games.is_empty());
    }

    #[test]
    fn poll_interval_is_clamped_to_minimum() {
        let o = OrchestratorConfig {
            monitor_poll_interval_ms: 1,
            ..Default::default()
        };
        assert_eq!(
            o.monitor_poll_interval(),
            Duration::from_millis(MIN_MONITOR_POLL_INTERVAL_MS)
        );
    }

    #[test]
    fn helper_dir_falls_back_when_unset() {
        let fallback = Path::new(r"C:\Program Files\Shuffler");
        let mut o = OrchestratorConfig::default();
        assert_eq!(o.effective_helper_dir(fallback), fallback);
        o.helper_dir = Some(PathBuf::from(r"D:\tools"));
        assert_eq!(o.effective_helper_dir(fallback), PathBuf::from(r"D:\tools"));
    }

    // ── GameDescriptor ────────────────────────────────────────────────────────

    #[test]
    fn launch_uri_only_with_launcher_id() {
        let mut game = make_game("hades", r"C:\Games\Hades.exe");
        assert_eq!(game.launch_uri(), None);
        game.launcher_id = Some(1145360);
        assert_eq!(game.launch_uri().as_deref(), Some("steam://rungameid/1145360"));
    }

    // ── validate ──────────────────────────────────────────────────────────────

    #[test]
    fn validate_rejects_duplicate_ids() {
        let config = Config {
            orchestrator: OrchestratorConfig::default(),
            games: vec![make_game("a", "a.exe"), make_game("a", "b.exe")],
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate game id"));
    }

    #[test]
    fn validate_rejects_blank_fields() {
        let blank_id = Config {
            orchestrator: OrchestratorConfig::default(),
            games: vec![make_game(" ", "a.exe")],
        };
        assert!(blank_id.validate().is_err());

        let blank_path = Config {
            orchestrator: OrchestratorConfig::default(),
            games: vec![make_game("a", "")],
        };
        assert!(blank_path.validate().is_err());
    }

    // ── load_or_default ───────────────────────────────────────────────────────

    #[test]
    fn load_or_default_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.toml");
        let config = load_or_default(&path).unwrap();
        assert_eq!(config.orchestrator.launch_timeout_secs, DEFAULT_LAUNCH_TIMEOUT_SECS);
        assert!(config.games.is_empty());
    }

    #[test]
    fn load_or_default_parses_valid_toml() {
        let (_dir, path) = write_config(
            r#"
[orchestrator]
launch_timeout_secs = 30
helper_dir = "C:\\Tools\\Shuffler"

[[games]]
id = "hades"
display_name = "Hades"
executable_path = "C:\\Games\\Hades\\x64\\Hades.exe"
launcher_id = 1145360
suspend_on_switch = true

[[games]]
id = "notepad"
display_name = "Notepad"
executable_path = "notepad.exe"
"#,
        );

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.orchestrator.launch_timeout_secs, 30);
        assert_eq!(config.orchestrator.stop_timeout_secs, DEFAULT_STOP_TIMEOUT_SECS);
        assert_eq!(
            config.orchestrator.helper_dir.as_deref(),
            Some(Path::new("C:\\Tools\\Shuffler"))
        );
        assert_eq!(config.games.len(), 2);
        assert_eq!(config.games[0].id, "hades");
        assert_eq!(config.games[0].launcher_id, Some(1145360));
        assert!(config.games[0].suspend_on_switch);
        assert_eq!(config.games[1].executable_path, "notepad.exe");
        assert!(config.games[1].launcher_id.is_none());
        assert!(!config.games[1].suspend_on_switch);
    }

    #[test]
    fn load_or_default_partial_toml_uses_field_defaults() {
        // Only override one field; the rest should get their defaults.
        let (_dir, path) = write_config("[orchestrator]\nstop_timeout_secs = 60\n");

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.orchestrator.stop_timeout_secs, 60);
        assert_eq!(config.orchestrator.launch_timeout_secs, DEFAULT_LAUNCH_TIMEOUT_SECS);
        assert_eq!(
            config.orchestrator.monitor_poll_interval_ms,
            DEFAULT_MONITOR_POLL_INTERVAL_MS
        );
    }

    #[test]
    fn load_or_default_invalid_toml_returns_error() {
        let (_dir, path) = write_config("this is not valid toml ][[[");
        assert!(load_or_default(&path).is_err());
    }

    #[test]
    fn load_or_default_game_missing_required_field_returns_error() {
        let (_dir, path) = write_config("[[games]]\nid = \"x\"\ndisplay_name = \"X\"\n");
        assert!(load_or_default(&path).is_err());
    }

    #[test]
    fn load_or_default_duplicate_ids_returns_error() {
        let (_dir, path) = write_config(
            r#"
[[games]]
id = "celeste"
display_name = "Celeste"
executable_path = "Celeste.exe"

[[games]]
id = "celeste"
display_name = "Celeste again"
executable_path = "Celeste.exe"
"#,
        );
        let err = load_or_default(&path).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate game id"));
    }
}
