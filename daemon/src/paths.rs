/// Canonical file paths for Shuffler data files.
///
/// Both files live under %APPDATA%\Shuffler\:
///   - config.toml  Game list and timeouts, read by the daemon.
///   - status.toml  Per-game state, written by the daemon.
use std::path::PathBuf;

use anyhow::{Context, Result};

const APP_DIR_NAME: &str = "Shuffler";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";

/// Returns the Shuffler application data directory: %APPDATA%\Shuffler\
pub fn app_data_dir() -> Result<PathBuf> {
    let appdata = std::env::var_os("APPDATA").context("APPDATA environment variable not set")?;
    Ok(PathBuf::from(appdata).join(APP_DIR_NAME))
}

/// Returns the full path to the config file: %APPDATA%\Shuffler\config.toml
pub fn config_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(CONFIG_FILE_NAME))
}

/// Returns the full path to the status file: %APPDATA%\Shuffler\status.toml
pub fn status_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(STATUS_FILE_NAME))
}

/// Directory holding the injection helpers, next to the daemon binary.
pub fn executable_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("failed to locate the daemon executable")?;
    exe.parent()
        .map(PathBuf::from)
        .context("daemon executable has no parent directory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(windows)]
    #[test]
    fn app_data_dir_ends_with_shuffler() {
        let dir = app_data_dir().unwrap();
        assert_eq!(dir.file_name().unwrap(), "Shuffler");
    }

    #[cfg(windows)]
    #[test]
    fn app_data_dir_is_inside_appdata() {
        let appdata = std::env::var("APPDATA").unwrap();
        let dir = app_data_dir().unwrap();
        assert!(dir.starts_with(&appdata));
    }

    #[cfg(windows)]
    #[test]
    fn config_and_status_share_same_parent_dir() {
        let config = config_file_path().unwrap();
        let status = status_file_path().unwrap();
        assert_eq!(config.file_name().unwrap(), CONFIG_FILE_NAME);
        assert_eq!(status.file_name().unwrap(), STATUS_FILE_NAME);
        assert_eq!(config.parent(), status.parent());
    }

    #[test]
    fn executable_dir_contains_test_binary() {
        let dir = executable_dir().unwrap();
        let exe = std::env::current_exe().unwrap();
        assert!(exe.starts_with(&dir));
    }
}
