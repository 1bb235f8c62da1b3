use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::channel::{ControlChannel, ControlMessage, Connector};
use crate::error::{ChannelError, InjectionError, ProcessError};
use crate::process::{self, ProcessHandle};

/// Address width of a target process; selects the module and helper build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86,
    X64,
}

impl Architecture {
    pub fn from_64bit(is_64bit: bool) -> Self {
        if is_64bit {
            Self::X64
        } else {
            Self::X86
        }
    }

    /// File name of the cooperating module, as it shows up in module lists.
    pub fn module_name(self) -> &'static str {
        match self {
            Self::X86 => "shuffler_hook32.dll",
            Self::X64 => "shuffler_hook64.dll",
        }
    }

    pub fn helper_name(self) -> &'static str {
        match self {
            Self::X86 => "shuffler-injector32.exe",
            Self::X64 => "shuffler-injector64.exe",
        }
    }
}

/// What the bootstrap needs to know about the target.
pub trait InjectionTarget: Send + Sync {
    fn pid(&self) -> u32;
    fn is_64bit(&self) -> Result<bool, ProcessError>;
    fn loaded_modules(&self) -> Result<Vec<String>, ProcessError>;
}

impl InjectionTarget for ProcessHandle {
    fn pid(&self) -> u32 {
        ProcessHandle::pid(self)
    }

    fn is_64bit(&self) -> Result<bool, ProcessError> {
        process::is_64bit(self)
    }

    fn loaded_modules(&self) -> Result<Vec<String>, ProcessError> {
        process::loaded_modules(self)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HelperOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs the injection helper to completion.
#[async_trait]
pub trait HelperSpawner: Send + Sync {
    /// Dropping the returned future must terminate the helper.
    async fn run(&self, helper: &Path, pid: u32) -> io::Result<HelperOutput>;
}

/// Spawns the helper as a windowless child with captured output.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSpawner;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[async_trait]
impl HelperSpawner for ProcessSpawner {
    async fn run(&self, helper: &Path, pid: u32) -> io::Result<HelperOutput> {
        let mut command = tokio::process::Command::new(helper);
        command
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        let output = command.output().await?;
        Ok(HelperOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// A bootstrapped target: the connected channel plus the pid it belongs to.
/// Dropping it closes the channel; the target keeps running.
pub struct InjectionHandle<C: Connector> {
    pid: u32,
    channel: ControlChannel<C>,
}

impl<C: Connector> InjectionHandle<C> {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub async fn send(&mut self, message: ControlMessage) -> Result<(), ChannelError> {
        self.channel.send(message).await
    }

    pub fn teardown(self) {
        debug!(pid = self.pid, channel = self.channel.name(), "closing control channel");
    }
}

/// Makes sure the cooperating module is loaded in a target and reachable.
pub struct Bootstrapper<C: Connector, S: HelperSpawner> {
    helper_dir: PathBuf,
    connector: Arc<C>,
    spawner: S,
    connect_timeout: Duration,
}

impl<C: Connector, S: HelperSpawner> Bootstrapper<C, S> {
    pub fn new(helper_dir: PathBuf, connector: Arc<C>, spawner: S, connect_timeout: Duration) -> Self {
        Self {
            helper_dir,
            connector,
            spawner,
            connect_timeout,
        }
    }

    /// Reuses an already-loaded module, otherwise runs the helper matching the
    /// target's architecture; then connects and sends `Enable`.  No retries.
    pub async fn ensure_injected(
        &self,
        target: &dyn InjectionTarget,
        cancel: &CancellationToken,
    ) -> Result<InjectionHandle<C>, InjectionError> {
        let pid = target.pid();
        let arch = Architecture::from_64bit(target.is_64bit()?);

        let loaded = match target.loaded_modules() {
            Ok(modules) => modules
                .iter()
                .any(|m| m.eq_ignore_ascii_case(arch.module_name())),
            Err(e) => {
                debug!(pid, "module list unavailable, assuming not loaded: {e}");
                false
            }
        };

        if loaded {
            info!(pid, module = arch.module_name(), "module already loaded, reusing");
        } else {
            self.inject(pid, arch, cancel).await?;
        }

        let mut channel = tokio::select! {
            _ = cancel.cancelled() => return Err(InjectionError::Cancelled),
            channel = ControlChannel::connect(Arc::clone(&self.connector), pid, self.connect_timeout) => channel?,
        };
        channel.send(ControlMessage::Enable).await?;

        info!(pid, "target hooked");
        Ok(InjectionHandle { pid, channel })
    }

    async fn inject(
        &self,
        pid: u32,
        arch: Architecture,
        cancel: &CancellationToken,
    ) -> Result<(), InjectionError> {
        let helper = self.helper_dir.join(arch.helper_name());
        if !helper.is_file() {
            return Err(InjectionError::HelperNotFound(helper));
        }

        info!(pid, helper = %helper.display(), "injecting module");
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(InjectionError::Cancelled),
            output = self.spawner.run(&helper, pid) => output.map_err(InjectionError::HelperSpawn)?,
        };

        for line in output.stdout.lines() {
            debug!(pid, "injector: {line}");
        }
        if output.exit_code != Some(0) {
            return Err(InjectionError::HelperFailed {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::testing::{FakeSpawner, FakeTarget};
    use super::*;
    use crate::channel::testing::FakeConnector;
    use crate::channel::DEFAULT_CONNECT_TIMEOUT;

    fn helper_dir() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("shuffler-injector64.exe"), b"").unwrap();
        fs::write(dir.path().join("shuffler-injector32.exe"), b"").unwrap();
        dir
    }

    fn target(is_64bit: bool, modules: Option<&[&str]>) -> FakeTarget {
        FakeTarget {
            pid: 4242,
            is_64bit,
            modules: modules.map(|m| m.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn bootstrapper(
        dir: &Path,
        spawner: FakeSpawner,
    ) -> (Bootstrapper<FakeConnector, FakeSpawner>, Arc<FakeConnector>) {
        let connector = FakeConnector::listening();
        (
            Bootstrapper::new(dir.to_path_buf(), Arc::clone(&connector), spawner, DEFAULT_CONNECT_TIMEOUT),
            connector,
        )
    }

    #[test]
    fn names_follow_architecture() {
        assert_eq!(Architecture::from_64bit(true).module_name(), "shuffler_hook64.dll");
        assert_eq!(Architecture::from_64bit(false).module_name(), "shuffler_hook32.dll");
        assert_eq!(Architecture::X64.helper_name(), "shuffler-injector64.exe");
        assert_eq!(Architecture::X86.helper_name(), "shuffler-injector32.exe");
    }

    #[tokio::test]
    async fn loaded_module_is_reused_without_spawning() {
        let dir = helper_dir();
        let (boot, connector) = bootstrapper(dir.path(), FakeSpawner::succeeding());
        let game = target(true, Some(&["game.exe", "KERNEL32.DLL", "Shuffler_Hook64.DLL"]));

        let handle = boot
            .ensure_injected(&game, &CancellationToken::new())
            .await
            .unwrap();

        assert!(boot.spawner.runs.lock().unwrap().is_empty());
        assert_eq!(handle.pid(), 4242);
        assert!(handle.is_connected());
        assert_eq!(connector.wire.messages(), vec![ControlMessage::Enable]);
        assert_eq!(*connector.names.lock().unwrap(), vec!["ShufflerHook-4242".to_string()]);
    }

    #[tokio::test]
    async fn other_architecture_module_does_not_count_as_loaded() {
        let dir = helper_dir();
        let (boot, _connector) = bootstrapper(dir.path(), FakeSpawner::succeeding());
        let game = target(true, Some(&["shuffler_hook32.dll"]));

        boot.ensure_injected(&game, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(boot.spawner.runs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn helper_matches_target_architecture() {
        let dir = helper_dir();
        let (boot, connector) = bootstrapper(dir.path(), FakeSpawner::succeeding());

        boot.ensure_injected(&target(false, Some(&[])), &CancellationToken::new())
            .await
            .unwrap();

        let runs = boot.spawner.runs.lock().unwrap();
        assert_eq!(
            *runs,
            vec![(dir.path().join("shuffler-injector32.exe"), 4242)]
        );
        assert_eq!(connector.wire.messages(), vec![ControlMessage::Enable]);
    }

    #[tokio::test]
    async fn unreadable_module_list_means_inject() {
        let dir = helper_dir();
        let (boot, _connector) = bootstrapper(dir.path(), FakeSpawner::succeeding());

        boot.ensure_injected(&target(true, None), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            *boot.spawner.runs.lock().unwrap(),
            vec![(dir.path().join("shuffler-injector64.exe"), 4242)]
        );
    }

    #[tokio::test]
    async fn missing_helper_fails_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let (boot, connector) = bootstrapper(dir.path(), FakeSpawner::succeeding());

        let result = boot
            .ensure_injected(&target(true, Some(&[])), &CancellationToken::new())
            .await;

        match result {
            Err(InjectionError::HelperNotFound(path)) => {
                assert_eq!(path, dir.path().join("shuffler-injector64.exe"))
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected HelperNotFound"),
        }
        assert!(boot.spawner.runs.lock().unwrap().is_empty());
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn helper_failure_carries_exit_code_and_stderr() {
        let dir = helper_dir();
        let spawner = FakeSpawner {
            output: HelperOutput {
                exit_code: Some(3),
                stderr: "failed to open process 4242 (code 0x5)\r\n".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let (boot, connector) = bootstrapper(dir.path(), spawner);

        let result = boot
            .ensure_injected(&target(true, Some(&[])), &CancellationToken::new())
            .await;

        match result {
            Err(InjectionError::HelperFailed { exit_code, stderr }) => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr, "failed to open process 4242 (code 0x5)");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected HelperFailed"),
        }
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_abandons_a_running_helper() {
        let dir = helper_dir();
        let spawner = FakeSpawner {
            hang: true,
            ..Default::default()
        };
        let (boot, _connector) = bootstrapper(dir.path(), spawner);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = boot.ensure_injected(&target(true, Some(&[])), &cancel).await;

        assert!(matches!(result, Err(InjectionError::Cancelled)));
    }

    #[tokio::test]
    async fn connect_failure_is_a_channel_error() {
        let dir = helper_dir();
        let (boot, connector) = bootstrapper(dir.path(), FakeSpawner::succeeding());
        connector
            .refuse_hard
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let result = boot
            .ensure_injected(&target(true, Some(&["shuffler_hook64.dll"])), &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(InjectionError::Channel(ChannelError::ConnectFailed { .. }))
        ));
    }
}
