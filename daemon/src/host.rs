use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{self, AudioSessions, DefaultRenderSessions};
use crate::channel::{ControlMessage, PipeConnector};
use crate::config::GameDescriptor;
use crate::error::{ChannelError, InjectionError, ProcessError};
use crate::game::{GameHost, ProcessRef};
use crate::injection::{Bootstrapper, InjectionHandle, ProcessSpawner};
use crate::process::{self, ProcessHandle};
use crate::window;

impl ProcessRef for ProcessHandle {
    fn pid(&self) -> u32 {
        ProcessHandle::pid(self)
    }
}

/// [`GameHost`] backed by the real OS primitives.
pub struct SystemHost {
    bootstrapper: Bootstrapper<PipeConnector, ProcessSpawner>,
    audio: Box<dyn AudioSessions>,
}

impl SystemHost {
    pub fn new(bootstrapper: Bootstrapper<PipeConnector, ProcessSpawner>) -> Self {
        Self {
            bootstrapper,
            audio: Box::new(DefaultRenderSessions),
        }
    }
}

#[async_trait]
impl GameHost for SystemHost {
    type Process = ProcessHandle;
    type Injection = InjectionHandle<PipeConnector>;

    fn launch(&self, game: &GameDescriptor) -> Result<Option<ProcessHandle>, ProcessError> {
        match game.launch_uri() {
            Some(uri) => {
                info!(game = %game.id, %uri, "launching through store front");
                process::launch_uri(&uri)?;
                Ok(None)
            }
            None => {
                let handle = process::launch_suspended(&game.executable_path)?;
                info!(game = %game.id, pid = handle.pid(), "launched suspended");
                Ok(Some(handle))
            }
        }
    }

    fn open(&self, pid: u32) -> Result<ProcessHandle, ProcessError> {
        process::open(pid)
    }

    fn suspend(&self, process: &ProcessHandle) -> Result<(), ProcessError> {
        process::suspend(process)
    }

    fn resume(&self, process: &ProcessHandle) -> Result<(), ProcessError> {
        process::resume(process)
    }

    fn release_launch(&self, process: &ProcessHandle) -> Result<(), ProcessError> {
        process::release_initial_thread(process)
    }

    fn is_suspended(&self, process: &ProcessHandle) -> Result<bool, ProcessError> {
        process::is_suspended(process)
    }

    async fn bootstrap(
        &self,
        process: &ProcessHandle,
        cancel: &CancellationToken,
    ) -> Result<InjectionHandle<PipeConnector>, InjectionError> {
        let handle = self.bootstrapper.ensure_injected(process, cancel).await?;
        debug!(pid = handle.pid(), connected = handle.is_connected(), "hook ready");
        Ok(handle)
    }

    async fn send(
        &self,
        injection: &mut InjectionHandle<PipeConnector>,
        message: ControlMessage,
    ) -> Result<(), ChannelError> {
        debug!(pid = injection.pid(), ?message, "sending control record");
        injection.send(message).await
    }

    fn teardown(&self, injection: InjectionHandle<PipeConnector>) {
        injection.teardown();
    }

    fn get_mute(&self, pid: u32) -> bool {
        audio::get_mute(self.audio.as_ref(), pid)
    }

    fn set_mute(&self, pid: u32, muted: bool) -> bool {
        audio::set_mute(self.audio.as_ref(), pid, muted)
    }

    fn hide(&self, pid: u32) -> Result<(), ProcessError> {
        if !window::minimize(pid)? {
            warn!(pid, "no window to hide");
        }
        Ok(())
    }

    fn show(&self, pid: u32) -> Result<(), ProcessError> {
        if !window::bring_to_front(pid)? {
            warn!(pid, "no window to show");
            return Ok(());
        }
        window::restore(pid)?;
        window::show(pid)?;
        Ok(())
    }

    fn request_close(&self, pid: u32) -> Result<(), ProcessError> {
        if !window::request_close(pid)? {
            warn!(pid, "no window to close; waiting for the process to exit on its own");
        }
        Ok(())
    }
}
