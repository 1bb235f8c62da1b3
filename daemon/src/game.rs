/// Per-game lifecycle state machine.
///
/// ```text
///            start / creation event          suspend
///  Stopped ──────────► Loading ──────► Running ◄──────► Paused
///     ▲                   │               │    resume      │
///     │      failure      │               │ stop           │ stop (resume first)
///     └───────────────────┘               ▼                │
///     ◄───────────────────────────── Loading ◄─────────────┘
/// ```
///
/// A termination of the tracked process forces `Stopped` from any state.
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::ControlMessage;
use crate::config::GameDescriptor;
use crate::error::{ChannelError, InjectionError, LifecycleError, MonitorError, ProcessError};
use crate::observable::{Observable, ObserverGuard};
use crate::process_monitor::{ProcessMonitor, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Loading,
    Running,
    Paused,
}

pub trait ProcessRef: Send + Sync + 'static {
    fn pid(&self) -> u32;
}

/// Platform capabilities the state machine drives.
#[async_trait]
pub trait GameHost: Send + Sync + 'static {
    type Process: ProcessRef;
    type Injection: Send + 'static;

    /// Starts the game.  Direct launches return the process with its initial
    /// thread withheld; store-front launches return `None` and the process is
    /// discovered through the monitor.
    fn launch(&self, game: &GameDescriptor) -> Result<Option<Self::Process>, ProcessError>;
    fn open(&self, pid: u32) -> Result<Self::Process, ProcessError>;
    fn suspend(&self, process: &Self::Process) -> Result<(), ProcessError>;
    fn resume(&self, process: &Self::Process) -> Result<(), ProcessError>;
    /// Lets a directly launched process start executing.  No-op otherwise.
    fn release_launch(&self, process: &Self::Process) -> Result<(), ProcessError>;
    fn is_suspended(&self, process: &Self::Process) -> Result<bool, ProcessError>;

    async fn bootstrap(
        &self,
        process: &Self::Process,
        cancel: &CancellationToken,
    ) -> Result<Self::Injection, InjectionError>;
    async fn send(
        &self,
        injection: &mut Self::Injection,
        message: ControlMessage,
    ) -> Result<(), ChannelError>;
    /// Closes the channel.  Never touches the target.
    fn teardown(&self, injection: Self::Injection);

    fn get_mute(&self, pid: u32) -> bool;
    /// Returns whether an audio session was found.
    fn set_mute(&self, pid: u32, muted: bool) -> bool;

    fn hide(&self, pid: u32) -> Result<(), ProcessError>;
    fn show(&self, pid: u32) -> Result<(), ProcessError>;
    fn request_close(&self, pid: u32) -> Result<(), ProcessError>;
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub launch: Duration,
    pub stop: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            launch: Duration::from_secs(15),
            stop: Duration::from_secs(15),
        }
    }
}

#[derive(Debug)]
enum GameEvent {
    Created(u32),
    Terminated(u32),
}

struct Tracked<H: GameHost> {
    process: Arc<H::Process>,
    injection: Option<H::Injection>,
}

impl<H: GameHost> Tracked<H> {
    fn pid(&self) -> u32 {
        self.process.pid()
    }
}

/// Pending `start`: the first matching creation fulfils it.
struct LaunchWaiter {
    /// Only this pid is accepted for direct launches; any pid otherwise.
    expected: Option<u32>,
    tx: oneshot::Sender<u32>,
}

struct Inner<H: GameHost> {
    game: GameDescriptor,
    host: Arc<H>,
    timeouts: Timeouts,
    state: Observable<LifecycleState>,
    muted: Observable<bool>,
    tracked: Mutex<Option<Tracked<H>>>,
    /// Held by the one lifecycle-mutating operation in flight.
    busy: Arc<Mutex<()>>,
    launch_waiter: StdMutex<Option<LaunchWaiter>>,
    stop_waiter: StdMutex<Option<(u32, oneshot::Sender<()>)>>,
    cancel: CancellationToken,
}

/// One controllable game: owns at most one tracked process and its injection.
pub struct GameProcess<H: GameHost> {
    inner: Arc<Inner<H>>,
    subscription: StdMutex<Option<Subscription>>,
    events: JoinHandle<()>,
}

impl<H: GameHost> GameProcess<H> {
    /// Registers with `monitor` and starts the event task.  Must be called
    /// inside a tokio runtime.
    pub fn new(
        game: GameDescriptor,
        host: Arc<H>,
        monitor: &ProcessMonitor,
        timeouts: Timeouts,
        cancel: &CancellationToken,
    ) -> Result<Self, MonitorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let terminated_tx = tx.clone();
        // Monitor callbacks run on the monitor thread; only forward.
        let subscription = monitor.monitor(
            &game.executable_path,
            move |pid| {
                let _ = tx.send(GameEvent::Created(pid));
            },
            move |pid| {
                let _ = terminated_tx.send(GameEvent::Terminated(pid));
            },
        )?;

        let inner = Arc::new(Inner {
            game,
            host,
            timeouts,
            state: Observable::new(LifecycleState::Stopped),
            muted: Observable::new(false),
            tracked: Mutex::new(None),
            busy: Arc::new(Mutex::new(())),
            launch_waiter: StdMutex::new(None),
            stop_waiter: StdMutex::new(None),
            cancel: cancel.child_token(),
        });
        let events = tokio::spawn(run_events(Arc::clone(&inner), rx));

        Ok(Self {
            inner,
            subscription: StdMutex::new(Some(subscription)),
            events,
        })
    }

    pub fn descriptor(&self) -> &GameDescriptor {
        &self.inner.game
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state.get()
    }

    pub fn muted(&self) -> bool {
        self.inner.muted.get()
    }

    pub fn subscribe_state(
        &self,
        observer: impl Fn(&LifecycleState) + Send + Sync + 'static,
    ) -> ObserverGuard<LifecycleState> {
        self.inner.state.subscribe(observer)
    }

    pub fn subscribe_muted(&self, observer: impl Fn(&bool) + Send + Sync + 'static) -> ObserverGuard<bool> {
        self.inner.muted.subscribe(observer)
    }

    /// Pid of the tracked process, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.inner.tracked_pid().await
    }

    pub async fn start(&self) -> Result<(), LifecycleError> {
        self.inner.start().await
    }

    /// Takes control of a process that was started outside the orchestrator.
    pub async fn attach_existing(&self, pid: u32) -> Result<(), LifecycleError> {
        self.inner.attach_existing(pid).await
    }

    pub async fn suspend(&self) -> Result<(), LifecycleError> {
        self.inner.suspend().await
    }

    pub async fn resume(&self) -> Result<(), LifecycleError> {
        self.inner.resume().await
    }

    pub async fn stop(&self) -> Result<(), LifecycleError> {
        self.inner.stop().await
    }

    pub async fn hide(&self) -> Result<(), LifecycleError> {
        let pid = self.inner.running_pid().await?;
        self.inner.host.hide(pid)?;
        Ok(())
    }

    pub async fn show(&self) -> Result<(), LifecycleError> {
        let pid = self.inner.running_pid().await?;
        self.inner.host.show(pid)?;
        Ok(())
    }

    pub async fn mute(&self) -> Result<(), LifecycleError> {
        self.inner.set_muted(true).await
    }

    pub async fn unmute(&self) -> Result<(), LifecycleError> {
        self.inner.set_muted(false).await
    }

    pub async fn toggle_mute(&self) -> Result<(), LifecycleError> {
        self.inner.set_muted(!self.inner.muted.get()).await
    }

    pub async fn set_active_controller(&self, controller: i32) -> Result<(), LifecycleError> {
        let mut tracked = self.inner.tracked.lock().await;
        let injection = tracked
            .as_mut()
            .and_then(|t| t.injection.as_mut())
            .ok_or(LifecycleError::NoInjection)?;
        self.inner
            .host
            .send(injection, ControlMessage::SetActiveController(controller))
            .await?;
        Ok(())
    }

    /// Aborts in-flight waits, stops listening to the monitor and closes the
    /// channel.  The target keeps running.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.subscription.lock().unwrap().take();
        if let Some(tracked) = self.inner.tracked.lock().await.take() {
            if let Some(injection) = tracked.injection {
                self.inner.host.teardown(injection);
            }
        }
        info!(game = %self.inner.game.id, "game shut down");
    }
}

impl<H: GameHost> Drop for GameProcess<H> {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        self.events.abort();
    }
}

async fn run_events<H: GameHost>(inner: Arc<Inner<H>>, mut rx: mpsc::UnboundedReceiver<GameEvent>) {
    loop {
        let event = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        debug!(game = %inner.game.id, ?event, "process event");
        match event {
            GameEvent::Created(pid) => inner.on_created(pid).await,
            GameEvent::Terminated(pid) => inner.on_terminated(pid).await,
        }
    }
}

impl<H: GameHost> Inner<H> {
    fn begin(&self) -> Result<OwnedMutexGuard<()>, LifecycleError> {
        Arc::clone(&self.busy)
            .try_lock_owned()
            .map_err(|_| LifecycleError::Busy)
    }

    async fn tracked_pid(&self) -> Option<u32> {
        self.tracked.lock().await.as_ref().map(Tracked::pid)
    }

    async fn tracked_process(&self) -> Option<Arc<H::Process>> {
        self.tracked
            .lock()
            .await
            .as_ref()
            .map(|t| Arc::clone(&t.process))
    }

    async fn running_pid(&self) -> Result<u32, LifecycleError> {
        if self.state.get() != LifecycleState::Running {
            return Err(LifecycleError::NotRunning);
        }
        self.tracked_pid().await.ok_or(LifecycleError::NotRunning)
    }

    async fn track(&self, process: Arc<H::Process>) {
        *self.tracked.lock().await = Some(Tracked {
            process,
            injection: None,
        });
    }

    /// Drops the tracked record, closing its channel.
    async fn release_tracked(&self) {
        if let Some(tracked) = self.tracked.lock().await.take() {
            if let Some(injection) = tracked.injection {
                self.host.teardown(injection);
            }
        }
    }

    /// Failure path of every operation that passed through `Loading`.
    async fn abandon(&self, reason: &LifecycleError) {
        warn!(game = %self.game.id, "{reason}; returning to stopped");
        self.release_tracked().await;
        self.state.set(LifecycleState::Stopped);
    }

    // ── start ────────────────────────────────────────────────────────────────

    async fn start(&self) -> Result<(), LifecycleError> {
        let _busy = self.begin()?;
        match self.state.get() {
            LifecycleState::Stopped => {}
            LifecycleState::Running => return Ok(()),
            state => {
                return Err(LifecycleError::InvalidState {
                    operation: "start",
                    state,
                })
            }
        }

        self.state.set(LifecycleState::Loading);
        info!(game = %self.game.id, "starting");
        let result = self.launch_and_hook().await;
        if let Err(e) = &result {
            self.abandon(e).await;
        }
        result
    }

    async fn launch_and_hook(&self) -> Result<(), LifecycleError> {
        let (tx, rx) = oneshot::channel();
        let launched = {
            // Held across the launch so the creation event cannot beat the waiter.
            let mut waiter = self.launch_waiter.lock().unwrap();
            let launched = self.host.launch(&self.game)?;
            *waiter = Some(LaunchWaiter {
                expected: launched.as_ref().map(ProcessRef::pid),
                tx,
            });
            launched
        };

        let waited = tokio::select! {
            _ = self.cancel.cancelled() => Err(LifecycleError::Cancelled),
            received = tokio::time::timeout(self.timeouts.launch, rx) => match received {
                Ok(Ok(pid)) => Ok(pid),
                Ok(Err(_)) => Err(LifecycleError::Cancelled),
                Err(_) => Err(LifecycleError::LaunchTimeout(self.timeouts.launch)),
            },
        };
        self.launch_waiter.lock().unwrap().take();

        let pid = match waited {
            Ok(pid) => pid,
            Err(e) => {
                // A launched process must not stay frozen.
                if let Some(process) = &launched {
                    if let Err(release) = self.host.release_launch(process) {
                        error!(game = %self.game.id, pid = process.pid(), "failed to release launched process: {release}");
                    }
                }
                return Err(e);
            }
        };

        let process = match launched {
            Some(process) => process,
            None => self.host.open(pid)?,
        };
        self.hook_fresh(process).await
    }

    /// Suspend, bootstrap, resume, release: the module is active before the
    /// game runs any further.  The target is resumed on every path.
    async fn hook_fresh(&self, process: H::Process) -> Result<(), LifecycleError> {
        let process = Arc::new(process);
        let pid = process.pid();
        self.track(Arc::clone(&process)).await;

        let (hooked, resumed) = match self.host.suspend(&process) {
            Ok(()) => {
                let hooked = self.host.bootstrap(&process, &self.cancel).await;
                let resumed = self.host.resume(&process);
                (hooked.map_err(LifecycleError::from), resumed)
            }
            Err(e) => (Err(e.into()), Ok(())),
        };
        let released = self.host.release_launch(&process);

        let injection = match hooked {
            Ok(injection) => injection,
            Err(e) => {
                for failure in [resumed, released].into_iter().filter_map(Result::err) {
                    error!(game = %self.game.id, pid, "{failure}");
                }
                return Err(e);
            }
        };
        // A target left frozen must not be reported as running.
        if let Err(e) = resumed.and(released) {
            self.host.teardown(injection);
            return Err(e.into());
        }

        self.finish_hook(pid, injection, LifecycleState::Running).await
    }

    /// Stores the injection if `pid` is still the tracked process.
    async fn finish_hook(
        &self,
        pid: u32,
        injection: H::Injection,
        state: LifecycleState,
    ) -> Result<(), LifecycleError> {
        {
            let mut tracked = self.tracked.lock().await;
            match tracked.as_mut() {
                Some(t) if t.pid() == pid => t.injection = Some(injection),
                _ => {
                    // Exited while bootstrapping.
                    self.host.teardown(injection);
                    return Err(LifecycleError::NotRunning);
                }
            }
        }
        self.muted.set(self.host.get_mute(pid));
        self.state.set(state);
        info!(game = %self.game.id, pid, ?state, "game hooked");
        Ok(())
    }

    // ── attach ───────────────────────────────────────────────────────────────

    async fn attach_existing(&self, pid: u32) -> Result<(), LifecycleError> {
        let _busy = self.begin()?;
        let state = self.state.get();
        if state != LifecycleState::Stopped {
            return Err(LifecycleError::InvalidState {
                operation: "attach",
                state,
            });
        }

        self.state.set(LifecycleState::Loading);
        info!(game = %self.game.id, pid, "attaching to running process");
        let result = self.attach(pid).await;
        if let Err(e) = &result {
            self.abandon(e).await;
        }
        result
    }

    async fn attach(&self, pid: u32) -> Result<(), LifecycleError> {
        let process = Arc::new(self.host.open(pid)?);
        self.track(Arc::clone(&process)).await;

        // Someone else's suspension is left exactly as found.
        let suspended = self.host.is_suspended(&process)?;
        let injection = self.host.bootstrap(&process, &self.cancel).await?;
        let state = if suspended {
            LifecycleState::Paused
        } else {
            LifecycleState::Running
        };
        self.finish_hook(pid, injection, state).await
    }

    // ── suspend / resume ─────────────────────────────────────────────────────

    async fn suspend(&self) -> Result<(), LifecycleError> {
        let _busy = self.begin()?;
        if self.state.get() != LifecycleState::Running {
            return Err(LifecycleError::NotRunning);
        }
        let process = self.tracked_process().await.ok_or(LifecycleError::NotRunning)?;
        self.host.suspend(&process)?;
        self.state.set(LifecycleState::Paused);
        debug!(game = %self.game.id, pid = process.pid(), "suspended");
        Ok(())
    }

    async fn resume(&self) -> Result<(), LifecycleError> {
        let _busy = self.begin()?;
        if self.state.get() != LifecycleState::Paused {
            return Err(LifecycleError::NotSuspended);
        }
        let process = self.tracked_process().await.ok_or(LifecycleError::NotSuspended)?;
        self.host.resume(&process)?;
        self.state.set(LifecycleState::Running);
        debug!(game = %self.game.id, pid = process.pid(), "resumed");
        Ok(())
    }

    // ── stop ─────────────────────────────────────────────────────────────────

    async fn stop(&self) -> Result<(), LifecycleError> {
        let _busy = self.begin()?;
        let state = self.state.get();
        if !matches!(state, LifecycleState::Running | LifecycleState::Paused) {
            return Err(LifecycleError::NotRunning);
        }

        info!(game = %self.game.id, "stopping");
        let result = self.close_and_wait(state).await;

        // Whatever happened, the session is over.
        self.stop_waiter.lock().unwrap().take();
        self.release_tracked().await;
        self.state.set(LifecycleState::Stopped);
        if let Err(e) = &result {
            warn!(game = %self.game.id, "stop finished with error: {e}");
        }
        result
    }

    async fn close_and_wait(&self, state: LifecycleState) -> Result<(), LifecycleError> {
        let process = self.tracked_process().await.ok_or(LifecycleError::NotRunning)?;
        let pid = process.pid();

        if state == LifecycleState::Paused {
            self.host.resume(&process)?;
            self.state.set(LifecycleState::Running);
        }
        self.state.set(LifecycleState::Loading);

        let (tx, rx) = oneshot::channel();
        *self.stop_waiter.lock().unwrap() = Some((pid, tx));
        self.host.request_close(pid)?;

        tokio::select! {
            _ = self.cancel.cancelled() => Err(LifecycleError::Cancelled),
            exited = tokio::time::timeout(self.timeouts.stop, rx) => match exited {
                Ok(_) => Ok(()),
                Err(_) => Err(LifecycleError::StopTimeout(self.timeouts.stop)),
            },
        }
    }

    // ── mute ─────────────────────────────────────────────────────────────────

    async fn set_muted(&self, muted: bool) -> Result<(), LifecycleError> {
        let pid = self.tracked_pid().await.ok_or(LifecycleError::NotRunning)?;
        if !self.host.set_mute(pid, muted) {
            debug!(game = %self.game.id, pid, "no audio session yet");
        }
        self.muted.set(muted);
        Ok(())
    }

    // ── monitor events ───────────────────────────────────────────────────────

    async fn on_created(self: &Arc<Self>, pid: u32) {
        {
            let mut waiter = self.launch_waiter.lock().unwrap();
            if let Some(pending) = waiter.take() {
                if pending.expected.map_or(true, |expected| expected == pid) {
                    let _ = pending.tx.send(pid);
                    return;
                }
                *waiter = Some(pending);
            }
        }

        if let Some(tracked) = self.tracked_pid().await {
            warn!(game = %self.game.id, pid, tracked, "ignoring new instance while another is tracked");
            return;
        }
        let state = self.state.get();
        if state != LifecycleState::Stopped {
            warn!(game = %self.game.id, pid, ?state, "ignoring new instance");
            return;
        }
        let Ok(busy) = Arc::clone(&self.busy).try_lock_owned() else {
            warn!(game = %self.game.id, pid, "ignoring new instance during another operation");
            return;
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _busy = busy;
            inner.state.set(LifecycleState::Loading);
            info!(game = %inner.game.id, pid, "hooking externally launched process");
            let result = match inner.host.open(pid) {
                Ok(process) => inner.hook_fresh(process).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                inner.abandon(&e).await;
            }
        });
    }

    async fn on_terminated(&self, pid: u32) {
        {
            let mut waiter = self.stop_waiter.lock().unwrap();
            if waiter.as_ref().is_some_and(|(expected, _)| *expected == pid) {
                if let Some((_, tx)) = waiter.take() {
                    let _ = tx.send(());
                }
            }
        }

        let mut tracked = self.tracked.lock().await;
        let Some(current) = tracked.take() else {
            return;
        };
        if current.pid() != pid {
            *tracked = Some(current);
            return;
        }
        drop(tracked);

        if let Some(injection) = current.injection {
            self.host.teardown(injection);
        }
        info!(game = %self.game.id, pid, "tracked process exited");
        self.state.set(LifecycleState::Stopped);
    }
}
