use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, error, info};

use crate::error::MonitorError;
use crate::process::executable_base_name;

/// Handler invoked with the pid of a matching process.
pub type ProcessCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// One entry of the system-wide process feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Created { pid: u32, image_name: String },
    Terminated { pid: u32, image_name: String },
}

struct Watch {
    id: u64,
    on_create: ProcessCallback,
    on_terminate: ProcessCallback,
}

struct Registry {
    /// Keyed by lower-cased executable base name.
    watches: Mutex<HashMap<String, Vec<Watch>>>,
    next_id: AtomicU64,
    disposed: AtomicBool,
}

struct Feed {
    stop: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Dispatches process creation/termination events to watchers registered by
/// executable name.
///
/// The feed is a `sysinfo` poller on a dedicated thread; handlers run on that
/// thread and must hand any slow work off themselves.
pub struct ProcessMonitor {
    registry: Arc<Registry>,
    feed: Mutex<Option<Feed>>,
}

/// Registration returned by [`ProcessMonitor::monitor`].  Dropping it removes
/// exactly that `(on_create, on_terminate)` pair.
pub struct Subscription {
    registry: Weak<Registry>,
    name: String,
    id: u64,
}

impl ProcessMonitor {
    /// Starts the polling feed.  Processes already running at this point are
    /// the baseline and produce no creation events.
    pub fn start(poll_interval: Duration) -> std::io::Result<Self> {
        let registry = Arc::new(Registry::new());
        let (stop, stop_rx) = mpsc::channel();
        let poller = Arc::clone(&registry);
        let thread = thread::Builder::new()
            .name("process-monitor".into())
            .spawn(move || poll(poller, poll_interval, stop_rx))?;

        info!(interval_ms = poll_interval.as_millis() as u64, "process monitor started");
        Ok(Self {
            registry,
            feed: Mutex::new(Some(Feed { stop, thread })),
        })
    }

    /// A monitor with no feed; events arrive only through [`Self::dispatch`].
    #[cfg(test)]
    pub fn without_feed() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            feed: Mutex::new(None),
        }
    }

    /// Registers handlers for every process whose image base name matches
    /// that of `executable_path` (case-insensitive).
    pub fn monitor(
        &self,
        executable_path: &str,
        on_create: impl Fn(u32) + Send + Sync + 'static,
        on_terminate: impl Fn(u32) + Send + Sync + 'static,
    ) -> Result<Subscription, MonitorError> {
        if self.registry.disposed.load(Ordering::SeqCst) {
            return Err(MonitorError::Disposed);
        }

        let name = executable_base_name(executable_path);
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .watches
            .lock()
            .unwrap()
            .entry(name.clone())
            .or_default()
            .push(Watch {
                id,
                on_create: Arc::new(on_create),
                on_terminate: Arc::new(on_terminate),
            });
        debug!(name, id, "watch registered");

        Ok(Subscription {
            registry: Arc::downgrade(&self.registry),
            name,
            id,
        })
    }

    /// Delivers `event` as if the feed had observed it.
    #[cfg(test)]
    pub fn dispatch(&self, event: &ProcessEvent) {
        self.registry.dispatch(event);
    }

    /// Stops the feed and drops every registration.  Idempotent.
    pub fn dispose(&self) {
        if self.registry.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(feed) = self.feed.lock().unwrap().take() {
            let _ = feed.stop.send(());
            if feed.thread.thread().id() != thread::current().id() {
                let _ = feed.thread.join();
            }
            info!("process monitor stopped");
        }
        self.registry.watches.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn watched_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.watches.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut watches = registry.watches.lock().unwrap();
        if let Some(list) = watches.get_mut(&self.name) {
            list.retain(|w| w.id != self.id);
            if list.is_empty() {
                watches.remove(&self.name);
            }
        }
    }
}

impl Registry {
    fn new() -> Self {
        Self {
            watches: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    fn dispatch(&self, event: &ProcessEvent) {
        let (pid, image_name, created) = match event {
            ProcessEvent::Created { pid, image_name } => (*pid, image_name, true),
            ProcessEvent::Terminated { pid, image_name } => (*pid, image_name, false),
        };
        let key = executable_base_name(image_name);

        // Copy the handlers out so they can (un)subscribe without deadlocking.
        let handlers: Vec<ProcessCallback> = match self.watches.lock().unwrap().get(&key) {
            Some(list) => list
                .iter()
                .map(|w| Arc::clone(if created { &w.on_create } else { &w.on_terminate }))
                .collect(),
            None => return,
        };

        let kind = if created { "creation" } else { "termination" };
        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(pid))) {
                error!(pid, image = %image_name, "process {kind} handler panicked: {}", panic_message(panic.as_ref()));
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

fn poll(registry: Arc<Registry>, interval: Duration, stop: mpsc::Receiver<()>) {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    let mut previous = snapshot(&sys);

    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            // Stop requested or the monitor is gone.
            _ => break,
        }

        sys.refresh_processes(ProcessesToUpdate::All, true);
        let current = snapshot(&sys);
        for event in diff_snapshots(&previous, &current) {
            registry.dispatch(&event);
        }
        previous = current;
    }
}

fn snapshot(sys: &System) -> HashMap<u32, String> {
    sys.processes()
        .iter()
        .map(|(pid, p)| (pid.as_u32(), p.name().to_string_lossy().into_owned()))
        .collect()
}

/// Events that turn `previous` into `current`: terminations first, then
/// creations, each ordered by pid.  A pid that reappears under a different
/// image name counts as a termination plus a creation.
fn diff_snapshots(
    previous: &HashMap<u32, String>,
    current: &HashMap<u32, String>,
) -> Vec<ProcessEvent> {
    let mut terminated: Vec<ProcessEvent> = previous
        .iter()
        .filter(|(pid, name)| current.get(pid) != Some(name))
        .map(|(pid, name)| ProcessEvent::Terminated {
            pid: *pid,
            image_name: name.clone(),
        })
        .collect();
    let mut created: Vec<ProcessEvent> = current
        .iter()
        .filter(|(pid, name)| previous.get(pid) != Some(name))
        .map(|(pid, name)| ProcessEvent::Created {
            pid: *pid,
            image_name: name.clone(),
        })
        .collect();

    let pid_of = |e: &ProcessEvent| match e {
        ProcessEvent::Created { pid, .. } | ProcessEvent::Terminated { pid, .. } => *pid,
    };
    terminated.sort_by_key(pid_of);
    created.sort_by_key(pid_of);
    terminated.extend(created);
    terminated
}
