use crate::command::Command;
use crate::config::Config;
use crate::game::LifecycleState;

pub enum DaemonEvent {
    /// A line read from the scheduler's stdin.
    Command(Command),
    /// A game's lifecycle state changed.
    StateChanged { id: String, state: LifecycleState },
    /// A game's mute flag changed.
    MuteChanged { id: String, muted: bool },
    /// A command task finished; `error` is set when it failed.
    CommandFinished { id: String, error: Option<String> },
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// Ctrl+C or `quit`; the daemon should release every game and exit.
    Shutdown,
}
