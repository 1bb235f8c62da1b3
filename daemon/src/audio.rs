/// Per-process mute control through the WASAPI session manager.
///
/// Sessions are looked up on the default multimedia render endpoint every
/// call; COM objects are never cached across calls.
///
/// On non-Windows platforms no session is ever found.
use anyhow::Result;
use tracing::warn;

/// Mute switch of one audio session.
pub trait VolumeControl {
    fn set_mute(&self, muted: bool) -> Result<()>;
    fn get_mute(&self) -> Result<bool>;
}

/// Source of per-process audio sessions.
pub trait AudioSessions: Send + Sync {
    fn find_session_volume_control(&self, pid: u32) -> Option<Box<dyn VolumeControl>>;
}

/// Sessions of the default render device.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRenderSessions;

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use anyhow::{Context, Result};
    use windows::core::Interface;
    use windows::Win32::Media::Audio::{
        eMultimedia, eRender, IAudioSessionControl2, IAudioSessionManager2, IMMDeviceEnumerator,
        ISimpleAudioVolume, MMDeviceEnumerator,
    };
    use windows::Win32::System::Com::{CoCreateInstance, CoInitializeEx, CLSCTX_ALL, COINIT_MULTITHREADED};

    use super::VolumeControl;

    pub struct SessionVolume(ISimpleAudioVolume);

    impl VolumeControl for SessionVolume {
        fn set_mute(&self, muted: bool) -> Result<()> {
            unsafe { self.0.SetMute(muted, std::ptr::null()) }.context("ISimpleAudioVolume::SetMute failed")
        }

        fn get_mute(&self) -> Result<bool> {
            let muted = unsafe { self.0.GetMute() }.context("ISimpleAudioVolume::GetMute failed")?;
            Ok(muted.as_bool())
        }
    }

    pub fn find_session(pid: u32) -> Result<Option<SessionVolume>> {
        unsafe {
            // COM must be initialised on this thread; an existing apartment is fine.
            let _ = CoInitializeEx(None, COINIT_MULTITHREADED);

            let enumerator: IMMDeviceEnumerator =
                CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
                    .context("Failed to create IMMDeviceEnumerator")?;
            let device = enumerator
                .GetDefaultAudioEndpoint(eRender, eMultimedia)
                .context("Failed to get default audio render endpoint")?;
            let manager: IAudioSessionManager2 = device
                .Activate(CLSCTX_ALL, None)
                .context("Failed to activate IAudioSessionManager2")?;
            let sessions = manager
                .GetSessionEnumerator()
                .context("GetSessionEnumerator failed")?;

            for i in 0..sessions.GetCount().context("GetCount failed")? {
                let Ok(control) = sessions.GetSession(i) else {
                    continue;
                };
                let Ok(control2) = control.cast::<IAudioSessionControl2>() else {
                    continue;
                };
                if control2.GetProcessId().ok() == Some(pid) {
                    let volume: ISimpleAudioVolume = control
                        .cast()
                        .context("session has no ISimpleAudioVolume")?;
                    return Ok(Some(SessionVolume(volume)));
                }
            }
        }
        Ok(None)
    }
}

impl AudioSessions for DefaultRenderSessions {
    fn find_session_volume_control(&self, pid: u32) -> Option<Box<dyn VolumeControl>> {
        #[cfg(windows)]
        {
            match imp::find_session(pid) {
                Ok(found) => found.map(|v| Box::new(v) as Box<dyn VolumeControl>),
                Err(e) => {
                    warn!(pid, "audio session lookup failed: {e:#}");
                    None
                }
            }
        }
        #[cfg(not(windows))]
        {
            let _ = pid;
            None
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Mutes or unmutes the session owned by `pid`.  Returns whether a session
/// was found and updated; `false` is a no-op.
pub fn set_mute(sessions: &dyn AudioSessions, pid: u32, muted: bool) -> bool {
    let Some(control) = sessions.find_session_volume_control(pid) else {
        return false;
    };
    match control.set_mute(muted) {
        Ok(()) => true,
        Err(e) => {
            warn!(pid, muted, "set mute failed: {e:#}");
            false
        }
    }
}

/// Current mute state of the session owned by `pid`; `false` without one.
pub fn get_mute(sessions: &dyn AudioSessions, pid: u32) -> bool {
    sessions
        .find_session_volume_control(pid)
        .and_then(|control| control.get_mute().ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Sessions keyed by pid, sharing their mute flag with the test.
    #[derive(Default)]
    struct FakeSessions {
        muted: Arc<Mutex<HashMap<u32, bool>>>,
        failing: bool,
    }

    struct FakeVolume {
        pid: u32,
        muted: Arc<Mutex<HashMap<u32, bool>>>,
        failing: bool,
    }

    impl VolumeControl for FakeVolume {
        fn set_mute(&self, muted: bool) -> Result<()> {
            if self.failing {
                anyhow::bail!("device lost");
            }
            self.muted.lock().unwrap().insert(self.pid, muted);
            Ok(())
        }

        fn get_mute(&self) -> Result<bool> {
            if self.failing {
                anyhow::bail!("device lost");
            }
            Ok(self.muted.lock().unwrap()[&self.pid])
        }
    }

    impl AudioSessions for FakeSessions {
        fn find_session_volume_control(&self, pid: u32) -> Option<Box<dyn VolumeControl>> {
            self.muted.lock().unwrap().contains_key(&pid).then(|| {
                Box::new(FakeVolume {
                    pid,
                    muted: Arc::clone(&self.muted),
                    failing: self.failing,
                }) as Box<dyn VolumeControl>
            })
        }
    }

    fn sessions_with(pid: u32, muted: bool) -> FakeSessions {
        let sessions = FakeSessions::default();
        sessions.muted.lock().unwrap().insert(pid, muted);
        sessions
    }

    #[test]
    fn set_mute_updates_the_owning_session() {
        let sessions = sessions_with(42, false);
        assert!(set_mute(&sessions, 42, true));
        assert!(get_mute(&sessions, 42));
        assert!(set_mute(&sessions, 42, false));
        assert!(!get_mute(&sessions, 42));
    }

    #[test]
    fn missing_session_is_a_no_op() {
        let sessions = sessions_with(42, true);
        assert!(!set_mute(&sessions, 7, true));
        assert!(!get_mute(&sessions, 7));
        assert!(sessions.muted.lock().unwrap()[&42]);
    }

    #[test]
    fn session_errors_read_as_unmuted() {
        let mut sessions = sessions_with(42, true);
        sessions.failing = true;
        assert!(!set_mute(&sessions, 42, false));
        assert!(!get_mute(&sessions, 42));
    }

    #[cfg(not(windows))]
    #[test]
    fn default_sessions_find_nothing_off_windows() {
        assert!(DefaultRenderSessions.find_session_volume_control(1).is_none());
        assert!(!set_mute(&DefaultRenderSessions, 1, true));
    }
}
