/// Visibility control for a process's main top-level window.
///
/// Every function returns `Ok(false)` when the process has no visible
/// top-level window (still loading, or headless).
use crate::error::ProcessError;

#[cfg(windows)]
mod imp {
    use windows::Win32::Foundation::{BOOL, HWND, LPARAM, WPARAM};
    use windows::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GetWindowThreadProcessId, IsWindowVisible, PostMessageW,
        SetForegroundWindow, ShowWindow, SHOW_WINDOW_CMD, SW_MINIMIZE, SW_RESTORE, SW_SHOW,
        WM_CLOSE,
    };

    use crate::error::ProcessError;

    struct Search {
        pid: u32,
        found: Option<HWND>,
    }

    unsafe extern "system" fn enum_proc(hwnd: HWND, lparam: LPARAM) -> BOOL {
        let search = &mut *(lparam.0 as *mut Search);
        let mut owner = 0u32;
        GetWindowThreadProcessId(hwnd, Some(&mut owner));
        if owner == search.pid && IsWindowVisible(hwnd).as_bool() {
            search.found = Some(hwnd);
            return BOOL(0);
        }
        BOOL(1)
    }

    pub fn main_window(pid: u32) -> Option<HWND> {
        let mut search = Search { pid, found: None };
        // EnumWindows reports an error when the callback stops early; only
        // the search result matters.
        let _ = unsafe { EnumWindows(Some(enum_proc), LPARAM(&mut search as *mut Search as isize)) };
        search.found
    }

    pub fn show_window(pid: u32, cmd: SHOW_WINDOW_CMD) -> Result<bool, ProcessError> {
        let Some(hwnd) = main_window(pid) else {
            return Ok(false);
        };
        // ShowWindow's return value is the previous visibility, not success.
        unsafe {
            let _ = ShowWindow(hwnd, cmd);
        }
        Ok(true)
    }

    pub fn minimize(pid: u32) -> Result<bool, ProcessError> {
        show_window(pid, SW_MINIMIZE)
    }

    pub fn restore(pid: u32) -> Result<bool, ProcessError> {
        show_window(pid, SW_RESTORE)
    }

    pub fn show(pid: u32) -> Result<bool, ProcessError> {
        show_window(pid, SW_SHOW)
    }

    pub fn bring_to_front(pid: u32) -> Result<bool, ProcessError> {
        let Some(hwnd) = main_window(pid) else {
            return Ok(false);
        };
        // Denied by the foreground lock when the daemon is not in focus;
        // restore/show still apply.
        unsafe {
            let _ = SetForegroundWindow(hwnd);
        }
        Ok(true)
    }

    pub fn request_close(pid: u32) -> Result<bool, ProcessError> {
        let Some(hwnd) = main_window(pid) else {
            return Ok(false);
        };
        unsafe { PostMessageW(hwnd, WM_CLOSE, WPARAM(0), LPARAM(0)) }.map_err(|e| {
            ProcessError::QueryFailed {
                what: "PostMessageW",
                code: e.code().0,
            }
        })?;
        Ok(true)
    }
}

/// Minimizes the main window of `pid`.
pub fn minimize(pid: u32) -> Result<bool, ProcessError> {
    #[cfg(windows)]
    {
        imp::minimize(pid)
    }
    #[cfg(not(windows))]
    {
        let _ = pid;
        Err(ProcessError::Unsupported)
    }
}

pub fn restore(pid: u32) -> Result<bool, ProcessError> {
    #[cfg(windows)]
    {
        imp::restore(pid)
    }
    #[cfg(not(windows))]
    {
        let _ = pid;
        Err(ProcessError::Unsupported)
    }
}

pub fn show(pid: u32) -> Result<bool, ProcessError> {
    #[cfg(windows)]
    {
        imp::show(pid)
    }
    #[cfg(not(windows))]
    {
        let _ = pid;
        Err(ProcessError::Unsupported)
    }
}

pub fn bring_to_front(pid: u32) -> Result<bool, ProcessError> {
    #[cfg(windows)]
    {
        imp::bring_to_front(pid)
    }
    #[cfg(not(windows))]
    {
        let _ = pid;
        Err(ProcessError::Unsupported)
    }
}

/// Posts `WM_CLOSE` to the main window.  Posting rather than sending means a
/// hung or suspended target cannot block the caller.
pub fn request_close(pid: u32) -> Result<bool, ProcessError> {
    #[cfg(windows)]
    {
        imp::request_close(pid)
    }
    #[cfg(not(windows))]
    {
        let _ = pid;
        Err(ProcessError::Unsupported)
    }
}
