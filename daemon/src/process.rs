/// Low-level process control: launching with the initial thread withheld,
/// kernel-level suspend/resume, architecture and module queries.
///
/// On non-Windows platforms the public API compiles but every primitive
/// returns [`ProcessError::Unsupported`].
use sysinfo::{ProcessesToUpdate, System};

use crate::error::ProcessError;

/// Ownership of one live OS process.  Closing happens on drop.
pub struct ProcessHandle {
    pid: u32,
    #[cfg(windows)]
    process: imp::OwnedHandle,
    /// Initial thread of a process created by [`launch_suspended`], until released.
    #[cfg(windows)]
    initial_thread: std::sync::Mutex<Option<imp::OwnedHandle>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle").field("pid", &self.pid).finish()
    }
}

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use std::ffi::c_void;
    use std::path::Path;
    use std::sync::Mutex;

    use windows::core::{w, HSTRING, PCWSTR, PWSTR};
    use windows::Win32::Foundation::{CloseHandle, BOOL, HANDLE, HWND};
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W,
        TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32,
    };
    use windows::Win32::System::Threading::{
        CreateProcessW, GetCurrentProcess, IsWow64Process, OpenProcess, ResumeThread,
        CREATE_SUSPENDED, PROCESS_INFORMATION, PROCESS_QUERY_INFORMATION,
        PROCESS_SUSPEND_RESUME, PROCESS_SYNCHRONIZE, PROCESS_VM_READ, STARTUPINFOW,
    };
    use windows::Win32::UI::Shell::ShellExecuteW;
    use windows::Win32::UI::WindowsAndMessaging::SW_SHOWNORMAL;

    use super::{thread_table, ProcessHandle};
    use crate::error::ProcessError;

    const SYSTEM_PROCESS_INFORMATION_CLASS: u32 = 5;
    const STATUS_INFO_LENGTH_MISMATCH: i32 = 0xC000_0004_u32 as i32;
    const ERROR_FILE_NOT_FOUND: i32 = 2;

    #[link(name = "ntdll")]
    extern "system" {
        fn NtSuspendProcess(process: HANDLE) -> i32;
        fn NtResumeProcess(process: HANDLE) -> i32;
        fn NtQuerySystemInformation(
            class: u32,
            information: *mut c_void,
            length: u32,
            return_length: *mut u32,
        ) -> i32;
    }

    /// A kernel handle closed on drop.
    pub struct OwnedHandle(pub HANDLE);

    // Kernel handles are valid from any thread of the owning process.
    unsafe impl Send for OwnedHandle {}
    unsafe impl Sync for OwnedHandle {}

    impl Drop for OwnedHandle {
        fn drop(&mut self) {
            if !self.0.is_invalid() {
                unsafe {
                    let _ = CloseHandle(self.0);
                }
            }
        }
    }

    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn wide_to_string(buf: &[u16]) -> String {
        let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
        String::from_utf16_lossy(&buf[..len])
    }

    pub fn launch_suspended(path: &str) -> Result<ProcessHandle, ProcessError> {
        let has_dir = path.contains(['\\', '/']);
        if has_dir && !Path::new(path).exists() {
            return Err(ProcessError::LaunchFailed {
                path: path.to_string(),
                code: ERROR_FILE_NOT_FOUND,
                message: "executable not found".to_string(),
            });
        }

        // Bare names ("notepad.exe") go through the command line so the
        // loader searches PATH; full paths are passed as the application.
        let application = has_dir.then(|| to_wide(path));
        let directory = if has_dir {
            Path::new(path)
                .parent()
                .map(|d| to_wide(&d.to_string_lossy()))
        } else {
            None
        };
        let mut command_line = to_wide(&format!("\"{path}\""));

        let startup = STARTUPINFOW {
            cb: std::mem::size_of::<STARTUPINFOW>() as u32,
            ..Default::default()
        };
        let mut info = PROCESS_INFORMATION::default();

        unsafe {
            CreateProcessW(
                application
                    .as_ref()
                    .map_or(PCWSTR::null(), |a| PCWSTR(a.as_ptr())),
                PWSTR(command_line.as_mut_ptr()),
                None,
                None,
                false,
                CREATE_SUSPENDED,
                None,
                directory
                    .as_ref()
                    .map_or(PCWSTR::null(), |d| PCWSTR(d.as_ptr())),
                &startup,
                &mut info,
            )
        }
        .map_err(|e| ProcessError::LaunchFailed {
            path: path.to_string(),
            code: e.code().0,
            message: e.message().to_string(),
        })?;

        Ok(ProcessHandle {
            pid: info.dwProcessId,
            process: OwnedHandle(info.hProcess),
            initial_thread: Mutex::new(Some(OwnedHandle(info.hThread))),
        })
    }

    pub fn release_initial_thread(handle: &ProcessHandle) -> Result<(), ProcessError> {
        let taken = match handle.initial_thread.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(thread) = taken else {
            return Ok(());
        };
        let previous = unsafe { ResumeThread(thread.0) };
        if previous == u32::MAX {
            let code = windows::core::Error::from_win32().code().0;
            return Err(ProcessError::ResumeFailed { code });
        }
        Ok(())
    }

    pub fn open(pid: u32) -> Result<ProcessHandle, ProcessError> {
        let raw = unsafe {
            OpenProcess(
                PROCESS_QUERY_INFORMATION
                    | PROCESS_SUSPEND_RESUME
                    | PROCESS_VM_READ
                    | PROCESS_SYNCHRONIZE,
                false,
                pid,
            )
        }
        .map_err(|e| ProcessError::OpenFailed {
            pid,
            code: e.code().0,
        })?;
        Ok(ProcessHandle {
            pid,
            process: OwnedHandle(raw),
            initial_thread: Mutex::new(None),
        })
    }

    pub fn suspend(handle: &ProcessHandle) -> Result<(), ProcessError> {
        let status = unsafe { NtSuspendProcess(handle.process.0) };
        if status != 0 {
            return Err(ProcessError::SuspendFailed { code: status });
        }
        Ok(())
    }

    pub fn resume(handle: &ProcessHandle) -> Result<(), ProcessError> {
        let status = unsafe { NtResumeProcess(handle.process.0) };
        if status != 0 {
            return Err(ProcessError::ResumeFailed { code: status });
        }
        Ok(())
    }

    /// Snapshot of the system process/thread table as returned by
    /// `NtQuerySystemInformation(SystemProcessInformation)`.
    fn system_process_table() -> Result<Vec<u64>, ProcessError> {
        // u64 storage keeps the buffer 8-byte aligned for the kernel.
        let mut words = 64 * 1024;
        loop {
            let mut buf = vec![0u64; words];
            let mut needed = 0u32;
            let status = unsafe {
                NtQuerySystemInformation(
                    SYSTEM_PROCESS_INFORMATION_CLASS,
                    buf.as_mut_ptr().cast(),
                    (buf.len() * 8) as u32,
                    &mut needed,
                )
            };
            match status {
                0 => return Ok(buf),
                STATUS_INFO_LENGTH_MISMATCH => {
                    // The table can grow between calls; leave headroom.
                    words = (needed as usize / 8 + 1).max(words) * 2;
                }
                code => {
                    return Err(ProcessError::QueryFailed {
                        what: "NtQuerySystemInformation",
                        code,
                    })
                }
            }
        }
    }

    pub fn is_suspended(handle: &ProcessHandle) -> Result<bool, ProcessError> {
        let table = system_process_table()?;
        let bytes =
            unsafe { std::slice::from_raw_parts(table.as_ptr().cast::<u8>(), table.len() * 8) };
        Ok(thread_table::all_threads_suspended(bytes, handle.pid as usize).unwrap_or(false))
    }

    fn os_is_64bit() -> Result<bool, ProcessError> {
        if cfg!(target_pointer_width = "64") {
            return Ok(true);
        }
        // A 32-bit build sees WOW64 for itself exactly when the OS is 64-bit.
        let mut wow64 = BOOL(0);
        unsafe { IsWow64Process(GetCurrentProcess(), &mut wow64) }.map_err(|e| {
            ProcessError::QueryFailed {
                what: "IsWow64Process",
                code: e.code().0,
            }
        })?;
        Ok(wow64.as_bool())
    }

    pub fn is_64bit(handle: &ProcessHandle) -> Result<bool, ProcessError> {
        if !os_is_64bit()? {
            return Ok(false);
        }
        let mut wow64 = BOOL(0);
        unsafe { IsWow64Process(handle.process.0, &mut wow64) }.map_err(|e| {
            ProcessError::QueryFailed {
                what: "IsWow64Process",
                code: e.code().0,
            }
        })?;
        Ok(!wow64.as_bool())
    }

    pub fn loaded_modules(pid: u32) -> Result<Vec<String>, ProcessError> {
        let snapshot = unsafe {
            CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid)
        }
        .map_err(|e| ProcessError::QueryFailed {
            what: "CreateToolhelp32Snapshot",
            code: e.code().0,
        })?;
        let snapshot = OwnedHandle(snapshot);

        let mut entry = MODULEENTRY32W {
            dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
            ..Default::default()
        };
        let mut names = Vec::new();
        unsafe {
            if Module32FirstW(snapshot.0, &mut entry).is_ok() {
                loop {
                    names.push(wide_to_string(&entry.szModule));
                    if Module32NextW(snapshot.0, &mut entry).is_err() {
                        break;
                    }
                }
            }
        }
        Ok(names)
    }

    pub fn launch_uri(uri: &str) -> Result<(), ProcessError> {
        let result = unsafe {
            ShellExecuteW(
                HWND::default(),
                w!("open"),
                &HSTRING::from(uri),
                PCWSTR::null(),
                PCWSTR::null(),
                SW_SHOWNORMAL,
            )
        };
        // ShellExecute reports success with a value greater than 32.
        if (result.0 as isize) <= 32 {
            return Err(ProcessError::LaunchFailed {
                path: uri.to_string(),
                code: result.0 as i32,
                message: "ShellExecuteW failed".to_string(),
            });
        }
        Ok(())
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Creates the process at `path` with its initial thread suspended.
/// The caller must later call [`release_initial_thread`].
pub fn launch_suspended(path: &str) -> Result<ProcessHandle, ProcessError> {
    #[cfg(windows)]
    {
        imp::launch_suspended(path)
    }
    #[cfg(not(windows))]
    {
        let _ = path;
        Err(ProcessError::Unsupported)
    }
}

/// Lets the initial thread of a [`launch_suspended`] process run.  No-op for
/// opened processes or when already released.
pub fn release_initial_thread(handle: &ProcessHandle) -> Result<(), ProcessError> {
    #[cfg(windows)]
    {
        imp::release_initial_thread(handle)
    }
    #[cfg(not(windows))]
    {
        let _ = handle;
        Ok(())
    }
}

/// Opens an already-running process.
pub fn open(pid: u32) -> Result<ProcessHandle, ProcessError> {
    #[cfg(windows)]
    {
        imp::open(pid)
    }
    #[cfg(not(windows))]
    {
        let _ = pid;
        Err(ProcessError::Unsupported)
    }
}

/// Suspends every thread of the process.  Not deduplicated: callers must
/// pair each call with exactly one [`resume`].
pub fn suspend(handle: &ProcessHandle) -> Result<(), ProcessError> {
    #[cfg(windows)]
    {
        imp::suspend(handle)
    }
    #[cfg(not(windows))]
    {
        let _ = handle;
        Err(ProcessError::Unsupported)
    }
}

pub fn resume(handle: &ProcessHandle) -> Result<(), ProcessError> {
    #[cfg(windows)]
    {
        imp::resume(handle)
    }
    #[cfg(not(windows))]
    {
        let _ = handle;
        Err(ProcessError::Unsupported)
    }
}

/// True iff every thread of the process is waiting with reason "suspended".
pub fn is_suspended(handle: &ProcessHandle) -> Result<bool, ProcessError> {
    #[cfg(windows)]
    {
        imp::is_suspended(handle)
    }
    #[cfg(not(windows))]
    {
        let _ = handle;
        Err(ProcessError::Unsupported)
    }
}

/// False on a 32-bit OS; otherwise true unless the process runs under WOW64.
pub fn is_64bit(handle: &ProcessHandle) -> Result<bool, ProcessError> {
    #[cfg(windows)]
    {
        imp::is_64bit(handle)
    }
    #[cfg(not(windows))]
    {
        let _ = handle;
        Err(ProcessError::Unsupported)
    }
}

/// File names of the modules currently mapped into the process.
pub fn loaded_modules(handle: &ProcessHandle) -> Result<Vec<String>, ProcessError> {
    #[cfg(windows)]
    {
        imp::loaded_modules(handle.pid)
    }
    #[cfg(not(windows))]
    {
        let _ = handle;
        Err(ProcessError::Unsupported)
    }
}

/// Hands a store-front URI (e.g. `steam://rungameid/…`) to the shell.
pub fn launch_uri(uri: &str) -> Result<(), ProcessError> {
    #[cfg(windows)]
    {
        imp::launch_uri(uri)
    }
    #[cfg(not(windows))]
    {
        let _ = uri;
        Err(ProcessError::Unsupported)
    }
}

/// Returns the pid of a running instance of `executable_path`, if any.
/// When several match, the lowest pid wins so repeated lookups are stable.
pub fn find_running(executable_path: &str) -> Option<u32> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    sys.processes()
        .iter()
        .filter(|(_, p)| {
            let exe = p.exe().map(|e| e.to_string_lossy().into_owned());
            matches_executable(executable_path, &p.name().to_string_lossy(), exe.as_deref())
        })
        .map(|(pid, _)| pid.as_u32())
        .min()
}

/// Lower-cased file name without directories or extension:
/// `C:\Games\Hades.exe` → `hades`.  Separators of both styles are accepted
/// regardless of the host platform.
pub fn executable_base_name(path: &str) -> String {
    let file = file_name(path);
    let stem = match file.rfind('.') {
        Some(0) | None => file,
        Some(dot) => &file[..dot],
    };
    stem.to_lowercase()
}

fn file_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

fn normalize_path(path: &str) -> String {
    path.replace('/', "\\").to_lowercase()
}

/// Whether a running process (`name`, optional full `exe` path) is an
/// instance of the configured executable.  Full configured paths are
/// compared against the image path; bare names against the image name.
fn matches_executable(configured: &str, name: &str, exe: Option<&str>) -> bool {
    let configured_has_dir = configured.contains(['\\', '/']);
    match exe {
        Some(exe) if configured_has_dir => normalize_path(exe) == normalize_path(configured),
        _ => file_name(configured).eq_ignore_ascii_case(name),
    }
}

/// Walks the variable-length `SYSTEM_PROCESS_INFORMATION` records produced by
/// `NtQuerySystemInformation`.  Pure byte parsing so it can be exercised on
/// any host.
#[cfg_attr(not(any(windows, test)), allow(dead_code))]
mod thread_table {
    use std::mem::size_of;

    pub const THREAD_STATE_WAITING: u32 = 5;
    pub const WAIT_REASON_SUSPENDED: u32 = 5;

    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    pub struct UnicodeString {
        pub length: u16,
        pub maximum_length: u16,
        pub buffer: usize,
    }

    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    pub struct ProcessRecord {
        pub next_entry_offset: u32,
        pub number_of_threads: u32,
        pub working_set_private_size: i64,
        pub hard_fault_count: u32,
        pub number_of_threads_high_watermark: u32,
        pub cycle_time: u64,
        pub create_time: i64,
        pub user_time: i64,
        pub kernel_time: i64,
        pub image_name: UnicodeString,
        pub base_priority: i32,
        pub unique_process_id: usize,
        pub inherited_from_unique_process_id: usize,
        pub handle_count: u32,
        pub session_id: u32,
        pub unique_process_key: usize,
        pub peak_virtual_size: usize,
        pub virtual_size: usize,
        pub page_fault_count: u32,
        pub peak_working_set_size: usize,
        pub working_set_size: usize,
        pub quota_peak_paged_pool_usage: usize,
        pub quota_paged_pool_usage: usize,
        pub quota_peak_non_paged_pool_usage: usize,
        pub quota_non_paged_pool_usage: usize,
        pub pagefile_usage: usize,
        pub peak_pagefile_usage: usize,
        pub private_page_count: usize,
        pub read_operation_count: i64,
        pub write_operation_count: i64,
        pub other_operation_count: i64,
        pub read_transfer_count: i64,
        pub write_transfer_count: i64,
        pub other_transfer_count: i64,
    }

    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    pub struct ThreadRecord {
        pub kernel_time: i64,
        pub user_time: i64,
        pub create_time: i64,
        pub wait_time: u32,
        pub start_address: usize,
        pub client_id: [usize; 2],
        pub priority: i32,
        pub base_priority: i32,
        pub context_switches: u32,
        pub thread_state: u32,
        pub wait_reason: u32,
    }

    fn read<T: Copy>(buf: &[u8], offset: usize) -> Option<T> {
        let end = offset.checked_add(size_of::<T>())?;
        if end > buf.len() {
            return None;
        }
        // SAFETY: bounds checked above; T is plain old data.
        Some(unsafe { std::ptr::read_unaligned(buf[offset..].as_ptr().cast::<T>()) })
    }

    /// `Some(true)` if the process exists and every one of its (at least one)
    /// threads waits with reason "suspended"; `None` if the pid is absent.
    pub fn all_threads_suspended(buf: &[u8], pid: usize) -> Option<bool> {
        let mut offset = 0usize;
        loop {
            let record: ProcessRecord = read(buf, offset)?;
            if record.unique_process_id == pid {
                let threads = offset + size_of::<ProcessRecord>();
                if record.number_of_threads == 0 {
                    return Some(false);
                }
                for i in 0..record.number_of_threads as usize {
                    let thread: ThreadRecord = read(buf, threads + i * size_of::<ThreadRecord>())?;
                    if thread.thread_state != THREAD_STATE_WAITING
                        || thread.wait_reason != WAIT_REASON_SUSPENDED
                    {
                        return Some(false);
                    }
                }
                return Some(true);
            }
            if record.next_entry_offset == 0 {
                return None;
            }
            offset = offset.checked_add(record.next_entry_offset as usize)?;
        }
    }
}
