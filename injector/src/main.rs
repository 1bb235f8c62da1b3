//! Architecture-matched helper that loads the shuffler hook module into a
//! running process with a remote `LoadLibraryW` thread.
//!
//! Usage: `shuffler-injector <pid>`.  Exits 0 on success; every failure
//! kind has its own exit code and prints its message on stderr.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(target_pointer_width = "64")]
const MODULE_NAME: &str = "shuffler_hook64.dll";
#[cfg(not(target_pointer_width = "64"))]
const MODULE_NAME: &str = "shuffler_hook32.dll";

const REMOTE_THREAD_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "shuffler-injector", version, about = "Loads the shuffler hook into a process")]
struct Args {
    /// Target process id.
    pid: u32,
}

#[derive(Debug, Error)]
enum InjectError {
    #[error("hook module not found at {0}")]
    ModuleMissing(PathBuf),
    #[error("failed to open process (code {code:#x})")]
    OpenFailed { code: i32 },
    #[error("failed to write the module path into the target (code {code:#x})")]
    WriteFailed { code: i32 },
    #[error("LoadLibraryW not found in kernel32.dll")]
    ResolveFailed,
    #[error("failed to create the remote thread (code {code:#x})")]
    ThreadFailed { code: i32 },
    #[error("remote thread did not finish within {0:?}")]
    Timeout(Duration),
    #[error("LoadLibraryW returned null in the target")]
    NullModule,
    #[error("remote thread injection is only available on Windows")]
    Unsupported,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InjectError {
    /// Process exit code; clap uses 2 for usage errors.
    fn exit_code(&self) -> u8 {
        match self {
            InjectError::Other(_) => 1,
            InjectError::ModuleMissing(_) => 3,
            InjectError::OpenFailed { .. } => 4,
            InjectError::WriteFailed { .. } => 5,
            InjectError::ResolveFailed => 6,
            InjectError::ThreadFailed { .. } => 7,
            InjectError::Timeout(_) => 8,
            InjectError::NullModule => 9,
            InjectError::Unsupported => 10,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stdout)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    match run(args.pid) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(pid: u32) -> Result<(), InjectError> {
    let exe = std::env::current_exe().context("failed to locate the helper executable")?;
    let dir = exe.parent().context("helper executable has no parent directory")?;
    let module = module_path(dir);
    if !module.is_file() {
        return Err(InjectError::ModuleMissing(module));
    }

    info!(pid, module = %module.display(), "injecting");
    let wide = encode_wide_nul(&module.to_string_lossy());
    inject(pid, &wide)?;
    info!(pid, "hook module loaded");
    Ok(())
}

fn module_path(dir: &Path) -> PathBuf {
    dir.join(MODULE_NAME)
}

/// UTF-16 with a trailing nul, as `LoadLibraryW` reads it.
fn encode_wide_nul(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Module names are case-insensitive on Windows.
#[cfg_attr(not(windows), allow(dead_code))]
fn module_listed<S: AsRef<str>>(names: &[S], module: &str) -> bool {
    names.iter().any(|name| name.as_ref().eq_ignore_ascii_case(module))
}

#[cfg(windows)]
fn inject(pid: u32, module: &[u16]) -> Result<(), InjectError> {
    imp::inject(pid, module)
}

#[cfg(not(windows))]
fn inject(_pid: u32, _module: &[u16]) -> Result<(), InjectError> {
    Err(InjectError::Unsupported)
}

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use std::ffi::c_void;

    use tracing::debug;
    use windows::core::{s, w};
    use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
    use windows::Win32::System::Diagnostics::Debug::WriteProcessMemory;
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W, TH32CS_SNAPMODULE,
        TH32CS_SNAPMODULE32,
    };
    use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
    use windows::Win32::System::Memory::{
        VirtualAllocEx, VirtualFreeEx, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
    };
    use windows::Win32::System::Threading::{
        CreateRemoteThread, GetExitCodeThread, OpenProcess, WaitForSingleObject,
        LPTHREAD_START_ROUTINE, PROCESS_CREATE_THREAD, PROCESS_QUERY_INFORMATION,
        PROCESS_VM_OPERATION, PROCESS_VM_READ, PROCESS_VM_WRITE,
    };

    use super::{module_listed, InjectError, MODULE_NAME, REMOTE_THREAD_TIMEOUT};

    struct Handle(HANDLE);

    impl Drop for Handle {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }

    /// A committed region in the target, released on drop.
    struct RemoteRegion<'a> {
        process: &'a Handle,
        address: *mut c_void,
    }

    impl Drop for RemoteRegion<'_> {
        fn drop(&mut self) {
            unsafe {
                let _ = VirtualFreeEx(self.process.0, self.address, 0, MEM_RELEASE);
            }
        }
    }

    pub fn inject(pid: u32, module: &[u16]) -> Result<(), InjectError> {
        let process = unsafe {
            OpenProcess(
                PROCESS_CREATE_THREAD
                    | PROCESS_QUERY_INFORMATION
                    | PROCESS_VM_OPERATION
                    | PROCESS_VM_READ
                    | PROCESS_VM_WRITE,
                false,
                pid,
            )
        }
        .map(Handle)
        .map_err(|e| InjectError::OpenFailed { code: e.code().0 })?;

        let size = std::mem::size_of_val(module);
        let address = unsafe { VirtualAllocEx(process.0, None, size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if address.is_null() {
            let code = windows::core::Error::from_win32().code().0;
            return Err(InjectError::WriteFailed { code });
        }
        let region = RemoteRegion {
            process: &process,
            address,
        };
        debug!(size, "allocated remote region");

        unsafe { WriteProcessMemory(process.0, region.address, module.as_ptr().cast(), size, None) }
            .map_err(|e| InjectError::WriteFailed { code: e.code().0 })?;

        // kernel32 is mapped at the same base in every process of this architecture.
        let kernel32 = unsafe { GetModuleHandleW(w!("kernel32.dll")) }.map_err(|_| InjectError::ResolveFailed)?;
        let load_library = unsafe { GetProcAddress(kernel32, s!("LoadLibraryW")) }.ok_or(InjectError::ResolveFailed)?;
        let start: LPTHREAD_START_ROUTINE = Some(unsafe {
            std::mem::transmute::<
                unsafe extern "system" fn() -> isize,
                unsafe extern "system" fn(*mut c_void) -> u32,
            >(load_library)
        });

        let thread = unsafe { CreateRemoteThread(process.0, None, 0, start, Some(region.address.cast_const()), 0, None) }
            .map(Handle)
            .map_err(|e| InjectError::ThreadFailed { code: e.code().0 })?;

        let wait = unsafe { WaitForSingleObject(thread.0, REMOTE_THREAD_TIMEOUT.as_millis() as u32) };
        if wait == WAIT_TIMEOUT {
            return Err(InjectError::Timeout(REMOTE_THREAD_TIMEOUT));
        }
        if wait != WAIT_OBJECT_0 {
            let code = windows::core::Error::from_win32().code().0;
            return Err(InjectError::ThreadFailed { code });
        }

        let mut exit_code = 0u32;
        unsafe { GetExitCodeThread(thread.0, &mut exit_code) }
            .map_err(|e| InjectError::ThreadFailed { code: e.code().0 })?;
        // The exit code is the low 32 bits of the module base, which can be
        // zero for a module that did load.
        if exit_code == 0 && !module_listed(&loaded_modules(pid), MODULE_NAME) {
            return Err(InjectError::NullModule);
        }
        debug!(base = format_args!("{exit_code:#x}"), "remote LoadLibraryW returned");
        Ok(())
    }

    /// Module names loaded in `pid`; empty when the snapshot fails.
    fn loaded_modules(pid: u32) -> Vec<String> {
        let Ok(snapshot) = (unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid) })
        else {
            return Vec::new();
        };
        let snapshot = Handle(snapshot);

        let mut entry = MODULEENTRY32W {
            dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
            ..Default::default()
        };
        let mut names = Vec::new();
        unsafe {
            if Module32FirstW(snapshot.0, &mut entry).is_ok() {
                loop {
                    let len = entry.szModule.iter().position(|&c| c == 0).unwrap_or(entry.szModule.len());
                    names.push(String::from_utf16_lossy(&entry.szModule[..len]));
                    if Module32NextW(snapshot.0, &mut entry).is_err() {
                        break;
                    }
                }
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_path_is_nul_terminated() {
        let wide = encode_wide_nul(r"C:\Shuffler\shuffler_hook64.dll");
        assert_eq!(wide.last(), Some(&0));
        assert_eq!(wide.len(), r"C:\Shuffler\shuffler_hook64.dll".len() + 1);
    }

    #[test]
    fn wide_path_keeps_non_ascii() {
        let wide = encode_wide_nul("C:\\Spiele\\Größe\\hook.dll");
        let decoded = String::from_utf16(&wide[..wide.len() - 1]).unwrap();
        assert_eq!(decoded, "C:\\Spiele\\Größe\\hook.dll");
    }

    #[test]
    fn module_sits_next_to_helper() {
        let path = module_path(Path::new("/opt/shuffler"));
        assert_eq!(path.parent(), Some(Path::new("/opt/shuffler")));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        #[cfg(target_pointer_width = "64")]
        assert_eq!(name, "shuffler_hook64.dll");
        #[cfg(not(target_pointer_width = "64"))]
        assert_eq!(name, "shuffler_hook32.dll");
    }

    #[test]
    fn loaded_module_is_found_regardless_of_case() {
        let names = ["notepad.exe", "KERNEL32.DLL", "Shuffler_Hook64.dll"];
        assert!(module_listed(&names, "shuffler_hook64.dll"));
        assert!(module_listed(&names, "kernel32.dll"));
        assert!(!module_listed(&names, "shuffler_hook32.dll"));
        assert!(!module_listed::<&str>(&[], MODULE_NAME));
    }

    #[test]
    fn every_failure_has_its_own_exit_code() {
        let errors = [
            InjectError::Other(anyhow::anyhow!("boom")),
            InjectError::ModuleMissing(PathBuf::from("x.dll")),
            InjectError::OpenFailed { code: 5 },
            InjectError::WriteFailed { code: 5 },
            InjectError::ResolveFailed,
            InjectError::ThreadFailed { code: 5 },
            InjectError::Timeout(REMOTE_THREAD_TIMEOUT),
            InjectError::NullModule,
            InjectError::Unsupported,
        ];
        let mut codes: Vec<u8> = errors.iter().map(InjectError::exit_code).collect();
        assert!(codes.iter().all(|&c| c != 0 && c != 2));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn messages_name_the_failure() {
        assert_eq!(
            InjectError::OpenFailed { code: 5 }.to_string(),
            "failed to open process (code 0x5)"
        );
        assert_eq!(
            InjectError::ModuleMissing(PathBuf::from("hook.dll")).to_string(),
            "hook module not found at hook.dll"
        );
    }

    #[cfg(not(windows))]
    #[test]
    fn injection_is_unsupported_off_windows() {
        assert!(matches!(inject(1, &encode_wide_nul("x")), Err(InjectError::Unsupported)));
    }
}
