//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific process behavior live here rather
//! than scattered through the supervisor and detector.

pub mod process;

pub use process::{find_processes_by_cmdline, is_process_alive, terminate_process};

/// Returns the current platform name.
pub fn current_platform() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "linux"
    }
    #[cfg(target_os = "windows")]
    {
        "windows"
    }
    #[cfg(target_os = "macos")]
    {
        "macos"
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        "unknown"
    }
}
