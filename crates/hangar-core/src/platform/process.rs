//! Platform-specific process management: liveness checks, termination with
//! graceful-then-forceful escalation, and command-line scans.
#![allow(unsafe_code)]

use crate::{HangarError, Result};
use tracing::{debug, warn};

/// Check if a process with the given PID is alive.
///
/// - **Unix**: `kill(pid, 0)` signal check
/// - **Windows**: `OpenProcess` with `PROCESS_QUERY_LIMITED_INFORMATION`
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs only an existence/permission check and
        // delivers nothing to the target process.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Threading::{
            OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
        };

        // SAFETY: OpenProcess/CloseHandle with a query-only access mask; the
        // handle is closed on every path.
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if !handle.is_null() {
                CloseHandle(handle);
                true
            } else {
                false
            }
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        warn!("Process alive check not implemented for this platform");
        true
    }
}

/// Terminate a process gracefully, escalating to a forced kill.
///
/// - **Unix**: SIGTERM, wait up to `timeout_ms`, then SIGKILL, reaping any
///   zombie along the way
/// - **Windows**: `taskkill /PID {pid} /F /T`
///
/// Returns `true` if the process is gone afterwards (or was never running).
pub fn terminate_process(pid: u32, timeout_ms: u64) -> Result<bool> {
    if !is_process_alive(pid) {
        debug!("Process {} is not running", pid);
        return Ok(true);
    }

    #[cfg(unix)]
    {
        terminate_process_unix(pid, timeout_ms)
    }

    #[cfg(windows)]
    {
        terminate_process_windows(pid)
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(HangarError::Other(
            "Process termination not implemented for this platform".into(),
        ))
    }
}

#[cfg(unix)]
fn terminate_process_unix(pid: u32, timeout_ms: u64) -> Result<bool> {
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag};
    use nix::unistd::Pid;
    use std::thread::sleep;
    use std::time::Duration;

    let nix_pid = Pid::from_raw(pid as i32);

    debug!("Sending SIGTERM to process {}", pid);
    if let Err(e) = kill(nix_pid, Signal::SIGTERM) {
        if e == nix::errno::Errno::ESRCH {
            return Ok(true);
        }
        warn!("Failed to send SIGTERM to {}: {}", pid, e);
    }

    let wait_interval = Duration::from_millis(100);
    let iterations = (timeout_ms / 100).max(1);

    for _ in 0..iterations {
        sleep(wait_interval);
        // Reap non-blocking in case it is our own zombie child
        let _ = waitpid(nix_pid, Some(WaitPidFlag::WNOHANG));
        if !is_process_alive(pid) {
            debug!("Process {} terminated gracefully", pid);
            return Ok(true);
        }
    }

    debug!("Process {} still running, sending SIGKILL", pid);
    if let Err(e) = kill(nix_pid, Signal::SIGKILL) {
        if e == nix::errno::Errno::ESRCH {
            return Ok(true);
        }
        return Err(HangarError::Other(format!(
            "Failed to kill process {}: {}",
            pid, e
        )));
    }

    sleep(Duration::from_millis(100));

    // waitpid collects the exit status and removes the zombie from the
    // process table; without it is_process_alive keeps returning true.
    match waitpid(nix_pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => debug!("Reaped process {}: {:?}", pid, status),
        Err(e) => {
            // ECHILD means we're not the parent; init will reap it
            if e != nix::errno::Errno::ECHILD {
                debug!("waitpid({}) failed: {}", pid, e);
            }
        }
    }

    Ok(!is_process_alive(pid))
}

#[cfg(windows)]
fn terminate_process_windows(pid: u32) -> Result<bool> {
    use std::process::Command;

    debug!("Terminating process {} with taskkill", pid);

    let output = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F", "/T"])
        .output()
        .map_err(|e| HangarError::Other(format!("Failed to run taskkill: {}", e)))?;

    if output.status.success() {
        Ok(true)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not found") || stderr.contains("not running") {
            Ok(true)
        } else {
            warn!("taskkill failed for {}: {}", pid, stderr);
            Ok(false)
        }
    }
}

/// Scan for processes matching a pattern in their command line.
///
/// Returns `(pid, cmdline)` tuples. Used by the detector to spot engines
/// launched outside our control.
pub fn find_processes_by_cmdline(pattern: &str) -> Vec<(u32, String)> {
    #[cfg(unix)]
    {
        find_processes_unix(pattern)
    }

    #[cfg(windows)]
    {
        find_processes_windows(pattern)
    }

    #[cfg(not(any(unix, windows)))]
    {
        vec![]
    }
}

#[cfg(unix)]
fn find_processes_unix(pattern: &str) -> Vec<(u32, String)> {
    use std::process::Command;

    let output = match Command::new("ps").args(["-eo", "pid=,args="]).output() {
        Ok(o) => o,
        Err(e) => {
            debug!("Failed to run ps: {}", e);
            return vec![];
        }
    };

    if !output.status.success() {
        return vec![];
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let pattern_lower = pattern.to_lowercase();

    stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let parts: Vec<&str> = line.splitn(2, char::is_whitespace).collect();
            if parts.len() != 2 {
                return None;
            }

            let pid: u32 = parts[0].trim().parse().ok()?;
            let cmdline = parts[1].trim();

            if cmdline.to_lowercase().contains(&pattern_lower) {
                Some((pid, cmdline.to_string()))
            } else {
                None
            }
        })
        .collect()
}

#[cfg(windows)]
fn find_processes_windows(pattern: &str) -> Vec<(u32, String)> {
    use std::process::Command;

    let output = match Command::new("wmic")
        .args(["process", "get", "processid,commandline", "/format:csv"])
        .output()
    {
        Ok(o) => o,
        Err(e) => {
            debug!("Failed to run wmic: {}", e);
            return vec![];
        }
    };

    if !output.status.success() {
        return vec![];
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let pattern_lower = pattern.to_lowercase();

    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }

            // CSV format: Node,CommandLine,ProcessId
            let parts: Vec<&str> = line.split(',').collect();
            if parts.len() < 3 {
                return None;
            }

            let cmdline = parts[1];
            let pid: u32 = parts[2].trim().parse().ok()?;

            if cmdline.to_lowercase().contains(&pattern_lower) {
                Some((pid, cmdline.to_string()))
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_alive_self() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(4_000_000_000));
    }

    #[test]
    fn test_terminate_nonexistent() {
        let result = terminate_process(4_000_000_000, 1000);
        assert!(result.is_ok());
        assert!(result.unwrap());
    }
}
