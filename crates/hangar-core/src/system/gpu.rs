//! Accelerator memory probe, used only to gate auto-start.
//!
//! Engines declaring a minimum accelerator memory are still installable on
//! machines that cannot satisfy it; the lifecycle manager just skips
//! auto-starting them. An unknown accelerator (no `nvidia-smi`, parse
//! failure) is treated as ungateable and the engine is allowed.

use std::process::Command;
use tracing::debug;

/// Total memory of the largest accelerator in bytes, or `None` when it
/// cannot be determined.
pub fn accelerator_memory_bytes() -> Option<u64> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;

    if !output.status.success() {
        debug!("nvidia-smi exited with {}", output.status);
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_memory_mib(&stdout).map(|mib| mib * 1024 * 1024)
}

/// Whether `requirement` bytes of accelerator memory are available.
/// Unknown hardware is never gated.
pub fn meets_memory_requirement(requirement: u64) -> bool {
    match accelerator_memory_bytes() {
        Some(available) => available >= requirement,
        None => true,
    }
}

/// Parse nvidia-smi csv output (one MiB value per GPU line), returning the
/// largest.
fn parse_memory_mib(output: &str) -> Option<u64> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<u64>().ok())
        .max()
}
