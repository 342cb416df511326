//! # Process Memory Information
//!
//! Reads the resident memory of the running process and renders byte counts
//! for log lines. The probe sits behind the [`MemoryProbe`] trait so the leak
//! detector can be driven by synthetic readings in tests.

use sysinfo::{Pid, ProcessExt, System, SystemExt};

const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

/// # Memory Probe
///
/// A source of resident-memory readings for the current process.
pub trait MemoryProbe: Send {
    /// Returns the resident set size in bytes, or `None` when the OS refused
    /// to report it.
    fn resident_bytes(&mut self) -> Option<u64>;
}

/// # Sysinfo Probe
///
/// The production probe. It keeps one `sysinfo::System` around and refreshes
/// only the entry of this process on every reading, which keeps the cost of a
/// check to a single `/proc/<pid>` lookup on Linux.
pub struct SysinfoProbe {
    /// Cached system handle; refreshed per reading.
    system: System,
    /// The PID of this process, resolved once at construction.
    pid: Option<Pid>,
}

impl SysinfoProbe {
    /// Creates a probe bound to the current process.
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                log::warn!("Unable to resolve own PID for memory probing: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_bytes(&mut self) -> Option<u64> {
        let pid = self.pid?;
        if !self.system.refresh_process(pid) {
            return None;
        }
        // sysinfo reports bytes since 0.26.
        self.system.process(pid).map(|process| process.memory())
    }
}

/// Formats a byte count as `"12.34 MB"` (binary multiples, two decimals).
pub fn format_bytes(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit_index = 0;
    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }
    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Formats a signed byte delta with an explicit sign, e.g. `"+1.50 MB"`.
pub fn format_delta(delta: i64) -> String {
    let sign = if delta < 0 { "-" } else { "+" };
    format!("{}{}", sign, format_bytes(delta.unsigned_abs()))
}
