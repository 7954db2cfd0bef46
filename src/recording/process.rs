/**
 * ============================================================================
 * PROCESS MODULE
 * ============================================================================
 *
 * PURPOSE: Child-process helpers for the encoder lifecycle
 *
 * FUNCTIONALITY:
 * - Bounded waits (poll try_wait until a deadline)
 * - Forced termination followed by a short confirmation wait
 * - Detect and kill encoders orphaned by a crashed previous run
 *
 * No wait in this module is unbounded.
 *
 * ============================================================================
 */

use crate::recording::error::Result;
use crate::recording::logger::SessionLogger;
use std::path::Path;
use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};

// Poll the child until it exits or `timeout` elapses.
// Ok(None) means the child is still running.
pub fn wait_with_timeout(child: &mut Child, timeout: Duration, poll: Duration) -> Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        std::thread::sleep(poll.min(deadline - now));
    }
}

// Kill the child and wait briefly for the kill to take effect
pub fn force_terminate(
    child: &mut Child,
    wait: Duration,
    poll: Duration,
    log: &SessionLogger,
) -> Result<Option<ExitStatus>> {
    if let Some(status) = child.try_wait()? {
        return Ok(Some(status));
    }

    log.warn(format_args!("Force terminating encoder process (PID: {})", child.id()));
    if let Err(e) = child.kill() {
        // InvalidInput: the process already exited between try_wait and kill
        if e.kind() != std::io::ErrorKind::InvalidInput {
            return Err(e.into());
        }
    }

    let status = wait_with_timeout(child, wait, poll)?;
    if status.is_none() {
        log.error(format_args!("Encoder process (PID: {}) still alive after kill", child.id()));
    }
    Ok(status)
}

// Kill encoder processes left behind by a previous run that wrote under
// `output_root`. Returns the PIDs that were terminated.
pub fn cleanup_orphaned_encoders(binary_name: &str, output_root: &Path, log: &SessionLogger) -> Vec<u32> {
    log.info(format_args!("Checking for orphaned {} processes...", binary_name));

    let mut system = System::new_all();
    system.refresh_all();

    let marker = output_root.to_string_lossy().to_string();
    let own_pid = std::process::id();

    // Collect PIDs to kill first to avoid borrow issues
    let mut pids_to_kill: Vec<Pid> = Vec::new();

    for (pid, process) in system.processes() {
        if pid.as_u32() == own_pid {
            continue;
        }

        let process_name = process.name().to_string();
        if !is_encoder_name(&process_name, binary_name) {
            continue;
        }

        let writes_under_root = !marker.is_empty() && process.cmd().iter().any(|arg| arg.contains(&marker));
        if !writes_under_root {
            continue;
        }

        let parent_alive = process
            .parent()
            .and_then(|parent| system.process(parent))
            .map(|parent| parent.name() != "init" && parent.name() != "launchd" && parent.pid().as_u32() != 1)
            .unwrap_or(false);
        if parent_alive {
            continue;
        }

        log.warn(format_args!("Found orphaned encoder: {} (PID: {})", process_name, pid));
        pids_to_kill.push(*pid);
    }

    let mut terminated = Vec::new();
    for pid in pids_to_kill {
        match system.process(pid) {
            Some(process) if process.kill() => {
                log.info(format_args!("Terminated orphaned encoder (PID: {})", pid));
                terminated.push(pid.as_u32());
            }
            Some(_) => log.error(format_args!("Failed to terminate orphaned encoder (PID: {})", pid)),
            None => {}
        }
    }

    if terminated.is_empty() {
        log.info(format_args!("No orphaned encoders found"));
    } else {
        log.info(format_args!("Terminated {} orphaned encoder(s): {:?}", terminated.len(), terminated));
    }

    terminated
}

// Handle both exact matches and executable names with extensions
fn is_encoder_name(process_name: &str, binary_name: &str) -> bool {
    let stem = binary_name.trim_end_matches(".exe");
    process_name == stem || process_name == format!("{}.exe", stem)
}
