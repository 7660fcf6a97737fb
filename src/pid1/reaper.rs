//! Child reaping
//!
//! Collects every exited child without blocking. Orphans reparented to
//! init are reaped here too; the manager reports them as unknown.

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// A reaped child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapedProcess {
    pub pid: i32,
    pub status: WaitResult,
}

/// Exit status of a reaped process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Exited normally with code
    Exited(i32),
    /// Killed by signal
    Signaled(i32),
}

impl WaitResult {
    fn from_wait_status(status: WaitStatus) -> Option<(i32, Self)> {
        match status {
            WaitStatus::Exited(p, code) => Some((p.as_raw(), Self::Exited(code))),
            WaitStatus::Signaled(p, signal, _) => Some((p.as_raw(), Self::Signaled(signal as i32))),
            _ => None,
        }
    }
}

/// Reap all exited children (non-blocking)
pub fn reap_children() -> Vec<ReapedProcess> {
    let mut reaped = Vec::new();

    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some((pid, status)) = WaitResult::from_wait_status(status) {
                    log::debug!("Reaped PID {} ({:?})", pid, status);
                    reaped.push(ReapedProcess { pid, status });
                }
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => {
                log::error!("waitpid error: {}", e);
                break;
            }
        }
    }

    reaped
}
