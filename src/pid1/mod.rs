//! Init process plumbing
//!
//! Signal delivery and child reaping for the daemon. The supervision core
//! in [`crate::manager`] never waits for children itself; everything reaped
//! here is handed to [`Manager::notify_process_exit`].
//!
//! [`Manager::notify_process_exit`]: crate::manager::Manager::notify_process_exit

mod reaper;
mod signals;

pub use reaper::{reap_children, ReapedProcess, WaitResult};
pub use signals::{InitSignal, SignalHandler};

use std::process;

/// Check if we are running as PID 1
pub fn is_pid1() -> bool {
    process::id() == 1
}
