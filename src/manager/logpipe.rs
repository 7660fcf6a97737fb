//! Output capture through a pseudo-terminal
//!
//! ```text
//!   unit child                     logger child
//!   stdout/stderr ──► PTY master   PTY slave ──► stdin of `logger -t <tag>`
//! ```
//!
//! The PTY is opened by the supervisor while a launch is prepared, before
//! fork. The unit child forks the logger and then takes the master as its
//! stdout and stderr. The supervisor's copy of the master is closed when
//! the prepared setup is dropped after fork. If the unit execs, the logger
//! outlives it and is collected later as an unknown pid.

use std::ffi::CString;
use std::os::fd::BorrowedFd;
use std::os::unix::io::AsRawFd;

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt, PtyMaster};
use nix::sys::signal::SigSet;
use nix::sys::stat::Mode;
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};
use nix::sys::wait::waitpid;
use nix::unistd::{close, dup2, execvp, fork, ForkResult, Pid};

use super::backend::{block_sigchld, restore_mask};

#[derive(Debug, thiserror::Error)]
pub enum LogPipeError {
    #[error("Failed to open PTY: {0}")]
    Open(Errno),

    #[error("Failed to unlock PTY: {0}")]
    Unlock(Errno),

    #[error("Invalid PTY name")]
    Name,
}

/// PTY master feeding a line logger
#[derive(Debug)]
pub struct LogPipe {
    master: PtyMaster,
    slave: CString,
}

impl LogPipe {
    pub fn open() -> Result<Self, LogPipeError> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(LogPipeError::Open)?;
        grantpt(&master).map_err(LogPipeError::Unlock)?;
        unlockpt(&master).map_err(LogPipeError::Unlock)?;
        let name = ptsname_r(&master).map_err(LogPipeError::Open)?;
        let slave = CString::new(name).map_err(|_| LogPipeError::Name)?;

        Ok(Self { master, slave })
    }

    /// Fork the logger reading the slave side. Returns its pid.
    pub fn spawn_logger(&self, argv: &[CString]) -> Option<Pid> {
        let old = block_sigchld().ok()?;
        let pid = match unsafe { fork() } {
            Ok(ForkResult::Child) => self.run_logger(argv),
            Ok(ForkResult::Parent { child }) => Some(child),
            Err(_) => None,
        };
        restore_mask(&old);
        pid
    }

    fn run_logger(&self, argv: &[CString]) -> ! {
        let Ok(fd) = open(self.slave.as_c_str(), OFlag::O_RDONLY, Mode::empty()) else {
            unsafe { libc::_exit(0) }
        };
        let _ = close(self.master.as_raw_fd());

        // Echo would fill the master side nobody reads
        let slave = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Ok(mut attrs) = tcgetattr(slave) {
            attrs.local_flags.remove(LocalFlags::ECHO);
            let _ = tcsetattr(slave, SetArg::TCSANOW, &attrs);
        }

        let _ = dup2(fd, libc::STDIN_FILENO);
        let _ = close(fd);
        let _ = SigSet::all().thread_unblock();

        if let Some(prog) = argv.first() {
            let _ = execvp(prog, argv);
        }
        unsafe { libc::_exit(0) }
    }

    /// Point stdout and stderr at the PTY
    pub fn attach(self) {
        let fd = self.master.as_raw_fd();
        let _ = dup2(fd, libc::STDOUT_FILENO);
        let _ = dup2(fd, libc::STDERR_FILENO);
    }

    /// Wait for the logger to drain and exit
    pub fn reap(pid: Pid) {
        let _ = waitpid(pid, None);
    }
}
