//! Process backend: the only code that forks, execs and signals
//!
//! The state machine talks to processes exclusively through [`ProcessControl`]
//! and [`Spawner`], so it can be driven by a fake backend in tests.
//! [`SystemBackend`] is the real implementation on top of `nix`.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::signal::{kill, SigSet, SigmaskHow, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, execv, execve, fork, setgid, setsid, setuid, ForkResult, Gid, Group, Pid, Uid, User};

use super::logpipe::LogPipe;
use crate::plugins::BuiltinHandler;
use crate::units::Transport;

/// Where a child's standard streams go
#[derive(Debug, Clone, Copy)]
pub enum StdioPlan<'a> {
    /// Accepted inetd connection on stdin, mirrored to stdout/stderr
    Socket(RawFd),
    /// Captured through a PTY into the line logger
    Log { logger: &'a str, tag: &'a str },
    /// stdout/stderr to the system console
    Console(&'a Path),
    Inherit,
}

/// Everything needed to fork and exec one unit
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    pub command: &'a str,
    /// Argument vector including argv[0]
    pub args: &'a [String],
    pub user: Option<&'a str>,
    pub group: Option<&'a str>,
    /// PATH for children not running as root
    pub default_path: &'a str,
    pub stdio: StdioPlan<'a>,
    /// Built-in inetd handler run instead of exec
    pub builtin: Option<(BuiltinHandler, Transport)>,
    /// Close the stream socket after the built-in handler returns
    pub close_stdio: bool,
    /// Run to completion: wait for the child before returning
    pub wait: bool,
}

/// Result of a successful fork
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spawned {
    /// Child is running
    Detached(i32),
    /// Child ran to completion with this exit status
    Completed { pid: i32, status: i32 },
}

impl Spawned {
    pub fn pid(&self) -> i32 {
        match self {
            Self::Detached(pid) => *pid,
            Self::Completed { pid, .. } => *pid,
        }
    }
}

/// A getty to start on a TTY
#[derive(Debug, Clone, Copy)]
pub struct GettyRequest<'a> {
    pub getty: &'a Path,
    pub device: &'a Path,
    pub baud: Option<&'a str>,
    pub term: Option<&'a str>,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("Invalid argument (embedded NUL): {0}")]
    InvalidArgument(String),

    #[error("Failed to block SIGCHLD: {0}")]
    SignalMask(Errno),

    #[error("fork() failed: {0}")]
    Fork(Errno),

    #[error("User lookup failed: {0}")]
    Lookup(Errno),
}

/// Signal-level control over running processes
pub trait ProcessControl {
    /// SIGTERM
    fn terminate(&mut self, pid: i32) -> nix::Result<()>;
    /// SIGHUP
    fn reload(&mut self, pid: i32) -> nix::Result<()>;
    /// SIGSTOP
    fn suspend(&mut self, pid: i32) -> nix::Result<()>;
    /// SIGCONT
    fn resume(&mut self, pid: i32) -> nix::Result<()>;
    /// SIGKILL
    fn kill(&mut self, pid: i32) -> nix::Result<()>;
    /// SIGTERM, wait `grace`, SIGKILL, then reap
    fn terminate_and_wait(&mut self, pid: i32, grace: Duration);
}

/// Process creation
pub trait Spawner {
    fn executable_exists(&self, path: &str) -> bool;

    /// Fork and exec a unit. `started` is called with the new pid before
    /// SIGCHLD is unblocked again.
    fn spawn(&mut self, req: &LaunchRequest<'_>, started: &mut dyn FnMut(i32)) -> Result<Spawned, LaunchError>;

    fn spawn_getty(&mut self, req: &GettyRequest<'_>) -> Result<i32, LaunchError>;

    /// Start a shell as session leader with the console as controlling TTY
    fn spawn_shell(&mut self, shell: &Path) -> Result<i32, LaunchError>;

    /// A login session on a TTY ended
    fn session_ended(&mut self, _pid: i32) {}
}

/// Full backend used by the manager
pub trait Backend: ProcessControl + Spawner {}

impl<T: ProcessControl + Spawner> Backend for T {}

/// Real backend using fork/exec and kill(2)
#[derive(Debug, Default)]
pub struct SystemBackend;

impl SystemBackend {
    pub fn new() -> Self {
        Self
    }
}

fn signal(pid: i32, sig: Signal) -> nix::Result<()> {
    kill(Pid::from_raw(pid), sig)
}

impl ProcessControl for SystemBackend {
    fn terminate(&mut self, pid: i32) -> nix::Result<()> {
        signal(pid, Signal::SIGTERM)
    }

    fn reload(&mut self, pid: i32) -> nix::Result<()> {
        signal(pid, Signal::SIGHUP)
    }

    fn suspend(&mut self, pid: i32) -> nix::Result<()> {
        signal(pid, Signal::SIGSTOP)
    }

    fn resume(&mut self, pid: i32) -> nix::Result<()> {
        signal(pid, Signal::SIGCONT)
    }

    fn kill(&mut self, pid: i32) -> nix::Result<()> {
        signal(pid, Signal::SIGKILL)
    }

    fn terminate_and_wait(&mut self, pid: i32, grace: Duration) {
        let _ = signal(pid, Signal::SIGTERM);
        std::thread::sleep(grace);
        let _ = signal(pid, Signal::SIGKILL);
        let _ = waitpid(Pid::from_raw(pid), None);
    }
}

impl Spawner for SystemBackend {
    fn executable_exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn spawn(&mut self, req: &LaunchRequest<'_>, started: &mut dyn FnMut(i32)) -> Result<Spawned, LaunchError> {
        // Everything that allocates happens before fork()
        let child = ChildSetup::prepare(req)?;

        let old = block_sigchld()?;
        let result = match unsafe { fork() } {
            Ok(ForkResult::Child) => child.run(),
            Ok(ForkResult::Parent { child }) => {
                let pid = child.as_raw();
                started(pid);
                if req.wait {
                    let status = wait_exit(child);
                    Ok(Spawned::Completed { pid, status })
                } else {
                    Ok(Spawned::Detached(pid))
                }
            }
            Err(e) => Err(LaunchError::Fork(e)),
        };
        restore_mask(&old);

        result
    }

    fn spawn_getty(&mut self, req: &GettyRequest<'_>) -> Result<i32, LaunchError> {
        let getty = path_cstring(req.getty)?;
        let mut argv = vec![
            getty.clone(),
            cstring("-L")?,
            cstring(req.baud.unwrap_or("38400"))?,
            path_cstring(req.device)?,
        ];
        if let Some(term) = req.term {
            argv.push(cstring(term)?);
        }

        let old = block_sigchld()?;
        let result = match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let _ = setsid();
                let _ = SigSet::all().thread_unblock();
                let err = match execv(&getty, &argv) {
                    Err(e) => e,
                    Ok(never) => match never {},
                };
                unsafe { libc::_exit(err as i32) }
            }
            Ok(ForkResult::Parent { child }) => Ok(child.as_raw()),
            Err(e) => Err(LaunchError::Fork(e)),
        };
        restore_mask(&old);

        result
    }

    fn spawn_shell(&mut self, shell: &Path) -> Result<i32, LaunchError> {
        let sh = path_cstring(shell)?;
        let argv = [sh.clone()];

        let old = block_sigchld()?;
        let result = match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                // Session leader with a controlling TTY, for job control
                let _ = setsid();
                unsafe {
                    libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 1);
                }
                let _ = SigSet::all().thread_unblock();
                let err = match execv(&sh, &argv) {
                    Err(e) => e,
                    Ok(never) => match never {},
                };
                unsafe { libc::_exit(err as i32) }
            }
            Ok(ForkResult::Parent { child }) => Ok(child.as_raw()),
            Err(e) => Err(LaunchError::Fork(e)),
        };
        restore_mask(&old);

        result
    }

    fn session_ended(&mut self, pid: i32) {
        utmp_set_dead(pid);
    }
}

/// Block SIGCHLD, returning the previous mask
pub(crate) fn block_sigchld() -> Result<SigSet, LaunchError> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.thread_swap_mask(SigmaskHow::SIG_BLOCK)
        .map_err(LaunchError::SignalMask)
}

pub(crate) fn restore_mask(old: &SigSet) {
    if let Err(e) = old.thread_set_mask() {
        log::warn!("Failed to restore signal mask: {}", e);
    }
}

/// Wait for one specific child, returning its exit status
fn wait_exit(pid: Pid) -> i32 {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return code,
            Ok(WaitStatus::Signaled(_, sig, _)) => return 128 + sig as i32,
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                log::warn!("waitpid({}) failed: {}", pid, e);
                return -1;
            }
        }
    }
}

fn cstring(s: &str) -> Result<CString, LaunchError> {
    CString::new(s).map_err(|_| LaunchError::InvalidArgument(s.to_string()))
}

fn path_cstring(p: &Path) -> Result<CString, LaunchError> {
    CString::new(p.as_os_str().as_bytes())
        .map_err(|_| LaunchError::InvalidArgument(p.display().to_string()))
}

/// Resolved credentials to switch to in the child
struct Credentials {
    uid: Uid,
    gid: Gid,
}

fn resolve_credentials(user: Option<&str>, group: Option<&str>) -> Result<Option<Credentials>, LaunchError> {
    let Some(name) = user else {
        return Ok(None);
    };

    let pw = match name.parse::<u32>() {
        Ok(uid) => User::from_uid(Uid::from_raw(uid)),
        Err(_) => User::from_name(name),
    }
    .map_err(LaunchError::Lookup)?
    .ok_or_else(|| LaunchError::UnknownUser(name.to_string()))?;

    let gid = match group {
        Some(g) => {
            Group::from_name(g)
                .map_err(LaunchError::Lookup)?
                .ok_or_else(|| LaunchError::UnknownGroup(g.to_string()))?
                .gid
        }
        None => pw.gid,
    };

    Ok(Some(Credentials { uid: pw.uid, gid }))
}

/// Environment for the child, with PATH restricted for non-root users
fn child_env(default_path: &str, restrict: bool) -> Vec<CString> {
    std::env::vars_os()
        .filter(|(k, _)| !(restrict && k == "PATH"))
        .filter_map(|(k, v)| {
            let mut entry = k.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(v.as_bytes());
            CString::new(entry).ok()
        })
        .chain(restrict.then(|| CString::new(format!("PATH={}", default_path)).ok()).flatten())
        .collect()
}

enum ChildStdio {
    Socket(RawFd),
    Log { pipe: LogPipe, logger_argv: Vec<CString> },
    Console(CString),
    Inherit,
}

/// Pre-built state for the forked child
struct ChildSetup {
    path: CString,
    argv: Vec<CString>,
    env: Vec<CString>,
    creds: Option<Credentials>,
    stdio: ChildStdio,
    builtin: Option<(BuiltinHandler, Transport)>,
    close_stdio: bool,
}

impl ChildSetup {
    fn prepare(req: &LaunchRequest<'_>) -> Result<Self, LaunchError> {
        let path = cstring(req.command)?;
        let argv = req
            .args
            .iter()
            .map(|a| cstring(a))
            .collect::<Result<Vec<_>, _>>()?;
        let creds = resolve_credentials(req.user, req.group)?;
        let restrict = creds.as_ref().is_some_and(|c| !c.uid.is_root());
        let env = child_env(req.default_path, restrict);

        let stdio = match req.stdio {
            StdioPlan::Socket(fd) => ChildStdio::Socket(fd),
            StdioPlan::Log { logger, tag } => match LogPipe::open() {
                Ok(pipe) => ChildStdio::Log {
                    pipe,
                    logger_argv: vec![cstring(logger)?, cstring("-t")?, cstring(tag)?],
                },
                Err(e) => {
                    log::debug!("Output capture disabled for {}: {}", req.command, e);
                    ChildStdio::Inherit
                }
            },
            StdioPlan::Console(console) => ChildStdio::Console(path_cstring(console)?),
            StdioPlan::Inherit => ChildStdio::Inherit,
        };

        Ok(Self {
            path,
            argv,
            env,
            creds,
            stdio,
            builtin: req.builtin,
            close_stdio: req.close_stdio,
        })
    }

    /// Runs in the forked child, never returns
    fn run(self) -> ! {
        if let Some(creds) = &self.creds {
            if setgid(creds.gid).is_err() || setuid(creds.uid).is_err() {
                unsafe { libc::_exit(1) }
            }
        }

        let mut logger = None;
        match self.stdio {
            ChildStdio::Socket(fd) => {
                let _ = dup2(fd, libc::STDIN_FILENO);
                if fd != libc::STDIN_FILENO {
                    let _ = close(fd);
                }
                let _ = dup2(libc::STDIN_FILENO, libc::STDOUT_FILENO);
                let _ = dup2(libc::STDIN_FILENO, libc::STDERR_FILENO);
            }
            ChildStdio::Log { pipe, logger_argv } => {
                logger = pipe.spawn_logger(&logger_argv);
                pipe.attach();
            }
            ChildStdio::Console(console) => {
                redirect_output(&console);
            }
            ChildStdio::Inherit => {}
        }

        let _ = SigSet::all().thread_unblock();

        let status = match self.builtin {
            Some((handler, transport)) => {
                let status = handler(transport);
                if self.close_stdio {
                    let _ = close(libc::STDIN_FILENO);
                    let _ = close(libc::STDOUT_FILENO);
                    let _ = close(libc::STDERR_FILENO);
                }
                status
            }
            None => match execve(&self.path, &self.argv, &self.env) {
                Err(e) => e as i32,
                Ok(never) => match never {},
            },
        };

        if let Some(pid) = logger {
            LogPipe::reap(pid);
        }

        unsafe { libc::_exit(status) }
    }
}

fn redirect_output(console: &CStr) {
    if let Ok(fd) = open(console, OFlag::O_WRONLY | OFlag::O_APPEND, Mode::empty()) {
        let _ = dup2(fd, libc::STDOUT_FILENO);
        let _ = dup2(fd, libc::STDERR_FILENO);
        let _ = close(fd);
    }
}

/// Mark the utmp entry of a terminated login session as DEAD_PROCESS
#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn utmp_set_dead(pid: i32) {
    unsafe {
        libc::setutxent();
        loop {
            let entry = libc::getutxent();
            if entry.is_null() {
                break;
            }
            if (*entry).ut_pid != pid {
                continue;
            }
            let mut dead = *entry;
            dead.ut_type = libc::DEAD_PROCESS;
            dead.ut_user = [0; 32];
            libc::pututxline(&dead);
            break;
        }
        libc::endutxent();
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn utmp_set_dead(_pid: i32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawned_pid() {
        assert_eq!(Spawned::Detached(12).pid(), 12);
        assert_eq!(Spawned::Completed { pid: 7, status: 1 }.pid(), 7);
    }

    #[test]
    fn test_child_env_restricts_path() {
        let env = child_env("/usr/bin:/bin", true);
        let paths: Vec<_> = env
            .iter()
            .filter(|e| e.as_bytes().starts_with(b"PATH="))
            .collect();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].as_bytes(), b"PATH=/usr/bin:/bin");
    }

    #[test]
    fn test_resolve_root() {
        let creds = resolve_credentials(Some("0"), None).unwrap().unwrap();
        assert!(creds.uid.is_root());
        assert!(resolve_credentials(None, None).unwrap().is_none());
    }

    #[test]
    fn test_resolve_unknown_user() {
        let err = resolve_credentials(Some("no-such-user-svinit"), None);
        assert!(matches!(err, Err(LaunchError::UnknownUser(_))));
    }

    #[test]
    fn test_log_capture_prepared_before_fork() {
        let args = vec!["/sbin/syslogd".to_string()];
        let req = LaunchRequest {
            command: "/sbin/syslogd",
            args: &args,
            user: None,
            group: None,
            default_path: "/usr/bin:/bin",
            stdio: StdioPlan::Log {
                logger: "logger",
                tag: "syslogd",
            },
            builtin: None,
            close_stdio: false,
            wait: false,
        };

        // The PTY belongs to the prepared setup, so nothing is forked yet
        match ChildSetup::prepare(&req).unwrap().stdio {
            ChildStdio::Log { logger_argv, .. } => {
                let argv: Vec<_> = logger_argv.iter().map(|a| a.to_bytes()).collect();
                assert_eq!(argv, vec![&b"logger"[..], b"-t", b"syslogd"]);
            }
            // No /dev/ptmx: capture falls back to inherited output
            ChildStdio::Inherit => {}
            _ => panic!("unexpected stdio plan"),
        }
    }

    #[test]
    fn test_run_to_completion() {
        let args = vec!["/bin/sh".to_string(), "-c".to_string(), "exit 3".to_string()];
        let req = LaunchRequest {
            command: "/bin/sh",
            args: &args,
            user: None,
            group: None,
            default_path: "/usr/bin:/bin",
            stdio: StdioPlan::Inherit,
            builtin: None,
            close_stdio: false,
            wait: true,
        };
        let mut seen = 0;
        let spawned = SystemBackend::new().spawn(&req, &mut |pid| seen = pid).unwrap();
        assert_eq!(spawned, Spawned::Completed { pid: seen, status: 3 });
        assert!(seen > 0);
    }
}
