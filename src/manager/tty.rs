//! TTY supervision and the fallback shell
//!
//! Each registered TTY gets a getty while its runlevels include the current
//! one and its device exists. When no TTY is active, an optional fallback
//! shell is started on the console so the system stays reachable.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use super::backend::GettyRequest;
use super::Manager;
use crate::units::{TtyDecl, TtyParseError};

/// A supervised TTY
#[derive(Debug, Clone)]
pub struct Tty {
    decl: TtyDecl,
    pid: i32,
}

impl Tty {
    pub fn device(&self) -> &str {
        &self.decl.device
    }

    pub fn decl(&self) -> &TtyDecl {
        &self.decl
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }
}

#[derive(Debug, Default)]
pub(super) struct TtySupervisor {
    ttys: Vec<Tty>,
    fallback_pid: i32,
}

impl TtySupervisor {
    fn find_by_pid(&self, pid: i32) -> Option<usize> {
        if pid <= 0 {
            return None;
        }
        self.ttys.iter().position(|t| t.pid == pid)
    }

    fn num_active(&self) -> usize {
        self.ttys.iter().filter(|t| t.pid > 0).count()
    }
}

/// Device path if `name` exists as given or under `device_dir`
fn locate(name: &str, device_dir: &Path) -> Option<PathBuf> {
    let direct = PathBuf::from(name);
    if direct.exists() {
        return Some(direct);
    }
    let path = device_dir.join(name.trim_start_matches('/'));
    path.exists().then_some(path)
}

/// Resolve a TTY name to a character device path
pub fn canonicalize(name: &str, device_dir: &Path) -> Option<PathBuf> {
    let path = locate(name, device_dir)?;
    let meta = std::fs::metadata(&path).ok()?;
    meta.file_type().is_char_device().then_some(path)
}

impl Manager {
    /// Register a TTY from a `tty` line (without the keyword)
    pub fn register_tty(&mut self, line: &str) -> Result<(), TtyParseError> {
        let decl = TtyDecl::parse(line)?;
        self.register_tty_decl(decl);
        Ok(())
    }

    pub fn register_tty_decl(&mut self, decl: TtyDecl) {
        if let Some(tty) = self.ttys.ttys.iter_mut().find(|t| t.decl.device == decl.device) {
            log::debug!("Updating TTY {}", decl.device);
            tty.decl = decl;
            return;
        }
        log::debug!("Registering TTY {} {}", decl.device, decl.runlevels);
        self.ttys.ttys.push(Tty { decl, pid: 0 });
    }

    pub fn ttys(&self) -> &[Tty] {
        &self.ttys.ttys
    }

    /// TTYs with a running getty
    pub fn tty_active_count(&self) -> usize {
        self.ttys.num_active()
    }

    pub fn fallback_shell_pid(&self) -> i32 {
        self.ttys.fallback_pid
    }

    fn tty_enabled(&self, idx: usize) -> bool {
        let tty = &self.ttys.ttys[idx];
        tty.decl.runlevels.has(self.levels.current)
            && locate(&tty.decl.device, &self.host.config.device_dir).is_some()
    }

    fn tty_start(&mut self, idx: usize) {
        let config = &self.host.config;
        let tty = &mut self.ttys.ttys[idx];
        if tty.pid != 0 {
            return;
        }

        let Some(device) = canonicalize(&tty.decl.device, &config.device_dir) else {
            log::debug!("TTY {} is not a character device", tty.decl.device);
            return;
        };

        let req = GettyRequest {
            getty: &config.getty,
            device: &device,
            baud: tty.decl.baud.as_deref(),
            term: tty.decl.term.as_deref(),
        };
        match self.host.backend.spawn_getty(&req) {
            Ok(pid) => {
                log::debug!("Started getty on {} pid {}", tty.decl.device, pid);
                tty.pid = pid;
            }
            Err(e) => log::warn!("Failed to start getty on {}: {}", tty.decl.device, e),
        }
    }

    fn tty_stop(&mut self, idx: usize) {
        let tty = &mut self.ttys.ttys[idx];
        if tty.pid == 0 {
            return;
        }
        log::debug!("Stopping TTY {}", tty.decl.device);
        self.host
            .backend
            .terminate_and_wait(tty.pid, self.host.config.tty_grace);
        tty.pid = 0;
    }

    /// A process died; restart or stop its TTY. False if it was not a getty
    /// or the fallback shell.
    pub(super) fn tty_respawn(&mut self, pid: i32) -> bool {
        let Some(idx) = self.ttys.find_by_pid(pid) else {
            return self.fallback_shell(pid);
        };

        self.host.backend.session_ended(pid);
        self.ttys.ttys[idx].pid = 0;

        if self.tty_enabled(idx) {
            self.tty_start(idx);
        } else {
            self.tty_stop(idx);
        }
        true
    }

    /// Bring every TTY in line with the current runlevel
    pub fn tty_runlevel(&mut self) {
        for idx in 0..self.ttys.ttys.len() {
            if self.tty_enabled(idx) {
                self.tty_start(idx);
            } else {
                self.tty_stop(idx);
            }
        }

        let lost = if self.ttys.num_active() > 0 { 1 } else { 0 };
        self.fallback_shell(lost);
    }

    /// Fallback shell control
    ///
    /// `lost == 1` kills the shell. `lost == 0` starts one if none runs and
    /// no TTY is active; the shell's own pid restarts it under the same
    /// rule. Returns true if `lost` was the shell or a shell was started.
    pub(super) fn fallback_shell(&mut self, lost: i32) -> bool {
        let Some(shell) = self.host.config.fallback_shell.clone() else {
            return false;
        };

        if lost == 1 {
            if self.ttys.fallback_pid > 0 {
                log::debug!("Stopping fallback shell pid {}", self.ttys.fallback_pid);
                let _ = self.host.backend.kill(self.ttys.fallback_pid);
                self.ttys.fallback_pid = 0;
            }
            return false;
        }

        let ours = lost > 1 && lost == self.ttys.fallback_pid;
        if lost > 1 && !ours {
            return false;
        }
        if ours {
            self.ttys.fallback_pid = 0;
        }
        if self.ttys.fallback_pid != 0 || self.ttys.num_active() > 0 {
            return ours;
        }

        log::info!("No TTY active, starting fallback shell {}", shell.display());
        match self.host.backend.spawn_shell(&shell) {
            Ok(pid) => {
                self.ttys.fallback_pid = pid;
                true
            }
            Err(e) => {
                log::warn!("Failed to start fallback shell: {}", e);
                self.ttys.fallback_pid = 0;
                ours
            }
        }
    }
}
