//! Launcher and stop/restart controller
//!
//! Decides how a unit is started (exec, built-in handler, inetd listener)
//! and drives the backend. Never touches unit state directly: the state
//! machine records the pid through the callback it passes in.

use crate::config::{Config, OutputMode};
use crate::plugins::{Hook, PluginHooks};
use crate::registry::UnitKey;
use crate::units::{Transport, Unit};

use super::backend::{Backend, LaunchRequest, Spawned, StdioPlan};
use super::inetd::InetdListener;

/// Result of a start attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartOutcome {
    /// Process forked (or listener opened)
    Started,
    /// Run unit finished with this exit status
    Completed(i32),
    /// Executable does not exist
    MissingBinary,
    /// Starts are globally suspended
    Suspended,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("Bad PID {0}")]
    BadPid(i32),

    #[error("Starts and restarts are suspended")]
    Suspended,

    #[error("Unit does not support SIGHUP")]
    NoReload,

    #[error("Failed to signal process: {0}")]
    Signal(nix::errno::Errno),
}

/// Collaborators the state machine acts through
pub(crate) struct Host {
    pub backend: Box<dyn Backend>,
    pub inetd: Box<dyn InetdListener>,
    pub plugins: Box<dyn PluginHooks>,
    pub config: Config,
    /// Global suspension (SIGTSTP)
    pub stopped: bool,
}

impl Host {
    /// Starts and restarts are suspended
    pub fn is_norespawn(&self) -> bool {
        self.stopped || self.config.norespawn_flagged()
    }

    fn silent(&self) -> bool {
        self.config.output.is_silent()
    }

    pub fn start(&mut self, key: UnitKey, unit: &Unit, record: &dyn Fn(i32)) -> StartOutcome {
        if unit.builtin().is_none() && !self.backend.executable_exists(unit.command()) {
            log::warn!("Service {} does not exist!", unit.command());
            return StartOutcome::MissingBinary;
        }

        if self.is_norespawn() {
            log::debug!("Not starting {}, respawn suspended", unit.name());
            return StartOutcome::Suspended;
        }

        if !self.silent() {
            log::info!("Starting {}", unit.name());
        }

        if unit.is_inetd() {
            let Some(spec) = unit.inetd() else {
                return StartOutcome::Failed;
            };
            return match self.inetd.start(key, spec) {
                Ok(()) => StartOutcome::Started,
                Err(e) => {
                    log::warn!("Failed to open listener for {}: {}", unit.name(), e);
                    StartOutcome::Failed
                }
            };
        }

        let config = &self.config;
        let connection = unit.connection();
        let stdio = match connection.and_then(|c| c.raw_socket()) {
            Some(fd) => StdioPlan::Socket(fd),
            None if unit.log_output() => StdioPlan::Log {
                logger: &config.logger,
                tag: if unit.description().is_empty() {
                    unit.command()
                } else {
                    unit.description()
                },
            },
            None if config.output.use_console() => StdioPlan::Console(&config.console),
            None => StdioPlan::Inherit,
        };
        let transport = connection.map_or(Transport::Stream, |c| c.transport);

        let req = LaunchRequest {
            command: unit.command(),
            args: unit.args(),
            user: unit.user(),
            group: unit.group(),
            default_path: &config.default_path,
            stdio,
            builtin: unit.builtin().map(|h| (h, transport)),
            close_stdio: transport == Transport::Stream && connection.is_some(),
            wait: unit.kind() == crate::units::UnitKind::Run,
        };

        if config.output == OutputMode::Debug {
            log::debug!("Starting {}: {}", unit.command(), unit.args().join(" "));
        }

        let plugins = &mut self.plugins;
        let result = self.backend.spawn(&req, &mut |pid| {
            record(pid);
            plugins.run_hook(Hook::ServiceStart(pid));
        });

        match result {
            Ok(Spawned::Detached(_)) => StartOutcome::Started,
            Ok(Spawned::Completed { status, .. }) => StartOutcome::Completed(status),
            Err(e) => {
                log::warn!("Failed to start {}: {}", unit.name(), e);
                StartOutcome::Failed
            }
        }
    }

    /// SIGTERM, or close the listener for inetd units
    pub fn stop(&mut self, key: UnitKey, unit: &Unit) -> Result<(), ControlError> {
        if unit.is_inetd() {
            if let Some(spec) = unit.inetd() {
                if !self.silent() && !unit.block().is_blocked() {
                    log::info!("Stopping {}", unit.name());
                }
                self.inetd.stop(key, spec);
            }
            return Ok(());
        }

        let pid = unit.pid();
        if pid <= 1 {
            log::debug!("Bad PID {} for {}, SIGTERM", pid, unit.name());
            return Err(ControlError::BadPid(pid));
        }

        if !self.silent() {
            log::info!("Stopping {}", unit.name());
        }
        log::debug!("Sending SIGTERM to pid:{} name:{}", pid, unit.name());

        self.backend.terminate(pid).map_err(|e| {
            log::warn!("Failed to stop {}: {}", unit.name(), e);
            ControlError::Signal(e)
        })
    }

    /// SIGHUP a unit that supports reloading
    pub fn restart(&mut self, unit: &Unit) -> Result<(), ControlError> {
        if self.is_norespawn() {
            return Err(ControlError::Suspended);
        }
        if !unit.accepts_reload_signal() {
            return Err(ControlError::NoReload);
        }

        let pid = unit.pid();
        if pid <= 1 {
            log::debug!("Bad PID {} for {}, SIGHUP", pid, unit.name());
            return Err(ControlError::BadPid(pid));
        }

        if !self.silent() {
            log::info!("Restarting {}", unit.name());
        }
        log::debug!("Sending SIGHUP to pid:{} name:{}", pid, unit.name());

        self.backend.reload(pid).map_err(|e| {
            log::warn!("Failed to restart {}: {}", unit.name(), e);
            ControlError::Signal(e)
        })
    }

    /// Pause a unit while its conditions are in flux
    pub fn suspend(&mut self, key: UnitKey, unit: &Unit) {
        if unit.is_inetd() {
            if let Some(spec) = unit.inetd() {
                self.inetd.stop(key, spec);
            }
        } else if unit.pid() > 1 {
            log::debug!("Sending SIGSTOP to pid:{} name:{}", unit.pid(), unit.name());
            if let Err(e) = self.backend.suspend(unit.pid()) {
                log::warn!("Failed to suspend {}: {}", unit.name(), e);
            }
        }
    }

    pub fn resume(&mut self, key: UnitKey, unit: &Unit) {
        if unit.is_inetd() {
            if let Some(spec) = unit.inetd() {
                if let Err(e) = self.inetd.start(key, spec) {
                    log::warn!("Failed to reopen listener for {}: {}", unit.name(), e);
                }
            }
        } else if unit.pid() > 1 {
            log::debug!("Sending SIGCONT to pid:{} name:{}", unit.pid(), unit.name());
            if let Err(e) = self.backend.resume(unit.pid()) {
                log::warn!("Failed to resume {}: {}", unit.name(), e);
            }
        }
    }
}
