//! Supervision core
//!
//! ```text
//!                 ┌──────────────────────────── Manager ───────────────────────────┐
//!   declarations  │  register ──► Registry ──► step (state machine) ──► Host       │
//!   ─────────────►│                  ▲              ▲                   │ launcher │
//!   process exit  │  notify_process_exit ───────────┘                   │ backend  │
//!   ─────────────►│  TtySupervisor, FallbackShell                       │ inetd    │
//!   runlevel/HUP  │  set_runlevel, reload (teardown tracking)           │ plugins  │
//!   ─────────────►│                                                     └──────────┘
//!                 └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on the caller's thread. The orchestrator feeds events in
//! (child exits, condition changes, runlevel changes) and the manager steps
//! the affected units.

mod backend;
mod inetd;
mod logpipe;
mod process;
mod register;
mod state;
mod transition;
mod tty;

pub use backend::{
    Backend, GettyRequest, LaunchError, LaunchRequest, ProcessControl, Spawned, Spawner, StdioPlan, SystemBackend,
};
pub use inetd::{InetdListener, NullListener};
pub use logpipe::{LogPipe, LogPipeError};
pub use process::ControlError;
pub use register::RegisterError;
pub use state::{ConfigMark, Runtime, SvcState};
pub use tty::Tty;

use std::path::Path;

use crate::conditions::{ConditionSource, ConditionStore};
use crate::config::Config;
use crate::plugins::{Hook, NoPlugins, PluginHooks};
use crate::registry::{Registry, RegistryError, UnitKey};
use crate::units::{KindMask, Unit, UnitKind};

use process::Host;
use transition::Levels;
use tty::TtySupervisor;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Unit {0} not found")]
    NotFound(UnitKey),

    #[error("Unit {0} is not an inetd service")]
    NotInetd(UnitKey),

    #[error("Unknown PID {0}")]
    UnknownPid(i32),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// The supervisor
pub struct Manager {
    registry: Registry,
    conditions: Box<dyn ConditionSource>,
    host: Host,
    ttys: TtySupervisor,
    levels: Levels,
}

impl Manager {
    /// New manager with no conditions, plugins or inetd listener backend
    pub fn new(config: Config, backend: Box<dyn Backend>) -> Self {
        Self {
            registry: Registry::new(config.max_units),
            conditions: Box::new(ConditionStore::new()),
            host: Host {
                backend,
                inetd: Box::new(NullListener),
                plugins: Box::new(NoPlugins),
                config,
                stopped: false,
            },
            ttys: TtySupervisor::default(),
            levels: Levels::default(),
        }
    }

    pub fn with_conditions(mut self, conditions: Box<dyn ConditionSource>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_inetd_listener(mut self, listener: Box<dyn InetdListener>) -> Self {
        self.host.inetd = listener;
        self
    }

    pub fn with_plugins(mut self, plugins: Box<dyn PluginHooks>) -> Self {
        self.host.plugins = plugins;
        self
    }

    pub fn config(&self) -> &Config {
        &self.host.config
    }

    pub fn unit(&self, key: UnitKey) -> Option<&Unit> {
        self.registry.get(key)
    }

    pub fn find(&self, command: &str, id: u32) -> Option<UnitKey> {
        self.registry.find(command, id)
    }

    pub fn find_by_pid(&self, pid: i32) -> Option<UnitKey> {
        self.registry.find_by_pid(pid)
    }

    /// All units in registration order
    pub fn units(&self) -> impl Iterator<Item = (UnitKey, &Unit)> {
        self.registry.iter()
    }

    /// Conditions changed: re-evaluate every unit
    pub fn conditions_changed(&mut self) {
        self.step_all(KindMask::all());
        self.settle();
    }

    /// Globally suspend or resume starts and restarts
    pub fn set_suspended(&mut self, stopped: bool) {
        if self.host.stopped == stopped {
            return;
        }
        self.host.stopped = stopped;
        log::info!("Respawn {}", if stopped { "suspended" } else { "resumed" });
        if !stopped {
            self.step_all(KindMask::all());
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.host.stopped
    }

    /// A child process was collected
    ///
    /// Gives TTYs and the fallback shell first pick, then plugins, then
    /// the owning unit. Pids nobody owns are reported as `UnknownPid`.
    pub fn notify_process_exit(&mut self, pid: i32) -> Result<(), ManagerError> {
        if pid == 1 {
            self.fallback_shell(1);
            return Ok(());
        }
        if pid < 1 {
            return Err(ManagerError::UnknownPid(pid));
        }

        if self.tty_respawn(pid) {
            return Ok(());
        }

        self.host.plugins.run_hook(Hook::ServiceLost(pid));

        let Some(key) = self.registry.find_by_pid(pid) else {
            log::debug!("Collected unknown PID {}", pid);
            return Err(ManagerError::UnknownPid(pid));
        };

        if self.levels.previous.is_none() && self.clean_bootstrap(key) {
            return Ok(());
        }

        if let Some(unit) = self.registry.get(key) {
            log::debug!("Collected {}({})", unit.command(), pid);
            remove_pidfile(&self.host.config.pidfile(unit.command()));
        }

        self.collect(key);
        self.settle();
        Ok(())
    }

    /// Bootstrap-only tasks and runs are deleted once they finish
    fn clean_bootstrap(&mut self, key: UnitKey) -> bool {
        let Some(unit) = self.registry.get(key) else {
            return false;
        };
        let one_shot = matches!(unit.kind(), UnitKind::Task | UnitKind::Run);
        if !one_shot || !unit.runlevels().is_bootstrap_only() {
            return false;
        }

        self.collect(key);
        if let Some(unit) = self.registry.delete(key) {
            log::debug!("Bootstrap {} done, removed", unit.name());
        }
        true
    }
}

fn remove_pidfile(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to remove pidfile {}: {}", path.display(), e);
        }
    }
}
