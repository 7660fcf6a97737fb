//! Runlevel changes and configuration reloads
//!
//! Both start a teardown phase: units that must go are stopped, and nothing
//! new is launched until every stopping unit has been collected. Once the
//! last one is gone the manager sweeps again and starts what the new
//! runlevel or configuration wants.

use super::{Manager, SvcState};
use crate::runlevel::Runlevel;
use crate::units::KindMask;

#[derive(Debug, Clone, Copy)]
pub(super) struct Levels {
    pub current: Runlevel,
    /// None until the first runlevel change after bootstrap
    pub previous: Option<Runlevel>,
    pub teardown: bool,
}

impl Default for Levels {
    fn default() -> Self {
        Self {
            current: Runlevel::Bootstrap,
            previous: None,
            teardown: false,
        }
    }
}

impl Manager {
    pub fn runlevel(&self) -> Runlevel {
        self.levels.current
    }

    pub fn previous_runlevel(&self) -> Option<Runlevel> {
        self.levels.previous
    }

    /// A runlevel change or reload is waiting for units to stop
    pub fn in_teardown(&self) -> bool {
        self.levels.teardown
    }

    /// No unit is waiting for its process to be collected
    pub fn stop_is_done(&self) -> bool {
        self.registry.iter().all(|(_, u)| u.state() != SvcState::Stopping)
    }

    /// Start everything enabled in the bootstrap runlevel
    pub fn bootstrap(&mut self) {
        log::info!("Bootstrapping, runlevel {}", self.levels.current);
        self.step_all(KindMask::all());
        self.tty_runlevel();
    }

    pub fn set_runlevel(&mut self, level: Runlevel) {
        log::info!("Changing runlevel {} -> {}", self.levels.current, level);
        self.levels.previous = Some(self.levels.current);
        self.levels.current = level;

        self.rearm_one_shots();
        self.levels.teardown = true;
        self.step_all(KindMask::all());
        self.tty_runlevel();
        self.settle();
    }

    /// Mark every unit removed before re-reading configuration. Units
    /// registered again are revived; the rest are stopped by [`reload`].
    ///
    /// [`reload`]: Manager::reload
    pub fn begin_reload(&mut self) {
        for key in self.registry.keys() {
            if let Some(unit) = self.registry.get_mut(key) {
                if !unit.is_inetd_connection() {
                    unit.runtime.mark_removed();
                }
            }
        }
    }

    /// Apply a re-read configuration
    pub fn reload(&mut self) {
        log::info!("Reloading configuration");
        self.levels.teardown = true;
        self.step_all(KindMask::all());
        self.settle();
    }

    /// Set or clear teardown from outside, e.g. while an orchestrator
    /// stops things the manager does not own
    pub fn set_teardown(&mut self, teardown: bool) {
        self.levels.teardown = teardown;
        if !teardown {
            self.step_all(KindMask::all());
        }
    }

    /// End teardown once every stopping unit is gone
    pub(super) fn settle(&mut self) {
        if !self.levels.teardown || !self.stop_is_done() {
            return;
        }

        log::debug!("Teardown complete");
        self.levels.teardown = false;
        self.cleanup_removed();
        self.step_all(KindMask::all());
    }

    /// Delete removed units that have nothing left running
    fn cleanup_removed(&mut self) {
        let gone: Vec<_> = self
            .registry
            .iter()
            .filter(|(_, u)| {
                u.is_removed() && u.pid() == 0 && matches!(u.state(), SvcState::Halted | SvcState::Done)
            })
            .map(|(k, _)| k)
            .collect();

        for key in gone {
            if let Some(unit) = self.registry.delete(key) {
                log::debug!("Removed {} {}", unit.kind(), unit.name());
            }
        }
    }
}
