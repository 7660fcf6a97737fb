//! Unit state machine
//!
//! ```text
//!            ┌──────────┐  enabled   ┌───────┐
//!     ┌─────►│  HALTED  │───────────►│ READY │◄──────────────┐
//!     │      └──────────┘◄───────────└───┬───┘  died         │
//!     │                     disabled     │ cond on, launch   │
//!     │                                  ▼                   │
//!     │   cond flux  ┌─────────┐    ┌─────────┐              │
//!     │   ┌─────────►│ WAITING │◄───│ RUNNING │──────────────┤
//!     │   │          └────┬────┘    └────┬────┘              │
//!     │   │   cond on ────┘ resume       │ disabled/cond off │
//!     │   └──────────────────────────────┤ stop              │
//!     │                                  ▼                   │
//!     │  pid gone (daemons)        ┌──────────┐              │
//!     └────────────────────────────│ STOPPING │              │
//!                                  └────┬─────┘              │
//!                 pid gone (one-shots)  ▼                    │
//!                                  ┌──────────┐   dirty      │
//!                                  │   DONE   │──► HALTED ───┘
//!                                  └──────────┘
//! ```
//!
//! [`Manager::step`] re-evaluates a unit until its state stops changing,
//! so callers never observe a transient state.

use std::cell::Cell;
use std::fmt;
use std::time::SystemTime;

use crate::conditions::CondState;
use crate::config::RESPAWN_MAX;
use crate::registry::UnitKey;
use crate::units::{BlockReason, KindMask, UnitKind};

use super::process::{ControlError, StartOutcome};
use super::{Manager, ManagerError};

/// Passes before [`Manager::step`] gives up on reaching a stable state
const MAX_STEP_PASSES: usize = 64;

/// Lifecycle state of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SvcState {
    #[default]
    Halted,
    Ready,
    Running,
    /// Paused while conditions are in flux
    Waiting,
    /// Stop requested, waiting for the process to be collected
    Stopping,
    /// One-shot finished
    Done,
}

impl SvcState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Halted => "halted",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Stopping => "stopping",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for SvcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration change mark set by registration and reload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigMark {
    #[default]
    Clean,
    /// Declaration changed, unit needs a restart or reload
    Dirty,
    /// Declaration gone from configuration
    Removed,
}

impl ConfigMark {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Dirty => "dirty",
            Self::Removed => "removed",
        }
    }
}

/// Runtime state of a unit. Only the state machine changes state, pid and
/// restart counter.
#[derive(Debug, Default)]
pub struct Runtime {
    state: SvcState,
    /// Written by the launcher right after fork
    pid: Cell<i32>,
    restart_counter: u32,
    block: BlockReason,
    mark: ConfigMark,
    awaiting_pidfile: bool,
}

impl Runtime {
    pub fn state(&self) -> SvcState {
        self.state
    }

    pub fn pid(&self) -> i32 {
        self.pid.get()
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_counter
    }

    pub fn block(&self) -> BlockReason {
        self.block
    }

    pub fn config_mark(&self) -> ConfigMark {
        self.mark
    }

    pub fn awaiting_pidfile(&self) -> bool {
        self.awaiting_pidfile
    }

    fn set_state(&mut self, state: SvcState) {
        self.state = state;
    }

    fn record_pid(&self, pid: i32) {
        self.pid.set(pid);
    }

    fn is_dirty(&self) -> bool {
        self.mark == ConfigMark::Dirty
    }

    pub(super) fn set_block(&mut self, block: BlockReason) {
        self.block = block;
    }

    /// Dirty if the declaration mtime changed, clean otherwise
    pub(super) fn check_dirty(&mut self, old: Option<SystemTime>, new: Option<SystemTime>) {
        self.mark = if old != new { ConfigMark::Dirty } else { ConfigMark::Clean };
    }

    pub(super) fn mark_dirty(&mut self) {
        self.mark = ConfigMark::Dirty;
    }

    pub(super) fn mark_removed(&mut self) {
        self.mark = ConfigMark::Removed;
    }

    fn mark_clean(&mut self) {
        self.mark = ConfigMark::Clean;
    }
}

impl Manager {
    /// Unit may run in the current runlevel: not removed, not blocked
    pub fn is_startable(&self, key: UnitKey) -> bool {
        let Some(unit) = self.registry.get(key) else {
            return false;
        };
        unit.runlevels().has(self.levels.current) && !unit.is_removed() && !unit.block().is_blocked()
    }

    fn condition_of(&self, key: UnitKey) -> CondState {
        match self.registry.get(key) {
            Some(unit) => self.conditions.aggregate(unit.conditions()),
            None => CondState::Off,
        }
    }

    /// Drive a unit until its state is stable
    pub fn step(&mut self, key: UnitKey) {
        for _ in 0..MAX_STEP_PASSES {
            if !self.step_once(key) {
                return;
            }
        }
        log::error!("Unit {} did not settle after {} passes", key, MAX_STEP_PASSES);
    }

    /// Step every unit whose kind is in `mask`, in registration order
    pub fn step_all(&mut self, mask: KindMask) {
        for key in self.registry.keys() {
            let selected = self
                .registry
                .get(key)
                .is_some_and(|u| mask.contains(u.kind().mask()));
            if selected {
                self.step(key);
            }
        }
    }

    /// One evaluation of the transition table. True if anything changed.
    fn step_once(&mut self, key: UnitKey) -> bool {
        let enabled = self.is_startable(key);
        let cond = self.condition_of(key);
        let teardown = self.levels.teardown;

        let Some(unit) = self.registry.get_mut(key) else {
            return false;
        };
        let old_state = unit.state();
        let old_block = unit.block();

        log::debug!(
            "{:>20}({:4}): {:>8} {}abled/{:<7} cond:{:<4}",
            unit.command(),
            unit.pid(),
            old_state.as_str(),
            if enabled { "en" } else { "dis" },
            unit.config_mark().as_str(),
            cond.as_str()
        );

        match old_state {
            SvcState::Halted => {
                unit.runtime.restart_counter = 0;
                if enabled {
                    unit.runtime.set_state(SvcState::Ready);
                }
            }

            SvcState::Done => {
                if unit.is_inetd_connection() {
                    self.finish_connection(key);
                    return false;
                }
                if unit.runtime.is_dirty() {
                    unit.runtime.set_state(SvcState::Halted);
                }
            }

            SvcState::Stopping => {
                if unit.pid() == 0 {
                    let next = if unit.kind().is_daemon() {
                        SvcState::Halted
                    } else {
                        SvcState::Done
                    };
                    unit.runtime.set_state(next);
                }
            }

            SvcState::Ready => {
                if !enabled {
                    unit.runtime.set_state(SvcState::Halted);
                } else if cond == CondState::On {
                    if unit.runtime.restart_counter >= RESPAWN_MAX {
                        log::error!("{} keeps crashing, not restarting", unit.name());
                        unit.runtime.set_block(BlockReason::CrashLooping);
                        unit.runtime.set_state(SvcState::Halted);
                    } else if teardown {
                        log::debug!("{} waiting for teardown to complete", unit.name());
                    } else {
                        let unit_ref = &*unit;
                        let outcome = self
                            .host
                            .start(key, unit_ref, &|pid| unit_ref.runtime.record_pid(pid));

                        let connection = unit.is_inetd_connection();
                        match outcome {
                            StartOutcome::Started => {}
                            StartOutcome::Completed(status) => {
                                log::debug!("{} exited with status {}", unit.name(), status);
                                unit.runtime.record_pid(0);
                            }
                            StartOutcome::MissingBinary => {
                                unit.runtime.set_block(BlockReason::MissingBinary);
                                unit.runtime.restart_counter += 1;
                            }
                            StartOutcome::Suspended => {}
                            StartOutcome::Failed => unit.runtime.restart_counter += 1,
                        }

                        // Stream sockets belong to the child now
                        if let Some(conn) = unit.connection.as_mut() {
                            if conn.transport == crate::units::Transport::Stream {
                                conn.socket = None;
                            }
                        }

                        let launched = matches!(outcome, StartOutcome::Started | StartOutcome::Completed(_));
                        if launched || connection {
                            unit.runtime.mark_clean();
                            unit.runtime.awaiting_pidfile = launched && unit.kind() == UnitKind::Service;
                            let next = match unit.kind() {
                                UnitKind::Service | UnitKind::Inetd => SvcState::Running,
                                _ => SvcState::Stopping,
                            };
                            unit.runtime.set_state(next);
                        }
                    }
                }
            }

            SvcState::Running => {
                if !enabled {
                    let _ = self.host.stop(key, unit);
                    unit.runtime.set_state(SvcState::Stopping);
                } else if unit.pid() == 0 && !unit.is_inetd() {
                    unit.runtime.restart_counter += 1;
                    unit.runtime.set_state(SvcState::Ready);
                } else {
                    match cond {
                        CondState::Off => {
                            let _ = self.host.stop(key, unit);
                            unit.runtime.set_state(SvcState::Stopping);
                        }
                        CondState::Flux => {
                            self.host.suspend(key, unit);
                            unit.runtime.set_state(SvcState::Waiting);
                        }
                        CondState::On if unit.runtime.is_dirty() => {
                            if unit.accepts_reload_signal() {
                                // Reload once teardown is over, stays dirty until then
                                if !teardown {
                                    match self.host.restart(unit) {
                                        Ok(()) | Err(ControlError::Signal(_)) => {
                                            unit.runtime.awaiting_pidfile = true;
                                        }
                                        Err(_) => {}
                                    }
                                    unit.runtime.mark_clean();
                                }
                            } else {
                                let _ = self.host.stop(key, unit);
                                unit.runtime.set_state(SvcState::Stopping);
                                unit.runtime.mark_clean();
                            }
                        }
                        CondState::On => {}
                    }
                }
            }

            SvcState::Waiting => {
                if !enabled {
                    self.host.resume(key, unit);
                    let _ = self.host.stop(key, unit);
                    unit.runtime.set_state(SvcState::Stopping);
                } else if unit.pid() == 0 && !unit.is_inetd() {
                    unit.runtime.restart_counter += 1;
                    unit.runtime.set_state(SvcState::Ready);
                } else {
                    match cond {
                        CondState::On => {
                            self.host.resume(key, unit);
                            unit.runtime.set_state(SvcState::Running);
                        }
                        CondState::Off => {
                            self.host.resume(key, unit);
                            let _ = self.host.stop(key, unit);
                            unit.runtime.set_state(SvcState::Stopping);
                        }
                        CondState::Flux => {}
                    }
                }
            }
        }

        let changed = unit.state() != old_state || unit.block() != old_block;
        if changed {
            log::debug!(
                "{:>20}({:4}): -> {:>8}",
                unit.command(),
                unit.pid(),
                unit.state().as_str()
            );
        }
        changed
    }

    /// Process is gone: clear its pid and re-evaluate
    pub(super) fn collect(&mut self, key: UnitKey) {
        if let Some(unit) = self.registry.get_mut(key) {
            unit.runtime.record_pid(0);
            unit.runtime.awaiting_pidfile = false;
        }
        self.step(key);
    }

    /// Block a unit from starting, stopping it if running
    pub fn block(&mut self, key: UnitKey) -> Result<(), ManagerError> {
        let unit = self.registry.get_mut(key).ok_or(ManagerError::NotFound(key))?;
        unit.runtime.set_block(BlockReason::Manual);
        self.step(key);
        Ok(())
    }

    /// Clear any block, including crash-loop and missing-binary
    pub fn unblock(&mut self, key: UnitKey) -> Result<(), ManagerError> {
        let unit = self.registry.get_mut(key).ok_or(ManagerError::NotFound(key))?;
        unit.runtime.set_block(BlockReason::None);
        unit.runtime.restart_counter = 0;
        self.step(key);
        Ok(())
    }

    /// The unit wrote its pidfile after a start or reload
    pub fn pidfile_asserted(&mut self, key: UnitKey) -> Result<(), ManagerError> {
        let unit = self.registry.get_mut(key).ok_or(ManagerError::NotFound(key))?;
        unit.runtime.awaiting_pidfile = false;
        Ok(())
    }

    /// Finished one-shots listed for more than bootstrap run again on a
    /// runlevel change
    pub(super) fn rearm_one_shots(&mut self) {
        for key in self.registry.keys() {
            if let Some(unit) = self.registry.get_mut(key) {
                let one_shot = matches!(unit.kind(), UnitKind::Task | UnitKind::Run);
                if one_shot && unit.state() == SvcState::Done && !unit.runlevels().is_bootstrap_only() {
                    unit.runtime.mark_dirty();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(SvcState::Halted.as_str(), "halted");
        assert_eq!(SvcState::Stopping.to_string(), "stopping");
        assert_eq!(ConfigMark::Removed.as_str(), "removed");
    }

    #[test]
    fn test_runtime_defaults() {
        let rt = Runtime::default();
        assert_eq!(rt.state(), SvcState::Halted);
        assert_eq!(rt.pid(), 0);
        assert_eq!(rt.restart_count(), 0);
        assert_eq!(rt.config_mark(), ConfigMark::Clean);
        assert!(!rt.awaiting_pidfile());
    }

    #[test]
    fn test_check_dirty() {
        let mut rt = Runtime::default();
        let t = SystemTime::UNIX_EPOCH;
        rt.check_dirty(None, Some(t));
        assert_eq!(rt.config_mark(), ConfigMark::Dirty);
        rt.check_dirty(Some(t), Some(t));
        assert_eq!(rt.config_mark(), ConfigMark::Clean);
        rt.mark_removed();
        rt.check_dirty(Some(t), Some(t));
        assert_eq!(rt.config_mark(), ConfigMark::Clean);
    }
}
