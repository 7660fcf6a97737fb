//! Condition aggregation
//!
//! Units may depend on named conditions (`IFUP:eth0`, `GW`, ...). Whoever
//! tracks those conditions only has to answer one question per unit: are all
//! of them on, is any of them off, or is something in flux.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Three-valued condition state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondState {
    On,
    Off,
    /// Changing; processes depending on it are paused, not stopped
    Flux,
}

impl CondState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Flux => "flux",
        }
    }
}

impl fmt::Display for CondState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of the aggregate condition state for a unit
pub trait ConditionSource {
    /// Aggregate the given condition names into one state
    fn aggregate(&self, conditions: &[String]) -> CondState;
}

/// In-memory condition store
///
/// Unknown conditions count as off. An empty condition list is always on.
#[derive(Debug, Default)]
pub struct ConditionStore {
    conditions: HashMap<String, CondState>,
}

impl ConditionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) the state of a named condition
    pub fn set(&mut self, name: &str, state: CondState) {
        log::debug!("condition {} -> {}", name, state);
        self.conditions.insert(name.to_string(), state);
    }

    /// Forget a condition (it will read as off afterwards)
    pub fn clear(&mut self, name: &str) {
        self.conditions.remove(name);
    }

    /// Look up a single condition
    ///
    /// Names are matched by prefix, so a declared `IFUP:ppp` is satisfied by
    /// an asserted `IFUP:ppp0`.
    pub fn get(&self, name: &str) -> CondState {
        if let Some(state) = self.conditions.get(name) {
            return *state;
        }

        let mut result = CondState::Off;
        for (asserted, state) in &self.conditions {
            if asserted.starts_with(name) {
                match state {
                    CondState::On => return CondState::On,
                    CondState::Flux => result = CondState::Flux,
                    CondState::Off => {}
                }
            }
        }
        result
    }
}

impl ConditionSource for ConditionStore {
    fn aggregate(&self, conditions: &[String]) -> CondState {
        let mut result = CondState::On;

        for name in conditions {
            match self.get(name) {
                CondState::Off => return CondState::Off,
                CondState::Flux => result = CondState::Flux,
                CondState::On => {}
            }
        }

        result
    }
}

/// Shared source, so the owner can keep updating conditions after handing
/// it to the manager
impl<T: ConditionSource> ConditionSource for Rc<RefCell<T>> {
    fn aggregate(&self, conditions: &[String]) -> CondState {
        self.borrow().aggregate(conditions)
    }
}
