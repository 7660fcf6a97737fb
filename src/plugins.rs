//! Plugin hooks consumed by the supervisor core
//!
//! Plugins can provide built-in inetd handlers (run in the forked child
//! instead of an exec) and observe process start/loss events.

use std::collections::HashMap;

use crate::units::Transport;

/// Built-in inetd handler, invoked in the connection child with stdio
/// already wired to the socket. The return value becomes the exit status.
pub type BuiltinHandler = fn(Transport) -> i32;

/// Events passed to plugins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// A unit process was forked
    ServiceStart(i32),
    /// A unit process was collected
    ServiceLost(i32),
}

pub trait PluginHooks {
    /// Built-in handler registered under `name`, if any
    fn inetd_handler(&self, name: &str) -> Option<BuiltinHandler>;

    /// Called for every hook event
    fn run_hook(&mut self, _hook: Hook) {}
}

/// Plugin table with no plugins
#[derive(Debug, Default)]
pub struct NoPlugins;

impl PluginHooks for NoPlugins {
    fn inetd_handler(&self, _name: &str) -> Option<BuiltinHandler> {
        None
    }
}

type HookFn = Box<dyn FnMut(Hook)>;

/// In-memory plugin table
#[derive(Default)]
pub struct PluginTable {
    handlers: HashMap<String, BuiltinHandler>,
    hooks: Vec<HookFn>,
}

impl PluginTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a built-in inetd handler (e.g. `time`, `echo`)
    pub fn add_inetd(&mut self, name: &str, handler: BuiltinHandler) {
        self.handlers.insert(name.to_string(), handler);
    }

    /// Register a hook observer
    pub fn add_hook(&mut self, hook: impl FnMut(Hook) + 'static) {
        self.hooks.push(Box::new(hook));
    }
}

impl PluginHooks for PluginTable {
    fn inetd_handler(&self, name: &str) -> Option<BuiltinHandler> {
        self.handlers.get(name).copied()
    }

    fn run_hook(&mut self, hook: Hook) {
        for cb in &mut self.hooks {
            cb(hook);
        }
    }
}
