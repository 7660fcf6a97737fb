//! inetd adapter
//!
//! Listening sockets are owned by an external [`InetdListener`]. When it
//! accepts a connection it hands the socket to [`Manager::accept_connection`],
//! which creates a transient connection unit running the service's handler
//! with the socket as stdio.
//!
//! ```text
//!   inetd unit (RUNNING, listener open)
//!        │ accept
//!        ▼
//!   connection unit ── READY ── RUNNING ── STOPPING ── DONE ── deleted
//!        │ wait mode: listener blocked busy until the connection is gone
//! ```

use std::io;
use std::os::fd::OwnedFd;

use super::{Manager, ManagerError};
use crate::registry::UnitKey;
use crate::units::{BlockReason, Connection, InetdSpec, UnitKind};

/// Opens and closes listening sockets for inetd units
pub trait InetdListener {
    /// Open the listening socket and start watching it
    fn start(&mut self, key: UnitKey, spec: &InetdSpec) -> io::Result<()>;

    /// Stop watching and close the listening socket
    fn stop(&mut self, key: UnitKey, spec: &InetdSpec);
}

/// Listener backend that only logs, for systems without inetd support
#[derive(Debug, Default)]
pub struct NullListener;

impl InetdListener for NullListener {
    fn start(&mut self, key: UnitKey, spec: &InetdSpec) -> io::Result<()> {
        log::debug!("inetd {}: listen {}/{} (no listener backend)", key, spec.service, spec.proto);
        Ok(())
    }

    fn stop(&mut self, key: UnitKey, spec: &InetdSpec) {
        log::debug!("inetd {}: close {}/{} (no listener backend)", key, spec.service, spec.proto);
    }
}

impl Manager {
    /// Find an inetd unit by command and `service/proto`
    pub fn find_inetd(&self, command: &str, service: &str, proto: &str) -> Option<UnitKey> {
        self.registry
            .iter_inetd()
            .find(|(_, u)| u.command() == command && u.inetd().is_some_and(|i| i.matches(service, proto)))
            .map(|(k, _)| k)
    }

    /// Hand an accepted connection to a new connection unit
    ///
    /// For `wait` services the listener is blocked busy and stopped until
    /// the connection unit is gone.
    pub fn accept_connection(&mut self, listener: UnitKey, socket: OwnedFd) -> Result<UnitKey, ManagerError> {
        let parent = self
            .registry
            .get(listener)
            .ok_or(ManagerError::NotFound(listener))?;
        let spec = match parent.inetd() {
            Some(spec) if parent.is_inetd() => spec.clone(),
            _ => return Err(ManagerError::NotInetd(listener)),
        };

        let command = parent.command().to_string();
        let args = parent.args().to_vec();
        let description = parent.description().to_string();
        let user = parent.user().map(str::to_string);
        let group = parent.group().map(str::to_string);
        let runlevels = parent.runlevels();
        let log = parent.log_output();

        let id = self.registry.next_free_id(&command);
        let key = self.registry.create(&command, id, UnitKind::InetdConnection)?;
        if let Some(unit) = self.registry.get_mut(key) {
            unit.args = args;
            unit.description = description;
            unit.user = user;
            unit.group = group;
            unit.runlevels = runlevels;
            unit.log = log;
            unit.connection = Some(Connection {
                parent: listener,
                transport: spec.transport,
                socket: Some(socket),
            });
            unit.inetd = Some(spec.clone());
        }

        log::debug!("inetd {}: new connection {} for {}", listener, key, command);

        // Block the listener before the handler runs, it may finish at once
        if !spec.forking {
            if let Some(unit) = self.registry.get_mut(listener) {
                unit.runtime.set_block(BlockReason::InetdBusy);
            }
            self.step(listener);
        }

        self.step(key);
        Ok(key)
    }

    /// Connection unit finished: release a busy listener
    pub(super) fn finish_connection(&mut self, key: UnitKey) {
        let Some(unit) = self.registry.delete(key) else {
            return;
        };
        log::debug!("inetd connection {} for {} done", key, unit.command());

        let Some(parent) = unit.connection().map(|c| c.parent) else {
            return;
        };
        let busy = self
            .registry
            .get(parent)
            .is_some_and(|p| p.block() == BlockReason::InetdBusy);
        if busy {
            if let Some(listener) = self.registry.get_mut(parent) {
                listener.runtime.set_block(BlockReason::None);
            }
            self.step(parent);
        }
    }
}
