//! Unit registration from declaration lines

use std::time::SystemTime;

use nix::errno::Errno;

use super::{Manager, ManagerError};
use crate::registry::{RegistryError, UnitKey};
use crate::units::{Declaration, InetdSpec, ParseError, Transport, UnitKind};

/// Command name selecting a built-in inetd handler: `internal[.name]`
const INTERNAL: &str = "internal";

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("Invalid declaration: {0}")]
    Parse(#[from] ParseError),

    #[error("Inetd service requires service/proto")]
    MissingService,

    #[error("Unsupported inetd protocol: {0}")]
    UnknownProtocol(String),

    #[error("Units of kind {0} cannot be declared")]
    InvalidKind(UnitKind),

    #[error("No internal inetd handler named {0}")]
    NoPlugin(String),

    #[error("Out of memory, cannot register {0}")]
    OutOfMemory(String),
}

impl RegisterError {
    /// errno equivalent, for callers reporting to a control client
    pub fn errno(&self) -> Errno {
        match self {
            Self::Parse(_) | Self::MissingService | Self::UnknownProtocol(_) | Self::InvalidKind(_) => Errno::EINVAL,
            Self::NoPlugin(_) => Errno::ENOENT,
            Self::OutOfMemory(_) => Errno::ENOMEM,
        }
    }
}

impl Manager {
    /// Register or update a unit from a declaration line
    ///
    /// The same `(command, id)` declared again updates the existing unit;
    /// it is marked dirty only when `mtime` differs from the last
    /// registration. `default_user` applies when the line names no user.
    pub fn register(
        &mut self,
        kind: UnitKind,
        line: &str,
        mtime: Option<SystemTime>,
        default_user: Option<&str>,
    ) -> Result<UnitKey, RegisterError> {
        if kind == UnitKind::InetdConnection {
            return Err(RegisterError::InvalidKind(kind));
        }

        let decl = Declaration::parse(line)?;
        let mut command = decl.command.clone();
        let mut id = decl.id.unwrap_or(1);
        let mut inetd = None;

        if kind == UnitKind::Inetd {
            let inet = decl.inet.as_ref().ok_or(RegisterError::MissingService)?;
            let transport =
                Transport::from_proto(&inet.proto).ok_or_else(|| RegisterError::UnknownProtocol(inet.proto.clone()))?;

            let mut name = inet.service.clone();
            let mut builtin = None;
            if let Some(rest) = decl.command.strip_prefix(INTERNAL) {
                if rest.is_empty() || rest.starts_with('.') {
                    if let Some(plugin) = rest.strip_prefix('.') {
                        name = plugin.to_string();
                    }
                    command = INTERNAL.to_string();
                    builtin = Some(
                        self.host
                            .plugins
                            .inetd_handler(&name)
                            .ok_or_else(|| RegisterError::NoPlugin(name.clone()))?,
                    );
                }
            }

            // Same service declared again: only the interface filters change
            if let Some(key) = self.find_inetd(&command, &inet.service, &inet.proto) {
                if let Some(unit) = self.registry.get_mut(key) {
                    if let Some(spec) = unit.inetd.as_mut() {
                        spec.set_filters(&inet.ifaces);
                        spec.forking = decl.forking;
                    }
                    let old = unit.mtime;
                    unit.mtime = mtime;
                    unit.runtime.check_dirty(old, mtime);
                }
                log::debug!("Updated inetd {}/{} for {}", inet.service, inet.proto, command);
                return Ok(key);
            }

            let mut spec = InetdSpec {
                name,
                service: inet.service.clone(),
                proto: inet.proto.clone(),
                transport,
                forking: decl.forking,
                allow: Vec::new(),
                deny: Vec::new(),
                builtin,
            };
            spec.set_filters(&inet.ifaces);
            inetd = Some(spec);
            id = self.registry.next_free_id(&command);
        }

        let key = match self.registry.find(&command, id) {
            Some(key) if self.registry.get(key).is_some_and(|u| u.kind() != kind) => {
                log::debug!("{} changed kind, recreating", command);
                self.drop_unit(key);
                self.create_unit(&command, id, kind)?
            }
            Some(key) => key,
            None => self.create_unit(&command, id, kind)?,
        };

        let Some(unit) = self.registry.get_mut(key) else {
            return Err(RegisterError::OutOfMemory(command));
        };

        unit.args = if inetd.as_ref().is_some_and(|i| i.builtin.is_some()) {
            vec![command.clone()]
        } else {
            decl.args
        };
        unit.description = decl.description.unwrap_or_default();
        unit.user = decl.user.or_else(|| default_user.map(str::to_string));
        unit.group = decl.group;
        unit.runlevels = decl.runlevels;
        unit.conditions = decl.conditions;
        unit.sighup = decl.sighup;
        unit.log = decl.log;
        if inetd.is_some() {
            unit.inetd = inetd;
        }

        let old = unit.mtime;
        unit.mtime = mtime;
        unit.runtime.check_dirty(old, mtime);

        log::debug!("Registered {} {} id #{} as {}", kind, command, id, key);
        Ok(key)
    }

    fn create_unit(&mut self, command: &str, id: u32, kind: UnitKind) -> Result<UnitKey, RegisterError> {
        self.registry.create(command, id, kind).map_err(|RegistryError::Full(_)| {
            log::error!("Out of memory, cannot register {}", command);
            RegisterError::OutOfMemory(command.to_string())
        })
    }

    /// Remove a unit, stopping whatever still runs for it
    pub fn unregister(&mut self, key: UnitKey) -> Result<(), ManagerError> {
        if self.registry.get(key).is_none() {
            return Err(ManagerError::NotFound(key));
        }
        self.drop_unit(key);
        Ok(())
    }

    fn drop_unit(&mut self, key: UnitKey) {
        let Some(unit) = self.registry.get(key) else {
            return;
        };
        log::debug!("Unregistering {} {}", unit.kind(), unit.name());

        if unit.is_inetd() || unit.pid() > 1 {
            let _ = self.host.stop(key, unit);
        }
        self.registry.delete(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(RegisterError::Parse(ParseError::Empty).errno(), Errno::EINVAL);
        assert_eq!(RegisterError::NoPlugin("time".into()).errno(), Errno::ENOENT);
        assert_eq!(RegisterError::OutOfMemory("/bin/x".into()).errno(), Errno::ENOMEM);
        assert_eq!(RegisterError::UnknownProtocol("sctp".into()).errno(), Errno::EINVAL);
    }
}
