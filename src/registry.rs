//! Unit registry
//!
//! Owns all unit descriptors. Iteration follows insertion order, which keeps
//! sweeps over the registry stable.

use std::collections::BTreeMap;
use std::fmt;

use crate::units::{Unit, UnitKind};

/// Stable handle to a registered unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitKey(u64);

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Registry full ({0} units)")]
    Full(usize),
}

#[derive(Debug)]
pub struct Registry {
    units: BTreeMap<UnitKey, Unit>,
    next: u64,
    capacity: usize,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            units: BTreeMap::new(),
            next: 1,
            capacity,
        }
    }

    /// Create a new descriptor for `(command, id)`
    pub fn create(&mut self, command: &str, id: u32, kind: UnitKind) -> Result<UnitKey, RegistryError> {
        if self.units.len() >= self.capacity {
            return Err(RegistryError::Full(self.capacity));
        }

        let key = UnitKey(self.next);
        self.next += 1;
        log::debug!("Creating new unit {} for {} id #{} kind {}", key, command, id, kind);
        self.units.insert(key, Unit::new(command, id, kind));
        Ok(key)
    }

    pub fn delete(&mut self, key: UnitKey) -> Option<Unit> {
        self.units.remove(&key)
    }

    pub fn get(&self, key: UnitKey) -> Option<&Unit> {
        self.units.get(&key)
    }

    pub fn get_mut(&mut self, key: UnitKey) -> Option<&mut Unit> {
        self.units.get_mut(&key)
    }

    pub fn find(&self, command: &str, id: u32) -> Option<UnitKey> {
        self.units
            .iter()
            .find(|(_, u)| u.command() == command && u.id() == id)
            .map(|(k, _)| *k)
    }

    /// Unit owning a live process
    pub fn find_by_pid(&self, pid: i32) -> Option<UnitKey> {
        if pid <= 0 {
            return None;
        }
        self.units.iter().find(|(_, u)| u.pid() == pid).map(|(k, _)| *k)
    }

    /// Next unused instance id for a command (highest id + 1)
    pub fn next_free_id(&self, command: &str) -> u32 {
        self.units
            .values()
            .filter(|u| u.command() == command)
            .map(|u| u.id())
            .max()
            .map_or(1, |id| id + 1)
    }

    /// Snapshot of all keys, in insertion order
    pub fn keys(&self) -> Vec<UnitKey> {
        self.units.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (UnitKey, &Unit)> {
        self.units.iter().map(|(k, u)| (*k, u))
    }

    /// Listening inetd units only
    pub fn iter_inetd(&self) -> impl Iterator<Item = (UnitKey, &Unit)> {
        self.iter().filter(|(_, u)| u.is_inetd())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_find() {
        let mut reg = Registry::new(16);
        let a = reg.create("/sbin/udhcpc", 1, UnitKind::Service).unwrap();
        let b = reg.create("/sbin/udhcpc", 2, UnitKind::Service).unwrap();

        assert_eq!(reg.find("/sbin/udhcpc", 1), Some(a));
        assert_eq!(reg.find("/sbin/udhcpc", 2), Some(b));
        assert_eq!(reg.find("/sbin/udhcpc", 3), None);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_next_free_id() {
        let mut reg = Registry::new(16);
        assert_eq!(reg.next_free_id("/usr/sbin/sshd"), 1);
        reg.create("/usr/sbin/sshd", 1, UnitKind::Inetd).unwrap();
        reg.create("/usr/sbin/sshd", 4, UnitKind::Inetd).unwrap();
        assert_eq!(reg.next_free_id("/usr/sbin/sshd"), 5);
    }

    #[test]
    fn test_insertion_order_is_stable() {
        let mut reg = Registry::new(16);
        let keys: Vec<_> = ["/c", "/a", "/b"]
            .iter()
            .map(|c| reg.create(c, 1, UnitKind::Task).unwrap())
            .collect();
        assert_eq!(reg.keys(), keys);

        reg.delete(keys[1]);
        let cmds: Vec<_> = reg.iter().map(|(_, u)| u.command().to_string()).collect();
        assert_eq!(cmds, vec!["/c", "/b"]);
    }

    #[test]
    fn test_capacity() {
        let mut reg = Registry::new(1);
        reg.create("/a", 1, UnitKind::Task).unwrap();
        assert_eq!(reg.create("/b", 1, UnitKind::Task), Err(RegistryError::Full(1)));
    }

    #[test]
    fn test_find_by_pid_ignores_zero() {
        let mut reg = Registry::new(4);
        reg.create("/a", 1, UnitKind::Service).unwrap();
        assert_eq!(reg.find_by_pid(0), None);
    }
}
