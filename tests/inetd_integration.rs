//! Integration tests for inetd units and connection handling

mod common;

use std::cell::RefCell;
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use common::{manager, Event};
use svinit::manager::InetdListener;
use svinit::plugins::PluginTable;
use svinit::units::{InetdSpec, Transport};
use svinit::{BlockReason, ManagerError, Runlevel, SvcState, UnitKey, UnitKind};

#[derive(Debug, Clone, PartialEq, Eq)]
enum ListenEvent {
    Start(String),
    Stop(String),
}

#[derive(Clone, Default)]
struct FakeListener {
    events: Rc<RefCell<Vec<ListenEvent>>>,
}

impl InetdListener for FakeListener {
    fn start(&mut self, _key: UnitKey, spec: &InetdSpec) -> io::Result<()> {
        self.events
            .borrow_mut()
            .push(ListenEvent::Start(format!("{}/{}", spec.service, spec.proto)));
        Ok(())
    }

    fn stop(&mut self, _key: UnitKey, spec: &InetdSpec) {
        self.events
            .borrow_mut()
            .push(ListenEvent::Stop(format!("{}/{}", spec.service, spec.proto)));
    }
}

fn socket() -> OwnedFd {
    OwnedFd::from(File::open("/dev/null").unwrap())
}

fn time_handler(_t: Transport) -> i32 {
    0
}

#[test]
fn test_listener_opened_in_runlevel() {
    let listener = FakeListener::default();
    let (mgr, backend, _conds, _dir) = manager();
    let mut mgr = mgr.with_inetd_listener(Box::new(listener.clone()));

    let key = mgr
        .register(UnitKind::Inetd, "ssh/tcp nowait [2345] /usr/sbin/sshd -i -- SSH", None, None)
        .unwrap();
    mgr.set_runlevel(Runlevel::Level(2));

    let unit = mgr.unit(key).unwrap();
    assert_eq!(unit.state(), SvcState::Running);
    assert_eq!(unit.pid(), 0);
    assert_eq!(*listener.events.borrow(), vec![ListenEvent::Start("ssh/tcp".to_string())]);
    assert!(backend.events().is_empty());
}

#[test]
fn test_nowait_connection_leaves_listener_open() {
    let listener = FakeListener::default();
    let (mgr, backend, _conds, _dir) = manager();
    let mut mgr = mgr.with_inetd_listener(Box::new(listener.clone()));
    let key = mgr
        .register(UnitKind::Inetd, "ssh/tcp nowait [2345] /usr/sbin/sshd -i", None, None)
        .unwrap();
    mgr.set_runlevel(Runlevel::Level(2));

    let conn = mgr.accept_connection(key, socket()).unwrap();
    let unit = mgr.unit(conn).unwrap();
    assert_eq!(unit.kind(), UnitKind::InetdConnection);
    assert_eq!(unit.state(), SvcState::Stopping);
    assert!(unit.connection().unwrap().socket.is_none());
    let pid = unit.pid();
    assert!(pid > 0);
    assert_eq!(backend.state.borrow().spawned(), vec!["/usr/sbin/sshd".to_string()]);

    assert_eq!(mgr.unit(key).unwrap().state(), SvcState::Running);
    assert_eq!(mgr.unit(key).unwrap().block(), BlockReason::None);

    mgr.notify_process_exit(pid).unwrap();
    assert!(mgr.unit(conn).is_none());
    assert_eq!(listener.events.borrow().len(), 1);
}

#[test]
fn test_wait_connection_blocks_listener() {
    let listener = FakeListener::default();
    let (mgr, _backend, _conds, _dir) = manager();
    let mut mgr = mgr.with_inetd_listener(Box::new(listener.clone()));
    let key = mgr
        .register(UnitKind::Inetd, "tftp/udp wait [2345] /usr/sbin/tftpd", None, None)
        .unwrap();
    mgr.set_runlevel(Runlevel::Level(2));

    let conn = mgr.accept_connection(key, socket()).unwrap();
    let parent = mgr.unit(key).unwrap();
    assert_eq!(parent.block(), BlockReason::InetdBusy);
    assert_eq!(parent.state(), SvcState::Halted);
    assert_eq!(
        *listener.events.borrow(),
        vec![
            ListenEvent::Start("tftp/udp".to_string()),
            ListenEvent::Stop("tftp/udp".to_string()),
        ]
    );

    // Datagram sockets stay with the connection unit until it is gone
    assert!(mgr.unit(conn).unwrap().connection().unwrap().socket.is_some());

    let pid = mgr.unit(conn).unwrap().pid();
    mgr.notify_process_exit(pid).unwrap();

    assert!(mgr.unit(conn).is_none());
    let parent = mgr.unit(key).unwrap();
    assert_eq!(parent.block(), BlockReason::None);
    assert_eq!(parent.state(), SvcState::Running);
    assert_eq!(listener.events.borrow().len(), 3);
}

#[test]
fn test_failed_connection_handler_is_cleaned_up() {
    let listener = FakeListener::default();
    let (mgr, backend, _conds, _dir) = manager();
    let mut mgr = mgr.with_inetd_listener(Box::new(listener.clone()));
    let key = mgr
        .register(UnitKind::Inetd, "tftp/udp wait [2345] /usr/sbin/tftpd", None, None)
        .unwrap();
    mgr.set_runlevel(Runlevel::Level(2));

    backend.set_fail_spawns(true);
    let conn = mgr.accept_connection(key, socket()).unwrap();

    assert!(mgr.unit(conn).is_none());
    let parent = mgr.unit(key).unwrap();
    assert_eq!(parent.block(), BlockReason::None);
    assert_eq!(parent.state(), SvcState::Running);
}

#[test]
fn test_internal_handler_lookup() {
    let mut plugins = PluginTable::new();
    plugins.add_inetd("time", time_handler);

    let (mgr, backend, _conds, _dir) = manager();
    let mut mgr = mgr.with_plugins(Box::new(plugins));
    backend.set_missing("internal");

    let key = mgr
        .register(UnitKind::Inetd, "time/udp wait [2345] internal", None, None)
        .unwrap();
    let unit = mgr.unit(key).unwrap();
    assert_eq!(unit.command(), "internal");
    assert!(unit.builtin().is_some());
    assert_eq!(unit.inetd().unwrap().name, "time");

    // Built-ins need no executable
    mgr.set_runlevel(Runlevel::Level(2));
    assert_eq!(mgr.unit(key).unwrap().state(), SvcState::Running);

    let err = mgr
        .register(UnitKind::Inetd, "daytime/tcp nowait [2345] internal.daytime", None, None)
        .unwrap_err();
    assert_eq!(err.errno(), nix::errno::Errno::ENOENT);
}

#[test]
fn test_reregistration_updates_filters() {
    let (mut mgr, _backend, _conds, _dir) = manager();
    let a = mgr
        .register(UnitKind::Inetd, "ssh/tcp@eth0 nowait [2345] /usr/sbin/sshd -i", None, None)
        .unwrap();
    let b = mgr
        .register(UnitKind::Inetd, "ssh/tcp@!eth1 nowait [2345] /usr/sbin/sshd -i", None, None)
        .unwrap();

    assert_eq!(a, b);
    assert_eq!(mgr.units().count(), 1);
    let spec = mgr.unit(a).unwrap().inetd().unwrap();
    assert!(spec.permits("eth0"));
    assert!(spec.permits("eth2"));
    assert!(!spec.permits("eth1"));

    // Another port for the same command is a separate instance
    let c = mgr
        .register(UnitKind::Inetd, "2222/tcp nowait [2345] /usr/sbin/sshd -i", None, None)
        .unwrap();
    assert_ne!(a, c);
    assert_eq!(mgr.unit(c).unwrap().id(), 2);
}

#[test]
fn test_inetd_requires_service() {
    let (mut mgr, _backend, _conds, _dir) = manager();
    let err = mgr
        .register(UnitKind::Inetd, "[2345] /usr/sbin/sshd -i", None, None)
        .unwrap_err();
    assert_eq!(err.errno(), nix::errno::Errno::EINVAL);

    let err = mgr
        .register(UnitKind::Inetd, "ssh/sctp nowait /usr/sbin/sshd -i", None, None)
        .unwrap_err();
    assert_eq!(err.errno(), nix::errno::Errno::EINVAL);
}

#[test]
fn test_accept_on_non_inetd_unit() {
    let (mut mgr, _backend, _conds, _dir) = manager();
    let key = mgr.register(UnitKind::Service, "[2] /sbin/daemon", None, None).unwrap();
    assert!(matches!(
        mgr.accept_connection(key, socket()),
        Err(ManagerError::NotInetd(_))
    ));
}

#[test]
fn test_listener_closed_when_disabled() {
    let listener = FakeListener::default();
    let (mgr, backend, _conds, _dir) = manager();
    let mut mgr = mgr.with_inetd_listener(Box::new(listener.clone()));
    let key = mgr
        .register(UnitKind::Inetd, "ssh/tcp nowait [2] /usr/sbin/sshd -i", None, None)
        .unwrap();
    mgr.set_runlevel(Runlevel::Level(2));
    mgr.set_runlevel(Runlevel::Level(3));

    assert_eq!(mgr.unit(key).unwrap().state(), SvcState::Halted);
    assert_eq!(listener.events.borrow().last(), Some(&ListenEvent::Stop("ssh/tcp".to_string())));
    assert!(!backend.events().iter().any(|e| matches!(e, Event::Terminate(_))));
}
