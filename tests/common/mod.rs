//! Shared test harness: a backend that records instead of forking

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use svinit::conditions::ConditionStore;
use svinit::manager::{GettyRequest, LaunchError, LaunchRequest, Manager, ProcessControl, Spawned, Spawner};
use svinit::Config;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

pub fn unique_test_dir() -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = PathBuf::from(format!("/tmp/svinit-test-{}-{}", std::process::id(), id));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Something the fake backend was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Spawn { pid: i32, command: String, args: Vec<String>, user: Option<String> },
    Getty { pid: i32, device: PathBuf },
    Shell { pid: i32 },
    Terminate(i32),
    Reload(i32),
    Suspend(i32),
    Resume(i32),
    Kill(i32),
    TerminateAndWait(i32),
    SessionEnded(i32),
}

#[derive(Debug)]
pub struct FakeState {
    pub events: Vec<Event>,
    pub next_pid: i32,
    /// Executables reported as missing
    pub missing: HashSet<String>,
    /// Every spawn fails
    pub fail_spawns: bool,
    /// Exit status of run-to-completion units
    pub run_status: i32,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            next_pid: 100,
            missing: HashSet::new(),
            fail_spawns: false,
            run_status: 0,
        }
    }
}

impl FakeState {
    fn alloc_pid(&mut self) -> i32 {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    pub fn spawned(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Spawn { command, .. } => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }
}

/// Backend handle; clones share state so tests can inspect it after the
/// manager took ownership
#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    pub state: Rc<RefCell<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    pub fn clear(&self) {
        self.state.borrow_mut().events.clear();
    }

    pub fn set_missing(&self, command: &str) {
        self.state.borrow_mut().missing.insert(command.to_string());
    }

    pub fn set_fail_spawns(&self, fail: bool) {
        self.state.borrow_mut().fail_spawns = fail;
    }

    fn record(&self, event: Event) {
        self.state.borrow_mut().events.push(event);
    }
}

impl ProcessControl for FakeBackend {
    fn terminate(&mut self, pid: i32) -> nix::Result<()> {
        self.record(Event::Terminate(pid));
        Ok(())
    }

    fn reload(&mut self, pid: i32) -> nix::Result<()> {
        self.record(Event::Reload(pid));
        Ok(())
    }

    fn suspend(&mut self, pid: i32) -> nix::Result<()> {
        self.record(Event::Suspend(pid));
        Ok(())
    }

    fn resume(&mut self, pid: i32) -> nix::Result<()> {
        self.record(Event::Resume(pid));
        Ok(())
    }

    fn kill(&mut self, pid: i32) -> nix::Result<()> {
        self.record(Event::Kill(pid));
        Ok(())
    }

    fn terminate_and_wait(&mut self, pid: i32, _grace: Duration) {
        self.record(Event::TerminateAndWait(pid));
    }
}

impl Spawner for FakeBackend {
    fn executable_exists(&self, path: &str) -> bool {
        !self.state.borrow().missing.contains(path)
    }

    fn spawn(&mut self, req: &LaunchRequest<'_>, started: &mut dyn FnMut(i32)) -> Result<Spawned, LaunchError> {
        if self.state.borrow().fail_spawns {
            return Err(LaunchError::Fork(nix::errno::Errno::EAGAIN));
        }

        let pid = self.state.borrow_mut().alloc_pid();
        self.record(Event::Spawn {
            pid,
            command: req.command.to_string(),
            args: req.args.to_vec(),
            user: req.user.map(str::to_string),
        });
        started(pid);

        if req.wait {
            let status = self.state.borrow().run_status;
            Ok(Spawned::Completed { pid, status })
        } else {
            Ok(Spawned::Detached(pid))
        }
    }

    fn spawn_getty(&mut self, req: &GettyRequest<'_>) -> Result<i32, LaunchError> {
        let pid = self.state.borrow_mut().alloc_pid();
        self.record(Event::Getty {
            pid,
            device: req.device.to_path_buf(),
        });
        Ok(pid)
    }

    fn spawn_shell(&mut self, _shell: &Path) -> Result<i32, LaunchError> {
        let pid = self.state.borrow_mut().alloc_pid();
        self.record(Event::Shell { pid });
        Ok(pid)
    }

    fn session_ended(&mut self, pid: i32) {
        self.record(Event::SessionEnded(pid));
    }
}

/// Config pointing every path into a private directory
pub fn test_config(dir: &Path) -> Config {
    Config {
        runtime_dir: dir.to_path_buf(),
        norespawn_files: vec![dir.join("norespawn")],
        ..Default::default()
    }
}

/// Manager with a fake backend and a shared condition store
pub fn manager() -> (Manager, FakeBackend, Rc<RefCell<ConditionStore>>, PathBuf) {
    let dir = unique_test_dir();
    manager_with(test_config(&dir), dir)
}

pub fn manager_with(config: Config, dir: PathBuf) -> (Manager, FakeBackend, Rc<RefCell<ConditionStore>>, PathBuf) {
    let backend = FakeBackend::new();
    let conditions = Rc::new(RefCell::new(ConditionStore::new()));
    let mgr = Manager::new(config, Box::new(backend.clone())).with_conditions(Box::new(Rc::clone(&conditions)));
    (mgr, backend, conditions, dir)
}
