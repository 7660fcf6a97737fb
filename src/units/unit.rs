//! Unit descriptor and its classification types

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::SystemTime;

use crate::manager::{ConfigMark, Runtime, SvcState};
use crate::plugins::BuiltinHandler;
use crate::registry::UnitKey;
use crate::runlevel::Runlevels;

use super::parser::IfaceRule;

/// What kind of unit this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    /// Long-running daemon, respawned when it dies
    Service,
    /// One-shot, runs in parallel with others
    Task,
    /// One-shot, runs to completion before anything else happens
    Run,
    /// Listening inetd service definition
    Inetd,
    /// Transient handler for one accepted inetd connection
    InetdConnection,
}

bitflags::bitflags! {
    /// Set of unit kinds, used to select units for a sweep
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KindMask: u8 {
        const SERVICE = 1 << 0;
        const TASK = 1 << 1;
        const RUN = 1 << 2;
        const INETD = 1 << 3;
        const INETD_CONNECTION = 1 << 4;
    }
}

impl UnitKind {
    /// Parse a configuration keyword (`service`, `task`, `run`, `inetd`)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "service" => Some(Self::Service),
            "task" => Some(Self::Task),
            "run" => Some(Self::Run),
            "inetd" => Some(Self::Inetd),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Task => "task",
            Self::Run => "run",
            Self::Inetd => "inetd",
            Self::InetdConnection => "inetd-conn",
        }
    }

    pub fn mask(self) -> KindMask {
        match self {
            Self::Service => KindMask::SERVICE,
            Self::Task => KindMask::TASK,
            Self::Run => KindMask::RUN,
            Self::Inetd => KindMask::INETD,
            Self::InetdConnection => KindMask::INETD_CONNECTION,
        }
    }

    /// Services and inetd listeners are supposed to stay up
    pub fn is_daemon(self) -> bool {
        matches!(self, Self::Service | Self::Inetd)
    }

    /// Tasks, runs and inetd connections end in DONE
    pub fn is_one_shot(self) -> bool {
        !self.is_daemon()
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a unit is not allowed to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockReason {
    #[default]
    None,
    /// Executable did not exist at start time
    MissingBinary,
    /// Restart ceiling reached
    CrashLooping,
    /// `wait` inetd listener with a connection handler running
    InetdBusy,
    /// Stopped by the operator
    Manual,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::MissingBinary => "missing",
            Self::CrashLooping => "crashing",
            Self::InetdBusy => "busy",
            Self::Manual => "blocked",
        }
    }

    pub fn is_blocked(&self) -> bool {
        *self != Self::None
    }
}

/// Socket transport of an inetd service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// tcp
    Stream,
    /// udp
    Datagram,
}

impl Transport {
    pub fn from_proto(proto: &str) -> Option<Self> {
        match proto.to_lowercase().as_str() {
            "tcp" | "tcp6" => Some(Self::Stream),
            "udp" | "udp6" => Some(Self::Datagram),
            _ => None,
        }
    }
}

/// Listener side of an inetd unit
#[derive(Debug, Clone)]
pub struct InetdSpec {
    /// Service name, or plugin name for built-in handlers
    pub name: String,
    /// Service from `service/proto`, a name or a port number
    pub service: String,
    pub proto: String,
    pub transport: Transport,
    /// `nowait`: one handler per connection, listener stays open
    pub forking: bool,
    /// Interfaces to accept connections on; empty means any
    pub allow: Vec<String>,
    /// Interfaces to never accept connections on
    pub deny: Vec<String>,
    pub builtin: Option<BuiltinHandler>,
}

impl InetdSpec {
    /// Same service and protocol
    pub fn matches(&self, service: &str, proto: &str) -> bool {
        self.service == service && self.proto.eq_ignore_ascii_case(proto)
    }

    /// Replace interface filters
    pub fn set_filters(&mut self, rules: &[IfaceRule]) {
        self.allow.clear();
        self.deny.clear();
        for rule in rules {
            match rule {
                IfaceRule::Allow(name) => self.allow.push(name.clone()),
                IfaceRule::Deny(name) => self.deny.push(name.clone()),
            }
        }
    }

    /// Should a connection arriving on `iface` be accepted
    pub fn permits(&self, iface: &str) -> bool {
        if self.deny.iter().any(|d| d == iface) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|a| a == iface)
    }
}

/// Per-connection state of an inetd connection unit
#[derive(Debug)]
pub struct Connection {
    /// Listening unit this connection was accepted on
    pub parent: UnitKey,
    pub transport: Transport,
    /// Accepted socket; released in the parent after fork for streams
    pub socket: Option<OwnedFd>,
}

impl Connection {
    pub fn raw_socket(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }
}

/// A managed service, task, run or inetd unit
#[derive(Debug)]
pub struct Unit {
    pub(crate) command: String,
    pub(crate) id: u32,
    pub(crate) kind: UnitKind,
    /// Full argument vector, `args[0]` is the command
    pub(crate) args: Vec<String>,
    pub(crate) description: String,
    pub(crate) runlevels: Runlevels,
    pub(crate) user: Option<String>,
    pub(crate) group: Option<String>,
    /// Supports SIGHUP reload instead of stop/start
    pub(crate) sighup: bool,
    /// Capture output to syslog
    pub(crate) log: bool,
    pub(crate) conditions: Vec<String>,
    pub(crate) mtime: Option<SystemTime>,
    pub(crate) inetd: Option<InetdSpec>,
    pub(crate) connection: Option<Connection>,
    pub(crate) runtime: Runtime,
}

impl Unit {
    pub(crate) fn new(command: &str, id: u32, kind: UnitKind) -> Self {
        Self {
            command: command.to_string(),
            id,
            kind,
            args: vec![command.to_string()],
            description: String::new(),
            runlevels: Runlevels::parse(None),
            user: None,
            group: None,
            sighup: true,
            log: false,
            conditions: Vec::new(),
            mtime: None,
            inetd: None,
            connection: None,
            runtime: Runtime::default(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Description, or the command if there is none
    pub fn name(&self) -> &str {
        if self.description.is_empty() {
            &self.command
        } else {
            &self.description
        }
    }

    pub fn runlevels(&self) -> Runlevels {
        self.runlevels
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn accepts_reload_signal(&self) -> bool {
        self.sighup
    }

    pub fn log_output(&self) -> bool {
        self.log
    }

    pub fn conditions(&self) -> &[String] {
        &self.conditions
    }

    pub fn mtime(&self) -> Option<SystemTime> {
        self.mtime
    }

    pub fn inetd(&self) -> Option<&InetdSpec> {
        self.inetd.as_ref()
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn is_inetd(&self) -> bool {
        self.kind == UnitKind::Inetd
    }

    pub fn is_inetd_connection(&self) -> bool {
        self.kind == UnitKind::InetdConnection
    }

    /// Built-in inetd handler, in place of an executable
    pub fn builtin(&self) -> Option<BuiltinHandler> {
        self.inetd.as_ref().and_then(|i| i.builtin)
    }

    pub fn state(&self) -> SvcState {
        self.runtime.state()
    }

    pub fn pid(&self) -> i32 {
        self.runtime.pid()
    }

    pub fn restart_count(&self) -> u32 {
        self.runtime.restart_count()
    }

    pub fn block(&self) -> BlockReason {
        self.runtime.block()
    }

    pub fn config_mark(&self) -> ConfigMark {
        self.runtime.config_mark()
    }

    pub fn is_dirty(&self) -> bool {
        self.runtime.config_mark() == ConfigMark::Dirty
    }

    pub fn is_removed(&self) -> bool {
        self.runtime.config_mark() == ConfigMark::Removed
    }

    pub fn awaiting_pidfile(&self) -> bool {
        self.runtime.awaiting_pidfile()
    }
}
