//! Supervisor configuration: fixed paths and limits

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum number of arguments (including the command) in a declaration
pub const MAX_ARGS: usize = 32;

/// Maximum length of a single argument
pub const MAX_ARG_LEN: usize = 64;

/// Consecutive unclean restarts before a unit is considered crash-looping
pub const RESPAWN_MAX: u32 = 10;

/// How chatty the supervisor is, and where unlogged child output goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// No progress messages
    Silent,
    #[default]
    Normal,
    /// Progress messages, child output sent to the console
    Verbose,
    /// Like verbose, plus per-launch command lines
    Debug,
}

impl OutputMode {
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Silent)
    }

    /// Child stdout/stderr go to the console when not captured
    pub fn use_console(&self) -> bool {
        matches!(self, Self::Verbose | Self::Debug)
    }
}

/// Paths and limits used by the supervisor
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `<basename>.pid` files
    pub runtime_dir: PathBuf,
    /// Any of these existing suspends all starts and restarts
    pub norespawn_files: Vec<PathBuf>,
    /// System console, for child output in verbose mode
    pub console: PathBuf,
    /// PATH given to children that drop root privileges
    pub default_path: String,
    /// Fallback directory for TTY device names
    pub device_dir: PathBuf,
    /// Program spawned on each TTY
    pub getty: PathBuf,
    /// Line logger fed by captured output (looked up in PATH)
    pub logger: String,
    /// Shell started when no TTY is active; `None` disables it
    pub fallback_shell: Option<PathBuf>,
    /// Time between SIGTERM and SIGKILL when stopping a TTY
    pub tty_grace: Duration,
    /// Maximum number of registered units
    pub max_units: usize,
    pub output: OutputMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from("/run"),
            norespawn_files: vec![
                PathBuf::from("/mnt/norespawn"),
                PathBuf::from("/tmp/norespawn"),
            ],
            console: PathBuf::from("/dev/console"),
            default_path: "/usr/bin:/bin".to_string(),
            device_dir: PathBuf::from("/dev"),
            getty: PathBuf::from("/sbin/getty"),
            logger: "logger".to_string(),
            fallback_shell: None,
            tty_grace: Duration::from_secs(2),
            max_units: 1024,
            output: OutputMode::Normal,
        }
    }
}

impl Config {
    /// Pidfile path for a command: `<runtime_dir>/<basename>.pid`
    pub fn pidfile(&self, command: &str) -> PathBuf {
        let base = Path::new(command)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| command.to_string());
        self.runtime_dir.join(format!("{}.pid", base))
    }

    /// True if a norespawn flag file exists
    pub fn norespawn_flagged(&self) -> bool {
        self.norespawn_files.iter().any(|p| p.exists())
    }
}
