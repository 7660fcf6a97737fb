//! svinit - supervisor daemon
//!
//! Loads the configuration, runs the bootstrap runlevel, enters the default
//! runlevel and then reacts to signals:
//!
//! - SIGCHLD: reap children and collect units
//! - SIGHUP: reload configuration
//! - SIGTSTP/SIGCONT: suspend/resume respawning
//! - SIGUSR1: dump unit status
//! - SIGTERM/SIGINT: enter runlevel 0 and exit

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::info;

use svinit::conf::{self, ConfFile};
use svinit::manager::{Manager, SystemBackend};
use svinit::pid1::{self, InitSignal, SignalHandler};
use svinit::units::parse_cmdline;
use svinit::{Config, OutputMode, Runlevel};

/// How long to wait for units to stop on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "svinit")]
#[command(about = "Minimal init process supervisor")]
struct Args {
    /// Main configuration file
    #[arg(long, short = 'c', default_value = "/etc/svinit.conf")]
    config: PathBuf,

    /// Directory with additional *.conf files
    #[arg(long, default_value = "/etc/svinit.d")]
    include_dir: PathBuf,

    /// Runlevel to enter after bootstrap (overrides `runlevel` in the config)
    #[arg(long, short = 'r')]
    runlevel: Option<u8>,

    /// Directory for pidfiles
    #[arg(long, default_value = "/run")]
    runtime_dir: PathBuf,

    /// getty program for TTYs
    #[arg(long, default_value = "/sbin/getty")]
    getty: PathBuf,

    /// Shell started on the console when no TTY is active
    #[arg(long)]
    fallback_shell: Option<PathBuf>,

    /// User for units that name none
    #[arg(long)]
    default_user: Option<String>,

    /// Add TTYs for kernel console= parameters
    #[arg(long)]
    console_ttys: bool,

    /// No progress messages
    #[arg(long, short = 'q', conflicts_with_all = ["verbose", "debug"])]
    quiet: bool,

    /// Send child output to the console
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Log command lines of started units
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Parse a configuration file and print the units it declares
    Check {
        file: PathBuf,
    },
}

impl Args {
    fn to_config(&self) -> Config {
        let output = if self.quiet {
            OutputMode::Silent
        } else if self.debug {
            OutputMode::Debug
        } else if self.verbose {
            OutputMode::Verbose
        } else {
            OutputMode::Normal
        };

        Config {
            runtime_dir: self.runtime_dir.clone(),
            getty: self.getty.clone(),
            fallback_shell: self.fallback_shell.clone(),
            output,
            ..Default::default()
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Some(Command::Check { file }) = &args.command {
        return check(file, &args.to_config());
    }

    if pid1::is_pid1() {
        info!("Running as PID 1");
    }

    // Signal streams must exist before the first fork, or early SIGCHLDs are lost
    let mut signals = SignalHandler::new()?.spawn_forwarder();

    let mut mgr = Manager::new(args.to_config(), Box::new(SystemBackend::new()));
    let configured = read_config(&args).and_then(|files| apply_config(&mut mgr, &args, &files));
    let default_level = default_runlevel(&args, configured);

    if args.console_ttys {
        add_console_ttys(&mut mgr);
    }

    mgr.bootstrap();
    reap(&mut mgr);
    mgr.set_runlevel(default_level);

    while let Some(sig) = signals.recv().await {
        match sig {
            InitSignal::Child => reap(&mut mgr),
            InitSignal::Hup => {
                info!("Received SIGHUP, reloading configuration");
                match read_config(&args) {
                    Some(files) => {
                        mgr.begin_reload();
                        apply_config(&mut mgr, &args, &files);
                        mgr.reload();
                    }
                    None => log::warn!("Keeping current configuration"),
                }
            }
            InitSignal::Tstp => mgr.set_suspended(true),
            InitSignal::Cont => mgr.set_suspended(false),
            InitSignal::Usr1 => dump_status(&mgr),
            InitSignal::Term | InitSignal::Int => {
                info!("Received {:?}, stopping all units", sig);
                shutdown(&mut mgr, &mut signals).await;
                break;
            }
        }
    }

    Ok(())
}

/// Read the main file and the include directory
///
/// `None` leaves the manager untouched: a config that cannot be read must
/// not cause running units to be torn down.
fn read_config(args: &Args) -> Option<Vec<ConfFile>> {
    match conf::load(&args.config, Some(&args.include_dir)) {
        Ok(files) => Some(files),
        Err(e) => {
            log::error!("Failed to load configuration: {}", e);
            None
        }
    }
}

/// Register everything read, returning the configured runlevel
fn apply_config(mgr: &mut Manager, args: &Args, files: &[ConfFile]) -> Option<Runlevel> {
    let report = conf::apply(mgr, files, args.default_user.as_deref());
    info!(
        "Loaded {} units and {} TTYs from {} files ({} failed)",
        report.registered,
        report.ttys,
        files.len(),
        report.failed
    );
    report.runlevel
}

/// Runlevel to enter after bootstrap: command line, then config, then 2
fn default_runlevel(args: &Args, configured: Option<Runlevel>) -> Runlevel {
    args.runlevel
        .and_then(|n| Runlevel::parse(&n.to_string()))
        .or(configured)
        .unwrap_or(Runlevel::Level(2))
}

fn add_console_ttys(mgr: &mut Manager) {
    match std::fs::read_to_string("/proc/cmdline") {
        Ok(cmdline) => {
            for console in parse_cmdline(&cmdline) {
                info!("Adding TTY for console={}", console.tty);
                mgr.register_tty_decl(console.to_decl());
            }
        }
        Err(e) => log::warn!("Failed to read kernel command line: {}", e),
    }
}

fn reap(mgr: &mut Manager) {
    for child in pid1::reap_children() {
        if let Err(e) = mgr.notify_process_exit(child.pid) {
            log::debug!("{} ({:?})", e, child.status);
        }
    }
}

fn dump_status(mgr: &Manager) {
    info!("Runlevel {}, {} units", mgr.runlevel(), mgr.units().count());
    for (key, unit) in mgr.units() {
        info!(
            "  {:>5} {:>6} {:<10} {:<8} {:<8} {}",
            key.to_string(),
            unit.pid(),
            unit.kind().as_str(),
            unit.state().as_str(),
            unit.block().as_str(),
            unit.name()
        );
    }
    for tty in mgr.ttys() {
        info!("  tty {:>6} {}", tty.pid(), tty.device());
    }
}

async fn shutdown(mgr: &mut Manager, signals: &mut tokio::sync::mpsc::Receiver<InitSignal>) {
    mgr.set_runlevel(Runlevel::Level(0));

    let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;
    while !mgr.stop_is_done() {
        match tokio::time::timeout_at(deadline, signals.recv()).await {
            Ok(Some(InitSignal::Child)) => reap(mgr),
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => {
                log::warn!("Units still stopping after {:?}, exiting anyway", SHUTDOWN_TIMEOUT);
                break;
            }
        }
    }
}

fn check(file: &PathBuf, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let parsed = conf::load_file(file)?;

    // Nothing is started: no runlevel is ever entered
    let mut mgr = Manager::new(config.clone(), Box::new(SystemBackend::new()));
    let report = conf::apply(&mut mgr, std::slice::from_ref(&parsed), None);

    for (_, unit) in mgr.units() {
        println!(
            "{:<8} {:<4} {:<10} {:<24} {}",
            unit.kind().as_str(),
            unit.id(),
            unit.runlevels().to_string(),
            unit.command(),
            unit.description()
        );
    }
    for tty in mgr.ttys() {
        println!("{:<8} {:<4} {:<10} {}", "tty", "-", tty.decl().runlevels.to_string(), tty.device());
    }
    if let Some(level) = report.runlevel {
        println!("runlevel {}", level);
    }

    if report.failed > 0 {
        return Err(format!("{} invalid declarations", report.failed).into());
    }
    Ok(())
}
