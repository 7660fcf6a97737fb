//! Signal handling for the supervisor
//!
//! - SIGCHLD: reap children and collect units
//! - SIGHUP: reload configuration
//! - SIGTSTP/SIGCONT: suspend/resume starts and restarts
//! - SIGUSR1: dump unit status
//! - SIGTERM/SIGINT: stop everything and exit

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;

/// Signals the supervisor acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitSignal {
    /// Child process exited (SIGCHLD)
    Child,
    /// Reload configuration (SIGHUP)
    Hup,
    /// Suspend respawning (SIGTSTP)
    Tstp,
    /// Resume respawning (SIGCONT)
    Cont,
    /// Status dump (SIGUSR1)
    Usr1,
    /// Shutdown request (SIGTERM)
    Term,
    /// Interrupt (SIGINT, Ctrl+C)
    Int,
}

pub struct SignalHandler {
    sigchld: Signal,
    sighup: Signal,
    sigtstp: Signal,
    sigcont: Signal,
    sigusr1: Signal,
    sigterm: Signal,
    sigint: Signal,
}

impl SignalHandler {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            sigchld: signal(SignalKind::child())?,
            sighup: signal(SignalKind::hangup())?,
            sigtstp: signal(SignalKind::from_raw(libc::SIGTSTP))?,
            sigcont: signal(SignalKind::from_raw(libc::SIGCONT))?,
            sigusr1: signal(SignalKind::user_defined1())?,
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next signal
    pub async fn wait(&mut self) -> InitSignal {
        tokio::select! {
            _ = self.sigchld.recv() => InitSignal::Child,
            _ = self.sighup.recv() => InitSignal::Hup,
            _ = self.sigtstp.recv() => InitSignal::Tstp,
            _ = self.sigcont.recv() => InitSignal::Cont,
            _ = self.sigusr1.recv() => InitSignal::Usr1,
            _ = self.sigterm.recv() => InitSignal::Term,
            _ = self.sigint.recv() => InitSignal::Int,
        }
    }

    /// Spawn a task that forwards signals to a channel
    pub fn spawn_forwarder(mut self) -> mpsc::Receiver<InitSignal> {
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            loop {
                let sig = self.wait().await;
                if tx.send(sig).await.is_err() {
                    break;
                }
            }
        });

        rx
    }
}
