//! svinit - Process supervision core for a minimal init
//!
//! Keeps declared services, tasks, run-once commands, inetd services and
//! TTYs running according to the current runlevel and a set of external
//! conditions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      svinit daemon                       │
//! │   conf loader  │  pid1 (signals, reaper)  │  clap args   │
//! ├──────────────────────────────────────────────────────────┤
//! │                        Manager                           │
//! │  register │ state machine │ transitions │ TTYs │ inetd   │
//! ├──────────────────────────────────────────────────────────┤
//! │  Registry  │  Conditions  │  Plugins  │  Backend (nix)   │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod conditions;
pub mod conf;
pub mod config;
pub mod manager;
pub mod pid1;
pub mod plugins;
pub mod registry;
pub mod runlevel;
pub mod units;

pub use conditions::{CondState, ConditionSource, ConditionStore};
pub use config::{Config, OutputMode};
pub use manager::{Manager, ManagerError, RegisterError, SvcState};
pub use registry::UnitKey;
pub use runlevel::{Runlevel, Runlevels};
pub use units::{BlockReason, Unit, UnitKind};
