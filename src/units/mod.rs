//! Unit descriptors and declaration parsing
//!
//! Turns configuration lines into typed descriptors. Runtime state inside a
//! [`Unit`] is owned by the state machine in [`crate::manager`].

mod parser;
mod tty;
mod unit;

pub use parser::{Declaration, IfaceRule, InetAddr, ParseError};
pub use tty::{parse_cmdline, ConsoleParam, TtyDecl, TtyParseError};
pub use unit::{BlockReason, Connection, InetdSpec, KindMask, Transport, Unit, UnitKind};
