//! Runlevels and runlevel sets
//!
//! SysV-style runlevels 0-9 plus the bootstrap pseudo-level `S`, which is
//! only active once at startup before the first real runlevel is entered.

use std::fmt;

bitflags::bitflags! {
    /// Set of runlevels a unit or TTY is allowed to run in
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Runlevels: u16 {
        const L0 = 1 << 0;
        const L1 = 1 << 1;
        const L2 = 1 << 2;
        const L3 = 1 << 3;
        const L4 = 1 << 4;
        const L5 = 1 << 5;
        const L6 = 1 << 6;
        const L7 = 1 << 7;
        const L8 = 1 << 8;
        const L9 = 1 << 9;
        /// Bootstrap
        const S = 1 << 10;
    }
}

/// Levels granted by a bare `[!...]` before the excluded ones are removed.
/// Neither halt (0) nor bootstrap is part of the base.
const NEGATION_BASE: Runlevels = Runlevels::from_bits_truncate(0b11_1111_1110);

/// Used when a declaration carries no `[...]` token
pub const DEFAULT_RUNLEVELS: &str = "[234]";

/// A single runlevel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Runlevel {
    /// System bootstrap (`S`)
    Bootstrap,
    /// Numbered runlevel 0-9
    Level(u8),
}

impl Runlevel {
    /// Parse `S`/`s` or a single digit
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "S" | "s" => Some(Self::Bootstrap),
            _ => match s.parse::<u8>() {
                Ok(n) if n <= 9 => Some(Self::Level(n)),
                _ => None,
            },
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            'S' | 's' => Some(Self::Bootstrap),
            _ => c.to_digit(10).map(|d| Self::Level(d as u8)),
        }
    }

    /// The flag this level occupies in a [`Runlevels`] set
    pub fn flag(self) -> Runlevels {
        match self {
            Self::Bootstrap => Runlevels::S,
            Self::Level(n) => Runlevels::from_bits_truncate(1 << n),
        }
    }
}

impl fmt::Display for Runlevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootstrap => write!(f, "S"),
            Self::Level(n) => write!(f, "{}", n),
        }
    }
}

impl Runlevels {
    /// Parse a runlevel token such as `[2345]`, `[S12345]` or `[!06]`.
    ///
    /// `None` yields the default set. Unknown characters are skipped, and
    /// parsing stops at the closing bracket. A `!` switches to negation:
    /// the set becomes levels 1-9 minus every level listed after it.
    pub fn parse(token: Option<&str>) -> Self {
        let token = token.unwrap_or(DEFAULT_RUNLEVELS);
        let body = token.strip_prefix('[').unwrap_or(token);

        let mut set = Runlevels::empty();
        let mut negate = false;

        for c in body.chars() {
            if c == ']' {
                break;
            }
            if c == '!' {
                negate = true;
                set = NEGATION_BASE;
                continue;
            }
            let Some(level) = Runlevel::from_char(c) else {
                continue;
            };
            if negate {
                set.remove(level.flag());
            } else {
                set.insert(level.flag());
            }
        }

        set
    }

    /// Check membership of a single runlevel
    pub fn has(&self, level: Runlevel) -> bool {
        self.contains(level.flag())
    }

    /// True if the set is exactly the bootstrap level
    pub fn is_bootstrap_only(&self) -> bool {
        *self == Runlevels::S
    }
}

impl fmt::Display for Runlevels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        if self.contains(Runlevels::S) {
            write!(f, "S")?;
        }
        for n in 0..=9u8 {
            if self.has(Runlevel::Level(n)) {
                write!(f, "{}", n)?;
            }
        }
        write!(f, "]")
    }
}
