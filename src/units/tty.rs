//! TTY declarations
//!
//! `tty [levels] <dev> [baud[,baud...]] [term]`
//!
//! Also turns kernel `console=` parameters into TTY declarations, so a
//! serial console gets a login prompt without any configuration.

use crate::runlevel::Runlevels;

/// A parsed `tty` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtyDecl {
    /// Device name or path (`ttyS0`, `/dev/tty1`)
    pub device: String,
    /// Baud rate list passed to getty
    pub baud: Option<String>,
    pub term: Option<String>,
    pub runlevels: Runlevels,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TtyParseError {
    #[error("Incomplete tty declaration, no device")]
    NoDevice,
}

impl TtyDecl {
    pub fn parse(line: &str) -> Result<Self, TtyParseError> {
        let mut tokens = line.split_whitespace();

        let mut first = tokens.next().ok_or(TtyParseError::NoDevice)?;
        let mut runlevels = None;
        if first.starts_with('[') {
            runlevels = Some(first);
            first = tokens.next().ok_or(TtyParseError::NoDevice)?;
        }

        let baud = tokens.next().map(str::to_string);
        let term = tokens.next().map(str::to_string);

        Ok(Self {
            device: first.to_string(),
            baud,
            term,
            runlevels: Runlevels::parse(runlevels),
        })
    }
}

/// Parsed kernel `console=` parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleParam {
    /// TTY device name (e.g., "ttyS0", "tty1")
    pub tty: String,
    /// Baud rate for serial consoles (e.g., 115200)
    pub baud: Option<u32>,
    /// Trailing line options (e.g., "n8")
    pub options: Option<String>,
}

impl ConsoleParam {
    pub fn is_serial(&self) -> bool {
        self.tty.starts_with("ttyS")
            || self.tty.starts_with("ttyUSB")
            || self.tty.starts_with("ttyAMA") // Raspberry Pi
            || self.tty.starts_with("ttyO") // OMAP
            || self.tty.starts_with("ttymxc") // i.MX
            || self.tty.starts_with("ttyPS") // Xilinx
    }

    /// TTY declaration for this console, allowed in all multi-user levels
    pub fn to_decl(&self) -> TtyDecl {
        let baud = match (self.baud, self.is_serial()) {
            (Some(b), _) => Some(b.to_string()),
            (None, true) => Some("115200,57600,38400,9600".to_string()),
            (None, false) => None,
        };

        TtyDecl {
            device: self.tty.clone(),
            baud,
            term: self.is_serial().then(|| "vt100".to_string()),
            runlevels: Runlevels::parse(Some("[12345]")),
        }
    }
}

/// Extract `console=` parameters from a kernel command line
pub fn parse_cmdline(cmdline: &str) -> Vec<ConsoleParam> {
    cmdline
        .split_whitespace()
        .filter_map(|param| {
            let value = param.strip_prefix("console=")?;
            parse_console_param(value)
        })
        .collect()
}

/// `ttyS0,115200n8` -> tty, baud, options
fn parse_console_param(value: &str) -> Option<ConsoleParam> {
    let mut parts = value.split(',');
    let tty = parts.next()?.to_string();
    if tty.is_empty() {
        return None;
    }

    let (baud, options) = match parts.next() {
        Some(rate) => {
            let digits: String = rate.chars().take_while(|c| c.is_ascii_digit()).collect();
            let options = (digits.len() < rate.len()).then(|| rate[digits.len()..].to_string());
            (digits.parse().ok(), options)
        }
        None => (None, None),
    };

    Some(ConsoleParam { tty, baud, options })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runlevel::Runlevel;

    #[test]
    fn test_parse_tty_full() {
        let decl = TtyDecl::parse("[2345] ttyS0 115200 vt100").unwrap();
        assert_eq!(decl.device, "ttyS0");
        assert_eq!(decl.baud.as_deref(), Some("115200"));
        assert_eq!(decl.term.as_deref(), Some("vt100"));
        assert!(decl.runlevels.has(Runlevel::Level(5)));
        assert!(!decl.runlevels.has(Runlevel::Level(1)));
    }

    #[test]
    fn test_parse_tty_device_only() {
        let decl = TtyDecl::parse("/dev/tty1").unwrap();
        assert_eq!(decl.device, "/dev/tty1");
        assert!(decl.baud.is_none());
        assert!(decl.term.is_none());
        assert_eq!(decl.runlevels, Runlevels::parse(None));
    }

    #[test]
    fn test_parse_tty_errors() {
        assert_eq!(TtyDecl::parse(""), Err(TtyParseError::NoDevice));
        assert_eq!(TtyDecl::parse("[2345]"), Err(TtyParseError::NoDevice));
    }

    #[test]
    fn test_parse_console_serial_with_options() {
        let params = parse_cmdline("root=/dev/sda1 console=tty0 console=ttyS0,115200n8 quiet");
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].tty, "tty0");
        assert!(!params[0].is_serial());
        assert_eq!(params[1].tty, "ttyS0");
        assert_eq!(params[1].baud, Some(115200));
        assert_eq!(params[1].options.as_deref(), Some("n8"));
    }

    #[test]
    fn test_console_to_decl() {
        let params = parse_cmdline("console=ttyAMA0");
        let decl = params[0].to_decl();
        assert_eq!(decl.device, "ttyAMA0");
        assert_eq!(decl.baud.as_deref(), Some("115200,57600,38400,9600"));
        assert_eq!(decl.term.as_deref(), Some("vt100"));

        let decl = parse_cmdline("console=tty1")[0].to_decl();
        assert!(decl.baud.is_none());
        assert!(decl.term.is_none());
    }
}
