//! Declaration line parser
//!
//! Parses the body of a `service`, `task`, `run` or `inetd` line:
//!
//! ```text
//! [@user[:group]] [[!]levels] [<[!]cond,...>] [:id] [nowait|wait] [log]
//!     [service/proto[@iface,!iface]] command [args...] [-- description]
//! ```
//!
//! The tagged tokens before the command may appear in any order.

use crate::config::{MAX_ARGS, MAX_ARG_LEN};
use crate::runlevel::Runlevels;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Empty declaration")]
    Empty,

    #[error("Incomplete declaration, no command")]
    Incomplete,

    #[error("Invalid instance id: {0}")]
    InvalidId(String),

    #[error("Empty user name")]
    EmptyUser,

    #[error("Invalid inetd service: {0}")]
    InvalidService(String),

    #[error("Too many arguments ({0}, max {MAX_ARGS})")]
    TooManyArgs(usize),

    #[error("Argument too long: {0}")]
    ArgTooLong(String),
}

/// Interface filter from `service/proto@iface,!iface`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfaceRule {
    Allow(String),
    Deny(String),
}

/// `service/proto[@ifaces]` part of an inetd declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InetAddr {
    pub service: String,
    pub proto: String,
    pub ifaces: Vec<IfaceRule>,
}

impl InetAddr {
    fn parse(token: &str) -> Result<Self, ParseError> {
        let (spec, ifaces) = match token.split_once('@') {
            Some((spec, ifaces)) => (spec, Some(ifaces)),
            None => (token, None),
        };

        let Some((service, proto)) = spec.split_once('/') else {
            return Err(ParseError::InvalidService(token.to_string()));
        };
        if service.is_empty() || proto.is_empty() {
            return Err(ParseError::InvalidService(token.to_string()));
        }

        let ifaces = ifaces
            .unwrap_or("")
            .split(',')
            .filter(|i| !i.is_empty())
            .map(|i| match i.strip_prefix('!') {
                Some(name) => IfaceRule::Deny(name.to_string()),
                None => IfaceRule::Allow(i.to_string()),
            })
            .collect();

        Ok(Self {
            service: service.to_string(),
            proto: proto.to_string(),
            ifaces,
        })
    }
}

/// One parsed declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub user: Option<String>,
    pub group: Option<String>,
    pub runlevels: Runlevels,
    pub conditions: Vec<String>,
    /// False when the condition token starts with `!`
    pub sighup: bool,
    pub id: Option<u32>,
    /// `nowait` given
    pub forking: bool,
    pub inet: Option<InetAddr>,
    pub log: bool,
    pub command: String,
    /// Argument vector including the command
    pub args: Vec<String>,
    pub description: Option<String>,
}

impl Declaration {
    /// Parse a declaration body (the line without its leading keyword)
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let (head, description) = match line.find("-- ") {
            Some(pos) => {
                let desc = line[pos + 3..].trim();
                (&line[..pos], (!desc.is_empty()).then(|| desc.to_string()))
            }
            None => (line, None),
        };

        let mut tokens = head.split_whitespace();
        if head.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let mut user = None;
        let mut runlevels = None;
        let mut cond = None;
        let mut id = None;
        let mut forking = false;
        let mut inet = None;
        let mut log = false;

        let command = loop {
            let Some(tok) = tokens.next() else {
                return Err(ParseError::Incomplete);
            };

            if let Some(rest) = tok.strip_prefix('@') {
                user = Some(rest);
            } else if tok.starts_with('[') {
                runlevels = Some(tok);
            } else if let Some(rest) = tok.strip_prefix('<') {
                cond = Some(rest);
            } else if let Some(rest) = tok.strip_prefix(':') {
                id = Some(parse_id(rest)?);
            } else if tok.eq_ignore_ascii_case("nowait") {
                forking = true;
            } else if tok.eq_ignore_ascii_case("wait") {
                forking = false;
            } else if !tok.starts_with('/') && tok.contains('/') {
                inet = Some(InetAddr::parse(tok)?);
            } else if tok.eq_ignore_ascii_case("log") {
                log = true;
            } else {
                break tok;
            }
        };

        let (user, group) = match user {
            Some(spec) => {
                let (name, group) = match spec.split_once(':') {
                    Some((name, group)) => (name, Some(group.to_string())),
                    None => (spec, None),
                };
                if name.is_empty() {
                    return Err(ParseError::EmptyUser);
                }
                (Some(name.to_string()), group.filter(|g| !g.is_empty()))
            }
            None => (None, None),
        };

        let (sighup, conditions) = parse_conditions(cond);

        let args: Vec<String> = std::iter::once(command)
            .chain(tokens)
            .map(|a| a.to_string())
            .collect();
        if args.len() > MAX_ARGS {
            return Err(ParseError::TooManyArgs(args.len()));
        }
        if let Some(long) = args.iter().find(|a| a.len() > MAX_ARG_LEN) {
            return Err(ParseError::ArgTooLong(long.clone()));
        }

        Ok(Self {
            user,
            group,
            runlevels: Runlevels::parse(runlevels),
            conditions,
            sighup,
            id,
            forking,
            inet,
            log,
            command: command.to_string(),
            args,
            description,
        })
    }
}

fn parse_id(s: &str) -> Result<u32, ParseError> {
    match s.parse::<u32>() {
        Ok(id) if id >= 1 && id <= i32::MAX as u32 => Ok(id),
        _ => Err(ParseError::InvalidId(s.to_string())),
    }
}

/// `!IFUP:eth0,GW>` -> (sighup, names)
fn parse_conditions(cond: Option<&str>) -> (bool, Vec<String>) {
    let Some(cond) = cond else {
        return (true, Vec::new());
    };

    let (sighup, cond) = match cond.strip_prefix('!') {
        Some(rest) => (false, rest),
        None => (true, cond),
    };
    let cond = cond.split('>').next().unwrap_or("");

    let names = cond
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();

    (sighup, names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runlevel::Runlevel;

    #[test]
    fn test_parse_full_service() {
        let decl = Declaration::parse("[2345] <!IFUP:eth0> /usr/sbin/daemon -x -- My Daemon").unwrap();
        assert_eq!(decl.runlevels, Runlevels::parse(Some("[2345]")));
        assert_eq!(decl.conditions, vec!["IFUP:eth0".to_string()]);
        assert!(!decl.sighup);
        assert_eq!(decl.command, "/usr/sbin/daemon");
        assert_eq!(decl.args, vec!["/usr/sbin/daemon".to_string(), "-x".to_string()]);
        assert_eq!(decl.description.as_deref(), Some("My Daemon"));
        assert_eq!(decl.id, None);
    }

    #[test]
    fn test_parse_minimal() {
        let decl = Declaration::parse("/sbin/syslogd -n").unwrap();
        assert_eq!(decl.runlevels, Runlevels::parse(None));
        assert!(decl.sighup);
        assert!(decl.conditions.is_empty());
        assert!(decl.user.is_none());
        assert!(decl.description.is_none());
        assert!(!decl.log);
    }

    #[test]
    fn test_parse_order_independent() {
        let a = Declaration::parse("@www:web :3 log [S12] /bin/httpd -f").unwrap();
        let b = Declaration::parse("[S12] log :3 @www:web /bin/httpd -f").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.user.as_deref(), Some("www"));
        assert_eq!(a.group.as_deref(), Some("web"));
        assert_eq!(a.id, Some(3));
        assert!(a.log);
        assert!(a.runlevels.has(Runlevel::Bootstrap));
    }

    #[test]
    fn test_parse_conditions_with_sighup() {
        let decl = Declaration::parse("<IFUP:eth0,GW> /sbin/ntpd").unwrap();
        assert!(decl.sighup);
        assert_eq!(decl.conditions, vec!["IFUP:eth0".to_string(), "GW".to_string()]);

        let decl = Declaration::parse("<!> /sbin/ntpd").unwrap();
        assert!(!decl.sighup);
        assert!(decl.conditions.is_empty());
    }

    #[test]
    fn test_parse_inetd() {
        let decl = Declaration::parse("ssh/tcp@eth0,!eth1 nowait [2345] /usr/sbin/sshd -i -- SSH").unwrap();
        let inet = decl.inet.unwrap();
        assert_eq!(inet.service, "ssh");
        assert_eq!(inet.proto, "tcp");
        assert_eq!(
            inet.ifaces,
            vec![IfaceRule::Allow("eth0".to_string()), IfaceRule::Deny("eth1".to_string())]
        );
        assert!(decl.forking);
        assert_eq!(decl.command, "/usr/sbin/sshd");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Declaration::parse("   "), Err(ParseError::Empty));
        assert_eq!(Declaration::parse("[2345] @root"), Err(ParseError::Incomplete));
        assert_eq!(Declaration::parse("-- just a description"), Err(ParseError::Empty));
        assert_eq!(Declaration::parse(":0 /bin/true"), Err(ParseError::InvalidId("0".to_string())));
        assert_eq!(Declaration::parse(":x /bin/true"), Err(ParseError::InvalidId("x".to_string())));
        assert_eq!(Declaration::parse("@ /bin/true"), Err(ParseError::EmptyUser));
        assert!(matches!(Declaration::parse("ssh@eth0/x /bin/true"), Err(ParseError::InvalidService(_))));
    }

    #[test]
    fn test_parse_arg_limits() {
        let many = std::iter::repeat("a").take(MAX_ARGS).collect::<Vec<_>>().join(" ");
        let line = format!("/bin/echo {}", many);
        assert_eq!(Declaration::parse(&line), Err(ParseError::TooManyArgs(MAX_ARGS + 1)));

        let long = "x".repeat(MAX_ARG_LEN + 1);
        let line = format!("/bin/echo {}", long);
        assert_eq!(Declaration::parse(&line), Err(ParseError::ArgTooLong(long)));
    }

    #[test]
    fn test_dashes_without_space_are_arguments() {
        let decl = Declaration::parse("/bin/prog --verbose --").unwrap();
        assert_eq!(decl.args.len(), 3);
        assert!(decl.description.is_none());
    }
}
