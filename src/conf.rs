//! Configuration file loader
//!
//! ```text
//! # /etc/svinit.conf
//! runlevel 2
//! run   [S]    /sbin/fsck -a -- Checking filesystems
//! task  [S]    /sbin/hwclock -s
//! service [2345] <IFUP:eth0> /sbin/syslogd -n -- System log
//! inetd ssh/tcp nowait [2345] /usr/sbin/sshd -i
//! tty   [12345] ttyS0 115200 vt100
//! ```
//!
//! The main file is read first, then `*.conf` from the include directory in
//! name order. Every file's mtime is passed on as the registration mtime, so
//! touching a file marks its units dirty on the next reload.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::manager::Manager;
use crate::runlevel::Runlevel;
use crate::units::UnitKind;

#[derive(Debug, thiserror::Error)]
pub enum ConfError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path}:{line}: unknown keyword '{keyword}'")]
    UnknownKeyword {
        path: PathBuf,
        line: usize,
        keyword: String,
    },

    #[error("{path}:{line}: invalid runlevel '{value}'")]
    InvalidRunlevel {
        path: PathBuf,
        line: usize,
        value: String,
    },

    #[error("Invalid include pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

/// One configuration statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// `service`, `task`, `run` or `inetd` with the rest of the line
    Unit { kind: UnitKind, line: String },
    /// `tty` with the rest of the line
    Tty(String),
    /// Runlevel entered after bootstrap
    Runlevel(Runlevel),
}

/// A parsed configuration file
#[derive(Debug, Clone)]
pub struct ConfFile {
    pub path: PathBuf,
    pub mtime: Option<SystemTime>,
    /// Entries with their line numbers
    pub entries: Vec<(usize, Entry)>,
    /// Lines dropped by the parser
    pub skipped: usize,
}

/// Parse configuration text
///
/// Lines with an unknown keyword or a bad runlevel are logged and skipped,
/// so one typo never drops the rest of the file. Returns the entries and
/// the number of skipped lines.
pub fn parse(path: &Path, text: &str) -> (Vec<(usize, Entry)>, usize) {
    let mut entries = Vec::new();
    let mut skipped = 0;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        match parse_line(path, lineno, raw.trim()) {
            Ok(Some(entry)) => entries.push((lineno, entry)),
            Ok(None) => {}
            Err(e) => {
                log::warn!("{}, skipping", e);
                skipped += 1;
            }
        }
    }

    (entries, skipped)
}

fn parse_line(path: &Path, lineno: usize, line: &str) -> Result<Option<Entry>, ConfError> {
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (keyword, rest) = match line.split_once(char::is_whitespace) {
        Some((k, r)) => (k, r.trim()),
        None => (line, ""),
    };

    let entry = if keyword.eq_ignore_ascii_case("tty") {
        Entry::Tty(rest.to_string())
    } else if keyword.eq_ignore_ascii_case("runlevel") {
        let level = Runlevel::parse(rest).ok_or_else(|| ConfError::InvalidRunlevel {
            path: path.to_path_buf(),
            line: lineno,
            value: rest.to_string(),
        })?;
        Entry::Runlevel(level)
    } else if let Some(kind) = UnitKind::parse(keyword) {
        Entry::Unit {
            kind,
            line: rest.to_string(),
        }
    } else {
        return Err(ConfError::UnknownKeyword {
            path: path.to_path_buf(),
            line: lineno,
            keyword: keyword.to_string(),
        });
    };

    Ok(Some(entry))
}

pub fn load_file(path: &Path) -> Result<ConfFile, ConfError> {
    let io_err = |source| ConfError::Io {
        path: path.to_path_buf(),
        source,
    };

    let text = fs::read_to_string(path).map_err(io_err)?;
    let mtime = fs::metadata(path).and_then(|m| m.modified()).ok();
    let (entries, skipped) = parse(path, &text);

    Ok(ConfFile {
        path: path.to_path_buf(),
        mtime,
        entries,
        skipped,
    })
}

/// Load the main file and every `*.conf` in `include_dir`
///
/// A missing include directory is not an error.
pub fn load(main: &Path, include_dir: Option<&Path>) -> Result<Vec<ConfFile>, ConfError> {
    let mut files = vec![load_file(main)?];

    if let Some(dir) = include_dir {
        let pattern = dir.join("*.conf");
        let mut paths: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())?
            .filter_map(Result::ok)
            .collect();
        paths.sort();

        for path in paths {
            files.push(load_file(&path)?);
        }
    }

    Ok(files)
}

/// Outcome of applying configuration to a manager
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub registered: usize,
    pub ttys: usize,
    pub failed: usize,
    /// Last `runlevel` statement seen
    pub runlevel: Option<Runlevel>,
}

/// Register everything in `files`. Bad declarations are logged and skipped.
pub fn apply(mgr: &mut Manager, files: &[ConfFile], default_user: Option<&str>) -> ApplyReport {
    let mut report = ApplyReport::default();

    for file in files {
        report.failed += file.skipped;
        for (lineno, entry) in &file.entries {
            match entry {
                Entry::Unit { kind, line } => match mgr.register(*kind, line, file.mtime, default_user) {
                    Ok(_) => report.registered += 1,
                    Err(e) => {
                        log::warn!("{}:{}: {}", file.path.display(), lineno, e);
                        report.failed += 1;
                    }
                },
                Entry::Tty(line) => match mgr.register_tty(line) {
                    Ok(()) => report.ttys += 1,
                    Err(e) => {
                        log::warn!("{}:{}: {}", file.path.display(), lineno, e);
                        report.failed += 1;
                    }
                },
                Entry::Runlevel(level) => report.runlevel = Some(*level),
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_test_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = PathBuf::from(format!("/tmp/svinit-conf-test-{}-{}", std::process::id(), id));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_parse_statements() {
        let text = "\
# comment
runlevel 3

service [2345] /sbin/syslogd -n -- System log
TASK [S] /sbin/hwclock -s
tty [12345] ttyS0 115200
";
        let (entries, skipped) = parse(Path::new("test.conf"), text);
        assert_eq!(skipped, 0);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0], (2, Entry::Runlevel(Runlevel::Level(3))));
        assert_eq!(
            entries[1].1,
            Entry::Unit {
                kind: UnitKind::Service,
                line: "[2345] /sbin/syslogd -n -- System log".to_string()
            }
        );
        assert!(matches!(entries[2].1, Entry::Unit { kind: UnitKind::Task, .. }));
        assert_eq!(entries[3].1, Entry::Tty("[12345] ttyS0 115200".to_string()));
    }

    #[test]
    fn test_bad_lines_are_skipped() {
        let text = "daemon /bin/foo\nrunlevel 12\nservice [2] /sbin/syslogd\n";
        let (entries, skipped) = parse(Path::new("x.conf"), text);
        assert_eq!(skipped, 2);
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0], (3, Entry::Unit { kind: UnitKind::Service, .. })));

        let err = parse_line(Path::new("x.conf"), 1, "daemon /bin/foo").unwrap_err();
        assert!(matches!(err, ConfError::UnknownKeyword { line: 1, .. }));
        let err = parse_line(Path::new("x.conf"), 2, "runlevel 12").unwrap_err();
        assert!(matches!(err, ConfError::InvalidRunlevel { line: 2, .. }));
    }

    #[test]
    fn test_load_with_include_dir() {
        let dir = unique_test_dir();
        let main = dir.join("svinit.conf");
        fs::write(&main, "runlevel 2\nservice /sbin/syslogd\n").unwrap();

        let include = dir.join("svinit.d");
        fs::create_dir_all(&include).unwrap();
        fs::write(include.join("b.conf"), "task /bin/b\n").unwrap();
        fs::write(include.join("a.conf"), "task /bin/a\n").unwrap();
        fs::write(include.join("ignored.txt"), "bogus line\n").unwrap();

        let files = load(&main, Some(&include)).unwrap();
        assert_eq!(files.len(), 3);
        assert!(files[1].path.ends_with("a.conf"));
        assert!(files[2].path.ends_with("b.conf"));
        assert!(files.iter().all(|f| f.mtime.is_some()));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_include_dir_is_fine() {
        let dir = unique_test_dir();
        let main = dir.join("svinit.conf");
        fs::write(&main, "").unwrap();

        let files = load(&main, Some(&dir.join("nope"))).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].entries.is_empty());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_main_file() {
        let err = load(Path::new("/nonexistent/svinit.conf"), None).unwrap_err();
        assert!(matches!(err, ConfError::Io { .. }));
    }
}
