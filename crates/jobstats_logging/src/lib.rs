//! Logging setup for the jobstats binary.
//!
//! Everything goes to stderr. When a log directory is configured, the same
//! events are also appended to `jobstats.log` there, which rolls over to
//! `jobstats.log.1`, `.2`, ... once it reaches the configured size.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "jobstats=info,jobstats_db=info";
const VERBOSE_LOG_FILTER: &str = "jobstats=debug,jobstats_db=debug";

/// Logging configuration.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    /// Directory for rotated log files; stderr only when unset
    pub log_dir: Option<&'a Path>,
    /// Filter directives used when `RUST_LOG` is unset
    pub filter: Option<&'a str>,
    pub rotation: Rotation,
}

/// Size limits for the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    /// Live file plus rotated copies
    pub max_files: usize,
    pub max_bytes: u64,
}

impl Default for Rotation {
    fn default() -> Self {
        Self {
            max_files: 5,
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Initialize tracing with stderr output and an optional file writer.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let directives = filter_directives(
        std::env::var("RUST_LOG").ok().as_deref(),
        config.filter,
        config.verbose,
    );
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("Invalid log filter: {}", directives))?;

    let file_layer = match config.log_dir {
        Some(dir) => {
            let dir = expand_home(dir);
            let log = LogFile::open(&dir, config.app_name, config.rotation)
                .with_context(|| format!("Failed to open log file in {}", dir.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(log))
                    .with_ansi(false)
                    .with_filter(filter.clone()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(())
}

/// Pick filter directives: `RUST_LOG` wins, then `--verbose`, then the
/// configured filter, then the default.
fn filter_directives(env: Option<&str>, configured: Option<&str>, verbose: bool) -> String {
    match env.map(str::trim).filter(|s| !s.is_empty()) {
        Some(env) => env.to_string(),
        None if verbose => VERBOSE_LOG_FILTER.to_string(),
        None => configured
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_LOG_FILTER)
            .to_string(),
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Append-only log file that rolls over by size.
struct LogFile {
    path: PathBuf,
    rotation: Rotation,
    file: File,
    len: u64,
}

impl LogFile {
    fn open(dir: &Path, app_name: &str, rotation: Rotation) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.log", app_name));
        let (file, len) = open_append(&path)?;
        let mut log = Self {
            path,
            rotation,
            file,
            len,
        };
        if log.len > rotation.max_bytes {
            log.roll()?;
        }
        Ok(log)
    }

    fn rotated(&self, n: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    /// Shift `.log` into `.log.1` and older copies up by one. `rename`
    /// replaces the oldest copy, so nothing past `max_files` survives.
    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let keep = self.rotation.max_files.saturating_sub(1);
        if keep == 0 {
            self.file.set_len(0)?;
            self.len = 0;
            return Ok(());
        }

        for n in (1..=keep).rev() {
            let from = if n == 1 {
                self.path.clone()
            } else {
                self.rotated(n - 1)
            };
            match fs::rename(&from, self.rotated(n)) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }

        let (file, len) = open_append(&self.path)?;
        self.file = file;
        self.len = len;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<(File, u64)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.len > 0 && self.len + buf.len() as u64 > self.rotation.max_bytes {
            self.roll()?;
        }
        let written = self.file.write(buf)?;
        self.len += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
