//! Leveled logging setup and the per-run detailed log.
//!
//! Leveled lines go through `tracing` to stderr and `<log_dir>/secpipe.log`.
//! Raw subprocess output goes to a [`DetailedLog`] owned by the run, at
//! `<log_dir>/<run_id>_detailed.log`.

use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;
use tracing_appender::rolling;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::docker::ContainerResult;

pub const LOG_FILE: &str = "secpipe.log";

/// Install the global subscriber. `RUST_LOG` wins over `level` when set.
pub fn init(level: &str, log_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(SystemTime)
        .with_ansi(false)
        .with_writer(rolling::never(log_dir, LOG_FILE));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("failed to set tracing subscriber")?;

    tracing::debug!("logging to {}", log_dir.join(LOG_FILE).display());
    Ok(())
}

/// Append-only sink for everything the runtime printed during one run.
///
/// Opened when the run starts and closed when dropped at run end. Write
/// failures are logged as warnings and never fail the run.
#[derive(Debug)]
pub struct DetailedLog {
    path: Option<PathBuf>,
    writer: Option<LineWriter<File>>,
}

impl DetailedLog {
    pub fn open(log_dir: &Path, run_id: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let path = log_dir.join(format!("{run_id}_detailed.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path: Some(path),
            writer: Some(LineWriter::new(file)),
        })
    }

    /// A log that drops everything.
    pub fn discard() -> Self {
        Self {
            path: None,
            writer: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a `==> heading` line followed by `body`.
    pub fn record(&mut self, heading: &str, body: &str) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let mut write = || -> std::io::Result<()> {
            writeln!(writer, "==> {heading}")?;
            if !body.is_empty() {
                writer.write_all(body.as_bytes())?;
                if !body.ends_with('\n') {
                    writer.write_all(b"\n")?;
                }
            }
            Ok(())
        };
        if let Err(e) = write() {
            warn!("failed to write detailed log: {e}");
        }
    }

    /// Append the captured streams of one invocation.
    pub fn record_result(&mut self, invocation: &str, result: &ContainerResult) {
        let status = match (result.exit_code, result.timed_out) {
            (_, true) => "timed out".to_string(),
            (Some(code), false) => format!("exit {code}"),
            (None, false) => "no exit status".to_string(),
        };
        self.record(&format!("{invocation} [{status}]"), "");
        if !result.stdout.is_empty() {
            self.record("stdout", &result.stdout);
        }
        if !result.stderr.is_empty() {
            self.record("stderr", &result.stderr);
        }
    }
}

impl Drop for DetailedLog {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_uses_run_id_naming() {
        let dir = tempfile::tempdir().unwrap();
        let log = DetailedLog::open(dir.path(), "abc").unwrap();
        assert_eq!(log.path(), Some(dir.path().join("abc_detailed.log").as_path()));
    }

    #[test]
    fn record_appends_sections() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = DetailedLog::open(dir.path(), "run1").unwrap();
        log.record("run alpine echo", "hello");
        log.record_result("run alpine false", &ContainerResult::failed(1, "nope\n"));
        drop(log);

        let text = std::fs::read_to_string(dir.path().join("run1_detailed.log")).unwrap();
        assert!(text.contains("==> run alpine echo\nhello\n"));
        assert!(text.contains("==> run alpine false [exit 1]"));
        assert!(text.contains("==> stderr\nnope\n"));
    }

    #[test]
    fn reopening_appends_rather_than_truncates() {
        let dir = tempfile::tempdir().unwrap();
        DetailedLog::open(dir.path(), "r").unwrap().record("first", "");
        DetailedLog::open(dir.path(), "r").unwrap().record("second", "");
        let text = std::fs::read_to_string(dir.path().join("r_detailed.log")).unwrap();
        assert!(text.contains("first") && text.contains("second"));
    }

    #[test]
    fn discard_has_no_path() {
        let mut log = DetailedLog::discard();
        log.record("ignored", "body");
        assert!(log.path().is_none());
    }
}
