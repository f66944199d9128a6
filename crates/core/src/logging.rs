//! Log filter selection, the rolling log file and crash reports.
//!
//! Subscriber assembly lives in the binary; this module only decides what
//! gets logged and where the files go.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fs;
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::thread;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// Keeps the ONNX runtime quiet on the console unless a filter is asked for.
const CONSOLE_RUNTIME_FILTER: &str = "ort=error";
/// The log file keeps runtime warnings that the console hides.
const FILE_RUNTIME_FILTER: &str = "ort=warn";

pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
const LOG_FILE_PREFIX: &str = "octlens";
const LOG_FILES_KEPT: usize = 14;

static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static REPORTING: AtomicBool = AtomicBool::new(false);

/// Filter directives for the console and the log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogFilters {
    /// `--log-filter` beats `-v`/`-vv`, which beat `RUST_LOG`, which beats
    /// `info`. Runtime chatter is only filtered when the user did not pick a
    /// level on the command line.
    pub fn select(cli_filter: Option<&str>, verbose: u8, rust_log: Option<&str>) -> Self {
        let requested = match (cli_filter, verbose) {
            (Some(filter), _) => Some(filter),
            (None, 0) => None,
            (None, 1) => Some("debug"),
            (None, _) => Some("trace"),
        };
        if let Some(filter) = requested {
            return Self {
                console: filter.to_string(),
                file: filter.to_string(),
            };
        }

        let base = rust_log
            .map(str::trim)
            .filter(|filter| !filter.is_empty())
            .unwrap_or(DEFAULT_LOG_FILTER);
        Self {
            console: format!("{CONSOLE_RUNTIME_FILTER},{base}"),
            file: format!("{FILE_RUNTIME_FILTER},{base}"),
        }
    }
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

pub fn crash_dir(data_dir: &Path) -> PathBuf {
    log_dir(data_dir).join(CRASH_DIR_NAME)
}

/// Daily `octlens.<date>.log` files in `dir`; the newest two weeks are kept.
pub fn rolling_log_file(dir: &Path) -> Result<RollingFileAppender> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(LOG_FILES_KEPT)
        .build(dir)
        .with_context(|| format!("failed to open rolling log in {}", dir.display()))
}

/// What a panic leaves behind in the crash directory.
#[derive(Debug, Serialize)]
struct CrashReport {
    time: DateTime<Utc>,
    args: Vec<String>,
    thread: String,
    location: Option<String>,
    message: String,
    backtrace: Option<String>,
}

impl CrashReport {
    fn from_panic(info: &PanicHookInfo<'_>) -> Self {
        let payload = info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .map(|msg| msg.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".to_string());

        let backtrace = Backtrace::capture();
        Self {
            time: Utc::now(),
            args: std::env::args().collect(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column())),
            message,
            backtrace: (backtrace.status() == BacktraceStatus::Captured)
                .then(|| backtrace.to_string()),
        }
    }

    fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "crash-{}-{}.json",
            self.time.format("%Y%m%dT%H%M%S%.6f"),
            std::process::id()
        ));
        fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }
}

/// Chain a panic hook that writes a JSON crash report into `dir`, creating it
/// on the first panic. Returns `false` if a reporter is already installed, in
/// which case the first directory stays in effect.
pub fn install_crash_reporter(dir: PathBuf) -> bool {
    let mut installed = false;
    CRASH_DIR.get_or_init(|| {
        let previous = panic::take_hook();
        let hook_dir = dir.clone();
        panic::set_hook(Box::new(move |info| {
            report_crash(&hook_dir, info);
            previous(info);
        }));
        installed = true;
        dir
    });
    installed
}

fn report_crash(dir: &Path, info: &PanicHookInfo<'_>) {
    // One report at a time; a panic while reporting falls through to the default hook.
    if REPORTING.swap(true, Ordering::AcqRel) {
        return;
    }
    match CrashReport::from_panic(info).write_to(dir) {
        Ok(path) => eprintln!("Crash report written to {}", path.display()),
        Err(err) => eprintln!(
            "Warning: could not write crash report under {}: {err:#}",
            dir.display()
        ),
    }
    REPORTING.store(false, Ordering::Release);
}
