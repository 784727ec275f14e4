use crate::errors::DriverError;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub ts_unix_ms: u128,
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: 4096,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), DriverError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| DriverError::Io(e.to_string()))?;
            }
        }
        self.rotate_if_over_budget()?;

        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let line = serde_json::to_string(&LogEvent {
            ts_unix_ms: event.ts_unix_ms,
            level: event.level,
            event_type: event.event_type,
            payload: truncated,
        })
        .map_err(|e| DriverError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| DriverError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| DriverError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| DriverError::Io(e.to_string()))?;
        Ok(())
    }

    /// Keeps at most one previous generation next to the live file.
    fn rotate_if_over_budget(&self) -> Result<(), DriverError> {
        let Ok(meta) = fs::metadata(&self.path) else {
            return Ok(());
        };
        if meta.len() <= self.budget_bytes {
            return Ok(());
        }
        let mut rotated = self.path.clone().into_os_string();
        rotated.push(".1");
        fs::rename(&self.path, PathBuf::from(rotated)).map_err(|e| DriverError::Io(e.to_string()))
    }
}

static RUN_LOGGER: OnceLock<Mutex<Option<JsonlLogger>>> = OnceLock::new();

fn run_logger() -> &'static Mutex<Option<JsonlLogger>> {
    RUN_LOGGER.get_or_init(|| Mutex::new(None))
}

/// Installs the process-wide run log. Events emitted before this call are dropped.
pub fn init_run_logger(path: impl AsRef<Path>) {
    if let Ok(mut guard) = run_logger().lock() {
        *guard = Some(JsonlLogger::new(path));
    }
}

pub fn clear_run_logger() {
    if let Ok(mut guard) = run_logger().lock() {
        *guard = None;
    }
}

pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let Ok(guard) = run_logger().lock() else {
        return;
    };
    let Some(logger) = guard.as_ref() else {
        return;
    };
    let ts_unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    // Run-log write failures are ignored.
    let _ = logger.append(&LogEvent {
        ts_unix_ms,
        level,
        event_type,
        payload,
    });
}

pub fn status_line(stage: &str, message: &str) -> String {
    format!(
        "onsdriver stage={stage} message={}",
        message.replace('\n', "\\n")
    )
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}
