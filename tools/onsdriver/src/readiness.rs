use crate::errors::DriverError;
use crate::logging::append_run_log;
use crate::retry::{retry, RetryPolicy};
use crate::runtime::{Clock, FileSystem};
use crate::session::Session;
use crate::types::ReadinessState;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Incremental reader over the newest file in the target's log directory.
///
/// Polls inspect only complete lines; a trailing partial line is re-read on the
/// next poll and can be checked on its own with [`LogTail::pending_contains`].
/// Switching to a newer file starts over from its beginning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogTail {
    current: Option<PathBuf>,
    offset: usize,
}

impl LogTail {
    pub fn current(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    /// Reports whether a line completed since the last poll contains `marker`.
    pub fn poll(
        &mut self,
        fs: &dyn FileSystem,
        log_dir: &Path,
        marker: &str,
    ) -> Result<bool, DriverError> {
        let Some(newest) = newest_log(fs, log_dir)? else {
            return Ok(false);
        };
        if self.current.as_ref() != Some(&newest) {
            self.current = Some(newest.clone());
            self.offset = 0;
        }

        let contents = fs.read_to_string(&newest)?;
        let fresh = match contents.get(self.offset..) {
            Some(fresh) => fresh,
            None => {
                // Shrunk or rewritten underneath us.
                self.offset = 0;
                contents.as_str()
            }
        };
        let complete = fresh.rfind('\n').map_or(0, |idx| idx + 1);
        let found = fresh[..complete].lines().any(|line| line.contains(marker));
        self.offset += complete;
        Ok(found)
    }

    /// Checks the unterminated last line of the current file for `marker`.
    pub fn pending_contains(&self, fs: &dyn FileSystem, marker: &str) -> Result<bool, DriverError> {
        let Some(current) = &self.current else {
            return Ok(false);
        };
        let contents = fs.read_to_string(current)?;
        Ok(contents
            .get(self.offset..)
            .is_some_and(|pending| pending.contains(marker)))
    }
}

fn elapsed_ms(clock: &dyn Clock, started: SystemTime) -> u128 {
    clock
        .now()
        .duration_since(started)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0)
}

/// Newest log by file name; names start with a sortable timestamp.
pub fn newest_log(fs: &dyn FileSystem, log_dir: &Path) -> Result<Option<PathBuf>, DriverError> {
    if !fs.exists(log_dir) {
        return Ok(None);
    }
    Ok(fs
        .list_dir(log_dir)?
        .into_iter()
        .max_by(|a, b| a.file_name().cmp(&b.file_name())))
}

impl Session {
    /// Waits for the readiness marker in the target's own log.
    ///
    /// Exhausting the budget yields [`ReadinessState::Failed`] rather than an
    /// error and leaves the process running; waiting again is allowed. A marker
    /// on a last line that never got its newline still counts once the budget
    /// is spent.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<ReadinessState, DriverError> {
        match self.readiness {
            ReadinessState::Ready => return Ok(ReadinessState::Ready),
            ReadinessState::Failed => self.readiness.advance(ReadinessState::WaitingForMarker)?,
            _ => {}
        }

        let cfg = self.config.readiness.clone();
        let clock = Arc::clone(&self.clock);
        let fs = Arc::clone(&self.file_system);
        let log_dir = self.log_dir.clone();
        let mut tail = std::mem::take(&mut self.log_tail);

        let started = clock.now();
        clock.sleep(Duration::from_millis(cfg.warmup_ms));
        let policy = RetryPolicy::new(timeout, Duration::from_millis(cfg.poll_interval_ms));
        let outcome = retry(clock.as_ref(), &policy, |attempt| {
            if tail.poll(fs.as_ref(), &log_dir, &cfg.marker)? {
                return Ok(Some(attempt.count));
            }
            attempt.set_error(match tail.current() {
                Some(path) => format!("`{}` not yet in {}", cfg.marker, path.display()),
                None => format!("no log file in {}", log_dir.display()),
            });
            Ok(None)
        });
        let outcome = match outcome {
            Err(DriverError::Timeout { attempts, message }) => {
                match tail.pending_contains(fs.as_ref(), &cfg.marker) {
                    Ok(true) => Ok(policy.max_attempts()),
                    Ok(false) => Err(DriverError::Timeout { attempts, message }),
                    Err(err) => Err(err),
                }
            }
            other => other,
        };
        self.log_tail = tail;

        match outcome {
            Ok(attempts) => {
                self.readiness.advance(ReadinessState::Ready)?;
                append_run_log(
                    "info",
                    "readiness.ready",
                    json!({
                        "attempts": attempts,
                        "elapsed_ms": elapsed_ms(clock.as_ref(), started),
                        "log": self.log_tail.current().map(|p| p.display().to_string())
                    }),
                );
                Ok(ReadinessState::Ready)
            }
            Err(DriverError::Timeout { attempts, message }) => {
                self.readiness.advance(ReadinessState::Failed)?;
                append_run_log(
                    "warn",
                    "readiness.timeout",
                    json!({
                        "attempts": attempts,
                        "timeout_ms": timeout.as_millis(),
                        "elapsed_ms": elapsed_ms(clock.as_ref(), started),
                        "last": message
                    }),
                );
                Ok(ReadinessState::Failed)
            }
            Err(err) => {
                self.readiness.advance(ReadinessState::Failed)?;
                append_run_log(
                    "error",
                    "readiness.failed",
                    json!({ "error": err.to_string() }),
                );
                Err(err)
            }
        }
    }

    /// Like [`Session::wait_ready`] but treats a missed marker as an error.
    pub fn require_ready(&mut self, timeout: Duration) -> Result<(), DriverError> {
        match self.wait_ready(timeout)? {
            ReadinessState::Ready => Ok(()),
            _ => Err(DriverError::ReadinessTimeout {
                attempts: format!(
                    "{} attempts over {} ms",
                    RetryPolicy::new(
                        timeout,
                        Duration::from_millis(self.config.readiness.poll_interval_ms)
                    )
                    .max_attempts(),
                    timeout.as_millis()
                ),
            }),
        }
    }
}
