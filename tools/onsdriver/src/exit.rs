use crate::config::DiagnosticsConfig;
use crate::errors::DriverError;
use crate::logging::append_run_log;
use crate::session::Session;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Diagnostic lines known to be harmless. Several only show up on a first
/// run or depend on timing inside third-party components.
pub const DEFAULT_WAIVED_PATTERNS: &[&str] = &[
    r"error: Failed to rename basic scene collection file:",
    r"error: Tried to call obs_frontend_remove_event_callback with no callbacks!",
    r"error: glBindFramebuffer failed, glGetError returned GL_INVALID_OPERATION",
    r"error: \[mac-virtualcam\] mac-camera-extension: OSSystemExtensionErrorCode 2",
    r"error: os_dlopen.*VLC.app",
    r"error: Crash sentinel location .* unable to create directory",
];

#[derive(Debug, Clone)]
pub struct WaiverList {
    patterns: Vec<Regex>,
}

impl WaiverList {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, DriverError> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                Regex::new(pattern).map_err(|e| {
                    DriverError::InvalidConfig(format!("waived pattern `{pattern}`: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn from_config(cfg: &DiagnosticsConfig) -> Result<Self, DriverError> {
        let mut patterns: Vec<String> = Vec::new();
        if cfg.include_default_waivers {
            patterns.extend(DEFAULT_WAIVED_PATTERNS.iter().map(|p| p.to_string()));
        }
        patterns.extend(cfg.waived_patterns.iter().cloned());
        Self::new(&patterns)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Patterns may match anywhere in the line.
    pub fn is_waived(&self, line: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(line))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitVerdict {
    pub exit_code: i32,
    pub unwaived_error_lines: Vec<String>,
    /// Captured stderr ran past `diagnostics.max_bytes` and was only partly scanned.
    pub diagnostics_truncated: bool,
    pub passed: bool,
}

pub fn is_unwaived_error(line: &str, waivers: &WaiverList, error_prefix: &str) -> bool {
    line.starts_with(error_prefix) && !waivers.is_waived(line)
}

/// Picks the unwaived error lines out of a diagnostic stream, in order.
pub fn unwaived_errors<'a>(
    lines: impl IntoIterator<Item = &'a str>,
    waivers: &WaiverList,
    error_prefix: &str,
) -> Vec<String> {
    lines
        .into_iter()
        .filter(|line| is_unwaived_error(line, waivers, error_prefix))
        .map(str::to_string)
        .collect()
}

fn verdict_outcome(
    verdict: ExitVerdict,
    check_error: bool,
    max_bytes: u64,
) -> Result<ExitVerdict, DriverError> {
    if verdict.exit_code != 0 {
        return Err(DriverError::AbnormalExit {
            exit_code: verdict.exit_code,
        });
    }
    if check_error && !verdict.unwaived_error_lines.is_empty() {
        return Err(DriverError::UnwaivedErrorsPresent(
            verdict.unwaived_error_lines,
        ));
    }
    if check_error && verdict.diagnostics_truncated {
        return Err(DriverError::DiagnosticsTruncated { max_bytes });
    }
    Ok(verdict)
}

impl Session {
    /// The verdict, once the process has exited and been classified.
    pub fn verdict(&self) -> Option<&ExitVerdict> {
        self.verdict.as_ref()
    }

    /// Blocks until the target exits, then classifies its exit code and the
    /// captured diagnostics.
    ///
    /// Unwaived error lines are echoed to the terminal's error stream while
    /// scanning. The verdict is computed once; later calls reuse it and never
    /// touch the (sealed) buffer again.
    pub fn wait_and_classify(&mut self, check_error: bool) -> Result<ExitVerdict, DriverError> {
        if let Some(verdict) = &self.verdict {
            append_run_log(
                "debug",
                "exit.verdict.cached",
                json!({ "exit_code": verdict.exit_code, "check_error": check_error }),
            );
            return verdict_outcome(
                verdict.clone(),
                check_error,
                self.config.diagnostics.max_bytes,
            );
        }

        self.release_client();
        append_run_log("info", "process.wait.started", json!({ "handle": self.handle }));
        let exit_code = self.process_runner.wait(self.handle)?;
        self.diagnostics.seal();

        let prefix = self.config.diagnostics.error_prefix.clone();
        let mut unwaived = Vec::new();
        let mut echo_error = None;
        let summary = self.diagnostics.for_each_line(|line| {
            if !is_unwaived_error(line, &self.waivers, &prefix) {
                return;
            }
            if let Err(err) = self.terminal.write_err_line(line) {
                echo_error.get_or_insert(err);
            }
            unwaived.push(line.to_string());
        })?;
        if let Some(err) = echo_error {
            return Err(err);
        }

        let verdict = ExitVerdict {
            exit_code,
            passed: exit_code == 0 && unwaived.is_empty() && !summary.truncated,
            unwaived_error_lines: unwaived,
            diagnostics_truncated: summary.truncated,
        };
        append_run_log(
            if verdict.passed { "info" } else { "warn" },
            "exit.classified",
            json!({
                "exit_code": verdict.exit_code,
                "unwaived_errors": verdict.unwaived_error_lines.len(),
                "scanned_lines": summary.lines,
                "truncated": summary.truncated,
                "passed": verdict.passed
            }),
        );
        self.verdict = Some(verdict.clone());
        verdict_outcome(verdict, check_error, self.config.diagnostics.max_bytes)
    }
}
