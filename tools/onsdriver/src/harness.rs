use crate::config::AppConfig;
use crate::errors::DriverError;
use crate::exit::ExitVerdict;
use crate::logging::append_run_log;
use crate::profile::LaunchProfile;
use crate::readiness::newest_log;
use crate::retry::RetryPolicy;
use crate::runtime::ProductionRuntime;
use crate::session::Session;
use crate::types::EnvMap;
use crate::ui::UiAutomation;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const MEMORY_LEAK_MARKER: &str = "Number of memory leaks:";

/// Leak count reported in a target log, or -1 when the log has none.
pub fn memory_leaks(log: &str) -> i64 {
    log.lines()
        .find(|line| line.contains(MEMORY_LEAK_MARKER))
        .and_then(|line| line.rsplit(' ').next())
        .and_then(|count| count.trim().parse().ok())
        .unwrap_or(-1)
}

/// `<name>-<log basename>` with dashes dropped and spaces turned into dashes.
pub fn archive_name(name: &str, log: &Path) -> String {
    let basename = log
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{name}-{}", basename.replace('-', "").replace(' ', "-"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub verdict: ExitVerdict,
    pub memory_leaks: i64,
    pub archived_log: Option<PathBuf>,
}

/// One supervised test run. `start` launches the target and waits until it is
/// ready; `finish` shuts it down, archives its log and checks the leak report.
pub struct TestRun {
    session: Session,
    archive_dir: PathBuf,
}

impl TestRun {
    /// Launches the target and waits until it is usable. On failure the
    /// process is killed before the error is returned.
    pub fn start(
        runtime: &ProductionRuntime,
        cfg: &AppConfig,
        profile: &LaunchProfile,
        config_dir: &Path,
        env_overrides: &EnvMap,
    ) -> Result<Self, DriverError> {
        let mut session = Session::launch(runtime, profile, cfg, config_dir, env_overrides)?;
        let timeout = Duration::from_secs(cfg.readiness.timeout_seconds);

        let mut ready = session.require_ready(timeout);
        if ready.is_ok() && cfg.ui.wait_main_window {
            let policy =
                RetryPolicy::new(timeout, Duration::from_millis(cfg.readiness.poll_interval_ms));
            ready = UiAutomation::new(&mut session).wait_main_window_visible(&policy);
        }
        if let Err(err) = ready {
            append_run_log(
                "error",
                "harness.start.failed",
                json!({ "error": err.to_string() }),
            );
            session.terminate()?;
            return Err(err);
        }

        Ok(Self {
            session,
            archive_dir: cfg.logs.archive_dir.clone(),
        })
    }

    pub fn session(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Shuts the target down and files its log under `<archive_dir>`.
    ///
    /// The log is archived before the leak count is enforced so a leaking
    /// run still leaves its evidence behind.
    pub fn finish(mut self, name: &str) -> Result<RunReport, DriverError> {
        let verdict = self
            .session
            .shutdown(true)?
            .ok_or_else(|| DriverError::Process("shutdown returned no verdict".to_string()))?;

        let fs = Arc::clone(&self.session.file_system);
        let Some(log) = newest_log(fs.as_ref(), self.session.log_dir())? else {
            append_run_log("warn", "harness.log.missing", json!({ "name": name }));
            return Ok(RunReport {
                verdict,
                memory_leaks: -1,
                archived_log: None,
            });
        };

        let leaks = memory_leaks(&fs.read_to_string(&log)?);
        fs.create_dir_all(&self.archive_dir)?;
        let destination = self.archive_dir.join(archive_name(name, &log));
        fs.rename(&log, &destination)?;
        append_run_log(
            "info",
            "harness.log.archived",
            json!({
                "name": name,
                "from": log.display().to_string(),
                "to": destination.display().to_string(),
                "memory_leaks": leaks
            }),
        );

        if leaks != 0 {
            return Err(DriverError::MemoryLeaks(leaks));
        }
        Ok(RunReport {
            verdict,
            memory_leaks: leaks,
            archived_log: Some(destination),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{archive_name, memory_leaks, TestRun};
    use crate::config::AppConfig;
    use crate::errors::DriverError;
    use crate::runtime::{FakeProcessScript, FileSystem};
    use crate::session::test_support::{profile, Fakes};
    use crate::types::EnvMap;
    use serde_json::json;
    use std::path::{Path, PathBuf};

    const LOG: &str = "/obs/logs/2024-05-01 10-00-00.txt";

    fn config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.logs.archive_dir = PathBuf::from("/archive");
        cfg.logs.clear_on_launch = false;
        cfg
    }

    #[test]
    fn leak_count_is_parsed_from_the_log() {
        assert_eq!(memory_leaks("a\nNumber of memory leaks: 0\n"), 0);
        assert_eq!(memory_leaks("info: Number of memory leaks: 12\r\n"), 12);
        assert_eq!(memory_leaks("no report here\n"), -1);
    }

    #[test]
    fn archive_name_flattens_the_timestamp() {
        assert_eq!(
            archive_name("test_plain.Test.test_start", Path::new(LOG)),
            "test_plain.Test.test_start-20240501-100000.txt"
        );
    }

    fn start(fakes: &Fakes) -> TestRun {
        fakes.runner.push_script(FakeProcessScript::exits_with(0, ""));
        fakes
            .fs
            .append(Path::new(LOG), "info: Switched to scene 'Scene'\n");
        fakes.rpc.push_vendor_response(json!({"visible": true}));
        TestRun::start(
            &fakes.runtime(),
            &config(),
            &profile(),
            Path::new("/obs"),
            &EnvMap::new(),
        )
        .expect("start")
    }

    #[test]
    fn finish_archives_the_log_and_reports_the_verdict() {
        let fakes = Fakes::new();
        let run = start(&fakes);
        fakes
            .fs
            .append(Path::new(LOG), "info: Number of memory leaks: 0\n");
        fakes.rpc.push_vendor_response(json!({}));

        let report = run.finish("case").expect("finish");
        assert!(report.verdict.passed);
        assert_eq!(report.memory_leaks, 0);
        let archived = PathBuf::from("/archive/case-20240501-100000.txt");
        assert_eq!(report.archived_log, Some(archived.clone()));
        assert!(fakes.fs.is_file(&archived));
        assert!(!fakes.fs.is_file(Path::new(LOG)));
    }

    #[test]
    fn leaks_fail_after_archiving() {
        let fakes = Fakes::new();
        let run = start(&fakes);
        fakes
            .fs
            .append(Path::new(LOG), "info: Number of memory leaks: 4\n");
        fakes.rpc.push_vendor_response(json!({}));

        let err = run.finish("leaky").expect_err("leaks");
        assert_eq!(err, DriverError::MemoryLeaks(4));
        assert!(fakes
            .fs
            .is_file(Path::new("/archive/leaky-20240501-100000.txt")));
    }

    #[test]
    fn missing_marker_kills_the_target() {
        let fakes = Fakes::new();
        fakes.runner.push_script(FakeProcessScript::exits_with(0, ""));
        let mut cfg = config();
        cfg.readiness.timeout_seconds = 1;

        let err = TestRun::start(
            &fakes.runtime(),
            &cfg,
            &profile(),
            Path::new("/obs"),
            &EnvMap::new(),
        )
        .err()
        .expect("not ready");
        assert!(matches!(err, DriverError::ReadinessTimeout { .. }));
        assert_eq!(fakes.runner.kills().len(), 1);
    }
}
