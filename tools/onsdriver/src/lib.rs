pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod exit;
pub mod harness;
pub mod logging;
pub mod profile;
pub mod readiness;
pub mod retry;
pub mod rpc;
pub mod runtime;
pub mod session;
pub mod shutdown;
pub mod types;
pub mod ui;

use clap::{error::ErrorKind, Parser};
use config::{load_config, resolve_config_dir, CliOverrides};
use errors::DriverError;
use logging::{append_run_log, init_run_logger, status_line};
use profile::{resolve_profile, ProfileInputs};
use runtime::ProductionRuntime;
use serde_json::json;
use session::Session;
use std::path::PathBuf;
use std::time::Duration;
use types::{env_to_map, EnvMap, ReadinessState};

#[derive(Debug, Clone, Parser)]
#[command(name = "onsdriver")]
#[command(about = "Launch OBS Studio, wait until it is ready and classify how it exits")]
pub struct Cli {
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Executable or install directory; overrides OBS_EXEC.
    #[arg(long = "exec")]
    pub executable: Option<PathBuf>,
    #[arg(long = "timeout-secs")]
    pub timeout_secs: Option<u64>,
    /// Report unwaived error lines without failing on them.
    #[arg(long, default_value_t = false)]
    pub no_check_error: bool,
    #[arg(long, default_value_t = false)]
    pub print_profile: bool,
    #[arg(long)]
    pub run_log: Option<PathBuf>,
}

pub fn run() -> Result<i32, DriverError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let env = std::env::vars_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| DriverError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &env, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    env: &[(std::ffi::OsString, std::ffi::OsString)],
    cwd: &std::path::Path,
    runtime: &ProductionRuntime,
) -> Result<i32, DriverError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(DriverError::Cli(error.to_string())),
        },
    };

    let env_map = env_to_map(env);
    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        executable: cli.executable.clone(),
        timeout_seconds: cli.timeout_secs,
        run_log: cli.run_log.clone(),
    };
    let cfg = load_config(&overrides, &env_map, runtime.file_system.as_ref())?;
    if let Some(path) = &cfg.run_log.path {
        init_run_logger(path);
    }

    let profile = resolve_profile(
        runtime.platform.as_ref(),
        runtime.file_system.as_ref(),
        &ProfileInputs {
            explicit_override: cfg.executable.path.as_deref(),
            extra_args: &cfg.executable.extra_args,
            env: &env_map,
            cwd,
            display: &cfg.display,
        },
    )?;
    if cli.print_profile {
        runtime.terminal.write_line(&profile.command_line())?;
        return Ok(0);
    }

    let config_dir = resolve_config_dir(&cfg, runtime.platform.as_ref(), &env_map)?;
    runtime
        .terminal
        .write_line(&status_line("launch", &profile.command_line()))?;
    let mut session = Session::launch(runtime, &profile, &cfg, &config_dir, &EnvMap::new())?;

    let timeout = Duration::from_secs(cfg.readiness.timeout_seconds);
    if session.wait_ready(timeout)? != ReadinessState::Ready {
        runtime.terminal.write_line(&status_line(
            "readiness",
            &format!(
                "`{}` not seen within {}s; terminating",
                cfg.readiness.marker, cfg.readiness.timeout_seconds
            ),
        ))?;
        session.terminate()?;
        return Ok(1);
    }
    runtime
        .terminal
        .write_line(&status_line("readiness", "ready; waiting for exit"))?;

    match session.wait_and_classify(!cli.no_check_error) {
        Ok(verdict) => {
            runtime.terminal.write_line(&status_line(
                "exit",
                &format!(
                    "code={} unwaived_errors={}",
                    verdict.exit_code,
                    verdict.unwaived_error_lines.len()
                ),
            ))?;
            Ok(0)
        }
        Err(
            err @ (DriverError::AbnormalExit { .. }
            | DriverError::UnwaivedErrorsPresent(_)
            | DriverError::DiagnosticsTruncated { .. }),
        ) => {
            append_run_log("warn", "run.failed", json!({ "error": err.to_string() }));
            runtime
                .terminal
                .write_line(&status_line("exit", &err.to_string()))?;
            Ok(1)
        }
        Err(err) => Err(err),
    }
}
