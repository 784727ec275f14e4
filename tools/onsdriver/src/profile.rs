use crate::config::DisplayConfig;
use crate::errors::DriverError;
use crate::logging::append_run_log;
use crate::runtime::{FileSystem, ProcessRequest};
use crate::types::{EnvMap, Platform};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const EXEC_OVERRIDE_ENV: &str = "OBS_EXEC";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchProfile {
    pub executable_path: PathBuf,
    pub working_directory: Option<PathBuf>,
    pub command_prefix: Vec<String>,
    pub extra_args: Vec<String>,
    pub platform: Platform,
}

impl LaunchProfile {
    pub fn to_request(&self, env_overrides: &EnvMap) -> ProcessRequest {
        let executable = self.executable_path.display().to_string();
        let mut command = self.command_prefix.clone();
        command.push(executable);
        command.extend(self.extra_args.iter().cloned());
        let program = command.remove(0);
        ProcessRequest {
            program,
            args: command,
            cwd: self.working_directory.clone(),
            env: env_overrides.clone(),
        }
    }

    pub fn command_line(&self) -> String {
        let request = self.to_request(&EnvMap::new());
        std::iter::once(request.program)
            .chain(request.args)
            .map(|part| {
                if part.contains(' ') {
                    format!("'{part}'")
                } else {
                    part
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Per-platform launch rules, chosen once at startup.
pub trait PlatformStrategy: Send + Sync {
    fn platform(&self) -> Platform;

    /// Candidate executables for a user-supplied path, in priority order.
    fn override_candidates(&self, path: &Path) -> Vec<PathBuf>;

    /// Relative install locations probed when no override is given.
    fn well_known_paths(&self) -> &'static [&'static str] {
        &[]
    }

    /// Name handed to the OS as-is when nothing else matches.
    fn default_invocation(&self) -> Option<&'static str> {
        None
    }

    fn accepts_unverified_override(&self) -> bool {
        false
    }

    fn working_directory(&self, _executable: &Path) -> Option<PathBuf> {
        None
    }

    fn needs_display_wrapper(&self, _env: &EnvMap) -> bool {
        false
    }

    fn default_config_dir(&self, env: &EnvMap) -> Option<PathBuf>;
}

pub struct LinuxStrategy;

impl PlatformStrategy for LinuxStrategy {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    fn override_candidates(&self, path: &Path) -> Vec<PathBuf> {
        vec![path.to_path_buf()]
    }

    fn default_invocation(&self) -> Option<&'static str> {
        Some("obs")
    }

    // Overrides may name a binary on PATH, so they are not probed.
    fn accepts_unverified_override(&self) -> bool {
        true
    }

    fn needs_display_wrapper(&self, env: &EnvMap) -> bool {
        env.get("DISPLAY").map_or(true, |display| display.is_empty())
    }

    fn default_config_dir(&self, env: &EnvMap) -> Option<PathBuf> {
        if let Some(xdg) = env.get("XDG_CONFIG_HOME") {
            return Some(PathBuf::from(xdg).join("obs-studio"));
        }
        env.get("HOME")
            .map(|home| PathBuf::from(home).join(".config/obs-studio"))
    }
}

pub struct MacOsStrategy;

impl PlatformStrategy for MacOsStrategy {
    fn platform(&self) -> Platform {
        Platform::MacOs
    }

    fn override_candidates(&self, path: &Path) -> Vec<PathBuf> {
        vec![path.join("Contents/MacOS/OBS"), path.to_path_buf()]
    }

    fn well_known_paths(&self) -> &'static [&'static str] {
        &[
            "obs-studio/OBS.app",
            "obs-studio/build_macos/frontend/RelWithDebInfo/OBS.app",
            "../obs-studio/build_macos/frontend/RelWithDebInfo/OBS.app",
        ]
    }

    fn default_config_dir(&self, env: &EnvMap) -> Option<PathBuf> {
        env.get("HOME")
            .map(|home| PathBuf::from(home).join("Library/Application Support/obs-studio"))
    }
}

pub struct WindowsStrategy;

impl PlatformStrategy for WindowsStrategy {
    fn platform(&self) -> Platform {
        Platform::Windows
    }

    fn override_candidates(&self, path: &Path) -> Vec<PathBuf> {
        vec![path.join("bin/64bit/obs64.exe"), path.to_path_buf()]
    }

    fn well_known_paths(&self) -> &'static [&'static str] {
        &["obs-studio", "../obs-studio"]
    }

    // Plugins and data are located relative to the binary.
    fn working_directory(&self, executable: &Path) -> Option<PathBuf> {
        executable.parent().map(Path::to_path_buf)
    }

    fn default_config_dir(&self, env: &EnvMap) -> Option<PathBuf> {
        env.get("AppData")
            .or_else(|| env.get("APPDATA"))
            .map(|appdata| PathBuf::from(appdata).join("obs-studio"))
    }
}

pub fn strategy_for(platform: Platform) -> Arc<dyn PlatformStrategy> {
    match platform {
        Platform::Linux => Arc::new(LinuxStrategy),
        Platform::MacOs => Arc::new(MacOsStrategy),
        Platform::Windows => Arc::new(WindowsStrategy),
    }
}

pub struct ProfileInputs<'a> {
    pub explicit_override: Option<&'a Path>,
    pub extra_args: &'a [String],
    pub env: &'a EnvMap,
    pub cwd: &'a Path,
    pub display: &'a DisplayConfig,
}

/// Resolves the executable and launch command for the current platform.
///
/// Order: explicit override, then `OBS_EXEC`, then the platform's well-known
/// relative paths, then its default invocation name.
pub fn resolve_profile(
    strategy: &dyn PlatformStrategy,
    fs: &dyn FileSystem,
    inputs: &ProfileInputs<'_>,
) -> Result<LaunchProfile, DriverError> {
    let override_path = inputs
        .explicit_override
        .map(Path::to_path_buf)
        .or_else(|| inputs.env.get(EXEC_OVERRIDE_ENV).map(PathBuf::from));

    let executable_path = match override_path {
        Some(path) => normalize_override(strategy, fs, inputs.cwd, &path)?,
        None => probe_well_known(strategy, fs, inputs.cwd)?,
    };

    let command_prefix = if strategy.needs_display_wrapper(inputs.env) {
        inputs.display.wrapper.clone()
    } else {
        Vec::new()
    };

    let profile = LaunchProfile {
        working_directory: strategy.working_directory(&executable_path),
        executable_path,
        command_prefix,
        extra_args: inputs.extra_args.to_vec(),
        platform: strategy.platform(),
    };
    append_run_log(
        "info",
        "profile.resolved",
        json!({
            "platform": profile.platform.as_str(),
            "executable": profile.executable_path.display().to_string(),
            "wrapped": !profile.command_prefix.is_empty()
        }),
    );
    Ok(profile)
}

fn absolutize(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

fn normalize_override(
    strategy: &dyn PlatformStrategy,
    fs: &dyn FileSystem,
    cwd: &Path,
    path: &Path,
) -> Result<PathBuf, DriverError> {
    if strategy.accepts_unverified_override() {
        return Ok(path.to_path_buf());
    }
    strategy
        .override_candidates(path)
        .into_iter()
        .find(|candidate| fs.is_file(&absolutize(cwd, candidate)))
        .map(|candidate| absolutize(cwd, &candidate))
        .ok_or_else(|| {
            append_run_log(
                "error",
                "profile.override.not_found",
                json!({ "path": path.display().to_string() }),
            );
            DriverError::ExecutableNotFound(format!(
                "{} has no executable for {}",
                path.display(),
                strategy.platform().as_str()
            ))
        })
}

fn probe_well_known(
    strategy: &dyn PlatformStrategy,
    fs: &dyn FileSystem,
    cwd: &Path,
) -> Result<PathBuf, DriverError> {
    for relative in strategy.well_known_paths() {
        for candidate in strategy.override_candidates(Path::new(relative)) {
            let absolute = absolutize(cwd, &candidate);
            if fs.is_file(&absolute) {
                return Ok(absolute);
            }
        }
    }
    if let Some(name) = strategy.default_invocation() {
        return Ok(PathBuf::from(name));
    }
    Err(DriverError::ExecutableNotFound(format!(
        "no obs-studio executable under {} for {}",
        cwd.display(),
        strategy.platform().as_str()
    )))
}
