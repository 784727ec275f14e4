use crate::errors::DriverError;
use crate::logging::append_run_log;
use crate::profile::PlatformStrategy;
use crate::runtime::FileSystem;
use crate::types::EnvMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};

pub const ARCHIVE_DIR_ENV: &str = "ONSDRIVER_LOGS";
const OBSWS_CONFIG_PATH: &str = "plugin_config/obs-websocket/config.json";

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub executable: Option<PathBuf>,
    pub timeout_seconds: Option<u64>,
    pub run_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    pub executable: ExecutableConfig,
    pub endpoint: EndpointConfig,
    pub logs: LogsConfig,
    pub readiness: ReadinessConfig,
    pub rpc: RpcConfig,
    pub ui: UiConfig,
    pub shutdown: ShutdownConfig,
    pub diagnostics: DiagnosticsConfig,
    pub display: DisplayConfig,
    pub run_log: RunLogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExecutableConfig {
    pub path: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogsConfig {
    pub config_dir: Option<PathBuf>,
    pub clear_on_launch: bool,
    pub archive_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadinessConfig {
    pub marker: String,
    pub warmup_ms: u64,
    pub poll_interval_ms: u64,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcConfig {
    pub connect_attempts: u32,
    pub connect_backoff_ms: u64,
    pub vendor_retry: u32,
    pub vendor_retry_delay_ms: u64,
    pub transient_error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UiConfig {
    pub vendor_name: String,
    pub wait_main_window: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShutdownConfig {
    pub vendor_name: String,
    pub request_type: String,
    pub support_url: String,
    pub force: bool,
    pub exit_timeout_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagnosticsConfig {
    pub max_bytes: u64,
    pub error_prefix: String,
    pub include_default_waivers: bool,
    pub waived_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisplayConfig {
    pub wrapper: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RunLogConfig {
    pub path: Option<PathBuf>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4455,
            password: None,
        }
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            config_dir: None,
            clear_on_launch: true,
            archive_dir: PathBuf::from("logs"),
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            marker: "Switched to scene".to_string(),
            warmup_ms: 200,
            poll_interval_ms: 100,
            timeout_seconds: 10,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 10,
            connect_backoff_ms: 3000,
            vendor_retry: 3,
            vendor_retry_delay_ms: 1000,
            transient_error: "Error: no object found".to_string(),
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            vendor_name: "ui-ws-automation".to_string(),
            wait_main_window: true,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            vendor_name: "obs-shutdown-plugin".to_string(),
            request_type: "shutdown".to_string(),
            support_url: "https://github.com/noris-plugins-for-obs/onsdriver/issues".to_string(),
            force: true,
            exit_timeout_seconds: 5.0,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            max_bytes: crate::diagnostics::DEFAULT_MAX_DIAGNOSTIC_BYTES,
            error_prefix: "error:".to_string(),
            include_default_waivers: true,
            waived_patterns: Vec::new(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            wrapper: vec![
                "xvfb-run".to_string(),
                "-s".to_string(),
                "-screen 0 1080x768x24".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialAppConfig {
    executable: Option<PartialExecutableConfig>,
    endpoint: Option<PartialEndpointConfig>,
    logs: Option<PartialLogsConfig>,
    readiness: Option<PartialReadinessConfig>,
    rpc: Option<PartialRpcConfig>,
    ui: Option<PartialUiConfig>,
    shutdown: Option<PartialShutdownConfig>,
    diagnostics: Option<PartialDiagnosticsConfig>,
    display: Option<DisplayConfig>,
    run_log: Option<RunLogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialExecutableConfig {
    path: Option<PathBuf>,
    extra_args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialEndpointConfig {
    host: Option<String>,
    port: Option<u16>,
    password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLogsConfig {
    config_dir: Option<PathBuf>,
    clear_on_launch: Option<bool>,
    archive_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialReadinessConfig {
    marker: Option<String>,
    warmup_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRpcConfig {
    connect_attempts: Option<u32>,
    connect_backoff_ms: Option<u64>,
    vendor_retry: Option<u32>,
    vendor_retry_delay_ms: Option<u64>,
    transient_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialUiConfig {
    vendor_name: Option<String>,
    wait_main_window: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialShutdownConfig {
    vendor_name: Option<String>,
    request_type: Option<String>,
    support_url: Option<String>,
    force: Option<bool>,
    exit_timeout_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialDiagnosticsConfig {
    max_bytes: Option<u64>,
    error_prefix: Option<String>,
    include_default_waivers: Option<bool>,
    waived_patterns: Option<Vec<String>>,
}

pub fn load_config(
    overrides: &CliOverrides,
    env: &EnvMap,
    fs: &dyn FileSystem,
) -> Result<AppConfig, DriverError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(path)?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| DriverError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    if let Some(dir) = env.get(ARCHIVE_DIR_ENV) {
        cfg.logs.archive_dir = PathBuf::from(dir);
    }
    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;

    append_run_log(
        "debug",
        "config.loaded",
        json!({
            "config_path": overrides.config_path.as_ref().map(|p| p.display().to_string()),
            "endpoint_port": cfg.endpoint.port,
            "readiness_timeout_seconds": cfg.readiness.timeout_seconds
        }),
    );
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(executable) = partial.executable {
        if let Some(path) = executable.path {
            cfg.executable.path = Some(path);
        }
        if let Some(extra_args) = executable.extra_args {
            cfg.executable.extra_args = extra_args;
        }
    }

    if let Some(endpoint) = partial.endpoint {
        if let Some(host) = endpoint.host {
            cfg.endpoint.host = host;
        }
        if let Some(port) = endpoint.port {
            cfg.endpoint.port = port;
        }
        if let Some(password) = endpoint.password {
            cfg.endpoint.password = Some(password);
        }
    }

    if let Some(logs) = partial.logs {
        if let Some(config_dir) = logs.config_dir {
            cfg.logs.config_dir = Some(config_dir);
        }
        if let Some(value) = logs.clear_on_launch {
            cfg.logs.clear_on_launch = value;
        }
        if let Some(value) = logs.archive_dir {
            cfg.logs.archive_dir = value;
        }
    }

    if let Some(readiness) = partial.readiness {
        if let Some(value) = readiness.marker {
            cfg.readiness.marker = value;
        }
        if let Some(value) = readiness.warmup_ms {
            cfg.readiness.warmup_ms = value;
        }
        if let Some(value) = readiness.poll_interval_ms {
            cfg.readiness.poll_interval_ms = value;
        }
        if let Some(value) = readiness.timeout_seconds {
            cfg.readiness.timeout_seconds = value;
        }
    }

    if let Some(rpc) = partial.rpc {
        if let Some(value) = rpc.connect_attempts {
            cfg.rpc.connect_attempts = value;
        }
        if let Some(value) = rpc.connect_backoff_ms {
            cfg.rpc.connect_backoff_ms = value;
        }
        if let Some(value) = rpc.vendor_retry {
            cfg.rpc.vendor_retry = value;
        }
        if let Some(value) = rpc.vendor_retry_delay_ms {
            cfg.rpc.vendor_retry_delay_ms = value;
        }
        if let Some(value) = rpc.transient_error {
            cfg.rpc.transient_error = value;
        }
    }

    if let Some(ui) = partial.ui {
        if let Some(value) = ui.vendor_name {
            cfg.ui.vendor_name = value;
        }
        if let Some(value) = ui.wait_main_window {
            cfg.ui.wait_main_window = value;
        }
    }

    if let Some(shutdown) = partial.shutdown {
        if let Some(value) = shutdown.vendor_name {
            cfg.shutdown.vendor_name = value;
        }
        if let Some(value) = shutdown.request_type {
            cfg.shutdown.request_type = value;
        }
        if let Some(value) = shutdown.support_url {
            cfg.shutdown.support_url = value;
        }
        if let Some(value) = shutdown.force {
            cfg.shutdown.force = value;
        }
        if let Some(value) = shutdown.exit_timeout_seconds {
            cfg.shutdown.exit_timeout_seconds = value;
        }
    }

    if let Some(diagnostics) = partial.diagnostics {
        if let Some(value) = diagnostics.max_bytes {
            cfg.diagnostics.max_bytes = value;
        }
        if let Some(value) = diagnostics.error_prefix {
            cfg.diagnostics.error_prefix = value;
        }
        if let Some(value) = diagnostics.include_default_waivers {
            cfg.diagnostics.include_default_waivers = value;
        }
        if let Some(value) = diagnostics.waived_patterns {
            cfg.diagnostics.waived_patterns = value;
        }
    }

    if let Some(display) = partial.display {
        cfg.display = display;
    }

    if let Some(run_log) = partial.run_log {
        cfg.run_log = run_log;
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(path) = &overrides.executable {
        cfg.executable.path = Some(path.clone());
    }
    if let Some(timeout) = overrides.timeout_seconds {
        cfg.readiness.timeout_seconds = timeout;
    }
    if let Some(path) = &overrides.run_log {
        cfg.run_log.path = Some(path.clone());
    }
}

pub fn validate_config(cfg: &AppConfig) -> Result<(), DriverError> {
    if cfg.readiness.marker.trim().is_empty() {
        return Err(DriverError::InvalidConfig(
            "readiness.marker must not be empty".to_string(),
        ));
    }
    if cfg.readiness.poll_interval_ms == 0 {
        return Err(DriverError::InvalidConfig(
            "readiness.poll_interval_ms must be greater than zero".to_string(),
        ));
    }
    if cfg.rpc.connect_attempts == 0 {
        return Err(DriverError::InvalidConfig(
            "rpc.connect_attempts must be greater than zero".to_string(),
        ));
    }
    if cfg.diagnostics.error_prefix.is_empty() {
        return Err(DriverError::InvalidConfig(
            "diagnostics.error_prefix must not be empty".to_string(),
        ));
    }
    if cfg.diagnostics.max_bytes == 0 {
        return Err(DriverError::InvalidConfig(
            "diagnostics.max_bytes must be greater than zero".to_string(),
        ));
    }
    if !cfg.shutdown.exit_timeout_seconds.is_finite() || cfg.shutdown.exit_timeout_seconds < 0.0 {
        return Err(DriverError::InvalidConfig(
            "shutdown.exit_timeout_seconds must be a non-negative number".to_string(),
        ));
    }
    for pattern in &cfg.diagnostics.waived_patterns {
        regex::Regex::new(pattern).map_err(|e| {
            DriverError::InvalidConfig(format!("diagnostics.waived_patterns `{pattern}`: {e}"))
        })?;
    }
    Ok(())
}

/// Directory holding the target's settings; its `logs/` child is tailed for readiness.
pub fn resolve_config_dir(
    cfg: &AppConfig,
    strategy: &dyn PlatformStrategy,
    env: &EnvMap,
) -> Result<PathBuf, DriverError> {
    if let Some(dir) = &cfg.logs.config_dir {
        return Ok(dir.clone());
    }
    strategy.default_config_dir(env).ok_or_else(|| {
        DriverError::InvalidConfig(format!(
            "cannot derive the obs-studio config directory on {}; set logs.config_dir",
            strategy.platform().as_str()
        ))
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ObswsPluginConfig {
    #[serde(default)]
    auth_required: bool,
    server_password: Option<String>,
    server_port: Option<u16>,
}

/// Fills in the endpoint credential from the websocket plugin's own settings
/// when the driver config does not carry one. The plugin file is never written.
pub fn endpoint_with_plugin_credential(
    endpoint: &EndpointConfig,
    fs: &dyn FileSystem,
    config_dir: &Path,
) -> EndpointConfig {
    if endpoint.password.is_some() {
        return endpoint.clone();
    }
    let path = config_dir.join(OBSWS_CONFIG_PATH);
    let plugin = fs
        .read_to_string(&path)
        .ok()
        .and_then(|text| serde_json::from_str::<ObswsPluginConfig>(&text).ok())
        .unwrap_or_default();

    let mut resolved = endpoint.clone();
    if plugin.auth_required {
        resolved.password = plugin.server_password;
    }
    if let Some(port) = plugin.server_port {
        resolved.port = port;
    }
    resolved
}
