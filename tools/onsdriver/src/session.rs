use crate::config::{endpoint_with_plugin_credential, AppConfig, EndpointConfig};
use crate::diagnostics::DiagnosticsBuffer;
use crate::errors::DriverError;
use crate::exit::{ExitVerdict, WaiverList};
use crate::logging::append_run_log;
use crate::profile::LaunchProfile;
use crate::readiness::LogTail;
use crate::rpc::{call_vendor, connect_while_alive, RpcClient, RpcConnector, VendorRetry};
use crate::runtime::{Clock, FileSystem, ProcessRunner, ProductionRuntime, Terminal};
use crate::types::{EnvMap, ReadinessState};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Supervisor-side state for one run of the target process.
///
/// Owns the process handle, the captured diagnostics and at most one RPC
/// client. Nothing here cleans up automatically: callers end a session with
/// [`Session::shutdown`], [`Session::wait_and_classify`] or
/// [`Session::terminate`].
pub struct Session {
    pub(crate) process_runner: Arc<dyn ProcessRunner>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) file_system: Arc<dyn FileSystem>,
    pub(crate) terminal: Arc<dyn Terminal>,
    rpc_connector: Arc<dyn RpcConnector>,
    pub(crate) handle: u64,
    pub(crate) diagnostics: DiagnosticsBuffer,
    rpc: Option<Box<dyn RpcClient>>,
    endpoint: EndpointConfig,
    pub(crate) config: AppConfig,
    pub(crate) log_dir: PathBuf,
    pub(crate) readiness: ReadinessState,
    pub(crate) log_tail: LogTail,
    pub(crate) waivers: WaiverList,
    pub(crate) verdict: Option<ExitVerdict>,
}

impl Session {
    /// Spawns the target described by `profile`. Returns as soon as the OS has
    /// created the process; readiness is a separate step.
    pub fn launch(
        runtime: &ProductionRuntime,
        profile: &LaunchProfile,
        cfg: &AppConfig,
        config_dir: &Path,
        env_overrides: &EnvMap,
    ) -> Result<Self, DriverError> {
        let waivers = WaiverList::from_config(&cfg.diagnostics)?;
        let log_dir = config_dir.join("logs");
        if cfg.logs.clear_on_launch {
            runtime.file_system.remove_dir_all(&log_dir)?;
            append_run_log(
                "debug",
                "launch.logs.cleared",
                json!({ "log_dir": log_dir.display().to_string() }),
            );
        }
        let endpoint = endpoint_with_plugin_credential(
            &cfg.endpoint,
            runtime.file_system.as_ref(),
            config_dir,
        );
        let diagnostics = DiagnosticsBuffer::new(cfg.diagnostics.max_bytes)?;

        let mut readiness = ReadinessState::NotStarted;
        readiness.advance(ReadinessState::Launching)?;

        let request = profile.to_request(env_overrides);
        append_run_log(
            "info",
            "process.spawn.started",
            json!({
                "program": request.program,
                "args": request.args,
                "cwd": request.cwd.as_ref().map(|cwd| cwd.display().to_string())
            }),
        );
        let handle = match runtime.process_runner.spawn(&request, &diagnostics) {
            Ok(handle) => handle,
            Err(err) => {
                append_run_log(
                    "error",
                    "process.spawn.failed",
                    json!({ "program": request.program, "error": err.to_string() }),
                );
                return Err(err);
            }
        };
        readiness.advance(ReadinessState::WaitingForMarker)?;
        append_run_log(
            "info",
            "process.spawn.succeeded",
            json!({ "handle": handle, "log_dir": log_dir.display().to_string() }),
        );

        Ok(Self {
            process_runner: Arc::clone(&runtime.process_runner),
            clock: Arc::clone(&runtime.clock),
            file_system: Arc::clone(&runtime.file_system),
            terminal: Arc::clone(&runtime.terminal),
            rpc_connector: Arc::clone(&runtime.rpc_connector),
            handle,
            diagnostics,
            rpc: None,
            endpoint,
            config: cfg.clone(),
            log_dir,
            readiness,
            log_tail: LogTail::default(),
            waivers,
            verdict: None,
        })
    }

    pub fn readiness(&self) -> ReadinessState {
        self.readiness
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn diagnostics(&self) -> &DiagnosticsBuffer {
        &self.diagnostics
    }

    pub fn is_alive(&self) -> bool {
        self.process_runner.is_alive(self.handle)
    }

    pub fn has_client(&self) -> bool {
        self.rpc.is_some()
    }

    /// Returns the cached client when it is still connected, otherwise builds
    /// a new one. Refused connections are retried only while the target lives.
    pub fn get_client(&mut self, use_cache: bool) -> Result<&mut dyn RpcClient, DriverError> {
        let reusable = use_cache
            && self
                .rpc
                .as_ref()
                .is_some_and(|client| client.is_connected());

        if !reusable {
            if self.rpc.is_some() {
                append_run_log(
                    "debug",
                    "rpc.client.replaced",
                    json!({ "use_cache": use_cache }),
                );
            }
            self.release_client();
            let runner = Arc::clone(&self.process_runner);
            let handle = self.handle;
            let client = connect_while_alive(
                self.rpc_connector.as_ref(),
                &self.endpoint,
                self.clock.as_ref(),
                &self.config.rpc,
                &|| runner.is_alive(handle),
            )?;
            self.rpc = Some(client);
        }

        match &mut self.rpc {
            Some(client) => Ok(client.as_mut()),
            None => Err(DriverError::Connection("no rpc client".to_string())),
        }
    }

    /// Vendor request over the session's client with transient-error retry.
    pub fn call_vendor(
        &mut self,
        vendor: &str,
        request_type: &str,
        request_data: Value,
        retry: u32,
    ) -> Result<Value, DriverError> {
        let clock = Arc::clone(&self.clock);
        let policy = VendorRetry::from_config(&self.config.rpc);
        let client = self.get_client(true)?;
        call_vendor(
            client,
            clock.as_ref(),
            &policy,
            vendor,
            request_type,
            request_data,
            retry,
        )
    }

    /// Closes the transport and drops the cached client, if any.
    pub fn release_client(&mut self) {
        if let Some(mut client) = self.rpc.take() {
            client.disconnect();
            append_run_log("debug", "rpc.client.released", json!({}));
        }
    }

    /// Kills the target without classifying its exit.
    pub fn terminate(&mut self) -> Result<(), DriverError> {
        self.release_client();
        self.process_runner.kill(self.handle)?;
        append_run_log(
            "warn",
            "process.terminated",
            json!({ "handle": self.handle }),
        );
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{profile, Fakes};
    use super::Session;
    use crate::config::AppConfig;
    use crate::errors::DriverError;
    use crate::rpc::ConnectError;
    use crate::runtime::{FakeProcessScript, FileSystem, ProcessRunner};
    use crate::types::{EnvMap, ReadinessState};
    use serde_json::json;
    use std::path::{Path, PathBuf};

    #[test]
    fn launch_clears_stale_logs_and_waits_for_marker() {
        let fakes = Fakes::new();
        fakes
            .fs
            .write_string(Path::new("/obs/logs/old.txt"), "Switched to scene\n")
            .expect("seed");
        let session = fakes.launch(FakeProcessScript::exits_with(0, ""));

        assert_eq!(session.readiness(), ReadinessState::WaitingForMarker);
        assert_eq!(session.log_dir(), Path::new("/obs/logs"));
        assert!(fakes.fs.file_paths().is_empty());
        let spawned = fakes.runner.spawned();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].program, "/bin/app");
    }

    #[test]
    fn launch_failure_is_a_launch_error() {
        let fakes = Fakes::new();
        let err = Session::launch(
            &fakes.runtime(),
            &profile(),
            &AppConfig::default(),
            Path::new("/obs"),
            &EnvMap::new(),
        )
        .err()
        .expect("nothing queued");
        assert!(matches!(err, DriverError::Launch { .. }));
        assert!(err.is_infrastructure());
    }

    #[test]
    fn endpoint_picks_up_the_plugin_credential() {
        let fakes = Fakes::new();
        fakes
            .fs
            .write_string(
                &PathBuf::from("/obs/plugin_config/obs-websocket/config.json"),
                r#"{"auth_required": true, "server_password": "pw"}"#,
            )
            .expect("seed");
        let session = fakes.launch(FakeProcessScript::exits_with(0, ""));
        assert_eq!(session.endpoint().password.as_deref(), Some("pw"));
    }

    #[test]
    fn connected_client_is_reused() {
        let fakes = Fakes::new();
        let mut session = fakes.launch(FakeProcessScript::exits_with(0, ""));
        session.get_client(true).expect("first");
        session.get_client(true).expect("second");
        assert_eq!(fakes.rpc.connects(), 1);

        session.get_client(false).expect("fresh");
        assert_eq!(fakes.rpc.connects(), 2);
        assert_eq!(fakes.rpc.disconnects(), 1);
    }

    #[test]
    fn disconnected_client_is_rebuilt() {
        let fakes = Fakes::new();
        let mut session = fakes.launch(FakeProcessScript::exits_with(0, ""));
        session.get_client(true).expect("first");
        fakes.rpc.drop_connection();
        let client = session.get_client(true).expect("rebuilt");
        assert!(client.is_connected());
        assert_eq!(fakes.rpc.connects(), 2);
    }

    #[test]
    fn dead_target_fails_fast_without_sleeping() {
        let fakes = Fakes::new();
        let mut session = fakes.launch(FakeProcessScript::already_dead(1));
        fakes
            .rpc
            .push_connect(Err(ConnectError::Refused("connection refused".to_string())));

        let err = session.get_client(true).err().expect("dead target");
        assert!(matches!(err, DriverError::Connection(_)));
        assert!(fakes.clock.sleeps().is_empty());
        assert!(!session.has_client());
    }

    #[test]
    fn target_exiting_after_launch_stops_connect_retries() {
        let fakes = Fakes::new();
        let mut session = fakes.launch(FakeProcessScript::exits_with(0, ""));
        assert!(session.is_alive());
        fakes.runner.exit_now(session.handle());
        fakes
            .rpc
            .push_connect(Err(ConnectError::Refused("connection refused".to_string())));

        let err = session.get_client(true).err().expect("exited target");
        assert!(
            matches!(&err, DriverError::Connection(message) if message.contains("target exited"))
        );
        assert_eq!(fakes.rpc.connects(), 1);
        assert!(fakes.clock.sleeps().is_empty());
    }

    #[test]
    fn vendor_calls_go_through_the_cached_client() {
        let fakes = Fakes::new();
        let mut session = fakes.launch(FakeProcessScript::exits_with(0, ""));
        fakes.rpc.push_vendor_response(json!({"visible": false}));
        fakes.rpc.push_vendor_response(json!({"visible": true}));

        session
            .call_vendor("ui-ws-automation", "widget-list", json!({}), 0)
            .expect("first");
        let data = session
            .call_vendor("ui-ws-automation", "widget-list", json!({}), 0)
            .expect("second");
        assert_eq!(data["visible"], json!(true));
        assert_eq!(fakes.rpc.connects(), 1);
    }

    #[test]
    fn terminate_kills_and_releases() {
        let fakes = Fakes::new();
        let mut session = fakes.launch(FakeProcessScript::exits_with(0, ""));
        session.get_client(true).expect("client");
        session.terminate().expect("terminate");
        assert!(!session.has_client());
        assert_eq!(fakes.runner.kills(), vec![session.handle()]);
        assert!(!fakes.runner.is_alive(session.handle()));
    }
}
