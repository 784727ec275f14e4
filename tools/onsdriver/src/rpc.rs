use crate::config::{EndpointConfig, RpcConfig};
use crate::errors::DriverError;
use crate::logging::append_run_log;
use crate::runtime::Clock;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CALL_VENDOR_REQUEST: &str = "CallVendorRequest";

/// A connected request/response channel to the target.
pub trait RpcClient: Send {
    fn is_connected(&self) -> bool;
    /// Sends one request and returns the response payload.
    fn send(&mut self, request_type: &str, request_data: Value) -> Result<Value, DriverError>;
    fn disconnect(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Nobody is listening yet; worth retrying while the target lives.
    Refused(String),
    Failed(String),
}

impl ConnectError {
    pub fn message(&self) -> &str {
        match self {
            Self::Refused(message) | Self::Failed(message) => message,
        }
    }
}

pub trait RpcConnector: Send + Sync {
    fn connect(&self, endpoint: &EndpointConfig) -> Result<Box<dyn RpcClient>, ConnectError>;
}

/// Connector for runs that never talk to the target.
pub struct UnavailableConnector;

impl RpcConnector for UnavailableConnector {
    fn connect(&self, _endpoint: &EndpointConfig) -> Result<Box<dyn RpcClient>, ConnectError> {
        Err(ConnectError::Failed(
            "no rpc transport configured".to_string(),
        ))
    }
}

/// Opens a client, retrying refused connections only while `is_alive` holds.
pub fn connect_while_alive(
    connector: &dyn RpcConnector,
    endpoint: &EndpointConfig,
    clock: &dyn Clock,
    cfg: &RpcConfig,
    is_alive: &dyn Fn() -> bool,
) -> Result<Box<dyn RpcClient>, DriverError> {
    let backoff = Duration::from_millis(cfg.connect_backoff_ms);
    let mut last_error = String::new();

    for attempt in 1..=cfg.connect_attempts {
        match connector.connect(endpoint) {
            Ok(client) => {
                if attempt > 1 {
                    append_run_log(
                        "info",
                        "rpc.connect.succeeded_after_retry",
                        json!({
                            "host": endpoint.host,
                            "port": endpoint.port,
                            "failed_attempts": attempt - 1
                        }),
                    );
                }
                return Ok(client);
            }
            Err(ConnectError::Failed(message)) => {
                append_run_log(
                    "error",
                    "rpc.connect.failed",
                    json!({ "attempt": attempt, "error": message }),
                );
                return Err(DriverError::Connection(message));
            }
            Err(ConnectError::Refused(message)) => {
                if !is_alive() {
                    append_run_log(
                        "error",
                        "rpc.connect.target_exited",
                        json!({ "attempt": attempt, "error": message }),
                    );
                    return Err(DriverError::Connection(format!(
                        "target exited while connecting: {message}"
                    )));
                }
                append_run_log(
                    "info",
                    "rpc.connect.refused",
                    json!({
                        "attempt": attempt,
                        "remaining": cfg.connect_attempts - attempt,
                        "error": message
                    }),
                );
                last_error = message;
                if attempt < cfg.connect_attempts {
                    clock.sleep(backoff);
                }
            }
        }
    }

    Err(DriverError::Connection(format!(
        "{last_error} (gave up after {} attempts)",
        cfg.connect_attempts
    )))
}

/// Sends one vendor request and returns its `responseData`.
pub fn send_vendor_request(
    client: &mut dyn RpcClient,
    vendor: &str,
    request_type: &str,
    request_data: Value,
) -> Result<Value, DriverError> {
    let response = client.send(
        CALL_VENDOR_REQUEST,
        json!({
            "vendorName": vendor,
            "requestType": request_type,
            "requestData": request_data,
        }),
    )?;
    response.get("responseData").cloned().ok_or_else(|| {
        DriverError::Protocol(format!(
            "{vendor}/{request_type} response has no responseData: {response}"
        ))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorRetry {
    pub transient_error: String,
    pub delay: Duration,
}

impl VendorRetry {
    pub fn from_config(cfg: &RpcConfig) -> Self {
        Self {
            transient_error: cfg.transient_error.clone(),
            delay: Duration::from_millis(cfg.vendor_retry_delay_ms),
        }
    }
}

/// Calls a vendor request, retrying up to `retry` times while the response
/// carries the transient "object not found yet" error. Any other error in the
/// response is returned at once.
pub fn call_vendor(
    client: &mut dyn RpcClient,
    clock: &dyn Clock,
    policy: &VendorRetry,
    vendor: &str,
    request_type: &str,
    request_data: Value,
    retry: u32,
) -> Result<Value, DriverError> {
    let mut remaining = retry;
    loop {
        let data = send_vendor_request(client, vendor, request_type, request_data.clone())?;
        let Some(error) = data.get("error") else {
            return Ok(data);
        };
        let message = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());

        if message != policy.transient_error {
            return Err(DriverError::VendorError {
                vendor: vendor.to_string(),
                request_type: request_type.to_string(),
                message,
            });
        }
        if remaining == 0 {
            append_run_log(
                "warn",
                "rpc.vendor.transient_exhausted",
                json!({ "vendor": vendor, "request_type": request_type, "retry": retry }),
            );
            return Err(DriverError::TransientRpc {
                vendor: vendor.to_string(),
                request_type: request_type.to_string(),
                message,
            });
        }
        remaining -= 1;
        append_run_log(
            "debug",
            "rpc.vendor.transient_retry",
            json!({ "vendor": vendor, "request_type": request_type, "remaining": remaining }),
        );
        clock.sleep(policy.delay);
    }
}

#[derive(Default)]
struct FakeRpcState {
    connect_outcomes: Vec<Result<(), ConnectError>>,
    responses: Vec<Result<Value, DriverError>>,
    sent: Vec<(String, Value)>,
    connects: u32,
    disconnects: u32,
    connected: bool,
}

/// Scripted connector; every client it hands out shares one response queue.
#[derive(Default, Clone)]
pub struct FakeRpcConnector {
    state: Arc<Mutex<FakeRpcState>>,
}

impl FakeRpcConnector {
    /// Queued connect outcomes are consumed in order; an empty queue connects.
    pub fn push_connect(&self, outcome: Result<(), ConnectError>) {
        self.state
            .lock()
            .expect("rpc lock")
            .connect_outcomes
            .push(outcome);
    }

    pub fn push_response(&self, response: Result<Value, DriverError>) {
        self.state.lock().expect("rpc lock").responses.push(response);
    }

    pub fn push_vendor_response(&self, response_data: Value) {
        self.push_response(Ok(json!({ "responseData": response_data })));
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.state.lock().expect("rpc lock").sent.clone()
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().expect("rpc lock").connects
    }

    pub fn disconnects(&self) -> u32 {
        self.state.lock().expect("rpc lock").disconnects
    }

    /// Simulates the transport dropping underneath a live client.
    pub fn drop_connection(&self) {
        self.state.lock().expect("rpc lock").connected = false;
    }
}

impl RpcConnector for FakeRpcConnector {
    fn connect(&self, _endpoint: &EndpointConfig) -> Result<Box<dyn RpcClient>, ConnectError> {
        let mut state = self.state.lock().expect("rpc lock");
        state.connects += 1;
        if !state.connect_outcomes.is_empty() {
            state.connect_outcomes.remove(0)?;
        }
        state.connected = true;
        Ok(Box::new(FakeRpcClient {
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct FakeRpcClient {
    state: Arc<Mutex<FakeRpcState>>,
}

impl RpcClient for FakeRpcClient {
    fn is_connected(&self) -> bool {
        self.state.lock().expect("rpc lock").connected
    }

    fn send(&mut self, request_type: &str, request_data: Value) -> Result<Value, DriverError> {
        let mut state = self.state.lock().expect("rpc lock");
        if !state.connected {
            return Err(DriverError::Connection("fake transport closed".to_string()));
        }
        state.sent.push((request_type.to_string(), request_data));
        if state.responses.is_empty() {
            return Err(DriverError::Protocol("no fake response queued".to_string()));
        }
        state.responses.remove(0)
    }

    fn disconnect(&mut self) {
        let mut state = self.state.lock().expect("rpc lock");
        state.disconnects += 1;
        state.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeClock;
    use std::cell::Cell;

    fn policy() -> VendorRetry {
        VendorRetry::from_config(&RpcConfig::default())
    }

    #[test]
    fn refused_connections_are_retried_while_target_lives() {
        let connector = FakeRpcConnector::default();
        connector.push_connect(Err(ConnectError::Refused("refused".to_string())));
        connector.push_connect(Err(ConnectError::Refused("refused".to_string())));
        let clock = FakeClock::default();

        let client = connect_while_alive(
            &connector,
            &EndpointConfig::default(),
            &clock,
            &RpcConfig::default(),
            &|| true,
        )
        .expect("connected");

        assert!(client.is_connected());
        assert_eq!(connector.connects(), 3);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(3); 2]);
    }

    #[test]
    fn dead_target_fails_without_backoff() {
        let connector = FakeRpcConnector::default();
        connector.push_connect(Err(ConnectError::Refused("refused".to_string())));
        let clock = FakeClock::default();

        let err = connect_while_alive(
            &connector,
            &EndpointConfig::default(),
            &clock,
            &RpcConfig::default(),
            &|| false,
        )
        .err()
        .expect("must fail");

        assert!(matches!(err, DriverError::Connection(message) if message.contains("refused")));
        assert_eq!(connector.connects(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn budget_exhaustion_reports_the_last_error() {
        let connector = FakeRpcConnector::default();
        let cfg = RpcConfig {
            connect_attempts: 3,
            ..RpcConfig::default()
        };
        for n in 0..3 {
            connector.push_connect(Err(ConnectError::Refused(format!("refused #{n}"))));
        }
        let clock = FakeClock::default();
        let alive_checks = Cell::new(0);

        let err = connect_while_alive(
            &connector,
            &EndpointConfig::default(),
            &clock,
            &cfg,
            &|| {
                alive_checks.set(alive_checks.get() + 1);
                true
            },
        )
        .err()
        .expect("must fail");

        assert_eq!(
            err,
            DriverError::Connection("refused #2 (gave up after 3 attempts)".to_string())
        );
        assert_eq!(alive_checks.get(), 3);
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[test]
    fn non_refusal_errors_are_not_retried() {
        let connector = FakeRpcConnector::default();
        connector.push_connect(Err(ConnectError::Failed("auth rejected".to_string())));
        let clock = FakeClock::default();
        let err = connect_while_alive(
            &connector,
            &EndpointConfig::default(),
            &clock,
            &RpcConfig::default(),
            &|| true,
        )
        .err()
        .expect("must fail");
        assert_eq!(err, DriverError::Connection("auth rejected".to_string()));
        assert_eq!(connector.connects(), 1);
    }

    #[test]
    fn vendor_call_wraps_the_request_envelope() {
        let connector = FakeRpcConnector::default();
        connector.push_vendor_response(json!({"visible": true}));
        let mut client = connector
            .connect(&EndpointConfig::default())
            .expect("connect");
        let clock = FakeClock::default();

        let data = call_vendor(
            client.as_mut(),
            &clock,
            &policy(),
            "ui-ws-automation",
            "widget-list",
            json!({}),
            3,
        )
        .expect("data");

        assert_eq!(data, json!({"visible": true}));
        let sent = connector.sent();
        assert_eq!(sent[0].0, CALL_VENDOR_REQUEST);
        assert_eq!(
            sent[0].1,
            json!({
                "vendorName": "ui-ws-automation",
                "requestType": "widget-list",
                "requestData": {}
            })
        );
    }

    #[test]
    fn transient_error_is_retried_exactly_retry_times() {
        let connector = FakeRpcConnector::default();
        for _ in 0..5 {
            connector.push_vendor_response(json!({"error": "Error: no object found"}));
        }
        let mut client = connector
            .connect(&EndpointConfig::default())
            .expect("connect");
        let clock = FakeClock::default();

        let err = call_vendor(
            client.as_mut(),
            &clock,
            &policy(),
            "ui-ws-automation",
            "widget-invoke",
            json!({"method": "click"}),
            2,
        )
        .expect_err("exhausted");

        assert!(matches!(err, DriverError::TransientRpc { .. }));
        assert_eq!(connector.sent().len(), 3);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1); 2]);
    }

    #[test]
    fn transient_error_then_success_returns_the_payload() {
        let connector = FakeRpcConnector::default();
        connector.push_vendor_response(json!({"error": "Error: no object found"}));
        connector.push_vendor_response(json!({"result": "clicked"}));
        let mut client = connector
            .connect(&EndpointConfig::default())
            .expect("connect");
        let clock = FakeClock::default();

        let data = call_vendor(
            client.as_mut(),
            &clock,
            &policy(),
            "ui-ws-automation",
            "widget-invoke",
            json!({}),
            3,
        )
        .expect("data");
        assert_eq!(data, json!({"result": "clicked"}));
        assert_eq!(clock.sleeps().len(), 1);
    }

    #[test]
    fn other_errors_are_never_retried() {
        let connector = FakeRpcConnector::default();
        connector.push_vendor_response(json!({"error": "Error: method not found"}));
        let mut client = connector
            .connect(&EndpointConfig::default())
            .expect("connect");
        let clock = FakeClock::default();

        let err = call_vendor(
            client.as_mut(),
            &clock,
            &policy(),
            "ui-ws-automation",
            "widget-invoke",
            json!({}),
            3,
        )
        .expect_err("vendor error");

        assert_eq!(
            err,
            DriverError::VendorError {
                vendor: "ui-ws-automation".to_string(),
                request_type: "widget-invoke".to_string(),
                message: "Error: method not found".to_string(),
            }
        );
        assert_eq!(connector.sent().len(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn response_without_data_is_a_protocol_error() {
        let connector = FakeRpcConnector::default();
        connector.push_response(Ok(json!({"vendorName": "x"})));
        let mut client = connector
            .connect(&EndpointConfig::default())
            .expect("connect");
        let err = send_vendor_request(client.as_mut(), "x", "y", json!({})).expect_err("protocol");
        assert!(matches!(err, DriverError::Protocol(_)));
    }

    #[test]
    fn unavailable_connector_is_not_a_refusal() {
        let err = UnavailableConnector
            .connect(&EndpointConfig::default())
            .err()
            .expect("fails");
        assert!(matches!(err, ConnectError::Failed(_)));
        assert_eq!(err.message(), "no rpc transport configured");
    }
}
