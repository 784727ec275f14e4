use crate::config::ShutdownConfig;
use crate::errors::DriverError;
use crate::exit::ExitVerdict;
use crate::logging::append_run_log;
use crate::rpc::send_vendor_request;
use crate::session::Session;
use serde_json::{json, Value};

fn invoking_program() -> String {
    std::env::args()
        .next()
        .unwrap_or_else(|| "onsdriver".to_string())
}

pub fn shutdown_request_data(cfg: &ShutdownConfig, invoker: &str) -> Value {
    json!({
        "reason": format!("requested through onsdriver by {invoker}"),
        "support_url": cfg.support_url,
        "force": cfg.force,
        "exit_timeout": cfg.exit_timeout_seconds,
    })
}

fn is_empty_payload(payload: &Value) -> bool {
    payload.as_object().is_some_and(|map| map.is_empty())
}

impl Session {
    /// Asks the target to exit through its shutdown vendor request.
    ///
    /// The RPC client is released whatever the outcome. A non-empty response
    /// is [`DriverError::UnexpectedShutdownResponse`]. With `wait` the exit is
    /// classified (`check_error = true`), otherwise `None` is returned at once.
    pub fn shutdown(&mut self, wait: bool) -> Result<Option<ExitVerdict>, DriverError> {
        let cfg = self.config.shutdown.clone();
        let data = shutdown_request_data(&cfg, &invoking_program());
        append_run_log(
            "info",
            "shutdown.requested",
            json!({ "vendor": cfg.vendor_name, "wait": wait }),
        );

        let response = self.get_client(true).and_then(|client| {
            send_vendor_request(client, &cfg.vendor_name, &cfg.request_type, data)
        });
        self.release_client();

        let response = response?;
        if !is_empty_payload(&response) {
            append_run_log(
                "error",
                "shutdown.unexpected_response",
                json!({ "response": response }),
            );
            return Err(DriverError::UnexpectedShutdownResponse(response.to_string()));
        }

        if !wait {
            return Ok(None);
        }
        self.wait_and_classify(true).map(Some)
    }
}
