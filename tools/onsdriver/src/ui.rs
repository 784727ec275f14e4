use crate::errors::DriverError;
use crate::logging::append_run_log;
use crate::retry::{retry, RetryPolicy};
use crate::session::Session;
use serde_json::{json, Value};
use std::sync::Arc;

/// Vendor requests against the UI automation companion plugin.
pub struct UiAutomation<'a> {
    session: &'a mut Session,
    vendor: String,
    poll_retry: u32,
}

impl<'a> UiAutomation<'a> {
    pub fn new(session: &'a mut Session) -> Self {
        let vendor = session.config().ui.vendor_name.clone();
        let poll_retry = session.config().rpc.vendor_retry;
        Self {
            session,
            vendor,
            poll_retry,
        }
    }

    pub fn request(
        &mut self,
        request_type: &str,
        request_data: Value,
        retry: u32,
    ) -> Result<Value, DriverError> {
        self.session
            .call_vendor(&self.vendor, request_type, request_data, retry)
    }

    /// Requests sent before the main window is shown can corrupt the UI, so
    /// callers wait for `widget-list` to report it visible first. Each poll
    /// retries transient errors `rpc.vendor_retry` times.
    pub fn wait_main_window_visible(&mut self, policy: &RetryPolicy) -> Result<(), DriverError> {
        let clock = Arc::clone(&self.session.clock);
        let poll_retry = self.poll_retry;
        retry(clock.as_ref(), policy, |attempt| {
            let response = self.request("widget-list", json!({}), poll_retry)?;
            if response.get("visible").and_then(Value::as_bool) == Some(true) {
                append_run_log(
                    "info",
                    "ui.main_window.visible",
                    json!({ "attempts": attempt.count }),
                );
                return Ok(Some(()));
            }
            attempt.set_error("main window not visible yet");
            Ok(None)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::UiAutomation;
    use crate::config::AppConfig;
    use crate::errors::DriverError;
    use crate::retry::RetryPolicy;
    use crate::runtime::FakeProcessScript;
    use crate::session::test_support::Fakes;
    use serde_json::json;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_millis(100))
    }

    #[test]
    fn waits_until_the_window_reports_visible() {
        let fakes = Fakes::new();
        let mut session = fakes.launch(FakeProcessScript::exits_with(0, ""));
        fakes.rpc.push_vendor_response(json!({"visible": false}));
        fakes.rpc.push_vendor_response(json!({"visible": false}));
        fakes.rpc.push_vendor_response(json!({"visible": true}));

        UiAutomation::new(&mut session)
            .wait_main_window_visible(&policy())
            .expect("visible");
        assert_eq!(fakes.rpc.sent().len(), 3);
        assert_eq!(fakes.clock.sleeps(), vec![Duration::from_millis(100); 2]);
    }

    #[test]
    fn never_visible_times_out() {
        let fakes = Fakes::new();
        let mut session = fakes.launch(FakeProcessScript::exits_with(0, ""));
        for _ in 0..11 {
            fakes.rpc.push_vendor_response(json!({"visible": false}));
        }
        let err = UiAutomation::new(&mut session)
            .wait_main_window_visible(&policy())
            .expect_err("timeout");
        assert!(
            matches!(err, DriverError::Timeout { message, .. } if message.contains("not visible"))
        );
    }

    #[test]
    fn request_uses_the_configured_vendor() {
        let fakes = Fakes::new();
        let mut session = fakes.launch(FakeProcessScript::exits_with(0, ""));
        fakes.rpc.push_vendor_response(json!({"result": true}));
        let data = UiAutomation::new(&mut session)
            .request("widget-invoke", json!({"path": "OBSBasic/settingsButton"}), 0)
            .expect("invoke");
        assert_eq!(data, json!({"result": true}));
        assert_eq!(fakes.rpc.sent()[0].1["vendorName"], json!("ui-ws-automation"));
    }

    #[test]
    fn visibility_poll_honours_configured_vendor_retry() {
        let fakes = Fakes::new();
        let mut cfg = AppConfig::default();
        cfg.rpc.vendor_retry = 0;
        let mut session = fakes.launch_with(&cfg, FakeProcessScript::exits_with(0, ""));
        fakes
            .rpc
            .push_vendor_response(json!({"error": "Error: no object found"}));

        let err = UiAutomation::new(&mut session)
            .wait_main_window_visible(&policy())
            .expect_err("transient");
        assert!(matches!(err, DriverError::TransientRpc { .. }));
        assert_eq!(fakes.rpc.sent().len(), 1);
    }
}
