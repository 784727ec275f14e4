use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("cannot find the executable: {0}")]
    ExecutableNotFound(String),
    #[error("failed to launch {program}: {message}")]
    Launch { program: String, message: String },
    #[error("target did not become ready after {attempts}")]
    ReadinessTimeout { attempts: String },
    #[error("rpc connection failed: {0}")]
    Connection(String),
    #[error("vendor request {vendor}/{request_type} still failing after retries: {message}")]
    TransientRpc {
        vendor: String,
        request_type: String,
        message: String,
    },
    #[error("vendor request {vendor}/{request_type} failed: {message}")]
    VendorError {
        vendor: String,
        request_type: String,
        message: String,
    },
    #[error("rpc protocol error: {0}")]
    Protocol(String),
    #[error("shutdown request returned {0}")]
    UnexpectedShutdownResponse(String),
    #[error("target exited with code {exit_code}")]
    AbnormalExit { exit_code: i32 },
    #[error("target has {} unwaived error line(s) in its diagnostics", .0.len())]
    UnwaivedErrorsPresent(Vec<String>),
    #[error("diagnostics exceeded the {max_bytes}-byte scan limit; later lines were unclassified")]
    DiagnosticsTruncated { max_bytes: u64 },
    #[error("target reported {0} memory leak(s)")]
    MemoryLeaks(i64),
    #[error("timed out after {attempts}: {message}")]
    Timeout { attempts: String, message: String },
}

impl DriverError {
    /// Failures of the environment rather than of the application under test.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::ExecutableNotFound(_)
                | Self::Launch { .. }
                | Self::ReadinessTimeout { .. }
                | Self::Connection(_)
        )
    }
}
