use crate::errors::DriverError;
use crate::logging::append_run_log;
use serde_json::json;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};

pub const DEFAULT_MAX_DIAGNOSTIC_BYTES: u64 = 64 * 1024 * 1024;

/// File-backed capture of the target's stderr.
///
/// The backing file is anonymous and disappears with the buffer. Writers are
/// handed out until [`DiagnosticsBuffer::seal`] is called at process exit; from
/// then on the content is read-only.
#[derive(Debug)]
pub struct DiagnosticsBuffer {
    file: File,
    max_bytes: u64,
    sealed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanSummary {
    pub lines: usize,
    pub truncated: bool,
}

impl DiagnosticsBuffer {
    pub fn new(max_bytes: u64) -> Result<Self, DriverError> {
        let file = tempfile::tempfile().map_err(|e| DriverError::Io(e.to_string()))?;
        Ok(Self {
            file,
            max_bytes,
            sealed: false,
        })
    }

    pub fn writer(&self) -> Result<File, DriverError> {
        if self.sealed {
            return Err(DriverError::Process(
                "diagnostics buffer is sealed".to_string(),
            ));
        }
        self.file
            .try_clone()
            .map_err(|e| DriverError::Io(e.to_string()))
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn len(&self) -> Result<u64, DriverError> {
        self.file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|e| DriverError::Io(e.to_string()))
    }

    pub fn is_empty(&self) -> Result<bool, DriverError> {
        Ok(self.len()? == 0)
    }

    /// Streams captured lines to `visit` without loading the whole capture.
    /// Content past `max_bytes` is skipped.
    pub fn for_each_line(&self, mut visit: impl FnMut(&str)) -> Result<ScanSummary, DriverError> {
        let mut file = self
            .file
            .try_clone()
            .map_err(|e| DriverError::Io(e.to_string()))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| DriverError::Io(e.to_string()))?;
        let total = self.len()?;
        let mut reader = BufReader::new(file.take(self.max_bytes));

        let mut summary = ScanSummary {
            lines: 0,
            truncated: total > self.max_bytes,
        };
        let mut raw = Vec::new();
        loop {
            raw.clear();
            let read = reader
                .read_until(b'\n', &mut raw)
                .map_err(|e| DriverError::Io(e.to_string()))?;
            if read == 0 {
                break;
            }
            let text = String::from_utf8_lossy(&raw);
            let line = text.trim_end_matches(['\n', '\r']);
            summary.lines += 1;
            visit(line);
        }

        if summary.truncated {
            append_run_log(
                "warn",
                "diagnostics.scan.truncated",
                json!({
                    "captured_bytes": total,
                    "max_bytes": self.max_bytes
                }),
            );
        }
        Ok(summary)
    }
}
