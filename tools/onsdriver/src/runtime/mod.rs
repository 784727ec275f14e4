use crate::diagnostics::DiagnosticsBuffer;
use crate::errors::DriverError;
use crate::profile::{strategy_for, PlatformStrategy};
use crate::rpc::{RpcConnector, UnavailableConnector};
use crate::types::Platform;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep(&self, duration: Duration);
}

/// Spawns and observes OS processes. Stdout of a spawned process is discarded and
/// stderr lands in the supplied diagnostics buffer.
pub trait ProcessRunner: Send + Sync {
    fn spawn(
        &self,
        request: &ProcessRequest,
        diagnostics: &DiagnosticsBuffer,
    ) -> Result<u64, DriverError>;
    /// `None` while the process is still running.
    fn try_wait(&self, handle: u64) -> Result<Option<i32>, DriverError>;
    fn wait(&self, handle: u64) -> Result<i32, DriverError>;
    fn kill(&self, handle: u64) -> Result<(), DriverError>;

    fn is_alive(&self, handle: u64) -> bool {
        matches!(self.try_wait(handle), Ok(None))
    }
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, DriverError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), DriverError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), DriverError>;
    fn remove_dir_all(&self, path: &Path) -> Result<(), DriverError>;
    fn rename(&self, from: &Path, to: &Path) -> Result<(), DriverError>;
    /// Regular files directly under `dir`, in no particular order.
    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, DriverError>;
    fn exists(&self, path: &Path) -> bool;
    fn is_file(&self, path: &Path) -> bool;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), DriverError>;
    fn write_err_line(&self, line: &str) -> Result<(), DriverError>;
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>, DriverError> {
    mutex
        .lock()
        .map_err(|_| DriverError::Process(format!("{what} lock poisoned")))
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, DriverError> {
        let bytes = std::fs::read(path).map_err(|e| DriverError::Io(e.to_string()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), DriverError> {
        std::fs::write(path, contents).map_err(|e| DriverError::Io(e.to_string()))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), DriverError> {
        std::fs::create_dir_all(path).map_err(|e| DriverError::Io(e.to_string()))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<(), DriverError> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DriverError::Io(e.to_string())),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), DriverError> {
        // Falls back to copy+remove when the archive lives on another device.
        if std::fs::rename(from, to).is_ok() {
            return Ok(());
        }
        std::fs::copy(from, to).map_err(|e| DriverError::Io(e.to_string()))?;
        std::fs::remove_file(from).map_err(|e| DriverError::Io(e.to_string()))
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, DriverError> {
        Ok(std::fs::read_dir(dir)
            .map_err(|e| DriverError::Io(e.to_string()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }
}

#[derive(Default)]
struct ProcessState {
    next_handle: u64,
    children: HashMap<u64, Child>,
    exited: HashMap<u64, i32>,
}

pub struct ProductionProcessRunner {
    state: Mutex<ProcessState>,
}

impl ProductionProcessRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::default()),
        }
    }

    /// Stores the exit code, or puts the child back when waiting failed.
    fn record_wait(
        &self,
        handle: u64,
        child: Child,
        result: std::io::Result<ExitStatus>,
    ) -> Result<i32, DriverError> {
        let mut state = lock(&self.state, "process")?;
        match result {
            Ok(status) => {
                let code = status.code().unwrap_or(-1);
                state.exited.insert(handle, code);
                Ok(code)
            }
            Err(e) => {
                state.children.insert(handle, child);
                Err(DriverError::Process(e.to_string()))
            }
        }
    }
}

impl Default for ProductionProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner for ProductionProcessRunner {
    fn spawn(
        &self,
        request: &ProcessRequest,
        diagnostics: &DiagnosticsBuffer,
    ) -> Result<u64, DriverError> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args).envs(&request.env);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(diagnostics.writer()?));

        let child = cmd.spawn().map_err(|e| DriverError::Launch {
            program: request.program.clone(),
            message: e.to_string(),
        })?;
        let mut state = lock(&self.state, "process")?;
        let handle = state.next_handle;
        state.next_handle += 1;
        state.children.insert(handle, child);
        Ok(handle)
    }

    fn try_wait(&self, handle: u64) -> Result<Option<i32>, DriverError> {
        let mut state = lock(&self.state, "process")?;
        if let Some(code) = state.exited.get(&handle) {
            return Ok(Some(*code));
        }
        let child = state
            .children
            .get_mut(&handle)
            .ok_or_else(|| DriverError::Process(format!("unknown handle {handle}")))?;
        let status = child
            .try_wait()
            .map_err(|e| DriverError::Process(e.to_string()))?;
        let Some(status) = status else {
            return Ok(None);
        };
        let code = status.code().unwrap_or(-1);
        state.children.remove(&handle);
        state.exited.insert(handle, code);
        Ok(Some(code))
    }

    fn wait(&self, handle: u64) -> Result<i32, DriverError> {
        let child = {
            let mut state = lock(&self.state, "process")?;
            if let Some(code) = state.exited.get(&handle) {
                return Ok(*code);
            }
            state.children.remove(&handle)
        };
        let mut child =
            child.ok_or_else(|| DriverError::Process(format!("unknown handle {handle}")))?;
        // The lock is released while blocking so liveness checks stay responsive.
        let result = child.wait();
        self.record_wait(handle, child, result)
    }

    fn kill(&self, handle: u64) -> Result<(), DriverError> {
        let mut state = lock(&self.state, "process")?;
        if state.exited.contains_key(&handle) {
            return Ok(());
        }
        let child = state
            .children
            .get_mut(&handle)
            .ok_or_else(|| DriverError::Process(format!("unknown handle {handle}")))?;
        match child.kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(DriverError::Process(e.to_string())),
        }
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), DriverError> {
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| DriverError::Io(e.to_string()))?;
        out.flush().map_err(|e| DriverError::Io(e.to_string()))
    }

    fn write_err_line(&self, line: &str) -> Result<(), DriverError> {
        let mut err = std::io::stderr();
        writeln!(err, "{line}").map_err(|e| DriverError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub terminal: Arc<dyn Terminal>,
    pub platform: Arc<dyn PlatformStrategy>,
    pub rpc_connector: Arc<dyn RpcConnector>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner::new()),
            terminal: Arc::new(ProductionTerminal),
            platform: strategy_for(Platform::current()),
            rpc_connector: Arc::new(UnavailableConnector),
        }
    }

    pub fn with_rpc_connector(mut self, connector: Arc<dyn RpcConnector>) -> Self {
        self.rpc_connector = connector;
        self
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("sleep lock").clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().expect("sleep lock").push(duration);
        let mut now = self.now.lock().expect("clock lock");
        *now += duration;
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<DriverError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }

    pub fn append(&self, path: &Path, contents: &str) {
        self.files
            .lock()
            .expect("files lock")
            .entry(path.to_path_buf())
            .or_default()
            .push_str(contents);
    }

    pub fn set_fail_next(&self, error: DriverError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    pub fn file_paths(&self) -> Vec<PathBuf> {
        let mut paths = self
            .files
            .lock()
            .expect("files lock")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        paths.sort();
        paths
    }

    fn maybe_fail(&self) -> Result<(), DriverError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, DriverError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| DriverError::Io(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), DriverError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), DriverError> {
        self.maybe_fail()?;
        self.dirs
            .lock()
            .expect("dirs lock")
            .push(path.to_path_buf());
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> Result<(), DriverError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .retain(|file, _| !file.starts_with(path));
        self.dirs
            .lock()
            .expect("dirs lock")
            .retain(|dir| !dir.starts_with(path));
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), DriverError> {
        self.maybe_fail()?;
        let mut files = self.files.lock().expect("files lock");
        let contents = files
            .remove(from)
            .ok_or_else(|| DriverError::Io(format!("missing file {}", from.display())))?;
        files.insert(to.to_path_buf(), contents);
        Ok(())
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, DriverError> {
        self.maybe_fail()?;
        if !self.exists(dir) {
            return Err(DriverError::Io(format!("missing dir {}", dir.display())));
        }
        Ok(self
            .files
            .lock()
            .expect("files lock")
            .keys()
            .filter(|path| path.parent() == Some(dir))
            .cloned()
            .collect())
    }

    fn exists(&self, path: &Path) -> bool {
        let in_files = self
            .files
            .lock()
            .expect("files lock")
            .keys()
            .any(|file| file.starts_with(path));
        in_files
            || self
                .dirs
                .lock()
                .expect("dirs lock")
                .iter()
                .any(|dir| dir.starts_with(path))
    }

    fn is_file(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    writes: Arc<Mutex<Vec<String>>>,
    err_writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }

    pub fn error_lines(&self) -> Vec<String> {
        self.err_writes.lock().expect("err writes lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), DriverError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }

    fn write_err_line(&self, line: &str) -> Result<(), DriverError> {
        self.err_writes
            .lock()
            .expect("err writes lock")
            .push(line.to_string());
        Ok(())
    }
}

/// Scripted behaviour of one fake spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeProcessScript {
    pub exit_code: i32,
    pub stderr: String,
    /// Number of `try_wait` calls answered with "still running".
    pub polls_before_exit: u32,
}

impl FakeProcessScript {
    pub fn exits_with(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            polls_before_exit: u32::MAX,
        }
    }

    pub fn already_dead(exit_code: i32) -> Self {
        Self {
            exit_code,
            stderr: String::new(),
            polls_before_exit: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct FakeProcess {
    script: FakeProcessScript,
    remaining_polls: u32,
    exited: bool,
}

#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    scripts: Arc<Mutex<Vec<FakeProcessScript>>>,
    processes: Arc<Mutex<HashMap<u64, FakeProcess>>>,
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    waits: Arc<Mutex<Vec<u64>>>,
    kills: Arc<Mutex<Vec<u64>>>,
    next_handle: Arc<Mutex<u64>>,
}

impl FakeProcessRunner {
    pub fn push_script(&self, script: FakeProcessScript) {
        self.scripts.lock().expect("scripts lock").push(script);
    }

    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn waits(&self) -> Vec<u64> {
        self.waits.lock().expect("waits lock").clone()
    }

    pub fn kills(&self) -> Vec<u64> {
        self.kills.lock().expect("kills lock").clone()
    }

    /// Makes a running fake process exit on its next observation.
    pub fn exit_now(&self, handle: u64) {
        if let Some(process) = self.processes.lock().expect("processes lock").get_mut(&handle) {
            process.remaining_polls = 0;
        }
    }

    fn with_process<T>(
        &self,
        handle: u64,
        f: impl FnOnce(&mut FakeProcess) -> T,
    ) -> Result<T, DriverError> {
        let mut processes = self.processes.lock().expect("processes lock");
        let process = processes
            .get_mut(&handle)
            .ok_or_else(|| DriverError::Process(format!("unknown handle {handle}")))?;
        Ok(f(process))
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn spawn(
        &self,
        request: &ProcessRequest,
        diagnostics: &DiagnosticsBuffer,
    ) -> Result<u64, DriverError> {
        self.spawned
            .lock()
            .expect("spawned lock")
            .push(request.clone());
        let script = {
            let mut scripts = self.scripts.lock().expect("scripts lock");
            if scripts.is_empty() {
                return Err(DriverError::Launch {
                    program: request.program.clone(),
                    message: "no fake process queued".to_string(),
                });
            }
            scripts.remove(0)
        };
        let mut writer = diagnostics.writer()?;
        writer
            .write_all(script.stderr.as_bytes())
            .map_err(|e| DriverError::Io(e.to_string()))?;

        let mut next = self.next_handle.lock().expect("next lock");
        let handle = *next;
        *next += 1;
        self.processes.lock().expect("processes lock").insert(
            handle,
            FakeProcess {
                remaining_polls: script.polls_before_exit,
                script,
                exited: false,
            },
        );
        Ok(handle)
    }

    fn try_wait(&self, handle: u64) -> Result<Option<i32>, DriverError> {
        self.with_process(handle, |process| {
            if process.exited || process.remaining_polls == 0 {
                process.exited = true;
                return Some(process.script.exit_code);
            }
            process.remaining_polls -= 1;
            None
        })
    }

    fn wait(&self, handle: u64) -> Result<i32, DriverError> {
        self.waits.lock().expect("waits lock").push(handle);
        self.with_process(handle, |process| {
            process.exited = true;
            process.script.exit_code
        })
    }

    fn kill(&self, handle: u64) -> Result<(), DriverError> {
        self.kills.lock().expect("kills lock").push(handle);
        self.with_process(handle, |process| {
            if !process.exited {
                process.exited = true;
                process.script.exit_code = -1;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{
        lock, Clock, FakeClock, ProcessRequest, ProcessRunner, ProductionProcessRunner,
    };
    use crate::diagnostics::DiagnosticsBuffer;
    use crate::errors::DriverError;
    use std::collections::BTreeMap;
    use std::time::{Duration, SystemTime};

    #[test]
    fn fake_clock_advances_by_requested_sleeps() {
        let clock = FakeClock::default();
        clock.sleep(Duration::from_millis(200));
        clock.sleep(Duration::from_millis(100));
        assert_eq!(
            clock.now(),
            SystemTime::UNIX_EPOCH + Duration::from_millis(300)
        );
        assert_eq!(clock.total_slept(), Duration::from_millis(300));
    }

    #[cfg(unix)]
    #[test]
    fn failed_wait_keeps_the_handle_usable() {
        let runner = ProductionProcessRunner::new();
        let diagnostics = DiagnosticsBuffer::new(1024).expect("buffer");
        let request = ProcessRequest {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            cwd: None,
            env: BTreeMap::new(),
        };
        let handle = runner.spawn(&request, &diagnostics).expect("spawn");
        let child = lock(&runner.state, "process")
            .expect("lock")
            .children
            .remove(&handle)
            .expect("child");

        let interrupted = std::io::Error::new(std::io::ErrorKind::Interrupted, "interrupted");
        let err = runner
            .record_wait(handle, child, Err(interrupted))
            .expect_err("wait failed");
        assert_eq!(err, DriverError::Process("interrupted".to_string()));

        assert_eq!(runner.try_wait(handle).expect("handle still known"), None);
        runner.kill(handle).expect("kill");
        assert_eq!(runner.wait(handle).expect("reaped"), -1);
    }
}
