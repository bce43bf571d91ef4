//! Process supervisor for external commands.
//!
//! Runs git, build, test and fix-script commands under a wall-clock timeout
//! and an optional memory ceiling. Key responsibilities:
//! - Spawn children with captured, bounded stdout/stderr
//! - Track every in-flight child in a registry owned by a single monitor task
//! - Escalate SIGTERM then SIGKILL when a child breaches its limits
//! - Flag long-running children as possible infinite loops
//! - Emergency stop: kill everything registered plus stray tool processes
//!
//! Callers never touch the registry directly. They send commands to the
//! monitor task over a channel and read the snapshot it publishes.

use campaign_core::Config;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use sysinfo::{ProcessesToUpdate, System};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_INFINITE_LOOP_THRESHOLD: Duration = Duration::from_secs(300);

/// Timeout for draining stdout/stderr after the child exits or is killed.
///
/// Grandchildren that inherited the pipes can keep them open indefinitely.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes captured per stream.
const MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

/// Command substrings that identify compilers and linters.
const COMPILER_MARKERS: &[&str] = &["tsc", "eslint", "typescript"];

/// Command substrings that identify campaign or batch tooling.
const CAMPAIGN_MARKERS: &[&str] = &["campaign", "batch", "fix-"];

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command not found: {0}")]
    NotFound(String),
    #[error("{command} timed out after {timeout_ms} ms")]
    Timeout { command: String, timeout_ms: u64 },
    #[error("{command} exceeded memory limit of {limit_bytes} bytes")]
    MemoryExceeded { command: String, limit_bytes: u64 },
    #[error("supervised process vanished without an exit status")]
    Lost,
    #[error("supervisor is shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interval between monitor ticks.
    pub heartbeat_interval: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Runtime after which a child counts as a possible infinite loop.
    pub infinite_loop_threshold: Duration,
    /// Substrings matched against process names and command lines on emergency stop.
    pub tool_process_patterns: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            kill_grace: DEFAULT_KILL_GRACE,
            infinite_loop_threshold: DEFAULT_INFINITE_LOOP_THRESHOLD,
            tool_process_patterns: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms.max(1)),
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            infinite_loop_threshold: Duration::from_secs(config.infinite_loop_threshold_sec),
            tool_process_patterns: config.tool_process_patterns.clone(),
        }
    }
}

/// Limits enforced on one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_execution_time: Option<Duration>,
    pub max_memory_bytes: Option<u64>,
    /// Escalate to SIGTERM/SIGKILL when a limit is breached. When false the
    /// monitor only flags the process.
    pub kill_on_timeout: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_execution_time: None,
            max_memory_bytes: None,
            kill_on_timeout: true,
        }
    }
}

impl ResourceLimits {
    pub fn with_timeout(max_execution_time: Duration) -> Self {
        Self {
            max_execution_time: Some(max_execution_time),
            ..Self::default()
        }
    }

    /// Timeout in seconds; 0 disables it.
    pub fn timeout_secs(sec: u32) -> Self {
        if sec == 0 {
            Self::default()
        } else {
            Self::with_timeout(Duration::from_secs(u64::from(sec)))
        }
    }

    /// Memory ceiling in megabytes; 0 disables it.
    pub fn with_max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_bytes = (mb > 0).then(|| mb * 1024 * 1024);
        self
    }
}

/// Which limit a process breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitBreach {
    Timeout,
    Memory,
}

impl LimitBreach {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Memory => "memory",
        }
    }
}

/// Registry record for one supervised child.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStatus {
    pub pid: u32,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub running: bool,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
    /// Set once the process breached a time or memory limit.
    pub timed_out: bool,
}

impl ProcessStatus {
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or_default()
    }
}

/// Program, arguments and working directory for a child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    /// `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Command line for logs and the registry.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of a finished child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// -1 when the child was killed by a signal.
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Processes running past the loop threshold plus remediation hints.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InfiniteLoopReport {
    pub suspicious: Vec<ProcessStatus>,
    pub hints: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmergencyStopReport {
    pub registered_killed: usize,
    pub stray_killed: usize,
}

/// Handle to a long-running supervised child.
#[derive(Debug)]
pub struct SupervisedProcess {
    pid: u32,
    command: String,
    breach: Arc<OnceLock<LimitBreach>>,
    done: oneshot::Receiver<Result<CommandOutput>>,
    kill_grace: Duration,
    commands: mpsc::UnboundedSender<RegistryCommand>,
}

impl SupervisedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// The limit this process breached, if any.
    pub fn breach(&self) -> Option<LimitBreach> {
        self.breach.get().copied()
    }

    /// Wait for the child to exit and return its output.
    pub async fn wait(mut self) -> Result<CommandOutput> {
        self.wait_mut().await
    }

    async fn wait_mut(&mut self) -> Result<CommandOutput> {
        match (&mut self.done).await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::Lost),
        }
    }

    /// SIGTERM, wait out the grace window, then SIGKILL.
    pub async fn terminate(mut self) -> Result<CommandOutput> {
        send_signal(self.pid, Escalation::Terminate);
        if let Ok(received) = timeout(self.kill_grace, &mut self.done).await {
            return received.unwrap_or(Err(SupervisorError::Lost));
        }
        warn!(pid = self.pid, command = %self.command, "process ignored terminate; force killing");
        send_signal(self.pid, Escalation::Kill);
        self.wait_mut().await
    }

    fn flag(&self, breach: LimitBreach) {
        let _ = self.breach.set(breach);
        let _ = self.commands.send(RegistryCommand::Flag {
            pid: self.pid,
            breach,
        });
    }
}

/// Process supervisor. Cheap to clone; all clones share one monitor task.
#[derive(Debug, Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: SupervisorConfig,
    commands: mpsc::UnboundedSender<RegistryCommand>,
    snapshot: watch::Receiver<Vec<ProcessStatus>>,
    cancel: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Start the supervisor and its monitor task. Requires a tokio runtime.
    pub fn start(config: SupervisorConfig) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(Vec::new());
        let cancel = CancellationToken::new();

        let monitor = Monitor {
            registry: HashMap::new(),
            system: System::new(),
            kill_grace: config.kill_grace,
            snapshot: snapshot_tx,
        };
        let handle = tokio::spawn(monitor.run(rx, config.heartbeat_interval, cancel.clone()));

        info!(
            heartbeat_ms = config.heartbeat_interval.as_millis() as u64,
            kill_grace_ms = config.kill_grace.as_millis() as u64,
            "process supervisor started"
        );

        Self {
            inner: Arc::new(Inner {
                config,
                commands,
                snapshot,
                cancel,
                monitor: Mutex::new(Some(handle)),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Run a command to completion under `limits`.
    ///
    /// On timeout the child is terminated (SIGTERM, then SIGKILL after the
    /// grace window) before `Timeout` is returned. A non-zero exit is not an
    /// error; callers inspect `exit_code`.
    pub async fn run(&self, spec: &CommandSpec, limits: ResourceLimits) -> Result<CommandOutput> {
        let mut process = self.spawn_supervised(spec, limits)?;

        let output = match limits.max_execution_time {
            Some(max) => match timeout(max, process.wait_mut()).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(
                        pid = process.pid,
                        command = %process.command,
                        timeout_ms = max.as_millis() as u64,
                        "command timed out; terminating"
                    );
                    process.flag(LimitBreach::Timeout);
                    let command = process.command.clone();
                    if let Err(err) = process.terminate().await {
                        debug!(command = %command, error = %err, "no output from timed-out command");
                    }
                    return Err(SupervisorError::Timeout {
                        command,
                        timeout_ms: max.as_millis() as u64,
                    });
                }
            },
            None => process.wait_mut().await?,
        };

        match process.breach() {
            Some(LimitBreach::Timeout) => Err(SupervisorError::Timeout {
                command: process.command,
                timeout_ms: limits
                    .max_execution_time
                    .map_or(0, |max| max.as_millis() as u64),
            }),
            Some(LimitBreach::Memory) => Err(SupervisorError::MemoryExceeded {
                command: process.command,
                limit_bytes: limits.max_memory_bytes.unwrap_or(0),
            }),
            None => Ok(output),
        }
    }

    /// Spawn a child and register it with the monitor.
    pub fn spawn_supervised(
        &self,
        spec: &CommandSpec,
        limits: ResourceLimits,
    ) -> Result<SupervisedProcess> {
        if !self.is_running() {
            return Err(SupervisorError::ShutDown);
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so signals reach everything the child starts.
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let command = spec.display();
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SupervisorError::NotFound(spec.program.clone())
            } else {
                SupervisorError::Io(e)
            }
        })?;
        let pid = child.id().ok_or(SupervisorError::Lost)?;

        let breach = Arc::new(OnceLock::new());
        let status = ProcessStatus {
            pid,
            command: command.clone(),
            started_at: Utc::now(),
            running: true,
            memory_bytes: 0,
            cpu_percent: 0.0,
            timed_out: false,
        };
        let _ = self.inner.commands.send(RegistryCommand::Register(Box::new(Tracked {
            status,
            started: Instant::now(),
            limits,
            breach: Arc::clone(&breach),
            term_sent_at: None,
        })));

        debug!(pid, command = %command, "spawned supervised process");

        let stdout = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_bounded(stdout, MAX_OUTPUT_BYTES)));
        let stderr = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

        let (done_tx, done) = oneshot::channel();
        let commands = self.inner.commands.clone();
        let started = Instant::now();
        tokio::spawn(async move {
            let result = collect_output(child, stdout, stderr, started).await;
            let _ = commands.send(RegistryCommand::Exited(pid));
            let _ = done_tx.send(result);
        });

        Ok(SupervisedProcess {
            pid,
            command,
            breach,
            done,
            kill_grace: self.inner.config.kill_grace,
            commands: self.inner.commands.clone(),
        })
    }

    /// Latest registry snapshot, ordered by pid.
    pub fn processes(&self) -> Vec<ProcessStatus> {
        self.inner.snapshot.borrow().clone()
    }

    pub fn status(&self, pid: u32) -> Option<ProcessStatus> {
        self.inner
            .snapshot
            .borrow()
            .iter()
            .find(|p| p.pid == pid)
            .cloned()
    }

    /// Report children running longer than the loop threshold. Kills nothing.
    pub fn detect_infinite_loops(&self) -> InfiniteLoopReport {
        let threshold = self.inner.config.infinite_loop_threshold;
        let now = Utc::now();
        let suspicious: Vec<ProcessStatus> = self
            .processes()
            .into_iter()
            .filter(|p| p.running && p.elapsed(now) > threshold)
            .collect();
        let hints: Vec<String> = suspicious.iter().map(|p| loop_hint(p, now)).collect();

        if !suspicious.is_empty() {
            warn!(
                count = suspicious.len(),
                threshold_sec = threshold.as_secs(),
                "possible infinite loops detected"
            );
        }

        InfiniteLoopReport { suspicious, hints }
    }

    /// Kill every registered child, then any process matching the configured
    /// tool patterns. Failures are logged, never returned.
    pub async fn emergency_stop(&self) -> EmergencyStopReport {
        let registered: Vec<u32> = self.processes().iter().map(|p| p.pid).collect();
        let registered_killed = registered
            .iter()
            .filter(|pid| send_signal(**pid, Escalation::Kill))
            .count();

        let patterns = self.inner.config.tool_process_patterns.clone();
        let own_pid = std::process::id();
        let stray_killed =
            match tokio::task::spawn_blocking(move || kill_matching(&patterns, own_pid, &registered))
                .await
            {
                Ok(count) => count,
                Err(err) => {
                    warn!(error = %err, "stray process sweep failed");
                    0
                }
            };

        warn!(registered_killed, stray_killed, "emergency stop complete");
        EmergencyStopReport {
            registered_killed,
            stray_killed,
        }
    }

    /// Stop the monitor task, then emergency-stop everything it was tracking.
    pub async fn shutdown(&self) -> EmergencyStopReport {
        self.inner.cancel.cancel();
        let handle = match self.inner.monitor.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "process monitor task failed");
            }
        }
        let report = self.emergency_stop().await;
        info!("process supervisor stopped");
        report
    }
}

/// Messages to the monitor task, the registry's only writer.
#[derive(Debug)]
enum RegistryCommand {
    Register(Box<Tracked>),
    Exited(u32),
    /// The caller already escalated; only record the breach.
    Flag { pid: u32, breach: LimitBreach },
}

#[derive(Debug)]
struct Tracked {
    status: ProcessStatus,
    started: Instant,
    limits: ResourceLimits,
    breach: Arc<OnceLock<LimitBreach>>,
    term_sent_at: Option<Instant>,
}

impl Tracked {
    fn check_limits(&self) -> Option<LimitBreach> {
        if self
            .limits
            .max_execution_time
            .is_some_and(|max| self.started.elapsed() > max)
        {
            Some(LimitBreach::Timeout)
        } else if self
            .limits
            .max_memory_bytes
            .is_some_and(|max| self.status.memory_bytes > max)
        {
            Some(LimitBreach::Memory)
        } else {
            None
        }
    }
}

struct Monitor {
    registry: HashMap<u32, Tracked>,
    system: System,
    kill_grace: Duration,
    snapshot: watch::Sender<Vec<ProcessStatus>>,
}

impl Monitor {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<RegistryCommand>,
        heartbeat: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                _ = ticker.tick() => self.tick(),
            }
            self.publish();
        }

        debug!(tracked = self.registry.len(), "process monitor stopped");
    }

    fn apply(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Register(tracked) => {
                self.registry.insert(tracked.status.pid, *tracked);
            }
            RegistryCommand::Exited(pid) => {
                if self.registry.remove(&pid).is_some() {
                    debug!(pid, "supervised process exited");
                }
            }
            RegistryCommand::Flag { pid, breach } => {
                if let Some(entry) = self.registry.get_mut(&pid) {
                    entry.status.timed_out = true;
                    let _ = entry.breach.set(breach);
                }
            }
        }
    }

    fn tick(&mut self) {
        if self.registry.is_empty() {
            return;
        }

        let pids: Vec<sysinfo::Pid> = self
            .registry
            .keys()
            .map(|pid| sysinfo::Pid::from_u32(*pid))
            .collect();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&pids), true);

        let mut killed = Vec::new();
        for (pid, entry) in &mut self.registry {
            if let Some(process) = self.system.process(sysinfo::Pid::from_u32(*pid)) {
                entry.status.memory_bytes = process.memory();
                entry.status.cpu_percent = process.cpu_usage();
            }

            if let Some(sent) = entry.term_sent_at {
                if sent.elapsed() >= self.kill_grace {
                    warn!(pid, command = %entry.status.command, "process ignored terminate; force killing");
                    send_signal(*pid, Escalation::Kill);
                    entry.status.running = false;
                    killed.push(*pid);
                }
                continue;
            }

            if entry.status.timed_out {
                continue;
            }
            let Some(breach) = entry.check_limits() else {
                continue;
            };

            entry.status.timed_out = true;
            let _ = entry.breach.set(breach);
            warn!(
                pid,
                command = %entry.status.command,
                reason = breach.as_str(),
                elapsed_ms = entry.started.elapsed().as_millis() as u64,
                memory_bytes = entry.status.memory_bytes,
                "process exceeded resource limit"
            );
            if entry.limits.kill_on_timeout {
                send_signal(*pid, Escalation::Terminate);
                entry.term_sent_at = Some(Instant::now());
            }
        }

        for pid in killed {
            self.registry.remove(&pid);
        }
    }

    fn publish(&self) {
        let mut snapshot: Vec<ProcessStatus> =
            self.registry.values().map(|t| t.status.clone()).collect();
        snapshot.sort_by_key(|s| s.pid);
        self.snapshot.send_replace(snapshot);
    }
}

#[derive(Debug, Clone, Copy)]
enum Escalation {
    Terminate,
    Kill,
}

/// Deliver a signal to the child's process group, falling back to the pid
/// alone. A process that is already gone counts as a failure, which callers
/// only log.
#[cfg(unix)]
fn send_signal(pid: u32, escalation: Escalation) -> bool {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let signal = match escalation {
        Escalation::Terminate => Signal::SIGTERM,
        Escalation::Kill => Signal::SIGKILL,
    };
    // Children are spawned as group leaders, so the pgid is the pid.
    let target = Pid::from_raw(pid as i32);
    if killpg(target, signal).is_ok() {
        return true;
    }
    match kill(target, signal) {
        Ok(()) => true,
        Err(err) => {
            debug!(pid, signal = ?signal, error = %err, "signal not delivered");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _escalation: Escalation) -> bool {
    let pid = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some_and(sysinfo::Process::kill)
}

/// Kill unregistered processes whose name or command line matches a pattern.
fn kill_matching(patterns: &[String], own_pid: u32, skip: &[u32]) -> usize {
    if patterns.is_empty() {
        return 0;
    }

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut killed = 0;
    for (pid, process) in system.processes() {
        let raw = pid.as_u32();
        if raw == own_pid || skip.contains(&raw) {
            continue;
        }
        let name = process.name().to_string_lossy();
        let cmdline = process
            .cmd()
            .iter()
            .map(|part| part.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        if !patterns
            .iter()
            .any(|p| name.contains(p.as_str()) || cmdline.contains(p.as_str()))
        {
            continue;
        }
        if process.kill() {
            debug!(pid = raw, name = %name, "killed stray tool process");
            killed += 1;
        } else {
            debug!(pid = raw, name = %name, "stray tool process already gone");
        }
    }
    killed
}

/// Remediation hint for a long-running child.
fn loop_hint(status: &ProcessStatus, now: DateTime<Utc>) -> String {
    let secs = status.elapsed(now).as_secs();
    let cmd = status.command.to_lowercase();
    if COMPILER_MARKERS.iter().any(|m| cmd.contains(m)) {
        format!(
            "pid {} ({}) has run for {secs}s: compiler or linter may be stuck on circular imports or an oversized project; try incremental mode or a narrower file set",
            status.pid, status.command
        )
    } else if CAMPAIGN_MARKERS.iter().any(|m| cmd.contains(m)) {
        format!(
            "pid {} ({}) has run for {secs}s: campaign tooling may be looping over the same files; reduce the batch size or check the tool's exit condition",
            status.pid, status.command
        )
    } else {
        format!(
            "pid {} ({}) has run for {secs}s: inspect it or run an emergency stop",
            status.pid, status.command
        )
    }
}

/// Read from an async reader with a maximum byte limit.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "output exceeded limit, truncating");
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }

        let to_take = n.min(remaining);
        buf.extend_from_slice(&chunk[..to_take]);
    }

    Ok(buf)
}

type CaptureTask = JoinHandle<std::io::Result<Vec<u8>>>;

async fn collect_output(
    mut child: Child,
    stdout: Option<CaptureTask>,
    stderr: Option<CaptureTask>,
    started: Instant,
) -> Result<CommandOutput> {
    let status = child.wait().await?;
    let stdout = capture(stdout, "stdout").await;
    let stderr = capture(stderr, "stderr").await;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: status.code().unwrap_or(-1),
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

async fn capture(task: Option<CaptureTask>, stream: &'static str) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(stream, error = %err, "output capture failed");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(stream, error = %err, "output capture task panicked");
            Vec::new()
        }
        Err(_) => {
            warn!(stream, "output capture timed out");
            Vec::new()
        }
    }
}
