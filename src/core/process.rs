//! Lifecycle control for engine processes.
//!
//! Every admitted download runs as its own OS process inside a private staging
//! directory. A supervisor task per process turns engine output into
//! [`EngineEvent`]s and reports the exit outcome; the controller itself only
//! ever touches the process through [`ProcessSignals`].

use crate::core::error::{OrchestratorError, Result};
use crate::core::events::EngineEvent;
use crate::core::model::{DownloadId, DownloadRequest, ProcessOutcome, ProgressSnapshot, RunId};
use crate::core::tracker::engine_failure;
use crate::plugins::registry::{DownloadEngine, EngineContext, EngineLine, EngineSettings, OutputStream};
use anyhow::Context;
use chrono::Utc;
use parking_lot::Mutex;
use sanitize_filename::sanitize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub const NICE_MIN: i32 = -20;
pub const NICE_MAX: i32 = 19;

const KILL_WAIT: Duration = Duration::from_secs(2);

/// Platform hooks for acting on a running engine process.
pub trait ProcessSignals: Send + Sync {
    fn suspend(&self, pid: u32) -> io::Result<()>;
    fn resume(&self, pid: u32) -> io::Result<()>;
    fn terminate(&self, pid: u32) -> io::Result<()>;
    fn kill(&self, pid: u32) -> io::Result<()>;
    fn set_priority(&self, pid: u32, nice: i32) -> io::Result<()>;
}

/// Signals the whole process group so helpers spawned by the engine (ffmpeg)
/// follow along. Engines are spawned as group leaders, so pgid == pid.
#[cfg(unix)]
pub struct UnixSignals;

#[cfg(unix)]
impl UnixSignals {
    fn signal_group(pid: u32, sig: libc::c_int) -> io::Result<()> {
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), sig) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(unix)]
impl ProcessSignals for UnixSignals {
    fn suspend(&self, pid: u32) -> io::Result<()> {
        Self::signal_group(pid, libc::SIGSTOP)
    }

    fn resume(&self, pid: u32) -> io::Result<()> {
        Self::signal_group(pid, libc::SIGCONT)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        Self::signal_group(pid, libc::SIGTERM)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        Self::signal_group(pid, libc::SIGKILL)
    }

    fn set_priority(&self, pid: u32, nice: i32) -> io::Result<()> {
        let rc = unsafe { libc::setpriority(libc::PRIO_PGRP, pid as libc::id_t, nice) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Fallback for targets without POSIX job control: termination goes through
/// `taskkill`, suspend/resume and priority are reported as unsupported.
#[cfg(not(unix))]
pub struct TaskkillSignals;

#[cfg(not(unix))]
impl TaskkillSignals {
    fn taskkill(pid: u32, force: bool) -> io::Result<()> {
        let mut cmd = std::process::Command::new("taskkill");
        cmd.arg("/PID").arg(pid.to_string()).arg("/T");
        if force {
            cmd.arg("/F");
        }
        let status = cmd.status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::Other, format!("taskkill exited with {}", status)))
        }
    }

    fn unsupported(what: &str) -> io::Error {
        io::Error::new(io::ErrorKind::Unsupported, format!("{} is not supported on this platform", what))
    }
}

#[cfg(not(unix))]
impl ProcessSignals for TaskkillSignals {
    fn suspend(&self, _pid: u32) -> io::Result<()> {
        Err(Self::unsupported("suspend"))
    }

    fn resume(&self, _pid: u32) -> io::Result<()> {
        Err(Self::unsupported("resume"))
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        Self::taskkill(pid, false)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        Self::taskkill(pid, true)
    }

    fn set_priority(&self, _pid: u32, _nice: i32) -> io::Result<()> {
        Err(Self::unsupported("priority change"))
    }
}

pub fn platform_signals() -> Arc<dyn ProcessSignals> {
    #[cfg(unix)]
    {
        Arc::new(UnixSignals)
    }
    #[cfg(not(unix))]
    {
        Arc::new(TaskkillSignals)
    }
}

struct ProcessHandle {
    id: DownloadId,
    pid: u32,
    suspended: bool,
    exited: watch::Receiver<bool>,
    staging_dir: PathBuf,
}

type HandleMap = Arc<Mutex<HashMap<RunId, ProcessHandle>>>;

pub struct ProcessController {
    handles: HandleMap,
    signals: Arc<dyn ProcessSignals>,
    events: mpsc::Sender<EngineEvent>,
    out_dir: PathBuf,
    staging_root: PathBuf,
    grace: Duration,
}

impl ProcessController {
    pub fn new(
        signals: Arc<dyn ProcessSignals>,
        events: mpsc::Sender<EngineEvent>,
        out_dir: PathBuf,
        staging_root: PathBuf,
        grace: Duration,
    ) -> Self {
        Self {
            handles: Arc::new(Mutex::new(HashMap::new())),
            signals,
            events,
            out_dir,
            staging_root,
            grace,
        }
    }

    #[cfg(test)]
    pub fn is_tracked(&self, run: RunId) -> bool {
        self.handles.lock().contains_key(&run)
    }

    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.handles.lock().len()
    }

    fn staging_dir_for(&self, id: &str, run: RunId) -> PathBuf {
        let mut name = sanitize(id);
        if name.is_empty() {
            name = "download".to_string();
        }
        self.staging_root.join(format!("{}-{}", name, run.simple()))
    }

    /// Spawns the engine for one run of `request` and returns its pid. Engine output
    /// and the exit outcome flow through the event channel tagged with `run`; this
    /// never waits on the download.
    pub fn start(
        &self,
        request: &DownloadRequest,
        run: RunId,
        engine: Arc<dyn DownloadEngine>,
        settings: &EngineSettings,
    ) -> Result<u32> {
        let staging_dir = self.staging_dir_for(&request.id, run);
        std::fs::create_dir_all(&staging_dir).map_err(|e| {
            OrchestratorError::Server(format!("create staging dir {}: {}", staging_dir.display(), e))
        })?;

        match self.spawn(request, run, engine, settings, &staging_dir) {
            Ok(pid) => Ok(pid),
            Err(e) => {
                let _ = std::fs::remove_dir_all(&staging_dir);
                Err(e)
            }
        }
    }

    fn spawn(
        &self,
        request: &DownloadRequest,
        run: RunId,
        engine: Arc<dyn DownloadEngine>,
        settings: &EngineSettings,
        staging_dir: &Path,
    ) -> Result<u32> {
        let ctx = EngineContext { staging_dir: staging_dir.to_path_buf(), settings: settings.clone() };
        let mut cmd = engine
            .build_command(request, &ctx)
            .map_err(|e| OrchestratorError::Server(format!("{:#}", e)))?;

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| OrchestratorError::Server(format!("failed to start {}: {}", engine.name(), e)))?;
        let pid = child
            .id()
            .ok_or_else(|| OrchestratorError::Server(format!("{} exited before it could be tracked", engine.name())))?;

        let (exit_tx, exit_rx) = watch::channel(false);
        self.handles.lock().insert(
            run,
            ProcessHandle {
                id: request.id.clone(),
                pid,
                suspended: false,
                exited: exit_rx,
                staging_dir: staging_dir.to_path_buf(),
            },
        );

        info!(download_id = %request.id, %run, pid, engine = engine.name(), "engine started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let supervisor = Supervisor {
            id: request.id.clone(),
            run,
            engine,
            handles: self.handles.clone(),
            events: self.events.clone(),
            staging_dir: staging_dir.to_path_buf(),
            out_dir: self.out_dir.clone(),
        };
        tokio::spawn(supervisor.run(child, stdout, stderr, exit_tx));

        Ok(pid)
    }

    pub fn pause(&self, run: RunId) -> Result<()> {
        let pid = self.pid_where(run, |h| !h.suspended)?;
        self.signals
            .suspend(pid)
            .map_err(|e| OrchestratorError::Server(format!("suspend pid {}: {}", pid, e)))?;
        if let Some(h) = self.handles.lock().get_mut(&run) {
            h.suspended = true;
        }
        debug!(%run, pid, "engine suspended");
        Ok(())
    }

    pub fn resume(&self, run: RunId) -> Result<()> {
        let pid = self.pid_where(run, |h| h.suspended)?;
        self.signals
            .resume(pid)
            .map_err(|e| OrchestratorError::Server(format!("resume pid {}: {}", pid, e)))?;
        if let Some(h) = self.handles.lock().get_mut(&run) {
            h.suspended = false;
        }
        debug!(%run, pid, "engine resumed");
        Ok(())
    }

    pub fn set_priority(&self, run: RunId, nice: i32) -> Result<()> {
        if !(NICE_MIN..=NICE_MAX).contains(&nice) {
            return Err(OrchestratorError::validation(format!(
                "priority must be between {} and {}, got {}",
                NICE_MIN, NICE_MAX, nice
            )));
        }
        let pid = self.pid_where(run, |_| true)?;
        self.signals
            .set_priority(pid, nice)
            .map_err(|e| OrchestratorError::Server(format!("setpriority pid {}: {}", pid, e)))?;
        debug!(%run, pid, nice, "engine priority changed");
        Ok(())
    }

    /// Terminates the run's process (escalating to a kill after the grace period)
    /// and removes its staging directory. Returns once the process is gone.
    pub async fn cancel(&self, run: RunId) -> Result<()> {
        let handle = self
            .handles
            .lock()
            .remove(&run)
            .ok_or_else(|| OrchestratorError::NotFound(format!("no running process for run {}", run)))?;
        let ProcessHandle { id, pid, suspended, mut exited, staging_dir } = handle;

        if suspended {
            // a stopped process would never act on SIGTERM
            let _ = self.signals.resume(pid);
        }
        if let Err(e) = self.signals.terminate(pid) {
            debug!(download_id = %id, pid, error = %e, "terminate failed, process may already be gone");
        }

        if tokio::time::timeout(self.grace, wait_exit(&mut exited)).await.is_err() {
            warn!(download_id = %id, pid, grace_ms = self.grace.as_millis() as u64, "engine ignored terminate, killing");
            if let Err(e) = self.signals.kill(pid) {
                warn!(download_id = %id, pid, error = %e, "kill failed");
            }
            let _ = tokio::time::timeout(KILL_WAIT, wait_exit(&mut exited)).await;
        }

        remove_dir_if_exists(&staging_dir).await;
        info!(download_id = %id, %run, pid, "engine canceled");
        Ok(())
    }

    fn pid_where(&self, run: RunId, pred: impl Fn(&ProcessHandle) -> bool) -> Result<u32> {
        let handles = self.handles.lock();
        match handles.get(&run) {
            Some(h) if pred(h) => Ok(h.pid),
            Some(h) => Err(OrchestratorError::NotFound(format!("process for {} is not in a valid state", h.id))),
            None => Err(OrchestratorError::NotFound(format!("no running process for run {}", run))),
        }
    }
}

async fn wait_exit(rx: &mut watch::Receiver<bool>) {
    // a dropped sender also means the supervisor is done
    let _ = rx.wait_for(|done| *done).await;
}

async fn remove_dir_if_exists(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "failed to remove staging dir");
        }
    }
}

/// Moves every top-level staged entry into `out_dir`, replacing existing targets.
async fn promote_staged(staging_dir: &Path, out_dir: &Path) -> anyhow::Result<usize> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("create out_dir {}", out_dir.display()))?;

    let mut moved = 0;
    let mut entries = tokio::fs::read_dir(staging_dir)
        .await
        .with_context(|| format!("read staging dir {}", staging_dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let target = out_dir.join(entry.file_name());
        if let Ok(meta) = tokio::fs::metadata(&target).await {
            if meta.is_dir() {
                let _ = tokio::fs::remove_dir_all(&target).await;
            } else {
                let _ = tokio::fs::remove_file(&target).await;
            }
        }
        tokio::fs::rename(entry.path(), &target)
            .await
            .with_context(|| format!("move {} -> {}", entry.path().display(), target.display()))?;
        moved += 1;
    }
    tokio::fs::remove_dir_all(staging_dir).await.ok();
    Ok(moved)
}

struct Supervisor {
    id: DownloadId,
    run: RunId,
    engine: Arc<dyn DownloadEngine>,
    handles: HandleMap,
    events: mpsc::Sender<EngineEvent>,
    staging_dir: PathBuf,
    out_dir: PathBuf,
}

impl Supervisor {
    async fn run(
        self,
        mut child: Child,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        exit_tx: watch::Sender<bool>,
    ) {
        let (line_tx, mut line_rx) = mpsc::channel::<(OutputStream, String)>(64);
        if let Some(out) = stdout {
            tokio::spawn(forward_lines(out, OutputStream::Stdout, line_tx.clone()));
        }
        if let Some(err) = stderr {
            tokio::spawn(forward_lines(err, OutputStream::Stderr, line_tx.clone()));
        }
        drop(line_tx);

        let mut last_error: Option<String> = None;
        let mut files_done = 0u64;
        while let Some((stream, line)) = line_rx.recv().await {
            let now = Utc::now();
            match self.engine.parse_line(&line, stream, now) {
                EngineLine::Progress(snapshot) => self.emit_progress(snapshot).await,
                EngineLine::FileDone => {
                    files_done += 1;
                    let snapshot = ProgressSnapshot { downloaded: Some(files_done), ..ProgressSnapshot::empty(now) };
                    self.emit_progress(snapshot).await;
                }
                EngineLine::Error(msg) => {
                    warn!(download_id = %self.id, engine = self.engine.name(), "{}", msg);
                    last_error = Some(msg);
                }
                EngineLine::Other => debug!(download_id = %self.id, "{}", line),
            }
        }

        let status = child.wait().await;
        let _ = exit_tx.send(true);

        // a handle already taken means cancel() owns the teardown
        let was_tracked = self.handles.lock().remove(&self.run).is_some();

        let outcome = if !was_tracked {
            ProcessOutcome::Canceled
        } else {
            match status {
                Ok(s) if s.success() => match promote_staged(&self.staging_dir, &self.out_dir).await {
                    Ok(moved) => {
                        info!(download_id = %self.id, files = moved, "download completed");
                        ProcessOutcome::Completed
                    }
                    Err(e) => ProcessOutcome::Failed(OrchestratorError::server_detail(format!("{:#}", e), "process")),
                },
                Ok(s) => {
                    remove_dir_if_exists(&self.staging_dir).await;
                    let raw = last_error.unwrap_or_else(|| format!("{} exited with {}", self.engine.name(), s));
                    ProcessOutcome::Failed(engine_failure(&raw, self.engine.name()))
                }
                Err(e) => {
                    remove_dir_if_exists(&self.staging_dir).await;
                    ProcessOutcome::Failed(OrchestratorError::server_detail(format!("wait failed: {}", e), "process"))
                }
            }
        };

        let _ = self.events.send(EngineEvent::Exited { id: self.id.clone(), run: self.run, outcome }).await;
    }

    async fn emit_progress(&self, snapshot: ProgressSnapshot) {
        let _ = self.events.send(EngineEvent::Progress { id: self.id.clone(), run: self.run, snapshot }).await;
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, stream: OutputStream, tx: mpsc::Sender<(OutputStream, String)>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((stream, line)).await.is_err() {
            break;
        }
    }
}
