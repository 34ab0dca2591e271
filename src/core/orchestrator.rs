use crate::core::admission::{Admission, AdmissionController};
use crate::core::config::OrchestratorConfig;
use crate::core::error::{OrchestratorError, Result};
use crate::core::events::{EngineEvent, OrchestratorEvent};
use crate::core::model::*;
use crate::core::process::{platform_signals, ProcessController, ProcessSignals, NICE_MAX, NICE_MIN};
use crate::core::queue::DownloadQueue;
use crate::core::store::{HistoryEntry, HistoryStore};
use crate::core::tracker::{ClearFilter, ProgressTracker};
use crate::plugins::registry::{DownloadEngine, EngineRegistry};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use url::Url;

/// Everything guarded by the registry lock. The lock is only held for
/// in-memory bookkeeping, never across process signals or I/O.
#[derive(Default)]
struct RegistryState {
    tracker: ProgressTracker,
    queue: DownloadQueue,
    /// Runs admitted whose engine has not been spawned yet.
    launching: HashSet<RunId>,
}

impl RegistryState {
    /// Inserts the live record and reserves its run until `launch` is done with it.
    fn admit(&mut self, request: &DownloadRequest, engine: &str) -> RunId {
        let record = DownloadRecord::admitted(request, engine, Utc::now());
        let run = record.run;
        self.launching.insert(run);
        self.tracker.insert(record);
        run
    }

    /// Applies a terminal status for `run`. Returns the record when this call made it
    /// terminal; reports for another run or an already final record return `None`.
    fn settle(
        &mut self,
        id: &str,
        run: RunId,
        status: DownloadStatus,
        detail: Option<ErrorDetail>,
    ) -> Option<DownloadRecord> {
        if !self.tracker.is_run(id, run) {
            return None;
        }
        match self.tracker.mark_terminal(id, status, detail) {
            Ok(true) => self.tracker.get(id).ok().cloned(),
            _ => None,
        }
    }
}

enum Placement {
    Admitted(RunId),
    Queued(usize),
}

enum CancelTarget {
    Queued,
    Starting(Option<DownloadRecord>),
    Running(RunId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Started { id: DownloadId, title: String, url: String },
    Queued { id: DownloadId, position: usize },
}

#[derive(Clone)]
pub struct DownloadOrchestrator {
    engines: Arc<EngineRegistry>,
    admission: AdmissionController,
    registry: Arc<Mutex<RegistryState>>,
    process: Arc<ProcessController>,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    history: Option<HistoryStore>,
}

impl DownloadOrchestrator {
    /// Must be called from within a tokio runtime: the engine event pump is spawned here.
    pub fn new(config: OrchestratorConfig, engines: EngineRegistry, history: Option<HistoryStore>) -> Result<Self> {
        Self::with_signals(config, engines, history, platform_signals())
    }

    pub fn with_signals(
        config: OrchestratorConfig,
        engines: EngineRegistry,
        history: Option<HistoryStore>,
        signals: Arc<dyn ProcessSignals>,
    ) -> Result<Self> {
        config.validate()?;

        let (engine_tx, engine_rx) = mpsc::channel(config.event_capacity);
        let (event_tx, _) = broadcast::channel(256);
        let process = ProcessController::new(
            signals,
            engine_tx,
            config.out_dir.clone(),
            config.staging_root(),
            config.cancel_grace,
        );

        let orchestrator = Self {
            engines: Arc::new(engines),
            admission: AdmissionController::new(config.max_concurrent),
            registry: Arc::new(Mutex::new(RegistryState::default())),
            process: Arc::new(process),
            event_tx,
            history,
        };

        let pump = orchestrator.clone();
        tokio::spawn(async move {
            pump.run_event_pump(engine_rx).await;
        });

        info!(max_concurrent = config.max_concurrent, out_dir = %config.out_dir.display(), "orchestrator ready");
        Ok(orchestrator)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    pub fn max_concurrent(&self) -> usize {
        self.admission.max_concurrent()
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_status(&self, id: &str, status: DownloadStatus) {
        self.emit(OrchestratorEvent::StatusChanged { id: id.to_string(), status });
    }

    fn validate_request(request: &DownloadRequest) -> Result<()> {
        if request.id.trim().is_empty() {
            return Err(OrchestratorError::validation("download id must not be empty"));
        }
        if request.url.trim().is_empty() {
            return Err(OrchestratorError::validation("url is required"));
        }
        let url = Url::parse(&request.url)
            .map_err(|e| OrchestratorError::validation(format!("invalid url {}: {}", request.url, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(OrchestratorError::validation(format!("unsupported url scheme: {}", url.scheme())));
        }
        Ok(())
    }

    /// Admits the request or queues it; never waits on the download itself.
    pub fn submit(&self, request: DownloadRequest) -> Result<SubmitOutcome> {
        Self::validate_request(&request)?;
        let engine = self.engines.select(&request)?;

        let placement = {
            let mut reg = self.registry.lock();
            if reg.tracker.contains(&request.id) || reg.queue.contains(&request.id) {
                return Err(OrchestratorError::validation(format!("download id already in use: {}", request.id)));
            }
            match self.admission.try_admit(reg.tracker.slots_in_use()) {
                Admission::Admitted => Placement::Admitted(reg.admit(&request, engine.name())),
                Admission::Queued => Placement::Queued(reg.queue.enqueue(request.clone())),
            }
        };

        let run = match placement {
            Placement::Admitted(run) => run,
            Placement::Queued(position) => {
                info!(download_id = %request.id, position, "download queued");
                self.emit(OrchestratorEvent::Queued { id: request.id.clone(), position });
                return Ok(SubmitOutcome::Queued { id: request.id, position });
            }
        };

        self.emit_status(&request.id, DownloadStatus::Downloading);
        if let Err(e) = self.launch(&request, run, engine) {
            self.on_slot_freed();
            return Err(e);
        }

        Ok(SubmitOutcome::Started { title: request.display_title(), url: request.url.clone(), id: request.id })
    }

    /// Starts the engine for an already-admitted record. A start failure marks the
    /// record failed (visible to status polling) and is returned to the caller.
    /// A record canceled or cleared while the engine was starting gets the fresh
    /// process stopped here.
    fn launch(&self, request: &DownloadRequest, run: RunId, engine: Arc<dyn DownloadEngine>) -> Result<()> {
        let started = self.process.start(request, run, engine, self.engines.settings());
        let wanted = {
            let mut reg = self.registry.lock();
            reg.launching.remove(&run);
            reg.tracker.is_live_run(&request.id, run)
        };

        match started {
            Ok(pid) if wanted => {
                debug!(download_id = %request.id, %run, pid, "download admitted");
                Ok(())
            }
            Ok(pid) => {
                info!(download_id = %request.id, %run, pid, "download withdrawn while starting, stopping engine");
                let process = self.process.clone();
                tokio::spawn(async move {
                    if let Err(e) = process.cancel(run).await {
                        debug!(%run, error = %e, "engine already gone");
                    }
                });
                Ok(())
            }
            Err(e) => {
                warn!(download_id = %request.id, error = %e, "engine failed to start");
                let detail = OrchestratorError::server_detail(e.to_string(), "process");
                self.finish(&request.id, run, DownloadStatus::Failed, Some(detail));
                Err(e)
            }
        }
    }

    /// Pulls queue entries head-first while slots are free.
    pub fn drain_queue(&self) {
        loop {
            let next = {
                let mut reg = self.registry.lock();
                if !self.admission.has_capacity(reg.tracker.slots_in_use()) {
                    break;
                }
                let Some(entry) = reg.queue.dequeue_head() else { break };
                let request = entry.request;
                match self.engines.select(&request) {
                    Ok(engine) => {
                        let run = reg.admit(&request, engine.name());
                        Ok((request, run, engine))
                    }
                    Err(e) => {
                        let mut record = DownloadRecord::admitted(&request, "none", Utc::now());
                        record.status = DownloadStatus::Failed;
                        record.error_detail = Some(OrchestratorError::server_detail(e.to_string(), "orchestrator"));
                        reg.tracker.insert(record);
                        Err(request.id)
                    }
                }
            };

            match next {
                Ok((request, run, engine)) => {
                    info!(download_id = %request.id, "admitted from queue");
                    self.emit_status(&request.id, DownloadStatus::Downloading);
                    // failures are recorded on the entry; keep draining
                    let _ = self.launch(&request, run, engine);
                }
                Err(id) => self.emit_status(&id, DownloadStatus::Failed),
            }
        }
    }

    fn on_slot_freed(&self) {
        let should_drain = {
            let reg = self.registry.lock();
            self.admission.on_slot_freed(reg.tracker.slots_in_use(), reg.queue.len())
        };
        if should_drain {
            self.drain_queue();
        }
    }

    /// Records a terminal status once; later terminal reports for the same run, and
    /// any report for a different run, are ignored.
    fn finish(&self, id: &str, run: RunId, status: DownloadStatus, detail: Option<ErrorDetail>) {
        let finished = self.registry.lock().settle(id, run, status, detail);
        if let Some(record) = finished {
            self.announce_finished(record);
        }
    }

    fn announce_finished(&self, record: DownloadRecord) {
        info!(download_id = %record.id, status = %record.status, "download finished");
        self.emit_status(&record.id, record.status);
        self.persist(record);
    }

    fn persist(&self, record: DownloadRecord) {
        if let Some(store) = self.history.clone() {
            tokio::spawn(async move {
                if let Err(e) = store.record_outcome(&record).await {
                    let msg = format!("{:#}", e);
                    warn!(download_id = %record.id, error = %msg, "failed to write history");
                }
            });
        }
    }

    async fn run_event_pump(self, mut rx: mpsc::Receiver<EngineEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::Progress { id, run, snapshot } => {
                    let mut reg = self.registry.lock();
                    if !reg.tracker.is_run(&id, run) {
                        debug!(download_id = %id, %run, "dropping progress from a stale run");
                    } else if let Err(e) = reg.tracker.update(&id, snapshot) {
                        debug!(download_id = %id, error = %e, "dropping progress");
                    }
                }
                EngineEvent::Exited { id, run, outcome } => {
                    match outcome {
                        ProcessOutcome::Completed => self.finish(&id, run, DownloadStatus::Completed, None),
                        ProcessOutcome::Failed(detail) => self.finish(&id, run, DownloadStatus::Failed, Some(detail)),
                        ProcessOutcome::Canceled => self.finish(&id, run, DownloadStatus::Canceled, None),
                    }
                    self.on_slot_freed();
                }
            }
        }
    }

    /// Returns the run of the record for `id` if it is in `expected`.
    fn require_status(&self, id: &str, expected: DownloadStatus) -> Result<RunId> {
        match self.registry.lock().tracker.get(id) {
            Ok(r) if r.status == expected => Ok(r.run),
            Ok(r) => Err(OrchestratorError::NotFound(format!("download {} is {}, not {}", id, r.status, expected))),
            Err(e) => Err(e),
        }
    }

    fn record_control_error(&self, id: &str, err: &OrchestratorError) {
        if let OrchestratorError::Server(msg) = err {
            self.registry
                .lock()
                .tracker
                .set_control_error(id, OrchestratorError::server_detail(msg.clone(), "process"));
        }
    }

    pub fn pause(&self, id: &str) -> Result<()> {
        let run = self.require_status(id, DownloadStatus::Downloading)?;
        if let Err(e) = self.process.pause(run) {
            self.record_control_error(id, &e);
            return Err(e);
        }
        self.registry
            .lock()
            .tracker
            .transition(id, DownloadStatus::Downloading, DownloadStatus::Paused)?;
        info!(download_id = id, "download paused");
        self.emit_status(id, DownloadStatus::Paused);
        Ok(())
    }

    pub fn resume(&self, id: &str) -> Result<()> {
        let run = self.require_status(id, DownloadStatus::Paused)?;
        if let Err(e) = self.process.resume(run) {
            self.record_control_error(id, &e);
            return Err(e);
        }
        self.registry
            .lock()
            .tracker
            .transition(id, DownloadStatus::Paused, DownloadStatus::Downloading)?;
        info!(download_id = id, "download resumed");
        self.emit_status(id, DownloadStatus::Downloading);
        Ok(())
    }

    pub fn set_priority(&self, id: &str, nice: i32) -> Result<()> {
        if !(NICE_MIN..=NICE_MAX).contains(&nice) {
            return Err(OrchestratorError::validation(format!(
                "priority must be between {} and {}, got {}",
                NICE_MIN, NICE_MAX, nice
            )));
        }
        let run = match self.registry.lock().tracker.get(id) {
            Ok(r) if r.status.occupies_slot() => r.run,
            _ => return Err(OrchestratorError::not_found(id)),
        };
        if let Err(e) = self.process.set_priority(run, nice) {
            self.record_control_error(id, &e);
            return Err(e);
        }
        self.registry.lock().tracker.set_priority(id, nice);
        Ok(())
    }

    /// Cancels a queued, downloading or paused download. Running downloads return
    /// once the process is gone and its partial files are removed; a download whose
    /// engine is still starting is marked canceled at once and `launch` stops it.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let target = {
            let mut reg = self.registry.lock();
            let live = match reg.tracker.get(id) {
                Ok(r) if r.status.occupies_slot() => Some(r.run),
                Ok(r) => return Err(OrchestratorError::NotFound(format!("download {} already {}", id, r.status))),
                Err(_) => None,
            };
            match live {
                Some(run) if reg.launching.contains(&run) => {
                    CancelTarget::Starting(reg.settle(id, run, DownloadStatus::Canceled, None))
                }
                Some(run) => CancelTarget::Running(run),
                None => {
                    let entry = reg.queue.remove(id).map_err(|_| OrchestratorError::not_found(id))?;
                    let engine = self
                        .engines
                        .select(&entry.request)
                        .map(|e| e.name())
                        .unwrap_or("none");
                    let mut record = DownloadRecord::admitted(&entry.request, engine, Utc::now());
                    record.status = DownloadStatus::Canceled;
                    reg.tracker.insert(record);
                    CancelTarget::Queued
                }
            }
        };

        match target {
            CancelTarget::Queued => {
                info!(download_id = id, "queued download canceled");
                self.emit_status(id, DownloadStatus::Canceled);
            }
            CancelTarget::Starting(record) => {
                if let Some(record) = record {
                    self.announce_finished(record);
                }
                self.on_slot_freed();
            }
            CancelTarget::Running(run) => {
                self.process.cancel(run).await?;
                self.finish(id, run, DownloadStatus::Canceled, None);
                self.on_slot_freed();
            }
        }
        Ok(())
    }

    pub fn status(&self, id: &str) -> Result<StatusView> {
        let reg = self.registry.lock();
        if let Ok(record) = reg.tracker.get(id) {
            return Ok(StatusView::from_record(record));
        }
        reg.queue
            .get(id)
            .map(StatusView::from_queued)
            .ok_or_else(|| OrchestratorError::not_found(id))
    }

    /// Every live record plus every queued entry (as `queued`).
    pub fn list_all(&self) -> BTreeMap<DownloadId, StatusView> {
        let reg = self.registry.lock();
        let mut out: BTreeMap<DownloadId, StatusView> = reg
            .tracker
            .list_all()
            .map(|r| (r.id.clone(), StatusView::from_record(r)))
            .collect();
        for entry in reg.queue.list() {
            out.insert(entry.request.id.clone(), StatusView::from_queued(&entry));
        }
        out
    }

    pub fn count_with(&self, status: DownloadStatus) -> usize {
        let reg = self.registry.lock();
        match status {
            DownloadStatus::Queued => reg.queue.len(),
            s => reg.tracker.count_with(s),
        }
    }

    pub fn clear_one(&self, id: &str) -> Result<()> {
        let record = self.registry.lock().tracker.clear_one(id)?;
        self.release_cleared(vec![record]);
        Ok(())
    }

    pub fn clear_bulk(&self, filter: &ClearFilter) -> Vec<DownloadId> {
        let cleared = self.registry.lock().tracker.clear_bulk(filter, Utc::now());
        let mut ids: Vec<DownloadId> = cleared.iter().map(|r| r.id.clone()).collect();
        ids.sort();
        self.release_cleared(cleared);
        ids
    }

    /// Cleared records that still held a slot get their process torn down in the background.
    fn release_cleared(&self, cleared: Vec<DownloadRecord>) {
        if cleared.is_empty() {
            return;
        }
        let ids: Vec<DownloadId> = cleared.iter().map(|r| r.id.clone()).collect();
        info!(count = ids.len(), "records cleared");
        self.emit(OrchestratorEvent::Cleared { ids });

        for record in cleared.into_iter().filter(|r| r.status.occupies_slot()) {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.process.cancel(record.run).await {
                    debug!(download_id = %record.id, error = %e, "cleared record had no process");
                }
                this.on_slot_freed();
            });
        }
        self.on_slot_freed();
    }

    pub fn queue(&self) -> Vec<QueueEntry> {
        self.registry.lock().queue.list()
    }

    pub fn reorder_queue(&self, order: &[String]) -> Result<()> {
        self.registry.lock().queue.reorder(order)?;
        info!(order = ?order, "queue reordered");
        Ok(())
    }

    pub fn remove_queued(&self, id: &str) -> Result<QueueEntry> {
        let entry = self.registry.lock().queue.remove(id)?;
        info!(download_id = id, "removed from queue");
        Ok(entry)
    }

    pub async fn history(&self, limit: u32) -> Result<Vec<HistoryEntry>> {
        match &self.history {
            Some(store) => store
                .recent(limit)
                .await
                .map_err(|e| OrchestratorError::Server(format!("{:#}", e))),
            None => Ok(vec![]),
        }
    }

    #[cfg(test)]
    pub fn running_processes(&self) -> usize {
        self.process.active_count()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::test_support::{gated_script, open_gate, sh_request, ShEngine};
    use crate::plugins::registry::{EngineContext, EngineLine, OutputStream};
    use std::path::Path;
    use std::time::Duration;

    fn orchestrator(out: &Path, max: usize) -> DownloadOrchestrator {
        let cfg = OrchestratorConfig::new(out, max).with_cancel_grace(Duration::from_millis(500));
        DownloadOrchestrator::new(cfg, EngineRegistry::empty().with_engine(Arc::new(ShEngine)), None).unwrap()
    }

    async fn wait_status(rx: &mut broadcast::Receiver<OrchestratorEvent>, id: &str, status: DownloadStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let evt = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {} -> {}", id, status))
                .expect("event stream open");
            if evt == (OrchestratorEvent::StatusChanged { id: id.to_string(), status }) {
                return;
            }
        }
    }

    #[tokio::test]
    async fn third_request_waits_for_a_free_slot() {
        let dir = tempfile::tempdir().unwrap();
        let gates = dir.path().join("gates");
        let orch = orchestrator(&dir.path().join("out"), 2);
        let mut events = orch.subscribe();

        for id in ["one", "two"] {
            let out = orch.submit(sh_request(id, &gated_script(&gates, id))).unwrap();
            assert!(matches!(out, SubmitOutcome::Started { .. }));
        }
        let third = orch.submit(sh_request("three", &gated_script(&gates, "three"))).unwrap();
        assert_eq!(third, SubmitOutcome::Queued { id: "three".to_string(), position: 1 });
        assert_eq!(orch.status("three").unwrap().status, DownloadStatus::Queued);

        open_gate(&gates, "one");
        wait_status(&mut events, "one", DownloadStatus::Completed).await;
        wait_status(&mut events, "three", DownloadStatus::Downloading).await;

        let all = orch.list_all();
        let downloading = all.values().filter(|v| v.status == DownloadStatus::Downloading).count();
        let queued = all.values().filter(|v| v.status == DownloadStatus::Queued).count();
        assert_eq!(downloading, 2);
        assert_eq!(queued, 0);
        assert_eq!(all["one"].status, DownloadStatus::Completed);
        assert_eq!(all["one"].percent, Some(100.0));

        open_gate(&gates, "two");
        open_gate(&gates, "three");
        wait_status(&mut events, "three", DownloadStatus::Completed).await;
    }

    #[tokio::test]
    async fn reorder_controls_admission_order() {
        let dir = tempfile::tempdir().unwrap();
        let gates = dir.path().join("gates");
        let orch = orchestrator(&dir.path().join("out"), 1);
        let mut events = orch.subscribe();

        for id in ["x", "a", "b"] {
            orch.submit(sh_request(id, &gated_script(&gates, id))).unwrap();
        }
        assert_eq!(orch.queue().iter().map(|e| e.request.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);

        let bad = orch.reorder_queue(&["b".to_string()]);
        assert!(matches!(bad, Err(OrchestratorError::Validation(_))));
        assert_eq!(orch.queue().len(), 2);

        orch.reorder_queue(&["b".to_string(), "a".to_string()]).unwrap();

        open_gate(&gates, "x");
        wait_status(&mut events, "b", DownloadStatus::Downloading).await;
        assert_eq!(orch.status("a").unwrap().status, DownloadStatus::Queued);

        open_gate(&gates, "b");
        wait_status(&mut events, "a", DownloadStatus::Downloading).await;
        open_gate(&gates, "a");
        wait_status(&mut events, "a", DownloadStatus::Completed).await;
    }

    #[tokio::test]
    async fn pause_resume_cancel_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().join("out"), 1);
        let mut events = orch.subscribe();

        orch.submit(sh_request("s", "sleep 30")).unwrap();
        orch.pause("s").unwrap();
        assert_eq!(orch.status("s").unwrap().status, DownloadStatus::Paused);
        assert!(matches!(orch.pause("s"), Err(OrchestratorError::NotFound(_))));

        // a paused download keeps its slot
        let queued = orch.submit(sh_request("next", "true")).unwrap();
        assert!(matches!(queued, SubmitOutcome::Queued { .. }));

        orch.resume("s").unwrap();
        assert_eq!(orch.status("s").unwrap().status, DownloadStatus::Downloading);
        assert!(matches!(orch.resume("s"), Err(OrchestratorError::NotFound(_))));

        orch.pause("s").unwrap();
        orch.cancel("s").await.unwrap();
        assert_eq!(orch.status("s").unwrap().status, DownloadStatus::Canceled);

        for result in [orch.pause("s"), orch.resume("s"), orch.cancel("s").await] {
            assert!(matches!(result, Err(OrchestratorError::NotFound(_))));
        }

        wait_status(&mut events, "next", DownloadStatus::Completed).await;
    }

    #[tokio::test]
    async fn admission_limit_holds_under_churn() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().join("out"), 2);
        let mut events = orch.subscribe();

        for i in 0..6 {
            orch.submit(sh_request(&format!("d{}", i), "sleep 0.1")).unwrap();
            assert!(orch.count_with(DownloadStatus::Downloading) <= 2);
        }

        let mut completed = 0;
        while completed < 6 {
            let evt = tokio::time::timeout(Duration::from_secs(10), events.recv()).await.unwrap().unwrap();
            assert!(orch.count_with(DownloadStatus::Downloading) <= 2);
            if let OrchestratorEvent::StatusChanged { status: DownloadStatus::Completed, .. } = evt {
                completed += 1;
            }
        }
        assert_eq!(orch.count_with(DownloadStatus::Queued), 0);
    }

    #[tokio::test]
    async fn start_failures_are_recorded_and_do_not_stall_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let gates = dir.path().join("gates");
        let orch = orchestrator(&dir.path().join("out"), 1);
        let mut events = orch.subscribe();

        let broken = sh_request("broken", "true").with_option("shell", serde_json::json!("/nonexistent/shell"));
        assert!(matches!(orch.submit(broken), Err(OrchestratorError::Server(_))));
        let view = orch.status("broken").unwrap();
        assert_eq!(view.status, DownloadStatus::Failed);
        assert_eq!(view.error_type, Some(ErrorCategory::ServerError));

        orch.submit(sh_request("gate", &gated_script(&gates, "gate"))).unwrap();
        let queued_broken =
            sh_request("broken2", "true").with_option("shell", serde_json::json!("/nonexistent/shell"));
        orch.submit(queued_broken).unwrap();
        orch.submit(sh_request("after", "true")).unwrap();

        open_gate(&gates, "gate");
        wait_status(&mut events, "broken2", DownloadStatus::Failed).await;
        wait_status(&mut events, "after", DownloadStatus::Completed).await;
    }

    #[tokio::test]
    async fn engine_errors_become_classified_failures() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().join("out"), 1);
        let mut events = orch.subscribe();

        orch.submit(sh_request("p", "echo 'ERROR: [youtube] p: Private video' >&2; exit 1")).unwrap();
        wait_status(&mut events, "p", DownloadStatus::Failed).await;

        let view = orch.status("p").unwrap();
        assert_eq!(view.error_type, Some(ErrorCategory::PrivateVideo));
        let err = view.error.unwrap();
        assert_eq!(err.source, "sh");
        assert!(err.original_message.contains("Private video"));
    }

    #[tokio::test]
    async fn submissions_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().join("out"), 1);

        orch.submit(sh_request("dup", "sleep 30")).unwrap();
        assert!(matches!(orch.submit(sh_request("dup", "true")), Err(OrchestratorError::Validation(_))));
        orch.submit(sh_request("dup-q", "true")).unwrap();
        assert!(matches!(orch.submit(sh_request("dup-q", "true")), Err(OrchestratorError::Validation(_))));

        let ftp = DownloadRequest::new("f", "ftp://media.test/x").with_option("script", serde_json::json!("true"));
        assert!(matches!(orch.submit(ftp), Err(OrchestratorError::Validation(_))));
        let blank = sh_request(" ", "true");
        assert!(matches!(orch.submit(blank), Err(OrchestratorError::Validation(_))));

        orch.cancel("dup").await.unwrap();
    }

    #[tokio::test]
    async fn bulk_clear_removes_only_matching_records() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().join("out"), 3);
        let mut events = orch.subscribe();

        orch.submit(sh_request("f1", "exit 1")).unwrap();
        orch.submit(sh_request("f2", "exit 2")).unwrap();
        orch.submit(sh_request("ok", "true")).unwrap();
        wait_status(&mut events, "f1", DownloadStatus::Failed).await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while orch.count_with(DownloadStatus::Downloading) > 0 {
            assert!(tokio::time::Instant::now() < deadline, "downloads still running");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let cleared = orch.clear_bulk(&ClearFilter::parse(Some("failed"), None).unwrap());
        assert_eq!(cleared, vec!["f1".to_string(), "f2".to_string()]);
        assert_eq!(orch.status("ok").unwrap().status, DownloadStatus::Completed);
        assert!(matches!(orch.status("f1"), Err(OrchestratorError::NotFound(_))));

        orch.clear_one("ok").unwrap();
        assert!(matches!(orch.clear_one("ok"), Err(OrchestratorError::NotFound(_))));
    }

    #[tokio::test]
    async fn canceling_a_queued_entry_records_it() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().join("out"), 1);

        orch.submit(sh_request("busy", "sleep 30")).unwrap();
        orch.submit(sh_request("waiting", "true")).unwrap();
        orch.cancel("waiting").await.unwrap();

        assert!(orch.queue().is_empty());
        assert_eq!(orch.status("waiting").unwrap().status, DownloadStatus::Canceled);
        assert!(matches!(orch.remove_queued("waiting"), Err(OrchestratorError::NotFound(_))));

        orch.cancel("busy").await.unwrap();
    }

    #[tokio::test]
    async fn clearing_a_live_record_stops_its_process() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().join("out"), 1);

        orch.submit(sh_request("live", "sleep 30")).unwrap();
        assert_eq!(orch.running_processes(), 1);
        orch.clear_one("live").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while orch.running_processes() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "process still running");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(matches!(orch.status("live"), Err(OrchestratorError::NotFound(_))));
    }

    #[tokio::test]
    async fn priority_is_validated_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().join("out"), 1);

        orch.submit(sh_request("n", "sleep 30")).unwrap();
        assert!(matches!(orch.set_priority("n", 40), Err(OrchestratorError::Validation(_))));
        assert!(matches!(orch.set_priority("ghost", 5), Err(OrchestratorError::NotFound(_))));
        orch.set_priority("n", 5).unwrap();
        assert_eq!(orch.status("n").unwrap().priority, Some(5));

        orch.cancel("n").await.unwrap();
    }

    #[tokio::test]
    async fn resubmitting_a_cleared_id_is_not_disturbed_by_the_old_run() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().join("out"), 1);

        orch.submit(sh_request("x", "trap '' TERM; sleep 30")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        orch.clear_one("x").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let again = orch.submit(sh_request("x", "sleep 30")).unwrap();
        assert!(matches!(again, SubmitOutcome::Started { .. }));

        // past the cancel grace, so the old run has been killed and reported
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(orch.status("x").unwrap().status, DownloadStatus::Downloading);
        assert_eq!(orch.running_processes(), 1);

        orch.pause("x").unwrap();
        orch.cancel("x").await.unwrap();
        assert_eq!(orch.status("x").unwrap().status, DownloadStatus::Canceled);
        assert_eq!(orch.running_processes(), 0);
    }

    struct SlowStart;

    impl DownloadEngine for SlowStart {
        fn name(&self) -> &'static str {
            "slow-sh"
        }

        fn can_handle(&self, _request: &DownloadRequest) -> u8 {
            1
        }

        fn build_command(&self, request: &DownloadRequest, ctx: &EngineContext) -> anyhow::Result<tokio::process::Command> {
            std::thread::sleep(Duration::from_millis(300));
            ShEngine.build_command(request, ctx)
        }

        fn parse_line(&self, line: &str, stream: OutputStream, now: chrono::DateTime<Utc>) -> EngineLine {
            ShEngine.parse_line(line, stream, now)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_while_the_engine_is_starting() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = OrchestratorConfig::new(dir.path().join("out"), 1).with_cancel_grace(Duration::from_millis(500));
        let orch = DownloadOrchestrator::new(cfg, EngineRegistry::empty().with_engine(Arc::new(SlowStart)), None).unwrap();
        let mut events = orch.subscribe();

        let submitter = orch.clone();
        let submit = tokio::task::spawn_blocking(move || submitter.submit(sh_request("slow", "sleep 30")));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while orch.status("slow").is_err() {
            assert!(tokio::time::Instant::now() < deadline, "record never admitted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        orch.cancel("slow").await.unwrap();
        assert_eq!(orch.status("slow").unwrap().status, DownloadStatus::Canceled);
        wait_status(&mut events, "slow", DownloadStatus::Canceled).await;

        assert!(matches!(submit.await.unwrap(), Ok(SubmitOutcome::Started { .. })));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while orch.running_processes() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "engine left running");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(orch.status("slow").unwrap().status, DownloadStatus::Canceled);
    }
}
