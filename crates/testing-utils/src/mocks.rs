//! Mock implementations of the host's collaborator traits
//!
//! These doubles keep everything in memory so channel, manager and
//! specialization tests run without spawning real language runtimes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use funchost_config::LanguageWorkerConfig;
use funchost_domain::{
    FunctionDescriptor, FunctionMetadataProvider, FunctionMetadataResult, OutputStream,
    ProcessOutputLine, StandbyManager, WorkerProcess, WorkerProcessFactory, WorkerProcessSpec,
};
use funchost_errors::{HostError, HostResult};
use funchost_infrastructure::ScriptEventManager;
use tokio::sync::mpsc;

use crate::fake_worker::{FakeLanguageWorker, FakeWorkerBehavior};

/// In-memory worker process.
///
/// When created with an event bus it hosts a [`FakeLanguageWorker`] that is
/// spawned on `start()`.
pub struct MockWorkerProcess {
    worker_id: String,
    events: Option<ScriptEventManager>,
    behavior: FakeWorkerBehavior,
    fail_start: bool,
    start_count: AtomicUsize,
    running: AtomicBool,
    disposed: AtomicBool,
    output_tx: Mutex<Option<mpsc::UnboundedSender<ProcessOutputLine>>>,
    output_rx: Mutex<Option<mpsc::UnboundedReceiver<ProcessOutputLine>>>,
    worker: Mutex<Option<Arc<FakeLanguageWorker>>>,
}

impl MockWorkerProcess {
    /// A process with no worker behind it; tests inject protocol messages themselves.
    pub fn new(worker_id: &str) -> Self {
        Self::build(worker_id, None, FakeWorkerBehavior::silent(), false)
    }

    pub fn with_fake_worker(
        worker_id: &str,
        events: ScriptEventManager,
        behavior: FakeWorkerBehavior,
    ) -> Self {
        Self::build(worker_id, Some(events), behavior, false)
    }

    pub fn failing(worker_id: &str) -> Self {
        Self::build(worker_id, None, FakeWorkerBehavior::silent(), true)
    }

    fn build(
        worker_id: &str,
        events: Option<ScriptEventManager>,
        behavior: FakeWorkerBehavior,
        fail_start: bool,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            worker_id: worker_id.to_string(),
            events,
            behavior,
            fail_start,
            start_count: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            output_tx: Mutex::new(Some(tx)),
            output_rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn start_count(&self) -> usize {
        self.start_count.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn fake_worker(&self) -> Option<Arc<FakeLanguageWorker>> {
        self.worker.lock().unwrap().clone()
    }

    pub fn emit(&self, stream: OutputStream, line: &str) {
        if let Some(tx) = self.output_tx.lock().unwrap().as_ref() {
            let _ = tx.send(ProcessOutputLine {
                stream,
                line: line.to_string(),
            });
        }
    }

    /// Simulate the process dying: its output stream closes.
    pub fn exit(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.output_tx.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.stop();
        }
    }
}

#[async_trait]
impl WorkerProcess for MockWorkerProcess {
    async fn start(&self) -> HostResult<()> {
        self.start_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(HostError::ProcessLaunch(format!(
                "mock process {} refused to start",
                self.worker_id
            )));
        }
        self.running.store(true, Ordering::SeqCst);

        if let Some(events) = &self.events {
            let worker = Arc::new(FakeLanguageWorker::spawn(
                events.clone(),
                &self.worker_id,
                self.behavior.clone(),
            ));
            if self.behavior.send_start_stream {
                worker.send_start_stream();
            }
            *self.worker.lock().unwrap() = Some(worker);
        }
        Ok(())
    }

    fn take_output(&self) -> Option<mpsc::UnboundedReceiver<ProcessOutputLine>> {
        self.output_rx.lock().unwrap().take()
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.exit();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Factory handing out [`MockWorkerProcess`]es and remembering them.
pub struct MockWorkerProcessFactory {
    events: Option<ScriptEventManager>,
    behavior: Mutex<FakeWorkerBehavior>,
    fail_start: AtomicBool,
    created: Mutex<Vec<(WorkerProcessSpec, Arc<MockWorkerProcess>)>>,
}

impl MockWorkerProcessFactory {
    pub fn new(events: ScriptEventManager, behavior: FakeWorkerBehavior) -> Self {
        Self {
            events: Some(events),
            behavior: Mutex::new(behavior),
            fail_start: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            events: None,
            behavior: Mutex::new(FakeWorkerBehavior::silent()),
            fail_start: AtomicBool::new(true),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: FakeWorkerBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn processes(&self) -> Vec<Arc<MockWorkerProcess>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(_, process)| Arc::clone(process))
            .collect()
    }

    pub fn specs(&self) -> Vec<WorkerProcessSpec> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(spec, _)| spec.clone())
            .collect()
    }

    pub fn process(&self, worker_id: &str) -> Option<Arc<MockWorkerProcess>> {
        self.processes()
            .into_iter()
            .find(|process| process.worker_id() == worker_id)
    }
}

impl WorkerProcessFactory for MockWorkerProcessFactory {
    fn create(&self, spec: WorkerProcessSpec) -> Arc<dyn WorkerProcess> {
        let process = if self.fail_start.load(Ordering::SeqCst) {
            MockWorkerProcess::failing(&spec.worker_id)
        } else {
            match &self.events {
                Some(events) => MockWorkerProcess::with_fake_worker(
                    &spec.worker_id,
                    events.clone(),
                    self.behavior.lock().unwrap().clone(),
                ),
                None => MockWorkerProcess::new(&spec.worker_id),
            }
        };
        let process = Arc::new(process);
        self.created
            .lock()
            .unwrap()
            .push((spec, Arc::clone(&process)));
        process
    }
}

/// Counts specialization hook calls; can be told to fail or to take time.
#[derive(Debug, Default)]
pub struct MockStandbyManager {
    reload_config_calls: AtomicUsize,
    specialize_calls: AtomicUsize,
    fail_reload: AtomicBool,
    fail_specialize: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MockStandbyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reload_config_calls(&self) -> usize {
        self.reload_config_calls.load(Ordering::SeqCst)
    }

    pub fn specialize_calls(&self) -> usize {
        self.specialize_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_reload(&self, fail: bool) {
        self.fail_reload.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_specialize(&self, fail: bool) {
        self.fail_specialize.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl StandbyManager for MockStandbyManager {
    async fn specialize_host_reload_config(&self) -> HostResult<()> {
        self.reload_config_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_reload.load(Ordering::SeqCst) {
            return Err(HostError::config_error("mock config reload failure"));
        }
        Ok(())
    }

    async fn specialize_host(&self) -> HostResult<()> {
        self.specialize_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_specialize.load(Ordering::SeqCst) {
            return Err(HostError::specialization("mock specialize failure"));
        }
        Ok(())
    }
}

/// Metadata provider returning a fixed function set.
#[derive(Debug, Default)]
pub struct StaticMetadataProvider {
    result: Mutex<FunctionMetadataResult>,
    calls: Mutex<Vec<PathBuf>>,
}

impl StaticMetadataProvider {
    pub fn new(functions: Vec<FunctionDescriptor>) -> Self {
        Self {
            result: Mutex::new(FunctionMetadataResult {
                functions,
                ..Default::default()
            }),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_functions(&self, functions: Vec<FunctionDescriptor>) {
        self.result.lock().unwrap().functions = functions;
    }

    pub fn add_error(&self, function_name: &str, message: &str) {
        self.result
            .lock()
            .unwrap()
            .add_error(function_name, message.to_string());
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn scanned_roots(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FunctionMetadataProvider for StaticMetadataProvider {
    async fn read_functions_metadata(
        &self,
        script_root: &Path,
        allowlist: Option<&[String]>,
        _worker_configs: &[LanguageWorkerConfig],
    ) -> HostResult<FunctionMetadataResult> {
        self.calls.lock().unwrap().push(script_root.to_path_buf());
        let mut result = self.result.lock().unwrap().clone();
        if let Some(allowlist) = allowlist {
            result
                .functions
                .retain(|f| allowlist.iter().any(|name| name.eq_ignore_ascii_case(&f.name)));
        }
        Ok(result)
    }
}
