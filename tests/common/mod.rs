//! Shared fixtures for the engine tests: in-memory services, a scripted
//! executor and a context backend that records what it was asked to do.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use workclaim::config::WorkerConfig;
use workclaim::context::ContextBackend;
use workclaim::engine::{Intake, Services, SubmitResult, WorkConsumer, Worker};
use workclaim::error::{Error, Result};
use workclaim::event::{EventKind, RecordingEventSink};
use workclaim::executor::{ExecutionOutcome, ExecutionReport, ExecutionRequest, TaskExecutor};
use workclaim::model::{
    ClaimOutcome, ContextHandle, NewWorkMessage, OwnershipRecord, WorkerId, WorkstreamKey,
};
use workclaim::store::OwnershipStore;
use workclaim::store::memory::{
    MemoryOfferQueue, MemoryOwnershipStore, MemoryResultSink, MemoryThreadStore, MemoryWorkQueue,
};

pub fn key(project: &str, user: &str) -> WorkstreamKey {
    WorkstreamKey::new(project, user).unwrap()
}

/// Short timings so lifecycle tests finish in a couple of seconds.
pub fn test_config() -> WorkerConfig {
    WorkerConfig {
        lease: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(300),
        interrupt_grace: Duration::from_millis(200),
        idle_timeout: Duration::from_millis(800),
        max_concurrent_claims: 1,
        offer_poll_wait: Duration::from_millis(50),
        queue_poll_wait: Duration::from_millis(50),
        visibility_timeout: Duration::from_secs(5),
        sweep_interval: Duration::from_millis(300),
    }
}

// ---------------------------------------------------------------------------
// Scripted executor
// ---------------------------------------------------------------------------

/// Behaviour of one invocation, read from the message payload.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Script {
    work_ms: u64,
    ignore_cancel: bool,
    committed: bool,
    fail: bool,
}

/// Payload for a message that takes `work_ms` and honours the stop signal.
pub fn quick() -> serde_json::Value {
    json!({ "work_ms": 0 })
}

pub fn cooperative(work_ms: u64) -> serde_json::Value {
    json!({ "work_ms": work_ms, "committed": true })
}

/// Payload for a message whose executor never looks at the stop signal.
pub fn stubborn(work_ms: u64) -> serde_json::Value {
    json!({ "work_ms": work_ms, "ignore_cancel": true })
}

pub fn failing() -> serde_json::Value {
    json!({ "fail": true })
}

/// Executor driven by the message payload. Logs `start:`, `stop:` and
/// `finish:` entries per message id.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    log: Mutex<Vec<String>>,
    requests: Mutex<Vec<ExecutionRequest>>,
}

impl ScriptedExecutor {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn note(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport> {
        let script: Script = serde_json::from_value(request.payload.clone()).unwrap_or_default();
        let id = request.message_id.clone();
        self.requests.lock().unwrap().push(request);
        self.note(format!("start:{id}"));

        let work = tokio::time::sleep(Duration::from_millis(script.work_ms));
        if script.ignore_cancel {
            work.await;
        } else {
            tokio::select! {
                _ = work => {}
                _ = cancel.cancelled() => {
                    self.note(format!("stop:{id}"));
                    return Ok(ExecutionReport::Stopped { committed: script.committed });
                }
            }
        }

        self.note(format!("finish:{id}"));
        if script.fail {
            return Ok(ExecutionReport::Finished(ExecutionOutcome::failure(
                "scripted failure",
            )));
        }
        Ok(ExecutionReport::Finished(ExecutionOutcome::success(
            format!("handled {id}"),
            script.committed,
        )))
    }
}

// ---------------------------------------------------------------------------
// Recording context backend
// ---------------------------------------------------------------------------

/// Records `activate:<thread>` and `flush:<thread>` calls in order.
#[derive(Debug, Default)]
pub struct RecordingContextBackend {
    trace: Mutex<Vec<String>>,
    fail_flush: AtomicBool,
    fail_activate: AtomicBool,
}

impl RecordingContextBackend {
    pub fn trace(&self) -> Vec<String> {
        self.trace.lock().unwrap().clone()
    }

    pub fn fail_flush(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::SeqCst);
    }

    pub fn fail_activate(&self, fail: bool) {
        self.fail_activate.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContextBackend for RecordingContextBackend {
    async fn activate(&self, key: &WorkstreamKey, thread_id: &str) -> Result<ContextHandle> {
        self.trace.lock().unwrap().push(format!("activate:{thread_id}"));
        if self.fail_activate.load(Ordering::SeqCst) {
            return Err(Error::Context(format!("cannot check out {thread_id}")));
        }
        Ok(ContextHandle {
            workstream_key: key.clone(),
            thread_id: thread_id.to_string(),
            context_id: format!("ctx-{thread_id}"),
        })
    }

    async fn flush(&self, context: &ContextHandle) -> Result<bool> {
        self.trace
            .lock()
            .unwrap()
            .push(format!("flush:{}", context.thread_id));
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(Error::Context("push rejected".into()));
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub ownership: Arc<MemoryOwnershipStore>,
    pub offers: Arc<MemoryOfferQueue>,
    pub queues: Arc<MemoryWorkQueue>,
    pub threads: Arc<MemoryThreadStore>,
    pub results: Arc<MemoryResultSink>,
    pub executor: Arc<ScriptedExecutor>,
    pub context: Arc<RecordingContextBackend>,
    pub events: Arc<RecordingEventSink>,
}

impl Harness {
    pub fn new() -> Self {
        let visibility = test_config().visibility_timeout;
        Self {
            ownership: Arc::new(MemoryOwnershipStore::new()),
            offers: Arc::new(MemoryOfferQueue::new(visibility)),
            queues: Arc::new(MemoryWorkQueue::new(visibility)),
            threads: Arc::new(MemoryThreadStore::new()),
            results: Arc::new(MemoryResultSink::new()),
            executor: Arc::new(ScriptedExecutor::default()),
            context: Arc::new(RecordingContextBackend::default()),
            events: Arc::new(RecordingEventSink::new()),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            ownership: self.ownership.clone(),
            offers: self.offers.clone(),
            queues: self.queues.clone(),
            threads: self.threads.clone(),
            results: self.results.clone(),
            executor: self.executor.clone(),
            context: self.context.clone(),
            events: self.events.clone(),
        }
    }

    pub fn intake(&self) -> Intake {
        Intake::from_services(&self.services())
    }

    pub fn worker(&self, id: &str, config: WorkerConfig) -> Worker {
        Worker::new(WorkerId::new(id), config, self.services())
    }

    pub fn consumer(
        &self,
        record: OwnershipRecord,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> WorkConsumer {
        WorkConsumer::new(record, config, self.services(), shutdown)
    }

    /// Claim `key` for `worker` directly against the store.
    pub async fn claim(&self, key: &WorkstreamKey, worker: &str) -> OwnershipRecord {
        let outcome = self
            .ownership
            .try_claim(key, &WorkerId::new(worker), test_config().lease)
            .await
            .unwrap();
        match outcome {
            ClaimOutcome::Claimed(record) => record,
            ClaimOutcome::AlreadyOwned => panic!("{key} is already owned"),
        }
    }

    pub async fn submit(
        &self,
        key: &WorkstreamKey,
        message_id: &str,
        thread_id: &str,
        payload: serde_json::Value,
    ) -> SubmitResult {
        self.intake()
            .submit(NewWorkMessage::new(key.clone(), message_id, thread_id).payload(payload))
            .await
            .unwrap()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.kinds()
    }

    /// Wait until an event matching `pred` has been emitted.
    pub async fn wait_for_event(&self, what: &str, pred: impl Fn(&EventKind) -> bool) {
        wait_until(what, || self.kinds().iter().any(&pred)).await;
    }

    /// Ids of results delivered so far, in delivery order.
    pub fn result_ids(&self) -> Vec<String> {
        self.results
            .records()
            .into_iter()
            .map(|r| r.message_id)
            .collect()
    }
}

/// Poll `cond` every 10ms, panicking after 10s.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Index of the first event matching `pred`, panicking if there is none.
pub fn position(kinds: &[EventKind], what: &str, pred: impl Fn(&EventKind) -> bool) -> usize {
    kinds
        .iter()
        .position(pred)
        .unwrap_or_else(|| panic!("no {what} event in {kinds:#?}"))
}

pub fn dispatched_ids(kinds: &[EventKind]) -> Vec<String> {
    kinds
        .iter()
        .filter_map(|k| match k {
            EventKind::Dispatched { message_id, .. } => Some(message_id.clone()),
            _ => None,
        })
        .collect()
}
