//! Interrupt coordination for in-flight executor invocations.
//!
//! The stop is cooperative first: the invocation's cancellation token fires
//! and it gets the grace period to wind down. If it has not returned when
//! the grace period lapses, its task is aborted, which drops the executor
//! future (and with it any child process it holds).

use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Span, warn};

use crate::error::Result;
use crate::event::{EventKind, EventSink, InterruptKind};
use crate::executor::ExecutionReport;
use crate::model::{Delivered, WorkMessage, WorkstreamKey};
use crate::telemetry::metrics;

/// Consecutive forced interrupts after which the executor is reported as
/// ignoring cancellation.
pub const FORCED_STREAK_WARN: u32 = 3;

pub type ExecutorTask = JoinHandle<Result<ExecutionReport>>;

/// The one message a consumer is currently dispatching.
pub struct ActiveProcessingState {
    pub delivery: Delivered<WorkMessage>,
    pub message_id: String,
    pub started: Instant,
    pub cancel: CancellationToken,
    pub executor: ExecutorTask,
    pub interrupt_requested: bool,
    pub span: Span,
}

impl ActiveProcessingState {
    pub fn new(
        delivery: Delivered<WorkMessage>,
        cancel: CancellationToken,
        executor: ExecutorTask,
        span: Span,
    ) -> Self {
        Self {
            message_id: delivery.message.message_id.clone(),
            delivery,
            started: Instant::now(),
            cancel,
            executor,
            interrupt_requested: false,
            span,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Stop the invocation immediately, without a grace period.
    pub async fn hard_stop(&mut self, wait: Duration) {
        self.cancel.cancel();
        self.executor.abort();
        // The abort lands at the task's next await point.
        let _ = tokio::time::timeout(wait, &mut self.executor).await;
    }
}

/// How an interrupted invocation ended.
#[derive(Debug)]
pub enum InterruptOutcome {
    /// The invocation returned within the grace period.
    Acknowledged(std::result::Result<Result<ExecutionReport>, JoinError>),
    /// The grace period lapsed and the invocation was cancelled hard.
    Forced,
}

impl InterruptOutcome {
    pub fn kind(&self) -> InterruptKind {
        match self {
            InterruptOutcome::Acknowledged(_) => InterruptKind::Ack,
            InterruptOutcome::Forced => InterruptKind::Forced,
        }
    }
}

/// Per-workstream interrupt handling, tracking the forced-interrupt streak.
pub struct InterruptCoordinator {
    key: WorkstreamKey,
    grace: Duration,
    forced_streak: u32,
}

impl InterruptCoordinator {
    pub fn new(key: WorkstreamKey, grace: Duration) -> Self {
        Self {
            key,
            grace,
            forced_streak: 0,
        }
    }

    pub fn forced_streak(&self) -> u32 {
        self.forced_streak
    }

    /// Ask the in-flight invocation to stop because `superseded_by` needs
    /// the workstream, waiting at most the grace period before forcing it.
    pub async fn on_new_message_while_busy(
        &mut self,
        active: &mut ActiveProcessingState,
        superseded_by: &str,
        events: &dyn EventSink,
    ) -> InterruptOutcome {
        active.interrupt_requested = true;
        events.emit(EventKind::InterruptRequested {
            workstream: self.key.clone(),
            message_id: active.message_id.clone(),
            superseded_by: superseded_by.to_string(),
        });

        let requested = Instant::now();
        active.cancel.cancel();
        let outcome = match tokio::time::timeout(self.grace, &mut active.executor).await {
            Ok(joined) => InterruptOutcome::Acknowledged(joined),
            Err(_) => {
                active.hard_stop(self.grace).await;
                InterruptOutcome::Forced
            }
        };
        let waited_ms = requested.elapsed().as_millis() as u64;

        match outcome.kind() {
            InterruptKind::Ack => self.forced_streak = 0,
            InterruptKind::Forced => {
                self.forced_streak += 1;
                metrics::forced_interrupt_streak().record(
                    u64::from(self.forced_streak),
                    &[KeyValue::new("workstream", self.key.to_string())],
                );
                if self.forced_streak >= FORCED_STREAK_WARN {
                    warn!(
                        workstream = %self.key,
                        streak = self.forced_streak,
                        "executor keeps ignoring cancellation"
                    );
                }
            }
        }

        events.emit(EventKind::Interrupted {
            workstream: self.key.clone(),
            message_id: active.message_id.clone(),
            kind: outcome.kind(),
            waited_ms,
        });
        outcome
    }
}
