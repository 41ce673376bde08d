//! Work consumer: services one claimed workstream until it is released.
//!
//! States: `IdleOwned -> Dispatching -> IdleOwned | Dispatching[next] ->
//! ... -> Released`. While idle the consumer renews its lease on the
//! heartbeat and runs the idle reaper. While dispatching it races the
//! executor against the heartbeat, newly arrived messages and shutdown.
//! Any failed renewal ends dispatching at once: nothing is acknowledged or
//! recorded after the lease is known to be lost.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::Services;
use super::interrupt::{ActiveProcessingState, InterruptCoordinator, InterruptOutcome};
use super::session::SessionManager;
use super::watcher::{self, QueueWatcher};
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::event::{EventKind, ReleaseReason};
use crate::executor::{ExecutionOutcome, ExecutionReport, ExecutionRequest};
use crate::model::{
    ClaimOffer, ContextHandle, Delivered, OwnershipRecord, QueueHandle, WorkMessage, WorkerId,
    WorkstreamKey,
};
use crate::store::ResultRecord;
use crate::telemetry::work::{record_state_transition, start_claim_span, start_dispatch_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    IdleOwned,
    Dispatching,
    Released,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::IdleOwned => "idle_owned",
            ConsumerState::Dispatching => "dispatching",
            ConsumerState::Released => "released",
        }
    }
}

enum Step {
    Continue,
    Release(ReleaseReason),
}

pub struct WorkConsumer {
    key: WorkstreamKey,
    queue: QueueHandle,
    worker_id: WorkerId,
    config: WorkerConfig,
    services: Services,
    session: SessionManager,
    interrupts: InterruptCoordinator,
    /// Message ids handled during this claim.
    processed: HashSet<String>,
    /// Next message to dispatch, read while something else was in flight.
    pending: Option<Delivered<WorkMessage>>,
    state: ConsumerState,
    last_activity: Instant,
    lease_confirmed_at: Instant,
    shutdown: CancellationToken,
    span: Span,
}

impl WorkConsumer {
    pub fn new(
        record: OwnershipRecord,
        config: WorkerConfig,
        services: Services,
        shutdown: CancellationToken,
    ) -> Self {
        let key = record.workstream_key;
        let session = SessionManager::new(
            key.clone(),
            Arc::clone(&services.threads),
            Arc::clone(&services.context),
            Arc::clone(&services.events),
        );
        let now = Instant::now();
        Self {
            queue: key.queue_handle(),
            span: start_claim_span(&key, &record.worker_id),
            interrupts: InterruptCoordinator::new(key.clone(), config.interrupt_grace),
            worker_id: record.worker_id,
            key,
            config,
            services,
            session,
            processed: HashSet::new(),
            pending: None,
            state: ConsumerState::IdleOwned,
            last_activity: now,
            lease_confirmed_at: now,
            shutdown,
        }
    }

    pub fn key(&self) -> &WorkstreamKey {
        &self.key
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Service the workstream until it is released, returning why.
    pub async fn run(mut self) -> ReleaseReason {
        let span = self.span.clone();
        self.run_owned().instrument(span).await
    }

    async fn run_owned(&mut self) -> ReleaseReason {
        info!(workstream = %self.key, worker_id = %self.worker_id, "consumer started");
        record_state_transition(&self.span, "claimed", self.state.as_str());
        let mut watcher = QueueWatcher::spawn(
            Arc::clone(&self.services.queues),
            self.queue.clone(),
            self.config.queue_poll_wait,
        );
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.shutdown.clone();

        let reason = loop {
            let delivery = match self.pending.take() {
                Some(delivery) => delivery,
                None => {
                    let idle_deadline = self.last_activity + self.config.idle_timeout;
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break ReleaseReason::Shutdown,
                        _ = heartbeat.tick() => {
                            if self.renew().await {
                                continue;
                            }
                            break ReleaseReason::LeaseLost;
                        }
                        _ = tokio::time::sleep_until(idle_deadline) => {
                            debug!(workstream = %self.key, "idle timeout reached");
                            break ReleaseReason::Idle;
                        }
                        next = watcher.deliveries.recv() => match next {
                            Some(delivery) => delivery,
                            None => {
                                error!(workstream = %self.key, "queue watcher stopped unexpectedly");
                                break ReleaseReason::Shutdown;
                            }
                        },
                    }
                }
            };
            match self
                .handle(delivery, &mut watcher.deliveries, &mut heartbeat, &shutdown)
                .await
            {
                Step::Continue => {}
                Step::Release(reason) => break reason,
            }
        };

        self.release(reason, watcher).await;
        reason
    }

    async fn handle(
        &mut self,
        delivery: Delivered<WorkMessage>,
        deliveries: &mut mpsc::Receiver<Delivered<WorkMessage>>,
        heartbeat: &mut Interval,
        shutdown: &CancellationToken,
    ) -> Step {
        self.last_activity = Instant::now();
        if self.processed.contains(&delivery.message.message_id) {
            self.ack_duplicate(&delivery).await;
            return Step::Continue;
        }
        if !self.renew().await {
            self.pending = Some(delivery);
            return Step::Release(ReleaseReason::LeaseLost);
        }

        let context = match self.session.ensure_context(&delivery.message.thread_id).await {
            Ok(context) => context,
            Err(e) => {
                warn!(
                    workstream = %self.key,
                    message_id = %delivery.message.message_id,
                    error = %e,
                    "context activation failed"
                );
                let outcome = ExecutionOutcome::failure(format!("context activation failed: {e}"));
                return self.finish(delivery, outcome, 0, true).await;
            }
        };

        let mut active = self.start(delivery, context);
        let events = Arc::clone(&self.services.events);
        loop {
            tokio::select! {
                biased;
                joined = &mut active.executor => {
                    let outcome = completed_outcome(joined);
                    let label = if outcome.success { "success" } else { "failure" };
                    active.span.record("dispatch.result", label);
                    let duration_ms = active.elapsed_ms();
                    return self.finish(active.delivery, outcome, duration_ms, true).await;
                }
                _ = heartbeat.tick() => {
                    if !self.renew().await {
                        active.hard_stop(self.config.interrupt_grace).await;
                        active.span.record("dispatch.result", "lease_lost");
                        self.session.abandon();
                        self.pending = Some(active.delivery);
                        return Step::Release(ReleaseReason::LeaseLost);
                    }
                }
                next = deliveries.recv() => {
                    let Some(next) = next else {
                        error!(workstream = %self.key, "queue watcher stopped unexpectedly");
                        return self.stop_for_release(active, ReleaseReason::Shutdown).await;
                    };
                    if next.message.message_id == active.message_id {
                        debug!(message_id = %active.message_id, "in-flight message redelivered, ignoring");
                        continue;
                    }
                    if self.processed.contains(&next.message.message_id) {
                        self.ack_duplicate(&next).await;
                        continue;
                    }
                    let superseded_by = next.message.message_id.clone();
                    let outcome = self
                        .interrupts
                        .on_new_message_while_busy(&mut active, &superseded_by, events.as_ref())
                        .await;
                    self.pending = Some(next);
                    return self.finish_interrupted(active, outcome, &superseded_by).await;
                }
                _ = shutdown.cancelled() => {
                    return self.stop_for_release(active, ReleaseReason::Shutdown).await;
                }
            }
        }
    }

    fn start(
        &mut self,
        delivery: Delivered<WorkMessage>,
        context: ContextHandle,
    ) -> ActiveProcessingState {
        let message = &delivery.message;
        let span = start_dispatch_span(&self.key, &message.message_id, &message.thread_id);
        let request = ExecutionRequest::new(message, context);
        let cancel = CancellationToken::new();
        let executor = Arc::clone(&self.services.executor);
        let token = cancel.clone();
        let task = tokio::spawn(
            async move { executor.execute(request, token).await }.instrument(span.clone()),
        );

        self.services.events.emit(EventKind::Dispatched {
            workstream: self.key.clone(),
            message_id: message.message_id.clone(),
            thread_id: message.thread_id.clone(),
            arrival_order: message.arrival_order,
        });
        self.transition(ConsumerState::Dispatching);
        ActiveProcessingState::new(delivery, cancel, task, span)
    }

    /// Stop the in-flight invocation cooperatively, then release.
    async fn stop_for_release(
        &mut self,
        mut active: ActiveProcessingState,
        reason: ReleaseReason,
    ) -> Step {
        let events = Arc::clone(&self.services.events);
        let label = reason.to_string();
        let outcome = self
            .interrupts
            .on_new_message_while_busy(&mut active, &label, events.as_ref())
            .await;
        match self.finish_interrupted(active, outcome, &label).await {
            Step::Continue => Step::Release(reason),
            release => release,
        }
    }

    async fn finish_interrupted(
        &mut self,
        active: ActiveProcessingState,
        outcome: InterruptOutcome,
        superseded_by: &str,
    ) -> Step {
        // An invocation that finished its work inside the grace period
        // completed; everything else was cut short.
        let (outcome, completed) = match outcome {
            InterruptOutcome::Acknowledged(Ok(Ok(ExecutionReport::Finished(outcome)))) => {
                (outcome, true)
            }
            InterruptOutcome::Acknowledged(Ok(Ok(ExecutionReport::Stopped { committed }))) => (
                ExecutionOutcome {
                    success: false,
                    result_summary: format!("interrupted by {superseded_by}"),
                    committed,
                },
                false,
            ),
            InterruptOutcome::Acknowledged(Ok(Err(e))) => (
                ExecutionOutcome::failure(format!("executor error while stopping: {e}")),
                false,
            ),
            InterruptOutcome::Acknowledged(Err(e)) => (
                ExecutionOutcome::failure(format!("executor task failed: {e}")),
                false,
            ),
            InterruptOutcome::Forced => (
                ExecutionOutcome::failure(format!("interrupted by {superseded_by} (forced)")),
                false,
            ),
        };
        let label = match (completed, outcome.success) {
            (true, true) => "success",
            (true, false) => "failure",
            (false, _) => "interrupted",
        };
        active.span.record("dispatch.result", label);
        let duration_ms = active.elapsed_ms();
        self.finish(active.delivery, outcome, duration_ms, completed).await
    }

    /// Record the outcome of a handled message and acknowledge it, provided
    /// the lease still holds.
    async fn finish(
        &mut self,
        delivery: Delivered<WorkMessage>,
        outcome: ExecutionOutcome,
        duration_ms: u64,
        completed: bool,
    ) -> Step {
        let message = delivery.message;
        if !self.renew().await {
            self.services.events.emit(EventKind::ResultDiscarded {
                workstream: self.key.clone(),
                message_id: message.message_id.clone(),
            });
            self.session.abandon();
            watcher::abandon(self.services.queues.as_ref(), &self.queue, delivery.receipt).await;
            return Step::Release(ReleaseReason::LeaseLost);
        }

        let record = ResultRecord {
            message_id: message.message_id.clone(),
            workstream_key: self.key.clone(),
            thread_id: message.thread_id.clone(),
            worker_id: self.worker_id.clone(),
            success: outcome.success,
            result_summary: outcome.result_summary,
            committed: outcome.committed,
            continuation_token: message.continuation_token.clone(),
            duration_ms,
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.services.results.deliver(&record).await {
            error!(
                workstream = %self.key,
                message_id = %message.message_id,
                error = %e,
                "failed to deliver result"
            );
        }
        self.ack(delivery.receipt).await;
        self.processed.insert(message.message_id.clone());
        self.session.touch(&message.message_id).await;
        if completed {
            self.services.events.emit(EventKind::Completed {
                workstream: self.key.clone(),
                message_id: message.message_id,
                success: record.success,
                duration_ms,
            });
        }
        self.last_activity = Instant::now();
        self.transition(ConsumerState::IdleOwned);
        Step::Continue
    }

    /// Extend the lease. `false` means this consumer no longer owns the
    /// workstream.
    async fn renew(&mut self) -> bool {
        match self
            .services
            .ownership
            .renew(&self.key, &self.worker_id, self.config.lease)
            .await
        {
            Ok(Some(_)) => {
                self.lease_confirmed_at = Instant::now();
                true
            }
            Ok(None) => {
                self.lease_lost();
                false
            }
            // The store is unreachable. The lease last confirmed is still
            // trusted for half its length, which covers one missed heartbeat.
            Err(e) if self.lease_confirmed_at.elapsed() < self.config.lease / 2 => {
                warn!(workstream = %self.key, error = %e, "lease renewal failed, lease still valid");
                true
            }
            Err(e) => {
                warn!(workstream = %self.key, error = %e, "lease renewal failed, lease unconfirmed");
                self.lease_lost();
                false
            }
        }
    }

    fn lease_lost(&self) {
        self.services.events.emit(EventKind::LeaseRenewalFailed {
            workstream: self.key.clone(),
            worker_id: self.worker_id.clone(),
        });
    }

    async fn ack(&self, receipt: i64) {
        if let Err(e) = self.services.queues.ack(&self.queue, receipt).await {
            warn!(workstream = %self.key, receipt, error = %e, "failed to acknowledge message");
        }
    }

    async fn ack_duplicate(&self, delivery: &Delivered<WorkMessage>) {
        self.ack(delivery.receipt).await;
        self.services.events.emit(EventKind::Duplicate {
            workstream: self.key.clone(),
            message_id: delivery.message.message_id.clone(),
        });
    }

    async fn release(&mut self, reason: ReleaseReason, watcher: QueueWatcher) {
        let queues = Arc::clone(&self.services.queues);
        for held in watcher.stop().await.into_iter().chain(self.pending.take()) {
            watcher::abandon(queues.as_ref(), &self.queue, held.receipt).await;
        }

        if reason == ReleaseReason::LeaseLost {
            self.session.abandon();
        } else {
            self.session.flush_current().await;
        }

        match self
            .services
            .ownership
            .release(&self.key, &self.worker_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(workstream = %self.key, "ownership record already gone"),
            Err(e) => warn!(workstream = %self.key, error = %e, "release failed, lease will expire"),
        }
        self.transition(ConsumerState::Released);
        self.services.events.emit(EventKind::Released {
            workstream: self.key.clone(),
            worker_id: self.worker_id.clone(),
            reason,
        });

        if let Err(e) = self.reannounce_stranded().await {
            warn!(workstream = %self.key, error = %e, "failed to check for stranded work");
        }
    }

    /// Offer the workstream again if messages are still queued, so work
    /// that arrived during the release is not left without an owner.
    async fn reannounce_stranded(&self) -> Result<()> {
        let pending = self.services.queues.pending(&self.queue).await?;
        if pending > 0 {
            info!(workstream = %self.key, pending, "re-announcing workstream with queued work");
            self.services
                .offers
                .announce(&ClaimOffer::for_key(&self.key))
                .await?;
        }
        Ok(())
    }

    fn transition(&mut self, to: ConsumerState) {
        if self.state != to {
            record_state_transition(&self.span, self.state.as_str(), to.as_str());
            self.state = to;
        }
    }
}

fn completed_outcome(
    joined: std::result::Result<Result<ExecutionReport>, JoinError>,
) -> ExecutionOutcome {
    match joined {
        Ok(Ok(ExecutionReport::Finished(outcome))) => outcome,
        Ok(Ok(ExecutionReport::Stopped { committed })) => ExecutionOutcome {
            success: false,
            result_summary: "executor stopped without a stop request".to_string(),
            committed,
        },
        Ok(Err(e)) => ExecutionOutcome::failure(format!("executor error: {e}")),
        Err(e) => ExecutionOutcome::failure(format!("executor task failed: {e}")),
    }
}
