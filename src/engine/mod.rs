//! Coordination engine: claim broker, work consumers, interrupts, context
//! switching, idle release, lapsed-lease sweeping and the worker supervisor.

pub mod broker;
pub mod consumer;
pub mod intake;
pub mod interrupt;
pub mod session;
pub mod sweeper;
pub mod watcher;
pub mod worker;

use std::sync::Arc;

use crate::context::ContextBackend;
use crate::db::Db;
use crate::event::EventSink;
use crate::executor::TaskExecutor;
use crate::store::{OfferQueue, OwnershipStore, ResultSink, ThreadStore, WorkQueue};

pub use broker::{ClaimBroker, ClaimGrant, ServingGuard};
pub use consumer::{ConsumerState, WorkConsumer};
pub use intake::{Intake, SubmitResult};
pub use interrupt::{ActiveProcessingState, InterruptCoordinator, InterruptOutcome};
pub use session::SessionManager;
pub use sweeper::LeaseSweeper;
pub use worker::Worker;

/// The collaborators a worker coordinates.
#[derive(Clone)]
pub struct Services {
    pub ownership: Arc<dyn OwnershipStore>,
    pub offers: Arc<dyn OfferQueue>,
    pub queues: Arc<dyn WorkQueue>,
    pub threads: Arc<dyn ThreadStore>,
    pub results: Arc<dyn ResultSink>,
    pub executor: Arc<dyn TaskExecutor>,
    pub context: Arc<dyn ContextBackend>,
    pub events: Arc<dyn EventSink>,
}

impl Services {
    /// All stores and queues backed by one Postgres handle.
    pub fn postgres(
        db: Arc<Db>,
        executor: Arc<dyn TaskExecutor>,
        context: Arc<dyn ContextBackend>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            ownership: db.clone(),
            offers: db.clone(),
            queues: db.clone(),
            threads: db.clone(),
            results: db,
            executor,
            context,
            events,
        }
    }
}
