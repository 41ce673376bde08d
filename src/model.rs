//! Core data model.
//!
//! A workstream is the unit of serialized work, keyed by project + user.
//! Workers hold leased ownership of workstreams, consume their ordered
//! messages, and switch between per-thread contexts inside them.

pub mod ownership;
pub mod thread;
pub mod workstream;

pub use ownership::{ClaimOutcome, OwnershipRecord, WorkerId};
pub use thread::{ContextHandle, ThreadContext};
pub use workstream::{ClaimOffer, Delivered, NewWorkMessage, QueueHandle, WorkMessage, WorkstreamKey};
