//! # workclaim
//!
//! Lets a small, elastic pool of generic workers cooperatively service many
//! independent (project, user) workstreams.
//!
//! Workers claim exclusive, leased ownership of a workstream from a pool of
//! claim offers (pgmq), drain that workstream's own ordered queue, interrupt
//! in-flight work when newer messages arrive, switch per-thread contexts
//! safely, and hand the workstream back after inactivity.

pub mod config;
pub mod context;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod model;
pub mod retry;
pub mod store;
pub mod telemetry;
