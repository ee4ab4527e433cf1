//! foreman-core: work item graph and distributed execution orchestrator.
//!
//! - [`store::GraphStore`] holds the work item graph and enforces the
//!   lifecycle state machine and graph invariants.
//! - [`readiness`] derives the ready set from a graph snapshot.
//! - [`claim`] is the compare-and-swap claim protocol and worker protocol.
//! - [`dispatch::Dispatcher`] checks batch independence, sizes execution,
//!   and runs workers.
//! - [`integrate::IntegrationPipeline`] is the single mainline writer.
//! - [`collab`] defines the external collaborator contracts, with
//!   [`memory`] and [`git`] implementations.
//!
//! # Conventions
//!
//! - **Errors**: [`error::ForemanError`] for domain operations;
//!   `anyhow::Result` only at the edges (config loading, path-level
//!   persistence helpers).
//! - **Logging**: `tracing` macros with structured fields; install a
//!   subscriber with [`telemetry::init_tracing`].

#![allow(
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::doc_markdown
)]

pub mod claim;
pub mod collab;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod git;
pub mod graph;
pub mod intake;
pub mod integrate;
pub mod lock;
pub mod memory;
pub mod model;
pub mod readiness;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ForemanError, Result};
pub use model::{Assignee, BlockCause, ItemId, ItemSpec, ItemType, Ownership, Status, WorkItem};
pub use store::{GraphStore, ItemFilter};
