// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! renderplane: a durable, multi-backend orchestrator for generative render
//! farms.
//!
//! This crate re-exports the workspace members under stable names; the
//! end-to-end scenario suite in `tests/` exercises the whole stack against
//! simulated backends.

pub use rp_approval as approval;
pub use rp_backend as backend;
pub use rp_chain as chain;
pub use rp_core as core;
pub use rp_db as db;
pub use rp_engine as engine;
pub use rp_orchestrator as orchestrator;
pub use rp_registry as registry;
pub use rp_store as store;
