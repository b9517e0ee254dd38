// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! The orchestration workflows.
//!
//! Two durable workflow types run on the engine: [`job::JobWorkflow`] drives
//! one render job (pick backend → submit and track → enumerate outputs →
//! download and index), and [`chain::ChainWorkflow`] executes a planned DAG
//! level by level with conditional skipping, cross-backend artifact
//! transfer, and human-approval gates with regeneration. Everything
//! side-effectful lives in [`activities`]; workflow bodies only talk to the
//! engine context.

/// Activity implementations and registration.
pub mod activities;
/// The chain executor workflow.
pub mod chain;
/// The single-job workflow.
pub mod job;

pub use activities::{register_activities, Services};
pub use chain::{ChainRequest, ChainWorkflow, CHAIN_WORKFLOW};
pub use job::{JobWorkflow, JOB_WORKFLOW};

use rp_engine::Engine;
use std::sync::Arc;

/// Register both workflow types and every activity on an engine.
pub fn register_all(engine: &Engine, services: Arc<Services>) {
    register_activities(engine, services);
    engine.register_workflow(Arc::new(job::JobWorkflow));
    engine.register_workflow(Arc::new(chain::ChainWorkflow));
}
