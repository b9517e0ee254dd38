// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Talking to render backends.
//!
//! [`client::BackendClient`] is one connection to one backend (HTTP plus a
//! WebSocket push stream). [`tracker`] turns a submitted prompt id into a
//! definitive outcome by racing the push stream against history polling.
//! [`balancer::LoadBalancer`] keeps liveness snapshots of the whole fleet and
//! picks a backend per job.

/// Fleet health snapshots and backend selection.
pub mod balancer;
/// The per-backend HTTP + WebSocket client.
pub mod client;
/// Submit-to-outcome tracking.
pub mod tracker;
/// Wire-contract types for the backend HTTP/WS API.
pub mod wire;

pub use balancer::{HealthSnapshot, LoadBalancer};
pub use client::BackendClient;
pub use tracker::{track, TrackerConfig, TrackingOutcome};

/// Errors from backend interactions.
#[derive(Debug, thiserror::Error)]
pub enum BackendClientError {
    /// Connection-level failure.
    #[error("network error talking to {address}: {detail}")]
    Network {
        /// Backend address.
        address: String,
        /// Failure detail.
        detail: String,
    },

    /// Non-2xx response; the body is the backend's error message verbatim.
    #[error("backend {address} returned {status}: {body}")]
    Backend {
        /// Backend address.
        address: String,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// A call exceeded its deadline.
    #[error("request to {address} timed out")]
    Timeout {
        /// Backend address.
        address: String,
    },

    /// The backend answered with something the wire contract cannot parse.
    #[error("protocol error from {address}: {detail}")]
    Protocol {
        /// Backend address.
        address: String,
        /// Parse failure detail.
        detail: String,
    },
}

impl BackendClientError {
    pub(crate) fn from_reqwest(address: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendClientError::Timeout {
                address: address.to_string(),
            }
        } else {
            BackendClientError::Network {
                address: address.to_string(),
                detail: e.to_string(),
            }
        }
    }
}
