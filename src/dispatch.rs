//! Batch dispatch — HTTP POST of event batches to the collector.
//!
//! The [`Dispatcher`] turns a drained queue snapshot into a
//! [`BatchPayload`] and hands it to a [`Transport`] bounded by a fixed
//! timeout. Dispatch is fail-open: every outcome lands in the performance
//! counters and logs, and nothing ever propagates back to the capture path.
//! A failed or timed-out batch is discarded — gameplay responsiveness
//! dominates delivery completeness.
//!
//! # Example
//!
//! ```rust,ignore
//! use beacon::dispatch::{Dispatcher, HttpTransport};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(HttpTransport::new(
//!     "https://ingest.beacon.dev",
//!     "pk_live_abc",
//! ));
//! let dispatcher = Dispatcher::new(&config, transport, counters);
//! tokio::spawn(async move { dispatcher.send_batch(events).await });
//! ```

use crate::config::Config;
use crate::event::Event;
use crate::stats::PerfCounters;
use crate::SDK_VERSION;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Path appended to the endpoint base URL for batch ingestion.
pub const BATCH_PATH: &str = "/v1/events/batch";

/// Errors that can occur while delivering a batch.
///
/// These never cross the engine boundary; they are counted and logged by
/// the dispatch task.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// HTTP request failed before a response arrived
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The collector answered with a non-success status
    #[error("collector returned status {0}")]
    Status(u16),

    /// The attempt exceeded the configured bound and was abandoned
    #[error("dispatch timed out after {0:?}")]
    Timeout(Duration),
}

/// The wire payload for one flush.
///
/// Built from a queue snapshot after the live queue has already been
/// cleared, so no event can appear in two payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchPayload {
    /// SDK version that produced this batch
    pub sdk_version: String,

    /// Hosting experience identifier
    pub experience_id: i64,

    /// Hosting place identifier
    pub place_id: i64,

    /// Identifier of the server instance that captured these events
    pub server_instance_id: String,

    /// ISO-8601 UTC timestamp taken when the payload was built
    pub sent_at: String,

    /// True when the batch is test traffic
    pub test: bool,

    /// Events in capture order
    pub events: Vec<Event>,
}

/// Delivers a serialized batch to the collector.
///
/// The engine talks to the collector only through this trait, so tests can
/// substitute recording, failing, or hanging transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attempt a single delivery of `payload`.
    async fn deliver(&self, payload: &BatchPayload) -> Result<(), DispatchError>;
}

/// [`Transport`] over HTTP POST with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// Full batch ingestion URL
    url: String,

    /// HTTP client (reused for connection pooling)
    client: Client,

    /// Bearer token sent on every request
    project_key: String,
}

impl HttpTransport {
    /// Create a transport targeting `<base_url>/v1/events/batch`.
    pub fn new(base_url: &str, project_key: impl Into<String>) -> Self {
        Self {
            url: format!("{}{}", base_url.trim_end_matches('/'), BATCH_PATH),
            client: Client::new(),
            project_key: project_key.into(),
        }
    }

    /// The URL batches are posted to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, payload: &BatchPayload) -> Result<(), DispatchError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.project_key)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(url = %self.url, status = %status, "Batch accepted by collector");
            Ok(())
        } else {
            warn!(url = %self.url, status = %status, "Collector rejected batch");
            Err(DispatchError::Status(status.as_u16()))
        }
    }
}

/// Builds payloads from queue snapshots and performs timeout-bounded,
/// fire-and-forget delivery.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    counters: Arc<PerfCounters>,
    timeout: Duration,
    experience_id: i64,
    place_id: i64,
    server_instance_id: String,
    test_mode: bool,
}

impl Dispatcher {
    /// Create a dispatcher for the given environment and transport.
    pub fn new(config: &Config, transport: Arc<dyn Transport>, counters: Arc<PerfCounters>) -> Self {
        Self {
            transport,
            counters,
            timeout: config.request_timeout(),
            experience_id: config.experience_id,
            place_id: config.place_id,
            server_instance_id: config.server_instance_id.clone(),
            test_mode: config.studio_test_mode,
        }
    }

    /// Build the wire payload for a snapshot.
    pub fn build_payload(&self, events: Vec<Event>) -> BatchPayload {
        BatchPayload {
            sdk_version: SDK_VERSION.to_string(),
            experience_id: self.experience_id,
            place_id: self.place_id,
            server_instance_id: self.server_instance_id.clone(),
            sent_at: Utc::now().to_rfc3339(),
            test: self.test_mode,
            events,
        }
    }

    /// Deliver one snapshot, recording the outcome in the counters.
    ///
    /// A single attempt, no retry. On timeout the in-flight future is
    /// dropped, so a late completion cannot touch the counters afterwards.
    pub async fn send_batch(&self, events: Vec<Event>) {
        let count = events.len() as u64;
        let payload = self.build_payload(events);

        debug!(events = count, "Dispatching batch");

        let outcome = match tokio::time::timeout(self.timeout, self.transport.deliver(&payload))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(self.timeout)),
        };

        match outcome {
            Ok(()) => {
                self.counters.batch_sent(count, Utc::now().timestamp());
                info!(events = count, "Batch delivered");
            }
            Err(e) => {
                self.counters.batch_failed();
                warn!(error = %e, dropped_events = count, "Batch dispatch failed, events discarded");
            }
        }
    }
}
