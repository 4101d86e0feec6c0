//! # Beacon Session Analytics SDK
//!
//! A fail-open, in-process telemetry agent for latency-sensitive game
//! servers. Beacon observes per-user session lifecycle events (join, leave,
//! first input, first interaction, phase changes, custom marks), queues
//! them in memory, and ships them to a remote collector in batches —
//! without ever blocking, delaying, or crashing the host process, even
//! when the network is completely unavailable.
//!
//! ## Architecture
//!
//! ```text
//! Host engine -> Engine (capture) -> Event Queue -> flush (timer or
//! watermark) -> Dispatcher (snapshot + async send) -> Collector
//! ```
//!
//! Control never flows back into the hot path: dispatch outcomes only
//! update the performance counters. Delivery is best-effort by design —
//! no retries, no persistence — because gameplay responsiveness dominates
//! delivery completeness.
//!
//! ## Modules
//!
//! - [`config`]: Configuration, TOML loading, validation
//! - [`event`]: Event types and the session identifier generator
//! - [`session`]: Session records and the per-user registry
//! - [`queue`]: The ordered in-memory event queue
//! - [`dispatch`]: Batch payloads, the [`Transport`] seam, HTTP delivery
//! - [`stats`]: Performance counters for health checks
//! - [`engine`]: The [`Engine`] tying everything together

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod event;
pub mod queue;
pub mod session;
pub mod stats;

// Re-export commonly used types at crate root
pub use config::{Config, ConfigError};
pub use dispatch::{BatchPayload, DispatchError, HttpTransport, Transport};
pub use engine::Engine;
pub use event::{Event, EventKind};
pub use session::{Session, Subscription, UserId};
pub use stats::PerfStats;

/// SDK version reported on every batch payload.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
