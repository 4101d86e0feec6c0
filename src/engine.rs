//! The Beacon engine — session tracking, capture, and flush scheduling.
//!
//! One [`Engine`] instance is created per host process with
//! [`Engine::init`] and torn down with [`Engine::shutdown`]. There is no
//! ambient singleton: the host passes the engine (it is `Clone`, an `Arc`
//! underneath) to whatever code needs to record telemetry.
//!
//! # Design contract
//!
//! Telemetry must be invisible to gameplay. Every capture-path operation
//! returns in bounded, small time: validation failures are logged and
//! dropped, dispatch runs on background tasks, and no failure of any kind
//! propagates to the caller. The host only ever notices missing data in
//! the downstream collector, never a behavioral change.
//!
//! # Flush policy
//!
//! Two triggers funnel into the same [`Engine::flush`] entry point: a
//! periodic timer and a queue-length watermark hit during capture. A flush
//! drains the queue synchronously, then spawns the dispatch and returns —
//! so no event can land in two batches even while a send is in flight.
//!
//! # Example
//!
//! ```rust,ignore
//! use beacon::{Config, Engine, UserId};
//!
//! let engine = Engine::init(Config::new("pk_live_abc"))?;
//! engine.user_joined(UserId(261));
//! engine.set_phase(UserId(261), "lobby");
//! engine.user_left(UserId(261));
//! engine.shutdown();
//! ```

use crate::config::{Config, ConfigError};
use crate::dispatch::{Dispatcher, HttpTransport, Transport};
use crate::event::{Event, EventKind};
use crate::queue::EventQueue;
use crate::session::{SessionRegistry, Subscription, UserId};
use crate::stats::{PerfCounters, PerfStats};
use chrono::Utc;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Upper bound on phase names, interaction labels, and custom mark names.
pub const MAX_NAME_LEN: usize = 64;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap())
}

/// True if `name` is a valid phase/mark name: 1..=64 chars of `[A-Za-z0-9_-]`.
fn valid_name(name: &str) -> bool {
    name_pattern().is_match(name)
}

/// Reduce a free-form label to the allowed character class, truncated to
/// [`MAX_NAME_LEN`] characters.
fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_NAME_LEN)
        .collect()
}

/// State mutated only from the capture path.
struct CaptureState {
    registry: SessionRegistry,
    queue: EventQueue,
}

struct EngineInner {
    config: Config,
    state: Mutex<CaptureState>,
    counters: Arc<PerfCounters>,
    dispatcher: Arc<Dispatcher>,
    /// Handle captured at init so flushes can be spawned from any host
    /// thread, not just runtime threads
    runtime: tokio::runtime::Handle,
    shutdown_tx: broadcast::Sender<()>,
    initialized: AtomicBool,
}

/// The session and batch dispatch engine.
///
/// Cheap to clone; all clones share the same state. Must be created inside
/// a tokio runtime (dispatch and the periodic flush run on it).
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Validate `config`, build the HTTP transport, and start the engine.
    ///
    /// Invalid configuration is fatal: the error is returned and nothing
    /// starts.
    pub fn init(config: Config) -> Result<Engine, ConfigError> {
        config.validate()?;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
            &config.endpoint_base_url,
            config.project_key.clone(),
        ));
        Ok(Self::start(config, transport))
    }

    /// Start the engine with a caller-supplied transport.
    ///
    /// Used by tests and by hosts that tunnel batches through their own
    /// networking layer.
    pub fn init_with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
    ) -> Result<Engine, ConfigError> {
        config.validate()?;
        Ok(Self::start(config, transport))
    }

    fn start(config: Config, transport: Arc<dyn Transport>) -> Engine {
        let counters = Arc::new(PerfCounters::new());
        let dispatcher = Arc::new(Dispatcher::new(&config, transport, Arc::clone(&counters)));
        let (shutdown_tx, _) = broadcast::channel(1);

        let engine = Engine {
            inner: Arc::new(EngineInner {
                state: Mutex::new(CaptureState {
                    registry: SessionRegistry::new(),
                    queue: EventQueue::new(),
                }),
                counters,
                dispatcher,
                runtime: tokio::runtime::Handle::current(),
                shutdown_tx,
                initialized: AtomicBool::new(true),
                config,
            }),
        };

        engine.spawn_scheduler();

        info!(
            endpoint = %engine.inner.config.endpoint_base_url,
            flush_interval_seconds = engine.inner.config.flush_interval_seconds,
            max_batch_size = engine.inner.config.max_batch_size,
            test_mode = engine.inner.config.studio_test_mode,
            "Engine initialized"
        );

        engine
    }

    /// Periodic flush driver. A failed dispatch never stops the schedule;
    /// only shutdown does.
    fn spawn_scheduler(&self) {
        let engine = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let period = self.inner.config.flush_interval();

        self.inner.runtime.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.flush(),
                    _ = shutdown_rx.recv() => {
                        debug!("Flush scheduler stopped");
                        break;
                    }
                }
            }
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, CaptureState> {
        // Fail-open: a poisoned lock must not take telemetry down with it
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True between `init` and `shutdown`.
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Capture an event for an arbitrary session id.
    ///
    /// Dropped silently (with a warning) when the engine is not running —
    /// capture failures never surface as errors to instrumented code.
    pub fn emit(&self, session_id: &str, kind: EventKind, props: Value) {
        if !self.is_initialized() {
            warn!(kind = %kind, "Dropping event: engine is not running");
            return;
        }
        self.capture(Event::new(session_id, kind, props));
    }

    /// Append an event and apply the watermark trigger.
    ///
    /// The flush itself only snapshots and spawns, so this still returns
    /// immediately.
    fn capture(&self, event: Event) {
        let at_watermark = {
            let mut state = self.lock_state();
            let len = state.queue.push(event);
            self.inner.counters.event_captured();
            len >= self.inner.config.max_batch_size
        };

        if at_watermark {
            debug!(
                max_batch_size = self.inner.config.max_batch_size,
                "Queue reached watermark, flushing"
            );
            self.flush();
        }
    }

    /// Snapshot the queue and dispatch it in the background.
    ///
    /// Idempotent on an empty queue. The drain happens synchronously under
    /// the lock before any async work, so an event can never be included
    /// in two batches.
    pub fn flush(&self) {
        if !self.is_initialized() {
            return;
        }
        self.flush_snapshot();
    }

    fn flush_snapshot(&self) {
        let batch = {
            let mut state = self.lock_state();
            if state.queue.is_empty() {
                return;
            }
            let batch = state.queue.drain();
            self.inner.counters.queue_drained();
            batch
        };

        let dispatcher = Arc::clone(&self.inner.dispatcher);
        self.inner.runtime.spawn(async move {
            dispatcher.send_batch(batch).await;
        });
    }

    /// Get the session for `user`, creating it (and emitting
    /// `session_start`) if this is the first reference.
    fn ensure_session(&self, user: UserId) -> String {
        let (session_id, start_event) = {
            let mut state = self.lock_state();
            let (session, created) = state.registry.get_or_create(user);
            let id = session.id.clone();
            let start = created.then(|| Event::new(id.clone(), EventKind::SessionStart, json!({})));
            (id, start)
        };
        if let Some(event) = start_event {
            self.capture(event);
        }
        session_id
    }

    /// A user connected. Creates the session and emits `session_start`
    /// (no-op if a session was already created lazily).
    pub fn user_joined(&self, user: UserId) {
        if !self.is_initialized() {
            warn!(user = %user, "Ignoring join: engine is not running");
            return;
        }
        self.ensure_session(user);
    }

    /// A user disconnected. Emits `session_end`, then destroys the session
    /// and cancels its detection guards. Unknown handle: safe no-op.
    pub fn user_left(&self, user: UserId) {
        if !self.is_initialized() {
            warn!(user = %user, "Ignoring leave: engine is not running");
            return;
        }

        // The session leaves the lock scope intact: its cancel callbacks
        // are host code and may re-enter the engine, so they must run only
        // after the guard is released.
        let session = {
            let mut state = self.lock_state();
            state.registry.destroy(user)
        };

        match session {
            Some(session) => {
                let duration = session.duration_seconds(Utc::now().timestamp());
                let event = Event::new(
                    session.id.clone(),
                    EventKind::SessionEnd,
                    json!({ "duration_seconds": duration }),
                );
                drop(session);
                self.capture(event);
            }
            None => debug!(user = %user, "Leave for unknown user, nothing to do"),
        }
    }

    /// The host observed the first meaningful input for `user`.
    ///
    /// Idempotent per session: only the first call emits `first_input`.
    pub fn record_input(&self, user: UserId) {
        if !self.is_initialized() {
            warn!(user = %user, "Ignoring input signal: engine is not running");
            return;
        }

        let (start_event, input_event) = {
            let mut state = self.lock_state();
            let (session, created) = state.registry.get_or_create(user);
            let id = session.id.clone();
            let start = created.then(|| Event::new(id.clone(), EventKind::SessionStart, json!({})));
            let input = if session.first_input_seen {
                None
            } else {
                session.first_input_seen = true;
                Some(Event::new(id, EventKind::FirstInput, json!({})))
            };
            (start, input)
        };

        if let Some(event) = start_event {
            self.capture(event);
        }
        if let Some(event) = input_event {
            self.capture(event);
        }
    }

    /// The host observed an interaction for `user`.
    ///
    /// Idempotent per session — only the first call emits
    /// `first_interaction`, carrying the first label. Labels are reduced to
    /// `[A-Za-z0-9_-]` and truncated to 64 characters.
    pub fn mark_interaction(&self, user: UserId, label: Option<&str>) {
        if !self.is_initialized() {
            warn!(user = %user, "Ignoring interaction: engine is not running");
            return;
        }

        let (start_event, interaction_event) = {
            let mut state = self.lock_state();
            let (session, created) = state.registry.get_or_create(user);
            let id = session.id.clone();
            let start = created.then(|| Event::new(id.clone(), EventKind::SessionStart, json!({})));
            let interaction = if session.first_interaction_seen {
                debug!(user = %user, "Interaction already recorded for session");
                None
            } else {
                session.first_interaction_seen = true;
                let props = match label.map(sanitize_label) {
                    Some(clean) if !clean.is_empty() => json!({ "label": clean }),
                    _ => json!({}),
                };
                Some(Event::new(id, EventKind::FirstInteraction, props))
            };
            (start, interaction)
        };

        if let Some(event) = start_event {
            self.capture(event);
        }
        if let Some(event) = interaction_event {
            self.capture(event);
        }
    }

    /// Record a phase change for `user`.
    ///
    /// The phase name must match `[A-Za-z0-9_-]{1,64}` exactly; anything
    /// else is rejected with a warning and no state change.
    pub fn set_phase(&self, user: UserId, phase: &str) {
        if !self.is_initialized() {
            warn!(user = %user, "Ignoring phase change: engine is not running");
            return;
        }
        if !valid_name(phase) {
            warn!(user = %user, phase = %phase, "Rejecting invalid phase name");
            return;
        }

        let (start_event, phase_event) = {
            let mut state = self.lock_state();
            let (session, created) = state.registry.get_or_create(user);
            let id = session.id.clone();
            let start = created.then(|| Event::new(id.clone(), EventKind::SessionStart, json!({})));
            let previous = session.current_phase.replace(phase.to_string());
            let event = Event::new(
                id,
                EventKind::PhaseChange,
                json!({ "phase": phase, "previous": previous }),
            );
            (start, event)
        };

        if let Some(event) = start_event {
            self.capture(event);
        }
        self.capture(phase_event);
    }

    /// Record a custom mark for `user`.
    ///
    /// The mark name is validated like a phase name; `props` may be any
    /// JSON object.
    pub fn track(&self, user: UserId, name: &str, props: Value) {
        if !self.is_initialized() {
            warn!(user = %user, "Ignoring mark: engine is not running");
            return;
        }
        if !valid_name(name) {
            warn!(user = %user, name = %name, "Rejecting invalid mark name");
            return;
        }

        let session_id = self.ensure_session(user);
        self.capture(Event::new(session_id, EventKind::Custom(name.to_string()), props));
    }

    /// Hand a host-side detection guard to the session for `user`.
    ///
    /// The guard is cancelled when the session is destroyed. If no session
    /// exists the guard is cancelled immediately.
    pub fn attach_subscription(&self, user: UserId, subscription: Subscription) {
        let rejected = {
            let mut state = self.lock_state();
            match state.registry.get_mut(user) {
                Some(session) => {
                    session.attach(subscription);
                    None
                }
                None => Some(subscription),
            }
        };

        // Cancel outside the lock: the callback may re-enter the engine
        if let Some(subscription) = rejected {
            debug!(user = %user, "No session for subscription, cancelling");
            subscription.cancel();
        }
    }

    /// True if a live session exists for `user`.
    pub fn has_session(&self, user: UserId) -> bool {
        self.lock_state().registry.contains(user)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.lock_state().registry.len()
    }

    /// Consistent snapshot of the performance counters.
    pub fn perf_stats(&self) -> PerfStats {
        self.inner.counters.snapshot()
    }

    /// Stop the engine: one last flush, stop the periodic timer, release
    /// every session's guards, and clear the registry.
    ///
    /// The final dispatch keeps normal fire-and-forget semantics; everything
    /// else completes before this returns. Calling `shutdown` twice warns
    /// and does nothing the second time.
    pub fn shutdown(&self) {
        if !self.inner.initialized.swap(false, Ordering::SeqCst) {
            warn!("Shutdown called on an engine that is not running");
            return;
        }

        self.flush_snapshot();
        let _ = self.inner.shutdown_tx.send(());

        let sessions = {
            let mut state = self.lock_state();
            state.registry.drain()
        };
        let sessions_closed = sessions.len();
        // Dropping outside the lock runs every cancel callback where it can
        // safely re-enter the engine
        drop(sessions);
        info!(sessions_closed, "Engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{BatchPayload, DispatchError};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    /// Transport that records every payload it is handed.
    struct RecordingTransport {
        payloads: Mutex<Vec<BatchPayload>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                payloads: Mutex::new(Vec::new()),
            })
        }

        fn batches(&self) -> Vec<BatchPayload> {
            self.payloads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl crate::dispatch::Transport for RecordingTransport {
        async fn deliver(&self, payload: &BatchPayload) -> Result<(), DispatchError> {
            self.payloads.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    fn test_engine(transport: Arc<RecordingTransport>) -> Engine {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let config = Config::new("pk_test")
            // Long interval so only explicit triggers flush in most tests
            .with_flush_interval(60.0)
            .with_request_timeout(1.0);
        Engine::init_with_transport(config, transport).unwrap()
    }

    /// Wait for spawned dispatch tasks to run.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn test_valid_name() {
        assert!(valid_name("lobby"));
        assert!(valid_name("round_2"));
        assert!(valid_name("boss-fight"));
        assert!(valid_name(&"a".repeat(64)));
        assert!(!valid_name(""));
        assert!(!valid_name("has space"));
        assert!(!valid_name("accénted"));
        assert!(!valid_name(&"a".repeat(65)));
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("shop npc!"), "shopnpc");
        assert_eq!(sanitize_label("ok_label-1"), "ok_label-1");
        assert_eq!(sanitize_label(&"x".repeat(100)).len(), 64);
        assert_eq!(sanitize_label("???"), "");
    }

    #[tokio::test]
    async fn test_init_rejects_bad_config() {
        let result = Engine::init(Config::new(""));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_emit_queues_until_watermark() {
        let transport = RecordingTransport::new();
        let config = Config::new("pk_test")
            .with_flush_interval(60.0)
            .with_max_batch_size(5);
        let engine = Engine::init_with_transport(config, transport.clone()).unwrap();

        for n in 0..4u64 {
            engine.emit("s1", EventKind::Custom("mark".into()), json!({ "n": n }));
            assert_eq!(engine.perf_stats().pending_events, n + 1);
        }

        // The fifth capture reaches the watermark and flushes
        engine.emit("s1", EventKind::Custom("mark".into()), json!({ "n": 4 }));
        assert_eq!(engine.perf_stats().pending_events, 0);

        settle().await;
        let batches = transport.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].events.len(), 5);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_auto_flush_then_interval_flush() {
        let transport = RecordingTransport::new();
        let config = Config::new("pk_test")
            .with_flush_interval(0.2)
            .with_max_batch_size(25);
        let engine = Engine::init_with_transport(config, transport.clone()).unwrap();

        for n in 0..30 {
            engine.emit("s1", EventKind::Custom("mark".into()), json!({ "n": n }));
        }

        // One automatic flush of 25, five left in the queue
        settle().await;
        assert_eq!(transport.batches().len(), 1);
        assert_eq!(transport.batches()[0].events.len(), 25);
        assert_eq!(engine.perf_stats().pending_events, 5);

        // The periodic timer flushes the remainder
        tokio::time::sleep(Duration::from_millis(400)).await;
        let batches = transport.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].events.len(), 5);
        assert_eq!(engine.perf_stats().pending_events, 0);
        assert_eq!(engine.perf_stats().events_sent, 30);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_flush_idempotent_on_empty_queue() {
        let transport = RecordingTransport::new();
        let engine = test_engine(transport.clone());

        engine.emit("s1", EventKind::Custom("mark".into()), json!({}));
        engine.flush();
        engine.flush();

        settle().await;
        assert_eq!(transport.batches().len(), 1);
        assert_eq!(engine.perf_stats().flushes, 1);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_no_event_appears_in_two_batches() {
        let transport = RecordingTransport::new();
        let engine = test_engine(transport.clone());

        for n in 0..3 {
            engine.emit("s1", EventKind::Custom("mark".into()), json!({ "n": n }));
        }
        engine.flush();
        for n in 3..5 {
            engine.emit("s1", EventKind::Custom("mark".into()), json!({ "n": n }));
        }
        engine.flush();

        settle().await;
        let batches = transport.batches();
        assert_eq!(batches.len(), 2);
        let first: Vec<i64> = batches[0]
            .events
            .iter()
            .map(|e| e.props["n"].as_i64().unwrap())
            .collect();
        let second: Vec<i64> = batches[1]
            .events
            .iter()
            .map(|e| e.props["n"].as_i64().unwrap())
            .collect();
        assert_eq!(first, vec![0, 1, 2]);
        assert_eq!(second, vec![3, 4]);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_session_lifecycle_events() {
        let transport = RecordingTransport::new();
        let engine = test_engine(transport.clone());

        engine.user_joined(UserId(1));
        assert!(engine.has_session(UserId(1)));
        engine.user_left(UserId(1));
        assert!(!engine.has_session(UserId(1)));

        engine.flush();
        settle().await;

        let batches = transport.batches();
        let events = &batches[0].events;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::SessionStart);
        assert_eq!(events[1].kind, EventKind::SessionEnd);
        assert_eq!(events[0].session_id, events[1].session_id);
        assert!(events[1].props["duration_seconds"].as_i64().unwrap() >= 0);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_leave_for_unknown_user_is_noop() {
        let transport = RecordingTransport::new();
        let engine = test_engine(transport.clone());

        engine.user_left(UserId(99));
        engine.flush();
        settle().await;

        assert!(transport.batches().is_empty());
        let stats = engine.perf_stats();
        assert_eq!(stats.events_captured, 0);
        assert_eq!(stats.errors, 0);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_join_after_lazy_creation_emits_one_start() {
        let transport = RecordingTransport::new();
        let engine = test_engine(transport.clone());

        // Phase call arrives before the explicit join
        engine.set_phase(UserId(1), "loading");
        engine.user_joined(UserId(1));

        engine.flush();
        settle().await;

        let batches = transport.batches();
        let events = &batches[0].events;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::SessionStart);
        assert_eq!(events[1].kind, EventKind::PhaseChange);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_record_input_once_per_session() {
        let transport = RecordingTransport::new();
        let engine = test_engine(transport.clone());

        engine.user_joined(UserId(1));
        engine.record_input(UserId(1));
        engine.record_input(UserId(1));

        engine.flush();
        settle().await;

        let batches = transport.batches();
        let events = &batches[0].events;
        let inputs = events
            .iter()
            .filter(|e| e.kind == EventKind::FirstInput)
            .count();
        assert_eq!(inputs, 1);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_mark_interaction_first_label_wins() {
        let transport = RecordingTransport::new();
        let engine = test_engine(transport.clone());

        engine.user_joined(UserId(1));
        engine.mark_interaction(UserId(1), Some("shop npc"));
        engine.mark_interaction(UserId(1), Some("other_trigger"));

        engine.flush();
        settle().await;

        let batches = transport.batches();
        let events = &batches[0].events;
        let interactions: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::FirstInteraction)
            .collect();
        assert_eq!(interactions.len(), 1);
        assert_eq!(interactions[0].props["label"], "shopnpc");
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_set_phase_rejects_invalid_names() {
        let transport = RecordingTransport::new();
        let engine = test_engine(transport.clone());

        engine.user_joined(UserId(1));
        let before = engine.perf_stats();

        engine.set_phase(UserId(1), "has space");
        engine.set_phase(UserId(1), &"x".repeat(65));

        let after = engine.perf_stats();
        assert_eq!(after.events_captured, before.events_captured);
        assert_eq!(after.pending_events, before.pending_events);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_set_phase_records_previous() {
        let transport = RecordingTransport::new();
        let engine = test_engine(transport.clone());

        engine.user_joined(UserId(1));
        engine.set_phase(UserId(1), "lobby");
        engine.set_phase(UserId(1), "round_1");

        engine.flush();
        settle().await;

        let batches = transport.batches();
        let events = &batches[0].events;
        let phases: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::PhaseChange)
            .collect();
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[0].props["phase"], "lobby");
        assert!(phases[0].props["previous"].is_null());
        assert_eq!(phases[1].props["phase"], "round_1");
        assert_eq!(phases[1].props["previous"], "lobby");
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_track_custom_mark() {
        let transport = RecordingTransport::new();
        let engine = test_engine(transport.clone());

        engine.user_joined(UserId(1));
        engine.track(UserId(1), "boss_defeated", json!({ "boss": "gorgon" }));
        engine.track(UserId(1), "bad name!", json!({}));

        engine.flush();
        settle().await;

        let batches = transport.batches();
        let events = &batches[0].events;
        let marks: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::Custom(_)))
            .collect();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].kind.as_wire(), "boss_defeated");
        assert_eq!(marks[0].props["boss"], "gorgon");
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_subscription_cancelled_on_leave() {
        let transport = RecordingTransport::new();
        let engine = test_engine(transport.clone());
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);

        engine.user_joined(UserId(1));
        engine.attach_subscription(
            UserId(1),
            Subscription::new(move || flag.store(true, Ordering::SeqCst)),
        );

        assert!(!cancelled.load(Ordering::SeqCst));
        engine.user_left(UserId(1));
        assert!(cancelled.load(Ordering::SeqCst));
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_hook_may_reenter_engine_on_leave() {
        let transport = RecordingTransport::new();
        let engine = test_engine(transport.clone());

        engine.user_joined(UserId(1));
        let hook_engine = engine.clone();
        let saw_session_gone = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&saw_session_gone);
        engine.attach_subscription(
            UserId(1),
            // Hooks are host code and free to call back into the engine
            Subscription::new(move || {
                flag.store(!hook_engine.has_session(UserId(1)), Ordering::SeqCst);
            }),
        );

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = engine.clone();
        std::thread::spawn(move || {
            worker.user_left(UserId(1));
            let _ = tx.send(());
        });

        rx.recv_timeout(Duration::from_secs(2))
            .expect("user_left must return while cancel hooks run");
        assert!(saw_session_gone.load(Ordering::SeqCst));
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_hook_may_reenter_engine_on_shutdown() {
        let transport = RecordingTransport::new();
        let engine = test_engine(transport.clone());

        engine.user_joined(UserId(1));
        let hook_engine = engine.clone();
        let hook_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&hook_ran);
        engine.attach_subscription(
            UserId(1),
            Subscription::new(move || {
                let _ = hook_engine.session_count();
                flag.store(true, Ordering::SeqCst);
            }),
        );

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = engine.clone();
        std::thread::spawn(move || {
            worker.shutdown();
            let _ = tx.send(());
        });

        rx.recv_timeout(Duration::from_secs(2))
            .expect("shutdown must return while cancel hooks run");
        assert!(hook_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_orphan_subscription_cancel_may_reenter_engine() {
        let transport = RecordingTransport::new();
        let engine = test_engine(transport.clone());

        let hook_engine = engine.clone();
        let hook_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&hook_ran);

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = engine.clone();
        std::thread::spawn(move || {
            // No session for user 7: the guard is cancelled immediately
            worker.attach_subscription(
                UserId(7),
                Subscription::new(move || {
                    let _ = hook_engine.has_session(UserId(7));
                    flag.store(true, Ordering::SeqCst);
                }),
            );
            let _ = tx.send(());
        });

        rx.recv_timeout(Duration::from_secs(2))
            .expect("attach_subscription must return while the cancel hook runs");
        assert!(hook_ran.load(Ordering::SeqCst));
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_clears() {
        let transport = RecordingTransport::new();
        let engine = test_engine(transport.clone());
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);

        engine.user_joined(UserId(1));
        engine.attach_subscription(
            UserId(1),
            Subscription::new(move || flag.store(true, Ordering::SeqCst)),
        );
        engine.emit("s1", EventKind::Custom("mark".into()), json!({}));

        engine.shutdown();
        settle().await;

        assert!(!engine.is_initialized());
        assert!(cancelled.load(Ordering::SeqCst));
        assert_eq!(engine.session_count(), 0);
        // Final flush carried the queued events
        assert!(!transport.batches().is_empty());
    }

    #[tokio::test]
    async fn test_capture_after_shutdown_is_dropped() {
        let transport = RecordingTransport::new();
        let engine = test_engine(transport.clone());
        engine.shutdown();

        engine.emit("s1", EventKind::Custom("mark".into()), json!({}));
        engine.user_joined(UserId(1));
        engine.set_phase(UserId(1), "lobby");
        engine.flush();
        settle().await;

        assert_eq!(engine.perf_stats().events_captured, 0);
        assert!(transport.batches().is_empty());
        assert!(!engine.has_session(UserId(1)));
    }

    #[tokio::test]
    async fn test_double_shutdown_is_safe() {
        let transport = RecordingTransport::new();
        let engine = test_engine(transport);
        engine.shutdown();
        engine.shutdown();
        assert!(!engine.is_initialized());
    }
}
