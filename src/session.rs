//! Session registry — one record per concurrently-connected user.
//!
//! A [`Session`] is the bounded record of one user's connected lifetime,
//! identified by a locally unique token. The registry maps an opaque
//! [`UserId`] to its session; the id is a lookup key only — the host engine
//! owns the user's lifecycle and the registry merely reacts to it.
//!
//! Sessions own [`Subscription`] guards for detection hooks the host has
//! attached (movement polling, proximity triggers). Destroying a session
//! cancels every guard exactly once.

use crate::event::new_session_id;
use chrono::Utc;
use std::collections::HashMap;
use tracing::debug;

/// Opaque handle for a connected user, as issued by the host engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserId(pub u64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cancellable guard for a host-side detection hook.
///
/// The cancel callback runs exactly once: on explicit [`Subscription::cancel`]
/// or on drop, whichever comes first. Dropping a session therefore releases
/// every hook it owned.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap a cancel callback.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel the underlying hook now.
    pub fn cancel(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// Per-user session state.
#[derive(Debug)]
pub struct Session {
    /// Fresh random token, unique per join, never reused
    pub id: String,

    /// Unix time the session was created
    pub joined_at: i64,

    /// Monotonic: set once when the first meaningful input is observed
    pub first_input_seen: bool,

    /// Monotonic: set once on the first interaction
    pub first_interaction_seen: bool,

    /// Last phase set by the host application; overwritten in place
    pub current_phase: Option<String>,

    /// Detection guards owned by this session
    subscriptions: Vec<Subscription>,
}

impl Session {
    fn new() -> Self {
        Self {
            id: new_session_id(),
            joined_at: Utc::now().timestamp(),
            first_input_seen: false,
            first_interaction_seen: false,
            current_phase: None,
            subscriptions: Vec::new(),
        }
    }

    /// Hand this session ownership of a detection guard.
    pub fn attach(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    /// Seconds this session has been alive.
    pub fn duration_seconds(&self, now_unix: i64) -> i64 {
        (now_unix - self.joined_at).max(0)
    }
}

/// Mapping from user handle to live session.
///
/// Operations never block and never fail; `destroy` on an absent handle is
/// a no-op. Serial per-user call ordering is the host engine's guarantee.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<UserId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing session for `user`, or create one with a fresh
    /// identifier. The boolean is true when a session was created.
    pub fn get_or_create(&mut self, user: UserId) -> (&mut Session, bool) {
        let mut created = false;
        let session = self.sessions.entry(user).or_insert_with(|| {
            created = true;
            Session::new()
        });
        if created {
            debug!(user = %user, session_id = %session.id, "Session created");
        }
        (session, created)
    }

    /// Look up the session for `user`, if one exists.
    pub fn get_mut(&mut self, user: UserId) -> Option<&mut Session> {
        self.sessions.get_mut(&user)
    }

    /// Remove and return the session for `user`.
    ///
    /// The session's guards are cancelled when the returned value is
    /// dropped. Cancel callbacks are arbitrary host code, so callers must
    /// drop the session outside any lock the callbacks could re-enter.
    /// Absent handle: safe no-op, returns `None`.
    pub fn destroy(&mut self, user: UserId) -> Option<Session> {
        let session = self.sessions.remove(&user)?;
        debug!(user = %user, session_id = %session.id, "Session destroyed");
        Some(session)
    }

    /// True if a live session exists for `user`.
    pub fn contains(&self, user: UserId) -> bool {
        self.sessions.contains_key(&user)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove every session, returning them so the caller can drop them
    /// (and run their cancel callbacks) outside any lock.
    pub fn drain(&mut self) -> Vec<Session> {
        self.sessions.drain().map(|(_, session)| session).collect()
    }
}
