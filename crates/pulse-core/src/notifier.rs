//! The long-poll notifier.
//!
//! The notifier registers pending listeners, wakes them when new room or
//! presence events arrive, and resolves them empty when their deadline passes.
//! Whichever of wake and deadline comes first resolves the listener; the other
//! finds it already resolved and does nothing.

use crate::distributor::{Observer, Signal};
use crate::event::Event;
use crate::ids::{RoomId, UserId};
use crate::listener::{Listener, ListenerResult};
use crate::registry::{Registry, RegistryStats};
use crate::source::{EventSource, EventSources, SourceError, PRESENCE_SOURCE, ROOM_SOURCE};
use crate::token::StreamToken;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Default number of events returned per source.
pub const DEFAULT_LIMIT: usize = 10;

/// Notifier errors.
#[derive(Debug, Error)]
pub enum NotifierError {
    /// An event source query failed.
    #[error("Event source '{name}' failed: {error}")]
    Source {
        /// Name of the failing source.
        name: &'static str,
        /// The underlying error.
        #[source]
        error: SourceError,
    },

    /// Fetching the current token failed.
    #[error("Failed to get current token: {0}")]
    CurrentToken(#[source] SourceError),

    /// A required event source is not registered.
    #[error("Unknown event source: {0}")]
    UnknownSource(&'static str),

    /// The listener was dropped without being resolved.
    #[error("Listener cancelled")]
    Cancelled,
}

/// Where to start reading and how much to return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationConfig {
    /// Starting cursor. `None` means "now".
    #[serde(default)]
    pub from_token: Option<StreamToken>,
    /// Maximum number of events per source.
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

impl PaginationConfig {
    /// Create a pagination config.
    #[must_use]
    pub fn new(from_token: Option<StreamToken>, limit: usize) -> Self {
        Self { from_token, limit }
    }
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self::new(None, DEFAULT_LIMIT)
    }
}

/// Wakes pending long-poll listeners when events relevant to them arrive.
///
/// Cloning is cheap; clones share the same sources and indices.
#[derive(Clone)]
pub struct Notifier {
    sources: Arc<EventSources>,
    registry: Arc<Registry>,
}

impl Notifier {
    /// Create a notifier over the given event sources.
    #[must_use]
    pub fn new(sources: EventSources) -> Self {
        info!("Creating notifier with sources: {:?}", sources);
        Self {
            sources: Arc::new(sources),
            registry: Arc::new(Registry::new()),
        }
    }

    /// The event sources.
    #[must_use]
    pub fn sources(&self) -> &EventSources {
        &self.sources
    }

    /// The listener indices.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Wait for new events for `user` in `rooms`.
    ///
    /// Returns at once if any source already has events after the starting
    /// cursor, or if `timeout` is zero. Otherwise the request waits until an
    /// event wakes it or `timeout` passes, whichever is first. A timed out
    /// request returns no events with `start == end == from`.
    ///
    /// # Errors
    ///
    /// Returns an error if an event source fails during the initial check or
    /// while fetching the current token.
    pub async fn get_events_for(
        &self,
        user: UserId,
        rooms: Vec<RoomId>,
        pagination: PaginationConfig,
        timeout: Duration,
    ) -> ListenerResult {
        let from_token = match pagination.from_token {
            Some(token) => token,
            None => self
                .sources
                .get_current_token()
                .await
                .map_err(NotifierError::CurrentToken)?,
        };

        let (listener, receiver) = Listener::new(user, rooms, from_token, pagination.limit, timeout);
        let listener = Arc::new(listener);
        let check = self.registry.begin_check();

        match self.check_for_updates(&listener).await {
            Err(error) => {
                self.registry.fail(&listener, error);
            }
            Ok(()) if listener.is_resolved() => {}
            Ok(()) if timeout.is_zero() => {
                self.registry.expire(&listener);
            }
            Ok(()) => self.wait_for_events(&listener, check.seen()).await,
        }
        drop(check);

        receiver.await.unwrap_or(Err(NotifierError::Cancelled))
    }

    /// Index the listener and arm its deadline. Rooms its user joined during
    /// the initial check are indexed too.
    async fn wait_for_events(&self, listener: &Arc<Listener>, seen: u64) {
        let missed = self.registry.register(listener, seen);
        self.arm_deadline(listener);

        // A dispatch between the initial check and registration could not
        // reach this listener, so look once more.
        if missed {
            debug!(listener = %listener.id(), "Dispatch raced registration, checking again");
            if let Err(error) = self.check_for_updates(listener).await {
                self.registry.fail(listener, error);
            }
        }
    }

    fn arm_deadline(&self, listener: &Arc<Listener>) {
        let registry = Arc::clone(&self.registry);
        let weak = Arc::downgrade(listener);
        let timeout = listener.timeout();

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(listener) = weak.upgrade() {
                if registry.expire(&listener) {
                    debug!(listener = %listener.id(), "Listener timed out");
                }
            }
        });
        listener.arm_deadline(task.abort_handle());
    }

    /// Query every source in order, chaining the cursor from one to the next,
    /// and resolve the listener if anything turned up.
    async fn check_for_updates(&self, listener: &Listener) -> Result<(), NotifierError> {
        let mut events = Vec::new();
        let mut token = listener.from_token().clone();

        // TODO: a single multi-source query would save a round-trip per source.
        for source in self.sources.iter() {
            let (mut found, next) = source
                .get_new_events_for_user(listener.user(), &token, listener.limit())
                .await
                .map_err(|error| NotifierError::Source {
                    name: source.name(),
                    error,
                })?;

            trace!(
                listener = %listener.id(),
                source = source.name(),
                events = found.len(),
                from = %token,
                to = %next,
                "Checked source"
            );
            if matches!(next.partial_cmp(&token), None | Some(Ordering::Less)) {
                warn!(source = source.name(), from = %token, to = %next, "Source returned a token behind its input");
            }

            events.append(&mut found);
            token = next;
        }

        if !events.is_empty() {
            self.registry
                .resolve(listener, events, listener.from_token().clone(), token);
        }
        Ok(())
    }

    /// Wake listeners interested in a new room event.
    ///
    /// Candidates are the listeners of the event's room and of every user in
    /// `extra_users`. Each is resolved if the room source has events for it.
    /// Returns the number of listeners woken.
    ///
    /// # Errors
    ///
    /// Returns an error if the room source is missing or fails.
    pub async fn on_new_room_event(
        &self,
        event: &Event,
        extra_users: &[UserId],
    ) -> Result<usize, NotifierError> {
        let source = self.source(ROOM_SOURCE)?;
        let rooms: Vec<RoomId> = event.room_id.iter().cloned().collect();
        let candidates = self.registry.snapshot(&rooms, extra_users);

        debug!(
            room = ?event.room_id,
            kind = %event.kind,
            candidates = candidates.len(),
            "New room event"
        );

        self.wake(source, candidates).await
    }

    /// Wake listeners interested in a new user-level (presence) event.
    ///
    /// Candidates are the listeners of every user in `users` and every room in
    /// `rooms`. Returns the number of listeners woken.
    ///
    /// # Errors
    ///
    /// Returns an error if the presence source is missing or fails.
    pub async fn on_new_user_event(
        &self,
        users: &[UserId],
        rooms: &[RoomId],
    ) -> Result<usize, NotifierError> {
        let source = self.source(PRESENCE_SOURCE)?;
        let candidates = self.registry.snapshot(rooms, users);

        debug!(
            users = users.len(),
            rooms = rooms.len(),
            candidates = candidates.len(),
            "New user event"
        );

        self.wake(source, candidates).await
    }

    /// Make the pending listeners of `user` reachable through `room`.
    pub fn user_joined_room(&self, user: &UserId, room: &RoomId) -> usize {
        self.registry.user_joined_room(user, room)
    }

    fn source(&self, name: &'static str) -> Result<&Arc<dyn EventSource>, NotifierError> {
        self.sources
            .get(name)
            .ok_or(NotifierError::UnknownSource(name))
    }

    async fn wake(
        &self,
        source: &Arc<dyn EventSource>,
        candidates: Vec<Arc<Listener>>,
    ) -> Result<usize, NotifierError> {
        let mut woken = 0;

        for listener in candidates {
            // Resolved by an earlier wake or its deadline since the snapshot.
            if listener.is_resolved() {
                continue;
            }

            let (events, end) = source
                .get_new_events_for_user(listener.user(), listener.from_token(), listener.limit())
                .await
                .map_err(|error| NotifierError::Source {
                    name: source.name(),
                    error,
                })?;

            if !events.is_empty()
                && self
                    .registry
                    .resolve(&listener, events, listener.from_token().clone(), end)
            {
                woken += 1;
            }
        }

        Ok(woken)
    }
}

impl Observer for Notifier {
    fn on_signal(&self, signal: &Signal) {
        match signal {
            Signal::UserJoinedRoom { user, room } => {
                self.user_joined_room(user, room);
            }
        }
    }
}
