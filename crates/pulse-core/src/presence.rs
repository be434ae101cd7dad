//! Presence tracking.
//!
//! Presence records whether each user is online and lets other users in the
//! same rooms see changes to it. Every change takes the next position in the
//! presence stream.

use crate::event::{now_millis, Event};
use crate::ids::UserId;
use crate::source::{EventSource, SourceError, SourceResult, PRESENCE_SOURCE};
use crate::timeline::RoomTimeline;
use crate::token::StreamToken;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Presence event type.
pub const PRESENCE_EVENT: &str = "m.presence";

/// Whether a user is around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Actively using a client.
    Online,
    /// Connected but idle or away.
    Unavailable,
    /// Not connected.
    Offline,
}

/// Presence state for a single user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceState {
    /// The user.
    pub user_id: UserId,
    /// Current status.
    pub presence: PresenceStatus,
    /// Optional free-text status.
    pub status_msg: Option<String>,
    /// Last activity timestamp.
    pub last_active_ts: u64,
    /// Presence stream position of the latest change.
    pub stream_position: u64,
}

impl PresenceState {
    /// Check if this presence is stale (no activity for the given duration).
    #[must_use]
    pub fn is_stale(&self, timeout: Duration) -> bool {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        now_millis().saturating_sub(self.last_active_ts) > timeout_ms
    }

    fn to_event(&self) -> Event {
        Event::new(
            PRESENCE_EVENT,
            self.user_id.clone(),
            json!({
                "presence": self.presence,
                "status_msg": self.status_msg,
                "last_active_ago": now_millis().saturating_sub(self.last_active_ts),
            }),
        )
        .at_position(self.stream_position)
    }
}

#[derive(Debug, Default)]
struct Presence {
    members: HashMap<UserId, PresenceState>,
    position: u64,
}

impl Presence {
    fn record(&mut self, user: &UserId, presence: PresenceStatus, status_msg: Option<String>, last_active_ts: u64) -> u64 {
        self.position += 1;
        self.members.insert(
            user.clone(),
            PresenceState {
                user_id: user.clone(),
                presence,
                status_msg,
                last_active_ts,
                stream_position: self.position,
            },
        );
        self.position
    }
}

/// Presence for every known user.
///
/// Visibility follows room membership: a user sees presence of everybody they
/// share a room with, and their own.
#[derive(Debug)]
pub struct PresenceTracker {
    inner: RwLock<Presence>,
    timeline: Arc<RoomTimeline>,
}

impl PresenceTracker {
    /// Create a tracker that resolves visibility through `timeline`.
    #[must_use]
    pub fn new(timeline: Arc<RoomTimeline>) -> Self {
        Self {
            inner: RwLock::new(Presence::default()),
            timeline,
        }
    }

    /// Set a user's presence.
    ///
    /// Returns the stream position of the change.
    pub fn set_presence(&self, user: &UserId, presence: PresenceStatus, status_msg: Option<String>) -> u64 {
        let position = self.inner.write().record(user, presence, status_msg, now_millis());
        debug!(user = %user, ?presence, position, "Presence changed");
        position
    }

    /// Get the presence state for a user.
    #[must_use]
    pub fn get(&self, user: &UserId) -> Option<PresenceState> {
        self.inner.read().members.get(user).cloned()
    }

    /// Number of users with recorded presence.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().members.len()
    }

    /// Mark users with no activity for `timeout` as offline.
    ///
    /// Returns the users that changed.
    pub fn prune_stale(&self, timeout: Duration) -> Vec<UserId> {
        let mut inner = self.inner.write();
        let stale: Vec<(UserId, u64)> = inner
            .members
            .values()
            .filter(|state| state.presence != PresenceStatus::Offline && state.is_stale(timeout))
            .map(|state| (state.user_id.clone(), state.last_active_ts))
            .collect();

        for (user, last_active_ts) in &stale {
            inner.record(user, PresenceStatus::Offline, None, *last_active_ts);
            debug!(user = %user, "Presence: marked stale user offline");
        }

        stale.into_iter().map(|(user, _)| user).collect()
    }

    /// Current presence stream position.
    #[must_use]
    pub fn current_position(&self) -> u64 {
        self.inner.read().position
    }
}

#[async_trait]
impl EventSource for PresenceTracker {
    fn name(&self) -> &'static str {
        PRESENCE_SOURCE
    }

    async fn get_new_events_for_user(
        &self,
        user: &UserId,
        from: &StreamToken,
        limit: usize,
    ) -> SourceResult {
        if limit == 0 {
            return Ok((Vec::new(), from.clone()));
        }

        let visible = self.timeline.visible_users(user);
        let after = from.position(PRESENCE_SOURCE);
        let inner = self.inner.read();

        let mut changed: Vec<&PresenceState> = inner
            .members
            .values()
            .filter(|state| state.stream_position > after && visible.contains(&state.user_id))
            .collect();
        changed.sort_by_key(|state| state.stream_position);
        changed.truncate(limit);

        let end = match changed.last() {
            Some(last) if changed.len() == limit => last.stream_position,
            _ => inner.position,
        };
        let events = changed.into_iter().map(PresenceState::to_event).collect();

        Ok((events, from.advance(PRESENCE_SOURCE, end)))
    }

    async fn current_position(&self) -> Result<u64, SourceError> {
        Ok(PresenceTracker::current_position(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RoomId;

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    fn setup() -> (Arc<RoomTimeline>, PresenceTracker) {
        let timeline = Arc::new(RoomTimeline::new());
        let tracker = PresenceTracker::new(timeline.clone());
        (timeline, tracker)
    }

    #[test]
    fn test_set_and_get() {
        let (_timeline, tracker) = setup();

        assert_eq!(tracker.set_presence(&user("@alice:test"), PresenceStatus::Online, None), 1);
        assert_eq!(
            tracker.set_presence(&user("@alice:test"), PresenceStatus::Unavailable, Some("lunch".into())),
            2
        );

        let state = tracker.get(&user("@alice:test")).unwrap();
        assert_eq!(state.presence, PresenceStatus::Unavailable);
        assert_eq!(state.status_msg.as_deref(), Some("lunch"));
        assert_eq!(state.stream_position, 2);
        assert_eq!(tracker.count(), 1);
        assert!(tracker.get(&user("@bob:test")).is_none());
    }

    #[test]
    fn test_huge_timeout_is_never_stale() {
        let state = PresenceState {
            user_id: user("@alice:test"),
            presence: PresenceStatus::Online,
            status_msg: None,
            last_active_ts: now_millis() - 10_000,
            stream_position: 1,
        };

        // 2^64 + 384 milliseconds: must not wrap around to 384ms.
        let huge = Duration::from_secs(18_446_744_073_709_552);
        assert!(!state.is_stale(huge));
        assert!(!state.is_stale(Duration::MAX));
        assert!(state.is_stale(Duration::from_secs(1)));
    }

    #[test]
    fn test_prune_stale() {
        let (_timeline, tracker) = setup();
        tracker.set_presence(&user("@alice:test"), PresenceStatus::Online, None);

        assert!(tracker.prune_stale(Duration::from_secs(3600)).is_empty());

        tracker.inner.write().members.get_mut(&user("@alice:test")).unwrap().last_active_ts = 0;
        assert_eq!(tracker.prune_stale(Duration::from_secs(1)), vec![user("@alice:test")]);
        assert_eq!(tracker.get(&user("@alice:test")).unwrap().presence, PresenceStatus::Offline);

        // Already offline users are left alone.
        assert!(tracker.prune_stale(Duration::from_secs(1)).is_empty());
    }

    #[tokio::test]
    async fn test_presence_visible_through_shared_rooms() {
        let (timeline, tracker) = setup();
        let room = RoomId::new("!r:test");
        timeline.join(&room, &user("@alice:test"));
        timeline.join(&room, &user("@bob:test"));

        tracker.set_presence(&user("@bob:test"), PresenceStatus::Online, None);
        tracker.set_presence(&user("@carol:test"), PresenceStatus::Online, None);

        let (events, end) = tracker
            .get_new_events_for_user(&user("@alice:test"), &StreamToken::new(), 10)
            .await
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sender, user("@bob:test"));
        assert_eq!(events[0].kind, PRESENCE_EVENT);
        assert_eq!(events[0].content["presence"], "online");
        assert_eq!(end.position(PRESENCE_SOURCE), 2);
    }

    #[tokio::test]
    async fn test_only_latest_change_after_cursor() {
        let (_timeline, tracker) = setup();
        tracker.set_presence(&user("@alice:test"), PresenceStatus::Online, None);
        let from = StreamToken::new().advance(PRESENCE_SOURCE, 1);
        tracker.set_presence(&user("@alice:test"), PresenceStatus::Offline, None);

        let (events, end) = tracker
            .get_new_events_for_user(&user("@alice:test"), &from, 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content["presence"], "offline");
        assert_eq!(end.position(PRESENCE_SOURCE), 2);

        let (none, same) = tracker
            .get_new_events_for_user(&user("@alice:test"), &end, 10)
            .await
            .unwrap();
        assert!(none.is_empty());
        assert_eq!(same, end);
    }
}
