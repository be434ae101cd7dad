//! In-memory room timeline.
//!
//! Rooms share one append-only event log. Every appended event takes the next
//! stream position, which is what the `room` component of a
//! [`StreamToken`] counts.

use crate::event::Event;
use crate::ids::{RoomId, UserId};
use crate::source::{EventSource, SourceError, SourceResult, ROOM_SOURCE};
use crate::token::StreamToken;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, trace};

/// Membership event type.
pub const MEMBER_EVENT: &str = "m.room.member";

/// Timeline errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimelineError {
    /// The user is not a member of the room.
    #[error("{user} is not joined to {room}")]
    NotJoined {
        /// The user.
        user: UserId,
        /// The room.
        room: RoomId,
    },
}

/// Room events and membership.
#[derive(Debug, Default)]
pub struct RoomTimeline {
    /// Event log. The event at index `i` has stream position `i + 1`.
    log: RwLock<Vec<Event>>,
    /// Room members.
    members: DashMap<RoomId, HashSet<UserId>>,
    /// Rooms per user.
    memberships: DashMap<UserId, HashSet<RoomId>>,
}

impl RoomTimeline {
    /// Create an empty timeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&self, event: Event) -> Event {
        let mut log = self.log.write();
        let event = event.at_position(log.len() as u64 + 1);
        log.push(event.clone());
        trace!(room = ?event.room_id, position = event.stream_position, "Appended event");
        event
    }

    /// Join a user to a room.
    ///
    /// Returns the membership event, or `None` if the user was already joined.
    pub fn join(&self, room: &RoomId, user: &UserId) -> Option<Event> {
        let inserted = self
            .members
            .entry(room.clone())
            .or_default()
            .insert(user.clone());
        if !inserted {
            return None;
        }
        self.memberships
            .entry(user.clone())
            .or_default()
            .insert(room.clone());

        debug!(room = %room, user = %user, "User joined room");
        Some(self.append(
            Event::new(MEMBER_EVENT, user.clone(), json!({ "membership": "join" })).in_room(room.clone()),
        ))
    }

    /// Remove a user from a room.
    ///
    /// Returns the membership event, or `None` if the user was not joined.
    pub fn leave(&self, room: &RoomId, user: &UserId) -> Option<Event> {
        let removed = self
            .members
            .get_mut(room)
            .map(|mut members| members.remove(user))
            .unwrap_or(false);
        if !removed {
            return None;
        }

        // Drop empty entries.
        self.members.remove_if(room, |_, members| members.is_empty());
        if let Some(mut rooms) = self.memberships.get_mut(user) {
            rooms.remove(room);
        }
        self.memberships.remove_if(user, |_, rooms| rooms.is_empty());

        debug!(room = %room, user = %user, "User left room");
        Some(self.append(
            Event::new(MEMBER_EVENT, user.clone(), json!({ "membership": "leave" })).in_room(room.clone()),
        ))
    }

    /// Append an event sent by a room member.
    ///
    /// # Errors
    ///
    /// Returns an error if the sender is not joined to the room.
    pub fn send(
        &self,
        room: &RoomId,
        sender: &UserId,
        kind: impl Into<String>,
        content: serde_json::Value,
    ) -> Result<Event, TimelineError> {
        if !self.is_member(room, sender) {
            return Err(TimelineError::NotJoined {
                user: sender.clone(),
                room: room.clone(),
            });
        }
        Ok(self.append(Event::new(kind, sender.clone(), content).in_room(room.clone())))
    }

    /// Check if a user is joined to a room.
    #[must_use]
    pub fn is_member(&self, room: &RoomId, user: &UserId) -> bool {
        self.members
            .get(room)
            .map(|members| members.contains(user))
            .unwrap_or(false)
    }

    /// Rooms a user is joined to.
    #[must_use]
    pub fn rooms_for_user(&self, user: &UserId) -> Vec<RoomId> {
        self.memberships
            .get(user)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Members of a room.
    #[must_use]
    pub fn members(&self, room: &RoomId) -> Vec<UserId> {
        self.members
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Users sharing at least one room with `user`, including `user`.
    #[must_use]
    pub fn visible_users(&self, user: &UserId) -> HashSet<UserId> {
        let mut users: HashSet<UserId> = self
            .rooms_for_user(user)
            .iter()
            .flat_map(|room| self.members(room))
            .collect();
        users.insert(user.clone());
        users
    }

    /// Stream position of the newest event.
    #[must_use]
    pub fn current_position(&self) -> u64 {
        self.log.read().len() as u64
    }
}

#[async_trait]
impl EventSource for RoomTimeline {
    fn name(&self) -> &'static str {
        ROOM_SOURCE
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

        let rooms: HashSet<RoomId> = self.rooms_for_user(user).into_iter().collect();
        let log = self.log.read();
        let head = log.len() as u64;
        let after = usize::try_from(from.position(ROOM_SOURCE)).unwrap_or(usize::MAX);

        let events: Vec<Event> = log
            .iter()
            .skip(after)
            .filter(|event| event.room_id.as_ref().is_some_and(|room| rooms.contains(room)))
            .take(limit)
            .cloned()
            .collect();

        // Stop at the last returned event when truncated, so the rest is
        // picked up next time.
        let end = match events.last() {
            Some(last) if events.len() == limit => last.stream_position,
            _ => head,
        };

        Ok((events, from.advance(ROOM_SOURCE, end)))
    }

    async fn current_position(&self) -> Result<u64, SourceError> {
        Ok(RoomTimeline::current_position(self))
    }
}
