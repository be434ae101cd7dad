//! Event types delivered to long-poll clients.

use crate::ids::{RoomId, UserId};
use crate::token::StreamToken;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique event identifier.
pub type EventId = u64;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Generate a unique event ID.
#[must_use]
pub fn generate_event_id() -> EventId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    timestamp.wrapping_add(counter)
}

/// A single event as produced by an event source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub event_id: EventId,
    /// Event type, e.g. `m.room.message`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Room the event belongs to. `None` for user-level events such as presence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    /// User that caused the event.
    pub sender: UserId,
    /// Event body.
    pub content: serde_json::Value,
    /// Position of the event within its source's stream.
    pub stream_position: u64,
    /// Creation time in milliseconds since the Unix epoch.
    pub origin_server_ts: u64,
}

impl Event {
    /// Create a new event.
    #[must_use]
    pub fn new(kind: impl Into<String>, sender: impl Into<UserId>, content: serde_json::Value) -> Self {
        Self {
            event_id: generate_event_id(),
            kind: kind.into(),
            room_id: None,
            sender: sender.into(),
            content,
            stream_position: 0,
            origin_server_ts: now_millis(),
        }
    }

    /// Attach the event to a room.
    #[must_use]
    pub fn in_room(mut self, room_id: impl Into<RoomId>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    /// Set the stream position.
    #[must_use]
    pub fn at_position(mut self, position: u64) -> Self {
        self.stream_position = position;
        self
    }
}

/// The result of a long-poll: the events found and the cursor range they cover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    /// Events, in source order.
    pub chunk: Vec<Event>,
    /// Cursor the request started from.
    pub start: StreamToken,
    /// Cursor to pass as `from` on the next request.
    pub end: StreamToken,
}

impl EventBatch {
    /// Create a batch.
    #[must_use]
    pub fn new(chunk: Vec<Event>, start: StreamToken, end: StreamToken) -> Self {
        Self { chunk, start, end }
    }

    /// A batch with no events where `start == end == token`.
    #[must_use]
    pub fn empty(token: StreamToken) -> Self {
        Self {
            chunk: Vec::new(),
            start: token.clone(),
            end: token,
        }
    }

    /// Check if the batch carries no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_creation() {
        let event = Event::new("m.room.message", "@alice:test", json!({"body": "hi"}))
            .in_room("!room:test")
            .at_position(4);

        assert_eq!(event.kind, "m.room.message");
        assert_eq!(event.room_id, Some(RoomId::new("!room:test")));
        assert_eq!(event.stream_position, 4);
    }

    #[test]
    fn test_unique_event_ids() {
        let id1 = generate_event_id();
        let id2 = generate_event_id();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_event_wire_format() {
        let event = Event::new("m.presence", "@bob:test", json!({"presence": "online"}));
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "m.presence");
        assert!(value.get("room_id").is_none());
    }

    #[test]
    fn test_empty_batch() {
        let token = StreamToken::new().advance("room", 3);
        let batch = EventBatch::empty(token.clone());

        assert!(batch.is_empty());
        assert_eq!(batch.start, token);
        assert_eq!(batch.end, token);
    }
}
