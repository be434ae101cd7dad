//! # pulse-core
//!
//! Long-poll change notification for the Pulse chat backend.
//!
//! Clients hold long-poll requests open until events relevant to them exist.
//! This crate decides which pending requests to wake and when:
//!
//! - **Notifier** - Registers listeners, wakes them on new events, expires them
//! - **Registry** - Room and user indices over pending listeners
//! - **Listener** - A pending request with a single-shot result
//! - **EventSource** - Per-category "what is new since this cursor" queries
//! - **Distributor** - Membership signals between subsystems
//! - **RoomTimeline** / **PresenceTracker** - In-memory event sources
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │  Long-poll  │────▶│  Notifier   │────▶│ EventSources │
//! └─────────────┘     └─────────────┘     └──────────────┘
//!                       │        ▲
//!                       ▼        │ user_joined_room
//!                 ┌──────────┐ ┌─────────────┐
//!                 │ Registry │ │ Distributor │
//!                 └──────────┘ └─────────────┘
//! ```

pub mod distributor;
pub mod event;
pub mod ids;
pub mod listener;
pub mod notifier;
pub mod presence;
pub mod registry;
pub mod source;
pub mod timeline;
pub mod token;

pub use distributor::{Distributor, Observer, Signal};
pub use event::{Event, EventBatch};
pub use ids::{IdError, RoomId, UserId};
pub use listener::{Listener, ListenerId, ListenerResult};
pub use notifier::{Notifier, NotifierError, PaginationConfig};
pub use presence::{PresenceState, PresenceStatus, PresenceTracker};
pub use registry::{CheckGuard, Registry, RegistryStats};
pub use source::{EventSource, EventSources, SourceError, PRESENCE_SOURCE, ROOM_SOURCE};
pub use timeline::{RoomTimeline, TimelineError};
pub use token::{StreamToken, TokenError};
