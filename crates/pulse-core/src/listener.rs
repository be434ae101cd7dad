//! Pending long-poll requests.
//!
//! A [`Listener`] lives from the moment a long-poll starts until it is
//! resolved, either with events or by its deadline. Resolution goes through a
//! single-shot cell: the first resolution takes the result sender out of the
//! listener and every later attempt finds nothing to take.

use crate::event::EventBatch;
use crate::ids::{RoomId, UserId};
use crate::notifier::NotifierError;
use crate::token::StreamToken;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// Outcome delivered to the waiting caller.
pub type ListenerResult = Result<EventBatch, NotifierError>;

static LISTENER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique listener identity, used as the key in the registry indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Allocate the next identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(LISTENER_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

enum ListenerState {
    Pending {
        sender: oneshot::Sender<ListenerResult>,
        deadline: Option<AbortHandle>,
    },
    Resolved,
}

/// A suspended long-poll request.
pub struct Listener {
    id: ListenerId,
    user: UserId,
    rooms: Vec<RoomId>,
    from_token: StreamToken,
    limit: usize,
    timeout: Duration,
    state: Mutex<ListenerState>,
}

impl Listener {
    /// Create a listener and the receiver its result will be delivered on.
    #[must_use]
    pub fn new(
        user: UserId,
        mut rooms: Vec<RoomId>,
        from_token: StreamToken,
        limit: usize,
        timeout: Duration,
    ) -> (Self, oneshot::Receiver<ListenerResult>) {
        rooms.sort();
        rooms.dedup();

        let (sender, receiver) = oneshot::channel();
        let listener = Self {
            id: ListenerId::next(),
            user,
            rooms,
            from_token,
            limit,
            timeout,
            state: Mutex::new(ListenerState::Pending {
                sender,
                deadline: None,
            }),
        };
        (listener, receiver)
    }

    /// Listener identity.
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// The requesting user.
    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Rooms the listener is directly interested in.
    #[must_use]
    pub fn rooms(&self) -> &[RoomId] {
        &self.rooms
    }

    /// Cursor the request started from.
    #[must_use]
    pub fn from_token(&self) -> &StreamToken {
        &self.from_token
    }

    /// Maximum number of events to return per source.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Maximum wait.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Check if the listener has been resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(*self.state.lock(), ListenerState::Resolved)
    }

    /// Attach the deadline task. A resolved listener aborts it immediately.
    pub(crate) fn arm_deadline(&self, handle: AbortHandle) {
        match &mut *self.state.lock() {
            ListenerState::Pending { deadline, .. } => *deadline = Some(handle),
            ListenerState::Resolved => handle.abort(),
        }
    }

    /// Move to `Resolved`, handing back the sender on the first call only.
    pub(crate) fn settle(&self) -> Option<oneshot::Sender<ListenerResult>> {
        let previous = std::mem::replace(&mut *self.state.lock(), ListenerState::Resolved);
        match previous {
            ListenerState::Pending { sender, deadline } => {
                if let Some(deadline) = deadline {
                    deadline.abort();
                }
                Some(sender)
            }
            ListenerState::Resolved => None,
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("rooms", &self.rooms)
            .field("from_token", &self.from_token)
            .field("limit", &self.limit)
            .field("timeout", &self.timeout)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
