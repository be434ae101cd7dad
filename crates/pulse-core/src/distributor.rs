//! Cross-cutting signals between subsystems.
//!
//! The distributor announces membership changes to whoever observes them.
//! Observers run synchronously inside [`Distributor::fire`], so by the time it
//! returns every observer has seen the signal.

use crate::ids::{RoomId, UserId};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;

/// A signal published on the distributor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// A user became a member of a room.
    UserJoinedRoom {
        /// The joining user.
        user: UserId,
        /// The joined room.
        room: RoomId,
    },
}

/// Receives distributor signals.
pub trait Observer: Send + Sync {
    /// Handle a signal.
    fn on_signal(&self, signal: &Signal);
}

/// Synchronous publish/subscribe hub.
#[derive(Default)]
pub struct Distributor {
    observers: RwLock<Vec<Arc<dyn Observer>>>,
}

impl Distributor {
    /// Create a distributor with no observers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Observers are notified in registration order.
    pub fn observe(&self, observer: Arc<dyn Observer>) {
        self.observers.write().push(observer);
    }

    /// Number of registered observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Deliver a signal to every observer.
    ///
    /// Returns the number of observers notified.
    pub fn fire(&self, signal: Signal) -> usize {
        let observers = self.observers.read().clone();
        trace!(?signal, observers = observers.len(), "Firing signal");

        for observer in &observers {
            observer.on_signal(&signal);
        }
        observers.len()
    }

    /// Announce that `user` joined `room`.
    pub fn user_joined_room(&self, user: UserId, room: RoomId) -> usize {
        self.fire(Signal::UserJoinedRoom { user, room })
    }
}
