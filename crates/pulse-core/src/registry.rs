//! Listener indices.
//!
//! The registry keeps two fan-out indices over pending listeners, one keyed by
//! room and one keyed by user, plus an identity-keyed table of the listeners
//! themselves. All three live behind one lock, so inserting, snapshotting and
//! purging a listener are atomic with respect to each other.
//!
//! A listener is only registered after its initial check, so anything that
//! touches the indices while a check is in flight bumps a sequence number.
//! Dispatches tell a late registration to check again; room joins are
//! recorded and applied to it directly.

use crate::event::{Event, EventBatch};
use crate::ids::{RoomId, UserId};
use crate::listener::{Listener, ListenerId, ListenerResult};
use crate::notifier::NotifierError;
use crate::token::StreamToken;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

/// A registered listener and every room key it has been indexed under.
struct Entry {
    listener: Arc<Listener>,
    rooms: HashSet<RoomId>,
}

/// A room join seen while at least one initial check was in flight.
struct Join {
    sequence: u64,
    user: UserId,
    room: RoomId,
}

#[derive(Default)]
struct Indices {
    listeners: HashMap<ListenerId, Entry>,
    rooms_to_listeners: HashMap<RoomId, HashSet<ListenerId>>,
    user_to_listeners: HashMap<UserId, HashSet<ListenerId>>,
    /// Bumped on every dispatch snapshot and every join.
    sequence: u64,
    last_snapshot: u64,
    /// Initial checks in flight, keyed by the sequence they started at.
    checking: BTreeMap<u64, usize>,
    joins: Vec<Join>,
    registered_total: u64,
}

impl Indices {
    fn collect<K: Eq + Hash>(
        index: &HashMap<K, HashSet<ListenerId>>,
        key: &K,
        into: &mut HashSet<ListenerId>,
    ) {
        if let Some(ids) = index.get(key) {
            into.extend(ids.iter().copied());
        }
    }

    fn discard<K: Eq + Hash>(index: &mut HashMap<K, HashSet<ListenerId>>, key: &K, id: ListenerId) {
        if let Some(ids) = index.get_mut(key) {
            ids.remove(&id);
            if ids.is_empty() {
                index.remove(key);
            }
        }
    }

    fn purge(&mut self, id: ListenerId) -> bool {
        let Some(entry) = self.listeners.remove(&id) else {
            return false;
        };
        for room in &entry.rooms {
            Self::discard(&mut self.rooms_to_listeners, room, id);
        }
        Self::discard(&mut self.user_to_listeners, entry.listener.user(), id);
        true
    }
}

/// The room and user indices over pending listeners.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Indices>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current sequence. Pass it to [`Registry::register`] later to learn
    /// whether a dispatch happened in between.
    #[must_use]
    pub fn wake_sequence(&self) -> u64 {
        self.inner.lock().sequence
    }

    /// Start an initial check.
    ///
    /// Until the returned guard drops, joins are kept so that
    /// [`Registry::register`] with [`CheckGuard::seen`] can apply the ones it
    /// missed.
    pub fn begin_check(&self) -> CheckGuard<'_> {
        let mut inner = self.inner.lock();
        let seen = inner.sequence;
        *inner.checking.entry(seen).or_default() += 1;
        CheckGuard {
            registry: self,
            seen,
        }
    }

    fn end_check(&self, seen: u64) {
        let mut inner = self.inner.lock();
        let remaining = inner.checking.get_mut(&seen).map(|count| {
            *count -= 1;
            *count
        });
        if remaining == Some(0) {
            inner.checking.remove(&seen);
        }

        // Joins at or before the oldest check in flight are visible to it
        // through the indices already.
        match inner.checking.keys().next().copied() {
            Some(oldest) => inner.joins.retain(|join| join.sequence > oldest),
            None => inner.joins.clear(),
        }
    }

    /// Index a listener under each of its rooms and under its user, plus every
    /// room its user joined after `seen_sequence`.
    ///
    /// Returns `true` if a dispatch snapshot was taken after `seen_sequence`,
    /// meaning that dispatch could not have seen this listener. Registering a
    /// resolved or already registered listener does nothing.
    pub fn register(&self, listener: &Arc<Listener>, seen_sequence: u64) -> bool {
        let mut inner = self.inner.lock();
        let missed = inner.last_snapshot > seen_sequence;

        if listener.is_resolved() || inner.listeners.contains_key(&listener.id()) {
            return missed;
        }

        let id = listener.id();
        let mut rooms: HashSet<RoomId> = listener.rooms().iter().cloned().collect();
        rooms.extend(
            inner
                .joins
                .iter()
                .filter(|join| join.sequence > seen_sequence && &join.user == listener.user())
                .map(|join| join.room.clone()),
        );
        for room in &rooms {
            inner
                .rooms_to_listeners
                .entry(room.clone())
                .or_default()
                .insert(id);
        }
        inner
            .user_to_listeners
            .entry(listener.user().clone())
            .or_default()
            .insert(id);
        inner.listeners.insert(
            id,
            Entry {
                listener: Arc::clone(listener),
                rooms,
            },
        );
        inner.registered_total += 1;

        debug!(
            listener = %id,
            user = %listener.user(),
            rooms = listener.rooms().len(),
            missed,
            "Registered listener"
        );

        missed
    }

    /// Copy out the union of the listeners indexed under `rooms` and `users`.
    ///
    /// The copy is what dispatch iterates over, so resolving listeners while
    /// walking it never disturbs the indices being read.
    #[must_use]
    pub fn snapshot(&self, rooms: &[RoomId], users: &[UserId]) -> Vec<Arc<Listener>> {
        let mut inner = self.inner.lock();
        inner.sequence += 1;
        inner.last_snapshot = inner.sequence;

        let mut ids = HashSet::new();
        for room in rooms {
            Indices::collect(&inner.rooms_to_listeners, room, &mut ids);
        }
        for user in users {
            Indices::collect(&inner.user_to_listeners, user, &mut ids);
        }

        ids.into_iter()
            .filter_map(|id| inner.listeners.get(&id))
            .map(|entry| Arc::clone(&entry.listener))
            .collect()
    }

    /// Make every listener of `user` reachable through `room` as well.
    ///
    /// Listeners still in their initial check pick the room up when they
    /// register. Returns the number of registered listeners merged.
    pub fn user_joined_room(&self, user: &UserId, room: &RoomId) -> usize {
        let mut inner = self.inner.lock();
        inner.sequence += 1;
        if !inner.checking.is_empty() {
            let sequence = inner.sequence;
            inner.joins.push(Join {
                sequence,
                user: user.clone(),
                room: room.clone(),
            });
        }

        let Indices {
            listeners,
            rooms_to_listeners,
            user_to_listeners,
            ..
        } = &mut *inner;

        let Some(ids) = user_to_listeners.get(user) else {
            return 0;
        };

        let room_set = rooms_to_listeners.entry(room.clone()).or_default();
        for id in ids {
            room_set.insert(*id);
            if let Some(entry) = listeners.get_mut(id) {
                entry.rooms.insert(room.clone());
            }
        }

        debug!(user = %user, room = %room, merged = ids.len(), "Merged listeners into room");
        ids.len()
    }

    /// Resolve a listener with events.
    ///
    /// The first resolution of a listener wins: it removes the listener from
    /// every index and delivers the batch. Later calls return `false` and
    /// change nothing.
    pub fn resolve(
        &self,
        listener: &Listener,
        events: Vec<Event>,
        start: StreamToken,
        end: StreamToken,
    ) -> bool {
        self.settle(listener, Ok(EventBatch::new(events, start, end)))
    }

    /// Resolve a listener with an empty batch at its starting cursor.
    pub fn expire(&self, listener: &Listener) -> bool {
        self.settle(listener, Ok(EventBatch::empty(listener.from_token().clone())))
    }

    /// Resolve a listener with an error.
    pub fn fail(&self, listener: &Listener, error: NotifierError) -> bool {
        self.settle(listener, Err(error))
    }

    fn settle(&self, listener: &Listener, result: ListenerResult) -> bool {
        let sender = {
            let mut inner = self.inner.lock();
            let Some(sender) = listener.settle() else {
                return false;
            };
            inner.purge(listener.id());
            sender
        };

        debug!(
            listener = %listener.id(),
            user = %listener.user(),
            events = result.as_ref().map(|b| b.chunk.len()).unwrap_or(0),
            failed = result.is_err(),
            "Resolved listener"
        );

        // The caller may have gone away; the listener is resolved either way.
        let _ = sender.send(result);
        true
    }

    /// Check if a listener is currently indexed.
    #[must_use]
    pub fn contains(&self, id: ListenerId) -> bool {
        self.inner.lock().listeners.contains_key(&id)
    }

    /// Number of listeners indexed under a room.
    #[must_use]
    pub fn room_listener_count(&self, room: &RoomId) -> usize {
        self.inner
            .lock()
            .rooms_to_listeners
            .get(room)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Number of listeners indexed under a user.
    #[must_use]
    pub fn user_listener_count(&self, user: &UserId) -> usize {
        self.inner
            .lock()
            .user_to_listeners
            .get(user)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock();
        RegistryStats {
            pending_listeners: inner.listeners.len(),
            indexed_rooms: inner.rooms_to_listeners.len(),
            indexed_users: inner.user_to_listeners.len(),
            registered_total: inner.registered_total,
            recorded_joins: inner.joins.len(),
        }
    }
}

/// An initial check in flight. Dropping it lets the registry forget joins no
/// remaining check needs.
#[must_use]
pub struct CheckGuard<'a> {
    registry: &'a Registry,
    seen: u64,
}

impl CheckGuard<'_> {
    /// The sequence the check started at.
    pub fn seen(&self) -> u64 {
        self.seen
    }
}

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.registry.end_check(self.seen);
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Listeners currently waiting.
    pub pending_listeners: usize,
    /// Rooms with at least one waiting listener.
    pub indexed_rooms: usize,
    /// Users with at least one waiting listener.
    pub indexed_users: usize,
    /// Listeners ever registered.
    pub registered_total: u64,
    /// Joins kept for listeners still in their initial check.
    pub recorded_joins: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn listener(user: &str, rooms: &[&str]) -> (Arc<Listener>, oneshot::Receiver<ListenerResult>) {
        let (listener, rx) = Listener::new(
            UserId::new(user),
            rooms.iter().map(|r| RoomId::new(*r)).collect(),
            StreamToken::new().advance("room", 1),
            10,
            Duration::from_secs(30),
        );
        (Arc::new(listener), rx)
    }

    fn event(room: &str) -> Event {
        Event::new("m.room.message", "@bob:test", json!({})).in_room(room)
    }

    #[test]
    fn test_register_indexes_rooms_and_user() {
        let registry = Registry::new();
        let (l, _rx) = listener("@alice:test", &["!r1:test", "!r2:test"]);

        assert!(!registry.register(&l, registry.wake_sequence()));
        assert!(registry.contains(l.id()));
        assert_eq!(registry.room_listener_count(&RoomId::new("!r1:test")), 1);
        assert_eq!(registry.room_listener_count(&RoomId::new("!r2:test")), 1);
        assert_eq!(registry.user_listener_count(&UserId::new("@alice:test")), 1);

        // Registering twice is a no-op.
        registry.register(&l, registry.wake_sequence());
        assert_eq!(registry.stats().registered_total, 1);
    }

    #[test]
    fn test_missing_keys_are_empty() {
        let registry = Registry::new();
        assert!(registry
            .snapshot(&[RoomId::new("!none:test")], &[UserId::new("@none:test")])
            .is_empty());
        assert_eq!(registry.user_joined_room(&UserId::new("@none:test"), &RoomId::new("!r:test")), 0);
        assert_eq!(registry.room_listener_count(&RoomId::new("!r:test")), 0);
    }

    #[test]
    fn test_snapshot_is_a_deduplicated_union() {
        let registry = Registry::new();
        let (a, _rx_a) = listener("@alice:test", &["!r1:test"]);
        let (b, _rx_b) = listener("@bob:test", &[]);
        registry.register(&a, 0);
        registry.register(&b, 0);

        let candidates = registry.snapshot(
            &[RoomId::new("!r1:test")],
            &[UserId::new("@alice:test"), UserId::new("@bob:test")],
        );
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn test_resolve_purges_every_index() {
        let registry = Registry::new();
        let (l, mut rx) = listener("@alice:test", &["!r1:test"]);
        registry.register(&l, 0);

        let end = StreamToken::new().advance("room", 2);
        assert!(registry.resolve(&l, vec![event("!r1:test")], l.from_token().clone(), end.clone()));

        let stats = registry.stats();
        assert_eq!(stats.pending_listeners, 0);
        assert_eq!(stats.indexed_rooms, 0);
        assert_eq!(stats.indexed_users, 0);

        let batch = rx.try_recv().unwrap().unwrap();
        assert_eq!(batch.chunk.len(), 1);
        assert_eq!(batch.end, end);
    }

    #[test]
    fn test_second_resolution_is_a_no_op() {
        let registry = Registry::new();
        let (l, mut rx) = listener("@alice:test", &["!r1:test"]);
        registry.register(&l, 0);

        // Event wake and deadline land back to back: only the first counts.
        assert!(registry.resolve(
            &l,
            vec![event("!r1:test")],
            l.from_token().clone(),
            StreamToken::new().advance("room", 5)
        ));
        assert!(!registry.expire(&l));
        assert!(!registry.fail(&l, NotifierError::Cancelled));

        let batch = rx.try_recv().unwrap().unwrap();
        assert_eq!(batch.chunk.len(), 1);
    }

    #[test]
    fn test_expire_reuses_from_token() {
        let registry = Registry::new();
        let (l, mut rx) = listener("@alice:test", &[]);
        registry.register(&l, 0);

        assert!(registry.expire(&l));
        let batch = rx.try_recv().unwrap().unwrap();
        assert!(batch.is_empty());
        assert_eq!(&batch.start, l.from_token());
        assert_eq!(&batch.end, l.from_token());
    }

    #[test]
    fn test_joined_room_is_purged_on_resolution() {
        let registry = Registry::new();
        let (l, _rx) = listener("@alice:test", &[]);
        registry.register(&l, 0);

        let room = RoomId::new("!joined:test");
        assert_eq!(registry.user_joined_room(&UserId::new("@alice:test"), &room), 1);
        assert_eq!(registry.snapshot(&[room.clone()], &[]).len(), 1);

        registry.expire(&l);
        assert_eq!(registry.room_listener_count(&room), 0);
        assert_eq!(registry.stats().indexed_rooms, 0);
    }

    #[test]
    fn test_register_reports_missed_dispatch() {
        let registry = Registry::new();
        let (l, _rx) = listener("@alice:test", &["!r1:test"]);

        let seen = registry.wake_sequence();
        let _ = registry.snapshot(&[RoomId::new("!r1:test")], &[]);
        assert!(registry.register(&l, seen));
    }

    #[test]
    fn test_join_during_check_applies_at_registration() {
        let registry = Registry::new();
        let (l, _rx) = listener("@alice:test", &[]);
        let room = RoomId::new("!joined:test");

        let check = registry.begin_check();
        // Nothing registered yet to merge.
        assert_eq!(registry.user_joined_room(&UserId::new("@alice:test"), &room), 0);
        assert_eq!(registry.stats().recorded_joins, 1);

        assert!(!registry.register(&l, check.seen()));
        assert_eq!(registry.room_listener_count(&room), 1);
        drop(check);
        assert_eq!(registry.stats().recorded_joins, 0);

        registry.expire(&l);
        assert_eq!(registry.stats().indexed_rooms, 0);
    }

    #[test]
    fn test_joins_without_checks_are_not_recorded() {
        let registry = Registry::new();
        registry.user_joined_room(&UserId::new("@alice:test"), &RoomId::new("!r1:test"));
        assert_eq!(registry.stats().recorded_joins, 0);
    }

    #[test]
    fn test_joins_are_kept_only_for_checks_that_missed_them() {
        let registry = Registry::new();
        let alice = UserId::new("@alice:test");
        let (r1, r2) = (RoomId::new("!r1:test"), RoomId::new("!r2:test"));

        let early = registry.begin_check();
        registry.user_joined_room(&alice, &r1);
        let late = registry.begin_check();
        drop(early);
        // The r1 join predates the remaining check.
        assert_eq!(registry.stats().recorded_joins, 0);

        registry.user_joined_room(&alice, &r2);
        let (l, _rx) = listener("@alice:test", &[]);
        registry.register(&l, late.seen());
        assert_eq!(registry.room_listener_count(&r1), 0);
        assert_eq!(registry.room_listener_count(&r2), 1);

        drop(late);
        assert_eq!(registry.stats().recorded_joins, 0);
    }

    #[test]
    fn test_join_does_not_count_as_missed_dispatch() {
        let registry = Registry::new();
        let check = registry.begin_check();
        registry.user_joined_room(&UserId::new("@alice:test"), &RoomId::new("!r1:test"));

        let (l, _rx) = listener("@alice:test", &[]);
        assert!(!registry.register(&l, check.seen()));
    }

    #[test]
    fn test_resolved_listener_is_not_registered() {
        let registry = Registry::new();
        let (l, _rx) = listener("@alice:test", &["!r1:test"]);
        registry.expire(&l);

        registry.register(&l, 0);
        assert!(!registry.contains(l.id()));
        assert_eq!(registry.stats().registered_total, 0);
    }
}
