//! Event source abstraction.
//!
//! An event source answers one question for one category of events: "what is
//! new for this user since this cursor?". The notifier queries every source when
//! a long-poll starts and one specific source when it is woken.

use crate::event::Event;
use crate::ids::UserId;
use crate::token::StreamToken;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Name of the room timeline source.
pub const ROOM_SOURCE: &str = "room";

/// Name of the presence source.
pub const PRESENCE_SOURCE: &str = "presence";

/// Event source errors.
///
/// "Nothing new" is never an error; sources return an empty event list for it.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The backing store cannot be reached.
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// New events for a user plus the advanced cursor.
pub type SourceResult = Result<(Vec<Event>, StreamToken), SourceError>;

/// A category-specific provider of new events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Source name. This is also the token component the source owns.
    fn name(&self) -> &'static str;

    /// Get events for `user` after `from`, at most `limit` of them.
    ///
    /// The returned token must not be behind `from`. Only the component
    /// owned by this source may change.
    async fn get_new_events_for_user(
        &self,
        user: &UserId,
        from: &StreamToken,
        limit: usize,
    ) -> SourceResult;

    /// Current head position of this source.
    async fn current_position(&self) -> Result<u64, SourceError>;
}

/// The ordered set of event sources.
///
/// Iteration order is registration order and never changes, which keeps the
/// cursor chaining of the initial check deterministic.
#[derive(Default, Clone)]
pub struct EventSources {
    sources: Vec<Arc<dyn EventSource>>,
}

impl EventSources {
    /// Create an empty set of sources.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source.
    ///
    /// A source with the same name is replaced in place, keeping its slot in
    /// the iteration order.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn EventSource>) -> Self {
        match self.sources.iter().position(|s| s.name() == source.name()) {
            Some(idx) => self.sources[idx] = source,
            None => self.sources.push(source),
        }
        self
    }

    /// Look up a source by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn EventSource>> {
        self.sources.iter().find(|s| s.name() == name)
    }

    /// Iterate over the sources in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn EventSource>> {
        self.sources.iter()
    }

    /// Number of registered sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Check if no sources are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Get the token for "now" across every source.
    ///
    /// # Errors
    ///
    /// Returns the first source error encountered.
    pub async fn get_current_token(&self) -> Result<StreamToken, SourceError> {
        let mut token = StreamToken::new();
        for source in &self.sources {
            let position = source.current_position().await?;
            token = token.advance(source.name(), position);
        }
        Ok(token)
    }
}

impl fmt::Debug for EventSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.sources.iter().map(|s| s.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource {
        name: &'static str,
        position: u64,
    }

    #[async_trait]
    impl EventSource for FixedSource {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn get_new_events_for_user(
            &self,
            _user: &UserId,
            from: &StreamToken,
            _limit: usize,
        ) -> SourceResult {
            Ok((Vec::new(), from.advance(self.name, self.position)))
        }

        async fn current_position(&self) -> Result<u64, SourceError> {
            Ok(self.position)
        }
    }

    fn fixed(name: &'static str, position: u64) -> Arc<dyn EventSource> {
        Arc::new(FixedSource { name, position })
    }

    #[test]
    fn test_registration_order_is_stable() {
        let sources = EventSources::new()
            .with_source(fixed(ROOM_SOURCE, 1))
            .with_source(fixed(PRESENCE_SOURCE, 2))
            .with_source(fixed(ROOM_SOURCE, 9));

        let names: Vec<_> = sources.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec![ROOM_SOURCE, PRESENCE_SOURCE]);
        assert_eq!(sources.len(), 2);
        assert!(sources.get("typing").is_none());
    }

    #[tokio::test]
    async fn test_current_token() {
        let sources = EventSources::new()
            .with_source(fixed(ROOM_SOURCE, 4))
            .with_source(fixed(PRESENCE_SOURCE, 2));

        let token = sources.get_current_token().await.unwrap();
        assert_eq!(token.position(ROOM_SOURCE), 4);
        assert_eq!(token.position(PRESENCE_SOURCE), 2);
    }
}
