//! HTTP handlers for the Pulse server.
//!
//! This module wires the in-memory event sources, the distributor and the
//! notifier together and exposes them over HTTP long-polling.

use crate::config::Config;
use crate::metrics::{self, LongPollMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tenvis_pulse_core::{
    Distributor, Event, EventBatch, EventSources, IdError, Notifier, NotifierError, PaginationConfig,
    PresenceStatus, PresenceTracker, RoomId, RoomTimeline, StreamToken, TimelineError,
    TokenError, UserId, PRESENCE_SOURCE, ROOM_SOURCE,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A user or room identifier was rejected.
    #[error("Invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// The `from` token could not be parsed.
    #[error("Invalid token: {0}")]
    InvalidToken(#[from] TokenError),

    /// The timeline refused the write.
    #[error(transparent)]
    Timeline(#[from] TimelineError),

    /// The notifier failed.
    #[error(transparent)]
    Notifier(#[from] NotifierError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidId(_) | Self::InvalidToken(_) => StatusCode::BAD_REQUEST,
            Self::Timeline(_) => StatusCode::FORBIDDEN,
            Self::Notifier(NotifierError::Source { .. } | NotifierError::CurrentToken(_)) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Notifier(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InvalidId(_) => "M_INVALID_PARAM",
            Self::InvalidToken(_) => "M_INVALID_TOKEN",
            Self::Timeline(_) => "M_FORBIDDEN",
            Self::Notifier(_) => "M_UNKNOWN",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            metrics::record_error("api");
            error!(error = %self, "Request failed");
        }
        let body = serde_json::json!({
            "errcode": self.code(),
            "error": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Query parameters of `GET /events`.
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Requesting user.
    pub user_id: String,
    /// Starting token; absent means "now".
    pub from: Option<String>,
    /// Events per source.
    pub limit: Option<usize>,
    /// Wait in milliseconds.
    pub timeout: Option<u64>,
}

/// Body of `POST /rooms/:room_id/join`.
#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    /// Joining user.
    pub user_id: String,
}

/// Body of `POST /rooms/:room_id/send`.
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    /// Sending user.
    pub user_id: String,
    /// Event type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Event body.
    #[serde(default)]
    pub content: serde_json::Value,
}

/// Body of `PUT /presence/:user_id`.
#[derive(Debug, Deserialize)]
pub struct PresenceRequest {
    /// New status.
    pub presence: PresenceStatus,
    /// Optional free-text status.
    #[serde(default)]
    pub status_msg: Option<String>,
}

/// Shared server state.
pub struct AppState {
    /// The long-poll notifier.
    pub notifier: Notifier,
    /// Room events and membership.
    pub timeline: Arc<RoomTimeline>,
    /// User presence.
    pub presence: Arc<PresenceTracker>,
    /// Membership signals.
    pub distributor: Distributor,
    /// Limits and presence expiry.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let timeline = Arc::new(RoomTimeline::new());
        let presence = Arc::new(PresenceTracker::new(Arc::clone(&timeline)));

        // Source order fixes the order of the initial check.
        let sources = EventSources::new()
            .with_source(timeline.clone())
            .with_source(presence.clone());
        let notifier = Notifier::new(sources);

        let distributor = Distributor::new();
        distributor.observe(Arc::new(notifier.clone()));

        Self {
            notifier,
            timeline,
            presence,
            distributor,
            config,
        }
    }

    /// Long-poll for events for a user in every room they are joined to.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed parameters or a failing event source.
    pub async fn poll_events(&self, query: EventsQuery) -> Result<EventBatch, ApiError> {
        let user = UserId::parse(query.user_id)?;
        let from_token = query
            .from
            .filter(|from| !from.is_empty())
            .map(|from| from.parse::<StreamToken>())
            .transpose()?;
        let limit = self.config.events.limit(query.limit);
        let timeout = self.config.events.timeout(query.timeout);
        let rooms = self.timeline.rooms_for_user(&user);

        debug!(user = %user, rooms = rooms.len(), ?timeout, "Long-poll");

        let _guard = LongPollMetricsGuard::new();
        let result = self
            .notifier
            .get_events_for(user, rooms, PaginationConfig::new(from_token, limit), timeout)
            .await;
        metrics::set_pending_listeners(self.notifier.stats().pending_listeners);

        match &result {
            Ok(batch) if batch.is_empty() => metrics::record_outcome("empty"),
            Ok(_) => metrics::record_outcome("events"),
            Err(_) => metrics::record_outcome("error"),
        }
        Ok(result?)
    }

    /// Join a user to a room and wake whoever should see it.
    ///
    /// Returns the membership event, or `None` if the user was already joined.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed identifiers.
    pub async fn join_room(&self, room: &str, user: String) -> Result<Option<Event>, ApiError> {
        let room = RoomId::parse(room)?;
        let user = UserId::parse(user)?;

        let Some(event) = self.timeline.join(&room, &user) else {
            return Ok(None);
        };
        metrics::record_event(&event.kind);

        // The joining user's pending listeners must be reachable through the
        // room before the join event is dispatched.
        self.distributor.user_joined_room(user.clone(), room);
        self.notify_room_event(&event, &[user]).await;

        Ok(Some(event))
    }

    /// Append an event to a room and wake its listeners.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed identifiers or a sender outside the room.
    pub async fn send_event(&self, room: &str, request: SendRequest) -> Result<Event, ApiError> {
        let room = RoomId::parse(room)?;
        let user = UserId::parse(request.user_id)?;

        let event = self
            .timeline
            .send(&room, &user, request.kind, request.content)?;
        metrics::record_event(&event.kind);
        self.notify_room_event(&event, &[]).await;

        Ok(event)
    }

    /// Update a user's presence and wake whoever shares a room with them.
    ///
    /// Returns the presence stream position of the change.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed user id.
    pub async fn set_presence(&self, user: &str, request: PresenceRequest) -> Result<u64, ApiError> {
        let user = UserId::parse(user)?;
        let position = self
            .presence
            .set_presence(&user, request.presence, request.status_msg);
        self.notify_user_event(vec![user]).await;
        Ok(position)
    }

    /// Mark idle users offline and wake whoever can see them.
    ///
    /// Returns the number of users marked offline.
    pub async fn sweep_presence(&self) -> usize {
        let stale = self
            .presence
            .prune_stale(self.config.presence.idle_timeout());
        let count = stale.len();
        if count > 0 {
            info!(users = count, "Marked idle users offline");
            self.notify_user_event(stale).await;
        }
        count
    }

    // Notification failures do not undo the write; they are logged and counted.
    async fn notify_room_event(&self, event: &Event, extra_users: &[UserId]) {
        match self.notifier.on_new_room_event(event, extra_users).await {
            Ok(woken) => metrics::record_woken(ROOM_SOURCE, woken),
            Err(e) => {
                metrics::record_error("notify");
                warn!(error = %e, "Room event notification failed");
            }
        }
        metrics::set_pending_listeners(self.notifier.stats().pending_listeners);
    }

    async fn notify_user_event(&self, users: Vec<UserId>) {
        let mut rooms: Vec<RoomId> = users
            .iter()
            .flat_map(|user| self.timeline.rooms_for_user(user))
            .collect();
        rooms.sort();
        rooms.dedup();

        match self.notifier.on_new_user_event(&users, &rooms).await {
            Ok(woken) => metrics::record_woken(PRESENCE_SOURCE, woken),
            Err(e) => {
                metrics::record_error("notify");
                warn!(error = %e, "User event notification failed");
            }
        }
        metrics::set_pending_listeners(self.notifier.stats().pending_listeners);
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/events", get(events_handler))
        .route("/rooms/:room_id/join", post(join_handler))
        .route("/rooms/:room_id/send", post(send_handler))
        .route("/presence/:user_id", put(presence_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Periodically mark idle users offline.
pub fn spawn_presence_sweeper(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.presence.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            state.sweep_presence().await;
        }
    })
}

/// Run the HTTP server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(&config.server.host, config.metrics.port) {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    let sweeper = spawn_presence_sweeper(Arc::clone(&state));
    let app = app(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Pulse server listening on {}", addr);
    info!("Long-poll endpoint: http://{}/events", addr);

    let served = axum::serve(listener, app).await;
    sweeper.abort();
    served?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.notifier.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "pending_listeners": stats.pending_listeners,
    }))
}

/// Long-poll handler.
async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventBatch>, ApiError> {
    state.poll_events(query).await.map(Json)
}

/// Room join handler.
async fn join_handler(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Json(request): Json<JoinRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let event = state.join_room(&room_id, request.user_id).await?;
    Ok(Json(serde_json::json!({
        "room_id": room_id,
        "event_id": event.map(|e| e.event_id),
    })))
}

/// Room send handler.
async fn send_handler(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Json(request): Json<SendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let event = state.send_event(&room_id, request).await?;
    Ok(Json(serde_json::json!({ "event_id": event.event_id })))
}

/// Presence update handler.
async fn presence_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(request): Json<PresenceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.set_presence(&user_id, request).await?;
    Ok(StatusCode::OK)
}
