//! HTTP ingest handlers for Strobe.

use std::fmt::Display;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::strobe_core::{Event, EventBus, IncomingCommand};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestResponse {
    pub status: u16,
    pub accepted: usize,
    pub error: Option<String>,
}

impl IngestResponse {
    pub fn ok(accepted: usize) -> Self {
        Self { status: 200, accepted, error: None }
    }

    pub fn from_error(error: IngestError) -> Self {
        let status = error.status_code();
        Self { status, accepted: 0, error: Some(error.to_string()) }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("event bus error: {0}")]
    EventBus(String),
}

impl IngestError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidJson(_) => 400,
            Self::InvalidCommand(_) | Self::MissingField(_) => 422,
            Self::EventBus(_) => 500,
        }
    }
}

/// One command as senders post it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCommand {
    #[serde(default, rename = "type")]
    r#type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
    #[serde(default)]
    connection_id: Option<u64>,
    #[serde(default)]
    delta_time: Option<u64>,
    #[serde(default)]
    important: bool,
}

impl WireCommand {
    fn into_incoming(self, received_at: DateTime<Utc>) -> IncomingCommand {
        IncomingCommand {
            r#type: self.r#type.trim().to_string(),
            date: self.date.unwrap_or(received_at),
            payload: self.payload,
            connection_id: self.connection_id,
            delta_time: self.delta_time,
            important: self.important,
        }
    }
}

pub struct Ingestor<B, C> {
    bus: B,
    clock: C,
}

impl<B, C> Ingestor<B, C>
where
    B: EventBus,
    B::Error: Display,
    C: Fn() -> DateTime<Utc>,
{
    pub fn new(bus: B, clock: C) -> Self {
        Self { bus, clock }
    }

    pub fn handle(&self, body: &[u8]) -> IngestResponse {
        match self.handle_inner(body) {
            Ok(accepted) => IngestResponse::ok(accepted),
            Err(error) => {
                debug!(error = %error, "rejected ingest request");
                IngestResponse::from_error(error)
            }
        }
    }

    /// Validates the whole body before emitting anything.
    pub fn handle_inner(&self, body: &[u8]) -> Result<usize, IngestError> {
        let value: Value = serde_json::from_slice(body).map_err(classify_json_error)?;
        let items = match value {
            Value::Object(map) => vec![Value::Object(map)],
            Value::Array(items) => items,
            other => {
                return Err(IngestError::InvalidCommand(format!(
                    "expected an object or an array of objects, found {}",
                    json_kind(&other)
                )))
            }
        };

        let received_at = (self.clock)();
        let mut commands = Vec::with_capacity(items.len());
        for item in items {
            let wire: WireCommand = serde_json::from_value(item).map_err(classify_json_error)?;
            validate_command(&wire)?;
            commands.push(wire.into_incoming(received_at));
        }

        let accepted = commands.len();
        for command in commands {
            self.bus
                .emit(Event::CommandReceived(command))
                .map_err(|error| IngestError::EventBus(error.to_string()))?;
        }
        Ok(accepted)
    }

    pub fn clear(&self) -> IngestResponse {
        match self.bus.emit(Event::TimelineCleared) {
            Ok(()) => IngestResponse::ok(0),
            Err(error) => IngestResponse::from_error(IngestError::EventBus(error.to_string())),
        }
    }
}

fn classify_json_error(err: serde_json::Error) -> IngestError {
    use serde_json::error::Category;

    match err.classify() {
        Category::Syntax | Category::Eof => IngestError::InvalidJson(err),
        Category::Data | Category::Io => IngestError::InvalidCommand(err.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn validate_command(command: &WireCommand) -> Result<(), IngestError> {
    if command.r#type.trim().is_empty() {
        return Err(IngestError::MissingField("type"));
    }
    Ok(())
}

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

pub fn router<B, C>(ingestor: Arc<Ingestor<B, C>>, max_body_bytes: usize) -> Router
where
    B: EventBus + Send + Sync + 'static,
    B::Error: Display,
    C: Fn() -> DateTime<Utc> + Send + Sync + 'static,
{
    Router::new()
        .route("/", post(ingest_handler::<B, C>).delete(clear_handler::<B, C>))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(ingestor)
}

async fn ingest_handler<B, C>(State(ingestor): State<Arc<Ingestor<B, C>>>, bytes: Bytes) -> Response
where
    B: EventBus + Send + Sync + 'static,
    B::Error: Display,
    C: Fn() -> DateTime<Utc> + Send + Sync + 'static,
{
    into_http(ingestor.handle(&bytes))
}

async fn clear_handler<B, C>(State(ingestor): State<Arc<Ingestor<B, C>>>) -> Response
where
    B: EventBus + Send + Sync + 'static,
    B::Error: Display,
    C: Fn() -> DateTime<Utc> + Send + Sync + 'static,
{
    into_http(ingestor.clear())
}

fn into_http(response: IngestResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    match response.error {
        Some(error) => (status, Json(json!({ "ok": false, "error": error }))).into_response(),
        None => (status, Json(json!({ "ok": true, "accepted": response.accepted }))).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use chrono::TimeZone;
    use rstest::{fixture, rstest};
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct TestBus {
        events: Mutex<Vec<Event>>,
    }

    impl EventBus for TestBus {
        type Error = String;
        type Subscription = ();

        fn emit(&self, event: Event) -> Result<(), Self::Error> {
            self.events.lock().map_err(|_| "bus poisoned".to_string())?.push(event);
            Ok(())
        }

        fn subscribe(&self) -> Result<Self::Subscription, Self::Error> {
            Ok(())
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(42_000).single().expect("valid date")
    }

    #[fixture]
    fn bus() -> TestBus {
        TestBus::default()
    }

    fn received(bus: &TestBus) -> Vec<IncomingCommand> {
        bus.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                Event::CommandReceived(command) => Some(command.clone()),
                Event::TimelineCleared => None,
            })
            .collect()
    }

    #[rstest]
    fn single_object_is_emitted(bus: TestBus) {
        let ingestor = Ingestor::new(&bus, fixed_now);
        let body = json!({"type": "log", "payload": {"message": "hi"}, "connectionId": 3, "important": true});

        let response = ingestor.handle(&serde_json::to_vec(&body).unwrap());
        assert_eq!(response, IngestResponse::ok(1));

        let commands = received(&bus);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].r#type, "log");
        assert_eq!(commands[0].date, fixed_now());
        assert_eq!(commands[0].connection_id, Some(3));
        assert!(commands[0].important);
    }

    #[rstest]
    fn array_keeps_sender_dates(bus: TestBus) {
        let ingestor = Ingestor::new(&bus, fixed_now);
        let body = json!([
            {"type": "log", "date": "2024-01-02T03:04:05.006Z"},
            {"type": "api.response", "payload": {}}
        ]);

        let response = ingestor.handle(&serde_json::to_vec(&body).unwrap());
        assert_eq!(response.accepted, 2);

        let commands = received(&bus);
        assert_eq!(commands[0].date.to_rfc3339(), "2024-01-02T03:04:05.006+00:00");
        assert_eq!(commands[1].date, fixed_now());
    }

    #[rstest]
    #[case(b"{not json".to_vec(), 400)]
    #[case(b"\"log\"".to_vec(), 422)]
    #[case(br#"{"payload": {}}"#.to_vec(), 422)]
    #[case(br#"[{"type": "log"}, {"type": "  "}]"#.to_vec(), 422)]
    #[case(br#"{"type": 7}"#.to_vec(), 422)]
    fn invalid_bodies_leave_bus_untouched(bus: TestBus, #[case] body: Vec<u8>, #[case] status: u16) {
        let ingestor = Ingestor::new(&bus, fixed_now);
        let response = ingestor.handle(&body);

        assert_eq!(response.status, status);
        assert!(response.error.is_some());
        assert!(bus.events.lock().unwrap().is_empty());
    }

    #[rstest]
    fn clear_emits_event(bus: TestBus) {
        let ingestor = Ingestor::new(&bus, fixed_now);
        assert_eq!(ingestor.clear().status, 200);
        assert_eq!(bus.events.lock().unwrap().as_slice(), &[Event::TimelineCleared]);
    }

    fn request(method: Method, body: impl Into<Body>) -> Request<Body> {
        Request::builder().method(method).uri("/").body(body.into()).unwrap()
    }

    #[tokio::test]
    async fn router_accepts_and_clears() {
        let bus = Arc::new(TestBus::default());
        let app = router(Arc::new(Ingestor::new(bus.clone(), fixed_now)), 1024);

        let response = app
            .clone()
            .oneshot(request(Method::POST, r#"{"type":"log","payload":{"message":"hi"}}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed, json!({"ok": true, "accepted": 1}));

        let response = app.oneshot(request(Method::DELETE, Body::empty())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(bus.events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn router_rejects_oversized_body() {
        let bus = Arc::new(TestBus::default());
        let app = router(Arc::new(Ingestor::new(bus.clone(), fixed_now)), 16);

        let body = json!({"type": "log", "payload": {"message": "x".repeat(64)}}).to_string();
        let response = app.oneshot(request(Method::POST, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(bus.events.lock().unwrap().is_empty());
    }
}
