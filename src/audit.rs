//! Structured, append-only audit log.
//!
//! Every admission, routing, and processing decision lands here as one line
//! of canonical JSON. Producers enqueue events through a bounded channel; a
//! single writer task appends whole lines (one write per line, newline
//! terminated) so a crash never leaves a partial record, and per-sink
//! ordering matches emit order.
//!
//! Backpressure: a producer facing a full channel blocks for at most
//! [`BACKPRESSURE_BUDGET`], then drops the event and counts it — audit-log
//! correctness is prioritized over best-effort delivery.
//!
//! Actor values that look like PII (contain `@` or any decimal digit) are
//! replaced by a truncated SHA-256 at event construction, so raw identifiers
//! never reach the channel, let alone the file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How long a producer may wait on a full channel before dropping the event.
pub const BACKPRESSURE_BUDGET: Duration = Duration::from_millis(50);

/// Bounded channel capacity between producers and the writer task.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Closed set of audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "request.received")]
    RequestReceived,
    #[serde(rename = "request.authorized")]
    RequestAuthorized,
    #[serde(rename = "request.denied")]
    RequestDenied,
    #[serde(rename = "processing.started")]
    ProcessingStarted,
    #[serde(rename = "processing.completed")]
    ProcessingCompleted,
    #[serde(rename = "processing.failed")]
    ProcessingFailed,
    #[serde(rename = "pii.detected")]
    PiiDetected,
    #[serde(rename = "injection.detected")]
    InjectionDetected,
    #[serde(rename = "anomaly.detected")]
    AnomalyDetected,
    #[serde(rename = "security.violation")]
    SecurityViolation,
    #[serde(rename = "data.access")]
    DataAccess,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestReceived => "request.received",
            Self::RequestAuthorized => "request.authorized",
            Self::RequestDenied => "request.denied",
            Self::ProcessingStarted => "processing.started",
            Self::ProcessingCompleted => "processing.completed",
            Self::ProcessingFailed => "processing.failed",
            Self::PiiDetected => "pii.detected",
            Self::InjectionDetected => "injection.detected",
            Self::AnomalyDetected => "anomaly.detected",
            Self::SecurityViolation => "security.violation",
            Self::DataAccess => "data.access",
        }
    }
}

/// Audit event outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Denied,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Denied => "denied",
            Self::Error => "error",
        }
    }
}

/// One structured audit record: who, what, on what, with which result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitivity_level: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl AuditEvent {
    /// Build an event. The actor passes through [`hash_if_pii`] here, so a
    /// raw identifier never outlives this call.
    pub fn new(
        event_type: EventType,
        actor: &str,
        action: &str,
        resource: &str,
        outcome: Outcome,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            actor: hash_if_pii(actor),
            action: action.to_string(),
            resource: resource.to_string(),
            outcome,
            sensitivity_level: None,
            context: Map::new(),
        }
    }

    pub fn with_sensitivity(mut self, level: &str) -> Self {
        self.sensitivity_level = Some(level.to_string());
        self
    }

    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    /// One canonical JSON line, newline terminated.
    pub fn to_json_line(&self) -> String {
        let mut line =
            serde_json::to_string(self).expect("audit event serialization cannot fail");
        line.push('\n');
        line
    }
}

/// Hash an actor identifier when it matches the PII heuristic.
///
/// The heuristic is deliberately conservative: anything containing `@` or a
/// decimal digit gets hashed. Traceability survives — equal inputs hash
/// equally — but the raw value is gone.
pub fn hash_if_pii(actor: &str) -> String {
    if actor.contains('@') || actor.chars().any(|c| c.is_ascii_digit()) {
        let digest = Sha256::digest(actor.as_bytes());
        hex::encode(digest)[..16].to_string()
    } else {
        actor.to_string()
    }
}

/// Append-only audit sink. Shared across the gateway via `Arc`.
pub struct AuditSink {
    tx: mpsc::Sender<AuditEvent>,
    dropped: Arc<AtomicU64>,
    path: PathBuf,
}

impl AuditSink {
    /// Open (or create) the log file and start the writer task.
    ///
    /// The returned handle completes once every sender is dropped and the
    /// backlog is flushed — await it during shutdown to guarantee no event
    /// is lost on exit.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<(Self, JoinHandle<()>)> {
        let path = path.into();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, mut rx) = mpsc::channel::<AuditEvent>(CHANNEL_CAPACITY);

        let writer_path = path.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let line = event.to_json_line();
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    tracing::error!(path = %writer_path.display(), error = %e, "audit append failed");
                    continue;
                }
                if let Err(e) = file.flush().await {
                    tracing::error!(path = %writer_path.display(), error = %e, "audit flush failed");
                }
            }
        });

        Ok((Self { tx, dropped: Arc::new(AtomicU64::new(0)), path }, handle))
    }

    /// Enqueue an event for appending.
    ///
    /// Never blocks longer than [`BACKPRESSURE_BUDGET`]; an event that cannot
    /// be enqueued within the budget is dropped and counted.
    pub async fn emit(&self, event: AuditEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let send = self.tx.send_timeout(event, BACKPRESSURE_BUDGET);
                if send.await.is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        dropped_total = self.dropped.load(Ordering::Relaxed),
                        "audit channel saturated beyond budget, event dropped"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("audit writer gone, event dropped");
            }
        }
    }

    /// Events dropped under backpressure since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Filters for a linear scan over the log file. No index — at this scale a
/// scan is cheap, and the file is the source of truth.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct QueryFilter {
    pub event_type: Option<EventType>,
    pub actor: Option<String>,
    pub outcome: Option<Outcome>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Read-side companion to [`AuditSink`].
pub struct AuditQuery {
    path: PathBuf,
}

impl AuditQuery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Scan the log, newest entries last, applying every set filter.
    /// Malformed lines are skipped, not fatal — the log survives torn writes
    /// from pre-crash runs.
    pub async fn query(&self, filter: &QueryFilter) -> anyhow::Result<Vec<AuditEvent>> {
        let limit = filter.limit.unwrap_or(100);
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut results = Vec::new();
        for line in content.lines() {
            let Ok(event) = serde_json::from_str::<AuditEvent>(line) else {
                continue;
            };
            if let Some(event_type) = filter.event_type {
                if event.event_type != event_type {
                    continue;
                }
            }
            if let Some(actor) = &filter.actor {
                if &event.actor != actor {
                    continue;
                }
            }
            if let Some(outcome) = filter.outcome {
                if event.outcome != outcome {
                    continue;
                }
            }
            if let Some(since) = filter.since {
                if event.timestamp < since {
                    continue;
                }
            }
            if let Some(until) = filter.until {
                if event.timestamp > until {
                    continue;
                }
            }
            results.push(event);
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    pub async fn by_type(&self, event_type: EventType) -> anyhow::Result<Vec<AuditEvent>> {
        self.query(&QueryFilter { event_type: Some(event_type), ..Default::default() }).await
    }

    pub async fn by_actor(&self, actor: &str) -> anyhow::Result<Vec<AuditEvent>> {
        self.query(&QueryFilter { actor: Some(actor.to_string()), ..Default::default() }).await
    }

    pub async fn by_time_range(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> anyhow::Result<Vec<AuditEvent>> {
        self.query(&QueryFilter { since: Some(since), until: Some(until), ..Default::default() })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: EventType, actor: &str) -> AuditEvent {
        AuditEvent::new(event_type, actor, "process", "request:r-1", Outcome::Success)
    }

    async fn drain(sink: AuditSink, handle: JoinHandle<()>) {
        drop(sink);
        handle.await.unwrap();
    }

    // -----------------------------------------------------------------------
    // Actor hashing
    // -----------------------------------------------------------------------

    #[test]
    fn actors_with_at_sign_or_digits_are_hashed() {
        let hashed = hash_if_pii("alice@example.com");
        assert_eq!(hashed.len(), 16);
        assert!(hashed.chars().all(|c| c.is_ascii_hexdigit()));

        let with_digits = hash_if_pii("client-42");
        assert_eq!(with_digits.len(), 16);

        assert_eq!(hash_if_pii("system"), "system");
    }

    #[test]
    fn hashing_preserves_traceability() {
        assert_eq!(hash_if_pii("alice@example.com"), hash_if_pii("alice@example.com"));
        assert_ne!(hash_if_pii("alice@example.com"), hash_if_pii("bob@example.com"));
    }

    #[test]
    fn event_constructor_hashes_the_actor() {
        let e = event(EventType::RequestReceived, "svc-99");
        assert_ne!(e.actor, "svc-99");
        assert_eq!(e.actor.len(), 16);
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    #[test]
    fn json_line_is_single_line_newline_terminated() {
        let line = event(EventType::PiiDetected, "system").to_json_line();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["event_type"], "pii.detected");
        assert_eq!(value["outcome"], "success");
    }

    #[test]
    fn event_types_use_dotted_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventType::SecurityViolation).unwrap(),
            "\"security.violation\""
        );
        let parsed: EventType = serde_json::from_str("\"request.denied\"").unwrap();
        assert_eq!(parsed, EventType::RequestDenied);
    }

    // -----------------------------------------------------------------------
    // Sink + query
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn emitted_events_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let (sink, handle) = AuditSink::open(&path).await.unwrap();

        sink.emit(event(EventType::RequestReceived, "system")).await;
        sink.emit(event(EventType::RequestAuthorized, "system")).await;
        sink.emit(event(EventType::ProcessingCompleted, "system")).await;
        drain(sink, handle).await;

        let query = AuditQuery::new(&path);
        let events = query.query(&QueryFilter::default()).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, EventType::RequestReceived);
        assert_eq!(events[1].event_type, EventType::RequestAuthorized);
        assert_eq!(events[2].event_type, EventType::ProcessingCompleted);

        // Timestamps are non-decreasing within the sink.
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn query_filters_by_type_actor_and_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let (sink, handle) = AuditSink::open(&path).await.unwrap();

        sink.emit(event(EventType::RequestReceived, "system")).await;
        sink.emit(AuditEvent::new(
            EventType::RequestDenied,
            "system",
            "process",
            "request:r-2",
            Outcome::Denied,
        ))
        .await;
        drain(sink, handle).await;

        let query = AuditQuery::new(&path);
        let denied = query.by_type(EventType::RequestDenied).await.unwrap();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].outcome, Outcome::Denied);

        let by_actor = query.by_actor("system").await.unwrap();
        assert_eq!(by_actor.len(), 2);

        let none = query
            .query(&QueryFilter { outcome: Some(Outcome::Error), ..Default::default() })
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn query_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let (sink, handle) = AuditSink::open(&path).await.unwrap();
        sink.emit(event(EventType::RequestReceived, "system")).await;
        drain(sink, handle).await;

        // Simulate a torn write from a previous run.
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"event_id\": \"truncat");
        std::fs::write(&path, content).unwrap();

        let events = AuditQuery::new(&path).query(&QueryFilter::default()).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn query_on_missing_file_is_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let query = AuditQuery::new(dir.path().join("never-written.log"));
        assert!(query.query(&QueryFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn time_range_query_bounds_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let (sink, handle) = AuditSink::open(&path).await.unwrap();
        sink.emit(event(EventType::RequestReceived, "system")).await;
        drain(sink, handle).await;

        let query = AuditQuery::new(&path);
        let past = Utc::now() - chrono::Duration::hours(1);
        let future = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(query.by_time_range(past, future).await.unwrap().len(), 1);
        assert!(query
            .by_time_range(past, past + chrono::Duration::minutes(1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn reopening_appends_instead_of_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");

        let (sink, handle) = AuditSink::open(&path).await.unwrap();
        sink.emit(event(EventType::RequestReceived, "system")).await;
        drain(sink, handle).await;

        let (sink, handle) = AuditSink::open(&path).await.unwrap();
        sink.emit(event(EventType::RequestAuthorized, "system")).await;
        drain(sink, handle).await;

        let events = AuditQuery::new(&path).query(&QueryFilter::default()).await.unwrap();
        assert_eq!(events.len(), 2);
    }
}
