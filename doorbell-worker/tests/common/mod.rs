#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use doorbell_common::database::{DatabaseError, DatabaseResult};
use doorbell_common::event::{ClaimState, DoorbellEvent};
use doorbell_common::events::{Claim, EventSource};
use doorbell_common::notification::{Notification, NotificationError, Notifier};
use doorbell_common::recognition::{RecognitionOracle, RecognitionOutcome};
use doorbell_common::results::{RecognitionResult, ResultSink};
use doorbell_common::visitors::{name_matches, Visitor, VisitorStore};
use doorbell_worker::image::ImageFetcher;
use doorbell_worker::pipeline::Pipeline;

pub fn unreachable(command: &str) -> DatabaseError {
    DatabaseError::query(command, sqlx::Error::PoolTimedOut)
}

pub fn matched(names: &[&str]) -> RecognitionOutcome {
    RecognitionOutcome {
        succeeded: true,
        authenticated: true,
        candidate_names: names.iter().map(|name| name.to_string()).collect(),
        message: "Authentication successful".to_owned(),
    }
}

pub fn not_matched() -> RecognitionOutcome {
    RecognitionOutcome {
        succeeded: true,
        authenticated: false,
        candidate_names: Vec::new(),
        message: "Authentication failed".to_owned(),
    }
}

pub fn visitor(id: i64, name: &str, is_authorized: bool) -> Visitor {
    Visitor {
        id,
        name: name.to_owned(),
        is_authorized,
        visit_count: 0,
        last_visit: None,
    }
}

struct StoredEvent {
    event: DoorbellEvent,
    available_at: time::Instant,
    claimed_at: Option<time::Instant>,
}

/// An in-memory event feed with the same claim semantics as `PgEventSource`.
#[derive(Default)]
pub struct MemoryEventSource {
    events: Mutex<Vec<StoredEvent>>,
    releases: Mutex<Vec<(String, time::Duration)>>,
    /// Also hand out claimed events, like an at-least-once feed redelivering.
    pub redeliver_claimed: AtomicBool,
}

impl MemoryEventSource {
    pub fn append(&self, id: &str, payload: Value) {
        self.events.lock().unwrap().push(StoredEvent {
            event: DoorbellEvent::from_payload(id, &payload),
            available_at: time::Instant::now(),
            claimed_at: None,
        });
    }

    pub fn event(&self, id: &str) -> Option<DoorbellEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|stored| stored.event.id == id)
            .map(|stored| stored.event.clone())
    }

    pub fn releases(&self) -> Vec<(String, time::Duration)> {
        self.releases.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn poll(&self, limit: u32) -> DatabaseResult<Vec<DoorbellEvent>> {
        let redeliver_claimed = self.redeliver_claimed.load(Ordering::SeqCst);
        let now = time::Instant::now();

        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|stored| redeliver_claimed || !stored.event.claim_state.is_claimed())
            .filter(|stored| stored.available_at <= now)
            .take(limit as usize)
            .map(|stored| stored.event.clone())
            .collect())
    }

    async fn try_claim(&self, event_id: &str, _claimed_by: &str) -> DatabaseResult<Claim> {
        let mut events = self.events.lock().unwrap();
        let Some(stored) = events.iter_mut().find(|stored| stored.event.id == event_id) else {
            return Ok(Claim::AlreadyClaimed);
        };
        if stored.event.claim_state.is_claimed() {
            return Ok(Claim::AlreadyClaimed);
        }

        stored.event.claim_state = ClaimState::Claimed;
        stored.event.attempt += 1;
        stored.claimed_at = Some(time::Instant::now());
        Ok(Claim::Acquired {
            attempt: stored.event.attempt,
        })
    }

    async fn release(&self, event_id: &str, retry_after: time::Duration) -> DatabaseResult<()> {
        self.releases
            .lock()
            .unwrap()
            .push((event_id.to_owned(), retry_after));

        let mut events = self.events.lock().unwrap();
        if let Some(stored) = events.iter_mut().find(|stored| stored.event.id == event_id) {
            stored.event.claim_state = ClaimState::Unclaimed;
            stored.available_at = time::Instant::now() + retry_after;
            stored.claimed_at = None;
        }
        Ok(())
    }

    // Results are not visible from here, so every stale claim is released.
    async fn reclaim_stale(&self, older_than: time::Duration) -> DatabaseResult<u64> {
        let mut released = 0;
        for stored in self.events.lock().unwrap().iter_mut() {
            let stale = stored
                .claimed_at
                .is_some_and(|claimed_at| claimed_at.elapsed() >= older_than);
            if stale {
                stored.event.claim_state = ClaimState::Unclaimed;
                stored.available_at = time::Instant::now();
                stored.claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }
}

/// A recognition service answering every image with the same outcome.
pub struct ScriptedOracle {
    outcome: Mutex<RecognitionOutcome>,
    calls: AtomicUsize,
    panics: AtomicBool,
}

impl ScriptedOracle {
    pub fn answering(outcome: RecognitionOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            calls: AtomicUsize::new(0),
            panics: AtomicBool::new(false),
        }
    }

    pub fn panicking() -> Self {
        let oracle = Self::answering(RecognitionOutcome::default());
        oracle.panics.store(true, Ordering::SeqCst);
        oracle
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecognitionOracle for ScriptedOracle {
    async fn recognize(&self, _image: &str) -> RecognitionOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panics.load(Ordering::SeqCst) {
            panic!("recognition service blew up");
        }
        self.outcome.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct MemoryVisitorStore {
    visitors: Mutex<Vec<Visitor>>,
    pub lookups_fail: AtomicBool,
    pub increments_fail: AtomicBool,
}

impl MemoryVisitorStore {
    pub fn with(visitors: Vec<Visitor>) -> Self {
        Self {
            visitors: Mutex::new(visitors),
            ..Default::default()
        }
    }

    pub fn visitor(&self, id: i64) -> Option<Visitor> {
        self.visitors
            .lock()
            .unwrap()
            .iter()
            .find(|visitor| visitor.id == id)
            .cloned()
    }
}

#[async_trait]
impl VisitorStore for MemoryVisitorStore {
    async fn find_authorized_by_name(&self, name: &str) -> DatabaseResult<Option<Visitor>> {
        if self.lookups_fail.load(Ordering::SeqCst) {
            return Err(unreachable("SELECT"));
        }

        let mut visitors = self.visitors.lock().unwrap().clone();
        visitors.sort_by_key(|visitor| visitor.id);
        Ok(visitors
            .into_iter()
            .find(|visitor| visitor.is_authorized && name_matches(&visitor.name, name)))
    }

    async fn increment_visit(&self, visitor_id: i64) -> DatabaseResult<()> {
        if self.increments_fail.load(Ordering::SeqCst) {
            return Err(unreachable("UPDATE"));
        }

        let mut visitors = self.visitors.lock().unwrap();
        if let Some(visitor) = visitors.iter_mut().find(|visitor| visitor.id == visitor_id) {
            visitor.visit_count += 1;
            visitor.last_visit = Some(Utc::now());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryResultSink {
    results: Mutex<HashMap<String, RecognitionResult>>,
    writes: AtomicUsize,
    pub fails: AtomicBool,
}

impl MemoryResultSink {
    pub fn result(&self, event_id: &str) -> Option<RecognitionResult> {
        self.results.lock().unwrap().get(event_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn put(&self, event_id: &str, result: &RecognitionResult) -> DatabaseResult<()> {
        if self.fails.load(Ordering::SeqCst) {
            return Err(unreachable("INSERT"));
        }

        self.writes.fetch_add(1, Ordering::SeqCst);
        self.results
            .lock()
            .unwrap()
            .insert(event_id.to_owned(), result.clone());
        Ok(())
    }

    async fn get(&self, event_id: &str) -> DatabaseResult<Option<RecognitionResult>> {
        Ok(self.result(event_id))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    pub fails: AtomicBool,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, notification: &Notification) -> Result<(), NotificationError> {
        if self.fails.load(Ordering::SeqCst) {
            return Err(NotificationError::Rejected {
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                body: "unavailable".to_owned(),
            });
        }

        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Serves a fixed image for every url in `images`, nothing for anything else.
#[derive(Default)]
pub struct MemoryImageFetcher {
    pub images: HashMap<String, String>,
}

#[async_trait]
impl ImageFetcher for MemoryImageFetcher {
    async fn fetch(&self, url: &str) -> Option<String> {
        self.images.get(url).cloned()
    }
}

/// All collaborators of a `Pipeline`, kept around for inspection.
pub struct Harness {
    pub oracle: Arc<ScriptedOracle>,
    pub visitors: Arc<MemoryVisitorStore>,
    pub results: Arc<MemoryResultSink>,
    pub notifier: Arc<RecordingNotifier>,
    pub images: Arc<MemoryImageFetcher>,
}

impl Harness {
    pub fn new(outcome: RecognitionOutcome, visitors: Vec<Visitor>) -> Self {
        Self::with_oracle(ScriptedOracle::answering(outcome), visitors)
    }

    pub fn with_oracle(oracle: ScriptedOracle, visitors: Vec<Visitor>) -> Self {
        Self {
            oracle: Arc::new(oracle),
            visitors: Arc::new(MemoryVisitorStore::with(visitors)),
            results: Arc::new(MemoryResultSink::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            images: Arc::new(MemoryImageFetcher::default()),
        }
    }

    pub fn serving_image(mut self, url: &str, image: &str) -> Self {
        let mut images = MemoryImageFetcher::default();
        images.images.insert(url.to_owned(), image.to_owned());
        self.images = Arc::new(images);
        self
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.oracle.clone(),
            self.visitors.clone(),
            self.results.clone(),
            self.notifier.clone(),
            self.images.clone(),
            "doorbell",
        )
    }
}
