//! Delivery executor: one signed HTTP attempt to one endpoint.
//!
//! The attempt row is inserted before the call goes out and completed exactly
//! once afterwards, together with the follow-up due time when a retry is
//! warranted. The completion write is conditional on the row still being in
//! flight, so counters and notifications fire once per attempt even when the
//! interrupted-attempt sweep races a slow call.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use courier_core::{
    signing::{canonical_json, sign_bytes},
    AttemptCompletion, AttemptFailedEvent, AttemptSucceededEvent, AttemptTrigger, Clock,
    DeliveryAttempt, DeliveryEvent, Endpoint, EndpointId, Event, EventHandler, TenantId,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    client::{is_managed_header, DeliveryClient, DeliveryRequest, DeliveryResponse},
    error::{DeliveryError, Result},
    retry::RetryPolicy,
    storage::DeliveryStorage,
    DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};

/// Error recorded on attempts whose outcome was lost to a crash.
pub const INTERRUPTED_MESSAGE: &str = "delivery interrupted before a response was recorded";

const COUNTER_UPDATE_TRIES: u32 = 3;

/// Result of one attempt, as seen by the dispatcher and the audit store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptOutcome {
    /// Attempt row id.
    pub attempt_id: Uuid,
    /// Endpoint the attempt went to.
    pub endpoint_id: EndpointId,
    /// Attempt number for the pair.
    pub attempt_number: u32,
    /// True for a 2xx response.
    pub succeeded: bool,
    /// HTTP status, when the endpoint answered.
    pub response_status: Option<u16>,
    /// Failure description.
    pub error_message: Option<String>,
    /// Due time of the follow-up attempt, if one was scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Call duration in milliseconds.
    pub duration_ms: i64,
}

impl AttemptOutcome {
    /// Reads the outcome recorded on a completed attempt.
    pub fn from_attempt(attempt: &DeliveryAttempt) -> Self {
        Self {
            attempt_id: attempt.id,
            endpoint_id: attempt.endpoint_id,
            attempt_number: attempt.attempt_number,
            succeeded: attempt.succeeded,
            response_status: attempt.response_status.and_then(|s| u16::try_from(s).ok()),
            error_message: attempt.error_message.clone(),
            next_retry_at: attempt.next_retry_at,
            duration_ms: attempt.duration_ms.unwrap_or(0),
        }
    }
}

/// Builds the JSON envelope sent to receivers.
pub fn build_envelope(event: &Event, now: DateTime<Utc>) -> Value {
    json!({
        "event": event.event_type.as_str(),
        "timestamp": now.to_rfc3339_opts(SecondsFormat::Secs, true),
        "data": event.payload(),
        "eventID": event.id.to_string(),
    })
}

/// Builds request headers. Custom endpoint headers are applied last and
/// replace engine headers of the same name, compared case-insensitively.
/// Transport-managed headers are never taken from endpoint configuration.
pub fn build_headers(
    endpoint: &Endpoint,
    event: &Event,
    signature: Option<&str>,
    user_agent: &str,
    now: DateTime<Utc>,
) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    headers.insert("User-Agent".to_string(), user_agent.to_string());
    headers.insert(EVENT_HEADER.to_string(), event.event_type.as_str().to_string());
    if let Some(signature) = signature {
        headers.insert(SIGNATURE_HEADER.to_string(), signature.to_string());
    }
    headers.insert(DELIVERY_HEADER.to_string(), event.id.to_string());
    headers.insert(TIMESTAMP_HEADER.to_string(), now.timestamp().to_string());

    for (name, value) in endpoint.custom_headers() {
        if is_managed_header(name) {
            continue;
        }
        headers.retain(|existing: &String, _| !existing.eq_ignore_ascii_case(name));
        headers.insert(name.clone(), value.clone());
    }
    headers
}

/// Attempt ids whose HTTP call is still running in this process.
#[derive(Default)]
struct InFlight(Mutex<HashSet<Uuid>>);

impl InFlight {
    fn enter(self: &Arc<Self>, attempt_id: Uuid) -> InFlightGuard {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).insert(attempt_id);
        InFlightGuard { set: self.clone(), attempt_id }
    }

    fn contains(&self, attempt_id: Uuid) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).contains(&attempt_id)
    }
}

struct InFlightGuard {
    set: Arc<InFlight>,
    attempt_id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.0.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.attempt_id);
    }
}

/// Executes and records single delivery attempts.
#[derive(Clone)]
pub struct DeliveryExecutor {
    storage: Arc<dyn DeliveryStorage>,
    client: Arc<DeliveryClient>,
    clock: Arc<dyn Clock>,
    event_handler: Arc<dyn EventHandler>,
    in_flight: Arc<InFlight>,
}

impl DeliveryExecutor {
    /// Creates an executor.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        client: Arc<DeliveryClient>,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self { storage, client, clock, event_handler, in_flight: Arc::default() }
    }

    /// True while this executor, or a clone of it, is still waiting on the
    /// call for `attempt_id`. Such an attempt must not be recovered as
    /// interrupted however old it looks.
    pub fn is_in_flight(&self, attempt_id: Uuid) -> bool {
        self.in_flight.contains(attempt_id)
    }

    /// Signs, sends and records attempt `attempt_number` of `event` to
    /// `endpoint`.
    ///
    /// Non-2xx responses and transport failures are recorded outcomes, not
    /// errors. Only `Dispatch` and `Retry` failures schedule a follow-up.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the attempt number is already taken for the
    /// pair, and `DatabaseError` if the attempt cannot be persisted.
    pub async fn attempt(
        &self,
        endpoint: &Endpoint,
        event: &Event,
        attempt_number: u32,
        trigger: AttemptTrigger,
    ) -> Result<AttemptOutcome> {
        let now = self.clock.now_utc();
        let user_agent = self.client.config().user_agent.clone();
        let envelope = build_envelope(event, now);

        let signed = canonical_json(&envelope)
            .and_then(|body| sign_bytes(&endpoint.secret, &body).map(|sig| (body, sig)));
        let (body, signature) = match signed {
            Ok(signed) => signed,
            Err(signing_error) => {
                warn!(
                    event_id = %event.id,
                    endpoint_id = %endpoint.id,
                    error = %signing_error,
                    "payload could not be signed, recording failed attempt"
                );
                let headers = build_headers(endpoint, event, None, &user_agent, now);
                let attempt = self
                    .insert_attempt(endpoint, event, attempt_number, trigger, headers, Vec::new(), now)
                    .await?;
                let completion = AttemptCompletion {
                    response_status: None,
                    response_headers: None,
                    response_body: None,
                    duration_ms: 0,
                    succeeded: false,
                    error_message: Some(DeliveryError::from(signing_error).to_string()),
                    next_retry_at: None,
                    completed_at: now,
                };
                return self.complete_or_reload(&attempt, endpoint.tenant_id, completion).await;
            },
        };

        let headers = build_headers(endpoint, event, Some(&signature), &user_agent, now);
        let attempt = self
            .insert_attempt(endpoint, event, attempt_number, trigger, headers.clone(), body.clone(), now)
            .await?;
        let _in_flight = self.in_flight.enter(attempt.id);

        debug!(
            event_id = %event.id,
            endpoint_id = %endpoint.id,
            attempt_id = %attempt.id,
            attempt_number,
            %trigger,
            "sending delivery attempt"
        );

        let started = self.clock.now();
        let result = self
            .client
            .deliver(DeliveryRequest {
                attempt_id: attempt.id,
                event_id: event.id.0,
                url: endpoint.url.clone(),
                headers,
                body: Bytes::from(body),
                attempt_number,
            })
            .await;
        let elapsed = self.clock.now().saturating_duration_since(started);

        let completed_at = self.clock.now_utc();
        let mut completion = completion_from(result, elapsed, completed_at);
        if !completion.succeeded && trigger.schedules_retries() {
            completion.next_retry_at =
                RetryPolicy::for_endpoint(endpoint).decide(attempt_number, completed_at).next_attempt_at();
        }

        self.complete_or_reload(&attempt, endpoint.tenant_id, completion).await
    }

    /// Completes an attempt whose call was cut short by a crash.
    ///
    /// The attempt is recorded as a failure and then handled like any other
    /// failed attempt of its trigger. Returns `None` when another worker
    /// completed it first.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if storage is unavailable.
    pub async fn recover_interrupted(
        &self,
        attempt: &DeliveryAttempt,
    ) -> Result<Option<AttemptOutcome>> {
        let now = self.clock.now_utc();
        let endpoint = self.storage.find_endpoint(attempt.endpoint_id).await?;
        let tenant_id = match (&endpoint, self.storage.find_event(attempt.event_id).await?) {
            (_, Some(event)) => event.tenant_id,
            (Some(endpoint), None) => endpoint.tenant_id,
            (None, None) => {
                return Err(DeliveryError::not_found(format!("event {}", attempt.event_id)))
            },
        };

        let next_retry_at = match &endpoint {
            Some(endpoint) if attempt.trigger.schedules_retries() => {
                RetryPolicy::for_endpoint(endpoint).decide(attempt.attempt_number, now).next_attempt_at()
            },
            _ => None,
        };

        warn!(
            attempt_id = %attempt.id,
            event_id = %attempt.event_id,
            endpoint_id = %attempt.endpoint_id,
            attempt_number = attempt.attempt_number,
            "recovering interrupted delivery attempt"
        );

        let completion = AttemptCompletion {
            response_status: None,
            response_headers: None,
            response_body: None,
            duration_ms: (now - attempt.created_at).num_milliseconds().max(0),
            succeeded: false,
            error_message: Some(INTERRUPTED_MESSAGE.to_string()),
            next_retry_at,
            completed_at: now,
        };

        self.complete(attempt, tenant_id, completion).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_attempt(
        &self,
        endpoint: &Endpoint,
        event: &Event,
        attempt_number: u32,
        trigger: AttemptTrigger,
        request_headers: BTreeMap<String, String>,
        request_body: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<DeliveryAttempt> {
        let attempt = DeliveryAttempt {
            id: Uuid::new_v4(),
            event_id: event.id,
            endpoint_id: endpoint.id,
            attempt_number,
            trigger,
            request_url: endpoint.url.clone(),
            request_headers,
            request_body,
            response_status: None,
            response_headers: None,
            response_body: None,
            duration_ms: None,
            succeeded: false,
            error_message: None,
            next_retry_at: None,
            retry_claimed_at: None,
            created_at: now,
            completed_at: None,
        };
        self.storage.insert_attempt(attempt.clone()).await?;
        Ok(attempt)
    }

    async fn complete_or_reload(
        &self,
        attempt: &DeliveryAttempt,
        tenant_id: TenantId,
        completion: AttemptCompletion,
    ) -> Result<AttemptOutcome> {
        if let Some(outcome) = self.complete(attempt, tenant_id, completion).await? {
            return Ok(outcome);
        }
        warn!(attempt_id = %attempt.id, "attempt already completed elsewhere");
        let recorded = self
            .storage
            .find_attempt(attempt.id)
            .await?
            .ok_or_else(|| DeliveryError::not_found(format!("attempt {}", attempt.id)))?;
        Ok(AttemptOutcome::from_attempt(&recorded))
    }

    /// Writes the outcome, then counters and notifications. Returns `None`
    /// without side effects if the attempt was already completed.
    async fn complete(
        &self,
        attempt: &DeliveryAttempt,
        tenant_id: TenantId,
        completion: AttemptCompletion,
    ) -> Result<Option<AttemptOutcome>> {
        let completed_at = completion.completed_at;
        let succeeded = completion.succeeded;
        if !self.storage.complete_attempt(attempt.id, completion.clone()).await? {
            return Ok(None);
        }

        self.record_endpoint_outcome(attempt.endpoint_id, succeeded, completed_at).await;

        let outcome = AttemptOutcome {
            attempt_id: attempt.id,
            endpoint_id: attempt.endpoint_id,
            attempt_number: attempt.attempt_number,
            succeeded,
            response_status: completion.response_status.and_then(|s| u16::try_from(s).ok()),
            error_message: completion.error_message.clone(),
            next_retry_at: completion.next_retry_at,
            duration_ms: completion.duration_ms,
        };

        if succeeded {
            info!(
                event_id = %attempt.event_id,
                endpoint_id = %attempt.endpoint_id,
                attempt_number = attempt.attempt_number,
                duration_ms = outcome.duration_ms,
                "delivery succeeded"
            );
            self.event_handler
                .handle_event(DeliveryEvent::AttemptSucceeded(AttemptSucceededEvent {
                    attempt_id: attempt.id,
                    event_id: attempt.event_id,
                    endpoint_id: attempt.endpoint_id,
                    tenant_id,
                    attempt_number: attempt.attempt_number,
                    trigger: attempt.trigger,
                    response_status: outcome.response_status.unwrap_or_default(),
                    duration_ms: outcome.duration_ms,
                    delivered_at: completed_at,
                }))
                .await;
        } else {
            warn!(
                event_id = %attempt.event_id,
                endpoint_id = %attempt.endpoint_id,
                attempt_number = attempt.attempt_number,
                error = outcome.error_message.as_deref().unwrap_or_default(),
                next_retry_at = ?outcome.next_retry_at,
                "delivery failed"
            );
            self.event_handler
                .handle_event(DeliveryEvent::AttemptFailed(AttemptFailedEvent {
                    attempt_id: attempt.id,
                    event_id: attempt.event_id,
                    endpoint_id: attempt.endpoint_id,
                    tenant_id,
                    attempt_number: attempt.attempt_number,
                    trigger: attempt.trigger,
                    response_status: outcome.response_status,
                    error_message: outcome.error_message.clone().unwrap_or_default(),
                    next_retry_at: outcome.next_retry_at,
                    failed_at: completed_at,
                }))
                .await;
        }

        Ok(Some(outcome))
    }

    async fn record_endpoint_outcome(
        &self,
        endpoint_id: EndpointId,
        succeeded: bool,
        at: DateTime<Utc>,
    ) {
        for attempt in 1..=COUNTER_UPDATE_TRIES {
            match self.storage.record_endpoint_outcome(endpoint_id, succeeded, at).await {
                Ok(()) => return,
                Err(e) if attempt < COUNTER_UPDATE_TRIES => {
                    warn!(%endpoint_id, error = %e, attempt, "endpoint counter update failed, retrying");
                    self.clock.sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                },
                Err(e) => {
                    error!(%endpoint_id, error = %e, "endpoint counter update failed");
                },
            }
        }
    }
}

fn completion_from(
    result: Result<DeliveryResponse>,
    elapsed: Duration,
    completed_at: DateTime<Utc>,
) -> AttemptCompletion {
    match result {
        Ok(response) => {
            let duration = if response.duration.is_zero() { elapsed } else { response.duration };
            AttemptCompletion {
                response_status: Some(i32::from(response.status_code)),
                response_headers: Some(response.headers),
                response_body: Some(response.body),
                duration_ms: millis(duration),
                succeeded: response.is_success,
                error_message: (!response.is_success)
                    .then(|| DeliveryError::from_status(response.status_code).to_string()),
                next_retry_at: None,
                completed_at,
            }
        },
        Err(error) => AttemptCompletion {
            response_status: None,
            response_headers: None,
            response_body: None,
            duration_ms: millis(elapsed),
            succeeded: false,
            error_message: Some(error.to_string()),
            next_retry_at: None,
            completed_at,
        },
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use courier_core::{
        signing::verify_signature, EventStatus, EventType, TestClock,
    };
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{client::ClientConfig, storage::mock::MockDeliveryStorage};

    #[derive(Debug, Default)]
    struct Recorder {
        events: Mutex<Vec<DeliveryEvent>>,
    }

    #[async_trait::async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: DeliveryEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Fixture {
        storage: Arc<MockDeliveryStorage>,
        clock: Arc<TestClock>,
        recorder: Arc<Recorder>,
        executor: DeliveryExecutor,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MockDeliveryStorage::new());
        let clock = Arc::new(TestClock::new());
        let recorder = Arc::new(Recorder::default());
        let client = Arc::new(
            DeliveryClient::new(ClientConfig {
                timeout: Duration::from_secs(2),
                ..ClientConfig::default()
            })
            .unwrap(),
        );
        let executor =
            DeliveryExecutor::new(storage.clone(), client, clock.clone(), recorder.clone());
        Fixture { storage, clock, recorder, executor }
    }

    fn endpoint(url: String, now: DateTime<Utc>) -> Endpoint {
        Endpoint {
            id: EndpointId::new(),
            tenant_id: TenantId::new(),
            name: "receiver".to_string(),
            url,
            description: None,
            secret: "a".repeat(64),
            event_types: vec!["*".to_string()],
            is_active: true,
            headers: sqlx::types::Json(BTreeMap::new()),
            max_retries: 3,
            retry_delay_seconds: 60,
            total_deliveries: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            last_triggered_at: None,
            last_success_at: None,
            last_failure_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn event_for(endpoint: &Endpoint, now: DateTime<Utc>) -> Event {
        let mut event = Event::new(
            endpoint.tenant_id,
            EventType::FeedbackCreated,
            json!({"id": 7, "title": "Dark mode"}),
            Some("feedback".to_string()),
            Some("7".to_string()),
            now,
        );
        event.status = EventStatus::Processing;
        event
    }

    async fn seed(fx: &Fixture, url: String) -> (Endpoint, Event) {
        let endpoint = endpoint(url, fx.clock.now_utc());
        let event = event_for(&endpoint, fx.clock.now_utc());
        fx.storage.insert_endpoint(endpoint.clone()).await.unwrap();
        fx.storage.insert_event(event.clone()).await.unwrap();
        (endpoint, event)
    }

    #[tokio::test]
    async fn successful_attempt_sends_signed_body_and_updates_counters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("X-Courier-Event", "feedback.created"))
            .and(header("User-Agent", "Courier-Webhook/1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let fx = fixture();
        let (endpoint, event) = seed(&fx, format!("{}/hook", server.uri())).await;

        let outcome =
            fx.executor.attempt(&endpoint, &event, 1, AttemptTrigger::Dispatch).await.unwrap();

        assert!(outcome.succeeded);
        assert_eq!(outcome.response_status, Some(200));
        assert!(outcome.next_retry_at.is_none());

        let requests = server.received_requests().await.unwrap();
        let request = &requests[0];
        let signature = request.headers.get("X-Courier-Signature").unwrap().to_str().unwrap();
        assert!(verify_signature(&endpoint.secret, &request.body, signature).unwrap());
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["eventID"], event.id.to_string());
        assert_eq!(body["data"]["title"], "Dark mode");

        let attempts = fx.storage.all_attempts().await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].request_body, request.body);
        assert_eq!(attempts[0].response_body.as_deref(), Some("ok"));
        assert!(attempts[0].is_completed());

        let stored = fx.storage.find_endpoint(endpoint.id).await.unwrap().unwrap();
        assert_eq!(stored.total_deliveries, 1);
        assert_eq!(stored.successful_deliveries, 1);
        assert!(stored.last_success_at.is_some());

        let events = fx.recorder.events.lock().unwrap();
        assert!(matches!(events.as_slice(), [DeliveryEvent::AttemptSucceeded(_)]));
    }

    #[tokio::test]
    async fn failed_dispatch_schedules_retry_with_base_delay() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fx = fixture();
        let (endpoint, event) = seed(&fx, server.uri()).await;

        let outcome =
            fx.executor.attempt(&endpoint, &event, 1, AttemptTrigger::Dispatch).await.unwrap();

        assert!(!outcome.succeeded);
        assert_eq!(outcome.response_status, Some(503));
        assert_eq!(
            outcome.next_retry_at,
            Some(fx.clock.now_utc() + chrono::Duration::seconds(60))
        );
        let stored = fx.storage.find_endpoint(endpoint.id).await.unwrap().unwrap();
        assert_eq!(stored.failed_deliveries, 1);
        assert_eq!(stored.successful_deliveries, 0);
    }

    #[tokio::test]
    async fn replay_and_test_attempts_never_schedule_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let fx = fixture();
        let (endpoint, event) = seed(&fx, server.uri()).await;

        let replay =
            fx.executor.attempt(&endpoint, &event, 1, AttemptTrigger::Replay).await.unwrap();
        let test = fx.executor.attempt(&endpoint, &event, 2, AttemptTrigger::Test).await.unwrap();

        assert!(replay.next_retry_at.is_none());
        assert!(test.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn last_attempt_in_budget_does_not_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let fx = fixture();
        let (endpoint, event) = seed(&fx, server.uri()).await;

        let outcome =
            fx.executor.attempt(&endpoint, &event, 3, AttemptTrigger::Retry).await.unwrap();

        assert!(!outcome.succeeded);
        assert!(outcome.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn connection_failure_is_recorded_not_returned() {
        let fx = fixture();
        let (endpoint, event) = seed(&fx, "http://127.0.0.1:1/unreachable".to_string()).await;

        let outcome =
            fx.executor.attempt(&endpoint, &event, 1, AttemptTrigger::Dispatch).await.unwrap();

        assert!(!outcome.succeeded);
        assert!(outcome.response_status.is_none());
        assert!(outcome.error_message.is_some());
        assert!(outcome.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_attempt_number_is_a_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let fx = fixture();
        let (endpoint, event) = seed(&fx, server.uri()).await;
        fx.executor.attempt(&endpoint, &event, 1, AttemptTrigger::Dispatch).await.unwrap();

        let result = fx.executor.attempt(&endpoint, &event, 1, AttemptTrigger::Dispatch).await;

        assert!(matches!(result, Err(DeliveryError::Conflict { .. })));
    }

    #[tokio::test]
    async fn custom_headers_override_engine_headers_but_not_transport_headers() {
        let fx = fixture();
        let mut endpoint = endpoint("https://example.com".to_string(), fx.clock.now_utc());
        let mut custom = BTreeMap::new();
        custom.insert("content-type".to_string(), "application/vnd.courier+json".to_string());
        custom.insert("Host".to_string(), "evil.example.com".to_string());
        custom.insert("Authorization".to_string(), "Bearer abc".to_string());
        endpoint.headers = sqlx::types::Json(custom);
        let event = event_for(&endpoint, fx.clock.now_utc());

        let headers =
            build_headers(&endpoint, &event, Some("sha256=00"), "Courier-Webhook/1.0", fx.clock.now_utc());

        assert_eq!(headers.get("content-type").map(String::as_str), Some("application/vnd.courier+json"));
        assert!(!headers.contains_key("Content-Type"));
        assert!(!headers.keys().any(|k| k.eq_ignore_ascii_case("host")));
        assert_eq!(headers.get("Authorization").map(String::as_str), Some("Bearer abc"));
        assert_eq!(
            headers.get(TIMESTAMP_HEADER),
            Some(&fx.clock.now_utc().timestamp().to_string())
        );
    }

    #[tokio::test]
    async fn interrupted_attempt_is_recovered_once() {
        let fx = fixture();
        let (endpoint, event) = seed(&fx, "https://example.com".to_string()).await;
        let attempt = DeliveryAttempt {
            id: Uuid::new_v4(),
            event_id: event.id,
            endpoint_id: endpoint.id,
            attempt_number: 1,
            trigger: AttemptTrigger::Dispatch,
            request_url: endpoint.url.clone(),
            request_headers: BTreeMap::new(),
            request_body: Vec::new(),
            response_status: None,
            response_headers: None,
            response_body: None,
            duration_ms: None,
            succeeded: false,
            error_message: None,
            next_retry_at: None,
            retry_claimed_at: None,
            created_at: fx.clock.now_utc(),
            completed_at: None,
        };
        fx.storage.put_attempt(attempt.clone()).await;
        fx.clock.advance(Duration::from_secs(120));

        let first = fx.executor.recover_interrupted(&attempt).await.unwrap();
        let second = fx.executor.recover_interrupted(&attempt).await.unwrap();

        let first = first.unwrap();
        assert_eq!(first.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert!(first.next_retry_at.is_some());
        assert!(second.is_none());
        let stored = fx.storage.find_endpoint(endpoint.id).await.unwrap().unwrap();
        assert_eq!(stored.failed_deliveries, 1);
    }

    #[test]
    fn envelope_uses_second_precision_utc_timestamp() {
        let now = DateTime::parse_from_rfc3339("2024-03-01T12:30:45.123Z").unwrap().with_timezone(&Utc);
        let endpoint = endpoint("https://example.com".to_string(), now);
        let event = event_for(&endpoint, now);

        let envelope = build_envelope(&event, now);

        assert_eq!(envelope["timestamp"], "2024-03-01T12:30:45Z");
        assert_eq!(envelope["event"], "feedback.created");
    }
}
