//! Core domain models and strongly-typed identifiers.
//!
//! Defines endpoints, events, delivery attempts, and newtype ID wrappers for
//! compile-time type safety. Includes database serialization traits and the
//! event status state machine for the delivery pipeline.

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Subscription entry matching every event type.
pub const WILDCARD_SUBSCRIPTION: &str = "*";

/// Strongly-typed event identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. Receivers deduplicate
/// on this value, so it is also sent as the delivery id header.
///
/// # Example
///
/// ```
/// use courier_core::models::EventId;
/// let event_id = EventId::new();
/// println!("Dispatching event: {}", event_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed tenant identifier.
///
/// Every endpoint and event is scoped to exactly one tenant. The engine never
/// delivers an event to an endpoint owned by a different tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub Uuid);

impl TenantId {
    /// Creates a new random tenant ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TenantId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for TenantId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for TenantId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for TenantId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed endpoint identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub Uuid);

impl EndpointId {
    /// Creates a new random endpoint ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EndpointId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for EndpointId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EndpointId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for EndpointId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Closed catalog of event kinds that can be broadcast to endpoints.
///
/// Adding a kind means adding a variant here; the match arms below keep the
/// wire tags and descriptions statically auditable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A feedback record was created.
    #[serde(rename = "feedback.created")]
    FeedbackCreated,
    /// A feedback record was edited.
    #[serde(rename = "feedback.updated")]
    FeedbackUpdated,
    /// A feedback record moved to a different workflow status.
    #[serde(rename = "feedback.status_changed")]
    FeedbackStatusChanged,
    /// A feedback record was removed.
    #[serde(rename = "feedback.deleted")]
    FeedbackDeleted,
    /// A comment was posted on a feedback record.
    #[serde(rename = "comment.created")]
    CommentCreated,
    /// A vote was cast on a feedback record.
    #[serde(rename = "vote.created")]
    VoteCreated,
    /// A subscription was started.
    #[serde(rename = "subscription.created")]
    SubscriptionCreated,
    /// A subscription was cancelled.
    #[serde(rename = "subscription.cancelled")]
    SubscriptionCancelled,
    /// Synthetic event sent from the management surface.
    #[serde(rename = "webhook.test")]
    WebhookTest,
}

impl EventType {
    /// Every event type, in catalog order.
    pub const ALL: [Self; 9] = [
        Self::FeedbackCreated,
        Self::FeedbackUpdated,
        Self::FeedbackStatusChanged,
        Self::FeedbackDeleted,
        Self::CommentCreated,
        Self::VoteCreated,
        Self::SubscriptionCreated,
        Self::SubscriptionCancelled,
        Self::WebhookTest,
    ];

    /// Wire tag, e.g. `feedback.created`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FeedbackCreated => "feedback.created",
            Self::FeedbackUpdated => "feedback.updated",
            Self::FeedbackStatusChanged => "feedback.status_changed",
            Self::FeedbackDeleted => "feedback.deleted",
            Self::CommentCreated => "comment.created",
            Self::VoteCreated => "vote.created",
            Self::SubscriptionCreated => "subscription.created",
            Self::SubscriptionCancelled => "subscription.cancelled",
            Self::WebhookTest => "webhook.test",
        }
    }

    /// Human-readable description for subscription pickers.
    pub const fn description(self) -> &'static str {
        match self {
            Self::FeedbackCreated => "New feedback was submitted",
            Self::FeedbackUpdated => "Feedback title or body was edited",
            Self::FeedbackStatusChanged => "Feedback moved to a different status",
            Self::FeedbackDeleted => "Feedback was deleted",
            Self::CommentCreated => "A comment was added to feedback",
            Self::VoteCreated => "A vote was cast on feedback",
            Self::SubscriptionCreated => "A subscription was started",
            Self::SubscriptionCancelled => "A subscription was cancelled",
            Self::WebhookTest => "Test event sent from endpoint settings",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == s)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown event type: {s}")))
    }
}

impl sqlx::Type<PgDb> for EventType {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventType {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse::<Self>().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for EventType {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Checks that a subscription entry is either the wildcard or a known type.
///
/// # Errors
///
/// Returns `CoreError::InvalidInput` for unknown event type tags.
pub fn validate_subscription(entry: &str) -> crate::Result<()> {
    if entry == WILDCARD_SUBSCRIPTION {
        return Ok(());
    }
    entry.parse::<EventType>().map(|_| ())
}

/// Event lifecycle status.
///
/// Transitions are one-way:
///
/// ```text
/// Pending -> Processing -> Delivered
///                      |-> Failed
///                      +-> Partial
/// ```
///
/// The terminal value reflects the first fan-out round only; later retries
/// never rewrite it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Persisted, waiting for a dispatcher worker.
    Pending,
    /// Claimed by a dispatcher worker, first round in progress.
    Processing,
    /// Every matching endpoint accepted the first attempt, or none matched.
    Delivered,
    /// Every matching endpoint rejected the first attempt.
    Failed,
    /// Some endpoints accepted the first attempt and some did not.
    Partial,
}

impl EventStatus {
    /// Whether this status is final.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Partial)
    }

    /// Whether moving from `self` to `next` respects the state machine.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Delivered | Self::Failed | Self::Partial)
        )
    }

    /// Aggregates per-endpoint outcomes of one fan-out round.
    ///
    /// Zero endpoints yields `Delivered`: nothing failed.
    pub const fn from_round(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) => Self::Delivered,
            (0, _) => Self::Failed,
            _ => Self::Partial,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

impl sqlx::Type<PgDb> for EventStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "partial" => Ok(Self::Partial),
            _ => Err(format!("invalid event status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for EventStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// What caused a delivery attempt to be made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptTrigger {
    /// First attempt of a fan-out round.
    Dispatch,
    /// Scheduled retry after a failed attempt.
    Retry,
    /// Operator-requested replay of a failed attempt.
    Replay,
    /// Synthetic test event from the management surface.
    Test,
}

impl AttemptTrigger {
    /// Whether a failure of this attempt hands off to the retry scheduler.
    pub const fn schedules_retries(self) -> bool {
        matches!(self, Self::Dispatch | Self::Retry)
    }
}

impl fmt::Display for AttemptTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatch => write!(f, "dispatch"),
            Self::Retry => write!(f, "retry"),
            Self::Replay => write!(f, "replay"),
            Self::Test => write!(f, "test"),
        }
    }
}

impl sqlx::Type<PgDb> for AttemptTrigger {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AttemptTrigger {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "dispatch" => Ok(Self::Dispatch),
            "retry" => Ok(Self::Retry),
            "replay" => Ok(Self::Replay),
            "test" => Ok(Self::Test),
            _ => Err(format!("invalid attempt trigger: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for AttemptTrigger {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Tenant-owned delivery target.
///
/// Holds the signing secret, subscription set, retry policy and lifetime
/// counters. Counters and `last_*` timestamps are only written by the
/// delivery executor through atomic increments.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Endpoint {
    /// Unique identifier for this endpoint.
    pub id: EndpointId,

    /// Tenant that owns this endpoint.
    pub tenant_id: TenantId,

    /// Human-readable endpoint name.
    pub name: String,

    /// Target URL receiving POST requests.
    pub url: String,

    /// Free-form description.
    pub description: Option<String>,

    /// HMAC signing secret, hex encoded.
    ///
    /// Only replaced through secret rotation. Never serialized.
    #[serde(skip_serializing, default)]
    pub secret: String,

    /// Subscribed event type tags, possibly containing `*`.
    pub event_types: Vec<String>,

    /// Inactive endpoints are never selected for new events.
    pub is_active: bool,

    /// Static headers added to every request.
    pub headers: sqlx::types::Json<BTreeMap<String, String>>,

    /// Attempt budget per event: a failed attempt `n` is retried only while
    /// `n < max_retries`.
    pub max_retries: i32,

    /// Base retry delay in seconds, doubled for each later attempt.
    pub retry_delay_seconds: i32,

    /// Lifetime count of completed attempts.
    pub total_deliveries: i64,

    /// Lifetime count of successful attempts.
    pub successful_deliveries: i64,

    /// Lifetime count of failed attempts.
    pub failed_deliveries: i64,

    /// When an attempt last completed.
    pub last_triggered_at: Option<DateTime<Utc>>,

    /// When an attempt last succeeded.
    pub last_success_at: Option<DateTime<Utc>>,

    /// When an attempt last failed.
    pub last_failure_at: Option<DateTime<Utc>>,

    /// When this endpoint was created.
    pub created_at: DateTime<Utc>,

    /// When configuration was last modified.
    pub updated_at: DateTime<Utc>,

    /// Soft delete timestamp. Deleted endpoints keep their audit trail.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Endpoint {
    /// Whether this endpoint receives events of the given type.
    pub fn is_subscribed(&self, event_type: EventType) -> bool {
        self.event_types
            .iter()
            .any(|entry| entry == WILDCARD_SUBSCRIPTION || entry == event_type.as_str())
    }

    /// Whether the dispatcher may select this endpoint.
    pub fn is_dispatchable(&self) -> bool {
        self.is_active && self.deleted_at.is_none()
    }

    /// Custom static headers.
    pub fn custom_headers(&self) -> &BTreeMap<String, String> {
        &self.headers.0
    }

    /// Base retry delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.retry_delay_seconds).unwrap_or(0))
    }

    /// Maximum attempts as an unsigned budget.
    pub fn attempt_budget(&self) -> u32 {
        u32::try_from(self.max_retries).unwrap_or(0)
    }
}

/// One fact broadcast to zero or more endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    /// Unique identifier for this event.
    pub id: EventId,

    /// Tenant whose endpoints receive this event.
    pub tenant_id: TenantId,

    /// Kind of event.
    pub event_type: EventType,

    /// Opaque structured payload, sent as `data`.
    pub payload: sqlx::types::Json<serde_json::Value>,

    /// Originating entity type, for traceability.
    pub origin_model: Option<String>,

    /// Originating entity id, for traceability.
    pub origin_id: Option<String>,

    /// First-round delivery status.
    pub status: EventStatus,

    /// When the event was created.
    pub created_at: DateTime<Utc>,

    /// When a dispatcher worker last claimed the event.
    pub claimed_at: Option<DateTime<Utc>>,

    /// When the event reached a terminal status.
    pub processed_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Creates a pending event.
    pub fn new(
        tenant_id: TenantId,
        event_type: EventType,
        payload: serde_json::Value,
        origin_model: Option<String>,
        origin_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::new(),
            tenant_id,
            event_type,
            payload: sqlx::types::Json(payload),
            origin_model,
            origin_id,
            status: EventStatus::Pending,
            created_at,
            claimed_at: None,
            processed_at: None,
        }
    }

    /// Payload as a JSON value.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload.0
    }
}

/// Audit record of one HTTP call for one (event, endpoint) pair.
///
/// Inserted before the call is issued and completed exactly once with the
/// outcome. History is never rewritten; replays insert a new attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Unique identifier for this attempt.
    pub id: Uuid,

    /// Event being delivered.
    pub event_id: EventId,

    /// Endpoint this attempt was made to.
    pub endpoint_id: EndpointId,

    /// Sequential attempt number for this pair, starting at 1.
    pub attempt_number: u32,

    /// What caused this attempt.
    pub trigger: AttemptTrigger,

    /// URL the request was sent to.
    pub request_url: String,

    /// HTTP headers sent with the request, signature included.
    pub request_headers: BTreeMap<String, String>,

    /// Exact request body bytes that were signed and sent.
    pub request_body: Vec<u8>,

    /// HTTP status code received, if any.
    pub response_status: Option<i32>,

    /// Response headers received.
    pub response_headers: Option<BTreeMap<String, String>>,

    /// Response body, truncated to the configured limit.
    pub response_body: Option<String>,

    /// Wall-clock duration of the call in milliseconds.
    pub duration_ms: Option<i64>,

    /// True for 2xx responses.
    pub succeeded: bool,

    /// Human-readable failure description.
    pub error_message: Option<String>,

    /// When the next attempt for this pair is due, if one was scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// When the retry scheduler last claimed this attempt's retry.
    pub retry_claimed_at: Option<DateTime<Utc>>,

    /// When the attempt row was inserted.
    pub created_at: DateTime<Utc>,

    /// When the outcome was recorded. `None` while in flight.
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeliveryAttempt {
    /// Whether the outcome has been recorded.
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Whether a follow-up attempt is scheduled for this pair.
    pub fn has_pending_retry(&self) -> bool {
        self.next_retry_at.is_some()
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeliveryAttempt {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let request_headers: sqlx::types::Json<BTreeMap<String, String>> =
            row.try_get("request_headers")?;
        let response_headers: Option<sqlx::types::Json<BTreeMap<String, String>>> =
            row.try_get("response_headers")?;

        Ok(Self {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            endpoint_id: row.try_get("endpoint_id")?,
            attempt_number: {
                let val: i32 = row.try_get("attempt_number")?;
                val.try_into()
                    .map_err(|_| sqlx::Error::Decode("attempt_number cannot be negative".into()))?
            },
            trigger: row.try_get("attempt_trigger")?,
            request_url: row.try_get("request_url")?,
            request_headers: request_headers.0,
            request_body: row.try_get("request_body")?,
            response_status: row.try_get("response_status")?,
            response_headers: response_headers.map(|h| h.0),
            response_body: row.try_get("response_body")?,
            duration_ms: row.try_get("duration_ms")?,
            succeeded: row.try_get("succeeded")?,
            error_message: row.try_get("error_message")?,
            next_retry_at: row.try_get("next_retry_at")?,
            retry_claimed_at: row.try_get("retry_claimed_at")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

/// Outcome written onto an in-flight attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptCompletion {
    /// HTTP status code, if a response arrived.
    pub response_status: Option<i32>,
    /// Response headers, if a response arrived.
    pub response_headers: Option<BTreeMap<String, String>>,
    /// Truncated response body.
    pub response_body: Option<String>,
    /// Duration of the call in milliseconds.
    pub duration_ms: i64,
    /// True for 2xx responses.
    pub succeeded: bool,
    /// Failure description.
    pub error_message: Option<String>,
    /// Due time of the follow-up attempt, if one is scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When the outcome was observed.
    pub completed_at: DateTime<Utc>,
}

/// Partial endpoint update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointUpdate {
    /// New display name.
    pub name: Option<String>,
    /// New target URL.
    pub url: Option<String>,
    /// New description. `Some(None)` clears it; JSON `null` maps to that.
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    /// New subscription set.
    pub event_types: Option<Vec<String>>,
    /// New active flag.
    pub is_active: Option<bool>,
    /// New custom headers, replacing the old set.
    pub headers: Option<BTreeMap<String, String>>,
    /// New attempt budget.
    pub max_retries: Option<i32>,
    /// New base retry delay in seconds.
    pub retry_delay_seconds: Option<i32>,
}

/// Distinguishes an explicit `null` from an absent field.
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Aggregate delivery statistics for one tenant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStats {
    /// Endpoints that are not deleted.
    pub endpoint_count: i64,
    /// Endpoints that are active and not deleted.
    pub active_endpoint_count: i64,
    /// Events created since the start of the current UTC day.
    pub events_today: i64,
    /// Attempts created since the start of the current UTC day.
    pub deliveries_today: i64,
    /// Fraction of completed attempts in the window that succeeded.
    pub success_rate: f64,
    /// Mean attempt duration in the window, in milliseconds.
    pub average_response_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint_with(event_types: &[&str]) -> Endpoint {
        let now = Utc::now();
        Endpoint {
            id: EndpointId::new(),
            tenant_id: TenantId::new(),
            name: "orders".to_string(),
            url: "https://example.com/hook".to_string(),
            description: None,
            secret: "00".repeat(32),
            event_types: event_types.iter().map(ToString::to_string).collect(),
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

    #[test]
    fn event_type_tags_round_trip_through_from_str() {
        for event_type in EventType::ALL {
            assert_eq!(event_type.as_str().parse::<EventType>().unwrap(), event_type);
        }
        assert!("feedback.exploded".parse::<EventType>().is_err());
    }

    #[test]
    fn event_type_serializes_as_wire_tag() {
        let json = serde_json::to_string(&EventType::FeedbackStatusChanged).unwrap();
        assert_eq!(json, "\"feedback.status_changed\"");
    }

    #[test]
    fn wildcard_subscribes_to_everything() {
        let endpoint = endpoint_with(&["*"]);
        for event_type in EventType::ALL {
            assert!(endpoint.is_subscribed(event_type));
        }
    }

    #[test]
    fn explicit_subscription_is_exact() {
        let endpoint = endpoint_with(&["feedback.created", "vote.created"]);
        assert!(endpoint.is_subscribed(EventType::FeedbackCreated));
        assert!(endpoint.is_subscribed(EventType::VoteCreated));
        assert!(!endpoint.is_subscribed(EventType::FeedbackDeleted));
    }

    #[test]
    fn subscription_validation_accepts_wildcard_and_known_tags() {
        assert!(validate_subscription("*").is_ok());
        assert!(validate_subscription("comment.created").is_ok());
        assert!(validate_subscription("comment.*").is_err());
    }

    #[test]
    fn round_status_aggregation() {
        assert_eq!(EventStatus::from_round(0, 0), EventStatus::Delivered);
        assert_eq!(EventStatus::from_round(3, 0), EventStatus::Delivered);
        assert_eq!(EventStatus::from_round(0, 2), EventStatus::Failed);
        assert_eq!(EventStatus::from_round(1, 1), EventStatus::Partial);
    }

    #[test]
    fn terminal_statuses_have_no_outgoing_transitions() {
        let all = [
            EventStatus::Pending,
            EventStatus::Processing,
            EventStatus::Delivered,
            EventStatus::Failed,
            EventStatus::Partial,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
        assert!(EventStatus::Pending.can_transition_to(EventStatus::Processing));
        assert!(!EventStatus::Pending.can_transition_to(EventStatus::Delivered));
    }

    #[test]
    fn deleted_endpoint_is_not_dispatchable() {
        let mut endpoint = endpoint_with(&["*"]);
        assert!(endpoint.is_dispatchable());
        endpoint.deleted_at = Some(Utc::now());
        assert!(!endpoint.is_dispatchable());
    }

    #[test]
    fn secret_is_never_serialized() {
        let endpoint = endpoint_with(&["*"]);
        let json = serde_json::to_value(&endpoint).unwrap();
        assert!(json.get("secret").is_none());
    }

    #[test]
    fn update_distinguishes_null_description_from_absent() {
        let cleared: EndpointUpdate = serde_json::from_str(r#"{"description": null}"#).unwrap();
        assert_eq!(cleared.description, Some(None));

        let untouched: EndpointUpdate = serde_json::from_str(r#"{"name": "billing"}"#).unwrap();
        assert_eq!(untouched.description, None);
    }
}
