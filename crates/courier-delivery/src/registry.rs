//! Endpoint registry: tenant-owned delivery targets.
//!
//! All configuration is validated here, before it reaches storage, so the
//! dispatcher and executor can trust what they read back.

use std::{collections::BTreeMap, sync::Arc};

use courier_core::{
    models::{validate_subscription, EndpointUpdate},
    signing::generate_secret,
    Clock, Endpoint, EndpointId, EventType, TenantId,
};
use reqwest::{
    header::{HeaderName, HeaderValue},
    Url,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
    client::is_managed_header,
    error::{DeliveryError, Result},
    storage::DeliveryStorage,
};

/// Defaults applied when a new endpoint leaves retry settings unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDefaults {
    /// Default attempt budget.
    pub max_retries: i32,
    /// Default base retry delay in seconds.
    pub retry_delay_seconds: i32,
}

impl Default for RegistryDefaults {
    fn default() -> Self {
        Self {
            max_retries: crate::DEFAULT_MAX_RETRIES,
            retry_delay_seconds: crate::DEFAULT_RETRY_DELAY_SECONDS,
        }
    }
}

/// Input for [`EndpointRegistry::create`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewEndpoint {
    /// Display name.
    pub name: String,
    /// Target URL.
    pub url: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Subscribed event type tags, possibly `*`.
    pub event_types: Vec<String>,
    /// Static headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Attempt budget; registry default when absent.
    #[serde(default)]
    pub max_retries: Option<i32>,
    /// Base retry delay in seconds; registry default when absent.
    #[serde(default)]
    pub retry_delay_seconds: Option<i32>,
    /// Initial active flag; active when absent.
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Endpoint registry over [`DeliveryStorage`].
#[derive(Clone)]
pub struct EndpointRegistry {
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
    defaults: RegistryDefaults,
}

impl EndpointRegistry {
    /// Creates a registry.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        clock: Arc<dyn Clock>,
        defaults: RegistryDefaults,
    ) -> Self {
        Self { storage, clock, defaults }
    }

    /// Registers a new endpoint with a freshly generated secret.
    ///
    /// The returned endpoint carries the secret; it is never returned by any
    /// other read.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` for invalid input and `DatabaseError` if
    /// the insert fails.
    #[instrument(skip(self, input), fields(tenant_id = %tenant_id))]
    pub async fn create(&self, tenant_id: TenantId, input: NewEndpoint) -> Result<Endpoint> {
        let now = self.clock.now_utc();
        let endpoint = Endpoint {
            id: EndpointId::new(),
            tenant_id,
            name: validate_name(&input.name)?,
            url: validate_url(&input.url)?,
            description: input.description,
            secret: generate_secret(),
            event_types: validate_event_types(&input.event_types)?,
            is_active: input.is_active.unwrap_or(true),
            headers: sqlx_json(validate_headers(input.headers)?),
            max_retries: validate_max_retries(input.max_retries.unwrap_or(self.defaults.max_retries))?,
            retry_delay_seconds: validate_retry_delay(
                input.retry_delay_seconds.unwrap_or(self.defaults.retry_delay_seconds),
            )?,
            total_deliveries: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            last_triggered_at: None,
            last_success_at: None,
            last_failure_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        self.storage.insert_endpoint(endpoint.clone()).await?;
        info!(endpoint_id = %endpoint.id, "endpoint registered");
        Ok(endpoint)
    }

    /// Fetches a tenant's endpoint.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the endpoint is missing, deleted, or owned by
    /// another tenant.
    pub async fn get(&self, tenant_id: TenantId, id: EndpointId) -> Result<Endpoint> {
        match self.storage.find_endpoint(id).await? {
            Some(endpoint) if endpoint.tenant_id == tenant_id && endpoint.deleted_at.is_none() => {
                Ok(endpoint)
            },
            _ => Err(DeliveryError::not_found(format!("endpoint {id}"))),
        }
    }

    /// Lists a tenant's endpoints.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    pub async fn list(&self, tenant_id: TenantId) -> Result<Vec<Endpoint>> {
        Ok(self.storage.list_endpoints(tenant_id).await?)
    }

    /// Applies a partial update.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `ConfigurationError`.
    #[instrument(skip(self, update), fields(tenant_id = %tenant_id, endpoint_id = %id))]
    pub async fn update(
        &self,
        tenant_id: TenantId,
        id: EndpointId,
        update: EndpointUpdate,
    ) -> Result<Endpoint> {
        let mut endpoint = self.get(tenant_id, id).await?;

        if let Some(name) = update.name {
            endpoint.name = validate_name(&name)?;
        }
        if let Some(url) = update.url {
            endpoint.url = validate_url(&url)?;
        }
        if let Some(description) = update.description {
            endpoint.description = description;
        }
        if let Some(event_types) = update.event_types {
            endpoint.event_types = validate_event_types(&event_types)?;
        }
        if let Some(is_active) = update.is_active {
            endpoint.is_active = is_active;
        }
        if let Some(headers) = update.headers {
            endpoint.headers = sqlx_json(validate_headers(headers)?);
        }
        if let Some(max_retries) = update.max_retries {
            endpoint.max_retries = validate_max_retries(max_retries)?;
        }
        if let Some(retry_delay_seconds) = update.retry_delay_seconds {
            endpoint.retry_delay_seconds = validate_retry_delay(retry_delay_seconds)?;
        }
        endpoint.updated_at = self.clock.now_utc();

        if !self.storage.update_endpoint(endpoint.clone()).await? {
            return Err(DeliveryError::not_found(format!("endpoint {id}")));
        }
        info!("endpoint updated");
        Ok(endpoint)
    }

    /// Activates or deactivates an endpoint.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the endpoint is not the tenant's.
    pub async fn set_active(
        &self,
        tenant_id: TenantId,
        id: EndpointId,
        is_active: bool,
    ) -> Result<Endpoint> {
        self.update(tenant_id, id, EndpointUpdate { is_active: Some(is_active), ..Default::default() })
            .await
    }

    /// Soft-deletes an endpoint. Its attempts stay in the audit trail.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the endpoint is not the tenant's.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, endpoint_id = %id))]
    pub async fn delete(&self, tenant_id: TenantId, id: EndpointId) -> Result<()> {
        self.get(tenant_id, id).await?;
        if !self.storage.soft_delete_endpoint(id, self.clock.now_utc()).await? {
            return Err(DeliveryError::not_found(format!("endpoint {id}")));
        }
        info!("endpoint deleted");
        Ok(())
    }

    /// Replaces the secret and returns the new one.
    ///
    /// Attempts already recorded keep the signature computed with the old
    /// secret.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the endpoint is not the tenant's.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, endpoint_id = %id))]
    pub async fn rotate_secret(&self, tenant_id: TenantId, id: EndpointId) -> Result<String> {
        self.get(tenant_id, id).await?;
        let secret = generate_secret();
        if !self.storage.rotate_endpoint_secret(id, secret.clone(), self.clock.now_utc()).await? {
            return Err(DeliveryError::not_found(format!("endpoint {id}")));
        }
        info!("endpoint secret rotated");
        Ok(secret)
    }

    /// Active endpoints of `tenant_id` subscribed to `event_type`.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    pub async fn list_active_subscribers(
        &self,
        tenant_id: TenantId,
        event_type: EventType,
    ) -> Result<Vec<Endpoint>> {
        Ok(self.storage.find_active_subscribers(tenant_id, event_type).await?)
    }
}

/// Whether `endpoint` receives `event_type`, directly or through `*`.
pub fn is_subscribed(endpoint: &Endpoint, event_type: EventType) -> bool {
    endpoint.is_subscribed(event_type)
}

fn sqlx_json<T>(value: T) -> sqlx::types::Json<T> {
    sqlx::types::Json(value)
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(DeliveryError::configuration("name must not be empty"));
    }
    Ok(name.to_string())
}

fn validate_url(url: &str) -> Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(DeliveryError::configuration("url must not be empty"));
    }
    let parsed =
        Url::parse(url).map_err(|e| DeliveryError::configuration(format!("invalid url: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(DeliveryError::configuration("url scheme must be http or https"));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(DeliveryError::configuration("url must include a host"));
    }
    Ok(url.to_string())
}

fn validate_event_types(event_types: &[String]) -> Result<Vec<String>> {
    if event_types.is_empty() {
        return Err(DeliveryError::configuration("at least one event type is required"));
    }
    let mut validated: Vec<String> = Vec::with_capacity(event_types.len());
    for entry in event_types {
        validate_subscription(entry)?;
        if !validated.contains(entry) {
            validated.push(entry.clone());
        }
    }
    Ok(validated)
}

fn validate_headers(headers: BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
    for (name, value) in &headers {
        if HeaderName::from_bytes(name.as_bytes()).is_err() {
            return Err(DeliveryError::configuration(format!("invalid header name: {name}")));
        }
        if HeaderValue::from_str(value).is_err() {
            return Err(DeliveryError::configuration(format!("invalid value for header {name}")));
        }
        if is_managed_header(name) {
            return Err(DeliveryError::configuration(format!("header {name} cannot be set")));
        }
    }
    Ok(headers)
}

fn validate_max_retries(max_retries: i32) -> Result<i32> {
    if max_retries < 0 {
        return Err(DeliveryError::configuration("max_retries must be >= 0"));
    }
    Ok(max_retries)
}

fn validate_retry_delay(retry_delay_seconds: i32) -> Result<i32> {
    if retry_delay_seconds < 1 {
        return Err(DeliveryError::configuration("retry_delay_seconds must be >= 1"));
    }
    Ok(retry_delay_seconds)
}
