//! FHIR server gateway.
//!
//! [`DeliveryGateway`] is the seam between the worker and the downstream
//! server. [`FhirClient`] speaks HTTP to a real server; [`mock::MockGateway`]
//! records calls and replays scripted outcomes for tests.

use std::{future::Future, pin::Pin, time::Duration};

use metrics::{counter, histogram};
use reqwest::{
    header::{ACCEPT, CONTENT_TYPE},
    Url,
};
use serde::{Deserialize, Serialize};
use sluice_core::ResourceRef;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    error::{DeliveryError, ErrorCategory, Result},
    mapper::PatientResource,
    telemetry,
};

const FHIR_JSON: &str = "application/fhir+json";

/// Writes patient resources to the downstream server.
pub trait DeliveryGateway: Send + Sync + 'static {
    /// Create-or-replace the resource matched by `system|value`.
    fn deliver_conditional<'a>(
        &'a self,
        system: &'a str,
        value: &'a str,
        resource: &'a PatientResource,
    ) -> Pin<Box<dyn Future<Output = Result<ResourceRef>> + Send + 'a>>;

    /// Replace the resource with logical id `resource_id`.
    fn deliver_by_id<'a>(
        &'a self,
        resource_id: &'a str,
        resource: &'a PatientResource,
    ) -> Pin<Box<dyn Future<Output = Result<ResourceRef>> + Send + 'a>>;
}

/// HTTP client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the FHIR server, e.g. `https://fhir.example.org/fhir/`.
    pub base_url: String,
    /// Per-request timeout. Must stay below the claim lease.
    pub timeout: Duration,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: crate::DEFAULT_FHIR_SERVER.to_string(),
            timeout: Duration::from_millis(crate::DEFAULT_DELIVERY_TIMEOUT_MS),
            user_agent: concat!("sluice/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResourceBody {
    id: Option<String>,
    meta: Option<ResourceMeta>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceMeta {
    version_id: Option<String>,
}

/// Gateway backed by a FHIR REST server.
#[derive(Debug, Clone)]
pub struct FhirClient {
    client: reqwest::Client,
    base_url: Url,
    config: ClientConfig,
}

impl FhirClient {
    /// Creates a client for the configured server.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the base URL does not
    /// parse or the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            DeliveryError::configuration(format!("invalid FHIR base URL {:?}: {e}", config.base_url))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(DeliveryError::configuration(format!(
                "FHIR base URL {:?} cannot carry a path",
                config.base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, base_url, config })
    }

    /// Base URL requests are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn resource_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| DeliveryError::configuration("FHIR base URL cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn put(
        &self,
        url: Url,
        query: Option<(&str, String)>,
        resource: &PatientResource,
    ) -> Result<ResourceRef> {
        let started = std::time::Instant::now();
        let result = self.send(url, query, resource).await;
        histogram!(telemetry::FHIR_CALL_LATENCY_SECONDS).record(started.elapsed().as_secs_f64());

        if let Err(error) = &result {
            let kind = ErrorCategory::from(error).as_str();
            counter!(telemetry::FHIR_CALL_ERRORS_TOTAL, "kind" => kind).increment(1);
            warn!(
                status = error.status_code(),
                duration_ms = started.elapsed().as_millis(),
                error = %error,
                "FHIR call failed"
            );
        }

        result
    }

    async fn send(
        &self,
        url: Url,
        query: Option<(&str, String)>,
        resource: &PatientResource,
    ) -> Result<ResourceRef> {
        let body = serde_json::to_vec(resource)
            .map_err(|e| DeliveryError::configuration(format!("unserializable resource: {e}")))?;

        let mut request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, FHIR_JSON)
            .header(ACCEPT, FHIR_JSON)
            .body(body);
        if let Some(pair) = query {
            request = request.query(&[pair]);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::timeout(
                    u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
                )
            } else {
                DeliveryError::network(e.to_string())
            }
        })?;

        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) if status.is_success() => {
                warn!(error = %e, "failed to read FHIR response body");
                return Ok(ResourceRef::default());
            },
            Err(e) => return Err(DeliveryError::from_status(status.as_u16(), e.to_string())),
        };

        if !status.is_success() {
            return Err(DeliveryError::from_status(
                status.as_u16(),
                String::from_utf8_lossy(&bytes).into_owned(),
            ));
        }

        let parsed = serde_json::from_slice::<ResourceBody>(&bytes).unwrap_or_else(|e| {
            warn!(error = %e, status = status.as_u16(), "FHIR response body is not a resource");
            ResourceBody::default()
        });
        debug!(status = status.as_u16(), id = ?parsed.id, "FHIR write accepted");

        Ok(ResourceRef {
            id: parsed.id,
            version: parsed.meta.and_then(|meta| meta.version_id),
        })
    }
}

impl DeliveryGateway for FhirClient {
    fn deliver_conditional<'a>(
        &'a self,
        system: &'a str,
        value: &'a str,
        resource: &'a PatientResource,
    ) -> Pin<Box<dyn Future<Output = Result<ResourceRef>> + Send + 'a>> {
        let span = info_span!("fhir_delivery", mode = "conditional", identifier_system = %system);
        Box::pin(
            async move {
                let url = self.resource_url(&["Patient"])?;
                self.put(url, Some(("identifier", format!("{system}|{value}"))), resource).await
            }
            .instrument(span),
        )
    }

    fn deliver_by_id<'a>(
        &'a self,
        resource_id: &'a str,
        resource: &'a PatientResource,
    ) -> Pin<Box<dyn Future<Output = Result<ResourceRef>> + Send + 'a>> {
        let span = info_span!("fhir_delivery", mode = "by_id", resource_id = %resource_id);
        Box::pin(
            async move {
                let url = self.resource_url(&["Patient", resource_id])?;
                self.put(url, None, resource).await
            }
            .instrument(span),
        )
    }
}

pub mod mock {
    //! Scripted gateway for tests.
    //!
    //! Records every call and answers from a queue of outcomes, falling back
    //! to a fixed successful reference once the queue is empty.

    use std::{collections::VecDeque, future::Future, pin::Pin, sync::Arc, time::Duration};

    use sluice_core::ResourceRef;
    use tokio::sync::RwLock;

    use super::DeliveryGateway;
    use crate::{error::Result, mapper::PatientResource};

    /// One recorded gateway invocation.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum GatewayCall {
        /// Conditional write by identifier.
        Conditional {
            /// Identifier system
            system: String,
            /// Identifier value
            value: String,
            /// Resource sent
            resource: PatientResource,
        },
        /// Write by logical id.
        ById {
            /// Logical id
            resource_id: String,
            /// Resource sent
            resource: PatientResource,
        },
    }

    /// In-memory gateway with scripted outcomes.
    #[derive(Clone)]
    pub struct MockGateway {
        calls: Arc<RwLock<Vec<GatewayCall>>>,
        outcomes: Arc<RwLock<VecDeque<Result<ResourceRef>>>>,
        fallback: ResourceRef,
        latency: Option<Duration>,
    }

    impl MockGateway {
        /// Gateway that accepts every write as `Patient/pat-1` version `1`.
        pub fn new() -> Self {
            Self::succeeding_with(ResourceRef {
                id: Some("pat-1".to_string()),
                version: Some("1".to_string()),
            })
        }

        /// Gateway that accepts every write with the given reference.
        pub fn succeeding_with(resource: ResourceRef) -> Self {
            Self {
                calls: Arc::new(RwLock::new(Vec::new())),
                outcomes: Arc::new(RwLock::new(VecDeque::new())),
                fallback: resource,
                latency: None,
            }
        }

        /// Delays every call by `latency` of real time.
        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = Some(latency);
            self
        }

        /// Queues the outcome of the next unscripted call.
        pub async fn push_outcome(&self, outcome: Result<ResourceRef>) {
            self.outcomes.write().await.push_back(outcome);
        }

        /// Every call made so far, in order.
        pub async fn calls(&self) -> Vec<GatewayCall> {
            self.calls.read().await.clone()
        }

        /// Number of calls made so far.
        pub async fn call_count(&self) -> usize {
            self.calls.read().await.len()
        }

        async fn answer(&self, call: GatewayCall) -> Result<ResourceRef> {
            self.calls.write().await.push(call);
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            let scripted = self.outcomes.write().await.pop_front();
            scripted.unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    impl Default for MockGateway {
        fn default() -> Self {
            Self::new()
        }
    }

    impl DeliveryGateway for MockGateway {
        fn deliver_conditional<'a>(
            &'a self,
            system: &'a str,
            value: &'a str,
            resource: &'a PatientResource,
        ) -> Pin<Box<dyn Future<Output = Result<ResourceRef>> + Send + 'a>> {
            Box::pin(self.answer(GatewayCall::Conditional {
                system: system.to_string(),
                value: value.to_string(),
                resource: resource.clone(),
            }))
        }

        fn deliver_by_id<'a>(
            &'a self,
            resource_id: &'a str,
            resource: &'a PatientResource,
        ) -> Pin<Box<dyn Future<Output = Result<ResourceRef>> + Send + 'a>> {
            Box::pin(self.answer(GatewayCall::ById {
                resource_id: resource_id.to_string(),
                resource: resource.clone(),
            }))
        }
    }
}
