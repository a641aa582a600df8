//! REST client for a Confluent-compatible schema registry
//!
//! Transient failures (connection errors, timeouts, 5xx, 408, 429) are retried
//! with bounded exponential backoff. Every other 4xx fails on the first
//! response: 404 becomes `NotFound`, 409 `Incompatible`, 422/42201
//! `InvalidSchema`, anything else `Rejected`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::{ErrorBody, RegisterRequest, RegisterResponse, RegistryClient};
use crate::config::RegistryConfig;
use crate::error::{Result, SchemaError};
use crate::schema::{RegisteredReference, RegisteredSchema, SubjectVersion, VersionSelector};

/// Media type of the registry's v1 REST API
pub const CONTENT_TYPE_V1: &str = "application/vnd.schemaregistry.v1+json";

/// Retry schedule for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Also retry registration POSTs (safe because the registry deduplicates)
    pub retry_writes: bool,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            retry_writes: false,
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_backoff)
    }

    fn attempts(&self, method: &Method) -> u32 {
        if *method == Method::GET || self.retry_writes {
            self.max_retries + 1
        } else {
            1
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            retry_writes: true,
        }
    }
}

/// HTTP `RegistryClient`
#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    base_url: Url,
    http: reqwest::Client,
    credentials: Option<(String, Option<String>)>,
    context: Option<String>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl HttpRegistryClient {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| SchemaError::Config(format!("invalid registry url {}: {}", config.url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(SchemaError::Config(format!("invalid registry url {}", config.url)));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SchemaError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            http,
            credentials: config
                .username
                .clone()
                .map(|user| (user, config.password.clone())),
            context: config.context.clone().filter(|c| !c.is_empty() && c != "."),
            timeout: config.request_timeout(),
            retry: config.retry_policy(),
        })
    }

    /// Client for `url` with default settings
    pub fn from_url(url: &str) -> Result<Self> {
        Self::new(&RegistryConfig {
            url: url.to_string(),
            ..RegistryConfig::default()
        })
    }

    /// Same client with a different per-call timeout
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// URL under the configured context, for subject and id paths alike
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| SchemaError::Config(format!("invalid registry url {}", self.base_url)))?;
            path.pop_if_empty();
            if let Some(context) = &self.context {
                path.push("contexts").push(context);
            }
            path.extend(segments);
        }
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&RegisterRequest>,
        subject: Option<&str>,
    ) -> Result<T> {
        let operation = format!("{} {}", method, url.path());
        let payload = body.map(serde_json::to_vec).transpose()?;
        let attempts = self.retry.attempts(&method);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(operation = %operation, attempt, "Registry request");

            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .header(ACCEPT, CONTENT_TYPE_V1)
                .timeout(self.timeout);
            if let Some(payload) = &payload {
                request = request.header(CONTENT_TYPE, CONTENT_TYPE_V1).body(payload.clone());
            }
            if let Some((user, password)) = &self.credentials {
                request = request.basic_auth(user, password.as_ref());
            }

            let error = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<T>()
                        .await
                        .map_err(|e| transport_error(&operation, e));
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    status_error(status, &text, subject, &operation)
                }
                Err(e) => transport_error(&operation, e),
            };

            if !error.is_transient() || attempt >= attempts {
                return Err(error);
            }
            let delay = self.retry.backoff(attempt - 1);
            warn!(
                operation = %operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient registry failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn transport_error(operation: &str, err: reqwest::Error) -> SchemaError {
    if err.is_timeout() {
        SchemaError::RegistryTimeout {
            operation: operation.to_string(),
        }
    } else if err.is_decode() {
        SchemaError::Internal(format!("{}: unexpected response body: {}", operation, err))
    } else {
        SchemaError::RegistryUnavailable(format!("{}: {}", operation, err))
    }
}

fn status_error(status: StatusCode, text: &str, subject: Option<&str>, operation: &str) -> SchemaError {
    let body: ErrorBody = serde_json::from_str(text).unwrap_or_default();
    let message = body.message.clone().unwrap_or_else(|| {
        if text.is_empty() {
            status.to_string()
        } else {
            text.to_string()
        }
    });

    match status.as_u16() {
        404 => SchemaError::NotFound {
            resource: format!("{} ({})", operation, message),
        },
        409 => SchemaError::Incompatible {
            subject: subject.unwrap_or_default().to_string(),
            message,
        },
        422 if body.error_code == Some(42201) => SchemaError::InvalidSchema(message),
        408 => SchemaError::RegistryTimeout {
            operation: operation.to_string(),
        },
        429 => SchemaError::RegistryUnavailable(format!("{} throttled: {}", operation, message)),
        code if status.is_client_error() => SchemaError::Rejected { status: code, message },
        _ => SchemaError::RegistryUnavailable(format!("{} returned {}: {}", operation, status, message)),
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn register_schema(
        &self,
        subject: &str,
        schema: &str,
        references: &[RegisteredReference],
    ) -> Result<u32> {
        let url = self.url(&["subjects", subject, "versions"])?;
        let request = RegisterRequest::avro(schema, references);
        let response: RegisterResponse = self.send(Method::POST, url, Some(&request), Some(subject)).await?;
        info!(subject = %subject, id = response.id, references = references.len(), "Registered schema");
        Ok(response.id)
    }

    async fn lookup_schema(
        &self,
        subject: &str,
        schema: &str,
        references: &[RegisteredReference],
    ) -> Result<Option<SubjectVersion>> {
        let url = self.url(&["subjects", subject])?;
        let request = RegisterRequest::avro(schema, references);
        match self
            .send::<SubjectVersion>(Method::POST, url, Some(&request), Some(subject))
            .await
        {
            Ok(found) => Ok(Some(found)),
            Err(SchemaError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_by_id(&self, id: u32) -> Result<RegisteredSchema> {
        let url = self.url(&["schemas", "ids", &id.to_string()])?;
        let mut schema: RegisteredSchema = self.send(Method::GET, url, None, None).await?;
        schema.id = id;
        Ok(schema)
    }

    async fn get_version(&self, subject: &str, version: VersionSelector) -> Result<SubjectVersion> {
        let url = self.url(&["subjects", subject, "versions", &version.to_string()])?;
        self.send(Method::GET, url, None, Some(subject)).await
    }

    async fn list_subjects(&self) -> Result<Vec<String>> {
        let url = self.url(&["subjects"])?;
        self.send(Method::GET, url, None, None).await
    }
}
