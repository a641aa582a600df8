//! Schema registry access
//!
//! `RegistryClient` is the protocol seam between this crate and a registry
//! service. `http::HttpRegistryClient` speaks the REST protocol;
//! `memory::InMemoryRegistry` keeps everything in process for tests and
//! dry runs.

pub mod http;
pub mod memory;

pub use http::HttpRegistryClient;
pub use memory::InMemoryRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schema::{RegisteredReference, RegisteredSchema, SchemaType, SubjectVersion, VersionSelector};

/// Body of `POST /subjects/{subject}/versions` and `POST /subjects/{subject}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub schema: String,
    #[serde(rename = "schemaType")]
    pub schema_type: SchemaType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<RegisteredReference>,
}

impl RegisterRequest {
    pub fn avro(schema: &str, references: &[RegisteredReference]) -> Self {
        Self {
            schema: schema.to_string(),
            schema_type: SchemaType::Avro,
            references: references.to_vec(),
        }
    }
}

/// Response of `POST /subjects/{subject}/versions`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: u32,
}

/// Error body returned by the registry on 4xx/5xx
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error_code: Option<i32>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Operations this crate needs from a schema registry.
///
/// Implementations must leave deduplication to the service: registering
/// byte-identical text under a subject returns the id the service already has.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Register `schema` under `subject` and return its global id.
    async fn register_schema(
        &self,
        subject: &str,
        schema: &str,
        references: &[RegisteredReference],
    ) -> Result<u32>;

    /// Find the version of `subject` holding exactly this schema, if any.
    async fn lookup_schema(
        &self,
        subject: &str,
        schema: &str,
        references: &[RegisteredReference],
    ) -> Result<Option<SubjectVersion>>;

    /// Fetch a schema and its references by global id.
    async fn get_by_id(&self, id: u32) -> Result<RegisteredSchema>;

    async fn get_version(&self, subject: &str, version: VersionSelector) -> Result<SubjectVersion>;

    async fn get_latest_version(&self, subject: &str) -> Result<SubjectVersion> {
        self.get_version(subject, VersionSelector::Latest).await
    }

    async fn list_subjects(&self) -> Result<Vec<String>>;
}
