//! In-process registry
//!
//! Implements the service's idempotence contract (identical text and references
//! get the same global id; re-registering under a subject adds no version) and
//! counts fetches so callers can verify caching behaviour.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::RegistryClient;
use crate::error::{Result, SchemaError};
use crate::schema::{RegisteredReference, RegisteredSchema, SchemaType, SubjectVersion, VersionSelector};

#[derive(Debug, Default)]
struct State {
    next_id: u32,
    schemas: BTreeMap<u32, RegisteredSchema>,
    /// subject -> schema id of each version (version n at index n - 1)
    subjects: BTreeMap<String, Vec<u32>>,
    id_fetches: HashMap<u32, usize>,
    version_fetches: HashMap<(String, i32), usize>,
    failures: HashMap<String, SchemaError>,
}

impl State {
    fn find(&self, schema: &str, references: &[RegisteredReference]) -> Option<u32> {
        self.schemas
            .values()
            .find(|s| s.schema == schema && s.references == references)
            .map(|s| s.id)
    }

    fn version_of(&self, subject: &str, version: VersionSelector) -> Option<(i32, u32)> {
        let versions = self.subjects.get(subject)?;
        let number = match version {
            VersionSelector::Latest => versions.len() as i32,
            VersionSelector::Number(n) => n,
        };
        if number < 1 {
            return None;
        }
        versions.get(number as usize - 1).map(|&id| (number, id))
    }

    fn subject_version(&self, subject: &str, version: i32, id: u32) -> Option<SubjectVersion> {
        let schema = self.schemas.get(&id)?;
        Some(SubjectVersion {
            subject: subject.to_string(),
            version,
            id,
            schema: schema.schema.clone(),
            schema_type: schema.schema_type,
            references: schema.references.clone(),
        })
    }
}

/// A registry held in memory
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    state: Mutex<State>,
    latency: Duration,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`, to widen race windows in tests
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    /// Make every registration under `subject` fail with `error`
    pub async fn fail_registrations(&self, subject: &str, error: SchemaError) {
        self.state.lock().await.failures.insert(subject.to_string(), error);
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    /// Store a schema under an explicit id without checking its references.
    ///
    /// Returns the new version number under `subject`.
    pub async fn insert_unchecked(
        &self,
        id: u32,
        subject: &str,
        schema: &str,
        references: Vec<RegisteredReference>,
    ) -> i32 {
        let mut state = self.state.lock().await;
        state.next_id = state.next_id.max(id);
        state.schemas.insert(
            id,
            RegisteredSchema {
                id,
                schema: schema.to_string(),
                schema_type: SchemaType::Avro,
                references,
            },
        );
        let versions = state.subjects.entry(subject.to_string()).or_default();
        versions.push(id);
        versions.len() as i32
    }

    /// Number of `get_by_id` calls for `id`
    pub async fn id_fetches(&self, id: u32) -> usize {
        self.state.lock().await.id_fetches.get(&id).copied().unwrap_or(0)
    }

    /// Number of `get_version` calls for a subject version
    pub async fn version_fetches(&self, subject: &str, version: i32) -> usize {
        self.state
            .lock()
            .await
            .version_fetches
            .get(&(subject.to_string(), version))
            .copied()
            .unwrap_or(0)
    }

    /// All fetches by id or by subject version
    pub async fn total_fetches(&self) -> usize {
        let state = self.state.lock().await;
        state.id_fetches.values().sum::<usize>() + state.version_fetches.values().sum::<usize>()
    }

    /// Version numbers registered under `subject`
    pub async fn versions(&self, subject: &str) -> Vec<i32> {
        let state = self.state.lock().await;
        state
            .subjects
            .get(subject)
            .map(|ids| (1..=ids.len() as i32).collect())
            .unwrap_or_default()
    }

    pub async fn schema_count(&self) -> usize {
        self.state.lock().await.schemas.len()
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    async fn register_schema(
        &self,
        subject: &str,
        schema: &str,
        references: &[RegisteredReference],
    ) -> Result<u32> {
        self.pause().await;
        let mut state = self.state.lock().await;
        if let Some(error) = state.failures.get(subject) {
            return Err(error.clone());
        }
        for reference in references {
            if state
                .version_of(&reference.subject, VersionSelector::Number(reference.version))
                .is_none()
            {
                return Err(SchemaError::InvalidSchema(format!(
                    "reference {} points at missing {} version {}",
                    reference.name, reference.subject, reference.version
                )));
            }
        }

        let id = match state.find(schema, references) {
            Some(id) => id,
            None => {
                state.next_id += 1;
                let id = state.next_id;
                state.schemas.insert(
                    id,
                    RegisteredSchema {
                        id,
                        schema: schema.to_string(),
                        schema_type: SchemaType::Avro,
                        references: references.to_vec(),
                    },
                );
                id
            }
        };
        let versions = state.subjects.entry(subject.to_string()).or_default();
        if !versions.contains(&id) {
            versions.push(id);
        }
        Ok(id)
    }

    async fn lookup_schema(
        &self,
        subject: &str,
        schema: &str,
        references: &[RegisteredReference],
    ) -> Result<Option<SubjectVersion>> {
        self.pause().await;
        let state = self.state.lock().await;
        let Some(id) = state.find(schema, references) else {
            return Ok(None);
        };
        let position = state
            .subjects
            .get(subject)
            .and_then(|ids| ids.iter().position(|&candidate| candidate == id));
        Ok(position.and_then(|p| state.subject_version(subject, p as i32 + 1, id)))
    }

    async fn get_by_id(&self, id: u32) -> Result<RegisteredSchema> {
        self.pause().await;
        let mut state = self.state.lock().await;
        *state.id_fetches.entry(id).or_default() += 1;
        state.schemas.get(&id).cloned().ok_or_else(|| SchemaError::NotFound {
            resource: format!("schema id {}", id),
        })
    }

    async fn get_version(&self, subject: &str, version: VersionSelector) -> Result<SubjectVersion> {
        self.pause().await;
        let mut state = self.state.lock().await;
        let found = state.version_of(subject, version);
        let counted = found.map(|(n, _)| n).unwrap_or(match version {
            VersionSelector::Number(n) => n,
            VersionSelector::Latest => -1,
        });
        *state
            .version_fetches
            .entry((subject.to_string(), counted))
            .or_default() += 1;

        found
            .and_then(|(number, id)| state.subject_version(subject, number, id))
            .ok_or_else(|| SchemaError::NotFound {
                resource: format!("subject {} version {}", subject, version),
            })
    }

    async fn list_subjects(&self) -> Result<Vec<String>> {
        self.pause().await;
        Ok(self.state.lock().await.subjects.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MONEY: &str = r#"{"type":"record","name":"Money","namespace":"shop","fields":[{"name":"amount","type":"double"}]}"#;

    #[tokio::test]
    async fn test_same_text_same_id() {
        let registry = InMemoryRegistry::new();
        let first = registry.register_schema("shop.Money", MONEY, &[]).await.unwrap();
        let second = registry.register_schema("shop.Money", MONEY, &[]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.versions("shop.Money").await, vec![1]);
    }

    #[tokio::test]
    async fn test_same_text_other_subject_shares_id() {
        let registry = InMemoryRegistry::new();
        let first = registry.register_schema("a", MONEY, &[]).await.unwrap();
        let second = registry.register_schema("b", MONEY, &[]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.schema_count().await, 1);
        assert_eq!(registry.list_subjects().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_new_text_adds_version() {
        let registry = InMemoryRegistry::new();
        registry.register_schema("s", MONEY, &[]).await.unwrap();
        let id = registry.register_schema("s", "\"string\"", &[]).await.unwrap();
        let latest = registry.get_latest_version("s").await.unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.id, id);
    }

    #[tokio::test]
    async fn test_lookup() {
        let registry = InMemoryRegistry::new();
        assert!(registry.lookup_schema("s", MONEY, &[]).await.unwrap().is_none());
        let id = registry.register_schema("s", MONEY, &[]).await.unwrap();
        let found = registry.lookup_schema("s", MONEY, &[]).await.unwrap().unwrap();
        assert_eq!((found.id, found.version), (id, 1));
        assert!(registry.lookup_schema("other", MONEY, &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_reference_rejected() {
        let registry = InMemoryRegistry::new();
        let err = registry
            .register_schema("s", MONEY, &[RegisteredReference::new("x.Y", "x.Y", 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidSchema(_)));
    }

    #[tokio::test]
    async fn test_fetch_counts() {
        let registry = InMemoryRegistry::new();
        let id = registry.register_schema("s", MONEY, &[]).await.unwrap();
        registry.get_by_id(id).await.unwrap();
        registry.get_by_id(id).await.unwrap();
        registry.get_version("s", VersionSelector::Number(1)).await.unwrap();
        assert_eq!(registry.id_fetches(id).await, 2);
        assert_eq!(registry.version_fetches("s", 1).await, 1);
        assert_eq!(registry.total_fetches().await, 3);
        assert!(matches!(
            registry.get_by_id(99).await,
            Err(SchemaError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let registry = InMemoryRegistry::new();
        registry
            .fail_registrations("s", SchemaError::RegistryUnavailable("down".into()))
            .await;
        assert!(registry.register_schema("s", MONEY, &[]).await.unwrap_err().is_transient());
        registry.clear_failures().await;
        assert!(registry.register_schema("s", MONEY, &[]).await.is_ok());
    }
}
