//! Reference Resolver
//!
//! Turns a global schema id into a compiled, self-contained Avro schema by
//! fetching the schema, following its references transitively and inlining
//! the referenced definitions.
//!
//! Three single-flight caches back the resolver:
//! - raw schemas by id
//! - subject versions to ids (priming the raw cache)
//! - compiled schemas by id
//!
//! Entries stay until `invalidate` is called; there is no expiry. Each
//! invalidation bumps an epoch, and work started under an older epoch is
//! handed to its callers but never cached.

pub mod flight;

pub use flight::SingleFlight;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use petgraph::graph::DiGraph;
use serde_json::Value;
use tracing::{debug, info};

use crate::compile::{inline_references, parse_compiled, DefinitionIndex};
use crate::config::ResolverConfig;
use crate::error::{Result, SchemaError};
use crate::graph::dependency_order;
use crate::registry::RegistryClient;
use crate::schema::{RegisteredReference, RegisteredSchema, SchemaType, VersionSelector};

/// A compiled schema reachable from one global id. Immutable once built.
#[derive(Debug, Clone)]
pub struct ResolvedSchema {
    pub id: u32,
    /// Parsed schema with every reference inlined
    pub schema: apache_avro::Schema,
    /// The self-contained schema document `schema` was parsed from
    pub document: Value,
    /// Direct references as registered
    pub references: Vec<RegisteredReference>,
    /// Ids of every schema this one was compiled from, transitively
    pub dependencies: BTreeSet<u32>,
}

impl ResolvedSchema {
    /// Parsing Canonical Form of the compiled schema
    pub fn canonical_form(&self) -> String {
        self.schema.canonical_form()
    }

    pub fn depends_on(&self, id: u32) -> bool {
        self.dependencies.contains(&id)
    }
}

struct ResolverInner {
    client: Arc<dyn RegistryClient>,
    raw: SingleFlight<u32, Arc<RegisteredSchema>>,
    versions: SingleFlight<(String, i32), u32>,
    resolved: SingleFlight<u32, Arc<ResolvedSchema>>,
    /// Bumped by every `invalidate`
    epoch: AtomicU64,
    timeout: Option<Duration>,
}

impl ResolverInner {
    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

/// Resolves and caches schemas by global id. Cheap to clone; clones share caches.
#[derive(Clone)]
pub struct ReferenceResolver {
    inner: Arc<ResolverInner>,
}

impl ReferenceResolver {
    pub fn new(client: Arc<dyn RegistryClient>) -> Self {
        Self::with_timeout(client, None)
    }

    /// A resolver whose `resolve` calls give up after `timeout`.
    ///
    /// Only the timed-out caller sees `RegistryTimeout`; the shared resolution
    /// keeps running for other callers.
    pub fn with_timeout(client: Arc<dyn RegistryClient>, timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                client,
                raw: SingleFlight::new(),
                versions: SingleFlight::new(),
                resolved: SingleFlight::new(),
                epoch: AtomicU64::new(0),
                timeout,
            }),
        }
    }

    pub fn from_config(client: Arc<dyn RegistryClient>, config: &ResolverConfig) -> Self {
        Self::with_timeout(client, config.resolve_timeout())
    }

    pub fn client(&self) -> &Arc<dyn RegistryClient> {
        &self.inner.client
    }

    /// Resolve `id` into a compiled schema.
    ///
    /// Concurrent calls for the same id share one resolution, and every schema
    /// in the reference closure is fetched at most once.
    pub async fn resolve(&self, id: u32) -> Result<Arc<ResolvedSchema>> {
        match self.inner.timeout {
            Some(limit) => tokio::time::timeout(limit, self.resolve_shared(id))
                .await
                .unwrap_or_else(|_| {
                    Err(SchemaError::RegistryTimeout {
                        operation: format!("resolve schema id {}", id),
                    })
                }),
            None => self.resolve_shared(id).await,
        }
    }

    /// Resolve the schema registered as `version` of `subject`
    pub async fn resolve_subject(&self, subject: &str, version: VersionSelector) -> Result<Arc<ResolvedSchema>> {
        let id = match version {
            VersionSelector::Latest => {
                let epoch = self.inner.epoch();
                let latest = self.inner.client.get_latest_version(subject).await?;
                let id = latest.id;
                let inner = &self.inner;
                inner
                    .raw
                    .insert_if(id, Arc::new(latest.into_registered()), || inner.epoch() == epoch)
                    .await;
                id
            }
            VersionSelector::Number(number) => self.version_id(subject, number).await?,
        };
        self.resolve(id).await
    }

    /// Drop `id` and everything compiled from it, so the next resolve refetches.
    ///
    /// Resolutions running at the time still return to their callers, but
    /// their results (and the dependencies they compiled) are not cached.
    pub async fn invalidate(&self, id: u32) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.resolved.forget_in_flight().await;
        self.inner.versions.forget_in_flight().await;
        self.inner.resolved.remove(&id).await;
        self.inner
            .resolved
            .retain(|_, resolved| !resolved.depends_on(id))
            .await;
        self.inner.raw.remove(&id).await;
        self.inner.versions.retain(|_, cached| *cached != id).await;
        debug!(id, "Invalidated schema");
    }

    pub async fn is_cached(&self, id: u32) -> bool {
        self.inner.resolved.get(&id).await.is_some()
    }

    /// Ids with a compiled schema in the cache, ascending
    pub async fn cached_ids(&self) -> Vec<u32> {
        let mut ids = self.inner.resolved.keys().await;
        ids.sort_unstable();
        ids
    }

    async fn resolve_shared(&self, id: u32) -> Result<Arc<ResolvedSchema>> {
        if let Some(hit) = self.inner.resolved.get(&id).await {
            debug!(id, "Resolved schema cache hit");
            return Ok(hit);
        }
        let this = self.clone();
        self.inner
            .resolved
            .get_or_load(id, async move { this.build(id).await })
            .await
    }

    async fn fetch(&self, id: u32) -> Result<Arc<RegisteredSchema>> {
        let client = Arc::clone(&self.inner.client);
        self.inner
            .raw
            .get_or_load(id, async move {
                debug!(id, "Fetching schema");
                let mut schema = client.get_by_id(id).await?;
                schema.id = id;
                Ok(Arc::new(schema))
            })
            .await
    }

    async fn version_id(&self, subject: &str, version: i32) -> Result<u32> {
        let inner = Arc::clone(&self.inner);
        let subject = subject.to_string();
        self.inner
            .versions
            .get_or_load((subject.clone(), version), async move {
                let epoch = inner.epoch();
                debug!(subject = %subject, version, "Fetching subject version");
                let found = inner.client.get_version(&subject, VersionSelector::Number(version)).await?;
                let id = found.id;
                inner
                    .raw
                    .insert_if(id, Arc::new(found.into_registered()), || inner.epoch() == epoch)
                    .await;
                Ok(id)
            })
            .await
    }

    /// Fetch the reference closure of `root`, check it is acyclic, then compile
    /// it bottom-up.
    async fn build(self, root: u32) -> Result<Arc<ResolvedSchema>> {
        let epoch = self.inner.epoch();
        let mut fetched: HashMap<u32, Arc<RegisteredSchema>> = HashMap::new();
        let mut done: HashMap<u32, Arc<ResolvedSchema>> = HashMap::new();
        let mut edges: HashMap<u32, Vec<(RegisteredReference, u32)>> = HashMap::new();
        let mut frontier = vec![root];

        while !frontier.is_empty() {
            let schemas = try_join_all(frontier.iter().map(|&id| self.fetch(id))).await?;
            let mut next: Vec<u32> = Vec::new();
            for schema in schemas {
                if schema.schema_type != SchemaType::Avro {
                    return Err(SchemaError::InvalidSchema(format!(
                        "schema id {} is {}, not AVRO",
                        schema.id, schema.schema_type
                    )));
                }
                let ids = try_join_all(
                    schema
                        .references
                        .iter()
                        .map(|reference| self.version_id(&reference.subject, reference.version)),
                )
                .await?;

                let mut dependencies = Vec::new();
                for (reference, dependency) in schema.references.iter().zip(ids) {
                    dependencies.push((reference.clone(), dependency));
                    let seen = fetched.contains_key(&dependency)
                        || done.contains_key(&dependency)
                        || frontier.contains(&dependency)
                        || next.contains(&dependency);
                    if seen {
                        continue;
                    }
                    match self.inner.resolved.get(&dependency).await {
                        Some(resolved) => {
                            done.insert(dependency, resolved);
                        }
                        None => next.push(dependency),
                    }
                }
                edges.insert(schema.id, dependencies);
                fetched.insert(schema.id, schema);
            }
            frontier = next;
        }

        let mut graph: DiGraph<u32, ()> = DiGraph::new();
        let mut nodes = HashMap::new();
        for &id in fetched.keys().chain(done.keys()) {
            nodes.insert(id, graph.add_node(id));
        }
        for (id, dependencies) in &edges {
            for (_, dependency) in dependencies {
                if let (Some(&source), Some(&target)) = (nodes.get(id), nodes.get(dependency)) {
                    graph.update_edge(source, target, ());
                }
            }
        }
        let order = dependency_order(&graph, |id| *id).map_err(|cycle| SchemaError::ReferenceCycle {
            ids: cycle.into_iter().map(|idx| graph[idx]).collect(),
        })?;

        for idx in order {
            let id = graph[idx];
            if done.contains_key(&id) {
                continue;
            }
            let raw = fetched
                .get(&id)
                .ok_or_else(|| SchemaError::Internal(format!("schema id {} was not fetched", id)))?;
            let mut dependencies = Vec::new();
            for (reference, dependency) in edges.get(&id).map(Vec::as_slice).unwrap_or_default() {
                let resolved = done.get(dependency).ok_or_else(|| {
                    SchemaError::Internal(format!("schema id {} compiled before {}", id, dependency))
                })?;
                dependencies.push((reference, Arc::clone(resolved)));
            }

            let resolved = Arc::new(compile(id, raw, &dependencies)?);
            if id != root {
                let inner = &self.inner;
                let stored = inner
                    .resolved
                    .insert_if(id, Arc::clone(&resolved), || inner.epoch() == epoch)
                    .await;
                if !stored {
                    debug!(id, root, "Invalidated during resolution, not caching");
                }
            }
            done.insert(id, resolved);
        }

        let resolved = done
            .remove(&root)
            .ok_or_else(|| SchemaError::Internal(format!("schema id {} was not compiled", root)))?;
        info!(
            id = root,
            dependencies = resolved.dependencies.len(),
            "Resolved schema"
        );
        Ok(resolved)
    }
}

/// Compile one registered schema against its already resolved references.
fn compile(
    id: u32,
    raw: &RegisteredSchema,
    dependencies: &[(&RegisteredReference, Arc<ResolvedSchema>)],
) -> Result<ResolvedSchema> {
    let document: Value = serde_json::from_str(&raw.schema)?;
    let mut index = DefinitionIndex::new();
    let mut closure = BTreeSet::new();
    for (_, dependency) in dependencies {
        index.add_document(&dependency.document)?;
        closure.insert(dependency.id);
        closure.extend(dependency.dependencies.iter().copied());
    }

    let expanded = inline_references(&document, &index)?;
    let schema = parse_compiled(&expanded)?;
    Ok(ResolvedSchema {
        id,
        schema,
        document: expanded,
        references: raw.references.clone(),
        dependencies: closure,
    })
}
