//! Schema Registrar
//!
//! Registers a split `SchemaGraph` against the registry, dependencies first,
//! passing each node the subject/version of the parts it references.
//!
//! Re-running a registration is safe: each node is looked up before it is
//! registered, and the registry returns the existing id for identical text.
//! A subject derived from a fullname must be free or already hold exactly the
//! node's schema; otherwise the run stops with `SubjectConflict`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SchemaError};
use crate::graph::SchemaGraph;
use crate::registry::RegistryClient;
use crate::schema::{RegisteredNode, RegisteredReference, RegistrationState};
use crate::split::subject_for;

/// One node of a registration plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedRegistration {
    pub fullname: String,
    pub subject: String,
    /// True when the subject was derived rather than requested
    pub derived_subject: bool,
    /// Fullnames of referenced nodes and external types
    pub references: Vec<String>,
    pub size: usize,
    pub checksum: String,
}

/// What `register_graph` would do, in order. Built without network calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrationPlan {
    pub steps: Vec<PlannedRegistration>,
}

impl RegistrationPlan {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn subjects(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.subject.as_str()).collect()
    }
}

/// Result of registering a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    /// Fullname of the root node
    pub root: String,
    /// Fullnames in registration order
    pub order: Vec<String>,
    pub nodes: BTreeMap<String, RegisteredNode>,
}

impl Registration {
    pub fn get(&self, fullname: &str) -> Option<&RegisteredNode> {
        self.nodes.get(fullname)
    }

    pub fn root_node(&self) -> Option<&RegisteredNode> {
        self.nodes.get(&self.root)
    }

    /// Global id to put on the wire for records of the root type
    pub fn root_id(&self) -> Option<u32> {
        self.root_node().map(|node| node.id)
    }

    /// Registered nodes in registration order
    pub fn in_order(&self) -> impl Iterator<Item = &RegisteredNode> {
        self.order.iter().filter_map(|fullname| self.nodes.get(fullname))
    }
}

/// Registers schema graphs, one node at a time
#[derive(Clone)]
pub struct Registrar {
    client: Arc<dyn RegistryClient>,
}

impl Registrar {
    pub fn new(client: Arc<dyn RegistryClient>) -> Self {
        Self { client }
    }

    /// Registration order and subjects for `graph`.
    ///
    /// Fails with `SubjectConflict` when two nodes would share a subject.
    pub fn plan(&self, graph: &SchemaGraph) -> Result<RegistrationPlan> {
        let mut claimed: HashMap<String, String> = HashMap::new();
        let mut steps = Vec::new();
        for node in graph.registration_order() {
            let subject = subject_for(node);
            if let Some(other) = claimed.insert(subject.clone(), node.fullname.clone()) {
                return Err(SchemaError::SubjectConflict {
                    subject,
                    reason: format!("derived for both {} and {}", other, node.fullname),
                });
            }
            steps.push(PlannedRegistration {
                fullname: node.fullname.clone(),
                subject,
                derived_subject: !(node.is_root && node.subject.is_some()),
                references: node.references.clone(),
                size: node.size(),
                checksum: node.checksum().to_string(),
            });
        }
        Ok(RegistrationPlan { steps })
    }

    /// Register every node of `graph`, dependencies first, and mark the nodes
    /// registered.
    ///
    /// A failure after at least one node is in place is reported as
    /// `PartialRegistration`; nothing is rolled back.
    pub async fn register_graph(&self, graph: &mut SchemaGraph) -> Result<Registration> {
        let plan = self.plan(graph)?;
        let mut registration = Registration {
            root: graph.root().fullname.clone(),
            order: Vec::with_capacity(plan.len()),
            nodes: BTreeMap::new(),
        };

        for step in &plan.steps {
            match self.register_step(graph, step, &registration).await {
                Ok(node) => {
                    if let Some(target) = graph.get_mut(&step.fullname) {
                        target.state = RegistrationState::Registered {
                            subject: node.subject.clone(),
                            version: node.version,
                            id: node.id,
                        };
                    }
                    registration.order.push(step.fullname.clone());
                    registration.nodes.insert(step.fullname.clone(), node);
                }
                Err(e) if registration.order.is_empty() => return Err(e),
                Err(e) => {
                    return Err(SchemaError::PartialRegistration {
                        registered: registration.in_order().cloned().collect(),
                        source: Box::new(e),
                    })
                }
            }
        }

        info!(
            root = %registration.root,
            nodes = registration.order.len(),
            "Registered schema graph"
        );
        Ok(registration)
    }

    async fn register_step(
        &self,
        graph: &SchemaGraph,
        step: &PlannedRegistration,
        done: &Registration,
    ) -> Result<RegisteredNode> {
        let node = graph
            .get(&step.fullname)
            .ok_or_else(|| SchemaError::Internal(format!("{} missing from graph", step.fullname)))?;

        let mut references = Vec::with_capacity(node.references.len());
        for name in &node.references {
            let reference = match (done.get(name), graph.external_reference(name)) {
                (Some(registered), _) => RegisteredReference::new(name, &registered.subject, registered.version),
                (None, Some(external)) => external.clone(),
                (None, None) => {
                    return Err(SchemaError::Internal(format!(
                        "{} references {} before it was registered",
                        step.fullname, name
                    )))
                }
            };
            references.push(reference);
        }

        let (version, id) = self.register_node(step, &node.text, &references).await?;
        info!(
            fullname = %step.fullname,
            subject = %step.subject,
            version,
            id,
            "Registered schema"
        );
        Ok(RegisteredNode {
            fullname: step.fullname.clone(),
            subject: step.subject.clone(),
            version,
            id,
            registered_at: Utc::now(),
        })
    }

    async fn register_node(
        &self,
        step: &PlannedRegistration,
        text: &str,
        references: &[RegisteredReference],
    ) -> Result<(i32, u32)> {
        if let Some(existing) = self.client.lookup_schema(&step.subject, text, references).await? {
            debug!(
                subject = %step.subject,
                version = existing.version,
                "Schema already registered"
            );
            return Ok((existing.version, existing.id));
        }

        if step.derived_subject {
            match self.client.get_latest_version(&step.subject).await {
                Ok(existing) => {
                    return Err(SchemaError::SubjectConflict {
                        subject: step.subject.clone(),
                        reason: format!(
                            "version {} (schema id {}) holds a different definition than {}",
                            existing.version, existing.id, step.fullname
                        ),
                    })
                }
                Err(SchemaError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let id = self.client.register_schema(&step.subject, text, references).await?;
        let registered = self
            .client
            .lookup_schema(&step.subject, text, references)
            .await?
            .ok_or_else(|| SchemaError::Internal(format!("{} registered as id {} but not found", step.subject, id)))?;
        Ok((registered.version, id))
    }
}
