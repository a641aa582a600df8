//! Schema Splitter
//!
//! Decomposes one monolithic Avro record schema into a root schema plus
//! extracted named types, each of which becomes its own registry subject.
//! Extracted definitions are replaced by their fullname in the document that
//! used to contain them, and every document records which other parts it
//! references.
//!
//! ## Extraction
//!
//! - `Shared` (default): named types used from more than one place
//! - `All`: every named type except the root
//! - `extract`: fullnames that are always extracted
//! - `min_size`: types whose compact JSON is smaller stay inline unless marked
//!   or referenced from another part

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::checksum::Checksum;
use crate::error::{Result, SchemaError};
use crate::graph::walk::{collect_definitions, walk_mut, DocumentNames, SchemaVisitor, Visit};
use crate::graph::SchemaGraph;
use crate::schema::{sanitize_filename, short_name, SchemaNode};

/// Registry per-schema size limit the `analyze` report warns about
pub const MAX_SCHEMA_BYTES: usize = 1024 * 1024;

/// Which named types become separate subjects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionPolicy {
    /// Types used from more than one place
    #[default]
    Shared,
    /// Every named type
    All,
}

/// Splitter options (the `[split]` config section)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitOptions {
    pub policy: ExtractionPolicy,
    /// Fullnames (or unambiguous short names) that are always extracted
    pub extract: BTreeSet<String>,
    /// Minimum compact size in bytes for an unmarked type to be extracted
    pub min_size: usize,
    /// Extracted subjects become `prefix + short name`
    pub subject_prefix: Option<String>,
    /// Subject for the root schema; the root fullname when unset
    pub root_subject: Option<String>,
}

impl SplitOptions {
    pub fn extract_all() -> Self {
        Self {
            policy: ExtractionPolicy::All,
            ..Self::default()
        }
    }

    pub fn with_root_subject(mut self, subject: impl Into<String>) -> Self {
        self.root_subject = Some(subject.into());
        self
    }

    pub fn with_extract(mut self, name: impl Into<String>) -> Self {
        self.extract.insert(name.into());
        self
    }
}

/// Rewrites one extracted part: nested extracted definitions become names,
/// and every referenced part is recorded.
struct PartBuilder<'a> {
    fullname: &'a str,
    extracted: &'a BTreeSet<String>,
    owners: &'a HashMap<String, String>,
    references: Vec<String>,
}

impl PartBuilder<'_> {
    fn depend_on(&mut self, fullname: &str) {
        if fullname != self.fullname && !self.references.iter().any(|r| r == fullname) {
            self.references.push(fullname.to_string());
        }
    }
}

impl SchemaVisitor for PartBuilder<'_> {
    fn definition(&mut self, fullname: &str, site: &mut Value) -> Result<Visit> {
        if fullname != self.fullname && self.extracted.contains(fullname) {
            *site = Value::String(fullname.to_string());
            self.depend_on(fullname);
            return Ok(Visit::Skip);
        }
        Ok(Visit::Continue)
    }

    fn reference(&mut self, fullname: &str, _site: &mut Value) -> Result<Visit> {
        let owner = self
            .owners
            .get(fullname)
            .ok_or_else(|| SchemaError::UnresolvedReference {
                name: fullname.to_string(),
            })?
            .clone();
        self.depend_on(&owner);
        Ok(Visit::Skip)
    }
}

/// Splits monolithic schemas according to `SplitOptions`
#[derive(Debug, Clone, Default)]
pub struct Splitter {
    options: SplitOptions,
}

impl Splitter {
    pub fn new(options: SplitOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SplitOptions {
        &self.options
    }

    /// Parse schema text and split it
    pub fn split_str(&self, text: &str) -> Result<SchemaGraph> {
        let document: Value = serde_json::from_str(text)?;
        self.split(&document)
    }

    /// Split a monolithic schema document into a `SchemaGraph`.
    ///
    /// Fails with `ConflictingDefinition` when a fullname is defined twice with
    /// different content and with `CyclicReference` when the chosen extraction
    /// would make two parts reference each other. Nothing touches the network.
    pub fn split(&self, document: &Value) -> Result<SchemaGraph> {
        let root_type = document.get("type").and_then(Value::as_str);
        if !matches!(root_type, Some("record") | Some("error")) {
            return Err(SchemaError::InvalidSchema(
                "top-level schema must be a named record".to_string(),
            ));
        }

        let names = collect_definitions(document)?;
        apache_avro::Schema::parse(document)?;

        let root = names
            .definitions
            .first()
            .ok_or_else(|| SchemaError::InvalidSchema("schema defines no named types".to_string()))?
            .fullname
            .clone();

        let mut extracted = self.select(&names, &root)?;
        let owners = close_over_references(&names, &mut extracted, &root);
        debug!(
            root = %root,
            definitions = names.definitions.len(),
            extracted = extracted.len(),
            "Selected types to extract"
        );

        let mut root_node = None;
        let mut parts = Vec::new();
        for definition in &names.definitions {
            let is_root = definition.fullname == root;
            if !is_root && !extracted.contains(&definition.fullname) {
                continue;
            }
            let mut schema = if is_root {
                document.clone()
            } else {
                definition.schema.clone()
            };
            let mut builder = PartBuilder {
                fullname: &definition.fullname,
                extracted: &extracted,
                owners: &owners,
                references: Vec::new(),
            };
            walk_mut(&mut schema, "", &mut builder)?;

            let mut node = SchemaNode::new(definition.fullname.clone(), schema, builder.references);
            if is_root {
                node.subject = self.options.root_subject.clone();
                root_node = Some(node);
            } else {
                node.subject = self
                    .options
                    .subject_prefix
                    .as_ref()
                    .map(|prefix| format!("{}{}", prefix, short_name(&definition.fullname)));
                parts.push(node);
            }
        }

        let root_node = root_node.ok_or_else(|| SchemaError::Internal("root definition lost".to_string()))?;
        let graph = SchemaGraph::from_nodes(root_node, parts, Vec::new())?;
        info!(
            root = %root,
            parts = graph.node_count(),
            "Split schema"
        );
        Ok(graph)
    }

    fn select(&self, names: &DocumentNames, root: &str) -> Result<BTreeSet<String>> {
        let mut marked = BTreeSet::new();
        for requested in &self.options.extract {
            marked.insert(find_definition(names, requested)?);
        }
        marked.remove(root);

        let mut extracted = BTreeSet::new();
        for definition in &names.definitions {
            if definition.fullname == root {
                continue;
            }
            if marked.contains(&definition.fullname) {
                extracted.insert(definition.fullname.clone());
                continue;
            }
            let chosen = match self.options.policy {
                ExtractionPolicy::All => true,
                ExtractionPolicy::Shared => definition.uses > 1,
            };
            let large_enough = definition.schema.to_string().len() >= self.options.min_size;
            if chosen && large_enough {
                extracted.insert(definition.fullname.clone());
            }
        }
        Ok(extracted)
    }
}

/// Split with the default options (shared types only)
pub fn split(document: &Value) -> Result<SchemaGraph> {
    Splitter::default().split(document)
}

fn find_definition(names: &DocumentNames, requested: &str) -> Result<String> {
    if names.contains(requested) {
        return Ok(requested.to_string());
    }
    let matches: Vec<&str> = names
        .definitions
        .iter()
        .filter(|d| short_name(&d.fullname) == requested)
        .map(|d| d.fullname.as_str())
        .collect();
    match matches.as_slice() {
        [single] => Ok(single.to_string()),
        [] => Err(SchemaError::InvalidSchema(format!(
            "cannot extract {}: no such named type",
            requested
        ))),
        _ => Err(SchemaError::InvalidSchema(format!(
            "cannot extract {}: ambiguous, use one of {}",
            requested,
            matches.join(", ")
        ))),
    }
}

/// Extract every type referenced from a part other than the one holding its
/// definition, repeating until none is left. Returns the final owner map.
fn close_over_references(
    names: &DocumentNames,
    extracted: &mut BTreeSet<String>,
    root: &str,
) -> HashMap<String, String> {
    loop {
        let owners = owners(names, extracted, root);
        let mut added = Vec::new();
        for (enclosing, target) in &names.references {
            if target == root || extracted.contains(target) || !names.contains(target) {
                continue;
            }
            let from = enclosing
                .as_ref()
                .and_then(|name| owners.get(name))
                .map_or(root, String::as_str);
            if owners.get(target).map(String::as_str) != Some(from) {
                added.push(target.clone());
            }
        }
        if added.is_empty() {
            return owners;
        }
        debug!(types = ?added, "Extracting types referenced across parts");
        extracted.extend(added);
    }
}

/// Map every defined fullname to the part that will hold its definition.
fn owners(names: &DocumentNames, extracted: &BTreeSet<String>, root: &str) -> HashMap<String, String> {
    let mut owners: HashMap<String, String> = HashMap::new();
    for definition in &names.definitions {
        let owner = if definition.fullname == root || extracted.contains(&definition.fullname) {
            definition.fullname.clone()
        } else {
            definition
                .parent
                .as_ref()
                .and_then(|parent| owners.get(parent))
                .cloned()
                .unwrap_or_else(|| root.to_string())
        };
        owners.insert(definition.fullname.clone(), owner);
    }
    owners
}

// ============================================================================
// Split report
// ============================================================================

/// One row of a `SplitReport`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartSummary {
    pub fullname: String,
    pub subject: String,
    pub size: usize,
    pub checksum: Checksum,
    pub references: Vec<String>,
    pub is_root: bool,
    /// 1-based position in the registration order
    pub order: usize,
}

/// Summary of a split, written as `manifest.json` by `write_parts`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitReport {
    pub root: String,
    pub original_size: usize,
    pub parts: Vec<PartSummary>,
}

impl SplitReport {
    pub fn from_graph(graph: &SchemaGraph, original_size: usize) -> Self {
        let parts = graph
            .registration_order()
            .into_iter()
            .enumerate()
            .map(|(position, node)| PartSummary {
                fullname: node.fullname.clone(),
                subject: subject_for(node),
                size: node.size(),
                checksum: node.checksum(),
                references: node.references.clone(),
                is_root: node.is_root,
                order: position + 1,
            })
            .collect();
        Self {
            root: graph.root().fullname.clone(),
            original_size,
            parts,
        }
    }

    pub fn total_size(&self) -> usize {
        self.parts.iter().map(|p| p.size).sum()
    }

    pub fn largest(&self) -> Option<&PartSummary> {
        self.parts.iter().max_by_key(|p| p.size)
    }

    /// Parts larger than `limit` bytes
    pub fn oversized(&self, limit: usize) -> Vec<&PartSummary> {
        self.parts.iter().filter(|p| p.size > limit).collect()
    }
}

/// Subject a node registers under: the requested one, else its fullname
pub fn subject_for(node: &SchemaNode) -> String {
    node.subject.clone().unwrap_or_else(|| node.fullname.clone())
}

/// Write every part as `<sanitized subject>.avsc` plus a `manifest.json`.
///
/// Returns the written paths, parts first in registration order.
pub fn write_parts(graph: &SchemaGraph, dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::new();
    for node in graph.registration_order() {
        let path = dir.join(format!("{}.avsc", sanitize_filename(&subject_for(node))));
        fs::write(&path, serde_json::to_string_pretty(&node.document)?)?;
        debug!(path = %path.display(), "Wrote schema part");
        written.push(path);
    }

    let original_size = crate::compile::reassemble(graph)?.to_string().len();
    let report = SplitReport::from_graph(graph, original_size);
    let manifest = dir.join("manifest.json");
    fs::write(&manifest, serde_json::to_string_pretty(&report)?)?;
    written.push(manifest);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{equivalent, reassemble};
    use serde_json::json;

    fn order() -> Value {
        json!({
            "type": "record",
            "name": "Order",
            "namespace": "com.example.events",
            "fields": [
                {"name": "orderId", "type": "string"},
                {"name": "customer", "type": {
                    "type": "record",
                    "name": "Customer",
                    "namespace": "com.example.types",
                    "fields": [
                        {"name": "name", "type": "string"},
                        {"name": "billingAddress", "type": {
                            "type": "record",
                            "name": "Address",
                            "fields": [
                                {"name": "street", "type": "string"},
                                {"name": "city", "type": "string"}
                            ]
                        }},
                        {"name": "shippingAddress", "type": ["null", "Address"], "default": null}
                    ]
                }},
                {"name": "subtotal", "type": {
                    "type": "record",
                    "name": "Money",
                    "namespace": "com.example.types",
                    "fields": [
                        {"name": "amount", "type": "double"},
                        {"name": "currency", "type": "string"}
                    ]
                }},
                {"name": "total", "type": "com.example.types.Money"}
            ]
        })
    }

    fn fullnames(graph: &SchemaGraph) -> Vec<String> {
        graph.registration_order().into_iter().map(|n| n.fullname.clone()).collect()
    }

    #[test]
    fn test_shared_policy_extracts_reused_types() {
        let graph = split(&order()).unwrap();
        assert_eq!(
            fullnames(&graph),
            vec!["com.example.types.Address", "com.example.types.Money", "com.example.events.Order"]
        );
        let root = graph.root();
        assert_eq!(root.document["fields"][2]["type"], json!("com.example.types.Money"));
        assert_eq!(root.references, vec!["com.example.types.Address", "com.example.types.Money"]);
    }

    #[test]
    fn test_explicit_mark_extracts_customer() {
        let splitter = Splitter::new(SplitOptions::default().with_extract("Customer"));
        let graph = splitter.split(&order()).unwrap();
        let order: Vec<_> = graph
            .registration_order()
            .into_iter()
            .map(|n| n.short_name().to_string())
            .collect();
        assert_eq!(order, vec!["Address", "Money", "Customer", "Order"]);
        assert_eq!(graph.root().references, vec!["com.example.types.Customer", "com.example.types.Money"]);
        assert_eq!(
            graph.get("com.example.types.Customer").unwrap().references,
            vec!["com.example.types.Address"]
        );
    }

    #[test]
    fn test_all_policy() {
        let graph = Splitter::new(SplitOptions::extract_all()).split(&order()).unwrap();
        assert_eq!(graph.node_count(), 4);
        assert!(graph.get("com.example.types.Customer").is_some());
    }

    #[test]
    fn test_min_size_keeps_small_types_inline() {
        let options = SplitOptions {
            policy: ExtractionPolicy::All,
            min_size: 10_000,
            ..SplitOptions::default()
        };
        let graph = Splitter::new(options).split(&order()).unwrap();
        assert_eq!(graph.node_count(), 1);
        assert!(graph.root().references.is_empty());
    }

    #[test]
    fn test_small_type_referenced_from_another_part_is_extracted() {
        let document = json!({
            "type": "record",
            "name": "Order",
            "namespace": "a",
            "fields": [
                {"name": "total", "type": {
                    "type": "record",
                    "name": "Money",
                    "fields": [{"name": "cents", "type": "long"}]
                }},
                {"name": "items", "type": {"type": "array", "items": {
                    "type": "record",
                    "name": "LineItem",
                    "fields": [
                        {"name": "sku", "type": "string"},
                        {"name": "price", "type": "Money"},
                        {"name": "note", "type": ["null", "string"], "default": null}
                    ]
                }}}
            ]
        });
        let options = SplitOptions {
            policy: ExtractionPolicy::All,
            min_size: 100,
            ..SplitOptions::default()
        };
        let graph = Splitter::new(options).split(&document).unwrap();
        assert_eq!(fullnames(&graph), vec!["a.Money", "a.LineItem", "a.Order"]);
        assert_eq!(graph.get("a.LineItem").unwrap().references, vec!["a.Money"]);
        assert_eq!(graph.root().document["fields"][0]["type"], json!("a.Money"));

        let rebuilt = reassemble(&graph).unwrap();
        assert!(equivalent(&rebuilt, &document).unwrap(), "rebuilt: {rebuilt}");
    }

    #[test]
    fn test_reassemble_is_equivalent() {
        for options in [
            SplitOptions::default(),
            SplitOptions::extract_all(),
            SplitOptions::default().with_extract("com.example.types.Customer"),
        ] {
            let graph = Splitter::new(options).split(&order()).unwrap();
            let rebuilt = reassemble(&graph).unwrap();
            assert!(equivalent(&rebuilt, &order()).unwrap(), "rebuilt: {rebuilt}");
        }
    }

    #[test]
    fn test_extracted_parts_parse_after_inlining() {
        let graph = Splitter::new(SplitOptions::extract_all()).split(&order()).unwrap();
        let money = graph.get("com.example.types.Money").unwrap();
        assert_eq!(money.document["namespace"], json!("com.example.types"));
        apache_avro::Schema::parse(&money.document).unwrap();
    }

    #[test]
    fn test_subject_prefix_and_root_subject() {
        let options = SplitOptions {
            subject_prefix: Some("shop-".to_string()),
            ..SplitOptions::default()
        }
        .with_root_subject("orders-value");
        let graph = Splitter::new(options).split(&order()).unwrap();
        assert_eq!(graph.root().subject.as_deref(), Some("orders-value"));
        assert_eq!(
            graph.get("com.example.types.Money").unwrap().subject.as_deref(),
            Some("shop-Money")
        );
    }

    #[test]
    fn test_cycle_through_root_rejected() {
        let schema = json!({
            "type": "record",
            "name": "Tree",
            "namespace": "a",
            "fields": [
                {"name": "child", "type": {
                    "type": "record",
                    "name": "Branch",
                    "fields": [{"name": "parent", "type": ["null", "Tree"], "default": null}]
                }}
            ]
        });
        let splitter = Splitter::new(SplitOptions::default().with_extract("a.Branch"));
        let err = splitter.split(&schema).unwrap_err();
        assert!(matches!(err, SchemaError::CyclicReference { .. }), "{err}");
    }

    #[test]
    fn test_recursive_type_stays_in_one_part() {
        let schema = json!({
            "type": "record",
            "name": "Node",
            "namespace": "a",
            "fields": [
                {"name": "value", "type": "long"},
                {"name": "next", "type": ["null", "Node"], "default": null}
            ]
        });
        let graph = split(&schema).unwrap();
        assert_eq!(graph.node_count(), 1);
        assert!(graph.root().references.is_empty());
    }

    #[test]
    fn test_conflicting_definition_rejected() {
        let schema = json!({
            "type": "record",
            "name": "Pair",
            "fields": [
                {"name": "left", "type": {"type": "enum", "name": "Side", "symbols": ["A"]}},
                {"name": "right", "type": {"type": "enum", "name": "Side", "symbols": ["B"]}}
            ]
        });
        assert!(matches!(
            split(&schema),
            Err(SchemaError::ConflictingDefinition { fullname }) if fullname == "Side"
        ));
    }

    #[test]
    fn test_non_record_root_rejected() {
        assert!(matches!(
            split(&json!({"type": "enum", "name": "E", "symbols": ["A"]})),
            Err(SchemaError::InvalidSchema(_))
        ));
    }

    #[test]
    fn test_unknown_mark_rejected() {
        let splitter = Splitter::new(SplitOptions::default().with_extract("Nope"));
        assert!(matches!(splitter.split(&order()), Err(SchemaError::InvalidSchema(_))));
    }

    #[test]
    fn test_report_and_write_parts() {
        let graph = split(&order()).unwrap();
        let report = SplitReport::from_graph(&graph, order().to_string().len());
        assert_eq!(report.parts.len(), 3);
        assert_eq!(report.parts.last().unwrap().order, 3);
        assert!(report.parts.last().unwrap().is_root);
        assert!(report.oversized(MAX_SCHEMA_BYTES).is_empty());

        let dir = tempfile::tempdir().unwrap();
        let written = write_parts(&graph, dir.path()).unwrap();
        assert_eq!(written.len(), 4);
        assert!(dir.path().join("com_example_types_Money.avsc").exists());
        let manifest: SplitReport =
            serde_json::from_str(&fs::read_to_string(dir.path().join("manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest.root, "com.example.events.Order");
    }
}
