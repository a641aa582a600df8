//! Schema assembly
//!
//! Turns a schema that refers to named types by name into a self-contained
//! document by splicing in their definitions. The splitter uses this to
//! reassemble a graph, and the resolver uses it to compile a registered schema
//! against its resolved references.
//!
//! The first reference to a type that the document does not define is replaced
//! by the full definition (with an explicit namespace); later references stay
//! names, which is what the Avro parser expects.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Result, SchemaError};
use crate::graph::walk::{collect_definitions, walk_mut, with_explicit_namespace, SchemaVisitor, Visit};
use crate::graph::SchemaGraph;

/// Named type definitions available for inlining, by fullname
#[derive(Debug, Clone, Default)]
pub struct DefinitionIndex {
    definitions: HashMap<String, Value>,
}

impl DefinitionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every named type defined anywhere in `document`.
    ///
    /// The same fullname may arrive from several documents (diamond-shaped
    /// references); it must carry the same definition each time.
    pub fn add_document(&mut self, document: &Value) -> Result<()> {
        let names = collect_definitions(document)?;
        for definition in names.definitions {
            match self.definitions.get(&definition.fullname) {
                Some(existing) if normalize(existing)? != normalize(&definition.schema)? => {
                    return Err(SchemaError::ConflictingDefinition {
                        fullname: definition.fullname,
                    });
                }
                Some(_) => {}
                None => {
                    self.definitions.insert(definition.fullname, definition.schema);
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, fullname: &str) -> Option<&Value> {
        self.definitions.get(fullname)
    }

    pub fn contains(&self, fullname: &str) -> bool {
        self.definitions.contains_key(fullname)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

struct Inliner<'a> {
    index: &'a DefinitionIndex,
    defined: HashMap<String, Value>,
}

impl SchemaVisitor for Inliner<'_> {
    fn definition(&mut self, fullname: &str, site: &mut Value) -> Result<Visit> {
        if let Some(previous) = self.defined.get(fullname) {
            let candidate = with_explicit_namespace(site.clone(), fullname);
            if normalize(previous)? != normalize(&candidate)? {
                return Err(SchemaError::ConflictingDefinition {
                    fullname: fullname.to_string(),
                });
            }
            *site = Value::String(fullname.to_string());
            return Ok(Visit::Skip);
        }
        self.defined
            .insert(fullname.to_string(), with_explicit_namespace(site.clone(), fullname));
        Ok(Visit::Continue)
    }

    fn reference(&mut self, fullname: &str, site: &mut Value) -> Result<Visit> {
        if self.defined.contains_key(fullname) {
            return Ok(Visit::Skip);
        }
        match self.index.get(fullname) {
            Some(definition) => {
                *site = definition.clone();
                Ok(Visit::Continue)
            }
            None => Err(SchemaError::UnresolvedReference {
                name: fullname.to_string(),
            }),
        }
    }
}

/// Replace references to types in `index` with their definitions.
///
/// Fails with `UnresolvedReference` for a name that is neither defined in the
/// document nor present in the index.
pub fn inline_references(document: &Value, index: &DefinitionIndex) -> Result<Value> {
    let mut expanded = document.clone();
    let mut inliner = Inliner {
        index,
        defined: HashMap::new(),
    };
    walk_mut(&mut expanded, "", &mut inliner)?;
    Ok(expanded)
}

/// Rebuild the monolithic schema a graph was split from.
pub fn reassemble(graph: &SchemaGraph) -> Result<Value> {
    let mut index = DefinitionIndex::new();
    for node in graph.registration_order() {
        if !node.is_root {
            index.add_document(&node.document)?;
        }
    }
    inline_references(&graph.root().document, &index)
}

/// Parse a self-contained document with the Avro parser.
pub fn parse_compiled(document: &Value) -> Result<apache_avro::Schema> {
    Ok(apache_avro::Schema::parse(document)?)
}

struct Normalizer;

impl SchemaVisitor for Normalizer {
    fn definition(&mut self, fullname: &str, site: &mut Value) -> Result<Visit> {
        if let Some(map) = site.as_object_mut() {
            map.insert("name".to_string(), Value::String(fullname.to_string()));
            map.remove("namespace");
        }
        Ok(Visit::Continue)
    }

    fn reference(&mut self, fullname: &str, site: &mut Value) -> Result<Visit> {
        *site = Value::String(fullname.to_string());
        Ok(Visit::Skip)
    }
}

/// Rewrite every name as a fullname and drop `namespace` attributes.
///
/// Field order, defaults, docs, aliases and logical types are kept, so two
/// documents with equal normal forms describe the same schema.
pub fn normalize(document: &Value) -> Result<Value> {
    let mut normal = document.clone();
    walk_mut(&mut normal, "", &mut Normalizer)?;
    Ok(normal)
}

/// Whether two documents describe the same schema up to namespace spelling.
pub fn equivalent(left: &Value, right: &Value) -> Result<bool> {
    Ok(normalize(left)? == normalize(right)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn money() -> Value {
        json!({
            "type": "record",
            "name": "Money",
            "namespace": "com.example.types",
            "fields": [
                {"name": "amount", "type": "double"},
                {"name": "currency", "type": "string", "default": "USD"}
            ]
        })
    }

    #[test]
    fn test_first_reference_is_inlined() {
        let mut index = DefinitionIndex::new();
        index.add_document(&money()).unwrap();

        let invoice = json!({
            "type": "record",
            "name": "Invoice",
            "namespace": "com.example.billing",
            "fields": [
                {"name": "net", "type": "com.example.types.Money"},
                {"name": "gross", "type": "com.example.types.Money"}
            ]
        });
        let expanded = inline_references(&invoice, &index).unwrap();
        assert_eq!(expanded["fields"][0]["type"]["name"], json!("Money"));
        assert_eq!(expanded["fields"][1]["type"], json!("com.example.types.Money"));
        parse_compiled(&expanded).unwrap();
    }

    #[test]
    fn test_transitive_definitions_come_from_dependency_documents() {
        let customer = json!({
            "type": "record",
            "name": "Customer",
            "namespace": "com.example.types",
            "fields": [
                {"name": "name", "type": "string"},
                {"name": "credit", "type": money()}
            ]
        });
        let mut index = DefinitionIndex::new();
        index.add_document(&customer).unwrap();
        assert!(index.contains("com.example.types.Money"));

        let order = json!({
            "type": "record",
            "name": "Order",
            "fields": [
                {"name": "customer", "type": "com.example.types.Customer"},
                {"name": "total", "type": "com.example.types.Money"}
            ]
        });
        let expanded = inline_references(&order, &index).unwrap();
        assert_eq!(expanded["fields"][1]["type"], json!("com.example.types.Money"));
        let schema = parse_compiled(&expanded).unwrap();
        assert!(matches!(schema, apache_avro::Schema::Record(_)));
    }

    #[test]
    fn test_unresolved_reference() {
        let doc = json!({
            "type": "record",
            "name": "Orphan",
            "fields": [{"name": "x", "type": "com.example.Missing"}]
        });
        let err = inline_references(&doc, &DefinitionIndex::new()).unwrap_err();
        assert!(matches!(err, SchemaError::UnresolvedReference { name } if name == "com.example.Missing"));
    }

    #[test]
    fn test_conflicting_index_entries() {
        let mut other = money();
        other["fields"][0]["type"] = json!("long");
        let mut index = DefinitionIndex::new();
        index.add_document(&money()).unwrap();
        let err = index.add_document(&other).unwrap_err();
        assert!(matches!(err, SchemaError::ConflictingDefinition { .. }));
    }

    #[test]
    fn test_normalize_qualifies_names() {
        let nested = json!({
            "type": "record",
            "name": "Wallet",
            "namespace": "com.example.types",
            "fields": [
                {"name": "balance", "type": {"type": "record", "name": "Money", "fields": [{"name": "amount", "type": "double"}]}},
                {"name": "limit", "type": "Money"}
            ]
        });
        let normal = normalize(&nested).unwrap();
        assert_eq!(normal["name"], json!("com.example.types.Wallet"));
        assert!(normal.get("namespace").is_none());
        assert_eq!(normal["fields"][0]["type"]["name"], json!("com.example.types.Money"));
        assert_eq!(normal["fields"][1]["type"], json!("com.example.types.Money"));
    }

    #[test]
    fn test_equivalence_keeps_defaults() {
        let mut changed = money();
        changed["fields"][1]["default"] = json!("EUR");
        assert!(equivalent(&money(), &money()).unwrap());
        assert!(!equivalent(&money(), &changed).unwrap());
    }
}
