//! Avro Schema Walking
//!
//! Namespace-aware traversal of Avro schema JSON. The walker visits type
//! positions only (field types, array items, map values, union branches), so
//! strings in docs, defaults or symbols are never mistaken for names.
//!
//! Visitors see two kinds of sites:
//! - a named type **definition** (`record`, `error`, `enum`, `fixed`)
//! - a **reference** to a named type by name
//!
//! Both callbacks receive the site mutably and may rewrite it in place, which is
//! how the splitter replaces inline definitions with names and the inliner
//! splices definitions back in.

use serde_json::{Map, Value};

use crate::error::{Result, SchemaError};
use crate::schema::{is_named_kind, is_primitive, namespace_of, qualify};

/// What the walker should do after a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Descend into the (possibly rewritten) site
    Continue,
    /// Leave the site alone
    Skip,
}

/// Callbacks for `walk_mut`
pub trait SchemaVisitor {
    /// Called on a named type definition before its fields are walked
    fn definition(&mut self, fullname: &str, site: &mut Value) -> Result<Visit>;

    /// Called on a name reference. Returning `Continue` after replacing the site
    /// with a definition makes the walker visit that definition.
    fn reference(&mut self, fullname: &str, site: &mut Value) -> Result<Visit>;

    /// Called after the fields of a definition have been walked
    fn leave_definition(&mut self, _fullname: &str) -> Result<()> {
        Ok(())
    }
}

/// Shape of an object-form schema, computed before any mutation
enum Shape {
    Named { fullname: String, kind: String },
    Array,
    Map,
    /// `{"type": <schema>}` wrapping, including primitives with a logicalType
    Wrapped,
}

/// Fullname declared by a named type definition
pub fn definition_fullname(map: &Map<String, Value>, enclosing_namespace: &str) -> Result<String> {
    let name = map
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| SchemaError::InvalidSchema("named type without a name".to_string()))?;
    if name.contains('.') {
        return Ok(name.to_string());
    }
    match map.get("namespace").and_then(Value::as_str) {
        Some(namespace) => Ok(qualify(name, namespace)),
        None => Ok(qualify(name, enclosing_namespace)),
    }
}

fn shape_of(map: &Map<String, Value>, namespace: &str) -> Result<Shape> {
    match map.get("type") {
        Some(Value::String(kind)) if is_named_kind(kind) => Ok(Shape::Named {
            fullname: definition_fullname(map, namespace)?,
            kind: kind.clone(),
        }),
        Some(Value::String(kind)) if kind == "array" => Ok(Shape::Array),
        Some(Value::String(kind)) if kind == "map" => Ok(Shape::Map),
        Some(_) => Ok(Shape::Wrapped),
        None => Err(SchemaError::InvalidSchema(format!(
            "schema object without a type: {}",
            Value::Object(map.clone())
        ))),
    }
}

enum Site {
    Primitive,
    Reference(String),
    Union,
    Object(Shape),
}

fn site_of(schema: &Value, namespace: &str) -> Result<Site> {
    match schema {
        Value::String(name) if is_primitive(name) => Ok(Site::Primitive),
        Value::String(name) => Ok(Site::Reference(qualify(name, namespace))),
        Value::Array(_) => Ok(Site::Union),
        Value::Object(map) => Ok(Site::Object(shape_of(map, namespace)?)),
        other => Err(SchemaError::InvalidSchema(format!("not a schema: {}", other))),
    }
}

fn walk_key<V: SchemaVisitor>(schema: &mut Value, key: &str, namespace: &str, visitor: &mut V) -> Result<()> {
    match schema.get_mut(key) {
        Some(inner) => walk_mut(inner, namespace, visitor),
        None => Err(SchemaError::InvalidSchema(format!("schema is missing '{}'", key))),
    }
}

/// Walk `schema` in document order, resolving names against `namespace`.
pub fn walk_mut<V: SchemaVisitor>(schema: &mut Value, namespace: &str, visitor: &mut V) -> Result<()> {
    match site_of(schema, namespace)? {
        Site::Primitive => Ok(()),
        Site::Reference(fullname) => {
            if visitor.reference(&fullname, schema)? == Visit::Continue && !schema.is_string() {
                walk_mut(schema, namespace, visitor)?;
            }
            Ok(())
        }
        Site::Union => {
            if let Some(branches) = schema.as_array_mut() {
                for branch in branches.iter_mut() {
                    walk_mut(branch, namespace, visitor)?;
                }
            }
            Ok(())
        }
        Site::Object(Shape::Named { fullname, kind }) => {
            if visitor.definition(&fullname, schema)? == Visit::Skip {
                return Ok(());
            }
            if kind == "record" || kind == "error" {
                let inner = namespace_of(&fullname).to_string();
                if let Some(fields) = schema.get_mut("fields").and_then(Value::as_array_mut) {
                    for field in fields.iter_mut() {
                        if field.get("type").is_none() {
                            return Err(SchemaError::InvalidSchema(format!(
                                "field without a type in {}",
                                fullname
                            )));
                        }
                        walk_key(field, "type", &inner, visitor)?;
                    }
                }
            }
            visitor.leave_definition(&fullname)
        }
        Site::Object(Shape::Array) => walk_key(schema, "items", namespace, visitor),
        Site::Object(Shape::Map) => walk_key(schema, "values", namespace, visitor),
        Site::Object(Shape::Wrapped) => walk_key(schema, "type", namespace, visitor),
    }
}

/// Make the namespace of a definition explicit so it can be moved to another document.
pub fn with_explicit_namespace(mut definition: Value, fullname: &str) -> Value {
    if let Some(map) = definition.as_object_mut() {
        let named_fully = map
            .get("name")
            .and_then(Value::as_str)
            .map(|name| name.contains('.'))
            .unwrap_or(false);
        if !named_fully {
            map.insert(
                "namespace".to_string(),
                Value::String(namespace_of(fullname).to_string()),
            );
        }
    }
    definition
}

/// A named type found by `collect_definitions`
#[derive(Debug, Clone)]
pub struct Definition {
    pub fullname: String,
    pub kind: String,
    /// The definition subtree as written, with its namespace made explicit
    pub schema: Value,
    /// Enclosing named type, `None` for the top-level type
    pub parent: Option<String>,
    /// 1 for the definition plus one per name reference anywhere in the document
    pub uses: usize,
}

struct Collector {
    definitions: Vec<Definition>,
    stack: Vec<String>,
    references: Vec<(Option<String>, String)>,
}

impl SchemaVisitor for Collector {
    fn definition(&mut self, fullname: &str, site: &mut Value) -> Result<Visit> {
        if let Some(existing) = self.definitions.iter_mut().find(|d| d.fullname == fullname) {
            let candidate = with_explicit_namespace(site.clone(), fullname);
            if candidate != existing.schema {
                return Err(SchemaError::ConflictingDefinition {
                    fullname: fullname.to_string(),
                });
            }
            existing.uses += 1;
            return Ok(Visit::Skip);
        }
        let kind = site
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.definitions.push(Definition {
            fullname: fullname.to_string(),
            kind,
            schema: with_explicit_namespace(site.clone(), fullname),
            parent: self.stack.last().cloned(),
            uses: 1,
        });
        self.stack.push(fullname.to_string());
        Ok(Visit::Continue)
    }

    fn reference(&mut self, fullname: &str, _site: &mut Value) -> Result<Visit> {
        self.references
            .push((self.stack.last().cloned(), fullname.to_string()));
        Ok(Visit::Skip)
    }

    fn leave_definition(&mut self, _fullname: &str) -> Result<()> {
        self.stack.pop();
        Ok(())
    }
}

/// Named types defined in a document, and the name references between them
#[derive(Debug, Clone, Default)]
pub struct DocumentNames {
    /// Definitions in document order
    pub definitions: Vec<Definition>,
    /// `(enclosing definition, referenced fullname)` in document order
    pub references: Vec<(Option<String>, String)>,
}

impl DocumentNames {
    pub fn get(&self, fullname: &str) -> Option<&Definition> {
        self.definitions.iter().find(|d| d.fullname == fullname)
    }

    pub fn contains(&self, fullname: &str) -> bool {
        self.get(fullname).is_some()
    }
}

/// Collect every named definition and name reference in `document`.
///
/// Fails with `ConflictingDefinition` when one fullname is defined twice with
/// different content.
pub fn collect_definitions(document: &Value) -> Result<DocumentNames> {
    let mut collector = Collector {
        definitions: Vec::new(),
        stack: Vec::new(),
        references: Vec::new(),
    };
    let mut scratch = document.clone();
    walk_mut(&mut scratch, "", &mut collector)?;

    for (_, fullname) in &collector.references {
        if let Some(definition) = collector
            .definitions
            .iter_mut()
            .find(|d| &d.fullname == fullname)
        {
            definition.uses += 1;
        }
    }

    Ok(DocumentNames {
        definitions: collector.definitions,
        references: collector.references,
    })
}
