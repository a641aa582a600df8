//! Schema data model
//!
//! Avro naming rules, the nodes of a split schema graph, and the records the
//! registry hands back (references, registered schemas, subject versions).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;

/// Avro primitive type names; any other bare string in type position is a name reference
pub const PRIMITIVE_TYPES: [&str; 8] = [
    "null", "boolean", "int", "long", "float", "double", "bytes", "string",
];

/// Named Avro type kinds (the only types that can be extracted)
pub const NAMED_TYPES: [&str; 4] = ["record", "error", "enum", "fixed"];

pub fn is_primitive(name: &str) -> bool {
    PRIMITIVE_TYPES.contains(&name)
}

pub fn is_named_kind(kind: &str) -> bool {
    NAMED_TYPES.contains(&kind)
}

/// Qualify `name` against an enclosing namespace.
///
/// A name containing a dot is already a fullname; otherwise the namespace is prepended
/// unless it is empty.
pub fn qualify(name: &str, namespace: &str) -> String {
    if name.contains('.') || namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", namespace, name)
    }
}

/// Namespace part of a fullname ("" for the null namespace)
pub fn namespace_of(fullname: &str) -> &str {
    fullname.rsplit_once('.').map(|(ns, _)| ns).unwrap_or("")
}

/// Last component of a fullname (e.g. `Money` for `com.example.types.Money`)
pub fn short_name(fullname: &str) -> &str {
    fullname.rsplit('.').next().unwrap_or(fullname)
}

/// Replace characters that are awkward in file names
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '.' | '/' | ':' | ' ' | '\\' => '_',
            other => other,
        })
        .collect()
}

/// Schema format as reported by the registry (`schemaType`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaType {
    #[default]
    Avro,
    Protobuf,
    Json,
}

impl SchemaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaType::Avro => "AVRO",
            SchemaType::Protobuf => "PROTOBUF",
            SchemaType::Json => "JSON",
        }
    }
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An edge record `{name, subject, version}` attached to a registered schema
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegisteredReference {
    /// Avro fullname of the referenced type
    pub name: String,
    pub subject: String,
    pub version: i32,
}

impl RegisteredReference {
    pub fn new(name: impl Into<String>, subject: impl Into<String>, version: i32) -> Self {
        Self {
            name: name.into(),
            subject: subject.into(),
            version,
        }
    }
}

/// A schema as returned by `GET /schemas/ids/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredSchema {
    #[serde(default)]
    pub id: u32,
    pub schema: String,
    #[serde(default, rename = "schemaType")]
    pub schema_type: SchemaType,
    #[serde(default)]
    pub references: Vec<RegisteredReference>,
}

/// One version of a subject, as returned by `GET /subjects/{subject}/versions/{version}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectVersion {
    pub subject: String,
    pub version: i32,
    pub id: u32,
    pub schema: String,
    #[serde(default, rename = "schemaType")]
    pub schema_type: SchemaType,
    #[serde(default)]
    pub references: Vec<RegisteredReference>,
}

impl SubjectVersion {
    /// Drop the subject/version coordinates, keeping what resolution needs
    pub fn into_registered(self) -> RegisteredSchema {
        RegisteredSchema {
            id: self.id,
            schema: self.schema,
            schema_type: self.schema_type,
            references: self.references,
        }
    }
}

/// Version selector for subject lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionSelector {
    Latest,
    Number(i32),
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSelector::Latest => f.write_str("latest"),
            VersionSelector::Number(n) => write!(f, "{}", n),
        }
    }
}

/// Where one graph node ended up in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredNode {
    pub fullname: String,
    pub subject: String,
    pub version: i32,
    pub id: u32,
    pub registered_at: DateTime<Utc>,
}

/// Registration state of a `SchemaNode`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RegistrationState {
    #[default]
    Unregistered,
    Registered {
        subject: String,
        version: i32,
        id: u32,
    },
}

/// A named Avro schema fragment, one registry subject after splitting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaNode {
    /// Avro fullname of the top-level type (namespace + name)
    pub fullname: String,
    /// Parsed schema document
    pub document: serde_json::Value,
    /// Compact schema text, exactly what gets registered
    pub text: String,
    /// Fullnames of the nodes this one depends on, in first-use order
    pub references: Vec<String>,
    /// Subject requested for this node; derived from the fullname when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub is_root: bool,
    #[serde(default)]
    pub state: RegistrationState,
}

impl SchemaNode {
    pub fn new(fullname: impl Into<String>, document: serde_json::Value, references: Vec<String>) -> Self {
        let text = document.to_string();
        Self {
            fullname: fullname.into(),
            document,
            text,
            references,
            subject: None,
            is_root: false,
            state: RegistrationState::Unregistered,
        }
    }

    pub fn short_name(&self) -> &str {
        short_name(&self.fullname)
    }

    /// Size of the registered text in bytes
    pub fn size(&self) -> usize {
        self.text.len()
    }

    pub fn checksum(&self) -> Checksum {
        Checksum::of_text(&self.text)
    }

    pub fn is_registered(&self) -> bool {
        matches!(self.state, RegistrationState::Registered { .. })
    }
}
