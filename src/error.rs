//! Error types for splitting, registration, resolution and wire decoding

use thiserror::Error;

use crate::schema::RegisteredNode;

/// Result type for schema-refs operations
pub type Result<T> = std::result::Result<T, SchemaError>;

/// Errors raised by the splitter, registry client, registrar, resolver and codec.
///
/// The enum is `Clone` so a single failed in-flight resolution can be handed
/// to every task waiting on it. Foreign errors are carried as messages.
#[derive(Error, Debug, Clone)]
pub enum SchemaError {
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Conflicting definitions for named type {fullname}")]
    ConflictingDefinition { fullname: String },

    #[error("Extraction would create a reference cycle: {}", .cycle.join(" -> "))]
    CyclicReference { cycle: Vec<String> },

    #[error("Unresolved reference to named type {name}")]
    UnresolvedReference { name: String },

    #[error("Subject conflict on {subject}: {reason}")]
    SubjectConflict { subject: String, reason: String },

    #[error("Registry timed out during {operation}")]
    RegistryTimeout { operation: String },

    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("Schema rejected as incompatible for subject {subject}: {message}")]
    Incompatible { subject: String, message: String },

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Registry rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Reference cycle detected between schema ids {ids:?}")]
    ReferenceCycle { ids: Vec<u32> },

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Graph registration aborted after {} registered node(s): {source}", .registered.len())]
    PartialRegistration {
        registered: Vec<RegisteredNode>,
        source: Box<SchemaError>,
    },

    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchemaError {
    /// Transient network failures that a retry may cure
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SchemaError::RegistryTimeout { .. } | SchemaError::RegistryUnavailable(_)
        )
    }

    /// Errors caused by bad bytes on the wire; fatal for one message only
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            SchemaError::MalformedEnvelope(_) | SchemaError::SchemaMismatch(_)
        )
    }

    /// The innermost error, looking through `PartialRegistration`
    pub fn root_cause(&self) -> &SchemaError {
        match self {
            SchemaError::PartialRegistration { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<std::io::Error> for SchemaError {
    fn from(err: std::io::Error) -> Self {
        SchemaError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SchemaError {
    fn from(err: serde_json::Error) -> Self {
        SchemaError::InvalidSchema(format!("JSON error: {}", err))
    }
}

impl From<apache_avro::Error> for SchemaError {
    fn from(err: apache_avro::Error) -> Self {
        SchemaError::InvalidSchema(err.to_string())
    }
}

impl From<config_crate::ConfigError> for SchemaError {
    fn from(err: config_crate::ConfigError) -> Self {
        SchemaError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SchemaError::RegistryTimeout { operation: "GET /schemas/ids/1".into() }.is_transient());
        assert!(SchemaError::RegistryUnavailable("connection refused".into()).is_transient());
        assert!(!SchemaError::Incompatible {
            subject: "orders-value".into(),
            message: "removed field".into()
        }
        .is_transient());
        assert!(!SchemaError::MalformedEnvelope("short".into()).is_transient());
    }

    #[test]
    fn test_cycle_message() {
        let err = SchemaError::CyclicReference {
            cycle: vec!["a.A".into(), "a.B".into(), "a.A".into()],
        };
        assert_eq!(
            err.to_string(),
            "Extraction would create a reference cycle: a.A -> a.B -> a.A"
        );
    }

    #[test]
    fn test_partial_registration_root_cause() {
        let err = SchemaError::PartialRegistration {
            registered: Vec::new(),
            source: Box::new(SchemaError::RegistryUnavailable("down".into())),
        };
        assert!(matches!(err.root_cause(), SchemaError::RegistryUnavailable(_)));
        assert!(err.to_string().contains("0 registered node(s)"));
    }

    #[test]
    fn test_from_serde_error() {
        let raw = "{invalid json}";
        let serde_err = serde_json::from_str::<serde_json::Value>(raw).unwrap_err();
        let err = SchemaError::from(serde_err);
        assert!(matches!(err, SchemaError::InvalidSchema(_)));
    }
}
