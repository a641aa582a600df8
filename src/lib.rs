//! Schema References
//!
//! Splits monolithic Avro schemas into named sub-schemas that reference each
//! other, registers them with a schema registry in dependency order, and
//! resolves them again from the schema id carried on the wire, so producers
//! and consumers never see the difference between a split and a monolithic
//! schema.
//!
//! ## Features
//!
//! - **Splitting**: shared (or explicitly marked) named types become separate subjects
//! - **Registration**: dependencies first, idempotent on re-run, subject collisions detected
//! - **Resolution**: transitive reference resolution with a single-flight cache
//! - **Wire codec**: `0x00` + big-endian schema id + Avro binary payload
//!
//! ## Architecture
//!
//! ```text
//! order.avsc ──split──▶ SchemaGraph ──register──▶ registry subjects
//!                                                      │
//! bytes ◀──encode── WireCodec ◀──resolve── ReferenceResolver
//! ```

pub mod checksum;
pub mod compile;
pub mod config;
pub mod error;
pub mod graph;
pub mod registrar;
pub mod registry;
pub mod resolver;
pub mod schema;
pub mod split;
pub mod wire;

pub use checksum::Checksum;
pub use compile::{equivalent, reassemble, DefinitionIndex};
pub use config::SchemaRefsConfig;
pub use error::{Result, SchemaError};
pub use graph::SchemaGraph;
pub use registrar::{Registrar, Registration, RegistrationPlan};
pub use registry::{HttpRegistryClient, InMemoryRegistry, RegistryClient};
pub use resolver::{ReferenceResolver, ResolvedSchema};
pub use schema::{RegisteredNode, RegisteredReference, SchemaNode, VersionSelector};
pub use split::{split, ExtractionPolicy, SplitOptions, SplitReport, Splitter};
pub use wire::{WireCodec, WireEnvelope};
