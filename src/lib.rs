//! facetdb - Core Engine
//!
//! Compatibility core for a generic, self-describing object/attribute data
//! store: every record, whether a type definition or the data conforming to
//! it, lives in one flat self-referential relation keyed by id, parent,
//! type pointer, order and a single text payload.
//!
//! # Architecture
//!
//! - Relation Layer: the `RelationStore` seam plus an in-memory store
//! - Schema Layer: typed field lists and instance resolution over raw rows
//! - Lifecycle Layer: create/reorder/renumber/delete primitives
//! - Grant Layer: recursive permission resolution over the same graph
//! - Report Layer: compile, execute and render stored report definitions
//! - Dump Layer: delta-encoded text serialization of the whole relation
//! - Pool Layer: bounded, reused sessions for concurrent requests

pub mod config;
pub mod error;
pub mod store;
pub mod types;

// Schema and lifecycle modules
pub mod ops;
pub mod schema;

// Authorization module
pub mod grants;

// Report modules
pub mod render;
pub mod report;
pub mod report_exec;

// Dump codec module
pub mod dump;

// Session pool module
pub mod pool;

pub use config::Config;
pub use error::{CoreError, Result};
pub use store::{MemoryStore, RelationStore};
pub use types::{BaseType, FieldModifiers, Row, RowId, ROOT};

// Schema exports
pub use ops::Ops;
pub use schema::{
    FieldDef, FieldTarget, ReferencedObject, ResolvedInstance, ResolvedValue, SchemaResolver,
    TypeDefinition, TypeKind,
};

// Grant exports
pub use grants::{GrantLevel, GrantResolver, GrantRule, GrantSet, Principal};

// Report exports
pub use render::{render, render_envelope, RenderShape};
pub use report::{ColumnSpec, ReportCompiler, ReportPlan};
pub use report_exec::{
    Filter, FromBound, OrderSpec, Page, ReportCell, ReportExecutor, ReportResult, ReportRow,
};

// Dump exports
pub use dump::{DumpCodec, RestoreStats};

// Pool exports
pub use pool::{PoolConfig, PooledSession, Session, SessionPool};
