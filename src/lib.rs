//! # Provenance
//!
//! Tracks which sources (holding institutions, collections, items) contributed
//! to records of any registered type, keeps a denormalized "is sourced" flag in
//! step with the registry, answers membership scopes inside the store, and
//! repairs the registry after out-of-band deletions.

pub mod cache;
pub mod config;
pub mod error;
pub mod gc;
pub mod model;
pub mod persistence;
pub mod provenance;
pub mod query;
pub mod store;

// Re-export main types for convenience
pub use cache::CacheSync;
pub use config::{ProvenanceConfig, SourceableOptions, SourceableType, Strategy, TypeRegistry};
pub use error::{BatchFailure, ProvenanceError, Result};
pub use gc::{GarbageCollector, GcFailure, GcPass, GcReport, MaintenanceReport};
pub use model::{EntryId, RegistryEntry, Source, SourceKind, SourceSet, SourceableRef};
pub use persistence::{PersistentOpenOptions, PersistentStore};
pub use provenance::{Batch, BatchReport, CancelFlag, Provenance};
pub use query::{Page, Paged, Predicate, Scope, ScopeQueryEngine};
pub use store::{ProvenanceStore, Store, UnitOfWork, Write};

