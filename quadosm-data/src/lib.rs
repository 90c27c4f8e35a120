//! Ingestion and replication for the quadosm map-data service.
//!
//! Responsibilities:
//! - Parse OSM XML and osmChange documents into store primitives.
//! - Bulk load XML, bzip2-compressed XML and PBF extracts.
//! - Apply osmChange blocks to an [`quadosm_core::EntityStore`].
//! - Follow a replication feed over HTTP or from a local mirror.
//!
//! Boundaries:
//! - Tiling, indexing and query semantics live in `quadosm-core`.
//! - Store writes go through [`quadosm_core::WriteBatch`] only.
//!
//! Invariants:
//! - A change block is written in one batch or not at all.
//! - The replication marker only advances past fully applied units.
//!
//! # Examples
//!
//! ```
//! use quadosm_core::{EntityStore, MemoryStore};
//! use quadosm_data::{ApplierConfig, apply_change};
//!
//! let change = r#"<osmChange version="0.6">
//!   <create>
//!     <node id="1" version="1" timestamp="2024-03-01T12:00:00Z" lat="51.4769" lon="-0.0005"/>
//!   </create>
//! </osmChange>"#;
//! let mut store = MemoryStore::new();
//! let summary = apply_change(&mut store, change.as_bytes(), ApplierConfig::default())
//!     .expect("valid change");
//! assert_eq!(summary.created, 1);
//! assert!(store.node(1).expect("read").is_some());
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

mod applier;
mod import;
pub mod replication;
mod xml;

pub use applier::{
    ApplierConfig, ApplyError, ApplySummary, ChangesetApplier, DeleteMode, PendingBlockPolicy,
    apply_change,
};
pub use import::{
    DEFAULT_BATCH_SIZE, ImportConfig, ImportError, ImportSummary, InputFormat, import_path,
    import_pbf, import_xml,
};
pub use replication::{
    DirectoryReplicationSource, HttpReplicationSource, Locator, MAX_SEQUENCE, RemoteState,
    ReplicationConfig, ReplicationDriver, ReplicationError, ReplicationReport, ReplicationSource,
    RetryPolicy, StopReason, TransportError,
};
pub use xml::{Action, ChangeEvent, ChangeReader, NodeRecord, ParseError, Primitive};

#[cfg(any(test, feature = "test-support"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-support")))]
pub mod test_support;
