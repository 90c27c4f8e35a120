//! Facade crate for the quadosm map-data store.
//!
//! This crate re-exports the core domain types and the query surface, and
//! exposes bulk import, change application and replication behind the `data`
//! feature.

#![forbid(unsafe_code)]

pub use quadosm_core::{
    BoundingBox, Element, ElementId, ElementKind, ElementQuery, EntityStore, MapData, Member,
    Metadata, MemoryStore, Node, QuadKey, QueryBuilder, QueryError, QueryResult, Relation,
    ReplicationState, ReplicationStateStore, StoreError, Tags, TileCoord, TileData, TileError,
    Way, WayGeometry, Zoom, execute, fetch_map, get_tile, polyline, resolve_way_geometry,
};

#[cfg(feature = "store-sqlite")]
pub use quadosm_core::SqliteEntityStore;

#[cfg(feature = "data")]
pub use quadosm_data::{
    ApplierConfig, ApplyError, ApplySummary, ChangesetApplier, DeleteMode,
    DirectoryReplicationSource, HttpReplicationSource, ImportConfig, ImportError, ImportSummary,
    PendingBlockPolicy, ReplicationConfig, ReplicationDriver, ReplicationError,
    ReplicationReport, ReplicationSource, RetryPolicy, StopReason, apply_change, import_path,
};
