//! Core domain types for the quadosm map-data service.
//!
//! The crate models OpenStreetMap-style primitives (nodes, ways and
//! relations), the spherical Mercator tile pyramid used to index them, the
//! [`EntityStore`] abstraction that persists them together with their
//! reverse indexes, and the query layer built on top of the store.
//!
//! Coordinates follow the `geo` convention used throughout the workspace:
//! `x` is longitude and `y` is latitude, both in WGS84 degrees.

#![cfg_attr(docsrs, feature(doc_cfg))]

mod entity;
pub mod polyline;
pub mod query;
pub mod store;
pub mod tiling;

pub use entity::{
    Element, ElementId, ElementKind, Member, Metadata, Node, Relation, Tags, TimestampError,
    UnknownElementKind, Way, parse_timestamp,
};
pub use polyline::MalformedPolyline;
pub use query::{
    ElementQuery, MapData, Predicate, QueryBuilder, QueryError, QueryResult, SpatialFilter,
    TileData, WayGeometry, execute, expand_with_referenced_nodes,
    expand_with_referencing_relations, expand_with_referencing_ways, fetch_map, get_tile,
    resolve_way_geometry,
};
#[cfg(feature = "store-sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "store-sqlite")))]
pub use store::SqliteEntityStore;
pub use store::{
    EntityStore, MemoryStore, ReplicationState, ReplicationStateStore, StoreError, WriteBatch,
};
pub use tiling::{
    BoundingBox, DEFAULT_INDEX_ZOOM, MAX_ZOOM, QuadKey, TileCoord, TileError, Zoom, project,
    quadkey_for, unproject,
};

#[cfg(any(test, feature = "test-support"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-support")))]
pub mod test_support;
