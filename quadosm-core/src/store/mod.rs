//! Persistence of map elements and their reverse indexes.
//!
//! An [`EntityStore`] keeps three records per write beyond the element
//! itself:
//!
//! * node → ways that reference it,
//! * `(kind, id)` → relations that list it as a member,
//! * tile key → ways that touch a node in that tile.
//!
//! The indexes follow the element records rather than the presence of the
//! referenced element: a way referencing a node that is not yet stored is
//! still listed against that node id, so a later node write can find the
//! way and refresh its tiles.
//!
//! Every read returns elements ordered by ascending id.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use geo::Rect;
use thiserror::Error;

use crate::{
    entity::{Element, ElementId, ElementKind, Node, Relation, Way},
    tiling::QuadKey,
};

mod memory;
#[cfg(feature = "store-sqlite")]
mod schema;
#[cfg(feature = "store-sqlite")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "store-sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "store-sqlite")))]
pub use sqlite::SqliteEntityStore;

/// Errors raised by store implementations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Opening the SQLite database failed.
    #[cfg(feature = "store-sqlite")]
    #[error("failed to open SQLite database at {path}: {source}")]
    OpenDatabase {
        /// Location of the database on disk.
        path: std::path::PathBuf,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// Creating or migrating the schema failed.
    #[cfg(feature = "store-sqlite")]
    #[error("failed to initialise the store schema: {source}")]
    Schema {
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// The database was written by a newer release.
    #[cfg(feature = "store-sqlite")]
    #[error("database schema version {found} is newer than the supported version {supported}")]
    UnsupportedSchema {
        /// Version recorded in the database.
        found: i64,
        /// Version this build understands.
        supported: i64,
    },
    /// Generic SQLite failure.
    #[cfg(feature = "store-sqlite")]
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    /// A column payload could not be encoded as JSON.
    #[cfg(feature = "serde")]
    #[error("failed to encode {field} of {kind} {id}: {source}")]
    Encode {
        /// Kind of the element being written.
        kind: ElementKind,
        /// Id of the element being written.
        id: ElementId,
        /// Column name.
        field: &'static str,
        /// JSON encoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// A stored column payload was not valid JSON.
    #[cfg(feature = "serde")]
    #[error("failed to decode {field} of {kind} {id}: {source}")]
    Decode {
        /// Kind of the element being read.
        kind: ElementKind,
        /// Id of the element being read.
        id: ElementId,
        /// Column name.
        field: &'static str,
        /// JSON decoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// The stored replication marker could not be read or written.
    #[error("invalid replication state: {reason}")]
    InvalidReplicationState {
        /// What was wrong with the marker.
        reason: String,
    },
    /// A stored row held a value outside its domain.
    #[error("stored {kind} {id} is corrupt: {reason}")]
    Corrupt {
        /// Kind of the element being read.
        kind: ElementKind,
        /// Id of the element being read.
        id: ElementId,
        /// What was wrong with the row.
        reason: String,
    },
}

/// A group of writes applied atomically.
///
/// Within a batch, nodes are written first, then ways, then relations, and
/// removals last, so way tiles can see nodes written in the same batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    /// Nodes to insert or replace.
    pub nodes: Vec<Node>,
    /// Ways to insert or replace.
    pub ways: Vec<Way>,
    /// Relations to insert or replace.
    pub relations: Vec<Relation>,
    /// Elements to remove outright.
    pub removals: Vec<(ElementKind, ElementId)>,
}

impl WriteBatch {
    /// Create an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an element for insertion or replacement.
    pub fn push(&mut self, element: Element) {
        match element {
            Element::Node(node) => self.nodes.push(node),
            Element::Way(way) => self.ways.push(way),
            Element::Relation(relation) => self.relations.push(relation),
        }
    }

    /// Queue an element for removal.
    pub fn remove(&mut self, kind: ElementKind, id: ElementId) {
        self.removals.push((kind, id));
    }

    /// Builder-style [`WriteBatch::push`].
    #[must_use]
    pub fn with(mut self, element: impl Into<Element>) -> Self {
        self.push(element.into());
        self
    }

    /// Number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len() + self.ways.len() + self.relations.len() + self.removals.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Storage for elements and their reverse indexes.
///
/// Implementations must make [`EntityStore::write_batch`] atomic: either
/// every element and index entry in the batch becomes visible, or none does.
///
/// # Examples
///
/// ```
/// use geo::Coord;
/// use quadosm_core::{EntityStore, MemoryStore, Node, Way, WriteBatch, Zoom};
///
/// # fn main() -> Result<(), quadosm_core::StoreError> {
/// let zoom = Zoom::default();
/// let mut store = MemoryStore::default();
/// store.write_batch(
///     WriteBatch::new()
///         .with(Node::new(1, Coord { x: 0.1, y: 0.1 }, zoom))
///         .with(Way::new(10, vec![1])),
/// )?;
///
/// assert_eq!(store.ways_referencing(1)?.into_iter().collect::<Vec<_>>(), [10]);
/// let way = store.way(10)?.expect("way stored");
/// assert_eq!(way.tiles.len(), 1);
/// # Ok(())
/// # }
/// ```
pub trait EntityStore {
    /// Apply every write in `batch` atomically.
    fn write_batch(&mut self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Fetch a node by id.
    fn node(&self, id: ElementId) -> Result<Option<Node>, StoreError>;

    /// Fetch a way by id.
    fn way(&self, id: ElementId) -> Result<Option<Way>, StoreError>;

    /// Fetch a relation by id.
    fn relation(&self, id: ElementId) -> Result<Option<Relation>, StoreError>;

    /// Fetch the stored nodes among `ids`. Missing ids are skipped.
    fn nodes_by_ids(&self, ids: &[ElementId]) -> Result<Vec<Node>, StoreError>;

    /// Fetch the stored ways among `ids`. Missing ids are skipped.
    fn ways_by_ids(&self, ids: &[ElementId]) -> Result<Vec<Way>, StoreError>;

    /// Fetch the stored relations among `ids`. Missing ids are skipped.
    fn relations_by_ids(&self, ids: &[ElementId]) -> Result<Vec<Relation>, StoreError>;

    /// Nodes whose quadkey starts with `prefix`, plus nodes without a quadkey
    /// whose location falls inside the tile named by `prefix`.
    fn nodes_by_tile_prefix(&self, prefix: &QuadKey) -> Result<Vec<Node>, StoreError>;

    /// Ways with at least one tile starting with `prefix`.
    fn ways_by_tile_prefix(&self, prefix: &QuadKey) -> Result<Vec<Way>, StoreError>;

    /// Nodes inside `rect` (`x = longitude`), edges included.
    fn nodes_in_rect(&self, rect: &Rect<f64>) -> Result<Vec<Node>, StoreError>;

    /// Every stored element of `kind`.
    fn scan(&self, kind: ElementKind) -> Result<Vec<Element>, StoreError>;

    /// Ids of ways whose node list contains `node_id`.
    fn ways_referencing(&self, node_id: ElementId) -> Result<BTreeSet<ElementId>, StoreError>;

    /// Ids of relations with a member `(kind, id)`.
    fn relations_referencing(
        &self,
        kind: ElementKind,
        id: ElementId,
    ) -> Result<BTreeSet<ElementId>, StoreError>;

    /// Insert or replace a single node.
    fn put_node(&mut self, node: Node) -> Result<(), StoreError> {
        self.write_batch(WriteBatch::new().with(node))
    }

    /// Insert or replace a single way.
    fn put_way(&mut self, way: Way) -> Result<(), StoreError> {
        self.write_batch(WriteBatch::new().with(way))
    }

    /// Insert or replace a single relation.
    fn put_relation(&mut self, relation: Relation) -> Result<(), StoreError> {
        self.write_batch(WriteBatch::new().with(relation))
    }

    /// Remove an element and its index entries.
    fn remove(&mut self, kind: ElementKind, id: ElementId) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.remove(kind, id);
        self.write_batch(batch)
    }

    /// Fetch any element by kind and id.
    fn get(&self, kind: ElementKind, id: ElementId) -> Result<Option<Element>, StoreError> {
        Ok(match kind {
            ElementKind::Node => self.node(id)?.map(Element::Node),
            ElementKind::Way => self.way(id)?.map(Element::Way),
            ElementKind::Relation => self.relation(id)?.map(Element::Relation),
        })
    }

    /// Fetch the stored elements of `kind` among `ids`.
    fn find_by_ids(
        &self,
        kind: ElementKind,
        ids: &[ElementId],
    ) -> Result<Vec<Element>, StoreError> {
        Ok(match kind {
            ElementKind::Node => self.nodes_by_ids(ids)?.into_iter().map(Element::Node).collect(),
            ElementKind::Way => self.ways_by_ids(ids)?.into_iter().map(Element::Way).collect(),
            ElementKind::Relation => self
                .relations_by_ids(ids)?
                .into_iter()
                .map(Element::Relation)
                .collect(),
        })
    }

    /// Elements of `kind` in the tile named by `prefix`.
    ///
    /// Relations have no tile of their own; they match when a member node or
    /// way lies in the tile.
    fn find_by_tile_prefix(
        &self,
        kind: ElementKind,
        prefix: &QuadKey,
    ) -> Result<Vec<Element>, StoreError> {
        match kind {
            ElementKind::Node => Ok(self
                .nodes_by_tile_prefix(prefix)?
                .into_iter()
                .map(Element::Node)
                .collect()),
            ElementKind::Way => Ok(self
                .ways_by_tile_prefix(prefix)?
                .into_iter()
                .map(Element::Way)
                .collect()),
            ElementKind::Relation => {
                let mut ids = BTreeSet::new();
                for node in self.nodes_by_tile_prefix(prefix)? {
                    ids.extend(self.relations_referencing(ElementKind::Node, node.id)?);
                }
                for way in self.ways_by_tile_prefix(prefix)? {
                    ids.extend(self.relations_referencing(ElementKind::Way, way.id)?);
                }
                let ids: Vec<_> = ids.into_iter().collect();
                self.find_by_ids(ElementKind::Relation, &ids)
            }
        }
    }
}

/// Progress marker of a replication feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReplicationState {
    /// Next change unit to apply.
    pub sequence: u64,
    /// When the marker was last advanced.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Storage for the replication progress marker.
pub trait ReplicationStateStore {
    /// Load the marker, if one has been saved.
    fn replication_state(&self) -> Result<Option<ReplicationState>, StoreError>;

    /// Persist the marker, replacing any previous value.
    fn save_replication_state(&mut self, state: ReplicationState) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests;
