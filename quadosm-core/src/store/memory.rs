//! In-memory [`EntityStore`] backed by ordered maps and an R\*-tree.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use geo::Rect;
use rstar::{AABB, RTree, primitives::GeomWithData};

use super::{EntityStore, ReplicationState, ReplicationStateStore, StoreError, WriteBatch};
use crate::{
    entity::{Element, ElementId, ElementKind, Node, Relation, Way},
    tiling::QuadKey,
};

type IndexedPoint = GeomWithData<[f64; 2], ElementId>;

/// Volatile store suited to tests and short-lived tools.
///
/// Writes cannot fail part-way, so every batch is trivially atomic.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    nodes: BTreeMap<ElementId, Node>,
    ways: BTreeMap<ElementId, Way>,
    relations: BTreeMap<ElementId, Relation>,
    positions: RTree<IndexedPoint>,
    node_tiles: BTreeSet<(String, ElementId)>,
    untiled_nodes: BTreeSet<ElementId>,
    way_tiles: BTreeSet<(String, ElementId)>,
    node_ways: HashMap<ElementId, BTreeSet<ElementId>>,
    member_relations: HashMap<(ElementKind, ElementId), BTreeSet<ElementId>>,
    replication: Option<ReplicationState>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored elements of `kind`.
    #[must_use]
    pub fn len(&self, kind: ElementKind) -> usize {
        match kind {
            ElementKind::Node => self.nodes.len(),
            ElementKind::Way => self.ways.len(),
            ElementKind::Relation => self.relations.len(),
        }
    }

    fn insert_node(&mut self, node: Node) {
        let id = node.id;
        self.detach_node(id);
        self.positions
            .insert(IndexedPoint::new([node.location.x, node.location.y], id));
        match &node.quadkey {
            Some(key) => {
                self.node_tiles.insert((key.to_string(), id));
            }
            None => {
                self.untiled_nodes.insert(id);
            }
        }
        self.nodes.insert(id, node);
        self.refresh_ways_of(id);
    }

    fn detach_node(&mut self, id: ElementId) {
        let Some(old) = self.nodes.remove(&id) else {
            return;
        };
        self.positions
            .remove(&IndexedPoint::new([old.location.x, old.location.y], id));
        match old.quadkey {
            Some(key) => {
                self.node_tiles.remove(&(String::from(key), id));
            }
            None => {
                self.untiled_nodes.remove(&id);
            }
        }
    }

    fn refresh_ways_of(&mut self, node_id: ElementId) {
        let way_ids: Vec<ElementId> = self
            .node_ways
            .get(&node_id)
            .map(|ways| ways.iter().copied().collect())
            .unwrap_or_default();
        for way_id in way_ids {
            self.refresh_way_tiles(way_id);
        }
    }

    fn refresh_way_tiles(&mut self, way_id: ElementId) {
        let Some(way) = self.ways.get(&way_id) else {
            return;
        };
        let tiles: BTreeSet<QuadKey> = way
            .node_refs
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter_map(|node| node.quadkey.clone())
            .collect();
        let Some(way) = self.ways.get_mut(&way_id) else {
            return;
        };
        let old = std::mem::replace(&mut way.tiles, tiles.clone());
        for key in old {
            self.way_tiles.remove(&(String::from(key), way_id));
        }
        for key in tiles {
            self.way_tiles.insert((String::from(key), way_id));
        }
    }

    fn insert_way(&mut self, mut way: Way) {
        let id = way.id;
        self.detach_way(id);
        way.tiles.clear();
        for node_id in way.distinct_node_refs() {
            self.node_ways.entry(node_id).or_default().insert(id);
        }
        self.ways.insert(id, way);
        self.refresh_way_tiles(id);
    }

    fn detach_way(&mut self, id: ElementId) {
        let Some(old) = self.ways.remove(&id) else {
            return;
        };
        for node_id in old.distinct_node_refs() {
            if let Some(ways) = self.node_ways.get_mut(&node_id) {
                ways.remove(&id);
                if ways.is_empty() {
                    self.node_ways.remove(&node_id);
                }
            }
        }
        for key in old.tiles {
            self.way_tiles.remove(&(String::from(key), id));
        }
    }

    fn insert_relation(&mut self, relation: Relation) {
        let id = relation.id;
        self.detach_relation(id);
        for member in relation.distinct_members() {
            self.member_relations.entry(member).or_default().insert(id);
        }
        self.relations.insert(id, relation);
    }

    fn detach_relation(&mut self, id: ElementId) {
        let Some(old) = self.relations.remove(&id) else {
            return;
        };
        for member in old.distinct_members() {
            if let Some(relations) = self.member_relations.get_mut(&member) {
                relations.remove(&id);
                if relations.is_empty() {
                    self.member_relations.remove(&member);
                }
            }
        }
    }

    fn nodes_for<I>(&self, ids: I) -> Vec<Node>
    where
        I: IntoIterator<Item = ElementId>,
    {
        let ids: BTreeSet<ElementId> = ids.into_iter().collect();
        ids.into_iter()
            .filter_map(|id| self.nodes.get(&id).cloned())
            .collect()
    }

    fn ways_for<I>(&self, ids: I) -> Vec<Way>
    where
        I: IntoIterator<Item = ElementId>,
    {
        let ids: BTreeSet<ElementId> = ids.into_iter().collect();
        ids.into_iter()
            .filter_map(|id| self.ways.get(&id).cloned())
            .collect()
    }
}

fn prefix_ids(
    index: &BTreeSet<(String, ElementId)>,
    prefix: &QuadKey,
) -> impl Iterator<Item = ElementId> {
    let (start, end) = prefix.prefix_range();
    index
        .range((start, ElementId::MIN)..(end, ElementId::MIN))
        .map(|(_, id)| *id)
}

impl EntityStore for MemoryStore {
    fn write_batch(&mut self, batch: WriteBatch) -> Result<(), StoreError> {
        let WriteBatch {
            nodes,
            ways,
            relations,
            removals,
        } = batch;
        for node in nodes {
            self.insert_node(node);
        }
        for way in ways {
            self.insert_way(way);
        }
        for relation in relations {
            self.insert_relation(relation);
        }
        for (kind, id) in removals {
            match kind {
                ElementKind::Node => {
                    self.detach_node(id);
                    self.refresh_ways_of(id);
                }
                ElementKind::Way => self.detach_way(id),
                ElementKind::Relation => self.detach_relation(id),
            }
        }
        Ok(())
    }

    fn node(&self, id: ElementId) -> Result<Option<Node>, StoreError> {
        Ok(self.nodes.get(&id).cloned())
    }

    fn way(&self, id: ElementId) -> Result<Option<Way>, StoreError> {
        Ok(self.ways.get(&id).cloned())
    }

    fn relation(&self, id: ElementId) -> Result<Option<Relation>, StoreError> {
        Ok(self.relations.get(&id).cloned())
    }

    fn nodes_by_ids(&self, ids: &[ElementId]) -> Result<Vec<Node>, StoreError> {
        Ok(self.nodes_for(ids.iter().copied()))
    }

    fn ways_by_ids(&self, ids: &[ElementId]) -> Result<Vec<Way>, StoreError> {
        Ok(self.ways_for(ids.iter().copied()))
    }

    fn relations_by_ids(&self, ids: &[ElementId]) -> Result<Vec<Relation>, StoreError> {
        let ids: BTreeSet<ElementId> = ids.iter().copied().collect();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.relations.get(&id).cloned())
            .collect())
    }

    fn nodes_by_tile_prefix(&self, prefix: &QuadKey) -> Result<Vec<Node>, StoreError> {
        let bounds = prefix.to_tile().bounds();
        let untiled = self.untiled_nodes.iter().copied().filter(|id| {
            self.nodes
                .get(id)
                .is_some_and(|node| bounds.contains(node.lat(), node.lon()))
        });
        Ok(self.nodes_for(prefix_ids(&self.node_tiles, prefix).chain(untiled)))
    }

    fn ways_by_tile_prefix(&self, prefix: &QuadKey) -> Result<Vec<Way>, StoreError> {
        Ok(self.ways_for(prefix_ids(&self.way_tiles, prefix)))
    }

    fn nodes_in_rect(&self, rect: &Rect<f64>) -> Result<Vec<Node>, StoreError> {
        let envelope =
            AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]);
        Ok(self.nodes_for(
            self.positions
                .locate_in_envelope_intersecting(&envelope)
                .map(|point| point.data),
        ))
    }

    fn scan(&self, kind: ElementKind) -> Result<Vec<Element>, StoreError> {
        Ok(match kind {
            ElementKind::Node => self.nodes.values().cloned().map(Element::Node).collect(),
            ElementKind::Way => self.ways.values().cloned().map(Element::Way).collect(),
            ElementKind::Relation => self
                .relations
                .values()
                .cloned()
                .map(Element::Relation)
                .collect(),
        })
    }

    fn ways_referencing(&self, node_id: ElementId) -> Result<BTreeSet<ElementId>, StoreError> {
        Ok(self.node_ways.get(&node_id).cloned().unwrap_or_default())
    }

    fn relations_referencing(
        &self,
        kind: ElementKind,
        id: ElementId,
    ) -> Result<BTreeSet<ElementId>, StoreError> {
        Ok(self
            .member_relations
            .get(&(kind, id))
            .cloned()
            .unwrap_or_default())
    }
}

impl ReplicationStateStore for MemoryStore {
    fn replication_state(&self) -> Result<Option<ReplicationState>, StoreError> {
        Ok(self.replication)
    }

    fn save_replication_state(&mut self, state: ReplicationState) -> Result<(), StoreError> {
        self.replication = Some(state);
        Ok(())
    }
}
