//! Query execution, one-hop expansion, and the tile and map services.

use std::collections::{BTreeMap, BTreeSet};

use geo::{BoundingRect, Coord};
use log::{debug, warn};

use super::{ElementQuery, QueryError, QueryResult, SpatialFilter, validate_bbox};
use crate::{
    entity::{Element, ElementId, ElementKind, Node, Way},
    store::{EntityStore, StoreError},
    tiling::{BoundingBox, QuadKey, TileCoord, Zoom},
};

/// Run `query` against `store`.
///
/// Nodes are matched by location. Ways match when they touch a matching
/// node (area filters) or a matching tile (tile filters). Relations match
/// when one of their node or way members lies inside the spatial filter.
/// Every returned list is ordered by id.
pub fn execute<S>(store: &S, query: &ElementQuery) -> Result<QueryResult, QueryError>
where
    S: EntityStore + ?Sized,
{
    let mut result = QueryResult::default();
    let spatial_nodes = match &query.spatial {
        SpatialFilter::None => None,
        SpatialFilter::Area(polygon) => {
            let candidates = match polygon.bounding_rect() {
                Some(rect) => store.nodes_in_rect(&rect)?,
                None => Vec::new(),
            };
            Some(
                candidates
                    .into_iter()
                    .filter(|node| query.spatial.contains(node))
                    .collect::<Vec<_>>(),
            )
        }
        SpatialFilter::Tile(prefix) => Some(nodes_in_tile(store, &prefix.to_tile())?),
    };

    if query.wants(ElementKind::Node) {
        let nodes = match &spatial_nodes {
            Some(nodes) => nodes.clone(),
            None => nodes_of(store.scan(ElementKind::Node)?),
        };
        result.nodes = nodes
            .into_iter()
            .filter(|node| query.accepts(&node.meta, &node.tags))
            .collect();
    }

    let needs_ways = query.wants(ElementKind::Way) || query.wants(ElementKind::Relation);
    let spatial_ways = match (&query.spatial, &spatial_nodes) {
        (SpatialFilter::Tile(prefix), Some(nodes)) if needs_ways => {
            Some(ways_in_tile(store, prefix, nodes)?)
        }
        (SpatialFilter::Area(_), Some(nodes)) if needs_ways => {
            let mut way_ids = BTreeSet::new();
            for node in nodes {
                way_ids.extend(store.ways_referencing(node.id)?);
            }
            let way_ids: Vec<_> = way_ids.into_iter().collect();
            Some(store.ways_by_ids(&way_ids)?)
        }
        _ => None,
    };

    if query.wants(ElementKind::Way) {
        let ways = match &spatial_ways {
            Some(ways) => ways.clone(),
            None => ways_of(store.scan(ElementKind::Way)?),
        };
        result.ways = ways
            .into_iter()
            .filter(|way| query.accepts(&way.meta, &way.tags))
            .collect();
    }

    if query.wants(ElementKind::Relation) {
        let relations = match (&spatial_nodes, &spatial_ways) {
            (Some(nodes), Some(ways)) => {
                let mut ids = BTreeSet::new();
                for node in nodes {
                    ids.extend(store.relations_referencing(ElementKind::Node, node.id)?);
                }
                for way in ways {
                    ids.extend(store.relations_referencing(ElementKind::Way, way.id)?);
                }
                let ids: Vec<_> = ids.into_iter().collect();
                store.relations_by_ids(&ids)?
            }
            _ => store
                .scan(ElementKind::Relation)?
                .into_iter()
                .filter_map(|element| match element {
                    Element::Relation(relation) => Some(relation),
                    _ => None,
                })
                .collect(),
        };
        result.relations = relations
            .into_iter()
            .filter(|relation| query.accepts(&relation.meta, &relation.tags))
            .collect();
    }

    debug!(
        "query matched {} nodes, {} ways, {} relations",
        result.nodes.len(),
        result.ways.len(),
        result.relations.len()
    );
    Ok(result)
}

fn nodes_of(elements: Vec<Element>) -> Vec<Node> {
    elements
        .into_iter()
        .filter_map(|element| match element {
            Element::Node(node) => Some(node),
            _ => None,
        })
        .collect()
}

fn ways_of(elements: Vec<Element>) -> Vec<Way> {
    elements
        .into_iter()
        .filter_map(|element| match element {
            Element::Way(way) => Some(way),
            _ => None,
        })
        .collect()
}

/// Add every node referenced by the ways in `result`.
///
/// Nodes already present are kept as they are. Referenced nodes missing from
/// the store are logged and skipped. Soft-deleted nodes are not added.
pub fn expand_with_referenced_nodes<S>(
    store: &S,
    result: &mut QueryResult,
) -> Result<(), StoreError>
where
    S: EntityStore + ?Sized,
{
    let present: BTreeSet<ElementId> = result.nodes.iter().map(|node| node.id).collect();
    let wanted: BTreeSet<ElementId> = result
        .ways
        .iter()
        .flat_map(|way| way.node_refs.iter().copied())
        .filter(|id| !present.contains(id))
        .collect();
    if wanted.is_empty() {
        return Ok(());
    }
    let wanted: Vec<_> = wanted.into_iter().collect();
    let found = store.nodes_by_ids(&wanted)?;
    if found.len() < wanted.len() {
        let found_ids: BTreeSet<_> = found.iter().map(|node| node.id).collect();
        for id in wanted.iter().filter(|id| !found_ids.contains(id)) {
            warn!("referenced node {id} is not in the store");
        }
    }
    result.merge_nodes(found.into_iter().filter(|node| node.meta.visible));
    Ok(())
}

/// Add every way that references a node in `result`.
pub fn expand_with_referencing_ways<S>(
    store: &S,
    result: &mut QueryResult,
) -> Result<(), StoreError>
where
    S: EntityStore + ?Sized,
{
    let mut ids = BTreeSet::new();
    for node in &result.nodes {
        ids.extend(store.ways_referencing(node.id)?);
    }
    for way in &result.ways {
        ids.remove(&way.id);
    }
    let ids: Vec<_> = ids.into_iter().collect();
    let ways = store.ways_by_ids(&ids)?;
    result.merge_ways(ways.into_iter().filter(|way| way.meta.visible));
    Ok(())
}

/// Add every relation that lists a node or way in `result` as a member.
pub fn expand_with_referencing_relations<S>(
    store: &S,
    result: &mut QueryResult,
) -> Result<(), StoreError>
where
    S: EntityStore + ?Sized,
{
    let mut ids = BTreeSet::new();
    for node in &result.nodes {
        ids.extend(store.relations_referencing(ElementKind::Node, node.id)?);
    }
    for way in &result.ways {
        ids.extend(store.relations_referencing(ElementKind::Way, way.id)?);
    }
    for relation in &result.relations {
        ids.remove(&relation.id);
    }
    let ids: Vec<_> = ids.into_iter().collect();
    let relations = store.relations_by_ids(&ids)?;
    result.merge_relations(relations.into_iter().filter(|r| r.meta.visible));
    Ok(())
}

/// Contents of one map tile.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TileData {
    /// Key of the tile.
    pub quadkey: QuadKey,
    /// Geographic extent of the tile.
    pub bounds: BoundingBox,
    /// Elements in or touching the tile.
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub elements: QueryResult,
}

/// Fetch a tile addressed in XYZ coordinates, whose rows grow southwards.
///
/// The result holds the visible nodes under the tile, the visible ways with
/// a node in it, every node those ways reference, and every relation with a
/// returned node or way as a member.
pub fn get_tile<S>(store: &S, zoom: u8, x: u32, y: u32) -> Result<TileData, QueryError>
where
    S: EntityStore + ?Sized,
{
    let tile = TileCoord::from_xyz(Zoom::new(zoom)?, x, y)?;
    let quadkey = tile.quadkey();
    let nodes = nodes_in_tile(store, &tile)?;
    let ways = ways_in_tile(store, &quadkey, &nodes)?;
    let mut elements = QueryResult::default();
    elements.merge_nodes(nodes.into_iter().filter(|node| node.meta.visible));
    elements.merge_ways(ways.into_iter().filter(|way| way.meta.visible));
    expand_with_referenced_nodes(store, &mut elements)?;
    expand_with_referencing_relations(store, &mut elements)?;
    debug!(
        "tile {quadkey} holds {} nodes and {} ways",
        elements.nodes.len(),
        elements.ways.len()
    );
    Ok(TileData {
        bounds: tile.bounds(),
        quadkey,
        elements,
    })
}

/// Nodes located in `tile`.
///
/// The quadkey index only answers prefixes up to the zoom nodes were stored
/// at, so a tile deeper than that is also matched by location. A node on a
/// shared tile edge belongs to the tile that `TileCoord::containing` picks.
fn nodes_in_tile<S>(store: &S, tile: &TileCoord) -> Result<Vec<Node>, StoreError>
where
    S: EntityStore + ?Sized,
{
    let mut nodes: BTreeMap<ElementId, Node> = store
        .nodes_by_tile_prefix(&tile.quadkey())?
        .into_iter()
        .map(|node| (node.id, node))
        .collect();
    for node in store.nodes_in_rect(&tile.bounds().to_rect())? {
        let inside = TileCoord::containing(node.lat(), node.lon(), tile.zoom())
            .is_ok_and(|found| found == *tile);
        if inside {
            nodes.entry(node.id).or_insert(node);
        }
    }
    Ok(nodes.into_values().collect())
}

/// Ways indexed under `quadkey`, plus ways through `nodes` whose own index
/// entry is coarser than `quadkey`.
fn ways_in_tile<S>(store: &S, quadkey: &QuadKey, nodes: &[Node]) -> Result<Vec<Way>, StoreError>
where
    S: EntityStore + ?Sized,
{
    let mut ways: BTreeMap<ElementId, Way> = store
        .ways_by_tile_prefix(quadkey)?
        .into_iter()
        .map(|way| (way.id, way))
        .collect();
    let mut extra = BTreeSet::new();
    for node in nodes {
        let indexed_deep_enough = node
            .quadkey
            .as_ref()
            .is_some_and(|key| quadkey.is_prefix_of(key));
        if !indexed_deep_enough {
            extra.extend(store.ways_referencing(node.id)?);
        }
    }
    extra.retain(|id| !ways.contains_key(id));
    if !extra.is_empty() {
        let ids: Vec<_> = extra.into_iter().collect();
        for way in store.ways_by_ids(&ids)? {
            ways.entry(way.id).or_insert(way);
        }
    }
    Ok(ways.into_values().collect())
}

/// Contents of a bounding box.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MapData {
    /// Requested extent.
    pub bounds: BoundingBox,
    /// Elements in or touching the extent.
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub elements: QueryResult,
}

/// Fetch the visible nodes in `bbox`, the ways using them, every node of
/// those ways, and the relations referencing any of them.
pub fn fetch_map<S>(store: &S, bbox: BoundingBox) -> Result<MapData, QueryError>
where
    S: EntityStore + ?Sized,
{
    validate_bbox(&bbox)?;
    let mut elements = QueryResult::default();
    elements.merge_nodes(
        store
            .nodes_in_rect(&bbox.to_rect())?
            .into_iter()
            .filter(|node| node.meta.visible),
    );
    expand_with_referencing_ways(store, &mut elements)?;
    expand_with_referenced_nodes(store, &mut elements)?;
    expand_with_referencing_relations(store, &mut elements)?;
    Ok(MapData {
        bounds: bbox,
        elements,
    })
}

/// Locations of a way's nodes in reference order.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct WayGeometry {
    /// Resolved locations, `x = longitude`. Repeated references repeat.
    pub locations: Vec<Coord<f64>>,
    /// Referenced node ids absent from the store, without repeats.
    pub missing: Vec<ElementId>,
}

impl WayGeometry {
    /// Whether every referenced node was found.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Resolve a way's node locations at read time.
///
/// Missing nodes are logged and listed in [`WayGeometry::missing`].
pub fn resolve_way_geometry<S>(store: &S, way: &Way) -> Result<WayGeometry, StoreError>
where
    S: EntityStore + ?Sized,
{
    let ids: Vec<_> = way.distinct_node_refs().into_iter().collect();
    let locations: BTreeMap<ElementId, Coord<f64>> = store
        .nodes_by_ids(&ids)?
        .into_iter()
        .map(|node| (node.id, node.location))
        .collect();

    let mut geometry = WayGeometry::default();
    let mut reported = BTreeSet::new();
    for id in &way.node_refs {
        match locations.get(id) {
            Some(location) => geometry.locations.push(*location),
            None => {
                if reported.insert(*id) {
                    warn!("way {} references node {id} which is not in the store", way.id);
                    geometry.missing.push(*id);
                }
            }
        }
    }
    Ok(geometry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entity::{Member, Relation},
        query::QueryBuilder,
        store::{MemoryStore, WriteBatch},
    };
    use rstest::{fixture, rstest};

    fn node(id: ElementId, lat: f64, lon: f64) -> Node {
        Node::new(id, Coord { x: lon, y: lat }, Zoom::default())
    }

    /// Two ways crossing a box: way 10 enters it, way 11 stays outside.
    #[fixture]
    fn store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store
            .write_batch(
                WriteBatch::new()
                    .with(node(1, 0.5, 0.5).with_tags([("amenity", "bench")].into_iter().collect()))
                    .with(node(2, 2.0, 2.0))
                    .with(node(3, 3.0, 3.0))
                    .with(node(4, 3.5, 3.5))
                    .with(Way::new(10, vec![1, 2]).with_tags([("highway", "path")].into_iter().collect()))
                    .with(Way::new(11, vec![3, 4]))
                    .with(Relation::new(20, vec![Member::new(ElementKind::Way, 10, "")]))
                    .with(Relation::new(21, vec![Member::new(ElementKind::Node, 4, "")])),
            )
            .expect("seed store");
        store
    }

    fn ids<T>(items: &[T], id_of: fn(&T) -> ElementId) -> Vec<ElementId> {
        items.iter().map(id_of).collect()
    }

    #[rstest]
    fn bbox_query_returns_contained_nodes_and_touching_ways(store: MemoryStore) {
        let query = QueryBuilder::new()
            .bbox(BoundingBox::new(0.0, 0.0, 1.0, 1.0))
            .build()
            .expect("query");
        let result = execute(&store, &query).expect("execute");
        assert_eq!(ids(&result.nodes, |n| n.id), [1]);
        assert_eq!(ids(&result.ways, |w| w.id), [10]);
        assert_eq!(ids(&result.relations, |r| r.id), [20]);
    }

    #[rstest]
    fn predicates_filter_every_kind(store: MemoryStore) {
        let query = QueryBuilder::new()
            .tag_equals("highway", "path")
            .build()
            .expect("query");
        let result = execute(&store, &query).expect("execute");
        assert!(result.nodes.is_empty());
        assert_eq!(ids(&result.ways, |w| w.id), [10]);
        assert!(result.relations.is_empty());
    }

    #[rstest]
    fn kind_restriction_limits_output(store: MemoryStore) {
        let query = QueryBuilder::new()
            .kind(ElementKind::Relation)
            .build()
            .expect("query");
        let result = execute(&store, &query).expect("execute");
        assert!(result.nodes.is_empty() && result.ways.is_empty());
        assert_eq!(ids(&result.relations, |r| r.id), [20, 21]);
    }

    #[rstest]
    fn tile_filter_uses_way_tiles(store: MemoryStore) {
        let prefix = crate::tiling::quadkey_for(3.0, 3.0, Zoom::new(12).expect("zoom"))
            .expect("projectable");
        let query = QueryBuilder::new().tile(prefix).build().expect("query");
        let result = execute(&store, &query).expect("execute");
        assert_eq!(ids(&result.nodes, |n| n.id), [3]);
        assert_eq!(ids(&result.ways, |w| w.id), [11]);
    }

    #[rstest]
    fn expansion_adds_referenced_nodes_once(store: MemoryStore) {
        let mut result = QueryResult::default();
        result.merge_nodes(store.node(1).expect("read"));
        result.merge_ways(store.way(10).expect("read"));
        expand_with_referenced_nodes(&store, &mut result).expect("expand");
        assert_eq!(ids(&result.nodes, |n| n.id), [1, 2]);
    }

    #[rstest]
    fn expansion_skips_missing_nodes() {
        let mut store = MemoryStore::new();
        store.put_way(Way::new(10, vec![1, 2])).expect("write way");
        store.put_node(node(2, 0.0, 0.0)).expect("write node");
        let mut result = QueryResult::default();
        result.merge_ways(store.way(10).expect("read"));
        expand_with_referenced_nodes(&store, &mut result).expect("expand");
        assert_eq!(ids(&result.nodes, |n| n.id), [2]);
    }

    #[rstest]
    fn map_fetch_pulls_whole_ways(store: MemoryStore) {
        let map = fetch_map(&store, BoundingBox::new(0.0, 0.0, 1.0, 1.0)).expect("map");
        assert_eq!(ids(&map.elements.nodes, |n| n.id), [1, 2]);
        assert_eq!(ids(&map.elements.ways, |w| w.id), [10]);
        assert_eq!(ids(&map.elements.relations, |r| r.id), [20]);
    }

    #[rstest]
    fn tile_fetch_converts_xyz_rows(store: MemoryStore) {
        let tile = TileCoord::containing(3.5, 3.5, Zoom::new(12).expect("zoom")).expect("tile");
        let data = get_tile(&store, 12, tile.x(), tile.xyz_y()).expect("tile data");
        assert_eq!(data.quadkey, tile.quadkey());
        assert!(data.bounds.contains(3.5, 3.5));
        assert_eq!(ids(&data.elements.nodes, |n| n.id), [3, 4]);
        assert_eq!(ids(&data.elements.ways, |w| w.id), [11]);
        assert_eq!(ids(&data.elements.relations, |r| r.id), [21]);
    }

    #[rstest]
    #[case(0, 0, 0)]
    #[case(24, 0, 0)]
    #[case(2, 0, 4)]
    fn tile_fetch_rejects_bad_addresses(store: MemoryStore, #[case] zoom: u8, #[case] x: u32, #[case] y: u32) {
        assert!(matches!(
            get_tile(&store, zoom, x, y),
            Err(QueryError::Tile(_))
        ));
    }

    /// A short way in central London, stored at the default index zoom.
    fn london<S: EntityStore>(mut store: S) -> S {
        store
            .write_batch(
                WriteBatch::new()
                    .with(node(1, 51.5074, -0.1278))
                    .with(node(2, 51.507_45, -0.127_75))
                    .with(Way::new(10, vec![1, 2])),
            )
            .expect("seed london");
        store
    }

    fn tile_around_london(store: &impl EntityStore, level: u8) -> TileData {
        let tile = TileCoord::containing(51.5074, -0.1278, Zoom::new(level).expect("zoom"))
            .expect("projectable");
        get_tile(store, level, tile.x(), tile.xyz_y()).expect("tile")
    }

    #[rstest]
    #[case::coarser_than_the_index(16)]
    #[case::at_the_index_zoom(17)]
    #[case::one_level_deeper(18)]
    #[case::far_deeper(20)]
    #[case::deepest(23)]
    fn tiles_find_nodes_on_both_sides_of_the_index_zoom(#[case] level: u8) {
        let store = london(MemoryStore::new());
        let data = tile_around_london(&store, level);
        assert!(ids(&data.elements.nodes, |n| n.id).contains(&1));
        assert_eq!(ids(&data.elements.ways, |w| w.id), [10]);
        assert_eq!(data.quadkey.zoom().get(), level);
    }

    #[cfg(feature = "store-sqlite")]
    #[rstest]
    #[case(16)]
    #[case(18)]
    #[case(21)]
    fn sqlite_tiles_deeper_than_the_index_are_not_empty(#[case] level: u8) {
        let store = london(crate::store::SqliteEntityStore::open_in_memory().expect("open"));
        let data = tile_around_london(&store, level);
        assert!(ids(&data.elements.nodes, |n| n.id).contains(&1));
        assert_eq!(ids(&data.elements.ways, |w| w.id), [10]);
    }

    #[rstest]
    fn deep_tiles_exclude_nodes_of_neighbouring_tiles() {
        let store = london(MemoryStore::new());
        let tile = TileCoord::containing(51.5074, -0.1278, Zoom::new(20).expect("zoom"))
            .expect("projectable");
        let neighbour = TileCoord::new(tile.x() + 1, tile.y(), tile.zoom()).expect("neighbour");
        let data = get_tile(&store, 20, neighbour.x(), neighbour.xyz_y()).expect("tile");
        assert!(!ids(&data.elements.nodes, |n| n.id).contains(&1));
        for found in &data.elements.nodes {
            let owner = TileCoord::containing(found.lat(), found.lon(), tile.zoom())
                .expect("projectable");
            assert_eq!(owner, neighbour);
        }
    }

    #[rstest]
    fn deep_tile_filters_match_by_location() {
        let store = london(MemoryStore::new());
        let prefix = crate::tiling::quadkey_for(51.5074, -0.1278, Zoom::new(19).expect("zoom"))
            .expect("projectable");
        let query = QueryBuilder::new().tile(prefix).build().expect("query");
        let result = execute(&store, &query).expect("execute");
        assert!(ids(&result.nodes, |n| n.id).contains(&1));
        assert_eq!(ids(&result.ways, |w| w.id), [10]);
    }

    #[rstest]
    fn geometry_follows_reference_order() {
        let mut store = MemoryStore::new();
        store
            .write_batch(
                WriteBatch::new()
                    .with(node(1, 1.0, 1.0))
                    .with(node(2, 2.0, 2.0)),
            )
            .expect("seed");
        let way = Way::new(10, vec![2, 9, 1, 2, 9]);
        let geometry = resolve_way_geometry(&store, &way).expect("resolve");
        let lats: Vec<_> = geometry.locations.iter().map(|c| c.y).collect();
        assert_eq!(lats, [2.0, 1.0, 2.0]);
        assert_eq!(geometry.missing, [9]);
        assert!(!geometry.is_complete());
    }
}
