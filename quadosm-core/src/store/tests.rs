//! Behaviour shared by every [`EntityStore`] implementation.

use std::collections::BTreeSet;

use geo::{Coord, Rect};
use rstest::rstest;

use super::*;
use crate::{
    entity::Member,
    tiling::{Zoom, quadkey_for},
};

fn stores() -> Vec<(&'static str, Box<dyn EntityStore>)> {
    let mut stores: Vec<(&'static str, Box<dyn EntityStore>)> =
        vec![("memory", Box::new(MemoryStore::new()))];
    #[cfg(feature = "store-sqlite")]
    stores.push((
        "sqlite",
        Box::new(SqliteEntityStore::open_in_memory().expect("open sqlite store")),
    ));
    stores
}

fn node(id: ElementId, lat: f64, lon: f64) -> Node {
    Node::new(id, Coord { x: lon, y: lat }, Zoom::default())
}

fn key(lat: f64, lon: f64, level: u8) -> QuadKey {
    quadkey_for(lat, lon, Zoom::new(level).expect("valid zoom")).expect("projectable")
}

#[rstest]
fn way_written_before_its_nodes_gains_tiles_later() {
    for (name, mut store) in stores() {
        store.put_way(Way::new(10, vec![1, 2])).expect("write way");
        let way = store.way(10).expect("read way").expect("way present");
        assert!(way.tiles.is_empty(), "{name}: no nodes yet");
        assert_eq!(
            store.ways_referencing(1).expect("reverse lookup"),
            BTreeSet::from([10]),
            "{name}: reverse entry recorded before the node exists"
        );

        store
            .write_batch(
                WriteBatch::new()
                    .with(node(1, 51.5074, -0.1278))
                    .with(node(2, -33.8688, 151.2093)),
            )
            .expect("write nodes");
        let way = store.way(10).expect("read way").expect("way present");
        let expected: BTreeSet<_> = [key(51.5074, -0.1278, 17), key(-33.8688, 151.2093, 17)]
            .into_iter()
            .collect();
        assert_eq!(way.tiles, expected, "{name}");
    }
}

#[rstest]
fn moving_a_node_moves_its_ways_between_tiles() {
    for (name, mut store) in stores() {
        store
            .write_batch(
                WriteBatch::new()
                    .with(node(1, 51.5074, -0.1278))
                    .with(Way::new(10, vec![1, 1])),
            )
            .expect("seed");
        let london = key(51.5074, -0.1278, 3);
        assert_eq!(store.ways_by_tile_prefix(&london).expect("query").len(), 1);

        store.put_node(node(1, -33.8688, 151.2093)).expect("move node");
        assert!(
            store.ways_by_tile_prefix(&london).expect("query").is_empty(),
            "{name}: stale tile entry"
        );
        let sydney = key(-33.8688, 151.2093, 3);
        let ways = store.ways_by_tile_prefix(&sydney).expect("query");
        assert_eq!(ways.iter().map(|w| w.id).collect::<Vec<_>>(), [10], "{name}");
    }
}

#[rstest]
fn tile_prefix_matches_descendants_only() {
    for (name, mut store) in stores() {
        store
            .write_batch(
                WriteBatch::new()
                    .with(node(3, 51.5074, -0.1278))
                    .with(node(1, 51.5080, -0.1270))
                    .with(node(2, 40.7128, -74.0060)),
            )
            .expect("seed");
        let prefix = key(51.5074, -0.1278, 10);
        let ids: Vec<_> = store
            .nodes_by_tile_prefix(&prefix)
            .expect("query")
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, [1, 3], "{name}: ascending ids inside the tile");
    }
}

#[rstest]
fn nodes_without_a_key_fall_back_to_tile_bounds() {
    for (name, mut store) in stores() {
        let mut untiled = node(5, 0.5, 0.5);
        untiled.quadkey = None;
        store.put_node(untiled).expect("write node");
        let found = store
            .nodes_by_tile_prefix(&key(0.5, 0.5, 3))
            .expect("query");
        assert_eq!(found.len(), 1, "{name}");
        assert!(
            store
                .nodes_by_tile_prefix(&key(-0.5, -0.5, 3))
                .expect("query")
                .is_empty(),
            "{name}"
        );
    }
}

#[rstest]
fn rect_queries_include_edges() {
    for (name, mut store) in stores() {
        store
            .write_batch(
                WriteBatch::new()
                    .with(node(1, 0.0, 0.0))
                    .with(node(2, 1.0, 1.0))
                    .with(node(3, 1.5, 1.0)),
            )
            .expect("seed");
        let rect = Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 });
        let ids: Vec<_> = store
            .nodes_in_rect(&rect)
            .expect("query")
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, [1, 2], "{name}");
    }
}

#[rstest]
fn relation_members_are_indexed_by_kind() {
    for (name, mut store) in stores() {
        store
            .put_relation(Relation::new(
                100,
                vec![
                    Member::new(ElementKind::Node, 1, "stop"),
                    Member::new(ElementKind::Way, 1, ""),
                    Member::new(ElementKind::Way, 1, "again"),
                ],
            ))
            .expect("write relation");
        assert_eq!(
            store
                .relations_referencing(ElementKind::Way, 1)
                .expect("lookup"),
            BTreeSet::from([100]),
            "{name}"
        );
        assert_eq!(
            store
                .relations_referencing(ElementKind::Node, 1)
                .expect("lookup"),
            BTreeSet::from([100]),
            "{name}"
        );

        store
            .put_relation(Relation::new(100, vec![Member::new(ElementKind::Node, 2, "")]))
            .expect("replace relation");
        assert!(
            store
                .relations_referencing(ElementKind::Way, 1)
                .expect("lookup")
                .is_empty(),
            "{name}: replaced members must drop old entries"
        );
    }
}

#[rstest]
fn removal_clears_index_entries() {
    for (name, mut store) in stores() {
        store
            .write_batch(
                WriteBatch::new()
                    .with(node(1, 10.0, 10.0))
                    .with(Way::new(10, vec![1]))
                    .with(Relation::new(100, vec![Member::new(ElementKind::Way, 10, "")])),
            )
            .expect("seed");

        store.remove(ElementKind::Node, 1).expect("remove node");
        let way = store.way(10).expect("read").expect("way stays");
        assert!(way.tiles.is_empty(), "{name}: tiles follow node presence");
        assert_eq!(
            store.ways_referencing(1).expect("lookup"),
            BTreeSet::from([10]),
            "{name}: reverse entries follow way records"
        );

        store.remove(ElementKind::Way, 10).expect("remove way");
        assert!(store.ways_referencing(1).expect("lookup").is_empty(), "{name}");

        store.remove(ElementKind::Relation, 100).expect("remove relation");
        assert!(
            store
                .relations_referencing(ElementKind::Way, 10)
                .expect("lookup")
                .is_empty(),
            "{name}"
        );
    }
}

#[rstest]
fn generic_lookups_dispatch_on_kind() {
    for (name, mut store) in stores() {
        let tile_node = node(1, 51.5074, -0.1278);
        let prefix = key(51.5074, -0.1278, 12);
        store
            .write_batch(
                WriteBatch::new()
                    .with(tile_node)
                    .with(node(2, -10.0, -10.0))
                    .with(Relation::new(7, vec![Member::new(ElementKind::Node, 1, "")]))
                    .with(Relation::new(8, vec![Member::new(ElementKind::Node, 2, "")])),
            )
            .expect("seed");

        let found = store.find_by_ids(ElementKind::Node, &[2, 1, 2, 99]).expect("ids");
        assert_eq!(found.iter().map(Element::id).collect::<Vec<_>>(), [1, 2], "{name}");
        assert!(matches!(
            store.get(ElementKind::Relation, 8).expect("get"),
            Some(Element::Relation(_))
        ));

        let relations = store
            .find_by_tile_prefix(ElementKind::Relation, &prefix)
            .expect("tile");
        assert_eq!(
            relations.iter().map(Element::id).collect::<Vec<_>>(),
            [7],
            "{name}"
        );
        assert_eq!(store.scan(ElementKind::Node).expect("scan").len(), 2, "{name}");
    }
}
