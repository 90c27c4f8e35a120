//! Behavioural tests for spatial queries using rstest-bdd.

use std::cell::RefCell;

use geo::Coord;
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use quadosm_core::{
    BoundingBox, ElementKind, EntityStore, MemoryStore, Member, Node, QueryBuilder, QueryResult,
    Relation, TileCoord, TileData, Way, WriteBatch, Zoom, execute, fetch_map, get_tile,
    resolve_way_geometry,
};

const BENCH: (f64, f64) = (51.4774, 0.0003);

fn node(id: i64, lat: f64, lon: f64) -> Node {
    Node::new(id, Coord { x: lon, y: lat }, Zoom::default())
}

fn park_nodes() -> Vec<Node> {
    vec![
        node(1, 51.4769, -0.0005),
        node(2, 51.4772, 0.0001),
        node(3, 51.4776, 0.0008),
        node(4, 51.4780, 0.0014),
        node(5, BENCH.0, BENCH.1),
        node(6, 51.4870, -0.0060),
        node(7, 51.4875, 0.0040),
    ]
}

fn park_ways() -> Vec<Way> {
    vec![Way::new(100, vec![1, 2, 3, 4]), Way::new(101, vec![6, 7])]
}

fn park_relations() -> Vec<Relation> {
    vec![
        Relation::new(
            200,
            vec![
                Member::new(ElementKind::Way, 100, "outer"),
                Member::new(ElementKind::Node, 5, "bench"),
            ],
        ),
        Relation::new(201, vec![Member::new(ElementKind::Way, 101, "")]),
    ]
}

/// Shared state for spatial query scenarios.
#[derive(Debug, Default)]
struct QueryWorld {
    store: RefCell<MemoryStore>,
    result: RefCell<QueryResult>,
    tile: RefCell<Option<TileData>>,
}

#[fixture]
fn world() -> QueryWorld {
    QueryWorld::default()
}

fn ids<T>(items: &[T], id_of: fn(&T) -> i64) -> Vec<i64> {
    items.iter().map(id_of).collect()
}

#[given("a store holding the park footpath and the northern road")]
fn seeded_store(world: &QueryWorld) {
    let batch = WriteBatch {
        nodes: park_nodes(),
        ways: park_ways(),
        relations: park_relations(),
        removals: Vec::new(),
    };
    world
        .store
        .borrow_mut()
        .write_batch(batch)
        .expect("seed store");
}

#[given("a store where the footpath was written before its nodes")]
fn reversed_store(world: &QueryWorld) {
    let mut store = world.store.borrow_mut();
    for way in park_ways() {
        store.put_way(way).expect("write way");
    }
    for node in park_nodes().into_iter().rev() {
        store.put_node(node).expect("write node");
    }
}

#[when("I query nodes inside the park bounding box")]
fn query_park(world: &QueryWorld) {
    let query = QueryBuilder::new()
        .bbox(BoundingBox::new(51.4765, -0.0010, 51.4785, 0.0020))
        .kind(ElementKind::Node)
        .build()
        .expect("valid query");
    let result = execute(&*world.store.borrow(), &query).expect("execute query");
    world.result.replace(result);
}

#[when("I fetch the map around the western end of the road")]
fn fetch_road_end(world: &QueryWorld) {
    let map = fetch_map(
        &*world.store.borrow(),
        BoundingBox::new(51.4865, -0.0065, 51.4872, -0.0055),
    )
    .expect("fetch map");
    world.result.replace(map.elements);
}

#[when("I fetch the zoom 15 tile containing the bench")]
fn fetch_bench_tile(world: &QueryWorld) {
    let zoom = Zoom::new(15).expect("valid zoom");
    let tile = TileCoord::containing(BENCH.0, BENCH.1, zoom).expect("bench tile");
    let data = get_tile(&*world.store.borrow(), 15, tile.x(), tile.xyz_y()).expect("tile data");
    world.result.replace(data.elements.clone());
    world.tile.replace(Some(data));
}

#[when("I fetch the zoom 20 tile containing the bench")]
fn fetch_deep_bench_tile(world: &QueryWorld) {
    let zoom = Zoom::new(20).expect("valid zoom");
    let tile = TileCoord::containing(BENCH.0, BENCH.1, zoom).expect("bench tile");
    let data = get_tile(&*world.store.borrow(), 20, tile.x(), tile.xyz_y()).expect("tile data");
    world.result.replace(data.elements.clone());
    world.tile.replace(Some(data));
}

#[then("the nodes 1, 2, 3, 4 and 5 are returned in id order")]
fn park_nodes_returned(world: &QueryWorld) {
    let result = world.result.borrow();
    assert_eq!(ids(&result.nodes, |n| n.id), [1, 2, 3, 4, 5]);
    assert!(result.ways.is_empty(), "kind filter excludes ways");
}

#[then("the footpath resolves to four locations in reference order")]
fn footpath_geometry(world: &QueryWorld) {
    let store = world.store.borrow();
    let way = store.way(100).expect("read way").expect("footpath stored");
    assert!(!way.tiles.is_empty(), "tiles follow late node writes");
    let geometry = resolve_way_geometry(&*store, &way).expect("resolve geometry");
    assert!(geometry.is_complete());
    let lats: Vec<_> = geometry.locations.iter().map(|c| c.y).collect();
    assert_eq!(lats, [51.4769, 51.4772, 51.4776, 51.4780]);
}

#[then("the road is returned with both of its nodes")]
fn road_returned(world: &QueryWorld) {
    let result = world.result.borrow();
    assert_eq!(ids(&result.ways, |w| w.id), [101]);
    assert_eq!(ids(&result.nodes, |n| n.id), [6, 7]);
}

#[then("the relation referencing the road is returned")]
fn road_relation_returned(world: &QueryWorld) {
    assert_eq!(ids(&world.result.borrow().relations, |r| r.id), [201]);
}

#[then("the site relation is returned")]
fn site_relation_returned(world: &QueryWorld) {
    let relations = ids(&world.result.borrow().relations, |r| r.id);
    assert!(relations.contains(&200), "relations: {relations:?}");
}

#[then("the bench node is returned")]
fn bench_returned(world: &QueryWorld) {
    assert_eq!(ids(&world.result.borrow().nodes, |n| n.id), [5]);
}

#[then("the tile bounds contain the bench")]
fn tile_bounds_contain_bench(world: &QueryWorld) {
    let tile = world.tile.borrow();
    let data = tile.as_ref().expect("tile fetched");
    assert!(data.bounds.contains(BENCH.0, BENCH.1));
    assert_eq!(data.quadkey.as_str().len(), 15);
}

#[scenario(path = "tests/features/spatial_query.feature", index = 0)]
fn bbox_returns_contained_nodes(world: QueryWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/spatial_query.feature", index = 1)]
fn insertion_order_is_irrelevant(world: QueryWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/spatial_query.feature", index = 2)]
fn map_fetch_completes_ways(world: QueryWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/spatial_query.feature", index = 3)]
fn tile_fetch_includes_relations(world: QueryWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/spatial_query.feature", index = 4)]
fn deep_tile_returns_indexed_nodes(world: QueryWorld) {
    let _ = world;
}
