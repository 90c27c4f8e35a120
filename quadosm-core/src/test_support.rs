//! Fixtures shared by unit and behaviour tests across the workspace.

use geo::Coord;

use crate::{
    EntityStore, MemoryStore, Member, Node, Relation, Tags, Way, WriteBatch,
    entity::{ElementId, ElementKind},
    tiling::Zoom,
};

/// Build a visible node at `(lat, lon)` indexed at the default zoom.
#[must_use]
pub fn node(id: ElementId, lat: f64, lon: f64) -> Node {
    Node::new(id, Coord { x: lon, y: lat }, Zoom::default())
}

/// Build tags from string pairs.
#[must_use]
pub fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs.iter().copied().collect()
}

/// A small neighbourhood around Greenwich Park.
///
/// * nodes 1-4 form way 100 (a footpath) inside the park,
/// * node 5 is a bench inside the park, not on any way,
/// * nodes 6-7 form way 101 (a road) about a kilometre north,
/// * relation 200 groups way 100 and node 5,
/// * relation 201 references way 101.
#[must_use]
pub fn greenwich_batch() -> WriteBatch {
    WriteBatch::new()
        .with(node(1, 51.4769, -0.0005))
        .with(node(2, 51.4772, 0.0001))
        .with(node(3, 51.4776, 0.0008))
        .with(node(4, 51.4780, 0.0014))
        .with(node(5, 51.4774, 0.0003).with_tags(tags(&[("amenity", "bench")])))
        .with(node(6, 51.4870, -0.0060))
        .with(node(7, 51.4875, 0.0040))
        .with(Way::new(100, vec![1, 2, 3, 4]).with_tags(tags(&[("highway", "footway")])))
        .with(Way::new(101, vec![6, 7]).with_tags(tags(&[("highway", "residential")])))
        .with(
            Relation::new(
                200,
                vec![
                    Member::new(ElementKind::Way, 100, "outer"),
                    Member::new(ElementKind::Node, 5, "bench"),
                ],
            )
            .with_tags(tags(&[("type", "site")])),
        )
        .with(Relation::new(201, vec![Member::new(ElementKind::Way, 101, "")]))
}

/// An in-memory store seeded with [`greenwich_batch`].
///
/// # Panics
///
/// Never in practice; the in-memory store cannot fail a write.
#[must_use]
pub fn greenwich_store() -> MemoryStore {
    let mut store = MemoryStore::new();
    if let Err(err) = store.write_batch(greenwich_batch()) {
        panic!("seeding the in-memory store failed: {err}");
    }
    store
}
