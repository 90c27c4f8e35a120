//! Spatial and attribute queries over an [`EntityStore`](crate::EntityStore).
//!
//! A [`QueryBuilder`] collects at most one spatial filter and any number of
//! attribute predicates, which are combined with logical AND. Bounding boxes
//! become four-point polygons in the same `x = longitude`, `y = latitude`
//! layout that decoded polylines use, so every area filter goes through a
//! single containment test.

use geo::{Coord, Intersects, LineString, Polygon};
use thiserror::Error;

use crate::{
    entity::{Element, ElementKind, Metadata, Node, Relation, Tags, Way},
    polyline::{self, MalformedPolyline},
    store::StoreError,
    tiling::{BoundingBox, QuadKey, TileError},
};

mod execute;

pub use execute::{
    MapData, TileData, WayGeometry, execute, expand_with_referenced_nodes,
    expand_with_referencing_relations, expand_with_referencing_ways, fetch_map, get_tile,
    resolve_way_geometry,
};

/// Errors raised while building or running a query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The bounding box was not finite or its corners were swapped.
    #[error("invalid bounding box: {reason}")]
    InvalidBoundingBox {
        /// Why the box was rejected.
        reason: &'static str,
    },
    /// The polygon filter did not decode.
    #[error(transparent)]
    Polyline(#[from] MalformedPolyline),
    /// The polygon filter had too few vertices to enclose an area.
    #[error("polygon filter needs at least three vertices, got {vertices}")]
    DegeneratePolygon {
        /// Number of decoded vertices.
        vertices: usize,
    },
    /// Tile coordinates were invalid.
    #[error(transparent)]
    Tile(#[from] TileError),
    /// The store failed while executing the query.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Spatial restriction of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SpatialFilter {
    /// No restriction.
    #[default]
    None,
    /// Elements inside the polygon, boundary included.
    Area(Polygon<f64>),
    /// Elements under the tile named by the quadkey.
    Tile(QuadKey),
}

impl SpatialFilter {
    /// Whether a point passes the filter.
    #[must_use]
    pub fn contains(&self, node: &Node) -> bool {
        match self {
            Self::None => true,
            Self::Area(polygon) => polygon.intersects(&node.location),
            Self::Tile(prefix) => match &node.quadkey {
                Some(key) => prefix.is_prefix_of(key),
                None => prefix.to_tile().bounds().contains(node.lat(), node.lon()),
            },
        }
    }
}

/// Attribute predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// A tag with the key exists.
    TagExists(String),
    /// A tag with the key has exactly the value.
    TagEquals(String, String),
    /// Last edited by the named user.
    User(String),
    /// Last edited by the user id.
    Uid(i64),
    /// Last edited in the changeset.
    Changeset(i64),
}

impl Predicate {
    /// Evaluate the predicate against an element's attributes.
    #[must_use]
    pub fn matches(&self, meta: &Metadata, tags: &Tags) -> bool {
        match self {
            Self::TagExists(key) => tags.contains_key(key),
            Self::TagEquals(key, value) => tags.get(key) == Some(value.as_str()),
            Self::User(user) => meta.user.as_deref() == Some(user.as_str()),
            Self::Uid(uid) => meta.uid == Some(*uid),
            Self::Changeset(changeset) => meta.changeset == Some(*changeset),
        }
    }
}

/// A validated query ready for [`execute`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElementQuery {
    /// Restrict results to one kind; `None` returns all kinds.
    pub kind: Option<ElementKind>,
    /// Spatial restriction.
    pub spatial: SpatialFilter,
    /// Attribute predicates, all of which must hold.
    pub predicates: Vec<Predicate>,
    /// Include elements whose `visible` flag is cleared.
    pub include_deleted: bool,
}

impl ElementQuery {
    /// Whether the query asks for elements of `kind`.
    #[must_use]
    pub fn wants(&self, kind: ElementKind) -> bool {
        self.kind.is_none_or(|wanted| wanted == kind)
    }

    /// Whether the element passes the visibility rule and every predicate.
    /// The spatial filter is not consulted.
    #[must_use]
    pub fn accepts(&self, meta: &Metadata, tags: &Tags) -> bool {
        (self.include_deleted || meta.visible)
            && self
                .predicates
                .iter()
                .all(|predicate| predicate.matches(meta, tags))
    }

    /// [`ElementQuery::accepts`] applied to any element.
    #[must_use]
    pub fn accepts_element(&self, element: &Element) -> bool {
        self.accepts(element.meta(), element.tags())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SpatialInput {
    BoundingBox(BoundingBox),
    Polyline(String),
    Tile(QuadKey),
}

/// Builder for [`ElementQuery`].
///
/// Setting a spatial filter replaces any earlier one.
///
/// # Examples
///
/// ```
/// use quadosm_core::{BoundingBox, ElementKind, QueryBuilder, SpatialFilter};
///
/// # fn main() -> Result<(), quadosm_core::QueryError> {
/// let query = QueryBuilder::new()
///     .bbox(BoundingBox::new(51.0, -1.0, 52.0, 0.0))
///     .tag_equals("highway", "footway")
///     .kind(ElementKind::Way)
///     .build()?;
/// assert!(matches!(query.spatial, SpatialFilter::Area(_)));
/// assert_eq!(query.predicates.len(), 1);
///
/// assert!(QueryBuilder::new().polyline("_p~iF").build().is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    kind: Option<ElementKind>,
    spatial: Option<SpatialInput>,
    predicates: Vec<Predicate>,
    include_deleted: bool,
}

impl QueryBuilder {
    /// Start an unrestricted query.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to elements inside `bbox`.
    #[must_use]
    pub fn bbox(mut self, bbox: BoundingBox) -> Self {
        self.spatial = Some(SpatialInput::BoundingBox(bbox));
        self
    }

    /// Restrict to elements inside the polygon encoded as polyline text.
    #[must_use]
    pub fn polyline(mut self, encoded: impl Into<String>) -> Self {
        self.spatial = Some(SpatialInput::Polyline(encoded.into()));
        self
    }

    /// Restrict to elements under the tile named by `quadkey`.
    #[must_use]
    pub fn tile(mut self, quadkey: QuadKey) -> Self {
        self.spatial = Some(SpatialInput::Tile(quadkey));
        self
    }

    /// Require a tag with `key`.
    #[must_use]
    pub fn tag_exists(mut self, key: impl Into<String>) -> Self {
        self.predicates.push(Predicate::TagExists(key.into()));
        self
    }

    /// Require a tag `key=value`.
    #[must_use]
    pub fn tag_equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.predicates
            .push(Predicate::TagEquals(key.into(), value.into()));
        self
    }

    /// Require the last editor's name.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.predicates.push(Predicate::User(user.into()));
        self
    }

    /// Require the last editor's id.
    #[must_use]
    pub fn uid(mut self, uid: i64) -> Self {
        self.predicates.push(Predicate::Uid(uid));
        self
    }

    /// Require the changeset id.
    #[must_use]
    pub fn changeset(mut self, changeset: i64) -> Self {
        self.predicates.push(Predicate::Changeset(changeset));
        self
    }

    /// Restrict to one element kind.
    #[must_use]
    pub fn kind(mut self, kind: ElementKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Also return soft-deleted elements.
    #[must_use]
    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    /// Validate the inputs and produce the query.
    pub fn build(self) -> Result<ElementQuery, QueryError> {
        let spatial = match self.spatial {
            None => SpatialFilter::None,
            Some(SpatialInput::BoundingBox(bbox)) => SpatialFilter::Area(bbox_polygon(&bbox)?),
            Some(SpatialInput::Polyline(encoded)) => {
                let points = polyline::decode(&encoded)?;
                let distinct = distinct_vertices(&points);
                if distinct < 3 {
                    return Err(QueryError::DegeneratePolygon { vertices: distinct });
                }
                SpatialFilter::Area(Polygon::new(LineString::from(points), Vec::new()))
            }
            Some(SpatialInput::Tile(quadkey)) => SpatialFilter::Tile(quadkey),
        };
        Ok(ElementQuery {
            kind: self.kind,
            spatial,
            predicates: self.predicates,
            include_deleted: self.include_deleted,
        })
    }
}

fn distinct_vertices(points: &[Coord<f64>]) -> usize {
    let mut seen: Vec<Coord<f64>> = Vec::with_capacity(points.len());
    for point in points {
        if !seen.contains(point) {
            seen.push(*point);
        }
    }
    seen.len()
}

pub(crate) fn validate_bbox(bbox: &BoundingBox) -> Result<(), QueryError> {
    let corners = [bbox.min_lat, bbox.min_lon, bbox.max_lat, bbox.max_lon];
    if !corners.iter().all(|value| value.is_finite()) {
        return Err(QueryError::InvalidBoundingBox {
            reason: "coordinates must be finite",
        });
    }
    if bbox.min_lat > bbox.max_lat || bbox.min_lon > bbox.max_lon {
        return Err(QueryError::InvalidBoundingBox {
            reason: "minimum corner lies north or east of the maximum corner",
        });
    }
    Ok(())
}

fn bbox_polygon(bbox: &BoundingBox) -> Result<Polygon<f64>, QueryError> {
    validate_bbox(bbox)?;
    let ring = vec![
        Coord {
            x: bbox.min_lon,
            y: bbox.min_lat,
        },
        Coord {
            x: bbox.max_lon,
            y: bbox.min_lat,
        },
        Coord {
            x: bbox.max_lon,
            y: bbox.max_lat,
        },
        Coord {
            x: bbox.min_lon,
            y: bbox.max_lat,
        },
    ];
    Ok(Polygon::new(LineString::from(ring), Vec::new()))
}

/// Elements returned by a query, each list ordered by ascending id.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct QueryResult {
    /// Matching nodes.
    pub nodes: Vec<Node>,
    /// Matching ways.
    pub ways: Vec<Way>,
    /// Matching relations.
    pub relations: Vec<Relation>,
}

impl QueryResult {
    /// Whether every list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.ways.is_empty() && self.relations.is_empty()
    }

    /// Merge nodes, keeping the copy already present for a repeated id.
    pub fn merge_nodes(&mut self, nodes: impl IntoIterator<Item = Node>) {
        merge_by_id(&mut self.nodes, nodes, |node| node.id);
    }

    /// Merge ways, keeping the copy already present for a repeated id.
    pub fn merge_ways(&mut self, ways: impl IntoIterator<Item = Way>) {
        merge_by_id(&mut self.ways, ways, |way| way.id);
    }

    /// Merge relations, keeping the copy already present for a repeated id.
    pub fn merge_relations(&mut self, relations: impl IntoIterator<Item = Relation>) {
        merge_by_id(&mut self.relations, relations, |relation| relation.id);
    }
}

fn merge_by_id<T>(
    target: &mut Vec<T>,
    extra: impl IntoIterator<Item = T>,
    id_of: fn(&T) -> i64,
) {
    let mut by_id: std::collections::BTreeMap<i64, T> =
        target.drain(..).map(|item| (id_of(&item), item)).collect();
    for item in extra {
        by_id.entry(id_of(&item)).or_insert(item);
    }
    *target = by_id.into_values().collect();
}
