//! OpenStreetMap-style primitives.

use std::{collections::BTreeSet, fmt, str::FromStr};

use chrono::{DateTime, NaiveDateTime, Utc};
use geo::Coord;
use log::debug;
use thiserror::Error;

use crate::tiling::{QuadKey, Zoom, quadkey_for};

/// Identifier of an element. Each kind has its own id space.
pub type ElementId = i64;

/// Timestamp layout used by change files, e.g. `2024-01-31T12:00:00Z`.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Error returned when a timestamp does not match the change-file layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid timestamp {value:?}: {source}")]
pub struct TimestampError {
    /// Rejected input.
    pub value: String,
    /// Underlying parse failure.
    #[source]
    pub source: chrono::ParseError,
}

/// Parse a `YYYY-MM-DDTHH:MM:SSZ` timestamp as UTC.
///
/// # Examples
///
/// ```
/// use quadosm_core::parse_timestamp;
///
/// let ts = parse_timestamp("2024-01-31T12:00:00Z").expect("valid timestamp");
/// assert_eq!(ts.timestamp(), 1_706_702_400);
/// assert!(parse_timestamp("2024-01-31 12:00").is_err());
/// ```
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, TimestampError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|source| TimestampError {
            value: value.to_owned(),
            source,
        })
}

/// Kind of map element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum ElementKind {
    /// A point.
    Node,
    /// An ordered list of node references.
    Way,
    /// A grouping of members of any kind.
    Relation,
}

impl ElementKind {
    /// All kinds in store write order.
    pub const ALL: [Self; 3] = [Self::Node, Self::Way, Self::Relation];

    /// Lowercase name as used in change files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Way => "way",
            Self::Relation => "relation",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown element kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown element kind {0:?}")]
pub struct UnknownElementKind(pub String);

impl FromStr for ElementKind {
    type Err = UnknownElementKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node" => Ok(Self::Node),
            "way" => Ok(Self::Way),
            "relation" => Ok(Self::Relation),
            other => Err(UnknownElementKind(other.to_owned())),
        }
    }
}

/// Ordered key/value tags.
///
/// Duplicate keys are preserved in insertion order; lookups return the first
/// match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
pub struct Tags(Vec<(String, String)>);

impl Tags {
    /// Create an empty tag list.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a tag.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// Value of the first tag with `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value.as_str())
    }

    /// Whether any tag uses `key`.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Iterate over `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Tags
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Edit metadata shared by every element.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Metadata {
    /// Time of the last edit, UTC.
    pub timestamp: DateTime<Utc>,
    /// Display name of the editor.
    pub user: Option<String>,
    /// Numeric id of the editor.
    pub uid: Option<i64>,
    /// Element version.
    pub version: Option<u32>,
    /// Changeset that produced this version.
    pub changeset: Option<i64>,
    /// `false` once the element has been deleted.
    pub visible: bool,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            timestamp: DateTime::<Utc>::default(),
            user: None,
            uid: None,
            version: None,
            changeset: None,
            visible: true,
        }
    }
}

/// A point with a location and a derived tile key.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Node {
    /// Node id.
    pub id: ElementId,
    /// Edit metadata.
    pub meta: Metadata,
    /// Tags.
    pub tags: Tags,
    /// Position, `x = longitude`, `y = latitude`.
    pub location: Coord<f64>,
    /// Tile containing the location at the indexing zoom, when projectable.
    pub quadkey: Option<QuadKey>,
}

impl Node {
    /// Create a visible node and derive its quadkey at `zoom`.
    ///
    /// Locations outside the Mercator range are stored without a quadkey.
    ///
    /// # Examples
    ///
    /// ```
    /// use geo::Coord;
    /// use quadosm_core::{Node, Zoom};
    ///
    /// # fn main() -> Result<(), quadosm_core::TileError> {
    /// let node = Node::new(1, Coord { x: -0.1278, y: 51.5074 }, Zoom::new(3)?);
    /// assert_eq!(node.quadkey.map(String::from).as_deref(), Some("031"));
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn new(id: ElementId, location: Coord<f64>, zoom: Zoom) -> Self {
        let quadkey = match quadkey_for(location.y, location.x, zoom) {
            Ok(key) => Some(key),
            Err(err) => {
                debug!("node {id} has no tile key: {err}");
                None
            }
        };
        Self {
            id,
            meta: Metadata::default(),
            tags: Tags::new(),
            location,
            quadkey,
        }
    }

    /// Replace the metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: Metadata) -> Self {
        self.meta = meta;
        self
    }

    /// Replace the tags.
    #[must_use]
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Latitude in degrees.
    #[must_use]
    pub const fn lat(&self) -> f64 {
        self.location.y
    }

    /// Longitude in degrees.
    #[must_use]
    pub const fn lon(&self) -> f64 {
        self.location.x
    }
}

/// An ordered path through nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Way {
    /// Way id.
    pub id: ElementId,
    /// Edit metadata.
    pub meta: Metadata,
    /// Tags.
    pub tags: Tags,
    /// Referenced node ids, in path order. Repeats are allowed.
    pub node_refs: Vec<ElementId>,
    /// Distinct tiles of the referenced nodes currently in the store.
    ///
    /// Maintained by the store on every write; values supplied by callers are
    /// ignored.
    #[cfg_attr(feature = "serde", serde(default))]
    pub tiles: BTreeSet<QuadKey>,
}

impl Way {
    /// Create a visible way.
    #[must_use]
    pub fn new(id: ElementId, node_refs: Vec<ElementId>) -> Self {
        Self {
            id,
            meta: Metadata::default(),
            tags: Tags::new(),
            node_refs,
            tiles: BTreeSet::new(),
        }
    }

    /// Replace the metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: Metadata) -> Self {
        self.meta = meta;
        self
    }

    /// Replace the tags.
    #[must_use]
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Referenced node ids without repeats.
    #[must_use]
    pub fn distinct_node_refs(&self) -> BTreeSet<ElementId> {
        self.node_refs.iter().copied().collect()
    }
}

/// A relation member.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Member {
    /// Kind of the referenced element.
    pub kind: ElementKind,
    /// Id of the referenced element.
    pub ref_id: ElementId,
    /// Free-form role, possibly empty.
    pub role: String,
}

impl Member {
    /// Create a member.
    pub fn new(kind: ElementKind, ref_id: ElementId, role: impl Into<String>) -> Self {
        Self {
            kind,
            ref_id,
            role: role.into(),
        }
    }
}

/// A grouping of nodes, ways and relations.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Relation {
    /// Relation id.
    pub id: ElementId,
    /// Edit metadata.
    pub meta: Metadata,
    /// Tags.
    pub tags: Tags,
    /// Ordered members.
    pub members: Vec<Member>,
}

impl Relation {
    /// Create a visible relation.
    #[must_use]
    pub fn new(id: ElementId, members: Vec<Member>) -> Self {
        Self {
            id,
            meta: Metadata::default(),
            tags: Tags::new(),
            members,
        }
    }

    /// Replace the metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: Metadata) -> Self {
        self.meta = meta;
        self
    }

    /// Replace the tags.
    #[must_use]
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Distinct `(kind, id)` pairs referenced by the members.
    #[must_use]
    pub fn distinct_members(&self) -> BTreeSet<(ElementKind, ElementId)> {
        self.members
            .iter()
            .map(|member| (member.kind, member.ref_id))
            .collect()
    }
}

/// Any element.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(tag = "type", rename_all = "lowercase")
)]
pub enum Element {
    /// A node.
    Node(Node),
    /// A way.
    Way(Way),
    /// A relation.
    Relation(Relation),
}

impl Element {
    /// Kind of the element.
    #[must_use]
    pub const fn kind(&self) -> ElementKind {
        match self {
            Self::Node(_) => ElementKind::Node,
            Self::Way(_) => ElementKind::Way,
            Self::Relation(_) => ElementKind::Relation,
        }
    }

    /// Id of the element.
    #[must_use]
    pub const fn id(&self) -> ElementId {
        match self {
            Self::Node(node) => node.id,
            Self::Way(way) => way.id,
            Self::Relation(relation) => relation.id,
        }
    }

    /// Edit metadata.
    #[must_use]
    pub const fn meta(&self) -> &Metadata {
        match self {
            Self::Node(node) => &node.meta,
            Self::Way(way) => &way.meta,
            Self::Relation(relation) => &relation.meta,
        }
    }

    /// Mutable edit metadata.
    pub fn meta_mut(&mut self) -> &mut Metadata {
        match self {
            Self::Node(node) => &mut node.meta,
            Self::Way(way) => &mut way.meta,
            Self::Relation(relation) => &mut relation.meta,
        }
    }

    /// Tags.
    #[must_use]
    pub const fn tags(&self) -> &Tags {
        match self {
            Self::Node(node) => &node.tags,
            Self::Way(way) => &way.tags,
            Self::Relation(relation) => &relation.tags,
        }
    }
}

impl From<Node> for Element {
    fn from(node: Node) -> Self {
        Self::Node(node)
    }
}

impl From<Way> for Element {
    fn from(way: Way) -> Self {
        Self::Way(way)
    }
}

impl From<Relation> for Element {
    fn from(relation: Relation) -> Self {
        Self::Relation(relation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("node", ElementKind::Node)]
    #[case("way", ElementKind::Way)]
    #[case("relation", ElementKind::Relation)]
    fn kinds_round_trip_through_names(#[case] name: &str, #[case] kind: ElementKind) {
        assert_eq!(name.parse::<ElementKind>(), Ok(kind));
        assert_eq!(kind.to_string(), name);
    }

    #[rstest]
    fn unknown_kind_is_rejected() {
        assert_eq!(
            "changeset".parse::<ElementKind>(),
            Err(UnknownElementKind("changeset".to_owned()))
        );
    }

    #[rstest]
    fn tags_return_first_match() {
        let tags: Tags = [("name", "A"), ("name", "B"), ("highway", "path")]
            .into_iter()
            .collect();
        assert_eq!(tags.get("name"), Some("A"));
        assert!(tags.contains_key("highway"));
        assert!(!tags.contains_key("amenity"));
        assert_eq!(tags.len(), 3);
    }

    #[rstest]
    fn node_outside_mercator_range_has_no_quadkey() {
        let node = Node::new(
            7,
            Coord { x: 0.0, y: 89.9 },
            Zoom::new(17).expect("valid zoom"),
        );
        assert!(node.quadkey.is_none());
        assert!(node.meta.visible);
    }

    #[rstest]
    fn way_distinct_refs_drop_repeats() {
        let way = Way::new(1, vec![3, 1, 2, 3]);
        assert_eq!(way.distinct_node_refs().into_iter().collect::<Vec<_>>(), [1, 2, 3]);
    }

    #[rstest]
    #[case("2024-01-31T12:00:00Z", true)]
    #[case("2024-01-31T12:00:00", false)]
    #[case("2024-13-31T12:00:00Z", false)]
    fn timestamps_follow_change_file_layout(#[case] value: &str, #[case] ok: bool) {
        assert_eq!(parse_timestamp(value).is_ok(), ok);
    }
}
