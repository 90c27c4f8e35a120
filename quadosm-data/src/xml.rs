//! Pull parser for OSM XML and osmChange documents.
//!
//! [`ChangeReader`] turns a document into a flat stream of [`ChangeEvent`]s.
//! Plain `.osm` files produce only [`ChangeEvent::Element`]; osmChange files
//! wrap their elements in `Open`/`Close` pairs for each action block. The
//! reader carries its own parsing context, so consumers drive it with a
//! plain `for` loop and keep their state in their own types.

use std::{collections::VecDeque, fmt, io::BufRead, str::FromStr};

use geo::Coord;
use log::debug;
use quick_xml::{
    Reader,
    events::{BytesStart, Event, attributes::AttrError},
};
use quadosm_core::{
    ElementId, ElementKind, Member, Metadata, Node, Relation, Tags, TimestampError,
    UnknownElementKind, Way, Zoom, parse_timestamp,
};
use thiserror::Error;

const MAX_LAT: f64 = 90.0;
const MAX_LON: f64 = 180.0;

/// Block action in an osmChange document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// `<create>`: new elements.
    Create,
    /// `<modify>`: full replacements.
    Modify,
    /// `<delete>`: removals.
    Delete,
}

impl Action {
    /// Tag name of the block.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }

    fn from_tag(name: &[u8]) -> Option<Self> {
        match name {
            b"create" => Some(Self::Create),
            b"modify" => Some(Self::Modify),
            b"delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node as written in the document.
///
/// Nodes inside a `<delete>` block may omit their coordinates, so the
/// location is optional until the record is turned into a [`Node`].
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    /// Node id.
    pub id: ElementId,
    /// Edit metadata.
    pub meta: Metadata,
    /// Tags in document order.
    pub tags: Tags,
    /// Position, `x = longitude`, `y = latitude`.
    pub location: Option<Coord<f64>>,
}

impl NodeRecord {
    /// Build a [`Node`] indexed at `zoom`, using `fallback` when the record
    /// carries no coordinates. Returns `None` when neither is available.
    #[must_use]
    pub fn into_node(self, zoom: Zoom, fallback: Option<Coord<f64>>) -> Option<Node> {
        let location = self.location.or(fallback)?;
        Some(
            Node::new(self.id, location, zoom)
                .with_meta(self.meta)
                .with_tags(self.tags),
        )
    }
}

/// One element read from a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    /// A `<node>`.
    Node(NodeRecord),
    /// A `<way>`.
    Way(Way),
    /// A `<relation>`.
    Relation(Relation),
}

impl Primitive {
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

    /// Mutable access to the edit metadata.
    pub fn meta_mut(&mut self) -> &mut Metadata {
        match self {
            Self::Node(node) => &mut node.meta,
            Self::Way(way) => &mut way.meta,
            Self::Relation(relation) => &mut relation.meta,
        }
    }

    fn tags_mut(&mut self) -> &mut Tags {
        match self {
            Self::Node(node) => &mut node.tags,
            Self::Way(way) => &mut way.tags,
            Self::Relation(relation) => &mut relation.tags,
        }
    }
}

/// Event produced by [`ChangeReader`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// An action block opened.
    Open(Action),
    /// A complete element.
    Element(Primitive),
    /// An action block closed.
    Close(Action),
}

/// Errors raised while reading a document.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The document is not well-formed XML.
    #[error("malformed XML at byte {position}: {source}")]
    Xml {
        /// Byte offset of the offending event.
        position: usize,
        /// Source error returned by `quick-xml`.
        #[source]
        source: quick_xml::Error,
    },
    /// An attribute could not be tokenised.
    #[error("malformed attribute at byte {position}: {source}")]
    Attribute {
        /// Byte offset of the element.
        position: usize,
        /// Source error returned by `quick-xml`.
        #[source]
        source: AttrError,
    },
    /// A required attribute is absent.
    #[error("<{element}> at byte {position} is missing the `{attribute}` attribute")]
    MissingAttribute {
        /// Element name.
        element: &'static str,
        /// Attribute name.
        attribute: &'static str,
        /// Byte offset of the element.
        position: usize,
    },
    /// An attribute value does not parse.
    #[error("<{element}> at byte {position} has an invalid `{attribute}` value {value:?}")]
    InvalidAttribute {
        /// Element name.
        element: &'static str,
        /// Attribute name.
        attribute: &'static str,
        /// Raw value.
        value: String,
        /// Byte offset of the element.
        position: usize,
    },
    /// The `timestamp` attribute is not `YYYY-MM-DDTHH:MM:SSZ`.
    #[error("<{element}> at byte {position} has an invalid timestamp")]
    Timestamp {
        /// Element name.
        element: &'static str,
        /// Byte offset of the element.
        position: usize,
        /// Parse failure.
        #[source]
        source: TimestampError,
    },
    /// A `<member>` names an unknown element type.
    #[error("<member> at byte {position} has an unknown type")]
    MemberKind {
        /// Byte offset of the element.
        position: usize,
        /// Parse failure.
        #[source]
        source: UnknownElementKind,
    },
    /// A child element appeared outside the element that may hold it.
    #[error("<{element}> at byte {position} is not inside a {expected}")]
    Orphan {
        /// Element name.
        element: &'static str,
        /// Parent the element requires.
        expected: &'static str,
        /// Byte offset of the element.
        position: usize,
    },
}

/// Attributes of one start tag, unescaped.
struct Attributes {
    element: &'static str,
    position: usize,
    values: Vec<(String, String)>,
}

impl Attributes {
    fn read(start: &BytesStart<'_>, element: &'static str, position: usize) -> Result<Self, ParseError> {
        let mut values = Vec::new();
        for attribute in start.attributes() {
            let attribute =
                attribute.map_err(|source| ParseError::Attribute { position, source })?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let value = attribute
                .unescape_value()
                .map_err(|source| ParseError::Xml { position, source })?
                .into_owned();
            values.push((key, value));
        }
        Ok(Self {
            element,
            position,
            values,
        })
    }

    fn optional(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn required(&self, name: &'static str) -> Result<&str, ParseError> {
        self.optional(name).ok_or(ParseError::MissingAttribute {
            element: self.element,
            attribute: name,
            position: self.position,
        })
    }

    fn parse<T: FromStr>(&self, name: &'static str) -> Result<T, ParseError> {
        let raw = self.required(name)?;
        self.convert(name, raw)
    }

    fn parse_optional<T: FromStr>(&self, name: &'static str) -> Result<Option<T>, ParseError> {
        self.optional(name)
            .map(|raw| self.convert(name, raw))
            .transpose()
    }

    fn convert<T: FromStr>(&self, name: &'static str, raw: &str) -> Result<T, ParseError> {
        raw.trim().parse().map_err(|_| ParseError::InvalidAttribute {
            element: self.element,
            attribute: name,
            value: raw.to_owned(),
            position: self.position,
        })
    }

    /// A finite coordinate within `-limit..=limit` degrees.
    fn coordinate(&self, name: &'static str, limit: f64) -> Result<f64, ParseError> {
        let raw = self.required(name)?;
        let value: f64 = self.convert(name, raw)?;
        if value.is_finite() && (-limit..=limit).contains(&value) {
            Ok(value)
        } else {
            Err(ParseError::InvalidAttribute {
                element: self.element,
                attribute: name,
                value: raw.to_owned(),
                position: self.position,
            })
        }
    }

    fn metadata(&self) -> Result<Metadata, ParseError> {
        let timestamp = parse_timestamp(self.required("timestamp")?).map_err(|source| {
            ParseError::Timestamp {
                element: self.element,
                position: self.position,
                source,
            }
        })?;
        Ok(Metadata {
            timestamp,
            user: self.optional("user").map(str::to_owned),
            uid: self.parse_optional("uid")?,
            version: self.parse_optional("version")?,
            changeset: self.parse_optional("changeset")?,
            visible: self.parse_optional("visible")?.unwrap_or(true),
        })
    }
}

/// Context threaded through a single pass over the document.
#[derive(Debug, Default)]
struct ParseContext {
    action: Option<Action>,
    pending: Option<Primitive>,
    ready: VecDeque<ChangeEvent>,
}

impl ParseContext {
    fn start(&mut self, start: &BytesStart<'_>, position: usize, empty: bool) -> Result<(), ParseError> {
        let name = start.name();
        if let Some(action) = Action::from_tag(name.as_ref()) {
            self.action = Some(action);
            self.ready.push_back(ChangeEvent::Open(action));
            if empty {
                self.close_action(action);
            }
            return Ok(());
        }
        match name.as_ref() {
            b"node" => {
                let attrs = Attributes::read(start, "node", position)?;
                let node = self.node_record(&attrs)?;
                self.begin(Primitive::Node(node), empty);
            }
            b"way" => {
                let attrs = Attributes::read(start, "way", position)?;
                let way = Way::new(attrs.parse("id")?, Vec::new()).with_meta(attrs.metadata()?);
                self.begin(Primitive::Way(way), empty);
            }
            b"relation" => {
                let attrs = Attributes::read(start, "relation", position)?;
                let relation =
                    Relation::new(attrs.parse("id")?, Vec::new()).with_meta(attrs.metadata()?);
                self.begin(Primitive::Relation(relation), empty);
            }
            b"tag" => {
                let attrs = Attributes::read(start, "tag", position)?;
                match self.pending.as_mut() {
                    Some(primitive) => primitive
                        .tags_mut()
                        .push(attrs.required("k")?, attrs.required("v")?),
                    None => debug!("ignoring <tag> outside an element at byte {position}"),
                }
            }
            b"nd" => {
                let attrs = Attributes::read(start, "nd", position)?;
                let Some(Primitive::Way(way)) = self.pending.as_mut() else {
                    return Err(ParseError::Orphan {
                        element: "nd",
                        expected: "way",
                        position,
                    });
                };
                way.node_refs.push(attrs.parse("ref")?);
            }
            b"member" => {
                let attrs = Attributes::read(start, "member", position)?;
                let Some(Primitive::Relation(relation)) = self.pending.as_mut() else {
                    return Err(ParseError::Orphan {
                        element: "member",
                        expected: "relation",
                        position,
                    });
                };
                let kind = ElementKind::from_str(attrs.required("type")?)
                    .map_err(|source| ParseError::MemberKind { position, source })?;
                let ref_id = attrs.parse("ref")?;
                let role = attrs.optional("role").unwrap_or_default();
                relation.members.push(Member::new(kind, ref_id, role));
            }
            _ => {}
        }
        Ok(())
    }

    fn end(&mut self, name: &[u8]) {
        if let Some(action) = Action::from_tag(name) {
            self.close_action(action);
            return;
        }
        if matches!(name, b"node" | b"way" | b"relation")
            && let Some(primitive) = self.pending.take()
        {
            self.ready.push_back(ChangeEvent::Element(primitive));
        }
    }

    fn begin(&mut self, primitive: Primitive, empty: bool) {
        if empty {
            self.ready.push_back(ChangeEvent::Element(primitive));
        } else {
            self.pending = Some(primitive);
        }
    }

    fn close_action(&mut self, action: Action) {
        self.action = None;
        self.ready.push_back(ChangeEvent::Close(action));
    }

    fn node_record(&self, attrs: &Attributes) -> Result<NodeRecord, ParseError> {
        let id = attrs.parse("id")?;
        let meta = attrs.metadata()?;
        let location = if self.action == Some(Action::Delete)
            && attrs.optional("lat").is_none()
            && attrs.optional("lon").is_none()
        {
            None
        } else {
            let lat = attrs.coordinate("lat", MAX_LAT)?;
            let lon = attrs.coordinate("lon", MAX_LON)?;
            Some(Coord { x: lon, y: lat })
        };
        Ok(NodeRecord {
            id,
            meta,
            tags: Tags::new(),
            location,
        })
    }
}

/// Streaming reader over an OSM XML or osmChange document.
///
/// # Examples
///
/// ```
/// use quadosm_data::{Action, ChangeEvent, ChangeReader};
///
/// let document = r#"<osmChange><delete>
///   <node id="7" version="3" timestamp="2024-03-01T12:00:00Z"/>
/// </delete></osmChange>"#;
/// let events: Vec<_> = ChangeReader::new(document.as_bytes())
///     .collect::<Result<_, _>>()
///     .expect("well-formed document");
/// assert_eq!(events.first(), Some(&ChangeEvent::Open(Action::Delete)));
/// assert_eq!(events.len(), 3);
/// ```
pub struct ChangeReader<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    context: ParseContext,
    finished: bool,
}

impl<R: BufRead> ChangeReader<R> {
    /// Wrap a buffered source.
    pub fn new(source: R) -> Self {
        let mut reader = Reader::from_reader(source);
        reader.trim_text(true);
        Self {
            reader,
            buf: Vec::new(),
            context: ParseContext::default(),
            finished: false,
        }
    }

    fn advance(&mut self) -> Result<Option<ChangeEvent>, ParseError> {
        loop {
            if let Some(event) = self.context.ready.pop_front() {
                return Ok(Some(event));
            }
            self.buf.clear();
            let position = self.reader.buffer_position();
            let event = self
                .reader
                .read_event_into(&mut self.buf)
                .map_err(|source| ParseError::Xml { position, source })?;
            match event {
                Event::Eof => return Ok(None),
                Event::Start(start) => self.context.start(&start, position, false)?,
                Event::Empty(start) => self.context.start(&start, position, true)?,
                Event::End(end) => self.context.end(end.name().as_ref()),
                _ => {}
            }
        }
    }
}

impl<R: BufRead> Iterator for ChangeReader<R> {
    type Item = Result<ChangeEvent, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.advance() {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
