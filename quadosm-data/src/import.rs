//! Bulk loading of OSM extracts into an [`EntityStore`].
//!
//! Elements are buffered and written in batches of
//! [`ImportConfig::batch_size`] so memory use and transaction size stay
//! bounded. Batch boundaries never change the final store contents: the
//! store resolves way tiles and reverse indexes whichever batch a
//! referenced node arrives in.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use osmpbf::{Element as PbfElement, ElementReader, RelMemberType};
use quadosm_core::{
    Element, ElementKind, EntityStore, Member, Metadata, Node, Relation, StoreError, Tags, Way,
    WriteBatch, Zoom,
};
use serde::Serialize;
use thiserror::Error;

use crate::xml::{ChangeEvent, ChangeReader, ParseError, Primitive};

/// Default number of elements per store write.
pub const DEFAULT_BATCH_SIZE: usize = 2000;

/// Log progress every this many batches.
const PROGRESS_INTERVAL: u64 = 50;

/// Settings for a bulk import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportConfig {
    batch_size: usize,
    zoom: Zoom,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            zoom: Zoom::default(),
        }
    }
}

impl ImportConfig {
    /// Write every `batch_size` elements; zero is treated as one.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Index nodes at `zoom`.
    #[must_use]
    pub const fn with_zoom(mut self, zoom: Zoom) -> Self {
        self.zoom = zoom;
        self
    }

    /// Elements per store write.
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Zoom used for node quadkeys.
    #[must_use]
    pub const fn zoom(&self) -> Zoom {
        self.zoom
    }
}

/// Counts reported once an import completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    /// Nodes written.
    pub nodes: u64,
    /// Ways written.
    pub ways: u64,
    /// Relations written.
    pub relations: u64,
    /// Store writes issued.
    pub batches: u64,
    /// Elements that could not be converted and were logged instead.
    pub skipped: u64,
}

/// Container format of an import file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// Uncompressed OSM XML.
    Xml,
    /// Bzip2-compressed OSM XML.
    XmlBz2,
    /// OSM protocol buffer binary format.
    Pbf,
}

impl InputFormat {
    /// Guess the format from the file name.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::path::Path;
    /// use quadosm_data::InputFormat;
    ///
    /// assert_eq!(InputFormat::from_path(Path::new("a/b.osm.bz2")), Some(InputFormat::XmlBz2));
    /// assert_eq!(InputFormat::from_path(Path::new("notes.txt")), None);
    /// ```
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".pbf") {
            Some(Self::Pbf)
        } else if name.ends_with(".bz2") {
            Some(Self::XmlBz2)
        } else if [".osm", ".xml", ".osc"]
            .iter()
            .any(|suffix| name.ends_with(suffix))
        {
            Some(Self::Xml)
        } else {
            None
        }
    }
}

/// Errors returned by the importers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ImportError {
    /// The input file could not be opened.
    #[error("failed to open {path:?}")]
    Open {
        /// File that failed to open.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The file name does not identify a supported format.
    #[error("cannot tell the format of {path:?}; expected .osm, .osm.bz2 or .osm.pbf")]
    UnknownFormat {
        /// Offending file.
        path: PathBuf,
    },
    /// The PBF file could not be opened.
    #[error("failed to open OSM PBF file at {path:?}")]
    OpenPbf {
        /// File that failed to open.
        path: PathBuf,
        /// Source error returned by `osmpbf`.
        #[source]
        source: osmpbf::Error,
    },
    /// The PBF file could not be decoded.
    #[error("failed to decode OSM PBF data at {path:?}")]
    DecodePbf {
        /// File being decoded.
        path: PathBuf,
        /// Source error returned by `osmpbf`.
        #[source]
        source: osmpbf::Error,
    },
    /// The XML document is malformed.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// A batch could not be written.
    #[error("failed to write import batch {batch}")]
    Store {
        /// One-based number of the failing batch.
        batch: u64,
        /// Source error returned by the store.
        #[source]
        source: StoreError,
    },
}

/// Buffers elements and writes them in bounded batches.
struct BatchLoader<'a, S: ?Sized> {
    store: &'a mut S,
    config: ImportConfig,
    batch: WriteBatch,
    summary: ImportSummary,
}

impl<'a, S> BatchLoader<'a, S>
where
    S: EntityStore + ?Sized,
{
    fn new(store: &'a mut S, config: ImportConfig) -> Self {
        Self {
            store,
            config,
            batch: WriteBatch::new(),
            summary: ImportSummary::default(),
        }
    }

    fn push(&mut self, element: Element) -> Result<(), ImportError> {
        match element.kind() {
            ElementKind::Node => self.summary.nodes += 1,
            ElementKind::Way => self.summary.ways += 1,
            ElementKind::Relation => self.summary.relations += 1,
        }
        self.batch.push(element);
        if self.batch.len() >= self.config.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn push_primitive(&mut self, primitive: Primitive) -> Result<(), ImportError> {
        match primitive {
            Primitive::Node(record) => {
                let id = record.id;
                match record.into_node(self.config.zoom, None) {
                    Some(node) => self.push(Element::Node(node)),
                    None => {
                        self.skip(ElementKind::Node, id, "no coordinates");
                        Ok(())
                    }
                }
            }
            Primitive::Way(way) => self.push(Element::Way(way)),
            Primitive::Relation(relation) => self.push(Element::Relation(relation)),
        }
    }

    fn skip(&mut self, kind: ElementKind, id: i64, reason: &str) {
        warn!("skipping {kind} {id}: {reason}");
        self.summary.skipped += 1;
    }

    fn flush(&mut self) -> Result<(), ImportError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        let number = self.summary.batches + 1;
        debug!("writing import batch {number} with {} elements", batch.len());
        self.store
            .write_batch(batch)
            .map_err(|source| ImportError::Store {
                batch: number,
                source,
            })?;
        self.summary.batches = number;
        if number % PROGRESS_INTERVAL == 0 {
            info!(
                "imported {} nodes, {} ways and {} relations so far",
                self.summary.nodes, self.summary.ways, self.summary.relations
            );
        }
        Ok(())
    }

    fn finish(mut self) -> Result<ImportSummary, ImportError> {
        self.flush()?;
        let summary = self.summary;
        info!(
            "import finished: {} nodes, {} ways, {} relations in {} batches ({} skipped)",
            summary.nodes, summary.ways, summary.relations, summary.batches, summary.skipped
        );
        Ok(summary)
    }
}

/// Import an OSM XML document read from `source`.
///
/// Action blocks of an osmChange document are ignored; every element is
/// written as-is.
///
/// # Errors
///
/// Returns [`ImportError::Parse`] for malformed XML and
/// [`ImportError::Store`] when a batch cannot be written. Batches written
/// before the failure remain in the store.
///
/// # Examples
///
/// ```
/// use quadosm_core::{EntityStore, MemoryStore};
/// use quadosm_data::{ImportConfig, import_xml};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let document = r#"<osm>
///   <node id="1" timestamp="2024-03-01T12:00:00Z" lat="51.5" lon="-0.1"/>
/// </osm>"#;
/// let mut store = MemoryStore::new();
/// let summary = import_xml(&mut store, document.as_bytes(), ImportConfig::default())?;
/// assert_eq!((summary.nodes, summary.batches), (1, 1));
/// # Ok(())
/// # }
/// ```
pub fn import_xml<S, R>(
    store: &mut S,
    source: R,
    config: ImportConfig,
) -> Result<ImportSummary, ImportError>
where
    S: EntityStore + ?Sized,
    R: BufRead,
{
    let mut loader = BatchLoader::new(store, config);
    for event in ChangeReader::new(source) {
        if let ChangeEvent::Element(primitive) = event? {
            loader.push_primitive(primitive)?;
        }
    }
    loader.finish()
}

/// Import an OSM PBF file.
///
/// # Errors
///
/// Returns [`ImportError::OpenPbf`] or [`ImportError::DecodePbf`] when the
/// file is unreadable, and [`ImportError::Store`] when a batch cannot be
/// written.
pub fn import_pbf<S>(
    store: &mut S,
    path: &Path,
    config: ImportConfig,
) -> Result<ImportSummary, ImportError>
where
    S: EntityStore + ?Sized,
{
    let reader = ElementReader::from_path(path).map_err(|source| ImportError::OpenPbf {
        source,
        path: path.to_path_buf(),
    })?;
    let mut loader = BatchLoader::new(store, config);
    let mut failure = None;
    {
        let loader_ref = &mut loader;
        let failure_ref = &mut failure;
        reader
            .for_each(|element| {
                if failure_ref.is_some() {
                    return;
                }
                if let Err(err) = load_pbf_element(loader_ref, element) {
                    *failure_ref = Some(err);
                }
            })
            .map_err(|source| ImportError::DecodePbf {
                source,
                path: path.to_path_buf(),
            })?;
    }
    if let Some(err) = failure {
        return Err(err);
    }
    loader.finish()
}

/// Import a file, choosing the reader from its extension.
///
/// # Errors
///
/// Returns [`ImportError::UnknownFormat`] when the extension is not
/// recognised, plus any error of the format-specific importer.
pub fn import_path<S>(
    store: &mut S,
    path: &Path,
    config: ImportConfig,
) -> Result<ImportSummary, ImportError>
where
    S: EntityStore + ?Sized,
{
    let format = InputFormat::from_path(path).ok_or_else(|| ImportError::UnknownFormat {
        path: path.to_path_buf(),
    })?;
    info!("importing {} as {format:?}", path.display());
    match format {
        InputFormat::Pbf => import_pbf(store, path, config),
        InputFormat::Xml => import_xml(store, BufReader::new(open(path)?), config),
        InputFormat::XmlBz2 => {
            let decoder = bzip2::read::MultiBzDecoder::new(open(path)?);
            import_xml(store, BufReader::new(decoder), config)
        }
    }
}

fn open(path: &Path) -> Result<File, ImportError> {
    File::open(path).map_err(|source| ImportError::Open {
        path: path.to_path_buf(),
        source,
    })
}

fn load_pbf_element<S>(
    loader: &mut BatchLoader<'_, S>,
    element: PbfElement<'_>,
) -> Result<(), ImportError>
where
    S: EntityStore + ?Sized,
{
    let zoom = loader.config.zoom;
    let element = match element {
        PbfElement::Node(node) => {
            let info = node.info();
            let meta = pbf_meta(
                info.milli_timestamp(),
                info.version(),
                info.changeset(),
                info.uid(),
                info.user().and_then(Result::ok),
                info.visible(),
            );
            let location = geo::Coord {
                x: node.lon(),
                y: node.lat(),
            };
            Element::Node(
                Node::new(node.id(), location, zoom)
                    .with_meta(meta)
                    .with_tags(node.tags().collect()),
            )
        }
        PbfElement::DenseNode(node) => {
            let meta = node.info().map_or_else(Metadata::default, |info| {
                pbf_meta(
                    Some(info.milli_timestamp()),
                    Some(info.version()),
                    Some(info.changeset()),
                    Some(info.uid()),
                    info.user().ok(),
                    info.visible(),
                )
            });
            let location = geo::Coord {
                x: node.lon(),
                y: node.lat(),
            };
            Element::Node(
                Node::new(node.id(), location, zoom)
                    .with_meta(meta)
                    .with_tags(node.tags().collect()),
            )
        }
        PbfElement::Way(way) => {
            let info = way.info();
            let meta = pbf_meta(
                info.milli_timestamp(),
                info.version(),
                info.changeset(),
                info.uid(),
                info.user().and_then(Result::ok),
                info.visible(),
            );
            Element::Way(
                Way::new(way.id(), way.refs().collect())
                    .with_meta(meta)
                    .with_tags(way.tags().collect()),
            )
        }
        PbfElement::Relation(relation) => {
            let info = relation.info();
            let meta = pbf_meta(
                info.milli_timestamp(),
                info.version(),
                info.changeset(),
                info.uid(),
                info.user().and_then(Result::ok),
                info.visible(),
            );
            let members = relation
                .members()
                .map(|member| {
                    let kind = match member.member_type {
                        RelMemberType::Node => ElementKind::Node,
                        RelMemberType::Way => ElementKind::Way,
                        RelMemberType::Relation => ElementKind::Relation,
                    };
                    Member::new(kind, member.member_id, member.role().unwrap_or_default())
                })
                .collect();
            let tags: Tags = relation.tags().collect();
            Element::Relation(
                Relation::new(relation.id(), members)
                    .with_meta(meta)
                    .with_tags(tags),
            )
        }
    };
    loader.push(element)
}

fn pbf_meta(
    milli_timestamp: Option<i64>,
    version: Option<i32>,
    changeset: Option<i64>,
    uid: Option<i32>,
    user: Option<&str>,
    visible: bool,
) -> Metadata {
    Metadata {
        timestamp: milli_timestamp
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_default(),
        user: user.filter(|name| !name.is_empty()).map(str::to_owned),
        uid: uid.map(i64::from),
        version: version.and_then(|v| u32::try_from(v).ok()),
        changeset,
        visible,
    }
}
