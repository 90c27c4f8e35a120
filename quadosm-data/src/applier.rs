//! Applies osmChange event streams to an [`EntityStore`].
//!
//! [`ChangesetApplier`] is a two-state machine: it is either idle or
//! buffering the elements of one action block. Closing a block turns the
//! buffer into a single [`WriteBatch`], so a block is either fully written
//! or not written at all, and blocks land in document order.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::BufRead,
};

use log::{debug, warn};
use quadosm_core::{
    Element, ElementId, ElementKind, EntityStore, StoreError, WriteBatch, Zoom,
};
use serde::Serialize;
use thiserror::Error;

use crate::xml::{Action, ChangeEvent, ChangeReader, ParseError, Primitive};

/// How `<delete>` blocks are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeleteMode {
    /// Keep the record and mark it `visible = false`.
    #[default]
    Soft,
    /// Remove the record and its index entries.
    Hard,
}

/// What happens to a block still open when the stream ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PendingBlockPolicy {
    /// Drop the buffered elements and log how many were lost.
    #[default]
    Discard,
    /// Apply the buffered elements as if the block had been closed.
    Flush,
}

/// Settings for [`ChangesetApplier`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplierConfig {
    zoom: Zoom,
    delete_mode: DeleteMode,
    pending_block: PendingBlockPolicy,
}

impl ApplierConfig {
    /// Index nodes at `zoom`.
    #[must_use]
    pub const fn with_zoom(mut self, zoom: Zoom) -> Self {
        self.zoom = zoom;
        self
    }

    /// Choose how deletions are applied.
    #[must_use]
    pub const fn with_delete_mode(mut self, mode: DeleteMode) -> Self {
        self.delete_mode = mode;
        self
    }

    /// Choose what happens to an unterminated block.
    #[must_use]
    pub const fn with_pending_block(mut self, policy: PendingBlockPolicy) -> Self {
        self.pending_block = policy;
        self
    }

    /// Zoom used for node quadkeys.
    #[must_use]
    pub const fn zoom(&self) -> Zoom {
        self.zoom
    }

    /// Configured delete mode.
    #[must_use]
    pub const fn delete_mode(&self) -> DeleteMode {
        self.delete_mode
    }

    /// Configured end-of-stream policy.
    #[must_use]
    pub const fn pending_block(&self) -> PendingBlockPolicy {
        self.pending_block
    }
}

/// Errors raised while applying a change stream.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApplyError {
    /// The document could not be read.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Reading from or writing to the store failed.
    #[error("failed to apply a {action} block: {source}")]
    Store {
        /// Block being applied.
        action: Action,
        /// Source error returned by the store.
        #[source]
        source: StoreError,
    },
    /// A block opened before the previous one closed.
    #[error("<{opened}> opened inside an unclosed <{current}> block")]
    NestedBlock {
        /// Block already open.
        current: Action,
        /// Block that tried to open.
        opened: Action,
    },
    /// A closing tag did not match the open block.
    #[error("</{closed}> does not close the open block ({open:?})")]
    MismatchedClose {
        /// Block currently open, if any.
        open: Option<Action>,
        /// Block named by the closing tag.
        closed: Action,
    },
    /// An element appeared between blocks.
    #[error("{kind} {id} appears outside an action block")]
    ElementOutsideBlock {
        /// Kind of the element.
        kind: ElementKind,
        /// Id of the element.
        id: ElementId,
    },
}

/// Counts reported after a change stream has been applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    /// Blocks written to the store.
    pub blocks: u64,
    /// Elements written by `<create>` blocks.
    pub created: u64,
    /// Elements written by `<modify>` blocks.
    pub modified: u64,
    /// Elements deleted, softly or not.
    pub deleted: u64,
    /// Elements that could not be applied and were logged instead.
    pub skipped: u64,
    /// Elements dropped from an unterminated block.
    pub discarded: u64,
}

impl ApplySummary {
    /// Add the counts of `other`.
    pub fn absorb(&mut self, other: &Self) {
        self.blocks += other.blocks;
        self.created += other.created;
        self.modified += other.modified;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.discarded += other.discarded;
    }

    fn record(&mut self, action: Action, written: u64) {
        self.blocks += 1;
        match action {
            Action::Create => self.created += written,
            Action::Modify => self.modified += written,
            Action::Delete => self.deleted += written,
        }
    }
}

#[derive(Debug)]
enum State {
    Idle,
    InBlock {
        action: Action,
        pending: Vec<Primitive>,
    },
}

/// Streaming state machine applying [`ChangeEvent`]s to a store.
///
/// # Examples
///
/// ```
/// use quadosm_core::{EntityStore, MemoryStore};
/// use quadosm_data::{ApplierConfig, ChangeReader, ChangesetApplier};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let document = r#"<osmChange><create>
///   <node id="1" timestamp="2024-03-01T12:00:00Z" lat="51.5" lon="-0.1"/>
/// </create></osmChange>"#;
/// let mut store = MemoryStore::new();
/// let mut applier = ChangesetApplier::new(&mut store, ApplierConfig::default());
/// for event in ChangeReader::new(document.as_bytes()) {
///     applier.handle(event?)?;
/// }
/// let summary = applier.finish()?;
/// assert_eq!(summary.created, 1);
/// assert!(store.node(1)?.is_some());
/// # Ok(())
/// # }
/// ```
pub struct ChangesetApplier<'a, S: ?Sized> {
    store: &'a mut S,
    config: ApplierConfig,
    state: State,
    summary: ApplySummary,
}

impl<'a, S> ChangesetApplier<'a, S>
where
    S: EntityStore + ?Sized,
{
    /// Start applying changes to `store`.
    pub fn new(store: &'a mut S, config: ApplierConfig) -> Self {
        Self {
            store,
            config,
            state: State::Idle,
            summary: ApplySummary::default(),
        }
    }

    /// Feed one event into the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError`] when the event is out of place or the store
    /// rejects a block.
    pub fn handle(&mut self, event: ChangeEvent) -> Result<(), ApplyError> {
        match event {
            ChangeEvent::Open(opened) => match &self.state {
                State::Idle => {
                    self.state = State::InBlock {
                        action: opened,
                        pending: Vec::new(),
                    };
                    Ok(())
                }
                State::InBlock { action, .. } => Err(ApplyError::NestedBlock {
                    current: *action,
                    opened,
                }),
            },
            ChangeEvent::Element(primitive) => match &mut self.state {
                State::InBlock { pending, .. } => {
                    pending.push(primitive);
                    Ok(())
                }
                State::Idle => Err(ApplyError::ElementOutsideBlock {
                    kind: primitive.kind(),
                    id: primitive.id(),
                }),
            },
            ChangeEvent::Close(closed) => match std::mem::replace(&mut self.state, State::Idle) {
                State::InBlock { action, pending } if action == closed => {
                    self.apply_block(action, pending)
                }
                State::InBlock { action, pending } => {
                    self.state = State::InBlock { action, pending };
                    Err(ApplyError::MismatchedClose {
                        open: Some(action),
                        closed,
                    })
                }
                State::Idle => Err(ApplyError::MismatchedClose {
                    open: None,
                    closed,
                }),
            },
        }
    }

    /// Finish the stream and report what was applied.
    ///
    /// An unterminated block is handled according to the configured
    /// [`PendingBlockPolicy`].
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Store`] when flushing the pending block fails.
    pub fn finish(mut self) -> Result<ApplySummary, ApplyError> {
        if let State::InBlock { action, pending } = std::mem::replace(&mut self.state, State::Idle)
        {
            match self.config.pending_block {
                PendingBlockPolicy::Discard => {
                    warn!(
                        "discarding {} elements of an unterminated <{action}> block",
                        pending.len()
                    );
                    self.summary.discarded += pending.len() as u64;
                }
                PendingBlockPolicy::Flush => {
                    debug!("flushing an unterminated <{action}> block");
                    self.apply_block(action, pending)?;
                }
            }
        }
        Ok(self.summary)
    }

    fn apply_block(&mut self, action: Action, pending: Vec<Primitive>) -> Result<(), ApplyError> {
        let store_error = |source| ApplyError::Store { action, source };
        let batch = match action {
            Action::Create | Action::Modify => self.upsert_batch(pending),
            Action::Delete => self.delete_batch(pending).map_err(store_error)?,
        };
        if matches!(action, Action::Create | Action::Modify) {
            self.log_missing_references(&batch).map_err(store_error)?;
        }
        let written = batch.len() as u64;
        debug!("applying <{action}> block with {written} elements");
        self.store.write_batch(batch).map_err(store_error)?;
        self.summary.record(action, written);
        Ok(())
    }

    fn upsert_batch(&mut self, pending: Vec<Primitive>) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for primitive in pending {
            match primitive {
                Primitive::Node(record) => {
                    let id = record.id;
                    match record.into_node(self.config.zoom, None) {
                        Some(node) => batch.push(Element::Node(node)),
                        None => {
                            warn!("skipping node {id}: no coordinates");
                            self.summary.skipped += 1;
                        }
                    }
                }
                Primitive::Way(way) => batch.push(Element::Way(way)),
                Primitive::Relation(relation) => batch.push(Element::Relation(relation)),
            }
        }
        batch
    }

    fn delete_batch(&mut self, pending: Vec<Primitive>) -> Result<WriteBatch, StoreError> {
        let mut batch = WriteBatch::new();
        if self.config.delete_mode == DeleteMode::Hard {
            for primitive in pending {
                batch.remove(primitive.kind(), primitive.id());
            }
            return Ok(batch);
        }
        for mut primitive in pending {
            primitive.meta_mut().visible = false;
            match primitive {
                Primitive::Node(record) => {
                    let id = record.id;
                    let fallback = match record.location {
                        Some(_) => None,
                        None => self.store.node(id)?.map(|stored| stored.location),
                    };
                    match record.into_node(self.config.zoom, fallback) {
                        Some(node) => batch.push(Element::Node(node)),
                        None => {
                            warn!("cannot delete node {id}: no coordinates and no stored copy");
                            self.summary.skipped += 1;
                        }
                    }
                }
                Primitive::Way(way) => batch.push(Element::Way(way)),
                Primitive::Relation(relation) => batch.push(Element::Relation(relation)),
            }
        }
        Ok(batch)
    }

    fn log_missing_references(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        for referrer in self.missing_references(batch)? {
            warn!(
                "{} {} references missing elements {:?}",
                referrer.kind, referrer.id, referrer.missing
            );
        }
        Ok(())
    }

    /// Ways and relations of `batch` whose references are in neither the
    /// batch nor the store.
    fn missing_references(&self, batch: &WriteBatch) -> Result<Vec<MissingReferences>, StoreError> {
        let in_batch: BTreeSet<(ElementKind, ElementId)> = batch
            .nodes
            .iter()
            .map(|node| (ElementKind::Node, node.id))
            .chain(batch.ways.iter().map(|way| (ElementKind::Way, way.id)))
            .chain(
                batch
                    .relations
                    .iter()
                    .map(|relation| (ElementKind::Relation, relation.id)),
            )
            .collect();
        let referrers: Vec<(ElementKind, ElementId, BTreeSet<(ElementKind, ElementId)>)> = batch
            .ways
            .iter()
            .map(|way| {
                let refs = way
                    .distinct_node_refs()
                    .into_iter()
                    .map(|id| (ElementKind::Node, id))
                    .collect();
                (ElementKind::Way, way.id, refs)
            })
            .chain(batch.relations.iter().map(|relation| {
                let refs = relation
                    .members
                    .iter()
                    .map(|member| (member.kind, member.ref_id))
                    .collect();
                (ElementKind::Relation, relation.id, refs)
            }))
            .collect();

        let mut wanted: BTreeMap<ElementKind, Vec<ElementId>> = BTreeMap::new();
        let outside_batch: BTreeSet<(ElementKind, ElementId)> = referrers
            .iter()
            .flat_map(|(_, _, refs)| refs.iter().copied())
            .filter(|reference| !in_batch.contains(reference))
            .collect();
        for (kind, id) in &outside_batch {
            wanted.entry(*kind).or_default().push(*id);
        }
        let mut stored = BTreeSet::new();
        for (kind, ids) in wanted {
            for element in self.store.find_by_ids(kind, &ids)? {
                stored.insert((kind, element.id()));
            }
        }

        Ok(referrers
            .into_iter()
            .filter_map(|(kind, id, refs)| {
                let missing: Vec<_> = refs
                    .into_iter()
                    .filter(|reference| !in_batch.contains(reference) && !stored.contains(reference))
                    .collect();
                (!missing.is_empty()).then_some(MissingReferences { kind, id, missing })
            })
            .collect())
    }
}

/// A way or relation with references that could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MissingReferences {
    kind: ElementKind,
    id: ElementId,
    missing: Vec<(ElementKind, ElementId)>,
}

/// Read an osmChange document from `source` and apply it to `store`.
///
/// Blocks before a malformed element have already been written when this
/// returns an error; the block containing it is not.
///
/// # Errors
///
/// Returns [`ApplyError`] when the document is malformed, its blocks are
/// out of order, or the store fails.
pub fn apply_change<S, R>(
    store: &mut S,
    source: R,
    config: ApplierConfig,
) -> Result<ApplySummary, ApplyError>
where
    S: EntityStore + ?Sized,
    R: BufRead,
{
    let mut applier = ChangesetApplier::new(store, config);
    for event in ChangeReader::new(source) {
        applier.handle(event?)?;
    }
    applier.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quadosm_core::{Member, MemoryStore, Node, Relation, Way, resolve_way_geometry};
    use rstest::{fixture, rstest};

    const CREATE_NODES: &str = r#"<create>
  <node id="1" version="1" timestamp="2024-03-01T12:00:00Z" lat="51.4769" lon="-0.0005"/>
  <node id="2" version="1" timestamp="2024-03-01T12:00:00Z" lat="51.4772" lon="0.0001"/>
</create>"#;

    const CREATE_WAY: &str = r#"<create>
  <way id="100" version="1" timestamp="2024-03-01T12:00:00Z">
    <nd ref="1"/><nd ref="2"/>
    <tag k="highway" v="footway"/>
  </way>
</create>"#;

    fn change(blocks: &[&str]) -> String {
        format!("<osmChange version=\"0.6\">{}</osmChange>", blocks.concat())
    }

    #[fixture]
    fn store() -> MemoryStore {
        MemoryStore::new()
    }

    fn apply(store: &mut MemoryStore, document: &str, config: ApplierConfig) -> ApplySummary {
        apply_change(store, document.as_bytes(), config).expect("apply change")
    }

    #[rstest]
    fn applying_a_create_block_twice_is_idempotent(mut store: MemoryStore) {
        let document = change(&[CREATE_NODES, CREATE_WAY]);
        apply(&mut store, &document, ApplierConfig::default());
        let once = (store.scan(ElementKind::Node).expect("scan"), store.way(100).expect("way"));
        apply(&mut store, &document, ApplierConfig::default());
        let twice = (store.scan(ElementKind::Node).expect("scan"), store.way(100).expect("way"));
        assert_eq!(once, twice);
        assert_eq!(store.ways_referencing(1).expect("index").len(), 1);
    }

    #[rstest]
    #[case::nodes_first(&[CREATE_NODES, CREATE_WAY])]
    #[case::way_first(&[CREATE_WAY, CREATE_NODES])]
    fn way_geometry_does_not_depend_on_block_order(
        mut store: MemoryStore,
        #[case] blocks: &[&str],
    ) {
        apply(&mut store, &change(blocks), ApplierConfig::default());
        let way = store.way(100).expect("read way").expect("way stored");
        let geometry = resolve_way_geometry(&store, &way).expect("resolve");
        assert!(geometry.is_complete());
        let lats: Vec<_> = geometry.locations.iter().map(|c| c.y).collect();
        assert_eq!(lats, [51.4769, 51.4772]);
        assert!(!way.tiles.is_empty());
    }

    #[rstest]
    fn modify_inserts_unknown_ids(mut store: MemoryStore) {
        let document = change(&[r#"<modify>
  <node id="9" version="2" timestamp="2024-03-02T00:00:00Z" lat="1.0" lon="2.0"/>
</modify>"#]);
        let summary = apply(&mut store, &document, ApplierConfig::default());
        assert_eq!(summary.modified, 1);
        assert!(store.node(9).expect("read").is_some());
    }

    #[rstest]
    fn soft_delete_keeps_the_stored_location(mut store: MemoryStore) {
        apply(&mut store, &change(&[CREATE_NODES]), ApplierConfig::default());
        let document = change(&[r#"<delete>
  <node id="2" version="2" timestamp="2024-03-02T00:00:00Z"/>
</delete>"#]);
        let summary = apply(&mut store, &document, ApplierConfig::default());
        assert_eq!(summary.deleted, 1);
        let node = store.node(2).expect("read").expect("node retained");
        assert!(!node.meta.visible);
        assert_eq!(node.meta.version, Some(2));
        assert_eq!(node.location.y, 51.4772);
    }

    #[rstest]
    fn soft_delete_of_an_unknown_node_without_coordinates_is_skipped(mut store: MemoryStore) {
        let document = change(&[r#"<delete>
  <node id="77" version="2" timestamp="2024-03-02T00:00:00Z"/>
</delete>"#]);
        let summary = apply(&mut store, &document, ApplierConfig::default());
        assert_eq!((summary.deleted, summary.skipped), (0, 1));
        assert!(store.node(77).expect("read").is_none());
    }

    #[rstest]
    fn hard_delete_removes_records_and_index_entries(mut store: MemoryStore) {
        apply(
            &mut store,
            &change(&[CREATE_NODES, CREATE_WAY]),
            ApplierConfig::default(),
        );
        let document = change(&[r#"<delete>
  <way id="100" version="2" timestamp="2024-03-02T00:00:00Z"/>
</delete>"#]);
        let config = ApplierConfig::default().with_delete_mode(DeleteMode::Hard);
        apply(&mut store, &document, config);
        assert!(store.way(100).expect("read").is_none());
        assert!(store.ways_referencing(1).expect("index").is_empty());
    }

    #[rstest]
    #[case::discard(PendingBlockPolicy::Discard, false)]
    #[case::flush(PendingBlockPolicy::Flush, true)]
    fn pending_block_policy_decides_the_tail(
        mut store: MemoryStore,
        #[case] policy: PendingBlockPolicy,
        #[case] stored: bool,
    ) {
        let config = ApplierConfig::default().with_pending_block(policy);
        let mut applier = ChangesetApplier::new(&mut store, config);
        let events = ChangeReader::new(change(&[CREATE_NODES]).as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .expect("parse");
        let without_close = events.len() - 1;
        for event in events.into_iter().take(without_close) {
            applier.handle(event).expect("handle");
        }
        let summary = applier.finish().expect("finish");
        assert_eq!(summary.discarded, if stored { 0 } else { 2 });
        assert_eq!(store.node(1).expect("read").is_some(), stored);
    }

    #[rstest]
    fn nested_blocks_are_rejected(mut store: MemoryStore) {
        let document = "<osmChange><create><modify/></create></osmChange>";
        let err = apply_change(&mut store, document.as_bytes(), ApplierConfig::default())
            .expect_err("nested block");
        assert!(matches!(
            err,
            ApplyError::NestedBlock {
                current: Action::Create,
                opened: Action::Modify
            }
        ));
    }

    #[rstest]
    fn elements_outside_blocks_are_rejected(mut store: MemoryStore) {
        let document = r#"<osmChange><node id="1" timestamp="2024-03-01T12:00:00Z" lat="1" lon="1"/></osmChange>"#;
        let err = apply_change(&mut store, document.as_bytes(), ApplierConfig::default())
            .expect_err("bare element");
        assert!(matches!(
            err,
            ApplyError::ElementOutsideBlock {
                kind: ElementKind::Node,
                id: 1
            }
        ));
    }

    #[rstest]
    fn stray_close_is_rejected(mut store: MemoryStore) {
        let mut applier = ChangesetApplier::new(&mut store, ApplierConfig::default());
        let err = applier
            .handle(ChangeEvent::Close(Action::Delete))
            .expect_err("nothing open");
        assert!(matches!(
            err,
            ApplyError::MismatchedClose {
                open: None,
                closed: Action::Delete
            }
        ));
    }

    #[rstest]
    fn blocks_before_a_parse_error_stay_applied(mut store: MemoryStore) {
        let document = change(&[
            CREATE_NODES,
            r#"<modify><node id="3" timestamp="yesterday" lat="1" lon="1"/></modify>"#,
        ]);
        let err = apply_change(&mut store, document.as_bytes(), ApplierConfig::default())
            .expect_err("bad timestamp");
        assert!(matches!(err, ApplyError::Parse(ParseError::Timestamp { .. })));
        assert!(store.node(1).expect("read").is_some());
        assert!(store.node(3).expect("read").is_none());
    }

    #[rstest]
    fn non_finite_coordinates_reject_the_block(mut store: MemoryStore) {
        let document = change(&[r#"<create>
  <node id="1" version="1" timestamp="2024-03-01T12:00:00Z" lat="51.5" lon="-0.1"/>
  <node id="2" version="1" timestamp="2024-03-01T12:00:00Z" lat="NaN" lon="inf"/>
</create>"#]);
        let err = apply_change(&mut store, document.as_bytes(), ApplierConfig::default())
            .expect_err("NaN latitude");
        assert!(matches!(
            err,
            ApplyError::Parse(ParseError::InvalidAttribute {
                attribute: "lat",
                ..
            })
        ));
        assert!(store.node(1).expect("read").is_none());
        assert!(store.node(2).expect("read").is_none());
    }

    #[rstest]
    fn non_finite_coordinates_never_reach_sqlite() {
        let mut store = quadosm_core::SqliteEntityStore::open_in_memory().expect("open store");
        let document = change(&[r#"<create>
  <node id="2" version="1" timestamp="2024-03-01T12:00:00Z" lat="12.0" lon="-inf"/>
</create>"#]);
        let err = apply_change(&mut store, document.as_bytes(), ApplierConfig::default())
            .expect_err("infinite longitude");
        assert!(matches!(
            err,
            ApplyError::Parse(ParseError::InvalidAttribute {
                attribute: "lon",
                ..
            })
        ));
        assert!(store.node(2).expect("read").is_none());
    }

    #[rstest]
    fn unresolved_way_and_relation_references_are_reported(mut store: MemoryStore) {
        apply(&mut store, &change(&[CREATE_NODES]), ApplierConfig::default());
        let batch = WriteBatch::new()
            .with(Way::new(100, vec![1, 2, 9]))
            .with(Relation::new(
                200,
                vec![
                    Member::new(ElementKind::Way, 100, "outer"),
                    Member::new(ElementKind::Node, 1, ""),
                    Member::new(ElementKind::Way, 404, "inner"),
                    Member::new(ElementKind::Relation, 405, ""),
                ],
            ));
        let applier = ChangesetApplier::new(&mut store, ApplierConfig::default());
        let missing = applier.missing_references(&batch).expect("lookup");
        assert_eq!(
            missing,
            vec![
                MissingReferences {
                    kind: ElementKind::Way,
                    id: 100,
                    missing: vec![(ElementKind::Node, 9)],
                },
                MissingReferences {
                    kind: ElementKind::Relation,
                    id: 200,
                    missing: vec![(ElementKind::Way, 404), (ElementKind::Relation, 405)],
                },
            ]
        );
    }

    #[rstest]
    fn fully_resolved_batches_report_nothing(mut store: MemoryStore) {
        let batch = WriteBatch::new()
            .with(Node::new(1, geo::Coord { x: 0.0, y: 0.0 }, Zoom::default()))
            .with(Relation::new(
                200,
                vec![Member::new(ElementKind::Node, 1, "")],
            ));
        let applier = ChangesetApplier::new(&mut store, ApplierConfig::default());
        assert!(applier.missing_references(&batch).expect("lookup").is_empty());
    }
}
