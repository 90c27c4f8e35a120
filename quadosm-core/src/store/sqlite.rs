//! SQLite-backed [`EntityStore`].
//!
//! Elements live in one table per kind with their tags (and node lists or
//! member lists) encoded as JSON. The reverse indexes are plain tables kept
//! in step inside the same transaction as the element rows.

use std::{
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
};

use chrono::DateTime;
use geo::{Coord, Rect};
use rusqlite::{
    Connection, OpenFlags, OptionalExtension, Params, Row, Statement, params, params_from_iter,
};
use serde::{Serialize, de::DeserializeOwned};

use super::{
    EntityStore, ReplicationState, ReplicationStateStore, StoreError, WriteBatch, schema,
};
use crate::{
    entity::{Element, ElementId, ElementKind, Member, Metadata, Node, Relation, Tags, Way},
    tiling::QuadKey,
};

/// SQLite limits bound parameters per statement to 999 by default. The store
/// chunks `IN` queries to remain below that ceiling.
const SQLITE_MAX_VARIABLE_NUMBER: usize = 999;

const NODE_SELECT: &str = "SELECT id, lat, lon, quadkey, timestamp, user, uid, version, \
     changeset, visible, tags FROM nodes";

const WAY_SELECT: &str = "SELECT w.id, w.timestamp, w.user, w.uid, w.version, w.changeset, \
     w.visible, w.tags, w.node_refs, \
     (SELECT group_concat(t.quadkey, ',') FROM way_tiles t WHERE t.way_id = w.id) \
     FROM ways w";

const RELATION_SELECT: &str = "SELECT id, timestamp, user, uid, version, changeset, visible, \
     tags, members FROM relations";

/// Persistent store backed by a single SQLite database.
pub struct SqliteEntityStore {
    connection: Connection,
    path: Option<PathBuf>,
}

impl fmt::Debug for SqliteEntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteEntityStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteEntityStore {
    /// Open or create a store at `path`, creating missing tables.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let connection = Connection::open(path).map_err(|source| StoreError::OpenDatabase {
            path: path.to_path_buf(),
            source,
        })?;
        schema::initialise(&connection)?;
        Ok(Self {
            connection,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an existing store without write access.
    ///
    /// Any write through the returned handle fails with a database error.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let connection = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|source| StoreError::OpenDatabase {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            connection,
            path: Some(path.to_path_buf()),
        })
    }

    /// Create a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let connection =
            Connection::open_in_memory().map_err(|source| StoreError::OpenDatabase {
                path: PathBuf::from(":memory:"),
                source,
            })?;
        schema::initialise(&connection)?;
        Ok(Self {
            connection,
            path: None,
        })
    }

    /// Location of the database file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn encode_json<T: Serialize>(
    kind: ElementKind,
    id: ElementId,
    field: &'static str,
    value: &T,
) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Encode {
        kind,
        id,
        field,
        source,
    })
}

fn decode_json<T: DeserializeOwned>(
    kind: ElementKind,
    id: ElementId,
    field: &'static str,
    raw: &str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|source| StoreError::Decode {
        kind,
        id,
        field,
        source,
    })
}

fn corrupt(kind: ElementKind, id: ElementId, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        kind,
        id,
        reason: reason.into(),
    }
}

fn write_node(connection: &Connection, node: &Node) -> Result<(), StoreError> {
    let tags = encode_json(ElementKind::Node, node.id, "tags", &node.tags)?;
    let meta = &node.meta;
    connection
        .prepare_cached(
            "INSERT OR REPLACE INTO nodes \
             (id, lat, lon, quadkey, timestamp, user, uid, version, changeset, visible, tags) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?
        .execute(params![
            node.id,
            node.lat(),
            node.lon(),
            node.quadkey.as_ref().map(QuadKey::as_str),
            meta.timestamp.timestamp(),
            meta.user,
            meta.uid,
            meta.version,
            meta.changeset,
            meta.visible,
            tags,
        ])?;
    refresh_ways_of(connection, node.id)
}

fn write_way(connection: &Connection, way: &Way) -> Result<(), StoreError> {
    let tags = encode_json(ElementKind::Way, way.id, "tags", &way.tags)?;
    let node_refs = encode_json(ElementKind::Way, way.id, "node_refs", &way.node_refs)?;
    let meta = &way.meta;
    connection
        .prepare_cached(
            "INSERT OR REPLACE INTO ways \
             (id, timestamp, user, uid, version, changeset, visible, tags, node_refs) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?
        .execute(params![
            way.id,
            meta.timestamp.timestamp(),
            meta.user,
            meta.uid,
            meta.version,
            meta.changeset,
            meta.visible,
            tags,
            node_refs,
        ])?;

    connection
        .prepare_cached("DELETE FROM way_nodes WHERE way_id = ?1")?
        .execute([way.id])?;
    let mut insert = connection
        .prepare_cached("INSERT OR IGNORE INTO way_nodes (node_id, way_id) VALUES (?1, ?2)")?;
    for node_id in way.distinct_node_refs() {
        insert.execute([node_id, way.id])?;
    }
    refresh_way_tiles(connection, way.id)
}

fn write_relation(connection: &Connection, relation: &Relation) -> Result<(), StoreError> {
    let tags = encode_json(ElementKind::Relation, relation.id, "tags", &relation.tags)?;
    let members = encode_json(
        ElementKind::Relation,
        relation.id,
        "members",
        &relation.members,
    )?;
    let meta = &relation.meta;
    connection
        .prepare_cached(
            "INSERT OR REPLACE INTO relations \
             (id, timestamp, user, uid, version, changeset, visible, tags, members) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?
        .execute(params![
            relation.id,
            meta.timestamp.timestamp(),
            meta.user,
            meta.uid,
            meta.version,
            meta.changeset,
            meta.visible,
            tags,
            members,
        ])?;

    connection
        .prepare_cached("DELETE FROM relation_members WHERE relation_id = ?1")?
        .execute([relation.id])?;
    let mut insert = connection.prepare_cached(
        "INSERT OR IGNORE INTO relation_members (member_kind, member_id, relation_id) \
         VALUES (?1, ?2, ?3)",
    )?;
    for (kind, member_id) in relation.distinct_members() {
        insert.execute(params![kind.as_str(), member_id, relation.id])?;
    }
    Ok(())
}

fn remove_element(
    connection: &Connection,
    kind: ElementKind,
    id: ElementId,
) -> Result<(), StoreError> {
    match kind {
        ElementKind::Node => {
            connection
                .prepare_cached("DELETE FROM nodes WHERE id = ?1")?
                .execute([id])?;
            refresh_ways_of(connection, id)
        }
        ElementKind::Way => {
            for sql in [
                "DELETE FROM ways WHERE id = ?1",
                "DELETE FROM way_nodes WHERE way_id = ?1",
                "DELETE FROM way_tiles WHERE way_id = ?1",
            ] {
                connection.prepare_cached(sql)?.execute([id])?;
            }
            Ok(())
        }
        ElementKind::Relation => {
            for sql in [
                "DELETE FROM relations WHERE id = ?1",
                "DELETE FROM relation_members WHERE relation_id = ?1",
            ] {
                connection.prepare_cached(sql)?.execute([id])?;
            }
            Ok(())
        }
    }
}

fn refresh_ways_of(connection: &Connection, node_id: ElementId) -> Result<(), StoreError> {
    for way_id in select_ids(
        connection,
        "SELECT way_id FROM way_nodes WHERE node_id = ?1",
        [node_id],
    )? {
        refresh_way_tiles(connection, way_id)?;
    }
    Ok(())
}

fn refresh_way_tiles(connection: &Connection, way_id: ElementId) -> Result<(), StoreError> {
    connection
        .prepare_cached("DELETE FROM way_tiles WHERE way_id = ?1")?
        .execute([way_id])?;
    connection
        .prepare_cached(
            "INSERT OR IGNORE INTO way_tiles (quadkey, way_id) \
             SELECT DISTINCT n.quadkey, wn.way_id FROM way_nodes wn \
             JOIN nodes n ON n.id = wn.node_id \
             WHERE wn.way_id = ?1 AND n.quadkey IS NOT NULL",
        )?
        .execute([way_id])?;
    Ok(())
}

fn select_ids<P: Params>(
    connection: &Connection,
    sql: &str,
    params: P,
) -> Result<BTreeSet<ElementId>, StoreError> {
    let mut statement = connection.prepare_cached(sql)?;
    let mut rows = statement.query(params)?;
    let mut ids = BTreeSet::new();
    while let Some(row) = rows.next()? {
        ids.insert(row.get(0)?);
    }
    Ok(ids)
}

type Decoder<T> = fn(&Row<'_>) -> Result<T, StoreError>;

fn collect_rows<T, P: Params>(
    statement: &mut Statement<'_>,
    params: P,
    decode: Decoder<T>,
) -> Result<Vec<T>, StoreError> {
    let mut rows = statement.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(decode(row)?);
    }
    Ok(out)
}

fn select_by_ids<T>(
    connection: &Connection,
    select: &str,
    id_column: &str,
    ids: &[ElementId],
    decode: Decoder<T>,
    id_of: fn(&T) -> ElementId,
) -> Result<Vec<T>, StoreError> {
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let mut found = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(SQLITE_MAX_VARIABLE_NUMBER) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let query = format!("{select} WHERE {id_column} IN ({placeholders})");
        let mut statement = connection.prepare(&query)?;
        found.extend(collect_rows(
            &mut statement,
            params_from_iter(chunk.iter()),
            decode,
        )?);
    }
    found.sort_unstable_by_key(id_of);
    Ok(found)
}

fn decode_meta(
    row: &Row<'_>,
    kind: ElementKind,
    id: ElementId,
    first: usize,
) -> Result<Metadata, StoreError> {
    let seconds: i64 = row.get(first)?;
    let timestamp = DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| corrupt(kind, id, format!("timestamp {seconds} is out of range")))?;
    Ok(Metadata {
        timestamp,
        user: row.get(first + 1)?,
        uid: row.get(first + 2)?,
        version: row.get(first + 3)?,
        changeset: row.get(first + 4)?,
        visible: row.get(first + 5)?,
    })
}

fn decode_node(row: &Row<'_>) -> Result<Node, StoreError> {
    let id: ElementId = row.get(0)?;
    let lat: f64 = row.get(1)?;
    let lon: f64 = row.get(2)?;
    let quadkey = row
        .get::<_, Option<String>>(3)?
        .map(|key| QuadKey::parse(&key))
        .transpose()
        .map_err(|err| corrupt(ElementKind::Node, id, err.to_string()))?;
    let meta = decode_meta(row, ElementKind::Node, id, 4)?;
    let tags: String = row.get(10)?;
    Ok(Node {
        id,
        meta,
        tags: decode_json::<Tags>(ElementKind::Node, id, "tags", &tags)?,
        location: Coord { x: lon, y: lat },
        quadkey,
    })
}

fn decode_way(row: &Row<'_>) -> Result<Way, StoreError> {
    let id: ElementId = row.get(0)?;
    let meta = decode_meta(row, ElementKind::Way, id, 1)?;
    let tags: String = row.get(7)?;
    let node_refs: String = row.get(8)?;
    let tiles = row
        .get::<_, Option<String>>(9)?
        .unwrap_or_default()
        .split(',')
        .filter(|key| !key.is_empty())
        .map(QuadKey::parse)
        .collect::<Result<BTreeSet<_>, _>>()
        .map_err(|err| corrupt(ElementKind::Way, id, err.to_string()))?;
    Ok(Way {
        id,
        meta,
        tags: decode_json(ElementKind::Way, id, "tags", &tags)?,
        node_refs: decode_json(ElementKind::Way, id, "node_refs", &node_refs)?,
        tiles,
    })
}

fn decode_relation(row: &Row<'_>) -> Result<Relation, StoreError> {
    let id: ElementId = row.get(0)?;
    let meta = decode_meta(row, ElementKind::Relation, id, 1)?;
    let tags: String = row.get(7)?;
    let members: String = row.get(8)?;
    Ok(Relation {
        id,
        meta,
        tags: decode_json(ElementKind::Relation, id, "tags", &tags)?,
        members: decode_json::<Vec<Member>>(ElementKind::Relation, id, "members", &members)?,
    })
}

impl SqliteEntityStore {
    fn query<T, P: Params>(
        &self,
        sql: &str,
        params: P,
        decode: Decoder<T>,
    ) -> Result<Vec<T>, StoreError> {
        let mut statement = self.connection.prepare_cached(sql)?;
        collect_rows(&mut statement, params, decode)
    }
}

impl EntityStore for SqliteEntityStore {
    fn write_batch(&mut self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let tx = self.connection.transaction()?;
        for node in &batch.nodes {
            write_node(&tx, node)?;
        }
        for way in &batch.ways {
            write_way(&tx, way)?;
        }
        for relation in &batch.relations {
            write_relation(&tx, relation)?;
        }
        for (kind, id) in &batch.removals {
            remove_element(&tx, *kind, *id)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn node(&self, id: ElementId) -> Result<Option<Node>, StoreError> {
        Ok(self
            .query(&format!("{NODE_SELECT} WHERE id = ?1"), [id], decode_node)?
            .into_iter()
            .next())
    }

    fn way(&self, id: ElementId) -> Result<Option<Way>, StoreError> {
        Ok(self
            .query(&format!("{WAY_SELECT} WHERE w.id = ?1"), [id], decode_way)?
            .into_iter()
            .next())
    }

    fn relation(&self, id: ElementId) -> Result<Option<Relation>, StoreError> {
        Ok(self
            .query(
                &format!("{RELATION_SELECT} WHERE id = ?1"),
                [id],
                decode_relation,
            )?
            .into_iter()
            .next())
    }

    fn nodes_by_ids(&self, ids: &[ElementId]) -> Result<Vec<Node>, StoreError> {
        select_by_ids(&self.connection, NODE_SELECT, "id", ids, decode_node, |n| n.id)
    }

    fn ways_by_ids(&self, ids: &[ElementId]) -> Result<Vec<Way>, StoreError> {
        select_by_ids(&self.connection, WAY_SELECT, "w.id", ids, decode_way, |w| w.id)
    }

    fn relations_by_ids(&self, ids: &[ElementId]) -> Result<Vec<Relation>, StoreError> {
        select_by_ids(
            &self.connection,
            RELATION_SELECT,
            "id",
            ids,
            decode_relation,
            |r| r.id,
        )
    }

    fn nodes_by_tile_prefix(&self, prefix: &QuadKey) -> Result<Vec<Node>, StoreError> {
        let (start, end) = prefix.prefix_range();
        let mut nodes = self.query(
            &format!("{NODE_SELECT} WHERE quadkey >= ?1 AND quadkey < ?2"),
            [start, end],
            decode_node,
        )?;
        let bounds = prefix.to_tile().bounds();
        nodes.extend(self.query(
            &format!(
                "{NODE_SELECT} WHERE quadkey IS NULL \
                 AND lat BETWEEN ?1 AND ?2 AND lon BETWEEN ?3 AND ?4"
            ),
            [bounds.min_lat, bounds.max_lat, bounds.min_lon, bounds.max_lon],
            decode_node,
        )?);
        nodes.sort_unstable_by_key(|node| node.id);
        nodes.dedup_by_key(|node| node.id);
        Ok(nodes)
    }

    fn ways_by_tile_prefix(&self, prefix: &QuadKey) -> Result<Vec<Way>, StoreError> {
        let (start, end) = prefix.prefix_range();
        self.query(
            &format!(
                "{WAY_SELECT} WHERE w.id IN \
                 (SELECT way_id FROM way_tiles WHERE quadkey >= ?1 AND quadkey < ?2) \
                 ORDER BY w.id"
            ),
            [start, end],
            decode_way,
        )
    }

    fn nodes_in_rect(&self, rect: &Rect<f64>) -> Result<Vec<Node>, StoreError> {
        self.query(
            &format!(
                "{NODE_SELECT} WHERE lat BETWEEN ?1 AND ?2 AND lon BETWEEN ?3 AND ?4 \
                 ORDER BY id"
            ),
            [rect.min().y, rect.max().y, rect.min().x, rect.max().x],
            decode_node,
        )
    }

    fn scan(&self, kind: ElementKind) -> Result<Vec<Element>, StoreError> {
        Ok(match kind {
            ElementKind::Node => self
                .query(&format!("{NODE_SELECT} ORDER BY id"), params![], decode_node)?
                .into_iter()
                .map(Element::Node)
                .collect(),
            ElementKind::Way => self
                .query(&format!("{WAY_SELECT} ORDER BY w.id"), params![], decode_way)?
                .into_iter()
                .map(Element::Way)
                .collect(),
            ElementKind::Relation => self
                .query(
                    &format!("{RELATION_SELECT} ORDER BY id"),
                    params![],
                    decode_relation,
                )?
                .into_iter()
                .map(Element::Relation)
                .collect(),
        })
    }

    fn ways_referencing(&self, node_id: ElementId) -> Result<BTreeSet<ElementId>, StoreError> {
        select_ids(
            &self.connection,
            "SELECT way_id FROM way_nodes WHERE node_id = ?1",
            [node_id],
        )
    }

    fn relations_referencing(
        &self,
        kind: ElementKind,
        id: ElementId,
    ) -> Result<BTreeSet<ElementId>, StoreError> {
        select_ids(
            &self.connection,
            "SELECT relation_id FROM relation_members WHERE member_kind = ?1 AND member_id = ?2",
            params![kind.as_str(), id],
        )
    }
}

impl ReplicationStateStore for SqliteEntityStore {
    fn replication_state(&self) -> Result<Option<ReplicationState>, StoreError> {
        let row: Option<(i64, Option<i64>)> = self
            .connection
            .query_row(
                "SELECT sequence, updated_at FROM replication_state WHERE id = 1",
                params![],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((sequence, updated_at)) = row else {
            return Ok(None);
        };
        let sequence = u64::try_from(sequence).map_err(|_| StoreError::InvalidReplicationState {
            reason: format!("negative sequence {sequence}"),
        })?;
        let updated_at = updated_at
            .map(|seconds| {
                DateTime::from_timestamp(seconds, 0).ok_or_else(|| {
                    StoreError::InvalidReplicationState {
                        reason: format!("timestamp {seconds} is out of range"),
                    }
                })
            })
            .transpose()?;
        Ok(Some(ReplicationState {
            sequence,
            updated_at,
        }))
    }

    fn save_replication_state(&mut self, state: ReplicationState) -> Result<(), StoreError> {
        let sequence =
            i64::try_from(state.sequence).map_err(|_| StoreError::InvalidReplicationState {
                reason: format!("sequence {} does not fit the database", state.sequence),
            })?;
        self.connection
            .prepare_cached(
                "INSERT OR REPLACE INTO replication_state (id, sequence, updated_at) \
                 VALUES (1, ?1, ?2)",
            )?
            .execute(params![
                sequence,
                state.updated_at.map(|at| at.timestamp())
            ])?;
        Ok(())
    }
}
