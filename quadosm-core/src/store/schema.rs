//! SQLite schema for [`super::SqliteEntityStore`].

use rusqlite::Connection;

use super::StoreError;

/// Incremented whenever the table layout changes.
pub(super) const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nodes (
    id INTEGER PRIMARY KEY,
    lat REAL NOT NULL,
    lon REAL NOT NULL,
    quadkey TEXT,
    timestamp INTEGER NOT NULL,
    user TEXT,
    uid INTEGER,
    version INTEGER,
    changeset INTEGER,
    visible INTEGER NOT NULL,
    tags TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS nodes_by_quadkey ON nodes (quadkey);
CREATE INDEX IF NOT EXISTS nodes_by_position ON nodes (lat, lon);

CREATE TABLE IF NOT EXISTS ways (
    id INTEGER PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    user TEXT,
    uid INTEGER,
    version INTEGER,
    changeset INTEGER,
    visible INTEGER NOT NULL,
    tags TEXT NOT NULL,
    node_refs TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS relations (
    id INTEGER PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    user TEXT,
    uid INTEGER,
    version INTEGER,
    changeset INTEGER,
    visible INTEGER NOT NULL,
    tags TEXT NOT NULL,
    members TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS way_nodes (
    node_id INTEGER NOT NULL,
    way_id INTEGER NOT NULL,
    PRIMARY KEY (node_id, way_id)
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS way_nodes_by_way ON way_nodes (way_id);

CREATE TABLE IF NOT EXISTS way_tiles (
    quadkey TEXT NOT NULL,
    way_id INTEGER NOT NULL,
    PRIMARY KEY (quadkey, way_id)
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS way_tiles_by_way ON way_tiles (way_id);

CREATE TABLE IF NOT EXISTS relation_members (
    member_kind TEXT NOT NULL,
    member_id INTEGER NOT NULL,
    relation_id INTEGER NOT NULL,
    PRIMARY KEY (member_kind, member_id, relation_id)
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS relation_members_by_relation ON relation_members (relation_id);

CREATE TABLE IF NOT EXISTS replication_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    sequence INTEGER NOT NULL,
    updated_at INTEGER
);
";

/// Create any missing tables and record the schema version.
pub(super) fn initialise(connection: &Connection) -> Result<(), StoreError> {
    let version: i64 = connection
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|source| StoreError::Schema { source })?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchema {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    connection
        .execute_batch(SCHEMA)
        .map_err(|source| StoreError::Schema { source })?;
    connection
        .pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(|source| StoreError::Schema { source })?;
    Ok(())
}
