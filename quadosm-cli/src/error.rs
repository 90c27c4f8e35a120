//! Error types emitted by the quadosm CLI.
//!
//! Keep this error type reasonably small, as many CLI helpers return
//! `Result<_, CliError>`.

use std::sync::Arc;

use camino::Utf8PathBuf;
use quadosm_core::{ElementKind, QueryError, StoreError, TileError, UnknownElementKind};
use quadosm_data::{ApplyError, ImportError, ReplicationError, TransportError};
use thiserror::Error;

/// Errors emitted by the quadosm CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Provided arguments failed Clap validation.
    #[error(transparent)]
    ArgumentParsing(#[from] clap::Error),
    /// Configuration layering failed (files, env, CLI).
    #[error("failed to load configuration: {0}")]
    Configuration(#[from] Arc<ortho_config::OrthoError>),
    /// A required option is missing after configuration merging.
    #[error("missing {field} (set --{field} or {env})")]
    MissingArgument {
        field: &'static str,
        env: &'static str,
    },
    /// Two options that exclude each other were both given.
    #[error("--{first} and --{second} cannot be combined")]
    ConflictingArguments {
        first: &'static str,
        second: &'static str,
    },
    /// A referenced input path does not exist on disk.
    #[error("{field} path {path:?} does not exist")]
    MissingSourceFile {
        field: &'static str,
        path: Utf8PathBuf,
    },
    /// A referenced input path exists but is not a file.
    #[error("{field} path {path:?} exists but is not a file")]
    SourcePathNotFile {
        field: &'static str,
        path: Utf8PathBuf,
    },
    /// A referenced input path could not be inspected due to an IO error.
    #[error("failed to inspect {field} path {path:?}: {source}")]
    InspectSourcePath {
        field: &'static str,
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The zoom level is outside the tile pyramid.
    #[error("invalid zoom: {0}")]
    InvalidZoom(#[source] TileError),
    /// An element kind argument was not `node`, `way` or `relation`.
    #[error(transparent)]
    InvalidKind(#[from] UnknownElementKind),
    /// A `--bbox` argument was not four comma-separated numbers.
    #[error("invalid bounding box {value:?}: expected min_lat,min_lon,max_lat,max_lon")]
    InvalidBoundingBox { value: String },
    /// A `--polygon` argument was not a list of `lat,lon` pairs.
    #[error("invalid polygon {value:?}: expected lat,lon;lat,lon;...")]
    InvalidPolygon { value: String },
    /// A `--tag` argument was empty.
    #[error("invalid tag filter {value:?}: expected key or key=value")]
    InvalidTagFilter { value: String },
    /// The log level could not be parsed.
    #[error("invalid log level {value:?}")]
    InvalidLogLevel { value: String },
    /// Creating the database's parent directory failed.
    #[error("failed to prepare database directory for {path:?}: {source}")]
    PrepareDatabase {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Opening the entity store failed.
    #[error("failed to open database {path:?}: {source}")]
    OpenStore {
        path: Utf8PathBuf,
        #[source]
        source: StoreError,
    },
    /// Reading from the entity store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Opening an input file failed.
    #[error("failed to open {path:?}: {source}")]
    OpenInput {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Bulk import failed.
    #[error(transparent)]
    Import(#[from] ImportError),
    /// Applying a change file failed.
    #[error("failed to apply {path:?}: {source}")]
    Apply {
        path: Utf8PathBuf,
        #[source]
        source: ApplyError,
    },
    /// Building the replication source failed.
    #[error("failed to open replication source: {0}")]
    ReplicationSource(#[source] TransportError),
    /// Replication failed.
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    /// The async runtime could not be started.
    #[error("failed to start the async runtime: {0}")]
    Runtime(#[source] std::io::Error),
    /// A query could not be built or executed.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// The requested element is not stored.
    #[error("{kind} {id} not found")]
    ElementNotFound { kind: ElementKind, id: i64 },
    /// Serialising command output failed.
    #[error("failed to serialise output: {0}")]
    SerialiseOutput(#[source] serde_json::Error),
    /// Writing command output failed.
    #[error("failed to write output: {0}")]
    WriteOutput(#[source] std::io::Error),
}
