//! Command-line interface for the quadosm map-data store.
#![forbid(unsafe_code)]

use std::{
    io::{self, Write},
    str::FromStr,
};

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use quadosm_core::{SqliteEntityStore, Zoom};
use serde::Serialize;
use structured_logger::{Builder, json::new_writer};

mod apply;
mod error;
mod fs;
mod get;
mod import;
mod query;
mod replicate;
mod tile;

pub use error::CliError;

use apply::ApplyArgs;
use get::GetArgs;
use import::ImportArgs;
use query::QueryArgs;
use replicate::ReplicateArgs;
use tile::TileArgs;

const ARG_DATABASE: &str = "database";
const ARG_ZOOM: &str = "zoom";
const DEFAULT_DATABASE: &str = "quadosm.db";
const DEFAULT_LOG_LEVEL: &str = "info";
const ENV_LOG_LEVEL: &str = "QUADOSM_LOG_LEVEL";

/// Run the quadosm CLI with the current process arguments and environment.
pub fn run() -> Result<(), CliError> {
    let cli = Cli::try_parse().map_err(CliError::ArgumentParsing)?;
    init_logging(cli.log_level.as_deref())?;
    let mut stdout = io::stdout().lock();
    run_command(cli.command, &mut stdout)
}

fn run_command(command: Command, writer: &mut dyn Write) -> Result<(), CliError> {
    match command {
        Command::Import(args) => import::run_import(args, writer),
        Command::Apply(args) => apply::run_apply(args, writer),
        Command::Replicate(args) => replicate::run_replicate(args, writer),
        Command::Tile(args) => tile::run_tile(args, writer),
        Command::Query(args) => query::run_query(args, writer),
        Command::Get(args) => get::run_get(args, writer),
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "quadosm",
    about = "Load, replicate and query OpenStreetMap data in a tiled store",
    version
)]
struct Cli {
    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true, value_name = "level")]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bulk load an OSM XML, XML.bz2 or PBF extract.
    Import(ImportArgs),
    /// Apply an osmChange file.
    Apply(ApplyArgs),
    /// Follow a replication feed.
    Replicate(ReplicateArgs),
    /// Print the contents of an XYZ tile.
    Tile(TileArgs),
    /// Run a filtered element query.
    Query(QueryArgs),
    /// Print a single element.
    Get(GetArgs),
}

/// Install JSON-lines logging on stderr.
///
/// The flag wins over `QUADOSM_LOG_LEVEL`, which wins over `info`.
fn init_logging(flag: Option<&str>) -> Result<(), CliError> {
    let env = std::env::var(ENV_LOG_LEVEL).ok();
    let level = resolve_log_level(flag, env.as_deref())?;
    Builder::with_level(level)
        .with_target_writer("*", new_writer(io::stderr()))
        .init();
    Ok(())
}

fn resolve_log_level<'a>(flag: Option<&'a str>, env: Option<&'a str>) -> Result<&'a str, CliError> {
    let level = flag.or(env).unwrap_or(DEFAULT_LOG_LEVEL);
    log::LevelFilter::from_str(level).map_err(|_| CliError::InvalidLogLevel {
        value: level.to_owned(),
    })?;
    Ok(level)
}

/// Database path, defaulting to `quadosm.db` in the working directory.
fn database_path(database: Option<Utf8PathBuf>) -> Utf8PathBuf {
    database.unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_DATABASE))
}

/// Index zoom, defaulting to 17.
fn index_zoom(zoom: Option<u8>) -> Result<Zoom, CliError> {
    match zoom {
        Some(level) => Zoom::new(level).map_err(CliError::InvalidZoom),
        None => Ok(Zoom::default()),
    }
}

/// Open (creating if needed) the store that a write command updates.
fn open_store_for_writing(path: &Utf8Path) -> Result<SqliteEntityStore, CliError> {
    fs::ensure_parent_dir(path).map_err(|source| CliError::PrepareDatabase {
        path: path.to_path_buf(),
        source,
    })?;
    SqliteEntityStore::open(path.as_std_path()).map_err(|source| CliError::OpenStore {
        path: path.to_path_buf(),
        source,
    })
}

/// Open an existing store without write access.
fn open_store_for_reading(path: &Utf8Path) -> Result<SqliteEntityStore, CliError> {
    fs::require_file(path, ARG_DATABASE)?;
    SqliteEntityStore::open_read_only(path.as_std_path()).map_err(|source| CliError::OpenStore {
        path: path.to_path_buf(),
        source,
    })
}

/// Print `value` as pretty JSON followed by a newline.
fn write_json<T: Serialize + ?Sized>(writer: &mut dyn Write, value: &T) -> Result<(), CliError> {
    let payload = serde_json::to_string_pretty(value).map_err(CliError::SerialiseOutput)?;
    writer
        .write_all(payload.as_bytes())
        .map_err(CliError::WriteOutput)?;
    writer.write_all(b"\n").map_err(CliError::WriteOutput)?;
    Ok(())
}

#[cfg(test)]
mod tests;
