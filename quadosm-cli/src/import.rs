//! Import command implementation for the quadosm CLI.

use std::io::Write;

use camino::Utf8PathBuf;
use clap::Parser;
use log::info;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use quadosm_core::Zoom;
use quadosm_data::{DEFAULT_BATCH_SIZE, ImportConfig, ImportSummary, import_path};
use serde::{Deserialize, Serialize};

use crate::{ARG_DATABASE, ARG_ZOOM, CliError, database_path, fs, index_zoom, write_json};

pub(crate) const ARG_IMPORT_INPUT: &str = "input";
pub(crate) const ENV_IMPORT_INPUT: &str = "QUADOSM_CMDS_IMPORT_INPUT";

/// CLI arguments for the `import` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Load every node, way and relation of an OSM extract into \
                 the store. The format follows the file name: .osm/.xml, \
                 .osm.bz2 or .osm.pbf.",
    about = "Bulk load an OSM extract"
)]
#[ortho_config(prefix = "QUADOSM")]
pub(crate) struct ImportArgs {
    /// Extract to load.
    #[arg(value_name = "path")]
    #[serde(default)]
    pub(crate) input: Option<Utf8PathBuf>,
    /// SQLite database to write (default `quadosm.db`).
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
    /// Zoom level used to index nodes (default 17).
    #[arg(long = ARG_ZOOM, value_name = "level")]
    #[serde(default)]
    pub(crate) zoom: Option<u8>,
    /// Elements per store write (default 2000).
    #[arg(long, value_name = "count")]
    #[serde(default)]
    pub(crate) batch_size: Option<usize>,
}

impl ImportArgs {
    pub(crate) fn into_config(self) -> Result<ImportCommand, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        ImportCommand::try_from(merged)
    }
}

/// Resolved `import` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImportCommand {
    pub(crate) input: Utf8PathBuf,
    pub(crate) database: Utf8PathBuf,
    pub(crate) zoom: Zoom,
    pub(crate) batch_size: usize,
}

impl TryFrom<ImportArgs> for ImportCommand {
    type Error = CliError;

    fn try_from(args: ImportArgs) -> Result<Self, Self::Error> {
        let input = args.input.ok_or(CliError::MissingArgument {
            field: ARG_IMPORT_INPUT,
            env: ENV_IMPORT_INPUT,
        })?;
        Ok(Self {
            input,
            database: database_path(args.database),
            zoom: index_zoom(args.zoom)?,
            batch_size: args.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
        })
    }
}

#[derive(Debug, Serialize)]
struct ImportOutput<'a> {
    input: &'a str,
    database: &'a str,
    #[serde(flatten)]
    summary: ImportSummary,
}

pub(crate) fn run_import(args: ImportArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let command = args.into_config()?;
    execute_import(&command, writer)
}

pub(crate) fn execute_import(command: &ImportCommand, writer: &mut dyn Write) -> Result<(), CliError> {
    fs::require_file(&command.input, ARG_IMPORT_INPUT)?;
    let mut store = crate::open_store_for_writing(&command.database)?;
    let config = ImportConfig::default()
        .with_batch_size(command.batch_size)
        .with_zoom(command.zoom);
    let summary = import_path(&mut store, command.input.as_std_path(), config)?;
    info!(
        "imported {} into {}: {} nodes, {} ways, {} relations",
        command.input, command.database, summary.nodes, summary.ways, summary.relations
    );
    write_json(
        writer,
        &ImportOutput {
            input: command.input.as_str(),
            database: command.database.as_str(),
            summary,
        },
    )
}
