//! Get command implementation for the quadosm CLI.

use std::io::Write;

use camino::Utf8PathBuf;
use clap::Parser;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use quadosm_core::{ElementKind, EntityStore, Way, WayGeometry, resolve_way_geometry};
use serde::{Deserialize, Serialize};

use crate::{ARG_DATABASE, CliError, database_path, open_store_for_reading, write_json};

pub(crate) const ARG_GET_KIND: &str = "kind";
pub(crate) const ARG_GET_ID: &str = "id";
pub(crate) const ENV_GET_KIND: &str = "QUADOSM_CMDS_GET_KIND";
pub(crate) const ENV_GET_ID: &str = "QUADOSM_CMDS_GET_ID";

/// CLI arguments for the `get` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Print one node, way or relation, including soft-deleted \
                 records. Ways can be printed with their node locations \
                 resolved from the store.",
    about = "Print a single element"
)]
#[ortho_config(prefix = "QUADOSM")]
pub(crate) struct GetArgs {
    /// `node`, `way` or `relation`.
    #[arg(value_name = "kind")]
    #[serde(default)]
    pub(crate) kind: Option<String>,
    /// Element id.
    #[arg(value_name = "id", allow_hyphen_values = true)]
    #[serde(default)]
    pub(crate) id: Option<i64>,
    /// SQLite database to read (default `quadosm.db`).
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
    /// Resolve a way's node locations.
    #[arg(long)]
    #[serde(default)]
    pub(crate) geometry: bool,
}

/// Resolved `get` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GetCommand {
    pub(crate) kind: ElementKind,
    pub(crate) id: i64,
    pub(crate) database: Utf8PathBuf,
    pub(crate) geometry: bool,
}

impl TryFrom<GetArgs> for GetCommand {
    type Error = CliError;

    fn try_from(args: GetArgs) -> Result<Self, Self::Error> {
        let kind = args.kind.ok_or(CliError::MissingArgument {
            field: ARG_GET_KIND,
            env: ENV_GET_KIND,
        })?;
        let id = args.id.ok_or(CliError::MissingArgument {
            field: ARG_GET_ID,
            env: ENV_GET_ID,
        })?;
        Ok(Self {
            kind: kind.parse()?,
            id,
            database: database_path(args.database),
            geometry: args.geometry,
        })
    }
}

#[derive(Debug, Serialize)]
struct WayWithGeometry {
    #[serde(flatten)]
    way: Way,
    geometry: WayGeometry,
}

pub(crate) fn run_get(args: GetArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let merged = args.load_and_merge().map_err(CliError::Configuration)?;
    execute_get(&GetCommand::try_from(merged)?, writer)
}

pub(crate) fn execute_get(command: &GetCommand, writer: &mut dyn Write) -> Result<(), CliError> {
    let store = open_store_for_reading(&command.database)?;
    let not_found = || CliError::ElementNotFound {
        kind: command.kind,
        id: command.id,
    };
    match command.kind {
        ElementKind::Node => {
            let node = store.node(command.id)?.ok_or_else(not_found)?;
            write_json(writer, &node)
        }
        ElementKind::Way => {
            let way = store.way(command.id)?.ok_or_else(not_found)?;
            if command.geometry {
                let geometry = resolve_way_geometry(&store, &way)?;
                write_json(writer, &WayWithGeometry { way, geometry })
            } else {
                write_json(writer, &way)
            }
        }
        ElementKind::Relation => {
            let relation = store.relation(command.id)?.ok_or_else(not_found)?;
            write_json(writer, &relation)
        }
    }
}
