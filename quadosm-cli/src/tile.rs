//! Tile command implementation for the quadosm CLI.

use std::io::Write;

use camino::Utf8PathBuf;
use clap::Parser;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use quadosm_core::get_tile;
use serde::{Deserialize, Serialize};

use crate::{ARG_DATABASE, CliError, database_path, open_store_for_reading, write_json};

pub(crate) const ARG_TILE_ZOOM: &str = "tile-zoom";
pub(crate) const ARG_TILE_X: &str = "x";
pub(crate) const ARG_TILE_Y: &str = "y";
pub(crate) const ENV_TILE_ZOOM: &str = "QUADOSM_CMDS_TILE_TILE_ZOOM";
pub(crate) const ENV_TILE_X: &str = "QUADOSM_CMDS_TILE_X";
pub(crate) const ENV_TILE_Y: &str = "QUADOSM_CMDS_TILE_Y";

/// CLI arguments for the `tile` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Print the nodes, ways and relations of one tile, addressed \
                 in XYZ coordinates with rows counted from the north.",
    about = "Print the contents of an XYZ tile"
)]
#[ortho_config(prefix = "QUADOSM")]
pub(crate) struct TileArgs {
    /// Zoom level of the tile.
    #[arg(value_name = "zoom")]
    #[serde(default)]
    pub(crate) tile_zoom: Option<u8>,
    /// Tile column.
    #[arg(value_name = "x")]
    #[serde(default)]
    pub(crate) x: Option<u32>,
    /// Tile row, counted from the north.
    #[arg(value_name = "y")]
    #[serde(default)]
    pub(crate) y: Option<u32>,
    /// SQLite database to read (default `quadosm.db`).
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
}

/// Resolved `tile` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TileCommand {
    pub(crate) zoom: u8,
    pub(crate) x: u32,
    pub(crate) y: u32,
    pub(crate) database: Utf8PathBuf,
}

impl TryFrom<TileArgs> for TileCommand {
    type Error = CliError;

    fn try_from(args: TileArgs) -> Result<Self, Self::Error> {
        let zoom = args.tile_zoom.ok_or(CliError::MissingArgument {
            field: ARG_TILE_ZOOM,
            env: ENV_TILE_ZOOM,
        })?;
        let x = args.x.ok_or(CliError::MissingArgument {
            field: ARG_TILE_X,
            env: ENV_TILE_X,
        })?;
        let y = args.y.ok_or(CliError::MissingArgument {
            field: ARG_TILE_Y,
            env: ENV_TILE_Y,
        })?;
        Ok(Self {
            zoom,
            x,
            y,
            database: database_path(args.database),
        })
    }
}

pub(crate) fn run_tile(args: TileArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let merged = args.load_and_merge().map_err(CliError::Configuration)?;
    execute_tile(&TileCommand::try_from(merged)?, writer)
}

pub(crate) fn execute_tile(command: &TileCommand, writer: &mut dyn Write) -> Result<(), CliError> {
    let store = open_store_for_reading(&command.database)?;
    let tile = get_tile(&store, command.zoom, command.x, command.y)?;
    write_json(writer, &tile)
}
