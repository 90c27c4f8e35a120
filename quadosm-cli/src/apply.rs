//! Apply command implementation for the quadosm CLI.

use std::io::{BufRead, BufReader, Write};

use bzip2::read::MultiBzDecoder;
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, ValueEnum};
use flate2::read::MultiGzDecoder;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use quadosm_data::{ApplierConfig, ApplySummary, DeleteMode, PendingBlockPolicy, apply_change};
use serde::{Deserialize, Serialize};

use crate::{ARG_DATABASE, ARG_ZOOM, CliError, database_path, fs, index_zoom, write_json};

pub(crate) const ARG_APPLY_CHANGE: &str = "change";
pub(crate) const ENV_APPLY_CHANGE: &str = "QUADOSM_CMDS_APPLY_CHANGE";

/// How `<delete>` blocks are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum DeleteModeArg {
    /// Keep the record, marked deleted.
    #[default]
    Soft,
    /// Remove the record and its index entries.
    Hard,
}

impl From<DeleteModeArg> for DeleteMode {
    fn from(arg: DeleteModeArg) -> Self {
        match arg {
            DeleteModeArg::Soft => Self::Soft,
            DeleteModeArg::Hard => Self::Hard,
        }
    }
}

/// Applier settings shared by `apply` and `replicate`.
pub(crate) fn applier_config(
    zoom: Option<u8>,
    delete_mode: Option<DeleteModeArg>,
    flush_pending: bool,
) -> Result<ApplierConfig, CliError> {
    let pending = if flush_pending {
        PendingBlockPolicy::Flush
    } else {
        PendingBlockPolicy::Discard
    };
    Ok(ApplierConfig::default()
        .with_zoom(index_zoom(zoom)?)
        .with_delete_mode(delete_mode.unwrap_or_default().into())
        .with_pending_block(pending))
}

/// CLI arguments for the `apply` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Apply the create, modify and delete blocks of an osmChange \
                 file in document order. Files ending in .gz or .bz2 are \
                 decompressed on the fly.",
    about = "Apply an osmChange file"
)]
#[ortho_config(prefix = "QUADOSM")]
pub(crate) struct ApplyArgs {
    /// osmChange file to apply.
    #[arg(value_name = "path")]
    #[serde(default)]
    pub(crate) change: Option<Utf8PathBuf>,
    /// SQLite database to update (default `quadosm.db`).
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
    /// Zoom level used to index nodes (default 17).
    #[arg(long = ARG_ZOOM, value_name = "level")]
    #[serde(default)]
    pub(crate) zoom: Option<u8>,
    /// How deletions are written (default soft).
    #[arg(long, value_enum, value_name = "mode")]
    #[serde(default)]
    pub(crate) delete_mode: Option<DeleteModeArg>,
    /// Write an unterminated trailing block instead of discarding it.
    #[arg(long)]
    #[serde(default)]
    pub(crate) flush_pending: bool,
}

impl ApplyArgs {
    pub(crate) fn into_config(self) -> Result<ApplyCommand, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        ApplyCommand::try_from(merged)
    }
}

/// Resolved `apply` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ApplyCommand {
    pub(crate) change: Utf8PathBuf,
    pub(crate) database: Utf8PathBuf,
    pub(crate) applier: ApplierConfig,
}

impl TryFrom<ApplyArgs> for ApplyCommand {
    type Error = CliError;

    fn try_from(args: ApplyArgs) -> Result<Self, Self::Error> {
        let change = args.change.ok_or(CliError::MissingArgument {
            field: ARG_APPLY_CHANGE,
            env: ENV_APPLY_CHANGE,
        })?;
        Ok(Self {
            change,
            database: database_path(args.database),
            applier: applier_config(args.zoom, args.delete_mode, args.flush_pending)?,
        })
    }
}

#[derive(Debug, Serialize)]
struct ApplyOutput<'a> {
    change: &'a str,
    database: &'a str,
    #[serde(flatten)]
    summary: ApplySummary,
}

pub(crate) fn run_apply(args: ApplyArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let command = args.into_config()?;
    execute_apply(&command, writer)
}

pub(crate) fn execute_apply(command: &ApplyCommand, writer: &mut dyn Write) -> Result<(), CliError> {
    fs::require_file(&command.change, ARG_APPLY_CHANGE)?;
    let reader = open_change(&command.change)?;
    let mut store = crate::open_store_for_writing(&command.database)?;
    let summary = apply_change(&mut store, reader, command.applier).map_err(|source| {
        CliError::Apply {
            path: command.change.clone(),
            source,
        }
    })?;
    write_json(
        writer,
        &ApplyOutput {
            change: command.change.as_str(),
            database: command.database.as_str(),
            summary,
        },
    )
}

fn open_change(path: &Utf8Path) -> Result<Box<dyn BufRead>, CliError> {
    let file = fs::open_utf8_file(path).map_err(|source| CliError::OpenInput {
        path: path.to_path_buf(),
        source,
    })?;
    let reader: Box<dyn BufRead> = match path.extension() {
        Some("gz") => Box::new(BufReader::new(MultiGzDecoder::new(file))),
        Some("bz2") => Box::new(BufReader::new(MultiBzDecoder::new(file))),
        _ => Box::new(BufReader::new(file)),
    };
    Ok(reader)
}
