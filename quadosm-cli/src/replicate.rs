//! Replicate command implementation for the quadosm CLI.

use std::{io::Write, time::Duration};

use camino::Utf8PathBuf;
use clap::Parser;
use log::info;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use quadosm_core::{EntityStore, ReplicationStateStore};
use quadosm_data::{
    ApplySummary, DirectoryReplicationSource, HttpReplicationSource, ReplicationConfig,
    ReplicationDriver, ReplicationReport, ReplicationSource, RetryPolicy, StopReason,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    ARG_DATABASE, ARG_ZOOM, CliError,
    apply::{DeleteModeArg, applier_config},
    database_path, write_json,
};

pub(crate) const ARG_REPLICATE_BASE_URL: &str = "base-url";
pub(crate) const ARG_REPLICATE_DIRECTORY: &str = "directory";
pub(crate) const ARG_REPLICATE_START_SEQUENCE: &str = "start-sequence";
pub(crate) const ARG_REPLICATE_FROM_HEAD: &str = "from-head";
pub(crate) const ENV_REPLICATE_BASE_URL: &str = "QUADOSM_CMDS_REPLICATE_BASE_URL";

/// CLI arguments for the `replicate` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Fetch and apply change units from a replication feed laid \
                 out as AAA/BBB/CCC.osc.gz, either over HTTP or from a local \
                 mirror. Progress is stored in the database, so an \
                 interrupted run resumes at the unit that was not applied.",
    about = "Follow a replication feed"
)]
#[ortho_config(prefix = "QUADOSM")]
pub(crate) struct ReplicateArgs {
    /// Base URL of the feed, e.g. `https://planet.openstreetmap.org/replication/minute`.
    #[arg(long = ARG_REPLICATE_BASE_URL, value_name = "url")]
    #[serde(default)]
    pub(crate) base_url: Option<String>,
    /// Local mirror of a feed, used instead of a URL.
    #[arg(long = ARG_REPLICATE_DIRECTORY, value_name = "dir")]
    #[serde(default)]
    pub(crate) directory: Option<Utf8PathBuf>,
    /// SQLite database to update (default `quadosm.db`).
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
    /// Zoom level used to index nodes (default 17).
    #[arg(long = ARG_ZOOM, value_name = "level")]
    #[serde(default)]
    pub(crate) zoom: Option<u8>,
    /// Reset the marker to this sequence before running.
    #[arg(long = ARG_REPLICATE_START_SEQUENCE, value_name = "sequence")]
    #[serde(default)]
    pub(crate) start_sequence: Option<u64>,
    /// Reset the marker to just after the feed's current head.
    #[arg(long = ARG_REPLICATE_FROM_HEAD)]
    #[serde(default)]
    pub(crate) from_head: bool,
    /// Keep polling for new units until interrupted.
    #[arg(long)]
    #[serde(default)]
    pub(crate) follow: bool,
    /// Stop after applying this many units.
    #[arg(long, value_name = "count")]
    #[serde(default)]
    pub(crate) max_units: Option<u64>,
    /// Attempts per unit fetch (default 1).
    #[arg(long, value_name = "count")]
    #[serde(default)]
    pub(crate) retries: Option<u32>,
    /// Delay before the first retry, in milliseconds (default 1000).
    #[arg(long, value_name = "ms")]
    #[serde(default)]
    pub(crate) retry_backoff_ms: Option<u64>,
    /// Seconds between polls in follow mode (default 60).
    #[arg(long, value_name = "seconds")]
    #[serde(default)]
    pub(crate) poll_interval_secs: Option<u64>,
    /// User agent sent to HTTP feeds.
    #[arg(long, value_name = "agent")]
    #[serde(default)]
    pub(crate) user_agent: Option<String>,
    /// HTTP request timeout in seconds (default 30).
    #[arg(long, value_name = "seconds")]
    #[serde(default)]
    pub(crate) timeout_secs: Option<u64>,
    /// How deletions are written (default soft).
    #[arg(long, value_enum, value_name = "mode")]
    #[serde(default)]
    pub(crate) delete_mode: Option<DeleteModeArg>,
    /// Write an unterminated trailing block instead of discarding it.
    #[arg(long)]
    #[serde(default)]
    pub(crate) flush_pending: bool,
}

impl ReplicateArgs {
    pub(crate) fn into_config(self) -> Result<ReplicateCommand, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        ReplicateCommand::try_from(merged)
    }
}

#[cfg(test)]
pub(crate) fn config_from_layers_for_test(
    layers: Vec<ortho_config::MergeLayer<'static>>,
) -> Result<ReplicateCommand, CliError> {
    let merged = ReplicateArgs::merge_from_layers(layers).map_err(CliError::from)?;
    ReplicateCommand::try_from(merged)
}

/// Where change units come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FeedLocation {
    Http(String),
    Directory(Utf8PathBuf),
}

/// Where the marker starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartPoint {
    Stored,
    Sequence(u64),
    Head,
}

/// Resolved `replicate` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReplicateCommand {
    pub(crate) feed: FeedLocation,
    pub(crate) database: Utf8PathBuf,
    pub(crate) start: StartPoint,
    pub(crate) follow: bool,
    pub(crate) replication: ReplicationConfig,
}

impl TryFrom<ReplicateArgs> for ReplicateCommand {
    type Error = CliError;

    fn try_from(args: ReplicateArgs) -> Result<Self, Self::Error> {
        let feed = match (args.base_url, args.directory) {
            (Some(_), Some(_)) => {
                return Err(CliError::ConflictingArguments {
                    first: ARG_REPLICATE_BASE_URL,
                    second: ARG_REPLICATE_DIRECTORY,
                });
            }
            (Some(url), None) => FeedLocation::Http(url),
            (None, Some(dir)) => FeedLocation::Directory(dir),
            (None, None) => {
                return Err(CliError::MissingArgument {
                    field: ARG_REPLICATE_BASE_URL,
                    env: ENV_REPLICATE_BASE_URL,
                });
            }
        };
        let start = match (args.start_sequence, args.from_head) {
            (Some(_), true) => {
                return Err(CliError::ConflictingArguments {
                    first: ARG_REPLICATE_START_SEQUENCE,
                    second: ARG_REPLICATE_FROM_HEAD,
                });
            }
            (Some(sequence), false) => StartPoint::Sequence(sequence),
            (None, true) => StartPoint::Head,
            (None, false) => StartPoint::Stored,
        };

        let mut retry = RetryPolicy::exponential(args.retries.unwrap_or(1));
        if let Some(ms) = args.retry_backoff_ms {
            retry = retry.with_initial_backoff(Duration::from_millis(ms));
        }
        let mut replication = ReplicationConfig::default()
            .with_applier(applier_config(
                args.zoom,
                args.delete_mode,
                args.flush_pending,
            )?)
            .with_retry(retry)
            .with_unit_limit(args.max_units);
        if let Some(seconds) = args.poll_interval_secs {
            replication = replication.with_poll_interval(Duration::from_secs(seconds));
        }
        if let Some(seconds) = args.timeout_secs {
            replication = replication.with_timeout(Duration::from_secs(seconds));
        }
        if let Some(agent) = args.user_agent {
            replication = replication.with_user_agent(agent);
        }

        Ok(Self {
            feed,
            database: database_path(args.database),
            start,
            follow: args.follow,
            replication,
        })
    }
}

/// JSON form of a [`ReplicationReport`].
#[derive(Debug, Serialize)]
struct ReplicateOutput {
    first_sequence: u64,
    next_sequence: u64,
    units_applied: u64,
    caught_up: bool,
    stop: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(flatten)]
    summary: ApplySummary,
}

impl From<&ReplicationReport> for ReplicateOutput {
    fn from(report: &ReplicationReport) -> Self {
        let (stop, last_error) = match &report.stop {
            StopReason::SourceExhausted { error, .. } if report.stop.caught_up() => {
                ("caught-up", Some(error.to_string()))
            }
            StopReason::SourceExhausted { error, .. } => ("fetch-failed", Some(error.to_string())),
            StopReason::Cancelled => ("cancelled", None),
            StopReason::UnitLimit => ("unit-limit", None),
        };
        Self {
            first_sequence: report.first_sequence,
            next_sequence: report.next_sequence,
            units_applied: report.units_applied,
            caught_up: report.stop.caught_up(),
            stop,
            last_error,
            summary: report.summary,
        }
    }
}

pub(crate) fn run_replicate(args: ReplicateArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let command = args.into_config()?;
    execute_replicate(&command, writer)
}

pub(crate) fn execute_replicate(
    command: &ReplicateCommand,
    writer: &mut dyn Write,
) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the current unit");
            trigger.cancel();
        }
    });

    let store = crate::open_store_for_writing(&command.database)?;
    let report = match &command.feed {
        FeedLocation::Http(url) => {
            let source = HttpReplicationSource::new(url)
                .map_err(CliError::ReplicationSource)?
                .with_user_agent(command.replication.user_agent())
                .with_timeout(command.replication.timeout());
            runtime.block_on(drive(store, source, command, &cancel))?
        }
        FeedLocation::Directory(dir) => {
            let source =
                DirectoryReplicationSource::open(dir).map_err(CliError::ReplicationSource)?;
            runtime.block_on(drive(store, source, command, &cancel))?
        }
    };
    write_json(writer, &ReplicateOutput::from(&report))
}

/// Position the marker as requested, then run or follow the feed.
pub(crate) async fn drive<S, R>(
    store: S,
    source: R,
    command: &ReplicateCommand,
    cancel: &CancellationToken,
) -> Result<ReplicationReport, CliError>
where
    S: EntityStore + ReplicationStateStore,
    R: ReplicationSource,
{
    let mut driver = ReplicationDriver::new(store, source, command.replication.clone());
    match command.start {
        StartPoint::Stored => {}
        StartPoint::Sequence(sequence) => {
            driver.start_at(sequence)?;
        }
        StartPoint::Head => {
            driver.start_at_head().await?;
        }
    }
    let report = if command.follow {
        driver.follow(cancel).await?
    } else {
        driver.run(cancel).await?
    };
    info!(
        "replication stopped at sequence {} after {} units",
        report.next_sequence, report.units_applied
    );
    Ok(report)
}
