//! Query command implementation for the quadosm CLI.

use std::io::Write;

use camino::Utf8PathBuf;
use clap::Parser;
use geo::Coord;
use log::info;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use quadosm_core::{
    BoundingBox, ElementKind, QuadKey, QueryBuilder, QueryError, execute,
    expand_with_referenced_nodes, expand_with_referencing_relations,
    expand_with_referencing_ways, polyline,
};
use serde::{Deserialize, Serialize};

use crate::{ARG_DATABASE, CliError, database_path, open_store_for_reading, write_json};

const ARG_BBOX: &str = "bbox";
const ARG_POLYLINE: &str = "polyline";
const ARG_POLYGON: &str = "polygon";
const ARG_QUADKEY: &str = "quadkey";

/// CLI arguments for the `query` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Select elements by area, tile, tags and edit metadata. At \
                 most one of --bbox, --polyline, --polygon and --quadkey may \
                 be given; every other filter must also hold.",
    about = "Run a filtered element query"
)]
#[ortho_config(prefix = "QUADOSM")]
pub(crate) struct QueryArgs {
    /// SQLite database to read (default `quadosm.db`).
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
    /// Bounding box as `min_lat,min_lon,max_lat,max_lon`.
    #[arg(long = ARG_BBOX, value_name = "box", allow_hyphen_values = true)]
    #[serde(default)]
    pub(crate) bbox: Option<String>,
    /// Area given as an encoded polyline.
    #[arg(long = ARG_POLYLINE, value_name = "encoded", allow_hyphen_values = true)]
    #[serde(default)]
    pub(crate) polyline: Option<String>,
    /// Area given as `lat,lon;lat,lon;...` vertices.
    #[arg(long = ARG_POLYGON, value_name = "vertices", allow_hyphen_values = true)]
    #[serde(default)]
    pub(crate) polygon: Option<String>,
    /// Tile given as a quadkey.
    #[arg(long = ARG_QUADKEY, value_name = "key")]
    #[serde(default)]
    pub(crate) quadkey: Option<String>,
    /// Tag filter, `key` or `key=value`; repeatable.
    #[arg(long = "tag", value_name = "filter")]
    #[serde(default)]
    pub(crate) tags: Vec<String>,
    /// Only `node`, `way` or `relation`.
    #[arg(long, value_name = "kind")]
    #[serde(default)]
    pub(crate) kind: Option<String>,
    /// Last editor's name.
    #[arg(long, value_name = "name")]
    #[serde(default)]
    pub(crate) user: Option<String>,
    /// Last editor's id.
    #[arg(long, value_name = "id")]
    #[serde(default)]
    pub(crate) uid: Option<i64>,
    /// Changeset id.
    #[arg(long, value_name = "id")]
    #[serde(default)]
    pub(crate) changeset: Option<i64>,
    /// Include soft-deleted elements.
    #[arg(long)]
    #[serde(default)]
    pub(crate) include_deleted: bool,
    /// Complete the result with connected ways, their nodes and relations.
    #[arg(long)]
    #[serde(default)]
    pub(crate) expand: bool,
}

/// Resolved `query` command configuration.
#[derive(Debug, Clone)]
pub(crate) struct QueryCommand {
    pub(crate) database: Utf8PathBuf,
    pub(crate) builder: QueryBuilder,
    pub(crate) expand: bool,
}

impl TryFrom<QueryArgs> for QueryCommand {
    type Error = CliError;

    fn try_from(args: QueryArgs) -> Result<Self, Self::Error> {
        let spatial = [
            (ARG_BBOX, args.bbox.is_some()),
            (ARG_POLYLINE, args.polyline.is_some()),
            (ARG_POLYGON, args.polygon.is_some()),
            (ARG_QUADKEY, args.quadkey.is_some()),
        ];
        let mut given = spatial.iter().filter(|(_, set)| *set).map(|(name, _)| *name);
        if let (Some(first), Some(second)) = (given.next(), given.next()) {
            return Err(CliError::ConflictingArguments { first, second });
        }

        let mut builder = QueryBuilder::new().include_deleted(args.include_deleted);
        if let Some(text) = args.bbox {
            builder = builder.bbox(parse_bbox(&text)?);
        }
        if let Some(encoded) = args.polyline {
            builder = builder.polyline(encoded);
        }
        if let Some(vertices) = args.polygon {
            let encoded = polyline::encode(&parse_polygon(&vertices)?);
            info!("polygon filter encodes as {encoded}");
            builder = builder.polyline(encoded);
        }
        if let Some(key) = args.quadkey {
            let quadkey = QuadKey::parse(&key).map_err(QueryError::from)?;
            builder = builder.tile(quadkey);
        }
        for filter in &args.tags {
            builder = match filter.split_once('=') {
                Some((key, value)) if !key.is_empty() => builder.tag_equals(key, value),
                None if !filter.is_empty() => builder.tag_exists(filter.as_str()),
                _ => {
                    return Err(CliError::InvalidTagFilter {
                        value: filter.clone(),
                    });
                }
            };
        }
        if let Some(kind) = args.kind {
            builder = builder.kind(kind.parse::<ElementKind>()?);
        }
        if let Some(user) = args.user {
            builder = builder.user(user);
        }
        if let Some(uid) = args.uid {
            builder = builder.uid(uid);
        }
        if let Some(changeset) = args.changeset {
            builder = builder.changeset(changeset);
        }
        Ok(Self {
            database: database_path(args.database),
            builder,
            expand: args.expand,
        })
    }
}

fn parse_bbox(text: &str) -> Result<BoundingBox, CliError> {
    let invalid = || CliError::InvalidBoundingBox {
        value: text.to_owned(),
    };
    let values = text
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid())?;
    let [min_lat, min_lon, max_lat, max_lon] = values.as_slice() else {
        return Err(invalid());
    };
    Ok(BoundingBox::new(*min_lat, *min_lon, *max_lat, *max_lon))
}

fn parse_polygon(text: &str) -> Result<Vec<Coord<f64>>, CliError> {
    let invalid = || CliError::InvalidPolygon {
        value: text.to_owned(),
    };
    text.split(';')
        .map(|vertex| {
            let (lat, lon) = vertex.split_once(',').ok_or_else(invalid)?;
            let lat = lat.trim().parse::<f64>().map_err(|_| invalid())?;
            let lon = lon.trim().parse::<f64>().map_err(|_| invalid())?;
            Ok(Coord { x: lon, y: lat })
        })
        .collect()
}

pub(crate) fn run_query(args: QueryArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let merged = args.load_and_merge().map_err(CliError::Configuration)?;
    execute_query(QueryCommand::try_from(merged)?, writer)
}

pub(crate) fn execute_query(command: QueryCommand, writer: &mut dyn Write) -> Result<(), CliError> {
    let store = open_store_for_reading(&command.database)?;
    let query = command.builder.build()?;
    let mut result = execute(&store, &query)?;
    if command.expand {
        expand_with_referencing_ways(&store, &mut result)?;
        expand_with_referenced_nodes(&store, &mut result)?;
        expand_with_referencing_relations(&store, &mut result)?;
    }
    write_json(writer, &result)
}
