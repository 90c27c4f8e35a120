//! Property tests for the tile pyramid and the polyline codec.

use geo::Coord;
use proptest::prelude::*;
use quadosm_core::{MAX_ZOOM, QuadKey, TileCoord, Zoom, polyline, project, quadkey_for, unproject};

/// Tolerance for points that sit on a tile edge, in degrees.
const EDGE_TOLERANCE: f64 = 1.0e-7;

fn zoom_strategy() -> impl Strategy<Value = Zoom> {
    (1..=MAX_ZOOM).prop_map(|level| Zoom::new(level).expect("strategy yields valid zooms"))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn tile_bounds_contain_the_projected_point(
        lat in -85.0_f64..85.0,
        lon in -180.0_f64..180.0,
        zoom in zoom_strategy(),
    ) {
        let tile = TileCoord::from_meters(project(lat, lon), zoom).expect("point on the map");
        let bounds = tile.bounds();
        prop_assert!(bounds.min_lat - EDGE_TOLERANCE <= lat && lat <= bounds.max_lat + EDGE_TOLERANCE);
        prop_assert!(bounds.min_lon - EDGE_TOLERANCE <= lon && lon <= bounds.max_lon + EDGE_TOLERANCE);
    }

    #[test]
    fn coarser_keys_prefix_finer_keys(
        lat in -85.0_f64..85.0,
        lon in -180.0_f64..180.0,
        coarse in 1..MAX_ZOOM,
        extra in 1_u8..=MAX_ZOOM,
    ) {
        let fine = coarse.saturating_add(extra).min(MAX_ZOOM);
        let coarse_key = quadkey_for(lat, lon, Zoom::new(coarse).expect("zoom")).expect("key");
        let fine_key = quadkey_for(lat, lon, Zoom::new(fine).expect("zoom")).expect("key");
        prop_assert!(coarse_key.is_prefix_of(&fine_key), "{coarse_key} !< {fine_key}");
        prop_assert_eq!(fine_key.truncate(coarse_key.zoom()), coarse_key);
    }

    #[test]
    fn parent_tiles_nest_their_children(
        lat in -85.0_f64..85.0,
        lon in -180.0_f64..180.0,
        zoom in zoom_strategy(),
    ) {
        let tile = TileCoord::containing(lat, lon, zoom).expect("tile");
        if let Some(parent) = tile.parent() {
            prop_assert!(parent.quadkey().is_prefix_of(&tile.quadkey()));
            let outer = parent.bounds();
            let inner = tile.bounds();
            prop_assert!(outer.min_lat <= inner.min_lat + EDGE_TOLERANCE);
            prop_assert!(outer.max_lat + EDGE_TOLERANCE >= inner.max_lat);
        }
    }

    #[test]
    fn quadkeys_address_their_tile(
        lat in -85.0_f64..85.0,
        lon in -180.0_f64..180.0,
        zoom in zoom_strategy(),
    ) {
        let tile = TileCoord::containing(lat, lon, zoom).expect("tile");
        let key = QuadKey::parse(tile.quadkey().as_str()).expect("valid key");
        prop_assert_eq!(key.to_tile(), tile);
        let xyz = TileCoord::from_xyz(zoom, tile.x(), tile.xyz_y()).expect("xyz");
        prop_assert_eq!(xyz, tile);
    }

    #[test]
    fn unproject_inverts_project(lat in -85.0_f64..85.0, lon in -180.0_f64..180.0) {
        let back = unproject(project(lat, lon));
        prop_assert!((back.y - lat).abs() < 1.0e-9);
        prop_assert!((back.x - lon).abs() < 1.0e-9);
    }

    #[test]
    fn polyline_decoding_recovers_rounded_points(
        points in prop::collection::vec((-90.0_f64..90.0, -180.0_f64..180.0), 0..32),
    ) {
        let coords: Vec<_> = points.iter().map(|&(lat, lon)| Coord { x: lon, y: lat }).collect();
        let decoded = polyline::decode(&polyline::encode(&coords)).expect("encoder output decodes");
        prop_assert_eq!(decoded.len(), coords.len());
        for (original, recovered) in coords.iter().zip(&decoded) {
            prop_assert!((original.x - recovered.x).abs() <= 0.5e-5 + 1.0e-9);
            prop_assert!((original.y - recovered.y).abs() <= 0.5e-5 + 1.0e-9);
        }
    }
}
