//! Spherical Mercator tile pyramid and quadkey addressing.
//!
//! Tiles are 256 pixels square. [`TileCoord`] stores TMS coordinates, where
//! the row index grows northwards from the bottom of the map; [`QuadKey`]
//! strings follow the XYZ orientation, where the row index grows southwards,
//! so a quadkey prefix always names an ancestor tile.
//!
//! Tile indices are derived with `floor`, so a point lying exactly on a tile
//! edge belongs to the tile east and north of that edge.

use std::{f64::consts::PI, fmt, str::FromStr};

use geo::{Coord, Rect};
use thiserror::Error;

/// Equatorial radius of the WGS84 ellipsoid in metres.
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Edge length of a tile in pixels.
pub const TILE_SIZE: u32 = 256;

/// Deepest supported zoom level.
pub const MAX_ZOOM: u8 = 23;

/// Zoom level at which nodes are assigned their stored quadkey.
pub const DEFAULT_INDEX_ZOOM: u8 = 17;

/// Half the circumference of the Earth at the equator.
const ORIGIN_SHIFT: f64 = PI * EARTH_RADIUS_M;

/// Metres per pixel at zoom 0.
const INITIAL_RESOLUTION: f64 = 2.0 * PI * EARTH_RADIUS_M / 256.0;

/// Latitude beyond which the Mercator projection is clamped.
const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// Errors raised by the tiling functions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TileError {
    /// The zoom level lies outside `1..=MAX_ZOOM`.
    #[error("zoom level {zoom} is outside the supported range 1..={max}")]
    InvalidZoom {
        /// Rejected zoom level.
        zoom: u8,
        /// Deepest supported zoom level.
        max: u8,
    },
    /// The tile column or row does not exist at the requested zoom level.
    #[error("tile ({x}, {y}) does not exist at zoom {zoom}")]
    OutOfRangeTile {
        /// Column index.
        x: i64,
        /// Row index.
        y: i64,
        /// Zoom level of the grid.
        zoom: u8,
    },
    /// The geographic coordinate cannot be projected.
    #[error("coordinate ({lat}, {lon}) cannot be projected onto the tile grid")]
    Unprojectable {
        /// Latitude in degrees.
        lat: f64,
        /// Longitude in degrees.
        lon: f64,
    },
    /// Projected metres were not finite.
    #[error("projected coordinate ({x}, {y}) is not finite")]
    NonFiniteMeters {
        /// Easting in metres.
        x: f64,
        /// Northing in metres.
        y: f64,
    },
    /// A quadkey string was malformed.
    #[error("invalid quadkey {key:?}: {reason}")]
    InvalidQuadKey {
        /// Rejected input.
        key: String,
        /// Why the input was rejected.
        reason: &'static str,
    },
}

/// A validated zoom level in `1..=MAX_ZOOM`.
///
/// # Examples
///
/// ```
/// use quadosm_core::{MAX_ZOOM, Zoom};
///
/// assert!(Zoom::new(0).is_err());
/// assert!(Zoom::new(MAX_ZOOM + 1).is_err());
/// assert_eq!(Zoom::new(17).map(Zoom::get), Ok(17));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "u8", into = "u8")
)]
pub struct Zoom(u8);

impl Zoom {
    /// Validate a zoom level.
    pub const fn new(level: u8) -> Result<Self, TileError> {
        if level == 0 || level > MAX_ZOOM {
            return Err(TileError::InvalidZoom {
                zoom: level,
                max: MAX_ZOOM,
            });
        }
        Ok(Self(level))
    }

    /// Return the raw zoom level.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Number of tiles along one axis of the grid.
    #[must_use]
    pub const fn tiles_per_axis(self) -> u32 {
        1 << self.0
    }

    /// Metres per pixel at this zoom level.
    #[must_use]
    pub fn resolution(self) -> f64 {
        INITIAL_RESOLUTION / f64::from(self.tiles_per_axis())
    }
}

impl Default for Zoom {
    fn default() -> Self {
        Self(DEFAULT_INDEX_ZOOM)
    }
}

impl TryFrom<u8> for Zoom {
    type Error = TileError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Zoom> for u8 {
    fn from(zoom: Zoom) -> Self {
        zoom.0
    }
}

impl fmt::Display for Zoom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Project a WGS84 coordinate to spherical Mercator metres.
///
/// The returned coordinate holds the easting in `x` and the northing in `y`.
/// Latitudes of exactly ±90° project to infinite northings; callers that need
/// tiles should go through [`TileCoord::containing`], which rejects them.
#[must_use]
pub fn project(lat: f64, lon: f64) -> Coord<f64> {
    let x = lon * ORIGIN_SHIFT / 180.0;
    let y = ((90.0 + lat) * PI / 360.0).tan().ln() / (PI / 180.0);
    Coord {
        x,
        y: y * ORIGIN_SHIFT / 180.0,
    }
}

/// Convert spherical Mercator metres back to WGS84 degrees.
///
/// The result uses `x = longitude` and `y = latitude`.
#[must_use]
pub fn unproject(meters: Coord<f64>) -> Coord<f64> {
    let lon = meters.x / ORIGIN_SHIFT * 180.0;
    let lat = meters.y / ORIGIN_SHIFT * 180.0;
    let lat = 180.0 / PI * (2.0 * (lat * PI / 180.0).exp().atan() - PI / 2.0);
    Coord { x: lon, y: lat }
}

/// Axis-aligned geographic bounds in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BoundingBox {
    /// Southern edge.
    pub min_lat: f64,
    /// Western edge.
    pub min_lon: f64,
    /// Northern edge.
    pub max_lat: f64,
    /// Eastern edge.
    pub max_lon: f64,
}

impl BoundingBox {
    /// Construct bounds from south-west and north-east corners.
    #[must_use]
    pub const fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        }
    }

    /// Whether the point lies inside the bounds, edges included.
    #[must_use]
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lon..=self.max_lon).contains(&lon)
    }

    /// Convert to a `geo` rectangle with `x = longitude`.
    #[must_use]
    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.min_lon,
                y: self.min_lat,
            },
            Coord {
                x: self.max_lon,
                y: self.max_lat,
            },
        )
    }
}

/// Parses the OSM API ordering `min_lon,min_lat,max_lon,max_lat`.
impl FromStr for BoundingBox {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| format!("invalid bounding box {s:?}: {err}"))?;
        match parts.as_slice() {
            [min_lon, min_lat, max_lon, max_lat] => {
                Ok(Self::new(*min_lat, *min_lon, *max_lat, *max_lon))
            }
            _ => Err(format!(
                "invalid bounding box {s:?}: expected min_lon,min_lat,max_lon,max_lat"
            )),
        }
    }
}

/// Floor `value` onto the tile grid. Out-of-range values saturate and are
/// rejected by the caller.
#[expect(
    clippy::cast_possible_truncation,
    reason = "float-to-integer casts saturate and every caller range-checks the index"
)]
fn grid_index(value: f64) -> i64 {
    value.floor() as i64
}

/// A tile in the TMS scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TileCoord {
    x: u32,
    y: u32,
    zoom: Zoom,
}

impl TileCoord {
    /// Construct a TMS tile, validating that it exists at `zoom`.
    pub fn new(x: u32, y: u32, zoom: Zoom) -> Result<Self, TileError> {
        let limit = zoom.tiles_per_axis();
        if x >= limit || y >= limit {
            return Err(TileError::OutOfRangeTile {
                x: i64::from(x),
                y: i64::from(y),
                zoom: zoom.get(),
            });
        }
        Ok(Self { x, y, zoom })
    }

    /// Construct a tile from XYZ ("Google") coordinates, whose rows grow
    /// southwards.
    pub fn from_xyz(zoom: Zoom, x: u32, y: u32) -> Result<Self, TileError> {
        let limit = zoom.tiles_per_axis();
        if y >= limit {
            return Err(TileError::OutOfRangeTile {
                x: i64::from(x),
                y: i64::from(y),
                zoom: zoom.get(),
            });
        }
        Self::new(x, limit - 1 - y, zoom)
    }

    /// Tile containing the projected coordinate.
    pub fn from_meters(meters: Coord<f64>, zoom: Zoom) -> Result<Self, TileError> {
        if !meters.x.is_finite() || !meters.y.is_finite() {
            return Err(TileError::NonFiniteMeters {
                x: meters.x,
                y: meters.y,
            });
        }
        let span = zoom.resolution() * f64::from(TILE_SIZE);
        let tx = grid_index((meters.x + ORIGIN_SHIFT) / span);
        let ty = grid_index((meters.y + ORIGIN_SHIFT) / span);
        Self::from_indices(tx, ty, zoom)
    }

    fn from_indices(tx: i64, ty: i64, zoom: Zoom) -> Result<Self, TileError> {
        let out_of_range = || TileError::OutOfRangeTile {
            x: tx,
            y: ty,
            zoom: zoom.get(),
        };
        let x = u32::try_from(tx).map_err(|_| out_of_range())?;
        let y = u32::try_from(ty).map_err(|_| out_of_range())?;
        Self::new(x, y, zoom)
    }

    /// Tile containing the geographic coordinate.
    pub fn containing(lat: f64, lon: f64, zoom: Zoom) -> Result<Self, TileError> {
        if !lat.is_finite()
            || !lon.is_finite()
            || !(-MAX_LATITUDE..=MAX_LATITUDE).contains(&lat)
            || !(-180.0..=180.0).contains(&lon)
        {
            return Err(TileError::Unprojectable { lat, lon });
        }
        let meters = project(lat, lon);
        let meters = Coord {
            x: meters.x.clamp(-ORIGIN_SHIFT, ORIGIN_SHIFT),
            y: meters.y.clamp(-ORIGIN_SHIFT, ORIGIN_SHIFT),
        };
        // The eastern and northern map edges belong to the last tile.
        let last = i64::from(zoom.tiles_per_axis()) - 1;
        let span = zoom.resolution() * f64::from(TILE_SIZE);
        let index = |value: f64| grid_index((value + ORIGIN_SHIFT) / span).clamp(0, last);
        Self::from_indices(index(meters.x), index(meters.y), zoom)
    }

    /// Column index.
    #[must_use]
    pub const fn x(&self) -> u32 {
        self.x
    }

    /// TMS row index, counted from the south.
    #[must_use]
    pub const fn y(&self) -> u32 {
        self.y
    }

    /// XYZ row index, counted from the north.
    #[must_use]
    pub const fn xyz_y(&self) -> u32 {
        self.zoom.tiles_per_axis() - 1 - self.y
    }

    /// Zoom level of the tile.
    #[must_use]
    pub const fn zoom(&self) -> Zoom {
        self.zoom
    }

    /// Quadkey naming this tile.
    #[must_use]
    pub fn quadkey(&self) -> QuadKey {
        let row = self.xyz_y();
        let mut key = String::with_capacity(usize::from(self.zoom.get()));
        for level in (1..=self.zoom.get()).rev() {
            let mask = 1_u32 << (level - 1);
            let mut digit = b'0';
            if self.x & mask != 0 {
                digit += 1;
            }
            if row & mask != 0 {
                digit += 2;
            }
            key.push(char::from(digit));
        }
        QuadKey(key)
    }

    /// Bounds of the tile in projected metres.
    #[must_use]
    pub fn meter_bounds(&self) -> Rect<f64> {
        let res = self.zoom.resolution();
        let size = f64::from(TILE_SIZE);
        let min = Coord {
            x: f64::from(self.x) * size * res - ORIGIN_SHIFT,
            y: f64::from(self.y) * size * res - ORIGIN_SHIFT,
        };
        let max = Coord {
            x: f64::from(self.x + 1) * size * res - ORIGIN_SHIFT,
            y: f64::from(self.y + 1) * size * res - ORIGIN_SHIFT,
        };
        Rect::new(min, max)
    }

    /// Geographic bounds of the tile.
    #[must_use]
    pub fn bounds(&self) -> BoundingBox {
        let meters = self.meter_bounds();
        let south_west = unproject(meters.min());
        let north_east = unproject(meters.max());
        BoundingBox::new(south_west.y, south_west.x, north_east.y, north_east.x)
    }

    /// Enclosing tile one level up, if any.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let zoom = Zoom::new(self.zoom.get().checked_sub(1)?).ok()?;
        Some(Self {
            x: self.x >> 1,
            y: self.y >> 1,
            zoom,
        })
    }
}

/// Quadkey of the tile containing a coordinate at `zoom`.
///
/// # Examples
///
/// ```
/// use quadosm_core::{Zoom, quadkey_for};
///
/// # fn main() -> Result<(), quadosm_core::TileError> {
/// let key = quadkey_for(51.5074, -0.1278, Zoom::new(3)?)?;
/// assert_eq!(key.as_str(), "031");
/// # Ok(())
/// # }
/// ```
pub fn quadkey_for(lat: f64, lon: f64, zoom: Zoom) -> Result<QuadKey, TileError> {
    TileCoord::containing(lat, lon, zoom).map(|tile| tile.quadkey())
}

/// A base-4 tile address whose length equals its zoom level.
///
/// Lexicographic ordering keeps every descendant of a tile contiguous, so a
/// prefix search is a range scan over sorted keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "String", into = "String")
)]
pub struct QuadKey(String);

impl QuadKey {
    /// Validate a quadkey string.
    pub fn parse(key: &str) -> Result<Self, TileError> {
        let invalid = |reason| TileError::InvalidQuadKey {
            key: key.to_owned(),
            reason,
        };
        if key.is_empty() {
            return Err(invalid("quadkey must not be empty"));
        }
        if key.len() > usize::from(MAX_ZOOM) {
            return Err(invalid("quadkey is deeper than the maximum zoom"));
        }
        if !key.bytes().all(|digit| (b'0'..=b'3').contains(&digit)) {
            return Err(invalid("quadkey digits must be 0-3"));
        }
        Ok(Self(key.to_owned()))
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Zoom level named by the key.
    #[must_use]
    pub fn zoom(&self) -> Zoom {
        // Length is validated on construction.
        Zoom(u8::try_from(self.0.len()).unwrap_or(MAX_ZOOM))
    }

    /// Tile addressed by the key.
    #[must_use]
    pub fn to_tile(&self) -> TileCoord {
        let mut x = 0_u32;
        let mut row = 0_u32;
        for digit in self.0.bytes() {
            let digit = u32::from(digit - b'0');
            x = (x << 1) | (digit & 1);
            row = (row << 1) | (digit >> 1);
        }
        let zoom = self.zoom();
        TileCoord {
            x,
            y: zoom.tiles_per_axis() - 1 - row,
            zoom,
        }
    }

    /// Whether `other` lies within this tile.
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Whether a raw key string lies within this tile.
    #[must_use]
    pub fn covers(&self, key: &str) -> bool {
        key.starts_with(&self.0)
    }

    /// Ancestor key at `zoom`, or the key itself when it is not deeper.
    #[must_use]
    pub fn truncate(&self, zoom: Zoom) -> Self {
        let depth = usize::from(zoom.get()).min(self.0.len());
        Self(self.0.chars().take(depth).collect())
    }

    /// Half-open string range `[start, end)` enclosing every descendant key.
    #[must_use]
    pub fn prefix_range(&self) -> (String, String) {
        (self.0.clone(), format!("{}4", self.0))
    }
}

impl fmt::Display for QuadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for QuadKey {
    type Err = TileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for QuadKey {
    type Error = TileError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<QuadKey> for String {
    fn from(key: QuadKey) -> Self {
        key.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const EPSILON: f64 = 1.0e-9;

    fn zoom(level: u8) -> Zoom {
        Zoom::new(level).expect("valid zoom")
    }

    #[rstest]
    #[case(0)]
    #[case(24)]
    #[case(u8::MAX)]
    fn zoom_outside_range_is_rejected(#[case] level: u8) {
        assert_eq!(
            Zoom::new(level),
            Err(TileError::InvalidZoom {
                zoom: level,
                max: MAX_ZOOM
            })
        );
    }

    #[rstest]
    fn project_matches_reference_values() {
        let origin = project(0.0, 0.0);
        assert!(origin.x.abs() < EPSILON);
        assert!(origin.y.abs() < 1.0e-6);

        let london = project(51.5074, -0.1278);
        assert!((london.x - -14_226.630_923_380_364).abs() < 1.0e-6);
        assert!((london.y - 6_711_542.475_587_632_5).abs() < 1.0e-6);
    }

    #[rstest]
    #[case(51.5074, -0.1278, 17, "03131313113010001")]
    #[case(44.982_709, -93.248_777, 17, "02133301101320221")]
    #[case(-33.8688, 151.2093, 10, "3112301330")]
    #[case(51.5074, -0.1278, 3, "031")]
    #[case(51.5074, -0.1278, 1, "0")]
    fn quadkey_for_known_places(
        #[case] lat: f64,
        #[case] lon: f64,
        #[case] level: u8,
        #[case] expected: &str,
    ) {
        let key = quadkey_for(lat, lon, zoom(level)).expect("projectable");
        assert_eq!(key.as_str(), expected);
        assert_eq!(key.zoom(), zoom(level));
    }

    #[rstest]
    fn tms_rows_count_from_the_south() {
        let tile = TileCoord::containing(51.5074, -0.1278, zoom(17)).expect("tile");
        assert_eq!((tile.x(), tile.y()), (65_489, 87_487));
        assert_eq!(tile.xyz_y(), 43_584);
    }

    #[rstest]
    fn xyz_tiles_flip_rows() {
        let tile = TileCoord::from_xyz(zoom(3), 3, 2).expect("tile");
        assert_eq!(tile.y(), 5);
        assert_eq!(tile.quadkey().as_str(), "031");
    }

    #[rstest]
    fn bounds_contain_the_source_point() {
        let tile = TileCoord::containing(51.5074, -0.1278, zoom(17)).expect("tile");
        let bounds = tile.bounds();
        assert!((bounds.min_lat - 51.507_032_967_218_56).abs() < 1.0e-9);
        assert!((bounds.min_lon - -0.129_089_355_468_748_56).abs() < 1.0e-9);
        assert!((bounds.max_lat - 51.508_742_458_803_326).abs() < 1.0e-9);
        assert!((bounds.max_lon - -0.126_342_773_437_500_72).abs() < 1.0e-9);
        assert!(bounds.contains(51.5074, -0.1278));
    }

    #[rstest]
    fn zoom_one_bounds_cover_a_quadrant() {
        let tile = TileCoord::from_xyz(zoom(1), 0, 0).expect("tile");
        let bounds = tile.bounds();
        assert!((bounds.min_lat - 0.0).abs() < EPSILON);
        assert!((bounds.min_lon - -180.0).abs() < EPSILON);
        assert!((bounds.max_lat - MAX_LATITUDE).abs() < 1.0e-9);
        assert!((bounds.max_lon - 0.0).abs() < EPSILON);
    }

    #[rstest]
    #[case(zoom(2), 4, 0)]
    #[case(zoom(2), 0, 4)]
    fn tiles_outside_the_grid_are_rejected(#[case] z: Zoom, #[case] x: u32, #[case] y: u32) {
        assert!(matches!(
            TileCoord::from_xyz(z, x, y),
            Err(TileError::OutOfRangeTile { .. })
        ));
    }

    #[rstest]
    fn meters_outside_the_world_are_rejected() {
        let err = TileCoord::from_meters(Coord { x: 3.0e7, y: 0.0 }, zoom(4))
            .expect_err("outside the grid");
        assert!(matches!(err, TileError::OutOfRangeTile { zoom: 4, .. }));
        assert!(matches!(
            TileCoord::from_meters(Coord { x: f64::NAN, y: 0.0 }, zoom(4)),
            Err(TileError::NonFiniteMeters { .. })
        ));
    }

    #[rstest]
    #[case::far_east(Coord { x: 1.0e300, y: 1.0e6 }, i64::MAX, 1)]
    #[case::far_south(Coord { x: 1.0e6, y: -1.0e300 }, 1, i64::MIN)]
    #[case::just_west(Coord { x: -ORIGIN_SHIFT - 1.0, y: 1.0e6 }, -1, 1)]
    fn out_of_grid_meters_report_saturated_indices(
        #[case] meters: Coord<f64>,
        #[case] x: i64,
        #[case] y: i64,
    ) {
        let err = TileCoord::from_meters(meters, zoom(1)).expect_err("outside the grid");
        assert_eq!(err, TileError::OutOfRangeTile { x, y, zoom: 1 });
    }

    #[rstest]
    #[case(zoom(1))]
    #[case(zoom(MAX_ZOOM))]
    fn south_west_corner_belongs_to_the_first_tile(#[case] z: Zoom) {
        let tile = TileCoord::containing(-MAX_LATITUDE, -180.0, z).expect("tile");
        assert_eq!((tile.x(), tile.y()), (0, 0));
    }

    #[rstest]
    #[case(90.0, 0.0)]
    #[case(-90.0, 0.0)]
    #[case(0.0, 181.0)]
    #[case(f64::NAN, 0.0)]
    fn unprojectable_coordinates_are_rejected(#[case] lat: f64, #[case] lon: f64) {
        assert!(matches!(
            TileCoord::containing(lat, lon, zoom(5)),
            Err(TileError::Unprojectable { .. })
        ));
    }

    #[rstest]
    fn map_edges_belong_to_the_last_tile() {
        let tile = TileCoord::containing(MAX_LATITUDE, 180.0, zoom(2)).expect("tile");
        assert_eq!((tile.x(), tile.y()), (3, 3));
    }

    #[rstest]
    fn quadkey_round_trips_through_tiles() {
        let key = QuadKey::parse("03131313113010001").expect("valid key");
        let tile = key.to_tile();
        assert_eq!((tile.x(), tile.y()), (65_489, 87_487));
        assert_eq!(tile.quadkey(), key);
    }

    #[rstest]
    fn ancestors_are_prefixes() {
        let key = QuadKey::parse("0313131").expect("valid key");
        let ancestor = key.truncate(zoom(3));
        assert_eq!(ancestor.as_str(), "031");
        assert!(ancestor.is_prefix_of(&key));
        assert!(!key.is_prefix_of(&ancestor));
        let parent = key.to_tile().parent().expect("parent").quadkey();
        assert_eq!(parent.as_str(), "031313");
    }

    #[rstest]
    fn prefix_range_brackets_descendants() {
        let key = QuadKey::parse("031").expect("valid key");
        let (start, end) = key.prefix_range();
        for candidate in ["031", "0310", "0313333", "03133333333333333"] {
            assert!(start.as_str() <= candidate && candidate < end.as_str());
        }
        for outsider in ["030", "0320", "1", "03"] {
            assert!(!(start.as_str() <= outsider && outsider < end.as_str()));
        }
    }

    #[rstest]
    #[case("")]
    #[case("0124")]
    #[case("abc")]
    #[case("000000000000000000000000")]
    fn malformed_quadkeys_are_rejected(#[case] key: &str) {
        assert!(matches!(
            QuadKey::parse(key),
            Err(TileError::InvalidQuadKey { .. })
        ));
    }

    #[rstest]
    fn bounding_box_parses_osm_order() {
        let bbox: BoundingBox = "-0.2,51.4,0.1,51.6".parse().expect("bbox");
        assert_eq!(bbox, BoundingBox::new(51.4, -0.2, 51.6, 0.1));
        assert!("1,2,3".parse::<BoundingBox>().is_err());
    }
}
