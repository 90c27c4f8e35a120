//! Encoded polyline codec at five decimal digits of precision.
//!
//! Each coordinate is stored as a latitude delta followed by a longitude
//! delta. Values are zig-zag encoded and split into 5-bit groups, least
//! significant first; every group but the last carries the `0x20`
//! continuation bit, and each group is offset by 63 into printable ASCII.
//!
//! Decoded points use `x = longitude` and `y = latitude`.

use geo::{Coord, LineString, Polygon};
use thiserror::Error;

const PRECISION: f64 = 1.0e5;
const OFFSET: u8 = 63;
const CONTINUATION: i64 = 0x20;
const GROUP_MASK: i64 = 0x1f;
/// Seven groups carry 35 bits, enough for any 32-bit value.
const MAX_SHIFT: u32 = 35;

/// Why a polyline could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedKind {
    /// The text ended inside a value.
    Truncated,
    /// A byte fell outside the encoding alphabet.
    InvalidByte(u8),
    /// A value carried more groups than a 32-bit integer needs.
    Overflow,
    /// A latitude had no matching longitude.
    UnpairedValue,
}

/// Error returned when polyline text does not decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("malformed polyline at byte {offset}: {kind:?}")]
pub struct MalformedPolyline {
    /// Byte offset at which the offending value starts.
    pub offset: usize,
    /// Failure category.
    pub kind: MalformedKind,
}

/// Decode polyline text into coordinates.
///
/// An empty string decodes to an empty sequence.
///
/// # Examples
///
/// ```
/// use quadosm_core::polyline::decode;
///
/// # fn main() -> Result<(), quadosm_core::MalformedPolyline> {
/// let points = decode("_p~iF~ps|U_ulLnnqC_mqNvxq`@")?;
/// assert_eq!(points.len(), 3);
/// assert!((points[0].y - 38.5).abs() < 1e-9);
/// assert!((points[0].x + 120.2).abs() < 1e-9);
/// # Ok(())
/// # }
/// ```
pub fn decode(text: &str) -> Result<Vec<Coord<f64>>, MalformedPolyline> {
    let bytes = text.as_bytes();
    let mut index = 0;
    let mut lat = 0_i64;
    let mut lon = 0_i64;
    let mut points = Vec::new();

    while index < bytes.len() {
        let start = index;
        lat += next_value(bytes, &mut index)?;
        if index >= bytes.len() {
            return Err(MalformedPolyline {
                offset: start,
                kind: MalformedKind::UnpairedValue,
            });
        }
        lon += next_value(bytes, &mut index)?;
        points.push(Coord {
            x: lon as f64 / PRECISION,
            y: lat as f64 / PRECISION,
        });
    }

    Ok(points)
}

fn next_value(bytes: &[u8], index: &mut usize) -> Result<i64, MalformedPolyline> {
    let start = *index;
    let mut result = 0_i64;
    let mut shift = 0_u32;
    loop {
        let Some(&byte) = bytes.get(*index) else {
            return Err(MalformedPolyline {
                offset: start,
                kind: MalformedKind::Truncated,
            });
        };
        if !(OFFSET..=126).contains(&byte) {
            return Err(MalformedPolyline {
                offset: *index,
                kind: MalformedKind::InvalidByte(byte),
            });
        }
        if shift >= MAX_SHIFT {
            return Err(MalformedPolyline {
                offset: start,
                kind: MalformedKind::Overflow,
            });
        }
        let group = i64::from(byte - OFFSET);
        *index += 1;
        result |= (group & GROUP_MASK) << shift;
        shift += 5;
        if group < CONTINUATION {
            break;
        }
    }

    Ok(if result & 1 == 1 {
        !(result >> 1)
    } else {
        result >> 1
    })
}

/// Encode coordinates as polyline text.
///
/// Coordinates are rounded to five decimal places.
#[must_use]
pub fn encode(points: &[Coord<f64>]) -> String {
    let mut out = String::new();
    let mut previous_lat = 0_i64;
    let mut previous_lon = 0_i64;
    for point in points {
        let lat = (point.y * PRECISION).round() as i64;
        let lon = (point.x * PRECISION).round() as i64;
        push_value(&mut out, lat - previous_lat);
        push_value(&mut out, lon - previous_lon);
        previous_lat = lat;
        previous_lon = lon;
    }
    out
}

fn push_value(out: &mut String, delta: i64) {
    let mut value = if delta < 0 { !(delta << 1) } else { delta << 1 };
    while value >= CONTINUATION {
        out.push(group_char((CONTINUATION | (value & GROUP_MASK)) as u8));
        value >>= 5;
    }
    out.push(group_char(value as u8));
}

fn group_char(group: u8) -> char {
    char::from(group + OFFSET)
}

/// Decode polyline text into a polygon whose exterior ring is the decoded
/// path, closed if necessary.
pub fn decode_polygon(text: &str) -> Result<Polygon<f64>, MalformedPolyline> {
    let points = decode(text)?;
    Ok(Polygon::new(LineString::from(points), Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const FIXTURE: &str = "_p~iF~ps|U_ulLnnqC_mqNvxq`@";

    fn assert_point(point: Coord<f64>, lat: f64, lon: f64) {
        assert!((point.y - lat).abs() < 1.0e-9, "lat {} != {lat}", point.y);
        assert!((point.x - lon).abs() < 1.0e-9, "lon {} != {lon}", point.x);
    }

    #[rstest]
    fn decodes_reference_polyline() {
        let points = decode(FIXTURE).expect("valid polyline");
        assert_eq!(points.len(), 3);
        assert_point(points[0], 38.5, -120.2);
        assert_point(points[1], 40.7, -120.95);
        assert_point(points[2], 43.252, -126.453);
    }

    #[rstest]
    fn encodes_reference_polyline() {
        let points = [
            Coord { x: -120.2, y: 38.5 },
            Coord { x: -120.95, y: 40.7 },
            Coord {
                x: -126.453,
                y: 43.252,
            },
        ];
        assert_eq!(encode(&points), FIXTURE);
    }

    #[rstest]
    fn empty_text_decodes_to_nothing() {
        assert_eq!(decode(""), Ok(Vec::new()));
        assert_eq!(encode(&[]), "");
    }

    #[rstest]
    #[case("_p~iF~ps|U_", 10, MalformedKind::Truncated)]
    #[case("_p~iF", 0, MalformedKind::UnpairedValue)]
    #[case("_p~iF~ps|U !", 10, MalformedKind::InvalidByte(b' '))]
    #[case("~~~~~~~~?", 0, MalformedKind::Overflow)]
    fn malformed_text_reports_offset(
        #[case] text: &str,
        #[case] offset: usize,
        #[case] kind: MalformedKind,
    ) {
        assert_eq!(decode(text), Err(MalformedPolyline { offset, kind }));
    }

    #[rstest]
    fn polygon_ring_is_closed() {
        let polygon = decode_polygon(FIXTURE).expect("valid polyline");
        let ring = polygon.exterior();
        assert_eq!(ring.0.len(), 4);
        assert_eq!(ring.0.first(), ring.0.last());
    }
}
