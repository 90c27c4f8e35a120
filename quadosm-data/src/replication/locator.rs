//! Sequence numbers, their feed paths, and `state.txt` documents.

use std::fmt;

use chrono::{DateTime, Utc};
use quadosm_core::parse_timestamp;

use super::ReplicationError;

/// Largest sequence the `AAA/BBB/CCC` layout can address.
pub const MAX_SEQUENCE: u64 = 999_999_999;

/// Position of one change unit in a replication feed.
///
/// The sequence is zero-padded to nine digits and split into three
/// directory levels.
///
/// # Examples
///
/// ```
/// use quadosm_data::Locator;
///
/// let locator = Locator::new(1_234).expect("in range");
/// assert_eq!(locator.to_string(), "000/001/234");
/// assert_eq!(locator.change_path(), "000/001/234.osc.gz");
/// assert_eq!(locator.state_path(), "000/001/234.state.txt");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Locator(u64);

impl Locator {
    /// Validate `sequence` against the path layout.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::SequenceOutOfRange`] above
    /// [`MAX_SEQUENCE`].
    pub const fn new(sequence: u64) -> Result<Self, ReplicationError> {
        if sequence > MAX_SEQUENCE {
            return Err(ReplicationError::SequenceOutOfRange { sequence });
        }
        Ok(Self(sequence))
    }

    /// The sequence number.
    #[must_use]
    pub const fn sequence(self) -> u64 {
        self.0
    }

    /// The three directory levels, most significant first.
    #[must_use]
    pub const fn segments(self) -> [u64; 3] {
        [self.0 / 1_000_000, (self.0 / 1_000) % 1_000, self.0 % 1_000]
    }

    /// Path of the compressed change unit.
    #[must_use]
    pub fn change_path(self) -> String {
        format!("{self}.osc.gz")
    }

    /// Path of the state document published alongside the unit.
    #[must_use]
    pub fn state_path(self) -> String {
        format!("{self}.state.txt")
    }

    /// The following unit.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::SequenceOutOfRange`] past the last
    /// addressable unit.
    pub const fn next(self) -> Result<Self, ReplicationError> {
        Self::new(self.0 + 1)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [top, middle, bottom] = self.segments();
        write!(f, "{top:03}/{middle:03}/{bottom:03}")
    }
}

/// Contents of a `state.txt` document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteState {
    /// Latest published sequence.
    pub sequence: u64,
    /// Data timestamp of that sequence, when given.
    pub timestamp: Option<DateTime<Utc>>,
}

impl RemoteState {
    /// Parse the Java-properties style `state.txt` format.
    ///
    /// `location` only labels errors.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::InvalidState`] when `sequenceNumber` is
    /// missing, malformed or past [`MAX_SEQUENCE`], or the timestamp does
    /// not parse.
    ///
    /// # Examples
    ///
    /// ```
    /// use quadosm_data::RemoteState;
    ///
    /// let text = "#Sat Mar 02 12:00:02 UTC 2024\nsequenceNumber=6001234\ntimestamp=2024-03-02T12\\:00\\:00Z\n";
    /// let state = RemoteState::parse(text, "state.txt").expect("valid state");
    /// assert_eq!(state.sequence, 6_001_234);
    /// assert!(state.timestamp.is_some());
    /// ```
    pub fn parse(text: &str, location: &str) -> Result<Self, ReplicationError> {
        let invalid = |reason: String| ReplicationError::InvalidState {
            location: location.to_owned(),
            reason,
        };
        let mut sequence = None;
        let mut timestamp = None;
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().replace("\\:", ":");
            match key.trim() {
                "sequenceNumber" => {
                    let parsed = value
                        .parse::<u64>()
                        .map_err(|err| invalid(format!("bad sequenceNumber {value:?}: {err}")))?;
                    if parsed > MAX_SEQUENCE {
                        return Err(invalid(format!(
                            "sequenceNumber {parsed} exceeds {MAX_SEQUENCE}"
                        )));
                    }
                    sequence = Some(parsed);
                }
                "timestamp" => {
                    let parsed = parse_timestamp(&value)
                        .map_err(|err| invalid(format!("bad timestamp: {err}")))?;
                    timestamp = Some(parsed);
                }
                _ => {}
            }
        }
        let sequence = sequence.ok_or_else(|| invalid("missing sequenceNumber".to_owned()))?;
        Ok(Self {
            sequence,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, "000/000/000")]
    #[case(1, "000/000/001")]
    #[case(1_234, "000/001/234")]
    #[case(6_001_234, "006/001/234")]
    #[case(MAX_SEQUENCE, "999/999/999")]
    fn formats_nine_digit_paths(#[case] sequence: u64, #[case] expected: &str) {
        let locator = Locator::new(sequence).expect("in range");
        assert_eq!(locator.to_string(), expected);
    }

    #[rstest]
    fn last_unit_has_no_successor() {
        let last = Locator::new(MAX_SEQUENCE).expect("in range");
        assert!(matches!(
            last.next(),
            Err(ReplicationError::SequenceOutOfRange { sequence }) if sequence == MAX_SEQUENCE + 1
        ));
    }

    #[rstest]
    fn rejects_sequences_past_the_layout() {
        assert!(matches!(
            Locator::new(MAX_SEQUENCE + 1),
            Err(ReplicationError::SequenceOutOfRange { .. })
        ));
        let last = Locator::new(MAX_SEQUENCE).expect("in range");
        assert!(last.next().is_err());
    }

    #[rstest]
    fn next_advances_by_one() {
        let locator = Locator::new(999).expect("in range").next().expect("next");
        assert_eq!(locator.to_string(), "000/001/000");
    }

    #[rstest]
    fn parses_state_without_timestamp() {
        let state = RemoteState::parse("sequenceNumber = 42\n", "test").expect("valid");
        assert_eq!(
            state,
            RemoteState {
                sequence: 42,
                timestamp: None
            }
        );
    }

    #[rstest]
    #[case::missing("timestamp=2024-03-02T12\\:00\\:00Z\n")]
    #[case::not_a_number("sequenceNumber=latest\n")]
    #[case::bad_timestamp("sequenceNumber=1\ntimestamp=yesterday\n")]
    #[case::past_the_layout("sequenceNumber=1000000000\n")]
    #[case::u64_max("sequenceNumber=18446744073709551615\n")]
    #[case::past_u64("sequenceNumber=18446744073709551616\n")]
    fn rejects_malformed_state(#[case] text: &str) {
        let err = RemoteState::parse(text, "mirror/state.txt").expect_err("malformed");
        match err {
            ReplicationError::InvalidState { location, .. } => {
                assert_eq!(location, "mirror/state.txt");
            }
            other => panic!("expected invalid state, got {other:?}"),
        }
    }
}
