//! Error types produced by the replication driver and its sources.

use std::io;

use quadosm_core::StoreError;
use thiserror::Error;

use crate::applier::ApplyError;

/// Errors raised while following a replication feed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReplicationError {
    /// The sequence number does not fit the nine-digit path layout.
    #[error("sequence {sequence} exceeds the replication path layout")]
    SequenceOutOfRange {
        /// Offending sequence number.
        sequence: u64,
    },
    /// No replication marker has been persisted yet.
    #[error("replication has not been initialised; choose a start sequence first")]
    NotInitialised,
    /// A `state.txt` document could not be read.
    #[error("invalid replication state at {location}: {reason}")]
    InvalidState {
        /// Where the document came from.
        location: String,
        /// What was wrong with it.
        reason: String,
    },
    /// Fetching a document failed outside the main loop.
    #[error("failed to fetch {path}: {source}")]
    Fetch {
        /// Path below the feed root.
        path: String,
        /// Transport failure.
        #[source]
        source: TransportError,
    },
    /// A change unit is not valid gzip.
    #[error("failed to decompress change unit {sequence}: {source}")]
    Decompress {
        /// Sequence of the unit.
        sequence: u64,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A change unit could not be applied; the marker was not advanced.
    #[error("failed to apply change unit {sequence}: {source}")]
    Apply {
        /// Sequence of the unit.
        sequence: u64,
        /// Applier failure.
        #[source]
        source: ApplyError,
    },
    /// Reading or saving the replication marker failed.
    #[error("failed to access the replication marker: {source}")]
    Store {
        /// Source error returned by the store.
        #[from]
        source: StoreError,
    },
}

/// Transport-level errors encountered while fetching feed documents.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The server returned an HTTP error status.
    #[error("request to {url} failed with status {status}: {message}")]
    Http {
        /// Fully qualified request URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Short error description supplied by the server.
        message: String,
    },
    /// The request failed due to an I/O error.
    #[error("network error contacting {url}: {source}")]
    Network {
        /// Fully qualified request URL.
        url: String,
        /// I/O error reported by the transport.
        source: io::Error,
    },
    /// A local mirror has no document at the requested path.
    #[error("{location} does not exist")]
    NotFound {
        /// Full path of the missing document.
        location: String,
    },
    /// Reading a local mirror failed.
    #[error("failed to read {location}: {source}")]
    Io {
        /// Full path of the document.
        location: String,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// The feed URL is not valid.
    #[error("invalid replication URL {url}: {source}")]
    InvalidUrl {
        /// Offending URL.
        url: String,
        /// Parse failure.
        source: url::ParseError,
    },
    /// The HTTP client could not be constructed.
    #[error("failed to build the HTTP client: {source}")]
    Client {
        /// Source error returned by `reqwest`.
        source: reqwest::Error,
    },
}

impl TransportError {
    /// Whether the document simply has not been published yet.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Http { status: 404, .. }
        )
    }
}
