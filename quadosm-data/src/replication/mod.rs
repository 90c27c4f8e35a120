//! Incremental replication from an osmChange feed.
//!
//! A feed publishes gzip-compressed change units under nine-digit
//! `AAA/BBB/CCC` paths together with a head `state.txt`. The
//! [`ReplicationDriver`] keeps the next sequence to apply in the store and
//! advances it one fully-applied unit at a time.

mod directory;
mod driver;
mod error;
mod locator;
mod source;

pub use directory::DirectoryReplicationSource;
pub use driver::{
    HEAD_STATE_PATH, ReplicationConfig, ReplicationDriver, ReplicationReport, RetryPolicy,
    StopReason,
};
pub use error::{ReplicationError, TransportError};
pub use locator::{Locator, MAX_SEQUENCE, RemoteState};
pub use source::{DEFAULT_TIMEOUT, DEFAULT_USER_AGENT, HttpReplicationSource, ReplicationSource};
