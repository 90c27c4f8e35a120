//! Fixtures for exercising replication without a network.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    future::Future,
    io::Write,
};

use async_trait::async_trait;
use flate2::{Compression, write::GzEncoder};

use crate::replication::{HEAD_STATE_PATH, Locator, ReplicationSource, TransportError};

/// Drive `future` to completion on a single-threaded runtime with timers.
///
/// # Panics
///
/// Panics when the runtime cannot be built.
pub fn block_on_for_tests<F: Future>(future: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap_or_else(|err| panic!("failed to build test runtime: {err}"));
    runtime.block_on(future)
}

/// Gzip `bytes` the way feeds publish change units.
///
/// # Panics
///
/// Panics if writing to the in-memory encoder fails.
#[must_use]
pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .unwrap_or_else(|err| panic!("gzip failed: {err}"));
    encoder
        .finish()
        .unwrap_or_else(|err| panic!("gzip failed: {err}"))
}

/// In-memory feed keyed by path.
///
/// Missing documents answer [`TransportError::NotFound`]. Paths registered
/// with [`StubSource::with_transient_failures`] answer
/// [`TransportError::Network`] that many times before succeeding.
#[derive(Debug, Default)]
pub struct StubSource {
    documents: BTreeMap<String, Vec<u8>>,
    failures: RefCell<BTreeMap<String, u32>>,
    requests: RefCell<Vec<String>>,
}

impl StubSource {
    /// An empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `document` (uncompressed osmChange XML) as unit `sequence`.
    ///
    /// # Panics
    ///
    /// Panics when `sequence` is out of range.
    #[must_use]
    pub fn with_unit(mut self, sequence: u64, document: &str) -> Self {
        let locator = Locator::new(sequence)
            .unwrap_or_else(|err| panic!("invalid test sequence: {err}"));
        self.documents
            .insert(locator.change_path(), gzip(document.as_bytes()));
        self
    }

    /// Publish raw bytes at `path`.
    #[must_use]
    pub fn with_document(mut self, path: &str, bytes: Vec<u8>) -> Self {
        self.documents.insert(path.to_owned(), bytes);
        self
    }

    /// Publish a head `state.txt` naming `sequence`.
    #[must_use]
    pub fn with_state(self, sequence: u64) -> Self {
        let text = format!(
            "#Sat Mar 02 12:00:02 UTC 2024\nsequenceNumber={sequence}\ntimestamp=2024-03-02T12\\:00\\:00Z\n"
        );
        self.with_document(HEAD_STATE_PATH, text.into_bytes())
    }

    /// Fail the next `count` fetches of `path` with a network error.
    #[must_use]
    pub fn with_transient_failures(self, path: &str, count: u32) -> Self {
        self.failures.borrow_mut().insert(path.to_owned(), count);
        self
    }

    /// Every path requested so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        self.requests.borrow().clone()
    }
}

#[async_trait(?Send)]
impl ReplicationSource for StubSource {
    fn location(&self) -> &str {
        "stub://feed/"
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        self.requests.borrow_mut().push(path.to_owned());
        let url = format!("stub://feed/{path}");
        if let Some(remaining) = self.failures.borrow_mut().get_mut(path)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(TransportError::Network {
                url,
                source: std::io::Error::other("connection reset"),
            });
        }
        self.documents
            .get(path)
            .cloned()
            .ok_or(TransportError::NotFound { location: url })
    }
}
