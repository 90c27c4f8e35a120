//! Replication feed mirrored on the local filesystem.

use std::io;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8};

use super::{ReplicationSource, TransportError};

/// A directory holding the same `AAA/BBB/CCC.osc.gz` layout as a remote
/// feed, read through a capability handle on its root.
#[derive(Debug)]
pub struct DirectoryReplicationSource {
    root: Utf8PathBuf,
    location: String,
    dir: fs_utf8::Dir,
}

impl DirectoryReplicationSource {
    /// Open the mirror rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotFound`] when `root` does not exist and
    /// [`TransportError::Io`] when it cannot be opened.
    pub fn open(root: &Utf8Path) -> Result<Self, TransportError> {
        let dir = fs_utf8::Dir::open_ambient_dir(root, ambient_authority())
            .map_err(|source| io_error(root.as_str(), source))?;
        Ok(Self {
            root: root.to_path_buf(),
            location: root.to_string(),
            dir,
        })
    }

    /// Root of the mirror.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }
}

#[async_trait(?Send)]
impl ReplicationSource for DirectoryReplicationSource {
    fn location(&self) -> &str {
        &self.location
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        self.dir
            .read(path)
            .map_err(|source| io_error(self.root.join(path).as_str(), source))
    }
}

fn io_error(location: &str, source: io::Error) -> TransportError {
    if source.kind() == io::ErrorKind::NotFound {
        TransportError::NotFound {
            location: location.to_owned(),
        }
    } else {
        TransportError::Io {
            location: location.to_owned(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::block_on_for_tests;
    use rstest::{fixture, rstest};
    use std::fs;
    use tempfile::TempDir;

    #[fixture]
    fn mirror() -> TempDir {
        let dir = TempDir::new().expect("failed to create temporary directory");
        let unit = dir.path().join("000/000");
        fs::create_dir_all(&unit).expect("create unit directory");
        fs::write(unit.join("001.osc.gz"), b"unit one").expect("write unit");
        fs::write(dir.path().join("state.txt"), b"sequenceNumber=1\n").expect("write state");
        dir
    }

    fn open(dir: &TempDir) -> DirectoryReplicationSource {
        let root = Utf8Path::from_path(dir.path()).expect("utf-8 temp path");
        DirectoryReplicationSource::open(root).expect("open mirror")
    }

    #[rstest]
    fn reads_nested_documents(mirror: TempDir) {
        let source = open(&mirror);
        let bytes = block_on_for_tests(source.fetch("000/000/001.osc.gz")).expect("fetch unit");
        assert_eq!(bytes, b"unit one");
        let state = block_on_for_tests(source.fetch("state.txt")).expect("fetch state");
        assert_eq!(state, b"sequenceNumber=1\n");
    }

    #[rstest]
    fn missing_units_are_not_found(mirror: TempDir) {
        let source = open(&mirror);
        let err = block_on_for_tests(source.fetch("000/000/002.osc.gz")).expect_err("gap");
        assert!(err.is_not_found(), "{err:?}");
        let TransportError::NotFound { location } = err else {
            panic!("expected not found");
        };
        assert!(location.ends_with("000/000/002.osc.gz"));
    }

    #[rstest]
    fn missing_roots_are_not_found(mirror: TempDir) {
        let root = Utf8Path::from_path(mirror.path()).expect("utf-8 temp path").join("absent");
        let err = DirectoryReplicationSource::open(&root).expect_err("no such mirror");
        assert!(err.is_not_found());
    }

    #[rstest]
    fn paths_cannot_escape_the_root(mirror: TempDir) {
        let source = open(&mirror);
        let outcome = block_on_for_tests(source.fetch("../outside.txt"));
        assert!(outcome.is_err());
    }
}
