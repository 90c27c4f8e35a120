//! Test helpers for composing on-disk extracts, change files and mirrors.

use std::fs;

use camino::Utf8PathBuf;
use quadosm_data::{Locator, test_support::gzip};
use serde_json::Value;
use tempfile::TempDir;

pub(super) const EXTRACT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osm version="0.6" generator="quadosm-tests">
  <node id="1" version="1" timestamp="2024-03-01T12:00:00Z" lat="51.4769" lon="-0.0005"/>
  <node id="2" version="1" timestamp="2024-03-01T12:00:00Z" lat="51.4772" lon="0.0001"/>
  <node id="3" version="1" timestamp="2024-03-01T12:00:00Z" lat="51.4776" lon="0.0008">
    <tag k="amenity" v="bench"/>
  </node>
  <way id="100" version="1" timestamp="2024-03-01T12:00:00Z">
    <nd ref="1"/><nd ref="2"/><nd ref="3"/>
    <tag k="highway" v="footway"/>
  </way>
  <relation id="200" version="1" timestamp="2024-03-01T12:00:00Z">
    <member type="way" ref="100" role="outer"/>
  </relation>
</osm>"#;

pub(super) const DELETE_BENCH: &str = r#"<osmChange version="0.6">
  <delete>
    <node id="3" version="2" timestamp="2024-03-02T08:00:00Z"/>
  </delete>
</osmChange>"#;

/// A scratch directory holding inputs and the database.
#[derive(Debug)]
pub(super) struct Workspace {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    pub(super) fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 workspace");
        Self { _dir: dir, root }
    }

    pub(super) fn path(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name)
    }

    pub(super) fn database(&self) -> Utf8PathBuf {
        self.path("store/quadosm.db")
    }

    pub(super) fn write(&self, name: &str, bytes: &[u8]) -> Utf8PathBuf {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent directory");
        }
        fs::write(&path, bytes).expect("write workspace file");
        path
    }

    /// Publish `document` as a gzipped unit of the mirror under `mirror/`.
    pub(super) fn publish_unit(&self, sequence: u64, document: &str) {
        let locator = Locator::new(sequence).expect("in range");
        self.write(
            &format!("mirror/{}", locator.change_path()),
            &gzip(document.as_bytes()),
        );
    }
}

/// A change creating node `id`.
pub(super) fn create_node(id: i64, lat: f64, lon: f64) -> String {
    format!(
        r#"<osmChange version="0.6"><create><node id="{id}" version="1" timestamp="2024-03-03T10:00:00Z" lat="{lat}" lon="{lon}"/></create></osmChange>"#
    )
}

pub(super) fn json(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("command output should be JSON")
}

pub(super) fn ids(value: &Value, list: &str) -> Vec<i64> {
    value[list]
        .as_array()
        .unwrap_or_else(|| panic!("expected a {list} array in {value}"))
        .iter()
        .map(|element| element["id"].as_i64().expect("numeric id"))
        .collect()
}
