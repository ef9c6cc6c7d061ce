//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use recgraph_core::Database;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times, subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

#[allow(dead_code)]
pub const PEOPLE: &str = r#"version = 3

[[person]]
id = 4
key = "darwin"
name = "Charles Darwin"
deceased = "yes"
key_work = 7

[[person]]
id = 5
key = "wallace"
name = "Alfred Russel Wallace"
affiliation = { id = 2, role = "fellow" }

[[institution]]
id = 2
key = "royal"
name = "Royal Society"
city = "London"
"#;

#[allow(dead_code)]
pub const LIBRARY: &str = r#"version = 3

[[work]]
id = 7
key = "origin"
title = "On the Origin of Species"
year = "1859"
peer_reviewed = "no"
author = [{ id = 4, position = 1 }]

[[work]]
id = 8
title = "Letters"
text = "A reply to darwin."
author = 5
cites = [7]

[[note]]
id = 3
title = "Reading notes"
text = "Compare with wallace."
folder = 2
about = { id = 7, page = 12 }
"#;

#[allow(dead_code)]
pub const FOLDERS: &str = r#"version = 3

[[folder]]
id = 2
name = "Reading"
parent = 1
"#;

/// Write a small database directory: two people and an institution, two works citing each other
/// across documents, a note and the folder holding it.
///
/// Returns the path to the database directory (e.g. `<temp_dir>/library/`).
#[allow(dead_code)]
pub fn create_test_library(temp_dir: &TempDir) -> PathBuf {
    let dir = temp_dir.path().join("library");
    std::fs::create_dir(&dir).unwrap();
    write_documents(&dir, PEOPLE, LIBRARY, FOLDERS);
    dir
}

#[allow(dead_code)]
pub fn write_documents(dir: &Path, people: &str, library: &str, folders: &str) {
    std::fs::write(dir.join("people.toml"), people).unwrap();
    std::fs::write(dir.join("library.toml"), library).unwrap();
    std::fs::write(dir.join("folders.toml"), folders).unwrap();
}

/// Assert that two databases hold the same records, attributes, text and edges.
#[allow(dead_code)]
pub fn assert_same_graph(left: &Database, right: &Database) {
    assert_eq!(left.len(), right.len(), "record counts differ");
    for store in left.stores() {
        for record in store.iter() {
            let other = right
                .get(record.id())
                .unwrap_or_else(|| panic!("{} missing on the right", record.id()));
            assert_eq!(record.search_key(), other.search_key(), "{}", record.id());
            assert_eq!(record.attrs(), other.attrs(), "{}", record.id());
            assert_eq!(record.text(), other.text(), "{}", record.id());
            assert_eq!(record.united(), other.united(), "{}", record.id());
        }
    }
    for set in left.relations() {
        let mine: Vec<_> = set.edges().map(|(s, o, a)| (s, o, a.clone())).collect();
        let theirs: Vec<_> = right
            .relation(set.kind())
            .edges()
            .map(|(s, o, a)| (s, o, a.clone()))
            .collect();
        assert_eq!(mine, theirs, "{} edges differ", set.kind());
    }
}
