use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, fs, path::Path};

use crate::error::GraphError;

pub const CHECKSUM_FILE: &str = "checksums.toml";

/// SHA-256 of `content`, lowercase hex.
pub fn checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// The `checksums.toml` document: file name -> checksum of the content this application last wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumBook {
    #[serde(default)]
    pub documents: BTreeMap<String, String>,
}

impl ChecksumBook {
    pub fn read(dir: &Path) -> Result<ChecksumBook, GraphError> {
        let path = dir.join(CHECKSUM_FILE);
        if !path.exists() {
            return Ok(ChecksumBook::default());
        }
        let content = fs::read_to_string(&path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn render(&self) -> Result<String, GraphError> {
        Ok(toml::to_string(self)?)
    }

    /// Names of the documents in `current` whose content differs from what was recorded.
    pub fn modified<'a>(&self, current: &'a BTreeMap<String, String>) -> Vec<&'a str> {
        current
            .iter()
            .filter(|(name, sum)| {
                self.documents
                    .get(name.as_str())
                    .is_some_and(|recorded| recorded != *sum)
            })
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
