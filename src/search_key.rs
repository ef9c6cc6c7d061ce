//! Unique, human readable keys per record.
//!
//! Keys are compared after Unicode compatibility normalization and lowercasing, so `"ABC"`,
//! `"abc"` and the full-width `"ＡＢＣ"` all collide. The original spelling is kept for display.

use std::collections::{BTreeMap, HashMap};
use unicode_normalization::UnicodeNormalization;

use crate::{error::GraphError, properties::RecordId};

/// Fold a key for comparison: trim, NFKC normalize, lowercase.
pub fn fold_key(key: &str) -> String {
    key.trim().nfkc().collect::<String>().to_lowercase()
}

#[derive(Debug, Clone)]
pub struct SearchKeyIndex {
    min_len: usize,
    /// folded key -> (owner, key as entered)
    by_key: BTreeMap<String, (RecordId, String)>,
    /// owner -> folded key
    by_record: HashMap<RecordId, String>,
}

impl SearchKeyIndex {
    pub fn new(min_len: usize) -> Self {
        SearchKeyIndex {
            min_len,
            by_key: BTreeMap::new(),
            by_record: HashMap::new(),
        }
    }

    pub fn min_len(&self) -> usize {
        self.min_len
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Validate `key` for `id` without changing the index. Returns the trimmed key, or `None` when
    /// the key is empty and would clear the entry.
    pub fn check(&self, id: RecordId, key: &str) -> Result<Option<String>, GraphError> {
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if id.is_sentinel() {
            return Err(GraphError::Protected(format!(
                "{id} cannot carry a search key"
            )));
        }
        if trimmed.chars().count() < self.min_len {
            return Err(GraphError::SearchKeyTooShort {
                key: trimmed.to_string(),
                min: self.min_len,
            });
        }
        if let Some((owner, _)) = self.by_key.get(&fold_key(trimmed)) {
            if *owner != id {
                return Err(GraphError::SearchKeyDuplicate {
                    key: trimmed.to_string(),
                    owner: owner.to_string(),
                });
            }
        }
        Ok(Some(trimmed.to_string()))
    }

    /// Assign `key` to `id`, replacing its previous key. An empty key clears the entry. Returns the
    /// key the record held before.
    pub fn set(&mut self, id: RecordId, key: &str) -> Result<Option<String>, GraphError> {
        let checked = self.check(id, key)?;
        let previous = self.remove(id);
        if let Some(trimmed) = checked {
            let folded = fold_key(&trimmed);
            self.by_record.insert(id, folded.clone());
            self.by_key.insert(folded, (id, trimmed));
        }
        Ok(previous)
    }

    /// Drop the entry of `id`, returning the key as entered.
    pub fn remove(&mut self, id: RecordId) -> Option<String> {
        let folded = self.by_record.remove(&id)?;
        self.by_key.remove(&folded).map(|(_, key)| key)
    }

    pub fn lookup(&self, key: &str) -> Option<RecordId> {
        self.by_key.get(&fold_key(key)).map(|(owner, _)| *owner)
    }

    pub fn key_of(&self, id: RecordId) -> Option<&str> {
        let folded = self.by_record.get(&id)?;
        self.by_key.get(folded).map(|(_, key)| key.as_str())
    }

    /// Every entry whose folded key starts with the folded `prefix`, in key-sorted order.
    pub fn prefix<'a>(&'a self, prefix: &str) -> impl Iterator<Item = (&'a str, RecordId)> + 'a {
        let folded = fold_key(prefix);
        self.by_key
            .range(folded.clone()..)
            .take_while(move |(k, _)| k.starts_with(&folded))
            .map(|(_, (owner, key))| (key.as_str(), *owner))
    }

    /// All entries in key-sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, RecordId)> {
        self.by_key.values().map(|(owner, key)| (key.as_str(), *owner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::RecordType;
    use test_log::test;

    fn person(n: u32) -> RecordId {
        RecordId::new(RecordType::Person, n)
    }

    #[test]
    fn test_short_then_valid_then_case_insensitive_duplicate() {
        let mut index = SearchKeyIndex::new(3);
        assert!(matches!(
            index.set(person(2), "ab"),
            Err(GraphError::SearchKeyTooShort { min: 3, .. })
        ));
        index.set(person(2), "abc").unwrap();
        assert!(matches!(
            index.set(person(3), "ABC"),
            Err(GraphError::SearchKeyDuplicate { .. })
        ));
        assert_eq!(index.lookup("aBc"), Some(person(2)));
        assert_eq!(index.key_of(person(3)), None);
    }

    #[test]
    fn test_compatibility_forms_collide() {
        let mut index = SearchKeyIndex::new(3);
        index.set(person(2), "ABC").unwrap();
        assert_eq!(index.lookup("\u{FF41}\u{FF42}\u{FF43}"), Some(person(2)));
    }

    #[test]
    fn test_empty_key_clears_and_owner_may_reassign() {
        let mut index = SearchKeyIndex::new(3);
        index.set(person(2), "  smith ").unwrap();
        assert_eq!(index.key_of(person(2)), Some("smith"));
        // Re-setting the same key in another case is not a duplicate for its owner
        assert_eq!(
            index.set(person(2), "Smith").unwrap(),
            Some("smith".to_string())
        );
        index.set(person(2), "   ").unwrap();
        assert!(index.is_empty());
        index.set(person(3), "smith").unwrap();
    }

    #[test]
    fn test_prefix_is_key_sorted() {
        let mut index = SearchKeyIndex::new(3);
        index.set(person(2), "smithson").unwrap();
        index.set(person(3), "Smith").unwrap();
        index.set(person(4), "jones").unwrap();
        index.set(person(5), "smyth").unwrap();

        let hits: Vec<_> = index.prefix("SMI").collect();
        assert_eq!(hits, vec![("Smith", person(3)), ("smithson", person(2))]);
    }

    #[test]
    fn test_sentinel_rejected() {
        let mut index = SearchKeyIndex::new(3);
        let root = RecordId::new(RecordType::Folder, 1);
        assert!(matches!(
            index.set(root, "root"),
            Err(GraphError::Protected(_))
        ));
    }
}
