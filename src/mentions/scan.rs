//! Text folding and key matching for the mentions index.

use regex::{Regex, RegexSet};
use std::collections::BTreeSet;
use unicode_normalization::UnicodeNormalization;

use crate::{error::GraphError, properties::RecordId, richtext::RichText};

/// Fold text for matching: NFKC normalize, lowercase. Keys are folded the same way by
/// [crate::search_key::fold_key].
pub fn fold_text(text: &str) -> String {
    text.nfkc().collect::<String>().to_lowercase()
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Whole-word pattern for a folded key. Word boundaries are only asserted on ends of the key that
/// are word characters, so keys like `"c++"` still match.
pub fn key_pattern(folded_key: &str) -> String {
    let start = match folded_key.chars().next() {
        Some(c) if is_word(c) => r"\b",
        _ => "",
    };
    let end = match folded_key.chars().last() {
        Some(c) if is_word(c) => r"\b",
        _ => "",
    };
    format!("{start}{}{end}", regex::escape(folded_key))
}

pub fn key_regex(folded_key: &str) -> Result<Regex, GraphError> {
    Ok(Regex::new(&key_pattern(folded_key))?)
}

/// The scannable form of one mentioner: folded plain text of all its rich fields plus the records
/// it links to explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlainText {
    pub folded: String,
    pub links: BTreeSet<RecordId>,
}

impl PlainText {
    pub fn extract(rich: &dyn RichText, fields: &[String]) -> PlainText {
        let mut folded = String::new();
        let mut links = BTreeSet::new();
        for markup in fields.iter() {
            if !folded.is_empty() {
                folded.push('\n');
            }
            folded.push_str(&fold_text(&rich.plain_text(markup)));
            links.extend(rich.record_links(markup));
        }
        PlainText { folded, links }
    }

    pub fn is_empty(&self) -> bool {
        self.folded.trim().is_empty() && self.links.is_empty()
    }
}

/// Every current target key compiled into one [RegexSet].
#[derive(Debug, Clone)]
pub struct KeyMatcher {
    targets: Vec<RecordId>,
    set: RegexSet,
}

impl KeyMatcher {
    /// `keys` must already be folded.
    pub fn new<'a, I>(keys: I) -> Result<KeyMatcher, GraphError>
    where
        I: IntoIterator<Item = (RecordId, &'a str)>,
    {
        let mut targets = Vec::new();
        let mut patterns = Vec::new();
        for (id, key) in keys {
            targets.push(id);
            patterns.push(key_pattern(key));
        }
        Ok(KeyMatcher {
            targets,
            set: RegexSet::new(patterns)?,
        })
    }

    /// Targets whose key occurs in `text`, excluding `mentioner` itself.
    pub fn scan(&self, mentioner: RecordId, text: &PlainText) -> BTreeSet<RecordId> {
        let mut found: BTreeSet<RecordId> = self
            .set
            .matches(&text.folded)
            .into_iter()
            .map(|i| self.targets[i])
            .collect();
        found.extend(text.links.iter().copied());
        found.remove(&mentioner);
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{properties::RecordType, richtext::MarkdownText};
    use test_log::test;

    fn person(n: u32) -> RecordId {
        RecordId::new(RecordType::Person, n)
    }

    #[test]
    fn test_whole_word_case_insensitive() {
        let matcher =
            KeyMatcher::new([(person(2), "smith"), (person(3), "c++"), (person(4), "ann")])
                .unwrap();
        let text = PlainText::extract(
            &MarkdownText,
            &["Blacksmith **SMITH** wrote about C++ with Annabel".to_string()],
        );
        let found = matcher.scan(RecordId::new(RecordType::Work, 1), &text);
        assert_eq!(found, BTreeSet::from([person(2), person(3)]));
    }

    #[test]
    fn test_links_count_and_self_is_excluded() {
        let matcher = KeyMatcher::new([(person(2), "smith")]).unwrap();
        let text = PlainText::extract(
            &MarkdownText,
            &["I am smith, see [x](rec:work:9)".to_string()],
        );
        let found = matcher.scan(person(2), &text);
        assert_eq!(found, BTreeSet::from([RecordId::new(RecordType::Work, 9)]));
    }

    #[test]
    fn test_fold_text_normalizes_compatibility_forms() {
        assert_eq!(fold_text("\u{FF33}mith"), "smith");
    }
}
