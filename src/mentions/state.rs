use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    error::GraphError,
    mentions::scan::{key_regex, KeyMatcher, PlainText},
    properties::RecordId,
    richtext::RichText,
    search_key::fold_key,
};

/// Everything a full build needs, copied out of the database on the writer's thread.
#[derive(Debug, Clone, Default)]
pub struct MentionSnapshot {
    /// Rich field markup per mentioner
    pub texts: Vec<(RecordId, Vec<String>)>,
    /// Search keys of mention targets
    pub keys: Vec<(RecordId, String)>,
    /// (mentioner, target) per structural edge; repeated pairs count separately
    pub structural: Vec<(RecordId, RecordId)>,
    /// Every online record. Explicit links only count toward these.
    pub live: BTreeSet<RecordId>,
}

/// One incremental change. Text and key updates carry absolute values, structural updates a
/// delta, so replaying a queue on top of a snapshot build yields the live result.
#[derive(Debug, Clone, PartialEq)]
pub enum MentionUpdate {
    Added(RecordId),
    Text(RecordId, PlainText),
    Key(RecordId, Option<String>),
    Structural(RecordId, RecordId, i32),
    Removed(RecordId),
}

#[derive(Debug, Clone, Default)]
pub struct MentionState {
    min_key_len: usize,
    live: BTreeSet<RecordId>,
    /// target -> folded key
    keys: BTreeMap<RecordId, String>,
    plain: BTreeMap<RecordId, PlainText>,
    /// mentioner -> targets found in its own text
    textual: BTreeMap<RecordId, BTreeSet<RecordId>>,
    /// target -> mentioners through text
    text_postings: BTreeMap<RecordId, BTreeSet<RecordId>>,
    /// target -> mentioner -> number of structural edges
    struct_postings: BTreeMap<RecordId, BTreeMap<RecordId, u32>>,
    matcher: Option<KeyMatcher>,
}

impl PartialEq for MentionState {
    fn eq(&self, other: &Self) -> bool {
        self.keys == other.keys
            && self.live == other.live
            && self.textual == other.textual
            && self.text_postings == other.text_postings
            && self.struct_postings == other.struct_postings
    }
}

impl MentionState {
    pub fn new(min_key_len: usize) -> Self {
        MentionState {
            min_key_len,
            ..Default::default()
        }
    }

    /// Build from scratch. Returns `Ok(None)` when `cancel` was raised before the build finished.
    pub fn build(
        snapshot: &MentionSnapshot,
        rich: &dyn RichText,
        min_key_len: usize,
        cancel: &AtomicBool,
    ) -> Result<Option<MentionState>, GraphError> {
        let mut state = MentionState::new(min_key_len);
        state.live = snapshot.live.clone();
        for (target, key) in snapshot.keys.iter() {
            let folded = fold_key(key);
            if folded.chars().count() >= min_key_len {
                state.keys.insert(*target, folded);
            }
        }
        let matcher = state.matcher()?;
        for (mentioner, fields) in snapshot.texts.iter() {
            if cancel.load(Ordering::Relaxed) {
                tracing::debug!("[MentionState::build] cancelled at {mentioner}");
                return Ok(None);
            }
            let plain = PlainText::extract(rich, fields);
            let mut found = matcher.scan(*mentioner, &plain);
            found.retain(|t| state.live.contains(t) || state.keys.contains_key(t));
            for target in found.iter() {
                state
                    .text_postings
                    .entry(*target)
                    .or_default()
                    .insert(*mentioner);
            }
            if !found.is_empty() {
                state.textual.insert(*mentioner, found);
            }
            if !plain.is_empty() {
                state.plain.insert(*mentioner, plain);
            }
        }
        for (mentioner, target) in snapshot.structural.iter() {
            state.structural(*mentioner, *target, 1);
        }
        Ok(Some(state))
    }

    fn matcher(&mut self) -> Result<KeyMatcher, GraphError> {
        if let Some(matcher) = &self.matcher {
            return Ok(matcher.clone());
        }
        let matcher = KeyMatcher::new(self.keys.iter().map(|(id, k)| (*id, k.as_str())))?;
        self.matcher = Some(matcher.clone());
        Ok(matcher)
    }

    pub fn apply(&mut self, update: &MentionUpdate) -> Result<(), GraphError> {
        match update {
            MentionUpdate::Added(id) => {
                self.add(*id);
                Ok(())
            }
            MentionUpdate::Text(id, plain) => self.set_text(*id, plain.clone()),
            MentionUpdate::Key(id, key) => self.set_key(*id, key.as_deref()),
            MentionUpdate::Structural(m, t, delta) => {
                self.structural(*m, *t, *delta);
                Ok(())
            }
            MentionUpdate::Removed(id) => {
                self.remove(*id);
                Ok(())
            }
        }
    }

    fn unlink_textual(&mut self, mentioner: RecordId) {
        if let Some(targets) = self.textual.remove(&mentioner) {
            for target in targets {
                if let Some(postings) = self.text_postings.get_mut(&target) {
                    postings.remove(&mentioner);
                    if postings.is_empty() {
                        self.text_postings.remove(&target);
                    }
                }
            }
        }
    }

    /// Register a record that came online. Cached texts already linking to it start counting.
    pub fn add(&mut self, id: RecordId) {
        if !self.live.insert(id) {
            return;
        }
        let linking: Vec<RecordId> = self
            .plain
            .iter()
            .filter(|(m, p)| **m != id && p.links.contains(&id))
            .map(|(m, _)| *m)
            .collect();
        for mentioner in linking {
            self.textual.entry(mentioner).or_default().insert(id);
            self.text_postings.entry(id).or_default().insert(mentioner);
        }
    }

    /// Recompute the textual contribution of one mentioner.
    pub fn set_text(&mut self, mentioner: RecordId, plain: PlainText) -> Result<(), GraphError> {
        self.unlink_textual(mentioner);
        let mut found = self.matcher()?.scan(mentioner, &plain);
        found.retain(|t| self.live.contains(t) || self.keys.contains_key(t));
        for target in found.iter() {
            self.text_postings
                .entry(*target)
                .or_default()
                .insert(mentioner);
        }
        if !found.is_empty() {
            self.textual.insert(mentioner, found);
        }
        if plain.is_empty() {
            self.plain.remove(&mentioner);
        } else {
            self.plain.insert(mentioner, plain);
        }
        Ok(())
    }

    /// Change the key of one target, rescanning the cached texts for that key only.
    pub fn set_key(&mut self, target: RecordId, key: Option<&str>) -> Result<(), GraphError> {
        let folded = key
            .map(fold_key)
            .filter(|k| k.chars().count() >= self.min_key_len);
        if self.keys.get(&target) == folded.as_ref() {
            return Ok(());
        }
        self.matcher = None;
        match &folded {
            Some(k) => self.keys.insert(target, k.clone()),
            None => self.keys.remove(&target),
        };
        let pattern = folded.as_deref().map(key_regex).transpose()?;

        let mut mentioners = BTreeSet::new();
        for (mentioner, plain) in self.plain.iter() {
            if *mentioner == target {
                continue;
            }
            let by_key = pattern
                .as_ref()
                .map(|r| r.is_match(&plain.folded))
                .unwrap_or(false);
            if by_key || (plain.links.contains(&target) && self.live.contains(&target)) {
                mentioners.insert(*mentioner);
            }
        }

        let previous = self.text_postings.remove(&target).unwrap_or_default();
        for gone in previous.difference(&mentioners) {
            if let Some(targets) = self.textual.get_mut(gone) {
                targets.remove(&target);
                if targets.is_empty() {
                    self.textual.remove(gone);
                }
            }
        }
        for added in mentioners.iter() {
            self.textual.entry(*added).or_default().insert(target);
        }
        if !mentioners.is_empty() {
            self.text_postings.insert(target, mentioners);
        }
        Ok(())
    }

    pub fn structural(&mut self, mentioner: RecordId, target: RecordId, delta: i32) {
        if mentioner == target {
            return;
        }
        let postings = self.struct_postings.entry(target).or_default();
        let count = postings.entry(mentioner).or_insert(0);
        let updated = (*count as i64 + delta as i64).max(0) as u32;
        if updated == 0 {
            postings.remove(&mentioner);
        } else {
            *count = updated;
        }
        if postings.is_empty() {
            self.struct_postings.remove(&target);
        }
    }

    /// Forget `id` as mentioner and as target.
    pub fn remove(&mut self, id: RecordId) {
        self.live.remove(&id);
        self.unlink_textual(id);
        self.plain.remove(&id);
        if self.keys.remove(&id).is_some() {
            self.matcher = None;
        }
        if let Some(mentioners) = self.text_postings.remove(&id) {
            for mentioner in mentioners {
                if let Some(targets) = self.textual.get_mut(&mentioner) {
                    targets.remove(&id);
                    if targets.is_empty() {
                        self.textual.remove(&mentioner);
                    }
                }
            }
        }
        self.struct_postings.remove(&id);
        self.struct_postings.retain(|_, postings| {
            postings.remove(&id);
            !postings.is_empty()
        });
    }

    pub fn mentions(&self, mentioner: RecordId, target: RecordId, own_text_only: bool) -> bool {
        let textual = self
            .textual
            .get(&mentioner)
            .map(|t| t.contains(&target))
            .unwrap_or(false);
        if textual || own_text_only {
            return textual;
        }
        self.struct_postings
            .get(&target)
            .map(|p| p.contains_key(&mentioner))
            .unwrap_or(false)
    }

    pub fn mentioner_set(&self, target: RecordId) -> BTreeSet<RecordId> {
        let mut set = self.text_postings.get(&target).cloned().unwrap_or_default();
        if let Some(postings) = self.struct_postings.get(&target) {
            set.extend(postings.keys().copied());
        }
        set
    }

    pub fn targets(&self) -> BTreeSet<RecordId> {
        self.text_postings
            .keys()
            .chain(self.struct_postings.keys())
            .copied()
            .collect()
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

    fn work(n: u32) -> RecordId {
        RecordId::new(RecordType::Work, n)
    }

    fn plain(text: &str) -> PlainText {
        PlainText::extract(&MarkdownText, &[text.to_string()])
    }

    #[test]
    fn test_incremental_matches_full_build() {
        let snapshot = MentionSnapshot {
            texts: vec![
                (work(1), vec!["Written with *Jones*".to_string()]),
                (work(2), vec!["Nothing here".to_string()]),
            ],
            keys: vec![(person(2), "Smith".to_string()), (person(3), "jones".to_string())],
            structural: vec![(work(2), person(2))],
            live: BTreeSet::from([work(1), work(2), person(2), person(3)]),
        };
        let cancel = AtomicBool::new(false);
        let full = MentionState::build(&snapshot, &MarkdownText, 3, &cancel)
            .unwrap()
            .unwrap();

        let mut incremental = MentionState::new(3);
        for id in [work(1), work(2), person(2), person(3)] {
            incremental.add(id);
        }
        incremental.set_text(work(1), plain("Written with *Jones*")).unwrap();
        incremental.set_text(work(2), plain("Nothing here")).unwrap();
        incremental.structural(work(2), person(2), 1);
        // Keys arriving after the texts are found by rescanning the cached text
        incremental.set_key(person(3), Some("jones")).unwrap();
        incremental.set_key(person(2), Some("Smith")).unwrap();

        assert_eq!(full, incremental);
        assert_eq!(full.mentioner_set(person(3)), BTreeSet::from([work(1)]));
        assert_eq!(full.mentioner_set(person(2)), BTreeSet::from([work(2)]));
        assert!(!full.mentions(work(2), person(2), true));
        assert!(full.mentions(work(2), person(2), false));
    }

    #[test]
    fn test_key_change_moves_mentions() {
        let mut state = MentionState::new(3);
        state.set_key(person(2), Some("smith")).unwrap();
        state.set_text(work(1), plain("smith and jones")).unwrap();
        assert!(state.mentions(work(1), person(2), true));

        state.set_key(person(2), Some("brown")).unwrap();
        assert!(!state.mentions(work(1), person(2), true));
        state.set_key(person(3), Some("jones")).unwrap();
        assert!(state.mentions(work(1), person(3), true));

        // Below the minimum length the key is not looked for
        state.set_key(person(3), Some("jo")).unwrap();
        assert!(state.mentioner_set(person(3)).is_empty());
    }

    #[test]
    fn test_remove_drops_both_roles() {
        let mut state = MentionState::new(3);
        state.set_key(person(2), Some("smith")).unwrap();
        state.set_text(work(1), plain("smith")).unwrap();
        state.structural(person(2), work(1), 1);
        state.structural(person(2), work(1), 1);
        state.structural(person(2), work(1), -1);
        assert!(state.mentions(person(2), work(1), false));

        state.remove(person(2));
        assert!(state.mentioner_set(person(2)).is_empty());
        assert!(state.mentioner_set(work(1)).is_empty());
        assert!(state.targets().is_empty());
    }

    #[test]
    fn test_links_count_once_target_is_live() {
        let mut state = MentionState::new(3);
        state.add(work(1));
        state
            .set_text(work(1), plain("see [it](rec:work:2)"))
            .unwrap();
        assert!(state.mentioner_set(work(2)).is_empty());

        state.add(work(2));
        assert_eq!(state.mentioner_set(work(2)), BTreeSet::from([work(1)]));
        state.remove(work(2));
        assert!(state.mentioner_set(work(2)).is_empty());
    }

    #[test]
    fn test_cancelled_build_returns_none() {
        let snapshot = MentionSnapshot {
            texts: vec![(work(1), vec!["text".to_string()])],
            ..Default::default()
        };
        let cancel = AtomicBool::new(true);
        assert!(MentionState::build(&snapshot, &MarkdownText, 3, &cancel)
            .unwrap()
            .is_none());
    }
}
