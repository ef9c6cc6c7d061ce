//! Bidirectional edge tables, one per relation type.
//!
//! A [RelationSet] stores edges between two record stores by id only. It validates types,
//! multiplicity and (for hierarchical relations) acyclicity, keeps nested edge attributes, and
//! tells its [RelationObserver]s about every connect and disconnect, synchronously and in
//! registration order. Observers only ever see `&self` and an id triple, so they cannot reach back
//! into the mutating API.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    sync::Arc,
};

use crate::{
    catalog::{RelationDef, RelationKind, SinglePolicy},
    error::GraphError,
    properties::{EdgeAttrs, RecordId},
};

/// One connect (`affirm == true`) or disconnect notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelationChange {
    pub kind: RelationKind,
    pub subject: RecordId,
    pub object: RecordId,
    pub affirm: bool,
}

pub trait RelationObserver: Send + Sync {
    fn relation_changed(&self, change: &RelationChange);
}

pub struct RelationSet {
    def: &'static RelationDef,
    edges: BTreeMap<(u32, u32), EdgeAttrs>,
    /// Objects per subject, in connection order
    by_subject: BTreeMap<u32, Vec<u32>>,
    /// Subjects per object, in connection order
    by_object: BTreeMap<u32, Vec<u32>>,
    observers: Vec<Arc<dyn RelationObserver>>,
}

impl fmt::Debug for RelationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationSet")
            .field("kind", &self.def.kind)
            .field("edges", &self.edges.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl RelationSet {
    pub fn new(kind: RelationKind) -> Self {
        RelationSet {
            def: kind.def(),
            edges: BTreeMap::new(),
            by_subject: BTreeMap::new(),
            by_object: BTreeMap::new(),
            observers: Vec::new(),
        }
    }

    pub fn kind(&self) -> RelationKind {
        self.def.kind
    }

    pub fn def(&self) -> &'static RelationDef {
        self.def
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn observe(&mut self, observer: Arc<dyn RelationObserver>) {
        self.observers.push(observer);
    }

    fn notify(&self, subject: u32, object: u32, affirm: bool) {
        let change = RelationChange {
            kind: self.def.kind,
            subject: RecordId::new(self.def.subject, subject),
            object: RecordId::new(self.def.object, object),
            affirm,
        };
        for observer in self.observers.iter() {
            observer.relation_changed(&change);
        }
    }

    fn check_types(&self, subject: RecordId, object: RecordId) -> Result<(), GraphError> {
        if subject.kind != self.def.subject || object.kind != self.def.object {
            return Err(GraphError::TypeMismatch(format!(
                "{} relates {} to {}, received {subject} -> {object}",
                self.def.tag, self.def.subject, self.def.object
            )));
        }
        Ok(())
    }

    fn check_nested(&self, attrs: &EdgeAttrs) -> Result<(), GraphError> {
        if let Some(tag) = attrs.tags().find(|tag| !self.def.allows_nested(tag)) {
            return Err(GraphError::InvalidTag(format!(
                "{} edges have no nested attribute '{tag}'",
                self.def.tag
            )));
        }
        if let Some(tag) = attrs.non_scalar() {
            return Err(GraphError::Format(format!(
                "{}.{tag} must be a scalar value",
                self.def.tag
            )));
        }
        Ok(())
    }

    /// Walk from `start` toward the roots of this relation, reporting whether `target` is reached.
    fn reaches(&self, start: u32, target: u32) -> bool {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            if current == target {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(parents) = self.by_subject.get(&current) {
                queue.extend(parents.iter().copied());
            }
        }
        false
    }

    /// Reports whether `id` can reach itself by following this relation. Only meaningful for
    /// relations whose subject and object types match.
    pub fn on_cycle(&self, id: RecordId) -> bool {
        if id.kind != self.def.subject || self.def.subject != self.def.object {
            return false;
        }
        self.by_subject
            .get(&id.number)
            .map(|parents| parents.iter().any(|p| self.reaches(*p, id.number)))
            .unwrap_or(false)
    }

    /// Connect `subject` to `object`. Re-connecting an existing edge replaces its nested attributes
    /// without notifying observers.
    pub fn connect(
        &mut self,
        subject: RecordId,
        object: RecordId,
        attrs: EdgeAttrs,
    ) -> Result<(), GraphError> {
        self.check_types(subject, object)?;
        self.check_nested(&attrs)?;
        let (s, o) = (subject.number, object.number);

        if let Some(existing) = self.edges.get_mut(&(s, o)) {
            *existing = attrs;
            return Ok(());
        }

        if self.def.hierarchical && self.reaches(o, s) {
            return Err(GraphError::RelationCycle(format!(
                "connecting {subject} {} {object} would make {subject} its own ancestor",
                self.def.tag
            )));
        }

        let mut replaced = None;
        if self.def.is_single() {
            if let Some(current) = self.by_subject.get(&s).and_then(|objs| objs.first()) {
                match self.def.policy {
                    SinglePolicy::Reject => {
                        return Err(GraphError::RelationRejected(format!(
                            "{subject} already has {} {}",
                            self.def.tag,
                            RecordId::new(self.def.object, *current)
                        )));
                    }
                    SinglePolicy::Replace => replaced = Some(*current),
                }
            }
        }
        if let Some(old) = replaced {
            self.remove_edge(s, old);
            self.notify(s, old, false);
        }

        self.edges.insert((s, o), attrs);
        self.by_subject.entry(s).or_default().push(o);
        self.by_object.entry(o).or_default().push(s);
        self.notify(s, o, true);
        Ok(())
    }

    fn remove_edge(&mut self, s: u32, o: u32) -> Option<EdgeAttrs> {
        let attrs = self.edges.remove(&(s, o))?;
        if let Some(objects) = self.by_subject.get_mut(&s) {
            objects.retain(|x| *x != o);
            if objects.is_empty() {
                self.by_subject.remove(&s);
            }
        }
        if let Some(subjects) = self.by_object.get_mut(&o) {
            subjects.retain(|x| *x != s);
            if subjects.is_empty() {
                self.by_object.remove(&o);
            }
        }
        Some(attrs)
    }

    /// Remove an edge. Returns false when there was no such edge.
    pub fn disconnect(&mut self, subject: RecordId, object: RecordId) -> bool {
        if self.check_types(subject, object).is_err() {
            return false;
        }
        match self.remove_edge(subject.number, object.number) {
            Some(_) => {
                self.notify(subject.number, object.number, false);
                true
            }
            None => false,
        }
    }

    /// Disconnect every edge touching `id`, from either end. Returns the detached edges.
    pub fn detach(&mut self, id: RecordId) -> Vec<(RecordId, RecordId)> {
        let mut pairs = Vec::new();
        if id.kind == self.def.subject {
            for o in self.by_subject.get(&id.number).cloned().unwrap_or_default() {
                pairs.push((id.number, o));
            }
        }
        if id.kind == self.def.object {
            for s in self.by_object.get(&id.number).cloned().unwrap_or_default() {
                if !pairs.contains(&(s, id.number)) {
                    pairs.push((s, id.number));
                }
            }
        }
        pairs
            .into_iter()
            .filter_map(|(s, o)| {
                self.remove_edge(s, o)?;
                self.notify(s, o, false);
                Some((
                    RecordId::new(self.def.subject, s),
                    RecordId::new(self.def.object, o),
                ))
            })
            .collect()
    }

    pub fn contains(&self, subject: RecordId, object: RecordId) -> bool {
        subject.kind == self.def.subject
            && object.kind == self.def.object
            && self.edges.contains_key(&(subject.number, object.number))
    }

    /// Objects of `subject`, in connection order.
    pub fn objects(&self, subject: RecordId) -> impl Iterator<Item = RecordId> + '_ {
        let kind = self.def.object;
        self.by_subject
            .get(&subject.number)
            .filter(|_| subject.kind == self.def.subject)
            .into_iter()
            .flatten()
            .map(move |n| RecordId::new(kind, *n))
    }

    /// Subjects pointing at `object`, in connection order.
    pub fn subjects(&self, object: RecordId) -> impl Iterator<Item = RecordId> + '_ {
        let kind = self.def.subject;
        self.by_object
            .get(&object.number)
            .filter(|_| object.kind == self.def.object)
            .into_iter()
            .flatten()
            .map(move |n| RecordId::new(kind, *n))
    }

    pub fn object(&self, subject: RecordId) -> Option<RecordId> {
        self.objects(subject).next()
    }

    /// Every edge with its attributes, grouped by subject in connection order.
    pub fn edges(&self) -> impl Iterator<Item = (RecordId, RecordId, &EdgeAttrs)> + '_ {
        self.by_subject.iter().flat_map(move |(s, objects)| {
            objects.iter().map(move |o| {
                (
                    RecordId::new(self.def.subject, *s),
                    RecordId::new(self.def.object, *o),
                    &self.edges[&(*s, *o)],
                )
            })
        })
    }

    pub fn edge_attrs(&self, subject: RecordId, object: RecordId) -> Option<&EdgeAttrs> {
        if subject.kind != self.def.subject || object.kind != self.def.object {
            return None;
        }
        self.edges.get(&(subject.number, object.number))
    }

    /// Read a nested attribute. Valid only while the edge exists.
    pub fn edge_attr<T: serde::de::DeserializeOwned>(
        &self,
        subject: RecordId,
        object: RecordId,
        tag: &str,
    ) -> Result<Option<T>, GraphError> {
        if !self.def.allows_nested(tag) {
            return Err(GraphError::InvalidTag(format!(
                "{} edges have no nested attribute '{tag}'",
                self.def.tag
            )));
        }
        let attrs = self.edge_attrs(subject, object).ok_or_else(|| {
            GraphError::NotFound(format!("{subject} {} {object}", self.def.tag))
        })?;
        Ok(attrs.get(tag))
    }

    /// Write (or with `None`, clear) a nested attribute on an existing edge.
    pub fn set_edge_attr<T: serde::Serialize>(
        &mut self,
        subject: RecordId,
        object: RecordId,
        tag: &str,
        value: Option<T>,
    ) -> Result<(), GraphError> {
        if !self.def.allows_nested(tag) {
            return Err(GraphError::InvalidTag(format!(
                "{} edges have no nested attribute '{tag}'",
                self.def.tag
            )));
        }
        self.check_types(subject, object)?;
        let attrs = self
            .edges
            .get_mut(&(subject.number, object.number))
            .ok_or_else(|| GraphError::NotFound(format!("{subject} {} {object}", self.def.tag)))?;
        match value {
            Some(value) => attrs.set(tag, value)?,
            None => {
                attrs.remove(tag);
            }
        }
        Ok(())
    }

    /// Drop every edge touching a record for which `is_live` answers false. Returns how many edges
    /// were removed.
    pub fn cleanup<F: Fn(RecordId) -> bool>(&mut self, is_live: F) -> usize {
        let dead: Vec<(u32, u32)> = self
            .edges
            .keys()
            .filter(|(s, o)| {
                !is_live(RecordId::new(self.def.subject, *s))
                    || !is_live(RecordId::new(self.def.object, *o))
            })
            .copied()
            .collect();
        for (s, o) in dead.iter() {
            self.remove_edge(*s, *o);
            self.notify(*s, *o, false);
        }
        if !dead.is_empty() {
            tracing::debug!(
                "[RelationSet::cleanup] {} dropped {} dangling edges",
                self.def.tag,
                dead.len()
            );
        }
        dead.len()
    }

    /// Subjects lacking an object where this relation expects one.
    pub fn orphans<I: IntoIterator<Item = RecordId>>(&self, subjects: I) -> Vec<RecordId> {
        if !self.def.expects_object {
            return Vec::new();
        }
        subjects
            .into_iter()
            .filter(|id| id.kind == self.def.subject && !id.is_sentinel())
            .filter(|id| !self.by_subject.contains_key(&id.number))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::{RecordType, EDGE_ROLE};
    use parking_lot::Mutex;
    use test_log::test;

    fn folder(n: u32) -> RecordId {
        RecordId::new(RecordType::Folder, n)
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<RelationChange>>);

    impl RelationObserver for Recorder {
        fn relation_changed(&self, change: &RelationChange) {
            self.0.lock().push(*change);
        }
    }

    #[test]
    fn test_single_valued_replace_keeps_one_edge() {
        let mut set = RelationSet::new(RelationKind::FolderParent);
        let recorder = Arc::new(Recorder::default());
        set.observe(recorder.clone());

        set.connect(folder(3), folder(1), EdgeAttrs::new()).unwrap();
        set.connect(folder(3), folder(2), EdgeAttrs::new()).unwrap();

        assert_eq!(set.objects(folder(3)).collect::<Vec<_>>(), vec![folder(2)]);
        assert_eq!(set.len(), 1);
        let changes = recorder.0.lock();
        assert_eq!(changes.len(), 3);
        assert!(!changes[1].affirm);
        assert_eq!(changes[1].object, folder(1));
        assert!(changes[2].affirm);
    }

    #[test]
    fn test_single_valued_reject_policy() {
        let mut set = RelationSet::new(RelationKind::ParentInstitution);
        let inst = |n| RecordId::new(RecordType::Institution, n);
        set.connect(inst(2), inst(3), EdgeAttrs::new()).unwrap();
        let err = set.connect(inst(2), inst(4), EdgeAttrs::new()).unwrap_err();
        assert!(matches!(err, GraphError::RelationRejected(_)));
        assert_eq!(set.object(inst(2)), Some(inst(3)));
    }

    #[test]
    fn test_hierarchical_cycle_rejected_and_table_unchanged() {
        let mut set = RelationSet::new(RelationKind::FolderParent);
        set.connect(folder(3), folder(2), EdgeAttrs::new()).unwrap();
        set.connect(folder(4), folder(3), EdgeAttrs::new()).unwrap();

        let before: Vec<_> = set.edges().map(|(s, o, _)| (s, o)).collect();
        let err = set.connect(folder(2), folder(4), EdgeAttrs::new()).unwrap_err();
        assert!(matches!(err, GraphError::RelationCycle(_)));
        let err = set.connect(folder(5), folder(5), EdgeAttrs::new()).unwrap_err();
        assert!(matches!(err, GraphError::RelationCycle(_)));
        let after: Vec<_> = set.edges().map(|(s, o, _)| (s, o)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_type_and_nested_validation() {
        let mut set = RelationSet::new(RelationKind::Affiliation);
        let person = RecordId::new(RecordType::Person, 2);
        let inst = RecordId::new(RecordType::Institution, 3);

        assert!(matches!(
            set.connect(inst, person, EdgeAttrs::new()),
            Err(GraphError::TypeMismatch(_))
        ));
        let bad = EdgeAttrs::new().with("salary", 10).unwrap();
        assert!(matches!(
            set.connect(person, inst, bad),
            Err(GraphError::InvalidTag(_))
        ));

        let attrs = EdgeAttrs::new().with(EDGE_ROLE, "Professor").unwrap();
        set.connect(person, inst, attrs).unwrap();
        assert_eq!(
            set.edge_attr::<String>(person, inst, EDGE_ROLE).unwrap(),
            Some("Professor".to_string())
        );
        set.set_edge_attr(person, inst, "since", Some("1999")).unwrap();
        assert_eq!(
            set.edge_attr::<String>(person, inst, "since").unwrap(),
            Some("1999".to_string())
        );
        assert!(matches!(
            set.set_edge_attr(person, inst, "since", Some(vec![1999, 2004])),
            Err(GraphError::Format(_))
        ));
        assert_eq!(
            set.edge_attr::<String>(person, inst, "since").unwrap(),
            Some("1999".to_string())
        );
        let listed: EdgeAttrs = toml::from_str("role = [\"a\", \"b\"]").unwrap();
        let other = RecordId::new(RecordType::Institution, 4);
        assert!(matches!(
            set.connect(person, other, listed),
            Err(GraphError::Format(_))
        ));
        assert!(!set.contains(person, other));

        set.disconnect(person, inst);
        assert!(matches!(
            set.edge_attr::<String>(person, inst, EDGE_ROLE),
            Err(GraphError::NotFound(_))
        ));
    }

    #[test]
    fn test_cleanup_and_orphans() {
        let mut set = RelationSet::new(RelationKind::FolderParent);
        set.connect(folder(2), folder(1), EdgeAttrs::new()).unwrap();
        set.connect(folder(3), folder(2), EdgeAttrs::new()).unwrap();

        let removed = set.cleanup(|id| id != folder(2));
        assert_eq!(removed, 2);
        assert!(set.is_empty());

        let orphans = set.orphans([folder(1), folder(3), folder(4)]);
        assert_eq!(orphans, vec![folder(3), folder(4)]);
    }

    #[test]
    fn test_detach_touches_both_ends() {
        let mut set = RelationSet::new(RelationKind::Cites);
        let work = |n| RecordId::new(RecordType::Work, n);
        set.connect(work(1), work(2), EdgeAttrs::new()).unwrap();
        set.connect(work(2), work(3), EdgeAttrs::new()).unwrap();
        set.connect(work(4), work(3), EdgeAttrs::new()).unwrap();

        let detached = set.detach(work(2));
        assert_eq!(detached.len(), 2);
        assert_eq!(set.subjects(work(3)).collect::<Vec<_>>(), vec![work(4)]);
    }
}
