//! Records, their flat serialized state, and the shared text connector.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use crate::{
    catalog::{RelationKind, CATALOG},
    error::GraphError,
    properties::{AttrValue, EdgeAttrs, RecordId, RecordType},
};

/// Where a record is in its life. Purged records are simply gone from their store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Built from a flat state. Pointers may still be unresolved and the record is not indexed.
    Bare,
    /// Registered with the search key and mentions indices.
    Online,
    /// Edges detached as part of a deletion cascade. Still addressable until purged.
    Expired,
}

/// Which end of an edge the pending record sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeRole {
    Subject,
    Object,
}

/// A raw, still unresolved reference collected while reading a document.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingRef {
    Edge {
        kind: RelationKind,
        role: EdgeRole,
        target: RecordId,
        attrs: EdgeAttrs,
    },
    /// Share the target's connector.
    Unite { target: RecordId },
}

impl PendingRef {
    pub fn target(&self) -> RecordId {
        match self {
            PendingRef::Edge { target, .. } => *target,
            PendingRef::Unite { target } => *target,
        }
    }
}

/// The flat state of a record as it is streamed out of (or into) a document. Pointer attributes
/// are kept as raw [PendingRef]s until the resolver runs.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordState {
    pub kind: RecordType,
    /// `None` asks the store to allocate the lowest free number
    pub number: Option<u32>,
    pub sort_key: Option<String>,
    pub search_key: Option<String>,
    pub list_name: Option<String>,
    pub attrs: BTreeMap<&'static str, AttrValue>,
    pub text: Option<String>,
    pub pending: Vec<PendingRef>,
}

impl RecordState {
    pub fn new(kind: RecordType) -> Self {
        RecordState {
            kind,
            number: None,
            sort_key: None,
            search_key: None,
            list_name: None,
            attrs: BTreeMap::new(),
            text: None,
            pending: Vec::new(),
        }
    }

    pub fn with_number(mut self, number: u32) -> Self {
        self.number = Some(number);
        self
    }

    pub fn with_search_key(mut self, key: &str) -> Self {
        self.search_key = Some(key.to_string());
        self
    }

    pub fn with_sort_key(mut self, key: &str) -> Self {
        self.sort_key = Some(key.to_string());
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    /// Set a scalar attribute, validating the tag and value kind against the catalog.
    pub fn with_attr(mut self, tag: &str, value: impl Into<AttrValue>) -> Result<Self, GraphError> {
        let def = CATALOG.attribute(self.kind, tag)?;
        let value = value.into();
        if !value.kind_matches(def.kind) {
            return Err(GraphError::TypeMismatch(format!(
                "{} attribute '{tag}' expects {:?}, received {value:?}",
                self.kind, def.kind
            )));
        }
        self.attrs.insert(def.tag, value);
        Ok(self)
    }

    /// Queue an edge with this record as subject.
    pub fn with_edge(mut self, kind: RelationKind, target: RecordId, attrs: EdgeAttrs) -> Self {
        self.pending.push(PendingRef::Edge {
            kind,
            role: EdgeRole::Subject,
            target,
            attrs,
        });
        self
    }
}

/// The shared text + cross-reference object. Records united with each other hold clones of the
/// same `Arc`; the connector is released once the last participant lets go of it.
#[derive(Debug, Default)]
pub struct Connector {
    pub text: String,
    pub participants: BTreeSet<RecordId>,
}

pub type SharedConnector = Arc<RwLock<Connector>>;

#[derive(Debug)]
pub struct Record {
    id: RecordId,
    lifecycle: Lifecycle,
    pub sort_key: Option<String>,
    pub list_name: Option<String>,
    search_key: Option<String>,
    attrs: BTreeMap<&'static str, AttrValue>,
    connector: Option<SharedConnector>,
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.display_name() {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

impl Record {
    /// Build a bare record from a flat state. Pending references and text are handled by the
    /// store and the resolver; this only copies the scalar part.
    pub fn bare(id: RecordId, state: &RecordState) -> Record {
        Record {
            id,
            lifecycle: Lifecycle::Bare,
            sort_key: state.sort_key.clone(),
            list_name: state.list_name.clone(),
            search_key: state
                .search_key
                .as_ref()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            attrs: state.attrs.clone(),
            connector: None,
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn kind(&self) -> RecordType {
        self.id.kind
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_online(&self) -> bool {
        self.lifecycle == Lifecycle::Online
    }

    pub fn is_expired(&self) -> bool {
        self.lifecycle == Lifecycle::Expired
    }

    pub(crate) fn set_lifecycle(&mut self, lifecycle: Lifecycle) {
        self.lifecycle = lifecycle;
    }

    pub fn search_key(&self) -> Option<&str> {
        self.search_key.as_deref()
    }

    pub(crate) fn set_search_key_unchecked(&mut self, key: Option<String>) {
        self.search_key = key;
    }

    /// A human readable name: list name, then the `name`/`title` attribute, then the search key.
    pub fn display_name(&self) -> Option<&str> {
        self.list_name
            .as_deref()
            .or_else(|| self.attr("name").and_then(|v| v.as_text()))
            .or_else(|| self.attr("title").and_then(|v| v.as_text()))
            .or(self.search_key.as_deref())
    }

    pub fn attr(&self, tag: &str) -> Option<&AttrValue> {
        self.attrs.get(tag)
    }

    pub fn attrs(&self) -> &BTreeMap<&'static str, AttrValue> {
        &self.attrs
    }

    /// Set or clear a scalar attribute. Fails with [GraphError::InvalidTag] for tags outside the
    /// type's schema and [GraphError::TypeMismatch] for values of the wrong kind.
    pub fn set_attr(&mut self, tag: &str, value: Option<AttrValue>) -> Result<(), GraphError> {
        let def = CATALOG.attribute(self.kind(), tag)?;
        match value {
            Some(value) => {
                if !value.kind_matches(def.kind) {
                    return Err(GraphError::TypeMismatch(format!(
                        "{} attribute '{tag}' expects {:?}, received {value:?}",
                        self.id, def.kind
                    )));
                }
                self.attrs.insert(def.tag, value);
            }
            None => {
                self.attrs.remove(def.tag);
            }
        }
        Ok(())
    }

    pub fn connector(&self) -> Option<&SharedConnector> {
        self.connector.as_ref()
    }

    /// Return the record's connector, creating an empty one on first use.
    pub fn connector_or_create(&mut self) -> Result<SharedConnector, GraphError> {
        if !CATALOG.schema(self.kind()).connector {
            return Err(GraphError::TypeMismatch(format!(
                "{} records do not carry text",
                self.kind()
            )));
        }
        let id = self.id;
        let connector = self.connector.get_or_insert_with(|| {
            let mut connector = Connector::default();
            connector.participants.insert(id);
            Arc::new(RwLock::new(connector))
        });
        Ok(connector.clone())
    }

    /// Join `shared`, leaving whatever connector this record held before.
    pub(crate) fn join_connector(&mut self, shared: SharedConnector) {
        self.leave_connector();
        shared.write().participants.insert(self.id);
        self.connector = Some(shared);
    }

    /// Leave the current connector. Returns the text it held so a separated record can keep a
    /// private copy.
    pub(crate) fn leave_connector(&mut self) -> Option<String> {
        let shared = self.connector.take()?;
        let mut connector = shared.write();
        connector.participants.remove(&self.id);
        Some(connector.text.clone())
    }

    /// The text held by this record's connector, if any.
    pub fn text(&self) -> Option<String> {
        self.connector.as_ref().map(|c| c.read().text.clone())
    }

    /// Ids of every record sharing this record's connector, including itself.
    pub fn united(&self) -> BTreeSet<RecordId> {
        match &self.connector {
            Some(shared) => shared.read().participants.clone(),
            None => BTreeSet::from([self.id]),
        }
    }

    /// The markup of every rich text field, connector first, in schema order.
    pub fn rich_fields(&self) -> Vec<String> {
        let schema = CATALOG.schema(self.kind());
        let mut fields = Vec::new();
        if let Some(text) = self.text() {
            fields.push(text);
        }
        for def in schema.attributes.iter() {
            if def.kind == crate::properties::AttrKind::RichText {
                if let Some(AttrValue::Text(markup)) = self.attrs.get(def.tag) {
                    fields.push(markup.clone());
                }
            }
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::TriState;
    use test_log::test;

    fn person(number: u32) -> Record {
        let state = RecordState::new(RecordType::Person)
            .with_number(number)
            .with_search_key("  smith ")
            .with_attr("name", "John Smith")
            .unwrap();
        Record::bare(RecordId::new(RecordType::Person, number), &state)
    }

    #[test]
    fn test_bare_record_trims_search_key() {
        let record = person(2);
        assert_eq!(record.search_key(), Some("smith"));
        assert_eq!(record.lifecycle(), Lifecycle::Bare);
        assert_eq!(record.display_name(), Some("John Smith"));
    }

    #[test]
    fn test_attribute_validation() {
        let mut record = person(2);
        assert!(record
            .set_attr("deceased", Some(AttrValue::Tri(TriState::No)))
            .is_ok());
        assert!(matches!(
            record.set_attr("deceased", Some(AttrValue::Flag(true))),
            Err(GraphError::TypeMismatch(_))
        ));
        assert!(matches!(
            record.set_attr("shoe_size", Some("44".into())),
            Err(GraphError::InvalidTag(_))
        ));
        record.set_attr("name", None).unwrap();
        assert!(record.attr("name").is_none());
    }

    #[test]
    fn test_connector_sharing_and_release() {
        let mut a = person(2);
        let mut b = person(3);

        let shared = a.connector_or_create().unwrap();
        shared.write().text = "Shared biography".to_string();
        b.join_connector(shared.clone());

        assert_eq!(b.text().as_deref(), Some("Shared biography"));
        assert_eq!(a.united().len(), 2);
        assert_eq!(Arc::strong_count(&shared), 3);

        let kept = b.leave_connector();
        assert_eq!(kept.as_deref(), Some("Shared biography"));
        assert_eq!(a.united().len(), 1);

        a.leave_connector();
        // Only our local handle is left
        assert_eq!(Arc::strong_count(&shared), 1);
        assert!(shared.read().participants.is_empty());
    }

    #[test]
    fn test_connector_requires_text_capable_type() {
        let state = RecordState::new(RecordType::Folder);
        let mut folder = Record::bare(RecordId::new(RecordType::Folder, 4), &state);
        assert!(matches!(
            folder.connector_or_create(),
            Err(GraphError::TypeMismatch(_))
        ));
    }
}
