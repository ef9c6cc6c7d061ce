//! Static registry of record types, attribute tags and relation types.
//!
//! The catalog is built once, on first access of [CATALOG], and never changes afterwards. Every
//! other component asks it how records of a type look (which attributes, in which order), how a
//! relation behaves (multiplicity, cycle rules, nested attributes, deletion effects) and which
//! persisted document a type belongs to.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

use crate::{
    error::GraphError,
    properties::{AttrKind, EnumSet, RecordType, EDGE_POSITION, EDGE_ROLE},
};

/// Global singleton catalog with the built-in schema
pub static CATALOG: Lazy<RelationCatalog> = Lazy::new(RelationCatalog::create);

/// Identifies one relation type. Each kind is backed by exactly one
/// [crate::relation::RelationSet].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    Affiliation,
    Authorship,
    KeyWork,
    Cites,
    About,
    NoteFolder,
    WorkFolder,
    FolderParent,
    ParentInstitution,
}

impl RelationKind {
    pub fn all() -> &'static [RelationKind] {
        &[
            RelationKind::Affiliation,
            RelationKind::Authorship,
            RelationKind::KeyWork,
            RelationKind::Cites,
            RelationKind::About,
            RelationKind::NoteFolder,
            RelationKind::WorkFolder,
            RelationKind::FolderParent,
            RelationKind::ParentInstitution,
        ]
    }

    pub fn def(&self) -> &'static RelationDef {
        CATALOG.relation(*self)
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.def().tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Multiplicity {
    Single,
    Multi,
}

/// What a single-valued relation does when a subject that already has an object is connected
/// to another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SinglePolicy {
    Replace,
    Reject,
}

/// Which endpoints of an edge count as mentioning the other one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MentionFlow {
    None,
    /// The subject mentions the object.
    Forward,
    /// Each endpoint mentions the other.
    Both,
}

/// What happens to the subjects of a relation when their object is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteEffect {
    Detach,
    Cascade,
}

#[derive(Debug, Clone)]
pub struct RelationDef {
    pub kind: RelationKind,
    /// Element name used by the serializer on the subject's record
    pub tag: &'static str,
    pub subject: RecordType,
    pub object: RecordType,
    pub multiplicity: Multiplicity,
    pub policy: SinglePolicy,
    /// Hierarchical relations must stay acyclic
    pub hierarchical: bool,
    /// Allowed nested attribute tags, in write order
    pub nested: Vec<&'static str>,
    pub mention: MentionFlow,
    pub on_object_delete: DeleteEffect,
    /// Every subject is expected to have an object. Subjects without one are orphans.
    pub expects_object: bool,
}

impl RelationDef {
    pub fn is_single(&self) -> bool {
        self.multiplicity == Multiplicity::Single
    }

    pub fn allows_nested(&self, tag: &str) -> bool {
        self.nested.contains(&tag)
    }
}

#[derive(Debug, Clone)]
pub struct AttributeDef {
    pub tag: &'static str,
    pub kind: AttrKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DocumentGroup {
    People,
    Library,
    Folders,
}

impl DocumentGroup {
    pub fn all() -> &'static [DocumentGroup] {
        &[
            DocumentGroup::People,
            DocumentGroup::Library,
            DocumentGroup::Folders,
        ]
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            DocumentGroup::People => "people.toml",
            DocumentGroup::Library => "library.toml",
            DocumentGroup::Folders => "folders.toml",
        }
    }

    pub fn types(&self) -> EnumSet<RecordType> {
        CATALOG
            .types
            .values()
            .filter(|schema| schema.group == *self)
            .map(|schema| schema.kind)
            .collect()
    }
}

impl fmt::Display for DocumentGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_name())
    }
}

#[derive(Debug, Clone)]
pub struct TypeSchema {
    pub kind: RecordType,
    /// Scalar attributes in write order
    pub attributes: Vec<AttributeDef>,
    /// Records of this type may hold a shared text connector
    pub connector: bool,
    /// Search keys of these records are looked for in other records' text
    pub mention_target: bool,
    pub group: DocumentGroup,
}

impl TypeSchema {
    pub fn attribute(&self, tag: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|def| def.tag == tag)
    }
}

pub struct RelationCatalog {
    types: BTreeMap<RecordType, TypeSchema>,
    relations: BTreeMap<RelationKind, RelationDef>,
}

impl RelationCatalog {
    pub fn create() -> Self {
        let mut types = BTreeMap::new();
        let attr = |tag, kind| AttributeDef { tag, kind };

        types.insert(
            RecordType::Person,
            TypeSchema {
                kind: RecordType::Person,
                attributes: vec![
                    attr("name", AttrKind::Text),
                    attr("born", AttrKind::Text),
                    attr("deceased", AttrKind::Tri),
                    attr("bio", AttrKind::RichText),
                ],
                connector: true,
                mention_target: true,
                group: DocumentGroup::People,
            },
        );
        types.insert(
            RecordType::Institution,
            TypeSchema {
                kind: RecordType::Institution,
                attributes: vec![
                    attr("name", AttrKind::Text),
                    attr("city", AttrKind::Text),
                    attr("defunct", AttrKind::Flag),
                ],
                connector: false,
                mention_target: true,
                group: DocumentGroup::People,
            },
        );
        types.insert(
            RecordType::Work,
            TypeSchema {
                kind: RecordType::Work,
                attributes: vec![
                    attr("title", AttrKind::Text),
                    attr("year", AttrKind::Text),
                    attr("publisher", AttrKind::Text),
                    attr("peer_reviewed", AttrKind::Tri),
                    attr("read", AttrKind::Flag),
                    attr("comment", AttrKind::RichText),
                ],
                connector: true,
                mention_target: true,
                group: DocumentGroup::Library,
            },
        );
        types.insert(
            RecordType::Note,
            TypeSchema {
                kind: RecordType::Note,
                attributes: vec![attr("title", AttrKind::Text), attr("pinned", AttrKind::Flag)],
                connector: true,
                mention_target: false,
                group: DocumentGroup::Library,
            },
        );
        types.insert(
            RecordType::Folder,
            TypeSchema {
                kind: RecordType::Folder,
                attributes: vec![attr("name", AttrKind::Text), attr("expanded", AttrKind::Flag)],
                connector: false,
                mention_target: false,
                group: DocumentGroup::Folders,
            },
        );

        let mut relations = BTreeMap::new();
        let mut register = |def: RelationDef| {
            relations.insert(def.kind, def);
        };
        register(RelationDef {
            kind: RelationKind::Affiliation,
            tag: "affiliation",
            subject: RecordType::Person,
            object: RecordType::Institution,
            multiplicity: Multiplicity::Multi,
            policy: SinglePolicy::Replace,
            hierarchical: false,
            nested: vec![EDGE_ROLE, "since"],
            mention: MentionFlow::Forward,
            on_object_delete: DeleteEffect::Detach,
            expects_object: false,
        });
        register(RelationDef {
            kind: RelationKind::Authorship,
            tag: "author",
            subject: RecordType::Work,
            object: RecordType::Person,
            multiplicity: Multiplicity::Multi,
            policy: SinglePolicy::Replace,
            hierarchical: false,
            nested: vec![EDGE_POSITION, EDGE_ROLE],
            mention: MentionFlow::Forward,
            on_object_delete: DeleteEffect::Detach,
            expects_object: false,
        });
        register(RelationDef {
            kind: RelationKind::KeyWork,
            tag: "key_work",
            subject: RecordType::Person,
            object: RecordType::Work,
            multiplicity: Multiplicity::Single,
            policy: SinglePolicy::Replace,
            hierarchical: false,
            nested: vec![],
            mention: MentionFlow::None,
            on_object_delete: DeleteEffect::Detach,
            expects_object: false,
        });
        register(RelationDef {
            kind: RelationKind::Cites,
            tag: "cites",
            subject: RecordType::Work,
            object: RecordType::Work,
            multiplicity: Multiplicity::Multi,
            policy: SinglePolicy::Replace,
            hierarchical: false,
            nested: vec!["context"],
            mention: MentionFlow::Forward,
            on_object_delete: DeleteEffect::Detach,
            expects_object: false,
        });
        register(RelationDef {
            kind: RelationKind::About,
            tag: "about",
            subject: RecordType::Note,
            object: RecordType::Work,
            multiplicity: Multiplicity::Multi,
            policy: SinglePolicy::Replace,
            hierarchical: false,
            nested: vec!["page"],
            mention: MentionFlow::Forward,
            on_object_delete: DeleteEffect::Detach,
            expects_object: false,
        });
        register(RelationDef {
            kind: RelationKind::NoteFolder,
            tag: "folder",
            subject: RecordType::Note,
            object: RecordType::Folder,
            multiplicity: Multiplicity::Single,
            policy: SinglePolicy::Replace,
            hierarchical: false,
            nested: vec![],
            mention: MentionFlow::None,
            on_object_delete: DeleteEffect::Cascade,
            expects_object: true,
        });
        register(RelationDef {
            kind: RelationKind::WorkFolder,
            tag: "folders",
            subject: RecordType::Work,
            object: RecordType::Folder,
            multiplicity: Multiplicity::Multi,
            policy: SinglePolicy::Replace,
            hierarchical: false,
            nested: vec![],
            mention: MentionFlow::None,
            on_object_delete: DeleteEffect::Detach,
            expects_object: false,
        });
        register(RelationDef {
            kind: RelationKind::FolderParent,
            tag: "parent",
            subject: RecordType::Folder,
            object: RecordType::Folder,
            multiplicity: Multiplicity::Single,
            policy: SinglePolicy::Replace,
            hierarchical: true,
            nested: vec![],
            mention: MentionFlow::None,
            on_object_delete: DeleteEffect::Cascade,
            expects_object: true,
        });
        register(RelationDef {
            kind: RelationKind::ParentInstitution,
            tag: "part_of",
            subject: RecordType::Institution,
            object: RecordType::Institution,
            multiplicity: Multiplicity::Single,
            policy: SinglePolicy::Reject,
            hierarchical: true,
            nested: vec![],
            mention: MentionFlow::Both,
            on_object_delete: DeleteEffect::Detach,
            expects_object: false,
        });

        RelationCatalog { types, relations }
    }

    pub fn schema(&self, kind: RecordType) -> &TypeSchema {
        // Every RecordType variant is registered in `create`
        &self.types[&kind]
    }

    pub fn relation(&self, kind: RelationKind) -> &RelationDef {
        &self.relations[&kind]
    }

    pub fn relations(&self) -> impl Iterator<Item = &RelationDef> {
        self.relations.values()
    }

    /// Relations whose subject is `kind`, in catalog order. These are the relations the serializer
    /// writes on records of that type.
    pub fn relations_from(&self, kind: RecordType) -> impl Iterator<Item = &RelationDef> {
        self.relations.values().filter(move |def| def.subject == kind)
    }

    /// Relations touching `kind` from either end.
    pub fn relations_touching(&self, kind: RecordType) -> impl Iterator<Item = &RelationDef> {
        self.relations
            .values()
            .filter(move |def| def.subject == kind || def.object == kind)
    }

    pub fn relation_by_tag(&self, subject: RecordType, tag: &str) -> Option<&RelationDef> {
        self.relations_from(subject).find(|def| def.tag == tag)
    }

    /// Look up an attribute definition, failing with [GraphError::InvalidTag] when the type has no
    /// such attribute.
    pub fn attribute(&self, kind: RecordType, tag: &str) -> Result<&AttributeDef, GraphError> {
        self.schema(kind).attribute(tag).ok_or_else(|| {
            GraphError::InvalidTag(format!("{kind} records have no attribute '{tag}'"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_catalog_covers_every_type_and_relation() {
        for kind in RecordType::all() {
            assert_eq!(CATALOG.schema(kind).kind, kind);
        }
        for kind in RelationKind::all() {
            assert_eq!(kind.def().kind, *kind);
        }
    }

    #[test]
    fn test_relation_tags_unique_per_subject() {
        for kind in RecordType::all() {
            let tags: Vec<_> = CATALOG.relations_from(kind).map(|def| def.tag).collect();
            let mut deduped = tags.clone();
            deduped.sort();
            deduped.dedup();
            assert_eq!(tags.len(), deduped.len(), "duplicate relation tag on {kind}");
            for tag in tags {
                assert!(
                    CATALOG.schema(kind).attribute(tag).is_none(),
                    "relation tag '{tag}' shadows an attribute of {kind}"
                );
            }
        }
    }

    #[test]
    fn test_document_groups_partition_types() {
        let mut seen = EnumSet::<RecordType>::new();
        for group in DocumentGroup::all() {
            let types = group.types();
            assert!(seen.is_disjoint(types));
            seen |= types;
        }
        assert_eq!(seen, RecordType::all());
    }

    #[test]
    fn test_attribute_lookup() {
        assert!(CATALOG.attribute(RecordType::Person, "name").is_ok());
        assert!(matches!(
            CATALOG.attribute(RecordType::Folder, "title"),
            Err(GraphError::InvalidTag(_))
        ));
    }
}
