pub use enumset::EnumSet;
/// [crate::properties] contains the basic building blocks shared by every store, relation set and
/// index: record types, record identifiers, scalar attribute values and edge attributes.
use enumset::*;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};
use toml::{value::Table, Value};

use crate::error::GraphError;

/// The reserved record number marking protected, unstored records (roots/containers).
pub const SENTINEL_NUMBER: u32 = 1;

/// [RecordType] enumerates every kind of record the engine knows about. The set is fixed at
/// compile time; per-type schemas live in [crate::catalog::CATALOG].
#[derive(Debug, Serialize, Deserialize, PartialOrd, Ord, Hash, EnumSetType)]
#[enumset(repr = "u32")]
pub enum RecordType {
    /// An author, editor or any other individual.
    Person,
    /// A university, publisher, lab or other organization a person is affiliated with.
    Institution,
    /// A citable piece of work: book, article, chapter, talk.
    Work,
    /// A free-form note, usually about one or more works.
    Note,
    /// A folder in the participant's library tree. Folder 1 is the root sentinel.
    Folder,
}

impl RecordType {
    pub fn all() -> EnumSet<RecordType> {
        EnumSet::all()
    }

    /// Lowercase name used for display, `RecordId` parsing and document element names.
    pub fn tag(&self) -> &'static str {
        match self {
            RecordType::Person => "person",
            RecordType::Institution => "institution",
            RecordType::Work => "work",
            RecordType::Note => "note",
            RecordType::Folder => "folder",
        }
    }

    /// Sentinel record number for types that have a protected root record.
    pub fn sentinel(&self) -> Option<u32> {
        match self {
            RecordType::Folder => Some(SENTINEL_NUMBER),
            _ => None,
        }
    }

    pub fn sentinel_id(&self) -> Option<RecordId> {
        self.sentinel().map(|number| RecordId::new(*self, number))
    }
}

impl Display for RecordType {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl TryFrom<&str> for RecordType {
    type Error = GraphError;

    fn try_from(src: &str) -> Result<RecordType, GraphError> {
        match &src.to_lowercase()[..] {
            "person" => Ok(RecordType::Person),
            "institution" => Ok(RecordType::Institution),
            "work" => Ok(RecordType::Work),
            "note" => Ok(RecordType::Note),
            "folder" => Ok(RecordType::Folder),
            _ => Err(GraphError::InvalidTag(format!(
                "Invalid str for RecordType. Received {src}. Valid options: person, institution, work, note, folder"
            ))),
        }
    }
}

/// Record ID
///
/// A `(RecordType, number)` pair, unique within its type. Every cross-record reference in the
/// engine is one of these, so stores and relation sets never hold references to each other's
/// records.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecordId {
    pub kind: RecordType,
    pub number: u32,
}

impl RecordId {
    pub fn new(kind: RecordType, number: u32) -> Self {
        RecordId { kind, number }
    }

    pub fn is_sentinel(&self) -> bool {
        self.kind.sentinel() == Some(self.number)
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.number)
    }
}

impl FromStr for RecordId {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((kind, number)) = s.split_once(':') else {
            return Err(GraphError::InvalidTag(format!(
                "Expected a record id of the form 'type:number', received '{s}'"
            )));
        };
        let kind = RecordType::try_from(kind.trim())?;
        let number = number.trim().parse::<u32>().map_err(|e| {
            GraphError::InvalidTag(format!("Invalid record number in '{s}': {e}"))
        })?;
        if number == 0 {
            return Err(GraphError::InvalidTag(format!(
                "Record numbers start at 1, received '{s}'"
            )));
        }
        Ok(RecordId::new(kind, number))
    }
}

/// Three valued flag used by attributes such as `deceased` or `peer_reviewed`, where "we don't
/// know" is a legitimate answer distinct from "no".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
    #[default]
    Unknown,
    No,
    Yes,
}

impl TriState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriState::Unknown => "unknown",
            TriState::No => "no",
            TriState::Yes => "yes",
        }
    }
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value {
            TriState::Yes
        } else {
            TriState::No
        }
    }
}

impl TryFrom<&str> for TriState {
    type Error = GraphError;

    fn try_from(src: &str) -> Result<TriState, GraphError> {
        match &src.to_lowercase()[..] {
            "unknown" | "" => Ok(TriState::Unknown),
            "no" | "false" => Ok(TriState::No),
            "yes" | "true" => Ok(TriState::Yes),
            _ => Err(GraphError::InvalidTag(format!(
                "Invalid tri-state value '{src}'. Valid options: yes, no, unknown"
            ))),
        }
    }
}

/// The declared type of a scalar attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttrKind {
    Text,
    /// Authored markup. Scanned by the mentions index after conversion to plain text.
    RichText,
    Flag,
    Tri,
}

/// A scalar attribute value held by a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttrValue {
    Text(String),
    Flag(bool),
    Tri(TriState),
}

impl AttrValue {
    pub fn kind_matches(&self, kind: AttrKind) -> bool {
        matches!(
            (self, kind),
            (AttrValue::Text(_), AttrKind::Text)
                | (AttrValue::Text(_), AttrKind::RichText)
                | (AttrValue::Flag(_), AttrKind::Flag)
                | (AttrValue::Tri(_), AttrKind::Tri)
        )
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn to_toml(&self) -> Value {
        match self {
            AttrValue::Text(text) => Value::String(text.clone()),
            AttrValue::Flag(flag) => Value::Boolean(*flag),
            AttrValue::Tri(tri) => Value::String(tri.as_str().to_string()),
        }
    }

    pub fn from_toml(kind: AttrKind, value: &Value) -> Option<AttrValue> {
        match (kind, value) {
            (AttrKind::Text | AttrKind::RichText, Value::String(text)) => {
                Some(AttrValue::Text(text.clone()))
            }
            (AttrKind::Flag, Value::Boolean(flag)) => Some(AttrValue::Flag(*flag)),
            (AttrKind::Tri, Value::String(text)) => {
                TriState::try_from(text.as_str()).ok().map(AttrValue::Tri)
            }
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Flag(value)
    }
}

impl From<TriState> for AttrValue {
    fn from(value: TriState) -> Self {
        AttrValue::Tri(value)
    }
}

/// [EdgeAttrs] holds the nested attributes attached to a single edge. Values are kept as a TOML
/// table so the serializer can write them back as the inline table they were read from. Which
/// tags are allowed is decided by the relation's schema in the catalog.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeAttrs {
    #[serde(flatten)]
    payload: Table,
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Table(_))
}

/// Nested attribute key holding an author's position within a work's author list.
pub const EDGE_POSITION: &str = "position";

/// Nested attribute key holding a free-form role ("editor", "professor", ...).
pub const EDGE_ROLE: &str = "role";

impl EdgeAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a typed value from the payload by tag
    pub fn get<T: serde::de::DeserializeOwned>(&self, tag: &str) -> Option<T> {
        self.payload
            .get(tag)
            .and_then(|v| v.clone().try_into().ok())
    }

    /// Raw value of a tag.
    pub fn value(&self, tag: &str) -> Option<&Value> {
        self.payload.get(tag)
    }

    /// Set a tag-value pair in the payload. Nested attributes are a single level deep, so arrays
    /// and tables are a [GraphError::Format] fault.
    pub fn set<T: serde::Serialize>(&mut self, tag: &str, value: T) -> Result<(), GraphError> {
        self.insert(tag, Value::try_from(value)?)
    }

    pub(crate) fn insert(&mut self, tag: &str, value: Value) -> Result<(), GraphError> {
        if !is_scalar(&value) {
            return Err(GraphError::Format(format!(
                "Nested attribute '{tag}' must be a scalar, found {}",
                value.type_str()
            )));
        }
        self.payload.insert(tag.to_string(), value);
        Ok(())
    }

    /// First tag holding an array or table. Only reachable through deserialization.
    pub fn non_scalar(&self) -> Option<&str> {
        self.payload
            .iter()
            .find(|(_, v)| !is_scalar(v))
            .map(|(k, _)| k.as_str())
    }

    pub fn with<T: serde::Serialize>(mut self, tag: &str, value: T) -> Result<Self, GraphError> {
        self.set(tag, value)?;
        Ok(self)
    }

    pub fn remove(&mut self, tag: &str) -> Option<Value> {
        self.payload.remove(tag)
    }

    pub fn contains_key(&self, tag: &str) -> bool {
        self.payload.contains_key(tag)
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.payload.keys().map(|k| k.as_str())
    }
}
