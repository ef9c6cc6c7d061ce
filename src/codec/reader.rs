//! Turns a group document into flat [RecordState]s. References stay raw until the resolver runs.

use toml::Value as TomlValue;

use crate::{
    catalog::{DocumentGroup, RelationDef, CATALOG},
    codec::version::{migrate, read_version},
    error::GraphError,
    properties::{AttrValue, EdgeAttrs, RecordId, RecordType},
    record::{EdgeRole, PendingRef, RecordState},
};

/// Marker fields every record table may carry besides its attributes and relations.
pub const ID: &str = "id";
pub const SORT: &str = "sort";
pub const KEY: &str = "key";
pub const LIST: &str = "list";
pub const TEXT: &str = "text";
pub const UNITED_WITH: &str = "united_with";
pub const VERSION: &str = "version";

#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub group: DocumentGroup,
    /// Version the document was written with, before migration
    pub version: u32,
    pub migrated: bool,
    pub records: Vec<RecordState>,
}

pub fn parse_document(content: &str, group: DocumentGroup) -> Result<ParsedDocument, GraphError> {
    let mut document: toml::Table = toml::from_str(content)
        .map_err(|e| GraphError::Format(format!("{group}: {e}")))?;
    let version = read_version(&document)?;
    let migrated = migrate(&mut document, group, version)?;

    let types = group.types();
    let mut records = Vec::new();
    for (element, value) in document.iter() {
        if element == VERSION {
            continue;
        }
        let kind = RecordType::try_from(element.as_str())
            .ok()
            .filter(|kind| types.contains(*kind))
            .ok_or_else(|| GraphError::InvalidItem {
                record: group.file_name().to_string(),
                element: element.clone(),
            })?;
        let TomlValue::Array(items) = value else {
            return Err(GraphError::Format(format!(
                "{group}: '{element}' must be an array of tables, found {}",
                value.type_str()
            )));
        };
        for item in items {
            let TomlValue::Table(table) = item else {
                return Err(GraphError::Format(format!(
                    "{group}: '{element}' entries must be tables, found {}",
                    item.type_str()
                )));
            };
            records.push(read_record(kind, table)?);
        }
    }
    tracing::debug!(
        "[parse_document] {group}: {} records (version {version})",
        records.len()
    );
    Ok(ParsedDocument {
        group,
        version,
        migrated,
        records,
    })
}

fn read_number(owner: &str, element: &str, value: &TomlValue) -> Result<u32, GraphError> {
    match value {
        TomlValue::Integer(n) => u32::try_from(*n)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| GraphError::Format(format!("{owner}: '{element}' = {n} is not a record number"))),
        other => Err(GraphError::Format(format!(
            "{owner}: '{element}' must be a record number, found {}",
            other.type_str()
        ))),
    }
}

fn read_string(id: RecordId, element: &str, value: &TomlValue) -> Result<String, GraphError> {
    value.as_str().map(str::to_string).ok_or_else(|| {
        GraphError::Format(format!(
            "{id}: '{element}' must be a string, found {}",
            value.type_str()
        ))
    })
}

/// Read one record table.
pub fn read_record(kind: RecordType, table: &toml::Table) -> Result<RecordState, GraphError> {
    let number = match table.get(ID) {
        Some(value) => read_number(kind.tag(), ID, value)?,
        None => {
            return Err(GraphError::Format(format!("A {kind} record has no id")));
        }
    };
    let id = RecordId::new(kind, number);
    let schema = CATALOG.schema(kind);
    let mut state = RecordState::new(kind).with_number(number);

    for (element, value) in table.iter() {
        match element.as_str() {
            ID => {}
            SORT => state.sort_key = Some(read_string(id, element, value)?),
            KEY => state.search_key = Some(read_string(id, element, value)?),
            LIST => state.list_name = Some(read_string(id, element, value)?),
            TEXT if schema.connector => state.text = Some(read_string(id, element, value)?),
            UNITED_WITH if schema.connector => {
                let target = read_number(&id.to_string(), element, value)?;
                state.pending.push(PendingRef::Unite {
                    target: RecordId::new(kind, target),
                });
            }
            tag => {
                if let Some(def) = schema.attribute(tag) {
                    let attr = AttrValue::from_toml(def.kind, value).ok_or_else(|| {
                        GraphError::Format(format!(
                            "{id}: '{tag}' expects {:?}, found {value}",
                            def.kind
                        ))
                    })?;
                    state.attrs.insert(def.tag, attr);
                } else if let Some(def) = CATALOG.relation_by_tag(kind, tag) {
                    read_relation(id, def, value, &mut state)?;
                } else {
                    return Err(GraphError::InvalidItem {
                        record: id.to_string(),
                        element: tag.to_string(),
                    });
                }
            }
        }
    }
    Ok(state)
}

fn read_relation(
    id: RecordId,
    def: &RelationDef,
    value: &TomlValue,
    state: &mut RecordState,
) -> Result<(), GraphError> {
    match value {
        TomlValue::Array(items) => {
            for item in items {
                if matches!(item, TomlValue::Array(_)) {
                    return Err(GraphError::Format(format!(
                        "{id}: '{}' nests an array inside an array",
                        def.tag
                    )));
                }
                read_edge(id, def, item, state)?;
            }
            Ok(())
        }
        _ => read_edge(id, def, value, state),
    }
}

fn read_edge(
    id: RecordId,
    def: &RelationDef,
    value: &TomlValue,
    state: &mut RecordState,
) -> Result<(), GraphError> {
    let owner = id.to_string();
    let (number, attrs) = match value {
        TomlValue::Integer(_) => (read_number(&owner, def.tag, value)?, EdgeAttrs::new()),
        TomlValue::Table(inline) => {
            let number = match inline.get(ID) {
                Some(value) => read_number(&owner, def.tag, value)?,
                None => {
                    return Err(GraphError::Format(format!(
                        "{id}: '{}' entry has no id",
                        def.tag
                    )))
                }
            };
            let mut attrs = EdgeAttrs::new();
            for (tag, nested) in inline.iter().filter(|(tag, _)| tag.as_str() != ID) {
                if matches!(nested, TomlValue::Array(_) | TomlValue::Table(_)) {
                    return Err(GraphError::Format(format!(
                        "{id}: '{}.{tag}' is nested more than one level deep",
                        def.tag
                    )));
                }
                if !def.allows_nested(tag) {
                    return Err(GraphError::InvalidItem {
                        record: owner.clone(),
                        element: format!("{}.{tag}", def.tag),
                    });
                }
                attrs.insert(tag, nested.clone())?;
            }
            (number, attrs)
        }
        other => {
            return Err(GraphError::Format(format!(
                "{id}: '{}' must be a record number or an inline table, found {}",
                def.tag,
                other.type_str()
            )))
        }
    };
    state.pending.push(PendingRef::Edge {
        kind: def.kind,
        role: EdgeRole::Subject,
        target: RecordId::new(def.object, number),
        attrs,
    });
    Ok(())
}
