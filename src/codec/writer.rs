//! Renders group documents from a [Database], schema driven and in catalog order.

use toml::Value as TomlValue;
use toml_edit::{value, Array, ArrayOfTables, DocumentMut, InlineTable, Item, Table, Value};

use crate::{
    catalog::{DocumentGroup, RelationDef, CATALOG},
    codec::{
        reader::{ID, KEY, LIST, SORT, TEXT, UNITED_WITH, VERSION},
        version::CURRENT_VERSION,
    },
    database::Database,
    error::GraphError,
    properties::{EdgeAttrs, RecordId},
    record::Record,
};

fn edit_value(value: &TomlValue) -> Option<Value> {
    match value {
        TomlValue::String(s) => Some(Value::from(s.as_str())),
        TomlValue::Integer(i) => Some(Value::from(*i)),
        TomlValue::Float(f) => Some(Value::from(*f)),
        TomlValue::Boolean(b) => Some(Value::from(*b)),
        TomlValue::Datetime(d) => d
            .to_string()
            .parse::<toml_edit::Datetime>()
            .ok()
            .map(Value::from),
        TomlValue::Array(_) | TomlValue::Table(_) => None,
    }
}

fn scalar(owner: RecordId, tag: &str, value: &TomlValue) -> Result<Value, GraphError> {
    edit_value(value).ok_or_else(|| {
        GraphError::Format(format!(
            "{owner}: '{tag}' holds a {} and cannot be written",
            value.type_str()
        ))
    })
}

fn edge_value(
    def: &RelationDef,
    subject: RecordId,
    object: RecordId,
    attrs: Option<&EdgeAttrs>,
) -> Result<Value, GraphError> {
    let number = i64::from(object.number);
    let Some(attrs) = attrs.filter(|a| !a.is_empty()) else {
        return Ok(Value::from(number));
    };
    let mut inline = InlineTable::new();
    inline.insert(ID, Value::from(number));
    for tag in def.nested.iter() {
        if let Some(nested) = attrs.value(tag) {
            inline.insert(*tag, scalar(subject, tag, nested)?);
        }
    }
    Ok(Value::from(inline))
}

/// Lowest online participant of `record`'s connector. It carries the text, the others point at it.
fn text_leader(db: &Database, record: &Record) -> Option<RecordId> {
    let connector = record.connector()?;
    let participants = connector.read().participants.clone();
    participants
        .into_iter()
        .filter(|id| db.get(*id).is_some_and(|r| r.is_online()))
        .min()
}

fn record_table(db: &Database, record: &Record) -> Result<Table, GraphError> {
    let id = record.id();
    let schema = CATALOG.schema(id.kind);
    let mut table = Table::new();
    table[ID] = value(i64::from(id.number));
    if let Some(sort) = record.sort_key.as_deref() {
        table[SORT] = value(sort);
    }
    if let Some(key) = record.search_key() {
        table[KEY] = value(key);
    }
    if let Some(list) = record.list_name.as_deref() {
        table[LIST] = value(list);
    }

    for def in schema.attributes.iter() {
        if let Some(attr) = record.attr(def.tag) {
            table[def.tag] = value(scalar(id, def.tag, &attr.to_toml())?);
        }
    }

    if schema.connector {
        match text_leader(db, record) {
            Some(leader) if leader != id => {
                table[UNITED_WITH] = value(i64::from(leader.number));
            }
            _ => {
                if let Some(text) = record.text().filter(|t| !t.is_empty()) {
                    table[TEXT] = value(text);
                }
            }
        }
    }

    for def in CATALOG.relations_from(id.kind) {
        let set = db.relation(def.kind);
        let mut items = set
            .objects(id)
            .map(|object| edge_value(def, id, object, set.edge_attrs(id, object)))
            .collect::<Result<Vec<Value>, GraphError>>()?;
        if items.is_empty() {
            continue;
        }
        if def.is_single() && items.len() == 1 {
            if let Some(single) = items.pop() {
                table[def.tag] = value(single);
            }
        } else {
            let mut array = Array::new();
            for item in items {
                array.push(item);
            }
            table[def.tag] = value(array);
        }
    }
    Ok(table)
}

/// Render the document of `group`. `on_record` runs before each record is written and may abort
/// the render by returning an error.
pub fn render_group<F>(
    db: &Database,
    group: DocumentGroup,
    mut on_record: F,
) -> Result<String, GraphError>
where
    F: FnMut(RecordId) -> Result<(), GraphError>,
{
    let mut document = DocumentMut::new();
    document[VERSION] = value(i64::from(CURRENT_VERSION));
    for kind in group.types().iter() {
        let mut tables = ArrayOfTables::new();
        let mut skipped = 0;
        for record in db.store(kind).iter() {
            if record.id().is_sentinel() {
                continue;
            }
            if !record.is_online() {
                skipped += 1;
                continue;
            }
            on_record(record.id())?;
            tables.push(record_table(db, record)?);
        }
        if skipped > 0 {
            tracing::debug!("[render_group] {group}: skipped {skipped} {kind} records that are not online");
        }
        if !tables.is_empty() {
            document[kind.tag()] = Item::ArrayOfTables(tables);
        }
    }
    Ok(document.to_string())
}

/// Number of records [render_group] writes for `group`.
pub fn writable_records(db: &Database, group: DocumentGroup) -> usize {
    group
        .types()
        .iter()
        .map(|kind| {
            db.store(kind)
                .iter()
                .filter(|r| !r.id().is_sentinel() && r.is_online())
                .count()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::RelationKind,
        codec::reader::parse_document,
        properties::{RecordType, EDGE_POSITION},
        record::RecordState,
    };
    use test_log::test;

    #[test]
    fn test_render_library_document() {
        let mut db = Database::default();
        let darwin = db
            .create(
                RecordState::new(RecordType::Person)
                    .with_search_key("darwin")
                    .with_attr("name", "Charles Darwin")
                    .unwrap(),
            )
            .unwrap();
        let origin = db
            .create(
                RecordState::new(RecordType::Work)
                    .with_search_key("origin")
                    .with_text("Mentions darwin.")
                    .with_attr("title", "On the Origin of Species")
                    .unwrap()
                    .with_edge(
                        RelationKind::Authorship,
                        darwin,
                        EdgeAttrs::new().with(EDGE_POSITION, 1).unwrap(),
                    ),
            )
            .unwrap();
        let copy = db
            .create(RecordState::new(RecordType::Work).with_attr("title", "Reprint").unwrap())
            .unwrap();
        db.unite(copy, origin).unwrap();

        let mut seen = Vec::new();
        let rendered = render_group(&db, DocumentGroup::Library, |id| {
            seen.push(id);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![origin, copy]);
        assert_eq!(writable_records(&db, DocumentGroup::Library), 2);
        assert!(rendered.starts_with("version = 3"));
        assert!(rendered.contains("author = [{ id = 1, position = 1 }]"));
        assert!(rendered.contains("united_with = 1"));
        assert!(rendered.contains("text = \"Mentions darwin.\""));

        let parsed = parse_document(&rendered, DocumentGroup::Library).unwrap();
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.records[0].search_key.as_deref(), Some("origin"));
    }

    #[test]
    fn test_render_aborts_when_callback_fails() {
        let mut db = Database::default();
        db.create(RecordState::new(RecordType::Note)).unwrap();
        let err = render_group(&db, DocumentGroup::Library, |_| {
            Err(GraphError::OperationCancelled)
        })
        .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_non_scalar_edge_attrs_are_not_dropped() {
        let def = CATALOG.relation(RelationKind::Authorship);
        let work = RecordId::new(RecordType::Work, 2);
        let person = RecordId::new(RecordType::Person, 4);
        let attrs: EdgeAttrs = toml::from_str("position = [1, 2]").unwrap();
        let err = edge_value(def, work, person, Some(&attrs)).unwrap_err();
        assert!(matches!(err, GraphError::Format(_)));

        let attrs = EdgeAttrs::new().with(EDGE_POSITION, 2).unwrap();
        let rendered = edge_value(def, work, person, Some(&attrs)).unwrap();
        let inline = rendered.as_inline_table().unwrap();
        assert_eq!(inline.get(ID).and_then(|v| v.as_integer()), Some(4));
        assert_eq!(inline.get(EDGE_POSITION).and_then(|v| v.as_integer()), Some(2));
    }
}
