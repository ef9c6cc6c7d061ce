//! Document versions and the migrations between them.

use toml::Value as TomlValue;

use crate::{
    catalog::{DocumentGroup, CATALOG},
    error::GraphError,
    properties::{AttrKind, TriState},
};

/// Version written by this build.
pub const CURRENT_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: u32,
    /// Application release that introduced this document version
    pub introduced_in: &'static str,
    /// Oldest document reader able to open documents of this version
    pub min_reader: u32,
}

pub const VERSIONS: &[VersionInfo] = &[
    VersionInfo {
        version: 1,
        introduced_in: "0.1.0",
        min_reader: 1,
    },
    VersionInfo {
        version: 2,
        introduced_in: "0.4.0",
        min_reader: 1,
    },
    VersionInfo {
        version: 3,
        introduced_in: "0.7.0",
        min_reader: 3,
    },
];

pub fn version_info(version: u32) -> Result<&'static VersionInfo, GraphError> {
    VERSIONS
        .iter()
        .find(|info| info.version == version)
        .ok_or_else(|| {
            if version > CURRENT_VERSION {
                GraphError::Format(format!(
                    "Document version {version} is newer than the newest supported version \
                     {CURRENT_VERSION}"
                ))
            } else {
                GraphError::Format(format!("Unknown document version {version}"))
            }
        })
}

/// Saving documents last read at `loaded` as [CURRENT_VERSION] locks out readers older than the
/// returned version, if any.
pub fn raises_min_reader(loaded: u32) -> Option<u32> {
    let current = version_info(CURRENT_VERSION).ok()?.min_reader;
    let previous = version_info(loaded).map(|i| i.min_reader).unwrap_or(current);
    (current > previous).then_some(current)
}

/// Read the `version` header of a parsed document.
pub fn read_version(document: &toml::Table) -> Result<u32, GraphError> {
    let version = match document.get("version") {
        Some(TomlValue::Integer(v)) => *v,
        Some(other) => {
            return Err(GraphError::Format(format!(
                "Document version must be an integer, found {}",
                other.type_str()
            )))
        }
        None => return Err(GraphError::Format("Document has no version header".to_string())),
    };
    let version = u32::try_from(version)
        .map_err(|_| GraphError::Format(format!("Invalid document version {version}")))?;
    version_info(version)?;
    Ok(version)
}

fn records_mut<'a>(
    document: &'a mut toml::Table,
    group: DocumentGroup,
) -> impl Iterator<Item = (&'static str, &'a mut toml::Table)> + 'a {
    let tags: Vec<&'static str> = group.types().iter().map(|kind| kind.tag()).collect();
    document
        .iter_mut()
        .filter(move |(key, _)| tags.contains(&key.as_str()))
        .filter_map(|(key, value)| match value {
            TomlValue::Array(records) => Some((key.clone(), records)),
            _ => None,
        })
        .flat_map(|(key, records)| {
            let tag = crate::properties::RecordType::try_from(key.as_str())
                .map(|kind| kind.tag())
                .unwrap_or("");
            records.iter_mut().filter_map(move |record| match record {
                TomlValue::Table(table) => Some((tag, table)),
                _ => None,
            })
        })
}

/// Version 1 called the search key `nick`.
fn migrate_v1_nick(document: &mut toml::Table, group: DocumentGroup) -> bool {
    let mut migrated = false;
    for (_, record) in records_mut(document, group) {
        if let Some(nick) = record.remove("nick") {
            if !record.contains_key("key") {
                record.insert("key".to_string(), nick);
            }
            migrated = true;
        }
    }
    migrated
}

/// Version 2 stored tri-state attributes as booleans, unable to say "unknown".
fn migrate_v2_tri_state(document: &mut toml::Table, group: DocumentGroup) -> bool {
    let mut migrated = false;
    for (tag, record) in records_mut(document, group) {
        let Ok(kind) = crate::properties::RecordType::try_from(tag) else {
            continue;
        };
        for def in CATALOG.schema(kind).attributes.iter() {
            if def.kind != AttrKind::Tri {
                continue;
            }
            if let Some(TomlValue::Boolean(flag)) = record.get(def.tag) {
                let tri = TriState::from(*flag);
                record.insert(def.tag.to_string(), TomlValue::String(tri.as_str().to_string()));
                migrated = true;
            }
        }
    }
    migrated
}

/// Bring a parsed document from `version` up to [CURRENT_VERSION]. Returns whether anything was
/// rewritten.
pub fn migrate(
    document: &mut toml::Table,
    group: DocumentGroup,
    version: u32,
) -> Result<bool, GraphError> {
    version_info(version)?;
    let mut migrated = false;
    if version < 2 {
        migrated |= migrate_v1_nick(document, group);
    }
    if version < 3 {
        migrated |= migrate_v2_tri_state(document, group);
    }
    if version < CURRENT_VERSION {
        tracing::info!(
            "[migrate] {group} upgraded from version {version} to {CURRENT_VERSION}{}",
            if migrated { "" } else { " (no changes needed)" }
        );
        document.insert(
            "version".to_string(),
            TomlValue::Integer(i64::from(CURRENT_VERSION)),
        );
    }
    Ok(migrated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_version_table() {
        assert_eq!(version_info(CURRENT_VERSION).unwrap().version, CURRENT_VERSION);
        assert!(matches!(
            version_info(CURRENT_VERSION + 1),
            Err(GraphError::Format(_))
        ));
        assert_eq!(raises_min_reader(1), Some(3));
        assert_eq!(raises_min_reader(CURRENT_VERSION), None);
    }

    #[test]
    fn test_migrate_v1_document() {
        let mut document: toml::Table = toml::from_str(
            r#"
version = 1

[[person]]
id = 2
nick = "smith"
deceased = true

[[institution]]
id = 3
nick = "mit"
"#,
        )
        .unwrap();
        assert_eq!(read_version(&document).unwrap(), 1);
        assert!(migrate(&mut document, DocumentGroup::People, 1).unwrap());
        assert_eq!(read_version(&document).unwrap(), CURRENT_VERSION);

        let person = document["person"][0].as_table().unwrap();
        assert_eq!(person["key"].as_str(), Some("smith"));
        assert!(!person.contains_key("nick"));
        assert_eq!(person["deceased"].as_str(), Some("yes"));
        assert_eq!(
            document["institution"][0].as_table().unwrap()["key"].as_str(),
            Some("mit")
        );
    }

    #[test]
    fn test_missing_or_future_version_is_a_format_fault() {
        let document: toml::Table = toml::from_str("[[person]]\nid = 2\n").unwrap();
        assert!(matches!(read_version(&document), Err(GraphError::Format(_))));
        let document: toml::Table = toml::from_str("version = 99\n").unwrap();
        assert!(matches!(read_version(&document), Err(GraphError::Format(_))));
    }
}
