//! Loading and saving whole database directories.

mod common;

use common::{assert_same_graph, create_test_library, init_logging, write_documents};
use recgraph_core::{
    catalog::RelationKind,
    codec::{Serializer, CURRENT_VERSION, SETTINGS_FILE},
    mentions::Wait,
    properties::{AttrValue, EdgeAttrs, RecordId, RecordType, TriState, EDGE_POSITION},
    record::RecordState,
    resolver::DroppedReference,
    Database, GraphError,
};
use tempfile::TempDir;

fn id(kind: RecordType, number: u32) -> RecordId {
    RecordId::new(kind, number)
}

#[test]
fn test_cross_document_references_resolve() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let dir = create_test_library(&temp);

    let mut db = Database::default();
    let report = db.load_all(&dir).unwrap();
    assert_eq!(report.records, 7);
    assert_eq!(report.documents.len(), 3);
    assert_eq!(report.loaded_version, Some(CURRENT_VERSION));
    assert!(report.dropped_references.is_empty());
    assert!(report.reparented.is_empty());

    let darwin = id(RecordType::Person, 4);
    let wallace = id(RecordType::Person, 5);
    let origin = id(RecordType::Work, 7);
    let letters = id(RecordType::Work, 8);
    let note = id(RecordType::Note, 3);

    // people.toml points forward into library.toml
    assert_eq!(db.relation(RelationKind::KeyWork).object(darwin), Some(origin));
    // Wallace had no key work, the default rule picked their only work
    assert_eq!(db.relation(RelationKind::KeyWork).object(wallace), Some(letters));
    assert_eq!(report.resolve.defaults, 1);

    assert_eq!(
        db.relation(RelationKind::Authorship)
            .edge_attr::<u32>(origin, darwin, EDGE_POSITION)
            .unwrap(),
        Some(1)
    );
    assert_eq!(
        db.relation(RelationKind::About)
            .edge_attr::<i64>(note, origin, "page")
            .unwrap(),
        Some(12)
    );
    assert_eq!(
        db.relation(RelationKind::NoteFolder).object(note),
        Some(id(RecordType::Folder, 2))
    );
    assert_eq!(
        db.record(darwin).unwrap().attr("deceased"),
        Some(&AttrValue::Tri(TriState::Yes))
    );
    assert!(db.stores().flat_map(|s| s.iter()).all(|r| r.is_online()));
}

#[test]
fn test_mentions_after_load() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let dir = create_test_library(&temp);
    let mut db = Database::default();
    db.load_all(&dir).unwrap();

    let darwin = id(RecordType::Person, 4);
    let wallace = id(RecordType::Person, 5);
    let origin = id(RecordType::Work, 7);
    let letters = id(RecordType::Work, 8);
    let note = id(RecordType::Note, 3);

    let answer = db.mentioner_set(darwin, Wait::Yes);
    assert!(!answer.stale);
    assert_eq!(answer.value.into_iter().collect::<Vec<_>>(), vec![origin, letters]);
    assert!(db.mentioner_set(wallace, Wait::Yes).value.contains(&note));
    assert!(db.mentioner_set(origin, Wait::Yes).value.contains(&note));
    assert_eq!(
        db.mentioner_set(id(RecordType::Institution, 2), Wait::Yes)
            .value
            .into_iter()
            .collect::<Vec<_>>(),
        vec![wallace]
    );

    // Edits after the load keep the index equal to a full build
    db.set_text(note, "Nothing about anyone.").unwrap();
    let edited = db
        .create(RecordState::new(RecordType::Work).with_text("royal and origin"))
        .unwrap();
    assert!(db.mentioner_set(origin, Wait::Yes).value.contains(&edited));
    let incremental = db.mentions().state(Wait::Yes).value;
    db.rebuild_mentions().unwrap();
    db.mentions().wait_until_rebuild_is_done();
    assert_eq!(incremental, db.mentions().state(Wait::Yes).value);
}

#[test]
fn test_round_trip_preserves_the_graph() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let dir = create_test_library(&temp);
    let mut first = Database::default();
    first.load_all(&dir).unwrap();

    let copy = temp.path().join("copy");
    Serializer::new().save_all(&mut first, &copy).unwrap();
    let mut second = Database::default();
    second.load_all(&copy).unwrap();
    assert_same_graph(&first, &second);

    // Saving again writes byte-identical documents
    let before: Vec<String> = ["people.toml", "library.toml", "folders.toml"]
        .iter()
        .map(|name| std::fs::read_to_string(copy.join(name)).unwrap())
        .collect();
    second.save_all(&copy).unwrap();
    let after: Vec<String> = ["people.toml", "library.toml", "folders.toml"]
        .iter()
        .map(|name| std::fs::read_to_string(copy.join(name)).unwrap())
        .collect();
    assert_eq!(before, after);
    assert!(before[1].contains("about = [{ id = 7, page = 12 }]"));
    assert!(before[0].contains("key_work = 8"));
}

#[test]
fn test_dangling_references_are_dropped() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let dir = temp.path().to_path_buf();
    write_documents(
        &dir,
        "version = 3\n\n[[person]]\nid = 2\nkey = \"smith\"\nkey_work = 40\n",
        "version = 3\n\n[[note]]\nid = 1\ntext = \"orphan\"\nfolder = 9\n",
        "version = 3\n",
    );

    let mut db = Database::default();
    let report = db.load_all(&dir).unwrap();
    let smith = id(RecordType::Person, 2);
    let note = id(RecordType::Note, 1);
    assert_eq!(
        report.dropped_references,
        vec![
            DroppedReference {
                from: smith,
                target: id(RecordType::Work, 40),
                relation: Some(RelationKind::KeyWork),
            },
            DroppedReference {
                from: note,
                target: id(RecordType::Folder, 9),
                relation: Some(RelationKind::NoteFolder),
            },
        ]
    );
    // A note left without a folder lands in the root folder
    assert_eq!(report.reparented, vec![note]);
    assert_eq!(
        db.relation(RelationKind::NoteFolder).object(note),
        RecordType::Folder.sentinel_id()
    );
}

#[test]
fn test_old_documents_migrate_and_upgrade() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let dir = temp.path().to_path_buf();
    write_documents(
        &dir,
        "version = 1\n\n[[person]]\nid = 1\nnick = \"hooke\"\ndeceased = true\n",
        "version = 2\n\n[[work]]\nid = 1\ntitle = \"Micrographia\"\npeer_reviewed = false\nauthor = 1\n",
        "version = 3\n",
    );

    let mut db = Database::default();
    let report = db.load_all(&dir).unwrap();
    assert_eq!(report.loaded_version, Some(1));
    assert_eq!(
        report.migrated,
        vec!["people.toml".to_string(), "library.toml".to_string()]
    );
    let hooke = db.lookup("hooke").unwrap();
    assert_eq!(
        db.record(hooke).unwrap().attr("deceased"),
        Some(&AttrValue::Tri(TriState::Yes))
    );
    assert_eq!(
        db.record(id(RecordType::Work, 1))
            .unwrap()
            .attr("peer_reviewed"),
        Some(&AttrValue::Tri(TriState::No))
    );

    // The default hooks allow the upgrade, only overwrites of edited files are refused
    let saved = db.save_all(&dir).unwrap();
    assert_eq!(saved.upgraded_from, Some(1));
    assert_eq!(db.documents().loaded_version, Some(CURRENT_VERSION));

    let mut reloaded = Database::default();
    let report = reloaded.load_all(&dir).unwrap();
    assert!(report.migrated.is_empty());
    assert_eq!(report.loaded_version, Some(CURRENT_VERSION));
    assert_same_graph(&db, &reloaded);
}

#[test]
fn test_newer_documents_are_refused() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let dir = temp.path().to_path_buf();
    write_documents(&dir, "version = 99\n", "version = 3\n", "version = 3\n");

    let mut db = Database::default();
    let err = db.load_all(&dir).unwrap_err();
    assert!(matches!(err, GraphError::Format(_)));
    assert!(db.is_empty());
}

#[test]
fn test_unknown_elements_are_reported() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let dir = temp.path().to_path_buf();
    write_documents(
        &dir,
        "version = 3\n\n[[person]]\nid = 1\nshoe_size = 9\n",
        "version = 3\n",
        "version = 3\n",
    );

    let mut db = Database::default();
    let err = db.load_all(&dir).unwrap_err();
    assert_eq!(
        err,
        GraphError::InvalidItem {
            record: "person:1".to_string(),
            element: "shoe_size".to_string()
        }
    );
}

#[test]
fn test_huge_record_numbers_load_and_leave_low_numbers_free() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let dir = temp.path().to_path_buf();
    write_documents(
        &dir,
        "version = 3\n\n[[person]]\nid = 4000000000\nkey = \"far\"\n\n         [[institution]]\nid = 4294967295\nname = \"Last\"\n",
        "version = 3\n\n[[work]]\nid = 1\ntitle = \"Near\"\nauthor = 4000000000\n",
        "version = 3\n",
    );

    let mut db = Database::default();
    let report = db.load_all(&dir).unwrap();
    assert_eq!(report.records, 3);
    let far = id(RecordType::Person, 4_000_000_000);
    let last = id(RecordType::Institution, u32::MAX);
    assert!(db.record(last).is_ok());
    assert!(db
        .relation(RelationKind::Authorship)
        .contains(id(RecordType::Work, 1), far));

    // New records take the lowest free numbers, not the one after the largest
    let person = db.create(RecordState::new(RecordType::Person)).unwrap();
    assert_eq!(person, id(RecordType::Person, 1));
    let institution = db.create(RecordState::new(RecordType::Institution)).unwrap();
    assert_eq!(institution, id(RecordType::Institution, 1));
    let work = db.create(RecordState::new(RecordType::Work)).unwrap();
    assert_eq!(work, id(RecordType::Work, 2));

    let copy = temp.path().join("copy");
    db.save_all(&copy).unwrap();
    let people = std::fs::read_to_string(copy.join("people.toml")).unwrap();
    assert!(people.contains("id = 4000000000"));
    assert!(people.contains("id = 4294967295"));
    let mut reloaded = Database::default();
    reloaded.load_all(&copy).unwrap();
    assert_same_graph(&db, &reloaded);
}

#[test]
fn test_nested_attributes_must_be_scalars() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let dir = create_test_library(&temp);
    let mut db = Database::default();
    db.load_all(&dir).unwrap();
    let note = id(RecordType::Note, 3);
    let origin = id(RecordType::Work, 7);
    let darwin = id(RecordType::Person, 4);

    let err = db
        .set_edge_attr(RelationKind::About, note, origin, "page", Some(vec![12, 13]))
        .unwrap_err();
    assert!(matches!(err, GraphError::Format(_)));
    assert_eq!(
        db.relation(RelationKind::About)
            .edge_attr::<i64>(note, origin, "page")
            .unwrap(),
        Some(12)
    );

    let nested: EdgeAttrs = toml::from_str("position = { first = 1 }").unwrap();
    let work = db.create(RecordState::new(RecordType::Work)).unwrap();
    let err = db
        .connect(RelationKind::Authorship, work, darwin, nested)
        .unwrap_err();
    assert!(matches!(err, GraphError::Format(_)));
    assert!(!db.relation(RelationKind::Authorship).contains(work, darwin));

    // Scalars of every kind survive a save and a load
    db.set_edge_attr(RelationKind::About, note, origin, "page", Some("xii"))
        .unwrap();
    db.connect(
        RelationKind::Authorship,
        work,
        darwin,
        EdgeAttrs::new().with(EDGE_POSITION, 2u32).unwrap(),
    )
    .unwrap();
    let copy = temp.path().join("copy");
    db.save_all(&copy).unwrap();
    let mut reloaded = Database::default();
    reloaded.load_all(&copy).unwrap();
    assert_same_graph(&db, &reloaded);
    assert_eq!(
        reloaded
            .relation(RelationKind::About)
            .edge_attr::<String>(note, origin, "page")
            .unwrap()
            .as_deref(),
        Some("xii")
    );

    // A document carrying an array in a nested attribute is refused outright
    write_documents(
        &dir,
        "version = 3\n\n[[person]]\nid = 4\n",
        "version = 3\n\n[[work]]\nid = 7\nauthor = [{ id = 4, position = [1, 2] }]\n",
        "version = 3\n",
    );
    let mut refused = Database::default();
    let err = refused.load_all(&dir).unwrap_err();
    assert!(matches!(err, GraphError::Format(_)));
    assert!(refused.is_empty());
}

#[test]
fn test_settings_edited_outside_are_guarded() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let dir = create_test_library(&temp);
    let reading = id(RecordType::Folder, 2);

    let mut db = Database::default();
    db.load_all(&dir).unwrap();
    db.set_folder_role("inbox", reading).unwrap();
    db.save_all(&dir).unwrap();
    assert!(db.documents().checksums.contains_key(SETTINGS_FILE));

    let settings = dir.join(SETTINGS_FILE);
    std::fs::write(&settings, "[folder_roles]\ninbox = 2\narchive = 2\n").unwrap();

    // Only the settings document changed, and the save still refuses to clobber it
    let err = db.save_all(&dir).unwrap_err();
    assert!(matches!(err, GraphError::ChecksumMismatch(ref path) if path.ends_with(SETTINGS_FILE)));
    assert!(std::fs::read_to_string(&settings)
        .unwrap()
        .contains("archive"));

    let mut reloaded = Database::default();
    let report = reloaded.load_all(&dir).unwrap();
    assert_eq!(report.externally_modified, vec![SETTINGS_FILE.to_string()]);
    assert_eq!(reloaded.settings().folder_for_role("archive"), Some(reading));

    // Once read, the edit is known and later saves go through
    reloaded.save_all(&dir).unwrap();
    let mut again = Database::default();
    assert!(again.load_all(&dir).unwrap().externally_modified.is_empty());
}
