//! Versioned TOML persistence of a [Database].
//!
//! A database directory holds one document per [DocumentGroup] (`people.toml`, `library.toml`,
//! `folders.toml`), the `settings.toml` document and `checksums.toml`, which remembers what this
//! application last wrote so external edits can be detected.
//!
//! ## Loading
//!
//! [Serializer::load_all] walks through the [LoadPhase]s:
//!
//! 1. **ReadingHeader**: read every document, check and migrate its version
//! 2. **StreamingRecords**: allocate bare records into a staging database
//! 3. **BulkResolving**: fixpoint resolution of every raw reference, then orphan re-parenting
//! 4. **BringingOnline**: register every record with the search key and mentions indices
//! 5. **Ready**: the staging database replaces the live one
//!
//! Any fault or cancellation before Ready drops the staging database; the live database is left
//! exactly as it was.
//!
//! ## Saving
//!
//! [Serializer::save_all] renders every document before touching the disk, asks the
//! [SaveHooks] about upgraded or externally modified documents, then replaces each file through a
//! temporary file and a rename.
//!
//! ```rust
//! use recgraph_core::{codec::Serializer, properties::RecordType, record::RecordState, Database};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let mut db = Database::default();
//! db.create(RecordState::new(RecordType::Person).with_search_key("darwin")).unwrap();
//! Serializer::new().save_all(&mut db, dir.path()).unwrap();
//!
//! let mut reloaded = Database::default();
//! let report = Serializer::new().load_all(&mut reloaded, dir.path()).unwrap();
//! assert_eq!(report.records, 1);
//! assert!(reloaded.lookup("Darwin").is_some());
//! ```

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt, fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    catalog::DocumentGroup,
    database::{Database, DocumentState},
    error::GraphError,
    host::{CautiousHooks, InstanceLock, NoLock, SaveHooks, SilentHost, TaskHost},
    properties::RecordId,
    record::Lifecycle,
    resolver::{Activity, DroppedReference, ResolveReport},
};

pub mod checksum;
pub mod reader;
pub mod settings;
pub mod version;
pub mod writer;

pub use checksum::{checksum, ChecksumBook, CHECKSUM_FILE};
pub use reader::{parse_document, ParsedDocument};
pub use settings::{LibraryLink, SealedSecret, Settings, SETTINGS_FILE};
pub use version::{CURRENT_VERSION, VERSIONS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadPhase {
    Idle,
    ReadingHeader,
    StreamingRecords,
    BulkResolving,
    BringingOnline,
    Ready,
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    /// Records loaded, sentinels excluded
    pub records: usize,
    pub documents: Vec<String>,
    /// Lowest version among the documents read
    pub loaded_version: Option<u32>,
    /// Documents rewritten in memory by a version migration
    pub migrated: Vec<String>,
    /// Documents whose content no longer matches `checksums.toml`
    pub externally_modified: Vec<String>,
    pub dropped_references: Vec<DroppedReference>,
    pub reparented: Vec<RecordId>,
    /// Folder roles pointing at folders that do not exist
    pub dropped_roles: Vec<String>,
    pub resolve: ResolveReport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveReport {
    pub records: usize,
    pub written: Vec<PathBuf>,
    /// Version the documents were upgraded from, if any
    pub upgraded_from: Option<u32>,
}

/// Writes `data` next to `path` first, then renames it into place.
fn atomic_write(path: &Path, data: &str) -> Result<(), GraphError> {
    let temp_path = path.with_extension("toml.tmp");
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(data.as_bytes())?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

pub struct Serializer {
    host: Arc<dyn TaskHost>,
    lock: Arc<dyn InstanceLock>,
    hooks: Arc<dyn SaveHooks>,
    phase: LoadPhase,
    done: usize,
}

impl Default for Serializer {
    fn default() -> Self {
        Serializer::new()
    }
}

impl fmt::Debug for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializer")
            .field("phase", &self.phase)
            .finish()
    }
}

impl Serializer {
    /// A serializer that is never cancelled, takes no lock and refuses to overwrite externally
    /// modified documents.
    pub fn new() -> Self {
        Serializer {
            host: Arc::new(SilentHost),
            lock: Arc::new(NoLock),
            hooks: Arc::new(CautiousHooks),
            phase: LoadPhase::Idle,
            done: 0,
        }
    }

    pub fn with_host(mut self, host: Arc<dyn TaskHost>) -> Self {
        self.host = host;
        self
    }

    pub fn with_lock(mut self, lock: Arc<dyn InstanceLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn SaveHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    fn enter(&mut self, phase: LoadPhase) {
        tracing::debug!("[Serializer] {} -> {phase}", self.phase);
        self.phase = phase;
    }

    fn check_cancelled(&self) -> Result<(), GraphError> {
        if self.host.is_cancelled() {
            tracing::info!("[Serializer] cancelled during {}", self.phase);
            return Err(GraphError::OperationCancelled);
        }
        Ok(())
    }

    fn tick(&mut self, total: usize) {
        self.done += 1;
        self.host.progress(self.done, total);
    }

    fn lock(&self, dir: &Path) -> Result<(), GraphError> {
        if !self.lock.acquire_lock(dir) {
            return Err(GraphError::Locked(dir.display().to_string()));
        }
        Ok(())
    }

    /// Load every document in `dir` and replace the content of `db` with it.
    pub fn load_all(&mut self, db: &mut Database, dir: &Path) -> Result<LoadReport, GraphError> {
        self.done = 0;
        let result = self.load(db, dir);
        match &result {
            Ok(report) => tracing::info!(
                "[Serializer::load_all] loaded {} records from {dir:?}",
                report.records
            ),
            Err(e) => {
                tracing::warn!(
                    "[Serializer::load_all] loading {dir:?} failed during {}: {e}",
                    self.phase
                );
                self.phase = LoadPhase::Idle;
            }
        }
        result
    }

    fn load(&mut self, db: &mut Database, dir: &Path) -> Result<LoadReport, GraphError> {
        self.enter(LoadPhase::ReadingHeader);
        self.lock(dir)?;
        if !dir.is_dir() {
            return Err(GraphError::Io(format!("{dir:?} is not a directory")));
        }
        let mut report = LoadReport::default();
        let mut checksums = BTreeMap::new();
        let mut parsed = Vec::new();
        for group in DocumentGroup::all() {
            let path = dir.join(group.file_name());
            if !path.exists() {
                tracing::debug!("[Serializer::load] {path:?} does not exist, treating it as empty");
                continue;
            }
            let content = fs::read_to_string(&path)?;
            checksums.insert(group.file_name().to_string(), checksum(&content));
            let document = parse_document(&content, *group)?;
            report.documents.push(group.file_name().to_string());
            if document.version < CURRENT_VERSION {
                report.migrated.push(group.file_name().to_string());
            }
            parsed.push(document);
        }
        if parsed.is_empty() {
            return Err(GraphError::Io(format!("No database documents found in {dir:?}")));
        }
        report.loaded_version = parsed.iter().map(|doc| doc.version).min();

        let settings_path = dir.join(SETTINGS_FILE);
        let mut settings = if settings_path.exists() {
            let content = fs::read_to_string(&settings_path)?;
            checksums.insert(SETTINGS_FILE.to_string(), checksum(&content));
            Settings::parse(&content)?
        } else {
            Settings::default()
        };

        let book = ChecksumBook::read(dir)?;
        for name in book.modified(&checksums) {
            tracing::warn!("[Serializer::load] {name} was modified outside of this application");
            report.externally_modified.push(name.to_string());
        }
        self.check_cancelled()?;

        self.enter(LoadPhase::StreamingRecords);
        let total = 2 * parsed.iter().map(|doc| doc.records.len()).sum::<usize>();
        let mut staging = Database::with_rich_text(db.config().clone(), db.rich_text());
        let mut ctx = staging.begin(Activity::Loading)?;
        for document in parsed {
            for mut state in document.records {
                self.check_cancelled()?;
                let text = state.text.take();
                let id = staging.allocate(state)?;
                if let Some(text) = text {
                    staging.set_text(id, &text)?;
                }
                self.tick(total);
            }
        }

        self.enter(LoadPhase::BulkResolving);
        staging.resolve_in(&mut ctx)?;
        report.reparented = staging.reparent_orphans()?;
        self.check_cancelled()?;

        self.enter(LoadPhase::BringingOnline);
        let bare: Vec<RecordId> = staging
            .stores()
            .flat_map(|store| store.iter())
            .filter(|record| record.lifecycle() == Lifecycle::Bare)
            .map(|record| record.id())
            .collect();
        for id in bare {
            self.check_cancelled()?;
            staging.bring_online(id)?;
            self.tick(total);
        }
        report.dropped_roles = settings.retain_folders(|id| staging.is_live(id));
        staging.settings = settings;

        let resolve = staging.end(ctx);
        report.dropped_references = resolve.dropped.clone();
        report.resolve = resolve;
        report.records = staging
            .stores()
            .map(|store| store.iter().filter(|r| !r.id().is_sentinel()).count())
            .sum();
        staging.documents = DocumentState {
            dir: Some(dir.to_path_buf()),
            loaded_version: report.loaded_version,
            checksums,
        };

        self.enter(LoadPhase::Ready);
        db.adopt(staging, dir);
        if db.config().rebuild_mentions_on_load {
            db.rebuild_mentions()?;
        }
        Ok(report)
    }

    /// Write every document of `db` into `dir`.
    pub fn save_all(&mut self, db: &mut Database, dir: &Path) -> Result<SaveReport, GraphError> {
        self.done = 0;
        let result = self.save(db, dir);
        match &result {
            Ok(report) => tracing::info!(
                "[Serializer::save_all] wrote {} records to {dir:?}",
                report.records
            ),
            Err(e) => tracing::warn!("[Serializer::save_all] saving to {dir:?} failed: {e}"),
        }
        result
    }

    /// Ask before writing documents read at version `from` when the rewrite locks out readers that
    /// could open them before. Upgrades that keep the same readers go ahead silently.
    fn confirm_upgrade(&self, from: u32) -> Result<(), GraphError> {
        let Some(min_reader) = version::raises_min_reader(from) else {
            tracing::debug!(
                "[Serializer::save] upgrading from version {from} keeps the minimum reader version"
            );
            return Ok(());
        };
        tracing::info!(
            "[Serializer::save] documents saved as version {CURRENT_VERSION} need a reader of \
             version {min_reader} or newer"
        );
        if !self.hooks.upgrade_warning(from, CURRENT_VERSION) {
            return Err(GraphError::OperationCancelled);
        }
        Ok(())
    }

    fn save(&mut self, db: &mut Database, dir: &Path) -> Result<SaveReport, GraphError> {
        self.lock(dir)?;
        if db.activity() != Activity::Idle {
            return Err(GraphError::Internal(format!(
                "Cannot save while {} is in progress",
                db.activity()
            )));
        }
        let mut report = SaveReport::default();
        if let Some(from) = db.documents().loaded_version.filter(|v| *v < CURRENT_VERSION) {
            self.confirm_upgrade(from)?;
            report.upgraded_from = Some(from);
        }

        // Render everything before touching the disk
        let total: usize = DocumentGroup::all()
            .iter()
            .map(|group| writer::writable_records(db, *group))
            .sum();
        let mut rendered = Vec::new();
        for group in DocumentGroup::all() {
            let host = self.host.clone();
            let mut done = self.done;
            let content = writer::render_group(db, *group, |_| {
                if host.is_cancelled() {
                    return Err(GraphError::OperationCancelled);
                }
                done += 1;
                host.progress(done, total);
                Ok(())
            })?;
            self.done = done;
            rendered.push((group.file_name(), content));
        }
        report.records = total;
        rendered.push((SETTINGS_FILE, db.settings.render()?));

        let same_dir = db.documents().dir.as_deref() == Some(dir);
        for (name, content) in rendered.iter() {
            let path = dir.join(name);
            if !path.exists() {
                continue;
            }
            let on_disk = checksum(&fs::read_to_string(&path)?);
            let expected = db.documents().checksums.get(*name).filter(|_| same_dir);
            if expected != Some(&on_disk)
                && on_disk != checksum(content)
                && !self.hooks.confirm_overwrite(&path)
            {
                return Err(GraphError::ChecksumMismatch(path.display().to_string()));
            }
        }
        self.check_cancelled()?;

        fs::create_dir_all(dir)?;
        let mut book = ChecksumBook::default();
        for (name, content) in rendered.iter() {
            let path = dir.join(name);
            atomic_write(&path, content)?;
            book.documents.insert(name.to_string(), checksum(content));
            report.written.push(path);
        }
        atomic_write(&dir.join(CHECKSUM_FILE), &book.render()?)?;

        db.documents = DocumentState {
            dir: Some(dir.to_path_buf()),
            loaded_version: Some(CURRENT_VERSION),
            checksums: book.documents,
        };
        Ok(report)
    }
}

impl Database {
    /// [Serializer::load_all] with the default collaborators.
    pub fn load_all(&mut self, dir: &Path) -> Result<LoadReport, GraphError> {
        Serializer::new().load_all(self, dir)
    }

    /// [Serializer::save_all] with the default collaborators.
    pub fn save_all(&mut self, dir: &Path) -> Result<SaveReport, GraphError> {
        Serializer::new().save_all(self, dir)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Assign `role` to an existing folder.
    pub fn set_folder_role(&mut self, role: &str, folder: RecordId) -> Result<(), GraphError> {
        if folder.kind != crate::properties::RecordType::Folder {
            return Err(GraphError::TypeMismatch(format!(
                "Folder roles point at folders, received {folder}"
            )));
        }
        if !self.is_live(folder) {
            return Err(GraphError::NotFound(format!("{folder}")));
        }
        self.settings
            .folder_roles
            .insert(role.to_string(), folder.number);
        Ok(())
    }

    /// The passphrase guarding library link credentials, read from the environment variable named
    /// by [crate::config::EngineConfig::credential_key_env].
    pub fn credential_passphrase(&self) -> Result<String, GraphError> {
        let var = &self.config().credential_key_env;
        std::env::var(var).map_err(|_| {
            GraphError::NotFound(format!("Credential passphrase variable {var} is not set"))
        })
    }
}
