//! The database façade: every record store, relation set and index behind one writer.
//!
//! A [Database] is mutated through `&mut self` by a single logical writer. Resolution and deletion
//! cascades hold the gate ([Activity]) for their duration; relation observers only ever get `&self`
//! views of an edge change, so nothing they do can reach back into the mutating API.

use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    catalog::{MentionFlow, RelationKind, CATALOG},
    config::EngineConfig,
    error::GraphError,
    event::{EventBus, GraphEvent},
    mentions::{MentionAnswer, MentionSnapshot, MentionsIndex, Wait},
    properties::{AttrKind, AttrValue, EdgeAttrs, RecordId, RecordType},
    record::{Lifecycle, Record, RecordState},
    relation::{RelationChange, RelationObserver, RelationSet},
    resolver::{Activity, ResolveContext, ResolveMode, ResolveReport},
    richtext::{MarkdownText, RichText},
    search_key::SearchKeyIndex,
    store::RecordStore,
};

mod cascade;

/// Buffers relation changes so the database can publish them as [GraphEvent]s once the
/// mutating call has finished.
#[derive(Default)]
struct EventRelay(Mutex<Vec<RelationChange>>);

impl RelationObserver for EventRelay {
    fn relation_changed(&self, change: &RelationChange) {
        self.0.lock().push(*change);
    }
}

/// Persistence bookkeeping of the documents this database was loaded from or saved to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentState {
    pub dir: Option<PathBuf>,
    /// Lowest document version among the loaded documents
    pub loaded_version: Option<u32>,
    /// file name -> SHA-256 hex of its content as last read or written
    pub checksums: BTreeMap<String, String>,
}

pub struct Database {
    config: EngineConfig,
    /// Indexed by `RecordType as usize`
    stores: Vec<RecordStore>,
    /// Indexed by `RelationKind as usize`
    relations: Vec<RelationSet>,
    keys: SearchKeyIndex,
    mentions: Arc<MentionsIndex>,
    relay: Arc<EventRelay>,
    events: EventBus,
    observers: Vec<(RelationKind, Arc<dyn RelationObserver>)>,
    activity: Activity,
    pub(crate) settings: crate::codec::settings::Settings,
    pub(crate) documents: DocumentState,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("activity", &self.activity)
            .field("records", &self.len())
            .field(
                "edges",
                &self.relations.iter().map(|r| r.len()).sum::<usize>(),
            )
            .field("documents", &self.documents)
            .finish()
    }
}

impl Default for Database {
    fn default() -> Self {
        Database::new(EngineConfig::default())
    }
}

impl Database {
    pub fn new(config: EngineConfig) -> Self {
        Database::with_rich_text(config, Arc::new(MarkdownText))
    }

    pub fn with_rich_text(config: EngineConfig, rich: Arc<dyn RichText>) -> Self {
        let mentions = Arc::new(MentionsIndex::new(rich, config.mention_min_key_len));
        let relay = Arc::new(EventRelay::default());
        let mut relations = Vec::with_capacity(RelationKind::all().len());
        for kind in RelationKind::all() {
            let mut set = RelationSet::new(*kind);
            set.observe(mentions.clone());
            set.observe(relay.clone());
            relations.push(set);
        }
        let mut db = Database {
            keys: SearchKeyIndex::new(config.min_search_key_len),
            config,
            stores: RecordType::all().iter().map(RecordStore::new).collect(),
            relations,
            mentions,
            relay,
            events: EventBus::default(),
            observers: Vec::new(),
            activity: Activity::Idle,
            settings: Default::default(),
            documents: DocumentState::default(),
        };
        db.create_sentinels();
        db
    }

    fn create_sentinels(&mut self) {
        for kind in RecordType::all() {
            let Some(number) = kind.sentinel() else {
                continue;
            };
            let store = self.store_mut(kind);
            if store.contains(number) {
                continue;
            }
            match store.allocate(RecordState::new(kind).with_number(number)) {
                Ok(id) => {
                    store.set_lifecycle(id.number, Lifecycle::Online);
                    self.mentions.add_record(id);
                }
                Err(e) => tracing::error!("Could not create the {kind} sentinel: {e}"),
            }
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rich_text(&self) -> Arc<dyn RichText> {
        self.mentions.rich_text().clone()
    }

    pub fn activity(&self) -> Activity {
        self.activity
    }

    // Gate

    /// Take the gate for `activity`. Fails with [GraphError::Internal] when any other activity holds
    /// it: resolution and deletion never nest.
    pub(crate) fn begin(&mut self, activity: Activity) -> Result<ResolveContext, GraphError> {
        if self.activity != Activity::Idle {
            let msg = format!(
                "Cannot start {activity} while {} is in progress",
                self.activity
            );
            tracing::error!("{msg}");
            return Err(GraphError::Internal(msg));
        }
        let mode = match activity {
            Activity::Loading => ResolveMode::Load,
            Activity::Deleting => ResolveMode::Cascade,
            _ => ResolveMode::Edit,
        };
        self.activity = activity;
        Ok(ResolveContext::new(activity, mode))
    }

    pub(crate) fn end(&mut self, ctx: ResolveContext) -> ResolveReport {
        let report = self.release(ctx);
        self.flush_events();
        report
    }

    /// Give the gate back without publishing the buffered relation changes.
    fn release(&mut self, ctx: ResolveContext) -> ResolveReport {
        self.activity = Activity::Idle;
        ctx.into_report()
    }

    /// Run the fixpoint resolution over every pending reference.
    pub fn resolve(&mut self) -> Result<ResolveReport, GraphError> {
        let mut ctx = self.begin(Activity::Resolving)?;
        let result = self.resolve_all(&mut ctx);
        let report = self.end(ctx);
        result.map(|_| report)
    }

    /// Resolve inside a context someone else obtained from the gate. Used by the loader, which
    /// holds the gate for the whole load.
    pub(crate) fn resolve_in(&mut self, ctx: &mut ResolveContext) -> Result<(), GraphError> {
        if ctx.activity() != self.activity {
            return Err(GraphError::Internal(format!(
                "Resolution context for {} used while {} holds the gate",
                ctx.activity(),
                self.activity
            )));
        }
        self.resolve_all(ctx)
    }

    // Stores and relations

    pub fn store(&self, kind: RecordType) -> &RecordStore {
        &self.stores[kind as usize]
    }

    pub(crate) fn store_mut(&mut self, kind: RecordType) -> &mut RecordStore {
        &mut self.stores[kind as usize]
    }

    pub fn stores(&self) -> impl Iterator<Item = &RecordStore> {
        self.stores.iter()
    }

    pub fn relation(&self, kind: RelationKind) -> &RelationSet {
        &self.relations[kind as usize]
    }

    pub(crate) fn relation_mut(&mut self, kind: RelationKind) -> &mut RelationSet {
        &mut self.relations[kind as usize]
    }

    pub fn relations(&self) -> impl Iterator<Item = &RelationSet> {
        self.relations.iter()
    }

    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.store(id.kind).get(id.number)
    }

    pub fn record(&self, id: RecordId) -> Result<&Record, GraphError> {
        self.get(id)
            .ok_or_else(|| GraphError::NotFound(format!("{id}")))
    }

    fn record_mut(&mut self, id: RecordId) -> Result<&mut Record, GraphError> {
        self.store_mut(id.kind)
            .get_mut(id.number)
            .ok_or_else(|| GraphError::NotFound(format!("{id}")))
    }

    /// Live records may be the endpoint of an edge: they exist and are not expired.
    pub fn is_live(&self, id: RecordId) -> bool {
        self.store(id.kind).is_live(id.number)
    }

    fn require_live(&self, id: RecordId) -> Result<(), GraphError> {
        match self.get(id) {
            Some(record) if !record.is_expired() => Ok(()),
            Some(_) => Err(GraphError::NotFound(format!("{id} is being deleted"))),
            None => Err(GraphError::NotFound(format!("{id}"))),
        }
    }

    /// Total number of records, sentinels included.
    pub fn len(&self) -> usize {
        self.stores.iter().map(RecordStore::len).sum()
    }

    /// True when the database holds nothing but sentinels.
    pub fn is_empty(&self) -> bool {
        self.stores
            .iter()
            .all(|s| s.iter().all(|r| r.id().is_sentinel()))
    }

    pub fn search_keys(&self) -> &SearchKeyIndex {
        &self.keys
    }

    pub(crate) fn keys_mut(&mut self) -> &mut SearchKeyIndex {
        &mut self.keys
    }

    pub fn lookup(&self, key: &str) -> Option<RecordId> {
        self.keys.lookup(key)
    }

    // Lifecycle

    /// Allocate a bare record from a flat state. Pending references stay in the store until the
    /// next resolution.
    pub fn allocate(&mut self, state: RecordState) -> Result<RecordId, GraphError> {
        self.store_mut(state.kind).allocate(state)
    }

    /// Register a bare record with the search key and mentions indices. On failure nothing is
    /// registered and the record stays bare.
    pub fn bring_online(&mut self, id: RecordId) -> Result<(), GraphError> {
        let record = self.record(id)?;
        if record.lifecycle() != Lifecycle::Bare {
            return Err(GraphError::Internal(format!(
                "{id} is {:?}, only bare records can be brought online",
                record.lifecycle()
            )));
        }
        for def in CATALOG.relations_touching(id.kind) {
            if def.hierarchical && self.relation(def.kind).on_cycle(id) {
                return Err(GraphError::RelationCycle(format!(
                    "{id} sits on a {} cycle",
                    def.tag
                )));
            }
        }
        let key = match record.search_key() {
            Some(key) => self.keys.check(id, key)?,
            None => None,
        };
        let fields = record.rich_fields();

        if let Some(key) = key.as_deref() {
            self.keys.set(id, key)?;
        }
        self.store_mut(id.kind).set_lifecycle(id.number, Lifecycle::Online);
        self.mentions.add_record(id);
        if CATALOG.schema(id.kind).mention_target {
            self.mentions.update_key(id, key.as_deref());
        }
        if !fields.is_empty() {
            self.mentions.update_mentioner(id, &fields);
        }
        Ok(())
    }

    /// Allocate, resolve and bring a record online in one step. A record that fails to come online
    /// is removed again.
    pub fn create(&mut self, mut state: RecordState) -> Result<RecordId, GraphError> {
        let text = state.text.take();
        let id = self.allocate(state)?;
        let outcome = self.finish_create(id, text);
        if let Err(e) = outcome {
            tracing::debug!("[Database::create] rolling back {id}: {e}");
            for def in CATALOG.relations_touching(id.kind) {
                self.relation_mut(def.kind).detach(id);
            }
            if let Some(mut record) = self.store_mut(id.kind).discard(id.number) {
                record.leave_connector();
            }
            self.relay.0.lock().clear();
            return Err(e);
        }
        self.flush_events();
        Ok(id)
    }

    fn finish_create(&mut self, id: RecordId, text: Option<String>) -> Result<(), GraphError> {
        if let Some(text) = text {
            let connector = self.record_mut(id)?.connector_or_create()?;
            connector.write().text = text;
        }
        if self.store(id.kind).has_pending() {
            let mut ctx = self.begin(Activity::Resolving)?;
            let result = self.resolve_all(&mut ctx);
            self.release(ctx);
            result?;
        }
        self.bring_online(id)
    }

    // Attribute edits

    pub fn set_attr(
        &mut self,
        id: RecordId,
        tag: &str,
        value: Option<AttrValue>,
    ) -> Result<(), GraphError> {
        self.require_live(id)?;
        let rich = CATALOG.attribute(id.kind, tag)?.kind == AttrKind::RichText;
        let record = self.record_mut(id)?;
        record.set_attr(tag, value)?;
        let fields = (rich && record.is_online()).then(|| record.rich_fields());
        if let Some(fields) = fields {
            self.mentions.update_mentioner(id, &fields);
        }
        Ok(())
    }

    pub fn set_search_key(&mut self, id: RecordId, key: &str) -> Result<(), GraphError> {
        self.require_live(id)?;
        let online = self.record(id)?.is_online();
        let trimmed = if online {
            self.keys.set(id, key)?;
            self.keys.key_of(id).map(str::to_string)
        } else {
            Some(key.trim().to_string()).filter(|k| !k.is_empty())
        };
        self.record_mut(id)?.set_search_key_unchecked(trimmed.clone());
        if online && CATALOG.schema(id.kind).mention_target {
            self.mentions.update_key(id, trimmed.as_deref());
        }
        Ok(())
    }

    /// Replace the connector text of `id`, shared with every record united with it.
    pub fn set_text(&mut self, id: RecordId, text: &str) -> Result<(), GraphError> {
        self.require_live(id)?;
        let connector = self.record_mut(id)?.connector_or_create()?;
        connector.write().text = text.to_string();
        let participants = connector.read().participants.clone();
        self.refresh_mentioners(participants);
        Ok(())
    }

    fn refresh_mentioners(&self, ids: BTreeSet<RecordId>) {
        for id in ids {
            if let Some(record) = self.get(id).filter(|r| r.is_online()) {
                self.mentions.update_mentioner(id, &record.rich_fields());
            }
        }
    }

    /// Make `id` share the connector of `with`, dropping its own text.
    pub fn unite(&mut self, id: RecordId, with: RecordId) -> Result<(), GraphError> {
        self.require_live(id)?;
        self.require_live(with)?;
        self.unite_unchecked(id, with)?;
        self.refresh_mentioners(BTreeSet::from([id]));
        Ok(())
    }

    pub(crate) fn unite_unchecked(&mut self, id: RecordId, with: RecordId) -> Result<(), GraphError> {
        if id.kind != with.kind {
            return Err(GraphError::TypeMismatch(format!(
                "Only records of the same type can be united, received {id} and {with}"
            )));
        }
        if id == with {
            return Ok(());
        }
        let shared = self.record_mut(with)?.connector_or_create()?;
        self.record_mut(id)?.join_connector(shared);
        Ok(())
    }

    /// Give `id` a private copy of the text it shared with other records.
    pub fn separate(&mut self, id: RecordId) -> Result<(), GraphError> {
        self.require_live(id)?;
        let record = self.record_mut(id)?;
        let Some(text) = record.leave_connector() else {
            return Ok(());
        };
        let own = record.connector_or_create()?;
        own.write().text = text;
        Ok(())
    }

    // Relations

    pub fn connect(
        &mut self,
        kind: RelationKind,
        subject: RecordId,
        object: RecordId,
        attrs: EdgeAttrs,
    ) -> Result<(), GraphError> {
        self.require_live(subject)?;
        self.require_live(object)?;
        let result = self.relation_mut(kind).connect(subject, object, attrs);
        self.flush_events();
        result
    }

    pub fn disconnect(
        &mut self,
        kind: RelationKind,
        subject: RecordId,
        object: RecordId,
    ) -> bool {
        let removed = self.relation_mut(kind).disconnect(subject, object);
        self.flush_events();
        removed
    }

    pub fn set_edge_attr<T: serde::Serialize>(
        &mut self,
        kind: RelationKind,
        subject: RecordId,
        object: RecordId,
        tag: &str,
        value: Option<T>,
    ) -> Result<(), GraphError> {
        self.relation_mut(kind)
            .set_edge_attr(subject, object, tag, value)
    }

    /// Records related to `id` through any relation, as (relation, other end) pairs.
    pub fn neighbours(&self, id: RecordId) -> Vec<(RelationKind, RecordId)> {
        let mut found = Vec::new();
        for def in CATALOG.relations_touching(id.kind) {
            let set = self.relation(def.kind);
            if def.subject == id.kind {
                found.extend(set.objects(id).map(|o| (def.kind, o)));
            }
            if def.object == id.kind {
                found.extend(set.subjects(id).map(|s| (def.kind, s)));
            }
        }
        found
    }

    /// Re-parent subjects lacking an object where the relation expects one to the sentinel of the
    /// object type. Returns the re-parented records.
    pub fn reparent_orphans(&mut self) -> Result<Vec<RecordId>, GraphError> {
        let mut reparented = Vec::new();
        for def in CATALOG.relations().filter(|def| def.expects_object) {
            let Some(root) = def.object.sentinel_id() else {
                continue;
            };
            if !self.is_live(root) {
                continue;
            }
            let live: Vec<RecordId> = self.store(def.subject).live_ids().collect();
            let orphans = self.relation(def.kind).orphans(live);
            for orphan in orphans {
                self.relation_mut(def.kind)
                    .connect(orphan, root, EdgeAttrs::new())?;
                tracing::debug!("[reparent_orphans] {orphan} -> {root}");
                reparented.push(orphan);
            }
        }
        self.flush_events();
        Ok(reparented)
    }

    // Observers and events

    pub fn subscribe(&mut self) -> UnboundedReceiver<GraphEvent> {
        self.events.subscribe()
    }

    /// Register a synchronous observer of one relation kind. Observers run in registration order,
    /// after the mentions index.
    pub fn register_observer(&mut self, kind: RelationKind, observer: Arc<dyn RelationObserver>) {
        self.relation_mut(kind).observe(observer.clone());
        self.observers.push((kind, observer));
    }

    pub(crate) fn publish(&mut self, event: GraphEvent) {
        self.events.publish(event);
    }

    pub(crate) fn flush_events(&mut self) {
        let changes = std::mem::take(&mut *self.relay.0.lock());
        for change in changes {
            self.events.publish(GraphEvent::RelationChanged(
                change.kind,
                change.subject,
                change.object,
                change.affirm,
            ));
        }
    }

    pub(crate) fn discard_events(&mut self) {
        self.relay.0.lock().clear();
    }

    // Mentions

    pub fn mentions(&self) -> &Arc<MentionsIndex> {
        &self.mentions
    }

    pub fn mentioner_set(&self, target: RecordId, wait: Wait) -> MentionAnswer<BTreeSet<RecordId>> {
        self.mentions.mentioner_set(target, wait)
    }

    pub fn first_mentions(
        &self,
        target: RecordId,
        limit: usize,
        wait: Wait,
    ) -> MentionAnswer<Vec<RecordId>> {
        self.mentions.first_mentions(target, limit, wait)
    }

    /// Copy everything a full mentions build needs out of the online records.
    pub fn mention_snapshot(&self) -> MentionSnapshot {
        let mut snapshot = MentionSnapshot::default();
        for store in self.stores.iter() {
            let schema = CATALOG.schema(store.kind());
            for record in store.iter().filter(|r| r.is_online()) {
                snapshot.live.insert(record.id());
                let fields = record.rich_fields();
                if !fields.is_empty() {
                    snapshot.texts.push((record.id(), fields));
                }
                if schema.mention_target {
                    if let Some(key) = record.search_key() {
                        snapshot.keys.push((record.id(), key.to_string()));
                    }
                }
            }
        }
        for set in self.relations.iter() {
            let flow = set.def().mention;
            if flow == MentionFlow::None {
                continue;
            }
            for (subject, object, _) in set.edges() {
                snapshot.structural.push((subject, object));
                if flow == MentionFlow::Both {
                    snapshot.structural.push((object, subject));
                }
            }
        }
        snapshot
    }

    /// Start a background full build of the mentions index.
    pub fn rebuild_mentions(&self) -> Result<(), GraphError> {
        self.mentions.rebuild(self.mention_snapshot())
    }

    // Whole database

    /// Take over the content of a freshly loaded database, keeping this database's subscribers and
    /// registered observers.
    pub(crate) fn adopt(&mut self, mut loaded: Database, source: &Path) {
        self.mentions.stop();
        loaded.discard_events();
        loaded.events = std::mem::take(&mut self.events);
        for (kind, observer) in std::mem::take(&mut self.observers) {
            loaded.register_observer(kind, observer);
        }
        *self = loaded;
        self.publish(GraphEvent::DatabaseLoaded(source.to_path_buf()));
    }

    /// Ownership of the on-disk database at `path` changed hands. The retained checksums no
    /// longer describe what is on disk, so the next save asks before overwriting.
    pub fn refresh(&mut self, path: &Path) {
        if self.documents.dir.as_deref() == Some(path) {
            tracing::info!("[Database::refresh] resetting checksums for {path:?}");
            self.documents.checksums.clear();
        }
    }

    pub fn documents(&self) -> &DocumentState {
        &self.documents
    }

    /// Drop every record and publish [GraphEvent::DatabaseClosed]. Subscribers stay subscribed.
    pub fn close(&mut self) {
        self.mentions.stop();
        let events = std::mem::take(&mut self.events);
        let observers = std::mem::take(&mut self.observers);
        let mut fresh = Database::with_rich_text(self.config.clone(), self.rich_text());
        fresh.events = events;
        for (kind, observer) in observers {
            fresh.register_observer(kind, observer);
        }
        *self = fresh;
        self.publish(GraphEvent::DatabaseClosed);
    }
}
