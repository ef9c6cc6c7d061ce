//! Reverse index of "who references record X", textually or structurally.
//!
//! The full build runs on a dedicated thread over a [MentionSnapshot] taken on the writer's thread.
//! The build checks a cancellation flag once per record, so [MentionsIndex::stop] returns quickly;
//! [MentionsIndex::resume] restarts it on the retained snapshot. Incremental updates are always
//! applied to the live state right away. While a build is running or stopped they are also queued
//! and replayed on top of the build result before it replaces the live state. A failed build
//! leaves the live state in place, drops the queue and returns to idle.

use parking_lot::{Condvar, Mutex};
use std::{
    collections::BTreeSet,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use crate::{
    catalog::MentionFlow,
    error::GraphError,
    properties::RecordId,
    relation::{RelationChange, RelationObserver},
    richtext::RichText,
};

pub mod scan;
pub mod state;

pub use scan::PlainText;
pub use state::{MentionSnapshot, MentionState, MentionUpdate};

/// Whether a query issued during a rebuild blocks until the rebuild is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Yes,
    No,
}

/// A query result. `stale` is set when the answer came from the live state while a rebuild was
/// still pending, because the caller chose not to wait or the rebuild is stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionAnswer<T> {
    pub value: T,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildStatus {
    Idle,
    Running,
    Stopped,
}

struct Inner {
    live: MentionState,
    status: RebuildStatus,
    queue: Vec<MentionUpdate>,
    snapshot: Option<Arc<MentionSnapshot>>,
    generation: u64,
    last_error: Option<GraphError>,
}

struct Shared {
    inner: Mutex<Inner>,
    done: Condvar,
    cancel: AtomicBool,
}

pub struct MentionsIndex {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    rich: Arc<dyn RichText>,
    min_key_len: usize,
}

impl std::fmt::Debug for MentionsIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MentionsIndex")
            .field("status", &self.status())
            .field("min_key_len", &self.min_key_len)
            .finish()
    }
}

impl MentionsIndex {
    pub fn new(rich: Arc<dyn RichText>, min_key_len: usize) -> Self {
        MentionsIndex {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    live: MentionState::new(min_key_len),
                    status: RebuildStatus::Idle,
                    queue: Vec::new(),
                    snapshot: None,
                    generation: 0,
                    last_error: None,
                }),
                done: Condvar::new(),
                cancel: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
            rich,
            min_key_len,
        }
    }

    pub fn rich_text(&self) -> &Arc<dyn RichText> {
        &self.rich
    }

    pub fn status(&self) -> RebuildStatus {
        self.shared.inner.lock().status
    }

    pub fn is_rebuilding(&self) -> bool {
        self.status() == RebuildStatus::Running
    }

    /// The error of the most recent failed build, if any.
    pub fn last_error(&self) -> Option<GraphError> {
        self.shared.inner.lock().last_error.clone()
    }

    /// Start a full build from `snapshot` in the background, cancelling any build in progress.
    /// Updates queued so far are discarded: the snapshot already reflects them.
    pub fn rebuild(&self, snapshot: MentionSnapshot) -> Result<(), GraphError> {
        self.stop();
        {
            let mut inner = self.shared.inner.lock();
            inner.queue.clear();
            inner.snapshot = Some(Arc::new(snapshot));
        }
        self.spawn()
    }

    /// Cancel a running build and wait for its thread to exit. The snapshot and the update queue
    /// are kept for [MentionsIndex::resume].
    pub fn stop(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("[MentionsIndex::stop] rebuild thread panicked");
            }
        }
        let mut inner = self.shared.inner.lock();
        if inner.status == RebuildStatus::Running {
            tracing::debug!("[MentionsIndex::stop] rebuild stopped");
            inner.status = RebuildStatus::Stopped;
        }
        self.shared.done.notify_all();
    }

    /// Restart a stopped build on its retained snapshot. Does nothing unless stopped.
    pub fn resume(&self) -> Result<(), GraphError> {
        if self.status() != RebuildStatus::Stopped {
            return Ok(());
        }
        self.spawn()
    }

    fn spawn(&self) -> Result<(), GraphError> {
        let (snapshot, generation) = {
            let mut inner = self.shared.inner.lock();
            let Some(snapshot) = inner.snapshot.clone() else {
                return Err(GraphError::Internal(
                    "Mentions rebuild requested without a snapshot".to_string(),
                ));
            };
            inner.generation += 1;
            inner.status = RebuildStatus::Running;
            inner.last_error = None;
            (snapshot, inner.generation)
        };
        self.shared.cancel.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        let rich = self.rich.clone();
        let min_key_len = self.min_key_len;
        let spawned = std::thread::Builder::new()
            .name("mentions-rebuild".to_string())
            .spawn(move || run_build(shared, rich, snapshot, min_key_len, generation));
        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                let e = GraphError::from(e);
                abandon(&mut self.shared.inner.lock(), &e);
                self.shared.done.notify_all();
                Err(e)
            }
        }
    }

    /// Block until no build is running. Returns at once when none is.
    pub fn wait_until_rebuild_is_done(&self) {
        let mut inner = self.shared.inner.lock();
        while inner.status == RebuildStatus::Running {
            self.shared.done.wait(&mut inner);
        }
    }

    fn apply(&self, update: MentionUpdate) {
        let mut inner = self.shared.inner.lock();
        if let Err(e) = inner.live.apply(&update) {
            tracing::warn!("[MentionsIndex] could not apply {update:?}: {e}");
        }
        if inner.status != RebuildStatus::Idle {
            inner.queue.push(update);
        }
    }

    /// A record came online.
    pub fn add_record(&self, id: RecordId) {
        self.apply(MentionUpdate::Added(id));
    }

    /// Recompute the textual contribution of `id` from the markup of its rich fields.
    pub fn update_mentioner(&self, id: RecordId, fields: &[String]) {
        let plain = PlainText::extract(self.rich.as_ref(), fields);
        self.apply(MentionUpdate::Text(id, plain));
    }

    /// The search key of a mention target changed.
    pub fn update_key(&self, id: RecordId, key: Option<&str>) {
        self.apply(MentionUpdate::Key(id, key.map(str::to_string)));
    }

    /// Drop a purged record as mentioner and as target.
    pub fn remove(&self, id: RecordId) {
        self.apply(MentionUpdate::Removed(id));
    }

    fn answer<T>(&self, wait: Wait, query: impl FnOnce(&MentionState) -> T) -> MentionAnswer<T> {
        let mut inner = self.shared.inner.lock();
        if wait == Wait::Yes {
            while inner.status == RebuildStatus::Running {
                self.shared.done.wait(&mut inner);
            }
        }
        MentionAnswer {
            value: query(&inner.live),
            stale: inner.status != RebuildStatus::Idle,
        }
    }

    /// Does `mentioner` mention `target`? With `own_text_only`, structural edges do not count.
    pub fn mentions(
        &self,
        mentioner: RecordId,
        target: RecordId,
        own_text_only: bool,
        wait: Wait,
    ) -> MentionAnswer<bool> {
        self.answer(wait, |state| state.mentions(mentioner, target, own_text_only))
    }

    pub fn mentioner_set(&self, target: RecordId, wait: Wait) -> MentionAnswer<BTreeSet<RecordId>> {
        self.answer(wait, |state| state.mentioner_set(target))
    }

    /// Up to `limit` mentioners of `target`, in id order.
    pub fn first_mentions(
        &self,
        target: RecordId,
        limit: usize,
        wait: Wait,
    ) -> MentionAnswer<Vec<RecordId>> {
        self.answer(wait, |state| {
            state.mentioner_set(target).into_iter().take(limit).collect()
        })
    }

    /// A copy of the live state, for consistency checks.
    pub fn state(&self, wait: Wait) -> MentionAnswer<MentionState> {
        self.answer(wait, |state| state.clone())
    }
}

fn run_build(
    shared: Arc<Shared>,
    rich: Arc<dyn RichText>,
    snapshot: Arc<MentionSnapshot>,
    min_key_len: usize,
    generation: u64,
) {
    tracing::debug!(
        "[MentionsIndex] rebuild {generation} started over {} records",
        snapshot.texts.len()
    );
    let built = std::panic::catch_unwind(AssertUnwindSafe(|| {
        MentionState::build(&snapshot, rich.as_ref(), min_key_len, &shared.cancel)
    }))
    .unwrap_or_else(|_| Err(GraphError::Internal("Mentions rebuild panicked".to_string())));
    let mut inner = shared.inner.lock();
    if inner.generation != generation || inner.status != RebuildStatus::Running {
        return;
    }
    match built {
        Ok(Some(mut state)) => {
            let queue = std::mem::take(&mut inner.queue);
            for update in queue.iter() {
                if let Err(e) = state.apply(update) {
                    tracing::warn!("[MentionsIndex] could not replay {update:?}: {e}");
                }
            }
            tracing::debug!(
                "[MentionsIndex] rebuild {generation} done, replayed {} queued updates",
                queue.len()
            );
            inner.live = state;
            inner.snapshot = None;
            inner.status = RebuildStatus::Idle;
        }
        // Cancelled. `stop` marks the status once the thread has been joined.
        Ok(None) => return,
        Err(e) => {
            tracing::error!("[MentionsIndex] rebuild {generation} failed: {e}");
            abandon(&mut inner, &e);
        }
    }
    shared.done.notify_all();
}

/// Give up on a build. The queued updates are already part of the live state.
fn abandon(inner: &mut Inner, error: &GraphError) {
    if !inner.queue.is_empty() {
        tracing::debug!(
            "[MentionsIndex] dropping {} queued updates of the abandoned rebuild",
            inner.queue.len()
        );
    }
    inner.queue.clear();
    inner.snapshot = None;
    inner.status = RebuildStatus::Idle;
    inner.last_error = Some(error.clone());
}

impl RelationObserver for MentionsIndex {
    fn relation_changed(&self, change: &RelationChange) {
        let delta = if change.affirm { 1 } else { -1 };
        match change.kind.def().mention {
            MentionFlow::None => {}
            MentionFlow::Forward => {
                self.apply(MentionUpdate::Structural(change.subject, change.object, delta));
            }
            MentionFlow::Both => {
                self.apply(MentionUpdate::Structural(change.subject, change.object, delta));
                self.apply(MentionUpdate::Structural(change.object, change.subject, delta));
            }
        }
    }
}

impl Drop for MentionsIndex {
    fn drop(&mut self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.get_mut().take() {
            let _ = handle.join();
        }
    }
}
