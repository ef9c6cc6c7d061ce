//! Collaborators supplied by the embedding application for long-running load and save tasks.

use std::{
    path::Path,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// Receives progress from a long-running task and tells it when to stop.
pub trait TaskHost: Send + Sync {
    /// `done` never decreases within one task.
    fn progress(&self, done: usize, total: usize);
    fn is_cancelled(&self) -> bool;
}

/// Single-instance coordination for a database directory.
pub trait InstanceLock: Send + Sync {
    fn acquire_lock(&self, path: &Path) -> bool;
}

/// Questions the serializer asks before destructive writes.
pub trait SaveHooks: Send + Sync {
    /// The document at `path` changed since this application last read or wrote it.
    fn confirm_overwrite(&self, path: &Path) -> bool;
    /// Saving rewrites documents read at version `from` as version `to`, which older application
    /// releases cannot open.
    fn upgrade_warning(&self, from: u32, to: u32) -> bool;
}

/// Never cancelled, discards progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentHost;

impl TaskHost for SilentHost {
    fn progress(&self, _done: usize, _total: usize) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Records the latest progress and can be cancelled from another thread.
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
    done: AtomicUsize,
    total: AtomicUsize,
}

impl CancelFlag {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.done.store(0, Ordering::SeqCst);
        self.total.store(0, Ordering::SeqCst);
    }

    /// Latest `(done, total)` reported.
    pub fn progress_report(&self) -> (usize, usize) {
        (
            self.done.load(Ordering::SeqCst),
            self.total.load(Ordering::SeqCst),
        )
    }
}

impl TaskHost for CancelFlag {
    fn progress(&self, done: usize, total: usize) {
        self.done.fetch_max(done, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Lock that always succeeds, for embedders that coordinate instances themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLock;

impl InstanceLock for NoLock {
    fn acquire_lock(&self, _path: &Path) -> bool {
        true
    }
}

/// Refuses to overwrite externally modified documents and accepts format upgrades.
#[derive(Debug, Default, Clone, Copy)]
pub struct CautiousHooks;

impl SaveHooks for CautiousHooks {
    fn confirm_overwrite(&self, path: &Path) -> bool {
        tracing::warn!("{path:?} was modified outside of this application, refusing to overwrite");
        false
    }

    fn upgrade_warning(&self, from: u32, to: u32) -> bool {
        tracing::info!("Upgrading documents from version {from} to {to}");
        true
    }
}

/// Answers yes to everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl SaveHooks for AcceptAll {
    fn confirm_overwrite(&self, _path: &Path) -> bool {
        true
    }

    fn upgrade_warning(&self, _from: u32, _to: u32) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_cancel_flag_progress_is_monotonic() {
        let flag = CancelFlag::default();
        flag.progress(3, 10);
        flag.progress(2, 10);
        assert_eq!(flag.progress_report(), (3, 10));
        assert!(!flag.is_cancelled());
        flag.cancel();
        assert!(flag.is_cancelled());
        flag.reset();
        assert_eq!(flag.progress_report(), (0, 0));
        assert!(!flag.is_cancelled());
    }
}
