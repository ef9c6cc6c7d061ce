//! Per-type record arenas.
//!
//! A [RecordStore] exclusively owns the records of one [RecordType]. Records are kept in an
//! insertion ordered map keyed by their number, so lookups are O(1) and iteration follows the
//! order records were allocated or loaded in. The store also owns the side table of raw, still
//! unresolved references collected while loading.

use indexmap::IndexMap;
use std::collections::BTreeMap;

use crate::{
    error::GraphError,
    properties::{RecordId, RecordType},
    record::{Lifecycle, PendingRef, Record, RecordState},
};

#[derive(Debug)]
pub struct RecordStore {
    kind: RecordType,
    records: IndexMap<u32, Record>,
    /// No number below this one is free. Lowered when purge or discard releases a number.
    hint: u32,
    pending: BTreeMap<u32, Vec<PendingRef>>,
}

impl RecordStore {
    pub fn new(kind: RecordType) -> Self {
        RecordStore {
            kind,
            records: IndexMap::new(),
            hint: 1,
            pending: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> RecordType {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, number: u32) -> bool {
        self.records.contains_key(&number)
    }

    pub fn get(&self, number: u32) -> Option<&Record> {
        self.records.get(&number)
    }

    pub fn get_mut(&mut self, number: u32) -> Option<&mut Record> {
        self.records.get_mut(&number)
    }

    /// Records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.records.keys().map(|n| RecordId::new(self.kind, *n))
    }

    /// Ids of live (not expired) records.
    pub fn live_ids(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.records
            .values()
            .filter(|r| !r.is_expired())
            .map(|r| r.id())
    }

    /// Reports whether `number` names a record that edges may point at.
    pub fn is_live(&self, number: u32) -> bool {
        self.records
            .get(&number)
            .map(|r| !r.is_expired())
            .unwrap_or(false)
    }

    fn is_protected(&self, number: u32) -> bool {
        self.kind.sentinel() == Some(number)
    }

    /// The lowest number that is neither in use nor protected. Gaps left by explicit numbers are
    /// found by walking up from the hint, so a sparse store costs nothing until it is filled.
    fn lowest_free(&mut self) -> Result<u32, GraphError> {
        let mut candidate = self.hint;
        while self.records.contains_key(&candidate) || self.is_protected(candidate) {
            candidate = candidate.checked_add(1).ok_or_else(|| {
                GraphError::Format(format!("No free {} record number left", self.kind))
            })?;
        }
        self.hint = candidate;
        Ok(candidate)
    }

    fn release(&mut self, number: u32) {
        self.hint = self.hint.min(number);
    }

    /// Instantiate a bare record from a flat state. Any pending references in the state are moved
    /// into the store's side table. Fails with [GraphError::DuplicateRecord] when the requested
    /// number is taken, including by an expired record that has not been purged yet.
    pub fn allocate(&mut self, mut state: RecordState) -> Result<RecordId, GraphError> {
        if state.kind != self.kind {
            return Err(GraphError::TypeMismatch(format!(
                "Cannot allocate a {} record in the {} store",
                state.kind, self.kind
            )));
        }
        let number = match state.number {
            Some(0) => {
                return Err(GraphError::InvalidTag(format!(
                    "{} record numbers start at 1",
                    self.kind
                )))
            }
            Some(number) => {
                if self.records.contains_key(&number) {
                    return Err(GraphError::DuplicateRecord(format!(
                        "{} is already in use",
                        RecordId::new(self.kind, number)
                    )));
                }
                number
            }
            None => self.lowest_free()?,
        };

        let id = RecordId::new(self.kind, number);
        let record = Record::bare(id, &state);
        self.records.insert(number, record);
        let pending = std::mem::take(&mut state.pending);
        if !pending.is_empty() {
            self.pending.insert(number, pending);
        }
        tracing::trace!("[RecordStore::allocate] {id}");
        Ok(id)
    }

    pub(crate) fn set_lifecycle(&mut self, number: u32, lifecycle: Lifecycle) {
        if let Some(record) = self.records.get_mut(&number) {
            record.set_lifecycle(lifecycle);
        }
    }

    /// Mark a record expired. Edge detachment is driven by the owning database, which knows every
    /// relation set touching this type.
    pub(crate) fn expire(&mut self, number: u32) -> Result<(), GraphError> {
        if self.is_protected(number) {
            return Err(GraphError::Protected(format!(
                "{} cannot be deleted",
                RecordId::new(self.kind, number)
            )));
        }
        let record = self.records.get_mut(&number).ok_or_else(|| {
            GraphError::NotFound(format!("{}", RecordId::new(self.kind, number)))
        })?;
        record.set_lifecycle(Lifecycle::Expired);
        self.pending.remove(&number);
        Ok(())
    }

    /// Remove every expired record and free its number. Returns the purged records.
    pub(crate) fn purge(&mut self) -> Vec<Record> {
        let expired: Vec<u32> = self
            .records
            .values()
            .filter(|r| r.is_expired())
            .map(|r| r.id().number)
            .collect();
        let mut purged = Vec::with_capacity(expired.len());
        for number in expired {
            if let Some(record) = self.records.shift_remove(&number) {
                self.release(number);
                purged.push(record);
            }
        }
        purged
    }

    /// Remove a record that never made it online and free its number.
    pub(crate) fn discard(&mut self, number: u32) -> Option<Record> {
        let record = self.records.shift_remove(&number)?;
        self.pending.remove(&number);
        self.release(number);
        Some(record)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub(crate) fn take_pending(&mut self) -> BTreeMap<u32, Vec<PendingRef>> {
        std::mem::take(&mut self.pending)
    }
}
