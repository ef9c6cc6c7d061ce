use petgraph::{
    graphmap::DiGraphMap,
    visit::{depth_first_search, DfsEvent},
};
use std::collections::BTreeSet;

use crate::{
    catalog::{DeleteEffect, CATALOG},
    database::Database,
    error::GraphError,
    event::GraphEvent,
    mentions::RebuildStatus,
    properties::RecordId,
    resolver::{Activity, ResolveContext},
};

impl Database {
    /// Records deleted along with `id`: itself plus everything reachable through relations whose
    /// subjects cascade when their object goes.
    pub fn deletion_closure(&self, id: RecordId) -> BTreeSet<RecordId> {
        let mut graph: DiGraphMap<RecordId, ()> = DiGraphMap::new();
        graph.add_node(id);
        for def in CATALOG
            .relations()
            .filter(|def| def.on_object_delete == DeleteEffect::Cascade)
        {
            for (subject, object, _) in self.relation(def.kind).edges() {
                graph.add_edge(object, subject, ());
            }
        }
        let mut closure = BTreeSet::new();
        depth_first_search(&graph, Some(id), |event| {
            if let DfsEvent::Discover(node, _) = event {
                if !node.is_sentinel() {
                    closure.insert(node);
                }
            }
        });
        closure
    }

    /// Delete `id` and its cascade closure. Returns the purged records.
    ///
    /// Once the first record is expired the pass runs to completion: detach, resolve, cleanup,
    /// purge. Faults raised along the way are collected and the first one is returned after the
    /// pass; expired records are never brought back.
    pub fn delete(&mut self, id: RecordId) -> Result<Vec<RecordId>, GraphError> {
        if id.is_sentinel() {
            return Err(GraphError::Protected(format!("{id} cannot be deleted")));
        }
        match self.get(id) {
            Some(record) if !record.is_expired() => {}
            _ => return Err(GraphError::NotFound(format!("{id}"))),
        }
        let mut ctx = self.begin(Activity::Deleting)?;

        let was_rebuilding = self.mentions().status() == RebuildStatus::Running;
        self.mentions().stop();

        let closure = self.deletion_closure(id);
        tracing::info!("[Database::delete] {id} cascades to {} records", closure.len());
        let mut faults = Vec::new();
        for target in closure.iter() {
            if let Err(e) = self.expire(*target, &ctx) {
                faults.push(e);
            }
        }
        if let Err(e) = self.resolve_all(&mut ctx) {
            faults.push(e);
        }
        let purged = match self.cleanup_and_purge(&ctx) {
            Ok(purged) => purged,
            Err(e) => {
                faults.push(e);
                Vec::new()
            }
        };

        if was_rebuilding {
            if let Err(e) = self.mentions().resume() {
                faults.push(e);
            }
        }
        self.end(ctx);
        for gone in purged.iter() {
            self.publish(GraphEvent::RecordDeleted(*gone));
        }
        match faults.into_iter().next() {
            Some(first) => {
                tracing::warn!("[Database::delete] cascade from {id} completed with faults: {first}");
                Err(first)
            }
            None => Ok(purged),
        }
    }

    /// Mark one record expired and detach every edge touching it.
    fn expire(&mut self, id: RecordId, ctx: &ResolveContext) -> Result<(), GraphError> {
        ctx.require_cascade("expire")?;
        self.store_mut(id.kind).expire(id.number)?;
        for def in CATALOG.relations_touching(id.kind) {
            self.relation_mut(def.kind).detach(id);
        }
        self.keys_mut().remove(id);
        tracing::debug!("[Database::expire] {id}");
        Ok(())
    }

    /// Drop edges to expired records and purge them from their stores.
    fn cleanup_and_purge(&mut self, ctx: &ResolveContext) -> Result<Vec<RecordId>, GraphError> {
        ctx.require_cascade("cleanup")?;
        let live: BTreeSet<RecordId> = self
            .stores()
            .flat_map(|store| store.live_ids())
            .collect();
        let mut dropped = 0;
        for def in CATALOG.relations() {
            dropped += self
                .relation_mut(def.kind)
                .cleanup(|id| live.contains(&id));
        }
        if dropped > 0 {
            tracing::debug!("[Database::cleanup] dropped {dropped} edges to expired records");
        }

        let mut purged = Vec::new();
        for kind in crate::properties::RecordType::all() {
            for mut record in self.store_mut(kind).purge() {
                record.leave_connector();
                self.mentions().remove(record.id());
                purged.push(record.id());
            }
        }
        Ok(purged)
    }
}
