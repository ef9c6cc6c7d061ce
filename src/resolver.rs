//! Fixpoint resolution of the raw references collected while loading or creating records.
//!
//! Resolution only runs inside a [ResolveContext], and a context can only be obtained from the
//! database gate ([Database::begin]). The gate hands out one context at a time, so a resolution
//! started from inside another resolution or from inside a deletion cascade is an
//! [GraphError::Internal] fault rather than a silent nested pass.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    catalog::RelationKind,
    database::Database,
    error::GraphError,
    properties::{RecordId, RecordType},
    record::{EdgeRole, PendingRef},
};

/// What the database is doing. Anything other than `Idle` holds the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Activity {
    Idle,
    Loading,
    Resolving,
    Deleting,
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolveMode {
    /// Bulk load into a staging database
    Load,
    /// Resolution requested by an edit on the live database
    Edit,
    /// Resolution as part of a deletion cascade
    Cascade,
}

/// A reference dropped because its target does not exist or is expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedReference {
    pub from: RecordId,
    pub target: RecordId,
    /// `None` for connector sharing
    pub relation: Option<RelationKind>,
}

impl fmt::Display for DroppedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.relation {
            Some(kind) => write!(f, "{} {} {}", self.from, kind, self.target),
            None => write!(f, "{} united_with {}", self.from, self.target),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveReport {
    pub passes: usize,
    /// Edges installed from pending references
    pub installed: usize,
    /// Edges installed by default rules
    pub defaults: usize,
    pub united: usize,
    pub dropped: Vec<DroppedReference>,
}

impl ResolveReport {
    /// Number of edge changes made by the resolution.
    pub fn changes(&self) -> usize {
        self.installed + self.defaults + self.united
    }
}

/// Proof of holding the gate, threaded through every resolution step.
#[derive(Debug)]
pub struct ResolveContext {
    activity: Activity,
    mode: ResolveMode,
    again: bool,
    report: ResolveReport,
}

impl ResolveContext {
    pub(crate) fn new(activity: Activity, mode: ResolveMode) -> Self {
        ResolveContext {
            activity,
            mode,
            again: false,
            report: ResolveReport::default(),
        }
    }

    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn mode(&self) -> ResolveMode {
        self.mode
    }

    /// Ask the outer loop for another full pass.
    pub fn request_again(&mut self) {
        self.again = true;
    }

    pub fn report(&self) -> &ResolveReport {
        &self.report
    }

    pub(crate) fn into_report(self) -> ResolveReport {
        self.report
    }

    /// Fails unless this context belongs to a deletion cascade.
    pub(crate) fn require_cascade(&self, step: &str) -> Result<(), GraphError> {
        if self.mode != ResolveMode::Cascade {
            return Err(GraphError::Internal(format!(
                "{step} is only valid inside a deletion cascade, not during {}",
                self.activity
            )));
        }
        Ok(())
    }
}

impl Database {
    /// Repeat resolution passes over every store until no pass requests another.
    pub(crate) fn resolve_all(&mut self, ctx: &mut ResolveContext) -> Result<(), GraphError> {
        let max = self.config().max_resolve_passes;
        loop {
            ctx.again = false;
            for kind in RecordType::all() {
                self.resolve_store(kind, ctx)?;
            }
            ctx.report.passes += 1;
            if !ctx.again {
                break;
            }
            if ctx.report.passes >= max {
                return Err(GraphError::Internal(format!(
                    "Resolution did not converge after {max} passes"
                )));
            }
        }
        tracing::debug!(
            "[resolve_all] {:?} converged after {} passes, {} changes, {} dropped",
            ctx.mode,
            ctx.report.passes,
            ctx.report.changes(),
            ctx.report.dropped.len()
        );
        Ok(())
    }

    /// One pass over the records of `kind`: install pending references, then apply default rules.
    pub(crate) fn resolve_store(
        &mut self,
        kind: RecordType,
        ctx: &mut ResolveContext,
    ) -> Result<(), GraphError> {
        let pending = self.store_mut(kind).take_pending();
        for (number, refs) in pending {
            let from = RecordId::new(kind, number);
            if !self.is_live(from) {
                continue;
            }
            for pending_ref in refs {
                self.resolve_ref(from, pending_ref, ctx)?;
            }
        }
        if kind == RecordType::Person {
            self.default_key_works(ctx)?;
        }
        Ok(())
    }

    fn drop_ref(
        &self,
        from: RecordId,
        target: RecordId,
        relation: Option<RelationKind>,
        ctx: &mut ResolveContext,
    ) {
        let dropped = DroppedReference {
            from,
            target,
            relation,
        };
        tracing::warn!("Dropping reference to missing record: {dropped}");
        ctx.report.dropped.push(dropped);
    }

    fn resolve_ref(
        &mut self,
        from: RecordId,
        pending_ref: PendingRef,
        ctx: &mut ResolveContext,
    ) -> Result<(), GraphError> {
        let target = pending_ref.target();
        if !self.is_live(target) {
            let relation = match &pending_ref {
                PendingRef::Edge { kind, .. } => Some(*kind),
                PendingRef::Unite { .. } => None,
            };
            self.drop_ref(from, target, relation, ctx);
            return Ok(());
        }
        match pending_ref {
            PendingRef::Edge {
                kind, role, attrs, ..
            } => {
                let (subject, object) = match role {
                    EdgeRole::Subject => (from, target),
                    EdgeRole::Object => (target, from),
                };
                self.relation_mut(kind).connect(subject, object, attrs)?;
                ctx.report.installed += 1;
                if kind == RelationKind::Authorship
                    && self.relation(RelationKind::KeyWork).object(object).is_none()
                {
                    ctx.request_again();
                }
            }
            PendingRef::Unite { target } => {
                self.unite_unchecked(from, target)?;
                ctx.report.united += 1;
            }
        }
        Ok(())
    }

    /// A person without a key work adopts the lowest numbered live work they authored.
    fn default_key_works(&mut self, ctx: &mut ResolveContext) -> Result<(), GraphError> {
        let people: Vec<RecordId> = self.store(RecordType::Person).live_ids().collect();
        for person in people {
            if self.relation(RelationKind::KeyWork).object(person).is_some() {
                continue;
            }
            let candidate = self
                .relation(RelationKind::Authorship)
                .subjects(person)
                .filter(|work| self.is_live(*work))
                .min();
            if let Some(work) = candidate {
                tracing::debug!("[default_key_works] {person} adopts {work}");
                self.relation_mut(RelationKind::KeyWork).connect(
                    person,
                    work,
                    Default::default(),
                )?;
                ctx.report.defaults += 1;
            }
        }
        Ok(())
    }
}
