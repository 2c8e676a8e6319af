//! driftlog reconcile: the per-trigger change-audit logic.
//!
//! For one resource identity a reconcile fetches the live document, extracts the
//! `{spec, status, annotations}` snapshot, compares its hash against the cached
//! one and, on a change, appends a rendered diff to the resource's audit file.
//! The engine never mutates the watched resource.
//!
//! # Caller contract
//!
//! [`ChangeAuditor::reconcile`] must not run concurrently for the same
//! [`ResourceIdentity`]. The load, compare and store steps are separate cache
//! operations, so two overlapping invocations could both see the old snapshot and
//! write the same change twice, or miss one. The kube-rs controller runtime only
//! runs one reconcile per object reference at a time; other callers can wrap
//! invocations in [`SingleFlight`].

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use driftlog_core::{ClusterApi, ClusterError, ResourceIdentity, ResourceSnapshot, SerializationError, TypeDescriptor};
use driftlog_diff::{render, DiffEngine};
use driftlog_persist::{AuditEntry, AuditSink};
use driftlog_store::StateCache;
use metrics::{counter, histogram};
use tracing::{debug, error, info};

mod single_flight;

pub use single_flight::SingleFlight;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("fetching {id}")]
    Fetch { id: ResourceIdentity, #[source] source: ClusterError },
    #[error("hashing snapshot of {id}")]
    Hash { id: ResourceIdentity, #[source] source: SerializationError },
}

/// What a single reconcile did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Object no longer exists; nothing recorded, cache untouched.
    Gone,
    /// First sighting; snapshot cached, nothing recorded.
    Baseline,
    /// Content hash unchanged.
    Unchanged,
    /// Change recorded in the audit file.
    Audited,
    /// Change detected but the audit entry could not be produced or written.
    /// The cache was still updated.
    AuditLost,
}

impl Outcome {
    fn metric_name(self) -> &'static str {
        match self {
            Outcome::Gone => "reconcile_outcome_gone",
            Outcome::Baseline => "reconcile_outcome_baseline",
            Outcome::Unchanged => "reconcile_outcome_unchanged",
            Outcome::Audited => "reconcile_outcome_audited",
            Outcome::AuditLost => "reconcile_outcome_audit_lost",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Gone => "gone",
            Outcome::Baseline => "baseline",
            Outcome::Unchanged => "unchanged",
            Outcome::Audited => "audited",
            Outcome::AuditLost => "audit-lost",
        };
        f.write_str(s)
    }
}

pub struct ChangeAuditor {
    cluster: Arc<dyn ClusterApi>,
    cache: Arc<StateCache>,
    sink: Arc<dyn AuditSink>,
    diff: DiffEngine,
}

impl ChangeAuditor {
    pub fn new(cluster: Arc<dyn ClusterApi>, cache: Arc<StateCache>, sink: Arc<dyn AuditSink>) -> Self {
        Self { cluster, cache, sink, diff: DiffEngine::default() }
    }

    pub fn with_diff_engine(mut self, diff: DiffEngine) -> Self {
        self.diff = diff;
        self
    }

    pub fn cache(&self) -> &Arc<StateCache> { &self.cache }

    /// Examine one resource of kind `ty`. See the crate docs for the single-flight
    /// requirement.
    pub async fn reconcile(&self, ty: &TypeDescriptor, id: &ResourceIdentity) -> Result<Outcome, ReconcileError> {
        let started = Instant::now();
        counter!("reconcile_total", 1u64);
        let res = self.reconcile_inner(ty, id).await;
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        if let Ok(outcome) = &res {
            counter!(outcome.metric_name(), 1u64);
            debug!(%id, %outcome, took_ms = %started.elapsed().as_millis(), "reconciled");
        }
        res
    }

    async fn reconcile_inner(&self, ty: &TypeDescriptor, id: &ResourceIdentity) -> Result<Outcome, ReconcileError> {
        let doc = match self.cluster.get_object(ty, &id.namespace, &id.name).await {
            Ok(doc) => doc,
            Err(e) if e.is_not_found() => return Ok(Outcome::Gone),
            Err(source) => return Err(ReconcileError::Fetch { id: id.clone(), source }),
        };
        let observed = ResourceSnapshot::observe(&doc);

        let (previous, loaded) = self.cache.load_or_store(id.clone(), observed.clone());
        if !loaded {
            return Ok(Outcome::Baseline);
        }

        let hash_err = |source| ReconcileError::Hash { id: id.clone(), source };
        let old_hash = previous.content_hash().map_err(hash_err)?;
        let new_hash = observed.content_hash().map_err(hash_err)?;
        if old_hash == new_hash {
            return Ok(Outcome::Unchanged);
        }

        let outcome = match self.render_diff(&previous, &observed) {
            Ok(body) => match self.sink.append(&AuditEntry::new(id.clone(), body)) {
                Ok(()) => {
                    let status = observed.mapped_status(&ty.status_mapping);
                    info!(%id, old = %old_hash, new = %new_hash, ?status, "change recorded");
                    Outcome::Audited
                }
                Err(e) => {
                    error!(%id, error = ?e, "audit write failed; change not recorded");
                    Outcome::AuditLost
                }
            },
            Err(e) => {
                error!(%id, error = ?e, "rendering diff failed; change not recorded");
                Outcome::AuditLost
            }
        };
        self.cache.store(id.clone(), observed);
        Ok(outcome)
    }

    fn render_diff(&self, old: &ResourceSnapshot, new: &ResourceSnapshot) -> Result<String, SerializationError> {
        let old_text = old.to_yaml()?;
        let new_text = new.to_yaml()?;
        Ok(render(&self.diff.diff(&old_text, &new_text)))
    }
}
