//! Reconciler factory: one kube-rs controller per registered kind, all funnelled
//! into the same change auditor.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::{controller::Action, watcher, Controller},
    Client,
};
use tracing::{debug, info, warn};

use driftlog_core::TypeDescriptor;
use driftlog_reconcile::{ChangeAuditor, ReconcileError};
use driftlog_schema::TypeRegistry;

use crate::api_resource;

#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    /// Requeue delay after a successful reconcile.
    pub resync: Duration,
    /// Requeue delay after a failed reconcile.
    pub error_backoff: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self { resync: Duration::from_secs(20), error_backoff: Duration::from_secs(5) }
    }
}

/// A kind to watch and whether owned StatefulSets re-trigger it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerPlan {
    pub ty: TypeDescriptor,
    pub owns_statefulsets: bool,
}

/// Flatten a registry into controller plans: each top-level kind owns its
/// StatefulSets, child kinds are watched on their own.
pub fn plan_controllers(registry: &TypeRegistry) -> Vec<ControllerPlan> {
    fn children(ty: &TypeDescriptor, out: &mut Vec<ControllerPlan>) {
        for child in ty.children.values() {
            out.push(ControllerPlan { ty: child.clone(), owns_statefulsets: false });
            children(child, out);
        }
    }
    let mut out = Vec::new();
    for ty in registry.iter() {
        children(ty, &mut out);
        out.push(ControllerPlan { ty: ty.clone(), owns_statefulsets: true });
    }
    out
}

struct AuditContext {
    auditor: Arc<ChangeAuditor>,
    ty: TypeDescriptor,
    settings: ControllerSettings,
}

async fn reconcile(obj: Arc<DynamicObject>, ctx: Arc<AuditContext>) -> Result<Action, ReconcileError> {
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    let name = obj.metadata.name.clone().unwrap_or_default();
    let id = ctx.ty.identity(namespace, name);
    ctx.auditor.reconcile(&ctx.ty, &id).await?;
    Ok(Action::requeue(ctx.settings.resync))
}

fn error_policy(obj: Arc<DynamicObject>, err: &ReconcileError, ctx: Arc<AuditContext>) -> Action {
    warn!(
        kind = %ctx.ty.kind,
        ns = %obj.metadata.namespace.as_deref().unwrap_or(""),
        name = %obj.metadata.name.as_deref().unwrap_or(""),
        error = ?err,
        "reconcile failed; requeueing"
    );
    Action::requeue(ctx.settings.error_backoff)
}

pub struct ControllerFactory {
    client: Client,
    auditor: Arc<ChangeAuditor>,
    settings: ControllerSettings,
}

impl ControllerFactory {
    pub fn new(client: Client, auditor: Arc<ChangeAuditor>, settings: ControllerSettings) -> Self {
        Self { client, auditor, settings }
    }

    /// Build one running controller per plan. Each future completes when its
    /// controller shuts down (Ctrl-C / SIGTERM).
    pub fn build(&self, registry: &TypeRegistry) -> Vec<BoxFuture<'static, ()>> {
        plan_controllers(registry).into_iter().map(|plan| self.controller(plan)).collect()
    }

    fn controller(&self, plan: ControllerPlan) -> BoxFuture<'static, ()> {
        let ar = api_resource(&plan.ty);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let mut ctrl = Controller::new_with(api, watcher::Config::default(), ar);
        if plan.owns_statefulsets {
            ctrl = ctrl.owns(Api::<StatefulSet>::all(self.client.clone()), watcher::Config::default());
        }
        let kind = plan.ty.kind.clone();
        info!(kind = %kind, gvk = %plan.ty.gvk_key(), owns_statefulsets = plan.owns_statefulsets, "controller wired");
        let ctx = Arc::new(AuditContext { auditor: self.auditor.clone(), ty: plan.ty, settings: self.settings });
        ctrl.shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(move |res| {
                match res {
                    Ok((obj, _)) => debug!(kind = %kind, obj = %obj.name, "reconcile ok"),
                    Err(e) => debug!(kind = %kind, error = %e, "controller event error"),
                }
                futures::future::ready(())
            })
            .boxed()
    }
}
