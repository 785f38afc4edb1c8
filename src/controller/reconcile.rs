use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::core::DynamicObject;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, instrument};

use super::events::*;
use super::{
    ControllerContext, ReconcileErr, build_obj_ref, refs, resolver, status,
};
use crate::crd::usage::{
    COMPOSITE_LABEL, IN_USE_LABEL, IN_USE_VALUE, ResourceUse, Usage,
};
use crate::index;

/// Requeue for selector outcomes that only a cluster change can fix.
const RESOLVE_RETRY: Duration = Duration::from_secs(300);

/// A single reconcile pass under the configured hard deadline. A pass
/// that runs out of time counts as a transient error and requeues with
/// backoff.
#[instrument(skip_all, fields(name = %obj.name_any()))]
pub async fn reconcile(
    obj: Arc<Usage>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let deadline = Duration::from_secs(ctx.cfg.reconcile_timeout_secs);
    match tokio::time::timeout(deadline, reconcile_inner(obj, ctx)).await {
        Ok(res) => res,
        Err(_) => Err(ReconcileErr::DeadlineExceeded),
    }
}

async fn reconcile_inner(
    obj: Arc<Usage>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let name = obj.name_any();
    let usages: Api<Usage> = Api::all(ctx.client.clone());
    let wait = Duration::from_secs(ctx.cfg.wait_requeue_secs);

    // Work on a fresh copy; the watch cache lags behind our own writes.
    let Some(mut u) = usages
        .get_opt(&name)
        .await
        .map_err(ReconcileErr::GetUsage)?
    else {
        return Ok(Action::await_change());
    };
    let obj_ref = build_obj_ref(&u);

    match resolver::resolve_selectors(&usages, &ctx.store, &u).await {
        Ok(None) => {}
        Ok(Some(resolved)) => u = resolved,
        Err(err) => {
            debug!(error = %err, "cannot resolve selectors");
            emit_event(
                &ctx.recorder,
                &obj_ref,
                EventType::Warning,
                REASON_RESOLVE_SELECTORS,
                "ResolveSelectors",
                Some(err.to_string()),
            )
            .await;
            let desired = status::unsynced(
                Utc::now().to_rfc3339(),
                REASON_RESOLVE_SELECTORS,
                err.to_string(),
            );
            if status::should_patch_status(u.status.as_ref(), &desired) {
                let _ = usages
                    .patch_status(
                        &name,
                        &PatchParams::default(),
                        &Patch::Merge(&json!({ "status": desired })),
                    )
                    .await;
            }
            // Ambiguity and no-match stay broken until the cluster
            // changes; poll slowly instead of riding the error backoff.
            if err.is_persistent() {
                return Ok(Action::requeue(RESOLVE_RETRY));
            }
            return Err(err.into());
        }
    }

    if u.meta().deletion_timestamp.is_some() {
        return finalize(&ctx, &usages, &u, &obj_ref, wait).await;
    }

    // The finalizer must land before anything touches the used resource,
    // or the garbage collector could reap the Usage mid-flight.
    if !refs::has_finalizer(u.meta()) {
        let mut modified = u.clone();
        refs::add_finalizer(modified.meta_mut());
        match usages
            .replace(&name, &PostParams::default(), &modified)
            .await
        {
            Ok(up) => u = up,
            Err(err) => {
                debug!(error = %err, "cannot add finalizer");
                emit_event(
                    &ctx.recorder,
                    &obj_ref,
                    EventType::Warning,
                    REASON_ADD_FINALIZER,
                    "AddFinalizer",
                    Some(err.to_string()),
                )
                .await;
                return Ok(Action::requeue(wait));
            }
        }
    }

    ensure_in_use(&ctx, &u, &obj_ref).await?;

    if let Some(by) = u.spec.by.clone() {
        u = ensure_owner_ref(&ctx, &usages, u, &by, &obj_ref).await?;
    }

    let desired = status::synced_ready(Utc::now().to_rfc3339());
    if status::should_patch_status(u.status.as_ref(), &desired) {
        usages
            .patch_status(
                &name,
                &PatchParams::default(),
                &Patch::Merge(&json!({ "status": desired })),
            )
            .await
            .map_err(ReconcileErr::UpdateStatus)?;
        emit_event(
            &ctx.recorder,
            &obj_ref,
            EventType::Normal,
            REASON_USAGE_CONFIGURED,
            "Reconcile",
            Some(
                "Usage is synced and blocks deletion of the used resource"
                    .into(),
            ),
        )
        .await;
    }

    Ok(Action::await_change())
}

/// Assert the in-use marker on the used resource: label set and the
/// Usage present among its owners. No-op when both already hold.
async fn ensure_in_use(
    ctx: &ControllerContext,
    u: &Usage,
    obj_ref: &ObjectReference,
) -> Result<(), ReconcileErr> {
    let of = &u.spec.of;
    let Some(used_name) = of.resolved_name() else {
        // Resolution just persisted a name; a racing spec edit may have
        // dropped it again. The next pass re-resolves.
        return Ok(());
    };
    let mut used =
        match ctx.store.get(&of.api_version, &of.kind, used_name).await {
            Ok(used) => used,
            Err(err) => {
                debug!(error = %err, "cannot get used resource");
                emit_event(
                    &ctx.recorder,
                    obj_ref,
                    EventType::Warning,
                    REASON_GET_USED,
                    "GetUsed",
                    Some(err.to_string()),
                )
                .await;
                return Err(ReconcileErr::GetUsed(err));
            }
        };

    let Some(owner) = refs::usage_as_owner(u) else {
        return Ok(());
    };
    if mark_in_use(&mut used, owner) {
        if let Err(err) =
            ctx.store.replace(&of.api_version, &of.kind, &used).await
        {
            debug!(error = %err, "cannot add in-use label");
            emit_event(
                &ctx.recorder,
                obj_ref,
                EventType::Warning,
                REASON_ADD_IN_USE_LABEL,
                "AddInUseLabel",
                Some(err.to_string()),
            )
            .await;
            return Err(ReconcileErr::AddInUseLabel(err));
        }
    }
    Ok(())
}

/// Make the using resource the sole owner of the Usage, so the store
/// cascades the Usage when the using resource goes away.
async fn ensure_owner_ref(
    ctx: &ControllerContext,
    usages: &Api<Usage>,
    u: Usage,
    by: &ResourceUse,
    obj_ref: &ObjectReference,
) -> Result<Usage, ReconcileErr> {
    let Some(using_name) = by.resolved_name() else {
        return Ok(u);
    };
    let using = match ctx
        .store
        .get(&by.api_version, &by.kind, using_name)
        .await
    {
        Ok(using) => using,
        Err(err) => {
            debug!(error = %err, "cannot get using resource");
            emit_event(
                &ctx.recorder,
                obj_ref,
                EventType::Warning,
                REASON_GET_USING,
                "GetUsing",
                Some(err.to_string()),
            )
            .await;
            return Err(ReconcileErr::GetUsing(err));
        }
    };

    let using_uid = using.metadata.uid.clone().unwrap_or_default();
    if refs::first_owner_is(u.meta(), &using_uid) {
        return Ok(u);
    }
    let Some(owner) = refs::using_as_owner(by, &using) else {
        return Ok(u);
    };
    let mut modified = u.clone();
    modified.meta_mut().owner_references = Some(vec![owner]);
    match usages
        .replace(&u.name_any(), &PostParams::default(), &modified)
        .await
    {
        Ok(up) => Ok(up),
        Err(err) => {
            debug!(error = %err, "cannot add owner reference");
            emit_event(
                &ctx.recorder,
                obj_ref,
                EventType::Warning,
                REASON_ADD_OWNER_REF,
                "AddOwnerRef",
                Some(err.to_string()),
            )
            .await;
            Err(ReconcileErr::AddOwnerRef(err))
        }
    }
}

/// Deletion path: same-composite wait, then label cleanup, then
/// finalizer removal, strictly in that order.
async fn finalize(
    ctx: &ControllerContext,
    usages: &Api<Usage>,
    u: &Usage,
    obj_ref: &ObjectReference,
    wait: Duration,
) -> Result<Action, ReconcileErr> {
    // Without our finalizer there is nothing left to undo.
    if !refs::has_finalizer(u.meta()) {
        return Ok(Action::await_change());
    }

    if let Some(by) = u.spec.by.as_ref() {
        if let Some(using_name) = by.resolved_name() {
            match ctx
                .store
                .get_opt(&by.api_version, &by.kind, using_name)
                .await
            {
                Ok(Some(using)) => {
                    // Both members of one composite: let the using
                    // resource go first, or the owner-ref cascade and
                    // this finalizer deadlock each other.
                    if same_composite(u.labels(), using.labels()) {
                        emit_event(
                            &ctx.recorder,
                            obj_ref,
                            EventType::Normal,
                            REASON_WAITING_USING_DELETED,
                            "Delete",
                            Some(format!(
                                "Waiting for {}/{} to be deleted",
                                by.kind, using_name
                            )),
                        )
                        .await;
                        return Ok(Action::requeue(wait));
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(error = %err, "cannot get using resource");
                    emit_event(
                        &ctx.recorder,
                        obj_ref,
                        EventType::Warning,
                        REASON_GET_USING,
                        "GetUsing",
                        Some(err.to_string()),
                    )
                    .await;
                    return Err(ReconcileErr::GetUsing(err));
                }
            }
        }
    }

    if let Some(used_name) = u.spec.of.resolved_name() {
        let of = &u.spec.of;
        match ctx
            .store
            .get_opt(&of.api_version, &of.kind, used_name)
            .await
        {
            Ok(Some(mut used)) => {
                // Refetched above, so the replace below is conditional on
                // the version we counted against.
                let remaining =
                    match remaining_usages(usages, of, used_name, &u.name_any())
                        .await
                    {
                        Ok(n) => n,
                        Err(err) => {
                            debug!(error = %err, "cannot list usages");
                            emit_event(
                                &ctx.recorder,
                                obj_ref,
                                EventType::Warning,
                                REASON_LIST_USAGES,
                                "ListUsages",
                                Some(err.to_string()),
                            )
                            .await;
                            return Err(ReconcileErr::ListUsages(err));
                        }
                    };
                if remaining == 0 && clear_in_use(&mut used) {
                    if let Err(err) = ctx
                        .store
                        .replace(&of.api_version, &of.kind, &used)
                        .await
                    {
                        debug!(error = %err, "cannot remove in-use label");
                        emit_event(
                            &ctx.recorder,
                            obj_ref,
                            EventType::Warning,
                            REASON_REMOVE_IN_USE_LABEL,
                            "RemoveInUseLabel",
                            Some(err.to_string()),
                        )
                        .await;
                        return Err(ReconcileErr::RemoveInUseLabel(err));
                    }
                }
            }
            // Used resource already gone; only the finalizer is left.
            Ok(None) => {}
            Err(err) => {
                debug!(error = %err, "cannot get used resource");
                emit_event(
                    &ctx.recorder,
                    obj_ref,
                    EventType::Warning,
                    REASON_GET_USED,
                    "GetUsed",
                    Some(err.to_string()),
                )
                .await;
                return Err(ReconcileErr::GetUsed(err));
            }
        }
    }

    let mut modified = u.clone();
    refs::remove_finalizer(modified.meta_mut());
    if let Err(err) = usages
        .replace(&u.name_any(), &PostParams::default(), &modified)
        .await
    {
        debug!(error = %err, "cannot remove finalizer");
        emit_event(
            &ctx.recorder,
            obj_ref,
            EventType::Warning,
            REASON_REMOVE_FINALIZER,
            "RemoveFinalizer",
            Some(err.to_string()),
        )
        .await;
        return Err(ReconcileErr::RemoveFinalizer(err));
    }

    Ok(Action::await_change())
}

/// How many other Usages still target the same used resource.
async fn remaining_usages(
    usages: &Api<Usage>,
    of: &ResourceUse,
    used_name: &str,
    self_name: &str,
) -> Result<usize, kube::Error> {
    let key = index::key_for(&of.api_version, &of.kind, used_name);
    let list = usages.list(&ListParams::default()).await?;
    Ok(list
        .items
        .iter()
        .filter(|other| {
            other.name_any() != self_name
                && index::of_key(other).as_deref() == Some(key.as_str())
        })
        .count())
}

fn same_composite(
    a: &BTreeMap<String, String>,
    b: &BTreeMap<String, String>,
) -> bool {
    match (a.get(COMPOSITE_LABEL), b.get(COMPOSITE_LABEL)) {
        (Some(x), Some(y)) => !x.is_empty() && x == y,
        _ => false,
    }
}

/// Set the in-use label and register `owner` on the used resource.
/// Returns whether anything changed.
fn mark_in_use(used: &mut DynamicObject, owner: OwnerReference) -> bool {
    let mut changed = false;
    let labels = used.metadata.labels.get_or_insert_with(BTreeMap::new);
    if labels.get(IN_USE_LABEL).map(String::as_str) != Some(IN_USE_VALUE) {
        labels.insert(IN_USE_LABEL.to_string(), IN_USE_VALUE.to_string());
        changed = true;
    }
    refs::push_owner(&mut used.metadata, owner) || changed
}

/// Drop the in-use label. Returns whether it was present.
fn clear_in_use(used: &mut DynamicObject) -> bool {
    used.metadata
        .labels
        .as_mut()
        .map(|labels| labels.remove(IN_USE_LABEL).is_some())
        .unwrap_or(false)
}
