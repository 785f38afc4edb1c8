//! Resolves label selectors on a Usage spec to concrete resource names.

use std::collections::BTreeMap;

use kube::api::{Api, PostParams};
use kube::core::DynamicObject;
use kube::{Resource, ResourceExt};

use super::refs;
use crate::crd::usage::{ResourceRef, ResourceUse, Usage};
use crate::store::DynamicStore;

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("no {kind} matches the selector")]
    NoMatch { kind: String },
    #[error("selector matches {count} {kind} resources, want exactly one")]
    Ambiguous { kind: String, count: usize },
    #[error("cannot list selector candidates")]
    Transient(#[source] kube::Error),
    #[error("cannot persist resolved references")]
    Persist(#[source] kube::Error),
}

impl ResolveError {
    /// Ambiguity and no-match persist until the cluster changes; store
    /// errors clear on retry.
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::NoMatch { .. } | Self::Ambiguous { .. })
    }
}

/// Resolve any pending selectors, write the names into the spec and
/// persist under the Usage's current resourceVersion. Returns the
/// persisted Usage when something was resolved, `Ok(None)` when both
/// sides already carry names (the steady-state no-op).
pub async fn resolve_selectors(
    usages: &Api<Usage>,
    store: &DynamicStore,
    u: &Usage,
) -> Result<Option<Usage>, ResolveError> {
    let of_pending = u.spec.of.resolved_name().is_none();
    let by_pending = u
        .spec
        .by
        .as_ref()
        .is_some_and(|b| b.resolved_name().is_none());
    if !of_pending && !by_pending {
        return Ok(None);
    }

    let controller_uid =
        refs::controller_owner_uid(u.meta()).map(str::to_string);
    let mut resolved = u.clone();
    if of_pending {
        let name =
            resolve_side(store, &u.spec.of, controller_uid.as_deref()).await?;
        resolved.spec.of.resource_ref = Some(ResourceRef { name });
    }
    if by_pending {
        if let Some(by) = u.spec.by.as_ref() {
            let name =
                resolve_side(store, by, controller_uid.as_deref()).await?;
            if let Some(by_mut) = resolved.spec.by.as_mut() {
                by_mut.resource_ref = Some(ResourceRef { name });
            }
        }
    }

    let updated = usages
        .replace(&resolved.name_any(), &PostParams::default(), &resolved)
        .await
        .map_err(ResolveError::Persist)?;
    Ok(Some(updated))
}

async fn resolve_side(
    store: &DynamicStore,
    side: &ResourceUse,
    controller_uid: Option<&str>,
) -> Result<String, ResolveError> {
    let Some(selector) = side.selector.as_ref() else {
        // Neither a name nor a selector: nothing can ever match.
        return Err(ResolveError::NoMatch {
            kind: side.kind.clone(),
        });
    };
    let candidates = store
        .list_labeled(
            &side.api_version,
            &side.kind,
            &format_labels(selector.match_labels.as_ref()),
        )
        .await
        .map_err(ResolveError::Transient)?;
    let scope_uid = selector
        .match_controller_ref
        .unwrap_or(false)
        .then_some(controller_uid)
        .flatten();
    select_one(&candidates, scope_uid, &side.kind)
        .map(|obj| obj.name_any())
}

fn format_labels(labels: Option<&BTreeMap<String, String>>) -> String {
    labels
        .map(|m| {
            m.iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default()
}

fn select_one<'a>(
    candidates: &'a [DynamicObject],
    controller_uid: Option<&str>,
    kind: &str,
) -> Result<&'a DynamicObject, ResolveError> {
    let matched: Vec<_> = candidates
        .iter()
        .filter(|c| match controller_uid {
            Some(uid) => {
                refs::controller_owner_uid(&c.metadata) == Some(uid)
            }
            None => true,
        })
        .collect();
    match matched.as_slice() {
        [] => Err(ResolveError::NoMatch {
            kind: kind.to_string(),
        }),
        [one] => Ok(*one),
        many => Err(ResolveError::Ambiguous {
            kind: kind.to_string(),
            count: many.len(),
        }),
    }
}
