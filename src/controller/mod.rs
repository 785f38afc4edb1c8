use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::events::Recorder;
use kube::runtime::{Controller, watcher};
use kube::{Client, Resource};
use tracing::{error, info};

use crate::config::GuardConfig;
use crate::crd::usage::Usage;
use crate::store::DynamicStore;

pub mod events;
pub mod reconcile;
pub mod refs;
pub mod resolver;
pub mod status;

pub use reconcile::reconcile;

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("cannot get usage")]
    GetUsage(#[source] kube::Error),
    #[error(transparent)]
    Resolve(#[from] resolver::ResolveError),
    #[error("cannot get used resource")]
    GetUsed(#[source] kube::Error),
    #[error("cannot get using resource")]
    GetUsing(#[source] kube::Error),
    #[error("cannot add in-use label to used resource")]
    AddInUseLabel(#[source] kube::Error),
    #[error("cannot remove in-use label from used resource")]
    RemoveInUseLabel(#[source] kube::Error),
    #[error("cannot add owner reference to usage")]
    AddOwnerRef(#[source] kube::Error),
    #[error("cannot list usages")]
    ListUsages(#[source] kube::Error),
    #[error("cannot remove usage finalizer")]
    RemoveFinalizer(#[source] kube::Error),
    #[error("cannot update usage status")]
    UpdateStatus(#[source] kube::Error),
    #[error("reconcile deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Clone)]
pub struct ControllerContext {
    pub client: Client,
    pub store: DynamicStore,
    pub cfg: GuardConfig,
    pub recorder: Recorder,
}

pub async fn run_controller(
    client: Client,
    cfg: GuardConfig,
) -> anyhow::Result<()> {
    let api: Api<Usage> = Api::all(client.clone());
    let recorder = Recorder::new(client.clone(), "usage-guard".into());
    let ctx = Arc::new(ControllerContext {
        client: client.clone(),
        store: DynamicStore::new(client),
        cfg,
        recorder,
    });

    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((_obj_ref, action)) => {
                    info!("reconciled: requeue={:?}", action)
                }
                Err(e) => error!(error = ?e, "reconcile error"),
            }
        })
        .await;

    Ok(())
}

fn error_policy(
    _obj: Arc<Usage>,
    _error: &ReconcileErr,
    _ctx: Arc<ControllerContext>,
) -> Action {
    Action::requeue(Duration::from_secs(60))
}

pub fn build_obj_ref(u: &Usage) -> ObjectReference {
    ObjectReference {
        api_version: Some(Usage::api_version(&()).into_owned()),
        kind: Some(Usage::kind(&()).into_owned()),
        name: u.metadata.name.clone(),
        uid: u.metadata.uid.clone(),
        ..Default::default()
    }
}
