#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::events::v1::Event;
use k8s_openapi::api::rbac::v1::ClusterRole;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};
use tokio::task::JoinHandle;
use usage_guard::config::GuardConfig;
use usage_guard::crd::usage::{
    COMPOSITE_LABEL, ResourceRef, ResourceSelector, ResourceUse, Usage,
    UsageSpec,
};

// DNS-1123 safe numeric suffix for unique names
pub const DIGITS: [char; 10] =
    ['0', '1', '2', '3', '4', '5', '6', '7', '8', '9'];
pub fn uniq(prefix: &str) -> String {
    format!("{prefix}-{}", nanoid::nanoid!(6, &DIGITS))
}

pub fn test_config() -> GuardConfig {
    GuardConfig {
        http_port: 0,
        wait_requeue_secs: 2,
        reconcile_timeout_secs: 120,
    }
}

/// Runs the controller for the duration of a test and aborts it on drop.
pub struct ControllerGuard {
    handle: JoinHandle<()>,
}

impl ControllerGuard {
    pub fn spawn(client: Client) -> Self {
        let cfg = test_config();
        let handle = tokio::spawn(async move {
            let _ = usage_guard::controller::run_controller(client, cfg).await;
        });
        Self { handle }
    }
}

impl Drop for ControllerGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub const ROLE_API_VERSION: &str = "rbac.authorization.k8s.io/v1";
pub const ROLE_KIND: &str = "ClusterRole";

pub fn role_use(name: &str) -> ResourceUse {
    ResourceUse {
        api_version: ROLE_API_VERSION.into(),
        kind: ROLE_KIND.into(),
        resource_ref: Some(ResourceRef { name: name.into() }),
        selector: None,
    }
}

pub fn role_selector(labels: BTreeMap<String, String>) -> ResourceUse {
    ResourceUse {
        api_version: ROLE_API_VERSION.into(),
        kind: ROLE_KIND.into(),
        resource_ref: None,
        selector: Some(ResourceSelector {
            match_labels: Some(labels),
            match_controller_ref: None,
        }),
    }
}

pub async fn create_role(
    client: &Client,
    name: &str,
    labels: Option<BTreeMap<String, String>>,
) -> ClusterRole {
    let api: Api<ClusterRole> = Api::all(client.clone());
    let role = ClusterRole {
        metadata: ObjectMeta {
            name: Some(name.into()),
            labels,
            ..Default::default()
        },
        ..Default::default()
    };
    api.create(&PostParams::default(), &role)
        .await
        .expect("create ClusterRole")
}

pub async fn create_usage(
    client: &Client,
    name: &str,
    of: ResourceUse,
    by: Option<ResourceUse>,
) -> Usage {
    let api: Api<Usage> = Api::all(client.clone());
    api.create(&PostParams::default(), &Usage::new(name, UsageSpec { of, by }))
        .await
        .expect("create Usage")
}

pub async fn create_labeled_usage(
    client: &Client,
    name: &str,
    of: ResourceUse,
    by: Option<ResourceUse>,
    labels: BTreeMap<String, String>,
) -> Usage {
    let api: Api<Usage> = Api::all(client.clone());
    let mut usage = Usage::new(name, UsageSpec { of, by });
    usage.metadata.labels = Some(labels);
    api.create(&PostParams::default(), &usage)
        .await
        .expect("create Usage")
}

pub fn composite_labels(value: &str) -> BTreeMap<String, String> {
    [(COMPOSITE_LABEL.to_string(), value.to_string())].into()
}

/// Whether the controller has published an event with `reason` against
/// the named Usage. Cluster-scoped objects get their events recorded in
/// the default namespace.
pub async fn usage_event_seen(
    client: &Client,
    usage_name: &str,
    reason: &str,
) -> bool {
    let api: Api<Event> = Api::namespaced(client.clone(), "default");
    match api.list(&ListParams::default()).await {
        Ok(list) => list.items.iter().any(|e| {
            e.reason.as_deref() == Some(reason)
                && e.regarding
                    .as_ref()
                    .and_then(|r| r.name.as_deref())
                    == Some(usage_name)
        }),
        Err(_) => false,
    }
}

/// Poll until `check` passes or the timeout elapses.
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

pub async fn delete_usage_and_wait(client: &Client, name: &str) {
    let api: Api<Usage> = Api::all(client.clone());
    let _ = api.delete(name, &DeleteParams::default()).await;
    let api2 = api.clone();
    let name = name.to_string();
    wait_until("usage to disappear", Duration::from_secs(60), move || {
        let api = api2.clone();
        let name = name.clone();
        async move {
            matches!(api.get_opt(&name).await, Ok(None))
        }
    })
    .await;
}

pub async fn cleanup_roles(client: &Client, names: &[&str]) {
    let api: Api<ClusterRole> = Api::all(client.clone());
    for n in names {
        let _ = api.delete(n, &DeleteParams::default()).await;
    }
}

pub async fn get_role(client: &Client, name: &str) -> Option<ClusterRole> {
    let api: Api<ClusterRole> = Api::all(client.clone());
    api.get_opt(name).await.expect("get ClusterRole")
}

pub fn has_in_use_label(role: &ClusterRole) -> bool {
    role.labels()
        .get(usage_guard::crd::usage::IN_USE_LABEL)
        .map(String::as_str)
        == Some(usage_guard::crd::usage::IN_USE_VALUE)
}
