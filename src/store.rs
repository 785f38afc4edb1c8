//! Thin adapter over the API server for resources only known at runtime
//! by `(apiVersion, kind, name)`.

use kube::api::{Api, ListParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};

/// Split an `apiVersion` string into `(group, version)`. The core group
/// has no `/` and an empty group name.
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Typed access to arbitrary cluster-scoped resources. The plural is
/// inferred from the kind, which holds for the composed kinds this
/// controller pins.
#[derive(Clone)]
pub struct DynamicStore {
    client: Client,
}

impl DynamicStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, api_version: &str, kind: &str) -> Api<DynamicObject> {
        let (group, version) = split_api_version(api_version);
        let gvk = GroupVersionKind::gvk(&group, &version, kind);
        let ar = ApiResource::from_gvk(&gvk);
        Api::all_with(self.client.clone(), &ar)
    }

    pub async fn get(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> Result<DynamicObject, kube::Error> {
        self.api_for(api_version, kind).get(name).await
    }

    /// Get that maps NotFound to `None`; the deletion path treats a
    /// vanished resource as absent rather than as an error.
    pub async fn get_opt(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, kube::Error> {
        self.api_for(api_version, kind).get_opt(name).await
    }

    /// Replace the object, carrying its resourceVersion so a concurrent
    /// writer surfaces as a conflict instead of a lost update.
    pub async fn replace(
        &self,
        api_version: &str,
        kind: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        self.api_for(api_version, kind)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
    }

    pub async fn list_labeled(
        &self,
        api_version: &str,
        kind: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, kube::Error> {
        let lp = ListParams::default().labels(label_selector);
        Ok(self.api_for(api_version, kind).list(&lp).await?.items)
    }
}
