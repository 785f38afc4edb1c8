//! Reverse index from used-resource identity to the Usages that
//! reference it, maintained from a watch stream. The admission webhook
//! reads this synchronously on every DELETE.

use std::collections::{BTreeMap, HashMap};
use std::pin::pin;
use std::sync::Arc;

use futures_util::StreamExt;
use kube::api::Api;
use kube::core::DynamicObject;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{Config, Event, watcher};
use kube::{Client, ResourceExt};
use tokio::sync::{RwLock, watch};
use tracing::{debug, warn};

use crate::crd::usage::Usage;

/// Index key for a used-resource identity.
pub fn key_for(api_version: &str, kind: &str, name: &str) -> String {
    format!("{api_version}.{kind}.{name}")
}

/// Index key of a Usage, derived from its `of` side. `None` while the
/// selector is unresolved; such Usages pin nothing yet.
pub fn of_key(u: &Usage) -> Option<String> {
    let name = u.spec.of.resolved_name()?;
    Some(key_for(&u.spec.of.api_version, &u.spec.of.kind, name))
}

/// Index key of an arbitrary object, as seen by the webhook. `None` when
/// the admission payload lacks type information.
pub fn object_key(obj: &DynamicObject) -> Option<String> {
    let types = obj.types.as_ref()?;
    let name = obj.metadata.name.as_deref()?;
    Some(key_for(&types.api_version, &types.kind, name))
}

#[derive(Default)]
struct Inner {
    /// of-key -> Usage name -> Usage.
    by_of: HashMap<String, BTreeMap<String, Usage>>,
    /// Usage name -> of-key currently indexed under, so a re-resolved
    /// Usage relocates instead of appearing twice.
    of_keys: HashMap<String, String>,
}

impl Inner {
    fn remove(&mut self, usage_name: &str) {
        if let Some(key) = self.of_keys.remove(usage_name) {
            if let Some(entries) = self.by_of.get_mut(&key) {
                entries.remove(usage_name);
                if entries.is_empty() {
                    self.by_of.remove(&key);
                }
            }
        }
    }

    fn insert(&mut self, u: Usage) {
        let name = u.name_any();
        self.remove(&name);
        if let Some(key) = of_key(&u) {
            self.of_keys.insert(name.clone(), key.clone());
            self.by_of.entry(key).or_default().insert(name, u);
        }
    }
}

pub struct UsageIndex {
    inner: RwLock<Inner>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl Default for UsageIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageIndex {
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            inner: RwLock::new(Inner::default()),
            ready_tx,
            ready_rx,
        }
    }

    pub async fn apply(&self, u: &Usage) {
        self.inner.write().await.insert(u.clone());
    }

    pub async fn delete(&self, u: &Usage) {
        self.inner.write().await.remove(&u.name_any());
    }

    /// Replace the whole index after a watch (re)start.
    pub async fn rehydrate(&self, usages: Vec<Usage>) {
        let mut inner = self.inner.write().await;
        *inner = Inner::default();
        for u in usages {
            inner.insert(u);
        }
    }

    pub async fn usages_for(&self, key: &str) -> Vec<Usage> {
        self.inner
            .read()
            .await
            .by_of
            .get(key)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    pub(crate) fn mark_ready(&self) {
        self.ready_tx.send_replace(true);
    }

    /// Wait until the initial watch listing has been applied. Admission
    /// traffic must not be served before this resolves.
    pub async fn ready(&self) {
        let mut rx = self.ready_rx.clone();
        // send_replace keeps the channel alive for the index lifetime
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

/// Feed the index from a Usage watch until the stream ends. Watch errors
/// are retried with backoff; the previously rehydrated state keeps
/// serving in the meantime.
pub async fn run_index(
    client: Client,
    index: Arc<UsageIndex>,
) -> anyhow::Result<()> {
    let api: Api<Usage> = Api::all(client);
    let mut stream = pin!(watcher(api, Config::default()).default_backoff());
    let mut buffer = Vec::new();
    while let Some(res) = stream.next().await {
        match res {
            Ok(Event::Apply(u)) => index.apply(&u).await,
            Ok(Event::Delete(u)) => index.delete(&u).await,
            Ok(Event::Init) => buffer.clear(),
            Ok(Event::InitApply(u)) => buffer.push(u),
            Ok(Event::InitDone) => {
                debug!(count = buffer.len(), "usage index rehydrated");
                index.rehydrate(std::mem::take(&mut buffer)).await;
                index.mark_ready();
            }
            Err(err) => warn!(error = ?err, "usage watch error"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::usage::{ResourceRef, ResourceUse, UsageSpec};

    fn usage(name: &str, of_kind: &str, of_name: Option<&str>) -> Usage {
        Usage::new(
            name,
            UsageSpec {
                of: ResourceUse {
                    api_version: "example.org/v1".into(),
                    kind: of_kind.into(),
                    resource_ref: of_name
                        .map(|n| ResourceRef { name: n.into() }),
                    selector: None,
                },
                by: None,
            },
        )
    }

    #[test]
    fn key_format_is_apiversion_kind_name() {
        assert_eq!(
            key_for("example.org/v1", "Bucket", "b"),
            "example.org/v1.Bucket.b"
        );
        let u = usage("u1", "Bucket", Some("b"));
        assert_eq!(of_key(&u).as_deref(), Some("example.org/v1.Bucket.b"));
    }

    #[test]
    fn unresolved_usage_has_no_key() {
        let u = usage("u1", "Bucket", None);
        assert_eq!(of_key(&u), None);
    }

    #[tokio::test]
    async fn apply_and_delete_maintain_membership() {
        let idx = UsageIndex::new();
        let key = "example.org/v1.Bucket.b";
        idx.apply(&usage("u1", "Bucket", Some("b"))).await;
        idx.apply(&usage("u2", "Bucket", Some("b"))).await;
        assert_eq!(idx.usages_for(key).await.len(), 2);

        idx.delete(&usage("u1", "Bucket", Some("b"))).await;
        let left = idx.usages_for(key).await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name_any(), "u2");
    }

    #[tokio::test]
    async fn reapply_relocates_a_re_resolved_usage() {
        let idx = UsageIndex::new();
        idx.apply(&usage("u1", "Bucket", Some("old"))).await;
        idx.apply(&usage("u1", "Bucket", Some("new"))).await;
        assert!(
            idx.usages_for("example.org/v1.Bucket.old")
                .await
                .is_empty()
        );
        assert_eq!(
            idx.usages_for("example.org/v1.Bucket.new").await.len(),
            1
        );
    }

    #[tokio::test]
    async fn rehydrate_replaces_previous_state() {
        let idx = UsageIndex::new();
        idx.apply(&usage("stale", "Bucket", Some("gone"))).await;
        idx.rehydrate(vec![usage("u1", "Bucket", Some("b"))]).await;
        assert!(
            idx.usages_for("example.org/v1.Bucket.gone")
                .await
                .is_empty()
        );
        assert_eq!(idx.usages_for("example.org/v1.Bucket.b").await.len(), 1);
    }

    #[tokio::test]
    async fn ready_resolves_after_mark() {
        let idx = UsageIndex::new();
        assert!(!idx.is_ready());
        idx.mark_ready();
        assert!(idx.is_ready());
        idx.ready().await;
    }
}
