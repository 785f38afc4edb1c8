//! Idempotent finalizer and owner-reference edits on object metadata.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    ObjectMeta, OwnerReference,
};
use kube::Resource;
use kube::core::DynamicObject;

use crate::crd::usage::{FINALIZER, ResourceUse, Usage};

pub fn has_finalizer(meta: &ObjectMeta) -> bool {
    meta.finalizers
        .as_ref()
        .map(|f| f.iter().any(|x| x == FINALIZER))
        .unwrap_or(false)
}

/// Add our finalizer; returns false when it was already present.
pub fn add_finalizer(meta: &mut ObjectMeta) -> bool {
    if has_finalizer(meta) {
        return false;
    }
    meta.finalizers
        .get_or_insert_with(Vec::new)
        .push(FINALIZER.to_string());
    true
}

/// Remove our finalizer; returns false when it was not present.
pub fn remove_finalizer(meta: &mut ObjectMeta) -> bool {
    let Some(finalizers) = meta.finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != FINALIZER);
    finalizers.len() != before
}

pub fn owners_include(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.uid == uid))
        .unwrap_or(false)
}

pub fn first_owner_is(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .as_ref()
        .and_then(|refs| refs.first())
        .map(|r| r.uid == uid)
        .unwrap_or(false)
}

/// Append an owner reference unless one with the same UID exists;
/// returns whether the set changed.
pub fn push_owner(meta: &mut ObjectMeta, owner: OwnerReference) -> bool {
    if owners_include(meta, &owner.uid) {
        return false;
    }
    meta.owner_references
        .get_or_insert_with(Vec::new)
        .push(owner);
    true
}

/// UID of the controlling owner, if any. Selector resolution uses this
/// to scope candidates to the same composite parent.
pub fn controller_owner_uid(meta: &ObjectMeta) -> Option<&str> {
    meta.owner_references.as_ref()?.iter().find_map(|r| {
        r.controller
            .unwrap_or(false)
            .then_some(r.uid.as_str())
    })
}

/// The Usage as a non-controlling owner of the used resource. `None`
/// before the Usage has been persisted (no UID yet).
pub fn usage_as_owner(u: &Usage) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: Usage::api_version(&()).into_owned(),
        kind: Usage::kind(&()).into_owned(),
        name: u.metadata.name.clone()?,
        uid: u.metadata.uid.clone()?,
        controller: None,
        block_owner_deletion: None,
    })
}

/// The using resource as owner of the Usage, so the store cascades the
/// Usage once the using resource is gone.
pub fn using_as_owner(
    by: &ResourceUse,
    using: &DynamicObject,
) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: by.api_version.clone(),
        kind: by.kind.clone(),
        name: using.metadata.name.clone()?,
        uid: using.metadata.uid.clone()?,
        controller: None,
        block_owner_deletion: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(uid: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: "example.org/v1".into(),
            kind: "Cluster".into(),
            name: "c".into(),
            uid: uid.into(),
            controller: controller.then_some(true),
            block_owner_deletion: None,
        }
    }

    #[test]
    fn finalizer_add_remove_round_trip() {
        let mut meta = ObjectMeta::default();
        assert!(!has_finalizer(&meta));
        assert!(add_finalizer(&mut meta));
        assert!(!add_finalizer(&mut meta));
        assert_eq!(meta.finalizers.as_ref().unwrap().len(), 1);
        assert!(remove_finalizer(&mut meta));
        assert!(!remove_finalizer(&mut meta));
    }

    #[test]
    fn remove_finalizer_keeps_foreign_entries() {
        let mut meta = ObjectMeta {
            finalizers: Some(vec![
                "other.io/finalizer".into(),
                FINALIZER.into(),
            ]),
            ..Default::default()
        };
        assert!(remove_finalizer(&mut meta));
        assert_eq!(
            meta.finalizers,
            Some(vec!["other.io/finalizer".to_string()])
        );
    }

    #[test]
    fn push_owner_is_idempotent_per_uid() {
        let mut meta = ObjectMeta::default();
        assert!(push_owner(&mut meta, owner("u-1", false)));
        assert!(!push_owner(&mut meta, owner("u-1", false)));
        assert!(push_owner(&mut meta, owner("u-2", false)));
        assert_eq!(meta.owner_references.as_ref().unwrap().len(), 2);
        assert!(owners_include(&meta, "u-1"));
        assert!(first_owner_is(&meta, "u-1"));
        assert!(!first_owner_is(&meta, "u-2"));
    }

    #[test]
    fn controller_owner_uid_skips_non_controllers() {
        let meta = ObjectMeta {
            owner_references: Some(vec![
                owner("plain", false),
                owner("boss", true),
            ]),
            ..Default::default()
        };
        assert_eq!(controller_owner_uid(&meta), Some("boss"));
        assert_eq!(controller_owner_uid(&ObjectMeta::default()), None);
    }

    #[test]
    fn usage_owner_ref_is_non_controlling() {
        use crate::crd::usage::{ResourceRef, UsageSpec};
        let mut u = Usage::new(
            "u1",
            UsageSpec {
                of: ResourceUse {
                    api_version: "example.org/v1".into(),
                    kind: "Bucket".into(),
                    resource_ref: Some(ResourceRef { name: "b".into() }),
                    selector: None,
                },
                by: None,
            },
        );
        assert!(usage_as_owner(&u).is_none());

        u.metadata.uid = Some("uid-1".into());
        let or = usage_as_owner(&u).unwrap();
        assert_eq!(or.kind, "Usage");
        assert_eq!(or.uid, "uid-1");
        assert_eq!(or.controller, None);
    }
}
