use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder};

pub const REASON_RESOLVE_SELECTORS: &str = "ResolveSelectors";
pub const REASON_GET_USED: &str = "GetUsedResource";
pub const REASON_GET_USING: &str = "GetUsingResource";
pub const REASON_ADD_IN_USE_LABEL: &str = "AddInUseLabel";
pub const REASON_REMOVE_IN_USE_LABEL: &str = "RemoveInUseLabel";
pub const REASON_ADD_FINALIZER: &str = "AddFinalizer";
pub const REASON_REMOVE_FINALIZER: &str = "RemoveFinalizer";
pub const REASON_ADD_OWNER_REF: &str = "AddOwnerRefToUsage";
pub const REASON_LIST_USAGES: &str = "ListUsages";
pub const REASON_USAGE_CONFIGURED: &str = "UsageConfigured";
pub const REASON_WAITING_USING_DELETED: &str = "WaitingUsingDeleted";

pub async fn emit_event(
    recorder: &Recorder,
    obj_ref: &ObjectReference,
    type_: EventType,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    let _ = recorder
        .publish(
            &Event {
                type_,
                reason: reason.into(),
                note,
                action: action.into(),
                secondary: None,
            },
            obj_ref,
        )
        .await;
}
