use serde_json::{Value as JsonValue, json};

use crate::crd::usage::{
    Condition, ConditionStatus, ConditionType, UsageStatus,
};

pub fn synced_ready(now: String) -> UsageStatus {
    UsageStatus {
        conditions: Some(vec![
            Condition {
                type_: ConditionType::Synced,
                status: ConditionStatus::True,
                reason: Some("ReconcileSuccess".into()),
                message: None,
                last_transition_time: Some(now.clone()),
            },
            Condition {
                type_: ConditionType::Ready,
                status: ConditionStatus::True,
                reason: Some("Available".into()),
                message: None,
                last_transition_time: Some(now),
            },
        ]),
    }
}

pub fn unsynced(now: String, reason: &str, message: String) -> UsageStatus {
    UsageStatus {
        conditions: Some(vec![Condition {
            type_: ConditionType::Synced,
            status: ConditionStatus::False,
            reason: Some(reason.into()),
            message: Some(message),
            last_transition_time: Some(now),
        }]),
    }
}

/// Whether the desired status differs from the current one once
/// transition timestamps are ignored. A synced Usage reconciles to zero
/// writes.
pub fn should_patch_status(
    current: Option<&UsageStatus>,
    desired: &UsageStatus,
) -> bool {
    match current {
        None => true,
        Some(cur) => normalize(cur) != normalize(desired),
    }
}

fn normalize(s: &UsageStatus) -> JsonValue {
    let mut v = serde_json::to_value(s).unwrap_or_else(|_| json!({}));
    if let Some(JsonValue::Array(conds)) = v.get_mut("conditions") {
        for c in conds.iter_mut() {
            if let Some(obj) = c.as_object_mut() {
                obj.remove("lastTransitionTime");
            }
        }
    }
    v
}
