//! Deletion-admission webhook: denies DELETE on any resource that a
//! Usage marks as in use. Registered for the DELETE verb only with
//! `failurePolicy=Fail`; TLS terminates in front of the pod.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use kube::ResourceExt;
use kube::core::admission::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, Operation,
};
use kube::core::{DynamicObject, Status};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::crd::usage::Usage;
use crate::index::{self, UsageIndex};

pub const WEBHOOK_PATH: &str = "/validate-no-usages";

pub fn router(index: Arc<UsageIndex>) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(validate_no_usages))
        .route("/healthz", get(|| async { "ok" }))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(index)
}

/// Serve the webhook. Binding waits for the index's initial listing so
/// admission traffic never races an empty index.
pub async fn run_webhook_server(
    addr: SocketAddr,
    index: Arc<UsageIndex>,
) -> anyhow::Result<()> {
    index.ready().await;
    let app = router(index);
    info!("webhook listening on {}", addr);
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

async fn validate_no_usages(
    State(index): State<Arc<UsageIndex>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(review_delete(&index, review).await.into_review())
}

pub async fn review_delete(
    index: &UsageIndex,
    review: AdmissionReview<DynamicObject>,
) -> AdmissionResponse {
    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(err) => return AdmissionResponse::invalid(err.to_string()),
    };
    if req.operation != Operation::Delete {
        return errored(&req, 400, "BadRequest", "unexpected operation");
    }
    let Some(old) = req.old_object.as_ref() else {
        return errored(
            &req,
            400,
            "BadRequest",
            "delete request carries no prior object",
        );
    };
    // Fail closed: without a synced index we cannot prove the absence of
    // usages.
    if !index.is_ready() {
        return errored(
            &req,
            500,
            "InternalError",
            "usage index is not synced",
        );
    }
    let Some(key) = index::object_key(old) else {
        return errored(
            &req,
            400,
            "BadRequest",
            "prior object carries no type metadata",
        );
    };
    for usage in index.usages_for(&key).await {
        if of_matches(&usage, old) {
            debug!(usage = %usage.name_any(), %key, "denying delete");
            return AdmissionResponse::from(&req).deny(deny_message(&usage));
        }
    }
    AdmissionResponse::from(&req)
}

fn errored(
    req: &AdmissionRequest<DynamicObject>,
    code: u16,
    reason: &str,
    message: &str,
) -> AdmissionResponse {
    let mut res = AdmissionResponse::from(req);
    res.allowed = false;
    res.result = Status::failure(message, reason).with_code(code);
    res
}

/// The index key hashes identity; compare the fields exactly before
/// denying.
fn of_matches(u: &Usage, obj: &DynamicObject) -> bool {
    let Some(types) = obj.types.as_ref() else {
        return false;
    };
    u.spec.of.api_version == types.api_version
        && u.spec.of.kind == types.kind
        && u.spec.of.resolved_name() == obj.metadata.name.as_deref()
}

fn deny_message(u: &Usage) -> String {
    match u.spec.by.as_ref() {
        Some(by) => format!(
            "The resource is used by {}/{}",
            by.kind,
            by.resolved_name().unwrap_or("unknown")
        ),
        None => {
            format!("The resource is used by Usage/{}", u.name_any())
        }
    }
}
