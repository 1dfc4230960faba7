use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use json_patch::Patch;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::classifier::{self, DecodeError};
use crate::engine::{AdmissionEngine, PolicyDecision, WebhookMode};
use crate::metrics::{DecisionLabels, RequestLabels, WebhookLabels, WebhookMetrics};

pub struct AppState {
    pub engine: AdmissionEngine,
    pub metrics: WebhookMetrics,
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("could not encode response: {0}")]
    Serialization(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

pub async fn handle_validate(
    state: State<SharedState>,
    body: Json<Value>,
) -> Result<Json<Value>, WebhookError> {
    handle_webhook(state, body, WebhookMode::Validate)
}

pub async fn handle_mutate(
    state: State<SharedState>,
    body: Json<Value>,
) -> Result<Json<Value>, WebhookError> {
    handle_webhook(state, body, WebhookMode::Mutate)
}

fn handle_webhook(
    State(state): State<SharedState>,
    Json(mut body): Json<Value>,
    mode: WebhookMode,
) -> Result<Json<Value>, WebhookError> {
    let start = Instant::now();
    let webhook = mode.as_str();

    let raw_object = classifier::take_raw_object(&mut body);
    let request_uid = body
        .pointer("/request/uid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let review: AdmissionReview<DynamicObject> = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            warn!(uid = %request_uid, "failed to deserialize AdmissionReview: {e}");
            return review_to_json(invalid_review(
                &request_uid,
                format!("failed to deserialize request: {e}"),
            ));
        }
    };

    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(r) => r,
        Err(e) => {
            warn!("AdmissionReview missing request field: {e}");
            return review_to_json(invalid_review(
                &request_uid,
                "missing request field in AdmissionReview",
            ));
        }
    };

    info!(
        uid = %req.uid,
        kind = %req.kind.kind,
        namespace = req.namespace.as_deref().unwrap_or(""),
        name = %req.name,
        operation = ?req.operation,
        webhook,
        "admission request received"
    );
    record_request_metrics(&state, &req, webhook);

    let response = evaluate(&state, &req, webhook, || {
        state.engine.decide(mode, &req, raw_object.as_ref())
    });
    observe_request_duration(&state, webhook, start);

    let response = response.inspect_err(|e| error!(uid = %req.uid, "{e}"))?;
    review_to_json(response.into_review())
}

/// Runs `decide` and turns its outcome into a response. A decode failure is
/// denied with the error message; a panic fails open with a warning.
fn evaluate<F>(
    state: &AppState,
    req: &AdmissionRequest<DynamicObject>,
    webhook: &'static str,
    decide: F,
) -> Result<AdmissionResponse, WebhookError>
where
    F: FnOnce() -> Result<PolicyDecision, DecodeError>,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(decide)) {
        Ok(Ok(decision)) => {
            record_decision(state, webhook, decision.as_str());
            if let PolicyDecision::PatchProduced(edits) = &decision {
                state.metrics.patch_operations_total.inc_by(edits.len() as u64);
            }
            build_response(req, decision)
        }
        Ok(Err(e)) => {
            warn!(uid = %req.uid, "cannot admit object: {e}");
            record_decision(state, webhook, "error");
            Ok(AdmissionResponse::from(req).deny(e.to_string()))
        }
        Err(_) => {
            error!(uid = %req.uid, "policy evaluation panicked, failing open");
            record_decision(state, webhook, "error");
            let mut resp = AdmissionResponse::from(req);
            resp.warnings = Some(vec![
                "label-webhook: internal error during policy evaluation, failing open".to_string(),
            ]);
            Ok(resp)
        }
    }
}

/// Not-allowed review for an envelope that could not be read, echoing the
/// request uid whenever the body carried one.
fn invalid_review(uid: &str, reason: impl ToString) -> AdmissionReview<DynamicObject> {
    let mut resp = AdmissionResponse::invalid(reason);
    resp.uid = uid.to_string();
    resp.into_review()
}

fn review_to_json(review: AdmissionReview<DynamicObject>) -> Result<Json<Value>, WebhookError> {
    serde_json::to_value(review)
        .map(Json)
        .map_err(|e| WebhookError::Serialization(e.to_string()))
}

/// Wraps a decision in the response envelope. The patch is attached only when
/// it holds at least one edit.
pub fn build_response(
    req: &AdmissionRequest<DynamicObject>,
    decision: PolicyDecision,
) -> Result<AdmissionResponse, WebhookError> {
    let resp = AdmissionResponse::from(req);
    match decision {
        PolicyDecision::AllowedUnconditionally
        | PolicyDecision::Allowed
        | PolicyDecision::MutationSkipped => Ok(resp),
        PolicyDecision::Denied(reason) => Ok(resp.deny(reason)),
        PolicyDecision::PatchProduced(edits) if edits.is_empty() => Ok(resp),
        PolicyDecision::PatchProduced(edits) => {
            debug!(uid = %req.uid, edits = edits.len(), "attaching patch");
            resp.with_patch(Patch(edits))
                .map_err(|e| WebhookError::Serialization(e.to_string()))
        }
    }
}

fn record_request_metrics(
    state: &AppState,
    req: &AdmissionRequest<DynamicObject>,
    webhook: &'static str,
) {
    let operation = format!("{:?}", req.operation).to_uppercase();

    state
        .metrics
        .admission_requests_total
        .get_or_create(&RequestLabels {
            operation,
            kind: req.kind.kind.clone(),
            webhook,
        })
        .inc();
}

fn record_decision(state: &AppState, webhook: &'static str, decision: &'static str) {
    state
        .metrics
        .decisions_total
        .get_or_create(&DecisionLabels { webhook, decision })
        .inc();
}

fn observe_request_duration(state: &AppState, webhook: &'static str, start: Instant) {
    state
        .metrics
        .admission_request_duration_seconds
        .get_or_create(&WebhookLabels { webhook })
        .observe(start.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::engine::tests::{deployment, review};
    use prometheus_client::registry::Registry;
    use serde_json::json;

    fn state() -> SharedState {
        let mut registry = Registry::default();
        Arc::new(AppState {
            engine: AdmissionEngine::new(Arc::new(PolicyConfig::default())),
            metrics: WebhookMetrics::new(&mut registry),
        })
    }

    async fn call(mode: WebhookMode, body: Value) -> Value {
        let state = state();
        let Json(out) = match mode {
            WebhookMode::Validate => handle_validate(State(state), Json(body)).await,
            WebhookMode::Mutate => handle_mutate(State(state), Json(body)).await,
        }
        .unwrap();
        out
    }

    #[tokio::test]
    async fn test_validate_denies_unlabelled_deployment() {
        let body = review("Deployment", "default", deployment("default", json!({}), json!({})));
        let out = call(WebhookMode::Validate, body).await;
        let response = &out["response"];
        assert_eq!(response["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(response["allowed"], false);
        assert!(out.to_string().contains("required labels are not set"));
        assert!(response["patch"].is_null());
    }

    #[tokio::test]
    async fn test_mutate_attaches_json_patch() {
        let body = review("Deployment", "default", deployment("default", json!({}), json!({})));
        let out = call(WebhookMode::Mutate, body).await;
        let response = &out["response"];
        assert_eq!(response["allowed"], true);
        assert_eq!(response["patchType"], "JSONPatch");
        assert!(!response["patch"].is_null());
    }

    #[tokio::test]
    async fn test_mutate_already_mutated_has_no_patch() {
        let object = deployment("default", json!({"k8s-ac-test/status": "mutated"}), json!({}));
        let out = call(WebhookMode::Mutate, review("Deployment", "default", object)).await;
        let response = &out["response"];
        assert_eq!(response["allowed"], true);
        assert!(response["patch"].is_null());
        assert!(response["patchType"].is_null());
    }

    #[tokio::test]
    async fn test_decode_failure_is_not_allowed() {
        let pod = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "broken"},
            "spec": {"containers": 42}
        });
        let out = call(WebhookMode::Validate, review("Pod", "default", pod)).await;
        let response = &out["response"];
        assert_eq!(response["allowed"], false);
        assert_eq!(response["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert!(out.to_string().contains("failed to decode Pod object"));
    }

    #[tokio::test]
    async fn test_review_without_request_is_invalid() {
        let body = json!({"apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview"});
        let out = call(WebhookMode::Validate, body).await;
        assert_eq!(out["response"]["allowed"], false);
    }

    #[tokio::test]
    async fn test_non_review_body_is_invalid() {
        let out = call(WebhookMode::Mutate, json!({"hello": "world"})).await;
        assert_eq!(out["response"]["allowed"], false);
    }

    fn admission_request(mut body: Value) -> AdmissionRequest<DynamicObject> {
        classifier::take_raw_object(&mut body);
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(body).unwrap();
        review.try_into().unwrap()
    }

    #[tokio::test]
    async fn test_metadata_schema_mismatch_echoes_uid() {
        let pod = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "broken", "labels": "not-a-map"},
            "spec": {"containers": [{"name": "main", "image": "busybox"}]}
        });
        for mode in [WebhookMode::Validate, WebhookMode::Mutate] {
            let out = call(mode, review("Pod", "default", pod.clone())).await;
            let response = &out["response"];
            assert_eq!(response["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
            assert_eq!(response["allowed"], false);
            assert!(response["patch"].is_null());
            assert!(out.to_string().contains("failed to decode Pod object"));
        }
    }

    #[tokio::test]
    async fn test_unreadable_envelope_echoes_uid() {
        let mut body = review("Deployment", "default", deployment("default", json!({}), json!({})));
        body["request"]["operation"] = json!(42);

        let out = call(WebhookMode::Validate, body).await;
        let response = &out["response"];
        assert_eq!(response["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(response["allowed"], false);
        assert!(out.to_string().contains("failed to deserialize request"));
    }

    #[test]
    fn test_panicking_evaluation_fails_open() {
        let state = state();
        let req = admission_request(review(
            "Deployment",
            "default",
            deployment("default", json!({}), json!({})),
        ));

        let resp = evaluate(&state, &req, "validate", || panic!("evaluation exploded")).unwrap();
        assert!(resp.allowed);
        assert_eq!(resp.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");
        let warnings = resp.warnings.unwrap();
        assert!(warnings[0].contains("failing open"));
    }

    #[test]
    fn test_serialization_error_is_internal_server_error() {
        let response = WebhookError::Serialization("patch too exotic".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_empty_patch_is_plain_allow() {
        let req = admission_request(review(
            "Deployment",
            "default",
            deployment("default", json!({}), json!({})),
        ));

        let resp = build_response(&req, PolicyDecision::PatchProduced(vec![])).unwrap();
        assert!(resp.allowed);
        assert!(resp.patch.is_none());
    }
}
