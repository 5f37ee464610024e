use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use parley_core::InterfaceError;
use parley_ingest::{
    IngestOutcome, IngestionPipeline, InboundEnvelope, SignatureVerifier, SIGNATURE_HEADER,
};
use serde_json::{json, Value};
use tracing::{error, warn};

#[derive(Clone)]
pub struct WebhookState {
    pub pipeline: Arc<IngestionPipeline>,
    /// Unsigned requests are accepted when no secret is configured.
    pub verifier: Option<SignatureVerifier>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new().route("/v1/inbound", post(receive)).with_state(state)
}

/// Records one inbound event. Processing happens on the worker pool, so the
/// adapter gets its acknowledgement before any reply is generated.
pub async fn receive(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    match record(&state, &headers, &body).await {
        Ok((outcome, correlation_id)) => {
            let (status, label) = match outcome {
                IngestOutcome::Accepted => (StatusCode::ACCEPTED, "accepted"),
                IngestOutcome::Duplicate => (StatusCode::OK, "duplicate"),
            };
            (status, Json(json!({ "status": label, "correlation_id": correlation_id })))
        }
        Err(error) => rejection(&error),
    }
}

async fn record(
    state: &WebhookState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(IngestOutcome, String), InterfaceError> {
    if let Some(verifier) = &state.verifier {
        let signature = headers.get(SIGNATURE_HEADER).and_then(|value| value.to_str().ok());
        verifier.verify(body, signature).map_err(|error| {
            warn!(
                event_name = "ingress.signature_rejected",
                error = %error,
                "inbound webhook signature rejected"
            );
            InterfaceError::Unauthorized(error.to_string())
        })?;
    }

    let envelope: InboundEnvelope = serde_json::from_slice(body)
        .map_err(|error| InterfaceError::Malformed(error.to_string()))?;
    envelope.validate().map_err(|error| InterfaceError::Unprocessable(error.to_string()))?;

    let outcome = state.pipeline.ingest(&envelope).await.map_err(|pipeline_error| {
        error!(
            event_name = "ingress.record_failed",
            correlation_id = %envelope.correlation_id,
            error = %pipeline_error,
            "could not record inbound event"
        );
        InterfaceError::Unavailable(pipeline_error.to_string())
    })?;
    Ok((outcome, envelope.correlation_id))
}

fn rejection(error: &InterfaceError) -> (StatusCode, Json<Value>) {
    let status = StatusCode::from_u16(error.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let payload = json!({
        "status": "rejected",
        "error_class": error.error_class(),
        "error": error.user_message(),
        "retryable": error.is_retryable(),
    });
    (status, Json(payload))
}
