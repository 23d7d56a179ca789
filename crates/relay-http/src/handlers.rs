use crate::RelayState;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use relay_core::{
    ApiResponse, NewPayment, RelayResult, ResultCode, Sequence, ShopAction, TaskPayload,
    TaskView, ValidationError,
};
use serde::{Deserialize, Serialize};

/// `data` of a successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opened {
    pub sequence: Sequence,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CancelRequest {
    #[serde(default)]
    reason: Option<String>,
}

pub(crate) async fn health() -> impl IntoResponse {
    "ok"
}

pub(crate) async fn get_task(
    State(state): State<RelayState>,
    Path(selector): Path<String>,
) -> Json<ApiResponse<TaskView>> {
    let result = state.engine.query().resolve(&selector).await;
    if let Err(err) = &result {
        tracing::debug!(selector = %selector, code = err.result_code().as_u16(), error = %err, "task query refused");
    }
    Json(ApiResponse::from_result(result))
}

pub(crate) async fn create_payment(
    State(state): State<RelayState>,
    body: Result<Json<NewPayment>, JsonRejection>,
) -> Json<ApiResponse<Opened>> {
    match body {
        Ok(Json(payment)) => opened(state.engine.open(TaskPayload::NewPayment(payment)).await),
        Err(rejection) => malformed(rejection.body_text()),
    }
}

pub(crate) async fn shop_action(
    State(state): State<RelayState>,
    body: Result<Json<ShopAction>, JsonRejection>,
) -> Json<ApiResponse<Opened>> {
    match body {
        Ok(Json(action)) => opened(state.engine.open(TaskPayload::ShopAction(action)).await),
        Err(rejection) => malformed(rejection.body_text()),
    }
}

/// The body is optional; an empty body cancels without a reason.
pub(crate) async fn cancel_payment(
    State(state): State<RelayState>,
    Path(target): Path<String>,
    body: Bytes,
) -> Json<ApiResponse<Opened>> {
    let Ok(target) = target.parse::<u64>() else {
        return invalid(ValidationError::InvalidField {
            field: "sequence",
            reason: format!("`{target}` is not a task sequence"),
        });
    };
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CancelRequest::default()
    } else {
        match serde_json::from_slice::<CancelRequest>(&body) {
            Ok(request) => request,
            Err(err) => return malformed(err.to_string()),
        }
    };
    opened(state.engine.cancel(Sequence(target), request.reason).await)
}

fn opened(result: RelayResult<Sequence>) -> Json<ApiResponse<Opened>> {
    match result {
        Ok(sequence) => Json(ApiResponse::ok(Opened { sequence })),
        Err(err) => {
            tracing::info!(code = err.result_code().as_u16(), error = %err, "submission refused");
            Json(ApiResponse::from_error(&err))
        }
    }
}

fn malformed(detail: String) -> Json<ApiResponse<Opened>> {
    invalid(ValidationError::Malformed(detail))
}

fn invalid(err: ValidationError) -> Json<ApiResponse<Opened>> {
    Json(ApiResponse::failure(
        ResultCode::ValidationFailed,
        err.to_string(),
    ))
}
