//! HTTP read path: a lookup form plus a JSON endpoint over [`OrderService`].

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Json, Router};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::service::OrderService;
use crate::store::OrderStore;
use crate::types::{Lookup, ServedFrom};

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Order lookup</title></head>
<body>
  <form method="post" action="/">
    <label for="order_uid">Order UID</label>
    <input id="order_uid" name="order_uid" type="text" autofocus>
    <button type="submit">Find</button>
  </form>
</body>
</html>
"#;

type SharedService<S> = Arc<OrderService<S>>;

/// Build the router. Store calls run on the blocking pool.
pub fn router<S: OrderStore + 'static>(service: SharedService<S>) -> Router {
    Router::new()
        .route("/", get(index).post(lookup_form::<S>))
        .route("/orders/{order_uid}", get(lookup_json::<S>))
        .with_state(service)
}

#[derive(Debug, Deserialize)]
struct LookupForm {
    #[serde(default)]
    order_uid: String,
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Form lookup: plain-text answer naming the source, then the pretty JSON order.
async fn lookup_form<S: OrderStore + 'static>(
    State(service): State<SharedService<S>>,
    Form(form): Form<LookupForm>,
) -> Result<String, ApiError> {
    let lookup = lookup(service, form.order_uid).await?;
    let header = match lookup.served_from {
        ServedFrom::Cache => "Reading from Cache:",
        ServedFrom::Store => "Reading from DB:",
    };
    let json = serde_json::to_string_pretty(&lookup.order)
        .map_err(|e| ApiError::internal(format!("failed to encode order: {e}")))?;
    Ok(format!("{header}\n{json}"))
}

async fn lookup_json<S: OrderStore + 'static>(
    State(service): State<SharedService<S>>,
    Path(order_uid): Path<String>,
) -> Result<Json<Lookup>, ApiError> {
    Ok(Json(lookup(service, order_uid).await?))
}

async fn lookup<S: OrderStore + 'static>(
    service: SharedService<S>,
    order_uid: String,
) -> Result<Lookup, ApiError> {
    let result = tokio::task::spawn_blocking(move || service.get_order(&order_uid))
        .await
        .map_err(|e| ApiError::internal(format!("lookup task failed: {e}")))?;
    let lookup = result?;
    debug!(
        order_uid = %lookup.order.order_uid,
        served_from = %lookup.served_from,
        "lookup answered"
    );
    Ok(lookup)
}

// ── Errors ──

/// Error response: status code plus a JSON `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: String) -> Self {
        warn!(error = %message, "internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::NotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::MissingOrderUid | ServiceError::Decode { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Load { .. } | ServiceError::Persist { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}
