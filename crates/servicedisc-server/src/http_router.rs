//! HTTP routes of a hosted service
//!
//! - `GET /{method}?name=value&...` invokes with query parameters only
//! - `POST /{method}?name=value&...` additionally binds the request body to
//!   the method's stream parameter
//!
//! Responses: `200` with the encoded value or streamed bytes, `204` when the
//! method produced no value, `404` for unknown methods, `500` when the
//! invocation failed.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::TryStreamExt;
use servicedisc_common::dispatch::CallOutput;
use servicedisc_common::protocol::{Result, ServiceDiscError};
use servicedisc_common::stream::ByteStream;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::invoker::ServiceInvoker;

/// Builds the router serving `invoker`'s service.
pub fn service_router(invoker: Arc<ServiceInvoker>) -> Router {
    Router::new()
        .route("/:method", get(handle_get).post(handle_post))
        .with_state(invoker)
}

async fn handle_get(
    State(invoker): State<Arc<ServiceInvoker>>,
    Path(method): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let result = invoker
        .invoke(&method, |name| query.get(name).cloned(), None)
        .await;
    into_response(&method, result)
}

async fn handle_post(
    State(invoker): State<Arc<ServiceInvoker>>,
    Path(method): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    body: Body,
) -> Response {
    let stream = body
        .into_data_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    let result = invoker
        .invoke(
            &method,
            |name| query.get(name).cloned(),
            Some(ByteStream::new(stream)),
        )
        .await;
    into_response(&method, result)
}

fn into_response(method: &str, result: Result<CallOutput>) -> Response {
    match result {
        Ok(CallOutput::None) => StatusCode::NO_CONTENT.into_response(),
        Ok(CallOutput::Encoded(text)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            text,
        )
            .into_response(),
        Ok(CallOutput::Stream(stream)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Body::from_stream(stream),
        )
            .into_response(),
        Err(ServiceDiscError::MethodNotFound(name)) => {
            debug!("Request for unknown method {}", name);
            (StatusCode::NOT_FOUND, format!("Method not found: {}", name)).into_response()
        }
        Err(e) => {
            warn!("Call to {} failed: {}", method, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
