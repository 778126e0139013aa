//! HTTP surface the Expert Advisor polls.
//!
//! The EA pulls with GET /get_order, reports asynchronously with
//! POST /submit_result, and anyone may push fully-specified orders with
//! POST /place_order. Bodies are read raw so malformed JSON maps to the
//! exact `{"error": ...}` shapes the EA side already understands.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::info;

use crate::dispatch::OrderDispatcher;

pub fn router(dispatcher: Arc<OrderDispatcher>) -> Router {
    Router::new()
        .route("/get_order", get(get_order))
        .route("/order_status/{order_id}", get(order_status))
        .route("/submit_result", post(submit_result))
        .route("/place_order", post(place_order))
        .with_state(dispatcher)
}

/// GET /get_order - hand the oldest queued order to the EA, 204 when idle
async fn get_order(State(dispatcher): State<Arc<OrderDispatcher>>) -> Response {
    match dispatcher.dequeue().await {
        Some(order) => {
            info!("sent order to EA: {order}");
            (StatusCode::OK, Json(order)).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// GET /order_status/{order_id} - stored result, or a not-found body.
/// Always 200; the EA switches on the body, not the status code.
async fn order_status(
    State(dispatcher): State<Arc<OrderDispatcher>>,
    Path(order_id): Path<String>,
) -> Response {
    let body = dispatcher
        .status(&order_id)
        .await
        .unwrap_or_else(|| json!({"error": "Order not found"}));
    Json(body).into_response()
}

/// POST /submit_result - execution report from the EA, keyed by order_id
async fn submit_result(State(dispatcher): State<Arc<OrderDispatcher>>, body: Bytes) -> Response {
    let result: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return bad_request("Invalid JSON"),
    };
    match dispatcher.record_result(result).await {
        Ok(order_id) => {
            info!("received order result for {order_id}");
            Json(json!({"status": "result received"})).into_response()
        }
        Err(e) => bad_request(&e.to_string()),
    }
}

/// POST /place_order - explicit submission, single order or ordered batch
async fn place_order(State(dispatcher): State<Arc<OrderDispatcher>>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return bad_request("Invalid JSON"),
    };
    match dispatcher.enqueue_explicit(payload).await {
        Ok(order_ids) => {
            Json(json!({"status": "orders submitted", "order_ids": order_ids})).into_response()
        }
        Err(e) => bad_request(&e.to_string()),
    }
}

fn bad_request(error: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": error}))).into_response()
}
