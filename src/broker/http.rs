//! Client-facing HTTP endpoint.
//!
//! Application servers multicast every client edit to the whole cluster;
//! only the leader accepts, and followers answer 403 so the sender knows
//! to rely on another broker. The router is built per broker instance, so
//! several brokers can live in one process.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tracing::debug;

use crate::broker::replication::ReplicationModule;
use crate::message::EditMessage;

pub(crate) fn router(rm: ReplicationModule) -> Router {
    Router::new()
        .route("/crdt", post(submit_edit))
        .route("/logrequest", get(committed_log))
        .with_state(rm)
}

/// `POST /crdt`: 202 when the leader takes the entry (accepted, not yet
/// committed), 403 from everyone else.
async fn submit_edit(
    State(rm): State<ReplicationModule>,
    payload: Result<Json<EditMessage>, JsonRejection>,
) -> Response {
    let Json(message) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            debug!(error = %rejection, "rejecting malformed edit payload");
            return (StatusCode::BAD_REQUEST, "invalid edit payload").into_response();
        }
    };

    let document = message.document_name();
    match rm.submit(&document, message.operation()) {
        Some(index) => (
            StatusCode::ACCEPTED,
            format!("edit accepted at index {index}"),
        )
            .into_response(),
        None => (StatusCode::FORBIDDEN, "this broker is not the leader").into_response(),
    }
}

/// `GET /logrequest`: the totally ordered committed operations, leader
/// only. Recovering application servers replay the body in order.
async fn committed_log(State(rm): State<ReplicationModule>) -> Response {
    match rm.committed_operations() {
        Some(operations) => Json(operations).into_response(),
        None => (StatusCode::FORBIDDEN, "this broker is not the leader").into_response(),
    }
}
