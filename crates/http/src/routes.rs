use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use serde::{Deserialize, Serialize};
use tarry_broker::{MessageId, PollOutcome};
use tarry_metrics::StatsReport;

use crate::error::{ApiError, ErrorBody};
use crate::server::HttpServer;

const STATS_PAGE: &str = include_str!("../assets/stats.html");

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientQuery {
    pub client_name: Option<String>,
    pub message_id: Option<String>,
}

impl ClientQuery {
    fn client_name(&self) -> Result<&str, ApiError> {
        match self.client_name.as_deref() {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(ApiError::bad_request("missing clientName")),
        }
    }

    fn message_id(&self) -> Result<MessageId, ApiError> {
        let raw = self
            .message_id
            .as_deref()
            .ok_or_else(|| ApiError::bad_request("missing messageId"))?;
        raw.parse()
            .map_err(|_| ApiError::bad_request(format!("invalid messageId {raw}")))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub result: bool,
    pub message: String,
    pub message_id: MessageId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    pub result: bool,
    pub message_id: MessageId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub result: bool,
}

/// Long poll: answers right away when a message is ready, otherwise holds
/// the request until one is. A client disconnect drops this future and with
/// it the parked poll.
pub async fn poll(
    State(server): State<Arc<HttpServer>>,
    Query(query): Query<ClientQuery>,
) -> Result<Json<PollResponse>, ApiError> {
    let client = query.client_name()?;

    let delivery = match server.broker.poll(client) {
        PollOutcome::Ready(delivery) => delivery,
        PollOutcome::Parked(pending) => {
            tracing::debug!(client, waiter_id = pending.waiter_id(), "entering long poll");
            pending.recv().await.ok_or_else(|| {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "broker shutting down")
            })?
        }
    };

    Ok(Json(PollResponse {
        result: true,
        message: String::from_utf8_lossy(&delivery.payload).into_owned(),
        message_id: delivery.message_id,
    }))
}

pub async fn ack(
    State(server): State<Arc<HttpServer>>,
    Query(query): Query<ClientQuery>,
) -> Result<Json<AckResponse>, ApiError> {
    let client = query.client_name()?;
    let message_id = query.message_id()?;

    server.broker.ack(client, message_id)?;
    Ok(Json(AckResponse { result: true }))
}

pub async fn publish(
    State(server): State<Arc<HttpServer>>,
    body: Bytes,
) -> Json<PublishResponse> {
    let message_id = server.broker.publish(body);
    Json(PublishResponse {
        result: true,
        message_id,
    })
}

pub async fn stats(State(server): State<Arc<HttpServer>>) -> Json<StatsReport> {
    Json(server.metrics.report())
}

pub async fn stats_page() -> Html<&'static str> {
    Html(STATS_PAGE)
}

pub async fn live() -> &'static str {
    "ok"
}

pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            result: false,
            error: "endpoint not found".to_string(),
        }),
    )
}
