//! GET/POST `/event-heartbeat` — marks a subscription alive.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;

use crate::broker::Broker;

#[derive(Debug, Deserialize)]
pub(super) struct HeartbeatQuery {
    from: Option<String>,
}

/// Pulse the subscription named by `?from=<subscriptionId>`.
///
/// A missing `from` parameter is the one broker-adjacent case of a
/// malformed request reaching the HTTP boundary; it is rejected here with
/// `400 Bad Request` and never reaches the broker core.
#[tracing::instrument(skip_all)]
pub(super) async fn heartbeat_handler(
    State(broker): State<Broker>,
    Query(query): Query<HeartbeatQuery>,
) -> Result<StatusCode, (StatusCode, &'static str)> {
    let sub_id = query
        .from
        .filter(|id| !id.is_empty())
        .ok_or((StatusCode::BAD_REQUEST, "missing 'from' query parameter"))?;
    broker.pulse(&sub_id);
    Ok(StatusCode::OK)
}
