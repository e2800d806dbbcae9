//! GET `/event-subscribers` — admin enumeration of live subscriptions.
//! No authorization is performed; see the module doc comment on
//! [`super::create_event_router`].

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::broker::Broker;

#[derive(Debug, Deserialize)]
pub(super) struct SubscribersQuery {
    channel: Option<String>,
}

#[tracing::instrument(skip_all)]
pub(super) async fn subscribers_handler(
    State(broker): State<Broker>,
    Query(query): Query<SubscribersQuery>,
) -> Json<Vec<Value>> {
    Json(broker.snapshot(query.channel.as_deref()))
}
