//! GET `/event-stream` — opens a long-lived SSE subscription.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt as _;

use crate::broker::{self, Broker};
use crate::subscription::{NewSubscription, Subscription};

#[derive(Debug, Deserialize)]
pub(super) struct StreamQuery {
    channel: Option<String>,
}

/// Accept a new SSE connection, register it, and stream frames to the
/// client until it is disposed.
#[tracing::instrument(skip_all)]
pub(super) async fn stream_handler(
    State(broker): State<Broker>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session = broker.config().session_resolver.resolve(&headers);

    let user_id = session
        .user_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(broker::next_anonymous_id);
    let display_name = session
        .display_name
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("User{}", user_id.trim_start_matches('-')));
    let user_name = session.user_name.unwrap_or_default();
    let session_id = session.session_id.unwrap_or_default();
    let profile_url = session.profile_url.unwrap_or_default();

    let (raw_tx, raw_rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    let sub = Arc::new(Subscription::new(NewSubscription {
        id: None,
        channel: query.channel.unwrap_or_default(),
        user_id,
        user_name,
        session_id,
        display_name,
        is_authenticated: session.is_authenticated,
        profile_url,
        sender: raw_tx,
    }));

    broker.config().hooks.on_created(&sub);

    sub.set_on_dispose(Box::new({
        let sub_id = sub.id().to_string();
        move || tracing::debug!(sub_id, "stream disposed, connection closing")
    }));

    if let Err(err) = broker.register(&sub) {
        tracing::warn!(error = %err, "subscription rejected by OnSubscribe hook");
        sub.dispose();
    } else {
        let heartbeat_url = format!(
            "{}?from={}",
            broker.config().heartbeat_path,
            sub.id()
        );
        let payload = sub.on_connect_payload(
            &heartbeat_url,
            broker.config().heartbeat_interval.as_millis() as u64,
        );
        sub.publish(broker::SELECTOR_ON_CONNECT, Some(payload));
    }

    let stream = UnboundedReceiverStream::new(raw_rx).map(Ok);
    Sse::new(stream).keep_alive(KeepAlive::new().interval(broker.config().heartbeat_interval))
}
