//! HTTP boundary: the three endpoints (stream, heartbeat, subscribers),
//! wired onto an [`axum::Router`].
//!
//! Grounded on `cdk-axum::lib::create_mint_router_with_custom_cache` for
//! router composition and `cdk-axum::ws::handler` for the connect/park/
//! dispose lifecycle of a long-lived connection, adapted from a WebSocket
//! duplex to a one-way SSE stream.

mod heartbeat;
mod stream;
mod subscribers;

use axum::routing::get;
use axum::Router;

use crate::broker::Broker;

/// Build the router exposing the broker's three HTTP endpoints at the
/// paths configured on `broker.config()`.
///
/// The caller is expected to nest or merge this router into its own
/// application router and to apply whatever auth/CORS layers it needs —
/// this crate deliberately does not add a CORS layer itself.
pub fn create_event_router(broker: Broker) -> Router {
    let config = broker.config().clone();
    Router::new()
        .route(&config.stream_path, get(stream::stream_handler))
        .route(
            &config.heartbeat_path,
            get(heartbeat::heartbeat_handler).post(heartbeat::heartbeat_handler),
        )
        .route(&config.subscriptions_path, get(subscribers::subscribers_handler))
        .with_state(broker)
}
