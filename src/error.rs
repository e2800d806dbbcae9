//! Error types for the event broker.

/// Errors that can surface from the broker's core operations.
///
/// Per the error policy, most broker operations (`publish`, `pulse`,
/// `unsubscribe`, every `notify_*`) are infallible by design: transport and
/// lookup failures are logged and absorbed rather than returned. Only
/// [`crate::broker::Broker::register`] can fail, and only because an
/// external `OnSubscribe` hook rejected the subscription.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    /// The external `OnSubscribe` hook rejected the subscription.
    #[error("subscribe hook rejected subscription: {0}")]
    HookRejected(String),
}
