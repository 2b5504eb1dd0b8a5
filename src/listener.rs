use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// Observer interface for connection events. Any number of listeners can be registered on
///  a connection; each one is invoked exactly once per event, in registration order.
///
/// A listener returning an error is an application-level failure: it is logged and
///  isolated - neither the other listeners nor the connection's read / write loops are
///  affected by it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionListener: Send + Sync + 'static {
    /// A payload arrived, on either channel. Keep-alive payloads are empty and show up
    ///  here like any other payload.
    async fn on_received(&self, payload: &[u8]) -> anyhow::Result<()>;

    /// A stream payload was handed to the transport. Invoked with the original payload,
    ///  in send order.
    async fn on_sent(&self, payload: &[u8]) -> anyhow::Result<()>;

    /// The connection transitioned to closed. Invoked exactly once per listener,
    ///  regardless of what triggered the closure or how often it was triggered.
    async fn on_closed(&self) -> anyhow::Result<()>;
}
