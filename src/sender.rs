//! Send handler seam
//!
//! A sender is the transport-specific dispatcher (HTTP call, broker publish,
//! MQTT publish) the runtime hands messages to. It signals failure by
//! returning `false`; a panic inside a sender is caught and counted as a
//! failed send.

use async_trait::async_trait;
use edge_shared::Message;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::error;

#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Deliver one message; `true` once the receiver has taken ownership
    async fn send(&self, message: &Message) -> bool;

    /// Whether the receiver has room for another message right now
    ///
    /// A sender that is not ready is applying backpressure: callers stop
    /// and try again later without counting a failed delivery.
    async fn ready(&self) -> bool {
        true
    }
}

/// Adapter turning an async closure into a [`MessageSender`]
pub struct FnSender<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageSender for FnSender<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    async fn send(&self, message: &Message) -> bool {
        (self.f)(message.clone()).await
    }
}

/// Wrap an async closure as a shared sender
pub fn sender_fn<F, Fut>(f: F) -> Arc<dyn MessageSender>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(FnSender { f })
}

/// Call `sender`, converting a panic into a failed send
pub async fn send_guarded(sender: &dyn MessageSender, message: &Message) -> bool {
    match AssertUnwindSafe(sender.send(message)).catch_unwind().await {
        Ok(sent) => sent,
        Err(_) => {
            error!("[SEND] Send handler panicked on message {}", message.id);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_shared::Payload;

    #[tokio::test]
    async fn test_closure_sender() {
        let sender = sender_fn(|m: Message| async move { m.id == "ok" });
        let ok = Message::new(Payload::new()).with_id("ok");
        let other = Message::new(Payload::new()).with_id("nope");
        assert!(send_guarded(sender.as_ref(), &ok).await);
        assert!(!send_guarded(sender.as_ref(), &other).await);
    }

    struct BrokenTransport;

    #[async_trait]
    impl MessageSender for BrokenTransport {
        async fn send(&self, _message: &Message) -> bool {
            panic!("transport bug")
        }
    }

    #[tokio::test]
    async fn test_panicking_sender_is_a_failure() {
        let msg = Message::new(Payload::new());
        assert!(!send_guarded(&BrokenTransport, &msg).await);
    }
}
