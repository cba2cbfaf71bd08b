use std::{
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use futures::Stream;
use tokio::sync::mpsc;

use super::driver::Inner;
use crate::{proto::Sid, router::Message};

/// Handle to a callback subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub(crate) sid: Sid,
    pub(crate) subject: String,
    pub(crate) queue: Option<String>,
    pub(crate) live: Arc<AtomicBool>,
    pub(crate) conn: Weak<Inner>,
}

impl SubscriptionHandle {
    pub fn sid(&self) -> Sid {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// False once unsubscribed or the connection closed.
    pub fn is_active(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Stop delivery. Returns false if it had already stopped.
    pub async fn unsubscribe(&self) -> bool {
        match self.conn.upgrade() {
            Some(inner) => super::unsubscribe_sid(&inner, self.sid).await,
            None => false,
        }
    }
}

/// Channel-backed subscription. Yields messages in arrival order and ends
/// when unsubscribed or when the connection closes.
#[derive(Debug)]
pub struct Subscriber {
    handle: SubscriptionHandle,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscriber {
    pub(crate) fn new(handle: SubscriptionHandle, rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { handle, rx }
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Next message, or `None` once the subscription is gone.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Message already waiting, if any.
    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    pub async fn unsubscribe(self) -> bool {
        self.handle.unsubscribe().await
    }
}

impl Stream for Subscriber {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if !self.handle.is_active() {
            return;
        }
        let Some(inner) = self.handle.conn.upgrade() else {
            return;
        };
        // stop delivery now, tell the server when we can
        self.handle.live.store(false, Ordering::Release);
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let sid = self.handle.sid;
            rt.spawn(async move {
                super::unsubscribe_sid(&inner, sid).await;
            });
        }
    }
}
