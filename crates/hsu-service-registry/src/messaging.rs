//! Request/response messaging over pub/sub.
//!
//! A request carries a `response_channel` of the form
//! `<channel>:response:<msg_id>`. Before publishing, the sender subscribes
//! to that topic and hands the subscription to a waiter task; the replying
//! side publishes straight to it. Correlation is purely by topic name, so
//! there is no in-memory table of outstanding requests.
//!
//! Each waiter delivers exactly one value into a oneshot slot: the reply,
//! or `None` when the timeout fires first. Whatever lands first wins; the
//! subscription is released as soon as the waiter finishes, so a late
//! reply is never seen by the caller.

use crate::keys::KeySpace;
use crate::store::{KvStore, Subscription};
use crate::types::Message;
use hsu_common::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Reply slot for one outstanding request.
///
/// Resolves to the reply, or `None` on timeout. Dropping it abandons the
/// request and releases the reply subscription.
#[derive(Debug)]
pub struct PendingReply {
    msg_id: String,
    response_channel: String,
    rx: oneshot::Receiver<Option<Message>>,
}

impl PendingReply {
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn response_channel(&self) -> &str {
        &self.response_channel
    }

    /// Waits for the outcome. `None` means no reply arrived in time (or
    /// the reply subscription was lost).
    pub async fn recv(self) -> Option<Message> {
        self.rx.await.ok().flatten()
    }
}

/// Publishes messages and manages reply waiters.
#[derive(Clone)]
pub struct Messenger {
    store: Arc<dyn KvStore>,
}

impl Messenger {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    async fn publish(&self, message: &Message) -> Result<usize> {
        let payload = message.to_json()?;
        let receivers = self.store.publish(&message.channel, &payload).await?;
        trace!(channel = %message.channel, msg_id = %message.msg_id, receivers, "Message published");
        Ok(receivers)
    }

    /// One-way publish; nobody is expected to answer.
    pub async fn send(
        &self,
        channel: &str,
        from: &str,
        to: &str,
        route: &str,
        payload: serde_json::Value,
    ) -> Result<Message> {
        let message = Message::new(channel, from, to, route, payload);
        self.publish(&message).await?;
        Ok(message)
    }

    /// Publishes a request and returns the slot its reply will land in.
    ///
    /// The reply subscription is active before the request goes out, so a
    /// fast responder cannot be missed. With `timeout` set, the slot gets
    /// `None` once it elapses.
    pub async fn request(
        &self,
        channel: &str,
        from: &str,
        to: &str,
        route: &str,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<PendingReply> {
        let mut message = Message::new(channel, from, to, route, payload);
        message.response_channel = KeySpace::response_topic(channel, &message.msg_id);

        // Encode before subscribing so a bad payload leaves nothing behind.
        let encoded = message.to_json()?;

        let subscription = self
            .store
            .subscribe(std::slice::from_ref(&message.response_channel))
            .await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let waiter = Self::spawn_waiter(subscription, reply_tx, timeout, message.msg_id.clone());

        if let Err(e) = self.store.publish(channel, &encoded).await {
            waiter.abort();
            return Err(e);
        }
        trace!(channel = %channel, msg_id = %message.msg_id, "Request published");

        Ok(PendingReply {
            msg_id: message.msg_id,
            response_channel: message.response_channel,
            rx: reply_rx,
        })
    }

    /// Answers `original` with `payload`.
    ///
    /// The reply goes to the original response channel with `from` and `to`
    /// swapped and no response channel of its own.
    pub async fn respond(&self, original: &Message, payload: serde_json::Value) -> Result<()> {
        if !original.expects_reply() {
            return Err(Error::validation(format!(
                "Message {} has no response channel",
                original.msg_id
            )));
        }
        let reply = Message::new(
            original.response_channel.as_str(),
            original.to.as_str(),
            original.from.as_str(),
            original.route.as_str(),
            payload,
        );
        let receivers = self.publish(&reply).await?;
        if receivers == 0 {
            debug!(msg_id = %original.msg_id, "Reply published with no waiting caller");
        }
        Ok(())
    }

    fn spawn_waiter(
        subscription: Subscription,
        reply_tx: oneshot::Sender<Option<Message>>,
        timeout: Option<Duration>,
        msg_id: String,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::await_reply(subscription, reply_tx, timeout, msg_id))
    }

    async fn await_reply(
        mut subscription: Subscription,
        mut reply_tx: oneshot::Sender<Option<Message>>,
        timeout: Option<Duration>,
        msg_id: String,
    ) {
        let outcome = tokio::select! {
            reply = Self::next_reply(&mut subscription, timeout) => reply,
            _ = reply_tx.closed() => {
                debug!(msg_id = %msg_id, "Caller abandoned request");
                return;
            }
        };

        // Release the reply topic before handing the result over.
        drop(subscription);

        if outcome.is_none() {
            debug!(msg_id = %msg_id, "No reply before timeout");
        }
        if reply_tx.send(outcome).is_err() {
            debug!(msg_id = %msg_id, "Caller dropped before reply was delivered");
        }
    }

    async fn next_reply(subscription: &mut Subscription, timeout: Option<Duration>) -> Option<Message> {
        let wait = async {
            while let Some(raw) = subscription.next().await {
                match Message::from_json(&raw) {
                    Ok(reply) => return Some(reply),
                    Err(e) => warn!(error = %e, "Failed to decode reply, still waiting"),
                }
            }
            warn!("Reply subscription closed");
            None
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or(None),
            None => wait.await,
        }
    }
}
