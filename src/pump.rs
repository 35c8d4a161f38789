//! Broadcast pump
//!
//! A single task that drains the delivery channel and hands each message
//! to its recipients' mailboxes. The server actor never writes to a
//! mailbox itself; it snapshots the recipients and queues a `Delivery`.
//!
//! Backpressure policy: every recipient of a delivery gets one deadline
//! (`delivery_timeout`) for all of that delivery's messages. A mailbox
//! that stays full past the deadline loses the rest of the delivery and
//! its owner is marked lagging. Lagging users are only ever offered
//! messages with `try_send`; what does not fit is dropped. A lagging user
//! returns to normal once its mailbox is empty again. A stalled user
//! therefore costs the pump one deadline per stall, not one per message.

use std::collections::HashSet;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SendError;
use crate::message::ServerMessage;
use crate::types::ClientId;
use crate::user::Mailbox;

/// Messages to send, in order, to each of a set of mailboxes
#[derive(Debug)]
pub struct Delivery {
    pub recipients: Vec<Mailbox>,
    pub messages: Vec<ServerMessage>,
}

impl Delivery {
    /// One message to many users
    pub fn broadcast(recipients: Vec<Mailbox>, message: ServerMessage) -> Self {
        Self {
            recipients,
            messages: vec![message],
        }
    }

    /// One message to one user
    pub fn direct(recipient: Mailbox, message: ServerMessage) -> Self {
        Self::batch(recipient, vec![message])
    }

    /// Several messages to one user, kept in order
    pub fn batch(recipient: Mailbox, messages: Vec<ServerMessage>) -> Self {
        Self {
            recipients: vec![recipient],
            messages,
        }
    }
}

/// The fan-out task
pub struct BroadcastPump {
    receiver: mpsc::Receiver<Delivery>,
    delivery_timeout: Duration,
    /// Users that missed a deadline and have not drained their mailbox since
    lagging: HashSet<ClientId>,
}

impl BroadcastPump {
    pub fn new(receiver: mpsc::Receiver<Delivery>, delivery_timeout: Duration) -> Self {
        Self {
            receiver,
            delivery_timeout,
            lagging: HashSet::new(),
        }
    }

    /// Run until every delivery sender is dropped
    pub async fn run(mut self) {
        info!("Broadcast pump started");

        while let Some(delivery) = self.receiver.recv().await {
            self.dispatch(delivery).await;
        }

        info!("Broadcast pump shutting down");
    }

    async fn dispatch(&mut self, delivery: Delivery) {
        let Delivery {
            recipients,
            messages,
        } = delivery;

        debug!(
            recipients = recipients.len(),
            messages = messages.len(),
            "Dispatching delivery"
        );

        let timeout = self.delivery_timeout;
        let lagging = &self.lagging;
        let sends = recipients.into_iter().map(|mailbox| {
            let was_lagging = lagging.contains(&mailbox.owner());
            deliver_to(mailbox, &messages, timeout, was_lagging)
        });
        let outcomes = join_all(sends).await;

        for (owner, outcome) in outcomes {
            match outcome {
                Outcome::Lagging => {
                    self.lagging.insert(owner);
                }
                Outcome::Delivered | Outcome::Gone => {
                    self.lagging.remove(&owner);
                }
            }
        }
    }
}

/// How a recipient fared with one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Lagging,
    Gone,
}

/// Send `messages` to one mailbox
///
/// A recipient in good standing gets a shared deadline for the whole
/// delivery. A lagging one gets no wait at all: whatever does not fit is
/// dropped, until its mailbox has fully drained again.
async fn deliver_to(
    mailbox: Mailbox,
    messages: &[ServerMessage],
    timeout: Duration,
    was_lagging: bool,
) -> (ClientId, Outcome) {
    let owner = mailbox.owner();

    if was_lagging && !mailbox.is_drained() {
        for (sent, msg) in messages.iter().enumerate() {
            match mailbox.try_send(msg.clone()) {
                Ok(()) => {}
                Err(SendError::ChannelClosed) => return (owner, Outcome::Gone),
                Err(_) => {
                    debug!(
                        client = %owner,
                        dropped = messages.len() - sent,
                        "Lagging mailbox full, dropping"
                    );
                    break;
                }
            }
        }
        return (owner, Outcome::Lagging);
    }

    let deadline = Instant::now().checked_add(timeout);

    for (sent, msg) in messages.iter().enumerate() {
        let remaining =
            deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));
        match mailbox.send_timeout(msg.clone(), remaining).await {
            Ok(()) => {}
            Err(SendError::ChannelClosed) => {
                debug!(client = %owner, "Mailbox closed, skipping");
                return (owner, Outcome::Gone);
            }
            Err(_) => {
                warn!(
                    client = %owner,
                    dropped = messages.len() - sent,
                    "Mailbox full past deadline, marking lagging"
                );
                return (owner, Outcome::Lagging);
            }
        }
    }

    (owner, Outcome::Delivered)
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use super::*;

    fn public(text: &str) -> ServerMessage {
        ServerMessage::Public {
            addr: "127.0.0.1:1".parse().unwrap(),
            name: "sender".to_string(),
            text: text.to_string(),
        }
    }

    fn spawn_pump(timeout: Duration) -> mpsc::Sender<Delivery> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(BroadcastPump::new(rx, timeout).run());
        tx
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_recipient() {
        let pump = spawn_pump(Duration::from_secs(1));
        let (a, mut a_rx) = Mailbox::channel(ClientId::new(), 4);
        let (b, mut b_rx) = Mailbox::channel(ClientId::new(), 4);

        pump.send(Delivery::broadcast(vec![a, b], public("hi")))
            .await
            .unwrap();

        assert_eq!(a_rx.recv().await, Some(public("hi")));
        assert_eq!(b_rx.recv().await, Some(public("hi")));
    }

    #[tokio::test]
    async fn test_batch_keeps_order() {
        let pump = spawn_pump(Duration::from_secs(1));
        let (a, mut a_rx) = Mailbox::channel(ClientId::new(), 1);

        let messages = vec![public("1"), public("2"), public("3")];
        pump.send(Delivery::batch(a.clone(), messages)).await.unwrap();
        pump.send(Delivery::direct(a, public("4"))).await.unwrap();

        for text in ["1", "2", "3", "4"] {
            assert_eq!(a_rx.recv().await, Some(public(text)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_recipient_does_not_block_others() {
        let pump = spawn_pump(Duration::from_millis(100));
        let (stalled, _stalled_rx) = Mailbox::channel(ClientId::new(), 1);
        let (healthy, mut healthy_rx) = Mailbox::channel(ClientId::new(), 4);

        // Fill the stalled mailbox; nobody ever drains it
        stalled.send(public("filler")).await.unwrap();

        pump.send(Delivery::broadcast(
            vec![stalled.clone(), healthy.clone()],
            public("first"),
        ))
        .await
        .unwrap();
        pump.send(Delivery::broadcast(vec![stalled, healthy], public("second")))
            .await
            .unwrap();

        assert_eq!(healthy_rx.recv().await, Some(public("first")));
        assert_eq!(healthy_rx.recv().await, Some(public("second")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_recipient_costs_one_deadline() {
        let timeout = Duration::from_millis(100);
        let pump = spawn_pump(timeout);
        let (stalled, _stalled_rx) = Mailbox::channel(ClientId::new(), 1);
        let (healthy, mut healthy_rx) = Mailbox::channel(ClientId::new(), 64);
        stalled.send(public("filler")).await.unwrap();

        let start = Instant::now();
        tokio::spawn(async move {
            for i in 0..50 {
                let recipients = vec![stalled.clone(), healthy.clone()];
                pump.send(Delivery::broadcast(recipients, public(&i.to_string())))
                    .await
                    .unwrap();
            }
        });

        for i in 0..50 {
            assert_eq!(healthy_rx.recv().await, Some(public(&i.to_string())));
        }
        // Only the first broadcast waits on the stalled mailbox
        assert!(start.elapsed() < timeout * 2, "took {:?}", start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagging_recipient_recovers_after_draining() {
        let pump = spawn_pump(Duration::from_millis(100));
        let (slow, mut slow_rx) = Mailbox::channel(ClientId::new(), 1);
        slow.send(public("filler")).await.unwrap();

        pump.send(Delivery::direct(slow.clone(), public("dropped")))
            .await
            .unwrap();
        time::sleep(Duration::from_millis(150)).await;

        assert_eq!(slow_rx.recv().await, Some(public("filler")));
        pump.send(Delivery::direct(slow, public("after")))
            .await
            .unwrap();
        assert_eq!(slow_rx.recv().await, Some(public("after")));
    }

    #[tokio::test]
    async fn test_closed_mailbox_is_skipped() {
        let pump = spawn_pump(Duration::from_secs(1));
        let (gone, gone_rx) = Mailbox::channel(ClientId::new(), 1);
        let (alive, mut alive_rx) = Mailbox::channel(ClientId::new(), 1);
        drop(gone_rx);

        pump.send(Delivery::broadcast(vec![gone, alive], public("hi")))
            .await
            .unwrap();

        assert_eq!(alive_rx.recv().await, Some(public("hi")));
    }
}
