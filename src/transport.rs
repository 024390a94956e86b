//! Outbound message delivery.
//!
//! The monitoring node never waits for the delivery of a message. It hands serialized payloads
//! to a [`Transport`] and observes their effect in a later epoch.

use eyre::anyhow;
use smol::channel::{self, Receiver, Sender};

/// Publishes serialized messages on topics.
pub trait Transport {
    /// Sends `payload` on `topic` without waiting for the receiver.
    fn send(&self, topic: &str, payload: String) -> eyre::Result<()>;
}

/// A message handed to a [`ChannelTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// The topic the message was published on.
    pub topic: String,
    /// The JSON-serialized message.
    pub payload: String,
}

/// A [`Transport`] that pushes all messages into an unbounded in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: Sender<OutboundMessage>,
}

impl ChannelTransport {
    /// Creates a new transport and the receiver that observes its messages.
    pub fn channel() -> (Self, Receiver<OutboundMessage>) {
        let (sender, receiver) = channel::unbounded();
        (Self { sender }, receiver)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, topic: &str, payload: String) -> eyre::Result<()> {
        self.sender
            .try_send(OutboundMessage {
                topic: topic.to_owned(),
                payload,
            })
            .map_err(|err| anyhow!("failed to send message on `{}`: {}", topic, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_receiver_is_a_send_error() {
        let (transport, receiver) = ChannelTransport::channel();
        transport.send("a/b", "{}".into()).unwrap();
        assert_eq!(
            receiver.try_recv().unwrap(),
            OutboundMessage {
                topic: "a/b".into(),
                payload: "{}".into()
            }
        );

        drop(receiver);
        assert!(transport.send("a/b", "{}".into()).is_err());
    }
}
