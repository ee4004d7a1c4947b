use anyhow::{anyhow, Result};
use async_trait::async_trait;
use core_types::{BusMessage, MessageSink};
use tokio::sync::broadcast;

pub mod jsonl;

pub use jsonl::JsonlSink;

#[derive(Clone)]
pub struct RingBus<T: Clone + Send + Sync + 'static> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + Sync + 'static> RingBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn publish(&self, event: T) -> Result<()> {
        match self.tx.send(event) {
            Ok(_) => Ok(()),
            Err(err) => Err(anyhow!("bus publish failed: {err}")),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// In-process sink: tracker output is broadcast to whoever subscribed.
/// Messages sent while nobody listens are dropped and counted.
#[derive(Clone)]
pub struct RingBusSink {
    bus: RingBus<BusMessage>,
}

impl RingBusSink {
    pub fn new(bus: RingBus<BusMessage>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &RingBus<BusMessage> {
        &self.bus
    }
}

#[async_trait]
impl MessageSink for RingBusSink {
    async fn send(&self, message: BusMessage) -> Result<()> {
        if self.bus.receiver_count() == 0 {
            metrics::counter!("bus.dropped").increment(1);
            tracing::debug!(
                topic = %message.topic,
                key = %message.key,
                "no bus subscribers, message dropped"
            );
            return Ok(());
        }
        let topic = message.topic.clone();
        self.bus.publish(message)?;
        metrics::counter!("bus.sent", "topic" => topic).increment(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_subscribe_roundtrip() {
        let bus = RingBus::new(32);
        let mut rx = bus.subscribe();
        bus.publish(7u64).expect("publish");
        let v = rx.recv().await.expect("recv");
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn sink_forwards_to_subscribers() {
        let sink = RingBusSink::new(RingBus::new(16));
        let mut rx = sink.bus().subscribe();
        sink.send(BusMessage::new("clan", "#A", b"{}".to_vec()))
            .await
            .expect("send");
        let got = rx.recv().await.expect("recv");
        assert_eq!(got.topic, "clan");
        assert_eq!(got.key, "#A");
    }

    #[tokio::test]
    async fn sink_without_subscribers_does_not_fail() {
        let sink = RingBusSink::new(RingBus::new(16));
        sink.send(BusMessage::new("clan", "#A", Vec::new()))
            .await
            .expect("send");
    }
}
