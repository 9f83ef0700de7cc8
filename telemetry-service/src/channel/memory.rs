use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{topic_matches, InboundMessage, Publisher};
use crate::pipeline::{Acknowledge, Delivery, Envelope, EnvelopeStream, PipelineError, Source};

struct Subscriber {
    filter: String,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

#[derive(Default)]
struct BrokerState {
    subscribers: Vec<Subscriber>,
}

/// In-process broker with MQTT topic matching.
///
/// Messages published while nobody is subscribed are dropped, as with a
/// non-retained MQTT publish.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    published: Arc<AtomicU64>,
    acked: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, filter: &str, cancel: CancellationToken) -> MemorySubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            state.subscribers.push(Subscriber {
                filter: filter.to_string(),
                tx,
            });
        }

        MemorySubscription {
            rx: tokio::sync::Mutex::new(Some(rx)),
            cancel,
            acked: self.acked.clone(),
        }
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.subscribers.iter().filter(|sub| !sub.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PipelineError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PipelineError::Publish("memory broker state poisoned".to_string()))?;

        state.subscribers.retain(|s| !s.tx.is_closed());
        for sub in state.subscribers.iter().filter(|s| topic_matches(&s.filter, topic)) {
            let _ = sub.tx.send(InboundMessage::new(topic, payload.clone()));
        }

        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryAck {
    acked: Arc<AtomicU64>,
}

#[async_trait::async_trait]
impl Acknowledge for MemoryAck {
    async fn ack(&self) -> Result<(), PipelineError> {
        self.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MemorySubscription {
    rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    cancel: CancellationToken,
    acked: Arc<AtomicU64>,
}

impl MemorySubscription {
    fn envelope(acked: &Arc<AtomicU64>, msg: InboundMessage) -> Envelope<InboundMessage> {
        let origin = msg.topic.clone();
        Envelope::new(msg, origin, Delivery::new(MemoryAck { acked: acked.clone() }))
    }
}

#[async_trait::async_trait]
impl Source<InboundMessage> for MemorySubscription {
    /// Ends once the token is cancelled and every message already queued has been yielded.
    async fn stream(&self) -> Result<EnvelopeStream<InboundMessage>, PipelineError> {
        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| PipelineError::Source("memory subscription already consumed".to_string()))?;
        let cancel = self.cancel.clone();
        let acked = self.acked.clone();

        let stream = async_stream::stream! {
            loop {
                let next = tokio::select! {
                    biased;
                    msg = rx.recv() => msg,
                    _ = cancel.cancelled() => break,
                };
                match next {
                    Some(msg) => yield Ok(Self::envelope(&acked, msg)),
                    None => return,
                }
            }

            rx.close();
            while let Some(msg) = rx.recv().await {
                yield Ok(Self::envelope(&acked, msg));
            }
        };

        Ok(Box::pin(stream))
    }
}
