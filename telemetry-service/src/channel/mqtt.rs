use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, MutexGuard,
    },
    time::Duration,
};

use futures::StreamExt;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{ack_order::AckSequencer, ConnectionState, InboundMessage, Publisher};
use crate::{
    config::BrokerConfig,
    pipeline::{Acknowledge, Delivery, Envelope, EnvelopeStream, PipelineError, Source},
    retry::Backoff,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

fn qos_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn mqtt_options(cfg: &BrokerConfig, client_id: &str, clean_session: bool) -> MqttOptions {
    let mut opts = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(1)));
    opts.set_clean_session(clean_session);
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(user.clone(), pass.clone());
    }
    opts
}

fn set_state(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    let changed = state.send_if_modified(|cur| {
        if *cur == next {
            return false;
        }
        *cur = next;
        true
    });
    if changed {
        tracing::info!(state = next.as_str(), "mqtt consumer state changed");
        metrics::gauge!("mqtt_consumer_state").set(next.level());
    }
}

/// Feeds PUBACKs to a single acker task in the order the messages were received.
struct AckOrder {
    sequencer: StdMutex<AckSequencer<Publish>>,
    out: mpsc::UnboundedSender<Publish>,
}

impl AckOrder {
    /// The acker task ends once every handle to the returned `AckOrder` is dropped.
    fn spawn(client: AsyncClient) -> (Arc<Self>, JoinHandle<()>) {
        let (out, mut rx) = mpsc::unbounded_channel::<Publish>();
        let handle = tokio::spawn(async move {
            while let Some(publish) = rx.recv().await {
                if let Err(e) = client.ack(&publish).await {
                    metrics::counter!("ack_errors_total").increment(1);
                    tracing::warn!(error = %e, topic = %publish.topic, pkid = publish.pkid, "failed to queue mqtt puback");
                }
            }
        });

        let order = Arc::new(Self {
            sequencer: StdMutex::new(AckSequencer::new()),
            out,
        });
        (order, handle)
    }

    fn lock(&self) -> MutexGuard<'_, AckSequencer<Publish>> {
        self.sequencer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self) -> u64 {
        self.lock().register()
    }

    fn reset(&self) {
        self.lock().reset();
    }

    fn settle(&self, seq: u64, publish: Option<Publish>) -> Result<(), PipelineError> {
        // Sending under the lock keeps the channel in release order.
        let mut sequencer = self.lock();
        for ready in sequencer.settle(seq, publish) {
            self.out
                .send(ready)
                .map_err(|_| PipelineError::Ack("mqtt acker stopped".to_string()))?;
        }
        Ok(())
    }
}

struct MqttAck {
    seq: u64,
    publish: Publish,
    order: Arc<AckOrder>,
    settled: AtomicBool,
}

#[async_trait::async_trait]
impl Acknowledge for MqttAck {
    async fn ack(&self) -> Result<(), PipelineError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.order.settle(self.seq, Some(self.publish.clone()))
    }
}

impl Drop for MqttAck {
    fn drop(&mut self) {
        // Dropped unacked: later acks must not wait for a message the broker will redeliver.
        if !*self.settled.get_mut() {
            if let Err(e) = self.order.settle(self.seq, None) {
                tracing::debug!(error = %e, pkid = self.publish.pkid, "could not release mqtt ack slot");
            }
        }
    }
}

/// Live subscription to the broker with manual acknowledgements.
///
/// A background task owns the MQTT event loop. It reconnects with exponential
/// backoff on any connection error and re-subscribes on every `ConnAck`. After
/// cancellation it stops forwarding messages but keeps polling, so that acks for
/// messages still being written are flushed until [`MqttSubscription::shutdown`].
///
/// PUBACKs leave in receipt order even though shards store messages out of order.
/// A message left unacked (failed dead-letter write) does not hold back later
/// acks; it is redelivered after the next reconnect.
pub struct MqttSubscription {
    client: AsyncClient,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope<InboundMessage>>>>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    acker: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSubscription {
    pub fn connect(cfg: &BrokerConfig, filter: &str, cancel: CancellationToken) -> Self {
        let mut opts = mqtt_options(cfg, &cfg.client_id, cfg.clean_session);
        opts.set_manual_acks(true);

        let (client, eventloop) = AsyncClient::new(opts, cfg.request_capacity.max(1));
        // Unbounded on our side; the broker's inflight window bounds unacked QoS 1 deliveries.
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (acks, acker) = AckOrder::spawn(client.clone());
        let cancel = cancel.child_token();

        let driver = Driver {
            client: client.clone(),
            filter: filter.to_string(),
            qos: qos_level(cfg.qos),
            tx: Some(tx),
            acks: Some(acks),
            state: state_tx,
            backoff: Backoff::from_millis(cfg.reconnect_initial_ms, cfg.reconnect_max_ms),
        };

        tracing::info!(host = %cfg.host, port = cfg.port, filter, "connecting to mqtt broker");
        let handle = tokio::spawn(driver.run(eventloop, cancel.clone()));

        Self {
            client,
            rx: Mutex::new(Some(rx)),
            state: state_rx,
            cancel,
            driver: Mutex::new(Some(handle)),
            acker: Mutex::new(Some(acker)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Stop intake, flush queued acks, then disconnect and wait for the event loop task.
    ///
    /// Also interrupts a pending reconnect backoff.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        if let Some(acker) = self.acker.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, acker).await.is_err() {
                tracing::warn!("queued mqtt acks not flushed in time");
            }
        }

        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "mqtt disconnect request not delivered");
        }

        if let Some(handle) = self.driver.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "mqtt driver task panicked"),
                Err(_) => tracing::warn!("mqtt driver did not stop in time"),
            }
        }
    }
}

struct Driver {
    client: AsyncClient,
    filter: String,
    qos: QoS,
    tx: Option<mpsc::UnboundedSender<Envelope<InboundMessage>>>,
    acks: Option<Arc<AckOrder>>,
    state: watch::Sender<ConnectionState>,
    backoff: Backoff,
}

impl Driver {
    async fn run(mut self, mut eventloop: EventLoop, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                ev = eventloop.poll() => ev,
                _ = cancel.cancelled(), if self.tx.is_some() => {
                    // Stop intake; keep polling so pending acks reach the broker.
                    self.tx = None;
                    self.acks = None;
                    continue;
                }
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    self.backoff.reset();
                    tracing::info!(session_present = ack.session_present, "mqtt connected");
                    // Packet ids from the previous connection are void.
                    if let Some(acks) = &self.acks {
                        acks.reset();
                    }
                    if let Err(e) = self.client.try_subscribe(self.filter.clone(), self.qos) {
                        tracing::error!(error = %e, filter = %self.filter, "failed to queue mqtt subscribe");
                        continue;
                    }
                    set_state(&self.state, ConnectionState::Subscribed);
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    set_state(&self.state, ConnectionState::Consuming);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    // A persistent session may deliver queued messages before the SubAck.
                    set_state(&self.state, ConnectionState::Consuming);
                    self.forward(publish);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    set_state(&self.state, ConnectionState::Disconnected);
                    tracing::info!("mqtt subscription disconnected");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    set_state(&self.state, ConnectionState::Disconnected);
                    metrics::counter!("mqtt_connection_errors_total").increment(1);
                    if cancel.is_cancelled() {
                        tracing::warn!(error = %e, "mqtt connection lost during shutdown");
                        break;
                    }

                    let delay = self.backoff.next_delay();
                    tracing::warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "mqtt connection error, reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => break,
                    }
                    set_state(&self.state, ConnectionState::Connecting);
                }
            }
        }
    }

    fn forward(&self, publish: Publish) {
        // Not forwarded and not acked after cancellation; the broker redelivers it.
        let (Some(tx), Some(acks)) = (&self.tx, &self.acks) else { return };

        metrics::counter!("mqtt_messages_received_total").increment(1);
        let msg = InboundMessage::new(publish.topic.clone(), publish.payload.to_vec());
        let origin = publish.topic.clone();
        let delivery = Delivery::new(MqttAck {
            seq: acks.register(),
            publish,
            order: acks.clone(),
            settled: AtomicBool::new(false),
        });

        if tx.send(Envelope::new(msg, origin, delivery)).is_err() {
            tracing::debug!("mqtt subscription stream dropped, message left unacked");
        }
    }
}

#[async_trait::async_trait]
impl Source<InboundMessage> for MqttSubscription {
    async fn stream(&self) -> Result<EnvelopeStream<InboundMessage>, PipelineError> {
        let rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| PipelineError::Source("mqtt subscription stream already taken".to_string()))?;

        Ok(Box::pin(UnboundedReceiverStream::new(rx).map(Ok)))
    }
}

/// Publishing client used by the fleet simulator.
pub struct MqttPublisher {
    client: AsyncClient,
    qos: QoS,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttPublisher {
    pub fn connect(cfg: &BrokerConfig, client_id: &str) -> Self {
        let opts = mqtt_options(cfg, client_id, true);
        let (client, mut eventloop) = AsyncClient::new(opts, cfg.request_capacity.max(1));
        let mut backoff = Backoff::from_millis(cfg.reconnect_initial_ms, cfg.reconnect_max_ms);

        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        backoff.reset();
                        tracing::info!("mqtt publisher connected");
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        metrics::counter!("mqtt_connection_errors_total").increment(1);
                        let delay = backoff.next_delay();
                        tracing::warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "mqtt publisher connection error");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });

        Self {
            client,
            qos: qos_level(cfg.qos),
            driver: Mutex::new(Some(handle)),
        }
    }

    /// Flush queued publishes, then disconnect.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "mqtt disconnect request not delivered");
        }
        if let Some(handle) = self.driver.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("mqtt publisher did not stop in time");
            }
        }
    }
}

#[async_trait::async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PipelineError> {
        self.client
            .publish(topic, self.qos, false, payload)
            .await
            .map_err(|e| PipelineError::Publish(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_levels_map_with_at_least_once_fallback() {
        assert_eq!(qos_level(0), QoS::AtMostOnce);
        assert_eq!(qos_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_level(2), QoS::ExactlyOnce);
        assert_eq!(qos_level(9), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn subscription_starts_connecting_and_stops_on_cancel() {
        let cfg = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            reconnect_initial_ms: 10,
            reconnect_max_ms: 20,
            ..BrokerConfig::default()
        };
        let cancel = CancellationToken::new();
        let sub = MqttSubscription::connect(&cfg, "energy/meters/#", cancel.clone());
        assert_ne!(sub.state(), ConnectionState::Consuming);

        let mut stream = sub.stream().await.unwrap();
        cancel.cancel();
        sub.shutdown().await;

        assert!(stream.next().await.is_none());
        assert_eq!(sub.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_interrupts_reconnect_backoff() {
        let cfg = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            reconnect_initial_ms: 60_000,
            reconnect_max_ms: 60_000,
            ..BrokerConfig::default()
        };
        let service = CancellationToken::new();
        let sub = MqttSubscription::connect(&cfg, "energy/meters/#", service.clone());

        // Let the first connect fail so the driver is parked in its backoff sleep.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(2), sub.shutdown()).await;
        assert!(stopped.is_ok(), "shutdown waited on the reconnect backoff");
        assert_eq!(sub.state(), ConnectionState::Disconnected);
        assert!(!service.is_cancelled());
    }
}
