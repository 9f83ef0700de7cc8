use std::{fmt, pin::Pin, sync::Arc, time::SystemTime};

use futures::{Stream, StreamExt};

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("sink error: {0}")]
    Sink(String),
    #[error("publish error: {0}")]
    Publish(String),
    #[error("ack error: {0}")]
    Ack(String),
}

impl PipelineError {
    /// Short label used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Source(_) => "source",
            PipelineError::Decode(_) => "decode",
            PipelineError::Validation(_) => "validation",
            PipelineError::Sink(_) => "sink",
            PipelineError::Publish(_) => "publish",
            PipelineError::Ack(_) => "ack",
        }
    }
}

/// Short stable fingerprint of a raw payload for diagnostics.
pub fn payload_digest(bytes: &[u8]) -> String {
    let hex = blake3::hash(bytes).to_hex();
    hex.as_str()[..16].to_string()
}

/// Broker-side acknowledgement of one delivered message.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), PipelineError>;
}

/// Ack handle travelling with a message until it is stored, dead-lettered or discarded.
#[derive(Default)]
pub struct Delivery {
    handle: Option<Box<dyn Acknowledge>>,
}

impl Delivery {
    pub fn new(handle: impl Acknowledge + 'static) -> Self {
        Self {
            handle: Some(Box::new(handle)),
        }
    }

    /// A delivery that needs no acknowledgement.
    pub fn auto() -> Self {
        Self { handle: None }
    }

    pub async fn ack(self) -> Result<(), PipelineError> {
        match self.handle {
            Some(h) => h.ack().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("manual", &self.handle.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
    /// Where the message came from, e.g. the topic it was published on.
    pub origin: String,
    pub delivery: Delivery,
}

impl<T> Envelope<T> {
    pub fn new(payload: T, origin: impl Into<String>, delivery: Delivery) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
            origin: origin.into(),
            delivery,
        }
    }

    pub fn with_payload<U>(self, payload: U) -> Envelope<U> {
        Envelope {
            payload,
            received_at: self.received_at,
            origin: self.origin,
            delivery: self.delivery,
        }
    }
}

pub type EnvelopeStream<T> = Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(&self) -> Result<EnvelopeStream<T>, PipelineError>;
}

#[async_trait::async_trait]
impl<T, S> Source<T> for Arc<S>
where
    S: Source<T> + ?Sized,
{
    async fn stream(&self) -> Result<EnvelopeStream<T>, PipelineError> {
        (**self).stream().await
    }
}

/// Turns a raw message into a typed record.
pub trait Decode<I, O>: Send + Sync {
    fn decode(&self, input: &I) -> Result<O, PipelineError>;
}

#[async_trait::async_trait]
pub trait Transform<I, O>: Send + Sync {
    async fn apply(&self, input: I) -> Result<O, PipelineError>;
}

#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static;
}

struct Stage<I, O> {
    decoder: Arc<dyn Decode<I, O>>,
    transforms: Vec<Arc<dyn Transform<O, O>>>,
}

impl<I, O> Stage<I, O>
where
    I: AsRef<[u8]> + Send + Sync,
    O: Send,
{
    async fn process(&self, input: &I) -> Result<O, PipelineError> {
        let mut out = self.decoder.decode(input)?;
        for t in &self.transforms {
            out = t.apply(out).await?;
        }
        Ok(out)
    }

    /// Decode and transform one message. Rejected messages are acknowledged and dropped.
    async fn admit(&self, item: Result<Envelope<I>, PipelineError>) -> Option<Result<Envelope<O>, PipelineError>> {
        let env = match item {
            Ok(env) => env,
            Err(e) => return Some(Err(e)),
        };
        metrics::counter!("pipeline_received_total").increment(1);

        match self.process(&env.payload).await {
            Ok(out) => Some(Ok(env.with_payload(out))),
            Err(e) => {
                let digest = payload_digest(env.payload.as_ref());
                tracing::warn!(
                    error = %e,
                    origin = %env.origin,
                    digest = %digest,
                    "discarding message"
                );
                metrics::counter!("pipeline_discarded_total", "reason" => e.kind()).increment(1);

                if let Err(ack_err) = env.delivery.ack().await {
                    tracing::warn!(error = %ack_err, digest = %digest, "failed to ack discarded message");
                }
                None
            }
        }
    }
}

/// Receive loop: source → decode → transforms → sink.
pub struct Pipeline<S, I, O, K> {
    pub source: S,
    pub decoder: Arc<dyn Decode<I, O>>,
    pub transforms: Vec<Arc<dyn Transform<O, O>>>,
    pub sink: K,
}

impl<S, I, O, K> Pipeline<S, I, O, K>
where
    I: AsRef<[u8]> + Send + Sync + 'static,
    O: Send + 'static,
    S: Source<I> + 'static,
    K: Sink<O> + 'static,
{
    /// Runs until the source ends, then waits for the sink to drain.
    pub async fn run(self) -> Result<(), PipelineError> {
        let input = self.source.stream().await?;
        let stage = Arc::new(Stage {
            decoder: self.decoder,
            transforms: self.transforms,
        });

        let admitted = input.filter_map(move |item| {
            let stage = stage.clone();
            async move { stage.admit(item).await }
        });

        self.sink.run(Box::pin(admitted)).await
    }
}
