use grid_client::domain::{Reading, METER_TOPIC_PREFIX};
use time::{macros::datetime, UtcOffset};

use crate::{
    channel::InboundMessage,
    config::{Range, ValidationConfig},
    pipeline::{Decode, PipelineError, Transform},
};

/// Meter id carried in a topic of the form `energy/meters/{meter_id}`.
pub fn topic_meter_id(topic: &str) -> Option<&str> {
    let id = topic.strip_prefix(METER_TOPIC_PREFIX)?.strip_prefix('/')?;
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

/// Decode a JSON reading and normalise it.
///
/// - the topic must address a single meter;
/// - `meter_id` is trimmed and must equal the topic's meter segment;
/// - the timestamp is converted to UTC.
pub fn decode_reading(msg: &InboundMessage) -> Result<Reading, PipelineError> {
    let topic_id = topic_meter_id(&msg.topic)
        .ok_or_else(|| PipelineError::Decode(format!("unexpected topic '{}'", msg.topic)))?;

    let mut reading: Reading = serde_json::from_slice(&msg.payload)
        .map_err(|e| PipelineError::Decode(format!("invalid reading payload: {e}")))?;

    let trimmed = reading.meter_id.trim();
    if trimmed.len() != reading.meter_id.len() {
        reading.meter_id = trimmed.to_string();
    }
    reading.timestamp = reading.timestamp.to_offset(UtcOffset::UTC);

    if reading.meter_id != topic_id {
        return Err(PipelineError::Validation(format!(
            "payload meter_id '{}' does not match topic meter '{topic_id}'",
            reading.meter_id
        )));
    }

    Ok(reading)
}

fn check_range(name: &str, value: f64, range: &Range) -> Result<(), PipelineError> {
    if !range.contains(value) {
        return Err(PipelineError::Validation(format!(
            "{name} {value} outside [{}, {}]",
            range.min, range.max
        )));
    }
    Ok(())
}

/// Pure validation of a decoded `Reading`.
///
/// Rules:
/// - meter_id is non-empty and at most `max_meter_id_len` characters.
/// - all numeric fields are finite.
/// - power, voltage, current and frequency lie in their configured ranges.
/// - energy is non-negative.
/// - timestamp lies within [2000-01-01, 2100-01-01).
pub fn validate_reading(r: &Reading, limits: &ValidationConfig) -> Result<(), PipelineError> {
    if r.meter_id.is_empty() {
        return Err(PipelineError::Validation("meter_id must not be empty".to_string()));
    }
    if r.meter_id.chars().count() > limits.max_meter_id_len {
        return Err(PipelineError::Validation(format!(
            "meter_id longer than {} characters",
            limits.max_meter_id_len
        )));
    }
    if !r.has_finite_fields() {
        return Err(PipelineError::Validation("numeric fields must be finite".to_string()));
    }

    check_range("power", r.power, &limits.power)?;
    check_range("voltage", r.voltage, &limits.voltage)?;
    check_range("current", r.current, &limits.current)?;
    check_range("frequency", r.frequency, &limits.frequency)?;

    if r.energy < 0.0 {
        return Err(PipelineError::Validation("energy must be non-negative".to_string()));
    }

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);

    if r.timestamp < min_ts || r.timestamp >= max_ts {
        return Err(PipelineError::Validation("timestamp out of allowed range".to_string()));
    }

    Ok(())
}

#[derive(Clone, Default)]
pub struct ReadingDecoder;

impl Decode<InboundMessage, Reading> for ReadingDecoder {
    fn decode(&self, input: &InboundMessage) -> Result<Reading, PipelineError> {
        decode_reading(input)
    }
}

#[derive(Clone, Default)]
pub struct ReadingValidation {
    limits: ValidationConfig,
}

impl ReadingValidation {
    pub fn new(limits: ValidationConfig) -> Self {
        Self { limits }
    }
}

#[async_trait::async_trait]
impl Transform<Reading, Reading> for ReadingValidation {
    async fn apply(&self, input: Reading) -> Result<Reading, PipelineError> {
        match validate_reading(&input, &self.limits) {
            Ok(()) => Ok(input),
            Err(e) => {
                metrics::counter!("validation_reading_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}
