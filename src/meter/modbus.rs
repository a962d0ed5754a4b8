use std::time::SystemTime;

use anyhow::{bail, Result};
use tracing::debug;

use super::fields::{FieldDescriptor, FieldType, Reduction};
use super::transport::{read_with_retry, RegisterWindow, TransportError};
use super::{MeterError, RegisterSource};
use crate::bucket::Bucket;

/// Generic register meter: every quantity is described by a record of the
/// `datafields` file, read as one 16-bit register from its own slave unit,
/// scaled and reduced per its descriptor.
#[derive(Debug)]
pub struct ModbusMeter {
    source: RegisterSource,
    fields: Vec<FieldDescriptor>,
}

impl ModbusMeter {
    /// Validates the descriptor list and builds the driver. Each `phases`
    /// field must find its three `_phase1..3` components in the list.
    pub fn new(source: RegisterSource, fields: Vec<FieldDescriptor>) -> Result<Self> {
        for field in fields.iter().filter(|f| f.field_type == FieldType::Phases) {
            for suffix in ["_phase1", "_phase2", "_phase3"] {
                let component = format!("{}{}", field.name, suffix);
                if !fields.iter().any(|f| f.name == component) {
                    bail!(
                        "phases field '{}' is missing its component '{}'",
                        field.name,
                        component,
                    );
                }
            }
        }
        Ok(Self { source, fields })
    }

    /// Seeds signed-split keys so the sink always receives both sides, even
    /// for a minute with flow in one direction only.
    pub fn seed(&self, bucket: &mut Bucket) {
        seed_signed(bucket, &self.fields);
    }

    /// One integration tick: read every described register, derive the
    /// phase sums, then apply each field's reduction weighted by the time
    /// since the previous sample.
    pub async fn poll_into(
        &mut self,
        bucket: &mut Bucket,
        previous: &mut SystemTime,
    ) -> Result<u32, MeterError> {
        let scaled = read_scaled(&mut self.source, &self.fields).await?;

        let now = SystemTime::now();
        let delta = now.duration_since(*previous).unwrap_or_default().as_secs_f32();
        *previous = now;

        apply_reductions(bucket, delta, &self.fields, &scaled);
        debug!(fields = self.fields.len(), delta, "modbus sample integrated");
        Ok(1)
    }

    pub fn finalize(&self, bucket: &mut Bucket, span: f32) {
        finalize_fields(bucket, span, &self.fields);
    }

    pub async fn shutdown(&mut self) {
        self.source.close().await;
    }
}

fn seed_signed(bucket: &mut Bucket, fields: &[FieldDescriptor]) {
    for field in fields.iter().filter(|f| f.reduction == Reduction::SignedSplit) {
        bucket.update(&format!("{}_pos", field.name), 0.0);
        bucket.update(&format!("{}_neg", field.name), 0.0);
    }
}

/// Reads and scales one sample per descriptor. Register fields are read
/// individually (the slave id switches per field); `phases` fields consume
/// no read and sum the scaled values of their components from this tick.
async fn read_scaled<L: RegisterWindow>(
    link: &mut L,
    fields: &[FieldDescriptor],
) -> Result<Vec<f32>, MeterError> {
    let mut scaled = vec![0.0f32; fields.len()];

    for (i, field) in fields.iter().enumerate() {
        if field.field_type == FieldType::Phases {
            continue;
        }

        let words = read_with_retry(link, field.unit, field.address, 1).await?;
        let raw = *words.first().ok_or_else(|| {
            MeterError::DeviceRead(TransportError::Read {
                unit: field.unit,
                addr: field.address,
                count: 1,
                detail: "empty response".to_string(),
            })
        })?;

        let value = match field.field_type {
            FieldType::Uint16 => f32::from(raw),
            FieldType::Int16 => f32::from(raw as i16),
            FieldType::Phases => unreachable!("skipped above"),
        };
        scaled[i] = value * field.scale;
    }

    for (i, field) in fields.iter().enumerate() {
        if field.field_type != FieldType::Phases {
            continue;
        }
        let sum: f32 = ["_phase1", "_phase2", "_phase3"]
            .iter()
            .map(|suffix| {
                let component = format!("{}{}", field.name, suffix);
                fields
                    .iter()
                    .position(|f| f.name == component)
                    .map_or(0.0, |j| scaled[j])
            })
            .sum();
        scaled[i] = sum * field.scale;
    }

    Ok(scaled)
}

fn apply_reductions(bucket: &mut Bucket, delta: f32, fields: &[FieldDescriptor], scaled: &[f32]) {
    for (field, &value) in fields.iter().zip(scaled) {
        match field.reduction {
            Reduction::Average => bucket.accumulate(delta, &field.name, value),
            Reduction::Max => {
                if bucket.value(&field.name).map_or(true, |cur| value > cur) {
                    bucket.update(&field.name, value);
                }
            }
            Reduction::Min => {
                if bucket.value(&field.name).map_or(true, |cur| value < cur) {
                    bucket.update(&field.name, value);
                }
            }
            Reduction::SignedSplit => bucket.accumulate_signed(delta, &field.name, value),
        }
    }
}

fn finalize_fields(bucket: &mut Bucket, span: f32, fields: &[FieldDescriptor]) {
    let factor = 1.0 / span;
    for field in fields {
        match field.reduction {
            Reduction::Average => bucket.finalize(&field.name, factor),
            Reduction::SignedSplit => {
                bucket.finalize(&format!("{}_pos", field.name), factor);
                bucket.finalize(&format!("{}_neg", field.name), factor);
            }
            Reduction::Max | Reduction::Min => {}
        }
    }
}
