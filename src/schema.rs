use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::decoder::{Endian, RegisterDecoder};

fn default_scale() -> f64 {
    1.0
}

fn default_priority() -> i32 {
    1
}

/// Signal entry as handed over by the configuration layer, before validation.
///
/// Address and length are signed so that bad entries survive deserialization
/// and can be dropped with a log line instead of failing the whole schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default = "SignalSpec::missing")]
    pub address: i64,
    #[serde(default)]
    pub length: i64,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub offset: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}

impl SignalSpec {
    fn missing() -> i64 {
        -1
    }

    pub fn new(name: impl Into<String>, address: i64, length: i64) -> Self {
        Self {
            name: name.into(),
            address,
            length,
            scale: None,
            offset: None,
            unit: None,
            priority: None,
        }
    }

    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn offset(mut self, offset: f64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Schema mapping consumed by `configure()`.
///
/// Accepts the `{"schema": {...}}` wrapper some configuration files use.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchemaSource {
    #[serde(default)]
    pub word_order: Endian,
    #[serde(default)]
    pub byte_order: Endian,
    #[serde(default)]
    pub address_limit: Option<u16>,
    #[serde(default)]
    pub signals: Vec<SignalSpec>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SchemaEnvelope {
    Wrapped { schema: SchemaSource },
    Bare(SchemaSource),
}

impl SchemaSource {
    /// Unwraps an optional `schema` envelope around an already-parsed value.
    pub fn deserialize_wrapped<'de, D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match SchemaEnvelope::deserialize(deserializer)? {
            SchemaEnvelope::Wrapped { schema } => schema,
            SchemaEnvelope::Bare(schema) => schema,
        })
    }
}

/// A validated signal. Defaults are already resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDescriptor {
    pub name: String,
    pub address: u16,
    pub length: u16,
    pub scale: f64,
    pub offset: f64,
    pub unit: Option<String>,
    pub priority: i32,
}

impl SignalDescriptor {
    /// Last register offset the signal occupies.
    pub fn last_address(&self) -> u32 {
        self.address as u32 + self.length as u32 - 1
    }

    /// Exclusive end of the signal's register span.
    pub fn end_address(&self) -> u32 {
        self.address as u32 + self.length as u32
    }

    /// Inclusive guard: the last occupied register must not pass `limit`.
    pub fn within_limit(&self, limit: Option<u16>) -> bool {
        limit.is_none_or(|limit| self.last_address() <= limit as u32)
    }

    fn from_spec(spec: &SignalSpec) -> Result<Self, String> {
        if spec.name.trim().is_empty() {
            return Err("empty name".to_string());
        }
        if spec.length <= 0 || spec.address < 0 {
            return Err(format!(
                "address={} length={} (need address >= 0, length > 0)",
                spec.address, spec.length
            ));
        }
        if spec.length > 2 {
            return Err(format!("unsupported length={}", spec.length));
        }
        if spec.address + spec.length > 65536 {
            return Err(format!(
                "span {}..{} passes the register space",
                spec.address,
                spec.address + spec.length
            ));
        }
        let scale = spec.scale.unwrap_or_else(default_scale);
        if !scale.is_finite() {
            return Err(format!("non-finite scale {scale}"));
        }
        let offset = spec.offset.unwrap_or_default();
        if !offset.is_finite() {
            return Err(format!("non-finite offset {offset}"));
        }
        Ok(Self {
            name: spec.name.clone(),
            address: spec.address as u16,
            length: spec.length as u16,
            scale,
            offset,
            unit: spec.unit.clone(),
            priority: spec.priority.unwrap_or_else(default_priority),
        })
    }
}

/// Decode options plus the filtered, ordered signal list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PollingSchema {
    pub word_order: Endian,
    pub byte_order: Endian,
    pub address_limit: Option<u16>,
    pub signals: Vec<SignalDescriptor>,
}

impl PollingSchema {
    /// Validates every signal, dropping (and logging) the ones that cannot be
    /// polled. Never fails: a schema with no usable signals is still a schema.
    pub fn from_source(source: &SchemaSource) -> Self {
        let signals = source
            .signals
            .iter()
            .filter_map(|spec| match SignalDescriptor::from_spec(spec) {
                Ok(signal) => Some(signal),
                Err(reason) => {
                    warn!(signal = %spec.name, %reason, "dropping bad signal definition");
                    None
                }
            })
            .collect();

        Self {
            word_order: source.word_order,
            byte_order: source.byte_order,
            address_limit: source.address_limit,
            signals,
        }
    }

    pub fn decoder(&self) -> RegisterDecoder {
        RegisterDecoder::new(self.word_order, self.byte_order)
    }

    /// Signals that pass the address limit, in schema order.
    pub fn guarded_signals(&self) -> impl Iterator<Item = &SignalDescriptor> {
        self.signals
            .iter()
            .filter(|signal| signal.within_limit(self.address_limit))
    }
}
