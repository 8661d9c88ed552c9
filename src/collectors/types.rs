use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::accumulator::Accumulator;
use crate::error::{CollectionError, ConfigError, ValidationError};

/// Tag set of a metric. Keys are unique and kept sorted so serialization is
/// deterministic.
pub type Tags = BTreeMap<String, String>;

/// Field set of a metric.
pub type Fields = BTreeMap<String, FieldValue>;

/// Flat key/value overrides for one collector instance, as resolved by the
/// configuration loader.
pub type RawConfig = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
}

impl FieldValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Integer(_) => "integer",
            FieldValue::Float(_) => "float",
            FieldValue::String(_) => "string",
            FieldValue::Boolean(_) => "boolean",
        }
    }

    fn unsupported_reason(&self) -> Option<&'static str> {
        match self {
            FieldValue::Float(v) if v.is_nan() => Some("float is NaN"),
            FieldValue::Float(v) if v.is_infinite() => Some("float is infinite"),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(v) => Some(v),
            _ => None,
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for FieldValue {
            fn from(v: $t) -> Self {
                FieldValue::Integer(i64::from(v))
            }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        FieldValue::Float(f64::from(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

/// Value-type hint carried alongside a metric. It never affects validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    #[default]
    Untyped,
    Gauge,
    Counter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMetric")]
pub struct Metric {
    name: String,
    tags: Tags,
    fields: Fields,
    timestamp: DateTime<Utc>,
    kind: MetricKind,
}

/// Wire form of a [`Metric`], validated on the way in.
#[derive(Deserialize)]
struct RawMetric {
    name: String,
    #[serde(default)]
    tags: Tags,
    fields: Fields,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    kind: MetricKind,
}

impl TryFrom<RawMetric> for Metric {
    type Error = ValidationError;

    fn try_from(raw: RawMetric) -> Result<Self, Self::Error> {
        Ok(Metric::new(raw.name, raw.tags, raw.fields, raw.timestamp)?.with_kind(raw.kind))
    }
}

impl Metric {
    /// Builds a validated metric. The name must be non-empty and there must be
    /// at least one field; keys must be non-empty and floats finite.
    pub fn new(
        name: impl Into<String>,
        tags: Tags,
        fields: Fields,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if fields.is_empty() {
            return Err(ValidationError::NoFields { measurement: name });
        }
        if tags.keys().any(|k| k.is_empty()) {
            return Err(ValidationError::EmptyTagKey { measurement: name });
        }
        for (key, value) in &fields {
            check_field(&name, key, value)?;
        }

        Ok(Self {
            name,
            tags,
            fields,
            timestamp,
            kind: MetricKind::Untyped,
        })
    }

    pub fn with_kind(mut self, kind: MetricKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Merges `fields` into this metric.
    ///
    /// New keys are added and existing keys take the incoming value, but only
    /// when the value keeps the field's type. On error nothing is changed.
    pub fn merge_fields(&mut self, fields: Fields) -> Result<(), ValidationError> {
        for (key, value) in &fields {
            check_field(&self.name, key, value)?;
            if let Some(existing) = self.fields.get(key) {
                if existing.type_name() != value.type_name() {
                    return Err(ValidationError::FieldTypeChanged {
                        measurement: self.name.clone(),
                        key: key.clone(),
                        existing: existing.type_name(),
                        incoming: value.type_name(),
                    });
                }
            }
        }
        self.fields.extend(fields);
        Ok(())
    }
}

fn check_field(measurement: &str, key: &str, value: &FieldValue) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::EmptyFieldKey {
            measurement: measurement.to_string(),
        });
    }
    if let Some(reason) = value.unsupported_reason() {
        return Err(ValidationError::UnsupportedField {
            measurement: measurement.to_string(),
            key: key.to_string(),
            reason,
        });
    }
    Ok(())
}

/// A source of metrics.
///
/// A collector only knows how to reach its source and turn what it finds into
/// samples. Scheduling, identity tags and delivery are handled by the
/// [`RunningCollector`](crate::RunningCollector) that owns it.
#[async_trait]
pub trait Collector: Send {
    /// Short human readable description of the collector.
    fn describe(&self) -> &'static str;

    /// Commented TOML snippet showing the options the collector accepts.
    fn sample_config(&self) -> &'static str {
        ""
    }

    /// Applies configuration overrides on top of the defaults.
    fn configure(&mut self, options: &RawConfig) -> Result<(), ConfigError> {
        match options.keys().next() {
            Some(key) => Err(ConfigError::UnknownOption(key.clone())),
            None => Ok(()),
        }
    }

    async fn start(&mut self) -> Result<(), CollectionError> {
        Ok(())
    }

    /// Gathers one round of samples into `acc`.
    async fn collect(&mut self, acc: &mut dyn Accumulator) -> Result<(), CollectionError>;

    async fn stop(&mut self) {}
}

/// Overlays `options` on the serialized form of `current`.
///
/// Every option key must name an existing field of `T`.
pub fn apply_overrides<T>(current: &T, options: &RawConfig) -> Result<T, ConfigError>
where
    T: Serialize + DeserializeOwned,
{
    let mut merged = match serde_json::to_value(current)? {
        serde_json::Value::Object(map) => map,
        _ => return Err(ConfigError::Invalid("options must be a table".to_string())),
    };

    for (key, value) in options {
        if !merged.contains_key(key) {
            return Err(ConfigError::UnknownOption(key.clone()));
        }
        merged.insert(key.clone(), value.clone());
    }

    Ok(serde_json::from_value(serde_json::Value::Object(merged))?)
}
