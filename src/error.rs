use std::time::Duration;

/// A sample that cannot become a [`Metric`](crate::Metric).
///
/// Raised by a single `emit` call; it never aborts the collection cycle the
/// sample came from.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("measurement name is empty")]
    EmptyName,

    #[error("measurement {measurement:?} has no fields")]
    NoFields { measurement: String },

    #[error("measurement {measurement:?} has a field with an empty key")]
    EmptyFieldKey { measurement: String },

    #[error("measurement {measurement:?} has a tag with an empty key")]
    EmptyTagKey { measurement: String },

    #[error("field {key:?} of measurement {measurement:?} is not supported: {reason}")]
    UnsupportedField {
        measurement: String,
        key: String,
        reason: &'static str,
    },

    #[error("field {key:?} of measurement {measurement:?} cannot change type from {existing} to {incoming}")]
    FieldTypeChanged {
        measurement: String,
        key: String,
        existing: &'static str,
        incoming: &'static str,
    },
}

impl ValidationError {
    /// The field or tag key the error points at, when there is one.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::UnsupportedField { key, .. } | Self::FieldTypeChanged { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// A failed collection cycle of one collector instance.
#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    /// The endpoint could not be reached or the HTTP exchange failed.
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The remote side answered with an RPC fault.
    #[error("remote fault {code}: {message}")]
    Fault { code: i64, message: String },

    /// The response could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("collection timed out after {0:?}")]
    Timeout(Duration),

    #[error("collection cancelled")]
    Cancelled,
}

/// Startup-time failures while wiring collectors together.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown plugin type {0:?}")]
    UnknownPluginType(String),

    #[error("plugin type {0:?} is already registered with a different collector")]
    RegistrationConflict(String),

    #[error("invalid configuration for plugin type {type_name:?}: {source}")]
    InvalidConfig {
        type_name: String,
        #[source]
        source: ConfigError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid option value: {0}")]
    Options(#[from] serde_json::Error),

    #[error("unknown option {0:?}")]
    UnknownOption(String),

    #[error("{0}")]
    Invalid(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}
