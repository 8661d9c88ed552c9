pub mod accumulator;
pub mod agent;
pub mod collectors;
pub mod config;
pub mod error;
pub mod logging;
pub mod registry;
pub mod running;
pub mod storage;

pub use accumulator::{Accumulator, ChannelSink, MetricAccumulator, MetricSink, VecSink};
pub use collectors::{Collector, FieldValue, Fields, Metric, MetricKind, Tags};
pub use error::{CollectionError, ConfigError, RegistryError, ValidationError};
pub use registry::Registry;
pub use running::RunningCollector;
