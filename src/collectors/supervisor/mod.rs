pub mod xmlrpc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::host;
use super::types::{apply_overrides, Collector, FieldValue, Fields, RawConfig, Tags};
use crate::accumulator::Accumulator;
use crate::error::{CollectionError, ConfigError};
use xmlrpc::{Value, XmlRpcClient};

pub const MEASUREMENT: &str = "supervisor";
pub const DEFAULT_URL: &str = "http://127.0.0.1:9001/RPC2";
const GET_ALL_PROCESS_INFO: &str = "supervisor.getAllProcessInfo";

const SAMPLE_CONFIG: &str = r#"
  ## supervisord XML-RPC endpoint ("host" is accepted as an alias)
  # url = "http://127.0.0.1:9001/RPC2"
  ## credentials of the [inet_http_server] section, if any
  # username = "user"
  # password = "secret"
  ## HTTP request timeout
  # timeout_secs = 5
"#;

/// Where process records come from.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessSource: Send + Sync {
    /// One raw record per process managed by supervisord.
    async fn all_process_info(&self) -> Result<Vec<Value>, CollectionError>;
}

#[async_trait]
impl ProcessSource for XmlRpcClient {
    async fn all_process_info(&self) -> Result<Vec<Value>, CollectionError> {
        match self.call(GET_ALL_PROCESS_INFO).await? {
            Value::Array(records) => Ok(records),
            other => Err(CollectionError::Protocol(format!(
                "{GET_ALL_PROCESS_INFO} returned {other:?} instead of an array"
            ))),
        }
    }
}

/// State of one supervised process, as reported by supervisord.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub name: String,
    pub group: String,
    pub description: String,
    pub start: i64,
    pub stop: i64,
    pub now: i64,
    pub state: i64,
    pub statename: String,
    pub spawnerr: String,
    pub exitstatus: i64,
    pub stdout_logfile: String,
    pub stderr_logfile: String,
    pub pid: i64,
}

impl ProcessInfo {
    pub fn from_value(value: &Value) -> Result<Self, CollectionError> {
        let members = value
            .as_struct()
            .ok_or_else(|| CollectionError::Protocol(format!("process record is not a struct: {value:?}")))?;

        let int = |key: &str| {
            members
                .get(key)
                .and_then(Value::as_i64)
                .ok_or_else(|| missing(key, "integer"))
        };
        let string = |key: &str| {
            members
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| missing(key, "string"))
        };

        Ok(Self {
            name: string("name")?,
            group: string("group")?,
            description: string("description")?,
            start: int("start")?,
            stop: int("stop")?,
            now: int("now")?,
            state: int("state")?,
            statename: string("statename")?,
            spawnerr: string("spawnerr")?,
            exitstatus: int("exitstatus")?,
            stdout_logfile: string("stdout_logfile")?,
            stderr_logfile: string("stderr_logfile")?,
            pid: int("pid")?,
        })
    }

    /// The record's own notion of "now", which stamps the metric.
    pub fn timestamp(&self) -> Result<DateTime<Utc>, CollectionError> {
        DateTime::from_timestamp(self.now, 0)
            .ok_or_else(|| CollectionError::Protocol(format!("timestamp {} out of range", self.now)))
    }

    pub fn fields(&self) -> Fields {
        let fields: [(&str, FieldValue); 13] = [
            ("name", self.name.as_str().into()),
            ("group", self.group.as_str().into()),
            ("description", self.description.as_str().into()),
            ("start", self.start.into()),
            ("stop", self.stop.into()),
            ("now", self.now.into()),
            ("state", self.state.into()),
            ("statename", self.statename.as_str().into()),
            ("spawnerr", self.spawnerr.as_str().into()),
            ("exitstatus", self.exitstatus.into()),
            ("stdout_logfile", self.stdout_logfile.as_str().into()),
            ("stderr_logfile", self.stderr_logfile.as_str().into()),
            ("pid", self.pid.into()),
        ];
        fields
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect()
    }
}

fn missing(key: &str, kind: &str) -> CollectionError {
    CollectionError::Protocol(format!("process record has no {kind} member {key:?}"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            username: None,
            password: None,
            timeout_secs: 5,
        }
    }
}

/// Reports every process managed by a supervisord instance.
#[derive(Default)]
pub struct SupervisorCollector {
    config: SupervisorConfig,
    source: Option<Arc<dyn ProcessSource>>,
}

impl SupervisorCollector {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            source: None,
        }
    }

    /// Reads records from `source` instead of the configured endpoint.
    pub fn with_source(mut self, source: Arc<dyn ProcessSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn source(&self) -> Result<Arc<dyn ProcessSource>, CollectionError> {
        if let Some(source) = &self.source {
            return Ok(Arc::clone(source));
        }

        let mut client = XmlRpcClient::new(&self.config.url, Duration::from_secs(self.config.timeout_secs))?;
        if let Some(username) = &self.config.username {
            client = client.with_basic_auth(username.clone(), self.config.password.clone());
        }
        Ok(Arc::new(client))
    }
}

#[async_trait]
impl Collector for SupervisorCollector {
    fn describe(&self) -> &'static str {
        "Gather process states from a supervisord XML-RPC endpoint"
    }

    fn sample_config(&self) -> &'static str {
        SAMPLE_CONFIG
    }

    fn configure(&mut self, options: &RawConfig) -> Result<(), ConfigError> {
        let mut options = options.clone();
        if let Some(host) = options.remove("host") {
            if options.contains_key("url") {
                return Err(ConfigError::Invalid(
                    "\"host\" and \"url\" name the same option".to_string(),
                ));
            }
            options.insert("url".to_string(), host);
        }

        let config: SupervisorConfig = apply_overrides(&self.config, &options)?;
        if config.url.trim().is_empty() {
            return Err(ConfigError::Invalid("url must not be empty".to_string()));
        }
        if config.timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeout_secs must be positive".to_string()));
        }
        self.config = config;
        Ok(())
    }

    async fn collect(&mut self, acc: &mut dyn Accumulator) -> Result<(), CollectionError> {
        let source = self.source()?;
        let records = source.all_process_info().await?;
        let hostname = host::local_hostname();

        for record in &records {
            let info = ProcessInfo::from_value(record)?;
            let timestamp = info.timestamp()?;

            let mut tags = Tags::new();
            tags.insert("host".to_string(), hostname.clone());
            tags.insert("program".to_string(), info.name.clone());

            if let Err(e) = acc.emit(MEASUREMENT, tags, info.fields(), Some(timestamp)) {
                tracing::debug!(program = %info.name, error = %e, "skipped process record");
            }
        }

        tracing::debug!(url = %self.config.url, processes = records.len(), "supervisor collection done");
        Ok(())
    }
}
