use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_CONFIG_PATH: &str = "ohm-influxdb.json";

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 8086;
const DEFAULT_DATABASE: &str = "ohm";
const DEFAULT_INTERVAL_SECS: u64 = 5;
const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_BATCH_SIZE: usize = 5_000;
const DEFAULT_MAX_BUFFERED: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("http"),
            Protocol::Https => f.write_str("https"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub database: String,
    pub interval_secs: u64,
    pub machine_name: String,
    pub verbose: bool,
    pub batch_size: usize,
    pub max_buffered: usize,
}

/// Settings as found in a file or the environment, before validation.
#[derive(Debug, Default, Clone, Deserialize)]
struct RawSettings {
    #[serde(default)]
    host: Option<Value>,
    #[serde(default)]
    port: Option<Value>,
    #[serde(default)]
    protocol: Option<Value>,
    #[serde(default)]
    database: Option<Value>,
    #[serde(default)]
    interval: Option<Value>,
    #[serde(default)]
    machine_name: Option<Value>,
    #[serde(default)]
    verbose: Option<Value>,
    #[serde(default)]
    batch_size: Option<Value>,
    #[serde(default)]
    max_buffered: Option<Value>,
}

impl RawSettings {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(Value::String)
        };
        Self {
            host: get("OHM_INFLUX_HOST"),
            port: get("OHM_INFLUX_PORT"),
            protocol: get("OHM_INFLUX_PROTOCOL"),
            database: get("OHM_INFLUX_DATABASE"),
            interval: get("OHM_INFLUX_INTERVAL"),
            machine_name: get("OHM_INFLUX_MACHINE_NAME"),
            verbose: get("OHM_INFLUX_VERBOSE"),
            batch_size: get("OHM_INFLUX_BATCH_SIZE"),
            max_buffered: get("OHM_INFLUX_MAX_BUFFERED"),
        }
    }

    fn from_file(path: &Path) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config file; using defaults"
                );
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(settings) => Some(settings),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to parse config file; using defaults"
                );
                None
            }
        }
    }

    fn overlay(&mut self, other: RawSettings) {
        let RawSettings {
            host,
            port,
            protocol,
            database,
            interval,
            machine_name,
            verbose,
            batch_size,
            max_buffered,
        } = other;
        self.host = host.or(self.host.take());
        self.port = port.or(self.port.take());
        self.protocol = protocol.or(self.protocol.take());
        self.database = database.or(self.database.take());
        self.interval = interval.or(self.interval.take());
        self.machine_name = machine_name.or(self.machine_name.take());
        self.verbose = verbose.or(self.verbose.take());
        self.batch_size = batch_size.or(self.batch_size.take());
        self.max_buffered = max_buffered.or(self.max_buffered.take());
    }
}

impl Config {
    /// Defaults, then the JSON file, then `.env` and the process environment.
    /// Bad values are logged and replaced by their default; loading never fails.
    pub fn load(path: Option<&Path>) -> Self {
        dotenv().ok();

        let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
        let mut raw = RawSettings::from_file(&path).unwrap_or_default();
        raw.overlay(RawSettings::from_lookup(|key| env::var(key).ok()));

        let config = Self::from_raw(raw);
        tracing::info!(
            host = %config.host,
            port = config.port,
            protocol = %config.protocol,
            database = %config.database,
            interval = config.interval_secs,
            machine = %config.machine_name,
            "configuration loaded"
        );
        config
    }

    fn from_raw(raw: RawSettings) -> Self {
        let host = raw
            .host
            .as_ref()
            .and_then(value_string)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let port = match raw.port.as_ref().and_then(value_string) {
            Some(value) => match value.parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => {
                    tracing::warn!(value = %value, default = DEFAULT_PORT, "invalid port; using default");
                    DEFAULT_PORT
                }
            },
            None => DEFAULT_PORT,
        };

        let protocol = match raw.protocol.as_ref().and_then(value_string) {
            Some(value) => Protocol::parse(&value).unwrap_or_else(|| {
                tracing::warn!(value = %value, "invalid protocol; using http");
                Protocol::Http
            }),
            None => Protocol::Http,
        };

        let database = raw
            .database
            .as_ref()
            .and_then(value_string)
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string());

        let interval_secs = match raw.interval.as_ref().and_then(value_string) {
            Some(value) => match value.parse::<u64>() {
                Ok(secs) if (1..=MAX_INTERVAL_SECS).contains(&secs) => secs,
                _ => {
                    tracing::warn!(
                        value = %value,
                        default = DEFAULT_INTERVAL_SECS,
                        "invalid interval; using default"
                    );
                    DEFAULT_INTERVAL_SECS
                }
            },
            None => DEFAULT_INTERVAL_SECS,
        };

        let machine_name = raw
            .machine_name
            .as_ref()
            .and_then(value_string)
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "unknown".to_string());

        let verbose = raw
            .verbose
            .as_ref()
            .and_then(value_string)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let batch_size = positive(raw.batch_size.as_ref(), "batch_size", DEFAULT_BATCH_SIZE);
        let max_buffered = positive(raw.max_buffered.as_ref(), "max_buffered", DEFAULT_MAX_BUFFERED);

        Self {
            host,
            port,
            protocol,
            database,
            interval_secs,
            machine_name,
            verbose,
            batch_size,
            max_buffered,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Base URL of the InfluxDB HTTP API, e.g. `http://localhost:8086/`.
    pub fn address(&self) -> Result<Url> {
        let raw = format!("{}://{}:{}/", self.protocol, self.host, self.port);
        Url::parse(&raw).with_context(|| format!("invalid influxdb address {raw}"))
    }
}

fn config_path() -> PathBuf {
    env::var("OHM_INFLUX_CONFIG")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn positive(value: Option<&Value>, name: &str, default: usize) -> usize {
    let Some(value) = value.and_then(value_string) else {
        return default;
    };
    match value.parse::<usize>() {
        Ok(parsed) if parsed > 0 => parsed,
        _ => {
            tracing::warn!(option = name, value = %value, default, "invalid value; using default");
            default
        }
    }
}

// Files may carry numbers or strings for any option.
fn value_string(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if raw.is_empty() {
        None
    } else {
        Some(raw)
    }
}
