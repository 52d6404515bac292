// Settings for the broker connection, the database and the optional metrics
// listener. Values come from an optional settings file, then `BRIDGE_*`
// environment variables; anything not provided keeps its default. A file
// that fails to parse or validate makes the whole load fail and the caller
// falls back to `Settings::default()`.
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, Value};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

pub const DEFAULT_SETTINGS_FILE: &str = "appsettings.json";
pub const SETTINGS_PATH_VAR: &str = "BRIDGE_SETTINGS";
const ENV_PREFIX: &str = "BRIDGE";

/// Top-level settings, loaded once at startup and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,
    pub metrics: MetricsConfig,
}

/// MQTT broker connection options.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Empty username connects anonymously.
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub topics: Vec<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    /// Capacity of the request channel between the client handle and its event loop.
    pub channel_capacity: usize,
    pub tls: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: "admin".to_string(),
            password: "admin".to_string(),
            client_id: "DatabaseSubscriber".to_string(),
            topics: vec!["sensors/data".to_string()],
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            channel_capacity: 10,
            tls: false,
        }
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.username.is_empty() {
            None
        } else {
            Some((&self.username, &self.password))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    #[default]
    Postgres,
    DuckDb,
}

/// Relational store options. `host`/`port`/credentials apply to the
/// PostgreSQL engine, `path` to the embedded DuckDB engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub engine: DatabaseEngine,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub connection_timeout_secs: u64,
    pub table: String,
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            engine: DatabaseEngine::Postgres,
            host: "localhost".to_string(),
            port: 5432,
            database: "mqttpublisher".to_string(),
            username: "root".to_string(),
            password: "root".to_string(),
            connection_timeout_secs: 30,
            table: "ReceivedSensorData".to_string(),
            path: "mqttpublisher.duckdb".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

/// Prometheus exposition. Disabled unless `listen` is set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub listen: Option<String>,
}

/// True for names usable as an unescaped SQL table identifier.
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// Older deployments ship `appsettings.json` with `MqttConfig` and
// `MySqlConfig` sections. Their values become defaults, so keys in the current
// layout and environment variables still override them.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacySections {
    #[serde(rename = "MqttConfig")]
    mqtt: Option<LegacyMqtt>,
    #[serde(rename = "MySqlConfig")]
    database: Option<LegacyDatabase>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LegacyMqtt {
    server: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
    subscribe_topics: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LegacyDatabase {
    server: Option<String>,
    port: Option<u16>,
    database: Option<String>,
    user_id: Option<String>,
    password: Option<String>,
    connection_timeout: Option<u64>,
}

type Builder = ConfigBuilder<DefaultState>;

fn seed_key<T: Into<Value>>(
    builder: Builder,
    key: &str,
    value: Option<T>,
) -> Result<Builder, ConfigError> {
    match value {
        Some(value) => builder.set_default(key, value),
        None => Ok(builder),
    }
}

impl LegacySections {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path).required(false))
            .build()?
            .try_deserialize()
    }

    fn is_present(&self) -> bool {
        self.mqtt.is_some() || self.database.is_some()
    }

    fn seed(self, mut builder: Builder) -> Result<Builder, ConfigError> {
        if let Some(mqtt) = self.mqtt {
            builder = seed_key(builder, "broker.host", mqtt.server)?;
            builder = seed_key(builder, "broker.port", mqtt.port)?;
            builder = seed_key(builder, "broker.username", mqtt.username)?;
            builder = seed_key(builder, "broker.password", mqtt.password)?;
            builder = seed_key(builder, "broker.client_id", mqtt.client_id)?;
            builder = seed_key(builder, "broker.topics", mqtt.subscribe_topics)?;
        }
        if let Some(db) = self.database {
            builder = seed_key(builder, "database.host", db.server)?;
            builder = seed_key(builder, "database.port", db.port)?;
            builder = seed_key(builder, "database.database", db.database)?;
            builder = seed_key(builder, "database.username", db.user_id)?;
            builder = seed_key(builder, "database.password", db.password)?;
            builder = seed_key(builder, "database.connection_timeout_secs", db.connection_timeout)?;
        }
        Ok(builder)
    }
}

impl Settings {
    fn validate(&self) -> Result<(), String> {
        let broker = &self.broker;
        if broker.host.trim().is_empty() {
            return Err("broker.host must not be empty".into());
        }
        if broker.client_id.trim().is_empty() {
            return Err("broker.client_id must not be empty".into());
        }
        if broker.keep_alive_secs < 5 {
            return Err(format!(
                "broker.keep_alive_secs must be at least 5, got {}",
                broker.keep_alive_secs
            ));
        }
        if broker.connect_timeout_secs == 0 {
            return Err("broker.connect_timeout_secs must be greater than zero".into());
        }
        if broker.channel_capacity == 0 {
            return Err("broker.channel_capacity must be greater than zero".into());
        }

        let database = &self.database;
        if database.connection_timeout_secs == 0 {
            return Err("database.connection_timeout_secs must be greater than zero".into());
        }
        if !is_plain_identifier(&database.table) {
            return Err(format!("database.table is not a valid identifier: {:?}", database.table));
        }
        if database.engine == DatabaseEngine::DuckDb && database.path.trim().is_empty() {
            return Err("database.path must be set for the duckdb engine".into());
        }
        Ok(())
    }

    /// Load settings from `path` (optional) and `BRIDGE_*` environment variables.
    pub fn load(path: &Path) -> Result<Settings, ConfigError> {
        let legacy = LegacySections::read(path)?;
        if legacy.is_present() {
            info!("Reading MqttConfig/MySqlConfig sections from {}", path.display());
        }

        let settings: Settings = legacy
            .seed(Config::builder())?
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("broker.topics")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate().map_err(ConfigError::Message)?;
        Ok(settings)
    }

    /// Load settings, falling back to the built-in defaults on any failure.
    pub fn load_or_default(path: &Path) -> Settings {
        match Settings::load(path) {
            Ok(settings) => {
                crate::success!("Configuration loaded successfully.");
                settings
            }
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                warn!("Using default configuration as fallback.");
                Settings::default()
            }
        }
    }
}
