use anyhow::{Context, Result, anyhow, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    broadcaster::MAX_TICK_INTERVAL,
    model::{CityEntry, CityTable},
    transport::MqttSettings,
};

/// Broker connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// MQTT client id; generated from the process id when absent.
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "broker.hivemq.com".to_string(),
            port: 1883,
            client_id: None,
            keep_alive_secs: 60,
        }
    }
}

/// Startup connection policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub ack_timeout_secs: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            ack_timeout_secs: 10,
        }
    }
}

/// Top-level configuration stored on disk.
///
/// Example TOML:
/// ```toml
/// topic = "test"
/// tick_interval_secs = 5
///
/// [broker]
/// host = "broker.hivemq.com"
/// port = 1883
///
/// [[cities]]
/// name = "Brno"
/// temperature = "24.4 C"
/// humidity = "46.3 %"
/// visibility = "98.2 %"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub topic: String,
    pub tick_interval_secs: u64,
    pub broker: BrokerConfig,
    pub connect: ConnectConfig,

    /// Replaces the built-in city table when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cities: Option<Vec<CityEntry>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topic: "test".to_string(),
            tick_interval_secs: 5,
            broker: BrokerConfig::default(),
            connect: ConnectConfig::default(),
            cities: None,
        }
    }
}

impl Config {
    /// Load config from `path`, or defaults if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(cfg)
    }

    /// Save config to `path`, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "weather-task", "weather-broadcaster")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Reject values the broadcaster cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            bail!("Topic must not be empty");
        }
        if self.topic.contains(['+', '#']) {
            bail!(
                "Topic '{}' must not contain MQTT wildcards ('+' or '#')",
                self.topic
            );
        }
        if self.broker.host.trim().is_empty() {
            bail!("Broker host must not be empty");
        }
        if self.broker.port == 0 {
            bail!("Broker port must not be 0");
        }
        if let Some(client_id) = &self.broker.client_id {
            if client_id.is_empty() || client_id.starts_with(char::is_whitespace) {
                bail!("Broker client_id must not be empty or start with whitespace");
            }
        }
        if self.broker.keep_alive_secs < 5 {
            bail!(
                "Keep-alive must be at least 5 seconds, got {}",
                self.broker.keep_alive_secs
            );
        }
        if self.tick_interval_secs == 0 {
            bail!("Tick interval must be at least 1 second");
        }
        if self.tick_interval_secs > MAX_TICK_INTERVAL.as_secs() {
            bail!(
                "Tick interval must be at most {} seconds, got {}",
                MAX_TICK_INTERVAL.as_secs(),
                self.tick_interval_secs
            );
        }
        if self.connect.max_attempts == 0 {
            bail!("connect.max_attempts must be at least 1");
        }
        if self.connect.ack_timeout_secs == 0 {
            bail!("connect.ack_timeout_secs must be at least 1");
        }

        self.city_table()?;
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// City table from config, or the built-in one.
    pub fn city_table(&self) -> Result<CityTable> {
        match &self.cities {
            Some(entries) => CityTable::new(entries.iter().cloned())
                .context("Invalid [[cities]] table in configuration"),
            None => Ok(CityTable::builtin()),
        }
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        let mut settings =
            MqttSettings::new(self.broker.host.clone(), self.broker.port, self.topic.clone());

        if let Some(client_id) = &self.broker.client_id {
            settings.client_id = client_id.clone();
        }
        settings.keep_alive = Duration::from_secs(self.broker.keep_alive_secs);
        settings.max_attempts = self.connect.max_attempts;
        settings.initial_backoff = Duration::from_millis(self.connect.initial_backoff_ms);
        settings.max_backoff = Duration::from_millis(self.connect.max_backoff_ms);
        settings.ack_timeout = Duration::from_secs(self.connect.ack_timeout_secs);
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WeatherRecord;

    #[test]
    fn defaults_match_public_broker_setup() {
        let cfg = Config::default();

        assert_eq!(cfg.broker.host, "broker.hivemq.com");
        assert_eq!(cfg.broker.port, 1883);
        assert_eq!(cfg.topic, "test");
        assert_eq!(cfg.tick_interval(), Duration::from_secs(5));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            tick_interval_secs = 2

            [broker]
            host = "localhost"
            "#,
        )
        .expect("valid toml");

        assert_eq!(cfg.broker.host, "localhost");
        assert_eq!(cfg.broker.port, 1883);
        assert_eq!(cfg.tick_interval_secs, 2);
        assert_eq!(cfg.topic, "test");
        assert_eq!(cfg.connect, ConnectConfig::default());
    }

    #[test]
    fn cities_section_replaces_builtin_table() {
        let cfg: Config = toml::from_str(
            r#"
            [[cities]]
            name = "Oslo"
            temperature = "-3.0 C"
            humidity = "80.0 %"
            visibility = "40.0 %"

            [[cities]]
            name = "Bergen"
            temperature = "4.1 C"
            humidity = "91.0 %"
            visibility = "22.5 %"
            "#,
        )
        .expect("valid toml");

        let table = cfg.city_table().expect("valid table");
        let names: Vec<_> = table.names().collect();

        assert_eq!(names, ["Oslo", "Bergen"]);
        assert_eq!(
            table.get("Oslo"),
            Some(&WeatherRecord::new("-3.0 C", "80.0 %", "40.0 %"))
        );
    }

    #[test]
    fn empty_cities_section_is_rejected() {
        let cfg = Config {
            cities: Some(Vec::new()),
            ..Config::default()
        };

        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("at least one city"));
    }

    #[test]
    fn validate_rejects_unusable_values() {
        let cases: [(&str, fn(&mut Config)); 9] = [
            ("Topic", |c| c.topic = " ".into()),
            ("wildcards", |c| c.topic = "weather/#".into()),
            ("wildcards", |c| c.topic = "weather/+/now".into()),
            ("client_id", |c| c.broker.client_id = Some(String::new())),
            ("host", |c| c.broker.host.clear()),
            ("port", |c| c.broker.port = 0),
            ("Tick interval", |c| c.tick_interval_secs = 0),
            ("at most", |c| c.tick_interval_secs = u64::MAX),
            ("max_attempts", |c| c.connect.max_attempts = 0),
        ];

        for (needle, mutate) in cases {
            let mut cfg = Config::default();
            mutate(&mut cfg);

            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains(needle), "{needle}: {err}");
        }
    }

    #[test]
    fn longest_interval_is_accepted() {
        let cfg = Config {
            tick_interval_secs: MAX_TICK_INTERVAL.as_secs(),
            topic: "weather/brno".into(),
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn mqtt_settings_follow_config() {
        let mut cfg = Config::default();
        cfg.broker.client_id = Some("station-1".into());
        cfg.connect.max_attempts = 2;
        cfg.connect.ack_timeout_secs = 3;

        let settings = cfg.mqtt_settings();

        assert_eq!(settings.client_id, "station-1");
        assert_eq!(settings.max_attempts, 2);
        assert_eq!(settings.ack_timeout, Duration::from_secs(3));
        assert_eq!(settings.topic, "test");
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("weather-core-cfg-{}", std::process::id()));
        let path = dir.join("nested").join("config.toml");

        let mut cfg = Config::default();
        cfg.topic = "weather/demo".into();
        cfg.cities = Some(CityTable::builtin().iter().cloned().collect());

        cfg.save_to(&path).expect("save");
        let loaded = Config::load_from(&path).expect("load");
        fs::remove_dir_all(&dir).ok();

        assert_eq!(loaded, cfg);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join("weather-core-does-not-exist/config.toml");
        assert_eq!(Config::load_from(&path).unwrap(), Config::default());
    }
}
