use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::relay::RelayConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Seconds a client gets to complete the WebSocket upgrade.
    pub handshake_timeout_secs: u64,
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LivenessConfig {
    pub interval_secs: u64,
    /// Consecutive unacknowledged probes before a peer is closed. `0` keeps
    /// probes purely observational.
    pub max_missed_probes: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub workers: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub liveness: LivenessConfig,
    pub health: HealthConfig,
    pub log: LogConfig,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = defaults("development")?
            // Add in settings from the config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false));

        // E.g., `APP_SERVER__PORT=5001` would set `Settings.server.port`
        Self::load(builder, app_environment(), env::var("PORT").ok())
    }

    /// Builds settings from defaults plus the given environment source.
    /// `port` mirrors the conventional `PORT` variable and wins over everything.
    pub fn from_environment(
        environment: Environment,
        port: Option<String>,
    ) -> Result<Self, ConfigError> {
        Self::load(defaults("development")?, environment, port)
    }

    #[cfg(test)]
    pub fn new_for_test() -> Result<Self, ConfigError> {
        let environment = app_environment().source(Some(Default::default()));
        Self::load(defaults("test")?, environment, None)
    }

    fn load(
        builder: ConfigBuilder<DefaultState>,
        environment: Environment,
        port: Option<String>,
    ) -> Result<Self, ConfigError> {
        let settings: Settings = builder
            .add_source(environment)
            .set_override_option("server.port", port)?
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.liveness.interval_secs == 0 {
            return Err(ConfigError::Message(
                "liveness.interval_secs must be greater than zero".into(),
            ));
        }
        if self.server.handshake_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "server.handshake_timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            liveness_interval: Duration::from_secs(self.liveness.interval_secs),
            max_missed_probes: self.liveness.max_missed_probes,
        }
    }
}

/// Environment source with prefix "APP_" and `__` as the nesting separator.
pub fn app_environment() -> Environment {
    Environment::with_prefix("app")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

fn defaults(environment: &str) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("environment", environment)?
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("server.handshake_timeout_secs", 10)?
        .set_default("liveness.interval_secs", 30)?
        .set_default("liveness.max_missed_probes", 0)?
        .set_default("health.enabled", true)?
        .set_default("health.host", "127.0.0.1")?
        .set_default("health.port", 8081)?
        .set_default("health.workers", num_cpus::get() as i64)?
        .set_default("log.level", "info")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn environment(vars: &[(&str, &str)]) -> Environment {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        app_environment().source(Some(source))
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::new_for_test().expect("Failed to load settings");
        assert_eq!(settings.environment, "test");
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(settings.liveness.interval_secs, 30);
        assert_eq!(settings.liveness.max_missed_probes, 0);
        assert!(settings.health.enabled);
        assert_eq!(settings.health.port, 8081);
        assert_eq!(settings.health.workers as usize, num_cpus::get());
        assert_eq!(settings.log.level, "info");
    }

    #[test]
    fn test_environment_override() {
        let settings = Settings::from_environment(
            environment(&[
                ("APP_SERVER__HOST", "127.0.0.1"),
                ("APP_SERVER__PORT", "9000"),
                ("APP_SERVER__HANDSHAKE_TIMEOUT_SECS", "3"),
                ("APP_LIVENESS__INTERVAL_SECS", "5"),
                ("APP_LIVENESS__MAX_MISSED_PROBES", "2"),
                ("APP_HEALTH__ENABLED", "false"),
                ("APP_LOG__LEVEL", "debug"),
            ]),
            None,
        )
        .expect("Failed to load settings");

        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.handshake_timeout_secs, 3);
        assert_eq!(settings.liveness.interval_secs, 5);
        assert_eq!(settings.liveness.max_missed_probes, 2);
        assert!(!settings.health.enabled);
        assert_eq!(settings.log.level, "debug");

        let relay = settings.relay_config();
        assert_eq!(relay.liveness_interval, Duration::from_secs(5));
        assert_eq!(relay.max_missed_probes, 2);
    }

    #[test]
    fn test_port_variable_wins() {
        let settings = Settings::from_environment(
            environment(&[("APP_SERVER__PORT", "9000")]),
            Some("7070".to_string()),
        )
        .expect("Failed to load settings");

        assert_eq!(settings.server.port, 7070);
    }

    #[test]
    fn test_invalid_port() {
        let result = Settings::from_environment(
            environment(&[("APP_SERVER__PORT", "invalid")]),
            None,
        );

        assert!(result.is_err(), "Expected error for invalid port");
    }

    #[test]
    fn test_zero_liveness_interval_rejected() {
        let result = Settings::from_environment(
            environment(&[("APP_LIVENESS__INTERVAL_SECS", "0")]),
            None,
        );

        match result {
            Err(ConfigError::Message(msg)) => assert!(msg.contains("interval_secs")),
            other => panic!("Expected validation error, got {:?}", other),
        }
    }
}
