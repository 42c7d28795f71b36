use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identity of this node on the broker. Generated when absent.
    pub node_id: Option<Uuid>,

    /// Board served by this node
    #[serde(default = "default_board_name")]
    pub board_name: String,

    /// Postgres URL used for LISTEN/NOTIFY. Absent means standalone mode.
    pub broker_url: Option<String>,

    #[serde(default = "default_broker_channel")]
    pub broker_channel: String,

    /// Stroke store URL, defaults to the broker URL
    pub db_url: Option<String>,

    #[serde(default = "default_true")]
    pub persist: bool,

    /// Frames queued per connection before the connection is dropped
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,

    #[serde(default = "default_queue_capacity")]
    pub hub_capacity: usize,

    #[serde(default = "default_queue_capacity")]
    pub relay_capacity: usize,

    #[serde(default = "default_max_pending_strokes")]
    pub max_pending_strokes: usize,

    /// Trust the user id a client declares on register
    #[serde(default = "default_true")]
    pub allow_declared_user_id: bool,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        load_env_files();

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                config.validate()?;
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("OUTBOX_CAPACITY", self.outbox_capacity),
            ("HUB_CAPACITY", self.hub_capacity),
            ("RELAY_CAPACITY", self.relay_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.board_name.is_empty() {
            return Err(ConfigError::Invalid("BOARD_NAME must not be empty".to_string()));
        }
        Ok(())
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    /// Where strokes are persisted, if anywhere.
    pub fn store_url(&self) -> Option<&str> {
        if !self.persist {
            return None;
        }
        self.db_url.as_deref().or(self.broker_url.as_deref())
    }

    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            node_id: None,
            board_name: default_board_name(),
            broker_url: None,
            broker_channel: default_broker_channel(),
            db_url: None,
            persist: default_true(),
            outbox_capacity: default_outbox_capacity(),
            hub_capacity: default_queue_capacity(),
            relay_capacity: default_queue_capacity(),
            max_pending_strokes: default_max_pending_strokes(),
            allow_declared_user_id: default_true(),
        }
    }
}

/// Export `app.env` (or `.env`) into the process environment, if present.
pub fn load_env_files() {
    // Try to load from app.env file first
    if std::path::Path::new("app.env").exists() {
        dotenvy::from_filename("app.env").ok();
    } else {
        // Fallback to .env file
        dotenvy::dotenv().ok();
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable error: {0}")]
    EnvError(#[from] envy::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_board_name() -> String {
    "main".to_string()
}

fn default_broker_channel() -> String {
    "canvas_relay".to_string()
}

fn default_true() -> bool {
    true
}

fn default_outbox_capacity() -> usize {
    256
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_pending_strokes() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_url_falls_back_to_broker_url() {
        let mut config = Config {
            broker_url: Some("postgres://broker".into()),
            ..Config::default()
        };
        assert_eq!(config.store_url(), Some("postgres://broker"));

        config.db_url = Some("postgres://db".into());
        assert_eq!(config.store_url(), Some("postgres://db"));

        config.persist = false;
        assert_eq!(config.store_url(), None);
    }

    #[test]
    fn zero_capacities_are_rejected() {
        let config = Config { outbox_capacity: 0, ..Config::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn cors_origins_are_split_and_trimmed() {
        let config = Config {
            cors_origins: Some("http://a.test, http://b.test,".into()),
            ..Config::default()
        };
        assert_eq!(config.cors_origin_list(), vec!["http://a.test", "http://b.test"]);
    }

    #[test]
    fn envy_reads_uppercase_variables() {
        let vars = vec![
            ("PORT".to_string(), "9000".to_string()),
            ("BOARD_NAME".to_string(), "lobby".to_string()),
            ("PERSIST".to_string(), "false".to_string()),
        ];
        let config: Config = envy::from_iter(vars).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.board_name, "lobby");
        assert!(!config.persist);
        assert_eq!(config.outbox_capacity, 256);
    }
}
