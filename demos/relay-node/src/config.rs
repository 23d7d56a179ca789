//! Node configuration, loaded from a TOML file.
//!
//! ```toml
//! listen_addr = "0.0.0.0:8080"
//!
//! [logging]
//! level = "info"
//! format = "json"
//!
//! [relay]
//! confirmation_window_secs = 600
//! default_task = { policy = "latest_of_kind", kind = "NewPayment" }
//!
//! [relay.retry]
//! max_attempts = 5
//!
//! [store]
//! kind = "postgres"
//! url = "env:DATABASE_URL"
//!
//! [ledger]
//! kind = "simulated"
//! confirm_after_ms = 2000
//! ```
//!
//! String values written as `env:NAME` are replaced with the contents of the
//! environment variable `NAME` when the file is loaded.

use anyhow::{bail, Context, Result};
use relay_core::{LedgerHttpConfig, RelayConfig, SimulatedLedgerConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    Postgres(PostgresConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// First sequence handed out by a freshly migrated database.
    #[serde(default = "default_first_sequence")]
    pub first_sequence: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_first_sequence() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerConfig {
    Simulated(SimulatedLedgerConfig),
    Http(LedgerHttpConfig),
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig::Simulated(SimulatedLedgerConfig::default())
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content).context("failed to parse TOML")?;
        config.resolve_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("listen_addr `{}` is not a socket address", self.listen_addr))?;
        self.relay.validate()?;
        match &self.store {
            StoreConfig::Memory => {}
            StoreConfig::Postgres(pg) => {
                if pg.url.trim().is_empty() {
                    bail!("store.url cannot be empty");
                }
                if pg.max_connections == 0 {
                    bail!("store.max_connections must be >= 1");
                }
                if pg.first_sequence == 0 {
                    bail!("store.first_sequence must be >= 1");
                }
            }
        }
        if let LedgerConfig::Http(http) = &self.ledger {
            http.validate()?;
        }
        Ok(())
    }

    fn resolve_env(&mut self) -> Result<()> {
        if let StoreConfig::Postgres(pg) = &mut self.store {
            resolve_env_value("store.url", &mut pg.url)?;
        }
        if let LedgerConfig::Http(http) = &mut self.ledger {
            resolve_env_value("ledger.base_url", &mut http.base_url)?;
            if let Some(key) = http.api_key.as_mut() {
                resolve_env_value("ledger.api_key", key)?;
            }
        }
        Ok(())
    }
}

fn resolve_env_value(field: &str, value: &mut String) -> Result<()> {
    if let Some(name) = value.strip_prefix("env:") {
        let name = name.trim();
        *value = std::env::var(name)
            .with_context(|| format!("{field} refers to unset environment variable {name}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{DefaultTaskPolicy, TaskKind};

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = NodeConfig::parse("").unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert!(matches!(config.store, StoreConfig::Memory));
        assert!(matches!(config.ledger, LedgerConfig::Simulated(_)));
        assert_eq!(
            config.relay.default_task,
            DefaultTaskPolicy::LatestOfKind(TaskKind::NewPayment)
        );
    }

    #[test]
    fn test_full_config() {
        let config = NodeConfig::parse(
            r#"
listen_addr = "127.0.0.1:9000"

[logging]
level = "relay_core=debug,info"
format = "json"

[relay]
confirmation_window_secs = 120
auto_submit = false
default_task = { policy = "oldest_unfinished" }

[relay.retry]
max_attempts = 5
base_delay_ms = 100
max_delay_ms = 1000

[store]
kind = "postgres"
url = "postgres://relay@localhost/relay"
first_sequence = 42

[ledger]
kind = "http"
base_url = "http://ledger.local"

[ledger.endpoints]
submit = "/tx"
status = "/tx/{handle}"
"#,
        )
        .unwrap();

        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.relay.confirmation_window_secs, 120);
        assert_eq!(config.relay.retry.max_attempts, 5);
        assert!(!config.relay.auto_submit);
        assert_eq!(config.relay.default_task, DefaultTaskPolicy::OldestUnfinished);
        let StoreConfig::Postgres(pg) = &config.store else {
            panic!("expected postgres store");
        };
        assert_eq!(pg.first_sequence, 42);
        assert_eq!(pg.max_connections, 10);
        let LedgerConfig::Http(http) = &config.ledger else {
            panic!("expected http ledger");
        };
        assert_eq!(http.endpoints.status, "/tx/{handle}");
    }

    #[test]
    fn test_env_references_are_resolved() {
        std::env::set_var("RELAY_NODE_TEST_DB_URL", "postgres://from-env/relay");
        let config = NodeConfig::parse(
            r#"
[store]
kind = "postgres"
url = "env:RELAY_NODE_TEST_DB_URL"
"#,
        )
        .unwrap();
        let StoreConfig::Postgres(pg) = config.store else {
            panic!("expected postgres store");
        };
        assert_eq!(pg.url, "postgres://from-env/relay");
    }

    #[test]
    fn test_missing_env_reference_is_an_error() {
        let err = NodeConfig::parse(
            r#"
[store]
kind = "postgres"
url = "env:RELAY_NODE_TEST_UNSET_VARIABLE"
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("RELAY_NODE_TEST_UNSET_VARIABLE"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(NodeConfig::parse(r#"listen_addr = "not an address""#).is_err());
        assert!(NodeConfig::parse("[relay.retry]\nmax_attempts = 0").is_err());
        assert!(NodeConfig::parse("[store]\nkind = \"postgres\"\nurl = \"\"").is_err());
        assert!(NodeConfig::parse("[store]\nkind = \"sqlite\"").is_err());
    }
}
