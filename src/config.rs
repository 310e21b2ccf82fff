//! Runtime configuration from `SLOTWISE_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::engine::EngineSettings;
use crate::limits::{MAX_HOLD_RETENTION_MS, MAX_HOLD_TTL_MS};
use crate::model::Ms;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub hold_ttl: Duration,
    pub hold_retention: Duration,
    pub janitor_interval: Duration,
    pub max_slots: usize,
    pub quote_cache_ttl: Duration,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "slotwise".into(),
            max_connections: 256,
            compact_threshold: 1000,
            hold_ttl: Duration::from_secs(15 * 60),
            hold_retention: Duration::from_secs(60 * 60),
            janitor_interval: Duration::from_secs(5),
            max_slots: 500,
            quote_cache_ttl: Duration::from_secs(60),
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let d = Self::default();
        let secs = |name: &str, default: Duration| -> Result<Duration> {
            Ok(parse_var(&lookup, name)?.map_or(default, Duration::from_secs))
        };

        let config = Self {
            bind: lookup("SLOTWISE_BIND").unwrap_or(d.bind),
            port: parse_var(&lookup, "SLOTWISE_PORT")?.unwrap_or(d.port),
            data_dir: lookup("SLOTWISE_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            password: lookup("SLOTWISE_PASSWORD").unwrap_or(d.password),
            max_connections: parse_var(&lookup, "SLOTWISE_MAX_CONNECTIONS")?
                .unwrap_or(d.max_connections),
            compact_threshold: parse_var(&lookup, "SLOTWISE_COMPACT_THRESHOLD")?
                .unwrap_or(d.compact_threshold),
            hold_ttl: secs("SLOTWISE_HOLD_TTL_SECS", d.hold_ttl)?,
            hold_retention: secs("SLOTWISE_HOLD_RETENTION_SECS", d.hold_retention)?,
            janitor_interval: secs("SLOTWISE_JANITOR_INTERVAL_SECS", d.janitor_interval)?,
            max_slots: parse_var(&lookup, "SLOTWISE_MAX_SLOTS")?.unwrap_or(d.max_slots),
            quote_cache_ttl: secs("SLOTWISE_QUOTE_CACHE_TTL_SECS", d.quote_cache_ttl)?,
            metrics_port: parse_var(&lookup, "SLOTWISE_METRICS_PORT")?,
        };

        anyhow::ensure!(!config.hold_ttl.is_zero(), "SLOTWISE_HOLD_TTL_SECS must be positive");
        anyhow::ensure!(
            duration_ms(config.hold_ttl) <= MAX_HOLD_TTL_MS,
            "SLOTWISE_HOLD_TTL_SECS must be at most {}",
            MAX_HOLD_TTL_MS / 1000
        );
        anyhow::ensure!(
            duration_ms(config.hold_retention) <= MAX_HOLD_RETENTION_MS,
            "SLOTWISE_HOLD_RETENTION_SECS must be at most {}",
            MAX_HOLD_RETENTION_MS / 1000
        );
        anyhow::ensure!(
            !config.janitor_interval.is_zero(),
            "SLOTWISE_JANITOR_INTERVAL_SECS must be positive"
        );
        anyhow::ensure!(config.max_connections > 0, "SLOTWISE_MAX_CONNECTIONS must be positive");
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotwise.wal")
    }

    pub fn quote_cache_ttl_ms(&self) -> Ms {
        duration_ms(self.quote_cache_ttl)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            hold_ttl_ms: duration_ms(self.hold_ttl),
            hold_retention_ms: duration_ms(self.hold_retention),
            max_slots: self.max_slots,
        }
    }
}

fn duration_ms(d: Duration) -> Ms {
    Ms::try_from(d.as_millis()).unwrap_or(Ms::MAX)
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .with_context(|| format!("invalid value for {name}: {raw:?}"))
        })
        .transpose()
}
