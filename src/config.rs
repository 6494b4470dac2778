use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::ConflictPolicy;

/// Server settings, read once from `TRAININGD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Bootstrap admin created on first start.
    pub admin_email: String,
    pub cancelled_frees_slot: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "trainingd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            admin_email: "admin@example.com".into(),
            cancelled_frees_slot: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or unparsable values keep their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            port: parsed(&lookup, "TRAININGD_PORT").unwrap_or(defaults.port),
            bind: lookup("TRAININGD_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("TRAININGD_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: lookup("TRAININGD_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "TRAININGD_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "TRAININGD_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "TRAININGD_METRICS_PORT"),
            tls_cert: lookup("TRAININGD_TLS_CERT"),
            tls_key: lookup("TRAININGD_TLS_KEY"),
            admin_email: lookup("TRAININGD_ADMIN_EMAIL").unwrap_or(defaults.admin_email),
            cancelled_frees_slot: lookup("TRAININGD_CANCELLED_FREES_SLOT")
                .map(|raw| parse_flag(&raw))
                .unwrap_or(defaults.cancelled_frees_slot),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("trainingd.wal")
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        ConflictPolicy { ignore_cancelled: self.cancelled_frees_slot }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|raw| parse_or_warn(key, &raw))
}

fn parse_or_warn<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    let value = raw.trim().parse().ok();
    if value.is_none() {
        tracing::warn!("ignoring {key}={raw:?}: not a valid value");
    }
    value
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
