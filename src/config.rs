use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::scheduler::ReconcilerConfig;

/// Process settings, read from `SERVICESYNC_*` environment variables.
/// Unparseable values fall back to the default.
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
    pub reconcile_interval: Duration,
    pub stale_after: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let reconciler = ReconcilerConfig::default();
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "servicesync".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            reconcile_interval: reconciler.interval,
            stale_after: reconciler.stale_after,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(raw: Option<String>) -> Option<T> {
            raw.and_then(|s| s.trim().parse().ok())
        }

        let var = |name: &str| lookup(&format!("SERVICESYNC_{name}"));
        let d = Self::default();
        Self {
            port: parsed(var("PORT")).unwrap_or(d.port),
            bind: var("BIND").unwrap_or(d.bind),
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: var("PASSWORD").unwrap_or(d.password),
            max_connections: parsed(var("MAX_CONNECTIONS")).unwrap_or(d.max_connections),
            compact_threshold: parsed(var("COMPACT_THRESHOLD")).unwrap_or(d.compact_threshold),
            metrics_port: parsed(var("METRICS_PORT")),
            tls_cert: var("TLS_CERT"),
            tls_key: var("TLS_KEY"),
            reconcile_interval: parsed(var("RECONCILE_INTERVAL_SECS"))
                .filter(|s: &u64| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.reconcile_interval),
            stale_after: parsed(var("STALE_AFTER_SECS"))
                .map(Duration::from_secs)
                .unwrap_or(d.stale_after),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: self.reconcile_interval,
            stale_after: self.stale_after,
        }
    }
}
