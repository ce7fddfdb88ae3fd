use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Runtime settings, read once from `LABSLOT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub seed_defaults: bool,
    pub notice_ttl: Duration,
    pub weeks: usize,
    /// Delay before a lost backend watch is reopened.
    pub retry: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(30),
            seed_defaults: true,
            notice_ttl: Duration::from_millis(3000),
            weeks: 2,
            retry: Duration::from_secs(1),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("LABSLOT_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            metrics_port: lookup("LABSLOT_METRICS_PORT")
                .and_then(|raw| parse_or_warn("LABSLOT_METRICS_PORT", &raw)),
            compact_threshold: setting(&lookup, "LABSLOT_COMPACT_THRESHOLD", defaults.compact_threshold),
            compact_interval: Duration::from_secs(setting(
                &lookup,
                "LABSLOT_COMPACT_INTERVAL_SECS",
                defaults.compact_interval.as_secs(),
            )),
            seed_defaults: setting(&lookup, "LABSLOT_SEED_DEFAULTS", defaults.seed_defaults),
            notice_ttl: Duration::from_millis(setting(
                &lookup,
                "LABSLOT_NOTICE_TTL_MS",
                defaults.notice_ttl.as_millis() as u64,
            )),
            weeks: setting(&lookup, "LABSLOT_WEEKS", defaults.weeks).max(1),
            retry: Duration::from_millis(setting(
                &lookup,
                "LABSLOT_RETRY_MS",
                defaults.retry.as_millis() as u64,
            )),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("labslot.wal")
    }
}

fn setting<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|raw| parse_or_warn(key, &raw))
        .unwrap_or(default)
}

fn parse_or_warn<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}
