use std::path::PathBuf;

use chrono::Duration;

/// Process configuration, read from `SLOTKEEPER_*` environment variables.
/// Unset or unparsable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends since the last compaction before the compactor rewrites the log.
    pub compact_threshold: u64,
    pub cancel_notice: Duration,
    pub stale_retries: usize,
    /// Print every state change to stdout as a JSON line.
    pub event_log: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            cancel_notice: Duration::hours(24),
            stale_retries: 3,
            event_log: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let lookup = &lookup;

        Self {
            data_dir: lookup("SLOTKEEPER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: parsed(lookup, "SLOTKEEPER_METRICS_PORT"),
            compact_threshold: parsed(lookup, "SLOTKEEPER_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            cancel_notice: parsed(lookup, "SLOTKEEPER_CANCEL_NOTICE_HOURS")
                .filter(|h: &i64| *h >= 0)
                .and_then(Duration::try_hours)
                .unwrap_or(defaults.cancel_notice),
            stale_retries: parsed(lookup, "SLOTKEEPER_STALE_RETRIES")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.stale_retries),
            event_log: lookup("SLOTKEEPER_EVENT_LOG")
                .and_then(|s| parse_bool(&s))
                .unwrap_or(defaults.event_log),
        }
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(from_pairs(&[]), Config::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = from_pairs(&[
            ("SLOTKEEPER_DATA_DIR", "/var/lib/slotkeeper"),
            ("SLOTKEEPER_METRICS_PORT", "9090"),
            ("SLOTKEEPER_COMPACT_THRESHOLD", "50"),
            ("SLOTKEEPER_CANCEL_NOTICE_HOURS", "48"),
            ("SLOTKEEPER_STALE_RETRIES", "5"),
            ("SLOTKEEPER_EVENT_LOG", "off"),
        ]);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/slotkeeper"));
        assert_eq!(config.metrics_port, Some(9090));
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.cancel_notice, Duration::hours(48));
        assert_eq!(config.stale_retries, 5);
        assert!(!config.event_log);
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let config = from_pairs(&[
            ("SLOTKEEPER_METRICS_PORT", "not-a-port"),
            ("SLOTKEEPER_COMPACT_THRESHOLD", "-1"),
            ("SLOTKEEPER_CANCEL_NOTICE_HOURS", "-3"),
            ("SLOTKEEPER_STALE_RETRIES", "0"),
            ("SLOTKEEPER_EVENT_LOG", "maybe"),
        ]);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn zero_notice_is_allowed() {
        let config = from_pairs(&[("SLOTKEEPER_CANCEL_NOTICE_HOURS", "0")]);
        assert_eq!(config.cancel_notice, Duration::zero());
    }
}
