use std::env;
use std::path::PathBuf;

use tracing::warn;

/// Server settings, read from `SLOTLINE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotline".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let password = lookup("SLOTLINE_PASSWORD").unwrap_or_else(|| {
            warn!("SLOTLINE_PASSWORD not set, using the default password");
            defaults.password.clone()
        });

        Self {
            port: parse_or("SLOTLINE_PORT", lookup("SLOTLINE_PORT"), defaults.port),
            bind: lookup("SLOTLINE_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("SLOTLINE_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password,
            max_connections: parse_or(
                "SLOTLINE_MAX_CONNECTIONS",
                lookup("SLOTLINE_MAX_CONNECTIONS"),
                defaults.max_connections,
            ),
            compact_threshold: parse_or(
                "SLOTLINE_COMPACT_THRESHOLD",
                lookup("SLOTLINE_COMPACT_THRESHOLD"),
                defaults.compact_threshold,
            ),
            metrics_port: lookup("SLOTLINE_METRICS_PORT").and_then(|s| match s.parse() {
                Ok(p) => Some(p),
                Err(_) => {
                    warn!("SLOTLINE_METRICS_PORT={s:?} is not a port, metrics disabled");
                    None
                }
            }),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotline.wal")
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(s) => s.parse().unwrap_or_else(|_| {
            warn!("{key}={s:?} is not valid, using the default");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.wal_path(), PathBuf::from("./data/slotline.wal"));
    }

    #[test]
    fn reads_every_variable() {
        let config = Config::from_lookup(lookup(&[
            ("SLOTLINE_PORT", "6000"),
            ("SLOTLINE_BIND", "127.0.0.1"),
            ("SLOTLINE_DATA_DIR", "/var/lib/slotline"),
            ("SLOTLINE_PASSWORD", "hunter2"),
            ("SLOTLINE_MAX_CONNECTIONS", "8"),
            ("SLOTLINE_COMPACT_THRESHOLD", "50"),
            ("SLOTLINE_METRICS_PORT", "9100"),
        ]));
        assert_eq!(config.listen_addr(), "127.0.0.1:6000");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/slotline"));
        assert_eq!(config.password, "hunter2");
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn bad_numbers_fall_back() {
        let config = Config::from_lookup(lookup(&[
            ("SLOTLINE_PORT", "http"),
            ("SLOTLINE_MAX_CONNECTIONS", "-1"),
            ("SLOTLINE_METRICS_PORT", "99999"),
        ]));
        assert_eq!(config.port, 5433);
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.metrics_port, None);
    }
}
