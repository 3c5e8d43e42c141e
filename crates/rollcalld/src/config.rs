use rollcall_core::{DEFAULT_DESCRIPTOR_DIM, DEFAULT_MATCH_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which D-Bus bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

impl BusKind {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "system" => Some(BusKind::System),
            "session" => Some(BusKind::Session),
            _ => None,
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance a probe must stay strictly below to match.
    pub match_threshold: f32,
    /// Required descriptor length at enrollment.
    pub descriptor_dim: usize,
    /// Upper bound on any single engine request.
    pub request_timeout_secs: u64,
    pub bus: BusKind,
    /// Buffered events per in-process observer before it starts lagging.
    pub event_capacity: usize,
}

/// Optional TOML overlay named by `ROLLCALL_CONFIG`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    match_threshold: Option<f32>,
    descriptor_dim: Option<usize>,
    request_timeout_secs: Option<u64>,
    bus: Option<BusKind>,
    event_capacity: Option<usize>,
}

impl Config {
    /// Load configuration: `ROLLCALL_*` environment variables, then the TOML
    /// file named by `ROLLCALL_CONFIG`, then defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => FileConfig::load(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = env("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("attendance.db"));

        Self {
            db_path,
            match_threshold: parsed(&env, "ROLLCALL_MATCH_THRESHOLD")
                .filter(valid_threshold)
                .or(file.match_threshold.filter(valid_threshold))
                .unwrap_or(DEFAULT_MATCH_THRESHOLD),
            descriptor_dim: parsed(&env, "ROLLCALL_DESCRIPTOR_DIM")
                .filter(positive)
                .or(file.descriptor_dim.filter(positive))
                .unwrap_or(DEFAULT_DESCRIPTOR_DIM),
            request_timeout_secs: parsed(&env, "ROLLCALL_REQUEST_TIMEOUT_SECS")
                .filter(positive)
                .or(file.request_timeout_secs.filter(positive))
                .unwrap_or(10),
            bus: env("ROLLCALL_BUS")
                .and_then(|v| BusKind::parse(&v))
                .or(file.bus)
                .unwrap_or(BusKind::System),
            event_capacity: parsed(&env, "ROLLCALL_EVENT_CAPACITY")
                .or(file.event_capacity)
                .unwrap_or(64),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl FileConfig {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        toml::from_str(&text).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))
    }
}

/// NaN or a non-positive threshold would disable matching.
fn valid_threshold(threshold: &f32) -> bool {
    threshold.is_finite() && *threshold > 0.0
}

fn positive<T: Default + PartialOrd>(value: &T) -> bool {
    *value > T::default()
}

fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(FileConfig::default(), env_of(&[("HOME", "/home/ada")]));
        assert_eq!(
            config.db_path,
            PathBuf::from("/home/ada/.local/share/rollcall/attendance.db")
        );
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.descriptor_dim, 128);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.bus, BusKind::System);
        assert_eq!(config.event_capacity, 64);
    }

    #[test]
    fn test_xdg_data_home() {
        let config = Config::resolve(FileConfig::default(), env_of(&[("XDG_DATA_HOME", "/data")]));
        assert_eq!(config.db_path, PathBuf::from("/data/rollcall/attendance.db"));
    }

    #[test]
    fn test_env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            match_threshold = 0.5
            descriptor_dim = 512
            bus = "session"
            "#,
        )
        .unwrap();
        let config = Config::resolve(
            file,
            env_of(&[("ROLLCALL_MATCH_THRESHOLD", "0.45"), ("ROLLCALL_DB_PATH", "/var/lib/rc.db")]),
        );
        assert_eq!(config.match_threshold, 0.45);
        assert_eq!(config.descriptor_dim, 512);
        assert_eq!(config.bus, BusKind::Session);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rc.db"));
    }

    #[test]
    fn test_unparseable_env_falls_through() {
        let file = FileConfig {
            request_timeout_secs: Some(3),
            ..Default::default()
        };
        let config = Config::resolve(
            file,
            env_of(&[
                ("ROLLCALL_REQUEST_TIMEOUT_SECS", "soon"),
                ("ROLLCALL_BUS", "carrier-pigeon"),
            ]),
        );
        assert_eq!(config.request_timeout_secs, 3);
        assert_eq!(config.bus, BusKind::System);
    }

    #[test]
    fn test_degenerate_values_fall_through() {
        let file = FileConfig {
            match_threshold: Some(0.5),
            descriptor_dim: Some(0),
            ..Default::default()
        };
        let config = Config::resolve(
            file,
            env_of(&[
                ("ROLLCALL_MATCH_THRESHOLD", "nan"),
                ("ROLLCALL_DESCRIPTOR_DIM", "0"),
                ("ROLLCALL_REQUEST_TIMEOUT_SECS", "0"),
            ]),
        );
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.descriptor_dim, 128);
        assert_eq!(config.request_timeout_secs, 10);

        for bad in ["inf", "-0.3", "0"] {
            let config = Config::resolve(
                FileConfig::default(),
                env_of(&[("ROLLCALL_MATCH_THRESHOLD", bad)]),
            );
            assert_eq!(config.match_threshold, 0.6, "threshold {bad}");
        }
    }

    #[test]
    fn test_file_rejects_unknown_keys() {
        assert!(toml::from_str::<FileConfig>("treshold = 0.5").is_err());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "event_capacity = 8\n").unwrap();
        let file = FileConfig::load(&path).unwrap();
        assert_eq!(file.event_capacity, Some(8));
        assert!(FileConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
