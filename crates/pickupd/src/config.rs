use pickup_core::{
    EnrollmentPolicy, Mode, DEFAULT_CHILD_CEILING, DEFAULT_DESCRIPTOR_LEN,
    DEFAULT_MATCH_THRESHOLD, DEFAULT_PHOTO_MAX_SIDE,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::engine::LoopTiming;
use crate::kiosk::KioskSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Which message bus the daemon serves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    Session,
    System,
}

impl FromStr for Bus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(Bus::Session),
            "system" => Ok(Bus::System),
            other => Err(format!("unknown bus '{other}'")),
        }
    }
}

/// Optional settings file. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    match_threshold: Option<f32>,
    child_ceiling: Option<usize>,
    descriptor_len: Option<usize>,
    hold_window_ms: Option<u64>,
    registration_poll_ms: Option<u64>,
    recognition_poll_ms: Option<u64>,
    photo_max_side: Option<u32>,
    bus: Option<Bus>,
    start_mode: Option<Mode>,
}

/// Daemon configuration: optional TOML file, then `PICKUP_*` overrides.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum Euclidean distance still counted as a match.
    pub match_threshold: f32,
    pub child_ceiling: usize,
    pub descriptor_len: usize,
    /// How long a detection is held through detector dropouts.
    pub hold_window: Duration,
    pub registration_poll: Duration,
    pub recognition_poll: Duration,
    /// Longest side of stored guardian thumbnails.
    pub photo_max_side: u32,
    pub bus: Bus,
    /// Mode entered once the D-Bus interface is up.
    pub start_mode: Mode,
}

impl Config {
    /// Load from the file named by `PICKUP_CONFIG` (if any) and the process
    /// environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("PICKUP_CONFIG") {
            Some(path) => read_file(Path::new(&path))?,
            None => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let db_path = env("PICKUP_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| default_data_dir(&env).join("pickup.db"));

        let config = Self {
            db_path,
            match_threshold: env_parse(&env, "PICKUP_MATCH_THRESHOLD")
                .or(file.match_threshold)
                .unwrap_or(DEFAULT_MATCH_THRESHOLD),
            child_ceiling: env_parse(&env, "PICKUP_CHILD_CEILING")
                .or(file.child_ceiling)
                .unwrap_or(DEFAULT_CHILD_CEILING),
            descriptor_len: env_parse(&env, "PICKUP_DESCRIPTOR_LEN")
                .or(file.descriptor_len)
                .unwrap_or(DEFAULT_DESCRIPTOR_LEN),
            hold_window: millis(
                env_parse(&env, "PICKUP_HOLD_WINDOW_MS")
                    .or(file.hold_window_ms)
                    .unwrap_or(3000),
            ),
            registration_poll: millis(
                env_parse(&env, "PICKUP_REGISTRATION_POLL_MS")
                    .or(file.registration_poll_ms)
                    .unwrap_or(350),
            ),
            recognition_poll: millis(
                env_parse(&env, "PICKUP_RECOGNITION_POLL_MS")
                    .or(file.recognition_poll_ms)
                    .unwrap_or(500),
            ),
            photo_max_side: env_parse(&env, "PICKUP_PHOTO_MAX_SIDE")
                .or(file.photo_max_side)
                .unwrap_or(DEFAULT_PHOTO_MAX_SIDE),
            bus: env_parse(&env, "PICKUP_BUS")
                .or(file.bus)
                .unwrap_or(Bus::Session),
            start_mode: env_parse(&env, "PICKUP_START_MODE")
                .or(file.start_mode)
                .unwrap_or(Mode::Registration),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.match_threshold.is_finite() || self.match_threshold <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "match_threshold",
                reason: format!("{} is not a positive distance", self.match_threshold),
            });
        }
        if self.descriptor_len == 0 {
            return Err(ConfigError::Invalid {
                key: "descriptor_len",
                reason: "must be at least 1".into(),
            });
        }
        if self.registration_poll.is_zero() || self.recognition_poll.is_zero() {
            return Err(ConfigError::Invalid {
                key: "poll interval",
                reason: "must be at least 1ms".into(),
            });
        }
        if self.photo_max_side == 0 {
            return Err(ConfigError::Invalid {
                key: "photo_max_side",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn kiosk_settings(&self) -> KioskSettings {
        KioskSettings {
            match_threshold: self.match_threshold,
            descriptor_len: self.descriptor_len,
            policy: EnrollmentPolicy::new(self.child_ceiling),
            photo_max_side: self.photo_max_side,
        }
    }

    pub fn loop_timing(&self) -> LoopTiming {
        LoopTiming {
            hold_window: self.hold_window,
            registration_poll: self.registration_poll,
            recognition_poll: self.recognition_poll,
        }
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file = toml::from_str(&text)?;
    tracing::debug!(path = %path.display(), "loaded config file");
    Ok(file)
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("pickup")
}

/// Parse an override. Unparseable values are ignored with a warning.
fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable override");
            None
        }
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
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
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(FileConfig::default(), env_of(&[("HOME", "/home/kiosk")])).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/home/kiosk/.local/share/pickup/pickup.db"));
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.child_ceiling, 1000);
        assert_eq!(config.descriptor_len, 128);
        assert_eq!(config.hold_window, Duration::from_millis(3000));
        assert_eq!(config.registration_poll, Duration::from_millis(350));
        assert_eq!(config.recognition_poll, Duration::from_millis(500));
        assert_eq!(config.bus, Bus::Session);
        assert_eq!(config.start_mode, Mode::Registration);
    }

    #[test]
    fn test_xdg_data_home() {
        let config = Config::resolve(FileConfig::default(), env_of(&[("XDG_DATA_HOME", "/data")])).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/data/pickup/pickup.db"));
    }

    #[test]
    fn test_env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            match_threshold = 0.5
            child_ceiling = 20
            bus = "system"
            start_mode = "recognition"
            "#,
        )
        .unwrap();
        let env = env_of(&[("PICKUP_CHILD_CEILING", "5"), ("PICKUP_DB_PATH", "/var/lib/pickup.db")]);
        let config = Config::resolve(file, env).unwrap();
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.child_ceiling, 5);
        assert_eq!(config.bus, Bus::System);
        assert_eq!(config.start_mode, Mode::Recognition);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/pickup.db"));
    }

    #[test]
    fn test_unparseable_override_falls_back() {
        let config = Config::resolve(
            FileConfig::default(),
            env_of(&[("PICKUP_HOLD_WINDOW_MS", "soon"), ("PICKUP_BUS", "satellite")]),
        )
        .unwrap();
        assert_eq!(config.hold_window, Duration::from_millis(3000));
        assert_eq!(config.bus, Bus::Session);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        assert!(toml::from_str::<FileConfig>("camera = \"/dev/video0\"").is_err());
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let err = Config::resolve(FileConfig::default(), env_of(&[("PICKUP_MATCH_THRESHOLD", "-1")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "match_threshold", .. }));
    }

    #[test]
    fn test_zero_hold_window_allowed() {
        let config = Config::resolve(FileConfig::default(), env_of(&[("PICKUP_HOLD_WINDOW_MS", "0")])).unwrap();
        assert!(config.hold_window.is_zero());
    }
}
