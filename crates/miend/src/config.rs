use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "/etc/mien/miend.toml";

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

impl BusKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "system" => Some(BusKind::System),
            "session" => Some(BusKind::Session),
            _ => None,
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite enrollment database.
    pub db_path: PathBuf,
    /// Descriptor length produced by the embedding provider.
    pub dimension: usize,
    /// Maximum Euclidean distance for a positive match.
    pub match_threshold: f32,
    /// Embedding program: reads an image on stdin, prints descriptors as JSON.
    pub extractor_command: PathBuf,
    pub extractor_args: Vec<String>,
    /// Upper bound in seconds on waiting for the embedding program.
    pub extract_timeout_secs: u64,
    pub bus: BusKind,
}

/// Optional settings from the TOML file. Anything unset falls back to defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    dimension: Option<usize>,
    match_threshold: Option<f32>,
    extractor_command: Option<PathBuf>,
    extractor_args: Option<Vec<String>>,
    extract_timeout_secs: Option<u64>,
    bus: Option<BusKind>,
}

impl Config {
    /// Load `MIEN_CONFIG` (default `/etc/mien/miend.toml`, may be absent),
    /// then apply `MIEN_*` environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("MIEN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let file = read_file_config(&path)?;
        let mut config = Self::from_file_config(file);
        config.apply_env();
        Ok(config)
    }

    fn from_file_config(file: FileConfig) -> Self {
        Self {
            db_path: file.db_path.unwrap_or_else(default_db_path),
            dimension: file.dimension.unwrap_or(mien_core::DEFAULT_DIMENSION),
            match_threshold: file
                .match_threshold
                .unwrap_or(mien_core::DEFAULT_MATCH_THRESHOLD),
            extractor_command: file
                .extractor_command
                .unwrap_or_else(|| PathBuf::from("mien-extract")),
            extractor_args: file.extractor_args.unwrap_or_default(),
            extract_timeout_secs: file.extract_timeout_secs.unwrap_or(10),
            bus: file.bus.unwrap_or(BusKind::System),
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MIEN_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        self.dimension = env_parse("MIEN_DIMENSION", self.dimension);
        self.match_threshold = env_parse("MIEN_MATCH_THRESHOLD", self.match_threshold);
        if let Ok(v) = std::env::var("MIEN_EXTRACTOR_COMMAND") {
            self.extractor_command = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MIEN_EXTRACTOR_ARGS") {
            self.extractor_args = v.split_whitespace().map(str::to_string).collect();
        }
        self.extract_timeout_secs = env_parse("MIEN_EXTRACT_TIMEOUT_SECS", self.extract_timeout_secs);
        if let Some(bus) = std::env::var("MIEN_BUS").ok().and_then(|v| BusKind::parse(&v)) {
            self.bus = bus;
        }
    }
}

fn read_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let file = parse_file_config(&text)
                .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
            tracing::info!(path = %path.display(), "loaded config file");
            Ok(file)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            Ok(FileConfig::default())
        }
        Err(e) => Err(anyhow::anyhow!("cannot read config {}: {e}", path.display())),
    }
}

fn parse_file_config(text: &str) -> Result<FileConfig, toml::de::Error> {
    toml::from_str(text)
}

fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("mien")
        .join("enrollments.db")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::from_file_config(FileConfig::default());
        assert_eq!(config.dimension, 128);
        assert!((config.match_threshold - 0.6).abs() < 1e-6);
        assert_eq!(config.extract_timeout_secs, 10);
        assert_eq!(config.bus, BusKind::System);
        assert!(config.db_path.ends_with("mien/enrollments.db"));
    }

    #[test]
    fn test_file_values_override_defaults() {
        let file = parse_file_config(
            r#"
            db_path = "/var/lib/mien/faces.db"
            dimension = 512
            match_threshold = 0.45
            extractor_command = "/usr/libexec/mien/embed"
            extractor_args = ["--model", "small"]
            bus = "session"
            "#,
        )
        .unwrap();
        let config = Config::from_file_config(file);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/mien/faces.db"));
        assert_eq!(config.dimension, 512);
        assert!((config.match_threshold - 0.45).abs() < 1e-6);
        assert_eq!(config.extractor_args, ["--model", "small"]);
        assert_eq!(config.bus, BusKind::Session);
        assert_eq!(config.extract_timeout_secs, 10);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(parse_file_config("threshhold = 0.5").is_err());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let file = read_file_config(&dir.path().join("absent.toml")).unwrap();
        assert!(file.dimension.is_none());
    }

    #[test]
    fn test_bus_kind_parse() {
        assert_eq!(BusKind::parse("Session"), Some(BusKind::Session));
        assert_eq!(BusKind::parse("system"), Some(BusKind::System));
        assert_eq!(BusKind::parse("tcp"), None);
    }
}
