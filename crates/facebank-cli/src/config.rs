use anyhow::{Context, Result};
use facebank_core::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI configuration: optional TOML file, then `FACEBANK_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding `embeddings.json` and `images/`.
    pub data_dir: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Minimum detector confidence to accept a face.
    pub detection_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            data_dir: default_data_dir(),
            similarity_threshold: engine.similarity_threshold,
            detection_threshold: engine.detection_threshold,
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = get("FACEBANK_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_f32(&get, "FACEBANK_SIMILARITY_THRESHOLD") {
            self.similarity_threshold = v;
        }
        if let Some(v) = parse_f32(&get, "FACEBANK_DETECTION_THRESHOLD") {
            self.detection_threshold = v;
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            similarity_threshold: self.similarity_threshold,
            detection_threshold: self.detection_threshold,
        }
    }
}

fn parse_f32(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<f32> {
    let raw = get(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable override");
            None
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facebank")
}
