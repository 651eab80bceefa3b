// src/config.rs
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{camera::FacingMode, data_url::ImageMime};

pub const CONFIG_FILE: &str = "anime_cam.toml";
pub const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

pub const DEFAULT_PROMPT: &str = "Convert this photo of a person into a vibrant, high-quality anime character. \
The anime character should strongly resemble the person in the photo, capturing their key facial features, \
hair style, and expression. The final output should be only the image of the anime character with a simple, \
clean background. Do not add any text or borders.";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gemini: GeminiConfig,
    pub camera: CameraConfig,
    pub export: ExportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
    pub prompt: String,
    /// Never written to disk; filled from the environment.
    #[serde(skip)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub facing: FacingMode,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub capture_format: ImageMime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub file_name: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.5-flash-image".to_string(),
            timeout_secs: 120,
            prompt: DEFAULT_PROMPT.to_string(),
            api_key: None,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            facing: FacingMode::User,
            width: 1280,
            height: 720,
            fps: 30,
            capture_format: ImageMime::Jpeg,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            file_name: "anime-karakterim.png".to_string(),
        }
    }
}

impl Config {
    /// Reads `anime_cam.toml` from the working directory when present, then
    /// picks up the API key from the environment.
    pub fn load() -> Result<Self> {
        let config_path = PathBuf::from(CONFIG_FILE);

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            log::info!("No {} found, using defaults", CONFIG_FILE);
            Self::default()
        };

        config.gemini.api_key = api_key_from(|name| std::env::var(name).ok());
        if config.gemini.api_key.is_none() {
            log::warn!(
                "No API key set ({}). Conversions will fail until one is provided.",
                API_KEY_VARS.join(" or ")
            );
        }

        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self =
            toml::from_str(&contents).with_context(|| "Failed to parse configuration file")?;

        log::info!("Configuration loaded from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow::anyhow!("Invalid camera resolution"));
        }
        if self.camera.fps == 0 {
            return Err(anyhow::anyhow!("Invalid camera frame rate"));
        }
        if self.gemini.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Request timeout must be positive"));
        }
        if self.gemini.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Model name is empty"));
        }
        if self.export.file_name.trim().is_empty() {
            return Err(anyhow::anyhow!("Export file name is empty"));
        }
        Ok(())
    }
}

fn api_key_from(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    API_KEY_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .map(|key| key.trim().to_string())
        .find(|key| !key.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.export.file_name, "anime-karakterim.png");
        assert_eq!(config.gemini.model, "gemini-2.5-flash-image");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "[camera]\nfacing = \"environment\"\ncapture_format = \"png\"\n\n[gemini]\ntimeout_secs = 30\n",
        )
        .unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.camera.facing, FacingMode::Environment);
        assert_eq!(config.camera.capture_format, ImageMime::Png);
        assert_eq!(config.camera.width, 1280);
        assert_eq!(config.gemini.timeout_secs, 30);
        assert_eq!(config.gemini.prompt, DEFAULT_PROMPT);
        assert!(config.gemini.api_key.is_none());
    }

    #[test]
    fn rejects_zero_resolution() {
        let mut config = Config::default();
        config.camera.width = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn api_key_prefers_gemini_var_and_skips_blank() {
        let key = api_key_from(|name| match name {
            "GEMINI_API_KEY" => Some("  ".to_string()),
            "API_KEY" => Some("fallback".to_string()),
            _ => None,
        });
        assert_eq!(key.as_deref(), Some("fallback"));

        let key = api_key_from(|name| Some(format!("{name}-value")));
        assert_eq!(key.as_deref(), Some("GEMINI_API_KEY-value"));

        assert_eq!(api_key_from(|_| None), None);
    }
}
