use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;
use crate::dispatch::TileSpec;
use crate::error::UpscaleError;
use crate::tiling::validate_tile_geometry;
use crate::types::TensorLayout;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TILESR_DATA_DIR";

pub const DEFAULT_TILE_SIZE: u32 = 64;
pub const DEFAULT_OVERLAP_PX: u32 = 16;
pub const DEFAULT_UPSCALE_FACTOR: u32 = 4;
pub const DEFAULT_MODEL: &str = "RealESRGAN_x4plus_anime_6B";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub upscale: UpscaleConfig,
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

/// Tiling and model settings for one upscale run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpscaleConfig {
    /// Model input width; every tile is exactly this wide.
    pub tile_width: u32,
    /// Model input height; every tile is exactly this tall.
    pub tile_height: u32,
    /// Pixels shared between neighbouring tiles.
    pub overlap_px: u32,
    pub upscale_factor: u32,
    /// Catalog name, URL or filesystem path of the model.
    pub model_path: String,
    pub layout: TensorLayout,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: InferenceBackend,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            tile_width: DEFAULT_TILE_SIZE,
            tile_height: DEFAULT_TILE_SIZE,
            overlap_px: DEFAULT_OVERLAP_PX,
            upscale_factor: DEFAULT_UPSCALE_FACTOR,
            model_path: DEFAULT_MODEL.to_string(),
            layout: TensorLayout::Planar,
        }
    }
}

impl UpscaleConfig {
    /// Fail fast on geometry the pipeline cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_tile_geometry(self.tile_width, self.tile_height, self.overlap_px)?;
        if self.upscale_factor == 0 {
            return Err(UpscaleError::invalid(
                "upscale_factor",
                "upscale factor must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn tile_spec(&self) -> TileSpec {
        TileSpec {
            tile_width: self.tile_width,
            tile_height: self.tile_height,
            upscale_factor: self.upscale_factor,
            layout: self.layout,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TILESR_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml if either is missing.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.models_dir, PathBuf::from("models"));
        assert_eq!(cfg.paths.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.upscale.tile_width, 64);
        assert_eq!(cfg.upscale.tile_height, 64);
        assert_eq!(cfg.upscale.overlap_px, 16);
        assert_eq!(cfg.upscale.upscale_factor, 4);
        assert_eq!(cfg.upscale.model_path, DEFAULT_MODEL);
        assert_eq!(cfg.upscale.layout, TensorLayout::Planar);
        assert_eq!(cfg.inference.backend, InferenceBackend::Cuda);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.upscale.layout = TensorLayout::Interleaved;
        original.upscale.overlap_px = 8;
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let raw = "[upscale]\ntile_width = 128\nlayout = \"interleaved\"\n\n[inference]\nbackend = \"cpu\"\n";
        let cfg: AppConfig = toml::from_str(raw).expect("parse partial config");
        assert_eq!(cfg.upscale.tile_width, 128);
        assert_eq!(cfg.upscale.tile_height, 64);
        assert_eq!(cfg.upscale.layout, TensorLayout::Interleaved);
        assert_eq!(cfg.inference.backend, InferenceBackend::Cpu);
        assert_eq!(cfg.paths, PathsConfig::default());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let loaded = AppConfig::load_from_path(&dir.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_rejects_malformed_toml() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[upscale\ntile_width = ").expect("write config");
        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config TOML"));
    }

    #[test]
    fn validate_rejects_overlap_not_below_tile() {
        let cfg = UpscaleConfig {
            tile_width: 32,
            overlap_px: 32,
            ..UpscaleConfig::default()
        };
        assert_eq!(cfg.validate().unwrap_err().kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn validate_rejects_zero_factor() {
        let cfg = UpscaleConfig {
            upscale_factor: 0,
            ..UpscaleConfig::default()
        };
        assert_eq!(cfg.validate().unwrap_err().kind(), ErrorKind::InvalidParameter);
        assert!(UpscaleConfig::default().validate().is_ok());
    }

    #[test]
    fn tile_spec_mirrors_config() {
        let tile_spec = UpscaleConfig::default().tile_spec();
        assert_eq!(tile_spec.expected_output_shape(), [1, 3, 256, 256]);
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().expect("temp dir");
        let dir = temp.path().join("nested");
        initialize_data_dir(&dir).expect("initialize data dir");

        assert!(dir.exists());
        let loaded = AppConfig::load_from_path(&dir.join("config.toml")).expect("load");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("temp dir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[upscale]\noverlap_px = 4\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_joins_relative_path() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
    }
}
