use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::types::TensorLayout;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    pub name: String,
    pub filename: String,
    pub url: Option<String>,
    pub sha256: Option<String>,
    /// Upscale factor. `None` when unknown (discovered models).
    pub scale: Option<u32>,
    /// Fixed spatial input size, if the model was exported with one.
    pub tile_size: Option<u32>,
    /// Tensor memory order the model was exported with. `None` when unknown
    /// (discovered models), leaving the configured layout in effect.
    #[serde(default)]
    pub layout: Option<TensorLayout>,
    /// Value range the model expects/produces: `(0.0, 255.0)` for ESRGAN, `(0.0, 1.0)` for Compact.
    pub normalization_range: (f32, f32),
    pub is_fp16: bool,
    pub description: String,
}

fn builtin_catalog() -> Vec<ModelEntry> {
    vec![
        ModelEntry {
            name: "RealESRGAN_x4plus_anime_6B".into(),
            filename: "RealESRGAN_x4plus_anime_6B.onnx".into(),
            url: Some("https://huggingface.co/deepghs/imgutils-models/resolve/main/onnx/realesrgan/RealESRGAN_x4plus_anime_6B.onnx".into()),
            sha256: None,
            scale: Some(4),
            tile_size: None,
            layout: Some(TensorLayout::Planar),
            normalization_range: (0.0, 255.0),
            is_fp16: false,
            description: "RealESRGAN x4 anime-optimized model (6-block variant, 17.9 MB)".into(),
        },
        ModelEntry {
            name: "AnimeJaNai_V3_L1_Sharp_HD_x2_FP16".into(),
            filename: "the_database_AnimeJaNaiV3L1_sharp_HD_x2_fp16_op17.onnx".into(),
            url: None,
            sha256: None,
            scale: Some(2),
            tile_size: None,
            layout: Some(TensorLayout::Planar),
            normalization_range: (0.0, 1.0),
            is_fp16: true,
            description: "AnimeJaNai V3 L1 Sharp HD 2x FP16, Compact architecture".into(),
        },
    ]
}

/// Where a model location string points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLocation {
    /// Name of a catalog entry.
    Catalog(String),
    Url(String),
    File(PathBuf),
}

impl ModelLocation {
    pub fn parse(location: &str, catalog: &ModelCatalog) -> Self {
        let trimmed = location.trim();
        if catalog.get(trimmed).is_some() {
            Self::Catalog(trimmed.to_string())
        } else if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Self::Url(trimmed.to_string())
        } else {
            Self::File(PathBuf::from(trimmed))
        }
    }
}

/// File in the models directory holding extra catalog entries.
pub const CATALOG_FILE_NAME: &str = "catalog.json";

pub struct ModelCatalog {
    models_dir: PathBuf,
    entries: Vec<ModelEntry>,
}

impl ModelCatalog {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: Vec::new(),
        }
    }

    pub fn with_builtin_models(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: builtin_catalog(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Add every `*.onnx` file in the models directory that is not catalogued yet.
    pub fn discover(&mut self) -> Result<()> {
        let dir = &self.models_dir;
        if !dir.exists() {
            return Ok(());
        }

        let read_dir = fs::read_dir(dir)
            .with_context(|| format!("Failed to read models directory: {}", dir.display()))?;

        for entry in read_dir {
            let entry = entry?;
            let path = entry.path();

            let is_onnx = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("onnx"))
                .unwrap_or(false);
            if !is_onnx {
                continue;
            }

            let filename = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };

            if self.entries.iter().any(|e| e.filename == filename) {
                continue;
            }

            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(&filename)
                .to_string();

            info!(filename = %filename, "Discovered unknown ONNX model");

            let lower = filename.to_lowercase();
            self.entries.push(ModelEntry {
                name,
                scale: scale_from_filename(&lower),
                is_fp16: lower.contains("fp16"),
                filename,
                url: None,
                sha256: None,
                tile_size: None,
                layout: None,
                normalization_range: (0.0, 1.0),
                description: "Discovered model (metadata unknown)".into(),
            });
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.entries
    }

    /// Entry whose file is `path`, if any.
    pub fn find_by_path(&self, path: &Path) -> Option<&ModelEntry> {
        let filename = path.file_name()?.to_str()?;
        self.entries.iter().find(|e| e.filename == filename)
    }

    pub fn is_downloaded(&self, name: &str) -> bool {
        self.get(name)
            .map(|e| self.models_dir.join(&e.filename).is_file())
            .unwrap_or(false)
    }

    pub fn model_path(&self, name: &str) -> Option<PathBuf> {
        self.get(name).map(|e| self.models_dir.join(&e.filename))
    }

    /// Map a catalog name, URL or filesystem path to a local model file.
    ///
    /// Catalog models are downloaded on first use. URLs are downloaded into
    /// the models directory under their last path segment.
    pub fn resolve_location(&self, location: &str) -> Result<PathBuf> {
        match ModelLocation::parse(location, self) {
            ModelLocation::Catalog(name) => {
                if self.is_downloaded(&name) {
                    self.model_path(&name)
                        .with_context(|| format!("Unknown model: {name}"))
                } else {
                    self.download(&name)
                }
            }
            ModelLocation::Url(url) => {
                let filename = filename_from_url(&url)
                    .with_context(|| format!("Cannot derive a file name from URL: {url}"))?;
                let path = self.models_dir.join(&filename);
                if path.is_file() {
                    return Ok(path);
                }
                self.fetch(&url, &filename, None, &filename)
            }
            ModelLocation::File(path) => {
                let candidates = [path.clone(), self.models_dir.join(&path)];
                candidates
                    .into_iter()
                    .find(|p| p.is_file())
                    .with_context(|| format!("Model file not found: {}", path.display()))
            }
        }
    }

    pub fn download(&self, name: &str) -> Result<PathBuf> {
        let entry = self
            .get(name)
            .with_context(|| format!("Unknown model: {name}"))?;

        let url = entry
            .url
            .as_deref()
            .with_context(|| format!("No download URL for model: {name}"))?;

        self.fetch(url, &entry.filename, entry.sha256.as_deref(), name)
    }

    fn fetch(
        &self,
        url: &str,
        filename: &str,
        expected_hash: Option<&str>,
        name: &str,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.models_dir).with_context(|| {
            format!(
                "Failed to create models directory: {}",
                self.models_dir.display()
            )
        })?;

        let final_path = self.models_dir.join(filename);
        let tmp_path = self.models_dir.join(format!("{filename}.part"));

        info!(model = %name, url = %url, "Downloading model");

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30 * 60))
            .build()
            .context("Failed to build HTTP client for model download")?;

        let mut response = client
            .get(url)
            .send()
            .with_context(|| format!("Failed to start download for model {name}"))?;

        if !response.status().is_success() {
            bail!(
                "Download request for model {name} returned HTTP {}",
                response.status().as_u16()
            );
        }

        let mut tmp_file = fs::File::create(&tmp_path)
            .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;

        let written = response
            .copy_to(&mut tmp_file)
            .with_context(|| format!("Failed while downloading model {name} from {url}"))
            .and_then(|_| {
                tmp_file
                    .sync_all()
                    .with_context(|| format!("Failed to flush temp file: {}", tmp_path.display()))
            });
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if let Some(expected_hash) = expected_hash {
            info!(model = %name, "Verifying SHA256 hash");
            let actual_hash = sha256_file(&tmp_path)?;
            if !actual_hash.eq_ignore_ascii_case(expected_hash) {
                let _ = fs::remove_file(&tmp_path);
                bail!("SHA256 mismatch for {name}: expected {expected_hash}, got {actual_hash}");
            }
            info!(model = %name, "Hash verified OK");
        } else {
            warn!(model = %name, "No SHA256 hash configured, skipping verification");
        }

        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "Failed to move {} → {}",
                tmp_path.display(),
                final_path.display()
            )
        })?;

        info!(model = %name, path = %final_path.display(), "Download complete");
        Ok(final_path)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries).context("Failed to serialize model catalog")
    }

    /// Merge entries from JSON; names already present are kept as-is.
    pub fn load_json(&mut self, json: &str) -> Result<()> {
        let loaded: Vec<ModelEntry> =
            serde_json::from_str(json).context("Failed to parse model catalog JSON")?;
        for entry in loaded {
            if !self.entries.iter().any(|e| e.name == entry.name) {
                self.entries.push(entry);
            }
        }
        Ok(())
    }

    /// Merge `<models_dir>/catalog.json` when present. Returns whether a file was read.
    pub fn load_catalog_file(&mut self) -> Result<bool> {
        let path = self.models_dir.join(CATALOG_FILE_NAME);
        if !path.is_file() {
            return Ok(false);
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        self.load_json(&json)
            .with_context(|| format!("Invalid catalog file {}", path.display()))?;
        info!(path = %path.display(), "Loaded model catalog file");
        Ok(true)
    }
}

/// `x2`, `x4`, `2x`... anywhere in the name.
fn scale_from_filename(lower: &str) -> Option<u32> {
    lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .find_map(|part| {
            let digits = part
                .strip_prefix('x')
                .or_else(|| part.strip_suffix('x'))?;
            match digits.parse::<u32>() {
                Ok(scale @ 1..=8) => Some(scale),
                _ => None,
            }
        })
}

fn filename_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let last = path.rsplit('/').next()?;
    if last.is_empty() || !last.contains('.') {
        return None;
    }
    Some(last.to_string())
}

pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    let hash = hasher.finalize();
    Ok(format!("{hash:x}"))
}
