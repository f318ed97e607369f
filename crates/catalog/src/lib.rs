//! Catalog of known speech-recognition models.
//!
//! Maps logical model names to their remote repository ids and estimated
//! byte sizes, and answers whether a model's artifacts are present locally.

use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("unknown model: {0}")]
    UnknownModel(String),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WhisperModel {
    Tiny,
    TinyEn,
    Base,
    BaseEn,
    Small,
    SmallEn,
    Medium,
    MediumEn,
    LargeV1,
    LargeV2,
    LargeV3,
}

impl WhisperModel {
    /// All catalog entries, smallest first.
    pub fn all() -> &'static [WhisperModel] {
        use WhisperModel::*;
        &[
            Tiny, TinyEn, Base, BaseEn, Small, SmallEn, Medium, MediumEn, LargeV1, LargeV2,
            LargeV3,
        ]
    }

    /// Resolve a model name, honoring aliases (`large` is the latest large).
    pub fn parse(name: &str) -> Result<WhisperModel> {
        use WhisperModel::*;
        match name {
            "tiny" => Ok(Tiny),
            "tiny.en" => Ok(TinyEn),
            "base" => Ok(Base),
            "base.en" => Ok(BaseEn),
            "small" => Ok(Small),
            "small.en" => Ok(SmallEn),
            "medium" => Ok(Medium),
            "medium.en" => Ok(MediumEn),
            "large-v1" => Ok(LargeV1),
            "large-v2" => Ok(LargeV2),
            "large-v3" | "large" => Ok(LargeV3),
            _ => Err(CatalogError::UnknownModel(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Tiny => "tiny",
            Self::TinyEn => "tiny.en",
            Self::Base => "base",
            Self::BaseEn => "base.en",
            Self::Small => "small",
            Self::SmallEn => "small.en",
            Self::Medium => "medium",
            Self::MediumEn => "medium.en",
            Self::LargeV1 => "large-v1",
            Self::LargeV2 => "large-v2",
            Self::LargeV3 => "large-v3",
        }
    }

    pub fn repo_id(&self) -> &'static str {
        match self {
            Self::Tiny => "Systran/faster-whisper-tiny",
            Self::TinyEn => "Systran/faster-whisper-tiny.en",
            Self::Base => "Systran/faster-whisper-base",
            Self::BaseEn => "Systran/faster-whisper-base.en",
            Self::Small => "Systran/faster-whisper-small",
            Self::SmallEn => "Systran/faster-whisper-small.en",
            Self::Medium => "Systran/faster-whisper-medium",
            Self::MediumEn => "Systran/faster-whisper-medium.en",
            Self::LargeV1 => "Systran/faster-whisper-large-v1",
            Self::LargeV2 => "Systran/faster-whisper-large-v2",
            Self::LargeV3 => "Systran/faster-whisper-large-v3",
        }
    }

    /// Approximate on-disk size of the converted model artifacts.
    pub fn estimated_bytes(&self) -> u64 {
        match self {
            Self::Tiny | Self::TinyEn => 39_000_000,
            Self::Base | Self::BaseEn => 74_000_000,
            Self::Small | Self::SmallEn => 244_000_000,
            Self::Medium | Self::MediumEn => 769_000_000,
            Self::LargeV1 | Self::LargeV2 | Self::LargeV3 => 1_550_000_000,
        }
    }

    /// Directory that holds this model's artifacts under `models_dir`.
    pub fn local_dir(&self, models_dir: &Path) -> PathBuf {
        models_dir.join(self.name())
    }

    /// A model is downloaded iff its directory exists and is non-empty.
    pub fn is_downloaded(&self, models_dir: &Path) -> bool {
        dir_is_populated(&self.local_dir(models_dir))
    }

    pub fn entry(&self, models_dir: &Path) -> ModelEntry {
        let downloaded = self.is_downloaded(models_dir);
        ModelEntry {
            name: self.name().to_string(),
            estimated_bytes: self.estimated_bytes(),
            downloaded,
            local_path: downloaded.then(|| self.local_dir(models_dir)),
        }
    }
}

/// One catalog row joined with local availability.
#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub name: String,
    pub estimated_bytes: u64,
    pub downloaded: bool,
    pub local_path: Option<PathBuf>,
}

/// List every catalog model with its downloaded state.
pub fn list_models(models_dir: &Path) -> Vec<ModelEntry> {
    WhisperModel::all()
        .iter()
        .map(|m| m.entry(models_dir))
        .collect()
}

fn dir_is_populated(dir: &Path) -> bool {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}
