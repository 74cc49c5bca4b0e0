use serde::{Deserialize, Serialize};

use crate::config::ProcessingConfig;

/// The `inputPayload` of a `geotiff_to_png` job.
///
/// Every field is optional; absent fields fall back to the worker's
/// [`ProcessingConfig`]. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    pub max_size: Option<u32>,
    pub generate_thumbnails: Option<bool>,
    pub thumbnail_size: Option<u32>,
    pub include_statistics: Option<bool>,
    pub preserve_transparency: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionsError {
    #[error("input payload is not a valid options object: {0}")]
    Malformed(String),

    #[error("maxSize must be greater than zero")]
    ZeroMaxSize,

    #[error("thumbnailSize must be greater than zero")]
    ZeroThumbnailSize,
}

impl JobOptions {
    /// Parse a raw payload. `null` means "use the defaults".
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, OptionsError> {
        if payload.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(payload.clone()).map_err(|e| OptionsError::Malformed(e.to_string()))
    }

    /// Validate and merge over the worker defaults.
    pub fn resolve(&self, defaults: &ProcessingConfig) -> Result<PipelineOptions, OptionsError> {
        if self.max_size == Some(0) {
            return Err(OptionsError::ZeroMaxSize);
        }
        if self.thumbnail_size == Some(0) {
            return Err(OptionsError::ZeroThumbnailSize);
        }

        let thumbnails = self
            .generate_thumbnails
            .unwrap_or(defaults.generate_thumbnails);
        let thumbnail_size = self.thumbnail_size.unwrap_or(defaults.thumbnail_size);

        Ok(PipelineOptions {
            max_size: Some(self.max_size.unwrap_or(defaults.max_image_size)),
            thumbnail_size: thumbnails.then_some(thumbnail_size),
            include_statistics: self
                .include_statistics
                .unwrap_or(defaults.include_statistics),
            preserve_transparency: self
                .preserve_transparency
                .unwrap_or(defaults.preserve_transparency),
            reproject_bounds: defaults.reproject_bounds,
            compression_quality: defaults.compression_quality,
        })
    }
}

/// Fully resolved settings for one job's pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Longest side of the converted image; `None` keeps the source size
    pub max_size: Option<u32>,
    /// Thumbnail box size; `None` disables the thumbnail stage
    pub thumbnail_size: Option<u32>,
    pub include_statistics: bool,
    pub preserve_transparency: bool,
    pub reproject_bounds: bool,
    pub compression_quality: u8,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        let defaults = ProcessingConfig::default();
        Self {
            max_size: Some(defaults.max_image_size),
            thumbnail_size: defaults
                .generate_thumbnails
                .then_some(defaults.thumbnail_size),
            include_statistics: defaults.include_statistics,
            preserve_transparency: defaults.preserve_transparency,
            reproject_bounds: defaults.reproject_bounds,
            compression_quality: defaults.compression_quality,
        }
    }
}
