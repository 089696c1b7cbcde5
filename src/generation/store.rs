// Image persistence

use super::metadata::GenerationMetadata;
use super::types::GenerationParams;
use crate::{Error, Result};
use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Longest side of a saved thumbnail
pub const THUMBNAIL_SIZE: u32 = 150;

/// Where a generated image ended up, plus its metadata string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedImage {
    pub image_path: PathBuf,
    pub thumbnail_path: PathBuf,
    pub metadata: String,
}

/// Persists generated images
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn save(
        &self,
        image: &RgbImage,
        params: &GenerationParams,
        seed: u64,
        model_name: &str,
    ) -> Result<SavedImage>;
}

/// Writes PNGs, thumbnails and `.txt` metadata sidecars into one directory
#[derive(Debug, Clone)]
pub struct DiskImageStore {
    output_dir: PathBuf,
}

impl DiskImageStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl ImageStore for DiskImageStore {
    async fn save(
        &self,
        image: &RgbImage,
        params: &GenerationParams,
        seed: u64,
        model_name: &str,
    ) -> Result<SavedImage> {
        let metadata = GenerationMetadata::build(params, seed, model_name).to_string();
        let output_dir = self.output_dir.clone();
        let image = image.clone();

        tokio::task::spawn_blocking(move || write_image(&output_dir, image, seed, metadata))
            .await
            .map_err(|e| Error::Persistence(format!("save task failed: {}", e)))?
    }
}

fn write_image(output_dir: &Path, image: RgbImage, seed: u64, metadata: String) -> Result<SavedImage> {
    std::fs::create_dir_all(output_dir)?;

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let stem = unique_stem(output_dir, &format!("generated_{}_{}", timestamp, seed));
    let file_name = format!("{}.png", stem);

    let image_path = output_dir.join(&file_name);
    image
        .save(&image_path)
        .map_err(|e| Error::Persistence(format!("{}: {}", image_path.display(), e)))?;

    let thumbnail_path = output_dir.join(format!("thumb_{}", file_name));
    thumbnail(&image)
        .save(&thumbnail_path)
        .map_err(|e| Error::Persistence(format!("{}: {}", thumbnail_path.display(), e)))?;

    std::fs::write(output_dir.join(format!("{}.txt", stem)), &metadata)?;

    tracing::info!("Saved image to {}", image_path.display());

    Ok(SavedImage {
        image_path,
        thumbnail_path,
        metadata,
    })
}

// Batches share timestamp and seed, so later images get a counter
fn unique_stem(output_dir: &Path, base: &str) -> String {
    let mut stem = base.to_string();
    let mut counter = 1;
    while output_dir.join(format!("{}.png", stem)).exists() {
        stem = format!("{}_{}", base, counter);
        counter += 1;
    }
    stem
}

/// Aspect-preserving thumbnail; images already small enough are kept as is
pub fn thumbnail(image: &RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    if width <= THUMBNAIL_SIZE && height <= THUMBNAIL_SIZE {
        return image.clone();
    }
    DynamicImage::ImageRgb8(image.clone())
        .resize(THUMBNAIL_SIZE, THUMBNAIL_SIZE, FilterType::Lanczos3)
        .to_rgb8()
}
