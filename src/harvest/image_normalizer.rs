//! Image normalization for the image harvester
//!
//! This module provides functionality for:
//! 1. Re-checking the minimum file size of a promoted download
//! 2. Flattening alpha and palette images onto a white background
//! 3. Shrinking into the target box while keeping the aspect ratio
//! 4. Re-encoding to the target format, replacing the original file

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, ImageReader, Rgb, RgbImage};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::harvest::logger::{LogEntryType, OperationStatus};
use crate::harvest::Configuration;

/// Error types for normalization
#[derive(Error, Debug)]
pub enum NormalizerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("File is below the minimum size ({size} bytes)")]
    TooSmall { size: u64 },

    #[error("Image has no pixels")]
    EmptyImage,

    #[error("Unsupported target format: {0}")]
    UnsupportedFormat(String),
}

/// Result type for normalization
pub type NormalizerResult<T> = Result<T, NormalizerError>;

/// A file that went through normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Encoder identifier for a target format: `jpg` maps to `JPEG`, anything else is uppercased.
pub fn encoder_name(target_format: &str) -> String {
    if target_format.eq_ignore_ascii_case("jpg") {
        "JPEG".to_string()
    } else {
        target_format.to_ascii_uppercase()
    }
}

pub fn image_format_for(target_format: &str) -> NormalizerResult<ImageFormat> {
    let name = encoder_name(target_format);
    ImageFormat::from_extension(name.to_ascii_lowercase())
        .ok_or(NormalizerError::UnsupportedFormat(name))
}

/// Largest size with the same aspect ratio that fits in `max_width` x `max_height`.
///
/// Never upscales, never returns a zero dimension.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    let ratio = (max_width as f64 / width as f64)
        .min(max_height as f64 / height as f64)
        .min(1.0);
    if ratio >= 1.0 {
        return (width, height);
    }

    // The epsilon absorbs float error on exact quotients such as 0.5 * 400
    let scale = |value: u32, bound: u32| -> u32 {
        ((value as f64 * ratio + 1e-9).floor() as u32).clamp(1, bound.max(1))
    };
    (scale(width, max_width), scale(height, max_height))
}

/// Where the re-encoded image goes.
///
/// Only a recognised image extension is replaced; otherwise the target
/// extension is appended, so `3.5mm jack_1` becomes `3.5mm jack_1.jpg`.
pub fn output_path_for(path: &Path, target_format: &str) -> PathBuf {
    let has_image_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ImageFormat::from_extension(ext).is_some());
    if has_image_extension {
        return path.with_extension(target_format);
    }

    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(target_format);
    PathBuf::from(name)
}

/// Composite alpha onto opaque white; images without alpha are converted to RGB.
pub fn flatten_onto_white(img: DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.into_rgb8();
    }

    let rgba = img.into_rgba8();
    let mut canvas = RgbImage::from_pixel(rgba.width(), rgba.height(), Rgb([255, 255, 255]));
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = pixel[3] as u32;
        let blend = |channel: u8| -> u8 {
            ((channel as u32 * alpha + 255 * (255 - alpha) + 127) / 255) as u8
        };
        canvas.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    canvas
}

/// Normalizer bound to one run's configuration.
pub struct ImageNormalizer {
    config: Arc<Configuration>,
}

impl ImageNormalizer {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self { config }
    }

    /// Normalize one promoted file in place.
    #[instrument(skip(self), fields(file = %path.display()))]
    pub fn normalize(&self, path: &Path) -> NormalizerResult<NormalizedImage> {
        let limits = &self.config.limits;

        let size = fs::metadata(path)?.len();
        if size < limits.min_file_size {
            info!(
                entry_type = %LogEntryType::Normalize,
                status = %OperationStatus::Skipped,
                "Removing undersized image {} ({:.1}KB < {:.1}KB)",
                path.display(),
                size as f64 / 1024.0,
                limits.min_file_size as f64 / 1024.0
            );
            fs::remove_file(path)?;
            return Err(NormalizerError::TooSmall { size });
        }

        let format = image_format_for(&limits.target_format)?;
        let decoded = ImageReader::open(path)?.with_guessed_format()?.decode()?;
        if decoded.width() == 0 || decoded.height() == 0 {
            return Err(NormalizerError::EmptyImage);
        }

        let flattened = flatten_onto_white(decoded);
        let (width, height) = fit_within(
            flattened.width(),
            flattened.height(),
            limits.target_width,
            limits.target_height,
        );
        let resized = if (width, height) == flattened.dimensions() {
            flattened
        } else {
            imageops::resize(&flattened, width, height, FilterType::Lanczos3)
        };

        let output = output_path_for(path, &limits.target_format);
        DynamicImage::ImageRgb8(resized).save_with_format(&output, format)?;

        if output != path {
            if let Err(e) = fs::remove_file(path) {
                warn!("Failed to remove original {}: {}", path.display(), e);
            }
        }

        info!(
            entry_type = %LogEntryType::Normalize,
            status = %OperationStatus::Completed,
            "Processed image: {} -> {} ({}x{})",
            file_name(path),
            file_name(&output),
            width,
            height
        );

        Ok(NormalizedImage {
            path: output,
            width,
            height,
        })
    }

    /// Normalize every file in order. Failures are logged and left out of the result.
    pub fn normalize_all(&self, paths: &[PathBuf]) -> Vec<NormalizedImage> {
        paths
            .iter()
            .filter_map(|path| match self.normalize(path) {
                Ok(image) => Some(image),
                Err(NormalizerError::TooSmall { .. }) => None,
                Err(e) => {
                    error!(
                        entry_type = %LogEntryType::Normalize,
                        status = %OperationStatus::Failed,
                        "Failed to process image {}: {}", path.display(), e
                    );
                    None
                }
            })
            .collect()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::test_support::noise_image;
    use image::{GenericImageView, Rgba, RgbaImage};
    use tempfile::tempdir;

    fn normalizer(min_file_size: u64) -> ImageNormalizer {
        let mut config = Configuration::default();
        config.limits.min_file_size = min_file_size;
        ImageNormalizer::new(Arc::new(config))
    }

    #[test]
    fn test_encoder_name_aliases() {
        assert_eq!(encoder_name("jpg"), "JPEG");
        assert_eq!(encoder_name("JPG"), "JPEG");
        assert_eq!(encoder_name("png"), "PNG");
        assert_eq!(image_format_for("jpg").unwrap(), ImageFormat::Jpeg);
        assert_eq!(image_format_for("webp").unwrap(), ImageFormat::WebP);
        assert!(matches!(image_format_for("svg"), Err(NormalizerError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_fit_within_shrinks_and_keeps_ratio() {
        assert_eq!(fit_within(400, 300, 200, 200), (200, 150));
        assert_eq!(fit_within(300, 900, 200, 200), (66, 200));
        assert_eq!(fit_within(1000, 1, 200, 200), (200, 1));
        for (w, h) in [(1920, 1080), (333, 777), (201, 199), (4000, 3)] {
            let (nw, nh) = fit_within(w, h, 200, 200);
            assert!(nw <= 200 && nh <= 200);
            let expected = w as f64 / h as f64;
            let actual = nw as f64 / nh as f64;
            assert!((expected - actual).abs() / expected < 0.02 || nw.min(nh) < 50);
        }
    }

    #[test]
    fn test_fit_within_never_upscales() {
        assert_eq!(fit_within(100, 50, 200, 200), (100, 50));
        assert_eq!(fit_within(200, 200, 200, 200), (200, 200));
    }

    #[test]
    fn test_flatten_uses_white_background() {
        let mut rgba = RgbaImage::from_pixel(2, 1, Rgba([0, 0, 0, 0]));
        rgba.put_pixel(1, 0, Rgba([10, 20, 30, 255]));
        let flat = flatten_onto_white(DynamicImage::ImageRgba8(rgba));
        assert_eq!(flat.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(flat.get_pixel(1, 0), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_normalize_transparent_png_to_jpeg() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("orange_1.png");
        let rgba = RgbaImage::from_fn(400, 300, |x, y| {
            if x < 200 {
                Rgba([0, 0, 0, 0])
            } else {
                Rgba([(x % 251) as u8, (y % 241) as u8, 128, 255])
            }
        });
        rgba.save(&source).unwrap();

        let normalized = normalizer(16).normalize(&source).unwrap();

        assert_eq!(normalized.path, dir.path().join("orange_1.jpg"));
        assert_eq!((normalized.width, normalized.height), (200, 150));
        assert!(!source.exists());
        let reopened = image::open(&normalized.path).unwrap();
        assert_eq!(reopened.dimensions(), (200, 150));
        let corner = reopened.to_rgb8().get_pixel(5, 5).0;
        assert!(corner.iter().all(|&c| c > 240), "corner {:?}", corner);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("orange_2.jpg");
        DynamicImage::ImageRgb8(noise_image(640, 480))
            .save_with_format(&source, ImageFormat::Jpeg)
            .unwrap();

        let norm = normalizer(16);
        let first = norm.normalize(&source).unwrap();
        let second = norm.normalize(&first.path).unwrap();

        assert_eq!(first.path, source);
        assert_eq!((first.width, first.height), (200, 150));
        assert_eq!((second.width, second.height), (200, 150));
        assert!(source.exists());
    }

    #[test]
    fn test_extensionless_download_gets_target_extension() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("orange_3");
        DynamicImage::ImageRgb8(noise_image(120, 80))
            .save_with_format(&source, ImageFormat::Png)
            .unwrap();

        let normalized = normalizer(16).normalize(&source).unwrap();
        assert_eq!(normalized.path, dir.path().join("orange_3.jpg"));
        assert_eq!((normalized.width, normalized.height), (120, 80));
        assert!(!source.exists());
    }

    #[test]
    fn test_output_path_for_dotted_names() {
        assert_eq!(output_path_for(Path::new("d/orange_1.png"), "jpg"), Path::new("d/orange_1.jpg"));
        assert_eq!(output_path_for(Path::new("d/orange_1.JPG"), "jpg"), Path::new("d/orange_1.jpg"));
        assert_eq!(output_path_for(Path::new("d/orange_2"), "jpg"), Path::new("d/orange_2.jpg"));
        assert_eq!(
            output_path_for(Path::new("d/3.5mm jack_1"), "jpg"),
            Path::new("d/3.5mm jack_1.jpg")
        );
        assert_eq!(
            output_path_for(Path::new("d/3.5mm jack_1.webp"), "png"),
            Path::new("d/3.5mm jack_1.png")
        );
    }

    #[test]
    fn test_dotted_keyword_extensionless_files_stay_distinct() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("3.5mm jack_1");
        let second = dir.path().join("3.5mm jack_2");
        for source in [&first, &second] {
            DynamicImage::ImageRgb8(noise_image(120, 80))
                .save_with_format(source, ImageFormat::Png)
                .unwrap();
        }

        let norm = normalizer(16);
        let a = norm.normalize(&first).unwrap();
        let b = norm.normalize(&second).unwrap();

        assert_eq!(a.path, dir.path().join("3.5mm jack_1.jpg"));
        assert_eq!(b.path, dir.path().join("3.5mm jack_2.jpg"));
        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["3.5mm jack_1.jpg", "3.5mm jack_2.jpg"]);
    }

    #[test]
    fn test_undersized_file_is_deleted() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("orange_4.jpg");
        fs::write(&source, vec![0u8; 100]).unwrap();

        let result = normalizer(2048).normalize(&source);
        assert!(matches!(result, Err(NormalizerError::TooSmall { size: 100 })));
        assert!(!source.exists());
    }

    #[test]
    fn test_corrupt_file_is_reported_and_kept() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("orange_5.jpg");
        fs::write(&source, vec![0x42u8; 4096]).unwrap();

        let norm = normalizer(2048);
        assert!(norm.normalize(&source).is_err());
        assert!(source.exists());
        assert!(norm.normalize_all(&[source.clone()]).is_empty());
    }
}
