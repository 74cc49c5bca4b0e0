//! The individual processing stages.
//!
//! Each function here does one thing to one raster and returns a `Result`;
//! the [`runner`](super::runner) turns those results into stage outcomes.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

use image::imageops::{self, FilterType};
use image::{GrayAlphaImage, GrayImage, ImageFormat};
use serde::Serialize;

use crate::error::{Result, WorkerError};
use crate::raster::{reproject, Band, Bounds, Dataset};

const STATISTICS_WINDOW: u32 = 1000;

/// Contents of `<stem>_metadata.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RasterMetadata {
    pub driver: String,
    pub width: u32,
    pub height: u32,
    pub count: u16,
    pub dtype: String,
    pub crs: Option<String>,
    /// Affine coefficients `[a, b, c, d, e, f]`
    pub transform: Option<[f64; 6]>,
    pub bounds: Option<Bounds>,
    /// `[west, south, east, north]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds_wgs84: Option<[f64; 4]>,
    pub nodata: Option<f64>,
    pub compression_quality: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Statistics>,
}

/// Summary of the top-left sample window of band 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub min_value: f64,
    pub max_value: f64,
    pub mean_value: f64,
    pub std_value: f64,
    pub unique_values: usize,
    pub no_data_percentage: f64,
    pub sample_size: usize,
}

pub fn extract_metadata(
    dataset: &Dataset,
    reproject_bounds: bool,
    compression_quality: u8,
) -> RasterMetadata {
    let bounds = dataset.bounds();
    let bounds_wgs84 = match (reproject_bounds, dataset.epsg, bounds) {
        (true, Some(epsg), Some(ref b)) => reproject::bounds_to_wgs84(epsg, b),
        _ => None,
    };

    RasterMetadata {
        driver: "GTiff".to_string(),
        width: dataset.width,
        height: dataset.height,
        count: dataset.bands,
        dtype: dataset.data_type.clone(),
        crs: dataset.crs(),
        transform: dataset.transform.map(|t| t.coefficients()),
        bounds,
        bounds_wgs84,
        nodata: dataset.nodata,
        compression_quality,
        statistics: None,
    }
}

pub fn write_metadata(record: &RasterMetadata, path: &Path) -> Result<()> {
    let json = serde_json::to_vec_pretty(record)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Scale samples into `0..=255`.
///
/// Missing samples become 0 before the range is taken. When the maximum is
/// positive the range is stretched over `0..=255` (a flat raster maps to 0);
/// otherwise values are cast directly, saturating.
pub fn normalize(values: &[f64], is_missing: impl Fn(f64) -> bool) -> Vec<u8> {
    let cleaned: Vec<f64> = values
        .iter()
        .map(|&v| if is_missing(v) { 0.0 } else { v })
        .collect();

    let (min, max) = cleaned
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });

    if max > 0.0 {
        let range = max - min;
        cleaned
            .iter()
            .map(|&v| {
                if range > 0.0 {
                    ((v - min) / range * 255.0) as u8
                } else {
                    0
                }
            })
            .collect()
    } else {
        cleaned.iter().map(|&v| v as u8).collect()
    }
}

/// Fit `width` x `height` within `max_size`, preserving aspect ratio.
/// Returns `None` when no resize is needed.
pub fn fit_within(width: u32, height: u32, max_size: u32) -> Option<(u32, u32)> {
    let longest = width.max(height);
    if longest <= max_size {
        return None;
    }
    let ratio = f64::from(max_size) / f64::from(longest);
    let w = ((f64::from(width) * ratio) as u32).max(1);
    let h = ((f64::from(height) * ratio) as u32).max(1);
    Some((w, h))
}

/// Band 1 to an 8-bit PNG, resized to fit `max_size` if given.
pub fn convert(
    band: &Band,
    path: &Path,
    max_size: Option<u32>,
    preserve_transparency: bool,
) -> Result<(u32, u32)> {
    let grey = normalize(&band.values, |v| band.is_missing(v));
    let target = max_size.and_then(|m| fit_within(band.width, band.height, m));
    let alpha: Option<Vec<bool>> = preserve_transparency
        .then(|| band.values.iter().map(|&v| band.is_missing(v)).collect());

    save_png(&grey, alpha.as_deref(), band.width, band.height, target, path)
}

/// Six-line side-file: x-scale, row-rotation, column-rotation, y-scale,
/// origin-x, origin-y.
pub fn write_world_file(dataset: &Dataset, path: &Path) -> Result<()> {
    let transform = dataset
        .transform
        .ok_or(crate::raster::RasterError::NotGeoreferenced)?;

    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    for value in transform.world_file_lines() {
        writeln!(file, "{:?}", value)?;
    }
    file.flush()?;
    Ok(())
}

/// Thumbnail dimensions for a `size` box.
pub fn thumbnail_dimensions(width: u32, height: u32, size: u32) -> (u32, u32) {
    let aspect = f64::from(width) / f64::from(height);
    let (w, h) = if aspect > 1.0 {
        (f64::from(size), f64::from(size) / aspect)
    } else {
        (f64::from(size) * aspect, f64::from(size))
    };
    ((w as u32).max(1), (h as u32).max(1))
}

/// Box-average band 1 down to a `size` box and write it as PNG.
pub fn thumbnail(
    band: &Band,
    path: &Path,
    size: u32,
    preserve_transparency: bool,
) -> Result<(u32, u32)> {
    let (tw, th) = thumbnail_dimensions(band.width, band.height, size);
    let averaged = box_average(band, tw, th);
    let grey = normalize(&averaged, f64::is_nan);
    let alpha: Option<Vec<bool>> =
        preserve_transparency.then(|| averaged.iter().map(|v| v.is_nan()).collect());

    save_png(&grey, alpha.as_deref(), tw, th, None, path)
}

/// Mean of the non-missing source samples under each output pixel; NaN when
/// a box holds no valid sample.
fn box_average(band: &Band, out_w: u32, out_h: u32) -> Vec<f64> {
    let (src_w, src_h) = (u64::from(band.width), u64::from(band.height));
    let (out_w64, out_h64) = (u64::from(out_w), u64::from(out_h));
    let mut out = Vec::with_capacity(out_w as usize * out_h as usize);

    for ty in 0..out_h64 {
        let y0 = ty * src_h / out_h64;
        let y1 = ((ty + 1) * src_h).div_ceil(out_h64).max(y0 + 1).min(src_h);
        for tx in 0..out_w64 {
            let x0 = tx * src_w / out_w64;
            let x1 = ((tx + 1) * src_w).div_ceil(out_w64).max(x0 + 1).min(src_w);

            let mut sum = 0.0;
            let mut n = 0u64;
            for y in y0..y1 {
                for x in x0..x1 {
                    let v = band.get(x as u32, y as u32);
                    if !band.is_missing(v) {
                        sum += v;
                        n += 1;
                    }
                }
            }
            out.push(if n > 0 { sum / n as f64 } else { f64::NAN });
        }
    }
    out
}

/// Statistics over the top-left `min(1000, width, height)` square.
pub fn statistics(band: &Band) -> Result<Statistics> {
    let side = STATISTICS_WINDOW.min(band.width).min(band.height);
    let sample_size = side as usize * side as usize;

    let mut valid = Vec::with_capacity(sample_size);
    for row in 0..side {
        for col in 0..side {
            let v = band.get(col, row);
            if !band.is_missing(v) {
                valid.push(v);
            }
        }
    }

    if valid.is_empty() {
        return Err(WorkerError::Internal(
            "no valid data found in sample window".to_string(),
        ));
    }

    let n = valid.len() as f64;
    let (min, max, sum) = valid.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY, 0.0),
        |(lo, hi, s), &v| (lo.min(v), hi.max(v), s + v),
    );
    let mean = sum / n;
    let variance = valid.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    // +0.0 turns -0.0 into 0.0 so both count as one value
    let unique: HashSet<u64> = valid.iter().map(|v| (v + 0.0).to_bits()).collect();

    Ok(Statistics {
        min_value: min,
        max_value: max,
        mean_value: mean,
        std_value: variance.sqrt(),
        unique_values: unique.len(),
        no_data_percentage: (sample_size - valid.len()) as f64 / sample_size as f64 * 100.0,
        sample_size,
    })
}

fn save_png(
    grey: &[u8],
    alpha: Option<&[bool]>,
    width: u32,
    height: u32,
    resize_to: Option<(u32, u32)>,
    path: &Path,
) -> Result<(u32, u32)> {
    let buffer_error =
        || WorkerError::Internal(format!("pixel buffer does not match {}x{}", width, height));

    match alpha {
        Some(mask) => {
            let raw: Vec<u8> = grey
                .iter()
                .zip(mask)
                .flat_map(|(&g, &missing)| [g, if missing { 0 } else { 255 }])
                .collect();
            let mut img = GrayAlphaImage::from_raw(width, height, raw).ok_or_else(buffer_error)?;
            if let Some((w, h)) = resize_to {
                img = imageops::resize(&img, w, h, FilterType::Lanczos3);
            }
            img.save_with_format(path, ImageFormat::Png)?;
            Ok(img.dimensions())
        }
        None => {
            let mut img =
                GrayImage::from_raw(width, height, grey.to_vec()).ok_or_else(buffer_error)?;
            if let Some((w, h)) = resize_to {
                img = imageops::resize(&img, w, h, FilterType::Lanczos3);
            }
            img.save_with_format(path, ImageFormat::Png)?;
            Ok(img.dimensions())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band(width: u32, height: u32, values: Vec<f64>, nodata: Option<f64>) -> Band {
        Band {
            width,
            height,
            values,
            nodata,
        }
    }

    #[test]
    fn normalize_stretches_range() {
        let out = normalize(&[10.0, 20.0, 30.0], f64::is_nan);
        assert_eq!(out, vec![0, 127, 255]);
    }

    #[test]
    fn normalize_maps_missing_to_zero_first() {
        // NaN becomes 0, which then takes part in the min.
        let out = normalize(&[f64::NAN, 50.0, 100.0], f64::is_nan);
        assert_eq!(out, vec![0, 127, 255]);

        let out = normalize(&[-9999.0, 100.0], |v| v == -9999.0);
        assert_eq!(out, vec![0, 255]);
    }

    #[test]
    fn normalize_flat_and_non_positive() {
        assert_eq!(normalize(&[7.0, 7.0], f64::is_nan), vec![0, 0]);
        assert_eq!(normalize(&[-3.0, 0.0], f64::is_nan), vec![0, 0]);
    }

    #[test]
    fn fit_within_preserves_aspect() {
        assert_eq!(fit_within(100, 100, 50), Some((50, 50)));
        assert_eq!(fit_within(200, 100, 50), Some((50, 25)));
        assert_eq!(fit_within(40, 30, 50), None);
        assert_eq!(fit_within(1000, 1, 10), Some((10, 1)));
    }

    #[test]
    fn thumbnail_dimensions_follow_longer_side() {
        assert_eq!(thumbnail_dimensions(100, 100, 64), (64, 64));
        assert_eq!(thumbnail_dimensions(200, 100, 64), (64, 32));
        assert_eq!(thumbnail_dimensions(100, 400, 64), (16, 64));
    }

    #[test]
    fn box_average_skips_missing() {
        let b = band(2, 2, vec![1.0, 3.0, f64::NAN, 5.0], None);
        assert_eq!(box_average(&b, 1, 1), vec![3.0]);

        let all_missing = band(2, 1, vec![-1.0, -1.0], Some(-1.0));
        assert!(box_average(&all_missing, 1, 1)[0].is_nan());
    }

    #[test]
    fn box_average_identity_when_same_size() {
        let b = band(3, 1, vec![1.0, 2.0, 3.0], None);
        assert_eq!(box_average(&b, 3, 1), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn statistics_over_window() {
        let b = band(2, 2, vec![1.0, 2.0, 2.0, f64::NAN], None);
        let stats = statistics(&b).unwrap();
        assert_eq!(stats.sample_size, 4);
        assert_eq!(stats.min_value, 1.0);
        assert_eq!(stats.max_value, 2.0);
        assert!((stats.mean_value - 5.0 / 3.0).abs() < 1e-12);
        assert_eq!(stats.unique_values, 2);
        assert_eq!(stats.no_data_percentage, 25.0);
    }

    #[test]
    fn statistics_uses_square_window() {
        // 3x1 raster: the window is 1x1, only the first sample counts.
        let b = band(3, 1, vec![5.0, 100.0, 200.0], None);
        let stats = statistics(&b).unwrap();
        assert_eq!(stats.sample_size, 1);
        assert_eq!(stats.max_value, 5.0);
        assert_eq!(stats.std_value, 0.0);
    }

    #[test]
    fn statistics_without_valid_data_fails() {
        let b = band(1, 1, vec![0.0], Some(0.0));
        assert!(statistics(&b).is_err());
    }

    #[test]
    fn convert_writes_resized_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let values = (0..100 * 60).map(|i| (i % 100) as f64).collect();
        let b = band(100, 60, values, None);

        let dims = convert(&b, &path, Some(50), false).unwrap();
        assert_eq!(dims, (50, 30));
        let img = image::open(&path).unwrap();
        assert_eq!((img.width(), img.height()), (50, 30));
    }

    #[test]
    fn convert_with_transparency_has_alpha() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha.png");
        let b = band(2, 1, vec![-1.0, 10.0], Some(-1.0));

        convert(&b, &path, None, true).unwrap();
        let img = image::open(&path).unwrap().into_luma_alpha8();
        assert_eq!(img.get_pixel(0, 0).0, [0, 0]);
        assert_eq!(img.get_pixel(1, 0).0, [255, 255]);
    }
}
