//! GeoTIFF access for the processing pipeline.
//!
//! Only what the pipeline needs is decoded: the image header, the GeoTIFF
//! georeferencing tags and the first band's samples. Pixel transforms live in
//! [`crate::pipeline::stages`]; coordinate reprojection in [`reproject`].

pub mod reproject;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

const GEOGRAPHIC_TYPE_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_KEY: u16 = 3072;
const USER_DEFINED: u16 = 32767;

#[derive(Debug, thiserror::Error)]
pub enum RasterError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid GeoTIFF: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("invalid raster dimensions {width}x{height}")]
    EmptyDimensions { width: u32, height: u32 },

    #[error("raster has no affine georeferencing")]
    NotGeoreferenced,

    #[error("unsupported raster layout: {0}")]
    Unsupported(String),

    #[error("band data unavailable: {0}")]
    Unreadable(String),
}

/// GeoTIFF tag code as the decoder keys it.
pub fn geo_tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// Six-coefficient affine transform mapping (col, row) to (x, y):
/// `x = a*col + b*row + c`, `y = d*col + e*row + f`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl GeoTransform {
    /// From a 4x4 row-major ModelTransformation matrix.
    pub fn from_model_transformation(m: &[f64]) -> Option<Self> {
        if m.len() < 16 {
            return None;
        }
        Some(Self {
            a: m[0],
            b: m[1],
            c: m[3],
            d: m[4],
            e: m[5],
            f: m[7],
        })
    }

    /// From ModelPixelScale `(sx, sy, sz)` and the first ModelTiepoint
    /// `(i, j, k, x, y, z)`. Raster rows grow southwards, hence `e = -sy`.
    pub fn from_scale_and_tiepoint(scale: &[f64], tiepoint: &[f64]) -> Option<Self> {
        if scale.len() < 2 || tiepoint.len() < 6 {
            return None;
        }
        let (sx, sy) = (scale[0], scale[1]);
        let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
        Some(Self {
            a: sx,
            b: 0.0,
            c: x - i * sx,
            d: 0.0,
            e: -sy,
            f: y + j * sy,
        })
    }

    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.a * col + self.b * row + self.c,
            self.d * col + self.e * row + self.f,
        )
    }

    /// Coefficients in `[a, b, c, d, e, f]` order.
    pub fn coefficients(&self) -> [f64; 6] {
        [self.a, self.b, self.c, self.d, self.e, self.f]
    }

    /// Side-file line order: x-scale, row-rotation, column-rotation,
    /// y-scale, origin-x, origin-y.
    pub fn world_file_lines(&self) -> [f64; 6] {
        [self.a, self.b, self.d, self.e, self.c, self.f]
    }

    /// Extent of a `width` x `height` grid under this transform.
    pub fn bounds(&self, width: u32, height: u32) -> Bounds {
        let (w, h) = (f64::from(width), f64::from(height));
        let corners = [
            self.apply(0.0, 0.0),
            self.apply(w, 0.0),
            self.apply(0.0, h),
            self.apply(w, h),
        ];
        let mut bounds = Bounds {
            left: f64::INFINITY,
            bottom: f64::INFINITY,
            right: f64::NEG_INFINITY,
            top: f64::NEG_INFINITY,
        };
        for (x, y) in corners {
            bounds.left = bounds.left.min(x);
            bounds.right = bounds.right.max(x);
            bounds.bottom = bounds.bottom.min(y);
            bounds.top = bounds.top.max(y);
        }
        bounds
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

/// Header-level description of a GeoTIFF; no pixel data is held.
#[derive(Debug, Clone)]
pub struct Dataset {
    path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub bands: u16,
    pub data_type: String,
    pub transform: Option<GeoTransform>,
    pub epsg: Option<u16>,
    pub nodata: Option<f64>,
    planar_separate: bool,
}

impl Dataset {
    /// Open `path` and read its header and georeferencing tags.
    ///
    /// Fails for unreadable files, non-TIFF content, and zero-sized images.
    pub fn open(path: &Path) -> Result<Self, RasterError> {
        let mut decoder = open_decoder(path)?;

        let (width, height) = decoder.dimensions()?;
        if width == 0 || height == 0 {
            return Err(RasterError::EmptyDimensions { width, height });
        }

        let bands = find_u16s(&mut decoder, Tag::SamplesPerPixel)?
            .and_then(|v| v.first().copied())
            .unwrap_or(1);
        let bits = find_u16s(&mut decoder, Tag::BitsPerSample)?
            .and_then(|v| v.first().copied())
            .unwrap_or(1);
        let format = find_u16s(&mut decoder, Tag::SampleFormat)?
            .and_then(|v| v.first().copied())
            .unwrap_or(1);
        let planar_separate = find_u16s(&mut decoder, Tag::PlanarConfiguration)?
            .and_then(|v| v.first().copied())
            == Some(2);

        let transform = match find_f64s(&mut decoder, geo_tag(MODEL_TRANSFORMATION))? {
            Some(matrix) => GeoTransform::from_model_transformation(&matrix),
            None => {
                let scale = find_f64s(&mut decoder, geo_tag(MODEL_PIXEL_SCALE))?;
                let tiepoint = find_f64s(&mut decoder, geo_tag(MODEL_TIEPOINT))?;
                match (scale, tiepoint) {
                    (Some(s), Some(t)) => GeoTransform::from_scale_and_tiepoint(&s, &t),
                    _ => None,
                }
            }
        };

        let epsg = find_u16s(&mut decoder, geo_tag(GEO_KEY_DIRECTORY))?
            .and_then(|keys| epsg_from_geo_keys(&keys));

        let nodata = match decoder.find_tag(geo_tag(GDAL_NODATA))? {
            Some(value) => value.into_string().ok().and_then(|s| parse_nodata(&s)),
            None => None,
        };

        Ok(Self {
            path: path.to_path_buf(),
            width,
            height,
            bands,
            data_type: data_type_name(format, bits),
            transform,
            epsg,
            nodata,
            planar_separate,
        })
    }

    /// `EPSG:<code>` when the GeoKey directory names a registered CRS.
    pub fn crs(&self) -> Option<String> {
        self.epsg.map(|code| format!("EPSG:{}", code))
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.transform.map(|t| t.bounds(self.width, self.height))
    }

    /// Decode the first band as `f64` samples in row-major order.
    pub fn read_band1(&self) -> Result<Band, RasterError> {
        let mut decoder = open_decoder(&self.path)?;
        let samples = into_f64(decoder.read_image()?)?;

        let pixels = self.width as usize * self.height as usize;
        let stride = if self.planar_separate {
            1
        } else {
            usize::from(self.bands.max(1))
        };
        if samples.len() < pixels * stride {
            return Err(RasterError::Unsupported(format!(
                "expected {} samples, decoded {}",
                pixels * stride,
                samples.len()
            )));
        }

        let values = if stride == 1 {
            let mut samples = samples;
            samples.truncate(pixels);
            samples
        } else {
            samples.into_iter().step_by(stride).take(pixels).collect()
        };

        Ok(Band {
            width: self.width,
            height: self.height,
            values,
            nodata: self.nodata,
        })
    }
}

/// One band of samples plus its missing-data marker.
#[derive(Debug, Clone)]
pub struct Band {
    pub width: u32,
    pub height: u32,
    pub values: Vec<f64>,
    pub nodata: Option<f64>,
}

impl Band {
    pub fn is_missing(&self, value: f64) -> bool {
        value.is_nan() || self.nodata == Some(value)
    }

    pub fn get(&self, col: u32, row: u32) -> f64 {
        self.values[row as usize * self.width as usize + col as usize]
    }
}

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<File>>, RasterError> {
    let file = File::open(path).map_err(|e| RasterError::Open {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(Decoder::new(BufReader::new(file))?)
}

fn find_u16s(
    decoder: &mut Decoder<BufReader<File>>,
    tag: Tag,
) -> Result<Option<Vec<u16>>, RasterError> {
    // Single-valued SHORT tags decode as `Unsigned(u32)`, which `into_u16_vec` rejects.
    let Some(value) = decoder.find_tag(tag)? else {
        return Ok(None);
    };
    value
        .into_u32_vec()?
        .into_iter()
        .map(|v| {
            u16::try_from(v)
                .map_err(|_| RasterError::Unsupported(format!("{:?} value {} out of range", tag, v)))
        })
        .collect::<Result<Vec<u16>, _>>()
        .map(Some)
}

fn find_f64s(
    decoder: &mut Decoder<BufReader<File>>,
    tag: Tag,
) -> Result<Option<Vec<f64>>, RasterError> {
    match decoder.find_tag(tag)? {
        Some(value) => Ok(Some(value.into_f64_vec()?)),
        None => Ok(None),
    }
}

/// Projected CRS wins over geographic; user-defined codes are not EPSG codes.
fn epsg_from_geo_keys(keys: &[u16]) -> Option<u16> {
    if keys.len() < 4 {
        return None;
    }
    let count = usize::from(keys[3]);
    let mut geographic = None;
    let mut projected = None;

    for entry in keys[4..].chunks_exact(4).take(count) {
        let (key, location, value) = (entry[0], entry[1], entry[3]);
        if location != 0 || value == 0 || value == USER_DEFINED {
            continue;
        }
        match key {
            PROJECTED_CS_TYPE_KEY => projected = Some(value),
            GEOGRAPHIC_TYPE_KEY => geographic = Some(value),
            _ => {}
        }
    }

    projected.or(geographic)
}

fn parse_nodata(raw: &str) -> Option<f64> {
    raw.trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .parse()
        .ok()
}

fn data_type_name(format: u16, bits: u16) -> String {
    match format {
        2 => format!("int{}", bits),
        3 => format!("float{}", bits),
        _ => format!("uint{}", bits),
    }
}

#[allow(unreachable_patterns)]
fn into_f64(result: DecodingResult) -> Result<Vec<f64>, RasterError> {
    let values = match result {
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
        _ => {
            return Err(RasterError::Unsupported(
                "sample format has no numeric conversion".to_string(),
            ))
        }
    };
    Ok(values)
}
