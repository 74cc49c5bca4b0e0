//! Bounds reprojection into WGS84 longitude/latitude.
//!
//! Covers the coordinate systems rasters arrive in most often: geographic
//! WGS84, Web Mercator and the WGS84 UTM zones. Edges are densified before
//! transforming so curved edges in the target frame are not clipped.

use super::Bounds;

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;
const UTM_K0: f64 = 0.9996;
const UTM_FALSE_EASTING: f64 = 500_000.0;
const UTM_FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;
const DENSIFY_POINTS: usize = 21;

/// A source CRS this module can invert.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SourceCrs {
    Geographic,
    WebMercator,
    Utm { zone: u16, north: bool },
}

impl SourceCrs {
    fn from_epsg(code: u16) -> Option<Self> {
        match code {
            4326 => Some(Self::Geographic),
            3857 | 3785 => Some(Self::WebMercator),
            32601..=32660 => Some(Self::Utm {
                zone: code - 32600,
                north: true,
            }),
            32701..=32760 => Some(Self::Utm {
                zone: code - 32700,
                north: false,
            }),
            _ => None,
        }
    }

    fn to_lon_lat(self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Self::Geographic => (x, y),
            Self::WebMercator => web_mercator_inverse(x, y),
            Self::Utm { zone, north } => utm_inverse(zone, north, x, y),
        }
    }
}

/// Transform `bounds` from `EPSG:<epsg>` into `[west, south, east, north]`.
///
/// Returns `None` for coordinate systems this module cannot invert.
pub fn bounds_to_wgs84(epsg: u16, bounds: &Bounds) -> Option<[f64; 4]> {
    let Some(crs) = SourceCrs::from_epsg(epsg) else {
        tracing::warn!(epsg, "No WGS84 transform for coordinate system");
        return None;
    };

    if crs == SourceCrs::Geographic {
        return Some([bounds.left, bounds.bottom, bounds.right, bounds.top]);
    }

    let mut west = f64::INFINITY;
    let mut south = f64::INFINITY;
    let mut east = f64::NEG_INFINITY;
    let mut north = f64::NEG_INFINITY;

    for (x, y) in densified_edges(bounds) {
        let (lon, lat) = crs.to_lon_lat(x, y);
        if !lon.is_finite() || !lat.is_finite() {
            continue;
        }
        west = west.min(lon);
        east = east.max(lon);
        south = south.min(lat);
        north = north.max(lat);
    }

    if west.is_finite() && south.is_finite() && east.is_finite() && north.is_finite() {
        Some([west, south, east, north])
    } else {
        None
    }
}

fn densified_edges(b: &Bounds) -> Vec<(f64, f64)> {
    let mut points = Vec::with_capacity(DENSIFY_POINTS * 4);
    let steps = (DENSIFY_POINTS - 1) as f64;
    for i in 0..DENSIFY_POINTS {
        let t = i as f64 / steps;
        let x = b.left + (b.right - b.left) * t;
        let y = b.bottom + (b.top - b.bottom) * t;
        points.push((x, b.bottom));
        points.push((x, b.top));
        points.push((b.left, y));
        points.push((b.right, y));
    }
    points
}

fn web_mercator_inverse(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / WGS84_A).to_degrees();
    let lat = (2.0 * (y / WGS84_A).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
    (lon, lat)
}

/// Inverse transverse Mercator on the WGS84 ellipsoid (series expansion).
fn utm_inverse(zone: u16, north: bool, easting: f64, northing: f64) -> (f64, f64) {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let ep2 = e2 / (1.0 - e2);
    let x = easting - UTM_FALSE_EASTING;
    let y = if north {
        northing
    } else {
        northing - UTM_FALSE_NORTHING_SOUTH
    };
    let lon0 = (f64::from(zone) - 1.0) * 6.0 - 180.0 + 3.0;

    let m = y / UTM_K0;
    let mu = m / (WGS84_A * (1.0 - e2 / 4.0 - 3.0 * e2.powi(2) / 64.0 - 5.0 * e2.powi(3) / 256.0));
    let e1 = (1.0 - (1.0 - e2).sqrt()) / (1.0 + (1.0 - e2).sqrt());

    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1.powi(2) / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let (sin1, cos1, tan1) = (phi1.sin(), phi1.cos(), phi1.tan());
    let n1 = WGS84_A / (1.0 - e2 * sin1 * sin1).sqrt();
    let t1 = tan1 * tan1;
    let c1 = ep2 * cos1 * cos1;
    let r1 = WGS84_A * (1.0 - e2) / (1.0 - e2 * sin1 * sin1).powf(1.5);
    let d = x / (n1 * UTM_K0);

    let lat = phi1
        - (n1 * tan1 / r1)
            * (d.powi(2) / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d.powi(6)
                    / 720.0);
    let lon = (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
        + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1) * d.powi(5)
            / 120.0)
        / cos1;

    (lon0 + lon.to_degrees(), lat.to_degrees())
}
