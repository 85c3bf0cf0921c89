use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinate reference system descriptor.
///
/// The definition is an authority id (`EPSG:4326`) or a WKT string; two
/// descriptors are the same CRS when their normalised definitions match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crs {
    definition: String,
    geographic: bool,
}

/// EPSG codes treated as angular (lat/lon) when built from a bare code.
const GEOGRAPHIC_EPSG: [u32; 6] = [4326, 4258, 4269, 4267, 4230, 4283];

impl Crs {
    pub fn new(definition: impl Into<String>, geographic: bool) -> Self {
        Self {
            definition: definition.into().trim().to_string(),
            geographic,
        }
    }

    /// CRS from an EPSG code; common geographic codes are flagged angular.
    pub fn epsg(code: u32) -> Self {
        Self::new(format!("EPSG:{}", code), GEOGRAPHIC_EPSG.contains(&code))
    }

    pub fn wgs84() -> Self {
        Self::epsg(4326)
    }

    pub fn definition(&self) -> &str {
        &self.definition
    }

    /// True for angular (degree based) reference systems.
    pub fn is_geographic(&self) -> bool {
        self.geographic
    }

    /// EPSG code if the definition is an `EPSG:<code>` authority id.
    pub fn epsg_code(&self) -> Option<u32> {
        let upper = self.definition.to_ascii_uppercase();
        upper.strip_prefix("EPSG:").and_then(|c| c.parse().ok())
    }
}

impl PartialEq for Crs {
    fn eq(&self, other: &Self) -> bool {
        self.definition.eq_ignore_ascii_case(&other.definition)
    }
}

impl Eq for Crs {}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.definition)
    }
}

/// Geospatial transformation parameters (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform without rotation terms.
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Fractional pixel/line position of a map coordinate.
    pub fn map_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let col = (x - self.top_left_x) / self.pixel_width;
        let row = (y - self.top_left_y) / self.pixel_height;
        let px = col - row * (self.rotation_x / self.pixel_height);
        let py = row - col * (self.rotation_y / self.pixel_width);
        (px, py)
    }

    /// Map coordinate of a (fractional) pixel/line position.
    pub fn pixel_to_map(&self, px: f64, py: f64) -> (f64, f64) {
        let x = self.top_left_x + px * self.pixel_width + py * self.rotation_x;
        let y = self.top_left_y + px * self.rotation_y + py * self.pixel_height;
        (x, y)
    }

    /// Absolute pixel size (x, y) in map units
    pub fn pixel_size(&self) -> (f64, f64) {
        (self.pixel_width.abs(), self.pixel_height.abs())
    }
}

/// Shape of a query geometry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    Point { x: f64, y: f64 },
    Rectangle { x_min: f64, y_min: f64, x_max: f64, y_max: f64 },
}

/// Point or axis-aligned rectangle in a given CRS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub shape: Shape,
    pub crs: Crs,
}

impl Geometry {
    pub fn point(x: f64, y: f64, crs: Crs) -> Self {
        Self { shape: Shape::Point { x, y }, crs }
    }

    /// Rectangle from two opposite corners in any order.
    pub fn rectangle(x0: f64, y0: f64, x1: f64, y1: f64, crs: Crs) -> Self {
        Self {
            shape: Shape::Rectangle {
                x_min: x0.min(x1),
                y_min: y0.min(y1),
                x_max: x0.max(x1),
                y_max: y0.max(y1),
            },
            crs,
        }
    }

    pub fn validate(&self) -> ProfileResult<()> {
        let finite = match self.shape {
            Shape::Point { x, y } => x.is_finite() && y.is_finite(),
            Shape::Rectangle { x_min, y_min, x_max, y_max } => {
                [x_min, y_min, x_max, y_max].iter().all(|v| v.is_finite())
            }
        };
        if !finite {
            return Err(ProfileError::InvalidInput(format!(
                "geometry has non-finite coordinates: {:?}",
                self.shape
            )));
        }
        Ok(())
    }
}

/// Stable identifier of a temporal profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileId(pub u64);

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing tag of an extraction batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Data-map key of the mean value of 1-based band `i`.
pub fn band_key(band_number: usize) -> String {
    format!("b{}", band_number)
}

/// Data-map key of the standard deviation of 1-based band `i`.
pub fn std_key(band_number: usize) -> String {
    format!("std{}", band_number)
}

/// 1-based band number of a `b{digits}` key.
pub fn parse_band_key(key: &str) -> Option<usize> {
    let digits = key.strip_prefix('b')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|n: &usize| *n >= 1)
}

/// Error types for profile extraction and management
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown sensor: {0}")]
    UnknownSensor(String),

    #[error("Unknown profile: {0}")]
    UnknownProfile(ProfileId),

    #[error("Raster error: {0}")]
    Raster(String),

    #[error("CRS transform error: {0}")]
    Transform(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

/// Result type for profile operations
pub type ProfileResult<T> = Result<T, ProfileError>;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_band_key_parsing() {
        assert_eq!(band_key(3), "b3");
        assert_eq!(std_key(12), "std12");
        assert_eq!(parse_band_key("b12"), Some(12));
        assert_eq!(parse_band_key("b0"), None);
        assert_eq!(parse_band_key("std1"), None);
        assert_eq!(parse_band_key("b"), None);
        assert_eq!(parse_band_key("b1x"), None);
    }

    #[test]
    fn test_geotransform_round_trip() {
        let gt = GeoTransform::north_up(500_000.0, 4_200_000.0, 30.0, 30.0);
        let (px, py) = gt.map_to_pixel(500_045.0, 4_199_985.0);
        assert_relative_eq!(px, 1.5);
        assert_relative_eq!(py, 0.5);
        let (x, y) = gt.pixel_to_map(px, py);
        assert_relative_eq!(x, 500_045.0);
        assert_relative_eq!(y, 4_199_985.0);
    }

    #[test]
    fn test_crs_equality() {
        assert_eq!(Crs::epsg(4326), Crs::new("epsg:4326", true));
        assert!(Crs::wgs84().is_geographic());
        assert!(!Crs::epsg(32633).is_geographic());
        assert_eq!(Crs::epsg(32633).epsg_code(), Some(32633));
    }
}
