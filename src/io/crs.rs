use crate::types::{Crs, Geometry, ProfileError, ProfileResult, Shape};

/// WGS84 semi-major axis used by spherical Web Mercator
const EARTH_RADIUS: f64 = 6_378_137.0;

/// Web Mercator latitude limit (degrees)
const MERCATOR_MAX_LAT: f64 = 85.051_128_779_806_59;

/// Coordinate transformation between reference systems.
pub trait CrsTransformer: Send + Sync {
    fn transform_point(&self, from: &Crs, to: &Crs, x: f64, y: f64) -> ProfileResult<(f64, f64)>;

    /// Transform a geometry; rectangles become the bounding box of their
    /// transformed corners.
    fn transform_geometry(&self, geometry: &Geometry, to: &Crs) -> ProfileResult<Geometry> {
        if &geometry.crs == to {
            return Ok(geometry.clone());
        }
        match geometry.shape {
            Shape::Point { x, y } => {
                let (tx, ty) = self.transform_point(&geometry.crs, to, x, y)?;
                Ok(Geometry::point(tx, ty, to.clone()))
            }
            Shape::Rectangle { x_min, y_min, x_max, y_max } => {
                let corners = [(x_min, y_min), (x_min, y_max), (x_max, y_min), (x_max, y_max)];
                let mut xs = Vec::with_capacity(4);
                let mut ys = Vec::with_capacity(4);
                for (x, y) in corners {
                    let (tx, ty) = self.transform_point(&geometry.crs, to, x, y)?;
                    xs.push(tx);
                    ys.push(ty);
                }
                let fold_min = |v: &[f64]| v.iter().copied().fold(f64::INFINITY, f64::min);
                let fold_max = |v: &[f64]| v.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                Ok(Geometry::rectangle(
                    fold_min(&xs),
                    fold_min(&ys),
                    fold_max(&xs),
                    fold_max(&ys),
                    to.clone(),
                ))
            }
        }
    }
}

/// Transformer for identical systems and the WGS84 / Web Mercator pair.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinTransformer;

impl BuiltinTransformer {
    fn lonlat_to_mercator(lon: f64, lat: f64) -> ProfileResult<(f64, f64)> {
        if lat.abs() > MERCATOR_MAX_LAT || lon.abs() > 180.0 {
            return Err(ProfileError::Transform(format!(
                "({}, {}) is outside the Web Mercator domain",
                lon, lat
            )));
        }
        let x = EARTH_RADIUS * lon.to_radians();
        let y = EARTH_RADIUS * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
        Ok((x, y))
    }

    fn mercator_to_lonlat(x: f64, y: f64) -> (f64, f64) {
        let lon = (x / EARTH_RADIUS).to_degrees();
        let lat = (2.0 * (y / EARTH_RADIUS).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
        (lon, lat)
    }
}

impl CrsTransformer for BuiltinTransformer {
    fn transform_point(&self, from: &Crs, to: &Crs, x: f64, y: f64) -> ProfileResult<(f64, f64)> {
        if !x.is_finite() || !y.is_finite() {
            return Err(ProfileError::Transform(format!("non-finite coordinate ({}, {})", x, y)));
        }
        if from == to {
            return Ok((x, y));
        }
        match (from.epsg_code(), to.epsg_code()) {
            (Some(4326), Some(3857)) => Self::lonlat_to_mercator(x, y),
            (Some(3857), Some(4326)) => Ok(Self::mercator_to_lonlat(x, y)),
            _ => Err(ProfileError::Transform(format!(
                "no transformation available from {} to {}",
                from, to
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity_transform() {
        let t = BuiltinTransformer;
        let crs = Crs::epsg(32633);
        assert_eq!(t.transform_point(&crs, &crs, 10.0, 20.0).unwrap(), (10.0, 20.0));
    }

    #[test]
    fn test_mercator_round_trip() {
        let t = BuiltinTransformer;
        let (x, y) = t.transform_point(&Crs::wgs84(), &Crs::epsg(3857), 13.4, 52.5).unwrap();
        assert_relative_eq!(x, 1_491_681.0, epsilon = 1.0);
        let (lon, lat) = t.transform_point(&Crs::epsg(3857), &Crs::wgs84(), x, y).unwrap();
        assert_relative_eq!(lon, 13.4, epsilon = 1e-9);
        assert_relative_eq!(lat, 52.5, epsilon = 1e-9);
    }

    #[test]
    fn test_unsupported_pair_fails() {
        let t = BuiltinTransformer;
        assert!(t.transform_point(&Crs::wgs84(), &Crs::epsg(32633), 13.0, 52.0).is_err());
        assert!(t.transform_point(&Crs::wgs84(), &Crs::epsg(3857), 0.0, 89.0).is_err());
    }

    #[test]
    fn test_rectangle_transform_is_bounding_box() {
        let t = BuiltinTransformer;
        let rect = Geometry::rectangle(0.0, 0.0, 1.0, 1.0, Crs::wgs84());
        let out = t.transform_geometry(&rect, &Crs::epsg(3857)).unwrap();
        match out.shape {
            Shape::Rectangle { x_min, y_min, x_max, y_max } => {
                assert_relative_eq!(x_min, 0.0);
                assert_relative_eq!(y_min, 0.0, epsilon = 1e-6);
                assert!(x_max > 111_000.0 && y_max > 111_000.0);
            }
            _ => panic!("expected rectangle"),
        }
    }
}
