use crate::types::{Crs, ProfileError, ProfileResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings shared by the profile store and the extraction worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// CRS of the profile layer and of coordinates given without one
    pub default_crs: Crs,
    /// Coordinate tolerance for angular reference systems (degrees)
    pub angular_epsilon: f64,
    /// Coordinate tolerance for projected reference systems (map units)
    pub linear_epsilon: f64,
    /// Number of raster tasks the worker may run concurrently
    pub parallelism: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_crs: Crs::wgs84(),
            angular_epsilon: 1e-6,
            linear_epsilon: 1e-1,
            parallelism: 1,
        }
    }
}

impl CoreConfig {
    /// Load a configuration from a JSON file; missing keys take defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ProfileResult<Self> {
        log::info!("Loading core configuration from: {}", path.as_ref().display());
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> ProfileResult<Self> {
        let config: CoreConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ProfileResult<()> {
        if !(self.angular_epsilon > 0.0) || !(self.linear_epsilon > 0.0) {
            return Err(ProfileError::InvalidInput(format!(
                "epsilons must be positive (angular={}, linear={})",
                self.angular_epsilon, self.linear_epsilon
            )));
        }
        if self.parallelism == 0 {
            return Err(ProfileError::InvalidInput(
                "parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Coordinate tolerance matching the units of `crs`.
    pub fn epsilon_for(&self, crs: &Crs) -> f64 {
        if crs.is_geographic() {
            self.angular_epsilon
        } else {
            self.linear_epsilon
        }
    }
}
