//! GI configuration (host GUI surface), loadable from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::types::{Result, Vec3};
use crate::core::Error;

/// Maximum blur radius supported by the blur kernel uniform
pub const MAX_BLUR_RADIUS: u32 = 16;

/// Surfel pool capacity ceiling
pub const MAX_SURFELS: u32 = 1 << 20;

/// Largest grid the two-level scan covers (`block_size²`)
pub const MAX_GRID_CELLS: u32 = 1024 * 1024;

/// Which texture `output_view` exposes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualizeMode {
    /// Composited GI map (albedo x irradiance)
    #[default]
    GiMap,
    /// Coverage heatmap
    Coverage,
    /// Resolved (optionally blurred) irradiance
    Irradiance,
    /// Surfel footprint debug view
    Surfels,
    /// No GI output (black)
    None,
}

impl VisualizeMode {
    /// Index written to the shader uniforms
    pub fn as_u32(self) -> u32 {
        match self {
            Self::GiMap => 0,
            Self::Coverage => 1,
            Self::Irradiance => 2,
            Self::Surfels => 3,
            Self::None => 4,
        }
    }

    /// Parse the names used on the debug protocol
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gi_map" | "gi" => Some(Self::GiMap),
            "coverage" => Some(Self::Coverage),
            "irradiance" => Some(Self::Irradiance),
            "surfels" | "debug" => Some(Self::Surfels),
            "none" | "off" => Some(Self::None),
            _ => None,
        }
    }
}

/// Separable Gaussian blur applied to the resolved irradiance
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlurConfig {
    pub enabled: bool,
    /// Kernel radius in pixels (<= MAX_BLUR_RADIUS)
    pub radius: u32,
    pub sigma: f32,
}

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            radius: 4,
            sigma: 2.0,
        }
    }
}

/// Surfel gather weight: `(1 - d/R)^distance_falloff * max(0, n·n)^normal_power`
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatherWeights {
    pub distance_falloff: f32,
    pub normal_power: f32,
}

impl Default for GatherWeights {
    fn default() -> Self {
        Self {
            distance_falloff: 1.0,
            normal_power: 2.0,
        }
    }
}

/// Uniform world grid placement
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Cells per axis
    pub dimension: u32,
    /// Edge length of the world cube
    pub world_size: f32,
    /// Centre of the world cube
    pub world_center: [f32; 3],
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            dimension: 32,
            world_size: 20.0,
            world_center: [0.0; 3],
        }
    }
}

impl GridConfig {
    pub fn total_cells(&self) -> u64 {
        let d = self.dimension as u64;
        d * d * d
    }

    pub fn center(&self) -> Vec3 {
        Vec3::from_array(self.world_center)
    }

    /// Reject grids the scan engine cannot cover
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(Error::Config("grid dimension must be > 0".into()));
        }
        if self.total_cells() > MAX_GRID_CELLS as u64 {
            return Err(Error::Config(format!(
                "grid {}^3 = {} cells exceeds scan capacity {}",
                self.dimension,
                self.total_cells(),
                MAX_GRID_CELLS
            )));
        }
        if !(self.world_size > 0.0) || !self.world_size.is_finite() {
            return Err(Error::Config(format!("invalid world size {}", self.world_size)));
        }
        Ok(())
    }
}

/// Full GI configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GiConfig {
    /// Surfel pool capacity
    pub max_surfels: u32,
    /// Probability that an under-covered tile spawns this frame
    pub spawn_chance: f32,
    /// Rays traced per frame across all surfels
    pub ray_budget: u32,
    /// Coverage below which a tile is under-covered
    pub coverage_threshold: f32,
    pub surfel_radius: f32,
    /// Gather radius as a multiple of `surfel_radius`
    pub gather_radius_scale: f32,
    /// Mix wall-clock time into the per-frame random seed
    pub time_driven_updates: bool,
    /// Gather surfel irradiance at ray hits
    pub multi_bounce: bool,
    pub apply_gi: bool,
    pub gi_intensity: f32,
    pub visualize: VisualizeMode,
    pub blur: BlurConfig,
    pub weights: GatherWeights,
    pub grid: GridConfig,
}

impl Default for GiConfig {
    fn default() -> Self {
        Self {
            max_surfels: MAX_SURFELS,
            spawn_chance: 0.25,
            ray_budget: 32_768,
            coverage_threshold: 0.5,
            surfel_radius: 0.125,
            gather_radius_scale: 2.0,
            time_driven_updates: true,
            multi_bounce: true,
            apply_gi: true,
            gi_intensity: 1.0,
            visualize: VisualizeMode::GiMap,
            blur: BlurConfig::default(),
            weights: GatherWeights::default(),
            grid: GridConfig::default(),
        }
    }
}

impl GiConfig {
    /// Gather radius used by the resolve pass
    pub fn gather_radius(&self) -> f32 {
        self.surfel_radius * self.gather_radius_scale
    }

    /// True if switching from `self` to `other` needs a full pool reset
    pub fn requires_reset(&self, other: &GiConfig) -> bool {
        self.max_surfels != other.max_surfels || self.grid != other.grid
    }

    pub fn validate(&self) -> Result<()> {
        self.grid.validate()?;
        if self.max_surfels == 0 {
            return Err(Error::Config("max_surfels must be > 0".into()));
        }
        if self.max_surfels > MAX_SURFELS {
            return Err(Error::Config(format!(
                "max_surfels {} exceeds {}",
                self.max_surfels, MAX_SURFELS
            )));
        }
        if !(0.0..=1.0).contains(&self.spawn_chance) {
            return Err(Error::Config(format!("spawn_chance {} outside [0, 1]", self.spawn_chance)));
        }
        if !(self.surfel_radius > 0.0) {
            return Err(Error::Config(format!("surfel_radius {} must be > 0", self.surfel_radius)));
        }
        if self.gather_radius_scale < 1.0 {
            return Err(Error::Config("gather_radius_scale must be >= 1".into()));
        }
        if self.gather_radius() * 2.0 > self.grid.world_size {
            return Err(Error::Config("gather radius larger than the world cube".into()));
        }
        if self.blur.radius > MAX_BLUR_RADIUS {
            return Err(Error::Config(format!(
                "blur radius {} exceeds {}",
                self.blur.radius, MAX_BLUR_RADIUS
            )));
        }
        if !(self.blur.sigma > 0.0) {
            return Err(Error::Config("blur sigma must be > 0".into()));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: GiConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GiConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_surfels, 1_048_576);
        assert_eq!(config.surfel_radius, 0.125);
        assert_eq!(config.grid.total_cells(), 32 * 32 * 32);
    }

    #[test]
    fn test_grid_capacity_limit() {
        let ok = GridConfig { dimension: 101, ..Default::default() };
        ok.validate().unwrap();
        let too_big = GridConfig { dimension: 102, ..Default::default() };
        assert!(matches!(too_big.validate(), Err(Error::Config(_))));
        let empty = GridConfig { dimension: 0, ..Default::default() };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = GiConfig::default();
        config.spawn_chance = 1.5;
        assert!(config.validate().is_err());

        let mut config = GiConfig::default();
        config.blur.radius = MAX_BLUR_RADIUS + 1;
        assert!(config.validate().is_err());

        let mut config = GiConfig::default();
        config.max_surfels = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_surfels_ceiling() {
        let config = GiConfig { max_surfels: MAX_SURFELS, ..Default::default() };
        config.validate().unwrap();

        let config = GiConfig { max_surfels: MAX_SURFELS + 1, ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = GiConfig { max_surfels: 100_000_000, ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_requires_reset() {
        let base = GiConfig::default();
        let mut other = base.clone();
        other.spawn_chance = 1.0;
        other.blur.enabled = false;
        assert!(!base.requires_reset(&other));

        other.max_surfels = 1024;
        assert!(base.requires_reset(&other));

        let mut other = base.clone();
        other.grid.dimension = 64;
        assert!(base.requires_reset(&other));
    }

    #[test]
    fn test_visualize_mode_parse() {
        assert_eq!(VisualizeMode::parse("Coverage"), Some(VisualizeMode::Coverage));
        assert_eq!(VisualizeMode::parse("debug"), Some(VisualizeMode::Surfels));
        assert_eq!(VisualizeMode::parse("bogus"), None);
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gi.json");

        let mut config = GiConfig::default();
        config.max_surfels = 4096;
        config.visualize = VisualizeMode::Irradiance;
        config.blur.radius = 8;
        config.save(&path).unwrap();

        let loaded = GiConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "max_surfels": 2048, "grid": { "dimension": 16 } }"#).unwrap();

        let loaded = GiConfig::load(&path).unwrap();
        assert_eq!(loaded.max_surfels, 2048);
        assert_eq!(loaded.grid.dimension, 16);
        assert_eq!(loaded.grid.world_size, 20.0);
        assert_eq!(loaded.spawn_chance, 0.25);
    }
}
