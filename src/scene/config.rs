//! Lighting configuration for test scenes

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Sun and sky parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// Time of day (0.0-24.0 hours)
    pub time_of_day: f32,
    /// Sun irradiance multiplier
    pub sun_intensity: f32,
    pub sun_color: [f32; 3],
    /// Radiance returned by rays that escape the scene
    pub sky_color: [f32; 3],
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            time_of_day: 10.0,     // Morning
            sun_intensity: 3.0,
            sun_color: [1.0, 0.95, 0.85],
            sky_color: [0.35, 0.45, 0.6],
        }
    }
}

impl SceneConfig {
    /// Direction towards the sun for the configured time of day
    pub fn sun_direction(&self) -> Vec3 {
        // Sun rises at 6:00, peaks at 12:00, sets at 18:00
        let hour_angle = (self.time_of_day - 12.0) * 15.0_f32.to_radians();
        let altitude = (90.0 - (self.time_of_day - 12.0).abs() * 7.5).to_radians();

        Vec3::new(
            hour_angle.sin() * altitude.cos(),
            altitude.sin().max(0.1), // Keep sun above horizon
            hour_angle.cos() * altitude.cos(),
        ).normalize()
    }

    pub fn sun_color(&self) -> Vec3 {
        Vec3::from_array(self.sun_color)
    }

    pub fn sky_color(&self) -> Vec3 {
        Vec3::from_array(self.sky_color)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noon_sun_is_overhead() {
        let config = SceneConfig { time_of_day: 12.0, ..Default::default() };
        let dir = config.sun_direction();
        assert!(dir.y > 0.99);
    }

    #[test]
    fn test_sun_stays_above_horizon() {
        for hour in [0.0, 5.0, 6.0, 18.0, 23.0] {
            let config = SceneConfig { time_of_day: hour, ..Default::default() };
            let dir = config.sun_direction();
            assert!(dir.y > 0.0, "hour {} gives {:?}", hour, dir);
            assert!((dir.length() - 1.0).abs() < 1e-5);
        }
    }
}
