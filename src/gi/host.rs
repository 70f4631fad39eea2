//! CPU mirror of the GI frame. Runs the same stage sequence as
//! `GlobalIllumination` over a `GBufferImage`, using rayon and real atomics.

use crate::core::types::{Result, Vec3};
use crate::render::readback;
use crate::render::texture::GBufferImage;
use crate::scene::primitives::SceneTracer;
use super::config::{GiConfig, VisualizeMode};
use super::coverage;
use super::data::GiCounters;
use super::grid::{HostWorldStructure, WorldGrid};
use super::irradiance;
use super::pool::HostSurfelPool;
use super::random::frame_seed;
use super::resolve;
use super::spawn;
use super::system::{FrameInput, GiStats};

/// Images produced by one host frame (row-major, linear RGB)
#[derive(Clone, Debug, Default)]
pub struct HostFrame {
    pub width: u32,
    pub height: u32,
    pub coverage: Vec<Vec3>,
    pub irradiance: Vec<Vec3>,
    pub debug: Vec<Vec3>,
    pub gi_map: Vec<Vec3>,
}

impl HostFrame {
    pub fn output(&self, mode: VisualizeMode) -> &[Vec3] {
        match mode {
            VisualizeMode::GiMap | VisualizeMode::None => &self.gi_map,
            VisualizeMode::Coverage => &self.coverage,
            VisualizeMode::Irradiance => &self.irradiance,
            VisualizeMode::Surfels => &self.debug,
        }
    }

    pub fn to_rgba8(&self, mode: VisualizeMode) -> Vec<u8> {
        readback::rgb_to_rgba8(self.output(mode))
    }

    pub fn write_png(&self, path: &std::path::Path, mode: VisualizeMode) -> Result<()> {
        readback::write_png(path, &self.to_rgba8(mode), self.width, self.height)
    }
}

/// Surfel GI on the CPU
pub struct HostGi {
    config: GiConfig,
    pool: HostSurfelPool,
    world: HostWorldStructure,
    frame_index: u64,
}

impl HostGi {
    pub fn new(config: GiConfig) -> Result<Self> {
        config.validate()?;
        let world = HostWorldStructure::new(WorldGrid::from_config(&config.grid));
        let pool = HostSurfelPool::new(config.max_surfels);
        log::info!(
            "Host surfel GI: {} max surfels ({:.2} MB), grid {}^3",
            config.max_surfels,
            pool.memory_bytes() as f64 / (1024.0 * 1024.0),
            config.grid.dimension
        );
        Ok(Self {
            pool,
            world,
            config,
            frame_index: 0,
        })
    }

    pub fn config(&self) -> &GiConfig {
        &self.config
    }

    pub fn pool(&self) -> &HostSurfelPool {
        &self.pool
    }

    pub fn world(&self) -> &HostWorldStructure {
        &self.world
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn counters(&self) -> GiCounters {
        self.pool.counters()
    }

    pub fn stats(&self) -> GiStats {
        GiStats {
            frame_index: self.frame_index,
            counters: self.pool.counters(),
            max_surfels: self.config.max_surfels,
            surfel_memory_bytes: self.pool.memory_bytes(),
            grid_memory_bytes: self.world.memory_bytes(),
            grid_dimension: self.config.grid.dimension,
        }
    }

    pub fn reset_gi(&mut self) {
        self.pool.reset();
        self.world.reset();
        self.frame_index = 0;
        log::info!("Host surfel GI reset");
    }

    /// Same reset rules as `GlobalIllumination::set_config`
    pub fn set_config(&mut self, config: GiConfig) -> Result<()> {
        config.validate()?;
        if self.config.requires_reset(&config) {
            self.pool = HostSurfelPool::new(config.max_surfels);
            self.world = HostWorldStructure::new(WorldGrid::from_config(&config.grid));
            self.frame_index = 0;
        }
        self.config = config;
        Ok(())
    }

    /// Run one full frame
    pub fn generate_gi_map(&mut self, input: &FrameInput<'_>, gbuffer: &GBufferImage, scene: &dyn SceneTracer) -> HostFrame {
        let frame = self.frame_index as u32;
        let seed = frame_seed(frame, input.time, self.config.time_driven_updates);
        let camera = input.camera;
        let size = (gbuffer.width, gbuffer.height);

        self.pool.clear_frame_counters();

        let coverage = coverage::estimate_coverage(gbuffer, camera, &self.world, &self.pool, &self.config, seed);
        let grid = *self.world.grid();
        spawn::spawn_candidates(&mut self.pool, &coverage.candidates, gbuffer, camera, &grid);
        self.world.rebuild(self.pool.surfels());

        irradiance::accumulate(self.pool.surfels_mut(), &self.world, scene, &self.config, frame, seed);

        let resolved = resolve::resolve(gbuffer, camera, &self.world, self.pool.surfels(), &self.config);
        let irradiance = if self.config.blur.enabled {
            resolve::blur(&resolved.irradiance, &gbuffer.depth, size, &self.config.blur)
        } else {
            resolved.irradiance
        };
        let gi_map = resolve::composite(&gbuffer.albedo, &irradiance, &self.config);

        let counters = self.pool.counters();
        log::debug!(
            "Host GI frame {}: {} surfels, {} candidates, {} spawned, {} dropped",
            self.frame_index,
            counters.surfel_count,
            counters.candidate_count,
            counters.spawned,
            counters.dropped_spawns
        );
        self.frame_index += 1;

        HostFrame {
            width: gbuffer.width,
            height: gbuffer.height,
            coverage: coverage.heatmap,
            irradiance,
            debug: resolved.debug,
            gi_map,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::camera::Camera;
    use crate::gi::data::WorldStructureChunk;
    use crate::scene::config::SceneConfig;
    use crate::scene::primitives::Scene;
    use crate::scene::raycast::render_gbuffer;

    /// Fully visible wall at z = 1, every pixel inside the default world cube
    fn uncovered_wall(width: u32, height: u32) -> GBufferImage {
        let mut image = GBufferImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                image.set(x, y, 4.0, Vec3::Z, Vec3::splat(0.8));
            }
        }
        image
    }

    fn wall_camera() -> Camera {
        Camera::new(Vec3::new(0.0, 0.0, 5.0), 60.0, 1.0)
    }

    fn spawn_config(max_surfels: u32) -> GiConfig {
        GiConfig {
            max_surfels,
            spawn_chance: 1.0,
            time_driven_updates: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_frame_spawns_one_surfel_per_tile() {
        let mut gi = HostGi::new(spawn_config(1024)).unwrap();
        assert_eq!(gi.config().grid.dimension, 32);
        assert_eq!(gi.config().grid.world_size, 20.0);

        let camera = wall_camera();
        let scene = Scene::new(SceneConfig::default());
        gi.generate_gi_map(&FrameInput { camera: &camera, time: 0.0 }, &uncovered_wall(256, 256), &scene);

        let counters = gi.counters();
        assert_eq!(counters.surfel_count, 256);
        assert_eq!(counters.spawned, 256);
        assert_eq!(counters.candidate_count, 256);
        assert_eq!(counters.dropped_spawns, 0);
        assert_eq!(gi.world().chunks().iter().map(|c| c.count).sum::<u32>(), 256);
        assert_eq!(gi.world().index_list().len(), 256);
    }

    #[test]
    fn test_reset_clears_pool_and_grid() {
        let mut gi = HostGi::new(spawn_config(1024)).unwrap();
        let camera = wall_camera();
        let scene = Scene::new(SceneConfig::default());
        let gbuffer = uncovered_wall(256, 256);
        for time in 0..2 {
            gi.generate_gi_map(&FrameInput { camera: &camera, time: time as f32 }, &gbuffer, &scene);
        }
        assert!(gi.counters().surfel_count >= 256);

        gi.reset_gi();
        assert_eq!(gi.counters(), GiCounters::default());
        assert_eq!(gi.frame_index(), 0);
        assert!(gi.world().chunks().iter().all(|c| *c == WorldStructureChunk::default()));
        assert!(gi.world().index_list_slot(0).is_empty());
        assert!(gi.world().index_list_slot(1).is_empty());
        assert!(gi.pool().surfels().is_empty());
    }

    #[test]
    fn test_pool_saturates_without_error() {
        let mut gi = HostGi::new(spawn_config(100)).unwrap();
        let camera = wall_camera();
        let scene = Scene::new(SceneConfig::default());
        let frame = gi.generate_gi_map(&FrameInput { camera: &camera, time: 0.0 }, &uncovered_wall(256, 256), &scene);

        let counters = gi.counters();
        assert_eq!(counters.surfel_count, 100);
        assert_eq!(counters.spawned, 100);
        assert_eq!(counters.dropped_spawns, 156);
        assert_eq!(frame.gi_map.len(), 256 * 256);
    }

    #[test]
    fn test_cornell_box_accumulates_light() {
        let config = GiConfig {
            max_surfels: 4096,
            spawn_chance: 1.0,
            ..Default::default()
        };
        let mut gi = HostGi::new(config).unwrap();
        let scene = Scene::cornell_box(SceneConfig::default());
        let camera = Camera::look_at(Vec3::new(0.0, 0.0, 11.0), Vec3::ZERO, Vec3::Y);
        let gbuffer = render_gbuffer(&scene, &camera, 64, 64);

        let mut last_count = 0;
        let mut frame = HostFrame::default();
        for i in 0..20 {
            frame = gi.generate_gi_map(&FrameInput { camera: &camera, time: i as f32 / 60.0 }, &gbuffer, &scene);
            let count = gi.counters().surfel_count;
            assert!(count >= last_count && count <= 4096);
            last_count = count;
        }
        assert!(last_count > 16);

        // Every live surfel sits in the cell whose run holds it
        let world = gi.world();
        let surfels = gi.pool().surfels();
        for cell in 0..world.grid().total_cells() {
            for &index in world.cell_run(cell) {
                assert_eq!(world.grid().cell_index(surfels[index as usize].position()), Some(cell));
            }
        }

        assert!(frame.gi_map.iter().any(|c| c.max_element() > 0.0));
        assert!(frame.debug.iter().any(|c| *c != Vec3::ZERO));
        assert_eq!(frame.output(VisualizeMode::Irradiance).len(), 64 * 64);
    }

    #[test]
    fn test_set_config_resets_only_for_storage_changes() {
        let mut gi = HostGi::new(spawn_config(1024)).unwrap();
        let camera = wall_camera();
        let scene = Scene::new(SceneConfig::default());
        gi.generate_gi_map(&FrameInput { camera: &camera, time: 0.0 }, &uncovered_wall(64, 64), &scene);
        assert_eq!(gi.counters().surfel_count, 16);

        gi.set_config(GiConfig { spawn_chance: 0.5, ..spawn_config(1024) }).unwrap();
        assert_eq!(gi.counters().surfel_count, 16);

        gi.set_config(spawn_config(2048)).unwrap();
        assert_eq!(gi.counters().surfel_count, 0);
        assert_eq!(gi.stats().max_surfels, 2048);
        assert_eq!(gi.stats().surfel_memory_bytes, 2048 * 68);

        assert!(gi.set_config(GiConfig { spawn_chance: 2.0, ..Default::default() }).is_err());
    }
}
