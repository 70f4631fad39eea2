//! GPU orchestration of the surfel GI frame.
//!
//! Owns the surfel pool, the world structure and every stage, and records
//! one frame as a fixed sequence of compute passes:
//!
//! clear frame counters -> coverage -> spawn (indirect) -> grid rebuild
//! (count, scan, scatter, chunks) -> flip -> irradiance (indirect) ->
//! resolve -> blur -> composite
//!
//! Nothing in the frame path reads GPU state back to the CPU.

use crate::core::camera::Camera;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::render::readback;
use crate::render::texture::GBuffer;
use crate::render::{GiTimings, GpuProfiler};
use crate::scene::buffer::SceneBuffer;
use super::common::{self, CommonResources};
use super::config::{GiConfig, VisualizeMode};
use super::coverage::CoverageStage;
use super::data::{candidate_capacity, GiCounters, GiUniforms, Surfel, WorldStructureChunk};
use super::grid::{WorldGrid, WorldStructure};
use super::irradiance::IrradianceStage;
use super::pool::SurfelPool;
use super::random::frame_seed;
use super::resolve::ResolveStage;
use super::spawn::SpawnStage;

/// Per-frame inputs from the host renderer
#[derive(Clone, Copy, Debug)]
pub struct FrameInput<'a> {
    pub camera: &'a Camera,
    /// Seconds since start, mixed into the seed for time-driven updates
    pub time: f32,
}

/// Pool and grid statistics
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GiStats {
    pub frame_index: u64,
    pub counters: GiCounters,
    pub max_surfels: u32,
    pub surfel_memory_bytes: u64,
    pub grid_memory_bytes: u64,
    pub grid_dimension: u32,
}

impl GiStats {
    pub fn surfel_memory_mb(&self) -> f32 {
        self.surfel_memory_bytes as f32 / (1024.0 * 1024.0)
    }
}

/// Reject a surfel pool larger than `limits` can allocate or bind as storage
pub fn check_device_limits(config: &GiConfig, limits: &wgpu::Limits) -> Result<()> {
    let bytes = config.max_surfels as u64 * std::mem::size_of::<Surfel>() as u64;
    let allowed = limits.max_buffer_size.min(u64::from(limits.max_storage_buffer_binding_size));
    if bytes > allowed {
        return Err(Error::Config(format!(
            "{} surfels need a {} byte pool, device allows {} bytes",
            config.max_surfels, bytes, allowed
        )));
    }
    Ok(())
}

/// Buffers whose size depends on `max_surfels` or the grid
struct Storage {
    pool: SurfelPool,
    world: WorldStructure,
    /// Group 0 bind groups, indexed by the index-list slot they read
    common: [wgpu::BindGroup; 2],
}

impl Storage {
    fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        config: &GiConfig,
        size: (u32, u32),
        common_layout: &wgpu::BindGroupLayout,
        uniforms: &wgpu::Buffer,
    ) -> Self {
        let grid = WorldGrid::from_config(&config.grid);
        let pool = SurfelPool::new(device, config.max_surfels, candidate_capacity(size.0, size.1));
        let world = WorldStructure::new(device, queue, grid, config.max_surfels, common_layout);
        let common = [0, 1].map(|slot| {
            common::common_bind_group(device, common_layout, &CommonResources {
                uniforms,
                surfels: pool.surfels(),
                counters: pool.counters(),
                chunks: world.chunks_buffer(),
                index_list: world.index_list(slot),
            })
        });
        Self { pool, world, common }
    }
}

/// Surfel GI on wgpu compute
pub struct GlobalIllumination {
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: GiConfig,
    size: (u32, u32),
    frame_index: u64,
    common_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    storage: Storage,
    coverage: CoverageStage,
    spawn: SpawnStage,
    irradiance: IrradianceStage,
    resolve: ResolveStage,
    profiler: Option<GpuProfiler>,
}

impl GlobalIllumination {
    /// Validate `config` and allocate every GPU resource for a `width` x `height` screen
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, config: GiConfig, width: u32, height: u32) -> Result<Self> {
        config.validate()?;
        check_device_limits(&config, &device.limits())?;
        let size = (width, height);

        let common_layout = common::common_layout(device);
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gi_uniforms"),
            size: std::mem::size_of::<GiUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let storage = Storage::new(device, queue, &config, size, &common_layout, &uniform_buffer);

        log::info!(
            "Surfel GI initialised: {}x{}, {} max surfels, grid {}^3 over {} units",
            width,
            height,
            config.max_surfels,
            config.grid.dimension,
            config.grid.world_size
        );

        Ok(Self {
            coverage: CoverageStage::new(device, &common_layout, size),
            spawn: SpawnStage::new(device, &common_layout),
            irradiance: IrradianceStage::new(device, &common_layout),
            resolve: ResolveStage::new(device, &common_layout, size),
            profiler: GpuProfiler::new(device, queue),
            device: device.clone(),
            queue: queue.clone(),
            config,
            size,
            frame_index: 0,
            common_layout,
            uniform_buffer,
            storage,
        })
    }

    /// Resize screen-dependent resources (candidates, output textures)
    pub fn initialize(&mut self, width: u32, height: u32) {
        let size = (width, height);
        if size == self.size {
            return;
        }
        self.storage.pool.resize_candidates(&self.device, candidate_capacity(width, height));
        self.coverage.resize(&self.device, size);
        self.resolve.resize(&self.device, size);
        self.size = size;
        log::info!("Surfel GI resized to {}x{}", width, height);
    }

    /// Empty the pool and grid; surfels respawn from scratch
    pub fn reset_gi(&mut self) {
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("gi_reset"),
        });
        self.storage.pool.reset(&mut encoder);
        self.storage.world.reset(&mut encoder);
        self.queue.submit(std::iter::once(encoder.finish()));
        self.frame_index = 0;
        log::info!("Surfel GI reset");
    }

    /// Apply a new configuration. Pool or grid changes reallocate storage
    /// (a full reset); anything else takes effect next frame.
    pub fn set_config(&mut self, config: GiConfig) -> Result<()> {
        config.validate()?;
        check_device_limits(&config, &self.device.limits())?;
        if self.config.requires_reset(&config) {
            log::info!(
                "Reallocating surfel storage: {} -> {} surfels, grid {}^3 -> {}^3",
                self.config.max_surfels,
                config.max_surfels,
                self.config.grid.dimension,
                config.grid.dimension
            );
            self.storage = Storage::new(
                &self.device,
                &self.queue,
                &config,
                self.size,
                &self.common_layout,
                &self.uniform_buffer,
            );
            self.frame_index = 0;
        }
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &GiConfig {
        &self.config
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Record one GI frame into `encoder`. Submit it before the next call:
    /// uniforms are written through `queue` at submission time.
    pub fn generate_gi_map(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        queue: &wgpu::Queue,
        input: &FrameInput<'_>,
        gbuffer: &GBuffer,
        scene: &SceneBuffer,
    ) -> Result<()> {
        let (width, height) = gbuffer.size();
        if width == 0 || height == 0 {
            return Err(Error::Config("G-buffer has zero size".into()));
        }
        self.initialize(width, height);

        let frame = self.frame_index as u32;
        let seed = frame_seed(frame, input.time, self.config.time_driven_updates);
        let uniforms = GiUniforms::new(input.camera, self.storage.world.grid(), &self.config, self.size, frame, seed);
        queue.write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
        self.resolve.update_blur(queue, &self.config.blur);

        let device = &self.device;
        let profiler = self.profiler.as_ref();
        let storage = &mut self.storage;

        storage.pool.clear_frame_counters(encoder);

        let read = &storage.common[storage.world.current()];
        self.coverage.record(device, encoder, read, gbuffer, &storage.pool, profiler);
        self.spawn.record(device, encoder, read, gbuffer, &storage.pool, profiler);
        storage.world.record_rebuild(encoder, read, storage.pool.indirect_args(), profiler);
        storage.world.flip();

        let read = &storage.common[storage.world.current()];
        self.irradiance
            .record(device, encoder, read, scene, &storage.pool, self.config.multi_bounce, profiler);
        self.resolve.record(device, encoder, read, gbuffer, self.config.blur.enabled, profiler);

        if let Some(profiler) = profiler {
            profiler.resolve(encoder);
        }

        log::debug!("Recorded GI frame {} (seed {:#010x})", self.frame_index, seed);
        self.frame_index += 1;
        Ok(())
    }

    /// Texture selected by the visualisation mode
    pub fn output_texture(&self) -> &wgpu::Texture {
        match self.config.visualize {
            VisualizeMode::GiMap | VisualizeMode::None => self.resolve.gi_map_texture(),
            VisualizeMode::Coverage => self.coverage.texture(),
            VisualizeMode::Irradiance => self.resolve.irradiance_texture(),
            VisualizeMode::Surfels => self.resolve.debug_texture(),
        }
    }

    pub fn output_view(&self) -> &wgpu::TextureView {
        match self.config.visualize {
            VisualizeMode::GiMap | VisualizeMode::None => self.resolve.gi_map_view(),
            VisualizeMode::Coverage => self.coverage.view(),
            VisualizeMode::Irradiance => self.resolve.irradiance_view(),
            VisualizeMode::Surfels => self.resolve.debug_view(),
        }
    }

    /// Read back the selected output as RGBA8 (blocks)
    pub fn read_output_rgba8(&self) -> Result<Vec<u8>> {
        readback::read_texture_rgba8(&self.device, &self.queue, self.output_texture())
    }

    /// Read back the global counters (blocks)
    pub fn read_counters(&self) -> Result<GiCounters> {
        readback::read_buffer::<GiCounters>(&self.device, &self.queue, self.storage.pool.counters(), 0, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Readback("empty counter readback".into()))
    }

    /// Read back every cell's {start, count} record (blocks)
    pub fn read_chunks(&self) -> Result<Vec<WorldStructureChunk>> {
        let cells = self.storage.world.grid().total_cells() as u64;
        readback::read_buffer(&self.device, &self.queue, self.storage.world.chunks_buffer(), 0, cells)
    }

    /// Read back the first `len` entries of one index-list slot (blocks)
    pub fn read_index_list(&self, slot: usize, len: u32) -> Result<Vec<u32>> {
        readback::read_buffer(&self.device, &self.queue, self.storage.world.index_list(slot), 0, len as u64)
    }

    /// Read back the live surfels (blocks)
    pub fn read_surfels(&self) -> Result<Vec<Surfel>> {
        let count = self.read_counters()?.surfel_count;
        readback::read_buffer(&self.device, &self.queue, self.storage.pool.surfels(), 0, count as u64)
    }

    /// Current statistics (blocks on a counter readback)
    pub fn stats(&self) -> Result<GiStats> {
        Ok(GiStats {
            frame_index: self.frame_index,
            counters: self.read_counters()?,
            max_surfels: self.config.max_surfels,
            surfel_memory_bytes: self.storage.pool.memory_bytes(),
            grid_memory_bytes: self.storage.world.memory_bytes(),
            grid_dimension: self.config.grid.dimension,
        })
    }

    /// Collect the last submitted frame's stage timings (blocks)
    pub fn read_timings(&mut self) -> Option<GiTimings> {
        let profiler = self.profiler.as_mut()?;
        profiler.read_results(&self.device);
        Some(profiler.latest_timings())
    }

    pub fn profiler(&self) -> Option<&GpuProfiler> {
        self.profiler.as_ref()
    }

    pub fn set_profiling(&mut self, enabled: bool) {
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.set_enabled(enabled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::core::types::Vec3;
    use crate::gi::data::SurfelIrradiance;
    use crate::gi::estimator;
    use crate::gi::grid::HostWorldStructure;
    use crate::gi::irradiance::accumulate;
    use crate::gi::random::hash_color;
    use crate::gi::scan;
    use crate::render::texture::GBufferImage;
    use crate::render::GpuContext;
    use crate::scene::config::SceneConfig;
    use crate::scene::primitives::{Material, Scene};

    fn uncovered_wall(width: u32, height: u32) -> GBufferImage {
        let mut image = GBufferImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                image.set(x, y, 4.0, Vec3::Z, Vec3::splat(0.8));
            }
        }
        image
    }

    fn run_frame(gpu: &GpuContext, gi: &mut GlobalIllumination, gbuffer: &GBuffer, scene: &SceneBuffer, camera: &Camera) {
        let mut encoder = gpu.device.create_command_encoder(&Default::default());
        gi.generate_gi_map(&mut encoder, &gpu.queue, &FrameInput { camera, time: 0.0 }, gbuffer, scene)
            .unwrap();
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }

    #[test]
    fn test_gpu_spawn_and_reset() {
        let Ok(gpu) = GpuContext::headless() else {
            log::warn!("No GPU adapter, skipping");
            return;
        };
        let config = GiConfig {
            max_surfels: 1024,
            spawn_chance: 1.0,
            ..Default::default()
        };
        let mut gi = GlobalIllumination::new(&gpu.device, &gpu.queue, config, 256, 256).unwrap();
        let gbuffer = GBuffer::from_image(&gpu.device, &gpu.queue, &uncovered_wall(256, 256));
        let scene = Scene::new(SceneConfig::default());
        let layout = SceneBuffer::create_bind_group_layout(&gpu.device);
        let scene_buffer = SceneBuffer::new(&gpu.device, &gpu.queue, &layout, &scene);
        let camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), 60.0, 1.0);

        run_frame(&gpu, &mut gi, &gbuffer, &scene_buffer, &camera);

        let counters = gi.read_counters().unwrap();
        assert_eq!(counters.surfel_count, 256);
        assert_eq!(counters.spawned, 256);
        let chunks = gi.read_chunks().unwrap();
        assert_eq!(chunks.iter().map(|c| c.count).sum::<u32>(), 256);

        gi.reset_gi();
        assert_eq!(gi.read_counters().unwrap(), GiCounters::default());
        assert!(gi.read_chunks().unwrap().iter().all(|c| *c == WorldStructureChunk::default()));
        assert!(gi.read_index_list(0, 256).unwrap().iter().all(|&i| i == 0));
        assert!(gi.read_index_list(1, 256).unwrap().iter().all(|&i| i == 0));
    }

    #[test]
    fn test_gpu_pool_never_exceeds_capacity() {
        let Ok(gpu) = GpuContext::headless() else {
            log::warn!("No GPU adapter, skipping");
            return;
        };
        let config = GiConfig { max_surfels: 100, spawn_chance: 1.0, ..Default::default() };
        let mut gi = GlobalIllumination::new(&gpu.device, &gpu.queue, config, 256, 256).unwrap();
        let gbuffer = GBuffer::from_image(&gpu.device, &gpu.queue, &uncovered_wall(256, 256));
        let layout = SceneBuffer::create_bind_group_layout(&gpu.device);
        let scene_buffer = SceneBuffer::new(&gpu.device, &gpu.queue, &layout, &Scene::new(SceneConfig::default()));
        let camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), 60.0, 1.0);

        for _ in 0..3 {
            run_frame(&gpu, &mut gi, &gbuffer, &scene_buffer, &camera);
            assert!(gi.read_counters().unwrap().surfel_count <= 100);
        }
        let stats = gi.stats().unwrap();
        assert_eq!(stats.counters.surfel_count, 100);
        assert_eq!(stats.frame_index, 3);
        assert_eq!(gi.read_surfels().unwrap().len(), 100);
    }

    fn scene_buffer(gpu: &GpuContext, scene: &Scene) -> SceneBuffer {
        let layout = SceneBuffer::create_bind_group_layout(&gpu.device);
        SceneBuffer::new(&gpu.device, &gpu.queue, &layout, scene)
    }

    /// Place `surfels` in the pool directly, bypassing spawn
    fn upload_surfels(gpu: &GpuContext, gi: &GlobalIllumination, surfels: &[Surfel]) {
        gpu.queue.write_buffer(gi.storage.pool.surfels(), 0, bytemuck::cast_slice(surfels));
        let counters = GiCounters { surfel_count: surfels.len() as u32, ..Default::default() };
        gpu.queue.write_buffer(gi.storage.pool.counters(), 0, bytemuck::bytes_of(&counters));
    }

    /// Surfels on the inside of a sphere, facing its centre
    fn sphere_shell(count: u32, radius: f32) -> Vec<Surfel> {
        let golden = std::f32::consts::PI * (3.0 - 5f32.sqrt());
        (0..count)
            .map(|i| {
                let y = 1.0 - 2.0 * (i as f32 + 0.5) / count as f32;
                let r = (1.0 - y * y).sqrt();
                let phi = golden * i as f32;
                let dir = Vec3::new(r * phi.cos(), y, r * phi.sin());
                let mut surfel = Surfel::new(dir * (radius - 0.01), -dir);
                let mean = hash_color(i);
                surfel.irradiance = SurfelIrradiance {
                    mean: mean.to_array(),
                    short_mean: mean.to_array(),
                    blend_rate: 0.5,
                    variance: [0.01; 3],
                    inconsistency: 0.1,
                };
                surfel
            })
            .collect()
    }

    fn assert_close(a: [f32; 3], b: [f32; 3], what: &str) {
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() <= 1e-3 * y.abs().max(1.0), "{what}: {a:?} vs {b:?}");
        }
    }

    fn assert_estimator_close(gpu: &SurfelIrradiance, host: &SurfelIrradiance) {
        assert_close(gpu.mean, host.mean, "mean");
        assert_close(gpu.short_mean, host.short_mean, "short_mean");
        assert_close(gpu.variance, host.variance, "variance");
        assert!((gpu.blend_rate - host.blend_rate).abs() < 1e-3, "{} vs {}", gpu.blend_rate, host.blend_rate);
        assert!((gpu.inconsistency - host.inconsistency).abs() < 1e-3 * host.inconsistency.max(1.0));
    }

    #[test]
    fn test_device_limits_bound_the_pool() {
        let limits = wgpu::Limits { max_storage_buffer_binding_size: 1 << 20, ..Default::default() };
        let small = GiConfig { max_surfels: 1024, ..Default::default() };
        check_device_limits(&small, &limits).unwrap();
        let large = GiConfig { max_surfels: 1 << 20, ..Default::default() };
        assert!(matches!(check_device_limits(&large, &limits), Err(Error::Config(_))));

        let limits = wgpu::Limits { max_buffer_size: 4096, ..Default::default() };
        assert!(check_device_limits(&small, &limits).is_err());
    }

    #[test]
    fn test_gpu_rejects_oversized_pool() {
        let Ok(gpu) = GpuContext::headless() else {
            log::warn!("No GPU adapter, skipping");
            return;
        };
        let config = GiConfig { max_surfels: 1024, ..Default::default() };
        let mut gi = GlobalIllumination::new(&gpu.device, &gpu.queue, config.clone(), 64, 64).unwrap();

        let oversized = GiConfig { max_surfels: 100_000_000, ..config.clone() };
        assert!(gi.set_config(oversized.clone()).is_err());
        assert_eq!(gi.config().max_surfels, 1024);
        assert!(GlobalIllumination::new(&gpu.device, &gpu.queue, oversized, 64, 64).is_err());
    }

    #[test]
    fn test_gpu_estimator_matches_host_update() {
        let Ok(gpu) = GpuContext::headless() else {
            log::warn!("No GPU adapter, skipping");
            return;
        };
        let config = GiConfig { max_surfels: 16, multi_bounce: false, ..Default::default() };
        let mut gi = GlobalIllumination::new(&gpu.device, &gpu.queue, config, 64, 64).unwrap();
        let gbuffer = GBuffer::from_image(&gpu.device, &gpu.queue, &GBufferImage::new(64, 64));
        let mut scene = Scene::new(SceneConfig::default());
        scene.add_sphere(Vec3::ZERO, 5.0, Material::emissive(Vec3::new(2.0, 1.0, 0.5)));
        let scene_buffer = scene_buffer(&gpu, &scene);
        let camera = Camera::new(Vec3::new(0.0, 0.0, 3.0), 60.0, 1.0);

        let surfel = Surfel::new(Vec3::new(0.0, -1.0, 0.0), Vec3::Y);
        upload_surfels(&gpu, &gi, &[surfel]);

        // Every ray ends on the emitter, so each frame folds in exactly its emission
        let mut expected = surfel.irradiance;
        for _ in 0..8 {
            run_frame(&gpu, &mut gi, &gbuffer, &scene_buffer, &camera);
            expected = estimator::update(expected, Vec3::new(2.0, 1.0, 0.5));
        }

        let surfels = gi.read_surfels().unwrap();
        assert_eq!(surfels.len(), 1);
        assert_eq!(surfels[0].position, surfel.position);
        assert_eq!(surfels[0].normal, surfel.normal);
        assert_estimator_close(&surfels[0].irradiance, &expected);
    }

    #[test]
    fn test_gpu_multi_bounce_reads_frame_start_means() {
        let Ok(gpu) = GpuContext::headless() else {
            log::warn!("No GPU adapter, skipping");
            return;
        };
        let config = GiConfig {
            max_surfels: 512,
            multi_bounce: true,
            surfel_radius: 0.5,
            ray_budget: 256 * 4,
            ..Default::default()
        };
        let mut gi = GlobalIllumination::new(&gpu.device, &gpu.queue, config.clone(), 64, 64).unwrap();
        let gbuffer = GBuffer::from_image(&gpu.device, &gpu.queue, &GBufferImage::new(64, 64));
        let mut scene = Scene::new(SceneConfig::default());
        scene.add_sphere(Vec3::ZERO, 2.0, Material::diffuse(Vec3::ONE));
        let scene_buffer = scene_buffer(&gpu, &scene);
        let camera = Camera::new(Vec3::ZERO, 60.0, 1.0);

        let start = sphere_shell(256, 2.0);
        upload_surfels(&gpu, &gi, &start);
        run_frame(&gpu, &mut gi, &gbuffer, &scene_buffer, &camera);
        let gpu_surfels = gi.read_surfels().unwrap();

        // The host pass samples every neighbour from the pre-update state
        let mut host_surfels = start.clone();
        let mut world = HostWorldStructure::new(*gi.storage.world.grid());
        world.rebuild(&host_surfels);
        let seed = frame_seed(0, 0.0, config.time_driven_updates);
        assert_eq!(accumulate(&mut host_surfels, &world, &scene, &config, 0, seed), 256);

        for (gpu_surfel, host_surfel) in gpu_surfels.iter().zip(&host_surfels) {
            assert_eq!(gpu_surfel.position, host_surfel.position);
            assert_estimator_close(&gpu_surfel.irradiance, &host_surfel.irradiance);
        }
    }

    #[test]
    fn test_gpu_rebuild_matches_host_and_is_idempotent() {
        let Ok(gpu) = GpuContext::headless() else {
            log::warn!("No GPU adapter, skipping");
            return;
        };
        let config = GiConfig { max_surfels: 1024, spawn_chance: 1.0, ..Default::default() };
        let mut gi = GlobalIllumination::new(&gpu.device, &gpu.queue, config.clone(), 256, 256).unwrap();
        let gbuffer = GBuffer::from_image(&gpu.device, &gpu.queue, &uncovered_wall(256, 256));
        let scene_buffer = scene_buffer(&gpu, &Scene::new(SceneConfig::default()));
        let camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), 60.0, 1.0);

        run_frame(&gpu, &mut gi, &gbuffer, &scene_buffer, &camera);
        let surfels = gi.read_surfels().unwrap();
        assert!(!surfels.is_empty());

        let mut host = HostWorldStructure::new(*gi.storage.world.grid());
        host.rebuild(&surfels);

        let cell_runs = |gi: &GlobalIllumination| -> (Vec<WorldStructureChunk>, Vec<HashSet<u32>>) {
            let chunks = gi.read_chunks().unwrap();
            let list = gi.read_index_list(gi.storage.world.current(), surfels.len() as u32).unwrap();
            let runs = chunks
                .iter()
                .map(|c| list[c.start as usize..(c.start + c.count) as usize].iter().copied().collect())
                .collect();
            (chunks, runs)
        };

        let (first_chunks, first_runs) = cell_runs(&gi);
        assert_eq!(first_chunks, host.chunks());
        for (cell, run) in first_runs.iter().enumerate() {
            let expected: HashSet<u32> = host.cell_run(cell as u32).iter().copied().collect();
            assert_eq!(*run, expected, "cell {cell}");
        }

        // Same surfels, second rebuild into the other index list
        let first_slot = gi.storage.world.current();
        gi.set_config(GiConfig { spawn_chance: 0.0, ..config }).unwrap();
        run_frame(&gpu, &mut gi, &gbuffer, &scene_buffer, &camera);
        assert_eq!(gi.read_counters().unwrap().surfel_count as usize, surfels.len());
        assert_ne!(gi.storage.world.current(), first_slot);

        let (second_chunks, second_runs) = cell_runs(&gi);
        assert_eq!(second_chunks, first_chunks);
        assert_eq!(second_runs, first_runs);
    }

    #[test]
    fn test_gpu_stats_count_every_buffer() {
        let Ok(gpu) = GpuContext::headless() else {
            log::warn!("No GPU adapter, skipping");
            return;
        };
        let config = GiConfig { max_surfels: 1000, ..Default::default() };
        let gi = GlobalIllumination::new(&gpu.device, &gpu.queue, config, 64, 64).unwrap();
        let stats = gi.stats().unwrap();

        assert_eq!(stats.surfel_memory_bytes, 1000 * (68 + 16));
        let cells = gi.storage.world.grid().total_cells();
        let padded = scan::padded_len(cells) as u64;
        assert_eq!(stats.grid_memory_bytes, padded * 4 * 3 + cells as u64 * 8 + 1000 * 4 * 2);
    }
}
