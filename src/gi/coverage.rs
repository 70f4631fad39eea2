//! Coverage estimation and spawn candidate selection.
//!
//! Every 16x16 screen tile finds its least-covered pixel. If that pixel's
//! coverage is under the threshold and the tile wins its per-frame random
//! draw, the pixel becomes a spawn candidate.

use rayon::prelude::*;

use crate::core::camera::Camera;
use crate::core::types::{Vec2, Vec3};
use crate::render::layout;
use crate::render::texture::{GBuffer, GBufferImage};
use crate::render::{GiStage, GpuProfiler, StageSpan};
use super::common;
use super::config::GiConfig;
use super::data::{candidate_capacity, SpawnCandidate, Surfel, TILE_SIZE};
use super::grid::HostWorldStructure;
use super::pool::{HostSurfelPool, SurfelPool};
use super::random::{hash2, to_unit_float};

/// Fixed-point scale of the coverage value packed into a tile key
pub const COVERAGE_SCALE: f32 = 4096.0;
const MAX_QUANTISED: u32 = 0x00ff_ffff;

/// Colour of pixels whose surface lies outside the world cube
const OUT_OF_CUBE_COLOR: Vec3 = Vec3::new(0.0, 0.0, 0.5);

/// Sum of `(1 - d/r) * max(0, n_s . n_p)` over surfels within `radius`
pub fn pixel_coverage(world: &HostWorldStructure, surfels: &[Surfel], p: Vec3, n: Vec3, radius: f32) -> f32 {
    let mut coverage = 0.0;
    world.for_each_nearby(p, radius, |index| {
        let s = &surfels[index as usize];
        let dist = s.position().distance(p);
        if dist < radius {
            coverage += (1.0 - dist / radius) * s.normal().dot(n).max(0.0);
        }
    });
    coverage
}

/// Red (uncovered) to green (at threshold) heatmap
pub fn coverage_color(coverage: f32, threshold: f32) -> Vec3 {
    let t = (coverage / threshold.max(1e-4)).clamp(0.0, 1.0);
    Vec3::new(1.0 - t, t, 0.0)
}

/// Sortable tile key: quantised coverage above, local pixel index below
pub fn tile_key(coverage: f32, local_index: u32) -> u32 {
    let quantised = ((coverage * COVERAGE_SCALE) as u32).min(MAX_QUANTISED);
    (quantised << 8) | local_index
}

fn decode_key(key: u32) -> (f32, u32) {
    ((key >> 8) as f32 / COVERAGE_SCALE, key & 0xff)
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum PixelCoverage {
    Sky,
    OutOfCube,
    Covered(f32),
}

/// Host coverage pass output
#[derive(Clone, Debug, Default)]
pub struct CoverageResult {
    /// Candidates that fit in the candidate buffer, in tile order
    pub candidates: Vec<SpawnCandidate>,
    /// Per-pixel heatmap (row-major)
    pub heatmap: Vec<Vec3>,
}

/// Run the coverage pass on the CPU against the current world structure
pub fn estimate_coverage(
    gbuffer: &GBufferImage,
    camera: &Camera,
    world: &HostWorldStructure,
    pool: &HostSurfelPool,
    config: &GiConfig,
    seed: u32,
) -> CoverageResult {
    let (width, height) = (gbuffer.width, gbuffer.height);
    let grid = world.grid();
    let surfels = pool.surfels();

    let pixels: Vec<PixelCoverage> = (0..width * height)
        .into_par_iter()
        .map(|i| {
            let depth = gbuffer.depth[i as usize];
            if depth <= 0.0 {
                return PixelCoverage::Sky;
            }
            let (x, y) = (i % width, i / width);
            let uv = Vec2::new((x as f32 + 0.5) / width as f32, (y as f32 + 0.5) / height as f32);
            let p = camera.world_position(uv, depth);
            if grid.cell_index(p).is_none() {
                return PixelCoverage::OutOfCube;
            }
            let n = gbuffer.normal[i as usize].normalize_or_zero();
            PixelCoverage::Covered(pixel_coverage(world, surfels, p, n, config.surfel_radius))
        })
        .collect();

    let heatmap = pixels
        .par_iter()
        .map(|c| match c {
            PixelCoverage::Sky => Vec3::ZERO,
            PixelCoverage::OutOfCube => OUT_OF_CUBE_COLOR,
            PixelCoverage::Covered(c) => coverage_color(*c, config.coverage_threshold),
        })
        .collect();

    let tiles_x = width.div_ceil(TILE_SIZE);
    let tiles_y = height.div_ceil(TILE_SIZE);
    let selected: Vec<SpawnCandidate> = (0..tiles_x * tiles_y)
        .into_par_iter()
        .filter_map(|tile_index| {
            let (tx, ty) = (tile_index % tiles_x, tile_index / tiles_x);
            let mut best = u32::MAX;
            for ly in 0..TILE_SIZE {
                for lx in 0..TILE_SIZE {
                    let (x, y) = (tx * TILE_SIZE + lx, ty * TILE_SIZE + ly);
                    if x >= width || y >= height {
                        continue;
                    }
                    if let PixelCoverage::Covered(c) = pixels[(y * width + x) as usize] {
                        best = best.min(tile_key(c, ly * TILE_SIZE + lx));
                    }
                }
            }
            if best == u32::MAX {
                return None;
            }
            let (coverage, local) = decode_key(best);
            if coverage >= config.coverage_threshold {
                return None;
            }
            if to_unit_float(hash2(seed, tile_index)) >= config.spawn_chance {
                return None;
            }
            Some(SpawnCandidate {
                pixel_x: tx * TILE_SIZE + local % TILE_SIZE,
                pixel_y: ty * TILE_SIZE + local / TILE_SIZE,
            })
        })
        .collect();

    let capacity = candidate_capacity(width, height);
    let candidates = selected
        .into_iter()
        .filter(|_| pool.try_append_candidate(capacity).is_some())
        .collect();

    CoverageResult { candidates, heatmap }
}

/// GPU coverage pass: heatmap texture plus candidate appends
pub struct CoverageStage {
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

impl CoverageStage {
    pub fn new(device: &wgpu::Device, common_layout: &wgpu::BindGroupLayout, size: (u32, u32)) -> Self {
        let layout = layout::bind_group_layout(device, "coverage_layout", &[
            layout::texture(0),
            layout::texture(1),
            layout::storage(2, false),
            layout::storage_texture(3, wgpu::TextureFormat::Rgba8Unorm),
        ]);
        let pipeline_layout = layout::pipeline_layout(device, "coverage_pipeline_layout", &[common_layout, &layout]);
        let module = common::stage_shader(device, "coverage_shader", include_str!("../../shaders/coverage.wgsl"));
        let pipeline = layout::compute_pipeline(device, "coverage", &pipeline_layout, &module, "main");
        let (texture, view) = common::output_texture(device, "coverage_texture", size, wgpu::TextureFormat::Rgba8Unorm);

        Self { layout, pipeline, texture, view }
    }

    pub fn resize(&mut self, device: &wgpu::Device, size: (u32, u32)) {
        let (texture, view) = common::output_texture(device, "coverage_texture", size, wgpu::TextureFormat::Rgba8Unorm);
        self.texture = texture;
        self.view = view;
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    /// One workgroup per screen tile
    pub fn record(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        common: &wgpu::BindGroup,
        gbuffer: &GBuffer,
        pool: &SurfelPool,
        profiler: Option<&GpuProfiler>,
    ) {
        let bind_group = layout::bind_group(device, "coverage_bind_group", &self.layout, &[
            wgpu::BindingResource::TextureView(gbuffer.depth_view()),
            wgpu::BindingResource::TextureView(gbuffer.normal_view()),
            pool.candidates().as_entire_binding(),
            wgpu::BindingResource::TextureView(&self.view),
        ]);
        let (width, height) = gbuffer.size();

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("gi_coverage"),
            timestamp_writes: profiler.and_then(|p| p.timestamp_writes(GiStage::Coverage, StageSpan::Whole)),
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, common, &[]);
        pass.set_bind_group(1, &bind_group, &[]);
        pass.dispatch_workgroups(width.div_ceil(TILE_SIZE), height.div_ceil(TILE_SIZE), 1);
    }
}
