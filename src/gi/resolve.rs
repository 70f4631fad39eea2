//! Resolve: per-pixel surfel gather, depth-aware blur, composite and the
//! surfel debug view.

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

use crate::core::camera::Camera;
use crate::core::types::{Vec2, Vec3};
use crate::render::layout;
use crate::render::texture::{GBuffer, GBufferImage};
use crate::render::{GiStage, GpuProfiler, StageSpan};
use super::common;
use super::config::{BlurConfig, GatherWeights, GiConfig, VisualizeMode, MAX_BLUR_RADIUS};
use super::data::Surfel;
use super::grid::HostWorldStructure;
use super::random::hash_color;

/// Weight sum below which a gather returns zero
const MIN_GATHER_WEIGHT: f32 = 1e-4;
/// Relative depth difference at which a blur tap's weight reaches zero
const DEPTH_TOLERANCE: f32 = 0.1;

/// Weighted mean irradiance of surfels within `radius` of (p, n)
pub fn gather_irradiance(
    world: &HostWorldStructure,
    surfels: &[Surfel],
    p: Vec3,
    n: Vec3,
    radius: f32,
    weights: &GatherWeights,
) -> Vec3 {
    let mut sum = Vec3::ZERO;
    let mut weight_sum = 0.0;
    world.for_each_nearby(p, radius, |index| {
        let s = &surfels[index as usize];
        let dist = s.position().distance(p);
        let facing = s.normal().dot(n);
        if dist < radius && facing > 0.0 {
            let w = (1.0 - dist / radius).powf(weights.distance_falloff) * facing.powf(weights.normal_power);
            sum += s.mean() * w;
            weight_sum += w;
        }
    });
    if weight_sum > MIN_GATHER_WEIGHT { sum / weight_sum } else { Vec3::ZERO }
}

/// Closest surfel strictly within `radius`
pub fn nearest_surfel(world: &HostWorldStructure, surfels: &[Surfel], p: Vec3, radius: f32) -> Option<u32> {
    let mut best = None;
    let mut best_dist = radius;
    world.for_each_nearby(p, radius, |index| {
        let dist = surfels[index as usize].position().distance(p);
        if dist < best_dist {
            best_dist = dist;
            best = Some(index);
        }
    });
    best
}

/// Normalised one-sided Gaussian taps for offsets `0..=radius`
/// (`w[0] + 2 * sum(w[1..]) == 1`)
pub fn gaussian_kernel(radius: u32, sigma: f32) -> Vec<f32> {
    let radius = radius.min(MAX_BLUR_RADIUS);
    let sigma = sigma.max(1e-3);
    let raw: Vec<f32> = (0..=radius)
        .map(|i| (-((i * i) as f32) / (2.0 * sigma * sigma)).exp())
        .collect();
    let total = raw[0] + 2.0 * raw[1..].iter().sum::<f32>();
    raw.into_iter().map(|w| w / total).collect()
}

/// Blur pass uniforms (96 bytes, mirrors `BlurParams` in blur.wgsl)
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct BlurParams {
    pub direction: [i32; 2],
    pub radius: u32,
    pub _pad: u32,
    pub weights: [[f32; 4]; 5],
}

impl BlurParams {
    pub fn new(direction: [i32; 2], blur: &BlurConfig) -> Self {
        let kernel = gaussian_kernel(blur.radius, blur.sigma);
        let mut weights = [[0.0; 4]; 5];
        for (i, w) in kernel.iter().enumerate() {
            weights[i / 4][i % 4] = *w;
        }
        Self {
            direction,
            radius: kernel.len() as u32 - 1,
            _pad: 0,
            weights,
        }
    }
}

/// Host resolve output (row-major, one entry per pixel)
#[derive(Clone, Debug, Default)]
pub struct ResolvedImages {
    pub irradiance: Vec<Vec3>,
    /// Hashed colour of the nearest surfel
    pub debug: Vec<Vec3>,
}

/// Gather irradiance and the surfel debug colour for every pixel
pub fn resolve(
    gbuffer: &GBufferImage,
    camera: &Camera,
    world: &HostWorldStructure,
    surfels: &[Surfel],
    config: &GiConfig,
) -> ResolvedImages {
    let (width, height) = (gbuffer.width, gbuffer.height);
    let radius = config.gather_radius();
    let (irradiance, debug): (Vec<Vec3>, Vec<Vec3>) = (0..width * height)
        .into_par_iter()
        .map(|i| {
            let depth = gbuffer.depth[i as usize];
            if depth <= 0.0 {
                return (Vec3::ZERO, Vec3::ZERO);
            }
            let (x, y) = (i % width, i / width);
            let uv = Vec2::new((x as f32 + 0.5) / width as f32, (y as f32 + 0.5) / height as f32);
            let p = camera.world_position(uv, depth);
            let n = gbuffer.normal[i as usize].normalize_or_zero();
            let irradiance = gather_irradiance(world, surfels, p, n, radius, &config.weights);
            let debug = nearest_surfel(world, surfels, p, config.surfel_radius).map_or(Vec3::ZERO, hash_color);
            (irradiance, debug)
        })
        .unzip();
    ResolvedImages { irradiance, debug }
}

/// One separable blur pass along `direction`
pub fn blur_pass(
    input: &[Vec3],
    depth: &[f32],
    (width, height): (u32, u32),
    direction: [i32; 2],
    kernel: &[f32],
) -> Vec<Vec3> {
    let (w, h) = (width as i32, height as i32);
    (0..w * h)
        .into_par_iter()
        .map(|i| {
            let (x, y) = (i % w, i / w);
            let center_depth = depth[i as usize];
            let center = input[i as usize];
            if center_depth <= 0.0 {
                return center;
            }
            let mut sum = center * kernel[0];
            let mut weight_sum = kernel[0];
            for (offset, &k) in kernel.iter().enumerate().skip(1) {
                for side in [-1, 1] {
                    let tx = (x + direction[0] * offset as i32 * side).clamp(0, w - 1);
                    let ty = (y + direction[1] * offset as i32 * side).clamp(0, h - 1);
                    let tap = (ty * w + tx) as usize;
                    let depth_weight =
                        (1.0 - (depth[tap] - center_depth).abs() / (DEPTH_TOLERANCE * center_depth)).max(0.0);
                    let weight = k * depth_weight;
                    sum += input[tap] * weight;
                    weight_sum += weight;
                }
            }
            sum / weight_sum
        })
        .collect()
}

/// Horizontal then vertical depth-aware Gaussian blur
pub fn blur(input: &[Vec3], depth: &[f32], size: (u32, u32), config: &BlurConfig) -> Vec<Vec3> {
    let kernel = gaussian_kernel(config.radius, config.sigma);
    let horizontal = blur_pass(input, depth, size, [1, 0], &kernel);
    blur_pass(&horizontal, depth, size, [0, 1], &kernel)
}

/// `albedo * irradiance * intensity`, or black when GI is off
pub fn composite(albedo: &[Vec3], irradiance: &[Vec3], config: &GiConfig) -> Vec<Vec3> {
    if !config.apply_gi || config.visualize == VisualizeMode::None {
        return vec![Vec3::ZERO; albedo.len()];
    }
    albedo
        .par_iter()
        .zip(irradiance.par_iter())
        .map(|(a, e)| *a * *e * config.gi_intensity)
        .collect()
}

/// GPU resolve, blur and composite passes with their output textures
pub struct ResolveStage {
    resolve_layout: wgpu::BindGroupLayout,
    blur_layout: wgpu::BindGroupLayout,
    composite_layout: wgpu::BindGroupLayout,
    resolve_pipeline: wgpu::ComputePipeline,
    blur_pipeline: wgpu::ComputePipeline,
    composite_pipeline: wgpu::ComputePipeline,
    /// Horizontal, vertical
    blur_params: [wgpu::Buffer; 2],
    targets: ResolveTargets,
}

struct ResolveTargets {
    irradiance: (wgpu::Texture, wgpu::TextureView),
    blur_scratch: (wgpu::Texture, wgpu::TextureView),
    debug: (wgpu::Texture, wgpu::TextureView),
    gi_map: (wgpu::Texture, wgpu::TextureView),
}

impl ResolveTargets {
    fn new(device: &wgpu::Device, size: (u32, u32)) -> Self {
        Self {
            irradiance: common::output_texture(device, "gi_irradiance", size, wgpu::TextureFormat::Rgba16Float),
            blur_scratch: common::output_texture(device, "gi_blur_scratch", size, wgpu::TextureFormat::Rgba16Float),
            debug: common::output_texture(device, "gi_surfel_debug", size, wgpu::TextureFormat::Rgba8Unorm),
            gi_map: common::output_texture(device, "gi_map", size, wgpu::TextureFormat::Rgba8Unorm),
        }
    }
}

impl ResolveStage {
    pub fn new(device: &wgpu::Device, common_layout: &wgpu::BindGroupLayout, size: (u32, u32)) -> Self {
        let resolve_layout = layout::bind_group_layout(device, "resolve_layout", &[
            layout::texture(0),
            layout::texture(1),
            layout::storage_texture(2, wgpu::TextureFormat::Rgba16Float),
            layout::storage_texture(3, wgpu::TextureFormat::Rgba8Unorm),
        ]);
        let blur_layout = layout::bind_group_layout(device, "blur_layout", &[
            layout::uniform(0),
            layout::texture(1),
            layout::texture(2),
            layout::storage_texture(3, wgpu::TextureFormat::Rgba16Float),
        ]);
        let composite_layout = layout::bind_group_layout(device, "composite_layout", &[
            layout::texture(0),
            layout::texture(1),
            layout::storage_texture(2, wgpu::TextureFormat::Rgba8Unorm),
        ]);

        let pipeline = |name: &str, stage_layout: &wgpu::BindGroupLayout, source: &str| {
            let pipeline_layout = layout::pipeline_layout(device, name, &[common_layout, stage_layout]);
            let module = common::stage_shader(device, name, source);
            layout::compute_pipeline(device, name, &pipeline_layout, &module, "main")
        };
        let resolve_pipeline = pipeline("resolve", &resolve_layout, include_str!("../../shaders/resolve.wgsl"));
        let blur_pipeline = pipeline("blur", &blur_layout, include_str!("../../shaders/blur.wgsl"));
        let composite_pipeline = pipeline("composite", &composite_layout, include_str!("../../shaders/composite.wgsl"));

        let blur_params = ["blur_params_h", "blur_params_v"].map(|label| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: std::mem::size_of::<BlurParams>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });

        Self {
            resolve_layout,
            blur_layout,
            composite_layout,
            resolve_pipeline,
            blur_pipeline,
            composite_pipeline,
            blur_params,
            targets: ResolveTargets::new(device, size),
        }
    }

    pub fn resize(&mut self, device: &wgpu::Device, size: (u32, u32)) {
        self.targets = ResolveTargets::new(device, size);
    }

    pub fn update_blur(&self, queue: &wgpu::Queue, blur: &BlurConfig) {
        queue.write_buffer(&self.blur_params[0], 0, bytemuck::bytes_of(&BlurParams::new([1, 0], blur)));
        queue.write_buffer(&self.blur_params[1], 0, bytemuck::bytes_of(&BlurParams::new([0, 1], blur)));
    }

    pub fn irradiance_texture(&self) -> &wgpu::Texture {
        &self.targets.irradiance.0
    }

    pub fn irradiance_view(&self) -> &wgpu::TextureView {
        &self.targets.irradiance.1
    }

    pub fn debug_texture(&self) -> &wgpu::Texture {
        &self.targets.debug.0
    }

    pub fn debug_view(&self) -> &wgpu::TextureView {
        &self.targets.debug.1
    }

    pub fn gi_map_texture(&self) -> &wgpu::Texture {
        &self.targets.gi_map.0
    }

    pub fn gi_map_view(&self) -> &wgpu::TextureView {
        &self.targets.gi_map.1
    }

    /// resolve -> blur (horizontal, vertical) -> composite
    pub fn record(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        common: &wgpu::BindGroup,
        gbuffer: &GBuffer,
        blur_enabled: bool,
        profiler: Option<&GpuProfiler>,
    ) {
        let t = &self.targets;
        let resolve_group = layout::bind_group(device, "resolve_bind_group", &self.resolve_layout, &[
            wgpu::BindingResource::TextureView(gbuffer.depth_view()),
            wgpu::BindingResource::TextureView(gbuffer.normal_view()),
            wgpu::BindingResource::TextureView(&t.irradiance.1),
            wgpu::BindingResource::TextureView(&t.debug.1),
        ]);
        let blur_group = |params: &wgpu::Buffer, src: &wgpu::TextureView, dst: &wgpu::TextureView| {
            layout::bind_group(device, "blur_bind_group", &self.blur_layout, &[
                params.as_entire_binding(),
                wgpu::BindingResource::TextureView(gbuffer.depth_view()),
                wgpu::BindingResource::TextureView(src),
                wgpu::BindingResource::TextureView(dst),
            ])
        };
        let composite_group = layout::bind_group(device, "composite_bind_group", &self.composite_layout, &[
            wgpu::BindingResource::TextureView(gbuffer.albedo_view()),
            wgpu::BindingResource::TextureView(&t.irradiance.1),
            wgpu::BindingResource::TextureView(&t.gi_map.1),
        ]);

        let (width, height) = gbuffer.size();
        let (groups_x, groups_y) = common::pixel_workgroups(width, height);

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("gi_resolve"),
            timestamp_writes: profiler.and_then(|p| p.timestamp_writes(GiStage::Resolve, StageSpan::Whole)),
        });
        pass.set_bind_group(0, common, &[]);

        pass.set_pipeline(&self.resolve_pipeline);
        pass.set_bind_group(1, &resolve_group, &[]);
        pass.dispatch_workgroups(groups_x, groups_y, 1);

        if blur_enabled {
            let horizontal = blur_group(&self.blur_params[0], &t.irradiance.1, &t.blur_scratch.1);
            let vertical = blur_group(&self.blur_params[1], &t.blur_scratch.1, &t.irradiance.1);
            pass.set_pipeline(&self.blur_pipeline);
            pass.set_bind_group(1, &horizontal, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
            pass.set_bind_group(1, &vertical, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }

        pass.set_pipeline(&self.composite_pipeline);
        pass.set_bind_group(1, &composite_group, &[]);
        pass.dispatch_workgroups(groups_x, groups_y, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gi::config::GridConfig;
    use crate::gi::grid::WorldGrid;

    fn lit_surfel(p: Vec3, n: Vec3, value: f32) -> Surfel {
        let mut s = Surfel::new(p, n);
        s.irradiance.mean = [value; 3];
        s
    }

    fn world_with(surfels: &[Surfel]) -> HostWorldStructure {
        let mut world = HostWorldStructure::new(WorldGrid::from_config(&GridConfig::default()));
        world.rebuild(surfels);
        world
    }

    #[test]
    fn test_gaussian_kernel_is_normalised() {
        for (radius, sigma) in [(0, 1.0), (1, 0.5), (4, 2.0), (16, 6.0)] {
            let k = gaussian_kernel(radius, sigma);
            assert_eq!(k.len(), radius as usize + 1);
            let total = k[0] + 2.0 * k[1..].iter().sum::<f32>();
            assert!((total - 1.0).abs() < 1e-5);
            assert!(k.windows(2).all(|w| w[0] >= w[1]));
        }
        assert_eq!(gaussian_kernel(99, 2.0).len(), MAX_BLUR_RADIUS as usize + 1);
    }

    #[test]
    fn test_blur_params_packing() {
        assert_eq!(std::mem::size_of::<BlurParams>(), 96);
        let params = BlurParams::new([0, 1], &BlurConfig { enabled: true, radius: 5, sigma: 2.0 });
        let kernel = gaussian_kernel(5, 2.0);
        assert_eq!(params.radius, 5);
        assert_eq!(params.weights[0][0], kernel[0]);
        assert_eq!(params.weights[1][1], kernel[5]);
        assert_eq!(params.weights[1][2], 0.0);
    }

    #[test]
    fn test_gather_weights_by_distance_and_normal() {
        let weights = GatherWeights::default();
        let surfels = vec![
            lit_surfel(Vec3::ZERO, Vec3::Y, 1.0),
            lit_surfel(Vec3::new(0.125, 0.0, 0.0), Vec3::Y, 3.0),
            lit_surfel(Vec3::new(0.0, 0.0, 0.1), -Vec3::Y, 100.0),
        ];
        let world = world_with(&surfels);
        let e = gather_irradiance(&world, &surfels, Vec3::ZERO, Vec3::Y, 0.25, &weights);
        // weights 1.0 and 0.5; the back-facing surfel is ignored
        assert!((e.x - (1.0 + 1.5) / 1.5).abs() < 1e-5);
    }

    #[test]
    fn test_gather_without_neighbours_is_black() {
        let surfels = vec![lit_surfel(Vec3::new(3.0, 0.0, 0.0), Vec3::Y, 1.0)];
        let world = world_with(&surfels);
        let e = gather_irradiance(&world, &surfels, Vec3::ZERO, Vec3::Y, 0.25, &GatherWeights::default());
        assert_eq!(e, Vec3::ZERO);
    }

    #[test]
    fn test_nearest_surfel() {
        let surfels = vec![
            lit_surfel(Vec3::new(0.1, 0.0, 0.0), Vec3::Y, 0.0),
            lit_surfel(Vec3::new(0.05, 0.0, 0.0), Vec3::Y, 0.0),
        ];
        let world = world_with(&surfels);
        assert_eq!(nearest_surfel(&world, &surfels, Vec3::ZERO, 0.125), Some(1));
        assert_eq!(nearest_surfel(&world, &surfels, Vec3::ZERO, 0.04), None);
    }

    #[test]
    fn test_blur_preserves_constant_and_sky() {
        let size = (16, 8);
        let n = 16 * 8;
        let mut depth = vec![2.0; n];
        depth[0] = 0.0;
        let mut input = vec![Vec3::splat(0.5); n];
        input[0] = Vec3::new(9.0, 0.0, 0.0);

        let out = blur(&input, &depth, size, &BlurConfig::default());
        assert_eq!(out[0], input[0]);
        for v in &out[1..] {
            assert!((*v - Vec3::splat(0.5)).abs().max_element() < 1e-5);
        }
    }

    #[test]
    fn test_blur_stops_at_depth_edges() {
        let size = (8, 1);
        let depth = [1.0, 1.0, 1.0, 1.0, 5.0, 5.0, 5.0, 5.0];
        let input: Vec<Vec3> = (0..8).map(|i| if i < 4 { Vec3::ZERO } else { Vec3::ONE }).collect();
        let kernel = gaussian_kernel(3, 2.0);
        let out = blur_pass(&input, &depth, size, [1, 0], &kernel);
        assert_eq!(out[3], Vec3::ZERO);
        assert!((out[4] - Vec3::ONE).abs().max_element() < 1e-6);
    }

    #[test]
    fn test_composite_modes() {
        let albedo = vec![Vec3::new(0.5, 1.0, 0.0)];
        let irradiance = vec![Vec3::splat(2.0)];
        let mut config = GiConfig { gi_intensity: 0.5, ..Default::default() };
        assert_eq!(composite(&albedo, &irradiance, &config)[0], Vec3::new(0.5, 1.0, 0.0));

        config.apply_gi = false;
        assert_eq!(composite(&albedo, &irradiance, &config)[0], Vec3::ZERO);

        config.apply_gi = true;
        config.visualize = VisualizeMode::None;
        assert_eq!(composite(&albedo, &irradiance, &config)[0], Vec3::ZERO);
    }
}
