//! Ray-traced irradiance accumulation.
//!
//! Each frame a round-robin window of at most `ray_budget` surfels traces
//! cosine-weighted rays and folds the average radiance into its estimator.

use rayon::prelude::*;

use crate::core::types::Vec3;
use crate::math::Ray;
use crate::render::layout;
use crate::render::{GiStage, GpuProfiler, StageSpan};
use crate::scene::buffer::SceneBuffer;
use crate::scene::primitives::SceneTracer;
use super::common;
use super::config::GiConfig;
use super::data::{
    ray_allocation, update_offset, Surfel, SurfelIrradiance, IRRADIANCE_ARGS_OFFSET, SURFEL_ARGS_OFFSET,
};
use super::estimator;
use super::grid::HostWorldStructure;
use super::pool::SurfelPool;
use super::random::{cosine_hemisphere, Rng};
use super::resolve::gather_irradiance;

/// Offset applied along the normal before tracing from a surface
pub const RAY_EPSILON: f32 = 1e-3;

/// Radiance arriving at `origin` along `direction`
pub fn incoming_radiance(
    tracer: &dyn SceneTracer,
    world: &HostWorldStructure,
    surfels: &[Surfel],
    config: &GiConfig,
    origin: Vec3,
    direction: Vec3,
) -> Vec3 {
    let ray = Ray::new(origin, direction);
    let Some(hit) = tracer.trace(&ray, f32::MAX) else {
        return tracer.sky();
    };

    let n = hit.normal;
    let p = hit.position + n * RAY_EPSILON;
    let mut radiance = hit.material.emission;

    let (sun_dir, sun_irradiance) = tracer.sun();
    let n_dot_l = n.dot(sun_dir);
    if n_dot_l > 0.0 && !tracer.occluded(&Ray::new(p, sun_dir)) {
        radiance += hit.material.albedo / std::f32::consts::PI * sun_irradiance * n_dot_l;
    }
    if config.multi_bounce {
        radiance += hit.material.albedo * gather_irradiance(world, surfels, p, n, config.gather_radius(), &config.weights);
    }
    radiance
}

/// Trace `rays` cosine-weighted samples for one surfel and average them
fn sample_surfel(
    tracer: &dyn SceneTracer,
    world: &HostWorldStructure,
    surfels: &[Surfel],
    config: &GiConfig,
    index: u32,
    rays: u32,
    seed: u32,
) -> Vec3 {
    let s = &surfels[index as usize];
    let n = s.normal();
    let origin = s.position() + n * RAY_EPSILON;
    let mut rng = Rng::new(seed, index);
    let mut sum = Vec3::ZERO;
    for _ in 0..rays {
        let u1 = rng.next_f32();
        let u2 = rng.next_f32();
        sum += incoming_radiance(tracer, world, surfels, config, origin, cosine_hemisphere(n, u1, u2));
    }
    sum / rays as f32
}

/// Update this frame's window of surfels. Every sample reads the surfel
/// state from before the update. Returns the number of surfels updated.
pub fn accumulate(
    surfels: &mut [Surfel],
    world: &HostWorldStructure,
    tracer: &dyn SceneTracer,
    config: &GiConfig,
    frame_index: u32,
    seed: u32,
) -> u32 {
    let count = surfels.len() as u32;
    let (updates, rays) = ray_allocation(count, config.ray_budget);
    if updates == 0 {
        return 0;
    }
    let offset = update_offset(frame_index, updates, count);

    let snapshot: &[Surfel] = surfels;
    let updated: Vec<(u32, SurfelIrradiance)> = (0..updates)
        .into_par_iter()
        .map(|i| {
            let index = ((offset as u64 + i as u64) % count as u64) as u32;
            let radiance = sample_surfel(tracer, world, snapshot, config, index, rays, seed);
            (index, estimator::update(snapshot[index as usize].irradiance, radiance))
        })
        .collect();

    for (index, state) in updated {
        surfels[index as usize].irradiance = state;
    }
    log::trace!("Irradiance: {} surfels x {} rays from offset {}", updates, rays, offset);
    updates
}

/// GPU irradiance pass, sized by the indirect args written after spawn.
/// Multi-bounce gathers read a per-frame copy of the surfel means.
pub struct IrradianceStage {
    snapshot_layout: wgpu::BindGroupLayout,
    snapshot_pipeline: wgpu::ComputePipeline,
    pipeline: wgpu::ComputePipeline,
}

impl IrradianceStage {
    pub fn new(device: &wgpu::Device, common_layout: &wgpu::BindGroupLayout) -> Self {
        let scene_layout = SceneBuffer::create_bind_group_layout(device);
        let snapshot_layout = layout::bind_group_layout(device, "mean_snapshot_layout", &[layout::storage(0, false)]);
        let pipeline_layout = layout::pipeline_layout(
            device,
            "irradiance_pipeline_layout",
            &[common_layout, &scene_layout, &snapshot_layout],
        );
        let module = common::stage_shader(device, "irradiance_shader", include_str!("../../shaders/irradiance.wgsl"));
        Self {
            snapshot_pipeline: layout::compute_pipeline(device, "mean_snapshot", &pipeline_layout, &module, "snapshot_means"),
            pipeline: layout::compute_pipeline(device, "irradiance", &pipeline_layout, &module, "main"),
            snapshot_layout,
        }
    }

    pub fn record(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        common: &wgpu::BindGroup,
        scene: &SceneBuffer,
        pool: &SurfelPool,
        multi_bounce: bool,
        profiler: Option<&GpuProfiler>,
    ) {
        let snapshot_group = layout::bind_group(device, "mean_snapshot_bind_group", &self.snapshot_layout, &[
            pool.mean_snapshot().as_entire_binding(),
        ]);

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("gi_irradiance"),
            timestamp_writes: profiler.and_then(|p| p.timestamp_writes(GiStage::Irradiance, StageSpan::Whole)),
        });
        pass.set_bind_group(0, common, &[]);
        pass.set_bind_group(1, scene.bind_group(), &[]);
        pass.set_bind_group(2, &snapshot_group, &[]);

        if multi_bounce {
            pass.set_pipeline(&self.snapshot_pipeline);
            pass.dispatch_workgroups_indirect(pool.indirect_args(), SURFEL_ARGS_OFFSET);
        }
        pass.set_pipeline(&self.pipeline);
        pass.dispatch_workgroups_indirect(pool.indirect_args(), IRRADIANCE_ARGS_OFFSET);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gi::config::GridConfig;
    use crate::gi::grid::WorldGrid;
    use crate::scene::config::SceneConfig;
    use crate::scene::primitives::{Material, Scene};

    fn world_for(surfels: &[Surfel]) -> HostWorldStructure {
        let mut world = HostWorldStructure::new(WorldGrid::from_config(&GridConfig::default()));
        world.rebuild(surfels);
        world
    }

    #[test]
    fn test_open_sky_converges_to_sky_colour() {
        let scene = Scene::new(SceneConfig::default());
        let mut surfels = vec![Surfel::new(Vec3::ZERO, Vec3::Y)];
        let world = world_for(&surfels);
        let config = GiConfig::default();

        for frame in 0..1000 {
            accumulate(&mut surfels, &world, &scene, &config, frame, frame);
        }
        let sky = scene.lighting.sky_color();
        assert!((surfels[0].mean() - sky).abs().max_element() < 1e-2, "{:?}", surfels[0].mean());
    }

    #[test]
    fn test_enclosed_emitter_converges_to_emission() {
        let mut scene = Scene::new(SceneConfig::default());
        scene.add_sphere(Vec3::ZERO, 5.0, Material::emissive(Vec3::splat(2.0)));
        let mut surfels = vec![Surfel::new(Vec3::new(0.0, -1.0, 0.0), Vec3::Y)];
        let world = world_for(&surfels);
        let config = GiConfig { multi_bounce: false, ..Default::default() };

        for frame in 0..1000 {
            accumulate(&mut surfels, &world, &scene, &config, frame, frame * 7 + 1);
        }
        assert!((surfels[0].mean() - Vec3::splat(2.0)).abs().max_element() < 1e-2);
    }

    #[test]
    fn test_sunlit_floor_receives_direct_light() {
        let lighting = SceneConfig { time_of_day: 12.0, sky_color: [0.0; 3], ..Default::default() };
        let mut scene = Scene::new(lighting);
        // Opaque slab above the surfel; only its top face is sunlit
        scene.add_box(Vec3::new(-5.0, 2.0, -5.0), Vec3::new(5.0, 2.1, 5.0), Material::diffuse(Vec3::ONE));
        let mut surfels = vec![Surfel::new(Vec3::ZERO, Vec3::Y)];
        let world = world_for(&surfels);
        let config = GiConfig { multi_bounce: false, ..Default::default() };

        // Every ray either escapes into a black sky or hits the shadowed underside
        for frame in 0..50 {
            accumulate(&mut surfels, &world, &scene, &config, frame, frame);
        }
        assert!(surfels[0].mean().max_element() < 1e-6);

        let radiance = incoming_radiance(&scene, &world, &surfels, &config, Vec3::new(0.0, 3.0, 0.0), -Vec3::Y);
        assert!(radiance.x > 0.0, "top face should be sunlit");
    }

    #[test]
    fn test_budget_round_robin() {
        let scene = Scene::new(SceneConfig::default());
        let mut surfels: Vec<Surfel> = (0..10).map(|i| Surfel::new(Vec3::new(i as f32 * 0.5 - 2.5, 0.0, 0.0), Vec3::Y)).collect();
        let world = world_for(&surfels);
        let config = GiConfig { ray_budget: 4, ..Default::default() };

        assert_eq!(accumulate(&mut surfels, &world, &scene, &config, 0, 1), 4);
        let touched: Vec<bool> = surfels.iter().map(|s| s.irradiance != SurfelIrradiance::default()).collect();
        assert_eq!(touched, [true, true, true, true, false, false, false, false, false, false]);

        assert_eq!(accumulate(&mut surfels, &world, &scene, &config, 2, 1), 4);
        // Frame 2 starts at 8 and wraps to 0, 1
        assert!(surfels[8].irradiance != SurfelIrradiance::default());
        assert!(surfels[9].irradiance != SurfelIrradiance::default());
        assert!(surfels[4].irradiance == SurfelIrradiance::default());
    }

    #[test]
    fn test_empty_pool_does_nothing() {
        let scene = Scene::new(SceneConfig::default());
        let world = world_for(&[]);
        assert_eq!(accumulate(&mut [], &world, &scene, &GiConfig::default(), 0, 0), 0);
    }
}
