//! Spawn: indirect argument preparation and candidate-to-surfel conversion.

use rayon::prelude::*;

use crate::core::camera::Camera;
use crate::core::types::Vec2;
use crate::render::layout;
use crate::render::texture::{GBuffer, GBufferImage};
use crate::render::{GiStage, GpuProfiler, StageSpan};
use super::common;
use super::data::{SpawnCandidate, Surfel, SPAWN_ARGS_OFFSET};
use super::grid::WorldGrid;
use super::pool::{HostSurfelPool, SurfelPool};

/// Turn candidates into surfels on the CPU.
///
/// Sky pixels and positions outside the world cube are dropped, as are
/// candidates arriving after the pool fills. Returns the number spawned.
pub fn spawn_candidates(
    pool: &mut HostSurfelPool,
    candidates: &[SpawnCandidate],
    gbuffer: &GBufferImage,
    camera: &Camera,
    grid: &WorldGrid,
) -> u32 {
    let (width, height) = (gbuffer.width as f32, gbuffer.height as f32);
    let reserving = &*pool;
    let spawned: Vec<(u32, Surfel)> = candidates
        .par_iter()
        .filter_map(|c| {
            let i = gbuffer.index(c.pixel_x, c.pixel_y);
            let depth = gbuffer.depth[i];
            let uv = Vec2::new((c.pixel_x as f32 + 0.5) / width, (c.pixel_y as f32 + 0.5) / height);
            let p = camera.world_position(uv, depth);
            if depth <= 0.0 || grid.cell_index(p).is_none() {
                log::trace!("Dropped spawn at pixel ({}, {}): outside the world cube", c.pixel_x, c.pixel_y);
                reserving.record_dropped();
                return None;
            }
            let Some(slot) = reserving.try_reserve() else {
                reserving.record_dropped();
                return None;
            };
            Some((slot, Surfel::new(p, gbuffer.normal[i].normalize_or_zero())))
        })
        .collect();

    let count = spawned.len() as u32;
    if (count as usize) < candidates.len() {
        log::trace!("Spawned {} of {} candidates", count, candidates.len());
    }
    pool.commit(spawned);
    count
}

/// GPU spawn: sizes its own dispatch from the candidate counter, spawns,
/// then sizes the surfel-wide passes from the new pool count
pub struct SpawnStage {
    args_layout: wgpu::BindGroupLayout,
    spawn_layout: wgpu::BindGroupLayout,
    spawn_args_pipeline: wgpu::ComputePipeline,
    surfel_args_pipeline: wgpu::ComputePipeline,
    spawn_pipeline: wgpu::ComputePipeline,
}

impl SpawnStage {
    pub fn new(device: &wgpu::Device, common_layout: &wgpu::BindGroupLayout) -> Self {
        let args_layout = layout::bind_group_layout(device, "indirect_args_layout", &[layout::storage(0, false)]);
        let args_pipeline_layout =
            layout::pipeline_layout(device, "indirect_args_pipeline_layout", &[common_layout, &args_layout]);
        let args_module = common::stage_shader(device, "indirect_shader", include_str!("../../shaders/indirect.wgsl"));

        let spawn_layout = layout::bind_group_layout(device, "spawn_layout", &[
            layout::texture(0),
            layout::texture(1),
            layout::storage(2, true),
        ]);
        let spawn_pipeline_layout = layout::pipeline_layout(device, "spawn_pipeline_layout", &[common_layout, &spawn_layout]);
        let spawn_module = common::stage_shader(device, "spawn_shader", include_str!("../../shaders/spawn.wgsl"));

        Self {
            spawn_args_pipeline: layout::compute_pipeline(
                device,
                "prepare_spawn_args",
                &args_pipeline_layout,
                &args_module,
                "prepare_spawn_args",
            ),
            surfel_args_pipeline: layout::compute_pipeline(
                device,
                "prepare_surfel_args",
                &args_pipeline_layout,
                &args_module,
                "prepare_surfel_args",
            ),
            spawn_pipeline: layout::compute_pipeline(device, "spawn", &spawn_pipeline_layout, &spawn_module, "main"),
            args_layout,
            spawn_layout,
        }
    }

    /// prepare_spawn_args -> spawn (indirect) -> prepare_surfel_args
    pub fn record(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        common: &wgpu::BindGroup,
        gbuffer: &GBuffer,
        pool: &SurfelPool,
        profiler: Option<&GpuProfiler>,
    ) {
        let args_group = layout::bind_group(device, "indirect_args_bind_group", &self.args_layout, &[
            pool.indirect_args().as_entire_binding(),
        ]);
        let spawn_group = layout::bind_group(device, "spawn_bind_group", &self.spawn_layout, &[
            wgpu::BindingResource::TextureView(gbuffer.depth_view()),
            wgpu::BindingResource::TextureView(gbuffer.normal_view()),
            pool.candidates().as_entire_binding(),
        ]);

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("gi_spawn"),
            timestamp_writes: profiler.and_then(|p| p.timestamp_writes(GiStage::Spawn, StageSpan::Whole)),
        });
        pass.set_bind_group(0, common, &[]);

        pass.set_pipeline(&self.spawn_args_pipeline);
        pass.set_bind_group(1, &args_group, &[]);
        pass.dispatch_workgroups(1, 1, 1);

        pass.set_pipeline(&self.spawn_pipeline);
        pass.set_bind_group(1, &spawn_group, &[]);
        pass.dispatch_workgroups_indirect(pool.indirect_args(), SPAWN_ARGS_OFFSET);

        pass.set_pipeline(&self.surfel_args_pipeline);
        pass.set_bind_group(1, &args_group, &[]);
        pass.dispatch_workgroups(1, 1, 1);
    }
}
