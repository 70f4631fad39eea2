//! Host/device shared GPU layouts.
//!
//! Every struct here is mirrored in `shaders/gi_common.wgsl`; field order and
//! sizes must match exactly.

use bytemuck::{Pod, Zeroable};

use crate::core::camera::Camera;
use super::config::GiConfig;
use super::grid::WorldGrid;

/// Screen tile edge in pixels (one coverage workgroup per tile)
pub const TILE_SIZE: u32 = 16;
/// Workgroup size of the linear surfel passes (spawn, grid, irradiance)
pub const SURFEL_WORKGROUP_SIZE: u32 = 64;
/// Workgroup edge of the per-pixel passes (resolve, blur, composite)
pub const PIXEL_WORKGROUP_SIZE: u32 = 8;
/// Upper bound on rays per surfel per frame
pub const MAX_RAYS_PER_SURFEL: u32 = 16;

/// `GiUniforms::frame[3]` flag bits
pub const FLAG_MULTI_BOUNCE: u32 = 1;
pub const FLAG_APPLY_GI: u32 = 1 << 1;
pub const FLAG_BLUR: u32 = 1 << 2;

/// Multiscale mean estimator state carried by every surfel (44 bytes)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SurfelIrradiance {
    /// Long-window running mean
    pub mean: [f32; 3],
    /// Short-window running mean
    pub short_mean: [f32; 3],
    /// Variance-based blend rate
    pub blend_rate: f32,
    pub variance: [f32; 3],
    pub inconsistency: f32,
}

/// Surfel record (68 bytes, tightly packed, array-of-structs)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Surfel {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub irradiance: SurfelIrradiance,
}

impl Surfel {
    /// Freshly spawned surfel with zeroed estimator state
    pub fn new(position: glam::Vec3, normal: glam::Vec3) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            irradiance: SurfelIrradiance::default(),
        }
    }

    pub fn position(&self) -> glam::Vec3 {
        glam::Vec3::from_array(self.position)
    }

    pub fn normal(&self) -> glam::Vec3 {
        glam::Vec3::from_array(self.normal)
    }

    pub fn mean(&self) -> glam::Vec3 {
        glam::Vec3::from_array(self.irradiance.mean)
    }
}

/// One grid cell's run inside the surfel index list
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WorldStructureChunk {
    pub start: u32,
    pub count: u32,
}

/// Arguments consumed by `dispatch_workgroups_indirect`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DispatchIndirectArgs {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl DispatchIndirectArgs {
    /// Enough workgroups of `group_size` threads to cover `items`
    pub fn for_items(items: u32, group_size: u32) -> Self {
        Self {
            x: items.div_ceil(group_size),
            y: 1,
            z: 1,
        }
    }
}

/// Byte offsets of the three argument blocks inside the indirect buffer
pub const SPAWN_ARGS_OFFSET: u64 = 0;
pub const SURFEL_ARGS_OFFSET: u64 = 12;
pub const IRRADIANCE_ARGS_OFFSET: u64 = 24;
pub const INDIRECT_ARGS_SIZE: u64 = 36;

/// Screen pixel picked by a coverage tile for spawning
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SpawnCandidate {
    pub pixel_x: u32,
    pub pixel_y: u32,
}

/// Global atomic counters owned by the GI component (16 bytes)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct GiCounters {
    /// Live surfels in the pool (reset by `reset_gi` only)
    pub surfel_count: u32,
    /// Candidates appended this frame (may exceed capacity)
    pub candidate_count: u32,
    /// Spawns dropped this frame (pool full, candidate buffer full, outside the world cube)
    pub dropped_spawns: u32,
    /// Surfels spawned this frame
    pub spawned: u32,
}

/// Byte range of the per-frame counters (everything but `surfel_count`)
pub const FRAME_COUNTERS_OFFSET: u64 = 4;
pub const FRAME_COUNTERS_SIZE: u64 = 12;

/// Per-frame uniform block shared by every GI pass.
/// Only mat4/vec4-sized members, so the WGSL layout has no implicit padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GiUniforms {
    pub view_proj: [[f32; 4]; 4],
    pub view_proj_inv: [[f32; 4]; 4],
    /// xyz camera position
    pub camera_position: [f32; 4],
    /// xyz camera forward
    pub camera_forward: [f32; 4],
    /// xyz grid min corner, w cell size
    pub grid_origin: [f32; 4],
    /// dimension, total cells, max surfels, candidate capacity
    pub grid_params: [u32; 4],
    /// width, height, tiles x, tiles y
    pub screen: [u32; 4],
    /// frame index, random seed, ray budget, flags
    pub frame: [u32; 4],
    /// spawn chance, coverage threshold, surfel radius, gather radius
    pub spawn: [f32; 4],
    /// distance falloff, normal power, gi intensity, unused
    pub shade: [f32; 4],
    /// visualize mode, blur radius, unused, unused
    pub modes: [u32; 4],
}

impl GiUniforms {
    pub fn new(
        camera: &Camera,
        grid: &WorldGrid,
        config: &GiConfig,
        (width, height): (u32, u32),
        frame_index: u32,
        seed: u32,
    ) -> Self {
        let tiles_x = width.div_ceil(TILE_SIZE);
        let tiles_y = height.div_ceil(TILE_SIZE);
        let mut flags = 0;
        if config.multi_bounce {
            flags |= FLAG_MULTI_BOUNCE;
        }
        if config.apply_gi {
            flags |= FLAG_APPLY_GI;
        }
        if config.blur.enabled {
            flags |= FLAG_BLUR;
        }

        Self {
            view_proj: camera.view_projection().to_cols_array_2d(),
            view_proj_inv: camera.view_projection_inverse().to_cols_array_2d(),
            camera_position: camera.position.extend(1.0).to_array(),
            camera_forward: camera.forward().extend(0.0).to_array(),
            grid_origin: grid.min.extend(grid.cell_size()).to_array(),
            grid_params: [grid.dimension, grid.total_cells(), config.max_surfels, tiles_x * tiles_y],
            screen: [width, height, tiles_x, tiles_y],
            frame: [frame_index, seed, config.ray_budget, flags],
            spawn: [
                config.spawn_chance,
                config.coverage_threshold,
                config.surfel_radius,
                config.gather_radius(),
            ],
            shade: [
                config.weights.distance_falloff,
                config.weights.normal_power,
                config.gi_intensity,
                0.0,
            ],
            modes: [config.visualize.as_u32(), config.blur.radius, 0, 0],
        }
    }
}

/// Candidate buffer capacity for a screen: one entry per coverage tile
pub fn candidate_capacity(width: u32, height: u32) -> u32 {
    width.div_ceil(TILE_SIZE) * height.div_ceil(TILE_SIZE)
}

/// Surfels updated this frame and rays each of them traces
pub fn ray_allocation(surfel_count: u32, ray_budget: u32) -> (u32, u32) {
    if surfel_count == 0 {
        return (0, 0);
    }
    let updates = surfel_count.min(ray_budget.max(1));
    let rays = (ray_budget / surfel_count).clamp(1, MAX_RAYS_PER_SURFEL);
    (updates, rays)
}

/// Round-robin start so successive frames cover the whole pool
pub fn update_offset(frame_index: u32, updates: u32, surfel_count: u32) -> u32 {
    if surfel_count == 0 {
        return 0;
    }
    ((frame_index as u64 * updates as u64) % surfel_count as u64) as u32
}
