//! Uniform world grid and the per-frame world structure rebuild.
//!
//! Each cell owns a contiguous run `{start, count}` of a flat surfel index
//! list. The list is double buffered: consumers read slot `current` while a
//! rebuild writes slot `1 - current`, then `current` flips.

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;

use crate::core::types::{IVec3, UVec3, Vec3};
use crate::math::Aabb;
use crate::render::layout;
use crate::render::{GiStage, GpuProfiler, StageSpan};
use super::common;
use super::config::GridConfig;
use super::data::{Surfel, WorldStructureChunk, SURFEL_ARGS_OFFSET, SURFEL_WORKGROUP_SIZE};
use super::scan::{self, ExclusiveScan, SCAN_BLOCK_SIZE};

/// Uniform D³ grid over an axis-aligned world cube
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorldGrid {
    /// Minimum corner of the cube
    pub min: Vec3,
    /// Cube edge length
    pub size: f32,
    /// Cells per axis
    pub dimension: u32,
}

impl WorldGrid {
    pub fn from_config(config: &GridConfig) -> Self {
        Self {
            min: Aabb::cube(config.center(), config.world_size).min,
            size: config.world_size,
            dimension: config.dimension,
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.size / self.dimension as f32
    }

    pub fn total_cells(&self) -> u32 {
        self.dimension * self.dimension * self.dimension
    }

    /// World cube; `cell_index` is `Some` exactly for points it contains
    pub fn bounds(&self) -> Aabb {
        Aabb::new(self.min, self.min + Vec3::splat(self.size))
    }

    /// Unclamped integer cell coordinate (may lie outside the grid)
    fn raw_coord(&self, p: Vec3) -> IVec3 {
        ((p - self.min) / self.cell_size()).floor().as_ivec3()
    }

    /// Cell coordinate of `p`, `None` outside the world cube
    pub fn cell_coord(&self, p: Vec3) -> Option<UVec3> {
        let c = self.raw_coord(p);
        let d = self.dimension as i32;
        if c.cmplt(IVec3::ZERO).any() || c.cmpge(IVec3::splat(d)).any() {
            return None;
        }
        Some(c.as_uvec3())
    }

    pub fn flatten(&self, c: UVec3) -> u32 {
        let d = self.dimension;
        c.x + c.y * d + c.z * d * d
    }

    /// Flat cell index of `p`, `None` outside the world cube
    pub fn cell_index(&self, p: Vec3) -> Option<u32> {
        self.cell_coord(p).map(|c| self.flatten(c))
    }

    /// Inclusive cell range overlapping the sphere's bounding box, clamped
    /// to the grid; `None` if the box misses the grid entirely
    pub fn cell_range_for_sphere(&self, center: Vec3, radius: f32) -> Option<(UVec3, UVec3)> {
        let d = self.dimension as i32;
        let lo = self.raw_coord(center - Vec3::splat(radius)).max(IVec3::ZERO);
        let hi = self.raw_coord(center + Vec3::splat(radius)).min(IVec3::splat(d - 1));
        if lo.cmpgt(hi).any() {
            return None;
        }
        Some((lo.as_uvec3(), hi.as_uvec3()))
    }
}

/// CPU world structure running the same rebuild protocol as the GPU
pub struct HostWorldStructure {
    grid: WorldGrid,
    cell_counts: Vec<AtomicU32>,
    cell_offsets: Vec<u32>,
    cell_cursors: Vec<AtomicU32>,
    chunks: Vec<WorldStructureChunk>,
    index_lists: [Vec<u32>; 2],
    current: usize,
}

impl HostWorldStructure {
    pub fn new(grid: WorldGrid) -> Self {
        let padded = scan::padded_len(grid.total_cells()) as usize;
        Self {
            grid,
            cell_counts: (0..padded).map(|_| AtomicU32::new(0)).collect(),
            cell_offsets: vec![0; padded],
            cell_cursors: (0..padded).map(|_| AtomicU32::new(0)).collect(),
            chunks: vec![WorldStructureChunk::default(); grid.total_cells() as usize],
            index_lists: [Vec::new(), Vec::new()],
            current: 0,
        }
    }

    pub fn grid(&self) -> &WorldGrid {
        &self.grid
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn chunks(&self) -> &[WorldStructureChunk] {
        &self.chunks
    }

    /// Index list consumers read this frame
    pub fn index_list(&self) -> &[u32] {
        &self.index_lists[self.current]
    }

    pub fn index_list_slot(&self, slot: usize) -> &[u32] {
        &self.index_lists[slot]
    }

    /// Surfel indices stored in `cell`
    pub fn cell_run(&self, cell: u32) -> &[u32] {
        let chunk = self.chunks[cell as usize];
        &self.index_lists[self.current][chunk.start as usize..(chunk.start + chunk.count) as usize]
    }

    /// Bytes held by the cell arrays, chunk records and both index lists
    pub fn memory_bytes(&self) -> u64 {
        let cells = (self.cell_counts.len() + self.cell_offsets.len() + self.cell_cursors.len()) as u64 * 4;
        let chunks = (self.chunks.len() * std::mem::size_of::<WorldStructureChunk>()) as u64;
        let lists: usize = self.index_lists.iter().map(|list| list.capacity() * 4).sum();
        cells + chunks + lists as u64
    }

    /// Recount, rescan and rescatter every live surfel, then flip buffers
    pub fn rebuild(&mut self, surfels: &[Surfel]) {
        let grid = self.grid;
        self.cell_counts.par_iter().for_each(|c| c.store(0, Ordering::Relaxed));
        self.cell_cursors.par_iter().for_each(|c| c.store(0, Ordering::Relaxed));

        let counts = &self.cell_counts;
        surfels.par_iter().for_each(|s| {
            if let Some(cell) = grid.cell_index(s.position()) {
                counts[cell as usize].fetch_add(1, Ordering::Relaxed);
            }
        });

        let count_values: Vec<u32> = self.cell_counts.iter().map(|c| c.load(Ordering::Relaxed)).collect();
        let total = scan::exclusive_scan_blocked(&count_values, &mut self.cell_offsets, SCAN_BLOCK_SIZE as usize);

        let write = 1 - self.current;
        let out: Vec<AtomicU32> = (0..total).map(|_| AtomicU32::new(0)).collect();
        let offsets = &self.cell_offsets;
        let cursors = &self.cell_cursors;
        surfels.par_iter().enumerate().for_each(|(i, s)| {
            if let Some(cell) = grid.cell_index(s.position()) {
                let slot = cursors[cell as usize].fetch_add(1, Ordering::Relaxed);
                out[(offsets[cell as usize] + slot) as usize].store(i as u32, Ordering::Relaxed);
            }
        });
        self.index_lists[write] = out.into_iter().map(AtomicU32::into_inner).collect();

        self.chunks
            .par_iter_mut()
            .enumerate()
            .for_each(|(cell, chunk)| {
                *chunk = WorldStructureChunk { start: offsets[cell], count: count_values[cell] };
            });

        self.current = write;
        log::trace!("World structure rebuilt: {} indexed of {} surfels", total, surfels.len());
    }

    /// Zero all runs and clear both index lists
    pub fn reset(&mut self) {
        self.chunks.iter_mut().for_each(|c| *c = WorldStructureChunk::default());
        self.index_lists = [Vec::new(), Vec::new()];
        self.current = 0;
    }

    /// Visit indices of surfels in cells overlapping the sphere
    pub fn for_each_nearby(&self, center: Vec3, radius: f32, mut f: impl FnMut(u32)) {
        let Some((lo, hi)) = self.grid.cell_range_for_sphere(center, radius) else {
            return;
        };
        for z in lo.z..=hi.z {
            for y in lo.y..=hi.y {
                for x in lo.x..=hi.x {
                    for &index in self.cell_run(self.grid.flatten(UVec3::new(x, y, z))) {
                        f(index);
                    }
                }
            }
        }
    }
}

/// GPU world structure: cell counts, scan, scatter and chunk records
pub struct WorldStructure {
    grid: WorldGrid,
    cell_counts: wgpu::Buffer,
    cell_cursors: wgpu::Buffer,
    cell_offsets: wgpu::Buffer,
    chunks: wgpu::Buffer,
    index_lists: [wgpu::Buffer; 2],
    current: usize,
    scan: ExclusiveScan,
    scan_bind_group: wgpu::BindGroup,
    /// Group 1 bind groups, indexed by the slot being written
    write_bind_groups: [wgpu::BindGroup; 2],
    count_pipeline: wgpu::ComputePipeline,
    scatter_pipeline: wgpu::ComputePipeline,
    chunks_pipeline: wgpu::ComputePipeline,
}

impl WorldStructure {
    pub fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        grid: WorldGrid,
        max_surfels: u32,
        common_layout: &wgpu::BindGroupLayout,
    ) -> Self {
        let total_cells = grid.total_cells();
        let padded = scan::padded_len(total_cells);
        let scan = ExclusiveScan::new(device, queue, padded);

        let cell_buffer = |label: &str| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: padded as u64 * 4,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };
        let cell_counts = cell_buffer("grid_cell_counts");
        let cell_cursors = cell_buffer("grid_cell_cursors");
        let cell_offsets = cell_buffer("grid_cell_offsets");

        let chunks = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("grid_chunks"),
            size: total_cells as u64 * std::mem::size_of::<WorldStructureChunk>() as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let index_list = |label: &str| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: max_surfels.max(1) as u64 * 4,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };
        let index_lists = [index_list("grid_index_list_0"), index_list("grid_index_list_1")];

        let scan_bind_group = scan.bind_group(device, &cell_counts, &cell_offsets);

        let grid_layout = layout::bind_group_layout(device, "grid_layout", &[
            layout::storage(0, false),
            layout::storage(1, true),
            layout::storage(2, false),
            layout::storage(3, false),
        ]);
        let write_bind_groups = [0, 1].map(|slot| {
            layout::bind_group(device, "grid_bind_group", &grid_layout, &[
                cell_counts.as_entire_binding(),
                cell_offsets.as_entire_binding(),
                cell_cursors.as_entire_binding(),
                index_lists[slot].as_entire_binding(),
            ])
        });

        let pipeline_layout = layout::pipeline_layout(device, "grid_pipeline_layout", &[common_layout, &grid_layout]);
        let module = common::stage_shader(device, "grid_shader", include_str!("../../shaders/grid.wgsl"));

        log::info!(
            "World structure: {}^3 cells ({} padded to {}), cell size {:.3}, index lists 2 x {:.2} MB",
            grid.dimension,
            total_cells,
            padded,
            grid.cell_size(),
            max_surfels as f64 * 4.0 / (1024.0 * 1024.0)
        );

        Self {
            grid,
            cell_counts,
            cell_cursors,
            cell_offsets,
            chunks,
            index_lists,
            current: 0,
            scan,
            scan_bind_group,
            write_bind_groups,
            count_pipeline: layout::compute_pipeline(device, "grid_count", &pipeline_layout, &module, "count_surfels"),
            scatter_pipeline: layout::compute_pipeline(device, "grid_scatter", &pipeline_layout, &module, "scatter_surfels"),
            chunks_pipeline: layout::compute_pipeline(device, "grid_chunks", &pipeline_layout, &module, "write_chunks"),
        }
    }

    pub fn grid(&self) -> &WorldGrid {
        &self.grid
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn chunks_buffer(&self) -> &wgpu::Buffer {
        &self.chunks
    }

    pub fn index_list(&self, slot: usize) -> &wgpu::Buffer {
        &self.index_lists[slot]
    }

    /// Record the rebuild into `1 - current`. `common` must bind the index
    /// list of slot `current` for reading. Call `flip` after recording.
    pub fn record_rebuild(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        common: &wgpu::BindGroup,
        indirect_args: &wgpu::Buffer,
        profiler: Option<&GpuProfiler>,
    ) {
        let write_group = &self.write_bind_groups[1 - self.current];
        encoder.clear_buffer(&self.cell_counts, 0, None);
        encoder.clear_buffer(&self.cell_cursors, 0, None);

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("grid_count"),
                timestamp_writes: profiler.and_then(|p| p.timestamp_writes(GiStage::Grid, StageSpan::Begin)),
            });
            pass.set_pipeline(&self.count_pipeline);
            pass.set_bind_group(0, common, &[]);
            pass.set_bind_group(1, write_group, &[]);
            pass.dispatch_workgroups_indirect(indirect_args, SURFEL_ARGS_OFFSET);
        }

        self.scan.encode(encoder, &self.scan_bind_group);

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("grid_scatter"),
                timestamp_writes: profiler.and_then(|p| p.timestamp_writes(GiStage::Grid, StageSpan::End)),
            });
            pass.set_bind_group(0, common, &[]);
            pass.set_bind_group(1, write_group, &[]);

            pass.set_pipeline(&self.scatter_pipeline);
            pass.dispatch_workgroups_indirect(indirect_args, SURFEL_ARGS_OFFSET);

            pass.set_pipeline(&self.chunks_pipeline);
            pass.dispatch_workgroups(self.grid.total_cells().div_ceil(SURFEL_WORKGROUP_SIZE), 1, 1);
        }
    }

    /// Make the freshly written index list the one consumers read
    pub fn flip(&mut self) {
        self.current = 1 - self.current;
    }

    /// Zero every run and both index lists
    pub fn reset(&mut self, encoder: &mut wgpu::CommandEncoder) {
        encoder.clear_buffer(&self.chunks, 0, None);
        encoder.clear_buffer(&self.index_lists[0], 0, None);
        encoder.clear_buffer(&self.index_lists[1], 0, None);
        encoder.clear_buffer(&self.cell_counts, 0, None);
        encoder.clear_buffer(&self.cell_cursors, 0, None);
        encoder.clear_buffer(&self.cell_offsets, 0, None);
        self.current = 0;
    }

    /// Bytes held by grid buffers
    pub fn memory_bytes(&self) -> u64 {
        self.cell_counts.size()
            + self.cell_cursors.size()
            + self.cell_offsets.size()
            + self.chunks.size()
            + self.index_lists.iter().map(|list| list.size()).sum::<u64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gi::random::Rng;
    use std::collections::HashSet;

    fn test_grid() -> WorldGrid {
        WorldGrid::from_config(&GridConfig { dimension: 32, world_size: 20.0, world_center: [0.0; 3] })
    }

    fn random_surfels(n: usize, spread: f32, seed: u32) -> Vec<Surfel> {
        let mut rng = Rng::new(seed, 1);
        (0..n)
            .map(|_| {
                let p = Vec3::new(rng.next_f32(), rng.next_f32(), rng.next_f32()) * 2.0 - Vec3::ONE;
                Surfel::new(p * spread, Vec3::Y)
            })
            .collect()
    }

    #[test]
    fn test_cell_lookup() {
        let grid = test_grid();
        assert_eq!(grid.cell_size(), 0.625);
        assert_eq!(grid.total_cells(), 32768);
        assert_eq!(grid.cell_coord(Vec3::splat(-10.0)), Some(UVec3::ZERO));
        assert_eq!(grid.cell_coord(Vec3::splat(9.999)), Some(UVec3::splat(31)));
        assert_eq!(grid.cell_index(Vec3::ZERO), Some(16 + 16 * 32 + 16 * 32 * 32));
        assert_eq!(grid.cell_index(Vec3::new(10.0, 0.0, 0.0)), None);
        assert_eq!(grid.cell_index(Vec3::new(0.0, -10.01, 0.0)), None);
    }

    #[test]
    fn test_bounds_agree_with_cell_index() {
        let grid = test_grid();
        let bounds = grid.bounds();
        for s in random_surfels(500, 12.0, 3) {
            let p = s.position();
            assert_eq!(bounds.contains_point(p), grid.cell_index(p).is_some(), "{:?}", p);
        }
    }

    #[test]
    fn test_cell_range_for_sphere() {
        let grid = test_grid();
        let (lo, hi) = grid.cell_range_for_sphere(Vec3::ZERO, 0.1).unwrap();
        assert_eq!(lo, UVec3::new(15, 15, 15));
        assert_eq!(hi, UVec3::splat(16));

        let (lo, hi) = grid.cell_range_for_sphere(Vec3::splat(-10.0), 1.0).unwrap();
        assert_eq!(lo, UVec3::ZERO);
        assert_eq!(hi, UVec3::ONE);

        assert!(grid.cell_range_for_sphere(Vec3::splat(50.0), 1.0).is_none());
    }

    #[test]
    fn test_rebuild_assigns_every_surfel_to_its_cell() {
        let grid = test_grid();
        let surfels = random_surfels(5000, 9.5, 3);
        let mut world = HostWorldStructure::new(grid);
        world.rebuild(&surfels);

        let total: u32 = world.chunks().iter().map(|c| c.count).sum();
        assert_eq!(total, 5000);

        for cell in 0..grid.total_cells() {
            for &index in world.cell_run(cell) {
                assert_eq!(grid.cell_index(surfels[index as usize].position()), Some(cell));
            }
        }
        let seen: HashSet<u32> = world.index_list().iter().copied().collect();
        assert_eq!(seen.len(), 5000);
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let surfels = random_surfels(3000, 9.0, 11);
        let mut world = HostWorldStructure::new(test_grid());
        world.rebuild(&surfels);
        let first_chunks = world.chunks().to_vec();
        let first_runs: Vec<HashSet<u32>> = (0..world.grid().total_cells())
            .map(|c| world.cell_run(c).iter().copied().collect())
            .collect();
        let first_slot = world.current();

        world.rebuild(&surfels);
        assert_ne!(world.current(), first_slot);
        assert_eq!(world.chunks(), &first_chunks[..]);
        for cell in 0..world.grid().total_cells() {
            let run: HashSet<u32> = world.cell_run(cell).iter().copied().collect();
            assert_eq!(run, first_runs[cell as usize]);
        }
    }

    #[test]
    fn test_rebuild_leaves_out_of_cube_surfels_unindexed() {
        let mut surfels = random_surfels(100, 5.0, 5);
        surfels.push(Surfel::new(Vec3::new(11.0, 0.0, 0.0), Vec3::Y));
        surfels.push(Surfel::new(Vec3::new(0.0, -30.0, 0.0), Vec3::Y));
        let mut world = HostWorldStructure::new(test_grid());
        world.rebuild(&surfels);

        let total: u32 = world.chunks().iter().map(|c| c.count).sum();
        assert_eq!(total, 100);
        assert!(!world.index_list().contains(&100));
        assert!(!world.index_list().contains(&101));
    }

    #[test]
    fn test_double_buffer_keeps_previous_list() {
        let surfels = random_surfels(10, 1.0, 9);
        let mut world = HostWorldStructure::new(test_grid());
        world.rebuild(&surfels);
        let read_slot = world.current();
        let snapshot = world.index_list().to_vec();

        let more = random_surfels(20, 1.0, 10);
        world.rebuild(&more);
        assert_eq!(world.index_list_slot(read_slot), &snapshot[..]);
        assert_eq!(world.index_list().len(), 20);
    }

    #[test]
    fn test_memory_bytes_counts_cells_and_lists() {
        let grid = test_grid();
        let mut world = HostWorldStructure::new(grid);
        let padded = scan::padded_len(grid.total_cells()) as u64;
        let empty = world.memory_bytes();
        assert_eq!(empty, padded * 12 + grid.total_cells() as u64 * 8);

        world.rebuild(&random_surfels(500, 9.0, 17));
        assert!(world.memory_bytes() >= empty + 500 * 4);
    }

    #[test]
    fn test_reset_clears_everything() {
        let surfels = random_surfels(500, 9.0, 13);
        let mut world = HostWorldStructure::new(test_grid());
        world.rebuild(&surfels);
        world.rebuild(&surfels);
        world.reset();

        assert!(world.chunks().iter().all(|c| *c == WorldStructureChunk::default()));
        assert!(world.index_list_slot(0).is_empty());
        assert!(world.index_list_slot(1).is_empty());
    }

    #[test]
    fn test_for_each_nearby_finds_neighbours() {
        let surfels = vec![
            Surfel::new(Vec3::new(0.0, 0.0, 0.0), Vec3::Y),
            Surfel::new(Vec3::new(0.1, 0.0, 0.0), Vec3::Y),
            Surfel::new(Vec3::new(5.0, 0.0, 0.0), Vec3::Y),
        ];
        let mut world = HostWorldStructure::new(test_grid());
        world.rebuild(&surfels);

        let mut found = Vec::new();
        world.for_each_nearby(Vec3::new(0.05, 0.0, 0.0), 0.2, |i| found.push(i));
        found.sort();
        assert_eq!(found, vec![0, 1]);
    }
}
