//! Exclusive prefix sum (stream compaction offsets).
//!
//! Two-level scan: 1024-element blocks are scanned locally, the block
//! totals are scanned by a single workgroup, then the scanned totals are
//! added back onto every block. One pass of this covers up to 1024² inputs.

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

use crate::render::layout;

/// Elements per scan block
pub const SCAN_BLOCK_SIZE: u32 = 1024;
/// Largest input a single two-level scan covers
pub const SCAN_CAPACITY: u32 = SCAN_BLOCK_SIZE * SCAN_BLOCK_SIZE;
const SCAN_THREADS: u32 = 256;

/// Round `len` up to a whole number of scan blocks
pub fn padded_len(len: u32) -> u32 {
    len.div_ceil(SCAN_BLOCK_SIZE).max(1) * SCAN_BLOCK_SIZE
}

/// Sequential exclusive scan; returns the grand total
pub fn exclusive_scan(input: &[u32], output: &mut [u32]) -> u32 {
    assert_eq!(input.len(), output.len());
    let mut sum = 0u32;
    for (out, &value) in output.iter_mut().zip(input) {
        *out = sum;
        sum += value;
    }
    sum
}

/// Host version of the GPU scan: same three phases, blocks in parallel
pub fn exclusive_scan_blocked(input: &[u32], output: &mut [u32], block_size: usize) -> u32 {
    assert_eq!(input.len(), output.len());
    let block_count = input.len().div_ceil(block_size);
    assert!(
        block_count <= block_size,
        "scan of {} elements exceeds two-level capacity {}",
        input.len(),
        block_size * block_size
    );

    let block_sums: Vec<u32> = output
        .par_chunks_mut(block_size)
        .zip(input.par_chunks(block_size))
        .map(|(out, inp)| exclusive_scan(inp, out))
        .collect();

    let mut block_offsets = vec![0u32; block_sums.len()];
    let total = exclusive_scan(&block_sums, &mut block_offsets);

    output
        .par_chunks_mut(block_size)
        .zip(block_offsets.par_iter())
        .for_each(|(out, &offset)| out.iter_mut().for_each(|v| *v += offset));

    total
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ScanParams {
    element_count: u32,
    block_count: u32,
    _pad: [u32; 2],
}

/// GPU exclusive scan over a fixed element count
pub struct ExclusiveScan {
    element_count: u32,
    block_count: u32,
    params_buffer: wgpu::Buffer,
    block_sums: wgpu::Buffer,
    bind_group_layout: wgpu::BindGroupLayout,
    scan_blocks: wgpu::ComputePipeline,
    scan_block_sums: wgpu::ComputePipeline,
    add_block_offsets: wgpu::ComputePipeline,
}

impl ExclusiveScan {
    /// Build a scan for `element_count` inputs.
    ///
    /// Panics if `element_count` exceeds `SCAN_CAPACITY`; callers validate
    /// grid sizes up front.
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, element_count: u32) -> Self {
        assert!(
            element_count <= SCAN_CAPACITY,
            "exclusive scan of {} elements exceeds capacity {}",
            element_count,
            SCAN_CAPACITY
        );
        let block_count = element_count.div_ceil(SCAN_BLOCK_SIZE).max(1);

        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("scan_params"),
            size: std::mem::size_of::<ScanParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(
            &params_buffer,
            0,
            bytemuck::bytes_of(&ScanParams { element_count, block_count, _pad: [0; 2] }),
        );

        let block_sums = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("scan_block_sums"),
            size: block_count as u64 * 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let bind_group_layout = layout::bind_group_layout(device, "scan_layout", &[
            layout::uniform(0),
            layout::storage(1, true),
            layout::storage(2, false),
            layout::storage(3, false),
        ]);
        let pipeline_layout = layout::pipeline_layout(device, "scan_pipeline_layout", &[&bind_group_layout]);
        let module = layout::shader_module(device, "scan_shader", include_str!("../../shaders/scan.wgsl"));

        Self {
            element_count,
            block_count,
            params_buffer,
            block_sums,
            scan_blocks: layout::compute_pipeline(device, "scan_blocks", &pipeline_layout, &module, "scan_blocks"),
            scan_block_sums: layout::compute_pipeline(device, "scan_block_sums", &pipeline_layout, &module, "scan_block_sums"),
            add_block_offsets: layout::compute_pipeline(device, "add_block_offsets", &pipeline_layout, &module, "add_block_offsets"),
            bind_group_layout,
        }
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    /// Bind `input` (read) and `output` (written). Both must hold at least
    /// `element_count` u32s and must be distinct buffers.
    pub fn bind_group(&self, device: &wgpu::Device, input: &wgpu::Buffer, output: &wgpu::Buffer) -> wgpu::BindGroup {
        layout::bind_group(device, "scan_bind_group", &self.bind_group_layout, &[
            self.params_buffer.as_entire_binding(),
            input.as_entire_binding(),
            output.as_entire_binding(),
            self.block_sums.as_entire_binding(),
        ])
    }

    /// Record the three scan dispatches into an existing compute pass
    pub fn record(&self, pass: &mut wgpu::ComputePass<'_>, bind_group: &wgpu::BindGroup) {
        pass.set_bind_group(0, bind_group, &[]);

        pass.set_pipeline(&self.scan_blocks);
        pass.dispatch_workgroups(self.block_count, 1, 1);

        pass.set_pipeline(&self.scan_block_sums);
        pass.dispatch_workgroups(1, 1, 1);

        pass.set_pipeline(&self.add_block_offsets);
        pass.dispatch_workgroups(self.element_count.div_ceil(SCAN_THREADS), 1, 1);
    }

    /// Record the scan in its own compute pass
    pub fn encode(&self, encoder: &mut wgpu::CommandEncoder, bind_group: &wgpu::BindGroup) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("exclusive_scan"),
            timestamp_writes: None,
        });
        self.record(&mut pass, bind_group);
    }
}
