//! Bind group 0 shared by every GI pass: uniforms, surfel pool, counters,
//! chunk records and the index list being read this frame.

use crate::render::layout;
use super::data::PIXEL_WORKGROUP_SIZE;

/// Declarations prepended to every GI stage shader
pub const COMMON_WGSL: &str = include_str!("../../shaders/gi_common.wgsl");

pub fn common_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    layout::bind_group_layout(device, "gi_common_layout", &[
        layout::uniform(0),
        layout::storage(1, false),
        layout::storage(2, false),
        layout::storage(3, false),
        layout::storage(4, true),
    ])
}

/// Buffers bound as group 0
pub struct CommonResources<'a> {
    pub uniforms: &'a wgpu::Buffer,
    pub surfels: &'a wgpu::Buffer,
    pub counters: &'a wgpu::Buffer,
    pub chunks: &'a wgpu::Buffer,
    /// Index list of the slot consumers read
    pub index_list: &'a wgpu::Buffer,
}

pub fn common_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    resources: &CommonResources<'_>,
) -> wgpu::BindGroup {
    layout::bind_group(device, "gi_common_bind_group", layout, &[
        resources.uniforms.as_entire_binding(),
        resources.surfels.as_entire_binding(),
        resources.counters.as_entire_binding(),
        resources.chunks.as_entire_binding(),
        resources.index_list.as_entire_binding(),
    ])
}

/// Compile a GI stage shader with the shared declarations in front
pub fn stage_shader(device: &wgpu::Device, label: &str, stage_source: &str) -> wgpu::ShaderModule {
    let source = format!("{}\n{}", COMMON_WGSL, stage_source);
    layout::shader_module(device, label, &source)
}

/// Output texture written by a compute pass and read back or sampled later
pub fn output_texture(
    device: &wgpu::Device,
    label: &str,
    (width, height): (u32, u32),
    format: wgpu::TextureFormat,
) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d { width: width.max(1), height: height.max(1), depth_or_array_layers: 1 },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::STORAGE_BINDING
            | wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

/// Workgroups covering a screen with the 8x8 per-pixel passes
pub fn pixel_workgroups(width: u32, height: u32) -> (u32, u32) {
    (width.div_ceil(PIXEL_WORKGROUP_SIZE), height.div_ceil(PIXEL_WORKGROUP_SIZE))
}
