//! GPU upload of scene primitives for the irradiance tracer

use bytemuck::{Pod, Zeroable};

use crate::render::layout;
use super::primitives::{Scene, SceneTracer};

/// Scene lighting and primitive counts (must match `SceneUniforms` in irradiance.wgsl)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct SceneUniforms {
    /// xyz direction towards the sun
    pub sun_direction: [f32; 4],
    /// rgb colour, w intensity
    pub sun_color: [f32; 4],
    pub sky_color: [f32; 4],
    /// sphere count, box count
    pub counts: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct GpuSphere {
    pub center_radius: [f32; 4],
    pub albedo: [f32; 4],
    pub emission: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct GpuBox {
    pub min: [f32; 4],
    pub max: [f32; 4],
    pub albedo: [f32; 4],
    pub emission: [f32; 4],
}

impl SceneUniforms {
    pub fn from_scene(scene: &Scene) -> Self {
        let (sun_dir, _) = scene.sun();
        Self {
            sun_direction: sun_dir.extend(0.0).to_array(),
            sun_color: scene.lighting.sun_color().extend(scene.lighting.sun_intensity).to_array(),
            sky_color: scene.sky().extend(1.0).to_array(),
            counts: [scene.spheres.len() as u32, scene.boxes.len() as u32, 0, 0],
        }
    }
}

fn pack_spheres(scene: &Scene) -> Vec<GpuSphere> {
    scene
        .spheres
        .iter()
        .map(|s| GpuSphere {
            center_radius: s.center.extend(s.radius).to_array(),
            albedo: s.material.albedo.extend(1.0).to_array(),
            emission: s.material.emission.extend(0.0).to_array(),
        })
        .collect()
}

fn pack_boxes(scene: &Scene) -> Vec<GpuBox> {
    scene
        .boxes
        .iter()
        .map(|b| GpuBox {
            min: b.bounds.min.extend(0.0).to_array(),
            max: b.bounds.max.extend(0.0).to_array(),
            albedo: b.material.albedo.extend(1.0).to_array(),
            emission: b.material.emission.extend(0.0).to_array(),
        })
        .collect()
}

/// Scene primitive buffers bound as group 1 of the irradiance pass
pub struct SceneBuffer {
    uniform_buffer: wgpu::Buffer,
    #[allow(dead_code)]
    sphere_buffer: wgpu::Buffer,
    #[allow(dead_code)]
    box_buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    sphere_count: usize,
    box_count: usize,
}

impl SceneBuffer {
    /// Layout shared by every `SceneBuffer` (uniforms, spheres, boxes)
    pub fn create_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
        layout::bind_group_layout(device, "scene_layout", &[
            layout::uniform(0),
            layout::storage(1, true),
            layout::storage(2, true),
        ])
    }

    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, layout: &wgpu::BindGroupLayout, scene: &Scene) -> Self {
        let spheres = pack_spheres(scene);
        let boxes = pack_boxes(scene);

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("scene_uniforms"),
            size: std::mem::size_of::<SceneUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(&uniform_buffer, 0, bytemuck::bytes_of(&SceneUniforms::from_scene(scene)));

        // Storage bindings can't be empty; unused slots are masked by the counts
        let sphere_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("scene_spheres"),
            size: (spheres.len().max(1) * std::mem::size_of::<GpuSphere>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(&sphere_buffer, 0, bytemuck::cast_slice(&spheres));

        let box_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("scene_boxes"),
            size: (boxes.len().max(1) * std::mem::size_of::<GpuBox>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(&box_buffer, 0, bytemuck::cast_slice(&boxes));

        let bind_group = layout::bind_group(device, "scene_bind_group", layout, &[
            uniform_buffer.as_entire_binding(),
            sphere_buffer.as_entire_binding(),
            box_buffer.as_entire_binding(),
        ]);

        log::info!("Uploaded scene: {} spheres, {} boxes", spheres.len(), boxes.len());

        Self {
            uniform_buffer,
            sphere_buffer,
            box_buffer,
            bind_group,
            sphere_count: spheres.len(),
            box_count: boxes.len(),
        }
    }

    /// Re-upload lighting (sun, sky) without touching geometry
    pub fn update_lighting(&self, queue: &wgpu::Queue, scene: &Scene) {
        let mut uniforms = SceneUniforms::from_scene(scene);
        uniforms.counts = [self.sphere_count as u32, self.box_count as u32, 0, 0];
        queue.write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
    }

    pub fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }

    pub fn primitive_count(&self) -> usize {
        self.sphere_count + self.box_count
    }
}
