//! G-buffer inputs consumed by the GI passes

use half::f16;
use wgpu::{Device, Extent3d, Queue, Texture, TextureView};

use crate::core::types::Vec3;

/// Host-side G-buffer (one entry per pixel, row-major, top row first)
#[derive(Clone, Debug)]
pub struct GBufferImage {
    pub width: u32,
    pub height: u32,
    /// Linear view depth; 0 marks sky / no geometry
    pub depth: Vec<f32>,
    /// World-space unit normals
    pub normal: Vec<Vec3>,
    /// Linear base colour
    pub albedo: Vec<Vec3>,
}

impl GBufferImage {
    /// Empty (all sky) G-buffer
    pub fn new(width: u32, height: u32) -> Self {
        let n = (width * height) as usize;
        Self {
            width,
            height,
            depth: vec![0.0; n],
            normal: vec![Vec3::ZERO; n],
            albedo: vec![Vec3::ZERO; n],
        }
    }

    #[inline]
    pub fn index(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize
    }

    pub fn set(&mut self, x: u32, y: u32, depth: f32, normal: Vec3, albedo: Vec3) {
        let i = self.index(x, y);
        self.depth[i] = depth;
        self.normal[i] = normal;
        self.albedo[i] = albedo;
    }

    pub fn has_geometry(&self, x: u32, y: u32) -> bool {
        self.depth[self.index(x, y)] > 0.0
    }

    fn depth_bytes(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.depth).to_vec()
    }

    fn normal_bytes(&self) -> Vec<u8> {
        self.normal
            .iter()
            .flat_map(|n| [n.x, n.y, n.z, 1.0])
            .flat_map(|v| f16::from_f32(v).to_bits().to_le_bytes())
            .collect()
    }

    fn albedo_bytes(&self) -> Vec<u8> {
        self.albedo
            .iter()
            .flat_map(|c| {
                let c = (c.clamp(Vec3::ZERO, Vec3::ONE) * 255.0).round();
                [c.x as u8, c.y as u8, c.z as u8, 255]
            })
            .collect()
    }
}

/// GPU G-buffer textures read by the GI compute passes
///
/// - depth: linear view depth (R32Float, 0 = sky)
/// - normal: world-space normal (Rgba16Float, xyz)
/// - albedo: base colour (Rgba8Unorm)
pub struct GBuffer {
    depth: Texture,
    normal: Texture,
    albedo: Texture,
    depth_view: TextureView,
    normal_view: TextureView,
    albedo_view: TextureView,
    width: u32,
    height: u32,
}

impl GBuffer {
    pub fn new(device: &Device, width: u32, height: u32) -> Self {
        let depth = Self::create_texture(device, "gbuffer_depth", width, height, wgpu::TextureFormat::R32Float);
        let normal = Self::create_texture(device, "gbuffer_normal", width, height, wgpu::TextureFormat::Rgba16Float);
        let albedo = Self::create_texture(device, "gbuffer_albedo", width, height, wgpu::TextureFormat::Rgba8Unorm);

        let depth_view = depth.create_view(&wgpu::TextureViewDescriptor::default());
        let normal_view = normal.create_view(&wgpu::TextureViewDescriptor::default());
        let albedo_view = albedo.create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            depth,
            normal,
            albedo,
            depth_view,
            normal_view,
            albedo_view,
            width,
            height,
        }
    }

    fn create_texture(device: &Device, label: &str, width: u32, height: u32, format: wgpu::TextureFormat) -> Texture {
        device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        })
    }

    /// Create a G-buffer sized to `image` and upload it
    pub fn from_image(device: &Device, queue: &Queue, image: &GBufferImage) -> Self {
        let gbuffer = Self::new(device, image.width, image.height);
        gbuffer.upload(queue, image);
        gbuffer
    }

    /// Copy host G-buffer contents into the textures (sizes must match)
    pub fn upload(&self, queue: &Queue, image: &GBufferImage) {
        debug_assert_eq!((image.width, image.height), (self.width, self.height));
        write_texture(queue, &self.depth, &image.depth_bytes(), 4, self.width, self.height);
        write_texture(queue, &self.normal, &image.normal_bytes(), 8, self.width, self.height);
        write_texture(queue, &self.albedo, &image.albedo_bytes(), 4, self.width, self.height);
    }

    pub fn depth_view(&self) -> &TextureView {
        &self.depth_view
    }

    pub fn normal_view(&self) -> &TextureView {
        &self.normal_view
    }

    pub fn albedo_view(&self) -> &TextureView {
        &self.albedo_view
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

fn write_texture(queue: &Queue, texture: &Texture, data: &[u8], bytes_per_pixel: u32, width: u32, height: u32) {
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        data,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(width * bytes_per_pixel),
            rows_per_image: Some(height),
        },
        Extent3d { width, height, depth_or_array_layers: 1 },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_layout() {
        let mut image = GBufferImage::new(4, 3);
        assert!(!image.has_geometry(1, 2));
        image.set(1, 2, 3.5, Vec3::Y, Vec3::splat(0.5));
        assert!(image.has_geometry(1, 2));
        assert_eq!(image.depth[9], 3.5);
    }

    #[test]
    fn test_upload_byte_sizes() {
        let image = GBufferImage::new(5, 2);
        assert_eq!(image.depth_bytes().len(), 5 * 2 * 4);
        assert_eq!(image.normal_bytes().len(), 5 * 2 * 8);
        assert_eq!(image.albedo_bytes().len(), 5 * 2 * 4);
    }

    #[test]
    fn test_albedo_quantisation() {
        let mut image = GBufferImage::new(1, 1);
        image.set(0, 0, 1.0, Vec3::Z, Vec3::new(1.0, 0.5, 2.0));
        assert_eq!(image.albedo_bytes(), vec![255, 128, 255, 255]);
    }

    #[test]
    fn test_normal_encoding_is_f16() {
        let mut image = GBufferImage::new(1, 1);
        image.set(0, 0, 1.0, Vec3::new(0.0, -1.0, 0.5), Vec3::ONE);
        let bytes = image.normal_bytes();
        let channel = |i: usize| f16::from_bits(u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]])).to_f32();
        assert_eq!(channel(0), 0.0);
        assert_eq!(channel(1), -1.0);
        assert_eq!(channel(2), 0.5);
        assert_eq!(channel(3), 1.0);
    }
}
