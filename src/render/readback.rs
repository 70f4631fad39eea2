//! Blocking GPU readback and PNG encoding for diagnostics and captures

use std::path::Path;

use base64::Engine;
use image::ImageEncoder;

use crate::core::error::Error;
use crate::core::types::{Result, Vec3};

/// Row pitch required by `copy_texture_to_buffer`
pub fn padded_bytes_per_row(width: u32, bytes_per_pixel: u32) -> u32 {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    (width * bytes_per_pixel).div_ceil(align) * align
}

fn map_staging(device: &wgpu::Device, staging: &wgpu::Buffer) -> Result<()> {
    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        tx.send(result).ok();
    });
    device
        .poll(wgpu::PollType::Wait { submission_index: None, timeout: None })
        .map_err(|e| Error::Readback(format!("device poll failed: {:?}", e)))?;
    rx.recv()
        .map_err(|e| Error::Readback(e.to_string()))?
        .map_err(|e| Error::Readback(format!("buffer map failed: {:?}", e)))
}

/// Copy `count` elements starting at element `first` out of a GPU buffer.
/// The buffer needs `COPY_SRC` usage. Stalls until the GPU is idle.
pub fn read_buffer<T: bytemuck::Pod>(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    buffer: &wgpu::Buffer,
    first: u64,
    count: u64,
) -> Result<Vec<T>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let stride = std::mem::size_of::<T>() as u64;
    let size = (count * stride).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
    let offset = first * stride;
    if offset + size > buffer.size() {
        return Err(Error::Readback(format!(
            "range {}..{} exceeds buffer size {}",
            offset,
            offset + size,
            buffer.size()
        )));
    }

    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("readback_staging"),
        size,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("readback_encoder"),
    });
    encoder.copy_buffer_to_buffer(buffer, offset, &staging, 0, size);
    queue.submit(std::iter::once(encoder.finish()));

    map_staging(device, &staging)?;
    let data = staging.slice(..).get_mapped_range();
    let values: Vec<T> = data[..(count * stride) as usize]
        .chunks_exact(stride as usize)
        .map(bytemuck::pod_read_unaligned)
        .collect();
    drop(data);
    staging.unmap();
    Ok(values)
}

/// Read an Rgba8Unorm or Rgba16Float texture as tightly packed RGBA8.
/// Float textures are clamped and gamma encoded.
pub fn read_texture_rgba8(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
) -> Result<Vec<u8>> {
    let (width, height) = (texture.width(), texture.height());
    let bytes_per_pixel = match texture.format() {
        wgpu::TextureFormat::Rgba8Unorm => 4,
        wgpu::TextureFormat::Rgba16Float => 8,
        other => return Err(Error::Readback(format!("unsupported readback format {:?}", other))),
    };
    let row_pitch = padded_bytes_per_row(width, bytes_per_pixel);

    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("texture_readback_staging"),
        size: (row_pitch * height) as u64,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("texture_readback_encoder"),
    });
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &staging,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(row_pitch),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
    );
    queue.submit(std::iter::once(encoder.finish()));

    map_staging(device, &staging)?;
    let data = staging.slice(..).get_mapped_range();
    let mut rgba8 = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        let row = &data[(y * row_pitch) as usize..][..(width * bytes_per_pixel) as usize];
        if bytes_per_pixel == 4 {
            rgba8.extend_from_slice(row);
        } else {
            for bits in row.chunks_exact(2) {
                let f = half::f16::from_bits(u16::from_le_bytes([bits[0], bits[1]])).to_f32();
                rgba8.push(encode_channel(f));
            }
        }
    }
    drop(data);
    staging.unmap();
    Ok(rgba8)
}

/// Linear value to an 8-bit gamma-encoded channel
#[inline]
pub fn encode_channel(linear: f32) -> u8 {
    (linear.clamp(0.0, 1.0).powf(1.0 / 2.2) * 255.0).round() as u8
}

/// Linear RGB image to RGBA8 (gamma encoded, opaque)
pub fn rgb_to_rgba8(pixels: &[Vec3]) -> Vec<u8> {
    pixels
        .iter()
        .flat_map(|c| [encode_channel(c.x), encode_channel(c.y), encode_channel(c.z), 255])
        .collect()
}

pub fn encode_png(rgba8: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let mut png_data = Vec::new();
    image::codecs::png::PngEncoder::new(&mut png_data).write_image(
        rgba8,
        width,
        height,
        image::ExtendedColorType::Rgba8,
    )?;
    Ok(png_data)
}

pub fn write_png(path: &Path, rgba8: &[u8], width: u32, height: u32) -> Result<()> {
    std::fs::write(path, encode_png(rgba8, width, height)?)?;
    log::info!("Wrote {}x{} image to {}", width, height, path.display());
    Ok(())
}

/// PNG encoded as base64 for the debug protocol
pub fn png_base64(rgba8: &[u8], width: u32, height: u32) -> Result<String> {
    Ok(base64::engine::general_purpose::STANDARD.encode(encode_png(rgba8, width, height)?))
}
