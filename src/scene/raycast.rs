//! Primary-ray G-buffer generation for headless runs and tests

use rayon::prelude::*;

use crate::core::camera::Camera;
use crate::core::types::{Vec2, Vec3};
use crate::math::Ray;
use crate::render::texture::GBufferImage;
use super::primitives::SceneTracer;

/// Ray cast one primary ray per pixel centre, writing linear view depth,
/// camera-facing world normal and albedo. Misses stay sky (depth 0).
pub fn render_gbuffer(scene: &dyn SceneTracer, camera: &Camera, width: u32, height: u32) -> GBufferImage {
    let mut image = GBufferImage::new(width, height);
    let forward = camera.forward();

    let rows: Vec<Vec<(f32, Vec3, Vec3)>> = (0..height)
        .into_par_iter()
        .map(|y| {
            (0..width)
                .map(|x| {
                    let uv = Vec2::new((x as f32 + 0.5) / width as f32, (y as f32 + 0.5) / height as f32);
                    let ray = Ray::new(camera.position, camera.ray_direction(uv));
                    match scene.trace(&ray, camera.far) {
                        Some(hit) => (
                            (hit.position - camera.position).dot(forward),
                            hit.normal,
                            hit.material.albedo,
                        ),
                        None => (0.0, Vec3::ZERO, Vec3::ZERO),
                    }
                })
                .collect()
        })
        .collect();

    for (y, row) in rows.into_iter().enumerate() {
        for (x, (depth, normal, albedo)) in row.into_iter().enumerate() {
            image.set(x as u32, y as u32, depth, normal, albedo);
        }
    }
    image
}
