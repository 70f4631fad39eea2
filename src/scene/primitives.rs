//! Analytic scene primitives and the host ray tracing interface

use crate::core::types::Vec3;
use crate::math::{Aabb, Ray, RayHit};
use super::config::SceneConfig;

/// Lambertian surface with optional emission
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Material {
    pub albedo: Vec3,
    pub emission: Vec3,
}

impl Material {
    pub fn diffuse(albedo: Vec3) -> Self {
        Self { albedo, emission: Vec3::ZERO }
    }

    pub fn emissive(emission: Vec3) -> Self {
        Self { albedo: Vec3::ZERO, emission }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
    pub material: Material,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SceneBox {
    pub bounds: Aabb,
    pub material: Material,
}

/// Closest surface hit along a ray
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SceneHit {
    pub t: f32,
    pub position: Vec3,
    /// Geometric normal, flipped to face the ray origin
    pub normal: Vec3,
    pub material: Material,
}

/// Ray queries the irradiance accumulator needs from a scene
pub trait SceneTracer: Sync {
    /// Closest hit in (0, t_max)
    fn trace(&self, ray: &Ray, t_max: f32) -> Option<SceneHit>;
    /// Any hit along the ray
    fn occluded(&self, ray: &Ray) -> bool;
    /// Radiance for rays that escape
    fn sky(&self) -> Vec3;
    /// Unit direction towards the sun and its irradiance (colour x intensity)
    fn sun(&self) -> (Vec3, Vec3);
}

/// Flat list of spheres and boxes lit by a sun and a constant sky
#[derive(Clone, Debug, Default)]
pub struct Scene {
    pub spheres: Vec<Sphere>,
    pub boxes: Vec<SceneBox>,
    pub lighting: SceneConfig,
}

impl Scene {
    pub fn new(lighting: SceneConfig) -> Self {
        Self { spheres: Vec::new(), boxes: Vec::new(), lighting }
    }

    pub fn add_sphere(&mut self, center: Vec3, radius: f32, material: Material) -> &mut Self {
        self.spheres.push(Sphere { center, radius, material });
        self
    }

    pub fn add_box(&mut self, min: Vec3, max: Vec3, material: Material) -> &mut Self {
        self.boxes.push(SceneBox { bounds: Aabb::new(min, max), material });
        self
    }

    /// Open-fronted coloured room (interior 8 units wide, centred at the
    /// origin, floor at y = -4) with two spheres and a ceiling light.
    /// The camera at (0, 0, 11) looking at the origin sees inside.
    pub fn cornell_box(lighting: SceneConfig) -> Self {
        let white = Material::diffuse(Vec3::splat(0.75));
        let red = Material::diffuse(Vec3::new(0.75, 0.1, 0.1));
        let green = Material::diffuse(Vec3::new(0.1, 0.75, 0.1));
        let t = 0.25;
        let h = 4.0;

        let mut scene = Self::new(lighting);
        scene
            .add_box(Vec3::new(-h - t, -h - t, -h - t), Vec3::new(h + t, -h, h), white) // floor
            .add_box(Vec3::new(-h - t, h, -h - t), Vec3::new(h + t, h + t, h), white) // ceiling
            .add_box(Vec3::new(-h - t, -h, -h - t), Vec3::new(h + t, h, -h), white) // back
            .add_box(Vec3::new(-h - t, -h, -h), Vec3::new(-h, h, h), red) // left
            .add_box(Vec3::new(h, -h, -h), Vec3::new(h + t, h, h), green) // right
            .add_box(Vec3::new(-1.0, h - 0.05, -1.0), Vec3::new(1.0, h, 1.0), Material::emissive(Vec3::splat(8.0)))
            .add_sphere(Vec3::new(-1.5, -2.5, -1.0), 1.5, white)
            .add_sphere(Vec3::new(1.8, -3.0, 1.0), 1.0, Material::diffuse(Vec3::new(0.9, 0.8, 0.3)));
        scene
    }
}

impl SceneTracer for Scene {
    fn trace(&self, ray: &Ray, t_max: f32) -> Option<SceneHit> {
        let mut closest: Option<(RayHit, Material)> = None;
        let mut limit = t_max;

        for sphere in &self.spheres {
            if let Some(hit) = ray.hit_sphere(sphere.center, sphere.radius, limit) {
                limit = hit.t;
                closest = Some((hit, sphere.material));
            }
        }
        for b in &self.boxes {
            if let Some(hit) = ray.hit_aabb(&b.bounds, limit) {
                limit = hit.t;
                closest = Some((hit, b.material));
            }
        }

        closest.map(|(hit, material)| {
            let normal = if hit.normal.dot(ray.direction) > 0.0 { -hit.normal } else { hit.normal };
            SceneHit {
                t: hit.t,
                position: ray.at(hit.t),
                normal,
                material,
            }
        })
    }

    fn occluded(&self, ray: &Ray) -> bool {
        self.spheres.iter().any(|s| ray.hit_sphere(s.center, s.radius, f32::MAX).is_some())
            || self.boxes.iter().any(|b| ray.hit_aabb(&b.bounds, f32::MAX).is_some())
    }

    fn sky(&self) -> Vec3 {
        self.lighting.sky_color()
    }

    fn sun(&self) -> (Vec3, Vec3) {
        (
            self.lighting.sun_direction(),
            self.lighting.sun_color() * self.lighting.sun_intensity,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_picks_closest() {
        let mut scene = Scene::default();
        scene
            .add_sphere(Vec3::new(0.0, 0.0, -10.0), 1.0, Material::diffuse(Vec3::X))
            .add_sphere(Vec3::new(0.0, 0.0, -5.0), 1.0, Material::diffuse(Vec3::Y));
        let ray = Ray::new(Vec3::ZERO, -Vec3::Z);
        let hit = scene.trace(&ray, f32::MAX).unwrap();
        assert!((hit.t - 4.0).abs() < 1e-4);
        assert_eq!(hit.material.albedo, Vec3::Y);
        assert!((hit.normal - Vec3::Z).length() < 1e-4);
    }

    #[test]
    fn test_trace_respects_t_max() {
        let mut scene = Scene::default();
        scene.add_box(Vec3::new(-1.0, -1.0, -6.0), Vec3::new(1.0, 1.0, -5.0), Material::diffuse(Vec3::ONE));
        let ray = Ray::new(Vec3::ZERO, -Vec3::Z);
        assert!(scene.trace(&ray, 4.0).is_none());
        assert!(scene.trace(&ray, 6.0).is_some());
        assert!(scene.occluded(&ray));
        assert!(!scene.occluded(&Ray::new(Vec3::ZERO, Vec3::Z)));
    }

    #[test]
    fn test_cornell_box_encloses_origin() {
        let scene = Scene::cornell_box(SceneConfig::default());
        for dir in [Vec3::X, -Vec3::X, Vec3::Y, -Vec3::Y, -Vec3::Z] {
            let hit = scene.trace(&Ray::new(Vec3::ZERO, dir), f32::MAX);
            assert!(hit.is_some(), "escaped along {:?}", dir);
            assert!(hit.unwrap().normal.dot(dir) < 0.0);
        }
        // Open front
        assert!(scene.trace(&Ray::new(Vec3::new(0.0, 3.0, 0.0), Vec3::Z), f32::MAX).is_none());
    }
}
