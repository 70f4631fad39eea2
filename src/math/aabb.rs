//! Axis-aligned boxes (scene boxes and the GI world cube)

use crate::core::types::Vec3;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Cube of edge length `size` centred on `center`
    pub fn cube(center: Vec3, size: f32) -> Self {
        let half = Vec3::splat(size * 0.5);
        Self::new(center - half, center + half)
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extent(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// Half-open containment, matching grid cell assignment
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmplt(self.max).all()
    }

    /// Outward normal of the face nearest to `p`
    pub fn face_normal(&self, p: Vec3) -> Vec3 {
        let local = (p - self.center()) / self.half_extent().max(Vec3::splat(1e-6));
        let a = local.abs();
        if a.x >= a.y && a.x >= a.z {
            Vec3::new(local.x.signum(), 0.0, 0.0)
        } else if a.y >= a.z {
            Vec3::new(0.0, local.y.signum(), 0.0)
        } else {
            Vec3::new(0.0, 0.0, local.z.signum())
        }
    }
}
