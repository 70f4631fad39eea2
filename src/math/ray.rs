//! Ray type and primitive intersection

use crate::core::types::Vec3;
use super::aabb::Aabb;

/// A ray defined by origin and direction
#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
    /// Precomputed 1/direction for fast AABB intersection
    pub inv_direction: Vec3,
}

/// Closest intersection along a ray
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayHit {
    /// Ray parameter of the hit
    pub t: f32,
    /// Outward surface normal at the hit
    pub normal: Vec3,
}

impl Ray {
    /// Create a new ray (direction should be normalized)
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction,
            inv_direction: Vec3::new(
                1.0 / direction.x,
                1.0 / direction.y,
                1.0 / direction.z,
            ),
        }
    }

    /// Get point along ray at parameter t
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Ray-AABB intersection using slab method
    /// Returns Some((t_near, t_far)) if intersection, None otherwise
    pub fn intersects_aabb(&self, aabb: &Aabb) -> Option<(f32, f32)> {
        let t1 = (aabb.min - self.origin) * self.inv_direction;
        let t2 = (aabb.max - self.origin) * self.inv_direction;

        let t_min = t1.min(t2);
        let t_max = t1.max(t2);

        let t_near = t_min.x.max(t_min.y).max(t_min.z);
        let t_far = t_max.x.min(t_max.y).min(t_max.z);

        if t_near <= t_far && t_far >= 0.0 {
            Some((t_near.max(0.0), t_far))
        } else {
            None
        }
    }

    /// First surface hit against a solid box, ignoring hits from inside
    pub fn hit_aabb(&self, aabb: &Aabb, t_max: f32) -> Option<RayHit> {
        let (t_near, _) = self.intersects_aabb(aabb)?;
        if t_near <= 0.0 || t_near >= t_max {
            return None;
        }
        Some(RayHit {
            t: t_near,
            normal: aabb.face_normal(self.at(t_near)),
        })
    }

    /// First surface hit against a sphere
    pub fn hit_sphere(&self, center: Vec3, radius: f32, t_max: f32) -> Option<RayHit> {
        let oc = self.origin - center;
        let b = oc.dot(self.direction);
        let c = oc.length_squared() - radius * radius;
        let disc = b * b - c;
        if disc < 0.0 {
            return None;
        }
        let sqrt_disc = disc.sqrt();
        let mut t = -b - sqrt_disc;
        if t <= 0.0 {
            t = -b + sqrt_disc;
        }
        if t <= 0.0 || t >= t_max {
            return None;
        }
        Some(RayHit {
            t,
            normal: (self.at(t) - center) / radius,
        })
    }
}
