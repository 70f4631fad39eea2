//! Stateless hash-based random numbers, bit-identical to `gi_common.wgsl`.

use std::f32::consts::TAU;

use crate::core::types::Vec3;

/// PCG output hash (Jarzynski & Olano 2020)
#[inline]
pub fn pcg_hash(v: u32) -> u32 {
    let state = v.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    (word >> 22) ^ word
}

/// Hash two values into one
#[inline]
pub fn hash2(a: u32, b: u32) -> u32 {
    pcg_hash(a ^ pcg_hash(b))
}

/// Map a hash to [0, 1) using its top 24 bits
#[inline]
pub fn to_unit_float(h: u32) -> f32 {
    (h >> 8) as f32 / 16_777_216.0
}

/// Per-frame seed; wall-clock time is mixed in for time-driven updates
pub fn frame_seed(frame_index: u32, time_seconds: f32, time_driven: bool) -> u32 {
    if time_driven {
        hash2(frame_index, time_seconds.to_bits())
    } else {
        pcg_hash(frame_index)
    }
}

/// Sequential generator over the PCG hash
#[derive(Clone, Copy, Debug)]
pub struct Rng {
    state: u32,
}

impl Rng {
    pub fn new(seed: u32, stream: u32) -> Self {
        Self { state: hash2(seed, stream) }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state = pcg_hash(self.state);
        self.state
    }

    pub fn next_f32(&mut self) -> f32 {
        to_unit_float(self.next_u32())
    }
}

/// Orthonormal tangent frame around a unit normal (Duff et al. 2017)
pub fn tangent_frame(n: Vec3) -> (Vec3, Vec3) {
    let sign = if n.z >= 0.0 { 1.0 } else { -1.0 };
    let a = -1.0 / (sign + n.z);
    let b = n.x * n.y * a;
    let t = Vec3::new(1.0 + sign * n.x * n.x * a, sign * b, -sign * n.x);
    let bt = Vec3::new(b, sign + n.y * n.y * a, -n.y);
    (t, bt)
}

/// Cosine-weighted direction in the hemisphere around `n`
pub fn cosine_hemisphere(n: Vec3, u1: f32, u2: f32) -> Vec3 {
    let r = u1.sqrt();
    let phi = TAU * u2;
    let (t, b) = tangent_frame(n);
    let local_z = (1.0 - u1).max(0.0).sqrt();
    (t * (r * phi.cos()) + b * (r * phi.sin()) + n * local_z).normalize()
}

/// Stable pseudo-random colour for surfel visualisation
pub fn hash_color(index: u32) -> Vec3 {
    let h = pcg_hash(index);
    Vec3::new(
        (h & 0xff) as f32 / 255.0,
        ((h >> 8) & 0xff) as f32 / 255.0,
        ((h >> 16) & 0xff) as f32 / 255.0,
    )
}
