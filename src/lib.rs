//! surfel-gi - Surfel-based dynamic global illumination on wgpu compute

pub mod core;
pub mod math;
pub mod render;
pub mod scene;
pub mod gi;
