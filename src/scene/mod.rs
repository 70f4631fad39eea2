//! Ray-traceable test scenes (spheres and boxes) and their GPU upload

pub mod buffer;
pub mod config;
pub mod primitives;
pub mod raycast;

pub use buffer::SceneBuffer;
pub use config::SceneConfig;
pub use primitives::{Material, Scene, SceneBox, SceneHit, SceneTracer, Sphere};
pub use raycast::render_gbuffer;
