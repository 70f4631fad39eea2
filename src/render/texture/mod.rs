//! Texture management

pub mod gbuffer;

pub use gbuffer::{GBuffer, GBufferImage};
