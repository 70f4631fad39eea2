//! GPU context, G-buffer textures and readback helpers

pub mod context;
pub mod layout;
pub mod profiler;
pub mod readback;
pub mod texture;

pub use context::GpuContext;
pub use profiler::{GiStage, GiTimings, GpuProfiler, StageSpan};
pub use texture::{GBuffer, GBufferImage};
