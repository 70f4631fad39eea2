//! Surfel-based global illumination.
//!
//! Surfels are spawned from the G-buffer where screen coverage is low, binned
//! into a uniform world grid, lit by ray tracing the analytic scene and
//! gathered back onto screen pixels. `GlobalIllumination` drives the compute
//! passes on the GPU; `HostGi` runs the same frame on the CPU.

pub mod common;
pub mod config;
pub mod coverage;
pub mod data;
pub mod estimator;
pub mod grid;
pub mod host;
pub mod irradiance;
pub mod pool;
pub mod random;
pub mod resolve;
pub mod scan;
pub mod spawn;
pub mod system;

pub use config::{BlurConfig, GatherWeights, GiConfig, GridConfig, VisualizeMode};
pub use data::{GiCounters, Surfel, SurfelIrradiance, WorldStructureChunk};
pub use grid::{HostWorldStructure, WorldGrid, WorldStructure};
pub use host::{HostFrame, HostGi};
pub use pool::{HostSurfelPool, SurfelPool};
pub use scan::ExclusiveScan;
pub use system::{FrameInput, GiStats, GlobalIllumination};
