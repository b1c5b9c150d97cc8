//! Hardware ray tracing for LavaCake.
//!
//! Builds on `VK_KHR_ray_tracing_pipeline` and `VK_KHR_acceleration_structure`:
//! - [`BlasBuilder`] and [`TlasBuilder`] build acceleration structures
//! - [`RayTracingPipeline`] collects ray generation, miss and hit groups
//! - [`ShaderBindingTable`] packs the group handles into device buffers
//!
//! The device must have been built with ray tracing enabled, see
//! `lavacake_gpu::DeviceBuilder::ray_tracing`.

pub mod acceleration;
pub mod pipeline;
pub mod sbt;

pub use acceleration::{
    AabbPositions, AccelerationStructure, BlasBuilder, InstanceRecord, TlasBuilder,
    TriangleGeometry, IDENTITY_TRANSFORM,
};
pub use pipeline::{RayTracingPipeline, ShaderGroup, ShaderGroups};
pub use sbt::{align_up, SbtGroup, SbtLayout, ShaderBindingTable};
