//! Vulkan framework layer for LavaCake.
//!
//! This crate provides:
//! - Device and queue negotiation across physical devices
//! - A shared device context with a last-error side channel
//! - Buffers and images backed by gpu-allocator
//! - Command buffers, fences and semaphores
//! - Shader modules, descriptor sets, push constants, render passes and
//!   pipelines
//! - Surfaces and swapchains

pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod constants;
pub mod descriptors;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod image;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod render_pass;
pub mod selection;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use buffer::{Buffer, BufferInfo};
pub use capabilities::{AdapterCapabilities, GpuVendor};
pub use command::{one_time_submit, CommandBuffer};
pub use constants::PushConstants;
pub use descriptors::{
    DescriptorLayoutPlan, DescriptorResource, DescriptorSet, DescriptorSetBuilder,
};
pub use device::{Device, DeviceBuilder};
pub use diagnostics::{ErrorRecord, ErrorState, Severity};
pub use error::{GpuError, Result};
pub use image::{Image, ImageInfo, Sampler};
pub use memory::MemoryKind;
pub use pipeline::{
    ComputePipeline, GraphicsPipeline, GraphicsPipelineConfig, Pipeline, PipelineLayout,
};
pub use queue::{Queue, QueueKind};
pub use render_pass::{Framebuffer, RenderPass, Subpass};
pub use selection::{
    Capability, CandidateOutcome, CandidateReport, DevicePlan, Requirement, SelectionRequest,
};
pub use shader::ShaderModule;
pub use surface::{Surface, SurfaceSource, WindowSurface};
pub use swapchain::{AcquiredImage, Swapchain};
pub use sync::{Fence, Semaphore};

pub use ash;
pub use ash::vk;
