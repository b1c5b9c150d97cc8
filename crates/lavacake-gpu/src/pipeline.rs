//! Pipeline creation and management.

use crate::command::CommandBuffer;
use crate::constants::PushConstants;
use crate::descriptors::DescriptorSet;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::render_pass::RenderPass;
use crate::shader::ShaderModule;
use ash::vk;

/// Owned pipeline layout.
#[derive(Debug)]
pub struct PipelineLayout {
    device: Device,
    handle: vk::PipelineLayout,
    push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl PipelineLayout {
    pub fn new(
        device: &Device,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);

        let handle = device.check(
            unsafe { device.handle().create_pipeline_layout(&layout_info, None) },
            || "Could not create pipeline layout.",
        )?;

        Ok(Self {
            device: device.clone(),
            handle,
            push_constant_ranges: push_constant_ranges.to_vec(),
        })
    }

    pub fn handle(&self) -> vk::PipelineLayout {
        self.handle
    }

    pub fn push_constant_ranges(&self) -> &[vk::PushConstantRange] {
        &self.push_constant_ranges
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe { self.device.handle().destroy_pipeline_layout(self.handle, None) };
    }
}

/// Push constant range starting at offset zero.
pub fn push_constant_range(stages: vk::ShaderStageFlags, size: u32) -> vk::PushConstantRange {
    vk::PushConstantRange {
        stage_flags: stages,
        offset: 0,
        size,
    }
}

/// Bytes of `data` read by `range`.
pub fn range_bytes<'a>(range: &vk::PushConstantRange, data: &'a [u8]) -> Result<&'a [u8]> {
    let start = range.offset as usize;
    let end = start + range.size as usize;
    data.get(start..end).ok_or_else(|| {
        GpuError::InvalidState(format!(
            "Push constant range {start}..{end} exceeds the {} bytes provided",
            data.len()
        ))
    })
}

/// A compiled pipeline together with its layout and bind point.
///
/// Shared by the compute, graphics and ray tracing pipelines for the
/// binding commands.
#[derive(Debug)]
pub struct Pipeline {
    device: Device,
    handle: vk::Pipeline,
    layout: PipelineLayout,
    bind_point: vk::PipelineBindPoint,
}

impl Pipeline {
    /// Take ownership of a pipeline created elsewhere.
    pub fn from_raw(
        device: &Device,
        handle: vk::Pipeline,
        layout: PipelineLayout,
        bind_point: vk::PipelineBindPoint,
    ) -> Self {
        Self {
            device: device.clone(),
            handle,
            layout,
            bind_point,
        }
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> &PipelineLayout {
        &self.layout
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn bind(&self, cmd: &CommandBuffer) {
        unsafe {
            self.device
                .handle()
                .cmd_bind_pipeline(cmd.handle(), self.bind_point, self.handle);
        }
    }

    /// Bind `set` at index 0. Empty sets are skipped.
    pub fn bind_descriptor_set(&self, cmd: &CommandBuffer, set: &DescriptorSet) {
        if set.is_empty() {
            return;
        }
        unsafe {
            self.device.handle().cmd_bind_descriptor_sets(
                cmd.handle(),
                self.bind_point,
                self.layout.handle(),
                0,
                &[set.handle()],
                &[],
            );
        }
    }

    /// Upload `constants` for every declared range.
    pub fn push_constants(&self, cmd: &CommandBuffer, constants: &PushConstants) -> Result<()> {
        self.push_bytes(cmd, constants.as_bytes())
    }

    /// Upload raw bytes for every declared range.
    ///
    /// Each range reads its bytes from `data` at the range's offset. Nothing
    /// is recorded if any range extends past `data`.
    pub fn push_bytes(&self, cmd: &CommandBuffer, data: &[u8]) -> Result<()> {
        let ranges = self.layout.push_constant_ranges();
        let slices = ranges
            .iter()
            .map(|range| range_bytes(range, data))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| self.device.fail(e))?;

        for (range, bytes) in ranges.iter().zip(slices) {
            unsafe {
                self.device.handle().cmd_push_constants(
                    cmd.handle(),
                    self.layout.handle(),
                    range.stage_flags,
                    range.offset,
                    bytes,
                );
            }
        }
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe { self.device.handle().destroy_pipeline(self.handle, None) };
    }
}

/// Compute pipeline wrapper.
#[derive(Debug)]
pub struct ComputePipeline {
    pipeline: Pipeline,
}

impl ComputePipeline {
    /// Create a compute pipeline from a compute shader module.
    pub fn new(
        device: &Device,
        shader: &ShaderModule,
        descriptor_set: Option<&DescriptorSet>,
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        if shader.stage() != vk::ShaderStageFlags::COMPUTE {
            return Err(device.fail(GpuError::PipelineCreation(
                "Compute pipelines need a compute shader".into(),
            )));
        }

        let set_layouts: Vec<_> = descriptor_set
            .map(DescriptorSet::layout)
            .into_iter()
            .collect();
        let layout = PipelineLayout::new(device, &set_layouts, push_constant_ranges)?;

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(shader.stage_info())
            .layout(layout.handle());

        let pipelines = unsafe {
            device
                .handle()
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_pipelines, e)| e);
        let handle = first_pipeline(device, pipelines, "Could not create compute pipeline.")?;

        Ok(Self {
            pipeline: Pipeline::from_raw(device, handle, layout, vk::PipelineBindPoint::COMPUTE),
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline.handle()
    }

    pub fn bind(&self, cmd: &CommandBuffer) {
        self.pipeline.bind(cmd);
    }

    pub fn bind_descriptor_set(&self, cmd: &CommandBuffer, set: &DescriptorSet) {
        self.pipeline.bind_descriptor_set(cmd, set);
    }

    pub fn push_constants(&self, cmd: &CommandBuffer, constants: &PushConstants) -> Result<()> {
        self.pipeline.push_constants(cmd, constants)
    }

    /// Bind everything and record a dispatch of `groups` workgroups.
    pub fn dispatch(
        &self,
        cmd: &CommandBuffer,
        set: Option<&DescriptorSet>,
        constants: Option<&PushConstants>,
        groups: [u32; 3],
    ) -> Result<()> {
        self.bind(cmd);
        if let Some(set) = set {
            self.bind_descriptor_set(cmd, set);
        }
        if let Some(constants) = constants.filter(|c| !c.is_empty()) {
            self.push_constants(cmd, constants)?;
        }
        unsafe {
            self.pipeline
                .device()
                .handle()
                .cmd_dispatch(cmd.handle(), groups[0], groups[1], groups[2]);
        }
        Ok(())
    }
}

/// Graphics pipeline configuration.
#[derive(Clone, Debug)]
pub struct GraphicsPipelineConfig {
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub subpass: u32,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            subpass: 0,
        }
    }
}

impl GraphicsPipelineConfig {
    /// Tightly packed per-vertex attributes in one binding.
    ///
    /// Each format is given with its size in bytes; locations follow the
    /// order of `formats`.
    pub fn vertex_layout(mut self, formats: &[(vk::Format, u32)]) -> Self {
        let mut offset = 0;
        self.vertex_attributes = formats
            .iter()
            .enumerate()
            .map(|(location, &(format, size))| {
                let attribute = vk::VertexInputAttributeDescription {
                    location: location as u32,
                    binding: 0,
                    format,
                    offset,
                };
                offset += size;
                attribute
            })
            .collect();
        self.vertex_bindings = vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: offset,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        self
    }
}

/// Graphics pipeline wrapper.
#[derive(Debug)]
pub struct GraphicsPipeline {
    pipeline: Pipeline,
    config: GraphicsPipelineConfig,
}

impl GraphicsPipeline {
    /// Create a graphics pipeline for `config.subpass` of `render_pass`.
    ///
    /// Viewport and scissor are dynamic state.
    pub fn new(
        device: &Device,
        render_pass: &RenderPass,
        shaders: &[&ShaderModule],
        config: GraphicsPipelineConfig,
        descriptor_set: Option<&DescriptorSet>,
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        if config.subpass >= render_pass.subpass_count() {
            return Err(device.fail(GpuError::PipelineCreation(format!(
                "Subpass {} does not exist in the render pass",
                config.subpass
            ))));
        }

        let stages: Vec<_> = shaders.iter().map(|s| s.stage_info()).collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&config.vertex_bindings)
            .vertex_attribute_descriptions(&config.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(config.topology)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(config.polygon_mode)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .depth_bias_enable(false)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(config.depth_test)
            .depth_write_enable(config.depth_write)
            .depth_compare_op(config.depth_compare)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_count = color_attachment_count(render_pass, config.subpass);
        let color_blend_attachments = vec![
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(false)
                .color_write_mask(vk::ColorComponentFlags::RGBA);
            color_count
        ];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let set_layouts: Vec<_> = descriptor_set
            .map(DescriptorSet::layout)
            .into_iter()
            .collect();
        let layout = PipelineLayout::new(device, &set_layouts, push_constant_ranges)?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout.handle())
            .render_pass(render_pass.handle())
            .subpass(config.subpass);

        let pipelines = unsafe {
            device
                .handle()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_pipelines, e)| e);
        let handle = first_pipeline(device, pipelines, "Could not create graphics pipeline.")?;

        Ok(Self {
            pipeline: Pipeline::from_raw(device, handle, layout, vk::PipelineBindPoint::GRAPHICS),
            config,
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline.handle()
    }

    pub fn config(&self) -> &GraphicsPipelineConfig {
        &self.config
    }

    pub fn bind(&self, cmd: &CommandBuffer) {
        self.pipeline.bind(cmd);
    }

    pub fn bind_descriptor_set(&self, cmd: &CommandBuffer, set: &DescriptorSet) {
        self.pipeline.bind_descriptor_set(cmd, set);
    }

    pub fn push_constants(&self, cmd: &CommandBuffer, constants: &PushConstants) -> Result<()> {
        self.pipeline.push_constants(cmd, constants)
    }

    /// Set the dynamic viewport and scissor to cover `extent`.
    pub fn set_viewport(&self, cmd: &CommandBuffer, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        let device = self.pipeline.device().handle();
        unsafe {
            device.cmd_set_viewport(cmd.handle(), 0, &[viewport]);
            device.cmd_set_scissor(cmd.handle(), 0, &[scissor]);
        }
    }
}

/// Number of color attachments written by `subpass`.
fn color_attachment_count(render_pass: &RenderPass, subpass: u32) -> usize {
    render_pass
        .color_attachment_counts()
        .get(subpass as usize)
        .copied()
        .unwrap_or(0)
}

fn first_pipeline(
    device: &Device,
    result: ash::prelude::VkResult<Vec<vk::Pipeline>>,
    message: &'static str,
) -> Result<vk::Pipeline> {
    let pipelines = device.check(result, || message)?;
    pipelines
        .first()
        .copied()
        .ok_or_else(|| device.fail(GpuError::PipelineCreation(message.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_packs_attributes() {
        let config = GraphicsPipelineConfig::default().vertex_layout(&[
            (vk::Format::R32G32B32_SFLOAT, 12),
            (vk::Format::R32G32B32_SFLOAT, 12),
            (vk::Format::R32G32_SFLOAT, 8),
        ]);

        let offsets: Vec<_> = config.vertex_attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24]);
        let locations: Vec<_> = config.vertex_attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![0, 1, 2]);
        assert_eq!(config.vertex_bindings.len(), 1);
        assert_eq!(config.vertex_bindings[0].stride, 32);
    }

    #[test]
    fn push_constant_range_starts_at_zero() {
        let range = push_constant_range(vk::ShaderStageFlags::COMPUTE, 16);
        assert_eq!(range.offset, 0);
        assert_eq!(range.size, 16);
        assert_eq!(range.stage_flags, vk::ShaderStageFlags::COMPUTE);
    }

    #[test]
    fn range_bytes_follow_offsets() {
        let data: Vec<u8> = (0..16).collect();
        let range = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            offset: 8,
            size: 4,
        };
        assert_eq!(range_bytes(&range, &data).unwrap(), &[8, 9, 10, 11]);
    }

    #[test]
    fn overrunning_range_is_an_error() {
        let data = [0u8; 8];
        let range = push_constant_range(vk::ShaderStageFlags::COMPUTE, 16);
        let err = range_bytes(&range, &data).unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
        assert!(err.to_string().contains("0..16"));
    }

    #[test]
    fn default_config_uses_triangles_and_depth() {
        let config = GraphicsPipelineConfig::default();
        assert_eq!(config.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert!(config.depth_test);
        assert_eq!(config.subpass, 0);
    }
}
