//! Render passes and framebuffers.

use crate::command::CommandBuffer;
use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;

/// Color attachment cleared on load.
///
/// The final layout is `PRESENT_SRC_KHR` for an on-screen attachment and
/// `SHADER_READ_ONLY_OPTIMAL` otherwise.
pub fn color_attachment(
    format: vk::Format,
    store: bool,
    present: bool,
) -> vk::AttachmentDescription {
    vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(store_op(store))
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(if present {
            vk::ImageLayout::PRESENT_SRC_KHR
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        })
}

/// Depth attachment cleared on load, left read-only at the end of the pass.
pub fn depth_attachment(format: vk::Format, store: bool) -> vk::AttachmentDescription {
    vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(store_op(store))
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL)
}

fn store_op(store: bool) -> vk::AttachmentStoreOp {
    if store {
        vk::AttachmentStoreOp::STORE
    } else {
        vk::AttachmentStoreOp::DONT_CARE
    }
}

/// Attachment references used by one subpass.
#[derive(Debug, Clone, Default)]
pub struct Subpass {
    pub bind_point: vk::PipelineBindPoint,
    pub inputs: Vec<vk::AttachmentReference>,
    pub colors: Vec<vk::AttachmentReference>,
    pub resolves: Vec<vk::AttachmentReference>,
    pub depth_stencil: Option<vk::AttachmentReference>,
    pub preserve: Vec<u32>,
}

impl Subpass {
    /// Graphics subpass writing the given color attachments.
    pub fn graphics(colors: &[u32]) -> Self {
        Self {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            colors: colors
                .iter()
                .map(|&attachment| vk::AttachmentReference {
                    attachment,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                })
                .collect(),
            ..Self::default()
        }
    }

    pub fn depth(mut self, attachment: u32) -> Self {
        self.depth_stencil = Some(vk::AttachmentReference {
            attachment,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        });
        self
    }

    /// Read earlier attachments as input attachments.
    pub fn inputs(mut self, attachments: &[u32]) -> Self {
        self.inputs = attachments
            .iter()
            .map(|&attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
            .collect();
        self
    }

    fn to_vk(&self) -> vk::SubpassDescription<'_> {
        let mut description = vk::SubpassDescription::default()
            .pipeline_bind_point(self.bind_point)
            .input_attachments(&self.inputs)
            .color_attachments(&self.colors)
            .preserve_attachments(&self.preserve);
        if !self.resolves.is_empty() {
            description = description.resolve_attachments(&self.resolves);
        }
        if let Some(depth) = &self.depth_stencil {
            description = description.depth_stencil_attachment(depth);
        }
        description
    }
}

/// Dependency between two subpasses.
pub fn dependency(
    src_subpass: u32,
    dst_subpass: u32,
    stages: (vk::PipelineStageFlags, vk::PipelineStageFlags),
    access: (vk::AccessFlags, vk::AccessFlags),
    flags: vk::DependencyFlags,
) -> vk::SubpassDependency {
    vk::SubpassDependency {
        src_subpass,
        dst_subpass,
        src_stage_mask: stages.0,
        dst_stage_mask: stages.1,
        src_access_mask: access.0,
        dst_access_mask: access.1,
        dependency_flags: flags,
    }
}

/// Owned render pass.
#[derive(Debug)]
pub struct RenderPass {
    device: Device,
    handle: vk::RenderPass,
    attachments: Vec<vk::AttachmentDescription>,
    color_counts: Vec<usize>,
}

impl RenderPass {
    pub fn new(
        device: &Device,
        attachments: &[vk::AttachmentDescription],
        subpasses: &[Subpass],
        dependencies: &[vk::SubpassDependency],
    ) -> Result<Self> {
        if subpasses.is_empty() {
            return Err(device.fail(GpuError::InvalidState(
                "A render pass needs at least one subpass".into(),
            )));
        }
        for subpass in subpasses {
            if !subpass.resolves.is_empty() && subpass.resolves.len() != subpass.colors.len() {
                return Err(device.fail(GpuError::InvalidState(
                    "Resolve attachments must match color attachments".into(),
                )));
            }
        }

        let descriptions: Vec<_> = subpasses.iter().map(Subpass::to_vk).collect();
        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(attachments)
            .subpasses(&descriptions)
            .dependencies(dependencies);

        let handle = device.check(
            unsafe { device.handle().create_render_pass(&create_info, None) },
            || "Could not create a render pass.",
        )?;

        Ok(Self {
            device: device.clone(),
            handle,
            attachments: attachments.to_vec(),
            color_counts: subpasses.iter().map(|s| s.colors.len()).collect(),
        })
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn attachments(&self) -> &[vk::AttachmentDescription] {
        &self.attachments
    }

    pub fn subpass_count(&self) -> u32 {
        self.color_counts.len() as u32
    }

    /// Color attachment count of each subpass.
    pub fn color_attachment_counts(&self) -> &[usize] {
        &self.color_counts
    }

    /// Begin the pass on `framebuffer` covering its whole extent.
    pub fn begin(
        &self,
        cmd: &CommandBuffer,
        framebuffer: &Framebuffer,
        clear_values: &[vk::ClearValue],
    ) {
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.handle)
            .framebuffer(framebuffer.handle())
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: framebuffer.extent(),
            })
            .clear_values(clear_values);
        unsafe {
            self.device
                .handle()
                .cmd_begin_render_pass(cmd.handle(), &begin_info, vk::SubpassContents::INLINE);
        }
    }

    pub fn next_subpass(&self, cmd: &CommandBuffer) {
        unsafe {
            self.device
                .handle()
                .cmd_next_subpass(cmd.handle(), vk::SubpassContents::INLINE);
        }
    }

    pub fn end(&self, cmd: &CommandBuffer) {
        unsafe { self.device.handle().cmd_end_render_pass(cmd.handle()) };
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.device.handle().destroy_render_pass(self.handle, None) };
    }
}

/// Owned framebuffer.
#[derive(Debug)]
pub struct Framebuffer {
    device: Device,
    handle: vk::Framebuffer,
    extent: vk::Extent2D,
}

impl Framebuffer {
    pub fn new(
        device: &Device,
        render_pass: &RenderPass,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
        layers: u32,
    ) -> Result<Self> {
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass.handle())
            .attachments(views)
            .width(extent.width)
            .height(extent.height)
            .layers(layers);

        let handle = device.check(
            unsafe { device.handle().create_framebuffer(&create_info, None) },
            || "Could not create a framebuffer.",
        )?;

        Ok(Self {
            device: device.clone(),
            handle,
            extent,
        })
    }

    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe { self.device.handle().destroy_framebuffer(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_attachment_final_layout() {
        let shown = color_attachment(vk::Format::R8G8B8A8_UNORM, true, true);
        assert_eq!(shown.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(shown.store_op, vk::AttachmentStoreOp::STORE);

        let offscreen = color_attachment(vk::Format::R8G8B8A8_UNORM, false, false);
        assert_eq!(offscreen.final_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(offscreen.store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(offscreen.load_op, vk::AttachmentLoadOp::CLEAR);
    }

    #[test]
    fn subpass_references() {
        let subpass = Subpass::graphics(&[0, 1]).depth(2).inputs(&[3]);
        assert_eq!(subpass.colors.len(), 2);
        assert_eq!(subpass.colors[1].attachment, 1);
        assert_eq!(subpass.colors[1].layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(
            subpass.depth_stencil.map(|d| d.layout),
            Some(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        );
        assert_eq!(subpass.inputs[0].layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        let description = subpass.to_vk();
        assert_eq!(description.color_attachment_count, 2);
        assert_eq!(description.input_attachment_count, 1);
        assert!(!description.p_depth_stencil_attachment.is_null());
        assert!(description.p_resolve_attachments.is_null());
    }

    #[test]
    fn depth_attachment_is_read_only_after_pass() {
        let depth = depth_attachment(vk::Format::D32_SFLOAT, false);
        assert_eq!(depth.final_layout, vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL);
    }
}
