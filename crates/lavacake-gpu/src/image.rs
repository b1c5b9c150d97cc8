//! Images, image views and samplers.

use crate::buffer::Buffer;
use crate::command::CommandBuffer;
use crate::device::Device;
use crate::error::Result;
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;

/// Creation parameters for an [`Image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub usage: vk::ImageUsageFlags,
    /// Six-layer cube compatible image with a cube view.
    pub cube: bool,
}

impl ImageInfo {
    /// A single 2D color image.
    pub fn color_2d(
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            width,
            height,
            depth: 1,
            format,
            aspect: vk::ImageAspectFlags::COLOR,
            usage,
            cube: false,
        }
    }

    /// A 2D depth attachment.
    pub fn depth_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            depth: 1,
            format,
            aspect: vk::ImageAspectFlags::DEPTH,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            cube: false,
        }
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn cube(mut self, cube: bool) -> Self {
        self.cube = cube;
        self
    }

    pub fn extent(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.width,
            height: self.height,
            depth: self.depth,
        }
    }

    /// Image and view type implied by the dimensions.
    ///
    /// Height above one makes it 2D, depth above one makes it 3D, and a
    /// cube image is always 2D with a cube view.
    pub fn types(&self) -> (vk::ImageType, vk::ImageViewType) {
        if self.cube {
            (vk::ImageType::TYPE_2D, vk::ImageViewType::CUBE)
        } else if self.depth > 1 {
            (vk::ImageType::TYPE_3D, vk::ImageViewType::TYPE_3D)
        } else if self.height > 1 {
            (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D)
        } else {
            (vk::ImageType::TYPE_1D, vk::ImageViewType::TYPE_1D)
        }
    }

    pub fn layer_count(&self) -> u32 {
        if self.cube {
            6
        } else {
            1
        }
    }

    /// Range covering every mip level and layer of the image.
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: self.layer_count(),
        }
    }
}

/// Access masks for a layout transition from `old` to `new`.
///
/// Layouts without a known meaning contribute no access. A transition to
/// shader-read from a layout with no prior access waits on host and
/// transfer writes.
pub fn transition_access_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> (vk::AccessFlags, vk::AccessFlags) {
    let mut src = match old {
        vk::ImageLayout::UNDEFINED => vk::AccessFlags::empty(),
        vk::ImageLayout::PREINITIALIZED => vk::AccessFlags::HOST_WRITE,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        _ => vk::AccessFlags::empty(),
    };

    let dst = match new {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            if src.is_empty() {
                src = vk::AccessFlags::HOST_WRITE | vk::AccessFlags::TRANSFER_WRITE;
            }
            vk::AccessFlags::SHADER_READ
        }
        _ => vk::AccessFlags::empty(),
    };

    (src, dst)
}

/// A device-local image with a view, tracking its layout and last stage.
pub struct Image {
    device: Device,
    handle: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    info: ImageInfo,
    layout: vk::ImageLayout,
    stage: vk::PipelineStageFlags,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("handle", &self.handle)
            .field("info", &self.info)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl Image {
    /// Create the image, bind memory and create its view.
    ///
    /// The image starts in `UNDEFINED` layout at the top of the pipe.
    pub fn new(device: &Device, info: &ImageInfo) -> Result<Self> {
        let (image_type, view_type) = info.types();
        let flags = if info.cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };

        let create_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(image_type)
            .format(info.format)
            .extent(info.extent())
            .mip_levels(1)
            .array_layers(info.layer_count())
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let handle = device.check(
            unsafe { device.handle().create_image(&create_info, None) },
            || "Can't create Image",
        )?;

        let requirements = unsafe { device.handle().get_image_memory_requirements(handle) };
        let allocated = device.allocate("image", requirements, MemoryLocation::GpuOnly, false);
        let allocation = match allocated {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_image(handle, None) };
                device.errors().error("Can't allocate Image memory");
                return Err(e);
            }
        };

        let mut image = Self {
            device: device.clone(),
            handle,
            view: vk::ImageView::null(),
            allocation: None,
            info: *info,
            layout: vk::ImageLayout::UNDEFINED,
            stage: vk::PipelineStageFlags::TOP_OF_PIPE,
        };

        let bind = unsafe {
            device
                .handle()
                .bind_image_memory(handle, allocation.memory(), allocation.offset())
        };
        image.allocation = Some(allocation);
        device.check(bind, || "Can't bind Image memory")?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(handle)
            .view_type(view_type)
            .format(info.format)
            .subresource_range(info.full_range());
        image.view = device.check(
            unsafe { device.handle().create_image_view(&view_info, None) },
            || "Can't create Image View",
        )?;

        Ok(image)
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn format(&self) -> vk::Format {
        self.info.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.info.extent()
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub fn stage(&self) -> vk::PipelineStageFlags {
        self.stage
    }

    /// Record a layout transition for `range` of the image.
    ///
    /// The barrier waits on the stage the image was last used in and
    /// becomes the new tracked stage.
    pub fn set_layout(
        &mut self,
        cmd: &CommandBuffer,
        new_layout: vk::ImageLayout,
        range: vk::ImageSubresourceRange,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let (src_access, dst_access) = transition_access_masks(self.layout, new_layout);

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(self.layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.handle)
            .subresource_range(range)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);

        unsafe {
            self.device.handle().cmd_pipeline_barrier(
                cmd.handle(),
                self.stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }

        self.layout = new_layout;
        self.stage = dst_stage;
    }

    /// Transition the whole image.
    pub fn transition(
        &mut self,
        cmd: &CommandBuffer,
        new_layout: vk::ImageLayout,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let range = self.info.full_range();
        self.set_layout(cmd, new_layout, range, dst_stage);
    }

    /// Record a copy into another image, both in their current layouts.
    pub fn copy_to_image(&self, cmd: &CommandBuffer, dst: &Image, regions: &[vk::ImageCopy]) {
        if regions.is_empty() {
            return;
        }
        unsafe {
            self.device.handle().cmd_copy_image(
                cmd.handle(),
                self.handle,
                self.layout,
                dst.handle,
                dst.layout,
                regions,
            );
        }
    }

    /// Record a copy into a buffer.
    pub fn copy_to_buffer(
        &self,
        cmd: &CommandBuffer,
        dst: &Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        if regions.is_empty() {
            return;
        }
        unsafe {
            self.device.handle().cmd_copy_image_to_buffer(
                cmd.handle(),
                self.handle,
                self.layout,
                dst.handle(),
                regions,
            );
        }
    }

    /// Copy region covering the whole first mip level.
    pub fn full_copy_region(&self) -> vk::BufferImageCopy {
        vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: self.info.aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: self.info.layer_count(),
            },
            image_offset: vk::Offset3D::default(),
            image_extent: self.info.extent(),
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.handle().destroy_image_view(self.view, None);
            }
            self.device.handle().destroy_image(self.handle, None);
        }
        if let Some(allocation) = self.allocation.take() {
            self.device.free(allocation);
        }
    }
}

/// Owned sampler.
#[derive(Debug)]
pub struct Sampler {
    device: Device,
    handle: vk::Sampler,
}

impl Sampler {
    pub fn new(device: &Device, create_info: &vk::SamplerCreateInfo<'_>) -> Result<Self> {
        let handle = device.check(
            unsafe { device.handle().create_sampler(create_info, None) },
            || "Could not create sampler.",
        )?;
        Ok(Self {
            device: device.clone(),
            handle,
        })
    }

    /// Linear filtering with repeating addressing on every axis.
    pub fn linear_repeat(device: &Device) -> Result<Self> {
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_anisotropy(1.0)
            .compare_op(vk::CompareOp::ALWAYS)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);
        Self::new(device, &create_info)
    }

    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.device.handle().destroy_sampler(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_access_follows_old_layout() {
        let cases = [
            (vk::ImageLayout::UNDEFINED, vk::AccessFlags::empty()),
            (vk::ImageLayout::PREINITIALIZED, vk::AccessFlags::HOST_WRITE),
            (
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
            (
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
            (vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::AccessFlags::TRANSFER_READ),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::AccessFlags::TRANSFER_WRITE),
            (vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::AccessFlags::SHADER_READ),
            (vk::ImageLayout::GENERAL, vk::AccessFlags::empty()),
        ];
        for (old, expected) in cases {
            let (src, _) = transition_access_masks(old, vk::ImageLayout::GENERAL);
            assert_eq!(src, expected, "{old:?}");
        }
    }

    #[test]
    fn destination_access_follows_new_layout() {
        let (src, dst) = transition_access_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert!(src.is_empty());
        assert_eq!(dst, vk::AccessFlags::TRANSFER_WRITE);

        let (_, dst) = transition_access_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        assert!(dst.is_empty());
    }

    #[test]
    fn shader_read_from_nothing_waits_on_writes() {
        let (src, dst) = transition_access_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(src, vk::AccessFlags::HOST_WRITE | vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst, vk::AccessFlags::SHADER_READ);

        let (src, _) = transition_access_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(src, vk::AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn dimensions_pick_image_type() {
        let format = vk::Format::R8G8B8A8_UNORM;
        let base = ImageInfo::color_2d(64, 1, format, vk::ImageUsageFlags::SAMPLED);
        assert_eq!(base.types(), (vk::ImageType::TYPE_1D, vk::ImageViewType::TYPE_1D));

        let flat = ImageInfo::color_2d(64, 64, format, vk::ImageUsageFlags::SAMPLED);
        assert_eq!(flat.types(), (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D));

        let volume = flat.depth(8);
        assert_eq!(volume.types(), (vk::ImageType::TYPE_3D, vk::ImageViewType::TYPE_3D));

        let cube = flat.cube(true);
        assert_eq!(cube.types(), (vk::ImageType::TYPE_2D, vk::ImageViewType::CUBE));
        assert_eq!(cube.full_range().layer_count, 6);
    }
}
