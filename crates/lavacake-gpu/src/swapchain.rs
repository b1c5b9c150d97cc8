//! Swapchain management.
//!
//! Parameter selection lives in plain functions over the surface query so
//! it can be tested without a window.

use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::queue::Queue;
use crate::sync::{Fence, Semaphore};
use ash::vk;

/// Extent used when the surface leaves the size up to the swapchain.
pub const DEFAULT_EXTENT: vk::Extent2D = vk::Extent2D {
    width: 640,
    height: 480,
};

/// Format requested for swapchain images.
pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::R8G8B8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// How a surface format was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatMatch {
    /// The surface accepts any format.
    Unrestricted,
    Exact,
    /// Desired format with a different color space.
    OtherColorSpace,
    /// Desired format unsupported; first advertised pair taken.
    FirstAvailable,
}

/// Pick the surface format closest to `desired`.
///
/// Returns `None` when the surface advertises no format at all.
pub fn select_format(
    available: &[vk::SurfaceFormatKHR],
    desired: vk::SurfaceFormatKHR,
) -> Option<(vk::SurfaceFormatKHR, FormatMatch)> {
    let first = available.first()?;

    if available.len() == 1 && first.format == vk::Format::UNDEFINED {
        return Some((desired, FormatMatch::Unrestricted));
    }

    if available
        .iter()
        .any(|f| f.format == desired.format && f.color_space == desired.color_space)
    {
        return Some((desired, FormatMatch::Exact));
    }

    if let Some(other) = available.iter().find(|f| f.format == desired.format) {
        return Some((
            vk::SurfaceFormatKHR {
                format: desired.format,
                color_space: other.color_space,
            },
            FormatMatch::OtherColorSpace,
        ));
    }

    Some((*first, FormatMatch::FirstAvailable))
}

/// `desired` when available, otherwise FIFO. `None` if neither is listed.
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    desired: vk::PresentModeKHR,
) -> Option<vk::PresentModeKHR> {
    if available.contains(&desired) {
        Some(desired)
    } else if available.contains(&vk::PresentModeKHR::FIFO) {
        Some(vk::PresentModeKHR::FIFO)
    } else {
        None
    }
}

/// One image more than the minimum, capped by the maximum when there is one.
pub fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        count
    }
}

/// The surface's current extent, or [`DEFAULT_EXTENT`] fitted into the
/// supported range when the surface lets the swapchain decide.
pub fn select_extent(capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    let fit = |value: u32, min: u32, max: u32| {
        if value < min {
            min
        } else if value > max {
            max
        } else {
            value
        }
    };

    vk::Extent2D {
        width: fit(
            DEFAULT_EXTENT.width,
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: fit(
            DEFAULT_EXTENT.height,
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// Supported subset of `desired`, and whether every requested usage survived.
pub fn select_usage(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired: vk::ImageUsageFlags,
) -> (vk::ImageUsageFlags, bool) {
    let usage = desired & capabilities.supported_usage_flags;
    (usage, usage == desired)
}

/// `desired` if supported, the current transform otherwise.
pub fn select_transform(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired: vk::SurfaceTransformFlagsKHR,
) -> vk::SurfaceTransformFlagsKHR {
    if capabilities.supported_transforms.contains(desired) {
        desired
    } else {
        capabilities.current_transform
    }
}

/// Image handed out by [`Swapchain::acquire_next_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub suboptimal: bool,
}

/// Swapchain on the device's surface, with one view per image.
#[derive(Debug)]
pub struct Swapchain {
    device: Device,
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    requested_usage: vk::ImageUsageFlags,
    usage: vk::ImageUsageFlags,
}

impl Swapchain {
    /// Create a swapchain whose images support `usage`.
    pub fn new(device: &Device, usage: vk::ImageUsageFlags) -> Result<Self> {
        let mut swapchain = Self {
            device: device.clone(),
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            format: PREFERRED_FORMAT,
            extent: DEFAULT_EXTENT,
            present_mode: vk::PresentModeKHR::FIFO,
            requested_usage: usage,
            usage,
        };
        swapchain.recreate()?;
        Ok(swapchain)
    }

    /// Rebuild the swapchain for the surface's current state, for example
    /// after a resize. The previous swapchain is handed over and destroyed.
    pub fn recreate(&mut self) -> Result<()> {
        let device = self.device.clone();
        let (Some(surface), Some(loader)) = (device.surface(), device.swapchain_loader()) else {
            return Err(device.fail(GpuError::SwapchainCreation(
                "The device was created without a surface".into(),
            )));
        };

        device.wait_idle()?;

        let query = surface
            .capabilities(device.physical_device())
            .map_err(|e| {
                device.fail(GpuError::SwapchainCreation(format!(
                    "Could not get surface capabilities: {e}"
                )))
            })?;
        let errors = device.errors();

        let present_mode = select_present_mode(&query.present_modes, vk::PresentModeKHR::MAILBOX)
            .ok_or_else(|| {
                device.fail(GpuError::SwapchainCreation("Could not select presenter mode".into()))
            })?;
        if present_mode != vk::PresentModeKHR::MAILBOX {
            errors.warning(
                1,
                "Desired present mode is not supported. Selecting default FIFO mode.",
            );
            tracing::warn!("MAILBOX present mode unavailable, using {:?}", present_mode);
        }

        let caps = &query.capabilities;
        let image_count = select_image_count(caps);

        let extent = select_extent(caps);
        if extent.width == 0 || extent.height == 0 {
            return Err(device.fail(GpuError::SwapchainCreation(
                "Wrong swapchain image size".into(),
            )));
        }

        let (usage, complete) = select_usage(caps, self.requested_usage);
        if !complete {
            errors.warning(1, "Could not select swapchain image usage");
            tracing::warn!(
                "Swapchain usage reduced from {:?} to {:?}",
                self.requested_usage,
                usage
            );
        }

        let transform = select_transform(caps, vk::SurfaceTransformFlagsKHR::IDENTITY);

        let (format, matched) = select_format(&query.formats, PREFERRED_FORMAT).ok_or_else(|| {
            device.fail(GpuError::SwapchainCreation(
                "Could not enumerate supported surface formats.".into(),
            ))
        })?;
        match matched {
            FormatMatch::OtherColorSpace => errors.warning(
                2,
                "Desired combination of format and colorspace is not supported. \
                 Selecting other colorspace.",
            ),
            FormatMatch::FirstAvailable => errors.warning(
                2,
                "Desired format is not supported. \
                 Selecting available format - colorspace combination.",
            ),
            FormatMatch::Unrestricted | FormatMatch::Exact => {}
        }

        let old = self.handle;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let handle = device.check(
            unsafe { loader.create_swapchain(&create_info, None) },
            || "Could not create the swapchain",
        )?;

        self.destroy_views();
        if old != vk::SwapchainKHR::null() {
            unsafe { loader.destroy_swapchain(old, None) };
        }
        self.handle = handle;
        self.format = format;
        self.extent = extent;
        self.present_mode = present_mode;
        self.usage = usage;

        self.images = device.check(unsafe { loader.get_swapchain_images(handle) }, || {
            "Could not get swapchain images"
        })?;

        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = device.check(
                unsafe { device.handle().create_image_view(&view_info, None) },
                || "Could not create swapchain image view",
            )?;
            self.views.push(view);
        }

        tracing::debug!(
            "Swapchain created: {} images, {}x{}, {:?}, {:?}",
            self.images.len(),
            extent.width,
            extent.height,
            format.format,
            present_mode
        );
        Ok(())
    }

    /// Acquire the next presentable image.
    ///
    /// `ERROR_OUT_OF_DATE_KHR` is returned as an error without being
    /// recorded; the caller is expected to [`recreate`](Self::recreate).
    pub fn acquire_next_image(
        &self,
        semaphore: Option<&Semaphore>,
        fence: Option<&Fence>,
        timeout_ns: u64,
    ) -> Result<AcquiredImage> {
        let loader = self.loader()?;
        let result = unsafe {
            loader.acquire_next_image(
                self.handle,
                timeout_ns,
                semaphore.map_or(vk::Semaphore::null(), Semaphore::handle),
                fence.map_or(vk::Fence::null(), Fence::handle),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok(AcquiredImage { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR))
            }
            Err(e) => self
                .device
                .check(Err(e), || "Could not acquire swapchain image"),
        }
    }

    /// Present `image_index` on `queue` after `waits` are signaled.
    ///
    /// Returns `true` when the swapchain no longer matches the surface and
    /// should be recreated.
    pub fn present(&self, queue: &Queue, image_index: u32, waits: &[&Semaphore]) -> Result<bool> {
        let loader = self.loader()?;
        let waits: Vec<_> = waits.iter().map(|s| s.handle()).collect();
        let swapchains = [self.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { loader.queue_present(queue.handle(), &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => self.device.check(Err(e), || "Could not present image"),
        }
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.format.color_space
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    fn loader(&self) -> Result<&ash::khr::swapchain::Device> {
        self.device.swapchain_loader().ok_or_else(|| {
            GpuError::InvalidState("The device was created without a surface".into())
        })
    }

    fn destroy_views(&mut self) {
        for view in self.views.drain(..) {
            unsafe { self.device.handle().destroy_image_view(view, None) };
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_views();
        if self.handle != vk::SwapchainKHR::null() {
            if let Some(loader) = self.device.swapchain_loader() {
                unsafe { loader.destroy_swapchain(self.handle, None) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    fn caps() -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY
                | vk::SurfaceTransformFlagsKHR::ROTATE_90,
            current_transform: vk::SurfaceTransformFlagsKHR::ROTATE_90,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
            ..Default::default()
        }
    }

    #[test]
    fn format_prefers_exact_match() {
        let available = [
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            PREFERRED_FORMAT,
        ];
        let (chosen, matched) = select_format(&available, PREFERRED_FORMAT).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(matched, FormatMatch::Exact);
    }

    #[test]
    fn format_falls_back_through_tiers() {
        let undefined = [format(vk::Format::UNDEFINED, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        let (chosen, matched) = select_format(&undefined, PREFERRED_FORMAT).unwrap();
        assert_eq!(chosen.format, PREFERRED_FORMAT.format);
        assert_eq!(matched, FormatMatch::Unrestricted);

        let other_space = [
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT),
        ];
        let (chosen, matched) = select_format(&other_space, PREFERRED_FORMAT).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT);
        assert_eq!(matched, FormatMatch::OtherColorSpace);

        let unrelated = [format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        let (chosen, matched) = select_format(&unrelated, PREFERRED_FORMAT).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(matched, FormatMatch::FirstAvailable);

        assert!(select_format(&[], PREFERRED_FORMAT).is_none());
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        assert_eq!(
            select_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            Some(vk::PresentModeKHR::FIFO)
        );
        let modes = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(
            select_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            Some(vk::PresentModeKHR::MAILBOX)
        );
        assert_eq!(select_present_mode(&[], vk::PresentModeKHR::MAILBOX), None);
    }

    #[test]
    fn image_count_is_capped() {
        let mut c = caps();
        assert_eq!(select_image_count(&c), 3);
        c.max_image_count = 2;
        assert_eq!(select_image_count(&c), 2);
        c.max_image_count = 0;
        assert_eq!(select_image_count(&c), 3);
    }

    #[test]
    fn extent_uses_current_or_default() {
        let mut c = caps();
        assert_eq!(select_extent(&c).width, 1280);

        c.current_extent.width = u32::MAX;
        let extent = select_extent(&c);
        assert_eq!((extent.width, extent.height), (640, 480));

        c.min_image_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let extent = select_extent(&c);
        assert_eq!((extent.width, extent.height), (800, 600));

        c.min_image_extent = vk::Extent2D {
            width: 1,
            height: 1,
        };
        c.max_image_extent = vk::Extent2D {
            width: 320,
            height: 240,
        };
        let extent = select_extent(&c);
        assert_eq!((extent.width, extent.height), (320, 240));
    }

    #[test]
    fn usage_and_transform_respect_support() {
        let c = caps();
        let (usage, complete) = select_usage(&c, vk::ImageUsageFlags::COLOR_ATTACHMENT);
        assert!(complete);
        assert_eq!(usage, vk::ImageUsageFlags::COLOR_ATTACHMENT);

        let (usage, complete) = select_usage(
            &c,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::STORAGE,
        );
        assert!(!complete);
        assert_eq!(usage, vk::ImageUsageFlags::COLOR_ATTACHMENT);

        assert_eq!(
            select_transform(&c, vk::SurfaceTransformFlagsKHR::IDENTITY),
            vk::SurfaceTransformFlagsKHR::IDENTITY
        );
        assert_eq!(
            select_transform(&c, vk::SurfaceTransformFlagsKHR::HORIZONTAL_MIRROR),
            vk::SurfaceTransformFlagsKHR::ROTATE_90
        );
    }
}
