//! Presentation surfaces.
//!
//! The device never creates windows. It asks a [`SurfaceSource`] for the
//! instance extensions the platform needs and then lets it create the
//! surface once the instance exists. [`WindowSurface`] covers any window
//! that exposes `raw-window-handle` handles.

use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::c_char;
use std::fmt;

/// Something that can create a presentation surface for an instance.
pub trait SurfaceSource: Send + Sync {
    /// Instance extensions needed to create the surface.
    fn instance_extensions(&self) -> Result<Vec<*const c_char>>;

    /// Create the surface.
    ///
    /// # Safety
    /// The instance must have been created with [`instance_extensions`]
    /// enabled and must outlive the returned surface.
    ///
    /// [`instance_extensions`]: SurfaceSource::instance_extensions
    unsafe fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<vk::SurfaceKHR>;
}

/// Surface source backed by a platform window.
///
/// The window is kept alive as long as the surface created from it.
pub struct WindowSurface<W> {
    window: W,
}

impl<W> WindowSurface<W>
where
    W: HasDisplayHandle + HasWindowHandle + Send + Sync,
{
    pub fn new(window: W) -> Self {
        Self { window }
    }

    pub fn window(&self) -> &W {
        &self.window
    }
}

impl<W> SurfaceSource for WindowSurface<W>
where
    W: HasDisplayHandle + HasWindowHandle + Send + Sync,
{
    fn instance_extensions(&self) -> Result<Vec<*const c_char>> {
        let display = self
            .window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;

        let extensions = ash_window::enumerate_required_extensions(display.as_raw())
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        Ok(extensions.to_vec())
    }

    unsafe fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<vk::SurfaceKHR> {
        let display = self
            .window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = self
            .window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        ash_window::create_surface(
            entry,
            instance,
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))
    }
}

/// A created surface together with its extension loader.
pub struct Surface {
    handle: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
    // Keeps the window alive until the surface is destroyed.
    _source: Box<dyn SurfaceSource>,
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Surface {
    /// Create the surface from its source.
    ///
    /// # Safety
    /// See [`SurfaceSource::create_surface`].
    pub(crate) unsafe fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        source: Box<dyn SurfaceSource>,
    ) -> Result<Self> {
        let handle = source.create_surface(entry, instance)?;
        let loader = ash::khr::surface::Instance::new(entry, instance);

        Ok(Self {
            handle,
            loader,
            _source: source,
        })
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.loader
    }

    /// Whether a queue family of the physical device can present here.
    ///
    /// A failed query counts as no support.
    ///
    /// # Safety
    /// The physical device must come from the instance this surface was
    /// created with.
    pub unsafe fn supports_present(
        &self,
        physical_device: vk::PhysicalDevice,
        family: u32,
    ) -> bool {
        self.loader
            .get_physical_device_surface_support(physical_device, family, self.handle)
            .unwrap_or(false)
    }

    /// Query surface capabilities, formats and present modes.
    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceCapabilities> {
        unsafe {
            let capabilities = self
                .loader
                .get_physical_device_surface_capabilities(physical_device, self.handle)?;
            let formats = self
                .loader
                .get_physical_device_surface_formats(physical_device, self.handle)?;
            let present_modes = self
                .loader
                .get_physical_device_surface_present_modes(physical_device, self.handle)?;

            Ok(SurfaceCapabilities {
                capabilities,
                formats,
                present_modes,
            })
        }
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// No swapchain created from this surface may still exist.
    pub(crate) unsafe fn destroy(&self) {
        self.loader.destroy_surface(self.handle, None);
    }
}

/// Surface capabilities query result.
#[derive(Debug, Clone)]
pub struct SurfaceCapabilities {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}
