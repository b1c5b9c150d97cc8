//! Device context.
//!
//! [`DeviceBuilder::build`] runs the whole bring-up: instance, optional
//! surface, physical device negotiation, logical device, queues, allocator
//! and command pool. The resulting [`Device`] is a shared handle; every
//! resource wrapper keeps a clone, so native objects are only destroyed
//! once the last user is gone.

use crate::capabilities::{query_adapter_info, AdapterCapabilities};
use crate::diagnostics::ErrorState;
use crate::error::{GpuError, Result};
use crate::instance::{base_instance_extensions, create_instance};
use crate::memory::GpuAllocator;
use crate::queue::{Queue, QueueKind};
use crate::selection::{
    negotiate, CandidateOutcome, CandidateReport, Capability, CapabilitySet, DevicePlan,
    Requirement, SelectionRequest,
};
use crate::surface::{Surface, SurfaceSource};
use ash::prelude::VkResult;
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::ffi::{c_char, CString};
use std::fmt;
use std::sync::Arc;

/// Instance-level objects, destroyed in reverse creation order.
struct InstanceCore {
    entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface: Option<Surface>,
}

impl Drop for InstanceCore {
    fn drop(&mut self) {
        unsafe {
            if let Some(surface) = self.surface.take() {
                surface.destroy();
            }
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

struct DeviceInner {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    command_pool: vk::CommandPool,
    allocator: Mutex<Option<GpuAllocator>>,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    graphics_queues: Vec<Queue>,
    compute_queues: Vec<Queue>,
    present_queue: Option<Queue>,
    plan: DevicePlan,
    report: Vec<CandidateReport>,
    capabilities: AdapterCapabilities,
    errors: Arc<ErrorState>,
    // Dropped after the logical device.
    core: InstanceCore,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        tracing::debug!("Destroying device {:?}", self.device.handle());
        unsafe {
            let _ = self.device.device_wait_idle();

            if self.command_pool != vk::CommandPool::null() {
                self.device.destroy_command_pool(self.command_pool, None);
            }

            // Frees all VkDeviceMemory before the device goes away.
            if let Some(mut allocator) = self.allocator.lock().take() {
                allocator.shutdown();
            }

            self.device.destroy_device(None);
        }
    }
}

/// Shared handle to the negotiated logical device and its queues.
///
/// Cloning is cheap and every clone refers to the same context.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.inner.device.handle())
            .field("adapter", &self.inner.capabilities.device_name)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Start configuring a new device.
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder::new()
    }

    /// Get the logical device.
    pub fn handle(&self) -> &ash::Device {
        &self.inner.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.inner.core.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.inner.physical_device
    }

    /// Command pool shared by every command buffer of this device.
    pub fn command_pool(&self) -> vk::CommandPool {
        self.inner.command_pool
    }

    /// The presentation surface, `None` for a headless device.
    pub fn surface(&self) -> Option<&Surface> {
        self.inner.core.surface.as_ref()
    }

    pub(crate) fn swapchain_loader(&self) -> Option<&ash::khr::swapchain::Device> {
        self.inner.swapchain_loader.as_ref()
    }

    /// The `index`-th requested graphics queue.
    pub fn graphics_queue(&self, index: usize) -> Option<Queue> {
        self.inner.graphics_queues.get(index).copied()
    }

    /// The `index`-th requested compute queue.
    pub fn compute_queue(&self, index: usize) -> Option<Queue> {
        self.inner.compute_queues.get(index).copied()
    }

    pub fn present_queue(&self) -> Option<Queue> {
        self.inner.present_queue
    }

    pub fn graphics_queues(&self) -> &[Queue] {
        &self.inner.graphics_queues
    }

    pub fn compute_queues(&self) -> &[Queue] {
        &self.inner.compute_queues
    }

    /// Whether the ray tracing extensions were enabled on this device.
    pub fn ray_tracing_available(&self) -> bool {
        self.inner.plan.ray_tracing_available()
    }

    /// Whether the mesh shader extension was enabled on this device.
    pub fn mesh_shader_available(&self) -> bool {
        self.inner.plan.mesh_shader_available()
    }

    /// The plan the device was created from.
    pub fn plan(&self) -> &DevicePlan {
        &self.inner.plan
    }

    /// Outcome of every candidate examined during selection.
    pub fn selection_report(&self) -> &[CandidateReport] {
        &self.inner.report
    }

    pub fn capabilities(&self) -> &AdapterCapabilities {
        &self.inner.capabilities
    }

    /// Last-error side channel shared by everything built on this device.
    pub fn errors(&self) -> &ErrorState {
        &self.inner.errors
    }

    /// Shared handle to the side channel, for objects that outlive a borrow.
    pub fn shared_errors(&self) -> Arc<ErrorState> {
        Arc::clone(&self.inner.errors)
    }

    /// Whether both handles refer to the same context.
    pub fn same_context(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Record `message` as an error when `result` failed, then convert.
    pub fn check<T, M>(&self, result: VkResult<T>, message: impl FnOnce() -> M) -> Result<T>
    where
        M: Into<String>,
    {
        result.map_err(|e| {
            self.errors().error(message());
            GpuError::from(e)
        })
    }

    /// Record a non-Vulkan failure and hand the error back.
    pub fn fail(&self, error: GpuError) -> GpuError {
        self.errors().error(error.to_string());
        error
    }

    /// Block until every queue of the device is idle.
    pub fn wait_idle(&self) -> Result<()> {
        self.check(unsafe { self.inner.device.device_wait_idle() }, || {
            "Waiting on a device failed."
        })
    }

    /// Wait for outstanding work and release this handle.
    ///
    /// Native objects are destroyed once every other clone (including
    /// those held by resources) has been dropped too.
    pub fn end(self) -> Result<()> {
        self.wait_idle()?;
        if Arc::strong_count(&self.inner) > 1 {
            tracing::debug!(
                "Device released with {} other handle(s) still alive",
                Arc::strong_count(&self.inner) - 1
            );
        }
        Ok(())
    }

    pub(crate) fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        let mut allocator = self.inner.allocator.lock();
        let allocator = allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))?;
        allocator
            .allocate(name, requirements, location, linear)
            .map_err(|e| self.fail(e))
    }

    pub(crate) fn free(&self, allocation: Allocation) {
        if let Some(allocator) = self.inner.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                tracing::warn!("Failed to free allocation: {e}");
            }
        }
    }
}

/// Builder for creating a [`Device`].
pub struct DeviceBuilder {
    app_name: String,
    validation: bool,
    graphics_queues: usize,
    compute_queues: usize,
    surface: Option<Box<dyn SurfaceSource>>,
    ray_tracing: Option<Requirement>,
    mesh_shader: Option<Requirement>,
    extensions: Vec<String>,
    features: vk::PhysicalDeviceFeatures,
    errors: Arc<ErrorState>,
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        Self {
            app_name: "LavaCake".to_string(),
            validation: cfg!(debug_assertions),
            graphics_queues: 1,
            compute_queues: 0,
            surface: None,
            ray_tracing: None,
            mesh_shader: None,
            extensions: Vec::new(),
            features: vk::PhysicalDeviceFeatures::default(),
            errors: Arc::new(ErrorState::new()),
        }
    }
}

impl DeviceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.validation = enable;
        self
    }

    pub fn graphics_queues(mut self, count: usize) -> Self {
        self.graphics_queues = count;
        self
    }

    pub fn compute_queues(mut self, count: usize) -> Self {
        self.compute_queues = count;
        self
    }

    /// Present to a surface. Without one the device is headless.
    pub fn surface(mut self, source: impl SurfaceSource + 'static) -> Self {
        self.surface = Some(Box::new(source));
        self
    }

    pub fn ray_tracing(mut self, requirement: Requirement) -> Self {
        self.ray_tracing = Some(requirement);
        self
    }

    pub fn mesh_shader(mut self, requirement: Requirement) -> Self {
        self.mesh_shader = Some(requirement);
        self
    }

    /// Require an additional device extension.
    pub fn extension(mut self, name: impl Into<String>) -> Self {
        self.extensions.push(name.into());
        self
    }

    /// Core features to enable on the logical device.
    pub fn features(mut self, features: vk::PhysicalDeviceFeatures) -> Self {
        self.features = features;
        self
    }

    /// Use an existing error state, e.g. to read it after a failed build.
    pub fn error_state(mut self, errors: Arc<ErrorState>) -> Self {
        self.errors = errors;
        self
    }

    fn selection_request(&self) -> SelectionRequest {
        let mut request = SelectionRequest::new(
            self.graphics_queues,
            self.compute_queues,
            self.surface.is_some(),
        );
        for extension in &self.extensions {
            request = request.extension(extension.clone());
        }
        if let Some(requirement) = self.ray_tracing {
            request = request.capability(Capability::RayTracing, requirement);
        }
        if let Some(requirement) = self.mesh_shader {
            request = request.capability(Capability::MeshShader, requirement);
        }
        request
    }

    /// Build the device.
    pub fn build(self) -> Result<Device> {
        let errors = self.errors.clone();
        let request = self.selection_request();

        if self.graphics_queues + self.compute_queues == 0 {
            errors.error("At least one graphics or compute queue must be requested.");
            return Err(GpuError::InvalidState(
                "No graphics or compute queue requested".to_string(),
            ));
        }

        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            errors.error("Could not connect with a Vulkan Runtime library.");
            GpuError::Loader(e.to_string())
        })?;

        let mut instance_extensions: Vec<*const c_char> = base_instance_extensions()
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();
        if let Some(source) = &self.surface {
            instance_extensions.extend(source.instance_extensions()?);
        }

        let parts = unsafe {
            create_instance(
                &entry,
                &self.app_name,
                &instance_extensions,
                self.validation,
                &errors,
            )
        }?;

        let mut core = InstanceCore {
            entry,
            instance: parts.instance,
            debug: parts.debug,
            surface: None,
        };

        if let Some(source) = self.surface {
            let surface = unsafe { Surface::new(&core.entry, &core.instance, source) }
                .inspect_err(|e| errors.error(e.to_string()))?;
            core.surface = Some(surface);
        }

        let physical_devices = unsafe { core.instance.enumerate_physical_devices() }
            .ok()
            .filter(|devices| !devices.is_empty())
            .ok_or_else(|| {
                errors.error("Could not get the number of available physical devices.");
                GpuError::NoSuitableDevice
            })?;
        errors.note(format!(
            "{} physical device(s) found on this computer.",
            physical_devices.len()
        ));

        let adapters: Vec<_> = physical_devices
            .iter()
            .map(|&physical| unsafe {
                query_adapter_info(&core.instance, physical, core.surface.as_ref())
            })
            .collect();

        let features = self.features;
        let negotiation = negotiate(&adapters, &request, |_, plan| unsafe {
            create_logical_device(
                &core.instance,
                physical_devices[plan.adapter_index],
                plan,
                &features,
            )
        });

        for entry in &negotiation.report {
            log_candidate(&errors, entry);
        }

        let Some(selected) = negotiation.selected else {
            errors.error("The logical device could not be created");
            return Err(GpuError::NoSuitableDevice);
        };
        let plan = selected.plan;
        let device = selected.device;
        let physical_device = physical_devices[plan.adapter_index];

        let capabilities = unsafe { AdapterCapabilities::query(&core.instance, physical_device) };
        errors.note(format!("Chosen device is {}", capabilities.device_name));
        tracing::info!("Selected GPU: {}", capabilities.summary());

        let downgraded = plan.downgraded();
        if downgraded.contains(CapabilitySet::RAY_TRACING) {
            errors.warning(1, "Raytracing extensions not found on this device");
            tracing::warn!("Ray tracing disabled on {}", capabilities.device_name);
        }
        if downgraded.contains(CapabilitySet::MESH_SHADER) {
            errors.warning(1, "Mesh shader extensions not found on this device");
            tracing::warn!("Mesh shading disabled on {}", capabilities.device_name);
        }

        let fetch = |kind: QueueKind, family: u32| {
            Queue::new(kind, family, unsafe { device.get_device_queue(family, 0) })
        };
        let graphics_queues = plan
            .queues
            .graphics
            .iter()
            .map(|&family| fetch(QueueKind::Graphics, family))
            .collect();
        let compute_queues = plan
            .queues
            .compute
            .iter()
            .map(|&family| fetch(QueueKind::Compute, family))
            .collect();
        let present_queue = plan
            .queues
            .present
            .map(|family| fetch(QueueKind::Present, family));

        let swapchain_loader = core
            .surface
            .as_ref()
            .map(|_| ash::khr::swapchain::Device::new(&core.instance, &device));

        let pool_family = plan.queues.command_pool_family();
        let ray_tracing = plan.ray_tracing_available();

        // From here on, dropping `inner` tears everything down again.
        let mut inner = DeviceInner {
            device,
            physical_device,
            command_pool: vk::CommandPool::null(),
            allocator: Mutex::new(None),
            swapchain_loader,
            graphics_queues,
            compute_queues,
            present_queue,
            plan,
            report: negotiation.report,
            capabilities,
            errors: errors.clone(),
            core,
        };

        let allocator = unsafe {
            GpuAllocator::new(
                &inner.core.instance,
                &inner.device,
                physical_device,
                ray_tracing,
            )
        }
        .inspect_err(|e| errors.error(e.to_string()))?;
        *inner.allocator.get_mut() = Some(allocator);

        let family = pool_family.ok_or_else(|| {
            GpuError::InvalidState("No queue family for the command pool".to_string())
        })?;
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(family);
        inner.command_pool = unsafe { inner.device.create_command_pool(&pool_info, None) }
            .map_err(|e| {
                errors.error("Could not create command pool.");
                GpuError::from(e)
            })?;

        Ok(Device {
            inner: Arc::new(inner),
        })
    }
}

fn log_candidate(errors: &ErrorState, entry: &CandidateReport) {
    match &entry.outcome {
        CandidateOutcome::Valid => {
            tracing::debug!("Candidate {} accepted (rating {})", entry.name, entry.rating);
        }
        CandidateOutcome::MissingMandatory { extensions } if extensions.is_empty() => {
            errors.note(format!(
                "Could not enumerate device extensions for device {}",
                entry.name
            ));
            tracing::debug!("Candidate {} rejected: no extension list", entry.name);
        }
        CandidateOutcome::MissingMandatory { extensions } => {
            for extension in extensions {
                errors.note(format!(
                    "Extension named '{extension}' is not supported by the device {}",
                    entry.name
                ));
            }
            tracing::debug!(
                "Candidate {} rejected: missing {}",
                entry.name,
                extensions.join(", ")
            );
        }
        CandidateOutcome::QueueResolutionFailed(kind) => {
            errors.note(format!(
                "No {kind} queue family available on device {}",
                entry.name
            ));
            tracing::debug!("Candidate {} rejected: no {kind} queue", entry.name);
        }
        CandidateOutcome::DeviceCreationFailed(result) => {
            errors.note(format!(
                "Logical device creation failed on {}: {result}",
                entry.name
            ));
            tracing::debug!("Candidate {} rejected: {result}", entry.name);
        }
    }
}

/// Create the logical device described by `plan`.
///
/// The extended feature chain is only attached when ray tracing or mesh
/// shading survived negotiation; otherwise the core features are passed
/// directly.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    plan: &DevicePlan,
    features: &vk::PhysicalDeviceFeatures,
) -> std::result::Result<ash::Device, vk::Result> {
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = plan
        .queue_create_entries
        .iter()
        .map(|entry| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(entry.family_index)
                .queue_priorities(&entry.priorities)
        })
        .collect();

    let extensions: Vec<CString> = plan
        .enabled_extensions
        .iter()
        .filter_map(|name| CString::new(name.as_str()).ok())
        .collect();
    let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();

    let mut buffer_device_address =
        vk::PhysicalDeviceBufferDeviceAddressFeatures::default().buffer_device_address(true);
    let mut ray_tracing_pipeline =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
    let mut acceleration_structure =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
    let mut mesh_shader = vk::PhysicalDeviceMeshShaderFeaturesNV::default()
        .task_shader(true)
        .mesh_shader(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default().features(*features);
    if plan.ray_tracing_available() {
        features2 = features2
            .push_next(&mut buffer_device_address)
            .push_next(&mut ray_tracing_pipeline)
            .push_next(&mut acceleration_structure);
    }
    if plan.mesh_shader_available() {
        features2 = features2.push_next(&mut mesh_shader);
    }

    let mut create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extension_ptrs);
    if plan.available.is_empty() {
        create_info = create_info.enabled_features(features);
    } else {
        create_info = create_info.push_next(&mut features2);
    }

    instance.create_device(physical_device, &create_info, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests require a GPU and will be skipped in CI without GPU support

    fn headless() -> Device {
        Device::builder()
            .app_name("lavacake-device-tests")
            .graphics_queues(1)
            .build()
            .unwrap()
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn clones_share_one_context() {
        let device = headless();
        let clone = device.clone();
        assert!(device.same_context(&clone));

        clone.end().unwrap();
        device.wait_idle().unwrap();
        assert!(device.graphics_queue(0).is_some());
        assert!(device.errors().last().is_none());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn rebuilding_after_last_drop_gives_a_new_context() {
        let first = headless();
        let witness = Arc::downgrade(&first.inner);
        first.end().unwrap();
        assert!(witness.upgrade().is_none());

        // The weak handle pins the old allocation, so addresses cannot repeat.
        let second = headless();
        assert!(!std::sync::Weak::ptr_eq(
            &witness,
            &Arc::downgrade(&second.inner)
        ));
        assert!(second.same_context(&second.clone()));
        second.wait_idle().unwrap();
    }
}
