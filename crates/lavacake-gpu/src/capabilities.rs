//! Physical device queries.

use crate::selection::{AdapterInfo, QueueFamilyInfo};
use crate::surface::Surface;
use ash::vk;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Static properties of the selected physical device.
#[derive(Debug, Clone)]
pub struct AdapterCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub driver_version: u32,
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    pub limits: vk::PhysicalDeviceLimits,
}

impl AdapterCapabilities {
    /// Query properties of a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name: device_name(&properties),
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            device_local_memory_mb,
            limits: properties.limits,
        }
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

fn device_name(properties: &vk::PhysicalDeviceProperties) -> String {
    properties
        .device_name_as_c_str()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Gather what device selection needs to know about a physical device.
///
/// A failed extension query yields `extensions: None`, which disqualifies
/// the candidate. Present support is only checked when a surface exists.
///
/// # Safety
/// The instance, physical device and surface must be valid and related.
pub unsafe fn query_adapter_info(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface: Option<&Surface>,
) -> AdapterInfo {
    let properties = instance.get_physical_device_properties(physical_device);

    let extensions = instance
        .enumerate_device_extension_properties(physical_device)
        .ok()
        .filter(|list| !list.is_empty())
        .map(|list| {
            list.iter()
                .map(|ext| {
                    CStr::from_ptr(ext.extension_name.as_ptr())
                        .to_string_lossy()
                        .into_owned()
                })
                .collect()
        });

    let queue_families = instance
        .get_physical_device_queue_family_properties(physical_device)
        .iter()
        .enumerate()
        .map(|(index, family)| QueueFamilyInfo {
            flags: family.queue_flags,
            queue_count: family.queue_count,
            supports_present: surface
                .is_some_and(|s| s.supports_present(physical_device, index as u32)),
        })
        .collect();

    AdapterInfo {
        name: device_name(&properties),
        extensions,
        queue_families,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }
}
