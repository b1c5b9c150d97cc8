//! Synchronization primitives.

use crate::device::Device;
use crate::error::Result;
use ash::vk;

/// Owned semaphore.
#[derive(Debug)]
pub struct Semaphore {
    device: Device,
    handle: vk::Semaphore,
}

impl Semaphore {
    /// Create a binary semaphore.
    pub fn new(device: &Device) -> Result<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let handle = device.check(
            unsafe { device.handle().create_semaphore(&create_info, None) },
            || "Failed to create a semaphore for the command buffer",
        )?;

        Ok(Self {
            device: device.clone(),
            handle,
        })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { self.device.handle().destroy_semaphore(self.handle, None) };
    }
}

/// Owned fence.
#[derive(Debug)]
pub struct Fence {
    device: Device,
    handle: vk::Fence,
}

impl Fence {
    /// Create a fence, optionally already signaled.
    pub fn new(device: &Device, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let handle = device.check(
            unsafe { device.handle().create_fence(&create_info, None) },
            || "Could not create a fence.",
        )?;

        Ok(Self {
            device: device.clone(),
            handle,
        })
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Wait for the fence to be signaled.
    pub fn wait(&self, timeout_ns: u64) -> Result<()> {
        self.device.check(
            unsafe {
                self.device
                    .handle()
                    .wait_for_fences(&[self.handle], true, timeout_ns)
            },
            || "Waiting on fence failed",
        )
    }

    /// Reset the fence to the unsignaled state.
    pub fn reset(&self) -> Result<()> {
        self.device.check(
            unsafe { self.device.handle().reset_fences(&[self.handle]) },
            || "Error occurred when tried to reset fences",
        )
    }

    /// Whether the fence is currently signaled.
    pub fn is_signaled(&self) -> Result<bool> {
        self.device.check(
            unsafe { self.device.handle().get_fence_status(self.handle) },
            || "Could not query fence status",
        )
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { self.device.handle().destroy_fence(self.handle, None) };
    }
}
