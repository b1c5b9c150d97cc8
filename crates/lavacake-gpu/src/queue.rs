//! Logical queues handed out by the device.

use crate::device::Device;
use crate::error::Result;
use ash::vk;
use std::fmt;

/// Role a queue was requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Present,
}

impl QueueKind {
    /// Queue flag a family must expose for this kind, if any.
    ///
    /// Presentation is decided by the surface, not by a flag.
    pub fn required_flags(self) -> Option<vk::QueueFlags> {
        match self {
            Self::Graphics => Some(vk::QueueFlags::GRAPHICS),
            Self::Compute => Some(vk::QueueFlags::COMPUTE),
            Self::Present => None,
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graphics => write!(f, "graphics"),
            Self::Compute => write!(f, "compute"),
            Self::Present => write!(f, "present"),
        }
    }
}

/// A queue retrieved from the logical device.
///
/// The handle is fetched once after device creation, always from queue
/// index 0 of its family. Two logical queues that share a family therefore
/// share the native queue as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queue {
    kind: QueueKind,
    family_index: u32,
    handle: vk::Queue,
}

impl Queue {
    pub(crate) fn new(kind: QueueKind, family_index: u32, handle: vk::Queue) -> Self {
        Self {
            kind,
            family_index,
            handle,
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    /// Submit command buffers to this queue.
    ///
    /// Each wait semaphore is paired with the stage at which it is waited on.
    pub fn submit(
        &self,
        device: &Device,
        command_buffers: &[vk::CommandBuffer],
        waits: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signals: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()> {
        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) = waits.iter().copied().unzip();

        let submit_info = vk::SubmitInfo::default()
            .command_buffers(command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(signals);

        device.check(
            unsafe { device.handle().queue_submit(self.handle, &[submit_info], fence) },
            || format!("Could not submit to the {} queue.", self.kind),
        )
    }

    /// Block until the queue has no pending work.
    pub fn wait_idle(&self, device: &Device) -> Result<()> {
        device.check(
            unsafe { device.handle().queue_wait_idle(self.handle) },
            || "Waiting for a queue failed.",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_has_no_flag() {
        assert_eq!(
            QueueKind::Graphics.required_flags(),
            Some(vk::QueueFlags::GRAPHICS)
        );
        assert_eq!(
            QueueKind::Compute.required_flags(),
            Some(vk::QueueFlags::COMPUTE)
        );
        assert_eq!(QueueKind::Present.required_flags(), None);
    }

    #[test]
    fn queues_sharing_a_family_compare_equal() {
        let a = Queue::new(QueueKind::Compute, 0, vk::Queue::null());
        let b = Queue::new(QueueKind::Compute, 0, vk::Queue::null());
        assert_eq!(a, b);
        assert_eq!(a.kind().to_string(), "compute");
    }
}
