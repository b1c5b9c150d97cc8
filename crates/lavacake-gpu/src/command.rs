//! Command buffer management.

use crate::device::Device;
use crate::error::Result;
use crate::queue::Queue;
use crate::sync::{Fence, Semaphore};
use ash::vk;

/// A primary command buffer allocated from the device's command pool,
/// paired with the fence its submissions signal.
#[derive(Debug)]
pub struct CommandBuffer {
    device: Device,
    handle: vk::CommandBuffer,
    fence: Fence,
    submitted: bool,
}

impl CommandBuffer {
    /// Allocate a command buffer. Its fence starts signaled.
    pub fn new(device: &Device) -> Result<Self> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(device.command_pool())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = device.check(
            unsafe { device.handle().allocate_command_buffers(&alloc_info) },
            || "Failed to allocate command buffer.",
        )?;
        let fence = Fence::new(device, true)?;

        Ok(Self {
            device: device.clone(),
            handle: buffers[0],
            fence,
            submitted: false,
        })
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// Whether a submission has not been waited on yet.
    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    /// Begin recording for a single submission.
    pub fn begin_record(&self) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.device.check(
            unsafe {
                self.device
                    .handle()
                    .begin_command_buffer(self.handle, &begin_info)
            },
            || "Could not begin command buffer recording operation.",
        )
    }

    /// Finish recording.
    pub fn end_record(&self) -> Result<()> {
        self.device.check(
            unsafe { self.device.handle().end_command_buffer(self.handle) },
            || "Error occurred during command buffer recording.",
        )
    }

    /// Submit to `queue`. The fence is reset first and signaled on completion.
    pub fn submit(
        &mut self,
        queue: &Queue,
        waits: &[(&Semaphore, vk::PipelineStageFlags)],
        signals: &[&Semaphore],
    ) -> Result<()> {
        let waits: Vec<_> = waits.iter().map(|(s, stage)| (s.handle(), *stage)).collect();
        let signals: Vec<_> = signals.iter().map(|s| s.handle()).collect();

        self.fence.reset()?;
        queue.submit(
            &self.device,
            &[self.handle],
            &waits,
            &signals,
            self.fence.handle(),
        )?;
        self.submitted = true;
        Ok(())
    }

    /// Wait for the last submission to complete.
    ///
    /// Nothing happens unless a submission is outstanding or `force` is set.
    pub fn wait(&mut self, timeout_ns: u64, force: bool) -> Result<()> {
        let result = if self.submitted || force {
            self.fence.wait(timeout_ns)
        } else {
            Ok(())
        };
        self.submitted = false;
        result
    }

    /// Reset the fence before resubmitting outside of [`submit`](Self::submit).
    pub fn reset_fence(&self) -> Result<()> {
        self.fence.reset()
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .free_command_buffers(self.device.command_pool(), &[self.handle]);
        }
    }
}

/// Record, submit and wait for a throwaway command buffer.
pub fn one_time_submit<F>(device: &Device, queue: &Queue, record: F) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    let mut cmd = CommandBuffer::new(device)?;
    cmd.begin_record()?;
    record(cmd.handle());
    cmd.end_record()?;
    cmd.submit(queue, &[], &[])?;
    cmd.wait(u64::MAX, false)
}
