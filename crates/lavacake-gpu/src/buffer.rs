//! GPU buffers.
//!
//! A [`Buffer`] remembers the pipeline stage and access mask of its last
//! use so that [`Buffer::set_access`] can emit the matching barrier.

use crate::command::CommandBuffer;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::image::Image;
use crate::memory::MemoryKind;
use crate::queue::Queue;
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::Allocation;

/// Creation parameters for a [`Buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryKind,
    /// Stage the buffer is used in after creation.
    pub stage: vk::PipelineStageFlags,
    /// Access mask the buffer is used with after creation.
    pub access: vk::AccessFlags,
    /// Format of the texel view, only used with storage texel buffers.
    pub texel_format: vk::Format,
}

impl BufferInfo {
    pub fn new(usage: vk::BufferUsageFlags) -> Self {
        Self {
            usage,
            memory: MemoryKind::DeviceLocal,
            stage: vk::PipelineStageFlags::TRANSFER,
            access: vk::AccessFlags::TRANSFER_WRITE,
            texel_format: vk::Format::R32_SFLOAT,
        }
    }

    pub fn memory(mut self, memory: MemoryKind) -> Self {
        self.memory = memory;
        self
    }

    pub fn stage(mut self, stage: vk::PipelineStageFlags) -> Self {
        self.stage = stage;
        self
    }

    pub fn access(mut self, access: vk::AccessFlags) -> Self {
        self.access = access;
        self
    }

    pub fn texel_format(mut self, format: vk::Format) -> Self {
        self.texel_format = format;
        self
    }
}

/// Size of a buffer holding `data_size` bytes, padded past the next
/// non-coherent atom boundary.
///
/// A size that is already a multiple of the atom still gains a full atom.
pub fn padded_size(data_size: u64, non_coherent_atom_size: u64) -> u64 {
    if non_coherent_atom_size == 0 {
        return data_size;
    }
    data_size + (non_coherent_atom_size - data_size % non_coherent_atom_size)
}

/// A buffer backed by `gpu-allocator` memory.
pub struct Buffer {
    device: Device,
    handle: vk::Buffer,
    view: vk::BufferView,
    allocation: Option<Allocation>,
    size: u64,
    data_size: u64,
    usage: vk::BufferUsageFlags,
    stage: vk::PipelineStageFlags,
    access: vk::AccessFlags,
    queue_family: u32,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

impl Buffer {
    /// Create an uninitialized buffer of `size` bytes.
    pub fn new(device: &Device, size: u64, info: &BufferInfo) -> Result<Self> {
        let mut buffer = Self::create(device, size, info)?;
        buffer.access = vk::AccessFlags::empty();
        Ok(buffer)
    }

    /// Create a buffer holding `data`.
    ///
    /// Host-visible buffers are written directly. Device-local buffers are
    /// filled through a temporary staging buffer, recorded into `cmd` and
    /// submitted to `queue`; the call returns once the copy completed and
    /// the buffer is left in `info.stage` / `info.access`.
    pub fn from_data<T: Pod>(
        device: &Device,
        queue: &Queue,
        cmd: &mut CommandBuffer,
        data: &[T],
        info: &BufferInfo,
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let atom = device.capabilities().limits.non_coherent_atom_size;
        let size = padded_size(bytes.len() as u64, atom);

        let mut info = *info;
        info.usage |= vk::BufferUsageFlags::TRANSFER_DST;
        let mut buffer = Self::create(device, size, &info)?;
        buffer.data_size = bytes.len() as u64;
        buffer.queue_family = queue.family_index();

        if info.memory.is_host_visible() {
            buffer.write_bytes(0, bytes)?;
            return Ok(buffer);
        }

        let staging_info = BufferInfo::new(vk::BufferUsageFlags::TRANSFER_SRC)
            .memory(MemoryKind::HostVisible);
        let staging = Self::create(device, size, &staging_info)?;
        staging.write_bytes(0, bytes)?;

        cmd.wait(u64::MAX, false)?;
        cmd.begin_record()?;
        buffer.set_access(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            None,
        );
        staging.copy_to_buffer(
            cmd,
            &buffer,
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            }],
        );
        buffer.set_access(cmd, info.stage, info.access, None);
        cmd.end_record()?;
        cmd.submit(queue, &[], &[])?;
        cmd.wait(u64::MAX, false)?;

        Ok(buffer)
    }

    fn create(device: &Device, size: u64, info: &BufferInfo) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = device.check(
            unsafe { device.handle().create_buffer(&buffer_info, None) },
            || "Can't create Buffer",
        )?;

        let requirements = unsafe { device.handle().get_buffer_memory_requirements(handle) };
        let allocation = match device.allocate("buffer", requirements, info.memory.location(), true)
        {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_buffer(handle, None) };
                device.errors().error("Could not allocate memory for a buffer.");
                return Err(e);
            }
        };

        // From here the wrapper owns everything it needs to clean up.
        let mut buffer = Self {
            device: device.clone(),
            handle,
            view: vk::BufferView::null(),
            allocation: None,
            size,
            data_size: size,
            usage: info.usage,
            stage: info.stage,
            access: info.access,
            queue_family: vk::QUEUE_FAMILY_IGNORED,
        };

        let bind = unsafe {
            device
                .handle()
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        };
        buffer.allocation = Some(allocation);
        device.check(bind, || "Could not bind memory object to a buffer.")?;

        if info
            .usage
            .contains(vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER)
        {
            let view_info = vk::BufferViewCreateInfo::default()
                .buffer(handle)
                .format(info.texel_format)
                .offset(0)
                .range(vk::WHOLE_SIZE);
            buffer.view = device.check(
                unsafe { device.handle().create_buffer_view(&view_info, None) },
                || "Could not create buffer view.",
            )?;
        }

        Ok(buffer)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Texel view, null unless created with storage texel buffer usage.
    pub fn view(&self) -> vk::BufferView {
        self.view
    }

    /// Allocated size in bytes, padding included.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size of the data the buffer was created with.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn stage(&self) -> vk::PipelineStageFlags {
        self.stage
    }

    pub fn access(&self) -> vk::AccessFlags {
        self.access
    }

    /// Record a barrier from the current stage/access to the given ones.
    ///
    /// With a destination queue family the barrier also transfers
    /// ownership from the buffer's current family.
    pub fn set_access(
        &mut self,
        cmd: &CommandBuffer,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
        dst_queue_family: Option<u32>,
    ) {
        let (src_family, dst_family) = match dst_queue_family {
            Some(family) => (self.queue_family, family),
            None => (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED),
        };

        let barrier = vk::BufferMemoryBarrier::default()
            .buffer(self.handle)
            .src_access_mask(self.access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(src_family)
            .dst_queue_family_index(dst_family)
            .offset(0)
            .size(vk::WHOLE_SIZE);

        unsafe {
            self.device.handle().cmd_pipeline_barrier(
                cmd.handle(),
                self.stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }

        self.stage = dst_stage;
        self.access = dst_access;
        if let Some(family) = dst_queue_family {
            self.queue_family = family;
        }
    }

    /// Record a copy into another buffer.
    pub fn copy_to_buffer(&self, cmd: &CommandBuffer, dst: &Buffer, regions: &[vk::BufferCopy]) {
        if regions.is_empty() {
            return;
        }
        unsafe {
            self.device
                .handle()
                .cmd_copy_buffer(cmd.handle(), self.handle, dst.handle, regions);
        }
    }

    /// Record a copy into an image in its current layout.
    pub fn copy_to_image(
        &self,
        cmd: &CommandBuffer,
        image: &Image,
        regions: &[vk::BufferImageCopy],
    ) {
        if regions.is_empty() {
            return;
        }
        unsafe {
            self.device.handle().cmd_copy_buffer_to_image(
                cmd.handle(),
                self.handle,
                image.handle(),
                image.layout(),
                regions,
            );
        }
    }

    fn mapped_ptr(&self) -> Result<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr().cast::<u8>())
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))
    }

    /// Write typed data at the start of a host-visible buffer.
    pub fn write<T: Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Write raw bytes at `offset` of a host-visible buffer.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self.mapped_ptr().map_err(|e| self.device.fail(e))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(self.device.fail(GpuError::InvalidState(
                "Data range too large for buffer".to_string(),
            )));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    /// Read the data of a host-visible buffer.
    pub fn read<T: Pod>(&self) -> Result<Vec<T>> {
        let bytes = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_slice)
            .ok_or_else(|| {
                self.device
                    .fail(GpuError::InvalidState("Buffer not mapped".to_string()))
            })?;
        Ok(read_pod(&bytes[..self.data_size as usize]))
    }

    /// Copy a device-local buffer back to the host.
    pub fn read_back<T: Pod>(
        &mut self,
        queue: &Queue,
        cmd: &mut CommandBuffer,
    ) -> Result<Vec<T>> {
        if self.allocation.as_ref().is_some_and(|a| a.mapped_ptr().is_some()) {
            return self.read();
        }

        let staging_info =
            BufferInfo::new(vk::BufferUsageFlags::TRANSFER_DST).memory(MemoryKind::Readback);
        let mut staging = Self::create(&self.device, self.size, &staging_info)?;
        staging.data_size = self.data_size;

        let (stage, access) = (self.stage, self.access);
        cmd.wait(u64::MAX, false)?;
        cmd.begin_record()?;
        self.set_access(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
            None,
        );
        self.copy_to_buffer(
            cmd,
            &staging,
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: self.size,
            }],
        );
        self.set_access(cmd, stage, access, None);
        cmd.end_record()?;
        cmd.submit(queue, &[], &[])?;
        cmd.wait(u64::MAX, false)?;

        staging.read()
    }

    /// Device address, for buffers created with shader device address usage.
    pub fn device_address(&self) -> Result<vk::DeviceAddress> {
        if !self
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        {
            return Err(self.device.fail(GpuError::InvalidState(
                "Buffer was not created with device address usage".to_string(),
            )));
        }
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.handle);
        Ok(unsafe { self.device.handle().get_buffer_device_address(&info) })
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::BufferView::null() {
                self.device.handle().destroy_buffer_view(self.view, None);
            }
            self.device.handle().destroy_buffer(self.handle, None);
        }
        if let Some(allocation) = self.allocation.take() {
            self.device.free(allocation);
        }
    }
}

fn read_pod<T: Pod>(bytes: &[u8]) -> Vec<T> {
    let count = bytes.len() / std::mem::size_of::<T>().max(1);
    let mut out = vec![T::zeroed(); count];
    let len = count * std::mem::size_of::<T>();
    bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(&bytes[..len]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_reaches_next_atom() {
        assert_eq!(padded_size(100, 64), 128);
        assert_eq!(padded_size(1, 256), 256);
        // Already aligned data still gets a whole extra atom.
        assert_eq!(padded_size(128, 64), 192);
        assert_eq!(padded_size(100, 0), 100);
    }

    #[test]
    fn read_pod_truncates_partial_elements() {
        let bytes = [1u8, 0, 0, 0, 2, 0, 0, 0, 9];
        let values: Vec<u32> = read_pod(&bytes);
        assert_eq!(
            values,
            vec![u32::from_ne_bytes([1, 0, 0, 0]), u32::from_ne_bytes([2, 0, 0, 0])]
        );
    }

    #[test]
    fn info_defaults_to_transfer_write() {
        let info = BufferInfo::new(vk::BufferUsageFlags::UNIFORM_BUFFER)
            .memory(MemoryKind::HostVisible)
            .stage(vk::PipelineStageFlags::VERTEX_SHADER);
        assert_eq!(info.access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(info.texel_format, vk::Format::R32_SFLOAT);
        assert_eq!(info.stage, vk::PipelineStageFlags::VERTEX_SHADER);
    }
}
