//! Shader Binding Table (SBT) management for hardware ray tracing.
//!
//! Handles are fetched from the driver as one blob in which every group
//! occupies `handle_size_aligned` bytes. Each of the three logical groups
//! (ray generation, miss, hit) gets its own host-visible buffer of
//! `count * handle_size` bytes, filled from the blob at an offset that
//! advances by `handle_size_aligned * count` per group. The aligned source
//! stride and the unaligned copy length differ on purpose.

use ash::vk;
use lavacake_gpu::buffer::{Buffer, BufferInfo};
use lavacake_gpu::{Device, GpuError, MemoryKind, Result};

/// Round `value` up to a multiple of the power-of-two `alignment`.
pub fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

/// One of the three regions of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbtGroup {
    RayGen,
    Miss,
    Hit,
}

impl SbtGroup {
    pub const ALL: [Self; 3] = [Self::RayGen, Self::Miss, Self::Hit];

    fn index(self) -> usize {
        match self {
            Self::RayGen => 0,
            Self::Miss => 1,
            Self::Hit => 2,
        }
    }
}

/// Byte layout of the table for given handle properties and group counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub handle_size_aligned: u32,
    /// Group counts in [`SbtGroup::ALL`] order.
    pub counts: [u32; 3],
}

impl SbtLayout {
    pub fn new(handle_size: u32, handle_alignment: u32, raygen: u32, miss: u32, hit: u32) -> Self {
        Self {
            handle_size,
            handle_size_aligned: align_up(handle_size, handle_alignment),
            counts: [raygen, miss, hit],
        }
    }

    pub fn count(&self, group: SbtGroup) -> u32 {
        self.counts[group.index()]
    }

    pub fn group_count(&self) -> u32 {
        self.counts.iter().sum()
    }

    /// Size of the handle blob requested from the driver.
    pub fn storage_size(&self) -> usize {
        self.group_count() as usize * self.handle_size_aligned as usize
    }

    /// Where `group`'s handles start in the blob.
    pub fn source_offset(&self, group: SbtGroup) -> usize {
        let preceding: u32 = self.counts[..group.index()].iter().sum();
        self.handle_size_aligned as usize * preceding as usize
    }

    /// Bytes copied for `group`, which is also its buffer size.
    pub fn copy_len(&self, group: SbtGroup) -> usize {
        self.handle_size as usize * self.count(group) as usize
    }

    pub fn stride(&self) -> u64 {
        u64::from(self.handle_size_aligned)
    }

    /// Size reported in the device address region of `group`.
    pub fn region_size(&self, group: SbtGroup) -> u64 {
        u64::from(self.count(group)) * self.stride()
    }

    /// Slice of `storage` copied into `group`'s buffer, if the blob is
    /// large enough.
    pub fn group_bytes<'a>(&self, storage: &'a [u8], group: SbtGroup) -> Option<&'a [u8]> {
        let start = self.source_offset(group);
        storage.get(start..start + self.copy_len(group))
    }
}

/// Query the ray tracing pipeline properties of the device.
pub fn ray_tracing_properties(
    device: &Device,
) -> vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'static> {
    let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    {
        let mut properties2 =
            vk::PhysicalDeviceProperties2::default().push_next(&mut rt_properties);
        unsafe {
            device
                .instance()
                .get_physical_device_properties2(device.physical_device(), &mut properties2);
        }
    }
    rt_properties.p_next = std::ptr::null_mut();
    rt_properties
}

/// Shader Binding Table for a ray tracing pipeline.
#[derive(Debug)]
pub struct ShaderBindingTable {
    layout: SbtLayout,
    buffers: [Option<Buffer>; 3],
    regions: [vk::StridedDeviceAddressRegionKHR; 3],
}

impl ShaderBindingTable {
    /// Fetch the group handles of `pipeline` and pack them into buffers.
    ///
    /// Groups with a count of zero get no buffer and an empty region.
    pub fn new(
        device: &Device,
        rt_loader: &ash::khr::ray_tracing_pipeline::Device,
        pipeline: vk::Pipeline,
        counts: [u32; 3],
    ) -> Result<Self> {
        let properties = ray_tracing_properties(device);
        let layout = SbtLayout::new(
            properties.shader_group_handle_size,
            properties.shader_group_handle_alignment,
            counts[0],
            counts[1],
            counts[2],
        );

        let storage = device.check(
            unsafe {
                rt_loader.get_ray_tracing_shader_group_handles(
                    pipeline,
                    0,
                    layout.group_count(),
                    layout.storage_size(),
                )
            },
            || "Could not get shader group handles",
        )?;

        let info = BufferInfo::new(
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )
        .memory(MemoryKind::HostVisible);

        let mut buffers: [Option<Buffer>; 3] = [None, None, None];
        let mut regions = [vk::StridedDeviceAddressRegionKHR::default(); 3];

        for group in SbtGroup::ALL {
            if layout.count(group) == 0 {
                continue;
            }
            let bytes = layout.group_bytes(&storage, group).ok_or_else(|| {
                device.fail(GpuError::InvalidState(
                    "Shader group handle storage is smaller than expected".to_string(),
                ))
            })?;

            let buffer = Buffer::new(device, layout.copy_len(group) as u64, &info)?;
            buffer.write_bytes(0, bytes)?;

            regions[group.index()] = vk::StridedDeviceAddressRegionKHR {
                device_address: buffer.device_address()?,
                stride: layout.stride(),
                size: layout.region_size(group),
            };
            buffers[group.index()] = Some(buffer);
        }

        tracing::debug!(
            "Shader binding table: handle {} bytes (aligned {}), groups {:?}",
            layout.handle_size,
            layout.handle_size_aligned,
            layout.counts
        );

        Ok(Self {
            layout,
            buffers,
            regions,
        })
    }

    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    pub fn buffer(&self, group: SbtGroup) -> Option<&Buffer> {
        self.buffers[group.index()].as_ref()
    }

    pub fn region(&self, group: SbtGroup) -> &vk::StridedDeviceAddressRegionKHR {
        &self.regions[group.index()]
    }

    pub fn raygen_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        self.region(SbtGroup::RayGen)
    }

    pub fn miss_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        self.region(SbtGroup::Miss)
    }

    pub fn hit_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        self.region(SbtGroup::Hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_test() {
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(7, 0), 7);
    }

    #[test]
    fn aligned_source_unaligned_copy() {
        let layout = SbtLayout::new(32, 64, 1, 2, 3);
        assert_eq!(layout.handle_size_aligned, 64);
        assert_eq!(layout.storage_size(), 6 * 64);

        assert_eq!(layout.source_offset(SbtGroup::RayGen), 0);
        assert_eq!(layout.source_offset(SbtGroup::Miss), 64);
        assert_eq!(layout.source_offset(SbtGroup::Hit), 64 * 3);

        assert_eq!(layout.copy_len(SbtGroup::RayGen), 32);
        assert_eq!(layout.copy_len(SbtGroup::Miss), 64);
        assert_eq!(layout.copy_len(SbtGroup::Hit), 96);
    }

    #[test]
    fn regions_use_aligned_stride() {
        let layout = SbtLayout::new(32, 64, 1, 2, 3);
        assert_eq!(layout.stride(), 64);
        assert_eq!(layout.region_size(SbtGroup::RayGen), 64);
        assert_eq!(layout.region_size(SbtGroup::Miss), 128);
        assert_eq!(layout.region_size(SbtGroup::Hit), 192);
    }

    #[test]
    fn group_bytes_slice_the_blob() {
        let layout = SbtLayout::new(32, 64, 1, 2, 3);
        let storage: Vec<u8> = (0..layout.storage_size()).map(|i| (i / 32) as u8).collect();

        let miss = layout.group_bytes(&storage, SbtGroup::Miss).unwrap();
        assert_eq!(miss.len(), 64);
        assert!(miss.iter().all(|&b| b == 2 || b == 3));
        assert_eq!(miss[0], 2);

        let hit = layout.group_bytes(&storage, SbtGroup::Hit).unwrap();
        assert_eq!(hit.len(), 96);
        assert_eq!(hit[0], 6);

        assert!(layout.group_bytes(&storage[..100], SbtGroup::Hit).is_none());
    }

    /// Smallest SPIR-V 1.4 module with an empty `main` for `execution_model`.
    #[rustfmt::skip]
    fn empty_shader(execution_model: u32) -> Vec<u32> {
        vec![
            0x0723_0203, 0x0001_0400, 0, 5, 0,
            // OpCapability RayTracingKHR
            (2 << 16) | 17, 4479,
            // OpExtension "SPV_KHR_ray_tracing"
            (6 << 16) | 10, 0x5F56_5053, 0x5F52_484B, 0x5F79_6172, 0x6361_7274, 0x0067_6E69,
            // OpMemoryModel Logical GLSL450
            (3 << 16) | 14, 0, 1,
            // OpEntryPoint %1 "main"
            (5 << 16) | 15, execution_model, 1, 0x6E69_616D, 0,
            // %2 = OpTypeVoid, %3 = OpTypeFunction %2
            (2 << 16) | 19, 2,
            (3 << 16) | 33, 3, 2,
            // %1 = OpFunction %2 None %3
            (5 << 16) | 54, 2, 1, 0, 3,
            (2 << 16) | 248, 4,
            (1 << 16) | 253,
            (1 << 16) | 56,
        ]
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn table_buffers_match_driver_handles() {
        use crate::pipeline::RayTracingPipeline;
        use lavacake_gpu::{Requirement, ShaderModule};

        const RAY_GENERATION: u32 = 5313;
        const CLOSEST_HIT: u32 = 5316;
        const MISS: u32 = 5317;

        let device = Device::builder()
            .app_name("lavacake-sbt-tests")
            .ray_tracing(Requirement::Mandatory)
            .build()
            .unwrap();
        let module = |model, stage| {
            ShaderModule::from_words(&device, &empty_shader(model), stage).unwrap()
        };
        let raygen = module(RAY_GENERATION, vk::ShaderStageFlags::RAYGEN_KHR);
        let miss = module(MISS, vk::ShaderStageFlags::MISS_KHR);
        let closest = module(CLOSEST_HIT, vk::ShaderStageFlags::CLOSEST_HIT_KHR);

        let mut pipeline = RayTracingPipeline::new(&device).unwrap();
        pipeline.add_ray_gen(&raygen).unwrap();
        pipeline.add_miss(&miss).unwrap();
        pipeline.add_miss(&miss).unwrap();
        pipeline.start_hit_group().unwrap();
        pipeline.set_closest_hit(&closest).unwrap();
        pipeline.end_hit_group().unwrap();
        pipeline.compile().unwrap();

        let table = pipeline.shader_binding_table().unwrap();
        let layout = *table.layout();
        assert_eq!(layout.counts, [1, 2, 1]);

        let loader =
            ash::khr::ray_tracing_pipeline::Device::new(device.instance(), device.handle());
        let storage = unsafe {
            loader.get_ray_tracing_shader_group_handles(
                pipeline.pipeline().unwrap().handle(),
                0,
                layout.group_count(),
                layout.storage_size(),
            )
        }
        .unwrap();

        for group in SbtGroup::ALL {
            let expected = layout.group_bytes(&storage, group).unwrap();
            let bytes = table.buffer(group).unwrap().read::<u8>().unwrap();
            assert_eq!(&bytes[..expected.len()], expected, "{group:?}");
            assert_ne!(table.region(group).device_address, 0);
        }
    }
}
