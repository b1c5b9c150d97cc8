//! Acceleration structures for hardware ray tracing.
//!
//! Bottom-level structures (BLAS) hold triangle or AABB geometry. A
//! top-level structure (TLAS) holds instances of bottom-level structures,
//! each with its own transform, instance ID and hit group offset. Both are
//! built on the device through a one-time command buffer.

use ash::vk;
use lavacake_gpu::buffer::{Buffer, BufferInfo};
use lavacake_gpu::{one_time_submit, Device, GpuError, MemoryKind, Queue, Result};
use std::marker::PhantomData;
use std::sync::Arc;

/// Row-major 3x4 identity transform.
pub const IDENTITY_TRANSFORM: [f32; 12] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0,
];

/// Largest value that fits the 24-bit instance ID and hit group offset.
pub const MAX_PACKED_24: u32 = 0x00FF_FFFF;

/// AABB positions for procedural geometry (24 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct AabbPositions {
    pub min_x: f32,
    pub min_y: f32,
    pub min_z: f32,
    pub max_x: f32,
    pub max_y: f32,
    pub max_z: f32,
}

impl AabbPositions {
    pub fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self {
            min_x: min[0],
            min_y: min[1],
            min_z: min[2],
            max_x: max[0],
            max_y: max[1],
            max_z: max[2],
        }
    }
}

/// One TLAS instance in the layout of `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceRecord {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [f32; 12],
    /// Instance ID in the low 24 bits, visibility mask in the high 8.
    pub custom_index_and_mask: u32,
    /// Hit group offset in the low 24 bits, instance flags in the high 8.
    pub sbt_offset_and_flags: u32,
    /// Device address of the referenced BLAS.
    pub blas_address: u64,
}

impl InstanceRecord {
    /// Pack an instance visible to every ray mask, with face culling off.
    pub fn new(
        transform: [f32; 12],
        blas_address: vk::DeviceAddress,
        instance_id: u32,
        hit_group_offset: u32,
    ) -> Self {
        let flags = vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8;
        Self {
            transform,
            custom_index_and_mask: pack_24_8(instance_id, 0xFF),
            sbt_offset_and_flags: pack_24_8(hit_group_offset, flags),
            blas_address,
        }
    }

    pub fn instance_id(&self) -> u32 {
        self.custom_index_and_mask & MAX_PACKED_24
    }

    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    pub fn hit_group_offset(&self) -> u32 {
        self.sbt_offset_and_flags & MAX_PACKED_24
    }

    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(self.sbt_offset_and_flags >> 24)
    }
}

/// Same bit layout as `vk::Packed24_8`.
fn pack_24_8(low_24: u32, high_8: u8) -> u32 {
    (low_24 & MAX_PACKED_24) | (u32::from(high_8) << 24)
}

/// Number of triangles described by a vertex list or an index list.
pub fn triangle_count(vertex_count: u32, index_count: Option<u32>) -> u32 {
    index_count.unwrap_or(vertex_count) / 3
}

/// Scratch allocation large enough to hold `scratch_size` bytes at an
/// address aligned to `alignment`.
pub fn scratch_allocation_size(scratch_size: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return scratch_size;
    }
    scratch_size + alignment - 1
}

/// Round a device address up to the power-of-two `alignment`.
pub fn align_address(address: vk::DeviceAddress, alignment: u64) -> vk::DeviceAddress {
    if alignment <= 1 {
        return address;
    }
    (address + alignment - 1) & !(alignment - 1)
}

/// Query the acceleration structure properties of the device.
pub fn acceleration_structure_properties(
    device: &Device,
) -> vk::PhysicalDeviceAccelerationStructurePropertiesKHR<'static> {
    let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    {
        let mut properties2 =
            vk::PhysicalDeviceProperties2::default().push_next(&mut as_properties);
        unsafe {
            device
                .instance()
                .get_physical_device_properties2(device.physical_device(), &mut properties2);
        }
    }
    as_properties.p_next = std::ptr::null_mut();
    as_properties
}

/// Triangle geometry read from device-addressable buffers.
#[derive(Clone, Copy)]
pub struct TriangleGeometry<'a> {
    pub vertices: &'a Buffer,
    pub vertex_format: vk::Format,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    /// `u32` index buffer and its index count.
    pub indices: Option<(&'a Buffer, u32)>,
    /// Buffer holding one row-major 3x4 transform.
    pub transform: Option<&'a Buffer>,
}

impl<'a> TriangleGeometry<'a> {
    /// Non-indexed `R32G32B32_SFLOAT` positions.
    pub fn new(vertices: &'a Buffer, vertex_count: u32, vertex_stride: u64) -> Self {
        Self {
            vertices,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            vertex_stride,
            vertex_count,
            indices: None,
            transform: None,
        }
    }

    pub fn indexed(mut self, indices: &'a Buffer, index_count: u32) -> Self {
        self.indices = Some((indices, index_count));
        self
    }

    pub fn transform(mut self, transform: &'a Buffer) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn primitive_count(&self) -> u32 {
        triangle_count(self.vertex_count, self.indices.map(|(_, count)| count))
    }

    fn to_vk(self) -> Result<vk::AccelerationStructureGeometryKHR<'static>> {
        let mut triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(self.vertex_format)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.vertices.device_address()?,
            })
            .vertex_stride(self.vertex_stride)
            .max_vertex(self.vertex_count.saturating_sub(1));

        triangles = match self.indices {
            Some((buffer, _)) => triangles
                .index_type(vk::IndexType::UINT32)
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: buffer.device_address()?,
                }),
            None => triangles.index_type(vk::IndexType::NONE_KHR),
        };
        if let Some(buffer) = self.transform {
            triangles = triangles.transform_data(vk::DeviceOrHostAddressConstKHR {
                device_address: buffer.device_address()?,
            });
        }

        Ok(vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles }))
    }
}

/// Usage for buffers read by acceleration structure builds.
pub fn build_input_info() -> BufferInfo {
    BufferInfo::new(
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
    )
    .memory(MemoryKind::HostVisible)
}

/// Host-visible buffer holding `aabbs`, ready to be added to a BLAS.
pub fn aabb_buffer(device: &Device, aabbs: &[AabbPositions]) -> Result<Buffer> {
    let bytes: &[u8] = bytemuck::cast_slice(aabbs);
    let buffer = Buffer::new(device, bytes.len() as u64, &build_input_info())?;
    buffer.write_bytes(0, bytes)?;
    Ok(buffer)
}

/// A built acceleration structure and the buffer backing it.
pub struct AccelerationStructure {
    loader: ash::khr::acceleration_structure::Device,
    handle: vk::AccelerationStructureKHR,
    level: vk::AccelerationStructureTypeKHR,
    device_address: vk::DeviceAddress,
    // Bottom-level structures referenced by a TLAS.
    children: Vec<Arc<AccelerationStructure>>,
    _buffer: Buffer,
}

impl AccelerationStructure {
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    pub fn level(&self) -> vk::AccelerationStructureTypeKHR {
        self.level
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    /// Bottom-level structures kept alive by this TLAS.
    pub fn instances(&self) -> &[Arc<AccelerationStructure>] {
        &self.children
    }

    fn build(
        device: &Device,
        queue: &Queue,
        level: vk::AccelerationStructureTypeKHR,
        geometries: &[vk::AccelerationStructureGeometryKHR<'_>],
        primitive_counts: &[u32],
    ) -> Result<Self> {
        if !device.ray_tracing_available() {
            return Err(device.fail(GpuError::ExtensionNotSupported(
                ash::khr::acceleration_structure::NAME
                    .to_string_lossy()
                    .into_owned(),
            )));
        }
        if geometries.is_empty() {
            return Err(device.fail(GpuError::InvalidState(
                "Acceleration structure has no geometry".to_string(),
            )));
        }

        let loader =
            ash::khr::acceleration_structure::Device::new(device.instance(), device.handle());

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(level)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(geometries);

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                primitive_counts,
                &mut sizes,
            );
        }

        let buffer = Buffer::new(
            device,
            sizes.acceleration_structure_size,
            &BufferInfo::new(
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            ),
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.handle())
            .size(sizes.acceleration_structure_size)
            .ty(level);
        let handle = device.check(
            unsafe { loader.create_acceleration_structure(&create_info, None) },
            || "Failed to create acceleration structure",
        )?;

        let mut structure = Self {
            loader,
            handle,
            level,
            device_address: 0,
            children: Vec::new(),
            _buffer: buffer,
        };

        let alignment = u64::from(
            acceleration_structure_properties(device)
                .min_acceleration_structure_scratch_offset_alignment,
        );
        let scratch = Buffer::new(
            device,
            scratch_allocation_size(sizes.build_scratch_size, alignment),
            &BufferInfo::new(
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            ),
        )?;
        let scratch_address = align_address(scratch.device_address()?, alignment);

        build_info = build_info
            .dst_acceleration_structure(handle)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });
        let ranges: Vec<_> = primitive_counts
            .iter()
            .map(|&count| {
                vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(count)
            })
            .collect();

        one_time_submit(device, queue, |cmd| unsafe {
            structure
                .loader
                .cmd_build_acceleration_structures(cmd, &[build_info], &[ranges.as_slice()]);
        })?;

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        structure.device_address = unsafe {
            structure
                .loader
                .get_acceleration_structure_device_address(&address_info)
        };

        tracing::debug!(
            "Built {:?} acceleration structure: {} bytes, scratch {} bytes, primitives {:?}",
            level,
            sizes.acceleration_structure_size,
            sizes.build_scratch_size,
            primitive_counts
        );
        Ok(structure)
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_acceleration_structure(self.handle, None);
        }
    }
}

/// Collects geometry for one bottom-level structure.
pub struct BlasBuilder<'a> {
    device: Device,
    geometries: Vec<vk::AccelerationStructureGeometryKHR<'static>>,
    primitive_counts: Vec<u32>,
    // Input buffers must outlive the build.
    inputs: PhantomData<&'a Buffer>,
}

impl<'a> BlasBuilder<'a> {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            geometries: Vec::new(),
            primitive_counts: Vec::new(),
            inputs: PhantomData,
        }
    }

    pub fn geometry_count(&self) -> usize {
        self.geometries.len()
    }

    /// Add a triangle mesh.
    pub fn add_triangles(&mut self, geometry: TriangleGeometry<'a>) -> Result<()> {
        let count = geometry.primitive_count();
        if count == 0 {
            return Err(self.device.fail(GpuError::InvalidState(
                "Triangle geometry has no complete triangle".to_string(),
            )));
        }
        self.geometries.push(geometry.to_vk()?);
        self.primitive_counts.push(count);
        Ok(())
    }

    /// Add `count` procedural boxes stored as [`AabbPositions`] in `aabbs`.
    pub fn add_aabbs(&mut self, aabbs: &'a Buffer, count: u32) -> Result<()> {
        if count == 0 {
            return Err(self.device.fail(GpuError::InvalidState(
                "AABB geometry is empty".to_string(),
            )));
        }
        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::AABBS)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::default()
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: aabbs.device_address()?,
                    })
                    .stride(std::mem::size_of::<AabbPositions>() as u64),
            });
        self.geometries.push(geometry);
        self.primitive_counts.push(count);
        Ok(())
    }

    /// Build the structure on `queue` and wait for completion.
    pub fn build(self, queue: &Queue) -> Result<Arc<AccelerationStructure>> {
        let structure = AccelerationStructure::build(
            &self.device,
            queue,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            &self.geometries,
            &self.primitive_counts,
        )?;
        Ok(Arc::new(structure))
    }
}

/// Collects instances for one top-level structure.
pub struct TlasBuilder {
    device: Device,
    records: Vec<InstanceRecord>,
    children: Vec<Arc<AccelerationStructure>>,
}

impl TlasBuilder {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            records: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn instance_count(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[InstanceRecord] {
        &self.records
    }

    /// Add an instance of `blas` placed by the row-major 3x4 `transform`.
    ///
    /// `instance_id` is returned by `gl_InstanceCustomIndexEXT`;
    /// `hit_group_offset` selects the hit group record in the table.
    pub fn add_instance(
        &mut self,
        blas: &Arc<AccelerationStructure>,
        transform: [f32; 12],
        instance_id: u32,
        hit_group_offset: u32,
    ) -> Result<()> {
        if blas.level() != vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL {
            return Err(self.device.fail(GpuError::InvalidState(
                "Instances must reference a bottom-level structure".to_string(),
            )));
        }
        if instance_id > MAX_PACKED_24 || hit_group_offset > MAX_PACKED_24 {
            return Err(self.device.fail(GpuError::InvalidState(format!(
                "Instance ID {instance_id} or hit group offset {hit_group_offset} \
                 does not fit in 24 bits"
            ))));
        }
        self.records.push(InstanceRecord::new(
            transform,
            blas.device_address(),
            instance_id,
            hit_group_offset,
        ));
        if !self.children.iter().any(|child| Arc::ptr_eq(child, blas)) {
            self.children.push(Arc::clone(blas));
        }
        Ok(())
    }

    /// Upload the instances and build the structure on `queue`.
    pub fn build(self, queue: &Queue) -> Result<AccelerationStructure> {
        if self.records.is_empty() {
            return Err(self.device.fail(GpuError::InvalidState(
                "Top-level structure has no instance".to_string(),
            )));
        }
        let bytes: &[u8] = bytemuck::cast_slice(&self.records);
        let instances = Buffer::new(&self.device, bytes.len() as u64, &build_input_info())?;
        instances.write_bytes(0, bytes)?;

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: instances.device_address()?,
                    }),
            });

        let mut structure = AccelerationStructure::build(
            &self.device,
            queue,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            std::slice::from_ref(&geometry),
            &[self.records.len() as u32],
        )?;
        structure.children = self.children;
        Ok(structure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aabb_size() {
        assert_eq!(std::mem::size_of::<AabbPositions>(), 24);
        let aabb = AabbPositions::new([0.0, 1.0, 2.0], [3.0, 4.0, 5.0]);
        assert_eq!(aabb.min_y, 1.0);
        assert_eq!(aabb.max_z, 5.0);
    }

    #[test]
    fn instance_record_matches_vulkan_layout() {
        assert_eq!(
            std::mem::size_of::<InstanceRecord>(),
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()
        );
        assert_eq!(std::mem::offset_of!(InstanceRecord, custom_index_and_mask), 48);
        assert_eq!(std::mem::offset_of!(InstanceRecord, blas_address), 56);
    }

    #[test]
    fn instance_packing() {
        let record = InstanceRecord::new(IDENTITY_TRANSFORM, 0xDEAD_0000, 42, 3);

        assert_eq!(record.instance_id(), 42);
        assert_eq!(record.mask(), 0xFF);
        assert_eq!(record.hit_group_offset(), 3);
        assert_eq!(
            record.flags(),
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE
        );
        assert_eq!(record.blas_address, 0xDEAD_0000);
        assert_eq!(record.transform[5], 1.0);
        assert_eq!(record.transform[3], 0.0);
    }

    #[test]
    fn packing_agrees_with_ash() {
        let ours = pack_24_8(0x12_3456, 0x9A);
        let theirs = vk::Packed24_8::new(0x12_3456, 0x9A);
        assert_eq!(ours & MAX_PACKED_24, theirs.low_24());
        assert_eq!((ours >> 24) as u8, theirs.high_8());
    }

    #[test]
    fn wide_ids_are_truncated_by_packing() {
        let record = InstanceRecord::new(IDENTITY_TRANSFORM, 0, MAX_PACKED_24 + 2, 0);
        assert_eq!(record.instance_id(), 1);
        assert_eq!(record.mask(), 0xFF);
    }

    #[test]
    fn triangle_counts() {
        assert_eq!(triangle_count(9, None), 3);
        assert_eq!(triangle_count(4, Some(6)), 2);
        assert_eq!(triangle_count(3, Some(0)), 0);
        assert_eq!(triangle_count(2, None), 0);
        // Trailing indices that do not form a triangle are ignored.
        assert_eq!(triangle_count(8, Some(7)), 2);
    }

    #[test]
    fn scratch_size_covers_alignment() {
        assert_eq!(scratch_allocation_size(1000, 0), 1000);
        assert_eq!(scratch_allocation_size(1000, 1), 1000);
        assert_eq!(scratch_allocation_size(1000, 128), 1127);

        // Worst-case base address still leaves room for the whole scratch.
        let base = 129;
        let aligned = align_address(base, 128);
        assert_eq!(aligned, 256);
        assert!(aligned + 1000 <= base + scratch_allocation_size(1000, 128));
        assert_eq!(align_address(256, 128), 256);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn builds_aabb_blas_and_tlas() {
        use lavacake_gpu::Requirement;

        let device = Device::builder()
            .app_name("lavacake-acceleration-tests")
            .ray_tracing(Requirement::Mandatory)
            .build()
            .unwrap();
        let queue = device.graphics_queue(0).unwrap();

        let aabbs = aabb_buffer(
            &device,
            &[AabbPositions::new([0.0; 3], [1.0; 3]), AabbPositions::new([2.0; 3], [3.0; 3])],
        )
        .unwrap();
        let mut blas = BlasBuilder::new(&device);
        blas.add_aabbs(&aabbs, 2).unwrap();
        let blas = blas.build(&queue).unwrap();
        assert_ne!(blas.device_address(), 0);

        let mut tlas = TlasBuilder::new(&device);
        tlas.add_instance(&blas, IDENTITY_TRANSFORM, 0, 0).unwrap();
        tlas.add_instance(&blas, IDENTITY_TRANSFORM, 7, 1).unwrap();
        assert!(tlas.add_instance(&blas, IDENTITY_TRANSFORM, 1 << 24, 0).is_err());
        assert_eq!(tlas.records()[1].instance_id(), 7);

        let tlas = tlas.build(&queue).unwrap();
        assert_eq!(tlas.level(), vk::AccelerationStructureTypeKHR::TOP_LEVEL);
        assert_eq!(tlas.instances().len(), 1);
        assert!(Arc::ptr_eq(&tlas.instances()[0], &blas));
    }
}
