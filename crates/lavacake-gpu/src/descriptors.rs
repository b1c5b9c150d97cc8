//! Descriptor set generation.
//!
//! Resources are registered on a [`DescriptorSetBuilder`] together with
//! their binding and shader stages. [`DescriptorLayoutPlan`] turns the
//! registrations into layout bindings and pool sizes, and
//! [`DescriptorSet`] realizes the plan and writes every descriptor.

use crate::buffer::Buffer;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::image::{Image, Sampler};
use ash::vk;

/// A resource bound to one descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    UniformBuffer(vk::Buffer),
    StorageBuffer(vk::Buffer),
    /// Combined image sampler.
    Texture {
        sampler: vk::Sampler,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    InputAttachment {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    StorageImage(vk::ImageView),
    StorageTexelBuffer(vk::BufferView),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

impl DescriptorResource {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer(_) => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer(_) => vk::DescriptorType::STORAGE_BUFFER,
            Self::Texture { .. } => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::InputAttachment { .. } => vk::DescriptorType::INPUT_ATTACHMENT,
            Self::StorageImage(_) => vk::DescriptorType::STORAGE_IMAGE,
            Self::StorageTexelBuffer(_) => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
            Self::AccelerationStructure(_) => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        }
    }
}

/// Descriptor types in the order their bindings and pool sizes are emitted.
pub const CATEGORY_ORDER: [vk::DescriptorType; 7] = [
    vk::DescriptorType::UNIFORM_BUFFER,
    vk::DescriptorType::STORAGE_BUFFER,
    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    vk::DescriptorType::INPUT_ATTACHMENT,
    vk::DescriptorType::STORAGE_IMAGE,
    vk::DescriptorType::STORAGE_TEXEL_BUFFER,
    vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
];

/// One registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorEntry {
    pub binding: u32,
    pub stages: vk::ShaderStageFlags,
    pub resource: DescriptorResource,
}

/// Collects the resources of a single descriptor set.
///
/// Only raw handles are stored; the resources must outlive any
/// [`DescriptorSet`] built from this builder.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetBuilder {
    entries: Vec<DescriptorEntry>,
}

impl DescriptorSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw resource.
    pub fn resource(
        mut self,
        resource: DescriptorResource,
        binding: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.entries.push(DescriptorEntry {
            binding,
            stages,
            resource,
        });
        self
    }

    pub fn uniform_buffer(
        self,
        buffer: &Buffer,
        binding: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.resource(DescriptorResource::UniformBuffer(buffer.handle()), binding, stages)
    }

    pub fn storage_buffer(
        self,
        buffer: &Buffer,
        binding: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.resource(DescriptorResource::StorageBuffer(buffer.handle()), binding, stages)
    }

    /// Sampled image, read in its current layout.
    pub fn texture(
        self,
        image: &Image,
        sampler: &Sampler,
        binding: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.resource(
            DescriptorResource::Texture {
                sampler: sampler.handle(),
                view: image.view(),
                layout: image.layout(),
            },
            binding,
            stages,
        )
    }

    /// Attachment read by a later subpass.
    pub fn input_attachment(
        self,
        image: &Image,
        binding: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.resource(
            DescriptorResource::InputAttachment {
                view: image.view(),
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
            binding,
            stages,
        )
    }

    pub fn storage_image(self, image: &Image, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.resource(DescriptorResource::StorageImage(image.view()), binding, stages)
    }

    /// Storage texel buffer. The buffer must have been created with a texel view.
    pub fn storage_texel_buffer(
        self,
        buffer: &Buffer,
        binding: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.resource(DescriptorResource::StorageTexelBuffer(buffer.view()), binding, stages)
    }

    pub fn acceleration_structure(
        self,
        handle: vk::AccelerationStructureKHR,
        binding: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.resource(DescriptorResource::AccelerationStructure(handle), binding, stages)
    }

    pub fn entries(&self) -> &[DescriptorEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn plan(&self) -> DescriptorLayoutPlan {
        DescriptorLayoutPlan::new(&self.entries)
    }

    pub fn build(&self, device: &Device) -> Result<DescriptorSet> {
        DescriptorSet::new(device, self)
    }
}

/// Layout binding without the immutable sampler pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
}

impl LayoutBinding {
    pub fn to_vk(self) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(self.binding)
            .descriptor_type(self.descriptor_type)
            .descriptor_count(1)
            .stage_flags(self.stages)
    }
}

/// Layout bindings and pool sizes derived from a list of entries.
#[derive(Debug, Clone)]
pub struct DescriptorLayoutPlan {
    /// Bindings grouped by [`CATEGORY_ORDER`], registration order within a group.
    pub bindings: Vec<LayoutBinding>,
    /// One size per descriptor type that has at least one entry.
    pub pool_sizes: Vec<vk::DescriptorPoolSize>,
    /// Indices into the entry list, in binding order.
    pub order: Vec<usize>,
}

impl DescriptorLayoutPlan {
    pub fn new(entries: &[DescriptorEntry]) -> Self {
        let mut bindings = Vec::with_capacity(entries.len());
        let mut pool_sizes = Vec::new();
        let mut order = Vec::with_capacity(entries.len());

        for ty in CATEGORY_ORDER {
            let mut count = 0;
            for (index, entry) in entries.iter().enumerate() {
                if entry.resource.descriptor_type() != ty {
                    continue;
                }
                bindings.push(LayoutBinding {
                    binding: entry.binding,
                    descriptor_type: ty,
                    stages: entry.stages,
                });
                order.push(index);
                count += 1;
            }
            if count > 0 {
                pool_sizes.push(vk::DescriptorPoolSize {
                    ty,
                    descriptor_count: count,
                });
            }
        }

        Self {
            bindings,
            pool_sizes,
            order,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Total number of descriptors, used as the pool's set limit.
    pub fn descriptor_count(&self) -> u32 {
        self.pool_sizes.iter().map(|s| s.descriptor_count).sum()
    }
}

/// A realized descriptor set with its own layout and pool.
///
/// An empty builder yields a valid empty layout, no pool and a null set.
#[derive(Debug)]
pub struct DescriptorSet {
    device: Device,
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
}

impl DescriptorSet {
    pub fn new(device: &Device, builder: &DescriptorSetBuilder) -> Result<Self> {
        let plan = builder.plan();

        let vk_bindings: Vec<_> = plan.bindings.iter().map(|b| b.to_vk()).collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let layout = device.check(
            unsafe { device.handle().create_descriptor_set_layout(&layout_info, None) },
            || "Can't create descriptor set layout",
        )?;

        let mut set = Self {
            device: device.clone(),
            layout,
            pool: vk::DescriptorPool::null(),
            set: vk::DescriptorSet::null(),
        };

        if plan.is_empty() {
            return Ok(set);
        }

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(plan.descriptor_count())
            .pool_sizes(&plan.pool_sizes);
        set.pool = device.check(
            unsafe { device.handle().create_descriptor_pool(&pool_info, None) },
            || "Can't create descriptor pool",
        )?;

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(set.pool)
            .set_layouts(&layouts);
        let sets = device.check(
            unsafe { device.handle().allocate_descriptor_sets(&alloc_info) },
            || "Can't allocate descriptor set",
        )?;
        set.set = sets
            .first()
            .copied()
            .ok_or_else(|| {
                device.fail(GpuError::Descriptor("No descriptor set allocated".into()))
            })?;

        set.write(builder.entries(), &plan.order);
        Ok(set)
    }

    /// Rewrite every descriptor from the same set of registrations.
    ///
    /// The builder must describe the same bindings and types the set was
    /// created with.
    pub fn update(&self, builder: &DescriptorSetBuilder) -> Result<()> {
        let plan = builder.plan();
        if plan.is_empty() != self.is_empty() {
            return Err(self.device.fail(GpuError::Descriptor(
                "Descriptor layout does not match the set".into(),
            )));
        }
        self.write(builder.entries(), &plan.order);
        Ok(())
    }

    fn write(&self, entries: &[DescriptorEntry], order: &[usize]) {
        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        let mut texel_views = Vec::new();
        let mut accel_handles = Vec::new();

        for &index in order {
            match entries[index].resource {
                DescriptorResource::UniformBuffer(buffer)
                | DescriptorResource::StorageBuffer(buffer) => {
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer,
                        offset: 0,
                        range: vk::WHOLE_SIZE,
                    });
                }
                DescriptorResource::Texture {
                    sampler,
                    view,
                    layout,
                } => image_infos.push(vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                }),
                DescriptorResource::InputAttachment { view, layout } => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: view,
                        image_layout: layout,
                    });
                }
                DescriptorResource::StorageImage(view) => image_infos.push(vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view,
                    image_layout: vk::ImageLayout::GENERAL,
                }),
                DescriptorResource::StorageTexelBuffer(view) => texel_views.push(view),
                DescriptorResource::AccelerationStructure(handle) => accel_handles.push(handle),
            }
        }

        let mut accel_infos: Vec<_> = accel_handles
            .chunks(1)
            .map(|h| {
                vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(h)
            })
            .collect();
        let mut accel_infos = accel_infos.iter_mut();

        let (mut b, mut i, mut t) = (0, 0, 0);
        let mut writes = Vec::with_capacity(order.len());
        for &index in order {
            let entry = &entries[index];
            let write = vk::WriteDescriptorSet::default()
                .dst_set(self.set)
                .dst_binding(entry.binding)
                .dst_array_element(0)
                .descriptor_type(entry.resource.descriptor_type());

            let write = match entry.resource {
                DescriptorResource::UniformBuffer(_) | DescriptorResource::StorageBuffer(_) => {
                    b += 1;
                    write.buffer_info(&buffer_infos[b - 1..b])
                }
                DescriptorResource::Texture { .. }
                | DescriptorResource::InputAttachment { .. }
                | DescriptorResource::StorageImage(_) => {
                    i += 1;
                    write.image_info(&image_infos[i - 1..i])
                }
                DescriptorResource::StorageTexelBuffer(_) => {
                    t += 1;
                    write.texel_buffer_view(&texel_views[t - 1..t])
                }
                DescriptorResource::AccelerationStructure(_) => match accel_infos.next() {
                    Some(next) => write.descriptor_count(1).push_next(next),
                    None => continue,
                },
            };
            writes.push(write);
        }

        unsafe { self.device.handle().update_descriptor_sets(&writes, &[]) };
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// The set handle, null when the set has no descriptors.
    pub fn handle(&self) -> vk::DescriptorSet {
        self.set
    }

    pub fn is_empty(&self) -> bool {
        self.pool == vk::DescriptorPool::null()
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        unsafe {
            if self.pool != vk::DescriptorPool::null() {
                self.device.handle().destroy_descriptor_pool(self.pool, None);
            }
            self.device
                .handle()
                .destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn buffer(raw: u64) -> vk::Buffer {
        vk::Buffer::from_raw(raw)
    }

    fn texture(raw: u64) -> DescriptorResource {
        DescriptorResource::Texture {
            sampler: vk::Sampler::from_raw(raw),
            view: vk::ImageView::from_raw(raw),
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    #[test]
    fn bindings_follow_category_order() {
        let builder = DescriptorSetBuilder::new()
            .resource(
                DescriptorResource::StorageImage(vk::ImageView::from_raw(1)),
                3,
                vk::ShaderStageFlags::COMPUTE,
            )
            .resource(texture(2), 1, vk::ShaderStageFlags::FRAGMENT)
            .resource(
                DescriptorResource::UniformBuffer(buffer(3)),
                0,
                vk::ShaderStageFlags::VERTEX,
            )
            .resource(texture(4), 2, vk::ShaderStageFlags::FRAGMENT);

        let plan = builder.plan();
        let types: Vec<_> = plan.bindings.iter().map(|b| b.descriptor_type).collect();
        assert_eq!(
            types,
            vec![
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::DescriptorType::STORAGE_IMAGE,
            ]
        );
        let slots: Vec<_> = plan.bindings.iter().map(|b| b.binding).collect();
        assert_eq!(slots, vec![0, 1, 2, 3]);
        assert_eq!(plan.order, vec![2, 1, 3, 0]);
    }

    #[test]
    fn one_pool_size_per_used_type() {
        let builder = DescriptorSetBuilder::new()
            .resource(texture(1), 0, vk::ShaderStageFlags::FRAGMENT)
            .resource(texture(2), 1, vk::ShaderStageFlags::FRAGMENT)
            .resource(
                DescriptorResource::StorageTexelBuffer(vk::BufferView::from_raw(3)),
                2,
                vk::ShaderStageFlags::COMPUTE,
            );

        let plan = builder.plan();
        assert_eq!(plan.pool_sizes.len(), 2);
        assert_eq!(plan.pool_sizes[0].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(plan.pool_sizes[0].descriptor_count, 2);
        assert_eq!(plan.pool_sizes[1].ty, vk::DescriptorType::STORAGE_TEXEL_BUFFER);
        assert_eq!(plan.pool_sizes[1].descriptor_count, 1);
        assert_eq!(plan.descriptor_count(), 3);
    }

    #[test]
    fn empty_builder_plans_nothing() {
        let plan = DescriptorSetBuilder::new().plan();
        assert!(plan.is_empty());
        assert!(plan.pool_sizes.is_empty());
        assert_eq!(plan.descriptor_count(), 0);
    }

    #[test]
    fn acceleration_structures_come_last() {
        let builder = DescriptorSetBuilder::new()
            .acceleration_structure(
                vk::AccelerationStructureKHR::from_raw(9),
                0,
                vk::ShaderStageFlags::RAYGEN_KHR,
            )
            .resource(
                DescriptorResource::StorageBuffer(buffer(1)),
                1,
                vk::ShaderStageFlags::RAYGEN_KHR,
            );

        let plan = builder.plan();
        assert_eq!(plan.bindings[0].descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(
            plan.bindings[1].descriptor_type,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
        );
    }
}
