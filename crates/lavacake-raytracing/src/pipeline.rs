//! Ray tracing pipeline with ray generation, miss and hit groups.

use crate::sbt::{SbtGroup, ShaderBindingTable};
use ash::vk;
use lavacake_gpu::pipeline::{Pipeline, PipelineLayout};
use lavacake_gpu::{
    CommandBuffer, DescriptorSet, Device, GpuError, PushConstants, Result, ShaderModule,
};
use std::ffi::CString;

/// Default `maxPipelineRayRecursionDepth`.
pub const DEFAULT_MAX_RECURSION: u32 = 1;

#[derive(Debug, Clone)]
struct Stage {
    module: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
    entry_point: CString,
}

/// Shader indices of one group; `vk::SHADER_UNUSED_KHR` marks a free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderGroup {
    pub ty: vk::RayTracingShaderGroupTypeKHR,
    pub general: u32,
    pub closest_hit: u32,
    pub any_hit: u32,
    pub intersection: u32,
}

impl ShaderGroup {
    fn general(index: u32) -> Self {
        Self {
            ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
            general: index,
            closest_hit: vk::SHADER_UNUSED_KHR,
            any_hit: vk::SHADER_UNUSED_KHR,
            intersection: vk::SHADER_UNUSED_KHR,
        }
    }

    fn hit() -> Self {
        Self {
            ty: vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
            general: vk::SHADER_UNUSED_KHR,
            closest_hit: vk::SHADER_UNUSED_KHR,
            any_hit: vk::SHADER_UNUSED_KHR,
            intersection: vk::SHADER_UNUSED_KHR,
        }
    }

    fn to_vk(self) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(self.ty)
            .general_shader(self.general)
            .closest_hit_shader(self.closest_hit)
            .any_hit_shader(self.any_hit)
            .intersection_shader(self.intersection)
    }
}

/// Shader stages and groups of a ray tracing pipeline.
///
/// Stages are kept by handle: the modules passed in must stay alive until
/// [`RayTracingPipeline::compile`] returns.
#[derive(Debug, Clone, Default)]
pub struct ShaderGroups {
    stages: Vec<Stage>,
    raygen: Vec<ShaderGroup>,
    miss: Vec<ShaderGroup>,
    hit: Vec<ShaderGroup>,
    open_hit: Option<ShaderGroup>,
}

impl ShaderGroups {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_stage(&mut self, module: &ShaderModule, stage: vk::ShaderStageFlags) -> u32 {
        self.stages.push(Stage {
            module: module.handle(),
            stage,
            entry_point: module.entry_point().to_owned(),
        });
        (self.stages.len() - 1) as u32
    }

    fn closed(&self, what: &str) -> Result<()> {
        if self.open_hit.is_some() {
            return Err(GpuError::PipelineCreation(format!(
                "Cannot add {what} stage while a hit group is open"
            )));
        }
        Ok(())
    }

    fn open(&mut self) -> Result<&mut ShaderGroup> {
        self.open_hit
            .as_mut()
            .ok_or_else(|| GpuError::PipelineCreation("No open hit group".to_string()))
    }

    pub fn add_ray_gen(&mut self, module: &ShaderModule) -> Result<()> {
        self.closed("raygen")?;
        let index = self.push_stage(module, vk::ShaderStageFlags::RAYGEN_KHR);
        self.raygen.push(ShaderGroup::general(index));
        Ok(())
    }

    pub fn add_miss(&mut self, module: &ShaderModule) -> Result<()> {
        self.closed("miss")?;
        let index = self.push_stage(module, vk::ShaderStageFlags::MISS_KHR);
        self.miss.push(ShaderGroup::general(index));
        Ok(())
    }

    pub fn start_hit_group(&mut self) -> Result<()> {
        if self.open_hit.is_some() {
            return Err(GpuError::PipelineCreation("Hit group already open".to_string()));
        }
        self.open_hit = Some(ShaderGroup::hit());
        Ok(())
    }

    pub fn set_closest_hit(&mut self, module: &ShaderModule) -> Result<()> {
        self.open()?;
        let index = self.push_stage(module, vk::ShaderStageFlags::CLOSEST_HIT_KHR);
        self.open()?.closest_hit = index;
        Ok(())
    }

    pub fn set_any_hit(&mut self, module: &ShaderModule) -> Result<()> {
        self.open()?;
        let index = self.push_stage(module, vk::ShaderStageFlags::ANY_HIT_KHR);
        self.open()?.any_hit = index;
        Ok(())
    }

    /// An intersection shader turns the open group into a procedural hit group.
    pub fn set_intersection(&mut self, module: &ShaderModule) -> Result<()> {
        self.open()?;
        let index = self.push_stage(module, vk::ShaderStageFlags::INTERSECTION_KHR);
        let group = self.open()?;
        group.intersection = index;
        group.ty = vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP;
        Ok(())
    }

    pub fn end_hit_group(&mut self) -> Result<()> {
        let group = self
            .open_hit
            .take()
            .ok_or_else(|| GpuError::PipelineCreation("No hit group open".to_string()))?;
        self.hit.push(group);
        Ok(())
    }

    /// Groups in table order: ray generation, then miss, then hit.
    pub fn ordered(&self) -> Vec<ShaderGroup> {
        self.raygen
            .iter()
            .chain(&self.miss)
            .chain(&self.hit)
            .copied()
            .collect()
    }

    /// Group counts in [`SbtGroup::ALL`] order.
    pub fn counts(&self) -> [u32; 3] {
        [
            self.raygen.len() as u32,
            self.miss.len() as u32,
            self.hit.len() as u32,
        ]
    }

    pub fn is_hit_group_open(&self) -> bool {
        self.open_hit.is_some()
    }
}

/// A ray tracing pipeline and its shader binding table.
pub struct RayTracingPipeline {
    device: Device,
    loader: ash::khr::ray_tracing_pipeline::Device,
    groups: ShaderGroups,
    set_layout: Option<vk::DescriptorSetLayout>,
    push_constant_ranges: Vec<vk::PushConstantRange>,
    max_recursion: u32,
    compiled: Option<(Pipeline, ShaderBindingTable)>,
}

impl std::fmt::Debug for RayTracingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayTracingPipeline")
            .field("groups", &self.groups)
            .field("max_recursion", &self.max_recursion)
            .field("compiled", &self.compiled.is_some())
            .finish_non_exhaustive()
    }
}

impl RayTracingPipeline {
    /// Start an empty pipeline. Fails when ray tracing was not enabled on
    /// the device.
    pub fn new(device: &Device) -> Result<Self> {
        if !device.ray_tracing_available() {
            return Err(device.fail(GpuError::ExtensionNotSupported(
                "Ray tracing is not available on this device".to_string(),
            )));
        }
        let loader =
            ash::khr::ray_tracing_pipeline::Device::new(device.instance(), device.handle());
        Ok(Self {
            device: device.clone(),
            loader,
            groups: ShaderGroups::new(),
            set_layout: None,
            push_constant_ranges: Vec::new(),
            max_recursion: DEFAULT_MAX_RECURSION,
            compiled: None,
        })
    }

    pub fn add_ray_gen(&mut self, module: &ShaderModule) -> Result<()> {
        let errors = self.device.errors();
        self.groups
            .add_ray_gen(module)
            .inspect_err(|e| errors.error(e.to_string()))
    }

    pub fn add_miss(&mut self, module: &ShaderModule) -> Result<()> {
        let errors = self.device.errors();
        self.groups
            .add_miss(module)
            .inspect_err(|e| errors.error(e.to_string()))
    }

    pub fn start_hit_group(&mut self) -> Result<()> {
        let errors = self.device.errors();
        self.groups
            .start_hit_group()
            .inspect_err(|e| errors.error(e.to_string()))
    }

    pub fn set_closest_hit(&mut self, module: &ShaderModule) -> Result<()> {
        let errors = self.device.errors();
        self.groups
            .set_closest_hit(module)
            .inspect_err(|e| errors.error(e.to_string()))
    }

    pub fn set_any_hit(&mut self, module: &ShaderModule) -> Result<()> {
        let errors = self.device.errors();
        self.groups
            .set_any_hit(module)
            .inspect_err(|e| errors.error(e.to_string()))
    }

    pub fn set_intersection(&mut self, module: &ShaderModule) -> Result<()> {
        let errors = self.device.errors();
        self.groups
            .set_intersection(module)
            .inspect_err(|e| errors.error(e.to_string()))
    }

    pub fn end_hit_group(&mut self) -> Result<()> {
        let errors = self.device.errors();
        self.groups
            .end_hit_group()
            .inspect_err(|e| errors.error(e.to_string()))
    }

    pub fn set_descriptor_set(&mut self, set: &DescriptorSet) {
        self.set_layout = Some(set.layout());
    }

    /// Declare the push constant block seen by `stages`.
    pub fn set_push_constants(&mut self, constants: &PushConstants, stages: vk::ShaderStageFlags) {
        self.push_constant_ranges = vec![constants.range(stages)];
    }

    pub fn set_max_recursion(&mut self, depth: u32) {
        self.max_recursion = depth;
    }

    pub fn groups(&self) -> &ShaderGroups {
        &self.groups
    }

    /// Create the layout, the pipeline and the shader binding table.
    pub fn compile(&mut self) -> Result<()> {
        if self.groups.is_hit_group_open() {
            return Err(self.device.fail(GpuError::PipelineCreation(
                "A hit group is still open".to_string(),
            )));
        }
        if self.groups.counts()[0] == 0 {
            return Err(self.device.fail(GpuError::PipelineCreation(
                "A ray tracing pipeline needs a ray generation shader".to_string(),
            )));
        }

        let set_layouts: Vec<_> = self.set_layout.into_iter().collect();
        let layout =
            PipelineLayout::new(&self.device, &set_layouts, &self.push_constant_ranges)?;

        let stages: Vec<_> = self
            .groups
            .stages
            .iter()
            .map(|s| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(s.stage)
                    .module(s.module)
                    .name(&s.entry_point)
            })
            .collect();
        let groups: Vec<_> = self
            .groups
            .ordered()
            .into_iter()
            .map(ShaderGroup::to_vk)
            .collect();

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(self.max_recursion)
            .layout(layout.handle());

        let pipelines = unsafe {
            self.loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            )
        }
        .map_err(|e| {
            self.device.fail(GpuError::PipelineCreation(format!(
                "Could not create ray tracing pipeline: {e:?}"
            )))
        })?;
        let handle = pipelines.first().copied().ok_or_else(|| {
            self.device.fail(GpuError::PipelineCreation(
                "No ray tracing pipeline returned".to_string(),
            ))
        })?;

        let pipeline = Pipeline::from_raw(
            &self.device,
            handle,
            layout,
            vk::PipelineBindPoint::RAY_TRACING_KHR,
        );
        let counts = self.groups.counts();
        let sbt = ShaderBindingTable::new(&self.device, &self.loader, handle, counts)?;

        self.compiled = Some((pipeline, sbt));
        Ok(())
    }

    fn compiled(&self) -> Result<&(Pipeline, ShaderBindingTable)> {
        self.compiled.as_ref().ok_or_else(|| {
            self.device.fail(GpuError::InvalidState(
                "Ray tracing pipeline is not compiled".to_string(),
            ))
        })
    }

    pub fn pipeline(&self) -> Option<&Pipeline> {
        self.compiled.as_ref().map(|(p, _)| p)
    }

    pub fn shader_binding_table(&self) -> Option<&ShaderBindingTable> {
        self.compiled.as_ref().map(|(_, sbt)| sbt)
    }

    pub fn bind(&self, cmd: &CommandBuffer) -> Result<()> {
        self.compiled()?.0.bind(cmd);
        Ok(())
    }

    pub fn bind_descriptor_set(&self, cmd: &CommandBuffer, set: &DescriptorSet) -> Result<()> {
        self.compiled()?.0.bind_descriptor_set(cmd, set);
        Ok(())
    }

    pub fn push_constants(&self, cmd: &CommandBuffer, constants: &PushConstants) -> Result<()> {
        self.compiled()?.0.push_constants(cmd, constants)
    }

    /// Bind the pipeline and record a `width` x `height` x `depth` dispatch.
    pub fn trace_rays(
        &self,
        cmd: &CommandBuffer,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<()> {
        let (pipeline, sbt) = self.compiled()?;
        pipeline.bind(cmd);
        let callable = vk::StridedDeviceAddressRegionKHR::default();
        unsafe {
            self.loader.cmd_trace_rays(
                cmd.handle(),
                sbt.region(SbtGroup::RayGen),
                sbt.region(SbtGroup::Miss),
                sbt.region(SbtGroup::Hit),
                &callable,
                width,
                height,
                depth,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_count(groups: &ShaderGroups) -> usize {
        groups.stages.len()
    }

    #[test]
    fn groups_are_ordered_by_kind() {
        let mut groups = ShaderGroups::new();
        groups.hit.push(ShaderGroup::hit());
        groups.miss.push(ShaderGroup::general(1));
        groups.raygen.push(ShaderGroup::general(0));

        let ordered = groups.ordered();
        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered[0].general, 0);
        assert_eq!(ordered[1].general, 1);
        assert_eq!(ordered[2].ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(groups.counts(), [1, 1, 1]);
        assert_eq!(stage_count(&groups), 0);
    }

    #[test]
    fn hit_group_state_is_checked() {
        let mut groups = ShaderGroups::new();
        assert!(matches!(
            groups.end_hit_group(),
            Err(GpuError::PipelineCreation(_))
        ));
        groups.start_hit_group().unwrap();
        assert!(matches!(
            groups.start_hit_group(),
            Err(GpuError::PipelineCreation(_))
        ));
        assert!(groups.is_hit_group_open());
        groups.end_hit_group().unwrap();
        assert_eq!(groups.counts(), [0, 0, 1]);
    }

    #[test]
    fn unused_slots_are_marked() {
        let group = ShaderGroup::general(4).to_vk();
        assert_eq!(group.general_shader, 4);
        assert_eq!(group.closest_hit_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(group.any_hit_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(group.intersection_shader, vk::SHADER_UNUSED_KHR);
    }
}
