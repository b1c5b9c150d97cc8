//! SPIR-V shader modules.

use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::CString;
use std::io::Cursor;
use std::path::Path;

/// A shader module bound to a pipeline stage and entry point.
#[derive(Debug)]
pub struct ShaderModule {
    device: Device,
    handle: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
    entry_point: CString,
}

impl ShaderModule {
    /// Load a SPIR-V binary from disk.
    pub fn from_file(
        device: &Device,
        path: impl AsRef<Path>,
        stage: vk::ShaderStageFlags,
    ) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            device.fail(GpuError::ShaderModule(format!(
                "Could not open shader file {}: {e}",
                path.display()
            )))
        })?;
        Self::from_bytes(device, &bytes, stage)
    }

    /// Create a module from SPIR-V bytes with the `main` entry point.
    pub fn from_bytes(device: &Device, bytes: &[u8], stage: vk::ShaderStageFlags) -> Result<Self> {
        let code = ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|e| {
            device.fail(GpuError::ShaderModule(format!("Invalid SPIR-V code: {e}")))
        })?;
        Self::from_words(device, &code, stage)
    }

    /// Create a module from SPIR-V words.
    pub fn from_words(device: &Device, code: &[u32], stage: vk::ShaderStageFlags) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        let handle = device.check(
            unsafe { device.handle().create_shader_module(&create_info, None) },
            || "Could not create a shader module.",
        )?;

        Ok(Self {
            device: device.clone(),
            handle,
            stage,
            entry_point: c"main".to_owned(),
        })
    }

    /// Use a different entry point than `main`.
    pub fn with_entry_point(mut self, name: &str) -> Result<Self> {
        self.entry_point = CString::new(name).map_err(|_| {
            self.device.fail(GpuError::ShaderModule(format!(
                "Entry point name {name:?} contains a nul byte"
            )))
        })?;
        Ok(self)
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    pub fn entry_point(&self) -> &std::ffi::CStr {
        &self.entry_point
    }

    /// Stage description for pipeline creation. Borrows the entry point.
    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage)
            .module(self.handle)
            .name(&self.entry_point)
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.handle().destroy_shader_module(self.handle, None) };
    }
}
