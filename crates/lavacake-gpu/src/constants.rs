//! Named push constant blocks.

use crate::device::Device;
use crate::diagnostics::ErrorState;
use crate::error::{GpuError, Result};
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

/// Push constant fields are laid out on 4-byte boundaries.
const FIELD_ALIGNMENT: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    name: String,
    offset: usize,
    size: usize,
}

/// An ordered set of named values uploaded as one push constant block.
///
/// Fields are packed in insertion order, each starting on a 4-byte
/// boundary. Values are plain data (`bytemuck::Pod`) and can be replaced in
/// place as long as their size does not change.
#[derive(Debug, Clone)]
pub struct PushConstants {
    errors: Arc<ErrorState>,
    fields: Vec<Field>,
    data: Vec<u8>,
}

impl PushConstants {
    /// Empty block reporting to `device`'s error state.
    pub fn new(device: &Device) -> Self {
        Self::with_errors(device.shared_errors())
    }

    pub fn with_errors(errors: Arc<ErrorState>) -> Self {
        Self {
            errors,
            fields: Vec::new(),
            data: Vec::new(),
        }
    }

    fn fail(&self, message: String) -> GpuError {
        self.errors.error(message.clone());
        GpuError::InvalidState(message)
    }

    fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Append `value` as a new field.
    pub fn add<T: Pod>(&mut self, name: impl Into<String>, value: &T) -> Result<()> {
        self.add_bytes(name.into(), bytemuck::bytes_of(value))
    }

    /// Append `values` as one array field.
    pub fn add_array<T: Pod>(&mut self, name: impl Into<String>, values: &[T]) -> Result<()> {
        self.add_bytes(name.into(), bytemuck::cast_slice(values))
    }

    fn add_bytes(&mut self, name: String, bytes: &[u8]) -> Result<()> {
        if self.field(&name).is_some() {
            return Err(self.fail(format!("Push constant '{name}' already exists")));
        }
        let offset = self.data.len();
        self.data.extend_from_slice(bytes);
        self.data.resize(padded(self.data.len()), 0);
        self.fields.push(Field {
            name,
            offset,
            size: bytes.len(),
        });
        Ok(())
    }

    /// Replace the value of an existing field.
    pub fn set<T: Pod>(&mut self, name: &str, value: &T) -> Result<()> {
        self.set_bytes(name, bytemuck::bytes_of(value))
    }

    pub fn set_array<T: Pod>(&mut self, name: &str, values: &[T]) -> Result<()> {
        self.set_bytes(name, bytemuck::cast_slice(values))
    }

    fn set_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let Some(field) = self.field(name).cloned() else {
            return Err(self.fail(format!("Unknown push constant '{name}'")));
        };
        if field.size != bytes.len() {
            return Err(self.fail(format!(
                "Push constant '{name}' holds {} bytes, got {}",
                field.size,
                bytes.len()
            )));
        }
        self.data[field.offset..field.offset + field.size].copy_from_slice(bytes);
        Ok(())
    }

    /// Read a field back as `T`.
    pub fn get<T: Pod>(&self, name: &str) -> Option<T> {
        let field = self.field(name)?;
        if field.size != std::mem::size_of::<T>() {
            return None;
        }
        Some(bytemuck::pod_read_unaligned(
            &self.data[field.offset..field.offset + field.size],
        ))
    }

    /// Byte offset of a field inside the block.
    pub fn offset(&self, name: &str) -> Option<u32> {
        self.field(name).map(|f| f.offset as u32)
    }

    /// Size of the whole block in bytes.
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Range covering the whole block for `stages`.
    pub fn range(&self, stages: vk::ShaderStageFlags) -> vk::PushConstantRange {
        vk::PushConstantRange {
            stage_flags: stages,
            offset: 0,
            size: self.size(),
        }
    }
}

fn padded(len: usize) -> usize {
    len.div_ceil(FIELD_ALIGNMENT) * FIELD_ALIGNMENT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> (PushConstants, Arc<ErrorState>) {
        let errors = Arc::new(ErrorState::new());
        (PushConstants::with_errors(Arc::clone(&errors)), errors)
    }

    #[test]
    fn fields_pack_in_order() {
        let (mut constants, _) = block();
        constants.add("time", &1.5f32).unwrap();
        constants.add("color", &[1.0f32, 0.5, 0.25]).unwrap();
        constants.add("frame", &7u32).unwrap();

        assert_eq!(constants.offset("time"), Some(0));
        assert_eq!(constants.offset("color"), Some(4));
        assert_eq!(constants.offset("frame"), Some(16));
        assert_eq!(constants.size(), 20);
        assert_eq!(&constants.as_bytes()[16..20], &7u32.to_ne_bytes());
    }

    #[test]
    fn small_fields_are_padded() {
        let (mut constants, _) = block();
        constants.add("flag", &1u8).unwrap();
        constants.add("value", &2.0f64).unwrap();

        assert_eq!(constants.offset("value"), Some(4));
        assert_eq!(constants.size(), 12);
    }

    #[test]
    fn set_updates_in_place() {
        let (mut constants, _) = block();
        constants.add("a", &1u32).unwrap();
        constants.add("b", &2u32).unwrap();
        constants.set("a", &10u32).unwrap();

        assert_eq!(constants.get::<u32>("a"), Some(10));
        assert_eq!(constants.get::<u32>("b"), Some(2));
        assert_eq!(constants.size(), 8);
    }

    #[test]
    fn unknown_name_is_recorded() {
        let (mut constants, errors) = block();
        constants.add("a", &1u32).unwrap();

        assert!(constants.set("missing", &1u32).is_err());
        let last = errors.last().unwrap();
        assert!(last.message.contains("missing"));
        assert_eq!(constants.get::<u32>("a"), Some(1));
    }

    #[test]
    fn size_mismatch_is_recorded() {
        let (mut constants, errors) = block();
        constants.add("a", &1u32).unwrap();

        assert!(constants.set("a", &1u64).is_err());
        assert!(errors.last().unwrap().message.contains("4 bytes"));
        assert_eq!(constants.get::<u32>("a"), Some(1));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let (mut constants, errors) = block();
        constants.add("a", &1u32).unwrap();
        assert!(constants.add("a", &2u32).is_err());
        assert!(errors.last().is_some());
        assert_eq!(constants.size(), 4);
    }

    #[test]
    fn range_covers_block() {
        let (mut constants, _) = block();
        constants.add_array("weights", &[0.0f32; 4]).unwrap();
        let range = constants.range(vk::ShaderStageFlags::COMPUTE);
        assert_eq!(range.offset, 0);
        assert_eq!(range.size, 16);
        assert_eq!(range.stage_flags, vk::ShaderStageFlags::COMPUTE);
    }
}
