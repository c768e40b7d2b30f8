//! Descriptor set layout construction.
//!
//! Every shader module contributes one [`DescriptorSetLayoutBuilder`] per
//! set it touches; the pipeline merges the builders of all its stages and
//! builds the final layouts. Layouts are always created with
//! update-after-bind and partially-bound semantics so descriptor writes can
//! happen at any point before submission and unused slots can stay empty.

use crate::device::Device;
use ash::vk;
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// Upper bound for unbounded (runtime-sized) descriptor arrays.
pub const MAX_VARIABLE_DESCRIPTORS: u32 = 1024;

/// One slot of a set layout under construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SlotEntry {
    slot: u32,
    descriptor_type: vk::DescriptorType,
    descriptor_count: u32,
    variable: bool,
    stages: vk::ShaderStageFlags,
}

/// Error raised when two stages disagree about a descriptor slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayoutMergeError {
    /// Two stages declared the same slot with different type or count.
    SlotCollision {
        slot: u32,
        existing: vk::DescriptorType,
        incoming: vk::DescriptorType,
    },
}

impl Error for LayoutMergeError {}

impl Display for LayoutMergeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::SlotCollision {
                slot,
                existing,
                incoming,
            } => write!(
                f,
                "descriptor slot {} is declared as both {:?} and {:?} across shader stages",
                slot, existing, incoming,
            ),
        }
    }
}

/// Accumulates the bindings of one descriptor set across shader stages.
#[derive(Clone, Debug, Default)]
pub struct DescriptorSetLayoutBuilder {
    entries: Vec<SlotEntry>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers a binding. Re-registering an identical slot within one
    /// stage is a no-op apart from accumulating stage flags.
    pub fn add_binding(
        &mut self,
        slot: u32,
        descriptor_type: vk::DescriptorType,
        descriptor_count: u32,
        variable: bool,
        stages: vk::ShaderStageFlags,
    ) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.slot == slot) {
            entry.stages |= stages;
            return;
        }
        self.entries.push(SlotEntry {
            slot,
            descriptor_type,
            descriptor_count: if variable {
                MAX_VARIABLE_DESCRIPTORS
            } else {
                descriptor_count.max(1)
            },
            variable,
            stages,
        });
    }

    /// Folds another stage's bindings for the same set into this builder.
    /// Identical slots merge their stage flags; disagreeing slots are a
    /// hard error, since silently preferring one stage would leave the
    /// other reading garbage.
    pub fn merge(&mut self, other: &Self) -> Result<(), LayoutMergeError> {
        for incoming in &other.entries {
            match self.entries.iter_mut().find(|entry| entry.slot == incoming.slot) {
                Some(existing) => {
                    if existing.descriptor_type != incoming.descriptor_type
                        || existing.descriptor_count != incoming.descriptor_count
                        || existing.variable != incoming.variable
                    {
                        return Err(LayoutMergeError::SlotCollision {
                            slot: incoming.slot,
                            existing: existing.descriptor_type,
                            incoming: incoming.descriptor_type,
                        });
                    }
                    existing.stages |= incoming.stages;
                }
                None => self.entries.push(*incoming),
            }
        }
        Ok(())
    }

    /// Creates the Vulkan layout. The caller owns the returned handle.
    pub(crate) fn build(
        &self,
        device: &Device,
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        let mut entries = self.entries.clone();
        entries.sort_by_key(|entry| entry.slot);

        let bindings: Vec<_> = entries
            .iter()
            .map(|entry| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(entry.slot)
                    .descriptor_type(entry.descriptor_type)
                    .descriptor_count(entry.descriptor_count)
                    .stage_flags(entry.stages)
            })
            .collect();
        let flags: Vec<_> = entries
            .iter()
            .map(|entry| {
                let mut flags = vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                    | vk::DescriptorBindingFlags::PARTIALLY_BOUND;
                if entry.variable {
                    flags |= vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT;
                }
                flags
            })
            .collect();

        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&flags);
        let info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);

        unsafe { device.handle().create_descriptor_set_layout(&info, None) }
    }

    /// Number of descriptors in the variable-count binding, if any. Needed
    /// at allocation time.
    pub(crate) fn variable_descriptor_count(&self) -> Option<u32> {
        self.entries
            .iter()
            .find(|entry| entry.variable)
            .map(|entry| entry.descriptor_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_of_disjoint_slots_is_a_union() {
        let mut vertex = DescriptorSetLayoutBuilder::new();
        vertex.add_binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            false,
            vk::ShaderStageFlags::VERTEX,
        );

        let mut fragment = DescriptorSetLayoutBuilder::new();
        fragment.add_binding(
            1,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            false,
            vk::ShaderStageFlags::FRAGMENT,
        );

        vertex.merge(&fragment).unwrap();
        assert_eq!(vertex.entries.len(), 2);
    }

    #[test]
    fn merge_of_identical_slots_accumulates_stages() {
        let mut vertex = DescriptorSetLayoutBuilder::new();
        vertex.add_binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            false,
            vk::ShaderStageFlags::VERTEX,
        );

        let mut fragment = DescriptorSetLayoutBuilder::new();
        fragment.add_binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            false,
            vk::ShaderStageFlags::FRAGMENT,
        );

        vertex.merge(&fragment).unwrap();
        assert_eq!(vertex.entries.len(), 1);
        assert_eq!(
            vertex.entries[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        );
    }

    #[test]
    fn conflicting_slot_types_fail_to_merge() {
        let mut vertex = DescriptorSetLayoutBuilder::new();
        vertex.add_binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            false,
            vk::ShaderStageFlags::VERTEX,
        );

        let mut fragment = DescriptorSetLayoutBuilder::new();
        fragment.add_binding(
            0,
            vk::DescriptorType::STORAGE_BUFFER,
            1,
            false,
            vk::ShaderStageFlags::FRAGMENT,
        );

        let err = vertex.merge(&fragment).unwrap_err();
        assert!(matches!(err, LayoutMergeError::SlotCollision { slot: 0, .. }));
    }

    #[test]
    fn unbounded_arrays_get_the_variable_cap() {
        let mut builder = DescriptorSetLayoutBuilder::new();
        builder.add_binding(
            3,
            vk::DescriptorType::SAMPLED_IMAGE,
            0,
            true,
            vk::ShaderStageFlags::FRAGMENT,
        );
        assert_eq!(builder.variable_descriptor_count(), Some(MAX_VARIABLE_DESCRIPTORS));
    }
}
