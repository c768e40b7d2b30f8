//! Shader modules and the reflection data that drives resource binding.
//!
//! A [`ShaderModule`] wraps one compiled entry point together with its
//! [`BindingTable`]. All layout math happens in [`ReflectionData`], which is
//! plain data derived from the reflected [`ProgramLayout`] and a couple of
//! device limits, so the interesting paths are testable without a GPU.

pub mod binding;
pub mod compiler;
pub mod layout;
mod walk;

pub use binding::{Binding, BindingTable, UniformBlockInfo};
pub use compiler::{CompileError, CompiledShader, ShaderCompiler};
pub use layout::{
    BindingKind, EntryPointLayout, ParameterOffsets, ProgramLayout, ShaderStage, TypeLayout,
    VariableLayout,
};
pub use walk::ReflectError;

use crate::{
    buffer::{Buffer, BufferCreationError},
    descriptor_set::DescriptorSetLayoutBuilder,
    device::Device,
    resource::{AccelerationStructureRef, ImageView},
    VulkanError, FRAMES_IN_FLIGHT,
};
use ash::vk;
use bytemuck::Pod;
use log::{debug, warn};
use smallvec::{smallvec, SmallVec};
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    path::Path,
    sync::Arc,
};

/// Error returned when creating a [`ShaderModule`].
#[derive(Debug)]
pub enum ShaderCreationError {
    /// The compiler rejected the source.
    CompileError(CompileError),
    /// The reflected layout tree is not bindable.
    ReflectError(ReflectError),
    /// A Vulkan call failed.
    VulkanError(VulkanError),
    /// A uniform buffer could not be allocated.
    BufferError(BufferCreationError),
}

impl Error for ShaderCreationError {}

impl Display for ShaderCreationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::CompileError(err) => write!(f, "shader compilation failed: {}", err),
            Self::ReflectError(err) => write!(f, "shader reflection failed: {}", err),
            Self::VulkanError(err) => write!(f, "Vulkan call failed: {}", err),
            Self::BufferError(err) => write!(f, "uniform buffer creation failed: {}", err),
        }
    }
}

impl From<CompileError> for ShaderCreationError {
    fn from(err: CompileError) -> Self {
        Self::CompileError(err)
    }
}

impl From<ReflectError> for ShaderCreationError {
    fn from(err: ReflectError) -> Self {
        Self::ReflectError(err)
    }
}

impl From<vk::Result> for ShaderCreationError {
    fn from(err: vk::Result) -> Self {
        Self::VulkanError(err.into())
    }
}

impl From<BufferCreationError> for ShaderCreationError {
    fn from(err: BufferCreationError) -> Self {
        Self::BufferError(err)
    }
}

/// Everything the binding engine derives from one entry point's reflected
/// layout. Pure data: building it touches no Vulkan handle.
#[derive(Debug)]
pub(crate) struct ReflectionData {
    pub bindings: BindingTable,
    pub uniform_blocks: Vec<UniformBlockInfo>,
    /// Size of the packed per-frame uniform buffer; zero when the module
    /// declares no uniform blocks.
    pub uniform_buffer_size: u64,
    pub push_constant_range: vk::PushConstantRange,
    /// One builder per descriptor set the module touches, indexed by set.
    pub set_builders: SmallVec<[DescriptorSetLayoutBuilder; crate::MAX_DESCRIPTOR_SETS]>,
    pub workgroup_size: [u32; 3],
}

impl ReflectionData {
    /// Walks `program`, packs its uniform blocks at `uniform_alignment` and
    /// resolves push constants into a single range for `stage`.
    pub(crate) fn from_program(
        program: &ProgramLayout,
        stage: ShaderStage,
        uniform_alignment: u64,
    ) -> Result<Self, ReflectError> {
        let mut out = walk::reflect_program(program)?;
        let (uniform_blocks, uniform_buffer_size) = binding::pack_uniform_blocks(
            &mut out.bindings,
            &out.uniform_block_order,
            uniform_alignment,
        );
        let push_constant_range = binding::resolve_push_constants(
            &mut out.bindings,
            &out.push_constant_sizes,
            stage.flags(),
        );

        let mut set_builders: SmallVec<[DescriptorSetLayoutBuilder; crate::MAX_DESCRIPTOR_SETS]> =
            smallvec![DescriptorSetLayoutBuilder::new(); crate::MAX_DESCRIPTOR_SETS];
        let mut highest_set = None;

        for block in &uniform_blocks {
            set_builders[block.set as usize].add_binding(
                block.slot,
                vk::DescriptorType::UNIFORM_BUFFER,
                1,
                false,
                stage.flags(),
            );
            highest_set = highest_set.max(Some(block.set));
        }
        for entry in out.bindings.values() {
            let descriptor_type = match entry.kind {
                // Uniform members are covered by their block's binding, and
                // push constants live outside descriptor sets entirely.
                BindingKind::UniformBuffer | BindingKind::PushConstant => continue,
                kind => match kind.descriptor_type() {
                    Some(ty) => ty,
                    None => continue,
                },
            };
            set_builders[entry.set as usize].add_binding(
                entry.slot,
                descriptor_type,
                entry.array_element_count as u32,
                entry.is_variable_size,
                stage.flags(),
            );
            highest_set = highest_set.max(Some(entry.set));
        }

        let used = highest_set.map_or(0, |set| set as usize + 1);
        set_builders.truncate(used);

        Ok(Self {
            bindings: out.bindings,
            uniform_blocks,
            uniform_buffer_size,
            push_constant_range,
            set_builders,
            workgroup_size: program.entry_point.workgroup_size,
        })
    }

    /// Bytes of push-constant staging this module needs.
    fn push_constant_staging_size(&self) -> usize {
        (self.push_constant_range.offset + self.push_constant_range.size) as usize
    }
}

/// Per-element write targets for an array binding whose stride differs from
/// the CPU element size: element `i` lands at `offset + i * stride` and
/// covers `element_size` bytes.
fn strided_elements(
    binding: Binding,
    element_size: u64,
    count: usize,
) -> impl Iterator<Item = Binding> {
    // Clamp to the elements whose bytes still land inside the binding, so a
    // strided write can never reach into the next packed block.
    let capacity = if binding.stride == 0 || element_size > binding.size {
        0
    } else {
        (binding.size - element_size) / binding.stride + 1
    };
    (0..(count as u64).min(capacity)).map(move |index| Binding {
        offset: binding.offset + index * binding.stride,
        size: element_size,
        ..binding
    })
}

/// One compiled shader stage with its reflection-driven binding state.
pub struct ShaderModule {
    device: Arc<Device>,
    name: String,
    entry_point: std::ffi::CString,
    stage: ShaderStage,
    handle: vk::ShaderModule,
    reflection: ReflectionData,
    /// CPU staging for push constants, flushed at bind time.
    push_constant_data: Vec<u8>,
    /// Byte offset of this stage's push constants within the pipeline
    /// layout; assigned when the pipeline concatenates stage ranges.
    push_constant_base: u32,
    /// One packed uniform buffer per frame in flight, created at finalize.
    uniform_buffers: Vec<Buffer>,
    /// Descriptor sets per frame, indexed `[frame][set]`.
    frame_sets: Vec<Vec<vk::DescriptorSet>>,
    finalized: bool,
}

impl ShaderModule {
    /// Compiles `path` with `compiler` and reflects the result into a
    /// binding table.
    pub fn new(
        device: Arc<Device>,
        compiler: &dyn ShaderCompiler,
        path: &Path,
        entry_point: &str,
        stage: ShaderStage,
    ) -> Result<Self, ShaderCreationError> {
        let compiled = compiler.compile(path, entry_point, stage)?;
        let reflection = ReflectionData::from_program(
            &compiled.layout,
            stage,
            device.properties().min_uniform_buffer_offset_alignment,
        )?;

        let info = vk::ShaderModuleCreateInfo::default().code(&compiled.code);
        let handle = unsafe { device.handle().create_shader_module(&info, None) }?;

        let staging_size = reflection.push_constant_staging_size();
        Ok(Self {
            device,
            entry_point: std::ffi::CString::new(entry_point).unwrap_or_default(),
            name: format!("{}:{}", path.display(), entry_point),
            stage,
            handle,
            reflection,
            push_constant_data: vec![0; staging_size],
            push_constant_base: 0,
            uniform_buffers: Vec::new(),
            frame_sets: Vec::new(),
            finalized: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn bindings(&self) -> &BindingTable {
        &self.reflection.bindings
    }

    pub(crate) fn reflection(&self) -> &ReflectionData {
        &self.reflection
    }

    pub(crate) fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub(crate) fn entry_point(&self) -> &std::ffi::CStr {
        &self.entry_point
    }

    pub(crate) fn workgroup_size(&self) -> [u32; 3] {
        self.reflection.workgroup_size
    }

    fn lookup(&self, name: &str) -> Option<Binding> {
        let binding = self.reflection.bindings.get(name).copied();
        if binding.is_none() {
            warn!("shader `{}` has no parameter `{}`", self.name, name);
        }
        binding
    }

    /// Writes a plain-old-data value into the parameter `name` for `frame`,
    /// routing to push-constant staging or the frame's packed uniform buffer
    /// as the binding table says. Unknown names are dropped with a warning.
    ///
    /// The caller must have fenced `frame`'s previous submission before
    /// writing its resources again.
    pub fn set_uniform<T: Pod>(&mut self, frame: usize, name: &str, value: &T) {
        let Some(binding) = self.lookup(name) else { return };
        self.write_data(frame, name, &binding, bytemuck::bytes_of(value));
    }

    /// Writes an array parameter element by element, honouring the array
    /// stride reflection reported. With a stride equal to `size_of::<T>()`
    /// this degenerates to one contiguous copy; a differing stride still
    /// writes correctly but warns once, since it usually means the CPU and
    /// shader element types disagree.
    pub fn set_uniform_slice<T: Pod>(&mut self, frame: usize, name: &str, values: &[T]) {
        let Some(binding) = self.lookup(name) else { return };
        let element_size = std::mem::size_of::<T>() as u64;
        let stride = if binding.stride == 0 { element_size } else { binding.stride };
        if stride == element_size {
            self.write_data(frame, name, &binding, bytemuck::cast_slice(values));
            return;
        }
        warn!(
            "parameter `{}` has array stride {} but elements are {} bytes; copying per element",
            name, stride, element_size,
        );
        if stride < element_size {
            return;
        }
        let targets: Vec<Binding> =
            strided_elements(binding, element_size, values.len()).collect();
        if targets.len() < values.len() {
            warn!(
                "parameter `{}` holds {} elements but {} were written; truncating",
                name,
                targets.len(),
                values.len(),
            );
        }
        for (value, element) in values.iter().zip(targets) {
            self.write_data(frame, name, &element, bytemuck::bytes_of(value));
        }
    }

    /// Writes a boolean, widened to a 32-bit integer as shader interfaces
    /// expect.
    pub fn set_bool(&mut self, frame: usize, name: &str, value: bool) {
        self.set_uniform(frame, name, &(value as i32));
    }

    fn write_data(&mut self, frame: usize, name: &str, binding: &Binding, data: &[u8]) {
        if data.len() as u64 > binding.size {
            warn!(
                "parameter `{}` is {} bytes but {} were written; truncating",
                name,
                binding.size,
                data.len(),
            );
        }
        let len = (data.len() as u64).min(binding.size) as usize;
        let offset = binding.offset as usize;

        if binding.is_push_constant {
            self.push_constant_data[offset..offset + len].copy_from_slice(&data[..len]);
            return;
        }

        if self.uniform_buffers.is_empty() {
            warn!(
                "uniform write to `{}` before the module was attached to a pipeline",
                name,
            );
            return;
        }
        let buffer = &mut self.uniform_buffers[frame % FRAMES_IN_FLIGHT];
        buffer.fill(&data[..len], binding.offset);
    }

    /// Binds an image to the sampled, storage or combined-sampler parameter
    /// `name` in `frame`'s descriptor set.
    pub fn set_image(&mut self, frame: usize, name: &str, image: &ImageView) {
        self.set_image_element(frame, name, 0, image);
    }

    /// Binds one element of an image array parameter.
    pub fn set_image_element(&mut self, frame: usize, name: &str, element: u32, image: &ImageView) {
        let Some(binding) = self.lookup(name) else { return };
        let descriptor_type = match binding.kind {
            BindingKind::SampledImage
            | BindingKind::StorageImage
            | BindingKind::CombinedImageSampler
            | BindingKind::Sampler => match binding.kind.descriptor_type() {
                Some(ty) => ty,
                None => return,
            },
            other => {
                warn!("parameter `{}` is {:?}, not an image binding", name, other);
                return;
            }
        };

        let infos = [image.descriptor_info()];
        self.write_descriptor(frame, &binding, element, |write| {
            write.descriptor_type(descriptor_type).image_info(&infos)
        });
    }

    /// Binds a storage buffer to the parameter `name`.
    pub fn set_buffer(&mut self, frame: usize, name: &str, buffer: &Buffer) {
        self.set_buffer_element(frame, name, 0, buffer);
    }

    /// Binds one element of a storage-buffer array parameter.
    pub fn set_buffer_element(
        &mut self,
        frame: usize,
        name: &str,
        element: u32,
        buffer: &Buffer,
    ) {
        let Some(binding) = self.lookup(name) else { return };
        if binding.kind != BindingKind::StorageBuffer {
            warn!(
                "parameter `{}` is {:?}, not a storage buffer",
                name, binding.kind,
            );
            return;
        }

        let infos = [vk::DescriptorBufferInfo {
            buffer: buffer.handle(),
            offset: 0,
            range: buffer.size(),
        }];
        self.write_descriptor(frame, &binding, element, |write| {
            write
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&infos)
        });
    }

    /// Binds a top-level acceleration structure to the parameter `name`.
    pub fn set_acceleration_structure(
        &mut self,
        frame: usize,
        name: &str,
        acceleration_structure: &AccelerationStructureRef,
    ) {
        let Some(binding) = self.lookup(name) else { return };
        if binding.kind != BindingKind::AccelerationStructure {
            warn!(
                "parameter `{}` is {:?}, not an acceleration structure",
                name, binding.kind,
            );
            return;
        }

        let Some(set) = self.frame_set(frame, binding.set) else { return };
        let structures = [acceleration_structure.handle];
        let mut as_write = vk::WriteDescriptorSetAccelerationStructureKHR::default()
            .acceleration_structures(&structures);
        let mut write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(binding.slot)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut as_write);
        write.descriptor_count = 1;
        unsafe { self.device.handle().update_descriptor_sets(&[write], &[]) };
    }

    fn frame_set(&self, frame: usize, set: u32) -> Option<vk::DescriptorSet> {
        if self.frame_sets.is_empty() {
            warn!(
                "descriptor write before shader `{}` was attached to a pipeline",
                self.name,
            );
            return None;
        }
        let sets = &self.frame_sets[frame % FRAMES_IN_FLIGHT];
        let found = sets.get(set as usize).copied();
        if found.is_none() {
            warn!("shader `{}` has no descriptor set {}", self.name, set);
        }
        found
    }

    fn write_descriptor<'a>(
        &self,
        frame: usize,
        binding: &Binding,
        element: u32,
        fill: impl Fn(vk::WriteDescriptorSet<'a>) -> vk::WriteDescriptorSet<'a>,
    ) {
        let Some(set) = self.frame_set(frame, binding.set) else { return };
        let write = fill(
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding.slot)
                .dst_array_element(element),
        );
        unsafe { self.device.handle().update_descriptor_sets(&[write], &[]) };
    }

    /// Attaches the module to its pipeline: remembers its descriptor sets
    /// and push-constant base, allocates the per-frame uniform buffers and
    /// points the uniform-block descriptors at them. Calling it again is a
    /// no-op.
    pub(crate) fn finalize(
        &mut self,
        frame_sets: Vec<Vec<vk::DescriptorSet>>,
        push_constant_base: u32,
    ) -> Result<(), ShaderCreationError> {
        if self.finalized {
            debug!("shader `{}` is already finalized", self.name);
            return Ok(());
        }
        self.push_constant_base = push_constant_base;
        self.frame_sets = frame_sets;

        if self.reflection.uniform_buffer_size > 0 {
            for frame in 0..FRAMES_IN_FLIGHT {
                let buffer = Buffer::new_uniform(
                    Arc::clone(&self.device),
                    &format!("{} uniforms (frame {})", self.name, frame),
                    self.reflection.uniform_buffer_size,
                )?;

                for block in &self.reflection.uniform_blocks {
                    let Some(&set) = self
                        .frame_sets
                        .get(frame)
                        .and_then(|sets| sets.get(block.set as usize))
                    else {
                        continue;
                    };
                    let infos = [vk::DescriptorBufferInfo {
                        buffer: buffer.handle(),
                        offset: block.offset,
                        range: block.size,
                    }];
                    let write = vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(block.slot)
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(&infos);
                    unsafe { self.device.handle().update_descriptor_sets(&[write], &[]) };
                }

                self.uniform_buffers.push(buffer);
            }
        }

        self.finalized = true;
        Ok(())
    }

    /// Flushes push-constant staging into the command buffer.
    pub(crate) fn push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
    ) {
        let range = self.reflection.push_constant_range;
        if range.size == 0 {
            return;
        }
        let start = range.offset as usize;
        let end = start + range.size as usize;
        unsafe {
            self.device.handle().cmd_push_constants(
                command_buffer,
                layout,
                range.stage_flags,
                self.push_constant_base + range.offset,
                &self.push_constant_data[start..end],
            );
        }
    }

    /// Releases the SPIR-V module handle once the pipeline owns a compiled
    /// copy of the code.
    pub(crate) fn destroy_handle(&mut self) {
        if self.handle != vk::ShaderModule::null() {
            unsafe { self.device.handle().destroy_shader_module(self.handle, None) };
            self.handle = vk::ShaderModule::null();
        }
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.destroy_handle();
    }
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ShaderModule")
            .field("name", &self.name)
            .field("stage", &self.stage)
            .field("bindings", &self.reflection.bindings.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_and_texture_program() -> ProgramLayout {
        let block = VariableLayout::new(
            "frame",
            TypeLayout::ConstantBuffer {
                element: Box::new(VariableLayout::anonymous(
                    TypeLayout::Struct {
                        fields: vec![
                            VariableLayout::new(
                                "view",
                                TypeLayout::Value { size: 64 },
                                ParameterOffsets::uniform(0),
                            ),
                            VariableLayout::new(
                                "time",
                                TypeLayout::Value { size: 4 },
                                ParameterOffsets::uniform(64),
                            ),
                        ],
                        uniform_size: 68,
                    },
                    ParameterOffsets::default(),
                )),
                push_constant: false,
            },
            ParameterOffsets::slot(0),
        );
        let texture = VariableLayout::new(
            "albedo",
            TypeLayout::Resource {
                kind: BindingKind::CombinedImageSampler,
                element_stride: 0,
            },
            ParameterOffsets::slot(1),
        );

        ProgramLayout {
            globals: VariableLayout::anonymous(
                TypeLayout::Struct {
                    fields: vec![block, texture],
                    uniform_size: 0,
                },
                ParameterOffsets::default(),
            ),
            entry_point: EntryPointLayout {
                name: "main".into(),
                stage: ShaderStage::Fragment,
                parameters: ProgramLayout::empty_globals(),
                workgroup_size: [1, 1, 1],
            },
        }
    }

    #[test]
    fn reflection_data_builds_one_set_with_two_slots() {
        let data = ReflectionData::from_program(
            &uniform_and_texture_program(),
            ShaderStage::Fragment,
            64,
        )
        .unwrap();

        assert_eq!(data.set_builders.len(), 1);
        assert!(!data.set_builders[0].is_empty());
        assert_eq!(data.uniform_blocks.len(), 1);
        assert_eq!(data.uniform_buffer_size, 68);
        assert_eq!(data.push_constant_range.size, 0);
        assert_eq!(data.bindings["frame.time"].offset, 64);
    }

    #[test]
    fn push_constant_only_modules_need_no_sets() {
        let program = ProgramLayout {
            globals: VariableLayout::anonymous(
                TypeLayout::Struct {
                    fields: vec![VariableLayout::new(
                        "pc",
                        TypeLayout::ConstantBuffer {
                            element: Box::new(VariableLayout::anonymous(
                                TypeLayout::Struct {
                                    fields: vec![VariableLayout::new(
                                        "model",
                                        TypeLayout::Value { size: 64 },
                                        ParameterOffsets::uniform(0),
                                    )],
                                    uniform_size: 64,
                                },
                                ParameterOffsets::default(),
                            )),
                            push_constant: true,
                        },
                        ParameterOffsets::default(),
                    )],
                    uniform_size: 0,
                },
                ParameterOffsets::default(),
            ),
            entry_point: EntryPointLayout {
                name: "main".into(),
                stage: ShaderStage::Vertex,
                parameters: ProgramLayout::empty_globals(),
                workgroup_size: [1, 1, 1],
            },
        };

        let data =
            ReflectionData::from_program(&program, ShaderStage::Vertex, 64).unwrap();

        assert!(data.set_builders.is_empty());
        assert_eq!(data.uniform_buffer_size, 0);
        assert_eq!(data.push_constant_range.size, 64);
        assert_eq!(
            data.push_constant_range.stage_flags,
            vk::ShaderStageFlags::VERTEX,
        );
        assert_eq!(data.push_constant_staging_size(), 64);
        assert!(data.bindings["pc.model"].is_push_constant);
    }

    #[test]
    fn stride_mismatched_arrays_copy_per_element() {
        // vec3 elements (12 bytes) in a std140 array with a 16-byte stride.
        let binding = Binding {
            set: 0,
            slot: 0,
            offset: 32,
            size: 64,
            stride: 16,
            array_element_count: 4,
            kind: BindingKind::UniformBuffer,
            is_push_constant: false,
            is_variable_size: false,
        };

        let elements: Vec<_> = strided_elements(binding, 12, 4).collect();

        assert_eq!(elements.len(), 4);
        for (index, element) in elements.iter().enumerate() {
            assert_eq!(element.offset, 32 + 16 * index as u64);
            assert_eq!(element.size, 12);
        }
    }

    #[test]
    fn oversized_strided_slices_stop_at_the_block_boundary() {
        // A 64-byte array of four 16-stride elements, written with six
        // values: the extra two would land in the next packed block.
        let binding = Binding {
            set: 0,
            slot: 0,
            offset: 32,
            size: 64,
            stride: 16,
            array_element_count: 4,
            kind: BindingKind::UniformBuffer,
            is_push_constant: false,
            is_variable_size: false,
        };

        let elements: Vec<_> = strided_elements(binding, 12, 6).collect();

        assert_eq!(elements.len(), 4);
        let last = elements.last().unwrap();
        assert!(last.offset + last.size <= binding.offset + binding.size);
    }

    #[test]
    fn workgroup_size_is_carried_through() {
        let mut program = uniform_and_texture_program();
        program.entry_point.workgroup_size = [8, 8, 1];
        let data =
            ReflectionData::from_program(&program, ShaderStage::Compute, 256).unwrap();
        assert_eq!(data.workgroup_size, [8, 8, 1]);
    }
}
