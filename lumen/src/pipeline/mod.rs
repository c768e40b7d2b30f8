//! Pipelines: where the per-stage binding tables meet Vulkan.
//!
//! [`Pipeline::new`] merges the descriptor layouts of all attached shader
//! modules, allocates their per-frame descriptor sets from the shared pool,
//! concatenates their push-constant ranges, creates the graphics, compute
//! or ray-tracing pipeline, and finalizes every module against the result.

pub mod ray_tracing;

pub use ray_tracing::{SbtError, ShaderBindingTable};

use crate::{
    descriptor_set::{DescriptorSetLayoutBuilder, LayoutMergeError},
    device::{Device, DeviceProperties},
    shader::{ShaderCreationError, ShaderModule, ShaderStage},
    VulkanError, FRAMES_IN_FLIGHT, MAX_DESCRIPTOR_SETS,
};
use ash::vk;
use bytemuck::Pod;
use log::{debug, warn};
use ray_tracing::GroupCounts;
use smallvec::SmallVec;
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    sync::Arc,
};

/// Error returned when creating a [`Pipeline`].
#[derive(Debug)]
pub enum PipelineCreationError {
    /// No shader modules were supplied.
    NoModules,
    /// Two stages disagree about a descriptor slot.
    LayoutMerge(LayoutMergeError),
    /// The merged layouts leave a hole in the set indices.
    DescriptorSetGap { set: u32 },
    /// A stage the pipeline kind requires is absent.
    MissingStage(ShaderStage),
    /// A stage that must appear exactly once appears more than once.
    DuplicateStage(ShaderStage),
    /// A stage that does not belong in this kind of pipeline.
    UnexpectedStage(ShaderStage),
    /// The stages' push constants exceed the device limit.
    PushConstantsTooLarge { required: u32, limit: u32 },
    /// A ray-tracing stage was supplied but the device lacks the
    /// extensions.
    RayTracingUnsupported,
    /// A Vulkan call failed.
    VulkanError(VulkanError),
    /// Finalizing a shader module failed.
    ShaderError(ShaderCreationError),
    /// Building the shader binding table failed.
    SbtError(SbtError),
}

impl Error for PipelineCreationError {}

impl Display for PipelineCreationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::NoModules => write!(f, "a pipeline needs at least one shader module"),
            Self::LayoutMerge(err) => write!(f, "{}", err),
            Self::DescriptorSetGap { set } => write!(
                f,
                "descriptor set {} is unused but a higher set is; sets must be contiguous from 0",
                set,
            ),
            Self::MissingStage(stage) => {
                write!(f, "the pipeline is missing a required {:?} stage", stage)
            }
            Self::DuplicateStage(stage) => {
                write!(f, "more than one {:?} stage was supplied", stage)
            }
            Self::UnexpectedStage(stage) => {
                write!(f, "a {:?} stage does not belong in this kind of pipeline", stage)
            }
            Self::PushConstantsTooLarge { required, limit } => write!(
                f,
                "stages use {} bytes of push constants but the device supports {}",
                required, limit,
            ),
            Self::RayTracingUnsupported => {
                write!(f, "ray-tracing shaders on a device without the extensions")
            }
            Self::VulkanError(err) => write!(f, "Vulkan call failed: {}", err),
            Self::ShaderError(err) => write!(f, "{}", err),
            Self::SbtError(err) => write!(f, "{}", err),
        }
    }
}

impl From<LayoutMergeError> for PipelineCreationError {
    fn from(err: LayoutMergeError) -> Self {
        Self::LayoutMerge(err)
    }
}

impl From<vk::Result> for PipelineCreationError {
    fn from(err: vk::Result) -> Self {
        Self::VulkanError(err.into())
    }
}

impl From<ShaderCreationError> for PipelineCreationError {
    fn from(err: ShaderCreationError) -> Self {
        Self::ShaderError(err)
    }
}

impl From<SbtError> for PipelineCreationError {
    fn from(err: SbtError) -> Self {
        Self::SbtError(err)
    }
}

/// Fixed state for graphics pipelines; ignored by compute and ray-tracing
/// ones. Rendering always goes through dynamic rendering, so attachment
/// formats are part of pipeline state.
#[derive(Clone, Debug)]
pub struct PipelineCreateInfo {
    pub name: String,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    /// Multiview mask for layered rendering; zero disables multiview.
    pub view_mask: u32,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub depth_test: bool,
    pub depth_write: bool,
    pub alpha_blend: bool,
    pub max_ray_recursion_depth: u32,
}

impl Default for PipelineCreateInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            color_formats: Vec::new(),
            depth_format: None,
            view_mask: 0,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::BACK,
            depth_test: true,
            depth_write: true,
            alpha_blend: false,
            max_ray_recursion_depth: 1,
        }
    }
}

/// Merges the per-set layout builders of several stages into one layout
/// per set, and checks the sets are contiguous from zero.
fn merge_set_builders<'a>(
    stages: impl Iterator<Item = &'a [DescriptorSetLayoutBuilder]>,
) -> Result<Vec<DescriptorSetLayoutBuilder>, PipelineCreationError> {
    let mut merged: Vec<DescriptorSetLayoutBuilder> = Vec::with_capacity(MAX_DESCRIPTOR_SETS);
    for builders in stages {
        for (set, builder) in builders.iter().enumerate() {
            if merged.len() <= set {
                merged.resize_with(set + 1, DescriptorSetLayoutBuilder::new);
            }
            merged[set].merge(builder)?;
        }
    }
    while merged.last().is_some_and(DescriptorSetLayoutBuilder::is_empty) {
        merged.pop();
    }
    if let Some(set) = merged.iter().position(DescriptorSetLayoutBuilder::is_empty) {
        return Err(PipelineCreationError::DescriptorSetGap { set: set as u32 });
    }
    Ok(merged)
}

/// Concatenates per-stage push-constant ranges into the pipeline layout's
/// range list. Returns the ranges, the base byte offset assigned to each
/// stage, and the total size.
fn concatenate_push_constants(
    stage_ranges: &[vk::PushConstantRange],
) -> (Vec<vk::PushConstantRange>, Vec<u32>, u32) {
    let mut ranges = Vec::new();
    let mut bases = Vec::with_capacity(stage_ranges.len());
    let mut cursor = 0u32;
    for range in stage_ranges {
        bases.push(cursor);
        if range.size == 0 {
            continue;
        }
        ranges.push(vk::PushConstantRange {
            stage_flags: range.stage_flags,
            offset: cursor + range.offset,
            size: range.size,
        });
        cursor += range.offset + range.size;
    }
    (ranges, bases, cursor)
}

enum PipelineKind {
    Graphics,
    Compute,
    RayTracing,
}

fn classify(stages: &[ShaderStage]) -> PipelineKind {
    if stages.iter().any(|stage| {
        matches!(
            stage,
            ShaderStage::RayGeneration
                | ShaderStage::Miss
                | ShaderStage::ClosestHit
                | ShaderStage::AnyHit
                | ShaderStage::Intersection
                | ShaderStage::Callable,
        )
    }) {
        PipelineKind::RayTracing
    } else if stages.contains(&ShaderStage::Compute) {
        PipelineKind::Compute
    } else {
        PipelineKind::Graphics
    }
}

/// Rejects module lists that would build a structurally wrong pipeline. A
/// ray-tracing pipeline's binding table in particular assumes exactly one
/// raygen group; an extra one would shift every later group's handle.
fn validate_stage_composition(
    stages: &[ShaderStage],
    kind: &PipelineKind,
) -> Result<(), PipelineCreationError> {
    let count = |stage: ShaderStage| stages.iter().filter(|&&s| s == stage).count();
    let exactly_one = |stage: ShaderStage| match count(stage) {
        0 => Err(PipelineCreationError::MissingStage(stage)),
        1 => Ok(()),
        _ => Err(PipelineCreationError::DuplicateStage(stage)),
    };

    match kind {
        PipelineKind::Compute => {
            exactly_one(ShaderStage::Compute)?;
            if let Some(&other) = stages.iter().find(|&&s| s != ShaderStage::Compute) {
                return Err(PipelineCreationError::UnexpectedStage(other));
            }
        }
        PipelineKind::Graphics => {
            exactly_one(ShaderStage::Vertex)?;
            exactly_one(ShaderStage::Fragment)?;
        }
        PipelineKind::RayTracing => {
            exactly_one(ShaderStage::RayGeneration)?;
            if count(ShaderStage::Miss) == 0 {
                return Err(PipelineCreationError::MissingStage(ShaderStage::Miss));
            }
            if let Some(&other) = stages.iter().find(|&&s| {
                matches!(
                    s,
                    ShaderStage::Vertex | ShaderStage::Fragment | ShaderStage::Compute,
                )
            }) {
                return Err(PipelineCreationError::UnexpectedStage(other));
            }
        }
    }
    Ok(())
}

/// Checks the concatenated push-constant total against the device limit.
fn check_push_constant_limit(
    total: u32,
    properties: &DeviceProperties,
) -> Result<(), PipelineCreationError> {
    if total > properties.max_push_constants_size {
        return Err(PipelineCreationError::PushConstantsTooLarge {
            required: total,
            limit: properties.max_push_constants_size,
        });
    }
    Ok(())
}

/// A pipeline and the shader modules bound into it. The pipeline owns its
/// modules; parameters are set through [`Pipeline::set_uniform`] and
/// friends, which route to whichever stages declare the name.
pub struct Pipeline {
    device: Arc<Device>,
    modules: Vec<ShaderModule>,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    layout: vk::PipelineLayout,
    handle: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
    /// Descriptor sets indexed `[frame][set]`, shared by all modules.
    frame_sets: Vec<Vec<vk::DescriptorSet>>,
    sbt: Option<ShaderBindingTable>,
}

impl Pipeline {
    pub fn new(
        device: Arc<Device>,
        mut modules: Vec<ShaderModule>,
        info: &PipelineCreateInfo,
    ) -> Result<Self, PipelineCreationError> {
        if modules.is_empty() {
            return Err(PipelineCreationError::NoModules);
        }
        let stages: Vec<ShaderStage> = modules.iter().map(|module| module.stage()).collect();
        let kind = classify(&stages);
        validate_stage_composition(&stages, &kind)?;

        let merged = merge_set_builders(
            modules
                .iter()
                .map(|module| module.reflection().set_builders.as_slice()),
        )?;

        let mut set_layouts = Vec::with_capacity(merged.len());
        for builder in &merged {
            match builder.build(&device) {
                Ok(layout) => set_layouts.push(layout),
                Err(err) => {
                    destroy_set_layouts(&device, &set_layouts);
                    return Err(err.into());
                }
            }
        }

        let result = Self::new_with_layouts(device, &mut modules, &merged, &set_layouts, kind, info);
        match result {
            Ok((layout, handle, bind_point, frame_sets, sbt, device)) => Ok(Self {
                device,
                modules,
                set_layouts,
                layout,
                handle,
                bind_point,
                frame_sets,
                sbt,
            }),
            Err((device, err)) => {
                destroy_set_layouts(&device, &set_layouts);
                Err(err)
            }
        }
    }

    // Split out so set-layout cleanup has one failure path to cover.
    #[allow(clippy::type_complexity)]
    fn new_with_layouts(
        device: Arc<Device>,
        modules: &mut [ShaderModule],
        merged: &[DescriptorSetLayoutBuilder],
        set_layouts: &[vk::DescriptorSetLayout],
        kind: PipelineKind,
        info: &PipelineCreateInfo,
    ) -> Result<
        (
            vk::PipelineLayout,
            vk::Pipeline,
            vk::PipelineBindPoint,
            Vec<Vec<vk::DescriptorSet>>,
            Option<ShaderBindingTable>,
            Arc<Device>,
        ),
        (Arc<Device>, PipelineCreationError),
    > {
        let stage_ranges: Vec<_> = modules
            .iter()
            .map(|module| module.reflection().push_constant_range)
            .collect();
        let (pc_ranges, pc_bases, pc_total) = concatenate_push_constants(&stage_ranges);
        if let Err(err) = check_push_constant_limit(pc_total, device.properties()) {
            return Err((device, err));
        }

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(&pc_ranges);
        let layout =
            match unsafe { device.handle().create_pipeline_layout(&layout_info, None) } {
                Ok(layout) => layout,
                Err(err) => return Err((device, err.into())),
            };

        let inner = Self::create_pipeline_and_sets(
            &device,
            modules,
            merged,
            set_layouts,
            layout,
            &kind,
            info,
        );
        match inner {
            Ok((handle, bind_point, frame_sets, sbt)) => {
                for (module, &base) in modules.iter_mut().zip(&pc_bases) {
                    if let Err(err) = module.finalize(frame_sets.clone(), base) {
                        unsafe {
                            device.handle().destroy_pipeline(handle, None);
                            device.handle().destroy_pipeline_layout(layout, None);
                        }
                        return Err((device, err.into()));
                    }
                }
                // The pipeline keeps its own copy of the compiled code.
                for module in modules.iter_mut() {
                    module.destroy_handle();
                }
                debug!(
                    "pipeline `{}`: {} sets, {} push constant bytes",
                    info.name,
                    set_layouts.len(),
                    pc_total,
                );
                Ok((layout, handle, bind_point, frame_sets, sbt, device))
            }
            Err(err) => {
                unsafe { device.handle().destroy_pipeline_layout(layout, None) };
                Err((device, err))
            }
        }
    }

    fn create_pipeline_and_sets(
        device: &Arc<Device>,
        modules: &[ShaderModule],
        merged: &[DescriptorSetLayoutBuilder],
        set_layouts: &[vk::DescriptorSetLayout],
        layout: vk::PipelineLayout,
        kind: &PipelineKind,
        info: &PipelineCreateInfo,
    ) -> Result<
        (
            vk::Pipeline,
            vk::PipelineBindPoint,
            Vec<Vec<vk::DescriptorSet>>,
            Option<ShaderBindingTable>,
        ),
        PipelineCreationError,
    > {
        let frame_sets = allocate_frame_sets(device, merged, set_layouts)?;

        let stages: Vec<_> = modules
            .iter()
            .map(|module| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(module.stage().flags())
                    .module(module.handle())
                    .name(module.entry_point())
            })
            .collect();

        match kind {
            PipelineKind::Compute => {
                let pipeline_info = vk::ComputePipelineCreateInfo::default()
                    .stage(stages[0])
                    .layout(layout);
                let handle = unsafe {
                    device.handle().create_compute_pipelines(
                        vk::PipelineCache::null(),
                        &[pipeline_info],
                        None,
                    )
                }
                .map_err(|(_, err)| PipelineCreationError::from(err))?[0];
                Ok((handle, vk::PipelineBindPoint::COMPUTE, frame_sets, None))
            }
            PipelineKind::Graphics => {
                let handle = create_graphics_pipeline(device, &stages, layout, info)?;
                Ok((handle, vk::PipelineBindPoint::GRAPHICS, frame_sets, None))
            }
            PipelineKind::RayTracing => {
                let Some(ray_tracing_fns) = device.ray_tracing_fns() else {
                    return Err(PipelineCreationError::RayTracingUnsupported);
                };
                let (handle, counts) = create_ray_tracing_pipeline(
                    ray_tracing_fns,
                    modules,
                    &stages,
                    layout,
                    info,
                )?;
                let sbt = match ShaderBindingTable::new(
                    Arc::clone(device),
                    ray_tracing_fns,
                    handle,
                    counts,
                ) {
                    Ok(sbt) => sbt,
                    Err(err) => {
                        unsafe { device.handle().destroy_pipeline(handle, None) };
                        return Err(err.into());
                    }
                };
                Ok((
                    handle,
                    vk::PipelineBindPoint::RAY_TRACING_KHR,
                    frame_sets,
                    Some(sbt),
                ))
            }
        }
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn modules(&self) -> &[ShaderModule] {
        &self.modules
    }

    pub fn module_mut(&mut self, stage: ShaderStage) -> Option<&mut ShaderModule> {
        self.modules.iter_mut().find(|module| module.stage() == stage)
    }

    /// Routes a uniform write for `frame` to every stage that declares
    /// `name`.
    pub fn set_uniform<T: Pod>(&mut self, frame: usize, name: &str, value: &T) {
        self.route(name, |module| module.set_uniform(frame, name, value));
    }

    pub fn set_uniform_slice<T: Pod>(&mut self, frame: usize, name: &str, values: &[T]) {
        self.route(name, |module| module.set_uniform_slice(frame, name, values));
    }

    pub fn set_bool(&mut self, frame: usize, name: &str, value: bool) {
        self.route(name, |module| module.set_bool(frame, name, value));
    }

    pub fn set_image(&mut self, frame: usize, name: &str, image: &crate::resource::ImageView) {
        self.route(name, |module| module.set_image(frame, name, image));
    }

    pub fn set_image_element(
        &mut self,
        frame: usize,
        name: &str,
        element: u32,
        image: &crate::resource::ImageView,
    ) {
        self.route(name, |module| {
            module.set_image_element(frame, name, element, image)
        });
    }

    pub fn set_buffer(&mut self, frame: usize, name: &str, buffer: &crate::buffer::Buffer) {
        self.route(name, |module| module.set_buffer(frame, name, buffer));
    }

    pub fn set_buffer_element(
        &mut self,
        frame: usize,
        name: &str,
        element: u32,
        buffer: &crate::buffer::Buffer,
    ) {
        self.route(name, |module| {
            module.set_buffer_element(frame, name, element, buffer)
        });
    }

    pub fn set_acceleration_structure(
        &mut self,
        frame: usize,
        name: &str,
        acceleration_structure: &crate::resource::AccelerationStructureRef,
    ) {
        self.route(name, |module| {
            module.set_acceleration_structure(frame, name, acceleration_structure)
        });
    }

    fn route(&mut self, name: &str, mut apply: impl FnMut(&mut ShaderModule)) {
        let mut found = false;
        for module in &mut self.modules {
            if module.bindings().contains_key(name) {
                found = true;
                apply(module);
            }
        }
        if !found {
            warn!("no stage of this pipeline declares a parameter `{}`", name);
        }
    }

    /// Binds the pipeline, its descriptor sets for `frame` and every
    /// stage's push constants.
    pub fn bind(&self, command_buffer: vk::CommandBuffer, frame: usize) {
        let device = self.device.handle();
        unsafe { device.cmd_bind_pipeline(command_buffer, self.bind_point, self.handle) };
        if let Some(sets) = self.frame_sets.get(frame % FRAMES_IN_FLIGHT) {
            if !sets.is_empty() {
                unsafe {
                    device.cmd_bind_descriptor_sets(
                        command_buffer,
                        self.bind_point,
                        self.layout,
                        0,
                        sets,
                        &[],
                    );
                }
            }
        }
        for module in &self.modules {
            module.push_constants(command_buffer, self.layout);
        }
    }

    /// Binds and dispatches a compute pipeline over a global size, rounding
    /// workgroup counts up.
    pub fn dispatch(
        &self,
        command_buffer: vk::CommandBuffer,
        frame: usize,
        global_size: [u32; 3],
    ) {
        let Some(compute) = self
            .modules
            .iter()
            .find(|module| module.stage() == ShaderStage::Compute)
        else {
            warn!("dispatch on a pipeline without a compute stage");
            return;
        };
        let workgroup = compute.workgroup_size();
        let groups = [
            global_size[0].div_ceil(workgroup[0].max(1)),
            global_size[1].div_ceil(workgroup[1].max(1)),
            global_size[2].div_ceil(workgroup[2].max(1)),
        ];
        self.bind(command_buffer, frame);
        unsafe {
            self.device
                .handle()
                .cmd_dispatch(command_buffer, groups[0], groups[1], groups[2]);
        }
    }

    /// Binds and traces rays over a launch size. A no-op with a warning on
    /// non-ray-tracing pipelines.
    pub fn trace_rays(
        &self,
        command_buffer: vk::CommandBuffer,
        frame: usize,
        launch_size: [u32; 3],
    ) {
        let (Some(sbt), Some(ray_tracing_fns)) = (&self.sbt, self.device.ray_tracing_fns())
        else {
            warn!("trace_rays on a pipeline without a shader binding table");
            return;
        };
        self.bind(command_buffer, frame);
        unsafe {
            ray_tracing_fns.cmd_trace_rays(
                command_buffer,
                sbt.raygen_region(),
                sbt.miss_region(),
                sbt.hit_region(),
                sbt.callable_region(),
                launch_size[0],
                launch_size[1],
                launch_size[2],
            );
        }
    }

    pub fn shader_binding_table(&self) -> Option<&ShaderBindingTable> {
        self.sbt.as_ref()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            let device = self.device.handle();
            device.destroy_pipeline(self.handle, None);
            device.destroy_pipeline_layout(self.layout, None);
            // Descriptor sets return to the pool when it is destroyed.
            destroy_set_layouts(&self.device, &self.set_layouts);
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Pipeline")
            .field("bind_point", &self.bind_point)
            .field("modules", &self.modules)
            .field("sets", &self.set_layouts.len())
            .finish_non_exhaustive()
    }
}

fn destroy_set_layouts(device: &Device, layouts: &[vk::DescriptorSetLayout]) {
    for &layout in layouts {
        unsafe { device.handle().destroy_descriptor_set_layout(layout, None) };
    }
}

/// Allocates one descriptor set per layout for every frame in flight.
fn allocate_frame_sets(
    device: &Device,
    merged: &[DescriptorSetLayoutBuilder],
    set_layouts: &[vk::DescriptorSetLayout],
) -> Result<Vec<Vec<vk::DescriptorSet>>, PipelineCreationError> {
    let mut frame_sets = Vec::with_capacity(FRAMES_IN_FLIGHT);
    if set_layouts.is_empty() {
        frame_sets.resize(FRAMES_IN_FLIGHT, Vec::new());
        return Ok(frame_sets);
    }

    let variable_counts: SmallVec<[u32; MAX_DESCRIPTOR_SETS]> = merged
        .iter()
        .map(|builder| builder.variable_descriptor_count().unwrap_or(0))
        .collect();

    for _ in 0..FRAMES_IN_FLIGHT {
        let mut counts_info = vk::DescriptorSetVariableDescriptorCountAllocateInfo::default()
            .descriptor_counts(&variable_counts);
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(device.descriptor_pool())
            .set_layouts(set_layouts)
            .push_next(&mut counts_info);
        let sets = unsafe { device.handle().allocate_descriptor_sets(&info) }?;
        frame_sets.push(sets);
    }
    Ok(frame_sets)
}

fn create_graphics_pipeline(
    device: &Device,
    stages: &[vk::PipelineShaderStageCreateInfo<'_>],
    layout: vk::PipelineLayout,
    info: &PipelineCreateInfo,
) -> Result<vk::Pipeline, PipelineCreationError> {
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
    let input_assembly =
        vk::PipelineInputAssemblyStateCreateInfo::default().topology(info.topology);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(info.cull_mode)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);
    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(info.depth_test && info.depth_format.is_some())
        .depth_write_enable(info.depth_write && info.depth_format.is_some())
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);

    let blend_attachment = if info.alpha_blend {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    } else {
        vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    };
    let blend_attachments = vec![blend_attachment; info.color_formats.len()];
    let color_blend =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
        .view_mask(info.view_mask)
        .color_attachment_formats(&info.color_formats)
        .depth_attachment_format(info.depth_format.unwrap_or(vk::Format::UNDEFINED));

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let handle = unsafe {
        device.handle().create_graphics_pipelines(
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        )
    }
    .map_err(|(_, err)| PipelineCreationError::from(err))?[0];
    Ok(handle)
}

/// Builds the shader group list in the order the binding table expects:
/// raygen, then miss, hit and callable groups.
fn create_ray_tracing_pipeline(
    ray_tracing_fns: &ash::khr::ray_tracing_pipeline::Device,
    modules: &[ShaderModule],
    stages: &[vk::PipelineShaderStageCreateInfo<'_>],
    layout: vk::PipelineLayout,
    info: &PipelineCreateInfo,
) -> Result<(vk::Pipeline, GroupCounts), PipelineCreationError> {
    let general = |index: usize| {
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(index as u32)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
    };

    let mut groups = Vec::new();
    let mut counts = GroupCounts::default();

    for (index, module) in modules.iter().enumerate() {
        if module.stage() == ShaderStage::RayGeneration {
            groups.push(general(index));
        }
    }
    for (index, module) in modules.iter().enumerate() {
        if module.stage() == ShaderStage::Miss {
            groups.push(general(index));
            counts.miss += 1;
        }
    }
    for (index, module) in modules.iter().enumerate() {
        if module.stage() == ShaderStage::ClosestHit {
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(index as u32)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR),
            );
            counts.hit += 1;
        }
    }
    for (index, module) in modules.iter().enumerate() {
        if module.stage() == ShaderStage::Callable {
            groups.push(general(index));
            counts.callable += 1;
        }
    }

    let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
        .stages(stages)
        .groups(&groups)
        .max_pipeline_ray_recursion_depth(info.max_ray_recursion_depth)
        .layout(layout);

    let handle = unsafe {
        ray_tracing_fns.create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        )
    }
    .map_err(|(_, err)| PipelineCreationError::from(err))?[0];
    Ok((handle, counts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constant_ranges_concatenate_with_cumulative_bases() {
        let stage_ranges = [
            vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::VERTEX,
                offset: 0,
                size: 64,
            },
            vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::FRAGMENT,
                offset: 0,
                size: 16,
            },
        ];

        let (ranges, bases, total) = concatenate_push_constants(&stage_ranges);

        assert_eq!(bases, vec![0, 64]);
        assert_eq!(total, 80);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1].offset, 64);
        assert_eq!(ranges[1].size, 16);
        assert_eq!(ranges[1].stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn push_constants_over_the_device_limit_are_flagged() {
        let properties = DeviceProperties::test_default();
        let stage_ranges = [
            vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::VERTEX,
                offset: 0,
                size: 96,
            },
            vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::FRAGMENT,
                offset: 0,
                size: 64,
            },
        ];

        let (_, _, total) = concatenate_push_constants(&stage_ranges);

        assert!(check_push_constant_limit(properties.max_push_constants_size, &properties).is_ok());
        let err = check_push_constant_limit(total, &properties).unwrap_err();
        assert!(matches!(
            err,
            PipelineCreationError::PushConstantsTooLarge {
                required: 160,
                limit: 128,
            },
        ));
    }

    #[test]
    fn a_second_raygen_stage_is_rejected() {
        let stages = [
            ShaderStage::RayGeneration,
            ShaderStage::RayGeneration,
            ShaderStage::Miss,
        ];
        let err = validate_stage_composition(&stages, &classify(&stages)).unwrap_err();
        assert!(matches!(
            err,
            PipelineCreationError::DuplicateStage(ShaderStage::RayGeneration),
        ));
    }

    #[test]
    fn ray_tracing_requires_raygen_and_miss_stages() {
        let no_raygen = [ShaderStage::Miss, ShaderStage::ClosestHit];
        let err = validate_stage_composition(&no_raygen, &classify(&no_raygen)).unwrap_err();
        assert!(matches!(
            err,
            PipelineCreationError::MissingStage(ShaderStage::RayGeneration),
        ));

        let no_miss = [ShaderStage::RayGeneration, ShaderStage::ClosestHit];
        let err = validate_stage_composition(&no_miss, &classify(&no_miss)).unwrap_err();
        assert!(matches!(
            err,
            PipelineCreationError::MissingStage(ShaderStage::Miss),
        ));

        let complete = [
            ShaderStage::RayGeneration,
            ShaderStage::Miss,
            ShaderStage::ClosestHit,
            ShaderStage::Callable,
        ];
        assert!(validate_stage_composition(&complete, &classify(&complete)).is_ok());
    }

    #[test]
    fn graphics_requires_vertex_and_fragment_stages() {
        let vertex_only = [ShaderStage::Vertex];
        let err =
            validate_stage_composition(&vertex_only, &classify(&vertex_only)).unwrap_err();
        assert!(matches!(
            err,
            PipelineCreationError::MissingStage(ShaderStage::Fragment),
        ));

        let pair = [ShaderStage::Vertex, ShaderStage::Fragment];
        assert!(validate_stage_composition(&pair, &classify(&pair)).is_ok());
    }

    #[test]
    fn compute_pipelines_take_a_single_compute_stage() {
        let mixed = [ShaderStage::Compute, ShaderStage::Vertex];
        let err = validate_stage_composition(&mixed, &classify(&mixed)).unwrap_err();
        assert!(matches!(
            err,
            PipelineCreationError::UnexpectedStage(ShaderStage::Vertex),
        ));
    }

    #[test]
    fn stages_without_push_constants_are_skipped() {
        let stage_ranges = [
            vk::PushConstantRange::default(),
            vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::COMPUTE,
                offset: 0,
                size: 32,
            },
        ];

        let (ranges, bases, total) = concatenate_push_constants(&stage_ranges);

        assert_eq!(ranges.len(), 1);
        assert_eq!(bases, vec![0, 0]);
        assert_eq!(total, 32);
    }

    #[test]
    fn merged_sets_must_be_contiguous() {
        let mut set0 = DescriptorSetLayoutBuilder::new();
        set0.add_binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            false,
            vk::ShaderStageFlags::VERTEX,
        );
        let empty = DescriptorSetLayoutBuilder::new();
        let mut set2 = DescriptorSetLayoutBuilder::new();
        set2.add_binding(
            0,
            vk::DescriptorType::SAMPLED_IMAGE,
            1,
            false,
            vk::ShaderStageFlags::FRAGMENT,
        );

        let stage = vec![set0, empty, set2];
        let err = merge_set_builders(std::iter::once(stage.as_slice())).unwrap_err();
        assert!(matches!(
            err,
            PipelineCreationError::DescriptorSetGap { set: 1 },
        ));
    }

    #[test]
    fn merging_unions_sets_across_stages() {
        let mut vertex_set = DescriptorSetLayoutBuilder::new();
        vertex_set.add_binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            false,
            vk::ShaderStageFlags::VERTEX,
        );
        let mut fragment_set = DescriptorSetLayoutBuilder::new();
        fragment_set.add_binding(
            1,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            false,
            vk::ShaderStageFlags::FRAGMENT,
        );

        let vertex = vec![vertex_set];
        let fragment = vec![fragment_set];
        let merged =
            merge_set_builders([vertex.as_slice(), fragment.as_slice()].into_iter()).unwrap();
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn trailing_empty_sets_are_trimmed() {
        let mut set0 = DescriptorSetLayoutBuilder::new();
        set0.add_binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            false,
            vk::ShaderStageFlags::COMPUTE,
        );
        let stage = vec![set0, DescriptorSetLayoutBuilder::new()];
        let merged = merge_set_builders(std::iter::once(stage.as_slice())).unwrap();
        assert_eq!(merged.len(), 1);
    }
}
