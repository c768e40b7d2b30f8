//! The layout walker: turns a [`ProgramLayout`] tree into a binding table.
//!
//! The walk is a depth-first descent over [`VariableLayout`] nodes. All
//! cursor state lives in a [`WalkContext`] passed *by value* into each
//! recursive call, so a node can never corrupt its siblings' coordinates.
//! Four coordinate spaces are tracked side by side and never mixed:
//!
//! 1. descriptor set index + binding slot,
//! 2. push-constant range index + byte offset,
//! 3. uniform byte offset within the enclosing block (rebased to the packed
//!    per-module buffer afterwards, see [`super::binding`]),
//! 4. sub-element register space, used only to place nested parameter
//!    blocks.

use super::{
    binding::{Binding, BindingTable},
    layout::{BindingKind, ProgramLayout, TypeLayout, VariableLayout},
};
use crate::MAX_DESCRIPTOR_SETS;
use log::{debug, warn};
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// Raw result of walking one program: block-relative binding entries plus
/// the block bookkeeping needed to lay out buffers afterwards.
#[derive(Debug, Default)]
pub(crate) struct ReflectionOutput {
    pub bindings: BindingTable,
    /// Distinct uniform blocks in declaration order.
    pub uniform_block_order: Vec<(u32, u32)>,
    /// Byte size of each push-constant block, indexed by range.
    pub push_constant_sizes: Vec<u64>,
}

/// Error raised while walking a reflected layout tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReflectError {
    /// A leaf parameter resolved to an empty name path. The original would
    /// silently drop such a parameter; here it is a hard error because the
    /// parameter would be unreachable through the binding table.
    UnnamedParameter { type_description: String },
    /// A parameter landed in a descriptor set at or beyond
    /// [`MAX_DESCRIPTOR_SETS`].
    SetIndexOutOfRange { set: u32 },
}

impl Error for ReflectError {}

impl Display for ReflectError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::UnnamedParameter { type_description } => write!(
                f,
                "a shader parameter of type {} has no name path and would be unreachable",
                type_description,
            ),
            Self::SetIndexOutOfRange { set } => write!(
                f,
                "a shader parameter uses descriptor set {}, but at most {} sets are supported",
                set, MAX_DESCRIPTOR_SETS,
            ),
        }
    }
}

/// Cursor state for one point of the descent. Cloned, adjusted and passed
/// down; never threaded back up.
#[derive(Clone, Debug, Default)]
struct WalkContext {
    path: String,
    set: u32,
    slot: u32,
    uniform_offset: u64,
    /// Current push-constant range index, once inside a push-constant block.
    push_constant: Option<u32>,
    /// Accumulated sub-element register space; becomes the set index when a
    /// parameter block is entered.
    sub_element: u32,
    inside_parameter_block: bool,
    /// Whether a constant buffer encloses this point, i.e. whether `Value`
    /// leaves are backed by uniform storage.
    inside_uniform_block: bool,
}

impl WalkContext {
    /// Context for a child at `var`'s relative coordinates.
    fn descend(&self, var: &VariableLayout) -> Self {
        let mut child = self.clone();
        child.uniform_offset += var.offsets.uniform;
        child.slot += var.offsets.slot;
        child.set += var.offsets.space;
        child.sub_element += var.offsets.sub_element;
        if let Some(range) = child.push_constant {
            child.push_constant = Some(range + var.offsets.push_constant);
        }
        if let Some(name) = &var.name {
            if !child.path.is_empty() {
                child.path.push('.');
            }
            child.path.push_str(name);
        }
        child
    }
}

/// Walks the global scope and the entry point of `program` into one
/// reflection output.
pub(crate) fn reflect_program(program: &ProgramLayout) -> Result<ReflectionOutput, ReflectError> {
    let mut out = ReflectionOutput::default();
    walk_variable(&program.globals, WalkContext::default(), &mut out)?;
    walk_variable(
        &program.entry_point.parameters,
        WalkContext::default(),
        &mut out,
    )?;
    Ok(out)
}

fn walk_variable(
    var: &VariableLayout,
    ctx: WalkContext,
    out: &mut ReflectionOutput,
) -> Result<(), ReflectError> {
    let ctx = ctx.descend(var);

    match &var.ty {
        TypeLayout::Struct { fields, .. } => {
            for field in fields {
                walk_variable(field, ctx.clone(), out)?;
            }
            Ok(())
        }

        TypeLayout::Value { size } => emit_data_leaf(&ctx, *size, 0, 0, out),

        TypeLayout::Array {
            element,
            element_stride,
            element_count,
        } => match element.as_ref() {
            TypeLayout::Resource {
                kind,
                element_stride: resource_stride,
            } => emit_resource(
                &ctx,
                *kind,
                *resource_stride,
                *element_count,
                *element_count == 0,
                out,
            ),
            // Uniform-data arrays are a single leaf: one binding covering
            // `count` elements at `stride` bytes each.
            TypeLayout::Value { .. } | TypeLayout::Struct { .. } => emit_data_leaf(
                &ctx,
                element_stride * element_count,
                *element_stride,
                *element_count,
                out,
            ),
            other => {
                warn!(
                    "ignoring array of unsupported element type {:?} at `{}`",
                    other, ctx.path,
                );
                Ok(())
            }
        },

        TypeLayout::Resource {
            kind,
            element_stride,
        } => emit_resource(&ctx, *kind, *element_stride, 0, false, out),

        TypeLayout::ConstantBuffer {
            element,
            push_constant,
        } => {
            let element_size = element.ty.uniform_size();

            if *push_constant {
                // The range index comes from the push-constant coordinate
                // space; contents restart at byte 0 of that range. The
                // descent has already applied `var`'s range offset when a
                // range is in scope.
                let range = ctx.push_constant.unwrap_or(var.offsets.push_constant);
                if out.push_constant_sizes.len() <= range as usize {
                    out.push_constant_sizes.resize(range as usize + 1, 0);
                }
                out.push_constant_sizes[range as usize] = element_size;

                let mut inner = ctx.clone();
                inner.push_constant = Some(range);
                inner.uniform_offset = 0;
                inner.inside_uniform_block = true;
                return walk_variable(element, inner, out);
            }

            let set = effective_set(&ctx)?;
            if element_size > 0 && !contains(&out.uniform_block_order, set, ctx.slot) {
                out.uniform_block_order.push((set, ctx.slot));
            }

            // Block contents are block-relative; the packing pass rebases
            // them into the module's single buffer.
            let mut inner = ctx.clone();
            inner.uniform_offset = 0;
            inner.inside_uniform_block = true;
            walk_variable(element, inner, out)
        }

        TypeLayout::ParameterBlock { element } => {
            // A parameter block owns a private set, addressed through the
            // sub-element register space rather than the binding space.
            let set = ctx.sub_element;
            if set as usize >= MAX_DESCRIPTOR_SETS {
                return Err(ReflectError::SetIndexOutOfRange { set });
            }

            let element_size = element.ty.uniform_size();
            if element_size > 0 && !contains(&out.uniform_block_order, set, 0) {
                // Uniform data inside a parameter block gets an implicit
                // block at slot 0 of the private set.
                out.uniform_block_order.push((set, 0));
            }

            let mut inner = ctx.clone();
            inner.set = set;
            inner.slot = 0;
            inner.uniform_offset = 0;
            inner.inside_parameter_block = true;
            inner.inside_uniform_block = element_size > 0;
            walk_variable(element, inner, out)
        }
    }
}

fn effective_set(ctx: &WalkContext) -> Result<u32, ReflectError> {
    let set = if ctx.inside_parameter_block {
        ctx.set
    } else {
        ctx.set + ctx.sub_element
    };
    if set as usize >= MAX_DESCRIPTOR_SETS {
        return Err(ReflectError::SetIndexOutOfRange { set });
    }
    Ok(set)
}

/// Emits a uniform or push-constant data leaf.
fn emit_data_leaf(
    ctx: &WalkContext,
    size: u64,
    stride: u64,
    array_element_count: u64,
    out: &mut ReflectionOutput,
) -> Result<(), ReflectError> {
    if size == 0 {
        // Empty structs and other zero-size fields produce no storage.
        debug!("skipping zero-size parameter `{}`", ctx.path);
        return Ok(());
    }

    if !ctx.inside_uniform_block {
        // A bare value outside any block is layout metadata (for example a
        // varying), not a bindable parameter.
        debug!("skipping non-block data `{}`", ctx.path);
        return Ok(());
    }

    if let Some(range) = ctx.push_constant {
        insert(
            out,
            &ctx.path,
            Binding {
                set: range,
                slot: 0,
                offset: ctx.uniform_offset,
                size,
                stride,
                array_element_count,
                kind: BindingKind::PushConstant,
                is_push_constant: true,
                is_variable_size: false,
            },
        )
    } else {
        let set = effective_set(ctx)?;
        insert(
            out,
            &ctx.path,
            Binding {
                set,
                slot: ctx.slot,
                offset: ctx.uniform_offset,
                size,
                stride,
                array_element_count,
                kind: BindingKind::UniformBuffer,
                is_push_constant: false,
                is_variable_size: false,
            },
        )
    }
}

fn emit_resource(
    ctx: &WalkContext,
    kind: BindingKind,
    stride: u64,
    array_element_count: u64,
    is_variable_size: bool,
    out: &mut ReflectionOutput,
) -> Result<(), ReflectError> {
    if ctx.push_constant.is_some() {
        warn!(
            "resource parameter `{}` inside a push-constant block is not bindable",
            ctx.path,
        );
        return Ok(());
    }

    let set = effective_set(ctx)?;
    insert(
        out,
        &ctx.path,
        Binding {
            set,
            slot: ctx.slot,
            offset: 0,
            size: 0,
            stride,
            array_element_count,
            kind,
            is_push_constant: false,
            is_variable_size,
        },
    )
}

fn insert(out: &mut ReflectionOutput, path: &str, binding: Binding) -> Result<(), ReflectError> {
    if path.is_empty() {
        return Err(ReflectError::UnnamedParameter {
            type_description: format!("{:?}", binding.kind),
        });
    }
    if out.bindings.insert(path.to_owned(), binding).is_some() {
        warn!("shader parameter `{}` was reflected twice; keeping the later entry", path);
    }
    Ok(())
}

fn contains(order: &[(u32, u32)], set: u32, slot: u32) -> bool {
    order.iter().any(|&entry| entry == (set, slot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::layout::{
        EntryPointLayout, ParameterOffsets, ProgramLayout, ShaderStage,
    };

    fn value(size: u64) -> TypeLayout {
        TypeLayout::Value { size }
    }

    fn field(name: &str, uniform: u64, ty: TypeLayout) -> VariableLayout {
        VariableLayout::new(name, ty, ParameterOffsets::uniform(uniform))
    }

    fn program(globals: VariableLayout) -> ProgramLayout {
        ProgramLayout {
            globals,
            entry_point: EntryPointLayout {
                name: "main".into(),
                stage: ShaderStage::Compute,
                parameters: ProgramLayout::empty_globals(),
                workgroup_size: [8, 8, 1],
            },
        }
    }

    /// `cbuffer Light { float a; float3 b; }` with std140-style packing.
    fn light_block(slot: u32) -> VariableLayout {
        VariableLayout::new(
            "light",
            TypeLayout::ConstantBuffer {
                element: Box::new(VariableLayout::anonymous(
                    TypeLayout::Struct {
                        fields: vec![field("a", 0, value(4)), field("b", 16, value(12))],
                        uniform_size: 28,
                    },
                    ParameterOffsets::default(),
                )),
                push_constant: false,
            },
            ParameterOffsets::slot(slot),
        )
    }

    #[test]
    fn simple_uniform_block() {
        let root = VariableLayout::anonymous(
            TypeLayout::Struct {
                fields: vec![light_block(0)],
                uniform_size: 0,
            },
            ParameterOffsets::default(),
        );

        let out = reflect_program(&program(root)).unwrap();

        let a = &out.bindings["light.a"];
        assert_eq!((a.set, a.slot, a.offset, a.size), (0, 0, 0, 4));
        let b = &out.bindings["light.b"];
        assert_eq!((b.set, b.slot, b.offset, b.size), (0, 0, 16, 12));
        assert!(!a.is_push_constant);
        assert_eq!(out.uniform_block_order, vec![(0, 0)]);
    }

    #[test]
    fn nested_struct_paths_accumulate_offsets() {
        // cbuffer Scene { struct { struct { float c; } b; } a; } with local
        // offsets 32 and 8: `a.b.c` must land at 40.
        let inner = TypeLayout::Struct {
            fields: vec![field("c", 8, value(4))],
            uniform_size: 12,
        };
        let middle = TypeLayout::Struct {
            fields: vec![field("b", 32, inner)],
            uniform_size: 44,
        };
        let root = VariableLayout::anonymous(
            TypeLayout::Struct {
                fields: vec![VariableLayout::new(
                    "scene",
                    TypeLayout::ConstantBuffer {
                        element: Box::new(VariableLayout::anonymous(
                            TypeLayout::Struct {
                                fields: vec![field("a", 0, middle)],
                                uniform_size: 44,
                            },
                            ParameterOffsets::default(),
                        )),
                        push_constant: false,
                    },
                    ParameterOffsets::slot(0),
                )],
                uniform_size: 0,
            },
            ParameterOffsets::default(),
        );

        let out = reflect_program(&program(root)).unwrap();

        let c = &out.bindings["scene.a.b.c"];
        assert_eq!(c.offset, 40);
        assert_eq!(c.size, 4);
    }

    #[test]
    fn push_constant_block_routes_into_range_space() {
        let root = VariableLayout::anonymous(
            TypeLayout::Struct {
                fields: vec![VariableLayout::new(
                    "pc",
                    TypeLayout::ConstantBuffer {
                        element: Box::new(VariableLayout::anonymous(
                            TypeLayout::Struct {
                                fields: vec![
                                    field("model", 0, value(64)),
                                    field("tint", 64, value(16)),
                                ],
                                uniform_size: 80,
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
        );

        let out = reflect_program(&program(root)).unwrap();

        let model = &out.bindings["pc.model"];
        assert!(model.is_push_constant);
        assert_eq!(model.kind, BindingKind::PushConstant);
        assert_eq!((model.set, model.offset, model.size), (0, 0, 64));
        let tint = &out.bindings["pc.tint"];
        assert_eq!(tint.offset, 64);
        assert_eq!(out.push_constant_sizes, vec![80]);
        // Push constants never contribute uniform blocks.
        assert!(out.uniform_block_order.is_empty());
    }

    #[test]
    fn nested_push_constant_blocks_keep_their_range_index() {
        // A push-constant block at range 1 holding an inner block one range
        // further along: the inner range index is 2, applied once.
        let inner = VariableLayout::new(
            "inner",
            TypeLayout::ConstantBuffer {
                element: Box::new(VariableLayout::anonymous(
                    TypeLayout::Struct {
                        fields: vec![field("x", 0, value(4))],
                        uniform_size: 4,
                    },
                    ParameterOffsets::default(),
                )),
                push_constant: true,
            },
            ParameterOffsets {
                push_constant: 1,
                ..ParameterOffsets::default()
            },
        );
        let root = VariableLayout::anonymous(
            TypeLayout::Struct {
                fields: vec![VariableLayout::new(
                    "pc",
                    TypeLayout::ConstantBuffer {
                        element: Box::new(VariableLayout::anonymous(
                            TypeLayout::Struct {
                                fields: vec![field("model", 0, value(64)), inner],
                                uniform_size: 64,
                            },
                            ParameterOffsets::default(),
                        )),
                        push_constant: true,
                    },
                    ParameterOffsets {
                        push_constant: 1,
                        ..ParameterOffsets::default()
                    },
                )],
                uniform_size: 0,
            },
            ParameterOffsets::default(),
        );

        let out = reflect_program(&program(root)).unwrap();

        assert_eq!(out.push_constant_sizes.len(), 3);
        assert_eq!(out.push_constant_sizes[1], 64);
        assert_eq!(out.push_constant_sizes[2], 4);
        assert!(out.bindings["pc.inner.x"].is_push_constant);
    }

    #[test]
    fn resources_emit_directly() {
        let root = VariableLayout::anonymous(
            TypeLayout::Struct {
                fields: vec![
                    VariableLayout::new(
                        "albedo",
                        TypeLayout::Resource {
                            kind: BindingKind::CombinedImageSampler,
                            element_stride: 0,
                        },
                        ParameterOffsets::slot(0),
                    ),
                    VariableLayout::new(
                        "vertices",
                        TypeLayout::Resource {
                            kind: BindingKind::StorageBuffer,
                            element_stride: 32,
                        },
                        ParameterOffsets::slot(1),
                    ),
                ],
                uniform_size: 0,
            },
            ParameterOffsets::default(),
        );

        let out = reflect_program(&program(root)).unwrap();

        let albedo = &out.bindings["albedo"];
        assert_eq!(albedo.kind, BindingKind::CombinedImageSampler);
        assert_eq!((albedo.set, albedo.slot), (0, 0));
        let vertices = &out.bindings["vertices"];
        assert_eq!(vertices.kind, BindingKind::StorageBuffer);
        assert_eq!(vertices.stride, 32);
        assert_eq!((vertices.set, vertices.slot), (0, 1));
    }

    #[test]
    fn unbounded_resource_arrays_are_variable_size() {
        let root = VariableLayout::anonymous(
            TypeLayout::Struct {
                fields: vec![VariableLayout::new(
                    "textures",
                    TypeLayout::Array {
                        element: Box::new(TypeLayout::Resource {
                            kind: BindingKind::SampledImage,
                            element_stride: 0,
                        }),
                        element_stride: 0,
                        element_count: 0,
                    },
                    ParameterOffsets::slot(2),
                )],
                uniform_size: 0,
            },
            ParameterOffsets::default(),
        );

        let out = reflect_program(&program(root)).unwrap();

        let textures = &out.bindings["textures"];
        assert!(textures.is_variable_size);
        assert_eq!(textures.array_element_count, 0);
        assert_eq!(textures.slot, 2);
    }

    #[test]
    fn parameter_block_owns_a_private_set() {
        // ParameterBlock<Material> with uniform data and one texture: the
        // block's set comes from the sub-element space, its uniform data
        // gets the implicit block at slot 0, the texture sits at slot 1.
        let material = VariableLayout::new(
            "material",
            TypeLayout::ParameterBlock {
                element: Box::new(VariableLayout::anonymous(
                    TypeLayout::Struct {
                        fields: vec![
                            field("roughness", 0, value(4)),
                            VariableLayout::new(
                                "normal_map",
                                TypeLayout::Resource {
                                    kind: BindingKind::SampledImage,
                                    element_stride: 0,
                                },
                                ParameterOffsets::slot(1),
                            ),
                        ],
                        uniform_size: 4,
                    },
                    ParameterOffsets::default(),
                )),
            },
            ParameterOffsets {
                sub_element: 1,
                ..ParameterOffsets::default()
            },
        );

        let root = VariableLayout::anonymous(
            TypeLayout::Struct {
                fields: vec![material],
                uniform_size: 0,
            },
            ParameterOffsets::default(),
        );

        let out = reflect_program(&program(root)).unwrap();

        let roughness = &out.bindings["material.roughness"];
        assert_eq!((roughness.set, roughness.slot), (1, 0));
        let normal_map = &out.bindings["material.normal_map"];
        assert_eq!((normal_map.set, normal_map.slot), (1, 1));
        assert_eq!(out.uniform_block_order, vec![(1, 0)]);
    }

    #[test]
    fn anonymous_leaf_is_a_hard_error() {
        let root = VariableLayout::anonymous(
            TypeLayout::Struct {
                fields: vec![VariableLayout::anonymous(
                    TypeLayout::Resource {
                        kind: BindingKind::StorageImage,
                        element_stride: 0,
                    },
                    ParameterOffsets::slot(0),
                )],
                uniform_size: 0,
            },
            ParameterOffsets::default(),
        );

        let err = reflect_program(&program(root)).unwrap_err();
        assert!(matches!(err, ReflectError::UnnamedParameter { .. }));
    }

    #[test]
    fn out_of_range_set_is_rejected() {
        let root = VariableLayout::anonymous(
            TypeLayout::Struct {
                fields: vec![VariableLayout::new(
                    "t",
                    TypeLayout::Resource {
                        kind: BindingKind::SampledImage,
                        element_stride: 0,
                    },
                    ParameterOffsets {
                        space: MAX_DESCRIPTOR_SETS as u32,
                        ..ParameterOffsets::default()
                    },
                )],
                uniform_size: 0,
            },
            ParameterOffsets::default(),
        );

        let err = reflect_program(&program(root)).unwrap_err();
        assert_eq!(
            err,
            ReflectError::SetIndexOutOfRange {
                set: MAX_DESCRIPTOR_SETS as u32,
            },
        );
    }

    #[test]
    fn zero_size_fields_are_skipped() {
        let root = VariableLayout::anonymous(
            TypeLayout::Struct {
                fields: vec![VariableLayout::new(
                    "empty",
                    TypeLayout::ConstantBuffer {
                        element: Box::new(VariableLayout::anonymous(
                            TypeLayout::Struct {
                                fields: vec![field("nothing", 0, value(0))],
                                uniform_size: 0,
                            },
                            ParameterOffsets::default(),
                        )),
                        push_constant: false,
                    },
                    ParameterOffsets::slot(0),
                )],
                uniform_size: 0,
            },
            ParameterOffsets::default(),
        );

        let out = reflect_program(&program(root)).unwrap();
        assert!(out.bindings.is_empty());
        assert!(out.uniform_block_order.is_empty());
    }
}
