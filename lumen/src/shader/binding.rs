//! Resolved bindings and the per-module buffer layout derived from them.

use super::layout::BindingKind;
use crate::align_up;
use ash::vk;
use foldhash::HashMap;

/// A parameter name resolved to GPU coordinates.
///
/// Created once during reflection and immutable afterwards. For push-constant
/// members, `set` is the push-constant range index and `offset` is the byte
/// offset within the module's concatenated push-constant payload; for uniform
/// members, `offset` is the byte offset within the module's packed uniform
/// buffer. Resources carry descriptor coordinates only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Binding {
    pub set: u32,
    pub slot: u32,
    pub offset: u64,
    pub size: u64,
    /// Per-element byte stride; 0 unless the parameter is an array or a
    /// structured buffer.
    pub stride: u64,
    /// Total array element count; 0 means unbounded.
    pub array_element_count: u64,
    pub kind: BindingKind,
    pub is_push_constant: bool,
    pub is_variable_size: bool,
}

/// Flat name → binding map for one shader module. Keys are dotted paths
/// mirroring the nesting in the shader source (`"light.position"`).
pub type BindingTable = HashMap<String, Binding>;

/// One distinct uniform block and its place in the module's packed buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniformBlockInfo {
    pub set: u32,
    pub slot: u32,
    /// Aggregate block size: the maximum field end-offset observed.
    pub size: u64,
    /// Byte offset of the block within the packed per-frame buffer; always a
    /// multiple of the device's minimum uniform-buffer offset alignment.
    pub offset: u64,
}

/// Collapses the uniform-buffer bindings of a table into distinct
/// `(set, slot)` blocks, lays the blocks out back-to-back with `alignment`
/// padding between them, and rebases every member binding's offset from
/// block-relative to buffer-absolute.
///
/// `block_order` is the declaration order of the blocks, as discovered by the
/// layout walker; packing follows it so offsets are reproducible. Returns the
/// block list and the total buffer size to allocate per frame.
pub(crate) fn pack_uniform_blocks(
    bindings: &mut BindingTable,
    block_order: &[(u32, u32)],
    alignment: u64,
) -> (Vec<UniformBlockInfo>, u64) {
    let mut blocks = Vec::with_capacity(block_order.len());
    let mut cursor = 0;

    for &(set, slot) in block_order {
        let size = bindings
            .values()
            .filter(|b| !b.is_push_constant && b.kind == BindingKind::UniformBuffer)
            .filter(|b| (b.set, b.slot) == (set, slot))
            .map(|b| b.offset + b.size)
            .max()
            .unwrap_or(0);

        if size == 0 {
            continue;
        }

        let offset = if alignment != 0 {
            align_up(cursor, alignment)
        } else {
            cursor
        };

        for binding in bindings.values_mut() {
            if !binding.is_push_constant
                && binding.kind == BindingKind::UniformBuffer
                && (binding.set, binding.slot) == (set, slot)
            {
                binding.offset += offset;
            }
        }

        blocks.push(UniformBlockInfo {
            set,
            slot,
            size,
            offset,
        });
        cursor = offset + size;
    }

    (blocks, cursor)
}

/// Rebases push-constant member offsets into the module's single
/// concatenated payload and computes the module's net range.
///
/// `block_sizes[i]` is the byte size of push-constant block `i` in
/// declaration order; each member's base offset is the sum of the sizes of
/// the blocks before its own. The net range covers `min offset .. total`
/// with the owning stage's visibility.
pub(crate) fn resolve_push_constants(
    bindings: &mut BindingTable,
    block_sizes: &[u64],
    stage_flags: vk::ShaderStageFlags,
) -> vk::PushConstantRange {
    let mut total: u64 = block_sizes.iter().sum();
    let mut initial_offset = u64::MAX;

    for binding in bindings.values_mut() {
        if !binding.is_push_constant {
            continue;
        }

        let base: u64 = block_sizes[..binding.set as usize].iter().sum();
        binding.offset += base;
        initial_offset = initial_offset.min(binding.offset);
    }

    if initial_offset == u64::MAX {
        total = 0;
        initial_offset = 0;
    }

    vk::PushConstantRange {
        stage_flags,
        offset: initial_offset as u32,
        size: total as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_member(set: u32, slot: u32, offset: u64, size: u64) -> Binding {
        Binding {
            set,
            slot,
            offset,
            size,
            stride: 0,
            array_element_count: 0,
            kind: BindingKind::UniformBuffer,
            is_push_constant: false,
            is_variable_size: false,
        }
    }

    fn push_constant_member(range: u32, offset: u64, size: u64) -> Binding {
        Binding {
            set: range,
            slot: 0,
            offset,
            size,
            stride: 0,
            array_element_count: 0,
            kind: BindingKind::PushConstant,
            is_push_constant: true,
            is_variable_size: false,
        }
    }

    #[test]
    fn packing_respects_alignment_and_order() {
        // Three blocks of sizes 28, 64 and 4 with a 256-byte alignment:
        // offsets must be 0, 256 and 512.
        let mut bindings = BindingTable::default();
        bindings.insert("a".into(), uniform_member(0, 0, 0, 4));
        bindings.insert("b".into(), uniform_member(0, 0, 16, 12));
        bindings.insert("c".into(), uniform_member(0, 1, 0, 64));
        bindings.insert("d".into(), uniform_member(1, 0, 0, 4));

        let order = [(0, 0), (0, 1), (1, 0)];
        let (blocks, total) = pack_uniform_blocks(&mut bindings, &order, 256);

        assert_eq!(
            blocks,
            vec![
                UniformBlockInfo {
                    set: 0,
                    slot: 0,
                    size: 28,
                    offset: 0,
                },
                UniformBlockInfo {
                    set: 0,
                    slot: 1,
                    size: 64,
                    offset: 256,
                },
                UniformBlockInfo {
                    set: 1,
                    slot: 0,
                    size: 4,
                    offset: 512,
                },
            ],
        );
        assert_eq!(total, 516);

        // Member offsets were rebased to buffer-absolute positions.
        assert_eq!(bindings["a"].offset, 0);
        assert_eq!(bindings["b"].offset, 16);
        assert_eq!(bindings["c"].offset, 256);
        assert_eq!(bindings["d"].offset, 512);
    }

    #[test]
    fn packing_offsets_satisfy_the_alignment_law() {
        let sizes = [100u64, 28, 256, 1, 60];
        let alignment = 64;

        let mut bindings = BindingTable::default();
        let mut order = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            bindings.insert(format!("p{}", i), uniform_member(0, i as u32, 0, size));
            order.push((0, i as u32));
        }

        let (blocks, _) = pack_uniform_blocks(&mut bindings, &order, alignment);

        assert_eq!(blocks[0].offset, 0);
        for i in 1..blocks.len() {
            let end = blocks[i - 1].offset + blocks[i - 1].size;
            assert_eq!(blocks[i].offset, align_up(end, alignment));
        }
    }

    #[test]
    fn zero_sized_blocks_are_dropped() {
        let mut bindings = BindingTable::default();
        bindings.insert("x".into(), uniform_member(0, 0, 0, 16));

        // (0, 7) has no members contributing bytes.
        let order = [(0, 7), (0, 0)];
        let (blocks, total) = pack_uniform_blocks(&mut bindings, &order, 64);

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].slot, 0);
        assert_eq!(total, 16);
    }

    #[test]
    fn push_constant_members_rebase_by_earlier_blocks() {
        let mut bindings = BindingTable::default();
        bindings.insert("first.a".into(), push_constant_member(0, 0, 8));
        bindings.insert("first.b".into(), push_constant_member(0, 8, 8));
        bindings.insert("second.c".into(), push_constant_member(1, 0, 4));

        let range = resolve_push_constants(
            &mut bindings,
            &[16, 4],
            vk::ShaderStageFlags::COMPUTE,
        );

        assert_eq!(range.offset, 0);
        assert_eq!(range.size, 20);
        assert_eq!(bindings["first.a"].offset, 0);
        assert_eq!(bindings["first.b"].offset, 8);
        // Members of the second block start after the first block's bytes.
        assert_eq!(bindings["second.c"].offset, 16);
    }

    #[test]
    fn no_push_constants_yields_an_empty_range() {
        let mut bindings = BindingTable::default();
        bindings.insert("u".into(), uniform_member(0, 0, 0, 4));

        let range =
            resolve_push_constants(&mut bindings, &[], vk::ShaderStageFlags::VERTEX);

        assert_eq!(range.offset, 0);
        assert_eq!(range.size, 0);
    }
}
