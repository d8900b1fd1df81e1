//! Lowering of abstract operations to native QPU instruction sequences.
//!
//! The helpers in this crate are the vocabulary the rest of the compiler uses
//! for anything that is not a single ALU instruction: vector rotation and
//! shuffling, sign manipulation, extensions and saturation, pointer index
//! calculation, SFU/TMU/VPM access sequences, and the intrinsics and
//! arithmetic legalization pass that rewrites front-end operations into them.
//! Every helper consumes an [`InstructionWalker`], inserts its sequence at the
//! walker position and returns the advanced walker, so sequences compose.

use quill_diag::{CompilationError, CompilationStep, DiagnosticBag, Result};
use quill_isa::{
    AddressSpace, ConditionCode, DataType, Literal, OpCode, Register, SmallImmediate,
    PACK_32_32_SATURATE, PACK_32_8888, PACK_INT_TO_CHAR_TRUNCATE,
    PACK_INT_TO_SIGNED_SHORT_SATURATE, PACK_INT_TO_UNSIGNED_CHAR_SATURATE,
    PACK_INT_TO_USHORT_TRUNCATE, REG_ACC5, REG_QPU_NUMBER, REG_SFU_EXP2, REG_SFU_LOG2,
    REG_SFU_OUT, REG_SFU_RECIP, REG_SFU_RECIP_SQRT, REG_TMU0_ADDRESS, REG_VPM_DMA_LOAD_ADDR,
    REG_VPM_DMA_LOAD_WAIT, REG_VPM_DMA_STORE_ADDR, REG_VPM_DMA_STORE_WAIT, REG_VPM_IN_SETUP,
    REG_VPM_IO, REG_VPM_OUT_SETUP, ROTATION_BY_R5, TYPE_FLOAT, TYPE_INT32, TYPE_INT8,
    UNPACK_BYTE0_32, UNPACK_BYTE1_32, UNPACK_BYTE2_32, UNPACK_BYTE3_32, UNPACK_SHORT_TO_INT_SEXT,
    OP_ADD, OP_AND, OP_ASR, OP_CLZ, OP_FADD, OP_FMAX, OP_FMAXABS, OP_FMIN, OP_FMINABS, OP_FMUL,
    OP_FSUB, OP_FTOI, OP_ITOF, OP_MAX, OP_MIN, OP_MUL24, OP_NOT, OP_OR, OP_ROR, OP_SHL, OP_SHR,
    OP_SUB, OP_XOR, Pack, Signal, Unpack, PACK_NOP, UNPACK_NOP,
};
use quill_ir::{
    Decorations, DelayReason, Instruction, InstructionKind, InstructionWalker, Method,
    OpSpec, Value, ValueKind, ELEMENT_NUMBER_REGISTER, GLOBAL_OFFSET_X, GLOBAL_OFFSET_Y,
    GLOBAL_OFFSET_Z, GROUP_ID_X, GROUP_ID_Y, GROUP_ID_Z, INT_ONE, INT_ZERO, LOCAL_IDS,
    LOCAL_SIZES, NOP_REGISTER, NUM_GROUPS_X, NUM_GROUPS_Y, NUM_GROUPS_Z, ROTATION_REGISTER,
    UNDEFINED_VALUE, WORK_DIMENSIONS,
};

/// Marker literal appended to an intrinsic call to flag an unsigned operation.
pub const UNSIGNED_MARKER: i64 = 1;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MathType {
    Strict,
    Fast,
    Full,
}

#[derive(Copy, Clone, Debug)]
pub struct LoweringOptions {
    pub math: MathType,
}

impl Default for LoweringOptions {
    fn default() -> Self {
        Self {
            math: MathType::Strict,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Direction {
    Up,
    Down,
}

fn opt_err(message: &str, value: impl std::fmt::Display) -> CompilationError {
    CompilationError::with_value(CompilationStep::Optimizer, message, value)
}

// ---------------------------------------------------------------------------
// Vector helpers
// ---------------------------------------------------------------------------

/// Rotate the 16 lanes of `src` by `offset` lanes in the given direction,
/// writing `dest`.
///
/// The rotation executes on the MUL ALU with the amount in a small immediate;
/// its input must be an accumulator and must not have been written by the
/// immediately preceding instruction, so a wait-register nop precedes every
/// non-zero rotation.
pub fn insert_vector_rotation<'m>(
    mut it: InstructionWalker<'m>,
    src: &Value,
    offset: &Value,
    dest: &Value,
    direction: Direction,
) -> Result<InstructionWalker<'m>> {
    // all lanes of a literal are identical, nothing to rotate
    if src.is_literal_value() {
        it.emplace(Instruction::mov(dest.clone(), src.clone()));
        it.next_in_block();
        return Ok(it);
    }

    let rotation_immediate = |amount: i64| -> Result<Option<Value>> {
        let amount = match direction {
            Direction::Up => amount.rem_euclid(16),
            Direction::Down => (16 - amount.rem_euclid(16)) % 16,
        };
        if amount == 0 {
            return Ok(None);
        }
        let imm = SmallImmediate::from_rotation_offset(amount as u8)
            .ok_or_else(|| opt_err("Invalid vector-rotation offset", amount))?;
        Ok(Some(Value::small_imm(imm, TYPE_INT8)))
    };

    let applied = if let ValueKind::Literal(lit) = &offset.kind {
        rotation_immediate(lit.integer())?
    } else if let Some(imm) = offset.small_immediate() {
        match imm.integer_value() {
            // rotated by an offset constant, not a rotation constant yet
            Some(value) => rotation_immediate(i64::from(value))?,
            None => Some(offset.clone()),
        }
    } else {
        // dynamic offset: write it into r5
        match direction {
            Direction::Up => {
                it.emplace(Instruction::mov(ROTATION_REGISTER, offset.clone()));
                it.next_in_block();
            }
            Direction::Down => {
                // set flags to exclude the 16 - 0 = 16 case
                it.emplace(Instruction::mov(NOP_REGISTER, offset.clone()).with_set_flags());
                it.next_in_block();
                it.emplace(
                    Instruction::binary(
                        OP_SUB,
                        ROTATION_REGISTER,
                        Value::int(16, TYPE_INT8),
                        offset.clone(),
                    )
                    .with_condition(ConditionCode::ZeroClear),
                );
                it.next_in_block();
                it.emplace(
                    Instruction::mov(ROTATION_REGISTER, INT_ZERO)
                        .with_condition(ConditionCode::ZeroSet),
                );
                it.next_in_block();
            }
        }
        Some(Value::small_imm(ROTATION_BY_R5, TYPE_INT8))
    };

    match applied {
        None => {
            // a rotation by zero is a plain move
            it.emplace(Instruction::mov(dest.clone(), src.clone()));
        }
        Some(applied) => {
            // the rotated value must not be written in the previous instruction
            it.emplace(Instruction::nop(DelayReason::WaitRegister));
            it.next_in_block();
            it.emplace(Instruction::rotation(dest.clone(), src.clone(), applied));
        }
    }
    it.next_in_block();
    Ok(it)
}

/// Broadcast `src` to all lanes via the replication register, optionally
/// materializing the result in `dest`.
pub fn insert_replication<'m>(
    mut it: InstructionWalker<'m>,
    src: &Value,
    dest: &Value,
    use_destination: bool,
) -> Result<InstructionWalker<'m>> {
    it.emplace(Instruction::mov(
        Value::register(REG_ACC5, src.ty.clone()),
        src.clone(),
    ));
    it.next_in_block();
    if use_destination {
        // reading r5 returns the per-quad value replicated over the quad
        it.emplace(Instruction::mov(
            dest.clone(),
            Value::register(REG_ACC5, src.ty.clone()),
        ));
        it.next_in_block();
    }
    Ok(it)
}

/// Extract lane `index` of `container` into the scalar `dest` by rotating the
/// container down, which puts the requested lane at position 0.
pub fn insert_vector_extraction<'m>(
    mut it: InstructionWalker<'m>,
    container: &Value,
    index: &Value,
    dest: &Value,
) -> Result<InstructionWalker<'m>> {
    if container.is_literal_value() {
        // all lanes of a literal are the same
        it.emplace(Instruction::mov(dest.clone(), container.clone()));
        it.next_in_block();
        return Ok(it);
    }
    insert_vector_rotation(it, container, index, dest, Direction::Down)
}

/// Insert the scalar `value` at lane `index` of `container`: rotate the value
/// up into position, then conditionally move it under the predicate
/// `element_number == index`.
pub fn insert_vector_insertion<'m>(
    mut it: InstructionWalker<'m>,
    container: &Value,
    index: &Value,
    value: &Value,
) -> Result<InstructionWalker<'m>> {
    let tmp = it
        .method_mut()
        .add_new_local(container.ty.element_type(), "%vector_insert");
    it = insert_vector_rotation(it, value, index, &tmp, Direction::Up)?;
    it.emplace(
        Instruction::binary(
            OP_XOR,
            NOP_REGISTER,
            ELEMENT_NUMBER_REGISTER,
            index.clone(),
        )
        .with_set_flags(),
    );
    it.next_in_block();
    it.emplace(
        Instruction::mov(container.clone(), tmp)
            .with_condition(ConditionCode::ZeroSet)
            .with_decorations(Decorations::ELEMENT_INSERTION),
    );
    it.next_in_block();
    Ok(it)
}

fn indices_not_undefined(mask: &[Value], start: usize) -> bool {
    mask.iter().skip(start).all(|index| !index.is_undefined())
}

/// Shuffle two source vectors into `destination` according to a constant
/// `mask` of lane indices. Indices below the width of `source0` address it,
/// the rest address `source1`; undefined mask lanes write nothing.
pub fn insert_vector_shuffle<'m>(
    mut it: InstructionWalker<'m>,
    destination: &Value,
    source0: &Value,
    source1: &Value,
    mask: &Value,
) -> Result<InstructionWalker<'m>> {
    if mask.is_undefined() {
        return Err(CompilationError::with_value(
            CompilationStep::General,
            "Cannot shuffle a vector with an undefined mask",
            mask,
        ));
    }
    if mask.is_zero_initializer() {
        // every lane takes lane 0 of the first source
        return insert_replication(it, source0, destination, true);
    }
    let Some(mask_elements) = mask.container_elements().map(<[Value]>::to_vec) else {
        return Err(CompilationError::with_value(
            CompilationStep::General,
            "Shuffling vectors with non-constant mask-layout is not supported yet",
            mask,
        ));
    };

    let source0_width = usize::from(source0.ty.vector_width());
    if mask.container_is_element_number() {
        if mask_elements.len() > source0_width
            && indices_not_undefined(&mask_elements, source0_width)
        {
            // TODO: also copy the overlapping indices out of the second source
            return Err(CompilationError::with_value(
                CompilationStep::General,
                "Copying corresponding indices with second container is not yet supported",
                mask,
            ));
        }
        // the vector is copied in order
        it.emplace(Instruction::mov(destination.clone(), source0.clone()));
        it.next_in_block();
        return Ok(it);
    }

    if mask.container_is_all_same() {
        let index = mask_elements
            .iter()
            .find_map(Value::literal_value)
            .map_or(0, |lit| lit.integer());
        let (source, index) = if (index as usize) < source0_width {
            (source0, index)
        } else {
            (source1, index - source0_width as i64)
        };
        let tmp = if index == 0 {
            source.clone()
        } else {
            let tmp = it
                .method_mut()
                .add_new_local(source.ty.clone(), "%vector_shuffle");
            it = insert_vector_rotation(
                it,
                source,
                &Value::int(index, TYPE_INT8),
                &tmp,
                Direction::Down,
            )?;
            tmp
        };
        return insert_replication(it, &tmp, destination, true);
    }

    // zero the destination first so register allocation sees an unconditional
    // write before the conditional lane insertions
    if let Some(dest_local) = destination.local_id() {
        if it.method().local(dest_local).writers().is_empty() {
            it.emplace(Instruction::mov(destination.clone(), INT_ZERO));
            it.next_in_block();
        }
    }

    for (lane, index) in mask_elements.iter().enumerate() {
        if index.is_undefined() {
            // nothing is written at this position
            continue;
        }
        let Some(index_literal) = index.literal_value() else {
            return Err(CompilationError::with_value(
                CompilationStep::General,
                "Invalid mask value",
                mask,
            ));
        };
        let mut index_value = index_literal.integer();
        let container = if (index_value as usize) < source0_width {
            source0
        } else {
            index_value -= source0_width as i64;
            source1
        };
        let tmp = it
            .method_mut()
            .add_new_local(container.ty.element_type(), "%vector_shuffle");
        it = insert_vector_extraction(
            it,
            container,
            &Value::int(index_value, TYPE_INT8),
            &tmp,
        )?;
        it = insert_vector_insertion(
            it,
            destination,
            &Value::int(lane as i64, TYPE_INT8),
            &tmp,
        )?;
    }
    Ok(it)
}

// ---------------------------------------------------------------------------
// Sign helpers
// ---------------------------------------------------------------------------

/// Compute `|src|` without branching and return the value holding it. For
/// literals and containers the result is computed statically.
pub fn insert_make_positive<'m>(
    mut it: InstructionWalker<'m>,
    src: &Value,
) -> Result<(InstructionWalker<'m>, Value)> {
    if let ValueKind::Literal(lit) = &src.kind {
        let value = Value::literal(Literal::Int(lit.integer().abs()), src.ty.clone());
        return Ok((it, value));
    }
    if let Some(elements) = src.container_elements() {
        let mut absolutes = Vec::with_capacity(elements.len());
        for elem in elements {
            let Some(lit) = elem.literal_value() else {
                return Err(opt_err(
                    "Can't handle container with non-literal values",
                    src,
                ));
            };
            absolutes.push(Value::literal(
                Literal::Int(lit.integer().abs()),
                elem.ty.clone(),
            ));
        }
        return Ok((it, Value::container(absolutes, src.ty.clone())));
    }

    let dest = it.method_mut().add_new_local(src.ty.clone(), "%unsigned");
    // sign bit into the flags
    it.emplace(
        Instruction::binary(
            OP_SHR,
            NOP_REGISTER,
            src.clone(),
            Value::int(i64::from(src.ty.scalar_bit_count()) - 1, TYPE_INT8),
        )
        .with_set_flags(),
    );
    it.next_in_block();
    // two's complement: flip all bits, add one
    let tmp = it
        .method_mut()
        .add_new_local(src.ty.clone(), "%twos_complement");
    it.emplace(
        Instruction::unary(OP_NOT, tmp.clone(), src.clone())
            .with_condition(ConditionCode::ZeroClear),
    );
    it.next_in_block();
    it.emplace(
        Instruction::binary(OP_ADD, dest.clone(), tmp, INT_ONE)
            .with_condition(ConditionCode::ZeroClear),
    );
    it.next_in_block();
    // already positive numbers are simply copied
    it.emplace(
        Instruction::mov(dest.clone(), src.clone()).with_condition(ConditionCode::ZeroSet),
    );
    it.next_in_block();
    Ok((it, dest))
}

/// Write `-src` into `dest` under `cond`, and `src` under the inverted
/// condition.
pub fn insert_invert_sign<'m>(
    mut it: InstructionWalker<'m>,
    src: &Value,
    dest: &Value,
    cond: ConditionCode,
) -> Result<InstructionWalker<'m>> {
    if let ValueKind::Literal(lit) = &src.kind {
        it.emplace(
            Instruction::mov(
                dest.clone(),
                Value::literal(Literal::Int(-lit.integer()), src.ty.clone()),
            )
            .with_condition(cond),
        );
        it.next_in_block();
        it.emplace(Instruction::mov(dest.clone(), src.clone()).with_condition(cond.invert()));
        it.next_in_block();
        return Ok(it);
    }
    let tmp = it
        .method_mut()
        .add_new_local(src.ty.clone(), "%twos_complement");
    it.emplace(Instruction::unary(OP_NOT, tmp.clone(), src.clone()).with_condition(cond));
    it.next_in_block();
    it.emplace(Instruction::binary(OP_ADD, dest.clone(), tmp, INT_ONE).with_condition(cond));
    it.next_in_block();
    it.emplace(Instruction::mov(dest.clone(), src.clone()).with_condition(cond.invert()));
    it.next_in_block();
    Ok(it)
}

/// Produce 0 for non-negative and all-ones for negative inputs, so two sign
/// values can be combined with xor.
pub fn insert_is_negative<'m>(
    mut it: InstructionWalker<'m>,
    src: &Value,
) -> Result<(InstructionWalker<'m>, Value)> {
    if let Some(lit) = src.literal_value() {
        let sign = if lit.integer() < 0 { -1 } else { 0 };
        return Ok((it, Value::int(sign, TYPE_INT32)));
    }
    if let Some(elements) = src.container_elements() {
        let mut signs = Vec::with_capacity(elements.len());
        for elem in elements {
            let Some(lit) = elem.literal_value() else {
                return Err(opt_err(
                    "Can't handle container with non-literal values",
                    src,
                ));
            };
            let sign = if lit.integer() < 0 { -1 } else { 0 };
            signs.push(Value::int(sign, TYPE_INT32));
        }
        return Ok((it, Value::container(signs, src.ty.to_vector(elements.len() as u8))));
    }
    let dest = it.method_mut().add_new_local(TYPE_INT32, "%sign");
    it.emplace(Instruction::binary(
        OP_ASR,
        dest.clone(),
        src.clone(),
        Value::int(i64::from(src.ty.scalar_bit_count()) - 1, TYPE_INT8),
    ));
    it.next_in_block();
    Ok((it, dest))
}

// ---------------------------------------------------------------------------
// Extension, saturation and float conversion
// ---------------------------------------------------------------------------

/// Zero-extend a narrow value to 32 bit by masking with the source width.
pub fn insert_zero_extension<'m>(
    mut it: InstructionWalker<'m>,
    src: &Value,
    dest: &Value,
    cond: ConditionCode,
    set_flags: bool,
) -> Result<InstructionWalker<'m>> {
    let mut inst = if src.ty.scalar_bit_count() >= 32 {
        Instruction::mov(dest.clone(), src.clone())
    } else if let Some(lit) = src.literal_value() {
        let masked = lit.to_immediate() & src.ty.scalar_width_mask();
        Instruction::mov(dest.clone(), Value::int(i64::from(masked), dest.ty.clone()))
    } else {
        Instruction::binary(
            OP_AND,
            dest.clone(),
            src.clone(),
            Value::int(i64::from(src.ty.scalar_width_mask()), TYPE_INT32),
        )
    };
    inst = inst.with_condition(cond).with_decorations(Decorations::UNSIGNED_RESULT);
    if set_flags {
        inst = inst.with_set_flags();
    }
    it.emplace(inst);
    it.next_in_block();
    Ok(it)
}

/// Sign-extend a narrow value to 32 bit by shifting left and arithmetic
/// shifting right by the same amount.
pub fn insert_sign_extension<'m>(
    mut it: InstructionWalker<'m>,
    src: &Value,
    dest: &Value,
    cond: ConditionCode,
    set_flags: bool,
) -> Result<InstructionWalker<'m>> {
    let bits = i64::from(src.ty.scalar_bit_count());
    if bits >= 32 {
        it.emplace(Instruction::mov(dest.clone(), src.clone()).with_condition(cond));
        it.next_in_block();
        return Ok(it);
    }
    if let Some(lit) = src.literal_value() {
        let shifted = (lit.to_immediate() as i32) << (32 - bits) >> (32 - bits);
        it.emplace(
            Instruction::mov(dest.clone(), Value::int(i64::from(shifted), dest.ty.clone()))
                .with_condition(cond),
        );
        it.next_in_block();
        return Ok(it);
    }
    let shift = Value::int(32 - bits, TYPE_INT8);
    let tmp = it.method_mut().add_new_local(TYPE_INT32, "%sext");
    it.emplace(
        Instruction::binary(OP_SHL, tmp.clone(), src.clone(), shift.clone()).with_condition(cond),
    );
    it.next_in_block();
    let mut inst = Instruction::binary(OP_ASR, dest.clone(), tmp, shift).with_condition(cond);
    if set_flags {
        inst = inst.with_set_flags();
    }
    it.emplace(inst);
    it.next_in_block();
    Ok(it)
}

fn static_saturation(value: i64, bits: u8, is_signed: bool) -> i64 {
    match (bits, is_signed) {
        (8, true) => value.clamp(-128, 127),
        (8, false) => value.clamp(0, 255),
        (16, true) => value.clamp(-32768, 32767),
        (16, false) => value.clamp(0, 65535),
        (_, true) => value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)),
        (_, false) => value.clamp(0, i64::from(u32::MAX)),
    }
}

/// Saturate a 32-bit value into the limits of the destination type using the
/// hardware pack modes; literal inputs are clamped statically.
pub fn insert_saturation<'m>(
    mut it: InstructionWalker<'m>,
    src: &Value,
    dest: &Value,
    is_signed: bool,
) -> Result<InstructionWalker<'m>> {
    if let Some(lit) = src.literal_value() {
        let clamped = static_saturation(lit.integer(), dest.ty.scalar_bit_count(), is_signed);
        it.emplace(Instruction::mov(
            dest.clone(),
            Value::int(clamped, dest.ty.clone()),
        ));
        it.next_in_block();
        return Ok(it);
    }
    let pack = match (dest.ty.scalar_bit_count(), is_signed) {
        (8, true) => PACK_INT_TO_CHAR_TRUNCATE,
        (8, false) => PACK_INT_TO_UNSIGNED_CHAR_SATURATE,
        (16, true) => PACK_INT_TO_SIGNED_SHORT_SATURATE,
        (16, false) => PACK_INT_TO_USHORT_TRUNCATE,
        _ => PACK_32_32_SATURATE,
    };
    it.emplace(Instruction::mov(dest.clone(), src.clone()).with_pack(pack));
    it.next_in_block();
    Ok(it)
}

/// Convert between the two float widths with the pack/unpack units.
pub fn insert_float_conversion<'m>(
    mut it: InstructionWalker<'m>,
    src: &Value,
    dest: &Value,
) -> Result<InstructionWalker<'m>> {
    let src_bits = src.ty.scalar_bit_count();
    let dest_bits = dest.ty.scalar_bit_count();
    match (src_bits, dest_bits) {
        (32, 16) => {
            it.emplace(
                Instruction::mov(dest.clone(), src.clone()).with_pack(PACK_INT_TO_USHORT_TRUNCATE),
            );
        }
        (16, 32) => {
            it.emplace(
                Instruction::mov(dest.clone(), src.clone()).with_unpack(UNPACK_SHORT_TO_INT_SEXT),
            );
        }
        (32, 32) => {
            it.emplace(Instruction::mov(dest.clone(), src.clone()));
        }
        _ => {
            return Err(opt_err(
                "Unsupported floating-point conversion widths",
                format!("{} -> {}", src.ty, dest.ty),
            ))
        }
    }
    it.next_in_block();
    Ok(it)
}

// ---------------------------------------------------------------------------
// Index calculation
// ---------------------------------------------------------------------------

/// Walk a chain of indices into a pointer/array/struct, accumulating a byte
/// offset and producing the final pointer with one add. The destination local
/// records a reference to the base local and the first index, so later passes
/// can recover which parameter the pointer aliases.
pub fn insert_calculate_indices<'m>(
    mut it: InstructionWalker<'m>,
    container: &Value,
    dest: &Value,
    indices: &[Value],
    first_index_is_element: bool,
) -> Result<InstructionWalker<'m>> {
    let mut offset = INT_ZERO;
    let space = container.ty.address_space().unwrap_or(AddressSpace::Generic);
    // current type the next index steps into; pointers step over their
    // pointee, aggregates over their members
    let mut current = if first_index_is_element {
        container.ty.clone()
    } else {
        container.ty.element_type()
    };
    for (position, index) in indices.iter().enumerate() {
        let sub_offset;
        let struct_level = match &current {
            DataType::Struct { .. } => Some(current.clone()),
            DataType::Pointer { pointee, .. } if matches!(**pointee, DataType::Struct { .. }) => {
                Some((**pointee).clone())
            }
            _ => None,
        };
        if position > 0 || !current.is_pointer() {
            if let Some(struct_ty) = struct_level {
                // struct members sit at fixed offsets, the index must be known
                let Some(lit) = index.literal_value() else {
                    return Err(CompilationError::with_value(
                        CompilationStep::LlvmToIr,
                        "Can't access struct-element with non-literal index",
                        it.method().render_value(index),
                    ));
                };
                let member = lit.integer() as usize;
                let member_offset = struct_ty.struct_element_offset(member).ok_or_else(|| {
                    CompilationError::with_value(
                        CompilationStep::LlvmToIr,
                        "Struct-element index out of range",
                        lit,
                    )
                })?;
                sub_offset = Value::int(i64::from(member_offset), TYPE_INT32);
                let member_ty = struct_ty
                    .struct_element(member)
                    .cloned()
                    .unwrap_or(DataType::Unknown);
                current = member_ty;
                offset = combine_offsets(&mut it, offset, sub_offset)?;
                continue;
            }
        }
        let element = current.element_type();
        if !current.is_pointer() && !matches!(current, DataType::Array { .. }) {
            return Err(CompilationError::with_value(
                CompilationStep::LlvmToIr,
                "Invalid container-type to retrieve element via index",
                current,
            ));
        }
        let element_width = i64::from(element.physical_width());
        if let Some(lit) = index.literal_value() {
            sub_offset = Value::int(lit.integer() * element_width, TYPE_INT32);
        } else {
            let tmp = it.method_mut().add_new_local(TYPE_INT32, "%index_offset");
            it.emplace(Instruction::named_op(
                "mul",
                tmp.clone(),
                index.clone(),
                Some(Value::int(element_width, TYPE_INT32)),
            ));
            it.next_in_block();
            sub_offset = tmp;
        }
        current = element;
        offset = combine_offsets(&mut it, offset, sub_offset)?;
    }

    it.emplace(Instruction::binary(
        OP_ADD,
        dest.clone(),
        container.clone(),
        offset,
    ));
    it.next_in_block();

    // associate the result with the base local, so input/output parameters are
    // still recognized through the pointer arithmetic
    if let (Some(dest_local), Some(base_local)) = (dest.local_id(), container.local_id()) {
        let ref_index = indices
            .first()
            .and_then(Value::literal_value)
            .map_or(quill_ir::ANY_ELEMENT, |lit| lit.integer() as i32);
        it.method_mut().local_mut(dest_local).reference = Some((base_local, ref_index));
    }

    let expected = DataType::pointer_to(current, space);
    if dest.ty.is_pointer() && dest.ty != expected {
        return Err(CompilationError::with_value(
            CompilationStep::LlvmToIr,
            "Types of retrieving indices do not match",
            expected,
        ));
    }
    Ok(it)
}

fn combine_offsets<'m>(
    it: &mut InstructionWalker<'m>,
    offset: Value,
    sub_offset: Value,
) -> Result<Value> {
    match (offset.literal_value(), sub_offset.literal_value()) {
        (Some(a), Some(b)) => Ok(Value::int(a.integer() + b.integer(), TYPE_INT32)),
        (Some(a), None) if a.integer() == 0 => Ok(sub_offset),
        (None, Some(b)) if b.integer() == 0 => Ok(offset),
        _ => {
            let tmp = it.method_mut().add_new_local(TYPE_INT32, "%index_offset");
            it.emplace(Instruction::binary(OP_ADD, tmp.clone(), offset, sub_offset));
            it.next_in_block();
            Ok(tmp)
        }
    }
}

// ---------------------------------------------------------------------------
// Periphery: SFU, TMU, VPM/DMA
// ---------------------------------------------------------------------------

/// Trigger an SFU calculation: write the argument into the SFU input register,
/// then wait the two mandatory delay instructions before r4 holds the result.
pub fn insert_sfu_call<'m>(
    mut it: InstructionWalker<'m>,
    sfu_register: Register,
    arg: &Value,
    cond: ConditionCode,
) -> Result<InstructionWalker<'m>> {
    it.emplace(
        Instruction::mov(Value::register(sfu_register, arg.ty.clone()), arg.clone())
            .with_condition(cond),
    );
    it.next_in_block();
    it.emplace(Instruction::nop(DelayReason::WaitSfu));
    it.next_in_block();
    it.emplace(Instruction::nop(DelayReason::WaitSfu));
    it.next_in_block();
    Ok(it)
}

/// Random-access read of one vector from memory through the TMU.
pub fn insert_tmu_read<'m>(
    mut it: InstructionWalker<'m>,
    dest: &Value,
    address: &Value,
) -> Result<InstructionWalker<'m>> {
    it.emplace(Instruction::mov(
        Value::register(REG_TMU0_ADDRESS, address.ty.clone()),
        address.clone(),
    ));
    it.next_in_block();
    it.emplace(Instruction::nop(DelayReason::WaitTmu).with_signal(Signal::LoadTmu0));
    it.next_in_block();
    it.emplace(Instruction::mov(
        dest.clone(),
        Value::register(REG_SFU_OUT, dest.ty.clone()),
    ));
    it.next_in_block();
    Ok(it)
}

/// VPM generic-block write setup for one row of the given element size.
fn vpm_write_setup(ty: &DataType) -> i64 {
    let size = match ty.element_type().physical_width() {
        1 => 0u32,
        2 => 1,
        _ => 2,
    };
    i64::from((size << 8) | 0xA00)
}

/// DMA store setup: one row of up to 16 elements from VPM to memory.
fn dma_store_setup(ty: &DataType) -> i64 {
    let units = u32::from(ty.vector_width().max(1));
    i64::from(0x8001_0000u32 | (units << 7)) & 0xFFFF_FFFF
}

/// DMA load setup: one row of up to 16 elements from memory into VPM.
fn dma_load_setup(ty: &DataType) -> i64 {
    let units = u32::from(ty.vector_width().max(1));
    i64::from(0x1001_0000u32 | (units << 8))
}

/// Write one vector to memory over the VPM/DMA path. The whole sequence holds
/// the hardware mutex, since the VPM setup registers are shared between QPUs.
pub fn insert_dma_write<'m>(
    mut it: InstructionWalker<'m>,
    value: &Value,
    address: &Value,
) -> Result<InstructionWalker<'m>> {
    it.emplace(Instruction::mutex(true));
    it.next_in_block();
    it.emplace(Instruction::load_immediate(
        Value::register(REG_VPM_OUT_SETUP, TYPE_INT32),
        Literal::Int(vpm_write_setup(&value.ty)),
    ));
    it.next_in_block();
    it.emplace(Instruction::mov(
        Value::register(REG_VPM_IO, value.ty.clone()),
        value.clone(),
    ));
    it.next_in_block();
    it.emplace(Instruction::load_immediate(
        Value::register(REG_VPM_OUT_SETUP, TYPE_INT32),
        Literal::Int(dma_store_setup(&value.ty)),
    ));
    it.next_in_block();
    it.emplace(Instruction::mov(
        Value::register(REG_VPM_DMA_STORE_ADDR, TYPE_INT32),
        address.clone(),
    ));
    it.next_in_block();
    // reading the wait register stalls until the store is finished
    it.emplace(Instruction::mov(
        NOP_REGISTER,
        Value::register(REG_VPM_DMA_STORE_WAIT, TYPE_INT32),
    ));
    it.next_in_block();
    it.emplace(Instruction::mutex(false));
    it.next_in_block();
    Ok(it)
}

/// Copy `num_bytes` from one memory area to another, staging rows through the
/// VPM in both directions.
pub fn insert_dma_copy<'m>(
    mut it: InstructionWalker<'m>,
    dest_address: &Value,
    src_address: &Value,
    elem_ty: &DataType,
    num_bytes: i64,
) -> Result<InstructionWalker<'m>> {
    let row_bytes = i64::from(elem_ty.physical_width().max(1)) * 16;
    let rows = (num_bytes + row_bytes - 1) / row_bytes;
    it.emplace(Instruction::mutex(true));
    it.next_in_block();
    for row in 0..rows {
        let byte_offset = row * row_bytes;
        let src = offset_address(&mut it, src_address, byte_offset)?;
        let dest = offset_address(&mut it, dest_address, byte_offset)?;
        it.emplace(Instruction::load_immediate(
            Value::register(REG_VPM_IN_SETUP, TYPE_INT32),
            Literal::Int(dma_load_setup(&elem_ty.to_vector(16))),
        ));
        it.next_in_block();
        it.emplace(Instruction::mov(
            Value::register(REG_VPM_DMA_LOAD_ADDR, TYPE_INT32),
            src,
        ));
        it.next_in_block();
        it.emplace(Instruction::mov(
            NOP_REGISTER,
            Value::register(REG_VPM_DMA_LOAD_WAIT, TYPE_INT32),
        ));
        it.next_in_block();
        it.emplace(Instruction::load_immediate(
            Value::register(REG_VPM_OUT_SETUP, TYPE_INT32),
            Literal::Int(dma_store_setup(&elem_ty.to_vector(16))),
        ));
        it.next_in_block();
        it.emplace(Instruction::mov(
            Value::register(REG_VPM_DMA_STORE_ADDR, TYPE_INT32),
            dest,
        ));
        it.next_in_block();
        it.emplace(Instruction::mov(
            NOP_REGISTER,
            Value::register(REG_VPM_DMA_STORE_WAIT, TYPE_INT32),
        ));
        it.next_in_block();
    }
    it.emplace(Instruction::mutex(false));
    it.next_in_block();
    Ok(it)
}

fn offset_address<'m>(
    it: &mut InstructionWalker<'m>,
    address: &Value,
    byte_offset: i64,
) -> Result<Value> {
    if byte_offset == 0 {
        return Ok(address.clone());
    }
    let tmp = it
        .method_mut()
        .add_new_local(address.ty.clone(), "%dma_addr");
    it.emplace(Instruction::binary(
        OP_ADD,
        tmp.clone(),
        address.clone(),
        Value::int(byte_offset, TYPE_INT32),
    ));
    it.next_in_block();
    Ok(tmp)
}

// ---------------------------------------------------------------------------
// Comparison legalization
// ---------------------------------------------------------------------------

/// LLVM comparison predicate names as the front-ends emit them.
pub const COMP_EQ: &str = "eq";
pub const COMP_NEQ: &str = "ne";
pub const COMP_UNSIGNED_GT: &str = "ugt";
pub const COMP_UNSIGNED_GE: &str = "uge";
pub const COMP_UNSIGNED_LT: &str = "ult";
pub const COMP_UNSIGNED_LE: &str = "ule";
pub const COMP_SIGNED_GT: &str = "sgt";
pub const COMP_SIGNED_GE: &str = "sge";
pub const COMP_SIGNED_LT: &str = "slt";
pub const COMP_SIGNED_LE: &str = "sle";

fn flip_sign_bit<'m>(it: &mut InstructionWalker<'m>, value: &Value) -> Value {
    let tmp = it.method_mut().add_new_local(TYPE_INT32, "%unsigned_cmp");
    it.emplace(Instruction::binary(
        OP_XOR,
        tmp.clone(),
        value.clone(),
        Value::int(i64::from(i32::MIN), TYPE_INT32),
    ));
    it.next_in_block();
    tmp
}

/// Legalize one comparison operation into flag-setting arithmetic plus
/// conditional moves of the boolean results. Unsigned orderings are reduced to
/// signed ones by flipping both sign bits.
fn intrinsify_comparison<'m>(
    mut it: InstructionWalker<'m>,
) -> Result<(InstructionWalker<'m>, bool)> {
    let Some(InstructionKind::Op {
        op: OpSpec::Named(name),
        dest,
        first,
        second: Some(second),
    }) = it.get().map(|inst| inst.kind.clone())
    else {
        return Ok((it, false));
    };
    let (negate, name) = match name.as_str() {
        COMP_NEQ => (true, COMP_EQ.to_string()),
        COMP_UNSIGNED_LE => (true, COMP_UNSIGNED_GT.to_string()),
        COMP_UNSIGNED_GE => (true, COMP_UNSIGNED_LT.to_string()),
        COMP_SIGNED_LE => (true, COMP_SIGNED_GT.to_string()),
        COMP_SIGNED_GE => (true, COMP_SIGNED_LT.to_string()),
        COMP_EQ | COMP_UNSIGNED_GT | COMP_UNSIGNED_LT | COMP_SIGNED_GT | COMP_SIGNED_LT => {
            (false, name)
        }
        _ => return Ok((it, false)),
    };

    let (first, second) = if name.starts_with('u') {
        (flip_sign_bit(&mut it, &first), flip_sign_bit(&mut it, &second))
    } else {
        (first, second)
    };

    // orderings go through min/max rather than subtraction, which could
    // overflow for operands of opposite sign
    let true_cond = match name.as_str() {
        COMP_EQ => {
            it.emplace(
                Instruction::binary(OP_XOR, NOP_REGISTER, first, second).with_set_flags(),
            );
            ConditionCode::ZeroSet
        }
        // a < b  <=>  min(a, b) != b
        COMP_SIGNED_LT | COMP_UNSIGNED_LT => {
            let tmp = it.method_mut().add_new_local(TYPE_INT32, "%cmp");
            it.emplace(Instruction::binary(OP_MIN, tmp.clone(), first, second.clone()));
            it.next_in_block();
            it.emplace(Instruction::binary(OP_XOR, NOP_REGISTER, tmp, second).with_set_flags());
            ConditionCode::ZeroClear
        }
        // a > b  <=>  max(a, b) != b
        _ => {
            let tmp = it.method_mut().add_new_local(TYPE_INT32, "%cmp");
            it.emplace(Instruction::binary(OP_MAX, tmp.clone(), first, second.clone()));
            it.next_in_block();
            it.emplace(Instruction::binary(OP_XOR, NOP_REGISTER, tmp, second).with_set_flags());
            ConditionCode::ZeroClear
        }
    };
    it.next_in_block();
    let true_cond = if negate { true_cond.invert() } else { true_cond };
    it.emplace(
        Instruction::mov(dest.clone(), quill_ir::BOOL_TRUE).with_condition(true_cond),
    );
    it.next_in_block();
    it.reset(Instruction::mov(dest, quill_ir::BOOL_FALSE).with_condition(true_cond.invert()));
    Ok((it, true))
}

// ---------------------------------------------------------------------------
// Multiplication
// ---------------------------------------------------------------------------

struct OpParts {
    dest: Value,
    first: Value,
    second: Value,
}

fn current_op_parts(it: &InstructionWalker<'_>) -> Option<OpParts> {
    match it.get().map(|inst| &inst.kind) {
        Some(InstructionKind::Op {
            dest,
            first,
            second,
            ..
        }) => Some(OpParts {
            dest: dest.clone(),
            first: first.clone(),
            second: second.clone().unwrap_or(UNDEFINED_VALUE),
        }),
        _ => None,
    }
}

/// Full 32x32 multiplication out of mul24: split both operands into 16-bit
/// halves and add the three partial products that stay within 32 bit.
/// Partial products known to be zero from literal halves are skipped.
pub fn intrinsify_unsigned_multiplication<'m>(
    mut it: InstructionWalker<'m>,
) -> Result<InstructionWalker<'m>> {
    let Some(parts) = current_op_parts(&it) else {
        return Err(CompilationError::new(
            CompilationStep::Optimizer,
            "Multiplication lowering requires an operation",
        ));
    };
    let original = it.get().cloned().unwrap_or(Instruction::nop(DelayReason::WaitRegister));
    let dest_ty = parts.dest.ty.clone();

    let a_hi = it.method_mut().add_new_local(dest_ty.clone(), "%mul.a0");
    let a_lo = it.method_mut().add_new_local(dest_ty.clone(), "%mul.a1");
    let b_hi = it.method_mut().add_new_local(dest_ty.clone(), "%mul.b0");
    let b_lo = it.method_mut().add_new_local(dest_ty.clone(), "%mul.b1");
    let out0 = it.method_mut().add_new_local(dest_ty.clone(), "%mul.out0");
    let out1 = it.method_mut().add_new_local(dest_ty.clone(), "%mul.out1");
    let out2 = it.method_mut().add_new_local(dest_ty.clone(), "%mul.out2");

    // split one operand into halves, tracking which halves are known zero
    let mut split = |it: &mut InstructionWalker<'m>, arg: &Value, lo: &Value, hi: &Value| {
        if let Some(lit) = arg.literal_value() {
            let bits = lit.to_immediate();
            it.emplace(Instruction::mov(
                lo.clone(),
                Value::int(i64::from(bits & 0xFFFF), quill_isa::TYPE_INT16),
            ));
            it.next_in_block();
            it.emplace(Instruction::mov(
                hi.clone(),
                Value::int(i64::from(bits >> 16), quill_isa::TYPE_INT16),
            ));
            it.next_in_block();
            ((bits & 0xFFFF) != 0, (bits >> 16) != 0)
        } else {
            it.emplace(Instruction::binary(
                OP_AND,
                lo.clone(),
                arg.clone(),
                Value::int(0xFFFF, quill_isa::TYPE_INT16),
            ));
            it.next_in_block();
            it.emplace(Instruction::binary(
                OP_SHR,
                hi.clone(),
                arg.clone(),
                Value::int(16, quill_isa::TYPE_INT16),
            ));
            it.next_in_block();
            (true, true)
        }
    };
    let (has_a_lo, has_a_hi) = split(&mut it, &parts.first, &a_lo, &a_hi);
    let (has_b_lo, has_b_hi) = split(&mut it, &parts.second, &b_lo, &b_hi);

    if has_a_lo && has_b_lo {
        it.emplace(Instruction::binary(OP_MUL24, out0.clone(), a_lo.clone(), b_lo.clone()));
    } else {
        it.emplace(Instruction::mov(out0.clone(), INT_ZERO));
    }
    it.next_in_block();
    if has_a_lo && has_b_hi {
        let tmp = it.method_mut().add_new_local(dest_ty.clone(), "%mul.tmp");
        it.emplace(Instruction::binary(OP_MUL24, tmp.clone(), a_lo, b_hi));
        it.next_in_block();
        it.emplace(Instruction::binary(
            OP_SHL,
            tmp.clone(),
            tmp.clone(),
            Value::int(16, TYPE_INT8),
        ));
        it.next_in_block();
        it.emplace(Instruction::binary(OP_ADD, out1.clone(), out0, tmp));
    } else {
        it.emplace(Instruction::mov(out1.clone(), out0));
    }
    it.next_in_block();
    if has_a_hi && has_b_lo {
        let tmp = it.method_mut().add_new_local(dest_ty, "%mul.tmp");
        it.emplace(Instruction::binary(OP_MUL24, tmp.clone(), a_hi, b_lo));
        it.next_in_block();
        it.emplace(Instruction::binary(
            OP_SHL,
            out2.clone(),
            tmp,
            Value::int(16, TYPE_INT8),
        ));
    } else {
        it.emplace(Instruction::mov(out2.clone(), INT_ZERO));
    }
    it.next_in_block();

    it.reset(
        Instruction::binary(OP_ADD, parts.dest, out1, out2)
            .copy_extras_from(&original)
            .with_decorations(Decorations::UNSIGNED_RESULT),
    );
    Ok(it)
}

/// Signed multiplication: make both operands positive, multiply unsigned into
/// a temporary, then invert the sign of the result when exactly one operand
/// was negative.
pub fn intrinsify_signed_multiplication<'m>(
    mut it: InstructionWalker<'m>,
) -> Result<InstructionWalker<'m>> {
    let Some(parts) = current_op_parts(&it) else {
        return Err(CompilationError::new(
            CompilationStep::Optimizer,
            "Multiplication lowering requires an operation",
        ));
    };
    let (first, second, dest) = (parts.first, parts.second, parts.dest);

    let (walker, first_positive) = insert_make_positive(it, &first)?;
    let (walker, second_positive) = insert_make_positive(walker, &second)?;
    it = walker;

    let tmp_dest = it.method_mut().add_new_local(dest.ty.clone(), "%result");
    it.modify(|inst| {
        inst.set_argument(0, first_positive);
        inst.set_argument(1, second_positive);
        inst.set_output(tmp_dest.clone());
    });
    it = intrinsify_unsigned_multiplication(it)?;
    // skip the rewritten multiplication itself
    it.next_in_block();

    let (walker, first_sign) = insert_is_negative(it, &first)?;
    let (walker, second_sign) = insert_is_negative(walker, &second)?;
    it = walker;
    if first_sign.is_literal_value() && second_sign.is_literal_value() {
        return Err(opt_err(
            "This case of multiplication of literal integers should have been replaced with constant",
            &dest,
        ));
    }
    // exactly one negative operand -> invert the result's sign
    it.emplace(Instruction::binary(OP_XOR, NOP_REGISTER, first_sign, second_sign).with_set_flags());
    it.next_in_block();
    insert_invert_sign(it, &tmp_dest, &dest, ConditionCode::ZeroClear)
}

// ---------------------------------------------------------------------------
// Division
// ---------------------------------------------------------------------------

/// Restoring division, one shift-compare-subtract step per result bit.
pub fn intrinsify_unsigned_division<'m>(
    mut it: InstructionWalker<'m>,
    use_remainder: bool,
) -> Result<InstructionWalker<'m>> {
    let Some(parts) = current_op_parts(&it) else {
        return Err(CompilationError::new(
            CompilationStep::Optimizer,
            "Division lowering requires an operation",
        ));
    };
    let original = it.get().cloned().unwrap_or(Instruction::nop(DelayReason::WaitRegister));
    let numerator = parts.first;
    let divisor = parts.second;
    let dest_ty = parts.dest.ty.clone();

    let mut quotient = it.method_mut().add_new_local(dest_ty.clone(), "%udiv.quotient");
    let mut remainder = it.method_mut().add_new_local(dest_ty.clone(), "%udiv.remainder");
    it.emplace(Instruction::mov(remainder.clone(), INT_ZERO));
    it.next_in_block();
    it.emplace(Instruction::mov(quotient.clone(), INT_ZERO));
    it.next_in_block();

    for i in (0..numerator.ty.scalar_bit_count()).rev() {
        let bit = Value::int(1i64 << i, TYPE_INT32);
        // shift the remainder left and pull in bit i of the numerator
        let shifted = it.method_mut().add_new_local(dest_ty.clone(), "%udiv.remainder");
        it.emplace(Instruction::binary(OP_SHL, shifted.clone(), remainder, INT_ONE));
        it.next_in_block();
        remainder = shifted;
        let with_bit = it.method_mut().add_new_local(dest_ty.clone(), "%udiv.remainder");
        it.emplace(
            Instruction::binary(OP_AND, NOP_REGISTER, numerator.clone(), bit.clone())
                .with_set_flags(),
        );
        it.next_in_block();
        it.emplace(
            Instruction::binary(OP_OR, with_bit.clone(), remainder.clone(), INT_ONE)
                .with_condition(ConditionCode::ZeroClear),
        );
        it.next_in_block();
        it.emplace(
            Instruction::mov(with_bit.clone(), remainder.clone())
                .with_condition(ConditionCode::ZeroSet),
        );
        it.next_in_block();
        remainder = with_bit;
        // remainder >= divisor?
        let tmp = it.method_mut().add_new_local(dest_ty.clone(), "%udiv.tmp");
        it.emplace(Instruction::binary(
            OP_MAX,
            tmp.clone(),
            remainder.clone(),
            divisor.clone(),
        ));
        it.next_in_block();
        it.emplace(
            Instruction::binary(OP_XOR, NOP_REGISTER, tmp, remainder.clone()).with_set_flags(),
        );
        it.next_in_block();
        // then subtract the divisor and set quotient bit i
        let reduced = it.method_mut().add_new_local(dest_ty.clone(), "%udiv.remainder");
        it.emplace(
            Instruction::binary(OP_SUB, reduced.clone(), remainder.clone(), divisor.clone())
                .with_condition(ConditionCode::ZeroSet),
        );
        it.next_in_block();
        it.emplace(
            Instruction::mov(reduced.clone(), remainder).with_condition(ConditionCode::ZeroClear),
        );
        it.next_in_block();
        remainder = reduced;
        let grown = it.method_mut().add_new_local(dest_ty.clone(), "%udiv.quotient");
        it.emplace(
            Instruction::binary(OP_OR, grown.clone(), quotient.clone(), bit)
                .with_condition(ConditionCode::ZeroSet),
        );
        it.next_in_block();
        it.emplace(
            Instruction::mov(grown.clone(), quotient).with_condition(ConditionCode::ZeroClear),
        );
        it.next_in_block();
        quotient = grown;
    }

    let result = if use_remainder { remainder } else { quotient };
    it.reset(
        Instruction::binary(OP_OR, parts.dest, result.clone(), result)
            .copy_extras_from(&original)
            .with_decorations(Decorations::UNSIGNED_RESULT),
    );
    Ok(it)
}

fn division_constants(divisor: i64, accuracy: u32) -> Result<(i64, i64)> {
    if divisor <= 0 {
        return Err(opt_err("Can only optimize division by positive constants", divisor));
    }
    let shift = ((divisor * i64::from(accuracy)) as f64).log2() as i64 + 2;
    let factor = (2f64.powi(shift as i32) / divisor as f64).round() as i64;
    if shift > 31 {
        return Err(opt_err(
            "Unsigned division by constant generated invalid shift offset",
            shift,
        ));
    }
    if factor >= i64::from(u16::MAX) {
        return Err(opt_err(
            "Unsigned division by constant generated invalid multiplication factor",
            factor,
        ));
    }
    Ok((factor, shift))
}

fn division_constant_values(divisor: &Value, accuracy: u32) -> Result<(Value, Value)> {
    if let Some(elements) = divisor.container_elements() {
        let mut factors = Vec::with_capacity(elements.len());
        let mut shifts = Vec::with_capacity(elements.len());
        for elem in elements {
            let lit = elem.literal_value().ok_or_else(|| {
                opt_err("Can only optimize division by constant", divisor)
            })?;
            let (factor, shift) = division_constants(lit.integer(), accuracy)?;
            factors.push(Value::int(factor, elem.ty.clone()));
            shifts.push(Value::int(shift, elem.ty.clone()));
        }
        return Ok((
            Value::container(factors, divisor.ty.clone()),
            Value::container(shifts, divisor.ty.clone()),
        ));
    }
    let lit = divisor
        .literal_value()
        .ok_or_else(|| opt_err("Can only optimize division by constant", divisor))?;
    let (factor, shift) = division_constants(lit.integer(), accuracy)?;
    Ok((
        Value::int(factor, divisor.ty.clone()),
        Value::int(shift, divisor.ty.clone()),
    ))
}

/// Relative accuracy of the constant-reciprocal division, determined by
/// experiment: values <= 16000 produce mismatches with exact division, values
/// >= 16500 overflow the multiplication or need shifts of 32 or more.
const DIVISION_ACCURACY: u32 = 16100;

/// Division by a constant divisor via multiplication with the rounded
/// reciprocal, plus a correction step for exact multiples.
pub fn intrinsify_unsigned_division_by_constant<'m>(
    mut it: InstructionWalker<'m>,
    use_remainder: bool,
) -> Result<InstructionWalker<'m>> {
    let Some(parts) = current_op_parts(&it) else {
        return Err(CompilationError::new(
            CompilationStep::Optimizer,
            "Division lowering requires an operation",
        ));
    };
    let original = it.get().cloned().unwrap_or(Instruction::nop(DelayReason::WaitRegister));
    let numerator = parts.first;
    let divisor = parts.second;

    if numerator.ty.scalar_bit_count() > 16 {
        return Err(opt_err(
            "Division by constant may overflow for argument type",
            numerator.ty.clone(),
        ));
    }
    let (factor, shift) = division_constant_values(&divisor, DIVISION_ACCURACY)?;

    let tmp = it.method_mut().add_new_local(numerator.ty.clone(), "%udiv");
    it.emplace(Instruction::binary(OP_MUL24, tmp.clone(), numerator.clone(), factor));
    it.next_in_block();
    let div_out = it.method_mut().add_new_local(numerator.ty.clone(), "%udiv");
    it.emplace(
        Instruction::binary(OP_SHR, div_out.clone(), tmp, shift)
            .copy_extras_from(&original)
            .with_decorations(Decorations::UNSIGNED_RESULT),
    );
    it.next_in_block();
    // the approximation returns a too small value for exact multiples of the
    // divisor; add one whenever divisor - (numerator - quotient * divisor) is
    // negative or zero
    let fix0 = it.method_mut().add_new_local(numerator.ty.clone(), "%udiv.fix");
    let fix1 = it.method_mut().add_new_local(numerator.ty.clone(), "%udiv.fix");
    it.emplace(Instruction::binary(
        OP_MUL24,
        fix0.clone(),
        div_out.clone(),
        divisor.clone(),
    ));
    it.next_in_block();
    it.emplace(Instruction::binary(
        OP_SUB,
        fix1.clone(),
        numerator.clone(),
        fix0,
    ));
    it.next_in_block();
    it.emplace(
        Instruction::binary(OP_SUB, NOP_REGISTER, divisor.clone(), fix1).with_set_flags(),
    );
    it.next_in_block();
    let final_result = if use_remainder {
        it.method_mut().add_new_local(numerator.ty.clone(), "%udiv.result")
    } else {
        parts.dest.clone()
    };
    it.emplace(
        Instruction::mov(final_result.clone(), div_out.clone())
            .with_decorations(Decorations::UNSIGNED_RESULT),
    );
    it.next_in_block();
    it.emplace(
        Instruction::binary(OP_ADD, final_result.clone(), div_out.clone(), INT_ONE)
            .with_condition(ConditionCode::NegativeSet)
            .with_decorations(Decorations::UNSIGNED_RESULT),
    );
    it.next_in_block();
    it.emplace(
        Instruction::binary(OP_ADD, final_result.clone(), div_out, INT_ONE)
            .with_condition(ConditionCode::ZeroSet)
            .with_decorations(Decorations::UNSIGNED_RESULT),
    );
    it.next_in_block();

    if use_remainder {
        // x mod y = x - (x / y) * y
        let tmp_mul = it
            .method_mut()
            .add_new_local(numerator.ty.clone(), "%udiv.remainder");
        it.emplace(Instruction::binary(
            OP_MUL24,
            tmp_mul.clone(),
            final_result,
            divisor,
        ));
        it.next_in_block();
        it.reset(
            Instruction::binary(OP_SUB, parts.dest, numerator, tmp_mul)
                .copy_extras_from(&original)
                .with_decorations(Decorations::UNSIGNED_RESULT),
        );
    } else {
        it.erase();
        // so the caller's step does not skip the next instruction
        it.previous_in_block();
    }
    Ok(it)
}

fn insert_signed_division_wrapper<'m>(
    mut it: InstructionWalker<'m>,
    use_remainder: bool,
    by_constant: bool,
) -> Result<InstructionWalker<'m>> {
    let Some(parts) = current_op_parts(&it) else {
        return Err(CompilationError::new(
            CompilationStep::Optimizer,
            "Division lowering requires an operation",
        ));
    };
    let (first, second, dest) = (parts.first, parts.second, parts.dest);

    let (walker, first_sign) = insert_is_negative(it, &first)?;
    let (walker, second_sign) = insert_is_negative(walker, &second)?;
    it = walker;
    if first_sign.is_literal_value() && second_sign.is_literal_value() {
        return Err(opt_err(
            "This case of division of literal integers should have been replaced with constant",
            &dest,
        ));
    }

    let (walker, first_positive) = insert_make_positive(it, &first)?;
    let (walker, second_positive) = insert_make_positive(walker, &second)?;
    it = walker;

    let tmp_dest = it.method_mut().add_new_local(dest.ty.clone(), "%result");
    it.modify(|inst| {
        inst.set_argument(0, first_positive);
        inst.set_argument(1, second_positive);
        inst.set_output(tmp_dest.clone());
    });
    it = if by_constant {
        intrinsify_unsigned_division_by_constant(it, use_remainder)?
    } else {
        intrinsify_unsigned_division(it, use_remainder)?
    };
    it.next_in_block();

    // exactly one negative operand -> negate the result
    it.emplace(Instruction::binary(OP_XOR, NOP_REGISTER, first_sign, second_sign).with_set_flags());
    it.next_in_block();
    insert_invert_sign(it, &tmp_dest, &dest, ConditionCode::ZeroClear)
}

pub fn intrinsify_signed_division<'m>(
    it: InstructionWalker<'m>,
    use_remainder: bool,
) -> Result<InstructionWalker<'m>> {
    insert_signed_division_wrapper(it, use_remainder, false)
}

pub fn intrinsify_signed_division_by_constant<'m>(
    it: InstructionWalker<'m>,
    use_remainder: bool,
) -> Result<InstructionWalker<'m>> {
    insert_signed_division_wrapper(it, use_remainder, true)
}

/// Newton-Raphson float division: start from the SFU reciprocal estimate and
/// refine five times with p <- p * (2 - d * p), then multiply the numerator.
pub fn intrinsify_floating_division<'m>(
    mut it: InstructionWalker<'m>,
) -> Result<InstructionWalker<'m>> {
    let Some(parts) = current_op_parts(&it) else {
        return Err(CompilationError::new(
            CompilationStep::Optimizer,
            "Division lowering requires an operation",
        ));
    };
    let original = it.get().cloned().unwrap_or(Instruction::nop(DelayReason::WaitRegister));
    let nominator = parts.first;
    let divisor = parts.second;
    let dest_ty = parts.dest.ty.clone();
    let two = Value::real(2.0, TYPE_FLOAT);

    it = insert_sfu_call(it, REG_SFU_RECIP, &divisor, ConditionCode::Always)?;
    let mut estimate = it.method_mut().add_new_local(dest_ty.clone(), "%fdiv_recip");
    it.emplace(Instruction::mov(
        estimate.clone(),
        Value::register(REG_SFU_OUT, TYPE_FLOAT),
    ));
    it.next_in_block();

    for round in 1..=5 {
        let prefix = format!("%fdiv_p{}", round);
        let scaled = it.method_mut().add_new_local(dest_ty.clone(), &prefix);
        let residual = it.method_mut().add_new_local(dest_ty.clone(), &prefix);
        let refined = it.method_mut().add_new_local(dest_ty.clone(), &prefix);
        it.emplace(Instruction::binary(
            OP_FMUL,
            scaled.clone(),
            divisor.clone(),
            estimate.clone(),
        ));
        it.next_in_block();
        it.emplace(Instruction::binary(
            OP_FSUB,
            residual.clone(),
            two.clone(),
            scaled,
        ));
        it.next_in_block();
        it.emplace(Instruction::binary(
            OP_FMUL,
            refined.clone(),
            estimate,
            residual,
        ));
        it.next_in_block();
        estimate = refined;
    }

    it.reset(
        Instruction::binary(OP_FMUL, parts.dest, nominator, estimate).copy_extras_from(&original),
    );
    Ok(it)
}

// ---------------------------------------------------------------------------
// Work-item lowering
// ---------------------------------------------------------------------------

/// Replace the current instruction with a read of one of three well-known
/// per-dimension locals, selected by `arg`. A literal dimension becomes a
/// plain move; a dynamic one a flag-based decision tree over 0, 1, 2.
fn intrinsify_read_work_group_info<'m>(
    mut it: InstructionWalker<'m>,
    arg: &Value,
    locals: [&str; 3],
    default: &Value,
    decoration: Decorations,
) -> Result<InstructionWalker<'m>> {
    let original = it.get().cloned().ok_or_else(|| {
        CompilationError::new(CompilationStep::Optimizer, "Walker lost its instruction")
    })?;
    let out = original.output().cloned().ok_or_else(|| {
        opt_err("Work-item query without an output", &original)
    })?;
    if let Some(lit) = arg.literal_value() {
        let src = match lit.integer() {
            dim @ 0..=2 => {
                let local = it
                    .method_mut()
                    .find_or_create_local(TYPE_INT32, locals[dim as usize]);
                Value::local(local, TYPE_INT32)
            }
            _ => default.clone(),
        };
        it.reset(
            Instruction::mov(out, src)
                .copy_extras_from(&original)
                .with_decorations(decoration),
        );
        return Ok(it);
    }
    // write the default first, so the destination has an unconditional path
    it.emplace(Instruction::mov(out.clone(), default.clone()));
    it.next_in_block();
    for dim in 0..2 {
        let local = it.method_mut().find_or_create_local(TYPE_INT32, locals[dim]);
        it.emplace(
            Instruction::binary(
                OP_XOR,
                NOP_REGISTER,
                arg.clone(),
                Value::int(dim as i64, TYPE_INT32),
            )
            .with_set_flags(),
        );
        it.next_in_block();
        it.emplace(
            Instruction::mov(out.clone(), Value::local(local, TYPE_INT32))
                .with_condition(ConditionCode::ZeroSet),
        );
        it.next_in_block();
    }
    let local = it.method_mut().find_or_create_local(TYPE_INT32, locals[2]);
    it.emplace(
        Instruction::binary(OP_XOR, NOP_REGISTER, arg.clone(), Value::int(2, TYPE_INT32))
            .with_set_flags(),
    );
    it.next_in_block();
    it.reset(
        Instruction::mov(out, Value::local(local, TYPE_INT32))
            .with_condition(ConditionCode::ZeroSet)
            .with_decorations(decoration),
    );
    Ok(it)
}

/// Local ids and local sizes are packed three-bytes-in-one-word inside a
/// single UNIFORM: `value = (info >> (dim * 8)) & 0xFF`.
fn intrinsify_read_work_item_info<'m>(
    mut it: InstructionWalker<'m>,
    arg: &Value,
    local_name: &str,
    decoration: Decorations,
) -> Result<InstructionWalker<'m>> {
    let original = it.get().cloned().ok_or_else(|| {
        CompilationError::new(CompilationStep::Optimizer, "Walker lost its instruction")
    })?;
    let out = original.output().cloned().ok_or_else(|| {
        opt_err("Work-item query without an output", &original)
    })?;
    let info = it.method_mut().find_or_create_local(TYPE_INT32, local_name);
    let shift = it.method_mut().add_new_local(TYPE_INT32, "%local_info");
    it.emplace(Instruction::binary(
        OP_MUL24,
        shift.clone(),
        arg.clone(),
        Value::int(8, TYPE_INT32),
    ));
    it.next_in_block();
    let shifted = it.method_mut().add_new_local(TYPE_INT32, "%local_info");
    it.emplace(Instruction::binary(
        OP_SHR,
        shifted.clone(),
        Value::local(info, TYPE_INT32),
        shift,
    ));
    it.next_in_block();
    it.reset(
        Instruction::binary(OP_AND, out, shifted, Value::int(0xFF, TYPE_INT8))
            .copy_extras_from(&original)
            .with_decorations(decoration),
    );
    Ok(it)
}

struct CallParts {
    out: Option<Value>,
    name: String,
    args: Vec<Value>,
}

fn current_call(it: &InstructionWalker<'_>) -> Option<CallParts> {
    match it.get().map(|inst| &inst.kind) {
        Some(InstructionKind::Call { dest, name, args }) => Some(CallParts {
            out: dest.clone(),
            name: name.clone(),
            args: args.clone(),
        }),
        _ => None,
    }
}

fn require_output(parts: &CallParts) -> Result<Value> {
    parts.out.clone().ok_or_else(|| {
        opt_err("Intrinsic call without an output", &parts.name)
    })
}

fn intrinsify_work_item_functions<'m>(
    mut it: InstructionWalker<'m>,
) -> Result<(InstructionWalker<'m>, bool)> {
    let Some(parts) = current_call(&it) else {
        return Ok((it, false));
    };
    if parts.args.len() > 1 {
        return Ok((it, false));
    }
    let original = it.get().cloned().ok_or_else(|| {
        CompilationError::new(CompilationStep::Optimizer, "Walker lost its instruction")
    })?;

    if parts.name == "quill_work_dimensions" && parts.args.is_empty() {
        // an int8 result lets later passes shrink multiplications with it
        let mut out = require_output(&parts)?;
        out.ty = TYPE_INT8;
        let local = it.method_mut().find_or_create_local(TYPE_INT32, WORK_DIMENSIONS);
        it.reset(
            Instruction::mov(out, Value::local(local, TYPE_INT32))
                .copy_extras_from(&original)
                .with_decorations(Decorations::BUILTIN_WORK_DIMENSIONS),
        );
        return Ok((it, true));
    }
    if parts.args.len() != 1 {
        return Ok((it, false));
    }
    let arg = parts.args[0].clone();
    match parts.name.as_str() {
        "quill_num_groups" => {
            let it = intrinsify_read_work_group_info(
                it,
                &arg,
                [NUM_GROUPS_X, NUM_GROUPS_Y, NUM_GROUPS_Z],
                &INT_ONE,
                Decorations::BUILTIN_NUM_GROUPS,
            )?;
            Ok((it, true))
        }
        "quill_group_id" => {
            let it = intrinsify_read_work_group_info(
                it,
                &arg,
                [GROUP_ID_X, GROUP_ID_Y, GROUP_ID_Z],
                &INT_ZERO,
                Decorations::BUILTIN_GROUP_ID,
            )?;
            Ok((it, true))
        }
        "quill_global_offset" => {
            let it = intrinsify_read_work_group_info(
                it,
                &arg,
                [GLOBAL_OFFSET_X, GLOBAL_OFFSET_Y, GLOBAL_OFFSET_Z],
                &INT_ZERO,
                Decorations::BUILTIN_GLOBAL_OFFSET,
            )?;
            Ok((it, true))
        }
        "quill_local_size" => {
            let sizes = it.method().metadata.work_group_sizes;
            if sizes[0] > 0 {
                if let Some(lit) = arg.literal_value() {
                    // the declared required size is binding, substitute it
                    let out = require_output(&parts)?;
                    let dim = lit.integer();
                    let value = if (0..3).contains(&dim) && sizes[dim as usize] > 0 {
                        Value::int(i64::from(sizes[dim as usize]), TYPE_INT8)
                    } else {
                        INT_ONE
                    };
                    it.reset(
                        Instruction::mov(out, value)
                            .with_decorations(Decorations::BUILTIN_LOCAL_SIZE),
                    );
                    return Ok((it, true));
                }
            }
            let it = intrinsify_read_work_item_info(
                it,
                &arg,
                LOCAL_SIZES,
                Decorations::BUILTIN_LOCAL_SIZE,
            )?;
            Ok((it, true))
        }
        "quill_local_id" => {
            let it = intrinsify_read_work_item_info(
                it,
                &arg,
                LOCAL_IDS,
                Decorations::BUILTIN_LOCAL_ID,
            )?;
            Ok((it, true))
        }
        "quill_global_size" => {
            // global_size(dim) = local_size(dim) * num_groups(dim)
            let out = require_output(&parts)?;
            let tmp_local_size = it.method_mut().add_new_local(TYPE_INT8, "%local_size");
            let tmp_num_groups = it.method_mut().add_new_local(TYPE_INT32, "%num_groups");
            it.emplace(Instruction::mov(tmp_local_size.clone(), NOP_REGISTER));
            it = intrinsify_read_work_item_info(
                it,
                &arg,
                LOCAL_SIZES,
                Decorations::BUILTIN_LOCAL_SIZE,
            )?;
            it.next_in_block();
            it.emplace(Instruction::mov(tmp_num_groups.clone(), NOP_REGISTER));
            it = intrinsify_read_work_group_info(
                it,
                &arg,
                [NUM_GROUPS_X, NUM_GROUPS_Y, NUM_GROUPS_Z],
                &INT_ONE,
                Decorations::BUILTIN_NUM_GROUPS,
            )?;
            it.next_in_block();
            it.reset(
                Instruction::binary(OP_MUL24, out, tmp_local_size, tmp_num_groups)
                    .copy_extras_from(&original)
                    .with_decorations(Decorations::BUILTIN_GLOBAL_SIZE),
            );
            Ok((it, true))
        }
        "quill_global_id" => {
            // global_id(dim) = global_offset(dim) + group_id(dim) * local_size(dim) + local_id(dim)
            let out = require_output(&parts)?;
            let tmp_group_id = it.method_mut().add_new_local(TYPE_INT32, "%group_id");
            let tmp_local_size = it.method_mut().add_new_local(TYPE_INT8, "%local_size");
            let tmp_global_offset = it.method_mut().add_new_local(TYPE_INT32, "%global_offset");
            let tmp_local_id = it.method_mut().add_new_local(TYPE_INT8, "%local_id");
            let tmp_res0 = it.method_mut().add_new_local(TYPE_INT32, "%global_id");
            let tmp_res1 = it.method_mut().add_new_local(TYPE_INT32, "%global_id");
            it.emplace(Instruction::mov(tmp_group_id.clone(), NOP_REGISTER));
            it = intrinsify_read_work_group_info(
                it,
                &arg,
                [GROUP_ID_X, GROUP_ID_Y, GROUP_ID_Z],
                &INT_ZERO,
                Decorations::BUILTIN_GROUP_ID,
            )?;
            it.next_in_block();
            it.emplace(Instruction::mov(tmp_local_size.clone(), NOP_REGISTER));
            it = intrinsify_read_work_item_info(
                it,
                &arg,
                LOCAL_SIZES,
                Decorations::BUILTIN_LOCAL_SIZE,
            )?;
            it.next_in_block();
            it.emplace(Instruction::mov(tmp_global_offset.clone(), NOP_REGISTER));
            it = intrinsify_read_work_group_info(
                it,
                &arg,
                [GLOBAL_OFFSET_X, GLOBAL_OFFSET_Y, GLOBAL_OFFSET_Z],
                &INT_ZERO,
                Decorations::BUILTIN_GLOBAL_OFFSET,
            )?;
            it.next_in_block();
            it.emplace(Instruction::mov(tmp_local_id.clone(), NOP_REGISTER));
            it = intrinsify_read_work_item_info(
                it,
                &arg,
                LOCAL_IDS,
                Decorations::BUILTIN_LOCAL_ID,
            )?;
            it.next_in_block();
            it.emplace(Instruction::binary(
                OP_MUL24,
                tmp_res0.clone(),
                tmp_group_id,
                tmp_local_size,
            ));
            it.next_in_block();
            it.emplace(Instruction::binary(
                OP_ADD,
                tmp_res1.clone(),
                tmp_global_offset,
                tmp_res0,
            ));
            it.next_in_block();
            it.reset(
                Instruction::binary(OP_ADD, out, tmp_res1, tmp_local_id)
                    .copy_extras_from(&original)
                    .with_decorations(Decorations::BUILTIN_GLOBAL_ID),
            );
            Ok((it, true))
        }
        _ => Ok((it, false)),
    }
}

// ---------------------------------------------------------------------------
// Named intrinsics
// ---------------------------------------------------------------------------

fn reset_to_move(
    it: &mut InstructionWalker<'_>,
    dest: Value,
    value: Value,
    original: &Instruction,
) {
    let mut inst = Instruction::mov(dest, value).with_condition(original.condition);
    if original.set_flags {
        inst = inst.with_set_flags();
    }
    it.reset(inst);
}

fn is_unsigned_marker(args: &[Value], index: usize) -> bool {
    args.get(index)
        .and_then(Value::literal_value)
        .is_some_and(|lit| lit.integer() == UNSIGNED_MARKER)
}

/// Rewrite the current call into a single ALU instruction (`op` = None means
/// a plain move), optionally with pack/unpack modes, flag setting and the
/// unsigned-result decoration taken from the marker argument.
fn intrinsify_alu_call<'m>(
    it: &mut InstructionWalker<'m>,
    parts: &CallParts,
    op: Option<OpCode>,
    pack: Pack,
    unpack: Unpack,
    set_flags: bool,
    sign_aware: bool,
    marker_index: usize,
) -> Result<()> {
    let original = it.get().cloned().ok_or_else(|| {
        CompilationError::new(CompilationStep::Optimizer, "Walker lost its instruction")
    })?;
    let out = require_output(parts)?;
    let mut inst = match op {
        None => Instruction::mov(out, parts.args[0].clone()),
        Some(op) if op.operands == 1 => Instruction::unary(op, out, parts.args[0].clone()),
        Some(op) => Instruction::binary(
            op,
            out,
            parts.args[0].clone(),
            parts.args.get(1).cloned().unwrap_or(UNDEFINED_VALUE),
        ),
    };
    inst = inst.copy_extras_from(&original);
    if pack.has_effect() {
        inst = inst.with_pack(pack);
    }
    if unpack.has_effect() {
        inst = inst.with_unpack(unpack);
    }
    if set_flags {
        inst = inst.with_set_flags();
    }
    if sign_aware && is_unsigned_marker(&parts.args, marker_index) {
        inst = inst.with_decorations(Decorations::UNSIGNED_RESULT);
    }
    it.reset(inst);
    Ok(())
}

fn intrinsify_sfu_call<'m>(
    mut it: InstructionWalker<'m>,
    parts: &CallParts,
    sfu_register: Register,
) -> Result<InstructionWalker<'m>> {
    let original = it.get().cloned().ok_or_else(|| {
        CompilationError::new(CompilationStep::Optimizer, "Walker lost its instruction")
    })?;
    let out = require_output(parts)?;
    it = insert_sfu_call(it, sfu_register, &parts.args[0], original.condition)?;
    it.reset(
        Instruction::mov(out.clone(), Value::register(REG_SFU_OUT, out.ty))
            .copy_extras_from(&original),
    );
    Ok(it)
}

fn intrinsify_semaphore<'m>(
    mut it: InstructionWalker<'m>,
    parts: &CallParts,
    increase: bool,
) -> Result<InstructionWalker<'m>> {
    let original = it.get().cloned().ok_or_else(|| {
        CompilationError::new(CompilationStep::Optimizer, "Walker lost its instruction")
    })?;
    let Some(lit) = parts.args.first().and_then(Value::literal_value) else {
        return Err(opt_err(
            "Semaphore-number needs to be a compile-time constant",
            &original,
        ));
    };
    let id = lit.integer();
    if !(0..16).contains(&id) {
        return Err(opt_err(
            "Semaphore-number needs to be between 0 and 15",
            &original,
        ));
    }
    it.reset(Instruction::semaphore(id as u8, increase).copy_extras_from(&original));
    Ok(it)
}

fn intrinsify_nonary<'m>(
    mut it: InstructionWalker<'m>,
) -> Result<(InstructionWalker<'m>, bool)> {
    let Some(parts) = current_call(&it) else {
        return Ok((it, false));
    };
    if parts.args.len() > 1 {
        return Ok((it, false));
    }
    let original = it.get().cloned().ok_or_else(|| {
        CompilationError::new(CompilationStep::Optimizer, "Walker lost its instruction")
    })?;
    if parts.name.contains("quill_mutex_lock") {
        it.reset(Instruction::mutex(true));
        return Ok((it, true));
    }
    if parts.name.contains("quill_mutex_unlock") {
        it.reset(Instruction::mutex(false));
        return Ok((it, true));
    }
    if parts.name.contains("quill_element_number") {
        let out = require_output(&parts)?;
        it.reset(
            Instruction::mov(out, ELEMENT_NUMBER_REGISTER).copy_extras_from(&original),
        );
        return Ok((it, true));
    }
    if parts.name.contains("quill_qpu_number") {
        let out = require_output(&parts)?;
        it.reset(
            Instruction::mov(out, Value::register(REG_QPU_NUMBER, TYPE_INT8))
                .copy_extras_from(&original),
        );
        return Ok((it, true));
    }
    Ok((it, false))
}

fn fold_unary_call<'m>(
    it: &mut InstructionWalker<'m>,
    parts: &CallParts,
    fold: impl Fn(&Literal) -> Option<Literal>,
) -> Result<bool> {
    let Some(lit) = parts.args.first().and_then(Value::literal_value) else {
        return Ok(false);
    };
    let Some(folded) = fold(&lit) else {
        return Ok(false);
    };
    let original = it.get().cloned().ok_or_else(|| {
        CompilationError::new(CompilationStep::Optimizer, "Walker lost its instruction")
    })?;
    let out = require_output(parts)?;
    let ty = out.ty.clone();
    reset_to_move(it, out, Value::literal(folded, ty), &original);
    Ok(true)
}

fn fold_binary_call<'m>(
    it: &mut InstructionWalker<'m>,
    parts: &CallParts,
    fold: impl Fn(&Literal, &Literal) -> Option<Literal>,
) -> Result<bool> {
    let (Some(a), Some(b)) = (
        parts.args.first().and_then(Value::literal_value),
        parts.args.get(1).and_then(Value::literal_value),
    ) else {
        return Ok(false);
    };
    let Some(folded) = fold(&a, &b) else {
        return Ok(false);
    };
    let original = it.get().cloned().ok_or_else(|| {
        CompilationError::new(CompilationStep::Optimizer, "Walker lost its instruction")
    })?;
    let out = require_output(parts)?;
    let ty = out.ty.clone();
    reset_to_move(it, out, Value::literal(folded, ty), &original);
    Ok(true)
}

fn intrinsify_unary<'m>(
    mut it: InstructionWalker<'m>,
) -> Result<(InstructionWalker<'m>, bool)> {
    let Some(parts) = current_call(&it) else {
        return Ok((it, false));
    };
    if parts.args.is_empty() || parts.args.len() > 2 {
        return Ok((it, false));
    }
    let name = parts.name.as_str();

    if name.contains("quill_ftoi") {
        if fold_unary_call(&mut it, &parts, |lit| {
            Some(Literal::Int(lit.real().round() as i64))
        })? {
            return Ok((it, true));
        }
        intrinsify_alu_call(&mut it, &parts, Some(OP_FTOI), PACK_NOP, UNPACK_NOP, false, false, 1)?;
        return Ok((it, true));
    }
    if name.contains("quill_itof") {
        if fold_unary_call(&mut it, &parts, |lit| {
            Some(Literal::Real(lit.integer() as f64))
        })? {
            return Ok((it, true));
        }
        intrinsify_alu_call(&mut it, &parts, Some(OP_ITOF), PACK_NOP, UNPACK_NOP, false, false, 1)?;
        return Ok((it, true));
    }
    if name.contains("quill_clz") {
        intrinsify_alu_call(&mut it, &parts, Some(OP_CLZ), PACK_NOP, UNPACK_NOP, false, false, 1)?;
        return Ok((it, true));
    }
    if name.contains("quill_sfu_rsqrt") {
        if fold_unary_call(&mut it, &parts, |lit| {
            Some(Literal::Real(1.0 / lit.real().sqrt()))
        })? {
            return Ok((it, true));
        }
        let it = intrinsify_sfu_call(it, &parts, REG_SFU_RECIP_SQRT)?;
        return Ok((it, true));
    }
    if name.contains("quill_sfu_exp2") {
        if fold_unary_call(&mut it, &parts, |lit| Some(Literal::Real(lit.real().exp2())))? {
            return Ok((it, true));
        }
        let it = intrinsify_sfu_call(it, &parts, REG_SFU_EXP2)?;
        return Ok((it, true));
    }
    if name.contains("quill_sfu_log2") {
        if fold_unary_call(&mut it, &parts, |lit| Some(Literal::Real(lit.real().log2())))? {
            return Ok((it, true));
        }
        let it = intrinsify_sfu_call(it, &parts, REG_SFU_LOG2)?;
        return Ok((it, true));
    }
    if name.contains("quill_sfu_recip") {
        if fold_unary_call(&mut it, &parts, |lit| Some(Literal::Real(1.0 / lit.real())))? {
            return Ok((it, true));
        }
        let it = intrinsify_sfu_call(it, &parts, REG_SFU_RECIP)?;
        return Ok((it, true));
    }
    if name.contains("quill_semaphore_increment") {
        let it = intrinsify_semaphore(it, &parts, true)?;
        return Ok((it, true));
    }
    if name.contains("quill_semaphore_decrement") {
        let it = intrinsify_semaphore(it, &parts, false)?;
        return Ok((it, true));
    }
    if name.contains("quill_dma_read") {
        let out = require_output(&parts)?;
        it = insert_tmu_read(it, &out, &parts.args[0])?;
        it.erase();
        // so the caller's step does not skip the next instruction
        it.previous_in_block();
        return Ok((it, true));
    }
    if name.contains("quill_unpack_sext") {
        intrinsify_alu_call(&mut it, &parts, None, PACK_NOP, UNPACK_SHORT_TO_INT_SEXT, false, false, 1)?;
        return Ok((it, true));
    }
    if let Some(byte) = ["quill_unpack_color_byte0", "quill_unpack_color_byte1", "quill_unpack_color_byte2", "quill_unpack_color_byte3"]
        .iter()
        .position(|key| name.contains(key))
    {
        let unpack = [UNPACK_BYTE0_32, UNPACK_BYTE1_32, UNPACK_BYTE2_32, UNPACK_BYTE3_32][byte];
        intrinsify_alu_call(&mut it, &parts, Some(OP_FMIN), PACK_NOP, unpack, false, false, 1)?;
        return Ok((it, true));
    }
    if let Some(byte) = ["quill_unpack_byte0", "quill_unpack_byte1", "quill_unpack_byte2", "quill_unpack_byte3"]
        .iter()
        .position(|key| name.contains(key))
    {
        let unpack = [UNPACK_BYTE0_32, UNPACK_BYTE1_32, UNPACK_BYTE2_32, UNPACK_BYTE3_32][byte];
        intrinsify_alu_call(&mut it, &parts, None, PACK_NOP, unpack, false, false, 1)?;
        return Ok((it, true));
    }
    if name.contains("quill_pack_truncate") {
        intrinsify_alu_call(&mut it, &parts, None, PACK_INT_TO_USHORT_TRUNCATE, UNPACK_NOP, false, false, 1)?;
        return Ok((it, true));
    }
    if name.contains("quill_replicate_lsb") {
        intrinsify_alu_call(&mut it, &parts, None, PACK_32_8888, UNPACK_NOP, false, false, 1)?;
        return Ok((it, true));
    }
    if name.contains("quill_pack_lsb") {
        intrinsify_alu_call(&mut it, &parts, None, PACK_INT_TO_CHAR_TRUNCATE, UNPACK_NOP, false, false, 1)?;
        return Ok((it, true));
    }
    if name.contains("quill_saturate_short") {
        intrinsify_alu_call(&mut it, &parts, None, PACK_INT_TO_SIGNED_SHORT_SATURATE, UNPACK_NOP, false, false, 1)?;
        return Ok((it, true));
    }
    if name.contains("quill_saturate_lsb") {
        intrinsify_alu_call(&mut it, &parts, None, PACK_INT_TO_UNSIGNED_CHAR_SATURATE, UNPACK_NOP, false, false, 1)?;
        return Ok((it, true));
    }
    intrinsify_type_cast(it, parts)
}

/// Bitcasts either truncate to the narrow width or pass the bits through.
fn intrinsify_type_cast<'m>(
    mut it: InstructionWalker<'m>,
    parts: CallParts,
) -> Result<(InstructionWalker<'m>, bool)> {
    let name = parts.name.as_str();
    let masked = |mask: u32| {
        move |lit: &Literal| Some(Literal::Int(i64::from(lit.to_immediate() & mask)))
    };
    if name.contains("quill_bitcast_uchar") {
        if fold_unary_call(&mut it, &parts, masked(0xFF))? {
            return Ok((it, true));
        }
        let original = it.get().cloned().ok_or_else(|| {
            CompilationError::new(CompilationStep::Optimizer, "Walker lost its instruction")
        })?;
        let out = require_output(&parts)?;
        it.reset(
            Instruction::binary(
                OP_AND,
                out,
                parts.args[0].clone(),
                Value::int(0xFF, TYPE_INT8),
            )
            .copy_extras_from(&original)
            .with_decorations(Decorations::UNSIGNED_RESULT),
        );
        return Ok((it, true));
    }
    if name.contains("quill_bitcast_ushort") {
        if fold_unary_call(&mut it, &parts, masked(0xFFFF))? {
            return Ok((it, true));
        }
        let original = it.get().cloned().ok_or_else(|| {
            CompilationError::new(CompilationStep::Optimizer, "Walker lost its instruction")
        })?;
        let out = require_output(&parts)?;
        it.reset(
            Instruction::binary(
                OP_AND,
                out,
                parts.args[0].clone(),
                Value::int(0xFFFF, quill_isa::TYPE_INT16),
            )
            .copy_extras_from(&original)
            .with_decorations(Decorations::UNSIGNED_RESULT),
        );
        return Ok((it, true));
    }
    if name.contains("quill_bitcast_uint") {
        if fold_unary_call(&mut it, &parts, masked(u32::MAX))? {
            return Ok((it, true));
        }
        intrinsify_alu_call(&mut it, &parts, None, PACK_NOP, UNPACK_NOP, false, false, 1)?;
        it.modify(|inst| inst.decorations |= Decorations::UNSIGNED_RESULT);
        return Ok((it, true));
    }
    if name.contains("quill_bitcast_char")
        || name.contains("quill_bitcast_short")
        || name.contains("quill_bitcast_int")
        || name.contains("quill_bitcast_float")
    {
        // the bits pass through unchanged, calculations run in 32 bit anyway
        intrinsify_alu_call(&mut it, &parts, None, PACK_NOP, UNPACK_NOP, false, false, 1)?;
        return Ok((it, true));
    }
    Ok((it, false))
}

fn intrinsify_binary<'m>(
    mut it: InstructionWalker<'m>,
    diags: &mut DiagnosticBag,
) -> Result<(InstructionWalker<'m>, bool)> {
    let Some(parts) = current_call(&it) else {
        return Ok((it, false));
    };
    if parts.args.len() < 2 || parts.args.len() > 3 {
        return Ok((it, false));
    }
    let name = parts.name.as_str();
    let float2 = |f: fn(f64, f64) -> f64| {
        move |a: &Literal, b: &Literal| Some(Literal::Real(f(a.real(), b.real())))
    };
    let int2 = |f: fn(i64, i64) -> i64| {
        move |a: &Literal, b: &Literal| Some(Literal::Int(f(a.integer(), b.integer())))
    };

    struct BinaryAlu {
        key: &'static str,
        op: OpCode,
        sign_aware: bool,
        pack: Pack,
        set_flags: bool,
    }
    let simple = [
        BinaryAlu { key: "quill_fmaxabs", op: OP_FMAXABS, sign_aware: false, pack: PACK_NOP, set_flags: false },
        BinaryAlu { key: "quill_fminabs", op: OP_FMINABS, sign_aware: false, pack: PACK_NOP, set_flags: false },
        BinaryAlu { key: "quill_fmax", op: OP_FMAX, sign_aware: false, pack: PACK_NOP, set_flags: false },
        BinaryAlu { key: "quill_fmin", op: OP_FMIN, sign_aware: false, pack: PACK_NOP, set_flags: false },
        BinaryAlu { key: "quill_shr", op: OP_SHR, sign_aware: false, pack: PACK_NOP, set_flags: false },
        BinaryAlu { key: "quill_asr", op: OP_ASR, sign_aware: false, pack: PACK_NOP, set_flags: false },
        BinaryAlu { key: "quill_ror", op: OP_ROR, sign_aware: false, pack: PACK_NOP, set_flags: false },
        BinaryAlu { key: "quill_shl", op: OP_SHL, sign_aware: false, pack: PACK_NOP, set_flags: false },
        BinaryAlu { key: "quill_min", op: OP_MIN, sign_aware: true, pack: PACK_NOP, set_flags: false },
        BinaryAlu { key: "quill_max", op: OP_MAX, sign_aware: true, pack: PACK_NOP, set_flags: false },
        BinaryAlu { key: "quill_and", op: OP_AND, sign_aware: false, pack: PACK_NOP, set_flags: false },
        BinaryAlu { key: "quill_mul24", op: OP_MUL24, sign_aware: true, pack: PACK_NOP, set_flags: false },
        BinaryAlu { key: "quill_saturated_add", op: OP_ADD, sign_aware: false, pack: PACK_32_32_SATURATE, set_flags: true },
        BinaryAlu { key: "quill_saturated_sub", op: OP_SUB, sign_aware: false, pack: PACK_32_32_SATURATE, set_flags: true },
    ];

    for entry in &simple {
        if !name.contains(entry.key) {
            continue;
        }
        let folded = match entry.key {
            "quill_fmax" => fold_binary_call(&mut it, &parts, float2(f64::max))?,
            "quill_fmin" => fold_binary_call(&mut it, &parts, float2(f64::min))?,
            "quill_fmaxabs" => {
                fold_binary_call(&mut it, &parts, float2(|a, b| a.abs().max(b.abs())))?
            }
            "quill_fminabs" => {
                fold_binary_call(&mut it, &parts, float2(|a, b| a.abs().min(b.abs())))?
            }
            "quill_shr" => fold_binary_call(&mut it, &parts, int2(|a, b| a >> b))?,
            "quill_asr" => fold_binary_call(&mut it, &parts, int2(|a, b| a >> b))?,
            "quill_shl" => fold_binary_call(&mut it, &parts, int2(|a, b| a << b))?,
            "quill_min" => fold_binary_call(&mut it, &parts, int2(i64::min))?,
            "quill_max" => fold_binary_call(&mut it, &parts, int2(i64::max))?,
            "quill_and" => fold_binary_call(&mut it, &parts, int2(|a, b| a & b))?,
            "quill_mul24" => fold_binary_call(&mut it, &parts, int2(|a, b| {
                (a & 0xFF_FFFF) * (b & 0xFF_FFFF)
            }))?,
            _ => false,
        };
        if folded {
            return Ok((it, true));
        }
        intrinsify_alu_call(
            &mut it,
            &parts,
            Some(entry.op),
            entry.pack,
            UNPACK_NOP,
            entry.set_flags,
            entry.sign_aware,
            2,
        )?;
        return Ok((it, true));
    }

    if name.contains("quill_dma_write") {
        it = insert_dma_write(it, &parts.args[1], &parts.args[0])?;
        it.erase();
        it.previous_in_block();
        return Ok((it, true));
    }
    if name.contains("quill_vector_rotate") {
        let out = require_output(&parts)?;
        it = insert_vector_rotation(it, &parts.args[0], &parts.args[1], &out, Direction::Up)?;
        it.erase();
        it.previous_in_block();
        return Ok((it, true));
    }
    if name.contains("quill_prefetch") {
        // could load into the VPM and serve later reads from there
        diags.warn(format!(
            "Discarding unsupported DMA pre-fetch: {}",
            parts.name
        ));
        it.erase();
        it.previous_in_block();
        return Ok((it, true));
    }
    Ok((it, false))
}

/// Image access builtins are handled by a dedicated lowering layer; this
/// build only recognizes them to produce a precise diagnostic.
fn intrinsify_image_function<'m>(
    it: InstructionWalker<'m>,
) -> Result<(InstructionWalker<'m>, bool)> {
    let Some(parts) = current_call(&it) else {
        return Ok((it, false));
    };
    let touches_image = parts.name.contains("quill_image")
        || parts.args.iter().any(|arg| arg.ty.is_image());
    if touches_image {
        return Err(opt_err(
            "Image functions are not supported by this build",
            &parts.name,
        ));
    }
    Ok((it, false))
}

fn intrinsify_ternary<'m>(
    mut it: InstructionWalker<'m>,
) -> Result<(InstructionWalker<'m>, bool)> {
    let Some(parts) = current_call(&it) else {
        return Ok((it, false));
    };
    if parts.args.len() < 3 || parts.args.len() > 4 {
        return Ok((it, false));
    }
    if parts.name.contains("quill_dma_copy") {
        let original = it.get().cloned().ok_or_else(|| {
            CompilationError::new(CompilationStep::Optimizer, "Walker lost its instruction")
        })?;
        let Some(count) = parts.args[2].literal_value() else {
            return Err(opt_err(
                "Memory copy with non-constant size is not yet supported",
                &original,
            ));
        };
        let elem_ty = parts.args[0].ty.element_type();
        let num_bytes = count.integer() * i64::from(elem_ty.physical_width());
        it = insert_dma_copy(it, &parts.args[0], &parts.args[1], &elem_ty, num_bytes)?;
        it.erase();
        it.previous_in_block();
        return Ok((it, true));
    }
    Ok((it, false))
}

// ---------------------------------------------------------------------------
// Generic arithmetic legalization
// ---------------------------------------------------------------------------

fn is_power_of_two(value: i64) -> bool {
    value > 0 && (value & (value - 1)) == 0
}

fn log2_of(value: i64) -> i64 {
    63 - value.leading_zeros() as i64
}

struct NamedOpParts {
    name: String,
    dest: Value,
    first: Value,
    second: Option<Value>,
    decorations: Decorations,
    condition: ConditionCode,
    set_flags: bool,
}

fn current_named_op(it: &InstructionWalker<'_>) -> Option<NamedOpParts> {
    let inst = it.get()?;
    match &inst.kind {
        InstructionKind::Op {
            op: OpSpec::Named(name),
            dest,
            first,
            second,
        } => Some(NamedOpParts {
            name: name.clone(),
            dest: dest.clone(),
            first: first.clone(),
            second: second.clone(),
            decorations: inst.decorations,
            condition: inst.condition,
            set_flags: inst.set_flags,
        }),
        _ => None,
    }
}

fn replace_opcode(it: &mut InstructionWalker<'_>, new_op: OpCode) {
    it.modify(|inst| {
        if let InstructionKind::Op { op, .. } = &mut inst.kind {
            *op = OpSpec::Native(new_op);
        }
    });
}

fn replace_opcode_and_args(
    it: &mut InstructionWalker<'_>,
    new_op: OpCode,
    first: Option<Value>,
    second: Option<Value>,
) {
    it.modify(|inst| {
        if let InstructionKind::Op {
            op,
            first: a,
            second: b,
            ..
        } = &mut inst.kind
        {
            *op = OpSpec::Native(new_op);
            if let Some(first) = first {
                *a = first;
            }
            if let Some(second) = second {
                *b = Some(second);
            }
        }
    });
}

fn fold_to_move(
    it: &mut InstructionWalker<'_>,
    parts: &NamedOpParts,
    value: Value,
) {
    let mut inst = Instruction::mov(parts.dest.clone(), value)
        .with_condition(parts.condition)
        .with_decorations(parts.decorations);
    if parts.set_flags {
        inst = inst.with_set_flags();
    }
    it.reset(inst);
}

/// Legalize one abstract arithmetic operation into native instructions,
/// choosing the cheapest applicable lowering.
fn intrinsify_arithmetic<'m>(
    mut it: InstructionWalker<'m>,
    options: &LoweringOptions,
) -> Result<(InstructionWalker<'m>, bool)> {
    let Some(parts) = current_named_op(&it) else {
        return Ok((it, false));
    };
    let first_lit = parts.first.literal_value();
    let second_lit = parts.second.as_ref().and_then(Value::literal_value);
    let second_constant = parts.second.as_ref().is_some_and(|second| {
        second.is_literal_value()
            || second
                .container_elements()
                .is_some_and(|elems| elems.iter().all(Value::is_literal_value))
    });
    let saturate = parts.decorations.contains(Decorations::SATURATED_CONVERSION);
    let allow_recip = parts.decorations.contains(Decorations::ALLOW_RECIP)
        || parts.decorations.contains(Decorations::FAST_MATH)
        || options.math != MathType::Strict;

    match parts.name.as_str() {
        "mul" => {
            if let (Some(a), Some(b)) = (first_lit, second_lit) {
                let value = Value::int(a.integer().wrapping_mul(b.integer()), parts.first.ty.clone());
                fold_to_move(&mut it, &parts, value);
            } else if first_lit.is_some_and(|a| is_power_of_two(a.integer())) {
                // a * 2^n = a << n
                let shift = log2_of(first_lit.map_or(0, |l| l.integer()));
                replace_opcode_and_args(
                    &mut it,
                    OP_SHL,
                    parts.second.clone(),
                    Some(Value::int(shift, parts.first.ty.clone())),
                );
            } else if second_lit.is_some_and(|b| is_power_of_two(b.integer())) {
                let shift = log2_of(second_lit.map_or(0, |l| l.integer()));
                replace_opcode_and_args(
                    &mut it,
                    OP_SHL,
                    None,
                    Some(Value::int(shift, parts.dest.ty.clone())),
                );
            } else if parts.first.ty.scalar_bit_count().max(
                parts.second.as_ref().map_or(0, |s| s.ty.scalar_bit_count()),
            ) <= 24
            {
                // both operands fit the 24-bit multiplier
                replace_opcode(&mut it, OP_MUL24);
            } else {
                it = intrinsify_signed_multiplication(it)?;
            }
            Ok((it, true))
        }
        "udiv" => {
            if let (Some(a), Some(b)) = (first_lit, second_lit) {
                if b.integer() != 0 {
                    let quotient = a.to_immediate() / b.to_immediate();
                    fold_to_move(&mut it, &parts, Value::int(i64::from(quotient), parts.first.ty.clone()));
                    return Ok((it, true));
                }
            }
            if second_lit.is_some_and(|b| is_power_of_two(b.integer())) {
                // a / 2^n = a >> n
                let shift = log2_of(second_lit.map_or(1, |l| l.integer()));
                replace_opcode_and_args(
                    &mut it,
                    OP_SHR,
                    None,
                    Some(Value::int(shift, parts.dest.ty.clone())),
                );
            } else if second_constant && parts.first.ty.scalar_bit_count() <= 16 {
                it = intrinsify_unsigned_division_by_constant(it, false)?;
            } else {
                it = intrinsify_unsigned_division(it, false)?;
            }
            Ok((it, true))
        }
        "sdiv" => {
            if let (Some(a), Some(b)) = (first_lit, second_lit) {
                if b.integer() != 0 {
                    // literal signed division truncates toward zero
                    fold_to_move(
                        &mut it,
                        &parts,
                        Value::int(a.integer() / b.integer(), parts.first.ty.clone()),
                    );
                    return Ok((it, true));
                }
            }
            if second_lit.is_some_and(|b| is_power_of_two(b.integer())) {
                let shift = log2_of(second_lit.map_or(1, |l| l.integer()));
                replace_opcode_and_args(
                    &mut it,
                    OP_ASR,
                    None,
                    Some(Value::int(shift, parts.dest.ty.clone())),
                );
            } else if second_constant && parts.first.ty.scalar_bit_count() <= 16 {
                it = intrinsify_signed_division_by_constant(it, false)?;
            } else {
                it = intrinsify_signed_division(it, false)?;
            }
            Ok((it, true))
        }
        // LLVM-IR names it urem, SPIR-V umod
        "urem" | "umod" => {
            if let (Some(a), Some(b)) = (first_lit, second_lit) {
                if b.integer() != 0 {
                    let remainder = a.to_immediate() % b.to_immediate();
                    fold_to_move(&mut it, &parts, Value::int(i64::from(remainder), parts.first.ty.clone()));
                    return Ok((it, true));
                }
            }
            if second_lit.is_some_and(|b| is_power_of_two(b.integer())) {
                let mask = second_lit.map_or(1, |l| l.integer()) - 1;
                replace_opcode_and_args(
                    &mut it,
                    OP_AND,
                    None,
                    Some(Value::int(mask, parts.dest.ty.clone())),
                );
            } else if second_constant && parts.first.ty.scalar_bit_count() <= 16 {
                it = intrinsify_unsigned_division_by_constant(it, true)?;
            } else {
                it = intrinsify_unsigned_division(it, true)?;
            }
            Ok((it, true))
        }
        "srem" => {
            if let (Some(a), Some(b)) = (first_lit, second_lit) {
                if b.integer() != 0 {
                    fold_to_move(
                        &mut it,
                        &parts,
                        Value::int(a.integer() % b.integer(), parts.first.ty.clone()),
                    );
                    return Ok((it, true));
                }
            }
            if second_constant && parts.first.ty.scalar_bit_count() <= 16 {
                it = intrinsify_signed_division_by_constant(it, true)?;
            } else {
                it = intrinsify_signed_division(it, true)?;
            }
            Ok((it, true))
        }
        "fdiv" => {
            if let (Some(a), Some(b)) = (first_lit, second_lit) {
                fold_to_move(
                    &mut it,
                    &parts,
                    Value::real(a.real() / b.real(), parts.first.ty.clone()),
                );
            } else if let Some(b) = second_lit {
                // divide by constant: multiply with the constant inverse
                replace_opcode_and_args(
                    &mut it,
                    OP_FMUL,
                    None,
                    Some(Value::real(1.0 / b.real(), TYPE_FLOAT)),
                );
            } else if allow_recip {
                let divisor = parts.second.clone().unwrap_or(UNDEFINED_VALUE);
                it = insert_sfu_call(it, REG_SFU_RECIP, &divisor, parts.condition)?;
                replace_opcode_and_args(
                    &mut it,
                    OP_FMUL,
                    None,
                    Some(Value::register(REG_SFU_OUT, parts.first.ty.clone())),
                );
            } else {
                it = intrinsify_floating_division(it)?;
            }
            Ok((it, true))
        }
        "trunc" => {
            if saturate {
                // the pack modes handle the saturation
                let signed = !parts.decorations.contains(Decorations::UNSIGNED_RESULT);
                it = insert_saturation(it, &parts.first, &parts.dest, signed)?;
                it.erase();
                it.previous_in_block();
            } else if parts.first.ty.scalar_bit_count() > 32
                && parts.dest.ty.scalar_bit_count() == 32
            {
                // the upper half of 64-bit values is discarded anyway
                let mut inst = Instruction::mov(parts.dest.clone(), parts.first.clone())
                    .with_condition(parts.condition)
                    .with_decorations(parts.decorations);
                if parts.set_flags {
                    inst = inst.with_set_flags();
                }
                it.reset(inst);
            } else if parts.dest.ty.scalar_bit_count() < 32 {
                let mask = i64::from(parts.dest.ty.scalar_width_mask());
                replace_opcode_and_args(
                    &mut it,
                    OP_AND,
                    None,
                    Some(Value::int(mask, TYPE_INT32)),
                );
            } else {
                return Ok((it, false));
            }
            Ok((it, true))
        }
        "fptrunc" => {
            if saturate {
                return Err(opt_err(
                    "Saturation on floating-point conversion is not supported",
                    &parts.dest,
                ));
            }
            it = insert_float_conversion(it, &parts.first, &parts.dest)?;
            it.erase();
            it.previous_in_block();
            Ok((it, true))
        }
        "ashr" => {
            replace_opcode(&mut it, OP_ASR);
            Ok((it, true))
        }
        "lshr" => {
            replace_opcode(&mut it, OP_SHR);
            Ok((it, true))
        }
        "sitofp" => {
            if parts.first.ty.scalar_bit_count() < 32 {
                let tmp = it.method_mut().add_new_local(TYPE_INT32, "%sitofp");
                it = insert_sign_extension(it, &parts.first, &tmp, parts.condition, false)?;
                replace_opcode_and_args(&mut it, OP_ITOF, Some(tmp), None);
            } else {
                replace_opcode(&mut it, OP_ITOF);
            }
            Ok((it, true))
        }
        "uitofp" => {
            let bits = parts.first.ty.scalar_bit_count();
            if bits < 32 {
                // clear the leading bits first
                let tmp = it.method_mut().add_new_local(TYPE_INT32, "%uitofp");
                let mask = i64::from(parts.first.ty.scalar_width_mask());
                it.emplace(
                    Instruction::binary(
                        OP_AND,
                        tmp.clone(),
                        parts.first.clone(),
                        Value::int(mask, TYPE_INT32),
                    )
                    .with_condition(parts.condition),
                );
                it.next_in_block();
                replace_opcode_and_args(&mut it, OP_ITOF, Some(tmp), None);
            } else if bits > 32 {
                return Err(CompilationError::new(
                    CompilationStep::Optimizer,
                    "Can't convert long to floating value, since long is not supported",
                ));
            } else {
                // itof reads its input as signed; strip the sign bit before
                // converting and add 2^31 back whenever it was set
                let low_bits = it.method_mut().add_new_local(TYPE_INT32, "%uitofp");
                let tmp = it.method_mut().add_new_local(TYPE_FLOAT, "%uitofp");
                it.emplace(
                    Instruction::binary(
                        OP_AND,
                        NOP_REGISTER,
                        parts.first.clone(),
                        Value::int(i64::from(1u32 << 31), TYPE_INT32),
                    )
                    .with_set_flags(),
                );
                it.next_in_block();
                it.emplace(Instruction::binary(
                    OP_AND,
                    low_bits.clone(),
                    parts.first.clone(),
                    Value::int(i64::from(i32::MAX), TYPE_INT32),
                ));
                it.next_in_block();
                it.emplace(
                    Instruction::unary(OP_ITOF, tmp.clone(), low_bits)
                        .with_decorations(parts.decorations),
                );
                it.next_in_block();
                it.emplace(
                    Instruction::mov(parts.dest.clone(), tmp.clone())
                        .with_condition(ConditionCode::ZeroSet),
                );
                it.next_in_block();
                it.reset(
                    Instruction::binary(
                        OP_FADD,
                        parts.dest.clone(),
                        tmp,
                        Value::real(f64::from(2u32.pow(31)), TYPE_FLOAT),
                    )
                    .with_condition(ConditionCode::ZeroClear)
                    .with_decorations(parts.decorations),
                );
            }
            Ok((it, true))
        }
        "fptosi" => {
            replace_opcode(&mut it, OP_FTOI);
            Ok((it, true))
        }
        "fptoui" => {
            replace_opcode(&mut it, OP_FTOI);
            it.modify(|inst| inst.decorations |= Decorations::UNSIGNED_RESULT);
            Ok((it, true))
        }
        "sext" => {
            it = insert_sign_extension(
                it,
                &parts.first,
                &parts.dest,
                parts.condition,
                parts.set_flags,
            )?;
            it.erase();
            it.previous_in_block();
            Ok((it, true))
        }
        "zext" => {
            it = insert_zero_extension(
                it,
                &parts.first,
                &parts.dest,
                parts.condition,
                parts.set_flags,
            )?;
            it.erase();
            it.previous_in_block();
            Ok((it, true))
        }
        _ => Ok((it, false)),
    }
}

// ---------------------------------------------------------------------------
// The normalization pass
// ---------------------------------------------------------------------------

/// Apply the first matching rewrite to the current instruction. Returns the
/// walker plus whether anything changed.
fn intrinsify_instruction<'m>(
    it: InstructionWalker<'m>,
    options: &LoweringOptions,
    diags: &mut DiagnosticBag,
) -> Result<(InstructionWalker<'m>, bool)> {
    let is_candidate = matches!(
        it.get().map(|inst| &inst.kind),
        Some(InstructionKind::Op { .. }) | Some(InstructionKind::Call { .. })
    );
    if !is_candidate {
        // fail fast, everything below only handles operations and calls
        return Ok((it, false));
    }

    // pre-calculation: a fully literal native operation becomes a move
    let mut it = it;
    if let Some(inst) = it.get() {
        if matches!(inst.kind, InstructionKind::Op { .. }) {
            if let Some(folded) = inst.precalculate() {
                let dest = inst.output().cloned().unwrap_or(UNDEFINED_VALUE);
                let original = inst.clone();
                reset_to_move(&mut it, dest, folded, &original);
                return Ok((it, true));
            }
        }
    }

    let (it, changed) = intrinsify_comparison(it)?;
    if changed {
        return Ok((it, true));
    }
    let (it, changed) = intrinsify_work_item_functions(it)?;
    if changed {
        return Ok((it, true));
    }
    let (it, changed) = intrinsify_nonary(it)?;
    if changed {
        return Ok((it, true));
    }
    let (it, changed) = intrinsify_unary(it)?;
    if changed {
        return Ok((it, true));
    }
    let (it, changed) = intrinsify_binary(it, diags)?;
    if changed {
        return Ok((it, true));
    }
    let (it, changed) = intrinsify_ternary(it)?;
    if changed {
        return Ok((it, true));
    }
    let (it, changed) = intrinsify_image_function(it)?;
    if changed {
        return Ok((it, true));
    }
    intrinsify_arithmetic(it, options)
}

/// Rewrite all intrinsic calls and abstract operations of one method into
/// native instruction sequences, iterating to a fixed point since lowerings
/// may introduce further calls or abstract operations.
pub fn normalize_method(
    method: &mut Method,
    options: &LoweringOptions,
    diags: &mut DiagnosticBag,
) -> Result<()> {
    loop {
        let mut changed = false;
        let mut it = method.walk_method();
        while !it.is_end_of_method() {
            let (walker, did_change) = intrinsify_instruction(it, options, diags)?;
            it = walker;
            changed |= did_change;
            it.next_in_method();
        }
        if !changed {
            return Ok(());
        }
    }
}

/// After normalization no method call may remain; anything left is a call to
/// an unresolved external function.
pub fn check_no_remaining_calls(method: &Method) -> Result<()> {
    for (block, _) in method.blocks() {
        for (_, inst) in method.block_instructions(block) {
            if let InstructionKind::Call { name, .. } = &inst.kind {
                return Err(CompilationError::with_value(
                    CompilationStep::Optimizer,
                    "Unresolved call to external function",
                    name,
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_ir::{BlockId, Method, DEFAULT_BLOCK_NAME};
    use quill_isa::{
        Register, Signal, REG_ELEMENT_NUMBER, TYPE_INT16, TYPE_UINT16, TYPE_UINT32, TYPE_UINT8,
    };
    use std::collections::HashMap;

    fn new_method() -> Method {
        let mut method = Method::new("test");
        let label = method.find_or_create_local(DataType::Label, DEFAULT_BLOCK_NAME);
        method.add_block(label);
        method
    }

    fn all_instructions(method: &Method) -> Vec<Instruction> {
        let blocks: Vec<BlockId> = method.blocks().map(|(id, _)| id).collect();
        blocks
            .into_iter()
            .flat_map(|block| {
                method
                    .block_instructions(block)
                    .map(|(_, inst)| inst.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // A lane-wise evaluator executing lowered sequences over 16 lanes,
    // with per-lane flags, conditional execution, rotation, replication
    // and SFU semantics.
    // ------------------------------------------------------------------

    #[derive(Clone, Copy, Default)]
    struct LaneFlags {
        zero: bool,
        negative: bool,
    }

    #[derive(Default)]
    struct Evaluator {
        locals: HashMap<quill_ir::LocalId, [u32; 16]>,
        flags: [LaneFlags; 16],
        r4: [u32; 16],
        r5: [u32; 16],
    }

    impl Evaluator {
        fn set_scalar(&mut self, value: &Value, x: u32) {
            self.set_lanes(value, [x; 16]);
        }

        fn set_lanes(&mut self, value: &Value, lanes: [u32; 16]) {
            let id = value.local_id().expect("expected a local value");
            self.locals.insert(id, lanes);
        }

        fn lanes(&self, value: &Value) -> [u32; 16] {
            self.read(value)
        }

        fn scalar(&self, value: &Value) -> u32 {
            self.read(value)[0]
        }

        fn read(&self, value: &Value) -> [u32; 16] {
            match &value.kind {
                ValueKind::Literal(lit) => [lit.to_immediate(); 16],
                ValueKind::SmallImm(imm) => {
                    [imm.as_literal().map_or(0, |l| l.to_immediate()); 16]
                }
                ValueKind::Register(reg) => {
                    if *reg == REG_ELEMENT_NUMBER {
                        core::array::from_fn(|i| i as u32)
                    } else if *reg == REG_SFU_OUT {
                        self.r4
                    } else if *reg == REG_ACC5 {
                        self.r5
                    } else {
                        [0; 16]
                    }
                }
                ValueKind::Local(id) => self.locals.get(id).copied().unwrap_or([0; 16]),
                ValueKind::Container(elements) => {
                    let mut out = [0u32; 16];
                    for (i, elem) in elements.iter().enumerate().take(16) {
                        out[i] = elem.literal_value().map_or(0, |l| l.to_immediate());
                    }
                    out
                }
                ValueKind::Undefined => [0; 16],
            }
        }

        fn cond_mask(&self, cond: ConditionCode) -> [bool; 16] {
            core::array::from_fn(|i| match cond {
                ConditionCode::Always => true,
                ConditionCode::Never => false,
                ConditionCode::ZeroSet => self.flags[i].zero,
                ConditionCode::ZeroClear => !self.flags[i].zero,
                ConditionCode::NegativeSet => self.flags[i].negative,
                ConditionCode::NegativeClear => !self.flags[i].negative,
                ConditionCode::CarrySet | ConditionCode::CarryClear => {
                    panic!("carry flags are not modelled")
                }
            })
        }

        fn trigger_sfu(&mut self, reg: Register, vals: [u32; 16]) {
            self.r4 = core::array::from_fn(|i| {
                let x = f64::from(f32::from_bits(vals[i]));
                let y = match reg.num {
                    52 => 1.0 / x,
                    53 => 1.0 / x.sqrt(),
                    54 => x.exp2(),
                    55 => x.log2(),
                    _ => 0.0,
                };
                (y as f32).to_bits()
            });
        }

        fn write(&mut self, dest: &Value, vals: [u32; 16], mask: [bool; 16]) {
            match &dest.kind {
                ValueKind::Local(id) => {
                    let entry = self.locals.entry(*id).or_insert([0; 16]);
                    for i in 0..16 {
                        if mask[i] {
                            entry[i] = vals[i];
                        }
                    }
                }
                ValueKind::Register(reg) => {
                    if *reg == REG_ACC5 {
                        if mask[0] {
                            self.r5 = [vals[0]; 16];
                        }
                    } else if reg.triggers_sfu() {
                        self.trigger_sfu(*reg, vals);
                    }
                    // nop-register and periphery writes are dropped
                }
                _ => {}
            }
        }

        fn step(&mut self, inst: &Instruction) {
            let mask = self.cond_mask(inst.condition);
            let result = match &inst.kind {
                InstructionKind::Move { dest, src } => Some((dest.clone(), self.read(src))),
                InstructionKind::LoadImmediate { dest, immediate } => {
                    Some((dest.clone(), [immediate.to_immediate(); 16]))
                }
                InstructionKind::Rotation { dest, src, offset } => {
                    let s = self.read(src);
                    let imm = offset
                        .small_immediate()
                        .expect("rotation offset must be a small immediate");
                    let k = if imm.is_rotation_by_r5() {
                        (self.r5[0] & 0xF) as usize
                    } else {
                        usize::from(imm.rotation_offset().expect("rotation immediate"))
                    };
                    Some((
                        dest.clone(),
                        core::array::from_fn(|j| s[(j + 16 - k) % 16]),
                    ))
                }
                InstructionKind::Op {
                    op,
                    dest,
                    first,
                    second,
                } => {
                    let native = op.native().expect("abstract op reached the evaluator");
                    let a = self.read(first);
                    let b = second.as_ref().map(|s| self.read(s));
                    let vals = core::array::from_fn(|i| {
                        let la = Literal::Int(i64::from(a[i] as i32));
                        let lb = b.map(|bv| Literal::Int(i64::from(bv[i] as i32)));
                        native
                            .precalculate(&la, lb.as_ref())
                            .expect("opcode without evaluator")
                            .to_immediate()
                    });
                    Some((dest.clone(), vals))
                }
                InstructionKind::Nop { .. }
                | InstructionKind::Mutex { .. }
                | InstructionKind::Semaphore { .. }
                | InstructionKind::MemoryBarrier { .. }
                | InstructionKind::LifetimeBoundary { .. } => None,
                other => panic!("evaluator does not support {:?}", other),
            };
            if let Some((dest, vals)) = result {
                if inst.set_flags {
                    for i in 0..16 {
                        if mask[i] {
                            self.flags[i] = LaneFlags {
                                zero: vals[i] == 0,
                                negative: (vals[i] as i32) < 0,
                            };
                        }
                    }
                }
                self.write(&dest, vals, mask);
            }
        }

        fn run(&mut self, method: &Method) {
            for inst in all_instructions(method) {
                self.step(&inst);
            }
        }
    }

    fn normalize(method: &mut Method) -> DiagnosticBag {
        let mut diags = DiagnosticBag::new();
        normalize_method(method, &LoweringOptions::default(), &mut diags)
            .expect("normalization should succeed");
        diags
    }

    // ------------------------------------------------------------------
    // Numeric laws
    // ------------------------------------------------------------------

    #[test]
    fn division_constants_for_seven() {
        let (factor, shift) = division_constants(7, DIVISION_ACCURACY).unwrap();
        assert_eq!(shift, 18);
        assert_eq!(factor, 37449);
        assert!(division_constants(0, DIVISION_ACCURACY).is_err());
    }

    #[test]
    fn make_positive_is_absolute_value() {
        for x in [-1234567i64, -128, -37, -1, 0, 1, 99, 70000, 2000000000] {
            let mut method = new_method();
            let src = method.add_new_local(TYPE_INT32, "%x");
            let it = method.walk_method();
            let (_, dest) = insert_make_positive(it, &src).unwrap();
            let mut env = Evaluator::default();
            env.set_scalar(&src, x as u32);
            env.run(&method);
            assert_eq!(env.scalar(&dest), x.unsigned_abs() as u32, "|{}|", x);
        }
    }

    #[test]
    fn invert_sign_under_always_and_never() {
        for x in [-1000i64, -1, 0, 5, 123456] {
            let mut method = new_method();
            let src = method.add_new_local(TYPE_INT32, "%x");
            let dest = method.add_new_local(TYPE_INT32, "%neg");
            let it = method.walk_method();
            insert_invert_sign(it, &src, &dest, ConditionCode::Always).unwrap();
            let mut env = Evaluator::default();
            env.set_scalar(&src, x as u32);
            env.run(&method);
            assert_eq!(env.scalar(&dest), (-x) as u32);

            let mut method = new_method();
            let src = method.add_new_local(TYPE_INT32, "%x");
            let dest = method.add_new_local(TYPE_INT32, "%same");
            let it = method.walk_method();
            insert_invert_sign(it, &src, &dest, ConditionCode::Never).unwrap();
            let mut env = Evaluator::default();
            env.set_scalar(&src, x as u32);
            env.run(&method);
            assert_eq!(env.scalar(&dest), x as u32);
        }
    }

    #[test]
    fn constant_reciprocal_division_matches_exact() {
        for d in [3u32, 5, 6, 7, 9, 11, 13, 100, 255, 3000, 10000] {
            let samples = (0..=65535u32)
                .step_by(251)
                .chain([0, 1, d - 1, d, d + 1, 65535]);
            for n in samples {
                let mut method = new_method();
                let num = method.add_new_local(TYPE_UINT16, "%n");
                let quot = method.add_new_local(TYPE_UINT16, "%q");
                let rem = method.add_new_local(TYPE_UINT16, "%r");
                method.append_to_end(Instruction::named_op(
                    "udiv",
                    quot.clone(),
                    num.clone(),
                    Some(Value::int(i64::from(d), TYPE_UINT16)),
                ));
                method.append_to_end(Instruction::named_op(
                    "urem",
                    rem.clone(),
                    num.clone(),
                    Some(Value::int(i64::from(d), TYPE_UINT16)),
                ));
                normalize(&mut method);
                let mut env = Evaluator::default();
                env.set_scalar(&num, n);
                env.run(&method);
                assert_eq!(env.scalar(&quot), n / d, "{} / {}", n, d);
                assert_eq!(env.scalar(&rem), n % d, "{} mod {}", n, d);
            }
        }
    }

    #[test]
    fn iterative_division_satisfies_euclid() {
        for (n, d) in [
            (100u32, 7u32),
            (65535, 255),
            (123456789, 1000),
            (5, 9),
            (0, 3),
            (1 << 30, 3),
            (999999, 999),
        ] {
            let mut method = new_method();
            let num = method.add_new_local(TYPE_UINT32, "%n");
            let div = method.add_new_local(TYPE_UINT32, "%d");
            let quot = method.add_new_local(TYPE_UINT32, "%q");
            let rem = method.add_new_local(TYPE_UINT32, "%r");
            method.append_to_end(Instruction::named_op(
                "udiv",
                quot.clone(),
                num.clone(),
                Some(div.clone()),
            ));
            method.append_to_end(Instruction::named_op(
                "urem",
                rem.clone(),
                num.clone(),
                Some(div.clone()),
            ));
            normalize(&mut method);
            let mut env = Evaluator::default();
            env.set_scalar(&num, n);
            env.set_scalar(&div, d);
            env.run(&method);
            let (q, r) = (env.scalar(&quot), env.scalar(&rem));
            assert_eq!(q, n / d, "{} / {}", n, d);
            assert_eq!(r, n % d, "{} mod {}", n, d);
            assert_eq!(q * d + r, n);
        }
    }

    #[test]
    fn multiplication_split_matches_wrapping_product() {
        for (x, y) in [
            (0i64, 0i64),
            (1, 1),
            (3, 3),
            (65535, 65535),
            (12345, 12345),
            (100000, 100000),
            (-7, 3),
            (-300, -41),
            (123456, 789),
        ] {
            let mut method = new_method();
            let a = method.add_new_local(TYPE_INT32, "%a");
            let b = method.add_new_local(TYPE_INT32, "%b");
            let out = method.add_new_local(TYPE_INT32, "%out");
            method.append_to_end(Instruction::named_op(
                "mul",
                out.clone(),
                a.clone(),
                Some(b.clone()),
            ));
            normalize(&mut method);
            let mut env = Evaluator::default();
            env.set_scalar(&a, x as u32);
            env.set_scalar(&b, y as u32);
            env.run(&method);
            assert_eq!(
                env.scalar(&out),
                (x as u32).wrapping_mul(y as u32),
                "{} * {}",
                x,
                y
            );
        }
    }

    #[test]
    fn small_multiplication_uses_mul24() {
        let mut method = new_method();
        let a = method.add_new_local(TYPE_UINT16, "%a");
        let b = method.add_new_local(TYPE_UINT16, "%b");
        let out = method.add_new_local(TYPE_UINT16, "%out");
        method.append_to_end(Instruction::named_op(
            "mul",
            out.clone(),
            a.clone(),
            Some(b.clone()),
        ));
        normalize(&mut method);
        let instructions = all_instructions(&method);
        assert_eq!(instructions.len(), 1);
        assert!(matches!(
            &instructions[0].kind,
            InstructionKind::Op { op, .. } if op.name() == "mul24"
        ));
        let mut env = Evaluator::default();
        env.set_scalar(&a, 311);
        env.set_scalar(&b, 199);
        env.run(&method);
        assert_eq!(env.scalar(&out), 311 * 199);
    }

    #[test]
    fn signed_division_of_literals_folds_toward_zero() {
        let mut method = new_method();
        let out = method.add_new_local(TYPE_INT32, "%out");
        method.append_to_end(Instruction::named_op(
            "sdiv",
            out.clone(),
            Value::int(-7, TYPE_INT32),
            Some(Value::int(2, TYPE_INT32)),
        ));
        normalize(&mut method);
        let instructions = all_instructions(&method);
        // the whole operation folds, no sign-invert sequence is emitted
        assert_eq!(instructions.len(), 1);
        match &instructions[0].kind {
            InstructionKind::Move { src, .. } => {
                assert_eq!(src.literal_value().unwrap().integer(), -3);
            }
            other => panic!("expected a folded move, got {:?}", other),
        }
    }

    // ------------------------------------------------------------------
    // Vector helpers
    // ------------------------------------------------------------------

    fn lanes_with(values: &[u32]) -> [u32; 16] {
        let mut out = [0u32; 16];
        out[..values.len()].copy_from_slice(values);
        out
    }

    #[test]
    fn vector_shuffle_identity_collapses_to_move() {
        let mut method = new_method();
        let vec_ty = TYPE_INT32.to_vector(4);
        let a = method.add_new_local(vec_ty.clone(), "%a");
        let b = method.add_new_local(vec_ty.clone(), "%b");
        let dest = method.add_new_local(vec_ty.clone(), "%dest");
        let mask = Value::container(
            (0..4).map(|i| Value::int(i, TYPE_INT8)).collect(),
            TYPE_INT8.to_vector(4),
        );
        let it = method.walk_method();
        insert_vector_shuffle(it, &dest, &a, &b, &mask).unwrap();
        let instructions = all_instructions(&method);
        assert_eq!(instructions.len(), 1);
        assert!(matches!(instructions[0].kind, InstructionKind::Move { .. }));
        let mut env = Evaluator::default();
        env.set_lanes(&a, lanes_with(&[10, 11, 12, 13]));
        env.run(&method);
        assert_eq!(env.lanes(&dest)[..4], [10, 11, 12, 13]);
    }

    #[test]
    fn vector_shuffle_all_same_replicates_the_lane() {
        let mut method = new_method();
        let vec_ty = TYPE_INT32.to_vector(4);
        let a = method.add_new_local(vec_ty.clone(), "%a");
        let b = method.add_new_local(vec_ty.clone(), "%b");
        let dest = method.add_new_local(vec_ty.clone(), "%dest");
        let mask = Value::container(
            vec![Value::int(2, TYPE_INT8); 4],
            TYPE_INT8.to_vector(4),
        );
        let it = method.walk_method();
        insert_vector_shuffle(it, &dest, &a, &b, &mask).unwrap();
        let mut env = Evaluator::default();
        env.set_lanes(&a, lanes_with(&[10, 11, 12, 13]));
        env.run(&method);
        assert!(env.lanes(&dest).iter().all(|&v| v == 12));
    }

    #[test]
    fn vector_shuffle_reverses_lanes_with_prezeroed_destination() {
        let mut method = new_method();
        let vec_ty = TYPE_INT32.to_vector(4);
        let a = method.add_new_local(vec_ty.clone(), "%a");
        let b = method.add_new_local(vec_ty.clone(), "%b");
        let dest = method.add_new_local(vec_ty.clone(), "%dest");
        let mask = Value::container(
            [3i64, 2, 1, 0]
                .iter()
                .map(|&i| Value::int(i, TYPE_INT8))
                .collect(),
            TYPE_INT8.to_vector(4),
        );
        let it = method.walk_method();
        insert_vector_shuffle(it, &dest, &a, &b, &mask).unwrap();

        let instructions = all_instructions(&method);
        let zero_inits = instructions
            .iter()
            .filter(|inst| {
                matches!(&inst.kind, InstructionKind::Move { dest: d, src }
                    if d == &dest && src.has_literal(&Literal::Int(0))
                        && inst.condition == ConditionCode::Always)
            })
            .count();
        assert_eq!(zero_inits, 1, "destination is pre-zeroed exactly once");
        let insertions = instructions
            .iter()
            .filter(|inst| inst.decorations.contains(Decorations::ELEMENT_INSERTION))
            .count();
        assert_eq!(insertions, 4, "one insertion per destination lane");

        let mut env = Evaluator::default();
        env.set_lanes(&a, lanes_with(&[10, 11, 12, 13]));
        env.set_lanes(&b, lanes_with(&[20, 21, 22, 23]));
        env.run(&method);
        assert_eq!(env.lanes(&dest)[..4], [13, 12, 11, 10]);
    }

    #[test]
    fn vector_shuffle_picks_from_second_source() {
        let mut method = new_method();
        let vec_ty = TYPE_INT32.to_vector(4);
        let a = method.add_new_local(vec_ty.clone(), "%a");
        let b = method.add_new_local(vec_ty.clone(), "%b");
        let dest = method.add_new_local(vec_ty.clone(), "%dest");
        let mask = Value::container(
            [5i64, 0, 7, 1]
                .iter()
                .map(|&i| Value::int(i, TYPE_INT8))
                .collect(),
            TYPE_INT8.to_vector(4),
        );
        let it = method.walk_method();
        insert_vector_shuffle(it, &dest, &a, &b, &mask).unwrap();
        let mut env = Evaluator::default();
        env.set_lanes(&a, lanes_with(&[10, 11, 12, 13]));
        env.set_lanes(&b, lanes_with(&[20, 21, 22, 23]));
        env.run(&method);
        assert_eq!(env.lanes(&dest)[..4], [21, 10, 23, 11]);
    }

    #[test]
    fn vector_shuffle_rejects_non_constant_mask() {
        let mut method = new_method();
        let vec_ty = TYPE_INT32.to_vector(4);
        let a = method.add_new_local(vec_ty.clone(), "%a");
        let b = method.add_new_local(vec_ty.clone(), "%b");
        let dest = method.add_new_local(vec_ty.clone(), "%dest");
        let mask = method.add_new_local(TYPE_INT8.to_vector(4), "%mask");
        let it = method.walk_method();
        let err = insert_vector_shuffle(it, &dest, &a, &b, &mask).unwrap_err();
        assert!(err.message.contains("non-constant mask"));
    }

    #[test]
    fn rotation_inserts_wait_register_nop() {
        let mut method = new_method();
        let src = method.add_new_local(TYPE_INT32.to_vector(16), "%src");
        let dest = method.add_new_local(TYPE_INT32.to_vector(16), "%dest");
        let it = method.walk_method();
        insert_vector_rotation(it, &src, &Value::int(3, TYPE_INT8), &dest, Direction::Up)
            .unwrap();
        let instructions = all_instructions(&method);
        assert_eq!(instructions.len(), 2);
        assert!(matches!(
            instructions[0].kind,
            InstructionKind::Nop { reason: DelayReason::WaitRegister }
        ));
        assert!(matches!(instructions[1].kind, InstructionKind::Rotation { .. }));

        let mut env = Evaluator::default();
        env.set_lanes(&src, core::array::from_fn(|i| i as u32 * 10));
        env.run(&method);
        let out = env.lanes(&dest);
        for j in 0..16 {
            assert_eq!(out[j], (((j + 16 - 3) % 16) as u32) * 10);
        }
    }

    // ------------------------------------------------------------------
    // Intrinsics
    // ------------------------------------------------------------------

    #[test]
    fn sfu_rsqrt_lowers_to_trigger_two_waits_and_read() {
        let mut method = new_method();
        let x = method.add_new_local(TYPE_FLOAT, "%x");
        let out = method.add_new_local(TYPE_FLOAT, "%out");
        method.append_to_end(Instruction::call(
            Some(out.clone()),
            "quill_sfu_rsqrt",
            vec![x.clone()],
        ));
        normalize(&mut method);
        let instructions = all_instructions(&method);
        assert_eq!(instructions.len(), 4);
        assert!(matches!(&instructions[0].kind, InstructionKind::Move { dest, .. }
            if dest.get_register() == Some(REG_SFU_RECIP_SQRT)));
        assert!(matches!(
            instructions[1].kind,
            InstructionKind::Nop { reason: DelayReason::WaitSfu }
        ));
        assert!(matches!(
            instructions[2].kind,
            InstructionKind::Nop { reason: DelayReason::WaitSfu }
        ));
        assert!(matches!(&instructions[3].kind, InstructionKind::Move { src, .. }
            if src.get_register() == Some(REG_SFU_OUT)));

        let mut env = Evaluator::default();
        env.set_scalar(&x, 4.0f32.to_bits());
        env.run(&method);
        assert_eq!(f32::from_bits(env.scalar(&out)), 0.5);
    }

    #[test]
    fn local_id_lowering_extracts_packed_byte() {
        let mut method = new_method();
        let out = method.add_new_local(TYPE_INT32, "%id");
        method.append_to_end(Instruction::call(
            Some(out.clone()),
            "quill_local_id",
            vec![Value::int(1, TYPE_INT32)],
        ));
        normalize(&mut method);
        let instructions = all_instructions(&method);
        let names: Vec<&str> = instructions
            .iter()
            .filter_map(|inst| match &inst.kind {
                InstructionKind::Op { op, .. } => Some(op.name()),
                _ => None,
            })
            .collect();
        // the literal-dimension shift amount pre-calculates into a move
        assert_eq!(names, ["shr", "and"]);
        assert!(instructions.iter().any(|inst| matches!(
            &inst.kind,
            InstructionKind::Move { src, .. } if src.has_literal(&Literal::Int(8))
        )));
        assert!(instructions
            .last()
            .unwrap()
            .decorations
            .contains(Decorations::BUILTIN_LOCAL_ID));

        let ids = method.find_local(LOCAL_IDS).expect("packed local created");
        let mut env = Evaluator::default();
        env.locals.insert(ids, [0x0003_0201; 16]);
        env.run(&method);
        assert_eq!(env.scalar(&out), 2);
    }

    #[test]
    fn dynamic_work_group_query_selects_dimension() {
        let mut method = new_method();
        let dim = method.add_new_local(TYPE_INT32, "%dim");
        let out = method.add_new_local(TYPE_INT32, "%groups");
        method.append_to_end(Instruction::call(
            Some(out.clone()),
            "quill_num_groups",
            vec![dim.clone()],
        ));
        normalize(&mut method);
        let x = method.find_local(NUM_GROUPS_X).unwrap();
        let y = method.find_local(NUM_GROUPS_Y).unwrap();
        let z = method.find_local(NUM_GROUPS_Z).unwrap();
        for (d, expected) in [(0u32, 7u32), (1, 8), (2, 9), (5, 1)] {
            let mut env = Evaluator::default();
            env.locals.insert(x, [7; 16]);
            env.locals.insert(y, [8; 16]);
            env.locals.insert(z, [9; 16]);
            env.set_scalar(&dim, d);
            env.run(&method);
            assert_eq!(env.scalar(&out), expected, "num_groups({})", d);
        }
    }

    #[test]
    fn required_work_group_size_substitutes_local_size() {
        let mut method = new_method();
        method.metadata.work_group_sizes = [4, 2, 1];
        let out = method.add_new_local(TYPE_INT32, "%size");
        method.append_to_end(Instruction::call(
            Some(out.clone()),
            "quill_local_size",
            vec![Value::int(0, TYPE_INT32)],
        ));
        normalize(&mut method);
        let instructions = all_instructions(&method);
        assert_eq!(instructions.len(), 1);
        match &instructions[0].kind {
            InstructionKind::Move { src, .. } => {
                assert_eq!(src.literal_value().unwrap().integer(), 4);
            }
            other => panic!("expected substituted literal, got {:?}", other),
        }
        assert!(instructions[0]
            .decorations
            .contains(Decorations::BUILTIN_LOCAL_SIZE));
    }

    #[test]
    fn normalization_removes_all_intrinsic_calls() {
        let mut method = new_method();
        let out0 = method.add_new_local(TYPE_INT8, "%elem");
        let out1 = method.add_new_local(TYPE_INT32, "%id");
        let a = method.add_new_local(TYPE_INT32, "%a");
        let out2 = method.add_new_local(TYPE_INT32, "%prod");
        method.append_to_end(Instruction::call(
            Some(out0),
            "quill_element_number",
            vec![],
        ));
        method.append_to_end(Instruction::call(
            Some(out1),
            "quill_global_id",
            vec![Value::int(0, TYPE_INT32)],
        ));
        method.append_to_end(Instruction::call(
            Some(out2),
            "quill_mul24",
            vec![a.clone(), a],
        ));
        normalize(&mut method);
        check_no_remaining_calls(&method).expect("all intrinsics lowered");
    }

    #[test]
    fn unresolved_external_call_is_reported() {
        let mut method = new_method();
        let out = method.add_new_local(TYPE_INT32, "%x");
        method.append_to_end(Instruction::call(Some(out), "external_helper", vec![]));
        normalize(&mut method);
        let err = check_no_remaining_calls(&method).unwrap_err();
        assert!(err.message.contains("Unresolved call"));
        assert_eq!(err.value.as_deref(), Some("external_helper"));
    }

    #[test]
    fn normalization_is_idempotent() {
        let mut method = new_method();
        let a = method.add_new_local(TYPE_INT32, "%a");
        let b = method.add_new_local(TYPE_INT32, "%b");
        let out = method.add_new_local(TYPE_INT32, "%out");
        let id = method.add_new_local(TYPE_INT32, "%id");
        method.append_to_end(Instruction::call(
            Some(id),
            "quill_local_id",
            vec![Value::int(0, TYPE_INT32)],
        ));
        method.append_to_end(Instruction::named_op(
            "mul",
            out.clone(),
            a.clone(),
            Some(b.clone()),
        ));
        normalize(&mut method);
        let first: Vec<String> = all_instructions(&method)
            .iter()
            .map(Instruction::to_string)
            .collect();
        normalize(&mut method);
        let second: Vec<String> = all_instructions(&method)
            .iter()
            .map(Instruction::to_string)
            .collect();
        assert_eq!(first, second);
    }

    // ------------------------------------------------------------------
    // Conversions
    // ------------------------------------------------------------------

    #[test]
    fn sign_and_zero_extension() {
        let mut method = new_method();
        let src = method.add_new_local(TYPE_INT8, "%narrow");
        let sext = method.add_new_local(TYPE_INT32, "%sext");
        let zext = method.add_new_local(TYPE_INT32, "%zext");
        let it = method.walk_method();
        let it = insert_sign_extension(it, &src, &sext, ConditionCode::Always, false).unwrap();
        insert_zero_extension(it, &src, &zext, ConditionCode::Always, false).unwrap();
        let mut env = Evaluator::default();
        env.set_scalar(&src, 0x80);
        env.run(&method);
        assert_eq!(env.scalar(&sext) as i32, -128);
        assert_eq!(env.scalar(&zext), 0x80);

        let mut env = Evaluator::default();
        env.set_scalar(&src, 0x17F);
        env.run(&method);
        assert_eq!(env.scalar(&sext) as i32, 127);
        assert_eq!(env.scalar(&zext), 0x7F);
    }

    #[test]
    fn saturation_chooses_pack_modes_and_clamps_literals() {
        let cases = [
            (TYPE_INT8, true, PACK_INT_TO_CHAR_TRUNCATE),
            (TYPE_UINT8, false, PACK_INT_TO_UNSIGNED_CHAR_SATURATE),
            (TYPE_INT16, true, PACK_INT_TO_SIGNED_SHORT_SATURATE),
            (TYPE_UINT16, false, PACK_INT_TO_USHORT_TRUNCATE),
            (TYPE_INT32, true, PACK_32_32_SATURATE),
        ];
        for (ty, signed, pack) in cases {
            let mut method = new_method();
            let src = method.add_new_local(TYPE_INT32, "%x");
            let dest = method.add_new_local(ty, "%sat");
            let it = method.walk_method();
            insert_saturation(it, &src, &dest, signed).unwrap();
            let instructions = all_instructions(&method);
            assert_eq!(instructions[0].pack, pack);
        }

        let mut method = new_method();
        let dest = method.add_new_local(TYPE_INT8, "%sat");
        let it = method.walk_method();
        insert_saturation(it, &Value::int(300, TYPE_INT32), &dest, true).unwrap();
        let instructions = all_instructions(&method);
        match &instructions[0].kind {
            InstructionKind::Move { src, .. } => {
                assert_eq!(src.literal_value().unwrap().integer(), 127);
            }
            other => panic!("expected clamped literal move, got {:?}", other),
        }
    }

    #[test]
    fn uitofp_handles_the_high_bit() {
        for (x, expected) in [
            (5u32, 5.0f32),
            (0, 0.0),
            (0x8000_0000, 2147483648.0),
            (0xFFFF_FFFF, 4294967296.0),
        ] {
            let mut method = new_method();
            let src = method.add_new_local(TYPE_UINT32, "%x");
            let out = method.add_new_local(TYPE_FLOAT, "%f");
            method.append_to_end(Instruction::named_op(
                "uitofp",
                out.clone(),
                src.clone(),
                None,
            ));
            normalize(&mut method);
            let mut env = Evaluator::default();
            env.set_scalar(&src, x);
            env.run(&method);
            assert_eq!(f32::from_bits(env.scalar(&out)), expected, "uitofp({})", x);
        }
    }

    #[test]
    fn newton_raphson_division_approximates_quotient() {
        for (n, d) in [(1.0f32, 3.0f32), (10.0, 4.0), (7.5, 2.5), (100.0, 7.0)] {
            let mut method = new_method();
            let num = method.add_new_local(TYPE_FLOAT, "%n");
            let div = method.add_new_local(TYPE_FLOAT, "%d");
            let out = method.add_new_local(TYPE_FLOAT, "%q");
            method.append_to_end(Instruction::named_op(
                "fdiv",
                out.clone(),
                num.clone(),
                Some(div.clone()),
            ));
            normalize(&mut method);
            let mut env = Evaluator::default();
            env.set_scalar(&num, n.to_bits());
            env.set_scalar(&div, d.to_bits());
            env.run(&method);
            let got = f32::from_bits(env.scalar(&out));
            let expected = n / d;
            assert!(
                (got - expected).abs() <= expected.abs() * 1e-5,
                "{} / {} = {} (got {})",
                n,
                d,
                expected,
                got
            );
        }
    }

    // ------------------------------------------------------------------
    // Comparisons, memory, indices
    // ------------------------------------------------------------------

    #[test]
    fn comparisons_produce_boolean_results() {
        let cases: [(&str, u32, u32, u32); 6] = [
            ("eq", 5, 5, 1),
            ("ne", 5, 5, 0),
            ("slt", 3, 9, 1),
            ("sgt", (-3i32) as u32, 2, 0),
            ("ult", 0xFFFF_FFF0, 2, 0),
            ("uge", 0xFFFF_FFF0, 2, 1),
        ];
        for (pred, a_val, b_val, expected) in cases {
            let mut method = new_method();
            let a = method.add_new_local(TYPE_INT32, "%a");
            let b = method.add_new_local(TYPE_INT32, "%b");
            let out = method.add_new_local(quill_isa::TYPE_BOOL, "%cmp");
            method.append_to_end(Instruction::named_op(
                pred,
                out.clone(),
                a.clone(),
                Some(b.clone()),
            ));
            normalize(&mut method);
            let mut env = Evaluator::default();
            env.set_scalar(&a, a_val);
            env.set_scalar(&b, b_val);
            env.run(&method);
            assert_eq!(env.scalar(&out), expected, "{} {} {}", a_val, pred, b_val);
        }
    }

    #[test]
    fn dma_write_holds_the_mutex() {
        let mut method = new_method();
        let value = method.add_new_local(TYPE_INT32.to_vector(16), "%v");
        let addr = method.add_new_local(
            DataType::pointer_to(TYPE_INT32, AddressSpace::Global),
            "%p",
        );
        method.append_to_end(Instruction::call(
            None,
            "quill_dma_write",
            vec![addr, value],
        ));
        normalize(&mut method);
        let instructions = all_instructions(&method);
        assert!(matches!(
            instructions.first().unwrap().kind,
            InstructionKind::Mutex { lock: true }
        ));
        assert!(matches!(
            instructions.last().unwrap().kind,
            InstructionKind::Mutex { lock: false }
        ));
        let setups = instructions
            .iter()
            .filter(|inst| matches!(inst.kind, InstructionKind::LoadImmediate { .. }))
            .count();
        assert_eq!(setups, 2, "VPM write setup plus DMA store setup");
        check_no_remaining_calls(&method).unwrap();
    }

    #[test]
    fn dma_read_goes_through_the_tmu() {
        let mut method = new_method();
        let out = method.add_new_local(TYPE_INT32.to_vector(16), "%v");
        let addr = method.add_new_local(
            DataType::pointer_to(TYPE_INT32, AddressSpace::Global),
            "%p",
        );
        method.append_to_end(Instruction::call(
            Some(out),
            "quill_dma_read",
            vec![addr],
        ));
        normalize(&mut method);
        let instructions = all_instructions(&method);
        assert_eq!(instructions.len(), 3);
        assert!(matches!(&instructions[0].kind, InstructionKind::Move { dest, .. }
            if dest.get_register() == Some(REG_TMU0_ADDRESS)));
        assert_eq!(instructions[1].signal, Signal::LoadTmu0);
        assert!(matches!(&instructions[2].kind, InstructionKind::Move { src, .. }
            if src.get_register() == Some(REG_SFU_OUT)));
    }

    #[test]
    fn prefetch_is_discarded_with_a_warning() {
        let mut method = new_method();
        let addr = method.add_new_local(
            DataType::pointer_to(TYPE_INT32, AddressSpace::Global),
            "%p",
        );
        method.append_to_end(Instruction::call(
            None,
            "quill_prefetch",
            vec![addr, Value::int(16, TYPE_INT32)],
        ));
        let diags = normalize(&mut method);
        assert_eq!(diags.warning_count(), 1);
        assert_eq!(method.count_instructions(), 0);
    }

    #[test]
    fn index_calculation_folds_literal_offsets() {
        let mut method = new_method();
        let ptr_ty = DataType::pointer_to(TYPE_INT32, AddressSpace::Global);
        let base_id = method.add_parameter(
            "%buf",
            ptr_ty.clone(),
            quill_ir::ParameterDecorations::NONE,
            "int*",
        );
        let base = Value::local(base_id, ptr_ty.clone());
        let dest = method.add_new_local(ptr_ty, "%gep");
        let it = method.walk_method();
        insert_calculate_indices(it, &base, &dest, &[Value::int(3, TYPE_INT32)], true).unwrap();
        let instructions = all_instructions(&method);
        assert_eq!(instructions.len(), 1);
        match &instructions[0].kind {
            InstructionKind::Op { op, second, .. } => {
                assert_eq!(op.name(), "add");
                assert_eq!(
                    second.as_ref().unwrap().literal_value().unwrap().integer(),
                    12
                );
            }
            other => panic!("expected pointer add, got {:?}", other),
        }
        let dest_id = dest.local_id().unwrap();
        assert_eq!(method.local(dest_id).reference, Some((base_id, 3)));
    }

    #[test]
    fn index_calculation_emits_multiply_for_dynamic_index() {
        let mut method = new_method();
        let ptr_ty = DataType::pointer_to(TYPE_INT32, AddressSpace::Global);
        let base = method.add_new_local(ptr_ty.clone(), "%buf");
        let index = method.add_new_local(TYPE_INT32, "%i");
        let dest = method.add_new_local(ptr_ty, "%gep");
        let it = method.walk_method();
        insert_calculate_indices(it, &base, &dest, &[index.clone()], true).unwrap();
        let has_mul = all_instructions(&method).iter().any(|inst| {
            matches!(&inst.kind, InstructionKind::Op { op, .. } if op.name() == "mul")
        });
        assert!(has_mul, "dynamic index needs a multiplication");
    }

    #[test]
    fn struct_member_access_uses_layout_offset() {
        let mut method = new_method();
        let struct_ty = DataType::Struct {
            name: "pair".to_string(),
            elements: vec![TYPE_INT8, TYPE_INT32],
        };
        let ptr_ty = DataType::pointer_to(struct_ty, AddressSpace::Global);
        let member_ptr_ty = DataType::pointer_to(TYPE_INT32, AddressSpace::Global);
        let base = method.add_new_local(ptr_ty, "%s");
        let dest = method.add_new_local(member_ptr_ty, "%member");
        let it = method.walk_method();
        insert_calculate_indices(
            it,
            &base,
            &dest,
            &[Value::int(0, TYPE_INT32), Value::int(1, TYPE_INT32)],
            true,
        )
        .unwrap();
        let instructions = all_instructions(&method);
        match &instructions[0].kind {
            InstructionKind::Op { second, .. } => {
                assert_eq!(
                    second.as_ref().unwrap().literal_value().unwrap().integer(),
                    4
                );
            }
            other => panic!("expected literal offset, got {:?}", other),
        }
    }

    #[test]
    fn struct_member_access_rejects_dynamic_index() {
        let mut method = new_method();
        let struct_ty = DataType::Struct {
            name: "pair".to_string(),
            elements: vec![TYPE_INT8, TYPE_INT32],
        };
        let ptr_ty = DataType::pointer_to(struct_ty, AddressSpace::Global);
        let base = method.add_new_local(ptr_ty.clone(), "%s");
        let index = method.add_new_local(TYPE_INT32, "%i");
        let dest = method.add_new_local(ptr_ty, "%member");
        let it = method.walk_method();
        let err = insert_calculate_indices(
            it,
            &base,
            &dest,
            &[Value::int(0, TYPE_INT32), index.clone()],
            true,
        )
        .unwrap_err();
        assert!(err.message.contains("non-literal index"));
    }

    #[test]
    fn semaphore_id_must_be_a_small_literal() {
        let mut method = new_method();
        method.append_to_end(Instruction::call(
            None,
            "quill_semaphore_increment",
            vec![Value::int(17, TYPE_INT32)],
        ));
        let mut diags = DiagnosticBag::new();
        let err = normalize_method(&mut method, &LoweringOptions::default(), &mut diags)
            .unwrap_err();
        assert!(err.message.contains("between 0 and 15"));
    }
}
