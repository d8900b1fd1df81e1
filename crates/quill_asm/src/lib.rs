//! Backend of the compiler: packing instructions into 64-bit words, the
//! simple register assignment, and serialization of the module binary with
//! its kernel-info records and global-data segment.
//!
//! Each instruction word pairs one add-ALU and one mul-ALU operation with
//! condition codes, pack/unpack modes, signaling bits and the operand
//! selectors; unused slots carry nops. The module binary starts with a 64-bit
//! magic (the 32-bit magic written twice), a module-info bitfield, the
//! kernel-info records, a zero delimiter, the global-data segment padded to
//! 8-byte multiples, another zero delimiter, and the instruction stream.

use quill_diag::{CompilationError, CompilationStep, DiagnosticBag, Result};
use quill_isa::{
    AluSide, ConditionCode, DataType, Register, RegisterFile, Signal, SmallImmediate,
    NUM_QPUS, REG_MUTEX, REG_NOP, REG_UNIFORM,
};
use quill_ir::{
    Decorations, Instruction, InstructionKind, Literal, LocalId, Method, Module, Parameter,
    ParameterDecorations, Value, ValueKind, GLOBAL_DATA_ADDRESS, GROUP_ID_X, GROUP_ID_Y,
    GROUP_ID_Z, GLOBAL_OFFSET_X, GLOBAL_OFFSET_Y, GLOBAL_OFFSET_Z, LOCAL_IDS, LOCAL_SIZES,
    NUM_GROUPS_X, NUM_GROUPS_Y, NUM_GROUPS_Z, WORK_DIMENSIONS,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Write;

/// 32-bit module magic, written twice to form the 64-bit header word.
pub const MODULE_MAGIC: u32 = 0x51494C4C;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum OutputMode {
    Binary,
    Hex,
    Assembler,
}

fn codegen_err(message: &str, value: impl std::fmt::Display) -> CompilationError {
    CompilationError::with_value(CompilationStep::CodeGeneration, message, value)
}

// ---------------------------------------------------------------------------
// Bitfield plumbing
// ---------------------------------------------------------------------------

fn set_field(word: &mut u64, shift: u32, width: u32, value: u64) {
    let mask = (1u64 << width) - 1;
    *word = (*word & !(mask << shift)) | ((value & mask) << shift);
}

fn get_field(word: u64, shift: u32, width: u32) -> u64 {
    (word >> shift) & ((1u64 << width) - 1)
}

// ALU instruction word layout
const SIG: (u32, u32) = (60, 4);
const UNPACK: (u32, u32) = (57, 3);
const PM: (u32, u32) = (56, 1);
const PACK: (u32, u32) = (52, 4);
const COND_ADD: (u32, u32) = (49, 3);
const COND_MUL: (u32, u32) = (46, 3);
const SET_FLAGS: (u32, u32) = (45, 1);
const WRITE_SWAP: (u32, u32) = (44, 1);
const WADDR_ADD: (u32, u32) = (38, 6);
const WADDR_MUL: (u32, u32) = (32, 6);
const OP_MUL_FIELD: (u32, u32) = (29, 3);
const OP_ADD_FIELD: (u32, u32) = (24, 5);
const RADDR_A: (u32, u32) = (18, 6);
const RADDR_B: (u32, u32) = (12, 6);
const ADD_A: (u32, u32) = (9, 3);
const ADD_B: (u32, u32) = (6, 3);
const MUL_A: (u32, u32) = (3, 3);
const MUL_B: (u32, u32) = (0, 3);

// secondary type selector for signal-14 words (load immediate, semaphore)
const IMMEDIATE_KIND: (u32, u32) = (57, 3);
const IMMEDIATE_KIND_LOAD32: u64 = 0;
const IMMEDIATE_KIND_SEMAPHORE: u64 = 4;
const SEMAPHORE_INCREMENT: (u32, u32) = (4, 1);
const SEMAPHORE_ID: (u32, u32) = (0, 4);

// branch words
const BRANCH_COND: (u32, u32) = (52, 4);
const BRANCH_RELATIVE: (u32, u32) = (51, 1);

const WADDR_NOP: u64 = 39;
const RADDR_NOP: u64 = 39;
const MUX_ACC0: u64 = 0;
const MUX_REGFILE_A: u64 = 6;
const MUX_REGFILE_B: u64 = 7;

/// Operand sources of one packed instruction: at most one register-file A
/// read, one register-file B read or small immediate, and the accumulators.
#[derive(Default)]
struct OperandSlots {
    raddr_a: Option<u64>,
    raddr_b: Option<u64>,
    small_imm: Option<u8>,
}

impl OperandSlots {
    /// Pick the input multiplexer value for a register read, claiming a
    /// register-file slot when needed.
    fn mux_for_register(&mut self, reg: Register) -> Result<u64> {
        match reg.file {
            RegisterFile::Accumulator => {
                if reg.num > 5 {
                    return Err(codegen_err("Invalid accumulator", reg));
                }
                Ok(MUX_ACC0 + u64::from(reg.num))
            }
            RegisterFile::PhysicalA => self.claim_a(u64::from(reg.num)),
            RegisterFile::PhysicalB => self.claim_b(u64::from(reg.num)),
            RegisterFile::PhysicalAny => match self.claim_a(u64::from(reg.num)) {
                Ok(mux) => Ok(mux),
                Err(_) => self.claim_b(u64::from(reg.num)),
            },
        }
    }

    fn claim_a(&mut self, addr: u64) -> Result<u64> {
        match self.raddr_a {
            None => {
                self.raddr_a = Some(addr);
                Ok(MUX_REGFILE_A)
            }
            Some(existing) if existing == addr => Ok(MUX_REGFILE_A),
            Some(existing) => Err(codegen_err(
                "Cannot read two different file-A registers in one instruction",
                format!("{} and {}", existing, addr),
            )),
        }
    }

    fn claim_b(&mut self, addr: u64) -> Result<u64> {
        if self.small_imm.is_some() {
            return Err(codegen_err(
                "Register-file B read conflicts with a small immediate",
                addr,
            ));
        }
        match self.raddr_b {
            None => {
                self.raddr_b = Some(addr);
                Ok(MUX_REGFILE_B)
            }
            Some(existing) if existing == addr => Ok(MUX_REGFILE_B),
            Some(existing) => Err(codegen_err(
                "Cannot read two different file-B registers in one instruction",
                format!("{} and {}", existing, addr),
            )),
        }
    }

    /// Small immediates share the register-file B slot; both operands of one
    /// instruction may only use a single encoded value.
    fn mux_for_immediate(&mut self, imm: SmallImmediate) -> Result<u64> {
        if self.raddr_b.is_some() {
            return Err(codegen_err(
                "Small immediate conflicts with a register-file B read",
                imm,
            ));
        }
        match self.small_imm {
            None => {
                self.small_imm = Some(imm.0);
                Ok(MUX_REGFILE_B)
            }
            Some(existing) if existing == imm.0 => Ok(MUX_REGFILE_B),
            Some(existing) => Err(codegen_err(
                "Both operands require different small immediates",
                format!("{} and {}", existing, imm.0),
            )),
        }
    }

    fn apply(&self, word: &mut u64) {
        set_field(word, RADDR_A.0, RADDR_A.1, self.raddr_a.unwrap_or(RADDR_NOP));
        if let Some(imm) = self.small_imm {
            set_field(word, SIG.0, SIG.1, u64::from(Signal::SmallImmediate.encoding()));
            set_field(word, RADDR_B.0, RADDR_B.1, u64::from(imm));
        } else {
            set_field(word, RADDR_B.0, RADDR_B.1, self.raddr_b.unwrap_or(RADDR_NOP));
        }
    }
}

fn encode_write_address(word: &mut u64, reg: Register, side: AluSide) -> Result<()> {
    let addr = match reg.file {
        RegisterFile::Accumulator => match reg.num {
            0..=3 => 32 + u64::from(reg.num),
            5 => 37,
            _ => return Err(codegen_err("Register is not writeable", reg)),
        },
        _ => u64::from(reg.num),
    };
    // ws=0 routes the add result to file A and the mul result to file B
    let needs_swap = match (side, reg.file) {
        (AluSide::Add, RegisterFile::PhysicalB) => true,
        (AluSide::Mul, RegisterFile::PhysicalA) => true,
        _ => false,
    };
    match side {
        AluSide::Mul => set_field(word, WADDR_MUL.0, WADDR_MUL.1, addr),
        _ => set_field(word, WADDR_ADD.0, WADDR_ADD.1, addr),
    }
    if needs_swap {
        set_field(word, WRITE_SWAP.0, WRITE_SWAP.1, 1);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Register assignment
// ---------------------------------------------------------------------------

/// Map every used local onto a hardware register.
///
/// Locals feeding vector rotations get accumulators r0..r3 (rotation inputs
/// must be accumulators). For the rest, each instruction reading two distinct
/// file registers needs them in different files, and a small immediate
/// occupies the file-B read slot, so a local paired with an inline constant
/// cannot live in file B. The assignment walks the locals in creation order
/// and greedily picks a file satisfying those constraints, falling back to a
/// free accumulator; a local whose constraints cannot be met is a hard error,
/// there is no spilling.
pub fn assign_registers(method: &Method) -> Result<HashMap<LocalId, Register>> {
    let mut mapping = HashMap::new();
    let mut rotation_inputs = Vec::new();
    let mut needs_a: HashSet<LocalId> = HashSet::new();
    let mut needs_b: HashSet<LocalId> = HashSet::new();
    let mut paired: Vec<(LocalId, LocalId)> = Vec::new();
    for (block, _) in method.blocks() {
        for (_, inst) in method.block_instructions(block) {
            if let InstructionKind::Rotation { src, .. } = &inst.kind {
                if let Some(id) = src.local_id() {
                    if !rotation_inputs.contains(&id) {
                        rotation_inputs.push(id);
                    }
                }
            }
            if let InstructionKind::Op {
                first,
                second: Some(second),
                ..
            } = &inst.kind
            {
                match (first.local_id(), second.local_id()) {
                    (Some(a), Some(b)) if a != b => paired.push((a, b)),
                    (Some(local), None) | (None, Some(local)) => {
                        let other = if first.local_id().is_some() { second } else { first };
                        match &other.kind {
                            // the literal claims the file-B slot
                            ValueKind::Literal(_) | ValueKind::SmallImm(_) => {
                                needs_a.insert(local);
                            }
                            ValueKind::Register(reg) => match reg.file {
                                RegisterFile::PhysicalA => {
                                    needs_b.insert(local);
                                }
                                RegisterFile::PhysicalB => {
                                    needs_a.insert(local);
                                }
                                _ => {}
                            },
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    if rotation_inputs.len() > 4 {
        return Err(codegen_err(
            "Too many distinct vector-rotation inputs for the accumulators",
            rotation_inputs.len(),
        ));
    }
    let mut next_accumulator = 0u8;
    for id in &rotation_inputs {
        mapping.insert(
            *id,
            Register::new(RegisterFile::Accumulator, next_accumulator),
        );
        next_accumulator += 1;
    }

    let mut next_a = 0u8;
    let mut next_b = 0u8;
    let mut prefer_a = true;
    for (id, local) in method.locals() {
        if mapping.contains_key(&id)
            || local.is_unused()
            || matches!(local.ty, DataType::Label)
        {
            continue;
        }
        let conflicts_with = |file: RegisterFile| {
            paired.iter().any(|(a, b)| {
                let partner = if *a == id {
                    Some(*b)
                } else if *b == id {
                    Some(*a)
                } else {
                    None
                };
                partner
                    .and_then(|p| mapping.get(&p))
                    .is_some_and(|reg: &Register| reg.file == file)
            })
        };
        let can_a =
            !needs_b.contains(&id) && next_a < 32 && !conflicts_with(RegisterFile::PhysicalA);
        let can_b =
            !needs_a.contains(&id) && next_b < 32 && !conflicts_with(RegisterFile::PhysicalB);
        let reg = if can_a && (needs_a.contains(&id) || !can_b || prefer_a) {
            next_a += 1;
            prefer_a = false;
            Register::new(RegisterFile::PhysicalA, next_a - 1)
        } else if can_b {
            next_b += 1;
            prefer_a = true;
            Register::new(RegisterFile::PhysicalB, next_b - 1)
        } else if next_accumulator < 4 {
            next_accumulator += 1;
            Register::new(RegisterFile::Accumulator, next_accumulator - 1)
        } else {
            return Err(codegen_err(
                "Register pressure too high, no register satisfies the operand constraints",
                &local.name,
            ));
        };
        mapping.insert(id, reg);
    }
    Ok(mapping)
}

// ---------------------------------------------------------------------------
// Instruction encoding
// ---------------------------------------------------------------------------

struct Encoder<'a> {
    method: &'a Method,
    registers: &'a HashMap<LocalId, Register>,
    labels: HashMap<LocalId, usize>,
}

/// The encoded code of one kernel: the packed words plus one mnemonic line
/// per word for the textual output modes.
pub struct KernelCode {
    pub words: Vec<u64>,
    pub texts: Vec<String>,
}

impl<'a> Encoder<'a> {
    fn resolve_register(&self, value: &Value) -> Result<Register> {
        match &value.kind {
            ValueKind::Register(reg) => Ok(*reg),
            ValueKind::Local(id) => self.registers.get(id).copied().ok_or_else(|| {
                codegen_err(
                    "Local without an assigned register",
                    &self.method.local(*id).name,
                )
            }),
            other => Err(codegen_err("Value is not a register", format!("{:?}", other))),
        }
    }

    fn operand_mux(&self, value: &Value, slots: &mut OperandSlots) -> Result<u64> {
        match &value.kind {
            ValueKind::Literal(lit) => {
                let imm = small_immediate_for(lit).ok_or_else(|| {
                    codegen_err(
                        "Constant is not encodable as a small immediate",
                        lit,
                    )
                })?;
                slots.mux_for_immediate(imm)
            }
            ValueKind::SmallImm(imm) => slots.mux_for_immediate(*imm),
            ValueKind::Undefined => Ok(MUX_ACC0),
            _ => {
                let reg = self.resolve_register(value)?;
                slots.mux_for_register(reg)
            }
        }
    }

    fn encode_extras(&self, word: &mut u64, inst: &Instruction, side: AluSide) {
        set_field(word, SIG.0, SIG.1, u64::from(inst.signal.encoding()));
        set_field(word, UNPACK.0, UNPACK.1, u64::from(inst.unpack.0 & 0x7));
        set_field(word, PACK.0, PACK.1, u64::from(inst.pack.0));
        if matches!(side, AluSide::Mul) && inst.pack.has_effect() {
            set_field(word, PM.0, PM.1, 1);
        }
        let cond = u64::from(inst.condition.encoding());
        match side {
            AluSide::Mul => {
                set_field(word, COND_MUL.0, COND_MUL.1, cond);
                set_field(word, COND_ADD.0, COND_ADD.1, u64::from(ConditionCode::Never.encoding()));
            }
            _ => {
                set_field(word, COND_ADD.0, COND_ADD.1, cond);
                set_field(word, COND_MUL.0, COND_MUL.1, u64::from(ConditionCode::Never.encoding()));
            }
        }
        if inst.set_flags {
            set_field(word, SET_FLAGS.0, SET_FLAGS.1, 1);
        }
    }

    fn nop_word(&self, signal: Signal) -> u64 {
        let mut word = 0u64;
        set_field(&mut word, SIG.0, SIG.1, u64::from(signal.encoding()));
        set_field(&mut word, COND_ADD.0, COND_ADD.1, u64::from(ConditionCode::Never.encoding()));
        set_field(&mut word, COND_MUL.0, COND_MUL.1, u64::from(ConditionCode::Never.encoding()));
        set_field(&mut word, WADDR_ADD.0, WADDR_ADD.1, WADDR_NOP);
        set_field(&mut word, WADDR_MUL.0, WADDR_MUL.1, WADDR_NOP);
        set_field(&mut word, RADDR_A.0, RADDR_A.1, RADDR_NOP);
        set_field(&mut word, RADDR_B.0, RADDR_B.1, RADDR_NOP);
        word
    }

    /// Encode one ALU operation (or move, as `or`/`v8min` with two identical
    /// inputs) into a word.
    fn encode_alu(
        &self,
        inst: &Instruction,
        op: quill_isa::OpCode,
        dest: &Value,
        first: &Value,
        second: Option<&Value>,
    ) -> Result<u64> {
        let side = match op.side {
            AluSide::Any => AluSide::Add,
            side => side,
        };
        let mut word = self.nop_word(Signal::None);
        self.encode_extras(&mut word, inst, side);
        let mut slots = OperandSlots::default();
        let mux_first = self.operand_mux(first, &mut slots)?;
        let mux_second = match second {
            Some(second) => self.operand_mux(second, &mut slots)?,
            None => mux_first,
        };
        slots.apply(&mut word);
        let dest_reg = self.resolve_register(dest)?;
        encode_write_address(&mut word, dest_reg, side)?;
        match side {
            AluSide::Mul => {
                set_field(&mut word, OP_MUL_FIELD.0, OP_MUL_FIELD.1, u64::from(op.code));
                set_field(&mut word, MUL_A.0, MUL_A.1, mux_first);
                set_field(&mut word, MUL_B.0, MUL_B.1, mux_second);
            }
            _ => {
                set_field(&mut word, OP_ADD_FIELD.0, OP_ADD_FIELD.1, u64::from(op.code));
                set_field(&mut word, ADD_A.0, ADD_A.1, mux_first);
                set_field(&mut word, ADD_B.0, ADD_B.1, mux_second);
            }
        }
        Ok(word)
    }

    fn encode_load_immediate(
        &self,
        inst: &Instruction,
        dest: &Value,
        immediate: Literal,
    ) -> Result<u64> {
        let mut word = 0u64;
        set_field(&mut word, SIG.0, SIG.1, u64::from(Signal::LoadImmediate.encoding()));
        set_field(&mut word, IMMEDIATE_KIND.0, IMMEDIATE_KIND.1, IMMEDIATE_KIND_LOAD32);
        set_field(&mut word, COND_ADD.0, COND_ADD.1, u64::from(inst.condition.encoding()));
        set_field(&mut word, COND_MUL.0, COND_MUL.1, u64::from(ConditionCode::Never.encoding()));
        if inst.set_flags {
            set_field(&mut word, SET_FLAGS.0, SET_FLAGS.1, 1);
        }
        set_field(&mut word, WADDR_MUL.0, WADDR_MUL.1, WADDR_NOP);
        let dest_reg = self.resolve_register(dest)?;
        encode_write_address(&mut word, dest_reg, AluSide::Add)?;
        set_field(&mut word, 0, 32, u64::from(immediate.to_immediate()));
        Ok(word)
    }

    fn encode_semaphore(&self, inst: &Instruction, id: u8, increase: bool) -> Result<u64> {
        let mut word = 0u64;
        set_field(&mut word, SIG.0, SIG.1, u64::from(Signal::LoadImmediate.encoding()));
        set_field(&mut word, IMMEDIATE_KIND.0, IMMEDIATE_KIND.1, IMMEDIATE_KIND_SEMAPHORE);
        set_field(&mut word, COND_ADD.0, COND_ADD.1, u64::from(inst.condition.encoding()));
        set_field(&mut word, COND_MUL.0, COND_MUL.1, u64::from(ConditionCode::Never.encoding()));
        set_field(&mut word, WADDR_ADD.0, WADDR_ADD.1, WADDR_NOP);
        set_field(&mut word, WADDR_MUL.0, WADDR_MUL.1, WADDR_NOP);
        set_field(&mut word, SEMAPHORE_INCREMENT.0, SEMAPHORE_INCREMENT.1, u64::from(increase));
        set_field(&mut word, SEMAPHORE_ID.0, SEMAPHORE_ID.1, u64::from(id));
        Ok(word)
    }

    fn encode_branch(&self, inst: &Instruction, target: LocalId) -> Result<u64> {
        let index = self.labels.get(&target).copied().ok_or_else(|| {
            codegen_err("Branch to unknown label", &self.method.local(target).name)
        })?;
        let mut word = 0u64;
        set_field(&mut word, SIG.0, SIG.1, u64::from(Signal::Branch.encoding()));
        let on_all = inst
            .decorations
            .contains(Decorations::BRANCH_ON_ALL_ELEMENTS);
        let cond = match (inst.condition, on_all) {
            (ConditionCode::Always, _) => 15u64,
            (ConditionCode::ZeroSet, true) => 0,
            (ConditionCode::ZeroClear, true) => 1,
            (ConditionCode::ZeroSet, false) => 2,
            (ConditionCode::ZeroClear, false) => 3,
            (ConditionCode::NegativeSet, true) => 4,
            (ConditionCode::NegativeClear, true) => 5,
            (ConditionCode::NegativeSet, false) => 6,
            (ConditionCode::NegativeClear, false) => 7,
            (other, _) => {
                return Err(codegen_err("Condition not encodable on a branch", other))
            }
        };
        set_field(&mut word, BRANCH_COND.0, BRANCH_COND.1, cond);
        set_field(&mut word, BRANCH_RELATIVE.0, BRANCH_RELATIVE.1, 0);
        set_field(&mut word, WADDR_ADD.0, WADDR_ADD.1, WADDR_NOP);
        set_field(&mut word, WADDR_MUL.0, WADDR_MUL.1, WADDR_NOP);
        // absolute byte offset into the code segment
        set_field(&mut word, 0, 32, (index * 8) as u64);
        Ok(word)
    }

    fn encode_instruction(&self, inst: &Instruction, words: &mut Vec<u64>, texts: &mut Vec<String>) -> Result<()> {
        let mut push = |word: u64, text: String| {
            words.push(word);
            texts.push(text);
        };
        match &inst.kind {
            InstructionKind::Move { dest, src } => {
                let word = self.encode_alu(inst, quill_isa::OP_OR, dest, src, Some(src))?;
                push(word, inst.to_string());
            }
            InstructionKind::Rotation { dest, src, offset } => {
                let src_reg = self.resolve_register(src)?;
                if !src_reg.is_accumulator() {
                    return Err(codegen_err(
                        "Vector-rotation input must be an accumulator",
                        src_reg,
                    ));
                }
                let imm = offset.small_immediate().ok_or_else(|| {
                    codegen_err("Vector-rotation offset must be a small immediate", inst)
                })?;
                let mut word = self.nop_word(Signal::SmallImmediate);
                self.encode_extras(&mut word, inst, AluSide::Mul);
                set_field(&mut word, SIG.0, SIG.1, u64::from(Signal::SmallImmediate.encoding()));
                set_field(&mut word, RADDR_B.0, RADDR_B.1, u64::from(imm.0));
                set_field(&mut word, OP_MUL_FIELD.0, OP_MUL_FIELD.1, u64::from(quill_isa::OP_V8MIN.code));
                let mux = MUX_ACC0 + u64::from(src_reg.num);
                set_field(&mut word, MUL_A.0, MUL_A.1, mux);
                set_field(&mut word, MUL_B.0, MUL_B.1, mux);
                let dest_reg = self.resolve_register(dest)?;
                encode_write_address(&mut word, dest_reg, AluSide::Mul)?;
                push(word, inst.to_string());
            }
            InstructionKind::Op { op, dest, first, second } => {
                let native = op.native().ok_or_else(|| {
                    codegen_err("Unsupported operation reached code generation", inst)
                })?;
                let word = self.encode_alu(inst, native, dest, first, second.as_ref())?;
                push(word, inst.to_string());
            }
            InstructionKind::LoadImmediate { dest, immediate } => {
                let word = self.encode_load_immediate(inst, dest, *immediate)?;
                push(word, inst.to_string());
            }
            InstructionKind::Nop { reason } => {
                let word = self.nop_word(inst.signal);
                push(word, format!("nop ({})", reason));
            }
            InstructionKind::Semaphore { id, increase } => {
                let word = self.encode_semaphore(inst, *id, *increase)?;
                push(word, inst.to_string());
            }
            InstructionKind::Mutex { lock } => {
                // the mutex is acquired by reading its register and released
                // by writing it
                let word = if *lock {
                    self.encode_alu(
                        inst,
                        quill_isa::OP_OR,
                        &Value::register(REG_NOP, DataType::Unknown),
                        &Value::register(REG_MUTEX, DataType::Unknown),
                        Some(&Value::register(REG_MUTEX, DataType::Unknown)),
                    )?
                } else {
                    self.encode_alu(
                        inst,
                        quill_isa::OP_OR,
                        &Value::register(REG_MUTEX, DataType::Unknown),
                        &quill_ir::INT_ZERO,
                        Some(&quill_ir::INT_ZERO),
                    )?
                };
                push(word, inst.to_string());
            }
            InstructionKind::Branch { target, .. } => {
                let word = self.encode_branch(inst, *target)?;
                push(word, inst.to_string());
                // the processor executes three delay slots after a branch
                for _ in 0..3 {
                    push(self.nop_word(Signal::None), "nop (branch-delay)".to_string());
                }
            }
            InstructionKind::Return { .. } => {
                push(self.nop_word(Signal::ProgramEnd), "nop (program-end)".to_string());
                push(self.nop_word(Signal::None), "nop (thread-end)".to_string());
                push(self.nop_word(Signal::None), "nop (thread-end)".to_string());
            }
            InstructionKind::Call { name, .. } => {
                return Err(codegen_err("Unresolved call to external function", name));
            }
            InstructionKind::Label { .. }
            | InstructionKind::MemoryBarrier { .. }
            | InstructionKind::LifetimeBoundary { .. } => {
                // no machine instruction
            }
        }
        Ok(())
    }
}

fn small_immediate_for(lit: &Literal) -> Option<SmallImmediate> {
    match lit {
        Literal::Real(r) => SmallImmediate::from_float(*r as f32),
        other => i32::try_from(other.integer())
            .ok()
            .and_then(SmallImmediate::from_integer),
    }
}

/// Uniforms are delivered in a fixed order before the kernel parameters:
/// the work-item info words, the group counts/ids/offsets, and the
/// global-data base address. Only locals the kernel actually reads are
/// loaded.
const UNIFORM_ORDER: [&str; 13] = [
    WORK_DIMENSIONS,
    LOCAL_SIZES,
    LOCAL_IDS,
    NUM_GROUPS_X,
    NUM_GROUPS_Y,
    NUM_GROUPS_Z,
    GROUP_ID_X,
    GROUP_ID_Y,
    GROUP_ID_Z,
    GLOBAL_OFFSET_X,
    GLOBAL_OFFSET_Y,
    GLOBAL_OFFSET_Z,
    GLOBAL_DATA_ADDRESS,
];

/// Generate the machine code of one method: the uniform-reading prologue,
/// then every instruction of every block in order.
pub fn generate_method_code(method: &Method) -> Result<KernelCode> {
    let registers = assign_registers(method)?;
    let mut words = Vec::new();
    let mut texts = Vec::new();

    // prologue: read the well-known uniforms, then the parameters
    let mut prologue: Vec<LocalId> = Vec::new();
    for name in UNIFORM_ORDER {
        if let Some(id) = method.find_local(name) {
            if !method.local(id).is_unused() {
                prologue.push(id);
            }
        }
    }
    for param in &method.parameters {
        prologue.push(param.local);
    }

    let mut labels = HashMap::new();
    {
        // label positions need the prologue length plus every preceding word
        let mut offset = prologue.len();
        for (block_id, block) in method.blocks() {
            labels.insert(block.label, offset);
            for (_, inst) in method.block_instructions(block_id) {
                offset += words_for_instruction(inst);
            }
        }
    }

    let encoder = Encoder {
        method,
        registers: &registers,
        labels,
    };
    for id in prologue {
        let ty = method.local(id).ty.clone();
        let dest = Value::local(id, ty.clone());
        let src = Value::register(REG_UNIFORM, ty);
        let inst = Instruction::mov(dest, src);
        encoder.encode_instruction(&inst, &mut words, &mut texts)?;
        let last = texts.len() - 1;
        texts[last] = format!("mov {}, unif", method.local(id).name);
    }
    for (block_id, _) in method.blocks() {
        for (_, inst) in method.block_instructions(block_id) {
            encoder.encode_instruction(inst, &mut words, &mut texts)?;
        }
    }
    Ok(KernelCode { words, texts })
}

fn words_for_instruction(inst: &Instruction) -> usize {
    match &inst.kind {
        InstructionKind::Label { .. }
        | InstructionKind::MemoryBarrier { .. }
        | InstructionKind::LifetimeBoundary { .. } => 0,
        InstructionKind::Branch { .. } => 4,
        InstructionKind::Return { .. } => 3,
        _ => 1,
    }
}

// ---------------------------------------------------------------------------
// Kernel info records
// ---------------------------------------------------------------------------

fn write_word(out: &mut dyn Write, word: u64, mode: OutputMode) -> std::io::Result<()> {
    match mode {
        OutputMode::Binary => out.write_all(&word.to_le_bytes()),
        OutputMode::Hex => writeln!(
            out,
            "0x{:08x}, 0x{:08x}, ",
            word & 0xFFFF_FFFF,
            word >> 32
        ),
        OutputMode::Assembler => Ok(()),
    }
}

/// Write a name padded with zero bytes to a multiple of 8; returns the number
/// of words written.
fn copy_name(out: &mut dyn Write, name: &str, mode: OutputMode) -> std::io::Result<usize> {
    let bytes = name.as_bytes();
    let words = bytes.len().div_ceil(8).max(1);
    for i in 0..words {
        let mut buf = [0u8; 8];
        let start = i * 8;
        let end = (start + 8).min(bytes.len());
        if start < bytes.len() {
            buf[..end - start].copy_from_slice(&bytes[start..end]);
        }
        write_word(out, u64::from_le_bytes(buf), mode)?;
    }
    Ok(words)
}

fn name_words(name: &str) -> usize {
    name.len().div_ceil(8).max(1)
}

/// One kernel parameter record: a 64-bit bitfield plus the parameter and type
/// names.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParamInfo {
    pub value: u64,
    pub name: String,
    pub type_name: String,
}

macro_rules! bitfield_accessors {
    ($get:ident, $set:ident, $shift:expr, $width:expr) => {
        pub fn $get(&self) -> u64 {
            get_field(self.value, $shift, $width)
        }
        pub fn $set(&mut self, value: u64) {
            set_field(&mut self.value, $shift, $width, value);
        }
    };
}

macro_rules! bitfield_flag {
    ($get:ident, $set:ident, $bit:expr) => {
        pub fn $get(&self) -> bool {
            get_field(self.value, $bit, 1) != 0
        }
        pub fn $set(&mut self, value: bool) {
            set_field(&mut self.value, $bit, 1, u64::from(value));
        }
    };
}

impl ParamInfo {
    bitfield_accessors!(size, set_size, 0, 8);
    bitfield_accessors!(elements, set_elements, 8, 8);
    bitfield_accessors!(name_length, set_name_length, 16, 8);
    bitfield_accessors!(type_name_length, set_type_name_length, 24, 8);
    bitfield_flag!(pointer, set_pointer, 32);
    bitfield_flag!(input, set_input, 33);
    bitfield_flag!(output, set_output, 34);
    bitfield_flag!(constant, set_constant, 35);
    bitfield_flag!(restricted, set_restricted, 36);
    bitfield_flag!(is_volatile, set_volatile, 37);
    bitfield_flag!(signed, set_signed, 38);
    bitfield_flag!(unsigned, set_unsigned, 39);
    bitfield_flag!(float_type, set_float_type, 40);
    bitfield_flag!(image, set_image, 41);
    bitfield_accessors!(address_space, set_address_space, 48, 8);

    pub fn set_name(&mut self, name: &str) {
        self.set_name_length(name.len() as u64);
        self.name = name.to_string();
    }

    pub fn set_type_name(&mut self, type_name: &str) {
        self.set_type_name_length(type_name.len() as u64);
        self.type_name = type_name.to_string();
    }

    pub fn word_count(&self) -> usize {
        1 + name_words(&self.name) + name_words(&self.type_name)
    }

    fn write(&self, out: &mut dyn Write, mode: OutputMode) -> std::io::Result<usize> {
        write_word(out, self.value, mode)?;
        let mut words = 1;
        words += copy_name(out, &self.name, mode)?;
        words += copy_name(out, &self.type_name, mode)?;
        Ok(words)
    }

    pub fn describe(&self) -> String {
        format!(
            "{} {} ({} B, {} items)",
            self.type_name,
            self.name,
            self.size(),
            self.elements()
        )
    }
}

/// One kernel record: the bitfield, the packed required work-group size, the
/// kernel name and the parameter records.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KernelInfo {
    pub value: u64,
    pub work_group_size: u64,
    pub name: String,
    pub parameters: Vec<ParamInfo>,
}

impl KernelInfo {
    bitfield_accessors!(offset, set_offset, 0, 16);
    bitfield_accessors!(length, set_length, 16, 16);
    bitfield_accessors!(name_length, set_name_length, 32, 8);
    bitfield_accessors!(param_count, set_param_count, 40, 8);
    bitfield_flag!(explicit_work_group_size, set_explicit_work_group_size, 48);

    pub fn set_name(&mut self, name: &str) {
        self.set_name_length(name.len() as u64);
        self.name = name.to_string();
    }

    pub fn word_count(&self) -> usize {
        2 + name_words(&self.name)
            + self.parameters.iter().map(ParamInfo::word_count).sum::<usize>()
    }

    fn write(&self, out: &mut dyn Write, mode: OutputMode) -> std::io::Result<usize> {
        if mode == OutputMode::Hex || mode == OutputMode::Assembler {
            writeln!(out, "// {}", self.describe())?;
        }
        if mode == OutputMode::Assembler {
            return Ok(0);
        }
        write_word(out, self.value, mode)?;
        write_word(out, self.work_group_size, mode)?;
        let mut words = 2;
        words += copy_name(out, &self.name, mode)?;
        for param in &self.parameters {
            words += param.write(out, mode)?;
        }
        Ok(words)
    }

    pub fn describe(&self) -> String {
        let params: Vec<String> = self.parameters.iter().map(ParamInfo::describe).collect();
        format!(
            "Kernel '{}' with {} instructions, offset {}, parameters: {}",
            self.name,
            self.length(),
            self.offset(),
            params.join(", ")
        )
    }
}

fn param_info_for(param: &Parameter) -> ParamInfo {
    let mut info = ParamInfo::default();
    let ty = &param.ty;
    info.set_size(u64::from(ty.physical_width() & 0xFF));
    info.set_pointer(ty.is_pointer() || ty.is_image());
    info.set_elements(if ty.is_pointer() {
        1
    } else {
        u64::from(ty.vector_width())
    });
    info.set_input(param.is_input());
    info.set_output(param.is_output());
    info.set_constant(param.decorations.contains(ParameterDecorations::READ_ONLY));
    info.set_restricted(param.decorations.contains(ParameterDecorations::RESTRICT));
    info.set_volatile(param.decorations.contains(ParameterDecorations::VOLATILE));
    info.set_signed(param.decorations.contains(ParameterDecorations::SIGN_EXTEND));
    info.set_unsigned(param.decorations.contains(ParameterDecorations::ZERO_EXTEND));
    info.set_float_type(ty.is_float());
    info.set_image(ty.is_image());
    info.set_address_space(u64::from(
        ty.address_space()
            .unwrap_or(quill_isa::AddressSpace::Private)
            .encoding(),
    ));
    info.set_name(param.name.strip_prefix('%').unwrap_or(&param.name));
    if param.type_name.is_empty() {
        info.set_type_name(&ty.opencl_name());
    } else {
        let type_name = param.type_name.clone();
        info.set_type_name(&type_name);
    }
    info
}

/// Build the kernel record for a compiled method. The offset and length are
/// in instruction words relative to the start of the code segment.
pub fn get_kernel_info(
    method: &Method,
    offset: usize,
    num_instructions: usize,
    diags: &mut DiagnosticBag,
) -> KernelInfo {
    let mut info = KernelInfo::default();
    info.set_offset(offset as u64);
    info.set_length(num_instructions as u64);
    let name = method
        .name
        .strip_prefix('@')
        .or_else(|| method.name.strip_prefix('%'))
        .unwrap_or(&method.name);
    info.set_name(name);
    info.set_param_count(method.parameters.len() as u64);
    info.set_explicit_work_group_size(method.metadata.has_explicit_work_group_size());

    let mut packed = 0u64;
    let mut required = 1u64;
    for (dim, size) in method.metadata.work_group_sizes.iter().enumerate() {
        packed |= u64::from(*size & 0xFFFF) << (dim * 16);
        required *= u64::from((*size).max(1));
    }
    info.work_group_size = packed;
    if required > u64::from(NUM_QPUS) {
        diags.warn(format!(
            "Required work-group size {} exceeds the limit of {}",
            required, NUM_QPUS
        ));
    }
    let hinted: u64 = method
        .metadata
        .work_group_size_hints
        .iter()
        .map(|size| u64::from((*size).max(1)))
        .product();
    if hinted > u64::from(NUM_QPUS) {
        diags.warn(format!(
            "Work-group size hint {} exceeds the limit of {}",
            hinted, NUM_QPUS
        ));
    }

    for param in &method.parameters {
        info.parameters.push(param_info_for(param));
    }
    info
}

// ---------------------------------------------------------------------------
// Module serialization
// ---------------------------------------------------------------------------

/// The module-info bitfield heading the binary.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub value: u64,
}

impl ModuleInfo {
    bitfield_accessors!(kernel_count, set_kernel_count, 0, 16);
    bitfield_accessors!(global_data_offset, set_global_data_offset, 16, 16);
    bitfield_accessors!(global_data_size, set_global_data_size, 32, 16);
    bitfield_accessors!(stack_frame_size, set_stack_frame_size, 48, 16);
}

fn value_to_binary(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match &value.kind {
        ValueKind::Container(elements) => {
            for element in elements {
                value_to_binary(element, out)?;
            }
            Ok(())
        }
        ValueKind::Literal(lit) => {
            let element_width = value.ty.element_type().physical_width().clamp(1, 4) as usize;
            let lanes = usize::from(value.ty.vector_width());
            let bytes = lit.to_immediate().to_le_bytes();
            for _ in 0..lanes {
                out.extend_from_slice(&bytes[..element_width]);
            }
            Ok(())
        }
        ValueKind::Undefined => {
            // reserve the space, e.g. for uninitialized arrays
            out.extend(std::iter::repeat(0u8).take(value.ty.physical_width() as usize));
            Ok(())
        }
        other => Err(codegen_err(
            "Can't map value-type to binary literal",
            format!("{:?}", other),
        )),
    }
}

/// The global-data segment: every initializer at its alignment, the whole
/// segment padded to a multiple of 8 bytes.
pub fn generate_data_segment(globals: &[quill_ir::Global]) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for global in globals {
        let alignment = global.alignment().max(1) as usize;
        while bytes.len() % alignment != 0 {
            bytes.push(0);
        }
        value_to_binary(&global.value, &mut bytes)?;
    }
    while bytes.len() % 8 != 0 {
        bytes.push(0);
    }
    Ok(bytes)
}

fn io_err(err: std::io::Error) -> CompilationError {
    CompilationError::with_value(CompilationStep::CodeGeneration, "Failed to write output", err)
}

/// Serialize the whole module: magic, module info, kernel records, delimiter,
/// global data, delimiter, instruction stream. Returns the module info with
/// the final counts and offsets.
pub fn write_module(
    out: &mut dyn Write,
    mode: OutputMode,
    kernel_infos: &[KernelInfo],
    kernel_code: &[KernelCode],
    globals: &[quill_ir::Global],
    stack_frame_words: u64,
) -> Result<ModuleInfo> {
    let data_segment = generate_data_segment(globals)?;
    let info_words: usize = kernel_infos.iter().map(KernelInfo::word_count).sum();
    let mut info = ModuleInfo::default();
    info.set_kernel_count(kernel_infos.len() as u64);
    // magic + module info + kernel infos + delimiter
    info.set_global_data_offset((2 + info_words + 1) as u64);
    info.set_global_data_size((data_segment.len() / 8) as u64);
    info.set_stack_frame_size(stack_frame_words);

    if mode == OutputMode::Hex || mode == OutputMode::Assembler {
        writeln!(
            out,
            "// Module with {} kernels, global data with {} words (64-bit each), starting at offset {} words and {} words of stack-frame",
            info.kernel_count(),
            info.global_data_size(),
            info.global_data_offset(),
            info.stack_frame_size()
        )
        .map_err(io_err)?;
    }
    if mode != OutputMode::Assembler {
        let magic = u64::from(MODULE_MAGIC) | (u64::from(MODULE_MAGIC) << 32);
        write_word(out, magic, mode).map_err(io_err)?;
        write_word(out, info.value, mode).map_err(io_err)?;
    }
    for kernel in kernel_infos {
        kernel.write(out, mode).map_err(io_err)?;
    }
    if mode != OutputMode::Assembler {
        write_word(out, 0, mode).map_err(io_err)?;
    }

    for global in globals {
        if mode == OutputMode::Hex || mode == OutputMode::Assembler {
            writeln!(out, "// global {}: {}", global.name, global.ty).map_err(io_err)?;
        }
    }
    match mode {
        OutputMode::Binary => out.write_all(&data_segment).map_err(io_err)?,
        OutputMode::Hex => {
            for chunk in data_segment.chunks(8) {
                let mut buf = [0u8; 8];
                buf[..chunk.len()].copy_from_slice(chunk);
                write_word(out, u64::from_le_bytes(buf), mode).map_err(io_err)?;
            }
        }
        OutputMode::Assembler => {}
    }
    if mode != OutputMode::Assembler {
        write_word(out, 0, mode).map_err(io_err)?;
    }

    for (index, code) in kernel_code.iter().enumerate() {
        if mode == OutputMode::Hex || mode == OutputMode::Assembler {
            let name = kernel_infos
                .get(index)
                .map_or("?", |info| info.name.as_str());
            writeln!(out, "// kernel '{}'", name).map_err(io_err)?;
        }
        match mode {
            OutputMode::Assembler => {
                for text in &code.texts {
                    writeln!(out, "{}", text).map_err(io_err)?;
                }
            }
            _ => {
                for word in &code.words {
                    write_word(out, *word, mode).map_err(io_err)?;
                }
            }
        }
    }
    Ok(info)
}

// ---------------------------------------------------------------------------
// Header read-back
// ---------------------------------------------------------------------------

/// The parsed module header, as read back from a compiled binary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModuleHeader {
    pub kernel_count: u64,
    pub global_data_offset: u64,
    pub global_data_size: u64,
    pub stack_frame_size: u64,
    pub kernels: Vec<KernelInfo>,
}

struct WordReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> WordReader<'a> {
    fn next_word(&mut self) -> Result<u64> {
        let end = self.position + 8;
        if end > self.bytes.len() {
            return Err(CompilationError::new(
                CompilationStep::Scanner,
                "Unexpected end of module binary",
            ));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[self.position..end]);
        self.position = end;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_name(&mut self, length: usize) -> Result<String> {
        let words = length.div_ceil(8).max(1);
        let mut raw = Vec::with_capacity(words * 8);
        for _ in 0..words {
            raw.extend_from_slice(&self.next_word()?.to_le_bytes());
        }
        raw.truncate(length);
        String::from_utf8(raw).map_err(|_| {
            CompilationError::new(CompilationStep::Scanner, "Malformed name in module binary")
        })
    }
}

/// Parse the header of a compiled module binary back into its records.
pub fn read_module_header(bytes: &[u8]) -> Result<ModuleHeader> {
    let mut reader = WordReader { bytes, position: 0 };
    let magic = reader.next_word()?;
    let expected = u64::from(MODULE_MAGIC) | (u64::from(MODULE_MAGIC) << 32);
    if magic != expected {
        return Err(CompilationError::with_value(
            CompilationStep::Scanner,
            "Invalid module magic number",
            format!("0x{:016x}", magic),
        ));
    }
    let mut info = ModuleInfo::default();
    info.value = reader.next_word()?;
    let mut kernels = Vec::new();
    for _ in 0..info.kernel_count() {
        let mut kernel = KernelInfo::default();
        kernel.value = reader.next_word()?;
        kernel.work_group_size = reader.next_word()?;
        kernel.name = reader.read_name(kernel.name_length() as usize)?;
        for _ in 0..kernel.param_count() {
            let mut param = ParamInfo::default();
            param.value = reader.next_word()?;
            param.name = reader.read_name(param.name_length() as usize)?;
            param.type_name = reader.read_name(param.type_name_length() as usize)?;
            kernel.parameters.push(param);
        }
        kernels.push(kernel);
    }
    Ok(ModuleHeader {
        kernel_count: info.kernel_count(),
        global_data_offset: info.global_data_offset(),
        global_data_size: info.global_data_size(),
        stack_frame_size: info.stack_frame_size(),
        kernels,
    })
}

/// Total word count of one method's stack allocations, padded to whole words.
pub fn stack_frame_words(module: &Module) -> u64 {
    module
        .methods
        .iter()
        .map(|method| {
            method
                .stack_allocations
                .iter()
                .map(|alloc| u64::from(alloc.size.div_ceil(8)))
                .sum::<u64>()
        })
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_isa::{AddressSpace, TYPE_FLOAT, TYPE_INT32, TYPE_INT8, OP_ADD};
    use quill_ir::{Global, DEFAULT_BLOCK_NAME, INT_ZERO};

    fn method_with_block(name: &str) -> Method {
        let mut method = Method::new(name);
        let label = method.find_or_create_local(DataType::Label, DEFAULT_BLOCK_NAME);
        method.add_block(label);
        method
    }

    #[test]
    fn bitfields_round_trip() {
        let mut word = 0u64;
        set_field(&mut word, 12, 6, 0x2A);
        set_field(&mut word, 60, 4, 0xD);
        assert_eq!(get_field(word, 12, 6), 0x2A);
        assert_eq!(get_field(word, 60, 4), 0xD);
        set_field(&mut word, 12, 6, 0x15);
        assert_eq!(get_field(word, 12, 6), 0x15);
        assert_eq!(get_field(word, 60, 4), 0xD);
    }

    #[test]
    fn move_of_small_literal_uses_the_immediate_slot() {
        let mut method = method_with_block("k");
        let a = method.add_new_local(TYPE_INT32, "%a");
        method.append_to_end(Instruction::mov(a.clone(), quill_ir::INT_ONE));
        // keep the local alive as a reader too
        method.append_to_end(Instruction::binary(
            OP_ADD,
            quill_ir::NOP_REGISTER,
            a.clone(),
            quill_ir::INT_ONE,
        ));
        let code = generate_method_code(&method).unwrap();
        assert_eq!(code.words.len(), 2);
        let word = code.words[0];
        assert_eq!(
            get_field(word, SIG.0, SIG.1),
            u64::from(Signal::SmallImmediate.encoding())
        );
        assert_eq!(get_field(word, RADDR_B.0, RADDR_B.1), 1);
        assert_eq!(
            get_field(word, OP_ADD_FIELD.0, OP_ADD_FIELD.1),
            u64::from(quill_isa::OP_OR.code)
        );
        assert_eq!(get_field(word, WADDR_ADD.0, WADDR_ADD.1), 0);
    }

    #[test]
    fn rotation_sources_are_assigned_accumulators() {
        let mut method = method_with_block("k");
        let src = method.add_new_local(TYPE_INT32.to_vector(16), "%src");
        let dest = method.add_new_local(TYPE_INT32.to_vector(16), "%dest");
        method.append_to_end(Instruction::rotation(
            dest.clone(),
            src.clone(),
            Value::small_imm(SmallImmediate::from_rotation_offset(3).unwrap(), TYPE_INT8),
        ));
        let mapping = assign_registers(&method).unwrap();
        let src_reg = mapping[&src.local_id().unwrap()];
        assert!(src_reg.is_accumulator());
        let dest_reg = mapping[&dest.local_id().unwrap()];
        assert!(!dest_reg.is_accumulator());
    }

    #[test]
    fn paired_operands_land_in_different_files() {
        let mut method = method_with_block("k");
        let a = method.add_new_local(TYPE_INT32, "%a");
        let b = method.add_new_local(TYPE_INT32, "%b");
        let c = method.add_new_local(TYPE_INT32, "%c");
        let out = method.add_new_local(TYPE_INT32, "%out");
        method.append_to_end(Instruction::mov(a.clone(), INT_ZERO));
        method.append_to_end(Instruction::mov(b.clone(), INT_ZERO));
        method.append_to_end(Instruction::mov(c.clone(), INT_ZERO));
        method.append_to_end(Instruction::binary(OP_ADD, out, a.clone(), c.clone()));
        let mapping = assign_registers(&method).unwrap();
        assert_ne!(
            mapping[&a.local_id().unwrap()].file,
            mapping[&c.local_id().unwrap()].file
        );
        generate_method_code(&method).expect("constraints are satisfiable");
    }

    #[test]
    fn literal_partners_avoid_register_file_b() {
        let mut method = method_with_block("k");
        // force a file-B preference first, then pair the local with a literal
        let a = method.add_new_local(TYPE_INT32, "%a");
        let b = method.add_new_local(TYPE_INT32, "%b");
        let out = method.add_new_local(TYPE_INT32, "%out");
        method.append_to_end(Instruction::mov(a.clone(), INT_ZERO));
        method.append_to_end(Instruction::binary(
            OP_ADD,
            out.clone(),
            b.clone(),
            quill_ir::INT_ONE,
        ));
        method.append_to_end(Instruction::binary(OP_ADD, out, a, b.clone()));
        let mapping = assign_registers(&method).unwrap();
        // b shares an instruction with a small immediate, which claims the
        // file-B read slot
        assert_ne!(
            mapping[&b.local_id().unwrap()].file,
            RegisterFile::PhysicalB
        );
        generate_method_code(&method).expect("constraints are satisfiable");
    }

    #[test]
    fn two_file_a_reads_in_one_instruction_are_rejected() {
        let mut slots = OperandSlots::default();
        assert_eq!(slots.claim_a(3).unwrap(), MUX_REGFILE_A);
        assert_eq!(slots.claim_a(3).unwrap(), MUX_REGFILE_A);
        let err = slots.claim_a(4).unwrap_err();
        assert!(err.message.contains("file-A"));
        let err = slots
            .mux_for_immediate(SmallImmediate::from_integer(1).unwrap())
            .and_then(|_| slots.claim_b(7))
            .unwrap_err();
        assert!(err.message.contains("conflicts"));
    }

    #[test]
    fn branch_and_return_expand_to_delay_slots() {
        let mut method = method_with_block("k");
        let exit = method.find_or_create_local(DataType::Label, "%exit");
        method.append_to_end(Instruction::branch(
            exit,
            ConditionCode::Always,
            quill_ir::BOOL_TRUE,
        ));
        method.append_to_end(Instruction::label(exit));
        method.append_to_end(Instruction::ret(None));
        let code = generate_method_code(&method).unwrap();
        // branch + 3 delay slots + end sequence of 3
        assert_eq!(code.words.len(), 7);
        assert_eq!(
            get_field(code.words[0], SIG.0, SIG.1),
            u64::from(Signal::Branch.encoding())
        );
        // the branch target is behind the branch word and its delay slots
        assert_eq!(get_field(code.words[0], 0, 32), 4 * 8);
        assert_eq!(
            get_field(code.words[4], SIG.0, SIG.1),
            u64::from(Signal::ProgramEnd.encoding())
        );
    }

    #[test]
    fn kernel_info_header_round_trips() {
        let mut method = method_with_block("k");
        method.is_kernel = true;
        method.metadata.work_group_sizes = [1, 1, 1];
        method.add_parameter(
            "%a",
            TYPE_INT32,
            ParameterDecorations::SIGN_EXTEND,
            "int",
        );
        method.add_parameter(
            "%b",
            TYPE_INT32,
            ParameterDecorations::SIGN_EXTEND,
            "int",
        );
        method.add_parameter(
            "%out",
            DataType::pointer_to(TYPE_INT32, AddressSpace::Global),
            ParameterDecorations::NONE,
            "int*",
        );
        let mut diags = DiagnosticBag::new();
        let info = get_kernel_info(&method, 0, 17, &mut diags);
        assert_eq!(info.work_group_size, 0x0001_0001_0001);
        assert!(info.explicit_work_group_size());
        assert_eq!(info.param_count(), 3);
        assert!(diags.diagnostics.is_empty());

        let globals = vec![Global {
            name: "lut".to_string(),
            ty: DataType::pointer_to(TYPE_INT32, AddressSpace::Constant),
            value: Value::int(0x11223344, TYPE_INT32),
        }];
        let code = KernelCode {
            words: vec![0xAAAA_BBBB_CCCC_DDDD; 17],
            texts: vec!["nop".to_string(); 17],
        };
        let mut buffer = Vec::new();
        let written =
            write_module(&mut buffer, OutputMode::Binary, &[info.clone()], &[code], &globals, 0)
                .unwrap();

        let header = read_module_header(&buffer).unwrap();
        assert_eq!(header.kernel_count, 1);
        assert_eq!(header.kernels[0].name, "k");
        assert_eq!(header.kernels[0].length(), 17);
        assert_eq!(header.kernels[0].offset(), 0);
        assert_eq!(header.kernels[0].work_group_size, 0x0001_0001_0001);
        assert_eq!(header.kernels[0].parameters.len(), 3);
        assert_eq!(header.kernels[0].parameters[0].name, "a");
        assert_eq!(header.kernels[0].parameters[0].type_name, "int");
        assert!(header.kernels[0].parameters[2].pointer());
        assert!(header.kernels[0].parameters[2].output());
        assert_eq!(
            header.kernels[0].parameters[2].address_space(),
            u64::from(AddressSpace::Global.encoding())
        );
        assert_eq!(header.global_data_offset, written.global_data_offset());

        // the data segment sits right behind the header, after the delimiter
        let data_start = header.global_data_offset as usize * 8;
        assert_eq!(
            &buffer[data_start..data_start + 4],
            &0x11223344u32.to_le_bytes()
        );
        assert_eq!(header.global_data_size, 1);
    }

    #[test]
    fn oversized_work_group_size_warns() {
        let mut method = method_with_block("big");
        method.metadata.work_group_sizes = [4, 4, 1];
        let mut diags = DiagnosticBag::new();
        let _ = get_kernel_info(&method, 0, 0, &mut diags);
        assert_eq!(diags.warning_count(), 1);
    }

    #[test]
    fn data_segment_respects_alignment_and_padding() {
        let globals = vec![
            Global {
                name: "byte".to_string(),
                ty: DataType::pointer_to(TYPE_INT8, AddressSpace::Constant),
                value: Value::int(0x7F, TYPE_INT8),
            },
            Global {
                name: "word".to_string(),
                ty: DataType::pointer_to(TYPE_INT32, AddressSpace::Constant),
                value: Value::int(0x01020304, TYPE_INT32),
            },
        ];
        let segment = generate_data_segment(&globals).unwrap();
        assert_eq!(segment.len() % 8, 0);
        assert_eq!(segment[0], 0x7F);
        // the int global is aligned to four bytes
        assert_eq!(&segment[4..8], &0x01020304u32.to_le_bytes());
    }

    #[test]
    fn float_globals_and_vectors_serialize_little_endian() {
        let vec_ty = TYPE_FLOAT.to_vector(2);
        let value = Value::container(
            vec![Value::real(1.0, TYPE_FLOAT), Value::real(2.0, TYPE_FLOAT)],
            vec_ty.clone(),
        );
        let globals = vec![Global {
            name: "pair".to_string(),
            ty: DataType::pointer_to(vec_ty, AddressSpace::Constant),
            value,
        }];
        let segment = generate_data_segment(&globals).unwrap();
        assert_eq!(&segment[0..4], &1.0f32.to_bits().to_le_bytes());
        assert_eq!(&segment[4..8], &2.0f32.to_bits().to_le_bytes());
    }

    #[test]
    fn hex_mode_writes_word_pairs() {
        let mut buffer = Vec::new();
        write_word(&mut buffer, 0x1122334455667788, OutputMode::Hex).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(text, "0x55667788, 0x11223344, \n");
    }

    #[test]
    fn invalid_magic_is_rejected() {
        let bytes = [0u8; 16];
        let err = read_module_header(&bytes).unwrap_err();
        assert!(err.message.contains("magic"));
    }
}
