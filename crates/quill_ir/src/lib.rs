//! The typed, SSA-style intermediate representation.
//!
//! A [`Module`] owns [`Method`]s; a method owns its basic blocks, its locals
//! pool and a per-method instruction arena. Blocks are intrusive doubly-linked
//! lists of arena slots, so an [`InstId`] is a stable instruction identity for
//! the lifetime of the method and the [`InstructionWalker`] stays valid across
//! insertions and erasures. Use-def information (the reader/writer sets on each
//! [`Local`]) is maintained exclusively by the arena insert/remove hooks; all
//! mutation funnels through the walker or [`Method::append_to_end`].

pub use quill_isa::{
    ConditionCode, DataType, Literal, OpCode, Pack, Register, Signal, SmallImmediate, Unpack,
};

use quill_isa::{PACK_NOP, REG_ACC5, REG_ELEMENT_NUMBER, REG_NOP, TYPE_BOOL, TYPE_INT8, UNPACK_NOP};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct LocalId(pub u32);

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct InstId(pub u32);

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BlockId(pub u32);

/// Reference index recorded on a local when the exact element is not known.
pub const ANY_ELEMENT: i32 = -1;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Debug)]
pub enum ValueKind {
    Literal(Literal),
    SmallImm(SmallImmediate),
    Register(Register),
    Local(LocalId),
    /// A vector constant; one entry per lane, lanes may be undefined.
    Container(Vec<Value>),
    Undefined,
}

/// An instruction operand.
#[derive(Clone, PartialEq, Debug)]
pub struct Value {
    pub kind: ValueKind,
    pub ty: DataType,
}

pub const UNDEFINED_VALUE: Value = Value {
    kind: ValueKind::Undefined,
    ty: DataType::Unknown,
};
pub const INT_ZERO: Value = Value {
    kind: ValueKind::Literal(Literal::Int(0)),
    ty: TYPE_INT8,
};
pub const INT_ONE: Value = Value {
    kind: ValueKind::Literal(Literal::Int(1)),
    ty: TYPE_INT8,
};
pub const BOOL_TRUE: Value = Value {
    kind: ValueKind::Literal(Literal::Bool(true)),
    ty: TYPE_BOOL,
};
pub const BOOL_FALSE: Value = Value {
    kind: ValueKind::Literal(Literal::Bool(false)),
    ty: TYPE_BOOL,
};
/// Writes to this value are discarded; used to set flags without a result.
pub const NOP_REGISTER: Value = Value {
    kind: ValueKind::Register(REG_NOP),
    ty: DataType::Unknown,
};
/// Reading this register yields the lane index 0..15.
pub const ELEMENT_NUMBER_REGISTER: Value = Value {
    kind: ValueKind::Register(REG_ELEMENT_NUMBER),
    ty: TYPE_INT8,
};
/// Accumulator r5, the dynamic vector-rotation offset.
pub const ROTATION_REGISTER: Value = Value {
    kind: ValueKind::Register(REG_ACC5),
    ty: TYPE_INT8,
};

impl Value {
    pub fn literal(lit: Literal, ty: DataType) -> Self {
        Self {
            kind: ValueKind::Literal(lit),
            ty,
        }
    }

    pub fn int(value: i64, ty: DataType) -> Self {
        Self::literal(Literal::Int(value), ty)
    }

    pub fn real(value: f64, ty: DataType) -> Self {
        Self::literal(Literal::Real(value), ty)
    }

    pub fn small_imm(imm: SmallImmediate, ty: DataType) -> Self {
        Self {
            kind: ValueKind::SmallImm(imm),
            ty,
        }
    }

    pub fn register(reg: Register, ty: DataType) -> Self {
        Self {
            kind: ValueKind::Register(reg),
            ty,
        }
    }

    pub fn local(id: LocalId, ty: DataType) -> Self {
        Self {
            kind: ValueKind::Local(id),
            ty,
        }
    }

    pub fn container(elements: Vec<Value>, ty: DataType) -> Self {
        Self {
            kind: ValueKind::Container(elements),
            ty,
        }
    }

    pub fn undefined(ty: DataType) -> Self {
        Self {
            kind: ValueKind::Undefined,
            ty,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.kind, ValueKind::Undefined)
    }

    pub fn is_literal(&self) -> bool {
        matches!(self.kind, ValueKind::Literal(_))
    }

    /// Literal or small-immediate with a literal meaning.
    pub fn is_literal_value(&self) -> bool {
        self.literal_value().is_some()
    }

    pub fn literal_value(&self) -> Option<Literal> {
        match &self.kind {
            ValueKind::Literal(lit) => Some(*lit),
            ValueKind::SmallImm(imm) => imm.as_literal(),
            _ => None,
        }
    }

    pub fn has_literal(&self, lit: &Literal) -> bool {
        self.literal_value().as_ref() == Some(lit)
    }

    pub fn local_id(&self) -> Option<LocalId> {
        match self.kind {
            ValueKind::Local(id) => Some(id),
            _ => None,
        }
    }

    pub fn get_register(&self) -> Option<Register> {
        match self.kind {
            ValueKind::Register(reg) => Some(reg),
            _ => None,
        }
    }

    pub fn small_immediate(&self) -> Option<SmallImmediate> {
        match self.kind {
            ValueKind::SmallImm(imm) => Some(imm),
            _ => None,
        }
    }

    pub fn container_elements(&self) -> Option<&[Value]> {
        match &self.kind {
            ValueKind::Container(elements) => Some(elements),
            _ => None,
        }
    }

    /// All-zero literal or container of zeros.
    pub fn is_zero_initializer(&self) -> bool {
        match &self.kind {
            ValueKind::Literal(lit) => lit.integer() == 0,
            ValueKind::Container(elements) => elements.iter().all(Value::is_zero_initializer),
            _ => false,
        }
    }

    /// Container whose defined lanes all hold the same literal.
    pub fn container_is_all_same(&self) -> bool {
        let Some(elements) = self.container_elements() else {
            return false;
        };
        let mut first = None;
        for elem in elements {
            if elem.is_undefined() {
                continue;
            }
            let Some(lit) = elem.literal_value() else {
                return false;
            };
            match first {
                None => first = Some(lit),
                Some(f) if f == lit => {}
                Some(_) => return false,
            }
        }
        true
    }

    /// Container matching the lane numbering 0, 1, 2, ... (undefined lanes
    /// are treated as matching).
    pub fn container_is_element_number(&self) -> bool {
        let Some(elements) = self.container_elements() else {
            return false;
        };
        elements.iter().enumerate().all(|(i, elem)| {
            elem.is_undefined()
                || elem
                    .literal_value()
                    .is_some_and(|lit| lit.integer() == i as i64)
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ValueKind::Literal(lit) => write!(f, "{} {}", self.ty, lit),
            ValueKind::SmallImm(imm) => write!(f, "{}", imm),
            ValueKind::Register(reg) => write!(f, "{}", reg),
            ValueKind::Local(id) => write!(f, "%{}", id.0),
            ValueKind::Container(elements) => {
                write!(f, "{} <", self.ty)?;
                for (i, elem) in elements.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", elem)?;
                }
                write!(f, ">")
            }
            ValueKind::Undefined => write!(f, "undef"),
        }
    }
}

// ---------------------------------------------------------------------------
// Locals
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LocalUse {
    Reader,
    Writer,
}

/// A named, typed location owned by a method. The reader/writer sets are
/// maintained by the instruction arena; passes never touch them directly.
#[derive(Clone, Debug)]
pub struct Local {
    pub name: String,
    pub ty: DataType,
    /// Base local plus element index for pointers derived by index
    /// calculation, so later passes can recover the aliased parameter.
    pub reference: Option<(LocalId, i32)>,
    readers: BTreeSet<InstId>,
    writers: BTreeSet<InstId>,
}

impl Local {
    fn new(name: String, ty: DataType) -> Self {
        Self {
            name,
            ty,
            reference: None,
            readers: BTreeSet::new(),
            writers: BTreeSet::new(),
        }
    }

    pub fn readers(&self) -> &BTreeSet<InstId> {
        &self.readers
    }

    pub fn writers(&self) -> &BTreeSet<InstId> {
        &self.writers
    }

    pub fn is_unused(&self) -> bool {
        self.readers.is_empty() && self.writers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Instruction metadata
// ---------------------------------------------------------------------------

/// Semantic markers on an instruction, consulted by later passes.
#[derive(Copy, Clone, Eq, PartialEq, Default, Debug)]
pub struct Decorations(pub u32);

impl Decorations {
    pub const NONE: Decorations = Decorations(0);
    /// Result and float parameters are assumed non-NaN.
    pub const NO_NAN: Decorations = Decorations(1 << 0);
    pub const NO_INF: Decorations = Decorations(1 << 1);
    /// A reciprocal may replace this division.
    pub const ALLOW_RECIP: Decorations = Decorations(1 << 2);
    /// Implies NO_NAN, NO_INF and ALLOW_RECIP.
    pub const FAST_MATH: Decorations = Decorations(1 << 3);
    /// The conversion result is saturated to the limits of the result type.
    pub const SATURATED_CONVERSION: Decorations = Decorations(1 << 4);
    pub const BUILTIN_WORK_DIMENSIONS: Decorations = Decorations(1 << 5);
    pub const BUILTIN_LOCAL_SIZE: Decorations = Decorations(1 << 6);
    pub const BUILTIN_LOCAL_ID: Decorations = Decorations(1 << 7);
    pub const BUILTIN_NUM_GROUPS: Decorations = Decorations(1 << 8);
    pub const BUILTIN_GROUP_ID: Decorations = Decorations(1 << 9);
    pub const BUILTIN_GLOBAL_OFFSET: Decorations = Decorations(1 << 10);
    pub const BUILTIN_GLOBAL_SIZE: Decorations = Decorations(1 << 11);
    pub const BUILTIN_GLOBAL_ID: Decorations = Decorations(1 << 12);
    pub const UNSIGNED_RESULT: Decorations = Decorations(1 << 13);
    /// The result writes a value of a phi node.
    pub const PHI_NODE: Decorations = Decorations(1 << 14);
    /// A conditional branch depending on all lanes' flags, not just lane 0.
    pub const BRANCH_ON_ALL_ELEMENTS: Decorations = Decorations(1 << 15);
    /// The instruction inserts a single lane into a vector.
    pub const ELEMENT_INSERTION: Decorations = Decorations(1 << 16);
    pub const AUTO_VECTORIZED: Decorations = Decorations(1 << 17);

    pub fn contains(self, other: Decorations) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Decorations {
    type Output = Decorations;
    fn bitor(self, rhs: Decorations) -> Decorations {
        Decorations(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Decorations {
    fn bitor_assign(&mut self, rhs: Decorations) {
        self.0 |= rhs.0;
    }
}

/// Why a nop was inserted; the scheduler must not fill or move these.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DelayReason {
    /// One of the delay slots after a branch.
    BranchDelay,
    /// Waiting for an SFU result to arrive in r4.
    WaitSfu,
    /// Waiting for a TMU load to arrive in r4.
    WaitTmu,
    /// Waiting for a register write to become readable.
    WaitRegister,
    ThreadEnd,
    WaitUniform,
    /// Waiting for a VPM/DMA operation to finish.
    WaitVpm,
}

impl fmt::Display for DelayReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BranchDelay => "branch-delay",
            Self::WaitSfu => "wait-sfu",
            Self::WaitTmu => "wait-tmu",
            Self::WaitRegister => "wait-register",
            Self::ThreadEnd => "thread-end",
            Self::WaitUniform => "wait-uniform",
            Self::WaitVpm => "wait-vpm",
        };
        write!(f, "{}", s)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MemoryScope {
    CrossDevice,
    Device,
    WorkGroup,
    SubGroup,
    Invocation,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MemorySemantics {
    None,
    Acquire,
    Release,
    AcquireRelease,
    SequentiallyConsistent,
}

/// Either a native hardware opcode or a not-yet-legalized abstract operation
/// named the way the front-ends name it (`mul`, `udiv`, `sext`, ...).
#[derive(Clone, PartialEq, Debug)]
pub enum OpSpec {
    Native(OpCode),
    Named(String),
}

impl OpSpec {
    pub fn from_name(name: &str) -> OpSpec {
        match OpCode::by_name(name) {
            Some(op) => OpSpec::Native(op),
            None => OpSpec::Named(name.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            OpSpec::Native(op) => op.name,
            OpSpec::Named(name) => name,
        }
    }

    pub fn native(&self) -> Option<OpCode> {
        match self {
            OpSpec::Native(op) => Some(*op),
            OpSpec::Named(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub enum InstructionKind {
    Move {
        dest: Value,
        src: Value,
    },
    /// Rotate the 16 lanes of `src` up by `offset` lanes.
    Rotation {
        dest: Value,
        src: Value,
        offset: Value,
    },
    Op {
        op: OpSpec,
        dest: Value,
        first: Value,
        second: Option<Value>,
    },
    Call {
        dest: Option<Value>,
        name: String,
        args: Vec<Value>,
    },
    Branch {
        target: LocalId,
        on: Value,
    },
    Label {
        label: LocalId,
    },
    Return {
        value: Option<Value>,
    },
    Nop {
        reason: DelayReason,
    },
    Semaphore {
        id: u8,
        increase: bool,
    },
    Mutex {
        lock: bool,
    },
    LoadImmediate {
        dest: Value,
        immediate: Literal,
    },
    MemoryBarrier {
        scope: MemoryScope,
        semantics: MemorySemantics,
    },
    LifetimeBoundary {
        allocation: Value,
        is_end: bool,
    },
}

/// One IR instruction: a variant payload plus the metadata shared by all
/// variants (condition, flags, pack/unpack, signal, decorations).
#[derive(Clone, Debug)]
pub struct Instruction {
    pub kind: InstructionKind,
    pub signal: Signal,
    pub unpack: Unpack,
    pub pack: Pack,
    pub condition: ConditionCode,
    pub set_flags: bool,
    pub decorations: Decorations,
}

impl Instruction {
    fn with_kind(kind: InstructionKind) -> Self {
        Self {
            kind,
            signal: Signal::None,
            unpack: UNPACK_NOP,
            pack: PACK_NOP,
            condition: ConditionCode::Always,
            set_flags: false,
            decorations: Decorations::NONE,
        }
    }

    pub fn mov(dest: Value, src: Value) -> Self {
        Self::with_kind(InstructionKind::Move { dest, src })
    }

    pub fn rotation(dest: Value, src: Value, offset: Value) -> Self {
        Self::with_kind(InstructionKind::Rotation { dest, src, offset })
    }

    pub fn unary(op: OpCode, dest: Value, first: Value) -> Self {
        Self::with_kind(InstructionKind::Op {
            op: OpSpec::Native(op),
            dest,
            first,
            second: None,
        })
    }

    pub fn binary(op: OpCode, dest: Value, first: Value, second: Value) -> Self {
        Self::with_kind(InstructionKind::Op {
            op: OpSpec::Native(op),
            dest,
            first,
            second: Some(second),
        })
    }

    pub fn named_op(name: &str, dest: Value, first: Value, second: Option<Value>) -> Self {
        Self::with_kind(InstructionKind::Op {
            op: OpSpec::from_name(name),
            dest,
            first,
            second,
        })
    }

    pub fn call(dest: Option<Value>, name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::with_kind(InstructionKind::Call {
            dest,
            name: name.into(),
            args,
        })
    }

    pub fn branch(target: LocalId, condition: ConditionCode, on: Value) -> Self {
        Self::with_kind(InstructionKind::Branch { target, on }).with_condition(condition)
    }

    pub fn label(label: LocalId) -> Self {
        Self::with_kind(InstructionKind::Label { label })
    }

    pub fn ret(value: Option<Value>) -> Self {
        Self::with_kind(InstructionKind::Return { value })
    }

    pub fn nop(reason: DelayReason) -> Self {
        Self::with_kind(InstructionKind::Nop { reason })
    }

    pub fn semaphore(id: u8, increase: bool) -> Self {
        Self::with_kind(InstructionKind::Semaphore { id, increase })
    }

    pub fn mutex(lock: bool) -> Self {
        Self::with_kind(InstructionKind::Mutex { lock })
    }

    pub fn load_immediate(dest: Value, immediate: Literal) -> Self {
        Self::with_kind(InstructionKind::LoadImmediate { dest, immediate })
    }

    pub fn memory_barrier(scope: MemoryScope, semantics: MemorySemantics) -> Self {
        Self::with_kind(InstructionKind::MemoryBarrier { scope, semantics })
    }

    pub fn lifetime_boundary(allocation: Value, is_end: bool) -> Self {
        Self::with_kind(InstructionKind::LifetimeBoundary { allocation, is_end })
    }

    pub fn with_condition(mut self, condition: ConditionCode) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_set_flags(mut self) -> Self {
        self.set_flags = true;
        self
    }

    pub fn with_pack(mut self, pack: Pack) -> Self {
        self.pack = pack;
        self
    }

    pub fn with_unpack(mut self, unpack: Unpack) -> Self {
        self.unpack = unpack;
        self
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_decorations(mut self, decorations: Decorations) -> Self {
        self.decorations |= decorations;
        self
    }

    /// Copy condition, flags, pack/unpack modes and decorations from another
    /// instruction, without overriding anything already set on this one.
    pub fn copy_extras_from(mut self, other: &Instruction) -> Self {
        if self.condition == ConditionCode::Always {
            self.condition = other.condition;
        }
        if !self.set_flags {
            self.set_flags = other.set_flags;
        }
        if !self.pack.has_effect() {
            self.pack = other.pack;
        }
        if !self.unpack.has_effect() {
            self.unpack = other.unpack;
        }
        self.decorations |= other.decorations;
        self
    }

    pub fn output(&self) -> Option<&Value> {
        match &self.kind {
            InstructionKind::Move { dest, .. }
            | InstructionKind::Rotation { dest, .. }
            | InstructionKind::Op { dest, .. }
            | InstructionKind::LoadImmediate { dest, .. } => Some(dest),
            InstructionKind::Call { dest, .. } => dest.as_ref(),
            _ => None,
        }
    }

    pub fn set_output(&mut self, value: Value) {
        match &mut self.kind {
            InstructionKind::Move { dest, .. }
            | InstructionKind::Rotation { dest, .. }
            | InstructionKind::Op { dest, .. }
            | InstructionKind::LoadImmediate { dest, .. } => *dest = value,
            InstructionKind::Call { dest, .. } => *dest = Some(value),
            _ => {}
        }
    }

    pub fn arguments(&self) -> Vec<&Value> {
        match &self.kind {
            InstructionKind::Move { src, .. } => vec![src],
            InstructionKind::Rotation { src, offset, .. } => vec![src, offset],
            InstructionKind::Op { first, second, .. } => match second {
                Some(second) => vec![first, second],
                None => vec![first],
            },
            InstructionKind::Call { args, .. } => args.iter().collect(),
            InstructionKind::Branch { on, .. } => vec![on],
            InstructionKind::Return { value } => value.iter().collect(),
            InstructionKind::LifetimeBoundary { allocation, .. } => vec![allocation],
            _ => Vec::new(),
        }
    }

    pub fn argument(&self, index: usize) -> Option<&Value> {
        self.arguments().into_iter().nth(index)
    }

    pub fn set_argument(&mut self, index: usize, value: Value) {
        match &mut self.kind {
            InstructionKind::Move { src, .. } if index == 0 => *src = value,
            InstructionKind::Rotation { src, offset, .. } => match index {
                0 => *src = value,
                1 => *offset = value,
                _ => {}
            },
            InstructionKind::Op { first, second, .. } => match index {
                0 => *first = value,
                1 => *second = Some(value),
                _ => {}
            },
            InstructionKind::Call { args, .. } => {
                if index < args.len() {
                    args[index] = value;
                } else if index == args.len() {
                    args.push(value);
                }
            }
            _ => {}
        }
    }

    /// Visit every local this instruction uses, with its role.
    pub fn for_used_locals(&self, f: &mut dyn FnMut(LocalId, LocalUse)) {
        fn visit(value: &Value, role: LocalUse, f: &mut dyn FnMut(LocalId, LocalUse)) {
            match &value.kind {
                ValueKind::Local(id) => f(*id, role),
                ValueKind::Container(elements) => {
                    for elem in elements {
                        visit(elem, role, f);
                    }
                }
                _ => {}
            }
        }
        if let Some(out) = self.output() {
            visit(out, LocalUse::Writer, f);
        }
        for arg in self.arguments() {
            visit(arg, LocalUse::Reader, f);
        }
    }

    pub fn reads_local(&self, local: LocalId) -> bool {
        let mut found = false;
        self.for_used_locals(&mut |id, role| {
            found |= id == local && role == LocalUse::Reader;
        });
        found
    }

    pub fn writes_local(&self, local: LocalId) -> bool {
        let mut found = false;
        self.for_used_locals(&mut |id, role| {
            found |= id == local && role == LocalUse::Writer;
        });
        found
    }

    pub fn reads_register(&self, reg: Register) -> bool {
        self.arguments()
            .iter()
            .any(|arg| arg.get_register() == Some(reg))
    }

    pub fn writes_register(&self, reg: Register) -> bool {
        self.output()
            .is_some_and(|out| out.get_register() == Some(reg))
    }

    /// Whether removing this instruction could change observable state beyond
    /// its own output local.
    pub fn has_side_effects(&self) -> bool {
        match &self.kind {
            InstructionKind::Branch { .. }
            | InstructionKind::Return { .. }
            | InstructionKind::Semaphore { .. }
            | InstructionKind::Mutex { .. }
            | InstructionKind::MemoryBarrier { .. } => true,
            _ => {
                self.set_flags
                    || self.signal != Signal::None
                    || self
                        .output()
                        .is_some_and(|out| matches!(out.kind, ValueKind::Register(_)))
            }
        }
    }

    /// Constant-fold this instruction if every argument is a literal or a
    /// container of literals. Containers are evaluated lane-wise, scalars are
    /// broadcast.
    pub fn precalculate(&self) -> Option<Value> {
        match &self.kind {
            InstructionKind::Move { dest, src } => {
                if src.is_literal_value() || matches!(src.kind, ValueKind::Container(_)) {
                    let mut folded = src.clone();
                    folded.ty = dest.ty.clone();
                    Some(folded)
                } else {
                    None
                }
            }
            InstructionKind::LoadImmediate { dest, immediate } => {
                Some(Value::literal(*immediate, dest.ty.clone()))
            }
            InstructionKind::Rotation { dest, src, offset } => {
                // all lanes of a literal are identical, any rotation is a no-op
                if src.is_literal_value() {
                    let mut folded = src.clone();
                    folded.ty = dest.ty.clone();
                    Some(folded)
                } else if offset.literal_value().is_some_and(|o| o.integer() == 0) {
                    Some(src.clone())
                } else {
                    None
                }
            }
            InstructionKind::Op {
                op,
                dest,
                first,
                second,
            } => {
                if self.unpack.has_effect() || self.pack.has_effect() {
                    return None;
                }
                let native = op.native()?;
                precalculate_op(native, first, second.as_ref(), &dest.ty)
            }
            _ => None,
        }
    }
}

fn precalculate_op(
    op: OpCode,
    first: &Value,
    second: Option<&Value>,
    result_type: &DataType,
) -> Option<Value> {
    let lanes_of = |value: &Value| -> Option<Vec<Option<Literal>>> {
        match &value.kind {
            ValueKind::Container(elements) => elements
                .iter()
                .map(|elem| {
                    if elem.is_undefined() {
                        Some(None)
                    } else {
                        elem.literal_value().map(Some)
                    }
                })
                .collect(),
            _ => value.literal_value().map(|lit| vec![Some(lit)]),
        }
    };
    let first_lanes = lanes_of(first)?;
    let second_lanes = match second {
        Some(second) => Some(lanes_of(second)?),
        None => None,
    };
    let width = first_lanes
        .len()
        .max(second_lanes.as_ref().map_or(1, Vec::len));
    let lane = |lanes: &Vec<Option<Literal>>, i: usize| -> Option<Literal> {
        if lanes.len() == 1 {
            lanes[0]
        } else {
            lanes.get(i).copied().flatten()
        }
    };
    let mut results = Vec::with_capacity(width);
    for i in 0..width {
        let a = lane(&first_lanes, i)?;
        let b = match &second_lanes {
            Some(lanes) => Some(lane(lanes, i)?),
            None => None,
        };
        results.push(op.precalculate(&a, b.as_ref())?);
    }
    if results.len() == 1 {
        Some(Value::literal(results[0], result_type.clone()))
    } else {
        let elem_ty = result_type.element_type();
        Some(Value::container(
            results
                .into_iter()
                .map(|lit| Value::literal(lit, elem_ty.clone()))
                .collect(),
            result_type.clone(),
        ))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cond = if self.condition == ConditionCode::Always {
            String::new()
        } else {
            format!(".{}", self.condition)
        };
        match &self.kind {
            InstructionKind::Move { dest, src } => write!(f, "mov{} {}, {}", cond, dest, src)?,
            InstructionKind::Rotation { dest, src, offset } => {
                write!(f, "rot{} {}, {}, {}", cond, dest, src, offset)?
            }
            InstructionKind::Op {
                op,
                dest,
                first,
                second,
            } => {
                write!(f, "{}{} {}, {}", op.name(), cond, dest, first)?;
                if let Some(second) = second {
                    write!(f, ", {}", second)?;
                }
            }
            InstructionKind::Call { dest, name, args } => {
                if let Some(dest) = dest {
                    write!(f, "{} = ", dest)?;
                }
                write!(f, "call {}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")?;
            }
            InstructionKind::Branch { target, .. } => write!(f, "br{} %{}", cond, target.0)?,
            InstructionKind::Label { label } => write!(f, "label %{}", label.0)?,
            InstructionKind::Return { value } => match value {
                Some(value) => write!(f, "ret {}", value)?,
                None => write!(f, "ret")?,
            },
            InstructionKind::Nop { reason } => write!(f, "nop ({})", reason)?,
            InstructionKind::Semaphore { id, increase } => {
                write!(f, "sema.{} {}", if *increase { "up" } else { "down" }, id)?
            }
            InstructionKind::Mutex { lock } => {
                write!(f, "mutex.{}", if *lock { "lock" } else { "release" })?
            }
            InstructionKind::LoadImmediate { dest, immediate } => {
                write!(f, "ldi{} {}, {}", cond, dest, immediate)?
            }
            InstructionKind::MemoryBarrier { .. } => write!(f, "membar")?,
            InstructionKind::LifetimeBoundary { allocation, is_end } => write!(
                f,
                "lifetime.{} {}",
                if *is_end { "end" } else { "start" },
                allocation
            )?,
        }
        if self.set_flags {
            write!(f, " {{sf}}")?;
        }
        if self.pack.has_effect() {
            write!(f, " (pack{})", self.pack.0)?;
        }
        if self.unpack.has_effect() {
            write!(f, " (unpack{})", self.unpack.0)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parameters, stack allocations, globals
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Eq, PartialEq, Default, Debug)]
pub struct ParameterDecorations(pub u16);

impl ParameterDecorations {
    pub const NONE: ParameterDecorations = ParameterDecorations(0);
    pub const READ_ONLY: ParameterDecorations = ParameterDecorations(1 << 0);
    pub const WRITE_ONLY: ParameterDecorations = ParameterDecorations(1 << 1);
    pub const RESTRICT: ParameterDecorations = ParameterDecorations(1 << 2);
    pub const VOLATILE: ParameterDecorations = ParameterDecorations(1 << 3);
    pub const SIGN_EXTEND: ParameterDecorations = ParameterDecorations(1 << 4);
    pub const ZERO_EXTEND: ParameterDecorations = ParameterDecorations(1 << 5);

    pub fn contains(self, other: ParameterDecorations) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for ParameterDecorations {
    type Output = ParameterDecorations;
    fn bitor(self, rhs: ParameterDecorations) -> ParameterDecorations {
        ParameterDecorations(self.0 | rhs.0)
    }
}

#[derive(Clone, Debug)]
pub struct Parameter {
    pub local: LocalId,
    pub name: String,
    pub ty: DataType,
    pub decorations: ParameterDecorations,
    /// Source-level type name as spelled in the kernel signature.
    pub type_name: String,
}

impl Parameter {
    pub fn is_input(&self) -> bool {
        self.ty.is_pointer() && !self.decorations.contains(ParameterDecorations::WRITE_ONLY)
    }

    pub fn is_output(&self) -> bool {
        self.ty.is_pointer() && !self.decorations.contains(ParameterDecorations::READ_ONLY)
    }
}

#[derive(Clone, Debug)]
pub struct StackAllocation {
    pub name: String,
    pub size: u32,
    pub alignment: u32,
    pub offset: u32,
}

#[derive(Clone, Debug)]
pub struct Global {
    pub name: String,
    /// Pointer-to-initializer type.
    pub ty: DataType,
    pub value: Value,
}

impl Global {
    pub fn alignment(&self) -> u32 {
        self.ty.alignment()
    }
}

// ---------------------------------------------------------------------------
// Basic blocks and methods
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub label: LocalId,
    head: Option<InstId>,
    tail: Option<InstId>,
    count: usize,
}

impl BasicBlock {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn first(&self) -> Option<InstId> {
        self.head
    }

    pub fn last(&self) -> Option<InstId> {
        self.tail
    }
}

#[derive(Debug)]
struct InstNode {
    inst: Option<Instruction>,
    prev: Option<InstId>,
    next: Option<InstId>,
}

#[derive(Clone, Default, Debug)]
pub struct MethodMetadata {
    /// Required work-group size declared at compile time; all-zero when absent.
    pub work_group_sizes: [u32; 3],
    pub work_group_size_hints: [u32; 3],
}

impl MethodMetadata {
    pub fn has_explicit_work_group_size(&self) -> bool {
        self.work_group_sizes.iter().any(|&size| size > 0)
    }
}

/// Well-known locals populated from UNIFORMs by the runtime before dispatch.
pub const WORK_DIMENSIONS: &str = "%work_dim";
pub const LOCAL_SIZES: &str = "%local_sizes";
pub const LOCAL_IDS: &str = "%local_ids";
pub const NUM_GROUPS_X: &str = "%num_groups_x";
pub const NUM_GROUPS_Y: &str = "%num_groups_y";
pub const NUM_GROUPS_Z: &str = "%num_groups_z";
pub const GROUP_ID_X: &str = "%group_id_x";
pub const GROUP_ID_Y: &str = "%group_id_y";
pub const GROUP_ID_Z: &str = "%group_id_z";
pub const GLOBAL_OFFSET_X: &str = "%global_offset_x";
pub const GLOBAL_OFFSET_Y: &str = "%global_offset_y";
pub const GLOBAL_OFFSET_Z: &str = "%global_offset_z";
pub const GLOBAL_DATA_ADDRESS: &str = "%global_data_address";

pub const DEFAULT_BLOCK_NAME: &str = "%start_of_function";

/// A kernel or helper function.
#[derive(Debug)]
pub struct Method {
    pub name: String,
    pub is_kernel: bool,
    pub return_type: DataType,
    pub parameters: Vec<Parameter>,
    pub metadata: MethodMetadata,
    pub stack_allocations: Vec<StackAllocation>,
    locals: Vec<Local>,
    local_names: HashMap<String, LocalId>,
    nodes: Vec<InstNode>,
    free_nodes: Vec<InstId>,
    blocks: Vec<BasicBlock>,
    next_temp: u32,
}

impl Method {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_kernel: false,
            return_type: DataType::Void,
            parameters: Vec::new(),
            metadata: MethodMetadata::default(),
            stack_allocations: Vec::new(),
            locals: Vec::new(),
            local_names: HashMap::new(),
            nodes: Vec::new(),
            free_nodes: Vec::new(),
            blocks: Vec::new(),
            next_temp: 0,
        }
    }

    // --- locals ---

    pub fn local(&self, id: LocalId) -> &Local {
        &self.locals[id.0 as usize]
    }

    pub fn local_mut(&mut self, id: LocalId) -> &mut Local {
        &mut self.locals[id.0 as usize]
    }

    pub fn locals(&self) -> impl Iterator<Item = (LocalId, &Local)> {
        self.locals
            .iter()
            .enumerate()
            .map(|(i, local)| (LocalId(i as u32), local))
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    pub fn find_local(&self, name: &str) -> Option<LocalId> {
        self.local_names.get(name).copied()
    }

    fn create_local(&mut self, name: String, ty: DataType) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.local_names.insert(name.clone(), id);
        self.locals.push(Local::new(name, ty));
        id
    }

    pub fn find_or_create_local(&mut self, ty: DataType, name: &str) -> LocalId {
        match self.find_local(name) {
            Some(id) => id,
            None => self.create_local(name.to_string(), ty),
        }
    }

    /// Create a fresh local named `prefix.N` and return a value referencing it.
    pub fn add_new_local(&mut self, ty: DataType, prefix: &str) -> Value {
        let index = self.next_temp;
        self.next_temp += 1;
        let prefix = if prefix.is_empty() { "%tmp" } else { prefix };
        let name = format!("{}.{}", prefix, index);
        let id = self.create_local(name, ty.clone());
        Value::local(id, ty)
    }

    pub fn add_parameter(
        &mut self,
        name: &str,
        ty: DataType,
        decorations: ParameterDecorations,
        type_name: &str,
    ) -> LocalId {
        let local = self.find_or_create_local(ty.clone(), name);
        self.parameters.push(Parameter {
            local,
            name: name.to_string(),
            ty,
            decorations,
            type_name: type_name.to_string(),
        });
        local
    }

    pub fn is_parameter(&self, id: LocalId) -> bool {
        self.parameters.iter().any(|p| p.local == id)
    }

    /// Drop unused locals from the name table so their names can be reused.
    /// Returns how many were dropped.
    pub fn clean_locals(&mut self) -> usize {
        let unused: Vec<LocalId> = self
            .locals()
            .filter(|(id, local)| local.is_unused() && !self.is_parameter(*id))
            .map(|(id, _)| id)
            .collect();
        for id in &unused {
            let name = self.locals[id.0 as usize].name.clone();
            self.local_names.remove(&name);
        }
        unused.len()
    }

    // --- blocks ---

    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &BasicBlock)> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(i, block)| (BlockId(i as u32), block))
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn find_block(&self, label: LocalId) -> Option<BlockId> {
        self.blocks
            .iter()
            .position(|block| block.label == label)
            .map(|i| BlockId(i as u32))
    }

    pub fn add_block(&mut self, label: LocalId) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock {
            label,
            head: None,
            tail: None,
            count: 0,
        });
        id
    }

    pub fn instruction(&self, id: InstId) -> &Instruction {
        self.nodes[id.0 as usize]
            .inst
            .as_ref()
            .unwrap_or_else(|| panic!("instruction {:?} was erased", id))
    }

    pub fn block_instructions(&self, block: BlockId) -> BlockInstructions<'_> {
        BlockInstructions {
            method: self,
            next: self.blocks[block.0 as usize].head,
        }
    }

    pub fn count_instructions(&self) -> usize {
        self.blocks.iter().map(BasicBlock::len).sum()
    }

    /// Append an instruction to the end of the method. A label starts a new
    /// basic block; any other instruction lands in the last block, creating
    /// the default entry block first if none exists yet.
    pub fn append_to_end(&mut self, inst: Instruction) {
        if let InstructionKind::Label { label } = inst.kind {
            self.add_block(label);
            return;
        }
        if self.blocks.is_empty() {
            let label = self.find_or_create_local(DataType::Label, DEFAULT_BLOCK_NAME);
            self.add_block(label);
        }
        let block = BlockId((self.blocks.len() - 1) as u32);
        self.insert_before(block, None, inst);
    }

    /// Whether control flow can fall off the end of this block into the next.
    pub fn falls_through_to_next_block(&self, block: BlockId) -> bool {
        let mut last_branch = None;
        let mut second_last_branch = None;
        for (_, inst) in self.block_instructions(block) {
            if matches!(inst.kind, InstructionKind::Nop { .. }) {
                continue;
            }
            if matches!(inst.kind, InstructionKind::Branch { .. }) {
                second_last_branch = last_branch;
                last_branch = Some(inst);
            } else {
                second_last_branch = None;
                last_branch = None;
            }
        }
        let Some(last) = last_branch else {
            return true;
        };
        if last.condition == ConditionCode::Always {
            return false;
        }
        // a pair of branches covering both sides of one condition
        if let Some(second) = second_last_branch {
            if let (
                InstructionKind::Branch { on: first_on, .. },
                InstructionKind::Branch { on: second_on, .. },
            ) = (&last.kind, &second.kind)
            {
                if first_on == second_on && last.condition.is_inversion_of(second.condition) {
                    return false;
                }
            }
        }
        true
    }

    /// Split the block at the walker position: everything from the position on
    /// moves into a fresh block with the given label, inserted right after.
    pub fn emplace_label(&mut self, block: BlockId, at: Option<InstId>, label: LocalId) -> BlockId {
        let (new_head, new_tail) = match at {
            Some(at) => {
                let new_tail = self.blocks[block.0 as usize].tail;
                let before = self.nodes[at.0 as usize].prev;
                self.blocks[block.0 as usize].tail = before;
                match before {
                    Some(before) => self.nodes[before.0 as usize].next = None,
                    None => self.blocks[block.0 as usize].head = None,
                }
                self.nodes[at.0 as usize].prev = None;
                (Some(at), new_tail)
            }
            None => (None, None),
        };
        let mut moved = 0;
        let mut cursor = new_head;
        while let Some(id) = cursor {
            moved += 1;
            cursor = self.nodes[id.0 as usize].next;
        }
        self.blocks[block.0 as usize].count -= moved;
        let new_block = BasicBlock {
            label,
            head: new_head,
            tail: new_tail,
            count: moved,
        };
        let index = block.0 as usize + 1;
        self.blocks.insert(index, new_block);
        BlockId(index as u32)
    }

    // --- instruction arena ---

    fn hook(&mut self, id: InstId) {
        let mut uses = Vec::new();
        if let Some(inst) = &self.nodes[id.0 as usize].inst {
            inst.for_used_locals(&mut |local, role| uses.push((local, role)));
        }
        for (local, role) in uses {
            let local = &mut self.locals[local.0 as usize];
            match role {
                LocalUse::Reader => local.readers.insert(id),
                LocalUse::Writer => local.writers.insert(id),
            };
        }
    }

    fn unhook(&mut self, id: InstId) {
        let mut uses = Vec::new();
        if let Some(inst) = &self.nodes[id.0 as usize].inst {
            inst.for_used_locals(&mut |local, role| uses.push((local, role)));
        }
        for (local, role) in uses {
            let local = &mut self.locals[local.0 as usize];
            match role {
                LocalUse::Reader => local.readers.remove(&id),
                LocalUse::Writer => local.writers.remove(&id),
            };
        }
    }

    fn alloc_node(&mut self, inst: Instruction) -> InstId {
        match self.free_nodes.pop() {
            Some(id) => {
                self.nodes[id.0 as usize] = InstNode {
                    inst: Some(inst),
                    prev: None,
                    next: None,
                };
                id
            }
            None => {
                let id = InstId(self.nodes.len() as u32);
                self.nodes.push(InstNode {
                    inst: Some(inst),
                    prev: None,
                    next: None,
                });
                id
            }
        }
    }

    /// Insert before the given position (`None` = append at block end) and
    /// return the new instruction's id.
    fn insert_before(&mut self, block: BlockId, before: Option<InstId>, inst: Instruction) -> InstId {
        let id = self.alloc_node(inst);
        let block_data = &mut self.blocks[block.0 as usize];
        match before {
            Some(before) => {
                let prev = self.nodes[before.0 as usize].prev;
                self.nodes[id.0 as usize].prev = prev;
                self.nodes[id.0 as usize].next = Some(before);
                self.nodes[before.0 as usize].prev = Some(id);
                match prev {
                    Some(prev) => self.nodes[prev.0 as usize].next = Some(id),
                    None => block_data.head = Some(id),
                }
            }
            None => {
                let tail = block_data.tail;
                self.nodes[id.0 as usize].prev = tail;
                match tail {
                    Some(tail) => self.nodes[tail.0 as usize].next = Some(id),
                    None => block_data.head = Some(id),
                }
                block_data.tail = Some(id);
            }
        }
        self.blocks[block.0 as usize].count += 1;
        self.hook(id);
        id
    }

    /// Remove the instruction and return the id of its successor in the block.
    fn remove(&mut self, block: BlockId, id: InstId) -> Option<InstId> {
        self.unhook(id);
        let (prev, next) = {
            let node = &self.nodes[id.0 as usize];
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.nodes[prev.0 as usize].next = next,
            None => self.blocks[block.0 as usize].head = next,
        }
        match next {
            Some(next) => self.nodes[next.0 as usize].prev = prev,
            None => self.blocks[block.0 as usize].tail = prev,
        }
        self.nodes[id.0 as usize] = InstNode {
            inst: None,
            prev: None,
            next: None,
        };
        self.free_nodes.push(id);
        self.blocks[block.0 as usize].count -= 1;
        next
    }

    // --- walkers ---

    /// Walker at the first instruction of the method, skipping empty blocks.
    pub fn walk_method(&mut self) -> InstructionWalker<'_> {
        let mut block = BlockId(0);
        let mut pos = self.blocks.first().and_then(|b| b.head);
        while pos.is_none() && (block.0 as usize) + 1 < self.blocks.len() {
            block = BlockId(block.0 + 1);
            pos = self.blocks[block.0 as usize].head;
        }
        InstructionWalker {
            block,
            pos,
            method: self,
        }
    }

    pub fn walker_at_block(&mut self, block: BlockId) -> InstructionWalker<'_> {
        let pos = self.blocks[block.0 as usize].head;
        InstructionWalker {
            block,
            pos,
            method: self,
        }
    }

    /// Walker at the end of the last block.
    pub fn walker_at_end(&mut self) -> InstructionWalker<'_> {
        let block = BlockId((self.blocks.len().max(1) - 1) as u32);
        if self.blocks.is_empty() {
            let label = self.find_or_create_local(DataType::Label, DEFAULT_BLOCK_NAME);
            self.add_block(label);
        }
        InstructionWalker {
            block,
            pos: None,
            method: self,
        }
    }

    /// Render a value with resolved local names, for diagnostics.
    pub fn render_value(&self, value: &Value) -> String {
        match &value.kind {
            ValueKind::Local(id) => self.local(*id).name.clone(),
            ValueKind::Container(elements) => {
                let inner: Vec<String> = elements.iter().map(|e| self.render_value(e)).collect();
                format!("<{}>", inner.join(", "))
            }
            _ => value.to_string(),
        }
    }
}

pub struct BlockInstructions<'m> {
    method: &'m Method,
    next: Option<InstId>,
}

impl<'m> Iterator for BlockInstructions<'m> {
    type Item = (InstId, &'m Instruction);
    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        self.next = self.method.nodes[id.0 as usize].next;
        Some((id, self.method.instruction(id)))
    }
}

// ---------------------------------------------------------------------------
// Instruction walker
// ---------------------------------------------------------------------------

/// A position-stable cursor over the instructions of a method. The walker is
/// the only sanctioned mutation interface: insertion, replacement and erasure
/// all go through it so the use-def bookkeeping stays consistent.
#[derive(Debug)]
pub struct InstructionWalker<'m> {
    method: &'m mut Method,
    block: BlockId,
    pos: Option<InstId>,
}

impl<'m> InstructionWalker<'m> {
    pub fn method(&self) -> &Method {
        self.method
    }

    pub fn method_mut(&mut self) -> &mut Method {
        self.method
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn position(&self) -> Option<InstId> {
        self.pos
    }

    pub fn get(&self) -> Option<&Instruction> {
        self.pos.map(|id| self.method.instruction(id))
    }

    pub fn is_end_of_block(&self) -> bool {
        self.pos.is_none()
    }

    pub fn is_start_of_block(&self) -> bool {
        self.pos == self.method.blocks[self.block.0 as usize].head
    }

    pub fn is_end_of_method(&self) -> bool {
        self.pos.is_none() && self.block.0 as usize + 1 >= self.method.blocks.len()
    }

    /// Mutate the current instruction in place; the use-def sets are rebuilt
    /// around the closure.
    pub fn modify(&mut self, f: impl FnOnce(&mut Instruction)) {
        let id = self.expect_position("modify");
        self.method.unhook(id);
        if let Some(inst) = self.method.nodes[id.0 as usize].inst.as_mut() {
            f(inst);
        }
        self.method.hook(id);
    }

    /// Insert at the current position, pushing the current instruction
    /// forward; the walker points at the inserted instruction afterwards.
    pub fn emplace(&mut self, inst: Instruction) {
        let id = self.method.insert_before(self.block, self.pos, inst);
        self.pos = Some(id);
    }

    /// Replace the current instruction; the walker keeps its position.
    pub fn reset(&mut self, inst: Instruction) {
        let id = self.expect_position("reset");
        self.method.unhook(id);
        self.method.nodes[id.0 as usize].inst = Some(inst);
        self.method.hook(id);
    }

    /// Erase the current instruction; the walker moves to its successor.
    pub fn erase(&mut self) {
        let id = self.expect_position("erase");
        self.pos = self.method.remove(self.block, id);
    }

    pub fn next_in_block(&mut self) {
        if let Some(id) = self.pos {
            self.pos = self.method.nodes[id.0 as usize].next;
        }
    }

    /// Step back within the block; clamps at the first instruction.
    pub fn previous_in_block(&mut self) {
        match self.pos {
            Some(id) => {
                if let Some(prev) = self.method.nodes[id.0 as usize].prev {
                    self.pos = Some(prev);
                }
            }
            None => self.pos = self.method.blocks[self.block.0 as usize].tail,
        }
    }

    /// Advance, crossing into the next block when the current one is done.
    pub fn next_in_method(&mut self) {
        self.next_in_block();
        while self.pos.is_none() && (self.block.0 as usize) + 1 < self.method.blocks.len() {
            self.block = BlockId(self.block.0 + 1);
            self.pos = self.method.blocks[self.block.0 as usize].head;
        }
    }

    fn expect_position(&self, operation: &str) -> InstId {
        match self.pos {
            Some(id) => id,
            None => panic!("InstructionWalker::{} at end of block", operation),
        }
    }
}

// ---------------------------------------------------------------------------
// Module
// ---------------------------------------------------------------------------

#[derive(Default, Debug)]
pub struct Module {
    pub methods: Vec<Method>,
    pub globals: Vec<Global>,
}

impl Module {
    pub fn kernels(&self) -> impl Iterator<Item = &Method> {
        self.methods.iter().filter(|m| m.is_kernel)
    }

    /// Byte offset of a global inside the data segment, including the
    /// alignment padding of everything before it.
    pub fn global_data_offset(&self, name: &str) -> Option<u32> {
        let mut offset = 0u32;
        for global in &self.globals {
            offset = offset.next_multiple_of(global.alignment().max(1));
            if global.name == name {
                return Some(offset);
            }
            offset += global.value.ty.physical_width();
        }
        None
    }
}
