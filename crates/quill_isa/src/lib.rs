//! QPU hardware description: the scalar/vector type system, literals, registers,
//! condition codes, signals, pack/unpack modes, small immediates, and the native
//! opcode table with its per-opcode literal evaluators.

use std::fmt;

/// Number of SIMD lanes of one QPU.
pub const VECTOR_LANES: u8 = 16;

/// Number of QPUs on the processor; the maximum total work-group size.
pub const NUM_QPUS: u32 = 12;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum AddressSpace {
    Private,
    Local,
    Global,
    Constant,
    Generic,
}

impl AddressSpace {
    pub fn encoding(self) -> u8 {
        match self {
            Self::Private => 0,
            Self::Local => 1,
            Self::Global => 2,
            Self::Constant => 3,
            Self::Generic => 4,
        }
    }

    pub fn from_encoding(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Private,
            1 => Self::Local,
            2 => Self::Global,
            3 => Self::Constant,
            4 => Self::Generic,
            _ => return None,
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ScalarKind {
    Bool,
    Int,
    Uint,
    Float,
}

/// A scalar machine type: bit width plus integer/float and signedness hint.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ScalarType {
    pub kind: ScalarKind,
    pub bits: u8,
}

impl ScalarType {
    pub const fn new(kind: ScalarKind, bits: u8) -> Self {
        Self { kind, bits }
    }

    pub fn is_float(self) -> bool {
        self.kind == ScalarKind::Float
    }

    pub fn is_signed(self) -> bool {
        matches!(self.kind, ScalarKind::Int)
    }

    /// Width in bytes when materialized in memory.
    pub fn physical_width(self) -> u32 {
        // bool is stored as one byte
        (u32::from(self.bits).max(8)) / 8
    }
}

/// A value's type. Vectors are limited to 16 lanes for native operations;
/// wider vectors exist only transiently in the front-end.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum DataType {
    Scalar(ScalarType),
    Vector { elem: ScalarType, width: u8 },
    Pointer {
        pointee: Box<DataType>,
        space: AddressSpace,
        alignment: u32,
    },
    Array { elem: Box<DataType>, length: u32 },
    Struct {
        name: String,
        elements: Vec<DataType>,
    },
    Image { dimensions: u8 },
    Label,
    Void,
    Unknown,
}

pub const TYPE_BOOL: DataType = DataType::Scalar(ScalarType::new(ScalarKind::Bool, 1));
pub const TYPE_INT8: DataType = DataType::Scalar(ScalarType::new(ScalarKind::Int, 8));
pub const TYPE_INT16: DataType = DataType::Scalar(ScalarType::new(ScalarKind::Int, 16));
pub const TYPE_INT32: DataType = DataType::Scalar(ScalarType::new(ScalarKind::Int, 32));
pub const TYPE_INT64: DataType = DataType::Scalar(ScalarType::new(ScalarKind::Int, 64));
pub const TYPE_UINT8: DataType = DataType::Scalar(ScalarType::new(ScalarKind::Uint, 8));
pub const TYPE_UINT16: DataType = DataType::Scalar(ScalarType::new(ScalarKind::Uint, 16));
pub const TYPE_UINT32: DataType = DataType::Scalar(ScalarType::new(ScalarKind::Uint, 32));
pub const TYPE_FLOAT: DataType = DataType::Scalar(ScalarType::new(ScalarKind::Float, 32));
pub const TYPE_HALF: DataType = DataType::Scalar(ScalarType::new(ScalarKind::Float, 16));

impl DataType {
    pub fn pointer_to(pointee: DataType, space: AddressSpace) -> Self {
        let alignment = pointee.alignment();
        DataType::Pointer {
            pointee: Box::new(pointee),
            space,
            alignment,
        }
    }

    pub fn scalar(&self) -> Option<ScalarType> {
        match self {
            DataType::Scalar(s) => Some(*s),
            DataType::Vector { elem, .. } => Some(*elem),
            _ => None,
        }
    }

    /// Bit width of one lane; pointers count as 32-bit.
    pub fn scalar_bit_count(&self) -> u8 {
        match self {
            DataType::Scalar(s) | DataType::Vector { elem: s, .. } => s.bits,
            DataType::Pointer { .. } => 32,
            _ => 32,
        }
    }

    /// Bit mask covering one lane of this type.
    pub fn scalar_width_mask(&self) -> u32 {
        match self.scalar_bit_count() {
            32.. => u32::MAX,
            bits => (1u32 << bits) - 1,
        }
    }

    pub fn vector_width(&self) -> u8 {
        match self {
            DataType::Vector { width, .. } => *width,
            _ => 1,
        }
    }

    pub fn is_float(&self) -> bool {
        self.scalar().is_some_and(ScalarType::is_float)
    }

    pub fn is_signed_integer(&self) -> bool {
        self.scalar().is_some_and(ScalarType::is_signed)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, DataType::Pointer { .. })
    }

    pub fn is_image(&self) -> bool {
        matches!(self, DataType::Image { .. })
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, DataType::Scalar(_))
    }

    pub fn pointee(&self) -> Option<&DataType> {
        match self {
            DataType::Pointer { pointee, .. } => Some(pointee),
            _ => None,
        }
    }

    pub fn address_space(&self) -> Option<AddressSpace> {
        match self {
            DataType::Pointer { space, .. } => Some(*space),
            _ => None,
        }
    }

    /// The type obtained by indexing into this one.
    pub fn element_type(&self) -> DataType {
        match self {
            DataType::Vector { elem, .. } => DataType::Scalar(*elem),
            DataType::Pointer { pointee, .. } => (**pointee).clone(),
            DataType::Array { elem, .. } => (**elem).clone(),
            other => other.clone(),
        }
    }

    pub fn struct_element(&self, index: usize) -> Option<&DataType> {
        match self {
            DataType::Struct { elements, .. } => elements.get(index),
            _ => None,
        }
    }

    pub fn to_vector(&self, width: u8) -> DataType {
        let elem = self
            .scalar()
            .unwrap_or(ScalarType::new(ScalarKind::Int, 32));
        if width <= 1 {
            DataType::Scalar(elem)
        } else {
            DataType::Vector { elem, width }
        }
    }

    /// Alignment in bytes when materialized in memory.
    pub fn alignment(&self) -> u32 {
        match self {
            DataType::Scalar(s) => s.physical_width(),
            DataType::Vector { elem, width } => elem.physical_width() * u32::from(*width),
            DataType::Pointer { alignment, .. } => (*alignment).max(4),
            DataType::Array { elem, .. } => elem.alignment(),
            DataType::Struct { elements, .. } => {
                elements.iter().map(DataType::alignment).max().unwrap_or(1)
            }
            _ => 4,
        }
    }

    /// Width in bytes when materialized in memory.
    pub fn physical_width(&self) -> u32 {
        match self {
            DataType::Scalar(s) => s.physical_width(),
            DataType::Vector { elem, width } => elem.physical_width() * u32::from(*width),
            DataType::Pointer { .. } => 4,
            DataType::Array { elem, length } => elem.physical_width() * length,
            DataType::Struct { elements, .. } => {
                let mut size = 0u32;
                for elem in elements {
                    let align = elem.alignment();
                    size = size.next_multiple_of(align.max(1));
                    size += elem.physical_width();
                }
                size.next_multiple_of(self.alignment().max(1))
            }
            _ => 4,
        }
    }

    /// Byte offset of the given struct element, including padding.
    pub fn struct_element_offset(&self, index: usize) -> Option<u32> {
        let DataType::Struct { elements, .. } = self else {
            return None;
        };
        let mut offset = 0u32;
        for (i, elem) in elements.iter().enumerate() {
            offset = offset.next_multiple_of(elem.alignment().max(1));
            if i == index {
                return Some(offset);
            }
            offset += elem.physical_width();
        }
        None
    }

    /// OpenCL-style type name, used for parameter records.
    pub fn opencl_name(&self) -> String {
        match self {
            DataType::Scalar(s) => scalar_opencl_name(*s).to_string(),
            DataType::Vector { elem, width } => {
                format!("{}{}", scalar_opencl_name(*elem), width)
            }
            DataType::Pointer { pointee, .. } => format!("{}*", pointee.opencl_name()),
            DataType::Array { elem, length } => format!("{}[{}]", elem.opencl_name(), length),
            DataType::Struct { name, .. } => name.clone(),
            DataType::Image { dimensions } => format!("image{}d_t", dimensions),
            DataType::Label => "label".to_string(),
            DataType::Void => "void".to_string(),
            DataType::Unknown => "?".to_string(),
        }
    }
}

fn scalar_opencl_name(s: ScalarType) -> &'static str {
    match (s.kind, s.bits) {
        (ScalarKind::Bool, _) => "bool",
        (ScalarKind::Float, 16) => "half",
        (ScalarKind::Float, 64) => "double",
        (ScalarKind::Float, _) => "float",
        (ScalarKind::Int, 8) => "char",
        (ScalarKind::Int, 16) => "short",
        (ScalarKind::Int, 64) => "long",
        (ScalarKind::Int, _) => "int",
        (ScalarKind::Uint, 8) => "uchar",
        (ScalarKind::Uint, 16) => "ushort",
        (ScalarKind::Uint, 64) => "ulong",
        (ScalarKind::Uint, _) => "uint",
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Scalar(s) => match s.kind {
                ScalarKind::Float if s.bits == 32 => write!(f, "float"),
                ScalarKind::Float => write!(f, "f{}", s.bits),
                ScalarKind::Bool => write!(f, "bool"),
                _ => write!(f, "i{}", s.bits),
            },
            DataType::Vector { elem, width } => {
                write!(f, "<{} x {}>", width, DataType::Scalar(*elem))
            }
            DataType::Pointer { pointee, space, .. } => write!(f, "{}*{:?}", pointee, space),
            DataType::Array { elem, length } => write!(f, "[{} x {}]", length, elem),
            DataType::Struct { name, .. } => write!(f, "%{}", name),
            DataType::Image { dimensions } => write!(f, "image{}d", dimensions),
            DataType::Label => write!(f, "label"),
            DataType::Void => write!(f, "void"),
            DataType::Unknown => write!(f, "?"),
        }
    }
}

// ---------------------------------------------------------------------------
// Literals
// ---------------------------------------------------------------------------

/// A compile-time constant: a tagged 64-bit payload.
#[derive(Copy, Clone, Debug)]
pub enum Literal {
    Int(i64),
    Real(f64),
    Bool(bool),
}

impl Literal {
    pub fn integer(&self) -> i64 {
        match self {
            Literal::Int(i) => *i,
            Literal::Bool(b) => i64::from(*b),
            Literal::Real(r) => *r as i64,
        }
    }

    pub fn real(&self) -> f64 {
        match self {
            Literal::Real(r) => *r,
            Literal::Int(i) => *i as f64,
            Literal::Bool(b) => f64::from(u8::from(*b)),
        }
    }

    pub fn is_true(&self) -> bool {
        match self {
            Literal::Bool(b) => *b,
            Literal::Int(i) => *i != 0,
            Literal::Real(r) => *r != 0.0,
        }
    }

    /// The 32-bit immediate representation used in binary encoding.
    pub fn to_immediate(&self) -> u32 {
        match self {
            Literal::Int(i) => *i as u32,
            Literal::Bool(b) => u32::from(*b),
            Literal::Real(r) => (*r as f32).to_bits(),
        }
    }

    fn f32_value(&self) -> f32 {
        match self {
            Literal::Real(r) => *r as f32,
            other => f32::from_bits(other.to_immediate()),
        }
    }
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Literal::Real(a), Literal::Real(b)) => a.to_bits() == b.to_bits(),
            _ => self.integer() == other.integer(),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(i) => write!(f, "{}", i),
            Literal::Real(r) => write!(f, "{}", r),
            Literal::Bool(b) => write!(f, "{}", b),
        }
    }
}

// ---------------------------------------------------------------------------
// Condition codes, signals, pack/unpack modes
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ConditionCode {
    Never,
    Always,
    ZeroSet,
    ZeroClear,
    NegativeSet,
    NegativeClear,
    CarrySet,
    CarryClear,
}

impl ConditionCode {
    pub fn invert(self) -> Self {
        match self {
            Self::Never => Self::Always,
            Self::Always => Self::Never,
            Self::ZeroSet => Self::ZeroClear,
            Self::ZeroClear => Self::ZeroSet,
            Self::NegativeSet => Self::NegativeClear,
            Self::NegativeClear => Self::NegativeSet,
            Self::CarrySet => Self::CarryClear,
            Self::CarryClear => Self::CarrySet,
        }
    }

    pub fn is_inversion_of(self, other: Self) -> bool {
        self.invert() == other
    }

    pub fn encoding(self) -> u8 {
        match self {
            Self::Never => 0,
            Self::Always => 1,
            Self::ZeroSet => 2,
            Self::ZeroClear => 3,
            Self::NegativeSet => 4,
            Self::NegativeClear => 5,
            Self::CarrySet => 6,
            Self::CarryClear => 7,
        }
    }
}

impl fmt::Display for ConditionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Never => "never",
            Self::Always => "",
            Self::ZeroSet => "ifz",
            Self::ZeroClear => "ifzc",
            Self::NegativeSet => "ifn",
            Self::NegativeClear => "ifnc",
            Self::CarrySet => "ifc",
            Self::CarryClear => "ifcc",
        };
        write!(f, "{}", s)
    }
}

/// Signaling bits of an instruction word.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Signal {
    SoftwareBreak,
    None,
    ThreadSwitch,
    ProgramEnd,
    WaitScoreboard,
    UnlockScoreboard,
    LastThreadSwitch,
    CoverageLoad,
    ColorLoad,
    ColorLoadEnd,
    LoadTmu0,
    LoadTmu1,
    AlphaMaskLoad,
    SmallImmediate,
    LoadImmediate,
    Branch,
}

impl Signal {
    pub fn encoding(self) -> u8 {
        match self {
            Self::SoftwareBreak => 0,
            Self::None => 1,
            Self::ThreadSwitch => 2,
            Self::ProgramEnd => 3,
            Self::WaitScoreboard => 4,
            Self::UnlockScoreboard => 5,
            Self::LastThreadSwitch => 6,
            Self::CoverageLoad => 7,
            Self::ColorLoad => 8,
            Self::ColorLoadEnd => 9,
            Self::LoadTmu0 => 10,
            Self::LoadTmu1 => 11,
            Self::AlphaMaskLoad => 12,
            Self::SmallImmediate => 13,
            Self::LoadImmediate => 14,
            Self::Branch => 15,
        }
    }
}

/// Unpack mode applied to a reader, converting a narrow lane format to 32 bit.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Unpack(pub u8);

pub const UNPACK_NOP: Unpack = Unpack(0);
/// 16-bit lane A, sign-extended to 32 bit (float 16 -> float 32 on float ops).
pub const UNPACK_SHORT_TO_INT_SEXT: Unpack = Unpack(1);
pub const UNPACK_16B_32: Unpack = Unpack(2);
pub const UNPACK_REPLICATE_BYTE3: Unpack = Unpack(3);
pub const UNPACK_BYTE0_32: Unpack = Unpack(4);
pub const UNPACK_BYTE1_32: Unpack = Unpack(5);
pub const UNPACK_BYTE2_32: Unpack = Unpack(6);
pub const UNPACK_BYTE3_32: Unpack = Unpack(7);

impl Unpack {
    pub fn has_effect(self) -> bool {
        self.0 != 0
    }
}

/// Pack mode applied to a writer, converting a 32-bit lane to a narrower
/// format, optionally with saturation.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Pack(pub u8);

pub const PACK_NOP: Pack = Pack(0);
/// 32 bit -> 16-bit lane A, truncating.
pub const PACK_INT_TO_USHORT_TRUNCATE: Pack = Pack(1);
pub const PACK_32_16B: Pack = Pack(2);
/// Replicate the least-significant byte over all four bytes.
pub const PACK_32_8888: Pack = Pack(3);
/// 32 bit -> byte A, truncating.
pub const PACK_INT_TO_CHAR_TRUNCATE: Pack = Pack(4);
pub const PACK_32_8B: Pack = Pack(5);
pub const PACK_32_8C: Pack = Pack(6);
pub const PACK_32_8D: Pack = Pack(7);
/// 32 bit -> 32 bit with signed saturation (used with saturated add/sub).
pub const PACK_32_32_SATURATE: Pack = Pack(8);
pub const PACK_INT_TO_SIGNED_SHORT_SATURATE: Pack = Pack(9);
pub const PACK_16B_SATURATE: Pack = Pack(10);
pub const PACK_8888_SATURATE: Pack = Pack(11);
pub const PACK_INT_TO_UNSIGNED_CHAR_SATURATE: Pack = Pack(12);
pub const PACK_8B_SATURATE: Pack = Pack(13);
pub const PACK_8C_SATURATE: Pack = Pack(14);
pub const PACK_8D_SATURATE: Pack = Pack(15);

impl Pack {
    pub fn has_effect(self) -> bool {
        self.0 != 0
    }
}

// ---------------------------------------------------------------------------
// Registers
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum RegisterFile {
    PhysicalA,
    PhysicalB,
    /// Encodable in either physical file (peripheral addresses).
    PhysicalAny,
    Accumulator,
}

/// A hardware register: a file plus an index.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Register {
    pub file: RegisterFile,
    pub num: u8,
}

impl Register {
    pub const fn new(file: RegisterFile, num: u8) -> Self {
        Self { file, num }
    }

    pub fn is_accumulator(&self) -> bool {
        self.file == RegisterFile::Accumulator
    }

    pub fn is_general_purpose(&self) -> bool {
        !self.is_accumulator() && self.num < 32
    }

    /// Writing this register triggers an SFU calculation.
    pub fn triggers_sfu(&self) -> bool {
        self.file == RegisterFile::PhysicalAny && (52..=55).contains(&self.num)
    }
}

/// UNIFORM stream read address.
pub const REG_UNIFORM: Register = Register::new(RegisterFile::PhysicalAny, 32);
pub const REG_ACC0: Register = Register::new(RegisterFile::Accumulator, 0);
pub const REG_ACC1: Register = Register::new(RegisterFile::Accumulator, 1);
pub const REG_ACC2: Register = Register::new(RegisterFile::Accumulator, 2);
pub const REG_ACC3: Register = Register::new(RegisterFile::Accumulator, 3);
/// SFU result accumulator r4; read-only, valid two instructions after the trigger.
pub const REG_SFU_OUT: Register = Register::new(RegisterFile::Accumulator, 4);
/// Accumulator r5: written -> per-quad replication; read as rotation offset.
pub const REG_ACC5: Register = Register::new(RegisterFile::Accumulator, 5);
/// Produces the lane index 0..15 on read.
pub const REG_ELEMENT_NUMBER: Register = Register::new(RegisterFile::PhysicalA, 38);
pub const REG_QPU_NUMBER: Register = Register::new(RegisterFile::PhysicalB, 38);
/// Writes are discarded, reads are undefined.
pub const REG_NOP: Register = Register::new(RegisterFile::PhysicalAny, 39);
pub const REG_VPM_IO: Register = Register::new(RegisterFile::PhysicalAny, 48);
pub const REG_VPM_IN_SETUP: Register = Register::new(RegisterFile::PhysicalA, 49);
pub const REG_VPM_OUT_SETUP: Register = Register::new(RegisterFile::PhysicalB, 49);
pub const REG_VPM_DMA_LOAD_ADDR: Register = Register::new(RegisterFile::PhysicalA, 50);
pub const REG_VPM_DMA_STORE_ADDR: Register = Register::new(RegisterFile::PhysicalB, 50);
pub const REG_VPM_DMA_LOAD_WAIT: Register = Register::new(RegisterFile::PhysicalA, 50);
pub const REG_VPM_DMA_STORE_WAIT: Register = Register::new(RegisterFile::PhysicalB, 50);
pub const REG_MUTEX: Register = Register::new(RegisterFile::PhysicalAny, 51);
pub const REG_SFU_RECIP: Register = Register::new(RegisterFile::PhysicalAny, 52);
pub const REG_SFU_RECIP_SQRT: Register = Register::new(RegisterFile::PhysicalAny, 53);
pub const REG_SFU_EXP2: Register = Register::new(RegisterFile::PhysicalAny, 54);
pub const REG_SFU_LOG2: Register = Register::new(RegisterFile::PhysicalAny, 55);
pub const REG_TMU0_ADDRESS: Register = Register::new(RegisterFile::PhysicalAny, 56);
pub const REG_TMU1_ADDRESS: Register = Register::new(RegisterFile::PhysicalAny, 60);

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.file, self.num) {
            (RegisterFile::Accumulator, n) => write!(f, "r{}", n),
            (RegisterFile::PhysicalA, n) => write!(f, "ra{}", n),
            (RegisterFile::PhysicalB, n) => write!(f, "rb{}", n),
            (RegisterFile::PhysicalAny, 32) => write!(f, "unif"),
            (RegisterFile::PhysicalAny, 39) => write!(f, "-"),
            (RegisterFile::PhysicalAny, 51) => write!(f, "mutex"),
            (RegisterFile::PhysicalAny, n @ 52..=55) => {
                let names = ["sfu_recip", "sfu_rsqrt", "sfu_exp2", "sfu_log2"];
                write!(f, "{}", names[(n - 52) as usize])
            }
            (RegisterFile::PhysicalAny, 56) => write!(f, "tmu0s"),
            (RegisterFile::PhysicalAny, 60) => write!(f, "tmu1s"),
            (RegisterFile::PhysicalAny, n) => write!(f, "rx{}", n),
        }
    }
}

// ---------------------------------------------------------------------------
// Small immediates
// ---------------------------------------------------------------------------

/// The 6-bit small-immediate encoding slot. Values 0..=15 are the integers
/// 0..=15, 16..=31 the integers -16..=-1, 32..=39 the powers of two 1.0..=128.0,
/// 40..=47 the powers of two 1/256..=1/2, 48 means "rotate by r5" and 49..=63
/// are the vector-rotation amounts 1..=15.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SmallImmediate(pub u8);

pub const ROTATION_BY_R5: SmallImmediate = SmallImmediate(48);

impl SmallImmediate {
    pub fn from_integer(value: i32) -> Option<Self> {
        match value {
            0..=15 => Some(Self(value as u8)),
            -16..=-1 => Some(Self((32 + value) as u8)),
            _ => None,
        }
    }

    pub fn from_float(value: f32) -> Option<Self> {
        for exp in 0u8..8 {
            if value == (1u32 << exp) as f32 {
                return Some(Self(32 + exp));
            }
            if value == 1.0 / (256u32 >> exp) as f32 {
                return Some(Self(40 + exp));
            }
        }
        None
    }

    /// Rotation amount in 1..=15 lanes.
    pub fn from_rotation_offset(offset: u8) -> Option<Self> {
        match offset {
            1..=15 => Some(Self(48 + offset)),
            _ => None,
        }
    }

    pub fn integer_value(self) -> Option<i32> {
        match self.0 {
            0..=15 => Some(i32::from(self.0)),
            16..=31 => Some(i32::from(self.0) - 32),
            _ => None,
        }
    }

    pub fn rotation_offset(self) -> Option<u8> {
        match self.0 {
            49..=63 => Some(self.0 - 48),
            _ => None,
        }
    }

    pub fn is_rotation_by_r5(self) -> bool {
        self.0 == 48
    }

    pub fn as_literal(self) -> Option<Literal> {
        match self.0 {
            0..=31 => self.integer_value().map(|i| Literal::Int(i64::from(i))),
            32..=39 => Some(Literal::Real(f64::from(1u32 << (self.0 - 32)))),
            40..=47 => Some(Literal::Real(1.0 / f64::from(256u32 >> (self.0 - 40)))),
            _ => None,
        }
    }
}

impl fmt::Display for SmallImmediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(lit) = self.as_literal() {
            write!(f, "{}", lit)
        } else if self.is_rotation_by_r5() {
            write!(f, "<<r5")
        } else if let Some(off) = self.rotation_offset() {
            write!(f, "<<{}", off)
        } else {
            write!(f, "imm{}", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

/// Which of the two parallel ALU pipelines an opcode executes on.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AluSide {
    Add,
    Mul,
    Any,
}

/// An entry of the fixed native opcode table.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct OpCode {
    pub name: &'static str,
    pub code: u8,
    pub side: AluSide,
    pub operands: u8,
    pub is_float: bool,
}

pub const OP_NOP: OpCode = OpCode { name: "nop", code: 0, side: AluSide::Any, operands: 0, is_float: false };
pub const OP_FADD: OpCode = OpCode { name: "fadd", code: 1, side: AluSide::Add, operands: 2, is_float: true };
pub const OP_FSUB: OpCode = OpCode { name: "fsub", code: 2, side: AluSide::Add, operands: 2, is_float: true };
pub const OP_FMIN: OpCode = OpCode { name: "fmin", code: 3, side: AluSide::Add, operands: 2, is_float: true };
pub const OP_FMAX: OpCode = OpCode { name: "fmax", code: 4, side: AluSide::Add, operands: 2, is_float: true };
pub const OP_FMINABS: OpCode = OpCode { name: "fminabs", code: 5, side: AluSide::Add, operands: 2, is_float: true };
pub const OP_FMAXABS: OpCode = OpCode { name: "fmaxabs", code: 6, side: AluSide::Add, operands: 2, is_float: true };
pub const OP_FTOI: OpCode = OpCode { name: "ftoi", code: 7, side: AluSide::Add, operands: 1, is_float: true };
pub const OP_ITOF: OpCode = OpCode { name: "itof", code: 8, side: AluSide::Add, operands: 1, is_float: false };
pub const OP_ADD: OpCode = OpCode { name: "add", code: 12, side: AluSide::Add, operands: 2, is_float: false };
pub const OP_SUB: OpCode = OpCode { name: "sub", code: 13, side: AluSide::Add, operands: 2, is_float: false };
pub const OP_SHR: OpCode = OpCode { name: "shr", code: 14, side: AluSide::Add, operands: 2, is_float: false };
pub const OP_ASR: OpCode = OpCode { name: "asr", code: 15, side: AluSide::Add, operands: 2, is_float: false };
pub const OP_ROR: OpCode = OpCode { name: "ror", code: 16, side: AluSide::Add, operands: 2, is_float: false };
pub const OP_SHL: OpCode = OpCode { name: "shl", code: 17, side: AluSide::Add, operands: 2, is_float: false };
pub const OP_MIN: OpCode = OpCode { name: "min", code: 18, side: AluSide::Add, operands: 2, is_float: false };
pub const OP_MAX: OpCode = OpCode { name: "max", code: 19, side: AluSide::Add, operands: 2, is_float: false };
pub const OP_AND: OpCode = OpCode { name: "and", code: 20, side: AluSide::Add, operands: 2, is_float: false };
pub const OP_OR: OpCode = OpCode { name: "or", code: 21, side: AluSide::Add, operands: 2, is_float: false };
pub const OP_XOR: OpCode = OpCode { name: "xor", code: 22, side: AluSide::Add, operands: 2, is_float: false };
pub const OP_NOT: OpCode = OpCode { name: "not", code: 23, side: AluSide::Add, operands: 1, is_float: false };
pub const OP_CLZ: OpCode = OpCode { name: "clz", code: 24, side: AluSide::Add, operands: 1, is_float: false };
pub const OP_FMUL: OpCode = OpCode { name: "fmul", code: 1, side: AluSide::Mul, operands: 2, is_float: true };
pub const OP_MUL24: OpCode = OpCode { name: "mul24", code: 2, side: AluSide::Mul, operands: 2, is_float: false };
/// Per-byte minimum; with identical inputs this is the canonical mul-ALU move.
pub const OP_V8MIN: OpCode = OpCode { name: "v8min", code: 4, side: AluSide::Mul, operands: 2, is_float: false };

const OPCODES: &[OpCode] = &[
    OP_NOP, OP_FADD, OP_FSUB, OP_FMIN, OP_FMAX, OP_FMINABS, OP_FMAXABS, OP_FTOI, OP_ITOF,
    OP_ADD, OP_SUB, OP_SHR, OP_ASR, OP_ROR, OP_SHL, OP_MIN, OP_MAX, OP_AND, OP_OR, OP_XOR,
    OP_NOT, OP_CLZ, OP_FMUL, OP_MUL24, OP_V8MIN,
];

impl OpCode {
    pub fn by_name(name: &str) -> Option<OpCode> {
        OPCODES.iter().copied().find(|op| op.name == name)
    }

    /// Evaluate this operation over literal operands with 32-bit hardware
    /// semantics. Returns `None` for opcodes without an evaluator.
    pub fn precalculate(&self, first: &Literal, second: Option<&Literal>) -> Option<Literal> {
        let a = first.to_immediate();
        let b = second.map(Literal::to_immediate);
        let fa = first.f32_value();
        let fb = second.map(Literal::f32_value);
        let int = |v: u32| Some(Literal::Int(i64::from(v as i32)));
        let float = |v: f32| Some(Literal::Real(f64::from(v)));
        match self.name {
            "add" => int(a.wrapping_add(b?)),
            "sub" => int(a.wrapping_sub(b?)),
            "shr" => int(a >> (b? & 31)),
            "asr" => int(((a as i32) >> (b? & 31)) as u32),
            "ror" => int(a.rotate_right(b? & 31)),
            "shl" => int(a << (b? & 31)),
            "min" => int((a as i32).min(b? as i32) as u32),
            "max" => int((a as i32).max(b? as i32) as u32),
            "and" => int(a & b?),
            "or" => int(a | b?),
            "xor" => int(a ^ b?),
            "not" => int(!a),
            "clz" => int(a.leading_zeros()),
            "mul24" => int((a & 0xFF_FFFF).wrapping_mul(b? & 0xFF_FFFF)),
            "fadd" => float(fa + fb?),
            "fsub" => float(fa - fb?),
            "fmul" => float(fa * fb?),
            "fmin" => float(fa.min(fb?)),
            "fmax" => float(fa.max(fb?)),
            "fminabs" => float(fa.abs().min(fb?.abs())),
            "fmaxabs" => float(fa.abs().max(fb?.abs())),
            "ftoi" => Some(Literal::Int(fa.round() as i64)),
            "itof" => float(first.integer() as f32),
            "v8min" => int(v8_each(a, b?, u8::min)),
            _ => None,
        }
    }
}

fn v8_each(a: u32, b: u32, f: impl Fn(u8, u8) -> u8) -> u32 {
    let mut out = 0u32;
    for byte in 0..4 {
        let shift = byte * 8;
        let v = f((a >> shift) as u8, (b >> shift) as u8);
        out |= u32::from(v) << shift;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_immediate_integer_round_trip() {
        for value in -16..=15 {
            let imm = SmallImmediate::from_integer(value).expect("in range");
            assert_eq!(imm.integer_value(), Some(value));
            assert_eq!(imm.as_literal(), Some(Literal::Int(i64::from(value))));
        }
        assert!(SmallImmediate::from_integer(16).is_none());
        assert!(SmallImmediate::from_integer(-17).is_none());
    }

    #[test]
    fn small_immediate_rotation_offsets() {
        for offset in 1..=15 {
            let imm = SmallImmediate::from_rotation_offset(offset).expect("in range");
            assert_eq!(imm.rotation_offset(), Some(offset));
            assert!(imm.as_literal().is_none());
        }
        assert!(SmallImmediate::from_rotation_offset(0).is_none());
        assert!(ROTATION_BY_R5.is_rotation_by_r5());
    }

    #[test]
    fn small_immediate_floats() {
        assert_eq!(SmallImmediate::from_float(1.0), Some(SmallImmediate(32)));
        assert_eq!(SmallImmediate::from_float(128.0), Some(SmallImmediate(39)));
        assert_eq!(SmallImmediate::from_float(0.5), Some(SmallImmediate(47)));
        assert_eq!(SmallImmediate::from_float(1.0 / 256.0), Some(SmallImmediate(40)));
        assert_eq!(SmallImmediate::from_float(3.0), None);
        assert_eq!(
            SmallImmediate(36).as_literal(),
            Some(Literal::Real(16.0))
        );
    }

    #[test]
    fn opcode_precalculation_uses_hardware_semantics() {
        let lit = |v: i64| Literal::Int(v);
        assert_eq!(OP_ADD.precalculate(&lit(3), Some(&lit(4))), Some(lit(7)));
        // shr is a logical 32-bit shift even for negative payloads
        assert_eq!(
            OP_SHR.precalculate(&lit(-1), Some(&lit(28))),
            Some(lit(0xF))
        );
        assert_eq!(OP_ASR.precalculate(&lit(-16), Some(&lit(2))), Some(lit(-4)));
        assert_eq!(OP_CLZ.precalculate(&lit(1), None), Some(lit(31)));
        assert_eq!(OP_CLZ.precalculate(&lit(0), None), Some(lit(32)));
        assert_eq!(
            OP_MUL24.precalculate(&lit(0x100_0000 + 5), Some(&lit(3))),
            Some(lit(15)),
            "mul24 masks both operands to 24 bits"
        );
        assert_eq!(OP_NOT.precalculate(&lit(0), None), Some(lit(-1)));
    }

    #[test]
    fn struct_layout_offsets_respect_alignment() {
        let ty = DataType::Struct {
            name: "s".to_string(),
            elements: vec![TYPE_INT8, TYPE_INT32, TYPE_INT16],
        };
        assert_eq!(ty.struct_element_offset(0), Some(0));
        assert_eq!(ty.struct_element_offset(1), Some(4));
        assert_eq!(ty.struct_element_offset(2), Some(8));
        assert_eq!(ty.physical_width(), 12);
        assert_eq!(ty.alignment(), 4);
    }

    #[test]
    fn pointer_width_and_masks() {
        let ptr = DataType::pointer_to(TYPE_INT32, AddressSpace::Global);
        assert_eq!(ptr.physical_width(), 4);
        assert_eq!(ptr.scalar_bit_count(), 32);
        assert_eq!(TYPE_INT8.scalar_width_mask(), 0xFF);
        assert_eq!(TYPE_INT16.scalar_width_mask(), 0xFFFF);
        assert_eq!(TYPE_INT32.scalar_width_mask(), u32::MAX);
    }
}
