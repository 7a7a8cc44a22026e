//! Instruction word format and opcodes.
//!
//! Every instruction is one 32-bit word. Bits [0..8) carry the opcode; the
//! remaining 24 bits are a single operand, read either unsigned or as a
//! two's-complement value biased by 2^23 (control-flow offsets). A few
//! opcodes split the operand into `v1` (bits [8..16)) and `v2`
//! (bits [16..32)).

/// Bias applied to the 24-bit operand when it is interpreted as signed.
pub const SIGN_BIAS: u32 = 1 << 23;

/// Mask for the 24-bit operand field.
pub const VALUE_MASK: u32 = 0x00FF_FFFF;

/// One 32-bit instruction word.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    #[inline]
    pub const fn new(op: Opcode, value: u32) -> Self {
        Self((op as u32) | ((value & VALUE_MASK) << 8))
    }

    /// Encode a signed 24-bit operand (control-flow offsets).
    #[inline]
    pub const fn with_signed(op: Opcode, value: i32) -> Self {
        Self::new(op, (value + SIGN_BIAS as i32) as u32)
    }

    /// Encode the two-field form: `v1` in bits [8..16), `v2` in bits [16..32).
    #[inline]
    pub const fn with_parts(op: Opcode, v1: u8, v2: u16) -> Self {
        Self((op as u32) | ((v1 as u32) << 8) | ((v2 as u32) << 16))
    }

    #[inline]
    pub fn opcode(self) -> Opcode {
        Opcode::from_u8(self.0 as u8)
    }

    /// The 24-bit operand, unsigned.
    #[inline]
    pub fn value(self) -> u32 {
        (self.0 >> 8) & VALUE_MASK
    }

    /// The 24-bit operand, signed (biased by 2^23).
    #[inline]
    pub fn signed_value(self) -> i32 {
        self.value() as i32 - SIGN_BIAS as i32
    }

    #[inline]
    pub fn v1(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[inline]
    pub fn v2(self) -> u16 {
        (self.0 >> 16) as u16
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Nop = 0,

    // === CONST: push from the constant pools ===
    ConstInt,
    ConstFloat,
    ConstStr,

    // === LOCAL: frame-relative locals ===
    LoadLocalInt,
    LoadLocalFloat,
    LoadLocalStr,
    LoadLocalObj,
    StoreLocalInt,
    StoreLocalFloat,
    StoreLocalStr,
    StoreLocalObj,
    LocalStackInt,
    LocalStackFloat,
    LocalStackStr,
    LocalStackObj,

    // === GLOBAL: VM-wide variables ===
    LoadGlobalInt,
    LoadGlobalFloat,
    LoadGlobalStr,
    LoadGlobalObj,
    StoreGlobalInt,
    StoreGlobalFloat,
    StoreGlobalStr,
    StoreGlobalObj,

    // === STACK: top-of-stack shuffling ===
    CopyInt,
    CopyFloat,
    CopyStr,
    CopyObj,
    SwapInt,
    SwapFloat,
    SwapStr,
    SwapObj,
    ShiftStackInt,
    ShiftStackFloat,
    ShiftStackStr,
    ShiftStackObj,

    // === ARITH: integer ===
    AddInt,
    SubInt,
    MulInt,
    DivInt,
    ModInt,
    NegInt,
    IncInt,
    DecInt,

    // === ARITH: float ===
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    ModFloat,
    NegFloat,
    IncFloat,
    DecFloat,

    // === CMP: results land on the integer stack ===
    EqInt,
    NeInt,
    LtInt,
    LeInt,
    GtInt,
    GeInt,
    EqFloat,
    NeFloat,
    LtFloat,
    LeFloat,
    GtFloat,
    GeFloat,
    EqStr,
    NeStr,
    LtStr,
    LeStr,
    GtStr,
    GeStr,
    EqObj,
    NeObj,

    // === LOGIC: booleans on the integer stack ===
    AndInt,
    OrInt,
    NotInt,

    // === STR ===
    ConcatStr,

    // === CONV: numeric/string conversions ===
    IntToFloat,
    FloatToInt,
    IntToStr,
    FloatToStr,

    // === JUMP: signed offsets ===
    Jump,
    JumpEq,
    JumpNe,

    // === CALL ===
    Call,
    AnonCall,
    PrimitiveCall,
    Return,

    // === TASK: coroutine lifecycle ===
    Task,
    AnonTask,
    Yield,
    Kill,
    KillAll,

    // === MAILBOX: cross-coroutine argument transfer ===
    GlobalPushInt,
    GlobalPushFloat,
    GlobalPushStr,
    GlobalPushObj,
    GlobalPopInt,
    GlobalPopFloat,
    GlobalPopStr,
    GlobalPopObj,

    // === CHAN ===
    NewChannel,
    CloseChannel,
    SendInt,
    SendFloat,
    SendStr,
    SendObj,
    ReceiveInt,
    ReceiveFloat,
    ReceiveStr,
    ReceiveObj,

    // === SELECT ===
    TryChannel,
    CheckChannel,
    StartSelectChannel,
    EndSelectChannel,

    // === EXC: raise, try/catch, defer ===
    Raise,
    Try,
    Catch,
    Defer,
    Unwind,

    // === ARRAY ===
    ArrayInt,
    ArrayFloat,
    ArrayStr,
    ArrayObj,
    IndexInt,
    IndexFloat,
    IndexStr,
    IndexObj,
    Index2Int,
    Index2Float,
    Index2Str,
    Index2Obj,
    Index3Int,
    Index3Float,
    Index3Str,
    Index3Obj,
    LengthInt,
    LengthFloat,
    LengthStr,
    LengthObj,
    ConcatArrayInt,
    ConcatArrayFloat,
    ConcatArrayStr,
    ConcatArrayObj,
    AppendInt,
    AppendFloat,
    AppendStr,
    AppendObj,
    PrependInt,
    PrependFloat,
    PrependStr,
    PrependObj,
    ArrayEqInt,
    ArrayEqFloat,
    ArrayEqStr,
    ArrayEqObj,

    // === OBJ: class instances and references ===
    New,
    FieldLoadInt,
    FieldLoadFloat,
    FieldLoadStr,
    FieldLoadObj,
    FieldStoreInt,
    FieldStoreFloat,
    FieldStoreStr,
    FieldStoreObj,
    RefStoreInt,
    RefStoreFloat,
    RefStoreStr,
    RefStoreObj,

    // Sentinel for invalid/unknown opcodes
    Invalid = 255,
}

/// Declaration-order table backing [`Opcode::from_u8`]. Must stay in sync
/// with the enum; the round-trip unit test enforces it.
const OPCODES: &[Opcode] = &[
    Opcode::Nop,
    Opcode::ConstInt,
    Opcode::ConstFloat,
    Opcode::ConstStr,
    Opcode::LoadLocalInt,
    Opcode::LoadLocalFloat,
    Opcode::LoadLocalStr,
    Opcode::LoadLocalObj,
    Opcode::StoreLocalInt,
    Opcode::StoreLocalFloat,
    Opcode::StoreLocalStr,
    Opcode::StoreLocalObj,
    Opcode::LocalStackInt,
    Opcode::LocalStackFloat,
    Opcode::LocalStackStr,
    Opcode::LocalStackObj,
    Opcode::LoadGlobalInt,
    Opcode::LoadGlobalFloat,
    Opcode::LoadGlobalStr,
    Opcode::LoadGlobalObj,
    Opcode::StoreGlobalInt,
    Opcode::StoreGlobalFloat,
    Opcode::StoreGlobalStr,
    Opcode::StoreGlobalObj,
    Opcode::CopyInt,
    Opcode::CopyFloat,
    Opcode::CopyStr,
    Opcode::CopyObj,
    Opcode::SwapInt,
    Opcode::SwapFloat,
    Opcode::SwapStr,
    Opcode::SwapObj,
    Opcode::ShiftStackInt,
    Opcode::ShiftStackFloat,
    Opcode::ShiftStackStr,
    Opcode::ShiftStackObj,
    Opcode::AddInt,
    Opcode::SubInt,
    Opcode::MulInt,
    Opcode::DivInt,
    Opcode::ModInt,
    Opcode::NegInt,
    Opcode::IncInt,
    Opcode::DecInt,
    Opcode::AddFloat,
    Opcode::SubFloat,
    Opcode::MulFloat,
    Opcode::DivFloat,
    Opcode::ModFloat,
    Opcode::NegFloat,
    Opcode::IncFloat,
    Opcode::DecFloat,
    Opcode::EqInt,
    Opcode::NeInt,
    Opcode::LtInt,
    Opcode::LeInt,
    Opcode::GtInt,
    Opcode::GeInt,
    Opcode::EqFloat,
    Opcode::NeFloat,
    Opcode::LtFloat,
    Opcode::LeFloat,
    Opcode::GtFloat,
    Opcode::GeFloat,
    Opcode::EqStr,
    Opcode::NeStr,
    Opcode::LtStr,
    Opcode::LeStr,
    Opcode::GtStr,
    Opcode::GeStr,
    Opcode::EqObj,
    Opcode::NeObj,
    Opcode::AndInt,
    Opcode::OrInt,
    Opcode::NotInt,
    Opcode::ConcatStr,
    Opcode::IntToFloat,
    Opcode::FloatToInt,
    Opcode::IntToStr,
    Opcode::FloatToStr,
    Opcode::Jump,
    Opcode::JumpEq,
    Opcode::JumpNe,
    Opcode::Call,
    Opcode::AnonCall,
    Opcode::PrimitiveCall,
    Opcode::Return,
    Opcode::Task,
    Opcode::AnonTask,
    Opcode::Yield,
    Opcode::Kill,
    Opcode::KillAll,
    Opcode::GlobalPushInt,
    Opcode::GlobalPushFloat,
    Opcode::GlobalPushStr,
    Opcode::GlobalPushObj,
    Opcode::GlobalPopInt,
    Opcode::GlobalPopFloat,
    Opcode::GlobalPopStr,
    Opcode::GlobalPopObj,
    Opcode::NewChannel,
    Opcode::CloseChannel,
    Opcode::SendInt,
    Opcode::SendFloat,
    Opcode::SendStr,
    Opcode::SendObj,
    Opcode::ReceiveInt,
    Opcode::ReceiveFloat,
    Opcode::ReceiveStr,
    Opcode::ReceiveObj,
    Opcode::TryChannel,
    Opcode::CheckChannel,
    Opcode::StartSelectChannel,
    Opcode::EndSelectChannel,
    Opcode::Raise,
    Opcode::Try,
    Opcode::Catch,
    Opcode::Defer,
    Opcode::Unwind,
    Opcode::ArrayInt,
    Opcode::ArrayFloat,
    Opcode::ArrayStr,
    Opcode::ArrayObj,
    Opcode::IndexInt,
    Opcode::IndexFloat,
    Opcode::IndexStr,
    Opcode::IndexObj,
    Opcode::Index2Int,
    Opcode::Index2Float,
    Opcode::Index2Str,
    Opcode::Index2Obj,
    Opcode::Index3Int,
    Opcode::Index3Float,
    Opcode::Index3Str,
    Opcode::Index3Obj,
    Opcode::LengthInt,
    Opcode::LengthFloat,
    Opcode::LengthStr,
    Opcode::LengthObj,
    Opcode::ConcatArrayInt,
    Opcode::ConcatArrayFloat,
    Opcode::ConcatArrayStr,
    Opcode::ConcatArrayObj,
    Opcode::AppendInt,
    Opcode::AppendFloat,
    Opcode::AppendStr,
    Opcode::AppendObj,
    Opcode::PrependInt,
    Opcode::PrependFloat,
    Opcode::PrependStr,
    Opcode::PrependObj,
    Opcode::ArrayEqInt,
    Opcode::ArrayEqFloat,
    Opcode::ArrayEqStr,
    Opcode::ArrayEqObj,
    Opcode::New,
    Opcode::FieldLoadInt,
    Opcode::FieldLoadFloat,
    Opcode::FieldLoadStr,
    Opcode::FieldLoadObj,
    Opcode::FieldStoreInt,
    Opcode::FieldStoreFloat,
    Opcode::FieldStoreStr,
    Opcode::FieldStoreObj,
    Opcode::RefStoreInt,
    Opcode::RefStoreFloat,
    Opcode::RefStoreStr,
    Opcode::RefStoreObj,
];

impl Opcode {
    #[inline]
    pub fn from_u8(v: u8) -> Self {
        OPCODES.get(v as usize).copied().unwrap_or(Opcode::Invalid)
    }
}
