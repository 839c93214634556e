//! The bytecode opcode set (spec §4.5/§6.2).
//!
//! The original groups a family of otherwise-identical operations into
//! many short-form opcodes purely to shrink encoded size (e.g. separate
//! `LoadLocal0`..`LoadLocal9` next to a general `LoadLocalSlot n`). This
//! decoder keeps one opcode per distinct *operation* and carries the slot
//! or offset as an explicit operand instead — same semantics, fewer enum
//! variants, no behavioral difference an interpreter could observe.

use ejs_loader::encoding::{encode_num, Cursor};
use ejs_value::error::{EjsError, Result};
use ejs_value::helpers::Operator;

/// A decoded instruction, immediate operands included (spec §6.2 "each
/// with a fixed encoding of immediate operands").
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    // --- Load constants (spec §4.5 "Load constants") ---
    LoadUndefined,
    LoadNull,
    LoadTrue,
    LoadFalse,
    LoadThis,
    LoadGlobal,
    LoadInt(i64),
    LoadDouble(f64),
    LoadString(usize),
    LoadNamespace(usize),
    LoadRegexp(usize),
    LoadXml(usize),

    // --- Load/store by slot ---
    LoadGlobalSlot(i32),
    StoreGlobalSlot(i32),
    LoadLocalSlot(i32),
    StoreLocalSlot(i32),
    LoadThisSlot(i32),
    StoreThisSlot(i32),
    /// `depth` enclosing blocks out from `bp`.
    LoadBlockSlot { depth: u32, slot: i32 },
    StoreBlockSlot { depth: u32, slot: i32 },
    /// `depth`-th base type of `this`.
    LoadBaseSlot { depth: u32, slot: i32 },
    StoreBaseSlot { depth: u32, slot: i32 },

    // --- Load/store by name ---
    LoadByName(usize),
    StoreByName(usize),
    LoadByNameExpr,
    StoreByNameExpr,
    LoadObjectProperty(usize),
    StoreObjectProperty(usize),
    LoadObjectPropertyExpr,
    StoreObjectPropertyExpr,

    // --- Calls ---
    CallGlobalSlot { slot: i32, argc: u32 },
    CallLocalSlot { slot: i32, argc: u32 },
    CallThisSlot { slot: i32, argc: u32 },
    CallBlockSlot { depth: u32, slot: i32, argc: u32 },
    CallByName { name: usize, argc: u32 },
    CallObjectByName { name: usize, argc: u32 },
    CallObjectByNameExpr { argc: u32 },
    CallFunctionValue { argc: u32 },
    CallConstructor { argc: u32 },
    CallNextConstructor { argc: u32 },
    CallInstanceMethod { slot: i32, argc: u32 },
    CallStaticMethod { slot: i32, argc: u32 },

    // --- Arithmetic / comparison (spec §4.1 `invokeOperator`) ---
    UnaryOp(Operator),
    BinaryOp(Operator),

    // --- Control flow ---
    Goto(i32),
    BranchTrue(i32),
    BranchFalse(i32),
    CompareBranch { op: Operator, offset: i32 },
    /// Jump table keyed on actual `argc`, used to skip default-argument
    /// initializer code for supplied arguments.
    InitDefaultArgs(Vec<i32>),

    // --- Scope management ---
    OpenBlock,
    CloseBlock,
    OpenWith,
    CloseWith,
    AddNamespace(usize),
    AddNamespaceRef,

    // --- Exceptions ---
    Throw,
    Finally,
    EndException,

    // --- Construction ---
    New { type_slot: i32, argc: u32 },
    NewObject { num_props: u32 },
    DefineClass(i32),
    DefineFunction(i32),

    // --- Stack / misc ---
    Pop,
    Dup,
    Swap,
    Nop,
    /// Reserved, unimplemented in the original (spec §9 open question);
    /// kept as a recognized-but-rejected opcode rather than removed.
    Breakpoint,
    Return,
    EndCode,
}

/// `getOptable`: the canonical mnemonic table a disassembler or compiler
/// consults (spec §6.2). Byte values are this crate's own numbering —
/// the original's exact numeric assignment is an internal compiler
/// concern the spec does not pin down for a reimplementation.
pub fn optable() -> &'static [(&'static str, u8)] {
    &[
        ("LoadUndefined", 0),
        ("LoadNull", 1),
        ("LoadTrue", 2),
        ("LoadFalse", 3),
        ("LoadThis", 4),
        ("LoadGlobal", 5),
        ("LoadInt", 6),
        ("LoadDouble", 7),
        ("LoadString", 8),
        ("LoadNamespace", 9),
        ("LoadRegexp", 10),
        ("LoadXml", 11),
        ("LoadGlobalSlot", 12),
        ("StoreGlobalSlot", 13),
        ("LoadLocalSlot", 14),
        ("StoreLocalSlot", 15),
        ("LoadThisSlot", 16),
        ("StoreThisSlot", 17),
        ("LoadBlockSlot", 18),
        ("StoreBlockSlot", 19),
        ("LoadBaseSlot", 20),
        ("StoreBaseSlot", 21),
        ("LoadByName", 22),
        ("StoreByName", 23),
        ("LoadByNameExpr", 24),
        ("StoreByNameExpr", 25),
        ("LoadObjectProperty", 26),
        ("StoreObjectProperty", 27),
        ("LoadObjectPropertyExpr", 28),
        ("StoreObjectPropertyExpr", 29),
        ("CallGlobalSlot", 30),
        ("CallLocalSlot", 31),
        ("CallThisSlot", 32),
        ("CallBlockSlot", 33),
        ("CallByName", 34),
        ("CallObjectByName", 35),
        ("CallObjectByNameExpr", 36),
        ("CallFunctionValue", 37),
        ("CallConstructor", 38),
        ("CallNextConstructor", 39),
        ("CallInstanceMethod", 40),
        ("CallStaticMethod", 41),
        ("UnaryOp", 42),
        ("BinaryOp", 43),
        ("Goto", 44),
        ("BranchTrue", 45),
        ("BranchFalse", 46),
        ("CompareBranch", 47),
        ("InitDefaultArgs", 48),
        ("OpenBlock", 49),
        ("CloseBlock", 50),
        ("OpenWith", 51),
        ("CloseWith", 52),
        ("AddNamespace", 53),
        ("AddNamespaceRef", 54),
        ("Throw", 55),
        ("Finally", 56),
        ("EndException", 57),
        ("New", 58),
        ("NewObject", 59),
        ("DefineClass", 60),
        ("DefineFunction", 61),
        ("Pop", 62),
        ("Dup", 63),
        ("Swap", 64),
        ("Nop", 65),
        ("Breakpoint", 66),
        ("Return", 67),
        ("EndCode", 68),
    ]
}

fn operator_byte(op: Operator) -> u8 {
    match op {
        Operator::Add => 0,
        Operator::Sub => 1,
        Operator::Mul => 2,
        Operator::Div => 3,
        Operator::Mod => 4,
        Operator::LeftShift => 5,
        Operator::RightShift => 6,
        Operator::UnsignedRightShift => 7,
        Operator::BitAnd => 8,
        Operator::BitOr => 9,
        Operator::BitXor => 10,
        Operator::And => 11,
        Operator::Or => 12,
        Operator::CompareEq => 13,
        Operator::CompareStrictEq => 14,
        Operator::CompareNe => 15,
        Operator::CompareStrictNe => 16,
        Operator::CompareLt => 17,
        Operator::CompareLe => 18,
        Operator::CompareGt => 19,
        Operator::CompareGe => 20,
        Operator::LogicalNot => 21,
        Operator::Negate => 22,
        Operator::BitNot => 23,
        Operator::Increment => 24,
        Operator::Decrement => 25,
    }
}

fn operator_from_byte(b: u8) -> Result<Operator> {
    Ok(match b {
        0 => Operator::Add,
        1 => Operator::Sub,
        2 => Operator::Mul,
        3 => Operator::Div,
        4 => Operator::Mod,
        5 => Operator::LeftShift,
        6 => Operator::RightShift,
        7 => Operator::UnsignedRightShift,
        8 => Operator::BitAnd,
        9 => Operator::BitOr,
        10 => Operator::BitXor,
        11 => Operator::And,
        12 => Operator::Or,
        13 => Operator::CompareEq,
        14 => Operator::CompareStrictEq,
        15 => Operator::CompareNe,
        16 => Operator::CompareStrictNe,
        17 => Operator::CompareLt,
        18 => Operator::CompareLe,
        19 => Operator::CompareGt,
        20 => Operator::CompareGe,
        21 => Operator::LogicalNot,
        22 => Operator::Negate,
        23 => Operator::BitNot,
        24 => Operator::Increment,
        25 => Operator::Decrement,
        n => return Err(EjsError::Instruction(format!("unknown operator byte {n}"))),
    })
}

fn tag_of(instr: &Instr) -> u8 {
    use Instr::*;
    match instr {
        LoadUndefined => 0,
        LoadNull => 1,
        LoadTrue => 2,
        LoadFalse => 3,
        LoadThis => 4,
        LoadGlobal => 5,
        LoadInt(_) => 6,
        LoadDouble(_) => 7,
        LoadString(_) => 8,
        LoadNamespace(_) => 9,
        LoadRegexp(_) => 10,
        LoadXml(_) => 11,
        LoadGlobalSlot(_) => 12,
        StoreGlobalSlot(_) => 13,
        LoadLocalSlot(_) => 14,
        StoreLocalSlot(_) => 15,
        LoadThisSlot(_) => 16,
        StoreThisSlot(_) => 17,
        LoadBlockSlot { .. } => 18,
        StoreBlockSlot { .. } => 19,
        LoadBaseSlot { .. } => 20,
        StoreBaseSlot { .. } => 21,
        LoadByName(_) => 22,
        StoreByName(_) => 23,
        LoadByNameExpr => 24,
        StoreByNameExpr => 25,
        LoadObjectProperty(_) => 26,
        StoreObjectProperty(_) => 27,
        LoadObjectPropertyExpr => 28,
        StoreObjectPropertyExpr => 29,
        CallGlobalSlot { .. } => 30,
        CallLocalSlot { .. } => 31,
        CallThisSlot { .. } => 32,
        CallBlockSlot { .. } => 33,
        CallByName { .. } => 34,
        CallObjectByName { .. } => 35,
        CallObjectByNameExpr { .. } => 36,
        CallFunctionValue { .. } => 37,
        CallConstructor { .. } => 38,
        CallNextConstructor { .. } => 39,
        CallInstanceMethod { .. } => 40,
        CallStaticMethod { .. } => 41,
        UnaryOp(_) => 42,
        BinaryOp(_) => 43,
        Goto(_) => 44,
        BranchTrue(_) => 45,
        BranchFalse(_) => 46,
        CompareBranch { .. } => 47,
        InitDefaultArgs(_) => 48,
        OpenBlock => 49,
        CloseBlock => 50,
        OpenWith => 51,
        CloseWith => 52,
        AddNamespace(_) => 53,
        AddNamespaceRef => 54,
        Throw => 55,
        Finally => 56,
        EndException => 57,
        New { .. } => 58,
        NewObject { .. } => 59,
        DefineClass(_) => 60,
        DefineFunction(_) => 61,
        Pop => 62,
        Dup => 63,
        Swap => 64,
        Nop => 65,
        Breakpoint => 66,
        Return => 67,
        EndCode => 68,
    }
}

/// Serializes a decoded instruction stream back into the same byte
/// encoding a `.mod` file's FUNCTION `code` blob carries (spec §6.2:
/// "fixed encoding of immediate operands decoded via Num/Word/Name").
/// Exists so that tests and the end-to-end scenarios in spec §8 can
/// build bytecode inline instead of needing a compiler (explicitly out
/// of scope, spec §1 Non-goals).
pub fn encode_program(instrs: &[Instr]) -> Vec<u8> {
    let mut out = Vec::new();
    for instr in instrs {
        out.push(tag_of(instr));
        encode_operands(instr, &mut out);
    }
    out
}

fn encode_operands(instr: &Instr, out: &mut Vec<u8>) {
    use Instr::*;
    match instr {
        LoadUndefined | LoadNull | LoadTrue | LoadFalse | LoadThis | LoadGlobal | LoadByNameExpr
        | StoreByNameExpr | LoadObjectPropertyExpr | StoreObjectPropertyExpr | OpenBlock
        | CloseBlock | OpenWith | CloseWith | AddNamespaceRef | Throw | Finally | EndException
        | Pop | Dup | Swap | Nop | Breakpoint | Return | EndCode => {}
        LoadInt(n) => out.extend(encode_num(*n)),
        LoadDouble(d) => out.extend(d.to_le_bytes()),
        LoadString(t) | LoadNamespace(t) | LoadRegexp(t) | LoadXml(t) | LoadByName(t)
        | StoreByName(t) | LoadObjectProperty(t) | StoreObjectProperty(t) | AddNamespace(t) => {
            out.extend(encode_num(*t as i64))
        }
        LoadGlobalSlot(s) | StoreGlobalSlot(s) | LoadLocalSlot(s) | StoreLocalSlot(s)
        | LoadThisSlot(s) | StoreThisSlot(s) | DefineClass(s) | DefineFunction(s) => {
            out.extend(encode_num(*s as i64))
        }
        LoadBlockSlot { depth, slot } | StoreBlockSlot { depth, slot } | LoadBaseSlot { depth, slot } | StoreBaseSlot { depth, slot } => {
            out.extend(encode_num(*depth as i64));
            out.extend(encode_num(*slot as i64));
        }
        CallGlobalSlot { slot, argc } | CallLocalSlot { slot, argc } | CallThisSlot { slot, argc }
        | CallInstanceMethod { slot, argc } | CallStaticMethod { slot, argc } => {
            out.extend(encode_num(*slot as i64));
            out.extend(encode_num(*argc as i64));
        }
        CallBlockSlot { depth, slot, argc } => {
            out.extend(encode_num(*depth as i64));
            out.extend(encode_num(*slot as i64));
            out.extend(encode_num(*argc as i64));
        }
        CallByName { name, argc } | CallObjectByName { name, argc } => {
            out.extend(encode_num(*name as i64));
            out.extend(encode_num(*argc as i64));
        }
        CallObjectByNameExpr { argc } | CallFunctionValue { argc } | CallConstructor { argc }
        | CallNextConstructor { argc } => out.extend(encode_num(*argc as i64)),
        UnaryOp(op) => out.push(operator_byte(*op)),
        BinaryOp(op) => out.push(operator_byte(*op)),
        Goto(off) | BranchTrue(off) | BranchFalse(off) => out.extend(encode_num(*off as i64)),
        CompareBranch { op, offset } => {
            out.push(operator_byte(*op));
            out.extend(encode_num(*offset as i64));
        }
        InitDefaultArgs(table) => {
            out.extend(encode_num(table.len() as i64));
            for off in table {
                out.extend(encode_num(*off as i64));
            }
        }
        New { type_slot, argc } => {
            out.extend(encode_num(*type_slot as i64));
            out.extend(encode_num(*argc as i64));
        }
        NewObject { num_props } => out.extend(encode_num(*num_props as i64)),
    }
}

/// Decodes one instruction at the cursor's current position.
pub fn decode_one(cursor: &mut Cursor) -> Result<Instr> {
    let tag = cursor.u1()?;
    Ok(match tag {
        0 => Instr::LoadUndefined,
        1 => Instr::LoadNull,
        2 => Instr::LoadTrue,
        3 => Instr::LoadFalse,
        4 => Instr::LoadThis,
        5 => Instr::LoadGlobal,
        6 => Instr::LoadInt(cursor.num()?),
        7 => Instr::LoadDouble(f64::from_le_bytes(cursor.bytes(8)?.try_into().unwrap())),
        8 => Instr::LoadString(cursor.string_token()?),
        9 => Instr::LoadNamespace(cursor.string_token()?),
        10 => Instr::LoadRegexp(cursor.string_token()?),
        11 => Instr::LoadXml(cursor.string_token()?),
        12 => Instr::LoadGlobalSlot(cursor.num()? as i32),
        13 => Instr::StoreGlobalSlot(cursor.num()? as i32),
        14 => Instr::LoadLocalSlot(cursor.num()? as i32),
        15 => Instr::StoreLocalSlot(cursor.num()? as i32),
        16 => Instr::LoadThisSlot(cursor.num()? as i32),
        17 => Instr::StoreThisSlot(cursor.num()? as i32),
        18 => Instr::LoadBlockSlot { depth: cursor.num()? as u32, slot: cursor.num()? as i32 },
        19 => Instr::StoreBlockSlot { depth: cursor.num()? as u32, slot: cursor.num()? as i32 },
        20 => Instr::LoadBaseSlot { depth: cursor.num()? as u32, slot: cursor.num()? as i32 },
        21 => Instr::StoreBaseSlot { depth: cursor.num()? as u32, slot: cursor.num()? as i32 },
        22 => Instr::LoadByName(cursor.string_token()?),
        23 => Instr::StoreByName(cursor.string_token()?),
        24 => Instr::LoadByNameExpr,
        25 => Instr::StoreByNameExpr,
        26 => Instr::LoadObjectProperty(cursor.string_token()?),
        27 => Instr::StoreObjectProperty(cursor.string_token()?),
        28 => Instr::LoadObjectPropertyExpr,
        29 => Instr::StoreObjectPropertyExpr,
        30 => Instr::CallGlobalSlot { slot: cursor.num()? as i32, argc: cursor.num()? as u32 },
        31 => Instr::CallLocalSlot { slot: cursor.num()? as i32, argc: cursor.num()? as u32 },
        32 => Instr::CallThisSlot { slot: cursor.num()? as i32, argc: cursor.num()? as u32 },
        33 => Instr::CallBlockSlot {
            depth: cursor.num()? as u32,
            slot: cursor.num()? as i32,
            argc: cursor.num()? as u32,
        },
        34 => Instr::CallByName { name: cursor.string_token()?, argc: cursor.num()? as u32 },
        35 => Instr::CallObjectByName { name: cursor.string_token()?, argc: cursor.num()? as u32 },
        36 => Instr::CallObjectByNameExpr { argc: cursor.num()? as u32 },
        37 => Instr::CallFunctionValue { argc: cursor.num()? as u32 },
        38 => Instr::CallConstructor { argc: cursor.num()? as u32 },
        39 => Instr::CallNextConstructor { argc: cursor.num()? as u32 },
        40 => Instr::CallInstanceMethod { slot: cursor.num()? as i32, argc: cursor.num()? as u32 },
        41 => Instr::CallStaticMethod { slot: cursor.num()? as i32, argc: cursor.num()? as u32 },
        42 => Instr::UnaryOp(operator_from_byte(cursor.u1()?)?),
        43 => Instr::BinaryOp(operator_from_byte(cursor.u1()?)?),
        44 => Instr::Goto(cursor.num()? as i32),
        45 => Instr::BranchTrue(cursor.num()? as i32),
        46 => Instr::BranchFalse(cursor.num()? as i32),
        47 => Instr::CompareBranch { op: operator_from_byte(cursor.u1()?)?, offset: cursor.num()? as i32 },
        48 => {
            let len = cursor.num()? as usize;
            let mut table = Vec::with_capacity(len);
            for _ in 0..len {
                table.push(cursor.num()? as i32);
            }
            Instr::InitDefaultArgs(table)
        }
        49 => Instr::OpenBlock,
        50 => Instr::CloseBlock,
        51 => Instr::OpenWith,
        52 => Instr::CloseWith,
        53 => Instr::AddNamespace(cursor.string_token()?),
        54 => Instr::AddNamespaceRef,
        55 => Instr::Throw,
        56 => Instr::Finally,
        57 => Instr::EndException,
        58 => Instr::New { type_slot: cursor.num()? as i32, argc: cursor.num()? as u32 },
        59 => Instr::NewObject { num_props: cursor.num()? as u32 },
        60 => Instr::DefineClass(cursor.num()? as i32),
        61 => Instr::DefineFunction(cursor.num()? as i32),
        62 => Instr::Pop,
        63 => Instr::Dup,
        64 => Instr::Swap,
        65 => Instr::Nop,
        66 => Instr::Breakpoint,
        67 => Instr::Return,
        68 => Instr::EndCode,
        n => return Err(EjsError::Instruction(format!("unknown opcode byte {n}"))),
    })
}

/// Decodes an entire code blob into a flat instruction list plus each
/// instruction's starting byte offset (branch targets in spec bytecode
/// are byte offsets into this blob, not instruction indices).
pub fn decode_program(bytes: &[u8]) -> Result<Vec<(usize, Instr)>> {
    let mut cursor = Cursor::new(bytes);
    let mut out = Vec::new();
    while !cursor.is_empty() {
        let start = cursor.position();
        out.push((start, decode_one(&mut cursor)?));
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn optable_mnemonics_are_unique() {
        let table = optable();
        let mut names: Vec<_> = table.iter().map(|(name, _)| *name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), table.len());
    }

    #[test]
    fn optable_byte_values_are_unique() {
        let table = optable();
        let mut codes: Vec<_> = table.iter().map(|(_, code)| *code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), table.len());
    }
}
