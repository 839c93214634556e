//! The universal value handle `Var` and the Object/Block/Function/Frame/Type
//! family it can point at (spec §3).
//!
//! The C runtime this is modeled on gives every live value a uniform
//! `{type, flags, ...payload}` header and reaches subtype-specific fields
//! through a shared prefix. Rust has no layout-compatible inheritance, so
//! the prefix relationship becomes composition: `BlockData` embeds an
//! `ObjectData`, `FunctionData` embeds a `BlockData`, and so on. `Heap`
//! is the one allocation every reference-typed `Var` points at; `Payload`
//! picks out which member of the family it is.

use crate::flags::{FunctionFlags, LangMode, TraitAttrs, TypeFlags, VarFlags};
use crate::name::{Name, Namespace};
use std::cell::RefCell;
use std::rc::Rc;

/// Shared handle to any heap-allocated value (Object, Block, Function,
/// Frame, or Type). Cloning a `HeapHandle` is a pointer copy, matching
/// the "reference types compare by pointer identity" rule (spec §4.1).
pub type HeapHandle = Rc<RefCell<Heap>>;

/// The universal value handle (spec §3 "Var").
#[derive(Debug, Clone)]
pub enum Var {
    Undefined,
    Null,
    Boolean(bool),
    /// Ejscript numbers are IEEE double, matching the ECMA-like cast rules
    /// in spec §4.1.
    Number(f64),
    String(Rc<str>),
    /// Any Object/Block/Function/Frame/Type instance.
    Ref(HeapHandle),
}

impl Var {
    pub fn is_primitive(&self) -> bool {
        !matches!(self, Var::Ref(_))
    }

    /// Pointer identity for reference types; primitives are never `same_as`
    /// another primitive even with equal value (strict equality is a
    /// separate, type-aware comparison in `crate::cast`).
    pub fn same_as(&self, other: &Var) -> bool {
        match (self, other) {
            (Var::Ref(a), Var::Ref(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn as_ref_handle(&self) -> Option<&HeapHandle> {
        match self {
            Var::Ref(h) => Some(h),
            _ => None,
        }
    }
}

/// A heap allocation: a type pointer, state flags, and the kind-specific
/// payload. GC generation bookkeeping (which list this allocation lives
/// on) is owned by `ejs-gc`, not here — this struct only carries what the
/// value model itself needs.
#[derive(Debug)]
pub struct Heap {
    /// `None` only transiently during bootstrap, before the first
    /// generation of core types has wired itself up.
    pub type_: Option<HeapHandle>,
    pub flags: VarFlags,
    pub payload: Payload,
}

#[derive(Debug)]
pub enum Payload {
    Object(ObjectData),
    Block(BlockData),
    Function(FunctionData),
    Frame(FrameData),
    Type(TypeData),
}

impl Heap {
    pub fn object(type_: Option<HeapHandle>, flags: VarFlags, data: ObjectData) -> Self {
        Heap {
            type_,
            flags: flags | VarFlags::IS_OBJECT,
            payload: Payload::Object(data),
        }
    }

    pub fn block(type_: Option<HeapHandle>, flags: VarFlags, data: BlockData) -> Self {
        Heap {
            type_,
            flags: flags | VarFlags::IS_OBJECT | VarFlags::IS_BLOCK,
            payload: Payload::Block(data),
        }
    }

    pub fn function(type_: Option<HeapHandle>, flags: VarFlags, data: FunctionData) -> Self {
        Heap {
            type_,
            flags: flags | VarFlags::IS_OBJECT | VarFlags::IS_BLOCK | VarFlags::IS_FUNCTION,
            payload: Payload::Function(data),
        }
    }

    pub fn frame(type_: Option<HeapHandle>, flags: VarFlags, data: FrameData) -> Self {
        Heap {
            type_,
            flags: flags
                | VarFlags::IS_OBJECT
                | VarFlags::IS_BLOCK
                | VarFlags::IS_FUNCTION
                | VarFlags::IS_FRAME,
            payload: Payload::Frame(data),
        }
    }

    pub fn type_obj(type_: Option<HeapHandle>, flags: VarFlags, data: TypeData) -> Self {
        Heap {
            type_,
            flags: flags | VarFlags::IS_OBJECT | VarFlags::IS_BLOCK | VarFlags::IS_TYPE,
            payload: Payload::Type(data),
        }
    }

    /// The `Object` prefix shared by every payload kind (spec §3: Block,
    /// Function, Frame, Type all extend Object).
    pub fn as_object(&self) -> &ObjectData {
        match &self.payload {
            Payload::Object(o) => o,
            Payload::Block(b) => &b.object,
            Payload::Function(f) => &f.block.object,
            Payload::Frame(f) => &f.function.block.object,
            Payload::Type(t) => &t.block.object,
        }
    }

    pub fn as_object_mut(&mut self) -> &mut ObjectData {
        match &mut self.payload {
            Payload::Object(o) => o,
            Payload::Block(b) => &mut b.object,
            Payload::Function(f) => &mut f.block.object,
            Payload::Frame(f) => &mut f.function.block.object,
            Payload::Type(t) => &mut t.block.object,
        }
    }

    pub fn as_block(&self) -> Option<&BlockData> {
        match &self.payload {
            Payload::Block(b) => Some(b),
            Payload::Function(f) => Some(&f.block),
            Payload::Frame(f) => Some(&f.function.block),
            Payload::Type(t) => Some(&t.block),
            Payload::Object(_) => None,
        }
    }

    pub fn as_block_mut(&mut self) -> Option<&mut BlockData> {
        match &mut self.payload {
            Payload::Block(b) => Some(b),
            Payload::Function(f) => Some(&mut f.block),
            Payload::Frame(f) => Some(&mut f.function.block),
            Payload::Type(t) => Some(&mut t.block),
            Payload::Object(_) => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionData> {
        match &self.payload {
            Payload::Function(f) => Some(f),
            Payload::Frame(f) => Some(&f.function),
            _ => None,
        }
    }

    pub fn as_function_mut(&mut self) -> Option<&mut FunctionData> {
        match &mut self.payload {
            Payload::Function(f) => Some(f),
            Payload::Frame(f) => Some(&mut f.function),
            _ => None,
        }
    }

    pub fn as_frame(&self) -> Option<&FrameData> {
        match &self.payload {
            Payload::Frame(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_frame_mut(&mut self) -> Option<&mut FrameData> {
        match &mut self.payload {
            Payload::Frame(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_type(&self) -> Option<&TypeData> {
        match &self.payload {
            Payload::Type(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_type_mut(&mut self) -> Option<&mut TypeData> {
        match &mut self.payload {
            Payload::Type(t) => Some(t),
            _ => None,
        }
    }
}

/// A single bucket chain entry in the names table (spec §3 "Names table").
#[derive(Debug, Clone)]
pub struct NameEntry {
    pub name: Name,
    /// Index of the next slot sharing this name's bucket, or `-1`.
    pub next_slot: i32,
}

/// Threshold below which a names hash table is not worth building (spec
/// §4.2: "built lazily when property count crosses a threshold (~8)").
pub const HASH_MIN_PROP: usize = 8;
/// Growth block size used when rounding up slot capacity (spec §4.2
/// "Property grow policy").
pub const NUM_PROP: usize = 8;
/// Above this property count, grow by `max(current/4, NUM_PROP)` instead of
/// to the exact requested size.
pub const LOTSA_PROP: usize = 256;

/// The open-addressed-with-chained-buckets name hash described in spec
/// §3/§4.2. `entries` is parallel to the owning object's slot vector;
/// `buckets` holds the head slot index of each chain, or `-1`.
#[derive(Debug, Clone, Default)]
pub struct NamesTable {
    pub entries: Vec<NameEntry>,
    pub buckets: Vec<i32>,
}

impl NamesTable {
    pub fn new() -> Self {
        NamesTable::default()
    }

    fn hash_name(name: &str, bucket_count: usize) -> usize {
        let mut h: u64 = 5381;
        for b in name.as_bytes() {
            h = h.wrapping_mul(33).wrapping_add(*b as u64);
        }
        (h as usize) % bucket_count.max(1)
    }

    /// Rebuilds `buckets` from `entries`, matching the "rehash" step that
    /// follows any insertion growing the bucket count (spec §4.2).
    pub fn rehash(&mut self) {
        let bucket_count = self.entries.len().max(HASH_MIN_PROP);
        self.buckets = vec![-1; bucket_count];
        for (slot, entry) in self.entries.iter_mut().enumerate() {
            let b = Self::hash_name(&entry.name.name, bucket_count);
            entry.next_slot = self.buckets[b];
            self.buckets[b] = slot as i32;
        }
    }

    /// Returns the slot index for `name`, or `-1` if absent (spec §4.1
    /// "lookupProperty ... never throws").
    pub fn lookup(&self, name: &Name) -> i32 {
        if self.buckets.is_empty() {
            return self
                .entries
                .iter()
                .position(|e| &e.name == name)
                .map(|i| i as i32)
                .unwrap_or(-1);
        }
        let b = Self::hash_name(&name.name, self.buckets.len());
        let mut slot = self.buckets[b];
        while slot != -1 {
            let entry = &self.entries[slot as usize];
            if &entry.name == name {
                return slot;
            }
            slot = entry.next_slot;
        }
        -1
    }

    /// Inserts `name` for `slot`, growing/rehashing the bucket array once
    /// the property count crosses `HASH_MIN_PROP` and the chain depth
    /// would exceed the bucket count (spec §4.2: "Inserting a new name
    /// grows and rehashes when bucket count < property count").
    pub fn insert(&mut self, name: Name, slot: usize) {
        while self.entries.len() <= slot {
            self.entries.push(NameEntry {
                name: Name::unqualified(""),
                next_slot: -1,
            });
        }
        self.entries[slot] = NameEntry { name, next_slot: -1 };
        if self.entries.len() > HASH_MIN_PROP && self.buckets.len() < self.entries.len() {
            self.rehash();
        } else if !self.buckets.is_empty() {
            let b = Self::hash_name(&self.entries[slot].name.name, self.buckets.len());
            self.entries[slot].next_slot = self.buckets[b];
            self.buckets[b] = slot as i32;
        }
    }
}

/// Computes the next slot capacity for a requested property count (spec
/// §4.2 "Property grow policy").
pub fn grow_capacity(current: usize, requested: usize) -> usize {
    if requested > LOTSA_PROP {
        requested.max(current + (current / 4).max(NUM_PROP))
    } else {
        // round up to the next NUM_PROP block
        ((requested + NUM_PROP - 1) / NUM_PROP) * NUM_PROP
    }
}

/// The base `Object` (spec §3 "Object").
#[derive(Debug, Default)]
pub struct ObjectData {
    pub slots: Vec<Var>,
    /// Shared with the declaring `Type` until this object is mutated
    /// (copy-on-write via `Rc::make_mut`).
    pub names: Rc<NamesTable>,
}

impl ObjectData {
    pub fn num_prop(&self) -> usize {
        self.slots.len()
    }

    pub fn names_mut(&mut self) -> &mut NamesTable {
        Rc::make_mut(&mut self.names)
    }
}

/// `Block` (spec §3): an `Object` plus per-slot `Trait`s, an ordered
/// namespace list, and the scope-chain/call-stack back-pointers.
#[derive(Debug, Default)]
pub struct BlockData {
    pub object: ObjectData,
    pub traits: Vec<SlotTrait>,
    pub num_inherited: usize,
    /// The lexical enclosing scope captured at function-definition time
    /// (closures) — a DAG edge, not an owning reference.
    pub scope_chain: Option<HeapHandle>,
    /// The call-stack link (distinct from `scope_chain`).
    pub prev: Option<HeapHandle>,
    pub namespaces: Vec<Namespace>,
    pub prev_exception: Option<Var>,
}

#[derive(Debug, Clone, Default)]
pub struct SlotTrait {
    /// `None` means untyped (spec §3 "Trait": "type ptr (may be null =
    /// untyped)").
    pub type_: Option<HeapHandle>,
    pub attributes: TraitAttrs,
}

impl BlockData {
    pub fn num_traits(&self) -> usize {
        self.traits.len()
    }

    /// Opens `ns` on this block (most-recently-opened wins when walking in
    /// reverse, spec §4.3).
    pub fn open_namespace(&mut self, ns: Namespace) {
        self.namespaces.push(ns);
    }
}

#[derive(Debug, Clone, Default)]
pub struct Code {
    pub byte_code: Vec<u8>,
    pub constants: Rc<crate::pool::ConstantPool>,
    pub handlers: Vec<ExceptionHandler>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionHandler {
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
    pub num_blocks: u32,
    pub num_stack: u32,
    /// `None` catches any exception type (spec §3: used for `finally`).
    pub catch_type_slot: Option<i32>,
    pub flags: crate::flags::HandlerFlags,
}

/// Either scripted bytecode or a native callback (spec §3 "Function":
/// "If native then `code` is empty and `proc` is non-null").
#[derive(Clone)]
pub enum FunctionBody {
    Code(Code),
    Native(NativeProc),
}

impl std::fmt::Debug for FunctionBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FunctionBody::Code(c) => f.debug_tuple("Code").field(&c.byte_code.len()).finish(),
            FunctionBody::Native(_) => f.write_str("Native(..)"),
        }
    }
}

pub type NativeProc = fn(&mut dyn crate::host::VmHost, Option<Var>, &[Var]) -> crate::error::Result<Var>;

/// `Function` (spec §3): a `Block` plus code/proc and calling-convention
/// metadata.
#[derive(Debug)]
pub struct FunctionData {
    pub block: BlockData,
    pub body: FunctionBody,
    pub num_args: usize,
    pub num_default: usize,
    /// Getter→setter sibling link (spec §9 "Getter/Setter as linked
    /// slots"); `-1` when absent.
    pub next_slot: i32,
    pub result_type: Option<HeapHandle>,
    pub this_obj: Option<Var>,
    pub owner: Option<HeapHandle>,
    pub slot_num: i32,
    pub prototype: Option<HeapHandle>,
    pub flags: FunctionFlags,
    pub lang: LangMode,
}

impl Default for FunctionData {
    fn default() -> Self {
        FunctionData {
            block: BlockData::default(),
            body: FunctionBody::Code(Code::default()),
            num_args: 0,
            num_default: 0,
            next_slot: -1,
            result_type: None,
            this_obj: None,
            owner: None,
            slot_num: -1,
            prototype: None,
            flags: FunctionFlags::empty(),
            lang: LangMode::Fixed,
        }
    }
}

impl FunctionData {
    pub fn is_native(&self) -> bool {
        matches!(self.body, FunctionBody::Native(_))
    }

    pub fn is_accessor(&self) -> bool {
        self.flags
            .intersects(FunctionFlags::GETTER | FunctionFlags::SETTER)
    }
}

/// `Frame` (spec §3): a cloned `Function` activation plus the live
/// program counter and call-chain bookkeeping.
#[derive(Debug)]
pub struct FrameData {
    pub function: FunctionData,
    pub pc: usize,
    pub caller: Option<HeapHandle>,
    pub argc: usize,
    /// Evaluation-stack depth to restore on return (spec §3).
    pub stack_return: usize,
    pub stack_base: usize,
    pub current_line: u32,
    pub filename: Option<Rc<str>>,
    pub line_number: u32,
    pub in_catch: bool,
    pub in_exception: bool,
}

/// `Type` (spec §3): a `Block` that also describes instance layout and
/// acts as a constructor.
#[derive(Debug, Default)]
pub struct TypeData {
    pub block: BlockData,
    pub base_type: Option<HeapHandle>,
    /// Prototype of instance traits/slots every instance is laid out from.
    pub instance_block: Option<HeapHandle>,
    pub implements: Vec<HeapHandle>,
    pub id: i32,
    pub instance_size: usize,
    /// Depth from the root type (spec §3: "`subTypeCount` is depth from
    /// root").
    pub sub_type_count: u32,
    pub helpers: Option<Rc<crate::helpers::HelperTable>>,
    pub module_name: Option<Rc<str>>,
    pub flags: TypeFlags,
}

impl TypeData {
    /// Walks `baseType` links looking for `ancestor_id` (spec §4.1
    /// `isA`/`isSubtype`). `implements` entries are not walked here since
    /// interface conformance is a separate, non-linear check.
    pub fn is_subtype_of(&self, ancestor_id: i32) -> bool {
        let mut cur = self.base_type.clone();
        while let Some(h) = cur {
            let b = h.borrow();
            let Some(t) = b.as_type() else { break };
            if t.id == ancestor_id {
                return true;
            }
            cur = t.base_type.clone();
        }
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn names_table_insert_and_lookup() {
        let mut table = NamesTable::new();
        for i in 0..12 {
            table.insert(Name::unqualified(format!("p{i}")), i);
        }
        for i in 0..12 {
            assert_eq!(table.lookup(&Name::unqualified(format!("p{i}"))), i as i32);
        }
        assert_eq!(table.lookup(&Name::unqualified("missing")), -1);
    }

    #[test]
    fn grow_capacity_rounds_up_small_requests() {
        assert_eq!(grow_capacity(0, 1), NUM_PROP);
        assert_eq!(grow_capacity(0, NUM_PROP), NUM_PROP);
        assert_eq!(grow_capacity(0, NUM_PROP + 1), NUM_PROP * 2);
    }

    #[test]
    fn grow_capacity_uses_quarter_growth_above_lotsa() {
        let current = 512;
        let grown = grow_capacity(current, LOTSA_PROP + 1);
        assert_eq!(grown, current + current / 4);
    }
}

#[cfg(test)]
mod properties {
    use super::*;
    use proptest::prelude::*;

    fn distinct_names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("p{i}")).collect()
    }

    proptest! {
        /// P1 Slot/name parity: for every populated slot i, looking up the
        /// name stored at i returns i (spec §8).
        #[test]
        fn slot_name_parity(n in 1usize..40) {
            let names = distinct_names(n);
            let mut table = NamesTable::new();
            for (i, name) in names.iter().enumerate() {
                table.insert(Name::unqualified(name.clone()), i);
            }
            for (i, name) in names.iter().enumerate() {
                prop_assert_eq!(table.lookup(&Name::unqualified(name.clone())), i as i32);
            }
        }

        /// P2 Hash round-trip: after any sequence of inserts, forcing a
        /// rehash and re-looking up each name yields the same slot (spec §8).
        #[test]
        fn hash_round_trip_after_rehash(n in 1usize..40, shuffle_seed in 0u64..1000) {
            let names = distinct_names(n);
            let mut table = NamesTable::new();
            for (i, name) in names.iter().enumerate() {
                table.insert(Name::unqualified(name.clone()), i);
            }
            // deterministic permutation of rehash order, driven by the seed
            let mut order: Vec<usize> = (0..names.len()).collect();
            let mut seed = shuffle_seed.wrapping_add(1);
            for i in (1..order.len()).rev() {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                let j = (seed as usize) % (i + 1);
                order.swap(i, j);
            }
            table.rehash();
            for i in order {
                prop_assert_eq!(table.lookup(&Name::unqualified(names[i].clone())), i as i32);
            }
        }
    }
}
