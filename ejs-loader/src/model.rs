//! In-memory shape of a decoded `.mod` file (spec §4.4/§6.1). This is the
//! loader's own intermediate representation — turning these definitions
//! into live `ejs-value` `Type`/`Function` instances is the interpreter's
//! job (the module *installer*, not the decoder) since that requires a
//! running `Ejs` to allocate into.

use bitflags::bitflags;
use ejs_value::ConstantPool;

bitflags! {
    /// Wire attribute bits used by CLASS/FUNCTION/PROPERTY sections
    /// (spec §6.1 "Attribute bits used by the loader").
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LoaderAttrs: u32 {
        const NATIVE            = 1 << 0;
        const STATIC             = 1 << 1;
        const CONSTRUCTOR        = 1 << 2;
        const INITIALIZER        = 1 << 3;
        const STATIC_INITIALIZER = 1 << 4;
        const GETTER             = 1 << 5;
        const SETTER             = 1 << 6;
        const REST               = 1 << 7;
        const OVERRIDE            = 1 << 8;
        const FULL_SCOPE          = 1 << 9;
        const HAS_RETURN          = 1 << 10;
        const NO_BIND             = 1 << 11;
        const DYNAMIC_INSTANCE    = 1 << 12;
        const OBJECT_HELPERS      = 1 << 13;
        const BLOCK_HELPERS       = 1 << 14;
        const OBJECT              = 1 << 15;
        const HAS_VALUE           = 1 << 16;
        const CALLS_SUPER         = 1 << 17;
        const INTERFACE           = 1 << 18;
        const FINAL               = 1 << 19;
    }
}

/// A decoded `Name; Num` pair token: byte offsets into the owning
/// module's constant pool (spec §4.4 "Name: String, String").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameTokens {
    pub name: usize,
    pub space: usize,
}

/// A decoded type reference (spec §4.4 "Type reference").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeRefSpec {
    NoRef,
    Slot(i32),
    Name { name: usize, space: usize },
}

#[derive(Debug, Clone)]
pub struct Dependency {
    pub name_token: usize,
    pub checksum: i64,
    pub min_version: i64,
    pub max_version: i64,
}

#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: NameTokens,
    pub attributes: LoaderAttrs,
    pub slot_num: i32,
    pub type_ref: TypeRefSpec,
    pub initial_value_token: Option<usize>,
    pub doc: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ExceptionDef {
    pub flags: ejs_value::HandlerFlags,
    pub try_start: i64,
    pub try_end: i64,
    pub handler_start: i64,
    pub handler_end: i64,
    pub num_blocks: i64,
    pub num_stack: i64,
    pub catch_type: TypeRefSpec,
}

#[derive(Debug, Clone)]
pub struct BlockDef {
    pub name_token: usize,
    pub slot_num: i32,
    pub num_slot: i64,
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: NameTokens,
    pub next_slot: i32,
    pub attributes: LoaderAttrs,
    pub lang: u8,
    pub return_type: TypeRefSpec,
    pub slot_num: i32,
    pub num_args: i64,
    pub num_locals: i64,
    pub code: Vec<u8>,
    pub exceptions: Vec<ExceptionDef>,
    pub blocks: Vec<BlockDef>,
    pub properties: Vec<PropertyDef>,
    pub doc: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: NameTokens,
    pub attributes: LoaderAttrs,
    pub slot_num: i32,
    pub base: TypeRefSpec,
    pub num_type_prop: i64,
    pub num_instance_prop: i64,
    pub interfaces: Vec<TypeRefSpec>,
    pub properties: Vec<PropertyDef>,
    pub functions: Vec<FunctionDef>,
    pub blocks: Vec<BlockDef>,
    pub doc: Option<String>,
}

/// One decoded `MODULE ... MODULE_END` unit (spec §3 "Module").
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub name_token: usize,
    pub version: i64,
    pub checksum: i32,
    pub constants: ConstantPool,
    pub dependencies: Vec<Dependency>,
    pub classes: Vec<ClassDef>,
    pub functions: Vec<FunctionDef>,
    pub properties: Vec<PropertyDef>,
    pub doc: Option<String>,
}

impl LoadedModule {
    /// Reads `token` as a UTF-8 string out of this module's own constant
    /// pool (spec §3 "ConstantPool ... tokens are byte offsets").
    pub fn string(&self, token: usize) -> ejs_value::Result<&str> {
        self.constants.str_at(token)
    }
}
