//! The deferred type-resolution list (spec §4.4 "When a type reference
//! cannot yet be resolved ... enqueue a fixup record"; spec §9 "Forward
//! references in the loader").

use crate::model::TypeRefSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    BaseType,
    InterfaceType,
    ReturnType,
    TypeProperty,
    InstanceProperty,
    Local,
    Exception,
}

/// One unresolved reference produced while decoding `module_index`. The
/// `class_index`/`member_index` pair locates the field to patch once
/// `type_ref` resolves to a loaded `Type`; resolution itself happens in
/// the interpreter's module installer, which has access to the running
/// global-slot table the decoder never sees (spec §4.4 "resolve fixups in
/// order ... locate the target type by slot or name, then patch").
#[derive(Debug, Clone, Copy)]
pub struct Fixup {
    pub kind: FixupKind,
    pub type_ref: TypeRefSpec,
    pub module_index: usize,
    pub class_index: Option<usize>,
    pub member_index: Option<usize>,
}

impl Fixup {
    pub fn new(
        kind: FixupKind,
        type_ref: TypeRefSpec,
        module_index: usize,
        class_index: Option<usize>,
        member_index: Option<usize>,
    ) -> Self {
        Fixup {
            kind,
            type_ref,
            module_index,
            class_index,
            member_index,
        }
    }

    /// A type reference never needs a fixup when it is already a resolved
    /// global slot number (spec §4.4 "SLOT carries global slot number").
    pub fn is_needed(type_ref: &TypeRefSpec) -> bool {
        matches!(type_ref, TypeRefSpec::Name { .. })
    }
}
