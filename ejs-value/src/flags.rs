//! Bitfields used throughout the value/object/type model (spec §3).
//!
//! The original runtime packs these into plain integer masks; `bitflags`
//! gives the same zero-cost layout with a typed, composable API.

use bitflags::bitflags;

bitflags! {
    /// Per-`Var` state flags (spec §3 "Var (value header)").
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VarFlags: u32 {
        const PRIMITIVE          = 1 << 0;
        const IS_TYPE            = 1 << 1;
        const IS_FUNCTION        = 1 << 2;
        const IS_OBJECT          = 1 << 3;
        const IS_BLOCK           = 1 << 4;
        const IS_FRAME           = 1 << 5;
        const DYNAMIC            = 1 << 6;
        const PERMANENT          = 1 << 7;
        const MARKED             = 1 << 8;
        const VISITED            = 1 << 9;
        const HIDDEN             = 1 << 10;
        const MASTER             = 1 << 11;
        const BUILTIN            = 1 << 12;
        const HAS_GETTER_SETTER  = 1 << 13;
    }
}

bitflags! {
    /// Per-slot `Trait` attribute bits (spec §3 "Trait").
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TraitAttrs: u32 {
        const READONLY   = 1 << 0;
        const DELETED    = 1 << 1;
        const ENUMERABLE = 1 << 2;
        const OVERRIDE   = 1 << 3;
        const GETTER     = 1 << 4;
        const SETTER     = 1 << 5;
    }
}

bitflags! {
    /// `Type` shape flags (spec §3 "Type").
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeFlags: u32 {
        const HAS_CONSTRUCTOR        = 1 << 0;
        const HAS_INITIALIZER        = 1 << 1;
        const HAS_STATIC_INITIALIZER = 1 << 2;
        const NEED_FIXUP             = 1 << 3;
        const IS_INTERFACE           = 1 << 4;
        const FINAL                  = 1 << 5;
        const OBJECT_BASED           = 1 << 6;
        const DYNAMIC_INSTANCE       = 1 << 7;
        const CALLS_SUPER            = 1 << 8;
        const HAS_NATIVE_BASE        = 1 << 9;
        const NUMERIC_INDICIES       = 1 << 10;
        const SKIP_SCOPE             = 1 << 11;
    }
}

bitflags! {
    /// `Function` flag bits (spec §3 "Function").
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FunctionFlags: u32 {
        const GETTER         = 1 << 0;
        const SETTER         = 1 << 1;
        const CONSTRUCTOR    = 1 << 2;
        const STATIC_METHOD  = 1 << 3;
        const OVERRIDE       = 1 << 4;
        const REST           = 1 << 5;
        const FULL_SCOPE     = 1 << 6;
        const NATIVE_PROC    = 1 << 7;
        const IS_INITIALIZER = 1 << 8;
        const LITERAL_GETTER = 1 << 9;
        const HAS_RETURN     = 1 << 10;
        const LOADING        = 1 << 11;
        const IS_FRAME       = 1 << 12;
    }
}

bitflags! {
    /// Exception handler kind (spec §3 "Exception handler").
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HandlerFlags: u32 {
        const CATCH     = 1 << 0;
        const FINALLY   = 1 << 1;
        const ITERATION = 1 << 2;
    }
}

/// Frame language mode (spec §4.5 "Language modes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LangMode {
    Fixed,
    Strict,
    Plus,
    Ecma,
}

/// Namespace visibility/reservation bits (spec §3 "Namespace").
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NamespaceFlags: u32 {
        const PRIVATE   = 1 << 0;
        const PROTECTED = 1 << 1;
        const RESERVED  = 1 << 2;
    }
}
