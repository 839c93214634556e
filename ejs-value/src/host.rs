//! The interface native-backed types and native function procs are coded
//! against (spec §4.5 "native then invokes `proc(ejs, this, argc, argv)`").
//!
//! `ejs-value` cannot depend on the interpreter crate (that would be
//! circular — the interpreter depends on the value model), so native
//! procs are written against this narrow trait instead of a concrete
//! `Ejs` type. The root crate's interpreter implements it.

use crate::error::Result;
use crate::var::{HeapHandle, Var};

/// Everything a native method body or helper override needs from the
/// running interpreter.
pub trait VmHost {
    /// Allocates a fresh instance of `type_` through the GC (pool-first,
    /// heap-fallback per spec §4.7).
    fn allocate(&mut self, type_: &HeapHandle, extra_slots: usize) -> Result<Var>;

    /// Sets `ejs.exception` and raises the VM's `attention` flag (spec
    /// §4.6/§7): the dispatch loop checks this after the current opcode.
    fn throw(&mut self, value: Var);

    /// The per-interpreter singleton table (true/false/null/undefined/...).
    fn singleton_undefined(&self) -> Var;
    fn singleton_null(&self) -> Var;
    fn singleton_true(&self) -> Var;
    fn singleton_false(&self) -> Var;

    /// Looks up a core type by name (e.g. "Object", "Array") for natives
    /// that need to construct instances of another builtin type.
    fn core_type(&self, name: &str) -> Option<HeapHandle>;
}
