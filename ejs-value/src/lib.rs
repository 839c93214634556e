//! The Ejscript value model: `Var`, the Object/Block/Function/Frame/Type
//! family, names tables, the per-`Type` helper vtable, and primitive
//! casting/coercion (spec §3/§4.1/§4.2).
//!
//! This crate deliberately does not depend on the interpreter or GC —
//! native code and helper overrides reach back into the running
//! interpreter through the narrow [`host::VmHost`] trait instead, so that
//! `ejs-vm` can depend on `ejs-value` without a cycle.

pub mod cast;
pub mod error;
pub mod flags;
pub mod helpers;
pub mod host;
pub mod name;
pub mod pool;
pub mod var;

pub use error::{EjsError, Result};
pub use flags::{FunctionFlags, HandlerFlags, LangMode, NamespaceFlags, TraitAttrs, TypeFlags, VarFlags};
pub use helpers::{HelperTable, Operator};
pub use host::VmHost;
pub use name::{Name, Namespace};
pub use pool::ConstantPool;
pub use var::{
    BlockData, Code, ExceptionHandler, FrameData, FunctionBody, FunctionData, Heap, HeapHandle,
    NameEntry, NamesTable, NativeProc, ObjectData, Payload, SlotTrait, TypeData, Var,
};
