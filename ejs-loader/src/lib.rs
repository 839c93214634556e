//! The `.mod` bytecode file decoder: variable-length `Num`/`Word`
//! encoding, constant-pool tokens, section-tag dispatch, the fixup list
//! for forward type references, and module search-path resolution
//! (spec §3/§4.4/§6.1/§6.4).
//!
//! This crate only decodes bytes into [`model::LoadedModule`], a plain
//! intermediate representation. Turning that into live `ejs-value`
//! `Type`/`Function` instances — the module *installer* — belongs to
//! the interpreter crate, which owns the running global-slot table the
//! decoder has no access to.

pub mod encoding;
pub mod fixup;
pub mod loader;
pub mod model;
pub mod search;
pub mod version;

pub use fixup::{Fixup, FixupKind};
pub use loader::{decode_module, resolve_local_fixups, DecodeResult, EJS_MODULE_MAGIC, EJS_MODULE_VERSION};
pub use model::{
    BlockDef, ClassDef, Dependency, ExceptionDef, FunctionDef, LoaderAttrs, LoadedModule,
    NameTokens, PropertyDef, TypeRefSpec,
};
