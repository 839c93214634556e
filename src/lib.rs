//! Ejscript: an embeddable implementation of a JavaScript-family language
//! (spec §1 "Purpose & Scope"). This crate is the embedding-API surface;
//! the value model, object/block/type system, bytecode VM, module loader
//! and garbage collector each live in their own `ejs-*` crate and are
//! re-exported here where the embedding API needs them.

pub mod bootstrap;
pub mod ejs;
pub mod service;

pub use ejs::{Ejs, LastError};
pub use service::{NativeModuleConfigurator, Service};

pub use ejs_gc::{Generation, GcStats};
pub use ejs_value::error::{EjsError, Result};
pub use ejs_value::{HeapHandle, Var, VmHost};
