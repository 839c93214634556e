//! The exception taxonomy from the error handling design (spec §7).
//!
//! Every variant is a distinct, user-visible Ejscript exception class; all
//! of them conceptually descend from `Error` the way the scripted class
//! hierarchy does. Native helpers construct one of these and hand it to
//! the interpreter (`Ejs::throw`) rather than unwinding through Rust's own
//! panic machinery.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EjsError {
    #[error("ArgError: {0}")]
    Arg(String),
    #[error("ArithmeticError: {0}")]
    Arithmetic(String),
    #[error("AssertError: {0}")]
    Assert(String),
    #[error("InstructionError: {0}")]
    Instruction(String),
    #[error("IOError: {0}")]
    Io(String),
    #[error("InternalError: {0}")]
    Internal(String),
    #[error("MemoryError: {0}")]
    Memory(String),
    #[error("OutOfBoundsError: {0}")]
    OutOfBounds(String),
    #[error("ReferenceError: {0}")]
    Reference(String),
    #[error("ResourceError: {0}")]
    Resource(String),
    #[error("SecurityError: {0}")]
    Security(String),
    #[error("StateError: {0}")]
    State(String),
    #[error("SyntaxError: {0}")]
    Syntax(String),
    #[error("TypeError: {0}")]
    Type(String),
    #[error("URIError: {0}")]
    Uri(String),
    /// Sentinel used to drive `for..in`/`for each` iteration protocol, never
    /// reported to the host as a real failure.
    #[error("StopIteration")]
    StopIteration,
}

impl EjsError {
    /// The bare exception class name, as it would appear in a scripted
    /// `catch (e: TypeName)` clause and in the unhandled-exception trace
    /// (spec §7: `TypeName Exception: message`).
    pub fn class_name(&self) -> &'static str {
        match self {
            EjsError::Arg(_) => "ArgError",
            EjsError::Arithmetic(_) => "ArithmeticError",
            EjsError::Assert(_) => "AssertError",
            EjsError::Instruction(_) => "InstructionError",
            EjsError::Io(_) => "IOError",
            EjsError::Internal(_) => "InternalError",
            EjsError::Memory(_) => "MemoryError",
            EjsError::OutOfBounds(_) => "OutOfBoundsError",
            EjsError::Reference(_) => "ReferenceError",
            EjsError::Resource(_) => "ResourceError",
            EjsError::Security(_) => "SecurityError",
            EjsError::State(_) => "StateError",
            EjsError::Syntax(_) => "SyntaxError",
            EjsError::Type(_) => "TypeError",
            EjsError::Uri(_) => "URIError",
            EjsError::StopIteration => "StopIteration",
        }
    }
}

pub type Result<T> = std::result::Result<T, EjsError>;
