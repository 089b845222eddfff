// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::string::String;
use core::fmt;

use crate::indices::FuncIndex;
use crate::trap::{Trap, WasmBacktrace};
use crate::types::{EntityKind, ValType};

/// Convenience macro for creating an `Error::Unsupported` variant.
macro_rules! wasm_unsupported {
    ($($arg:tt)*) => { $crate::Error::Unsupported(::alloc::format!($($arg)*)) }
}
pub(crate) use wasm_unsupported;

/// Error type for the crate
#[derive(Debug)]
pub enum Error {
    /// The module's encoding is structurally invalid.
    Malformed {
        /// A string describing the decoding error.
        message: String,
        /// The byte offset where the error occurred.
        offset: usize,
    },
    /// An operand or value had a different type than required.
    TypeMismatch { expected: ValType, actual: ValType },
    /// An instruction required an operand but the stack of its frame was exhausted.
    MissingOperand,
    /// A constant expression used a form that is not allowed in its position.
    InvalidConstExpr(String),
    /// An index referred to an entity that does not exist.
    Unknown { kind: EntityKind, index: u32 },
    /// No export with this name exists.
    UnknownExport(String),
    /// A required import was not provided.
    MissingImport {
        /// The module name of the import.
        module: String,
        /// The field name of the import.
        field: String,
        /// The kind of entity that was expected.
        kind: EntityKind,
    },
    /// An import was provided, but with the wrong kind or type.
    IncompatibleImport {
        module: String,
        field: String,
        message: String,
    },
    /// Any other validation or linking rule was violated.
    Invalid(String),
    /// The WebAssembly code used an unsupported feature.
    Unsupported(String),
    /// The ahead-of-time backend could not translate a function.
    Compile {
        /// The function that failed to compile.
        func: FuncIndex,
        /// A human-readable description of the error.
        message: String,
    },
    /// A compiled unit failed its load-time verification.
    Verification { func: FuncIndex, message: String },
    /// A WebAssembly trap occurred.
    Trap {
        /// The trap that occurred.
        trap: Trap,
        /// The frames that were live when the trap was raised.
        backtrace: WasmBacktrace,
        /// The error a failing host function returned.
        cause: Option<anyhow::Error>,
    },
}

impl Error {
    /// Returns the trap kind if this error is a WebAssembly trap.
    pub fn trap(&self) -> Option<Trap> {
        match self {
            Error::Trap { trap, .. } => Some(*trap),
            _ => None,
        }
    }

    pub(crate) fn unknown(kind: EntityKind, index: u32) -> Self {
        Self::Unknown { kind, index }
    }

    /// Wraps an error returned by a host function into a trap.
    pub(crate) fn host(cause: anyhow::Error) -> Self {
        Self::Trap {
            trap: Trap::HostFunctionFailed,
            backtrace: WasmBacktrace::default(),
            cause: Some(cause),
        }
    }

    /// The error a failing host function returned, if this trap came from one.
    pub fn host_cause(&self) -> Option<&anyhow::Error> {
        match self {
            Error::Trap { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn with_backtrace(self, backtrace: WasmBacktrace) -> Self {
        match self {
            Error::Trap {
                trap,
                backtrace: old,
                cause,
            } if old.is_empty() => Error::Trap {
                trap,
                backtrace,
                cause,
            },
            other => other,
        }
    }
}

impl From<Trap> for Error {
    fn from(trap: Trap) -> Self {
        Self::Trap {
            trap,
            backtrace: WasmBacktrace::default(),
            cause: None,
        }
    }
}

impl From<wasmparser::BinaryReaderError> for Error {
    fn from(e: wasmparser::BinaryReaderError) -> Self {
        Self::Malformed {
            message: e.message().into(),
            offset: e.offset(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { message, offset } => {
                write!(f, "malformed WASM input at {offset:#x}: {message}")
            }
            Self::TypeMismatch { expected, actual } => {
                write!(f, "type mismatch: expected {expected}, found {actual}")
            }
            Self::MissingOperand => f.write_str("type mismatch: missing operand"),
            Self::InvalidConstExpr(message) => {
                write!(f, "constant expression required: {message}")
            }
            Self::Unknown { kind, index } => write!(f, "unknown {kind} {index}"),
            Self::UnknownExport(name) => write!(f, "unknown export {name}"),
            Self::MissingImport {
                module,
                field,
                kind,
            } => write!(f, "unresolved import {module}::{field} ({kind})"),
            Self::IncompatibleImport {
                module,
                field,
                message,
            } => write!(f, "incompatible import type for {module}::{field}: {message}"),
            Self::Invalid(message) => f.write_str(message),
            Self::Unsupported(feature) => write!(
                f,
                "Feature used by the WebAssembly code is not supported: {feature}"
            ),
            Self::Compile { func, message } => {
                write!(f, "failed to compile function {}: {message}", func.as_u32())
            }
            Self::Verification { func, message } => write!(
                f,
                "compiled code for function {} failed verification: {message}",
                func.as_u32()
            ),
            Self::Trap {
                trap,
                backtrace,
                cause,
            } => {
                write!(f, "{trap}")?;
                if let Some(cause) = cause {
                    write!(f, ": {cause}")?;
                }
                if !backtrace.is_empty() {
                    write!(f, "\nwasm backtrace:\n{backtrace}")?;
                }
                Ok(())
            }
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Trap {
                cause: Some(cause), ..
            } => Some(&**cause),
            Self::Trap { trap, .. } => Some(trap),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;

    #[test]
    fn unknown_entity_message() {
        let err = Error::unknown(EntityKind::Global, 7);
        assert_eq!(err.to_string(), "unknown global 7");
    }

    #[test]
    fn host_errors_are_traps_with_a_cause() {
        let err = Error::host(anyhow::anyhow!("disk on fire"));
        assert_eq!(err.trap(), Some(Trap::HostFunctionFailed));
        assert_eq!(err.to_string(), "host function failed: disk on fire");
        assert_eq!(
            core::error::Error::source(&err).unwrap().to_string(),
            "disk on fire"
        );
        assert_eq!(err.host_cause().unwrap().to_string(), "disk on fire");
    }

    #[test]
    fn trap_keeps_first_backtrace() {
        let frames = WasmBacktrace::new(alloc::vec![crate::trap::FrameInfo {
            func_index: FuncIndex::from_u32(3),
            instruction_offset: 1,
        }]);
        let err = Error::from(Trap::UndefinedElement).with_backtrace(frames.clone());
        let err = err.with_backtrace(WasmBacktrace::default());
        match err {
            Error::Trap {
                trap, backtrace, ..
            } => {
                assert_eq!(trap, Trap::UndefinedElement);
                assert_eq!(backtrace, frames);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
