// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::vec::Vec;
use core::fmt;

use crate::indices::FuncIndex;

/// A runtime-detected violation that aborts the current call.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Trap {
    /// Code that was supposed to have been unreachable was reached.
    UnreachableCodeReached,
    /// An integer division by zero.
    IntegerDivisionByZero,
    /// An integer arithmetic operation caused an overflow.
    IntegerOverflow,
    /// Failed float-to-int conversion.
    BadConversionToInteger,
    /// An out-of-bounds memory access.
    MemoryOutOfBounds,
    /// Out-of-bounds access to a table.
    TableOutOfBounds,
    /// Indirect call through an empty or out-of-range table slot.
    UndefinedElement,
    /// Signature mismatch on indirect call.
    IndirectCallTypeMismatch,
    /// The configured call depth was exhausted.
    StackOverflow,
    /// A host function returned an error.
    HostFunctionFailed,
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trap::UnreachableCodeReached => f.write_str("unreachable"),
            Trap::IntegerDivisionByZero => f.write_str("integer divide by zero"),
            Trap::IntegerOverflow => f.write_str("integer overflow"),
            Trap::BadConversionToInteger => f.write_str("invalid conversion to integer"),
            Trap::MemoryOutOfBounds => f.write_str("out of bounds memory access"),
            Trap::TableOutOfBounds => f.write_str("out of bounds table access"),
            Trap::UndefinedElement => f.write_str("undefined element"),
            Trap::IndirectCallTypeMismatch => f.write_str("indirect call type mismatch"),
            Trap::StackOverflow => f.write_str("call stack exhausted"),
            Trap::HostFunctionFailed => f.write_str("host function failed"),
        }
    }
}

impl core::error::Error for Trap {}

/// One active WebAssembly call frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub func_index: FuncIndex,
    /// Index of the instruction that was executing in this frame.
    pub instruction_offset: usize,
}

/// The call frames that were live when a trap was raised, innermost first.
///
/// Machines that don't track frames produce an empty backtrace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WasmBacktrace(Vec<FrameInfo>);

impl WasmBacktrace {
    pub fn new(frames: Vec<FrameInfo>) -> Self {
        Self(frames)
    }

    pub fn frames(&self) -> &[FrameInfo] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for WasmBacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.0.iter().enumerate() {
            writeln!(
                f,
                "  {i}: func[{}] @ {:#x}",
                frame.func_index.as_u32(),
                frame.instruction_offset
            )?;
        }
        Ok(())
    }
}
