// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod stored;

use alloc::vec::Vec;

use static_assertions::assert_impl_all;

pub use stored::Stored;
use stored::StoredData;

use crate::Engine;
use crate::indices::FuncIndex;
use crate::instance::Instance;
use crate::trap::FrameInfo;

/// Owns every runtime object (instances, functions, globals, tables and
/// memories) created for one engine.
///
/// Objects are addressed through copyable handles and live as long as the store.
#[derive(Debug)]
pub struct Store {
    /// The engine this store belongs to.
    engine: Engine,
    /// Indexed data within this `Store`, used to store information about
    /// globals, functions, memories, etc.
    stored: StoredData,
    /// The WebAssembly frames that are currently executing, outermost first.
    pub(crate) frames: Vec<ActiveFrame>,
    /// Number of nested WebAssembly calls across all machines.
    pub(crate) depth: u32,
}
assert_impl_all!(Store: Send, Sync);

/// A live WebAssembly call frame, maintained by the interpreter.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActiveFrame {
    pub instance: Instance,
    pub func: FuncIndex,
    pub instruction_offset: usize,
}

impl Store {
    pub fn new(engine: &Engine) -> Self {
        Self {
            engine: engine.clone(),
            stored: StoredData::default(),
            frames: Vec::new(),
            depth: 0,
        }
    }

    #[inline]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The currently active frames of `instance`, innermost first.
    pub(crate) fn frames_of(&self, instance: Instance) -> Vec<FrameInfo> {
        self.frames
            .iter()
            .rev()
            .filter(|frame| frame.instance == instance)
            .map(|frame| FrameInfo {
                func_index: frame.func,
                instruction_offset: frame.instruction_offset,
            })
            .collect()
    }

    /// Snapshot of all active frames, innermost first.
    pub(crate) fn backtrace(&self) -> Vec<FrameInfo> {
        self.frames
            .iter()
            .rev()
            .map(|frame| FrameInfo {
                func_index: frame.func,
                instruction_offset: frame.instruction_offset,
            })
            .collect()
    }
}
