// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use core::fmt;

use crate::machine::ExecutionListener;

/// The default limit on the number of nested WebAssembly calls.
pub const DEFAULT_MAX_CALL_DEPTH: u32 = 256;

/// The strategy used to execute function bodies.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Walk the translated instructions directly.
    #[default]
    Interpreter,
    /// Compile every function once at instantiation time and run the compiled units.
    Aot,
}

bitflags::bitflags! {
    /// Steps of instance initialization that can be switched off.
    #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct InstantiateFlags: u8 {
        /// Run the type validator over every locally defined function.
        const VALIDATE = 1 << 0;
        /// Invoke the module's start function as the last initialization step.
        const RUN_START = 1 << 1;
    }
}

impl Default for InstantiateFlags {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Display for InstantiateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        bitflags::parser::to_writer(self, f)
    }
}

/// Global configuration options used to create an [`Engine`](crate::Engine).
#[derive(Clone)]
pub struct Config {
    backend: Backend,
    flags: InstantiateFlags,
    max_call_depth: u32,
    listener: Option<Arc<dyn ExecutionListener>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            flags: InstantiateFlags::default(),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            listener: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("backend", &self.backend)
            .field("flags", &self.flags)
            .field("max_call_depth", &self.max_call_depth)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(&mut self, backend: Backend) -> &mut Self {
        self.backend = backend;
        self
    }

    pub fn flags(&mut self, flags: InstantiateFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Enables or disables the type validator during instantiation.
    ///
    /// Disabling it is only sound for trusted input.
    pub fn validate(&mut self, enable: bool) -> &mut Self {
        self.flags.set(InstantiateFlags::VALIDATE, enable);
        self
    }

    /// Enables or disables running the start function during instantiation.
    pub fn run_start(&mut self, enable: bool) -> &mut Self {
        self.flags.set(InstantiateFlags::RUN_START, enable);
        self
    }

    /// The number of nested WebAssembly calls after which execution traps
    /// with [`Trap::StackOverflow`](crate::Trap::StackOverflow).
    pub fn max_call_depth(&mut self, depth: u32) -> &mut Self {
        self.max_call_depth = depth;
        self
    }

    /// Installs a listener that the interpreter notifies before every instruction.
    pub fn listener(&mut self, listener: Arc<dyn ExecutionListener>) -> &mut Self {
        self.listener = Some(listener);
        self
    }

    pub fn get_backend(&self) -> Backend {
        self.backend
    }

    pub fn get_flags(&self) -> InstantiateFlags {
        self.flags
    }

    pub fn get_max_call_depth(&self) -> u32 {
        self.max_call_depth
    }

    pub fn get_listener(&self) -> Option<&Arc<dyn ExecutionListener>> {
        self.listener.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.get_backend(), Backend::Interpreter);
        assert!(config.get_flags().contains(InstantiateFlags::VALIDATE));
        assert!(config.get_flags().contains(InstantiateFlags::RUN_START));
        assert_eq!(config.get_max_call_depth(), DEFAULT_MAX_CALL_DEPTH);
        assert!(config.get_listener().is_none());
    }

    #[test]
    fn builder_toggles_flags() {
        let mut config = Config::new();
        config.backend(Backend::Aot).validate(false).max_call_depth(8);
        assert_eq!(config.get_backend(), Backend::Aot);
        assert_eq!(config.get_flags(), InstantiateFlags::RUN_START);
        assert_eq!(config.get_max_call_depth(), 8);
        assert_eq!(config.get_flags().to_string(), "RUN_START");
    }
}
