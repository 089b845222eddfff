// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;

use crate::Engine;
use crate::indices::EntityIndex;
use crate::translate::{Import, ModuleTranslator, TranslatedModule};

/// A decoded WebAssembly module, ready to be instantiated any number of times.
#[derive(Debug, Clone)]
pub struct Module(Arc<ModuleInner>);

#[derive(Debug)]
struct ModuleInner {
    engine: Engine,
    translated: TranslatedModule,
}

// ===== impl Module =====

impl Module {
    /// Decodes a binary WebAssembly module.
    ///
    /// Decoding checks the structure of the binary only. Type validation happens
    /// at instantiation time, see [`InstantiateFlags::VALIDATE`](crate::InstantiateFlags::VALIDATE).
    ///
    /// # Errors
    ///
    /// Returns `Error::Malformed` for structurally invalid binaries and
    /// `Error::Unsupported` for modules using unsupported proposals.
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> crate::Result<Self> {
        let translated = ModuleTranslator::new().translate(bytes)?;

        Ok(Self(Arc::new(ModuleInner {
            engine: engine.clone(),
            translated,
        })))
    }

    /// Returns the modules name if present.
    pub fn name(&self) -> Option<&str> {
        self.0.translated.name.as_deref()
    }

    /// Returns the modules imports.
    pub fn imports(&self) -> impl ExactSizeIterator<Item = &Import> {
        self.0.translated.imports.iter()
    }

    /// Returns the modules exports.
    pub fn exports(&self) -> impl ExactSizeIterator<Item = (&str, EntityIndex)> + '_ {
        self.0
            .translated
            .exports
            .iter()
            .map(|(name, index)| (name.as_str(), *index))
    }

    /// The [`Engine`] that this [`Module`] has been created for.
    pub fn engine(&self) -> &Engine {
        &self.0.engine
    }

    pub(crate) fn translated(&self) -> &TranslatedModule {
        &self.0.translated
    }

    pub fn same(lhs: &Module, rhs: &Module) -> bool {
        Arc::ptr_eq(&lhs.0, &rhs.0)
    }
}
