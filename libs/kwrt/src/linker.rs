// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::{HashMap, HashSet};
use hashbrown::hash_map::Entry;

use crate::errors::Error;
use crate::func::{Caller, Func, HostFunc};
use crate::types::FuncType;
use crate::values::Val;
use crate::{Engine, Extern, Instance, Module, Store};

/// Resolves module imports by `(module, name)` and instantiates modules.
///
/// Host functions defined through [`Linker::func_new`] are not bound to a store;
/// they are materialized into the store each time they are handed out.
#[derive(Debug)]
pub struct Linker {
    engine: Engine,
    string2idx: HashMap<Arc<str>, usize>,
    strings: Vec<Arc<str>>,
    map: HashMap<ImportKey, Definition>,
}

#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
struct ImportKey {
    name: usize,
    module: usize,
}

#[derive(Clone)]
enum Definition {
    Extern(Extern),
    HostFunc(Arc<HostFunc>, FuncType),
}

impl core::fmt::Debug for Definition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Extern(ext) => f.debug_tuple("Extern").field(ext).finish(),
            Self::HostFunc(_, ty) => f.debug_tuple("HostFunc").field(ty).finish(),
        }
    }
}

impl Linker {
    /// Create a new `Linker`.
    ///
    /// This linker is scoped to the provided engine and cannot be used to link modules from other engines.
    pub fn new(engine: &Engine) -> Self {
        Self {
            engine: engine.clone(),
            string2idx: HashMap::new(),
            strings: Vec::new(),
            map: HashMap::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Define `def` under `module::name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Invalid` if the name is already defined.
    pub fn define(
        &mut self,
        module: &str,
        name: &str,
        def: impl Into<Extern>,
    ) -> crate::Result<&mut Self> {
        let key = self.import_key(module, name);
        self.insert(key, Definition::Extern(def.into()))?;
        Ok(self)
    }

    /// Define a host function of type `ty` under `module::name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Invalid` if the name is already defined.
    pub fn func_new<F>(
        &mut self,
        module: &str,
        name: &str,
        ty: FuncType,
        func: F,
    ) -> crate::Result<&mut Self>
    where
        F: Fn(Caller<'_>, &[Val]) -> anyhow::Result<Vec<Val>> + Send + Sync + 'static,
    {
        let key = self.import_key(module, name);
        self.insert(key, Definition::HostFunc(Arc::new(func), ty))?;
        Ok(self)
    }

    /// Attempt to retrieve a definition from this linker.
    pub fn get(&self, store: &mut Store, module: &str, name: &str) -> Option<Extern> {
        Some(self.get_definition(module, name)?.to_extern(store))
    }

    fn get_definition(&self, module: &str, name: &str) -> Option<&Definition> {
        let key = ImportKey {
            module: *self.string2idx.get(module)?,
            name: *self.string2idx.get(name)?,
        };
        self.map.get(&key)
    }

    /// Alias all definitions of `module` under the name `as_module`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Invalid` if one of the aliased names is already defined.
    pub fn alias_module(&mut self, module: &str, as_module: &str) -> crate::Result<&mut Self> {
        let module = self.intern_str(module);
        let as_module = self.intern_str(as_module);
        let items = self
            .map
            .iter()
            .filter(|(key, _def)| key.module == module)
            .map(|(key, def)| (key.name, def.clone()))
            .collect::<Vec<_>>();
        self.insert_all(items.into_iter().map(|(name, item)| {
            (
                ImportKey {
                    module: as_module,
                    name,
                },
                item,
            )
        }))?;
        Ok(self)
    }

    /// Define all exports of the provided `instance` under the module name `module_name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Invalid` if one of the export names is already defined.
    pub fn define_instance(
        &mut self,
        store: &Store,
        module_name: &str,
        instance: Instance,
    ) -> crate::Result<&mut Self> {
        let exports = instance
            .exports(store)
            .map(|e| {
                (
                    self.import_key(module_name, e.name),
                    Definition::Extern(e.definition),
                )
            })
            .collect::<Vec<_>>();

        self.insert_all(exports)?;
        Ok(self)
    }

    /// Instantiate the provided `module`.
    ///
    /// Each import of the module is looked up in this linker and must have been
    /// defined before; type checking happens in [`Instance::new`].
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingImport` for imports without a definition, and every
    /// error [`Instance::new`] can return.
    pub fn instantiate(&self, store: &mut Store, module: &Module) -> crate::Result<Instance> {
        let mut imports = Vec::with_capacity(module.imports().len());

        for import in module.imports() {
            let def = self
                .get_definition(&import.module, &import.name)
                .ok_or_else(|| Error::MissingImport {
                    module: import.module.clone(),
                    field: import.name.clone(),
                    kind: import.ty.kind(),
                })?;
            imports.push(def.to_extern(store));
        }

        Instance::new(store, module, &imports)
    }

    fn insert(&mut self, key: ImportKey, item: Definition) -> crate::Result<()> {
        match self.map.entry(key) {
            Entry::Occupied(_) => {
                return Err(self.already_defined(key));
            }
            Entry::Vacant(v) => {
                v.insert(item);
            }
        }

        Ok(())
    }

    /// Insert a batch of definitions; either all of them are inserted or none is.
    fn insert_all(
        &mut self,
        items: impl IntoIterator<Item = (ImportKey, Definition)>,
    ) -> crate::Result<()> {
        let items = items.into_iter().collect::<Vec<_>>();

        let mut seen = HashSet::with_capacity(items.len());
        for (key, _) in &items {
            if self.map.contains_key(key) || !seen.insert(*key) {
                return Err(self.already_defined(*key));
            }
        }

        self.map.extend(items);
        Ok(())
    }

    fn already_defined(&self, key: ImportKey) -> Error {
        Error::Invalid(format!(
            "Name {}::{} is already defined",
            self.strings[key.module], self.strings[key.name]
        ))
    }

    fn import_key(&mut self, module: &str, name: &str) -> ImportKey {
        ImportKey {
            module: self.intern_str(module),
            name: self.intern_str(name),
        }
    }

    fn intern_str(&mut self, string: &str) -> usize {
        if let Some(idx) = self.string2idx.get(string) {
            return *idx;
        }
        let string: Arc<str> = string.into();
        let idx = self.strings.len();
        self.strings.push(string.clone());
        self.string2idx.insert(string, idx);
        idx
    }
}

impl Definition {
    fn to_extern(&self, store: &mut Store) -> Extern {
        match self {
            Definition::Extern(ext) => *ext,
            Definition::HostFunc(func, ty) => {
                Extern::Func(Func::from_host(store, ty.clone(), func.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GlobalType, Mutability, ValType};
    use crate::Global;

    #[test]
    fn duplicate_definitions_are_rejected() {
        let engine = Engine::default();
        let mut store = Store::new(&engine);
        let mut linker = Linker::new(&engine);
        let global = Global::new(
            &mut store,
            GlobalType::new(ValType::I32, Mutability::Const),
            Val::I32(1),
        )
        .unwrap();

        linker.define("env", "g", global).unwrap();
        let err = linker.define("env", "g", global).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn aliases_share_definitions() {
        let engine = Engine::default();
        let mut store = Store::new(&engine);
        let mut linker = Linker::new(&engine);
        linker
            .func_new("env", "f", FuncType::new([], []), |_, _| Ok(Vec::new()))
            .unwrap();
        linker.alias_module("env", "other").unwrap();

        let ext = linker.get(&mut store, "other", "f").unwrap();
        assert!(ext.is_func());
        assert!(linker.get(&mut store, "missing", "f").is_none());
    }

    #[test]
    fn failed_alias_defines_nothing() {
        let engine = Engine::default();
        let mut store = Store::new(&engine);
        let mut linker = Linker::new(&engine);
        let ty = || FuncType::new([], []);
        linker.func_new("env", "a", ty(), |_, _| Ok(Vec::new())).unwrap();
        linker.func_new("env", "b", ty(), |_, _| Ok(Vec::new())).unwrap();
        linker.func_new("other", "b", ty(), |_, _| Ok(Vec::new())).unwrap();

        let err = linker.alias_module("env", "other").unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        assert!(linker.get(&mut store, "other", "a").is_none());
    }

    #[test]
    fn failed_define_instance_defines_nothing() {
        let engine = Engine::default();
        let mut store = Store::new(&engine);
        let mut linker = Linker::new(&engine);
        let wat = r#"
            (module
              (func (export "first"))
              (global (export "taken") i32 (i32.const 0))
              (func (export "last")))
        "#;
        let module = Module::from_bytes(&engine, &wat::parse_str(wat).unwrap()).unwrap();
        let instance = Instance::new(&mut store, &module, &[]).unwrap();

        let global = Global::new(
            &mut store,
            GlobalType::new(ValType::I32, Mutability::Const),
            Val::I32(1),
        )
        .unwrap();
        linker.define("inst", "taken", global).unwrap();

        let err = linker.define_instance(&store, "inst", instance).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        assert!(linker.get(&mut store, "inst", "first").is_none());
        assert!(linker.get(&mut store, "inst", "last").is_none());
        assert!(linker.get(&mut store, "inst", "taken").unwrap().is_global());
    }
}
