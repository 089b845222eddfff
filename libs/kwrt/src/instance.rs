// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

use cranelift_entity::{EntitySet, PrimaryMap};

use crate::const_eval::{ConstEvalContext, ConstExprEvaluator};
use crate::errors::Error;
use crate::func::Func;
use crate::global::Global;
use crate::indices::{DataIndex, ElemIndex, EntityIndex, FuncIndex, GlobalIndex, TableIndex, TypeIndex};
use crate::machine::{self, Machine};
use crate::memory::Memory;
use crate::module::Module;
use crate::store::{Store, Stored};
use crate::table::Table;
use crate::translate::{DataKind, ElementKind, FunctionBody, Import};
use crate::trap::FrameInfo;
use crate::types::{EntityKind, EntityType, FuncType, ValType};
use crate::values::{Ref, Val};
use crate::{Extern, InstantiateFlags};

/// A live binding of a [`Module`] to its imports and runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Instance(pub(crate) Stored<InstanceData>);

pub(crate) struct InstanceData {
    pub module: Module,
    /// Handles for the whole function index space, imports first.
    pub funcs: Vec<Func>,
    /// Handles for the whole table index space, imports first.
    pub tables: Vec<Table>,
    pub memory: Option<Memory>,
    /// Handles for the whole global index space, imports first.
    pub globals: Vec<Global>,
    /// Evaluated element segments. Active and declared segments are empty
    /// after instantiation, as are dropped passive segments.
    pub elements: PrimaryMap<ElemIndex, Box<[u64]>>,
    /// Data segments that have been dropped (including every active segment).
    pub dropped_data: EntitySet<DataIndex>,
    pub machine: Option<Arc<dyn Machine>>,
}

impl core::fmt::Debug for InstanceData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InstanceData")
            .field("module", &self.module.name())
            .field("funcs", &self.funcs.len())
            .field("tables", &self.tables.len())
            .field("memory", &self.memory)
            .field("globals", &self.globals.len())
            .finish_non_exhaustive()
    }
}

/// A named export of an instance.
#[derive(Clone, Debug)]
pub struct Export<'instance> {
    /// The name of the export.
    pub name: &'instance str,
    /// The definition of the export.
    pub definition: Extern,
}

// ===== impl Instance =====

impl Instance {
    /// Instantiates `module` with `imports` given in the order of the module's
    /// import section.
    ///
    /// Initialization runs these steps, failing fast on the first error:
    /// allocate tables and memory, evaluate active element segments, initialize
    /// globals, apply active data segments, validate function bodies (if
    /// enabled), build the execution machine and run the start function (if
    /// enabled).
    ///
    /// Function bodies are validated and compiled before any segment is
    /// written, and element segments are bounds checked before the first one is
    /// applied. A failing data segment or start function can therefore leave
    /// behind writes to imported tables and memories, but every function
    /// reference written that way belongs to a fully built instance.
    ///
    /// # Errors
    ///
    /// Returns link errors for missing or mistyped imports, validation errors
    /// for invalid constant expressions, segments or function bodies, traps for
    /// out of bounds segments or a trapping start function, and compile errors
    /// from the ahead-of-time backend.
    #[tracing::instrument(level = "debug", skip_all, fields(module = module.name()))]
    pub fn new(store: &mut Store, module: &Module, imports: &[Extern]) -> crate::Result<Instance> {
        if !crate::Engine::same(store.engine(), module.engine()) {
            return Err(Error::Invalid(
                "cross-engine instantiation is not supported".into(),
            ));
        }

        let translated = module.translated();
        if imports.len() != translated.imports.len() {
            return Err(Error::Invalid(format!(
                "expected {} imports, found {}",
                translated.imports.len(),
                imports.len()
            )));
        }
        for (import, ext) in translated.imports.iter().zip(imports) {
            check_import(store, import, ext)?;
        }
        tracing::debug!(imports = imports.len(), "resolved imports");

        let config = store.engine().config().clone();
        if config.get_flags().contains(InstantiateFlags::VALIDATE) {
            for (defined, body) in translated.function_bodies.iter() {
                let index = translated.func_index(defined);
                crate::validate::validate_function(translated, index, body)?;
            }
            tracing::debug!("validated function bodies");
        }
        let machine = machine::build(&config, translated)?;
        tracing::debug!(backend = ?config.get_backend(), "built machine");

        let instance = Instance(store.add_instance(InstanceData {
            module: module.clone(),
            funcs: Vec::with_capacity(translated.num_functions() as usize),
            tables: Vec::with_capacity(translated.num_tables() as usize),
            memory: None,
            globals: Vec::with_capacity(translated.num_globals() as usize),
            elements: PrimaryMap::with_capacity(translated.elements.len()),
            dropped_data: EntitySet::with_capacity(translated.data.len()),
            machine: Some(machine),
        }));

        let mut funcs = Vec::with_capacity(translated.num_functions() as usize);
        let mut tables = Vec::with_capacity(translated.num_tables() as usize);
        let mut globals = Vec::with_capacity(translated.num_globals() as usize);
        let mut memory = None;

        for ext in imports {
            match *ext {
                Extern::Func(f) => funcs.push(f),
                Extern::Table(t) => tables.push(t),
                Extern::Memory(m) => memory = Some(m),
                Extern::Global(g) => globals.push(g),
            }
        }
        for (defined, _) in translated.function_bodies.iter() {
            let index = translated.func_index(defined);
            let ty = translated.func_type(index)?.clone();
            funcs.push(Func::from_wasm(store, instance, index, ty));
        }

        // 1. tables and memory
        for (_, ty) in translated.tables.iter().skip(translated.num_imported_tables as usize) {
            tables.push(Table::new_raw(store, *ty, 0, Some(instance)));
        }
        if let Some((_, ty)) = translated
            .memories
            .iter()
            .nth(translated.num_imported_memories as usize)
        {
            memory = Some(Memory::new_owned(store, *ty, instance)?);
        }

        let mut const_eval = ConstExprEvaluator::default();

        // 2. element segments, checked here and written once the instance is complete
        let mut elements = PrimaryMap::with_capacity(translated.elements.len());
        let mut pending = Vec::new();
        for (index, segment) in translated.elements.iter() {
            let ctx = ConstEvalContext {
                store,
                module: translated,
                globals: &globals,
                funcs: &funcs,
            };
            let items = segment
                .items
                .iter()
                .map(|item| const_eval.eval(&ctx, item, segment.ty.into()))
                .collect::<crate::Result<Vec<_>>>()?;

            match &segment.kind {
                ElementKind::Active { table, offset } => {
                    let offset = const_eval.eval(&ctx, offset, ValType::I32)? as u32;
                    let handle = *tables
                        .get(table.as_u32() as usize)
                        .ok_or_else(|| Error::unknown(EntityKind::Table, table.as_u32()))?;
                    let data = &store[handle.0];
                    ValType::from(segment.ty).ensure_matches(data.ty().element().into())?;
                    data.range(offset, items.len() as u32)?;
                    pending.push((index, handle, offset, items));
                    elements.push(Box::default());
                }
                ElementKind::Passive => {
                    elements.push(items.into_boxed_slice());
                }
                ElementKind::Declared => {
                    elements.push(Box::default());
                }
            }
        }

        // 3. globals
        for (defined, init) in translated.global_initializers.iter() {
            let index = translated.global_index(defined);
            let ty = translated.globals[index];
            let ctx = ConstEvalContext {
                store,
                module: translated,
                globals: &globals,
                funcs: &funcs,
            };
            let value = const_eval.eval(&ctx, init, ty.content())?;
            globals.push(Global::new_raw(store, ty, value, Some(instance)));
        }

        {
            let data = &mut store[instance.0];
            data.funcs = funcs;
            data.tables = tables;
            data.memory = memory;
            data.globals = globals;
            data.elements = elements;
        }

        for (index, table, offset, items) in pending {
            store[table.0].write_slice(offset, &items)?;
            tracing::trace!(?index, offset, len = items.len(), "applied element segment");
        }

        // 4. data segments
        for (index, segment) in translated.data.iter() {
            let DataKind::Active { memory: memory_index, offset } = &segment.kind else {
                continue;
            };
            let Some(memory) = memory.filter(|_| memory_index.as_u32() == 0) else {
                return Err(Error::unknown(EntityKind::Memory, memory_index.as_u32()));
            };
            let offset = {
                let data = &store[instance.0];
                let ctx = ConstEvalContext {
                    store,
                    module: translated,
                    globals: &data.globals,
                    funcs: &data.funcs,
                };
                const_eval.eval(&ctx, offset, ValType::I32)? as u32
            };
            store[memory.0].write(u64::from(offset), &segment.data)?;
            store[instance.0].drop_data(index);
            tracing::trace!(?index, offset, len = segment.data.len(), "applied data segment");
        }
        tracing::debug!("applied segments");

        // 5. start function
        if let Some(start) = translated.start {
            if config.get_flags().contains(InstantiateFlags::RUN_START) {
                let func = instance.func(store, start)?;
                func.call_unchecked(store, Some(instance), &[])?;
                tracing::debug!(?start, "ran start function");
            }
        }

        Ok(instance)
    }

    /// Returns the module this instance was instantiated from.
    pub fn module(self, store: &Store) -> &Module {
        &store[self.0].module
    }

    pub(crate) fn data(self, store: &Store) -> &InstanceData {
        &store[self.0]
    }

    pub(crate) fn machine(self, store: &Store) -> crate::Result<Arc<dyn Machine>> {
        store[self.0]
            .machine
            .clone()
            .ok_or_else(|| Error::Invalid("instance is not fully initialized".into()))
    }

    /// Returns an iterator over the exports of this instance.
    pub fn exports(self, store: &Store) -> impl Iterator<Item = Export<'_>> {
        let data = &store[self.0];
        data.module
            .translated()
            .exports
            .iter()
            .filter_map(move |(name, index)| {
                Some(Export {
                    name: name.as_str(),
                    definition: data.extern_for(*index)?,
                })
            })
    }

    /// Attempts to get an export from this instance.
    pub fn get_export(self, store: &Store, name: &str) -> Option<Extern> {
        let data = &store[self.0];
        let index = *data.module.translated().exports.get(name)?;
        data.extern_for(index)
    }

    /// Like [`Instance::get_export`] but fails with "unknown export".
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownExport` if no export has this name.
    pub fn export(self, store: &Store, name: &str) -> crate::Result<Extern> {
        self.get_export(store, name)
            .ok_or_else(|| Error::UnknownExport(name.into()))
    }

    /// Attempts to get an exported `Func` from this instance.
    pub fn get_func(self, store: &Store, name: &str) -> Option<Func> {
        self.get_export(store, name)?.into_func()
    }

    /// Attempts to get an exported `Table` from this instance.
    pub fn get_table(self, store: &Store, name: &str) -> Option<Table> {
        self.get_export(store, name)?.into_table()
    }

    /// Attempts to get an exported `Memory` from this instance.
    pub fn get_memory(self, store: &Store, name: &str) -> Option<Memory> {
        self.get_export(store, name)?.into_memory()
    }

    /// Attempts to get an exported `Global` from this instance.
    pub fn get_global(self, store: &Store, name: &str) -> Option<Global> {
        self.get_export(store, name)?.into_global()
    }

    /// The function at `index` of this instance's function index space.
    ///
    /// # Errors
    ///
    /// Fails with "unknown function" for out of bounds indices.
    pub fn func(self, store: &Store, index: FuncIndex) -> crate::Result<Func> {
        store[self.0]
            .funcs
            .get(index.as_u32() as usize)
            .copied()
            .ok_or_else(|| Error::unknown(EntityKind::Function, index.as_u32()))
    }

    /// The global at `index` of this instance's global index space.
    ///
    /// # Errors
    ///
    /// Fails with "unknown global" for out of bounds indices.
    pub fn global(self, store: &Store, index: GlobalIndex) -> crate::Result<Global> {
        store[self.0]
            .globals
            .get(index.as_u32() as usize)
            .copied()
            .ok_or_else(|| Error::unknown(EntityKind::Global, index.as_u32()))
    }

    /// Reads the global at `index`.
    ///
    /// # Errors
    ///
    /// Fails with "unknown global" for out of bounds indices.
    pub fn read_global(self, store: &Store, index: GlobalIndex) -> crate::Result<Val> {
        Ok(self.global(store, index)?.get(store))
    }

    /// Writes the global at `index`.
    ///
    /// # Errors
    ///
    /// Fails with "unknown global" for out of bounds indices, and if the global
    /// is immutable or `val` has the wrong type.
    pub fn write_global(self, store: &mut Store, index: GlobalIndex, val: Val) -> crate::Result<()> {
        self.global(store, index)?.set(store, val)
    }

    /// The table at `index` of this instance's table index space.
    ///
    /// # Errors
    ///
    /// Fails with "unknown table" for out of bounds indices.
    pub fn table(self, store: &Store, index: TableIndex) -> crate::Result<Table> {
        store[self.0]
            .tables
            .get(index.as_u32() as usize)
            .copied()
            .ok_or_else(|| Error::unknown(EntityKind::Table, index.as_u32()))
    }

    /// The memory of this instance, owned or imported.
    ///
    /// # Errors
    ///
    /// Fails with "unknown memory 0" if the instance has no memory.
    pub fn memory(self, store: &Store) -> crate::Result<Memory> {
        store[self.0]
            .memory
            .ok_or_else(|| Error::unknown(EntityKind::Memory, 0))
    }

    /// The current contents of the element segment at `index`. Active, declared
    /// and dropped segments are empty.
    ///
    /// # Errors
    ///
    /// Fails with "unknown elem segment" for out of bounds indices.
    pub fn element(self, store: &Store, index: ElemIndex) -> crate::Result<Vec<Ref>> {
        let data = &store[self.0];
        let items = data
            .elements
            .get(index)
            .ok_or_else(|| Error::unknown(EntityKind::Element, index.as_u32()))?;
        let ty = data.module.translated().elements[index].ty;
        Ok(items.iter().map(|raw| Ref::from_raw(*raw, ty)).collect())
    }

    /// The function type at `index` of the module's type section.
    ///
    /// # Errors
    ///
    /// Fails with "unknown type" for out of bounds indices.
    pub fn func_type(self, store: &Store, index: TypeIndex) -> crate::Result<&FuncType> {
        store[self.0]
            .module
            .translated()
            .types
            .get(index)
            .ok_or_else(|| Error::unknown(EntityKind::Type, index.as_u32()))
    }

    /// The type of the function at `index`.
    ///
    /// # Errors
    ///
    /// Fails with "unknown function" for out of bounds indices.
    pub fn type_of_func(self, store: &Store, index: FuncIndex) -> crate::Result<&FuncType> {
        store[self.0].module.translated().func_type(index)
    }

    /// The body of the locally defined function at `index`.
    ///
    /// # Errors
    ///
    /// Fails with "unknown function" for imported or out of bounds indices.
    pub fn function_body(self, store: &Store, index: FuncIndex) -> crate::Result<&FunctionBody> {
        let translated = store[self.0].module.translated();
        translated
            .defined_func_index(index)
            .and_then(|defined| translated.function_bodies.get(defined))
            .ok_or_else(|| Error::unknown(EntityKind::Function, index.as_u32()))
    }

    /// The active frames of this instance, innermost first. Empty for machines
    /// that don't track frames.
    pub fn stack_trace(self, store: &Store) -> Vec<FrameInfo> {
        match &store[self.0].machine {
            Some(machine) => machine.stack_trace(store, self),
            None => Vec::new(),
        }
    }
}

impl InstanceData {
    fn extern_for(&self, index: EntityIndex) -> Option<Extern> {
        Some(match index {
            EntityIndex::Function(i) => Extern::Func(*self.funcs.get(i.as_u32() as usize)?),
            EntityIndex::Table(i) => Extern::Table(*self.tables.get(i.as_u32() as usize)?),
            EntityIndex::Memory(_) => Extern::Memory(self.memory?),
            EntityIndex::Global(i) => Extern::Global(*self.globals.get(i.as_u32() as usize)?),
        })
    }

    /// Marks a data segment as dropped.
    pub(crate) fn drop_data(&mut self, index: DataIndex) {
        self.dropped_data.insert(index);
    }
}

/// Checks that `ext` can satisfy `import`.
pub(crate) fn check_import(store: &Store, import: &Import, ext: &Extern) -> crate::Result<()> {
    let incompatible = |message: alloc::string::String| Error::IncompatibleImport {
        module: import.module.clone(),
        field: import.name.clone(),
        message,
    };

    match (&import.ty, ext) {
        (EntityType::Function(expected), Extern::Func(f)) => {
            let actual = f.ty_ref(store);
            if actual != expected {
                return Err(incompatible(format!(
                    "expected function of type {expected}, found {actual}"
                )));
            }
        }
        (EntityType::Global(expected), Extern::Global(g)) => {
            let actual = g.ty(store);
            if actual != *expected {
                return Err(incompatible(format!(
                    "expected global of type {expected:?}, found {actual:?}"
                )));
            }
        }
        (EntityType::Table(expected), Extern::Table(t)) => {
            let actual = t.ty(store);
            if actual.element() != expected.element() || !actual.limits.is_subtype_of(&expected.limits) {
                return Err(incompatible(format!(
                    "expected table of type {expected:?}, found {actual:?}"
                )));
            }
        }
        (EntityType::Memory(expected), Extern::Memory(m)) => {
            let actual = m.ty(store);
            if !actual.limits.is_subtype_of(&expected.limits) {
                return Err(incompatible(format!(
                    "expected memory of type {expected:?}, found {actual:?}"
                )));
            }
        }
        (expected, actual) => {
            return Err(incompatible(format!(
                "expected {}, found {}",
                expected.kind(),
                actual.kind()
            )));
        }
    }
    Ok(())
}
