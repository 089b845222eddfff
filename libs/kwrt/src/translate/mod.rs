// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod const_expr;
mod func_translator;
mod instruction;
mod module_translator;
mod type_convert;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use cranelift_entity::PrimaryMap;
use hashbrown::HashMap;

pub use const_expr::{ConstExpr, ConstOp};
pub use instruction::{BlockType, Instruction, LoadKind, MemArg, NumericOp, StoreKind};
pub use module_translator::ModuleTranslator;

use crate::errors::Error;
use crate::indices::{
    DataIndex, DefinedFuncIndex, DefinedGlobalIndex, DefinedTableIndex, ElemIndex, EntityIndex,
    FuncIndex, GlobalIndex, MemoryIndex, TableIndex, TypeIndex,
};
use crate::types::{EntityKind, EntityType, FuncType, GlobalType, MemoryType, RefType, TableType, ValType};

/// A translated WebAssembly module.
///
/// This is immutable once translation finishes and shared by every instance
/// created from it.
#[derive(Debug, Default)]
pub struct TranslatedModule {
    /// The name of this wasm module, if found in the name section.
    pub name: Option<String>,
    /// The function types declared in this module.
    pub types: PrimaryMap<TypeIndex, FuncType>,

    /// The functions of this module, imports first. Note that this only
    /// contains the function's signature, for the body see `function_bodies`.
    pub functions: PrimaryMap<FuncIndex, FunctionDesc>,
    /// The tables of this module, imports first.
    pub tables: PrimaryMap<TableIndex, TableType>,
    /// The memories of this module, imports first.
    pub memories: PrimaryMap<MemoryIndex, MemoryType>,
    /// The globals of this module, imports first.
    pub globals: PrimaryMap<GlobalIndex, GlobalType>,

    /// Initialization expressions for globals defined in this module.
    pub global_initializers: PrimaryMap<DefinedGlobalIndex, ConstExpr>,
    /// All element segments in declaration order.
    pub elements: PrimaryMap<ElemIndex, ElementSegment>,
    /// All data segments in declaration order.
    pub data: PrimaryMap<DataIndex, DataSegment>,
    /// The number of data segments announced by the data count section, if present.
    pub data_count: Option<u32>,

    /// The index of the start function if defined.
    pub start: Option<FuncIndex>,
    /// Imports declared in this module.
    pub imports: Vec<Import>,
    /// Exports declared in this module.
    pub exports: HashMap<String, EntityIndex>,

    /// The bodies of locally defined functions.
    pub function_bodies: PrimaryMap<DefinedFuncIndex, FunctionBody>,

    /// The number of imported functions. The first `num_imported_functions` functions in the `functions`
    /// table are imported functions.
    pub num_imported_functions: u32,
    /// The number of imported tables. The first `num_imported_tables` tables in the `tables` table are imported tables.
    pub num_imported_tables: u32,
    /// The number of imported memories. The first `num_imported_memories` memories in the `memories` table are imported memories.
    pub num_imported_memories: u32,
    /// The number of imported globals. The first `num_imported_globals` globals in the `globals` table are imported globals.
    pub num_imported_globals: u32,
}

impl TranslatedModule {
    #[inline]
    pub fn func_index(&self, index: DefinedFuncIndex) -> FuncIndex {
        FuncIndex::from_u32(self.num_imported_functions + index.as_u32())
    }

    #[inline]
    pub fn defined_func_index(&self, index: FuncIndex) -> Option<DefinedFuncIndex> {
        if self.is_imported_func(index) {
            None
        } else {
            Some(DefinedFuncIndex::from_u32(
                index.as_u32() - self.num_imported_functions,
            ))
        }
    }

    #[inline]
    pub fn is_imported_func(&self, index: FuncIndex) -> bool {
        index.as_u32() < self.num_imported_functions
    }

    #[inline]
    pub fn table_index(&self, index: DefinedTableIndex) -> TableIndex {
        TableIndex::from_u32(self.num_imported_tables + index.as_u32())
    }

    #[inline]
    pub fn defined_table_index(&self, index: TableIndex) -> Option<DefinedTableIndex> {
        if self.is_imported_table(index) {
            None
        } else {
            Some(DefinedTableIndex::from_u32(
                index.as_u32() - self.num_imported_tables,
            ))
        }
    }

    #[inline]
    pub fn is_imported_table(&self, index: TableIndex) -> bool {
        index.as_u32() < self.num_imported_tables
    }

    #[inline]
    pub fn is_imported_memory(&self, index: MemoryIndex) -> bool {
        index.as_u32() < self.num_imported_memories
    }

    #[inline]
    pub fn global_index(&self, index: DefinedGlobalIndex) -> GlobalIndex {
        GlobalIndex::from_u32(self.num_imported_globals + index.as_u32())
    }

    #[inline]
    pub fn defined_global_index(&self, index: GlobalIndex) -> Option<DefinedGlobalIndex> {
        if self.is_imported_global(index) {
            None
        } else {
            Some(DefinedGlobalIndex::from_u32(
                index.as_u32() - self.num_imported_globals,
            ))
        }
    }

    #[inline]
    pub fn is_imported_global(&self, index: GlobalIndex) -> bool {
        index.as_u32() < self.num_imported_globals
    }

    pub fn num_defined_functions(&self) -> u32 {
        self.num_functions() - self.num_imported_functions
    }
    pub fn num_defined_tables(&self) -> u32 {
        self.num_tables() - self.num_imported_tables
    }
    pub fn num_defined_memories(&self) -> u32 {
        self.num_memories() - self.num_imported_memories
    }
    pub fn num_defined_globals(&self) -> u32 {
        self.num_globals() - self.num_imported_globals
    }
    pub fn num_functions(&self) -> u32 {
        len_u32(self.functions.len())
    }
    pub fn num_tables(&self) -> u32 {
        len_u32(self.tables.len())
    }
    pub fn num_memories(&self) -> u32 {
        len_u32(self.memories.len())
    }
    pub fn num_globals(&self) -> u32 {
        len_u32(self.globals.len())
    }

    /// The function type of the function at `index`.
    ///
    /// # Errors
    ///
    /// Returns "unknown function" or "unknown type" errors for out of bounds indices.
    pub fn func_type(&self, index: FuncIndex) -> crate::Result<&FuncType> {
        let desc = self
            .functions
            .get(index)
            .ok_or_else(|| Error::unknown(EntityKind::Function, index.as_u32()))?;
        self.types
            .get(desc.signature)
            .ok_or_else(|| Error::unknown(EntityKind::Type, desc.signature.as_u32()))
    }

    /// The type of an entity referred to by an export or import.
    pub fn type_of(&self, index: EntityIndex) -> crate::Result<EntityType> {
        Ok(match index {
            EntityIndex::Function(func) => EntityType::Function(self.func_type(func)?.clone()),
            EntityIndex::Table(table) => EntityType::Table(
                *self
                    .tables
                    .get(table)
                    .ok_or_else(|| Error::unknown(EntityKind::Table, table.as_u32()))?,
            ),
            EntityIndex::Memory(memory) => EntityType::Memory(
                *self
                    .memories
                    .get(memory)
                    .ok_or_else(|| Error::unknown(EntityKind::Memory, memory.as_u32()))?,
            ),
            EntityIndex::Global(global) => EntityType::Global(
                *self
                    .globals
                    .get(global)
                    .ok_or_else(|| Error::unknown(EntityKind::Global, global.as_u32()))?,
            ),
        })
    }
}

fn len_u32(len: usize) -> u32 {
    // index spaces are bounded by the 32-bit LEB encoding
    len as u32
}

#[derive(Debug, Clone, Copy)]
pub struct FunctionDesc {
    /// The index of the function signature in the type section.
    pub signature: TypeIndex,
    /// Whether the function can be referenced from outside of its own body,
    /// i.e. through an export, an element segment or a `ref.func` constant.
    pub escaping: bool,
}

#[derive(Debug, Clone)]
pub struct Import {
    /// Name of this import's module.
    pub module: String,
    /// The field name projection of this import.
    pub name: String,
    /// The type of the import.
    pub ty: EntityType,
    /// The index the imported entity occupies in its index space.
    pub index: EntityIndex,
}

#[derive(Debug, Clone)]
pub enum ElementKind {
    Active { table: TableIndex, offset: ConstExpr },
    Passive,
    Declared,
}

#[derive(Debug, Clone)]
pub struct ElementSegment {
    pub kind: ElementKind,
    pub ty: RefType,
    pub items: Box<[ConstExpr]>,
}

#[derive(Debug, Clone)]
pub enum DataKind {
    Active { memory: MemoryIndex, offset: ConstExpr },
    Passive,
}

#[derive(Debug, Clone)]
pub struct DataSegment {
    pub kind: DataKind,
    pub data: Box<[u8]>,
}

/// The translated body of a locally defined function.
#[derive(Debug, Clone, Default)]
pub struct FunctionBody {
    /// Declared locals (not including parameters), one entry per local.
    pub locals: Box<[ValType]>,
    /// The instruction sequence, including the final `end`.
    pub instructions: Box<[Instruction]>,
    /// Byte offset of each instruction in the original binary.
    pub offsets: Box<[usize]>,
}

impl FunctionBody {
    /// The types of all locals of this function, parameters first.
    pub fn local_types<'a>(&'a self, ty: &'a FuncType) -> impl Iterator<Item = ValType> + 'a {
        ty.params().iter().copied().chain(self.locals.iter().copied())
    }
}
