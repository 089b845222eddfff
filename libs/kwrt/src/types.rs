// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use core::fmt;

use crate::errors::Error;

/// The types of values a WebAssembly program can operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    FuncRef,
    ExternRef,
}

impl ValType {
    pub fn is_num(self) -> bool {
        matches!(self, Self::I32 | Self::I64 | Self::F32 | Self::F64)
    }

    pub fn is_ref(self) -> bool {
        matches!(self, Self::FuncRef | Self::ExternRef)
    }

    /// Returns the reference type of this value type, if it is one.
    pub fn as_ref_type(self) -> Option<RefType> {
        match self {
            Self::FuncRef => Some(RefType::Func),
            Self::ExternRef => Some(RefType::Extern),
            _ => None,
        }
    }

    /// Ensure `self` is the same type as `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeMismatch`] naming both types if they differ.
    pub fn ensure_matches(self, expected: ValType) -> crate::Result<()> {
        if self == expected {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                expected,
                actual: self,
            })
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => f.write_str("i32"),
            ValType::I64 => f.write_str("i64"),
            ValType::F32 => f.write_str("f32"),
            ValType::F64 => f.write_str("f64"),
            ValType::FuncRef => f.write_str("funcref"),
            ValType::ExternRef => f.write_str("externref"),
        }
    }
}

/// The types of references that can be stored in tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefType {
    Func,
    Extern,
}

impl From<RefType> for ValType {
    fn from(ty: RefType) -> Self {
        match ty {
            RefType::Func => ValType::FuncRef,
            RefType::Extern => ValType::ExternRef,
        }
    }
}

impl fmt::Display for RefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&ValType::from(*self), f)
    }
}

/// The signature of a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    params: Arc<[ValType]>,
    results: Arc<[ValType]>,
}

impl FuncType {
    pub fn new(
        params: impl IntoIterator<Item = ValType>,
        results: impl IntoIterator<Item = ValType>,
    ) -> Self {
        Self {
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
        }
    }

    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    pub fn results(&self) -> &[ValType] {
        &self.results
    }
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, tys: &[ValType]) -> fmt::Result {
            f.write_str("[")?;
            for (i, ty) in tys.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{ty}")?;
            }
            f.write_str("]")
        }

        list(f, &self.params)?;
        f.write_str(" -> ")?;
        list(f, &self.results)
    }
}

/// Whether a global can be written after initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutability {
    Const,
    Var,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalType {
    pub content: ValType,
    pub mutability: Mutability,
}

impl GlobalType {
    pub fn new(content: ValType, mutability: Mutability) -> Self {
        Self {
            content,
            mutability,
        }
    }

    pub fn content(&self) -> ValType {
        self.content
    }

    pub fn mutability(&self) -> Mutability {
        self.mutability
    }

    pub fn is_mutable(&self) -> bool {
        self.mutability == Mutability::Var
    }
}

/// Size bounds of a table (in elements) or a memory (in pages).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Limits {
    pub min: u32,
    pub max: Option<u32>,
}

impl Limits {
    pub fn new(min: u32, max: Option<u32>) -> Self {
        Self { min, max }
    }

    /// Import matching: an entity with limits `self` can satisfy an import declaring `other`.
    pub fn is_subtype_of(&self, other: &Limits) -> bool {
        if self.min < other.min {
            return false;
        }
        match (self.max, other.max) {
            (_, None) => true,
            (Some(actual), Some(expected)) => actual <= expected,
            (None, Some(_)) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableType {
    pub element: RefType,
    pub limits: Limits,
}

impl TableType {
    pub fn new(element: RefType, min: u32, max: Option<u32>) -> Self {
        Self {
            element,
            limits: Limits::new(min, max),
        }
    }

    pub fn element(&self) -> RefType {
        self.element
    }

    pub fn minimum(&self) -> u32 {
        self.limits.min
    }

    pub fn maximum(&self) -> Option<u32> {
        self.limits.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryType {
    pub limits: Limits,
}

impl MemoryType {
    pub fn new(min: u32, max: Option<u32>) -> Self {
        Self {
            limits: Limits::new(min, max),
        }
    }

    pub fn minimum(&self) -> u32 {
        self.limits.min
    }

    pub fn maximum(&self) -> Option<u32> {
        self.limits.max
    }
}

/// The kinds of entities an index can refer to, used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Function,
    Table,
    Memory,
    Global,
    Type,
    Element,
    Data,
    Local,
    Label,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Function => f.write_str("function"),
            EntityKind::Table => f.write_str("table"),
            EntityKind::Memory => f.write_str("memory"),
            EntityKind::Global => f.write_str("global"),
            EntityKind::Type => f.write_str("type"),
            EntityKind::Element => f.write_str("elem segment"),
            EntityKind::Data => f.write_str("data segment"),
            EntityKind::Local => f.write_str("local"),
            EntityKind::Label => f.write_str("label"),
        }
    }
}

/// The type of an imported or exported entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityType {
    Function(FuncType),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

impl EntityType {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityType::Function(_) => EntityKind::Function,
            EntityType::Table(_) => EntityKind::Table,
            EntityType::Memory(_) => EntityKind::Memory,
            EntityType::Global(_) => EntityKind::Global,
        }
    }
}
