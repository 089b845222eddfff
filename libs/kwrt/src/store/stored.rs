// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::vec::Vec;
use core::fmt;
use core::marker::PhantomData;

#[derive(Debug, Default)]
pub struct StoredData {
    pub(super) funcs: Vec<crate::func::FuncData>,
    pub(super) tables: Vec<crate::table::TableData>,
    pub(super) globals: Vec<crate::global::GlobalData>,
    pub(super) instances: Vec<crate::instance::InstanceData>,
    pub(super) memories: Vec<crate::memory::MemoryData>,
}

macro_rules! stored_impls {
    ($bind:ident $(($ty:path, $add:ident, $get:ident, $get_mut:ident, $field:expr))*) => {
        $(
            impl super::Store {
                pub(crate) fn $add(&mut self, val: $ty) -> Stored<$ty> {
                    let $bind = self;
                    let index = $field.len();
                    $field.push(val);
                    Stored::new(index)
                }

                pub(crate) fn $get(&self, index: Stored<$ty>) -> Option<&$ty> {
                    let $bind = self;
                    $field.get(index.index)
                }

                pub(crate) fn $get_mut(&mut self, index: Stored<$ty>) -> Option<&mut $ty> {
                    let $bind = self;
                    $field.get_mut(index.index)
                }
            }

            impl ::core::ops::Index<Stored<$ty>> for super::Store {
                type Output = $ty;

                fn index(&self, index: Stored<$ty>) -> &Self::Output {
                    let $bind = self;
                    &$field[index.index]
                }
            }

            impl ::core::ops::IndexMut<Stored<$ty>> for super::Store {
                fn index_mut(&mut self, index: Stored<$ty>) -> &mut Self::Output {
                    let $bind = self;
                    &mut $field[index.index]
                }
            }
        )*
    };
}

stored_impls! {
    s
    (crate::instance::InstanceData, add_instance, get_instance, get_instance_mut, s.stored.instances)
    (crate::func::FuncData, add_function, get_function, get_function_mut, s.stored.funcs)
    (crate::table::TableData, add_table, get_table, get_table_mut, s.stored.tables)
    (crate::memory::MemoryData, add_memory, get_memory, get_memory_mut, s.stored.memories)
    (crate::global::GlobalData, add_global, get_global, get_global_mut, s.stored.globals)
}

/// A typed handle to an object owned by a [`Store`](super::Store).
pub struct Stored<T> {
    index: usize,
    _m: PhantomData<T>,
}

impl<T> Stored<T> {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            _m: PhantomData,
        }
    }

    pub(crate) fn index(self) -> usize {
        self.index
    }
}

impl<T> Clone for Stored<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Stored<T> {}

impl<T> PartialEq for Stored<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Stored<T> {}

impl<T> core::hash::Hash for Stored<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Stored<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Stored").field(&self.index).finish()
    }
}
