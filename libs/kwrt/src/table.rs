// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::vec;
use alloc::vec::Vec;

use crate::errors::Error;
use crate::instance::Instance;
use crate::store::{Store, Stored};
use crate::trap::Trap;
use crate::types::TableType;
use crate::values::Ref;

/// Upper bound on the number of elements of tables without a declared maximum.
pub const MAX_TABLE_ELEMENTS: u32 = 10_000_000;

/// A table of nullable references owned by a [`Store`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Table(pub(crate) Stored<TableData>);

/// Table storage. Elements are raw reference cells, zero being null.
#[derive(Debug)]
pub struct TableData {
    ty: TableType,
    elements: Vec<u64>,
    owner: Option<Instance>,
}

impl TableData {
    pub(crate) fn new(ty: TableType, init: u64, owner: Option<Instance>) -> Self {
        Self {
            elements: vec![init; ty.minimum() as usize],
            ty,
            owner,
        }
    }

    pub(crate) fn ty(&self) -> TableType {
        TableType::new(self.ty.element(), self.size(), self.ty.maximum())
    }

    #[inline]
    pub(crate) fn size(&self) -> u32 {
        self.elements.len() as u32
    }

    #[inline]
    pub(crate) fn get_raw(&self, index: u32) -> Result<u64, Trap> {
        self.elements
            .get(index as usize)
            .copied()
            .ok_or(Trap::TableOutOfBounds)
    }

    #[inline]
    pub(crate) fn set_raw(&mut self, index: u32, value: u64) -> Result<(), Trap> {
        let slot = self
            .elements
            .get_mut(index as usize)
            .ok_or(Trap::TableOutOfBounds)?;
        *slot = value;
        Ok(())
    }

    /// Grows the table by `delta` elements, returning the previous size or `None`
    /// if the table cannot grow that much.
    pub(crate) fn grow_raw(&mut self, delta: u32, init: u64) -> Option<u32> {
        let old = self.size();
        let new = old.checked_add(delta)?;
        if new > self.ty.maximum().unwrap_or(MAX_TABLE_ELEMENTS) {
            return None;
        }
        self.elements.try_reserve_exact(delta as usize).ok()?;
        self.elements.resize(new as usize, init);
        Some(old)
    }

    /// The range `[start, start + len)` if it lies within the table.
    pub(crate) fn range(&self, start: u32, len: u32) -> Result<core::ops::Range<usize>, Trap> {
        let end = u64::from(start) + u64::from(len);
        if end > self.elements.len() as u64 {
            return Err(Trap::TableOutOfBounds);
        }
        Ok(start as usize..end as usize)
    }

    pub(crate) fn fill_raw(&mut self, dst: u32, value: u64, len: u32) -> Result<(), Trap> {
        let range = self.range(dst, len)?;
        self.elements[range].fill(value);
        Ok(())
    }

    pub(crate) fn copy_within(&mut self, dst: u32, src: u32, len: u32) -> Result<(), Trap> {
        let src = self.range(src, len)?;
        let dst = self.range(dst, len)?;
        self.elements.copy_within(src, dst.start);
        Ok(())
    }

    pub(crate) fn slice(&self, start: u32, len: u32) -> Result<&[u64], Trap> {
        let range = self.range(start, len)?;
        Ok(&self.elements[range])
    }

    pub(crate) fn write_slice(&mut self, dst: u32, items: &[u64]) -> Result<(), Trap> {
        let range = self.range(dst, items.len() as u32)?;
        self.elements[range].copy_from_slice(items);
        Ok(())
    }
}

impl Table {
    /// Creates a new host-owned table with every element set to `init`.
    ///
    /// # Errors
    ///
    /// Fails if `init` is not of the table's element type.
    pub fn new(store: &mut Store, ty: TableType, init: Ref) -> crate::Result<Table> {
        check_ref(ty, init)?;
        Ok(Self::new_raw(store, ty, init.to_raw(), None))
    }

    pub(crate) fn new_raw(
        store: &mut Store,
        ty: TableType,
        init: u64,
        owner: Option<Instance>,
    ) -> Table {
        Table(store.add_table(TableData::new(ty, init, owner)))
    }

    /// The type of this table, with its current size as minimum.
    pub fn ty(self, store: &Store) -> TableType {
        store[self.0].ty()
    }

    pub fn owner(self, store: &Store) -> Option<Instance> {
        store[self.0].owner
    }

    pub fn size(self, store: &Store) -> u32 {
        store[self.0].size()
    }

    /// Reads the element at `index`, or `None` if it is out of bounds.
    pub fn get(self, store: &Store, index: u32) -> Option<Ref> {
        let data = &store[self.0];
        let raw = data.get_raw(index).ok()?;
        Some(Ref::from_raw(raw, data.ty.element()))
    }

    /// Writes the element at `index`.
    ///
    /// # Errors
    ///
    /// Fails with a type mismatch for references of the wrong type and with an
    /// out of bounds trap for indices past the end of the table.
    pub fn set(self, store: &mut Store, index: u32, value: Ref) -> crate::Result<()> {
        let data = &mut store[self.0];
        check_ref(data.ty, value)?;
        data.set_raw(index, value.to_raw())?;
        Ok(())
    }

    /// Grows the table by `delta` elements initialized to `init` and returns the
    /// previous size.
    ///
    /// # Errors
    ///
    /// Fails if `init` has the wrong type or the table can't grow that much.
    pub fn grow(self, store: &mut Store, delta: u32, init: Ref) -> crate::Result<u32> {
        let data = &mut store[self.0];
        check_ref(data.ty, init)?;
        data.grow_raw(delta, init.to_raw())
            .ok_or_else(|| Error::Invalid("failed to grow table".into()))
    }
}

fn check_ref(ty: TableType, value: Ref) -> crate::Result<()> {
    crate::types::ValType::from(value.ty()).ensure_matches(ty.element().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RefType;
    use crate::Engine;

    #[test]
    fn grow_respects_maximum() {
        let mut store = Store::new(&Engine::default());
        let table = Table::new(
            &mut store,
            TableType::new(RefType::Extern, 1, Some(3)),
            Ref::Extern(Some(7)),
        )
        .unwrap();

        assert_eq!(table.grow(&mut store, 2, Ref::Extern(None)).unwrap(), 1);
        assert_eq!(table.size(&store), 3);
        assert!(table.grow(&mut store, 1, Ref::Extern(None)).is_err());
        assert_eq!(table.get(&store, 0), Some(Ref::Extern(Some(7))));
        assert_eq!(table.get(&store, 2), Some(Ref::Extern(None)));
        assert_eq!(table.get(&store, 3), None);
        assert_eq!(table.ty(&store).minimum(), 3);
    }

    #[test]
    fn bulk_operations_check_bounds_first() {
        let mut data = TableData::new(TableType::new(RefType::Func, 4, None), 0, None);
        data.fill_raw(1, 9, 2).unwrap();
        assert_eq!(data.slice(0, 4).unwrap(), &[0, 9, 9, 0]);

        assert_eq!(data.fill_raw(3, 5, 2), Err(Trap::TableOutOfBounds));
        assert_eq!(data.slice(0, 4).unwrap(), &[0, 9, 9, 0]);

        data.copy_within(2, 1, 2).unwrap();
        assert_eq!(data.slice(0, 4).unwrap(), &[0, 9, 9, 9]);
        assert_eq!(data.fill_raw(4, 1, 0), Ok(()));
    }

    #[test]
    fn set_checks_type() {
        let mut store = Store::new(&Engine::default());
        let table =
            Table::new(&mut store, TableType::new(RefType::Func, 1, None), Ref::Func(None)).unwrap();
        assert!(matches!(
            table.set(&mut store, 0, Ref::Extern(None)),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            table.set(&mut store, 1, Ref::Func(None)),
            Err(Error::Trap { trap: Trap::TableOutOfBounds, .. })
        ));
    }
}
