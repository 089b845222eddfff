// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::vec::Vec;

use crate::errors::Error;
use crate::instance::Instance;
use crate::store::{Store, Stored};
use crate::trap::Trap;
use crate::types::MemoryType;

/// WebAssembly page sizes are 64KiB.
pub const WASM_PAGE_SIZE: u32 = 0x10000;

/// The maximum number of pages of a 32-bit memory.
pub const WASM32_MAX_PAGES: u32 = 0x10000;

/// A linear memory owned by a [`Store`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Memory(pub(crate) Stored<MemoryData>);

#[derive(Debug)]
pub struct MemoryData {
    ty: MemoryType,
    bytes: Vec<u8>,
    owner: Option<Instance>,
}

impl MemoryData {
    pub(crate) fn new(ty: MemoryType, owner: Option<Instance>) -> crate::Result<Self> {
        if ty.minimum() > WASM32_MAX_PAGES
            || ty.maximum().is_some_and(|max| max > WASM32_MAX_PAGES)
        {
            return Err(Error::Invalid(
                "memory size must be at most 65536 pages (4GiB)".into(),
            ));
        }
        let len = ty.minimum() as usize * WASM_PAGE_SIZE as usize;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| Error::Invalid("failed to allocate linear memory".into()))?;
        bytes.resize(len, 0);
        Ok(Self { ty, bytes, owner })
    }

    pub(crate) fn ty(&self) -> MemoryType {
        MemoryType::new(self.pages(), self.ty.maximum())
    }

    #[inline]
    pub(crate) fn pages(&self) -> u32 {
        (self.bytes.len() / WASM_PAGE_SIZE as usize) as u32
    }

    #[inline]
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The byte range `[addr, addr + len)` if it lies within the memory.
    #[inline]
    pub(crate) fn range(&self, addr: u64, len: u64) -> Result<core::ops::Range<usize>, Trap> {
        let end = addr.checked_add(len).ok_or(Trap::MemoryOutOfBounds)?;
        if end > self.bytes.len() as u64 {
            return Err(Trap::MemoryOutOfBounds);
        }
        Ok(addr as usize..end as usize)
    }

    /// Loads `width` bytes little-endian from the effective address `base + offset`.
    #[inline]
    pub(crate) fn load(&self, base: u32, offset: u32, width: u32) -> Result<u64, Trap> {
        let addr = u64::from(base) + u64::from(offset);
        let range = self.range(addr, u64::from(width))?;
        let mut buf = [0_u8; 8];
        buf[..width as usize].copy_from_slice(&self.bytes[range]);
        Ok(u64::from_le_bytes(buf))
    }

    /// Stores the low `width` bytes of `value` little-endian at `base + offset`.
    #[inline]
    pub(crate) fn store(&mut self, base: u32, offset: u32, width: u32, value: u64) -> Result<(), Trap> {
        let addr = u64::from(base) + u64::from(offset);
        let range = self.range(addr, u64::from(width))?;
        self.bytes[range].copy_from_slice(&value.to_le_bytes()[..width as usize]);
        Ok(())
    }

    /// Grows the memory by `delta` pages, returning the previous size in pages
    /// or `None` if the memory cannot grow that much.
    pub(crate) fn grow_raw(&mut self, delta: u32) -> Option<u32> {
        let old = self.pages();
        let new = old.checked_add(delta)?;
        if new > self.ty.maximum().unwrap_or(WASM32_MAX_PAGES) || new > WASM32_MAX_PAGES {
            return None;
        }
        let additional = delta as usize * WASM_PAGE_SIZE as usize;
        self.bytes.try_reserve_exact(additional).ok()?;
        self.bytes.resize(new as usize * WASM_PAGE_SIZE as usize, 0);
        Some(old)
    }

    pub(crate) fn fill(&mut self, dst: u32, value: u8, len: u32) -> Result<(), Trap> {
        let range = self.range(u64::from(dst), u64::from(len))?;
        self.bytes[range].fill(value);
        Ok(())
    }

    pub(crate) fn copy_within(&mut self, dst: u32, src: u32, len: u32) -> Result<(), Trap> {
        let src = self.range(u64::from(src), u64::from(len))?;
        let dst = self.range(u64::from(dst), u64::from(len))?;
        self.bytes.copy_within(src, dst.start);
        Ok(())
    }

    pub(crate) fn write(&mut self, dst: u64, data: &[u8]) -> Result<(), Trap> {
        let range = self.range(dst, data.len() as u64)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn read(&self, src: u64, buf: &mut [u8]) -> Result<(), Trap> {
        let range = self.range(src, buf.len() as u64)?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }
}

impl Memory {
    /// Creates a new host-owned memory.
    ///
    /// # Errors
    ///
    /// Fails if the limits exceed 65536 pages or the memory can't be allocated.
    pub fn new(store: &mut Store, ty: MemoryType) -> crate::Result<Memory> {
        let data = MemoryData::new(ty, None)?;
        Ok(Memory(store.add_memory(data)))
    }

    pub(crate) fn new_owned(store: &mut Store, ty: MemoryType, owner: Instance) -> crate::Result<Memory> {
        let data = MemoryData::new(ty, Some(owner))?;
        Ok(Memory(store.add_memory(data)))
    }

    /// The type of this memory, with its current size as minimum.
    pub fn ty(self, store: &Store) -> MemoryType {
        store[self.0].ty()
    }

    pub fn owner(self, store: &Store) -> Option<Instance> {
        store[self.0].owner
    }

    /// The current size in pages.
    pub fn size(self, store: &Store) -> u32 {
        store[self.0].pages()
    }

    /// The contents of this memory.
    pub fn data(self, store: &Store) -> &[u8] {
        store[self.0].bytes()
    }

    /// Mutable access to the contents of this memory.
    pub fn data_mut(self, store: &mut Store) -> &mut [u8] {
        &mut store[self.0].bytes
    }

    /// Reads `buf.len()` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with an out of bounds memory trap if the range exceeds the memory.
    pub fn read(self, store: &Store, offset: u64, buf: &mut [u8]) -> crate::Result<()> {
        store[self.0].read(offset, buf)?;
        Ok(())
    }

    /// Writes `data` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with an out of bounds memory trap if the range exceeds the memory.
    /// Nothing is written in that case.
    pub fn write(self, store: &mut Store, offset: u64, data: &[u8]) -> crate::Result<()> {
        store[self.0].write(offset, data)?;
        Ok(())
    }

    /// Grows the memory by `delta` pages and returns the previous size in pages.
    ///
    /// # Errors
    ///
    /// Fails if the memory would exceed its maximum or can't be allocated.
    pub fn grow(self, store: &mut Store, delta: u32) -> crate::Result<u32> {
        store[self.0]
            .grow_raw(delta)
            .ok_or_else(|| Error::Invalid("failed to grow memory".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Engine;
    use proptest::prelude::*;

    #[test]
    fn loads_and_stores_are_little_endian() {
        let mut data = MemoryData::new(MemoryType::new(1, None), None).unwrap();
        data.store(8, 0, 4, 0x1122_3344).unwrap();
        assert_eq!(data.bytes()[8..12], [0x44, 0x33, 0x22, 0x11]);
        assert_eq!(data.load(4, 4, 2).unwrap(), 0x3344);
        assert_eq!(
            data.load(WASM_PAGE_SIZE - 4, 0, 8),
            Err(Trap::MemoryOutOfBounds)
        );
        assert_eq!(data.load(u32::MAX, u32::MAX, 1), Err(Trap::MemoryOutOfBounds));
    }

    #[test]
    fn grow_respects_maximum() {
        let mut store = Store::new(&Engine::default());
        let memory = Memory::new(&mut store, MemoryType::new(1, Some(2))).unwrap();
        assert_eq!(memory.grow(&mut store, 1).unwrap(), 1);
        assert_eq!(memory.size(&store), 2);
        assert!(memory.grow(&mut store, 1).is_err());
        assert_eq!(memory.data(&store).len(), 2 * WASM_PAGE_SIZE as usize);
    }

    #[test]
    fn oversized_limits_are_rejected() {
        let mut store = Store::new(&Engine::default());
        assert!(Memory::new(&mut store, MemoryType::new(WASM32_MAX_PAGES + 1, None)).is_err());
    }

    proptest! {
        #[test]
        fn write_then_read_round_trips(offset in 0_u64..(2 * WASM_PAGE_SIZE as u64), bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let mut store = Store::new(&Engine::default());
            let memory = Memory::new(&mut store, MemoryType::new(1, None)).unwrap();
            let in_bounds = offset + bytes.len() as u64 <= u64::from(WASM_PAGE_SIZE);

            let written = memory.write(&mut store, offset, &bytes);
            prop_assert_eq!(written.is_ok(), in_bounds);

            let mut buf = alloc::vec![0; bytes.len()];
            let read = memory.read(&store, offset, &mut buf);
            prop_assert_eq!(read.is_ok(), in_bounds);
            if in_bounds {
                prop_assert_eq!(buf, bytes);
            } else {
                prop_assert!(matches!(written, Err(Error::Trap { trap: Trap::MemoryOutOfBounds, .. })), "expected MemoryOutOfBounds trap");
            }
        }
    }
}
