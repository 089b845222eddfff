// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime helpers for instructions that touch store-owned state in bulk.
//!
//! Both backends dispatch memory and table management instructions through
//! this table so that bounds checks and growth rules exist exactly once.

use alloc::boxed::Box;
use alloc::vec::Vec;

use cranelift_entity::entity_impl;

use crate::errors::Error;
use crate::indices::{DataIndex, ElemIndex, TableIndex};
use crate::instance::Instance;
use crate::store::Store;
use crate::translate::Instruction;
use crate::trap::Trap;
use crate::types::EntityKind;

/// Iterate over all builtin functions and call the provided macro for each.
///
/// Parameters are named in operand stack order (bottom first).
macro_rules! foreach_builtin_function {
    ($mac:ident) => {
        $mac! {
            memory_size() -> result;
            memory_grow(delta) -> result;
            memory_fill(dst, val, len);
            memory_copy(dst, src, len);
            memory_init(dst, src, len);
            data_drop();
            table_get(index) -> result;
            table_set(index, value);
            table_size() -> result;
            table_grow(init, delta) -> result;
            table_fill(dst, value, len);
            table_copy(dst, src, len);
            table_init(dst, src, len);
            elem_drop();
        }
    };
}

/// The signature shared by all builtins: static immediates of the instruction
/// plus its raw operands.
pub(crate) type BuiltinFn =
    fn(&mut Store, Instance, [u32; 2], &[u64]) -> crate::Result<Option<u64>>;

/// An index type for builtin functions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuiltinFunctionIndex(u32);
entity_impl!(BuiltinFunctionIndex);

macro_rules! declare_indexes {
    (
        $(
            $name:ident( $( $pname:ident ),* ) $( -> $result:ident )?;
        )*
    ) => {
        impl BuiltinFunctionIndex {
            declare_indexes!(
                @indices;
                0;
                $( $name; )*
            );

            /// Returns a symbol name for this builtin.
            pub fn name(&self) -> &'static str {
                $(
                    if *self == BuiltinFunctionIndex::$name() {
                        return stringify!($name);
                    }
                )*
                unreachable!()
            }

            /// The number of operands this builtin pops.
            pub fn arity(&self) -> usize {
                $(
                    if *self == BuiltinFunctionIndex::$name() {
                        return <[&str]>::len(&[$( stringify!($pname) ),*]);
                    }
                )*
                unreachable!()
            }

            /// Whether this builtin pushes a result.
            pub fn has_result(&self) -> bool {
                $(
                    if *self == BuiltinFunctionIndex::$name() {
                        return declare_indexes!(@has_result $( $result )?);
                    }
                )*
                unreachable!()
            }

            fn implementation(self) -> BuiltinFn {
                const TABLE: [BuiltinFn; BuiltinFunctionIndex::builtin_functions_total_number() as usize] = [
                    $( $name, )*
                ];
                TABLE[self.0 as usize]
            }
        }
    };

    (@has_result result) => { true };
    (@has_result) => { false };

    // Base case: no more indices to declare, so define the total number of
    // function indices.
    (
        @indices;
        $len:expr;
    ) => {
        /// Returns the total number of builtin functions.
        pub const fn builtin_functions_total_number() -> u32 {
            $len
        }
    };

    // Recursive case: declare the next index, and then keep declaring the rest of
    // the indices.
    (
         @indices;
         $index:expr;
         $this_name:ident;
         $( $rest_name:ident; )*
    ) => {
        #[allow(missing_docs, reason = "names are self-describing")]
        pub const fn $this_name() -> Self {
            Self($index)
        }

        declare_indexes!(
            @indices;
            ($index + 1);
            $( $rest_name; )*
        );
    }
}

foreach_builtin_function!(declare_indexes);

impl BuiltinFunctionIndex {
    /// The builtin implementing `instr` and the instruction's immediates, if
    /// `instr` is dispatched through a builtin.
    pub(crate) fn for_instruction(instr: &Instruction) -> Option<(Self, [u32; 2])> {
        Some(match *instr {
            Instruction::MemorySize => (Self::memory_size(), [0, 0]),
            Instruction::MemoryGrow => (Self::memory_grow(), [0, 0]),
            Instruction::MemoryFill => (Self::memory_fill(), [0, 0]),
            Instruction::MemoryCopy => (Self::memory_copy(), [0, 0]),
            Instruction::MemoryInit { data } => (Self::memory_init(), [data.as_u32(), 0]),
            Instruction::DataDrop { data } => (Self::data_drop(), [data.as_u32(), 0]),
            Instruction::TableGet { table } => (Self::table_get(), [table.as_u32(), 0]),
            Instruction::TableSet { table } => (Self::table_set(), [table.as_u32(), 0]),
            Instruction::TableSize { table } => (Self::table_size(), [table.as_u32(), 0]),
            Instruction::TableGrow { table } => (Self::table_grow(), [table.as_u32(), 0]),
            Instruction::TableFill { table } => (Self::table_fill(), [table.as_u32(), 0]),
            Instruction::TableCopy { dst, src } => {
                (Self::table_copy(), [dst.as_u32(), src.as_u32()])
            }
            Instruction::TableInit { elem, table } => {
                (Self::table_init(), [elem.as_u32(), table.as_u32()])
            }
            Instruction::ElemDrop { elem } => (Self::elem_drop(), [elem.as_u32(), 0]),
            _ => return None,
        })
    }

    /// Runs this builtin on behalf of `instance`.
    ///
    /// # Errors
    ///
    /// Returns the trap raised by the operation, or an unknown-entity error for
    /// immediates that were not validated.
    pub(crate) fn call(
        self,
        store: &mut Store,
        instance: Instance,
        immediates: [u32; 2],
        args: &[u64],
    ) -> crate::Result<Option<u64>> {
        debug_assert_eq!(args.len(), self.arity(), "{}", self.name());
        (self.implementation())(store, instance, immediates, args)
    }
}

/// Result of a failed `memory.grow` or `table.grow`: -1 as an i32 cell.
const GROW_FAILED: u64 = 0xffff_ffff;

fn memory_size(
    store: &mut Store,
    instance: Instance,
    _: [u32; 2],
    _: &[u64],
) -> crate::Result<Option<u64>> {
    let memory = instance.memory(store)?;
    Ok(Some(u64::from(memory.size(store))))
}

fn memory_grow(
    store: &mut Store,
    instance: Instance,
    _: [u32; 2],
    args: &[u64],
) -> crate::Result<Option<u64>> {
    let memory = instance.memory(store)?;
    let result = store[memory.0].grow_raw(args[0] as u32);
    tracing::trace!(delta = args[0] as u32, ?result, "memory.grow");
    Ok(Some(result.map_or(GROW_FAILED, u64::from)))
}

fn memory_fill(
    store: &mut Store,
    instance: Instance,
    _: [u32; 2],
    args: &[u64],
) -> crate::Result<Option<u64>> {
    let memory = instance.memory(store)?;
    store[memory.0].fill(args[0] as u32, args[1] as u8, args[2] as u32)?;
    Ok(None)
}

fn memory_copy(
    store: &mut Store,
    instance: Instance,
    _: [u32; 2],
    args: &[u64],
) -> crate::Result<Option<u64>> {
    let memory = instance.memory(store)?;
    store[memory.0].copy_within(args[0] as u32, args[1] as u32, args[2] as u32)?;
    Ok(None)
}

fn memory_init(
    store: &mut Store,
    instance: Instance,
    [data, _]: [u32; 2],
    args: &[u64],
) -> crate::Result<Option<u64>> {
    let (dst, src, len) = (args[0] as u32, args[1] as u32, args[2] as u32);
    let memory = instance.memory(store)?;
    let index = DataIndex::from_u32(data);

    let module = instance.module(store).clone();
    let segment = module
        .translated()
        .data
        .get(index)
        .ok_or_else(|| Error::unknown(EntityKind::Data, data))?;
    let bytes: &[u8] = if store[instance.0].dropped_data.contains(index) {
        &[]
    } else {
        &segment.data
    };

    let src = usize::try_from(src).map_err(|_| Trap::MemoryOutOfBounds)?;
    let len = usize::try_from(len).map_err(|_| Trap::MemoryOutOfBounds)?;
    let bytes = src
        .checked_add(len)
        .and_then(|end| bytes.get(src..end))
        .ok_or(Trap::MemoryOutOfBounds)?;
    store[memory.0].write(u64::from(dst), bytes)?;
    Ok(None)
}

fn data_drop(
    store: &mut Store,
    instance: Instance,
    [data, _]: [u32; 2],
    _: &[u64],
) -> crate::Result<Option<u64>> {
    store[instance.0].drop_data(DataIndex::from_u32(data));
    Ok(None)
}

fn table_get(
    store: &mut Store,
    instance: Instance,
    [table, _]: [u32; 2],
    args: &[u64],
) -> crate::Result<Option<u64>> {
    let table = instance.table(store, TableIndex::from_u32(table))?;
    Ok(Some(store[table.0].get_raw(args[0] as u32)?))
}

fn table_set(
    store: &mut Store,
    instance: Instance,
    [table, _]: [u32; 2],
    args: &[u64],
) -> crate::Result<Option<u64>> {
    let table = instance.table(store, TableIndex::from_u32(table))?;
    store[table.0].set_raw(args[0] as u32, args[1])?;
    Ok(None)
}

fn table_size(
    store: &mut Store,
    instance: Instance,
    [table, _]: [u32; 2],
    _: &[u64],
) -> crate::Result<Option<u64>> {
    let table = instance.table(store, TableIndex::from_u32(table))?;
    Ok(Some(u64::from(store[table.0].size())))
}

fn table_grow(
    store: &mut Store,
    instance: Instance,
    [table, _]: [u32; 2],
    args: &[u64],
) -> crate::Result<Option<u64>> {
    let table = instance.table(store, TableIndex::from_u32(table))?;
    let result = store[table.0].grow_raw(args[1] as u32, args[0]);
    tracing::trace!(delta = args[1] as u32, ?result, "table.grow");
    Ok(Some(result.map_or(GROW_FAILED, u64::from)))
}

fn table_fill(
    store: &mut Store,
    instance: Instance,
    [table, _]: [u32; 2],
    args: &[u64],
) -> crate::Result<Option<u64>> {
    let table = instance.table(store, TableIndex::from_u32(table))?;
    store[table.0].fill_raw(args[0] as u32, args[1], args[2] as u32)?;
    Ok(None)
}

fn table_copy(
    store: &mut Store,
    instance: Instance,
    [dst_table, src_table]: [u32; 2],
    args: &[u64],
) -> crate::Result<Option<u64>> {
    let (dst, src, len) = (args[0] as u32, args[1] as u32, args[2] as u32);
    let dst_table = instance.table(store, TableIndex::from_u32(dst_table))?;
    let src_table = instance.table(store, TableIndex::from_u32(src_table))?;

    if dst_table == src_table {
        store[dst_table.0].copy_within(dst, src, len)?;
    } else {
        store[dst_table.0].range(dst, len)?;
        let items = store[src_table.0].slice(src, len)?.to_vec();
        store[dst_table.0].write_slice(dst, &items)?;
    }
    Ok(None)
}

fn table_init(
    store: &mut Store,
    instance: Instance,
    [elem, table]: [u32; 2],
    args: &[u64],
) -> crate::Result<Option<u64>> {
    let (dst, src, len) = (args[0] as u32, args[1] as u32, args[2] as u32);
    let table = instance.table(store, TableIndex::from_u32(table))?;
    let items = store[instance.0]
        .elements
        .get(ElemIndex::from_u32(elem))
        .ok_or_else(|| Error::unknown(EntityKind::Element, elem))?;

    let src = usize::try_from(src).map_err(|_| Trap::TableOutOfBounds)?;
    let len = usize::try_from(len).map_err(|_| Trap::TableOutOfBounds)?;
    let items: Vec<u64> = src
        .checked_add(len)
        .and_then(|end| items.get(src..end))
        .ok_or(Trap::TableOutOfBounds)?
        .to_vec();
    store[table.0].write_slice(dst, &items)?;
    Ok(None)
}

fn elem_drop(
    store: &mut Store,
    instance: Instance,
    [elem, _]: [u32; 2],
    _: &[u64],
) -> crate::Result<Option<u64>> {
    let items = store[instance.0]
        .elements
        .get_mut(ElemIndex::from_u32(elem))
        .ok_or_else(|| Error::unknown(EntityKind::Element, elem))?;
    *items = Box::default();
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_arities() {
        assert_eq!(BuiltinFunctionIndex::memory_grow().name(), "memory_grow");
        assert_eq!(BuiltinFunctionIndex::table_copy().arity(), 3);
        assert_eq!(BuiltinFunctionIndex::data_drop().arity(), 0);
        assert!(BuiltinFunctionIndex::table_size().has_result());
        assert!(!BuiltinFunctionIndex::elem_drop().has_result());
        assert_eq!(BuiltinFunctionIndex::builtin_functions_total_number(), 14);
    }

    #[test]
    fn instructions_map_to_builtins() {
        let (builtin, imm) = BuiltinFunctionIndex::for_instruction(&Instruction::TableCopy {
            dst: TableIndex::from_u32(1),
            src: TableIndex::from_u32(0),
        })
        .unwrap();
        assert_eq!(builtin, BuiltinFunctionIndex::table_copy());
        assert_eq!(imm, [1, 0]);
        assert!(BuiltinFunctionIndex::for_instruction(&Instruction::Nop).is_none());
    }
}
