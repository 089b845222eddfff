// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The ahead-of-time backend.
//!
//! At instantiation every locally defined function is lowered into flat slot
//! code ([`lower`]), checked ([`verify`]) and loaded into a list of closures
//! ([`load`]). Calls between local functions push an activation onto an
//! explicit frame stack, so neither block nesting nor call depth grows the host
//! stack. Imported functions and functions of other instances use the boxed
//! calling convention shared with the interpreter.

mod emission;
mod load;
mod lower;
mod verify;

use alloc::format;
use alloc::vec::Vec;

use cranelift_entity::PrimaryMap;
use smallvec::SmallVec;

use super::Machine;
use crate::config::Config;
use crate::errors::Error;
use crate::func::Func;
use crate::indices::{DefinedFuncIndex, FuncIndex};
use crate::instance::Instance;
use crate::store::Store;
use crate::translate::TranslatedModule;
use crate::trap::FrameInfo;
use crate::types::EntityKind;
use crate::values::Val;
use load::{Flow, Unit};

#[derive(Debug)]
pub(crate) struct AotMachine {
    units: PrimaryMap<DefinedFuncIndex, Unit>,
    max_call_depth: u32,
}

impl AotMachine {
    /// Compiles every locally defined function of `module`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Compile` if a function can't be lowered and
    /// `Error::Verification` if lowered code fails its checks.
    pub fn compile(config: &Config, module: &TranslatedModule) -> crate::Result<Self> {
        let mut units = PrimaryMap::with_capacity(module.function_bodies.len());

        for (defined, body) in &module.function_bodies {
            let func = module.func_index(defined);
            let lowered = lower::lower(module, func, body)?;
            verify::verify(module, &lowered)?;
            tracing::trace!(
                func = func.as_u32(),
                frame_size = lowered.frame_size,
                "compiled function"
            );
            units.push(load::load(module, lowered)?);
        }

        tracing::debug!(functions = units.len(), "compiled module");
        Ok(Self {
            units,
            max_call_depth: config.get_max_call_depth(),
        })
    }
}

impl Machine for AotMachine {
    fn call(
        &self,
        store: &mut Store,
        instance: Instance,
        func: FuncIndex,
        args: &[Val],
    ) -> crate::Result<Vec<Val>> {
        let module = instance.module(store).clone();
        let translated = module.translated();
        let defined = translated
            .defined_func_index(func)
            .ok_or_else(|| Error::unknown(EntityKind::Function, func.as_u32()))?;
        let ty = translated.func_type(func)?;
        let raw: SmallVec<[u64; 8]> = args.iter().map(Val::to_raw).collect();

        let depth_base = store.depth;
        let mut ctx = AotContext {
            store: &mut *store,
            instance,
            module: translated,
            units: &self.units,
            max_call_depth: self.max_call_depth,
        };
        let result = ctx.execute(defined, &raw);
        store.depth = depth_base;

        super::box_results(ty.results(), &result?)
    }

    fn stack_trace(&self, _store: &Store, _instance: Instance) -> Vec<FrameInfo> {
        // compiled units don't record frames
        Vec::new()
    }
}

/// State threaded through the nodes of a running unit.
pub(super) struct AotContext<'a> {
    store: &'a mut Store,
    instance: Instance,
    module: &'a TranslatedModule,
    units: &'a PrimaryMap<DefinedFuncIndex, Unit>,
    max_call_depth: u32,
}

/// A running unit. Its slots are `slots[base..base + unit.frame_size]` of the
/// activation loop.
struct Activation<'a> {
    unit: &'a Unit,
    base: usize,
    pc: usize,
    /// Where the caller expects the results.
    results_at: usize,
}

impl<'a> AotContext<'a> {
    fn unit(&self, defined: DefinedFuncIndex) -> crate::Result<&'a Unit> {
        let units = self.units;
        units.get(defined).ok_or_else(|| {
            Error::unknown(
                EntityKind::Function,
                self.module.func_index(defined).as_u32(),
            )
        })
    }

    /// Runs `entry` and every local function it calls to completion.
    fn execute(
        &mut self,
        entry: DefinedFuncIndex,
        args: &[u64],
    ) -> crate::Result<SmallVec<[u64; 4]>> {
        let unit = self.unit(entry)?;
        if args.len() != unit.num_params {
            return Err(Error::Invalid(format!(
                "function {} expects {} arguments, got {}",
                unit.func.as_u32(),
                unit.num_params,
                args.len()
            )));
        }

        let mut slots = Vec::new();
        let mut frames = Vec::new();
        self.push_activation(&mut frames, &mut slots, unit, 0)?;
        slots[..args.len()].copy_from_slice(args);

        loop {
            let (flow, base) = {
                let frame = frames
                    .last_mut()
                    .ok_or_else(|| Error::Invalid("no active frame".into()))?;
                let frame_slots = &mut slots[frame.base..frame.base + frame.unit.frame_size];
                let flow = match frame.unit.body.get(frame.pc) {
                    Some(node) => node(self, frame_slots)?,
                    None => Flow::Return,
                };
                match flow {
                    Flow::Next | Flow::Call { .. } => frame.pc += 1,
                    Flow::Jump(target) => frame.pc = target as usize,
                    Flow::Return => {}
                }
                (flow, frame.base)
            };

            match flow {
                Flow::Next | Flow::Jump(_) => {}
                Flow::Call { callee, args } => {
                    let unit = self.unit(callee)?;
                    let args = base + args as usize;
                    let callee_base = slots.len();
                    self.push_activation(&mut frames, &mut slots, unit, args)?;
                    slots.copy_within(args..args + unit.num_params, callee_base);
                }
                Flow::Return => {
                    let frame = frames
                        .pop()
                        .ok_or_else(|| Error::Invalid("no active frame".into()))?;
                    super::exit_frame(self.store);

                    let results = frame.base + frame.unit.results_base();
                    let results = results..results + frame.unit.num_results;
                    if frames.is_empty() {
                        return Ok(SmallVec::from_slice(&slots[results]));
                    }
                    slots.copy_within(results, frame.results_at);
                    slots.truncate(frame.base);
                }
            }
        }
    }

    fn push_activation(
        &mut self,
        frames: &mut Vec<Activation<'a>>,
        slots: &mut Vec<u64>,
        unit: &'a Unit,
        results_at: usize,
    ) -> crate::Result<()> {
        super::enter_frame(self.store, self.max_call_depth)?;
        let base = slots.len();
        slots.extend_from_slice(&unit.locals);
        slots.resize(base + unit.frame_size, 0);
        frames.push(Activation {
            unit,
            base,
            pc: 0,
            results_at,
        });
        Ok(())
    }

    /// Calls the imported function `func` of the running instance.
    fn call_import(&mut self, func: FuncIndex, args: &[u64]) -> crate::Result<SmallVec<[u64; 4]>> {
        let handle = self.instance.func(self.store, func)?;
        self.call_boxed(handle, args)
    }

    /// The local function a reference points to, if it belongs to the running
    /// instance.
    fn local_target(&self, func: Func) -> Option<DefinedFuncIndex> {
        match func.wasm_target(self.store)? {
            (instance, index) if instance == self.instance => self.module.defined_func_index(index),
            _ => None,
        }
    }

    fn call_boxed(&mut self, func: Func, args: &[u64]) -> crate::Result<SmallVec<[u64; 4]>> {
        let results = super::call_boxed(self.store, self.instance, func, args)?;
        Ok(results.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::ModuleTranslator;

    #[test]
    fn compiles_every_local_function() {
        let bytes = wat::parse_str(
            r#"(module
                (import "env" "f" (func))
                (func (result i32) i32.const 1)
                (func (param i64) (result i64) local.get 0 i64.const 1 i64.rotl))"#,
        )
        .unwrap();
        let module = ModuleTranslator::new().translate(&bytes).unwrap();
        let machine = AotMachine::compile(&Config::default(), &module).unwrap();
        assert_eq!(machine.units.len(), 2);
    }
}
