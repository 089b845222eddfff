// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use alloc::vec::Vec;

use smallvec::SmallVec;

use super::{ExecutionListener, Machine};
use crate::builtins::BuiltinFunctionIndex;
use crate::config::Config;
use crate::errors::Error;
use crate::exec_stack::OperandStack;
use crate::indices::FuncIndex;
use crate::instance::Instance;
use crate::ops::{self, OpFn};
use crate::store::{ActiveFrame, Store};
use crate::translate::{FunctionBody, Instruction, TranslatedModule};
use crate::trap::{FrameInfo, Trap, WasmBacktrace};
use crate::types::EntityKind;
use crate::values::Val;

/// Executes translated instructions directly.
///
/// WebAssembly-to-WebAssembly calls within one instance run on an explicit frame
/// stack; only calls into host functions and other instances recurse.
pub(crate) struct Interpreter {
    listener: Option<Arc<dyn ExecutionListener>>,
    max_call_depth: u32,
}

impl Interpreter {
    pub fn new(config: &Config) -> Self {
        Self {
            listener: config.get_listener().cloned(),
            max_call_depth: config.get_max_call_depth(),
        }
    }
}

impl Machine for Interpreter {
    fn call(
        &self,
        store: &mut Store,
        instance: Instance,
        func: FuncIndex,
        args: &[Val],
    ) -> crate::Result<Vec<Val>> {
        let module = instance.module(store).clone();
        let translated = module.translated();
        let ty = translated.func_type(func)?;

        let frames_base = store.frames.len();
        let depth_base = store.depth;

        let mut exec = Execution {
            interpreter: self,
            store: &mut *store,
            instance,
            module: translated,
            stack: OperandStack::new(),
            locals: Vec::new(),
            labels: Vec::new(),
            frames: Vec::new(),
        };
        for arg in args {
            exec.stack.push(arg.to_raw());
        }

        let result = exec.run(func).and_then(|()| {
            let mut raw = SmallVec::<[u64; 4]>::new();
            for _ in ty.results() {
                raw.push(exec.stack.pop()?);
            }
            raw.reverse();
            super::box_results(ty.results(), &raw)
        });
        let result = result.map_err(|err| {
            let backtrace = WasmBacktrace::new(exec.store.backtrace());
            err.with_backtrace(backtrace)
        });

        store.frames.truncate(frames_base);
        store.depth = depth_base;
        result
    }

    fn stack_trace(&self, store: &Store, instance: Instance) -> Vec<FrameInfo> {
        store.frames_of(instance)
    }
}

/// An active function invocation.
struct Frame<'a> {
    func: FuncIndex,
    body: &'a FunctionBody,
    pc: usize,
    locals_base: usize,
    stack_base: usize,
    arity: usize,
    labels_base: usize,
}

/// The branch target of an open `block`, `loop` or `if`.
#[derive(Debug, Clone, Copy)]
struct Label {
    /// Operand stack height below the block's parameters.
    height: usize,
    /// The number of values a branch to this label carries.
    arity: usize,
    /// Position of the `loop` instruction, or of the block's `end`.
    target: usize,
    is_loop: bool,
}

struct Execution<'a> {
    interpreter: &'a Interpreter,
    store: &'a mut Store,
    instance: Instance,
    module: &'a TranslatedModule,
    stack: OperandStack,
    locals: Vec<u64>,
    labels: Vec<Label>,
    frames: Vec<Frame<'a>>,
}

impl<'a> Execution<'a> {
    fn run(&mut self, entry: FuncIndex) -> crate::Result<()> {
        self.push_frame(entry)?;

        while let Some(frame) = self.frames.last_mut() {
            let pc = frame.pc;
            let (func, body) = (frame.func, frame.body);
            let instr = body
                .instructions
                .get(pc)
                .ok_or_else(|| Error::Invalid("execution ran past the end of a function".into()))?;
            frame.pc = pc + 1;

            if let Some(active) = self.store.frames.last_mut() {
                active.instruction_offset = pc;
            }
            if let Some(listener) = &self.interpreter.listener {
                listener.on_instruction(func, pc, instr, &self.stack);
            }

            self.step(instr, pc)?;
        }

        Ok(())
    }

    fn frame(&self) -> crate::Result<&Frame<'a>> {
        self.frames
            .last()
            .ok_or_else(|| Error::Invalid("no active frame".into()))
    }

    fn jump(&mut self, pc: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc = pc;
        }
    }

    fn push_frame(&mut self, func: FuncIndex) -> crate::Result<()> {
        super::enter_frame(self.store, self.interpreter.max_call_depth)?;

        let module = self.module;
        let body = module
            .defined_func_index(func)
            .and_then(|defined| module.function_bodies.get(defined))
            .ok_or_else(|| Error::unknown(EntityKind::Function, func.as_u32()))?;
        let ty = module.func_type(func)?;

        let num_params = ty.params().len();
        let locals_base = self.locals.len();
        let mut params = SmallVec::<[u64; 8]>::with_capacity(num_params);
        for _ in 0..num_params {
            params.push(self.stack.pop()?);
        }
        self.locals.extend(params.into_iter().rev());
        self.locals
            .extend(core::iter::repeat_n(0, body.locals.len()));

        self.frames.push(Frame {
            func,
            body,
            pc: 0,
            locals_base,
            stack_base: self.stack.len(),
            arity: ty.results().len(),
            labels_base: self.labels.len(),
        });
        self.store.frames.push(ActiveFrame {
            instance: self.instance,
            func,
            instruction_offset: 0,
        });
        Ok(())
    }

    fn pop_frame(&mut self) -> crate::Result<()> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| Error::Invalid("no active frame".into()))?;
        self.stack.unwind(frame.stack_base, frame.arity)?;
        self.locals.truncate(frame.locals_base);
        self.labels.truncate(frame.labels_base);
        self.store.frames.pop();
        super::exit_frame(self.store);
        Ok(())
    }

    fn branch(&mut self, depth: u32) -> crate::Result<()> {
        let labels_base = self.frame()?.labels_base;
        let open = self.labels.len() - labels_base;
        let depth = depth as usize;

        if depth == open {
            return self.pop_frame();
        }
        let idx = open
            .checked_sub(depth + 1)
            .map(|idx| labels_base + idx)
            .ok_or_else(|| Error::unknown(EntityKind::Label, depth as u32))?;

        let label = self.labels[idx];
        self.stack.unwind(label.height, label.arity)?;
        self.labels.truncate(if label.is_loop { idx + 1 } else { idx });
        self.jump(label.target + 1);
        Ok(())
    }

    fn push_label(&mut self, params: usize, arity: usize, target: usize, is_loop: bool) -> crate::Result<()> {
        let height = self
            .stack
            .len()
            .checked_sub(params)
            .ok_or_else(|| Error::Invalid("operand stack underflow".into()))?;
        self.labels.push(Label {
            height,
            arity,
            target,
            is_loop,
        });
        Ok(())
    }

    fn local_slot(&self, index: u32) -> crate::Result<usize> {
        let slot = self.frame()?.locals_base + index as usize;
        if slot < self.locals.len() {
            Ok(slot)
        } else {
            Err(Error::unknown(EntityKind::Local, index))
        }
    }

    fn pop_n(&mut self, n: usize) -> crate::Result<SmallVec<[u64; 4]>> {
        let mut values = SmallVec::<[u64; 4]>::with_capacity(n);
        for _ in 0..n {
            values.push(self.stack.pop()?);
        }
        values.reverse();
        Ok(values)
    }

    /// Calls `func` of this instance, pushing a frame for locally defined
    /// functions and calling out for everything else.
    fn call(&mut self, func: FuncIndex) -> crate::Result<()> {
        if self.module.defined_func_index(func).is_some() {
            return self.push_frame(func);
        }
        let handle = self.instance.func(self.store, func)?;
        self.call_handle(handle)
    }

    fn call_handle(&mut self, handle: crate::func::Func) -> crate::Result<()> {
        if let Some((instance, index)) = handle.wasm_target(self.store) {
            if instance == self.instance && self.module.defined_func_index(index).is_some() {
                return self.push_frame(index);
            }
        }

        let num_params = handle.ty_ref(self.store).params().len();
        let args = self.pop_n(num_params)?;
        let results = super::call_boxed(self.store, self.instance, handle, &args)?;
        for value in results {
            self.stack.push(value);
        }
        Ok(())
    }

    fn builtin(&mut self, builtin: BuiltinFunctionIndex, immediates: [u32; 2]) -> crate::Result<()> {
        let args = self.pop_n(builtin.arity())?;
        if let Some(result) = builtin.call(self.store, self.instance, immediates, &args)? {
            self.stack.push(result);
        }
        Ok(())
    }

    #[expect(clippy::too_many_lines, reason = "one arm per instruction")]
    fn step(&mut self, instr: &Instruction, pc: usize) -> crate::Result<()> {
        match instr {
            Instruction::Unreachable => return Err(Trap::UnreachableCodeReached.into()),
            Instruction::Nop => {}
            Instruction::Block { ty, end } => {
                let (params, results) = ty.signature(&self.module.types)?;
                self.push_label(params.len(), results.len(), *end as usize, false)?;
            }
            Instruction::Loop { ty, .. } => {
                let (params, _) = ty.signature(&self.module.types)?;
                self.push_label(params.len(), params.len(), pc, true)?;
            }
            Instruction::If { ty, else_, end } => {
                let condition = self.stack.pop()? as u32;
                let (params, results) = ty.signature(&self.module.types)?;
                self.push_label(params.len(), results.len(), *end as usize, false)?;
                if condition == 0 {
                    // without an else arm, land on the `end` which closes the label
                    self.jump(else_.map_or(*end as usize, |else_| else_ as usize + 1));
                }
            }
            Instruction::Else { end } => self.jump(*end as usize),
            Instruction::End => {
                if self.labels.len() > self.frame()?.labels_base {
                    self.labels.pop();
                } else {
                    self.pop_frame()?;
                }
            }
            Instruction::Br { depth } => self.branch(*depth)?,
            Instruction::BrIf { depth } => {
                if self.stack.pop()? as u32 != 0 {
                    self.branch(*depth)?;
                }
            }
            Instruction::BrTable { targets, default } => {
                let index = self.stack.pop()? as u32 as usize;
                let depth = targets.get(index).copied().unwrap_or(*default);
                self.branch(depth)?;
            }
            Instruction::Return => self.pop_frame()?,
            Instruction::Call { func } => self.call(*func)?,
            Instruction::CallIndirect { ty, table } => {
                let index = self.stack.pop()? as u32;
                let handle = super::indirect_target(self.store, self.instance, *ty, *table, index)?;
                self.call_handle(handle)?;
            }

            Instruction::Drop => {
                self.stack.pop()?;
            }
            Instruction::Select | Instruction::TypedSelect { .. } => {
                let condition = self.stack.pop()? as u32;
                let b = self.stack.pop()?;
                let a = self.stack.pop()?;
                self.stack.push(if condition != 0 { a } else { b });
            }

            Instruction::LocalGet { index } => {
                let slot = self.local_slot(*index)?;
                self.stack.push(self.locals[slot]);
            }
            Instruction::LocalSet { index } => {
                let slot = self.local_slot(*index)?;
                self.locals[slot] = self.stack.pop()?;
            }
            Instruction::LocalTee { index } => {
                let slot = self.local_slot(*index)?;
                self.locals[slot] = self
                    .stack
                    .peek()
                    .ok_or_else(|| Error::Invalid("operand stack underflow".into()))?;
            }
            Instruction::GlobalGet { global } => {
                let value = super::global_get(self.store, self.instance, *global)?;
                self.stack.push(value);
            }
            Instruction::GlobalSet { global } => {
                let value = self.stack.pop()?;
                super::global_set(self.store, self.instance, *global, value)?;
            }

            Instruction::TableGet { .. }
            | Instruction::TableSet { .. }
            | Instruction::TableSize { .. }
            | Instruction::TableGrow { .. }
            | Instruction::TableFill { .. }
            | Instruction::TableCopy { .. }
            | Instruction::TableInit { .. }
            | Instruction::ElemDrop { .. }
            | Instruction::MemorySize
            | Instruction::MemoryGrow
            | Instruction::MemoryInit { .. }
            | Instruction::DataDrop { .. }
            | Instruction::MemoryCopy
            | Instruction::MemoryFill => {
                let (builtin, immediates) = BuiltinFunctionIndex::for_instruction(instr)
                    .ok_or_else(|| Error::Invalid("instruction has no builtin".into()))?;
                self.builtin(builtin, immediates)?;
            }

            Instruction::Load { kind, memarg } => {
                let addr = self.stack.pop()?;
                let value = super::mem_load(self.store, self.instance, *kind, *memarg, addr)?;
                self.stack.push(value);
            }
            Instruction::Store { kind, memarg } => {
                let value = self.stack.pop()?;
                let addr = self.stack.pop()?;
                super::mem_store(self.store, self.instance, *kind, *memarg, addr, value)?;
            }

            Instruction::I32Const { value } => self.stack.push(u64::from(*value as u32)),
            Instruction::I64Const { value } => self.stack.push(*value as u64),
            Instruction::F32Const { bits } => self.stack.push(u64::from(*bits)),
            Instruction::F64Const { bits } => self.stack.push(*bits),

            Instruction::RefNull { .. } => self.stack.push(0),
            Instruction::RefIsNull => {
                let value = self.stack.pop()?;
                self.stack.push(u64::from(value == 0));
            }
            Instruction::RefFunc { func } => {
                let value = super::ref_func(self.store, self.instance, *func)?;
                self.stack.push(value);
            }

            Instruction::Numeric(op) => match ops::lookup(*op) {
                OpFn::Unary(f) => {
                    let a = self.stack.pop()?;
                    self.stack.push(f(a)?);
                }
                OpFn::Binary(f) => {
                    let b = self.stack.pop()?;
                    let a = self.stack.pop()?;
                    self.stack.push(f(a, b)?);
                }
            },
        }
        Ok(())
    }
}
