// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{BACKENDS, call, instantiate};
use kwrt::{
    Backend, Config, Engine, ExecutionListener, FuncIndex, Instruction, Linker, OperandStack,
    Val,
};

const ARITH: &str = r#"
(module
  (func (export "add") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.add)

  (func $fac (export "fac") (param i64) (result i64)
    local.get 0
    i64.eqz
    if (result i64)
      i64.const 1
    else
      local.get 0
      local.get 0
      i64.const 1
      i64.sub
      call $fac
      i64.mul
    end)

  (func (export "sum") (param i32) (result i32) (local i32)
    block
      loop
        local.get 0
        i32.eqz
        br_if 1
        local.get 1
        local.get 0
        i32.add
        local.set 1
        local.get 0
        i32.const 1
        i32.sub
        local.set 0
        br 0
      end
    end
    local.get 1)

  (func (export "classify") (param i32) (result i32)
    block
      block
        block
          local.get 0
          br_table 0 1 2
        end
        i32.const 100
        return
      end
      i32.const 200
      return
    end
    i32.const 300)

  (func (export "swap") (param i32 i32) (result i32 i32)
    local.get 1
    local.get 0)

  (func (export "pick") (param i32) (result f64)
    f64.const 1.5
    f64.const -2.5
    local.get 0
    select))
"#;

#[test]
fn add() {
    for backend in BACKENDS {
        let (mut store, instance) = instantiate(backend, ARITH);
        let results = call(&mut store, instance, "add", &[Val::I32(20), Val::I32(22)]).unwrap();
        assert_eq!(results, vec![Val::I32(42)], "{backend:?}");
    }
}

#[test]
fn recursion_and_loops() {
    for backend in BACKENDS {
        let (mut store, instance) = instantiate(backend, ARITH);
        assert_eq!(
            call(&mut store, instance, "fac", &[Val::I64(10)]).unwrap(),
            vec![Val::I64(3_628_800)]
        );
        assert_eq!(
            call(&mut store, instance, "sum", &[Val::I32(100)]).unwrap(),
            vec![Val::I32(5050)]
        );
    }
}

#[test]
fn branch_tables() {
    for backend in BACKENDS {
        let (mut store, instance) = instantiate(backend, ARITH);
        for (input, expected) in [(0, 100), (1, 200), (2, 300), (7, 300)] {
            assert_eq!(
                call(&mut store, instance, "classify", &[Val::I32(input)]).unwrap(),
                vec![Val::I32(expected)],
                "{backend:?} classify({input})"
            );
        }
    }
}

#[test]
fn multiple_results_and_select() {
    for backend in BACKENDS {
        let (mut store, instance) = instantiate(backend, ARITH);
        assert_eq!(
            call(&mut store, instance, "swap", &[Val::I32(1), Val::I32(2)]).unwrap(),
            vec![Val::I32(2), Val::I32(1)]
        );
        assert_eq!(
            call(&mut store, instance, "pick", &[Val::I32(0)]).unwrap(),
            vec![Val::F64((-2.5f64).to_bits())]
        );
    }
}

#[test]
fn repeated_calls_are_independent() {
    for backend in BACKENDS {
        let (mut store, instance) = instantiate(backend, ARITH);
        let first = call(&mut store, instance, "fac", &[Val::I64(5)]).unwrap();
        let second = call(&mut store, instance, "fac", &[Val::I64(5)]).unwrap();
        assert_eq!(first, second);
    }
}

#[test]
fn memory_and_globals() {
    let wat = r#"
    (module
      (memory (export "mem") 1)
      (global $counter (export "counter") (mut i32) (i32.const 0))
      (data (i32.const 16) "\2a\00\00\00")
      (func (export "roundtrip") (param i32 i64) (result i64)
        local.get 0
        local.get 1
        i64.store offset=8
        local.get 0
        i64.load offset=8)
      (func (export "bump") (result i32)
        global.get $counter
        i32.const 1
        i32.add
        global.set $counter
        global.get $counter)
      (func (export "grow") (result i32)
        i32.const 2
        memory.grow
        drop
        memory.size)
      (func (export "signed") (result i32)
        i32.const 0
        i32.const 0xff
        i32.store8
        i32.const 0
        i32.load8_s))
    "#;

    for backend in BACKENDS {
        let (mut store, instance) = instantiate(backend, wat);
        assert_eq!(
            call(&mut store, instance, "roundtrip", &[Val::I32(100), Val::I64(-7)]).unwrap(),
            vec![Val::I64(-7)]
        );
        call(&mut store, instance, "bump", &[]).unwrap();
        assert_eq!(call(&mut store, instance, "bump", &[]).unwrap(), vec![Val::I32(2)]);
        assert_eq!(
            instance.get_global(&store, "counter").unwrap().get(&store),
            Val::I32(2)
        );
        assert_eq!(call(&mut store, instance, "grow", &[]).unwrap(), vec![Val::I32(3)]);
        assert_eq!(call(&mut store, instance, "signed", &[]).unwrap(), vec![Val::I32(-1)]);

        let memory = instance.get_memory(&store, "mem").unwrap();
        let mut buf = [0; 4];
        memory.read(&store, 16, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 42);
    }
}

#[test]
fn bulk_memory_and_tables() {
    let wat = r#"
    (module
      (memory 1)
      (table $t 4 funcref)
      (data $d "hello")
      (elem $e func $one $two)
      (func $one (result i32) i32.const 1)
      (func $two (result i32) i32.const 2)
      (func (export "init_and_copy") (result i32)
        i32.const 10
        i32.const 0
        i32.const 5
        memory.init $d
        data.drop $d
        i32.const 20
        i32.const 10
        i32.const 5
        memory.copy
        i32.const 30
        i32.const 0x21
        i32.const 3
        memory.fill
        i32.const 24
        i32.load8_u
        i32.const 32
        i32.load8_u
        i32.add)
      (func (export "tables") (result i32)
        i32.const 1
        i32.const 0
        i32.const 2
        table.init $t $e
        elem.drop $e
        ref.null func
        i32.const 3
        table.grow $t
        drop
        table.size $t
        i32.const 2
        call_indirect (result i32)
        i32.add))
    "#;

    for backend in BACKENDS {
        let (mut store, instance) = instantiate(backend, wat);
        // 'o' + '!'
        assert_eq!(
            call(&mut store, instance, "init_and_copy", &[]).unwrap(),
            vec![Val::I32(0x6f + 0x21)]
        );
        assert_eq!(call(&mut store, instance, "tables", &[]).unwrap(), vec![Val::I32(9)]);
    }
}

#[derive(Default)]
struct CountingListener {
    instructions: AtomicUsize,
    max_depth: AtomicUsize,
}

impl ExecutionListener for CountingListener {
    fn on_instruction(&self, _func: FuncIndex, _pc: usize, _instr: &Instruction, stack: &OperandStack) {
        self.instructions.fetch_add(1, Ordering::Relaxed);
        self.max_depth.fetch_max(stack.len(), Ordering::Relaxed);
    }
}

#[test]
fn listener_observes_every_instruction() {
    let listener = Arc::new(CountingListener::default());
    let mut config = Config::new();
    config.backend(Backend::Interpreter).listener(listener.clone());
    let engine = Engine::new(config);

    let (mut store, instance) = common::instantiate_with(&engine, &Linker::new(&engine), ARITH);
    call(&mut store, instance, "add", &[Val::I32(1), Val::I32(2)]).unwrap();

    // local.get, local.get, i32.add, end
    assert_eq!(listener.instructions.load(Ordering::Relaxed), 4);
    assert_eq!(listener.max_depth.load(Ordering::Relaxed), 2);
}
