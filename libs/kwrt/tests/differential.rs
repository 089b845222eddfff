// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Both backends must agree on every result and every trap, including for
//! deep block nesting and deep recursion.

mod common;

use common::{call, instantiate, instantiate_with};
use kwrt::{Backend, Config, Engine, Instance, Linker, Store, Trap, Val};
use proptest::prelude::*;

const NUMERIC: &str = r#"
(module
  (func (export "i32_mix") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.mul
    local.get 0
    local.get 1
    i32.rotl
    i32.xor
    local.get 1
    i32.shr_s
    local.get 0
    i32.clz
    i32.add)
  (func (export "i32_div") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.rem_s
    local.get 0
    local.get 1
    i32.div_u
    i32.sub)
  (func (export "i64_mix") (param i64 i64) (result i64)
    local.get 0
    local.get 1
    i64.sub
    local.get 1
    i64.popcnt
    i64.shl
    local.get 0
    i64.extend32_s
    i64.lt_u
    i64.extend_i32_u)
  (func (export "f32_mix") (param f32 f32) (result f32)
    local.get 0
    local.get 1
    f32.mul
    local.get 0
    f32.nearest
    f32.min
    local.get 1
    f32.sqrt
    f32.copysign)
  (func (export "f64_mix") (param f64 f64) (result f64)
    local.get 0
    local.get 1
    f64.div
    local.get 1
    f64.floor
    f64.max
    f32.demote_f64
    f64.promote_f32)
  (func (export "trunc") (param f64) (result i64)
    local.get 0
    i64.trunc_f64_s
    local.get 0
    i32.trunc_sat_f64_u
    i64.extend_i32_u
    i64.add))
"#;

const CONTROL: &str = r#"
(module
  (func $pair (param i32) (result i32 i32)
    local.get 0
    local.get 0
    i32.const 1
    i32.add)
  (func (export "block_params") (param i32 i32) (result i32 i32)
    local.get 0
    local.get 1
    block (param i32 i32) (result i32 i32)
      i32.add
      local.get 0
      local.get 1
      i32.add
    end)
  (func (export "loop_params") (param i32) (result i32)
    local.get 0
    loop (param i32) (result i32)
      i32.const 1
      i32.sub
      local.tee 0
      local.get 0
      br_if 0
    end)
  (func (export "if_params") (param i32 i32) (result i32)
    local.get 1
    local.get 0
    if (param i32) (result i32)
      i32.const 10
      i32.add
    else
      i32.const 2
      i32.mul
    end)
  (func (export "deep_br") (param i32) (result i32)
    block (result i32)
      block (result i32)
        block (result i32)
          i32.const 5
          local.get 0
          br_table 0 1 2
        end
        i32.const 100
        i32.add
      end
      i32.const 200
      i32.add
    end
    i32.const 1000
    i32.add)
  (func (export "multi_br") (param i32) (result i32 i32)
    block (result i32 i32)
      block (result i32)
        i32.const 1
        i32.const 2
        i32.const 3
        local.get 0
        br_if 1
        drop
        drop
      end
      i32.const 4
    end)
  (func (export "early_return") (param i32) (result i32)
    block
      loop
        local.get 0
        i32.const 3
        i32.gt_s
        if
          local.get 0
          return
        end
        local.get 0
        i32.const 1
        i32.add
        local.set 0
        br 0
      end
    end
    i32.const -1)
  (func (export "call_multi") (param i32) (result i32)
    i32.const 100
    local.get 0
    call $pair
    i32.sub
    i32.add))
"#;

const RECURSION: &str = r#"
(module
  (func $count (export "count") (param i32) (result i32)
    local.get 0
    i32.eqz
    if (result i32)
      i32.const 0
    else
      local.get 0
      i32.const 1
      i32.sub
      call $count
      i32.const 1
      i32.add
    end))
"#;

struct Pair {
    interpreter: (Store, Instance),
    aot: (Store, Instance),
}

impl Pair {
    fn new(wat: &str) -> Self {
        Self {
            interpreter: instantiate(Backend::Interpreter, wat),
            aot: instantiate(Backend::Aot, wat),
        }
    }

    fn with_call_depth(wat: &str, max_call_depth: u32) -> Self {
        let build = |backend| {
            let mut config = Config::new();
            config.backend(backend).max_call_depth(max_call_depth);
            let engine = Engine::new(config);
            instantiate_with(&engine, &Linker::new(&engine), wat)
        };
        Self {
            interpreter: build(Backend::Interpreter),
            aot: build(Backend::Aot),
        }
    }

    /// Calls `name` on both backends, returning the shared outcome.
    fn run(&mut self, name: &str, args: &[Val]) -> Result<Vec<Val>, Option<Trap>> {
        let (store, instance) = &mut self.interpreter;
        let expected = call(store, *instance, name, args).map_err(|err| err.trap());
        let (store, instance) = &mut self.aot;
        let actual = call(store, *instance, name, args).map_err(|err| err.trap());
        assert_eq!(expected, actual, "{name}({args:?})");
        expected
    }

    fn check(&mut self, name: &str, args: &[Val]) -> Result<(), TestCaseError> {
        let (store, instance) = &mut self.interpreter;
        let expected = call(store, *instance, name, args).map_err(|err| err.trap());
        let (store, instance) = &mut self.aot;
        let actual = call(store, *instance, name, args).map_err(|err| err.trap());
        prop_assert_eq!(expected, actual, "{}({:?})", name, args);
        Ok(())
    }
}

#[test]
fn structured_control_flow() {
    let mut pair = Pair::new(CONTROL);
    assert_eq!(
        pair.run("block_params", &[Val::I32(3), Val::I32(4)]),
        Ok(vec![Val::I32(7), Val::I32(7)])
    );
    assert_eq!(pair.run("loop_params", &[Val::I32(5)]), Ok(vec![Val::I32(0)]));
    assert_eq!(pair.run("if_params", &[Val::I32(0), Val::I32(5)]), Ok(vec![Val::I32(10)]));
    assert_eq!(pair.run("if_params", &[Val::I32(1), Val::I32(5)]), Ok(vec![Val::I32(15)]));
    assert_eq!(pair.run("deep_br", &[Val::I32(0)]), Ok(vec![Val::I32(1305)]));
    assert_eq!(pair.run("deep_br", &[Val::I32(1)]), Ok(vec![Val::I32(1205)]));
    assert_eq!(pair.run("deep_br", &[Val::I32(2)]), Ok(vec![Val::I32(1005)]));
    assert_eq!(pair.run("deep_br", &[Val::I32(-1)]), Ok(vec![Val::I32(1005)]));
    assert_eq!(
        pair.run("multi_br", &[Val::I32(1)]),
        Ok(vec![Val::I32(2), Val::I32(3)])
    );
    assert_eq!(
        pair.run("multi_br", &[Val::I32(0)]),
        Ok(vec![Val::I32(1), Val::I32(4)])
    );
    assert_eq!(pair.run("early_return", &[Val::I32(-2)]), Ok(vec![Val::I32(4)]));
    assert_eq!(pair.run("early_return", &[Val::I32(9)]), Ok(vec![Val::I32(9)]));
    assert_eq!(pair.run("call_multi", &[Val::I32(41)]), Ok(vec![Val::I32(99)]));
}

#[test]
fn deeply_nested_blocks() {
    let depth = 20_000;
    let wat = format!(
        "(module (func (export \"nested\") (result i32) i32.const 7 {} i32.const 1 i32.add br {} {}))",
        "block (param i32) (result i32) ".repeat(depth),
        depth - 1,
        "end ".repeat(depth)
    );
    let mut pair = Pair::new(&wat);
    assert_eq!(pair.run("nested", &[]), Ok(vec![Val::I32(8)]));
}

#[test]
fn deep_recursion_within_the_call_depth() {
    let mut pair = Pair::with_call_depth(RECURSION, 100_000);
    assert_eq!(pair.run("count", &[Val::I32(50_000)]), Ok(vec![Val::I32(50_000)]));

    let mut pair = Pair::new(RECURSION);
    assert_eq!(pair.run("count", &[Val::I32(200)]), Ok(vec![Val::I32(200)]));
    assert_eq!(pair.run("count", &[Val::I32(1_000)]), Err(Some(Trap::StackOverflow)));
    // both backends recover after exhausting the call depth
    assert_eq!(pair.run("count", &[Val::I32(3)]), Ok(vec![Val::I32(3)]));
}

proptest! {
    #[test]
    fn i32_ops(a in any::<i32>(), b in any::<i32>()) {
        let mut pair = Pair::new(NUMERIC);
        pair.check("i32_mix", &[Val::I32(a), Val::I32(b)])?;
        pair.check("i32_div", &[Val::I32(a), Val::I32(b)])?;
    }

    #[test]
    fn i32_division_edges(a in prop_oneof![Just(i32::MIN), any::<i32>()], b in -1..=1i32) {
        Pair::new(NUMERIC).check("i32_div", &[Val::I32(a), Val::I32(b)])?;
    }

    #[test]
    fn i64_ops(a in any::<i64>(), b in any::<i64>()) {
        Pair::new(NUMERIC).check("i64_mix", &[Val::I64(a), Val::I64(b)])?;
    }

    #[test]
    fn f32_ops(a in any::<u32>(), b in any::<u32>()) {
        Pair::new(NUMERIC).check("f32_mix", &[Val::F32(a), Val::F32(b)])?;
    }

    #[test]
    fn f64_ops(a in any::<f64>(), b in any::<f64>()) {
        Pair::new(NUMERIC).check("f64_mix", &[Val::F64(a.to_bits()), Val::F64(b.to_bits())])?;
    }

    #[test]
    fn counted_loops(n in 1..500i32, x in -100..100i32) {
        let mut pair = Pair::new(CONTROL);
        pair.check("loop_params", &[Val::I32(n)])?;
        pair.check("early_return", &[Val::I32(x)])?;
        pair.check("deep_br", &[Val::I32(x)])?;
        pair.check("multi_br", &[Val::I32(x)])?;
        pair.check("call_multi", &[Val::I32(x)])?;
    }

    #[test]
    fn truncation(a in prop_oneof![any::<f64>(), -1e19..1e19f64, Just(f64::NAN)]) {
        Pair::new(NUMERIC).check("trunc", &[Val::F64(a.to_bits())])?;
    }
}
