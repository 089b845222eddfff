// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use common::{BACKENDS, call, engine, instantiate_with};
use kwrt::{
    Backend, EntityKind, Error, Extern, FuncIndex, FuncType, Global, GlobalType, Linker, Module,
    Mutability, Ref, RefType, Store, Table, TableType, Trap, Val, ValType,
};

#[test]
fn imported_global_initializes_a_global() {
    let wat = r#"
    (module
      (import "env" "base" (global $base i32))
      (global $g (export "g") i32 (global.get $base))
      (func (export "get") (result i32) global.get $g))
    "#;

    for backend in BACKENDS {
        let engine = engine(backend);
        let mut store = Store::new(&engine);
        let mut linker = Linker::new(&engine);
        let base = Global::new(
            &mut store,
            GlobalType::new(ValType::I32, Mutability::Const),
            Val::I32(41),
        )
        .unwrap();
        linker.define("env", "base", base).unwrap();

        let module = Module::from_bytes(&engine, &wat::parse_str(wat).unwrap()).unwrap();
        let instance = linker.instantiate(&mut store, &module).unwrap();
        assert_eq!(call(&mut store, instance, "get", &[]).unwrap(), vec![Val::I32(41)]);
    }
}

#[test]
fn mutable_imports_are_not_constant() {
    let wat = r#"
    (module
      (import "env" "base" (global $base (mut i32)))
      (global i32 (global.get $base)))
    "#;

    let engine = engine(Backend::Interpreter);
    let mut store = Store::new(&engine);
    let mut linker = Linker::new(&engine);
    let base = Global::new(
        &mut store,
        GlobalType::new(ValType::I32, Mutability::Var),
        Val::I32(41),
    )
    .unwrap();
    linker.define("env", "base", base).unwrap();

    let module = Module::from_bytes(&engine, &wat::parse_str(wat).unwrap()).unwrap();
    let err = linker.instantiate(&mut store, &module).unwrap_err();
    assert!(matches!(err, Error::InvalidConstExpr(_)), "{err}");
}

#[test]
fn active_elements_land_at_their_offset() {
    let wat = r#"
    (module
      (table (export "table") 4 funcref)
      (elem (i32.const 1) $f $f)
      (func $f (result i32) i32.const 1))
    "#;

    for backend in BACKENDS {
        let engine = engine(backend);
        let (store, instance) = instantiate_with(&engine, &Linker::new(&engine), wat);
        let table = instance.get_table(&store, "table").unwrap();

        assert_eq!(table.size(&store), 4);
        assert!(table.get(&store, 0).unwrap().is_null());
        assert!(!table.get(&store, 1).unwrap().is_null());
        assert!(!table.get(&store, 2).unwrap().is_null());
        assert!(table.get(&store, 3).unwrap().is_null());
        assert!(table.get(&store, 4).is_none());
    }
}

#[test]
fn out_of_bounds_segments_fail_instantiation() {
    let wat = r#"
    (module
      (memory 1)
      (data (i32.const 65535) "ab"))
    "#;

    let engine = engine(Backend::Interpreter);
    let bytes = wat::parse_str(wat).unwrap();
    let module = Module::from_bytes(&engine, &bytes).unwrap();
    let mut store = Store::new(&engine);
    let err = Linker::new(&engine)
        .instantiate(&mut store, &module)
        .unwrap_err();
    assert_eq!(err.trap(), Some(Trap::MemoryOutOfBounds));
}

#[test]
fn missing_imports_and_exports() {
    let wat = r#"
    (module
      (import "env" "missing" (func))
      (func (export "f")))
    "#;

    let engine = engine(Backend::Interpreter);
    let module = Module::from_bytes(&engine, &wat::parse_str(wat).unwrap()).unwrap();
    let mut store = Store::new(&engine);
    let err = Linker::new(&engine)
        .instantiate(&mut store, &module)
        .unwrap_err();
    assert!(
        matches!(
            &err,
            Error::MissingImport { module, field, kind: EntityKind::Function }
                if module == "env" && field == "missing"
        ),
        "{err}"
    );

    let (store, instance) = instantiate_with(
        &engine,
        &Linker::new(&engine),
        r#"(module (func (export "f")))"#,
    );
    assert!(matches!(
        instance.export(&store, "nope"),
        Err(Error::UnknownExport(name)) if name == "nope"
    ));
}

#[test]
fn imports_are_type_checked() {
    let wat = r#"(module (import "env" "f" (func (param i32))))"#;

    let engine = engine(Backend::Interpreter);
    let mut linker = Linker::new(&engine);
    linker
        .func_new("env", "f", FuncType::new([ValType::I64], []), |_, _| Ok(vec![]))
        .unwrap();

    let module = Module::from_bytes(&engine, &wat::parse_str(wat).unwrap()).unwrap();
    let mut store = Store::new(&engine);
    let err = linker.instantiate(&mut store, &module).unwrap_err();
    assert!(matches!(err, Error::IncompatibleImport { .. }), "{err}");
}

#[test]
fn host_functions() {
    let wat = r#"
    (module
      (import "env" "double" (func $double (param i32) (result i32)))
      (import "env" "fail" (func $fail))
      (func (export "quad") (param i32) (result i32)
        local.get 0
        call $double
        call $double)
      (func (export "fail") call $fail))
    "#;

    for backend in BACKENDS {
        let engine = engine(backend);
        let calls = Arc::new(AtomicU32::new(0));
        let mut linker = Linker::new(&engine);
        let counter = calls.clone();
        linker
            .func_new(
                "env",
                "double",
                FuncType::new([ValType::I32], [ValType::I32]),
                move |_, args| {
                    counter.fetch_add(1, Ordering::Relaxed);
                    let Val::I32(x) = args[0] else {
                        anyhow::bail!("expected an i32");
                    };
                    Ok(vec![Val::I32(x * 2)])
                },
            )
            .unwrap()
            .func_new("env", "fail", FuncType::new([], []), |_, _| {
                anyhow::bail!("host said no")
            })
            .unwrap();

        let (mut store, instance) = instantiate_with(&engine, &linker, wat);
        assert_eq!(
            call(&mut store, instance, "quad", &[Val::I32(5)]).unwrap(),
            vec![Val::I32(20)]
        );
        assert_eq!(calls.load(Ordering::Relaxed), 2);

        let err = call(&mut store, instance, "fail", &[]).unwrap_err();
        assert_eq!(err.trap(), Some(Trap::HostFunctionFailed), "{err}");
        assert_eq!(err.host_cause().unwrap().to_string(), "host said no");

        // the interpreter records the calling frame, compiled code reports none
        let Error::Trap { backtrace, .. } = &err else {
            panic!("expected a trap, got {err}");
        };
        if backend == Backend::Interpreter {
            let [frame] = backtrace.frames() else {
                panic!("unexpected backtrace {backtrace}");
            };
            assert_eq!(frame.func_index, FuncIndex::from_u32(3));
            assert_eq!(frame.instruction_offset, 0);
        } else {
            assert!(backtrace.is_empty());
        }

        // the instance stays usable after the host failure
        assert_eq!(
            call(&mut store, instance, "quad", &[Val::I32(1)]).unwrap(),
            vec![Val::I32(4)]
        );
    }
}

#[test]
fn host_functions_can_call_back_into_wasm() {
    let wat = r#"
    (module
      (import "env" "twice" (func $twice (result i32)))
      (func (export "one") (result i32) i32.const 1)
      (func (export "run") (result i32) call $twice))
    "#;

    for backend in BACKENDS {
        let engine = engine(backend);
        let mut linker = Linker::new(&engine);
        linker
            .func_new("env", "twice", FuncType::new([], [ValType::I32]), |mut caller, _| {
                let Some(Extern::Func(one)) = caller.get_export("one") else {
                    anyhow::bail!("missing export one");
                };
                let a = one.call(caller.store(), &[])?;
                let b = one.call(caller.store(), &[])?;
                match (a[0], b[0]) {
                    (Val::I32(a), Val::I32(b)) => Ok(vec![Val::I32(a + b)]),
                    _ => anyhow::bail!("unexpected results"),
                }
            })
            .unwrap();

        let (mut store, instance) = instantiate_with(&engine, &linker, wat);
        assert_eq!(call(&mut store, instance, "run", &[]).unwrap(), vec![Val::I32(2)]);
    }
}

#[test]
fn instances_link_against_each_other() {
    let provider = r#"
    (module
      (memory (export "mem") 1)
      (table (export "table") 2 funcref)
      (elem (i32.const 0) $seven)
      (func $seven (export "seven") (result i32) i32.const 7)
      (func (export "poke") (param i32 i32)
        local.get 0
        local.get 1
        i32.store))
    "#;
    let consumer = r#"
    (module
      (import "provider" "seven" (func $seven (result i32)))
      (import "provider" "poke" (func $poke (param i32 i32)))
      (import "provider" "mem" (memory 1))
      (import "provider" "table" (table 2 funcref))
      (func (export "run") (result i32)
        i32.const 8
        call $seven
        call $poke
        i32.const 8
        i32.load
        i32.const 0
        call_indirect (result i32)
        i32.add))
    "#;

    for backend in BACKENDS {
        let engine = engine(backend);
        let mut linker = Linker::new(&engine);
        let (mut store, provider) = instantiate_with(&engine, &linker, provider);
        linker.define_instance(&store, "provider", provider).unwrap();

        let module = Module::from_bytes(&engine, &wat::parse_str(consumer).unwrap()).unwrap();
        let consumer = linker.instantiate(&mut store, &module).unwrap();
        assert_eq!(call(&mut store, consumer, "run", &[]).unwrap(), vec![Val::I32(14)]);

        let memory = provider.get_memory(&store, "mem").unwrap();
        assert_eq!(memory.data(&store)[8], 7);
    }
}

#[test]
fn host_tables_can_be_imported() {
    let wat = r#"
    (module
      (import "env" "table" (table 2 funcref))
      (func (export "size") (result i32) table.size 0))
    "#;

    let engine = engine(Backend::Aot);
    let mut store = Store::new(&engine);
    let table = Table::new(
        &mut store,
        TableType::new(RefType::Func, 3, None),
        Ref::null(RefType::Func),
    )
    .unwrap();
    let mut linker = Linker::new(&engine);
    linker.define("env", "table", table).unwrap();

    let module = Module::from_bytes(&engine, &wat::parse_str(wat).unwrap()).unwrap();
    let instance = linker.instantiate(&mut store, &module).unwrap();
    assert_eq!(call(&mut store, instance, "size", &[]).unwrap(), vec![Val::I32(3)]);
}

#[test]
fn invalid_function_bodies_are_rejected() {
    let wat = r#"
    (module
      (func (result i32)
        i32.const 1
        i64.const 2
        i32.add))
    "#;

    for backend in BACKENDS {
        let engine = engine(backend);
        let module = Module::from_bytes(&engine, &wat::parse_str(wat).unwrap()).unwrap();
        let mut store = Store::new(&engine);
        let err = Linker::new(&engine)
            .instantiate(&mut store, &module)
            .unwrap_err();
        assert!(
            matches!(
                err,
                Error::TypeMismatch {
                    expected: ValType::I32,
                    actual: ValType::I64
                }
            ),
            "{err}"
        );
    }
}

#[test]
fn start_function_runs_during_instantiation() {
    let wat = r#"
    (module
      (global $g (export "g") (mut i32) (i32.const 0))
      (func $start
        i32.const 99
        global.set $g)
      (start $start))
    "#;

    for backend in BACKENDS {
        let engine = engine(backend);
        let (store, instance) = instantiate_with(&engine, &Linker::new(&engine), wat);
        let global = instance.get_global(&store, "g").unwrap();
        assert_eq!(global.get(&store), Val::I32(99));
    }
}

#[test]
fn failed_instantiation_leaves_runnable_table_entries() {
    let failing = r#"
    (module
      (import "env" "table" (table 2 funcref))
      (global $base i32 (i32.const 41))
      (memory 1)
      (func $answer (result i32) global.get $base i32.const 1 i32.add)
      (elem (i32.const 1) $answer)
      (data (i32.const 65535) "ab"))
    "#;
    let caller = r#"
    (module
      (import "env" "table" (table 2 funcref))
      (func (export "run") (result i32)
        i32.const 1
        call_indirect (result i32)))
    "#;

    for backend in BACKENDS {
        let engine = engine(backend);
        let mut store = Store::new(&engine);
        let table = Table::new(
            &mut store,
            TableType::new(RefType::Func, 2, None),
            Ref::null(RefType::Func),
        )
        .unwrap();
        let mut linker = Linker::new(&engine);
        linker.define("env", "table", table).unwrap();

        let module = Module::from_bytes(&engine, &wat::parse_str(failing).unwrap()).unwrap();
        let err = linker.instantiate(&mut store, &module).unwrap_err();
        assert_eq!(err.trap(), Some(Trap::MemoryOutOfBounds), "{err}");

        // the element segment was applied before the data segment failed
        let Some(Ref::Func(Some(answer))) = table.get(&store, 1) else {
            panic!("expected a function in slot 1");
        };
        assert_eq!(answer.call(&mut store, &[]).unwrap(), vec![Val::I32(42)]);

        let module = Module::from_bytes(&engine, &wat::parse_str(caller).unwrap()).unwrap();
        let caller = linker.instantiate(&mut store, &module).unwrap();
        assert_eq!(call(&mut store, caller, "run", &[]).unwrap(), vec![Val::I32(42)]);
    }
}

#[test]
fn out_of_bounds_elements_write_nothing() {
    let wat = r#"
    (module
      (import "env" "table" (table 2 funcref))
      (func $f)
      (elem (i32.const 0) $f)
      (elem (i32.const 1) $f $f))
    "#;

    for backend in BACKENDS {
        let engine = engine(backend);
        let mut store = Store::new(&engine);
        let table = Table::new(
            &mut store,
            TableType::new(RefType::Func, 2, None),
            Ref::null(RefType::Func),
        )
        .unwrap();
        let mut linker = Linker::new(&engine);
        linker.define("env", "table", table).unwrap();

        let module = Module::from_bytes(&engine, &wat::parse_str(wat).unwrap()).unwrap();
        let err = linker.instantiate(&mut store, &module).unwrap_err();
        assert_eq!(err.trap(), Some(Trap::TableOutOfBounds), "{err}");
        assert!(table.get(&store, 0).unwrap().is_null());
    }
}
