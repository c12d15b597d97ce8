mod common;

use common::{exit_u64, machine, run_to_exit, sig};
use ssavm_core::ir::{
    BinAlu, CastOp, FunctionBuilder, InstKind, Module, Operand, SourceLoc, Type,
};
use ssavm_core::ExitReason;

#[test]
fn alloca_store_load_round_trip() {
    // alloca i32; store i32 7; load i32 — exactly one of each hook fires,
    // and the frame pop releases the allocation.
    let i32t = Type::int(32);
    let mut module = Module::default();
    let mut fb = FunctionBuilder::new("main", sig(vec![], i32t.clone()));
    let p = fb.push(InstKind::Alloca { ty: i32t.clone(), count: Operand::int(32, 1), align: 4 });
    fb.push_void(InstKind::Store {
        value: Operand::int(32, 7),
        value_ty: i32t.clone(),
        ptr: Operand::value(p, Type::Ptr),
    });
    let v = fb.push(InstKind::Load { ptr: Operand::value(p, Type::Ptr), ty: i32t.clone() });
    fb.push_void(InstKind::Ret {
        value: Some(Operand::value(v, i32t.clone())),
        ty: i32t,
    });
    let f = module.add_function(fb.finish());

    let mut m = machine(module);
    m.create_thread(1, f, vec![]).expect("create");
    run_to_exit(&mut m, 1, 8);
    assert_eq!(exit_u64(&m, 1), 7);

    let stats = m.oracle().stats;
    assert_eq!(stats.mallocs, 1);
    assert_eq!(stats.stores, 1);
    assert_eq!(stats.loads, 1);
    assert_eq!(stats.frees, 1, "frame pop must free the alloca");
    assert_eq!(m.oracle().live_allocations(), 0);
}

#[test]
fn gep_reaches_oracle_with_byte_delta() {
    // gep i32, ptr %p, i64 3 asks the oracle for a 12-byte move.
    let i32t = Type::int(32);
    let mut module = Module::default();
    let mut fb = FunctionBuilder::new("main", sig(vec![], Type::Void));
    let p = fb.push(InstKind::Alloca { ty: i32t.clone(), count: Operand::int(32, 4), align: 4 });
    fb.push(InstKind::Gep {
        base: Operand::value(p, Type::Ptr),
        source_ty: i32t,
        indices: vec![Operand::int(64, 3)],
    });
    fb.push_void(InstKind::Ret { value: None, ty: Type::Void });
    let f = module.add_function(fb.finish());

    let mut m = machine(module);
    m.create_thread(1, f, vec![]).expect("create");
    run_to_exit(&mut m, 1, 8);

    let geps = &m.oracle().geps;
    assert_eq!(geps.len(), 1);
    let (base, delta) = geps[0];
    assert_eq!(delta, 12);
    assert!(!base.prov.is_null(), "gep base keeps the alloca's provenance");
}

#[test]
fn terminate_thread_frees_allocas_lifo() {
    // main allocas, then parks in a helper that also allocas and spins.
    let i32t = Type::int(32);
    let mut module = Module::default();

    let mut helper = FunctionBuilder::new("helper", sig(vec![], Type::Void));
    let spin = helper.new_block();
    helper.push(InstKind::Alloca { ty: i32t.clone(), count: Operand::int(32, 1), align: 4 });
    helper.push_void(InstKind::Br { dest: spin });
    helper.switch_to(spin);
    helper.push_void(InstKind::Br { dest: spin });
    let helper_f = module.add_function(helper.finish());

    let mut fb = FunctionBuilder::new("main", sig(vec![], Type::Void));
    fb.push(InstKind::Alloca { ty: i32t.clone(), count: Operand::int(32, 1), align: 4 });
    fb.push_void(InstKind::Call {
        callee: Operand::Const { value: ssavm_core::ir::Const::Func { id: helper_f } },
        sig: sig(vec![], Type::Void),
        args: vec![],
        normal: None,
    });
    fb.push_void(InstKind::Ret { value: None, ty: Type::Void });
    let f = module.add_function(fb.finish());

    let mut m = machine(module);
    m.create_thread(1, f, vec![]).expect("create");
    // Run far enough that both allocas exist and the helper is spinning.
    for _ in 0..8 {
        m.step_thread(1, None).expect("step");
    }
    assert_eq!(m.oracle().stats.mallocs, 2);
    assert_eq!(m.oracle().stats.frees, 0);

    m.terminate_thread(1).expect("terminate");
    let oracle = m.oracle();
    assert_eq!(oracle.stats.frees, 2, "both frames' allocas are released");
    // LIFO across frames: the helper's (younger) allocation goes first.
    assert_eq!(oracle.freed, vec![2, 1]);
    assert_eq!(oracle.live_allocations(), 0);
    assert!(!m.has_thread(1));
}

#[test]
fn memory_error_latches_flag_and_captures_trace() {
    // An invoke whose callee faults: the trace carries the faulting load's
    // location and then the invoke's, top frame first.
    let i32t = Type::int(32);
    let mut module = Module::default();

    let load_loc =
        SourceLoc { dir: "/src".into(), file: "callee.c".into(), line: 4, col: 3 };
    let invoke_loc =
        SourceLoc { dir: "/src".into(), file: "main.c".into(), line: 21, col: 9 };

    let mut callee = FunctionBuilder::new("callee", sig(vec![], i32t.clone()));
    let bad = callee.push(InstKind::Cast {
        cast: CastOp::IntToPtr,
        src_ty: Type::int(64),
        src: Operand::int(64, 4),
        to: Type::Ptr,
    });
    let loaded = callee.push_at(
        InstKind::Load { ptr: Operand::value(bad, Type::Ptr), ty: i32t.clone() },
        load_loc.clone(),
    );
    callee.push_void(InstKind::Ret {
        value: Some(Operand::value(loaded, i32t.clone())),
        ty: i32t.clone(),
    });
    let callee_f = module.add_function(callee.finish());

    let mut fb = FunctionBuilder::new("main", sig(vec![], i32t.clone()));
    let normal = fb.new_block();
    let r = fb.push_at(
        InstKind::Call {
            callee: Operand::Const { value: ssavm_core::ir::Const::Func { id: callee_f } },
            sig: sig(vec![], i32t.clone()),
            args: vec![],
            normal: Some(normal),
        },
        invoke_loc.clone(),
    );
    fb.switch_to(normal);
    fb.push_void(InstKind::Ret {
        value: Some(Operand::value(r, i32t.clone())),
        ty: i32t,
    });
    let f = module.add_function(fb.finish());

    let mut m = machine(module);
    m.oracle_mut().poison_range(0, 16);
    m.create_thread(1, f, vec![]).expect("create");

    assert!(matches!(m.run_thread(1).expect("run"), ExitReason::Faulted));
    assert!(m.error_flag());

    let trace = m.stack_trace();
    assert_eq!(trace.len(), 2);
    assert_eq!(trace[0].file, "callee.c");
    assert_eq!(trace[0].line, 4);
    assert_eq!(trace[1].file, "main.c");
    assert_eq!(trace[1].line, 21);

    let (recorded, inst_text) = m.oracle().last_trace.clone().expect("recorder fired");
    assert_eq!(recorded.len(), 2);
    assert!(inst_text.contains("load"), "recorder sees the faulting instruction: {inst_text}");

    // A faulted thread does not advance until the driver clears the flag.
    let before = m.oracle().stats.loads;
    m.step_thread(1, None).expect("step is a no-op");
    assert_eq!(m.oracle().stats.loads, before);

    m.clear_error();
    assert!(!m.error_flag());
    assert!(m.stack_trace().is_empty());
}

#[test]
fn globals_are_registered_and_initialized() {
    let i32t = Type::int(32);
    let mut module = Module::default();
    let g = module.add_global(ssavm_core::ir::Global {
        name: "counter".into(),
        ty: i32t.clone(),
        init: Some(ssavm_core::ir::Const::int(32, 41)),
    });

    let mut fb = FunctionBuilder::new("main", sig(vec![], i32t.clone()));
    let loaded = fb.push(InstKind::Load {
        ptr: Operand::Const { value: ssavm_core::ir::Const::Global { id: g } },
        ty: i32t.clone(),
    });
    let bumped = fb.push(InstKind::Bin {
        op: BinAlu::Add,
        ty: i32t.clone(),
        lhs: Operand::value(loaded, i32t.clone()),
        rhs: Operand::int(32, 1),
    });
    fb.push_void(InstKind::Ret {
        value: Some(Operand::value(bumped, i32t.clone())),
        ty: i32t,
    });
    let f = module.add_function(fb.finish());

    let mut m = machine(module);
    m.init_globals().expect("init globals");
    assert!(m.oracle().global_ptr("counter").is_some());

    m.create_thread(1, f, vec![]).expect("create");
    run_to_exit(&mut m, 1, 8);
    assert_eq!(exit_u64(&m, 1), 42);
}

#[test]
fn va_start_and_va_arg_walk_the_extra_arguments() {
    let i32t = Type::int(32);
    let mut module = Module::default();

    // vsum(i32 first, ...) reads two varargs and sums everything.
    let mut vs = FunctionBuilder::new("vsum", common::vararg_sig(vec![i32t.clone()], i32t.clone()));
    let first = vs.param(0);
    let ap = vs.push(InstKind::Alloca { ty: Type::int(64), count: Operand::int(32, 1), align: 8 });
    vs.push_void(InstKind::VaStart { list: Operand::value(ap, Type::Ptr) });
    let a = vs.push(InstKind::VaArg { list: Operand::value(ap, Type::Ptr), ty: i32t.clone() });
    let b = vs.push(InstKind::VaArg { list: Operand::value(ap, Type::Ptr), ty: i32t.clone() });
    vs.push_void(InstKind::VaEnd { list: Operand::value(ap, Type::Ptr) });
    let ab = vs.push(InstKind::Bin {
        op: BinAlu::Add,
        ty: i32t.clone(),
        lhs: Operand::value(a, i32t.clone()),
        rhs: Operand::value(b, i32t.clone()),
    });
    let total = vs.push(InstKind::Bin {
        op: BinAlu::Add,
        ty: i32t.clone(),
        lhs: Operand::value(ab, i32t.clone()),
        rhs: first,
    });
    vs.push_void(InstKind::Ret {
        value: Some(Operand::value(total, i32t.clone())),
        ty: i32t.clone(),
    });
    let vsum = module.add_function(vs.finish());

    let mut fb = FunctionBuilder::new("main", sig(vec![], i32t.clone()));
    let r = fb.push(InstKind::Call {
        callee: Operand::Const { value: ssavm_core::ir::Const::Func { id: vsum } },
        sig: common::vararg_sig(vec![i32t.clone()], i32t.clone()),
        args: vec![Operand::int(32, 5), Operand::int(32, 6), Operand::int(32, 7)],
        normal: None,
    });
    fb.push_void(InstKind::Ret {
        value: Some(Operand::value(r, i32t.clone())),
        ty: i32t,
    });
    let f = module.add_function(fb.finish());

    let mut m = machine(module);
    m.create_thread(1, f, vec![]).expect("create");
    run_to_exit(&mut m, 1, 32);
    assert_eq!(exit_u64(&m, 1), 18);
}
