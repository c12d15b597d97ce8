mod common;

use common::{exit_u64, machine, run_to_exit, sig};
use ssavm_core::interp::eval;
use ssavm_core::ir::{
    BinAlu, BlockId, CastOp, Const, FunctionBuilder, InstKind, IntPredicate, Module, Operand, Type,
};
use ssavm_core::value::{OraclePtr, Provenance, Value};
use ssavm_core::ApInt;

#[test]
fn add_then_ret_yields_five() {
    // ret i32 (add i32 2, 3), one StepThread per instruction.
    let mut module = Module::default();
    let mut fb = FunctionBuilder::new("main", sig(vec![], Type::int(32)));
    let sum = fb.push(InstKind::Bin {
        op: BinAlu::Add,
        ty: Type::int(32),
        lhs: Operand::int(32, 2),
        rhs: Operand::int(32, 3),
    });
    fb.push_void(InstKind::Ret {
        value: Some(Operand::value(sum, Type::int(32))),
        ty: Type::int(32),
    });
    let f = module.add_function(fb.finish());

    let mut m = machine(module);
    m.create_thread(1, f, vec![]).expect("create");
    assert!(!m.step_thread(1, None).expect("add"));
    assert!(m.step_thread(1, None).expect("ret"));
    let exit = m.thread_exit_value(1).expect("exit");
    assert_eq!(exit.as_int().expect("int").width(), 32);
    assert_eq!(exit.as_int().expect("int").to_u64(), 5);
}

#[test]
fn phi_nodes_swap_atomically() {
    // b1 swaps its two phis on every pass; a sequential update would
    // collapse them to the same value.
    let i32t = Type::int(32);
    let mut module = Module::default();
    let mut fb = FunctionBuilder::new("main", sig(vec![], i32t.clone()));
    let b1 = fb.new_block();
    let bexit = fb.new_block();

    fb.push_void(InstKind::Br { dest: b1 });

    fb.switch_to(b1);
    let a = fb.push(InstKind::Phi { ty: i32t.clone(), incoming: vec![] });
    let b = fb.push(InstKind::Phi { ty: i32t.clone(), incoming: vec![] });
    let i = fb.push(InstKind::Phi { ty: i32t.clone(), incoming: vec![] });
    let inc = fb.push(InstKind::Bin {
        op: BinAlu::Add,
        ty: i32t.clone(),
        lhs: Operand::value(i, i32t.clone()),
        rhs: Operand::int(32, 1),
    });
    let done = fb.push(InstKind::ICmp {
        pred: IntPredicate::Eq,
        ty: i32t.clone(),
        lhs: Operand::value(inc, i32t.clone()),
        rhs: Operand::int(32, 2),
    });
    fb.push_void(InstKind::CondBr {
        cond: Operand::value(done, Type::int(1)),
        on_true: bexit,
        on_false: b1,
    });

    fb.switch_to(bexit);
    let tens = fb.push(InstKind::Bin {
        op: BinAlu::Mul,
        ty: i32t.clone(),
        lhs: Operand::value(a, i32t.clone()),
        rhs: Operand::int(32, 10),
    });
    let packed = fb.push(InstKind::Bin {
        op: BinAlu::Add,
        ty: i32t.clone(),
        lhs: Operand::value(tens, i32t.clone()),
        rhs: Operand::value(b, i32t.clone()),
    });
    fb.push_void(InstKind::Ret {
        value: Some(Operand::value(packed, i32t.clone())),
        ty: i32t.clone(),
    });

    let mut func = fb.finish();
    // Wire up the phi incomings now that every id exists: from b0 the pair
    // binds (1, 2); from b1 each phi reads the *other* phi.
    let entry = BlockId(0);
    let phis = &mut func.blocks[b1.0 as usize].insts;
    if let InstKind::Phi { incoming, .. } = &mut phis[0].kind {
        *incoming = vec![
            (entry, Operand::int(32, 1)),
            (b1, Operand::value(b, i32t.clone())),
        ];
    }
    if let InstKind::Phi { incoming, .. } = &mut phis[1].kind {
        *incoming = vec![
            (entry, Operand::int(32, 2)),
            (b1, Operand::value(a, i32t.clone())),
        ];
    }
    if let InstKind::Phi { incoming, .. } = &mut phis[2].kind {
        *incoming = vec![
            (entry, Operand::int(32, 0)),
            (b1, Operand::value(inc, i32t.clone())),
        ];
    }
    let f = module.add_function(func);

    let mut m = machine(module);
    m.create_thread(1, f, vec![]).expect("create");
    run_to_exit(&mut m, 1, 64);
    // First pass binds a=1 b=2; the looped pass must swap to a=2 b=1.
    assert_eq!(exit_u64(&m, 1), 21, "phis must read all inputs before writing any");
}

#[test]
fn provenance_survives_bitcast_and_aggregate_surgery() {
    let layout = ssavm_core::ir::DataLayout::default();
    let p = OraclePtr { addr: 0x1200, prov: Provenance { alloc_id: 5, tag: 31 } };
    let v = Value::ptr(p);

    let cast1 = eval::cast(CastOp::BitCast, &v, &Type::Ptr, &Type::Ptr, &layout).expect("bitcast");
    let agg = Value::agg(vec![Value::int(ApInt::from_u64(32, 0)), cast1]);
    let inserted = eval::insert_value(&agg, Value::ptr(p), &[1]).expect("insertvalue");
    let extracted = eval::extract_value(&inserted, &[1]).expect("extractvalue");
    let cast2 =
        eval::cast(CastOp::BitCast, &extracted, &Type::Ptr, &Type::Ptr, &layout).expect("bitcast");

    let back = cast2.as_ptr().expect("ptr");
    assert_eq!(back.addr, p.addr);
    assert_eq!(back.prov, p.prov);
}

#[test]
fn shift_by_more_than_width_masks() {
    // shl i32 x, 33 behaves as shl x, (33 & 31).
    let i32t = Type::int(32);
    let mut module = Module::default();
    let mut fb = FunctionBuilder::new("main", sig(vec![i32t.clone()], i32t.clone()));
    let x = fb.param(0);
    let shifted = fb.push(InstKind::Bin {
        op: BinAlu::Shl,
        ty: i32t.clone(),
        lhs: x,
        rhs: Operand::int(32, 33),
    });
    fb.push_void(InstKind::Ret {
        value: Some(Operand::value(shifted, i32t.clone())),
        ty: i32t.clone(),
    });
    let f = module.add_function(fb.finish());

    let mut m = machine(module);
    m.create_thread(1, f, vec![Value::int(ApInt::from_u64(32, 0x4001))])
        .expect("create");
    run_to_exit(&mut m, 1, 8);
    assert_eq!(exit_u64(&m, 1), (0x4001u64 << 1) & 0xFFFF_FFFF);
}

#[test]
fn switch_picks_first_matching_case() {
    let i32t = Type::int(32);
    let mut module = Module::default();
    let mut fb = FunctionBuilder::new("main", sig(vec![i32t.clone()], i32t.clone()));
    let hit = fb.new_block();
    let miss = fb.new_block();
    let x = fb.param(0);
    fb.push_void(InstKind::Switch {
        cond: x,
        cond_ty: i32t.clone(),
        cases: vec![(Const::int(32, 4), hit), (Const::int(32, 9), hit)],
        default: miss,
    });
    fb.switch_to(hit);
    fb.push_void(InstKind::Ret { value: Some(Operand::int(32, 1)), ty: i32t.clone() });
    fb.switch_to(miss);
    fb.push_void(InstKind::Ret { value: Some(Operand::int(32, 0)), ty: i32t.clone() });
    let f = module.add_function(fb.finish());

    let mut m = machine(module);
    m.create_thread(1, f, vec![Value::int(ApInt::from_u64(32, 9))]).expect("create");
    run_to_exit(&mut m, 1, 8);
    assert_eq!(exit_u64(&m, 1), 1);

    let mut m2 = machine_for_switch();
    m2.create_thread(1, ssavm_core::ir::FuncId(0), vec![Value::int(ApInt::from_u64(32, 5))])
        .expect("create");
    run_to_exit(&mut m2, 1, 8);
    assert_eq!(exit_u64(&m2, 1), 0, "unmatched condition falls through to default");
}

fn machine_for_switch() -> ssavm_core::Machine<ssavm_core::FlatMemory> {
    let i32t = Type::int(32);
    let mut module = Module::default();
    let mut fb = FunctionBuilder::new("main", sig(vec![i32t.clone()], i32t.clone()));
    let hit = fb.new_block();
    let miss = fb.new_block();
    let x = fb.param(0);
    fb.push_void(InstKind::Switch {
        cond: x,
        cond_ty: i32t.clone(),
        cases: vec![(Const::int(32, 4), hit)],
        default: miss,
    });
    fb.switch_to(hit);
    fb.push_void(InstKind::Ret { value: Some(Operand::int(32, 1)), ty: i32t.clone() });
    fb.switch_to(miss);
    fb.push_void(InstKind::Ret { value: Some(Operand::int(32, 0)), ty: i32t });
    module.add_function(fb.finish());
    machine(module)
}

#[test]
fn indirectbr_targets_block_by_address() {
    let i32t = Type::int(32);
    let mut module = Module::default();
    let mut fb = FunctionBuilder::new("main", sig(vec![], i32t.clone()));
    let left = fb.new_block();
    let right = fb.new_block();
    fb.push_void(InstKind::IndirectBr {
        addr: Operand::Const {
            value: Const::BlockAddress { func: ssavm_core::ir::FuncId(0), block: right },
        },
        dests: vec![left, right],
    });
    fb.switch_to(left);
    fb.push_void(InstKind::Ret { value: Some(Operand::int(32, 1)), ty: i32t.clone() });
    fb.switch_to(right);
    fb.push_void(InstKind::Ret { value: Some(Operand::int(32, 2)), ty: i32t });
    let f = module.add_function(fb.finish());

    let mut m = machine(module);
    m.create_thread(1, f, vec![]).expect("create");
    run_to_exit(&mut m, 1, 8);
    assert_eq!(exit_u64(&m, 1), 2);
}

#[test]
fn unreachable_is_fatal() {
    let mut module = Module::default();
    let mut fb = FunctionBuilder::new("main", sig(vec![], Type::Void));
    fb.push_void(InstKind::Unreachable);
    let f = module.add_function(fb.finish());

    let mut m = machine(module);
    m.create_thread(1, f, vec![]).expect("create");
    assert!(matches!(
        m.step_thread(1, None),
        Err(ssavm_core::CoreError::Unreachable)
    ));
}
