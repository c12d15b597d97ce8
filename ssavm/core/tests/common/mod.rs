#![allow(dead_code)]

use ssavm_core::ir::{Module, Signature, Type};
use ssavm_core::{FlatMemory, Machine};

pub fn sig(params: Vec<Type>, ret: Type) -> Signature {
    Signature { params, ret, vararg: false }
}

pub fn vararg_sig(params: Vec<Type>, ret: Type) -> Signature {
    Signature { params, ret, vararg: true }
}

pub fn machine(module: Module) -> Machine<FlatMemory> {
    Machine::new(module, FlatMemory::default())
}

/// Step the thread to completion, failing the test if it does not finish
/// within `max` instructions.
pub fn run_to_exit(m: &mut Machine<FlatMemory>, thread: u64, max: usize) {
    for _ in 0..max {
        if m.step_thread(thread, None).expect("step") {
            return;
        }
    }
    panic!("thread {thread} did not finish within {max} steps");
}

pub fn exit_u64(m: &Machine<FlatMemory>, thread: u64) -> u64 {
    m.thread_exit_value(thread)
        .expect("thread has no exit value")
        .as_int()
        .expect("exit value is not an integer")
        .to_u64()
}
