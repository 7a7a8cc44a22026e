use std::cell::RefCell;
use std::rc::Rc;

use grimoire_vm::bytecode::{Bytecode, GlobalCounts, Kind, PrimitiveDef, Signature};
use grimoire_vm::instruction::{Instruction, Opcode};
use grimoire_vm::{Call, Library, Vm};

fn op(o: Opcode, v: u32) -> Instruction {
    Instruction::new(o, v)
}

fn sop(o: Opcode, v: i32) -> Instruction {
    Instruction::with_signed(o, v)
}

struct SinkLib {
    out: Rc<RefCell<String>>,
}

impl Library for SinkLib {
    fn name(&self) -> &str {
        "sink"
    }

    fn call(&mut self, primitive: &str, call: &mut Call<'_>) -> Result<(), String> {
        match primitive {
            "print" => {
                self.out.borrow_mut().push_str(call.get_string(0));
                Ok(())
            }
            other => Err(format!("unknown primitive {other}")),
        }
    }
}

fn vm_with_sink() -> (Vm, Rc<RefCell<String>>) {
    let out = Rc::new(RefCell::new(String::new()));
    let mut vm = Vm::new();
    vm.add_library(Box::new(SinkLib { out: out.clone() }));
    (vm, out)
}

fn print_prim() -> Vec<PrimitiveDef> {
    vec![PrimitiveDef {
        library: 0,
        name: "print".into(),
        signature: Signature { params: vec![Kind::Str], ret: None },
    }]
}

fn run(vm: &mut Vm) -> usize {
    vm.spawn().unwrap();
    let mut rounds = 0;
    while vm.has_coroutines() {
        vm.process().unwrap();
        rounds += 1;
        assert!(rounds < 100, "vm did not settle within 100 rounds");
    }
    rounds
}

#[test]
fn test_defer_runs_in_lifo_order() {
    let (mut vm, out) = vm_with_sink();
    let mut bc = Bytecode::new();
    bc.sconsts = vec!["a".into(), "b".into()];
    bc.primitives = print_prim();
    bc.code = vec![
        sop(Opcode::Defer, 3), // block at 3
        sop(Opcode::Defer, 5), // block at 6
        op(Opcode::Return, 0),
        op(Opcode::ConstStr, 0),
        op(Opcode::PrimitiveCall, 0),
        op(Opcode::Unwind, 0),
        op(Opcode::ConstStr, 1),
        op(Opcode::PrimitiveCall, 0),
        op(Opcode::Unwind, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    assert_eq!(*out.borrow(), "ba");
    assert!(!vm.is_panicking());
}

#[test]
fn test_try_catch_delivers_message() {
    let (mut vm, out) = vm_with_sink();
    let mut bc = Bytecode::new();
    bc.sconsts = vec!["oops".into()];
    bc.primitives = print_prim();
    bc.code = vec![
        sop(Opcode::Try, 3), // handler at the catch
        op(Opcode::ConstStr, 0),
        op(Opcode::Raise, 0),
        sop(Opcode::Catch, 3),
        op(Opcode::PrimitiveCall, 0),
        op(Opcode::Return, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    assert_eq!(*out.borrow(), "oops");
    assert!(!vm.is_panicking());
    assert!(!vm.has_coroutines());
}

#[test]
fn test_catch_skips_handler_on_normal_path() {
    let (mut vm, out) = vm_with_sink();
    let mut bc = Bytecode::new();
    bc.sconsts = vec!["never".into()];
    bc.primitives = print_prim();
    bc.code = vec![
        sop(Opcode::Try, 2),
        op(Opcode::Nop, 0),
        sop(Opcode::Catch, 3), // normal path jumps to 5
        op(Opcode::ConstStr, 0),
        op(Opcode::PrimitiveCall, 0),
        op(Opcode::Return, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    assert_eq!(*out.borrow(), "");
}

#[test]
fn test_division_by_zero_panics_vm() {
    let mut vm = Vm::new();
    let mut bc = Bytecode::new();
    bc.iconsts = vec![10, 0];
    bc.code = vec![
        op(Opcode::ConstInt, 0),
        op(Opcode::ConstInt, 1),
        op(Opcode::DivInt, 0),
        op(Opcode::Return, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    assert!(vm.is_panicking());
    assert_eq!(vm.panic_message(), "ZeroDivisionError");
    assert!(!vm.has_coroutines());
}

#[test]
fn test_index_error_message() {
    let mut vm = Vm::new();
    let mut bc = Bytecode::new();
    bc.iconsts = vec![1, 5];
    bc.code = vec![
        op(Opcode::ConstInt, 0),
        op(Opcode::ArrayInt, 1),
        op(Opcode::ConstInt, 1), // index 5 of a 1-element array
        op(Opcode::Index2Int, 0),
        op(Opcode::Return, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    assert!(vm.is_panicking());
    assert_eq!(vm.panic_message(), "IndexError");
}

#[test]
fn test_null_receiver_raises() {
    let mut vm = Vm::new();
    let mut bc = Bytecode::new();
    bc.code = vec![
        sop(Opcode::ShiftStackObj, 1), // reserve one null slot
        op(Opcode::FieldLoadInt, 0),
        op(Opcode::Return, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    assert!(vm.is_panicking());
    assert_eq!(vm.panic_message(), "NullError");
}

#[test]
fn test_defer_runs_on_panic_unwind() {
    let (mut vm, out) = vm_with_sink();
    let mut bc = Bytecode::new();
    bc.sconsts = vec!["boom".into(), "cleanup".into()];
    bc.primitives = print_prim();
    bc.code = vec![
        sop(Opcode::Defer, 4), // block at 4
        op(Opcode::ConstStr, 0),
        op(Opcode::Raise, 0),
        op(Opcode::Return, 0),
        op(Opcode::ConstStr, 1),
        op(Opcode::PrimitiveCall, 0),
        op(Opcode::Unwind, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    assert_eq!(*out.borrow(), "cleanup");
    assert!(vm.is_panicking());
    assert_eq!(vm.panic_message(), "boom");
}

#[test]
fn test_kill_runs_defers_then_removes() {
    let (mut vm, out) = vm_with_sink();
    let mut bc = Bytecode::new();
    bc.sconsts = vec!["k".into()];
    bc.primitives = print_prim();
    bc.code = vec![
        sop(Opcode::Defer, 2), // block at 2
        op(Opcode::Kill, 0),
        op(Opcode::ConstStr, 0),
        op(Opcode::PrimitiveCall, 0),
        op(Opcode::Unwind, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    assert_eq!(*out.borrow(), "k");
    assert!(!vm.is_panicking());
    assert!(!vm.has_coroutines());
}

#[test]
fn test_defer_runs_once_per_exit_path_in_callee() {
    let (mut vm, out) = vm_with_sink();
    let mut bc = Bytecode::new();
    bc.sconsts = vec!["x".into()];
    bc.primitives = print_prim();
    bc.code = vec![
        // main calls helper twice
        op(Opcode::Call, 3),
        op(Opcode::Call, 3),
        op(Opcode::Return, 0),
        // helper: defers a print, then returns
        sop(Opcode::Defer, 2), // block at 5
        op(Opcode::Return, 0),
        op(Opcode::ConstStr, 0),
        op(Opcode::PrimitiveCall, 0),
        op(Opcode::Unwind, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    assert_eq!(*out.borrow(), "xx");
}

#[test]
fn test_panic_kills_sibling_coroutines() {
    let mut vm = Vm::new();
    let mut bc = Bytecode::new();
    bc.sconsts = vec!["boom".into()];
    bc.code = vec![
        op(Opcode::Task, 4),
        op(Opcode::Yield, 0),
        op(Opcode::ConstStr, 0),
        op(Opcode::Raise, 0),
        // task body: yields forever
        op(Opcode::Yield, 0),
        sop(Opcode::Jump, -1),
    ];
    vm.load(bc).unwrap();

    vm.spawn().unwrap();
    vm.process().unwrap(); // main spawns and yields
    assert!(vm.has_coroutines());

    vm.process().unwrap(); // main panics; the looping task is killed
    assert!(vm.is_panicking());
    assert_eq!(vm.panic_message(), "boom");
    assert!(!vm.has_coroutines());
}

#[test]
fn test_kill_all_clears_spawn_queue() {
    let mut vm = Vm::new();
    let mut bc = Bytecode::new();
    bc.iconsts = vec![1];
    bc.globals = GlobalCounts { ints: 1, ..GlobalCounts::default() };
    bc.code = vec![
        op(Opcode::Task, 3),
        op(Opcode::KillAll, 0),
        op(Opcode::Return, 0),
        // task body would mark the global if it ever ran
        op(Opcode::ConstInt, 0),
        op(Opcode::StoreGlobalInt, 0),
        op(Opcode::Return, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    assert_eq!(vm.state.globals.ints[0], 0);
    assert!(!vm.is_panicking());
    assert!(!vm.has_coroutines());
}

#[test]
fn test_nested_frames_unwind_to_outer_handler() {
    let (mut vm, out) = vm_with_sink();
    let mut bc = Bytecode::new();
    bc.sconsts = vec!["deep".into()];
    bc.primitives = print_prim();
    bc.code = vec![
        // main: try around a call into a raising helper
        sop(Opcode::Try, 2), // handler at 2
        op(Opcode::Call, 5),
        sop(Opcode::Catch, 3),
        op(Opcode::PrimitiveCall, 0),
        op(Opcode::Return, 0),
        // helper
        op(Opcode::ConstStr, 0),
        op(Opcode::Raise, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    assert_eq!(*out.borrow(), "deep");
    assert!(!vm.is_panicking());
}
