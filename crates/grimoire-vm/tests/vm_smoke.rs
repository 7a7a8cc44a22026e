use std::cell::RefCell;
use std::rc::Rc;

use grimoire_vm::bytecode::{
    Bytecode, ClassDef, EventDef, FieldDef, GlobalCounts, Kind, PrimitiveDef, Signature,
    VariableDef,
};
use grimoire_vm::instruction::{Instruction, Opcode};
use grimoire_vm::{Call, HostError, Library, Vm};

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
            "printl" => {
                let mut out = self.out.borrow_mut();
                out.push_str(call.get_string(0));
                out.push('\n');
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

fn print_prims() -> Vec<PrimitiveDef> {
    vec![
        PrimitiveDef {
            library: 0,
            name: "print".into(),
            signature: Signature { params: vec![Kind::Str], ret: None },
        },
        PrimitiveDef {
            library: 0,
            name: "printl".into(),
            signature: Signature { params: vec![Kind::Str], ret: None },
        },
    ]
}

/// Run until every coroutine is gone, with a round budget so a scheduling
/// bug fails instead of hanging.
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
fn test_hello_world() {
    let (mut vm, out) = vm_with_sink();
    let mut bc = Bytecode::new();
    bc.sconsts = vec!["hi".into()];
    bc.primitives = print_prims();
    bc.events = vec![EventDef { name: "main".into(), pc: 0 }];
    bc.code = vec![
        op(Opcode::ConstStr, 0),
        op(Opcode::PrimitiveCall, 1),
        op(Opcode::Return, 0),
    ];
    vm.load(bc).unwrap();

    vm.spawn().unwrap();
    vm.process().unwrap();

    assert_eq!(*out.borrow(), "hi\n");
    assert!(!vm.has_coroutines());
    assert!(!vm.is_panicking());
}

#[test]
fn test_arithmetic_and_typecast() {
    let (mut vm, out) = vm_with_sink();
    let mut bc = Bytecode::new();
    bc.iconsts = vec![1, 2];
    bc.fconsts = vec![3.5, 2.0];
    bc.sconsts = vec![" ".into()];
    bc.primitives = print_prims();
    bc.code = vec![
        op(Opcode::ConstInt, 0),
        op(Opcode::ConstInt, 1),
        op(Opcode::AddInt, 0),
        op(Opcode::IntToStr, 0),
        op(Opcode::ConstStr, 0),
        op(Opcode::ConcatStr, 0),
        op(Opcode::ConstFloat, 0),
        op(Opcode::ConstFloat, 1),
        op(Opcode::DivFloat, 0),
        op(Opcode::FloatToStr, 0),
        op(Opcode::ConcatStr, 0),
        op(Opcode::PrimitiveCall, 0),
        op(Opcode::Return, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    assert_eq!(*out.borrow(), "3 1.75");
}

#[test]
fn test_add_store_global() {
    let mut vm = Vm::new();
    let mut bc = Bytecode::new();
    bc.iconsts = vec![1, 2];
    bc.globals = GlobalCounts { ints: 1, ..GlobalCounts::default() };
    bc.variables.insert(
        "g0".into(),
        VariableDef { index: 0, mask: Kind::Int.mask_bit() },
    );
    bc.code = vec![
        op(Opcode::ConstInt, 0),
        op(Opcode::ConstInt, 1),
        op(Opcode::AddInt, 0),
        op(Opcode::StoreGlobalInt, 0),
        op(Opcode::Return, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    assert_eq!(vm.get_int_variable("g0").unwrap(), 3);
}

#[test]
fn test_jump_equal_takes_branch() {
    let mut vm = Vm::new();
    let mut bc = Bytecode::new();
    bc.iconsts = vec![1, 111, 222];
    bc.globals = GlobalCounts { ints: 1, ..GlobalCounts::default() };
    bc.code = vec![
        op(Opcode::ConstInt, 0),
        op(Opcode::ConstInt, 0),
        sop(Opcode::JumpEq, 3),
        op(Opcode::ConstInt, 1),
        sop(Opcode::Jump, 3),
        op(Opcode::ConstInt, 2),
        op(Opcode::Nop, 0),
        op(Opcode::StoreGlobalInt, 0),
        op(Opcode::Return, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    assert_eq!(vm.state.globals.ints[0], 222);
}

#[test]
fn test_call_keeps_locals_across_frames() {
    let mut vm = Vm::new();
    let mut bc = Bytecode::new();
    bc.iconsts = vec![5, 7];
    bc.globals = GlobalCounts { ints: 1, ..GlobalCounts::default() };
    bc.code = vec![
        // main
        op(Opcode::LocalStackInt, 1),
        op(Opcode::ConstInt, 0),
        op(Opcode::StoreLocalInt, 0),
        op(Opcode::Call, 8),
        op(Opcode::LoadLocalInt, 0),
        op(Opcode::AddInt, 0),
        op(Opcode::StoreGlobalInt, 0),
        op(Opcode::Return, 0),
        // helper: leaves 7 on the integer stack
        op(Opcode::ConstInt, 1),
        op(Opcode::Return, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    assert_eq!(vm.state.globals.ints[0], 12);
}

#[test]
fn test_copy_swap_shift() {
    let mut vm = Vm::new();
    let mut bc = Bytecode::new();
    bc.iconsts = vec![10, 3];
    bc.globals = GlobalCounts { ints: 1, ..GlobalCounts::default() };
    bc.code = vec![
        op(Opcode::ConstInt, 0),
        op(Opcode::CopyInt, 0),
        op(Opcode::AddInt, 0),
        op(Opcode::ConstInt, 1),
        op(Opcode::SwapInt, 0),
        op(Opcode::SubInt, 0),
        op(Opcode::ConstInt, 0),
        sop(Opcode::ShiftStackInt, -1),
        op(Opcode::StoreGlobalInt, 0),
        op(Opcode::Return, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    // (10+10) swapped under 3, 3 - 20, scratch 10 dropped.
    assert_eq!(vm.state.globals.ints[0], -17);
}

#[test]
fn test_array_index_refstore() {
    let mut vm = Vm::new();
    let mut bc = Bytecode::new();
    bc.iconsts = vec![1, 2, 3, 99];
    bc.globals = GlobalCounts { ints: 2, ..GlobalCounts::default() };
    bc.code = vec![
        op(Opcode::ConstInt, 0),
        op(Opcode::ConstInt, 1),
        op(Opcode::ConstInt, 2),
        op(Opcode::ArrayInt, 3),
        op(Opcode::CopyObj, 0),
        op(Opcode::ConstInt, 0), // index 1
        op(Opcode::IndexInt, 0),
        op(Opcode::ConstInt, 3), // 99
        op(Opcode::RefStoreInt, 0),
        op(Opcode::CopyObj, 0),
        op(Opcode::LengthInt, 0),
        op(Opcode::StoreGlobalInt, 0),
        op(Opcode::ConstInt, 0), // index 1 again
        op(Opcode::Index2Int, 0),
        op(Opcode::StoreGlobalInt, 1),
        op(Opcode::Return, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    assert_eq!(vm.state.globals.ints[0], 3);
    assert_eq!(vm.state.globals.ints[1], 99);
}

#[test]
fn test_new_instance_field_roundtrip() {
    let mut vm = Vm::new();
    let mut bc = Bytecode::new();
    bc.iconsts = vec![41];
    bc.globals = GlobalCounts { ints: 1, ..GlobalCounts::default() };
    bc.classes = vec![ClassDef {
        name: "Counter".into(),
        fields: vec![FieldDef { name: "n".into(), kind: Kind::Int }],
    }];
    bc.code = vec![
        op(Opcode::ConstInt, 0),
        op(Opcode::New, 0),
        op(Opcode::CopyObj, 0),
        op(Opcode::FieldStoreInt, 0),
        op(Opcode::FieldLoadInt, 0),
        op(Opcode::IncInt, 0),
        op(Opcode::StoreGlobalInt, 0),
        op(Opcode::Return, 0),
    ];
    vm.load(bc).unwrap();

    run(&mut vm);
    assert_eq!(vm.state.globals.ints[0], 42);
}

#[test]
fn test_host_variable_access() {
    let mut vm = Vm::new();
    let mut bc = Bytecode::new();
    bc.globals = GlobalCounts { ints: 1, strs: 1, ..GlobalCounts::default() };
    bc.variables.insert(
        "speed".into(),
        VariableDef { index: 0, mask: Kind::Int.mask_bit() },
    );
    bc.variables.insert(
        "title".into(),
        VariableDef { index: 0, mask: Kind::Str.mask_bit() },
    );
    bc.code = vec![
        op(Opcode::LoadGlobalInt, 0),
        op(Opcode::CopyInt, 0),
        op(Opcode::AddInt, 0),
        op(Opcode::StoreGlobalInt, 0),
        op(Opcode::Return, 0),
    ];
    vm.load(bc).unwrap();

    vm.set_int_variable("speed", 21).unwrap();
    vm.set_string_variable("title", "grimoire".into()).unwrap();
    run(&mut vm);

    assert_eq!(vm.get_int_variable("speed").unwrap(), 42);
    assert_eq!(vm.get_string_variable("title").unwrap(), "grimoire");
    assert!(matches!(
        vm.get_float_variable("speed"),
        Err(HostError::VariableTypeMismatch(_))
    ));
    assert!(matches!(
        vm.get_int_variable("missing"),
        Err(HostError::UnknownVariable(_))
    ));
}

#[test]
fn test_bool_variables_live_in_int_partition() {
    let mut vm = Vm::new();
    let mut bc = Bytecode::new();
    bc.globals = GlobalCounts { ints: 1, ..GlobalCounts::default() };
    bc.variables.insert(
        "armed".into(),
        VariableDef { index: 0, mask: Kind::Int.mask_bit() },
    );
    bc.code = vec![op(Opcode::Return, 0)];
    vm.load(bc).unwrap();

    vm.set_bool_variable("armed", true).unwrap();
    assert!(vm.get_bool_variable("armed").unwrap());
    assert_eq!(vm.get_int_variable("armed").unwrap(), 1);
}

#[test]
fn test_unknown_event_is_host_error() {
    let mut vm = Vm::new();
    let mut bc = Bytecode::new();
    bc.code = vec![op(Opcode::Return, 0)];
    vm.load(bc).unwrap();
    assert!(matches!(
        vm.spawn_event("no_such_event"),
        Err(HostError::UnknownEvent(_))
    ));
}

#[test]
fn test_primitive_without_library_rejected_at_load() {
    let mut vm = Vm::new();
    let mut bc = Bytecode::new();
    bc.primitives = print_prims();
    bc.code = vec![op(Opcode::Return, 0)];
    assert!(matches!(
        vm.load(bc),
        Err(HostError::UnknownLibrary { .. })
    ));
}

#[test]
fn test_load_image_round_trip() {
    let (mut vm, out) = vm_with_sink();
    let mut bc = Bytecode::new();
    bc.sconsts = vec!["hi".into()];
    bc.primitives = print_prims();
    bc.events = vec![EventDef { name: "main".into(), pc: 0 }];
    bc.code = vec![
        op(Opcode::ConstStr, 0),
        op(Opcode::PrimitiveCall, 1),
        op(Opcode::Return, 0),
    ];

    let image = grimoire_vm::serialize::encode(&bc);
    vm.load_image(&image).unwrap();

    run(&mut vm);
    assert_eq!(*out.borrow(), "hi\n");
}

#[test]
fn test_host_cancellation_preserves_state() {
    let mut vm = Vm::new();
    let mut bc = Bytecode::new();
    bc.code = vec![
        op(Opcode::Yield, 0),
        sop(Opcode::Jump, -1),
    ];
    vm.load(bc).unwrap();
    vm.spawn().unwrap();

    vm.process().unwrap();
    assert!(vm.has_coroutines());

    vm.set_running(false);
    vm.process().unwrap();
    assert!(vm.has_coroutines());
    assert_eq!(vm.scheduler.coroutines[0].pc, 1);

    vm.set_running(true);
    vm.process().unwrap();
    assert!(vm.has_coroutines());
}
