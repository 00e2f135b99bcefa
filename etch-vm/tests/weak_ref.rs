//! Weak reference nullification, end to end (`spec.md` §8): promoting a
//! weak reference after its target was freed returns nil, and the same
//! weak value compares equal to nil through the ordinary `Eq` opcodes.

use etch_asm::{Abc, Abx, Instruction};
use etch_vm::{FunctionEntry, FunctionKind, HostRegistry, Program, Value, Vm, VmConfig};

fn native_program(constants: Vec<Value>, instructions: Vec<Instruction>, max_register: u8) -> Program {
    let mut p = Program::default();
    p.source_filename = "weak_ref.etch".into();
    p.entry_point = 0;
    p.constants = constants;
    let end_pc = instructions.len() as u32;
    p.instructions = instructions;
    p.functions.push(FunctionEntry {
        name: "main".into(),
        base_name: "main".into(),
        kind: FunctionKind::Native { start_pc: 0, end_pc, max_register },
        param_types: Vec::new(),
        return_type: "Int".into(),
    });
    p.function_index.push("main".into());
    p
}

/// `NewRef`+`NewWeak`, drop the strong side, then `WeakToStrong` (must
/// promote to nil) and `EqStore` against a literal nil (must be true) —
/// both read through `Vm::values_eq`'s heap-aware weak/nil comparison.
#[test]
fn weak_to_strong_and_equality_both_see_the_freed_target() {
    let program = native_program(
        vec![Value::Int(99), Value::Int(0), Value::Int(1)],
        vec![
            Instruction::LoadK(Abx { a: 0, bx: 0 }),       // r0 = 99
            Instruction::NewRef(Abc { a: 1, b: 0, c: 1 }), // r1 = Ref(id)
            Instruction::NewWeak(Abc { a: 2, b: 1, c: 0 }), // r2 = Weak(id)
            Instruction::DecRef(Abc { a: 1, b: 0, c: 0 }), // free the ref cell
            Instruction::WeakToStrong(Abc { a: 3, b: 2, c: 0 }), // r3 = Nil
            Instruction::LoadNil(Abc { a: 4, b: 0, c: 0 }), // r4 = Nil
            Instruction::EqStore(Abc { a: 5, b: 2, c: 4 }), // r5 = (weak == nil)
            Instruction::EqStore(Abc { a: 6, b: 3, c: 4 }), // r6 = (promoted == nil)
            Instruction::And(Abc { a: 7, b: 5, c: 6 }),    // r7 = r5 && r6
            Instruction::Test(Abc { a: 1, b: 7, c: 0 }),   // skip the Jmp-to-THEN unless r7
            Instruction::Jmp(etch_asm::AsBx { a: 0, s_bx: 2 }), // -> THEN (idx 12)
            Instruction::LoadK(Abx { a: 8, bx: 1 }),       // ELSE: r8 = 0
            Instruction::Jmp(etch_asm::AsBx { a: 0, s_bx: 1 }), // -> END (idx 13)
            Instruction::LoadK(Abx { a: 8, bx: 2 }),       // THEN: r8 = 1
            Instruction::Return(Abc { a: 8, b: 0, c: 0 }), // END
        ],
        9,
    );

    let mut vm = Vm::new(program, VmConfig::default(), HostRegistry::new());
    assert_eq!(vm.execute(), 1);
}

/// A weak reference that's never promoted and whose target stays alive
/// keeps seeing the live object: `weak == nil` is false.
#[test]
fn live_weak_target_does_not_compare_equal_to_nil() {
    let program = native_program(
        vec![Value::Int(7), Value::Int(0), Value::Int(1)],
        vec![
            Instruction::LoadK(Abx { a: 0, bx: 0 }),        // r0 = 7
            Instruction::NewRef(Abc { a: 1, b: 0, c: 1 }),  // r1 = Ref(id), kept alive
            Instruction::NewWeak(Abc { a: 2, b: 1, c: 0 }), // r2 = Weak(id)
            Instruction::LoadNil(Abc { a: 3, b: 0, c: 0 }), // r3 = Nil
            Instruction::EqStore(Abc { a: 4, b: 2, c: 3 }), // r4 = (weak == nil), expect false
            Instruction::Test(Abc { a: 0, b: 4, c: 0 }),    // skip the Jmp-to-THEN unless r4 is false
            Instruction::Jmp(etch_asm::AsBx { a: 0, s_bx: 2 }), // -> THEN (idx 9)
            Instruction::LoadK(Abx { a: 5, bx: 2 }),        // ELSE (r4 was true, unexpected): r5 = 1
            Instruction::Jmp(etch_asm::AsBx { a: 0, s_bx: 1 }), // -> END (idx 10)
            Instruction::LoadK(Abx { a: 5, bx: 1 }),        // THEN (r4 was false, expected): r5 = 0
            Instruction::Return(Abc { a: 5, b: 0, c: 0 }),  // END
        ],
        6,
    );

    let mut vm = Vm::new(program, VmConfig::default(), HostRegistry::new());
    assert_eq!(vm.execute(), 0);
    assert_eq!(vm.heap().live_count(), 2);
}
