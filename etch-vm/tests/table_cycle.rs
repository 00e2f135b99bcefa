//! A table that references itself through a field forms a one-node cycle
//! that plain reference counting can never free (`spec.md` §8 invariant 6);
//! only the cycle collector's mark-and-sweep pass reclaims it.

use etch_asm::{Abc, Abx, Ax, Instruction};
use etch_vm::{FunctionEntry, FunctionKind, HostRegistry, Program, Value, Vm, VmConfig};

fn native_program(constants: Vec<Value>, instructions: Vec<Instruction>, max_register: u8) -> Program {
    let mut p = Program::default();
    p.source_filename = "table_cycle.etch".into();
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

#[test]
fn self_referencing_table_field_is_collected_by_a_forced_cycle_scan() {
    // field name "next" lives in the constant pool at index 0; SetField's
    // Ax payload packs the name index across its (c, d) byte pair.
    let program = native_program(
        vec![Value::String("next".into()), Value::Int(42)],
        vec![
            Instruction::NewTable(Abx { a: 0, bx: u16::MAX }), // r0 = Table(t), no destructor
            Instruction::IncRef(Abc { a: 0, b: 0, c: 0 }),     // extra strong ref for the self-edge
            Instruction::SetField(Ax::from_fields4(0, 0, 0, 0)), // t.next = t
            Instruction::DecRef(Abc { a: 0, b: 0, c: 0 }),     // drop the "variable"'s ownership
            Instruction::LoadNil(Abc { a: 0, b: 0, c: 0 }),    // clear the root so only the cycle holds it
            Instruction::CheckCycles(Abc { a: 0, b: 1, c: 0 }), // force a full scan
            Instruction::LoadK(Abx { a: 1, bx: 1 }),
            Instruction::Return(Abc { a: 1, b: 0, c: 0 }),
        ],
        2,
    );

    let mut vm = Vm::new(program, VmConfig::default(), HostRegistry::new());
    assert_eq!(vm.execute(), 42);
    assert_eq!(vm.heap().live_count(), 0, "self-cycle should have been swept");
}

/// The same cycle, but still reachable from a live register, must survive
/// a forced scan (`spec.md` §8: roots keep a cycle alive).
#[test]
fn self_referencing_table_survives_while_still_rooted() {
    let program = native_program(
        vec![Value::String("next".into()), Value::Int(7)],
        vec![
            Instruction::NewTable(Abx { a: 0, bx: u16::MAX }),
            Instruction::IncRef(Abc { a: 0, b: 0, c: 0 }),
            Instruction::SetField(Ax::from_fields4(0, 0, 0, 0)),
            Instruction::DecRef(Abc { a: 0, b: 0, c: 0 }),
            // r0 is left holding the table: still a root.
            Instruction::CheckCycles(Abc { a: 0, b: 1, c: 0 }),
            Instruction::LoadK(Abx { a: 1, bx: 1 }),
            Instruction::Return(Abc { a: 1, b: 0, c: 0 }),
        ],
        2,
    );

    let mut vm = Vm::new(program, VmConfig::default(), HostRegistry::new());
    assert_eq!(vm.execute(), 7);
    assert_eq!(vm.heap().live_count(), 1, "rooted cycle must not be swept");
}
