//! Cooperative coroutines end to end (`spec.md` §4.I, §8): a coroutine that
//! yields twice then returns, resumed from its caller through `Ok`, followed
//! by a resume of an already-dead coroutine, which comes back `Err`.

use etch_asm::{Abc, Abx, CallOperands, Instruction};
use etch_vm::{FunctionEntry, FunctionKind, HostRegistry, Program, Value, Vm, VmConfig};

fn program_with(gen_instrs: Vec<Instruction>, gen_max_register: u8, main_instrs: Vec<Instruction>, main_max_register: u8) -> Program {
    let mut p = Program::default();
    p.source_filename = "coroutine.etch".into();
    p.constants = Vec::new();

    let gen_end = gen_instrs.len() as u32;
    p.instructions.extend(gen_instrs);
    p.functions.push(FunctionEntry {
        name: "gen".into(),
        base_name: "gen".into(),
        kind: FunctionKind::Native { start_pc: 0, end_pc: gen_end, max_register: gen_max_register },
        param_types: Vec::new(),
        return_type: "Int".into(),
    });
    p.function_index.push("gen".into());

    let main_start = p.instructions.len() as u32;
    let main_end = main_start + main_instrs.len() as u32;
    p.instructions.extend(main_instrs);
    p.functions.push(FunctionEntry {
        name: "main".into(),
        base_name: "main".into(),
        kind: FunctionKind::Native { start_pc: main_start, end_pc: main_end, max_register: main_max_register },
        param_types: Vec::new(),
        return_type: "Int".into(),
    });
    p.function_index.push("main".into());
    p.entry_point = main_start;
    p
}

/// `gen` yields 10, yields 20, then returns 30; `main` resumes it three
/// times (collecting each value through `Ok`), then a fourth time after
/// it's `Dead`, which must come back `Err` rather than panicking.
#[test]
fn yields_twice_then_returns_then_dead_resume_is_err() {
    const GEN: u16 = 0;

    let gen_instrs = vec![
        Instruction::LoadK(Abx { a: 0, bx: 0 }), // r0 = 10
        Instruction::Yield(Abc { a: 0, b: 0, c: 0 }),
        Instruction::LoadK(Abx { a: 0, bx: 1 }), // r0 = 20
        Instruction::Yield(Abc { a: 0, b: 0, c: 0 }),
        Instruction::LoadK(Abx { a: 0, bx: 2 }), // r0 = 30
        Instruction::Return(Abc { a: 0, b: 0, c: 0 }),
    ];

    let main_instrs = vec![
        Instruction::Spawn(CallOperands { a: 0, func_idx: GEN, num_args: 0, num_results: 0 }), // r0 = Coroutine
        Instruction::Resume(Abc { a: 1, b: 0, c: 0 }),          // r1 = Ok(10)
        Instruction::UnwrapResult(Abc { a: 2, b: 1, c: 0 }),    // r2 = 10
        Instruction::Arg(Abc { a: 2, b: 0, c: 0 }),
        Instruction::CallBuiltin(CallOperands { a: 3, func_idx: 0, num_args: 1, num_results: 0 }), // print(10)
        Instruction::Resume(Abc { a: 1, b: 0, c: 0 }),          // r1 = Ok(20)
        Instruction::UnwrapResult(Abc { a: 2, b: 1, c: 0 }),
        Instruction::Arg(Abc { a: 2, b: 0, c: 0 }),
        Instruction::CallBuiltin(CallOperands { a: 3, func_idx: 0, num_args: 1, num_results: 0 }), // print(20)
        Instruction::Resume(Abc { a: 1, b: 0, c: 0 }),          // r1 = Ok(30), coroutine now Dead
        Instruction::UnwrapResult(Abc { a: 2, b: 1, c: 0 }),
        Instruction::Arg(Abc { a: 2, b: 0, c: 0 }),
        Instruction::CallBuiltin(CallOperands { a: 3, func_idx: 0, num_args: 1, num_results: 0 }), // print(30)
        Instruction::Resume(Abc { a: 1, b: 0, c: 0 }),          // r1 = Err(..) (Dead)
        Instruction::TestTag(Abc { a: 1, b: 1, c: etch_vm::ValueTag::Err as u8 }), // skip Jmp-to-THEN unless r1 is Err
        Instruction::Jmp(etch_asm::AsBx { a: 0, s_bx: 2 }),     // -> THEN (idx 17)
        Instruction::LoadK(Abx { a: 4, bx: 4 }),                // ELSE: r4 = 0 (unexpected)
        Instruction::Return(Abc { a: 4, b: 0, c: 0 }),
    ];

    let mut p = program_with(gen_instrs, 1, main_instrs, 5);
    p.constants = vec![Value::Int(10), Value::Int(20), Value::Int(30), Value::Int(1), Value::Int(0)];
    // The THEN branch above (idx 16, after the Jmp lands) needs its own
    // LoadK + Return; appended here so constant indices above stay simple.
    let then_start = p.instructions.len() as u32;
    p.instructions.push(Instruction::LoadK(Abx { a: 4, bx: 3 })); // r4 = 1 (expected)
    p.instructions.push(Instruction::Return(Abc { a: 4, b: 0, c: 0 }));
    let main_end = then_start + 2;
    if let FunctionKind::Native { end_pc, .. } = &mut p.functions[1].kind {
        *end_pc = main_end;
    }

    let mut vm = Vm::new(p, VmConfig::default(), HostRegistry::new());
    let exit = vm.execute();
    assert_eq!(vm.output(), b"10\n20\n30\n");
    assert_eq!(exit, 1);
}
