//! Program images round-trip through the `"ETCH"` binary container
//! (`spec.md` §6.1): a program saved with `save` and reloaded with `load`
//! must execute identically to the original.

use etch_asm::{Abc, Abx, Instruction};
use etch_vm::{
    load, load_header, save, DebugInfo, FunctionEntry, FunctionKind, Header, HostRegistry, Program,
    Value, Vm, VmConfig, FLAG_DEBUG,
};

fn sample_program() -> Program {
    let mut p = Program::default();
    p.source_filename = "roundtrip.etch".into();
    p.entry_point = 0;
    p.constants = vec![Value::Int(6), Value::Int(7)];
    p.instructions = vec![
        Instruction::LoadK(Abx { a: 0, bx: 0 }),
        Instruction::LoadK(Abx { a: 1, bx: 1 }),
        Instruction::Add(Abc { a: 2, b: 0, c: 1 }),
        Instruction::Return(Abc { a: 2, b: 0, c: 0 }),
    ];
    for _ in 0..p.instructions.len() {
        p.debug_info.push(DebugInfo {
            line: 1,
            column: 1,
            source_file: "roundtrip.etch".into(),
            function_name: "main".into(),
        });
    }
    p.functions.push(FunctionEntry {
        name: "main".into(),
        base_name: "main".into(),
        kind: FunctionKind::Native { start_pc: 0, end_pc: p.instructions.len() as u32, max_register: 3 },
        param_types: Vec::new(),
        return_type: "Int".into(),
    });
    p.function_index.push("main".into());
    p
}

#[test]
fn loaded_program_executes_identically_to_the_original() {
    let original = sample_program();
    let header = Header {
        vm_type: 1,
        version: 1,
        source_hash: [7; 32],
        compiler_version_hash: [9; 32],
        flags: FLAG_DEBUG,
    };

    let bytes = save(&original, header);
    let (loaded, loaded_header) = load(&bytes).expect("image must decode");

    assert_eq!(loaded_header, header);
    assert_eq!(loaded_header.optimization_level(), header.flags >> 4);

    let mut vm_original = Vm::new(original, VmConfig::default(), HostRegistry::new());
    let exit_original = vm_original.execute();

    let mut vm_loaded = Vm::new(loaded, VmConfig::default(), HostRegistry::new());
    let exit_loaded = vm_loaded.execute();

    assert_eq!(exit_original, 13);
    assert_eq!(exit_loaded, exit_original);
    assert_eq!(vm_loaded.output(), vm_original.output());
}

#[test]
fn header_only_read_stops_before_the_body() {
    let original = sample_program();
    let header = Header {
        vm_type: 2,
        version: 1,
        source_hash: [1; 32],
        compiler_version_hash: [2; 32],
        flags: 0,
    };
    let bytes = save(&original, header);

    let header_only = load_header(&bytes).expect("header must decode on its own");
    assert_eq!(header_only, header);
}
