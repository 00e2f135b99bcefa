//! Binary program-image format: the `"ETCH"` container (`spec.md` §6.1).
//!
//! Unlike the teacher's `fuel_types::bytes` helpers (fixed-width,
//! word-aligned, built around `unsafe` pointer restores), this format is
//! variable-length and length-prefixed throughout, so encoding/decoding is
//! expressed as plain safe slice arithmetic — the same style already used
//! by `etch_asm::Instruction::{encode,decode}`.

use std::io;

use etch_asm::Instruction;

use crate::error::LoadError;
use crate::program::{DebugInfo, FunctionEntry, FunctionKind, FunctionLifetime, LiveRange, Program};
use crate::value::{EtchString, Value};

const MAGIC: [u8; 4] = *b"ETCH";
const FORMAT_VERSION: u32 = 1;

/// Bit 0 of the flags byte (`spec.md` §6.1 step 6).
pub const FLAG_VERBOSE: u8 = 1 << 0;
/// Bit 1 of the flags byte.
pub const FLAG_DEBUG: u8 = 1 << 1;

/// The header fields a cache-validation reader needs, stopping after the
/// flags byte (`spec.md` §6.1: "A header-only reader exists ... stops after
/// step 6.").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub vm_type: u8,
    pub version: u32,
    pub source_hash: [u8; 32],
    pub compiler_version_hash: [u8; 32],
    pub flags: u8,
}

impl Header {
    pub fn optimization_level(&self) -> u8 {
        self.flags >> 4
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Writer { buf: Vec::new() }
    }
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes_fixed(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
    fn lp_bytes(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }
    fn lp_str(&mut self, v: &str) {
        self.lp_bytes(v.as_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn need(&self, n: usize, what: &'static str) -> Result<(), LoadError> {
        if self.buf.len() - self.pos < n {
            Err(LoadError::Truncated(what))
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8, LoadError> {
        self.need(1, "u8")?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, LoadError> {
        self.need(4, "u32")?;
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn i64(&mut self) -> Result<i64, LoadError> {
        self.need(8, "i64")?;
        let v = i64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn f64(&mut self) -> Result<f64, LoadError> {
        self.need(8, "f64")?;
        let v = f64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn bytes_fixed(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], LoadError> {
        self.need(n, what)?;
        let v = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(v)
    }

    fn lp_bytes(&mut self, what: &'static str) -> Result<&'a [u8], LoadError> {
        let n = self.u32()? as usize;
        self.bytes_fixed(n, what)
    }

    fn lp_str(&mut self, what: &'static str) -> Result<EtchString, LoadError> {
        let bytes = self.lp_bytes(what)?;
        std::str::from_utf8(bytes).map(EtchString::from).map_err(|_| LoadError::InvalidUtf8(what))
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

fn write_value(w: &mut Writer, v: &Value) {
    match v {
        Value::Nil => w.u8(0),
        Value::None => w.u8(1),
        Value::Bool(b) => {
            w.u8(2);
            w.u8(*b as u8);
        }
        Value::Char(c) => {
            w.u8(3);
            w.u8(*c);
        }
        Value::Int(i) => {
            w.u8(4);
            w.i64(*i);
        }
        Value::Float(f) => {
            w.u8(5);
            w.f64(*f);
        }
        Value::String(s) => {
            w.u8(6);
            w.lp_str(s);
        }
        Value::Array(_) | Value::Table(_) => unreachable!("containers are not constant-pool literals"),
        Value::Some(inner) => {
            w.u8(9);
            write_value(w, inner);
        }
        Value::Ok(inner) => {
            w.u8(10);
            write_value(w, inner);
        }
        Value::Err(inner) => {
            w.u8(11);
            write_value(w, inner);
        }
        Value::Ref(id) | Value::Weak(id) | Value::Closure(id) => {
            let tag = match v {
                Value::Ref(_) => 12,
                Value::Weak(_) => 13,
                _ => 14,
            };
            w.u8(tag);
            w.u32(*id);
        }
        Value::Coroutine(id) => {
            w.u8(15);
            w.u32(*id);
        }
        Value::Channel(id) => {
            w.u8(16);
            w.u32(*id);
        }
        Value::TypeDesc(name) => {
            w.u8(17);
            w.lp_str(name);
        }
        Value::Enum { type_id, int_value, name } => {
            w.u8(18);
            w.u32(*type_id);
            w.i64(*int_value);
            w.lp_str(name);
        }
    }
}

fn read_value(r: &mut Reader) -> Result<Value, LoadError> {
    let tag = r.u8()?;
    Ok(match tag {
        0 => Value::Nil,
        1 => Value::None,
        2 => Value::Bool(r.u8()? != 0),
        3 => Value::Char(r.u8()?),
        4 => Value::Int(r.i64()?),
        5 => Value::Float(r.f64()?),
        6 => Value::String(r.lp_str("string constant")?),
        9 => Value::Some(Box::new(read_value(r)?)),
        10 => Value::Ok(Box::new(read_value(r)?)),
        11 => Value::Err(Box::new(read_value(r)?)),
        12 => Value::Ref(r.u32()?),
        13 => Value::Weak(r.u32()?),
        14 => Value::Closure(r.u32()?),
        15 => Value::Coroutine(r.u32()?),
        16 => Value::Channel(r.u32()?),
        17 => Value::TypeDesc(r.lp_str("typedesc constant")?),
        18 => {
            let type_id = r.u32()?;
            let int_value = r.i64()?;
            let name = r.lp_str("enum constant name")?;
            Value::Enum { type_id, int_value, name }
        }
        other => return Err(LoadError::CorruptValueTag(other)),
    })
}

/// Serializes a [`Program`] into the `"ETCH"` container, per `spec.md` §6.1.
pub fn save(program: &Program, header: Header) -> Vec<u8> {
    let mut w = Writer::new();
    w.bytes_fixed(&MAGIC);
    w.u8(header.vm_type);
    w.u32(header.version);
    w.bytes_fixed(&header.source_hash);
    w.bytes_fixed(&header.compiler_version_hash);
    w.u8(header.flags);
    w.lp_str(&program.source_filename);
    w.u32(program.entry_point);

    w.u32(program.constants.len() as u32);
    for c in &program.constants {
        write_value(&mut w, c);
    }

    w.u32(program.instructions.len() as u32);
    for instr in &program.instructions {
        instr.encode(&mut w.buf);
    }

    w.u32(program.debug_info.len() as u32);
    for d in &program.debug_info {
        w.u32(d.line);
        w.u32(d.column);
        w.lp_str(&d.source_file);
        w.lp_str(&d.function_name);
    }

    w.u32(program.functions.len() as u32);
    for f in &program.functions {
        w.lp_str(&f.name);
        w.lp_str(&f.base_name);
        match &f.kind {
            FunctionKind::Native { start_pc, end_pc, max_register } => {
                w.u8(0);
                w.u32(*start_pc);
                w.u32(*end_pc);
                w.u8(*max_register);
            }
            FunctionKind::CffiSym { library, library_path, symbol } => {
                w.u8(1);
                w.lp_str(library);
                w.lp_str(library_path);
                w.lp_str(symbol);
            }
            FunctionKind::Host => w.u8(2),
            FunctionKind::Builtin { builtin_id } => {
                w.u8(3);
                w.buf.extend_from_slice(&builtin_id.to_le_bytes());
            }
        }
        w.u32(f.param_types.len() as u32);
        for p in &f.param_types {
            w.lp_str(p);
        }
        w.lp_str(&f.return_type);
    }

    w.u32(program.function_index.len() as u32);
    for name in &program.function_index {
        w.lp_str(name);
    }

    w.u32(program.lifetimes.len() as u32);
    for lt in &program.lifetimes {
        w.lp_str(&lt.name);
        w.u32(lt.ranges.len() as u32);
        for r in &lt.ranges {
            w.lp_str(&r.var_name);
            w.u8(r.register);
            w.u32(r.start_pc);
            w.u32(r.end_pc);
            w.u32(r.def_pc);
            w.u32(r.last_use_pc);
            w.u32(r.scope_level);
        }
    }

    w.buf
}

/// Reads just the header (steps 1–6), for cache validation, without
/// touching the rest of the image.
pub fn load_header(bytes: &[u8]) -> Result<Header, LoadError> {
    let mut r = Reader::new(bytes);
    let magic: [u8; 4] = r.bytes_fixed(4, "magic")?.try_into().unwrap();
    if magic != MAGIC {
        return Err(LoadError::BadMagic(magic));
    }
    let vm_type = r.u8()?;
    let version = r.u32()?;
    if version != FORMAT_VERSION {
        return Err(LoadError::VersionMismatch { expected: FORMAT_VERSION, found: version });
    }
    let source_hash: [u8; 32] = r.bytes_fixed(32, "source hash")?.try_into().unwrap();
    let compiler_version_hash: [u8; 32] = r.bytes_fixed(32, "compiler version hash")?.try_into().unwrap();
    let flags = r.u8()?;
    Ok(Header { vm_type, version, source_hash, compiler_version_hash, flags })
}

/// Deserializes a full [`Program`] from the `"ETCH"` container.
pub fn load(bytes: &[u8]) -> Result<(Program, Header), LoadError> {
    let header = load_header(bytes)?;
    let mut r = Reader::new(bytes);
    r.pos = 4 + 1 + 4 + 32 + 32 + 1; // past the header, re-parsed above

    let mut program = Program { entry_point: 0, ..Program::default() };
    program.source_filename = r.lp_str("source filename")?;
    program.entry_point = r.u32()?;

    let n_constants = r.u32()?;
    for _ in 0..n_constants {
        program.constants.push(read_value(&mut r)?);
    }

    let n_instructions = r.u32()?;
    for _ in 0..n_instructions {
        let offset = r.pos;
        let (instr, consumed) =
            Instruction::decode(r.remaining()).map_err(|source| LoadError::Instruction { offset, source })?;
        r.pos += consumed;
        program.instructions.push(instr);
    }

    let n_debug = r.u32()?;
    if n_debug != n_instructions {
        return Err(LoadError::DebugInfoCountMismatch {
            debug_count: n_debug,
            instruction_count: n_instructions,
        });
    }
    for _ in 0..n_debug {
        let line = r.u32()?;
        let column = r.u32()?;
        let source_file = r.lp_str("debug source file")?;
        let function_name = r.lp_str("debug function name")?;
        program.debug_info.push(DebugInfo { line, column, source_file, function_name });
    }

    let n_functions = r.u32()?;
    for _ in 0..n_functions {
        let name = r.lp_str("function name")?;
        let base_name = r.lp_str("function base name")?;
        let kind_byte = r.u8()?;
        let kind = match kind_byte {
            0 => {
                let start_pc = r.u32()?;
                let end_pc = r.u32()?;
                let max_register = r.u8()?;
                FunctionKind::Native { start_pc, end_pc, max_register }
            }
            1 => {
                let library = r.lp_str("cffi library")?;
                let library_path = r.lp_str("cffi library path")?;
                let symbol = r.lp_str("cffi symbol")?;
                FunctionKind::CffiSym { library, library_path, symbol }
            }
            2 => FunctionKind::Host,
            3 => {
                let raw = r.bytes_fixed(2, "builtin id")?;
                FunctionKind::Builtin { builtin_id: u16::from_le_bytes(raw.try_into().unwrap()) }
            }
            other => return Err(LoadError::UnknownFunctionKind(other)),
        };
        let n_params = r.u32()?;
        let mut param_types = Vec::with_capacity(n_params as usize);
        for _ in 0..n_params {
            param_types.push(r.lp_str("param type")?);
        }
        let return_type = r.lp_str("return type")?;
        program.functions.push(FunctionEntry { name, base_name, kind, param_types, return_type });
    }

    let n_index = r.u32()?;
    for _ in 0..n_index {
        program.function_index.push(r.lp_str("function index name")?);
    }

    let n_lifetimes = r.u32()?;
    for _ in 0..n_lifetimes {
        let name = r.lp_str("lifetime function name")?;
        let n_ranges = r.u32()?;
        let mut ranges = Vec::with_capacity(n_ranges as usize);
        for _ in 0..n_ranges {
            let var_name = r.lp_str("lifetime var name")?;
            let register = r.u8()?;
            let start_pc = r.u32()?;
            let end_pc = r.u32()?;
            let def_pc = r.u32()?;
            let last_use_pc = r.u32()?;
            let scope_level = r.u32()?;
            ranges.push(LiveRange { var_name, register, start_pc, end_pc, def_pc, last_use_pc, scope_level });
        }
        program.lifetimes.push(FunctionLifetime { name, ranges });
    }

    Ok((program, header))
}

impl From<io::Error> for LoadError {
    fn from(_: io::Error) -> Self {
        LoadError::Truncated("io")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etch_asm::Abx;

    fn sample_program() -> Program {
        let mut p = Program::default();
        p.source_filename = "main.etch".into();
        p.entry_point = 0;
        p.constants.push(Value::Int(6));
        p.constants.push(Value::Int(7));
        p.instructions.push(Instruction::LoadK(Abx { a: 0, bx: 0 }));
        p.debug_info.push(DebugInfo { line: 1, column: 1, source_file: "main.etch".into(), function_name: "<global>".into() });
        p.functions.push(FunctionEntry {
            name: "<global>".into(),
            base_name: "<global>".into(),
            kind: FunctionKind::Native { start_pc: 0, end_pc: 1, max_register: 4 },
            param_types: Vec::new(),
            return_type: "Nil".into(),
        });
        p.function_index.push("<global>".into());
        p
    }

    #[test]
    fn header_round_trips() {
        let p = sample_program();
        let header = Header { vm_type: 1, version: FORMAT_VERSION, source_hash: [0; 32], compiler_version_hash: [0; 32], flags: FLAG_DEBUG };
        let bytes = save(&p, header);
        let read_back = load_header(&bytes).unwrap();
        assert_eq!(read_back, header);
    }

    #[test]
    fn full_round_trip_preserves_program() {
        let p = sample_program();
        let header = Header { vm_type: 1, version: FORMAT_VERSION, source_hash: [1; 32], compiler_version_hash: [2; 32], flags: 0 };
        let bytes = save(&p, header);
        let (loaded, _) = load(&bytes).unwrap();
        assert_eq!(loaded.source_filename.as_ref(), p.source_filename.as_ref());
        assert_eq!(loaded.entry_point, p.entry_point);
        assert_eq!(loaded.constants, p.constants);
        assert_eq!(loaded.instructions.len(), p.instructions.len());
        assert_eq!(loaded.functions.len(), p.functions.len());
    }

    #[test]
    fn bad_magic_rejected() {
        let bytes = b"NOPE".to_vec();
        assert!(matches!(load_header(&bytes), Err(LoadError::BadMagic(_))));
    }

    #[test]
    fn debug_count_mismatch_rejected() {
        let mut p = sample_program();
        p.debug_info.clear();
        let header = Header { vm_type: 1, version: FORMAT_VERSION, source_hash: [0; 32], compiler_version_hash: [0; 32], flags: 0 };
        let bytes = save(&p, header);
        assert!(matches!(load(&bytes), Err(LoadError::DebugInfoCountMismatch { .. })));
    }
}
