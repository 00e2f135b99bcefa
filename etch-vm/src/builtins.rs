//! Reserved builtin functions (`spec.md` §6.3), dispatched by the small
//! integer `builtin_id` baked into the program image rather than by name.

use crate::heap::Heap;
use crate::value::Value;

/// Dense ids assigned in the same order `spec.md` §6.3 lists the reserved
/// builtin names; a compiler targeting this core is expected to emit these
/// exact ids in its `FunctionKind::Builtin` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Builtin {
    Print = 0,
    New = 1,
    Deref = 2,
    Seed = 3,
    Rand = 4,
    ArrayNew = 5,
    ReadFile = 6,
    ParseInt = 7,
    ParseFloat = 8,
    ParseBool = 9,
    IsSome = 10,
    IsNone = 11,
    IsOk = 12,
    IsErr = 13,
    MakeClosure = 14,
    InvokeClosure = 15,
}

impl Builtin {
    pub const fn from_id(id: u16) -> Option<Self> {
        Some(match id {
            0 => Builtin::Print,
            1 => Builtin::New,
            2 => Builtin::Deref,
            3 => Builtin::Seed,
            4 => Builtin::Rand,
            5 => Builtin::ArrayNew,
            6 => Builtin::ReadFile,
            7 => Builtin::ParseInt,
            8 => Builtin::ParseFloat,
            9 => Builtin::ParseBool,
            10 => Builtin::IsSome,
            11 => Builtin::IsNone,
            12 => Builtin::IsOk,
            13 => Builtin::IsErr,
            14 => Builtin::MakeClosure,
            15 => Builtin::InvokeClosure,
            _ => return None,
        })
    }
}

/// `print`'s argument-to-bytes conversion: strings/chars pass through
/// verbatim, everything else uses its `Cast`-to-string rendering
/// (`spec.md` §4.D canonical formatting).
pub fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.to_string(),
        Value::Char(c) => (*c as char).to_string(),
        other => match crate::cast::cast(other, crate::value::ValueTag::String) {
            Value::String(s) => s.to_string(),
            _ => "nil".to_string(),
        },
    }
}

/// `is_some`/`is_none`/`is_ok`/`is_err`: tag tests with no heap access
/// needed.
pub fn is_some(v: &Value) -> Value {
    Value::Bool(matches!(v, Value::Some(_)))
}
pub fn is_none(v: &Value) -> Value {
    Value::Bool(matches!(v, Value::None))
}
pub fn is_ok(v: &Value) -> Value {
    Value::Bool(matches!(v, Value::Ok(_)))
}
pub fn is_err(v: &Value) -> Value {
    Value::Bool(matches!(v, Value::Err(_)))
}

pub fn parse_int(v: &Value) -> Value {
    match v {
        Value::String(s) => s.trim().parse::<i64>().map(Value::Int).unwrap_or(Value::Nil),
        _ => Value::Nil,
    }
}

pub fn parse_float(v: &Value) -> Value {
    match v {
        Value::String(s) => s.trim().parse::<f64>().map(Value::Float).unwrap_or(Value::Nil),
        _ => Value::Nil,
    }
}

pub fn parse_bool(v: &Value) -> Value {
    match v {
        Value::String(s) => match s.as_ref() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::Nil,
        },
        _ => Value::Nil,
    }
}

/// `deref`: strong-dereference a `Ref` cell, or pass everything else
/// through unchanged (dereferencing a non-`Ref` is not an error, matching
/// the core's "mismatched kinds degrade, never trap" posture).
pub fn deref(heap: &Heap, v: &Value) -> Value {
    match v {
        Value::Ref(id) => heap.get_ref_cell(*id),
        other => other.clone(),
    }
}

/// `new`: wraps a scalar in a fresh heap-allocated `Ref` cell.
pub fn new_ref(heap: &mut Heap, v: Value) -> Value {
    let id = heap.alloc_ref_cell(v);
    Value::Ref(id)
}

pub fn array_new(heap: &mut Heap, size: i64) -> Value {
    let id = heap.alloc_array(size.max(0) as usize);
    Value::Array(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stringify_matches_cast_rules() {
        assert_eq!(stringify(&Value::Float(3.0)), "3.0");
        assert_eq!(stringify(&Value::Int(42)), "42");
        assert_eq!(stringify(&Value::String("hi".into())), "hi");
    }

    #[test]
    fn tag_predicates() {
        assert_eq!(is_some(&Value::Some(Box::new(Value::Nil))), Value::Bool(true));
        assert_eq!(is_none(&Value::Some(Box::new(Value::Nil))), Value::Bool(false));
        assert_eq!(is_err(&Value::Err(Box::new(Value::Nil))), Value::Bool(true));
    }

    #[test]
    fn parse_helpers_fail_soft() {
        assert_eq!(parse_int(&Value::String("nope".into())), Value::Nil);
        assert_eq!(parse_int(&Value::String(" 42 ".into())), Value::Int(42));
    }
}
