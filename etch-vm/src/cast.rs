//! The `Cast` opcode's conversion table (`spec.md` §4.D).

use crate::value::{Value, ValueTag};

/// `Cast` opcode execution: convert `v` to `dest` tag, or `Nil` on an
/// unsupported/failing conversion. Mirrors `convert.rs`'s narrow,
/// single-purpose helper style in the teacher crate.
pub fn cast(v: &Value, dest: ValueTag) -> Value {
    match dest {
        ValueTag::Int => cast_to_int(v),
        ValueTag::Float => cast_to_float(v),
        ValueTag::String => cast_to_string(v),
        ValueTag::Bool => match v {
            Value::Bool(b) => Value::Bool(*b),
            _ => Value::Nil,
        },
        _ => Value::Nil,
    }
}

fn cast_to_int(v: &Value) -> Value {
    match v {
        Value::Int(x) => Value::Int(*x),
        // Truncates toward zero, matching Rust's `as` cast semantics for
        // finite values; NaN/inf saturate rather than panic.
        Value::Float(x) => Value::Int(*x as i64),
        Value::String(s) => s.parse::<i64>().map(Value::Int).unwrap_or(Value::Nil),
        Value::Enum { int_value, .. } => Value::Int(*int_value),
        Value::TypeDesc(name) => Value::Int(hash_name(name) as i64),
        _ => Value::Nil,
    }
}

fn cast_to_float(v: &Value) -> Value {
    match v {
        Value::Int(x) => Value::Float(*x as f64),
        Value::Float(x) => Value::Float(*x),
        Value::String(s) => s.parse::<f64>().map(Value::Float).unwrap_or(Value::Nil),
        _ => Value::Nil,
    }
}

fn cast_to_string(v: &Value) -> Value {
    match v {
        Value::Int(x) => Value::String(x.to_string().into()),
        // Floats always show a decimal point: whole values print as "X.0".
        Value::Float(x) => {
            let s = if x.fract() == 0.0 && x.is_finite() {
                format!("{x:.1}")
            } else {
                x.to_string()
            };
            Value::String(s.into())
        }
        Value::String(s) => Value::String(s.clone()),
        Value::Bool(b) => Value::String(b.to_string().into()),
        Value::Char(c) => Value::String((*c as char).to_string().into()),
        _ => Value::Nil,
    }
}

/// String hash used for `typedesc → int` casts (`spec.md` §4.D). FNV-1a:
/// small, dependency-free, and stable across builds/targets, which matters
/// since compiled programs may embed the resulting constant.
fn hash_name(name: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for byte in name.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_to_string_always_shows_decimal() {
        assert_eq!(cast(&Value::Float(3.0), ValueTag::String), Value::String("3.0".into()));
        assert_eq!(cast(&Value::Float(3.5), ValueTag::String), Value::String("3.5".into()));
    }

    #[test]
    fn string_parse_failure_is_nil() {
        assert_eq!(cast(&Value::String("abc".into()), ValueTag::Int), Value::Nil);
    }

    #[test]
    fn int_float_round_trip() {
        assert_eq!(cast(&Value::Int(7), ValueTag::Float), Value::Float(7.0));
        assert_eq!(cast(&Value::Float(7.9), ValueTag::Int), Value::Int(7));
    }

    #[test]
    fn enum_to_int_uses_stored_value() {
        let e = Value::Enum { type_id: 1, int_value: 42, name: "Color::Red".into() };
        assert_eq!(cast(&e, ValueTag::Int), Value::Int(42));
    }

    #[test]
    fn typedesc_hash_is_stable() {
        let a = cast(&Value::TypeDesc("Foo".into()), ValueTag::Int);
        let b = cast(&Value::TypeDesc("Foo".into()), ValueTag::Int);
        assert_eq!(a, b);
    }
}
