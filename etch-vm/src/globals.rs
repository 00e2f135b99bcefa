//! The VM-owned global variable table (`spec.md` §5: "Globals are mutated
//! only via global opcodes").

use std::collections::HashMap;

use crate::value::{EtchString, Value};

#[derive(Debug, Default)]
pub struct Globals {
    vars: HashMap<EtchString, Value>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Value {
        self.vars.get(name).cloned().unwrap_or(Value::Nil)
    }

    pub fn set(&mut self, name: EtchString, v: Value) {
        self.vars.insert(name, v);
    }

    /// `InitGlobal`: only writes when the name is absent.
    pub fn init(&mut self, name: EtchString, v: Value) {
        self.vars.entry(name).or_insert(v);
    }

    /// Every live global value, for the cycle collector's root scan.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.vars.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_does_not_overwrite() {
        let mut g = Globals::new();
        g.init("x".into(), Value::Int(1));
        g.init("x".into(), Value::Int(2));
        assert_eq!(g.get("x"), Value::Int(1));
    }
}
