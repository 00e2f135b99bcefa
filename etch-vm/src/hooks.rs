//! Observation points for debugger, profiler, and replay tooling
//! (`spec.md` §4.K). The core calls these at well-defined points in the
//! dispatch loop and call protocol; none of them are required to be
//! present — `Hooks::default()` is a no-op set.

use etch_asm::Instruction;

use crate::value::Value;

/// What a hook wants the dispatch loop to do next. A non-[`Continue`]
/// result is itself a suspension point (`spec.md` §4.G).
///
/// [`Continue`]: HookAction::Continue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    Pause,
    Abort(String),
}

impl Default for HookAction {
    fn default() -> Self {
        HookAction::Continue
    }
}

impl HookAction {
    pub fn is_continue(&self) -> bool {
        matches!(self, HookAction::Continue)
    }
}

/// Called before each instruction executes. Implementors typically
/// maintain their own breakpoint/step state.
pub trait Debugger {
    fn before_instruction(&mut self, pc: u32, instr: &Instruction) -> HookAction;
}

/// Called around function entry/exit, purely for measurement; its return
/// value is advisory only (the dispatch loop doesn't gate on it) unlike
/// [`Debugger`]/[`Tracer`].
pub trait Profiler {
    fn on_call_enter(&mut self, func_name: &str, pc: u32);
    fn on_call_exit(&mut self, func_name: &str, pc: u32);
}

/// Called on externally visible effects (prints, global writes) for replay
/// recording/diffing.
pub trait Tracer {
    fn on_output(&mut self, bytes: &[u8]) -> HookAction;
    fn on_global_write(&mut self, name: &str, value: &Value) -> HookAction;
}

/// Supplies recorded host-call results during a replay run instead of
/// invoking the real host function (`spec.md` §9 foreign-function note).
pub trait ReplaySource {
    fn next_host_result(&mut self, func_name: &str) -> Option<Value>;
}

/// The set of hooks a [`crate::config::VmConfig`] may install. Each slot is
/// independently optional.
#[derive(Default)]
pub struct Hooks {
    pub debugger: Option<Box<dyn Debugger>>,
    pub profiler: Option<Box<dyn Profiler>>,
    pub tracer: Option<Box<dyn Tracer>>,
    pub replay: Option<Box<dyn ReplaySource>>,
}

impl Hooks {
    pub fn none() -> Self {
        Hooks::default()
    }

    pub fn before_instruction(&mut self, pc: u32, instr: &Instruction) -> HookAction {
        self.debugger.as_deref_mut().map(|d| d.before_instruction(pc, instr)).unwrap_or_default()
    }

    pub fn on_output(&mut self, bytes: &[u8]) -> HookAction {
        self.tracer.as_deref_mut().map(|t| t.on_output(bytes)).unwrap_or_default()
    }

    pub fn on_global_write(&mut self, name: &str, value: &Value) -> HookAction {
        self.tracer.as_deref_mut().map(|t| t.on_global_write(name, value)).unwrap_or_default()
    }

    pub fn on_call_enter(&mut self, func_name: &str, pc: u32) {
        if let Some(p) = self.profiler.as_deref_mut() {
            p.on_call_enter(func_name, pc);
        }
    }

    pub fn on_call_exit(&mut self, func_name: &str, pc: u32) {
        if let Some(p) = self.profiler.as_deref_mut() {
            p.on_call_exit(func_name, pc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingDebugger {
        calls: std::rc::Rc<std::cell::Cell<u32>>,
    }

    impl Debugger for CountingDebugger {
        fn before_instruction(&mut self, _pc: u32, _instr: &Instruction) -> HookAction {
            self.calls.set(self.calls.get() + 1);
            HookAction::Continue
        }
    }

    #[test]
    fn absent_hooks_default_to_continue() {
        let mut hooks = Hooks::none();
        let instr = Instruction::NoOp(etch_asm::Abc { a: 0, b: 0, c: 0 });
        assert_eq!(hooks.before_instruction(0, &instr), HookAction::Continue);
    }

    #[test]
    fn installed_debugger_is_invoked() {
        let calls = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut hooks = Hooks::default();
        hooks.debugger = Some(Box::new(CountingDebugger { calls: calls.clone() }));
        let instr = Instruction::NoOp(etch_asm::Abc { a: 0, b: 0, c: 0 });
        hooks.before_instruction(1, &instr);
        hooks.before_instruction(2, &instr);
        assert_eq!(calls.get(), 2);
    }
}
