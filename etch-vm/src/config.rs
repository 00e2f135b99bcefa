//! VM construction and tunables (`spec.md` §6.2).

use crate::hooks::Hooks;

/// Cycle-detection scheduling strategy (`spec.md` §4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum GcMode {
    /// Operation-counter-driven scans with adaptive threshold and EMA
    /// allocation-rate pressure; runs to completion once triggered.
    Eager,
    /// Time-sliced scans bounded by a per-frame microsecond budget
    /// (`spec.md` §4.B "frame-budgeted mode").
    FrameBudgeted { budget_us: u64 },
}

impl Default for GcMode {
    fn default() -> Self {
        GcMode::Eager
    }
}

/// Construction-time configuration for a [`crate::vm::Vm`]
/// (`spec.md` §6.2). There is exactly one way to build a `Vm`: through
/// `Vm::new(program, config, host_fns)` — no builder, no partial
/// construction, matching the teacher's single-entry-point
/// `Interpreter::with_storage`-family constructors.
pub struct VmConfig {
    pub gc_mode: GcMode,
    pub initial_heap_capacity: usize,
    /// Output buffer is flushed once it holds at least this many bytes
    /// (`spec.md` §4.G).
    pub output_flush_threshold: usize,
    pub hooks: Hooks,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            gc_mode: GcMode::default(),
            initial_heap_capacity: 64,
            output_flush_threshold: 4096,
            hooks: Hooks::default(),
        }
    }
}

impl std::fmt::Debug for VmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmConfig")
            .field("gc_mode", &self.gc_mode)
            .field("initial_heap_capacity", &self.initial_heap_capacity)
            .field("output_flush_threshold", &self.output_flush_threshold)
            .field("hooks", &"..")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_eager_gc() {
        let cfg = VmConfig::default();
        assert_eq!(cfg.gc_mode, GcMode::Eager);
    }
}
