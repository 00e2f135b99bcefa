//! The shared output buffer `print`-family builtins append to
//! (`spec.md` §4.G, §8 invariant 8: output order equals issue order).

use crate::hooks::Hooks;

#[derive(Debug, Default)]
pub struct OutputBuffer {
    buf: Vec<u8>,
    flush_threshold: usize,
    sink: Vec<u8>,
}

impl OutputBuffer {
    pub fn new(flush_threshold: usize) -> Self {
        OutputBuffer { buf: Vec::new(), flush_threshold, sink: Vec::new() }
    }

    /// Appends `bytes`, then flushes if the threshold is crossed or a
    /// tracer hook asks to pause. Flushing on every entry-frame `Return`
    /// is the caller's (`vm::Vm`) responsibility, not this buffer's.
    pub fn append(&mut self, bytes: &[u8], hooks: &mut Hooks) {
        self.buf.extend_from_slice(bytes);
        let hook_result = hooks.on_output(bytes);
        if self.buf.len() >= self.flush_threshold || !hook_result.is_continue() {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        self.sink.extend_from_slice(&self.buf);
        self.buf.clear();
    }

    /// All bytes flushed so far, in issue order. Test-only accessor; a real
    /// embedder would point `sink` at stdout instead of buffering forever.
    pub fn flushed(&self) -> &[u8] {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_on_threshold() {
        let mut hooks = Hooks::default();
        let mut out = OutputBuffer::new(4);
        out.append(b"ab", &mut hooks);
        assert!(out.flushed().is_empty());
        out.append(b"cd", &mut hooks);
        assert_eq!(out.flushed(), b"abcd");
    }
}
