/// Bounded backtrace capture for the allocation hooks.
///
/// The buffer is a plain array so that filling it never allocates; the
/// backend walks frames via the unsynchronized tracer, which is safe here
/// because every thread only ever unwinds its own stack.
pub struct Trace {
    size: usize,
    skip: usize,
    data: [usize; Trace::MAX_SIZE],
}

impl Trace {
    pub const MAX_SIZE: usize = 64;

    pub fn new() -> Trace {
        Trace {
            size: 0,
            skip: 0,
            data: [0; Trace::MAX_SIZE],
        }
    }

    /// Capture the current call stack, discarding the first `skip` frames.
    /// Returns true iff any frame remains.
    pub fn fill(&mut self, skip: usize) -> bool {
        let mut size = 0;
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                self.data[size] = frame.ip() as usize;
                size += 1;
                size < Trace::MAX_SIZE
            });
        }
        // some backends report trailing null frames, trim them
        while size > 0 && self.data[size - 1] == 0 {
            size -= 1;
        }
        self.size = size.saturating_sub(skip);
        self.skip = skip.min(size);
        self.size > 0
    }

    /// Captured instruction pointers, innermost first.
    pub fn ips(&self) -> &[usize] {
        &self.data[self.skip..self.skip + self.size]
    }
}

impl Default for Trace {
    fn default() -> Trace {
        Trace::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_captures_frames() {
        let mut trace = Trace::new();
        assert!(trace.fill(0));
        assert!(!trace.ips().is_empty());
        assert!(trace.ips().len() <= Trace::MAX_SIZE);
        assert!(trace.ips().iter().all(|&ip| ip != 0));
    }

    #[test]
    fn skip_discards_innermost_frames() {
        let mut full = Trace::new();
        assert!(full.fill(0));
        let mut skipped = Trace::new();
        assert!(skipped.fill(2));
        assert!(skipped.ips().len() <= full.ips().len());
    }

    #[test]
    fn oversized_skip_yields_empty_trace() {
        let mut trace = Trace::new();
        assert!(!trace.fill(Trace::MAX_SIZE + 1));
        assert!(trace.ips().is_empty());
    }
}
