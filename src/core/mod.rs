pub mod indices;
pub mod peak;
pub mod pointer_map;
pub mod reader;
pub mod trace_data;

mod diff;

#[cfg(test)]
pub(crate) mod tests {
    use crate::core::trace_data::{NoopObserver, ParsePass, TraceData};

    /// Minimal interned preamble of a new-format stream: one module, one
    /// function, one instruction pointer and a single trace node with index
    /// 1 for the `a` lines of the tests to reference.
    pub fn new_format_header() -> String {
        "v 10200 3\n\
         X test_program --fast\n\
         I 1000 40000\n\
         s /usr/lib/libtest.so\n\
         s test_func\n\
         i dead 1 2\n\
         t 1 0\n"
            .to_string()
    }

    /// Same preamble in the legacy format whose events carry raw pointers.
    pub fn legacy_header() -> String {
        "v 100 1\n\
         X test_program --fast\n\
         I 1000 40000\n\
         s /usr/lib/libtest.so\n\
         s test_func\n\
         i dead 1 2\n\
         t 1 0\n"
            .to_string()
    }

    pub fn parse_str(input: &str) -> TraceData {
        let mut data = TraceData::new();
        data.read(
            &mut input.as_bytes(),
            ParsePass::CollectCosts,
            &mut NoopObserver,
        )
        .expect("parse failed");
        data
    }
}
