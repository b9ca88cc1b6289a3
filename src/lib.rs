//! heapscope: a heap memory profiler for native Linux programs.
//!
//! The in-process tracer lives in the `heapscope-preload` crate; this crate
//! holds everything that runs offline: the launcher piping a traced child
//! through the interpret pass, the stream parser with its intern tables and
//! cost accounting, the derived views (bottom-up, top-down, caller-callee,
//! size histogram, chart series, diff), and the report writers.

pub mod analyze;
pub mod core;
pub mod interpret;
pub mod recorder;
pub mod ui;
