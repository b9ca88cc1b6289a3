//! Flamegraph output: collapsed stack lines weighted by a selectable cost
//! member, optionally rendered to an SVG.

use std::collections::HashMap;
use std::io::Write;

use anyhow::Result;
use inferno::flamegraph::{Direction, Options};

use crate::analyze::{function_name, Symbol};
use crate::core::trace_data::TraceData;
use crate::ui::CostMember;

#[derive(Default)]
pub struct Stats {
    pub counts: HashMap<String, i64>,
}

impl Stats {
    /// Collapse every allocation's backtrace into a `root;…;leaf` line
    /// weighted by `member`. Entries costing less than `cost_threshold`
    /// are dropped to keep the graph readable.
    pub fn collect(data: &TraceData, member: CostMember, cost_threshold: i64) -> Stats {
        let mut stats = Stats::default();
        for allocation in &data.allocations {
            let cost = member.get(&allocation.data);
            if cost <= 0 || cost < cost_threshold {
                continue;
            }

            let mut frames = Vec::new();
            let mut trace_index = allocation.trace_index;
            let mut guard = std::collections::HashSet::new();
            while trace_index.is_valid() && guard.insert(trace_index.0) {
                let trace = data.find_trace(trace_index);
                let ip = data.find_ip(trace.ip);
                frames.push(function_name(data, &Symbol::of(&ip)).into_owned());
                if data.is_stop_index(ip.frame.function) {
                    break;
                }
                trace_index = trace.parent;
            }
            if frames.is_empty() {
                continue;
            }
            frames.reverse();
            *stats.counts.entry(frames.join(";")).or_insert(0) += cost;
        }
        stats
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn write_collapsed(&self, out: &mut dyn Write) -> Result<()> {
        for line in self.lines() {
            writeln!(out, "{}", line)?;
        }
        Ok(())
    }

    pub fn write_flamegraph(
        &self,
        out: &mut dyn Write,
        member: CostMember,
        min_width: f64,
    ) -> Result<()> {
        if self.is_empty() {
            eprintln!("Warning: no allocation data was collected");
            return Ok(());
        }
        let mut options = Options::default();
        options.direction = Direction::Inverted;
        options.min_width = min_width;
        options.count_name = if member.is_bytes() {
            "bytes".to_string()
        } else {
            "allocations".to_string()
        };
        let lines = self.lines();
        inferno::flamegraph::from_lines(&mut options, lines.iter().map(|x| x.as_str()), out)?;
        Ok(())
    }

    fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .counts
            .iter()
            .map(|(stack, count)| format!("{} {}", stack, count))
            .collect();
        lines.sort();
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::parse_str;

    fn fixture() -> TraceData {
        let input = "\
v 10200 3
s /bin/app
s main
s a
s alloc_helper
i 100 1 2
i 200 1 3
i 300 1 4
t 1 0
t 2 1
t 3 2
a 40 3
+ 0
+ 0
";
        parse_str(input)
    }

    #[test]
    fn collapsed_lines_run_root_to_leaf() {
        let data = fixture();
        let stats = Stats::collect(&data, CostMember::Leaked, 0);
        assert_eq!(stats.counts.len(), 1);
        assert_eq!(stats.counts["main;a;alloc_helper"], 0x80);

        let mut out = Vec::new();
        stats.write_collapsed(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "main;a;alloc_helper 128\n"
        );
    }

    #[test]
    fn threshold_drops_small_entries() {
        let data = fixture();
        let stats = Stats::collect(&data, CostMember::Leaked, 0x100);
        assert!(stats.is_empty());
    }

    #[test]
    fn allocation_counts_weight_the_stacks() {
        let data = fixture();
        let stats = Stats::collect(&data, CostMember::Allocations, 0);
        assert_eq!(stats.counts["main;a;alloc_helper"], 2);
    }

    #[test]
    fn svg_rendering_succeeds() {
        let data = fixture();
        let stats = Stats::collect(&data, CostMember::Leaked, 0);
        let mut svg = Vec::new();
        stats
            .write_flamegraph(&mut svg, CostMember::Leaked, 0.1)
            .unwrap();
        let text = String::from_utf8(svg).unwrap();
        assert!(text.contains("<svg"));
        assert!(text.contains("alloc_helper"));
    }
}
