//! Massif compatible output, written while parsing: one snapshot per
//! timestamp, detailed trees at a configurable frequency, and an entry
//! collapsing everything below the cost threshold.

use std::io::Write;

use crate::analyze::merged::{merge_by_leaf_ip, MergedAllocation};
use crate::core::indices::IpIndex;
use crate::core::trace_data::{Allocation, ParseObserver, TraceData};

pub struct MassifWriter<W: Write> {
    out: W,
    /// percentage of the current heap size below which allocations collapse
    /// into a single entry
    threshold: f64,
    /// every n-th snapshot carries a detailed tree; 0 disables the trees
    detailed_freq: usize,
    snapshot_id: usize,
    last_peak: i64,
    failed: bool,
}

impl<W: Write> MassifWriter<W> {
    pub fn new(out: W, threshold: f64, detailed_freq: usize) -> MassifWriter<W> {
        MassifWriter {
            out,
            threshold,
            detailed_freq,
            snapshot_id: 0,
            last_peak: 0,
            failed: false,
        }
    }

    pub fn write_header(&mut self, command: &str) {
        let result = (|| -> std::io::Result<()> {
            writeln!(self.out, "desc: heapscope")?;
            writeln!(self.out, "cmd: {}", command)?;
            writeln!(self.out, "time_unit: s")?;
            Ok(())
        })();
        self.check(result);
    }

    fn check(&mut self, result: std::io::Result<()>) {
        if let Err(error) = result {
            if !self.failed {
                log::warn!("failed to write massif data: {}", error);
            }
            self.failed = true;
        }
    }

    fn write_snapshot(&mut self, data: &TraceData, timestamp: i64, is_last: bool) {
        if self.failed {
            return;
        }

        // when this snapshot saw a new peak, annotate it with the peak
        // value; the error in time is at most the timer interval
        let heap_size = if data.total_cost.peak > self.last_peak {
            self.last_peak = data.total_cost.peak;
            self.last_peak
        } else {
            data.total_cost.leaked
        };

        let result = (|| -> std::io::Result<()> {
            writeln!(self.out, "#-----------")?;
            writeln!(self.out, "snapshot={}", self.snapshot_id)?;
            writeln!(self.out, "#-----------")?;
            writeln!(self.out, "time={}", 0.001 * timestamp as f64)?;
            writeln!(self.out, "mem_heap_B={}", heap_size)?;
            writeln!(self.out, "mem_heap_extra_B=0")?;
            writeln!(self.out, "mem_stacks_B=0")?;
            Ok(())
        })();
        self.check(result);

        let detailed = self.detailed_freq != 0
            && (is_last || self.snapshot_id % self.detailed_freq == 0);
        if detailed {
            let result = writeln!(self.out, "heap_tree=detailed");
            self.check(result);
            let threshold = heap_size as f64 * self.threshold * 0.01;
            self.write_backtrace(
                data,
                &data.allocations,
                heap_size,
                threshold as i64,
                IpIndex(0),
                0,
            );
        } else {
            let result = writeln!(self.out, "heap_tree=empty");
            self.check(result);
        }

        self.snapshot_id += 1;
    }

    fn write_backtrace(
        &mut self,
        data: &TraceData,
        allocations: &[Allocation],
        heap_size: i64,
        threshold: i64,
        location: IpIndex,
        depth: usize,
    ) {
        let mut skipped_leaked = 0i64;
        let mut num_allocs = 0usize;
        let mut skipped = 0usize;
        let mut merged = merge_by_leaf_ip(data, allocations);
        merged.sort_by_key(|entry| std::cmp::Reverse(entry.data.leaked));

        let ip = data.find_ip(location);
        // no caller levels above the entry point
        let is_main = data.is_stop_index(ip.frame.function);

        if !is_main {
            for entry in &mut merged {
                if entry.data.leaked <= 0 {
                    // sorted, the rest is uninteresting for massif
                    break;
                }
                if entry.data.leaked >= threshold {
                    num_allocs += 1;
                    // drop the first backtrace level, otherwise the
                    // recursion below never terminates
                    for allocation in &mut entry.traces {
                        allocation.trace_index =
                            data.find_trace(allocation.trace_index).parent;
                    }
                } else {
                    skipped += 1;
                    skipped_leaked += entry.data.leaked;
                }
            }
        }

        let result = (|| -> std::io::Result<()> {
            for _ in 0..depth {
                write!(self.out, " ")?;
            }
            write!(
                self.out,
                "n{}: {}",
                num_allocs + usize::from(skipped > 0),
                heap_size
            )?;
            if depth == 0 {
                writeln!(
                    self.out,
                    " (heap allocation functions) malloc/new/new[], --alloc-fns, etc."
                )?;
            } else {
                write!(self.out, " 0x{:x}: ", ip.address)?;
                if ip.frame.function.is_valid() {
                    write!(self.out, "{}", data.stringify(ip.frame.function))?;
                } else {
                    write!(self.out, "???")?;
                }
                write!(self.out, " (")?;
                if ip.frame.file.is_valid() {
                    write!(self.out, "{}:{}", data.stringify(ip.frame.file), ip.frame.line)?;
                } else if ip.module.is_valid() {
                    write!(self.out, "{}", data.stringify(ip.module))?;
                } else {
                    write!(self.out, "???")?;
                }
                writeln!(self.out, ")")?;
            }
            Ok(())
        })();
        self.check(result);

        if !is_main {
            let mut skipped_written = false;
            let mut write_skipped =
                |writer: &mut MassifWriter<W>, skipped_written: &mut bool| {
                    if skipped > 0 && !*skipped_written {
                        let result = (|| -> std::io::Result<()> {
                            for _ in 0..depth {
                                write!(writer.out, " ")?;
                            }
                            writeln!(
                                writer.out,
                                " n0: {} in {} places, all below massif's threshold ({})",
                                skipped_leaked, skipped, writer.threshold
                            )?;
                            Ok(())
                        })();
                        writer.check(result);
                        *skipped_written = true;
                    }
                };

            for entry in &merged {
                if entry.data.leaked > 0 && entry.data.leaked >= threshold {
                    if skipped_leaked > entry.data.leaked {
                        // inject the skipped entry here to keep the output
                        // sorted by size
                        write_skipped(self, &mut skipped_written);
                    }
                    self.write_child(data, entry, threshold, depth);
                }
            }
            write_skipped(self, &mut skipped_written);
        }
    }

    fn write_child(
        &mut self,
        data: &TraceData,
        entry: &MergedAllocation,
        threshold: i64,
        depth: usize,
    ) {
        self.write_backtrace(
            data,
            &entry.traces,
            entry.data.leaked,
            threshold,
            entry.ip,
            depth + 1,
        );
    }

    pub fn finish(self) -> bool {
        !self.failed
    }
}

impl<W: Write> ParseObserver for MassifWriter<W> {
    fn on_timestamp(&mut self, data: &TraceData, old_stamp: i64, new_stamp: i64, is_final: bool) {
        if is_final {
            self.write_snapshot(data, new_stamp, true);
        } else {
            self.write_snapshot(data, old_stamp, false);
        }
    }

    fn on_debuggee(&mut self, command: &str) {
        self.write_header(command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::trace_data::{ParsePass, TraceData};

    fn run_massif(input: &str, threshold: f64, detailed_freq: usize) -> String {
        let mut data = TraceData::new();
        let mut writer = MassifWriter::new(Vec::new(), threshold, detailed_freq);
        data.read(&mut input.as_bytes(), ParsePass::CollectCosts, &mut writer)
            .expect("parse failed");
        assert!(!writer.failed);
        String::from_utf8(writer.out).unwrap()
    }

    fn fixture_input() -> String {
        "\
v 10200 3
X app --run
s /bin/app
s main
s worker
i 100 1 2
i 200 1 3
t 1 0
t 2 1
a 400 2
+ 0
c a
+ 0
c 14
"
        .to_string()
    }

    #[test]
    fn snapshots_follow_the_timestamps() {
        let output = run_massif(&fixture_input(), 1.0, 0);
        assert!(output.starts_with("desc: heapscope\ncmd: app --run\ntime_unit: s\n"));
        // two timestamps plus the final snapshot
        assert_eq!(output.matches("snapshot=").count(), 3);
        assert!(output.contains("snapshot=0"));
        assert!(output.contains("time=0.01\n"));
        assert!(output.contains("mem_heap_B=1024\n"));
        assert!(output.contains("mem_heap_B=2048\n"));
        assert!(output.contains("mem_heap_extra_B=0"));
        assert!(output.contains("mem_stacks_B=0"));
        // detailed trees disabled
        assert!(!output.contains("heap_tree=detailed"));
        assert_eq!(output.matches("heap_tree=empty").count(), 3);
    }

    #[test]
    fn detailed_tree_names_the_callers() {
        let output = run_massif(&fixture_input(), 1.0, 1);
        assert!(output.contains("heap_tree=detailed"));
        assert!(output
            .contains("n1: 2048 (heap allocation functions) malloc/new/new[], --alloc-fns, etc."));
        assert!(output.contains(" n1: 2048 0x200: worker (/bin/app)"), "{}", output);
        // the walk ends at main
        assert!(output.contains("  n0: 2048 0x100: main (/bin/app)"), "{}", output);
    }

    #[test]
    fn below_threshold_entries_collapse() {
        let input = "\
v 10200 3
X app
s /bin/app
s main
s big
s small
i 100 1 2
i 200 1 3
i 300 1 4
t 1 0
t 2 1
t 3 1
a 10000 2
a 8 3
+ 0
+ 1
c 1
";
        // 1% of 65544 is above 8, the small allocation collapses
        let output = run_massif(input, 1.0, 1);
        assert!(
            output.contains("n0: 8 in 1 places, all below massif's threshold (1)"),
            "{}",
            output
        );
        assert!(output.contains("big"));
        assert!(!output.contains("0x300: small"));
    }
}
