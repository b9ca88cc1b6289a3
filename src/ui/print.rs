//! Textual reports for the `print` subcommand: top allocation sites per
//! cost member, merged or unmerged, plus the overall summary block.

use std::fmt;
use std::io::Write;

use anyhow::Result;

use crate::analyze::caller_callee::CallerCalleeResults;
use crate::analyze::function_name;
use crate::analyze::histogram::HistogramRow;
use crate::analyze::merged::merge_by_leaf_ip;
use crate::analyze::tree::TreeData;
use crate::core::indices::TraceIndex;
use crate::core::trace_data::{AllocationData, InstructionPointer, TraceData};
use crate::ui::CostMember;

/// Human readable byte count in decimal units, matching the rest of the
/// report output. Plain byte values stay unscaled.
pub struct FormatBytes(pub i64);

impl fmt::Display for FormatBytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let negative = self.0 < 0;
        let mut value = self.0.unsigned_abs() as f64;
        if negative {
            write!(f, "-")?;
        }
        if value < 1000.0 {
            return write!(f, "{}B", self.0.unsigned_abs());
        }
        let units = ["B", "KB", "MB", "GB", "TB"];
        let mut unit = 0;
        while unit < units.len() - 1 && value > 1000.0 {
            value /= 1000.0;
            unit += 1;
        }
        write!(f, "{:.2}{}", value, units[unit])
    }
}

fn print_indent(out: &mut dyn Write, indent: usize) -> Result<()> {
    for _ in 0..indent {
        write!(out, "  ")?;
    }
    Ok(())
}

fn print_ip(
    data: &TraceData,
    ip: &InstructionPointer,
    out: &mut dyn Write,
    indent: usize,
) -> Result<()> {
    print_indent(out, indent)?;
    if ip.frame.function.is_valid() {
        write!(out, "{}", data.pretty_function(data.stringify(ip.frame.function)))?;
    } else {
        write!(out, "0x{:x}", ip.address)?;
    }
    writeln!(out)?;

    print_indent(out, indent + 1)?;
    if ip.frame.file.is_valid() {
        writeln!(out, "at {}:{}", data.stringify(ip.frame.file), ip.frame.line)?;
        print_indent(out, indent + 1)?;
    }
    if ip.module.is_valid() {
        writeln!(out, "in {}", data.stringify(ip.module))?;
    } else {
        writeln!(out, "in ??")?;
    }
    Ok(())
}

fn print_backtrace(
    data: &TraceData,
    trace_index: TraceIndex,
    out: &mut dyn Write,
    indent: usize,
    mut skip_first: bool,
) -> Result<()> {
    if !trace_index.is_valid() {
        writeln!(out, "  ??")?;
        return Ok(());
    }
    let mut node = data.find_trace(trace_index);
    while node.ip.is_valid() {
        let ip = data.find_ip(node.ip);
        if !skip_first {
            print_ip(data, &ip, out, indent)?;
        }
        skip_first = false;

        if data.is_stop_index(ip.frame.function) {
            break;
        }
        node = data.find_trace(node.parent);
    }
    Ok(())
}

const TOP_ALLOCATIONS: usize = 10;
const SUB_TRACES_TO_PRINT: usize = 5;

/// Print the top entries by `member`, one backtrace each, merged across
/// addresses with their heaviest sub-traces shown.
pub fn print_merged(
    data: &TraceData,
    member: CostMember,
    label: &dyn Fn(&AllocationData) -> String,
    sublabel: &dyn Fn(&AllocationData) -> String,
    out: &mut dyn Write,
) -> Result<()> {
    let mut merged = merge_by_leaf_ip(data, &data.allocations);
    merged.sort_by_key(|entry| std::cmp::Reverse(member.get(&entry.data)));
    for entry in merged.iter_mut().take(TOP_ALLOCATIONS) {
        if member.get(&entry.data) == 0 {
            break;
        }
        writeln!(out, "{}", label(&entry.data))?;
        print_ip(data, &data.find_ip(entry.ip), out, 0)?;

        entry
            .traces
            .sort_by_key(|allocation| std::cmp::Reverse(member.get(&allocation.data)));
        let mut handled = 0;
        for allocation in entry.traces.iter().take(SUB_TRACES_TO_PRINT) {
            writeln!(out, "{}", sublabel(&allocation.data))?;
            handled += member.get(&allocation.data);
            print_backtrace(data, allocation.trace_index, out, 2, true)?;
        }
        if entry.traces.len() > SUB_TRACES_TO_PRINT {
            let rest = member.get(&entry.data) - handled;
            write!(out, "  and ")?;
            if member.is_bytes() {
                write!(out, "{}", FormatBytes(rest))?;
            } else {
                write!(out, "{}", rest)?;
            }
            writeln!(
                out,
                " from {} other places",
                entry.traces.len() - SUB_TRACES_TO_PRINT
            )?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Print the top entries by `member` without merging backtraces.
pub fn print_unmerged(
    data: &TraceData,
    member: CostMember,
    label: &dyn Fn(&AllocationData) -> String,
    out: &mut dyn Write,
) -> Result<()> {
    let mut allocations = data.allocations.clone();
    allocations.sort_by_key(|allocation| std::cmp::Reverse(member.get(&allocation.data)));
    for allocation in allocations.iter().take(TOP_ALLOCATIONS) {
        if member.get(&allocation.data) == 0 {
            break;
        }
        writeln!(out, "{}", label(&allocation.data))?;
        print_backtrace(data, allocation.trace_index, out, 1, false)?;
        writeln!(out)?;
    }
    Ok(())
}

/// The closing summary, printed regardless of how many lines were dropped.
pub fn print_summary(data: &TraceData, out: &mut dyn Write) -> Result<()> {
    let total_time_s = 0.001 * data.total_time as f64;
    writeln!(out, "total runtime: {:.2}s.", total_time_s)?;
    writeln!(
        out,
        "bytes allocated in total (ignoring deallocations): {} ({}/s)",
        FormatBytes(data.total_cost.allocated),
        FormatBytes((data.total_cost.allocated as f64 / total_time_s) as i64)
    )?;
    writeln!(
        out,
        "calls to allocation functions: {} ({}/s)",
        data.total_cost.allocations,
        (data.total_cost.allocations as f64 / total_time_s) as i64
    )?;
    writeln!(
        out,
        "temporary memory allocations: {} ({}/s)",
        data.total_cost.temporary,
        (data.total_cost.temporary as f64 / total_time_s) as i64
    )?;
    writeln!(
        out,
        "peak heap memory consumption: {}",
        FormatBytes(data.total_cost.peak)
    )?;
    writeln!(
        out,
        "peak RSS (including heapscope overhead): {}",
        FormatBytes(data.peak_rss * data.system_info.page_size)
    )?;
    writeln!(
        out,
        "total memory leaked: {}",
        FormatBytes(data.total_cost.leaked)
    )?;
    Ok(())
}

/// Indented rendering of a merged tree (bottom-up or top-down), one row
/// per symbol with its cost counters.
pub fn write_tree(data: &TraceData, rows: &TreeData, out: &mut dyn Write) -> Result<()> {
    fn recurse(
        data: &TraceData,
        rows: &TreeData,
        depth: usize,
        out: &mut dyn Write,
    ) -> Result<()> {
        for row in rows {
            print_indent(out, depth)?;
            writeln!(
                out,
                "{} | allocations={} temporary={} leaked={} peak={}",
                function_name(data, &row.symbol),
                row.cost.allocations,
                row.cost.temporary,
                FormatBytes(row.cost.leaked),
                FormatBytes(row.cost.peak)
            )?;
            recurse(data, &row.children, depth + 1, out)?;
        }
        Ok(())
    }
    recurse(data, rows, 0, out)
}

/// Tab separated caller-callee rows, heaviest inclusive consumers first.
pub fn write_caller_callee(
    data: &TraceData,
    results: &CallerCalleeResults,
    out: &mut dyn Write,
) -> Result<()> {
    writeln!(
        out,
        "function\tmodule\tinclusive_allocations\tinclusive_leaked\tinclusive_peak\t\
         self_allocations\tself_leaked\tself_peak\tcallers\tcallees"
    )?;
    let mut entries: Vec<_> = results.entries.iter().collect();
    entries.sort_by_key(|(_, entry)| std::cmp::Reverse(entry.inclusive.peak));
    for (symbol, entry) in entries {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            function_name(data, symbol),
            data.stringify(symbol.module),
            entry.inclusive.allocations,
            entry.inclusive.leaked,
            entry.inclusive.peak,
            entry.self_cost.allocations,
            entry.self_cost.leaked,
            entry.self_cost.peak,
            entry.callers.len(),
            entry.callees.len()
        )?;
    }
    Ok(())
}

/// Tab separated histogram rows: bucket label, total, then the top symbols.
pub fn write_histogram(
    data: &TraceData,
    histogram: &[HistogramRow],
    out: &mut dyn Write,
) -> Result<()> {
    for row in histogram {
        write!(out, "{}\t{}", row.label, row.allocations)?;
        for column in &row.columns {
            write!(
                out,
                "\t{}={}",
                function_name(data, &column.symbol),
                column.allocations
            )?;
        }
        writeln!(out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::parse_str;

    fn fixture_input() -> String {
        "\
v 10200 3
s /bin/app
s main
s worker
s helper.c
i 100 1 2
i 200 1 3 4 2a
t 1 0
t 2 1
a 100 2
+ 0
+ 0
- 0
c a
R 3
I 1000 8000
"
        .to_string()
    }

    #[test]
    fn format_bytes_scales_decimally() {
        assert_eq!(FormatBytes(0).to_string(), "0B");
        assert_eq!(FormatBytes(999).to_string(), "999B");
        assert_eq!(FormatBytes(1024).to_string(), "1.02KB");
        assert_eq!(FormatBytes(1_500_000).to_string(), "1.50MB");
        assert_eq!(FormatBytes(2_000_000_000).to_string(), "2.00GB");
        assert_eq!(FormatBytes(-1024).to_string(), "-1.02KB");
    }

    #[test]
    fn merged_output_contains_backtrace() {
        let data = parse_str(&fixture_input());
        let mut out = Vec::new();
        print_merged(
            &data,
            CostMember::Allocations,
            &|cost| format!("{} calls from", cost.allocations),
            &|cost| format!("{} calls from:", cost.allocations),
            &mut out,
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("2 calls from\n"), "{}", text);
        assert!(text.contains("worker"), "{}", text);
        assert!(text.contains("at helper.c:42"), "{}", text);
        assert!(text.contains("in /bin/app"), "{}", text);
        // the backtrace below the merged entry skips the leaf and shows main
        assert!(text.contains("main"), "{}", text);
    }

    #[test]
    fn unmerged_output_sorts_by_member() {
        let data = parse_str(&fixture_input());
        let mut out = Vec::new();
        print_unmerged(
            &data,
            CostMember::Leaked,
            &|cost| format!("{} leaked over {} calls from", FormatBytes(cost.leaked), cost.allocations),
            &mut out,
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("256B leaked over 2 calls from"), "{}", text);
    }

    #[test]
    fn summary_reports_all_totals() {
        let data = parse_str(&fixture_input());
        let mut out = Vec::new();
        print_summary(&data, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("total runtime: 0.01s."), "{}", text);
        assert!(text.contains("bytes allocated in total (ignoring deallocations): 512B"), "{}", text);
        assert!(text.contains("calls to allocation functions: 2"), "{}", text);
        assert!(text.contains("temporary memory allocations: 1"), "{}", text);
        assert!(text.contains("peak heap memory consumption: 512B"), "{}", text);
        // 3 pages of 0x1000 bytes
        assert!(text.contains("peak RSS (including heapscope overhead): 12.29KB"), "{}", text);
        assert!(text.contains("total memory leaked: 256B"), "{}", text);
    }

    #[test]
    fn tree_rendering_indents_by_depth() {
        use crate::analyze::tree::{merge_allocations, to_top_down};

        let data = parse_str(&fixture_input());
        let (bottom_up, results) = merge_allocations(&data);
        let mut out = Vec::new();
        write_tree(&data, &bottom_up, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("worker | allocations=2"), "{}", text);
        assert!(text.contains("\n  main | "), "{}", text);

        let top_down = to_top_down(&bottom_up);
        let mut out = Vec::new();
        write_tree(&data, &top_down, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("main | "), "{}", text);
        assert!(text.contains("\n  worker | "), "{}", text);

        let caller_callee =
            crate::analyze::caller_callee::to_caller_callee(&bottom_up, &results, false);
        let mut out = Vec::new();
        write_caller_callee(&data, &caller_callee, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("function\tmodule\t"), "{}", text);
        assert!(text.contains("worker\t/bin/app\t2\t256\t512\t2\t256\t512\t1\t0"), "{}", text);
    }

    #[test]
    fn zero_cost_entries_are_not_printed() {
        let data = parse_str(&fixture_input());
        let mut out = Vec::new();
        print_unmerged(&data, CostMember::Temporary, &|_| "x".into(), &mut out).unwrap();
        // one temporary exists, so one entry prints; but a member without
        // any cost prints nothing
        let mut empty = Vec::new();
        print_unmerged(
            &parse_str("v 10200 3\n"),
            CostMember::Temporary,
            &|_| "x".into(),
            &mut empty,
        )
        .unwrap();
        assert!(!out.is_empty());
        assert!(empty.is_empty());
    }
}
