//! Bottom-up merging of allocation backtraces and the derived top-down
//! view. Both trees are plain immutable value types; rendering is left to
//! the consumers.

use std::collections::HashSet;

use crate::analyze::caller_callee::CallerCalleeResults;
use crate::analyze::{FileLine, Symbol};
use crate::core::trace_data::{AllocationData, TraceData};

/// One row of a merged tree. In the bottom-up tree the top level holds the
/// leaf symbols (the direct allocator callers) and children are callers; in
/// the top-down tree the levels are inverted.
#[derive(Clone, Debug, Default)]
pub struct RowData {
    pub cost: AllocationData,
    pub symbol: Symbol,
    pub children: Vec<RowData>,
}

pub type TreeData = Vec<RowData>;

/// Merge all allocations into the bottom-up tree. Along the way the
/// per-location source map of the caller-callee results is filled, which
/// needs the leaf-ward walk anyway.
pub fn merge_allocations(data: &TraceData) -> (TreeData, CallerCalleeResults) {
    let mut results = CallerCalleeResults::default();
    let mut top_rows = TreeData::new();
    // one guard per allocation walk: a symbol reoccurring through recursion
    // must not be counted twice for one backtrace
    let mut symbol_guard: HashSet<Symbol> = HashSet::new();

    for allocation in &data.allocations {
        let mut trace_index = allocation.trace_index;
        let mut trace_guard: HashSet<u32> = HashSet::new();
        trace_guard.insert(trace_index.0);
        symbol_guard.clear();

        let mut rows = &mut top_rows;
        while trace_index.is_valid() {
            let trace = data.find_trace(trace_index);
            let ip = data.find_ip(trace.ip);
            let symbol = Symbol::of(&ip);
            let location = FileLine {
                file: ip.frame.file,
                line: ip.frame.line,
            };
            rows = add_row(
                rows,
                symbol,
                location,
                allocation.data,
                &mut symbol_guard,
                &mut results,
            );
            for inlined in &ip.inlined {
                let symbol = Symbol {
                    function: inlined.function,
                    module: ip.module,
                };
                let location = FileLine {
                    file: inlined.file,
                    line: inlined.line,
                };
                rows = add_row(
                    rows,
                    symbol,
                    location,
                    allocation.data,
                    &mut symbol_guard,
                    &mut results,
                );
            }
            if data.is_stop_index(ip.frame.function) {
                break;
            }
            trace_index = trace.parent;
            if !trace_guard.insert(trace_index.0) {
                log::warn!("Trace recursion detected - corrupt data file?");
                break;
            }
        }
    }

    (top_rows, results)
}

fn add_row<'a>(
    rows: &'a mut TreeData,
    symbol: Symbol,
    location: FileLine,
    cost: AllocationData,
    symbol_guard: &mut HashSet<Symbol>,
    results: &mut CallerCalleeResults,
) -> &'a mut TreeData {
    let pos = match rows.binary_search_by_key(&symbol, |row| row.symbol) {
        Ok(pos) => {
            rows[pos].cost += cost;
            pos
        }
        Err(pos) => {
            rows.insert(
                pos,
                RowData {
                    cost,
                    symbol,
                    children: Vec::new(),
                },
            );
            pos
        }
    };

    if !symbol_guard.contains(&symbol) {
        let entry = results.entries.entry(symbol).or_default();
        let location_cost = entry.source_map.entry(location).or_default();
        location_cost.inclusive += cost;
        if symbol_guard.is_empty() {
            // the first frame of the walk is the allocation leaf
            location_cost.self_cost += cost;
        }
        symbol_guard.insert(symbol);
    }

    &mut rows[pos].children
}

/// Derive the top-down view: every (partial) leaf of the bottom-up tree
/// bubbles its exclusive cost up its caller chain, so the resulting roots
/// are the outermost frames.
pub fn to_top_down(bottom_up: &TreeData) -> TreeData {
    let mut top_rows = TreeData::new();
    let mut chain = Vec::new();
    build_top_down(bottom_up, &mut top_rows, &mut chain);
    top_rows
}

fn build_top_down(
    rows: &TreeData,
    top_down: &mut TreeData,
    chain: &mut Vec<Symbol>,
) -> AllocationData {
    let mut total = AllocationData::default();
    for row in rows {
        chain.push(row.symbol);
        let child_cost = build_top_down(&row.children, top_down, chain);
        if child_cost != row.cost {
            // this row is (partially) a leaf: only the exclusive part is
            // propagated, otherwise shared prefixes would count twice
            let cost = row.cost - child_cost;
            bubble_up(top_down, chain, cost);
        }
        chain.pop();
        total += row.cost;
    }
    total
}

fn bubble_up(top_down: &mut TreeData, chain: &[Symbol], cost: AllocationData) {
    let mut rows = top_down;
    // the chain runs leaf-to-outermost; the top-down tree roots at the
    // outermost frame
    for &symbol in chain.iter().rev() {
        let pos = match rows.binary_search_by_key(&symbol, |row| row.symbol) {
            Ok(pos) => pos,
            Err(pos) => {
                rows.insert(
                    pos,
                    RowData {
                        cost: AllocationData::default(),
                        symbol,
                        children: Vec::new(),
                    },
                );
                pos
            }
        };
        rows[pos].cost += cost;
        rows = &mut rows[pos].children;
    }
}

/// Total cost held by a merged tree, i.e. the sum over its top level.
pub fn total_cost(rows: &TreeData) -> AllocationData {
    let mut total = AllocationData::default();
    for row in rows {
        total += row.cost;
    }
    total
}
