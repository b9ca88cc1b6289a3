//! Caller-callee aggregation: per symbol the inclusive and self costs, the
//! directly adjacent symbols with their edge costs, and a source map of
//! per-location costs.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::analyze::tree::TreeData;
use crate::analyze::{FileLine, Symbol};
use crate::core::trace_data::AllocationData;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LocationCost {
    pub inclusive: AllocationData,
    pub self_cost: AllocationData,
}

#[derive(Clone, Debug, Default)]
pub struct CallerCalleeEntry {
    pub inclusive: AllocationData,
    pub self_cost: AllocationData,
    /// symbols directly below this one, with the cost crossing that edge
    pub callers: HashMap<Symbol, AllocationData>,
    /// symbols directly above this one, with the cost crossing that edge
    pub callees: HashMap<Symbol, AllocationData>,
    /// per source location costs of this symbol
    pub source_map: BTreeMap<FileLine, LocationCost>,
}

#[derive(Clone, Debug, Default)]
pub struct CallerCalleeResults {
    pub entries: HashMap<Symbol, CallerCalleeEntry>,
    pub total_costs: AllocationData,
}

/// Walk the bottom-up tree and accumulate inclusive/self costs and edge
/// costs per symbol. `results` carries the source map filled while merging
/// the allocations; entry costs are added on top of it.
pub fn to_caller_callee(
    bottom_up: &TreeData,
    results: &CallerCalleeResults,
    diff_mode: bool,
) -> CallerCalleeResults {
    let mut results = results.clone();
    let mut chain = Vec::new();
    results.total_costs = build(bottom_up, &mut chain, &mut results);

    if diff_mode {
        // rows without any difference are just noise in a diff view
        results.entries.retain(|_, entry| {
            entry.inclusive != AllocationData::default()
                || entry.self_cost != AllocationData::default()
        });
    }

    results
}

fn build(
    rows: &TreeData,
    chain: &mut Vec<Symbol>,
    results: &mut CallerCalleeResults,
) -> AllocationData {
    let mut total = AllocationData::default();
    for row in rows {
        chain.push(row.symbol);
        let child_cost = build(&row.children, chain, results);
        if child_cost != row.cost {
            // a (partial) leaf: walk back towards the allocation point,
            // attributing the exclusive cost along the way. This runs
            // top-down so that no symbol is counted more than once per
            // backtrace.
            let cost = row.cost - child_cost;

            let mut recursion_guard: HashSet<Symbol> = HashSet::new();
            let mut edge_guard: HashSet<(Symbol, Symbol)> = HashSet::new();
            let mut last_symbol: Option<Symbol> = None;

            for (position, &symbol) in chain.iter().enumerate().rev() {
                let entry = results.entries.entry(symbol).or_default();
                if recursion_guard.insert(symbol) {
                    // only once per backtrace for recursive chains
                    entry.inclusive += cost;
                }
                if position == 0 {
                    // the innermost symbol carries the self cost
                    entry.self_cost += cost;
                }

                if let Some(last) = last_symbol {
                    if edge_guard.insert((symbol, last)) {
                        *results
                            .entries
                            .entry(last)
                            .or_default()
                            .callees
                            .entry(symbol)
                            .or_default() += cost;
                        *results
                            .entries
                            .entry(symbol)
                            .or_default()
                            .callers
                            .entry(last)
                            .or_default() += cost;
                    }
                }
                last_symbol = Some(symbol);
            }
        }
        chain.pop();
        total += row.cost;
    }
    total
}
