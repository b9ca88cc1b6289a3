//! Merging of allocations by their leaf instruction pointer, ignoring
//! addresses. This is the flat merge used by the report printers and the
//! massif writer; the full bottom-up tree lives in [`crate::analyze::tree`].

use crate::core::indices::IpIndex;
use crate::core::trace_data::{Allocation, AllocationData, TraceData};

#[derive(Clone, Debug, Default)]
pub struct MergedAllocation {
    pub ip: IpIndex,
    pub data: AllocationData,
    /// the individual backtraces merged into this entry
    pub traces: Vec<Allocation>,
}

/// Combine allocations whose traces end in the same function, i.e. whose
/// leaf IPs are equal without their address.
pub fn merge_by_leaf_ip(data: &TraceData, allocations: &[Allocation]) -> Vec<MergedAllocation> {
    let mut merged: Vec<MergedAllocation> = Vec::with_capacity(allocations.len());
    for allocation in allocations {
        if !allocation.trace_index.is_valid() {
            continue;
        }
        let trace = data.find_trace(allocation.trace_index);
        let trace_ip = data.find_ip(trace.ip);
        let result = merged.binary_search_by(|entry| {
            data.find_ip(entry.ip).compare_without_address(&trace_ip)
        });
        match result {
            Ok(pos) => merged[pos].traces.push(*allocation),
            Err(pos) => merged.insert(
                pos,
                MergedAllocation {
                    ip: trace.ip,
                    data: AllocationData::default(),
                    traces: vec![*allocation],
                },
            ),
        }
    }
    for entry in &mut merged {
        for allocation in &entry.traces {
            entry.data += allocation.data;
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::parse_str;

    #[test]
    fn equal_functions_merge_across_addresses() {
        // the same function allocating from two addresses, and another one
        let input = "\
v 10200 3
s /bin/app
s twice
s once
i 100 1 2
i 101 1 2
i 200 1 3
t 1 0
t 2 0
t 3 0
a 10 1
a 20 2
a 40 3
+ 0
+ 1
+ 2
";
        let data = parse_str(input);
        let merged = merge_by_leaf_ip(&data, &data.allocations);

        assert_eq!(merged.len(), 2);
        let twice = merged
            .iter()
            .find(|entry| {
                data.stringify(data.find_ip(entry.ip).frame.function) == "twice"
            })
            .unwrap();
        assert_eq!(twice.traces.len(), 2);
        assert_eq!(twice.data.allocations, 2);
        assert_eq!(twice.data.leaked, 0x30);
    }

    #[test]
    fn costs_accumulate_per_entry() {
        let input = "\
v 10200 3
s /bin/app
s f
i 100 1 2
t 1 0
a 8 1
+ 0
+ 0
- 0
";
        let data = parse_str(input);
        let merged = merge_by_leaf_ip(&data, &data.allocations);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].data.allocations, 2);
        assert_eq!(merged[0].data.leaked, 8);
        assert_eq!(merged[0].data.allocated, 16);
    }
}
