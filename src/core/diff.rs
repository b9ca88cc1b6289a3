//! Two-dataset differencing: subtract a base run from the current one so
//! that all views show only the net change. Traces are matched by their
//! canonical key, the equal-without-address IP chain from leaf to root,
//! with the base's strings remapped into this dataset's table.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::core::indices::{IpIndex, StringIndex, TraceIndex};
use crate::core::trace_data::{
    Allocation, AllocationData, InstructionPointer, TraceData, TraceNode,
};

struct DiffContext<'a> {
    base: &'a TraceData,
    /// base string index -> string index in this dataset, 0 preserved
    string_map: Vec<StringIndex>,
    /// this dataset's IPs, ordered without address for binary search
    sorted_ips: Vec<IpIndex>,
}

impl TraceData {
    /// Compute `self - base`.
    pub fn diff(&mut self, base: &TraceData) {
        self.total_cost -= base.total_cost;
        self.total_time -= base.total_time;
        self.peak_rss -= base.peak_rss;
        self.system_info.pages -= base.system_info.pages;
        self.system_info.page_size -= base.system_info.page_size;

        // sort the allocations' trace indices by canonical key, merging
        // allocations whose backtraces are equal without addresses
        let old_allocations = std::mem::take(&mut self.allocations);
        let mut kept: Vec<Allocation> = Vec::with_capacity(old_allocations.len());
        let mut trace_nodes: Vec<(TraceIndex, usize)> = Vec::with_capacity(old_allocations.len());
        for allocation in old_allocations {
            let this: &TraceData = self;
            let result = trace_nodes.binary_search_by(|&(probe, _)| {
                compare_trace_indices(this, probe, this, allocation.trace_index, None)
            });
            match result {
                Err(pos) => {
                    trace_nodes.insert(pos, (allocation.trace_index, kept.len()));
                    kept.push(allocation);
                }
                Ok(pos) => {
                    let (found, kept_pos) = trace_nodes[pos];
                    if found != allocation.trace_index {
                        kept[kept_pos].data += allocation.data;
                    } else {
                        kept.push(allocation);
                    }
                }
            }
        }
        self.allocations = kept;
        self.rebuild_allocation_index();
        let mut trace_nodes: Vec<TraceIndex> =
            trace_nodes.into_iter().map(|(index, _)| index).collect();

        // map the base's strings into our table, appending unseen ones
        let string_map = remap_strings(&mut self.strings, &base.strings);

        let mut sorted_ips: Vec<IpIndex> = (0..self.instruction_pointers.len())
            .map(IpIndex::from_offset)
            .collect();
        {
            let this: &TraceData = self;
            sorted_ips.sort_by(|&lhs, &rhs| {
                this.find_ip(lhs).compare_without_address(&this.find_ip(rhs))
            });
        }

        let mut context = DiffContext {
            base,
            string_map,
            sorted_ips,
        };

        // subtract every base allocation from the matching one over here,
        // copying trace chains that only exist in the base
        for base_allocation in &base.allocations {
            let trace = self.remap_trace(&mut context, &mut trace_nodes, base_allocation.trace_index);
            self.find_allocation(trace).data -= base_allocation.data;
        }

        // drop allocations without any difference. Merged backtraces with
        // differing tails can still sum to zero while their parts do not,
        // hence the check runs on the unmerged data.
        self.allocations
            .retain(|allocation| allocation.data != AllocationData::default());
        self.rebuild_allocation_index();
    }

    /// Map a base IP index into this dataset, copying the record with
    /// remapped strings when no equal-without-address IP exists yet.
    fn remap_ip_index(&mut self, context: &mut DiffContext, base_index: IpIndex) -> IpIndex {
        if !base_index.is_valid() {
            return base_index;
        }
        let base_ip = context.base.find_ip(base_index);
        let mapped_ip = remap_ip(&base_ip, &context.string_map);

        let this: &TraceData = self;
        let result = context.sorted_ips.binary_search_by(|&probe| {
            this.find_ip(probe).compare_without_address(&mapped_ip)
        });
        match result {
            Ok(pos) => context.sorted_ips[pos],
            Err(pos) => {
                self.instruction_pointers.push(mapped_ip);
                let index = IpIndex::from_offset(self.instruction_pointers.len() - 1);
                context.sorted_ips.insert(pos, index);
                index
            }
        }
    }

    /// Copy a base trace chain into this dataset, recursively.
    fn copy_trace(&mut self, context: &mut DiffContext, base_index: TraceIndex) -> TraceIndex {
        if !base_index.is_valid() {
            return base_index;
        }
        let base_trace = context.base.find_trace(base_index);
        let parent = self.copy_trace(context, base_trace.parent);
        let ip = self.remap_ip_index(context, base_trace.ip);
        self.traces.push(TraceNode { ip, parent });
        TraceIndex(self.traces.len() as u32)
    }

    /// Find the trace over here that is equivalent to the base's, or copy
    /// it over when there is none.
    fn remap_trace(
        &mut self,
        context: &mut DiffContext,
        trace_nodes: &mut Vec<TraceIndex>,
        base_index: TraceIndex,
    ) -> TraceIndex {
        if !base_index.is_valid() {
            return base_index;
        }

        let this: &TraceData = self;
        let result = trace_nodes.binary_search_by(|&probe| {
            compare_trace_indices(
                this,
                probe,
                context.base,
                base_index,
                Some(&context.string_map),
            )
        });
        match result {
            Ok(pos) => trace_nodes[pos],
            Err(pos) => {
                let index = self.copy_trace(context, base_index);
                trace_nodes.insert(pos, index);
                index
            }
        }
    }
}

/// Recursive ordering of two traces by their IP chains, ignoring addresses.
/// Parents weigh more than leaves so equal prefixes collapse early.
fn compare_trace_indices(
    lhs_data: &TraceData,
    lhs: TraceIndex,
    rhs_data: &TraceData,
    rhs: TraceIndex,
    string_map: Option<&[StringIndex]>,
) -> Ordering {
    match (lhs.is_valid(), rhs.is_valid()) {
        (false, false) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (true, true) => {}
    }
    if std::ptr::eq(lhs_data, rhs_data) && lhs == rhs {
        // fast path when both indices live in the same dataset
        return Ordering::Equal;
    }

    let lhs_trace = lhs_data.find_trace(lhs);
    let rhs_trace = rhs_data.find_trace(rhs);

    let parents = compare_trace_indices(
        lhs_data,
        lhs_trace.parent,
        rhs_data,
        rhs_trace.parent,
        string_map,
    );
    if parents != Ordering::Equal {
        return parents;
    }

    let lhs_ip = lhs_data.find_ip(lhs_trace.ip);
    let mut rhs_ip = rhs_data.find_ip(rhs_trace.ip);
    if let Some(map) = string_map {
        rhs_ip = remap_ip(&rhs_ip, map);
    }
    lhs_ip.compare_without_address(&rhs_ip)
}

fn remap_string(index: StringIndex, map: &[StringIndex]) -> StringIndex {
    match index.is_valid() {
        true => map[index.0 as usize],
        false => index,
    }
}

fn remap_ip(ip: &InstructionPointer, map: &[StringIndex]) -> InstructionPointer {
    let mut mapped = ip.clone();
    mapped.module = remap_string(ip.module, map);
    mapped.frame.function = remap_string(ip.frame.function, map);
    mapped.frame.file = remap_string(ip.frame.file, map);
    mapped
}

fn remap_strings(lhs: &mut Vec<String>, rhs: &[String]) -> Vec<StringIndex> {
    let mut remapping: HashMap<String, StringIndex> = HashMap::with_capacity(lhs.len());
    for (offset, string) in lhs.iter().enumerate() {
        remapping.insert(string.clone(), StringIndex::from_offset(offset));
    }

    let mut map = Vec::with_capacity(rhs.len() + 1);
    map.push(StringIndex(0));
    for string in rhs {
        match remapping.get(string) {
            Some(&index) => map.push(index),
            None => {
                lhs.push(string.clone());
                let index = StringIndex::from_offset(lhs.len() - 1);
                remapping.insert(string.clone(), index);
                map.push(index);
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::{new_format_header, parse_str};

    #[test]
    fn diff_against_self_is_empty() {
        let input = {
            let mut input = new_format_header();
            input.push_str("t 1 1\na 40 1\na 80 2\n+ 0\n+ 1\n- 0\nc a\nR 7\n");
            input
        };
        let mut data = parse_str(&input);
        let base = parse_str(&input);

        data.diff(&base);

        assert!(data.allocations.is_empty());
        assert_eq!(data.total_cost, AllocationData::default());
        assert_eq!(data.total_time, 0);
        assert_eq!(data.peak_rss, 0);
    }

    #[test]
    fn diff_keeps_net_changes_only() {
        let mut base_input = new_format_header();
        base_input.push_str("a 40 1\n+ 0\n");
        let base = parse_str(&base_input);

        // same site allocates twice, and a second site appears
        let mut input = new_format_header();
        input.push_str("t 1 1\na 40 1\na 100 2\n+ 0\n+ 0\n+ 1\n");
        let mut data = parse_str(&input);

        data.diff(&base);

        assert_eq!(data.total_cost.allocations, 2);
        assert_eq!(data.total_cost.leaked, 0x40 + 0x100);
        assert_eq!(data.allocations.len(), 2);
        let net: Vec<i64> = data
            .allocations
            .iter()
            .map(|allocation| allocation.data.leaked)
            .collect();
        assert!(net.contains(&0x40));
        assert!(net.contains(&0x100));
    }

    #[test]
    fn base_only_allocations_show_up_negative() {
        let mut base_input = new_format_header();
        base_input.push_str("a 40 1\n+ 0\n");
        let base = parse_str(&base_input);

        let data_input = new_format_header();
        let mut data = parse_str(&data_input);

        data.diff(&base);

        assert_eq!(data.allocations.len(), 1);
        assert_eq!(data.allocations[0].data.leaked, -0x40);
        assert_eq!(data.total_cost.allocations, -1);
    }

    #[test]
    fn string_remapping_appends_unseen_strings() {
        let mut lhs = vec!["a".to_string(), "b".to_string()];
        let rhs = vec!["b".to_string(), "c".to_string()];
        let map = remap_strings(&mut lhs, &rhs);
        assert_eq!(map, vec![StringIndex(0), StringIndex(2), StringIndex(3)]);
        assert_eq!(lhs, vec!["a", "b", "c"]);
    }
}
