//! Chart time series: evenly spaced samples of the total consumption,
//! allocation count and temporary count, each with the contributions of the
//! top allocation sites. Built during a second forward pass over the data
//! file once the totals of the first pass are known.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use anyhow::Result;
use serde_derive::Serialize;

use crate::analyze::{function_name, Symbol};
use crate::core::indices::{AllocationInfoIndex, IpIndex};
use crate::core::trace_data::{ParseObserver, TraceData};

/// Default number of samples over the filtered time span.
pub const DEFAULT_DATAPOINTS: i64 = 500;

/// Default number of per-chart series, including the total column.
pub const DEFAULT_NUM_COST: usize = 20;

#[derive(Clone, Debug, Default, Serialize)]
pub struct ChartRows {
    pub timestamp: i64,
    /// `cost[0]` is the total, the rest are the labelled series.
    pub cost: Vec<i64>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ChartData {
    pub rows: Vec<ChartRows>,
    pub labels: BTreeMap<usize, String>,
}

#[derive(Serialize)]
struct ChartExport<'a> {
    consumed: &'a ChartData,
    allocations: &'a ChartData,
    temporary: &'a ChartData,
}

#[derive(Clone, Copy, Default)]
struct LabelIds {
    consumed: Option<usize>,
    allocations: Option<usize>,
    temporary: Option<usize>,
}

struct ChartMergeData {
    ip: IpIndex,
    consumed: i64,
    allocations: i64,
    temporary: i64,
}

pub struct ChartBuilder {
    pub consumed: ChartData,
    pub allocations: ChartData,
    pub temporary: ChartData,
    /// column slots of the hotspot IPs, one hash lookup per timestamp
    /// instead of three
    label_ids: HashMap<IpIndex, LabelIds>,
    num_cost: usize,
    min_time: i64,
    diff_between_timestamps: i64,
    max_consumed_since_last_timestamp: i64,
    last_timestamp: i64,
}

impl ChartBuilder {
    /// Prepare chart building from a completed first pass: pick the top
    /// hotspots by peak, allocation count and temporary count and label the
    /// series.
    pub fn new(data: &TraceData, datapoints: i64, num_cost: usize) -> ChartBuilder {
        let num_cost = num_cost.max(1);
        let mut builder = ChartBuilder {
            consumed: ChartData::default(),
            allocations: ChartData::default(),
            temporary: ChartData::default(),
            label_ids: HashMap::new(),
            num_cost,
            min_time: data.filter.min_time,
            diff_between_timestamps: 0,
            max_consumed_since_last_timestamp: 0,
            last_timestamp: data.filter.min_time,
        };

        let max_time = data.filter.max_time.min(data.total_time);
        let time_span = (max_time - data.filter.min_time).max(0);
        builder.diff_between_timestamps = time_span / datapoints.max(1);

        // start off with null data at the origin
        let origin = ChartRows {
            timestamp: data.filter.min_time,
            cost: vec![0; num_cost],
        };
        builder.consumed.rows.push(origin.clone());
        builder.allocations.rows.push(origin.clone());
        builder.temporary.rows.push(origin);
        builder.consumed.labels.insert(0, "total".to_string());
        builder.allocations.labels.insert(0, "total".to_string());
        builder.temporary.labels.insert(0, "total".to_string());

        // merge the allocation costs by leaf instruction pointer
        let mut merged: Vec<ChartMergeData> = Vec::with_capacity(data.allocations.len());
        for allocation in &data.allocations {
            let ip = data.find_trace(allocation.trace_index).ip;
            let pos = match merged.binary_search_by_key(&ip, |entry| entry.ip) {
                Ok(pos) => pos,
                Err(pos) => {
                    merged.insert(
                        pos,
                        ChartMergeData {
                            ip,
                            consumed: 0,
                            allocations: 0,
                            temporary: 0,
                        },
                    );
                    pos
                }
            };
            let entry = &mut merged[pos];
            // the chart tracks the top peaks, not the current leakage
            entry.consumed += allocation.data.peak;
            entry.allocations += allocation.data.allocations;
            entry.temporary += allocation.data.temporary;
        }

        builder.find_top_entries(data, &mut merged);
        builder
    }

    fn find_top_entries(&mut self, data: &TraceData, merged: &mut [ChartMergeData]) {
        let slots = self.num_cost - 1;
        let mut assign =
            |member: fn(&ChartMergeData) -> i64,
             label: fn(&mut LabelIds) -> &mut Option<usize>,
             chart: &mut ChartData,
             label_ids: &mut HashMap<IpIndex, LabelIds>| {
                merged.sort_by_key(|entry| std::cmp::Reverse(member(entry).abs()));
                for (rank, entry) in merged.iter().take(slots).enumerate() {
                    if member(entry) == 0 {
                        break;
                    }
                    *label(label_ids.entry(entry.ip).or_default()) = Some(rank + 1);
                    let symbol = Symbol::of(&data.find_ip(entry.ip));
                    chart
                        .labels
                        .insert(rank + 1, function_name(data, &symbol).into_owned());
                }
            };
        assign(
            |entry: &ChartMergeData| entry.consumed,
            |ids: &mut LabelIds| &mut ids.consumed,
            &mut self.consumed,
            &mut self.label_ids,
        );
        assign(
            |entry: &ChartMergeData| entry.allocations,
            |ids: &mut LabelIds| &mut ids.allocations,
            &mut self.allocations,
            &mut self.label_ids,
        );
        assign(
            |entry: &ChartMergeData| entry.temporary,
            |ids: &mut LabelIds| &mut ids.temporary,
            &mut self.temporary,
            &mut self.label_ids,
        );
    }
}

impl ParseObserver for ChartBuilder {
    fn on_allocation(&mut self, data: &TraceData, _info_index: AllocationInfoIndex) {
        // remember transient peaks between two sample points, so they
        // survive the downsampling
        self.max_consumed_since_last_timestamp = self
            .max_consumed_since_last_timestamp
            .max(data.total_cost.leaked);
    }

    fn on_timestamp(&mut self, data: &TraceData, _old_stamp: i64, new_stamp: i64, is_final: bool) {
        self.max_consumed_since_last_timestamp = self
            .max_consumed_since_last_timestamp
            .max(data.total_cost.leaked);
        if new_stamp < self.min_time {
            return;
        }
        if !is_final && (new_stamp - self.last_timestamp) < self.diff_between_timestamps {
            return;
        }
        let now_consumed = self.max_consumed_since_last_timestamp;
        self.max_consumed_since_last_timestamp = 0;
        self.last_timestamp = new_stamp;

        let mut consumed = ChartRows {
            timestamp: new_stamp,
            cost: vec![0; self.num_cost],
        };
        let mut allocations = consumed.clone();
        let mut temporary = consumed.clone();
        consumed.cost[0] = now_consumed;
        allocations.cost[0] = data.total_cost.allocations;
        temporary.cost[0] = data.total_cost.temporary;

        for allocation in &data.allocations {
            let ip = data.find_trace(allocation.trace_index).ip;
            let Some(ids) = self.label_ids.get(&ip) else {
                continue;
            };
            if let Some(id) = ids.consumed {
                consumed.cost[id] += allocation.data.leaked;
            }
            if let Some(id) = ids.allocations {
                allocations.cost[id] += allocation.data.allocations;
            }
            if let Some(id) = ids.temporary {
                temporary.cost[id] += allocation.data.temporary;
            }
        }

        self.consumed.rows.push(consumed);
        self.allocations.rows.push(allocations);
        self.temporary.rows.push(temporary);
    }
}

/// Serialize the three chart series as JSON.
pub fn write_chart_json(
    output: &mut dyn Write,
    consumed: &ChartData,
    allocations: &ChartData,
    temporary: &ChartData,
) -> Result<()> {
    serde_json::to_writer_pretty(
        &mut *output,
        &ChartExport {
            consumed,
            allocations,
            temporary,
        },
    )?;
    output.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::new_format_header;
    use crate::core::trace_data::{NoopObserver, ParsePass, TraceData};

    fn parse_two_pass(input: &str, datapoints: i64, num_cost: usize) -> ChartBuilder {
        let mut data = TraceData::new();
        data.read(
            &mut input.as_bytes(),
            ParsePass::CollectCosts,
            &mut NoopObserver,
        )
        .expect("first pass failed");
        let mut builder = ChartBuilder::new(&data, datapoints, num_cost);
        data.read(&mut input.as_bytes(), ParsePass::BuildCharts, &mut builder)
            .expect("chart pass failed");
        builder
    }

    #[test]
    fn total_series_tracks_consumption() {
        let mut input = new_format_header();
        input.push_str("a 40 1\n+ 0\nc 1\n+ 0\nc 2\n- 0\n- 0\nc 3\n");
        let builder = parse_two_pass(&input, 500, 4);

        let totals: Vec<i64> = builder.consumed.rows.iter().map(|row| row.cost[0]).collect();
        // origin, then one sample per timestamp, then the final one
        assert_eq!(totals[0], 0);
        assert!(totals.contains(&0x40));
        assert!(totals.contains(&0x80));
        assert_eq!(*totals.last().unwrap(), 0);
        assert_eq!(builder.consumed.labels[&0], "total");
    }

    #[test]
    fn transient_peaks_survive_downsampling() {
        // allocation spike between two timestamps is fully freed again
        let mut input = new_format_header();
        input.push_str("a 1000 1\nc 1\n+ 0\n- 0\nc 2\n");
        let builder = parse_two_pass(&input, 500, 4);

        let max_total = builder
            .consumed
            .rows
            .iter()
            .map(|row| row.cost[0])
            .max()
            .unwrap();
        assert_eq!(max_total, 0x1000);
    }

    #[test]
    fn hotspots_get_labelled_series() {
        let input = "\
v 10200 3
s /bin/app
s hot
i 100 1 2
t 1 0
a 40 1
+ 0
c 1
";
        let builder = parse_two_pass(input, 500, 4);
        assert_eq!(builder.consumed.labels[&1], "hot");
        let row = builder
            .consumed
            .rows
            .iter()
            .find(|row| row.cost[0] == 0x40)
            .expect("no sample at the allocation");
        assert_eq!(row.cost[1], 0x40);
    }

    #[test]
    fn allocation_counts_accumulate() {
        let mut input = new_format_header();
        input.push_str("a 8 1\n+ 0\nc 1\n+ 0\n+ 0\nc 2\n");
        let builder = parse_two_pass(&input, 500, 4);
        let last = builder.allocations.rows.last().unwrap();
        assert_eq!(last.cost[0], 3);
    }

    #[test]
    fn chart_json_is_valid() {
        let mut input = new_format_header();
        input.push_str("a 8 1\n+ 0\nc 1\n");
        let builder = parse_two_pass(&input, 500, 4);
        let mut buffer = Vec::new();
        write_chart_json(
            &mut buffer,
            &builder.consumed,
            &builder.allocations,
            &builder.temporary,
        )
        .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        assert!(parsed["consumed"]["rows"].is_array());
        assert_eq!(parsed["consumed"]["labels"]["0"], "total");
    }
}
