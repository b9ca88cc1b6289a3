//! Allocation size histogram: fixed size-class buckets with the top
//! contributing symbols per bucket.

use crate::analyze::Symbol;
use crate::core::trace_data::TraceData;

/// Upper bucket bounds, inclusive; the last bucket is open-ended.
const BUCKETS: [(u64, &str); 9] = [
    (8, "0B to 8B"),
    (16, "9B to 16B"),
    (32, "17B to 32B"),
    (64, "33B to 64B"),
    (128, "65B to 128B"),
    (256, "129B to 256B"),
    (512, "257B to 512B"),
    (1024, "513B to 1KB"),
    (u64::MAX, "more than 1KB"),
];

#[derive(Clone, Copy, Debug)]
pub struct HistogramColumn {
    pub symbol: Symbol,
    pub allocations: i64,
}

#[derive(Clone, Debug)]
pub struct HistogramRow {
    pub size: u64,
    pub label: &'static str,
    /// total allocations in this bucket
    pub allocations: i64,
    /// top contributing symbols, largest first
    pub columns: Vec<HistogramColumn>,
}

/// Build the size histogram from the counted allocation infos.
/// `top_columns` bounds the per-bucket symbol columns.
pub fn build_size_histogram(data: &TraceData, top_columns: usize) -> Vec<HistogramRow> {
    let mut histogram = Vec::new();
    if data.allocation_infos.is_empty() {
        return histogram;
    }

    let mut counted: Vec<(u64, i64, Symbol)> = data
        .allocation_infos
        .iter()
        .zip(&data.allocation_info_counts)
        .map(|(info, &count)| {
            let ip = data.find_ip(data.find_trace(info.trace_index).ip);
            (info.size, count, Symbol::of(&ip))
        })
        .collect();
    counted.sort_unstable_by_key(|&(size, count, _)| (size, count));

    let mut bucket = 0;
    let mut row = HistogramRow {
        size: BUCKETS[bucket].0,
        label: BUCKETS[bucket].1,
        allocations: 0,
        columns: Vec::new(),
    };
    // merged per-symbol counts within the current bucket
    let mut column_data: Vec<(Symbol, i64)> = Vec::with_capacity(128);

    let mut flush = |row: &mut HistogramRow, column_data: &mut Vec<(Symbol, i64)>| {
        column_data.sort_unstable_by_key(|&(_, allocations)| std::cmp::Reverse(allocations));
        row.columns = column_data
            .iter()
            .take(top_columns)
            .map(|&(symbol, allocations)| HistogramColumn {
                symbol,
                allocations,
            })
            .collect();
        column_data.clear();
    };

    for (size, count, symbol) in counted {
        while size > row.size {
            flush(&mut row, &mut column_data);
            histogram.push(row);
            bucket += 1;
            row = HistogramRow {
                size: BUCKETS[bucket].0,
                label: BUCKETS[bucket].1,
                allocations: 0,
                columns: Vec::new(),
            };
        }
        row.allocations += count;
        match column_data.binary_search_by_key(&symbol, |&(symbol, _)| symbol) {
            Ok(pos) => column_data[pos].1 += count,
            Err(pos) => column_data.insert(pos, (symbol, count)),
        }
    }
    flush(&mut row, &mut column_data);
    histogram.push(row);
    histogram
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::{new_format_header, parse_str};

    #[test]
    fn buckets_split_on_their_bounds() {
        let mut input = new_format_header();
        // 8 bytes stays in the first bucket, 9 bytes moves to the second
        input.push_str("a 8 1\na 9 1\n+ 0\n+ 0\n+ 1\n");
        let data = parse_str(&input);
        let histogram = build_size_histogram(&data, 10);

        assert_eq!(histogram[0].size, 8);
        assert_eq!(histogram[0].allocations, 2);
        assert_eq!(histogram[1].size, 16);
        assert_eq!(histogram[1].allocations, 1);
    }

    #[test]
    fn top_bucket_is_open_ended() {
        let mut input = new_format_header();
        // 0x10000 bytes = 64KiB, way past the last bound
        input.push_str("a 10000 1\n+ 0\n");
        let data = parse_str(&input);
        let histogram = build_size_histogram(&data, 10);

        let last = histogram.last().unwrap();
        assert_eq!(last.size, u64::MAX);
        assert_eq!(last.label, "more than 1KB");
        assert_eq!(last.allocations, 1);
    }

    #[test]
    fn columns_rank_symbols_by_count() {
        // two functions allocating in the same bucket, one twice as often
        let input = "\
v 10200 3
s /bin/app
s rare
s frequent
i 100 1 2
i 200 1 3
t 1 0
t 2 0
a 12 1
a 18 2
+ 0
+ 1
+ 1
";
        let data = parse_str(input);
        let histogram = build_size_histogram(&data, 10);

        let row = &histogram[2];
        assert_eq!(row.size, 32);
        assert_eq!(row.allocations, 3);
        assert_eq!(row.columns.len(), 2);
        assert_eq!(data.stringify(row.columns[0].symbol.function), "frequent");
        assert_eq!(row.columns[0].allocations, 2);
        assert_eq!(row.columns[1].allocations, 1);
    }

    #[test]
    fn empty_data_yields_empty_histogram() {
        let data = parse_str(&new_format_header());
        assert!(build_size_histogram(&data, 10).is_empty());
    }

    #[test]
    fn column_count_is_bounded() {
        let mut input = new_format_header();
        input.push_str("a 4 1\n+ 0\n");
        let data = parse_str(&input);
        let histogram = build_size_histogram(&data, 0);
        assert!(histogram[0].columns.is_empty());
    }
}
