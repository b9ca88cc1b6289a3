//! Accumulated trace data: the intern tables, the active-pointer tracking
//! and the per-site cost accounting filled by a forward pass over a trace
//! stream.

use std::borrow::Cow;
use std::io::BufRead;
use std::ops::{AddAssign, SubAssign};
use std::path::Path;

use anyhow::Result;
use thiserror::Error;

use crate::core::indices::{
    AllocationIndex, AllocationInfoIndex, FileIndex, FunctionIndex, IpIndex, ModuleIndex,
    StringIndex, TraceIndex,
};
use crate::core::peak::{PeakTracker, SnapshotState};
use crate::core::pointer_map::{AllocationInfoSet, PointerMap};
use crate::core::reader::{open_trace_file, LineReader};

/// Version of the analyzer; data files written by a newer tracer are
/// rejected.
pub const VERSION: u32 = 0x010200;

/// File versions from here on reference interned allocation infos in their
/// `+`/`-` events; older files carry `(size, trace, ptr)` and `(ptr)`.
pub const NEW_FORMAT_VERSION: u32 = 0x010000;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(
        "The data file was written by a newer heapscope of version {file_version:x} \
         and is thus not compatible with this build of heapscope version {supported:x}."
    )]
    UnsupportedFileVersion { file_version: u32, supported: u32 },
}

/// A source location of one stack frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame {
    pub function: FunctionIndex,
    pub file: FileIndex,
    pub line: i32,
}

/// An interned instruction pointer with its resolved frame data.
#[derive(Clone, Debug, Default)]
pub struct InstructionPointer {
    pub address: u64,
    pub module: ModuleIndex,
    pub frame: Frame,
    pub inlined: Vec<Frame>,
}

impl InstructionPointer {
    /// Ordering on `(module, function, file, line)`. Useful because the same
    /// function regularly allocates from several addresses, which is noise
    /// for most views.
    pub fn compare_without_address(&self, other: &InstructionPointer) -> std::cmp::Ordering {
        (self.module, self.frame).cmp(&(other.module, other.frame))
    }

    pub fn equal_without_address(&self, other: &InstructionPointer) -> bool {
        self.compare_without_address(other) == std::cmp::Ordering::Equal
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TraceNode {
    pub ip: IpIndex,
    pub parent: TraceIndex,
}

/// Cost counters of one allocation site (or of the whole run).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocationData {
    /// number of calls to allocation functions
    pub allocations: i64,
    /// number of temporary allocations, i.e. freed before any other
    /// allocation happened
    pub temporary: i64,
    /// bytes not freed yet
    pub leaked: i64,
    /// contribution to the heap size at the global peak; only meaningful
    /// after peak reconstruction
    pub peak: i64,
    /// bytes requested over the whole run, ignoring frees
    pub allocated: i64,
}

impl AddAssign for AllocationData {
    fn add_assign(&mut self, rhs: AllocationData) {
        self.allocations += rhs.allocations;
        self.temporary += rhs.temporary;
        self.leaked += rhs.leaked;
        self.peak += rhs.peak;
        self.allocated += rhs.allocated;
    }
}

impl std::ops::Sub for AllocationData {
    type Output = AllocationData;

    fn sub(mut self, rhs: AllocationData) -> AllocationData {
        self -= rhs;
        self
    }
}

impl SubAssign for AllocationData {
    fn sub_assign(&mut self, rhs: AllocationData) {
        self.allocations -= rhs.allocations;
        self.temporary -= rhs.temporary;
        self.leaked -= rhs.leaked;
        self.peak -= rhs.peak;
        self.allocated -= rhs.allocated;
    }
}

/// Costs of the backtrace entry point at `trace_index`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Allocation {
    pub trace_index: TraceIndex,
    pub data: AllocationData,
}

/// Information for a single call to an allocation function. `(size,
/// trace_index)` is the interning key; the allocation position is resolved
/// once so that event replay does not need the trace lookup.
#[derive(Clone, Copy, Debug)]
pub struct AllocationInfo {
    pub size: u64,
    pub trace_index: TraceIndex,
    pub allocation_index: AllocationIndex,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SystemInfo {
    pub pages: i64,
    pub page_size: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParsePass {
    /// Totals, per-site costs, peak tracking.
    CollectCosts,
    /// Second forward pass building the chart time series.
    BuildCharts,
}

/// Time window restricting the chart samples.
#[derive(Clone, Copy, Debug)]
pub struct FilterParameters {
    pub min_time: i64,
    pub max_time: i64,
}

impl Default for FilterParameters {
    fn default() -> FilterParameters {
        FilterParameters {
            min_time: 0,
            max_time: i64::MAX,
        }
    }
}

impl FilterParameters {
    pub fn is_filtered(&self, total_time: i64) -> bool {
        self.min_time != 0 || self.max_time < total_time
    }
}

/// Callbacks invoked during the parse, e.g. by the massif writer and the
/// chart builder. The data reference reflects the state at that point of
/// the stream.
pub trait ParseObserver {
    fn on_timestamp(&mut self, data: &TraceData, old_stamp: i64, new_stamp: i64, is_final: bool) {
        let _ = (data, old_stamp, new_stamp, is_final);
    }

    fn on_allocation(&mut self, data: &TraceData, info_index: AllocationInfoIndex) {
        let _ = (data, info_index);
    }

    fn on_debuggee(&mut self, command: &str) {
        let _ = command;
    }
}

pub struct NoopObserver;

impl ParseObserver for NoopObserver {}

const STOP_STRINGS: [&str; 3] = [
    "main",
    "__libc_start_main",
    "__static_initialization_and_destruction_0",
];

const OP_NEW_STRINGS: [&str; 4] = [
    // 64 bit
    "operator new(unsigned long)",
    "operator new[](unsigned long)",
    // 32 bit
    "operator new(unsigned int)",
    "operator new[](unsigned int)",
];

pub struct TraceData {
    pub shorten_templates: bool,
    pub from_attached: bool,

    pub strings: Vec<String>,
    /// functions that end a backtrace, e.g. main or static initialization
    pub stop_indices: Vec<StringIndex>,
    /// operator new variants, elided from trace tails
    pub op_new_ip_indices: Vec<IpIndex>,
    pub instruction_pointers: Vec<InstructionPointer>,
    pub traces: Vec<TraceNode>,
    pub allocations: Vec<Allocation>,
    pub allocation_infos: Vec<AllocationInfo>,
    /// how often each allocation info occurred, feeds the size histogram
    pub allocation_info_counts: Vec<i64>,

    pub total_cost: AllocationData,
    pub total_time: i64,
    pub peak_time: i64,
    pub peak_rss: i64,
    pub system_info: SystemInfo,
    pub debuggee: String,
    pub filter: FilterParameters,
    pub file_version: u32,
    /// memory budget for peak reconstruction, in bytes
    pub peak_budget: usize,

    // indices are mostly seen in increasing order, so the common case of
    // mapping a trace index to its allocation is an append at the tail
    max_allocation_trace_index: TraceIndex,
    last_allocation_index: AllocationIndex,
    // allocations stay append-only so that positions remain stable; this
    // secondary vector, sorted by trace index, serves the lookups
    trace_index_to_allocation_index: Vec<(TraceIndex, AllocationIndex)>,
}

impl Default for TraceData {
    fn default() -> TraceData {
        TraceData::new()
    }
}

impl TraceData {
    pub fn new() -> TraceData {
        TraceData {
            shorten_templates: false,
            from_attached: false,
            strings: Vec::with_capacity(4096),
            stop_indices: Vec::with_capacity(4),
            op_new_ip_indices: Vec::with_capacity(16),
            instruction_pointers: Vec::with_capacity(16384),
            traces: Vec::with_capacity(65536),
            allocations: Vec::with_capacity(16384),
            allocation_infos: Vec::new(),
            allocation_info_counts: Vec::new(),
            total_cost: AllocationData::default(),
            total_time: 0,
            peak_time: 0,
            peak_rss: 0,
            system_info: SystemInfo::default(),
            debuggee: String::new(),
            filter: FilterParameters::default(),
            file_version: 0,
            peak_budget: crate::core::peak::DEFAULT_BUDGET,
            max_allocation_trace_index: TraceIndex(0),
            last_allocation_index: 0,
            trace_index_to_allocation_index: Vec::new(),
        }
    }

    pub fn stringify(&self, index: StringIndex) -> &str {
        match index.to_offset() {
            Some(offset) if offset < self.strings.len() => &self.strings[offset],
            _ => "",
        }
    }

    pub fn find_ip(&self, index: IpIndex) -> InstructionPointer {
        match index.to_offset() {
            Some(offset) if offset < self.instruction_pointers.len() => {
                self.instruction_pointers[offset].clone()
            }
            _ => InstructionPointer::default(),
        }
    }

    pub fn find_trace(&self, index: TraceIndex) -> TraceNode {
        match index.to_offset() {
            Some(offset) if offset < self.traces.len() => self.traces[offset],
            _ => TraceNode::default(),
        }
    }

    pub fn is_stop_index(&self, index: StringIndex) -> bool {
        self.stop_indices.contains(&index)
    }

    /// Elide template arguments when requested, for denser report output.
    pub fn pretty_function<'a>(&self, function: &'a str) -> Cow<'a, str> {
        if !self.shorten_templates {
            Cow::Borrowed(function)
        } else {
            Cow::Owned(elide_template_arguments(function))
        }
    }

    /// Find the allocation record for `trace_index`, creating an empty one
    /// on first sight, and return its stable position.
    pub fn map_to_allocation_index(&mut self, trace_index: TraceIndex) -> AllocationIndex {
        if trace_index < self.max_allocation_trace_index {
            // only earlier indices reoccurring require the search
            match self
                .trace_index_to_allocation_index
                .binary_search_by_key(&trace_index, |entry| entry.0)
            {
                Ok(pos) => self.trace_index_to_allocation_index[pos].1,
                Err(pos) => {
                    let index = self.allocations.len() as AllocationIndex;
                    self.allocations.push(Allocation {
                        trace_index,
                        data: AllocationData::default(),
                    });
                    self.trace_index_to_allocation_index
                        .insert(pos, (trace_index, index));
                    index
                }
            }
        } else if trace_index == self.max_allocation_trace_index && !self.allocations.is_empty() {
            self.last_allocation_index
        } else {
            let index = self.allocations.len() as AllocationIndex;
            self.allocations.push(Allocation {
                trace_index,
                data: AllocationData::default(),
            });
            // larger than everything seen, appending keeps the vector sorted
            self.trace_index_to_allocation_index
                .push((trace_index, index));
            self.max_allocation_trace_index = trace_index;
            self.last_allocation_index = index;
            index
        }
    }

    pub fn find_allocation(&mut self, trace_index: TraceIndex) -> &mut Allocation {
        let index = self.map_to_allocation_index(trace_index);
        &mut self.allocations[index as usize]
    }

    /// Rebuild the lookup acceleration after the allocations vector has been
    /// reshuffled, e.g. by diffing.
    pub(crate) fn rebuild_allocation_index(&mut self) {
        self.trace_index_to_allocation_index = self
            .allocations
            .iter()
            .enumerate()
            .map(|(position, allocation)| (allocation.trace_index, position as AllocationIndex))
            .collect();
        self.trace_index_to_allocation_index
            .sort_unstable_by_key(|entry| entry.0);
        match self.trace_index_to_allocation_index.last() {
            Some(&(trace_index, position)) => {
                self.max_allocation_trace_index = trace_index;
                self.last_allocation_index = position;
            }
            None => {
                self.max_allocation_trace_index = TraceIndex(0);
                self.last_allocation_index = 0;
            }
        }
    }

    pub fn read_file(
        &mut self,
        path: &Path,
        pass: ParsePass,
        observer: &mut dyn ParseObserver,
    ) -> Result<()> {
        let mut input = open_trace_file(path)?;
        self.read(&mut *input, pass, observer)
    }

    pub fn read(
        &mut self,
        input: &mut dyn BufRead,
        pass: ParsePass,
        observer: &mut dyn ParseObserver,
    ) -> Result<()> {
        let mut reader = LineReader::new();
        let mut timestamp = 0i64;

        // distinguished strings are matched only until each one was seen
        let mut op_new_strings: Vec<&str> = OP_NEW_STRINGS.to_vec();
        let mut op_new_str_indices: Vec<StringIndex> = Vec::with_capacity(OP_NEW_STRINGS.len());
        let mut stop_strings: Vec<&str> = STOP_STRINGS.to_vec();

        let reparsing = self.total_time != 0;
        self.total_cost = AllocationData::default();
        self.peak_time = 0;
        self.peak_rss = 0;
        self.system_info = SystemInfo::default();
        if reparsing {
            // info and trace tables stay valid, only the cost data resets
            for allocation in &mut self.allocations {
                allocation.data = AllocationData::default();
            }
            for count in &mut self.allocation_info_counts {
                *count = 0;
            }
        } else {
            self.allocations.clear();
            self.trace_index_to_allocation_index.clear();
            self.max_allocation_trace_index = TraceIndex(0);
            self.last_allocation_index = 0;
        }

        // legacy files intern allocation infos on the analyzer side and
        // track live pointers to find the matching info on deallocation
        let mut allocation_info_set = AllocationInfoSet::new();
        let mut pointers = PointerMap::new();
        // for temporary-allocation detection: the info index of the last
        // allocation in the new format, the pointer in the legacy format
        let mut last_allocation: Option<u64> = None;

        let mut peak_tracker = if pass == ParsePass::CollectCosts {
            Some(PeakTracker::with_budget(self.peak_budget))
        } else {
            None
        };

        while reader.next_line(input)? {
            match reader.mode() {
                b's' => {
                    if reparsing {
                        continue;
                    }
                    let string = String::from_utf8_lossy(reader.remainder()).into_owned();
                    self.strings.push(string);
                    let index = StringIndex::from_offset(self.strings.len() - 1);
                    let string = self.strings.last().unwrap().as_str();

                    if let Some(pos) = op_new_strings.iter().position(|&s| s == string) {
                        op_new_str_indices.push(index);
                        op_new_strings.remove(pos);
                    } else if let Some(pos) = stop_strings.iter().position(|&s| s == string) {
                        self.stop_indices.push(index);
                        stop_strings.remove(pos);
                    }
                }
                b't' => {
                    if reparsing {
                        continue;
                    }
                    let (Some(ip), Some(parent)) = (reader.read_hex_u32(), reader.read_hex_u32())
                    else {
                        log::warn!("failed to parse line: {}", reader.line());
                        continue;
                    };
                    let mut node = TraceNode {
                        ip: IpIndex(ip),
                        parent: TraceIndex(parent),
                    };
                    // skip operator new and operator new[] at the beginning
                    // of traces
                    while self.op_new_ip_indices.contains(&node.ip) {
                        node = self.find_trace(node.parent);
                    }
                    self.traces.push(node);
                }
                b'i' => {
                    if reparsing {
                        continue;
                    }
                    let (Some(address), Some(module)) = (reader.read_hex(), reader.read_hex_u32())
                    else {
                        log::warn!("failed to parse line: {}", reader.line());
                        continue;
                    };
                    let mut ip = InstructionPointer {
                        address,
                        module: StringIndex(module),
                        frame: Frame::default(),
                        inlined: Vec::new(),
                    };
                    if let Some(function) = reader.read_hex_u32() {
                        ip.frame.function = StringIndex(function);
                        if let Some(file) = reader.read_hex_u32() {
                            ip.frame.file = StringIndex(file);
                            ip.frame.line = reader.read_hex().unwrap_or(0) as i32;
                            while let Some(function) = reader.read_hex_u32() {
                                let file = reader.read_hex_u32().unwrap_or(0);
                                let line = reader.read_hex().unwrap_or(0) as i32;
                                ip.inlined.push(Frame {
                                    function: StringIndex(function),
                                    file: StringIndex(file),
                                    line,
                                });
                            }
                        }
                    }
                    let function = ip.frame.function;
                    self.instruction_pointers.push(ip);
                    if op_new_str_indices.contains(&function) {
                        self.op_new_ip_indices
                            .push(IpIndex::from_offset(self.instruction_pointers.len() - 1));
                    }
                }
                b'a' => {
                    if reparsing {
                        continue;
                    }
                    let (Some(size), Some(trace)) = (reader.read_hex(), reader.read_hex_u32())
                    else {
                        log::warn!("failed to parse line: {}", reader.line());
                        continue;
                    };
                    let trace_index = TraceIndex(trace);
                    let allocation_index = self.map_to_allocation_index(trace_index);
                    self.allocation_infos.push(AllocationInfo {
                        size,
                        trace_index,
                        allocation_index,
                    });
                    self.allocation_info_counts.push(0);
                }
                b'+' => {
                    let info_index;
                    let info;
                    if self.file_version >= NEW_FORMAT_VERSION {
                        let Some(index) = reader.read_hex_u32() else {
                            log::warn!("failed to parse line: {}", reader.line());
                            continue;
                        };
                        if index as usize >= self.allocation_infos.len() {
                            log::warn!(
                                "allocation index out of bounds: {}, maximum is: {}",
                                index,
                                self.allocation_infos.len()
                            );
                            continue;
                        }
                        info_index = index;
                        info = self.allocation_infos[index as usize];
                        last_allocation = Some(index as u64);
                    } else {
                        // backwards compatibility
                        let (Some(size), Some(trace), Some(ptr)) =
                            (reader.read_hex(), reader.read_hex_u32(), reader.read_hex())
                        else {
                            log::warn!("failed to parse line: {}", reader.line());
                            continue;
                        };
                        let trace_index = TraceIndex(trace);
                        let (index, is_new) = allocation_info_set.add(size, trace_index);
                        if is_new && !reparsing {
                            let allocation_index = self.map_to_allocation_index(trace_index);
                            self.allocation_infos.push(AllocationInfo {
                                size,
                                trace_index,
                                allocation_index,
                            });
                            self.allocation_info_counts.push(0);
                        }
                        pointers.add_pointer(ptr, index);
                        last_allocation = Some(ptr);
                        info_index = index;
                        info = self.allocation_infos[index as usize];
                    }

                    let size = info.size as i64;
                    let allocation = &mut self.allocations[info.allocation_index as usize];
                    allocation.data.allocations += 1;
                    allocation.data.allocated += size;
                    allocation.data.leaked += size;

                    self.total_cost.allocations += 1;
                    self.total_cost.allocated += size;
                    self.total_cost.leaked += size;
                    if self.total_cost.leaked > self.total_cost.peak {
                        self.total_cost.peak = self.total_cost.leaked;
                        self.peak_time = timestamp;
                    }

                    self.allocation_info_counts[info_index as usize] += 1;
                    if let Some(tracker) = &mut peak_tracker {
                        tracker.record_event(
                            info_index,
                            true,
                            &SnapshotState {
                                timestamp,
                                total_leaked: self.total_cost.leaked,
                                allocations: &self.allocations,
                            },
                        );
                    }
                    observer.on_allocation(self, info_index);
                }
                b'-' => {
                    let info_index;
                    let temporary;
                    if self.file_version >= NEW_FORMAT_VERSION {
                        let Some(index) = reader.read_hex_u32() else {
                            log::warn!("failed to parse line: {}", reader.line());
                            continue;
                        };
                        if index as usize >= self.allocation_infos.len() {
                            log::warn!(
                                "allocation index out of bounds: {}, maximum is: {}",
                                index,
                                self.allocation_infos.len()
                            );
                            continue;
                        }
                        info_index = index;
                        temporary = last_allocation == Some(index as u64);
                    } else {
                        let Some(ptr) = reader.read_hex() else {
                            log::warn!("failed to parse line: {}", reader.line());
                            continue;
                        };
                        let Some(index) = pointers.take_pointer(ptr) else {
                            // happens when the tracer attached to a running
                            // process whose allocations predate the trace
                            if !self.from_attached {
                                log::warn!("unknown pointer in line: {}", reader.line());
                            }
                            continue;
                        };
                        info_index = index;
                        temporary = last_allocation == Some(ptr);
                    }
                    last_allocation = None;

                    let info = self.allocation_infos[info_index as usize];
                    let size = info.size as i64;
                    let allocation = &mut self.allocations[info.allocation_index as usize];
                    if allocation.data.allocations == 0 || allocation.data.leaked < size {
                        if !self.from_attached {
                            log::warn!(
                                "inconsistent allocation info, underflowed allocations of {}",
                                info.trace_index
                            );
                        }
                        allocation.data.leaked = 0;
                        allocation.data.allocations = 0;
                    } else {
                        allocation.data.leaked -= size;
                    }
                    self.total_cost.leaked -= size;
                    if temporary {
                        let allocation = &mut self.allocations[info.allocation_index as usize];
                        allocation.data.temporary += 1;
                        self.total_cost.temporary += 1;
                    }

                    if let Some(tracker) = &mut peak_tracker {
                        tracker.record_event(
                            info_index,
                            false,
                            &SnapshotState {
                                timestamp,
                                total_leaked: self.total_cost.leaked,
                                allocations: &self.allocations,
                            },
                        );
                    }
                }
                b'~' => {
                    // a realloc transfer: the old info is freed and the new
                    // one allocated in a single event. Neither side takes
                    // part in temporary detection, handing a buffer over is
                    // not a short-lived allocation.
                    let (Some(old_index), Some(new_index)) =
                        (reader.read_hex_u32(), reader.read_hex_u32())
                    else {
                        log::warn!("failed to parse line: {}", reader.line());
                        continue;
                    };
                    if old_index as usize >= self.allocation_infos.len()
                        || new_index as usize >= self.allocation_infos.len()
                    {
                        log::warn!(
                            "allocation index out of bounds: {} {}, maximum is: {}",
                            old_index,
                            new_index,
                            self.allocation_infos.len()
                        );
                        continue;
                    }
                    last_allocation = None;

                    let old_info = self.allocation_infos[old_index as usize];
                    let old_size = old_info.size as i64;
                    let allocation = &mut self.allocations[old_info.allocation_index as usize];
                    if allocation.data.allocations == 0 || allocation.data.leaked < old_size {
                        if !self.from_attached {
                            log::warn!(
                                "inconsistent allocation info, underflowed allocations of {}",
                                old_info.trace_index
                            );
                        }
                        allocation.data.leaked = 0;
                        allocation.data.allocations = 0;
                    } else {
                        allocation.data.leaked -= old_size;
                    }
                    self.total_cost.leaked -= old_size;
                    if let Some(tracker) = &mut peak_tracker {
                        tracker.record_event(
                            old_index,
                            false,
                            &SnapshotState {
                                timestamp,
                                total_leaked: self.total_cost.leaked,
                                allocations: &self.allocations,
                            },
                        );
                    }

                    let new_info = self.allocation_infos[new_index as usize];
                    let new_size = new_info.size as i64;
                    let allocation = &mut self.allocations[new_info.allocation_index as usize];
                    allocation.data.allocations += 1;
                    allocation.data.allocated += new_size;
                    allocation.data.leaked += new_size;

                    self.total_cost.allocations += 1;
                    self.total_cost.allocated += new_size;
                    self.total_cost.leaked += new_size;
                    if self.total_cost.leaked > self.total_cost.peak {
                        self.total_cost.peak = self.total_cost.leaked;
                        self.peak_time = timestamp;
                    }

                    self.allocation_info_counts[new_index as usize] += 1;
                    if let Some(tracker) = &mut peak_tracker {
                        tracker.record_event(
                            new_index,
                            true,
                            &SnapshotState {
                                timestamp,
                                total_leaked: self.total_cost.leaked,
                                allocations: &self.allocations,
                            },
                        );
                    }
                    observer.on_allocation(self, new_index);
                }
                b'c' => {
                    let Some(new_stamp) = reader.read_hex() else {
                        log::warn!("Failed to read time stamp: {}", reader.line());
                        continue;
                    };
                    let new_stamp = new_stamp as i64;
                    observer.on_timestamp(self, timestamp, new_stamp, false);
                    timestamp = new_stamp;
                }
                b'R' => {
                    let rss = reader.read_hex().unwrap_or(0) as i64;
                    if rss > self.peak_rss {
                        self.peak_rss = rss;
                    }
                }
                b'X' => {
                    self.debuggee = String::from_utf8_lossy(reader.remainder()).into_owned();
                    observer.on_debuggee(&self.debuggee);
                }
                b'A' => {
                    // attached to a running process mid-way: whatever was
                    // allocated before is unknown territory
                    self.total_cost = AllocationData::default();
                    self.from_attached = true;
                }
                b'v' => {
                    let Some(file_version) = reader.read_hex_u32() else {
                        log::warn!("failed to parse line: {}", reader.line());
                        continue;
                    };
                    if file_version > VERSION {
                        return Err(ParseError::UnsupportedFileVersion {
                            file_version,
                            supported: VERSION,
                        }
                        .into());
                    }
                    self.file_version = file_version;
                }
                b'I' => {
                    self.system_info.page_size = reader.read_hex().unwrap_or(0) as i64;
                    self.system_info.pages = reader.read_hex().unwrap_or(0) as i64;
                }
                b'#' => {}
                _ => {
                    log::warn!("failed to parse line: {}", reader.line());
                }
            }
        }

        if !reparsing {
            self.total_time = timestamp + 1;
        }
        observer.on_timestamp(self, timestamp, self.total_time, true);

        if let Some(mut tracker) = peak_tracker {
            tracker.finalize(&SnapshotState {
                timestamp,
                total_leaked: self.total_cost.leaked,
                allocations: &self.allocations,
            });
            self.peak_time = tracker.peak_time();
            let peaks = tracker.peak_allocations(&self.allocation_infos);
            for (position, peak) in peaks.into_iter().enumerate() {
                if let Some(allocation) = self.allocations.get_mut(position) {
                    allocation.data.peak = peak;
                }
            }
        }

        Ok(())
    }
}

/// Elide the interior of balanced `<…>` pairs, keeping the outer markers:
/// `std::vector<std::pair<int, int>>` becomes `std::vector<>`. The angle
/// brackets of `operator<`, `operator<<`, `operator>` and `operator>>` are
/// not template markers.
pub fn elide_template_arguments(function: &str) -> String {
    let mut ret = String::with_capacity(function.len());
    let mut depth = 0i32;
    for c in function.chars() {
        if (c == '<' || c == '>') && ret.len() >= 8 {
            let cmp: &str = if ret.ends_with(c) {
                // second angle bracket of operator<< or operator>>
                if c == '<' {
                    "operator<"
                } else {
                    "operator>"
                }
            } else {
                "operator"
            };
            if ret.ends_with(cmp) {
                ret.push(c);
                continue;
            }
        }
        if c == '<' {
            depth += 1;
            if depth == 1 {
                ret.push(c);
            }
        } else if c == '>' {
            depth -= 1;
        }
        if depth != 0 {
            continue;
        }
        ret.push(c);
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::{legacy_header, new_format_header, parse_str};

    #[test]
    fn rejects_newer_file_versions() {
        let mut data = TraceData::new();
        let input = format!("v {:x} 3\n", VERSION + 1);
        let result = data.read(
            &mut input.as_bytes(),
            ParsePass::CollectCosts,
            &mut NoopObserver,
        );
        assert!(result.is_err());
        let message = format!("{}", result.unwrap_err());
        assert!(message.contains("newer heapscope"), "{}", message);
    }

    #[test]
    fn scenario_pure_allocation_then_free() {
        // p = malloc(100); free(p);
        let mut input = new_format_header();
        input.push_str("a 64 1\n+ 0\n- 0\nc 5\n");
        let data = parse_str(&input);

        assert_eq!(data.total_cost.allocations, 1);
        assert_eq!(data.total_cost.allocated, 100);
        assert_eq!(data.total_cost.leaked, 0);
        assert_eq!(data.total_cost.peak, 100);
        assert_eq!(data.total_cost.temporary, 1);
        assert_eq!(data.allocations.len(), 1);
        assert_eq!(data.allocations[0].data.peak, 100);
    }

    #[test]
    fn scenario_leak() {
        let mut input = new_format_header();
        input.push_str("a d 1\n+ 0\nc 5\n");
        let data = parse_str(&input);

        assert_eq!(data.total_cost.leaked, 13);
        assert_eq!(data.total_cost.peak, 13);
        assert_eq!(data.total_cost.temporary, 0);
        assert_eq!(data.total_time, 6);
    }

    #[test]
    fn scenario_realloc_chain() {
        // malloc(4); realloc -> 8; realloc -> 16; free
        let mut input = new_format_header();
        input.push_str(
            "a 4 1\n+ 0\n\
             a 8 1\n~ 0 1\n\
             a 10 1\n~ 1 2\n\
             - 2\n",
        );
        let data = parse_str(&input);

        assert_eq!(data.total_cost.allocations, 3);
        assert_eq!(data.total_cost.allocated, 28);
        assert_eq!(data.total_cost.leaked, 0);
        assert_eq!(data.total_cost.peak, 16);
        assert_eq!(data.total_cost.temporary, 0);
        assert_eq!(data.allocations.len(), 1);
    }

    #[test]
    fn realloc_of_null_counts_as_plain_allocation() {
        // realloc(NULL, n) has no old side and enters temporary detection
        let mut input = new_format_header();
        input.push_str("a 8 1\n+ 0\n- 0\n");
        let data = parse_str(&input);
        assert_eq!(data.total_cost.allocations, 1);
        assert_eq!(data.total_cost.temporary, 1);
    }

    #[test]
    fn scenario_interned_info_dedup() {
        // equal allocations all reference a single `a` line, however many
        let mut input = new_format_header();
        input.push_str("a 40 1\n");
        for _ in 0..1000 {
            input.push_str("+ 0\n- 0\n");
        }
        let data = parse_str(&input);

        assert_eq!(data.allocation_infos.len(), 1);
        assert_eq!(data.total_cost.allocations, 1000);
        assert_eq!(data.total_cost.peak, 64);
        assert_eq!(data.total_cost.leaked, 0);
        assert_eq!(data.total_cost.temporary, 1000);
        assert_eq!(data.allocation_info_counts[0], 1000);
    }

    #[test]
    fn scenario_attached_mode_ignores_unknown_pointers() {
        let mut input = legacy_header();
        input.push_str("A\n- deadbeef\nc 1\n");
        let data = parse_str(&input);

        assert!(data.from_attached);
        assert_eq!(data.total_cost, AllocationData::default());
    }

    #[test]
    fn legacy_format_tracks_pointers() {
        let mut input = legacy_header();
        // + <size> <trace> <ptr>, - <ptr>
        input.push_str("+ 64 1 1000\n+ 64 1 2000\n- 1000\n- 2000\n");
        let data = parse_str(&input);

        assert_eq!(data.total_cost.allocations, 2);
        assert_eq!(data.total_cost.leaked, 0);
        assert_eq!(data.total_cost.peak, 0xc8);
        // freeing 2000 right after 1000 was allocated in between: only the
        // second pair is temporary... the first free does not directly
        // follow its own allocation
        assert_eq!(data.total_cost.temporary, 0);
        assert_eq!(data.allocation_infos.len(), 1);
    }

    #[test]
    fn legacy_temporary_detection() {
        let mut input = legacy_header();
        input.push_str("+ 10 1 1000\n- 1000\n");
        let data = parse_str(&input);
        assert_eq!(data.total_cost.temporary, 1);
    }

    #[test]
    fn zero_size_allocations_are_counted() {
        let mut input = new_format_header();
        input.push_str("a 0 1\n+ 0\n- 0\n");
        let data = parse_str(&input);
        assert_eq!(data.total_cost.allocations, 1);
        assert_eq!(data.total_cost.allocated, 0);
        assert_eq!(data.total_cost.temporary, 1);
    }

    #[test]
    fn underflow_resets_the_leaf() {
        let mut input = new_format_header();
        input.push_str("a 40 1\n+ 0\n- 0\n- 0\n");
        let data = parse_str(&input);
        // the second free underflows and resets the leaf counters
        assert_eq!(data.allocations[0].data.leaked, 0);
        assert_eq!(data.allocations[0].data.allocations, 0);
    }

    #[test]
    fn op_new_frames_are_elided_from_traces() {
        let input = "\
v 10200 3
s operator new(unsigned long)
s my_module
s my_function
i 100 2 1
i 200 2 3
t 2 0
t 1 1
a 8 2
+ 0
";
        let data = parse_str(input);
        // trace 2 pointed at the operator-new ip (index 1) with parent 1;
        // the node collapses onto its parent
        assert_eq!(data.traces.len(), 2);
        assert_eq!(data.traces[1].ip, IpIndex(2));
        assert_eq!(data.traces[1].parent, TraceIndex(0));
    }

    #[test]
    fn stop_strings_are_detected() {
        let input = "\
v 10200 3
s main
s other
s __libc_start_main
";
        let data = parse_str(input);
        assert_eq!(data.stop_indices, vec![StringIndex(1), StringIndex(3)]);
        assert!(data.is_stop_index(StringIndex(1)));
        assert!(!data.is_stop_index(StringIndex(2)));
    }

    #[test]
    fn reparse_produces_identical_costs() {
        let mut input = new_format_header();
        input.push_str("a 40 1\n+ 0\n+ 0\n- 0\nc a\nR 5\n");

        let mut data = TraceData::new();
        data.read(
            &mut input.as_bytes(),
            ParsePass::CollectCosts,
            &mut NoopObserver,
        )
        .unwrap();
        let first_total = data.total_cost;
        let first_allocations: Vec<_> = data.allocations.clone();
        let strings = data.strings.len();

        data.read(
            &mut input.as_bytes(),
            ParsePass::CollectCosts,
            &mut NoopObserver,
        )
        .unwrap();
        assert_eq!(data.total_cost, first_total);
        assert_eq!(data.strings.len(), strings);
        assert_eq!(data.allocations.len(), first_allocations.len());
        for (before, after) in first_allocations.iter().zip(&data.allocations) {
            assert_eq!(before.trace_index, after.trace_index);
            assert_eq!(before.data, after.data);
        }
    }

    #[test]
    fn peak_reconstruction_sums_to_total_peak() {
        let mut input = new_format_header();
        // two sites, interleaved so the peak has both alive
        input.push_str("t 1 1\na 40 1\na 80 2\n+ 0\n+ 1\nc 2\n- 0\n- 1\n");
        let data = parse_str(&input);
        assert_eq!(data.total_cost.peak, 0xc0);
        let leaf_peak_sum: i64 = data.allocations.iter().map(|a| a.data.peak).sum();
        assert_eq!(leaf_peak_sum, data.total_cost.peak);
    }

    #[test]
    fn elides_template_arguments() {
        assert_eq!(
            elide_template_arguments("MainWindow::onLoadingFinish(unsigned int&)"),
            "MainWindow::onLoadingFinish(unsigned int&)"
        );
        assert_eq!(
            elide_template_arguments(
                "std::vector<test type in bracket> MainWindow::onLoadingFinish(unsigned int&)"
            ),
            "std::vector<> MainWindow::onLoadingFinish(unsigned int&)"
        );
        assert_eq!(
            elide_template_arguments(
                "std::vector<test type in bracket> MainWindow<vector_a>::onLoadingFinish(unsigned int&)"
            ),
            "std::vector<> MainWindow<>::onLoadingFinish(unsigned int&)"
        );
        assert_eq!(
            elide_template_arguments(
                "std::vector<test type <int> in bracket> MainWindow::onLoadingFinish(unsigned int&)"
            ),
            "std::vector<> MainWindow::onLoadingFinish(unsigned int&)"
        );
    }

    #[test]
    fn operators_are_not_template_markers() {
        assert_eq!(
            elide_template_arguments("bool MyType::operator<(MyType const&)"),
            "bool MyType::operator<(MyType const&)"
        );
        assert_eq!(
            elide_template_arguments("std::ostream& operator<<(std::ostream&, Foo const&)"),
            "std::ostream& operator<<(std::ostream&, Foo const&)"
        );
        assert_eq!(
            elide_template_arguments("bool Wrapped<int>::operator>(Wrapped<int> const&)"),
            "bool Wrapped<>::operator>(Wrapped<> const&)"
        );
    }
}
