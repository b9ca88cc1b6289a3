use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};

use heapscope::analyze::caller_callee::to_caller_callee;
use heapscope::analyze::chart::{self, ChartBuilder};
use heapscope::analyze::histogram::build_size_histogram;
use heapscope::analyze::tree::{merge_allocations, to_top_down};
use heapscope::core::trace_data::{
    AllocationData, FilterParameters, NoopObserver, ParsePass, TraceData,
};
use heapscope::interpret;
use heapscope::recorder::{self, RecordConfig};
use heapscope::ui::flamegraph;
use heapscope::ui::massif::MassifWriter;
use heapscope::ui::print::{
    print_merged, print_summary, print_unmerged, write_caller_callee, write_histogram, write_tree,
    FormatBytes,
};
use heapscope::ui::CostMember;

#[derive(Parser)]
#[command(
    name = "heapscope",
    version,
    about = "Heap memory profiler for native Linux programs"
)]
struct Args {
    #[command(subcommand)]
    command: SubCmd,
}

#[derive(Subcommand)]
enum SubCmd {
    /// Run a program with the heap tracer preloaded and record its profile
    Record {
        /// Output path; `$$` expands to the traced PID
        #[arg(short, long)]
        output: Option<String>,

        /// Print tracer diagnostics to stderr
        #[arg(short, long)]
        debug: bool,

        /// The command to run
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        cmd: Vec<String>,
    },
    /// Analyze a recorded data file and print reports
    Print(PrintArgs),
    /// Transform a raw tracer stream on stdin into the interned stream on
    /// stdout
    Interpret,
}

/// Cost member selecting the flamegraph weights.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum CostKind {
    Allocations,
    Temporary,
    Leaked,
    Peak,
    Allocated,
}

impl From<CostKind> for CostMember {
    fn from(kind: CostKind) -> CostMember {
        match kind {
            CostKind::Allocations => CostMember::Allocations,
            CostKind::Temporary => CostMember::Temporary,
            CostKind::Leaked => CostMember::Leaked,
            CostKind::Peak => CostMember::Peak,
            CostKind::Allocated => CostMember::Allocated,
        }
    }
}

#[derive(clap::Args)]
struct PrintArgs {
    /// The heapscope data file to print
    #[arg(short, long)]
    file: PathBuf,

    /// Subtract this base data file and show the net change only
    #[arg(long)]
    diff: Option<PathBuf>,

    /// Shorten template identifiers
    #[arg(long, short = 't', default_value_t = true, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    shorten_templates: bool,

    /// Merge backtraces that end in the same function
    #[arg(long, short = 'm', default_value_t = true, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    merge_backtraces: bool,

    /// Print backtraces to top allocators, sorted by peak consumption
    #[arg(long, short = 'p', default_value_t = true, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    print_peaks: bool,

    /// Print backtraces to top allocators, sorted by number of calls to
    /// allocation functions
    #[arg(long, short = 'a', default_value_t = true, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    print_allocators: bool,

    /// Print backtraces to leaked memory allocations
    #[arg(long, short = 'l')]
    print_leaks: bool,

    /// Print top overall allocators, ignoring memory frees
    #[arg(long, short = 'o')]
    print_overall_allocated: bool,

    /// Print top producers of temporary allocations
    #[arg(long, short = 'T')]
    print_temporary: bool,

    /// Path to output file for the merged bottom-up tree
    #[arg(long)]
    print_bottom_up: Option<PathBuf>,

    /// Path to output file for the derived top-down tree
    #[arg(long)]
    print_top_down: Option<PathBuf>,

    /// Path to output file for the caller-callee table
    #[arg(long)]
    print_caller_callee: Option<PathBuf>,

    /// Path to output file for the allocation size histogram
    #[arg(long, short = 'H')]
    print_histogram: Option<PathBuf>,

    /// Path to output file for massif compatible data
    #[arg(long, short = 'M')]
    print_massif: Option<PathBuf>,

    /// Percentage of the current memory usage below which allocations are
    /// aggregated into a below-threshold entry in the massif output
    #[arg(long, default_value_t = 1.0)]
    massif_threshold: f64,

    /// Frequency of detailed snapshots in the massif output; zero disables
    /// the detailed trees
    #[arg(long, default_value_t = 2)]
    massif_detailed_freq: usize,

    /// Path to output file for flamegraph data; rendered as SVG when the
    /// path ends in .svg, written as collapsed stacks otherwise
    #[arg(long, short = 'F')]
    print_flamegraph: Option<PathBuf>,

    /// Cost member weighing the flamegraph
    #[arg(long, value_enum, default_value_t = CostKind::Allocations)]
    flamegraph_cost: CostKind,

    /// Drop flamegraph entries costing less than this
    #[arg(long, default_value_t = 0)]
    flamegraph_cost_threshold: i64,

    /// Minimum flame width in the rendered SVG
    #[arg(long, default_value_t = 0.1)]
    flamegraph_min_width: f64,

    /// Path to output file for the chart time series as JSON
    #[arg(long, short = 'C')]
    print_chart: Option<PathBuf>,

    /// Number of samples over the recorded time span
    #[arg(long, default_value_t = chart::DEFAULT_DATAPOINTS)]
    chart_datapoints: i64,

    /// Number of per-chart series, including the total
    #[arg(long, default_value_t = chart::DEFAULT_NUM_COST)]
    chart_top_sites: usize,

    /// Memory budget for exact peak reconstruction, in MiB
    #[arg(long, default_value_t = 128)]
    peak_budget_mib: usize,

    /// Lower bound of the chart time window, in ms
    #[arg(long, default_value_t = 0)]
    filter_min_ms: i64,

    /// Upper bound of the chart time window, in ms
    #[arg(long)]
    filter_max_ms: Option<i64>,
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    let result = match args.command {
        SubCmd::Record {
            output,
            debug,
            cmd,
        } => recorder::record(RecordConfig {
            out_path: output,
            debug,
            command: cmd,
        }),
        SubCmd::Print(print_args) => print(print_args),
        SubCmd::Interpret => run_interpret(),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("Error: {:#}", error);
            std::process::exit(1);
        }
    }
}

fn run_interpret() -> Result<i32> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut input = stdin.lock();
    let mut output = BufWriter::new(stdout.lock());
    interpret::run(&mut input, &mut output)?;
    output.flush()?;
    Ok(0)
}

fn print(args: PrintArgs) -> Result<i32> {
    let mut data = TraceData::new();
    data.shorten_templates = args.shorten_templates;
    data.peak_budget = args.peak_budget_mib * 1024 * 1024;
    data.filter = FilterParameters {
        min_time: args.filter_min_ms,
        max_time: args.filter_max_ms.unwrap_or(i64::MAX),
    };

    let diff_mode = args.diff.is_some();
    if diff_mode
        && (args.print_massif.is_some()
            || args.print_histogram.is_some()
            || args.print_chart.is_some())
    {
        log::warn!("massif, histogram and chart output are not available in diff mode");
    }

    println!(
        "reading file \"{}\" - please wait, this might take some time...",
        args.file.display()
    );

    match (&args.print_massif, diff_mode) {
        (Some(path), false) => {
            let massif_file = File::create(path)
                .with_context(|| format!("Failed to open massif output file {}", path.display()))?;
            let mut writer = MassifWriter::new(
                BufWriter::new(massif_file),
                args.massif_threshold,
                args.massif_detailed_freq,
            );
            data.read_file(&args.file, ParsePass::CollectCosts, &mut writer)?;
            if !writer.finish() {
                log::warn!("the massif output is incomplete");
            }
        }
        _ => {
            data.read_file(&args.file, ParsePass::CollectCosts, &mut NoopObserver)?;
        }
    }

    if let Some(base_path) = &args.diff {
        let mut base = TraceData::new();
        base.shorten_templates = args.shorten_templates;
        base.peak_budget = data.peak_budget;
        base.read_file(base_path, ParsePass::CollectCosts, &mut NoopObserver)?;
        data.diff(&base);
    }

    if !data.debuggee.is_empty() {
        println!("Debuggee command was: {}", data.debuggee);
    }
    println!("finished reading file, now analyzing data:\n");

    if args.print_allocators {
        println!("MOST CALLS TO ALLOCATION FUNCTIONS");
        print_allocations(
            &data,
            args.merge_backtraces,
            CostMember::Allocations,
            &|cost: &AllocationData| {
                format!(
                    "{} calls to allocation functions with {} peak consumption from",
                    cost.allocations,
                    FormatBytes(cost.peak)
                )
            },
            &|cost: &AllocationData| {
                format!(
                    "{} calls with {} peak consumption from:",
                    cost.allocations,
                    FormatBytes(cost.peak)
                )
            },
        )?;
        println!();
    }

    if args.print_overall_allocated {
        println!("MOST BYTES ALLOCATED OVER TIME (ignoring deallocations)");
        print_allocations(
            &data,
            args.merge_backtraces,
            CostMember::Allocated,
            &|cost: &AllocationData| {
                format!(
                    "{} allocated over {} calls from",
                    FormatBytes(cost.allocated),
                    cost.allocations
                )
            },
            &|cost: &AllocationData| {
                format!(
                    "{} allocated over {} calls from:",
                    FormatBytes(cost.allocated),
                    cost.allocations
                )
            },
        )?;
        println!();
    }

    if args.print_temporary {
        println!("MOST TEMPORARY ALLOCATIONS");
        print_allocations(
            &data,
            args.merge_backtraces,
            CostMember::Temporary,
            &|cost: &AllocationData| {
                format!(
                    "{} temporary allocations of {} allocations in total from",
                    cost.temporary, cost.allocations
                )
            },
            &|cost: &AllocationData| {
                format!(
                    "{} temporary allocations of {} allocations in total from:",
                    cost.temporary, cost.allocations
                )
            },
        )?;
        println!();
    }

    if args.print_peaks {
        println!("PEAK MEMORY CONSUMERS");
        if args.merge_backtraces {
            println!(
                "\nWARNING - the data below is not an accurate calculation of\n\
                 the total peak consumption and can easily be wrong.\n\
                 For an accurate overview, disable backtrace merging."
            );
        }
        print_allocations(
            &data,
            args.merge_backtraces,
            CostMember::Peak,
            &|cost: &AllocationData| {
                format!(
                    "{} peak memory consumed over {} calls from",
                    FormatBytes(cost.peak),
                    cost.allocations
                )
            },
            &|cost: &AllocationData| {
                format!(
                    "{} consumed over {} calls from:",
                    FormatBytes(cost.peak),
                    cost.allocations
                )
            },
        )?;
        println!();
    }

    if args.print_leaks {
        println!("MEMORY LEAKS");
        print_allocations(
            &data,
            args.merge_backtraces,
            CostMember::Leaked,
            &|cost: &AllocationData| {
                format!(
                    "{} leaked over {} calls from",
                    FormatBytes(cost.leaked),
                    cost.allocations
                )
            },
            &|cost: &AllocationData| {
                format!(
                    "{} leaked over {} calls from:",
                    FormatBytes(cost.leaked),
                    cost.allocations
                )
            },
        )?;
        println!();
    }

    let stdout = io::stdout();
    print_summary(&data, &mut stdout.lock())?;

    if args.print_bottom_up.is_some()
        || args.print_top_down.is_some()
        || args.print_caller_callee.is_some()
    {
        let (bottom_up, source_results) = merge_allocations(&data);
        if let Some(path) = &args.print_bottom_up {
            let mut out = BufWriter::new(File::create(path).with_context(|| {
                format!("Failed to open bottom-up output file {}", path.display())
            })?);
            write_tree(&data, &bottom_up, &mut out)?;
        }
        if let Some(path) = &args.print_top_down {
            let top_down = to_top_down(&bottom_up);
            let mut out = BufWriter::new(File::create(path).with_context(|| {
                format!("Failed to open top-down output file {}", path.display())
            })?);
            write_tree(&data, &top_down, &mut out)?;
        }
        if let Some(path) = &args.print_caller_callee {
            let results = to_caller_callee(&bottom_up, &source_results, diff_mode);
            let mut out = BufWriter::new(File::create(path).with_context(|| {
                format!("Failed to open caller-callee output file {}", path.display())
            })?);
            write_caller_callee(&data, &results, &mut out)?;
        }
    }

    if let (Some(path), false) = (&args.print_histogram, diff_mode) {
        let histogram = build_size_histogram(&data, 10);
        let mut out = BufWriter::new(File::create(path).with_context(|| {
            format!("Failed to open histogram output file {}", path.display())
        })?);
        write_histogram(&data, &histogram, &mut out)?;
    }

    if let Some(path) = &args.print_flamegraph {
        let stats = flamegraph::Stats::collect(
            &data,
            args.flamegraph_cost.into(),
            args.flamegraph_cost_threshold,
        );
        let mut out = BufWriter::new(File::create(path).with_context(|| {
            format!("Failed to open flamegraph output file {}", path.display())
        })?);
        if path.extension().is_some_and(|extension| extension == "svg") {
            stats.write_flamegraph(
                &mut out,
                args.flamegraph_cost.into(),
                args.flamegraph_min_width,
            )?;
        } else {
            stats.write_collapsed(&mut out)?;
        }
    }

    if let (Some(path), false) = (&args.print_chart, diff_mode) {
        let mut builder = ChartBuilder::new(&data, args.chart_datapoints, args.chart_top_sites);
        data.read_file(&args.file, ParsePass::BuildCharts, &mut builder)?;
        let mut out = BufWriter::new(File::create(path).with_context(|| {
            format!("Failed to open chart output file {}", path.display())
        })?);
        chart::write_chart_json(
            &mut out,
            &builder.consumed,
            &builder.allocations,
            &builder.temporary,
        )?;
    }

    Ok(0)
}

fn print_allocations(
    data: &TraceData,
    merge_backtraces: bool,
    member: CostMember,
    label: &dyn Fn(&AllocationData) -> String,
    sublabel: &dyn Fn(&AllocationData) -> String,
) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if merge_backtraces {
        print_merged(data, member, label, sublabel, &mut out)
    } else {
        print_unmerged(data, member, label, &mut out)
    }
}
