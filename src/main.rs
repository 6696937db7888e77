use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use spantree::fetch::{EmbeddedTransactionIndex, FileEventFetcher};
use spantree::filter::{operation_breakdown, OperationNameFilter};
use spantree::load::load_trace_file;
use spantree::logging::{init_logging, LogFormat};
use spantree::persistent::{load_settings, save_settings, ViewSettings};
use spantree::render::{render_waterfall, RenderOptions};
use spantree::span_tree::{NodePath, SpanTreeNode};
use spantree::types::{time_point_to_utc_string, TraceEvent, MILLISECONDS_PER_SECOND};
use spantree::{ViewWindow, WaterfallModel};

/// Embedded transactions can embed further transactions, possibly in a loop.
const MAX_EXPAND_ROUNDS: usize = 8;

#[derive(Parser)]
#[command(name = "spantree")]
#[command(version, about = "Print the span waterfall of a trace", long_about = None)]
struct Cli {
    /// Transaction event JSON or OTLP JSON export, optionally gzipped
    trace_file: PathBuf,

    /// Directory with `<event>.json` files of embedded transactions
    #[arg(long)]
    embedded_dir: Option<PathBuf>,

    /// Expand every span that has embedded transactions in --embedded-dir
    #[arg(long, requires = "embedded_dir")]
    expand_all: bool,

    /// Organization passed to the fetcher
    #[arg(long, default_value = "default")]
    org: String,

    /// Only show spans with this operation name (repeatable)
    #[arg(long = "op")]
    operations: Vec<String>,

    /// Apply a saved filter preset
    #[arg(long, conflicts_with = "operations")]
    preset: Option<String>,

    /// Only show spans whose id, operation or description contains this text
    #[arg(long)]
    search: Option<String>,

    /// Hide the children of this span (repeatable)
    #[arg(long = "hide")]
    hidden: Vec<String>,

    /// Visible part of the trace, as fractions
    #[arg(long, num_args = 2, value_names = ["START", "END"])]
    view: Option<Vec<f64>>,

    /// Show gaps between siblings longer than this many seconds
    #[arg(long)]
    gaps: Option<f64>,

    /// Fold runs of at least this many identical siblings
    #[arg(long)]
    group_size: Option<usize>,

    /// Store --gaps and --group-size as defaults
    #[arg(long)]
    save_settings: bool,

    /// Print operation counts
    #[arg(long)]
    counts: bool,

    /// Print span timestamps
    #[arg(long)]
    timestamps: bool,

    /// Width of the timeline bar
    #[arg(long, default_value_t = 40)]
    width: usize,

    #[arg(long, value_enum, default_value = "human")]
    log_format: LogFormat,

    #[arg(long, default_value = "warn", env = "SPANTREE_LOG")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format, &cli.log_level)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let settings = view_settings(&cli)?;

    let events = load_trace_file(&cli.trace_file)?;
    info!(events = events.len(), "loaded trace file");

    let embedded_index = match &cli.embedded_dir {
        Some(dir) => EmbeddedTransactionIndex::from_dir(dir)?,
        None => EmbeddedTransactionIndex::default(),
    };

    for event in &events {
        let model = build_model(&cli, event, settings.clone(), &embedded_index).await?;
        print_model(&cli, event, &model);
    }

    Ok(())
}

fn view_settings(cli: &Cli) -> Result<ViewSettings> {
    let mut settings = load_settings().unwrap_or_else(|err| {
        warn!(error = %err, "failed to load settings, using defaults");
        ViewSettings::default()
    });

    if let Some(group_size) = cli.group_size {
        settings.min_sibling_group_size = group_size;
    }
    if cli.gaps.is_some() {
        settings.gap_threshold = cli.gaps;
    }
    if cli.save_settings {
        save_settings(&settings)?;
    }

    Ok(settings)
}

async fn build_model(
    cli: &Cli,
    event: &TraceEvent,
    settings: ViewSettings,
    embedded_index: &EmbeddedTransactionIndex,
) -> Result<WaterfallModel> {
    let mut model = WaterfallModel::from_event(event, settings)?;

    if let Some(preset) = &cli.preset {
        if !model.apply_filter_preset(preset) {
            anyhow::bail!("No filter preset named {preset:?}");
        }
    } else {
        model.set_operation_name_filter(OperationNameFilter::from_operations(
            cli.operations.iter().cloned(),
        ));
    }
    if let Some(search) = &cli.search {
        model.set_search(search)?;
    }
    for span_id in &cli.hidden {
        model.toggle_span_sub_tree(span_id);
    }
    if let Some(view) = &cli.view {
        model.set_view_window(ViewWindow::new(view[0], view[1]));
    }

    if let (true, Some(dir)) = (cli.expand_all, &cli.embedded_dir) {
        let fetcher = FileEventFetcher::new(dir);
        let mut attempted = HashSet::new();
        for _ in 0..MAX_EXPAND_ROUNDS {
            let pending: Vec<(NodePath, Vec<String>)> =
                expandable_nodes(&model.root, embedded_index)
                    .into_iter()
                    .filter(|(path, _)| attempted.insert(path.clone()))
                    .collect();
            if pending.is_empty() {
                break;
            }
            for (path, event_slugs) in pending {
                model
                    .toggle_embedded_children(&path, &cli.org, &event_slugs, &fetcher)
                    .await;
            }
        }
    }

    Ok(model)
}

/// Collapsed nodes that have embedded transactions, with the slugs of those transactions.
fn expandable_nodes(
    root: &SpanTreeNode,
    embedded_index: &EmbeddedTransactionIndex,
) -> Vec<(NodePath, Vec<String>)> {
    let mut result = Vec::new();
    let mut stack = vec![(NodePath::root(), root)];
    while let Some((path, node)) = stack.pop() {
        let event_slugs = embedded_index.event_slugs(&node.span.span_id);
        if !event_slugs.is_empty() && !node.show_embedded_children() {
            result.push((path.clone(), event_slugs.to_vec()));
        }
        for (idx, child) in node.descendants().enumerate() {
            stack.push((path.child(idx), child));
        }
    }
    result.sort();
    result
}

fn print_model(cli: &Cli, event: &TraceEvent, model: &WaterfallModel) {
    let trace_bounds = model.trace_bounds();
    println!(
        "{} [{}] {} - {} ({:.3}ms)",
        if event.title.is_empty() {
            "<untitled>"
        } else {
            &event.title
        },
        event.event_id,
        time_point_to_utc_string(trace_bounds.start),
        time_point_to_utc_string(trace_bounds.end),
        trace_bounds.duration() * MILLISECONDS_PER_SECOND,
    );

    let options = RenderOptions {
        bar_width: cli.width,
        show_timestamps: cli.timestamps,
    };
    print!("{}", render_waterfall(&model.spans_list(), &options));

    if cli.counts {
        println!();
        for (op, count) in operation_breakdown(&model.root) {
            println!("{count:>6} {op}");
        }
    }
    println!();
}
