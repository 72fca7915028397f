//! Demo event-processing pipeline: wires a small source/map/sink topology
//! and runs it to completion, mirroring the CLI surface the original
//! engine's `jana` executable exposes (thread count, event bounds,
//! topology/call-graph dumps).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use jana2_core::{Event, EventLevel};
use jana2_engine::{AffinityStrategy, LocalityStrategy, Supervisor, SupervisorConfig};
use jana2_pool::{Limit, Mailbox, Pool};
use jana2_topology::arrow::{EmitStatus, MapArrow, Processor, SinkArrow, SourceArrow};
use jana2_topology::topology::{PortBinding, PortDirection, PortKind, TopologyBuilder};
use jana2_topology::{Arrow, Topology, TopologySummary};

/// A small multithreaded event-processing pipeline.
#[derive(Parser, Debug)]
#[command(name = "jana2")]
#[command(about = "Run the demo event-processing pipeline", long_about = None)]
struct Cli {
    /// Number of worker threads.
    #[arg(long, default_value_t = 1)]
    nthreads: usize,

    /// Number of events to process (unbounded if omitted).
    #[arg(long = "jana:nevents")]
    nevents: Option<u64>,

    /// Number of leading events to skip.
    #[arg(long = "jana:nskip", default_value_t = 0)]
    nskip: u64,

    /// Print the frozen topology as a table and exit without running.
    #[arg(long)]
    dump_topology: bool,

    /// Print the frozen topology as JSON and exit without running.
    #[arg(long)]
    dump_topology_json: bool,

    /// Optional path to write a JSON call-graph dump of the first event
    /// the sink observes.
    #[arg(long)]
    dump_callgraph: Option<PathBuf>,
}

struct SumProcessor {
    total: Arc<AtomicU64>,
    first_call_graph: Arc<parking_lot::Mutex<Option<Vec<jana2_core::call_graph::CallGraphEdge>>>>,
}

impl Processor for SumProcessor {
    fn name(&self) -> &str {
        "sum"
    }

    fn process(&self, event: &Event) -> jana2_core::JanaResult<()> {
        let scaled: Vec<i64> = event.get("scaled")?;
        let sum: i64 = scaled.iter().sum();
        self.total.fetch_add(sum as u64, Ordering::Relaxed);

        let mut slot = self.first_call_graph.lock();
        if slot.is_none() {
            *slot = Some(event.call_graph_edges());
        }
        Ok(())
    }
}

/// Build the demo topology: a source emitting `raw = i`, a map computing
/// `scaled = 2*raw - 1`, and a sink summing `scaled` into `total`.
fn build_demo_topology(
    nevents: Option<u64>,
    nskip: u64,
    total: Arc<AtomicU64>,
    first_call_graph: Arc<parking_lot::Mutex<Option<Vec<jana2_core::call_graph::CallGraphEdge>>>>,
) -> anyhow::Result<Topology> {
    let pool = Arc::new(Pool::new(
        1,
        16,
        Limit::Elastic,
        || Event::new(EventLevel::PhysicsEvent),
        |e: &mut Event| e.recycle(),
    ));
    let raw_to_map: Arc<Mailbox<Arc<Event>>> = Arc::new(Mailbox::new(1, 64));
    let map_to_sink: Arc<Mailbox<Arc<Event>>> = Arc::new(Mailbox::new(1, 64));

    let raw_counter = Arc::new(AtomicU64::new(0));
    let source = Arc::new(SourceArrow::new(
        "source",
        EventLevel::PhysicsEvent,
        pool.clone(),
        raw_to_map.clone(),
        16,
        nskip,
        nevents,
        move |event: &Event| {
            let i = raw_counter.fetch_add(1, Ordering::Relaxed) as i64 + 1;
            event.insert("raw", vec![i]);
            Ok(EmitStatus::Success)
        },
    ));

    let map = Arc::new(MapArrow::new("scale", raw_to_map, map_to_sink.clone(), |event: &Event| {
        let raw: Vec<i64> = event.get("raw")?;
        let scaled: Vec<i64> = raw.iter().map(|i| 2 * i - 1).collect();
        event.insert("scaled", scaled);
        Ok(())
    }));

    let sink = Arc::new(SinkArrow::terminal(
        "sum",
        map_to_sink,
        vec![Arc::new(SumProcessor { total, first_call_graph })],
        pool.clone(),
    ));

    let mut builder = TopologyBuilder::new();
    builder.register_event_pool(EventLevel::PhysicsEvent, pool);
    builder.register(
        source as Arc<dyn Arrow>,
        vec![
            PortBinding::new("pool", PortDirection::Input, PortKind::Pool, "event_pool"),
            PortBinding::new("out", PortDirection::Output, PortKind::Queue, "raw_to_map"),
        ],
    )?;
    builder.register(
        map as Arc<dyn Arrow>,
        vec![
            PortBinding::new("in", PortDirection::Input, PortKind::Queue, "raw_to_map"),
            PortBinding::new("out", PortDirection::Output, PortKind::Queue, "map_to_sink"),
        ],
    )?;
    builder.register(
        sink as Arc<dyn Arrow>,
        vec![
            PortBinding::new("in", PortDirection::Input, PortKind::Queue, "map_to_sink"),
            PortBinding::new("pool", PortDirection::Output, PortKind::Pool, "event_pool"),
        ],
    )?;
    builder.tag_recycle_edge("sum", "source");

    builder.freeze().context("failed to freeze demo topology")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let total = Arc::new(AtomicU64::new(0));
    let first_call_graph = Arc::new(parking_lot::Mutex::new(None));
    let topology = build_demo_topology(cli.nevents, cli.nskip, total.clone(), first_call_graph.clone())?;

    if cli.dump_topology || cli.dump_topology_json {
        let summary = TopologySummary::from_topology(&topology);
        if cli.dump_topology_json {
            println!("{}", summary.to_json()?);
        } else {
            print!("{}", summary.to_table());
        }
        return Ok(());
    }

    let mut config = SupervisorConfig::default();
    config.nthreads = cli.nthreads;
    config.affinity = AffinityStrategy::None;
    config.locality = LocalityStrategy::Global;

    let supervisor = Supervisor::new(Arc::new(topology), config);
    supervisor.run().context("engine run failed")?;

    println!("sum = {}", total.load(Ordering::Relaxed));

    if let Some(path) = cli.dump_callgraph {
        let edges = first_call_graph.lock().clone().unwrap_or_default();
        let json = serde_json::to_string_pretty(
            &edges
                .iter()
                .map(|e| format!("{:?}", e))
                .collect::<Vec<_>>(),
        )?;
        std::fs::write(&path, json).with_context(|| format!("failed to write call graph to {}", path.display()))?;
    }

    Ok(())
}
