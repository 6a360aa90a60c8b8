//! spread-sim: drive the activation engine from the command line.
//!
//! Usage:
//!   spread-sim run                          → demo graph, 10 ticks
//!   spread-sim run --seed g.json -s kettle=12 --ticks 50
//!   spread-sim seed > g.json                → write the demo graph as JSON
//!   spread-sim config > engine.toml         → print the default config

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use spread_rs::export::{export_json, import_json, GraphSeed};
use spread_rs::model::{EntityKind, Membership};
use spread_rs::{
    BroadcastSink, Engine, EngineConfig, EngineEvent, Entity, EntityId, Filter, GraphStore, Link,
    LinkId, MemoryStore, Node, NodeId, StimulusRequest,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "spread-sim", about = "Tick-driven activation spreading simulator", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run ticks against a seeded in-memory graph
    Run {
        /// JSON graph seed (default: built-in demo graph)
        #[arg(long)]
        seed: Option<PathBuf>,
        /// Engine config (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of ticks
        #[arg(short, long, default_value_t = 10)]
        ticks: u64,
        /// Stimulus before the first tick, as NODE_NAME=MAGNITUDE (repeatable)
        #[arg(short, long = "stimulus")]
        stimuli: Vec<String>,
        /// Print every event as JSON
        #[arg(long, default_value_t = false)]
        events: bool,
        /// Write the final graph to this file
        #[arg(long)]
        dump: Option<PathBuf>,
    },
    /// Print the demo graph as a JSON seed
    Seed,
    /// Print the default engine config as TOML
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,spread_rs=debug")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match Cli::parse().command {
        Commands::Seed => {
            let store = MemoryStore::new();
            seed_demo(&store).await?;
            export_json(&store, &Filter::all(), &mut std::io::stdout()).await?;
        }
        Commands::Config => {
            print!("{}", EngineConfig::default().to_toml()?);
        }
        Commands::Run { seed, config, ticks, stimuli, events, dump } => {
            let config = match config {
                Some(path) => EngineConfig::load(&path).with_context(|| format!("loading {}", path.display()))?,
                None => EngineConfig::default(),
            };
            let store = Arc::new(MemoryStore::new());
            match seed {
                Some(path) => {
                    let mut file = std::fs::File::open(&path).with_context(|| format!("opening {}", path.display()))?;
                    import_json(store.as_ref(), &mut file).await?;
                }
                None => seed_demo(store.as_ref()).await?,
            }
            run(store, config, ticks, &stimuli, events, dump).await?;
        }
    }
    Ok(())
}

async fn run(
    store: Arc<MemoryStore>,
    config: EngineConfig,
    ticks: u64,
    stimuli: &[String],
    print_events: bool,
    dump: Option<PathBuf>,
) -> anyhow::Result<()> {
    let sink = BroadcastSink::default();
    let mut rx = sink.subscribe();
    let mut engine = Engine::builder(store.clone(), "spread-sim").config(config).events(sink).build()?;

    let snapshot = engine.snapshot().await?;
    let ingress = engine.ingress();
    for s in stimuli {
        let Some((name, magnitude)) = s.split_once('=') else {
            bail!("stimulus must look like NAME=MAGNITUDE, got {s:?}");
        };
        let magnitude: f64 = magnitude.parse().with_context(|| format!("magnitude in {s:?}"))?;
        let Some(node) = snapshot.nodes.iter().find(|n| n.name == name) else {
            bail!("no node named {name:?}");
        };
        ingress.send(StimulusRequest::node(node.id, magnitude));
    }

    let printer = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    eprintln!("event printer lagged, {n} events skipped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if print_events {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
            } else if let EngineEvent::TickSummary { tick, total_energy, energy_moved, criticality, workspace_size, .. } = event {
                println!(
                    "tick {tick:>4}  energy {total_energy:>9.3}  moved {energy_moved:>8.3}  {criticality:?}  workspace {workspace_size}"
                );
            }
        }
    });

    for _ in 0..ticks {
        engine.tick().await?;
    }
    drop(engine);
    printer.await?;

    if let Some(path) = dump {
        let mut file = std::fs::File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        export_json(store.as_ref(), &Filter::all(), &mut file).await?;
    }
    Ok(())
}

/// A kitchen: two routines sharing a kettle.
async fn seed_demo<S: GraphStore + ?Sized>(store: &S) -> anyhow::Result<()> {
    let seed = GraphSeed {
        nodes: ["kettle", "water", "tea", "cup", "toast", "butter"]
            .iter()
            .enumerate()
            .map(|(i, name)| Node::new(NodeId(i as u64 + 1), *name).with_threshold(2.0))
            .collect(),
        links: [(1, 2), (2, 3), (3, 4), (1, 5), (5, 6), (6, 4)]
            .iter()
            .enumerate()
            .map(|(i, &(s, t))| Link::new(LinkId(i as u64 + 1), NodeId(s), NodeId(t), "then").with_weight(1.0))
            .collect(),
        entities: vec![
            Entity::new(EntityId(1), "tea-routine", EntityKind::Functional),
            Entity::new(EntityId(2), "breakfast", EntityKind::Functional),
        ],
        memberships: vec![
            Membership::new(NodeId(1), EntityId(1), 0.9),
            Membership::new(NodeId(2), EntityId(1), 0.8),
            Membership::new(NodeId(3), EntityId(1), 1.0),
            Membership::new(NodeId(4), EntityId(1), 0.5),
            Membership::new(NodeId(4), EntityId(2), 0.5),
            Membership::new(NodeId(5), EntityId(2), 1.0),
            Membership::new(NodeId(6), EntityId(2), 0.7),
        ],
        boundaries: vec![spread_rs::Boundary::new(EntityId(1), EntityId(2))],
    };
    spread_rs::export::import_seed(store, seed).await?;
    Ok(())
}
