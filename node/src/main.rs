//! `swc-node`: one process in a shared-window coherence cluster.
//!
//! `run` loads a [`NodeConfig`], opens the shared window as a memory-mapped
//! file, wires a [`RingTransport`], starts the coherence core's background
//! daemons, and serves the control surface over a Unix-domain socket until
//! interrupted. `demo` has no real mapping layer to upcall from (spec §1
//! excludes it), so it wires two in-process nodes over a [`LoopbackTransport`]
//! pair sharing one [`InMemoryWindow`] and synthesizes a handful of fault
//! upcalls, the same way `cargo run --bin veridian-kernel` boots the teacher
//! kernel under QEMU for a human to observe.

use std::io::{BufReader, BufWriter};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use swc_core::config::NodeConfig;
use swc_core::control::{read_frame, write_frame, ControlRequest, ControlResponse, ControlSurface};
use swc_core::ipc::{LoopbackNetwork, RingSet, RingTransport};
use swc_core::window::{InMemoryWindow, MmapWindow};
use swc_core::CoherenceNode;

#[derive(Parser, Debug)]
#[command(name = "swc-node")]
#[command(about = "Runs one node of a software-managed shared-window coherence cluster")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a real node against a configured shared window and ring set.
    Run {
        /// Path to a TOML config file; falls back to defaults for anything
        /// it omits.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Zero this node out as the ring-area initializer. Exactly one
        /// node in the cluster must pass this flag (spec §4.2 init
        /// discipline runs once, not once per process).
        #[arg(long)]
        init_rings: bool,
    },
    /// Synthesize local faults between two in-process nodes and print the
    /// resulting coherence transitions. Outside the tested invariants.
    Demo {
        #[arg(long, default_value_t = 4096)]
        offset: u64,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    swc_core::logging::init(log::LevelFilter::Info);

    let args = Args::parse();
    match args.command {
        Command::Run { config, init_rings } => run(config, init_rings),
        Command::Demo { offset } => demo(offset),
    }
}

fn run(config_path: Option<PathBuf>, init_rings: bool) -> Result<()> {
    let config = match config_path {
        Some(path) => NodeConfig::load(&path).with_context(|| format!("loading config from {}", path.display()))?,
        None => NodeConfig::default(),
    };
    config.validate().context("validating node config")?;

    info!(
        "swc-node starting: node_id={} node_count={} window={}",
        config.node_id,
        config.node_count,
        config.window_path.display()
    );

    let ring_stride = swc_core::ipc::ring_window_stride(config.ring_capacity);
    let ring_bytes = ring_stride * (config.node_count * config.node_count.saturating_sub(1)) as u64;
    let window_len = (config.ring_area_base + ring_bytes) as usize;
    let window = Arc::new(
        MmapWindow::open(&config.window_path, window_len)
            .with_context(|| format!("opening shared window at {}", config.window_path.display()))?,
    );

    let ring_window: Arc<dyn swc_core::window::SharedWindow> = window.clone();
    let rings = Arc::new(RingSet::new(
        ring_window,
        config.ring_area_base,
        config.node_count,
        config.ring_capacity,
    ));
    if init_rings {
        let ring_count = config.node_count * config.node_count.saturating_sub(1);
        info!("initializing ring area ({ring_bytes} bytes across {ring_count} rings)");
        rings.init_all();
    }

    let transport = Arc::new(RingTransport::new(config.node_id, rings));
    let node = Arc::new(CoherenceNode::new(&config, transport, window));
    node.start();
    node.runtime().set_coherence_enabled(true);

    let listener = UnixListener::bind(&config.control_socket)
        .with_context(|| format!("binding control socket at {}", config.control_socket.display()))?;
    info!("control surface listening on {}", config.control_socket.display());

    let surface = Arc::new(ControlSurface::new(node.clone()));
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let surface = surface.clone();
                std::thread::spawn(move || serve_control_connection(stream, &surface));
            }
            Err(err) => warn!("control socket accept failed: {err}"),
        }
    }

    node.shutdown();
    Ok(())
}

fn serve_control_connection<T, W>(stream: UnixStream, surface: &ControlSurface<T, W>)
where
    T: swc_core::ipc::Transport + 'static,
    W: swc_core::window::SharedWindow + 'static,
{
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            warn!("control connection clone failed: {err}");
            return;
        }
    });
    let mut writer = BufWriter::new(stream);
    loop {
        let request: ControlRequest = match read_frame(&mut reader) {
            Ok(request) => request,
            Err(_) => return, // client disconnected
        };
        let response = surface.handle(request);
        if let Err(err) = write_frame(&mut writer, &response) {
            warn!("control connection write failed: {err}");
            return;
        }
    }
}

/// Spec §6: "node additionally ships a `demo` subcommand that synthesizes
/// fault upcalls against a local in-memory window." Two in-process nodes
/// share one window: node 0 reads a page cold (I -> S), then node 1 writes
/// the same page, forcing node 0 to service an INVALIDATE so the transition
/// through I -> S -> M is observable end to end.
fn demo(offset: u64) -> Result<()> {
    let window = Arc::new(InMemoryWindow::new(1 << 20));
    let mut transports = LoopbackNetwork::build(2);
    let t1 = Arc::new(transports.remove(1));
    let t0 = Arc::new(transports.remove(0));

    let config0 = NodeConfig {
        node_id: 0,
        node_count: 2,
        ..NodeConfig::default()
    };
    let config1 = NodeConfig {
        node_id: 1,
        node_count: 2,
        ..NodeConfig::default()
    };

    let node0 = Arc::new(CoherenceNode::new(&config0, t0, window.clone()));
    let node1 = Arc::new(CoherenceNode::new(&config1, t1, window.clone()));
    node0.start();
    node1.start();

    println!("demo: node 0 reads offset {offset:#x} (expect cold fault, I -> S)");
    let outcome = node0.engine().on_local_fault(window.as_ref(), offset, false)?;
    println!("  -> {outcome:?}");

    println!("demo: node 1 writes the same offset (expect invalidate-broadcast fault, I -> M)");
    let outcome = node1.engine().on_local_fault(window.as_ref(), offset, true)?;
    println!("  -> {outcome:?}");

    node0.shutdown();
    node1.shutdown();
    Ok(())
}
