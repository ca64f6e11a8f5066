//! `swc-ctl`: connects to a running `swc-node`'s control socket and issues
//! control-surface RPCs (spec §6), in the style of the teacher's host-side
//! `bootimage-builder` tool (`clap` + `anyhow`, plain `println!` reporting).

use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use swc_core::control::{read_frame, write_frame, ControlRequest, ControlResponse};

#[derive(Parser, Debug)]
#[command(name = "swc-ctl")]
#[command(about = "Controls a running shared-window coherence node")]
struct Args {
    /// Path to the target node's control socket.
    #[arg(short, long, default_value = "/tmp/swc-node.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enable fault/message servicing.
    Enable,
    /// Disable fault/message servicing without tearing down state.
    Disable,
    /// Start the periodic replication daemon.
    StartReplication {
        #[arg(long, default_value_t = 60)]
        interval_secs: u64,
        #[arg(long, default_value_t = 20)]
        hot_page_percent: u8,
    },
    /// Stop the periodic replication daemon.
    StopReplication,
    /// Age and reclaim every outstanding replica.
    Flush,
    /// Print the current counter snapshot.
    Stats,
    /// Reset fault counters to zero.
    ResetStats,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let request = match args.command {
        Command::Enable => ControlRequest::EnableCoherence,
        Command::Disable => ControlRequest::DisableCoherence,
        Command::StartReplication {
            interval_secs,
            hot_page_percent,
        } => ControlRequest::StartReplication {
            interval_secs,
            hot_page_percent,
        },
        Command::StopReplication => ControlRequest::StopReplication,
        Command::Flush => ControlRequest::FlushAll,
        Command::Stats => ControlRequest::Stats,
        Command::ResetStats => ControlRequest::ResetStats,
    };

    let mut stream = UnixStream::connect(&args.socket)
        .with_context(|| format!("connecting to control socket {}", args.socket.display()))?;
    write_frame(&mut stream, &request).context("sending control request")?;
    let response: ControlResponse = read_frame(&mut stream).context("reading control response")?;

    match response {
        ControlResponse::Ok => println!("ok"),
        ControlResponse::Stats(snapshot) => {
            println!("fault_reads:          {}", snapshot.fault_reads);
            println!("fault_writes:         {}", snapshot.fault_writes);
            println!("replica_allocated:    {}", snapshot.replica_allocated);
            println!("replica_hits:         {}", snapshot.replica_hits);
            println!("replica_creates:      {}", snapshot.replica_creates);
            println!("replica_frees:        {}", snapshot.replica_frees);
            println!("coherence_enabled:    {}", snapshot.coherence_enabled);
            println!("replication_enabled:  {}", snapshot.replication_enabled);
        }
        ControlResponse::Error(message) => {
            anyhow::bail!("node reported an error: {message}");
        }
    }
    Ok(())
}
