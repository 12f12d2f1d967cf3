//! Operator tool of the cxm daemon (cxmctl).
//!
//! Talks to the daemon running on the same host through its local socket.
//!
//! # Usage
//!
//! ```text
//! cxmctl [OPTIONS] <COMMAND>
//!
//! Commands:
//!   ping      Check that the local daemon answers
//!   status    Show the role and mode of the local node
//!   dump      Show the internal state of the local coordinator
//!   nodes     List the cluster members
//!   election  Force a new election
//!   panic     Put the cluster in panic mode
//!   recover   Leave panic mode and re-elect (master only)
//!   balance   Run the load balancer (master only)
//!   quit      Make the local node leave the cluster
//!   format    Format a heartbeat device (offline)
//! ```

mod cluster;
mod common;
mod disk;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cxm_proto::defaults::{DEFAULT_HB_DISK, DEFAULT_LOCAL_SOCKET};
use cxm_proto::rpc::LocalRequest;

use crate::common::exit_error;

/// Operator tool of the cxm daemon.
#[derive(Parser)]
#[command(name = "cxmctl", version, about = "Clustered Xen Management operator tool")]
struct Cli {
    /// Local daemon socket
    #[arg(short = 's', long, default_value = DEFAULT_LOCAL_SOCKET)]
    socket: PathBuf,

    /// Enable verbose/debug logging
    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the local daemon answers
    Ping,
    /// Show the role and mode of the local node
    Status,
    /// Show the internal state of the local coordinator
    Dump {
        /// Print the raw snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the cluster members
    Nodes,
    /// Force a new election
    Election,
    /// Put the cluster in panic mode
    Panic,
    /// Leave panic mode and re-elect (master only)
    Recover,
    /// Run the load balancer (master only)
    Balance {
        /// Only show the migrations
        #[arg(short = 'n', long)]
        dry_run: bool,
    },
    /// Make the local node leave the cluster
    Quit {
        /// Leave even while the local master recovers a node
        #[arg(short = 'f', long)]
        force: bool,
    },
    /// Format a heartbeat device (offline)
    Format {
        /// Heartbeat device
        #[arg(default_value = DEFAULT_HB_DISK)]
        device: PathBuf,

        /// Format even if slots are in use
        #[arg(short = 'f', long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let socket = cli.socket.as_path();
    let result = match cli.command {
        Commands::Ping => cluster::ping(socket).await,
        Commands::Status => cluster::status(socket).await,
        Commands::Dump { json } => cluster::dump(socket, json).await,
        Commands::Nodes => cluster::nodes(socket).await,
        Commands::Election => {
            cluster::action(socket, LocalRequest::ForceElection, "Election started").await
        }
        Commands::Panic => cluster::action(socket, LocalRequest::Panic, "Panic mode engaged").await,
        Commands::Recover => {
            cluster::action(socket, LocalRequest::Recover, "Panic mode cleared, re-electing").await
        }
        Commands::Balance { dry_run } => cluster::balance(socket, dry_run).await,
        Commands::Quit { force } => cluster::quit(socket, force).await,
        Commands::Format { device, force } => disk::format(&device, force),
    };

    if let Err(e) = result {
        exit_error(&e.to_string());
    }
}
