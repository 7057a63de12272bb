//! CLI surface (§2): one process, one role. A cluster is a master process,
//! one or more storage processes pointed at the master, and optionally an
//! admin invocation for one-shot cluster operations (§6).

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Runs one node of a NEO cluster, or issues a single admin command
/// against a running one.
#[derive(Debug, Parser)]
#[command(name = "neo", version, about)]
pub struct Args {
    /// Name identifying this cluster; connections naming a different one
    /// are rejected during identification (§4.3).
    #[arg(long, env = "NEO_CLUSTER")]
    pub cluster_name: String,

    #[command(subcommand)]
    pub role: RoleArgs,
}

#[derive(Debug, Subcommand)]
pub enum RoleArgs {
    /// Runs the primary master: election bootstrap, cluster-state
    /// lifecycle, membership, partition table, two-phase commit.
    Master {
        /// Address this master listens on for storages, clients, and admins.
        #[arg(long, default_value = "127.0.0.1:9100")]
        bind: SocketAddr,
        #[arg(long, default_value_t = 12)]
        num_partitions: u32,
        #[arg(long, default_value_t = 1)]
        num_replicas: u32,
    },
    /// Runs a storage node backed by a `redb` file at `--data`.
    Storage {
        #[arg(long, default_value = "127.0.0.1:9200")]
        bind: SocketAddr,
        #[arg(long)]
        master: SocketAddr,
        #[arg(long, default_value = "neo-storage.redb")]
        data: PathBuf,
        #[arg(long, default_value_t = 12)]
        num_partitions: u32,
    },
    /// Issues one admin command against the primary master and exits
    /// (§6); not a persistent process.
    Admin {
        #[arg(long)]
        master: SocketAddr,
        #[arg(value_enum)]
        command: AdminCommand,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum AdminCommand {
    Nodes,
    Partitions,
    ClusterState,
    Primary,
}
