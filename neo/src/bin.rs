use clap::Parser;

use neo::config::{Args, RoleArgs};

fn main() -> neo_base::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    match args.role {
        RoleArgs::Master { bind, num_partitions, num_replicas } => neo::run_master(args.cluster_name, bind, num_partitions, num_replicas),
        RoleArgs::Storage { bind, master, data, num_partitions } => neo::run_storage(args.cluster_name, bind, master, data, num_partitions),
        RoleArgs::Admin { master, command } => neo::run_admin(args.cluster_name, master, command),
    }
}
