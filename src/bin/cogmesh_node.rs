//! cogmesh cluster node
//!
//! A standalone binary running one replicating atom-space node.

use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::EnvFilter;

use cogmesh::cluster::config::DEFAULT_PORT;
use cogmesh::{AtomSpace, ClusterConfig, ClusterNode, ConflictStrategy, NodeId};

/// Node configuration assembled from the command line.
struct Config {
    /// Host to bind and advertise
    host: String,
    /// Port to listen on
    port: u16,
    /// Cluster to form or join
    cluster_id: String,
    /// Stable node identity; generated when absent
    node_id: Option<NodeId>,
    /// Existing member to join through
    seed: Option<(String, u16)>,
    /// Conflict resolution strategy
    strategy: ConflictStrategy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            cluster_id: "cogmesh".to_string(),
            node_id: None,
            seed: None,
            strategy: ConflictStrategy::MergeTruthValues,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                if i + 1 < args.len() {
                    config.host = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("error: --host requires a value");
                    std::process::exit(1);
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    config.port = args[i + 1].parse().unwrap_or_else(|_| {
                        eprintln!("error: invalid port number: {}", args[i + 1]);
                        std::process::exit(1);
                    });
                    i += 2;
                } else {
                    eprintln!("error: --port requires a value");
                    std::process::exit(1);
                }
            }
            "--cluster-id" | "-c" => {
                if i + 1 < args.len() {
                    config.cluster_id = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("error: --cluster-id requires a value");
                    std::process::exit(1);
                }
            }
            "--node-id" | "-n" => {
                if i + 1 < args.len() {
                    let node_id = NodeId::new(args[i + 1].as_str()).unwrap_or_else(|e| {
                        eprintln!("error: {e}");
                        std::process::exit(1);
                    });
                    config.node_id = Some(node_id);
                    i += 2;
                } else {
                    eprintln!("error: --node-id requires a value");
                    std::process::exit(1);
                }
            }
            "--seed" | "-s" => {
                if i + 1 < args.len() {
                    let Some((host, port)) = args[i + 1].rsplit_once(':') else {
                        eprintln!("error: --seed expects host:port, got: {}", args[i + 1]);
                        std::process::exit(1);
                    };
                    let port: u16 = port.parse().unwrap_or_else(|_| {
                        eprintln!("error: invalid seed port: {}", args[i + 1]);
                        std::process::exit(1);
                    });
                    config.seed = Some((host.to_string(), port));
                    i += 2;
                } else {
                    eprintln!("error: --seed requires a value");
                    std::process::exit(1);
                }
            }
            "--strategy" => {
                if i + 1 < args.len() {
                    config.strategy = args[i + 1].parse().unwrap_or_else(|e| {
                        eprintln!("error: {e}");
                        std::process::exit(1);
                    });
                    i += 2;
                } else {
                    eprintln!("error: --strategy requires a value");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                println!("cogmesh-node - Replicated atom-space cluster node");
                println!();
                println!("USAGE:");
                println!("    cogmesh-node [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --host <HOST>            Host to bind and advertise [default: 127.0.0.1]");
                println!("    -p, --port <PORT>        Port to listen on [default: {DEFAULT_PORT}]");
                println!("    -c, --cluster-id <ID>    Cluster to form or join [default: cogmesh]");
                println!("    -n, --node-id <ID>       Stable node identity [default: generated]");
                println!("    -s, --seed <HOST:PORT>   Existing member to join through");
                println!("    --strategy <NAME>        Conflict strategy: last_write_wins,");
                println!("                             merge_truth_values, vector_clock or");
                println!("                             consensus_voting [default: merge_truth_values]");
                println!("    -h, --help               Print help information");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut cluster = ClusterConfig::new(&config.cluster_id)
        .with_host(&config.host)
        .with_port(config.port)
        .with_strategy(config.strategy);
    if let Some(node_id) = config.node_id {
        cluster = cluster.with_node_id(node_id);
    }

    let space = Arc::new(AtomSpace::new());
    let node = ClusterNode::new(cluster, Arc::clone(&space))?;

    node.start().await?;
    if let Some((seed_host, seed_port)) = &config.seed {
        node.join_cluster(seed_host, *seed_port).await?;
    }

    tracing::info!("press Ctrl+C to stop");
    let _ = signal::ctrl_c().await;

    node.stop().await;
    Ok(())
}
