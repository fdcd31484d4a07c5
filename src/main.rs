use anyhow::Context;
use cluster_fs::cluster::composer::ClusterFs;
use cluster_fs::cluster::partitions::{PartitionDirectory, PartitionId};
use cluster_fs::fs::contract::FileSystem;
use cluster_fs::fs::memory::MemoryFs;
use cluster_fs::http::handlers;
use cluster_fs::tcp::client::RemoteFs;
use cluster_fs::tcp::server::spawn_server;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Single partition node: an in-memory store behind both wire formats.
    Server,
    /// Cluster gateway: the composer over remote partitions, re-exposed
    /// behind both wire formats.
    Gateway,
}

struct Options {
    mode: Mode,
    tcp_addr: SocketAddr,
    http_addr: SocketAddr,
    partitions: Vec<(PartitionId, SocketAddr)>,
    replication: Option<usize>,
    dead_threshold: Option<usize>,
    upload_min: Option<usize>,
    upload_max: Option<usize>,
    check_interval: Duration,
}

fn usage(program: &str) -> ! {
    eprintln!("Usage:");
    eprintln!(
        "  {} --mode server --tcp <addr:port> --http <addr:port>",
        program
    );
    eprintln!(
        "  {} --mode gateway --tcp <addr:port> --http <addr:port> \\",
        program
    );
    eprintln!("      --partition <id=addr:port> [--partition ...] \\");
    eprintln!("      [--replication N | --dead-threshold N --upload-min N --upload-max N] \\");
    eprintln!("      [--check-interval <seconds>]");
    std::process::exit(1);
}

fn parse_options() -> anyhow::Result<Options> {
    let args: Vec<String> = std::env::args().collect();
    let program = args[0].clone();

    let mut mode = None;
    let mut tcp_addr = None;
    let mut http_addr = None;
    let mut partitions = Vec::new();
    let mut replication = None;
    let mut dead_threshold = None;
    let mut upload_min = None;
    let mut upload_max = None;
    let mut check_interval = Duration::from_secs(30);

    fn arg_value<'a>(args: &'a [String], i: usize) -> anyhow::Result<&'a str> {
        args.get(i + 1)
            .map(|s| s.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing value for {}", args[i]))
    }

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--mode" => {
                mode = Some(match arg_value(&args, i)? {
                    "server" => Mode::Server,
                    "gateway" => Mode::Gateway,
                    other => anyhow::bail!("unknown mode '{}'", other),
                });
                i += 2;
            }
            "--tcp" => {
                tcp_addr = Some(arg_value(&args, i)?.parse()?);
                i += 2;
            }
            "--http" => {
                http_addr = Some(arg_value(&args, i)?.parse()?);
                i += 2;
            }
            "--partition" => {
                let spec = arg_value(&args, i)?;
                let (id, addr) = spec
                    .split_once('=')
                    .with_context(|| format!("expected id=addr:port, got '{}'", spec))?;
                partitions.push((PartitionId::new(id), addr.parse()?));
                i += 2;
            }
            "--replication" => {
                replication = Some(arg_value(&args, i)?.parse()?);
                i += 2;
            }
            "--dead-threshold" => {
                dead_threshold = Some(arg_value(&args, i)?.parse()?);
                i += 2;
            }
            "--upload-min" => {
                upload_min = Some(arg_value(&args, i)?.parse()?);
                i += 2;
            }
            "--upload-max" => {
                upload_max = Some(arg_value(&args, i)?.parse()?);
                i += 2;
            }
            "--check-interval" => {
                check_interval = Duration::from_secs(arg_value(&args, i)?.parse()?);
                i += 2;
            }
            "--help" | "-h" => usage(&program),
            other => {
                eprintln!("unknown argument '{}'", other);
                usage(&program);
            }
        }
    }

    // Replication can also come from the environment, flags win.
    if replication.is_none() {
        replication = std::env::var("REPLICATION_COUNT")
            .ok()
            .and_then(|value| value.parse().ok());
    }

    let (Some(mode), Some(tcp_addr), Some(http_addr)) = (mode, tcp_addr, http_addr) else {
        usage(&program);
    };
    Ok(Options {
        mode,
        tcp_addr,
        http_addr,
        partitions,
        replication,
        dead_threshold,
        upload_min,
        upload_max,
        check_interval,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let options = parse_options()?;

    let fs: Arc<dyn FileSystem> = match options.mode {
        Mode::Server => {
            tracing::info!("starting partition node");
            Arc::new(MemoryFs::new())
        }
        Mode::Gateway => {
            if options.partitions.is_empty() {
                anyhow::bail!("gateway mode needs at least one --partition");
            }
            tracing::info!(
                "starting cluster gateway over {} partition(s)",
                options.partitions.len()
            );

            let mut directory = PartitionDirectory::new();
            for (id, addr) in &options.partitions {
                tracing::info!("partition '{}' at {}", id, addr);
                directory = directory.with_partition(
                    id.clone(),
                    Arc::new(RemoteFs::new(*addr)) as Arc<dyn FileSystem>,
                );
            }
            let directory = Arc::new(directory);

            let mut cluster = ClusterFs::new(Arc::clone(&directory));
            if let Some(replication) = options.replication {
                cluster = cluster
                    .with_replication_count(replication)
                    .map_err(|e| anyhow::anyhow!(e))?;
            } else if options.dead_threshold.is_some()
                || options.upload_min.is_some()
                || options.upload_max.is_some()
            {
                cluster = cluster
                    .with_persistence_options(
                        options.dead_threshold.unwrap_or(0),
                        options.upload_min.unwrap_or(1),
                        options.upload_max.unwrap_or(1),
                    )
                    .map_err(|e| anyhow::anyhow!(e))?;
            }

            // Initial sweep so the gateway starts with an honest view.
            directory.check_all_partitions().await;
            let dead = directory.dead_ids();
            if dead.is_empty() {
                tracing::info!("all partitions reachable");
            } else {
                tracing::warn!("unreachable partitions at startup: {:?}", dead);
            }

            // Periodic rehabilitation of dead partitions.
            let check_directory = Arc::clone(&directory);
            let interval = options.check_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    check_directory.check_dead_partitions().await;
                }
            });

            Arc::new(cluster)
        }
    };

    let tcp_addr = spawn_server(Arc::clone(&fs), options.tcp_addr).await?;
    tracing::info!("TCP endpoint ready on {}", tcp_addr);

    let listener = tokio::net::TcpListener::bind(options.http_addr).await?;
    tracing::info!("HTTP endpoint ready on {}", listener.local_addr()?);
    let app = handlers::router(fs);
    axum::serve(listener, app).await?;

    Ok(())
}
