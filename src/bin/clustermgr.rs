//! Cluster manager binary

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use shardmesh::common::{parse_duration, ClusterConfig, Config};
use shardmesh::coordinator::{MarkdownOp, Redistributor, WaitOptions};
use shardmesh::store::{open_backend, ClusterCache};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_STATE_DUMP: &str = "redist_state.json";

#[derive(Parser)]
#[command(name = "shardmesh-clustermgr")]
#[command(about = "Manage cluster topology and shard redistribution")]
struct Cli {
    /// Configuration of the running cluster
    #[arg(long, short, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Configuration of the target cluster
    #[arg(long, global = true)]
    new_config: Option<PathBuf>,

    /// Print the store writes instead of applying them
    #[arg(long, global = true)]
    dryrun: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the initial topology of a new cluster
    Store,

    /// Print the committed topology as store keys
    Load,

    /// Redistribute shards to a new topology
    Redist {
        #[command(subcommand)]
        command: RedistCommand,
    },

    /// Replace node endpoints without moving shards
    Swaphost,

    /// Republish the topology held in the local cache
    Restore,

    /// Mark a whole zone down for routing
    Zonemarkdown {
        #[command(subcommand)]
        command: MarkdownCommand,
    },
}

#[derive(Args)]
struct AutoArgs {
    /// Redistribute this zone only
    #[arg(long)]
    zone: Option<u32>,

    /// Abandon this zone when redistributing all zones
    #[arg(long = "skipzone")]
    skip_zone: Option<u32>,

    /// Shards allowed to miss the finish state
    #[arg(long)]
    max_failures: Option<u32>,

    /// Wait before accepting a partial finish, e.g. "90s" or "5m"
    #[arg(long, value_parser = parse_wait)]
    min_wait: Option<Duration>,

    /// Give up waiting after this long; 0 waits indefinitely
    #[arg(long, value_parser = parse_wait)]
    max_wait: Option<Duration>,

    /// Source copy rate limit; 0 is unlimited
    #[arg(long = "ratelimit")]
    rate_limit: Option<u32>,

    /// Mark each zone down while its sources copy
    #[arg(long = "automarkdown")]
    markdown: bool,
}

#[derive(Subcommand)]
enum RedistCommand {
    /// Prepare, move every zone and commit
    Auto(AutoArgs),

    /// Prepare and move every zone without committing
    Autonocommit(AutoArgs),

    /// Abandon the redistribution
    Abort,

    /// Record the candidate topology
    Prepare {
        #[arg(long)]
        zone: Option<u32>,
    },

    /// Let the source nodes of a zone copy shards out
    StartSrc {
        #[arg(long)]
        zone: u32,

        #[arg(long = "ratelimit", default_value = "0")]
        rate_limit: u32,

        #[arg(long = "automarkdown")]
        markdown: bool,
    },

    /// Let the target nodes of a zone accept shards
    StartTgt {
        #[arg(long)]
        zone: u32,
    },

    /// Stop the redistribution of a zone
    Stop {
        #[arg(long)]
        zone: u32,
    },

    /// Publish the candidate as the next version
    Commit {
        #[arg(long)]
        zone: Option<u32>,

        /// Wait for every zone to finish first
        #[arg(long)]
        wait: bool,

        #[arg(long, default_value = "0")]
        max_failures: u32,

        #[arg(long = "automarkdown")]
        markdown: bool,
    },

    /// Continue an interrupted copy
    Resume {
        #[arg(long)]
        zone: u32,

        #[arg(long = "ratelimit", default_value = "0")]
        rate_limit: u32,
    },

    /// Show the committed version and redistribution progress
    Status,
}

#[derive(Subcommand)]
enum MarkdownCommand {
    Set { zone: u32 },
    Delete,
    Get,
}

/// Bare numbers are seconds.
fn parse_wait(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

fn load_cluster_config(path: &Path) -> anyhow::Result<ClusterConfig> {
    let config = Config::load(path).with_context(|| format!("loading {}", path.display()))?;
    Ok(config.cluster)
}

fn new_cluster_config(cli: &Cli) -> anyhow::Result<ClusterConfig> {
    let path = cli
        .new_config
        .as_deref()
        .context("--new-config is required for this command")?;
    load_cluster_config(path)
}

impl AutoArgs {
    fn wait_options(&self, redist: &Redistributor) -> WaitOptions {
        let defaults = redist.wait_options();
        WaitOptions {
            max_failures: self.max_failures.unwrap_or(defaults.max_failures),
            min_wait: self.min_wait.unwrap_or(defaults.min_wait),
            max_wait: self.max_wait.unwrap_or(defaults.max_wait),
            rate_limit: self.rate_limit.unwrap_or(defaults.rate_limit),
            markdown: self.markdown,
            ..defaults
        }
    }
}

async fn run(cli: Cli, config: anyhow::Result<Config>) -> anyhow::Result<()> {
    let config = config?;
    let kv = open_backend(&config.store)?;
    let cache = ClusterCache::new(&config.store.cache_dir, &config.store.cache_name);

    let mut redist_cfg = config.redist.clone();
    if redist_cfg.state_dump_path.is_none() {
        redist_cfg.state_dump_path = Some(PathBuf::from(DEFAULT_STATE_DUMP));
    }
    let mut redist =
        Redistributor::new(kv, config.cluster_name.clone(), redist_cfg).with_cache(cache.clone());
    if cli.dryrun {
        redist = redist.with_dry_run(Box::new(std::io::stdout()));
    }

    match &cli.command {
        Commands::Store => {
            redist.store(config.cluster.clone()).await?;
        }
        Commands::Load => {
            let (_, version, _) = redist.load(std::io::stdout()).await?;
            tracing::info!("loaded topology version {}", version);
        }
        Commands::Swaphost => {
            let report = redist.swap_host(new_cluster_config(&cli)?).await?;
            println!("version={}", report.version);
        }
        Commands::Restore => {
            let version = redist.restore(&cache).await?;
            println!("version={}", version);
        }
        Commands::Zonemarkdown { command } => {
            let op = match command {
                MarkdownCommand::Set { zone } => MarkdownOp::Set(*zone),
                MarkdownCommand::Delete => MarkdownOp::Delete,
                MarkdownCommand::Get => MarkdownOp::Get,
            };
            match redist.zone_markdown(op).await? {
                Some(zone) => println!("zonemarkdown={}", zone),
                None => println!("zonemarkdown=none"),
            }
        }
        Commands::Redist { command } => run_redist(&cli, &config, &redist, command).await?,
    }
    Ok(())
}

async fn run_redist(
    cli: &Cli,
    config: &Config,
    redist: &Redistributor,
    command: &RedistCommand,
) -> anyhow::Result<()> {
    match command {
        RedistCommand::Auto(args) | RedistCommand::Autonocommit(args) => {
            let commit = matches!(command, RedistCommand::Auto(_));
            let opts = args.wait_options(redist);
            let report = redist
                .auto(
                    new_cluster_config(cli)?,
                    args.zone,
                    args.skip_zone,
                    &opts,
                    commit,
                )
                .await?;
            if let Some(report) = report {
                println!(
                    "version={} skipped_zones={:?}",
                    report.version, report.skipped_zones
                );
            }
        }
        RedistCommand::Abort => {
            let cluster = match &cli.new_config {
                Some(path) => load_cluster_config(path)?,
                None => config.cluster.clone(),
            };
            redist.abort(&cluster).await?;
        }
        RedistCommand::Prepare { zone } => {
            redist.prepare(new_cluster_config(cli)?, *zone, false).await?;
        }
        RedistCommand::StartSrc {
            zone,
            rate_limit,
            markdown,
        } => redist.start(*zone, true, true, *rate_limit, *markdown).await?,
        RedistCommand::StartTgt { zone } => redist.start(*zone, false, true, 0, false).await?,
        RedistCommand::Stop { zone } => redist.start(*zone, false, false, 0, false).await?,
        RedistCommand::Commit {
            zone,
            wait,
            max_failures,
            markdown,
        } => {
            let report = redist
                .commit(new_cluster_config(cli)?, *zone, *wait, *max_failures, *markdown)
                .await?;
            println!(
                "version={} skipped_zones={:?}",
                report.version, report.skipped_zones
            );
        }
        RedistCommand::Resume { zone, rate_limit } => redist.resume(*zone, *rate_limit).await?,
        RedistCommand::Status => print!("{}", redist.status().await?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config =
        Config::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()));
    let level = config
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(cli, config).await {
        tracing::error!("{:#}", e);
        // Input the operator has to fix exits 2, anything else 1
        let code = match e.downcast_ref::<shardmesh::Error>() {
            Some(err) if err.is_operator_error() => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
    Ok(())
}
