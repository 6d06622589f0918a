use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use memcache_tags::observability::init_logging;
use memcache_tags::{
    CacheBackendFactory, ClusterRouter, Expire, Settings, SharedClock, SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "mcache",
    version,
    about = "Inspect and maintain a tagged memcached cache"
)]
struct Cli {
    /// Path to configuration file (TOML format)
    #[arg(short, long, env = "MCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Bin to operate on (default: the configured default bin)
    #[arg(short, long, global = true)]
    bin: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print an entry
    Get {
        cid: String,
        /// Also print expired and tag-invalidated entries
        #[arg(long)]
        allow_invalid: bool,
    },
    /// Store a string entry
    Set {
        cid: String,
        data: String,
        /// Lifetime in seconds (default: permanent)
        #[arg(long)]
        expire: Option<i64>,
        /// Tags to attach, comma separated
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },
    /// Delete entries
    Delete {
        #[arg(required = true)]
        cids: Vec<String>,
    },
    /// Invalidate every entry carrying any of the tags
    InvalidateTags {
        #[arg(required = true)]
        tags: Vec<String>,
    },
    /// Flush the bin
    RemoveBin,
    /// Print server statistics of the bin's cluster
    Stats {
        /// Add a row with counters summed over all servers
        #[arg(long)]
        aggregate: bool,
    },
    /// Delete expired pieces of oversized items
    Sweep,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("failed to load config file '{}'", path.display()))?,
        None => Settings::default(),
    };
    init_logging(&settings.logging);

    let clock: SharedClock = Arc::new(SystemClock);
    let bin = cli
        .bin
        .clone()
        .unwrap_or_else(|| settings.cache.default_bin.clone());
    let router = Arc::new(ClusterRouter::new(settings.cache, clock.clone()));
    let factory = CacheBackendFactory::new(router.clone()).context("invalidation bin")?;
    let cache = factory
        .get(&bin)
        .with_context(|| format!("bin '{}'", bin))?;

    match cli.cmd {
        Command::Get { cid, allow_invalid } => match cache.get::<String>(&cid, allow_invalid) {
            Some(entry) => {
                println!("{}", entry.data);
                info!(
                    cid = %entry.cid,
                    created = entry.created,
                    valid = entry.valid,
                    tags = ?entry.tags,
                    "entry"
                );
            }
            None => bail!("'{}' not found in bin '{}'", cid, bin),
        },
        Command::Set {
            cid,
            data,
            expire,
            tags,
        } => {
            let expire = match expire {
                Some(secs) => Expire::At(clock.now_secs() + secs),
                None => Expire::Permanent,
            };
            if !cache.set(&cid, data.as_str(), expire, tags.as_slice()) {
                bail!("failed to store '{}'", cid);
            }
        }
        Command::Delete { cids } => {
            if !cache.delete_multiple(cids.as_slice()) {
                bail!("not every entry could be deleted");
            }
        }
        Command::InvalidateTags { tags } => cache.invalidate_tags(tags.as_slice()),
        Command::RemoveBin => {
            if !cache.remove_bin() {
                bail!("failed to flush bin '{}'", bin);
            }
        }
        Command::Stats { aggregate } => {
            for (server, row) in cache.driver().stats(aggregate) {
                println!("[{}]", server);
                for (name, value) in row {
                    println!("{} = {}", name, value);
                }
                println!();
            }
        }
        Command::Sweep => {
            let swept = cache.driver().sweep_fragments();
            println!("swept {} oversized items", swept);
        }
    }

    if let Some(stats) = router.stats() {
        stats.report();
    }
    Ok(())
}
