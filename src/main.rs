//! layercache CLI
//!
//! Operational tool for layered cache deployments.
//!
//! # Commands
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          layercache                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  check    validate a layered cache config file                  │
//! │  inspect  print the index of a disk tier directory              │
//! │  warm     load a JSON object through the configured layers      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use layercache::cache::{read_index, Cache, DiskConfig, LayeredCache};
use layercache::config::{parse_duration, LayeredCacheConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// layercache - Layered caching engine tooling
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate a config file
    Check {
        /// Path to the YAML config
        #[arg(long, env = "LAYERCACHE_CONFIG")]
        config: PathBuf,
    },

    /// Print the persisted index of a disk tier without modifying it
    Inspect {
        /// Disk tier base directory
        #[arg(long)]
        dir: PathBuf,

        /// Subdirectory prefix used by the tier
        #[arg(long, default_value = "cache")]
        prefix: String,
    },

    /// Load a JSON object of key -> value through the configured layers
    Warm {
        /// Path to the YAML config
        #[arg(long, env = "LAYERCACHE_CONFIG")]
        config: PathBuf,

        /// JSON file holding the entries
        #[arg(long)]
        data: PathBuf,

        /// TTL for warmed entries ("0s" = each tier's default)
        #[arg(long, default_value = "0s")]
        ttl: String,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    match args.command {
        Command::Check { config } => check(config).await,
        Command::Inspect { dir, prefix } => inspect(dir, prefix).await,
        Command::Warm { config, data, ttl } => warm(config, data, &ttl).await,
    }
}

async fn check(path: PathBuf) -> anyhow::Result<()> {
    let config = LayeredCacheConfig::load(&path)
        .await
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate()?;

    println!("{}: ok", path.display());
    for (index, layer) in config.layers.iter().enumerate() {
        println!(
            "  [{}] {:<6} maxSize={} ttl={} enabled={}",
            index, layer.kind.as_str(), layer.max_size, layer.ttl, layer.enabled
        );
    }
    println!(
        "  promote={} writeThrough={} writeBack={}",
        config.promote_enabled, config.write_through, config.write_back
    );
    Ok(())
}

async fn inspect(dir: PathBuf, prefix: String) -> anyhow::Result<()> {
    let config = DiskConfig {
        file_prefix: prefix,
        ..DiskConfig::new(dir)
    };
    // Listing only; opening the tier would purge, trim and rewrite metadata
    let mut entries = read_index(&config)
        .await
        .with_context(|| format!("reading index of {}", config.dir().display()))?;

    let now = Utc::now();
    let expired = entries.iter().filter(|e| e.expire_time < now).count();
    println!("{}", config.dir().display());
    println!("  entries={} expired={}", entries.len(), expired);

    entries.sort_by(|a, b| b.access_time.cmp(&a.access_time));
    for entry in &entries {
        println!(
            "  {:<32} hits={:<6} size={:<8} expires={}{}",
            entry.key,
            entry.hit_count,
            entry.size,
            entry.expire_time.to_rfc3339(),
            if entry.expire_time < now { " (expired)" } else { "" }
        );
    }
    Ok(())
}

async fn warm(config_path: PathBuf, data_path: PathBuf, ttl: &str) -> anyhow::Result<()> {
    let config = LayeredCacheConfig::load(&config_path)
        .await
        .with_context(|| format!("loading {}", config_path.display()))?;
    let ttl = parse_duration(ttl)?;

    let raw = tokio::fs::read(&data_path)
        .await
        .with_context(|| format!("reading {}", data_path.display()))?;
    let data: HashMap<String, serde_json::Value> =
        serde_json::from_slice(&raw).context("data file must be a JSON object")?;

    let cache = LayeredCache::<serde_json::Value>::from_config(&config, None).await?;
    let written = cache.warm(data, ttl).await?;
    cache.flush().await?;

    let stats = cache.layer_stats();
    println!("warmed {} entries", written);
    for layer in &stats.layers {
        println!(
            "  {:<8} enabled={:<5} {}",
            layer.name, layer.enabled, layer.stats
        );
    }

    cache.close().await?;
    info!("warm complete");
    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
