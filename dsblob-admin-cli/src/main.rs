//! DSBlob Administration CLI

mod report;
mod verify_mod;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use dsblob_core::{
    BlobHash, CancellationToken, Engine, EngineConfig, GcOptions, MemoryReferenceOracle,
    RemoteConfig, StorageMode,
};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dsblob-admin")]
#[command(author = "DSBlob Contributors")]
#[command(version = "0.1.0")]
#[command(about = "DSBlob blob store administration tool")]
struct Cli {
    /// Engine configuration file
    #[arg(short, long, global = true, default_value = "dsblob.json")]
    config: PathBuf,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    InitConfig {
        /// Directory for hot-tier blobs and the index
        #[arg(long)]
        path: PathBuf,
        /// Use a local directory as the cold tier (hybrid mode)
        #[arg(long)]
        cold_path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show storage statistics
    Stats,

    /// Store a file ("-" for stdin) and print its hash
    Put { file: String },

    /// Write a blob to a file or stdout
    Get {
        hash: BlobHash,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run garbage collection
    Gc {
        /// Run even if the hot tier is below the high-water mark
        #[arg(long)]
        force: bool,
        /// Report orphans without trashing them
        #[arg(long)]
        dry_run: bool,
        /// Override the minimum orphan age
        #[arg(long)]
        min_age_secs: Option<u64>,
        /// Permanently delete the trash afterwards
        #[arg(long)]
        purge: bool,
    },

    /// Permanently delete every trashed blob
    EmptyTrash {
        /// Required: emptying the trash cannot be undone
        #[arg(long)]
        permanent: bool,
    },

    /// Inspect the trash
    Trash {
        #[command(subcommand)]
        command: TrashCommands,
    },

    /// Restore a trashed blob
    Restore { hash: BlobHash },

    /// Move a blob to the cold tier
    CoolDown { hash: BlobHash },

    /// Move a blob back to the hot tier
    WarmUp { hash: BlobHash },

    /// Apply the tiering policy
    Tier {
        /// Print the plan without moving anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Verify every blob of a dataset version
    Verify {
        version: String,
        /// Only print the summary
        #[arg(short, long)]
        quiet: bool,
    },

    /// Reconcile the index with the stores
    Reindex,
}

#[derive(Subcommand, Debug)]
enum TrashCommands {
    /// List trashed blobs
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current item");
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::InitConfig {
            path,
            cold_path,
            force,
        } => {
            if cli.config.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    cli.config.display()
                );
            }
            let config = match cold_path {
                Some(cold) => EngineConfig::hybrid(path, RemoteConfig::Local { path: cold }),
                None => EngineConfig::local(path),
            };
            config.validate()?;
            config
                .save(&cli.config)
                .with_context(|| format!("writing {}", cli.config.display()))?;
            println!("Wrote {} ({} mode)", cli.config.display(), config.mode.as_str());
        }

        Commands::Stats => {
            let engine = open_engine(&cli.config, false).await?;
            let stats = engine.stats()?;
            if cli.json {
                report::print_json(&stats)?;
            } else {
                report::print_stats(&stats);
            }
        }

        Commands::Put { file } => {
            let data = if file == "-" {
                let mut buf = Vec::new();
                std::io::stdin().read_to_end(&mut buf)?;
                buf
            } else {
                std::fs::read(&file).with_context(|| format!("reading {}", file))?
            };
            let engine = open_engine(&cli.config, false).await?;
            let size = data.len();
            let hash = engine.manager().put(Bytes::from(data)).await?;
            info!(hash = %hash, size, "Stored blob");
            if cli.json {
                report::print_json(&serde_json::json!({ "hash": hash, "size": size }))?;
            } else {
                println!("{}", hash);
            }
        }

        Commands::Get { hash, output } => {
            let engine = open_engine(&cli.config, false).await?;
            let data = engine.manager().get(&hash).await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &data)
                        .with_context(|| format!("writing {}", path.display()))?;
                    eprintln!("Wrote {} bytes to {}", data.len(), path.display());
                }
                None => std::io::stdout().write_all(&data)?,
            }
        }

        Commands::Gc {
            force,
            dry_run,
            min_age_secs,
            purge,
        } => {
            let engine = open_engine(&cli.config, true).await?;
            let options = GcOptions {
                dry_run,
                min_orphan_age: min_age_secs.map(Duration::from_secs),
                purge_trash: purge,
                require_pressure: !force,
            };
            let record = engine.gc().run_with_options(options, &cancel).await?;
            if cli.json {
                report::print_json(&record)?;
            } else {
                report::print_gc(&record);
            }
        }

        Commands::EmptyTrash { permanent } => {
            if !permanent {
                bail!("emptying the trash is irreversible; pass --permanent to confirm");
            }
            let engine = open_engine(&cli.config, false).await?;
            let record = engine.gc().empty_trash(true, &cancel).await?;
            if cli.json {
                report::print_json(&record)?;
            } else {
                println!(
                    "Permanently deleted {} blobs ({} bytes freed)",
                    record.permanently_deleted, record.bytes_freed
                );
            }
        }

        Commands::Trash {
            command: TrashCommands::List,
        } => {
            let engine = open_engine(&cli.config, false).await?;
            let entries = engine.manager().list_trash()?;
            if cli.json {
                report::print_json(&entries)?;
            } else {
                report::print_trash(&entries);
            }
        }

        Commands::Restore { hash } => {
            let engine = open_engine(&cli.config, false).await?;
            engine.manager().restore_from_trash(&hash).await?;
            println!("Restored {}", hash);
        }

        Commands::CoolDown { hash } => {
            let engine = open_engine(&cli.config, false).await?;
            engine.manager().cool_down(&hash).await?;
            println!("Cooled down {}", hash);
        }

        Commands::WarmUp { hash } => {
            let engine = open_engine(&cli.config, false).await?;
            engine.manager().warm_up(&hash).await?;
            println!("Warmed up {}", hash);
        }

        Commands::Tier { dry_run } => {
            let engine = open_engine(&cli.config, false).await?;
            if engine.mode() != StorageMode::Hybrid {
                bail!("tiering requires hybrid mode");
            }
            if dry_run {
                let records = engine.manager().records()?;
                let plan = engine.tiering().plan(&records, chrono::Utc::now());
                if cli.json {
                    report::print_json(&plan)?;
                } else {
                    report::print_plan(&plan);
                }
            } else {
                let result = engine.manager().apply_tiering_policy(&cancel).await?;
                if cli.json {
                    report::print_json(&result)?;
                } else {
                    println!(
                        "Tiering: {} planned, {} cooled, {} warmed, {} skipped{}",
                        result.planned,
                        result.cooled,
                        result.warmed,
                        result.skipped,
                        if result.cancelled { " (cancelled)" } else { "" }
                    );
                }
            }
        }

        Commands::Verify { version, quiet } => {
            let engine = open_engine(&cli.config, true).await?;
            verify_mod::verify_version(&engine, &version, quiet, cli.json, &cancel).await?;
        }

        Commands::Reindex => {
            let engine = open_engine(&cli.config, false).await?;
            let result = engine.manager().rebuild_index().await?;
            if cli.json {
                report::print_json(&result)?;
            } else {
                println!(
                    "Reindex: {} registered, {} dropped, {} trash registered, {} trash dropped",
                    result.registered, result.dropped, result.trash_registered, result.trash_dropped
                );
                println!("Stored:  {} bytes", result.stored_bytes);
            }
        }
    }

    Ok(())
}

/// Open the engine from `config_path`
///
/// Commands that consult references need the configured oracle; the rest
/// run against an empty in-memory one they never query.
async fn open_engine(config_path: &Path, needs_oracle: bool) -> Result<Engine> {
    let config = EngineConfig::load(config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    let engine = if needs_oracle {
        if config.oracle.is_none() {
            bail!(
                "{} has no \"oracle\" section; this command needs the reference database",
                config_path.display()
            );
        }
        Engine::open_with_configured_oracle(config).await?
    } else {
        Engine::open(config, Arc::new(MemoryReferenceOracle::new())).await?
    };
    Ok(engine)
}
