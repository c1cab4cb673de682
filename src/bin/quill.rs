#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use quill_harness::analytics::Analytics;
use quill_harness::cache::{GenerationCache, NullGenerationCache, SqliteGenerationCache};
use quill_harness::events::JsonlEventSink;
use quill_harness::gateway::{NoopUsageSink, ProviderSet, StderrUsageSink, UsageSink};
use quill_harness::pipeline::{
    run_batch, EvaluatorKind, GenerationRequest, Pipeline, PipelineConfig,
};
use quill_harness::store::{RecordStore, SqliteRecordStore};

#[derive(Parser)]
#[command(name = "quill", version, about = "Quality-gated outline/draft/edit/critique pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliEvaluator {
    Heuristic,
    Llm,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one generation request
    Generate {
        /// Path to a GenerationRequest JSON
        #[arg(long)]
        request: PathBuf,
        /// Path to a PipelineConfig JSON (defaults apply otherwise)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write the FinalResult JSON here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
        /// Write every progress event as JSONL
        #[arg(long)]
        events: Option<PathBuf>,
        #[arg(long, conflicts_with = "no_cache")]
        cache: Option<PathBuf>,
        #[arg(long)]
        no_cache: bool,
        /// Persist a generation record to this SQLite file
        #[arg(long)]
        store: Option<PathBuf>,
        /// Override the configured evaluator
        #[arg(long, value_enum)]
        evaluator: Option<CliEvaluator>,
        /// Log every provider call to stderr as JSON
        #[arg(long)]
        log_usage: bool,
        /// Write per-stage analytics and cache performance as JSON
        #[arg(long)]
        analytics: Option<PathBuf>,
    },
    /// Run many requests concurrently
    Batch {
        /// JSON array of GenerationRequest
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 2)]
        parallel: usize,
        #[arg(long)]
        cache: Option<PathBuf>,
        #[arg(long)]
        store: Option<PathBuf>,
        /// Write per-stage analytics across the batch as JSON
        #[arg(long)]
        analytics: Option<PathBuf>,
    },
    /// Export the SQLite generation cache to JSONL
    CacheExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune the SQLite generation cache
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        /// Delete rows whose TTL has passed
        #[arg(long)]
        expired: bool,
        #[arg(long)]
        max_rows: Option<usize>,
    },
    /// Print a stored generation record as JSON
    Record {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            request,
            config,
            out,
            events,
            cache,
            no_cache,
            store,
            evaluator,
            log_usage,
            analytics,
        } => {
            let req: GenerationRequest = read_json(&request)?;
            let mut config = load_config(config.as_deref())?;
            if let Some(kind) = evaluator {
                config.evaluator = match kind {
                    CliEvaluator::Heuristic => EvaluatorKind::Heuristic,
                    CliEvaluator::Llm => EvaluatorKind::Llm,
                };
            }
            let cache: Arc<dyn GenerationCache> = if no_cache {
                Arc::new(NullGenerationCache)
            } else {
                let path = cache.unwrap_or_else(SqliteGenerationCache::default_path);
                Arc::new(SqliteGenerationCache::new(path)?.with_ttl(config.cache_ttl()))
            };
            let usage: Arc<dyn UsageSink> = if log_usage {
                Arc::new(StderrUsageSink)
            } else {
                Arc::new(NoopUsageSink)
            };

            let providers = ProviderSet::from_env()?;
            let mut pipeline = Pipeline::from_providers(config, &providers, cache, usage)?;
            if let Some(path) = store {
                pipeline = pipeline.with_store(Arc::new(SqliteRecordStore::new(path)?));
            }
            let observed = analytics.map(|path| (path, Analytics::new()));
            if let Some((_, analytics)) = &observed {
                pipeline = pipeline.with_analytics(analytics.clone());
            }

            let run = pipeline.prepare(req)?;
            let writer = match events {
                Some(path) => {
                    let (sink, writer) = JsonlEventSink::new(path)?;
                    Some((sink.attach(run.events()), writer))
                }
                None => None,
            };

            let stopper = run.stopper();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, stopping run");
                    stopper.stop();
                }
            });

            let result = run.execute().await;
            if let Some((subscription, writer)) = writer {
                // The bus is closed; the handler task drains and drops the sink.
                subscription.finished().await;
                let lines = writer.join()?;
                tracing::debug!(lines, "event log written");
            }
            if let Some((path, analytics)) = &observed {
                write_json(path, &analytics.report())?;
            }

            let result = result?;
            match out {
                Some(path) => write_json(&path, &result)?,
                None => println!("{}", serde_json::to_string_pretty(&result)?),
            }
        }
        Commands::Batch {
            manifest,
            out_dir,
            config,
            parallel,
            cache,
            store,
            analytics,
        } => {
            let requests: Vec<GenerationRequest> = read_json(&manifest)?;
            let config = load_config(config.as_deref())?;
            let cache_path = cache.unwrap_or_else(SqliteGenerationCache::default_path);
            let cache = Arc::new(SqliteGenerationCache::new(cache_path)?.with_ttl(config.cache_ttl()));
            let providers = ProviderSet::from_env()?;
            let mut pipeline =
                Pipeline::from_providers(config, &providers, cache, Arc::new(NoopUsageSink))?;
            if let Some(path) = store {
                pipeline = pipeline.with_store(Arc::new(SqliteRecordStore::new(path)?));
            }

            let observed = analytics.map(|path| (path, Analytics::new()));
            if let Some((_, analytics)) = &observed {
                pipeline = pipeline.with_analytics(analytics.clone());
            }

            std::fs::create_dir_all(&out_dir)?;
            let results = run_batch(&pipeline, requests, parallel).await;
            let mut failed = 0;
            for (idx, result) in results.iter().enumerate() {
                match result {
                    Ok(done) => write_json(&out_dir.join(format!("result_{idx:03}.json")), done)?,
                    Err(err) => {
                        failed += 1;
                        let body = serde_json::json!({
                            "error": err.to_string(),
                            "kind": err.kind(),
                            "stage": err.stage(),
                        });
                        write_json(&out_dir.join(format!("error_{idx:03}.json")), &body)?;
                    }
                }
            }
            if let Some((path, analytics)) = &observed {
                write_json(path, &analytics.report())?;
            }
            println!("{} succeeded, {} failed", results.len() - failed, failed);
        }
        Commands::CacheExport { db, out } => {
            let path = db.unwrap_or_else(SqliteGenerationCache::default_path);
            let cache = SqliteGenerationCache::new(path)?;
            let written = cache.export_jsonl(out).await?;
            println!("exported {written} rows");
        }
        Commands::CachePrune {
            db,
            expired,
            max_rows,
        } => {
            if !expired && max_rows.is_none() {
                return Err("cache-prune requires --expired and/or --max-rows".into());
            }
            let path = db.unwrap_or_else(SqliteGenerationCache::default_path);
            let cache = SqliteGenerationCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(expired, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
        Commands::Record { id, store } => {
            let path = store.unwrap_or_else(SqliteRecordStore::default_path);
            let store = SqliteRecordStore::new(path)?;
            let record = store.read(id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(PipelineConfig::from_path(path)?),
        None => Ok(PipelineConfig::default()),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), std::io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    std::fs::write(path, json)
}
