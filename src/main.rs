//! CLI entry point for the sharded vector store.
//!
//! Loads layered settings, opens (or creates) the store at the configured
//! data path, runs one command, and saves the store after any mutation.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use serde::Serialize;
use shardvec::display::{self, THEME};
use shardvec::ingest::StreamIngestor;
use shardvec::store::{RouterMemoryReport, SearchOutcome};
use shardvec::vector::CacheStats;
use shardvec::{
    Embedder, EmbeddingCache, EntryId, FanoutOptions, QuantizationWidth, Settings,
    ShardRouter, SimilarityMetric, StoreError, VectorDimension,
};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Sharded vector embedding store
#[derive(Parser)]
#[command(
    name = "shardvec",
    version = env!("CARGO_PKG_VERSION"),
    about = "Sharded vector embedding store",
    long_about = "Embed text records, store them across hash-routed shards, and search them by similarity.",
    next_line_help = true,
    styles = clap_cargo_style(),
    after_help = display::create_help_text()
)]
struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
enum Commands {
    #[command(about = "Set up .shardvec directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    #[command(about = "Display active settings")]
    Config,

    #[command(about = "Add one record to the store")]
    Add {
        text: String,

        /// Opaque tag stored with the record
        #[arg(short, long, default_value = "")]
        metadata: String,
    },

    #[command(about = "Stream newline-delimited records from a file or stdin")]
    Ingest {
        /// Input file; reads stdin when omitted
        file: Option<PathBuf>,

        /// Records per batch (overrides ingest.batch_size)
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Show a progress counter
        #[arg(long)]
        progress: bool,
    },

    #[command(about = "Search every shard and merge the results")]
    Search {
        query: String,

        /// Number of results (overrides search.k)
        #[arg(short)]
        k: Option<usize>,

        /// cosine, dot_product, euclidean or manhattan (overrides store.metric)
        #[arg(short, long)]
        metric: Option<SimilarityMetric>,

        /// Stop waiting for shards after this many milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,

        /// Merge results from healthy shards when others fail
        #[arg(long)]
        allow_partial: bool,
    },

    #[command(about = "Tombstone an entry so it is no longer returned")]
    Delete { shard: usize, id: u32 },

    #[command(about = "Replace stored vectors with quantized forms")]
    Quantize {
        /// Bits per component: 8 or 4
        #[arg(long, value_parser = parse_width)]
        bits: QuantizationWidth,
    },

    #[command(about = "Show memory usage and cache statistics")]
    Stats,
}

fn parse_width(raw: &str) -> Result<QuantizationWidth, String> {
    let bits: u8 = raw.parse().map_err(|e| format!("{e}"))?;
    QuantizationWidth::try_from(bits).map_err(|e| e.to_string())
}

#[derive(Serialize)]
struct StatsOutput<'a> {
    memory: &'a RouterMemoryReport,
    cache: CacheStats,
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();

    let settings = if let Some(config_path) = &cli.config {
        Settings::load_from(config_path).unwrap_or_else(|e| {
            eprintln!(
                "Configuration error loading from {}: {}",
                config_path.display(),
                e
            );
            std::process::exit(1);
        })
    } else {
        Settings::load().unwrap_or_else(|e| {
            eprintln!("Configuration error: {e}");
            Settings::default()
        })
    };

    init_tracing(settings.debug);

    match &cli.command {
        Commands::Init { force } => {
            match Settings::init_config_file(*force) {
                Ok(path) => {
                    println!(
                        "{}",
                        THEME.success_with_icon(&format!(
                            "Created configuration file at: {}",
                            path.display()
                        ))
                    );
                    println!("Edit this file to customize your settings.");
                }
                Err(e) => {
                    eprintln!("{}", THEME.error_with_icon(&e.to_string()));
                    std::process::exit(1);
                }
            }
            return;
        }

        Commands::Config => {
            match toml::to_string_pretty(&settings) {
                Ok(toml_str) => println!("{toml_str}"),
                Err(e) => {
                    eprintln!("Error displaying config: {e}");
                    std::process::exit(1);
                }
            }
            return;
        }

        _ => {}
    }

    if let Err(e) = run(&cli, settings) {
        report_error(&e);
        std::process::exit(1);
    }
}

fn report_error(e: &StoreError) {
    eprintln!("{}", THEME.error_with_icon(&e.to_string()));
    eprintln!("  code: {}", e.status_code());
    for suggestion in e.recovery_suggestions() {
        eprintln!("  - {suggestion}");
    }
}

fn run(cli: &Cli, mut settings: Settings) -> Result<(), StoreError> {
    if let Commands::Ingest {
        batch_size: Some(n),
        ..
    } = &cli.command
    {
        settings.ingest.batch_size = *n;
    }
    settings.validate()?;

    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(settings.ingest.parallel_threads)
        .build_global()
    {
        warn!("could not size the worker pool: {e}");
    }

    let dimension = VectorDimension::new(settings.store.dimension)?;
    let embedder = display::with_spinner("Loading embedding backend...", || {
        Embedder::from_backend(
            settings.embedding.backend,
            &settings.embedding.model,
            settings.embedding.cache_dir.clone(),
            dimension,
        )
    })?;
    let cache = Arc::new(EmbeddingCache::new(embedder, settings.cache.capacity));
    let router = ShardRouter::open_or_create(&settings, cache)?;
    let data_path = settings.resolved_data_path();

    match &cli.command {
        Commands::Add { text, metadata } => {
            let (shard, id) = router.add_text(text, metadata)?;
            router.save(&data_path)?;
            if cli.json {
                print_json(&serde_json::json!({ "shard": shard, "id": id }));
            } else {
                println!(
                    "{}",
                    THEME.success_with_icon(&format!("Added entry {id} to shard {shard}"))
                );
            }
        }

        Commands::Ingest { file, progress, .. } => {
            let ingestor = StreamIngestor::new(settings.ingest.batch_size)?
                .with_metadata_delimiter(settings.ingest.metadata_delimiter.clone());
            let counter = progress.then(|| display::create_counter("ingested"));

            let on_batch = |stats: &shardvec::IngestStats| {
                if let Some(pb) = &counter {
                    pb.set_position(stats.records_ingested as u64);
                }
            };

            let result = match file {
                Some(path) => {
                    let reader = File::open(path).map_err(|source| StoreError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    ingestor.ingest(BufReader::new(reader), &router, on_batch)
                }
                None => ingestor.ingest(io::stdin().lock(), &router, on_batch),
            };
            if let Some(pb) = &counter {
                pb.finish_and_clear();
            }

            // Batches committed before a failure are kept
            router.save(&data_path)?;
            let stats = result?;

            if cli.json {
                print_json(&stats);
            } else {
                stats.display();
            }
        }

        Commands::Search {
            query,
            k,
            metric,
            deadline_ms,
            allow_partial,
        } => {
            let options = FanoutOptions {
                deadline: deadline_ms
                    .map(std::time::Duration::from_millis)
                    .or(router.options().deadline),
                allow_partial: *allow_partial || router.options().allow_partial,
            };
            let k = k.unwrap_or(settings.search.k);
            let metric = metric.unwrap_or(settings.store.metric);

            let outcome = router.search_with(query, k, metric, options)?;
            print_outcome(&outcome, cli.json);
        }

        Commands::Delete { shard, id } => {
            router.mark_deleted(*shard, EntryId::new(*id))?;
            router.save(&data_path)?;
            println!(
                "{}",
                THEME.success_with_icon(&format!("Deleted entry {id} from shard {shard}"))
            );
        }

        Commands::Quantize { bits } => {
            let reports =
                display::with_spinner(&format!("Quantizing to {bits}..."), || router.quantize(*bits))?;
            router.save(&data_path)?;

            if cli.json {
                print_json(&reports);
            } else {
                println!("{}", display::create_quantization_table(&reports));
            }
        }

        Commands::Stats => {
            let memory = router.report_memory_usage();
            let cache = router.cache().stats();

            if cli.json {
                print_json(&StatsOutput {
                    memory: &memory,
                    cache,
                });
            } else {
                println!("{}", display::create_memory_table(&memory));
                println!("{}", display::create_cache_table(&cache));
            }
        }

        Commands::Init { .. } | Commands::Config => {}
    }

    info!(command = command_name(&cli.command), "done");
    Ok(())
}

fn print_outcome(outcome: &SearchOutcome, json: bool) {
    if json {
        print_json(outcome);
        return;
    }

    if outcome.is_partial() {
        let failed: Vec<String> = outcome.failures.iter().map(ToString::to_string).collect();
        eprintln!(
            "{}",
            THEME.warning_with_icon(&format!("Partial results: {}", failed.join("; ")))
        );
    }

    if outcome.hits.is_empty() {
        println!("No results found.");
    } else {
        println!("{}", display::create_hits_table(&outcome.hits));
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Error serializing output: {e}"),
    }
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Init { .. } => "init",
        Commands::Config => "config",
        Commands::Add { .. } => "add",
        Commands::Ingest { .. } => "ingest",
        Commands::Search { .. } => "search",
        Commands::Delete { .. } => "delete",
        Commands::Quantize { .. } => "quantize",
        Commands::Stats => "stats",
    }
}
