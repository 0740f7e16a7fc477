//! kbforge CLI - Command-line interface
//!
//! Usage:
//!   kbforge extract --input chunks.jsonl --entities entities.json --output-dir out
//!   kbforge merge-entities --input-dir out --output entities_kb.json
//!   kbforge merge-triples --input-dir out --output triples_kb.json
//!   kbforge enrich --entities entities_kb.json --triples triples_kb.json --output enriched.json
//!   kbforge stats --entities entities_kb.json
//!   kbforge match --entities entities_kb.json --text "..."
//!   kbforge count --input chunks.jsonl

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use kbforge_core::{AppConfig, LoggingConfig, PromptKind};
use kbforge_extractor::{
    count_chunks, enrich_files, load_entity_dictionary, merge_entity_dir, merge_triple_dir,
    CheckpointManager, ExtractError, ExtractionRequest, MergeReport, MultiPatternMatcher,
    RangeExtractionController, RecordKind, RunSummary,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kbforge")]
#[command(about = "Build a knowledge base of entities and triples from chunked text")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract triples (and entities) from a range of chunks
    Extract {
        /// Newline-delimited chunk stream
        #[arg(long)]
        input: PathBuf,
        /// Entity dictionary used for matching
        #[arg(long)]
        entities: PathBuf,
        /// Directory for checkpoints and run outputs
        #[arg(long)]
        output_dir: PathBuf,
        /// First chunk index, inclusive
        #[arg(long, default_value_t = 0)]
        start: u64,
        /// Last chunk index, exclusive
        #[arg(long)]
        end: Option<u64>,
        /// Range length when --end is not given
        #[arg(long)]
        batch_size: Option<u64>,
        /// Prompt mode: joint or relations
        #[arg(long)]
        prompt: Option<PromptKind>,
        /// Continue after the latest checkpoint of this run
        #[arg(long)]
        resume: bool,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Merge all entities_*.json files of a directory
    MergeEntities {
        #[arg(long)]
        input_dir: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Concatenate all triples_*.json files of a directory
    MergeTriples {
        #[arg(long)]
        input_dir: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Record where triples reference entities, adding placeholders
    Enrich {
        #[arg(long)]
        entities: PathBuf,
        #[arg(long)]
        triples: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Show entity counts and type distribution
    Stats {
        #[arg(long)]
        entities: PathBuf,
    },
    /// Show the entity context a text would receive
    Match {
        #[arg(long)]
        entities: PathBuf,
        #[arg(long)]
        text: String,
        /// Maximum entities listed
        #[arg(long)]
        max: Option<usize>,
    },
    /// Count the records of a chunk stream
    Count {
        #[arg(long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Extract {
            input,
            entities,
            output_dir,
            start,
            end,
            batch_size,
            prompt,
            resume,
            json,
        } => {
            let end = resolve_end(start, end, batch_size);
            let mut request = ExtractionRequest::new(input, entities, &output_dir).with_start(start);
            if let Some(end) = end {
                request = request.with_end(end);
            }

            if resume {
                let next = CheckpointManager::resume_point(&output_dir, RecordKind::Triples, start)?;
                if next > start {
                    info!(next, "Resuming after latest checkpoint");
                    request.start = next;
                    if end.is_some_and(|end| next >= end) {
                        println!("Range already complete up to index {}", next - 1);
                        return Ok(());
                    }
                }
            }

            let prompt = prompt.unwrap_or(config.extraction.prompt);
            let generator = kbforge_llm::create_generator(&config.llm, prompt)?;
            let mut controller =
                RangeExtractionController::new(Box::new(generator), &config.extraction)?;

            match controller.run(&request).await {
                Ok(output) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&output.summary)?);
                    } else {
                        print_summary(&output.summary);
                    }
                }
                Err(e @ ExtractError::EmptyRange { .. }) => {
                    warn!(error = %e, "Nothing to extract");
                    println!("{e}");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::MergeEntities { input_dir, output } => {
            let report = merge_entity_dir(&input_dir, &output)?;
            print_merge_report("entities", &report, &output);
        }
        Commands::MergeTriples { input_dir, output } => {
            let report = merge_triple_dir(&input_dir, &output)?;
            print_merge_report("triples", &report, &output);
        }
        Commands::Enrich {
            entities,
            triples,
            output,
        } => {
            let report = enrich_files(&entities, &triples, &output)?;
            println!(
                "Enriched entities: {} placeholders created, {} references added",
                report.placeholders_created, report.references_added
            );
            println!("Saved to: {}", output.display());
        }
        Commands::Stats { entities } => {
            let matcher = MultiPatternMatcher::build(load_entity_dictionary(&entities)?);
            println!("{}", serde_json::to_string_pretty(&matcher.stats())?);
        }
        Commands::Match {
            entities,
            text,
            max,
        } => {
            let matcher = MultiPatternMatcher::build(load_entity_dictionary(&entities)?);
            let max = max.unwrap_or(config.extraction.max_context_entities);
            println!("{}", matcher.match_entities_with_context(&text, max));
        }
        Commands::Count { input } => {
            println!("{}", count_chunks(&input)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)
            .and_then(AppConfig::with_env_override)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AppConfig::from_env()?,
    };
    Ok(config)
}

fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if config.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Explicit end wins; otherwise `start + batch_size`; otherwise unbounded
fn resolve_end(start: u64, end: Option<u64>, batch_size: Option<u64>) -> Option<u64> {
    end.or_else(|| batch_size.map(|size| start.saturating_add(size)))
}

fn print_summary(summary: &RunSummary) {
    println!("Extraction run {}", summary.run_id);
    println!("  range:       [{}, {})", summary.start, summary.end);
    println!(
        "  chunks:      {} in range, {} processed, {} skipped, {} empty, {} quarantined",
        summary.chunks_in_range,
        summary.chunks_processed,
        summary.chunks_skipped,
        summary.chunks_empty,
        summary.chunks_quarantined
    );
    println!(
        "  records:     {} entities, {} triples ({} dropped)",
        summary.total_entities, summary.total_triples, summary.records_dropped
    );
    if let Some(path) = &summary.entities_file {
        println!("  entities:    {}", path.display());
    }
    if let Some(path) = &summary.triples_file {
        println!("  triples:     {}", path.display());
    }
    if !summary.skipped_chunk_ids.is_empty() {
        let ids: Vec<String> = summary
            .skipped_chunk_ids
            .iter()
            .map(ToString::to_string)
            .collect();
        println!("  skipped ids: {}", ids.join(", "));
    }
    for path in &summary.quarantine_files {
        println!("  quarantined: {}", path.display());
    }
    if summary.checkpoint_failures > 0 {
        println!("  checkpoint failures: {}", summary.checkpoint_failures);
    }
}

fn print_merge_report(kind: &str, report: &MergeReport, output: &Path) {
    println!("Merged {} files", report.files_read);
    match kind {
        "entities" => println!(
            "  entities: {} new, {} updated",
            report.entities_inserted, report.entities_updated
        ),
        _ => println!("  triples: {}", report.triples),
    }
    if report.records_dropped > 0 {
        println!("  dropped records: {}", report.records_dropped);
    }
    for (path, reason) in &report.files_skipped {
        println!("  skipped {}: {reason}", path.display());
    }
    println!("Saved to: {}", output.display());
}
