use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use stagepipe::logging::{LoggingOptions, init_logging};
use stagepipe::{
    FileReference, LocalFile, PipelineBuilder, PipelineConfig, StepOptions, TerminalOptions,
};
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::LinesStream;

#[derive(Parser)]
#[command(name = "stagepipe", version, about = "Run staged pipelines over local files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log filter (error, warn, info, debug, trace, or a full directive list)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    /// Also write logs to a daily-rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Count lines and words across files
    Wordcount {
        /// Files to read
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Workers for the counting stage
        #[arg(short, long, default_value_t = 4)]
        parallelism: usize,
        /// Queue capacity in front of each stage
        #[arg(short, long, default_value_t = 64)]
        buffer: usize,
        /// JSON file with per-stage options, keyed by stage name
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print per-stage metrics after the run
        #[arg(long)]
        metrics: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _guard = init_logging(&LoggingOptions {
        level: cli.log_level,
        log_dir: cli.log_dir,
        ..LoggingOptions::default()
    })?;

    match cli.command {
        Commands::Wordcount {
            files,
            parallelism,
            buffer,
            config,
            metrics,
        } => wordcount(files, StepOptions::new(parallelism, buffer), config, metrics).await,
    }
}

async fn wordcount(
    files: Vec<PathBuf>,
    options: StepOptions,
    config: Option<PathBuf>,
    show_metrics: bool,
) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => PipelineConfig::from_file(&path)?,
        None => PipelineConfig::default(),
    };

    let pipeline = PipelineBuilder::new()
        .accept_collection::<PathBuf>()
        .add_async_step(|path: PathBuf| async move {
            let file = LocalFile::new(path);
            Ok::<_, anyhow::Error>(file.materialize().await?)
        })
        .named("materialize")
        .add_stream_step(|path: PathBuf| {
            async_stream::stream! {
                let file = match tokio::fs::File::open(&path).await {
                    Ok(file) => file,
                    Err(e) => {
                        yield Err(anyhow::Error::from(e).context(format!("failed to open {}", path.display())));
                        return;
                    }
                };
                let mut lines = LinesStream::new(tokio::io::BufReader::new(file).lines());
                while let Some(line) = lines.next().await {
                    yield line.map_err(anyhow::Error::from);
                }
            }
        })
        .named("lines")
        .with_options(StepOptions::new(1, options.buffer_capacity))
        .add_step(|line: String| Ok(line.split_whitespace().count()))
        .named("count")
        .with_options(options)
        .after_completion(|| async {
            tracing::info!("Word count finished");
            Ok::<(), anyhow::Error>(())
        })
        .configure(&config)
        .returns_stream(TerminalOptions::default())?;

    let mut counts = pipeline.invoke(files).await?;
    let mut lines = 0u64;
    let mut words = 0u64;
    let mut failures = 0u64;
    while let Some(count) = counts.next().await {
        match count {
            Ok(count) => {
                lines += 1;
                words += count as u64;
            }
            Err(e) => {
                failures += 1;
                eprintln!("error: {e}");
            }
        }
    }

    println!("lines: {lines}");
    println!("words: {words}");

    if show_metrics {
        for stage in pipeline.metrics().stages {
            println!(
                "{:>2} {:<20} workers={} processed={} emitted={} failed={} skipped={} busy={}ms",
                stage.index,
                stage.name,
                stage.parallelism,
                stage.items_processed,
                stage.items_emitted,
                stage.failures,
                stage.skipped,
                stage.duration_ms
            );
        }
    }

    if failures > 0 {
        return Err(anyhow::anyhow!("{failures} item(s) failed")).context("word count incomplete");
    }
    Ok(())
}
