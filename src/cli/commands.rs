//! CLI command definitions and handlers

use clap::Subcommand;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::core::cache::{ensure_cached, HfHub};
use crate::core::client::AsyncTranslator;
use crate::core::config::TranslatorConfig;
use crate::core::errors::{Result, TranslationError};
use crate::core::models::{Direction, TranslationRequest};

/// Commands for the Nanai translator
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP API server
    Server {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Listen port
        #[arg(short, long, default_value_t = 8000)]
        port: u16,

        /// Load the models on the first request instead of at startup
        #[arg(long)]
        lazy: bool,
    },

    /// Translate a single text
    Translate {
        /// Target language: russian or nanai
        #[arg(short, long, value_parser = parse_direction)]
        direction: Direction,

        /// Upper bound on generated tokens
        #[arg(long)]
        max_length: Option<usize>,

        /// Alternative number; 1 is the canonical translation
        #[arg(long, default_value_t = 1)]
        attempt: u32,

        /// Text to translate
        text: String,
    },

    /// Translate a text file line by line
    Batch {
        /// Input file, one text per line
        #[arg(short, long)]
        file: PathBuf,

        /// Output file (default: input name with the direction appended)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Target language: russian or nanai
        #[arg(short, long, value_parser = parse_direction)]
        direction: Direction,
    },

    /// Download the base model into the local cache and exit
    Download,
}

fn parse_direction(value: &str) -> std::result::Result<Direction, String> {
    value.parse().map_err(|e: TranslationError| e.to_string())
}

/// Load configuration from `--config` or the environment
pub fn load_config(path: Option<&Path>) -> anyhow::Result<TranslatorConfig> {
    let config = match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            TranslatorConfig::from_file(path)?
        }
        None => TranslatorConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn progress_style() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"))
}

/// Handle server command
pub async fn handle_server(config: TranslatorConfig, host: String, port: u16, lazy: bool) -> anyhow::Result<()> {
    use crate::server::api::run_server;

    let translator = AsyncTranslator::from_config(config)?;

    if lazy {
        info!("Models will be loaded on the first request");
    } else {
        let start_time = Instant::now();
        info!("Loading models before accepting requests");
        translator.warm_up().await?;
        info!("Models loaded in {:?}", start_time.elapsed());
    }

    info!("Starting HTTP server on {}:{}", host, port);
    println!("🚀 Server starting on http://{}:{}", host, port);
    println!("📄 OpenAPI document: http://{}:{}/api-docs/openapi.json", host, port);

    run_server(translator, host, port).await?;

    Ok(())
}

/// Handle one-shot translate command
pub async fn handle_translate(
    config: TranslatorConfig,
    direction: Direction,
    max_length: Option<usize>,
    attempt: u32,
    text: String,
) -> anyhow::Result<()> {
    let translator = AsyncTranslator::from_config(config)?;

    let mut request = TranslationRequest::new(text, direction).with_attempt(attempt);
    if let Some(max_length) = max_length {
        request = request.with_max_length(max_length);
    }

    let translation = translator.translate(request).await?;
    if translation.is_empty() {
        anyhow::bail!("Failed to translate");
    }

    println!("{}", translation);
    Ok(())
}

/// Default batch output: `notes.txt` -> `notes.txt.nanai`
fn default_output(file: &Path, direction: Direction) -> PathBuf {
    let mut name = file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "translation".into());
    name.push(format!(".{}", direction));
    file.with_file_name(name)
}

/// Put translations back in place of their non-empty source lines.
///
/// Blank lines pass through; lines that failed or came back empty are kept verbatim.
fn merge_translations(lines: &[&str], results: Vec<Result<String>>) -> (Vec<String>, usize, usize) {
    let mut results = results.into_iter();
    let mut translated = Vec::with_capacity(lines.len());
    let mut processed = 0;
    let mut failed = 0;

    for line in lines {
        if line.trim().is_empty() {
            translated.push(line.to_string());
            continue;
        }

        match results.next() {
            Some(Ok(text)) if !text.is_empty() => {
                processed += 1;
                translated.push(text);
            }
            Some(Ok(_)) => {
                failed += 1;
                warn!("Empty translation for: {}", line);
                translated.push(line.to_string());
            }
            Some(Err(e)) => {
                failed += 1;
                warn!("Translation failed for '{}': {}", line, e);
                translated.push(line.to_string());
            }
            None => {
                failed += 1;
                translated.push(line.to_string());
            }
        }
    }

    (translated, processed, failed)
}

/// Handle batch translation command
pub async fn handle_batch(
    config: TranslatorConfig,
    file: PathBuf,
    output: Option<PathBuf>,
    direction: Direction,
) -> anyhow::Result<()> {
    let start_time = Instant::now();
    let output = output.unwrap_or_else(|| default_output(&file, direction));

    info!("Starting batch translation");
    info!("Input: {}", file.display());
    info!("Output: {}", output.display());
    info!("Direction: {}", direction);

    let content = tokio::fs::read_to_string(&file).await?;
    let lines: Vec<&str> = content.lines().collect();
    let todo = lines.iter().filter(|l| !l.trim().is_empty()).count();

    if todo == 0 {
        anyhow::bail!("No text found in {}", file.display());
    }

    let translator = AsyncTranslator::from_config(config)?;
    translator.warm_up().await?;

    let pb = ProgressBar::new(todo as u64);
    pb.set_style(progress_style()?);

    let requests: Vec<TranslationRequest> = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| TranslationRequest::new(*l, direction))
        .collect();

    let results = translator
        .translate_batch_with(requests, |_, result| {
            if let Err(e) = result {
                pb.set_message(format!("Failed: {}", e));
            }
            pb.inc(1);
        })
        .await;

    let (translated, processed, failed) = merge_translations(&lines, results);

    pb.finish_with_message("Completed");

    let mut body = translated.join("\n");
    if content.ends_with('\n') {
        body.push('\n');
    }
    tokio::fs::write(&output, body).await?;

    let duration = start_time.elapsed();
    info!(
        "Completed: {} processed, {} failed in {:?}",
        processed, failed, duration
    );

    println!("\n✅ Translation completed!");
    println!("   Processed: {}", processed);
    println!("   Failed: {}", failed);
    println!("   Output: {}", output.display());
    println!("   Time: {:?}", duration);

    Ok(())
}

/// Handle download command
pub async fn handle_download(config: TranslatorConfig) -> anyhow::Result<()> {
    info!("Prefetching {} into {}", config.model_id, config.cache_dir.display());

    let spinner = ProgressBar::new_spinner();
    spinner.set_message(format!("Fetching {}", config.model_id));
    spinner.enable_steady_tick(Duration::from_millis(120));

    let cached = tokio::task::spawn_blocking(move || {
        let hub = HfHub::new(&config)?;
        ensure_cached(&config, &hub)
    })
    .await?;

    spinner.finish_and_clear();
    let cached = cached?;

    println!("✅ {} files cached", cached.len());
    for (name, path) in cached.iter() {
        println!("   {} -> {}", name, path.display());
    }

    Ok(())
}
