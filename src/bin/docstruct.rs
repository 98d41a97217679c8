//! CLI binary for edgequake-docstruct.
//!
//! A thin shim over the library crate that maps CLI flags and the
//! `configs/` documents to a `DocumentPipeline` and prints results.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_docstruct::pipeline::llm::resolve_generator;
use edgequake_docstruct::{
    write_outputs, BatchResult, DocumentPipeline, EngineRouter, LlmRegenerator, LlmServices, NlpConfig,
    PageSelection, PipelineConfig, ProcessingProgressCallback, ProgressCallback, SchemaVersions,
    StructureSchema,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar for the batch, one log line per page.
struct CliProgressCallback {
    bar: ProgressBar,
    started: Instant,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} inputs  \
                 ⏱ {elapsed_precise}  {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        bar.set_prefix("Processing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            started: Instant::now(),
            errors: AtomicUsize::new(0),
        })
    }
}

impl ProcessingProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.reset_eta();
    }

    fn on_item_start(&self, _index: usize, _total: usize, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn on_page_complete(&self, name: &str, page: Option<usize>, coverage: Option<f64>) {
        let label = match page {
            Some(p) => format!("{name} p{p}"),
            None => name.to_string(),
        };
        let coverage = coverage
            .map(|c| format!("{c:>6.2}% coverage"))
            .unwrap_or_else(|| "recognition only".to_string());
        self.bar
            .println(format!("  {} {:<40}  {}", green("✓"), label, dim(&coverage)));
    }

    fn on_item_complete(&self, _index: usize, _total: usize, _name: &str, _results: usize) {
        self.bar.inc(1);
    }

    fn on_item_error(&self, _index: usize, _total: usize, name: &str, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(std::iter::once('…')).collect()
        } else {
            error.to_string()
        };
        self.bar.println(format!("  {} {:<40}  {}", red("✗"), name, red(&msg)));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total: usize, successful: usize) {
        self.bar.finish_and_clear();
        let failed = total.saturating_sub(successful);
        let elapsed = format!("{:.1}s", self.started.elapsed().as_secs_f64());
        if failed == 0 {
            eprintln!("{} {} inputs processed  {}", green("✔"), bold(&successful.to_string()), dim(&elapsed));
        } else {
            eprintln!(
                "{} {}/{} inputs processed  ({} failed)  {}",
                if failed == total { red("✘") } else { yellow("⚠") },
                bold(&successful.to_string()),
                total,
                red(&failed.to_string()),
                dim(&elapsed),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Structure one scan with the invoice schema, exports under ./output
  docstruct process scan.png --schema configs/structures/origin/invoice.json

  # Several inputs, selected PDF pages, JSON to stdout
  docstruct process a.pdf b.jpg --pages 1-2 --json > result.json

  # Recognition only (no LLM call)
  docstruct process scan.png --no-nlp

  # Which engines are configured and installed?
  docstruct engines list

  # Make Google Cloud Vision current and save the choice
  docstruct engines switch google-cloud-vision --persist

  # Regenerate schemas whose origin changed
  docstruct schemas sync
  docstruct schemas sync --dry-run

CONFIGURATION FILES:
  configs/ocr_engines.json     engine registry (current, engines)
  configs/nlp.json             text cleaning, NLP on/off, default schema
  configs/llms/init.json       structuring provider (current, services)
  configs/structures/          origin/ temp/ new/ schemas + template.json

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  GOOGLE_VISION_API_KEY   Google Cloud Vision API key
  RUST_LOG                Log filter (overrides --verbose)
"#;

/// Turn scanned documents into confidence-scored structured data.
#[derive(Parser, Debug)]
#[command(
    name = "docstruct",
    version,
    about = "Turn scanned documents into confidence-scored structured data",
    long_about = "Recognize scanned images and PDFs with a configurable OCR engine (Tesseract, \
Google Cloud Vision), extract schema-defined fields with an LLM, and score every field against \
the recognized text so low-confidence values go to human review.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Engine registry document.
    #[arg(long, global = true, env = "DOCSTRUCT_ENGINES", default_value = "configs/ocr_engines.json")]
    engines: PathBuf,

    /// NLP configuration document.
    #[arg(long, global = true, env = "DOCSTRUCT_NLP", default_value = "configs/nlp.json")]
    nlp: PathBuf,

    /// LLM service document. Missing file means environment auto-detection.
    #[arg(long, global = true, env = "DOCSTRUCT_LLM", default_value = "configs/llms/init.json")]
    llm: PathBuf,

    /// LLM model ID (e.g. gpt-4.1-nano, claude-sonnet-4-20250514).
    #[arg(long, global = true, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOCSTRUCT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOCSTRUCT_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recognize and structure images or PDFs.
    Process(ProcessArgs),
    /// Inspect or switch recognition engines.
    #[command(subcommand)]
    Engines(EnginesCommand),
    /// Maintain versioned structure schemas.
    #[command(subcommand)]
    Schemas(SchemasCommand),
}

#[derive(Args, Debug)]
struct ProcessArgs {
    /// Image or PDF files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Structure schema file. Defaults to `structure_config_path` from the
    /// NLP document.
    #[arg(long, env = "DOCSTRUCT_SCHEMA")]
    schema: Option<PathBuf>,

    /// Use this engine for this run without changing the registry file.
    #[arg(long)]
    engine: Option<String>,

    /// Directory for raw text, review CSV and JSON exports.
    #[arg(short, long, env = "DOCSTRUCT_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    /// Skip writing export files.
    #[arg(long)]
    no_export: bool,

    /// Print the batch result as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Recognition only; skip structuring.
    #[arg(long)]
    no_nlp: bool,

    /// Rendering DPI for PDF pages (72–600).
    #[arg(long, env = "DOCSTRUCT_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, default_value = "all")]
    pages: String,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "DOCSTRUCT_PASSWORD")]
    password: Option<String>,

    /// Per-call structuring timeout in seconds.
    #[arg(long, default_value_t = 60)]
    api_timeout: u64,

    /// Disable progress bar.
    #[arg(long)]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum EnginesCommand {
    /// List configured engines and whether they are usable here.
    List {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Make an engine current.
    Switch {
        name: String,
        /// JSON object merged into the engine's settings.
        #[arg(long)]
        settings: Option<String>,
        /// Write the change back to the registry file.
        #[arg(long)]
        persist: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SchemasCommand {
    /// Prune orphans and regenerate stale schemas.
    Sync {
        /// Root holding origin/, temp/, new/ and template.json.
        #[arg(long, default_value = "configs/structures")]
        root: PathBuf,
        /// Only report which schemas are stale.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs while it is visible.
    let show_progress = match &cli.command {
        Command::Process(args) => !cli.quiet && !args.no_progress && !args.json,
        _ => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    match &cli.command {
        Command::Process(args) => run_process(&cli, args, show_progress).await,
        Command::Engines(EnginesCommand::List { json }) => run_engines_list(&cli, *json).await,
        Command::Engines(EnginesCommand::Switch {
            name,
            settings,
            persist,
        }) => run_engines_switch(&cli, name, settings.as_deref(), *persist).await,
        Command::Schemas(SchemasCommand::Sync { root, dry_run }) => run_schemas_sync(&cli, root, *dry_run).await,
    }
}

// ── process ──────────────────────────────────────────────────────────────

async fn run_process(cli: &Cli, args: &ProcessArgs, show_progress: bool) -> Result<()> {
    let mut nlp = NlpConfig::load(&cli.nlp).await.context("Failed to load NLP configuration")?;
    if args.no_nlp {
        nlp.enabled = false;
    }

    let schema = match args.schema.as_ref().or(nlp.structure_config_path.as_ref()) {
        Some(path) => StructureSchema::load(path)
            .await
            .with_context(|| format!("Failed to load schema {}", path.display()))?,
        None if nlp.enabled => bail!("No schema given: pass --schema or set structure_config_path in {}", cli.nlp.display()),
        None => StructureSchema::default(),
    };

    let router = Arc::new(EngineRouter::load(&cli.engines).await.context("Failed to load engine registry")?);
    if let Some(ref engine) = args.engine {
        router
            .try_switch_engine(engine, None, false)
            .await
            .with_context(|| format!("Cannot use engine '{engine}'"))?;
    }

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ProcessingProgressCallback>)
    } else {
        None
    };

    let mut builder = PipelineConfig::builder()
        .dpi(args.dpi)
        .pages(PageSelection::parse(&args.pages).context("Invalid --pages")?)
        .api_timeout_secs(args.api_timeout)
        .nlp(nlp);
    builder = apply_llm_settings(cli, builder).await?;
    if let Some(ref pwd) = args.password {
        builder = builder.password(pwd.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    let config = builder.build().context("Invalid configuration")?;
    let threshold = config.scoring.review_threshold;

    let mut pipeline = DocumentPipeline::new(router, schema, config).context("Failed to build pipeline")?;
    let batch = pipeline.process_batch(&args.inputs).await;
    pipeline.close();

    if !args.no_export {
        for result in batch.items.iter().flat_map(|i| &i.results) {
            let files = write_outputs(&args.output_dir, result, threshold)
                .await
                .with_context(|| format!("Failed to export {}", result.source_name))?;
            if !cli.quiet && !args.json {
                eprintln!("  {} {}", dim("→"), files.directory.display());
            }
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&batch).context("Failed to serialise result")?);
    } else if !cli.quiet {
        print_summary(&batch, show_progress);
    }

    if batch.total > 0 && batch.successful == 0 {
        bail!("All {} inputs failed", batch.total);
    }
    Ok(())
}

fn print_summary(batch: &BatchResult, progress_shown: bool) {
    for item in &batch.items {
        for result in &item.results {
            let label = match result.page_number {
                Some(p) => format!("{} p{p}", result.source_name),
                None => result.source_name.clone(),
            };
            match &result.structured {
                Some(doc) => {
                    println!(
                        "{}  {} {:.2}%  {} {}",
                        bold(&label),
                        dim("coverage"),
                        doc.coverage,
                        dim("review:"),
                        if doc.validation_list.is_empty() {
                            green("none")
                        } else {
                            yellow(&doc.validation_list.join(", "))
                        }
                    );
                    for (name, field) in &doc.fields {
                        println!(
                            "    {:<24} {:>6.2}  {}",
                            name,
                            field.confidence,
                            field.value
                        );
                    }
                }
                None => println!(
                    "{}  {} {:.1}  {}",
                    bold(&label),
                    dim("ocr confidence"),
                    result.recognition.confidence,
                    dim(&format!("{} chars", result.recognition.text.chars().count()))
                ),
            }
        }
        // The progress callback already printed failures.
        if !progress_shown {
            for e in &item.errors {
                eprintln!("{} {}", red("✗"), e);
            }
        }
    }
}

/// Provider settings: the LLM service document first, CLI flags on top.
async fn apply_llm_settings(
    cli: &Cli,
    mut builder: edgequake_docstruct::PipelineConfigBuilder,
) -> Result<edgequake_docstruct::PipelineConfigBuilder> {
    if tokio::fs::try_exists(&cli.llm).await.unwrap_or(false) {
        let services = LlmServices::load(&cli.llm)
            .await
            .context("Failed to load LLM service configuration")?;
        builder = services.apply(builder);
    }
    if let Some(ref p) = cli.provider {
        builder = builder.provider_name(p.clone());
    }
    if let Some(ref m) = cli.model {
        builder = builder.model(m.clone());
    }
    Ok(builder)
}

// ── engines ──────────────────────────────────────────────────────────────

async fn run_engines_list(cli: &Cli, json: bool) -> Result<()> {
    let router = EngineRouter::load(&cli.engines).await.context("Failed to load engine registry")?;
    let engines = router.available_engines().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&engines).context("Failed to serialise engines")?);
        return Ok(());
    }
    for (name, status) in &engines {
        println!(
            "{} {:<24} {:<20} {}  {}",
            if status.current { cyan("◆") } else { " ".to_string() },
            bold(name),
            status.kind,
            if status.available { green("available") } else { red("unavailable") },
            dim(&status.description),
        );
    }
    if let Some(prev) = router.previous_engine() {
        println!("{}", dim(&format!("previous: {prev}")));
    }
    Ok(())
}

async fn run_engines_switch(cli: &Cli, name: &str, settings: Option<&str>, persist: bool) -> Result<()> {
    let router = EngineRouter::load(&cli.engines).await.context("Failed to load engine registry")?;
    let overrides = match settings {
        Some(raw) => {
            let value: serde_json::Value = serde_json::from_str(raw).context("--settings is not valid JSON")?;
            match value {
                serde_json::Value::Object(map) => Some(map),
                _ => bail!("--settings must be a JSON object"),
            }
        }
        None => None,
    };
    let before = router.current_engine();
    router
        .try_switch_engine(name, overrides, persist)
        .await
        .with_context(|| format!("Failed to switch to '{name}'"))?;
    if !cli.quiet {
        eprintln!(
            "{} {} → {}{}",
            green("✔"),
            before,
            bold(&router.current_engine()),
            if persist { dim("  (saved)") } else { dim("  (not persisted)") }
        );
    }
    Ok(())
}

// ── schemas ──────────────────────────────────────────────────────────────

async fn run_schemas_sync(cli: &Cli, root: &Path, dry_run: bool) -> Result<()> {
    let versions = SchemaVersions::from_root(root);
    if dry_run {
        let stale = versions.reconcile().await.context("Failed to reconcile schemas")?;
        if stale.is_empty() {
            eprintln!("{} all schemas up to date", green("✔"));
        }
        for name in stale {
            println!("{} {}", yellow("stale"), name);
        }
        return Ok(());
    }

    let config = apply_llm_settings(cli, PipelineConfig::builder())
        .await?
        .build()
        .context("Invalid configuration")?;
    let generator = resolve_generator(&config).context("Schema regeneration needs an LLM provider")?;
    let regenerator = LlmRegenerator::with_template_file(generator, versions.template_path())
        .await
        .context("Failed to load schema template")?;
    let report = versions.sync(&regenerator).await.context("Schema sync failed")?;

    for path in &report.pruned {
        println!("{} {}", dim("pruned"), path.display());
    }
    for name in &report.regenerated {
        println!("{} {}", green("regenerated"), name);
    }
    for (name, cause) in &report.failed {
        println!("{} {}  {}", red("failed"), name, dim(cause));
    }
    if report.regenerated.is_empty() && report.failed.is_empty() && !cli.quiet {
        eprintln!("{} all schemas up to date", green("✔"));
    }
    if !report.failed.is_empty() {
        bail!("{} schema(s) left stale", report.failed.len());
    }
    Ok(())
}
