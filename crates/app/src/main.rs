use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use pdf_harvest_core::{
    discover_pdf_files, find_duplicates, plan_jobs, process_jobs, redundant_copies, settle,
    write_duplicate_csv, CaptionMatcher, ChunkingConfig, DisabledMatcher, DocumentJob,
    DuplicateScan, Engines, ExtractionOptions, HttpRecognizer, ImageFilter, LogRow,
    OcrEndpointConfig, OcrOptions, PartialRatioMatcher, PdftoppmRenderer, Pipeline,
    ReliabilityThresholds, RunLog, RunOutcome, RunSummary, TesseractRecognizer,
    TextLayoutConverter, TextRecognizer,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-harvest", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract text, figures, tables and chunks from a PDF or a folder of PDFs.
    Extract {
        /// PDF file, or folder searched recursively. Subfolder names become group labels.
        #[arg(long)]
        input: PathBuf,
        /// Root of the per-document output directories.
        #[arg(long)]
        output: PathBuf,
        /// Run log CSV; defaults to <output>/extraction_log.csv.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Documents processed concurrently.
        #[arg(long, default_value_t = 1)]
        jobs: usize,
        /// Process only one file out of each group of byte-identical PDFs.
        #[arg(long, default_value_t = false)]
        skip_duplicates: bool,
        #[command(flatten)]
        engines: EngineArgs,
        #[command(flatten)]
        tuning: TuningArgs,
    },
    /// Report byte-identical PDFs under a folder.
    Duplicates {
        #[arg(long)]
        folder: PathBuf,
        /// Write hash,path,keeper rows to this CSV.
        #[arg(long)]
        csv: Option<PathBuf>,
    },
}

#[derive(Args)]
struct EngineArgs {
    /// pdftoppm executable used to rasterize pages for OCR.
    #[arg(long, env = "PDFTOPPM_BIN", default_value = "pdftoppm")]
    pdftoppm: PathBuf,
    /// tesseract executable, used unless an OCR endpoint is configured.
    #[arg(long, env = "TESSERACT_BIN", default_value = "tesseract")]
    tesseract: PathBuf,
    /// HTTP OCR endpoint accepting base64 PNG pages.
    #[arg(long, env = "OCR_ENDPOINT")]
    ocr_endpoint: Option<String>,
    /// Bearer key for the OCR endpoint.
    #[arg(long, env = "OCR_API_KEY", hide_env_values = true)]
    ocr_api_key: Option<String>,
    /// Per-page timeout for the OCR endpoint, in seconds.
    #[arg(long, default_value_t = 120)]
    ocr_timeout_secs: u64,
    /// Skip fuzzy caption matching.
    #[arg(long, default_value_t = false)]
    no_fuzzy: bool,
}

#[derive(Args)]
struct TuningArgs {
    #[arg(long, default_value_t = 50)]
    min_nonws_chars: usize,
    #[arg(long, default_value_t = 200)]
    dpi: u32,
    /// OCR languages, comma separated.
    #[arg(long, value_delimiter = ',', default_value = "eng,rus")]
    languages: Vec<String>,
    #[arg(long, default_value_t = 0.15)]
    non_latin_share: f64,
    #[arg(long, default_value_t = 0.4)]
    min_alpha_ratio: f64,
    #[arg(long, default_value_t = 0.005)]
    max_digit_in_word_rate: f64,
    #[arg(long, default_value_t = 50)]
    min_image_width: u32,
    #[arg(long, default_value_t = 50)]
    min_image_height: u32,
    #[arg(long, default_value_t = 0.85)]
    full_page_coverage: f32,
    #[arg(long, default_value_t = 300)]
    full_page_text_cutoff: usize,
    #[arg(long, default_value_t = 1200)]
    max_chars: usize,
    #[arg(long, default_value_t = 120)]
    overlap_chars: usize,
    #[arg(long, default_value_t = 120)]
    min_chars: usize,
    /// Minimum 0-100 caption similarity for fuzzy figure injection.
    #[arg(long, default_value_t = 85.0)]
    fuzzy_threshold: f64,
}

impl TuningArgs {
    fn into_options(self) -> ExtractionOptions {
        ExtractionOptions {
            reliability: ReliabilityThresholds {
                non_latin_share: self.non_latin_share,
                min_alpha_ratio: self.min_alpha_ratio,
                max_digit_in_word_rate: self.max_digit_in_word_rate,
            },
            ocr: OcrOptions {
                min_nonws_chars: self.min_nonws_chars,
                dpi: self.dpi,
                languages: self.languages,
            },
            images: ImageFilter {
                min_width: self.min_image_width,
                min_height: self.min_image_height,
                full_page_coverage: self.full_page_coverage,
                full_page_text_cutoff: self.full_page_text_cutoff,
            },
            chunking: ChunkingConfig {
                max_chars: self.max_chars,
                overlap_chars: self.overlap_chars,
                min_chars: self.min_chars,
            },
            fuzzy_threshold: self.fuzzy_threshold,
        }
    }
}

/// Builds the engines, probing local executables so a missing one stops the
/// run before any document starts.
fn build_engines(args: &EngineArgs) -> anyhow::Result<Engines> {
    let renderer = PdftoppmRenderer::new(&args.pdftoppm);
    renderer
        .probe()
        .map_err(|error| anyhow::anyhow!(error.to_string()))?;

    let endpoint = args
        .ocr_endpoint
        .clone()
        .and_then(|endpoint| OcrEndpointConfig::new(endpoint, args.ocr_api_key.clone()));
    let recognizer: Box<dyn TextRecognizer> = match endpoint {
        Some(config) => {
            info!(endpoint = %config.endpoint, "using OCR endpoint");
            Box::new(
                HttpRecognizer::new(config)
                    .map_err(|error| anyhow::anyhow!(error.to_string()))?
                    .with_timeout(Duration::from_secs(args.ocr_timeout_secs)),
            )
        }
        None => {
            let tesseract = TesseractRecognizer::new(&args.tesseract);
            tesseract
                .probe()
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            Box::new(tesseract)
        }
    };

    let matcher: Box<dyn CaptionMatcher> = if args.no_fuzzy {
        Box::new(DisabledMatcher)
    } else {
        Box::new(PartialRatioMatcher)
    };

    Ok(Engines {
        renderer: Box::new(renderer),
        recognizer,
        converter: Box::new(
            TextLayoutConverter::new().map_err(|error| anyhow::anyhow!(error.to_string()))?,
        ),
        matcher,
    })
}

fn drop_duplicate_copies(jobs: Vec<DocumentJob>) -> Vec<DocumentJob> {
    let sources: Vec<PathBuf> = jobs.iter().map(|job| job.source.clone()).collect();
    let redundant = redundant_copies(&find_duplicates(&sources).groups);
    if !redundant.is_empty() {
        info!(skipped = redundant.len(), "skipping duplicate pdf copies");
    }
    jobs.into_iter()
        .filter(|job| !redundant.contains(&job.source))
        .collect()
}

/// Runs up to `workers` documents at once on blocking threads. This task is
/// the only log writer; rows land in completion order.
///
/// A configuration-fatal error stops admission of new documents. Documents
/// already started run to completion and are logged before the run halts.
async fn run_parallel(
    pipeline: Arc<Pipeline>,
    jobs: Vec<DocumentJob>,
    mut log: RunLog,
    workers: usize,
) -> anyhow::Result<RunOutcome> {
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut tasks = JoinSet::new();

    for job in jobs {
        let semaphore = Arc::clone(&semaphore);
        let pipeline = Arc::clone(&pipeline);
        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return None;
            };
            let worker_job = job.clone();
            let outcome = tokio::task::spawn_blocking(move || pipeline.process(&worker_job)).await;
            Some((job, outcome))
        });
    }

    let mut summary = RunSummary::default();
    let mut halted = None;
    while let Some(joined) = tasks.join_next().await {
        let (job, outcome) = match joined {
            Ok(Some(finished)) => finished,
            // Never admitted.
            Ok(None) => continue,
            Err(join_error) => {
                warn!(error = %join_error, "document task failed before reporting");
                continue;
            }
        };
        match outcome {
            Ok(outcome) => {
                if let Err(error) = settle(&job, outcome, &mut log, &mut summary) {
                    if halted.is_none() {
                        warn!(error = %error, "halting run; waiting for started documents");
                        semaphore.close();
                        halted = Some(error);
                    }
                }
            }
            Err(join_error) => {
                warn!(source = %job.source.display(), error = %join_error, "document worker crashed");
                log.append(&LogRow::failure(&job, &join_error))
                    .map_err(|error| anyhow::anyhow!(error.to_string()))?;
                summary.record_failure();
            }
        }
    }

    Ok(RunOutcome { summary, halted })
}

async fn run_extract(
    input: &Path,
    output: &Path,
    log_path: PathBuf,
    workers: usize,
    skip_duplicates: bool,
    engines: Engines,
    options: ExtractionOptions,
) -> anyhow::Result<()> {
    let mut jobs = plan_jobs(input, output).map_err(|error| anyhow::anyhow!(error.to_string()))?;
    if skip_duplicates {
        jobs = drop_duplicate_copies(jobs);
    }
    info!(input = %input.display(), documents = jobs.len(), workers, "starting extraction");

    let pipeline = Pipeline::new(options, engines).map_err(|error| anyhow::anyhow!(error.to_string()))?;
    let log = RunLog::open(&log_path).map_err(|error| anyhow::anyhow!(error.to_string()))?;

    let outcome = if workers > 1 {
        run_parallel(Arc::new(pipeline), jobs, log, workers).await?
    } else {
        tokio::task::spawn_blocking(move || {
            let mut log = log;
            process_jobs(&pipeline, &jobs, &mut log)
        })
        .await?
    };

    println!("{}", outcome.summary);
    match outcome.halted {
        Some(error) => Err(anyhow::anyhow!("run halted: {error}")),
        None => Ok(()),
    }
}

fn report_duplicates(folder: &Path, csv: Option<&Path>) -> anyhow::Result<()> {
    let files = discover_pdf_files(folder);
    let DuplicateScan { groups, unreadable } = find_duplicates(&files);

    for group in &groups {
        println!("{}  keep {}", group.digest, group.keeper.display());
        for copy in group.redundant() {
            println!("    copy {}", copy.display());
        }
    }
    println!(
        "{} pdf files, {} duplicate groups, {} redundant copies, {} unreadable",
        files.len(),
        groups.len(),
        redundant_copies(&groups).len(),
        unreadable.len()
    );

    if let Some(path) = csv {
        write_duplicate_csv(path, &groups).map_err(|error| anyhow::anyhow!(error.to_string()))?;
        info!(path = %path.display(), "duplicate report written");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "pdf-harvest boot"
    );

    match cli.command {
        Command::Extract {
            input,
            output,
            log,
            jobs,
            skip_duplicates,
            engines,
            tuning,
        } => {
            let engines = build_engines(&engines)?;
            let log_path = log.unwrap_or_else(|| output.join("extraction_log.csv"));
            run_extract(
                &input,
                &output,
                log_path,
                jobs.max(1),
                skip_duplicates,
                engines,
                tuning.into_options(),
            )
            .await?;
        }
        Command::Duplicates { folder, csv } => {
            report_duplicates(&folder, csv.as_deref())?;
        }
    }

    Ok(())
}
