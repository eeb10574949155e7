use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fcascan_lib::pdf::PageRange;
use fcascan_lib::{vin, BatchStatus, InvoiceProcessor, PipelineConfig, ProductCodeRegistry, Recognizer, ScanRequest};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fcascan", version, about = "Extract and score FCA dealer invoices.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan invoice files (PDF or image) and print one JSON result per file.
    Scan {
        /// Files to scan
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Pipeline config (JSON); built-in defaults when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Product-code dataset (JSON); the bundled one when omitted
        #[arg(long)]
        registry: Option<PathBuf>,
        /// Pre-extracted text layer, used for every file
        #[arg(long)]
        text: Option<PathBuf>,
        /// Page range to read, e.g. `1` or `2-3`
        #[arg(long)]
        pages: Option<PageRange>,
        /// Layout profile id
        #[arg(long)]
        layout: Option<String>,
        /// Include base64 PNG previews of each OCR zone
        #[arg(long)]
        previews: bool,
        /// Scans in flight at once (overrides the config)
        #[arg(long)]
        jobs: Option<usize>,
        /// Per-file timeout in seconds (overrides the config)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Validate a VIN, try single-character correction, decode year and brand.
    Vin { vin: String },
    /// Describe a 6-character product code.
    Code {
        code: String,
        #[arg(long)]
        registry: Option<PathBuf>,
    },
    /// Write the default pipeline config to a file.
    InitConfig { path: PathBuf },
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the JSON results.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Commands::Scan {
            files,
            config,
            registry,
            text,
            pages,
            layout,
            previews,
            jobs,
            timeout,
        } => {
            let mut cfg = match config {
                Some(path) => PipelineConfig::load(&path)?,
                None => PipelineConfig::default(),
            };
            cfg.ocr.previews |= previews;
            if let Some(jobs) = jobs {
                cfg.limits.max_in_flight = jobs;
            }
            if let Some(secs) = timeout {
                cfg.limits.timeout_secs = secs;
            }
            let native_text = match text {
                Some(path) => Some(
                    fs::read_to_string(&path).with_context(|| format!("Cannot read text layer {}", path.display()))?,
                ),
                None => None,
            };

            let requests = files
                .iter()
                .map(|path| -> Result<ScanRequest> {
                    let bytes = fs::read(path).with_context(|| format!("Cannot read {}", path.display()))?;
                    Ok(ScanRequest {
                        id: path.display().to_string(),
                        bytes,
                        native_text: native_text.clone(),
                        pages,
                        layout: layout.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let limits = cfg.limits.clone();
            let processor = InvoiceProcessor::new(load_registry(registry.as_deref())?, cfg.clone(), recognizer(&cfg));
            let items = processor.process_batch(requests, limits.max_in_flight, limits.timeout());

            let mut failed = 0;
            for item in &items {
                if item.status != BatchStatus::Completed {
                    failed += 1;
                }
                println!("{}", serde_json::to_string_pretty(item)?);
            }
            if failed > 0 {
                bail!("{failed} of {} scans did not complete", items.len());
            }
        }
        Commands::Vin { vin: raw } => {
            let check = vin::correct(&raw);
            let report = json!({
                "vin": check.vin,
                "valid": check.valid,
                "corrected": check.corrected,
                "year": vin::decode_year(&check.vin),
                "brand": vin::decode_brand(&check.vin),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Code { code, registry: path } => {
            let registry = load_registry(path.as_deref())?;
            match registry.describe(&code) {
                Some(desc) => println!("{}", serde_json::to_string_pretty(&desc)?),
                None => bail!("Unknown product code {code:?}"),
            }
        }
        Commands::InitConfig { path } => {
            PipelineConfig::default()
                .save(&path)
                .with_context(|| format!("Cannot write {}", path.display()))?;
            info!(path = %path.display(), "Default config written");
        }
    }
    Ok(())
}

fn load_registry(path: Option<&Path>) -> Result<Arc<ProductCodeRegistry>> {
    let registry = match path {
        Some(path) => ProductCodeRegistry::load(path)?,
        None => ProductCodeRegistry::builtin(),
    };
    info!(codes = registry.len(), "Product-code registry ready");
    Ok(Arc::new(registry))
}

#[cfg(feature = "tesseract")]
fn recognizer(cfg: &PipelineConfig) -> Arc<dyn Recognizer> {
    Arc::new(fcascan_lib::ocr::tesseract::TesseractRecognizer::new(cfg.ocr.tessdata_dir.clone()))
}

#[cfg(not(feature = "tesseract"))]
fn recognizer(_cfg: &PipelineConfig) -> Arc<dyn Recognizer> {
    tracing::warn!("Built without the `tesseract` feature; scanned pages will read as empty");
    Arc::new(fcascan_lib::NoRecognizer)
}
