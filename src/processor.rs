use crate::config::PipelineConfig;
use crate::extract::{extract_from_text, extract_from_zones, InvoiceExtractionResult};
use crate::geometry;
use crate::ocr::{read_zones, Recognizer, ZoneReading, ZoneTexts};
use crate::pdf::{detect_kind, embedded_page_image, read_native_text, DocumentKind, PageRange, PdfText};
use crate::registry::ProductCodeRegistry;
use crate::validate::{determine_parse_method_needed, validate, ValidationResult};
use crate::zones::{segment, LayoutProfile};
use image::DynamicImage;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::{mpsc, Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{info, info_span, warn};

/// Below this score a native-text result is second-guessed with OCR.
const NATIVE_RETRY_SCORE: u8 = 50;

/// Caps how many scans run at once, abandoned ones included.
///
/// A permit travels with the scan thread and is returned when that thread
/// exits, not when the caller stops waiting for it.
struct ScanSlots {
    running: Mutex<usize>,
    freed: Condvar,
    limit: usize,
}

struct ScanPermit(Arc<ScanSlots>);

impl ScanSlots {
    fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            running: Mutex::new(0),
            freed: Condvar::new(),
            limit: limit.max(1),
        })
    }

    /// Wait up to `timeout` for a free slot.
    fn acquire(self: &Arc<Self>, timeout: Duration) -> Option<ScanPermit> {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut running, wait) = self
            .freed
            .wait_timeout_while(running, timeout, |n| *n >= self.limit)
            .unwrap_or_else(PoisonError::into_inner);
        if wait.timed_out() && *running >= self.limit {
            return None;
        }
        *running += 1;
        Some(ScanPermit(Arc::clone(self)))
    }
}

impl Drop for ScanPermit {
    fn drop(&mut self) {
        let mut running = self.0.running.lock().unwrap_or_else(PoisonError::into_inner);
        *running = running.saturating_sub(1);
        self.0.freed.notify_one();
    }
}

/// One document submission.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    /// Caller's label, echoed back (file name on the command line).
    pub id: String,
    pub bytes: Vec<u8>,
    /// Text layer already extracted by the caller.
    pub native_text: Option<String>,
    pub pages: Option<PageRange>,
    /// Layout profile id; the configured default when unset.
    pub layout: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanOutcome {
    pub id: String,
    pub kind: DocumentKind,
    pub extraction: InvoiceExtractionResult,
    pub validation: ValidationResult,
    /// Per-zone readings; empty on the native-text path.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<ZoneReading>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    /// Still running when the timeout hit; the result was abandoned.
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub id: String,
    pub status: BatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ScanOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs submissions through the pipeline. Cheap to clone; every clone
/// shares the registry and recognizer.
#[derive(Clone)]
pub struct InvoiceProcessor {
    registry: Arc<ProductCodeRegistry>,
    config: PipelineConfig,
    recognizer: Arc<dyn Recognizer>,
}

impl InvoiceProcessor {
    pub fn new(registry: Arc<ProductCodeRegistry>, config: PipelineConfig, recognizer: Arc<dyn Recognizer>) -> Self {
        Self { registry, config, recognizer }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process one submission from bytes to a scored result. Never fails:
    /// unusable input yields an empty, low-scored outcome.
    pub fn process(&self, request: &ScanRequest) -> ScanOutcome {
        let span = info_span!("scan", id = %request.id);
        let _guard = span.enter();

        let kind = detect_kind(&request.bytes);
        let supplied = request.native_text.as_deref().filter(|t| !t.trim().is_empty());
        if kind == DocumentKind::Empty && supplied.is_none() {
            warn!("Empty payload");
            return self.empty_outcome(request, kind);
        }

        let native = match supplied {
            Some(text) => Some(text.to_string()),
            None if kind == DocumentKind::Pdf => match read_native_text(&request.bytes, request.pages) {
                PdfText::Text(text) => Some(text),
                PdfText::ScannedImage => None,
                PdfText::Error(e) => {
                    warn!(error = %e, "PDF text layer unreadable");
                    None
                }
            },
            None => None,
        };

        let native_outcome = native.map(|text| {
            let mut extraction = extract_from_text(&text, &self.registry);
            let validation = validate(&extraction);
            let native_ok = extraction.vin.is_some() || extraction.ep_cost.is_some();
            extraction.parse_method = determine_parse_method_needed(native_ok, validation.score);
            ScanOutcome {
                id: request.id.clone(),
                kind,
                extraction,
                validation,
                zones: Vec::new(),
            }
        });

        let native_outcome = match native_outcome {
            Some(outcome) if outcome.validation.score >= NATIVE_RETRY_SCORE => {
                self.log_outcome(&outcome);
                return outcome;
            }
            weak => weak,
        };

        let outcome = match (self.page_image(request, kind), native_outcome) {
            (Some(page), Some(native)) => {
                let scanned = self.scan_image(request, kind, &page);
                if scanned.validation.score > native.validation.score {
                    info!(native = native.validation.score, ocr = scanned.validation.score, "OCR beat weak text layer");
                    scanned
                } else {
                    native
                }
            }
            (Some(page), None) => self.scan_image(request, kind, &page),
            (None, Some(native)) => native,
            (None, None) => {
                warn!(?kind, "No text layer and no decodable page image");
                self.empty_outcome(request, kind)
            }
        };
        self.log_outcome(&outcome);
        outcome
    }

    /// The raster to OCR: the payload itself, or the scan embedded in a PDF.
    fn page_image(&self, request: &ScanRequest, kind: DocumentKind) -> Option<DynamicImage> {
        match kind {
            DocumentKind::Image => match image::load_from_memory(&request.bytes) {
                Ok(img) => Some(img),
                Err(e) => {
                    warn!(error = %e, "Image payload could not be decoded");
                    None
                }
            },
            DocumentKind::Pdf => {
                let page = request.pages.map_or(1, |r| r.first);
                embedded_page_image(&request.bytes, page)
            }
            DocumentKind::Empty | DocumentKind::Unknown => None,
        }
    }

    fn scan_image(&self, request: &ScanRequest, kind: DocumentKind, page: &DynamicImage) -> ScanOutcome {
        let layout: LayoutProfile = self.config.layout(request.layout.as_deref());
        let page = geometry::normalize(page, &self.config.geometry);
        let rects = segment(page.width(), page.height(), &layout);
        let readings = read_zones(&page, &rects, self.recognizer.as_ref(), &self.config.ocr);

        let texts = ZoneTexts::from(readings.as_slice());
        let mut extraction = extract_from_zones(&texts, &self.registry);
        let validation = validate(&extraction);
        extraction.parse_method = determine_parse_method_needed(false, validation.score);
        info!(layout = %layout.id, zones = extraction.zones_extracted, "Zones read");

        ScanOutcome {
            id: request.id.clone(),
            kind,
            extraction,
            validation,
            zones: readings,
        }
    }

    fn empty_outcome(&self, request: &ScanRequest, kind: DocumentKind) -> ScanOutcome {
        let mut extraction = InvoiceExtractionResult::default();
        let validation = validate(&extraction);
        extraction.parse_method = determine_parse_method_needed(false, validation.score);
        ScanOutcome {
            id: request.id.clone(),
            kind,
            extraction,
            validation,
            zones: Vec::new(),
        }
    }

    fn log_outcome(&self, outcome: &ScanOutcome) {
        info!(
            score = outcome.validation.score,
            status = ?outcome.validation.status,
            method = ?outcome.extraction.parse_method,
            errors = outcome.validation.errors.len(),
            "Scan complete"
        );
    }

    /// Process many submissions, at most `max_in_flight` at a time.
    ///
    /// Each submission runs on its own thread; one still running after
    /// `timeout` is abandoned and reported as `TimedOut`. An abandoned scan
    /// keeps its slot until it really finishes, so a submission that cannot
    /// get a slot within `timeout` is also `TimedOut`. Results come back in
    /// input order.
    pub fn process_batch(&self, requests: Vec<ScanRequest>, max_in_flight: usize, timeout: Duration) -> Vec<BatchItem> {
        let total = requests.len();
        info!(total, max_in_flight, timeout_secs = timeout.as_secs_f64(), "Batch started");
        let slots = ScanSlots::new(max_in_flight);

        let items: Vec<BatchItem> = match rayon::ThreadPoolBuilder::new()
            .num_threads(max_in_flight.max(1))
            .build()
        {
            Ok(pool) => pool.install(|| {
                requests
                    .into_par_iter()
                    .map(|request| self.run_with_timeout(request, &slots, timeout))
                    .collect()
            }),
            Err(e) => {
                warn!(error = %e, "Cannot build worker pool; scanning sequentially");
                requests
                    .into_iter()
                    .map(|request| self.run_with_timeout(request, &slots, timeout))
                    .collect()
            }
        };

        let completed = items.iter().filter(|i| i.status == BatchStatus::Completed).count();
        info!(total, completed, "Batch finished");
        items
    }

    fn run_with_timeout(&self, request: ScanRequest, slots: &Arc<ScanSlots>, timeout: Duration) -> BatchItem {
        let id = request.id.clone();
        let Some(permit) = slots.acquire(timeout) else {
            warn!(id = %id, "No free scan slot; abandoned");
            return BatchItem {
                id,
                status: BatchStatus::TimedOut,
                outcome: None,
                error: Some(format!("No free scan slot within {:.1}s", timeout.as_secs_f64())),
            };
        };
        let (tx, rx) = mpsc::channel();
        let processor = self.clone();

        let spawned = thread::Builder::new()
            .name(format!("scan-{id}"))
            .spawn(move || {
                let _permit = permit;
                let outcome = processor.process(&request);
                // The receiver is gone when the caller gave up on us.
                let _ = tx.send(outcome);
            });
        if let Err(e) = spawned {
            return BatchItem {
                id,
                status: BatchStatus::Failed,
                outcome: None,
                error: Some(format!("Cannot start worker: {e}")),
            };
        }

        match rx.recv_timeout(timeout) {
            Ok(outcome) => BatchItem {
                id,
                status: BatchStatus::Completed,
                outcome: Some(outcome),
                error: None,
            },
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(id = %id, timeout_secs = timeout.as_secs_f64(), "Scan timed out; abandoned");
                BatchItem {
                    id,
                    status: BatchStatus::TimedOut,
                    outcome: None,
                    error: Some(format!("Timed out after {:.1}s", timeout.as_secs_f64())),
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                warn!(id = %id, "Scan worker aborted");
                BatchItem {
                    id,
                    status: BatchStatus::Failed,
                    outcome: None,
                    error: Some("Scan aborted".to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ParseMethod;
    use crate::ocr::{NoRecognizer, OcrParams, OcrResult};
    use crate::validate::ValidationStatus;
    use crate::zones::Zone;
    use image::{GrayImage, ImageFormat, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NATIVE: &str = "VIN 1C4RJFBG5SC123456\nE.P. 05662000 PDCO 06500000\nSOUS-TOTAL 60,100.00\n";

    struct ByZone;

    impl Recognizer for ByZone {
        fn name(&self) -> &str {
            "by-zone"
        }

        fn recognize(&self, _zone: &GrayImage, params: &OcrParams) -> Option<OcrResult> {
            let text = match params.zone {
                Zone::Vin => "VIN 2C3CDXBG9RH654321",
                Zone::Finance => "E.P. 05662000\nPDCO 06500000\nPREF 06010000",
                Zone::Options => "PW7 BLANC ECLATANT 66,770.00\nAHU ENSEMBLE ATTELAGE 876.00\nADE GROUPE ELECTRIQUE 1,295.00",
                Zone::Totals => "SOUS-TOTAL 60,100.00",
            };
            Some(OcrResult {
                text: text.to_string(),
                confidence: 0.8,
                engine_name: "by-zone".to_string(),
            })
        }
    }

    fn processor(recognizer: Arc<dyn Recognizer>) -> InvoiceProcessor {
        InvoiceProcessor::new(Arc::new(ProductCodeRegistry::builtin()), PipelineConfig::default(), recognizer)
    }

    fn png_page() -> Vec<u8> {
        let mut png = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 400, image::Rgb([255, 255, 255])))
            .write_to(&mut std::io::Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();
        png
    }

    #[test]
    fn test_supplied_native_text() {
        let p = processor(Arc::new(NoRecognizer));
        let outcome = p.process(&ScanRequest {
            id: "native".into(),
            native_text: Some(NATIVE.into()),
            ..Default::default()
        });
        assert_eq!(outcome.extraction.parse_method, ParseMethod::PdfNative);
        assert_eq!(outcome.extraction.vin.as_deref(), Some("1C4RJFBG5SC123456"));
        assert_eq!(outcome.validation.score, 80);
        assert!(outcome.zones.is_empty());
    }

    #[test]
    fn test_weak_text_layer_falls_back_to_ocr() {
        let p = processor(Arc::new(ByZone));
        let outcome = p.process(&ScanRequest {
            id: "weak".into(),
            bytes: png_page(),
            native_text: Some("illegible".into()),
            ..Default::default()
        });
        assert_eq!(outcome.kind, DocumentKind::Image);
        assert_eq!(outcome.extraction.vin.as_deref(), Some("2C3CDXBG9RH654321"));
        assert_eq!(outcome.extraction.zones_extracted, 4);
        assert_eq!(outcome.extraction.parse_method, ParseMethod::OcrZones);
        assert_eq!(outcome.validation.status, ValidationStatus::Valid);
        assert_eq!(outcome.zones.len(), 4);
    }

    #[test]
    fn test_weak_text_layer_kept_without_image() {
        let p = processor(Arc::new(ByZone));
        let outcome = p.process(&ScanRequest {
            id: "weak".into(),
            native_text: Some("illegible".into()),
            ..Default::default()
        });
        assert_eq!(outcome.extraction.parse_method, ParseMethod::AiFallbackRecommended);
        assert_eq!(outcome.validation.score, 0);
    }

    #[test]
    fn test_empty_payload() {
        let outcome = processor(Arc::new(ByZone)).process(&ScanRequest::default());
        assert_eq!(outcome.kind, DocumentKind::Empty);
        assert_eq!(outcome.extraction, InvoiceExtractionResult::default());
        assert_eq!(outcome.validation.status, ValidationStatus::Invalid);
        assert!(!outcome.validation.is_valid);
    }

    /// Sleeps on the VIN zone and records how many scans overlap.
    #[derive(Default)]
    struct Slow {
        active: AtomicUsize,
        peak: AtomicUsize,
        started: AtomicUsize,
    }

    impl Recognizer for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn recognize(&self, _zone: &GrayImage, params: &OcrParams) -> Option<OcrResult> {
            if params.zone != Zone::Vin {
                return None;
            }
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(400));
            self.active.fetch_sub(1, Ordering::SeqCst);
            None
        }
    }

    #[test]
    fn test_batch_cap_holds_after_timeouts() {
        let slow = Arc::new(Slow::default());
        let p = processor(slow.clone());
        let requests: Vec<ScanRequest> = (0..4)
            .map(|i| ScanRequest {
                id: format!("slow-{i}"),
                bytes: png_page(),
                ..Default::default()
            })
            .collect();

        let items = p.process_batch(requests, 1, Duration::from_millis(100));
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].status, BatchStatus::TimedOut);
        assert!(items.iter().all(|i| i.status == BatchStatus::TimedOut));

        // Let abandoned scans drain before reading the counters.
        while slow.active.load(Ordering::SeqCst) > 0 {
            thread::sleep(Duration::from_millis(50));
        }
        thread::sleep(Duration::from_millis(500));
        assert!(slow.started.load(Ordering::SeqCst) >= 1);
        assert_eq!(slow.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_slot_is_freed_when_permit_drops() {
        let slots = ScanSlots::new(1);
        let first = slots.acquire(Duration::from_millis(10));
        assert!(first.is_some());
        assert!(slots.acquire(Duration::from_millis(10)).is_none());
        drop(first);
        assert!(slots.acquire(Duration::from_millis(10)).is_some());
    }
}
