#[cfg(feature = "tesseract")]
pub mod tesseract;

use crate::config::OcrSettings;
use crate::zones::{Zone, ZoneRect};
use base64::Engine;
use image::{codecs::png::PngEncoder, DynamicImage, GrayImage, ImageEncoder};
use imageproc::contrast::adaptive_threshold;
use imageproc::map::map_subpixels;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

// ── Public types ─────────────────────────────────────────────────────────────

/// Layout analysis hint handed to the recognizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSegMode {
    Auto,
    SingleColumn,
    /// A single uniform block of text.
    #[default]
    SingleBlock,
    SingleLine,
    SparseText,
}

/// Per-call recognition parameters.
#[derive(Debug, Clone)]
pub struct OcrParams {
    pub zone: Zone,
    pub languages: Vec<String>,
    pub page_seg_mode: PageSegMode,
}

/// Result produced by a `Recognizer` for one zone.
#[derive(Debug, Clone, Default)]
pub struct OcrResult {
    pub text: String,
    pub confidence: f64, // 0.0 – 1.0
    pub engine_name: String,
}

/// Every OCR backend implements this.
///
/// `recognize` receives the zone already binarized. Returning `None` means
/// "nothing usable"; the engine turns that into an empty zone.
pub trait Recognizer: Send + Sync {
    fn name(&self) -> &str;
    fn recognize(&self, zone: &GrayImage, params: &OcrParams) -> Option<OcrResult>;
}

/// Stand-in used when the binary is built without an OCR backend.
/// Every zone reads as empty, so scanned documents score as unusable.
pub struct NoRecognizer;

impl Recognizer for NoRecognizer {
    fn name(&self) -> &str {
        "none"
    }

    fn recognize(&self, _zone: &GrayImage, _params: &OcrParams) -> Option<OcrResult> {
        None
    }
}

/// What one zone yielded.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneReading {
    pub zone: Zone,
    pub text: String,
    pub confidence: f64,
    pub engine_name: String,
    /// base64 PNG of exactly what the recognizer saw (only when requested).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub preview_b64: String,
}

/// Zone text keyed by zone, as consumed by the field extractor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneTexts {
    texts: BTreeMap<Zone, String>,
}

impl ZoneTexts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, zone: Zone, text: impl Into<String>) -> Self {
        self.insert(zone, text);
        self
    }

    pub fn insert(&mut self, zone: Zone, text: impl Into<String>) {
        self.texts.insert(zone, text.into());
    }

    /// Text of `zone`, empty when it was not read.
    pub fn get(&self, zone: Zone) -> &str {
        self.texts.get(&zone).map(String::as_str).unwrap_or("")
    }

    /// All zones joined in page order, for fields that fall back to the full page.
    pub fn combined(&self) -> String {
        self.texts
            .values()
            .filter(|t| !t.trim().is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Zones that produced any text at all.
    pub fn non_empty(&self) -> usize {
        self.texts.values().filter(|t| !t.trim().is_empty()).count()
    }
}

impl From<&[ZoneReading]> for ZoneTexts {
    fn from(readings: &[ZoneReading]) -> Self {
        let mut texts = ZoneTexts::new();
        for r in readings {
            texts.insert(r.zone, r.text.clone());
        }
        texts
    }
}

// ── Orchestration ────────────────────────────────────────────────────────────

/// Read every zone of `page`, one after another.
pub fn read_zones(
    page: &DynamicImage,
    rects: &[ZoneRect],
    recognizer: &dyn Recognizer,
    settings: &OcrSettings,
) -> Vec<ZoneReading> {
    rects
        .iter()
        .map(|rect| read_zone(page, rect, recognizer, settings))
        .collect()
}

/// Crop, preprocess and recognize a single zone.
///
/// Failures are contained here: a recognizer that returns nothing, or
/// aborts, yields an empty reading and the other zones carry on.
pub fn read_zone(
    page: &DynamicImage,
    rect: &ZoneRect,
    recognizer: &dyn Recognizer,
    settings: &OcrSettings,
) -> ZoneReading {
    let empty = |preview_b64: String| ZoneReading {
        zone: rect.zone,
        text: String::new(),
        confidence: 0.0,
        engine_name: recognizer.name().to_string(),
        preview_b64,
    };

    let x2 = rect.x.saturating_add(rect.width).min(page.width());
    let y2 = rect.y.saturating_add(rect.height).min(page.height());
    if x2 <= rect.x || y2 <= rect.y {
        return empty(String::new());
    }

    let crop = page.crop_imm(rect.x, rect.y, x2 - rect.x, y2 - rect.y);
    let prepared = preprocess_zone(&crop, settings);
    let preview = if settings.previews {
        encode_png(&prepared)
    } else {
        String::new()
    };

    let params = OcrParams {
        zone: rect.zone,
        languages: settings.languages.clone(),
        page_seg_mode: settings.page_seg_mode_for(rect.zone),
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| recognizer.recognize(&prepared, &params)));
    match outcome {
        Ok(Some(r)) => {
            debug!(
                zone = rect.zone.name(),
                engine = %r.engine_name,
                chars = r.text.len(),
                conf = r.confidence,
                "Zone recognized"
            );
            ZoneReading {
                zone: rect.zone,
                text: r.text.trim().to_string(),
                confidence: r.confidence,
                engine_name: r.engine_name,
                preview_b64: preview,
            }
        }
        Ok(None) => {
            debug!(zone = rect.zone.name(), "Zone yielded no text");
            empty(preview)
        }
        Err(_) => {
            warn!(zone = rect.zone.name(), engine = recognizer.name(), "Recognizer aborted; zone left empty");
            empty(preview)
        }
    }
}

// ── Preprocessing ────────────────────────────────────────────────────────────

/// Pipeline: grayscale → linear contrast boost → adaptive mean threshold.
pub fn preprocess_zone(crop: &DynamicImage, settings: &OcrSettings) -> GrayImage {
    let gray = boost_contrast(&crop.to_luma8(), settings.contrast_alpha, settings.contrast_beta);
    adaptive_threshold(&gray, settings.threshold_block_size / 2, settings.threshold_offset)
}

/// `p' = alpha * p + beta`, saturated to the u8 range.
pub fn boost_contrast(gray: &GrayImage, alpha: f32, beta: f32) -> GrayImage {
    map_subpixels(gray, |p: u8| (alpha * p as f32 + beta).round().clamp(0.0, 255.0) as u8)
}

fn encode_png(img: &GrayImage) -> String {
    let mut png = Vec::new();
    if PngEncoder::new(&mut png)
        .write_image(img.as_raw(), img.width(), img.height(), image::ExtendedColorType::L8)
        .is_ok()
    {
        base64::engine::general_purpose::STANDARD.encode(&png)
    } else {
        String::new()
    }
}

/// Map config language names onto Tesseract traineddata names.
pub fn build_lang(languages: &[String]) -> String {
    if languages.is_empty() {
        return "eng+fra".to_string();
    }
    languages
        .iter()
        .map(|l| match l.trim() {
            "en" | "eng" => "eng",
            "fr" | "fra" => "fra",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("+")
}
