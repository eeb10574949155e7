use crate::extract::{InvoiceExtractionResult, ParseMethod};
use serde::{Deserialize, Serialize};

/// Largest plausible gap between dealer price and employee price.
const MAX_PDCO_EP_GAP: u64 = 15_000;
/// New-vehicle PDCO plausibility window.
const PDCO_RANGE: std::ops::RangeInclusive<u64> = 30_000..=150_000;
/// Allowed drift between the computed subtotal and PREF, in dollars.
const SUBTOTAL_PREF_TOLERANCE: f64 = 50.0;

const VALID_THRESHOLD: u8 = 70;
const REVIEW_THRESHOLD: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    Review,
    Invalid,
}

impl ValidationStatus {
    pub fn from_score(score: u8) -> Self {
        if score >= VALID_THRESHOLD {
            ValidationStatus::Valid
        } else if score >= REVIEW_THRESHOLD {
            ValidationStatus::Review
        } else {
            ValidationStatus::Invalid
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub score: u8,
    pub status: ValidationStatus,
    /// Blocking problems.
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Rules that passed.
    pub checks: Vec<String>,
    pub is_valid: bool,
}

/// Score an extraction against the invoice business rules.
///
/// Every rule is evaluated on its own. `is_valid` needs more than a good
/// score: no errors, a VIN, and a non-zero EP.
pub fn validate(r: &InvoiceExtractionResult) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut checks = Vec::new();
    let mut score: u32 = 0;

    match (&r.vin, r.vin_valid) {
        (Some(vin), true) => {
            score += 25;
            checks.push(format!("VIN {vin} checksum valid"));
        }
        (Some(vin), false) => {
            score += 15;
            warnings.push(format!("VIN {vin} fails checksum"));
        }
        (None, _) => errors.push("VIN not found".to_string()),
    }

    let ep = r.ep_cost.filter(|&v| v > 0);
    match ep {
        Some(v) => {
            score += 15;
            checks.push(format!("EP present ({v})"));
        }
        None => errors.push("EP missing or zero".to_string()),
    }

    if let Some(pdco) = r.pdco {
        score += 15;
        if PDCO_RANGE.contains(&pdco) {
            checks.push(format!("PDCO {pdco} within plausible range"));
        } else {
            warnings.push(format!(
                "PDCO {pdco} outside plausible range {}-{}",
                PDCO_RANGE.start(),
                PDCO_RANGE.end()
            ));
        }
    }

    if let (Some(ep), Some(pdco)) = (ep, r.pdco) {
        if ep < pdco {
            score += 15;
            checks.push("EP below PDCO".to_string());
            let gap = pdco - ep;
            if gap <= MAX_PDCO_EP_GAP {
                checks.push(format!("PDCO-EP gap {gap} within {MAX_PDCO_EP_GAP}"));
            } else {
                errors.push(format!("PDCO-EP gap {gap} exceeds {MAX_PDCO_EP_GAP}"));
            }
        } else {
            errors.push(format!("EP ({ep}) must be below PDCO ({pdco})"));
        }
    }

    if let Some(subtotal) = r.subtotal {
        score += 10;
        if let Some(pref) = r.pref {
            let diff = (subtotal - pref as f64).abs();
            if diff <= SUBTOTAL_PREF_TOLERANCE {
                checks.push("Subtotal matches PREF".to_string());
            } else {
                warnings.push(format!("Subtotal {subtotal:.2} differs from PREF {pref} by {diff:.2}"));
            }
        }
        if let Some(ep) = ep {
            if ep as f64 > subtotal {
                warnings.push(format!("EP ({ep}) exceeds subtotal ({subtotal:.2})"));
            }
        }
    }

    match r.options.len() {
        n if n >= 5 => {
            score += 10;
            checks.push(format!("{n} options found"));
        }
        n if n >= 3 => {
            score += 5;
            checks.push(format!("{n} options found (partial)"));
        }
        n => warnings.push(format!("Only {n} options found")),
    }

    if r.model_code.is_some() {
        score += 5;
        checks.push("Model code present".to_string());
    }
    if r.holdback.is_some() {
        score += 5;
        checks.push("Holdback present".to_string());
    }

    let score = score.min(100) as u8;
    let is_valid = errors.is_empty() && r.vin.is_some() && ep.is_some();
    ValidationResult {
        score,
        status: ValidationStatus::from_score(score),
        errors,
        warnings,
        checks,
        is_valid,
    }
}

/// Decide how the invoice should be (or should have been) parsed.
pub fn determine_parse_method_needed(native_ok: bool, score: u8) -> ParseMethod {
    if native_ok {
        ParseMethod::PdfNative
    } else if score >= VALID_THRESHOLD {
        ParseMethod::OcrZones
    } else if score >= REVIEW_THRESHOLD {
        ParseMethod::OcrZonesLowConfidence
    } else {
        ParseMethod::AiFallbackRecommended
    }
}
