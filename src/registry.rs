use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

/// Reference dataset compiled into the binary.
const BUILTIN_DATASET: &str = include_str!("../data/product_codes.json");

/// Two-letter prefixes used when a code is missing from the dataset.
/// Order matters: the first matching prefix wins.
const PREFIX_FALLBACKS: &[(&str, &str, &str)] = &[
    ("DJ", "Ram", "2500"),
    ("D2", "Ram", "3500"),
    ("D3", "Ram", "3500"),
    ("DT", "Ram", "1500"),
    ("DS", "Ram", "1500"),
    ("WL", "Jeep", "Grand Cherokee"),
    ("WS", "Jeep", "Wagoneer S"),
    ("JL", "Jeep", "Wrangler"),
    ("JT", "Jeep", "Gladiator"),
    ("MP", "Jeep", "Compass"),
    ("KM", "Jeep", "Cherokee"),
    ("WD", "Dodge", "Durango"),
    ("LD", "Dodge", "Durango"),
    ("LB", "Dodge", "Charger"),
    ("HN", "Dodge", "Hornet"),
    ("RU", "Chrysler", "Pacifica"),
    ("VF", "Ram", "ProMaster"),
];

/// One row of the product-code dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductCodeEntry {
    pub code: String,
    pub brand: String,
    pub model: String,
    #[serde(default)]
    pub trim: String,
    #[serde(default)]
    pub cab: String,
    #[serde(default)]
    pub drive: String,
    /// Only present in the extended dataset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_description: Option<String>,
}

/// Dataset files key entries by code, so the value carries no `code` field.
#[derive(Deserialize)]
struct DatasetRecord {
    brand: String,
    model: String,
    #[serde(default)]
    trim: String,
    #[serde(default)]
    cab: String,
    #[serde(default)]
    drive: String,
    #[serde(default)]
    year: Option<u16>,
    #[serde(default)]
    full_description: Option<String>,
}

/// Brand and model recovered from a code's prefix alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartialEntry {
    pub brand: &'static str,
    pub model: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptionSource {
    Registry,
    PrefixFallback,
}

/// What the pipeline knows about the vehicle behind a product code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleDescription {
    pub code: String,
    pub brand: String,
    pub model: String,
    pub trim: String,
    pub cab: String,
    pub drive: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_description: Option<String>,
    pub source: DescriptionSource,
}

/// Read-only product-code lookup table.
///
/// Built once and shared (behind an `Arc`) by every submission; there is no
/// write path after construction.
#[derive(Debug, Clone, Default)]
pub struct ProductCodeRegistry {
    entries: HashMap<String, ProductCodeEntry>,
}

impl ProductCodeRegistry {
    pub fn from_entries(entries: impl IntoIterator<Item = ProductCodeEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|mut e| {
                e.code = e.code.trim().to_ascii_uppercase();
                (e.code.clone(), e)
            })
            .collect();
        Self { entries }
    }

    /// Parse a dataset: a JSON object mapping code → `{brand, model, trim, cab, drive}`.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let records: HashMap<String, DatasetRecord> = serde_json::from_str(json)?;
        let mut entries = HashMap::with_capacity(records.len());
        for (code, r) in records {
            let code = code.trim().to_ascii_uppercase();
            if code.len() != 6 || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(Error::Registry(format!(
                    "product code {code:?} is not 6 alphanumeric characters"
                )));
            }
            let entry = ProductCodeEntry {
                code: code.clone(),
                brand: r.brand,
                model: r.model,
                trim: r.trim,
                cab: r.cab,
                drive: r.drive,
                year: r.year,
                full_description: r.full_description,
            };
            if entries.insert(code.clone(), entry).is_some() {
                return Err(Error::Registry(format!("duplicate product code {code}")));
            }
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let registry = Self::from_json_str(&text)?;
        tracing::info!(path = %path.display(), codes = registry.len(), "Product code registry loaded");
        Ok(registry)
    }

    /// The dataset shipped with the crate.
    pub fn builtin() -> Self {
        Self::from_json_str(BUILTIN_DATASET).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Built-in product code dataset is unreadable");
            Self::default()
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact, case-insensitive lookup. No fuzzy matching.
    pub fn lookup(&self, code: &str) -> Option<&ProductCodeEntry> {
        self.entries.get(&code.trim().to_ascii_uppercase())
    }

    /// Registry entry when known, otherwise whatever the prefix reveals.
    pub fn describe(&self, code: &str) -> Option<VehicleDescription> {
        if let Some(e) = self.lookup(code) {
            return Some(VehicleDescription {
                code: e.code.clone(),
                brand: e.brand.clone(),
                model: e.model.clone(),
                trim: e.trim.clone(),
                cab: e.cab.clone(),
                drive: e.drive.clone(),
                year: e.year,
                full_description: e.full_description.clone(),
                source: DescriptionSource::Registry,
            });
        }
        fallback_decode(code).map(|p| VehicleDescription {
            code: code.trim().to_ascii_uppercase(),
            brand: p.brand.to_string(),
            model: p.model.to_string(),
            trim: String::new(),
            cab: String::new(),
            drive: String::new(),
            year: None,
            full_description: None,
            source: DescriptionSource::PrefixFallback,
        })
    }
}

/// Classify an unknown code by its two-letter prefix (brand and model only).
pub fn fallback_decode(code: &str) -> Option<PartialEntry> {
    let code = code.trim().to_ascii_uppercase();
    PREFIX_FALLBACKS
        .iter()
        .find(|(prefix, _, _)| code.starts_with(*prefix))
        .map(|&(_, brand, model)| PartialEntry { brand, model })
}

static CODE_PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();

/// Brand-specific product-code shapes, most specific first.
fn code_patterns() -> &'static [(&'static str, Regex)] {
    CODE_PATTERNS.get_or_init(|| {
        [
            ("ram_3500", r"\bD2[0-9][A-Z0-9]{3}\b"),
            ("ram_3500_dually", r"\bD3[0-9][A-Z0-9]{3}\b"),
            ("ram_2500", r"\bDJ[0-9][A-Z0-9]{3}\b"),
            ("ram_1500", r"\bD[TS][0-9][A-Z0-9]{3}\b"),
            ("jeep", r"\b(?:WL|WS|JL|JT|MP|KM)[A-Z0-9]{2}[0-9]{2}\b"),
            ("dodge", r"\b(?:WD|LD|LB|HN)[A-Z0-9]{2}[0-9]{2}\b"),
            ("chrysler", r"\bRU[A-Z0-9]{2}[0-9]{2}\b"),
            ("promaster", r"\bVF[A-Z0-9]{2}[0-9]{2}\b"),
            ("generic", r"\b[A-Z]{2}[A-Z0-9]{2}[0-9]{2}\b"),
        ]
        .into_iter()
        .map(|(name, pattern)| {
            (name, Regex::new(pattern).expect("product code regex must compile"))
        })
        .collect()
    })
}

/// Find a product code in free text (typically the VIN zone's OCR output).
pub fn extract_code_from_text(text: &str) -> Option<String> {
    let upper = text.to_ascii_uppercase();
    for (name, re) in code_patterns() {
        if let Some(m) = re.find(&upper) {
            if m.as_str().len() == 6 {
                tracing::debug!(pattern = name, code = m.as_str(), "Product code found in text");
                return Some(m.as_str().to_string());
            }
        }
    }
    None
}
