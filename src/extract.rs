use crate::ocr::ZoneTexts;
use crate::price;
use crate::registry::{extract_code_from_text, ProductCodeRegistry, VehicleDescription};
use crate::vin::{self, VinCheck};
use crate::zones::Zone;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::debug;

/// Longest option description kept.
const MAX_DESCRIPTION: usize = 80;

/// Tokens that label financial fields; never option codes.
const RESERVED_CODES: &[&str] = &[
    "EP", "PDCO", "PDC0", "PREF", "VIN", "GST", "TPS", "TVQ", "QST", "HST", "PST", "TAX", "TAXE",
    "MSRP", "TOTAL", "SUB", "SOUS", "HOLDBACK", "SUBTOTAL", "DATE", "PAGE",
];

/// How the extraction was (or should next be) obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMethod {
    PdfNative,
    OcrZones,
    OcrZonesLowConfidence,
    #[default]
    AiFallbackRecommended,
}

/// One factory option printed on the invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionLine {
    pub product_code: String,
    pub description: String,
    pub amount: u64,
}

/// Everything the extractor pulled off one invoice.
///
/// Every field is optional on its own; a miss on one never affects another.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InvoiceExtractionResult {
    pub vin: Option<String>,
    pub vin_valid: bool,
    pub vin_year: Option<u16>,
    pub vin_brand: Option<String>,
    pub model_code: Option<String>,
    pub code_found_in_registry: bool,
    pub vehicle: Option<VehicleDescription>,
    pub ep_cost: Option<u64>,
    pub pdco: Option<u64>,
    pub pref: Option<u64>,
    pub holdback: Option<u64>,
    pub subtotal: Option<f64>,
    pub invoice_total: Option<f64>,
    /// Invoice line order.
    pub options: Vec<OptionLine>,
    pub parse_method: ParseMethod,
    pub zones_extracted: usize,
}

// ── Entry points ─────────────────────────────────────────────────────────────

/// Native-PDF path: every field is searched in the full page text.
pub fn extract_from_text(text: &str, registry: &ProductCodeRegistry) -> InvoiceExtractionResult {
    let text = normalize_newlines(text);
    let mut result = InvoiceExtractionResult {
        parse_method: ParseMethod::PdfNative,
        ..Default::default()
    };

    apply_vin(&mut result, extract_vin(&text));
    apply_model_code(&mut result, extract_model_code(&text, &text), registry);
    result.ep_cost = extract_price(&text, ep_patterns());
    result.pdco = extract_price(&text, pdco_patterns());
    result.pref = extract_price(&text, pref_patterns());
    result.holdback = extract_price(&text, holdback_patterns());
    result.subtotal = extract_subtotal(&text);
    result.invoice_total = extract_total(&text);
    result.options = extract_options(&text);

    debug!(
        vin = ?result.vin,
        ep = ?result.ep_cost,
        pdco = ?result.pdco,
        options = result.options.len(),
        "Extracted from native text"
    );
    result
}

/// Scanned path: each field is read from the zone it is printed in, falling
/// back to the text of all zones where the layout is known to drift.
pub fn extract_from_zones(zones: &ZoneTexts, registry: &ProductCodeRegistry) -> InvoiceExtractionResult {
    let all = normalize_newlines(&zones.combined());
    let vin_zone = normalize_newlines(zones.get(Zone::Vin));
    let finance = normalize_newlines(zones.get(Zone::Finance));
    let options = normalize_newlines(zones.get(Zone::Options));
    let totals = normalize_newlines(zones.get(Zone::Totals));

    let mut result = InvoiceExtractionResult {
        parse_method: ParseMethod::OcrZones,
        zones_extracted: zones.non_empty(),
        ..Default::default()
    };

    apply_vin(&mut result, extract_vin(&vin_zone).or_else(|| extract_vin(&all)));
    apply_model_code(&mut result, extract_model_code(&vin_zone, &all), registry);

    let price_in = |patterns: &[Regex]| extract_price(&finance, patterns).or_else(|| extract_price(&all, patterns));
    result.ep_cost = price_in(ep_patterns());
    result.pdco = price_in(pdco_patterns());
    result.pref = price_in(pref_patterns());
    result.holdback = price_in(holdback_patterns());

    result.subtotal = extract_subtotal(&totals).or_else(|| extract_subtotal(&all));
    result.invoice_total = extract_total(&totals).or_else(|| extract_total(&all));
    result.options = extract_options(&options);

    debug!(
        zones = result.zones_extracted,
        vin = ?result.vin,
        ep = ?result.ep_cost,
        pdco = ?result.pdco,
        options = result.options.len(),
        "Extracted from zones"
    );
    result
}

fn apply_vin(result: &mut InvoiceExtractionResult, check: Option<VinCheck>) {
    if let Some(check) = check {
        result.vin_valid = check.valid;
        result.vin_year = vin::decode_year(&check.vin);
        result.vin_brand = vin::decode_brand(&check.vin).map(str::to_string);
        result.vin = Some(check.vin);
    }
}

fn apply_model_code(result: &mut InvoiceExtractionResult, code: Option<String>, registry: &ProductCodeRegistry) {
    if let Some(code) = code {
        result.code_found_in_registry = registry.lookup(&code).is_some();
        result.vehicle = registry.describe(&code);
        result.model_code = Some(code);
    }
}

fn normalize_newlines(text: &str) -> String {
    text.replace('\r', "")
}

// ── VIN ──────────────────────────────────────────────────────────────────────

fn grouped_vin_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b([A-Z0-9]{5})[- ]([A-Z0-9]{2})[- ]([A-Z0-9]{6,10})(?:[- ]([A-Z0-9]{1,8}))?\b")
            .expect("grouped VIN regex must compile")
    })
}

fn plain_vin_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Z0-9]{17}\b").expect("plain VIN regex must compile"))
}

/// Find the VIN in `text`.
///
/// FCA's grouped print (`1C4RJ-FB-G5SC123456`) is tried before plain
/// 17-character tokens. The first candidate that validates, possibly after
/// single-character correction, wins; otherwise the first candidate found is
/// returned unvalidated.
pub fn extract_vin(text: &str) -> Option<VinCheck> {
    let upper = text.to_ascii_uppercase();
    let mut candidates: Vec<String> = Vec::new();

    for caps in grouped_vin_re().captures_iter(&upper) {
        let joined: String = (1..=4)
            .filter_map(|i| caps.get(i))
            .map(|m| m.as_str())
            .collect();
        if joined.len() >= 17 {
            candidates.push(joined[..17].to_string());
        }
    }
    for m in plain_vin_re().find_iter(&upper) {
        candidates.push(m.as_str().to_string());
    }
    candidates.retain(|c| c.chars().any(|ch| ch.is_ascii_digit()));

    let mut first: Option<VinCheck> = None;
    for candidate in candidates {
        let check = vin::correct(&candidate);
        if check.valid {
            return Some(check);
        }
        first.get_or_insert(check);
    }
    first
}

// ── Packed prices ────────────────────────────────────────────────────────────

/// Label, optional `:`/`#`/`$`, then the packed amount.
fn price_re(label: &str) -> Regex {
    let pattern = format!(r"(?i){label}\s*[:#]?\s*\$?\s*([0-9][0-9,.]{{3,12}})");
    Regex::new(&pattern).expect("price label regex must compile")
}

fn ep_patterns() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [r"\bE\.P\.", r"\bE\.P\b", r"\bEP\b", r"\bEMPLOYEE\s+PRICE\b"]
            .into_iter()
            .map(price_re)
            .collect()
    })
}

fn pdco_patterns() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [r"\bP\.D\.C\.O\.?", r"\bPDCO\b", r"\bPDC0\b"]
            .into_iter()
            .map(price_re)
            .collect()
    })
}

fn pref_patterns() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [r"\bP\.REF\.?", r"\bPREF\b"].into_iter().map(price_re).collect()
    })
}

fn holdback_patterns() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [r"\bHOLD\s?BACK\b", r"\bH\.B\.", r"\bRETENUE\b"]
            .into_iter()
            .map(price_re)
            .collect()
    })
}

/// First label variant that matches wins; a value decoding to 0 is absent.
fn extract_price(text: &str, patterns: &[Regex]) -> Option<u64> {
    let raw = patterns
        .iter()
        .find_map(|re| re.captures(text).and_then(|c| c.get(1)))?;
    match price::decode(raw.as_str()) {
        0 => None,
        value => Some(value),
    }
}

// ── Decimal totals ───────────────────────────────────────────────────────────

const DECIMAL_AMOUNT: &str = r"([0-9]{1,3}(?:[, ][0-9]{3})+\.[0-9]{2}|[0-9]+\.[0-9]{2})";

fn subtotal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"(?i)\b(?:SUB|SOUS)[- ]?TOTAL\b.*?{DECIMAL_AMOUNT}"))
            .expect("subtotal regex must compile")
    })
}

fn total_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"(?i)(\b(?:SUB|SOUS)[- ]?)?\bTOTAL\b.*?{DECIMAL_AMOUNT}"))
            .expect("total regex must compile")
    })
}

fn parse_decimal(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| !matches!(c, ',' | ' ')).collect();
    let value: f64 = cleaned.parse().ok()?;
    Some((value * 100.0).round() / 100.0)
}

pub fn extract_subtotal(text: &str) -> Option<f64> {
    let caps = subtotal_re().captures(text)?;
    parse_decimal(caps.get(1)?.as_str())
}

/// Invoice total; "SUBTOTAL"/"SOUS-TOTAL" lines are skipped.
pub fn extract_total(text: &str) -> Option<f64> {
    total_re()
        .captures_iter(text)
        .filter(|caps| caps.get(1).is_none())
        .find_map(|caps| parse_decimal(caps.get(2)?.as_str()))
}

// ── Options ──────────────────────────────────────────────────────────────────

fn option_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^[ \t]*([A-Z0-9]{2,6})[ \t]+(.{5,50}?)[ \t]+(SANS FRAIS|NO CHARGE|N/C|[0-9]{1,3}(?:[, ][0-9]{3})+(?:\.[0-9]{2})?|[0-9]+(?:\.[0-9]{2})?)[ \t]*$",
        )
        .expect("option line regex must compile")
    })
}

/// Option lines in invoice order.
///
/// Best effort: one generic line shape serves every description, so odd
/// layouts can both miss and over-match lines. Never fails.
pub fn extract_options(text: &str) -> Vec<OptionLine> {
    let text = normalize_newlines(text);
    let mut options = Vec::new();
    for caps in option_re().captures_iter(&text) {
        let (Some(code), Some(desc), Some(amount)) = (caps.get(1), caps.get(2), caps.get(3)) else {
            continue;
        };
        let code = code.as_str();
        if RESERVED_CODES.contains(&code) {
            continue;
        }
        let Some(amount) = parse_option_amount(amount.as_str()) else {
            continue;
        };
        let description: String = desc.as_str().trim().chars().take(MAX_DESCRIPTION).collect();
        options.push(OptionLine {
            product_code: code.to_string(),
            description,
            amount,
        });
    }
    options
}

/// Dollar amounts (`66,770.00`) are truncated to whole dollars; a bare
/// digit run is FCA packed encoding. Only 5 to 8 digits are plausible.
fn parse_option_amount(raw: &str) -> Option<u64> {
    if matches!(raw, "SANS FRAIS" | "NO CHARGE" | "N/C") {
        return Some(0);
    }
    let digits = raw.chars().filter(char::is_ascii_digit).count();
    if !(5..=8).contains(&digits) {
        return None;
    }
    if raw.chars().all(|c| c.is_ascii_digit()) {
        return Some(price::decode(raw));
    }
    let dollars = raw.split('.').next().unwrap_or("");
    let dollars: String = dollars.chars().filter(char::is_ascii_digit).collect();
    dollars.parse().ok()
}

// ── Model code ───────────────────────────────────────────────────────────────

fn model_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bMOD[EÈ]LE?\b\s*[:#]?\s*([A-Z0-9]{6})\b").expect("model label regex must compile")
    })
}

/// Product code: an explicit "MODEL"/"MODÈLE" label first, then the
/// registry's brand patterns over `primary`, then over `fallback`.
pub fn extract_model_code(primary: &str, fallback: &str) -> Option<String> {
    let labelled = model_label_re()
        .captures_iter(primary)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_uppercase())
        .find(|code| code.chars().any(|c| c.is_ascii_digit()));
    labelled
        .or_else(|| extract_code_from_text(primary))
        .or_else(|| extract_code_from_text(fallback))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DescriptionSource;

    const NATIVE_INVOICE: &str = "\
FCA CANADA INC.      FACTURE / INVOICE
VIN 1C4RJ-FB-G5SC123456        MODELE: WLJH75
E.P. 05662000   PDCO 06500000   PREF 06010000
HOLDBACK 00185000
PW7   BLANC ECLATANT                 66,770.00
TXX8  SIEGES BAQUETS EN TISSU       SANS FRAIS
AHU   ENSEMBLE ATTELAGE REMORQUE        876.00
EP    COUT EMPLOYE                 05662000
SOUS-TOTAL                          60,100.00
TOTAL DE LA FACTURE                 63,250.55
";

    #[test]
    fn test_native_extraction() {
        let registry = ProductCodeRegistry::builtin();
        let r = extract_from_text(NATIVE_INVOICE, &registry);

        assert_eq!(r.vin.as_deref(), Some("1C4RJFBG5SC123456"));
        assert!(r.vin_valid);
        assert_eq!(r.vin_year, Some(2025));
        assert_eq!(r.vin_brand.as_deref(), Some("Jeep"));
        assert_eq!(r.model_code.as_deref(), Some("WLJH75"));
        assert!(r.code_found_in_registry);
        assert_eq!(r.ep_cost, Some(56620));
        assert_eq!(r.pdco, Some(65000));
        assert_eq!(r.pref, Some(60100));
        assert_eq!(r.holdback, Some(1850));
        assert_eq!(r.subtotal, Some(60100.0));
        assert_eq!(r.invoice_total, Some(63250.55));
        assert_eq!(r.parse_method, ParseMethod::PdfNative);
    }

    #[test]
    fn test_options_keep_invoice_order() {
        let options = extract_options(NATIVE_INVOICE);
        let codes: Vec<&str> = options.iter().map(|o| o.product_code.as_str()).collect();
        assert_eq!(codes, ["PW7", "TXX8", "AHU"]);
        assert_eq!(options[0].description, "BLANC ECLATANT");
        assert_eq!(options[0].amount, 66770);
        assert_eq!(options[1].amount, 0);
        assert_eq!(options[2].amount, 876);
    }

    #[test]
    fn test_reserved_tokens_are_not_options() {
        let text = "EP    EMPLOYEE PRICE    05662000\nPDCO  DEALER PRICE    06500000\nPREF  REFERENCE       06010000\n";
        assert!(extract_options(text).is_empty());
    }

    #[test]
    fn test_packed_option_amount() {
        let options = extract_options("ADE   GROUPE ELECTRIQUE     00129500\n");
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].amount, 1295);
    }

    #[test]
    fn test_options_never_panic_on_noise() {
        assert!(extract_options("").is_empty());
        assert!(extract_options("\r\n\t §§§ 12 \n AA 1\n").is_empty());
    }

    #[test]
    fn test_price_label_variants() {
        assert_eq!(extract_price("E.P 05662000", ep_patterns()), Some(56620));
        assert_eq!(extract_price("ep: $05662000", ep_patterns()), Some(56620));
        assert_eq!(extract_price("P.D.C.O. 06500000", pdco_patterns()), Some(65000));
        assert_eq!(extract_price("PDC0 06500000", pdco_patterns()), Some(65000));
        assert_eq!(extract_price("P.REF 06010000", pref_patterns()), Some(60100));
        assert_eq!(extract_price("RETENUE 00185000", holdback_patterns()), Some(1850));
        assert_eq!(extract_price("EP 00000000", ep_patterns()), None);
        assert_eq!(extract_price("nothing here", ep_patterns()), None);
    }

    #[test]
    fn test_total_skips_subtotal() {
        assert_eq!(extract_total("SUBTOTAL 1,000.00\nTOTAL 1,130.00"), Some(1130.0));
        assert_eq!(extract_total("SOUS-TOTAL 1 000.00"), None);
        assert_eq!(extract_subtotal("Sub Total: 59 999.99"), Some(59999.99));
    }

    #[test]
    fn test_vin_plain_and_corrected() {
        let check = extract_vin("NIV: 3C6UR5FL6TG1O0200").unwrap();
        assert_eq!(check.vin, "3C6UR5FL6TG100200");
        assert!(check.valid && check.corrected);

        let check = extract_vin("VIN 3C6UR5FL6TG1OO2OO").unwrap();
        assert!(!check.valid);
        assert!(extract_vin("NO VIN ON THIS PAGE").is_none());
    }

    #[test]
    fn test_vin_prefers_valid_candidate() {
        let check = extract_vin("REF ABCDEFGHJ12345678\nVIN 2C3CDXBG9RH654321").unwrap();
        assert_eq!(check.vin, "2C3CDXBG9RH654321");
    }

    #[test]
    fn test_model_code_sources() {
        assert_eq!(extract_model_code("Model: jtjl98", "").as_deref(), Some("JTJL98"));
        assert_eq!(extract_model_code("1C6SRFFT6RN123456 DT6H98", "").as_deref(), Some("DT6H98"));
        assert_eq!(extract_model_code("nothing", "CODE D28H92").as_deref(), Some("D28H92"));
        assert_eq!(extract_model_code("", ""), None);
    }

    #[test]
    fn test_zone_extraction_with_fallbacks() {
        let registry = ProductCodeRegistry::builtin();
        let zones = ZoneTexts::new()
            .with(Zone::Vin, "VIN 3C6UR5FL6TG100200  D28H92")
            .with(Zone::Finance, "E.P. 05662000\nPDCO 06500000")
            .with(Zone::Options, "PW7 BLANC ECLATANT 66,770.00\nAHU ENSEMBLE ATTELAGE 876.00")
            .with(Zone::Totals, "HOLDBACK 00185000");

        let r = extract_from_zones(&zones, &registry);
        assert_eq!(r.vin.as_deref(), Some("3C6UR5FL6TG100200"));
        assert_eq!(r.vin_brand.as_deref(), Some("Ram"));
        assert_eq!(r.model_code.as_deref(), Some("D28H92"));
        assert_eq!(r.vehicle.as_ref().map(|v| v.source), Some(DescriptionSource::Registry));
        assert_eq!(r.ep_cost, Some(56620));
        assert_eq!(r.pdco, Some(65000));
        // Holdback misplaced into the totals zone is still found via all text.
        assert_eq!(r.holdback, Some(1850));
        assert_eq!(r.subtotal, None);
        assert_eq!(r.options.len(), 2);
        assert_eq!(r.zones_extracted, 4);
        assert_eq!(r.parse_method, ParseMethod::OcrZones);
    }
}
